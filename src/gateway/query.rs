use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres_types::{Field, FromSql, Kind, Type};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::net::IpAddr;
use tokio_postgres::{Client, Row};
use uuid::Uuid;

use crate::gateway::error::GatewayError;

/// Tabular result of a statement. Rows keep the order the server sent them in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
        }
    }
}

/// Runs `statement` as given and materializes the whole result set.
pub async fn execute(client: &Client, statement: &str) -> Result<QueryResult, GatewayError> {
    // Preparing first yields the column names even when no row comes back.
    let prepared = client.prepare(statement).await?;
    let columns = prepared
        .columns()
        .iter()
        .map(|column| column.name().to_string())
        .collect();

    let rows = client.query(&prepared, &[]).await?;
    let rows = rows.iter().map(row_values).collect::<Result<Vec<_>, _>>()?;

    Ok(QueryResult::new(columns, rows))
}

/// Runs `statement` inside a transaction and commits it. On any failure the
/// transaction is dropped uncommitted, which rolls it back.
pub async fn execute_and_commit(client: &mut Client, statement: &str) -> Result<(), GatewayError> {
    let transaction = client.transaction().await?;
    transaction.batch_execute(statement).await?;
    transaction.commit().await?;
    Ok(())
}

fn row_values(row: &Row) -> Result<Vec<Value>, GatewayError> {
    (0..row.len())
        .map(|idx| {
            row.try_get::<_, Option<SqlValue>>(idx)
                .map(|value| value.map_or(Value::Null, |v| v.0))
                .map_err(|e| GatewayError::Query(format!("column {}: {}", idx, e)))
        })
        .collect()
}

/// Any non-null column value, decoded into JSON.
struct SqlValue(Value);

impl<'a> FromSql<'a> for SqlValue {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        Ok(SqlValue(decode(ty, raw)))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

fn decode(ty: &Type, raw: &[u8]) -> Value {
    decode_typed(ty, raw).unwrap_or_else(|_| hex(raw))
}

type DecodeError = Box<dyn Error + Sync + Send>;

fn decode_typed(ty: &Type, raw: &[u8]) -> Result<Value, DecodeError> {
    let value = match *ty {
        Type::BOOL => Value::Bool(bool::from_sql(ty, raw)?),
        Type::CHAR => Value::String(char::from(i8::from_sql(ty, raw)? as u8).to_string()),
        Type::INT2 => Value::from(i16::from_sql(ty, raw)?),
        Type::INT4 => Value::from(i32::from_sql(ty, raw)?),
        Type::INT8 => Value::from(i64::from_sql(ty, raw)?),
        Type::OID => Value::from(u32::from_sql(ty, raw)?),
        Type::FLOAT4 => float(f64::from(f32::from_sql(ty, raw)?)),
        Type::FLOAT8 => float(f64::from_sql(ty, raw)?),
        // Text keeps every digit.
        Type::NUMERIC => Value::String(numeric(raw)?),
        Type::MONEY => Value::String(money(raw)?),
        Type::JSON | Type::JSONB => Value::from_sql(ty, raw)?,
        Type::XML => Value::String(std::str::from_utf8(raw)?.to_string()),
        Type::BYTEA => hex(raw),
        Type::DATE => match Wire(raw).i32()? {
            i32::MAX => Value::from("infinity"),
            i32::MIN => Value::from("-infinity"),
            _ => Value::String(NaiveDate::from_sql(ty, raw)?.to_string()),
        },
        Type::TIME => Value::String(NaiveTime::from_sql(ty, raw)?.to_string()),
        Type::TIMETZ => Value::String(timetz(raw)?),
        Type::TIMESTAMP | Type::TIMESTAMPTZ => match Wire(raw).i64()? {
            i64::MAX => Value::from("infinity"),
            i64::MIN => Value::from("-infinity"),
            _ if *ty == Type::TIMESTAMP => Value::String(
                NaiveDateTime::from_sql(ty, raw)?
                    .format("%Y-%m-%dT%H:%M:%S%.f")
                    .to_string(),
            ),
            _ => Value::String(DateTime::<Utc>::from_sql(ty, raw)?.to_rfc3339()),
        },
        Type::INTERVAL => Value::String(interval(raw)?),
        Type::INET => Value::String(inet(raw, false)?),
        Type::CIDR => Value::String(inet(raw, true)?),
        Type::MACADDR => Value::String(macaddr(raw)?),
        Type::UUID => Value::String(Uuid::from_sql(ty, raw)?.to_string()),
        _ => match ty.kind() {
            Kind::Array(_) => {
                let items = Vec::<Option<SqlValue>>::from_sql(ty, raw)?;
                Value::Array(
                    items
                        .into_iter()
                        .map(|item| item.map_or(Value::Null, |v| v.0))
                        .collect(),
                )
            }
            Kind::Domain(base) => decode(base, raw),
            Kind::Composite(fields) => composite(fields, raw)?,
            Kind::Enum(_) => Value::String(std::str::from_utf8(raw)?.to_string()),
            _ if <String as FromSql>::accepts(ty) => Value::String(String::from_sql(ty, raw)?),
            _ => hex(raw),
        },
    };
    Ok(value)
}

fn float(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(value.to_string()))
}

/// `\x`-prefixed hex, the way the server prints bytea.
fn hex(raw: &[u8]) -> Value {
    let hex: String = raw.iter().map(|b| format!("{:02x}", b)).collect();
    Value::String(format!("\\x{}", hex))
}

/// Big-endian reader over a binary column value.
struct Wire<'a>(&'a [u8]);

impl<'a> Wire<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.0.len() < len {
            return Err("value is truncated".into());
        }
        let (head, rest) = self.0.split_at(len);
        self.0 = rest;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn i16(&mut self) -> Result<i16, DecodeError> {
        Ok(i16::from_be_bytes(self.take(2)?.try_into()?))
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into()?))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into()?))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into()?))
    }

    fn finish(&self) -> Result<(), DecodeError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err("trailing bytes after value".into())
        }
    }
}

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Base-10000 digits to decimal text, padded to the display scale.
fn numeric(raw: &[u8]) -> Result<String, DecodeError> {
    let mut wire = Wire(raw);
    let ndigits = wire.i16()?;
    let weight = i32::from(wire.i16()?);
    let sign = wire.u16()?;
    let dscale = usize::from(wire.u16()?);
    let digits = (0..ndigits.max(0))
        .map(|_| wire.i16())
        .collect::<Result<Vec<_>, _>>()?;
    wire.finish()?;

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        NUMERIC_POS | NUMERIC_NEG => {}
        other => return Err(format!("invalid numeric sign {:#06x}", other).into()),
    }
    if digits.iter().any(|d| !(0..10000).contains(d)) {
        return Err("numeric digit out of range".into());
    }

    let digit = |idx: i32| {
        usize::try_from(idx)
            .ok()
            .and_then(|idx| digits.get(idx).copied())
            .unwrap_or(0)
    };

    let mut text = String::new();
    if sign == NUMERIC_NEG {
        text.push('-');
    }
    if weight < 0 {
        text.push('0');
    } else {
        text.push_str(&digit(0).to_string());
        for idx in 1..=weight {
            text.push_str(&format!("{:04}", digit(idx)));
        }
    }
    if dscale > 0 {
        let mut fraction = String::new();
        let mut idx = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit(idx)));
            idx += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }
    Ok(text)
}

/// Cents as a plain decimal; the currency symbol depends on the server locale.
fn money(raw: &[u8]) -> Result<String, DecodeError> {
    let mut wire = Wire(raw);
    let cents = wire.i64()?;
    wire.finish()?;
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    Ok(format!("{}{}.{:02}", sign, abs / 100, abs % 100))
}

/// `[-]HH:MM:SS[.ffffff]` with trailing fraction zeros dropped.
fn clock(micros: i64) -> String {
    let sign = if micros < 0 { "-" } else { "" };
    let abs = micros.unsigned_abs();
    let (secs, fraction) = (abs / 1_000_000, abs % 1_000_000);
    let mut text = format!(
        "{}{:02}:{:02}:{:02}",
        sign,
        secs / 3600,
        secs / 60 % 60,
        secs % 60
    );
    if fraction != 0 {
        text.push_str(format!(".{:06}", fraction).trim_end_matches('0'));
    }
    text
}

/// Interval in the server's default output style, e.g. `1 year 2 mons 3 days 04:05:06`.
fn interval(raw: &[u8]) -> Result<String, DecodeError> {
    let mut wire = Wire(raw);
    let micros = wire.i64()?;
    let days = wire.i32()?;
    let months = wire.i32()?;
    wire.finish()?;

    let mut parts = Vec::new();
    for (count, unit) in [(months / 12, "year"), (months % 12, "mon"), (days, "day")] {
        if count != 0 {
            let plural = if count == 1 { "" } else { "s" };
            parts.push(format!("{} {}{}", count, unit, plural));
        }
    }
    if micros != 0 || parts.is_empty() {
        parts.push(clock(micros));
    }
    Ok(parts.join(" "))
}

fn timetz(raw: &[u8]) -> Result<String, DecodeError> {
    let mut wire = Wire(raw);
    let micros = wire.i64()?;
    // Seconds west of UTC.
    let zone = wire.i32()?;
    wire.finish()?;

    let east = -i64::from(zone);
    let abs = east.unsigned_abs();
    let mut text = clock(micros);
    text.push(if east < 0 { '-' } else { '+' });
    text.push_str(&format!("{:02}", abs / 3600));
    if abs % 3600 != 0 {
        text.push_str(&format!(":{:02}", abs / 60 % 60));
    }
    if abs % 60 != 0 {
        text.push_str(&format!(":{:02}", abs % 60));
    }
    Ok(text)
}

const PGSQL_AF_INET: u8 = 2;
const PGSQL_AF_INET6: u8 = 3;

/// Address with its prefix length. `inet` omits a full-length prefix, `cidr` never does.
fn inet(raw: &[u8], always_prefix: bool) -> Result<String, DecodeError> {
    let mut wire = Wire(raw);
    let family = wire.u8()?;
    let bits = wire.u8()?;
    let _is_cidr = wire.u8()?;
    let len = usize::from(wire.u8()?);
    let addr = wire.take(len)?;
    wire.finish()?;

    let (ip, full) = match family {
        PGSQL_AF_INET => (IpAddr::from(<[u8; 4]>::try_from(addr)?), 32),
        PGSQL_AF_INET6 => (IpAddr::from(<[u8; 16]>::try_from(addr)?), 128),
        other => return Err(format!("unknown address family {}", other).into()),
    };
    if always_prefix || bits != full {
        Ok(format!("{}/{}", ip, bits))
    } else {
        Ok(ip.to_string())
    }
}

fn macaddr(raw: &[u8]) -> Result<String, DecodeError> {
    if raw.len() != 6 {
        return Err("macaddr is six bytes".into());
    }
    Ok(raw
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":"))
}

/// Row value as an object keyed by field name.
fn composite(fields: &[Field], raw: &[u8]) -> Result<Value, DecodeError> {
    let mut wire = Wire(raw);
    let count = wire.i32()?;
    if usize::try_from(count).ok() != Some(fields.len()) {
        return Err("composite field count mismatch".into());
    }

    let mut object = serde_json::Map::new();
    for field in fields {
        let _oid = wire.u32()?;
        let len = wire.i32()?;
        let value = match usize::try_from(len) {
            Ok(len) => decode(field.type_(), wire.take(len)?),
            Err(_) => Value::Null,
        };
        object.insert(field.name().to_string(), value);
    }
    wire.finish()?;
    Ok(Value::Object(object))
}
