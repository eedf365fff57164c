use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

use crate::config::types::{LogFormat, LoggingSettings};

/// Installs the global subscriber. Everything goes to stderr; stdout belongs
/// to the protocol.
pub fn init(settings: &LoggingSettings) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .map_err(|e| anyhow::anyhow!("invalid log level '{}': {}", settings.level, e))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false);

    let installed = match settings.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install log subscriber: {}", e))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub timestamp: String,
    pub level: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// JSON-lines record of every request and its outcome.
pub struct RequestLog {
    file: Option<Mutex<File>>,
    enabled: bool,
}

impl RequestLog {
    pub fn disabled() -> Self {
        Self {
            file: None,
            enabled: false,
        }
    }

    pub fn new(settings: &LoggingSettings) -> io::Result<Self> {
        let file = match &settings.request_log {
            Some(path) => Some(Mutex::new(open_append(path)?)),
            None => None,
        };
        Ok(Self {
            file,
            enabled: settings.log_requests,
        })
    }

    pub fn request_start(&self, id: &str, method: &str, tool: Option<&str>) {
        if !self.enabled {
            return;
        }
        tracing::debug!(request_id = id, method, tool, "request started");
        self.write(RequestLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: "INFO".to_string(),
            message: "Request started".to_string(),
            request_id: Some(id.to_string()),
            method: Some(method.to_string()),
            tool: tool.map(String::from),
            error_code: None,
            details: None,
            duration_ms: None,
        });
    }

    pub fn request_end(
        &self,
        id: &str,
        method: &str,
        tool: Option<&str>,
        error: Option<(i32, &str)>,
        duration_ms: u64,
    ) {
        if !self.enabled {
            return;
        }
        match error {
            None => tracing::info!(request_id = id, method, tool, duration_ms, "request succeeded"),
            Some((code, message)) => tracing::warn!(
                request_id = id,
                method,
                tool,
                code,
                duration_ms,
                "request failed: {}",
                message
            ),
        }
        self.write(RequestLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: if error.is_none() { "INFO" } else { "ERROR" }.to_string(),
            message: if error.is_none() {
                "Request succeeded"
            } else {
                "Request failed"
            }
            .to_string(),
            request_id: Some(id.to_string()),
            method: Some(method.to_string()),
            tool: tool.map(String::from),
            error_code: error.map(|(code, _)| code),
            details: error.map(|(_, message)| message.to_string()),
            duration_ms: Some(duration_ms),
        });
    }

    fn write(&self, entry: RequestLogEntry) {
        let Some(file) = &self.file else { return };
        let Ok(json) = serde_json::to_string(&entry) else { return };
        if let Ok(mut file) = file.lock() {
            if let Err(e) = writeln!(file, "{}", json) {
                tracing::warn!("failed to write request log: {}", e);
            }
        }
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}
