use crate::gateway::error::GatewayError;

const READ_KEYWORD: &str = "select";

/// Rejects statements that do not start with `SELECT`.
///
/// This is a prefix check, not a parser: `SELECT` calling a function with
/// side effects, or `SELECT ... INTO`, passes it. Database permissions
/// remain the actual boundary.
pub fn ensure_read_only(statement: &str) -> Result<(), GatewayError> {
    let normalized = statement.trim().to_lowercase();
    if normalized.starts_with(READ_KEYWORD) {
        Ok(())
    } else {
        Err(GatewayError::Validation(
            "only SELECT statements can be run with query_data".to_string(),
        ))
    }
}
