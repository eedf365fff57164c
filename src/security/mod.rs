use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as Governor};
use jsonschema::JSONSchema;
use serde_json::Value;
use std::collections::HashMap;
use std::num::NonZeroU32;

use crate::config::types::{RateLimitSettings, ToolSettings};
use crate::protocol::error::McpError;
use crate::protocol::types::Tool;

/// Process-wide request limiter. A single stdio client means a single key.
pub struct RateLimiter {
    governor: Option<DefaultDirectRateLimiter>,
}

impl RateLimiter {
    pub fn new(settings: &RateLimitSettings) -> Self {
        let governor = if settings.enabled {
            let per_minute = NonZeroU32::new(settings.requests_per_minute).unwrap_or(NonZeroU32::MIN);
            let burst = NonZeroU32::new(settings.burst).unwrap_or(NonZeroU32::MIN);
            Some(Governor::direct(Quota::per_minute(per_minute).allow_burst(burst)))
        } else {
            None
        };

        Self { governor }
    }

    pub fn check(&self) -> Result<(), McpError> {
        match &self.governor {
            Some(governor) => governor.check().map_err(|_| McpError::RateLimitExceeded),
            None => Ok(()),
        }
    }
}

/// Allow/deny lists for tools plus argument validation against each tool's
/// input schema.
pub struct SecurityValidator {
    settings: ToolSettings,
    schemas: HashMap<String, JSONSchema>,
}

impl SecurityValidator {
    pub fn new(settings: &ToolSettings) -> Self {
        Self {
            settings: settings.clone(),
            schemas: HashMap::new(),
        }
    }

    /// Compiles the input schema of `tool`. A schema that does not compile is
    /// a programming error surfaced at startup.
    pub fn register_schema(&mut self, tool: &Tool) -> Result<(), McpError> {
        let compiled = JSONSchema::compile(&tool.input_schema).map_err(|e| {
            McpError::InternalError(format!("invalid input schema for '{}': {}", tool.name, e))
        })?;
        self.schemas.insert(tool.name.clone(), compiled);
        Ok(())
    }

    pub fn is_tool_permitted(&self, name: &str) -> bool {
        if self.settings.denied.contains(name) {
            return false;
        }
        match &self.settings.allowed {
            Some(allowed) => allowed.contains(name),
            None => true,
        }
    }

    pub fn validate_tool(&self, name: &str, arguments: &Value) -> Result<(), McpError> {
        if !self.is_tool_permitted(name) {
            return Err(McpError::OperationNotPermitted(format!(
                "Tool '{}' is disabled by configuration",
                name
            )));
        }

        if let Some(schema) = self.schemas.get(name) {
            if let Err(errors) = schema.validate(arguments) {
                let reasons: Vec<String> = errors
                    .map(|e| {
                        let path = e.instance_path.to_string();
                        if path.is_empty() {
                            e.to_string()
                        } else {
                            format!("{}: {}", path, e)
                        }
                    })
                    .collect();
                return Err(McpError::InvalidParams(format!(
                    "Invalid arguments for '{}': {}",
                    name,
                    reasons.join("; ")
                )));
            }
        }

        Ok(())
    }
}
