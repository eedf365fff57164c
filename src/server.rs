use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::config::types::ServerConfig;
use crate::gateway::error::GatewayError;
use crate::gateway::Gateway;
use crate::logging::RequestLog;
use crate::protocol::error::McpError;
use crate::protocol::types::{
    CallToolRequest, CallToolResult, ImplementationInfo, InitializeResult, JsonRpcId, JsonRpcRequest,
    JsonRpcResponse, ListResourcesResult, ListToolsResult, ReadResourceRequest, ReadResourceResult,
    Resource, ResourceContent, ResourcesCapability, ServerCapabilities, Tool, ToolsCapability,
    PROTOCOL_VERSION,
};
use crate::security::{RateLimiter, SecurityValidator};

pub const WRITE_TOOLS: [&str; 3] = ["update_values", "create_table", "drop_table"];

const JSON_MIME: &str = "application/json";

fn tool(name: &str, description: &str, input_schema: Value) -> Tool {
    Tool {
        name: name.to_string(),
        description: Some(description.to_string()),
        input_schema,
    }
}

fn statement_schema(statement_help: &str) -> Value {
    json!({
        "type": "object",
        "required": ["dbname", "statement"],
        "properties": {
            "dbname": {
                "type": "string",
                "description": "Name of the database to run the statement in"
            },
            "statement": {
                "type": "string",
                "description": statement_help
            }
        }
    })
}

/// Tools exposed to the host. Mutating tools only exist when `read_only` is off.
pub fn tool_catalog(read_only: bool) -> Vec<Tool> {
    let mut tools = vec![
        tool(
            "get_databases",
            "List the databases on the PostgreSQL server",
            json!({"type": "object", "properties": {}}),
        ),
        tool(
            "get_schemas",
            "List the tables and columns of the public schema of a database",
            json!({
                "type": "object",
                "required": ["database"],
                "properties": {
                    "database": {
                        "type": "string",
                        "description": "Name of the database"
                    }
                }
            }),
        ),
        tool(
            "query_data",
            "Run a read-only SELECT statement and return its rows",
            json!({
                "type": "object",
                "required": ["dbname"],
                "anyOf": [
                    {"required": ["statement"]},
                    {"required": ["s"]}
                ],
                "properties": {
                    "dbname": {
                        "type": "string",
                        "description": "Name of the database to query"
                    },
                    "statement": {
                        "type": "string",
                        "description": "SELECT statement to run"
                    },
                    "s": {
                        "type": "string",
                        "description": "Alias of statement"
                    }
                }
            }),
        ),
        tool(
            "get_server_config",
            "Show the configuration of the Azure Database for PostgreSQL flexible server (Microsoft Entra ID only)",
            json!({"type": "object", "properties": {}}),
        ),
        tool(
            "get_server_parameter",
            "Show the value of a server parameter (Microsoft Entra ID only)",
            json!({
                "type": "object",
                "required": ["parameter_name"],
                "properties": {
                    "parameter_name": {
                        "type": "string",
                        "description": "Name of the server parameter, e.g. max_connections"
                    }
                }
            }),
        ),
    ];

    if !read_only {
        tools.push(tool(
            "update_values",
            "Run an UPDATE or INSERT statement and commit it",
            statement_schema("Statement that changes rows"),
        ));
        tools.push(tool(
            "create_table",
            "Run a CREATE TABLE statement and commit it",
            statement_schema("CREATE TABLE statement"),
        ));
        tools.push(tool(
            "drop_table",
            "Run a DROP TABLE statement and commit it",
            statement_schema("DROP TABLE statement"),
        ));
    }

    tools
}

fn str_arg<'a>(arguments: &'a Map<String, Value>, name: &str) -> Result<&'a str, McpError> {
    arguments
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| McpError::InvalidParams(format!("Missing required argument '{}'", name)))
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, McpError> {
    serde_json::to_value(value).map_err(|e| McpError::InternalError(e.to_string()))
}

/// Read-path outcome: request-scoped failures are handed back as tool
/// content, everything else fails the call.
fn read_result<T: Serialize>(result: Result<T, GatewayError>) -> Result<CallToolResult, McpError> {
    match result {
        Ok(value) => Ok(CallToolResult::json(&to_json(&value)?)),
        Err(e) if e.is_request_scoped() => Ok(CallToolResult::error(&to_json(&e.envelope())?)),
        Err(e) => Err(e.into()),
    }
}

pub struct McpServer {
    config: ServerConfig,
    gateway: Arc<Gateway>,
    tools: HashMap<String, Tool>,
    resources: HashMap<String, Resource>,
    security_validator: SecurityValidator,
    rate_limiter: RateLimiter,
    request_log: RequestLog,
}

impl McpServer {
    pub fn new(config: ServerConfig, gateway: Arc<Gateway>, request_log: RequestLog) -> Result<Self, McpError> {
        let mut security_validator = SecurityValidator::new(&config.security.tools);
        let rate_limiter = RateLimiter::new(&config.security.rate_limiting);

        let mut tools = HashMap::new();
        for tool in tool_catalog(gateway.is_read_only()) {
            security_validator.register_schema(&tool)?;
            tools.insert(tool.name.clone(), tool);
        }

        let uri = gateway.databases_resource_uri(&config.azure.resource_scheme);
        let mut resources = HashMap::new();
        resources.insert(
            uri.clone(),
            Resource {
                uri,
                name: "Databases".to_string(),
                description: Some(format!(
                    "Databases on {}",
                    gateway.config().server_short_name()
                )),
                mime_type: Some(JSON_MIME.to_string()),
            },
        );

        Ok(Self {
            config,
            gateway,
            tools,
            resources,
            security_validator,
            rate_limiter,
            request_log,
        })
    }

    /// Handles one message. Notifications get no response.
    pub async fn process_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.is_notification() {
            debug!("Received notification {}", request.method);
            return None;
        }

        let started = Instant::now();
        let id = request.id.clone().unwrap_or_default();
        let id_str = id.to_string();
        let tool_name = request
            .params
            .as_ref()
            .filter(|_| request.method == "tools/call")
            .and_then(|params| params.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string);
        self.request_log
            .request_start(&id_str, &request.method, tool_name.as_deref());

        let response = match self.dispatch(request.method.as_str(), request.params).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => JsonRpcResponse::failure(id, e.to_json_rpc_error()),
        };

        let error = response.error.as_ref().map(|e| (e.code, e.message.as_str()));
        self.request_log.request_end(
            &id_str,
            &request.method,
            tool_name.as_deref(),
            error,
            started.elapsed().as_millis() as u64,
        );

        Some(response)
    }

    async fn dispatch(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.rate_limiter.check()?;

        match method {
            "initialize" => to_json(&self.handle_initialize()),
            "ping" => Ok(json!({})),
            "tools/list" => to_json(&self.handle_list_tools()),
            "tools/call" => {
                let request: CallToolRequest = parse_params(params)?;
                to_json(&self.handle_call_tool(request).await?)
            }
            "resources/list" => to_json(&self.handle_list_resources()),
            "resources/read" => {
                let request: ReadResourceRequest = parse_params(params)?;
                to_json(&self.handle_read_resource(request).await?)
            }
            _ => Err(McpError::MethodNotFound(format!("Method '{}' not found", method))),
        }
    }

    fn handle_initialize(&self) -> InitializeResult {
        InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: false }),
                resources: Some(ResourcesCapability {
                    subscribe: false,
                    list_changed: false,
                }),
            },
            server_info: ImplementationInfo {
                name: self.config.server.name.clone(),
                version: self.config.server.version.clone(),
            },
        }
    }

    fn handle_list_tools(&self) -> ListToolsResult {
        let mut tools: Vec<Tool> = self
            .tools
            .values()
            .filter(|tool| self.security_validator.is_tool_permitted(&tool.name))
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        ListToolsResult { tools }
    }

    async fn handle_call_tool(&self, request: CallToolRequest) -> Result<CallToolResult, McpError> {
        if !self.tools.contains_key(&request.name) {
            return Err(McpError::ToolNotFound(request.name));
        }

        let arguments = match request.arguments {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => Map::new(),
            Some(other) => {
                return Err(McpError::InvalidParams(format!(
                    "arguments must be an object, got {}",
                    other
                )))
            }
        };
        self.security_validator
            .validate_tool(&request.name, &Value::Object(arguments.clone()))?;

        let gateway = &self.gateway;
        match request.name.as_str() {
            "get_databases" => read_result(gateway.get_databases().await),
            "get_schemas" => read_result(gateway.get_schemas(str_arg(&arguments, "database")?).await),
            "query_data" => {
                let dbname = str_arg(&arguments, "dbname")?;
                let statement = str_arg(&arguments, "statement").or_else(|_| str_arg(&arguments, "s"))?;
                read_result(gateway.query_data(dbname, statement).await)
            }
            "get_server_config" => {
                let server = gateway.get_server_config().await?;
                Ok(CallToolResult::json(&json!({ "server": server })))
            }
            "get_server_parameter" => {
                let parameter = gateway
                    .get_server_parameter(str_arg(&arguments, "parameter_name")?)
                    .await?;
                Ok(CallToolResult::json(&to_json(&parameter)?))
            }
            name if WRITE_TOOLS.contains(&name) => {
                let dbname = str_arg(&arguments, "dbname")?;
                let statement = str_arg(&arguments, "statement")?;
                gateway.exec_and_commit(dbname, statement).await?;
                Ok(CallToolResult::json(&json!({ "status": "committed", "tool": name })))
            }
            other => Err(McpError::ToolNotFound(other.to_string())),
        }
    }

    fn handle_list_resources(&self) -> ListResourcesResult {
        ListResourcesResult {
            resources: self.resources.values().cloned().collect(),
        }
    }

    async fn handle_read_resource(&self, request: ReadResourceRequest) -> Result<ReadResourceResult, McpError> {
        let resource = self
            .resources
            .get(&request.uri)
            .ok_or_else(|| McpError::ResourceNotFound(request.uri.clone()))?;

        // The only resource is the database listing.
        let payload = match self.gateway.get_databases().await {
            Ok(result) => to_json(&result)?,
            Err(e) if e.is_request_scoped() => to_json(&e.envelope())?,
            Err(e) => return Err(e.into()),
        };

        Ok(ReadResourceResult {
            contents: vec![ResourceContent {
                uri: resource.uri.clone(),
                mime_type: resource.mime_type.clone(),
                text: payload.to_string(),
            }],
        })
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, McpError> {
    let params = params.ok_or_else(|| McpError::InvalidParams("Missing params".to_string()))?;
    serde_json::from_value(params).map_err(|e| McpError::InvalidParams(e.to_string()))
}

/// Response for a line that is not valid JSON-RPC.
pub fn parse_error_response(error: &serde_json::Error) -> JsonRpcResponse {
    JsonRpcResponse::failure(
        JsonRpcId::Null,
        McpError::ParseError(format!("Parse error: {}", error)).to_json_rpc_error(),
    )
}
