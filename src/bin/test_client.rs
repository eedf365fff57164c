use anyhow::{anyhow, bail, Context, Result};
use clap::{Arg, ArgMatches, Command};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};

static REQUEST_ID: AtomicUsize = AtomicUsize::new(1);

struct McpClient {
    server_process: Child,
    stdin: ChildStdin,
    stdout_reader: BufReader<ChildStdout>,
}

impl McpClient {
    fn new(server_path: &str, config_path: Option<&str>, read_write: bool) -> Result<Self> {
        let mut cmd = std::process::Command::new(server_path);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        if let Some(config) = config_path {
            cmd.arg("--config").arg(config);
        }
        if read_write {
            cmd.arg("--read-write");
        }

        eprintln!("Starting server: {:?}", cmd);

        let mut server_process = cmd.spawn().context("Failed to start server")?;
        let stdin = server_process
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Failed to open stdin"))?;
        let stdout = server_process
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to open stdout"))?;

        Ok(McpClient {
            server_process,
            stdin,
            stdout_reader: BufReader::new(stdout),
        })
    }

    fn notify(&mut self, method: &str) -> Result<()> {
        let message = json!({"jsonrpc": "2.0", "method": method});
        writeln!(self.stdin, "{}", message).context("Failed to send notification")?;
        self.stdin.flush()?;
        Ok(())
    }

    fn send_request(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = REQUEST_ID.fetch_add(1, Ordering::SeqCst);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });

        eprintln!("Sending request: {}", request);
        writeln!(self.stdin, "{}", request).context("Failed to send request")?;
        self.stdin.flush()?;

        let mut response_line = String::new();
        let read = self
            .stdout_reader
            .read_line(&mut response_line)
            .context("Failed to read response")?;
        if read == 0 {
            bail!("Server closed its output");
        }

        let response: Value = serde_json::from_str(&response_line).context("Failed to parse response")?;
        if let Some(error) = response.get("error") {
            bail!("Server returned error: {}", error);
        }

        Ok(response["result"].clone())
    }

    fn initialize(&mut self) -> Result<Value> {
        let result = self.send_request(
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "test-client", "version": env!("CARGO_PKG_VERSION")}
            }),
        )?;
        self.notify("notifications/initialized")?;
        Ok(result)
    }

    /// Calls a tool and decodes the JSON it returned as text.
    fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value> {
        let result = self.send_request("tools/call", json!({"name": name, "arguments": arguments}))?;
        let text = result["content"][0]["text"]
            .as_str()
            .ok_or_else(|| anyhow!("Tool result has no text content: {}", result))?;
        let payload: Value = serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()));

        if result["isError"].as_bool().unwrap_or(false) {
            bail!("Tool '{}' reported an error: {}", name, payload);
        }
        Ok(payload)
    }

    fn close(mut self) -> Result<()> {
        drop(self.stdin);
        self.server_process
            .wait()
            .context("Failed to wait for server process")?;
        Ok(())
    }
}

fn cli() -> Command<'static> {
    Command::new("azure-postgres-mcp test client")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Drives an azure-postgres-mcp server over stdio")
        .arg(
            Arg::new("server")
                .short('s')
                .long("server")
                .value_name("PATH")
                .help("Path to the server executable")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .help("Path to the server config file")
                .takes_value(true),
        )
        .arg(
            Arg::new("read-write")
                .long("read-write")
                .help("Start the server with the tools that modify data"),
        )
        .subcommand(Command::new("list-tools").about("List available tools"))
        .subcommand(Command::new("list-resources").about("List available resources"))
        .subcommand(
            Command::new("read-resource")
                .about("Read a resource")
                .arg(Arg::new("uri").required(true).help("Resource URI")),
        )
        .subcommand(Command::new("databases").about("List databases"))
        .subcommand(
            Command::new("schemas")
                .about("List tables and columns of a database")
                .arg(Arg::new("database").required(true).help("Database name")),
        )
        .subcommand(
            Command::new("query")
                .about("Run a SELECT statement")
                .arg(Arg::new("dbname").required(true).help("Database name"))
                .arg(Arg::new("statement").required(true).help("SELECT statement")),
        )
        .subcommand(
            Command::new("execute")
                .about("Run a mutating statement through one of the write tools")
                .arg(
                    Arg::new("tool")
                        .required(true)
                        .possible_values(["update_values", "create_table", "drop_table"]),
                )
                .arg(Arg::new("dbname").required(true).help("Database name"))
                .arg(Arg::new("statement").required(true).help("Statement to commit")),
        )
        .subcommand(Command::new("server-config").about("Show the flexible server configuration"))
        .subcommand(
            Command::new("parameter")
                .about("Show a server parameter")
                .arg(Arg::new("name").required(true).help("Parameter name")),
        )
}

fn arg<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a str> {
    matches
        .value_of(name)
        .ok_or_else(|| anyhow!("missing argument '{}'", name))
}

fn run(client: &mut McpClient, matches: &ArgMatches) -> Result<Value> {
    match matches.subcommand() {
        Some(("list-tools", _)) => client.send_request("tools/list", json!({})),
        Some(("list-resources", _)) => client.send_request("resources/list", json!({})),
        Some(("read-resource", cmd)) => {
            client.send_request("resources/read", json!({"uri": arg(cmd, "uri")?}))
        }
        Some(("schemas", cmd)) => client.call_tool("get_schemas", json!({"database": arg(cmd, "database")?})),
        Some(("query", cmd)) => client.call_tool(
            "query_data",
            json!({"dbname": arg(cmd, "dbname")?, "statement": arg(cmd, "statement")?}),
        ),
        Some(("execute", cmd)) => client.call_tool(
            arg(cmd, "tool")?,
            json!({"dbname": arg(cmd, "dbname")?, "statement": arg(cmd, "statement")?}),
        ),
        Some(("server-config", _)) => client.call_tool("get_server_config", json!({})),
        Some(("parameter", cmd)) => {
            client.call_tool("get_server_parameter", json!({"parameter_name": arg(cmd, "name")?}))
        }
        _ => client.call_tool("get_databases", json!({})),
    }
}

fn main() -> Result<()> {
    let matches = cli().get_matches();

    let mut client = McpClient::new(
        arg(&matches, "server")?,
        matches.value_of("config"),
        matches.is_present("read-write"),
    )?;

    let info = client.initialize()?;
    eprintln!("Server initialized: {}", info["serverInfo"]);

    let outcome = run(&mut client, &matches);
    client.close()?;

    println!("{}", serde_json::to_string_pretty(&outcome?)?);
    Ok(())
}
