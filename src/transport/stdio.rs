use tokio::io::{self, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::protocol::error::McpError;
use crate::protocol::types::{JsonRpcRequest, JsonRpcResponse};
use crate::server::{parse_error_response, McpServer};

pub struct StdioTransport {
    server: McpServer,
}

impl StdioTransport {
    pub fn new(server: McpServer) -> Self {
        Self { server }
    }

    /// Serves requests until stdin closes.
    pub async fn run(&mut self) -> Result<(), McpError> {
        let stdin = io::stdin();
        let mut stdin_reader = BufReader::new(stdin);
        let mut stdout = io::stdout();

        let (tx, mut rx) = mpsc::channel::<String>(100);

        let read_task = tokio::spawn(async move {
            let mut buffer = String::new();
            loop {
                buffer.clear();
                match stdin_reader.read_line(&mut buffer).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(buffer.clone()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error reading from stdin: {}", e);
                        break;
                    }
                }
            }
            debug!("stdin closed");
        });

        while let Some(message) = rx.recv().await {
            let line = message.trim();
            if line.is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<JsonRpcRequest>(line) {
                Ok(request) => self.server.process_request(request).await,
                Err(e) => {
                    warn!("Error parsing JSON-RPC request: {}", e);
                    Some(parse_error_response(&e))
                }
            };

            if let Some(response) = response {
                write_response(&mut stdout, &response).await?;
            }
        }

        if let Err(e) = read_task.await {
            error!("Error in read task: {}", e);
        }

        Ok(())
    }
}

async fn write_response<W>(writer: &mut W, response: &JsonRpcResponse) -> Result<(), McpError>
where
    W: AsyncWrite + Unpin,
{
    let response_json = serde_json::to_string(response)?;
    writer.write_all(response_json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
