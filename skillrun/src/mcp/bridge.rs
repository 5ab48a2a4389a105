//! Blocking bridge to `rmcp` client sessions.
//!
//! One worker thread owns a tokio runtime and every live session. Callers send
//! requests over a channel and block on the reply with a hard timeout, so the
//! scheduler never touches async code.

use std::collections::BTreeMap;
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use rmcp::model::{CallToolRequestParams, ClientInfo, ProtocolVersion};
use rmcp::service::{DynService, RoleClient, RunningService, ServiceExt};
use rmcp::transport::TokioChildProcess;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::io::config::McpServerConfig;
use crate::mcp::{ToolCallResult, ToolInfo, ToolManager};

type ClientSession = RunningService<RoleClient, Box<dyn DynService<RoleClient>>>;
type Reply<T> = std_mpsc::Sender<Result<T>>;

/// Extra wait on top of the server-side timeout before the caller gives up.
const REPLY_SLACK: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

enum Request {
    Connect {
        servers: BTreeMap<String, McpServerConfig>,
        reply: Reply<Vec<ToolInfo>>,
    },
    Call {
        server: String,
        tool_name: String,
        arguments: Map<String, Value>,
        timeout: Duration,
        reply: Reply<ToolCallResult>,
    },
    Close {
        reply: Reply<()>,
    },
}

/// [`ToolManager`] backed by stdio MCP servers.
#[derive(Debug, Default)]
pub struct McpManager {
    sender: Option<mpsc::UnboundedSender<Request>>,
    worker: Option<JoinHandle<()>>,
    tool_servers: BTreeMap<String, String>,
}

impl McpManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_worker(&mut self) -> Result<&mpsc::UnboundedSender<Request>> {
        if self.sender.is_none() {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .enable_all()
                .build()
                .context("build MCP runtime")?;
            let (sender, receiver) = mpsc::unbounded_channel();
            let worker = thread::Builder::new()
                .name("skillrun-mcp".to_string())
                .spawn(move || runtime.block_on(worker_loop(receiver)))
                .context("spawn MCP worker")?;
            self.sender = Some(sender);
            self.worker = Some(worker);
        }
        self.sender
            .as_ref()
            .ok_or_else(|| anyhow!("MCP worker unavailable"))
    }

    fn request<T>(
        &mut self,
        build: impl FnOnce(Reply<T>) -> Request,
        wait: Duration,
    ) -> Result<T> {
        let (reply, response) = std_mpsc::channel();
        self.ensure_worker()?
            .send(build(reply))
            .map_err(|_| anyhow!("MCP worker stopped"))?;
        match response.recv_timeout(wait) {
            Ok(result) => result,
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                Err(anyhow!("MCP request timed out after {} seconds", wait.as_secs()))
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(anyhow!("MCP worker stopped")),
        }
    }
}

impl ToolManager for McpManager {
    fn connect(&mut self, servers: &BTreeMap<String, McpServerConfig>) -> Result<Vec<ToolInfo>> {
        let wait = servers
            .values()
            .map(|server| Duration::from_secs(server.timeout_secs))
            .sum::<Duration>()
            + REPLY_SLACK;
        let servers = servers.clone();
        let tools = self.request(|reply| Request::Connect { servers, reply }, wait)?;
        self.tool_servers = tools
            .iter()
            .map(|tool| (tool.name.clone(), tool.server.clone()))
            .collect();
        info!(tool_count = tools.len(), "MCP servers connected");
        Ok(tools)
    }

    fn call(
        &mut self,
        tool_name: &str,
        arguments: Map<String, Value>,
        timeout: Duration,
    ) -> Result<ToolCallResult> {
        let server = self
            .tool_servers
            .get(tool_name)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown MCP tool: {tool_name}"))?;
        let tool_name = tool_name.to_string();
        self.request(
            |reply| Request::Call {
                server,
                tool_name,
                arguments,
                timeout,
                reply,
            },
            timeout + REPLY_SLACK,
        )
    }

    fn close(&mut self) -> Result<()> {
        let Some(sender) = self.sender.take() else {
            return Ok(());
        };
        let (reply, response) = std_mpsc::channel();
        let result = match sender.send(Request::Close { reply }) {
            Ok(()) => response
                .recv_timeout(CLOSE_TIMEOUT)
                .unwrap_or_else(|_| Err(anyhow!("MCP close timed out"))),
            Err(_) => Ok(()),
        };
        drop(sender);
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("MCP worker panicked");
        }
        self.tool_servers.clear();
        result
    }
}

impl Drop for McpManager {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            debug!(err = %format!("{err:#}"), "MCP close during drop failed");
        }
    }
}

async fn worker_loop(mut receiver: mpsc::UnboundedReceiver<Request>) {
    let mut sessions: BTreeMap<String, ClientSession> = BTreeMap::new();
    while let Some(request) = receiver.recv().await {
        match request {
            Request::Connect { servers, reply } => {
                let result = connect_all(&servers, &mut sessions).await;
                let _ = reply.send(result);
            }
            Request::Call {
                server,
                tool_name,
                arguments,
                timeout,
                reply,
            } => {
                let result = match sessions.get(&server) {
                    Some(session) => call_tool(session, &server, &tool_name, arguments, timeout).await,
                    None => Err(anyhow!("No active session for server: {server}")),
                };
                let _ = reply.send(result);
            }
            Request::Close { reply } => {
                shutdown(&mut sessions).await;
                let _ = reply.send(Ok(()));
                break;
            }
        }
    }
    shutdown(&mut sessions).await;
}

async fn connect_all(
    servers: &BTreeMap<String, McpServerConfig>,
    sessions: &mut BTreeMap<String, ClientSession>,
) -> Result<Vec<ToolInfo>> {
    let mut tools = Vec::new();
    for (name, config) in servers {
        let timeout = Duration::from_secs(config.timeout_secs);
        let session = tokio::time::timeout(timeout, connect_server(config))
            .await
            .map_err(|_| anyhow!("connect to MCP server {name} timed out"))?
            .with_context(|| format!("connect to MCP server {name}"))?;
        let listed = tokio::time::timeout(timeout, session.list_all_tools())
            .await
            .map_err(|_| anyhow!("list tools on MCP server {name} timed out"))?
            .with_context(|| format!("list tools on MCP server {name}"))?;
        debug!(server = %name, tool_count = listed.len(), "MCP tools listed");
        tools.extend(listed.into_iter().map(|tool| ToolInfo {
            server: name.clone(),
            name: tool.name.to_string(),
            description: tool
                .description
                .map(|text| text.to_string())
                .unwrap_or_default(),
            input_schema: Value::Object((*tool.input_schema).clone()),
        }));
        sessions.insert(name.clone(), session);
    }
    Ok(tools)
}

async fn connect_server(config: &McpServerConfig) -> Result<ClientSession> {
    let mut command = tokio::process::Command::new(&config.command);
    command.args(&config.args).envs(&config.env);
    let transport = TokioChildProcess::new(command)
        .with_context(|| format!("spawn {}", config.command))?;
    let client_info = ClientInfo {
        protocol_version: ProtocolVersion::LATEST,
        ..Default::default()
    };
    client_info
        .into_dyn()
        .serve(transport)
        .await
        .map_err(|err| anyhow!("initialize MCP session: {err}"))
}

async fn call_tool(
    session: &ClientSession,
    server: &str,
    tool_name: &str,
    arguments: Map<String, Value>,
    timeout: Duration,
) -> Result<ToolCallResult> {
    let params = CallToolRequestParams {
        meta: None,
        name: tool_name.to_string().into(),
        arguments: Some(arguments),
        task: None,
    };
    let result = tokio::time::timeout(timeout, session.call_tool(params))
        .await
        .map_err(|_| anyhow!("MCP tool {tool_name} timed out after {} seconds", timeout.as_secs()))?
        .with_context(|| format!("call MCP tool {tool_name}"))?;

    let raw_text = result
        .content
        .iter()
        .filter_map(|item| item.as_text().map(|text| text.text.clone()))
        .collect::<Vec<_>>()
        .join("\n");
    let content = result
        .content
        .iter()
        .filter_map(|item| serde_json::to_value(item).ok())
        .collect();
    Ok(ToolCallResult {
        server: server.to_string(),
        tool_name: tool_name.to_string(),
        content,
        is_error: result.is_error.unwrap_or(false),
        raw_text,
    })
}

async fn shutdown(sessions: &mut BTreeMap<String, ClientSession>) {
    for (name, session) in std::mem::take(sessions) {
        if let Err(err) = session.cancel().await {
            warn!(server = %name, %err, "MCP session did not shut down cleanly");
        }
    }
}
