//! External tool servers reached over the Model Context Protocol.
//!
//! The scheduler only sees [`ToolManager`]: a blocking connect/call/close
//! surface. [`bridge::McpManager`] implements it on top of `rmcp` sessions
//! owned by a background worker thread.

pub mod bridge;

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::io::config::McpServerConfig;

/// A tool discovered on a connected server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInfo {
    pub server: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Outcome of one tool call. `is_error` is the server's own verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    pub server: String,
    pub tool_name: String,
    pub content: Vec<Value>,
    pub is_error: bool,
    pub raw_text: String,
}

pub trait ToolManager {
    /// Connect to every server and return the tools they advertise.
    fn connect(&mut self, servers: &BTreeMap<String, McpServerConfig>) -> Result<Vec<ToolInfo>>;

    /// Call `tool_name`, waiting at most `timeout` for the reply.
    fn call(
        &mut self,
        tool_name: &str,
        arguments: Map<String, Value>,
        timeout: Duration,
    ) -> Result<ToolCallResult>;

    fn close(&mut self) -> Result<()>;
}
