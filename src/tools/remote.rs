use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ToolError;

/// Separator between a server name and its tool name in dispatcher keys.
pub const REMOTE_TOOL_SEPARATOR: &str = "__";

/// A tool advertised by a remote server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

/// Call/response contract for an out-of-process tool server.
///
/// The wire protocol behind it is the implementor's concern. An implementor
/// whose connection has gone away should return [`ToolError::NotConnected`].
#[async_trait]
pub trait RemoteToolServer: Send + Sync {
    async fn initialize(&self) -> Result<(), ToolError>;

    async fn list_tools(&self) -> Result<Vec<RemoteToolInfo>, ToolError>;

    /// Calls `name` (un-namespaced) and returns its text output.
    async fn call_tool(&self, name: &str, args: Map<String, Value>) -> Result<String, ToolError>;

    async fn close(&self);
}

pub fn namespaced_name(server: &str, tool: &str) -> String {
    format!("{server}{REMOTE_TOOL_SEPARATOR}{tool}")
}
