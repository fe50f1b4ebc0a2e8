pub mod builtin;
pub mod remote;
mod schema;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::error::{SchemaError, ToolError};
use crate::llm::{FunctionCall, FunctionDeclaration};
use remote::{RemoteToolInfo, RemoteToolServer, namespaced_name};

/// Structured payload returned by a tool and sent back as a function response.
pub type ToolOutput = Map<String, Value>;

type ToolHandler =
    dyn Fn(Map<String, Value>) -> BoxFuture<'static, Result<ToolOutput, ToolError>> + Send + Sync;

/// A built-in tool: name, description, parameter schema and async handler.
#[derive(Clone)]
pub struct ToolSpec {
    name: String,
    description: String,
    json_schema: Value,
    handler: Arc<ToolHandler>,
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("json_schema", &self.json_schema)
            .finish()
    }
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            json_schema: json!({
                "type": "object",
                "properties": {},
                "required": [],
            }),
            handler: Arc::new(|_args| {
                Box::pin(async {
                    Err(ToolError::Execution(
                        "tool handler not configured".to_string(),
                    ))
                })
            }),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Result<Self, SchemaError> {
        schema::validate_schema(&schema)?;
        self.json_schema = schema;
        Ok(self)
    }

    pub fn with_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput, ToolError>> + Send + 'static,
    {
        self.handler = Arc::new(move |args| Box::pin(handler(args)));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn json_schema(&self) -> &Value {
        &self.json_schema
    }

    pub async fn execute(&self, args: Map<String, Value>) -> Result<ToolOutput, ToolError> {
        schema::validate_arguments(self.name(), &self.json_schema, &args)?;
        (self.handler)(args).await
    }
}

/// Outcome of one dispatched call, ready to become a function response part.
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionResult {
    pub name: String,
    pub response: ToolOutput,
    pub is_error: bool,
}

impl FunctionResult {
    pub fn from_outcome(name: impl Into<String>, outcome: Result<ToolOutput, ToolError>) -> Self {
        match outcome {
            Ok(response) => Self {
                name: name.into(),
                response,
                is_error: false,
            },
            Err(err) => {
                let mut response = Map::new();
                response.insert("error".to_string(), Value::String(err.to_string()));
                Self {
                    name: name.into(),
                    response,
                    is_error: true,
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
struct RemoteToolRef {
    server: String,
    info: RemoteToolInfo,
}

/// Resolves tool calls to built-in handlers first, then to connected remote
/// servers under `server__tool` names.
#[derive(Default)]
pub struct ToolDispatcher {
    builtins: Vec<ToolSpec>,
    remote_order: Vec<String>,
    remote_tools: HashMap<String, RemoteToolRef>,
    servers: HashMap<String, Arc<dyn RemoteToolServer>>,
}

impl std::fmt::Debug for ToolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDispatcher")
            .field("builtins", &self.builtins)
            .field("remote_tools", &self.remote_order)
            .finish()
    }
}

impl ToolDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a built-in tool. Names must be unique among built-ins.
    pub fn register(&mut self, tool: ToolSpec) -> Result<(), ToolError> {
        if self.builtins.iter().any(|existing| existing.name() == tool.name()) {
            return Err(ToolError::Execution(format!(
                "duplicate tool name: {}",
                tool.name()
            )));
        }
        self.builtins.push(tool);
        Ok(())
    }

    pub fn with_tools(tools: impl IntoIterator<Item = ToolSpec>) -> Result<Self, ToolError> {
        let mut dispatcher = Self::new();
        for tool in tools {
            dispatcher.register(tool)?;
        }
        Ok(dispatcher)
    }

    /// Initializes `server`, lists its tools and registers each one as
    /// `name__tool`. Returns how many tools were added.
    pub async fn connect_remote(
        &mut self,
        name: impl Into<String>,
        server: Arc<dyn RemoteToolServer>,
    ) -> Result<usize, ToolError> {
        let name = name.into();

        if let Err(err) = server.initialize().await {
            warn!(server = %name, error = %err, "remote tool server failed to initialize");
            return Err(err);
        }

        let tools = match server.list_tools().await {
            Ok(tools) => tools,
            Err(err) => {
                warn!(server = %name, error = %err, "remote tool server failed to list tools");
                server.close().await;
                return Err(err);
            }
        };

        self.remove_server_tools(&name);
        let count = tools.len();
        for info in tools {
            let key = namespaced_name(&name, &info.name);
            if !self.remote_tools.contains_key(&key) {
                self.remote_order.push(key.clone());
            }
            self.remote_tools.insert(
                key,
                RemoteToolRef {
                    server: name.clone(),
                    info,
                },
            );
        }

        debug!(server = %name, tools = count, "remote tool server connected");
        if let Some(previous) = self.servers.insert(name, server) {
            previous.close().await;
        }
        Ok(count)
    }

    /// Closes `name` and forgets its tools.
    pub async fn disconnect(&mut self, name: &str) {
        self.remove_server_tools(name);
        if let Some(server) = self.servers.remove(name) {
            server.close().await;
        }
    }

    pub async fn close_all(&mut self) {
        let names = self.servers.keys().cloned().collect::<Vec<_>>();
        for name in names {
            self.disconnect(&name).await;
        }
    }

    fn remove_server_tools(&mut self, server: &str) {
        let remote_tools = &mut self.remote_tools;
        self.remote_order.retain(|key| {
            let owned = remote_tools
                .get(key)
                .is_some_and(|tool| tool.server == server);
            if owned {
                remote_tools.remove(key);
            }
            !owned
        });
    }

    pub fn is_empty(&self) -> bool {
        self.builtins.is_empty() && self.remote_order.is_empty()
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.builtins
            .iter()
            .map(ToolSpec::name)
            .chain(self.remote_order.iter().map(String::as_str))
            .collect()
    }

    /// Declarations sent to the backend: built-ins in registration order, then
    /// remote tools in connection order.
    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        let builtins = self.builtins.iter().map(|tool| FunctionDeclaration {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters: schema::clean_declaration_schema(tool.json_schema()),
        });

        let remote = self.remote_order.iter().filter_map(|key| {
            let tool = self.remote_tools.get(key)?;
            let parameters = if tool.info.input_schema.is_object() {
                schema::clean_declaration_schema(&tool.info.input_schema)
            } else {
                schema::clean_declaration_schema(&json!({"type": "object", "properties": {}}))
            };
            Some(FunctionDeclaration {
                name: key.clone(),
                description: tool.info.description.clone(),
                parameters,
            })
        });

        builtins.chain(remote).collect()
    }

    /// Runs one tool by name. Resolution is exact-name built-ins first, then
    /// namespaced remote tools.
    pub async fn execute(
        &self,
        name: &str,
        args: Map<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        if let Some(tool) = self.builtins.iter().find(|tool| tool.name() == name) {
            debug!(tool = name, "dispatching built-in tool");
            return tool.execute(args).await;
        }

        if let Some(tool) = self.remote_tools.get(name) {
            let server = self
                .servers
                .get(&tool.server)
                .ok_or_else(|| ToolError::NotConnected {
                    server: tool.server.clone(),
                })?;

            debug!(tool = name, server = %tool.server, "dispatching remote tool");
            let text = server.call_tool(&tool.info.name, args).await?;
            let mut output = Map::new();
            output.insert("result".to_string(), Value::String(text));
            return Ok(output);
        }

        Err(ToolError::Unknown(name.to_string()))
    }

    /// Runs one call with a single attempt and folds any failure into an
    /// error-flagged result.
    pub async fn dispatch(&self, call: &FunctionCall) -> FunctionResult {
        let outcome = self.execute(&call.name, call.args.clone()).await;
        if let Err(err) = &outcome {
            debug!(tool = %call.name, error = %err, "tool call failed");
        }
        FunctionResult::from_outcome(call.name.clone(), outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object")
    }

    fn echo_tool(name: &str) -> ToolSpec {
        ToolSpec::new(name, "Echoes its input")
            .with_schema(json!({
                "type": "object",
                "properties": {"value": {"type": "string"}},
                "required": ["value"],
                "additionalProperties": false
            }))
            .expect("schema valid")
            .with_handler(|args| async move { Ok(args) })
    }

    fn failing_tool() -> ToolSpec {
        ToolSpec::new("explode", "Always fails").with_handler(|_args| async move {
            Err(ToolError::Execution("disk on fire".to_string()))
        })
    }

    #[derive(Default)]
    struct FakeServer {
        calls: Mutex<Vec<String>>,
        closed: Mutex<bool>,
        connected: bool,
    }

    #[async_trait]
    impl RemoteToolServer for FakeServer {
        async fn initialize(&self) -> Result<(), ToolError> {
            Ok(())
        }

        async fn list_tools(&self) -> Result<Vec<RemoteToolInfo>, ToolError> {
            Ok(vec![RemoteToolInfo {
                name: "lookup".to_string(),
                description: "Looks things up".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {"query": {"type": "string", "default": ""}},
                    "additionalProperties": false
                }),
            }])
        }

        async fn call_tool(
            &self,
            name: &str,
            args: Map<String, Value>,
        ) -> Result<String, ToolError> {
            if !self.connected {
                return Err(ToolError::NotConnected {
                    server: "docs".to_string(),
                });
            }
            self.calls.lock().expect("lock").push(name.to_string());
            Ok(format!("{name}: {}", Value::Object(args)))
        }

        async fn close(&self) {
            *self.closed.lock().expect("lock") = true;
        }
    }

    #[test]
    fn schema_validation_rejects_non_object_root() {
        let result = ToolSpec::new("bad", "bad").with_schema(json!({"type": "string"}));
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_builtin_names_are_rejected() {
        let err = ToolDispatcher::with_tools([echo_tool("echo"), echo_tool("echo")])
            .expect_err("duplicate");
        assert!(err.to_string().contains("duplicate tool name: echo"));
    }

    #[tokio::test]
    async fn builtin_tools_validate_and_execute() {
        let dispatcher = ToolDispatcher::with_tools([echo_tool("echo")]).expect("dispatcher");

        let output = dispatcher
            .execute("echo", args(json!({"value": "hi"})))
            .await
            .expect("executes");
        assert_eq!(output["value"], "hi");

        let err = dispatcher
            .execute("echo", args(json!({})))
            .await
            .expect_err("missing field");
        assert!(err.to_string().contains("missing required field"));
    }

    #[tokio::test]
    async fn failures_become_error_flagged_results() {
        let dispatcher = ToolDispatcher::with_tools([failing_tool()]).expect("dispatcher");

        let result = dispatcher
            .dispatch(&FunctionCall {
                name: "explode".to_string(),
                args: Map::new(),
            })
            .await;
        assert!(result.is_error);
        assert_eq!(result.name, "explode");
        assert_eq!(
            result.response["error"],
            "tool execution failed: disk on fire"
        );

        let unknown = dispatcher
            .dispatch(&FunctionCall {
                name: "nope".to_string(),
                args: Map::new(),
            })
            .await;
        assert!(unknown.is_error);
        assert_eq!(unknown.response["error"], "unknown tool: nope");
    }

    #[tokio::test]
    async fn remote_tools_are_namespaced_and_called_by_their_own_name() {
        let server = Arc::new(FakeServer {
            connected: true,
            ..FakeServer::default()
        });
        let mut dispatcher = ToolDispatcher::with_tools([echo_tool("echo")]).expect("dispatcher");
        let added = dispatcher
            .connect_remote("docs", server.clone())
            .await
            .expect("connects");
        assert_eq!(added, 1);
        assert_eq!(dispatcher.tool_names(), vec!["echo", "docs__lookup"]);

        let declarations = dispatcher.declarations();
        assert_eq!(declarations[1].name, "docs__lookup");
        assert!(declarations[1].parameters.get("additionalProperties").is_none());
        assert!(declarations[1].parameters["properties"]["query"].get("default").is_none());

        let output = dispatcher
            .execute("docs__lookup", args(json!({"query": "rust"})))
            .await
            .expect("remote call");
        assert_eq!(output["result"], "lookup: {\"query\":\"rust\"}");
        assert_eq!(*server.calls.lock().expect("lock"), vec!["lookup".to_string()]);

        dispatcher.close_all().await;
        assert!(*server.closed.lock().expect("lock"));
        assert_eq!(dispatcher.tool_names(), vec!["echo"]);
    }

    #[tokio::test]
    async fn disconnected_remote_fails_only_that_call() {
        let mut dispatcher = ToolDispatcher::with_tools([echo_tool("echo")]).expect("dispatcher");
        dispatcher
            .connect_remote("docs", Arc::new(FakeServer::default()))
            .await
            .expect("connects");

        let failed = dispatcher
            .dispatch(&FunctionCall {
                name: "docs__lookup".to_string(),
                args: Map::new(),
            })
            .await;
        assert!(failed.is_error);
        assert!(failed.response["error"]
            .as_str()
            .is_some_and(|message| message.contains("not connected")));

        let ok = dispatcher
            .dispatch(&FunctionCall {
                name: "echo".to_string(),
                args: args(json!({"value": "still works"})),
            })
            .await;
        assert!(!ok.is_error);
    }
}
