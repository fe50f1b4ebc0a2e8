use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("tool schema must be a JSON object")]
    SchemaNotObject,
    #[error("tool schema must declare type=object")]
    RootTypeMustBeObject,
    #[error("required must be an array of strings")]
    InvalidRequired,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),
    #[error("invalid tool arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("tool execution failed: {0}")]
    Execution(String),
    #[error("remote tool server {server:?} not connected")]
    NotConnected { server: String },
    #[error("remote tool call failed: {0}")]
    Remote(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to send request: {0}")]
    Request(String),
    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },
    #[error("rate limited after {retries} retries: {last_message}")]
    RateLimitExhausted { retries: u32, last_message: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("stream failed: {0}")]
    Stream(String),
    #[error("request cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Transport(TransportError),
    #[error("agent loop: maximum turns ({max_turns}) reached")]
    BudgetExceeded { max_turns: u32 },
    #[error("agent loop cancelled")]
    Cancelled,
    #[error("agent configuration error: {0}")]
    Config(String),
}

impl From<TransportError> for AgentError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Cancelled => AgentError::Cancelled,
            other => AgentError::Transport(other),
        }
    }
}
