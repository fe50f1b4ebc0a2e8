//! Tool-calling agent loop for the Gemini Code Assist API.
//!
//! - `Agent` turn controller: buffered or streamed calls, sequential tool dispatch, turn budget
//! - `CodeAssistClient` transport with 429 retries and SSE streaming
//! - Built-in workspace tools plus remote tool servers behind one `ToolDispatcher`
//! - Text, JSON and line-delimited JSON output sinks
//! - System instruction assembly for the coding agent (`prompt`)

pub mod agent;
pub mod error;
pub mod llm;
pub mod output;
pub mod prompt;
pub mod tools;

pub use agent::{Agent, AgentBuilder, AgentConfig};
pub use error::{AgentError, SchemaError, ToolError, TransportError};
pub use llm::{
    CodeAssistClient, CodeAssistConfig, Content, FunctionCall, GenerateRequest, GenerateResponse,
    GenerativeBackend, Part, RetryPolicy, StreamEvent,
};
pub use output::{OutputFormat, Sink};
pub use prompt::SystemPromptOptions;
pub use tools::{ToolDispatcher, ToolSpec};
