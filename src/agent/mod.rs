pub mod normalizer;
pub mod reducer;

use std::io;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AgentError, TransportError};
use crate::llm::{
    Content, FunctionCall, GenerateRequest, GenerationConfig, GenerativeBackend, InnerRequest,
    Part, StreamEvent, SystemInstruction, Tool,
};
use crate::output::{NullSink, Sink};
use crate::tools::{FunctionResult, ToolDispatcher, ToolSpec};
use normalizer::StreamAccumulator;
use reducer::{Action, Conversation};

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    pub project: Option<String>,
    pub user_prompt_id: Option<String>,
    pub system_instruction: Option<String>,
    pub generation: GenerationConfig,
    /// Upper bound on transport calls per query.
    pub max_turns: u32,
    /// Use the streamed transport and forward events as they arrive.
    pub streaming: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            project: None,
            user_prompt_id: None,
            system_instruction: None,
            generation: GenerationConfig::default(),
            max_turns: 25,
            streaming: true,
        }
    }
}

pub struct AgentBuilder {
    backend: Option<Arc<dyn GenerativeBackend>>,
    dispatcher: ToolDispatcher,
    tools: Vec<ToolSpec>,
    sink: Option<Box<dyn Sink>>,
    config: AgentConfig,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self {
            backend: None,
            dispatcher: ToolDispatcher::new(),
            tools: Vec::new(),
            sink: None,
            config: AgentConfig::default(),
        }
    }
}

impl AgentBuilder {
    pub fn backend<B>(mut self, backend: B) -> Self
    where
        B: GenerativeBackend + 'static,
    {
        self.backend = Some(Arc::new(backend));
        self
    }

    pub fn shared_backend(mut self, backend: Arc<dyn GenerativeBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Starts from an existing dispatcher, e.g. one with remote servers
    /// already connected.
    pub fn dispatcher(mut self, dispatcher: ToolDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn sink<S>(mut self, sink: S) -> Self
    where
        S: Sink + 'static,
    {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn boxed_sink(mut self, sink: Box<dyn Sink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.config.project = Some(project.into());
        self
    }

    pub fn user_prompt_id(mut self, user_prompt_id: impl Into<String>) -> Self {
        self.config.user_prompt_id = Some(user_prompt_id.into());
        self
    }

    pub fn system_instruction(mut self, system_instruction: impl Into<String>) -> Self {
        self.config.system_instruction = Some(system_instruction.into());
        self
    }

    pub fn generation_config(mut self, generation: GenerationConfig) -> Self {
        self.config.generation = generation;
        self
    }

    pub fn max_turns(mut self, max_turns: u32) -> Self {
        self.config.max_turns = max_turns;
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.config.streaming = streaming;
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let Some(backend) = self.backend else {
            return Err(AgentError::Config(
                "agent backend must be configured via AgentBuilder::backend(...)".to_string(),
            ));
        };

        let mut dispatcher = self.dispatcher;
        for tool in self.tools {
            dispatcher
                .register(tool)
                .map_err(|err| AgentError::Config(err.to_string()))?;
        }

        Ok(Agent {
            backend,
            dispatcher,
            sink: self.sink.unwrap_or_else(|| Box::new(NullSink)),
            config: self.config,
            conversation: Conversation::new(),
        })
    }
}

/// Drives request, response and tool execution cycles over one conversation.
pub struct Agent {
    backend: Arc<dyn GenerativeBackend>,
    dispatcher: ToolDispatcher,
    sink: Box<dyn Sink>,
    config: AgentConfig,
    conversation: Conversation,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn clear_history(&mut self) {
        self.conversation = Conversation::new();
    }

    /// Replaces the sink receiving events and errors from later queries.
    pub fn set_sink(&mut self, sink: Box<dyn Sink>) {
        self.sink = sink;
    }

    pub fn dispatcher(&self) -> &ToolDispatcher {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut ToolDispatcher {
        &mut self.dispatcher
    }

    /// Runs one user prompt to completion and returns the final model text.
    ///
    /// A fatal error is written to the sink once, here, and then returned.
    pub async fn query(
        &mut self,
        prompt: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        self.run(Content::user_text(prompt), cancel).await
    }

    /// Like [`Agent::query`] for a pre-built user turn.
    ///
    /// A failed run leaves the conversation as it was before the call, so a
    /// model turn whose function calls never got responses is not replayed by
    /// the next query.
    pub async fn run(
        &mut self,
        user_turn: Content,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let checkpoint = self.conversation.len();
        self.conversation.append(user_turn);

        let result = self.run_turns(cancel).await;
        if let Err(err) = &result {
            debug!(
                dropped = self.conversation.len() - checkpoint,
                "rolling back failed run"
            );
            self.conversation.truncate(checkpoint);
            self.write_sink(|sink| sink.write_error(err));
        }
        result
    }

    async fn run_turns(&mut self, cancel: &CancellationToken) -> Result<String, AgentError> {
        let max_turns = self.config.max_turns;
        let declarations = self.dispatcher.declarations();
        let tools = if declarations.is_empty() {
            Vec::new()
        } else {
            vec![Tool {
                function_declarations: declarations,
                google_search: None,
            }]
        };

        for turn in 1..=max_turns {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            debug!(turn, max_turns, "starting turn");

            let request = self.build_request(&tools);
            let parts = if self.config.streaming {
                self.call_streaming(&request, cancel).await?
            } else {
                self.call_buffered(&request, cancel).await?
            };

            let text = reducer::response_text(&parts);
            let (conversation, action) =
                reducer::reduce(std::mem::take(&mut self.conversation), parts);
            self.conversation = conversation;

            let calls = match action {
                Action::Terminate => return Ok(text),
                Action::Dispatch(calls) => calls,
            };

            let results = self.dispatch_all(&calls, cancel).await?;
            self.conversation =
                reducer::append_results(std::mem::take(&mut self.conversation), &results);
        }

        Err(AgentError::BudgetExceeded { max_turns })
    }

    fn build_request(&self, tools: &[Tool]) -> GenerateRequest {
        GenerateRequest {
            model: self.config.model.clone(),
            project: self.config.project.clone(),
            user_prompt_id: self.config.user_prompt_id.clone(),
            request: InnerRequest {
                contents: self.conversation.turns().to_vec(),
                system_instruction: self
                    .config
                    .system_instruction
                    .as_deref()
                    .map(SystemInstruction::text),
                generation_config: self.config.generation.clone(),
                tools: tools.to_vec(),
            },
        }
    }

    async fn call_buffered(
        &mut self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<Part>, AgentError> {
        let response = self.backend.generate(request, cancel).await?;
        let parts = response.parts().cloned().collect::<Vec<_>>();

        if !parts.iter().any(Part::is_function_call) {
            self.write_sink(|sink| sink.write_response(&response));
        }
        Ok(parts)
    }

    async fn call_streaming(
        &mut self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<Part>, AgentError> {
        let mut events = self.backend.generate_stream(request, cancel).await?;
        let mut accumulator = StreamAccumulator::new();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                event = events.recv() => event,
            };
            let Some(event) = event else {
                break;
            };

            if let StreamEvent::Error { error } = event {
                return Err(TransportError::Stream(error).into());
            }

            self.write_sink(|sink| sink.write_stream_event(&event));
            accumulator.push(&event);
        }

        let parts = accumulator.finish();
        debug!(parts = parts.len(), "stream collected");
        Ok(parts)
    }

    /// Executes calls one at a time in arrival order.
    async fn dispatch_all(
        &mut self,
        calls: &[FunctionCall],
        cancel: &CancellationToken,
    ) -> Result<Vec<FunctionResult>, AgentError> {
        let mut results = Vec::with_capacity(calls.len());

        for call in calls {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            debug!(tool = %call.name, "executing tool");
            self.write_sink(|sink| sink.write_tool_call(&call.name, &call.args));

            let result = self.dispatcher.dispatch(call).await;
            self.write_sink(|sink| {
                sink.write_tool_result(&result.name, &result.response, result.is_error)
            });
            results.push(result);
        }

        Ok(results)
    }

    fn write_sink(&mut self, write: impl FnOnce(&mut dyn Sink) -> io::Result<()>) {
        if let Err(err) = write(self.sink.as_mut()) {
            warn!(error = %err, "failed to write agent output");
        }
    }
}
