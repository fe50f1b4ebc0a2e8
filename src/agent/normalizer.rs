use std::mem;

use crate::llm::{Part, StreamEvent};

/// Rebuilds response parts from streamed events.
///
/// Consecutive `content` events collapse into one text part that carries the
/// latest token seen for that run of text. A `tool_call` event closes the
/// current text run before its own part is appended.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    parts: Vec<Part>,
    text: String,
    text_signature: Option<String>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Content {
                text,
                thought_signature,
            } => {
                self.text.push_str(text);
                if thought_signature.is_some() {
                    self.text_signature = thought_signature.clone();
                }
            }
            StreamEvent::ToolCall {
                tool_call,
                thought_signature,
            } => {
                self.flush_text();
                self.parts.push(
                    Part::function_call(tool_call.clone())
                        .with_thought_signature(thought_signature.clone()),
                );
            }
            StreamEvent::Start { .. } | StreamEvent::Done { .. } | StreamEvent::Error { .. } => {}
        }
    }

    pub fn finish(mut self) -> Vec<Part> {
        self.flush_text();
        self.parts
    }

    fn flush_text(&mut self) {
        if self.text.is_empty() {
            return;
        }
        let text = mem::take(&mut self.text);
        self.parts
            .push(Part::text(text).with_thought_signature(self.text_signature.take()));
    }
}
