//! Conversation state and the per-turn reducer.
//!
//! `reduce` takes the parts of one model response and decides what happens
//! next, without touching the transport or the tools.

use crate::llm::{Content, FunctionCall, Part, PartData, Role};
use crate::tools::FunctionResult;

/// Placeholder continuation token for function calls the backend returned
/// without one. The backend accepts it in place of a real signature.
pub const SYNTHETIC_THOUGHT_SIGNATURE: &str = "skip_thought_signature_validator";

/// History of one agent. Turns are only ever appended, except that a failed
/// run is rolled back as a whole with [`Conversation::truncate`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Conversation {
    turns: Vec<Content>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, turn: Content) {
        self.turns.push(turn);
    }

    /// Drops every turn after the first `len`.
    pub fn truncate(&mut self, len: usize) {
        self.turns.truncate(len);
    }

    pub fn turns(&self) -> &[Content] {
        &self.turns
    }

    pub fn last(&self) -> Option<&Content> {
        self.turns.last()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// What the controller should do after a model response.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    Terminate,
    Dispatch(Vec<FunctionCall>),
}

/// Gives every function-call part a non-empty continuation token. Parts that
/// already carry one are left untouched.
pub fn ensure_thought_signatures(parts: Vec<Part>) -> Vec<Part> {
    parts
        .into_iter()
        .map(|mut part| {
            if part.is_function_call() && part.thought_signature.is_none() {
                part.thought_signature = Some(SYNTHETIC_THOUGHT_SIGNATURE.to_string());
            }
            part
        })
        .collect()
}

/// Folds one model response into the conversation.
///
/// With no function calls the response is final: it is appended (when it has
/// any parts) and the action is `Terminate`. Otherwise the whole response is
/// appended as one model turn, with tokens synthesized where missing, and the
/// calls are returned in arrival order.
pub fn reduce(mut conversation: Conversation, parts: Vec<Part>) -> (Conversation, Action) {
    let calls = parts
        .iter()
        .filter_map(Part::as_function_call)
        .cloned()
        .collect::<Vec<_>>();

    if calls.is_empty() {
        if !parts.is_empty() {
            conversation.append(Content::new(Role::Model, parts));
        }
        return (conversation, Action::Terminate);
    }

    conversation.append(Content::new(
        Role::Model,
        ensure_thought_signatures(parts),
    ));
    (conversation, Action::Dispatch(calls))
}

/// Appends one user turn holding a function response per result, in order.
pub fn append_results(mut conversation: Conversation, results: &[FunctionResult]) -> Conversation {
    let parts = results
        .iter()
        .map(|result| Part::function_response(result.name.clone(), result.response.clone()))
        .collect::<Vec<_>>();
    conversation.append(Content::new(Role::User, parts));
    conversation
}

/// Concatenated text of a response's text parts.
pub fn response_text(parts: &[Part]) -> String {
    parts
        .iter()
        .filter_map(|part| match &part.data {
            PartData::Text(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}
