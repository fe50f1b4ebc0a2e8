//! Server-sent-event decoding for streamed generation calls.
//!
//! The body is read line by line. Lines that are not `data:` lines are
//! ignored, `data: [DONE]` ends the stream, and each remaining payload decodes
//! to the same [`GenerateResponse`] shape a buffered call returns.

use std::fmt::Display;

use async_stream::stream;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::llm::{GenerateResponse, PartData, StreamEvent, UsageMetadata};

const DONE_SENTINEL: &str = "[DONE]";

/// Splits a byte stream into lines without their terminators.
///
/// A read failure is yielded once as `Err` and ends the stream. A trailing
/// line without a newline is still yielded.
pub fn sse_lines<S, B, E>(bytes: S) -> impl Stream<Item = Result<String, String>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    stream! {
        futures_util::pin_mut!(bytes);
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    buffer.extend_from_slice(chunk.as_ref());
                    while let Some(newline) = buffer.iter().position(|byte| *byte == b'\n') {
                        let line = buffer.drain(..=newline).collect::<Vec<u8>>();
                        yield Ok(String::from_utf8_lossy(&line)
                            .trim_end_matches(['\r', '\n'])
                            .to_string());
                    }
                }
                Err(err) => {
                    yield Err(err.to_string());
                    return;
                }
            }
        }

        if !buffer.is_empty() {
            yield Ok(String::from_utf8_lossy(&buffer).into_owned());
        }
    }
}

/// Drives one streamed response onto `tx`.
///
/// Emits `start` first, then `content`/`tool_call` events per part, then a
/// single `done` carrying the last seen usage and finish reason. A read failure
/// emits `error` instead of `done`. Returns early, without a terminal event,
/// when `cancel` fires or the receiver is dropped.
pub async fn pump_events<S, B, E>(
    bytes: S,
    model: String,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    if !emit(&tx, &cancel, StreamEvent::Start { model }).await {
        return;
    }

    let lines = sse_lines(bytes);
    futures_util::pin_mut!(lines);

    let mut usage: Option<UsageMetadata> = None;
    let mut finish_reason: Option<String> = None;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("stream worker cancelled");
                return;
            }
            next = lines.next() => next,
        };

        let line = match next {
            None => break,
            Some(Ok(line)) => line,
            Some(Err(message)) => {
                emit(&tx, &cancel, StreamEvent::Error { error: message }).await;
                return;
            }
        };

        let Some(data) = line.trim().strip_prefix("data:").map(str::trim_start) else {
            continue;
        };
        if data == DONE_SENTINEL {
            break;
        }

        let chunk = match serde_json::from_str::<GenerateResponse>(data) {
            Ok(chunk) => chunk,
            Err(err) => {
                debug!(error = %err, "skipping malformed stream chunk");
                continue;
            }
        };

        if let Some(chunk_usage) = chunk.usage() {
            usage = Some(chunk_usage.clone());
        }

        for event in chunk_events(chunk, &mut finish_reason) {
            if !emit(&tx, &cancel, event).await {
                return;
            }
        }
    }

    emit(
        &tx,
        &cancel,
        StreamEvent::Done {
            usage,
            finish_reason,
        },
    )
    .await;
}

fn chunk_events(chunk: GenerateResponse, finish_reason: &mut Option<String>) -> Vec<StreamEvent> {
    let mut events = Vec::new();

    for candidate in chunk.response.candidates {
        if let Some(reason) = candidate.finish_reason.filter(|reason| !reason.is_empty()) {
            *finish_reason = Some(reason);
        }

        let Some(content) = candidate.content else {
            continue;
        };

        for part in content.parts {
            match part.data {
                PartData::Text(text) if !text.is_empty() => events.push(StreamEvent::Content {
                    text,
                    thought_signature: part.thought_signature,
                }),
                PartData::FunctionCall(tool_call) => events.push(StreamEvent::ToolCall {
                    tool_call,
                    thought_signature: part.thought_signature,
                }),
                _ => {}
            }
        }
    }

    events
}

async fn emit(
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
    event: StreamEvent,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;
    use serde_json::json;

    use super::*;
    use crate::llm::FunctionCall;

    fn data_line(value: serde_json::Value) -> String {
        format!("data: {value}\n\n")
    }

    fn text_chunk(text: &str, signature: Option<&str>) -> String {
        let mut part = json!({"text": text});
        if let Some(signature) = signature {
            part["thoughtSignature"] = json!(signature);
        }
        data_line(json!({
            "response": {"candidates": [{"content": {"role": "model", "parts": [part]}}]}
        }))
    }

    async fn collect_events(chunks: Vec<Result<Vec<u8>, String>>) -> Vec<StreamEvent> {
        let (tx, mut rx) = mpsc::channel(4);
        let worker = tokio::spawn(pump_events(
            stream::iter(chunks),
            "gemini-2.5-flash".to_string(),
            tx,
            CancellationToken::new(),
        ));

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        worker.await.expect("worker joins");
        events
    }

    #[tokio::test]
    async fn lines_are_split_across_chunk_boundaries() {
        let lines = sse_lines(stream::iter(vec![
            Ok::<_, String>(b"data: {\"a\"".to_vec()),
            Ok(b":1}\r\n\ndata: tail".to_vec()),
        ]))
        .collect::<Vec<_>>()
        .await;

        assert_eq!(
            lines,
            vec![
                Ok("data: {\"a\":1}".to_string()),
                Ok(String::new()),
                Ok("data: tail".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn emits_start_parts_and_trailing_done() {
        let tool_chunk = data_line(json!({
            "response": {
                "candidates": [{
                    "content": {"role": "model", "parts": [
                        {"functionCall": {"name": "list_directory", "args": {"dir_path": "."}}, "thoughtSignature": "sig-2"}
                    ]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 2, "totalTokenCount": 7}
            }
        }));
        let body = format!(
            ": keep-alive\nevent: message\n{}{}",
            text_chunk("Let me look", Some("sig-1")),
            tool_chunk
        );

        let events = collect_events(vec![Ok(body.into_bytes())]).await;

        let mut args = serde_json::Map::new();
        args.insert("dir_path".to_string(), json!("."));
        assert_eq!(
            events,
            vec![
                StreamEvent::Start {
                    model: "gemini-2.5-flash".to_string()
                },
                StreamEvent::Content {
                    text: "Let me look".to_string(),
                    thought_signature: Some("sig-1".to_string()),
                },
                StreamEvent::ToolCall {
                    tool_call: FunctionCall {
                        name: "list_directory".to_string(),
                        args,
                    },
                    thought_signature: Some("sig-2".to_string()),
                },
                StreamEvent::Done {
                    usage: Some(UsageMetadata {
                        prompt_token_count: 5,
                        candidates_token_count: 2,
                        total_token_count: 7,
                    }),
                    finish_reason: Some("STOP".to_string()),
                },
            ]
        );
    }

    #[tokio::test]
    async fn malformed_chunks_are_skipped_and_sentinel_stops_reading() {
        let body = format!(
            "{}data: {{not json\n{}data: [DONE]\n{}",
            text_chunk("one", None),
            text_chunk("two", None),
            text_chunk("after sentinel", None)
        );

        let events = collect_events(vec![Ok(body.into_bytes())]).await;
        let texts = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Content { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>();

        assert_eq!(texts, vec!["one", "two"]);
        assert!(matches!(events.last(), Some(StreamEvent::Done { usage: None, .. })));
    }

    #[tokio::test]
    async fn read_failure_emits_error_without_done() {
        let events = collect_events(vec![
            Ok(text_chunk("partial", None).into_bytes()),
            Err("connection reset by peer".to_string()),
        ])
        .await;

        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], StreamEvent::Start { .. }));
        assert!(matches!(events[1], StreamEvent::Content { .. }));
        assert_eq!(
            events[2],
            StreamEvent::Error {
                error: "connection reset by peer".to_string()
            }
        );
    }

    #[tokio::test]
    async fn cancellation_stops_worker_before_terminal_event() {
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let pending = stream::pending::<Result<Vec<u8>, String>>();
        let worker = tokio::spawn(pump_events(
            pending,
            "gemini-2.5-flash".to_string(),
            tx,
            cancel.clone(),
        ));

        assert!(matches!(rx.recv().await, Some(StreamEvent::Start { .. })));
        cancel.cancel();
        worker.await.expect("worker joins");
        assert_eq!(rx.recv().await, None);
    }
}
