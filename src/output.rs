//! Presentation targets for agent output.
//!
//! The agent only ever calls into a [`Sink`]; what reaches the terminal is the
//! sink's decision.

use std::io::{self, Write};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::error::AgentError;
use crate::llm::{GenerateResponse, StreamEvent, UsageMetadata};

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\u001B\u009B][\[\]()#;?]*(?:(?:(?:[a-zA-Z\d]*(?:;[a-zA-Z\d]*)*)?\u0007)|(?:(?:\d{1,4}(?:;\d{0,4})*)?[\dA-PRZcf-ntqry=><~]))")
        .expect("valid ANSI pattern")
});

/// Removes terminal escape sequences from model text.
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

fn sanitize(text: &str, enabled: bool) -> String {
    if enabled {
        strip_ansi(text)
    } else {
        text.to_string()
    }
}

/// Receiver of already-decided agent events.
pub trait Sink: Send {
    fn write_response(&mut self, response: &GenerateResponse) -> io::Result<()>;

    fn write_stream_event(&mut self, event: &StreamEvent) -> io::Result<()>;

    fn write_tool_call(&mut self, name: &str, args: &Map<String, Value>) -> io::Result<()>;

    fn write_tool_result(
        &mut self,
        name: &str,
        result: &Map<String, Value>,
        is_error: bool,
    ) -> io::Result<()>;

    fn write_error(&mut self, err: &AgentError) -> io::Result<()>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    StreamJson,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "stream-json" => Ok(Self::StreamJson),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

impl OutputFormat {
    /// Whether this format consumes stream events rather than a whole response.
    pub fn is_streaming(self) -> bool {
        !matches!(self, Self::Json)
    }
}

const RAW_OUTPUT_WARNING: &str = "[WARNING] --raw-output is enabled. Model output is not sanitized \
and may contain harmful ANSI sequences (e.g. for phishing or command injection). \
Use --accept-raw-output-risk to suppress this warning.";

/// Warning to print before a run with unsanitized text output, unless the
/// risk was accepted explicitly.
pub fn raw_output_warning(
    format: OutputFormat,
    raw_output: bool,
    accept_risk: bool,
) -> Option<&'static str> {
    (raw_output && !accept_risk && format == OutputFormat::Text).then_some(RAW_OUTPUT_WARNING)
}

/// Builds the sink for `format` over stdout and stderr.
pub fn new_sink(format: OutputFormat, model: &str, sanitize: bool) -> Box<dyn Sink> {
    match format {
        OutputFormat::Text => Box::new(TextSink::new(io::stdout(), io::stderr(), sanitize)),
        OutputFormat::Json => Box::new(JsonSink::new(io::stdout(), io::stderr(), model, sanitize)),
        OutputFormat::StreamJson => {
            Box::new(StreamJsonSink::new(io::stdout(), io::stderr(), sanitize))
        }
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl Sink for NullSink {
    fn write_response(&mut self, _response: &GenerateResponse) -> io::Result<()> {
        Ok(())
    }

    fn write_stream_event(&mut self, _event: &StreamEvent) -> io::Result<()> {
        Ok(())
    }

    fn write_tool_call(&mut self, _name: &str, _args: &Map<String, Value>) -> io::Result<()> {
        Ok(())
    }

    fn write_tool_result(
        &mut self,
        _name: &str,
        _result: &Map<String, Value>,
        _is_error: bool,
    ) -> io::Result<()> {
        Ok(())
    }

    fn write_error(&mut self, _err: &AgentError) -> io::Result<()> {
        Ok(())
    }
}

/// Plain text: model text on `out`, tool activity and errors on `err`.
#[derive(Debug)]
pub struct TextSink<W, E> {
    out: W,
    err: E,
    sanitize: bool,
}

impl<W: Write, E: Write> TextSink<W, E> {
    pub fn new(out: W, err: E, sanitize: bool) -> Self {
        Self { out, err, sanitize }
    }

    pub fn into_parts(self) -> (W, E) {
        (self.out, self.err)
    }
}

impl<W: Write + Send, E: Write + Send> Sink for TextSink<W, E> {
    fn write_response(&mut self, response: &GenerateResponse) -> io::Result<()> {
        writeln!(self.out, "{}", sanitize(&response.text(), self.sanitize))
    }

    fn write_stream_event(&mut self, event: &StreamEvent) -> io::Result<()> {
        match event {
            StreamEvent::Content { text, .. } if !text.is_empty() => {
                write!(self.out, "{}", sanitize(text, self.sanitize))?;
                self.out.flush()
            }
            StreamEvent::Done { .. } => writeln!(self.out),
            _ => Ok(()),
        }
    }

    fn write_tool_call(&mut self, name: &str, _args: &Map<String, Value>) -> io::Result<()> {
        writeln!(self.err, "⚡ {name}")
    }

    fn write_tool_result(
        &mut self,
        name: &str,
        result: &Map<String, Value>,
        is_error: bool,
    ) -> io::Result<()> {
        if !is_error {
            return Ok(());
        }
        match result.get("error") {
            Some(Value::String(message)) => writeln!(self.err, "✗ {name}: {message}"),
            Some(other) => writeln!(self.err, "✗ {name}: {other}"),
            None => Ok(()),
        }
    }

    fn write_error(&mut self, err: &AgentError) -> io::Result<()> {
        writeln!(self.err, "Error: {err}")
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonResponse<'a> {
    model: &'a str,
    response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<&'a UsageMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finish_reason: Option<&'a str>,
}

/// One pretty-printed JSON document for the final buffered response.
#[derive(Debug)]
pub struct JsonSink<W, E> {
    out: W,
    err: E,
    model: String,
    sanitize: bool,
}

impl<W: Write, E: Write> JsonSink<W, E> {
    pub fn new(out: W, err: E, model: impl Into<String>, sanitize: bool) -> Self {
        Self {
            out,
            err,
            model: model.into(),
            sanitize,
        }
    }

    pub fn into_parts(self) -> (W, E) {
        (self.out, self.err)
    }
}

impl<W: Write + Send, E: Write + Send> Sink for JsonSink<W, E> {
    fn write_response(&mut self, response: &GenerateResponse) -> io::Result<()> {
        let document = JsonResponse {
            model: &self.model,
            response: sanitize(&response.text(), self.sanitize),
            usage: response.usage(),
            finish_reason: response.finish_reason(),
        };
        serde_json::to_writer_pretty(&mut self.out, &document)?;
        writeln!(self.out)
    }

    fn write_stream_event(&mut self, _event: &StreamEvent) -> io::Result<()> {
        Ok(())
    }

    fn write_tool_call(&mut self, _name: &str, _args: &Map<String, Value>) -> io::Result<()> {
        Ok(())
    }

    fn write_tool_result(
        &mut self,
        _name: &str,
        _result: &Map<String, Value>,
        _is_error: bool,
    ) -> io::Result<()> {
        Ok(())
    }

    fn write_error(&mut self, err: &AgentError) -> io::Result<()> {
        let document = json!({"error": {"message": err.to_string()}});
        serde_json::to_writer_pretty(&mut self.err, &document)?;
        writeln!(self.err)
    }
}

/// Newline-delimited JSON, one object per event.
#[derive(Debug)]
pub struct StreamJsonSink<W, E> {
    out: W,
    err: E,
    sanitize: bool,
}

impl<W: Write, E: Write> StreamJsonSink<W, E> {
    pub fn new(out: W, err: E, sanitize: bool) -> Self {
        Self { out, err, sanitize }
    }

    pub fn into_parts(self) -> (W, E) {
        (self.out, self.err)
    }
}

fn write_line<T: Serialize>(writer: &mut impl Write, value: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, value)?;
    writer.write_all(b"\n")?;
    writer.flush()
}

impl<W: Write + Send, E: Write + Send> Sink for StreamJsonSink<W, E> {
    fn write_response(&mut self, _response: &GenerateResponse) -> io::Result<()> {
        Ok(())
    }

    fn write_stream_event(&mut self, event: &StreamEvent) -> io::Result<()> {
        match event {
            StreamEvent::Content {
                text,
                thought_signature,
            } if self.sanitize => write_line(
                &mut self.out,
                &StreamEvent::Content {
                    text: strip_ansi(text),
                    thought_signature: thought_signature.clone(),
                },
            ),
            other => write_line(&mut self.out, other),
        }
    }

    fn write_tool_call(&mut self, name: &str, args: &Map<String, Value>) -> io::Result<()> {
        write_line(
            &mut self.out,
            &json!({"type": "tool_call", "name": name, "args": args}),
        )
    }

    fn write_tool_result(
        &mut self,
        name: &str,
        result: &Map<String, Value>,
        is_error: bool,
    ) -> io::Result<()> {
        write_line(
            &mut self.out,
            &json!({"type": "tool_result", "name": name, "result": result, "is_error": is_error}),
        )
    }

    fn write_error(&mut self, err: &AgentError) -> io::Result<()> {
        write_line(
            &mut self.err,
            &StreamEvent::Error {
                error: err.to_string(),
            },
        )
    }
}
