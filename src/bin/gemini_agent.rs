use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use gemini_agent_rs::agent::DEFAULT_MODEL;
use gemini_agent_rs::llm::{CodeAssistClient, CodeAssistConfig};
use gemini_agent_rs::output::{OutputFormat, new_sink, raw_output_warning};
use gemini_agent_rs::prompt::SystemPromptOptions;
use gemini_agent_rs::tools::builtin::{WorkspaceContext, all_tools, web_search_tool};
use gemini_agent_rs::{Agent, AgentError};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Run one non-interactive Gemini agent query.
#[derive(Debug, Parser)]
#[command(name = "gemini-agent", version)]
struct Cli {
    /// Prompt text.
    #[arg(value_name = "PROMPT")]
    positional: Vec<String>,

    /// Prompt text (alternative to the positional form).
    #[arg(short, long)]
    prompt: Option<String>,

    #[arg(short, long, default_value = DEFAULT_MODEL)]
    model: String,

    /// text, json or stream-json.
    #[arg(short, long, default_value = "text")]
    output_format: OutputFormat,

    /// Files whose contents are appended to the prompt.
    #[arg(short, long = "file")]
    files: Vec<PathBuf>,

    /// Overall timeout in seconds.
    #[arg(short, long, default_value_t = 300)]
    timeout: u64,

    #[arg(long, default_value_t = 25)]
    max_turns: u32,

    #[arg(long)]
    debug: bool,

    /// Keep ANSI escape sequences in model output.
    #[arg(long)]
    raw_output: bool,

    /// Silence the --raw-output warning; also disables sanitization.
    #[arg(long)]
    accept_raw_output_risk: bool,

    /// Allow the shell tool.
    #[arg(long)]
    yolo: bool,

    /// Confine file tools to the working directory.
    #[arg(long)]
    sandbox: bool,

    /// Plain chat without tools.
    #[arg(long)]
    no_agent: bool,

    #[arg(long, env = "GOOGLE_CLOUD_PROJECT")]
    project: Option<String>,

    #[arg(long, env = "GEMINI_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if let Some(warning) =
        raw_output_warning(cli.output_format, cli.raw_output, cli.accept_raw_output_risk)
    {
        eprintln!("{warning}");
    }
    let sanitize = !cli.raw_output && !cli.accept_raw_output_risk;
    let mut sink = new_sink(cli.output_format, &cli.model, sanitize);
    let cancel = CancellationToken::new();
    watch_for_cancellation(cancel.clone(), Duration::from_secs(cli.timeout));

    let ready = match build_prompt(&cli) {
        Ok(prompt) => setup(&cli, &cancel).await.map(|agent| (agent, prompt)),
        Err(err) => Err(err),
    };
    let (mut agent, prompt) = match ready {
        Ok(ready) => ready,
        Err(err) => {
            let _ = sink.write_error(&err);
            return ExitCode::FAILURE;
        }
    };

    // From here on the agent reports its own fatal errors.
    agent.set_sink(sink);
    match agent.query(prompt, &cancel).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Cancels `cancel` on Ctrl-C or once `timeout` elapses.
fn watch_for_cancellation(cancel: CancellationToken, timeout: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => debug!("interrupted"),
            _ = tokio::time::sleep(timeout) => debug!(timeout_secs = timeout.as_secs(), "timed out"),
            _ = cancel.cancelled() => return,
        }
        cancel.cancel();
    });
}

async fn setup(cli: &Cli, cancel: &CancellationToken) -> Result<Agent, AgentError> {
    let client = CodeAssistClient::new(CodeAssistConfig {
        access_token: cli.access_token.clone(),
        ..CodeAssistConfig::default()
    })?;
    let client = Arc::new(client);

    let project = match cli.project.as_deref().filter(|project| !project.is_empty()) {
        Some(project) => project.to_string(),
        None => client.resolve_project(cancel).await?,
    };
    debug!(project = %project, model = %cli.model, "resolved project");

    let cwd = env::current_dir()
        .map_err(|err| AgentError::Config(format!("failed to read working directory: {err}")))?;

    let mut builder = Agent::builder()
        .shared_backend(client.clone())
        .model(cli.model.clone())
        .project(project.clone())
        .system_instruction(SystemPromptOptions::new(&cwd).build())
        .max_turns(cli.max_turns)
        .streaming(cli.output_format.is_streaming());

    if !cli.no_agent {
        let ctx = Arc::new(
            WorkspaceContext::new(cwd, cli.sandbox)
                .map_err(|err| AgentError::Config(format!("invalid workspace: {err}")))?,
        );
        builder = builder
            .tools(all_tools(ctx, cli.yolo))
            .tool(web_search_tool(client, Some(project), cli.model.clone()));
    }

    builder.build()
}

/// Prompt text followed by the contents of every `-f` file.
fn build_prompt(cli: &Cli) -> Result<String, AgentError> {
    let mut prompt = match &cli.prompt {
        Some(prompt) => prompt.clone(),
        None => cli.positional.join(" "),
    };

    for path in &cli.files {
        let content = fs::read_to_string(path).map_err(|err| {
            AgentError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        if !prompt.is_empty() {
            prompt.push_str("\n\n");
        }
        prompt.push_str(&format!("--- {} ---\n{content}", path.display()));
    }

    if prompt.trim().is_empty() {
        return Err(AgentError::Config(
            "no prompt given: pass text, -p or -f".to_string(),
        ));
    }
    Ok(prompt)
}
