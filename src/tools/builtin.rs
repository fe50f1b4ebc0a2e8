use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use glob::{Pattern, glob};
use regex::Regex;
use serde_json::{Map, Value, json};
use tokio::process::Command;
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::error::ToolError;
use crate::llm::CodeAssistClient;
use crate::tools::{ToolOutput, ToolSpec};

const DEFAULT_READ_LIMIT: usize = 2000;
const MAX_GLOB_RESULTS: usize = 500;
const MAX_GREP_MATCHES: usize = 100;
const MAX_GREP_FILE_BYTES: u64 = 1024 * 1024;
const MAX_SHELL_OUTPUT_BYTES: usize = 30_000;
const MAX_MANY_FILE_BYTES: usize = 100 * 1024;
const DEFAULT_SHELL_TIMEOUT_SECS: u64 = 120;
const SKIPPED_DIRS: [&str; 4] = [".git", "node_modules", ".svn", "__pycache__"];

/// Directory the file tools resolve relative paths against.
///
/// In sandbox mode, any path that normalizes to somewhere outside the root is
/// rejected.
#[derive(Debug, Clone)]
pub struct WorkspaceContext {
    root_dir: PathBuf,
    sandbox: bool,
}

impl WorkspaceContext {
    pub fn new(root_dir: impl Into<PathBuf>, sandbox: bool) -> Result<Self, std::io::Error> {
        let root_dir = root_dir.into().canonicalize()?;
        Ok(Self { root_dir, sandbox })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn is_sandboxed(&self) -> bool {
        self.sandbox
    }

    pub fn resolve_path(&self, path: impl AsRef<Path>) -> Result<PathBuf, ToolError> {
        let candidate = path.as_ref();
        let unresolved = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root_dir.join(candidate)
        };
        let resolved = normalize_absolute_path(&unresolved);

        if self.sandbox && !resolved.starts_with(&self.root_dir) {
            return Err(ToolError::Execution(format!(
                "sandbox: {} is outside working directory {}",
                candidate.display(),
                self.root_dir.display()
            )));
        }

        Ok(resolved)
    }

    fn resolve_dir_arg(&self, args: &Map<String, Value>) -> Result<PathBuf, ToolError> {
        match string_arg(args, "dir_path") {
            Some(dir) => self.resolve_path(dir),
            None => Ok(self.root_dir.clone()),
        }
    }
}

fn normalize_absolute_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(Path::new("/")),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    normalized
}

/// The workspace tools, in declaration order. The shell tool is included only
/// when `allow_shell` is set.
pub fn all_tools(ctx: Arc<WorkspaceContext>, allow_shell: bool) -> Vec<ToolSpec> {
    let mut tools = vec![
        list_directory_tool(ctx.clone()),
        read_file_tool(ctx.clone()),
        read_many_files_tool(ctx.clone()),
        write_file_tool(ctx.clone()),
        replace_tool(ctx.clone()),
        glob_tool(ctx.clone()),
        grep_search_tool(ctx.clone()),
    ];
    if allow_shell {
        tools.push(shell_tool(ctx));
    }
    tools
}

pub fn list_directory_tool(ctx: Arc<WorkspaceContext>) -> ToolSpec {
    ToolSpec::new(
        "list_directory",
        "Lists the names of files and subdirectories directly within a directory.",
    )
    .with_schema(json!({
        "type": "object",
        "properties": {
            "dir_path": {"type": "string", "description": "The directory to list."}
        },
        "required": ["dir_path"],
        "additionalProperties": false
    }))
    .expect("valid schema")
    .with_handler(move |args| {
        let ctx = ctx.clone();
        async move {
            let dir = ctx.resolve_dir_arg(&args)?;
            let read_dir = fs::read_dir(&dir).map_err(|err| {
                ToolError::Execution(format!("failed to list directory: {err}"))
            })?;

            let mut names = read_dir
                .flatten()
                .map(|entry| {
                    let mut name = entry.file_name().to_string_lossy().into_owned();
                    if entry.file_type().is_ok_and(|kind| kind.is_dir()) {
                        name.push('/');
                    }
                    name
                })
                .collect::<Vec<_>>();
            names.sort();

            let mut output = ToolOutput::new();
            output.insert("entries".to_string(), json!(names.join("\n")));
            output.insert("dir_path".to_string(), json!(dir.display().to_string()));
            output.insert("count".to_string(), json!(names.len()));
            Ok(output)
        }
    })
}

pub fn read_file_tool(ctx: Arc<WorkspaceContext>) -> ToolSpec {
    ToolSpec::new(
        "read_file",
        "Reads a text file. Use offset and limit to page through large files; at most 2000 lines are returned by default.",
    )
    .with_schema(json!({
        "type": "object",
        "properties": {
            "file_path": {"type": "string", "description": "The file to read."},
            "offset": {"type": "integer", "description": "0-based line to start from."},
            "limit": {"type": "integer", "description": "Maximum number of lines to return."}
        },
        "required": ["file_path"],
        "additionalProperties": false
    }))
    .expect("valid schema")
    .with_handler(move |args| {
        let ctx = ctx.clone();
        async move {
            let file_path = string_arg(&args, "file_path").unwrap_or_default();
            let path = ctx.resolve_path(&file_path)?;
            if path.is_dir() {
                return Err(ToolError::Execution(
                    "path is a directory, not a file; use list_directory instead".to_string(),
                ));
            }

            let content = fs::read_to_string(&path)
                .map_err(|err| ToolError::Execution(format!("failed to read file: {err}")))?;

            let offset = usize_arg(&args, "offset").unwrap_or(0);
            let limit = usize_arg(&args, "limit")
                .filter(|limit| *limit > 0)
                .unwrap_or(DEFAULT_READ_LIMIT);

            let total_lines = content.lines().count();
            let selected = content
                .lines()
                .skip(offset)
                .take(limit)
                .collect::<Vec<_>>();

            let mut output = ToolOutput::new();
            output.insert("content".to_string(), json!(selected.join("\n")));
            output.insert("file_path".to_string(), json!(path.display().to_string()));
            output.insert("line_count".to_string(), json!(selected.len()));

            let next_offset = offset.saturating_add(limit);
            if total_lines > next_offset {
                output.insert("truncated".to_string(), json!(true));
                output.insert("total_lines".to_string(), json!(total_lines));
                output.insert("next_offset".to_string(), json!(next_offset));
            }
            Ok(output)
        }
    })
}

pub fn read_many_files_tool(ctx: Arc<WorkspaceContext>) -> ToolSpec {
    ToolSpec::new(
        "read_many_files",
        "Reads several files in one call. Each file is capped at 100KB.",
    )
    .with_schema(json!({
        "type": "object",
        "properties": {
            "file_paths": {
                "type": "array",
                "items": {"type": "string"},
                "description": "The files to read."
            }
        },
        "required": ["file_paths"],
        "additionalProperties": false
    }))
    .expect("valid schema")
    .with_handler(move |args| {
        let ctx = ctx.clone();
        async move {
            let paths = args
                .get("file_paths")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>();
            if paths.is_empty() {
                return Err(ToolError::Execution(
                    "file_paths must not be empty".to_string(),
                ));
            }

            // One unreadable file is reported in place and does not fail the call.
            let mut files = Map::new();
            for file_path in &paths {
                let entry = match ctx.resolve_path(file_path) {
                    Ok(path) => {
                        let key = path.display().to_string();
                        match fs::read_to_string(&path) {
                            Ok(content) => (key, json!({"content": cap_file(&content)})),
                            Err(err) => (key, json!({"error": format!("failed to read: {err}")})),
                        }
                    }
                    Err(err) => (file_path.to_string(), json!({"error": err.to_string()})),
                };
                files.insert(entry.0, entry.1);
            }

            let mut output = ToolOutput::new();
            output.insert("files".to_string(), Value::Object(files));
            output.insert("count".to_string(), json!(paths.len()));
            Ok(output)
        }
    })
}

pub fn write_file_tool(ctx: Arc<WorkspaceContext>) -> ToolSpec {
    ToolSpec::new(
        "write_file",
        "Writes content to a file, creating it and any parent directories as needed.",
    )
    .with_schema(json!({
        "type": "object",
        "properties": {
            "file_path": {"type": "string", "description": "The file to write."},
            "content": {"type": "string", "description": "The full new content."}
        },
        "required": ["file_path", "content"],
        "additionalProperties": false
    }))
    .expect("valid schema")
    .with_handler(move |args| {
        let ctx = ctx.clone();
        async move {
            let file_path = string_arg(&args, "file_path").unwrap_or_default();
            let content = args
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let path = ctx.resolve_path(&file_path)?;

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|err| {
                    ToolError::Execution(format!("failed to create directory: {err}"))
                })?;
            }
            fs::write(&path, content.as_bytes())
                .map_err(|err| ToolError::Execution(format!("failed to write file: {err}")))?;

            let mut output = ToolOutput::new();
            output.insert(
                "message".to_string(),
                json!(format!("Successfully wrote to {}", path.display())),
            );
            output.insert("file_path".to_string(), json!(path.display().to_string()));
            output.insert("bytes".to_string(), json!(content.len()));
            Ok(output)
        }
    })
}

/// `replace`: literal find-and-replace that refuses to run unless the number
/// of occurrences matches `expected_replacements` (default 1).
pub fn replace_tool(ctx: Arc<WorkspaceContext>) -> ToolSpec {
    ToolSpec::new(
        "replace",
        "Replaces exact text within a file. Replaces a single occurrence unless `expected_replacements` says otherwise. Read the file first so old_string matches exactly, including whitespace.",
    )
    .with_schema(json!({
        "type": "object",
        "properties": {
            "file_path": {"type": "string", "description": "The file to modify."},
            "old_string": {"type": "string", "description": "The exact literal text to replace."},
            "new_string": {"type": "string", "description": "The text to put in its place."},
            "expected_replacements": {
                "type": "integer",
                "minimum": 1,
                "description": "Number of occurrences expected. Defaults to 1."
            }
        },
        "required": ["file_path", "old_string", "new_string"],
        "additionalProperties": false
    }))
    .expect("valid schema")
    .with_handler(move |args| {
        let ctx = ctx.clone();
        async move {
            let file_path = string_arg(&args, "file_path").unwrap_or_default();
            let Some(old_string) = string_arg(&args, "old_string") else {
                return Err(ToolError::Execution("old_string must not be empty".to_string()));
            };
            let new_string = args
                .get("new_string")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let expected = usize_arg(&args, "expected_replacements")
                .filter(|expected| *expected > 0)
                .unwrap_or(1);
            let path = ctx.resolve_path(&file_path)?;

            let content = fs::read_to_string(&path)
                .map_err(|err| ToolError::Execution(format!("failed to read file: {err}")))?;
            let found = content.matches(old_string.as_str()).count();
            if found == 0 {
                return Err(ToolError::Execution(format!(
                    "old_string not found in {}. Match the exact text including whitespace and indentation.",
                    path.display()
                )));
            }
            if found != expected {
                return Err(ToolError::Execution(format!(
                    "expected {expected} replacement(s) but found {found} occurrence(s) of old_string in {}",
                    path.display()
                )));
            }

            let updated = content.replacen(old_string.as_str(), new_string, expected);
            fs::write(&path, updated.as_bytes())
                .map_err(|err| ToolError::Execution(format!("failed to write file: {err}")))?;

            let mut output = ToolOutput::new();
            output.insert(
                "message".to_string(),
                json!(format!(
                    "Successfully replaced {expected} occurrence(s) in {}",
                    path.display()
                )),
            );
            output.insert("file_path".to_string(), json!(path.display().to_string()));
            output.insert("replacements".to_string(), json!(expected));
            Ok(output)
        }
    })
}

pub fn glob_tool(ctx: Arc<WorkspaceContext>) -> ToolSpec {
    ToolSpec::new(
        "glob",
        "Finds files matching a glob pattern such as `src/**/*.rs`, newest first.",
    )
    .with_schema(json!({
        "type": "object",
        "properties": {
            "pattern": {"type": "string", "description": "The glob pattern to match."},
            "dir_path": {"type": "string", "description": "Directory to search from."}
        },
        "required": ["pattern"],
        "additionalProperties": false
    }))
    .expect("valid schema")
    .with_handler(move |args| {
        let ctx = ctx.clone();
        async move {
            let pattern = string_arg(&args, "pattern").unwrap_or_default();
            let base = ctx.resolve_dir_arg(&args)?;
            let query = base.join(&pattern).display().to_string();

            let entries = glob(&query)
                .map_err(|err| ToolError::Execution(format!("invalid glob pattern: {err}")))?;

            let mut files = entries
                .flatten()
                .filter(|path| path.is_file())
                .map(|path| {
                    let modified = fs::metadata(&path)
                        .and_then(|meta| meta.modified())
                        .unwrap_or(SystemTime::UNIX_EPOCH);
                    (path, modified)
                })
                .collect::<Vec<_>>();
            files.sort_by(|a, b| b.1.cmp(&a.1));

            let truncated = files.len() > MAX_GLOB_RESULTS;
            files.truncate(MAX_GLOB_RESULTS);
            let paths = files
                .into_iter()
                .map(|(path, _)| Value::String(path.display().to_string()))
                .collect::<Vec<_>>();

            let mut output = ToolOutput::new();
            output.insert("count".to_string(), json!(paths.len()));
            output.insert("files".to_string(), Value::Array(paths));
            if truncated {
                output.insert("truncated".to_string(), json!(true));
                output.insert(
                    "message".to_string(),
                    json!(format!(
                        "Results limited to {MAX_GLOB_RESULTS} files. Use a more specific pattern."
                    )),
                );
            }
            Ok(output)
        }
    })
}

pub fn grep_search_tool(ctx: Arc<WorkspaceContext>) -> ToolSpec {
    ToolSpec::new(
        "grep_search",
        "Searches file contents for a regular expression and returns matching lines with paths and line numbers.",
    )
    .with_schema(json!({
        "type": "object",
        "properties": {
            "pattern": {"type": "string", "description": "The regular expression to search for."},
            "dir_path": {"type": "string", "description": "Directory to search in."},
            "include": {"type": "string", "description": "Glob filter on file names, e.g. `*.rs`."}
        },
        "required": ["pattern"],
        "additionalProperties": false
    }))
    .expect("valid schema")
    .with_handler(move |args| {
        let ctx = ctx.clone();
        async move {
            let pattern = string_arg(&args, "pattern").unwrap_or_default();
            let regex = Regex::new(&pattern)
                .map_err(|err| ToolError::Execution(format!("invalid regex pattern: {err}")))?;
            let include = string_arg(&args, "include")
                .map(|include| Pattern::new(&include))
                .transpose()
                .map_err(|err| ToolError::Execution(format!("invalid include pattern: {err}")))?;
            let base = ctx.resolve_dir_arg(&args)?;

            let walker = WalkDir::new(&base)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| {
                    let name = entry.file_name().to_string_lossy();
                    !(entry.file_type().is_dir() && SKIPPED_DIRS.iter().any(|skip| *skip == name))
                });

            let mut matches = Vec::new();
            let mut truncated = false;
            'files: for entry in walker.flatten() {
                if !entry.file_type().is_file() {
                    continue;
                }
                if entry
                    .metadata()
                    .is_ok_and(|meta| meta.len() > MAX_GREP_FILE_BYTES)
                {
                    continue;
                }
                if let Some(include) = &include {
                    if !include.matches(&entry.file_name().to_string_lossy()) {
                        continue;
                    }
                }

                let Ok(content) = fs::read_to_string(entry.path()) else {
                    continue;
                };
                for (index, line) in content.lines().enumerate() {
                    if !regex.is_match(line) {
                        continue;
                    }
                    if matches.len() == MAX_GREP_MATCHES {
                        truncated = true;
                        break 'files;
                    }
                    matches.push(format!(
                        "{}:{}: {}",
                        entry.path().display(),
                        index + 1,
                        preview(line.trim(), 200)
                    ));
                }
            }

            let mut output = ToolOutput::new();
            output.insert("matches".to_string(), json!(matches.join("\n")));
            output.insert("count".to_string(), json!(matches.len()));
            if truncated {
                output.insert("truncated".to_string(), json!(true));
                output.insert(
                    "message".to_string(),
                    json!(format!(
                        "Results limited to {MAX_GREP_MATCHES} matches. Refine your search."
                    )),
                );
            }
            Ok(output)
        }
    })
}

pub fn shell_tool(ctx: Arc<WorkspaceContext>) -> ToolSpec {
    ToolSpec::new(
        "run_shell_command",
        "Executes a shell command as `sh -c <command>` and returns stdout, stderr and the exit code.",
    )
    .with_schema(json!({
        "type": "object",
        "properties": {
            "command": {"type": "string", "description": "The shell command to execute."},
            "dir_path": {"type": "string", "description": "Directory to run the command in."},
            "timeout": {"type": "integer", "description": "Timeout in seconds (default 120)."}
        },
        "required": ["command"],
        "additionalProperties": false
    }))
    .expect("valid schema")
    .with_handler(move |args| {
        let ctx = ctx.clone();
        async move {
            let command = string_arg(&args, "command").unwrap_or_default();
            let dir = ctx.resolve_dir_arg(&args)?;
            let timeout_secs = usize_arg(&args, "timeout")
                .map(|secs| secs as u64)
                .unwrap_or(DEFAULT_SHELL_TIMEOUT_SECS);

            let output = timeout(
                Duration::from_secs(timeout_secs),
                Command::new("sh")
                    .arg("-c")
                    .arg(&command)
                    .current_dir(&dir)
                    .kill_on_drop(true)
                    .output(),
            )
            .await
            .map_err(|_| {
                ToolError::Execution(format!("command timed out after {timeout_secs}s"))
            })?
            .map_err(|err| ToolError::Execution(format!("failed to run command: {err}")))?;

            let exit_code = output.status.code().unwrap_or(-1);
            let mut result = ToolOutput::new();
            result.insert(
                "stdout".to_string(),
                json!(cap_output(&String::from_utf8_lossy(&output.stdout))),
            );
            result.insert(
                "stderr".to_string(),
                json!(cap_output(&String::from_utf8_lossy(&output.stderr))),
            );
            result.insert("exit_code".to_string(), json!(exit_code));
            if !output.status.success() {
                result.insert(
                    "error".to_string(),
                    json!(format!("command exited with status {exit_code}")),
                );
            }
            Ok(result)
        }
    })
}

/// `google_web_search`: a grounded single-shot query through `client`.
pub fn web_search_tool(
    client: Arc<CodeAssistClient>,
    project: Option<String>,
    model: impl Into<String>,
) -> ToolSpec {
    let model = model.into();
    ToolSpec::new(
        "google_web_search",
        "Performs a web search using Google Search and returns a summary with cited sources.",
    )
    .with_schema(json!({
        "type": "object",
        "properties": {
            "query": {"type": "string", "description": "The search query."}
        },
        "required": ["query"],
        "additionalProperties": false
    }))
    .expect("valid schema")
    .with_handler(move |args| {
        let client = client.clone();
        let project = project.clone();
        let model = model.clone();
        async move {
            let query = string_arg(&args, "query").unwrap_or_default();
            let answer = client
                .web_search(project.as_deref(), &model, &query, &CancellationToken::new())
                .await
                .map_err(|err| ToolError::Execution(format!("web search failed: {err}")))?;

            let mut output = ToolOutput::new();
            if answer.text.is_empty() {
                output.insert(
                    "message".to_string(),
                    json!(format!("No search results found for: {query:?}")),
                );
                return Ok(output);
            }

            let mut content = format!("Web search results for {query:?}:\n\n{}", answer.text);
            if !answer.sources.is_empty() {
                content.push_str("\n\nSources:");
                for (index, source) in answer.sources.iter().enumerate() {
                    let title = if source.title.is_empty() {
                        "Untitled"
                    } else {
                        source.title.as_str()
                    };
                    content.push_str(&format!("\n[{}] {title} ({})", index + 1, source.uri));
                }
            }
            output.insert("content".to_string(), json!(content));
            output.insert("source_count".to_string(), json!(answer.sources.len()));
            Ok(output)
        }
    })
}

fn string_arg(args: &Map<String, Value>, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn usize_arg(args: &Map<String, Value>, key: &str) -> Option<usize> {
    args.get(key)
        .and_then(Value::as_u64)
        .and_then(|value| usize::try_from(value).ok())
}

fn preview(line: &str, max_chars: usize) -> String {
    match line.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &line[..cut]),
        None => line.to_string(),
    }
}

fn cap_file(text: &str) -> String {
    if text.len() <= MAX_MANY_FILE_BYTES {
        return text.to_string();
    }
    let mut cut = MAX_MANY_FILE_BYTES;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n... [truncated]", &text[..cut])
}

fn cap_output(text: &str) -> String {
    if text.len() <= MAX_SHELL_OUTPUT_BYTES {
        return text.to_string();
    }
    let mut cut = MAX_SHELL_OUTPUT_BYTES;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n... [output truncated]", &text[..cut])
}
