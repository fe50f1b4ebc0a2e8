//! System instruction for the non-interactive coding agent.
//!
//! The instruction is assembled from fixed sections (mandates, workflows,
//! guidelines), a description of the local environment, a git section when the
//! working directory is inside a repository, and any `GEMINI.md` memory files.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate};
use tracing::debug;

const MEMORY_FILE: &str = "GEMINI.md";
const DEFAULT_SHELL: &str = "/bin/bash";

/// Inputs to [`SystemPromptOptions::build`].
#[derive(Debug, Clone)]
pub struct SystemPromptOptions {
    work_dir: PathBuf,
    shell: Option<String>,
    home_dir: Option<PathBuf>,
    context_files: Vec<PathBuf>,
    date: Option<NaiveDate>,
}

impl SystemPromptOptions {
    /// Options for `work_dir`, with the home directory taken from `HOME`.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            shell: None,
            home_dir: env::var_os("HOME").map(PathBuf::from),
            context_files: Vec::new(),
            date: None,
        }
    }

    /// Shell reported in the environment section. Falls back to `SHELL`, then
    /// `/bin/bash`.
    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    /// Home directory searched for `.gemini/GEMINI.md`. `None` skips it.
    pub fn home_dir(mut self, home_dir: Option<PathBuf>) -> Self {
        self.home_dir = home_dir;
        self
    }

    /// Extra file appended verbatim after the memory section.
    pub fn context_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.context_files.push(path.into());
        self
    }

    /// Pins the date shown in the environment section.
    pub fn date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn build(&self) -> String {
        let mut sections = vec![
            PREAMBLE.to_string(),
            CORE_MANDATES.to_string(),
            PRIMARY_WORKFLOWS.to_string(),
            OPERATIONAL_GUIDELINES.to_string(),
            self.render_environment(),
        ];

        if is_git_repo(&self.work_dir) {
            sections.push(GIT_REPOSITORY.to_string());
        }
        sections.push(FINAL_REMINDER.to_string());

        let memory = self.load_user_memory();
        if !memory.is_empty() {
            sections.push(format!("---\n\n{memory}"));
        }

        for path in &self.context_files {
            match fs::read_to_string(path) {
                Ok(text) if !text.trim().is_empty() => {
                    sections.push(format!("---\n\n{}", text.trim()));
                }
                Ok(_) => {}
                Err(err) => debug!(path = %path.display(), error = %err, "skipping context file"),
            }
        }

        collapse_blank_lines(&sections.join("\n\n"))
    }

    fn render_environment(&self) -> String {
        let shell = self
            .shell
            .clone()
            .or_else(|| env::var("SHELL").ok().filter(|shell| !shell.is_empty()))
            .unwrap_or_else(|| DEFAULT_SHELL.to_string());
        let user = env::var("USER")
            .or_else(|_| env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let date = self.date.unwrap_or_else(|| Local::now().date_naive());

        format!(
            "# Environment\n\
             - Platform: {}/{}\n\
             - Shell: {shell}\n\
             - Working directory: {}\n\
             - User: {user}\n\
             - Date: {}",
            env::consts::OS,
            env::consts::ARCH,
            self.work_dir.display(),
            date.format("%Y-%m-%d"),
        )
    }

    /// Workspace `GEMINI.md`, then `.gemini/GEMINI.md`, then the one under the
    /// home directory, joined by blank lines.
    fn load_user_memory(&self) -> String {
        let mut candidates = vec![
            self.work_dir.join(MEMORY_FILE),
            self.work_dir.join(".gemini").join(MEMORY_FILE),
        ];
        if let Some(home) = &self.home_dir {
            candidates.push(home.join(".gemini").join(MEMORY_FILE));
        }

        candidates
            .iter()
            .filter_map(|path| fs::read_to_string(path).ok())
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Whether `dir` or one of its ancestors holds a `.git` entry.
pub fn is_git_repo(dir: &Path) -> bool {
    dir.ancestors().any(|ancestor| ancestor.join(".git").exists())
}

fn collapse_blank_lines(text: &str) -> String {
    let mut collapsed = text.to_string();
    while collapsed.contains("\n\n\n") {
        collapsed = collapsed.replace("\n\n\n", "\n\n");
    }
    collapsed
}

const PREAMBLE: &str = "You are a non-interactive CLI agent specializing in software engineering tasks. \
Your primary goal is to help users safely and efficiently, adhering strictly to the following \
instructions and utilizing your available tools.";

const CORE_MANDATES: &str = r#"# Core Mandates

- **Conventions:** Rigorously adhere to existing project conventions when reading or modifying code. Analyze surrounding code, tests, and configuration first.
- **Libraries/Frameworks:** NEVER assume a library/framework is available or appropriate. Verify its established usage within the project (imports, configuration files like 'package.json', 'Cargo.toml', 'requirements.txt', or neighboring files) before employing it.
- **Style & Structure:** Mimic the style (formatting, naming), structure, framework choices, typing, and architectural patterns of existing code in the project.
- **Idiomatic Changes:** When editing, understand the local context (imports, functions/classes) so your changes integrate naturally.
- **Comments:** Add code comments sparingly and only where they carry real information. *NEVER* talk to the user or describe your changes through comments.
- **Proactiveness:** Fulfill the user's request thoroughly, including tests for added features or fixed bugs.
- **Handle Ambiguity/Expansion:** Do not take significant actions beyond the clear scope of the request.
- **Explaining Changes:** After completing a code modification or file operation *do not* provide summaries unless asked.
- **Do Not revert changes:** Do not revert changes to the codebase unless asked to do so by the user.
- **Continue the work:** You are not to interact with the user. Complete the task using your best judgement without asking for more information."#;

const PRIMARY_WORKFLOWS: &str = r#"# Primary Workflows

## Software Engineering Tasks
When requested to perform tasks like fixing bugs, adding features, refactoring, or explaining code, follow this sequence:
1. **Understand:** Use 'grep_search' and 'glob' extensively to understand file structures, existing code patterns, and conventions. Use 'read_file' and 'read_many_files' to validate any assumptions.
2. **Plan:** Build a coherent plan grounded in what you found. Break complex tasks into smaller steps and include tests that verify the change.
3. **Implement:** Use the available tools (e.g., 'replace', 'write_file', 'run_shell_command') to act on the plan, following the project's established conventions.
4. **Verify (Tests):** If feasible, run the project's own test commands. Find them in 'README' files or build configuration; NEVER assume standard test commands.
5. **Verify (Standards):** After making code changes, run the project's build, lint and type-check commands.
6. **Finalize:** After all verification passes, consider the task complete. Do not remove or revert created files such as tests.

## New Applications
Autonomously implement a substantially complete, functional prototype. Scaffold with 'run_shell_command', create files with 'write_file', refine them with 'replace', and make sure the result builds without errors."#;

const OPERATIONAL_GUIDELINES: &str = r#"# Operational Guidelines

## Shell tool output token efficiency
- Prefer command flags that reduce output verbosity when using 'run_shell_command'.
- If a command is expected to produce a lot of output, use quiet or silent flags where available, unless the full output is needed.

## Tone and Style
- **Concise & Direct:** Use a professional, direct, and concise tone suitable for a CLI.
- **Minimal Output:** Aim for fewer than 3 lines of text output (excluding tool use) per response whenever practical.
- **No Chitchat:** Avoid conversational filler, preambles, or postambles.
- **Formatting:** Use GitHub-flavored Markdown. Responses are rendered in monospace.
- **Tools vs. Text:** Use tools for actions and text output *only* for communication.

## Security and Safety Rules
- **Explain Critical Commands:** Before running a command that modifies the file system, codebase, or system state, briefly explain its purpose and impact.
- **Security First:** Never introduce code that exposes, logs, or commits secrets, API keys, or other sensitive information.

## Tool Usage
- **Command Execution:** Use 'run_shell_command' for shell commands when it is available.
- **Interactive Commands:** Never use interactive shell commands. Always pass arguments that bypass prompts, e.g. 'git --no-pager', 'vitest run', 'npx --yes'."#;

const GIT_REPOSITORY: &str = r#"# Git Repository
- The current working (project) directory is being managed by a git repository.
- **NEVER** stage or commit your changes, unless you are explicitly instructed to commit.
- When asked to commit, start by gathering information: `git status && git diff HEAD && git log -n 3`.
- Always propose a draft commit message that matches the style of recent commits.
- After each commit, confirm that it was successful by running `git status`.
- If a commit fails, never attempt to work around the issues without being asked to do so.
- Never push changes to a remote repository without being asked explicitly by the user."#;

const FINAL_REMINDER: &str = r#"# Final Reminder
Your core function is efficient and safe assistance. Always prioritize user control and project conventions. Never make assumptions about the contents of files; use 'read_file' instead. You are an agent: keep going until the user's query is completely resolved."#;

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    static NEXT_DIR: AtomicUsize = AtomicUsize::new(0);

    fn temp_dir(label: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!(
            "gemini_agent_rs_prompt_{label}_{}_{}",
            std::process::id(),
            NEXT_DIR.fetch_add(1, Ordering::SeqCst)
        ));
        fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 14).expect("valid date")
    }

    #[test]
    fn environment_section_reports_workspace_shell_and_date() {
        let work_dir = temp_dir("env");
        let prompt = SystemPromptOptions::new(&work_dir)
            .shell("/usr/bin/zsh")
            .home_dir(None)
            .date(date())
            .build();

        assert!(prompt.starts_with("You are a non-interactive CLI agent"));
        assert!(prompt.contains("# Environment\n"));
        assert!(prompt.contains(&format!(
            "- Platform: {}/{}",
            env::consts::OS,
            env::consts::ARCH
        )));
        assert!(prompt.contains("- Shell: /usr/bin/zsh"));
        assert!(prompt.contains(&format!("- Working directory: {}", work_dir.display())));
        assert!(prompt.contains("- Date: 2025-03-14"));
        assert!(prompt.trim_end().ends_with("keep going until the user's query is completely resolved."));
        assert!(!prompt.contains("\n\n\n"));

        let _ = fs::remove_dir_all(work_dir);
    }

    #[test]
    fn git_section_only_inside_a_repository() {
        let plain = temp_dir("plain");
        let without = SystemPromptOptions::new(&plain).home_dir(None).build();
        assert!(!without.contains("# Git Repository"));

        let repo = temp_dir("repo");
        fs::create_dir_all(repo.join(".git")).expect("mkdir");
        let nested = repo.join("crates").join("core");
        fs::create_dir_all(&nested).expect("mkdir");
        assert!(is_git_repo(&nested));

        let with = SystemPromptOptions::new(&nested).home_dir(None).build();
        let git = with.find("# Git Repository").expect("git section");
        let reminder = with.find("# Final Reminder").expect("final reminder");
        assert!(git < reminder);

        let _ = fs::remove_dir_all(plain);
        let _ = fs::remove_dir_all(repo);
    }

    #[test]
    fn memory_and_context_files_follow_the_reminder() {
        let work_dir = temp_dir("memory");
        let home = temp_dir("home");
        fs::write(work_dir.join(MEMORY_FILE), "  Use tabs.  \n").expect("write");
        fs::create_dir_all(home.join(".gemini")).expect("mkdir");
        fs::write(home.join(".gemini").join(MEMORY_FILE), "Prefer short answers.").expect("write");
        let context = work_dir.join("extension.md");
        fs::write(&context, "Extension notes.\n").expect("write");

        let prompt = SystemPromptOptions::new(&work_dir)
            .home_dir(Some(home.clone()))
            .context_file(&context)
            .context_file(work_dir.join("missing.md"))
            .build();

        assert!(prompt.ends_with(
            "---\n\nUse tabs.\n\nPrefer short answers.\n\n---\n\nExtension notes."
        ));

        let _ = fs::remove_dir_all(work_dir);
        let _ = fs::remove_dir_all(home);
    }
}
