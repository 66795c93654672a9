use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chat_context::build_combined_query;
use crate::config::{Config, MAX_STREAM_DELAY, MIN_STREAM_DELAY, ProviderKind};
use crate::fs_tools::{
    FileError, FileReference, file_info, list_directory, read_file, read_many, render_file_content,
    render_file_info, render_listing, search_files,
};
use crate::history::{ClearOutcome, HistoryStore};
use crate::language::detect_language;
use crate::llm::{ChatRequest, ProviderRegistry, ProviderStatus};
use crate::render::{self, WorkingStatus};
use crate::util::truncate_preview;
use crate::workspace::Workspace;

const RECENT_HISTORY: usize = 10;
const PREVIEW_MODELS: usize = 5;

/// Outcome of routing one line of input.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Handled without the model; the text is shown as is.
    Local(String),
    Forward {
        prompt: String,
        files: Vec<FileReference>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Local(String),
    /// `streamed` answers have already been printed.
    Model { text: String, streamed: bool },
    Failed(String),
}

/// Session state: working directory, settings, transcript and provider adapters.
pub struct Assistant {
    workspace: Workspace,
    config: Config,
    config_path: Option<PathBuf>,
    history: HistoryStore,
    registry: ProviderRegistry,
}

impl Assistant {
    /// `config_path` is where `!set` and provider switches are persisted; `None`
    /// keeps every change in memory.
    pub fn new(workspace: Workspace, config: Config, config_path: Option<PathBuf>) -> Result<Self> {
        let mut history = HistoryStore::new(
            config.history_path(workspace.root()),
            config.history.max_entries,
            config.history.autosave_every,
        );
        match history.load() {
            Ok(count) => debug!(count, path = %history.path().display(), "history loaded"),
            Err(err) => warn!("starting with empty history: {err}"),
        }
        let registry = ProviderRegistry::from_config(&config).context("Failed to set up providers")?;
        Ok(Self {
            workspace,
            config,
            config_path,
            history,
            registry,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    #[cfg(test)]
    pub fn history_mut(&mut self) -> &mut HistoryStore {
        &mut self.history
    }

    pub fn status_line(&self) -> String {
        let provider = self.config.active_provider;
        let auth = match self.registry.status(provider) {
            ProviderStatus::Ready => "",
            ProviderStatus::MissingApiKey => " (no API key)",
        };
        format!(
            "Provider: {provider}{auth} | Model: {} | Streaming: {} | Root: {}",
            self.config.active_model,
            on_off(self.config.chat.streaming),
            self.workspace.root().display()
        )
    }

    /// Handles one line end to end: local commands answer directly, everything
    /// else goes to the active provider. History grows only on success.
    pub async fn chat(&mut self, input: &str) -> Reply {
        let (prompt, files) = match self.dispatch(input).await {
            Dispatch::Local(text) => return Reply::Local(text),
            Dispatch::Forward { prompt, files } => (prompt, files),
        };
        if !files.is_empty() {
            debug!(files = files.len(), "forwarding prompt with attached files");
        }

        let request = self.build_request(&prompt);
        let streamed = request.stream;
        let provider = self.registry.get(self.config.active_provider);
        let result = if streamed {
            render::ai_label();
            let (tx, rx) = mpsc::unbounded_channel();
            let call = async move {
                let answer = provider.send_request(&request, Some(&tx)).await;
                drop(tx);
                answer
            };
            let (answer, _) = tokio::join!(call, render::paced_print(rx, self.config.chat.delay()));
            answer
        } else {
            let status = WorkingStatus::start(format!("{} {}", provider.kind(), request.model));
            let answer = provider.send_request(&request, None).await;
            drop(status);
            answer
        };

        match result {
            Ok(text) => {
                if let Err(err) = self.history.add(input.trim(), text.as_str()) {
                    warn!("history autosave failed: {err}");
                }
                Reply::Model { text, streamed }
            }
            Err(err) => {
                warn!(provider = %self.config.active_provider, "request failed: {err}");
                Reply::Failed(err.to_string())
            }
        }
    }

    pub fn save_history(&mut self) -> Result<()> {
        self.history.save().context("Failed to save history")
    }

    fn build_request(&self, prompt: &str) -> ChatRequest {
        ChatRequest {
            model: self.config.active_model.clone(),
            system: self.config.system_prompt.clone(),
            prompt: self.with_context(prompt),
            stream: self.config.chat.streaming,
            temperature: self.config.chat.temperature,
        }
    }

    fn with_context(&self, prompt: &str) -> String {
        let recent = self.history.recent(self.config.chat.context_messages);
        if recent.is_empty() {
            return prompt.to_string();
        }
        let mut out = String::from("Previous messages:\n");
        for m in recent {
            out.push_str(&format!("User: {}\nAI: {}\n", m.user, truncate_preview(&m.response, 100)));
        }
        out.push_str(&format!("\nRequest: {prompt}"));
        out
    }

    pub async fn dispatch(&mut self, input: &str) -> Dispatch {
        let input = input.trim();
        if input.is_empty() {
            return Dispatch::Local("Enter a command or a question".to_string());
        }
        let mut parts = input.split_whitespace();
        let Some(first) = parts.next() else {
            return Dispatch::Local("Enter a command or a question".to_string());
        };
        let cmd = first.to_lowercase();
        let args: Vec<&str> = parts.collect();
        let rest = args.join(" ");
        debug!(%cmd, args = args.len(), "dispatch");

        let text = match cmd.as_str() {
            "!read" if args.is_empty() => usage("!read <file1> [file2] ..."),
            "!read" => self.read_command(&args),
            "!ls" | "!dir" => self.list_command(if rest.is_empty() { "." } else { &rest }),
            "!cd" if args.is_empty() => usage("!cd <path>"),
            "!cd" => self.cd_command(&rest),
            "!pwd" => format!("Current directory: {}", self.workspace.cwd().display()),
            "!info" if args.is_empty() => usage("!info <file>"),
            "!info" => self.info_command(&rest),
            "!analyze" if args.is_empty() => usage("!analyze <file1> [file2] ..."),
            "!analyze" => return self.analyze_command(&args),
            "!search" if args.is_empty() => usage("!search <pattern> [dir]"),
            "!search" => {
                let dir = if args.len() > 1 { args[1..].join(" ") } else { ".".to_string() };
                self.search_command(args[0], &dir)
            }
            "!history" => {
                if args.first().is_some_and(|a| a.eq_ignore_ascii_case("stats")) {
                    self.history.stats().render()
                } else {
                    self.history.render_recent(RECENT_HISTORY)
                }
            }
            "!export" => self.export_command(&rest),
            "!import" if args.is_empty() => usage("!import <file>"),
            "!import" => self.import_command(&rest),
            "!clear" => self.clear_command(args.first().is_some_and(|a| a.eq_ignore_ascii_case("confirm"))),
            "!save" => match self.history.save() {
                Ok(()) => format!("History saved to {}", self.history.path().display()),
                Err(err) => format!("Failed to save history: {err}"),
            },
            "!stream" => self.stream_command(args.first().copied()),
            "!speed" => self.speed_command(args.first().copied()),
            "!provider" => self.provider_command(args.first().copied()),
            "!model" if args.is_empty() => format!(
                "Current model: {}\n{}",
                self.config.active_model,
                usage("!model <name>")
            ),
            "!model" => {
                let model = args[0].to_string();
                self.config.active_model = model.clone();
                info!(model = %model, "model switched");
                self.persist_config(|stored| stored.active_model = model);
                format!("Model set to {}", self.config.active_model)
            }
            "!models" => self.models_command(args.first().copied()).await,
            "!set" if args.len() < 2 => usage("!set <provider> <api_key>"),
            "!set" => self.set_key_command(args[0], args[1]),
            "!test" => self.test_command(args.first().copied()).await,
            "!help" => help_text(),
            _ => return self.forward(input),
        };
        Dispatch::Local(text)
    }

    fn forward(&self, input: &str) -> Dispatch {
        match build_combined_query(&self.workspace, &self.config.files, input) {
            Some(query) => Dispatch::Forward {
                prompt: query.prompt,
                files: query.files,
            },
            None => Dispatch::Forward {
                prompt: input.to_string(),
                files: Vec::new(),
            },
        }
    }

    fn read_command(&self, args: &[&str]) -> String {
        let max = self.config.files.max_file_size;
        if let [single] = args {
            return match self
                .workspace
                .resolve(single)
                .map_err(FileError::from)
                .and_then(|p| read_file(&p, max))
            {
                Ok(content) => render_file_content(&self.workspace, &content),
                Err(err) => err.to_string(),
            };
        }

        let mut paths = Vec::new();
        let mut rejected = Vec::new();
        for raw in args {
            match self.workspace.resolve(raw) {
                Ok(p) => paths.push(p),
                Err(err) => rejected.push(format!("Skipped {raw}: {err}")),
            }
        }
        let mut out = read_many(&self.workspace, &paths, max);
        if !rejected.is_empty() {
            out.push('\n');
            out.push_str(&rejected.join("\n"));
        }
        out
    }

    fn list_command(&self, raw: &str) -> String {
        let listed = self
            .workspace
            .resolve(raw)
            .map_err(FileError::from)
            .and_then(|p| list_directory(&p).map(|entries| (p, entries)));
        match listed {
            Ok((path, entries)) => render_listing(&self.workspace, &path, &entries),
            Err(err) => err.to_string(),
        }
    }

    fn cd_command(&mut self, raw: &str) -> String {
        match self.workspace.change_dir(raw) {
            Ok(old) => {
                info!(from = %old.display(), to = %self.workspace.cwd().display(), "directory changed");
                format!(
                    "Directory changed:\n{} -> {}",
                    old.display(),
                    self.workspace.cwd().display()
                )
            }
            Err(err) => err.to_string(),
        }
    }

    fn info_command(&self, raw: &str) -> String {
        match self
            .workspace
            .resolve(raw)
            .map_err(FileError::from)
            .and_then(|p| file_info(&p))
        {
            Ok(details) => render_file_info(&details),
            Err(err) => err.to_string(),
        }
    }

    fn analyze_command(&self, args: &[&str]) -> Dispatch {
        let limit = self.config.files.max_files_per_query;
        if args.len() > limit {
            return Dispatch::Local(format!("Too many files to analyze. Maximum: {limit}"));
        }
        let mut paths = Vec::with_capacity(args.len());
        for raw in args {
            match self.workspace.resolve(raw) {
                Ok(p) => paths.push(p),
                Err(err) => return Dispatch::Local(err.to_string()),
            }
        }

        let max = self.config.files.max_file_size;
        if let [path] = paths.as_slice() {
            let content = match read_file(path, max) {
                Ok(c) => c,
                Err(err) => return Dispatch::Local(err.to_string()),
            };
            let prompt = single_file_review(&self.workspace.display_path(path), &content.text, path);
            return Dispatch::Forward {
                prompt,
                files: vec![content.reference],
            };
        }

        let files = paths
            .iter()
            .filter_map(|p| FileReference::from_path(p).ok())
            .collect();
        Dispatch::Forward {
            prompt: multi_file_review(&read_many(&self.workspace, &paths, max)),
            files,
        }
    }

    fn search_command(&self, pattern: &str, dir: &str) -> String {
        let found = self
            .workspace
            .resolve(dir)
            .map_err(FileError::from)
            .and_then(|p| search_files(&p, pattern).map(|files| (p, files)));
        let (dir, files) = match found {
            Ok(v) => v,
            Err(err) => return err.to_string(),
        };
        if files.is_empty() {
            return format!(
                "No files matching '{pattern}' in {}",
                self.workspace.display_path(&dir)
            );
        }

        let mut by_language: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
        for file in &files {
            by_language
                .entry(detect_language(file).name)
                .or_default()
                .push(self.workspace.display_path(file));
        }
        let mut out = format!("Found {} files matching '{pattern}':\n", files.len());
        for (language, mut names) in by_language {
            names.sort();
            out.push_str(&format!("\n{language} ({} files):\n", names.len()));
            for name in names {
                out.push_str(&format!("  - {name}\n"));
            }
        }
        out.trim_end().to_string()
    }

    fn export_command(&self, raw: &str) -> String {
        let name = if raw.is_empty() {
            format!("chat_export_{}.json", Local::now().format("%Y%m%d_%H%M%S"))
        } else {
            raw.to_string()
        };
        let path = match self.workspace.resolve(&name) {
            Ok(p) => p,
            Err(err) => return err.to_string(),
        };
        match self.history.export(&path) {
            Ok(count) => format!(
                "History exported to {} ({count} messages)",
                self.workspace.display_path(&path)
            ),
            Err(err) => format!("Export failed: {err}"),
        }
    }

    fn import_command(&mut self, raw: &str) -> String {
        let path = match self.workspace.resolve(raw) {
            Ok(p) => p,
            Err(err) => return err.to_string(),
        };
        match self.history.import(&path) {
            Ok(summary) => format!(
                "Imported {} messages (total: {})",
                summary.imported, summary.total
            ),
            Err(err) => format!("Import failed: {err}"),
        }
    }

    fn clear_command(&mut self, confirm: bool) -> String {
        match self.history.clear(confirm) {
            Ok(ClearOutcome::NeedsConfirmation) => format!(
                "This deletes {} messages. Use `!clear confirm` to proceed.",
                self.history.len()
            ),
            Ok(ClearOutcome::Cleared { removed }) => format!("History cleared ({removed} messages removed)"),
            Err(err) => format!("Failed to clear history: {err}"),
        }
    }

    fn stream_command(&mut self, mode: Option<&str>) -> String {
        let parsed = mode.and_then(|m| match m.to_lowercase().as_str() {
            "on" | "true" | "1" | "enable" => Some(true),
            "off" | "false" | "0" | "disable" => Some(false),
            _ => None,
        });
        match parsed {
            Some(enabled) => {
                self.config.chat.streaming = enabled;
                info!(enabled, "streaming toggled");
                format!("Streaming output {}", if enabled { "enabled" } else { "disabled" })
            }
            None => format!(
                "Streaming is {}\n{}",
                on_off(self.config.chat.streaming),
                usage("!stream on|off")
            ),
        }
    }

    fn speed_command(&mut self, raw: Option<&str>) -> String {
        let Some(raw) = raw else {
            return format!(
                "Current speed: {} s/char\n{}",
                self.config.chat.stream_delay,
                usage("!speed <seconds>")
            );
        };
        match raw.parse::<f64>() {
            Ok(v) if (MIN_STREAM_DELAY..=MAX_STREAM_DELAY).contains(&v) => {
                self.config.chat.stream_delay = v;
                format!("Output speed set to {v} s/char")
            }
            Ok(_) => format!("Speed must be between {MIN_STREAM_DELAY} and {MAX_STREAM_DELAY} seconds"),
            Err(_) => "Enter a number for the speed (for example: 0.02)".to_string(),
        }
    }

    fn provider_command(&mut self, name: Option<&str>) -> String {
        let Some(name) = name else {
            let mut out = format!(
                "Current provider: {} ({})\n",
                self.config.active_provider, self.config.active_model
            );
            for kind in ProviderKind::ALL {
                let status = match self.registry.status(kind) {
                    ProviderStatus::Ready => "ready",
                    ProviderStatus::MissingApiKey => "no API key",
                };
                out.push_str(&format!("  {kind}: {status}\n"));
            }
            out.push_str(&usage("!provider <ollama|openai|deepseek>"));
            return out;
        };
        let Some(kind) = ProviderKind::parse(name) else {
            return format!("Unknown provider: {name}. Available: ollama, openai, deepseek");
        };

        self.config.active_provider = kind;
        self.config.active_model = self.config.providers.get(kind).default_model.clone();
        info!(provider = %kind, model = %self.config.active_model, "provider switched");
        let model = self.config.active_model.clone();
        self.persist_config(|stored| {
            stored.active_provider = kind;
            stored.active_model = model;
        });

        let mut out = format!(
            "Switched to {kind} (model {})",
            self.config.active_model
        );
        if self.registry.status(kind) == ProviderStatus::MissingApiKey {
            let env = &self.config.providers.get(kind).api_key_env;
            out.push_str(&format!(
                "\n{kind} is configured but has no API key. Use: !set {kind} <api_key> (or export {env})"
            ));
        }
        out
    }

    async fn models_command(&self, name: Option<&str>) -> String {
        let kind = match name.map(|n| (n, ProviderKind::parse(n))) {
            None => self.config.active_provider,
            Some((_, Some(kind))) => kind,
            Some((n, None)) => return format!("Unknown provider: {n}. Available: ollama, openai, deepseek"),
        };
        match self.registry.get(kind).list_available_models().await {
            Ok(models) if models.is_empty() => format!("{kind} reports no models"),
            Ok(models) => {
                let mut out = format!("Models for {kind}:\n");
                for m in &models {
                    let mark = if kind == self.config.active_provider && *m == self.config.active_model {
                        "*"
                    } else {
                        " "
                    };
                    out.push_str(&format!("{mark} {m}\n"));
                }
                out.trim_end().to_string()
            }
            Err(err) => err.to_string(),
        }
    }

    fn set_key_command(&mut self, name: &str, key: &str) -> String {
        let Some(kind) = ProviderKind::parse(name) else {
            return format!("Unknown provider: {name}. Available: ollama, openai, deepseek");
        };
        if !kind.requires_api_key() {
            return format!("{kind} does not use an API key");
        }

        let provider = self.config.providers.get_mut(kind);
        provider.api_key = Some(key.to_string());
        let provider = provider.clone();
        if let Err(err) = self.registry.set_api_key(kind, &provider, key.to_string()) {
            return err.to_string();
        }
        info!(provider = %kind, "API key installed");

        match self.persist_config(|stored| stored.providers.get_mut(kind).api_key = Some(key.to_string())) {
            Some(path) => format!("API key for {kind} set and saved to {}", path.display()),
            None => format!("API key for {kind} set for this session"),
        }
    }

    async fn test_command(&self, name: Option<&str>) -> String {
        let kind = match name {
            None => self.config.active_provider,
            Some(n) => match ProviderKind::parse(n) {
                Some(kind) => kind,
                None => return format!("Unknown provider: {n}. Available: ollama, openai, deepseek"),
            },
        };
        match self.registry.get(kind).list_available_models().await {
            Ok(models) => {
                let preview: Vec<&str> = models.iter().take(PREVIEW_MODELS).map(String::as_str).collect();
                format!("{kind} available. Models: {}", preview.join(", "))
            }
            Err(err) => format!("{kind} unavailable: {err}"),
        }
    }

    /// Applies `change` to the stored config and writes it back when a path is
    /// attached. Other session settings stay out of the file. Returns the path
    /// on success.
    fn persist_config(&self, change: impl FnOnce(&mut Config)) -> Option<&Path> {
        let path = self.config_path.as_deref()?;
        let saved = Config::load_from_path(path).and_then(|mut stored| {
            change(&mut stored);
            stored.save_to_path(path)
        });
        match saved {
            Ok(()) => Some(path),
            Err(err) => {
                warn!("failed to save config: {err:#}");
                None
            }
        }
    }
}

fn usage(line: &str) -> String {
    format!("Usage: {line}")
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}

fn single_file_review(shown: &str, code: &str, path: &Path) -> String {
    let language = detect_language(path);
    format!(
        "Review the following {lang} code and give detailed recommendations.\n\n\
         File: {shown}\nLanguage: {lang}\n\n\
         ```{fence}\n{code}\n```\n\n\
         Cover:\n\
         1. Syntax errors\n\
         2. Code style and best practices\n\
         3. Potential bugs and vulnerabilities\n\
         4. Optimization opportunities\n\
         5. Quality of comments and documentation\n\n\
         Suggest concrete improvements with code examples.",
        lang = language.name,
        fence = language.fence,
        code = code.trim_end(),
    )
}

fn multi_file_review(contents: &str) -> String {
    format!(
        "Review the following files and give overall recommendations.\n\n\
         {contents}\n\n\
         Cover:\n\
         1. Relationships between the files\n\
         2. Overall project architecture\n\
         3. Code style and consistency\n\
         4. Potential integration problems\n\
         5. Refactoring opportunities\n\n\
         Give general advice for the project and specific advice for each file."
    )
}

fn help_text() -> String {
    [
        "Files:",
        "  !read <file1> [file2] ...     read one or more files",
        "  !analyze <file1> [file2] ...  ask the model to review files",
        "  !info <file>                  file details",
        "  !ls [path] / !dir [path]      list a directory",
        "  !cd <path>                    change directory (inside the root)",
        "  !pwd                          show current directory",
        "  !search <pattern> [dir]       find files by name or *.ext",
        "",
        "Combined queries:",
        "  read a.py b.py and explain the difference",
        "  прочитай a.py b.py и объясни разницу",
        "  analyze code in main.rs lib.rs",
        "  *.py describe the structure",
        "",
        "History:",
        "  !history [stats]              recent messages or statistics",
        "  !save                         save history now",
        "  !export [file]                export history",
        "  !import <file>                import history",
        "  !clear confirm                delete history",
        "",
        "Providers:",
        "  !provider [name]              show or switch provider (ollama, openai, deepseek)",
        "  !model [name]                 show or switch model",
        "  !models [provider]            list available models",
        "  !set <provider> <api_key>     install an API key",
        "  !test [provider]              check that a provider answers",
        "",
        "Output:",
        "  !stream on|off                toggle streaming output",
        "  !speed <seconds>              delay between streamed characters (0.001-0.1)",
        "",
        "exit, quit, !exit or выход ends the session.",
    ]
    .join("\n")
}
