use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::util::truncate_preview;

const CODE_KEYWORDS: &[&str] = &["код", "функци", "класс", "def ", "function", "code", "class", "fn "];

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Failed to access history file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Unsupported history format in {path}: {reason}")]
    Format { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub timestamp: String,
    pub user: String,
    #[serde(rename = "ai")]
    pub response: String,
}

impl Message {
    pub fn new(user: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now().to_rfc3339(),
            user: user.into(),
            response: response.into(),
        }
    }

    /// Accepts RFC 3339 as written by this crate and naive ISO-8601 as found in
    /// older transcripts.
    pub fn date(&self) -> Option<NaiveDate> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(&self.timestamp) {
            return Some(dt.with_timezone(&Local).date_naive());
        }
        NaiveDateTime::parse_from_str(&self.timestamp, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|dt| dt.date())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ExportFile {
    export_date: String,
    total_messages: usize,
    history: Vec<Message>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearOutcome {
    NeedsConfirmation,
    Cleared { removed: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryStats {
    pub total: usize,
    pub today: usize,
    pub code_related: usize,
    pub file: PathBuf,
    pub file_size: u64,
}

impl HistoryStats {
    pub fn render(&self) -> String {
        if self.total == 0 {
            return "History is empty".to_string();
        }
        let pct = self.code_related as f64 / self.total as f64 * 100.0;
        [
            "History stats:".to_string(),
            format!("Total messages: {}", self.total),
            format!("Messages today: {}", self.today),
            format!("Code questions: {} ({:.1}%)", self.code_related, pct),
            format!("History file: {}", self.file.display()),
            format!("File size: {} bytes", self.file_size),
        ]
        .join("\n")
    }
}

/// Append-only transcript persisted as a JSON array.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    max_entries: usize,
    autosave_every: usize,
    messages: Vec<Message>,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>, max_entries: usize, autosave_every: usize) -> Self {
        Self {
            path: path.into(),
            max_entries: max_entries.max(1),
            autosave_every,
            messages: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Returns the number of loaded messages. A missing file is an empty history.
    pub fn load(&mut self) -> Result<usize, HistoryError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no history file, starting empty");
            return Ok(0);
        }
        let text = fs::read_to_string(&self.path).map_err(|source| HistoryError::Io {
            path: self.path.clone(),
            source,
        })?;
        let value: Value = serde_json::from_str(&text).map_err(|source| HistoryError::Json {
            path: self.path.clone(),
            source,
        })?;
        if !value.is_array() {
            return Err(HistoryError::Format {
                path: self.path.clone(),
                reason: "expected a JSON array".to_string(),
            });
        }
        self.messages = parse_entries(&self.path, value)?;
        self.enforce_cap();
        info!(count = self.messages.len(), "history loaded");
        Ok(self.messages.len())
    }

    pub fn save(&mut self) -> Result<(), HistoryError> {
        self.enforce_cap();
        write_json(&self.path, &self.messages)
    }

    pub fn add(&mut self, user: impl Into<String>, response: impl Into<String>) -> Result<(), HistoryError> {
        self.messages.push(Message::new(user, response));
        self.enforce_cap();
        if self.autosave_every > 0 && self.messages.len() % self.autosave_every == 0 {
            debug!(count = self.messages.len(), "autosaving history");
            self.save()?;
        }
        Ok(())
    }

    pub fn export(&self, path: &Path) -> Result<usize, HistoryError> {
        let export = ExportFile {
            export_date: Local::now().to_rfc3339(),
            total_messages: self.messages.len(),
            history: self.messages.clone(),
        };
        write_json(path, &export)?;
        info!(path = %path.display(), count = export.total_messages, "history exported");
        Ok(export.total_messages)
    }

    /// Appends entries from a bare list or an export wrapper. On any error the
    /// current history is left as it was.
    pub fn import(&mut self, path: &Path) -> Result<ImportSummary, HistoryError> {
        let text = fs::read_to_string(path).map_err(|source| HistoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let value: Value = serde_json::from_str(&text).map_err(|source| HistoryError::Json {
            path: path.to_path_buf(),
            source,
        })?;

        let list = match value {
            list @ Value::Array(_) => list,
            Value::Object(mut map) => match map.remove("history") {
                Some(list @ Value::Array(_)) => list,
                Some(_) => {
                    return Err(HistoryError::Format {
                        path: path.to_path_buf(),
                        reason: "\"history\" is not a list".to_string(),
                    });
                }
                None => {
                    return Err(HistoryError::Format {
                        path: path.to_path_buf(),
                        reason: "missing \"history\" key".to_string(),
                    });
                }
            },
            _ => {
                return Err(HistoryError::Format {
                    path: path.to_path_buf(),
                    reason: "expected a list or an export object".to_string(),
                });
            }
        };

        let imported = parse_entries(path, list)?;
        let count = imported.len();
        let mut merged = self.messages.clone();
        merged.extend(imported);
        trim_to_cap(&mut merged, self.max_entries);
        write_json(&self.path, &merged)?;
        self.messages = merged;
        info!(imported = count, total = self.messages.len(), "history imported");
        Ok(ImportSummary {
            imported: count,
            total: self.messages.len(),
        })
    }

    pub fn clear(&mut self, confirm: bool) -> Result<ClearOutcome, HistoryError> {
        if !confirm {
            return Ok(ClearOutcome::NeedsConfirmation);
        }
        let removed = self.messages.len();
        self.messages.clear();
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|source| HistoryError::Io {
                path: self.path.clone(),
                source,
            })?;
        }
        info!(removed, "history cleared");
        Ok(ClearOutcome::Cleared { removed })
    }

    pub fn recent(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    pub fn render_recent(&self, n: usize) -> String {
        if self.messages.is_empty() {
            return "History is empty".to_string();
        }
        let mut out = String::from("Recent messages:\n");
        for (i, m) in self.recent(n).iter().enumerate() {
            out.push_str(&format!(
                "{}. [{}] you: {}\n",
                i + 1,
                m.timestamp,
                truncate_preview(&m.user, 80)
            ));
        }
        out.push_str(&format!("\nTotal messages: {}", self.messages.len()));
        out
    }

    pub fn stats(&self) -> HistoryStats {
        let today = Local::now().date_naive();
        HistoryStats {
            total: self.messages.len(),
            today: self
                .messages
                .iter()
                .filter(|m| m.date() == Some(today))
                .count(),
            code_related: self
                .messages
                .iter()
                .filter(|m| {
                    let lower = m.user.to_lowercase();
                    CODE_KEYWORDS.iter().any(|k| lower.contains(k))
                })
                .count(),
            file: self.path.clone(),
            file_size: fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0),
        }
    }

    fn enforce_cap(&mut self) {
        trim_to_cap(&mut self.messages, self.max_entries);
    }
}

fn trim_to_cap(messages: &mut Vec<Message>, max_entries: usize) {
    if messages.len() > max_entries {
        let excess = messages.len() - max_entries;
        messages.drain(..excess);
        debug!(dropped = excess, "history trimmed to cap");
    }
}

fn parse_entries(path: &Path, list: Value) -> Result<Vec<Message>, HistoryError> {
    serde_json::from_value(list).map_err(|e| HistoryError::Format {
        path: path.to_path_buf(),
        reason: format!("invalid entry: {e}"),
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), HistoryError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| HistoryError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let text = serde_json::to_string_pretty(value).map_err(|source| HistoryError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, text).map_err(|source| HistoryError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> HistoryStore {
        HistoryStore::new(dir.path().join("history.json"), 100, 10)
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let mut history = store(&dir);
        assert_eq!(history.load().unwrap(), 0);
        assert!(history.is_empty());
    }

    #[test]
    fn cap_drops_oldest_first() {
        let dir = TempDir::new().unwrap();
        let mut history = HistoryStore::new(dir.path().join("h.json"), 3, 0);
        for i in 0..5 {
            history.add(format!("q{i}"), format!("a{i}")).unwrap();
        }
        let users: Vec<_> = history.messages().iter().map(|m| m.user.as_str()).collect();
        assert_eq!(users, vec!["q2", "q3", "q4"]);
    }

    #[test]
    fn autosaves_every_n_messages() {
        let dir = TempDir::new().unwrap();
        let mut history = HistoryStore::new(dir.path().join("h.json"), 100, 2);
        history.add("one", "1").unwrap();
        assert!(!history.path().exists());
        history.add("two", "2").unwrap();
        assert!(history.path().exists());

        let mut reloaded = HistoryStore::new(history.path(), 100, 2);
        assert_eq!(reloaded.load().unwrap(), 2);
    }

    #[test]
    fn wire_format_uses_ai_key() {
        let m = Message::new("hi", "hello");
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["user"], "hi");
        assert_eq!(json["ai"], "hello");
        assert!(m.date().is_some());
    }

    #[test]
    fn naive_timestamps_are_understood() {
        let m = Message {
            timestamp: "2024-03-01T10:20:30.123456".to_string(),
            user: String::new(),
            response: String::new(),
        };
        assert_eq!(m.date(), NaiveDate::from_ymd_opt(2024, 3, 1));
    }

    #[test]
    fn clear_requires_confirmation() {
        let dir = TempDir::new().unwrap();
        let mut history = store(&dir);
        history.add("q", "a").unwrap();
        history.save().unwrap();

        assert_eq!(history.clear(false).unwrap(), ClearOutcome::NeedsConfirmation);
        assert_eq!(history.len(), 1);
        assert!(history.path().exists());

        assert_eq!(history.clear(true).unwrap(), ClearOutcome::Cleared { removed: 1 });
        assert!(history.is_empty());
        assert!(!history.path().exists());
    }

    #[test]
    fn export_then_import_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut source = store(&dir);
        source.add("first", "1").unwrap();
        source.add("second", "2").unwrap();
        let export_path = dir.path().join("export.json");
        assert_eq!(source.export(&export_path).unwrap(), 2);

        let exported: Value = serde_json::from_str(&fs::read_to_string(&export_path).unwrap()).unwrap();
        assert_eq!(exported["total_messages"], 2);
        assert!(exported["export_date"].is_string());

        let mut target = HistoryStore::new(dir.path().join("other.json"), 100, 10);
        target.add("existing", "x").unwrap();
        let summary = target.import(&export_path).unwrap();
        assert_eq!(summary, ImportSummary { imported: 2, total: 3 });
        assert_eq!(&target.messages()[1..], source.messages());
        assert!(target.path().exists());
    }

    #[test]
    fn import_accepts_bare_list() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bare.json");
        fs::write(
            &path,
            r#"[{"timestamp":"2024-01-01T00:00:00","user":"u","ai":"a"}]"#,
        )
        .unwrap();
        let mut history = store(&dir);
        assert_eq!(history.import(&path).unwrap().imported, 1);
    }

    #[test]
    fn bad_import_leaves_history_untouched() {
        let dir = TempDir::new().unwrap();
        let mut history = store(&dir);
        history.add("keep", "me").unwrap();

        let cases = [
            ("scalar.json", "42"),
            ("nokey.json", r#"{"messages": []}"#),
            ("notlist.json", r#"{"history": "nope"}"#),
            ("badentry.json", r#"[{"user": 1}]"#),
        ];
        for (name, body) in cases {
            let path = dir.path().join(name);
            fs::write(&path, body).unwrap();
            let err = history.import(&path).unwrap_err();
            assert!(matches!(err, HistoryError::Format { .. }), "{name}: {err}");
        }

        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{not json").unwrap();
        assert!(matches!(history.import(&broken), Err(HistoryError::Json { .. })));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn import_that_cannot_be_saved_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let blocked = dir.path().join("history_dir");
        fs::create_dir(&blocked).unwrap();
        let mut history = HistoryStore::new(&blocked, 100, 0);
        history.add("keep", "me").unwrap();

        let path = dir.path().join("import.json");
        fs::write(
            &path,
            r#"[{"timestamp":"2024-01-01T00:00:00","user":"u","ai":"a"}]"#,
        )
        .unwrap();
        assert!(matches!(history.import(&path), Err(HistoryError::Io { .. })));
        assert_eq!(history.len(), 1);
        assert_eq!(history.messages()[0].user, "keep");
    }

    #[test]
    fn stats_count_code_questions() {
        let dir = TempDir::new().unwrap();
        let mut history = store(&dir);
        history.add("объясни этот код", "...").unwrap();
        history.add("what's the weather", "...").unwrap();
        let stats = history.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.today, 2);
        assert_eq!(stats.code_related, 1);
        assert!(stats.render().contains("Code questions: 1 (50.0%)"));
    }

    #[test]
    fn recent_shows_tail() {
        let dir = TempDir::new().unwrap();
        let mut history = store(&dir);
        for i in 0..12 {
            history.add(format!("q{i}"), "a").unwrap();
        }
        assert_eq!(history.recent(10).len(), 10);
        assert_eq!(history.recent(10)[0].user, "q2");
        assert!(history.render_recent(10).ends_with("Total messages: 12"));
    }
}
