use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::config::FileSettings;
use crate::fs_tools::{FileReference, find_by_extension, read_many};
use crate::util::collapse_whitespace;
use crate::workspace::Workspace;

static GLOB_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\.([A-Za-z0-9]+)").expect("glob regex"));

/// Natural-language ways of pointing at files, tried in order. Group 1 holds
/// the candidate tokens.
static FILE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)!read\s+(.+)",
        r"(?i)прочитай\s+(.+)",
        r"(?i)\bread\s+(.+)",
        r"(?i)анализ\s+(?:кода\s+)?в\s+(.+)",
        r"(?i)\banaly[sz]e\s+(?:(?:the\s+)?code\s+)?in\s+(.+)",
        r"(?i)файл[а-яё]*\s+(.+)",
        r"(?i)\bfiles?\s+(.+)",
        r"([\w\-.]+\.[A-Za-z0-9]+(?:\s+[\w\-.]+\.[A-Za-z0-9]+)*)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("file pattern"))
    .collect()
});

#[derive(Debug, Clone)]
pub struct CombinedQuery {
    /// Full text sent to the model.
    pub prompt: String,
    pub manifest: String,
    pub files: Vec<FileReference>,
    /// User text with file tokens removed.
    pub cleaned: String,
    pub glob: Option<String>,
}

/// Looks for file references in free text. `None` means nothing matched and
/// the input should be forwarded as is.
pub fn build_combined_query(ws: &Workspace, limits: &FileSettings, input: &str) -> Option<CombinedQuery> {
    if let Some(m) = GLOB_RE.captures(input) {
        let glob = m.get(0).map(|g| g.as_str().to_string()).unwrap_or_default();
        let ext = m.get(1).map(|e| e.as_str()).unwrap_or_default();
        let found: Vec<PathBuf> = find_by_extension(ws.cwd(), ext, limits.max_files_per_query)
            .into_iter()
            .filter_map(|p| ws.confine(p).ok())
            .collect();
        if !found.is_empty() {
            debug!(%glob, count = found.len(), "glob matched files");
            let cleaned = collapse_whitespace(&input.replacen(&glob, " ", 1));
            return Some(assemble(ws, limits, found, cleaned, Some(glob)));
        }
    }

    for pattern in FILE_PATTERNS.iter() {
        let mut tokens: Vec<String> = Vec::new();
        let mut paths: Vec<PathBuf> = Vec::new();
        for caps in pattern.captures_iter(input) {
            let Some(group) = caps.get(1) else {
                continue;
            };
            for raw in group.as_str().split_whitespace() {
                let token = trim_token(raw);
                if token.is_empty() {
                    continue;
                }
                let Ok(path) = ws.resolve(token) else {
                    continue;
                };
                if !path.is_file() {
                    continue;
                }
                if !tokens.iter().any(|t| t == token) {
                    tokens.push(token.to_string());
                }
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        if paths.is_empty() {
            continue;
        }

        debug!(pattern = pattern.as_str(), count = paths.len(), "file references found");
        let cleaned = input
            .split_whitespace()
            .filter(|w| !tokens.iter().any(|t| t == trim_token(w)))
            .collect::<Vec<_>>()
            .join(" ");
        paths.truncate(limits.max_files_per_query);
        return Some(assemble(ws, limits, paths, cleaned, None));
    }

    None
}

fn assemble(
    ws: &Workspace,
    limits: &FileSettings,
    paths: Vec<PathBuf>,
    cleaned: String,
    glob: Option<String>,
) -> CombinedQuery {
    let names: Vec<String> = paths.iter().map(|p| ws.display_path(p)).collect();
    let mut manifest = match &glob {
        Some(g) => format!("Found {} files matching '{}':\n", paths.len(), g),
        None => format!("Processing {} files:\n", paths.len()),
    };
    for name in &names {
        manifest.push_str(&format!("  - {name}\n"));
    }
    manifest.push('\n');

    let contents = read_many(ws, &paths, limits.max_file_size);
    let prompt = format!("{manifest}{contents}\n\nUser request: {cleaned}");
    let files = paths
        .iter()
        .filter_map(|p| FileReference::from_path(p).ok())
        .collect();

    CombinedQuery {
        prompt,
        manifest,
        files,
        cleaned,
        glob,
    }
}

fn trim_token(raw: &str) -> &str {
    raw.trim_matches(|c: char| {
        matches!(
            c,
            '"' | '\'' | '`' | ',' | ';' | ':' | '!' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '«' | '»'
        )
    })
    .trim_end_matches('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup(files: &[&str]) -> (TempDir, Workspace) {
        let dir = TempDir::new().unwrap();
        for f in files {
            let path = dir.path().join(f);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&path, format!("# {f}\n")).unwrap();
        }
        let ws = Workspace::new(dir.path()).unwrap();
        (dir, ws)
    }

    #[test]
    fn russian_read_request_with_two_files() {
        let (_dir, ws) = setup(&["a.py", "b.py"]);
        let q = build_combined_query(&ws, &FileSettings::default(), "прочитай a.py b.py и объясни разницу")
            .expect("files found");

        assert_eq!(q.files.len(), 2);
        assert_eq!(q.cleaned, "прочитай и объясни разницу");
        assert!(q.manifest.starts_with("Processing 2 files:"));
        assert_eq!(q.manifest.lines().filter(|l| l.starts_with("  - ")).count(), 2);
        assert!(q.prompt.contains("# a.py"));
        assert!(q.prompt.contains("# b.py"));
        assert!(q.prompt.ends_with("User request: прочитай и объясни разницу"));
    }

    #[test]
    fn glob_selects_only_matching_extension() {
        let (_dir, ws) = setup(&["one.py", "two.py", "pkg/three.py", "notes.md", "data.json"]);
        let q = build_combined_query(&ws, &FileSettings::default(), "*.py расскажи про структуру")
            .expect("glob matched");

        assert_eq!(q.files.len(), 3);
        assert!(
            q.files
                .iter()
                .all(|f| f.path.extension().and_then(|e| e.to_str()) == Some("py"))
        );
        assert_eq!(q.glob.as_deref(), Some("*.py"));
        assert_eq!(q.cleaned, "расскажи про структуру");
    }

    #[test]
    fn glob_respects_file_limit() {
        let (_dir, ws) = setup(&["a.rs", "b.rs", "c.rs"]);
        let limits = FileSettings {
            max_files_per_query: 2,
            ..FileSettings::default()
        };
        let q = build_combined_query(&ws, &limits, "*.rs review").unwrap();
        assert_eq!(q.files.len(), 2);
    }

    #[test]
    fn bare_file_names_with_punctuation() {
        let (_dir, ws) = setup(&["main.rs", "lib.rs"]);
        let q = build_combined_query(&ws, &FileSettings::default(), "compare main.rs, lib.rs please").unwrap();
        assert_eq!(q.files.len(), 2);
        assert_eq!(q.cleaned, "compare please");
    }

    #[test]
    fn plain_text_and_version_numbers_pass_through() {
        let (_dir, ws) = setup(&["a.py"]);
        let limits = FileSettings::default();
        assert!(build_combined_query(&ws, &limits, "how do closures work?").is_none());
        assert!(build_combined_query(&ws, &limits, "upgrade to v1.2 and python 3.11").is_none());
        assert!(build_combined_query(&ws, &limits, "*.go files overview").is_none());
    }

    #[test]
    fn files_outside_root_are_ignored() {
        let (dir, _ws) = setup(&["inner/x.py", "secret.py"]);
        let rooted = Workspace::new(dir.path().join("inner")).unwrap();

        let q = build_combined_query(&rooted, &FileSettings::default(), "прочитай x.py ../secret.py").unwrap();
        assert_eq!(q.files.len(), 1);
        assert!(q.files[0].path.ends_with("x.py"));
        assert!(!q.prompt.contains("# secret.py"));

        let token = dir.path().join("secret.py").display().to_string();
        assert!(build_combined_query(&rooted, &FileSettings::default(), &format!("read {token}")).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn glob_skips_symlinks_leading_outside_root() {
        let (dir, ws) = setup(&["notes.txt"]);
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret.txt"), "TOP-SECRET").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), dir.path().join("leak.txt")).unwrap();

        let q = build_combined_query(&ws, &FileSettings::default(), "*.txt summarize").unwrap();
        assert_eq!(q.files.len(), 1);
        assert!(q.files[0].path.ends_with("notes.txt"));
        assert!(!q.prompt.contains("TOP-SECRET"));

        assert!(build_combined_query(&ws, &FileSettings::default(), "read leak.txt").is_none());
    }

    #[test]
    fn first_matching_pattern_wins() {
        let (_dir, ws) = setup(&["a.py", "b.py"]);
        // "прочитай" matches before the bare-name pattern would add b.py.
        let q = build_combined_query(&ws, &FileSettings::default(), "b.py? прочитай a.py").unwrap();
        assert_eq!(q.files.len(), 1);
        assert!(q.files[0].path.ends_with("a.py"));
        assert_eq!(q.cleaned, "b.py? прочитай");
    }
}
