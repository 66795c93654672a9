use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use encoding_rs::{Encoding, UTF_8, WINDOWS_1251, WINDOWS_1252};
use thiserror::Error;

use crate::language::{Language, detect_language, is_supported_extension};
use crate::util::{format_file_size, format_system_time};
use crate::workspace::{PathError, Workspace};

#[derive(Debug, Error)]
pub enum FileError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("File not found: {0}")]
    NotFound(PathBuf),
    #[error("{0} is a directory, not a file")]
    IsDirectory(PathBuf),
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),
    #[error("File too large ({size} bytes), limit is {limit} bytes: {path}")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FileError {
    fn from_io(path: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => FileError::NotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => FileError::PermissionDenied(path.to_path_buf()),
            _ => FileError::Io {
                path: path.to_path_buf(),
                source: err,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileReference {
    pub path: PathBuf,
    pub language: Language,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl FileReference {
    pub fn from_path(path: &Path) -> Result<Self, FileError> {
        let meta = fs::metadata(path).map_err(|e| FileError::from_io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            language: detect_language(path),
            size: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct FileContent {
    pub reference: FileReference,
    pub text: String,
    pub encoding: &'static str,
    /// Set when no candidate encoding fit and invalid bytes were replaced.
    pub lossy: bool,
}

pub fn read_file(path: &Path, max_size: u64) -> Result<FileContent, FileError> {
    let meta = fs::metadata(path).map_err(|e| FileError::from_io(path, e))?;
    if meta.is_dir() {
        return Err(FileError::IsDirectory(path.to_path_buf()));
    }
    if meta.len() > max_size {
        return Err(FileError::TooLarge {
            path: path.to_path_buf(),
            size: meta.len(),
            limit: max_size,
        });
    }

    let bytes = fs::read(path).map_err(|e| FileError::from_io(path, e))?;
    let (text, encoding, lossy) = decode_text(&bytes);
    Ok(FileContent {
        reference: FileReference {
            path: path.to_path_buf(),
            language: detect_language(path),
            size: meta.len(),
            modified: meta.modified().ok(),
        },
        text,
        encoding,
        lossy,
    })
}

fn decode_text(bytes: &[u8]) -> (String, &'static str, bool) {
    if let Some((enc, bom_len)) = Encoding::for_bom(bytes)
        && let Some(text) = enc.decode_without_bom_handling_and_without_replacement(&bytes[bom_len..])
    {
        return (text.into_owned(), enc.name(), false);
    }
    for enc in [UTF_8, WINDOWS_1251, WINDOWS_1252] {
        if let Some(text) = enc.decode_without_bom_handling_and_without_replacement(bytes) {
            return (text.into_owned(), enc.name(), false);
        }
    }
    (String::from_utf8_lossy(bytes).into_owned(), UTF_8.name(), true)
}

pub fn render_file_content(ws: &Workspace, content: &FileContent) -> String {
    let r = &content.reference;
    let mut out = String::new();
    out.push_str(&format!("File: {}\n", ws.display_path(&r.path)));
    out.push_str(&format!("Size: {}\n", format_file_size(r.size)));
    if let Some(modified) = r.modified {
        out.push_str(&format!("Modified: {}\n", format_system_time(modified)));
    }
    out.push_str(&format!("Language: {}\n", r.language.name));
    if content.lossy {
        out.push_str("Note: unreadable characters were replaced\n");
    } else if content.encoding != UTF_8.name() {
        out.push_str(&format!("Encoding: {}\n", content.encoding));
    }
    out.push_str(&format!("```{}\n{}\n```", r.language.fence, content.text.trim_end()));
    out
}

/// Header plus one fenced block per file; per-file failures are reported inline.
pub fn read_many(ws: &Workspace, paths: &[PathBuf], max_size: u64) -> String {
    let mut total_size = 0u64;
    let mut languages = BTreeSet::new();
    let mut blocks = Vec::with_capacity(paths.len());

    for path in paths {
        let shown = ws.display_path(path);
        match read_file(path, max_size) {
            Ok(content) => {
                let r = &content.reference;
                total_size += r.size;
                languages.insert(r.language.name);
                blocks.push(format!(
                    "File: {} ({})\n```{}\n{}\n```\n",
                    shown,
                    r.language.name,
                    r.language.fence,
                    content.text.trim_end()
                ));
            }
            Err(err) => blocks.push(format!("Failed to read {}: {}\n", shown, err)),
        }
    }

    let mut out = format!(
        "Reading {} files\nTotal size: {}\nLanguages: {}\n\n",
        paths.len(),
        format_file_size(total_size),
        languages.into_iter().collect::<Vec<_>>().join(", ")
    );
    out.push_str(&blocks.join("\n"));
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Dir { children: Option<usize> },
    File { language: &'static str, size: u64, supported: bool },
    Inaccessible { is_dir: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub kind: EntryKind,
}

/// Immediate children only.
pub fn list_directory(path: &Path) -> Result<Vec<DirEntryInfo>, FileError> {
    let meta = fs::metadata(path).map_err(|e| FileError::from_io(path, e))?;
    if !meta.is_dir() {
        return Err(FileError::NotADirectory(path.to_path_buf()));
    }

    let entries = fs::read_dir(path).map_err(|e| FileError::from_io(path, e))?;
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let entry_path = entry.path();
        let kind = match fs::metadata(&entry_path) {
            Ok(m) if m.is_dir() => EntryKind::Dir {
                children: fs::read_dir(&entry_path).ok().map(|rd| rd.count()),
            },
            Ok(m) => EntryKind::File {
                language: detect_language(&entry_path).name,
                size: m.len(),
                supported: is_supported_extension(&entry_path),
            },
            Err(_) => EntryKind::Inaccessible {
                is_dir: entry_path.is_dir(),
            },
        };
        out.push(DirEntryInfo { name, kind });
    }

    out.sort_by(|a, b| {
        let rank = |e: &DirEntryInfo| match e.kind {
            EntryKind::Dir { .. } | EntryKind::Inaccessible { is_dir: true } => 0,
            _ => 1,
        };
        rank(a).cmp(&rank(b)).then_with(|| a.name.cmp(&b.name))
    });
    Ok(out)
}

pub fn render_listing(ws: &Workspace, path: &Path, entries: &[DirEntryInfo]) -> String {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    for e in entries {
        match &e.kind {
            EntryKind::Dir { children: Some(n) } => dirs.push(format!("  {}/ ({} items)", e.name, n)),
            EntryKind::Dir { children: None } => dirs.push(format!("  {}/ (no access)", e.name)),
            EntryKind::Inaccessible { is_dir: true } => dirs.push(format!("  {}/ (no access)", e.name)),
            EntryKind::Inaccessible { is_dir: false } => files.push(format!("  ? {} (no access)", e.name)),
            EntryKind::File {
                language,
                size,
                supported,
            } => {
                let mark = if *supported { "*" } else { "-" };
                files.push(format!("  {} {} ({}, {})", mark, e.name, language, format_file_size(*size)));
            }
        }
    }

    let mut out = format!("Contents of {}\nTotal entries: {}\n", ws.display_path(path), entries.len());
    if !dirs.is_empty() {
        out.push_str("\nDirectories:\n");
        out.push_str(&dirs.join("\n"));
        out.push('\n');
    }
    if !files.is_empty() {
        out.push_str("\nFiles:\n");
        out.push_str(&files.join("\n"));
        out.push('\n');
    }
    out.trim_end().to_string()
}

#[derive(Debug, Clone)]
pub struct FileDetails {
    pub reference: FileReference,
    pub created: Option<SystemTime>,
    pub is_dir: bool,
    pub mode: Option<u32>,
}

pub fn file_info(path: &Path) -> Result<FileDetails, FileError> {
    let meta = fs::metadata(path).map_err(|e| FileError::from_io(path, e))?;
    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        Some(meta.permissions().mode() & 0o777)
    };
    #[cfg(not(unix))]
    let mode = None;

    Ok(FileDetails {
        reference: FileReference {
            path: path.to_path_buf(),
            language: detect_language(path),
            size: meta.len(),
            modified: meta.modified().ok(),
        },
        created: meta.created().ok(),
        is_dir: meta.is_dir(),
        mode,
    })
}

pub fn render_file_info(details: &FileDetails) -> String {
    let r = &details.reference;
    let yes_no = |b: bool| if b { "yes" } else { "no" };
    let mut lines = vec![
        format!("Details for {}", r.path.display()),
        format!("Language: {}", r.language.name),
        format!("Size: {} bytes ({})", r.size, format_file_size(r.size)),
    ];
    if let Some(created) = details.created {
        lines.push(format!("Created: {}", format_system_time(created)));
    }
    if let Some(modified) = r.modified {
        lines.push(format!("Modified: {}", format_system_time(modified)));
    }
    lines.push(format!("Directory: {}", yes_no(details.is_dir)));
    lines.push(format!("File: {}", yes_no(!details.is_dir)));
    let ext = r.path.extension().and_then(|e| e.to_str()).unwrap_or("");
    lines.push(format!("Extension: {}", if ext.is_empty() { "(none)".to_string() } else { format!(".{ext}") }));
    if let Some(mode) = details.mode {
        lines.push(format!("Permissions: {:o}", mode));
    }
    lines.join("\n")
}

/// `*` and `*.*` match everything, `*.ext` matches by extension, anything
/// else is a case-insensitive substring of the file name.
pub fn matches_pattern(file_name: &str, pattern: &str) -> bool {
    if pattern == "*" || pattern == "*.*" {
        return true;
    }
    let name = file_name.to_lowercase();
    if let Some(ext) = pattern.strip_prefix("*.") {
        return name.ends_with(&format!(".{}", ext.to_lowercase()));
    }
    name.contains(&pattern.to_lowercase())
}

pub fn search_files(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, FileError> {
    if !dir.exists() {
        return Err(FileError::NotFound(dir.to_path_buf()));
    }
    if !dir.is_dir() {
        return Err(FileError::NotADirectory(dir.to_path_buf()));
    }
    Ok(walk(dir)
        .into_iter()
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| matches_pattern(n, pattern))
        })
        .collect())
}

pub fn find_by_extension(dir: &Path, ext: &str, limit: usize) -> Vec<PathBuf> {
    let pattern = format!("*.{ext}");
    walk(dir)
        .into_iter()
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| matches_pattern(n, &pattern))
        })
        .take(limit)
        .collect()
}

/// Regular files under `root`, skipping ignored directories. Symlinked
/// files count only when their target is inside `root`; symlinked
/// directories are not followed.
fn walk(root: &Path) -> Vec<PathBuf> {
    let real_root = fs::canonicalize(root).ok();
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        if path != root && is_ignored_dir(&path) {
            continue;
        }
        let Ok(meta) = fs::symlink_metadata(&path) else {
            continue;
        };
        if meta.is_dir() {
            let Ok(entries) = fs::read_dir(&path) else {
                continue;
            };
            for entry in entries.flatten() {
                stack.push(entry.path());
            }
        } else if meta.is_file() {
            out.push(path);
        } else if meta.file_type().is_symlink()
            && path.is_file()
            && let (Some(real_root), Ok(real)) = (&real_root, fs::canonicalize(&path))
            && real.starts_with(real_root)
        {
            out.push(path);
        }
    }
    out.sort();
    out
}

fn is_ignored_dir(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    matches!(
        name,
        ".git" | "node_modules" | "target" | ".idea" | ".vscode" | "__pycache__" | ".venv"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn oversize_file_fails_without_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.txt");
        fs::write(&path, "x".repeat(2048)).unwrap();

        match read_file(&path, 1024) {
            Err(FileError::TooLarge { size, limit, .. }) => {
                assert_eq!(size, 2048);
                assert_eq!(limit, 1024);
            }
            other => panic!("expected TooLarge, got {other:?}"),
        }
        assert!(read_file(&path, 2048).is_ok());
    }

    #[test]
    fn missing_and_directory_are_distinct_errors() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(read_file(&dir.path().join("nope.py"), 100), Err(FileError::NotFound(_))));
        assert!(matches!(read_file(dir.path(), 100), Err(FileError::IsDirectory(_))));
    }

    #[test]
    fn falls_back_to_windows_1251() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("legacy.txt");
        // "Привет" in cp1251
        fs::write(&path, [0xCF, 0xF0, 0xE8, 0xE2, 0xE5, 0xF2]).unwrap();

        let content = read_file(&path, 1024).unwrap();
        assert_eq!(content.text, "Привет");
        assert_eq!(content.encoding, "windows-1251");
        assert!(!content.lossy);
    }

    #[test]
    fn utf8_bom_is_stripped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bom.py");
        fs::write(&path, b"\xEF\xBB\xBFprint(1)").unwrap();
        let content = read_file(&path, 1024).unwrap();
        assert_eq!(content.text, "print(1)");
        assert_eq!(content.reference.language.name, "Python");
    }

    #[test]
    fn listing_is_non_recursive_and_dirs_first() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("pkg/inner")).unwrap();
        fs::write(dir.path().join("pkg/inner/deep.py"), "").unwrap();
        fs::write(dir.path().join("app.py"), "print()").unwrap();
        fs::write(dir.path().join("README"), "").unwrap();

        let entries = list_directory(dir.path()).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["pkg", "README", "app.py"]);
        assert_eq!(entries[0].kind, EntryKind::Dir { children: Some(1) });
        assert!(matches!(
            entries[2].kind,
            EntryKind::File { language: "Python", size: 7, supported: true }
        ));
    }

    #[test]
    fn listing_a_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "").unwrap();
        assert!(matches!(list_directory(&path), Err(FileError::NotADirectory(_))));
    }

    #[test]
    fn pattern_matching_rules() {
        assert!(matches_pattern("main.PY", "*.py"));
        assert!(!matches_pattern("main.pyc", "*.py"));
        assert!(matches_pattern("anything", "*"));
        assert!(matches_pattern("Config.toml", "config"));
    }

    #[test]
    fn extension_search_is_recursive_and_skips_ignored_dirs() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join("a.py"), "").unwrap();
        fs::write(dir.path().join("src/b.py"), "").unwrap();
        fs::write(dir.path().join(".git/c.py"), "").unwrap();
        fs::write(dir.path().join("notes.md"), "").unwrap();

        let found = find_by_extension(dir.path(), "py", 10);
        assert_eq!(found.len(), 2);
        assert_eq!(find_by_extension(dir.path(), "py", 1).len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn extension_search_follows_only_inner_symlinks() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        fs::write(dir.path().join("real.py"), "").unwrap();
        fs::write(outside.path().join("far.py"), "").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.py"), dir.path().join("alias.py")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("far.py"), dir.path().join("leak.py")).unwrap();

        let names: Vec<_> = find_by_extension(dir.path(), "py", 10)
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();
        assert_eq!(names, vec!["alias.py", "real.py"]);
    }

    #[test]
    fn read_many_reports_failures_inline() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        fs::write(dir.path().join("ok.rs"), "fn main() {}").unwrap();
        fs::write(dir.path().join("huge.rs"), "x".repeat(64)).unwrap();

        let out = read_many(
            &ws,
            &[ws.resolve("ok.rs").unwrap(), ws.resolve("huge.rs").unwrap()],
            32,
        );
        assert!(out.starts_with("Reading 2 files"));
        assert!(out.contains("```rust\nfn main() {}\n```"));
        assert!(out.contains("Failed to read huge.rs: File too large"));
    }
}
