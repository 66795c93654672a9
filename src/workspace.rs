use std::fs;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("Path must not be empty")]
    Empty,
    #[error("Path {path} is outside the working root {root}")]
    OutsideRoot { path: PathBuf, root: PathBuf },
    #[error("Cannot resolve home directory for {0}")]
    NoHome(String),
    #[error("Path not found: {0}")]
    NotFound(PathBuf),
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),
}

/// Root-bounded view of the filesystem. `root` never changes; `cwd` moves
/// with `!cd` but always stays inside `root`.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    cwd: PathBuf,
}

impl Workspace {
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref();
        let root = if root.is_absolute() {
            normalize(root)
        } else {
            normalize(&std::env::current_dir()?.join(root))
        };
        Ok(Self {
            cwd: root.clone(),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn resolve(&self, input: &str) -> Result<PathBuf, PathError> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(PathError::Empty);
        }

        let expanded = expand_home(raw)?;
        let joined = if expanded.is_absolute() {
            expanded
        } else {
            self.cwd.join(expanded)
        };
        self.confine(normalize(&joined))
    }

    /// Accepts an absolute, already normalized path only if it stays inside
    /// the root, including after following symlinks on the way. For a path
    /// that does not exist yet the nearest existing ancestor is checked.
    pub fn confine(&self, path: PathBuf) -> Result<PathBuf, PathError> {
        if !path.starts_with(&self.root) {
            return Err(self.outside(path));
        }
        let Ok(real_root) = fs::canonicalize(&self.root) else {
            return Ok(path);
        };

        let mut existing = path.as_path();
        while fs::symlink_metadata(existing).is_err() {
            match existing.parent() {
                Some(parent) => existing = parent,
                None => break,
            }
        }
        match fs::canonicalize(existing) {
            Ok(real) if real.starts_with(&real_root) => Ok(path),
            _ => Err(self.outside(path)),
        }
    }

    /// Moves `cwd`, returning the previous directory.
    pub fn change_dir(&mut self, input: &str) -> Result<PathBuf, PathError> {
        let target = self.resolve(input)?;
        if !target.exists() {
            return Err(PathError::NotFound(target));
        }
        if !target.is_dir() {
            return Err(PathError::NotADirectory(target));
        }
        Ok(std::mem::replace(&mut self.cwd, target))
    }

    /// Path shown to the user: relative to the root when possible.
    pub fn display_path(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.display().to_string(),
            Err(_) => path.display().to_string(),
        }
    }

    fn outside(&self, path: PathBuf) -> PathError {
        PathError::OutsideRoot {
            path,
            root: self.root.clone(),
        }
    }
}

fn expand_home(raw: &str) -> Result<PathBuf, PathError> {
    if raw == "~" || raw.starts_with("~/") || raw.starts_with("~\\") {
        let home = dirs::home_dir().ok_or_else(|| PathError::NoHome(raw.to_string()))?;
        let rest = raw[1..].trim_start_matches(['/', '\\']);
        return Ok(if rest.is_empty() { home } else { home.join(rest) });
    }
    Ok(PathBuf::from(raw))
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace() -> (TempDir, Workspace) {
        let dir = TempDir::new().expect("tempdir");
        let ws = Workspace::new(dir.path()).expect("workspace");
        (dir, ws)
    }

    #[test]
    fn rejects_empty_input() {
        let (_dir, ws) = workspace();
        assert_eq!(ws.resolve("   "), Err(PathError::Empty));
    }

    #[test]
    fn rejects_traversal_after_normalization() {
        let (_dir, ws) = workspace();
        for input in ["../../etc/passwd", "a/../../x", "/etc/passwd", "./../"] {
            let err = ws.resolve(input).unwrap_err();
            assert!(matches!(err, PathError::OutsideRoot { .. }), "{input}");
        }
    }

    #[test]
    fn dotdot_that_stays_inside_is_accepted() {
        let (dir, ws) = workspace();
        let resolved = ws.resolve("sub/../main.py").expect("inside");
        assert_eq!(resolved, normalize(&dir.path().join("main.py")));
        assert!(resolved.starts_with(ws.root()));
    }

    #[test]
    fn sibling_with_common_prefix_is_outside() {
        let (dir, ws) = workspace();
        let name = dir.path().file_name().unwrap().to_string_lossy().to_string();
        let sibling = format!("../{name}-other/file.txt");
        assert!(ws.resolve(&sibling).is_err());
    }

    #[test]
    fn change_dir_moves_cwd_within_root() {
        let (dir, mut ws) = workspace();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), "").unwrap();

        ws.change_dir("src").expect("cd src");
        assert_eq!(ws.resolve("lib.rs").unwrap(), normalize(&dir.path().join("src/lib.rs")));

        ws.change_dir("..").expect("cd back to root");
        assert_eq!(ws.cwd(), ws.root());
        assert!(ws.change_dir("..").is_err());
        assert!(matches!(ws.change_dir("src/lib.rs"), Err(PathError::NotADirectory(_))));
        assert!(matches!(ws.change_dir("missing"), Err(PathError::NotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escaping_root_is_rejected() {
        let (dir, ws) = workspace();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();
        assert!(matches!(ws.resolve("escape"), Err(PathError::OutsideRoot { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn new_file_under_escaping_symlink_is_rejected() {
        let (dir, ws) = workspace();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("gone.json"), dir.path().join("dangling")).unwrap();

        for input in ["escape/new.json", "escape/deeper/new.json", "dangling"] {
            assert!(
                matches!(ws.resolve(input), Err(PathError::OutsideRoot { .. })),
                "{input}"
            );
        }
        assert!(ws.resolve("fresh/new.json").is_ok());
    }
}
