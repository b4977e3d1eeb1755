use std::io;
use std::path::{Component, Path, PathBuf};

/// Enforces workspace-scoped write access for worker capabilities.
/// Reads resolve relative to the workspace; writes must stay inside it.
#[derive(Clone, Debug)]
pub struct WorkspaceGuard {
    /// Canonical (absolute, symlinks resolved) workspace root.
    canonical_root: PathBuf,
}

impl WorkspaceGuard {
    /// Create a new guard for the given workspace path.
    /// Creates the directory if it doesn't exist and resolves to canonical path.
    pub fn new(workspace_path: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(workspace_path)?;
        let canonical_root = std::fs::canonicalize(workspace_path)?;
        Ok(Self { canonical_root })
    }

    /// Resolve a tool-supplied path: relative paths are joined onto the
    /// workspace root, absolute paths are used as-is.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.canonical_root.join(candidate)
        }
    }

    /// Check if a write to the given path is allowed.
    /// Resolves symlinks to prevent escape via symlink traversal. A target
    /// whose parent directory does not exist is rejected.
    pub fn is_write_allowed(&self, target: &Path) -> io::Result<bool> {
        let canonical = if target.exists() {
            std::fs::canonicalize(target)?
        } else {
            let parent = target
                .parent()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
            if parent.exists() {
                let canonical_parent = std::fs::canonicalize(parent)?;
                canonical_parent.join(target.file_name().unwrap_or_default())
            } else {
                return Ok(false);
            }
        };

        Ok(canonical.starts_with(&self.canonical_root))
    }

    /// Resolve a read target. It must exist and, with symlinks resolved,
    /// lie inside the workspace.
    pub fn resolve_read(&self, path: &str) -> io::Result<PathBuf> {
        let target = self.resolve(path);
        if target.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(denied(path));
        }
        let canonical = std::fs::canonicalize(&target)?;
        if !canonical.starts_with(&self.canonical_root) {
            return Err(denied(path));
        }
        Ok(canonical)
    }

    /// Resolve a write target and create its missing parent directories.
    ///
    /// `..` components are rejected outright. Directories are only created
    /// when the nearest existing ancestor lies inside the workspace, and the
    /// final target is re-checked after creation to catch symlinked parents.
    pub fn prepare_write(&self, path: &str) -> io::Result<PathBuf> {
        let target = self.resolve(path);
        if target.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(denied(path));
        }

        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
        let mut ancestor = parent;
        while !ancestor.exists() {
            ancestor = ancestor.parent().ok_or_else(|| denied(path))?;
        }
        if !std::fs::canonicalize(ancestor)?.starts_with(&self.canonical_root) {
            return Err(denied(path));
        }

        std::fs::create_dir_all(parent)?;
        if !self.is_write_allowed(&target)? {
            return Err(denied(path));
        }
        Ok(target)
    }

    /// Express an absolute path relative to the workspace root, if inside it.
    pub fn relative(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.canonical_root)
            .ok()
            .map(|p| p.to_string_lossy().into_owned())
    }

    /// Get the canonical workspace root path.
    pub fn canonical_root(&self) -> &Path {
        &self.canonical_root
    }
}

fn denied(path: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("path '{path}' is outside the workspace directory"),
    )
}
