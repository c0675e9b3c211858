//! Workspace manager.
//!
//! Owns the single on-disk working directory shared by all executions.
//! Every filesystem mutation made on behalf of a caller goes through here,
//! and every caller-supplied path is resolved against the root with
//! symlinks and `..` applied before the containment check.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use sandbox_core::{Config, Language};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("workspace busy: {running} execution(s) running")]
    Busy { running: usize },
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

fn invalid(path: &str, reason: impl Into<String>) -> WorkspaceError {
    WorkspaceError::InvalidPath {
        path: path.to_string(),
        reason: reason.into(),
    }
}

/// Outcome of a workspace reset.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ResetReport {
    pub removed: usize,
    pub kept: Vec<String>,
}

/// The workspace root and its policy.
#[derive(Debug)]
pub struct Workspace {
    /// Canonical root path.
    root: PathBuf,
    /// Top-level entry names preserved by `reset`.
    reserved: Vec<String>,
    mode: u32,
}

impl Workspace {
    /// Open the workspace at `root`, creating it on first use.
    pub fn open(root: impl AsRef<Path>, reserved: Vec<String>, mode: u32) -> Result<Self> {
        let requested = root.as_ref().to_path_buf();
        let mut workspace = Self {
            root: requested,
            reserved,
            mode,
        };
        workspace.ensure_exists()?;
        workspace.root = std::fs::canonicalize(&workspace.root)?;
        info!(root = %workspace.root.display(), "workspace ready");
        Ok(workspace)
    }

    /// Open the workspace described by the daemon config.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::open(
            &config.workspace_root,
            config.reserved_entries.clone(),
            config.workspace_mode,
        )
    }

    /// Create the root with its permission policy if it does not exist.
    ///
    /// Idempotent: an existing root is left as it is.
    pub fn ensure_exists(&self) -> Result<()> {
        if self.root.is_dir() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.root)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.root, std::fs::Permissions::from_mode(self.mode))?;
        }
        info!(
            root = %self.root.display(),
            mode = format!("{:o}", self.mode),
            "created workspace root"
        );
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a caller-supplied path to an absolute path inside the root.
    ///
    /// Relative paths are taken from the root; absolute paths must already
    /// point inside it. Existing components are canonicalized as they are
    /// walked, so a symlink pointing outside the root is rejected even when
    /// followed by `..`.
    pub fn resolve(&self, subpath: &str) -> Result<PathBuf> {
        if subpath.contains('\0') {
            return Err(invalid(subpath, "contains a NUL byte"));
        }

        let requested = Path::new(subpath);
        let (mut current, rest) = if requested.is_absolute() {
            (PathBuf::from("/"), requested)
        } else {
            (self.root.clone(), requested)
        };

        for component in rest.components() {
            match component {
                Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
                Component::ParentDir => {
                    current.pop();
                }
                Component::Normal(name) => {
                    current.push(name);
                    if std::fs::symlink_metadata(&current).is_ok() {
                        current = std::fs::canonicalize(&current).map_err(|e| {
                            invalid(subpath, format!("cannot resolve {}: {e}", current.display()))
                        })?;
                    }
                }
            }
        }

        if !current.starts_with(&self.root) {
            warn!(path = subpath, resolved = %current.display(), "rejected path outside workspace");
            return Err(invalid(subpath, "resolves outside the workspace root"));
        }
        Ok(current)
    }

    /// Resolve a working directory for an execution, creating it if missing.
    pub fn prepare_dir(&self, subpath: &str) -> Result<PathBuf> {
        let dir = self.resolve(subpath)?;
        if dir.exists() {
            if !dir.is_dir() {
                return Err(invalid(subpath, "is not a directory"));
            }
        } else {
            std::fs::create_dir_all(&dir)?;
            debug!(dir = %dir.display(), "created working directory");
        }
        Ok(dir)
    }

    /// Remove everything under the root except reserved entries.
    ///
    /// `running` is the number of executions currently running; the caller
    /// must keep that number stable for the duration of the call.
    pub fn reset(&self, running: usize) -> Result<ResetReport> {
        if running > 0 {
            return Err(WorkspaceError::Busy { running });
        }

        let mut report = ResetReport::default();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            if self.is_reserved(&name) {
                report.kept.push(name.to_string_lossy().into_owned());
                continue;
            }
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
            report.removed += 1;
        }

        info!(
            root = %self.root.display(),
            removed = report.removed,
            kept = report.kept.len(),
            "workspace reset"
        );
        Ok(report)
    }

    fn is_reserved(&self, name: &OsStr) -> bool {
        self.reserved.iter().any(|r| OsStr::new(r) == name)
    }

    /// Write a file inside the workspace, creating parent directories.
    pub fn write_file(&self, path: &str, content: &[u8]) -> Result<PathBuf> {
        let target = self.resolve(path)?;
        if target == self.root || target.is_dir() {
            return Err(invalid(path, "is a directory"));
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, content)?;
        debug!(path = %target.display(), bytes = content.len(), "wrote file");
        Ok(target)
    }

    /// Read a file inside the workspace.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.resolve(path)?;
        if !target.exists() {
            return Err(WorkspaceError::NotFound(path.to_string()));
        }
        if target.is_dir() {
            return Err(invalid(path, "is a directory"));
        }
        Ok(std::fs::read(&target)?)
    }

    /// Write a code snippet to a uniquely named script file in the root.
    ///
    /// Returns the file name relative to the root.
    pub fn write_script(&self, language: Language, code: &str) -> Result<String> {
        let id = Uuid::now_v7().simple().to_string();
        // The tail of a v7 id is random; the head is the timestamp.
        let suffix = &id[id.len() - 8..];
        let file_name = format!("_run_{suffix}{}", language.extension());
        self.write_file(&file_name, code.as_bytes())?;
        Ok(file_name)
    }
}
