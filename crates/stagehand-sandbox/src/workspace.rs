use std::io;
use std::path::{Component, Path, PathBuf};

use stagehand_protocol::{ExecutionError, ExecutionResult};

/// A directory every file operation of a sandbox is confined to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceRoot {
    root: PathBuf,
}

impl WorkspaceRoot {
    /// Create the directory if needed and pin its canonical location.
    pub fn prepare(root: impl AsRef<Path>) -> ExecutionResult<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root).map_err(|e| {
            ExecutionError::sandbox_with(format!("failed to create workspace {}", root.display()), e)
        })?;
        let root = root.canonicalize().map_err(|e| {
            ExecutionError::sandbox_with(
                format!("failed to canonicalize workspace {}", root.display()),
                e,
            )
        })?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Map a requested path onto the workspace.
    ///
    /// Relative paths are taken from the root; absolute paths must already
    /// point inside it. `..` is folded lexically and symlinks, dangling ones
    /// included, are followed to their target, so neither can be used to escape.
    pub fn resolve(&self, requested: &str) -> ExecutionResult<PathBuf> {
        let requested_path = Path::new(requested);
        let joined = if requested_path.is_absolute() {
            requested_path.to_path_buf()
        } else {
            self.root.join(requested_path)
        };
        let normalized = normalize(&joined);
        let resolved = canonicalize_existing_prefix(&normalized).map_err(|e| {
            ExecutionError::sandbox_with(format!("failed to resolve {requested}"), e)
        })?;
        if !resolved.starts_with(&self.root) {
            return Err(ExecutionError::PermissionDenied(format!(
                "{requested} resolves outside the workspace"
            )));
        }
        Ok(resolved)
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Symlink hops followed through dangling links before giving up.
const MAX_LINK_HOPS: usize = 40;

fn canonicalize_existing_prefix(path: &Path) -> io::Result<PathBuf> {
    follow_existing_prefix(path, MAX_LINK_HOPS)
}

fn follow_existing_prefix(path: &Path, hops_left: usize) -> io::Result<PathBuf> {
    let mut existing = path;
    let mut rest = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(canonical) => return Ok(append_rest(canonical, &rest)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // A dangling link is still a link: writing through it lands
                // wherever it points, so resolve its target instead.
                if existing.symlink_metadata().is_ok_and(|m| m.file_type().is_symlink()) {
                    if hops_left == 0 {
                        return Err(io::Error::other("too many levels of symbolic links"));
                    }
                    let target = std::fs::read_link(existing)?;
                    let target = match existing.parent() {
                        Some(parent) if target.is_relative() => parent.join(target),
                        _ => target,
                    };
                    let resolved = follow_existing_prefix(&normalize(&target), hops_left - 1)?;
                    return Ok(append_rest(resolved, &rest));
                }
                let Some(name) = existing.file_name() else {
                    return Err(e);
                };
                rest.push(name.to_owned());
                existing = match existing.parent() {
                    Some(parent) => parent,
                    None => return Err(e),
                };
            }
            Err(e) => return Err(e),
        }
    }
}

fn append_rest(mut resolved: PathBuf, rest: &[std::ffi::OsString]) -> PathBuf {
    for part in rest.iter().rev() {
        resolved.push(part);
    }
    resolved
}
