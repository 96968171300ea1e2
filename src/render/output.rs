//! All-or-nothing file output
//!
//! Contents are first staged to temp files beside their targets. Existing
//! targets are then moved aside and the staged files renamed into place. If
//! any step fails, every target already replaced is restored from its backup
//! (or removed if it did not exist), so a commit either writes everything or
//! leaves the tree as it was.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::{Builder, TempPath};
use tracing::{debug, warn};

use super::RenderError;

/// Mode of ordinary outputs.
pub const FILE_MODE: u32 = 0o644;
/// Mode of credential outputs.
pub const PRIVATE_MODE: u32 = 0o600;

struct Pending {
    target: PathBuf,
    contents: Vec<u8>,
    mode: u32,
}

/// A set of files written together.
#[derive(Default)]
pub struct OutputTransaction {
    pending: Vec<Pending>,
}

impl OutputTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `contents` for `target`. A later write to the same target wins.
    pub fn write(&mut self, target: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) {
        self.write_with_mode(target, contents, FILE_MODE);
    }

    pub fn write_private(&mut self, target: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) {
        self.write_with_mode(target, contents, PRIVATE_MODE);
    }

    fn write_with_mode(&mut self, target: impl Into<PathBuf>, contents: impl Into<Vec<u8>>, mode: u32) {
        let target = target.into();
        self.pending.retain(|p| p.target != target);
        self.pending.push(Pending {
            target,
            contents: contents.into(),
            mode,
        });
    }

    pub fn targets(&self) -> impl Iterator<Item = &Path> {
        self.pending.iter().map(|p| p.target.as_path())
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Write every queued file, or none of them.
    pub fn commit(self) -> Result<Vec<PathBuf>, RenderError> {
        let mut staged = Vec::with_capacity(self.pending.len());
        for pending in &self.pending {
            staged.push((pending.target.clone(), stage(pending)?));
        }

        let mut replaced: Vec<(PathBuf, Option<TempPath>)> = Vec::new();
        for (target, temp) in staged {
            match swap_in(&target, temp) {
                Ok(backup) => replaced.push((target, backup)),
                Err(e) => {
                    rollback(replaced);
                    return Err(e);
                }
            }
        }

        let written: Vec<PathBuf> = replaced.into_iter().map(|(target, _backup)| target).collect();
        debug!(files = written.len(), "output transaction committed");
        Ok(written)
    }
}

fn io_error(path: &Path, e: impl std::fmt::Display) -> RenderError {
    RenderError::Write {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

fn parent_of(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn stage(pending: &Pending) -> Result<TempPath, RenderError> {
    let dir = parent_of(&pending.target);
    fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
    let mut temp = Builder::new()
        .prefix(".talm-stage-")
        .tempfile_in(dir)
        .map_err(|e| io_error(dir, e))?;
    temp.write_all(&pending.contents)
        .and_then(|()| temp.as_file().sync_all())
        .map_err(|e| io_error(&pending.target, e))?;
    set_mode(temp.path(), pending.mode)?;
    Ok(temp.into_temp_path())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), RenderError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| io_error(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), RenderError> {
    Ok(())
}

/// Move an existing target aside, then rename the staged file over it.
fn swap_in(target: &Path, staged: TempPath) -> Result<Option<TempPath>, RenderError> {
    let backup = if target.exists() {
        let dir = parent_of(target);
        let backup = Builder::new()
            .prefix(".talm-backup-")
            .tempfile_in(dir)
            .map_err(|e| io_error(dir, e))?
            .into_temp_path();
        fs::rename(target, &backup).map_err(|e| io_error(target, e))?;
        Some(backup)
    } else {
        None
    };

    if let Err(e) = staged.persist(target) {
        restore(target, backup);
        return Err(io_error(target, e.error));
    }
    Ok(backup)
}

fn restore(target: &Path, backup: Option<TempPath>) {
    let outcome = match backup {
        Some(backup) => backup.persist(target).map_err(|e| e.error),
        None => match fs::remove_file(target) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        },
    };
    if let Err(e) = outcome {
        warn!(path = %target.display(), error = %e, "failed to restore file after aborted write");
    }
}

fn rollback(replaced: Vec<(PathBuf, Option<TempPath>)>) {
    for (target, backup) in replaced.into_iter().rev() {
        restore(&target, backup);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_writes_all() {
        let dir = tempfile::tempdir().unwrap();
        let mut tx = OutputTransaction::new();
        tx.write(dir.path().join("a.yaml"), "a: 1\n");
        tx.write(dir.path().join("nodes/node1.yaml"), "b: 2\n");
        tx.write_private(dir.path().join("secrets.yaml"), "s: 3\n");
        let written = tx.commit().unwrap();
        assert_eq!(written.len(), 3);
        assert_eq!(fs::read_to_string(dir.path().join("nodes/node1.yaml")).unwrap(), "b: 2\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.path().join("secrets.yaml")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
            let mode = fs::metadata(dir.path().join("a.yaml")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o644);
        }

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".talm-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_later_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut tx = OutputTransaction::new();
        tx.write(dir.path().join("a"), "first");
        tx.write(dir.path().join("a"), "second");
        assert_eq!(tx.targets().count(), 1);
        tx.commit().unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("a")).unwrap(), "second");
    }

    #[test]
    fn test_failure_restores_originals() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("a.yaml");
        fs::write(&existing, "original\n").unwrap();
        // A directory in the way of the second target makes its rename fail.
        let blocked = dir.path().join("blocked");
        fs::create_dir_all(blocked.join("inner")).unwrap();

        let mut tx = OutputTransaction::new();
        tx.write(&existing, "replaced\n");
        tx.write(dir.path().join("fresh.yaml"), "new\n");
        tx.write(&blocked, "cannot replace a non-empty directory\n");
        assert!(tx.commit().is_err());

        assert_eq!(fs::read_to_string(&existing).unwrap(), "original\n");
        assert!(!dir.path().join("fresh.yaml").exists());
        assert!(blocked.join("inner").is_dir());
    }
}
