//! Per-run workspace directories.

use crate::error::{Result, SandboxError};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

const DIR_PREFIX: &str = "run-";

/// Owns the directory under which every run gets its own workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

/// One staged run directory holding exactly one source file.
///
/// Must be released with [`Workspace::destroy`]; a workspace dropped without
/// it is removed synchronously as a last resort.
#[derive(Debug)]
pub struct Workspace {
    id: Uuid,
    dir: PathBuf,
    source: PathBuf,
    released: bool,
}

impl WorkspaceManager {
    /// Create the root if needed. The root is canonicalized because the
    /// sandbox runtime bind-mounts workspaces by absolute path.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root).map_err(SandboxError::io("create workspace root"))?;
        let root = root.canonicalize().map_err(SandboxError::io("resolve workspace root"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the workspace directory for `id` and write `source_code` into `file_name`.
    pub async fn stage(&self, id: Uuid, file_name: &str, source_code: &str) -> Result<Workspace> {
        let dir = self.root.join(format!("{DIR_PREFIX}{}", id.simple()));
        let source = dir.join(file_name);
        let code = source_code.to_owned();

        let staged = {
            let dir = dir.clone();
            let source = source.clone();
            tokio::task::spawn_blocking(move || write_workspace(&dir, &source, &code))
        }
        .await
        .map_err(|e| SandboxError::Io {
            context: "stage workspace",
            source: io::Error::new(io::ErrorKind::Other, e),
        })?;

        staged?;
        debug!(workspace = %dir.display(), bytes = source_code.len(), "Workspace staged");
        Ok(Workspace {
            id,
            dir,
            source,
            released: false,
        })
    }

    /// Remove run directories left behind by a previous process.
    pub fn sweep(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(DIR_PREFIX) {
                continue;
            }
            match remove_dir(&entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to sweep stale workspace"),
            }
        }
        if removed > 0 {
            info!(removed, root = %self.root.display(), "Swept stale workspaces");
        }
        removed
    }
}

impl Workspace {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn source_path(&self) -> &Path {
        &self.source
    }

    /// Remove the directory. Tolerates it being gone already.
    pub async fn destroy(mut self) -> Result<()> {
        self.released = true;
        let dir = self.dir.clone();
        let removed = tokio::task::spawn_blocking(move || remove_dir(&dir))
            .await
            .map_err(|e| SandboxError::Io {
                context: "destroy workspace",
                source: io::Error::new(io::ErrorKind::Other, e),
            })?;
        removed.map_err(SandboxError::io("destroy workspace"))?;
        debug!(workspace = %self.dir.display(), "Workspace destroyed");
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(workspace = %self.dir.display(), "Workspace dropped without destroy, removing it");
        let dir = std::mem::take(&mut self.dir);
        let remove = move || {
            if let Err(e) = remove_dir(&dir) {
                warn!(workspace = %dir.display(), error = %e, "Failed to remove dropped workspace");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(remove);
            }
            Err(_) => remove(),
        }
    }
}

fn write_workspace(dir: &Path, source: &Path, code: &str) -> Result<()> {
    fs::create_dir(dir).map_err(SandboxError::io("create workspace"))?;
    if let Err(e) = write_source(dir, source, code) {
        let _ = remove_dir(dir);
        return Err(e);
    }
    Ok(())
}

fn write_source(dir: &Path, source: &Path, code: &str) -> Result<()> {
    // The sandboxed user is not the host user; compilers need to write
    // their outputs next to the source.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o777))
            .map_err(SandboxError::io("chmod workspace"))?;
    }

    fs::write(source, code).map_err(SandboxError::io("write source file"))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(source, fs::Permissions::from_mode(0o644))
            .map_err(SandboxError::io("chmod source file"))?;
    }
    Ok(())
}

fn remove_dir(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
