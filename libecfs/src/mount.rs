//! Local mount primitives used by the Node service.
//!
//! Every primitive is safe to repeat: creating an existing directory is not
//! an error, and [`Mounter::unmount`] / [`Mounter::remove_dir`] report a
//! missing path as [`MountError::NotFound`] so callers can tell "already
//! clean" apart from a real failure.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::mount::MsFlags;
use thiserror::Error;
use tracing::{debug, info};

/// Mount table consulted by [`HostMounter::is_mount_point`].
pub const PROC_MOUNTS: &str = "/proc/self/mounts";

/// Mode of directories created for mount points.
const MOUNT_DIR_MODE: u32 = 0o750;

/// Errors reported by a [`Mounter`].
#[derive(Debug, Error)]
pub enum MountError {
    /// The path does not exist.
    #[error("{path} does not exist")]
    NotFound { path: String },

    /// A syscall or filesystem operation failed.
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },

    /// An external mount helper failed.
    #[error("{op} {path}: {message}")]
    Command {
        op: &'static str,
        path: String,
        message: String,
    },
}

impl MountError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    fn from_errno(op: &'static str, path: &str, errno: Errno) -> Self {
        if errno == Errno::ENOENT {
            Self::NotFound {
                path: path.to_owned(),
            }
        } else {
            Self::Io {
                op,
                path: path.to_owned(),
                source: io::Error::from(errno),
            }
        }
    }

    fn from_io(op: &'static str, path: &str, e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            Self::NotFound {
                path: path.to_owned(),
            }
        } else {
            Self::Io {
                op,
                path: path.to_owned(),
                source: e,
            }
        }
    }
}

/// Filesystem operations needed to stage and publish volumes.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Create `path` and any missing parents.  An existing directory is fine.
    async fn create_dir(&self, path: &str) -> Result<(), MountError>;

    /// Whether `path` is currently a mount point.
    async fn is_mount_point(&self, path: &str) -> Result<bool, MountError>;

    /// Mount the NFS export `export` (`host:/path`) on `target`.
    async fn mount_nfs(&self, export: &str, target: &str, flags: &[String])
    -> Result<(), MountError>;

    /// Bind-mount `source` onto `target`, read-only if requested.
    async fn bind_mount(&self, source: &str, target: &str, read_only: bool)
    -> Result<(), MountError>;

    /// Unmount `path`.
    async fn unmount(&self, path: &str) -> Result<(), MountError>;

    /// Remove the (empty) directory `path`.
    async fn remove_dir(&self, path: &str) -> Result<(), MountError>;
}

/// [`Mounter`] acting on the host: `nix` syscalls for bind mounts and
/// unmounts, `mount -t nfs` for network mounts.
pub struct HostMounter {
    mount_table: PathBuf,
}

impl Default for HostMounter {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMounter {
    pub fn new() -> Self {
        Self {
            mount_table: PathBuf::from(PROC_MOUNTS),
        }
    }

    /// Use `mount_table` instead of [`PROC_MOUNTS`] for mount point lookups.
    pub fn with_mount_table(mount_table: impl Into<PathBuf>) -> Self {
        Self {
            mount_table: mount_table.into(),
        }
    }
}

/// Undo the octal escaping (`\040` for space, ...) of mount table fields.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u16, |acc, d| acc * 8 + u16::from(d - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn normalize(path: &str) -> &str {
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

/// Whether `path` appears as a mount point in `table` (mount table format:
/// `<device> <mountpoint> <fstype> <options> <dump> <pass>`).
fn table_contains(table: &str, path: &str) -> bool {
    let wanted = normalize(path);
    table.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .is_some_and(|mp| normalize(&unescape_mount_field(mp)) == wanted)
    })
}

async fn blocking<F>(op: &'static str, path: &str, f: F) -> Result<(), MountError>
where
    F: FnOnce() -> Result<(), MountError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MountError::Command {
            op,
            path: path.to_owned(),
            message: format!("blocking task failed: {e}"),
        })?
}

#[async_trait]
impl Mounter for HostMounter {
    async fn create_dir(&self, path: &str) -> Result<(), MountError> {
        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(MOUNT_DIR_MODE)
            .create(path)
            .await
            .map_err(|e| MountError::Io {
                op: "create dir",
                path: path.to_owned(),
                source: e,
            })
    }

    async fn is_mount_point(&self, path: &str) -> Result<bool, MountError> {
        let table = tokio::fs::read_to_string(&self.mount_table)
            .await
            .map_err(|e| MountError::Io {
                op: "read mount table",
                path: self.mount_table.display().to_string(),
                source: e,
            })?;
        Ok(table_contains(&table, path))
    }

    async fn mount_nfs(
        &self,
        export: &str,
        target: &str,
        flags: &[String],
    ) -> Result<(), MountError> {
        let mut cmd = tokio::process::Command::new("mount");
        cmd.args(["-t", "nfs"]);
        if !flags.is_empty() {
            cmd.arg("-o").arg(flags.join(","));
        }
        cmd.arg(export).arg(target);
        debug!(?cmd, "running NFS mount");

        let output = cmd.output().await.map_err(|e| MountError::Io {
            op: "mount nfs",
            path: target.to_owned(),
            source: e,
        })?;
        if !output.status.success() {
            return Err(MountError::Command {
                op: "mount nfs",
                path: target.to_owned(),
                message: format!(
                    "mount {export} exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        info!(%export, %target, "NFS export mounted");
        Ok(())
    }

    async fn bind_mount(
        &self,
        source: &str,
        target: &str,
        read_only: bool,
    ) -> Result<(), MountError> {
        let (src, dst) = (source.to_owned(), target.to_owned());
        blocking("bind mount", target, move || {
            let mut flags = MsFlags::MS_BIND;
            if read_only {
                flags |= MsFlags::MS_RDONLY;
            }
            nix::mount::mount(
                Some(src.as_str()),
                dst.as_str(),
                None::<&str>,
                flags,
                None::<&str>,
            )
            .map_err(|e| MountError::from_errno("bind mount", &dst, e))?;

            // The kernel ignores MS_RDONLY on the initial bind; a remount
            // applies it.
            if read_only {
                nix::mount::mount(
                    None::<&str>,
                    dst.as_str(),
                    None::<&str>,
                    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                    None::<&str>,
                )
                .map_err(|e| MountError::from_errno("remount read-only", &dst, e))?;
            }
            Ok(())
        })
        .await
    }

    async fn unmount(&self, path: &str) -> Result<(), MountError> {
        let target = path.to_owned();
        blocking("unmount", path, move || {
            nix::mount::umount(target.as_str())
                .map_err(|e| MountError::from_errno("unmount", &target, e))
        })
        .await
    }

    async fn remove_dir(&self, path: &str) -> Result<(), MountError> {
        tokio::fs::remove_dir(Path::new(path))
            .await
            .map_err(|e| MountError::from_io("remove dir", path, e))
    }
}
