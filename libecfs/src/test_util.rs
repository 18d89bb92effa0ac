//! Fixtures shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::backend::MemoryBackend;
use crate::controller::{ControllerConfig, ControllerServer};
use crate::mount::{MountError, Mounter};
use crate::node::NodeServer;
use crate::params::DEFAULT_CAPACITY_BYTES;
use crate::session::Session;
use crate::types::{AccessMode, VolumeCapability};

pub const NFS_SERVER: &str = "10.0.0.5";

pub fn capability(access_mode: AccessMode) -> VolumeCapability {
    VolumeCapability {
        access_mode,
        ..Default::default()
    }
}

/// Controller over a fresh [`MemoryBackend`], which is returned for
/// inspection.
pub fn memory_controller() -> (Arc<MemoryBackend>, ControllerServer<Arc<MemoryBackend>>) {
    let backend = Arc::new(MemoryBackend::new());
    let session = Arc::new(Session::new(Arc::clone(&backend)));
    let controller = ControllerServer::new(
        session,
        ControllerConfig {
            nfs_server: NFS_SERVER.into(),
            default_capacity_bytes: DEFAULT_CAPACITY_BYTES,
        },
    );
    (backend, controller)
}

/// Node over a fresh [`RecordingMounter`], which is returned for inspection.
pub fn recording_node() -> (Arc<RecordingMounter>, NodeServer<RecordingMounter>) {
    let mounter = Arc::new(RecordingMounter::default());
    let node = NodeServer::new(Arc::clone(&mounter), "node-1", NFS_SERVER);
    (mounter, node)
}

/// A mount primitive invocation seen by [`RecordingMounter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountCall {
    CreateDir(String),
    MountNfs {
        export: String,
        target: String,
        flags: Vec<String>,
    },
    Bind {
        source: String,
        target: String,
        read_only: bool,
    },
    Unmount(String),
    RemoveDir(String),
}

/// In-memory [`Mounter`] that tracks directories and mount points the way
/// the kernel would, and records every mutating call.
#[derive(Default)]
pub struct RecordingMounter {
    dirs: Mutex<HashSet<String>>,
    mounts: Mutex<HashSet<String>>,
    calls: Mutex<Vec<MountCall>>,
    failures: Mutex<HashMap<&'static str, io::ErrorKind>>,
}

impl RecordingMounter {
    pub fn calls(&self) -> Vec<MountCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn mount_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, MountCall::MountNfs { .. } | MountCall::Bind { .. }))
            .count()
    }

    pub fn is_mounted(&self, path: &str) -> bool {
        self.mounts.lock().unwrap().contains(path)
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.dirs.lock().unwrap().contains(path)
    }

    /// Make every later `op` call fail with `kind`.
    pub fn fail(&self, op: &'static str, kind: io::ErrorKind) {
        self.failures.lock().unwrap().insert(op, kind);
    }

    fn record(&self, call: MountCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn injected(&self, op: &'static str, path: &str) -> Result<(), MountError> {
        match self.failures.lock().unwrap().get(op) {
            Some(io::ErrorKind::NotFound) => Err(MountError::NotFound {
                path: path.to_owned(),
            }),
            Some(kind) => Err(MountError::Io {
                op,
                path: path.to_owned(),
                source: io::Error::from(*kind),
            }),
            None => Ok(()),
        }
    }

    fn mount_on(&self, op: &'static str, target: &str) -> Result<(), MountError> {
        if !self.has_dir(target) {
            return Err(MountError::NotFound {
                path: target.to_owned(),
            });
        }
        if !self.mounts.lock().unwrap().insert(target.to_owned()) {
            return Err(MountError::Io {
                op,
                path: target.to_owned(),
                source: io::Error::from(io::ErrorKind::ResourceBusy),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Mounter for RecordingMounter {
    async fn create_dir(&self, path: &str) -> Result<(), MountError> {
        self.record(MountCall::CreateDir(path.to_owned()));
        self.injected("create_dir", path)?;
        self.dirs.lock().unwrap().insert(path.to_owned());
        Ok(())
    }

    async fn is_mount_point(&self, path: &str) -> Result<bool, MountError> {
        self.injected("is_mount_point", path)?;
        Ok(self.is_mounted(path))
    }

    async fn mount_nfs(
        &self,
        export: &str,
        target: &str,
        flags: &[String],
    ) -> Result<(), MountError> {
        self.record(MountCall::MountNfs {
            export: export.to_owned(),
            target: target.to_owned(),
            flags: flags.to_vec(),
        });
        self.injected("mount_nfs", target)?;
        self.mount_on("mount nfs", target)
    }

    async fn bind_mount(
        &self,
        source: &str,
        target: &str,
        read_only: bool,
    ) -> Result<(), MountError> {
        self.record(MountCall::Bind {
            source: source.to_owned(),
            target: target.to_owned(),
            read_only,
        });
        self.injected("bind_mount", target)?;
        self.mount_on("bind mount", target)
    }

    async fn unmount(&self, path: &str) -> Result<(), MountError> {
        self.record(MountCall::Unmount(path.to_owned()));
        self.injected("unmount", path)?;
        if self.mounts.lock().unwrap().remove(path) {
            return Ok(());
        }
        if self.has_dir(path) {
            Err(MountError::Io {
                op: "unmount",
                path: path.to_owned(),
                source: io::Error::from(io::ErrorKind::InvalidInput),
            })
        } else {
            Err(MountError::NotFound {
                path: path.to_owned(),
            })
        }
    }

    async fn remove_dir(&self, path: &str) -> Result<(), MountError> {
        self.record(MountCall::RemoveDir(path.to_owned()));
        self.injected("remove_dir", path)?;
        if self.is_mounted(path) {
            return Err(MountError::Io {
                op: "remove dir",
                path: path.to_owned(),
                source: io::Error::from(io::ErrorKind::ResourceBusy),
            });
        }
        if self.dirs.lock().unwrap().remove(path) {
            Ok(())
        } else {
            Err(MountError::NotFound {
                path: path.to_owned(),
            })
        }
    }
}
