//! Storage-management backend adapters.
//!
//! [`StorageBackend`] is the narrow capability interface the Controller
//! service consumes.  Every mutating operation is phrased as "ensure": the
//! caller describes the end state and the backend converges to it, so a
//! retried call never creates a duplicate or fails on an already-deleted
//! resource.
//!
//! Two implementations are provided:
//!
//! | Module | Backend |
//! |---|---|
//! | [`rest`] | eManage JSON REST API over HTTPS ([`RestBackend`]) |
//! | [`memory`] | in-process state, for tests and local experiments ([`MemoryBackend`]) |

pub mod memory;
pub mod rest;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryBackend;
pub use rest::{RestBackend, RestConfig, RestConnector};

/// Errors reported by a storage backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The management endpoint could not be reached.
    #[error("backend unreachable: {0}")]
    Unavailable(String),

    /// Login was rejected or the session expired.
    #[error("authentication failed: {0}")]
    Unauthenticated(String),

    /// The backend answered with an error status.
    #[error("{operation} returned HTTP {status}: {message}")]
    Api {
        operation: String,
        status: u16,
        message: String,
    },

    /// A resource the operation depends on does not exist.
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// A pagination token that this backend never handed out.
    #[error("invalid pagination token: {0}")]
    InvalidToken(String),

    /// The backend answered with something that could not be decoded.
    #[error("malformed backend response: {0}")]
    Decode(String),
}

impl BackendError {
    /// `true` when the session should be dropped and re-established.
    pub fn is_session_expired(&self) -> bool {
        match self {
            Self::Unauthenticated(_) => true,
            Self::Api { status, .. } => *status == 401,
            _ => false,
        }
    }
}

/// Root squashing policy of an NFS export.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserMapping {
    NoMapping,
    RemapRoot,
    RemapAll,
}

/// Access granted to NFS clients of an export.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExportAccess {
    ReadWrite,
    ReadOnly,
}

/// Desired state of a volume: one data container plus one export of the
/// same name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub capacity_bytes: u64,
    pub user_mapping: UserMapping,
    pub uid: u32,
    pub gid: u32,
    pub access: ExportAccess,
}

/// A volume as it exists on the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendVolume {
    pub name: String,
    pub capacity_bytes: u64,
    /// Export path on the NFS server, e.g. `/pvc-1/pvc-1`.
    pub export_path: String,
}

/// A snapshot record in the backend's own vocabulary.
///
/// `created_at` and `status` are passed through untouched; converting them
/// to protocol shape is the Controller's job and may fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSnapshot {
    pub id: String,
    pub name: String,
    /// Name of the volume the snapshot was taken from.
    pub source_volume: String,
    /// Creation time, RFC 3339.
    pub created_at: String,
    /// `PENDING` or `READY`.
    pub status: String,
    pub size_bytes: u64,
}

/// Filters and cursor for [`StorageBackend::list_snapshots`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotQuery {
    pub snapshot_id: Option<String>,
    pub source_volume: Option<String>,
    /// Zero means no limit.
    pub max_entries: u32,
    pub starting_token: Option<String>,
}

/// One page of snapshot records plus the cursor for the next one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotPage {
    pub snapshots: Vec<BackendSnapshot>,
    pub next_token: Option<String>,
}

/// A data container (the backend's unit of capacity).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataContainer {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub hard_quota_bytes: u64,
}

/// An NFS export of a data container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Export {
    pub id: u64,
    pub name: String,
    pub data_container_id: u64,
}

/// Capability interface of the remote storage-management system.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Make sure a volume named `spec.name` exists.  An existing volume is
    /// returned as is, without being modified.
    async fn ensure_volume(&self, spec: &VolumeSpec) -> Result<BackendVolume, BackendError>;

    /// Make sure no volume named `name` exists.  Succeeds if it never did.
    async fn ensure_volume_absent(&self, name: &str) -> Result<(), BackendError>;

    /// Cut a snapshot of `source_volume` named `name`.
    async fn create_snapshot(
        &self,
        name: &str,
        source_volume: &str,
        parameters: &HashMap<String, String>,
    ) -> Result<BackendSnapshot, BackendError>;

    /// Make sure snapshot `id` does not exist.  Succeeds if it never did.
    async fn ensure_snapshot_absent(&self, id: &str) -> Result<(), BackendError>;

    /// Return one page of snapshots matching `query`.
    async fn list_snapshots(&self, query: &SnapshotQuery) -> Result<SnapshotPage, BackendError>;

    /// Look up a data container by name.
    async fn find_data_container(&self, name: &str)
    -> Result<Option<DataContainer>, BackendError>;

    /// Look up an export of `container` by name.
    async fn find_export(
        &self,
        container: &DataContainer,
        name: &str,
    ) -> Result<Option<Export>, BackendError>;
}

/// Establishes an authenticated backend handle.
///
/// Used by [`Session`](crate::session::Session) to (re-)login on demand.
#[async_trait]
pub trait Connector: Send + Sync {
    type Backend: StorageBackend + 'static;

    async fn connect(&self) -> Result<Arc<Self::Backend>, BackendError>;
}

/// Export path of a volume: container and export share the volume's name.
pub fn export_path(name: &str) -> String {
    format!("/{name}/{name}")
}
