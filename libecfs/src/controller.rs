//! CSI Controller service.
//!
//! The Controller service manages the cluster-wide lifecycle of volumes and
//! snapshots against the storage backend.  Every mutating operation is safe
//! under at-least-once delivery: creation converges on the resource already
//! stored under the same name and deletion of an absent resource succeeds,
//! so concurrent retries of one request need no locking.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::backend::{BackendError, Connector, SnapshotQuery, StorageBackend};
use crate::error::{CsiError, Require};
use crate::params::{DEFAULT_CAPACITY_BYTES, VolumeOptions};
use crate::session::Session;
use crate::snapshot;
use crate::types::*;

/// Volume context key carrying the `host:/path` NFS export to stage.
pub const CONTEXT_NFS_EXPORT: &str = "nfsExport";

/// Controller service — cluster-level volume and snapshot management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a volume, or return the one already provisioned under the
    /// same name.
    ///
    /// The returned [`Volume`] carries the `volume_context` that must be
    /// forwarded to subsequent Node operations.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a volume.  Deleting an unknown volume succeeds.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Check whether the given capabilities can be satisfied.
    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<bool, CsiError>;

    async fn controller_publish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<(), CsiError>;

    async fn controller_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<(), CsiError>;

    /// Grow a volume, returning its new capacity.
    async fn expand_volume(
        &self,
        volume_id: &VolumeId,
        capacity_range: CapacityRange,
    ) -> Result<u64, CsiError>;

    async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError>;

    /// Delete a snapshot.  Deleting an unknown snapshot succeeds.
    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<(), CsiError>;

    /// Return one page of snapshots.  The caller's starting token and the
    /// backend's continuation token are passed through untouched.
    async fn list_snapshots(
        &self,
        req: ListSnapshotsRequest,
    ) -> Result<ListSnapshotsResponse, CsiError>;

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;
}

/// Plugin-wide settings resolved once per process.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// NFS server address clients mount exports from.
    pub nfs_server: String,
    /// Capacity of volumes whose request and parameters name none.
    pub default_capacity_bytes: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            nfs_server: String::new(),
            default_capacity_bytes: DEFAULT_CAPACITY_BYTES,
        }
    }
}

/// NFS exports only offer shared multi-writer access.
pub fn capability_supported(capability: &VolumeCapability) -> bool {
    capability.access_mode == AccessMode::MultiNodeMultiWriter
}

/// Controller backed by the storage-management API behind a [`Session`].
pub struct ControllerServer<C: Connector> {
    session: Arc<Session<C>>,
    config: ControllerConfig,
}

impl<C: Connector> ControllerServer<C> {
    pub fn new(session: Arc<Session<C>>, config: ControllerConfig) -> Self {
        Self { session, config }
    }

    async fn backend(&self, op: &str, resource: &str) -> Result<Arc<C::Backend>, CsiError> {
        self.session
            .backend()
            .await
            .map_err(|e| CsiError::failed(op, resource, e))
    }

    /// Fold a backend outcome into a [`CsiError`], dropping the session if
    /// the backend no longer accepts it.
    async fn settle<T>(
        &self,
        backend: &Arc<C::Backend>,
        op: &str,
        resource: &str,
        result: Result<T, BackendError>,
    ) -> Result<T, CsiError> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if err.is_session_expired() {
            warn!(error = %err, "backend rejected the session");
            self.session.invalidate(backend).await;
        }
        Err(match err {
            BackendError::InvalidToken(token) => {
                CsiError::InvalidArgument(format!("{op}: invalid starting token {token:?}"))
            }
            BackendError::NotFound { kind, name } => {
                CsiError::NotFound(format!("{op} {resource}: {kind} {name} does not exist"))
            }
            other => CsiError::failed(op, resource, other),
        })
    }

    fn export_address(&self, export_path: &str) -> String {
        format!("{}:{}", self.config.nfs_server, export_path)
    }
}

fn require_capabilities(capabilities: &[VolumeCapability]) -> Result<(), CsiError> {
    if capabilities.is_empty() {
        return Err(CsiError::invalid("volume capabilities are required"));
    }
    Ok(())
}

#[async_trait]
impl<C: Connector + 'static> CsiController for ControllerServer<C> {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        let name = req.name.as_str().require("name")?;
        require_capabilities(&req.volume_capabilities)?;
        if let Some(cap) = req
            .volume_capabilities
            .iter()
            .find(|cap| !capability_supported(cap))
        {
            return Err(CsiError::InvalidArgument(format!(
                "access mode {:?} is not supported",
                cap.access_mode
            )));
        }

        let mut options =
            VolumeOptions::parse(name, &req.parameters, self.config.default_capacity_bytes)?;
        if req.capacity_range.required_bytes > 0 {
            options.capacity_bytes = req.capacity_range.required_bytes;
        }

        let backend = self.backend("create volume", name).await?;
        let result = backend.ensure_volume(&options.into_spec()).await;
        let volume = self
            .settle(&backend, "create volume", name, result)
            .await?;

        let mut volume_context = req.parameters;
        volume_context.insert(
            CONTEXT_NFS_EXPORT.to_owned(),
            self.export_address(&volume.export_path),
        );
        info!(capacity = volume.capacity_bytes, export = %volume.export_path, "volume ready");
        Ok(Volume {
            volume_id: VolumeId(volume.name),
            capacity_bytes: volume.capacity_bytes,
            volume_context,
        })
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let name = volume_id.0.as_str().require("volume_id")?;
        let backend = self.backend("delete volume", name).await?;
        let result = backend.ensure_volume_absent(name).await;
        self.settle(&backend, "delete volume", name, result).await?;
        info!("volume deleted");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<bool, CsiError> {
        req.volume_id.0.as_str().require("volume_id")?;
        require_capabilities(&req.volume_capabilities)?;
        let supported = req.volume_capabilities.iter().all(capability_supported);
        debug!(supported, "capabilities checked");
        Ok(supported)
    }

    async fn controller_publish_volume(
        &self,
        _volume_id: &VolumeId,
        _node_id: &str,
    ) -> Result<(), CsiError> {
        Err(CsiError::unimplemented("ControllerPublishVolume"))
    }

    async fn controller_unpublish_volume(
        &self,
        _volume_id: &VolumeId,
        _node_id: &str,
    ) -> Result<(), CsiError> {
        Err(CsiError::unimplemented("ControllerUnpublishVolume"))
    }

    async fn expand_volume(
        &self,
        _volume_id: &VolumeId,
        _capacity_range: CapacityRange,
    ) -> Result<u64, CsiError> {
        Err(CsiError::unimplemented("ControllerExpandVolume"))
    }

    #[instrument(skip(self, req), fields(name = %req.name, source = %req.source_volume_id))]
    async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError> {
        let requested = req.name.as_str().require("name")?;
        let source = req.source_volume_id.0.as_str().require("source_volume_id")?;
        let name = snapshot::backend_snapshot_name(requested)?;

        let backend = self.backend("create snapshot", name).await?;
        let result = backend.create_snapshot(name, source, &req.parameters).await;
        let record = self
            .settle(&backend, "create snapshot", name, result)
            .await?;

        let snapshot = snapshot::to_protocol(&record)
            .map_err(|e| CsiError::failed("create snapshot", name, e))?;
        info!(status = ?snapshot.status, "snapshot created");
        Ok(snapshot)
    }

    #[instrument(skip(self))]
    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<(), CsiError> {
        let id = snapshot_id.0.as_str().require("snapshot_id")?;
        let backend = self.backend("delete snapshot", id).await?;
        let result = backend.ensure_snapshot_absent(id).await;
        self.settle(&backend, "delete snapshot", id, result).await?;
        info!("snapshot deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_snapshots(
        &self,
        req: ListSnapshotsRequest,
    ) -> Result<ListSnapshotsResponse, CsiError> {
        // Empty strings on the wire mean "no filter".
        let query = SnapshotQuery {
            snapshot_id: req.snapshot_id.map(|id| id.0).filter(|s| !s.is_empty()),
            source_volume: req.source_volume_id.map(|id| id.0).filter(|s| !s.is_empty()),
            max_entries: req.max_entries,
            starting_token: req.starting_token.filter(|s| !s.is_empty()),
        };

        let backend = self.backend("list snapshots", "").await?;
        let result = backend.list_snapshots(&query).await;
        let page = self
            .settle(&backend, "list snapshots", "", result)
            .await?;

        let entries = page
            .snapshots
            .iter()
            .map(|record| {
                snapshot::to_protocol(record)
                    .map_err(|e| CsiError::failed("list snapshots", &record.name, e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count = entries.len(), next = ?page.next_token, "snapshots listed");
        Ok(ListSnapshotsResponse {
            entries,
            next_token: page.next_token,
        })
    }

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(vec![
            ControllerCapability::CreateDeleteVolume,
            ControllerCapability::CreateDeleteSnapshot,
            ControllerCapability::ListSnapshots,
        ])
    }
}
