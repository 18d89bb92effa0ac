//! CSI Node service.
//!
//! The Node service runs on each worker node and handles the local mounts
//! that make a volume available to consumers:
//!
//! 1. **Stage** — NFS-mount the volume's export at a node-global path.
//! 2. **Publish** — bind-mount the staging path into a consumer path.
//! 3. **Unpublish** — remove the bind mount and its directory.
//! 4. **Unstage** — unmount the NFS export and remove its directory.
//!
//! Each path moves through `absent → directory → mounted` and back.  Every
//! step checks the current state first, so a retried call that finds the path
//! already where it should be succeeds without touching it again.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::backend::export_path;
use crate::controller::CONTEXT_NFS_EXPORT;
use crate::error::{CsiError, Require};
use crate::mount::{MountError, Mounter};
use crate::types::{
    CapacityRange, NodeCapability, NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest,
    VolumeId, VolumeStats,
};

/// Node service — local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume: NFS-mount its export at the global staging path.
    ///
    /// Calling it again for an already-staged volume succeeds without
    /// remounting.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume: unmount the staging path and remove it.
    ///
    /// A staging path that no longer exists counts as unstaged.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume: bind-mount the staged global path into the target.
    ///
    /// Calling it again for the same `target_path` succeeds without error.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume: unmount the bind mount and remove the target.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;

    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError>;

    async fn expand_volume(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
        capacity_range: CapacityRange,
    ) -> Result<u64, CsiError>;
}

/// Node service over a [`Mounter`].
pub struct NodeServer<M: Mounter> {
    mounter: Arc<M>,
    node_id: String,
    nfs_server: String,
}

impl<M: Mounter> NodeServer<M> {
    /// `nfs_server` is used to derive the export of volumes whose context
    /// does not carry one.
    pub fn new(mounter: Arc<M>, node_id: impl Into<String>, nfs_server: impl Into<String>) -> Self {
        Self {
            mounter,
            node_id: node_id.into(),
            nfs_server: nfs_server.into(),
        }
    }

    /// `host:/path` to stage for `req`.
    fn export_for(&self, req: &NodeStageVolumeRequest) -> Result<String, CsiError> {
        if let Some(export) = req
            .volume_context
            .get(CONTEXT_NFS_EXPORT)
            .filter(|e| !e.is_empty())
        {
            return Ok(export.clone());
        }
        let server = self
            .nfs_server
            .as_str()
            .require("volume context nfsExport or a configured NFS server")?;
        Ok(format!("{server}:{}", export_path(&req.volume_id.0)))
    }

    /// Create `path` and report whether something is already mounted there.
    async fn prepare(&self, op: &str, path: &str) -> Result<bool, CsiError> {
        self.mounter
            .create_dir(path)
            .await
            .map_err(|e| CsiError::failed(op, path, e))?;
        self.mounter
            .is_mount_point(path)
            .await
            .map_err(|e| CsiError::failed(op, path, e))
    }

    /// Unmount `path` if mounted and remove it.  A path that is already gone
    /// is left alone.
    async fn teardown(&self, op: &str, path: &str) -> Result<(), CsiError> {
        let mounted = match self.mounter.is_mount_point(path).await {
            Ok(mounted) => mounted,
            Err(e) => {
                warn!(%path, error = %e, "mount table unavailable, unmounting anyway");
                true
            }
        };
        if mounted {
            match self.mounter.unmount(path).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(%path, "path already gone, nothing to unmount");
                    return Ok(());
                }
                Err(e) => return Err(CsiError::failed(op, path, e)),
            }
        }
        match self.mounter.remove_dir(path).await {
            Ok(()) => Ok(()),
            Err(MountError::NotFound { .. }) => {
                debug!(%path, "directory already removed");
                Ok(())
            }
            Err(e) => Err(CsiError::failed(op, path, e)),
        }
    }
}

#[async_trait]
impl<M: Mounter + 'static> CsiNode for NodeServer<M> {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        req.volume_id.0.as_str().require("volume_id")?;
        let staging = req
            .staging_target_path
            .as_str()
            .require("staging_target_path")?;
        let export = self.export_for(&req)?;

        if self.prepare("stage volume", staging).await? {
            debug!(%staging, "staging path already mounted");
            return Ok(());
        }
        // A failed mount leaves the directory in place for the next attempt.
        self.mounter
            .mount_nfs(&export, staging, &req.volume_capability.mount_flags)
            .await
            .map_err(|e| CsiError::failed("stage volume", staging, e))?;

        info!(%export, %staging, "volume staged");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        volume_id.0.as_str().require("volume_id")?;
        let staging = staging_target_path.require("staging_target_path")?;
        self.teardown("unstage volume", staging).await?;
        info!(%staging, "volume unstaged");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        req.volume_id.0.as_str().require("volume_id")?;
        let staging = req
            .staging_target_path
            .as_str()
            .require("staging_target_path")?;
        let target = req.target_path.as_str().require("target_path")?;

        if self.prepare("publish volume", target).await? {
            debug!(%target, "target already mounted");
            return Ok(());
        }
        self.mounter
            .bind_mount(staging, target, req.read_only)
            .await
            .map_err(|e| CsiError::failed("publish volume", target, e))?;

        info!(%target, read_only = req.read_only, "volume published");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        volume_id.0.as_str().require("volume_id")?;
        let target = target_path.require("target_path")?;
        self.teardown("unpublish volume", target).await?;
        info!(%target, "volume unpublished");
        Ok(())
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![NodeCapability::StageUnstageVolume])
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.node_id.clone(),
            max_volumes: 0,
        })
    }

    async fn get_volume_stats(
        &self,
        _volume_id: &VolumeId,
        _volume_path: &str,
    ) -> Result<VolumeStats, CsiError> {
        Err(CsiError::unimplemented("NodeGetVolumeStats"))
    }

    async fn expand_volume(
        &self,
        _volume_id: &VolumeId,
        _volume_path: &str,
        _capacity_range: CapacityRange,
    ) -> Result<u64, CsiError> {
        Err(CsiError::unimplemented("NodeExpandVolume"))
    }
}
