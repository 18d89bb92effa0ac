//! Role composition.
//!
//! A [`Plugin`] bundles the Identity service with the Controller and/or Node
//! service a process was started for, and is what the transport dispatches
//! to.  Calls aimed at a role the process does not serve answer
//! [`CsiError::Unimplemented`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::{CsiIdentity, IdentityServer};
use crate::node::CsiNode;
use crate::types::*;

pub struct Plugin {
    identity: IdentityServer,
    controller: Option<Arc<dyn CsiController>>,
    node: Option<Arc<dyn CsiNode>>,
}

impl Plugin {
    pub fn new(
        controller: Option<Arc<dyn CsiController>>,
        node: Option<Arc<dyn CsiNode>>,
    ) -> Self {
        Self {
            identity: IdentityServer::new(controller.is_some()),
            controller,
            node,
        }
    }

    fn controller(&self, rpc: &str) -> Result<&dyn CsiController, CsiError> {
        self.controller
            .as_deref()
            .ok_or_else(|| CsiError::Unimplemented(format!("{rpc}: controller role is disabled")))
    }

    fn node(&self, rpc: &str) -> Result<&dyn CsiNode, CsiError> {
        self.node
            .as_deref()
            .ok_or_else(|| CsiError::Unimplemented(format!("{rpc}: node role is disabled")))
    }
}

#[async_trait]
impl CsiIdentity for Plugin {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        self.identity.get_plugin_info().await
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        self.identity.probe().await
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        self.identity.get_plugin_capabilities().await
    }
}

#[async_trait]
impl CsiController for Plugin {
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        self.controller("CreateVolume")?.create_volume(req).await
    }

    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        self.controller("DeleteVolume")?
            .delete_volume(volume_id)
            .await
    }

    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<bool, CsiError> {
        self.controller("ValidateVolumeCapabilities")?
            .validate_volume_capabilities(req)
            .await
    }

    async fn controller_publish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<(), CsiError> {
        self.controller("ControllerPublishVolume")?
            .controller_publish_volume(volume_id, node_id)
            .await
    }

    async fn controller_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<(), CsiError> {
        self.controller("ControllerUnpublishVolume")?
            .controller_unpublish_volume(volume_id, node_id)
            .await
    }

    async fn expand_volume(
        &self,
        volume_id: &VolumeId,
        capacity_range: CapacityRange,
    ) -> Result<u64, CsiError> {
        self.controller("ControllerExpandVolume")?
            .expand_volume(volume_id, capacity_range)
            .await
    }

    async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError> {
        self.controller("CreateSnapshot")?
            .create_snapshot(req)
            .await
    }

    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<(), CsiError> {
        self.controller("DeleteSnapshot")?
            .delete_snapshot(snapshot_id)
            .await
    }

    async fn list_snapshots(
        &self,
        req: ListSnapshotsRequest,
    ) -> Result<ListSnapshotsResponse, CsiError> {
        self.controller("ListSnapshots")?.list_snapshots(req).await
    }

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        match &self.controller {
            Some(controller) => controller.get_capabilities().await,
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl CsiNode for Plugin {
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        self.node("NodeStageVolume")?.stage_volume(req).await
    }

    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        self.node("NodeUnstageVolume")?
            .unstage_volume(volume_id, staging_target_path)
            .await
    }

    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        self.node("NodePublishVolume")?.publish_volume(req).await
    }

    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        self.node("NodeUnpublishVolume")?
            .unpublish_volume(volume_id, target_path)
            .await
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        match &self.node {
            Some(node) => node.get_capabilities().await,
            None => Ok(Vec::new()),
        }
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        self.node("NodeGetInfo")?.get_info().await
    }

    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError> {
        self.node("NodeGetVolumeStats")?
            .get_volume_stats(volume_id, volume_path)
            .await
    }

    async fn expand_volume(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
        capacity_range: CapacityRange,
    ) -> Result<u64, CsiError> {
        self.node("NodeExpandVolume")?
            .expand_volume(volume_id, volume_path, capacity_range)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusCode;
    use crate::test_util::{memory_controller, recording_node};

    fn controller_only() -> Plugin {
        let (_, controller) = memory_controller();
        Plugin::new(Some(Arc::new(controller)), None)
    }

    fn node_only() -> Plugin {
        let (_, node) = recording_node();
        Plugin::new(None, Some(Arc::new(node)))
    }

    #[tokio::test]
    async fn disabled_roles_are_unimplemented() {
        let plugin = controller_only();
        let err = plugin
            .unstage_volume(&"pvc-1".into(), "/staging")
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::Unimplemented);
        assert!(CsiNode::get_capabilities(&plugin).await.unwrap().is_empty());

        let plugin = node_only();
        let err = plugin
            .delete_volume(&"pvc-1".into())
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::Unimplemented);
        assert!(
            CsiController::get_capabilities(&plugin)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn identity_reflects_roles() {
        assert_eq!(
            controller_only().get_plugin_capabilities().await.unwrap(),
            vec![PluginCapability::ControllerService]
        );
        assert!(
            node_only()
                .get_plugin_capabilities()
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn enabled_roles_are_forwarded() {
        let (_, controller) = memory_controller();
        let (_, node) = recording_node();
        let plugin = Plugin::new(Some(Arc::new(controller)), Some(Arc::new(node)));

        let volume = plugin
            .create_volume(CreateVolumeRequest {
                name: "pvc-1".into(),
                volume_capabilities: vec![VolumeCapability::default()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(volume.volume_id, VolumeId("pvc-1".into()));
        assert_eq!(plugin.get_info().await.unwrap().node_id, "node-1");
    }
}
