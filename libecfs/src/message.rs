//! CSI protocol messages transmitted over QUIC.
//!
//! [`CsiMessage`] is the top-level envelope for all request and response
//! variants exchanged between the orchestrator-side client and the plugin
//! via QUIC bi-directional streams.

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// Top-level message envelope for CSI over QUIC.
///
/// Each QUIC bi-stream carries exactly one request followed by one response.
/// The client sends a *request* variant and the server replies with the
/// corresponding *response* variant (or [`CsiMessage::Error`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Requests --------------------------------------------------------
    /// Health probe (Identity).
    Probe,
    /// Query plugin info (Identity).
    GetPluginInfo,
    /// Query plugin capabilities (Identity).
    GetPluginCapabilities,

    /// Create a new volume (Controller).
    CreateVolume(CreateVolumeRequest),
    /// Delete a volume (Controller).
    DeleteVolume(VolumeId),
    /// Validate volume capabilities (Controller).
    ValidateVolumeCapabilities(ValidateVolumeCapabilitiesRequest),
    ControllerPublishVolume {
        volume_id: VolumeId,
        node_id: String,
    },
    ControllerUnpublishVolume {
        volume_id: VolumeId,
        node_id: String,
    },
    ControllerExpandVolume {
        volume_id: VolumeId,
        capacity_range: CapacityRange,
    },
    ControllerGetCapabilities,
    /// Snapshot a volume (Controller).
    CreateSnapshot(CreateSnapshotRequest),
    /// Delete a snapshot (Controller).
    DeleteSnapshot(SnapshotId),
    /// List one page of snapshots (Controller).
    ListSnapshots(ListSnapshotsRequest),

    /// Stage (NFS-mount) a volume at a global path (Node).
    StageVolume(NodeStageVolumeRequest),
    /// Unstage a previously staged volume (Node).
    UnstageVolume {
        volume_id: VolumeId,
        staging_target_path: String,
    },
    /// Publish (bind-mount) a staged volume into a consumer path (Node).
    PublishVolume(NodePublishVolumeRequest),
    /// Unpublish a previously published volume (Node).
    UnpublishVolume {
        volume_id: VolumeId,
        target_path: String,
    },
    NodeGetCapabilities,
    /// Query node info (Node).
    GetNodeInfo,
    GetVolumeStats {
        volume_id: VolumeId,
        volume_path: String,
    },
    NodeExpandVolume {
        volume_id: VolumeId,
        volume_path: String,
        capacity_range: CapacityRange,
    },

    // ----- Responses -------------------------------------------------------
    /// A volume was successfully created.
    VolumeCreated(Volume),
    /// Whether the requested capabilities are supported.
    CapabilitiesValid(bool),
    ControllerCapabilitiesResponse(Vec<ControllerCapability>),
    /// New capacity of an expanded volume.
    VolumeExpanded(u64),
    SnapshotCreated(Snapshot),
    SnapshotList(ListSnapshotsResponse),
    NodeCapabilitiesResponse(Vec<NodeCapability>),
    VolumeStatsResponse(VolumeStats),
    /// Plugin information.
    PluginInfoResponse(PluginInfo),
    /// Plugin capabilities.
    PluginCapabilitiesResponse(Vec<PluginCapability>),
    /// Node information.
    NodeInfoResponse(NodeInfo),

    /// Generic success acknowledgement (no payload).
    Ok,
    /// Probe result.
    ProbeResult(bool),
    /// An error occurred.
    Error(CsiError),
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Probe => f.write_str("Probe"),
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::CreateVolume(req) => write!(f, "CreateVolume(name={})", req.name),
            Self::DeleteVolume(id) => write!(f, "DeleteVolume({id})"),
            Self::ValidateVolumeCapabilities(req) => {
                write!(f, "ValidateVolumeCapabilities({})", req.volume_id)
            }
            Self::ControllerPublishVolume { volume_id, node_id } => {
                write!(f, "ControllerPublishVolume({volume_id}, node={node_id})")
            }
            Self::ControllerUnpublishVolume { volume_id, node_id } => {
                write!(f, "ControllerUnpublishVolume({volume_id}, node={node_id})")
            }
            Self::ControllerExpandVolume { volume_id, .. } => {
                write!(f, "ControllerExpandVolume({volume_id})")
            }
            Self::ControllerGetCapabilities => f.write_str("ControllerGetCapabilities"),
            Self::CreateSnapshot(req) => write!(
                f,
                "CreateSnapshot(name={}, source={})",
                req.name, req.source_volume_id
            ),
            Self::DeleteSnapshot(id) => write!(f, "DeleteSnapshot({id})"),
            Self::ListSnapshots(req) => write!(
                f,
                "ListSnapshots(max={}, token={:?})",
                req.max_entries, req.starting_token
            ),
            Self::StageVolume(req) => write!(f, "StageVolume({})", req.volume_id),
            Self::UnstageVolume { volume_id, .. } => write!(f, "UnstageVolume({volume_id})"),
            Self::PublishVolume(req) => write!(f, "PublishVolume({})", req.volume_id),
            Self::UnpublishVolume { volume_id, .. } => write!(f, "UnpublishVolume({volume_id})"),
            Self::NodeGetCapabilities => f.write_str("NodeGetCapabilities"),
            Self::GetNodeInfo => f.write_str("GetNodeInfo"),
            Self::GetVolumeStats { volume_id, .. } => write!(f, "GetVolumeStats({volume_id})"),
            Self::NodeExpandVolume { volume_id, .. } => write!(f, "NodeExpandVolume({volume_id})"),
            Self::VolumeCreated(v) => write!(f, "VolumeCreated({})", v.volume_id),
            Self::CapabilitiesValid(v) => write!(f, "CapabilitiesValid({v})"),
            Self::ControllerCapabilitiesResponse(caps) => {
                write!(f, "ControllerCapabilities(count={})", caps.len())
            }
            Self::VolumeExpanded(bytes) => write!(f, "VolumeExpanded({bytes})"),
            Self::SnapshotCreated(s) => write!(f, "SnapshotCreated({})", s.snapshot_id),
            Self::SnapshotList(page) => write!(
                f,
                "SnapshotList(count={}, next={:?})",
                page.entries.len(),
                page.next_token
            ),
            Self::NodeCapabilitiesResponse(caps) => {
                write!(f, "NodeCapabilities(count={})", caps.len())
            }
            Self::VolumeStatsResponse(stats) => {
                write!(f, "VolumeStats(used={})", stats.used_bytes)
            }
            Self::PluginInfoResponse(info) => write!(f, "PluginInfo(name={})", info.name),
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::NodeInfoResponse(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::Ok => f.write_str("Ok"),
            Self::ProbeResult(ok) => write!(f, "ProbeResult({ok})"),
            Self::Error(e) => write!(f, "Error({e})"),
        }
    }
}
