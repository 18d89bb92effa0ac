//! Core CSI types: volumes, snapshots, capabilities and requests.
//!
//! These types form the data model shared by the service traits, the
//! transport layer and the backend adapters.  They are all
//! [`Serialize`]/[`Deserialize`] so they can be transmitted over QUIC as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
///
/// For ECFS the identifier is the volume name, which is also the name of the
/// backing data container and its export.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier of a snapshot as known to the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SnapshotId(pub String);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SnapshotId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    /// Shared read-write access from any number of nodes.  This is the only
    /// mode an NFS export is offered with.
    MultiNodeMultiWriter,
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Additional mount flags (e.g. `"vers=3"`, `"nolock"`).
    #[serde(default)]
    pub mount_flags: Vec<String>,
    /// Filesystem type, always `"nfs"` for ECFS volumes.
    #[serde(default = "default_fs_type")]
    pub fs_type: String,
}

fn default_fs_type() -> String {
    "nfs".to_owned()
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::MultiNodeMultiWriter,
            mount_flags: Vec::new(),
            fs_type: default_fs_type(),
        }
    }
}

/// Capacity bounds requested by the caller.  Zero means "not specified".
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapacityRange {
    #[serde(default)]
    pub required_bytes: u64,
    #[serde(default)]
    pub limit_bytes: u64,
}

// ---------------------------------------------------------------------------
// Volume & snapshot descriptors
// ---------------------------------------------------------------------------

/// Descriptor of a provisioned volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    pub volume_id: VolumeId,
    /// Provisioned capacity in bytes.
    pub capacity_bytes: u64,
    /// Opaque context passed from Controller to Node operations.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Point in time, seconds and nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

/// Readiness of a snapshot as reported to the orchestrator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SnapshotStatus {
    /// The backend is still cutting the snapshot.
    Creating,
    /// The snapshot can be used as a volume source.
    Ready,
}

/// Descriptor of a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub snapshot_id: SnapshotId,
    pub source_volume_id: VolumeId,
    pub creation_time: Timestamp,
    pub size_bytes: u64,
    pub status: SnapshotStatus,
}

// ---------------------------------------------------------------------------
// Controller requests
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Volume name; becomes the volume id.
    pub name: String,
    #[serde(default)]
    pub capacity_range: CapacityRange,
    /// Required capabilities.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage class parameters, see [`crate::params::VolumeOptions`].
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Request to check a set of capabilities against a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesRequest {
    pub volume_id: VolumeId,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
}

/// Request to snapshot a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub name: String,
    pub source_volume_id: VolumeId,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Request to list snapshots.  All filters are optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListSnapshotsRequest {
    #[serde(default)]
    pub snapshot_id: Option<SnapshotId>,
    #[serde(default)]
    pub source_volume_id: Option<VolumeId>,
    /// Zero means no limit.
    #[serde(default)]
    pub max_entries: u32,
    #[serde(default)]
    pub starting_token: Option<String>,
}

/// One page of snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListSnapshotsResponse {
    pub entries: Vec<Snapshot>,
    /// Token for the next page, `None` once the listing is exhausted.
    pub next_token: Option<String>,
}

/// Controller RPCs advertised by the plugin.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerCapability {
    CreateDeleteVolume,
    CreateDeleteSnapshot,
    ListSnapshots,
}

// ---------------------------------------------------------------------------
// Node requests
// ---------------------------------------------------------------------------

/// Request to stage (NFS-mount) a volume on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    pub volume_id: VolumeId,
    /// Node-global staging mount point,
    /// e.g. `/var/lib/kubelet/plugins/kubernetes.io/csi/pv/<pv>/globalmount`.
    pub staging_target_path: String,
    pub volume_capability: VolumeCapability,
    /// Opaque context carried from `CreateVolume`.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to publish (bind-mount) a staged volume into a consumer path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    pub volume_id: VolumeId,
    /// Source of the bind mount.
    pub staging_target_path: String,
    /// Consumer-specific target path.
    pub target_path: String,
    pub volume_capability: VolumeCapability,
    #[serde(default)]
    pub read_only: bool,
}

/// Usage of a mounted volume.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

/// Node RPCs advertised by the plugin.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    StageUnstageVolume,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
}

/// Information about the node on which the Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    /// Maximum number of volumes the node can host, zero for unlimited.
    pub max_volumes: u64,
}
