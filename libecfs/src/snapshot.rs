//! Snapshot naming policy and backend-to-protocol translation.

use chrono::DateTime;
use thiserror::Error;

use crate::backend::BackendSnapshot;
use crate::error::CsiError;
use crate::types::{Snapshot, SnapshotId, SnapshotStatus, Timestamp, VolumeId};

/// Prefix the external snapshotter puts in front of generated names.
pub const SNAPSHOT_NAME_PREFIX: &str = "snapshot-";

/// Longest snapshot name the backend accepts once the prefix is stripped.
pub const MAX_SNAPSHOT_NAME_LEN: usize = 36;

/// A backend record that cannot be expressed in protocol terms.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TranslationError {
    #[error("unrecognized snapshot status {0:?}")]
    UnknownStatus(String),

    #[error("invalid creation timestamp {value:?}: {reason}")]
    BadTimestamp { value: String, reason: String },
}

/// Name under which a requested snapshot is stored on the backend.
///
/// The known prefix is stripped.  A remainder that is still too long is
/// rejected rather than truncated, since two truncated names could collide.
pub fn backend_snapshot_name(requested: &str) -> Result<&str, CsiError> {
    let short = requested
        .strip_prefix(SNAPSHOT_NAME_PREFIX)
        .unwrap_or(requested);
    if short.len() > MAX_SNAPSHOT_NAME_LEN {
        return Err(CsiError::InvalidArgument(format!(
            "snapshot name exceeds max allowed length of {MAX_SNAPSHOT_NAME_LEN} - {requested} (short version: {short})"
        )));
    }
    Ok(short)
}

pub fn parse_status(raw: &str) -> Result<SnapshotStatus, TranslationError> {
    match raw {
        "PENDING" => Ok(SnapshotStatus::Creating),
        "READY" => Ok(SnapshotStatus::Ready),
        other => Err(TranslationError::UnknownStatus(other.to_owned())),
    }
}

/// Parse an RFC 3339 date-time.
pub fn parse_timestamp(raw: &str) -> Result<Timestamp, TranslationError> {
    let parsed = DateTime::parse_from_rfc3339(raw).map_err(|e| TranslationError::BadTimestamp {
        value: raw.to_owned(),
        reason: e.to_string(),
    })?;
    Ok(Timestamp {
        seconds: parsed.timestamp(),
        nanos: parsed.timestamp_subsec_nanos() as i32,
    })
}

/// Convert a backend snapshot record to its protocol descriptor.
pub fn to_protocol(snapshot: &BackendSnapshot) -> Result<Snapshot, TranslationError> {
    Ok(Snapshot {
        snapshot_id: SnapshotId(snapshot.name.clone()),
        source_volume_id: VolumeId(snapshot.source_volume.clone()),
        creation_time: parse_timestamp(&snapshot.created_at)?,
        size_bytes: snapshot.size_bytes,
        status: parse_status(&snapshot.status)?,
    })
}
