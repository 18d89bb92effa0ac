//! Storage class parameters of `CreateVolume`.
//!
//! | Key | Values | Default |
//! |---|---|---|
//! | `capacity` | bytes, or a number with a `Ki`/`Mi`/`Gi`/`Ti` suffix | plugin default |
//! | `userMapping` | `no_mapping`, `remap_root`, `remap_all` | `remap_all` |
//! | `uid`, `gid` | anonymous uid / gid for remapped users | `0` |
//! | `exportPermissions` | `read_write`, `read_only` | `read_write` |
//!
//! Other keys (such as the `csi.storage.k8s.io/` ones injected by sidecars)
//! are ignored.

use std::collections::HashMap;

use crate::backend::{ExportAccess, UserMapping, VolumeSpec};
use crate::error::CsiError;

pub const PARAM_CAPACITY: &str = "capacity";
pub const PARAM_USER_MAPPING: &str = "userMapping";
pub const PARAM_UID: &str = "uid";
pub const PARAM_GID: &str = "gid";
pub const PARAM_EXPORT_PERMISSIONS: &str = "exportPermissions";

const KIB: u64 = 1024;

/// Capacity used when neither the parameters nor the request name one.
pub const DEFAULT_CAPACITY_BYTES: u64 = 100 * KIB * KIB * KIB;

/// Validated creation options of one volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeOptions {
    pub name: String,
    pub capacity_bytes: u64,
    pub user_mapping: UserMapping,
    pub uid: u32,
    pub gid: u32,
    pub access: ExportAccess,
}

impl VolumeOptions {
    /// Parse `parameters` for the volume `name`.
    ///
    /// Any malformed value is an [`CsiError::InvalidArgument`].
    pub fn parse(
        name: &str,
        parameters: &HashMap<String, String>,
        default_capacity: u64,
    ) -> Result<Self, CsiError> {
        let get = |key: &str| parameters.get(key).map(|v| v.trim());

        let capacity_bytes = match get(PARAM_CAPACITY) {
            Some(v) => parse_size(v)
                .ok_or_else(|| CsiError::InvalidArgument(format!("invalid {PARAM_CAPACITY}: {v}")))?,
            None => default_capacity,
        };
        let user_mapping = match get(PARAM_USER_MAPPING) {
            None | Some("remap_all") => UserMapping::RemapAll,
            Some("remap_root") => UserMapping::RemapRoot,
            Some("no_mapping") => UserMapping::NoMapping,
            Some(other) => {
                return Err(CsiError::InvalidArgument(format!(
                    "invalid {PARAM_USER_MAPPING}: {other}"
                )));
            }
        };
        let access = match get(PARAM_EXPORT_PERMISSIONS) {
            None | Some("read_write") => ExportAccess::ReadWrite,
            Some("read_only") => ExportAccess::ReadOnly,
            Some(other) => {
                return Err(CsiError::InvalidArgument(format!(
                    "invalid {PARAM_EXPORT_PERMISSIONS}: {other}"
                )));
            }
        };

        Ok(Self {
            name: name.to_owned(),
            capacity_bytes,
            user_mapping,
            uid: parse_id(get(PARAM_UID), PARAM_UID)?,
            gid: parse_id(get(PARAM_GID), PARAM_GID)?,
            access,
        })
    }

    pub fn into_spec(self) -> VolumeSpec {
        VolumeSpec {
            name: self.name,
            capacity_bytes: self.capacity_bytes,
            user_mapping: self.user_mapping,
            uid: self.uid,
            gid: self.gid,
            access: self.access,
        }
    }
}

fn parse_id(value: Option<&str>, key: &str) -> Result<u32, CsiError> {
    match value {
        None => Ok(0),
        Some(v) => v
            .parse()
            .map_err(|_| CsiError::InvalidArgument(format!("invalid {key}: {v}"))),
    }
}

/// Parse `"1073741824"`, `"512Mi"`, `"10Gi"` and friends into bytes.
pub fn parse_size(value: &str) -> Option<u64> {
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let number: u64 = digits.parse().ok()?;
    let multiplier = match unit {
        "" => 1,
        "Ki" => KIB,
        "Mi" => KIB.pow(2),
        "Gi" => KIB.pow(3),
        "Ti" => KIB.pow(4),
        _ => return None,
    };
    number.checked_mul(multiplier).filter(|bytes| *bytes > 0)
}
