//! CSI Identity service.
//!
//! The Identity service allows callers to discover plugin metadata and check
//! plugin health.  Every CSI plugin must implement this service.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{PluginCapability, PluginInfo};

/// Name the plugin registers under.
pub const DRIVER_NAME: &str = "csi.ecfs.elastifile.com";

/// Identity service — plugin discovery and health probing.
#[async_trait]
pub trait CsiIdentity: Send + Sync {
    /// Return the plugin name and version.
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError>;

    /// Liveness probe.  Returns `true` when the plugin is healthy.
    async fn probe(&self) -> Result<bool, CsiError>;

    /// Advertise the capabilities supported by this plugin.
    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError>;
}

/// Static identity of the ECFS plugin.
pub struct IdentityServer {
    name: String,
    version: String,
    controller: bool,
}

impl IdentityServer {
    /// `controller` tells whether this process serves the Controller service.
    pub fn new(controller: bool) -> Self {
        Self {
            name: DRIVER_NAME.to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            controller,
        }
    }
}

#[async_trait]
impl CsiIdentity for IdentityServer {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.name.clone(),
            vendor_version: self.version.clone(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(true)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        if self.controller {
            Ok(vec![PluginCapability::ControllerService])
        } else {
            Ok(Vec::new())
        }
    }
}
