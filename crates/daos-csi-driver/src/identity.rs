//! CSI identity service.

use std::collections::HashMap;
use std::sync::Arc;

use daos_csi_common::config::DriverConfig;

use crate::csi::{GetPluginCapabilitiesResponse, GetPluginInfoResponse, ProbeResponse};

/// Answers who the plugin is and whether it is alive.
#[derive(Debug, Clone)]
pub struct IdentityService {
    config: Arc<DriverConfig>,
}

impl IdentityService {
    /// Creates the service for a validated configuration.
    pub const fn new(config: Arc<DriverConfig>) -> Self {
        Self { config }
    }

    /// `GetPluginInfo`.
    pub fn get_plugin_info(&self) -> GetPluginInfoResponse {
        GetPluginInfoResponse {
            name: self.config.name.clone(),
            vendor_version: self.config.version.clone(),
            manifest: HashMap::new(),
        }
    }

    /// `GetPluginCapabilities`. The plugin runs no controller service.
    pub fn get_plugin_capabilities(&self) -> GetPluginCapabilitiesResponse {
        GetPluginCapabilitiesResponse::default()
    }

    /// `Probe`. An unset `ready` means ready.
    pub fn probe(&self) -> ProbeResponse {
        ProbeResponse::default()
    }
}
