//! Driver assembly and volume capability rules.

use std::sync::Arc;

use daos_csi_common::config::DriverConfig;
use daos_csi_common::error::{CsiError, Result};
use daos_csi_core::fdpass::DescriptorChannel;
use daos_csi_core::mount::Mounter;

use crate::csi::VolumeCapability;
use crate::csi::volume_capability::AccessType;
use crate::csi::volume_capability::access_mode::Mode;
use crate::identity::IdentityService;
use crate::node::NodeService;

/// Access modes a DAOS container can be published with. The container is
/// shared storage, so every multi-node mode is accepted.
pub const SUPPORTED_ACCESS_MODES: &[Mode] = &[
    Mode::SingleNodeWriter,
    Mode::SingleNodeReaderOnly,
    Mode::MultiNodeReaderOnly,
    Mode::MultiNodeSingleWriter,
    Mode::MultiNodeMultiWriter,
];

/// The identity and node services of one plugin instance.
pub struct DaosDriver {
    config: Arc<DriverConfig>,
    identity: IdentityService,
    node: NodeService,
}

impl DaosDriver {
    /// Validates `config` and builds both services.
    ///
    /// # Errors
    ///
    /// Returns [`CsiError::Config`] if the driver name or version is
    /// missing.
    pub fn new(
        config: DriverConfig,
        mounter: Arc<dyn Mounter>,
        channel: Arc<dyn DescriptorChannel>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        for mode in SUPPORTED_ACCESS_MODES {
            tracing::info!(mode = mode.as_str_name(), "enabling volume access mode");
        }
        tracing::info!(name = %config.name, version = %config.version, node_id = %config.node_id, "driver configured");
        Ok(Self {
            identity: IdentityService::new(Arc::clone(&config)),
            node: NodeService::new(Arc::clone(&config), mounter, channel),
            config,
        })
    }

    /// Effective configuration.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Identity service.
    pub const fn identity(&self) -> &IdentityService {
        &self.identity
    }

    /// Node service.
    pub const fn node(&self) -> &NodeService {
        &self.node
    }
}

/// Checks that a capability can be served.
///
/// # Errors
///
/// Returns [`CsiError::InvalidArgument`] when the access mode is absent or
/// unsupported, or when the access type is not `mount`.
pub fn validate_volume_capability(capability: &VolumeCapability) -> Result<()> {
    let Some(access_mode) = &capability.access_mode else {
        return Err(CsiError::invalid_argument(
            "volume capability access mode not set",
        ));
    };
    let mode = Mode::try_from(access_mode.mode).unwrap_or(Mode::Unknown);
    if !SUPPORTED_ACCESS_MODES.contains(&mode) {
        return Err(CsiError::invalid_argument(format!(
            "driver does not support access mode: {}",
            mode.as_str_name()
        )));
    }
    match &capability.access_type {
        Some(AccessType::Mount(_)) => Ok(()),
        Some(AccessType::Block(_)) => Err(CsiError::invalid_argument(
            "driver only supports mount access type volume capability",
        )),
        None => Err(CsiError::invalid_argument(
            "volume capability access type not set",
        )),
    }
}
