//! # daos-csi-driver
//!
//! CSI identity and node services for DAOS containers.
//!
//! [`driver::DaosDriver`] wires the services to a [`Mounter`] and a
//! [`DescriptorChannel`]; [`server`] serves them as the `csi.v1` gRPC
//! services generated into [`csi`].
//!
//! [`Mounter`]: daos_csi_core::mount::Mounter
//! [`DescriptorChannel`]: daos_csi_core::fdpass::DescriptorChannel

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod classify;
pub mod csi;
pub mod driver;
pub mod endpoint;
pub mod identity;
pub mod node;
pub mod server;
