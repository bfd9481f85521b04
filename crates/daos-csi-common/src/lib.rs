//! # daos-csi-common
//!
//! Shared types, error definitions, configuration models, and constants
//! used across the DAOS CSI driver workspace.
//!
//! This crate is the leaf of the dependency graph. It holds the pure
//! pieces of the driver: the volume id and kubelet path codecs, the
//! handoff payload exchanged with the sidecar, and the error taxonomy
//! that maps onto CSI status codes.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod paths;
pub mod types;
