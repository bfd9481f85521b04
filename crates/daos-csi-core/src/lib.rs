//! # daos-csi-core
//!
//! Low-level mount primitives for the DAOS CSI driver.
//!
//! This crate provides safe abstractions over:
//! - **Target locks**: non-blocking per-target-path mutual exclusion.
//! - **FUSE brokering**: opening `/dev/fuse` and binding it to a mount point.
//! - **Mount table**: mount, unmount, and mount-point detection.
//! - **Descriptor passing**: `SCM_RIGHTS` transfer over Unix sockets.
//! - **Handoff**: the bounded-lifetime rendezvous that gives the FUSE
//!   handle to the sidecar.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod fdpass;
pub mod fuse;
pub mod handoff;
pub mod lock;
pub mod mount;
pub mod workdir;
