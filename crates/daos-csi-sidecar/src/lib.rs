//! # daos-csi-sidecar
//!
//! Runs inside the workload pod. For every volume the driver staged in the
//! shared emptyDir it connects to the rendezvous socket, receives the
//! mounted FUSE handle, and runs `dfuse` serving that handle as fd 3.
//! Failures are written to the volume's error file, where the driver
//! picks them up on the next publish.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod launcher;
pub mod supervisor;
