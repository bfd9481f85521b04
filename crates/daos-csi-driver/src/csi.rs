//! CSI v1 messages and gRPC stubs generated from `proto/csi.proto`.
//!
//! The identity and node servers live in `identity_server` and
//! `node_server`; the matching clients are used by the integration tests.

#![allow(
    missing_docs,
    unused_results,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used
)]

tonic::include_proto!("csi.v1");
