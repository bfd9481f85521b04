//! gRPC front end: the CSI `Identity` and `Node` services on tonic.
//!
//! Only the identity service is registered when the node service is
//! disabled. Anything not registered or not declared in `csi.proto`
//! (the controller service, `NodeStageVolume`, ...) is answered with
//! `UNIMPLEMENTED` by tonic's router.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use daos_csi_common::error::{Code, CsiError, Result};
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::csi::identity_server::{Identity, IdentityServer};
use crate::csi::node_server::{Node, NodeServer};
use crate::csi::{
    GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse, GetPluginInfoRequest,
    GetPluginInfoResponse, NodeGetCapabilitiesRequest, NodeGetCapabilitiesResponse,
    NodeGetInfoRequest, NodeGetInfoResponse, NodePublishVolumeRequest, NodePublishVolumeResponse,
    NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse, ProbeRequest, ProbeResponse,
};
use crate::driver::DaosDriver;
use crate::endpoint::Endpoint;

type RpcResult<T> = std::result::Result<Response<T>, Status>;

/// Converts a driver error into the status sent to the orchestrator.
pub fn status_from(err: &CsiError) -> Status {
    let message = err.to_string();
    match err.code() {
        Code::InvalidArgument => Status::invalid_argument(message),
        Code::NotFound => Status::not_found(message),
        Code::Aborted => Status::aborted(message),
        Code::ResourceExhausted => Status::resource_exhausted(message),
        Code::Internal => Status::internal(message),
    }
}

fn respond<T>(method: &'static str, result: Result<T>) -> RpcResult<T> {
    match result {
        Ok(reply) => {
            tracing::debug!(method, "request served");
            Ok(Response::new(reply))
        }
        Err(e) => {
            tracing::warn!(method, code = %e.code(), error = %e, "request failed");
            Err(status_from(&e))
        }
    }
}

/// `csi.v1.Identity` backed by the driver's identity service.
#[derive(Clone)]
pub struct IdentityHandler {
    driver: Arc<DaosDriver>,
}

impl IdentityHandler {
    /// Serves the identity half of `driver`.
    pub const fn new(driver: Arc<DaosDriver>) -> Self {
        Self { driver }
    }
}

#[tonic::async_trait]
impl Identity for IdentityHandler {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> RpcResult<GetPluginInfoResponse> {
        respond("GetPluginInfo", Ok(self.driver.identity().get_plugin_info()))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> RpcResult<GetPluginCapabilitiesResponse> {
        respond(
            "GetPluginCapabilities",
            Ok(self.driver.identity().get_plugin_capabilities()),
        )
    }

    async fn probe(&self, _request: Request<ProbeRequest>) -> RpcResult<ProbeResponse> {
        respond("Probe", Ok(self.driver.identity().probe()))
    }
}

/// `csi.v1.Node` backed by the driver's node service.
#[derive(Clone)]
pub struct NodeHandler {
    driver: Arc<DaosDriver>,
}

impl NodeHandler {
    /// Serves the node half of `driver`.
    pub const fn new(driver: Arc<DaosDriver>) -> Self {
        Self { driver }
    }
}

#[tonic::async_trait]
impl Node for NodeHandler {
    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> RpcResult<NodePublishVolumeResponse> {
        let result = self.driver.node().publish_volume(request.into_inner()).await;
        respond("NodePublishVolume", result)
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> RpcResult<NodeUnpublishVolumeResponse> {
        let result = self.driver.node().unpublish_volume(request.into_inner()).await;
        respond("NodeUnpublishVolume", result)
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> RpcResult<NodeGetCapabilitiesResponse> {
        respond(
            "NodeGetCapabilities",
            Ok(self.driver.node().get_capabilities()),
        )
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> RpcResult<NodeGetInfoResponse> {
        respond("NodeGetInfo", Ok(self.driver.node().get_info()))
    }
}

/// Serves the CSI services of `driver` on `endpoint` until `shutdown`
/// resolves. With `serve_node` unset only `csi.v1.Identity` is served.
///
/// A unix socket file is removed when the server stops.
///
/// # Errors
///
/// Returns [`CsiError::Io`] if the endpoint cannot be bound or the
/// transport fails.
pub async fn serve<F>(
    endpoint: &Endpoint,
    driver: Arc<DaosDriver>,
    serve_node: bool,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let node = serve_node.then(|| NodeServer::new(NodeHandler::new(Arc::clone(&driver))));
    let router = Server::builder()
        .add_service(IdentityServer::new(IdentityHandler::new(driver)))
        .add_optional_service(node);

    match endpoint {
        Endpoint::Unix(path) => {
            let listener = tokio::net::UnixListener::bind(path).map_err(|e| CsiError::Io {
                path: path.clone(),
                source: e,
            })?;
            tracing::info!(%endpoint, serve_node, "listening for CSI requests");
            let served = router
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
                .await;
            let _ = std::fs::remove_file(path);
            served.map_err(|e| transport_error(path.clone(), e))?;
        }
        Endpoint::Tcp(addr) => {
            let listener = tokio::net::TcpListener::bind(addr.as_str())
                .await
                .map_err(|e| CsiError::Io {
                    path: addr.into(),
                    source: e,
                })?;
            tracing::info!(%endpoint, serve_node, "listening for CSI requests");
            router
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
                .await
                .map_err(|e| transport_error(addr.into(), e))?;
        }
    }
    tracing::info!(%endpoint, "server stopped");
    Ok(())
}

fn transport_error(path: PathBuf, err: tonic::transport::Error) -> CsiError {
    CsiError::Io {
        path,
        source: std::io::Error::other(err),
    }
}
