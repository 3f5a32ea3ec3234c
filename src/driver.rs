//! CSI dispatcher: transport binding and gRPC service registration.
//!
//! The Identity and Node services are always registered (node sidecars probe
//! capabilities regardless of role); the Controller service only when the
//! driver runs in controller mode.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::codegen::http;
use tonic::transport::Server;
use tower::{Layer, Service};
use tracing::{debug, error, info};
use url::Url;

use crate::controller::ControllerService;
use crate::csi::controller_server::ControllerServer;
use crate::csi::identity_server::IdentityServer;
use crate::csi::node_server::NodeServer;
use crate::identity::IdentityService;
use crate::node::NodeService;

/// Serve the CSI services on the configured endpoint until shutdown.
pub async fn serve(
    endpoint: &str,
    controller: Option<ControllerService>,
    node: NodeService,
) -> Result<(), Box<dyn std::error::Error>> {
    let url = Url::parse(endpoint)?;

    let mut server = Server::builder().layer(RpcLogLayer);
    let mut router = server.add_service(IdentityServer::new(IdentityService::new()));
    if let Some(controller) = controller {
        router = router.add_service(ControllerServer::new(controller));
    }
    let router = router.add_service(NodeServer::new(node));

    match url.scheme() {
        "unix" => {
            let path = url.path().to_string();
            if path.is_empty() {
                return Err("Unix endpoint is missing a socket path".into());
            }
            // A stale socket from a previous run blocks the bind.
            if std::path::Path::new(&path).exists() {
                std::fs::remove_file(&path)?;
            }
            if let Some(parent) = std::path::Path::new(&path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            let listener = UnixListener::bind(&path)?;
            info!(socket = %path, "CSI server listening on unix socket");
            router
                .serve_with_incoming(UnixListenerStream::new(listener))
                .await?;
        }
        "tcp" => {
            let host = url
                .host_str()
                .ok_or("TCP endpoint is missing a host")?;
            let port = url.port().ok_or("TCP endpoint is missing a port")?;
            let addr = format!("{host}:{port}").parse()?;
            info!(addr = %addr, "CSI server listening on tcp");
            router.serve(addr).await?;
        }
        scheme => {
            return Err(format!("Unsupported endpoint scheme: {scheme}").into());
        }
    }

    Ok(())
}

/// Tower layer that logs each RPC's method path and any non-OK grpc-status
/// carried in the response headers. Responses pass through untouched.
#[derive(Debug, Clone, Default)]
pub struct RpcLogLayer;

impl<S> Layer<S> for RpcLogLayer {
    type Service = RpcLog<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RpcLog { inner }
    }
}

#[derive(Debug, Clone)]
pub struct RpcLog<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for RpcLog<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        let method = req.uri().path().to_string();
        debug!(method = %method, "RPC call");

        let fut = self.inner.call(req);
        Box::pin(async move {
            let response = fut.await?;
            if let Some(status) = response.headers().get("grpc-status")
                && status.as_bytes() != b"0"
            {
                let message = response
                    .headers()
                    .get("grpc-message")
                    .and_then(|m| m.to_str().ok())
                    .unwrap_or("");
                error!(
                    method = %method,
                    grpc_status = ?status,
                    message = %message,
                    "RPC failed"
                );
            }
            Ok(response)
        })
    }
}
