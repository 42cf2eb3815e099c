use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::MasterRpcService;
use crate::master::MasterHandle;
use crate::proto::master_service_server::MasterServiceServer;

pub struct MasterServer {
    master: MasterHandle,
}

impl MasterServer {
    pub fn new(master: MasterHandle) -> Self {
        Self { master }
    }

    /// Serve on an already bound listener until `shutdown` fires.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), tonic::transport::Error> {
        let addr: Option<SocketAddr> = listener.local_addr().ok();
        tracing::info!(addr = ?addr, "Starting gRPC server");

        Server::builder()
            .add_service(MasterServiceServer::new(MasterRpcService::new(self.master)))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.cancelled().await;
                tracing::info!("gRPC server shutting down");
            })
            .await
    }
}
