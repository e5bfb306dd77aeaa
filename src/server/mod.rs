use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status};
use tracing::{info, instrument, warn};

use crate::engine::exchange::{Exchange, ExchangeError};
use crate::models::pb::exchange_server::{Exchange as ExchangeRpc, ExchangeServer};
use crate::models::{DealId, NewOrder, pb};

impl From<ExchangeError> for Status {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::NotFound { .. } => Status::not_found(err.to_string()),
            ExchangeError::InvalidOrder(_) => Status::invalid_argument(err.to_string()),
            ExchangeError::FeedClosed => Status::unavailable(err.to_string()),
        }
    }
}

/// gRPC face of an [`Exchange`].
#[derive(Clone)]
pub struct ExchangeService {
    exchange: Arc<Exchange>,
}

impl ExchangeService {
    pub fn new(exchange: Arc<Exchange>) -> Self {
        Self { exchange }
    }

    pub fn into_server(self) -> ExchangeServer<Self> {
        ExchangeServer::new(self)
    }
}

#[async_trait::async_trait]
impl ExchangeRpc for ExchangeService {
    type StatisticStream = BoxStream<'static, Result<pb::Ohlcv, Status>>;
    type ResultsStream = BoxStream<'static, Result<pb::Fill, Status>>;

    #[instrument(skip_all)]
    async fn create(&self, request: Request<pb::Order>) -> Result<Response<pb::DealId>, Status> {
        let order = NewOrder::try_from(request.into_inner()).map_err(ExchangeError::from)?;
        let deal = self.exchange.create(order)?;
        Ok(Response::new(deal.into()))
    }

    #[instrument(skip_all)]
    async fn cancel(&self, request: Request<pb::DealId>) -> Result<Response<pb::CancelResult>, Status> {
        let deal = DealId::from(request.into_inner());
        self.exchange.cancel(deal)?;
        Ok(Response::new(pb::CancelResult { success: true }))
    }

    async fn statistic(&self, request: Request<pb::BrokerId>) -> Result<Response<Self::StatisticStream>, Status> {
        let broker_id = request.into_inner().id;
        let bars = self.exchange.statistic(broker_id)?;
        let stream = bars.into_stream().map(|bar| Ok(pb::Ohlcv::from(bar)));
        Ok(Response::new(stream.boxed()))
    }

    async fn results(&self, request: Request<pb::BrokerId>) -> Result<Response<Self::ResultsStream>, Status> {
        let broker_id = request.into_inner().id;
        let fills = self.exchange.results(broker_id);
        let stream = fills.into_stream().map(|fill| Ok(pb::Fill::from(fill)));
        Ok(Response::new(stream.boxed()))
    }
}

pub async fn serve<F>(exchange: Arc<Exchange>, addr: SocketAddr, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind(addr).await?;
    serve_with_listener(exchange, listener, shutdown).await
}

/// Serves on an already bound listener until `shutdown` resolves.
///
/// The exchange is shut down before the server drains, so open streams end
/// and the graceful stop can complete.
pub async fn serve_with_listener<F>(exchange: Arc<Exchange>, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send,
{
    let addr = listener.local_addr()?;
    info!(%addr, "exchange server listening");
    let stopping = Arc::clone(&exchange);
    let signal = async move {
        shutdown.await;
        info!("shutdown requested");
        stopping.shutdown();
    };
    let result = tonic::transport::Server::builder()
        .add_service(ExchangeService::new(Arc::clone(&exchange)).into_server())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
        .await;
    exchange.shutdown();
    if let Err(err) = &result {
        warn!(%err, "exchange server stopped with error");
    }
    info!("exchange server stopped");
    Ok(result?)
}
