//! Client streams.
//!
//! Every stream gets one driver task. The driver pulls requests from the
//! client while fewer than `prefetch` are in flight, polls all of their
//! traversals itself and forwards each response as soon as it completes, so
//! the client sees completion order. Nothing a driver owns is shared with
//! another task.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, FuturesUnordered};
use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::config::GatewayConfig;
use crate::dispatch::Dispatcher;
use crate::error::{GatewayError, Result};
use crate::metrics::GatewayMetrics;
use crate::request::DataRequest;
use crate::traversal::{traverse, unresolved};

const RESPONSE_BUFFER: usize = 64;

type InFlight = BoxFuture<'static, (u64, DataRequest)>;

#[derive(Clone)]
pub struct Streamer {
    dispatcher: Arc<Dispatcher>,
    config: GatewayConfig,
    metrics: GatewayMetrics,
    streams: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Streamer {
    pub fn new(dispatcher: Arc<Dispatcher>, config: GatewayConfig, shutdown: CancellationToken) -> Self {
        let metrics = dispatcher.metrics().clone();
        Self {
            streams: Arc::new(Semaphore::new(config.max_streams)),
            dispatcher,
            config,
            metrics,
            shutdown,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Starts a driver for `ingress` and returns its responses. An `Err`
    /// item from the ingress cancels the stream.
    pub fn open<S>(&self, ingress: S) -> Result<ReceiverStream<DataRequest>>
    where
        S: Stream<Item = Result<DataRequest>> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(GatewayError::Cancelled("the gateway is shutting down".into()));
        }
        let permit = self.streams.clone().try_acquire_owned().map_err(|_| {
            GatewayError::ResourceExhausted(format!(
                "{} client streams are already open",
                self.config.max_streams
            ))
        })?;

        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        let driver = Driver {
            dispatcher: self.dispatcher.clone(),
            metrics: self.metrics.clone(),
            prefetch: self.config.prefetch,
            drain: self.config.drain,
            cancel: self.shutdown.child_token(),
            tx,
            in_flight: FuturesUnordered::new(),
            unresolved: BTreeMap::new(),
            next_seq: 0,
        };
        let span = info_span!("stream");
        tokio::spawn(
            async move {
                let _permit = permit;
                driver.run(ingress.boxed()).await;
            }
            .instrument(span),
        );
        Ok(ReceiverStream::new(rx))
    }

    /// Runs `request` as a stream of one.
    pub async fn unary(&self, request: DataRequest) -> Result<DataRequest> {
        let mut responses = self.open(futures::stream::once(async { Ok(request) }))?;
        responses
            .next()
            .await
            .ok_or_else(|| GatewayError::Internal("stream closed without a response".into()))
    }

    pub fn active_streams(&self) -> usize {
        self.config.max_streams - self.streams.available_permits()
    }

    /// Waits until every open stream has closed, at most `timeout`.
    pub async fn wait_idle(&self, timeout: std::time::Duration) -> bool {
        let all = u32::try_from(self.config.max_streams).unwrap_or(u32::MAX);
        matches!(
            tokio::time::timeout(timeout, self.streams.acquire_many(all)).await,
            Ok(Ok(_))
        )
    }
}

struct Driver {
    dispatcher: Arc<Dispatcher>,
    metrics: GatewayMetrics,
    prefetch: usize,
    drain: std::time::Duration,
    cancel: CancellationToken,
    tx: mpsc::Sender<DataRequest>,
    in_flight: FuturesUnordered<InFlight>,
    /// `(request_id, exec_endpoint)` of every request still in flight.
    unresolved: BTreeMap<u64, (String, String)>,
    next_seq: u64,
}

impl Driver {
    async fn run(mut self, mut ingress: BoxStream<'static, Result<DataRequest>>) {
        self.metrics.stream_opened();
        let mut ingress_open = true;
        let mut gated_since: Option<Instant> = None;
        let mut cancelled = false;

        loop {
            if !ingress_open && self.in_flight.is_empty() {
                break;
            }
            let gate_open = self.prefetch == 0 || self.in_flight.len() < self.prefetch;
            match (gate_open, gated_since) {
                (false, None) => gated_since = Some(Instant::now()),
                (true, Some(since)) => {
                    self.metrics.observe_prefetch_wait(since.elapsed());
                    gated_since = None;
                }
                _ => {}
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("stream cancelled by shutdown");
                    cancelled = true;
                    break;
                }
                _ = self.tx.closed() => {
                    debug!("client went away");
                    cancelled = true;
                    break;
                }
                Some((seq, response)) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    if !self.respond(seq, response).await {
                        cancelled = true;
                        break;
                    }
                }
                item = ingress.next(), if ingress_open && gate_open => match item {
                    Some(Ok(request)) => self.admit(request),
                    Some(Err(e)) => {
                        debug!("ingress failed: {e}");
                        cancelled = true;
                        break;
                    }
                    None => ingress_open = false,
                },
            }
        }

        drop(ingress);
        if cancelled {
            self.drain().await;
        }
        self.metrics.stream_closed();
    }

    fn admit(&mut self, mut request: DataRequest) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.metrics.in_flight_inc();

        let id = match request.ensure_request_id() {
            Ok(id) => id,
            Err(e) => {
                // the traversal answers it with BAD_REQUEST
                debug!("undecodable request: {e}");
                String::new()
            }
        };
        let endpoint = request.exec_endpoint().unwrap_or_default().to_string();
        self.unresolved.insert(seq, (id, endpoint));
        let future: InFlight = traverse(self.dispatcher.clone(), request)
            .map(move |response| (seq, response))
            .boxed();
        self.in_flight.push(future);
    }

    /// Forwards a response; false once the client stopped listening.
    async fn respond(&mut self, seq: u64, response: DataRequest) -> bool {
        self.unresolved.remove(&seq);
        self.metrics.in_flight_dec();
        self.tx.send(response).await.is_ok()
    }

    /// Gives in-flight requests up to `drain` to settle, then answers the
    /// rest with an error. Dropping their traversals cancels the executor
    /// calls still running.
    async fn drain(&mut self) {
        let deadline = tokio::time::sleep(self.drain);
        tokio::pin!(deadline);
        while !self.in_flight.is_empty() {
            tokio::select! {
                Some((seq, response)) = self.in_flight.next() => {
                    self.respond(seq, response).await;
                }
                _ = &mut deadline => break,
            }
        }

        let left = std::mem::take(&mut self.unresolved);
        if !left.is_empty() {
            warn!(requests = left.len(), "stream closed with requests still in flight");
        }
        self.in_flight = FuturesUnordered::new();
        let error = GatewayError::Cancelled("the stream closed before the request completed".into());
        for (_, (id, endpoint)) in left {
            self.metrics.in_flight_dec();
            let _ = self.tx.send(unresolved(&id, &endpoint, &error)).await;
        }
    }
}
