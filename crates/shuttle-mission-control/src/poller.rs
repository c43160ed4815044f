use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use shuttle_core::pubsub::{SubscribeResponse, SUBSCRIBE_NUM_RECORDS};
use shuttle_core::{classify, decode_latest, reconcile, topic_name};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::store::{PollStats, ShuttleWriter};

pub const POLL_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("No auth token found")]
    Unauthenticated,
    #[error("pub/sub topic not configured")]
    TopicNotConfigured,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

impl PollError {
    /// Errors raised before any request was issued.
    pub fn is_tick_skip(&self) -> bool {
        matches!(self, PollError::Unauthenticated | PollError::TopicNotConfigured)
    }
}

/// Inputs the poller needs on every tick. May change while running.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollContext {
    pub token: Option<String>,
    pub api_name: Option<String>,
    pub robot_name: Option<String>,
}

impl PollContext {
    pub fn token(&self) -> Option<&str> {
        self.token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    pub fn topic(&self) -> Option<String> {
        topic_name(self.api_name.as_deref()?, self.robot_name.as_deref()?)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub topic: String,
    pub token: String,
    pub num_records: usize,
}

#[async_trait]
pub trait SubscribeClient: Send + Sync + 'static {
    async fn fetch_recent(&self, request: SubscribeRequest) -> Result<SubscribeResponse, PollError>;
}

pub struct HttpSubscribeClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpSubscribeClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn subscribe_url(&self) -> String {
        format!("{}/subscribe", self.base_url)
    }
}

#[async_trait]
impl SubscribeClient for HttpSubscribeClient {
    async fn fetch_recent(&self, request: SubscribeRequest) -> Result<SubscribeResponse, PollError> {
        let num_records = request.num_records.to_string();
        let response = self
            .http
            .get(self.subscribe_url())
            .query(&[
                ("topic", request.topic.as_str()),
                ("num_records", num_records.as_str()),
            ])
            .bearer_auth(&request.token)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .map_err(|err| PollError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PollError::Transport(format!("HTTP {status}")));
        }
        response
            .json::<SubscribeResponse>()
            .await
            .map_err(|err| PollError::Transport(format!("invalid response body: {err}")))
    }
}

struct InFlight {
    seq: u64,
    handle: JoinHandle<()>,
}

struct Completed {
    seq: u64,
    result: Result<SubscribeResponse, PollError>,
}

pub struct Poller<C> {
    client: Arc<C>,
    context: watch::Receiver<PollContext>,
    writer: ShuttleWriter,
    interval: Duration,
}

pub struct PollerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<PollStats>,
}

impl PollerHandle {
    /// Stop ticking and abort any request still in flight.
    pub async fn stop(mut self) -> PollStats {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.task.await.unwrap_or_default()
    }
}

impl<C: SubscribeClient> Poller<C> {
    pub fn new(client: Arc<C>, context: watch::Receiver<PollContext>, writer: ShuttleWriter) -> Self {
        Self {
            client,
            context,
            writer,
            interval: POLL_INTERVAL,
        }
    }

    #[cfg(test)]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn start(self) -> PollerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(shutdown_rx));
        PollerHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    async fn run(self, mut shutdown: oneshot::Receiver<()>) -> PollStats {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let (done_tx, mut done_rx) = mpsc::channel::<Completed>(8);
        let mut in_flight: Option<InFlight> = None;
        let mut next_seq = 0u64;
        let mut active_topic: Option<String> = None;

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.writer.record_tick();
                    let context = self.context.borrow().clone();
                    match prepare_request(&context) {
                        Ok(request) => {
                            if active_topic.as_deref() != Some(request.topic.as_str()) {
                                if active_topic.is_some() {
                                    info!(event = "poll_topic_changed", topic = %request.topic);
                                }
                                // nothing from the old topic may land after the reset
                                if let Some(previous) = in_flight.take() {
                                    debug!(event = "poll_aborted", seq = previous.seq);
                                    previous.handle.abort();
                                    self.writer.record_abort();
                                }
                                self.writer.reset_for_topic(Some(request.topic.clone()));
                                active_topic = Some(request.topic.clone());
                            }
                            if let Some(previous) = in_flight.take() {
                                debug!(event = "poll_aborted", seq = previous.seq);
                                previous.handle.abort();
                                self.writer.record_abort();
                            }
                            next_seq += 1;
                            let seq = next_seq;
                            let client = Arc::clone(&self.client);
                            let done_tx = done_tx.clone();
                            self.writer.record_request();
                            let handle = tokio::spawn(async move {
                                let result = client.fetch_recent(request).await;
                                let _ = done_tx.send(Completed { seq, result }).await;
                            });
                            in_flight = Some(InFlight { seq, handle });
                        }
                        Err(err) => {
                            warn!(event = "poll_tick_skipped", error = %err);
                            self.writer.report_error(err);
                        }
                    }
                }
                Some(done) = done_rx.recv() => {
                    let current = in_flight.as_ref().map(|flight| flight.seq);
                    if current == Some(done.seq) {
                        in_flight = None;
                        self.apply(done.result);
                    } else {
                        debug!(event = "poll_stale_discarded", seq = done.seq);
                        self.writer.record_stale();
                    }
                }
            }
        }

        if let Some(previous) = in_flight.take() {
            previous.handle.abort();
        }
        let stats = self.writer.current().stats.clone();
        info!(
            event = "poller_stopped",
            ticks = stats.ticks,
            applied = stats.applied,
            failures = stats.failures
        );
        stats
    }

    fn apply(&self, result: Result<SubscribeResponse, PollError>) {
        let body = match result {
            Ok(body) => body,
            Err(err) => {
                warn!(event = "poll_transport_error", error = %err);
                self.writer.report_error(err);
                return;
            }
        };
        if body.records.is_empty() {
            debug!(event = "poll_empty");
            self.writer.mark_empty();
            return;
        }

        let latest = decode_latest(&body.records);
        for err in &latest.errors {
            warn!(event = "poll_decode_error", error = %err);
        }
        let Some(first) = latest.first else {
            let reason = latest
                .errors
                .first()
                .map(|err| err.to_string())
                .unwrap_or_else(|| "newest record missing".to_string());
            self.writer.report_error(PollError::MalformedMessage(reason));
            return;
        };

        let second = latest.second.as_ref();
        let rule = classify(&first, second);
        let prev = self.writer.current();
        let next = reconcile(&prev.state, &first, second);
        debug!(
            event = "poll_applied",
            rule = rule.as_str(),
            store_row = next.store_row,
            store_rack = ?next.store_rack
        );
        self.writer.apply_state(next, first.updated_at);
    }
}

fn prepare_request(context: &PollContext) -> Result<SubscribeRequest, PollError> {
    let token = context.token().ok_or(PollError::Unauthenticated)?;
    let topic = context.topic().ok_or(PollError::TopicNotConfigured)?;
    Ok(SubscribeRequest {
        topic,
        token: token.to_string(),
        num_records: SUBSCRIBE_NUM_RECORDS,
    })
}
