use crate::ack::{self, AckAction, Escalation, RejectionTracker};
use crate::reading;
use crate::sink::{DeliveryOutcome, DeliverySink};
use anyhow::Result;
use futures::{Stream, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;


/// A message handed out by the broker.
pub struct InboundDelivery<H> {
    pub tag: u64,
    pub payload: Vec<u8>,
    pub redelivered: bool,
    pub handle: H,
}

/// Single-use acknowledgment for one delivery. Every method consumes the handle.
pub trait DeliveryHandle: Send {
    fn commit(self) -> impl Future<Output = Result<()>> + Send;
    fn requeue(self) -> impl Future<Output = Result<()>> + Send;
    fn discard(self) -> impl Future<Output = Result<()>> + Send;
    /// Moves the payload to the dead-letter destination and commits the original.
    /// When the dead-letter publish fails the original is requeued instead; the
    /// returned action is the one actually applied.
    fn dead_letter(
        self,
        payload: &[u8],
        reason: &str,
        rejections: u32,
    ) -> impl Future<Output = Result<AckAction>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Processing,
    Terminated,
}

#[derive(Debug, Default)]
pub struct WorkerStats {
    pub received: AtomicU64,
    pub committed: AtomicU64,
    pub requeued: AtomicU64,
    pub discarded: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub ack_failures: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub committed: u64,
    pub requeued: u64,
    pub discarded: u64,
    pub dead_lettered: u64,
    pub ack_failures: u64,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
        }
    }

    fn record_applied(&self, action: AckAction) {
        let counter = match action {
            AckAction::Commit => &self.committed,
            AckAction::RequeueRetry => &self.requeued,
            AckAction::DiscardPoison => &self.discarded,
            AckAction::DeadLetter => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }
}

/// What to do with one delivery, and why.
struct Decision {
    action: AckAction,
    reason: String,
    rejections: u32,
}

/// Sequential decode → deliver → decide → ack driver for one delivery stream.
pub struct ConsumeLoop<S> {
    sink: S,
    tracker: Arc<RejectionTracker>,
    requeue_delay: Duration,
    stats: Arc<WorkerStats>,
    state: LoopState,
}

impl<S: DeliverySink + Send + Sync> ConsumeLoop<S> {
    pub fn new(sink: S, tracker: Arc<RejectionTracker>, requeue_delay: Duration) -> Self {
        Self {
            sink,
            tracker,
            requeue_delay,
            stats: Arc::new(WorkerStats::new()),
            state: LoopState::Idle,
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Runs until `shutdown` fires, the stream ends, or the stream yields an error.
    ///
    /// A delivery still being processed when `shutdown` fires is dropped without an
    /// ack call so the broker redelivers it.
    pub async fn run<St, H, E>(&mut self, mut deliveries: St, shutdown: CancellationToken) -> Result<()>
    where
        St: Stream<Item = Result<InboundDelivery<H>, E>> + Unpin + Send,
        H: DeliveryHandle,
        E: std::fmt::Display + Send,
    {
        loop {
            self.state = LoopState::Idle;
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("consume loop stopping on shutdown");
                    self.state = LoopState::Terminated;
                    return Ok(());
                }
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => {
                    self.state = LoopState::Terminated;
                    self.stats.record_error(err.to_string());
                    tracing::error!(error=%err, "broker delivery stream failed");
                    return Err(anyhow::anyhow!("broker delivery stream failed: {err}"));
                }
                None => {
                    self.state = LoopState::Terminated;
                    tracing::warn!("broker delivery stream ended");
                    return Ok(());
                }
            };

            self.state = LoopState::Processing;
            self.stats.received.fetch_add(1, Ordering::Relaxed);
            let span = tracing::info_span!(
                "delivery",
                delivery_tag = delivery.tag,
                redelivered = delivery.redelivered
            );

            let step = async {
                let decided = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => None,
                    decided = self.decide(&delivery.payload, delivery.redelivered) => Some(decided),
                };
                let Some(decision) = decided else {
                    tracing::warn!("shutdown during processing; leaving delivery unacknowledged");
                    return false;
                };
                self.apply(delivery, decision, &shutdown).await;
                true
            };
            if !step.instrument(span).await {
                self.state = LoopState::Terminated;
                return Ok(());
            }
        }
    }

    async fn decide(&self, payload: &[u8], redelivered: bool) -> Decision {
        let decoded = reading::decode(payload);
        let outcome = match &decoded {
            Ok(reading) => Some(self.sink.deliver(reading).await),
            Err(err) => {
                tracing::warn!(error=%err, bytes = payload.len(), "discarding undecodable payload");
                None
            }
        };

        let action = ack::decide(&decoded, outcome.as_ref());
        let Escalation { action, rejections } = self
            .tracker
            .escalate(payload, redelivered, outcome.as_ref(), action);

        let reason = match &outcome {
            Some(DeliveryOutcome::Delivered) => {
                if let Ok(reading) = &decoded {
                    tracing::info!(
                        temperature = reading.temperature,
                        humidity = reading.humidity,
                        timestamp = %reading.timestamp,
                        "reading delivered"
                    );
                }
                String::new()
            }
            Some(DeliveryOutcome::TransientFailure(reason)) => {
                tracing::warn!(reason=%reason, "sink unreachable; will retry");
                reason.to_string()
            }
            Some(DeliveryOutcome::RejectedByReceiver { status, body }) => {
                if action == AckAction::RequeueRetry {
                    tracing::warn!(
                        status = *status,
                        rejections,
                        "receiver rejected reading; will retry"
                    );
                }
                format!("status {status}: {body}")
            }
            None => decoded.err().map(|err| err.to_string()).unwrap_or_default(),
        };
        Decision {
            action,
            reason,
            rejections,
        }
    }

    async fn apply<H: DeliveryHandle>(
        &mut self,
        delivery: InboundDelivery<H>,
        decision: Decision,
        shutdown: &CancellationToken,
    ) {
        let InboundDelivery {
            tag,
            payload,
            handle,
            ..
        } = delivery;
        let Decision {
            action,
            reason,
            rejections,
        } = decision;

        if action == AckAction::RequeueRetry && !self.requeue_delay.is_zero() {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(self.requeue_delay) => {}
            }
        }

        let result = match action {
            AckAction::Commit => handle.commit().await.map(|_| action),
            AckAction::RequeueRetry => handle.requeue().await.map(|_| action),
            AckAction::DiscardPoison => handle.discard().await.map(|_| action),
            AckAction::DeadLetter => handle.dead_letter(&payload, &reason, rejections).await,
        };

        match result {
            Ok(applied) => {
                if applied != action {
                    tracing::warn!(decided=%action, applied=%applied, "fell back to a different acknowledgment");
                }
                tracing::debug!(delivery_tag = tag, action=%applied, "acknowledged delivery");
                self.stats.record_applied(applied);
            }
            Err(err) => {
                self.stats.ack_failures.fetch_add(1, Ordering::Relaxed);
                self.stats.record_error(err.to_string());
                tracing::error!(error=%err, delivery_tag = tag, action=%action, "acknowledgment failed");
            }
        }
    }
}
