use crate::reading::{DecodeError, Reading};
use crate::sink::DeliveryOutcome;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Upper bound on payloads the rejection tracker remembers.
const MAX_TRACKED_PAYLOADS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    /// `basic.ack`: the record reached the sink.
    Commit,
    /// `basic.nack` with requeue.
    RequeueRetry,
    /// `basic.nack` without requeue; the payload can never decode.
    DiscardPoison,
    /// Publish to the dead-letter queue, then `basic.ack`.
    DeadLetter,
}

impl fmt::Display for AckAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AckAction::Commit => "commit",
            AckAction::RequeueRetry => "requeue",
            AckAction::DiscardPoison => "discard",
            AckAction::DeadLetter => "dead_letter",
        })
    }
}

/// Maps a decode result and the sink outcome to the acknowledgment for the delivery.
///
/// Receiver rejections are retried like transport failures. A decoded reading
/// with no recorded delivery attempt is retried as well.
pub fn decide(decoded: &Result<Reading, DecodeError>, outcome: Option<&DeliveryOutcome>) -> AckAction {
    match (decoded, outcome) {
        (Err(_), _) => AckAction::DiscardPoison,
        (Ok(_), Some(DeliveryOutcome::Delivered)) => AckAction::Commit,
        (Ok(_), Some(DeliveryOutcome::TransientFailure(_))) => AckAction::RequeueRetry,
        (Ok(_), Some(DeliveryOutcome::RejectedByReceiver { .. })) => AckAction::RequeueRetry,
        (Ok(_), None) => AckAction::RequeueRetry,
    }
}

/// Counts receiver rejections per payload and escalates to [`AckAction::DeadLetter`]
/// once `max_rejections` is reached. Without a threshold every decision passes through.
///
/// The broker only tells us whether a delivery was seen before, so the count lives
/// here, keyed by the payload digest. One tracker is shared by every worker on the
/// queue; a requeued message may come back on any consumer.
#[derive(Debug)]
pub struct RejectionTracker {
    max_rejections: Option<u32>,
    counts: Mutex<HashMap<[u8; 32], u32>>,
}

/// Result of [`RejectionTracker::escalate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Escalation {
    pub action: AckAction,
    /// Rejections observed for the payload, including this one.
    pub rejections: u32,
}

impl RejectionTracker {
    pub fn new(max_rejections: Option<u32>) -> Self {
        Self {
            max_rejections,
            counts: Mutex::new(HashMap::new()),
        }
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<[u8; 32], u32>> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rejections recorded so far for `payload`.
    #[cfg(test)]
    pub fn rejections(&self, payload: &[u8]) -> u32 {
        self.counts().get(&digest(payload)).copied().unwrap_or(0)
    }

    pub fn escalate(
        &self,
        payload: &[u8],
        redelivered: bool,
        outcome: Option<&DeliveryOutcome>,
        action: AckAction,
    ) -> Escalation {
        let passed = Escalation {
            action,
            rejections: 0,
        };
        let Some(max) = self.max_rejections else {
            return passed;
        };
        let key = digest(payload);
        let mut counts = self.counts();
        if !redelivered {
            counts.remove(&key);
        }

        match (action, outcome) {
            (AckAction::RequeueRetry, Some(DeliveryOutcome::RejectedByReceiver { .. })) => {
                if !counts.contains_key(&key) && counts.len() >= MAX_TRACKED_PAYLOADS {
                    tracing::debug!(tracked = counts.len(), "rejection tracker full; resetting");
                    counts.clear();
                }
                let count = counts.entry(key).or_insert(0);
                *count = count.saturating_add(1);
                let rejections = *count;
                if rejections >= max {
                    counts.remove(&key);
                    Escalation {
                        action: AckAction::DeadLetter,
                        rejections,
                    }
                } else {
                    Escalation {
                        action: AckAction::RequeueRetry,
                        rejections,
                    }
                }
            }
            (AckAction::RequeueRetry, _) => Escalation {
                action,
                rejections: counts.get(&key).copied().unwrap_or(0),
            },
            _ => {
                counts.remove(&key);
                passed
            }
        }
    }
}

fn digest(payload: &[u8]) -> [u8; 32] {
    Sha256::digest(payload).into()
}
