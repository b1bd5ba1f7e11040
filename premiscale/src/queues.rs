//! The two typed, bounded queues the Supervisor owns (spec.md §2, §5): the
//! ASG queue (Reconciler → AutoscalerDispatcher) and the platform queue
//! (AutoscalerDispatcher → PlatformLink). Built on `tokio::sync::mpsc`:
//! producers are cloned freely (multi-producer), and each queue has exactly
//! one live consumer in this topology, which satisfies the multi-consumer
//! class of queue spec.md §2 calls for without needing a true MPMC crate.

use tokio::sync::mpsc;

use crate::action::{Action, AuditRecord};

pub type AsgQueueSender = mpsc::Sender<Action>;
pub type AsgQueueReceiver = mpsc::Receiver<Action>;

pub fn asg_queue(capacity: usize) -> (AsgQueueSender, AsgQueueReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Outbound traffic to the platform: audit records from the dispatcher plus
/// arbitrary telemetry payloads (spec.md §4.5).
#[derive(Debug, Clone)]
pub enum PlatformMessage {
    Audit(AuditRecord),
    Telemetry(serde_json::Value),
}

pub type PlatformQueueSender = mpsc::Sender<PlatformMessage>;
pub type PlatformQueueReceiver = mpsc::Receiver<PlatformMessage>;

pub fn platform_queue(capacity: usize) -> (PlatformQueueSender, PlatformQueueReceiver) {
    mpsc::channel(capacity.max(1))
}
