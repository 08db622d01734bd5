//! One-shot result handoff between the log-observing collector and the
//! dispatcher.
//!
//! Each dispatcher invocation takes a fresh slot before it spawns the
//! runner; the collector publishes the structured result it extracted
//! while the subprocess ran. The dispatcher receives strictly after the
//! subprocess has exited - the receive-after-exit ordering is the caller's
//! contract, this module only enforces single-producer/single-consumer,
//! single-item semantics and a post-exit deadline.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::warn;

use testflow_core::{AgentError, DiscoveryResult, ExecutionResults};

/// How long a receive may wait after subprocess exit before the run is
/// declared wedged. A hung subprocess never reaches this point - the
/// dispatcher is still blocked on the child - so the deadline only guards
/// against a collector that died mid-run.
pub const POST_EXIT_DEADLINE: Duration = Duration::from_secs(30);

/// Consumer half of one handoff. Consumed by the single receive.
#[derive(Debug)]
pub struct ResultSlot<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> ResultSlot<T> {
    /// Receive the published result, waiting at most `deadline`.
    ///
    /// Precondition: the subprocess this slot was taken for has exited.
    pub async fn receive(self, deadline: Duration) -> Result<T, AgentError> {
        match tokio::time::timeout(deadline, self.rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(AgentError::internal(
                "result collector dropped without publishing",
            )),
            Err(_) => Err(AgentError::internal(
                "timed out waiting for collected runner result",
            )),
        }
    }
}

/// Producer half of one handoff.
#[derive(Debug)]
pub struct ResultPublisher<T> {
    tx: oneshot::Sender<T>,
}

impl<T> ResultPublisher<T> {
    /// Publish the result. Consumes the publisher: one item per slot.
    pub fn publish(self, value: T) {
        if self.tx.send(value).is_err() {
            warn!("result slot receiver dropped before publish");
        }
    }
}

/// Create one fresh publisher/slot pair.
pub fn slot<T>() -> (ResultPublisher<T>, ResultSlot<T>) {
    let (tx, rx) = oneshot::channel();
    (ResultPublisher { tx }, ResultSlot { rx })
}

/// Hands fresh result slots to dispatcher invocations.
///
/// Implemented by the in-container collector wiring; tests drive the
/// [`ResultBus`] implementation directly.
pub trait ResultCollector: Send + Sync {
    /// Fresh slot for one discovery invocation.
    fn discovery_slot(&self) -> ResultSlot<DiscoveryResult>;
    /// Fresh slot for one execution invocation.
    fn execution_slot(&self) -> ResultSlot<ExecutionResults>;
}

/// Default [`ResultCollector`]: pairs each slot request with a queued
/// publisher the log-observing side drains in FIFO order.
#[derive(Debug, Default)]
pub struct ResultBus {
    discovery: Mutex<VecDeque<ResultPublisher<DiscoveryResult>>>,
    execution: Mutex<VecDeque<ResultPublisher<ExecutionResults>>>,
}

impl ResultBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a discovery result into the oldest outstanding slot.
    pub fn publish_discovery(&self, result: DiscoveryResult) {
        let publisher = self.discovery.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        match publisher {
            Some(publisher) => publisher.publish(result),
            None => warn!("discovery result published with no outstanding slot"),
        }
    }

    /// Publish execution results into the oldest outstanding slot.
    pub fn publish_execution(&self, results: ExecutionResults) {
        let publisher = self.execution.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        match publisher {
            Some(publisher) => publisher.publish(results),
            None => warn!("execution results published with no outstanding slot"),
        }
    }
}

impl ResultCollector for ResultBus {
    fn discovery_slot(&self) -> ResultSlot<DiscoveryResult> {
        let (publisher, slot) = slot();
        self.discovery
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(publisher);
        slot
    }

    fn execution_slot(&self) -> ResultSlot<ExecutionResults> {
        let (publisher, slot) = slot();
        self.execution
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(publisher);
        slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_then_receive() {
        let (publisher, slot) = slot::<u32>();
        publisher.publish(7);
        assert_eq!(slot.receive(Duration::from_millis(50)).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_receive_deadline_elapses() {
        let (_publisher, slot) = slot::<u32>();
        let err = slot.receive(Duration::from_millis(20)).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_dropped_publisher_is_an_error() {
        let (publisher, slot) = slot::<u32>();
        drop(publisher);
        let err = slot.receive(Duration::from_millis(50)).await.unwrap_err();
        assert!(err.to_string().contains("dropped"));
    }

    #[tokio::test]
    async fn test_bus_pairs_slots_fifo() {
        let bus = ResultBus::new();
        let first = bus.discovery_slot();
        let second = bus.discovery_slot();

        bus.publish_discovery(DiscoveryResult {
            task_id: "first".to_string(),
            ..DiscoveryResult::default()
        });
        bus.publish_discovery(DiscoveryResult {
            task_id: "second".to_string(),
            ..DiscoveryResult::default()
        });

        assert_eq!(
            first.receive(Duration::from_millis(50)).await.unwrap().task_id,
            "first"
        );
        assert_eq!(
            second.receive(Duration::from_millis(50)).await.unwrap().task_id,
            "second"
        );
    }

    #[tokio::test]
    async fn test_each_invocation_gets_fresh_slot() {
        let bus = ResultBus::new();

        // First round-trip.
        let slot1 = bus.discovery_slot();
        bus.publish_discovery(DiscoveryResult::default());
        slot1.receive(Duration::from_millis(50)).await.unwrap();

        // Second round-trip must not see a stale item.
        let slot2 = bus.discovery_slot();
        let err = slot2.receive(Duration::from_millis(20)).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
