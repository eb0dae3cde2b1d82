//! Client fan-out queue: a bounded FIFO of tagged bus events, produced by
//! the bus task and drained by the network task, with per-event routing
//! (all clients / exclude one / only one) and per-client backpressure.

use crate::constants::{AVAILABLE_THRESHOLD, CLIENT_QUEUE_CAPACITY};
use crate::socket::enhanced::EventTag;
use tokio::sync::mpsc;

/// Which clients a fan-out event should be delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Deliver to every registered client.
    All,
    /// Deliver to every client except the named one (e.g. the client whose
    /// own in-flight arbitration is being observed).
    AllExcept(u64),
    /// Deliver only to the named client.
    Only(u64),
}

/// One event destined for the enhanced-port fan-out, mirroring the
/// `{enhanced, tag, data, target_client, log_to_client}` tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientEvent {
    /// Event tag.
    pub tag: EventTag,
    /// Event data byte.
    pub data: u8,
    /// Routing rule for this event.
    pub routing: Routing,
}

impl ClientEvent {
    /// `true` if `client_id` should receive this event under the routing
    /// rule.
    #[must_use]
    pub fn admits(&self, client_id: u64) -> bool {
        match self.routing {
            Routing::All => true,
            Routing::AllExcept(excluded) => client_id != excluded,
            Routing::Only(only) => client_id == only,
        }
    }
}

/// Producer handle held by the bus task. Enqueues never block: a full
/// queue silently drops the event rather than stall the bus.
#[derive(Debug, Clone)]
pub struct FanoutSender {
    tx: mpsc::Sender<ClientEvent>,
}

impl FanoutSender {
    /// Enqueues an event. Drops it silently if the queue is full — the bus
    /// task must never stall waiting on a slow network task.
    pub fn push(&self, event: ClientEvent) {
        if self.tx.try_send(event).is_err() {
            log::warn!("[Fanout] client event queue full, dropping event");
        }
    }
}

/// Consumer handle held by the network task.
#[derive(Debug)]
pub struct FanoutReceiver {
    rx: mpsc::Receiver<ClientEvent>,
}

impl FanoutReceiver {
    /// Awaits the next queued event.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.rx.recv().await
    }

    /// Drains one already-queued event without awaiting, for tests and for
    /// opportunistic batched draining.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the queue is currently empty or the sender side has
    /// been dropped.
    pub fn try_recv(&mut self) -> Result<ClientEvent, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

/// Creates a bounded fan-out channel sized per [`CLIENT_QUEUE_CAPACITY`].
#[must_use]
pub fn channel() -> (FanoutSender, FanoutReceiver) {
    let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
    (FanoutSender { tx }, FanoutReceiver { rx })
}

/// `true` if a client's reported available send-buffer capacity clears the
/// given backpressure threshold and the event should be written to it.
#[must_use]
pub fn has_capacity(available: usize, threshold: usize) -> bool {
    available >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_all_admits_everyone() {
        let event = ClientEvent {
            tag: EventTag::Received,
            data: 0x01,
            routing: Routing::All,
        };
        assert!(event.admits(1));
        assert!(event.admits(2));
    }

    #[test]
    fn routing_all_except_excludes_one() {
        let event = ClientEvent {
            tag: EventTag::Received,
            data: 0x01,
            routing: Routing::AllExcept(7),
        };
        assert!(!event.admits(7));
        assert!(event.admits(8));
    }

    #[test]
    fn routing_only_admits_single_client() {
        let event = ClientEvent {
            tag: EventTag::Started,
            data: 0x03,
            routing: Routing::Only(42),
        };
        assert!(event.admits(42));
        assert!(!event.admits(43));
    }

    #[test]
    fn backpressure_threshold() {
        assert!(!has_capacity(AVAILABLE_THRESHOLD - 1, AVAILABLE_THRESHOLD));
        assert!(has_capacity(AVAILABLE_THRESHOLD, AVAILABLE_THRESHOLD));
    }

    #[tokio::test]
    async fn fifo_ordering_is_preserved() {
        let (tx, mut rx) = channel();
        tx.push(ClientEvent {
            tag: EventTag::Started,
            data: 0x01,
            routing: Routing::All,
        });
        tx.push(ClientEvent {
            tag: EventTag::Received,
            data: 0x02,
            routing: Routing::All,
        });

        let first = rx.recv().await.expect("event 1");
        let second = rx.recv().await.expect("event 2");
        assert_eq!(first.data, 0x01);
        assert_eq!(second.data, 0x02);
    }
}
