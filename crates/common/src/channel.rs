//! Topology-change bridge between the proxy API and the dispatcher thread
//!
//! Proxy calls never touch the dispatcher's wait-set directly. They push a
//! [`TopologyEvent`] into an unbounded channel and ring a doorbell [`Event`]
//! that the dispatcher keeps linked first in its wait-set. The dispatcher
//! clears the doorbell, drains the channel and rebuilds.

use crate::signal::Event;
use async_channel::{Receiver, Sender, TryRecvError, unbounded};
use protocol::{Direction, SlotId};

/// Reasons the dispatcher must rebuild its view of the slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyEvent {
    /// A client acquired a slot; its setup sequence should start
    Acquired(SlotId),
    /// A client closed a slot; the dispatcher finalizes it
    ShutdownRequested(SlotId),
    /// A client mapped a packet buffer
    BufferMapped {
        slot: SlotId,
        direction: Direction,
    },
    /// A control transfer was enqueued on a finalizing slot
    ControlSubmitted(SlotId),
    /// A client deposited a packet to be written
    WriteQueued(SlotId),
    /// Stop the dispatcher after releasing every slot
    Shutdown,
}

/// Sending half, held by the proxy API
#[derive(Clone)]
pub struct TopologySender {
    tx: Sender<TopologyEvent>,
    doorbell: Event,
}

impl TopologySender {
    /// Queue an event and wake the dispatcher
    pub fn notify(&self, event: TopologyEvent) -> crate::Result<()> {
        self.tx
            .try_send(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))?;
        self.doorbell.signal();
        Ok(())
    }
}

/// Receiving half, owned by the dispatcher thread
pub struct TopologyReceiver {
    rx: Receiver<TopologyEvent>,
    doorbell: Event,
}

impl TopologyReceiver {
    /// Doorbell to link into the wait-set
    pub fn doorbell(&self) -> &Event {
        &self.doorbell
    }

    /// Clear the doorbell and take every queued event
    ///
    /// The doorbell is cleared before draining so an event queued while
    /// draining leaves it signaled for the next cycle.
    pub fn drain(&self) -> crate::Result<Vec<TopologyEvent>> {
        self.doorbell.clear();
        let mut events = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) => break,
                Err(e @ TryRecvError::Closed) => {
                    if events.is_empty() {
                        return Err(crate::Error::Channel(e.to_string()));
                    }
                    break;
                }
            }
        }
        Ok(events)
    }
}

/// Create the topology bridge
///
/// Returns (TopologySender for proxy callers, TopologyReceiver for the
/// dispatcher thread)
pub fn create_topology_bridge() -> (TopologySender, TopologyReceiver) {
    let (tx, rx) = unbounded();
    let doorbell = Event::new();
    (
        TopologySender {
            tx,
            doorbell: doorbell.clone(),
        },
        TopologyReceiver { rx, doorbell },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_rings_doorbell() {
        let (tx, rx) = create_topology_bridge();
        assert!(!rx.doorbell().is_signaled());

        tx.notify(TopologyEvent::Acquired(SlotId(0))).unwrap();
        assert!(rx.doorbell().is_signaled());

        let events = rx.drain().unwrap();
        assert_eq!(events, vec![TopologyEvent::Acquired(SlotId(0))]);
        assert!(!rx.doorbell().is_signaled());
    }

    #[test]
    fn test_drain_keeps_order() {
        let (tx, rx) = create_topology_bridge();
        tx.notify(TopologyEvent::Acquired(SlotId(1))).unwrap();
        tx.notify(TopologyEvent::BufferMapped {
            slot: SlotId(1),
            direction: Direction::Read,
        })
        .unwrap();
        tx.notify(TopologyEvent::ShutdownRequested(SlotId(1)))
            .unwrap();

        let events = rx.drain().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2], TopologyEvent::ShutdownRequested(SlotId(1)));
        assert!(rx.drain().unwrap().is_empty());
    }

    #[test]
    fn test_closed_receiver_is_channel_error() {
        let (tx, rx) = create_topology_bridge();
        drop(rx);
        assert!(matches!(
            tx.notify(TopologyEvent::Shutdown),
            Err(crate::Error::Channel(_))
        ));
    }
}
