// In-process transport
//
// `MemoryTransport` queues outgoing messages instead of writing to a socket;
// `MemoryLink` pairs two coordinators and moves queued messages between them
// when pumped. Used by tests and the gossip simulator.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cw_error::CwError;
use crate::cw_interface::{ConnectionId, PeerTransport};
use crate::cw_sync::SyncCoordinator;

/// Outbox for one direction of a connection
#[derive(Default)]
pub struct MemoryTransport {
    outbox: Mutex<VecDeque<Vec<u8>>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every queued message, oldest first
    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.outbox.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.outbox.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl PeerTransport for MemoryTransport {
    fn send(&self, message: &[u8]) -> Result<(), CwError> {
        if self.is_closed() {
            return Err(CwError::TransportClosed);
        }
        self.outbox.lock().push_back(message.to_vec());
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Bidirectional in-memory connection between two coordinators
pub struct MemoryLink {
    left: Arc<SyncCoordinator>,
    right: Arc<SyncCoordinator>,
    /// connection id of `right` as seen by `left`
    left_id: ConnectionId,
    right_id: ConnectionId,
    /// messages sent by `left`
    left_out: Arc<MemoryTransport>,
    right_out: Arc<MemoryTransport>,
}

impl MemoryLink {
    /// Connect both sides; each queues its greeting for the other.
    pub fn connect(left: Arc<SyncCoordinator>, right: Arc<SyncCoordinator>) -> Result<Self, CwError> {
        let left_out = Arc::new(MemoryTransport::new());
        let right_out = Arc::new(MemoryTransport::new());
        let left_id = left.connect(left_out.clone())?;
        let right_id = right.connect(right_out.clone())?;
        Ok(Self {
            left,
            right,
            left_id,
            right_id,
            left_out,
            right_out,
        })
    }

    /// Deliver everything queued in both directions; returns the number of
    /// messages delivered. Messages for a side that dropped the connection
    /// are discarded.
    pub fn pump(&self) -> Result<usize, CwError> {
        let mut delivered = 0;
        delivered += Self::deliver(&self.left_out, &self.right, self.right_id)?;
        delivered += Self::deliver(&self.right_out, &self.left, self.left_id)?;
        Ok(delivered)
    }

    fn deliver(
        outbox: &MemoryTransport,
        receiver: &SyncCoordinator,
        connection: ConnectionId,
    ) -> Result<usize, CwError> {
        let mut delivered = 0;
        for message in outbox.drain() {
            if !receiver.is_connected(connection) {
                break;
            }
            receiver.receive_message(connection, &message)?;
            delivered += 1;
        }
        Ok(delivered)
    }

    pub fn left_outbox(&self) -> &MemoryTransport {
        &self.left_out
    }

    pub fn right_outbox(&self) -> &MemoryTransport {
        &self.right_out
    }

    /// True while neither side has dropped the connection
    pub fn is_open(&self) -> bool {
        !self.left_out.is_closed() && !self.right_out.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_transport_rejects_send() {
        let transport = MemoryTransport::new();
        transport.send(b"a").unwrap();
        transport.send(b"b").unwrap();
        assert_eq!(transport.drain(), vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(transport.is_empty());

        transport.close();
        assert!(matches!(transport.send(b"c"), Err(CwError::TransportClosed)));
    }
}
