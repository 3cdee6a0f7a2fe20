//! Sync Coordinator
//!
//! Gossip between replicas. Each side of a connection opens with a greeting
//! listing how far it has seen every chain; the greeting becomes the peer's
//! have-map here, and every stored commit the peer is missing is sent in
//! store order. From then on each newly stored commit, local or received, is
//! forwarded to every other peer whose have-map lacks it and handed to the
//! local listeners.
//!
//! A peer that sends something undecodable, structurally invalid, or a commit
//! before its greeting is disconnected. A peer whose commit breaks chain
//! continuity is disconnected and the violation is returned to the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use prost::Message;

use crate::cw_chain_tracker::ChainTracker;
use crate::cw_commit_store::CommitStore;
use crate::cw_error::CwError;
use crate::cw_interface::{CommitInfo, CommitSink, ConnectionId, PeerTransport};
use crate::cw_wire::{sync_message, Greeting, SyncMessage};

/// Callback run once for every newly stored commit.
pub type CommitListener = Arc<dyn Fn(&[u8], &CommitInfo) -> Result<(), CwError> + Send + Sync>;

struct PeerLink {
    transport: Arc<dyn PeerTransport>,
    /// What the peer has; None until its greeting arrives
    has_map: Option<ChainTracker>,
}

impl PeerLink {
    /// Send the commit unless the peer's have-map already covers it.
    fn send_if_needed(&mut self, bytes: &[u8], info: &CommitInfo) -> Result<bool, CwError> {
        let Some(has_map) = self.has_map.as_mut() else {
            return Ok(false);
        };
        if !has_map.mark_if_novel(info) {
            return Ok(false);
        }
        self.transport
            .send(&SyncMessage::commit(bytes).encode_to_vec())?;
        Ok(true)
    }
}

pub struct SyncCoordinator {
    store: Arc<CommitStore>,
    /// Serializes everything that stores commits or changes peer state
    receive_lock: Mutex<()>,
    peers: Mutex<IndexMap<ConnectionId, PeerLink>>,
    listeners: RwLock<Vec<CommitListener>>,
    next_connection: AtomicU64,
}

impl SyncCoordinator {
    pub fn new(store: Arc<CommitStore>) -> Self {
        Self {
            store,
            receive_lock: Mutex::new(()),
            peers: Mutex::new(IndexMap::new()),
            listeners: RwLock::new(Vec::new()),
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &Arc<CommitStore> {
        &self.store
    }

    /// Register a callback for newly stored commits. Listeners run in
    /// registration order.
    ///
    /// Listeners run while the coordinator's receive lock is held, so a
    /// listener must not store commits through this coordinator itself
    /// (`add_local_commit`, `receive_message`, a sequencer acquired with it
    /// as sink, `connect` or `close`); doing so deadlocks. Buffer the work
    /// and perform it after the call returns. Reading from the store is fine.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&[u8], &CommitInfo) -> Result<(), CwError> + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Register a new peer connection and send it our greeting.
    pub fn connect(&self, transport: Arc<dyn PeerTransport>) -> Result<ConnectionId, CwError> {
        let _guard = self.receive_lock.lock();
        let greeting = self.store.get_chain_tracker()?.construct_greeting();
        transport.send(&SyncMessage::greeting(greeting).encode_to_vec())?;

        let connection = self.next_connection.fetch_add(1, Ordering::SeqCst);
        self.peers.lock().insert(
            connection,
            PeerLink {
                transport,
                has_map: None,
            },
        );
        log::info!("peer {} connected", connection);
        Ok(connection)
    }

    /// Handle one message from a connected peer.
    ///
    /// Malformed input drops the peer and is not reported; a chain
    /// continuity violation drops the peer and is returned.
    pub fn receive_message(&self, from: ConnectionId, bytes: &[u8]) -> Result<(), CwError> {
        let _guard = self.receive_lock.lock();
        if !self.is_connected(from) {
            return Err(CwError::UnknownPeer(from));
        }

        let message = match SyncMessage::decode(bytes) {
            Ok(message) => message,
            Err(err) => {
                self.drop_peer(from, &err.to_string());
                return Ok(());
            }
        };

        match message.body {
            None => {
                self.drop_peer(from, "message without a body");
                Ok(())
            }
            Some(sync_message::Body::Greeting(greeting)) => self.receive_greeting(from, &greeting),
            Some(sync_message::Body::Commit(commit)) => {
                let greeted = self
                    .peers
                    .lock()
                    .get(&from)
                    .map_or(false, |peer| peer.has_map.is_some());
                if !greeted {
                    self.drop_peer(from, "commit before greeting");
                    return Ok(());
                }
                match self.apply_commit(&commit, Some(from)) {
                    Ok(_) => Ok(()),
                    Err(err) if err.is_malformed() => {
                        self.drop_peer(from, &err.to_string());
                        Ok(())
                    }
                    Err(err) if err.is_chain_violation() => {
                        self.drop_peer(from, &err.to_string());
                        Err(err)
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Store a commit produced locally and fan it out.
    pub fn add_local_commit(&self, bytes: &[u8]) -> Result<Option<CommitInfo>, CwError> {
        let _guard = self.receive_lock.lock();
        self.apply_commit(bytes, None)
    }

    fn receive_greeting(&self, from: ConnectionId, greeting: &Greeting) -> Result<(), CwError> {
        let mut peers = self.peers.lock();
        let Some(peer) = peers.get_mut(&from) else {
            return Ok(());
        };
        peer.has_map = Some(ChainTracker::from_greeting(greeting));

        let mut sent = 0usize;
        let mut failure = None;
        self.store.get_commits(|bytes, info| {
            if failure.is_some() {
                return;
            }
            match peer.send_if_needed(bytes, info) {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(err) => failure = Some(err),
            }
        })?;
        drop(peers);

        match failure {
            Some(err) => self.drop_peer(from, &err.to_string()),
            None => log::debug!("greeted peer {}, sent {} commits", from, sent),
        }
        Ok(())
    }

    /// Store `bytes`, then forward to other peers and run the listeners.
    fn apply_commit(
        &self,
        bytes: &[u8],
        from: Option<ConnectionId>,
    ) -> Result<Option<CommitInfo>, CwError> {
        let info = CommitInfo::from_commit_bytes(bytes)?;

        // mark the sender first so the commit is never echoed back
        if let Some(from) = from {
            if let Some(has_map) = self
                .peers
                .lock()
                .get_mut(&from)
                .and_then(|peer| peer.has_map.as_mut())
            {
                has_map.mark_if_novel(&info);
            }
        }

        let Some(info) = self.store.add_commit(bytes)? else {
            return Ok(None);
        };

        let mut failed = Vec::new();
        {
            let mut peers = self.peers.lock();
            for (connection, peer) in peers.iter_mut() {
                if Some(*connection) == from {
                    continue;
                }
                if let Err(err) = peer.send_if_needed(bytes, &info) {
                    failed.push((*connection, err));
                }
            }
        }
        for (connection, err) in failed {
            self.drop_peer(connection, &err.to_string());
        }

        let listeners = self.listeners.read().clone();
        for listener in listeners.iter() {
            listener(bytes, &info).map_err(|err| match err {
                err @ CwError::Listener(_) => err,
                other => CwError::Listener(other.to_string()),
            })?;
        }
        Ok(Some(info))
    }

    fn drop_peer(&self, connection: ConnectionId, reason: &str) {
        if let Some(peer) = self.peers.lock().shift_remove(&connection) {
            peer.transport.close();
            log::warn!("dropped peer {}: {}", connection, reason);
        }
    }

    /// Close and forget one peer connection.
    pub fn disconnect(&self, connection: ConnectionId) -> Result<(), CwError> {
        let peer = self
            .peers
            .lock()
            .shift_remove(&connection)
            .ok_or(CwError::UnknownPeer(connection))?;
        peer.transport.close();
        log::info!("peer {} disconnected", connection);
        Ok(())
    }

    pub fn is_connected(&self, connection: ConnectionId) -> bool {
        self.peers.lock().contains_key(&connection)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Connected peers in connection order
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.peers.lock().keys().copied().collect()
    }

    /// Close every peer connection, then the store.
    pub fn close(&self) -> Result<(), CwError> {
        let _guard = self.receive_lock.lock();
        for (_, peer) in self.peers.lock().drain(..) {
            peer.transport.close();
        }
        self.store.close()
    }
}

impl CommitSink for SyncCoordinator {
    fn accept(&self, bytes: &[u8]) -> Result<Option<CommitInfo>, CwError> {
        self.add_local_commit(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cw_chain_sequencer::{ChainSequencer, SequencerConfig};
    use crate::cw_commit::PendingCommit;
    use crate::cw_interface::ChainKey;
    use crate::cw_transport::{MemoryLink, MemoryTransport};

    struct Replica {
        sync: Arc<SyncCoordinator>,
        sequencer: ChainSequencer,
    }

    impl Replica {
        fn new() -> Self {
            let store = Arc::new(CommitStore::in_memory());
            let sync = Arc::new(SyncCoordinator::new(store.clone()));
            let sequencer =
                ChainSequencer::acquire(store, sync.clone(), &SequencerConfig::default()).unwrap();
            Self { sync, sequencer }
        }

        fn commit(&self, comment: &str) -> u64 {
            self.sequencer
                .add_commit(&PendingCommit::with_comment(comment), None)
                .wait()
                .unwrap()
        }

        fn infos(&self) -> Vec<CommitInfo> {
            self.sync.store().get_commit_infos().unwrap()
        }
    }

    fn pump_until_quiet(links: &[&MemoryLink]) {
        loop {
            let mut delivered = 0;
            for link in links {
                delivered += link.pump().unwrap();
            }
            if delivered == 0 {
                return;
            }
        }
    }

    fn recording_listener(sync: &SyncCoordinator) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        sync.add_listener(move |_, info| {
            sink.lock().push(info.comment.clone().unwrap_or_default());
            Ok(())
        });
        seen
    }

    fn sealed(chain: ChainKey, prior: Option<u64>, timestamp: u64) -> Vec<u8> {
        PendingCommit::new().seal(chain, prior, timestamp).unwrap().1
    }

    #[test]
    fn test_two_replicas_converge() {
        let a = Replica::new();
        let b = Replica::new();
        a.commit("a1");
        a.commit("a2");
        b.commit("b1");

        let link = MemoryLink::connect(a.sync.clone(), b.sync.clone()).unwrap();
        pump_until_quiet(&[&link]);

        assert_eq!(a.infos().len(), 5);
        assert_eq!(a.infos(), b.infos());

        // later commits flow without a new greeting
        b.commit("b2");
        pump_until_quiet(&[&link]);
        assert_eq!(a.infos(), b.infos());
        assert!(link.is_open());
    }

    #[test]
    fn test_line_forwarding_without_echo() {
        let p1 = Replica::new();
        let p2 = Replica::new();
        let p3 = Replica::new();
        let link12 = MemoryLink::connect(p1.sync.clone(), p2.sync.clone()).unwrap();
        let link23 = MemoryLink::connect(p2.sync.clone(), p3.sync.clone()).unwrap();
        pump_until_quiet(&[&link12, &link23]);

        let heard_at_1 = recording_listener(&p1.sync);
        let heard_at_3 = recording_listener(&p3.sync);
        p1.commit("hello");
        assert_eq!(link12.left_outbox().len(), 1);

        link12.pump().unwrap();
        assert_eq!(link23.left_outbox().len(), 1);
        assert!(link12.right_outbox().is_empty());

        pump_until_quiet(&[&link12, &link23]);
        assert_eq!(*heard_at_3.lock(), vec!["hello".to_string()]);
        assert_eq!(*heard_at_1.lock(), vec!["hello".to_string()]);
        assert_eq!(p1.infos(), p3.infos());
    }

    #[test]
    fn test_listeners_run_in_order_and_errors_stop_the_pass() {
        let store = Arc::new(CommitStore::in_memory());
        let sync = SyncCoordinator::new(store.clone());
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second"] {
            let order = order.clone();
            sync.add_listener(move |_, _| {
                order.lock().push(name);
                Ok(())
            });
        }
        sync.add_listener(|_, _| Err(CwError::Storage("listener broke".to_string())));
        let after = order.clone();
        sync.add_listener(move |_, _| {
            after.lock().push("after");
            Ok(())
        });

        let chain = ChainKey::new(0x1_0000_0000_0007, 100);
        let result = sync.accept(&sealed(chain, None, 100));
        assert!(matches!(result, Err(CwError::Listener(_))));
        assert_eq!(*order.lock(), vec!["first", "second"]);
        assert_eq!(store.get_commit_infos().unwrap().len(), 1);

        // a duplicate is not announced again
        assert!(sync.accept(&sealed(chain, None, 100)).unwrap().is_none());
        assert_eq!(order.lock().len(), 2);
    }

    #[test]
    fn test_listener_reads_store_and_defers_writes() {
        let store = Arc::new(CommitStore::in_memory());
        let sync = SyncCoordinator::new(store.clone());
        let deferred = Arc::new(Mutex::new(Vec::new()));
        let reader = store.clone();
        let queue = deferred.clone();
        sync.add_listener(move |_, info| {
            // the commit is already stored when listeners run
            let head = reader.get_chain_info(info.chain())?;
            assert_eq!(head.map(|h| h.timestamp), Some(info.timestamp));
            queue.lock().push(info.clone());
            Ok(())
        });

        let chain = ChainKey::new(0x1_0000_0000_0009, 100);
        sync.accept(&sealed(chain, None, 100)).unwrap();

        let heard: Vec<CommitInfo> = deferred.lock().drain(..).collect();
        for info in heard {
            sync.add_local_commit(&sealed(info.chain(), Some(info.timestamp), info.timestamp + 1))
                .unwrap();
        }
        assert_eq!(store.get_chain_info(chain).unwrap().unwrap().timestamp, 101);
        assert_eq!(deferred.lock().len(), 1);
    }

    #[test]
    fn test_garbage_disconnects_peer() {
        let sync = SyncCoordinator::new(Arc::new(CommitStore::in_memory()));
        let transport = Arc::new(MemoryTransport::new());
        let peer = sync.connect(transport.clone()).unwrap();
        assert_eq!(transport.len(), 1);

        sync.receive_message(peer, &[0xff, 0xff, 0xff]).unwrap();
        assert_eq!(sync.peer_count(), 0);
        assert!(transport.is_closed());
        assert!(matches!(
            sync.receive_message(peer, &[]),
            Err(CwError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_commit_before_greeting_disconnects_peer() {
        let sync = SyncCoordinator::new(Arc::new(CommitStore::in_memory()));
        let transport = Arc::new(MemoryTransport::new());
        let peer = sync.connect(transport.clone()).unwrap();

        let chain = ChainKey::new(0x1_0000_0000_0007, 100);
        let message = SyncMessage::commit(&sealed(chain, None, 100)).encode_to_vec();
        sync.receive_message(peer, &message).unwrap();
        assert!(!sync.is_connected(peer));
        assert!(sync.store().get_commit_infos().unwrap().is_empty());
    }

    #[test]
    fn test_continuity_violation_is_returned_and_disconnects() {
        let sync = SyncCoordinator::new(Arc::new(CommitStore::in_memory()));
        let transport = Arc::new(MemoryTransport::new());
        let peer = sync.connect(transport.clone()).unwrap();
        let greeting = SyncMessage::greeting(Greeting::default()).encode_to_vec();
        sync.receive_message(peer, &greeting).unwrap();

        let chain = ChainKey::new(0x1_0000_0000_0007, 100);
        let start = SyncMessage::commit(&sealed(chain, None, 100)).encode_to_vec();
        sync.receive_message(peer, &start).unwrap();
        let gap = SyncMessage::commit(&sealed(chain, Some(150), 200)).encode_to_vec();
        assert!(matches!(
            sync.receive_message(peer, &gap),
            Err(CwError::ChainContinuity { .. })
        ));
        assert!(!sync.is_connected(peer));
        assert_eq!(sync.store().get_commit_infos().unwrap().len(), 1);
    }

    #[test]
    fn test_greeting_sends_only_missing_commits() {
        let sync = SyncCoordinator::new(Arc::new(CommitStore::in_memory()));
        let chain = ChainKey::new(0x1_0000_0000_0007, 100);
        sync.accept(&sealed(chain, None, 100)).unwrap();
        sync.accept(&sealed(chain, Some(100), 110)).unwrap();
        sync.accept(&sealed(chain, Some(110), 120)).unwrap();

        let transport = Arc::new(MemoryTransport::new());
        let peer = sync.connect(transport.clone()).unwrap();
        transport.drain();

        let mut has = ChainTracker::new();
        has.mark_if_novel(&CommitInfo::from_commit_bytes(&sealed(chain, Some(100), 110)).unwrap());
        let greeting = SyncMessage::greeting(has.construct_greeting()).encode_to_vec();
        sync.receive_message(peer, &greeting).unwrap();

        let sent: Vec<u64> = transport
            .drain()
            .iter()
            .map(|message| match SyncMessage::decode(message.as_slice()).unwrap().body {
                Some(sync_message::Body::Commit(bytes)) => {
                    CommitInfo::from_commit_bytes(&bytes).unwrap().timestamp
                }
                other => panic!("unexpected message {:?}", other),
            })
            .collect();
        assert_eq!(sent, vec![120]);
    }

    #[test]
    fn test_close_closes_peers_and_store() {
        let sync = SyncCoordinator::new(Arc::new(CommitStore::in_memory()));
        let transport = Arc::new(MemoryTransport::new());
        sync.connect(transport.clone()).unwrap();
        sync.close().unwrap();
        assert!(transport.is_closed());
        assert_eq!(sync.peer_count(), 0);
        assert!(sync.store().is_closed());
    }
}
