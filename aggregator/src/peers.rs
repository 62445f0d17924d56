//! Peer connectivity to validator nodes.
//!
//! [PeerNetwork] is the process-wide handle to the p2p layer. It is the sole owner of connection
//! lifecycle; signature collection rounds only read from connections it established and register
//! themselves here to receive responses.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
};

use anyhow::Result;
use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::{
    crypto::Hash,
    error::AggregationError,
    message::{ExternalMessage, SignatureResponse},
    validators::{self, CanonicalValidatorSet, ValidatorInfoClient},
};

/// Commands consumed by the p2p event loop.
#[derive(Debug)]
pub enum PeerCommand {
    /// Track the given address for a peer and dial it.
    Dial(PeerId, Multiaddr),
    /// Send a signing request to a specific peer.
    SendRequest(PeerId, ExternalMessage),
}

/// The external peer-directory service, reporting the network addresses of known peers.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn peers(&self) -> Result<Vec<PeerEntry>>;
}

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub node_id: PeerId,
    pub address: Multiaddr,
}

/// The result of connecting to a chain's canonical validator set.
#[derive(Debug)]
pub struct ConnectedValidators {
    pub validators: CanonicalValidatorSet,
    /// Maps each node to the index of its owning validator in `validators`.
    pub node_index: HashMap<PeerId, usize>,
    /// The nodes we are connected (or connecting) to.
    pub connected: HashSet<PeerId>,
    /// Summed weight of every validator with at least one connected node. Never exceeds the
    /// set's total weight.
    pub connected_weight: u128,
}

impl ConnectedValidators {
    pub fn total_weight(&self) -> u128 {
        self.validators.total_weight
    }
}

pub struct PeerNetwork {
    command_tx: UnboundedSender<PeerCommand>,
    /// Live connections, maintained by the p2p event loop.
    connected: Arc<Mutex<HashSet<PeerId>>>,
    info: Arc<dyn ValidatorInfoClient>,
    directory: Arc<dyn PeerDirectory>,
    /// In-flight signing rounds, keyed by request id. Whichever task receives a matching
    /// response forwards it to the registered round.
    requests: Mutex<HashMap<u32, UnboundedSender<(PeerId, SignatureResponse)>>>,
    next_request_id: AtomicU32,
    /// Serializes `connect_peers` calls, since the underlying network handle is shared
    /// process-wide.
    connect_lock: tokio::sync::Mutex<()>,
}

impl PeerNetwork {
    pub fn new(
        command_tx: UnboundedSender<PeerCommand>,
        connected: Arc<Mutex<HashSet<PeerId>>>,
        info: Arc<dyn ValidatorInfoClient>,
        directory: Arc<dyn PeerDirectory>,
    ) -> PeerNetwork {
        PeerNetwork {
            command_tx,
            connected,
            info,
            directory,
            requests: Mutex::new(HashMap::new()),
            next_request_id: AtomicU32::new(1),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Connects the network to the given peers. Returns the subset that could be tracked.
    ///
    /// Callers must tolerate partial results: peers can be offline, partitioned away or missing
    /// from the directory, and a freshly dialled peer may still be mid-handshake when the next
    /// round starts.
    pub async fn connect_peers(&self, node_ids: &HashSet<PeerId>) -> HashSet<PeerId> {
        let _guard = self.connect_lock.lock().await;

        // Fast path: every requested peer is already connected.
        {
            let connected = self.connected.lock().unwrap();
            if node_ids.iter().all(|id| connected.contains(id)) {
                return node_ids.clone();
            }
        }

        // Otherwise walk the full directory listing, re-dialling already tracked peers along the
        // way to refresh their addresses.
        let peers = match self.directory.peers().await {
            Ok(peers) => peers,
            Err(err) => {
                warn!(%err, "failed to list peers");
                return HashSet::new();
            }
        };

        let mut tracked = HashSet::new();
        for peer in peers {
            if node_ids.contains(&peer.node_id) {
                let _ = self
                    .command_tx
                    .send(PeerCommand::Dial(peer.node_id, peer.address));
                tracked.insert(peer.node_id);
                if tracked.len() == node_ids.len() {
                    break;
                }
            }
        }
        tracked
    }

    /// Resolves the canonical validator set of the given chain and connects to its nodes.
    ///
    /// Fails only if resolution fails. Partial connectivity is surfaced as a lower
    /// `connected_weight` for the caller to evaluate against its quorum requirement.
    pub async fn connect_to_validators(
        &self,
        chain_id: u64,
    ) -> Result<ConnectedValidators, AggregationError> {
        let validator_set = validators::resolve(self.info.as_ref(), chain_id).await?;

        // Requests go to node ids, not to validators, so responses must be mapped back through
        // this index before any weight is counted.
        let node_index = validator_set.node_index();
        let node_ids: HashSet<_> = node_index.keys().copied().collect();
        let connected = self.connect_peers(&node_ids).await;

        let mut connected_weight = 0u128;
        let mut counted = HashSet::new();
        for node in &connected {
            let index = node_index[node];
            if counted.insert(index) {
                connected_weight += validator_set.validators[index].weight;
            }
        }
        debug!(
            chain_id,
            connected = connected.len(),
            connected_weight,
            total_weight = validator_set.total_weight,
            "connected to validators"
        );

        Ok(ConnectedValidators {
            validators: validator_set,
            node_index,
            connected,
            connected_weight,
        })
    }

    /// The chain a blockchain instance belongs to.
    pub async fn chain_of(&self, blockchain_id: Hash) -> Result<u64> {
        self.info.chain_of(blockchain_id).await
    }

    pub(crate) fn next_request_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a round to receive responses carrying the given request id. Must be called
    /// before the first request is sent, or early responses are dropped.
    pub(crate) fn register_request(
        &self,
        request_id: u32,
    ) -> UnboundedReceiver<(PeerId, SignatureResponse)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.requests.lock().unwrap().insert(request_id, tx);
        rx
    }

    /// Removes a finished round. Responses arriving afterwards are dropped unverified.
    pub(crate) fn forget_request(&self, request_id: u32) {
        self.requests.lock().unwrap().remove(&request_id);
    }

    /// Routes an inbound response to the round waiting on its request id.
    pub fn deliver(&self, from: PeerId, response: SignatureResponse) {
        let sender = self
            .requests
            .lock()
            .unwrap()
            .get(&response.request_id)
            .cloned();
        match sender {
            Some(tx) => {
                let _ = tx.send((from, response));
            }
            None => debug!(
                %from,
                request_id = response.request_id,
                "dropping response for unknown or finished request"
            ),
        }
    }

    /// Fire-and-forget send of a signing request to one peer.
    pub(crate) fn send_request(
        &self,
        peer: PeerId,
        message: ExternalMessage,
    ) -> Result<(), AggregationError> {
        self.command_tx
            .send(PeerCommand::SendRequest(peer, message))
            .map_err(|_| AggregationError::Connection("p2p event loop has shut down"))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use libp2p::PeerId;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use tokio::sync::mpsc;

    use super::{PeerDirectory, PeerEntry, PeerNetwork};
    use crate::{
        crypto::{Hash, SecretKey},
        validators::{NodeRecord, ValidatorInfoClient},
    };

    struct NoInfo;

    #[async_trait]
    impl ValidatorInfoClient for NoInfo {
        async fn latest_height(&self, _chain_id: u64) -> Result<u64> {
            Err(anyhow!("unused"))
        }

        async fn validator_set(&self, _chain_id: u64, _height: u64) -> Result<Vec<NodeRecord>> {
            Err(anyhow!("unused"))
        }

        async fn chain_of(&self, _blockchain_id: Hash) -> Result<u64> {
            Err(anyhow!("unused"))
        }
    }

    struct StaticInfo {
        records: Vec<NodeRecord>,
    }

    #[async_trait]
    impl ValidatorInfoClient for StaticInfo {
        async fn latest_height(&self, _chain_id: u64) -> Result<u64> {
            Ok(1)
        }

        async fn validator_set(&self, _chain_id: u64, _height: u64) -> Result<Vec<NodeRecord>> {
            Ok(self.records.clone())
        }

        async fn chain_of(&self, _blockchain_id: Hash) -> Result<u64> {
            Err(anyhow!("unused"))
        }
    }

    struct CountingDirectory {
        calls: AtomicUsize,
        entries: Vec<PeerEntry>,
    }

    impl CountingDirectory {
        fn new(entries: Vec<PeerEntry>) -> CountingDirectory {
            CountingDirectory {
                calls: AtomicUsize::new(0),
                entries,
            }
        }
    }

    #[async_trait]
    impl PeerDirectory for CountingDirectory {
        async fn peers(&self) -> Result<Vec<PeerEntry>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.entries.clone())
        }
    }

    fn entry(node_id: PeerId) -> PeerEntry {
        PeerEntry {
            node_id,
            address: "/ip4/127.0.0.1/tcp/4001".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn connect_is_idempotent_when_fully_connected() {
        let nodes: HashSet<_> = (0..3).map(|_| PeerId::random()).collect();
        let directory = Arc::new(CountingDirectory::new(vec![]));
        let (command_tx, _command_rx) = mpsc::unbounded_channel();
        let network = PeerNetwork::new(
            command_tx,
            Arc::new(Mutex::new(nodes.clone())),
            Arc::new(NoInfo),
            directory.clone(),
        );

        let first = network.connect_peers(&nodes).await;
        let second = network.connect_peers(&nodes).await;

        assert_eq!(first, nodes);
        assert_eq!(second, nodes);
        // Both calls took the fast path, so the directory was never consulted.
        assert_eq!(directory.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn connect_returns_only_reachable_peers() {
        let reachable = PeerId::random();
        let unreachable = PeerId::random();
        let unrelated = PeerId::random();
        let directory = Arc::new(CountingDirectory::new(vec![
            entry(unrelated),
            entry(reachable),
        ]));
        let (command_tx, mut command_rx) = mpsc::unbounded_channel();
        let network = PeerNetwork::new(
            command_tx,
            Arc::new(Mutex::new(HashSet::new())),
            Arc::new(NoInfo),
            directory.clone(),
        );

        let requested: HashSet<_> = [reachable, unreachable].into_iter().collect();
        let tracked = network.connect_peers(&requested).await;

        assert_eq!(tracked, [reachable].into_iter().collect());
        assert_eq!(directory.calls.load(Ordering::SeqCst), 1);

        // Only the listed, requested peer was dialled.
        let command = command_rx.try_recv().unwrap();
        match command {
            super::PeerCommand::Dial(peer, _) => assert_eq!(peer, reachable),
            other => panic!("unexpected command: {other:?}"),
        }
        command_rx.try_recv().unwrap_err();
    }

    #[tokio::test]
    async fn connected_weight_counts_each_validator_once() {
        // One validator backed by two nodes (30 + 30), another by a single node (40). Both of
        // the first validator's nodes are reachable; the second validator's node is not.
        let shared_key = SecretKey::new_from_rng(&mut ChaCha8Rng::seed_from_u64(0)).unwrap();
        let other_key = SecretKey::new_from_rng(&mut ChaCha8Rng::seed_from_u64(1)).unwrap();
        let (node_a, node_b, unreachable) =
            (PeerId::random(), PeerId::random(), PeerId::random());
        let records = vec![
            NodeRecord {
                public_key: shared_key.node_public_key(),
                weight: 30,
                node_id: node_a,
            },
            NodeRecord {
                public_key: shared_key.node_public_key(),
                weight: 30,
                node_id: node_b,
            },
            NodeRecord {
                public_key: other_key.node_public_key(),
                weight: 40,
                node_id: unreachable,
            },
        ];
        let directory = Arc::new(CountingDirectory::new(vec![entry(node_a), entry(node_b)]));
        let (command_tx, _command_rx) = mpsc::unbounded_channel();
        let network = PeerNetwork::new(
            command_tx,
            Arc::new(Mutex::new(HashSet::new())),
            Arc::new(StaticInfo { records }),
            directory,
        );

        let connected = network.connect_to_validators(0).await.unwrap();

        assert_eq!(connected.connected, [node_a, node_b].into_iter().collect());
        // Two connected nodes, but their validator's weight is credited exactly once, and the
        // unreachable validator contributes nothing.
        assert_eq!(connected.connected_weight, 60);
        assert_eq!(connected.total_weight(), 100);
        assert!(connected.connected_weight <= connected.total_weight());
    }
}
