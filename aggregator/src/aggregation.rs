//! Collects partial signatures from a chain's validators and combines them into a single
//! aggregate signature once a weighted quorum has signed.
//!
//! Each call is one round: fan a signing request out to every connected validator node, verify
//! replies as they arrive, accumulate weight per canonical validator, and stop on quorum,
//! exhaustion or timeout. Rounds share nothing; retries are a fresh round with a freshly
//! resolved connection set, decided by the caller.

use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::Result;
use bitvec::{bitvec, order::Msb0, vec::BitVec};
use libp2p::PeerId;
use scopeguard::defer;
use tracing::{debug, info, trace, warn};

use crate::{
    crypto::NodeSignature,
    error::AggregationError,
    message::{ExternalMessage, SignatureRequest, SignatureResponse, UnsignedMessage},
    peers::{ConnectedValidators, PeerNetwork},
    validators::CanonicalValidatorSet,
};

/// The product of a successful aggregation round.
#[derive(Debug, Clone)]
pub struct AggregateResult {
    pub signature: NodeSignature,
    /// Which validators contributed, by canonical index.
    pub signers: BitVec<u8, Msb0>,
    pub achieved_weight: u128,
    pub total_weight: u128,
}

impl AggregateResult {
    /// Verifies the aggregate signature against the public keys of the contributing subset.
    pub fn verify(&self, message: &UnsignedMessage, validators: &CanonicalValidatorSet) -> Result<()> {
        let public_keys: Vec<_> = validators
            .validators
            .iter()
            .zip(self.signers.iter())
            .filter_map(|(validator, signed)| {
                if *signed {
                    Some(validator.public_key)
                } else {
                    None
                }
            })
            .collect();

        NodeSignature::verify_aggregate(&self.signature, &message.to_signable_bytes(), &public_keys)
    }
}

/// Converts a configured percentage into an absolute weight threshold. Rounds up, so a round can
/// never succeed strictly below the configured percentage.
pub fn quorum_weight(total_weight: u128, quorum_percentage: u8) -> u128 {
    (total_weight * quorum_percentage as u128).div_ceil(100)
}

struct RoundState {
    signatures: Vec<NodeSignature>,
    signers: BitVec<u8, Msb0>,
    achieved_weight: u128,
}

enum RoundOutcome {
    Quorum,
    Exhausted,
}

pub struct SignatureAggregator {
    network: Arc<PeerNetwork>,
    round_timeout: Duration,
}

impl SignatureAggregator {
    pub fn new(network: Arc<PeerNetwork>, round_timeout: Duration) -> SignatureAggregator {
        SignatureAggregator {
            network,
            round_timeout,
        }
    }

    pub fn network(&self) -> &Arc<PeerNetwork> {
        &self.network
    }

    /// The composed pipeline: resolve the chain's validator set, connect to its nodes, collect
    /// partial signatures and aggregate them.
    pub async fn get_aggregate_signature(
        &self,
        chain_id: u64,
        message: &UnsignedMessage,
        quorum_percentage: u8,
    ) -> Result<AggregateResult, AggregationError> {
        let connected = self.network.connect_to_validators(chain_id).await?;
        let quorum_weight = quorum_weight(connected.total_weight(), quorum_percentage);
        if connected.connected_weight < quorum_weight {
            warn!(
                connected_weight = connected.connected_weight,
                quorum_weight, "connected weight below quorum requirement"
            );
        }

        self.collect_signatures(&connected, message, quorum_weight, self.round_timeout)
            .await
    }

    /// Runs one collection round against an already connected validator set.
    ///
    /// Terminates as soon as the accumulated weight reaches `quorum_weight`, every dispatched
    /// request has responded or failed (exhaustion), or `timeout` elapses, whichever comes
    /// first. Responses arriving after termination are dropped unverified.
    pub async fn collect_signatures(
        &self,
        connected: &ConnectedValidators,
        message: &UnsignedMessage,
        quorum_weight: u128,
        timeout: Duration,
    ) -> Result<AggregateResult, AggregationError> {
        let request_id = self.network.next_request_id();

        // Register before sending, so a response cannot arrive before anyone is listening.
        let mut responses = self.network.register_request(request_id);
        defer! {
            self.network.forget_request(request_id);
        }

        let request = ExternalMessage::SignatureRequest(SignatureRequest {
            request_id,
            message: message.clone(),
        });

        let mut dispatched = 0usize;
        for node in &connected.connected {
            self.network.send_request(*node, request.clone())?;
            dispatched += 1;
        }
        debug!(
            request_id,
            dispatched,
            quorum_weight,
            total_weight = connected.total_weight(),
            "dispatched signing requests"
        );
        if dispatched == 0 {
            return Err(AggregationError::QuorumNotMet {
                achieved: 0,
                required: quorum_weight,
                signers: 0,
            });
        }

        let signable = message.to_signable_bytes();
        let mut state = RoundState {
            signatures: Vec::new(),
            signers: bitvec![u8, Msb0; 0; connected.validators.validators.len()],
            achieved_weight: 0,
        };

        let outcome = tokio::time::timeout(timeout, async {
            // Exactly one response per node; a node cannot talk a round into exhaustion by
            // replying more than once.
            let mut responded = HashSet::new();
            while let Some((from, response)) = responses.recv().await {
                if !responded.insert(from) {
                    debug!(%from, "ignoring duplicate response");
                    continue;
                }
                self.accept(&mut state, connected, &signable, from, response);
                if state.achieved_weight >= quorum_weight {
                    return RoundOutcome::Quorum;
                }
                if responded.len() >= dispatched {
                    return RoundOutcome::Exhausted;
                }
            }
            // The channel can only close if the network is torn down mid-round; there is
            // nothing left to wait for.
            RoundOutcome::Exhausted
        })
        .await;

        match outcome {
            Ok(RoundOutcome::Quorum) => {
                let signature = NodeSignature::aggregate(&state.signatures)
                    .map_err(AggregationError::Aggregation)?;
                info!(
                    request_id,
                    achieved_weight = state.achieved_weight,
                    quorum_weight,
                    signers = state.signers.count_ones(),
                    "quorum reached"
                );
                Ok(AggregateResult {
                    signature,
                    signers: state.signers,
                    achieved_weight: state.achieved_weight,
                    total_weight: connected.total_weight(),
                })
            }
            Ok(RoundOutcome::Exhausted) => Err(AggregationError::QuorumNotMet {
                achieved: state.achieved_weight,
                required: quorum_weight,
                signers: state.signers.count_ones(),
            }),
            Err(_) => Err(AggregationError::Timeout {
                achieved: state.achieved_weight,
                required: quorum_weight,
            }),
        }
    }

    /// Verifies one response and, if it holds up, credits its validator's weight. Rejected
    /// responses are logged and excluded; they never abort the round.
    fn accept(
        &self,
        state: &mut RoundState,
        connected: &ConnectedValidators,
        signable: &[u8],
        from: PeerId,
        response: SignatureResponse,
    ) {
        if let Some(error) = response.error {
            debug!(%from, error, "node declined to sign");
            return;
        }
        let Some(bytes) = response.signature else {
            debug!(%from, "response carried neither signature nor error");
            return;
        };
        let Some(&index) = connected.node_index.get(&from) else {
            warn!(%from, "response from node outside the validator set");
            return;
        };
        let validator = &connected.validators.validators[index];

        let signature = match NodeSignature::from_bytes(&bytes) {
            Ok(signature) => signature,
            Err(err) => {
                warn!(%from, validator = index, %err, "malformed partial signature");
                return;
            }
        };
        if validator.public_key.verify(signable, signature).is_err() {
            warn!(%from, validator = index, "rejecting partial signature from untrusted signer");
            return;
        }

        // A validator contributes its weight exactly once, however many of its nodes reply.
        if state.signers[index] {
            trace!(%from, validator = index, "validator has already contributed");
            return;
        }
        state.signers.set(index, true);
        state.signatures.push(signature);
        state.achieved_weight += validator.weight;
        trace!(
            %from,
            validator = index,
            weight = validator.weight,
            achieved_weight = state.achieved_weight,
            "accepted partial signature"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, HashSet},
        sync::{Arc, Mutex},
        time::Duration,
    };

    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use libp2p::PeerId;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::{SignatureAggregator, quorum_weight};
    use crate::{
        crypto::{Hash, SecretKey},
        error::AggregationError,
        message::{ExternalMessage, SignatureResponse, UnsignedMessage},
        peers::{ConnectedValidators, PeerCommand, PeerDirectory, PeerEntry, PeerNetwork},
        validators::{NodeRecord, ValidatorInfoClient},
    };

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Behavior {
        /// Sign the requested message.
        Valid,
        /// Sign some other bytes, so verification fails.
        WrongMessage,
        /// Reply with an error instead of a signature.
        Decline,
        /// Never reply.
        Silent,
    }

    /// One logical validator for a test round: a weight and the behavior of each backing node.
    struct Signer {
        weight_per_node: Vec<u128>,
        behaviors: Vec<Behavior>,
    }

    fn signer(weight: u128, behavior: Behavior) -> Signer {
        Signer {
            weight_per_node: vec![weight],
            behaviors: vec![behavior],
        }
    }

    struct Harness {
        network: Arc<PeerNetwork>,
        aggregator: SignatureAggregator,
        connected: ConnectedValidators,
        /// The nodes of each signer, in construction order.
        nodes: Vec<Vec<PeerId>>,
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

    struct EmptyDirectory;

    #[async_trait]
    impl PeerDirectory for EmptyDirectory {
        async fn peers(&self) -> Result<Vec<PeerEntry>> {
            Ok(Vec::new())
        }
    }

    fn spawn_responder(
        network: Arc<PeerNetwork>,
        mut commands: UnboundedReceiver<PeerCommand>,
        keys: HashMap<PeerId, SecretKey>,
        behaviors: HashMap<PeerId, Behavior>,
    ) {
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                let PeerCommand::SendRequest(peer, message) = command else {
                    continue;
                };
                let ExternalMessage::SignatureRequest(request) = message else {
                    continue;
                };
                let signature = match behaviors[&peer] {
                    Behavior::Valid => keys[&peer].sign(&request.message.to_signable_bytes()),
                    Behavior::WrongMessage => keys[&peer].sign(b"some other message"),
                    Behavior::Decline => {
                        network.deliver(
                            peer,
                            SignatureResponse {
                                request_id: request.request_id,
                                signature: None,
                                error: Some("refused to sign".to_owned()),
                            },
                        );
                        continue;
                    }
                    Behavior::Silent => continue,
                };
                network.deliver(
                    peer,
                    SignatureResponse {
                        request_id: request.request_id,
                        signature: Some(signature.to_bytes()),
                        error: None,
                    },
                );
            }
        });
    }

    /// Builds a network whose "validators" are in-memory signers driven by a responder task
    /// standing in for the p2p event loop.
    async fn harness(signers: Vec<Signer>) -> Harness {
        let mut records = Vec::new();
        let mut nodes = Vec::new();
        let mut keys = HashMap::new();
        let mut behaviors = HashMap::new();
        for (i, signer) in signers.iter().enumerate() {
            let key = SecretKey::new_from_rng(&mut ChaCha8Rng::seed_from_u64(i as u64)).unwrap();
            let mut signer_nodes = Vec::new();
            for (weight, behavior) in signer.weight_per_node.iter().zip(&signer.behaviors) {
                let node_id = PeerId::random();
                records.push(NodeRecord {
                    public_key: key.node_public_key(),
                    weight: *weight,
                    node_id,
                });
                keys.insert(node_id, key);
                behaviors.insert(node_id, *behavior);
                signer_nodes.push(node_id);
            }
            nodes.push(signer_nodes);
        }

        let all_nodes: HashSet<_> = keys.keys().copied().collect();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let network = Arc::new(PeerNetwork::new(
            command_tx,
            Arc::new(Mutex::new(all_nodes)),
            Arc::new(StaticInfo {
                records: records.clone(),
            }),
            Arc::new(EmptyDirectory),
        ));
        spawn_responder(network.clone(), command_rx, keys, behaviors);

        let connected = network.connect_to_validators(0).await.unwrap();
        Harness {
            aggregator: SignatureAggregator::new(network.clone(), TIMEOUT),
            network,
            connected,
            nodes,
        }
    }

    fn message() -> UnsignedMessage {
        UnsignedMessage::new(7, b"transfer 10 tokens".to_vec())
    }

    #[test]
    fn quorum_weight_rounds_up() {
        assert_eq!(quorum_weight(100, 67), 67);
        assert_eq!(quorum_weight(3, 67), 3);
        assert_eq!(quorum_weight(0, 67), 0);
    }

    #[tokio::test]
    async fn quorum_reached_with_sufficient_weight() {
        let harness = harness(vec![
            signer(40, Behavior::Valid),
            signer(35, Behavior::Valid),
            signer(25, Behavior::Silent),
        ])
        .await;
        let message = message();

        let result = harness
            .aggregator
            .collect_signatures(&harness.connected, &message, 67, TIMEOUT)
            .await
            .unwrap();

        assert_eq!(result.achieved_weight, 75);
        assert_eq!(result.total_weight, 100);

        let index = &harness.connected.node_index;
        assert!(result.signers[index[&harness.nodes[0][0]]]);
        assert!(result.signers[index[&harness.nodes[1][0]]]);
        assert!(!result.signers[index[&harness.nodes[2][0]]]);

        result.verify(&message, &harness.connected.validators).unwrap();
    }

    #[tokio::test]
    async fn quorum_not_met_when_round_is_exhausted() {
        let harness = harness(vec![
            signer(40, Behavior::Valid),
            signer(35, Behavior::Decline),
            signer(25, Behavior::Valid),
        ])
        .await;

        let error = harness
            .aggregator
            .collect_signatures(&harness.connected, &message(), 67, TIMEOUT)
            .await
            .unwrap_err();

        match error {
            AggregationError::QuorumNotMet {
                achieved,
                required,
                signers,
            } => {
                assert_eq!(achieved, 65);
                assert_eq!(required, 67);
                assert_eq!(signers, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn round_times_out_without_responses() {
        let harness = harness(vec![
            signer(40, Behavior::Silent),
            signer(60, Behavior::Silent),
        ])
        .await;

        let error = harness
            .aggregator
            .collect_signatures(&harness.connected, &message(), 67, Duration::from_millis(50))
            .await
            .unwrap_err();

        match error {
            AggregationError::Timeout { achieved, required } => {
                assert_eq!(achieved, 0);
                assert_eq!(required, 67);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn validator_with_many_nodes_counts_once() {
        let harness = harness(vec![
            Signer {
                weight_per_node: vec![30, 30],
                behaviors: vec![Behavior::Valid, Behavior::Valid],
            },
            signer(40, Behavior::Valid),
        ])
        .await;
        let message = message();

        let result = harness
            .aggregator
            .collect_signatures(&harness.connected, &message, 100, TIMEOUT)
            .await
            .unwrap();

        // Both of the first validator's nodes replied validly, but its weight is credited once
        // and it occupies a single bit.
        assert_eq!(result.achieved_weight, 100);
        assert_eq!(result.signers.count_ones(), 2);
        result.verify(&message, &harness.connected.validators).unwrap();
    }

    #[tokio::test]
    async fn invalid_signature_is_excluded() {
        let harness = harness(vec![
            signer(40, Behavior::WrongMessage),
            signer(35, Behavior::Valid),
            signer(25, Behavior::Valid),
        ])
        .await;
        let message = message();

        let result = harness
            .aggregator
            .collect_signatures(&harness.connected, &message, 60, TIMEOUT)
            .await
            .unwrap();

        assert_eq!(result.achieved_weight, 60);
        let index = &harness.connected.node_index;
        assert!(!result.signers[index[&harness.nodes[0][0]]]);
        result.verify(&message, &harness.connected.validators).unwrap();
    }

    #[tokio::test]
    async fn duplicate_responses_from_one_node_count_once() {
        let key_a = SecretKey::new_from_rng(&mut ChaCha8Rng::seed_from_u64(0)).unwrap();
        let key_b = SecretKey::new_from_rng(&mut ChaCha8Rng::seed_from_u64(1)).unwrap();
        let node_a = PeerId::random();
        let node_b = PeerId::random();
        let records = vec![
            NodeRecord {
                public_key: key_a.node_public_key(),
                weight: 40,
                node_id: node_a,
            },
            NodeRecord {
                public_key: key_b.node_public_key(),
                weight: 60,
                node_id: node_b,
            },
        ];
        let (command_tx, mut command_rx) = mpsc::unbounded_channel();
        let network = Arc::new(PeerNetwork::new(
            command_tx,
            Arc::new(Mutex::new([node_a, node_b].into_iter().collect())),
            Arc::new(StaticInfo { records }),
            Arc::new(EmptyDirectory),
        ));
        let connected = network.connect_to_validators(0).await.unwrap();
        let aggregator = SignatureAggregator::new(network.clone(), TIMEOUT);
        let message = message();

        // Wait for both dispatched requests, then reply in a fixed order: two declines from the
        // first validator's node, then a valid signature from the second.
        {
            let network = network.clone();
            let signable = message.to_signable_bytes();
            tokio::spawn(async move {
                let mut round = None;
                for _ in 0..2 {
                    if let Some(PeerCommand::SendRequest(_, message)) = command_rx.recv().await {
                        round = Some(message.request_id());
                    }
                }
                let round = round.unwrap();
                for _ in 0..2 {
                    network.deliver(
                        node_a,
                        SignatureResponse {
                            request_id: round,
                            signature: None,
                            error: Some("refused to sign".to_owned()),
                        },
                    );
                }
                network.deliver(
                    node_b,
                    SignatureResponse {
                        request_id: round,
                        signature: Some(key_b.sign(&signable).to_bytes()),
                        error: None,
                    },
                );
            });
        }

        let result = aggregator
            .collect_signatures(&connected, &message, 60, TIMEOUT)
            .await
            .unwrap();

        // The duplicate decline must not exhaust the round before the valid reply arrives.
        assert_eq!(result.achieved_weight, 60);
        assert_eq!(result.signers.count_ones(), 1);
    }

    #[tokio::test]
    async fn pipeline_resolves_connects_and_aggregates() {
        let harness = harness(vec![
            signer(40, Behavior::Valid),
            signer(35, Behavior::Valid),
            signer(25, Behavior::Decline),
        ])
        .await;
        let message = message();

        let result = harness
            .aggregator
            .get_aggregate_signature(0, &message, 67)
            .await
            .unwrap();

        assert_eq!(result.achieved_weight, 75);
        assert_eq!(result.total_weight, 100);

        // The pipeline resolved a fresh set; verify against an equally fresh resolution.
        let resolved = harness.network.connect_to_validators(0).await.unwrap();
        result.verify(&message, &resolved.validators).unwrap();
    }
}
