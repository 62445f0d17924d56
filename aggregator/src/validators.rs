//! Discovery and canonicalization of a chain's validator set.
//!
//! The validator-information service reports one record per network node. Several nodes can be
//! backed by the same BLS key, so records are collapsed into canonical validators before any
//! quorum arithmetic happens.

use std::{
    collections::{BTreeMap, HashMap, HashSet, btree_map::Entry},
    time::Duration,
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use jsonrpsee::{
    core::client::ClientT,
    http_client::{HttpClient, HttpClientBuilder},
    rpc_params,
};
use libp2p::{Multiaddr, PeerId};
use serde::Deserialize;
use tracing::debug;

use crate::{
    crypto::{Hash, NodePublicKey},
    error::AggregationError,
    peers::{PeerDirectory, PeerEntry},
};

/// One record per network node, as reported by the validator-information service.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub public_key: NodePublicKey,
    pub weight: u128,
    pub node_id: PeerId,
}

/// A canonical validator: every node sharing one BLS public key, with their summed weight.
#[derive(Debug, Clone)]
pub struct Validator {
    pub public_key: NodePublicKey,
    pub node_ids: Vec<PeerId>,
    pub weight: u128,
}

/// The validator set of one chain at one resolution instant. Immutable once resolved; a fresh
/// resolution produces a new instance.
#[derive(Debug, Clone)]
pub struct CanonicalValidatorSet {
    /// Validators in a stable order derived from their public key bytes, so indices are
    /// reproducible across resolutions of the same input.
    pub validators: Vec<Validator>,
    pub total_weight: u128,
}

impl CanonicalValidatorSet {
    /// Maps each node to the index of its owning validator.
    pub fn node_index(&self) -> HashMap<PeerId, usize> {
        let mut index = HashMap::new();
        for (i, validator) in self.validators.iter().enumerate() {
            for node in &validator.node_ids {
                index.insert(*node, i);
            }
        }
        index
    }
}

/// The external validator-information service.
#[async_trait]
pub trait ValidatorInfoClient: Send + Sync {
    /// The latest finalized height of the given chain.
    async fn latest_height(&self, chain_id: u64) -> Result<u64>;
    /// The raw per-node validator records active at the given height.
    async fn validator_set(&self, chain_id: u64, height: u64) -> Result<Vec<NodeRecord>>;
    /// The chain a blockchain instance belongs to.
    async fn chain_of(&self, blockchain_id: Hash) -> Result<u64>;
}

/// Resolves the current canonical validator set of the given chain.
///
/// Performs no retries; the caller decides retry policy.
pub async fn resolve(
    client: &dyn ValidatorInfoClient,
    chain_id: u64,
) -> Result<CanonicalValidatorSet, AggregationError> {
    let height = client
        .latest_height(chain_id)
        .await
        .map_err(AggregationError::Resolution)?;
    let records = client
        .validator_set(chain_id, height)
        .await
        .map_err(AggregationError::Resolution)?;
    let set = canonicalize(records).map_err(AggregationError::Resolution)?;
    debug!(
        chain_id,
        height,
        validators = set.validators.len(),
        total_weight = set.total_weight,
        "resolved validator set"
    );
    Ok(set)
}

/// Collapses per-node records into canonical validators, grouped by public key with weights
/// summed, emitted in public-key byte order.
pub fn canonicalize(records: Vec<NodeRecord>) -> Result<CanonicalValidatorSet> {
    if records.is_empty() {
        return Err(anyhow!("validator set is empty"));
    }

    let mut seen_nodes = HashSet::new();
    let mut groups: BTreeMap<Vec<u8>, Validator> = BTreeMap::new();
    for record in records {
        if record.weight == 0 {
            return Err(anyhow!("zero-weight validator node {}", record.node_id));
        }
        if !seen_nodes.insert(record.node_id) {
            return Err(anyhow!("duplicate node identifier {}", record.node_id));
        }
        match groups.entry(record.public_key.as_bytes()) {
            Entry::Vacant(entry) => {
                entry.insert(Validator {
                    public_key: record.public_key,
                    node_ids: vec![record.node_id],
                    weight: record.weight,
                });
            }
            Entry::Occupied(entry) => {
                let validator = entry.into_mut();
                validator.node_ids.push(record.node_id);
                validator.weight += record.weight;
            }
        }
    }

    let validators: Vec<_> = groups.into_values().collect();
    let total_weight = validators.iter().map(|v| v.weight).sum();
    Ok(CanonicalValidatorSet {
        validators,
        total_weight,
    })
}

/// A validator-information service spoken to over JSON-RPC. Doubles as the peer directory, since
/// the same service reports the network addresses of known peers.
#[derive(Debug)]
pub struct RpcValidatorInfo {
    client: HttpClient,
}

#[derive(Debug, Deserialize)]
struct RawValidator {
    /// Hex-encoded BLS public key.
    public_key: String,
    weight: u128,
    node_id: String,
}

#[derive(Debug, Deserialize)]
struct RawPeer {
    node_id: String,
    address: String,
}

impl RpcValidatorInfo {
    pub fn new(url: &str, request_timeout: Duration) -> Result<RpcValidatorInfo> {
        let client = HttpClientBuilder::default()
            .request_timeout(request_timeout)
            .build(url)?;
        Ok(RpcValidatorInfo { client })
    }
}

#[async_trait]
impl ValidatorInfoClient for RpcValidatorInfo {
    async fn latest_height(&self, chain_id: u64) -> Result<u64> {
        let height = self
            .client
            .request("chain_latestFinalizedHeight", rpc_params![chain_id])
            .await?;
        Ok(height)
    }

    async fn validator_set(&self, chain_id: u64, height: u64) -> Result<Vec<NodeRecord>> {
        let raw: Vec<RawValidator> = self
            .client
            .request("chain_getValidatorSet", rpc_params![chain_id, height])
            .await?;
        raw.into_iter()
            .map(|validator| {
                Ok(NodeRecord {
                    public_key: NodePublicKey::from_bytes(&hex::decode(
                        validator.public_key.trim_start_matches("0x"),
                    )?)?,
                    weight: validator.weight,
                    node_id: validator.node_id.parse()?,
                })
            })
            .collect()
    }

    async fn chain_of(&self, blockchain_id: Hash) -> Result<u64> {
        let chain_id = self
            .client
            .request("chain_getChainId", rpc_params![blockchain_id.to_string()])
            .await?;
        Ok(chain_id)
    }
}

#[async_trait]
impl PeerDirectory for RpcValidatorInfo {
    async fn peers(&self) -> Result<Vec<PeerEntry>> {
        let raw: Vec<RawPeer> = self.client.request("admin_peers", rpc_params![]).await?;
        raw.into_iter()
            .map(|peer| {
                Ok(PeerEntry {
                    node_id: peer.node_id.parse()?,
                    address: peer.address.parse::<Multiaddr>()?,
                })
            })
            .collect()
    }
}
