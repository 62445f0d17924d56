//! The JSON-RPC surface through which clients request aggregate signatures.

use std::sync::Arc;

use anyhow::anyhow;
use jsonrpsee::{
    RpcModule,
    types::{ErrorObject, ErrorObjectOwned, Params, error::ErrorCode},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{aggregation::SignatureAggregator, crypto::Hash, message::UnsignedMessage};

/// Applied when a request does not name its own quorum requirement.
const DEFAULT_QUORUM_PERCENTAGE: u8 = 67;

#[derive(Debug, Deserialize)]
struct CollectSignaturesRequest {
    /// Hex-encoded message payload.
    payload: String,
    /// The chain whose validators must attest, if the caller knows it.
    #[serde(default)]
    source_chain_id: Option<u64>,
    /// The blockchain instance the message originated on. Resolved to its chain when
    /// `source_chain_id` is absent.
    #[serde(default)]
    blockchain_id: Option<String>,
    #[serde(default)]
    quorum_percentage: Option<u8>,
}

#[derive(Debug, Clone, Serialize)]
struct CollectSignaturesResponse {
    /// Hex-encoded aggregate signature.
    signature: String,
    /// Hex-encoded signer bitset, indexed by canonical validator order.
    signers: String,
    achieved_weight: u128,
    total_weight: u128,
}

pub fn rpc_module(aggregator: Arc<SignatureAggregator>) -> RpcModule<Arc<SignatureAggregator>> {
    let mut module = RpcModule::new(aggregator);

    module
        .register_async_method(
            "aggregator_collectSignatures",
            |params, aggregator, _| async move { collect_signatures(params, &aggregator).await },
        )
        .unwrap();

    module
}

async fn collect_signatures(
    params: Params<'_>,
    aggregator: &SignatureAggregator,
) -> Result<CollectSignaturesResponse, ErrorObjectOwned> {
    let request: CollectSignaturesRequest = params.parse()?;

    let payload =
        hex::decode(request.payload.trim_start_matches("0x")).map_err(invalid_params)?;
    let quorum_percentage = request
        .quorum_percentage
        .unwrap_or(DEFAULT_QUORUM_PERCENTAGE);
    if quorum_percentage == 0 || quorum_percentage > 100 {
        return Err(invalid_params(anyhow!(
            "quorum_percentage must be between 1 and 100"
        )));
    }

    let chain_id = match (request.source_chain_id, request.blockchain_id) {
        (Some(chain_id), _) => chain_id,
        (None, Some(blockchain_id)) => {
            let blockchain_id = Hash::from_hex(&blockchain_id).map_err(invalid_params)?;
            aggregator
                .network()
                .chain_of(blockchain_id)
                .await
                .map_err(internal_error)?
        }
        (None, None) => {
            return Err(invalid_params(anyhow!(
                "either source_chain_id or blockchain_id must be given"
            )));
        }
    };

    let message = UnsignedMessage::new(chain_id, payload);
    info!(%message, quorum_percentage, "collecting signatures");

    let result = aggregator
        .get_aggregate_signature(chain_id, &message, quorum_percentage)
        .await?;

    Ok(CollectSignaturesResponse {
        signature: hex::encode(result.signature.to_bytes()),
        signers: hex::encode(result.signers.into_vec()),
        achieved_weight: result.achieved_weight,
        total_weight: result.total_weight,
    })
}

fn invalid_params(e: impl ToString) -> ErrorObjectOwned {
    ErrorObject::owned(ErrorCode::InvalidParams.code(), e.to_string(), None::<String>)
}

fn internal_error(e: impl ToString) -> ErrorObjectOwned {
    ErrorObject::owned(ErrorCode::InternalError.code(), e.to_string(), None::<String>)
}
