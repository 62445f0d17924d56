//! Wire messages exchanged with validator nodes over the request/response protocol.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::crypto::Hash;

/// A cross-chain message awaiting attestation by the source chain's validators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedMessage {
    /// Identifier of the chain the message originated on.
    pub source_chain_id: u64,
    /// Opaque message payload. Decoding it is the message protocol's concern, not ours.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl UnsignedMessage {
    pub fn new(source_chain_id: u64, payload: Vec<u8>) -> UnsignedMessage {
        UnsignedMessage {
            source_chain_id,
            payload,
        }
    }

    /// The exact bytes every validator signs.
    pub fn to_signable_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + self.payload.len());
        bytes.extend_from_slice(&self.source_chain_id.to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn id(&self) -> Hash {
        Hash::compute([&self.source_chain_id.to_be_bytes()[..], &self.payload])
    }
}

impl Display for UnsignedMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "UnsignedMessage({}, {})", self.source_chain_id, self.id())
    }
}

/// A signing request fanned out to each connected validator node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRequest {
    pub request_id: u32,
    pub message: UnsignedMessage,
}

/// One validator node's reply to a [SignatureRequest].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureResponse {
    pub request_id: u32,
    /// The raw partial signature over the message's signable bytes, if the node signed it.
    #[serde(with = "serde_bytes")]
    pub signature: Option<Vec<u8>>,
    /// Why the node did not sign, if it didn't.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExternalMessage {
    SignatureRequest(SignatureRequest),
    SignatureResponse(SignatureResponse),
}

impl ExternalMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ExternalMessage::SignatureRequest(_) => "SignatureRequest",
            ExternalMessage::SignatureResponse(_) => "SignatureResponse",
        }
    }

    pub fn request_id(&self) -> u32 {
        match self {
            ExternalMessage::SignatureRequest(request) => request.request_id,
            ExternalMessage::SignatureResponse(response) => response.request_id,
        }
    }
}

/// Returns a terse, human-readable summary of a message.
impl Display for ExternalMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ExternalMessage::SignatureRequest(request) => {
                write!(f, "SignatureRequest({}, {})", request.request_id, request.message)
            }
            ExternalMessage::SignatureResponse(response) => {
                write!(f, "SignatureResponse({})", response.request_id)
            }
        }
    }
}
