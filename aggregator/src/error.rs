use jsonrpsee::types::{ErrorObject, ErrorObjectOwned, error::ErrorCode};

/// An error from one signature aggregation attempt.
///
/// Per-response verification failures are deliberately absent: an invalid partial signature is
/// logged and excluded, but never aborts a round.
#[derive(thiserror::Error, Debug)]
pub enum AggregationError {
    /// Validator-set discovery failed or returned invalid data. Fatal to the attempt.
    #[error("failed to resolve validator set: {0}")]
    Resolution(anyhow::Error),
    /// The connectivity subsystem itself is unavailable. An unreachable peer is not an error,
    /// merely a lower connected weight.
    #[error("peer network unavailable: {0}")]
    Connection(&'static str),
    /// Every outstanding request responded or failed, below the quorum threshold.
    #[error("quorum not met: achieved weight {achieved} of required {required} ({signers} signers)")]
    QuorumNotMet {
        achieved: u128,
        required: u128,
        signers: usize,
    },
    /// The wall-clock budget elapsed before quorum.
    #[error("timed out below quorum: achieved weight {achieved} of required {required}")]
    Timeout { achieved: u128, required: u128 },
    /// The cryptographic combination step rejected signatures which already passed verification.
    /// This indicates an invariant violation and should be treated as a bug, not retried.
    #[error("failed to combine partial signatures: {0}")]
    Aggregation(anyhow::Error),
}

impl From<AggregationError> for ErrorObjectOwned {
    fn from(error: AggregationError) -> Self {
        ErrorObject::owned(
            ErrorCode::InternalError.code(),
            error.to_string(),
            None::<String>,
        )
    }
}
