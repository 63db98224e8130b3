//! PoI consensus errors.

use alloy_primitives::Address;
use thiserror::Error;

/// PoI consensus errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoiError {
    /// Unknown block error.
    #[error("unknown block")]
    UnknownBlock,

    /// Block is from the future.
    #[error("block from future: block time {block_time}, current time {current_time}")]
    FutureBlock {
        block_time: u64,
        current_time: u64,
    },

    /// Unknown ancestor error.
    #[error("unknown ancestor")]
    UnknownAncestor,

    /// Checkpoint block has non-zero beneficiary.
    #[error("beneficiary in checkpoint block non-zero")]
    InvalidCheckpointBeneficiary,

    /// Invalid vote nonce (not 0x00..0 or 0xff..f).
    #[error("vote nonce not 0x00..0 or 0xff..f")]
    InvalidVote,

    /// Checkpoint block has non-zero vote nonce.
    #[error("vote nonce in checkpoint block non-zero")]
    InvalidCheckpointVote,

    /// Missing vanity in extra-data.
    #[error("extra-data 32 byte vanity prefix missing")]
    MissingVanity,

    /// Missing signature in extra-data.
    #[error("extra-data 65 byte signature suffix missing")]
    MissingSignature,

    /// Non-checkpoint block contains signer list.
    #[error("non-checkpoint block contains extra signer list")]
    ExtraSigners,

    /// Invalid signer list on checkpoint block.
    #[error("invalid signer list on checkpoint block")]
    InvalidCheckpointSigners,

    /// Mismatching signer list on checkpoint block.
    #[error("mismatching signer list on checkpoint block")]
    MismatchingCheckpointSigners,

    /// Invalid difficulty (not 1 or 2).
    #[error("invalid difficulty: expected 1 or 2, got {difficulty}")]
    InvalidDifficulty { difficulty: u64 },

    /// Wrong difficulty for signer's turn.
    #[error("wrong difficulty: signer {signer} at block {block}, expected {expected}, got {actual}")]
    WrongDifficulty {
        signer: Address,
        block: u64,
        expected: u64,
        actual: u64,
    },

    /// Invalid timestamp (too close to parent).
    #[error("invalid timestamp: parent {parent_time} + period {period} > block {block_time}")]
    InvalidTimestamp {
        parent_time: u64,
        period: u64,
        block_time: u64,
    },

    /// Invalid voting chain.
    #[error("invalid voting chain")]
    InvalidVotingChain,

    /// Unauthorized signer.
    #[error("unauthorized signer: {signer}")]
    UnauthorizedSigner { signer: Address },

    /// Signer recently signed.
    #[error("signer {signer} recently signed at block {recent_block}")]
    RecentlySigned {
        signer: Address,
        recent_block: u64,
    },

    /// Negative performance metric.
    #[error("invalid performance value: {performance}")]
    InvalidPerformance { performance: i64 },

    /// Signature recovery failed.
    #[error("signature recovery failed: {message}")]
    SignatureRecoveryFailed { message: String },

    /// Corrupted persisted snapshot or bad RLP.
    #[error("decode error: {message}")]
    DecodeError { message: String },

    /// Database error.
    #[error("database error: {message}")]
    DatabaseError { message: String },
}

impl From<serde_json::Error> for PoiError {
    fn from(err: serde_json::Error) -> Self {
        Self::DecodeError {
            message: err.to_string(),
        }
    }
}
