//! PoI proof-of-authority consensus engine.
//!
//! The engine maintains, at each block height, a snapshot of the authorized
//! signer set, the open authorization votes and their tallies, the recent
//! signers used for spam protection, and per-signer health and performance
//! metrics driving the block-leader rotation.
//!
//! The snapshot transition is a pure function over a header sequence, so
//! every node folding the same headers onto the same base arrives at the
//! bit-identical signer set. Health and performance are local operational
//! hints layered on top: they shape the rotation schedule and backup signer
//! selection but never enter the persisted consensus state.
//!
//! Database operations are abstracted via traits to allow memory-based
//! testing.

mod api;
mod database;
mod error;
mod poi;
mod snapshot;
#[cfg(test)]
mod testutil;

pub use api::{PoiApi, PoiStatus, SignerQuery};
pub use database::{
    snapshot_key, MemorySnapshotDatabase, NoopSnapshotDatabase, SnapshotDatabase,
    POI_SNAPSHOT_PREFIX,
};
pub use error::PoiError;
pub use poi::{ChainHeaderReader, Poi};
pub use snapshot::{HeaderData, PoiConfig, SignerHealth, Snapshot, Tally, Vote};

use alloy_primitives::B64;

/// Fixed number of extra-data prefix bytes reserved for signer vanity.
pub const EXTRA_VANITY: usize = 32;

/// Fixed number of extra-data suffix bytes reserved for signer seal (65 bytes signature).
pub const EXTRA_SEAL: usize = 65;

/// Default number of blocks after which to checkpoint and reset the pending votes.
pub const EPOCH_LENGTH: u64 = 30000;

/// Number of blocks after which to save the vote snapshot to the database.
pub const CHECKPOINT_INTERVAL: u64 = 1024;

/// Number of recent vote snapshots to keep in memory.
pub const INMEMORY_SNAPSHOTS: usize = 128;

/// Number of recent block signatures to keep in memory.
pub const INMEMORY_SIGNATURES: usize = 4096;

/// Number of blocks after which a chain segment is considered immutable and
/// an epoch checkpoint may seed a snapshot directly.
pub const FULL_IMMUTABILITY_THRESHOLD: usize = 90000;

/// Block difficulty for in-turn signatures.
pub const DIFF_IN_TURN: u64 = 2;

/// Block difficulty for out-of-turn signatures.
pub const DIFF_NO_TURN: u64 = 1;

/// Magic nonce number to vote on adding a new signer.
pub const NONCE_AUTH_VOTE: B64 = B64::new([0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);

/// Magic nonce number to vote on removing a signer.
pub const NONCE_DROP_VOTE: B64 = B64::new([0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
