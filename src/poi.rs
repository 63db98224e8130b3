//! PoI proof-of-authority consensus engine implementation.

use super::{
    database::SnapshotDatabase,
    error::PoiError,
    snapshot::{HeaderData, PoiConfig, Snapshot},
    CHECKPOINT_INTERVAL, DIFF_IN_TURN, DIFF_NO_TURN, EXTRA_SEAL, EXTRA_VANITY,
    FULL_IMMUTABILITY_THRESHOLD, INMEMORY_SIGNATURES, INMEMORY_SNAPSHOTS, NONCE_AUTH_VOTE,
    NONCE_DROP_VOTE,
};
use alloy_primitives::{keccak256, Address, B256};
use lru::LruCache;
use parking_lot::RwLock;
use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    Message, PublicKey, Secp256k1,
};
use std::{collections::HashMap, fmt, num::NonZeroUsize, sync::Arc, time::SystemTime};
use tracing::trace;

/// Chain header reader trait for accessing blockchain headers.
pub trait ChainHeaderReader: Send + Sync {
    /// Get the current header.
    fn current_header(&self) -> Option<HeaderData>;

    /// Get header by hash and number.
    fn get_header(&self, hash: B256, number: u64) -> Option<HeaderData>;

    /// Get header by number.
    fn get_header_by_number(&self, number: u64) -> Option<HeaderData>;

    /// Get header by hash.
    fn get_header_by_hash(&self, hash: B256) -> Option<HeaderData>;
}

/// Mutable engine state. Everything in here is guarded by the single
/// reader-writer lock on [`Poi::state`]; no other synchronization exists.
struct PoiState {
    /// Snapshots for recent blocks to speed up reorgs.
    recents: LruCache<B256, Snapshot>,

    /// Signatures of recent blocks to speed up mining.
    signatures: LruCache<B256, Address>,

    /// Current list of proposals we are pushing.
    proposals: HashMap<Address, bool>,

    /// Address of the local signing key.
    signer: Option<Address>,
}

impl PoiState {
    fn new() -> Self {
        Self {
            recents: LruCache::new(NonZeroUsize::new(INMEMORY_SNAPSHOTS).unwrap()),
            signatures: LruCache::new(NonZeroUsize::new(INMEMORY_SIGNATURES).unwrap()),
            proposals: HashMap::new(),
            signer: None,
        }
    }
}

/// PoI proof-of-authority consensus engine with a health- and
/// performance-aware signer schedule.
///
/// The lock on `state` is never held across chain reads, database access, or
/// signature recovery; those run unlocked and the lock is reacquired to
/// publish their results.
pub struct Poi<DB: SnapshotDatabase> {
    /// Consensus engine configuration.
    config: PoiConfig,

    /// Database to store and retrieve snapshot checkpoints.
    db: Arc<DB>,

    /// Caches, proposals, and the local signer identity.
    state: RwLock<PoiState>,

    /// Secp256k1 context for signature operations.
    secp: Secp256k1<secp256k1::All>,

    /// Skip difficulty verifications (for testing).
    fake_diff: bool,
}

impl<DB: SnapshotDatabase> Poi<DB> {
    /// Create a new PoI consensus engine.
    pub fn new(config: PoiConfig, db: Arc<DB>) -> Self {
        Self {
            config,
            db,
            state: RwLock::new(PoiState::new()),
            secp: Secp256k1::new(),
            fake_diff: false,
        }
    }

    /// Create a new PoI engine with fake difficulty (for testing).
    pub fn new_fake_diff(config: PoiConfig, db: Arc<DB>) -> Self {
        let mut engine = Self::new(config, db);
        engine.fake_diff = true;
        engine
    }

    /// Get the configuration.
    pub fn config(&self) -> &PoiConfig {
        &self.config
    }

    /// Authorize a signer.
    pub fn authorize(&self, signer: Address) {
        self.state.write().signer = Some(signer);
    }

    /// Get the current signer.
    pub fn signer(&self) -> Option<Address> {
        self.state.read().signer
    }

    /// Propose to authorize or deauthorize an address.
    pub fn propose(&self, address: Address, authorize: bool) {
        self.state.write().proposals.insert(address, authorize);
    }

    /// Remove a proposal.
    pub fn discard(&self, address: Address) {
        self.state.write().proposals.remove(&address);
    }

    /// Get the current proposals.
    pub fn proposals(&self) -> HashMap<Address, bool> {
        self.state.read().proposals.clone()
    }

    /// Update the performance metric on the live snapshot for the given
    /// chain position.
    ///
    /// The hint is applied to the cached snapshot when present, otherwise the
    /// supplied snapshot is updated and cached so the hint sticks. Operational
    /// only; never part of the persisted form.
    pub fn set_signer_performance(
        &self,
        snap: Snapshot,
        address: Address,
        performance: i64,
    ) -> Result<(), PoiError> {
        let mut state = self.state.write();
        if let Some(cached) = state.recents.get_mut(&snap.hash) {
            return cached.set_performance(address, performance);
        }

        let mut snap = snap;
        snap.set_performance(address, performance)?;
        state.recents.put(snap.hash, snap);
        Ok(())
    }

    /// Update the health flag on the live snapshot for the given chain
    /// position. Same caching behavior as [`Self::set_signer_performance`].
    pub fn set_signer_health(&self, snap: Snapshot, address: Address, healthy: bool) {
        let mut state = self.state.write();
        if let Some(cached) = state.recents.get_mut(&snap.hash) {
            if healthy {
                cached.mark_healthy(address);
            } else {
                cached.mark_unhealthy(address);
            }
            return;
        }

        let mut snap = snap;
        if healthy {
            snap.mark_healthy(address);
        } else {
            snap.mark_unhealthy(address);
        }
        state.recents.put(snap.hash, snap);
    }

    /// Extract the sealing address from a signed header, going through the
    /// signature cache.
    pub fn ecrecover(&self, header: &HeaderData) -> Result<Address, PoiError> {
        if let Some(cached) = self.state.write().signatures.get(&header.hash) {
            return Ok(*cached);
        }

        let address = self.recover_seal(header)?;
        self.state.write().signatures.put(header.hash, address);
        Ok(address)
    }

    /// Calculate the seal hash: the keccak of every sealed-over field, which
    /// is the header minus the trailing signature bytes of its extra-data.
    pub fn seal_hash(&self, header: &HeaderData) -> B256 {
        let unsigned_extra = header.extra.len().saturating_sub(EXTRA_SEAL);

        let mut preimage = Vec::with_capacity(96 + unsigned_extra);
        preimage.extend_from_slice(header.parent_hash.as_slice());
        preimage.extend_from_slice(&header.number.to_be_bytes());
        preimage.extend_from_slice(&header.time.to_be_bytes());
        preimage.extend_from_slice(header.coinbase.as_slice());
        preimage.extend_from_slice(&header.difficulty.to_be_bytes());
        preimage.extend_from_slice(&header.extra[..unsigned_extra]);

        keccak256(&preimage)
    }

    /// Recover the sealing address from the 65-byte signature suffix.
    fn recover_seal(&self, header: &HeaderData) -> Result<Address, PoiError> {
        let seal = header.signature()?;

        // Recovery ids arrive in both the raw 0/1 and the legacy 27/28 form
        let v = match seal[64] {
            legacy @ 27.. => legacy - 27,
            raw => raw,
        };
        let recovery_id = RecoveryId::try_from(v as i32).map_err(recovery_error)?;
        let signature =
            RecoverableSignature::from_compact(&seal[..64], recovery_id).map_err(recovery_error)?;

        let digest =
            Message::from_digest_slice(self.seal_hash(header).as_slice()).map_err(recovery_error)?;
        let pubkey = self
            .secp
            .recover_ecdsa(&digest, &signature)
            .map_err(recovery_error)?;

        Ok(pubkey_to_address(&pubkey))
    }

    /// Retrieve the authorization snapshot at a given point in the chain.
    ///
    /// Locates the nearest usable base (memory cache, persisted checkpoint,
    /// genesis, or a sufficiently deep epoch checkpoint), replays the headers
    /// collected on the way back, and caches the result.
    pub fn snapshot<C: ChainHeaderReader>(
        &self,
        chain: &C,
        number: u64,
        hash: B256,
        parents: Option<&[HeaderData]>,
    ) -> Result<Snapshot, PoiError> {
        let (base, pending) = self.find_base(chain, number, hash, parents)?;

        let snap = base.apply(&pending, |header| self.ecrecover(header))?;
        self.state.write().recents.put(snap.hash, snap.clone());

        if !pending.is_empty() && snap.number % CHECKPOINT_INTERVAL == 0 {
            self.db.store_snapshot(&snap)?;
            trace!(number = snap.number, hash = %snap.hash, "Stored voting snapshot to disk");
        }

        Ok(snap)
    }

    /// Walk backwards from the requested block, collecting unprocessed
    /// headers until a reusable base snapshot turns up. Returns the base and
    /// the pending headers in application (ascending) order.
    fn find_base<C: ChainHeaderReader>(
        &self,
        chain: &C,
        number: u64,
        hash: B256,
        parents: Option<&[HeaderData]>,
    ) -> Result<(Snapshot, Vec<HeaderData>), PoiError> {
        let mut pending: Vec<HeaderData> = Vec::new();
        let mut cursor_number = number;
        let mut cursor_hash = hash;

        let base = loop {
            if let Some(base) = self.lookup_base(cursor_number, cursor_hash) {
                break base;
            }

            // Genesis, and epoch checkpoints buried deeper than any plausible
            // reorg, seed a fresh snapshot from their own signer list
            let seedable = cursor_number == 0
                || (cursor_number % self.config.epoch == 0
                    && pending.len() > FULL_IMMUTABILITY_THRESHOLD);
            if seedable {
                if let Some(header) = chain.get_header_by_number(cursor_number) {
                    break self.checkpoint_base(&header)?;
                }
            }

            let header = read_header(chain, parents, cursor_hash, cursor_number)
                .ok_or(PoiError::UnknownAncestor)?;
            cursor_number = cursor_number.saturating_sub(1);
            cursor_hash = header.parent_hash;
            pending.push(header);
        };

        pending.reverse();
        Ok((base, pending))
    }

    /// Look for a reusable snapshot in the memory cache or, on checkpoint
    /// interval boundaries, in the database. Database misses and read
    /// failures both fall through to the header walk.
    fn lookup_base(&self, number: u64, hash: B256) -> Option<Snapshot> {
        if let Some(cached) = self.state.write().recents.get(&hash) {
            return Some(cached.clone());
        }

        if number % CHECKPOINT_INTERVAL != 0 {
            return None;
        }
        match self.db.load_snapshot(hash) {
            Ok(Some(mut stored)) => {
                trace!(number, hash = %hash, "Loaded voting snapshot from disk");
                stored.config = self.config;
                Some(stored)
            }
            _ => None,
        }
    }

    /// Seed a snapshot from the signer list carried in a checkpoint header
    /// and persist it.
    fn checkpoint_base(&self, header: &HeaderData) -> Result<Snapshot, PoiError> {
        let signers = header.checkpoint_signers()?;
        let snap = Snapshot::new(self.config, header.number, header.hash, signers);

        self.db.store_snapshot(&snap)?;
        trace!(number = snap.number, hash = %snap.hash, "Stored checkpoint snapshot to disk");
        Ok(snap)
    }

    /// Verify a header conforms to consensus rules.
    pub fn verify_header<C: ChainHeaderReader>(
        &self,
        chain: &C,
        header: &HeaderData,
        parents: Option<&[HeaderData]>,
    ) -> Result<(), PoiError> {
        self.check_header_shape(header)?;

        // Nothing cascades into the genesis block
        if header.number == 0 {
            return Ok(());
        }

        let parent = read_header(chain, parents, header.parent_hash, header.number - 1)
            .ok_or(PoiError::UnknownAncestor)?;
        if header.time < parent.time + self.config.period {
            return Err(PoiError::InvalidTimestamp {
                parent_time: parent.time,
                period: self.config.period,
                block_time: header.time,
            });
        }

        let snap = self.snapshot(chain, header.number - 1, header.parent_hash, parents)?;

        // Checkpoint headers must republish the authoritative signer list
        if header.number % self.config.epoch == 0
            && header.checkpoint_signers()? != snap.signers_list()
        {
            return Err(PoiError::MismatchingCheckpointSigners);
        }

        self.verify_seal(&snap, header)
    }

    /// Stateless shape checks: timestamp sanity, vote nonce, checkpoint
    /// rules, extra-data layout, difficulty domain.
    fn check_header_shape(&self, header: &HeaderData) -> Result<(), PoiError> {
        // Don't waste time checking blocks from the future
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        if header.time > now {
            return Err(PoiError::FutureBlock {
                block_time: header.time,
                current_time: now,
            });
        }

        if header.nonce != NONCE_AUTH_VOTE && header.nonce != NONCE_DROP_VOTE {
            return Err(PoiError::InvalidVote);
        }

        // Checkpoint blocks carry no beneficiary and no open vote
        let checkpoint = header.number % self.config.epoch == 0;
        if checkpoint {
            if header.coinbase != Address::ZERO {
                return Err(PoiError::InvalidCheckpointBeneficiary);
            }
            if header.nonce == NONCE_AUTH_VOTE {
                return Err(PoiError::InvalidCheckpointVote);
            }
        }

        // Extra-data is 32 vanity bytes, an optional signer section, and a
        // 65-byte seal
        if header.extra.len() < EXTRA_VANITY {
            return Err(PoiError::MissingVanity);
        }
        let Some(signer_section) = header.extra.len().checked_sub(EXTRA_VANITY + EXTRA_SEAL)
        else {
            return Err(PoiError::MissingSignature);
        };
        if checkpoint && signer_section % 20 != 0 {
            return Err(PoiError::InvalidCheckpointSigners);
        }
        if !checkpoint && signer_section != 0 {
            return Err(PoiError::ExtraSigners);
        }

        if header.number > 0 && !matches!(header.difficulty, DIFF_IN_TURN | DIFF_NO_TURN) {
            return Err(PoiError::InvalidDifficulty {
                difficulty: header.difficulty,
            });
        }

        Ok(())
    }

    /// Verify the seal (signature) of a header against a snapshot.
    fn verify_seal(&self, snap: &Snapshot, header: &HeaderData) -> Result<(), PoiError> {
        // Genesis block has no seal
        if header.number == 0 {
            return Err(PoiError::UnknownBlock);
        }

        let signer = self.ecrecover(header)?;
        if !snap.is_signer(&signer) {
            return Err(PoiError::UnauthorizedSigner { signer });
        }

        // Spam protection: one slot per signer inside the rolling window
        let window = (snap.signer_count() / 2 + 1) as u64;
        for (&recent_block, &recent_signer) in &snap.recents {
            if recent_signer == signer && recent_block > header.number.saturating_sub(window) {
                return Err(PoiError::RecentlySigned {
                    signer,
                    recent_block,
                });
            }
        }

        if self.fake_diff {
            return Ok(());
        }

        let expected = snap.calc_difficulty(header.number, signer);
        if header.difficulty != expected {
            return Err(PoiError::WrongDifficulty {
                signer,
                block: header.number,
                expected,
                actual: header.difficulty,
            });
        }

        Ok(())
    }

    /// Calculate difficulty for a new block sealed by the local signer.
    pub fn calc_difficulty<C: ChainHeaderReader>(
        &self,
        chain: &C,
        parent: &HeaderData,
    ) -> Result<u64, PoiError> {
        let signer = self.signer().ok_or(PoiError::UnauthorizedSigner {
            signer: Address::ZERO,
        })?;
        let snap = self.snapshot(chain, parent.number, parent.hash, None)?;

        Ok(snap.calc_difficulty(parent.number + 1, signer))
    }
}

/// Read a header from the caller-supplied batch when present, falling back
/// to the chain reader.
fn read_header<C: ChainHeaderReader>(
    chain: &C,
    parents: Option<&[HeaderData]>,
    hash: B256,
    number: u64,
) -> Option<HeaderData> {
    match parents {
        Some(parents) => parents
            .iter()
            .find(|header| header.hash == hash && header.number == number)
            .cloned(),
        None => chain.get_header(hash, number),
    }
}

fn recovery_error(err: impl fmt::Display) -> PoiError {
    PoiError::SignatureRecoveryFailed {
        message: err.to_string(),
    }
}

/// Keccak of the uncompressed key without its 0x04 tag, low 20 bytes.
fn pubkey_to_address(pubkey: &PublicKey) -> Address {
    let encoded = pubkey.serialize_uncompressed();
    let digest = keccak256(&encoded[1..]);
    Address::from_slice(&digest[12..])
}
