//! PoI snapshot - authorization voting and signer scheduling state at a given
//! point in time.

use super::{
    PoiError, DIFF_IN_TURN, DIFF_NO_TURN, EXTRA_SEAL, EXTRA_VANITY,
    NONCE_AUTH_VOTE, NONCE_DROP_VOTE,
};
use alloy_primitives::{Address, Bytes, B256, B64};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    time::{Duration, Instant},
};
use tracing::info;

/// How often to report progress while replaying a long header batch.
const RECONSTRUCT_LOG_INTERVAL: Duration = Duration::from_secs(8);

/// PoI configuration parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoiConfig {
    /// Number of seconds between blocks to enforce.
    pub period: u64,
    /// Epoch length to reset votes and checkpoint.
    pub epoch: u64,
}

impl Default for PoiConfig {
    fn default() -> Self {
        Self {
            period: 15,
            epoch: 30000,
        }
    }
}

/// A single vote that an authorized signer made to modify the list of authorizations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// Authorized signer that cast this vote.
    pub signer: Address,
    /// Block number the vote was cast in.
    pub block: u64,
    /// Account being voted on to change its authorization.
    pub address: Address,
    /// Whether to authorize or deauthorize the voted account.
    pub authorize: bool,
}

/// Vote tally to keep the current score of votes.
///
/// Votes that go against the proposal aren't counted since it's equivalent to
/// not voting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tally {
    /// Whether the vote is about authorizing or kicking someone.
    pub authorize: bool,
    /// Number of votes wanting to pass the proposal.
    pub votes: usize,
}

/// Liveness status of a signer, as observed by the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignerHealth {
    /// The signer is responsive and eligible for rotation.
    #[default]
    Healthy,
    /// The signer is considered down and excluded from rotation.
    Unhealthy,
}

/// Snapshot is the state of the authorization voting at a given point in time.
///
/// The health and performance maps are operational hints maintained by the
/// local node. They drive the rotation schedule but are never persisted, so
/// cross-node agreement does not depend on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Consensus engine configuration.
    #[serde(skip)]
    pub config: PoiConfig,

    /// Block number where the snapshot was created.
    pub number: u64,

    /// Block hash where the snapshot was created.
    pub hash: B256,

    /// Set of authorized signers at this moment.
    pub signers: BTreeSet<Address>,

    /// Set of recent signers for spam protection (block number -> signer).
    pub recents: BTreeMap<u64, Address>,

    /// List of votes cast in chronological order.
    pub votes: Vec<Vote>,

    /// Current vote tally to avoid recalculating.
    pub tally: BTreeMap<Address, Tally>,

    /// Health status of each signer.
    #[serde(skip)]
    pub health: BTreeMap<Address, SignerHealth>,

    /// Performance metric of each signer.
    #[serde(skip)]
    pub performance: BTreeMap<Address, i64>,
}

impl Snapshot {
    /// Create a new snapshot with the specified startup parameters.
    ///
    /// This method does not initialize the set of recent signers,
    /// so only use it for the genesis block.
    pub fn new(
        config: PoiConfig,
        number: u64,
        hash: B256,
        signers: Vec<Address>,
    ) -> Self {
        let mut snap = Self {
            config,
            number,
            hash,
            signers: signers.into_iter().collect(),
            recents: BTreeMap::new(),
            votes: Vec::new(),
            tally: BTreeMap::new(),
            health: BTreeMap::new(),
            performance: BTreeMap::new(),
        };
        snap.init_signer_metrics();
        snap
    }

    /// Decode a snapshot from its persisted form.
    ///
    /// Health and performance are not part of the persisted form; every signer
    /// comes back `Healthy` with a zero performance score.
    pub fn decode(config: PoiConfig, blob: &[u8]) -> Result<Self, PoiError> {
        let mut snap: Snapshot = serde_json::from_slice(blob)?;
        snap.config = config;
        snap.init_signer_metrics();
        Ok(snap)
    }

    /// Encode the snapshot into its canonical persisted form.
    ///
    /// Maps are keyed by hex address and iterate in byte order, so the output
    /// is stable across nodes.
    pub fn encode(&self) -> Result<Vec<u8>, PoiError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Reset health and performance tracking to defaults for every signer.
    fn init_signer_metrics(&mut self) {
        self.health = self
            .signers
            .iter()
            .map(|signer| (*signer, SignerHealth::Healthy))
            .collect();
        self.performance = self.signers.iter().map(|signer| (*signer, 0)).collect();
    }

    /// Create a deep copy of the snapshot.
    pub fn copy(&self) -> Self {
        Self {
            config: self.config,
            number: self.number,
            hash: self.hash,
            signers: self.signers.clone(),
            recents: self.recents.clone(),
            votes: self.votes.clone(),
            tally: self.tally.clone(),
            health: self.health.clone(),
            performance: self.performance.clone(),
        }
    }

    /// Get the list of authorized signers in ascending order.
    pub fn signers_list(&self) -> Vec<Address> {
        self.signers.iter().copied().collect()
    }

    /// Check if an address is an authorized signer.
    pub fn is_signer(&self, address: &Address) -> bool {
        self.signers.contains(address)
    }

    /// Get the number of signers.
    pub fn signer_count(&self) -> usize {
        self.signers.len()
    }

    /// Check if a signer at a given block height is in-turn.
    ///
    /// Rotation runs over the active (healthy) signer pool, ordered by
    /// performance and address.
    pub fn inturn(&self, number: u64, signer: Address) -> bool {
        let signers = self.active_signers();
        if signers.is_empty() {
            return false;
        }

        let offset = signers
            .iter()
            .position(|s| *s == signer)
            .unwrap_or(signers.len());
        (number % signers.len() as u64) == offset as u64
    }

    /// Calculate the expected difficulty for a signer at a given block.
    pub fn calc_difficulty(&self, number: u64, signer: Address) -> u64 {
        if self.inturn(number, signer) {
            DIFF_IN_TURN
        } else {
            DIFF_NO_TURN
        }
    }

    /// Mark a signer as healthy. No-op for unknown signers.
    pub fn mark_healthy(&mut self, signer: Address) {
        if self.signers.contains(&signer) {
            self.health.insert(signer, SignerHealth::Healthy);
        }
    }

    /// Mark a signer as unhealthy, excluding it from rotation. No-op for
    /// unknown signers.
    pub fn mark_unhealthy(&mut self, signer: Address) {
        if self.signers.contains(&signer) {
            self.health.insert(signer, SignerHealth::Unhealthy);
        }
    }

    /// Check if a signer is healthy.
    pub fn is_healthy(&self, signer: Address) -> bool {
        matches!(self.health.get(&signer), Some(SignerHealth::Healthy))
    }

    /// Set the performance metric for a signer.
    pub fn set_performance(&mut self, signer: Address, performance: i64) -> Result<(), PoiError> {
        if !self.signers.contains(&signer) {
            return Err(PoiError::UnauthorizedSigner { signer });
        }
        if performance < 0 {
            return Err(PoiError::InvalidPerformance { performance });
        }
        self.performance.insert(signer, performance);
        Ok(())
    }

    /// Get the performance metric for a signer. Unknown signers score zero.
    pub fn get_performance(&self, signer: Address) -> i64 {
        self.performance.get(&signer).copied().unwrap_or_default()
    }

    /// Get the healthy signers ordered by performance (descending), then by
    /// address (ascending).
    pub fn active_signers(&self) -> Vec<Address> {
        let mut ranked: Vec<(Address, i64)> = self
            .signers
            .iter()
            .filter(|signer| self.is_healthy(**signer))
            .map(|signer| (*signer, self.get_performance(*signer)))
            .collect();

        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        ranked.into_iter().map(|(signer, _)| signer).collect()
    }

    /// Get the backup signer taking over when the in-turn signer is
    /// unavailable.
    ///
    /// Returns the active signer following the in-turn one, or the head of the
    /// active pool when the in-turn signer is itself unhealthy or unknown.
    /// `None` if no signer is active.
    pub fn backup_signer(&self, _number: u64, in_turn: Address) -> Option<Address> {
        let active = self.active_signers();
        if active.is_empty() {
            return None;
        }

        match active.iter().position(|signer| *signer == in_turn) {
            Some(index) => Some(active[(index + 1) % active.len()]),
            None => Some(active[0]),
        }
    }

    /// Check if it makes sense to cast the specified vote.
    pub fn valid_vote(&self, address: &Address, authorize: bool) -> bool {
        let is_signer = self.signers.contains(address);
        // Can only authorize non-signers or deauthorize signers
        (is_signer && !authorize) || (!is_signer && authorize)
    }

    /// Add a new vote into the tally.
    ///
    /// Returns true if the vote was counted.
    pub fn cast(&mut self, address: Address, authorize: bool) -> bool {
        if !self.valid_vote(&address, authorize) {
            return false;
        }

        let tally = self.tally.entry(address).or_insert(Tally {
            authorize,
            votes: 0,
        });
        tally.votes += 1;
        true
    }

    /// Remove a previously cast vote from the tally.
    ///
    /// Returns true if the vote was removed.
    pub fn uncast(&mut self, address: Address, authorize: bool) -> bool {
        let Some(tally) = self.tally.get_mut(&address) else {
            return false;
        };

        // Ensure we only revert counted votes
        if tally.authorize != authorize {
            return false;
        }

        if tally.votes > 1 {
            tally.votes -= 1;
        } else {
            self.tally.remove(&address);
        }
        true
    }

    /// Apply a list of headers to create a new snapshot.
    ///
    /// The headers must be contiguous and start right after the snapshot's
    /// block. The `recover_signer` function is used to extract the signer from
    /// each header. Any failure discards the whole batch; the receiver is
    /// never mutated.
    pub fn apply<F>(
        &self,
        headers: &[HeaderData],
        recover_signer: F,
    ) -> Result<Snapshot, PoiError>
    where
        F: Fn(&HeaderData) -> Result<Address, PoiError>,
    {
        if headers.is_empty() {
            return Ok(self.clone());
        }

        // Sanity check that headers can be applied
        for i in 0..headers.len() - 1 {
            if headers[i + 1].number != headers[i].number + 1 {
                return Err(PoiError::InvalidVotingChain);
            }
        }

        if headers[0].number != self.number + 1 {
            return Err(PoiError::InvalidVotingChain);
        }

        let mut snap = self.copy();

        let start = Instant::now();
        let mut logged = Instant::now();

        for (processed, header) in headers.iter().enumerate() {
            let number = header.number;

            // Remove any votes on checkpoint blocks
            if number % self.config.epoch == 0 {
                snap.votes.clear();
                snap.tally.clear();
            }

            // Delete the oldest signer from the recent list to allow it signing again
            let limit = (snap.signers.len() / 2 + 1) as u64;
            if number >= limit {
                snap.recents.remove(&(number - limit));
            }

            // Resolve the authorization key and check against signers
            let signer = recover_signer(header)?;

            if !snap.signers.contains(&signer) {
                return Err(PoiError::UnauthorizedSigner { signer });
            }

            // Check if signer recently signed
            for (&recent_block, &recent_signer) in &snap.recents {
                if recent_signer == signer {
                    return Err(PoiError::RecentlySigned {
                        signer,
                        recent_block,
                    });
                }
            }

            snap.recents.insert(number, signer);

            // Header authorized, discard any previous vote from the signer on
            // this account (one open vote per signer and subject)
            if let Some(index) = snap
                .votes
                .iter()
                .position(|vote| vote.signer == signer && vote.address == header.coinbase)
            {
                let vote = snap.votes.remove(index);
                snap.uncast(vote.address, vote.authorize);
            }

            // Tally up the new vote from the signer
            let authorize = if header.nonce == NONCE_AUTH_VOTE {
                true
            } else if header.nonce == NONCE_DROP_VOTE {
                false
            } else {
                return Err(PoiError::InvalidVote);
            };

            if snap.cast(header.coinbase, authorize) {
                snap.votes.push(Vote {
                    signer,
                    block: number,
                    address: header.coinbase,
                    authorize,
                });
            }

            // If the vote passed, update the list of signers
            if let Some(&tally) = snap.tally.get(&header.coinbase) {
                if tally.votes > snap.signers.len() / 2 {
                    if tally.authorize {
                        snap.signers.insert(header.coinbase);
                        snap.health.insert(header.coinbase, SignerHealth::Healthy);
                        snap.performance.insert(header.coinbase, 0);
                    } else {
                        snap.signers.remove(&header.coinbase);
                        snap.health.remove(&header.coinbase);
                        snap.performance.remove(&header.coinbase);

                        // Signer list shrunk, delete any leftover recent caches
                        let limit = (snap.signers.len() / 2 + 1) as u64;
                        if number >= limit {
                            snap.recents.remove(&(number - limit));
                        }

                        // Discard any previous votes the deauthorized signer cast
                        let mut index = 0;
                        while index < snap.votes.len() {
                            if snap.votes[index].signer == header.coinbase {
                                let vote = snap.votes.remove(index);
                                snap.uncast(vote.address, vote.authorize);
                            } else {
                                index += 1;
                            }
                        }
                    }

                    // Discard any previous votes around the just changed account
                    snap.votes.retain(|vote| vote.address != header.coinbase);
                    snap.tally.remove(&header.coinbase);
                }
            }

            // If we're taking too much time (ecrecover), notify the user once a while
            if logged.elapsed() >= RECONSTRUCT_LOG_INTERVAL {
                info!(
                    processed,
                    total = headers.len(),
                    elapsed = ?start.elapsed(),
                    "Reconstructing voting history"
                );
                logged = Instant::now();
            }
        }
        if start.elapsed() >= RECONSTRUCT_LOG_INTERVAL {
            info!(
                processed = headers.len(),
                elapsed = ?start.elapsed(),
                "Reconstructed voting history"
            );
        }

        snap.number += headers.len() as u64;
        snap.hash = headers.last().unwrap().hash;

        Ok(snap)
    }
}

/// Minimal header data needed for snapshot processing.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct HeaderData {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub coinbase: Address,
    pub nonce: B64,
    pub extra: Bytes,
    pub time: u64,
    pub difficulty: u64,
}

impl HeaderData {
    /// Extract signers from checkpoint block extra-data.
    pub fn checkpoint_signers(&self) -> Result<Vec<Address>, PoiError> {
        if self.extra.len() < EXTRA_VANITY + EXTRA_SEAL {
            return Err(PoiError::MissingSignature);
        }

        let signers_bytes = &self.extra[EXTRA_VANITY..self.extra.len() - EXTRA_SEAL];
        if signers_bytes.len() % 20 != 0 {
            return Err(PoiError::InvalidCheckpointSigners);
        }

        let signers: Vec<Address> = signers_bytes
            .chunks(20)
            .map(Address::from_slice)
            .collect();

        Ok(signers)
    }

    /// Get the signature from extra-data.
    pub fn signature(&self) -> Result<&[u8], PoiError> {
        if self.extra.len() < EXTRA_SEAL {
            return Err(PoiError::MissingSignature);
        }
        Ok(&self.extra[self.extra.len() - EXTRA_SEAL..])
    }
}
