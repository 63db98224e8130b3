//! User-facing API backing the `poi_*` RPC namespace.
//!
//! The methods here are transport-agnostic: a JSON-RPC server wraps them and
//! handles marshalling. Response types derive `Serialize` with the wire field
//! names.

use super::{
    database::SnapshotDatabase,
    error::PoiError,
    poi::{ChainHeaderReader, Poi},
    snapshot::{HeaderData, Snapshot},
    DIFF_IN_TURN,
};
use alloy_primitives::{Address, Bytes, B256};
use alloy_rlp::Decodable;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};

/// Number of trailing blocks inspected by [`PoiApi::status`].
const STATUS_BLOCKS: u64 = 64;

/// Sealing statistics over the trailing block window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoiStatus {
    /// Percentage of blocks in the window sealed in-turn.
    pub inturn_percent: f64,
    /// Number of blocks each signer sealed in the window.
    pub sealer_activity: HashMap<Address, u64>,
    /// Size of the inspected window. Zero when the chain is too short to
    /// report anything.
    pub num_blocks: u64,
}

/// Locator for [`PoiApi::get_signer`]: a chain position or a raw header blob.
#[derive(Debug, Clone)]
pub enum SignerQuery {
    /// The current chain head.
    Latest,
    /// A block number.
    Number(u64),
    /// A block hash.
    Hash(B256),
    /// An RLP-encoded header.
    Rlp(Bytes),
}

/// API to control the signer voting and scheduling mechanisms of the
/// proof-of-authority scheme.
pub struct PoiApi<C, DB: SnapshotDatabase> {
    chain: Arc<C>,
    poi: Arc<Poi<DB>>,
}

impl<C: ChainHeaderReader, DB: SnapshotDatabase> PoiApi<C, DB> {
    /// Create a new API handle.
    pub fn new(chain: Arc<C>, poi: Arc<Poi<DB>>) -> Self {
        Self { chain, poi }
    }

    fn header_by_number(&self, number: Option<u64>) -> Result<HeaderData, PoiError> {
        let header = match number {
            Some(number) => self.chain.get_header_by_number(number),
            None => self.chain.current_header(),
        };
        header.ok_or(PoiError::UnknownBlock)
    }

    /// Retrieve the state snapshot at a given block, or at the current head.
    pub fn get_snapshot(&self, number: Option<u64>) -> Result<Snapshot, PoiError> {
        let header = self.header_by_number(number)?;
        self.poi
            .snapshot(self.chain.as_ref(), header.number, header.hash, None)
    }

    /// Retrieve the state snapshot at a given block hash.
    pub fn get_snapshot_at_hash(&self, hash: B256) -> Result<Snapshot, PoiError> {
        let header = self
            .chain
            .get_header_by_hash(hash)
            .ok_or(PoiError::UnknownBlock)?;
        self.poi
            .snapshot(self.chain.as_ref(), header.number, header.hash, None)
    }

    /// Retrieve the list of authorized signers at the specified block.
    pub fn get_signers(&self, number: Option<u64>) -> Result<Vec<Address>, PoiError> {
        Ok(self.get_snapshot(number)?.signers_list())
    }

    /// Retrieve the list of authorized signers at the specified block hash.
    pub fn get_signers_at_hash(&self, hash: B256) -> Result<Vec<Address>, PoiError> {
        Ok(self.get_snapshot_at_hash(hash)?.signers_list())
    }

    /// Get the proposals the node tries to uphold and vote on.
    pub fn proposals(&self) -> HashMap<Address, bool> {
        self.poi.proposals()
    }

    /// Inject a new authorization proposal that the signer will attempt to
    /// push through.
    pub fn propose(&self, address: Address, authorize: bool) {
        self.poi.propose(address, authorize);
    }

    /// Drop a currently running proposal, stopping the signer from casting
    /// further votes (either for or against).
    pub fn discard(&self, address: Address) {
        self.poi.discard(address);
    }

    /// Report sealing statistics over the trailing blocks:
    /// the percentage of in-turn blocks and each signer's seal count.
    pub fn status(&self) -> Result<PoiStatus, PoiError> {
        let header = self.chain.current_header().ok_or(PoiError::UnknownBlock)?;
        let snap = self
            .poi
            .snapshot(self.chain.as_ref(), header.number, header.hash, None)?;

        let end = header.number;
        let mut num_blocks = STATUS_BLOCKS;
        let mut start = end.saturating_sub(num_blocks);
        if num_blocks > end {
            start = 1;
            num_blocks = end.saturating_sub(start);
        }

        let mut sealer_activity: HashMap<Address, u64> = snap
            .signers_list()
            .into_iter()
            .map(|signer| (signer, 0))
            .collect();

        // Too few blocks behind the head to measure anything
        if num_blocks == 0 {
            return Ok(PoiStatus {
                inturn_percent: 0.0,
                sealer_activity,
                num_blocks: 0,
            });
        }

        let mut optimals = 0u64;
        for number in start..end {
            let header = self
                .chain
                .get_header_by_number(number)
                .ok_or(PoiError::UnknownBlock)?;
            if header.difficulty == DIFF_IN_TURN {
                optimals += 1;
            }
            let sealer = self.poi.ecrecover(&header)?;
            *sealer_activity.entry(sealer).or_default() += 1;
        }

        Ok(PoiStatus {
            inturn_percent: (100 * optimals) as f64 / num_blocks as f64,
            sealer_activity,
            num_blocks,
        })
    }

    /// Get the sealing address of a specific block.
    ///
    /// The block is located by number, hash, head position, or supplied
    /// directly as an RLP-encoded header.
    pub fn get_signer(&self, query: SignerQuery) -> Result<Address, PoiError> {
        let header = match query {
            SignerQuery::Latest => self.chain.current_header().ok_or(PoiError::UnknownBlock)?,
            SignerQuery::Number(number) => self
                .chain
                .get_header_by_number(number)
                .ok_or(PoiError::UnknownBlock)?,
            SignerQuery::Hash(hash) => self
                .chain
                .get_header_by_hash(hash)
                .ok_or(PoiError::UnknownBlock)?,
            SignerQuery::Rlp(blob) => {
                HeaderData::decode(&mut blob.as_ref()).map_err(|err| PoiError::DecodeError {
                    message: err.to_string(),
                })?
            }
        };
        self.poi.ecrecover(&header)
    }

    /// Set the performance metric for a signer on the live head snapshot.
    pub fn set_signer_performance(
        &self,
        address: Address,
        performance: i64,
    ) -> Result<(), PoiError> {
        let header = self.chain.current_header().ok_or(PoiError::UnknownBlock)?;
        let snap = self
            .poi
            .snapshot(self.chain.as_ref(), header.number, header.hash, None)?;
        self.poi.set_signer_performance(snap, address, performance)
    }

    /// Set the health flag for a signer on the live head snapshot.
    pub fn set_signer_health(&self, address: Address, healthy: bool) -> Result<(), PoiError> {
        let header = self.chain.current_header().ok_or(PoiError::UnknownBlock)?;
        let snap = self
            .poi
            .snapshot(self.chain.as_ref(), header.number, header.hash, None)?;
        self.poi.set_signer_health(snap, address, healthy);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemorySnapshotDatabase;
    use crate::snapshot::PoiConfig;
    use crate::testutil::{genesis_header, sealed_header, MockChain, TestSigner};
    use crate::{DIFF_NO_TURN, NONCE_AUTH_VOTE, NONCE_DROP_VOTE};
    use alloy_rlp::Encodable;

    fn test_config() -> PoiConfig {
        PoiConfig {
            period: 15,
            epoch: 30000,
        }
    }

    fn test_keys(count: usize) -> Vec<TestSigner> {
        let mut keys: Vec<TestSigner> = (1..=count as u8).map(TestSigner::new).collect();
        keys.sort_by_key(|key| key.address);
        keys
    }

    /// Engine, API, and a chain of `blocks` sealed blocks rotating through
    /// the signers, alternating in-turn and out-of-turn difficulty claims.
    fn test_api(
        keys: &[TestSigner],
        blocks: u64,
    ) -> (Arc<Poi<MemorySnapshotDatabase>>, PoiApi<MockChain, MemorySnapshotDatabase>) {
        let engine = Arc::new(Poi::new(test_config(), MemorySnapshotDatabase::new_arc()));

        let mut headers = vec![genesis_header(keys)];
        for number in 1..=blocks {
            let sealer = &keys[(number as usize - 1) % keys.len()];
            let difficulty = if number % 2 == 1 { DIFF_IN_TURN } else { DIFF_NO_TURN };
            let parent = headers.last().unwrap().clone();
            let header = sealed_header(
                &engine,
                sealer,
                number,
                &parent,
                Address::ZERO,
                NONCE_DROP_VOTE,
                difficulty,
            );
            headers.push(header);
        }

        let chain = Arc::new(MockChain::new(headers));
        let api = PoiApi::new(chain, Arc::clone(&engine));
        (engine, api)
    }

    #[test]
    fn test_get_signers_sorted() {
        let keys = test_keys(3);
        let (_, api) = test_api(&keys, 0);

        let signers = api.get_signers(None).unwrap();
        assert_eq!(
            signers,
            keys.iter().map(|key| key.address).collect::<Vec<_>>()
        );

        let genesis = api.get_snapshot(Some(0)).unwrap();
        assert_eq!(api.get_signers_at_hash(genesis.hash).unwrap(), signers);
    }

    #[test]
    fn test_get_snapshot_unknown_block() {
        let keys = test_keys(3);
        let (_, api) = test_api(&keys, 0);

        assert_eq!(api.get_snapshot(Some(42)), Err(PoiError::UnknownBlock));
        assert_eq!(
            api.get_snapshot_at_hash(B256::repeat_byte(0xdd)),
            Err(PoiError::UnknownBlock)
        );
    }

    #[test]
    fn test_proposal_lifecycle() {
        let keys = test_keys(3);
        let (_, api) = test_api(&keys, 0);

        let candidate = Address::repeat_byte(0x99);
        api.propose(candidate, true);
        assert_eq!(api.proposals().get(&candidate), Some(&true));

        api.discard(candidate);
        assert!(api.proposals().is_empty());
    }

    #[test]
    fn test_status_empty_window() {
        let keys = test_keys(3);
        let (_, api) = test_api(&keys, 0);

        // Head is the genesis block; there is no window to report on
        let status = api.status().unwrap();
        assert_eq!(status.num_blocks, 0);
        assert_eq!(status.inturn_percent, 0.0);
        assert!(status.sealer_activity.values().all(|count| *count == 0));
    }

    #[test]
    fn test_status_short_chain_clamps_window() {
        let keys = test_keys(3);
        let (_, api) = test_api(&keys, 4);

        // Window is [1, 4): three blocks, two of them claimed in-turn
        let status = api.status().unwrap();
        assert_eq!(status.num_blocks, 3);
        assert!((status.inturn_percent - 200.0 / 3.0).abs() < 1e-9);

        let total: u64 = status.sealer_activity.values().sum();
        assert_eq!(total, 3);
        assert_eq!(status.sealer_activity[&keys[0].address], 1);
        assert_eq!(status.sealer_activity[&keys[1].address], 1);
        assert_eq!(status.sealer_activity[&keys[2].address], 1);
    }

    #[test]
    fn test_get_signer_by_locator() {
        let keys = test_keys(3);
        let (_, api) = test_api(&keys, 2);

        assert_eq!(
            api.get_signer(SignerQuery::Number(1)).unwrap(),
            keys[0].address
        );
        assert_eq!(
            api.get_signer(SignerQuery::Latest).unwrap(),
            keys[1].address
        );

        let head = api.get_snapshot(None).unwrap();
        assert_eq!(
            api.get_signer(SignerQuery::Hash(head.hash)).unwrap(),
            keys[1].address
        );
    }

    #[test]
    fn test_get_signer_from_rlp_blob() {
        let keys = test_keys(3);
        let (engine, api) = test_api(&keys, 0);

        let genesis = genesis_header(&keys);
        let header = sealed_header(
            &engine,
            &keys[2],
            1,
            &genesis,
            Address::ZERO,
            NONCE_DROP_VOTE,
            DIFF_NO_TURN,
        );

        let mut blob = Vec::new();
        header.encode(&mut blob);

        assert_eq!(
            api.get_signer(SignerQuery::Rlp(blob.into())).unwrap(),
            keys[2].address
        );

        // Garbage blobs surface as decode errors
        assert!(matches!(
            api.get_signer(SignerQuery::Rlp(Bytes::from_static(b"junk"))),
            Err(PoiError::DecodeError { .. })
        ));
    }

    #[test]
    fn test_set_signer_performance_via_api() {
        let keys = test_keys(3);
        let (_, api) = test_api(&keys, 0);

        api.set_signer_performance(keys[2].address, 500).unwrap();

        let snap = api.get_snapshot(None).unwrap();
        assert_eq!(snap.get_performance(keys[2].address), 500);
        assert_eq!(snap.active_signers()[0], keys[2].address);

        assert_eq!(
            api.set_signer_performance(keys[2].address, -1),
            Err(PoiError::InvalidPerformance { performance: -1 })
        );
    }

    #[test]
    fn test_set_signer_health_via_api() {
        let keys = test_keys(3);
        let (_, api) = test_api(&keys, 0);

        api.set_signer_health(keys[0].address, false).unwrap();

        let snap = api.get_snapshot(None).unwrap();
        assert!(!snap.is_healthy(keys[0].address));
        assert_eq!(snap.active_signers().len(), 2);
    }

    #[test]
    fn test_vote_admission_visible_through_api() {
        let keys = test_keys(3);
        let engine = Arc::new(Poi::new(test_config(), MemorySnapshotDatabase::new_arc()));

        let candidate = Address::repeat_byte(0x99);
        let genesis = genesis_header(&keys);
        let first = sealed_header(
            &engine,
            &keys[0],
            1,
            &genesis,
            candidate,
            NONCE_AUTH_VOTE,
            DIFF_NO_TURN,
        );
        let second = sealed_header(
            &engine,
            &keys[1],
            2,
            &first,
            candidate,
            NONCE_AUTH_VOTE,
            DIFF_NO_TURN,
        );

        let chain = Arc::new(MockChain::new(vec![genesis, first, second]));
        let api = PoiApi::new(chain, engine);

        let signers = api.get_signers(None).unwrap();
        assert!(signers.contains(&candidate));
        assert_eq!(signers.len(), 4);
    }
}
