//! Shared helpers for engine and API tests: deterministic signing keys,
//! header sealing against the engine's seal hash, and an in-memory chain
//! reader.

use crate::database::SnapshotDatabase;
use crate::poi::{ChainHeaderReader, Poi};
use crate::snapshot::HeaderData;
use crate::{DIFF_NO_TURN, EXTRA_SEAL, EXTRA_VANITY, NONCE_DROP_VOTE};
use alloy_primitives::{keccak256, Address, Bytes, B256, B64};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

/// A signing identity with a deterministic key.
pub(crate) struct TestSigner {
    pub secret: SecretKey,
    pub address: Address,
}

impl TestSigner {
    /// Derive a signer from a non-zero seed byte.
    pub(crate) fn new(seed: u8) -> Self {
        let secret = SecretKey::from_slice(&[seed; 32]).unwrap();
        let secp = Secp256k1::new();
        let public = PublicKey::from_secret_key(&secp, &secret);
        let encoded = public.serialize_uncompressed();
        let digest = keccak256(&encoded[1..]);
        Self {
            secret,
            address: Address::from_slice(&digest[12..]),
        }
    }
}

/// Plain addresses in ascending byte order, for tests that never touch
/// signature recovery.
pub(crate) fn test_signers(count: usize) -> Vec<Address> {
    (1..=count as u8)
        .map(|index| Address::repeat_byte(index * 0x11))
        .collect()
}

/// Stand-in block hash. Unique as long as two headers differ anywhere the
/// vote machinery looks.
fn pseudo_hash(header: &HeaderData) -> B256 {
    let mut data = Vec::new();
    data.extend_from_slice(header.parent_hash.as_slice());
    data.extend_from_slice(&header.number.to_be_bytes());
    data.extend_from_slice(header.coinbase.as_slice());
    data.extend_from_slice(header.nonce.as_slice());
    data.extend_from_slice(&header.extra);
    keccak256(&data)
}

/// An unsealed header for tests that drive `apply` with a stub recoverer.
pub(crate) fn plain_header(
    number: u64,
    parent_hash: B256,
    coinbase: Address,
    nonce: B64,
) -> HeaderData {
    let mut header = HeaderData {
        number,
        hash: B256::ZERO,
        parent_hash,
        coinbase,
        nonce,
        extra: Bytes::new(),
        time: number * 15,
        difficulty: DIFF_NO_TURN,
    };
    header.hash = pseudo_hash(&header);
    header
}

/// The genesis header, carrying the signer list in its extra-data.
pub(crate) fn genesis_header(keys: &[TestSigner]) -> HeaderData {
    let mut extra = vec![0u8; EXTRA_VANITY];
    for key in keys {
        extra.extend_from_slice(key.address.as_slice());
    }
    extra.extend_from_slice(&[0u8; EXTRA_SEAL]);

    let mut header = HeaderData {
        number: 0,
        hash: B256::ZERO,
        parent_hash: B256::ZERO,
        coinbase: Address::ZERO,
        nonce: NONCE_DROP_VOTE,
        extra: extra.into(),
        time: 0,
        difficulty: 0,
    };
    header.hash = pseudo_hash(&header);
    header
}

/// Build and seal a header so the engine's `ecrecover` yields the signer.
pub(crate) fn sealed_header<DB: SnapshotDatabase>(
    engine: &Poi<DB>,
    signer: &TestSigner,
    number: u64,
    parent: &HeaderData,
    coinbase: Address,
    nonce: B64,
    difficulty: u64,
) -> HeaderData {
    let mut header = HeaderData {
        number,
        hash: B256::ZERO,
        parent_hash: parent.hash,
        coinbase,
        nonce,
        extra: vec![0u8; EXTRA_VANITY + EXTRA_SEAL].into(),
        time: parent.time + engine.config().period,
        difficulty,
    };

    let seal_hash = engine.seal_hash(&header);
    let secp = Secp256k1::new();
    let message = Message::from_digest_slice(seal_hash.as_slice()).unwrap();
    let signature = secp.sign_ecdsa_recoverable(&message, &signer.secret);
    let (recovery_id, compact) = signature.serialize_compact();

    let mut extra = header.extra.to_vec();
    let offset = extra.len() - EXTRA_SEAL;
    extra[offset..offset + 64].copy_from_slice(&compact);
    extra[offset + 64] = i32::from(recovery_id) as u8;
    header.extra = extra.into();

    header.hash = pseudo_hash(&header);
    header
}

/// In-memory chain reader over a fixed set of headers.
pub(crate) struct MockChain {
    headers: Vec<HeaderData>,
}

impl MockChain {
    pub(crate) fn new(headers: Vec<HeaderData>) -> Self {
        Self { headers }
    }
}

impl ChainHeaderReader for MockChain {
    fn current_header(&self) -> Option<HeaderData> {
        self.headers.iter().max_by_key(|header| header.number).cloned()
    }

    fn get_header(&self, hash: B256, number: u64) -> Option<HeaderData> {
        self.headers
            .iter()
            .find(|header| header.hash == hash && header.number == number)
            .cloned()
    }

    fn get_header_by_number(&self, number: u64) -> Option<HeaderData> {
        self.headers
            .iter()
            .find(|header| header.number == number)
            .cloned()
    }

    fn get_header_by_hash(&self, hash: B256) -> Option<HeaderData> {
        self.headers
            .iter()
            .find(|header| header.hash == hash)
            .cloned()
    }
}
