//! Hard-coded mainnet genesis header, used as the checkpoint anchor and to
//! seed the in-memory chain store's root chain.

use super::*;

pub(crate) fn header() -> block::Header {
    block::Header {
        version: block::Version::ONE,
        prev_blockhash: bitcoin::BlockHash::all_zeros(),
        merkle_root: "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33"
            .parse()
            .expect("hardcoded genesis merkle root is valid"),
        time: 1_231_006_505,
        bits: bitcoin::CompactTarget::from_consensus(0x1d00ffff),
        nonce: 2_083_236_893,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_hash_matches_mainnet() {
        let hash = header().block_hash();
        assert_eq!(
            hash.to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26"
        );
    }
}
