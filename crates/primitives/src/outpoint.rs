use std::fmt;

use zocd_consensus::{hash256_to_hex, Hash256};

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};

/// Identity of the collateral-locking transaction output. Equality is
/// bytewise; ordering is lexicographic over `(txid, index)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OutPoint {
    pub txid: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }

    /// The all-zero sentinel used by full-list DSEG requests.
    pub fn null() -> Self {
        Self {
            txid: [0u8; 32],
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::null()
    }

    /// Abbreviated form for log lines.
    pub fn to_string_short(&self) -> String {
        let hex = hash256_to_hex(&self.txid);
        format!("{}-{}", &hex[..16], self.index)
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", hash256_to_hex(&self.txid), self.index)
    }
}

impl Encodable for OutPoint {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.txid);
        encoder.write_u32_le(self.index);
    }
}

impl Decodable for OutPoint {
    fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let txid = decoder.read_hash()?;
        let index = decoder.read_u32_le()?;
        Ok(Self { txid, index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_is_txid_then_index() {
        let low = OutPoint::new([0x01; 32], 9);
        let high = OutPoint::new([0x02; 32], 0);
        assert!(low < high);
        assert!(OutPoint::new([0x01; 32], 0) < low);
    }

    #[test]
    fn null_round_trips() {
        let bytes = OutPoint::null().encode_to_vec();
        let decoded = OutPoint::decode_all(&bytes).expect("decode");
        assert!(decoded.is_null());
    }
}
