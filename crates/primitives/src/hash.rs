use sha2::{Digest, Sha256};
use zocd_consensus::Hash256;

pub fn sha256(data: &[u8]) -> Hash256 {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

#[cfg(test)]
mod tests {
    use super::{sha256, sha256d};

    #[test]
    fn double_hash_differs_from_single() {
        let data = b"zocd";
        assert_ne!(sha256(data), sha256d(data));
        assert_eq!(sha256d(data), sha256(&sha256(data)));
    }
}
