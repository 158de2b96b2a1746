//! Identifier minting and storage key layout

use super::error::StoreError;
use bech32::Bech32m;
use uuid7::uuid7;

/// Human readable part of document ids.
pub const DOCUMENT_HRP: &str = "doc_";

// construct a unique, time ordered id then encode using bech32m
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Prefix shared by every row that belongs to `owner`: the owner id followed
/// by a NUL. Owner ids are opaque, so an id holding NUL is refused rather
/// than allowed to reach into another owner's rows.
pub fn key_scope(owner: &str) -> Result<Vec<u8>, StoreError> {
    if owner.contains('\0') {
        return Err(StoreError::InvalidKey(owner.to_string()));
    }
    let mut key = Vec::with_capacity(owner.len() + 9);
    key.extend_from_slice(owner.as_bytes());
    key.push(0);
    Ok(key)
}

/// Owner scope plus a big endian suffix, so a prefix scan returns rows in
/// numeric order of the suffix.
pub fn scoped_key(owner: &str, suffix: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut key = key_scope(owner)?;
    key.extend_from_slice(suffix);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_ids_carry_prefix() {
        let id = new_uuid_to_bech32(DOCUMENT_HRP).unwrap();
        assert!(id.starts_with("doc_1"));
    }

    #[test]
    fn empty_hrp_fails() {
        assert!(new_uuid_to_bech32("").is_err());
    }

    #[test]
    fn owner_scope_does_not_cover_longer_ids() {
        let team = key_scope("team").unwrap();
        let lead = scoped_key("team/lead", &7u64.to_be_bytes()).unwrap();
        let teammate = scoped_key("teammate", &7u64.to_be_bytes()).unwrap();

        assert!(!lead.starts_with(&team));
        assert!(!teammate.starts_with(&team));
        assert!(scoped_key("team", &7u64.to_be_bytes()).unwrap().starts_with(&team));
    }

    #[test]
    fn suffix_order_is_numeric() {
        let keys: Vec<Vec<u8>> = [9u32, 10, 9_999, 10_000, 10_001]
            .iter()
            .map(|n| scoped_key("doc_1", &n.to_be_bytes()).unwrap())
            .collect();

        assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn nul_in_owner_is_refused() {
        assert!(matches!(
            key_scope("team\0lead"),
            Err(StoreError::InvalidKey(_))
        ));
    }
}
