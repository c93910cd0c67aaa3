use serde::Serialize;
use std::fmt;

/// Rows with this public key mark an account that exists on chain but holds
/// no keys, so the sweeper never re-queries it. Real public keys are 128 or
/// 192 hex characters, so the literal cannot collide with one.
pub const BLANK_PUBLIC_KEY: &str = "blank";

/// 8-byte on-chain account identifier.
///
/// The canonical text form is `0x` followed by exactly 16 lowercase hex
/// characters; leading zeros are significant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address([u8; 8]);

impl Address {
    pub fn from_index(index: u64) -> Self {
        Address(index.to_be_bytes())
    }

    /// Parses with or without `0x`, left-padding short hex to 16 digits.
    pub fn parse(s: &str) -> Option<Self> {
        let stripped = strip_0x_prefix(s);
        if stripped.is_empty() || stripped.len() > 16 {
            return None;
        }
        let padded = format!("{:0>16}", stripped.to_lowercase());
        let raw = hex::decode(&padded).ok()?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&raw);
        Some(Address(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Bare 16-char hex form, no prefix.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Canonical 18-char `0x`-prefixed form.
    pub fn canonical(&self) -> String {
        format!("0x{}", self.hex())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

pub fn strip_0x_prefix(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

pub fn add_0x_prefix(s: &str) -> String {
    if s.starts_with("0x") {
        s.to_string()
    } else {
        format!("0x{}", s)
    }
}

/// Restores accounts that lost leading zeros somewhere upstream. Inputs that
/// are already 18 characters pass through untouched; anything else is
/// stripped, left-padded to 16 hex digits and re-prefixed.
pub fn fix_account_length(account: &str) -> String {
    if account.len() == 18 {
        return account.to_string();
    }
    let stripped = strip_0x_prefix(account);
    add_0x_prefix(&format!("{:0>16}", stripped))
}

/// One `(publicKey, account, keyIndex)` triple as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyAccountRow {
    pub public_key: String,
    pub account: String,
    pub key_id: i64,
    pub weight: i64,
    pub sig_algo: Option<i64>,
    pub hash_algo: Option<i64>,
    pub is_revoked: bool,
}

impl PublicKeyAccountRow {
    /// Placeholder row for an account with zero keys.
    pub fn blank(account: &str) -> Self {
        PublicKeyAccountRow {
            public_key: BLANK_PUBLIC_KEY.to_string(),
            account: fix_account_length(&add_0x_prefix(account)),
            key_id: 0,
            weight: 0,
            sig_algo: None,
            hash_algo: None,
            is_revoked: false,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.public_key == BLANK_PUBLIC_KEY
    }
}

pub fn signature_algo_index(sig_algo: &str) -> i64 {
    match sig_algo {
        "ECDSA_P256" => 1,
        "ECDSA_secp256k1" => 2,
        "BLS_BLS12_381" => 3,
        other => {
            tracing::warn!("Unknown signature algorithm: {}", other);
            0
        }
    }
}

pub fn signature_algo_name(sig_algo: i64) -> &'static str {
    match sig_algo {
        1 => "ECDSA_P256",
        2 => "ECDSA_secp256k1",
        3 => "BLS_BLS12_381",
        _ => "Unknown",
    }
}

pub fn hashing_algo_index(hash_algo: &str) -> i64 {
    match hash_algo {
        "SHA2_256" => 1,
        "SHA2_384" => 2,
        "SHA3_256" => 3,
        "SHA3_384" => 4,
        "KMAC128_BLS_BLS12_381" => 5,
        "KECCAK_256" => 6,
        other => {
            tracing::warn!("Unknown hashing algorithm: {}", other);
            0
        }
    }
}

pub fn hashing_algo_name(hash_algo: i64) -> &'static str {
    match hash_algo {
        1 => "SHA2_256",
        2 => "SHA2_384",
        3 => "SHA3_256",
        4 => "SHA3_384",
        5 => "KMAC128_BLS_BLS12_381",
        6 => "KECCAK_256",
        _ => "Unknown",
    }
}

/// One account entry in the `/key/{id}` response.
#[derive(Debug, Clone, Serialize)]
pub struct AccountKey {
    #[serde(rename = "address")]
    pub account: String,
    #[serde(rename = "keyId")]
    pub key_id: i64,
    pub weight: i64,
    #[serde(rename = "sigAlgo")]
    pub sig_algo: i64,
    #[serde(rename = "hashAlgo")]
    pub hash_algo: i64,
    #[serde(rename = "isRevoked")]
    pub is_revoked: bool,
    pub signing: String,
    pub hashing: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublicKeyIndexer {
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub accounts: Vec<AccountKey>,
}

impl PublicKeyIndexer {
    pub fn from_rows(public_key: String, rows: Vec<PublicKeyAccountRow>) -> Self {
        let accounts = rows
            .into_iter()
            .map(|row| {
                let sig = row.sig_algo.unwrap_or(0);
                let hash = row.hash_algo.unwrap_or(0);
                AccountKey {
                    account: fix_account_length(&row.account),
                    key_id: row.key_id,
                    weight: row.weight,
                    sig_algo: sig,
                    hash_algo: hash,
                    is_revoked: row.is_revoked,
                    signing: signature_algo_name(sig).to_string(),
                    hashing: hashing_algo_name(hash).to_string(),
                }
            })
            .collect();
        PublicKeyIndexer {
            public_key,
            accounts,
        }
    }
}

/// Block range the scanner skipped when it reseeded after irrecoverable lag.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BlockGap {
    #[serde(rename = "fromBlock")]
    pub from_block: u64,
    #[serde(rename = "toBlock")]
    pub to_block: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublicKeyStatus {
    #[serde(rename = "publicKeyCount")]
    pub count: i64,
    #[serde(rename = "currentBlockHeight")]
    pub current_block: i64,
    #[serde(rename = "loadedToBlockHeight")]
    pub loaded_to_block: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gap: Option<BlockGap>,
}
