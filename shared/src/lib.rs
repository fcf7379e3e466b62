pub mod crypto;
pub mod error;
pub mod hash;

pub use crypto::{address_from_pem, verify_signature, KeyPair, Signature};
pub use error::ChainError;
pub use hash::{
    canonical_json, crypto_hash, hex_to_binary, leading_zero_bits, meets_difficulty, sha256_hex,
};

pub type Result<T> = std::result::Result<T, ChainError>;
