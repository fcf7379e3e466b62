//! Núcleo do Embercoin: blockchain UTXO com proof-of-work, mempool com
//! prioridade por taxa e carteira local.

pub mod block;
pub mod chain;
pub mod config;
pub mod fees;
pub mod mempool;
pub mod transaction;
pub mod wallet;

pub use block::{adjust_difficulty, calculate_merkle_root, Block, GENESIS};
pub use chain::Blockchain;
pub use config::Priority;
pub use fees::FeeRateEstimator;
pub use mempool::{PoolUpdate, TransactionPool};
pub use transaction::{
    Address, CoinbaseInput, StandardInput, Transaction, TxId, TxInput, TxOutputMap, UtxoSet,
};
pub use wallet::{calculate_balance, Wallet};
