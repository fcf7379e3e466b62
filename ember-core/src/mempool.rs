use crate::block::Block;
use crate::transaction::{Transaction, TxId};
use shared::Result;
use std::collections::HashMap;
use tracing::debug;

/// O que `set_transaction` fez com a transação oferecida
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolUpdate {
    /// Transação nova admitida
    Inserted,
    /// Substituiu uma versão mais antiga com o mesmo id
    Replaced,
    /// Versão oferecida não é mais nova; nada mudou
    IgnoredOlder,
}

/// Mempool do nó: transações admitidas e ainda não confirmadas
#[derive(Debug, Clone, Default)]
pub struct TransactionPool {
    transaction_map: HashMap<TxId, Transaction>,
}

impl TransactionPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admite uma transação validada.
    ///
    /// Se o id já existe, a versão nova só substitui a antiga quando o
    /// timestamp do input é estritamente maior; caso contrário nada muda.
    ///
    /// # Errors
    ///
    /// Propaga a falha de validação da transação
    pub fn set_transaction(&mut self, transaction: Transaction) -> Result<PoolUpdate> {
        transaction.is_valid(None)?;

        if let Some(existing) = self.transaction_map.get(&transaction.id) {
            if transaction.timestamp() <= existing.timestamp() {
                return Ok(PoolUpdate::IgnoredOlder);
            }
            debug!(tx_id = %transaction.id, "transação substituída por versão mais nova");
            self.transaction_map
                .insert(transaction.id.clone(), transaction);
            return Ok(PoolUpdate::Replaced);
        }

        self.transaction_map
            .insert(transaction.id.clone(), transaction);
        Ok(PoolUpdate::Inserted)
    }

    /// Transação em aberto do endereço dado, se houver.
    ///
    /// Permite que um cliente emende sua transação em trânsito em vez de
    /// criar uma segunda.
    #[must_use]
    pub fn existing_transaction(&self, address: &str) -> Option<&Transaction> {
        self.transaction_map
            .values()
            .find(|tx| tx.input.address() == address)
    }

    #[must_use]
    pub fn get(&self, tx_id: &str) -> Option<&Transaction> {
        self.transaction_map.get(tx_id)
    }

    #[must_use]
    pub fn contains(&self, tx_id: &str) -> bool {
        self.transaction_map.contains_key(tx_id)
    }

    /// Cópia de todas as transações pendentes
    #[must_use]
    pub fn transaction_data(&self) -> Vec<Transaction> {
        self.transaction_map.values().cloned().collect()
    }

    /// Transações ordenadas por taxa por byte (fee/size), decrescente.
    ///
    /// O minerador pega um prefixo desta lista até o limite de bloco.
    #[must_use]
    pub fn get_priority_transactions(&self) -> Vec<Transaction> {
        let mut transactions: Vec<Transaction> = self.transaction_map.values().cloned().collect();
        transactions.sort_by(|a, b| {
            let rate_a = a.fee / a.size.max(1) as f64;
            let rate_b = b.fee / b.size.max(1) as f64;
            rate_b
                .partial_cmp(&rate_a)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        transactions
    }

    /// Remove uma transação específica (desfazimento de admissão)
    pub fn remove(&mut self, tx_id: &str) -> Option<Transaction> {
        self.transaction_map.remove(tx_id)
    }

    /// Remove do mempool tudo que já aparece em algum bloco confirmado
    pub fn clear_blockchain_transactions(&mut self, chain: &[Block]) {
        for block in chain {
            for tx in &block.data {
                self.transaction_map.remove(&tx.id);
            }
        }
    }

    /// Soma do que o endereço tem comprometido em transações pendentes
    /// (outputs para terceiros mais taxas)
    #[must_use]
    pub fn pending_spend(&self, address: &str) -> f64 {
        self.transaction_map
            .values()
            .filter(|tx| tx.input.address() == address)
            .map(|tx| {
                let outgoing: f64 = tx
                    .output
                    .iter()
                    .filter(|(addr, _)| addr.as_str() != address)
                    .map(|(_, value)| value)
                    .sum();
                outgoing + tx.fee
            })
            .sum()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.transaction_map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transaction_map.is_empty()
    }
}
