use crate::block::{Block, GENESIS};
use crate::config::{
    total_subsidy, AMOUNT_EPSILON, DIFFICULTY_WINDOW, NANOS_PER_SEC, TARGET_BLOCK_TIME,
};
use crate::transaction::{Transaction, TxId, TxInput, UtxoSet};
use serde::{Deserialize, Serialize};
use shared::{canonical_json, ChainError, Result};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Estado autoritativo do nó: a cadeia canônica e seu conjunto UTXO.
///
/// Toda mutação passa por [`Blockchain::add_block`] ou
/// [`Blockchain::replace_chain`]; ambas deixam o estado intocado em caso de
/// falha.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blockchain {
    chain: Vec<Block>,
    utxo_set: UtxoSet,
    current_height: u64,
    /// Janela de (timestamp, dificuldade) para a correção de longo horizonte
    #[serde(skip)]
    difficulty_window: Vec<(u64, u32)>,
}

impl Blockchain {
    /// Cria a cadeia contendo apenas o bloco gênese
    #[must_use]
    pub fn new() -> Self {
        let genesis = GENESIS.clone();
        let mut utxo_set = UtxoSet::new();
        for tx in &genesis.data {
            utxo_set.insert(tx.id.clone(), tx.output.clone());
        }
        Self {
            chain: vec![genesis],
            utxo_set,
            current_height: 0,
            difficulty_window: Vec::new(),
        }
    }

    /// Mina e anexa um bloco com as transações dadas.
    ///
    /// Antes de minerar, cada transação não-coinbase é conferida contra o
    /// conjunto UTXO corrente, aplicando-as em sequência sobre uma cópia de
    /// trabalho. Gastos duplos dentro do mesmo lote falham aqui, porque a
    /// primeira aplicação remove a entrada que a segunda referencia.
    ///
    /// # Errors
    ///
    /// [`ChainError::InvalidUtxoReference`] / [`ChainError::InsufficientInput`]
    /// para inputs inconsistentes; erros de mineração são propagados. Em
    /// qualquer falha o estado permanece inalterado.
    pub fn add_block(&mut self, transactions: Vec<Transaction>) -> Result<&Block> {
        let mut working_utxo = self.utxo_set.clone();
        for tx in &transactions {
            apply_transaction(&mut working_utxo, tx, true)?;
        }

        let forced_difficulty = self.window_difficulty();
        let last = self.last_block();
        let block = Block::mine_block_with_difficulty(last, transactions, forced_difficulty)?;

        debug!(
            height = block.height,
            nonce = block.nonce,
            difficulty = block.difficulty,
            "bloco minerado"
        );

        self.difficulty_window.push((block.timestamp, block.difficulty));
        if forced_difficulty.is_some() {
            self.difficulty_window.clear();
        }
        self.chain.push(block);
        self.utxo_set = working_utxo;
        self.current_height += 1;
        Ok(self.last_block())
    }

    /// Substitui a cadeia local pela candidata, se esta for mais longa e
    /// válida.
    ///
    /// O conjunto UTXO é reconstruído do zero pelo replay completo da
    /// candidata em um mapa temporário; só depois de tudo validar a cadeia e
    /// o conjunto são trocados, de uma vez.
    ///
    /// # Errors
    ///
    /// [`ChainError::ChainTooShort`] se a candidata não for mais longa;
    /// erros de validação/replay deixam o estado anterior intacto
    pub fn replace_chain(&mut self, candidate: Vec<Block>) -> Result<()> {
        if candidate.len() <= self.chain.len() {
            return Err(ChainError::ChainTooShort);
        }

        let rebuilt_utxo = Self::validate_chain(&candidate)?;

        info!(
            old_height = self.current_height,
            new_height = candidate.len() - 1,
            "cadeia substituída"
        );
        self.current_height = (candidate.len() - 1) as u64;
        self.chain = candidate;
        self.utxo_set = rebuilt_utxo;
        self.difficulty_window.clear();
        Ok(())
    }

    /// Valida uma cadeia completa e devolve o conjunto UTXO do replay.
    ///
    /// # Errors
    ///
    /// [`ChainError::InvalidChain`] ou o erro da primeira regra violada
    pub fn validate_chain(chain: &[Block]) -> Result<UtxoSet> {
        let Some(first) = chain.first() else {
            return Err(ChainError::InvalidChain("cadeia vazia".to_string()));
        };
        if canonical_json(first)? != canonical_json(&*GENESIS)? {
            return Err(ChainError::InvalidChain(
                "bloco gênese divergente".to_string(),
            ));
        }

        let mut utxo_set = UtxoSet::new();
        let mut total_coinbase_output = 0.0;
        let mut total_fees = 0.0;

        for (i, block) in chain.iter().enumerate() {
            if i > 0 {
                Block::is_valid_block(&chain[i - 1], block)?;
            }
            if block.height != i as u64 {
                return Err(ChainError::InvalidChain(format!(
                    "altura {} fora de sequência na posição {i}",
                    block.height
                )));
            }

            let block_fees: f64 = block
                .data
                .iter()
                .filter(|tx| !tx.is_coinbase)
                .map(|tx| tx.fee)
                .sum();

            let mut has_coinbase = false;
            for tx in &block.data {
                tx.is_valid(None)?;
                match &tx.input {
                    TxInput::Coinbase(input) => {
                        if has_coinbase {
                            return Err(ChainError::InvalidChain(
                                "múltiplas coinbases no mesmo bloco".to_string(),
                            ));
                        }
                        has_coinbase = true;
                        if (input.fees - block_fees).abs() > AMOUNT_EPSILON {
                            return Err(ChainError::InvalidChain(format!(
                                "coinbase declara taxas {} mas o bloco soma {block_fees}",
                                input.fees
                            )));
                        }
                        total_coinbase_output += tx.total_output();
                        total_fees += input.fees;
                    }
                    TxInput::Standard(_) => {}
                }
                apply_transaction(&mut utxo_set, tx, false)?;
            }
            if !has_coinbase && i > 0 {
                return Err(ChainError::InvalidChain("coinbase ausente".to_string()));
            }
        }

        let ceiling = total_subsidy(chain.len() as u64) + total_fees;
        if total_coinbase_output > ceiling + AMOUNT_EPSILON {
            return Err(ChainError::InvalidChain(format!(
                "emissão total {total_coinbase_output} excede {ceiling}"
            )));
        }

        Ok(utxo_set)
    }

    /// Valida uma cadeia sem reter o replay
    ///
    /// # Errors
    ///
    /// Propaga o erro da primeira regra violada
    pub fn is_valid_chain(chain: &[Block]) -> Result<()> {
        Self::validate_chain(chain).map(|_| ())
    }

    /// Último bloco da cadeia
    ///
    /// # Panics
    ///
    /// Nunca: o gênese sempre existe
    #[must_use]
    pub fn last_block(&self) -> &Block {
        self.chain.last().expect("o gênese sempre existe")
    }

    #[must_use]
    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    #[must_use]
    pub const fn utxo_set(&self) -> &UtxoSet {
        &self.utxo_set
    }

    #[must_use]
    pub const fn current_height(&self) -> u64 {
        self.current_height
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    #[must_use]
    pub fn block_by_height(&self, height: u64) -> Option<&Block> {
        usize::try_from(height).ok().and_then(|i| self.chain.get(i))
    }

    #[must_use]
    pub fn block_by_hash(&self, hash: &str) -> Option<&Block> {
        self.chain.iter().find(|block| block.hash == hash)
    }

    /// Bloco que confirmou a transação dada
    #[must_use]
    pub fn block_with_transaction(&self, tx_id: &str) -> Option<&Block> {
        self.chain
            .iter()
            .find(|block| block.data.iter().any(|tx| tx.id == tx_id))
    }

    /// Todos os endereços já creditados por algum output confirmado
    #[must_use]
    pub fn known_addresses(&self) -> BTreeSet<String> {
        self.chain
            .iter()
            .flat_map(|block| &block.data)
            .flat_map(|tx| tx.output.keys().cloned())
            .collect()
    }

    /// Dificuldade da janela de 2016 blocos, quando cheia.
    ///
    /// `first.difficulty * esperado / real`, com piso em 1; substitui o
    /// ajuste por bloco no bloco em que a janela fecha.
    fn window_difficulty(&self) -> Option<u32> {
        if self.difficulty_window.len() < DIFFICULTY_WINDOW {
            return None;
        }
        let (first_ts, first_difficulty) = *self.difficulty_window.first()?;
        let (last_ts, _) = *self.difficulty_window.last()?;
        let actual_secs = last_ts.saturating_sub(first_ts) as f64 / NANOS_PER_SEC as f64;
        let expected_secs =
            DIFFICULTY_WINDOW as f64 * (TARGET_BLOCK_TIME / NANOS_PER_SEC) as f64;
        let difficulty = f64::from(first_difficulty) * expected_secs / actual_secs.max(1.0);
        Some((difficulty as u32).max(1))
    }
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new()
    }
}

/// Aplica uma transação sobre um conjunto UTXO: remove as entradas gastas e
/// insere o mapa de outputs sob o id da transação.
///
/// Com `check_amount` ativo, também confere que o `input.amount` declarado
/// não excede a soma dos outputs referenciados pertencentes ao remetente.
fn apply_transaction(utxo_set: &mut UtxoSet, tx: &Transaction, check_amount: bool) -> Result<()> {
    if let TxInput::Standard(input) = &tx.input {
        let mut referenced_total = 0.0;
        for prev_tx_id in &input.prev_tx_ids {
            let Some(outputs) = utxo_set.get(prev_tx_id) else {
                return Err(ChainError::InvalidUtxoReference(prev_tx_id.clone()));
            };
            let Some(value) = outputs.get(&input.address) else {
                return Err(ChainError::InvalidUtxoReference(format!(
                    "{prev_tx_id} não pertence a {}",
                    input.address
                )));
            };
            referenced_total += value;
        }
        if check_amount && input.amount > referenced_total + AMOUNT_EPSILON {
            return Err(ChainError::InsufficientInput(format!(
                "input declara {} mas os UTXOs referenciados somam {referenced_total}",
                input.amount
            )));
        }
        let spent: Vec<TxId> = input.prev_tx_ids.clone();
        for prev_tx_id in spent {
            utxo_set.remove(&prev_tx_id);
        }
    }
    utxo_set.insert(tx.id.clone(), tx.output.clone());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GENESIS_ADDRESS;
    use crate::wallet::{calculate_balance, Wallet};

    fn mine_to(chain: &mut Blockchain, miner: &str, extra: Vec<Transaction>) {
        let fees: f64 = extra.iter().map(|tx| tx.fee).sum();
        let coinbase =
            Transaction::create_coinbase(miner, chain.current_height() + 1, fees).unwrap();
        let mut txs = vec![coinbase];
        txs.extend(extra);
        chain.add_block(txs).unwrap();
    }

    #[test]
    fn test_new_chain_has_genesis_utxo() {
        let chain = Blockchain::new();

        assert_eq!(chain.current_height(), 0);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.utxo_set().len(), 1);
        let genesis_outputs = chain.utxo_set().get("genesis_initial_tx").unwrap();
        assert_eq!(genesis_outputs[GENESIS_ADDRESS], 50.0);
    }

    #[test]
    fn test_mine_block_credits_miner() {
        let mut chain = Blockchain::new();
        let miner = Wallet::new().unwrap();

        mine_to(&mut chain, miner.address(), vec![]);

        assert_eq!(chain.current_height(), 1);
        assert_eq!(calculate_balance(chain.utxo_set(), miner.address()), 50.0);
    }

    #[test]
    fn test_transfer_updates_utxo_set() {
        let mut chain = Blockchain::new();
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();

        mine_to(&mut chain, alice.address(), vec![]);
        let tx =
            Transaction::create(&alice, chain.utxo_set(), bob.address(), 10.0, 0.000_01).unwrap();
        let spent_ids = match &tx.input {
            TxInput::Standard(input) => input.prev_tx_ids.clone(),
            TxInput::Coinbase(_) => unreachable!(),
        };
        mine_to(&mut chain, alice.address(), vec![tx.clone()]);

        // Entradas gastas saem do conjunto; a nova transação entra inteira
        for spent in &spent_ids {
            assert!(!chain.utxo_set().contains_key(spent));
        }
        assert!(chain.utxo_set().contains_key(&tx.id));
        assert_eq!(calculate_balance(chain.utxo_set(), bob.address()), 10.0);
        Blockchain::is_valid_chain(chain.chain()).unwrap();
    }

    #[test]
    fn test_double_spend_in_same_block_rejected() {
        let mut chain = Blockchain::new();
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();

        mine_to(&mut chain, alice.address(), vec![]);
        let tx1 =
            Transaction::create(&alice, chain.utxo_set(), bob.address(), 10.0, 0.000_01).unwrap();
        let tx2 =
            Transaction::create(&alice, chain.utxo_set(), bob.address(), 20.0, 0.000_01).unwrap();

        let height_before = chain.current_height();
        let coinbase = Transaction::create_coinbase(
            alice.address(),
            height_before + 1,
            tx1.fee + tx2.fee,
        )
        .unwrap();
        let result = chain.add_block(vec![coinbase, tx1, tx2]);

        assert!(matches!(result, Err(ChainError::InvalidUtxoReference(_))));
        assert_eq!(chain.current_height(), height_before);
    }

    #[test]
    fn test_overdeclared_input_amount_rejected() {
        let mut chain = Blockchain::new();
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();

        mine_to(&mut chain, alice.address(), vec![]);
        let mut tx =
            Transaction::create(&alice, chain.utxo_set(), bob.address(), 10.0, 0.000_01).unwrap();
        if let TxInput::Standard(input) = &mut tx.input {
            input.amount = 1_000.0; // mais do que os UTXOs referenciados valem
        }

        let coinbase =
            Transaction::create_coinbase(alice.address(), chain.current_height() + 1, tx.fee)
                .unwrap();
        let result = chain.add_block(vec![coinbase, tx]);
        assert!(matches!(result, Err(ChainError::InsufficientInput(_))));
    }

    #[test]
    fn test_replace_chain_adopts_longer_chain() {
        let miner = Wallet::new().unwrap();
        let mut node_a = Blockchain::new();
        let mut node_b = Blockchain::new();

        mine_to(&mut node_a, miner.address(), vec![]);
        for _ in 0..3 {
            mine_to(&mut node_b, miner.address(), vec![]);
        }

        node_a.replace_chain(node_b.chain().to_vec()).unwrap();

        assert_eq!(node_a.current_height(), 3);
        assert_eq!(
            canonical_json(node_a.utxo_set()).unwrap(),
            canonical_json(node_b.utxo_set()).unwrap()
        );
    }

    #[test]
    fn test_replace_chain_rejects_shorter() {
        let miner = Wallet::new().unwrap();
        let mut node_a = Blockchain::new();
        let node_b = Blockchain::new();

        mine_to(&mut node_a, miner.address(), vec![]);
        let result = node_a.replace_chain(node_b.chain().to_vec());

        assert!(matches!(result, Err(ChainError::ChainTooShort)));
        assert_eq!(node_a.current_height(), 1);
    }

    #[test]
    fn test_replace_chain_failure_leaves_state_unchanged() {
        let miner = Wallet::new().unwrap();
        let mut node_a = Blockchain::new();
        let mut node_b = Blockchain::new();

        mine_to(&mut node_a, miner.address(), vec![]);
        for _ in 0..3 {
            mine_to(&mut node_b, miner.address(), vec![]);
        }

        let mut tampered = node_b.chain().to_vec();
        tampered[2].hash = "0".repeat(64);

        let before = canonical_json(&node_a).unwrap();
        assert!(node_a.replace_chain(tampered).is_err());
        assert_eq!(canonical_json(&node_a).unwrap(), before);
    }

    #[test]
    fn test_validate_chain_rejects_wrong_fee_claim() {
        let mut chain = Blockchain::new();
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();

        mine_to(&mut chain, alice.address(), vec![]);
        let tx =
            Transaction::create(&alice, chain.utxo_set(), bob.address(), 10.0, 0.000_01).unwrap();
        // Coinbase declara zero em um bloco que recolhe taxas: o output fica
        // dentro do teto, mas a alegação diverge da soma do corpo
        let coinbase =
            Transaction::create_coinbase(alice.address(), chain.current_height() + 1, 0.0).unwrap();
        chain.add_block(vec![coinbase, tx]).unwrap();

        assert!(matches!(
            Blockchain::is_valid_chain(chain.chain()),
            Err(ChainError::InvalidChain(_))
        ));
    }

    #[test]
    fn test_validate_chain_rejects_foreign_genesis() {
        let mut chain = Blockchain::new().chain().to_vec();
        chain[0].nonce = 42;
        assert!(matches!(
            Blockchain::is_valid_chain(&chain),
            Err(ChainError::InvalidChain(_))
        ));
    }
}
