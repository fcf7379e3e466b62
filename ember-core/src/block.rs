use crate::config::{
    block_subsidy, now_nanos, AMOUNT_EPSILON, BLOCK_SIZE_LIMIT, GENESIS_ADDRESS, MINE_RATE,
    STARTING_DIFFICULTY, TARGET_BLOCK_TIME,
};
use crate::transaction::{CoinbaseInput, Transaction, TxInput, TxOutputMap};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared::{canonical_json, crypto_hash, meets_difficulty, ChainError, Result};

/// Versão corrente do formato de bloco
pub const BLOCK_VERSION: u32 = 1;

/// Bloco gênese, idêntico em todos os nós da rede
pub static GENESIS: Lazy<Block> = Lazy::new(genesis_block);

/// Bloco da cadeia Embercoin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Momento da mineração, em nanossegundos
    pub timestamp: u64,
    /// Hash do bloco anterior
    pub last_hash: String,
    /// Hash deste bloco (SHA-256 dos campos de cabeçalho)
    pub hash: String,
    /// Transações confirmadas, em ordem
    pub data: Vec<Transaction>,
    /// Bits zero iniciais exigidos do hash
    pub difficulty: u32,
    pub nonce: u64,
    pub height: u64,
    pub version: u32,
    /// Raiz de Merkle das transações serializadas
    pub merkle_root: String,
    /// Quantidade de transações (== data.len())
    pub tx_count: u64,
}

impl Block {
    /// Minera um bloco sobre `last` com ajuste de dificuldade por bloco.
    ///
    /// # Errors
    ///
    /// Retorna erro se o corpo serializado exceder o limite de tamanho
    pub fn mine_block(last: &Block, data: Vec<Transaction>) -> Result<Self> {
        Self::mine_block_with_difficulty(last, data, None)
    }

    /// Minera um bloco, opcionalmente com dificuldade fixa (usada quando a
    /// janela de 2016 blocos substitui o ajuste por bloco).
    ///
    /// O laço re-carimba o timestamp e re-ajusta a dificuldade a cada nonce,
    /// de modo que blocos demorados não continuem exigindo a dificuldade do
    /// instante em que a mineração começou.
    ///
    /// # Errors
    ///
    /// Retorna erro se o corpo serializado exceder o limite de tamanho
    pub fn mine_block_with_difficulty(
        last: &Block,
        data: Vec<Transaction>,
        forced_difficulty: Option<u32>,
    ) -> Result<Self> {
        let data_value =
            serde_json::to_value(&data).map_err(|e| ChainError::SerializationError(e.to_string()))?;
        let body_len = data_value.to_string().len();
        if body_len > BLOCK_SIZE_LIMIT {
            return Err(ChainError::InvalidBlock(format!(
                "corpo de {body_len} bytes excede o limite de {BLOCK_SIZE_LIMIT}"
            )));
        }

        let height = last.height + 1;
        let merkle_root = calculate_merkle_root(&data)?;
        let tx_count = data.len() as u64;
        let mut nonce = 0u64;
        let mut timestamp = now_nanos();
        let mut difficulty =
            forced_difficulty.unwrap_or_else(|| adjust_difficulty(last, timestamp));
        let mut hash = compute_hash(
            timestamp,
            &last.hash,
            &data_value,
            difficulty,
            nonce,
            height,
            BLOCK_VERSION,
            &merkle_root,
            tx_count,
        );

        while !meets_difficulty(&hash, difficulty) {
            nonce += 1;
            timestamp = now_nanos();
            if forced_difficulty.is_none() {
                difficulty = adjust_difficulty(last, timestamp);
            }
            hash = compute_hash(
                timestamp,
                &last.hash,
                &data_value,
                difficulty,
                nonce,
                height,
                BLOCK_VERSION,
                &merkle_root,
                tx_count,
            );
        }

        Ok(Self {
            timestamp,
            last_hash: last.hash.clone(),
            hash,
            data,
            difficulty: difficulty.max(1),
            nonce,
            height,
            version: BLOCK_VERSION,
            merkle_root,
            tx_count,
        })
    }

    /// Valida `block` como sucessor de `last`.
    ///
    /// # Errors
    ///
    /// [`ChainError::InvalidBlock`] descrevendo a primeira regra violada
    pub fn is_valid_block(last: &Block, block: &Block) -> Result<()> {
        if block.last_hash != last.hash {
            return Err(ChainError::InvalidBlock(
                "last_hash não referencia o bloco anterior".to_string(),
            ));
        }
        if !meets_difficulty(&block.hash, block.difficulty) {
            return Err(ChainError::InvalidBlock(
                "proof of work não atendido".to_string(),
            ));
        }
        if last.difficulty.abs_diff(block.difficulty) > 1 {
            return Err(ChainError::InvalidBlock(
                "salto de dificuldade maior que 1".to_string(),
            ));
        }
        if block.height != last.height + 1 {
            return Err(ChainError::InvalidBlock("altura incorreta".to_string()));
        }
        if block.tx_count != block.data.len() as u64 {
            return Err(ChainError::InvalidBlock(
                "tx_count divergente do corpo".to_string(),
            ));
        }
        let merkle_root = calculate_merkle_root(&block.data)?;
        if block.merkle_root != merkle_root {
            return Err(ChainError::InvalidBlock(format!(
                "merkle root inválida: esperada {merkle_root}, recebida {}",
                block.merkle_root
            )));
        }
        let data_value = serde_json::to_value(&block.data)
            .map_err(|e| ChainError::SerializationError(e.to_string()))?;
        if data_value.to_string().len() > BLOCK_SIZE_LIMIT {
            return Err(ChainError::InvalidBlock(
                "corpo excede o limite de tamanho".to_string(),
            ));
        }
        let reconstructed = compute_hash(
            block.timestamp,
            &block.last_hash,
            &data_value,
            block.difficulty,
            block.nonce,
            block.height,
            block.version,
            &block.merkle_root,
            block.tx_count,
        );
        if reconstructed != block.hash {
            return Err(ChainError::InvalidBlock("hash divergente".to_string()));
        }

        // Regras de coinbase e validade individual das transações
        let mut coinbase: Option<&Transaction> = None;
        let mut total_fees = 0.0;
        for tx in &block.data {
            tx.is_valid(None)?;
            if tx.is_coinbase {
                if coinbase.is_some() {
                    return Err(ChainError::InvalidBlock(
                        "mais de uma coinbase no bloco".to_string(),
                    ));
                }
                coinbase = Some(tx);
            } else {
                total_fees += tx.fee;
            }
        }
        match coinbase {
            Some(tx) => {
                let ceiling = block_subsidy(block.height) + total_fees;
                if tx.total_output() > ceiling + AMOUNT_EPSILON {
                    return Err(ChainError::InvalidBlock(format!(
                        "coinbase {} excede subsídio + taxas {ceiling}",
                        tx.total_output()
                    )));
                }
            }
            None if block.height > 0 => {
                return Err(ChainError::InvalidBlock("coinbase ausente".to_string()));
            }
            None => {}
        }

        Ok(())
    }
}

/// Ajusta a dificuldade para um bloco minerado em `new_timestamp`.
///
/// Bloco rápido demais sobe um nível; bloco além do dobro do tempo alvo
/// desce um nível, nunca abaixo de 1.
#[must_use]
pub fn adjust_difficulty(last: &Block, new_timestamp: u64) -> u32 {
    let elapsed = new_timestamp.saturating_sub(last.timestamp);
    if elapsed < MINE_RATE {
        return last.difficulty + 1;
    }
    if last.difficulty > 1 && elapsed > 2 * TARGET_BLOCK_TIME {
        return last.difficulty - 1;
    }
    last.difficulty
}

/// Raiz de Merkle das transações canonicamente serializadas.
///
/// Em nível ímpar o último hash sobe inalterado; lista vazia produz o hash
/// da string vazia.
///
/// # Errors
///
/// Retorna erro se alguma transação não puder ser serializada
pub fn calculate_merkle_root(data: &[Transaction]) -> Result<String> {
    if data.is_empty() {
        return Ok(crypto_hash(&[json!("")]));
    }

    let mut hashes = data
        .iter()
        .map(|tx| Ok(crypto_hash(&[json!(canonical_json(tx)?)])))
        .collect::<Result<Vec<String>>>()?;

    while hashes.len() > 1 {
        let mut next_level = Vec::with_capacity(hashes.len().div_ceil(2));
        for pair in hashes.chunks(2) {
            if pair.len() == 2 {
                next_level.push(crypto_hash(&[json!(format!("{}{}", pair[0], pair[1]))]));
            } else {
                next_level.push(pair[0].clone());
            }
        }
        hashes = next_level;
    }

    Ok(hashes.swap_remove(0))
}

#[allow(clippy::too_many_arguments)]
fn compute_hash(
    timestamp: u64,
    last_hash: &str,
    data: &Value,
    difficulty: u32,
    nonce: u64,
    height: u64,
    version: u32,
    merkle_root: &str,
    tx_count: u64,
) -> String {
    crypto_hash(&[
        json!(timestamp),
        json!(last_hash),
        data.clone(),
        json!(difficulty),
        json!(nonce),
        json!(height),
        json!(version),
        json!(merkle_root),
        json!(tx_count),
    ])
}

/// Constrói o bloco gênese fixo da rede
fn genesis_block() -> Block {
    let mut output = TxOutputMap::new();
    output.insert(GENESIS_ADDRESS.to_string(), 50.0);

    let genesis_tx = Transaction {
        id: "genesis_initial_tx".to_string(),
        input: TxInput::Coinbase(CoinbaseInput {
            timestamp: 1,
            address: "coinbase".to_string(),
            public_key: "coinbase".to_string(),
            signature: "coinbase".to_string(),
            coinbase_data: "Initial funding".to_string(),
            block_height: 0,
            subsidy: 50.0,
            fees: 0.0,
        }),
        output,
        fee: 0.0,
        size: 250,
        is_coinbase: true,
        fee_rate: 0.0,
    };

    let data = vec![genesis_tx];
    let merkle_root =
        calculate_merkle_root(&data).expect("serialização do gênese nunca falha");
    let data_value = serde_json::to_value(&data).expect("serialização do gênese nunca falha");
    let hash = compute_hash(
        1,
        "genesis_last_hash",
        &data_value,
        STARTING_DIFFICULTY,
        0,
        0,
        BLOCK_VERSION,
        &merkle_root,
        1,
    );

    Block {
        timestamp: 1,
        last_hash: "genesis_last_hash".to_string(),
        hash,
        data,
        difficulty: STARTING_DIFFICULTY,
        nonce: 0,
        height: 0,
        version: BLOCK_VERSION,
        merkle_root,
        tx_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::leading_zero_bits;

    fn mined_child(last: &Block) -> Block {
        let coinbase = Transaction::create_coinbase("mineiro", last.height + 1, 0.0).unwrap();
        Block::mine_block(last, vec![coinbase]).unwrap()
    }

    #[test]
    fn test_genesis_is_deterministic() {
        let a = genesis_block();
        assert_eq!(a.hash, GENESIS.hash);
        assert_eq!(a.merkle_root, GENESIS.merkle_root);
        assert_eq!(GENESIS.height, 0);
        assert_eq!(GENESIS.difficulty, STARTING_DIFFICULTY);
        assert_eq!(GENESIS.data[0].output[GENESIS_ADDRESS], 50.0);
    }

    #[test]
    fn test_mine_block_produces_valid_successor() {
        let block = mined_child(&GENESIS);

        assert_eq!(block.height, 1);
        assert_eq!(block.last_hash, GENESIS.hash);
        Block::is_valid_block(&GENESIS, &block).unwrap();
    }

    #[test]
    fn test_pow_has_required_leading_zeros() {
        let block = mined_child(&GENESIS);
        assert!(leading_zero_bits(&block.hash).unwrap() >= block.difficulty);
    }

    #[test]
    fn test_tampered_hash_rejected() {
        let mut block = mined_child(&GENESIS);
        block.hash = "0".repeat(64); // atende o PoW, mas não corresponde aos campos
        assert!(matches!(
            Block::is_valid_block(&GENESIS, &block),
            Err(ChainError::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_wrong_last_hash_rejected() {
        let mut block = mined_child(&GENESIS);
        block.last_hash = "outra_coisa".to_string();
        assert!(Block::is_valid_block(&GENESIS, &block).is_err());
    }

    #[test]
    fn test_tampered_data_breaks_merkle() {
        let mut block = mined_child(&GENESIS);
        let extra = Transaction::create_coinbase("intruso", 1, 0.0).unwrap();
        block.data.push(extra);
        block.tx_count += 1;
        assert!(Block::is_valid_block(&GENESIS, &block).is_err());
    }

    #[test]
    fn test_difficulty_jump_rejected() {
        let mut block = mined_child(&GENESIS);
        block.difficulty = GENESIS.difficulty + 2;
        assert!(Block::is_valid_block(&GENESIS, &block).is_err());
    }

    #[test]
    fn test_adjust_difficulty_raises_when_fast() {
        let quick = GENESIS.timestamp + MINE_RATE / 2;
        assert_eq!(adjust_difficulty(&GENESIS, quick), GENESIS.difficulty + 1);
    }

    #[test]
    fn test_adjust_difficulty_lowers_when_slow() {
        let slow = GENESIS.timestamp + 3 * TARGET_BLOCK_TIME;
        assert_eq!(adjust_difficulty(&GENESIS, slow), GENESIS.difficulty - 1);
    }

    #[test]
    fn test_difficulty_never_below_one() {
        let mut last = GENESIS.clone();
        last.difficulty = 1;
        let slow = last.timestamp + 3 * TARGET_BLOCK_TIME;
        assert_eq!(adjust_difficulty(&last, slow), 1);
    }

    #[test]
    fn test_merkle_empty_input() {
        assert_eq!(calculate_merkle_root(&[]).unwrap(), crypto_hash(&[json!("")]));
    }

    #[test]
    fn test_merkle_single_leaf_is_leaf_hash() {
        let tx = Transaction::create_coinbase("mineiro", 1, 0.0).unwrap();
        let leaf = crypto_hash(&[json!(canonical_json(&tx).unwrap())]);
        assert_eq!(calculate_merkle_root(std::slice::from_ref(&tx)).unwrap(), leaf);
    }

    #[test]
    fn test_merkle_odd_leaf_promoted() {
        let txs: Vec<Transaction> = (0..3)
            .map(|i| Transaction::create_coinbase("mineiro", i + 1, 0.0).unwrap())
            .collect();
        let leaves: Vec<String> = txs
            .iter()
            .map(|tx| crypto_hash(&[json!(canonical_json(tx).unwrap())]))
            .collect();
        let paired = crypto_hash(&[json!(format!("{}{}", leaves[0], leaves[1]))]);
        let expected = crypto_hash(&[json!(format!("{paired}{}", leaves[2]))]);

        assert_eq!(calculate_merkle_root(&txs).unwrap(), expected);
    }

    #[test]
    fn test_block_serde_roundtrip() {
        let block = mined_child(&GENESIS);
        let json = serde_json::to_value(&block).unwrap();
        let restored: Block = serde_json::from_value(json).unwrap();
        assert_eq!(block, restored);
    }

    #[test]
    fn test_oversized_body_rejected() {
        // Corpo artificialmente inflado além do limite
        let mut coinbase = Transaction::create_coinbase("mineiro", 1, 0.0).unwrap();
        if let TxInput::Coinbase(input) = &mut coinbase.input {
            input.coinbase_data = "x".repeat(BLOCK_SIZE_LIMIT + 1);
        }
        assert!(Block::mine_block(&GENESIS, vec![coinbase]).is_err());
    }
}
