use crate::config::{
    block_subsidy, now_nanos, AMOUNT_EPSILON, BASE_TX_SIZE, COINBASE_ADDRESS, MIN_FEE,
};
use crate::wallet::Wallet;
use serde::{Deserialize, Serialize};
use shared::{canonical_json, verify_signature, ChainError, Result, Signature};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Endereço de carteira (20 caracteres hexadecimais)
pub type Address = String;

/// Identificador de transação (UUID; coinbases levam o prefixo `coinbase_`)
pub type TxId = String;

/// Outputs de uma transação: endereço -> valor creditado.
///
/// `BTreeMap` mantém as chaves ordenadas, o que o encoding canônico exige.
pub type TxOutputMap = BTreeMap<Address, f64>;

/// Conjunto UTXO: id de transação -> mapa de outputs ainda não gastos.
///
/// O modelo consome transações inteiras: gastar qualquer output de uma
/// transação referenciada remove a entrada completa do conjunto.
pub type UtxoSet = BTreeMap<TxId, TxOutputMap>;

/// Input de uma transação comum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardInput {
    /// Momento da assinatura, em nanossegundos
    pub timestamp: u64,
    /// Soma dos UTXOs consumidos
    pub amount: f64,
    /// Endereço do remetente
    pub address: Address,
    /// Chave pública do remetente em PEM
    pub public_key: String,
    /// Assinatura ECDSA sobre o mapa de outputs
    pub signature: Signature,
    /// Transações cujos outputs estão sendo consumidos
    pub prev_tx_ids: Vec<TxId>,
}

/// Input de uma transação coinbase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinbaseInput {
    pub timestamp: u64,
    /// Sempre o marcador `coinbase`
    pub address: String,
    /// Marcador no lugar da chave
    pub public_key: String,
    /// Marcador no lugar da assinatura
    pub signature: String,
    pub coinbase_data: String,
    pub block_height: u64,
    pub subsidy: f64,
    pub fees: f64,
}

/// Input de transação em forma etiquetada.
///
/// As variantes têm campos obrigatórios disjuntos (`block_height`/`subsidy`
/// contra `amount`/`prev_tx_ids`), então a desserialização sem tag é
/// inequívoca.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TxInput {
    Coinbase(CoinbaseInput),
    Standard(StandardInput),
}

impl TxInput {
    /// Momento em que o input foi assinado
    #[must_use]
    pub const fn timestamp(&self) -> u64 {
        match self {
            Self::Coinbase(input) => input.timestamp,
            Self::Standard(input) => input.timestamp,
        }
    }

    /// Endereço do remetente (ou o marcador `coinbase`)
    #[must_use]
    pub fn address(&self) -> &str {
        match self {
            Self::Coinbase(input) => &input.address,
            Self::Standard(input) => &input.address,
        }
    }
}

/// Transação do Embercoin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxId,
    pub input: TxInput,
    pub output: TxOutputMap,
    pub fee: f64,
    pub size: u64,
    pub is_coinbase: bool,
    #[serde(default)]
    pub fee_rate: f64,
}

impl Transaction {
    /// Cria uma transação comum do remetente para `recipient`.
    ///
    /// Seleciona UTXOs do remetente na ordem de iteração do conjunto até
    /// cobrir `amount` mais a taxa, devolve o troco ao remetente no próprio
    /// mapa de outputs e assina o mapa completo.
    ///
    /// # Errors
    ///
    /// [`ChainError::InsufficientFunds`] se os UTXOs do remetente não cobrem
    /// valor e taxa; [`ChainError::InvalidTransaction`] para parâmetros
    /// inválidos
    pub fn create(
        sender: &Wallet,
        utxo_set: &UtxoSet,
        recipient: &str,
        amount: f64,
        fee_rate: f64,
    ) -> Result<Self> {
        if amount <= 0.0 {
            return Err(ChainError::InvalidTransaction(
                "valor deve ser positivo".to_string(),
            ));
        }
        if recipient == sender.address() {
            return Err(ChainError::InvalidTransaction(
                "não é possível enviar para o próprio endereço".to_string(),
            ));
        }

        let mut outgoing = TxOutputMap::new();
        outgoing.insert(recipient.to_string(), amount);

        let funded = fund_outputs(sender, utxo_set, &outgoing, fee_rate)?;

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            input: TxInput::Standard(funded.input),
            output: funded.output,
            fee: funded.fee,
            size: funded.size,
            is_coinbase: false,
            fee_rate: funded.fee_rate,
        })
    }

    /// Emenda uma transação ainda no mempool, acrescentando `amount` ao
    /// destinatário e somando `fee_rate` à taxa por byte.
    ///
    /// O mapa de outputs completo é re-assinado com timestamp novo, o que
    /// permite que a versão emendada substitua a antiga pela regra de
    /// timestamp mais recente.
    ///
    /// # Errors
    ///
    /// Retorna erro se a transação for coinbase, pertencer a outro endereço
    /// ou os fundos não cobrirem o novo total
    pub fn update(
        &mut self,
        sender: &Wallet,
        utxo_set: &UtxoSet,
        recipient: &str,
        amount: f64,
        fee_rate: f64,
    ) -> Result<()> {
        let TxInput::Standard(ref input) = self.input else {
            return Err(ChainError::InvalidTransaction(
                "coinbase não pode ser emendada".to_string(),
            ));
        };
        if input.address != sender.address() {
            return Err(ChainError::InvalidTransaction(
                "transação pertence a outro endereço".to_string(),
            ));
        }
        if amount <= 0.0 || fee_rate < 0.0 {
            return Err(ChainError::InvalidTransaction(
                "parâmetros de emenda inválidos".to_string(),
            ));
        }
        if recipient == sender.address() {
            return Err(ChainError::InvalidTransaction(
                "não é possível enviar para o próprio endereço".to_string(),
            ));
        }

        // Outputs que saem da carteira: tudo menos o troco atual
        let mut outgoing: TxOutputMap = self
            .output
            .iter()
            .filter(|(addr, _)| addr.as_str() != sender.address())
            .map(|(addr, value)| (addr.clone(), *value))
            .collect();
        *outgoing.entry(recipient.to_string()).or_insert(0.0) += amount;

        let funded = fund_outputs(sender, utxo_set, &outgoing, self.fee_rate + fee_rate)?;

        self.input = TxInput::Standard(funded.input);
        self.output = funded.output;
        self.fee = funded.fee;
        self.size = funded.size;
        self.fee_rate = funded.fee_rate;
        Ok(())
    }

    /// Cria a coinbase de um bloco na altura dada.
    ///
    /// # Errors
    ///
    /// [`ChainError::InvalidCoinbase`] se subsídio + taxas não for positivo
    pub fn create_coinbase(
        miner_address: &str,
        block_height: u64,
        total_fees: f64,
    ) -> Result<Self> {
        let subsidy = block_subsidy(block_height);
        let total_reward = subsidy + total_fees;
        if total_reward <= 0.0 {
            return Err(ChainError::InvalidCoinbase(
                "recompensa total deve ser positiva".to_string(),
            ));
        }

        let input = CoinbaseInput {
            timestamp: now_nanos(),
            address: COINBASE_ADDRESS.to_string(),
            public_key: COINBASE_ADDRESS.to_string(),
            signature: COINBASE_ADDRESS.to_string(),
            coinbase_data: format!("Height:{block_height}"),
            block_height,
            subsidy,
            fees: total_fees,
        };

        let mut output = TxOutputMap::new();
        output.insert(miner_address.to_string(), total_reward);

        Ok(Self {
            id: format!("coinbase_{}", Uuid::new_v4()),
            input: TxInput::Coinbase(input),
            output,
            fee: 0.0,
            size: BASE_TX_SIZE,
            is_coinbase: true,
            fee_rate: 0.0,
        })
    }

    /// Valida a transação. Com um conjunto UTXO disponível, também confere
    /// que cada `prev_tx_id` existe e contém um output do remetente.
    ///
    /// # Errors
    ///
    /// [`ChainError::InvalidCoinbase`], [`ChainError::InvalidSignature`],
    /// [`ChainError::InsufficientInput`] ou
    /// [`ChainError::InvalidUtxoReference`] conforme a regra violada
    pub fn is_valid(&self, utxo_set: Option<&UtxoSet>) -> Result<()> {
        match &self.input {
            TxInput::Coinbase(input) => {
                if !self.is_coinbase {
                    return Err(ChainError::InvalidCoinbase(
                        "input coinbase em transação comum".to_string(),
                    ));
                }
                let mut outputs = self.output.iter();
                let Some((_, &value)) = outputs.next() else {
                    return Err(ChainError::InvalidCoinbase("sem outputs".to_string()));
                };
                if outputs.next().is_some() {
                    return Err(ChainError::InvalidCoinbase(
                        "coinbase deve ter exatamente um output".to_string(),
                    ));
                }
                if value <= 0.0 {
                    return Err(ChainError::InvalidCoinbase(
                        "output deve ser positivo".to_string(),
                    ));
                }
                let ceiling = block_subsidy(input.block_height) + input.fees;
                if value > ceiling + AMOUNT_EPSILON {
                    return Err(ChainError::InvalidCoinbase(format!(
                        "output {value} excede subsídio + taxas {ceiling}"
                    )));
                }
                Ok(())
            }
            TxInput::Standard(input) => {
                if self.is_coinbase {
                    return Err(ChainError::InvalidCoinbase(
                        "marcador coinbase em input comum".to_string(),
                    ));
                }
                let output_total = self.total_output();
                if output_total < 0.0 || input.amount < 0.0 {
                    return Err(ChainError::InvalidTransaction(
                        "valores negativos".to_string(),
                    ));
                }
                if self.fee + AMOUNT_EPSILON < MIN_FEE {
                    return Err(ChainError::InvalidTransaction(format!(
                        "taxa {} abaixo do mínimo {MIN_FEE}",
                        self.fee
                    )));
                }
                if input.amount + AMOUNT_EPSILON < output_total + self.fee {
                    return Err(ChainError::InsufficientInput(format!(
                        "input {} < outputs {output_total} + taxa {}",
                        input.amount, self.fee
                    )));
                }
                if !verify_signature(&input.public_key, &self.output, &input.signature) {
                    return Err(ChainError::InvalidSignature);
                }
                if input.prev_tx_ids.is_empty() {
                    return Err(ChainError::InvalidTransaction(
                        "input sem prev_tx_ids".to_string(),
                    ));
                }
                if let Some(utxo_set) = utxo_set {
                    for prev_tx_id in &input.prev_tx_ids {
                        let Some(outputs) = utxo_set.get(prev_tx_id) else {
                            return Err(ChainError::InvalidUtxoReference(prev_tx_id.clone()));
                        };
                        if !outputs.contains_key(&input.address) {
                            return Err(ChainError::InvalidUtxoReference(format!(
                                "{prev_tx_id} não pertence a {}",
                                input.address
                            )));
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Soma de todos os outputs
    #[must_use]
    pub fn total_output(&self) -> f64 {
        self.output.values().sum()
    }

    /// Timestamp do input
    #[must_use]
    pub const fn timestamp(&self) -> u64 {
        self.input.timestamp()
    }
}

struct FundedTx {
    input: StandardInput,
    output: TxOutputMap,
    fee: f64,
    size: u64,
    fee_rate: f64,
}

/// Seleciona UTXOs do remetente até cobrir `outgoing` + taxa, monta o mapa
/// final com troco e assina.
fn fund_outputs(
    sender: &Wallet,
    utxo_set: &UtxoSet,
    outgoing: &TxOutputMap,
    fee_rate: f64,
) -> Result<FundedTx> {
    let fee_rate = fee_rate.max(MIN_FEE / BASE_TX_SIZE as f64);
    let outgoing_total: f64 = outgoing.values().sum();

    // Candidatos na ordem de iteração do conjunto UTXO
    let candidates: Vec<(TxId, f64)> = utxo_set
        .iter()
        .flat_map(|(tx_id, outputs)| {
            outputs
                .iter()
                .filter(|(addr, _)| addr.as_str() == sender.address())
                .map(|(_, value)| (tx_id.clone(), *value))
        })
        .collect();
    let available: f64 = candidates.iter().map(|(_, value)| value).sum();

    let mut total = 0.0;
    let mut selected = 0usize;
    let mut take_until = |target: f64, total: &mut f64, selected: &mut usize| {
        while *total + AMOUNT_EPSILON < target && *selected < candidates.len() {
            *total += candidates[*selected].1;
            *selected += 1;
        }
        *total + AMOUNT_EPSILON >= target
    };

    // Primeira passada com a taxa provisória do tamanho-base
    let mut fee = (BASE_TX_SIZE as f64 * fee_rate).max(MIN_FEE);
    if !take_until(outgoing_total + fee, &mut total, &mut selected) {
        return Err(ChainError::InsufficientFunds {
            available,
            required: outgoing_total + fee,
        });
    }

    // Tamanho estimado com um rascunho do input; a assinatura tem
    // comprimento fixo, então o placeholder não distorce a conta
    let prev_tx_ids: Vec<TxId> = candidates[..selected]
        .iter()
        .map(|(id, _)| id.clone())
        .collect();
    let draft = StandardInput {
        timestamp: now_nanos(),
        amount: total,
        address: sender.address().to_string(),
        public_key: sender.public_key_pem().to_string(),
        signature: Signature {
            r: "0".repeat(64),
            s: "0".repeat(64),
        },
        prev_tx_ids,
    };
    let mut draft_output = outgoing.clone();
    draft_output.insert(sender.address().to_string(), 0.0);
    let size = estimate_size(&draft, &draft_output)?;
    fee = (size as f64 * fee_rate).max(MIN_FEE);

    // A taxa final pode exigir mais UTXOs que a provisória
    if !take_until(outgoing_total + fee, &mut total, &mut selected) {
        return Err(ChainError::InsufficientFunds {
            available,
            required: outgoing_total + fee,
        });
    }

    let change = total - outgoing_total - fee;
    let mut output = outgoing.clone();
    output.insert(sender.address().to_string(), change.max(0.0));

    let signature = sender.sign(&output)?;
    let input = StandardInput {
        timestamp: now_nanos(),
        amount: total,
        address: sender.address().to_string(),
        public_key: sender.public_key_pem().to_string(),
        signature,
        prev_tx_ids: candidates[..selected]
            .iter()
            .map(|(id, _)| id.clone())
            .collect(),
    };

    Ok(FundedTx {
        input,
        output,
        fee,
        size,
        fee_rate,
    })
}

/// Tamanho serializado de input + outputs, com piso em `BASE_TX_SIZE`
fn estimate_size(input: &StandardInput, output: &TxOutputMap) -> Result<u64> {
    let input_len = canonical_json(input)?.len();
    let output_len = canonical_json(output)?.len();
    Ok(((input_len + output_len) as u64).max(BASE_TX_SIZE))
}
