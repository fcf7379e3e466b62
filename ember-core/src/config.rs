//! Constantes de consenso da rede Embercoin.
//!
//! Tudo aqui DEVE ser idêntico entre todos os nós: qualquer divergência
//! muda hashes de bloco ou regras de validação e particiona a rede.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Recompensa base por bloco, antes dos halvings
pub const BLOCK_SUBSIDY: u64 = 50;

/// Blocos entre halvings da recompensa
pub const HALVING_INTERVAL: u64 = 210_000;

/// Taxa mínima aceita em transações não-coinbase
pub const MIN_FEE: f64 = 0.001;

/// Tamanho mínimo atribuído a uma transação serializada (bytes)
pub const BASE_TX_SIZE: u64 = 250;

/// Tamanho máximo do corpo serializado de um bloco (bytes)
pub const BLOCK_SIZE_LIMIT: usize = 1_000_000;

/// Tempo alvo entre blocos, em nanossegundos
pub const TARGET_BLOCK_TIME: u64 = 60 * NANOS_PER_SEC;

/// Intervalo mínimo entre blocos antes de subir a dificuldade (ns)
pub const MINE_RATE: u64 = NANOS_PER_SEC;

/// Dificuldade do bloco gênese
pub const STARTING_DIFFICULTY: u32 = 3;

/// Janela da correção de dificuldade de longo horizonte
pub const DIFFICULTY_WINDOW: usize = 2016;

/// Endereço creditado pelo bloco gênese
pub const GENESIS_ADDRESS: &str = "20b2ee470d526eda4b12";

/// Marcador de input de coinbase
pub const COINBASE_ADDRESS: &str = "coinbase";

/// Taxa por byte usada quando o estimador ainda não tem dados
pub const DEFAULT_FEE_RATE: f64 = 0.000_01;

/// Transações no mempool a partir das quais a taxa sobe
pub const MEMPOOL_THRESHOLD: usize = 100;

/// Ocupação média de bloco a partir da qual a taxa sobe
pub const BLOCK_FULLNESS_THRESHOLD: f64 = 0.8;

/// Idade máxima da estimativa de taxa antes de recalcular (segundos)
pub const FEE_RATE_UPDATE_INTERVAL_SECS: u64 = 30;

/// Quantas transações prioritárias entram em um bloco minerado
pub const MAX_BLOCK_TXS: usize = 10;

/// Tolerância para comparações de valores fracionários
pub const AMOUNT_EPSILON: f64 = 1e-6;

/// Prioridade de uma transação submetida pela carteira
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// Multiplicador aplicado sobre a taxa estimada por byte
    #[must_use]
    pub const fn multiplier(self) -> f64 {
        match self {
            Self::Low => 1.0,
            Self::Medium => 1.5,
            Self::High => 2.0,
        }
    }
}

/// Recompensa de subsídio na altura dada (halving por deslocamento)
#[must_use]
pub fn block_subsidy(height: u64) -> f64 {
    let halvings = height / HALVING_INTERVAL;
    let subsidy = u32::try_from(halvings)
        .ok()
        .and_then(|h| BLOCK_SUBSIDY.checked_shr(h))
        .unwrap_or(0);
    subsidy as f64
}

/// Soma de subsídios emitíveis por uma cadeia de `block_count` blocos.
///
/// A época `i` cobre as alturas `[i*HALVING_INTERVAL, (i+1)*HALVING_INTERVAL)`
/// e recompensa `BLOCK_SUBSIDY >> i` por bloco.
#[must_use]
pub fn total_subsidy(block_count: u64) -> f64 {
    let mut total = 0.0;
    let mut remaining = block_count;
    let mut epoch = 0u64;
    while remaining > 0 {
        let blocks_in_epoch = remaining.min(HALVING_INTERVAL);
        total += blocks_in_epoch as f64 * block_subsidy(epoch * HALVING_INTERVAL);
        remaining -= blocks_in_epoch;
        epoch += 1;
        if block_subsidy(epoch * HALVING_INTERVAL) == 0.0 {
            break;
        }
    }
    total
}

/// Relógio do nó em nanossegundos desde a época Unix
#[must_use]
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
