use crate::block::Block;
use crate::config::{
    BLOCK_FULLNESS_THRESHOLD, BLOCK_SIZE_LIMIT, DEFAULT_FEE_RATE, FEE_RATE_UPDATE_INTERVAL_SECS,
    MEMPOOL_THRESHOLD,
};
use shared::canonical_json;
use std::time::{Duration, Instant};
use tracing::debug;

/// Estimador da taxa por byte corrente.
///
/// A estimativa parte de [`DEFAULT_FEE_RATE`] e sobe com a pressão do
/// mempool e com a ocupação média dos últimos blocos; nunca cai abaixo do
/// padrão.
#[derive(Debug, Clone)]
pub struct FeeRateEstimator {
    current_fee_rate: f64,
    last_update: Option<Instant>,
}

impl FeeRateEstimator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current_fee_rate: DEFAULT_FEE_RATE,
            last_update: None,
        }
    }

    /// Taxa por byte corrente, recalculando quando a estimativa envelheceu
    pub fn fee_rate(&mut self, mempool_size: usize, chain: &[Block]) -> f64 {
        let stale = self.last_update.is_none_or(|at| {
            at.elapsed() > Duration::from_secs(FEE_RATE_UPDATE_INTERVAL_SECS)
        });
        if stale {
            self.update(mempool_size, chain);
        }
        self.current_fee_rate
    }

    /// Recalcula a estimativa a partir do estado corrente
    pub fn update(&mut self, mempool_size: usize, chain: &[Block]) {
        let fullness = block_fullness(chain);
        let mut fee_rate = DEFAULT_FEE_RATE;

        if mempool_size > MEMPOOL_THRESHOLD {
            fee_rate *= 1.0 + (mempool_size as f64 / MEMPOOL_THRESHOLD as f64) * 0.5;
        }
        if fullness > BLOCK_FULLNESS_THRESHOLD {
            fee_rate *= 1.0 + (fullness / BLOCK_FULLNESS_THRESHOLD) * 0.3;
        }

        self.current_fee_rate = fee_rate.max(DEFAULT_FEE_RATE);
        self.last_update = Some(Instant::now());
        debug!(
            fee_rate = self.current_fee_rate,
            mempool_size, fullness, "taxa por byte atualizada"
        );
    }

    #[must_use]
    pub const fn current(&self) -> f64 {
        self.current_fee_rate
    }
}

impl Default for FeeRateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Ocupação média dos últimos 10 blocos em relação ao limite de bloco
#[must_use]
pub fn block_fullness(chain: &[Block]) -> f64 {
    let recent = if chain.len() >= 10 {
        &chain[chain.len() - 10..]
    } else {
        chain
    };
    if recent.is_empty() {
        return 0.0;
    }

    let used: usize = recent
        .iter()
        .flat_map(|block| &block.data)
        .map(|tx| canonical_json(tx).map(|json| json.len()).unwrap_or(0))
        .sum();
    used as f64 / (recent.len() * BLOCK_SIZE_LIMIT) as f64
}
