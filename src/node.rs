//! Contexto do nó: colaboradores compartilhados entre a superfície HTTP e o
//! runtime de gossip.
//!
//! A disciplina de acesso segue um escritor único por operação: os locks são
//! tomados por trechos curtos e nunca atravessam um `await`. O caminho de
//! broadcast a partir de um handler HTTP atravessa um canal de comandos e
//! espera o sinal de conclusão do runtime de gossip.

use ember_core::{Block, Blockchain, FeeRateEstimator, Transaction, TransactionPool, Wallet};
use parking_lot::RwLock;
use shared::{ChainError, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Trabalho que a camada HTTP enfileira para o runtime de gossip
#[derive(Debug)]
pub enum GossipCommand {
    BroadcastTransaction {
        transaction: Transaction,
        done: oneshot::Sender<()>,
    },
    BroadcastBlock {
        block: Block,
        done: oneshot::Sender<()>,
    },
}

/// Estado compartilhado do nó
pub struct NodeState {
    pub blockchain: RwLock<Blockchain>,
    pub mempool: RwLock<TransactionPool>,
    pub wallet: RwLock<Option<Wallet>>,
    pub fee_estimator: RwLock<FeeRateEstimator>,
    gossip_tx: RwLock<Option<mpsc::UnboundedSender<GossipCommand>>>,
}

pub type SharedNode = Arc<NodeState>;

impl NodeState {
    #[must_use]
    pub fn new() -> SharedNode {
        Arc::new(Self {
            blockchain: RwLock::new(Blockchain::new()),
            mempool: RwLock::new(TransactionPool::new()),
            wallet: RwLock::new(None),
            fee_estimator: RwLock::new(FeeRateEstimator::new()),
            gossip_tx: RwLock::new(None),
        })
    }

    /// Conecta o canal de comandos do runtime de gossip
    pub fn attach_gossip(&self, sender: mpsc::UnboundedSender<GossipCommand>) {
        *self.gossip_tx.write() = Some(sender);
    }

    /// Enfileira o broadcast de uma transação e espera a conclusão.
    ///
    /// # Errors
    ///
    /// [`ChainError::LoopUnavailable`] se o runtime de gossip não estiver
    /// rodando
    pub async fn broadcast_transaction(&self, transaction: Transaction) -> Result<()> {
        self.dispatch(|done| GossipCommand::BroadcastTransaction { transaction, done })
            .await
    }

    /// Enfileira o broadcast de um bloco e espera a conclusão.
    ///
    /// # Errors
    ///
    /// [`ChainError::LoopUnavailable`] se o runtime de gossip não estiver
    /// rodando
    pub async fn broadcast_block(&self, block: Block) -> Result<()> {
        self.dispatch(|done| GossipCommand::BroadcastBlock { block, done })
            .await
    }

    async fn dispatch<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<()>) -> GossipCommand,
    {
        let sender = self
            .gossip_tx
            .read()
            .clone()
            .ok_or(ChainError::LoopUnavailable)?;
        let (done, wait) = oneshot::channel();
        sender
            .send(build(done))
            .map_err(|_| ChainError::LoopUnavailable)?;
        wait.await.map_err(|_| ChainError::LoopUnavailable)
    }
}
