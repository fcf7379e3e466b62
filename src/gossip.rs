//! Runtime de gossip do Embercoin sobre WebSockets.
//!
//! Um envelope JSON por frame: `{"type": ..., "data": ..., "from": ...}`.
//! Cada conexão tem uma tarefa de leitura (este módulo) e uma de escrita
//! alimentada por um canal; mensagens de um mesmo peer são processadas na
//! ordem de chegada. Tipos desconhecidos são ignorados e falhas de validação
//! nunca são propagadas de volta ao peer: a mensagem ofensora é descartada
//! com log.

use crate::node::{GossipCommand, SharedNode};
use ember_core::config::AMOUNT_EPSILON;
use ember_core::{Block, Blockchain, PoolUpdate, Transaction, TxId, TxInput};
use futures::{SinkExt, StreamExt};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared::{ChainError, Result};
use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tentativas de conexão antes de desistir de um peer
pub const MAX_CONNECT_RETRIES: u32 = 3;

/// Espera entre tentativas de conexão
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Intervalo mínimo entre pedidos de mempool a peers
pub const TX_POOL_COOLDOWN: Duration = Duration::from_secs(5);

/// Limite do conjunto de transações já processadas (LRU)
const PROCESSED_TX_CAP: usize = 10_000;

/// Mensagens trocadas entre peers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GossipMessage {
    #[serde(rename = "NEW_BLOCK")]
    NewBlock(Block),
    #[serde(rename = "NEW_TX")]
    NewTx(Transaction),
    #[serde(rename = "REQUEST_CHAIN")]
    RequestChain,
    #[serde(rename = "RESPONSE_CHAIN")]
    ResponseChain(Vec<Block>),
    #[serde(rename = "REQUEST_TX_POOL")]
    RequestTxPool,
    #[serde(rename = "RESPONSE_TX_POOL")]
    ResponseTxPool(Vec<Transaction>),
    #[serde(rename = "REQUEST_CHAIN_LENGTH")]
    RequestChainLength,
    #[serde(rename = "RESPONSE_CHAIN_LENGTH")]
    ResponseChainLength(usize),
    #[serde(rename = "REQUEST_BLOCKS")]
    RequestBlocks(usize),
    #[serde(rename = "RESPONSE_BLOCKS")]
    ResponseBlocks(Vec<Block>),
    #[serde(rename = "REQUEST_TX")]
    RequestTx(TxId),
    #[serde(rename = "RESPONSE_TX")]
    ResponseTx(Transaction),
    #[serde(rename = "REGISTER_PEER")]
    RegisterPeer(String),
    #[serde(rename = "PEER_LIST")]
    PeerList(Vec<String>),
}

/// Envelope de fio: mensagem etiquetada mais o id do nó de origem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub message: GossipMessage,
    pub from: String,
}

/// Configuração do runtime de gossip
#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub listen_port: u16,
    /// URI pela qual outros nós nos alcançam
    pub my_uri: String,
    pub boot_node: String,
    pub peers_file: PathBuf,
}

/// Um peer conectado, endereçado pelo canal da sua tarefa de escrita
#[derive(Debug, Clone)]
pub struct Peer {
    pub uri: String,
    pub sender: mpsc::UnboundedSender<Message>,
}

struct GossipState {
    peers: HashMap<String, mpsc::UnboundedSender<Message>>,
    known_peers: BTreeSet<String>,
    processed_transactions: LruCache<TxId, ()>,
    syncing_chain: bool,
    tx_pool_syncing: bool,
    last_tx_pool_request: Option<Instant>,
}

/// Motor de gossip: registro de peers, despacho de mensagens e a máquina de
/// estados de sincronização {parado, sincronizando cadeia, sincronizando
/// mempool}
pub struct GossipEngine {
    node: SharedNode,
    config: GossipConfig,
    node_id: String,
    state: Mutex<GossipState>,
}

impl GossipEngine {
    #[must_use]
    pub fn new(node: SharedNode, config: GossipConfig) -> Arc<Self> {
        let known_peers = load_peers(&config.peers_file);
        Arc::new(Self {
            node,
            config,
            node_id: Uuid::new_v4().to_string(),
            state: Mutex::new(GossipState {
                peers: HashMap::new(),
                known_peers,
                processed_transactions: LruCache::new(
                    NonZeroUsize::new(PROCESSED_TX_CAP).expect("capacidade não-nula"),
                ),
                syncing_chain: false,
                tx_pool_syncing: false,
                last_tx_pool_request: None,
            }),
        })
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Laço principal: aceita conexões, drena comandos da camada HTTP e
    /// encerra cooperativamente no sinal de desligamento.
    ///
    /// # Errors
    ///
    /// Retorna erro se o socket de escuta não puder ser aberto
    pub async fn run(
        self: Arc<Self>,
        mut commands: mpsc::UnboundedReceiver<GossipCommand>,
    ) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.listen_port))
            .await
            .map_err(|e| ChainError::NetworkError(e.to_string()))?;
        info!(
            port = self.config.listen_port,
            uri = %self.config.my_uri,
            "🌐 servidor de gossip ouvindo"
        );

        self.clone().spawn_peer_discovery();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let engine = self.clone();
                        tokio::spawn(async move {
                            engine.handle_inbound(stream, addr.to_string()).await;
                        });
                    }
                    Err(e) => warn!("falha ao aceitar conexão: {e}"),
                },
                command = commands.recv() => match command {
                    Some(GossipCommand::BroadcastTransaction { transaction, done }) => {
                        self.broadcast(&GossipMessage::NewTx(transaction), None);
                        let _ = done.send(());
                    }
                    Some(GossipCommand::BroadcastBlock { block, done }) => {
                        self.broadcast(&GossipMessage::NewBlock(block), None);
                        let _ = done.send(());
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("🛑 sinal de desligamento recebido, encerrando gossip");
                    break;
                }
            }
        }

        // Derrubar os canais de escrita encerra as tarefas de cada conexão
        self.state.lock().peers.clear();
        info!("👋 runtime de gossip encerrado");
        Ok(())
    }

    /// Registro com o boot node e discagem dos peers persistidos
    fn spawn_peer_discovery(self: Arc<Self>) {
        if self.config.my_uri != self.config.boot_node {
            let engine = self.clone();
            let boot = self.config.boot_node.clone();
            tokio::spawn(async move {
                engine.connect_to_peer(boot, true).await;
            });
        }
        let known: Vec<String> = self.state.lock().known_peers.iter().cloned().collect();
        for uri in known {
            if uri != self.config.my_uri {
                let engine = self.clone();
                tokio::spawn(async move {
                    engine.connect_to_peer(uri, false).await;
                });
            }
        }
    }

    async fn handle_inbound(self: Arc<Self>, stream: TcpStream, addr: String) {
        match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => {
                let uri = format!("ws://{addr}");
                self.handle_connection(ws, uri, false).await;
            }
            Err(e) => warn!(peer = %addr, "handshake WebSocket falhou: {e}"),
        }
    }

    /// Disca um peer com até [`MAX_CONNECT_RETRIES`] tentativas; no
    /// esgotamento o URI é removido de `known_peers` e persistido.
    pub fn connect_to_peer(
        self: Arc<Self>,
        uri: String,
        register: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            for attempt in 1..=MAX_CONNECT_RETRIES {
                if self.state.lock().peers.contains_key(&uri) {
                    return;
                }
                match tokio_tungstenite::connect_async(&uri).await {
                    Ok((ws, _)) => {
                        info!(peer = %uri, "conectado");
                        self.clone().handle_connection(ws, uri.clone(), register).await;
                        // Conexão terminou; o peer pode ter caído de vez
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                    Err(e) => {
                        warn!(peer = %uri, attempt, "falha ao conectar: {e}");
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
            warn!(peer = %uri, "{}", ChainError::MaxRetries(uri.clone()));
            let known = {
                let mut state = self.state.lock();
                state.known_peers.remove(&uri);
                state.known_peers.clone()
            };
            save_peers(&self.config.peers_file, &known);
        })
    }

    /// Trata uma conexão estabelecida (qualquer direção): registra o peer,
    /// dispara os pedidos de abertura e processa mensagens até a queda.
    async fn handle_connection<S>(
        self: Arc<Self>,
        ws: WebSocketStream<S>,
        uri: String,
        register: bool,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (sender, mut outbound) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        self.state.lock().peers.insert(uri.clone(), sender.clone());
        info!(peer = %uri, "peer registrado");

        let peer = Peer {
            uri: uri.clone(),
            sender,
        };
        if register {
            self.send_to(&peer, &GossipMessage::RegisterPeer(self.config.my_uri.clone()));
        }
        self.on_connection_established(&peer);

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) => self.handle_message(envelope.message, &peer).await,
                    // Tipos desconhecidos e JSON malformado são ignorados
                    Err(e) => debug!(peer = %uri, "mensagem ignorada: {e}"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(peer = %uri, "conexão caiu: {e}");
                    break;
                }
            }
        }

        info!(peer = %uri, "peer desconectado");
        self.remove_peer(&uri);
        drop(peer);
        let _ = writer.await;
    }

    /// Pedidos de abertura: comprimento da cadeia sempre; mempool sujeito ao
    /// cooldown e à flag de sincronização
    fn on_connection_established(&self, peer: &Peer) {
        self.send_to(peer, &GossipMessage::RequestChainLength);
        self.maybe_request_tx_pool(Some(peer));
    }

    /// Processa uma mensagem recebida de `peer`
    pub async fn handle_message(self: &Arc<Self>, message: GossipMessage, peer: &Peer) {
        match message {
            GossipMessage::NewBlock(block) => self.on_new_block(block, peer).await,
            GossipMessage::NewTx(transaction) => self.on_new_tx(transaction, Some(&peer.uri)),
            GossipMessage::RequestChain => {
                let chain = self.node.blockchain.read().chain().to_vec();
                self.send_to(peer, &GossipMessage::ResponseChain(chain));
            }
            GossipMessage::ResponseChain(blocks) => {
                let local_len = self.node.blockchain.read().len();
                let start_sync = {
                    let mut state = self.state.lock();
                    if blocks.len() > local_len && !state.syncing_chain {
                        state.syncing_chain = true;
                        true
                    } else {
                        false
                    }
                };
                if !start_sync {
                    debug!("cadeia recebida não é mais longa ou já sincronizando");
                    return;
                }
                match self.try_replace_chain(blocks).await {
                    Ok(()) => self.maybe_request_tx_pool(None),
                    Err(e) => warn!("cadeia recebida rejeitada: {e}"),
                }
                self.state.lock().syncing_chain = false;
            }
            GossipMessage::RequestTxPool => {
                let pool = self.node.mempool.read().transaction_data();
                self.send_to(peer, &GossipMessage::ResponseTxPool(pool));
            }
            GossipMessage::ResponseTxPool(transactions) => {
                self.on_tx_pool_response(transactions);
            }
            GossipMessage::RequestChainLength => {
                let len = self.node.blockchain.read().len();
                self.send_to(peer, &GossipMessage::ResponseChainLength(len));
            }
            GossipMessage::ResponseChainLength(peer_len) => {
                let local_len = self.node.blockchain.read().len();
                let request = {
                    let mut state = self.state.lock();
                    if peer_len > local_len && !state.syncing_chain {
                        state.syncing_chain = true;
                        true
                    } else {
                        false
                    }
                };
                if request {
                    debug!(peer_len, local_len, "peer tem cadeia mais longa, pedindo blocos");
                    self.send_to(peer, &GossipMessage::RequestBlocks(local_len));
                }
            }
            GossipMessage::RequestBlocks(start_index) => {
                let blockchain = self.node.blockchain.read();
                let blocks = blockchain
                    .chain()
                    .get(start_index.min(blockchain.len())..)
                    .unwrap_or_default()
                    .to_vec();
                drop(blockchain);
                self.send_to(peer, &GossipMessage::ResponseBlocks(blocks));
            }
            GossipMessage::ResponseBlocks(blocks) => {
                if blocks.is_empty() {
                    self.state.lock().syncing_chain = false;
                    return;
                }
                let mut candidate = self.node.blockchain.read().chain().to_vec();
                candidate.extend(blocks);
                match self.try_replace_chain(candidate).await {
                    Ok(()) => self.maybe_request_tx_pool(None),
                    Err(e) => warn!("blocos recebidos rejeitados: {e}"),
                }
                self.state.lock().syncing_chain = false;
            }
            GossipMessage::RequestTx(tx_id) => {
                let found = self.node.mempool.read().get(&tx_id).cloned();
                if let Some(transaction) = found {
                    self.send_to(peer, &GossipMessage::ResponseTx(transaction));
                } else {
                    debug!(%tx_id, "transação pedida não está no mempool");
                }
            }
            GossipMessage::ResponseTx(transaction) => {
                // Transação que faltava para processar um bloco ofertado
                self.on_new_tx(transaction, None);
            }
            GossipMessage::RegisterPeer(uri) => {
                let known = {
                    let mut state = self.state.lock();
                    if uri != self.config.my_uri {
                        state.known_peers.insert(uri.clone());
                    }
                    state.known_peers.clone()
                };
                save_peers(&self.config.peers_file, &known);
                info!(peer = %uri, "peer registrado no diretório");
                self.send_to(peer, &GossipMessage::PeerList(known.into_iter().collect()));
            }
            GossipMessage::PeerList(uris) => {
                for uri in uris {
                    let fresh = {
                        let mut state = self.state.lock();
                        if uri != self.config.my_uri
                            && uri != self.node_id
                            && !state.peers.contains_key(&uri)
                            && !state.known_peers.contains(&uri)
                        {
                            state.known_peers.insert(uri.clone());
                            Some(state.known_peers.clone())
                        } else {
                            None
                        }
                    };
                    if let Some(known) = fresh {
                        save_peers(&self.config.peers_file, &known);
                        let engine = self.clone();
                        tokio::spawn(async move {
                            engine.connect_to_peer(uri, false).await;
                        });
                    }
                }
            }
        }
    }

    /// NEW_BLOCK: descarta duplicata, pede transações que faltam e tenta a
    /// substituição de cadeia com o bloco anexado
    async fn on_new_block(self: &Arc<Self>, block: Block, peer: &Peer) {
        let mut missing_tx: Option<TxId> = None;
        let candidate = {
            let blockchain = self.node.blockchain.read();
            if block.hash == blockchain.last_block().hash {
                debug!("bloco duplicado, descartando");
                return;
            }
            'txs: for tx in &block.data {
                if let TxInput::Standard(input) = &tx.input {
                    let mut referenced = 0.0;
                    for prev_tx_id in &input.prev_tx_ids {
                        match blockchain.utxo_set().get(prev_tx_id) {
                            Some(outputs) if outputs.contains_key(&input.address) => {
                                referenced += outputs[&input.address];
                            }
                            _ => {
                                missing_tx = Some(prev_tx_id.clone());
                                break 'txs;
                            }
                        }
                    }
                    if input.amount > referenced + AMOUNT_EPSILON {
                        warn!(
                            tx_id = %tx.id,
                            "input declara {} mas os UTXOs somam {referenced}, bloco descartado",
                            input.amount
                        );
                        return;
                    }
                }
            }
            let mut candidate = blockchain.chain().to_vec();
            candidate.push(block.clone());
            candidate
        };

        if let Some(tx_id) = missing_tx {
            debug!(%tx_id, "transação desconhecida, pedindo ao peer antes do bloco");
            self.send_to(peer, &GossipMessage::RequestTx(tx_id));
            return;
        }

        match self.try_replace_chain(candidate).await {
            Ok(()) => {
                info!(hash = %block.hash, height = block.height, "✅ bloco aceito");
                self.broadcast(&GossipMessage::NewBlock(block), Some(&peer.uri));
            }
            Err(e) => warn!(hash = %block.hash, "bloco rejeitado: {e}"),
        }
    }

    /// NEW_TX / RESPONSE_TX: deduplicação por (id, timestamp) e rebroadcast
    fn on_new_tx(self: &Arc<Self>, transaction: Transaction, exclude: Option<&str>) {
        let tx_id = transaction.id.clone();
        let exists = self.node.mempool.read().contains(&tx_id);
        let processed = self
            .state
            .lock()
            .processed_transactions
            .contains(&tx_id);

        if exists {
            match self.node.mempool.write().set_transaction(transaction.clone()) {
                Ok(PoolUpdate::Replaced) => {
                    debug!(%tx_id, "versão mais nova substituiu a pendente");
                    self.broadcast(&GossipMessage::NewTx(transaction), exclude);
                    self.maybe_request_tx_pool(None);
                }
                Ok(_) => debug!(%tx_id, "versão recebida não é mais nova"),
                Err(e) => warn!(%tx_id, "atualização rejeitada: {e}"),
            }
        } else if !processed {
            match self.node.mempool.write().set_transaction(transaction.clone()) {
                Ok(PoolUpdate::Inserted) => {
                    self.state.lock().processed_transactions.put(tx_id, ());
                    self.broadcast(&GossipMessage::NewTx(transaction), exclude);
                    self.maybe_request_tx_pool(None);
                }
                Ok(_) => {}
                Err(e) => warn!(%tx_id, "transação rejeitada: {e}"),
            }
        }
    }

    /// RESPONSE_TX_POOL: só é aceito durante a sincronização de mempool
    fn on_tx_pool_response(self: &Arc<Self>, transactions: Vec<Transaction>) {
        if !self.state.lock().tx_pool_syncing {
            debug!("RESPONSE_TX_POOL fora de sincronização, ignorando");
            return;
        }

        let mut added = 0usize;
        for transaction in transactions {
            let tx_id = transaction.id.clone();
            let exists = self.node.mempool.read().contains(&tx_id);
            let processed = self
                .state
                .lock()
                .processed_transactions
                .contains(&tx_id);
            let outcome = if exists {
                self.node.mempool.write().set_transaction(transaction)
            } else if !processed {
                self.node.mempool.write().set_transaction(transaction)
            } else {
                continue;
            };
            match outcome {
                Ok(PoolUpdate::Inserted) => {
                    self.state.lock().processed_transactions.put(tx_id, ());
                    added += 1;
                }
                Ok(PoolUpdate::Replaced) => added += 1,
                Ok(PoolUpdate::IgnoredOlder) => {}
                Err(e) => warn!("transação do pool do peer rejeitada: {e}"),
            }
        }

        if added == 0 {
            self.state.lock().tx_pool_syncing = false;
            return;
        }
        debug!(added, "transações absorvidas do pool do peer");
        // Houve novidade: repedir, respeitando o cooldown
        let again = {
            let mut state = self.state.lock();
            let elapsed = state
                .last_tx_pool_request
                .is_none_or(|at| at.elapsed() > TX_POOL_COOLDOWN);
            if elapsed {
                state.last_tx_pool_request = Some(Instant::now());
                true
            } else {
                false
            }
        };
        if again {
            self.broadcast(&GossipMessage::RequestTxPool, None);
        }
    }

    /// Valida e adota uma cadeia candidata fora do laço de gossip, trocando
    /// cadeia e UTXO atomicamente e limpando o mempool das confirmadas.
    async fn try_replace_chain(self: &Arc<Self>, candidate: Vec<Block>) -> Result<()> {
        let snapshot = self.node.blockchain.read().clone();
        let validated = tokio::task::spawn_blocking(move || {
            let mut chain = snapshot;
            chain.replace_chain(candidate)?;
            Ok::<Blockchain, ChainError>(chain)
        })
        .await
        .map_err(|e| ChainError::NetworkError(format!("validação abortada: {e}")))??;

        {
            let mut blockchain = self.node.blockchain.write();
            if validated.len() <= blockchain.len() {
                // Outra cadeia chegou primeiro enquanto validávamos
                return Err(ChainError::ChainTooShort);
            }
            *blockchain = validated;
        }

        let chain = self.node.blockchain.read().chain().to_vec();
        self.node.mempool.write().clear_blockchain_transactions(&chain);
        Ok(())
    }

    /// Dispara REQUEST_TX_POOL (a um peer ou em broadcast) se não estivermos
    /// sincronizando mempool e o cooldown tiver passado
    fn maybe_request_tx_pool(&self, peer: Option<&Peer>) {
        let fire = {
            let mut state = self.state.lock();
            let elapsed = state
                .last_tx_pool_request
                .is_none_or(|at| at.elapsed() > TX_POOL_COOLDOWN);
            if !state.tx_pool_syncing && elapsed {
                state.tx_pool_syncing = true;
                state.last_tx_pool_request = Some(Instant::now());
                true
            } else {
                false
            }
        };
        if fire {
            match peer {
                Some(peer) => self.send_to(peer, &GossipMessage::RequestTxPool),
                None => self.broadcast(&GossipMessage::RequestTxPool, None),
            }
        }
    }

    /// Envia uma mensagem a um peer específico; falha remove o peer
    pub fn send_to(&self, peer: &Peer, message: &GossipMessage) {
        if peer.sender.send(self.envelope(message)).is_err() {
            warn!(peer = %peer.uri, "{}", ChainError::PeerSendFailed(peer.uri.clone()));
            self.remove_peer(&peer.uri);
        }
    }

    /// Envia a todos os peers conectados, exceto `exclude`
    pub fn broadcast(&self, message: &GossipMessage, exclude: Option<&str>) {
        let targets: Vec<(String, mpsc::UnboundedSender<Message>)> = self
            .state
            .lock()
            .peers
            .iter()
            .filter(|(uri, _)| exclude != Some(uri.as_str()))
            .map(|(uri, sender)| (uri.clone(), sender.clone()))
            .collect();

        let frame = self.envelope(message);
        for (uri, sender) in targets {
            if sender.send(frame.clone()).is_err() {
                warn!(peer = %uri, "{}", ChainError::PeerSendFailed(uri.clone()));
                self.remove_peer(&uri);
            }
        }
    }

    fn envelope(&self, message: &GossipMessage) -> Message {
        let envelope = Envelope {
            message: message.clone(),
            from: self.node_id.clone(),
        };
        Message::Text(
            serde_json::to_string(&envelope).unwrap_or_else(|_| String::from("{}")),
        )
    }

    /// Remove um peer do registro e da lista persistida
    pub fn remove_peer(&self, uri: &str) {
        let known = {
            let mut state = self.state.lock();
            state.peers.remove(uri);
            state.known_peers.remove(uri);
            state.known_peers.clone()
        };
        save_peers(&self.config.peers_file, &known);
        info!(peer = %uri, "peer removido");
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    #[cfg(test)]
    fn sync_flags(&self) -> (bool, bool) {
        let state = self.state.lock();
        (state.syncing_chain, state.tx_pool_syncing)
    }
}

/// Carrega a lista de peers persistida; arquivo ausente é lista vazia
fn load_peers(path: &PathBuf) -> BTreeSet<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
        Err(_) => BTreeSet::new(),
    }
}

/// Reescreve a lista de peers atomicamente (arquivo temporário + rename)
fn save_peers(path: &PathBuf, peers: &BTreeSet<String>) {
    let Ok(serialized) = serde_json::to_string(&peers.iter().collect::<Vec<_>>()) else {
        return;
    };
    let tmp = path.with_extension("json.tmp");
    if let Err(e) = std::fs::write(&tmp, serialized).and_then(|()| std::fs::rename(&tmp, path)) {
        warn!("falha ao persistir peers: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeState;
    use ember_core::wallet::calculate_balance;
    use ember_core::Wallet;

    fn test_engine() -> (Arc<GossipEngine>, SharedNode) {
        let node = NodeState::new();
        let config = GossipConfig {
            listen_port: 0,
            my_uri: "ws://127.0.0.1:5001".to_string(),
            boot_node: "ws://127.0.0.1:9000".to_string(),
            peers_file: std::env::temp_dir().join(format!("peers-{}.json", Uuid::new_v4())),
        };
        let engine = GossipEngine::new(node.clone(), config);
        (engine, node)
    }

    fn test_peer(uri: &str) -> (Peer, mpsc::UnboundedReceiver<Message>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Peer {
                uri: uri.to_string(),
                sender,
            },
            receiver,
        )
    }

    fn drain(receiver: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Envelope> {
        let mut envelopes = Vec::new();
        while let Ok(message) = receiver.try_recv() {
            if let Message::Text(text) = message {
                envelopes.push(serde_json::from_str(&text).unwrap());
            }
        }
        envelopes
    }

    fn mine_chain(blocks: usize) -> (ember_core::Blockchain, Wallet) {
        let mut chain = ember_core::Blockchain::new();
        let miner = Wallet::new().unwrap();
        for _ in 0..blocks {
            let coinbase = Transaction::create_coinbase(
                miner.address(),
                chain.current_height() + 1,
                0.0,
            )
            .unwrap();
            chain.add_block(vec![coinbase]).unwrap();
        }
        (chain, miner)
    }

    #[test]
    fn test_envelope_wire_format() {
        let envelope = Envelope {
            message: GossipMessage::RequestBlocks(3),
            from: "nó-1".to_string(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();

        assert_eq!(json["type"], "REQUEST_BLOCKS");
        assert_eq!(json["data"], 3);
        assert_eq!(json["from"], "nó-1");
    }

    #[test]
    fn test_unknown_message_type_fails_to_parse() {
        let raw = r#"{"type":"FROBNICATE","data":null,"from":"x"}"#;
        assert!(serde_json::from_str::<Envelope>(raw).is_err());
    }

    #[tokio::test]
    async fn test_request_chain_length_is_answered() {
        let (engine, _node) = test_engine();
        let (peer, mut rx) = test_peer("ws://peer-a");

        engine
            .handle_message(GossipMessage::RequestChainLength, &peer)
            .await;

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            sent[0].message,
            GossipMessage::ResponseChainLength(1)
        ));
    }

    #[tokio::test]
    async fn test_longer_peer_chain_triggers_block_request() {
        let (engine, _node) = test_engine();
        let (peer, mut rx) = test_peer("ws://peer-a");

        engine
            .handle_message(GossipMessage::ResponseChainLength(7), &peer)
            .await;

        let sent = drain(&mut rx);
        assert!(matches!(sent[0].message, GossipMessage::RequestBlocks(1)));
        assert!(engine.sync_flags().0, "deveria estar sincronizando cadeia");

        // Um segundo anúncio durante a sincronização não dispara outro pedido
        engine
            .handle_message(GossipMessage::ResponseChainLength(9), &peer)
            .await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_request_blocks_returns_tail() {
        let (engine, node) = test_engine();
        let (chain, _) = mine_chain(2);
        *node.blockchain.write() = chain;
        let (peer, mut rx) = test_peer("ws://peer-a");

        engine
            .handle_message(GossipMessage::RequestBlocks(1), &peer)
            .await;

        let sent = drain(&mut rx);
        let GossipMessage::ResponseBlocks(blocks) = &sent[0].message else {
            panic!("esperava RESPONSE_BLOCKS");
        };
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].height, 1);
    }

    #[tokio::test]
    async fn test_response_blocks_adopts_longer_chain() {
        let (engine, node) = test_engine();
        let (remote, miner) = mine_chain(3);
        let (peer, _rx) = test_peer("ws://peer-a");

        engine
            .handle_message(GossipMessage::ResponseChainLength(remote.len()), &peer)
            .await;
        let tail = remote.chain()[1..].to_vec();
        engine
            .handle_message(GossipMessage::ResponseBlocks(tail), &peer)
            .await;

        let blockchain = node.blockchain.read();
        assert_eq!(blockchain.current_height(), 3);
        assert_eq!(
            calculate_balance(blockchain.utxo_set(), miner.address()),
            150.0
        );
        assert!(!engine.sync_flags().0, "sincronização deveria ter terminado");
    }

    #[tokio::test]
    async fn test_tampered_chain_is_rejected() {
        let (engine, node) = test_engine();
        let (remote, _) = mine_chain(3);
        let (peer, _rx) = test_peer("ws://peer-a");

        let mut tail = remote.chain()[1..].to_vec();
        tail[1].hash = "0".repeat(64);

        engine
            .handle_message(GossipMessage::ResponseBlocks(tail), &peer)
            .await;

        assert_eq!(node.blockchain.read().current_height(), 0);
        assert!(!engine.sync_flags().0);
    }

    #[tokio::test]
    async fn test_duplicate_block_is_dropped() {
        let (engine, node) = test_engine();
        let (chain, _) = mine_chain(1);
        *node.blockchain.write() = chain;
        let last = node.blockchain.read().last_block().clone();
        let (peer, mut rx) = test_peer("ws://peer-a");

        engine
            .handle_message(GossipMessage::NewBlock(last), &peer)
            .await;

        assert_eq!(node.blockchain.read().current_height(), 1);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_new_block_with_unknown_prev_tx_requests_it() {
        let (engine, node) = test_engine();

        // Cadeia remota: minera para a carteira e gasta a coinbase no bloco 2
        let mut remote = ember_core::Blockchain::new();
        let wallet = Wallet::new().unwrap();
        let coinbase1 =
            Transaction::create_coinbase(wallet.address(), 1, 0.0).unwrap();
        remote.add_block(vec![coinbase1]).unwrap();
        let spend = Transaction::create(&wallet, remote.utxo_set(), "bob", 5.0, 0.000_01).unwrap();
        let coinbase2 =
            Transaction::create_coinbase(wallet.address(), 2, spend.fee).unwrap();
        remote.add_block(vec![coinbase2, spend]).unwrap();

        let offered = remote.chain().last().unwrap().clone();
        let (peer, mut rx) = test_peer("ws://peer-a");
        engine
            .handle_message(GossipMessage::NewBlock(offered), &peer)
            .await;

        // O nó local não conhece a coinbase gasta: pede a transação e não avança
        let sent = drain(&mut rx);
        assert!(matches!(sent[0].message, GossipMessage::RequestTx(_)));
        assert_eq!(node.blockchain.read().current_height(), 0);
    }

    #[tokio::test]
    async fn test_new_tx_admitted_once() {
        let (engine, node) = test_engine();
        let (chain, wallet) = mine_chain(1);
        *node.blockchain.write() = chain;

        let utxo = node.blockchain.read().utxo_set().clone();
        let tx = Transaction::create(&wallet, &utxo, "bob", 5.0, 0.000_01).unwrap();
        let (peer, _rx) = test_peer("ws://peer-a");

        engine
            .handle_message(GossipMessage::NewTx(tx.clone()), &peer)
            .await;
        engine
            .handle_message(GossipMessage::NewTx(tx.clone()), &peer)
            .await;

        let mempool = node.mempool.read();
        assert_eq!(mempool.len(), 1);
        assert!(mempool.contains(&tx.id));
    }

    #[tokio::test]
    async fn test_newer_tx_version_replaces_pending() {
        let (engine, node) = test_engine();
        let (chain, wallet) = mine_chain(1);
        *node.blockchain.write() = chain;

        let utxo = node.blockchain.read().utxo_set().clone();
        let tx = Transaction::create(&wallet, &utxo, "bob", 5.0, 0.000_01).unwrap();
        let mut newer = tx.clone();
        newer.update(&wallet, &utxo, "bob", 2.0, 0.000_01).unwrap();

        let (peer, _rx) = test_peer("ws://peer-a");
        engine
            .handle_message(GossipMessage::NewTx(tx.clone()), &peer)
            .await;
        engine
            .handle_message(GossipMessage::NewTx(newer), &peer)
            .await;

        let mempool = node.mempool.read();
        assert_eq!(mempool.len(), 1);
        assert_eq!(mempool.get(&tx.id).unwrap().output["bob"], 7.0);
    }

    #[tokio::test]
    async fn test_register_peer_returns_directory() {
        let (engine, _node) = test_engine();
        let (peer, mut rx) = test_peer("ws://peer-a");

        engine
            .handle_message(
                GossipMessage::RegisterPeer("ws://10.0.0.7:6001".to_string()),
                &peer,
            )
            .await;

        let sent = drain(&mut rx);
        let GossipMessage::PeerList(uris) = &sent[0].message else {
            panic!("esperava PEER_LIST");
        };
        assert!(uris.contains(&"ws://10.0.0.7:6001".to_string()));
    }

    #[tokio::test]
    async fn test_tx_pool_response_ignored_when_not_syncing() {
        let (engine, node) = test_engine();
        let (chain, wallet) = mine_chain(1);
        *node.blockchain.write() = chain;
        let utxo = node.blockchain.read().utxo_set().clone();
        let tx = Transaction::create(&wallet, &utxo, "bob", 5.0, 0.000_01).unwrap();

        let (peer, _rx) = test_peer("ws://peer-a");
        engine
            .handle_message(GossipMessage::ResponseTxPool(vec![tx]), &peer)
            .await;

        assert!(node.mempool.read().is_empty());
    }
}
