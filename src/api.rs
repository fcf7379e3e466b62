//! Superfície de controle HTTP/JSON do nó.
//!
//! Handlers finos sobre o estado compartilhado: validação devolve 400 ao
//! chamador e nunca atravessa a fronteira de gossip como falha. Mineração e
//! validação pesada rodam em `spawn_blocking`, fora do laço de I/O.

use crate::node::SharedNode;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ember_core::config::{
    block_subsidy, BLOCK_SUBSIDY, HALVING_INTERVAL, MAX_BLOCK_TXS, MIN_FEE,
};
use ember_core::fees::block_fullness;
use ember_core::{Block, Priority, Transaction, Wallet};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared::ChainError;
use tracing::{info, warn};

const DEFAULT_PAGE_SIZE: usize = 10;
const MAX_PAGE_SIZE: usize = 100;

/// Monta o roteador da API sobre o estado do nó
pub fn router(node: SharedNode) -> Router {
    Router::new()
        .route("/blockchain", get(blockchain_full))
        .route("/blockchain/paginated", get(blockchain_paginated))
        .route("/blockchain/latest", get(blockchain_latest))
        .route("/blockchain/range", get(blockchain_range))
        .route("/blockchain/height", get(blockchain_height))
        .route("/blockchain/height/:height", get(block_by_height))
        .route("/blockchain/hash/:hash", get(block_by_hash))
        .route("/blockchain/tx/:tx_id", get(block_by_tx))
        .route("/blockchain/halving", get(halving_info))
        .route("/mine", post(mine))
        .route("/wallet", post(init_wallet))
        .route("/wallet/info", get(wallet_info))
        .route("/wallet/transact", post(wallet_transact))
        .route("/transaction", get(transaction_pool))
        .route("/transactions/:address", get(transactions_by_address))
        .route("/transaction/id/:tx_id", get(transaction_by_id))
        .route("/fee-rate", get(fee_rate))
        .route("/known-addresses", get(known_addresses))
        .with_state(node)
}

/// Erro de API: status HTTP mais um detalhe legível
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: detail.into(),
        }
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: detail.into(),
        }
    }
}

impl From<ChainError> for ApiError {
    fn from(error: ChainError) -> Self {
        let status = match error {
            ChainError::InvalidBlock(_)
            | ChainError::InvalidTransaction(_)
            | ChainError::InvalidCoinbase(_)
            | ChainError::InvalidSignature
            | ChainError::InsufficientInput(_)
            | ChainError::InvalidUtxoReference(_)
            | ChainError::ChainTooShort
            | ChainError::InvalidChain(_)
            | ChainError::InsufficientFunds { .. }
            | ChainError::CryptographicError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            detail: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct PaginationQuery {
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_page_size")]
    page_size: usize,
}

const fn default_page() -> usize {
    1
}

const fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

#[derive(Debug, Deserialize)]
struct LatestQuery {
    #[serde(default = "default_page_size")]
    limit: usize,
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    #[serde(default)]
    start: usize,
    #[serde(default = "default_page_size")]
    end: usize,
    #[serde(default)]
    reverse: bool,
}

#[derive(Debug, Default, Deserialize)]
struct MineRequest {
    miner_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WalletInitRequest {
    private_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransactRequest {
    recipient: String,
    amount: f64,
    priority: Option<Priority>,
}

#[derive(Debug, Serialize)]
struct BalanceInfo {
    confirmed_balance: f64,
    pending_spend: f64,
    available_balance: f64,
}

async fn blockchain_full(State(node): State<SharedNode>) -> impl IntoResponse {
    Json(node.blockchain.read().clone())
}

async fn blockchain_paginated(
    State(node): State<SharedNode>,
    Query(query): Query<PaginationQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = query.page.max(1);
    let page_size = query.page_size.clamp(1, MAX_PAGE_SIZE);

    let blockchain = node.blockchain.read();
    let total_blocks = blockchain.len();
    let total_pages = total_blocks.div_ceil(page_size);
    if page > total_pages {
        return Err(ApiError::bad_request("página além do total"));
    }

    // Janela do fim para o começo: página 1 = blocos mais recentes
    let end = total_blocks - (page - 1) * page_size;
    let start = end.saturating_sub(page_size);
    let mut blocks: Vec<Block> = blockchain.chain()[start..end].to_vec();
    blocks.reverse();

    Ok(Json(json!({
        "blocks": blocks,
        "page": page,
        "page_size": page_size,
        "total_blocks": total_blocks,
        "total_pages": total_pages,
        "has_next": page < total_pages,
        "has_previous": page > 1,
    })))
}

async fn blockchain_latest(
    State(node): State<SharedNode>,
    Query(query): Query<LatestQuery>,
) -> impl IntoResponse {
    let limit = query.limit.clamp(1, MAX_PAGE_SIZE);
    let blockchain = node.blockchain.read();
    let chain = blockchain.chain();
    let mut blocks: Vec<Block> = chain[chain.len().saturating_sub(limit)..].to_vec();
    blocks.reverse();
    Json(blocks)
}

async fn blockchain_range(
    State(node): State<SharedNode>,
    Query(query): Query<RangeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let blockchain = node.blockchain.read();
    let total = blockchain.len();

    if query.start >= total {
        return Ok(Json(json!({ "chain": [] })));
    }
    if query.start >= query.end {
        return Err(ApiError::bad_request("intervalo inválido"));
    }

    let end = query.end.min(total);
    let mut blocks: Vec<Block> = blockchain.chain()[query.start..end].to_vec();
    if query.reverse {
        blocks.reverse();
    }
    Ok(Json(json!({ "chain": blocks })))
}

async fn blockchain_height(State(node): State<SharedNode>) -> impl IntoResponse {
    Json(json!({ "height": node.blockchain.read().current_height() }))
}

async fn block_by_height(
    State(node): State<SharedNode>,
    Path(height): Path<u64>,
) -> Result<Json<Block>, ApiError> {
    node.blockchain
        .read()
        .block_by_height(height)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::not_found("bloco não encontrado"))
}

async fn block_by_hash(
    State(node): State<SharedNode>,
    Path(hash): Path<String>,
) -> Result<Json<Block>, ApiError> {
    node.blockchain
        .read()
        .block_by_hash(&hash)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::not_found("bloco não encontrado"))
}

async fn block_by_tx(
    State(node): State<SharedNode>,
    Path(tx_id): Path<String>,
) -> Result<Json<Block>, ApiError> {
    node.blockchain
        .read()
        .block_with_transaction(&tx_id)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::not_found("transação não encontrada"))
}

async fn halving_info(State(node): State<SharedNode>) -> impl IntoResponse {
    let height = node.blockchain.read().current_height();
    let halvings = height / HALVING_INTERVAL;
    Json(json!({
        "halvings": halvings,
        "subsidy": block_subsidy(height),
        "base_subsidy": BLOCK_SUBSIDY,
        "halving_interval": HALVING_INTERVAL,
    }))
}

/// POST /mine: seleciona as transações de maior prioridade, monta a coinbase
/// e minera fora do laço de I/O
async fn mine(
    State(node): State<SharedNode>,
    Json(request): Json<MineRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let wallet_address = node
        .wallet
        .read()
        .as_ref()
        .map(|wallet| wallet.address().to_string());
    let miner_address = request
        .miner_address
        .or(wallet_address)
        .ok_or_else(|| ApiError::bad_request("carteira não inicializada"))?;

    let worker = node.clone();
    let block = tokio::task::spawn_blocking(move || -> Result<Block, ChainError> {
        let candidates = worker.mempool.read().get_priority_transactions();

        let mut blockchain = worker.blockchain.write();
        let mut selected: Vec<Transaction> = Vec::new();
        for tx in candidates.into_iter().take(MAX_BLOCK_TXS) {
            match tx.is_valid(Some(blockchain.utxo_set())) {
                Ok(()) => selected.push(tx),
                Err(e) => warn!(tx_id = %tx.id, "transação pulada na mineração: {e}"),
            }
        }
        let total_fees: f64 = selected.iter().map(|tx| tx.fee).sum();
        let coinbase = Transaction::create_coinbase(
            &miner_address,
            blockchain.current_height() + 1,
            total_fees,
        )?;
        let mut transactions = vec![coinbase];
        transactions.extend(selected);

        let block = blockchain.add_block(transactions)?.clone();
        drop(blockchain);

        let chain = worker.blockchain.read().chain().to_vec();
        worker.mempool.write().clear_blockchain_transactions(&chain);
        Ok(block)
    })
    .await
    .map_err(|e| ApiError::internal(format!("mineração abortada: {e}")))??;

    info!(height = block.height, hash = %block.hash, "⛏️ bloco minerado");
    if let Err(e) = node.broadcast_block(block.clone()).await {
        warn!("broadcast do bloco minerado falhou: {e}");
    }

    let reward = block.data[0].total_output();
    let confirmed_balance = {
        let blockchain = node.blockchain.read();
        node.wallet
            .read()
            .as_ref()
            .map_or(0.0, |wallet| wallet.balance(blockchain.utxo_set()))
    };
    Ok(Json(json!({
        "message": "bloco minerado com sucesso",
        "block": block,
        "reward": reward,
        "confirmed_balance": confirmed_balance,
    })))
}

/// POST /wallet: chave nova ou restaurada de hexadecimal
async fn init_wallet(
    State(node): State<SharedNode>,
    Json(request): Json<WalletInitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let wallet = match request.private_key.as_deref().map(str::trim) {
        Some(private_key) if !private_key.is_empty() => {
            if private_key.len() != 64 || !private_key.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ApiError::bad_request(
                    "chave privada deve ter 64 caracteres hexadecimais",
                ));
            }
            Wallet::from_private_key_hex(private_key)?
        }
        _ => Wallet::new()?,
    };

    let balance = wallet.balance(node.blockchain.read().utxo_set());
    let response = json!({
        "address": wallet.address(),
        "balance": balance,
        "publicKey": wallet.public_key_pem(),
        "privateKey": wallet.private_key_hex(),
    });
    *node.wallet.write() = Some(wallet);
    Ok(Json(response))
}

async fn wallet_info(State(node): State<SharedNode>) -> Result<impl IntoResponse, ApiError> {
    let wallet = node
        .wallet
        .read()
        .clone()
        .ok_or_else(|| ApiError::bad_request("carteira não inicializada"))?;

    let balance = wallet.balance(node.blockchain.read().utxo_set());
    let pending = node.mempool.read().pending_spend(wallet.address());
    Ok(Json(json!({
        "address": wallet.address(),
        "balance": balance,
        "publicKey": wallet.public_key_pem(),
        "pending_spends": pending,
    })))
}

/// POST /wallet/transact: cria ou emenda a transação pendente da carteira e
/// propaga pela rede antes de responder
async fn wallet_transact(
    State(node): State<SharedNode>,
    Json(request): Json<TransactRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let wallet = node
        .wallet
        .read()
        .clone()
        .ok_or_else(|| ApiError::bad_request("carteira não inicializada"))?;
    if request.recipient == wallet.address() {
        return Err(ApiError::bad_request("não é possível enviar para si mesmo"));
    }
    if request.amount <= 0.0 {
        return Err(ApiError::bad_request("valor deve ser positivo"));
    }

    let priority = request.priority.unwrap_or(Priority::Medium);
    let (fee_rate, confirmed_balance, pending_spend, utxo_set) = {
        let blockchain = node.blockchain.read();
        let mempool = node.mempool.read();
        let base_rate = node
            .fee_estimator
            .write()
            .fee_rate(mempool.len(), blockchain.chain());
        (
            base_rate * priority.multiplier(),
            wallet.balance(blockchain.utxo_set()),
            mempool.pending_spend(wallet.address()),
            blockchain.utxo_set().clone(),
        )
    };

    let available_balance = confirmed_balance - pending_spend;
    if request.amount > available_balance {
        return Err(ApiError::bad_request(format!(
            "fundos insuficientes: disponível {available_balance:.4}, pedido {:.4}",
            request.amount
        )));
    }
    if request.amount + MIN_FEE > available_balance {
        return Err(ApiError::bad_request(format!(
            "valor pequeno demais: o mínimo com taxa é {MIN_FEE:.4} acima do pedido"
        )));
    }

    let existing = node
        .mempool
        .read()
        .existing_transaction(wallet.address())
        .cloned();
    let transaction = match existing {
        Some(mut tx) => {
            tx.update(&wallet, &utxo_set, &request.recipient, request.amount, fee_rate)?;
            tx
        }
        None => Transaction::create(
            &wallet,
            &utxo_set,
            &request.recipient,
            request.amount,
            fee_rate,
        )?,
    };
    transaction.is_valid(Some(&utxo_set))?;
    node.mempool.write().set_transaction(transaction.clone())?;

    if let Err(e) = node.broadcast_transaction(transaction.clone()).await {
        // Sem runtime de gossip a admissão local é desfeita
        node.mempool.write().remove(&transaction.id);
        return Err(ApiError::internal(format!("broadcast falhou: {e}")));
    }

    let total_cost = request.amount + transaction.fee;
    Ok(Json(json!({
        "message": "transação criada com sucesso",
        "transaction": transaction,
        "fee": transaction.fee,
        "size": transaction.size,
        "timestamp": transaction.timestamp(),
        "balance_info": BalanceInfo {
            confirmed_balance,
            pending_spend: pending_spend + total_cost,
            available_balance: available_balance - total_cost,
        },
    })))
}

async fn transaction_pool(State(node): State<SharedNode>) -> impl IntoResponse {
    let transactions = node.mempool.read().transaction_data();
    Json(json!({
        "count": transactions.len(),
        "transactions": transactions,
    }))
}

async fn transactions_by_address(
    State(node): State<SharedNode>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    let mut entries: Vec<serde_json::Value> = Vec::new();

    for tx in node.mempool.read().transaction_data() {
        if tx.input.address() == address || tx.output.contains_key(&address) {
            entries.push(json!({
                "id": tx.id,
                "input": tx.input,
                "output": tx.output,
                "fee": tx.fee,
                "status": "pending",
                "timestamp": tx.timestamp(),
            }));
        }
    }

    let blockchain = node.blockchain.read();
    for block in blockchain.chain() {
        for tx in &block.data {
            if tx.input.address() == address || tx.output.contains_key(&address) {
                entries.push(json!({
                    "id": tx.id,
                    "input": tx.input,
                    "output": tx.output,
                    "fee": tx.fee,
                    "status": "confirmed",
                    "block_height": block.height,
                    "timestamp": tx.timestamp(),
                }));
            }
        }
    }
    drop(blockchain);

    entries.sort_by(|a, b| {
        let ts_a = a["timestamp"].as_u64().unwrap_or(0);
        let ts_b = b["timestamp"].as_u64().unwrap_or(0);
        ts_b.cmp(&ts_a)
    });
    Json(entries)
}

async fn transaction_by_id(
    State(node): State<SharedNode>,
    Path(tx_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(tx) = node.mempool.read().get(&tx_id) {
        return Ok(Json(json!({
            "id": tx.id,
            "input": tx.input,
            "output": tx.output,
            "fee": tx.fee,
            "size": tx.size,
            "is_coinbase": tx.is_coinbase,
            "status": "pending",
            "timestamp": tx.timestamp(),
        })));
    }

    let blockchain = node.blockchain.read();
    for block in blockchain.chain() {
        if let Some(tx) = block.data.iter().find(|tx| tx.id == tx_id) {
            return Ok(Json(json!({
                "id": tx.id,
                "input": tx.input,
                "output": tx.output,
                "fee": tx.fee,
                "size": tx.size,
                "is_coinbase": tx.is_coinbase,
                "status": "confirmed",
                "block_height": block.height,
                "timestamp": tx.timestamp(),
            })));
        }
    }
    Err(ApiError::not_found(format!(
        "transação {tx_id} não encontrada no mempool nem na cadeia"
    )))
}

async fn fee_rate(State(node): State<SharedNode>) -> impl IntoResponse {
    let blockchain = node.blockchain.read();
    let mempool_size = node.mempool.read().len();
    let rate = node
        .fee_estimator
        .write()
        .fee_rate(mempool_size, blockchain.chain());
    Json(json!({
        "fee_rate": rate,
        "priority_multipliers": {
            "low": Priority::Low.multiplier(),
            "medium": Priority::Medium.multiplier(),
            "high": Priority::High.multiplier(),
        },
        "mempool_size": mempool_size,
        "block_fullness": block_fullness(blockchain.chain()),
    }))
}

async fn known_addresses(State(node): State<SharedNode>) -> impl IntoResponse {
    let addresses: Vec<String> = node
        .blockchain
        .read()
        .known_addresses()
        .into_iter()
        .collect();
    Json(addresses)
}
