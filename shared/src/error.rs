use thiserror::Error;

/// Erros do nó Embercoin
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Bloco inválido: {0}")]
    InvalidBlock(String),

    #[error("Transação inválida: {0}")]
    InvalidTransaction(String),

    #[error("Coinbase inválida: {0}")]
    InvalidCoinbase(String),

    #[error("Assinatura inválida")]
    InvalidSignature,

    #[error("Input insuficiente: {0}")]
    InsufficientInput(String),

    #[error("Referência UTXO inválida: {0}")]
    InvalidUtxoReference(String),

    #[error("Cadeia recebida não é mais longa que a local")]
    ChainTooShort,

    #[error("Cadeia inválida: {0}")]
    InvalidChain(String),

    #[error("Fundos insuficientes: disponível {available}, necessário {required}")]
    InsufficientFunds { available: f64, required: f64 },

    #[error("Hash inválido")]
    InvalidHash,

    #[error("Erro criptográfico: {0}")]
    CryptographicError(String),

    #[error("Erro de serialização: {0}")]
    SerializationError(String),

    #[error("Erro de I/O: {0}")]
    IoError(String),

    #[error("Falha ao enviar para peer {0}")]
    PeerSendFailed(String),

    #[error("Runtime de gossip indisponível")]
    LoopUnavailable,

    #[error("Máximo de tentativas atingido para {0}")]
    MaxRetries(String),

    #[error("Erro de rede: {0}")]
    NetworkError(String),
}
