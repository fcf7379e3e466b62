use clap::Parser;
use shared::ChainError;
use std::path::PathBuf;
use tracing::{error, info, Level};

mod api;
mod gossip;
mod node;

use gossip::{GossipConfig, GossipEngine};
use node::NodeState;

#[derive(Parser)]
#[command(name = "embercoin")]
#[command(about = "Embercoin - nó de criptomoeda proof-of-work com gossip P2P")]
#[command(version)]
struct Cli {
    /// Porta da API HTTP (padrão 3000, ou 4000 com PEER=true)
    #[arg(long)]
    api_port: Option<u16>,

    /// Porta do servidor de gossip WebSocket (padrão 5001, ou 6001 com PEER=true)
    #[arg(long)]
    ws_port: Option<u16>,

    /// URI do boot node para descoberta de peers
    #[arg(long, default_value = "ws://localhost:9000")]
    boot_node: String,

    /// Arquivo onde a lista de peers conhecidos é persistida
    #[arg(long, default_value = "peers.json")]
    peers_file: PathBuf,

    /// Host anunciado aos peers (padrão: variável HOST ou IP detectado)
    #[arg(long)]
    host: Option<String>,

    /// Nível de log (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> shared::Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // PEER=true desloca as portas padrão para rodar dois nós na mesma máquina
    let is_peer = std::env::var("PEER")
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let api_port = cli.api_port.unwrap_or(if is_peer { 4000 } else { 3000 });
    let ws_port = cli.ws_port.unwrap_or(if is_peer { 6001 } else { 5001 });
    let host = cli
        .host
        .or_else(|| std::env::var("HOST").ok())
        .unwrap_or_else(detect_local_ip);
    let my_uri = format!("ws://{host}:{ws_port}");

    info!("🚀 iniciando nó Embercoin");
    let node = NodeState::new();

    let (command_tx, command_rx) = tokio::sync::mpsc::unbounded_channel();
    node.attach_gossip(command_tx);

    let engine = GossipEngine::new(
        node.clone(),
        GossipConfig {
            listen_port: ws_port,
            my_uri: my_uri.clone(),
            boot_node: cli.boot_node.clone(),
            peers_file: cli.peers_file.clone(),
        },
    );
    info!(node_id = %engine.node_id(), uri = %my_uri, "🆔 identidade do nó");

    // Superfície HTTP em tarefa própria; o ledger é compartilhado com o gossip
    let app = api::router(node.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", api_port))
        .await
        .map_err(|e| ChainError::IoError(e.to_string()))?;
    info!(port = api_port, "superfície HTTP no ar");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("servidor HTTP caiu: {e}");
        }
    });

    // O runtime de gossip ocupa o laço principal até o sinal de desligamento
    engine.run(command_rx).await?;

    info!("👋 nó encerrado");
    Ok(())
}

/// Descobre o IP local visível na rede: conecta um socket UDP (sem tráfego)
/// e lê o endereço de origem escolhido pelo sistema
fn detect_local_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}
