use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod server;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr = std::env::args().nth(1)
        .or_else(|| std::env::var("ECHO_ADDR").ok())
        .unwrap_or_else(|| "127.0.0.1:7100".to_string());
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "echo service listening");

    let (shutdown, rx) = server::Shutdown::new();
    let server = tokio::spawn(server::run(listener, rx));

    tokio::signal::ctrl_c().await?;
    info!("Received SIGINT, shutting down...");
    shutdown.trigger();
    server.await.map_err(std::io::Error::other)?
}
