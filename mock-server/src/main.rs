use mock_server::proxy::{run_proxy, ProxyLog, ProxyMode};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let proxy_port = std::env::var("PROXY_PORT").unwrap_or_else(|_| "3128".to_string());
    let addr = format!("127.0.0.1:{port}");
    let proxy_addr = format!("127.0.0.1:{proxy_port}");

    let listener = TcpListener::bind(&addr).await?;
    let proxy_listener = TcpListener::bind(&proxy_addr).await?;
    tracing::info!(%addr, %proxy_addr, "listening");

    tokio::try_join!(
        mock_server::run(listener),
        run_proxy(proxy_listener, ProxyMode::Open, ProxyLog::default()),
    )?;
    Ok(())
}
