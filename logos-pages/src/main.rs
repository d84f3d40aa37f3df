use std::sync::Arc;

use logos_pages::{PagesServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    log::info!("Starting Logos Pages server...");

    let config = ServerConfig::from_env()?;
    log::info!(
        "Binding {} (heartbeat timeout {:?}, {} tokens)",
        config.bind_addr,
        config.pages.heartbeat_timeout,
        config.tokens.len()
    );
    let server = Arc::new(PagesServer::open(config)?);

    let mut serving = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::select! {
        finished = &mut serving => return finished?,
        signal = tokio::signal::ctrl_c() => signal?,
    }

    server.shutdown().await?;
    serving.await??;
    log::info!("Logos Pages server stopped");
    Ok(())
}
