use imagelens::{create_router, init, AppState, Config, Result, ResultExt};

use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize the application
    init()?;

    let config = Config::from_env()?;
    let addr = config.bind_addr;

    // Load the model and open the store once, shared by every request
    let state = AppState::from_config(config).await?;
    let app = create_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    log::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    log::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
    }
}
