use colored::*;
use patchflow::config::Config;
use patchflow::error::Result;
use patchflow::hub::auth::StaticTokenVerifier;
use patchflow::hub::server::HubServer;
use patchflow::hub::ConnectionHub;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// 이벤트 허브 실행 (ctrl-c까지)
pub async fn serve(config: Config, socket: Option<PathBuf>) -> Result<()> {
    let socket_path = match socket {
        Some(path) => path,
        None => config.socket_path()?,
    };

    let verifier = StaticTokenVerifier::new(config.auth_tokens.clone());
    let hub = Arc::new(ConnectionHub::new(Arc::new(verifier), config.outbound_buffer));
    let heartbeat = hub.spawn_heartbeat(
        Duration::from_secs(config.heartbeat_interval_secs),
        Duration::from_secs(config.heartbeat_timeout_secs),
    );

    let server = HubServer::new(socket_path, hub);
    let listener = server.bind()?;

    eprintln!("{} Hub server started.", "[OK]".green().bold());
    eprintln!("  Socket: {}", server.socket_path().display());

    server
        .run(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    heartbeat.abort();
    eprintln!("{} Hub server stopped.", "[BYE]".cyan());

    Ok(())
}
