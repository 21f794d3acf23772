use anyhow::Result;
use pitchline_relay::RelayServer;
use tokio_util::sync::CancellationToken;

use crate::cli::RelayArgs;
use crate::config::AppConfig;

pub async fn run_relay(app: AppConfig, args: RelayArgs) -> Result<()> {
    let mut config = app.relay;
    if let Some(listen) = args.listen {
        config = config.with_listen(listen);
    }
    let proxy_path = config.proxy_path.clone();

    let relay = RelayServer::new(config).bind().await?;
    let addr = relay.local_addr()?;
    println!("Relay listening on ws://{addr}{proxy_path}");
    println!("Press Ctrl+C to stop");

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    relay.serve(shutdown).await?;
    Ok(())
}
