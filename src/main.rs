use anyhow::Context;
use printlink::{init_logging, Config, LinkEvent, PrinterLink, BUILD_DATE, VERSION};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;
    tracing::info!("PrintLink {} built {}", VERSION, BUILD_DATE);

    let path = match std::env::args_os().nth(1) {
        Some(path) => PathBuf::from(path),
        None => printlink_settings::config::default_config_path()?,
    };
    let config = Config::load_or_default(&path)
        .with_context(|| format!("Cannot load {}", path.display()))?;

    let link = PrinterLink::new(config.link_config());
    let mut events = link.receiver();
    link.start().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(event @ LinkEvent::State(_)) => tracing::info!("{}", event.description()),
                Ok(event) => tracing::debug!("{}", event.description()),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Skipped {} link events", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    link.stop().await;
    Ok(())
}
