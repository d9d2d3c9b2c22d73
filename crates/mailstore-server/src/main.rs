//! mailstore - mail store server entry point

use anyhow::Result;
use mailstore_common::config::{Config, LoggingConfig};
use mailstore_core::{
    listener, Backends, ImapServer, LmtpServer, ManageSieveServer, Pop3Server,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_logging(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting mailstore");

    // unknown drivers and unreachable storage end the process here
    let backends = Backends::from_config(config).await?;
    let config = backends.config.clone();
    let shutdown = CancellationToken::new();
    let mut servers = JoinSet::new();

    if config.imap.enabled {
        let listener = listener::bind("imap", &config.imap).await?;
        let server = ImapServer::new(backends.clone());
        let shutdown = shutdown.clone();
        servers.spawn(async move { ("imap", server.run(listener, shutdown).await) });
    } else {
        info!("IMAP server disabled");
    }

    if config.pop3.enabled {
        let listener = listener::bind("pop3", &config.pop3).await?;
        let server = Pop3Server::new(backends.clone());
        let shutdown = shutdown.clone();
        servers.spawn(async move { ("pop3", server.run(listener, shutdown).await) });
    } else {
        info!("POP3 server disabled");
    }

    if config.lmtp.enabled {
        let listener = listener::bind("lmtp", &config.lmtp).await?;
        let server = LmtpServer::new(backends.clone());
        let shutdown = shutdown.clone();
        servers.spawn(async move { ("lmtp", server.run(listener, shutdown).await) });
    } else {
        info!("LMTP server disabled");
    }

    if config.managesieve.enabled {
        let listener = listener::bind("managesieve", &config.managesieve).await?;
        let server = ManageSieveServer::new(backends.clone());
        let shutdown = shutdown.clone();
        servers.spawn(async move { ("managesieve", server.run(listener, shutdown).await) });
    } else {
        info!("ManageSieve server disabled");
    }

    if servers.is_empty() {
        anyhow::bail!("no service is enabled");
    }
    info!(database = backends.store.backend_name(), "mailstore started");

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let mut failed = false;
    while let Some(joined) = servers.join_next().await {
        match joined {
            Ok((service, Ok(()))) => info!(service, "Server stopped"),
            Ok((service, Err(e))) => {
                error!(service, error = %e, "Server failed");
                failed = true;
                shutdown.cancel();
            }
            Err(e) => {
                error!(error = %e, "Server task panicked");
                failed = true;
                shutdown.cancel();
            }
        }
    }

    info!("mailstore shutdown complete");
    if failed {
        anyhow::bail!("a server stopped with an error");
    }
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},mailstore=debug", logging.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_target(true).with_level(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
