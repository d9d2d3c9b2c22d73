//! TCP accept loop shared by the protocol servers

use crate::cidr::sock_compare;
use mailstore_common::config::ServiceConfig;
use mailstore_common::{Error, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bind the configured address of a service
pub async fn bind(service: &str, config: &ServiceConfig) -> Result<TcpListener> {
    let listener = TcpListener::bind(&config.bind)
        .await
        .map_err(|e| Error::Config(format!("{}: cannot bind {}: {}", service, config.bind, e)))?;
    info!(service, bind = %config.bind, "Listening");
    Ok(listener)
}

/// Accept connections until `shutdown` fires, one task per client.
///
/// Clients are matched against the allow/deny socket filters as
/// `inet:<peer-ip>:<local-port>`; at most `max_connections` sessions run
/// at once.
pub async fn serve<F, Fut>(
    service: &'static str,
    listener: TcpListener,
    config: ServiceConfig,
    shutdown: CancellationToken,
    handler: F,
) -> Result<()>
where
    F: Fn(TcpStream, SocketAddr) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(config.max_connections));
    let local_port = listener.local_addr().map(|a| a.port()).unwrap_or(0);

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(service, "Listener stopped");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                error!(service, error = %e, "Failed to accept connection");
                continue;
            }
        };

        let client = format!("inet:{}:{}", peer.ip(), local_port);
        if !sock_compare(&client, &config.allow, &config.deny) {
            warn!(service, peer = %peer, "Connection refused by socket filter");
            continue;
        }

        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(service, peer = %peer, "Max connections reached, rejecting");
                continue;
            }
        };

        debug!(service, peer = %peer, "Accepted connection");
        let session = handler(stream, peer);
        tokio::spawn(async move {
            if let Err(e) = session.await {
                error!(service, peer = %peer, error = %e, "Session error");
            }
            drop(permit);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_serve_until_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();

        let mut config = ServiceConfig::imap();
        config.bind = addr.to_string();
        let server = tokio::spawn(serve(
            "test",
            listener,
            config,
            shutdown.clone(),
            |mut stream: TcpStream, _peer| async move {
                stream.write_all(b"hello\r\n").await.map_err(|e| Error::Internal(e.to_string()))?;
                Ok(())
            },
        ));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\r\n");

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_denied_clients_are_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();

        let mut config = ServiceConfig::imap();
        config.allow = format!("inet:10.0.0.0/8:{}", addr.port());
        let server = tokio::spawn(serve(
            "test",
            listener,
            config,
            shutdown.clone(),
            |mut stream: TcpStream, _peer| async move {
                stream.write_all(b"hello\r\n").await.map_err(|e| Error::Internal(e.to_string()))?;
                Ok(())
            },
        ));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        let n = client.read_to_end(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
