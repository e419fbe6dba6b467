use crate::config::TcpProxyConfig;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Establishes a connection to `cfg.target_host:target_port` and pipes bytes
/// bidirectionally between it and `source` until either side closes.
pub async fn proxy(mut source: TcpStream, cfg: &TcpProxyConfig) {
    let target_addr = format!("{}:{}", cfg.target_host, cfg.target_port);

    let mut target = match TcpStream::connect(&target_addr).await {
        Ok(s) => s,
        Err(e) => {
            error!(target = %target_addr, error = %e, "tcp proxy: failed to connect to target");
            return;
        }
    };

    info!(target = %target_addr, "tcp proxy established");

    let (mut src_r, mut src_w) = source.split();
    let (mut dst_r, mut dst_w) = target.split();

    let buf_size = cfg.buffer_size as usize;
    let idle_timeout = if cfg.idle_timeout > 0 {
        Some(Duration::from_secs(cfg.idle_timeout))
    } else {
        None
    };

    let client_to_target = pipe(&mut src_r, &mut dst_w, buf_size, idle_timeout);
    let target_to_client = pipe(&mut dst_r, &mut src_w, buf_size, idle_timeout);

    tokio::join!(client_to_target, target_to_client);

    debug!(target = %target_addr, "tcp proxy connection closed");
}

/// Copies bytes from `reader` to `writer` in chunks of `buf_size` until EOF
/// or error. On a write error after the read side is still open, the
/// remaining buffered data is flushed before giving up, matching the
/// half-close draining behavior of a traditional splice loop.
async fn pipe<R, W>(reader: &mut R, writer: &mut W, buf_size: usize, idle_timeout: Option<Duration>)
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buf_size];
    loop {
        let read_fut = reader.read(&mut buf);
        let n = match idle_timeout {
            Some(d) => match tokio::time::timeout(d, read_fut).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    debug!(error = %e, "tcp proxy: read error");
                    break;
                }
                Err(_) => {
                    warn!("tcp proxy: idle timeout, closing connection");
                    break;
                }
            },
            None => match read_fut.await {
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "tcp proxy: read error");
                    break;
                }
            },
        };

        if n == 0 {
            break;
        }

        if let Err(e) = writer.write_all(&buf[..n]).await {
            debug!(error = %e, "tcp proxy: write error");
            break;
        }
    }

    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_proxy_forwards_bytes_both_ways() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target_listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = target_listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            sock.write_all(b"world").await.unwrap();
        });

        let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_listener.local_addr().unwrap();

        let cfg = TcpProxyConfig {
            target_host: target_addr.ip().to_string(),
            target_port: target_addr.port(),
            buffer_size: 8192,
            idle_timeout: 0,
        };

        tokio::spawn(async move {
            let (sock, _) = proxy_listener.accept().await.unwrap();
            proxy(sock, &cfg).await;
        });

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();

        let mut resp = [0u8; 5];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(&resp, b"world");
    }

    #[tokio::test]
    async fn test_proxy_handles_unreachable_target() {
        let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_listener.local_addr().unwrap();

        let cfg = TcpProxyConfig {
            target_host: "127.0.0.1".to_string(),
            target_port: 1, // reserved, nothing listens there
            buffer_size: 8192,
            idle_timeout: 0,
        };

        tokio::spawn(async move {
            let (sock, _) = proxy_listener.accept().await.unwrap();
            proxy(sock, &cfg).await;
        });

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }
}
