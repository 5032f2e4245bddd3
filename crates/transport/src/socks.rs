use std::io;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use asherah_core::TransportError;

/// Cap on accumulated banner bytes.
pub const BANNER_CAP: usize = 4096;

/// How long a relay reachability probe stays valid.
const PROBE_CACHE: Duration = Duration::from_secs(30);

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP connector that routes everything through a local SOCKS5 relay with
/// remote name resolution: the target hostname goes to the relay verbatim,
/// so the client never resolves (or leaks) a hidden-service name.
pub struct ProxyConnector {
    socks_addr: String,
    connect_timeout: Duration,
    last_probe: Mutex<Option<Instant>>,
}

impl ProxyConnector {
    pub fn new(socks_addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            socks_addr: socks_addr.into(),
            connect_timeout,
            last_probe: Mutex::new(None),
        }
    }

    pub fn socks_addr(&self) -> &str {
        &self.socks_addr
    }

    /// Plain TCP connect to the relay itself. Fatal at startup when it
    /// fails; cheap enough to repeat before outbound requests.
    pub async fn probe(&self) -> Result<(), TransportError> {
        match timeout(PROBE_TIMEOUT, TcpStream::connect(&self.socks_addr)).await {
            Ok(Ok(_)) => {
                *self.last_probe.lock().unwrap() = Some(Instant::now());
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::ProxyUnavailable(format!(
                "{}: {e}",
                self.socks_addr
            ))),
            Err(_) => Err(TransportError::ProxyUnavailable(self.socks_addr.clone())),
        }
    }

    /// Probe the relay unless a recent probe already succeeded.
    pub async fn ensure_reachable(&self) -> Result<(), TransportError> {
        let fresh = self
            .last_probe
            .lock()
            .unwrap()
            .map(|at| at.elapsed() < PROBE_CACHE)
            .unwrap_or(false);
        if fresh {
            return Ok(());
        }
        self.probe().await
    }

    /// Connect to `host:port` through the relay. This is the single point
    /// where transport failures are classified into the typed taxonomy.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Socks5Stream<TcpStream>, TransportError> {
        debug!(host, port, "socks connect");
        let attempt = Socks5Stream::connect(self.socks_addr.as_str(), (host, port));
        match timeout(self.connect_timeout, attempt).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(classify_socks_error(&e)),
            Err(_) => Err(TransportError::TimedOut(
                self.connect_timeout.as_millis() as u64
            )),
        }
    }
}

/// Map a SOCKS-level failure onto the transport taxonomy.
pub fn classify_socks_error(err: &tokio_socks::Error) -> TransportError {
    use tokio_socks::Error;
    match err {
        Error::ConnectionRefused => TransportError::Refused,
        Error::HostUnreachable | Error::NetworkUnreachable => TransportError::Unreachable,
        Error::TtlExpired => TransportError::TimedOut(0),
        Error::GeneralSocksServerFailure
        | Error::ConnectionNotAllowedByRuleset
        | Error::CommandNotSupported
        | Error::AddressTypeNotSupported => TransportError::SocksRejected(err.to_string()),
        Error::Io(io_err) => classify_io_error(io_err),
        other => TransportError::SocksRejected(other.to_string()),
    }
}

pub fn classify_io_error(err: &io::Error) -> TransportError {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => TransportError::Refused,
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => TransportError::Reset,
        io::ErrorKind::TimedOut => TransportError::TimedOut(0),
        io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
            TransportError::Unreachable
        }
        _ => TransportError::Io(err.to_string()),
    }
}

/// Optionally write a protocol probe, then read whatever the peer offers:
/// up to [`BANNER_CAP`] bytes or until the deadline, whichever comes first.
/// Returns None when nothing arrived. The socket is consumed and dropped.
pub async fn grab_banner<S>(mut stream: S, probe: Option<&[u8]>, deadline: Duration) -> Option<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(probe) = probe {
        if stream.write_all(probe).await.is_err() {
            return None;
        }
        let _ = stream.flush().await;
    }

    let mut buf = vec![0u8; BANNER_CAP];
    let mut filled = 0usize;
    let _ = timeout(deadline, async {
        while filled < BANNER_CAP {
            match stream.read(&mut buf[filled..]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(_) => break,
            }
        }
    })
    .await;

    if filled == 0 {
        None
    } else {
        Some(String::from_utf8_lossy(&buf[..filled]).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asherah_core::types::PortState;

    #[tokio::test]
    async fn banner_reads_until_peer_closes() {
        let (client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            server.write_all(b"SSH-2.0-OpenSSH_8.9p1\r\n").await.unwrap();
            drop(server);
        });
        let banner = grab_banner(client, None, Duration::from_secs(1)).await;
        assert_eq!(banner.as_deref(), Some("SSH-2.0-OpenSSH_8.9p1\r\n"));
    }

    #[tokio::test]
    async fn banner_stops_at_deadline_on_silent_peer() {
        let (client, _server) = tokio::io::duplex(1024);
        let banner = grab_banner(client, None, Duration::from_millis(50)).await;
        assert_eq!(banner, None);
    }

    #[tokio::test]
    async fn banner_is_capped() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            server.write_all(&vec![b'x'; 10_000]).await.unwrap();
        });
        let banner = grab_banner(client, None, Duration::from_secs(1)).await.unwrap();
        assert_eq!(banner.len(), BANNER_CAP);
    }

    #[tokio::test]
    async fn probe_is_echoed_before_read() {
        let (client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut req = [0u8; 6];
            server.read_exact(&mut req).await.unwrap();
            assert_eq!(&req, b"PING\r\n");
            server.write_all(b"+PONG\r\n").await.unwrap();
            drop(server);
        });
        let banner = grab_banner(client, Some(b"PING\r\n"), Duration::from_secs(1)).await;
        assert_eq!(banner.as_deref(), Some("+PONG\r\n"));
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let (client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            server.write_all(&[0xff, 0xfe, b'o', b'k']).await.unwrap();
            drop(server);
        });
        let banner = grab_banner(client, None, Duration::from_secs(1)).await.unwrap();
        assert!(banner.ends_with("ok"));
    }

    #[test]
    fn socks_errors_map_to_port_states() {
        use tokio_socks::Error;
        assert_eq!(
            classify_socks_error(&Error::ConnectionRefused).port_state(),
            PortState::Closed
        );
        assert_eq!(
            classify_socks_error(&Error::HostUnreachable).port_state(),
            PortState::Filtered
        );
        assert_eq!(
            classify_socks_error(&Error::GeneralSocksServerFailure).port_state(),
            PortState::Filtered
        );
    }

    #[test]
    fn io_errors_classify_by_kind() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "nope");
        assert_eq!(classify_io_error(&refused), TransportError::Refused);
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "gone");
        assert_eq!(classify_io_error(&reset), TransportError::Reset);
    }
}
