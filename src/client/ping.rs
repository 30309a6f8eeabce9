use super::{PingReply, PingStatus, Pinger};
use crate::target::HostEndpoint;
use crate::timing::duration_ms;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

/// Measures reachability with a TCP connect to the server port.
///
/// Raw ICMP needs elevated privileges, while the TCP handshake exercises the
/// same path the database driver uses and is available everywhere.
#[derive(Debug, Clone, Default)]
pub struct TcpPinger;

impl TcpPinger {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Pinger for TcpPinger {
    async fn ping(&self, endpoint: &HostEndpoint, timeout: Duration) -> PingReply {
        let address = (endpoint.host.as_str(), endpoint.port_or_default());
        let start = Instant::now();

        match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                let rtt = duration_ms(start.elapsed());
                drop(stream);
                PingReply::success(rtt)
            }
            Ok(Err(e)) => {
                debug!("TCP ping to {} failed: {}", endpoint, e);
                let status = match e.kind() {
                    ErrorKind::ConnectionRefused
                    | ErrorKind::NotFound
                    | ErrorKind::AddrNotAvailable => PingStatus::Unreachable,
                    ErrorKind::TimedOut => PingStatus::TimedOut,
                    _ => PingStatus::Error(e.to_string()),
                };
                PingReply::failure(status)
            }
            Err(_) => PingReply::failure(PingStatus::TimedOut),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_ping_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = HostEndpoint::new("127.0.0.1", Some(port));

        let reply = TcpPinger::new().ping(&endpoint, Duration::from_secs(2)).await;

        assert!(reply.success);
        assert_eq!(reply.status, PingStatus::Success);
        assert!(reply.round_trip_ms.is_some());
    }

    #[tokio::test]
    async fn test_ping_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = HostEndpoint::new("127.0.0.1", Some(port));
        let reply = TcpPinger::new().ping(&endpoint, Duration::from_secs(2)).await;

        assert!(!reply.success);
        assert!(reply.round_trip_ms.is_none());
    }
}
