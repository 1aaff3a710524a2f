use std::future::Future;
use std::time::Duration;

use tokio::net::TcpStream;

/// Best-effort liveness check of the store host.
pub trait Probe: Send + Sync + 'static {
    fn ping(&self) -> impl Future<Output = bool> + Send;
}

/// Probes by opening (and immediately closing) a TCP connection.
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

impl Probe for TcpProbe {
    async fn ping(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!(addr = %self.addr, error = %e, "store probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(addr = %self.addr, "store probe timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_probe_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let probe = TcpProbe::new(addr.to_string(), Duration::from_secs(1));
        assert!(probe.ping().await);
    }

    #[tokio::test]
    async fn test_tcp_probe_fails_on_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let probe = TcpProbe::new(addr.to_string(), Duration::from_secs(1));
        assert!(!probe.ping().await);
    }
}
