//! Datagram emission. The engine talks to sockets only through the
//! [`PgmSocket`] seam so tests can mock the I/O away; the pipeline owns the
//! two send lanes (plain and router-alert) and serialises each with its own
//! lock, applying the rate limiter where the caller asks for it.
//!
//! Raw socket setup, multicast joins and the actual IP router-alert option
//! are the surrounding I/O layer's business; the pipeline only chooses
//! which of the two configured sockets a TPDU leaves on.

use crate::error::{PgmError, PgmResult};
use crate::rate::RateLimiter;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{error, trace, warn};

#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait PgmSocket: Send + Sync + 'static {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> std::io::Result<usize>;

    /// returns `(len, source, destination)`; the destination address is what
    /// lets the dispatcher tell unicast from multicast arrivals
    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr, SocketAddr)>;

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl PgmSocket for UdpSocket {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> std::io::Result<usize> {
        UdpSocket::send_to(self, buf, to).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr, SocketAddr)> {
        let (len, src) = UdpSocket::recv_from(self, buf).await?;
        // without pktinfo plumbing the bound address stands in for the
        // destination; a UDP-encapsulated socket is bound to the group
        Ok((len, src, self.local_addr()?))
    }

    fn local_addr(&self) -> SocketAddr {
        UdpSocket::local_addr(self).expect("UdpSocket should have an initialized local addr")
    }
}

pub struct SendPipeline {
    plain: Arc<dyn PgmSocket>,
    router_alert: Arc<dyn PgmSocket>,
    plain_lock: Mutex<()>,
    router_alert_lock: Mutex<()>,
    rate: Option<Arc<dyn RateLimiter>>,
}

impl SendPipeline {
    pub fn new(
        plain: Arc<dyn PgmSocket>,
        router_alert: Arc<dyn PgmSocket>,
        rate: Option<Arc<dyn RateLimiter>>,
    ) -> SendPipeline {
        SendPipeline {
            plain,
            router_alert,
            plain_lock: Mutex::new(()),
            router_alert_lock: Mutex::new(()),
            rate,
        }
    }

    /// send one TPDU. `router_alert` selects the second lane (SPM, NAK, NCF,
    /// RDATA); `rate_limited` runs the token bucket first. When
    /// `nonblocking`, a dry bucket surfaces as `RateLimited` instead of
    /// sleeping, and a blocked socket as `WouldBlock` instead of retrying.
    pub async fn send(
        &self,
        buf: &[u8],
        to: SocketAddr,
        rate_limited: bool,
        router_alert: bool,
        nonblocking: bool,
    ) -> PgmResult<usize> {
        if rate_limited {
            if let Some(rate) = &self.rate {
                loop {
                    match rate.check(buf.len()) {
                        None => break,
                        Some(_) if nonblocking => return Err(PgmError::RateLimited),
                        Some(wait) => {
                            trace!("rate limiter defers send for {:?}", wait);
                            tokio::time::sleep(wait).await;
                        }
                    }
                }
            }
        }

        let (socket, lock) = if router_alert {
            (&self.router_alert, &self.router_alert_lock)
        } else {
            (&self.plain, &self.plain_lock)
        };

        let _guard = lock.lock().await;
        match socket.send_to(buf, to).await {
            Ok(sent) => Ok(sent),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if nonblocking {
                    return Err(PgmError::WouldBlock);
                }
                // give the socket up to half a second to drain, then retry once
                warn!("send to {:?} would block, retrying", to);
                tokio::time::sleep(Duration::from_millis(500)).await;
                socket.send_to(buf, to).await.map_err(|e| {
                    error!("send to {:?} failed after retry: {}", to, e);
                    PgmError::Io(e)
                })
            }
            Err(e) => {
                error!("send to {:?} failed: {}", to, e);
                Err(PgmError::Io(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate::MockRateLimiter;
    use mockall::predicate::eq;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn pipeline_with(
        plain: MockPgmSocket,
        alert: MockPgmSocket,
        rate: Option<Arc<dyn RateLimiter>>,
    ) -> SendPipeline {
        SendPipeline::new(Arc::new(plain), Arc::new(alert), rate)
    }

    #[tokio::test]
    async fn test_plain_lane() {
        let mut plain = MockPgmSocket::new();
        plain
            .expect_send_to()
            .withf(|buf, to| buf == b"odata" && *to == addr(7500))
            .once()
            .returning(|buf, _| Ok(buf.len()));
        let alert = MockPgmSocket::new();

        let pipeline = pipeline_with(plain, alert, None);
        assert_eq!(pipeline.send(b"odata", addr(7500), false, false, false).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_router_alert_lane() {
        let plain = MockPgmSocket::new();
        let mut alert = MockPgmSocket::new();
        alert
            .expect_send_to()
            .withf(|buf, to| buf == b"spm" && *to == addr(7500))
            .once()
            .returning(|buf, _| Ok(buf.len()));

        let pipeline = pipeline_with(plain, alert, None);
        assert_eq!(pipeline.send(b"spm", addr(7500), false, true, false).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_rate_limited_nonblocking() {
        let plain = MockPgmSocket::new();
        let alert = MockPgmSocket::new();
        let mut rate = MockRateLimiter::new();
        rate.expect_check()
            .with(eq(5usize))
            .returning(|_| Some(Duration::from_millis(100)));

        let pipeline = pipeline_with(plain, alert, Some(Arc::new(rate)));
        assert!(matches!(
            pipeline.send(b"odata", addr(1), true, false, true).await,
            Err(PgmError::RateLimited)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_blocking_waits() {
        let mut plain = MockPgmSocket::new();
        plain.expect_send_to().once().returning(|buf, _| Ok(buf.len()));
        let alert = MockPgmSocket::new();

        let mut rate = MockRateLimiter::new();
        let mut first = true;
        rate.expect_check().returning(move |_| {
            if first {
                first = false;
                Some(Duration::from_millis(50))
            } else {
                None
            }
        });

        let pipeline = pipeline_with(plain, alert, Some(Arc::new(rate)));
        assert_eq!(pipeline.send(b"odata", addr(1), true, false, false).await.unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_would_block_retries_once() {
        let mut plain = MockPgmSocket::new();
        let mut blocked = true;
        plain
            .expect_send_to()
            .withf(|_, to| *to == addr(9))
            .times(2)
            .returning(move |buf, _| {
                if blocked {
                    blocked = false;
                    Err(std::io::Error::from(std::io::ErrorKind::WouldBlock))
                } else {
                    Ok(buf.len())
                }
            });
        let alert = MockPgmSocket::new();

        let pipeline = pipeline_with(plain, alert, None);
        assert_eq!(pipeline.send(b"x", addr(9), false, false, false).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_would_block_nonblocking_surfaces() {
        let mut plain = MockPgmSocket::new();
        plain
            .expect_send_to()
            .once()
            .returning(|_, _| Err(std::io::Error::from(std::io::ErrorKind::WouldBlock)));
        let alert = MockPgmSocket::new();

        let pipeline = pipeline_with(plain, alert, None);
        assert!(matches!(
            pipeline.send(b"x", addr(9), false, false, true).await,
            Err(PgmError::WouldBlock)
        ));
    }
}
