//! Rendezvous authority: hands every capture client the same future start instant

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::clock::Clock;
use crate::trigger::{TriggerRequest, TriggerResponse};
use crate::{AuthorityConfig, CaptureError, Result};

/// A client that checked in for the current session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub addr: SocketAddr,
    pub request: TriggerRequest,
}

pub struct RendezvousAuthority {
    socket: UdpSocket,
    expected_clients: usize,
    lead_secs: f64,
    duration_secs: u64,
    clock: Arc<dyn Clock>,
}

impl RendezvousAuthority {
    pub async fn bind(config: &AuthorityConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.expected_clients == 0 {
            return Err(CaptureError::Precondition(
                "authority must expect at least one client".into(),
            ));
        }
        if !config.lead_secs.is_finite() || config.lead_secs < 0.0 {
            return Err(CaptureError::Precondition(format!(
                "lead time {} must be a non-negative number of seconds",
                config.lead_secs
            )));
        }

        let socket = UdpSocket::bind(&config.bind).await?;
        info!("Rendezvous authority listening on {}", socket.local_addr()?);

        Ok(Self {
            socket,
            expected_clients: config.expected_clients,
            lead_secs: config.lead_secs,
            duration_secs: config.duration_secs,
            clock,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Collect one request per expected client, then answer all of them with one start instant.
    #[instrument(skip_all, fields(expected = self.expected_clients))]
    pub async fn serve_once(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(TriggerResponse, Vec<Registration>)> {
        let mut registrations: Vec<Registration> = Vec::with_capacity(self.expected_clients);
        let mut buf = [0u8; 1024];

        while registrations.len() < self.expected_clients {
            let (len, addr) = tokio::select! {
                _ = cancel.cancelled() => return Err(CaptureError::Cancelled),
                received = self.socket.recv_from(&mut buf) => received?,
            };

            let text = String::from_utf8_lossy(&buf[..len]);
            let request: TriggerRequest = match text.parse() {
                Ok(request) => request,
                Err(e) => {
                    warn!("Ignoring request from {}: {}", addr, e);
                    continue;
                }
            };

            match registrations.iter_mut().find(|r| r.addr == addr) {
                Some(existing) => existing.request = request,
                None => {
                    info!(
                        "Client {} checked in: {}x{} mode {} ({}/{})",
                        addr,
                        request.width,
                        request.height,
                        request.sensor_mode,
                        registrations.len() + 1,
                        self.expected_clients
                    );
                    registrations.push(Registration { addr, request });
                }
            }
        }

        let response =
            TriggerResponse::at(self.clock.now() + self.lead_secs, self.duration_secs);
        let payload = response.to_string();
        for registration in &registrations {
            self.socket.send_to(payload.as_bytes(), registration.addr).await?;
        }
        info!(
            "Triggered {} clients: start {:.6}, duration {}s",
            registrations.len(),
            response.start_instant,
            response.duration_secs
        );

        Ok((response, registrations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::clock::SystemClock;
    use crate::trigger::TriggerChannel;
    use crate::TriggerConfig;

    fn loopback(expected_clients: usize) -> AuthorityConfig {
        AuthorityConfig {
            bind: "127.0.0.1:0".into(),
            expected_clients,
            lead_secs: 0.5,
            duration_secs: 3,
        }
    }

    #[tokio::test]
    async fn test_all_clients_share_start_instant() {
        let authority = RendezvousAuthority::bind(&loopback(2), Arc::new(SystemClock))
            .await
            .unwrap();
        let port = authority.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(async move { authority.serve_once(&cancel).await });

        let channel = TriggerChannel::new(&TriggerConfig {
            host: "127.0.0.1".into(),
            port,
            timeout_secs: 5,
            buffer_size: 1024,
        });
        let a = TriggerRequest { width: 960, height: 720, sensor_mode: 4 };
        let b = TriggerRequest { width: 640, height: 480, sensor_mode: 7 };
        let (first, second) = tokio::join!(channel.negotiate(&a), channel.negotiate(&b));
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first, second);
        assert_eq!(first.duration_secs, 3);
        assert!(first.start_instant > SystemClock.now() - 1.0);

        let (response, registrations) = server.await.unwrap().unwrap();
        assert_eq!(response, first);
        assert_eq!(registrations.len(), 2);
        assert!(registrations.iter().any(|r| r.request == a));
        assert!(registrations.iter().any(|r| r.request == b));
    }

    #[tokio::test]
    async fn test_served_instant_matches_wire() {
        let clock = ManualClock::new(1_792_417_493.570_471, 0.0);
        let authority = RendezvousAuthority::bind(&loopback(1), Arc::new(clock))
            .await
            .unwrap();
        let addr = authority.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(async move { authority.serve_once(&cancel).await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"960,720,4", addr).await.unwrap();
        let mut buf = [0u8; 1024];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        let received: TriggerResponse = std::str::from_utf8(&buf[..len]).unwrap().parse().unwrap();

        let (served, _) = server.await.unwrap().unwrap();
        assert_eq!(served, received);
        assert_eq!(served.to_string(), "1792417494.070471 3");
    }

    #[tokio::test]
    async fn test_malformed_request_ignored() {
        let authority = RendezvousAuthority::bind(&loopback(1), Arc::new(SystemClock))
            .await
            .unwrap();
        let addr = authority.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(async move { authority.serve_once(&cancel).await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", addr).await.unwrap();
        client.send_to(b"960,720,4", addr).await.unwrap();

        let mut buf = [0u8; 1024];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        let response: TriggerResponse = std::str::from_utf8(&buf[..len]).unwrap().parse().unwrap();
        assert_eq!(response.duration_secs, 3);

        let (_, registrations) = server.await.unwrap().unwrap();
        assert_eq!(registrations.len(), 1);
    }

    #[tokio::test]
    async fn test_serve_cancelled() {
        let authority = RendezvousAuthority::bind(&loopback(1), Arc::new(SystemClock))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            authority.serve_once(&cancel).await,
            Err(CaptureError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_rejects_zero_clients() {
        assert!(RendezvousAuthority::bind(&loopback(0), Arc::new(SystemClock))
            .await
            .is_err());
    }
}
