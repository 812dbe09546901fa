//! Start-instant handshake with the rendezvous authority

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info, instrument};

use crate::{CaptureConfig, CaptureError, Result, TriggerConfig};

/// Client -> authority: `"<width>,<height>,<sensor_mode>"`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerRequest {
    pub width: u32,
    pub height: u32,
    pub sensor_mode: u32,
}

impl From<&CaptureConfig> for TriggerRequest {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            sensor_mode: config.sensor_mode,
        }
    }
}

impl fmt::Display for TriggerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.width, self.height, self.sensor_mode)
    }
}

impl FromStr for TriggerRequest {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        let fields = s
            .trim()
            .split(',')
            .map(|field| field.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CaptureError::malformed(s, e.to_string()))?;

        match fields[..] {
            [width, height, sensor_mode] => Ok(Self {
                width,
                height,
                sensor_mode,
            }),
            _ => Err(CaptureError::malformed(s, "expected width,height,sensor_mode")),
        }
    }
}

/// Authority -> client: `"<start_instant> <duration>"`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerResponse {
    /// Shared start, seconds since the Unix epoch
    pub start_instant: f64,
    /// Session length in whole seconds
    pub duration_secs: u64,
}

impl TriggerResponse {
    /// Response with the start instant rounded to the microsecond precision of the wire format.
    pub fn at(start_instant: f64, duration_secs: u64) -> Self {
        Self {
            start_instant: (start_instant * 1e6).round() / 1e6,
            duration_secs,
        }
    }

    /// Frames this client captures: the window length at the client's own rate.
    pub fn frame_budget(&self, fps: u32) -> u64 {
        self.duration_secs * u64::from(fps)
    }
}

impl fmt::Display for TriggerResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6} {}", self.start_instant, self.duration_secs)
    }
}

impl FromStr for TriggerResponse {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        let [start, duration] = fields[..] else {
            return Err(CaptureError::malformed(
                s,
                format!("expected 2 fields, got {}", fields.len()),
            ));
        };

        let start_instant: f64 = start
            .parse()
            .map_err(|e| CaptureError::malformed(s, format!("start instant: {e}")))?;
        if !start_instant.is_finite() || start_instant < 0.0 {
            return Err(CaptureError::malformed(s, "start instant out of range"));
        }

        let duration_secs: u64 = duration
            .parse()
            .map_err(|e| CaptureError::malformed(s, format!("duration: {e}")))?;

        Ok(Self {
            start_instant,
            duration_secs,
        })
    }
}

/// Single round-trip datagram exchange with the rendezvous authority
#[derive(Debug, Clone)]
pub struct TriggerChannel {
    host: String,
    port: u16,
    timeout: Duration,
    buffer_size: usize,
}

impl TriggerChannel {
    pub fn new(config: &TriggerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            timeout: Duration::from_secs(config.timeout_secs),
            buffer_size: config.buffer_size,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        let mut addrs = lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| CaptureError::Resolve {
                host: self.host.clone(),
                source: Some(e),
            })?;

        addrs.next().ok_or_else(|| CaptureError::Resolve {
            host: self.host.clone(),
            source: None,
        })
    }

    /// Send our parameters and wait for the shared start instant and duration.
    ///
    /// No retries: resolution failure, timeout or a malformed reply aborts the session.
    #[instrument(skip(self), fields(authority = %self.host))]
    pub async fn negotiate(&self, request: &TriggerRequest) -> Result<TriggerResponse> {
        info!("Connecting to rendezvous authority {}:{}", self.host, self.port);
        let authority = self.resolve().await?;

        let bind_addr = if authority.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind_addr).await?;

        let payload = request.to_string();
        socket
            .send_to(payload.as_bytes(), authority)
            .await
            .map_err(|e| CaptureError::Coordination(format!("send to {authority}: {e}")))?;
        debug!("Sent {:?} to {}", payload, authority);

        let mut buf = vec![0u8; self.buffer_size];
        let (len, from) = timeout(self.timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| CaptureError::Timeout(self.timeout))?
            .map_err(|e| CaptureError::Coordination(format!("receive: {e}")))?;

        let message = std::str::from_utf8(&buf[..len]).map_err(|_| {
            CaptureError::malformed(&String::from_utf8_lossy(&buf[..len]), "not UTF-8")
        })?;
        let response: TriggerResponse = message.parse()?;

        info!(
            "Trigger from {}: start {:.6}, duration {}s",
            from, response.start_instant, response.duration_secs
        );
        Ok(response)
    }
}
