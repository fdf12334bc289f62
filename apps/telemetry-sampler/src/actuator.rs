use crate::config::{ChannelConfig, ControlConfig};
use crate::poller::SourceId;
use anyhow::{anyhow, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::num::ParseFloatError;
use thiserror::Error;
use tokio::net::{lookup_host, UdpSocket};

pub const WRITE_OPCODE: u16 = 0x0002;
pub const OBJECT_ID: u16 = 0x0001;
pub const FREQUENCY_PROPERTY: u16 = 255;
pub const AMPLITUDE_PROPERTY: u16 = 170;

/// Values at or above this select [`Mode::High`].
pub const HIGH_THRESHOLD: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    High,
    Low,
}

impl Mode {
    pub fn for_value(value: f64) -> Self {
        if value >= HIGH_THRESHOLD {
            Self::High
        } else {
            Self::Low
        }
    }

    fn frequency(self) -> u16 {
        match self {
            Self::High => 1000,
            Self::Low => 2000,
        }
    }

    fn amplitude(self) -> u16 {
        match self {
            Self::High => 8000,
            Self::Low => 4000,
        }
    }

    /// Frequency first, then amplitude.
    pub fn writes(self) -> [PropertyWrite; 2] {
        [
            PropertyWrite::new(FREQUENCY_PROPERTY, self.frequency()),
            PropertyWrite::new(AMPLITUDE_PROPERTY, self.amplitude()),
        ]
    }
}

/// One control-endpoint write: four big-endian `u16`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyWrite {
    pub opcode: u16,
    pub object: u16,
    pub property: u16,
    pub value: u16,
}

impl PropertyWrite {
    pub const LEN: usize = 8;

    pub fn new(property: u16, value: u16) -> Self {
        Self {
            opcode: WRITE_OPCODE,
            object: OBJECT_ID,
            property,
            value,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u16(self.opcode);
        buf.put_u16(self.object);
        buf.put_u16(self.property);
        buf.put_u16(self.value);
        buf.freeze()
    }

    #[cfg(test)]
    pub fn decode(mut raw: &[u8]) -> Option<Self> {
        use bytes::Buf;

        if raw.len() != Self::LEN {
            return None;
        }
        Some(Self {
            opcode: raw.get_u16(),
            object: raw.get_u16(),
            property: raw.get_u16(),
            value: raw.get_u16(),
        })
    }
}

#[derive(Debug, Error)]
pub enum ActuationError {
    #[error("designated channel has no value yet")]
    NoValue,
    #[error("trigger value {raw:?} is not a number")]
    InvalidTrigger {
        raw: String,
        #[source]
        source: ParseFloatError,
    },
    #[error("control write to {target} failed")]
    Send {
        target: SocketAddr,
        #[source]
        source: io::Error,
    },
}

pub fn parse_trigger(raw: Option<&str>) -> Result<f64, ActuationError> {
    let raw = raw.ok_or(ActuationError::NoValue)?;
    raw.trim()
        .parse::<f64>()
        .map_err(|source| ActuationError::InvalidTrigger {
            raw: raw.to_string(),
            source,
        })
}

/// Sends a two-write command per tick, derived from the designated channel.
/// Writes are fire-and-forget: nothing is awaited or retried.
pub struct Actuator {
    socket: UdpSocket,
    target: SocketAddr,
    channel: SourceId,
    parse_failures: u64,
    last_mode: Option<Mode>,
}

impl Actuator {
    pub async fn open(control: &ControlConfig, channels: &[ChannelConfig]) -> Result<Self> {
        let channel = channels
            .iter()
            .position(|c| c.name == control.channel)
            .map(SourceId)
            .ok_or_else(|| anyhow!("control channel {} is not configured", control.channel))?;
        let target = lookup_host(control.addr.as_str())
            .await
            .with_context(|| format!("failed to resolve control endpoint {}", control.addr))?
            .next()
            .ok_or_else(|| anyhow!("control endpoint {} resolved to no address", control.addr))?;
        Self::bind(target, channel).await
    }

    pub async fn bind(target: SocketAddr, channel: SourceId) -> Result<Self> {
        let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local)
            .await
            .context("failed to bind control socket")?;
        Ok(Self {
            socket,
            target,
            channel,
            parse_failures: 0,
            last_mode: None,
        })
    }

    pub fn channel(&self) -> SourceId {
        self.channel
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn last_mode(&self) -> Option<Mode> {
        self.last_mode
    }

    /// Re-evaluates and re-sends on every call; there is no hysteresis. An unusable
    /// trigger value skips this tick only.
    pub fn actuate(&mut self, value: Option<&str>) -> Option<Mode> {
        let value = match parse_trigger(value) {
            Ok(value) => value,
            Err(ActuationError::NoValue) => {
                tracing::trace!("no trigger value yet; skipping actuation");
                return None;
            }
            Err(err) => {
                if self.parse_failures == 0 {
                    tracing::warn!(error = %err, "skipping actuation");
                } else {
                    tracing::debug!(error = %err, "skipping actuation");
                }
                self.parse_failures += 1;
                return None;
            }
        };
        if self.parse_failures > 0 {
            tracing::info!(skipped = self.parse_failures, "trigger values parse again; actuation resumed");
            self.parse_failures = 0;
        }

        let mode = Mode::for_value(value);
        for write in mode.writes() {
            if let Err(err) = self.send(&write) {
                tracing::warn!(error = %err, property = write.property, "control write dropped");
            }
        }
        self.last_mode = Some(mode);
        Some(mode)
    }

    fn send(&self, write: &PropertyWrite) -> Result<(), ActuationError> {
        self.socket
            .try_send_to(&write.encode(), self.target)
            .map(|_| ())
            .map_err(|source| ActuationError::Send {
                target: self.target,
                source,
            })
    }
}
