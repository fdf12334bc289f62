use anyhow::{anyhow, bail, Context, Result};
use dotenvy::dotenv;
use serde::Serialize;
use std::collections::HashSet;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_STREAM_ADDRS: &str = "127.0.0.1:4001,127.0.0.1:4002,127.0.0.1:4003";
const DEFAULT_CHANNEL_NAMES: &str = "out1,out2,out3";
const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:4000";
const DEFAULT_CONTROL_CHANNEL: &str = "out3";
const DEFAULT_READ_BUFFER_BYTES: u64 = 1024;

/// Whether a channel keeps its last value across ticks with no new data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Staleness {
    /// Every tick starts from the placeholder.
    Reset,
    /// The last real value persists until replaced.
    Sticky,
}

impl FromStr for Staleness {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "reset" => Ok(Self::Reset),
            "sticky" => Ok(Self::Sticky),
            other => Err(anyhow!("unknown staleness policy {other:?} (expected reset or sticky)")),
        }
    }
}

impl fmt::Display for Staleness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reset => f.write_str("reset"),
            Self::Sticky => f.write_str("sticky"),
        }
    }
}

/// The two observed deployments; a profile only changes defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Aggregate,
    Actuate,
}

impl Profile {
    fn tick_ms(self) -> u64 {
        match self {
            Self::Aggregate => 100,
            Self::Actuate => 20,
        }
    }

    fn staleness(self) -> Staleness {
        match self {
            Self::Aggregate => Staleness::Reset,
            Self::Actuate => Staleness::Sticky,
        }
    }

    fn control_addr(self) -> Option<&'static str> {
        match self {
            Self::Aggregate => None,
            Self::Actuate => Some(DEFAULT_CONTROL_ADDR),
        }
    }
}

impl FromStr for Profile {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "aggregate" => Ok(Self::Aggregate),
            "actuate" => Ok(Self::Actuate),
            other => Err(anyhow!("unknown profile {other:?} (expected aggregate or actuate)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub name: String,
    pub addr: String,
    pub staleness: Staleness,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlConfig {
    pub addr: String,
    pub channel: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub channels: Vec<ChannelConfig>,
    pub tick_interval: Duration,
    pub read_buffer_bytes: usize,
    pub control: Option<ControlConfig>,
    pub http_bind: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let profile = match vars.optional("SAMPLER_PROFILE") {
            Some(raw) => raw.parse::<Profile>().context("invalid SAMPLER_PROFILE")?,
            None => Profile::Aggregate,
        };

        let addrs = split_list(&vars.string("SAMPLER_STREAM_ADDRS", DEFAULT_STREAM_ADDRS));
        if addrs.is_empty() {
            bail!("SAMPLER_STREAM_ADDRS must name at least one stream endpoint");
        }
        let names = match vars.optional("SAMPLER_CHANNEL_NAMES") {
            Some(raw) => split_list(&raw),
            None if addrs.len() == 3 => split_list(DEFAULT_CHANNEL_NAMES),
            None => (1..=addrs.len()).map(|idx| format!("out{idx}")).collect(),
        };
        if names.len() != addrs.len() {
            bail!(
                "SAMPLER_CHANNEL_NAMES has {} entries but SAMPLER_STREAM_ADDRS has {}",
                names.len(),
                addrs.len()
            );
        }
        let mut seen = HashSet::new();
        for name in &names {
            if !seen.insert(name.as_str()) {
                bail!("duplicate channel name {name:?}");
            }
        }

        let default_staleness = match vars.optional("SAMPLER_STALENESS") {
            Some(raw) => raw.parse::<Staleness>().context("invalid SAMPLER_STALENESS")?,
            None => profile.staleness(),
        };

        let mut channels: Vec<ChannelConfig> = names
            .into_iter()
            .zip(addrs)
            .map(|(name, addr)| ChannelConfig {
                name,
                addr,
                staleness: default_staleness,
            })
            .collect();

        if let Some(raw) = vars.optional("SAMPLER_CHANNEL_STALENESS") {
            for entry in split_list(&raw) {
                let (name, policy) = entry
                    .split_once('=')
                    .ok_or_else(|| anyhow!("invalid SAMPLER_CHANNEL_STALENESS entry {entry:?}"))?;
                let name = name.trim();
                let policy = policy
                    .parse::<Staleness>()
                    .with_context(|| format!("invalid SAMPLER_CHANNEL_STALENESS for {name}"))?;
                let channel = channels
                    .iter_mut()
                    .find(|channel| channel.name == name)
                    .ok_or_else(|| anyhow!("SAMPLER_CHANNEL_STALENESS names unknown channel {name:?}"))?;
                channel.staleness = policy;
            }
        }

        let tick_ms = vars.u64("SAMPLER_TICK_MS", profile.tick_ms())?;
        if tick_ms == 0 {
            bail!("SAMPLER_TICK_MS must be greater than zero");
        }
        let read_buffer_bytes = vars.u64("SAMPLER_READ_BUFFER_BYTES", DEFAULT_READ_BUFFER_BYTES)?;
        if read_buffer_bytes == 0 {
            bail!("SAMPLER_READ_BUFFER_BYTES must be greater than zero");
        }

        let control_addr = match vars.optional("SAMPLER_CONTROL_ADDR") {
            Some(raw) if raw.eq_ignore_ascii_case("none") => None,
            Some(raw) => Some(raw),
            None => profile.control_addr().map(str::to_string),
        };
        let control = match control_addr {
            Some(addr) => {
                let channel = vars.string("SAMPLER_CONTROL_CHANNEL", DEFAULT_CONTROL_CHANNEL);
                if !channels.iter().any(|c| c.name == channel) {
                    bail!("SAMPLER_CONTROL_CHANNEL {channel:?} is not a configured channel");
                }
                Some(ControlConfig { addr, channel })
            }
            None => None,
        };

        let http_bind = vars.optional("SAMPLER_HTTP_BIND");

        Ok(Self {
            channels,
            tick_interval: Duration::from_millis(tick_ms),
            read_buffer_bytes: usize::try_from(read_buffer_bytes)
                .context("invalid SAMPLER_READ_BUFFER_BYTES")?,
            control,
            http_bind,
        })
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn u64(&self, key: &str, default: u64) -> Result<u64> {
        match self.optional(key) {
            Some(value) => value.parse::<u64>().with_context(|| format!("invalid {key}")),
            None => Ok(default),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}
