use crate::actuator::{Actuator, Mode};
use crate::config::{ChannelConfig, Staleness};
use crate::extract::latest_value;
use crate::poller::{Poller, ReadOutcome, Readiness, SourceId};
use crate::snapshot::{ChannelValue, Snapshot, PLACEHOLDER};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::io::Write;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct ChannelState {
    pub name: String,
    pub staleness: Staleness,
    latest: Option<String>,
    fresh: bool,
    closed: bool,
}

impl ChannelState {
    fn new(config: &ChannelConfig) -> Self {
        Self {
            name: config.name.clone(),
            staleness: config.staleness,
            latest: None,
            fresh: false,
            closed: false,
        }
    }

    pub fn latest(&self) -> Option<&str> {
        self.latest.as_deref()
    }

    pub fn has_fresh_data(&self) -> bool {
        self.fresh
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Per-channel latest-value cells, indexed by [`SourceId`]. Only the control loop
/// mutates them.
#[derive(Debug, Clone)]
pub struct Assembler {
    channels: Vec<ChannelState>,
}

impl Assembler {
    pub fn new(configs: &[ChannelConfig]) -> Self {
        Self {
            channels: configs.iter().map(ChannelState::new).collect(),
        }
    }

    pub fn channels(&self) -> &[ChannelState] {
        &self.channels
    }

    pub fn latest(&self, id: SourceId) -> Option<&str> {
        self.channels.get(id.0).and_then(ChannelState::latest)
    }

    /// Clears per-tick freshness and drops values of reset-policy channels.
    pub fn begin_tick(&mut self) {
        for channel in &mut self.channels {
            channel.fresh = false;
            if channel.staleness == Staleness::Reset {
                channel.latest = None;
            }
        }
    }

    /// Stores the latest complete record of a non-empty read.
    pub fn record(&mut self, id: SourceId, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        if let Some(channel) = self.channels.get_mut(id.0) {
            channel.latest = Some(latest_value(chunk));
            channel.fresh = true;
        }
    }

    /// Returns true the first time a channel is seen closed.
    pub fn mark_closed(&mut self, id: SourceId) -> bool {
        match self.channels.get_mut(id.0) {
            Some(channel) if !channel.closed => {
                channel.closed = true;
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self, timestamp_ms: i64) -> Snapshot {
        Snapshot {
            timestamp_ms,
            channels: self
                .channels
                .iter()
                .map(|channel| ChannelValue {
                    name: channel.name.clone(),
                    value: channel.latest().unwrap_or(PLACEHOLDER).to_string(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub name: String,
    pub staleness: Staleness,
    pub fresh: bool,
    pub closed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActuationStatus {
    pub target: String,
    pub channel: String,
    pub last_mode: Option<Mode>,
}

/// Read-only view published after every emitted snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SamplerStatus {
    pub ticks: u64,
    pub snapshot: Snapshot,
    pub channels: Vec<ChannelStatus>,
    pub actuation: Option<ActuationStatus>,
}

/// The control loop: wait, assemble, emit, actuate. One tick is fully handled
/// before the next wait starts.
pub struct Sampler {
    poller: Poller,
    assembler: Assembler,
    actuator: Option<Actuator>,
    buf: Vec<u8>,
    ticks: u64,
    last_timestamp_ms: i64,
    status: Option<watch::Sender<Option<SamplerStatus>>>,
}

impl Sampler {
    pub fn new(
        poller: Poller,
        assembler: Assembler,
        read_buffer_bytes: usize,
        actuator: Option<Actuator>,
    ) -> Self {
        Self {
            poller,
            assembler,
            actuator,
            buf: vec![0u8; read_buffer_bytes.max(1)],
            ticks: 0,
            last_timestamp_ms: i64::MIN,
            status: None,
        }
    }

    pub fn with_status(mut self, tx: watch::Sender<Option<SamplerStatus>>) -> Self {
        self.status = Some(tx);
        self
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub async fn run<W: Write>(mut self, out: &mut W) -> Result<()> {
        loop {
            self.step(out).await?;
        }
    }

    /// Runs one wait cycle. Returns the emitted snapshot when the clock fired.
    pub async fn step<W: Write>(&mut self, out: &mut W) -> Result<Option<Snapshot>> {
        let readiness = self.poller.wait().await.context("readiness wait failed")?;
        if !readiness.clock_fired {
            return Ok(None);
        }
        if readiness.expirations > 1 {
            tracing::debug!(missed = readiness.expirations - 1, "sampling clock fell behind");
        }

        let snapshot = self.assemble(&readiness);
        snapshot.write_line(out).context("failed to emit snapshot")?;
        self.ticks += 1;

        if let Some(actuator) = self.actuator.as_mut() {
            let value = self.assembler.latest(actuator.channel());
            actuator.actuate(value);
        }

        self.publish_status(&snapshot);
        Ok(Some(snapshot))
    }

    fn assemble(&mut self, readiness: &Readiness) -> Snapshot {
        // Captured once per tick; clamped so a wall-clock step back never reorders output.
        let timestamp_ms = Utc::now().timestamp_millis().max(self.last_timestamp_ms);
        self.last_timestamp_ms = timestamp_ms;

        self.assembler.begin_tick();
        let ids: Vec<SourceId> = self.poller.ids().collect();
        for id in ids {
            if !readiness.is_ready(id) {
                continue;
            }
            match self.poller.read(id, &mut self.buf) {
                ReadOutcome::Data(n) => self.assembler.record(id, &self.buf[..n]),
                ReadOutcome::Idle => {}
                ReadOutcome::Closed => {
                    if self.assembler.mark_closed(id) {
                        tracing::warn!(channel = %self.poller.name(id), "stream closed by peer");
                    }
                }
                ReadOutcome::Failed(err) => {
                    tracing::debug!(channel = %self.poller.name(id), error = %err, "stream read failed");
                }
            }
        }

        self.assembler.snapshot(timestamp_ms)
    }

    fn publish_status(&self, snapshot: &Snapshot) {
        let Some(tx) = self.status.as_ref() else {
            return;
        };
        let channels = self
            .assembler
            .channels()
            .iter()
            .map(|channel| ChannelStatus {
                name: channel.name.clone(),
                staleness: channel.staleness,
                fresh: channel.has_fresh_data(),
                closed: channel.is_closed(),
            })
            .collect();
        let actuation = self.actuator.as_ref().map(|actuator| ActuationStatus {
            target: actuator.target().to_string(),
            channel: self.poller.name(actuator.channel()).to_string(),
            last_mode: actuator.last_mode(),
        });
        tx.send_replace(Some(SamplerStatus {
            ticks: self.ticks,
            snapshot: snapshot.clone(),
            channels,
            actuation,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::PropertyWrite;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream, UdpSocket};

    fn configs(policies: &[(&str, Staleness)]) -> Vec<ChannelConfig> {
        policies
            .iter()
            .map(|(name, staleness)| ChannelConfig {
                name: name.to_string(),
                addr: "127.0.0.1:0".to_string(),
                staleness: *staleness,
            })
            .collect()
    }

    fn values(snapshot: &Snapshot) -> Vec<&str> {
        snapshot.channels.iter().map(|c| c.value.as_str()).collect()
    }

    #[test]
    fn reset_channel_reports_placeholder_when_silent() {
        let mut assembler = Assembler::new(&configs(&[("out1", Staleness::Reset)]));
        assembler.begin_tick();
        assembler.record(SourceId(0), b"12.5\n");
        assert_eq!(values(&assembler.snapshot(1)), ["12.5"]);

        assembler.begin_tick();
        assert_eq!(values(&assembler.snapshot(2)), [PLACEHOLDER]);
    }

    #[test]
    fn sticky_channel_keeps_last_value() {
        let mut assembler = Assembler::new(&configs(&[("out1", Staleness::Sticky)]));
        assembler.begin_tick();
        assert_eq!(values(&assembler.snapshot(0)), [PLACEHOLDER]);

        assembler.record(SourceId(0), b"12.5\n");
        assembler.snapshot(1);
        for tick in 2..6 {
            assembler.begin_tick();
            assert_eq!(values(&assembler.snapshot(tick)), ["12.5"]);
        }
        assert!(!assembler.channels()[0].has_fresh_data());
    }

    #[test]
    fn empty_read_never_overwrites() {
        let mut assembler = Assembler::new(&configs(&[("out1", Staleness::Sticky)]));
        assembler.begin_tick();
        assembler.record(SourceId(0), b"4\n");
        assembler.begin_tick();
        assembler.record(SourceId(0), b"");
        assert_eq!(assembler.latest(SourceId(0)), Some("4"));
    }

    #[test]
    fn mixed_policies_per_channel() {
        let mut assembler = Assembler::new(&configs(&[
            ("out1", Staleness::Reset),
            ("out2", Staleness::Sticky),
            ("out3", Staleness::Reset),
        ]));
        assembler.begin_tick();
        assembler.record(SourceId(0), b"1\n");
        assembler.record(SourceId(1), b"2\n");
        assembler.record(SourceId(2), b"1.0\n2.0\n3.0");
        assert_eq!(values(&assembler.snapshot(1)), ["1", "2", "2.0"]);

        assembler.begin_tick();
        assert_eq!(values(&assembler.snapshot(2)), [PLACEHOLDER, "2", PLACEHOLDER]);
    }

    #[test]
    fn closed_is_reported_once() {
        let mut assembler = Assembler::new(&configs(&[("out1", Staleness::Reset)]));
        assert!(assembler.mark_closed(SourceId(0)));
        assert!(!assembler.mark_closed(SourceId(0)));
        assert!(assembler.channels()[0].is_closed());
    }

    struct Harness {
        sampler: Sampler,
        servers: Vec<TcpStream>,
    }

    async fn harness(
        policy: Staleness,
        tick: Duration,
        actuator: Option<(SocketAddr, usize)>,
    ) -> Harness {
        let names = ["out1", "out2", "out3"];
        let configs = configs(&names.map(|name| (name, policy)));
        let mut poller = Poller::new(tick);
        let mut servers = Vec::new();
        for name in names {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
            let (server, _) = listener.accept().await.unwrap();
            poller.register(name, client);
            servers.push(server);
        }
        let actuator = match actuator {
            Some((target, channel)) => {
                Some(Actuator::bind(target, SourceId(channel)).await.unwrap())
            }
            None => None,
        };
        Harness {
            sampler: Sampler::new(poller, Assembler::new(&configs), 1024, actuator),
            servers,
        }
    }

    async fn next_snapshot(sampler: &mut Sampler, out: &mut Vec<u8>) -> Snapshot {
        loop {
            if let Some(snapshot) = sampler.step(out).await.unwrap() {
                return snapshot;
            }
        }
    }

    async fn silent_channel_scenario(policy: Staleness) -> Vec<Snapshot> {
        let mut h = harness(policy, Duration::from_millis(20), None).await;
        h.servers[2].write_all(b"12.5\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut out = Vec::new();
        let mut snapshots = Vec::new();
        for _ in 0..4 {
            snapshots.push(next_snapshot(&mut h.sampler, &mut out).await);
        }
        snapshots
    }

    #[tokio::test]
    async fn silent_channel_resets_under_reset_policy() {
        let snapshots = silent_channel_scenario(Staleness::Reset).await;
        assert_eq!(snapshots[0].value("out3"), Some("12.5"));
        assert_eq!(snapshots[0].value("out1"), Some(PLACEHOLDER));
        for snapshot in &snapshots[1..] {
            assert_eq!(snapshot.value("out3"), Some(PLACEHOLDER));
        }
    }

    #[tokio::test]
    async fn silent_channel_persists_under_sticky_policy() {
        let snapshots = silent_channel_scenario(Staleness::Sticky).await;
        for snapshot in &snapshots {
            assert_eq!(snapshot.value("out3"), Some("12.5"));
            assert_eq!(snapshot.value("out2"), Some(PLACEHOLDER));
        }
    }

    #[tokio::test]
    async fn emits_one_snapshot_per_clock_firing() {
        let mut h = harness(Staleness::Reset, Duration::from_millis(15), None).await;
        let mut out = Vec::new();
        let mut emitted = Vec::new();
        while emitted.len() < 5 {
            if let Some(snapshot) = h.sampler.step(&mut out).await.unwrap() {
                emitted.push(snapshot);
            }
        }

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 5);
        assert_eq!(h.sampler.ticks(), 5);
        assert!(emitted
            .windows(2)
            .all(|pair| pair[0].timestamp_ms <= pair[1].timestamp_ms));
        for line in text.lines() {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(parsed["timestamp"].is_i64());
        }
    }

    #[tokio::test]
    async fn actuates_from_designated_channel_after_emitting() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();
        let mut h = harness(Staleness::Sticky, Duration::from_millis(20), Some((target, 2))).await;
        h.servers[2].write_all(b"3.0\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut out = Vec::new();
        let snapshot = next_snapshot(&mut h.sampler, &mut out).await;
        assert_eq!(snapshot.value("out3"), Some("3.0"));
        assert_eq!(out.iter().filter(|b| **b == b'\n').count(), 1);

        let mut writes = Vec::new();
        let mut buf = [0u8; 16];
        for _ in 0..2 {
            let (n, _) = tokio::time::timeout(Duration::from_secs(1), receiver.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            writes.push(PropertyWrite::decode(&buf[..n]).unwrap());
        }
        assert_eq!(writes, Mode::High.writes());
    }

    #[tokio::test]
    async fn skips_actuation_until_designated_channel_has_data() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();
        let mut h = harness(Staleness::Sticky, Duration::from_millis(20), Some((target, 2))).await;

        let mut out = Vec::new();
        next_snapshot(&mut h.sampler, &mut out).await;
        let mut buf = [0u8; 16];
        let nothing =
            tokio::time::timeout(Duration::from_millis(30), receiver.recv_from(&mut buf)).await;
        assert!(nothing.is_err());

        h.servers[2].write_all(b"0.5\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        next_snapshot(&mut h.sampler, &mut out).await;
        let (n, _) = tokio::time::timeout(Duration::from_secs(1), receiver.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(PropertyWrite::decode(&buf[..n]), Some(Mode::Low.writes()[0]));
    }

    #[tokio::test]
    async fn publishes_status_after_each_tick() {
        let mut h = harness(Staleness::Sticky, Duration::from_millis(20), None).await;
        let (tx, rx) = watch::channel(None);
        h.sampler = h.sampler.with_status(tx);

        let mut out = Vec::new();
        next_snapshot(&mut h.sampler, &mut out).await;
        next_snapshot(&mut h.sampler, &mut out).await;

        let status = rx.borrow().clone().unwrap();
        assert_eq!(status.ticks, 2);
        assert_eq!(status.channels.len(), 3);
        assert!(status.actuation.is_none());
        assert_eq!(status.snapshot.value("out1"), Some(PLACEHOLDER));
    }
}
