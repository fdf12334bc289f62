use futures::FutureExt;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// Stable handle for a registered stream; doubles as the channel index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub usize);

#[derive(Debug)]
pub enum ReadOutcome {
    Data(usize),
    /// Nothing buffered right now.
    Idle,
    /// Peer closed the stream.
    Closed,
    Failed(io::Error),
}

/// What one wait cycle observed: whether the clock fired, and which sources were
/// readable in the same cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub clock_fired: bool,
    /// Clock expirations drained by this wait; above one means ticks were coalesced.
    pub expirations: u64,
    pub ready: Vec<bool>,
}

impl Readiness {
    pub fn is_ready(&self, id: SourceId) -> bool {
        self.ready.get(id.0).copied().unwrap_or(false)
    }
}

/// Periodic tick source. The first firing lands one period after creation.
pub struct SamplingClock {
    interval: Interval,
    period: Duration,
}

impl SamplingClock {
    pub fn new(period: Duration) -> Self {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval, period }
    }

    /// Waits for the next firing and returns how many expirations it covers. Missed
    /// expirations are folded into this one so a slow tick never causes a burst of
    /// back-to-back firings.
    pub async fn fire(&mut self) -> u64 {
        let scheduled = self.interval.tick().await;
        let late = Instant::now().saturating_duration_since(scheduled);
        let missed = late.as_nanos() / self.period.as_nanos().max(1);
        1 + u64::try_from(missed).unwrap_or(u64::MAX - 1)
    }
}

struct Source {
    name: String,
    stream: TcpStream,
}

impl Source {
    fn probe_readable(&self) -> io::Result<bool> {
        match self.stream.readable().now_or_never() {
            Some(Ok(())) => Ok(true),
            Some(Err(err)) => Err(err),
            None => Ok(false),
        }
    }
}

/// Owns the registered streams and the sampling clock, and waits on both.
pub struct Poller {
    sources: Vec<Source>,
    clock: SamplingClock,
    wait_bound: Duration,
}

impl Poller {
    pub fn new(tick: Duration) -> Self {
        Self {
            sources: Vec::new(),
            clock: SamplingClock::new(tick),
            wait_bound: tick,
        }
    }

    pub fn register(&mut self, name: impl Into<String>, stream: TcpStream) -> SourceId {
        self.sources.push(Source {
            name: name.into(),
            stream,
        });
        SourceId(self.sources.len() - 1)
    }

    pub fn ids(&self) -> impl Iterator<Item = SourceId> {
        (0..self.sources.len()).map(SourceId)
    }

    pub fn name(&self, id: SourceId) -> &str {
        self.sources
            .get(id.0)
            .map(|source| source.name.as_str())
            .unwrap_or("unknown")
    }

    /// Blocks for at most one tick interval. The clock gates processing; the bound
    /// only keeps the loop alive if the clock is late. Source readiness is sampled
    /// after the wait without blocking, so streams with pending bytes do not wake
    /// the loop between ticks.
    pub async fn wait(&mut self) -> io::Result<Readiness> {
        let expirations = time::timeout(self.wait_bound, self.clock.fire())
            .await
            .unwrap_or(0);
        let ready = self
            .sources
            .iter()
            .map(Source::probe_readable)
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Readiness {
            clock_fired: expirations > 0,
            expirations,
            ready,
        })
    }

    /// One bounded non-blocking read. `buf.len()` caps how much of the backlog is
    /// consumed per tick.
    pub fn read(&self, id: SourceId, buf: &mut [u8]) -> ReadOutcome {
        let Some(source) = self.sources.get(id.0) else {
            return ReadOutcome::Idle;
        };
        match source.stream.try_read(buf) {
            Ok(0) => ReadOutcome::Closed,
            Ok(n) => ReadOutcome::Data(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => ReadOutcome::Idle,
            Err(err) => ReadOutcome::Failed(err),
        }
    }
}
