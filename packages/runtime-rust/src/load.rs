//! Process load sampling and the admission check built on it.
//!
//! A background sampler refreshes one [`LoadSample`] every `sampleInterval`
//! milliseconds. Readers never block the sampler: the latest sample is
//! published through an `ArcSwap`. Event-loop delay is measured as the
//! lateness of the sampler's own timer, which grows when the scheduler is
//! saturated.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use hemera_core::HemeraError;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::config::{LoadConfig, LoadPolicy};

// ---------------------------------------------------------------------------
// Samples and probes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSample {
    /// Scheduler delay in milliseconds.
    pub event_loop_delay: u64,
    pub heap_used_bytes: u64,
    pub rss_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub heap_used_bytes: u64,
    pub rss_bytes: u64,
}

/// Source of process memory figures.
pub trait ProcessProbe: Send + Sync + 'static {
    /// Current memory usage, or `None` when it cannot be determined.
    fn memory(&self) -> Option<MemoryUsage>;
}

/// Reads `VmRSS` and `VmData` from `/proc/self/status`. Both are reported
/// in kB whatever the page size; the data segment stands in for heap usage.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcfsProbe;

impl ProcfsProbe {
    fn parse_status(status: &str) -> Option<MemoryUsage> {
        let mut rss = None;
        let mut data = None;
        for line in status.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let slot = match key {
                "VmRSS" => &mut rss,
                "VmData" => &mut data,
                _ => continue,
            };
            *slot = Self::parse_kib(value);
        }
        Some(MemoryUsage {
            heap_used_bytes: data?,
            rss_bytes: rss?,
        })
    }

    /// `"  1234 kB"` to bytes.
    fn parse_kib(value: &str) -> Option<u64> {
        let mut parts = value.split_whitespace();
        let amount: u64 = parts.next()?.parse().ok()?;
        match parts.next() {
            Some("kB") => Some(amount.saturating_mul(1024)),
            _ => None,
        }
    }
}

impl ProcessProbe for ProcfsProbe {
    fn memory(&self) -> Option<MemoryUsage> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        Self::parse_status(&status)
    }
}

/// The metric that failed an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMetric {
    HeapUsed,
    Rss,
    EventLoopDelay,
}

impl LoadMetric {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::HeapUsed => "heapUsed",
            Self::Rss => "rss",
            Self::EventLoopDelay => "eventLoopDelay",
        }
    }
}

impl fmt::Display for LoadMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// LoadMonitor
// ---------------------------------------------------------------------------

struct Sampler {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Latest process sample plus the admission policy.
pub struct LoadMonitor {
    config: LoadConfig,
    sample: Arc<ArcSwap<LoadSample>>,
    sampler: Mutex<Option<Sampler>>,
}

impl LoadMonitor {
    #[must_use]
    pub fn new(config: LoadConfig) -> Self {
        Self {
            config,
            sample: Arc::new(ArcSwap::from_pointee(LoadSample::default())),
            sampler: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &LoadPolicy {
        &self.config.policy
    }

    /// Starts the background sampler. Does nothing when the sample interval
    /// is zero or a sampler is already running.
    pub fn start(&self, probe: Arc<dyn ProcessProbe>) {
        let interval_ms = self.config.process.sample_interval;
        if interval_ms == 0 {
            return;
        }
        let mut slot = self.sampler.lock();
        if slot.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let target = Arc::clone(&self.sample);
        let period = Duration::from_millis(interval_ms);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    scheduled = ticker.tick() => {
                        let lateness = Instant::now().saturating_duration_since(scheduled);
                        let memory = probe.memory().unwrap_or_default();
                        let sample = LoadSample {
                            event_loop_delay: u64::try_from(lateness.as_millis()).unwrap_or(u64::MAX),
                            heap_used_bytes: memory.heap_used_bytes,
                            rss_bytes: memory.rss_bytes,
                        };
                        trace!(?sample, "load sample");
                        target.store(Arc::new(sample));
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        debug!(interval_ms, "load sampler started");
        *slot = Some(Sampler { shutdown_tx, handle });
    }

    /// Stops the sampler and waits for it to finish.
    pub async fn stop(&self) {
        let sampler = self.sampler.lock().take();
        if let Some(Sampler { shutdown_tx, handle }) = sampler {
            let _ = shutdown_tx.send(());
            let _ = handle.await;
        }
    }

    #[must_use]
    pub fn sample(&self) -> LoadSample {
        **self.sample.load()
    }

    /// Publishes a sample taken elsewhere.
    pub fn record(&self, sample: LoadSample) {
        self.sample.store(Arc::new(sample));
    }

    /// The first policy threshold the latest sample exceeds; zero
    /// thresholds are unlimited.
    #[must_use]
    pub fn exceeded(&self) -> Option<(LoadMetric, u64, u64)> {
        let sample = self.sample();
        let policy = &self.config.policy;
        [
            (LoadMetric::HeapUsed, sample.heap_used_bytes, policy.max_heap_used_bytes),
            (LoadMetric::Rss, sample.rss_bytes, policy.max_rss_bytes),
            (LoadMetric::EventLoopDelay, sample.event_loop_delay, policy.max_event_loop_delay),
        ]
        .into_iter()
        .find(|(_, value, limit)| *limit > 0 && value > limit)
    }

    /// Admission check run for every inbound request.
    ///
    /// # Errors
    ///
    /// Returns a `ProcessLoadError` naming the exceeded metric when the
    /// policy is enforced and exceeded.
    pub fn check(&self) -> Result<(), HemeraError> {
        if !self.config.check_policy {
            return Ok(());
        }
        match self.exceeded() {
            None => Ok(()),
            Some((metric, value, limit)) => Err(HemeraError::process_load(format!(
                "{metric} of {value} exceeds the limit of {limit}"
            ))
            .with_property("metric", metric.name())
            .with_property("value", value)
            .with_property("limit", limit)),
        }
    }
}

impl fmt::Debug for LoadMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadMonitor")
            .field("config", &self.config)
            .field("sample", &self.sample())
            .finish_non_exhaustive()
    }
}
