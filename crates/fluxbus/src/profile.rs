//! Scenario profiles and the configuration advisor.
//!
//! A [`Profile`] describes the workload (concurrency, throughput target,
//! latency class, memory posture); the [`Advisor`] turns it into concrete
//! construction parameters. Three presets cover the common scenarios, and
//! [`auto_detect`] picks between sync and async from the core count.

use std::time::Duration;

/// Latency expectation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Latency {
    /// Tail latency matters but microseconds do not.
    Low,
    /// Throughput-oriented, batching acceptable.
    Medium,
    /// Latency largely irrelevant.
    High,
    /// Every emit is on a request path.
    UltraLow,
}

/// Memory posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemPosture {
    /// Keep allocations minimal.
    Minimal,
    /// Balance memory against throughput.
    Balanced,
    /// Spend memory freely for speed.
    Unbounded,
}

/// Which dispatcher a profile selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Impl {
    /// Inline dispatch.
    Sync,
    /// Sharded SPSC scheduler.
    Async,
    /// Batching pipeline.
    Flow,
}

/// Self-tuning switches.
#[derive(Debug, Clone, Copy)]
pub struct Auto {
    /// Master switch.
    pub enabled: bool,
    /// Adaptive batching.
    pub batch: bool,
    /// Back-pressure control.
    pub backpressure: bool,
    /// Automatic degradation under overload.
    pub degradation: bool,
}

/// A workload description used to derive bus construction parameters.
#[derive(Debug, Clone)]
pub struct Profile {
    /// Scenario name: `"sync"`, `"async"`, `"flow"` or `"auto"`.
    pub name: String,
    /// Expected concurrent producers.
    pub concurrency: usize,
    /// Target throughput in events per second.
    pub tps: usize,
    /// Latency class.
    pub latency: Latency,
    /// Memory posture.
    pub mem: MemPosture,
    /// Core count to size against.
    pub cores: usize,
    /// Selected implementation.
    pub implementation: Impl,
    /// Enable the payload arena.
    pub enable_arena: bool,
    /// Flow batch window. Zero means the default.
    pub batch_timeout: Duration,
    /// Self-tuning switches.
    pub auto: Auto,
}

impl Profile {
    /// Synchronous direct-call scenario: RPC chains, gateway middleware,
    /// permission checks.
    #[must_use]
    pub fn sync() -> Self {
        Self {
            name: "sync".to_string(),
            concurrency: 1000,
            tps: 10_000,
            latency: Latency::Low,
            mem: MemPosture::Balanced,
            cores: num_cpus::get(),
            implementation: Impl::Sync,
            enable_arena: false,
            batch_timeout: Duration::ZERO,
            auto: Auto {
                enabled: true,
                batch: false,
                backpressure: false,
                degradation: true,
            },
        }
    }

    /// High-throughput pub/sub scenario: log aggregation, live pushes,
    /// market data fan-out.
    #[must_use]
    pub fn r#async() -> Self {
        Self {
            name: "async".to_string(),
            concurrency: 100_000,
            tps: 500_000,
            latency: Latency::UltraLow,
            mem: MemPosture::Minimal,
            cores: num_cpus::get(),
            implementation: Impl::Async,
            enable_arena: false,
            batch_timeout: Duration::ZERO,
            auto: Auto {
                enabled: true,
                batch: false,
                backpressure: false,
                degradation: false,
            },
        }
    }

    /// Pipeline scenario: streaming ETL, window aggregation, bulk loads.
    #[must_use]
    pub fn flow() -> Self {
        Self {
            name: "flow".to_string(),
            concurrency: 5000,
            tps: 50_000,
            latency: Latency::Medium,
            mem: MemPosture::Balanced,
            cores: num_cpus::get(),
            implementation: Impl::Flow,
            enable_arena: true,
            batch_timeout: Duration::from_millis(100),
            auto: Auto {
                enabled: true,
                batch: true,
                backpressure: true,
                degradation: true,
            },
        }
    }

    /// Looks up a preset by name. Unknown names fall back to sync.
    #[must_use]
    pub fn preset(name: &str) -> Self {
        match name {
            "async" => Self::r#async(),
            "flow" => Self::flow(),
            _ => Self::sync(),
        }
    }
}

/// Picks a profile from the runtime environment: four or more cores get
/// the async bus, fewer get sync. Flow is never auto-selected; it is a
/// dedicated pipeline one asks for explicitly.
#[must_use]
pub fn auto_detect() -> Profile {
    let cores = num_cpus::get();
    let mut profile = if cores >= 4 {
        Profile::r#async()
    } else {
        Profile::sync()
    };
    profile.name = "auto".to_string();
    profile.cores = cores;
    profile
}

/// Concrete construction parameters derived from a profile.
#[derive(Debug, Clone)]
pub struct Advised {
    /// The profile this advice came from.
    pub profile: Profile,
    /// Selected implementation.
    pub implementation: Impl,
    /// Scheduler ring capacity (async).
    pub ring_capacity: usize,
    /// Scheduler worker count (async). Zero means auto.
    pub workers: usize,
    /// Flow batch size.
    pub batch_size: usize,
    /// Flow batch window.
    pub batch_timeout: Duration,
    /// Event types to prewarm, empty when prewarming is off.
    pub prewarm: Vec<String>,
    /// Arena toggle.
    pub arena: bool,
}

/// Derives construction parameters from profiles.
#[derive(Debug, Default)]
pub struct Advisor;

impl Advisor {
    /// Creates an advisor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Turns a profile into concrete parameters.
    #[must_use]
    pub fn advise(&self, profile: &Profile) -> Advised {
        let mut advised = Advised {
            profile: profile.clone(),
            implementation: profile.implementation,
            ring_capacity: 0,
            workers: 0,
            batch_size: 0,
            batch_timeout: Duration::ZERO,
            prewarm: Vec::new(),
            arena: profile.enable_arena,
        };

        match profile.name.as_str() {
            "sync" => advised.implementation = Impl::Sync,
            "async" => {
                advised.implementation = Impl::Async;
                advised.ring_capacity = 8192;
                advised.workers = (profile.cores / 2).max(1);
            }
            "flow" => {
                advised.implementation = Impl::Flow;
                // Latency/throughput balance: grow batches with expected
                // concurrency.
                advised.batch_size = 200 + profile.concurrency / 50;
                advised.batch_timeout = profile.batch_timeout;
            }
            _ => {
                // Unnamed profiles: pick from the workload numbers.
                if profile.tps > 50_000
                    || profile.latency == Latency::UltraLow
                    || profile.cores >= 4
                {
                    advised.implementation = Impl::Async;
                    advised.ring_capacity = 8192;
                    advised.workers = (profile.cores / 2).max(1);
                } else {
                    advised.implementation = Impl::Sync;
                }
            }
        }

        if profile.concurrency > 5000 {
            advised.prewarm = ["event", "system", "user", "order", "log", "metric", "trace", "cmd"]
                .into_iter()
                .map(str::to_string)
                .collect();
        }

        advised
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert_eq!(Profile::preset("sync").implementation, Impl::Sync);
        assert_eq!(Profile::preset("async").implementation, Impl::Async);
        assert_eq!(Profile::preset("flow").implementation, Impl::Flow);
        assert_eq!(Profile::preset("nonsense").implementation, Impl::Sync);
    }

    #[test]
    fn test_auto_detect_never_picks_flow() {
        let profile = auto_detect();
        assert_eq!(profile.name, "auto");
        assert_ne!(profile.implementation, Impl::Flow);
    }

    #[test]
    fn test_advise_async_parameters() {
        let advised = Advisor::new().advise(&Profile::r#async());
        assert_eq!(advised.implementation, Impl::Async);
        assert_eq!(advised.ring_capacity, 8192);
        assert!(advised.workers >= 1);
        // Async preset expects heavy concurrency, so prewarming kicks in.
        assert!(!advised.prewarm.is_empty());
    }

    #[test]
    fn test_advise_flow_batch_size_scales() {
        let mut profile = Profile::flow();
        profile.concurrency = 5000;
        let advised = Advisor::new().advise(&profile);
        assert_eq!(advised.batch_size, 300);
        assert_eq!(advised.batch_timeout, Duration::from_millis(100));
        assert!(advised.arena);
    }

    #[test]
    fn test_advise_unnamed_uses_workload() {
        let mut profile = Profile::sync();
        profile.name = "custom".to_string();
        profile.tps = 1_000_000;
        let advised = Advisor::new().advise(&profile);
        assert_eq!(advised.implementation, Impl::Async);
    }
}
