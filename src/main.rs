// clockfeed: demo binary wiring a ClockFeed + InstanceManager together
//
// Illustrative process wiring only: the crate's actual deliverable is the
// library surface under `src/`. This binary exists so the crate is
// runnable end-to-end alongside its library.

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use clockfeed::config::DaemonConfig;
use clockfeed::driver::{ClockDriver, DriverPoll, EngineSink, TimeOfDaySource, TimeOfDayState, TimeOfDayStatus};
use clockfeed::error::CompareError;
use clockfeed::{ClockFeed, InstanceManager, SignedDuration};

#[derive(Parser, Debug)]
#[command(name = "clockfeed", about = "Clock-feed service and SHM servo demo daemon")]
struct Cli {
    /// Path to a TOML configuration file (layered under CLOCKFEED_* env vars).
    #[arg(short, long)]
    config: Option<String>,

    /// Override RUST_LOG if no environment value is set.
    #[arg(long, default_value = "info")]
    log_filter: String,
}

/// A free-running simulated hardware clock, used only so this binary has
/// something to drive without real PTP hardware.
struct SimulatedDriver {
    freq_ppb: std::sync::atomic::AtomicI64,
}

impl SimulatedDriver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            freq_ppb: std::sync::atomic::AtomicI64::new(0),
        })
    }
}

impl ClockDriver for SimulatedDriver {
    fn compare_to_system(&self) -> Result<SignedDuration, CompareError> {
        Ok(SignedDuration::ZERO)
    }
    fn enable_shm(&self) -> Result<(), String> {
        Ok(())
    }
    fn disable_shm(&self) {}
    fn get_event(&self) -> Result<DriverPoll, String> {
        Ok(DriverPoll::WouldBlock)
    }
    fn adjust_frequency(&self, ppb: f64) -> Result<(), String> {
        self.freq_ppb
            .store(ppb as i64, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }
    fn adjust_time(&self, _offset: SignedDuration) -> Result<(), String> {
        Ok(())
    }
    fn get_freq_correction(&self) -> f64 {
        self.freq_ppb.load(std::sync::atomic::Ordering::Relaxed) as f64
    }
    fn save_freq_correction(&self, _ppb: f64) {}
    fn get_max_frequency_adjustment(&self) -> f64 {
        100_000.0
    }
}

struct LockedTimeOfDay;
impl TimeOfDaySource for LockedTimeOfDay {
    fn get_status(&self) -> Result<TimeOfDayStatus, String> {
        Ok(TimeOfDayStatus {
            state: TimeOfDayState::Slave,
            offset_from_master: SignedDuration::ZERO,
        })
    }
}

struct LoggingEngine;
impl EngineSink for LoggingEngine {
    fn post_rt_stats(&self, instance_name: &str, offset_ns: i128, freq_ppb: f64, in_sync: bool) {
        info!(instance = instance_name, offset_ns, freq_ppb, in_sync, "rt-stats");
    }
    fn clustering_input(&self, instance_name: &str, offset_ns: i128, score: f64) {
        info!(instance = instance_name, offset_ns, score, "clustering input");
    }
    fn sync_instance_state_changed(&self, instance_name: &str, state: &str) {
        info!(instance = instance_name, state, "instance state changed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_filter.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = DaemonConfig::load(cli.config.as_deref())?;
    if config.instances.is_empty() {
        info!("no instances configured; nothing to run");
        return Ok(());
    }

    let feed = ClockFeed::new();
    let manager = Arc::new(InstanceManager::new(feed.clone()));

    let mut drivers: HashMap<String, Arc<dyn ClockDriver>> = HashMap::new();
    let mut tods: HashMap<String, Arc<dyn TimeOfDaySource>> = HashMap::new();
    for instance in &config.instances {
        drivers.insert(instance.interface.clone(), SimulatedDriver::new());
        tods.insert(instance.interface.clone(), Arc::new(LockedTimeOfDay));
    }
    let engine: Arc<dyn EngineSink> = Arc::new(LoggingEngine);

    let mut next_handle = 1u64;
    manager.load(&config, &drivers, &tods, engine, &mut next_handle)?;

    info!(instances = ?manager.instance_names(), "starting clockfeed daemon");

    let _poll_handle = feed.spawn_poll_loop();
    let _pump_handle = manager.spawn_event_pump()?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install ctrl-c handler");
    }
    info!("shutdown signal received");
    feed.shutdown();
    Ok(())
}
