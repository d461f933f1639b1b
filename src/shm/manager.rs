// clockfeed: Instance Manager (C5)
//
// Owns the set of live ServoInstances, each bound to a distinct hardware
// clock, and routes control messages to them. Drives each instance's
// per-event pipeline off the feed's SYNC_EVENT notifications plus its own
// housekeeping tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::driver::{ClockDriver, EngineSink, TimeOfDaySource};
use crate::error::{ServoError, ServoResult};
use crate::feed::{ClockFeed, ClockHandle};
use crate::shm::instance::ServoInstance;

/// Out-of-band control surface for a running instance.
#[derive(Debug, Clone)]
pub enum ControlMessage {
    GetStatus,
    Control { mask: u8, flags: u8 },
    StepClock(i128),
    LogStats(Instant),
    SaveState,
    WriteTopology,
    StatsEndPeriod(Instant),
    TestMode(u32),
    ServoPidAdjust {
        kp: f64,
        ki: f64,
        kd: f64,
        reset: bool,
        type_mask: u8,
    },
}

struct ManagedInstance {
    servo: Mutex<ServoInstance>,
    clock: ClockHandle,
}

/// Creates and tears down one `ServoInstance` per configuration block,
/// each bound to a distinct hardware clock: one instance per configured
/// SHM source, and binding two instances to the same clock handle is
/// rejected.
pub struct InstanceManager {
    feed: ClockFeed,
    instances: Mutex<HashMap<String, Arc<ManagedInstance>>>,
    bound_clocks: Mutex<HashMap<ClockHandle, String>>,
}

impl InstanceManager {
    pub fn new(feed: ClockFeed) -> Self {
        Self {
            feed,
            instances: Mutex::new(HashMap::new()),
            bound_clocks: Mutex::new(HashMap::new()),
        }
    }

    /// Build every instance named in `config`, registering each clock with
    /// the feed first.
    pub fn load(
        &self,
        config: &DaemonConfig,
        drivers: &HashMap<String, Arc<dyn ClockDriver>>,
        tods: &HashMap<String, Arc<dyn TimeOfDaySource>>,
        engine: Arc<dyn EngineSink>,
        next_clock_handle: &mut u64,
    ) -> ServoResult<()> {
        for block in &config.instances {
            let driver = drivers.get(&block.interface).cloned().ok_or_else(|| {
                ServoError::Manager(format!("no driver registered for interface `{}`", block.interface))
            })?;
            let tod_name = block.time_of_day.as_deref().unwrap_or(&block.interface);
            let tod = tods
                .get(tod_name)
                .cloned()
                .ok_or_else(|| ServoError::Manager(format!("no time-of-day source `{tod_name}`")))?;

            let clock = ClockHandle(*next_clock_handle);
            *next_clock_handle += 1;

            self.add_instance(block.name.clone(), block.clone(), clock, driver, tod, engine.clone())?;
        }
        Ok(())
    }

    fn add_instance(
        &self,
        name: String,
        config: crate::config::ShmInstanceConfig,
        clock: ClockHandle,
        driver: Arc<dyn ClockDriver>,
        tod: Arc<dyn TimeOfDaySource>,
        engine: Arc<dyn EngineSink>,
    ) -> ServoResult<()> {
        let mut bound = self.bound_clocks.lock();
        if bound.contains_key(&clock) {
            return Err(ServoError::Manager(format!(
                "clock {clock:?} is already bound to instance `{}`",
                bound[&clock]
            )));
        }
        let mut instances = self.instances.lock();
        if instances.contains_key(&name) {
            return Err(ServoError::Manager(format!("instance `{name}` already exists")));
        }

        self.feed
            .add_clock(clock, driver.clone(), poll_period_log2_for(&config))
            .map_err(|e| ServoError::Manager(e.to_string()))?;

        let mut servo = ServoInstance::new(name.clone(), config, clock, driver, tod, engine, self.feed.clone());
        if let Ok(sub) = self.feed.subscribe(clock) {
            servo.bind_nic_subscription(sub);
        }

        bound.insert(clock, name.clone());
        instances.insert(
            name,
            Arc::new(ManagedInstance {
                servo: Mutex::new(servo),
                clock,
            }),
        );
        Ok(())
    }

    pub fn remove_instance(&self, name: &str) -> ServoResult<()> {
        let mut instances = self.instances.lock();
        let managed = instances
            .remove(name)
            .ok_or_else(|| ServoError::Manager(format!("instance `{name}` not found")))?;
        self.bound_clocks.lock().remove(&managed.clock);
        let _ = self.feed.remove_clock(managed.clock);
        info!(instance = name, "instance torn down");
        Ok(())
    }

    /// One pipeline tick for every live instance: poll the driver for a
    /// fresh event and run housekeeping. Called on every feed SYNC_EVENT
    /// plus the manager's own coarse timer.
    pub fn tick_all(&self, now: Instant) {
        let snapshot: Vec<Arc<ManagedInstance>> = self.instances.lock().values().cloned().collect();
        for managed in snapshot {
            let mut servo = managed.servo.lock();
            servo.check_timeouts(now);
            if let Err(e) = servo.poll_driver(now) {
                warn!(instance = %servo.name, error = %e, "instance pipeline error");
            }
        }
    }

    /// Once-a-second time-of-day poll, independent of hardware events.
    pub fn tick_time_of_day(&self, now: Instant) {
        let snapshot: Vec<Arc<ManagedInstance>> = self.instances.lock().values().cloned().collect();
        for managed in snapshot {
            managed.servo.lock().tick_time_of_day(now);
        }
    }

    /// Spawn a task that drains the feed's SYNC_EVENT mailbox and ticks
    /// every instance on each notification.
    pub fn spawn_event_pump(self: &Arc<Self>) -> ServoResult<tokio::task::JoinHandle<()>> {
        let (tx, mut rx) = mpsc::channel(16);
        self.feed
            .subscribe_events(tx)
            .map_err(|e| ServoError::Manager(e.to_string()))?;
        let manager = self.clone();
        Ok(tokio::spawn(async move {
            while rx.recv().await.is_some() {
                manager.tick_all(Instant::now());
            }
        }))
    }

    pub fn dispatch(&self, instance: &str, message: ControlMessage) -> ServoResult<()> {
        let instances = self.instances.lock();
        let managed = instances
            .get(instance)
            .ok_or_else(|| ServoError::Manager(format!("instance `{instance}` not found")))?
            .clone();
        drop(instances);
        let mut servo = managed.servo.lock();
        match message {
            ControlMessage::GetStatus => {}
            ControlMessage::Control { mask, flags } => {
                apply_control_mask(&mut servo, mask, flags);
            }
            ControlMessage::StepClock(offset_ns) => {
                servo.step_clock(offset_ns).map_err(|e| ServoError::Manager(e.to_string()))?;
            }
            ControlMessage::LogStats(_) => servo.log_stats(),
            ControlMessage::SaveState => servo.save_state(),
            ControlMessage::WriteTopology => {
                let mut buf = Vec::new();
                let _ = servo.write_topology(&mut buf);
                info!(instance, topology = %String::from_utf8_lossy(&buf), "topology dump");
            }
            ControlMessage::StatsEndPeriod(_) => servo.stats_end_period(),
            ControlMessage::TestMode(_) => {}
            ControlMessage::ServoPidAdjust {
                kp,
                ki,
                kd,
                reset,
                type_mask: _,
            } => {
                servo.reset_pid_gains(kp, ki, kd, reset);
            }
        }
        Ok(())
    }

    pub fn instance_names(&self) -> Vec<String> {
        self.instances.lock().keys().cloned().collect()
    }
}

fn apply_control_mask(servo: &mut ServoInstance, mask: u8, flags: u8) {
    use crate::shm::instance::ControlFlags;
    if let Some(bits) = ControlFlags::from_bits(mask) {
        let value = ControlFlags::from_bits_truncate(flags);
        servo.set_control_flags(bits, !(value & bits).is_empty());
    }
}

fn poll_period_log2_for(_config: &crate::config::ShmInstanceConfig) -> i32 {
    // SHM sources tick at 1Hz, matching the notch filter's center
    // frequency; request the feed sample this clock at the same cadence.
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverPoll, TimeOfDayState, TimeOfDayStatus};
    use crate::error::CompareError;
    use crate::ring::SignedDuration;
    use std::sync::atomic::AtomicBool;

    struct NullDriver;
    impl ClockDriver for NullDriver {
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
        fn adjust_frequency(&self, _ppb: f64) -> Result<(), String> {
            Ok(())
        }
        fn adjust_time(&self, _offset: SignedDuration) -> Result<(), String> {
            Ok(())
        }
        fn get_freq_correction(&self) -> f64 {
            0.0
        }
        fn save_freq_correction(&self, _ppb: f64) {}
        fn get_max_frequency_adjustment(&self) -> f64 {
            100_000.0
        }
    }

    struct NullTod;
    impl TimeOfDaySource for NullTod {
        fn get_status(&self) -> Result<TimeOfDayStatus, String> {
            Ok(TimeOfDayStatus {
                state: TimeOfDayState::Slave,
                offset_from_master: SignedDuration::ZERO,
            })
        }
    }

    struct NullEngine(AtomicBool);
    impl EngineSink for NullEngine {
        fn post_rt_stats(&self, _: &str, _: i128, _: f64, _: bool) {
            self.0.store(true, std::sync::atomic::Ordering::Relaxed);
        }
        fn clustering_input(&self, _: &str, _: i128, _: f64) {}
        fn sync_instance_state_changed(&self, _: &str, _: &str) {}
    }

    fn sample_block(name: &str, interface: &str) -> crate::config::ShmInstanceConfig {
        crate::config::ShmInstanceConfig {
            name: name.into(),
            interface: interface.into(),
            priority: 128,
            sync_threshold_ns: 100_000,
            shm_source_type: crate::config::ShmSourceType::Complete,
            time_of_day: None,
            master_clock_class: crate::config::MasterClockClass::Locked,
            master_time_source: crate::config::MasterTimeSource::Gps,
            master_accuracy: None,
            master_traceability: Default::default(),
            steps_removed: 1,
            shm_delay_ns: 0,
            pid_filter_p: 0.1,
            pid_filter_i: 0.01,
            outlier_filter_type: crate::config::OutlierFilterType::Disabled,
            outlier_filter_size: 5,
            outlier_filter_adaption: 0.2,
            fir_filter_size: 1,
            step_policy: crate::config::StepPolicy::SlewOnly,
        }
    }

    #[test]
    fn duplicate_clock_binding_is_rejected() {
        let feed = ClockFeed::new();
        let manager = InstanceManager::new(feed);
        let driver: Arc<dyn ClockDriver> = Arc::new(NullDriver);
        let tod: Arc<dyn TimeOfDaySource> = Arc::new(NullTod);
        let engine: Arc<dyn EngineSink> = Arc::new(NullEngine(AtomicBool::new(false)));

        manager
            .add_instance(
                "a".into(),
                sample_block("a", "eth0"),
                ClockHandle(1),
                driver.clone(),
                tod.clone(),
                engine.clone(),
            )
            .unwrap();

        let err = manager.add_instance(
            "b".into(),
            sample_block("b", "eth0"),
            ClockHandle(1),
            driver,
            tod,
            engine,
        );
        assert!(err.is_err());
    }

    #[test]
    fn remove_then_dispatch_fails_not_found() {
        let feed = ClockFeed::new();
        let manager = InstanceManager::new(feed);
        let driver: Arc<dyn ClockDriver> = Arc::new(NullDriver);
        let tod: Arc<dyn TimeOfDaySource> = Arc::new(NullTod);
        let engine: Arc<dyn EngineSink> = Arc::new(NullEngine(AtomicBool::new(false)));
        manager
            .add_instance("a".into(), sample_block("a", "eth0"), ClockHandle(1), driver, tod, engine)
            .unwrap();
        manager.remove_instance("a").unwrap();
        assert!(manager.dispatch("a", ControlMessage::GetStatus).is_err());
    }

    #[test]
    fn dispatch_save_state_succeeds_on_live_instance() {
        let feed = ClockFeed::new();
        let manager = InstanceManager::new(feed);
        let driver: Arc<dyn ClockDriver> = Arc::new(NullDriver);
        let tod: Arc<dyn TimeOfDaySource> = Arc::new(NullTod);
        let engine: Arc<dyn EngineSink> = Arc::new(NullEngine(AtomicBool::new(false)));
        manager
            .add_instance("a".into(), sample_block("a", "eth0"), ClockHandle(1), driver, tod, engine)
            .unwrap();
        assert!(manager.dispatch("a", ControlMessage::SaveState).is_ok());
    }

    #[test]
    fn log_stats_and_stats_end_period_succeed_on_live_instance() {
        let feed = ClockFeed::new();
        let manager = InstanceManager::new(feed);
        let driver: Arc<dyn ClockDriver> = Arc::new(NullDriver);
        let tod: Arc<dyn TimeOfDaySource> = Arc::new(NullTod);
        let engine: Arc<dyn EngineSink> = Arc::new(NullEngine(AtomicBool::new(false)));
        manager
            .add_instance("a".into(), sample_block("a", "eth0"), ClockHandle(1), driver, tod, engine)
            .unwrap();
        assert!(manager
            .dispatch("a", ControlMessage::LogStats(Instant::now()))
            .is_ok());
        assert!(manager
            .dispatch("a", ControlMessage::StatsEndPeriod(Instant::now()))
            .is_ok());
    }
}
