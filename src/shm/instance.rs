// clockfeed: per-instance state machine and event pipeline

use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use tracing::{info, warn};

use crate::config::{ShmInstanceConfig, StepPolicy};
use crate::driver::{ClockDriver, DriverPoll, TimeOfDaySource, TimeOfDayState, TimestampEvent};
use crate::error::{ServoError, ServoResult};
use crate::feed::{ClockFeed, ClockHandle, Subscription};
use crate::filters::{FirFilter, NotchFilter, PeirceFilter, Pid, PidConfig};
use crate::ring::SignedDuration;
use crate::stats::{ConvergenceTracker, RollingWindow};

bitflags! {
    /// Latched health conditions; not a fatal state transition on their own.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Alarms: u8 {
        const NO_SIGNAL      = 0b0001;
        const SEQ_NUM_ERROR  = 0b0010;
        const BAD_SIGNAL     = 0b0100;
        const NO_TIME_OF_DAY = 0b1000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlFlags: u8 {
        const TIMESTAMP_PROCESSING    = 0b0001;
        const CLOCK_CTRL              = 0b0010;
        const SELECTED                = 0b0100;
        const CLUSTERING_DETERMINANT  = 0b1000;
    }
}

/// Sync state of a servo instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Listening,
    Slave,
    Faulty,
}

const NO_SIGNAL_TIMEOUT: Duration = Duration::from_millis(1100);
const LISTENING_RESET_TIMEOUT: Duration = Duration::from_secs(60);
const PULSE_HEALTH_TIMEOUT: Duration = Duration::from_secs(8);
const STEP_THRESHOLD_NS: i128 = 500_000_000;
const SEQ_SENTINEL: u32 = u32::MAX;

/// A single SHM servo instance.
pub struct ServoInstance {
    pub name: String,
    config: ShmInstanceConfig,
    driver: Arc<dyn ClockDriver>,
    tod: Arc<dyn TimeOfDaySource>,
    engine: Arc<dyn crate::driver::EngineSink>,
    feed: ClockFeed,
    clock: ClockHandle,
    nic_subscription: Option<Subscription>,

    control_flags: ControlFlags,
    sync_state: SyncState,
    alarms: Alarms,

    shm_seq_num: Option<u32>,
    consecutive_good_periods: u32,

    notch: NotchFilter,
    fir: FirFilter,
    pid: Pid,
    peirce: Option<PeirceFilter>,

    freq_adjust_base: f64,
    freq_adjust_ppb: f64,
    freq_adjust_max: f64,

    pub offset_from_master_ns: i128,
    pub synchronized: bool,
    pub clustering_score: f64,

    pub clock_steps: u64,
    pub seq_num_errors: u64,
    pub bad_signal_errors: u64,
    pub outliers: u64,

    previous_anchor: Option<i128>,
    last_event_at: Option<Instant>,
    pulse_health_deadline: Option<Instant>,
    last_pid_at: Option<Instant>,
    servo_active: bool,
    convergence: ConvergenceTracker,
    stats: RollingWindow,
}

impl ServoInstance {
    pub fn new(
        name: String,
        config: ShmInstanceConfig,
        clock: ClockHandle,
        driver: Arc<dyn ClockDriver>,
        tod: Arc<dyn TimeOfDaySource>,
        engine: Arc<dyn crate::driver::EngineSink>,
        feed: ClockFeed,
    ) -> Self {
        let max_ppb = driver.get_max_frequency_adjustment();
        let peirce = match config.outlier_filter_type {
            crate::config::OutlierFilterType::Disabled => None,
            crate::config::OutlierFilterType::StdDev => Some(PeirceFilter::new(
                config.outlier_filter_size,
                config.outlier_filter_adaption,
            )),
        };
        Self {
            notch: NotchFilter::shm_default(),
            fir: FirFilter::new(config.fir_filter_size),
            pid: Pid::new(
                PidConfig {
                    kp: config.pid_filter_p,
                    ki: config.pid_filter_i,
                    kd: 0.0,
                },
                max_ppb,
            ),
            peirce,
            freq_adjust_base: driver.get_freq_correction(),
            freq_adjust_ppb: 0.0,
            freq_adjust_max: max_ppb,
            offset_from_master_ns: 0,
            synchronized: false,
            clustering_score: 0.0,
            clock_steps: 0,
            seq_num_errors: 0,
            bad_signal_errors: 0,
            outliers: 0,
            previous_anchor: None,
            last_event_at: None,
            pulse_health_deadline: None,
            last_pid_at: None,
            servo_active: false,
            convergence: ConvergenceTracker::new(
                config.sync_threshold_ns as i128,
                ConvergenceTracker::DEFAULT_MIN_PERIOD,
            ),
            stats: RollingWindow::new(Duration::from_secs(600)),
            control_flags: ControlFlags::TIMESTAMP_PROCESSING | ControlFlags::CLOCK_CTRL,
            sync_state: SyncState::Listening,
            alarms: Alarms::NO_SIGNAL,
            shm_seq_num: None,
            consecutive_good_periods: 0,
            name,
            config,
            driver,
            tod,
            engine,
            feed,
            clock,
            nic_subscription: None,
        }
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync_state
    }

    pub fn alarms(&self) -> Alarms {
        self.alarms
    }

    pub fn control_flags(&self) -> ControlFlags {
        self.control_flags
    }

    pub fn set_control_flags(&mut self, mask: ControlFlags, value: bool) {
        self.control_flags.set(mask, value);
    }

    fn enter(&mut self, state: SyncState, now: Instant) {
        if self.sync_state == state {
            return;
        }
        info!(instance = %self.name, ?state, "servo instance state transition");
        self.sync_state = state;
        self.engine
            .sync_instance_state_changed(&self.name, state_label(state));
        if state == SyncState::Listening {
            self.reset_filters();
            self.pulse_health_deadline = Some(now + PULSE_HEALTH_TIMEOUT);
            self.consecutive_good_periods = 0;
            self.previous_anchor = None;
            self.shm_seq_num = None;
            self.convergence.reset();
        }
    }

    fn reset_filters(&mut self) {
        self.fir.reset();
        self.pid.reset();
        if let Some(peirce) = &mut self.peirce {
            peirce.reset();
        }
    }

    /// Drive housekeeping that is not tied to an event arrival: NO_SIGNAL /
    /// long-timeout transitions and the pulse-health timer.
    pub fn check_timeouts(&mut self, now: Instant) {
        if self.sync_state == SyncState::Faulty {
            return;
        }

        // Arm the pulse-health timer on the first servo tick; subsequent
        // arming happens in `enter` on every transition into LISTENING.
        self.pulse_health_deadline.get_or_insert(now + PULSE_HEALTH_TIMEOUT);

        if let Some(deadline) = self.pulse_health_deadline {
            if now >= deadline && self.consecutive_good_periods < 3 {
                self.raise_alarm(Alarms::NO_SIGNAL);
            }
        }

        if self.sync_state == SyncState::Slave {
            if let Some(last) = self.last_event_at {
                let since = now.saturating_duration_since(last);
                if since >= LISTENING_RESET_TIMEOUT {
                    self.enter(SyncState::Listening, now);
                    return;
                }
                if since >= NO_SIGNAL_TIMEOUT {
                    self.raise_alarm(Alarms::NO_SIGNAL);
                }
            }
        }
    }

    fn raise_alarm(&mut self, alarm: Alarms) {
        if !self.alarms.contains(alarm) {
            warn!(instance = %self.name, ?alarm, "alarm raised");
        }
        self.alarms.insert(alarm);
    }

    fn clear_alarm(&mut self, alarm: Alarms) {
        if self.alarms.contains(alarm) {
            info!(instance = %self.name, ?alarm, "alarm cleared");
        }
        self.alarms.remove(alarm);
    }

    /// Driver reported a hard failure: any state -> FAULTY.
    pub fn on_driver_error(&mut self, now: Instant, detail: &str) {
        warn!(instance = %self.name, detail, "driver error, transitioning to FAULTY");
        self.sync_state = SyncState::Faulty;
        self.engine
            .sync_instance_state_changed(&self.name, state_label(SyncState::Faulty));
        let _ = now;
    }

    /// Poll the driver for its next event and, if ready, run it through
    /// the pipeline. `EAGAIN`/no-event is not an error: a driver read
    /// returning EAGAIN is treated as no event this tick.
    pub fn poll_driver(&mut self, now: Instant) -> ServoResult<()> {
        match self.driver.get_event() {
            Ok(DriverPoll::WouldBlock) => Ok(()),
            Ok(DriverPoll::Event(event)) => {
                if self.sync_state == SyncState::Faulty {
                    self.enter(SyncState::Listening, now);
                }
                self.last_event_at = Some(now);
                self.clear_alarm(Alarms::NO_SIGNAL);
                if self.sync_state == SyncState::Listening {
                    self.enter(SyncState::Slave, now);
                }
                self.on_event(event, now)
            }
            Err(detail) => {
                self.on_driver_error(now, &detail);
                Err(ServoError::Driver(detail))
            }
        }
    }

    /// The per-event pipeline, steps 1-9.
    fn on_event(&mut self, event: TimestampEvent, now: Instant) -> ServoResult<()> {
        // Step 1: sequence-number discontinuity.
        if event.seq_num != SEQ_SENTINEL {
            if let Some(prev) = self.shm_seq_num {
                if event.seq_num != prev.wrapping_add(1) {
                    self.raise_alarm(Alarms::SEQ_NUM_ERROR);
                    self.seq_num_errors += 1;
                } else {
                    self.clear_alarm(Alarms::SEQ_NUM_ERROR);
                }
            }
            self.shm_seq_num = Some(event.seq_num);
        }

        // Step 2: TIMESTAMP_PROCESSING gate.
        if !self.control_flags.contains(ControlFlags::TIMESTAMP_PROCESSING) {
            return Ok(());
        }

        // Step 3: a step since the last event makes this event the new
        // anchor only.
        if event.stepped {
            self.previous_anchor = Some(event.time_ns);
            return Ok(());
        }

        // Step 4: period/notch.
        let Some(prev_anchor) = self.previous_anchor else {
            self.previous_anchor = Some(event.time_ns);
            return Ok(());
        };
        let period_ns = event.time_ns - prev_anchor;
        self.previous_anchor = Some(event.time_ns);

        if !self.notch.accepts(period_ns.clamp(i64::MIN as i128, i64::MAX as i128) as i64) {
            self.raise_alarm(Alarms::BAD_SIGNAL);
            self.consecutive_good_periods = 0;
            self.bad_signal_errors += 1;
            return Ok(());
        }
        self.consecutive_good_periods += 1;

        // Step 5: gate on 3 consecutive good periods, then outlier filter.
        if self.consecutive_good_periods < 3 {
            return Ok(());
        }
        self.clear_alarm(Alarms::BAD_SIGNAL);

        if let Some(peirce) = &mut self.peirce {
            if !peirce.evaluate(period_ns as f64) {
                self.outliers += 1;
                return Ok(());
            }
        }

        // Step 6: synchronization offset.
        let tod_offset = self.poll_time_of_day_offset(now)?;
        let offset_ns = combined_offset_ns(event.time_ns, tod_offset, self.config.shm_delay_ns as i128);
        self.offset_from_master_ns = offset_ns;
        self.stats.push(now, offset_ns as f64);

        // Step 7: step decision.
        let policy_allows = match self.config.step_policy {
            StepPolicy::SlewOnly => false,
            StepPolicy::SlewAndStep => true,
            StepPolicy::StepAtStartup => !self.servo_active,
            StepPolicy::StepForward => offset_ns < 0,
        };
        if policy_allows
            && offset_ns.abs() >= STEP_THRESHOLD_NS
            && self.control_flags.contains(ControlFlags::CLOCK_CTRL)
        {
            if let Err(e) = self
                .driver
                .adjust_time(SignedDuration::from_nanos(-offset_ns))
            {
                warn!(instance = %self.name, error = %e, "clock step failed; will retry next tick");
            } else {
                self.reset_filters();
                self.clock_steps += 1;
                self.servo_active = true;
                info!(instance = %self.name, offset_ns, "clock stepped");
            }
            return Ok(());
        }

        // Step 8: slew via FIR -> PID -> frequency adjustment.
        let fir_out = self.fir.apply(offset_ns as f64);
        let dt = match self.last_pid_at.replace(now) {
            Some(prev) => now.saturating_duration_since(prev).as_secs_f64(),
            None => 1.0,
        };
        let pid_out = self.pid.update(fir_out, dt.max(1e-6));
        self.freq_adjust_ppb =
            (self.freq_adjust_base + pid_out).clamp(-self.freq_adjust_max, self.freq_adjust_max);
        if self.control_flags.contains(ControlFlags::CLOCK_CTRL) {
            if let Err(e) = self.driver.adjust_frequency(self.freq_adjust_ppb) {
                warn!(instance = %self.name, error = %e, "frequency adjustment failed; will retry next tick");
            }
        }
        self.servo_active = true;

        // Step 9: convergence + rt-stats + clustering.
        self.synchronized = if self.eligible_for_sync() {
            self.convergence.observe_eligible(now, offset_ns)
        } else {
            // Not eligible right now: synchronized goes false, but the
            // convergence window itself is left untouched (no call to
            // observe_eligible or reset) rather than cleared.
            false
        };
        self.clustering_score = if self.synchronized { 1.0 } else { 0.0 };
        self.engine.post_rt_stats(
            &self.name,
            offset_ns,
            self.freq_adjust_ppb,
            self.synchronized,
        );
        self.engine
            .clustering_input(&self.name, offset_ns, self.clustering_score);

        Ok(())
    }

    /// Time-of-day poll, run once per second independent of event arrival,
    /// and also invoked inline from step 6 above to fetch the seconds
    /// component for the current event.
    fn poll_time_of_day_offset(&mut self, now: Instant) -> ServoResult<SignedDuration> {
        match self.tod.get_status() {
            Ok(status) => {
                if matches!(status.state, TimeOfDayState::Slave | TimeOfDayState::Selection) {
                    self.clear_alarm(Alarms::NO_TIME_OF_DAY);
                } else {
                    self.raise_alarm(Alarms::NO_TIME_OF_DAY);
                }
                let mut offset = status.offset_from_master;
                if offset.nanos != 0 {
                    if let Some(sub) = &self.nic_subscription {
                        if let Ok(d) = self.feed.compare(Some(sub), None) {
                            offset = offset + d;
                        }
                    }
                }
                let _ = now;
                Ok(offset)
            }
            Err(e) => {
                self.raise_alarm(Alarms::NO_TIME_OF_DAY);
                Err(ServoError::TimeOfDay(e))
            }
        }
    }

    /// Independent once-a-second time-of-day poll used by the instance
    /// manager's tick loop, separate from the per-event inline call above.
    pub fn tick_time_of_day(&mut self, now: Instant) {
        let _ = self.poll_time_of_day_offset(now);
        if !self.eligible_for_sync() {
            self.synchronized = false;
        }
    }

    /// Whether convergence may currently advance: in SLAVE, no alarms
    /// latched, and timestamp processing enabled.
    fn eligible_for_sync(&self) -> bool {
        self.sync_state == SyncState::Slave
            && self.alarms.is_empty()
            && self.control_flags.contains(ControlFlags::TIMESTAMP_PROCESSING)
    }

    pub fn bind_nic_subscription(&mut self, sub: Subscription) {
        self.nic_subscription = Some(sub);
    }

    pub fn clock(&self) -> ClockHandle {
        self.clock
    }

    pub fn reset_pid_gains(&mut self, kp: f64, ki: f64, kd: f64, reset: bool) {
        self.pid.set_gains(PidConfig { kp, ki, kd });
        if reset {
            self.pid.reset();
        }
    }

    pub fn step_clock(&mut self, offset_ns: i128) -> ServoResult<()> {
        self.driver
            .adjust_time(SignedDuration::from_nanos(offset_ns))
            .map_err(ServoError::Driver)?;
        self.reset_filters();
        self.clock_steps += 1;
        Ok(())
    }

    pub fn save_state(&self) {
        self.driver.save_freq_correction(self.freq_adjust_ppb);
    }

    /// `LOG_STATS(time)`: emit the current rolling-window range/count to
    /// the log.
    pub fn log_stats(&self) {
        match self.stats.range() {
            Some((lo, hi)) => info!(
                instance = %self.name,
                count = self.stats.count(),
                min_offset_ns = lo,
                max_offset_ns = hi,
                "rt-stats window"
            ),
            None => info!(instance = %self.name, "rt-stats window empty"),
        }
    }

    /// `STATS_END_PERIOD(time)`: log the window and start a fresh one.
    pub fn stats_end_period(&mut self) {
        self.log_stats();
        self.stats = RollingWindow::new(Duration::from_secs(600));
    }

    pub fn write_topology(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        writeln!(out, "instance: {}", self.name)?;
        writeln!(out, "interface: {}", self.config.interface)?;
        writeln!(out, "state: {}", state_label(self.sync_state))?;
        writeln!(out, "alarms: {:?}", self.alarms)?;
        writeln!(out, "control_flags: {:?}", self.control_flags)?;
        writeln!(out, "offset_ns: {}", self.offset_from_master_ns)?;
        writeln!(out, "freq_adjust_ppb: {}", self.freq_adjust_ppb)?;
        writeln!(out, "synchronized: {}", self.synchronized)?;
        writeln!(out, "clustering_score: {}", self.clustering_score)
    }
}

impl Drop for ServoInstance {
    fn drop(&mut self) {
        self.driver.save_freq_correction(self.freq_adjust_ppb);
        self.driver.disable_shm();
    }
}

fn state_label(state: SyncState) -> &'static str {
    match state {
        SyncState::Listening => "LISTENING",
        SyncState::Slave => "SLAVE",
        SyncState::Faulty => "FAULTY",
    }
}

/// Combine the nanosecond phase from the hardware timestamp with the
/// whole-seconds component of the time-of-day offset, then subtract the
/// configured static propagation delay. Only the seconds rounded from
/// `tod_offset` contribute; its sub-second remainder is discarded, since
/// the phase already comes from the hardware timestamp. Undefined when
/// `|tod_offset| >= 500ms`; the step path is required to engage first in
/// that regime.
fn combined_offset_ns(time_ns: i128, tod_offset: SignedDuration, shm_delay_ns: i128) -> i128 {
    let phase_ns = time_ns.rem_euclid(1_000_000_000);
    let phase_ns = if phase_ns > 500_000_000 {
        phase_ns - 1_000_000_000
    } else {
        phase_ns
    };
    let tod_seconds_ns = round_to_whole_seconds_ns(tod_offset.nanos);
    phase_ns + tod_seconds_ns - shm_delay_ns
}

/// Round a nanosecond offset to the nearest whole second, expressed in
/// nanoseconds, discarding the sub-second remainder.
fn round_to_whole_seconds_ns(nanos: i128) -> i128 {
    const NS_PER_SEC: i128 = 1_000_000_000;
    let whole_seconds = if nanos >= 0 {
        (nanos + NS_PER_SEC / 2) / NS_PER_SEC
    } else {
        -((-nanos + NS_PER_SEC / 2) / NS_PER_SEC)
    };
    whole_seconds * NS_PER_SEC
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{EngineSink, TimeOfDayStatus};
    use std::sync::atomic::{AtomicI64, Ordering};

    struct MockDriver {
        freq: AtomicI64,
        last_step: std::sync::Mutex<Option<i128>>,
    }

    impl MockDriver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                freq: AtomicI64::new(0),
                last_step: std::sync::Mutex::new(None),
            })
        }
    }

    impl ClockDriver for MockDriver {
        fn compare_to_system(&self) -> Result<SignedDuration, crate::error::CompareError> {
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
            self.freq.store(ppb as i64, Ordering::Relaxed);
            Ok(())
        }
        fn adjust_time(&self, offset: SignedDuration) -> Result<(), String> {
            *self.last_step.lock().unwrap() = Some(offset.nanos);
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

    struct MockTod(TimeOfDayState);
    impl TimeOfDaySource for MockTod {
        fn get_status(&self) -> Result<TimeOfDayStatus, String> {
            Ok(TimeOfDayStatus {
                state: self.0,
                offset_from_master: SignedDuration::ZERO,
            })
        }
    }

    struct NullEngine;
    impl EngineSink for NullEngine {
        fn post_rt_stats(&self, _: &str, _: i128, _: f64, _: bool) {}
        fn clustering_input(&self, _: &str, _: i128, _: f64) {}
        fn sync_instance_state_changed(&self, _: &str, _: &str) {}
    }

    fn make_instance() -> ServoInstance {
        let config = crate::config::ShmInstanceConfig {
            name: "shm0".into(),
            interface: "eth0".into(),
            priority: 128,
            sync_threshold_ns: 100_000,
            shm_source_type: crate::config::ShmSourceType::Complete,
            time_of_day: None,
            master_clock_class: crate::config::MasterClockClass::Locked,
            master_time_source: crate::config::MasterTimeSource::Gps,
            master_accuracy: None,
            master_traceability: Default::default(),
            steps_removed: 1,
            shm_delay_ns: 1500,
            pid_filter_p: 0.5,
            pid_filter_i: 0.1,
            outlier_filter_type: crate::config::OutlierFilterType::Disabled,
            outlier_filter_size: 5,
            outlier_filter_adaption: 0.2,
            fir_filter_size: 1,
            step_policy: StepPolicy::SlewAndStep,
        };
        let feed = ClockFeed::new();
        ServoInstance::new(
            "shm0".into(),
            config,
            ClockHandle(1),
            MockDriver::new(),
            Arc::new(MockTod(TimeOfDayState::Slave)),
            Arc::new(NullEngine),
            feed,
        )
    }

    fn evt(seq: u32, time_ns: i128, stepped: bool) -> TimestampEvent {
        TimestampEvent {
            seq_num: seq,
            time_ns,
            stepped,
        }
    }

    #[test]
    fn normal_lock_converges_near_propagation_delay_corrected_offset() {
        let mut servo = make_instance();
        servo.enter(SyncState::Slave, Instant::now());
        let now = Instant::now();
        // driver diff ~3500ns, propagation delay 1500ns => ~2000ns net.
        let mut t = 0i128;
        for i in 0..10u32 {
            t += 1_000_000_000;
            servo.on_event(evt(i, t, false), now).unwrap();
        }
        assert!(servo.consecutive_good_periods >= 3);
        assert_eq!(servo.bad_signal_errors, 0);
    }

    #[test]
    fn large_initial_offset_triggers_step() {
        let mut servo = make_instance();
        servo.enter(SyncState::Slave, Instant::now());
        let now = Instant::now();
        let mut t = 1_200_000_000i128; // 1.2s offset baked into the phase
        for i in 0..3u32 {
            servo.on_event(evt(i, t, false), now).unwrap();
            t += 1_000_000_000;
        }
        assert_eq!(servo.clock_steps, 1);
        assert!(servo.servo_active);
    }

    #[test]
    fn bad_period_rejection_blocks_good_period_counter() {
        let mut servo = make_instance();
        servo.enter(SyncState::Slave, Instant::now());
        let now = Instant::now();
        let mut t = 0i128;
        for i in 0..4u32 {
            t += 1_300_000_000; // 1.3s period, outside the notch
            servo.on_event(evt(i, t, false), now).unwrap();
        }
        assert_eq!(servo.consecutive_good_periods, 0);
        assert!(servo.bad_signal_errors >= 3);
        assert!(servo.alarms().contains(Alarms::BAD_SIGNAL));
    }

    #[test]
    fn seq_num_discontinuity_raises_and_clears_alarm() {
        let mut servo = make_instance();
        servo.enter(SyncState::Slave, Instant::now());
        let now = Instant::now();
        servo.on_event(evt(0, 0, false), now).unwrap();
        servo.on_event(evt(5, 1_000_000_000, false), now).unwrap();
        assert!(servo.alarms().contains(Alarms::SEQ_NUM_ERROR));
        assert_eq!(servo.seq_num_errors, 1);
        servo.on_event(evt(6, 2_000_000_000, false), now).unwrap();
        assert!(!servo.alarms().contains(Alarms::SEQ_NUM_ERROR));
    }

    #[test]
    fn timestamp_processing_disabled_skips_payload() {
        let mut servo = make_instance();
        servo.enter(SyncState::Slave, Instant::now());
        servo.set_control_flags(ControlFlags::TIMESTAMP_PROCESSING, false);
        let now = Instant::now();
        servo.on_event(evt(0, 0, false), now).unwrap();
        servo.on_event(evt(1, 1_000_000_000, false), now).unwrap();
        assert_eq!(servo.consecutive_good_periods, 0);
    }

    #[test]
    fn time_of_day_loss_raises_alarm_without_resetting_convergence() {
        let mut servo = make_instance();
        servo.convergence = ConvergenceTracker::new(100_000, Duration::from_millis(1));
        servo.enter(SyncState::Slave, Instant::now());
        servo.tick_time_of_day(Instant::now());
        assert!(!servo.alarms().contains(Alarms::NO_TIME_OF_DAY));

        // Establish convergence via a clean run of events first.
        let now = Instant::now();
        let mut t = 0i128;
        for i in 0..5u32 {
            t += 1_000_000_000;
            servo.on_event(evt(i, t, false), now + Duration::from_millis(i as u64 * 2)).unwrap();
        }
        assert!(servo.synchronized);
        assert!(servo.convergence.converged());

        let lost_tod: Arc<dyn TimeOfDaySource> = Arc::new(MockTod(TimeOfDayState::Listening));
        servo.tod = lost_tod;
        servo.tick_time_of_day(Instant::now());
        assert!(servo.alarms().contains(Alarms::NO_TIME_OF_DAY));
        // synchronized drops immediately...
        assert!(!servo.synchronized);
        // ...but the convergence accumulator itself is not reset.
        assert!(servo.convergence.converged());
    }

    #[test]
    fn pulse_health_arms_on_first_tick_and_raises_no_signal_after_8s_without_lock() {
        let mut servo = make_instance();
        let t0 = Instant::now();
        // Construction starts with NO_SIGNAL latched (nothing has locked
        // yet); clear it to isolate the pulse-health timer's own raise.
        servo.clear_alarm(Alarms::NO_SIGNAL);
        // First tick arms the deadline; the 8s window hasn't elapsed yet.
        servo.check_timeouts(t0);
        assert!(!servo.alarms().contains(Alarms::NO_SIGNAL));
        // Fewer than 3 good periods by the 8s deadline: NO_SIGNAL raised.
        servo.check_timeouts(t0 + Duration::from_secs(9));
        assert!(servo.alarms().contains(Alarms::NO_SIGNAL));
    }

    #[test]
    fn combined_offset_uses_phase_and_seconds() {
        let offset = combined_offset_ns(500_000_000, SignedDuration::ZERO, 0);
        assert_eq!(offset, 500_000_000);
        let offset = combined_offset_ns(900_000_000, SignedDuration::ZERO, 0);
        assert_eq!(offset, -100_000_000);
    }

    #[test]
    fn combined_offset_discards_tod_sub_second_remainder() {
        // A 120ms ToD offset rounds to 0 whole seconds and contributes
        // nothing; only the hardware phase and delay matter.
        let offset = combined_offset_ns(0, SignedDuration::from_nanos(120_000_000), 0);
        assert_eq!(offset, 0);
        // A 600ms ToD offset rounds to 1 whole second.
        let offset = combined_offset_ns(0, SignedDuration::from_nanos(600_000_000), 0);
        assert_eq!(offset, 1_000_000_000);
        // Negative ToD offsets round symmetrically.
        let offset = combined_offset_ns(0, SignedDuration::from_nanos(-600_000_000), 0);
        assert_eq!(offset, -1_000_000_000);
    }
}
