// clockfeed: external collaborator interfaces
//
// The wire format of hardware timestamps and the transport for
// time-of-day are explicitly out of scope; these traits are the seam the
// core consumes, implemented by driver code that lives outside this
// crate.

use crate::error::CompareError;
use crate::ring::SignedDuration;

/// One hardware-timestamp event reported by a clock driver's event
/// channel.
#[derive(Debug, Clone, Copy)]
pub struct TimestampEvent {
    /// Driver-assigned sequence number; `u32::MAX` is the "no sequence
    /// tracking" sentinel.
    pub seq_num: u32,
    /// Hardware timestamp of this edge, phase-only nanoseconds since an
    /// arbitrary epoch consistent across consecutive events.
    pub time_ns: i128,
    /// Whether a clock step occurred since the previous event.
    pub stepped: bool,
}

/// Outcome of polling a driver for its next event.
#[derive(Debug, Clone, Copy)]
pub enum DriverPoll {
    Event(TimestampEvent),
    /// No event ready yet; treated as "no event", not an error.
    WouldBlock,
}

/// A registered hardware clock: the compare primitive the feed polls, and
/// the frequency/step control surface the SHM servo drives.
pub trait ClockDriver: Send + Sync {
    /// Signed `hw - system` plus status.
    fn compare_to_system(&self) -> Result<SignedDuration, CompareError>;

    fn enable_shm(&self) -> Result<(), String>;
    fn disable_shm(&self);

    /// Poll for the next hardware-timestamp event; `EAGAIN` maps to
    /// `DriverPoll::WouldBlock`, any other failure is `Err`.
    fn get_event(&self) -> Result<DriverPoll, String>;

    /// Optional file descriptor that signals event availability; `None`
    /// if the driver has no such descriptor and must be polled on a timer
    /// instead.
    fn get_fd(&self) -> Option<std::os::unix::io::RawFd> {
        None
    }

    fn adjust_frequency(&self, ppb: f64) -> Result<(), String>;
    fn adjust_time(&self, offset: SignedDuration) -> Result<(), String>;
    fn get_freq_correction(&self) -> f64;
    fn save_freq_correction(&self, ppb: f64);
    fn get_max_frequency_adjustment(&self) -> f64;
}

/// Synchronization state of the external time-of-day module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOfDayState {
    Listening,
    Slave,
    Selection,
    Faulty,
}

#[derive(Debug, Clone, Copy)]
pub struct TimeOfDayStatus {
    pub state: TimeOfDayState,
    pub offset_from_master: SignedDuration,
}

/// The sibling sync module supplying wall-clock seconds.
pub trait TimeOfDaySource: Send + Sync {
    fn get_status(&self) -> Result<TimeOfDayStatus, String>;
}

/// Rt-stats / clustering / lifecycle callbacks the engine exposes.
pub trait EngineSink: Send + Sync {
    fn post_rt_stats(&self, instance_name: &str, offset_ns: i128, freq_ppb: f64, in_sync: bool);
    fn clustering_input(&self, instance_name: &str, offset_ns: i128, score: f64);
    fn sync_instance_state_changed(&self, instance_name: &str, state: &str);
}
