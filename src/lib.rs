// clockfeed: clock-feed service and SHM servo instance
//
// Ring Sample Store, Clock-Feed Service, Filter Kit, SHM Servo Instance,
// Instance Manager, and rolling-window stats/convergence tracking.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod config;
pub mod driver;
pub mod error;
pub mod feed;
pub mod filters;
pub mod ring;
pub mod shm;
pub mod stats;

pub use config::{DaemonConfig, ShmInstanceConfig};
pub use driver::{ClockDriver, EngineSink, TimeOfDaySource};
pub use error::{CompareError, ConfigError, FeedError, ServoError};
pub use feed::{ClockFeed, ClockHandle, Subscription};
pub use ring::SignedDuration;
pub use shm::{ControlMessage, InstanceManager, ServoInstance};
