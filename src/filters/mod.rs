// clockfeed: Filter Kit (C3)
//
// Notch (out-of-band period rejection), Peirce outlier rejector, FIR
// smoother, PID controller. Stateless across restarts; reset on
// discontinuity.

pub mod fir;
pub mod notch;
pub mod peirce;
pub mod pid;

pub use fir::FirFilter;
pub use notch::NotchFilter;
pub use peirce::PeirceFilter;
pub use pid::{Pid, PidConfig};
