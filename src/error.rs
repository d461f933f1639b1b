// clockfeed: Error types

use thiserror::Error;

/// Result of a ring-store read or a feed `compare` call.
pub type CompareResult<T> = Result<T, CompareError>;

/// Result of a message sent to the feed actor.
pub type FeedResult<T> = Result<T, FeedError>;

/// Result of a servo pipeline step.
pub type ServoResult<T> = Result<T, ServoError>;

/// Result of loading/validating configuration.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Error kinds a reader can observe from a Ring Sample Store or from
/// `ClockFeedHandle::compare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CompareError {
    /// Source is disabled or its backing clock has been disabled.
    #[error("source is not active")]
    NotActive,

    /// No sample has ever been written to this store.
    #[error("no data has been written yet")]
    NoData,

    /// Writer lapped the reader mid-read; the snapshot is unreliable.
    #[error("writer overran the reader")]
    Overrun,

    /// `min_counter` or `max_age` rejected the freshest available sample.
    #[error("freshest sample does not satisfy the freshness requirement")]
    Stale,

    /// The Source backing this subscription has been tombstoned.
    #[error("source owner is dead")]
    OwnerDead,
}

/// Error kinds returned by the Clock-Feed Service's message contract.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("clock handle is not registered")]
    NotFound,

    #[error("event-subscriber table is full ({0} already subscribed)")]
    NoSpace(usize),

    #[error("feed is shutting down")]
    ShuttingDown,

    #[error("clock is already registered")]
    AlreadyRegistered,

    #[error("clock is already inactive")]
    AlreadyInactive,

    #[error("feed actor mailbox is gone")]
    MailboxClosed,
}

/// Error kinds surfaced by a SHM servo instance while driving its
/// per-event pipeline.
#[derive(Debug, Error)]
pub enum ServoError {
    #[error("clock driver error: {0}")]
    Driver(String),

    #[error("feed comparison failed: {0}")]
    Compare(#[from] CompareError),

    #[error("time-of-day source unavailable: {0}")]
    TimeOfDay(String),

    #[error("instance manager error: {0}")]
    Manager(String),
}

/// Error kinds raised while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading configuration: {0}")]
    Io(String),

    #[error("could not parse configuration: {0}")]
    Parse(String),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("`{field}` out of range: {detail}")]
    OutOfRange { field: &'static str, detail: String },

    #[error("instance `{0}` is already bound to a hardware clock")]
    DuplicateInstance(String),
}

/// Whether a `CompareError` should be treated as the servo losing its
/// source entirely (moving it out of SLAVE) rather than a one-tick hiccup.
pub fn is_fatal_for_servo(err: CompareError) -> bool {
    matches!(err, CompareError::NotActive | CompareError::OwnerDead)
}
