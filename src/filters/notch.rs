// clockfeed: Notch filter
//
// Rejects samples outside [center - width, center + width]. For SHM:
// center = 1e9 ns (1 Hz), width = 1e8 ns. Outputs pass/fail only.

/// Band-pass acceptance gate around an expected period.
#[derive(Debug, Clone, Copy)]
pub struct NotchFilter {
    center_ns: i64,
    width_ns: i64,
}

impl NotchFilter {
    /// The SHM servo's default: 1 Hz center, ±100 ms half-width.
    pub const SHM_CENTER_NS: i64 = 1_000_000_000;
    pub const SHM_WIDTH_NS: i64 = 100_000_000;

    pub fn new(center_ns: i64, width_ns: i64) -> Self {
        Self { center_ns, width_ns }
    }

    pub fn shm_default() -> Self {
        Self::new(Self::SHM_CENTER_NS, Self::SHM_WIDTH_NS)
    }

    /// Pass/fail only; no filter state to reset.
    pub fn accepts(&self, period_ns: i64) -> bool {
        let lo = self.center_ns - self.width_ns;
        let hi = self.center_ns + self.width_ns;
        (lo..=hi).contains(&period_ns)
    }
}
