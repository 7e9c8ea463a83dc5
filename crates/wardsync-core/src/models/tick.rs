//! Logical clock values

/// Well-known tick values with special meaning.
pub struct SyncTick;

impl SyncTick {
    /// Stamped on rows a facility applied from a pull: originated from a
    /// remote peer, never re-stamped and never pushed back.
    pub const INCOMING_FROM_PEER: i64 = -1;

    /// Stamped on lookup entries by cascade touch: changed, no real data
    /// change. Resolved to a real tick by the next lookup rebuild.
    pub const TOUCHED: i64 = -999;

    /// Clock value before any tick has been allocated.
    pub const ORIGIN: i64 = 0;

    /// Whether `tick` is one of the sentinel values rather than a clock value
    pub const fn is_sentinel(tick: i64) -> bool {
        tick < Self::ORIGIN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_sort_below_real_ticks() {
        assert!(SyncTick::is_sentinel(SyncTick::INCOMING_FROM_PEER));
        assert!(SyncTick::is_sentinel(SyncTick::TOUCHED));
        assert!(!SyncTick::is_sentinel(SyncTick::ORIGIN));
        assert!(!SyncTick::is_sentinel(42));
    }
}
