mod eviction;
mod feedback;
mod mapping_state;
mod min_mip;
mod state;

pub use eviction::EvictionDelay;
pub use feedback::{FeedbackError, FeedbackTranslator};
pub use mapping_state::{AddRefOutcome, DecRefOutcome, TileMappingState, TileResidency};
pub use min_mip::ResidencyMap;
pub use state::{EvictionCollect, FeedbackOutcome, LoadCollect, ResidencyState};

/// Invariant check: fatal in debug builds, logged and tolerated in release.
macro_rules! residency_invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            log::error!($($arg)+);
            debug_assert!($cond, $($arg)+);
        }
    };
}

pub(crate) use residency_invariant;

#[cfg(test)]
mod tests;
