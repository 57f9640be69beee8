//! Per-instruction resolution state machine.
//!
//! ```text
//! Start -> TryCached -> TryStructural -> TryPerceptual -> Exhausted
//!              |              |               |
//!              +--------------+---------------+--> Resolved(tier)
//! ```

use super::StrategyTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    Start,
    TryCached,
    TryStructural,
    TryPerceptual,
    Resolved(StrategyTier),
    Exhausted,
}

impl ResolverState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResolverState::Resolved(_) | ResolverState::Exhausted)
    }
}

/// Result of running the tier a state stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierOutcome {
    Succeeded,
    Failed,
    /// The tier had nothing to try (no cache entry, no target text, ...).
    Skipped,
}

/// Transition table.
pub fn transition(state: ResolverState, outcome: TierOutcome) -> ResolverState {
    use ResolverState::*;
    use TierOutcome::*;

    match (state, outcome) {
        (Start, _) => TryCached,

        (TryCached, Succeeded) => Resolved(StrategyTier::Cached),
        (TryCached, Failed | Skipped) => TryStructural,

        (TryStructural, Succeeded) => Resolved(StrategyTier::Structural),
        (TryStructural, Failed | Skipped) => TryPerceptual,

        (TryPerceptual, Succeeded) => Resolved(StrategyTier::Perceptual),
        (TryPerceptual, Failed | Skipped) => Exhausted,

        (terminal @ (Resolved(_) | Exhausted), _) => terminal,
    }
}
