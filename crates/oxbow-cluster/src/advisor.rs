//! Spot interruption advice
//!
//! A [`SpotAdvisor`] reports the published maximum interruption probability
//! for an instance type in a region. The instance-state queries use it to
//! steer spot selections away from frequently preempted types, relaxing the
//! threshold step by step when nothing qualifies. A cluster without an
//! advisor ignores interruption data entirely.

use oxbow_core::Result;

/// Published interruption probability buckets, most to least stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InterruptProbability {
    LessThanFivePct,
    LessThanTenPct,
    LessThanFifteenPct,
    LessThanTwentyPct,
    Any,
}

/// The threshold ladder tried in order when spot selection is filtered by
/// an advisor: start at ≤10% and relax until something qualifies.
pub(crate) const THRESHOLD_LADDER: [InterruptProbability; 4] = [
    InterruptProbability::LessThanTenPct,
    InterruptProbability::LessThanFifteenPct,
    InterruptProbability::LessThanTwentyPct,
    InterruptProbability::Any,
];

/// Reports interruption probabilities for spot instance types.
pub trait SpotAdvisor: Send + Sync {
    /// The maximum interruption probability for `instance_type` running
    /// `os` in `region`. An error means the advisor has no data for the
    /// type; such types only qualify at the `Any` threshold.
    fn max_interrupt_probability(
        &self,
        os: &str,
        region: &str,
        instance_type: &str,
    ) -> Result<InterruptProbability>;
}
