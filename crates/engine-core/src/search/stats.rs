//! Per-node aggregate statistics, in atomic and snapshot form.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::types::Loc;

/// An `f64` stored in an `AtomicU64` by bit pattern.
#[derive(Debug)]
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    pub fn new(v: f64) -> AtomicF64 {
        AtomicF64 {
            bits: AtomicU64::new(v.to_bits()),
        }
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> f64 {
        f64::from_bits(self.bits.load(order))
    }

    #[inline]
    pub fn store(&self, v: f64, order: Ordering) {
        self.bits.store(v.to_bits(), order);
    }
}

impl Default for AtomicF64 {
    fn default() -> AtomicF64 {
        AtomicF64::new(0.0)
    }
}

/// The atomic aggregate values of one node. All averages are running means
/// over the node's total weight; sums are recomputed wholesale on backup.
#[derive(Debug, Default)]
pub struct NodeStatsAtomic {
    pub visits: AtomicI64,
    pub win_loss_value_avg: AtomicF64,
    pub no_result_value_avg: AtomicF64,
    pub score_mean_avg: AtomicF64,
    pub score_mean_sq_avg: AtomicF64,
    pub lead_avg: AtomicF64,
    pub utility_avg: AtomicF64,
    pub utility_sq_avg: AtomicF64,
    pub weight_sum: AtomicF64,
    pub weight_sq_sum: AtomicF64,
}

impl NodeStatsAtomic {
    pub fn new() -> NodeStatsAtomic {
        NodeStatsAtomic::default()
    }

    /// Acquire-snapshot every field.
    pub fn snapshot(&self) -> NodeStats {
        NodeStats {
            visits: self.visits.load(Ordering::Acquire),
            win_loss_value_avg: self.win_loss_value_avg.load(Ordering::Acquire),
            no_result_value_avg: self.no_result_value_avg.load(Ordering::Acquire),
            score_mean_avg: self.score_mean_avg.load(Ordering::Acquire),
            score_mean_sq_avg: self.score_mean_sq_avg.load(Ordering::Acquire),
            lead_avg: self.lead_avg.load(Ordering::Acquire),
            utility_avg: self.utility_avg.load(Ordering::Acquire),
            utility_sq_avg: self.utility_sq_avg.load(Ordering::Acquire),
            weight_sum: self.weight_sum.load(Ordering::Acquire),
            weight_sq_sum: self.weight_sq_sum.load(Ordering::Acquire),
        }
    }

    /// Copy all fields from another node's stats (used when detaching a
    /// child into a new root).
    pub fn copy_from(&self, other: &NodeStatsAtomic) {
        let snap = other.snapshot();
        self.visits.store(snap.visits, Ordering::Release);
        self.win_loss_value_avg.store(snap.win_loss_value_avg, Ordering::Release);
        self.no_result_value_avg.store(snap.no_result_value_avg, Ordering::Release);
        self.score_mean_avg.store(snap.score_mean_avg, Ordering::Release);
        self.score_mean_sq_avg.store(snap.score_mean_sq_avg, Ordering::Release);
        self.lead_avg.store(snap.lead_avg, Ordering::Release);
        self.utility_avg.store(snap.utility_avg, Ordering::Release);
        self.utility_sq_avg.store(snap.utility_sq_avg, Ordering::Release);
        self.weight_sum.store(snap.weight_sum, Ordering::Release);
        self.weight_sq_sum.store(snap.weight_sq_sum, Ordering::Release);
    }
}

/// Plain snapshot of [`NodeStatsAtomic`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeStats {
    pub visits: i64,
    pub win_loss_value_avg: f64,
    pub no_result_value_avg: f64,
    pub score_mean_avg: f64,
    pub score_mean_sq_avg: f64,
    pub lead_avg: f64,
    pub utility_avg: f64,
    pub utility_sq_avg: f64,
    pub weight_sum: f64,
    pub weight_sq_sum: f64,
}

/// Scratch entry used while recomputing a parent's stats from its children.
#[derive(Debug, Clone, Copy)]
pub struct MoreNodeStats {
    pub stats: NodeStats,
    /// Child utility from the parent's perspective.
    pub self_utility: f64,
    /// Child weight after edge scaling and downweighting.
    pub weight_adjusted: f64,
    pub prev_move_loc: Loc,
}

impl Default for MoreNodeStats {
    fn default() -> MoreNodeStats {
        MoreNodeStats {
            stats: NodeStats::default(),
            self_utility: 0.0,
            weight_adjusted: 0.0,
            prev_move_loc: Loc::NULL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_f64_roundtrip() {
        let a = AtomicF64::new(1.5);
        assert_eq!(a.load(Ordering::Acquire), 1.5);
        a.store(-0.25, Ordering::Release);
        assert_eq!(a.load(Ordering::Acquire), -0.25);
        a.store(f64::INFINITY, Ordering::Release);
        assert_eq!(a.load(Ordering::Acquire), f64::INFINITY);
    }

    #[test]
    fn test_snapshot_copies_all_fields() {
        let stats = NodeStatsAtomic::new();
        stats.visits.store(7, Ordering::Release);
        stats.utility_avg.store(0.25, Ordering::Release);
        stats.weight_sum.store(7.5, Ordering::Release);
        let snap = stats.snapshot();
        assert_eq!(snap.visits, 7);
        assert_eq!(snap.utility_avg, 0.25);
        assert_eq!(snap.weight_sum, 7.5);

        let other = NodeStatsAtomic::new();
        other.copy_from(&stats);
        assert_eq!(other.snapshot().visits, 7);
        assert_eq!(other.snapshot().weight_sum, 7.5);
    }
}
