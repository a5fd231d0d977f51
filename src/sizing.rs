//! Capital allocation policies.
//!
//! All sizers consume the same pre-filtered candidate list (|expected
//! return| above threshold, no confirmed regime flip) and return budgets in
//! cash terms; the engine converts budgets to share quantities against the
//! collaborator's cost quote. Confidence scaling is applied by the caller to
//! the per-instrument cap before any policy runs.

use crate::market::Side;

const KELLY_VOL_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizerKind {
    /// Best-signal-first until spendable is exhausted
    Ranked,
    /// Budgets proportional to |expected return| / volatility
    Kelly,
    /// Single best candidate, large allocation
    Concentrated,
    /// Spendable split evenly across open slots
    Diversified,
}

/// One instrument that survived the entry pre-filter.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    /// Index into the session's instrument table
    pub index: usize,
    pub side: Side,
    pub er: f64,
    pub volatility: f64,
    pub price: f64,
    /// Current liquidation value already committed to this instrument
    pub exposure: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub index: usize,
    pub side: Side,
    pub price: f64,
    pub exposure: f64,
    pub budget: f64,
}

/// Allocate `spendable` across candidates.
///
/// `cap_value` is the per-instrument exposure ceiling in cash terms,
/// `open_positions` the number of instruments currently holding exposure,
/// `max_positions` the policy's concurrency limit.
pub fn allocate(
    kind: SizerKind,
    candidates: &[Candidate],
    spendable: f64,
    cap_value: f64,
    min_order_value: f64,
    max_positions: usize,
    open_positions: usize,
) -> Vec<Allocation> {
    if candidates.is_empty() || spendable < min_order_value {
        return Vec::new();
    }
    match kind {
        SizerKind::Ranked => {
            ranked(candidates, spendable, cap_value, min_order_value, max_positions, open_positions)
        }
        SizerKind::Kelly => kelly(candidates, spendable, cap_value, min_order_value),
        SizerKind::Concentrated => {
            concentrated(candidates, spendable, cap_value, min_order_value, max_positions, open_positions)
        }
        SizerKind::Diversified => {
            diversified(candidates, spendable, cap_value, min_order_value, max_positions, open_positions)
        }
    }
}

fn by_strength_desc(candidates: &[Candidate]) -> Vec<Candidate> {
    let mut sorted = candidates.to_vec();
    sorted.sort_by(|a, b| {
        b.er.abs().partial_cmp(&a.er.abs()).unwrap_or(std::cmp::Ordering::Equal)
    });
    sorted
}

fn ranked(
    candidates: &[Candidate],
    spendable: f64,
    cap_value: f64,
    min_order_value: f64,
    max_positions: usize,
    open_positions: usize,
) -> Vec<Allocation> {
    let mut remaining = spendable;
    let mut slots = max_positions.saturating_sub(open_positions);
    let mut out = Vec::new();
    for cand in by_strength_desc(candidates) {
        if remaining < min_order_value {
            break;
        }
        let fresh = cand.exposure <= 0.0;
        if fresh && slots == 0 {
            continue;
        }
        let headroom = (cap_value - cand.exposure).max(0.0);
        let budget = remaining.min(headroom);
        if budget < min_order_value {
            continue;
        }
        remaining -= budget;
        if fresh {
            slots -= 1;
        }
        out.push(Allocation {
            index: cand.index,
            side: cand.side,
            price: cand.price,
            exposure: cand.exposure,
            budget,
        });
    }
    out
}

fn kelly(
    candidates: &[Candidate],
    spendable: f64,
    cap_value: f64,
    min_order_value: f64,
) -> Vec<Allocation> {
    let weights = kelly_weights(candidates);
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Vec::new();
    }
    let mut remaining = spendable;
    let mut out = Vec::new();
    for (cand, w) in candidates.iter().zip(weights) {
        let headroom = (cap_value - cand.exposure).max(0.0);
        let budget = (spendable * w / total).min(headroom).min(remaining);
        if budget < min_order_value {
            continue;
        }
        remaining -= budget;
        out.push(Allocation {
            index: cand.index,
            side: cand.side,
            price: cand.price,
            exposure: cand.exposure,
            budget,
        });
    }
    out
}

/// Raw edge/risk weights, zero where volatility is degenerate. Normalize by
/// their sum to get allocation fractions.
pub fn kelly_weights(candidates: &[Candidate]) -> Vec<f64> {
    candidates
        .iter()
        .map(|c| {
            if c.volatility < KELLY_VOL_EPSILON {
                0.0
            } else {
                c.er.abs() / c.volatility
            }
        })
        .collect()
}

fn concentrated(
    candidates: &[Candidate],
    spendable: f64,
    cap_value: f64,
    min_order_value: f64,
    max_positions: usize,
    open_positions: usize,
) -> Vec<Allocation> {
    if open_positions >= max_positions {
        return Vec::new();
    }
    // Only the single best-ranked actionable candidate per tick; a leader
    // already at its cap yields to the next one.
    for best in by_strength_desc(candidates) {
        let headroom = (cap_value - best.exposure).max(0.0);
        let budget = spendable.min(headroom);
        if budget < min_order_value {
            continue;
        }
        return vec![Allocation {
            index: best.index,
            side: best.side,
            price: best.price,
            exposure: best.exposure,
            budget,
        }];
    }
    Vec::new()
}

fn diversified(
    candidates: &[Candidate],
    spendable: f64,
    cap_value: f64,
    min_order_value: f64,
    max_positions: usize,
    open_positions: usize,
) -> Vec<Allocation> {
    let slots = max_positions.saturating_sub(open_positions);
    if slots == 0 {
        return Vec::new();
    }
    let per_slot = spendable / slots as f64;
    let mut out = Vec::new();
    for cand in by_strength_desc(candidates).into_iter() {
        if out.len() >= slots {
            break;
        }
        // Even split is for fresh slots; instruments already holding
        // exposure only top up to their cap.
        let headroom = (cap_value - cand.exposure).max(0.0);
        let budget = per_slot.min(headroom);
        if budget < min_order_value {
            continue;
        }
        out.push(Allocation {
            index: cand.index,
            side: cand.side,
            price: cand.price,
            exposure: cand.exposure,
            budget,
        });
    }
    out
}

/// Convert a cash budget into a share quantity: whole shares after
/// commission, bounded by the instrument's remaining share capacity.
pub fn order_qty(budget: f64, price: f64, commission: f64, share_capacity: f64) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }
    (((budget - commission) / price).floor()).min(share_capacity.floor()).max(0.0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(index: usize, er: f64, vol: f64) -> Candidate {
        Candidate {
            index,
            side: if er >= 0.0 { Side::Long } else { Side::Short },
            er,
            volatility: vol,
            price: 100.0,
            exposure: 0.0,
        }
    }

    #[test]
    fn ranked_takes_strongest_first() {
        let cands = [cand(0, 0.002, 0.02), cand(1, 0.004, 0.02), cand(2, 0.001, 0.02)];
        let allocs = allocate(SizerKind::Ranked, &cands, 30_000.0, 20_000.0, 1_000.0, 8, 0);
        assert_eq!(allocs.len(), 2);
        assert_eq!(allocs[0].index, 1);
        assert!((allocs[0].budget - 20_000.0).abs() < 1e-9); // capped
        assert_eq!(allocs[1].index, 0);
        assert!((allocs[1].budget - 10_000.0).abs() < 1e-9); // leftovers
    }

    #[test]
    fn ranked_skips_dust_budgets() {
        let cands = [cand(0, 0.004, 0.02), cand(1, 0.002, 0.02)];
        // Second candidate would get 500, below the minimum order.
        let allocs = allocate(SizerKind::Ranked, &cands, 20_500.0, 20_000.0, 1_000.0, 8, 0);
        assert_eq!(allocs.len(), 1);
    }

    #[test]
    fn ranked_honors_position_slots() {
        let cands = [cand(0, 0.004, 0.02), cand(1, 0.003, 0.02), cand(2, 0.002, 0.02)];
        let allocs = allocate(SizerKind::Ranked, &cands, 100_000.0, 20_000.0, 1_000.0, 2, 1);
        // One slot free: only the strongest fresh candidate gets a budget.
        assert_eq!(allocs.len(), 1);
        assert_eq!(allocs[0].index, 0);
    }

    #[test]
    fn kelly_weights_normalize_to_one() {
        let cands = [cand(0, 0.004, 0.02), cand(1, 0.002, 0.04), cand(2, 0.001, 0.01)];
        let w = kelly_weights(&cands);
        let total: f64 = w.iter().sum();
        assert!(total > 0.0);
        let normalized: f64 = w.iter().map(|x| x / total).sum();
        assert!((normalized - 1.0).abs() < 1e-9);
    }

    #[test]
    fn kelly_zeroes_degenerate_volatility() {
        let cands = [cand(0, 0.004, 0.0), cand(1, 0.002, 0.02)];
        let w = kelly_weights(&cands);
        assert_eq!(w[0], 0.0);
        assert!(w[1] > 0.0);
    }

    #[test]
    fn kelly_budgets_follow_edge_over_risk() {
        // Same volatility, 2x the edge -> 2x the budget.
        let cands = [cand(0, 0.004, 0.02), cand(1, 0.002, 0.02)];
        let allocs = allocate(SizerKind::Kelly, &cands, 30_000.0, 100_000.0, 1_000.0, 8, 0);
        assert_eq!(allocs.len(), 2);
        assert!((allocs[0].budget - 20_000.0).abs() < 1e-6);
        assert!((allocs[1].budget - 10_000.0).abs() < 1e-6);
    }

    #[test]
    fn kelly_all_zero_weights_allocates_nothing() {
        let cands = [cand(0, 0.004, 0.0), cand(1, 0.002, 0.0)];
        let allocs = allocate(SizerKind::Kelly, &cands, 30_000.0, 100_000.0, 1_000.0, 8, 0);
        assert!(allocs.is_empty());
    }

    #[test]
    fn concentrated_picks_single_best() {
        let cands = [cand(0, 0.002, 0.02), cand(1, 0.005, 0.02)];
        let allocs =
            allocate(SizerKind::Concentrated, &cands, 50_000.0, 45_000.0, 1_000.0, 3, 0);
        assert_eq!(allocs.len(), 1);
        assert_eq!(allocs[0].index, 1);
        assert!((allocs[0].budget - 45_000.0).abs() < 1e-9);
    }

    #[test]
    fn concentrated_saturated_leader_yields_to_runner_up() {
        let mut best = cand(0, 0.005, 0.02);
        best.exposure = 45_000.0; // already at cap
        let cands = [best, cand(1, 0.002, 0.02)];
        let allocs =
            allocate(SizerKind::Concentrated, &cands, 50_000.0, 45_000.0, 1_000.0, 3, 1);
        assert_eq!(allocs.len(), 1);
        assert_eq!(allocs[0].index, 1);
    }

    #[test]
    fn concentrated_respects_position_limit() {
        let cands = [cand(0, 0.005, 0.02)];
        let allocs =
            allocate(SizerKind::Concentrated, &cands, 50_000.0, 45_000.0, 1_000.0, 3, 3);
        assert!(allocs.is_empty());
    }

    #[test]
    fn diversified_splits_evenly_across_slots() {
        let cands = [cand(0, 0.002, 0.02), cand(1, 0.003, 0.02)];
        let allocs = allocate(SizerKind::Diversified, &cands, 40_000.0, 15_000.0, 1_000.0, 10, 6);
        // 4 open slots -> 10k per slot, capped at 15k (not binding).
        assert_eq!(allocs.len(), 2);
        for a in &allocs {
            assert!((a.budget - 10_000.0).abs() < 1e-9);
        }
    }

    #[test]
    fn diversified_full_book_allocates_nothing() {
        let cands = [cand(0, 0.002, 0.02)];
        let allocs = allocate(SizerKind::Diversified, &cands, 40_000.0, 15_000.0, 1_000.0, 10, 10);
        assert!(allocs.is_empty());
    }

    #[test]
    fn order_qty_floors_and_caps() {
        // (10_000 - 100) / 99 = 100.0 shares exactly.
        assert_eq!(order_qty(10_000.0, 99.0, 100.0, 1_000.0), 100.0);
        // Capacity binds.
        assert_eq!(order_qty(10_000.0, 99.0, 100.0, 40.0), 40.0);
        // Degenerate price.
        assert_eq!(order_qty(10_000.0, 0.0, 100.0, 40.0), 0.0);
        // Budget under commission.
        assert_eq!(order_qty(50.0, 10.0, 100.0, 40.0), 0.0);
    }
}
