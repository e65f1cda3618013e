//! Chooses the execution variant of a reduction.
//!
//! Rules are tried in priority order ([RULES]); the first to accept wins. Each rule is gated by
//! the profile's capability flags and budget rows, and [NormalRule] accepts everything.

use crate::common::Variant;
use crate::profile::{BudgetRow, Capabilities};
use crate::utils::{align_up, is_aligned, volume};

use enum_dispatch::enum_dispatch;
use log::trace;

/// Below this many input elements, one lane is cheaper than cross-lane accumulation.
pub const ATOMIC_MIN_VOLUME: u64 = 1024;

/// Group reduction needs at least this many reduced elements per lane.
pub const GROUP_REDUCE_MULTIPLIER: u64 = 8;

/// Transposing only pays off above this many rows per lane.
pub const TRANSPOSE_MIN_ROWS_PER_LANE: u64 = 32;

/// Everything the rules look at. `shape` and `reduce_axes` are canonical.
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext<'a> {
    pub shape: &'a [u64],
    pub reduce_axes: &'a [usize],
    pub budgets: &'a BudgetRow,
    pub capabilities: Capabilities,
    pub lane_count: u64,
    pub dma_align: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub variant: Variant,
    /// On-chip budget, in elements, the later stages must respect.
    pub budget: u64,
    /// Whether a normal reduction fell back to the rfactor budget.
    pub rfactor: bool,
}

#[enum_dispatch]
pub trait ScheduleRule {
    fn variant(&self) -> Variant;

    /// Returns a [Selection] if this rule's variant applies.
    fn accepts(&self, cx: &SelectionContext) -> Option<Selection>;
}

#[enum_dispatch(ScheduleRule)]
#[derive(Debug, Clone, Copy)]
pub enum Rule {
    AtomicRule,
    GroupRule,
    TransposeRule,
    PadRule,
    NormalRule,
}

#[derive(Debug, Clone, Copy)]
pub struct AtomicRule;

#[derive(Debug, Clone, Copy)]
pub struct GroupRule;

#[derive(Debug, Clone, Copy)]
pub struct TransposeRule;

#[derive(Debug, Clone, Copy)]
pub struct PadRule;

#[derive(Debug, Clone, Copy)]
pub struct NormalRule;

pub const RULES: [Rule; 5] = [
    Rule::AtomicRule(AtomicRule),
    Rule::GroupRule(GroupRule),
    Rule::TransposeRule(TransposeRule),
    Rule::PadRule(PadRule),
    Rule::NormalRule(NormalRule),
];

pub fn select(cx: &SelectionContext) -> Selection {
    RULES
        .iter()
        .find_map(|rule| {
            let accepted = rule.accepts(cx);
            trace!(
                "{} rule {}",
                rule.variant(),
                if accepted.is_some() { "accepted" } else { "rejected" }
            );
            accepted
        })
        .unwrap_or_else(|| NormalRule::selection(cx))
}

impl SelectionContext<'_> {
    pub fn innermost(&self) -> usize {
        self.shape.len() - 1
    }

    pub fn reduce_innermost(&self) -> bool {
        self.reduce_axes.contains(&self.innermost())
    }

    pub fn retained_count(&self) -> u64 {
        volume(
            self.shape
                .iter()
                .enumerate()
                .filter(|(i, _)| !self.reduce_axes.contains(i))
                .map(|(_, d)| d),
        )
    }

    pub fn reduced_count(&self) -> u64 {
        volume(self.reduce_axes.iter().map(|&i| &self.shape[i]))
    }

    /// Extent of axis `i`, rounded up to the alignment quantum if it is the innermost axis.
    pub fn padded_extent(&self, i: usize) -> u64 {
        if i == self.innermost() {
            align_up(self.shape[i], self.dma_align)
        } else {
            self.shape[i]
        }
    }

    /// Whether a budget can hold one alignment quantum of rows of the padded innermost axis.
    fn fits_aligned_rows(&self, budget: u64) -> bool {
        budget / self.dma_align >= self.padded_extent(self.innermost())
    }
}

impl ScheduleRule for AtomicRule {
    fn variant(&self) -> Variant {
        Variant::Atomic
    }

    fn accepts(&self, cx: &SelectionContext) -> Option<Selection> {
        if !cx.capabilities.atomic {
            return None;
        }
        let retained = cx.retained_count();
        let reduced = cx.reduced_count();
        let smallest = cx.budgets.smallest();

        let primary = retained <= smallest
            && retained.saturating_mul(reduced) > ATOMIC_MIN_VOLUME
            && retained < cx.lane_count.saturating_mul(cx.dma_align) / 2
            && reduced > cx.lane_count / 2;
        // A leading reduction ([1, R, A]) can still spread R across lanes if A fits on-chip.
        let leading_reduction = !cx.reduce_innermost()
            && cx.shape.len() >= 3
            && cx.shape[0] == 1
            && reduced > 1
            && align_up(retained, cx.dma_align) <= smallest;

        if !(primary || leading_reduction) {
            return None;
        }
        Some(Selection {
            variant: Variant::Atomic,
            budget: cx.budgets.for_variant(Variant::Atomic)?,
            rfactor: false,
        })
    }
}

impl ScheduleRule for GroupRule {
    fn variant(&self) -> Variant {
        Variant::Group
    }

    fn accepts(&self, cx: &SelectionContext) -> Option<Selection> {
        if !cx.capabilities.group_reduce
            || cx.reduce_axes.len() != 1
            || cx.reduce_innermost()
            || cx.shape.contains(&0)
        {
            return None;
        }
        let tail = cx.shape[cx.innermost()];
        let outer = cx.retained_count() / tail;
        let reduced = cx.shape[cx.reduce_axes[0]];
        let budget = cx.budgets.normal;

        let accepted = outer.saturating_mul(2) <= cx.lane_count
            && reduced >= cx.lane_count.saturating_mul(GROUP_REDUCE_MULTIPLIER)
            && cx.lane_count.saturating_mul(align_up(tail, cx.dma_align)) <= budget;
        accepted.then_some(Selection {
            variant: Variant::Group,
            budget,
            rfactor: false,
        })
    }
}

impl ScheduleRule for TransposeRule {
    fn variant(&self) -> Variant {
        Variant::Transposed
    }

    fn accepts(&self, cx: &SelectionContext) -> Option<Selection> {
        if !cx.capabilities.transpose || cx.shape.len() != 2 || !cx.reduce_innermost() {
            return None;
        }
        let budget = cx.budgets.transposed?;
        let (rows, cols) = (cx.shape[0], cx.shape[1]);
        let accepted = rows > 1
            && cols > 1
            && !is_aligned(cols, cx.dma_align)
            && cx.fits_aligned_rows(budget)
            && rows / cx.lane_count > TRANSPOSE_MIN_ROWS_PER_LANE;
        accepted.then_some(Selection {
            variant: Variant::Transposed,
            budget,
            rfactor: false,
        })
    }
}

impl ScheduleRule for PadRule {
    fn variant(&self) -> Variant {
        Variant::Padded
    }

    fn accepts(&self, cx: &SelectionContext) -> Option<Selection> {
        let budget = cx.budgets.padded?;
        let rank = cx.shape.len();
        let accepted = cx.reduce_axes.len() <= 1
            && (rank == 2 || rank == 3)
            && !is_aligned(cx.shape[cx.innermost()], cx.dma_align)
            && cx.fits_aligned_rows(budget)
            && cx.shape.iter().filter(|&&d| d > 1).count() >= 2;
        accepted.then_some(Selection {
            variant: Variant::Padded,
            budget,
            rfactor: false,
        })
    }
}

impl NormalRule {
    fn selection(cx: &SelectionContext) -> Selection {
        let normal = Selection {
            variant: Variant::Normal,
            budget: cx.budgets.normal,
            rfactor: false,
        };
        if !cx.reduce_innermost() {
            return normal;
        }
        let padded_reduced = (volume(cx.reduce_axes.iter().map(|&i| &cx.shape[i]))
            / cx.shape[cx.innermost()].max(1))
        .saturating_mul(cx.padded_extent(cx.innermost()));
        match cx.budgets.rfactor {
            Some(rfactor) if padded_reduced > cx.budgets.normal => Selection {
                variant: Variant::Normal,
                budget: rfactor,
                rfactor: true,
            },
            _ => normal,
        }
    }
}

impl ScheduleRule for NormalRule {
    fn variant(&self) -> Variant {
        Variant::Normal
    }

    fn accepts(&self, cx: &SelectionContext) -> Option<Selection> {
        Some(NormalRule::selection(cx))
    }
}
