//! Alignment and balance adjustments applied once both tilings are known.
//!
//! Every rule only moves factors towards values that are already known to fit, and leaves the
//! tilings unchanged when it finds no improvement.

use crate::common::Variant;
use crate::partition::onchip::load_per_element;
use crate::partition::{BlockTiling, OnchipTiling, PartitionContext};
use crate::utils::{align_down, align_up, ceil_div, is_aligned};

use log::trace;

/// Numerator and denominator of the largest remainder, relative to the on-chip factor, still
/// worth rebalancing.
const REBALANCE_CUTOFF: (u64, u64) = (8, 10);

pub fn fine_tune(
    cx: &PartitionContext,
    block: BlockTiling,
    onchip: OnchipTiling,
) -> (BlockTiling, OnchipTiling) {
    if let [axis] = cx.reduce_axes {
        if cx.shape[*axis] == 1 {
            return (block, onchip);
        }
    }

    let innermost = cx.innermost();
    if onchip.axis == innermost {
        if is_aligned(cx.shape[innermost], cx.dma_align) {
            let factor = align_down(onchip.factor, cx.dma_align);
            if factor > 0 && factor != onchip.factor {
                trace!("Aligned on-chip factor {} down to {}", onchip.factor, factor);
                return (block, OnchipTiling { factor, ..onchip });
            }
        }
        return (block, onchip);
    }

    if block.axis == innermost {
        if is_aligned(block.factor, cx.dma_align) {
            return (block, onchip);
        }
        return align_block(cx, block, onchip).unwrap_or((block, onchip));
    }

    if block.axis == onchip.axis && cx.variant() != Variant::Transposed {
        return (block, rebalance(block, onchip));
    }
    (block, onchip)
}

/// Moves an unaligned block factor on the innermost axis to a neighboring multiple of the
/// alignment quantum, preferring the one above.
fn align_block(
    cx: &PartitionContext,
    block: BlockTiling,
    onchip: OnchipTiling,
) -> Option<(BlockTiling, OnchipTiling)> {
    let extent = cx.shape[block.axis];
    let lanes_before = block.lanes_used / ceil_div(extent, block.factor);
    let candidates = [
        align_up(block.factor, cx.dma_align),
        align_down(block.factor, cx.dma_align),
    ];
    candidates.into_iter().find_map(|factor| {
        if factor == 0 || factor > extent {
            return None;
        }
        let lanes_used = lanes_before * ceil_div(extent, factor);
        if lanes_used > cx.lane_count {
            return None;
        }
        let tuned = BlockTiling {
            factor,
            lanes_used,
            ..block
        };
        let load = load_per_element(cx, &tuned, onchip.axis);
        let capacity = cx.budget() / load;
        if capacity == 0 {
            return None;
        }
        trace!("Aligned block factor {} to {}", block.factor, factor);
        let onchip_factor = capacity.min(cx.extent_within_block(&tuned, onchip.axis));
        Some((
            tuned,
            OnchipTiling {
                factor: onchip_factor,
                ..onchip
            },
        ))
    })
}

/// Evens out on-chip iterations over a block axis when the last one would be short.
fn rebalance(block: BlockTiling, onchip: OnchipTiling) -> OnchipTiling {
    let remainder = block.factor % onchip.factor;
    if remainder == 0 || remainder * REBALANCE_CUTOFF.1 >= onchip.factor * REBALANCE_CUTOFF.0 {
        return onchip;
    }
    let factor = ceil_div(block.factor, ceil_div(block.factor, onchip.factor));
    trace!("Rebalanced on-chip factor {} to {}", onchip.factor, factor);
    OnchipTiling { factor, ..onchip }
}
