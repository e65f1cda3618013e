//! Splitting a canonical reduction across lanes (block tiling) and into on-chip iterations.

use crate::common::Variant;
use crate::schedule::Selection;
use crate::utils::align_up;

pub mod block;
pub mod finetune;
pub mod onchip;

pub use block::BlockTiling;
pub use onchip::OnchipTiling;

/// The canonical problem and hardware parameters shared by the partition stages.
#[derive(Debug, Clone, Copy)]
pub struct PartitionContext<'a> {
    pub shape: &'a [u64],
    pub reduce_axes: &'a [usize],
    pub selection: Selection,
    pub lane_count: u64,
    pub dma_align: u64,
}

impl PartitionContext<'_> {
    pub fn variant(&self) -> Variant {
        self.selection.variant
    }

    pub fn budget(&self) -> u64 {
        self.selection.budget
    }

    pub fn innermost(&self) -> usize {
        self.shape.len() - 1
    }

    pub fn is_reduced(&self, axis: usize) -> bool {
        self.reduce_axes.contains(&axis)
    }

    /// Axis `axis`'s extent after block tiling: the block factor on the block axis.
    pub fn extent_within_block(&self, block: &BlockTiling, axis: usize) -> u64 {
        if axis == block.axis {
            block.factor
        } else {
            self.shape[axis]
        }
    }

    /// The on-chip footprint of `elements` elements along `axis`.
    ///
    /// The innermost axis is always transferred in whole alignment quanta.
    pub fn footprint(&self, axis: usize, elements: u64) -> u64 {
        if axis == self.innermost() {
            align_up(elements, self.dma_align)
        } else {
            elements
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn pcx<'a>(
        shape: &'a [u64],
        reduce_axes: &'a [usize],
        variant: Variant,
        budget: u64,
    ) -> PartitionContext<'a> {
        PartitionContext {
            shape,
            reduce_axes,
            selection: Selection {
                variant,
                budget,
                rfactor: false,
            },
            lane_count: 32,
            dma_align: 16,
        }
    }

    #[test]
    fn test_footprint_aligns_innermost_only() {
        let c = pcx(&[7, 9, 15], &[1], Variant::Normal, 1024);
        assert_eq!(c.footprint(0, 7), 7);
        assert_eq!(c.footprint(2, 15), 16);
        assert_eq!(c.footprint(2, 33), 48);
    }

    #[test]
    fn test_extent_within_block() {
        let c = pcx(&[7, 9, 15], &[1], Variant::Normal, 1024);
        let block = BlockTiling {
            axis: 0,
            factor: 2,
            lanes_used: 4,
        };
        assert_eq!(c.extent_within_block(&block, 0), 2);
        assert_eq!(c.extent_within_block(&block, 1), 9);
    }
}
