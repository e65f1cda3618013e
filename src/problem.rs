use crate::common::{Axes, Shape};
use crate::engine::StageFailure;
use crate::utils::{join_into_string, volume};

use smallvec::{smallvec, SmallVec};

/// A single tiling request: a tensor shape and the axes reduced over it.
///
/// Holds both the shape as seen at the operator boundary and its canonical form, in which
/// size-one axes are gone and adjacent axes of the same kind are fused. Canonical shapes always
/// begin with a retained axis and contain at least one reduced axis, padding with synthetic
/// extent-1 axes where needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReductionProblem {
    raw_shape: Shape,
    raw_reduce_axes: Axes,
    shape: Shape,
    reduce_axes: Axes,
    keep_dims: bool,
}

/// Largest element count a request may have, so that offsets fit a signed 64-bit index.
const MAX_ELEMENTS: u64 = i64::MAX as u64;

#[derive(Debug, Clone, Copy)]
struct AxisRun {
    extent: u64,
    reduced: bool,
    pinned: bool,
}

impl ReductionProblem {
    /// Validates and canonicalizes a request.
    ///
    /// `axes` and `disable_fuse_axes` may be negative and are resolved against the rank of
    /// `raw_shape`. A rank-0 shape is treated as `[1]`.
    pub fn new(
        raw_shape: &[i64],
        axes: &[i64],
        disable_fuse_axes: &[i64],
        keep_dims: bool,
    ) -> Result<Self, StageFailure> {
        let raw_shape = if raw_shape.is_empty() {
            smallvec![1]
        } else {
            raw_shape
                .iter()
                .enumerate()
                .map(|(i, &d)| u64::try_from(d).map_err(|_| StageFailure::UnknownExtent(i)))
                .collect::<Result<Shape, _>>()?
        };
        if !raw_shape.contains(&0) {
            let elements = raw_shape
                .iter()
                .try_fold(1u64, |acc, &d| acc.checked_mul(d))
                .filter(|&n| n <= MAX_ELEMENTS);
            if elements.is_none() {
                return Err(StageFailure::TooManyElements(join_into_string(&raw_shape, "x")));
            }
        }
        let rank = raw_shape.len();
        let raw_reduce_axes = resolve_axes(axes, rank)?;
        let pinned = resolve_axes(disable_fuse_axes, rank)?;
        let (shape, reduce_axes) = canonicalize(&raw_shape, &raw_reduce_axes, &pinned);
        Ok(ReductionProblem {
            raw_shape,
            raw_reduce_axes,
            shape,
            reduce_axes,
            keep_dims,
        })
    }

    pub fn raw_shape(&self) -> &[u64] {
        &self.raw_shape
    }

    /// The reduce axes of the raw shape, sorted and deduplicated.
    pub fn raw_reduce_axes(&self) -> &[usize] {
        &self.raw_reduce_axes
    }

    /// The canonical shape.
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    /// The canonical reduce axes, ascending.
    pub fn reduce_axes(&self) -> &[usize] {
        &self.reduce_axes
    }

    pub fn has_zero_extent(&self) -> bool {
        self.raw_shape.contains(&0)
    }

    /// Number of elements in the output.
    pub fn retained_count(&self) -> u64 {
        volume(
            self.raw_shape
                .iter()
                .enumerate()
                .filter(|(i, _)| !self.raw_reduce_axes.contains(i))
                .map(|(_, d)| d),
        )
    }

    /// Number of input elements folded into each output element.
    pub fn reduced_count(&self) -> u64 {
        volume(self.raw_reduce_axes.iter().map(|&i| &self.raw_shape[i]))
    }

    /// The shape of the operator's output.
    pub fn output_shape(&self) -> Shape {
        let out: Shape = self
            .raw_shape
            .iter()
            .enumerate()
            .filter_map(|(i, &d)| match (self.raw_reduce_axes.contains(&i), self.keep_dims) {
                (false, _) => Some(d),
                (true, true) => Some(1),
                (true, false) => None,
            })
            .collect();
        if out.is_empty() {
            smallvec![1]
        } else {
            out
        }
    }
}

/// Resolves possibly-negative axes into sorted, unique indices in `[0, rank)`.
pub fn resolve_axes(axes: &[i64], rank: usize) -> Result<Axes, StageFailure> {
    let signed_rank = rank as i64;
    let mut resolved = axes
        .iter()
        .map(|&a| {
            let r = if a < 0 { a + signed_rank } else { a };
            if (0..signed_rank).contains(&r) {
                Ok(r as usize)
            } else {
                Err(StageFailure::AxisOutOfRange { axis: a, rank })
            }
        })
        .collect::<Result<Axes, _>>()?;
    resolved.sort_unstable();
    resolved.dedup();
    Ok(resolved)
}

/// Drops size-one axes, fuses same-kind runs, and pads to the canonical form.
///
/// `reduce_axes` and `pinned` must be sorted indices into `shape`. Pinned axes survive even at
/// extent 1 and are never fused with their neighbors.
pub fn canonicalize(shape: &[u64], reduce_axes: &[usize], pinned: &[usize]) -> (Shape, Axes) {
    let mut runs: SmallVec<[AxisRun; 8]> = SmallVec::new();
    for (i, &extent) in shape.iter().enumerate() {
        let is_pinned = pinned.contains(&i);
        if extent == 1 && !is_pinned {
            continue;
        }
        let reduced = reduce_axes.contains(&i);
        match runs.last_mut() {
            Some(last) if last.reduced == reduced && !last.pinned && !is_pinned => {
                last.extent = last.extent.saturating_mul(extent);
            }
            _ => runs.push(AxisRun {
                extent,
                reduced,
                pinned: is_pinned,
            }),
        }
    }

    if runs.is_empty() {
        runs.push(AxisRun {
            extent: 1,
            reduced: !reduce_axes.is_empty(),
            pinned: false,
        });
    }
    if runs[0].reduced {
        runs.insert(
            0,
            AxisRun {
                extent: 1,
                reduced: false,
                pinned: false,
            },
        );
    }
    if !runs.iter().any(|r| r.reduced) {
        runs.push(AxisRun {
            extent: 1,
            reduced: true,
            pinned: false,
        });
    }

    let canonical_shape = runs.iter().map(|r| r.extent).collect();
    let canonical_axes = runs
        .iter()
        .enumerate()
        .filter(|(_, r)| r.reduced)
        .map(|(i, _)| i)
        .collect();
    (canonical_shape, canonical_axes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn canon(shape: &[u64], axes: &[usize]) -> (Vec<u64>, Vec<usize>) {
        let (s, a) = canonicalize(shape, axes, &[]);
        (s.to_vec(), a.to_vec())
    }

    #[test]
    fn test_fully_degenerate_reduction() {
        assert_eq!(canon(&[1], &[0]), (vec![1, 1], vec![1]));
        assert_eq!(canon(&[1, 1, 1], &[0, 2]), (vec![1, 1], vec![1]));
    }

    #[test]
    fn test_no_reduction_appends_synthetic_reduced_axis() {
        assert_eq!(canon(&[4, 1, 6], &[]), (vec![24, 1], vec![1]));
        assert_eq!(canon(&[1], &[]), (vec![1, 1], vec![1]));
    }

    #[test]
    fn test_leading_reduction_prepends_synthetic_retained_axis() {
        assert_eq!(canon(&[8, 3, 5], &[0]), (vec![1, 8, 15], vec![1]));
        assert_eq!(canon(&[8], &[0]), (vec![1, 8], vec![1]));
    }

    #[test]
    fn test_fuses_same_kind_runs() {
        assert_eq!(
            canon(&[5182, 22, 46, 799], &[1]),
            (vec![5182, 22, 36754], vec![1])
        );
        assert_eq!(
            canon(&[2, 3, 4, 5, 6, 7], &[2, 3, 5]),
            (vec![6, 20, 6, 7], vec![1, 3])
        );
    }

    #[test]
    fn test_size_one_axes_between_runs_fuse_across() {
        assert_eq!(canon(&[4, 1, 4, 9], &[3]), (vec![16, 9], vec![1]));
        assert_eq!(canon(&[4, 9, 1, 9], &[1, 3]), (vec![4, 81], vec![1]));
    }

    #[test]
    fn test_pinned_axes_are_kept_apart() {
        let (s, a) = canonicalize(&[4, 1, 6, 8], &[3], &[1]);
        assert_eq!(s.to_vec(), vec![4, 1, 6, 8]);
        assert_eq!(a.to_vec(), vec![3]);

        let (s, a) = canonicalize(&[4, 5, 6, 8], &[3], &[2]);
        assert_eq!(s.to_vec(), vec![20, 6, 8]);
        assert_eq!(a.to_vec(), vec![2]);
    }

    #[test]
    fn test_resolve_axes() {
        assert_eq!(resolve_axes(&[-1, 0, 2], 3).unwrap().to_vec(), vec![0, 2]);
        assert_eq!(
            resolve_axes(&[3], 3),
            Err(StageFailure::AxisOutOfRange { axis: 3, rank: 3 })
        );
        assert_eq!(
            resolve_axes(&[-4], 3),
            Err(StageFailure::AxisOutOfRange { axis: -4, rank: 3 })
        );
    }

    #[test]
    fn test_problem_rejects_unknown_extent() {
        assert_eq!(
            ReductionProblem::new(&[4, -1], &[0], &[], false),
            Err(StageFailure::UnknownExtent(1))
        );
    }

    #[test]
    fn test_problem_rejects_unaddressable_element_count() {
        assert_eq!(
            ReductionProblem::new(&[8, 1 << 32, 1 << 32], &[0], &[], false),
            Err(StageFailure::TooManyElements("8x4294967296x4294967296".to_string()))
        );
        // A zero extent makes the product small however large the other extents are.
        let p = ReductionProblem::new(&[0, 1 << 40, 1 << 40], &[0], &[], false).unwrap();
        assert!(p.has_zero_extent());
    }

    #[test]
    fn test_output_shape() {
        let p = ReductionProblem::new(&[2, 3, 4], &[1], &[], false).unwrap();
        assert_eq!(p.output_shape().to_vec(), vec![2, 4]);
        assert_eq!(p.retained_count(), 8);
        assert_eq!(p.reduced_count(), 3);

        let p = ReductionProblem::new(&[2, 3, 4], &[-2], &[], true).unwrap();
        assert_eq!(p.output_shape().to_vec(), vec![2, 1, 4]);

        let p = ReductionProblem::new(&[2, 3], &[0, 1], &[], false).unwrap();
        assert_eq!(p.output_shape().to_vec(), vec![1]);
    }

    #[test]
    fn test_zero_extent_detection() {
        let p = ReductionProblem::new(&[2, 39, 0], &[2], &[], false).unwrap();
        assert!(p.has_zero_extent());
        assert_eq!(p.retained_count(), 78);
        assert_eq!(p.reduced_count(), 0);
    }

    #[test]
    fn test_rank_zero_is_a_single_element() {
        let p = ReductionProblem::new(&[], &[], &[], false).unwrap();
        assert_eq!(p.raw_shape(), &[1]);
        assert_eq!(p.shape(), &[1, 1]);
    }

    fn shape_and_axes() -> impl Strategy<Value = (Vec<u64>, Vec<usize>)> {
        prop::collection::vec(prop_oneof![Just(1u64), 2u64..40], 1..=6).prop_flat_map(|shape| {
            let rank = shape.len();
            (
                Just(shape),
                prop::collection::btree_set(0..rank, 0..=rank)
                    .prop_map(|s| s.into_iter().collect::<Vec<_>>()),
            )
        })
    }

    proptest! {
        #[test]
        fn test_canonicalize_is_idempotent((shape, axes) in shape_and_axes()) {
            let (s1, a1) = canonicalize(&shape, &axes, &[]);
            let (s2, a2) = canonicalize(&s1, &a1, &[]);
            prop_assert_eq!(s1, s2);
            prop_assert_eq!(a1, a2);
        }

        #[test]
        fn test_canonical_form_invariants((shape, axes) in shape_and_axes()) {
            let (s, a) = canonicalize(&shape, &axes, &[]);
            prop_assert!(s.len() >= 2);
            prop_assert!(!a.is_empty());
            prop_assert!(!a.contains(&0));
            prop_assert!(a.iter().all(|&i| i < s.len()));
            // Kinds alternate.
            for w in a.windows(2) {
                prop_assert!(w[1] >= w[0] + 2);
            }
            prop_assert_eq!(volume(&s), volume(&shape));
        }
    }
}
