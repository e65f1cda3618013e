//! Integer encodings of which axes a reduction touches.

/// Encodes a canonical axis-kind sequence as a dense integer.
///
/// Each axis contributes `2^(rank-1-i)` if retained and twice that if reduced, so the result is
/// `(2^rank - 1) + mask` where `mask` has the leading axis in its highest bit. Ranges for
/// different ranks never overlap, so the encoding is collision-free for ranks up to 30.
pub fn dynamic_pattern(rank: usize, reduce_axes: &[usize]) -> i32 {
    debug_assert!(rank <= 30);
    (0..rank)
        .map(|i| {
            let weight = 1i32 << (rank - 1 - i);
            if reduce_axes.contains(&i) {
                2 * weight
            } else {
                weight
            }
        })
        .sum()
}

/// Encodes the raw reduce axes of a shape known at compile time.
///
/// The key concatenates the decimal digits `axis + 1` of each (sorted) reduce axis, so reducing
/// axes `[0, 2]` gives `13`. Returns 0 when nothing is reduced.
pub fn static_pattern(raw_reduce_axes: &[usize]) -> i32 {
    raw_reduce_axes
        .iter()
        .fold(0i32, |key, &axis| key.saturating_mul(10).saturating_add(axis as i32 + 1))
}
