/// Divides, rounding up. `d` must be non-zero.
pub fn ceil_div(n: u64, d: u64) -> u64 {
    debug_assert_ne!(d, 0);
    divrem::DivCeil::div_ceil(n, d)
}

/// Rounds `n` up to the next multiple of `quantum`, saturating at [u64::MAX].
pub fn align_up(n: u64, quantum: u64) -> u64 {
    ceil_div(n, quantum).saturating_mul(quantum)
}

/// Rounds `n` down to a multiple of `quantum`. May return zero.
pub fn align_down(n: u64, quantum: u64) -> u64 {
    n / quantum * quantum
}

pub fn is_aligned(n: u64, quantum: u64) -> bool {
    n % quantum == 0
}

/// Product of the given extents, saturating at [u64::MAX].
pub fn volume<'a>(extents: impl IntoIterator<Item = &'a u64>) -> u64 {
    extents
        .into_iter()
        .fold(1u64, |acc, &e| acc.saturating_mul(e))
}

/// Number of chunks of size `factor` needed to cover `extent`, and the size of the last one.
pub fn chunks_and_tail(extent: u64, factor: u64) -> (u64, u64) {
    let chunks = ceil_div(extent, factor);
    let tail = extent - factor * (chunks - 1);
    (chunks, tail)
}

pub fn join_into_string(c: impl IntoIterator<Item = impl ToString>, separator: &str) -> String {
    c.into_iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(separator)
}
