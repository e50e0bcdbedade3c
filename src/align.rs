//! Alignment arithmetic. Everything here works on plain `usize` addresses
//! and sizes so the same helpers serve both address alignment and size
//! rounding. All alignments must be powers of two.

/// Returns `true` if `value` is a multiple of `align`.
#[inline]
pub fn is_aligned(value: usize, align: usize) -> bool {
    debug_assert!(align.is_power_of_two());
    value & (align - 1) == 0
}

/// Rounds `value` down to the previous multiple of `align`.
#[inline]
pub fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Rounds `value` up to the next multiple of `align`, or `None` if the
/// result doesn't fit in a [`usize`]. We never wrap around here: a size
/// like `usize::MAX - 10` rounded up to 4096 would otherwise come back as a
/// tiny number and the caller would happily reserve it.
#[inline]
pub fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| align_down(v, align))
}

/// Grain sizes must be powers of two and consist of whole pages. Since the
/// page size is itself a power of two, the first condition implies the
/// second as long as `grain >= page_size`.
#[inline]
pub fn grain_size_check(grain_size: usize, page_size: usize) -> bool {
    page_size.is_power_of_two()
        && grain_size.is_power_of_two()
        && grain_size >= page_size
        && grain_size % page_size == 0
}
