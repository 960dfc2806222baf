//! Integer conversions between wire field widths and in-memory sizes.

/// Lossless widening, e.g. a u32 retransmission count used as a `Vec` length
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

#[cfg(any(target_pointer_width = "32", target_pointer_width = "64"))]
impl SafeCast<u64> for usize {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}

/// Narrowing to a wire field whose range the caller has already checked, e.g. a frame length
///  after comparing it against the SOFH maximum. Panics if that check was missing.
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        u32::try_from(self).expect("value was range checked before narrowing to u32")
    }
}

impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        u16::try_from(self).expect("value was range checked before narrowing to u16")
    }
}
