//! Serial number arithmetic (RFC 1982) for TSNs and SSNs.
//!
//! TSNs are 32-bit and SSNs 16-bit counters that wrap; plain integer
//! comparison breaks at the wrap point, so every ordering decision in the
//! engine goes through these helpers.

const SERIAL_32_HALF: u32 = 1 << 31;
const SERIAL_16_HALF: u16 = 1 << 15;

/// `i1 < i2` in 32-bit serial arithmetic.
#[inline]
pub fn sna32_lt(i1: u32, i2: u32) -> bool {
    (i1 < i2 && i2 - i1 < SERIAL_32_HALF) || (i1 > i2 && i1 - i2 > SERIAL_32_HALF)
}

/// `i1 <= i2` in 32-bit serial arithmetic.
#[inline]
pub fn sna32_lte(i1: u32, i2: u32) -> bool {
    i1 == i2 || sna32_lt(i1, i2)
}

/// `i1 > i2` in 32-bit serial arithmetic.
#[inline]
pub fn sna32_gt(i1: u32, i2: u32) -> bool {
    (i1 < i2 && i2 - i1 > SERIAL_32_HALF) || (i1 > i2 && i1 - i2 < SERIAL_32_HALF)
}

/// `i1 >= i2` in 32-bit serial arithmetic.
#[inline]
pub fn sna32_gte(i1: u32, i2: u32) -> bool {
    i1 == i2 || sna32_gt(i1, i2)
}

/// `i1 < i2` in 16-bit serial arithmetic.
#[inline]
pub fn sna16_lt(i1: u16, i2: u16) -> bool {
    (i1 < i2 && i2 - i1 < SERIAL_16_HALF) || (i1 > i2 && i1 - i2 > SERIAL_16_HALF)
}

/// `i1 <= i2` in 16-bit serial arithmetic.
#[inline]
pub fn sna16_lte(i1: u16, i2: u16) -> bool {
    i1 == i2 || sna16_lt(i1, i2)
}

/// `i1 > i2` in 16-bit serial arithmetic.
#[inline]
pub fn sna16_gt(i1: u16, i2: u16) -> bool {
    (i1 < i2 && i2 - i1 > SERIAL_16_HALF) || (i1 > i2 && i1 - i2 < SERIAL_16_HALF)
}

/// `i1 >= i2` in 16-bit serial arithmetic.
#[inline]
pub fn sna16_gte(i1: u16, i2: u16) -> bool {
    i1 == i2 || sna16_gt(i1, i2)
}
