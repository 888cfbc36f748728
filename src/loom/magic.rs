//! Multiply-shift constants that replace division by a fixed divisor in generated device code.
//!
//! The values follow Hacker's Delight `magicgu` bit for bit. Kernels are generated against
//! these exact constants, so the arithmetic here wraps the same way the reference does.

use derive_more::Display;
use thiserror::Error;

/// Largest numerator a generic magic pair is valid for.
pub const NMAX: u64 = 0x7fff_ffff;
/// Largest numerator for divisor 3, whose magic still fits in 32 bits over the full range.
pub const NMAX_DIV3: u64 = 0xffff_ffff;

#[derive(Debug, Error)]
pub enum MagicError {
    #[error("divisor {0} is outside [1, 2^32)")]
    Divisor(u64),
    #[error("magic for unsigned division by {0} could not be found")]
    NotFound(u64),
}

/// A `(magic, shift)` pair for one divisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("(magic: {magic:#x}, shift: {shift})")]
pub struct Magic {
    pub magic: u64,
    pub shift: u64,
}

impl Magic {
    /// Largest numerator this pair divides exactly.
    #[inline]
    pub fn nmax(divisor: u64) -> u64 {
        match divisor {
            3 => NMAX_DIV3,
            _ => NMAX,
        }
    }

    /// Divides `n` the way generated code does.
    ///
    /// A magic of `1` marks a power-of-two divisor: the shift is applied directly.
    /// Otherwise the product is shifted past its low 32 bits.
    #[inline]
    pub fn divide(&self, n: u64) -> u64 {
        match self.magic {
            1 => n >> self.shift,
            magic => n.wrapping_mul(magic) >> (32 + self.shift),
        }
    }
}

/// Magic number and shift for `nmax * magic` fitting in 32 bits.
fn magic_u32(nmax: u64, divisor: u64) -> Result<Magic, MagicError> {
    let d = divisor;
    let nc = ((nmax + 1) / d).wrapping_mul(d).wrapping_sub(1);
    let nbits = u64::from(nmax.max(1).ilog2()) + 1;

    for p in 0..2 * nbits + 1 {
        let pow2 = 2u64.wrapping_pow(p as u32);
        let rem = d - 1 - pow2.wrapping_sub(1) % d;
        if pow2 > nc.wrapping_mul(rem) {
            let magic = pow2.wrapping_add(rem) / d;
            return Ok(Magic { magic, shift: p });
        }
    }
    Err(MagicError::NotFound(divisor))
}

/// Computes the multiply-shift pair replacing `n / divisor` for `n` up to [`Magic::nmax`].
///
/// The shift excludes the 32 bits the multiply lops off, except for power-of-two divisors
/// whose magic is `1`. Divisors above `2^31` that are not powers of two have no pair
/// in this scheme and fail with [`MagicError::NotFound`].
pub fn magic_division(divisor: u64) -> Result<Magic, MagicError> {
    if divisor == 0 || divisor > u64::from(u32::MAX) {
        return Err(MagicError::Divisor(divisor));
    }

    let Magic { magic, shift } = magic_u32(Magic::nmax(divisor), divisor)?;
    let shift = match magic {
        1 => shift,
        _ => shift
            .checked_sub(32)
            .ok_or(MagicError::NotFound(divisor))?,
    };

    let magic = Magic { magic, shift };
    log::trace!("magic division by {divisor}: {magic}");
    Ok(magic)
}

#[cfg(test)]
mod tests {
    use super::{Magic, MagicError, magic_division};

    fn check(divisor: u64, n: u64) {
        let magic = magic_division(divisor).expect("divisor in range");
        assert_eq!(
            magic.divide(n),
            n / divisor,
            "{n} / {divisor} with {magic} mismatched"
        );
    }

    #[test]
    fn test_known_values() {
        assert_eq!(
            magic_division(3).unwrap(),
            Magic {
                magic: 0xaaaa_aaab,
                shift: 1
            }
        );
        assert_eq!(magic_division(1).unwrap(), Magic { magic: 1, shift: 0 });
        assert_eq!(magic_division(2).unwrap(), Magic { magic: 1, shift: 1 });
        assert_eq!(
            magic_division(1024).unwrap(),
            Magic {
                magic: 1,
                shift: 10
            }
        );
    }

    #[test]
    fn test_divisor_range() {
        assert!(matches!(magic_division(0), Err(MagicError::Divisor(0))));
        assert!(matches!(
            magic_division(1 << 32),
            Err(MagicError::Divisor(_))
        ));
        assert!(matches!(
            magic_division(u64::from(u32::MAX)),
            Err(MagicError::NotFound(_))
        ));
        assert_eq!(
            magic_division(1 << 31).unwrap(),
            Magic {
                magic: 1,
                shift: 31
            }
        );
    }

    #[test]
    fn test_small_divisors() {
        for divisor in 1..=512 {
            let nmax = Magic::nmax(divisor);
            for n in (0..4096).chain(nmax - 4096..=nmax) {
                check(divisor, n);
            }
        }
    }

    #[test]
    fn test_divide_by_three_full_range() {
        let magic = magic_division(3).unwrap();
        assert!(magic.magic <= u64::from(u32::MAX));
        for n in [0, 1, 2, 3, 0x7fff_ffff, 0x8000_0000, 0xffff_fffe, 0xffff_ffff] {
            assert_eq!(magic.divide(n), n / 3);
        }
        for _ in 0..100_000 {
            let n = fastrand::u64(..=0xffff_ffff);
            assert_eq!(magic.divide(n), n / 3);
        }
    }

    #[test]
    fn test_sampled_divisors() {
        let mut rng = fastrand::Rng::with_seed(0x5eed);
        for _ in 0..2_000 {
            let divisor = rng.u64(1..=1 << 31);
            let nmax = Magic::nmax(divisor);
            for n in [0, 1, divisor - 1, divisor, nmax - 1, nmax] {
                if n <= nmax {
                    check(divisor, n);
                }
            }
            for _ in 0..64 {
                check(divisor, rng.u64(..=nmax));
            }
        }
    }
}
