// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exact signed rationals for the clean-aperture box. Values stay rational
//! through arithmetic; rounding happens only in the explicit accessors.

use std::fmt;

use crate::{Error, Result};

/// A signed 32-bit rational, reduced and with a positive denominator.
///
/// A zero denominator never constructs; arithmetic that would overflow the
/// 32-bit fields reports [`Error::InvalidFraction`] instead of wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fraction {
    pub numerator: i32,
    pub denominator: i32,
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a.max(1)
}

fn reduce(numerator: i64, denominator: i64) -> Result<Fraction> {
    if denominator == 0 {
        return Err(Error::InvalidFraction);
    }
    let sign: i64 = if (numerator < 0) != (denominator < 0) { -1 } else { 1 };
    let n = numerator.unsigned_abs();
    let d = denominator.unsigned_abs();
    let g = gcd(n, d);
    let numerator = i32::try_from((n / g) as i64 * sign).map_err(|_| Error::InvalidFraction)?;
    let denominator = i32::try_from(d / g).map_err(|_| Error::InvalidFraction)?;
    Ok(Fraction { numerator, denominator })
}

impl Fraction {
    pub fn new(numerator: i32, denominator: i32) -> Result<Self> {
        reduce(i64::from(numerator), i64::from(denominator))
    }

    pub fn is_valid(&self) -> bool {
        self.denominator > 0
    }

    pub fn add(self, rhs: Self) -> Result<Self> {
        let n = i64::from(self.numerator) * i64::from(rhs.denominator)
            + i64::from(rhs.numerator) * i64::from(self.denominator);
        let d = i64::from(self.denominator) * i64::from(rhs.denominator);
        reduce(n, d)
    }

    pub fn sub(self, rhs: Self) -> Result<Self> {
        let n = i64::from(self.numerator) * i64::from(rhs.denominator)
            - i64::from(rhs.numerator) * i64::from(self.denominator);
        let d = i64::from(self.denominator) * i64::from(rhs.denominator);
        reduce(n, d)
    }

    pub fn sub_int(self, rhs: i32) -> Result<Self> {
        let n = i64::from(self.numerator) - i64::from(rhs) * i64::from(self.denominator);
        reduce(n, i64::from(self.denominator))
    }

    pub fn div_int(self, rhs: i32) -> Result<Self> {
        reduce(
            i64::from(self.numerator),
            i64::from(self.denominator) * i64::from(rhs),
        )
    }

    /// Truncation toward negative infinity.
    pub fn round_down(&self) -> i32 {
        let n = i64::from(self.numerator);
        let d = i64::from(self.denominator);
        (n.div_euclid(d)) as i32
    }

    /// Truncation toward positive infinity.
    pub fn round_up(&self) -> i32 {
        let n = i64::from(self.numerator);
        let d = i64::from(self.denominator);
        (-((-n).div_euclid(d))) as i32
    }

    /// Nearest integer, ties to even.
    pub fn round(&self) -> i32 {
        let n = i64::from(self.numerator);
        let d = i64::from(self.denominator);
        let q = n.div_euclid(d);
        let r = n.rem_euclid(d);
        let result = match (2 * r).cmp(&d) {
            std::cmp::Ordering::Less => q,
            std::cmp::Ordering::Greater => q + 1,
            std::cmp::Ordering::Equal => {
                if q % 2 == 0 {
                    q
                } else {
                    q + 1
                }
            }
        };
        result as i32
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}
