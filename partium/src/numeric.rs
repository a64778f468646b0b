//! Parsed preprocessing numbers.
//!
//! A pp-number keeps its radix and digit strings around so that `#if`
//! arithmetic, stringification, and diagnostics can all work from the same
//! token without re-lexing.

use std::fmt;

/// `unsigned` suffix flag.
pub const F_UNSIGNED: u8 = 1;
/// `long` suffix flag.
pub const F_LONG: u8 = 2;
/// `long long` suffix flag.
pub const F_LONGLONG: u8 = 4;
/// `float` suffix flag.
pub const F_FLOAT: u8 = 8;
/// `double` suffix flag.
pub const F_DOUBLE: u8 = 16;

/// A numeric literal, decomposed.
#[derive(Clone, Debug, PartialEq)]
pub struct NumericValue {
    base: u32,
    integer: String,
    fraction: Option<String>,
    exponent: Option<String>,
    flags: u8,
}

impl NumericValue {
    /// Build a plain integer value in the given radix, as used for the
    /// synthetic tokens behind `__LINE__` and `__COUNTER__`.
    #[must_use]
    pub fn integer(base: u32, digits: impl Into<String>) -> Self {
        NumericValue {
            base,
            integer: digits.into(),
            fraction: None,
            exponent: None,
            flags: 0,
        }
    }

    /// Parse the spelling of a pp-number.
    ///
    /// Returns the value and, when the spelling is questionable (an `8` in an
    /// octal constant, an unknown suffix), a warning message. The value is
    /// always usable; a bad octal constant degrades to decimal.
    #[must_use]
    pub fn parse(text: &str) -> (Self, Option<String>) {
        let mut warning = None;
        let bytes: Vec<char> = text.chars().collect();
        let mut pos = 0;

        let base = if text.starts_with("0x") || text.starts_with("0X") {
            pos = 2;
            16
        } else if bytes.first() == Some(&'0') && bytes.len() > 1 {
            8
        } else {
            10
        };

        let digit_set = |c: char| match base {
            16 => c.is_ascii_hexdigit(),
            _ => c.is_ascii_digit(),
        };

        let mut integer = String::new();
        while pos < bytes.len() && digit_set(bytes[pos]) {
            integer.push(bytes[pos]);
            pos += 1;
        }

        let mut fraction = None;
        if pos < bytes.len() && bytes[pos] == '.' {
            pos += 1;
            let mut frac = String::new();
            while pos < bytes.len() && digit_set(bytes[pos]) {
                frac.push(bytes[pos]);
                pos += 1;
            }
            fraction = Some(frac);
        }

        let exp_char: &[char] = if base == 16 { &['p', 'P'] } else { &['e', 'E'] };
        let mut exponent = None;
        if pos < bytes.len() && exp_char.contains(&bytes[pos]) {
            pos += 1;
            let mut exp = String::new();
            if pos < bytes.len() && (bytes[pos] == '+' || bytes[pos] == '-') {
                if bytes[pos] == '-' {
                    exp.push('-');
                }
                pos += 1;
            }
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                exp.push(bytes[pos]);
                pos += 1;
            }
            exponent = Some(exp);
        }

        let mut flags = 0;
        while pos < bytes.len() {
            match bytes[pos] {
                'u' | 'U' => flags |= F_UNSIGNED,
                'l' | 'L' => {
                    if flags & F_LONG != 0 {
                        flags = (flags & !F_LONG) | F_LONGLONG;
                    } else {
                        flags |= F_LONG;
                    }
                }
                'f' | 'F' => flags |= F_FLOAT,
                'd' | 'D' => flags |= F_DOUBLE,
                c => {
                    warning = Some(format!("invalid suffix '{c}' in numeric constant '{text}'"));
                    break;
                }
            }
            pos += 1;
        }

        let mut base = base;
        if base == 8 {
            // A leading zero with a fraction or exponent is a decimal float,
            // and 8/9 make the constant decimal with a complaint.
            if fraction.is_some() || exponent.is_some() {
                base = 10;
            } else if integer.contains(['8', '9']) {
                warning = Some(format!("illegal digit in octal constant '{text}'"));
                base = 10;
            }
        }

        (
            NumericValue {
                base,
                integer,
                fraction,
                exponent,
                flags,
            },
            warning,
        )
    }

    /// The radix of the spelling: 8, 10 or 16.
    #[must_use]
    pub fn base(&self) -> u32 {
        self.base
    }

    /// The suffix flags (`F_UNSIGNED` and friends).
    #[must_use]
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// True when the literal has a fractional part or an exponent.
    #[must_use]
    pub fn is_floating(&self) -> bool {
        self.fraction.is_some() || self.exponent.is_some() || self.flags & (F_FLOAT | F_DOUBLE) != 0
    }

    fn digits_value(digits: &str, base: u32) -> i64 {
        digits.chars().fold(0i64, |acc, c| {
            let d = c.to_digit(base.max(10)).unwrap_or(0) as i64;
            acc.wrapping_mul(i64::from(base)).wrapping_add(d)
        })
    }

    fn exponent_value(&self) -> i32 {
        match &self.exponent {
            Some(e) => e.parse().unwrap_or(0),
            None => 0,
        }
    }

    /// The value as a signed 64-bit integer, the domain of `#if` arithmetic.
    #[must_use]
    pub fn long_value(&self) -> i64 {
        if self.fraction.is_none() && self.exponent.is_none() {
            Self::digits_value(&self.integer, self.base)
        } else {
            self.double_value() as i64
        }
    }

    /// The value as a double.
    #[must_use]
    pub fn double_value(&self) -> f64 {
        let mut value = Self::digits_value(&self.integer, self.base) as f64;
        if let Some(frac) = &self.fraction {
            let mut scale = 1.0 / f64::from(self.base);
            for c in frac.chars() {
                value += f64::from(c.to_digit(16).unwrap_or(0)) * scale;
                scale /= f64::from(self.base);
            }
        }
        let exp = self.exponent_value();
        if exp != 0 {
            let exp_base: f64 = if self.base == 16 { 2.0 } else { 10.0 };
            value *= exp_base.powi(exp);
        }
        value
    }
}

impl fmt::Display for NumericValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_floating() {
            write!(f, "{}", self.double_value())
        } else {
            write!(f, "{}", self.long_value())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(text: &str) -> NumericValue {
        let (value, warning) = NumericValue::parse(text);
        assert!(warning.is_none(), "unexpected warning for '{text}': {warning:?}");
        value
    }

    fn assert_value(text: &str, expected: f64) {
        let v = value(text);
        assert!(
            (v.double_value() - expected).abs() < 0.01,
            "double mismatch for '{text}': {} != {expected}",
            v.double_value()
        );
        assert_eq!(v.long_value(), expected as i64, "long mismatch for '{text}'");
    }

    #[test]
    fn decimal() {
        assert_value("0", 0.0);
        assert_value("1", 1.0);
        assert_value("1L", 1.0);
        assert_value("12", 12.0);
        assert_value("12L", 12.0);
    }

    #[test]
    fn hex() {
        assert_value("0xf", 15.0);
        assert_value("0xfL", 15.0);
        assert_value("0x12", 18.0);
        assert_value("0x12L", 18.0);
        // 'e' is a hex digit, not an exponent.
        assert_value("0x12e3", 4835.0);
        // 'p' is the hex exponent, in powers of two.
        assert_value("0x12p3", 144.0);
    }

    #[test]
    fn octal() {
        let v = value("0673");
        assert_eq!(v.base(), 8);
        assert_eq!(v.long_value(), 0o673);
    }

    #[test]
    fn octal_with_exponent_is_decimal() {
        assert_value("012e3", 12000.0);
        assert_value("067e4", 670000.0);
    }

    #[test]
    fn floating() {
        assert_value(".0", 0.0);
        assert_value(".00", 0.0);
        assert_value("0.", 0.0);
        assert_value("0.0", 0.0);
        assert_value("00.0", 0.0);
        assert_value("00.", 0.0);
        assert_value("1e1", 10.0);
        assert_value("1e-1", 0.1);
    }

    #[test]
    fn suffix_flags() {
        assert_eq!(value("1u").flags(), F_UNSIGNED);
        assert_eq!(value("1ul").flags(), F_UNSIGNED | F_LONG);
        assert_eq!(value("1ll").flags(), F_LONGLONG);
        assert_eq!(value("1.5f").flags(), F_FLOAT);
    }

    #[test]
    fn illegal_octal_digit_warns() {
        let (v, warning) = NumericValue::parse("097");
        assert!(warning.is_some());
        assert_eq!(v.long_value(), 97);
    }
}
