//! Fractional order keys for sibling ordering.
//!
//! Keys are base-36 digit strings compared lexicographically. Between any
//! two distinct keys there is always room for another one, so inserting or
//! moving a block never renumbers its siblings.
//!
//! ```text
//!   "8"        "i"          "r"
//!    │    ▲     │     ▲      │
//!    │  "d"     │   "m"      │      between(Some("8"), Some("i")) == "d"
//! ```
//!
//! Keys never end in `'0'`: that keeps a gap below every key so that
//! `between(None, Some(k))` always exists.
//!
//! Reference: Evan Wallace, "Realtime editing of ordered sequences" (Figma, 2017)

use serde::{Deserialize, Serialize};

const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const BASE: usize = 36;

/// Sortable position of a block among its siblings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderKey(String);

/// Order key errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderKeyError {
    /// Key is empty, has a trailing zero, or contains a non base-36 digit
    Malformed(String),
    /// Lower bound is not strictly below the upper bound
    InvertedBounds { lower: String, upper: String },
}

impl std::fmt::Display for OrderKeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderKeyError::Malformed(k) => write!(f, "Malformed order key: {k:?}"),
            OrderKeyError::InvertedBounds { lower, upper } => {
                write!(f, "Order key bounds inverted: {lower:?} >= {upper:?}")
            }
        }
    }
}

impl std::error::Error for OrderKeyError {}

impl OrderKey {
    /// Key for the first block under an empty parent.
    pub fn first() -> Self {
        Self(String::from_utf8_lossy(&midpoint(&[], None)).into_owned())
    }

    /// Parse and validate a key.
    pub fn parse(raw: impl Into<String>) -> Result<Self, OrderKeyError> {
        let raw = raw.into();
        validate(&raw)?;
        Ok(Self(raw))
    }

    /// Generate a key strictly between `lower` and `upper`.
    ///
    /// `None` bounds are open: `between(None, None)` equals [`OrderKey::first`].
    pub fn between(lower: Option<&OrderKey>, upper: Option<&OrderKey>) -> Result<Self, OrderKeyError> {
        if let Some(lo) = lower {
            validate(&lo.0)?;
        }
        if let Some(hi) = upper {
            validate(&hi.0)?;
        }
        if let (Some(lo), Some(hi)) = (lower, upper) {
            if lo >= hi {
                return Err(OrderKeyError::InvertedBounds {
                    lower: lo.0.clone(),
                    upper: hi.0.clone(),
                });
            }
        }

        let lo = lower.map(|k| k.0.as_bytes()).unwrap_or(&[]);
        let hi = upper.map(|k| k.0.as_bytes());
        let key = midpoint(lo, hi);
        Ok(Self(String::from_utf8_lossy(&key).into_owned()))
    }

    /// Generate `count` ascending keys strictly between the bounds.
    pub fn sequence(
        lower: Option<&OrderKey>,
        upper: Option<&OrderKey>,
        count: usize,
    ) -> Result<Vec<Self>, OrderKeyError> {
        let mut keys: Vec<OrderKey> = Vec::with_capacity(count);
        for _ in 0..count {
            let next = OrderKey::between(keys.last().or(lower), upper)?;
            keys.push(next);
        }
        Ok(keys)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OrderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate(raw: &str) -> Result<(), OrderKeyError> {
    let bytes = raw.as_bytes();
    let well_formed = !bytes.is_empty()
        && bytes.iter().all(|b| digit_index(*b).is_some())
        && bytes.last() != Some(&b'0');
    if well_formed {
        Ok(())
    } else {
        Err(OrderKeyError::Malformed(raw.to_string()))
    }
}

fn digit_index(byte: u8) -> Option<usize> {
    DIGITS.iter().position(|d| *d == byte)
}

/// Midpoint of two digit strings, `lower < upper`, `None` upper = 1.0.
///
/// Both inputs are validated by the caller, so every byte is a known digit.
fn midpoint(lower: &[u8], upper: Option<&[u8]>) -> Vec<u8> {
    if let Some(hi) = upper {
        // Shared prefix (lower padded with zeros) is copied verbatim.
        let mut n = 0;
        while n < hi.len() && lower.get(n).copied().unwrap_or(b'0') == hi[n] {
            n += 1;
        }
        if n > 0 {
            let rest = if n < lower.len() { &lower[n..] } else { &[] };
            let mut out = hi[..n].to_vec();
            out.extend(midpoint(rest, Some(&hi[n..])));
            return out;
        }
    }

    let digit_lo = lower.first().and_then(|b| digit_index(*b)).unwrap_or(0);
    let digit_hi = match upper {
        Some(hi) => hi.first().and_then(|b| digit_index(*b)).unwrap_or(BASE),
        None => BASE,
    };

    if digit_hi - digit_lo > 1 {
        return vec![DIGITS[(digit_lo + digit_hi + 1) / 2]];
    }

    // Consecutive leading digits.
    match upper {
        Some(hi) if hi.len() > 1 => vec![hi[0]],
        _ => {
            let rest = if lower.len() > 1 { &lower[1..] } else { &[] };
            let mut out = vec![DIGITS[digit_lo]];
            out.extend(midpoint(rest, None));
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> OrderKey {
        OrderKey::parse(raw).unwrap()
    }

    #[test]
    fn test_first_key() {
        assert_eq!(OrderKey::first().as_str(), "i");
        assert_eq!(OrderKey::between(None, None).unwrap(), OrderKey::first());
    }

    #[test]
    fn test_between_orders_strictly() {
        let lo = key("8");
        let hi = key("i");
        let mid = OrderKey::between(Some(&lo), Some(&hi)).unwrap();
        assert!(lo < mid && mid < hi, "{lo} < {mid} < {hi}");
    }

    #[test]
    fn test_between_adjacent_digits_extends() {
        let lo = key("a");
        let hi = key("b");
        let mid = OrderKey::between(Some(&lo), Some(&hi)).unwrap();
        assert!(lo < mid && mid < hi);
        assert!(mid.as_str().starts_with('a'));
    }

    #[test]
    fn test_before_and_after_open_bounds() {
        let k = key("1");
        let before = OrderKey::between(None, Some(&k)).unwrap();
        let after = OrderKey::between(Some(&k), None).unwrap();
        assert!(before < k);
        assert!(after > k);

        let top = key("z");
        let above = OrderKey::between(Some(&top), None).unwrap();
        assert!(above > top);
    }

    #[test]
    fn test_repeated_prepend_never_exhausts() {
        let mut upper = OrderKey::first();
        for _ in 0..200 {
            let next = OrderKey::between(None, Some(&upper)).unwrap();
            assert!(next < upper);
            assert!(!next.as_str().ends_with('0'));
            upper = next;
        }
    }

    #[test]
    fn test_repeated_insert_between_same_pair() {
        let lo = key("a");
        let mut hi = key("b");
        for _ in 0..100 {
            let mid = OrderKey::between(Some(&lo), Some(&hi)).unwrap();
            assert!(lo < mid && mid < hi);
            hi = mid;
        }
    }

    #[test]
    fn test_sequence_is_ascending() {
        let lo = key("c");
        let hi = key("d");
        let keys = OrderKey::sequence(Some(&lo), Some(&hi), 10).unwrap();
        assert_eq!(keys.len(), 10);
        let mut prev = lo.clone();
        for k in &keys {
            assert!(*k > prev);
            assert!(*k < hi);
            prev = k.clone();
        }
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let lo = key("m");
        let hi = key("c");
        assert!(matches!(
            OrderKey::between(Some(&lo), Some(&hi)),
            Err(OrderKeyError::InvertedBounds { .. })
        ));
        assert!(OrderKey::between(Some(&lo), Some(&lo)).is_err());
    }

    #[test]
    fn test_malformed_keys_rejected() {
        assert!(OrderKey::parse("").is_err());
        assert!(OrderKey::parse("a0").is_err());
        assert!(OrderKey::parse("A").is_err());
        assert!(OrderKey::parse("a-b").is_err());
        assert!(OrderKey::parse("a01").is_ok());
    }
}
