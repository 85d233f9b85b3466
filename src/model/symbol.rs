use serde::{Deserialize, Serialize};
use std::fmt;

/// Venue quote-currency / perp suffixes stripped during normalization.
const STRIPPED_SUFFIXES: &[&str] = &["-PERP", "-PERPETUAL", "_PERP", "USDT", "USDC", "USD"];

/// A normalized asset identifier.
///
/// Every operation that keys by symbol normalizes first (§3 invariant): a raw
/// venue symbol always maps to exactly one normalized symbol. Construct one
/// with [`Symbol::normalize`], never by wrapping a raw string directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    /// Normalize a raw, venue-specific symbol: uppercase, then strip the
    /// longest matching venue suffix (longest-first so `-PERP` isn't partially
    /// eaten by a shorter alias and so `BTCUSDT` doesn't leave a dangling `T`).
    pub fn normalize(raw: &str) -> Self {
        let upper = raw.trim().to_uppercase();
        let mut suffixes: Vec<&str> = STRIPPED_SUFFIXES.to_vec();
        suffixes.sort_by_key(|s| std::cmp::Reverse(s.len()));

        for suffix in suffixes {
            if let Some(stripped) = upper.strip_suffix(suffix) {
                if !stripped.is_empty() {
                    return Symbol(stripped.to_string());
                }
            }
        }
        Symbol(upper)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(raw: &str) -> Self {
        Symbol::normalize(raw)
    }
}
