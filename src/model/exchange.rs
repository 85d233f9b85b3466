use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A small closed set of venues the core knows about — mirrors the teacher's
/// `PerpVenue` enum (`model/node.rs`), generalized from "which Hyperliquid-family
/// venue" to "which perp exchange this leg trades on".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exchange {
    Alpha,
    Beta,
    Gamma,
    /// In-memory mock venue used by tests and the demo keeper binary.
    Mock(u8),
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exchange::Alpha => write!(f, "alpha"),
            Exchange::Beta => write!(f, "beta"),
            Exchange::Gamma => write!(f, "gamma"),
            Exchange::Mock(n) => write!(f, "mock-{n}"),
        }
    }
}

impl Exchange {
    /// The interval between funding payments on this venue. Per §3, every
    /// exchange carries a funding period alongside its identifier.
    pub fn funding_period(&self) -> Duration {
        match self {
            Exchange::Alpha => Duration::from_secs(3600),
            Exchange::Beta => Duration::from_secs(8 * 3600),
            Exchange::Gamma => Duration::from_secs(3600),
            Exchange::Mock(_) => Duration::from_secs(3600),
        }
    }

    /// UTC seconds-of-day offsets at which this venue settles funding, used by
    /// the dynamic-slicing time-to-funding calculation in §4.7. An hourly venue
    /// funds at every hour mark; an 8h venue funds at 00:00/08:00/16:00 UTC.
    pub fn funding_offsets_secs(&self) -> Vec<u64> {
        let period = self.funding_period().as_secs();
        let mut offsets = Vec::new();
        let mut t = 0;
        while t < 24 * 3600 {
            offsets.push(t);
            t += period;
        }
        offsets
    }
}
