//! Lot identifiers
//!
//! Generated client-side as `LOT<YY><MM><NNN>`: two-digit calendar year,
//! zero-padded month, zero-padded three-digit random suffix. Uniqueness is
//! only probabilistic; `LotTrace::create_lot` checks candidates against the
//! current lot list before using one.

use std::fmt;

use chrono::{Datelike, Local, NaiveDate};
use rand::Rng;
use serde::{Deserialize, Serialize};

const PREFIX: &str = "LOT";
const SUFFIX_SPACE: u32 = 1000;

/// Identity of a lot. The only foreign key in the model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LotId(String);

impl LotId {
    /// Wrap an id read from the store. Any non-blank string is accepted;
    /// legacy lots may not follow the generated format.
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /// Generate an id for today's local date.
    pub fn generate() -> Self {
        Self::generate_at(Local::now().date_naive(), &mut rand::thread_rng())
    }

    /// Generate an id for `date` with the given random source.
    pub fn generate_at<R: Rng + ?Sized>(date: NaiveDate, rng: &mut R) -> Self {
        let suffix = rng.gen_range(0..SUFFIX_SPACE);
        Self(format!(
            "{}{:02}{:02}{:03}",
            PREFIX,
            date.year().rem_euclid(100),
            date.month(),
            suffix
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the id follows the generated `LOT<YY><MM><NNN>` shape.
    pub fn is_canonical(&self) -> bool {
        let Some(rest) = self.0.strip_prefix(PREFIX) else {
            return false;
        };
        if rest.len() != 7 || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        matches!(rest[2..4].parse::<u32>(), Ok(1..=12))
    }
}

impl fmt::Display for LotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LotId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
