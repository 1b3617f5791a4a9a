//! Core domain model and semester-calendar logic for the TEDE pipeline.

use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tede-core";

/// One harvested thesis/dissertation metadata entry.
///
/// Field declaration order is the partition CSV column order; serde renames
/// keep the on-disk header stable (`abstract` is a reserved word in Rust).
/// `year`/`half` stay strings because a record whose reference date could not
/// be bucketed travels with both empty until it is dropped at write time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Record {
    pub year: String,
    pub half: String,
    pub reference_date: String,
    pub title: String,
    pub author: String,
    pub advisor: String,
    pub program: String,
    pub keywords: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub link: String,
}

impl Record {
    /// Partition CSV header, in declaration order.
    pub const COLUMNS: [&'static str; 10] = [
        "year",
        "half",
        "reference_date",
        "title",
        "author",
        "advisor",
        "program",
        "keywords",
        "abstract",
        "link",
    ];

    /// Re-validate the stringly year/half into a typed bucket.
    ///
    /// This is the written-invariant boundary: records that fail here are
    /// dropped by the partition writer even if they slipped past bucketing.
    pub fn bucket(&self) -> Option<Bucket> {
        Bucket::from_strings(&self.year, &self.half)
    }
}

/// Half of an academic year. `First` covers January through June.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Semester {
    First,
    Second,
}

impl Semester {
    pub fn of_month(month: u32) -> Self {
        if month <= 6 {
            Semester::First
        } else {
            Semester::Second
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "1" => Some(Semester::First),
            "2" => Some(Semester::Second),
            _ => None,
        }
    }
}

impl fmt::Display for Semester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Semester::First => write!(f, "1"),
            Semester::Second => write!(f, "2"),
        }
    }
}

/// Partition key: one academic half-year. Ordered by (year, half).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Bucket {
    pub year: i32,
    pub half: Semester,
}

impl Bucket {
    pub fn new(year: i32, half: Semester) -> Self {
        Self { year, half }
    }

    /// Map a raw upstream date string to a bucket.
    ///
    /// Rules, tried in order: a string containing `T` anywhere has its
    /// leading ten characters parsed as `YYYY-MM-DD`; a ten-character dashed
    /// string is a plain `YYYY-MM-DD`; four characters are a bare year (half
    /// defaults to the first). Anything else, including any parse failure, is
    /// `None`; callers log the warning, this function stays pure.
    pub fn from_raw_date(raw: &str) -> Option<Self> {
        if raw.contains('T') {
            return Self::from_iso_date(raw.get(..10)?);
        }
        if raw.len() == 10 && raw.contains('-') {
            return Self::from_iso_date(raw);
        }
        if raw.len() == 4 {
            let year: i32 = raw.parse().ok()?;
            return Some(Self::new(year, Semester::First));
        }
        None
    }

    fn from_iso_date(value: &str) -> Option<Self> {
        let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
        Some(Self::new(date.year(), Semester::of_month(date.month())))
    }

    /// Parse a bucket back out of its stringly record form.
    pub fn from_strings(year: &str, half: &str) -> Option<Self> {
        let year: i32 = year.trim().parse().ok()?;
        let half = Semester::parse(half)?;
        Some(Self::new(year, half))
    }

    /// Most recent bucket eligible for materialization: the same half-year,
    /// one calendar year before the reference date. Everything newer belongs
    /// to a period that may still be receiving deposits.
    pub fn cutoff_for(reference: NaiveDate) -> Self {
        Self::new(reference.year() - 1, Semester::of_month(reference.month()))
    }

    /// Embargo rule: a bucket is materializable iff it is not newer than the
    /// cutoff. Inclusive at exactly the cutoff.
    pub fn within_cutoff(&self, cutoff: Bucket) -> bool {
        *self <= cutoff
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_S{}", self.year, self.half)
    }
}
