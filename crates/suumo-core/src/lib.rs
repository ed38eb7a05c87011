//! Core domain model for the SUUMO station listing collector.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "suumo-core";

/// Listing category scraped for the configured station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Rental,
    NewHouse,
    UsedHouse,
    Land,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Rental,
        Category::NewHouse,
        Category::UsedHouse,
        Category::Land,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Rental => "rental",
            Category::NewHouse => "new-house",
            Category::UsedHouse => "used-house",
            Category::Land => "land",
        }
    }

    /// Label used by the source site, persisted as `sub_category`.
    pub fn label_ja(self) -> &'static str {
        match self {
            Category::Rental => "賃貸",
            Category::NewHouse => "戸建て(新築)",
            Category::UsedHouse => "戸建て(中古)",
            Category::Land => "土地",
        }
    }

    pub fn is_sale(self) -> bool {
        !matches!(self, Category::Rental)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown listing category `{0}`")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s || c.label_ja() == s)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// Parsed handoff contract from adapters into the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDraft {
    pub category: Category,
    pub listing_id: Option<String>,
    pub title: String,
    pub address: String,
    pub price_text: String,
    pub price_yen: Option<f64>,
    pub area_text: Option<String>,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
    pub detail_url: Option<String>,
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
}

/// Normalized attribute set shared by every category.
///
/// Numeric fields stay optional: rentals carry no area, and some sale cards omit it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ListingAttributes {
    pub title: String,
    pub address: String,
    pub price_text: String,
    pub price_yen: Option<f64>,
    pub area_sqm: Option<f64>,
    pub area_tsubo: Option<f64>,
    pub unit_price_per_sqm: Option<f64>,
    pub unit_price_per_tsubo: Option<f64>,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
    pub detail_url: String,
}

/// One observed real-estate record on one run date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub listing_id: String,
    pub category: Category,
    pub observed_at: NaiveDate,
    pub attributes: ListingAttributes,
}

impl Listing {
    pub fn key(&self) -> ListingKey {
        ListingKey {
            category: self.category,
            listing_id: self.listing_id.clone(),
        }
    }
}

/// Identity of a listing within one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListingKey {
    pub category: Category,
    pub listing_id: String,
}

impl fmt::Display for ListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category, self.listing_id)
    }
}

/// The complete, immutable set of listings captured by one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub observed_at: NaiveDate,
    pub listings: Vec<Listing>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }

    pub fn find(&self, category: Category, listing_id: &str) -> Option<&Listing> {
        self.listings
            .iter()
            .find(|l| l.category == category && l.listing_id == listing_id)
    }

    pub fn count_by_category(&self) -> BTreeMap<Category, usize> {
        let mut counts = BTreeMap::new();
        for listing in &self.listings {
            *counts.entry(listing.category).or_default() += 1;
        }
        counts
    }
}

/// Commit record of one snapshot in the cumulative database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub observed_at: NaiveDate,
    pub run_id: Uuid,
    pub total_records: u64,
    pub content_sha256: String,
    pub committed_at: DateTime<Utc>,
}

/// Inclusive date window over the snapshot history; open ends are unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn since(start: NaiveDate) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    pub fn until(end: NaiveDate) -> Self {
        Self {
            start: None,
            end: Some(end),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }
}
