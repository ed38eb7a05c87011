//! Draft to listing normalization: canonical attributes, station-area filter, dedupe.

use std::collections::HashMap;

use chrono::NaiveDate;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use suumo_adapters::{
    extract_area_sqm, extract_area_tsubo, extract_price_yen, normalize_text, unit_price,
};
use suumo_core::{Category, Listing, ListingAttributes, ListingDraft, ListingKey};

/// Okusawa 3-chome, written with an Arabic or kanji numeral and an optional `丁目` or dash.
pub const DEFAULT_AREA_FILTER: &str = r"奥沢\s*[3三]\s*(丁目|[-−ー])?";

#[derive(Debug, Clone, Default)]
pub struct AreaFilter {
    pattern: Option<Regex>,
}

impl AreaFilter {
    pub fn new(pattern: Option<&str>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: pattern.map(Regex::new).transpose()?,
        })
    }

    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Matches against the NFKC-normalized address.
    pub fn matches(&self, address: &str) -> bool {
        match &self.pattern {
            Some(pattern) => pattern.is_match(&normalize_text(address)),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeReport {
    pub drafts: usize,
    pub filtered_out: usize,
    pub duplicates_collapsed: usize,
    pub listings: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub listings: Vec<Listing>,
    pub report: NormalizeReport,
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    area: AreaFilter,
}

impl Normalizer {
    pub fn new(area: AreaFilter) -> Self {
        Self { area }
    }

    pub fn normalize(&self, drafts: Vec<ListingDraft>, observed_at: NaiveDate) -> Normalized {
        let total = drafts.len();
        let listings: Vec<Listing> = drafts
            .into_iter()
            .map(|draft| to_listing(draft, observed_at))
            .filter(|listing| self.area.matches(&listing.attributes.address))
            .collect();
        let filtered_out = total - listings.len();
        let (listings, duplicates_collapsed) = dedupe_last_wins(listings);

        Normalized {
            report: NormalizeReport {
                drafts: total,
                filtered_out,
                duplicates_collapsed,
                listings: listings.len(),
            },
            listings,
        }
    }
}

/// `h-` plus the first 16 hex digits of SHA-256 over category, address and price.
pub fn fallback_listing_id(category: Category, address: &str, price_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(category.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(address.as_bytes());
    hasher.update(b"|");
    hasher.update(price_text.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("h-{}", &digest[..16])
}

pub fn to_listing(draft: ListingDraft, observed_at: NaiveDate) -> Listing {
    let address = normalize_text(&draft.address);
    let price_text = normalize_text(&draft.price_text);
    let price_yen = draft.price_yen.or_else(|| extract_price_yen(&price_text));
    let area_text = draft.area_text.as_deref().unwrap_or_default();
    let area_sqm = extract_area_sqm(area_text);
    let area_tsubo = extract_area_tsubo(area_text);

    let listing_id = draft
        .listing_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| fallback_listing_id(draft.category, &address, &price_text));

    Listing {
        listing_id,
        category: draft.category,
        observed_at,
        attributes: ListingAttributes {
            title: normalize_text(&draft.title),
            unit_price_per_sqm: unit_price(price_yen, area_sqm),
            unit_price_per_tsubo: unit_price(price_yen, area_tsubo),
            address,
            price_text,
            price_yen,
            area_sqm,
            area_tsubo,
            details: draft.details,
            detail_url: draft.detail_url.unwrap_or_default(),
        },
    }
}

/// Collapses repeated (category, listing_id) keys.
///
/// The last occurrence supplies the attributes; it takes the slot of the first.
pub fn dedupe_last_wins(listings: Vec<Listing>) -> (Vec<Listing>, usize) {
    let mut slots: HashMap<ListingKey, usize> = HashMap::with_capacity(listings.len());
    let mut out: Vec<Listing> = Vec::with_capacity(listings.len());
    let mut collapsed = 0;

    for listing in listings {
        match slots.get(&listing.key()) {
            Some(&slot) => {
                out[slot] = listing;
                collapsed += 1;
            }
            None => {
                slots.insert(listing.key(), out.len());
                out.push(listing);
            }
        }
    }
    (out, collapsed)
}
