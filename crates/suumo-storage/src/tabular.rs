//! CSV encoding of listing snapshots (`listings_latest.csv` and the dated history files).

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use suumo_core::{Category, Listing, ListingAttributes};
use thiserror::Error;

/// Files carry a BOM so spreadsheet tools detect UTF-8.
pub const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

pub const CSV_COLUMNS: [&str; 14] = [
    "observed_at",
    "category",
    "sub_category",
    "listing_id",
    "title",
    "address",
    "price_text",
    "price_yen",
    "area_sqm",
    "area_tsubo",
    "unit_price_per_sqm",
    "unit_price_per_tsubo",
    "detail_text",
    "detail_url",
];

#[derive(Debug, Error)]
pub enum TabularError {
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("detail_text json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Flat row shape shared by the CSV files and the `listings` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRow {
    pub observed_at: NaiveDate,
    pub category: Category,
    pub sub_category: String,
    pub listing_id: String,
    pub title: String,
    pub address: String,
    pub price_text: String,
    pub price_yen: Option<f64>,
    pub area_sqm: Option<f64>,
    pub area_tsubo: Option<f64>,
    pub unit_price_per_sqm: Option<f64>,
    pub unit_price_per_tsubo: Option<f64>,
    pub detail_text: String,
    pub detail_url: String,
}

impl ListingRow {
    pub fn from_listing(listing: &Listing) -> Result<Self, TabularError> {
        let attrs = &listing.attributes;
        let detail_text = if attrs.details.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&attrs.details)?
        };
        Ok(Self {
            observed_at: listing.observed_at,
            category: listing.category,
            sub_category: listing.category.label_ja().to_string(),
            listing_id: listing.listing_id.clone(),
            title: attrs.title.clone(),
            address: attrs.address.clone(),
            price_text: attrs.price_text.clone(),
            price_yen: attrs.price_yen,
            area_sqm: attrs.area_sqm,
            area_tsubo: attrs.area_tsubo,
            unit_price_per_sqm: attrs.unit_price_per_sqm,
            unit_price_per_tsubo: attrs.unit_price_per_tsubo,
            detail_text,
            detail_url: attrs.detail_url.clone(),
        })
    }

    pub fn into_listing(self) -> Listing {
        let details = parse_detail_text(&self.detail_text);
        Listing {
            listing_id: self.listing_id,
            category: self.category,
            observed_at: self.observed_at,
            attributes: ListingAttributes {
                title: self.title,
                address: self.address,
                price_text: self.price_text,
                price_yen: self.price_yen,
                area_sqm: self.area_sqm,
                area_tsubo: self.area_tsubo,
                unit_price_per_sqm: self.unit_price_per_sqm,
                unit_price_per_tsubo: self.unit_price_per_tsubo,
                details,
                detail_url: self.detail_url,
            },
        }
    }
}

/// Decodes the JSON detail map; rows written by older tooling may hold free text instead.
pub fn parse_detail_text(text: &str) -> BTreeMap<String, String> {
    if text.trim().is_empty() {
        return BTreeMap::new();
    }
    match serde_json::from_str::<BTreeMap<String, String>>(text) {
        Ok(map) => map,
        Err(_) => BTreeMap::from([("raw".to_string(), text.to_string())]),
    }
}

pub fn encode_listings(listings: &[Listing]) -> Result<Vec<u8>, TabularError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(UTF8_BOM.to_vec());
    writer.write_record(CSV_COLUMNS)?;
    for listing in listings {
        writer.serialize(ListingRow::from_listing(listing)?)?;
    }
    writer.into_inner().map_err(|e| TabularError::Io(e.into_error()))
}

pub fn decode_listings(bytes: &[u8]) -> Result<Vec<Listing>, TabularError> {
    let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(body);
    let mut out = Vec::new();
    for row in reader.deserialize::<ListingRow>() {
        out.push(row?.into_listing());
    }
    Ok(out)
}
