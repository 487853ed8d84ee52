//! Core catalog model: items, price observations and merge classifications.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "catalog-core";

/// Stable external identity of a catalog item.
pub type ItemId = String;

/// Week label used when an observation timestamp cannot be read.
pub const UNKNOWN_WEEK: &str = "00";
/// Year label used when an observation timestamp cannot be read.
pub const UNKNOWN_YEAR: &str = "0000";

/// One row of the item feed as delivered. Every column may be absent or blank.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawItemRecord {
    pub id: Option<String>,
    pub name: Option<String>,
    pub category_name: Option<String>,
    pub group_name: Option<String>,
    pub weekly_average_price: Option<String>,
    pub icon_id: Option<String>,
    pub date_created: Option<String>,
    pub date_updated: Option<String>,
}

impl RawItemRecord {
    /// Trimmed identity, or `None` when the row cannot be keyed.
    pub fn item_id(&self) -> Option<&str> {
        self.id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }

    pub fn date_updated(&self) -> Option<&str> {
        self.date_updated
            .as_deref()
            .map(str::trim)
            .filter(|ts| !ts.is_empty())
    }

    /// True when the price column carries text that does not parse as a decimal.
    pub fn has_malformed_price(&self) -> bool {
        match self.weekly_average_price.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => parse_price(text).is_none(),
            _ => false,
        }
    }
}

/// Canonical catalog entry keyed by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogItem {
    pub id: ItemId,
    pub name: String,
    pub category_name: String,
    pub group_name: String,
    /// Written as its exact decimal text so the snapshot never goes through f64.
    #[serde(with = "rust_decimal::serde::str_option")]
    pub weekly_average_price: Option<Decimal>,
    pub icon_id: Option<String>,
    pub date_created: Option<String>,
    pub date_updated: Option<String>,
    pub icon_asset_key: Option<String>,
    /// Set during a run once the icon is known to be stored; never persisted.
    #[serde(skip)]
    pub icon_downloaded: bool,
}

impl CatalogItem {
    /// Build a fresh item from its first fetched row. Absent columns stay empty.
    pub fn from_raw(id: &str, raw: &RawItemRecord) -> Self {
        let mut item = Self {
            id: id.to_string(),
            ..Self::default()
        };
        item.overwrite_from(raw);
        item
    }

    /// Replace every mutable field with the fetched values.
    ///
    /// `date_created` keeps its first non-null value and the durable icon key
    /// is left alone, so a later merge can never lose either.
    pub fn overwrite_from(&mut self, raw: &RawItemRecord) {
        self.name = text_or_empty(raw.name.as_deref());
        self.category_name = text_or_empty(raw.category_name.as_deref());
        self.group_name = text_or_empty(raw.group_name.as_deref());
        self.weekly_average_price = raw.weekly_average_price.as_deref().and_then(parse_price);
        self.icon_id = non_empty(raw.icon_id.as_deref());
        self.date_updated = non_empty(raw.date_updated.as_deref());
        if self.date_created.is_none() {
            self.date_created = non_empty(raw.date_created.as_deref());
        }
        self.refresh_icon_flag();
    }

    pub fn has_icon(&self) -> bool {
        self.icon_id.as_deref().is_some_and(|id| !id.trim().is_empty())
    }

    pub fn icon_asset_key(&self) -> Option<&str> {
        self.icon_asset_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
    }

    /// Record the durable key an icon was stored under.
    pub fn mark_icon_stored(&mut self, asset_key: impl Into<String>) {
        self.icon_asset_key = Some(asset_key.into());
        self.icon_downloaded = true;
    }

    /// Re-derive `icon_downloaded` from the durable key alone.
    pub fn refresh_icon_flag(&mut self) {
        self.icon_downloaded = self.icon_asset_key().is_some();
    }
}

/// Per-run tag produced by the merge for every fetched identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeClassification {
    Unchanged,
    Updated,
    New,
}

impl ChangeClassification {
    /// Combine two tags for the same identity seen twice in one run.
    /// `New` outranks `Updated`, which outranks `Unchanged`.
    pub fn strongest(self, other: Self) -> Self {
        self.max(other)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Updated => "UPDATED",
            Self::Unchanged => "UNCHANGED",
        }
    }
}

impl fmt::Display for ChangeClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of an item's history feed as delivered.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawHistoryRow {
    pub price: Option<String>,
    pub week: Option<String>,
    pub year: Option<String>,
    pub date_created: Option<String>,
    pub date_updated: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryRowRejection {
    MissingPrice,
    InvalidPrice(String),
    MissingWeekOrYear,
    MissingDate,
}

impl fmt::Display for HistoryRowRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPrice => f.write_str("missing price"),
            Self::InvalidPrice(text) => write!(f, "invalid price {text:?}"),
            Self::MissingWeekOrYear => f.write_str("missing week or year"),
            Self::MissingDate => f.write_str("missing observation date"),
        }
    }
}

impl RawHistoryRow {
    pub fn into_record(self, item_id: &str) -> Result<HistoryRecord, HistoryRowRejection> {
        let price_text = non_empty(self.price.as_deref()).ok_or(HistoryRowRejection::MissingPrice)?;
        let price =
            parse_price(&price_text).ok_or(HistoryRowRejection::InvalidPrice(price_text))?;
        let week = non_empty(self.week.as_deref()).ok_or(HistoryRowRejection::MissingWeekOrYear)?;
        let year = non_empty(self.year.as_deref()).ok_or(HistoryRowRejection::MissingWeekOrYear)?;
        let date_updated =
            non_empty(self.date_updated.as_deref()).ok_or(HistoryRowRejection::MissingDate)?;
        let date_created =
            non_empty(self.date_created.as_deref()).unwrap_or_else(|| date_updated.clone());

        Ok(HistoryRecord {
            item_id: item_id.to_string(),
            price,
            week: pad_week(&week),
            year,
            date_created,
            date_updated,
        })
    }
}

/// A single price observation for an item. `date_updated` is the dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub item_id: ItemId,
    pub price: Decimal,
    pub week: String,
    pub year: String,
    pub date_created: String,
    pub date_updated: String,
}

impl HistoryRecord {
    /// Observation taken at `timestamp`; week and year come from the ISO calendar.
    pub fn observed(item_id: &str, price: Decimal, timestamp: &str) -> Self {
        let (week, year) = iso_week_year(timestamp);
        Self {
            item_id: item_id.to_string(),
            price,
            week,
            year,
            date_created: timestamp.to_string(),
            date_updated: timestamp.to_string(),
        }
    }
}

/// One row of the bulk current-price feed as delivered.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawCurrentPriceRow {
    pub id: Option<String>,
    pub estimated_price: Option<String>,
    pub date_updated: Option<String>,
}

/// Most recent observation for one item from the current-price feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentPrice {
    pub item_id: ItemId,
    pub estimated_price: Decimal,
    pub date_updated: String,
}

impl RawCurrentPriceRow {
    /// `None` when the row lacks an id, a parseable price or a timestamp.
    pub fn into_current_price(self) -> Option<CurrentPrice> {
        let item_id = non_empty(self.id.as_deref())?;
        let estimated_price = self.estimated_price.as_deref().and_then(parse_price)?;
        let date_updated = non_empty(self.date_updated.as_deref())?;
        Some(CurrentPrice {
            item_id,
            estimated_price,
            date_updated,
        })
    }
}

/// Parse a decimal price, accepting plain and scientific notation.
pub fn parse_price(text: &str) -> Option<Decimal> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
}

/// ISO week (zero padded) and ISO year for a timestamp.
///
/// Accepts RFC 3339 with offset, naive date-times and plain dates; anything
/// else yields `("00", "0000")`.
pub fn iso_week_year(timestamp: &str) -> (String, String) {
    match timestamp_date(timestamp) {
        Some(date) => {
            let iso = date.iso_week();
            (format!("{:02}", iso.week()), format!("{:04}", iso.year()))
        }
        None => (UNKNOWN_WEEK.to_string(), UNKNOWN_YEAR.to_string()),
    }
}

fn timestamp_date(timestamp: &str) -> Option<NaiveDate> {
    let ts = timestamp.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.date());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(dt.date());
    }
    NaiveDate::parse_from_str(ts, "%Y-%m-%d").ok()
}

fn pad_week(week: &str) -> String {
    match week.parse::<u32>() {
        Ok(n) => format!("{n:02}"),
        Err(_) => week.to_string(),
    }
}

/// Trimmed text, `None` when blank.
pub fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

fn text_or_empty(value: Option<&str>) -> String {
    non_empty(value).unwrap_or_default()
}
