//! Core domain model for broker listing aggregation.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const CRATE_NAME: &str = "blh-core";

/// Sentinel for data a source did not provide. Stored literally so the
/// artifacts never distinguish "absent column" from "absent value".
pub const NOT_AVAILABLE: &str = "N/A";

/// Canonical column names shared by the normalizer, the adapters, and the
/// persisted artifacts.
pub mod columns {
    pub const BROKER_NAME: &str = "Broker Name";
    pub const EXTRACTION_PHASE: &str = "Extraction Phase";
    pub const DEAL_LINK: &str = "Link to Deal";
    pub const LISTING_ID: &str = "Listing ID";
    pub const PUBLISHED_DATE: &str = "Published Date";
    pub const LISTING_NAME: &str = "Opportunity/Listing Name";
    pub const LISTING_DESCRIPTION: &str = "Opportunity/Listing Description";
    pub const CITY: &str = "City";
    pub const STATE_PROVINCE: &str = "State/Province";
    pub const COUNTRY: &str = "Country";
    pub const BUSINESS_TYPE: &str = "Business Type";
    pub const ASKING_PRICE: &str = "Asking Price";
    pub const REVENUE: &str = "Revenue/Sales";
    pub const DOWN_PAYMENT: &str = "Down Payment";
    pub const EBITDA: &str = "EBITDA/Cash Flow/Net Income";
    pub const STATUS: &str = "Status";
    pub const CONTACT_NAME: &str = "Contact Name";
    pub const CONTACT_NUMBER: &str = "Contact Number";
    pub const MANUAL_VALIDATION: &str = "Manual Validation";

    pub const ALL: [&str; 19] = [
        BROKER_NAME,
        EXTRACTION_PHASE,
        DEAL_LINK,
        LISTING_ID,
        PUBLISHED_DATE,
        LISTING_NAME,
        LISTING_DESCRIPTION,
        CITY,
        STATE_PROVINCE,
        COUNTRY,
        BUSINESS_TYPE,
        ASKING_PRICE,
        REVENUE,
        DOWN_PAYMENT,
        EBITDA,
        STATUS,
        CONTACT_NAME,
        CONTACT_NUMBER,
        MANUAL_VALIDATION,
    ];
}

/// Whether a listing is still on the market.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListingStatus {
    #[default]
    Available,
    Sold,
}

impl ListingStatus {
    /// Sources label sold listings inconsistently ("SOLD", "Sold!",
    /// "Status: sold"); anything mentioning "sold" counts.
    pub fn from_label(label: &str) -> Self {
        if label.to_ascii_lowercase().contains("sold") {
            Self::Sold
        } else {
            Self::Available
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::Sold => "Sold",
        }
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized listing. Field order matches the artifact column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    #[serde(rename = "Broker Name")]
    pub broker_name: String,
    #[serde(rename = "Extraction Phase")]
    pub extraction_phase: String,
    #[serde(rename = "Link to Deal")]
    pub deal_link: String,
    #[serde(rename = "Listing ID")]
    pub listing_id: String,
    #[serde(rename = "Published Date")]
    pub published_date: String,
    #[serde(rename = "Opportunity/Listing Name")]
    pub listing_name: String,
    #[serde(rename = "Opportunity/Listing Description")]
    pub listing_description: String,
    #[serde(rename = "City")]
    pub city: String,
    #[serde(rename = "State/Province")]
    pub state_province: String,
    #[serde(rename = "Country")]
    pub country: String,
    #[serde(rename = "Business Type")]
    pub business_type: String,
    #[serde(rename = "Asking Price")]
    pub asking_price: String,
    #[serde(rename = "Revenue/Sales")]
    pub revenue: String,
    #[serde(rename = "Down Payment")]
    pub down_payment: String,
    #[serde(rename = "EBITDA/Cash Flow/Net Income")]
    pub ebitda: String,
    #[serde(rename = "Status")]
    pub status: ListingStatus,
    #[serde(rename = "Contact Name")]
    pub contact_name: String,
    #[serde(rename = "Contact Number")]
    pub contact_number: String,
    #[serde(rename = "Manual Validation")]
    pub manual_validation: bool,
}

impl ListingRecord {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey {
            deal_link: self.deal_link.clone(),
            broker_name: self.broker_name.clone(),
            listing_id: self.listing_id.clone(),
            published_date: self.published_date.clone(),
        }
    }
}

/// Composite key identifying one listing across runs. The historical slice
/// handed to adapters carries these four columns and nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    #[serde(rename = "Link to Deal")]
    pub deal_link: String,
    #[serde(rename = "Broker Name")]
    pub broker_name: String,
    #[serde(rename = "Listing ID")]
    pub listing_id: String,
    #[serde(rename = "Published Date")]
    pub published_date: String,
}

/// Loosely-shaped adapter output: ordered rows of column-name → value.
pub type RawRow = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabularResult {
    pub rows: Vec<RawRow>,
}

impl TabularResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<RawRow>) -> Self {
        Self { rows }
    }

    pub fn push(&mut self, row: RawRow) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn text_field(row: &RawRow, column: &str) -> String {
    row.get(column)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| NOT_AVAILABLE.to_string())
}

fn flag_field(row: &RawRow, column: &str) -> bool {
    match row.get(column).map(|value| value.trim()) {
        Some(value) if !value.is_empty() => {
            matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
        }
        // Unflagged rows have not been reviewed yet.
        _ => true,
    }
}

fn normalize_row(row: &RawRow) -> ListingRecord {
    ListingRecord {
        broker_name: text_field(row, columns::BROKER_NAME),
        extraction_phase: text_field(row, columns::EXTRACTION_PHASE),
        deal_link: text_field(row, columns::DEAL_LINK),
        listing_id: text_field(row, columns::LISTING_ID),
        published_date: text_field(row, columns::PUBLISHED_DATE),
        listing_name: text_field(row, columns::LISTING_NAME),
        listing_description: text_field(row, columns::LISTING_DESCRIPTION),
        city: text_field(row, columns::CITY),
        state_province: text_field(row, columns::STATE_PROVINCE),
        country: text_field(row, columns::COUNTRY),
        business_type: text_field(row, columns::BUSINESS_TYPE),
        asking_price: text_field(row, columns::ASKING_PRICE),
        revenue: text_field(row, columns::REVENUE),
        down_payment: text_field(row, columns::DOWN_PAYMENT),
        ebitda: text_field(row, columns::EBITDA),
        status: ListingStatus::from_label(row.get(columns::STATUS).map(String::as_str).unwrap_or("")),
        contact_name: text_field(row, columns::CONTACT_NAME),
        contact_number: text_field(row, columns::CONTACT_NUMBER),
        manual_validation: flag_field(row, columns::MANUAL_VALIDATION),
    }
}

/// Close every row over the canonical column set: blanks become the sentinel,
/// unknown keys are dropped.
pub fn normalize_rows(result: &TabularResult) -> Vec<ListingRecord> {
    result.rows.iter().map(normalize_row).collect()
}

/// Collapse duplicates by identity key, keeping the last occurrence. Surviving
/// rows keep the relative order of their last occurrence.
pub fn dedupe_last_wins(records: Vec<ListingRecord>) -> Vec<ListingRecord> {
    let mut seen: HashSet<IdentityKey> = HashSet::with_capacity(records.len());
    let mut kept = Vec::with_capacity(records.len());
    for record in records.into_iter().rev() {
        if seen.insert(record.identity_key()) {
            kept.push(record);
        }
    }
    kept.reverse();
    kept
}

/// Phase label stamped into records produced by one run, e.g. `Aug-25`.
pub fn phase_token(now: DateTime<Utc>) -> String {
    now.format("%b-%y").to_string()
}

/// Period label naming the run snapshot artifact, e.g. `2025-08`.
pub fn period_token(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

/// Per-source outcome written back to the control list after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Skipped,
    AdapterNotFound,
    Exception,
    NoNewListings,
    Success,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::AdapterNotFound => "adapter_not_found",
            Self::Exception => "exception",
            Self::NoNewListings => "no_new_listings",
            Self::Success => "success",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One control-list row. Field order matches the operator file's columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEntry {
    #[serde(rename = "Site Name")]
    pub site_name: String,
    #[serde(rename = "Listing URL")]
    pub listing_url: String,
    #[serde(rename = "Base URL")]
    pub base_url: String,
    #[serde(rename = "Contact Name")]
    pub contact_name: String,
    #[serde(rename = "Contact Number")]
    pub contact_number: String,
    #[serde(rename = "mode", default)]
    pub mode: Option<String>,
    #[serde(
        rename = "to_scrape",
        serialize_with = "serialize_opt_in",
        deserialize_with = "deserialize_opt_in"
    )]
    pub opted_in: bool,
    #[serde(rename = "Status", default)]
    pub status: Option<RunStatus>,
    #[serde(rename = "Count", default)]
    pub count: Option<u64>,
}

// The operator file spells the flag TRUE/FALSE; accept common variants.
fn serialize_opt_in<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(if *value { "TRUE" } else { "FALSE" })
}

fn deserialize_opt_in<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let raw = String::deserialize(deserializer)?;
    Ok(matches!(
        raw.trim().to_ascii_uppercase().as_str(),
        "TRUE" | "YES" | "1"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw_row(pairs: &[(&str, &str)]) -> RawRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn normalizer_closes_schema_over_partial_rows() {
        let result = TabularResult::from_rows(vec![raw_row(&[
            (columns::BROKER_NAME, "Acme Brokers"),
            (columns::DEAL_LINK, "https://acme.example/deals/1"),
            (columns::ASKING_PRICE, " $450,000 "),
            ("Favorite Color", "teal"),
        ])]);

        let records = normalize_rows(&result);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.broker_name, "Acme Brokers");
        assert_eq!(record.asking_price, "$450,000");
        assert_eq!(record.listing_id, NOT_AVAILABLE);
        assert_eq!(record.city, NOT_AVAILABLE);
        assert_eq!(record.status, ListingStatus::Available);
        assert!(record.manual_validation);
    }

    #[test]
    fn normalizer_treats_blank_values_as_missing() {
        let result = TabularResult::from_rows(vec![raw_row(&[
            (columns::LISTING_NAME, "   "),
            (columns::COUNTRY, ""),
        ])]);

        let record = &normalize_rows(&result)[0];
        assert_eq!(record.listing_name, NOT_AVAILABLE);
        assert_eq!(record.country, NOT_AVAILABLE);
    }

    #[test]
    fn status_parsing_keys_on_sold_substring() {
        assert_eq!(ListingStatus::from_label("SOLD"), ListingStatus::Sold);
        assert_eq!(ListingStatus::from_label("Recently sold!"), ListingStatus::Sold);
        assert_eq!(ListingStatus::from_label("Under Offer"), ListingStatus::Available);
        assert_eq!(ListingStatus::from_label(""), ListingStatus::Available);
    }

    #[test]
    fn manual_validation_flag_parses_falsey_values() {
        let result = TabularResult::from_rows(vec![
            raw_row(&[(columns::MANUAL_VALIDATION, "false")]),
            raw_row(&[(columns::MANUAL_VALIDATION, "no")]),
            raw_row(&[(columns::MANUAL_VALIDATION, "TRUE")]),
        ]);
        let records = normalize_rows(&result);
        assert!(!records[0].manual_validation);
        assert!(!records[1].manual_validation);
        assert!(records[2].manual_validation);
    }

    fn mk_record(broker: &str, link: &str, name: &str) -> ListingRecord {
        let result = TabularResult::from_rows(vec![raw_row(&[
            (columns::BROKER_NAME, broker),
            (columns::DEAL_LINK, link),
            (columns::LISTING_ID, "L-1"),
            (columns::PUBLISHED_DATE, "2025-06-01"),
            (columns::LISTING_NAME, name),
        ])]);
        normalize_rows(&result).remove(0)
    }

    #[test]
    fn dedupe_keeps_last_occurrence_and_its_order() {
        let records = vec![
            mk_record("Acme", "https://acme.example/deals/1", "old title"),
            mk_record("Acme", "https://acme.example/deals/2", "other"),
            mk_record("Acme", "https://acme.example/deals/1", "new title"),
        ];

        let deduped = dedupe_last_wins(records);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].deal_link, "https://acme.example/deals/2");
        assert_eq!(deduped[1].deal_link, "https://acme.example/deals/1");
        assert_eq!(deduped[1].listing_name, "new title");
    }

    #[test]
    fn dedupe_distinguishes_brokers_sharing_a_link() {
        let records = vec![
            mk_record("Acme", "https://shared.example/deal", "acme copy"),
            mk_record("Beta", "https://shared.example/deal", "beta copy"),
        ];
        assert_eq!(dedupe_last_wins(records).len(), 2);
    }

    #[test]
    fn tokens_derive_from_run_timestamp() {
        let now = Utc.with_ymd_and_hms(2025, 8, 7, 9, 30, 0).single().unwrap();
        assert_eq!(phase_token(now), "Aug-25");
        assert_eq!(period_token(now), "2025-08");
    }

    #[test]
    fn identity_key_uses_the_four_columns() {
        let a = mk_record("Acme", "https://acme.example/deals/1", "one");
        let mut b = a.clone();
        b.asking_price = "$1".to_string();
        assert_eq!(a.identity_key(), b.identity_key());

        let mut c = a.clone();
        c.listing_id = "L-2".to_string();
        assert_ne!(a.identity_key(), c.identity_key());
    }
}
