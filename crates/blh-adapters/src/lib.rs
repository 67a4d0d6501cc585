//! Source adapter contract, registry, and the shipped site adapters.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use blh_core::{columns, IdentityKey, RawRow, TabularResult};
use blh_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "blh-adapters";

/// Immutable per-source run configuration handed to an adapter.
#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub listing_url: String,
    pub base_url: String,
    pub headers: BTreeMap<String, String>,
    /// This broker's prior history, projected to the identity-key columns.
    pub history: Vec<IdentityKey>,
    pub broker_name: String,
    pub phase: String,
    pub mode: String,
    pub contact_name: String,
    pub contact_number: String,
}

impl ScrapeConfig {
    pub fn seen_deal_link(&self, link: &str) -> bool {
        self.history.iter().any(|key| key.deal_link == link)
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// The one contract every per-source scraper satisfies.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn scrape(
        &self,
        http: &HttpFetcher,
        config: &ScrapeConfig,
    ) -> Result<TabularResult, AdapterError>;
}

/// Derive the stable adapter id from a human-readable source name: everything
/// up to the first `&`, lower-cased, punctuation runs collapsed to `_`.
pub fn canonical_source_id(name: &str) -> String {
    let head = name.split('&').next().unwrap_or(name);
    head.to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

#[derive(Debug, Error)]
#[error("no adapter registered for source `{source_name}` (adapter id `{adapter_id}`)")]
pub struct AdapterNotFound {
    pub source_name: String,
    pub adapter_id: String,
}

/// Explicit source-id → adapter map, built at process start and passed into
/// the execution engine.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.source_id().to_string(), adapter);
    }

    pub fn resolve(&self, source_name: &str) -> Result<Arc<dyn SourceAdapter>, AdapterNotFound> {
        let adapter_id = canonical_source_id(source_name);
        self.adapters
            .get(&adapter_id)
            .cloned()
            .ok_or_else(|| AdapterNotFound {
                source_name: source_name.to_string(),
                adapter_id,
            })
    }

    pub fn source_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Registry of every adapter shipped with this workspace.
pub fn builtin_registry() -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(bc_business_brokers_adapter()));
    registry.register(Arc::new(front_range_business_adapter()));
    registry.register(Arc::new(ontario_commercial_group_adapter()));
    registry.register(Arc::new(sigma_mergers_adapter()));
    registry
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(scope: &ElementRef<'_>, selector: &str) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(scope
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_first_attr(
    scope: &ElementRef<'_>,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(scope
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

fn select_all_texts(scope: &ElementRef<'_>, selector: &str) -> Result<Vec<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(scope
        .select(&sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect())
}

/// Pull `"Label: value"` out of card text lines; the first matching label
/// with a non-empty value wins.
fn extract_labeled_field(lines: &[String], labels: &[&str]) -> Option<String> {
    for label in labels {
        let needle = label.to_ascii_lowercase();
        for line in lines {
            if !line.to_ascii_lowercase().contains(&needle) {
                continue;
            }
            if let Some((_, value)) = line.split_once(':') {
                if let Some(value) = text_or_none(value.to_string()) {
                    return Some(value);
                }
            }
        }
    }
    None
}

fn absolute_url(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            href.trim_start_matches('/')
        )
    }
}

/// Seed a result row with the run-level fields every record carries.
fn listing_row(config: &ScrapeConfig) -> RawRow {
    let mut row = RawRow::new();
    row.insert(columns::BROKER_NAME.to_string(), config.broker_name.clone());
    row.insert(columns::EXTRACTION_PHASE.to_string(), config.phase.clone());
    row.insert(columns::CONTACT_NAME.to_string(), config.contact_name.clone());
    row.insert(
        columns::CONTACT_NUMBER.to_string(),
        config.contact_number.clone(),
    );
    row.insert(columns::MANUAL_VALIDATION.to_string(), "true".to_string());
    row
}

fn insert_opt(row: &mut RawRow, column: &str, value: Option<String>) {
    if let Some(value) = value {
        row.insert(column.to_string(), value);
    }
}

/// HTML adapter for card/portfolio listing pages: one element per listing,
/// a linked title, and `Label: value` detail lines.
#[derive(Debug, Clone, Copy)]
pub struct CardListingAdapter {
    source_id: &'static str,
    card_selector: &'static str,
    title_selector: &'static str,
    link_selector: &'static str,
    field_selector: &'static str,
    description_selector: &'static str,
    country: &'static str,
}

impl CardListingAdapter {
    pub fn parse_listing(
        &self,
        html: &str,
        config: &ScrapeConfig,
    ) -> Result<TabularResult, AdapterError> {
        let document = Html::parse_document(html);
        let card_sel = parse_selector(self.card_selector)?;
        let mut result = TabularResult::new();

        for card in document.select(&card_sel) {
            let title = select_first_text(&card, self.title_selector)?;
            let Some(href) = select_first_attr(&card, self.link_selector, "href")? else {
                debug!(source_id = self.source_id, "card without deal link, skipping");
                continue;
            };
            let link = absolute_url(&config.base_url, &href);
            if config.seen_deal_link(&link) {
                debug!(source_id = self.source_id, link, "deal link already in history");
                continue;
            }

            let lines = select_all_texts(&card, self.field_selector)?;
            let description = select_first_text(&card, self.description_selector)?;
            let status = extract_labeled_field(&lines, &["Status"]).or_else(|| {
                lines
                    .iter()
                    .any(|line| line.eq_ignore_ascii_case("sold"))
                    .then(|| "Sold".to_string())
            });

            let mut row = listing_row(config);
            row.insert(columns::DEAL_LINK.to_string(), link);
            row.insert(columns::COUNTRY.to_string(), self.country.to_string());
            insert_opt(&mut row, columns::LISTING_NAME, title);
            insert_opt(&mut row, columns::LISTING_DESCRIPTION, description);
            insert_opt(
                &mut row,
                columns::LISTING_ID,
                extract_labeled_field(&lines, &["Listing ID", "Listing Number", "File No"]),
            );
            insert_opt(
                &mut row,
                columns::PUBLISHED_DATE,
                extract_labeled_field(&lines, &["Published", "Date Listed", "Listed"]),
            );
            insert_opt(
                &mut row,
                columns::ASKING_PRICE,
                extract_labeled_field(&lines, &["Asking Price", "Price"]),
            );
            insert_opt(
                &mut row,
                columns::REVENUE,
                extract_labeled_field(&lines, &["Revenue", "Sales Revenue", "Gross Sales"]),
            );
            insert_opt(
                &mut row,
                columns::EBITDA,
                extract_labeled_field(&lines, &["Cash Flow", "EBITDA", "Net Income"]),
            );
            insert_opt(
                &mut row,
                columns::DOWN_PAYMENT,
                extract_labeled_field(&lines, &["Down Payment"]),
            );
            insert_opt(
                &mut row,
                columns::BUSINESS_TYPE,
                extract_labeled_field(&lines, &["Business Type", "Category", "Industry"]),
            );
            insert_opt(
                &mut row,
                columns::CITY,
                extract_labeled_field(&lines, &["City"]),
            );
            insert_opt(
                &mut row,
                columns::STATE_PROVINCE,
                extract_labeled_field(&lines, &["Region", "Location", "State", "Province"]),
            );
            insert_opt(&mut row, columns::STATUS, status);
            result.push(row);
        }

        info!(
            source_id = self.source_id,
            listings = result.len(),
            "extracted listings from page"
        );
        Ok(result)
    }
}

#[async_trait]
impl SourceAdapter for CardListingAdapter {
    fn source_id(&self) -> &'static str {
        self.source_id
    }

    async fn scrape(
        &self,
        http: &HttpFetcher,
        config: &ScrapeConfig,
    ) -> Result<TabularResult, AdapterError> {
        let html = http.fetch_text(self.source_id, &config.listing_url).await?;
        self.parse_listing(&html, config)
    }
}

fn json_text(value: &JsonValue, keys: &[&str]) -> Option<String> {
    for key in keys {
        match value.get(*key) {
            Some(JsonValue::String(s)) => {
                if let Some(text) = text_or_none(s.clone()) {
                    return Some(text);
                }
            }
            Some(JsonValue::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// Adapter for sources exposing their inventory as a JSON feed, either a
/// top-level array or an object with a `listings` array.
#[derive(Debug, Clone, Copy)]
pub struct JsonFeedAdapter {
    source_id: &'static str,
    country: &'static str,
}

impl JsonFeedAdapter {
    pub fn parse_listing(
        &self,
        text: &str,
        config: &ScrapeConfig,
    ) -> Result<TabularResult, AdapterError> {
        let value: JsonValue = serde_json::from_str(text)
            .map_err(|e| AdapterError::Message(format!("invalid listing feed: {e}")))?;
        let items = value
            .as_array()
            .or_else(|| value.get("listings").and_then(JsonValue::as_array))
            .ok_or_else(|| {
                AdapterError::Message("listing feed has no top-level array".to_string())
            })?;

        let mut result = TabularResult::new();
        for item in items {
            let Some(href) = json_text(item, &["url", "link", "href"]) else {
                debug!(source_id = self.source_id, "feed item without url, skipping");
                continue;
            };
            let link = absolute_url(&config.base_url, &href);
            if config.seen_deal_link(&link) {
                debug!(source_id = self.source_id, link, "deal link already in history");
                continue;
            }

            let mut row = listing_row(config);
            row.insert(columns::DEAL_LINK.to_string(), link);
            row.insert(columns::COUNTRY.to_string(), self.country.to_string());
            insert_opt(&mut row, columns::LISTING_ID, json_text(item, &["id", "listing_id"]));
            insert_opt(&mut row, columns::LISTING_NAME, json_text(item, &["title", "name"]));
            insert_opt(
                &mut row,
                columns::LISTING_DESCRIPTION,
                json_text(item, &["description", "summary"]),
            );
            insert_opt(
                &mut row,
                columns::PUBLISHED_DATE,
                json_text(item, &["published", "published_date", "listed_at"]),
            );
            insert_opt(
                &mut row,
                columns::ASKING_PRICE,
                json_text(item, &["price", "asking_price"]),
            );
            insert_opt(&mut row, columns::REVENUE, json_text(item, &["revenue", "sales"]));
            insert_opt(
                &mut row,
                columns::EBITDA,
                json_text(item, &["cash_flow", "ebitda", "net_income"]),
            );
            insert_opt(
                &mut row,
                columns::DOWN_PAYMENT,
                json_text(item, &["down_payment"]),
            );
            insert_opt(
                &mut row,
                columns::BUSINESS_TYPE,
                json_text(item, &["business_type", "category"]),
            );
            insert_opt(&mut row, columns::CITY, json_text(item, &["city"]));
            insert_opt(
                &mut row,
                columns::STATE_PROVINCE,
                json_text(item, &["state", "province", "region"]),
            );
            insert_opt(&mut row, columns::STATUS, json_text(item, &["status"]));
            result.push(row);
        }

        info!(
            source_id = self.source_id,
            listings = result.len(),
            "extracted listings from feed"
        );
        Ok(result)
    }
}

#[async_trait]
impl SourceAdapter for JsonFeedAdapter {
    fn source_id(&self) -> &'static str {
        self.source_id
    }

    async fn scrape(
        &self,
        http: &HttpFetcher,
        config: &ScrapeConfig,
    ) -> Result<TabularResult, AdapterError> {
        let text = http.fetch_text(self.source_id, &config.listing_url).await?;
        self.parse_listing(&text, config)
    }
}

pub fn bc_business_brokers_adapter() -> CardListingAdapter {
    CardListingAdapter {
        source_id: "bc_business_brokers",
        card_selector: "article.fusion-portfolio-post",
        title_selector: "h2.entry-title",
        link_selector: "h2.entry-title a",
        field_selector: "ul.listing-details li",
        description_selector: "p.entry-summary",
        country: "Canada",
    }
}

pub fn front_range_business_adapter() -> CardListingAdapter {
    CardListingAdapter {
        source_id: "front_range_business",
        card_selector: "div.listing-card",
        title_selector: "h3.listing-title",
        link_selector: "h3.listing-title a",
        field_selector: "ul.details li",
        description_selector: "p.summary",
        country: "USA",
    }
}

pub fn ontario_commercial_group_adapter() -> CardListingAdapter {
    CardListingAdapter {
        source_id: "ontario_commercial_group",
        card_selector: "article.listing",
        title_selector: "h2.entry-title",
        link_selector: "h2.entry-title a",
        field_selector: "div.meta p",
        description_selector: "p.listing-excerpt",
        country: "Canada",
    }
}

pub fn sigma_mergers_adapter() -> JsonFeedAdapter {
    JsonFeedAdapter {
        source_id: "sigma_mergers",
        country: "USA",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_ids_strip_punctuation_and_ampersand_tails() {
        assert_eq!(canonical_source_id("BC Business Brokers"), "bc_business_brokers");
        assert_eq!(
            canonical_source_id("Sigma Mergers & Acquisitions"),
            "sigma_mergers"
        );
        assert_eq!(
            canonical_source_id("  First  Street   Business Brokers "),
            "first_street_business_brokers"
        );
        assert_eq!(canonical_source_id("Phil Reese, CBI"), "phil_reese_cbi");
    }

    #[test]
    fn registry_resolves_by_human_readable_name() {
        let registry = builtin_registry();
        let adapter = registry
            .resolve("Sigma Mergers & Acquisitions")
            .expect("resolve");
        assert_eq!(adapter.source_id(), "sigma_mergers");
    }

    #[test]
    fn registry_reports_unknown_sources_with_derived_id() {
        let registry = builtin_registry();
        let err = registry.resolve("Moonshot Brokers!").err().unwrap();
        assert_eq!(err.source_name, "Moonshot Brokers!");
        assert_eq!(err.adapter_id, "moonshot_brokers");
    }

    #[test]
    fn labeled_fields_match_case_insensitively_and_trim() {
        let lines = vec![
            "Asking Price: $450,000".to_string(),
            "CASH FLOW:  $120,000 ".to_string(),
            "Status:".to_string(),
        ];
        assert_eq!(
            extract_labeled_field(&lines, &["Asking Price"]),
            Some("$450,000".to_string())
        );
        assert_eq!(
            extract_labeled_field(&lines, &["Cash Flow", "EBITDA"]),
            Some("$120,000".to_string())
        );
        // A label with an empty value is no value at all.
        assert_eq!(extract_labeled_field(&lines, &["Status"]), None);
        assert_eq!(extract_labeled_field(&lines, &["Down Payment"]), None);
    }

    #[test]
    fn relative_links_resolve_against_the_base_url() {
        assert_eq!(
            absolute_url("https://acme.example", "/deals/1/"),
            "https://acme.example/deals/1/"
        );
        assert_eq!(
            absolute_url("https://acme.example/", "deals/1"),
            "https://acme.example/deals/1"
        );
        assert_eq!(
            absolute_url("https://acme.example", "https://other.example/d/2"),
            "https://other.example/d/2"
        );
    }
}
