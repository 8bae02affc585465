//! Listing parser for the pepper.ru deals feed.

use chrono::{DateTime, NaiveDate, Utc};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};
use url::Url;

use pepper_core::{DealDraft, UNKNOWN_STORE, UNKNOWN_TITLE};

use crate::{compile, parse_price, select_first_attr, select_first_text, AdapterError, SourceAdapter};

pub const SOURCE_ID: &str = "pepper";
pub const DEFAULT_BASE_URL: &str = "https://pepper.ru";

const VALID_UNTIL_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug)]
struct Selectors {
    block: Selector,
    title: Selector,
    store: Selector,
    price: Selector,
    percentage: Selector,
    description: Selector,
    image: Selector,
    valid_until: Selector,
}

impl Selectors {
    fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            block: compile("div.thread-item")?,
            title: compile("a.thread-title")?,
            store: compile("span.store-name")?,
            price: compile("span.price")?,
            percentage: compile("span.discount-percentage")?,
            description: compile("div.thread-description")?,
            image: compile("img.thread-image")?,
            valid_until: compile("span.valid-until")?,
        })
    }
}

#[derive(Debug)]
pub struct PepperAdapter {
    base_url: Url,
    listing_url: String,
    selectors: Selectors,
}

impl PepperAdapter {
    pub fn new(base_url: &str) -> Result<Self, AdapterError> {
        let base_url = Url::parse(base_url)?;
        Ok(Self {
            listing_url: base_url.to_string(),
            base_url,
            selectors: Selectors::new()?,
        })
    }

    fn resolve(&self, href: &str) -> Option<String> {
        match self.base_url.join(href) {
            Ok(url) => Some(url.to_string()),
            Err(err) => {
                debug!(href, error = %err, "unresolvable link");
                None
            }
        }
    }

    /// `Ok(None)` means the block carried nothing worth keeping; `Err` means
    /// the block was malformed and is dropped with a warning.
    fn parse_block(&self, block: &ElementRef<'_>) -> Result<Option<DealDraft>, AdapterError> {
        let sel = &self.selectors;

        let title_node = block.select(&sel.title).next();
        let title = match title_node {
            Some(node) => node.text().collect::<String>().trim().to_string(),
            None => UNKNOWN_TITLE.to_string(),
        };
        let store =
            select_first_text(block, &sel.store).unwrap_or_else(|| UNKNOWN_STORE.to_string());
        if title.is_empty() || store.is_empty() {
            return Ok(None);
        }

        let (original_price, discount_price) = match select_first_text(block, &sel.price) {
            Some(text) => split_price_pair(&text),
            None => (None, None),
        };

        let discount_percentage = match select_first_text(block, &sel.percentage) {
            Some(text) => Some(parse_percentage(&text)?),
            None => None,
        };

        let url = title_node
            .and_then(|node| node.value().attr("href"))
            .and_then(|href| self.resolve(href.trim()));

        let image_url = select_first_attr(block, &sel.image, "src").and_then(|src| {
            if src.starts_with("http") {
                Some(src)
            } else {
                self.resolve(&src)
            }
        });

        let description = select_first_text(block, &sel.description).filter(|d| !d.is_empty());
        let valid_until = select_first_text(block, &sel.valid_until)
            .and_then(|text| parse_valid_until(&text));

        let mut draft = DealDraft::new(title, store);
        draft.description = description;
        draft.original_price = original_price;
        draft.discount_price = discount_price;
        draft.discount_percentage = discount_percentage;
        draft.valid_until = valid_until;
        draft.url = url;
        draft.image_url = image_url;
        Ok(Some(draft))
    }
}

impl SourceAdapter for PepperAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn listing_url(&self) -> &str {
        &self.listing_url
    }

    fn parse_listing(&self, markup: &str) -> Vec<DealDraft> {
        let document = Html::parse_document(markup);
        let mut drafts = Vec::new();
        for (index, block) in document.select(&self.selectors.block).enumerate() {
            match self.parse_block(&block) {
                Ok(Some(draft)) => drafts.push(draft),
                Ok(None) => debug!(index, "skipping deal block without title or store"),
                Err(err) => warn!(index, error = %err, "skipping malformed deal block"),
            }
        }
        drafts
    }
}

/// `"1 000 ₽ → 750 ₽"` into `(original, discounted)`. Anything other than
/// exactly two arrow-separated parts yields no prices.
fn split_price_pair(text: &str) -> (Option<f64>, Option<f64>) {
    let parts: Vec<&str> = text.split('→').collect();
    match parts.as_slice() {
        [original, discounted] => (parse_price(original), parse_price(discounted)),
        _ => (None, None),
    }
}

fn parse_percentage(text: &str) -> Result<f64, AdapterError> {
    let cleaned = text.replace(['%', '-'], "");
    let cleaned = cleaned.trim();
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| AdapterError::Message(format!("unparsable discount percentage {text:?}")))
}

fn parse_valid_until(text: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(text.trim(), VALID_UNTIL_FORMAT)
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::{Path, PathBuf};

    fn adapter() -> PepperAdapter {
        PepperAdapter::new(DEFAULT_BASE_URL).expect("adapter")
    }

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .ancestors()
            .nth(2)
            .expect("workspace root")
            .to_path_buf()
    }

    fn fixture_dir(source_id: &str) -> PathBuf {
        workspace_root().join("fixtures").join(source_id).join("sample")
    }

    fn read_snapshot(path: &Path) -> Vec<DealDraft> {
        let text = fs::read_to_string(path).expect("read snapshot");
        serde_json::from_str(&text).expect("parse snapshot")
    }

    #[test]
    fn golden_json_snapshot_test_pepper() {
        let dir = fixture_dir(SOURCE_ID);
        let markup = fs::read_to_string(dir.join("listing.html")).expect("read listing");
        let drafts = adapter().parse_listing(&markup);
        let expected = read_snapshot(&dir.join("snapshot.json"));
        assert_eq!(drafts, expected);
    }

    #[test]
    fn markup_without_blocks_parses_to_nothing() {
        assert!(adapter().parse_listing("<html><body><p>nothing</p></body></html>").is_empty());
        assert!(adapter().parse_listing("").is_empty());
    }

    #[test]
    fn missing_title_and_store_fall_back_to_defaults() {
        let drafts = adapter().parse_listing(r#"<div class="thread-item"><span class="price">10 → 5</span></div>"#);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].title, UNKNOWN_TITLE);
        assert_eq!(drafts[0].store, UNKNOWN_STORE);
        assert_eq!(drafts[0].original_price, Some(10.0));
        assert_eq!(drafts[0].discount_price, Some(5.0));
        assert_eq!(drafts[0].url, None);
    }

    #[test]
    fn one_bad_block_does_not_abort_the_batch() {
        let markup = r#"
            <div class="thread-item"><a class="thread-title" href="/a">A</a>
                <span class="discount-percentage">n/a</span></div>
            <div class="thread-item"><a class="thread-title" href="/b">B</a>
                <span class="discount-percentage">-40%</span></div>
        "#;
        let drafts = adapter().parse_listing(markup);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].title, "B");
        assert_eq!(drafts[0].discount_percentage, Some(40.0));
        assert_eq!(drafts[0].url.as_deref(), Some("https://pepper.ru/b"));
    }

    #[test]
    fn blank_store_skips_the_block() {
        let markup = r#"<div class="thread-item"><a class="thread-title">A</a><span class="store-name">  </span></div>"#;
        assert!(adapter().parse_listing(markup).is_empty());
    }

    #[test]
    fn valid_until_is_midnight_utc_or_nothing() {
        let parsed = parse_valid_until("2026-05-01").expect("date");
        assert_eq!(parsed.to_rfc3339(), "2026-05-01T00:00:00+00:00");
        assert!(parse_valid_until("01.05.2026").is_none());
    }

    #[test]
    fn price_pair_needs_exactly_two_parts() {
        assert_eq!(split_price_pair("1 000 ₽ → 750 ₽"), (Some(1000.0), Some(750.0)));
        assert_eq!(split_price_pair("750 ₽"), (None, None));
        assert_eq!(split_price_pair("1 → 2 → 3"), (None, None));
        assert_eq!(split_price_pair("free → 5"), (None, Some(5.0)));
    }
}
