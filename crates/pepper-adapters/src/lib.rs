//! Source adapter contract and the deals-site listing parser.

use scraper::{ElementRef, Selector};
use thiserror::Error;

use pepper_core::DealDraft;

pub mod pepper;

pub use pepper::PepperAdapter;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("invalid base url: {0}")]
    BaseUrl(#[from] url::ParseError),
}

/// A deals source: where its listing lives and how to turn that listing's
/// markup into drafts. Parsing is pure; fetching belongs to the caller.
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn listing_url(&self) -> &str;
    fn parse_listing(&self, markup: &str) -> Vec<DealDraft>;
}

/// Strip currency markers, whitespace and thousand separators, then read the
/// rest as a number.
pub fn parse_price(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .replace('₽', "")
        .replace("руб", "")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite() && *value >= 0.0)
}

pub(crate) fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))
}

pub(crate) fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Trimmed text of the first match; `Some("")` when the element exists but
/// is blank, `None` when it is missing.
pub(crate) fn select_first_text(block: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    block
        .select(selector)
        .next()
        .map(|node| node.text().collect::<String>().trim().to_string())
}

pub(crate) fn select_first_attr(
    block: &ElementRef<'_>,
    selector: &Selector,
    attr: &str,
) -> Option<String> {
    block
        .select(selector)
        .next()
        .and_then(|node| node.value().attr(attr))
        .and_then(|value| text_or_none(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_parsing_strips_currency_and_spacing() {
        assert_eq!(parse_price("1000 ₽"), Some(1000.0));
        assert_eq!(parse_price("500руб"), Some(500.0));
        assert_eq!(parse_price("1 500"), Some(1500.0));
        assert_eq!(parse_price("1\u{a0}500 ₽"), Some(1500.0));
        assert_eq!(parse_price("12,990"), Some(12990.0));
        assert_eq!(parse_price("99.90"), Some(99.9));
        assert_eq!(parse_price("invalid"), None);
        assert_eq!(parse_price(""), None);
        assert_eq!(parse_price(" ₽ "), None);
        assert_eq!(parse_price("inf"), None);
    }
}
