//! Filter criteria document and the deal matcher.
//!
//! A criteria document is a JSON object with any subset of `store`,
//! `min_discount` and `keywords`. Every key that is present must hold;
//! unknown keys are ignored.

use serde::{Deserialize, Serialize};

use crate::Deal;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_discount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
}

impl FilterCriteria {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn matches(&self, deal: &Deal) -> bool {
        if let Some(store) = &self.store {
            if !deal.store.to_lowercase().contains(&store.to_lowercase()) {
                return false;
            }
        }

        if let Some(threshold) = self.min_discount {
            match deal.discount_percentage {
                Some(pct) if pct >= threshold => {}
                _ => return false,
            }
        }

        if let Some(keywords) = &self.keywords {
            let title = deal.title.to_lowercase();
            if !keywords
                .iter()
                .any(|keyword| title.contains(&keyword.to_lowercase()))
            {
                return false;
            }
        }

        true
    }
}

/// Match a deal against a raw criteria document. Malformed documents never
/// match.
pub fn criteria_matches(deal: &Deal, raw_criteria: &str) -> bool {
    FilterCriteria::parse(raw_criteria)
        .map(|criteria| criteria.matches(deal))
        .unwrap_or(false)
}
