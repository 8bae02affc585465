//! Core domain model for PepperBot: deals, filters, notifications and the
//! user-owned shopping list tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod criteria;

pub use criteria::{criteria_matches, FilterCriteria};

pub const UNKNOWN_TITLE: &str = "Unknown Title";
pub const UNKNOWN_STORE: &str = "Unknown Store";

/// Parsed handoff contract from adapters into the upsert store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealDraft {
    pub title: String,
    pub description: Option<String>,
    pub store: String,
    pub original_price: Option<f64>,
    pub discount_price: Option<f64>,
    pub discount_percentage: Option<f64>,
    pub valid_until: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub image_url: Option<String>,
}

impl DealDraft {
    pub fn new(title: impl Into<String>, store: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            store: store.into(),
            original_price: None,
            discount_price: None,
            discount_percentage: None,
            valid_until: None,
            url: None,
            image_url: None,
        }
    }

    /// Natural key used to find an existing row: the URL when present,
    /// otherwise the exact (title, store) pair.
    pub fn identity(&self) -> DealIdentity<'_> {
        match self.url.as_deref() {
            Some(url) => DealIdentity::Url(url),
            None => DealIdentity::TitleStore {
                title: &self.title,
                store: &self.store,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealIdentity<'a> {
    Url(&'a str),
    TitleStore { title: &'a str, store: &'a str },
}

impl DealIdentity<'_> {
    pub fn matches(&self, deal: &Deal) -> bool {
        match *self {
            DealIdentity::Url(url) => deal.url.as_deref() == Some(url),
            DealIdentity::TitleStore { title, store } => deal.title == title && deal.store == store,
        }
    }
}

/// Canonical persisted deal (`discounts` table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub store: String,
    pub original_price: Option<f64>,
    pub discount_price: Option<f64>,
    pub discount_percentage: Option<f64>,
    pub valid_until: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deal {
    pub fn from_draft(id: i64, draft: DealDraft, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title: draft.title,
            description: draft.description,
            store: draft.store,
            original_price: draft.original_price,
            discount_price: draft.discount_price,
            discount_percentage: draft.discount_percentage,
            valid_until: draft.valid_until,
            url: draft.url,
            image_url: draft.image_url,
            created_at: now,
            updated_at: now,
        }
    }

    /// A deal without `valid_until` never expires.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.map_or(true, |until| until > now)
    }

    /// Overwrite only the fields the draft actually carries; anything the
    /// new scrape did not yield keeps its previously stored value.
    pub fn merge_draft(&mut self, draft: &DealDraft, now: DateTime<Utc>) {
        self.title = draft.title.clone();
        self.store = draft.store.clone();
        override_value(&mut self.description, &draft.description);
        override_value(&mut self.original_price, &draft.original_price);
        override_value(&mut self.discount_price, &draft.discount_price);
        override_value(&mut self.discount_percentage, &draft.discount_percentage);
        override_value(&mut self.valid_until, &draft.valid_until);
        override_value(&mut self.url, &draft.url);
        override_value(&mut self.image_url, &draft.image_url);
        self.updated_at = now;
    }

    pub fn apply_patch(&mut self, patch: &DealPatch, now: DateTime<Utc>) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(store) = &patch.store {
            self.store = store.clone();
        }
        override_value(&mut self.description, &patch.description);
        override_value(&mut self.original_price, &patch.original_price);
        override_value(&mut self.discount_price, &patch.discount_price);
        override_value(&mut self.discount_percentage, &patch.discount_percentage);
        override_value(&mut self.valid_until, &patch.valid_until);
        override_value(&mut self.url, &patch.url);
        override_value(&mut self.image_url, &patch.image_url);
        self.updated_at = now;
    }
}

fn override_value<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
    if let Some(value) = value {
        *slot = Some(value.clone());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DealPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub store: Option<String>,
    pub original_price: Option<f64>,
    pub discount_price: Option<f64>,
    pub discount_percentage: Option<f64>,
    pub valid_until: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DealQuery {
    pub store: Option<String>,
    pub skip: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShoppingList {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewShoppingList {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShoppingListPatch {
    pub title: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListItem {
    pub id: i64,
    pub name: String,
    pub quantity: f64,
    pub unit: Option<String>,
    pub is_completed: bool,
    pub shopping_list_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewListItem {
    pub name: String,
    #[serde(default = "default_quantity")]
    pub quantity: f64,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub is_completed: bool,
}

impl NewListItem {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            quantity: default_quantity(),
            unit: None,
            is_completed: false,
        }
    }
}

fn default_quantity() -> f64 {
    1.0
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListItemPatch {
    pub name: Option<String>,
    pub quantity: Option<f64>,
    pub unit: Option<String>,
    pub is_completed: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub id: i64,
    pub name: String,
    /// Raw JSON criteria document, see [`FilterCriteria`].
    pub criteria: String,
    pub is_active: bool,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewFilter {
    pub name: String,
    pub criteria: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterPatch {
    pub name: Option<String>,
    pub criteria: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Discount,
    Reminder,
    System,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Discount => "discount",
            NotificationKind::Reminder => "reminder",
            NotificationKind::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "discount" => Some(NotificationKind::Discount),
            "reminder" => Some(NotificationKind::Reminder),
            "system" => Some(NotificationKind::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub is_read: bool,
    pub user_id: i64,
    pub discount_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNotification {
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(default)]
    pub discount_id: Option<i64>,
}

/// Link between an external chat identity and a user account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelLink {
    pub id: i64,
    pub chat_id: String,
    pub user_id: i64,
    pub is_active: bool,
    pub linked_at: DateTime<Utc>,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to one instant, for deterministic expiry checks.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
