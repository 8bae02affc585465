//! Persistence and HTTP fetch plumbing for PepperBot.
//!
//! The store is split into one async trait per aggregate so callers can ask
//! for exactly what they touch; [`Store`] bundles them for the places that
//! need everything (the web layer, the dispatcher, the bot).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use pepper_core::{
    ChannelLink, Deal, DealDraft, DealPatch, DealQuery, Filter, FilterPatch, ListItem,
    ListItemPatch, NewFilter, NewListItem, NewNotification, NewShoppingList, NewUser,
    Notification, ShoppingList, ShoppingListPatch, UpsertSummary, User,
};

pub mod accounts;
pub mod http;
pub mod memory;
pub mod pg;

pub use accounts::{authenticate, hash_password, verify_password};
pub use http::{FetchError, HttpClientConfig, HttpFetcher, PageSource, RequestSpacing};
pub use memory::MemoryStore;
pub use pg::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Invalid(String),
    #[error("invalid stored value: {0}")]
    Corrupt(String),
    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Fails with [`StoreError::Conflict`] when the username or email is taken.
    async fn create_user(&self, user: NewUser) -> StoreResult<User>;
    async fn find_user_by_username(&self, username: &str) -> StoreResult<Option<User>>;
    async fn get_user(&self, user_id: i64) -> StoreResult<Option<User>>;
}

#[async_trait]
pub trait DealStore: Send + Sync {
    /// Insert-or-update the whole batch atomically. Either every draft is
    /// applied or none is.
    async fn upsert_deals(&self, drafts: &[DealDraft]) -> StoreResult<UpsertSummary>;
    async fn list_deals(&self, query: &DealQuery) -> StoreResult<Vec<Deal>>;
    async fn active_deals(&self, now: DateTime<Utc>) -> StoreResult<Vec<Deal>>;
    async fn get_deal(&self, deal_id: i64) -> StoreResult<Option<Deal>>;
    async fn create_deal(&self, draft: DealDraft) -> StoreResult<Deal>;
    async fn update_deal(&self, deal_id: i64, patch: &DealPatch) -> StoreResult<Option<Deal>>;
    async fn delete_deal(&self, deal_id: i64) -> StoreResult<bool>;
}

/// Shopping lists and their items. Every call is scoped to the owning user;
/// a list or item that belongs to someone else behaves as if it did not
/// exist.
#[async_trait]
pub trait ListStore: Send + Sync {
    async fn list_shopping_lists(
        &self,
        user_id: i64,
        skip: usize,
        limit: usize,
    ) -> StoreResult<Vec<ShoppingList>>;
    async fn create_shopping_list(
        &self,
        user_id: i64,
        list: NewShoppingList,
    ) -> StoreResult<ShoppingList>;
    async fn get_shopping_list(&self, user_id: i64, list_id: i64)
        -> StoreResult<Option<ShoppingList>>;
    async fn update_shopping_list(
        &self,
        user_id: i64,
        list_id: i64,
        patch: &ShoppingListPatch,
    ) -> StoreResult<Option<ShoppingList>>;
    async fn delete_shopping_list(&self, user_id: i64, list_id: i64) -> StoreResult<bool>;

    /// `None` when the list is missing or not owned by `user_id`.
    async fn list_items(&self, user_id: i64, list_id: i64) -> StoreResult<Option<Vec<ListItem>>>;
    async fn create_item(
        &self,
        user_id: i64,
        list_id: i64,
        item: NewListItem,
    ) -> StoreResult<Option<ListItem>>;
    async fn update_item(
        &self,
        user_id: i64,
        list_id: i64,
        item_id: i64,
        patch: &ListItemPatch,
    ) -> StoreResult<Option<ListItem>>;
    async fn delete_item(&self, user_id: i64, list_id: i64, item_id: i64) -> StoreResult<bool>;

    /// Mark an item done by id alone, as long as its list belongs to `user_id`.
    async fn complete_item(&self, user_id: i64, item_id: i64) -> StoreResult<Option<ListItem>>;

    /// True when any uncompleted item of the user's lists contains `needle`
    /// (case-insensitive) in its name.
    async fn has_open_item_like(&self, user_id: i64, needle: &str) -> StoreResult<bool>;
}

#[async_trait]
pub trait FilterStore: Send + Sync {
    async fn list_filters(&self, user_id: i64) -> StoreResult<Vec<Filter>>;
    async fn create_filter(&self, user_id: i64, filter: NewFilter) -> StoreResult<Filter>;
    async fn get_filter(&self, user_id: i64, filter_id: i64) -> StoreResult<Option<Filter>>;
    async fn update_filter(
        &self,
        user_id: i64,
        filter_id: i64,
        patch: &FilterPatch,
    ) -> StoreResult<Option<Filter>>;
    async fn delete_filter(&self, user_id: i64, filter_id: i64) -> StoreResult<bool>;

    /// Active filters of active users that have at least one active channel link.
    async fn dispatchable_filters(&self) -> StoreResult<Vec<Filter>>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert a notification unless one already exists for the same
    /// `(user_id, discount_id)`. Returns `None` when the pair was already
    /// recorded. Notifications without a deal are always inserted.
    async fn record_notification(
        &self,
        user_id: i64,
        notification: NewNotification,
    ) -> StoreResult<Option<Notification>>;
    async fn list_notifications(
        &self,
        user_id: i64,
        unread_only: bool,
        skip: usize,
        limit: usize,
    ) -> StoreResult<Vec<Notification>>;
    async fn get_notification(
        &self,
        user_id: i64,
        notification_id: i64,
    ) -> StoreResult<Option<Notification>>;
    async fn mark_notification_read(
        &self,
        user_id: i64,
        notification_id: i64,
    ) -> StoreResult<Option<Notification>>;
    async fn delete_notification(&self, user_id: i64, notification_id: i64) -> StoreResult<bool>;
}

#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// Bind `chat_id` to `user_id`, replacing any previous owner of the chat.
    async fn link_channel(&self, chat_id: &str, user_id: i64) -> StoreResult<ChannelLink>;
    async fn channel_link(&self, chat_id: &str) -> StoreResult<Option<ChannelLink>>;
    /// Owner of an active link for `chat_id`. A deactivated owner counts as
    /// no owner.
    async fn user_for_channel(&self, chat_id: &str) -> StoreResult<Option<User>>;
    async fn active_channel_for_user(&self, user_id: i64) -> StoreResult<Option<ChannelLink>>;
    async fn list_channel_links(&self, user_id: i64) -> StoreResult<Vec<ChannelLink>>;
    async fn unlink_channel(&self, user_id: i64, link_id: i64) -> StoreResult<bool>;
}

pub trait Store:
    UserStore + DealStore + ListStore + FilterStore + NotificationStore + ChannelStore
{
}

impl<T> Store for T where
    T: UserStore + DealStore + ListStore + FilterStore + NotificationStore + ChannelStore
{
}

/// Deals are stored with a non-blank title and store.
pub(crate) fn check_draft(draft: &DealDraft) -> StoreResult<()> {
    if draft.title.trim().is_empty() || draft.store.trim().is_empty() {
        return Err(StoreError::Invalid(
            "a discount needs a title and a store".into(),
        ));
    }
    Ok(())
}

pub(crate) const URL_TAKEN: &str = "A discount with this URL already exists";

pub(crate) fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}
