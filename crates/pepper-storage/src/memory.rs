//! In-process store used when no database is configured, and by tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::info;

use pepper_core::{
    ChannelLink, Clock, Deal, DealDraft, DealPatch, DealQuery, Filter, FilterPatch, ListItem,
    ListItemPatch, NewFilter, NewListItem, NewNotification, NewShoppingList, NewUser,
    Notification, ShoppingList, ShoppingListPatch, SystemClock, UpsertSummary, User,
};

use crate::{
    check_draft, contains_ignore_case, ChannelStore, DealStore, FilterStore, ListStore,
    NotificationStore, StoreError, StoreResult, UserStore, URL_TAKEN,
};

#[derive(Debug, Default, Clone)]
struct State {
    next_id: i64,
    users: Vec<User>,
    deals: Vec<Deal>,
    lists: Vec<ShoppingList>,
    items: Vec<ListItem>,
    filters: Vec<Filter>,
    notifications: Vec<Notification>,
    links: Vec<ChannelLink>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn owns_list(&self, user_id: i64, list_id: i64) -> bool {
        self.lists
            .iter()
            .any(|list| list.id == list_id && list.user_id == user_id)
    }

    fn url_taken(&self, url: &str, except: Option<i64>) -> bool {
        self.deals
            .iter()
            .any(|deal| deal.url.as_deref() == Some(url) && Some(deal.id) != except)
    }

    fn apply_drafts(
        &mut self,
        drafts: &[DealDraft],
        now: DateTime<Utc>,
    ) -> StoreResult<UpsertSummary> {
        let mut summary = UpsertSummary::default();
        for draft in drafts {
            check_draft(draft)?;
            let identity = draft.identity();
            match self.deals.iter_mut().find(|deal| identity.matches(deal)) {
                Some(existing) => {
                    existing.merge_draft(draft, now);
                    summary.updated += 1;
                }
                None => {
                    let id = self.next_id();
                    self.deals.push(Deal::from_draft(id, draft.clone(), now));
                    summary.inserted += 1;
                }
            }
        }
        Ok(summary)
    }
}

pub struct MemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }
}

fn page<T: Clone>(rows: impl Iterator<Item = T>, skip: usize, limit: usize) -> Vec<T> {
    rows.skip(skip).take(limit).collect()
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create_user(&self, user: NewUser) -> StoreResult<User> {
        let mut state = self.state.lock().await;
        if state.users.iter().any(|u| u.username == user.username) {
            return Err(StoreError::Conflict("Username already registered".into()));
        }
        if state.users.iter().any(|u| u.email == user.email) {
            return Err(StoreError::Conflict("Email already registered".into()));
        }
        let created = User {
            id: state.next_id(),
            username: user.username,
            email: user.email,
            password_hash: user.password_hash,
            is_active: true,
            created_at: self.clock.now(),
        };
        state.users.push(created.clone());
        Ok(created)
    }

    async fn find_user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let state = self.state.lock().await;
        Ok(state.users.iter().find(|u| u.username == username).cloned())
    }

    async fn get_user(&self, user_id: i64) -> StoreResult<Option<User>> {
        let state = self.state.lock().await;
        Ok(state.users.iter().find(|u| u.id == user_id).cloned())
    }
}

#[async_trait]
impl DealStore for MemoryStore {
    async fn upsert_deals(&self, drafts: &[DealDraft]) -> StoreResult<UpsertSummary> {
        let mut state = self.state.lock().await;
        let mut staged = state.clone();
        let summary = staged.apply_drafts(drafts, self.clock.now())?;
        *state = staged;
        Ok(summary)
    }

    async fn list_deals(&self, query: &DealQuery) -> StoreResult<Vec<Deal>> {
        let state = self.state.lock().await;
        let rows = state.deals.iter().filter(|deal| match &query.store {
            Some(store) => contains_ignore_case(&deal.store, store),
            None => true,
        });
        Ok(page(rows.cloned(), query.skip, query.limit))
    }

    async fn active_deals(&self, now: DateTime<Utc>) -> StoreResult<Vec<Deal>> {
        let state = self.state.lock().await;
        Ok(state
            .deals
            .iter()
            .filter(|deal| deal.is_active_at(now))
            .cloned()
            .collect())
    }

    async fn get_deal(&self, deal_id: i64) -> StoreResult<Option<Deal>> {
        let state = self.state.lock().await;
        Ok(state.deals.iter().find(|d| d.id == deal_id).cloned())
    }

    async fn create_deal(&self, draft: DealDraft) -> StoreResult<Deal> {
        check_draft(&draft)?;
        let mut state = self.state.lock().await;
        if let Some(url) = &draft.url {
            if state.url_taken(url, None) {
                return Err(StoreError::Conflict(URL_TAKEN.into()));
            }
        }
        let deal = Deal::from_draft(state.next_id(), draft, self.clock.now());
        state.deals.push(deal.clone());
        Ok(deal)
    }

    async fn update_deal(&self, deal_id: i64, patch: &DealPatch) -> StoreResult<Option<Deal>> {
        let mut state = self.state.lock().await;
        if let Some(url) = &patch.url {
            if state.url_taken(url, Some(deal_id)) {
                return Err(StoreError::Conflict(URL_TAKEN.into()));
            }
        }
        let now = self.clock.now();
        Ok(state.deals.iter_mut().find(|d| d.id == deal_id).map(|deal| {
            deal.apply_patch(patch, now);
            deal.clone()
        }))
    }

    async fn delete_deal(&self, deal_id: i64) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let before = state.deals.len();
        state.deals.retain(|d| d.id != deal_id);
        let removed = state.deals.len() != before;
        if removed {
            state
                .notifications
                .retain(|n| n.discount_id != Some(deal_id));
        }
        Ok(removed)
    }
}

#[async_trait]
impl ListStore for MemoryStore {
    async fn list_shopping_lists(
        &self,
        user_id: i64,
        skip: usize,
        limit: usize,
    ) -> StoreResult<Vec<ShoppingList>> {
        let state = self.state.lock().await;
        let rows = state.lists.iter().filter(|l| l.user_id == user_id).cloned();
        Ok(page(rows, skip, limit))
    }

    async fn create_shopping_list(
        &self,
        user_id: i64,
        list: NewShoppingList,
    ) -> StoreResult<ShoppingList> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let created = ShoppingList {
            id: state.next_id(),
            title: list.title,
            description: list.description,
            user_id,
            created_at: now,
            updated_at: now,
        };
        state.lists.push(created.clone());
        Ok(created)
    }

    async fn get_shopping_list(
        &self,
        user_id: i64,
        list_id: i64,
    ) -> StoreResult<Option<ShoppingList>> {
        let state = self.state.lock().await;
        Ok(state
            .lists
            .iter()
            .find(|l| l.id == list_id && l.user_id == user_id)
            .cloned())
    }

    async fn update_shopping_list(
        &self,
        user_id: i64,
        list_id: i64,
        patch: &ShoppingListPatch,
    ) -> StoreResult<Option<ShoppingList>> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let Some(list) = state
            .lists
            .iter_mut()
            .find(|l| l.id == list_id && l.user_id == user_id)
        else {
            return Ok(None);
        };
        if let Some(title) = &patch.title {
            list.title = title.clone();
        }
        if let Some(description) = &patch.description {
            list.description = Some(description.clone());
        }
        list.updated_at = now;
        Ok(Some(list.clone()))
    }

    async fn delete_shopping_list(&self, user_id: i64, list_id: i64) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if !state.owns_list(user_id, list_id) {
            return Ok(false);
        }
        state.lists.retain(|l| l.id != list_id);
        state.items.retain(|i| i.shopping_list_id != list_id);
        Ok(true)
    }

    async fn list_items(&self, user_id: i64, list_id: i64) -> StoreResult<Option<Vec<ListItem>>> {
        let state = self.state.lock().await;
        if !state.owns_list(user_id, list_id) {
            return Ok(None);
        }
        Ok(Some(
            state
                .items
                .iter()
                .filter(|i| i.shopping_list_id == list_id)
                .cloned()
                .collect(),
        ))
    }

    async fn create_item(
        &self,
        user_id: i64,
        list_id: i64,
        item: NewListItem,
    ) -> StoreResult<Option<ListItem>> {
        let mut state = self.state.lock().await;
        if !state.owns_list(user_id, list_id) {
            return Ok(None);
        }
        let now = self.clock.now();
        let created = ListItem {
            id: state.next_id(),
            name: item.name,
            quantity: item.quantity,
            unit: item.unit,
            is_completed: item.is_completed,
            shopping_list_id: list_id,
            created_at: now,
            updated_at: now,
        };
        state.items.push(created.clone());
        Ok(Some(created))
    }

    async fn update_item(
        &self,
        user_id: i64,
        list_id: i64,
        item_id: i64,
        patch: &ListItemPatch,
    ) -> StoreResult<Option<ListItem>> {
        let mut state = self.state.lock().await;
        if !state.owns_list(user_id, list_id) {
            return Ok(None);
        }
        let now = self.clock.now();
        let Some(item) = state
            .items
            .iter_mut()
            .find(|i| i.id == item_id && i.shopping_list_id == list_id)
        else {
            return Ok(None);
        };
        if let Some(name) = &patch.name {
            item.name = name.clone();
        }
        if let Some(quantity) = patch.quantity {
            item.quantity = quantity;
        }
        if let Some(unit) = &patch.unit {
            item.unit = Some(unit.clone());
        }
        if let Some(done) = patch.is_completed {
            item.is_completed = done;
        }
        item.updated_at = now;
        Ok(Some(item.clone()))
    }

    async fn delete_item(&self, user_id: i64, list_id: i64, item_id: i64) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if !state.owns_list(user_id, list_id) {
            return Ok(false);
        }
        let before = state.items.len();
        state
            .items
            .retain(|i| !(i.id == item_id && i.shopping_list_id == list_id));
        Ok(state.items.len() != before)
    }

    async fn complete_item(&self, user_id: i64, item_id: i64) -> StoreResult<Option<ListItem>> {
        let mut state = self.state.lock().await;
        let Some(list_id) = state
            .items
            .iter()
            .find(|i| i.id == item_id)
            .map(|i| i.shopping_list_id)
        else {
            return Ok(None);
        };
        if !state.owns_list(user_id, list_id) {
            return Ok(None);
        }
        let now = self.clock.now();
        Ok(state.items.iter_mut().find(|i| i.id == item_id).map(|item| {
            item.is_completed = true;
            item.updated_at = now;
            item.clone()
        }))
    }

    async fn has_open_item_like(&self, user_id: i64, needle: &str) -> StoreResult<bool> {
        let state = self.state.lock().await;
        Ok(state.items.iter().any(|item| {
            !item.is_completed
                && state.owns_list(user_id, item.shopping_list_id)
                && contains_ignore_case(&item.name, needle)
        }))
    }
}

#[async_trait]
impl FilterStore for MemoryStore {
    async fn list_filters(&self, user_id: i64) -> StoreResult<Vec<Filter>> {
        let state = self.state.lock().await;
        Ok(state
            .filters
            .iter()
            .filter(|f| f.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn create_filter(&self, user_id: i64, filter: NewFilter) -> StoreResult<Filter> {
        let mut state = self.state.lock().await;
        let created = Filter {
            id: state.next_id(),
            name: filter.name,
            criteria: filter.criteria,
            is_active: filter.is_active,
            user_id,
            created_at: self.clock.now(),
        };
        state.filters.push(created.clone());
        Ok(created)
    }

    async fn get_filter(&self, user_id: i64, filter_id: i64) -> StoreResult<Option<Filter>> {
        let state = self.state.lock().await;
        Ok(state
            .filters
            .iter()
            .find(|f| f.id == filter_id && f.user_id == user_id)
            .cloned())
    }

    async fn update_filter(
        &self,
        user_id: i64,
        filter_id: i64,
        patch: &FilterPatch,
    ) -> StoreResult<Option<Filter>> {
        let mut state = self.state.lock().await;
        Ok(state
            .filters
            .iter_mut()
            .find(|f| f.id == filter_id && f.user_id == user_id)
            .map(|filter| {
                if let Some(name) = &patch.name {
                    filter.name = name.clone();
                }
                if let Some(criteria) = &patch.criteria {
                    filter.criteria = criteria.clone();
                }
                if let Some(active) = patch.is_active {
                    filter.is_active = active;
                }
                filter.clone()
            }))
    }

    async fn delete_filter(&self, user_id: i64, filter_id: i64) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let before = state.filters.len();
        state
            .filters
            .retain(|f| !(f.id == filter_id && f.user_id == user_id));
        Ok(state.filters.len() != before)
    }

    async fn dispatchable_filters(&self) -> StoreResult<Vec<Filter>> {
        let state = self.state.lock().await;
        Ok(state
            .filters
            .iter()
            .filter(|f| f.is_active)
            .filter(|f| {
                state
                    .users
                    .iter()
                    .any(|u| u.id == f.user_id && u.is_active)
            })
            .filter(|f| {
                state
                    .links
                    .iter()
                    .any(|l| l.user_id == f.user_id && l.is_active)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn record_notification(
        &self,
        user_id: i64,
        notification: NewNotification,
    ) -> StoreResult<Option<Notification>> {
        let mut state = self.state.lock().await;
        if let Some(discount_id) = notification.discount_id {
            if state
                .notifications
                .iter()
                .any(|n| n.user_id == user_id && n.discount_id == Some(discount_id))
            {
                return Ok(None);
            }
        }
        let created = Notification {
            id: state.next_id(),
            title: notification.title,
            message: notification.message,
            kind: notification.kind,
            is_read: false,
            user_id,
            discount_id: notification.discount_id,
            created_at: self.clock.now(),
        };
        state.notifications.push(created.clone());
        Ok(Some(created))
    }

    async fn list_notifications(
        &self,
        user_id: i64,
        unread_only: bool,
        skip: usize,
        limit: usize,
    ) -> StoreResult<Vec<Notification>> {
        let state = self.state.lock().await;
        let mut rows: Vec<Notification> = state
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id && (!unread_only || !n.is_read))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(page(rows.into_iter(), skip, limit))
    }

    async fn get_notification(
        &self,
        user_id: i64,
        notification_id: i64,
    ) -> StoreResult<Option<Notification>> {
        let state = self.state.lock().await;
        Ok(state
            .notifications
            .iter()
            .find(|n| n.id == notification_id && n.user_id == user_id)
            .cloned())
    }

    async fn mark_notification_read(
        &self,
        user_id: i64,
        notification_id: i64,
    ) -> StoreResult<Option<Notification>> {
        let mut state = self.state.lock().await;
        Ok(state
            .notifications
            .iter_mut()
            .find(|n| n.id == notification_id && n.user_id == user_id)
            .map(|n| {
                n.is_read = true;
                n.clone()
            }))
    }

    async fn delete_notification(&self, user_id: i64, notification_id: i64) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let before = state.notifications.len();
        state
            .notifications
            .retain(|n| !(n.id == notification_id && n.user_id == user_id));
        Ok(state.notifications.len() != before)
    }
}

#[async_trait]
impl ChannelStore for MemoryStore {
    async fn link_channel(&self, chat_id: &str, user_id: i64) -> StoreResult<ChannelLink> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        if let Some(link) = state.links.iter_mut().find(|l| l.chat_id == chat_id) {
            if link.user_id != user_id {
                info!(chat_id, from = link.user_id, to = user_id, "reassigning chat link");
            }
            link.user_id = user_id;
            link.is_active = true;
            link.linked_at = now;
            return Ok(link.clone());
        }
        let link = ChannelLink {
            id: state.next_id(),
            chat_id: chat_id.to_string(),
            user_id,
            is_active: true,
            linked_at: now,
        };
        state.links.push(link.clone());
        Ok(link)
    }

    async fn channel_link(&self, chat_id: &str) -> StoreResult<Option<ChannelLink>> {
        let state = self.state.lock().await;
        Ok(state.links.iter().find(|l| l.chat_id == chat_id).cloned())
    }

    async fn user_for_channel(&self, chat_id: &str) -> StoreResult<Option<User>> {
        let state = self.state.lock().await;
        let Some(link) = state
            .links
            .iter()
            .find(|l| l.chat_id == chat_id && l.is_active)
        else {
            return Ok(None);
        };
        Ok(state
            .users
            .iter()
            .find(|u| u.id == link.user_id && u.is_active)
            .cloned())
    }

    async fn active_channel_for_user(&self, user_id: i64) -> StoreResult<Option<ChannelLink>> {
        let state = self.state.lock().await;
        Ok(state
            .links
            .iter()
            .filter(|l| l.user_id == user_id && l.is_active)
            .max_by_key(|l| l.linked_at)
            .cloned())
    }

    async fn list_channel_links(&self, user_id: i64) -> StoreResult<Vec<ChannelLink>> {
        let state = self.state.lock().await;
        Ok(state
            .links
            .iter()
            .filter(|l| l.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn unlink_channel(&self, user_id: i64, link_id: i64) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let before = state.links.len();
        state
            .links
            .retain(|l| !(l.id == link_id && l.user_id == user_id));
        Ok(state.links.len() != before)
    }
}
