//! Resource handlers. Every user-owned resource is looked up through the
//! caller's id, so someone else's row answers 404.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use pepper_core::{
    ChannelLink, Deal, DealDraft, DealPatch, DealQuery, Filter, FilterCriteria, FilterPatch,
    ListItem, ListItemPatch, NewFilter, NewListItem, NewNotification, NewShoppingList,
    Notification, ShoppingList, ShoppingListPatch,
};
use pepper_storage::{ChannelStore, DealStore, FilterStore, ListStore, NotificationStore};

use crate::auth::CurrentUser;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

type AppStateRef = State<Arc<AppState>>;

const LIST_NOT_FOUND: &str = "Shopping list not found";
const ITEM_NOT_FOUND: &str = "List item not found";
const FILTER_NOT_FOUND: &str = "Filter not found";
const DISCOUNT_NOT_FOUND: &str = "Discount not found";
const NOTIFICATION_NOT_FOUND: &str = "Notification not found";

fn default_limit() -> usize {
    100
}

#[derive(Debug, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

#[derive(Debug, Deserialize)]
pub struct DiscountParams {
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub store: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NotificationParams {
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub unread_only: bool,
}

fn message(text: &str) -> Json<JsonValue> {
    Json(json!({ "message": text }))
}

fn require_text(value: &str, field: &str) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(ApiError::Unprocessable(format!("{field} must not be empty")));
    }
    Ok(())
}

fn check_criteria(raw: &str) -> ApiResult<()> {
    FilterCriteria::parse(raw)
        .map(|_| ())
        .map_err(|err| ApiError::Unprocessable(format!("Invalid filter criteria: {err}")))
}

pub async fn health() -> Json<JsonValue> {
    Json(json!({ "status": "healthy", "timestamp": Utc::now() }))
}

// Shopping lists

pub async fn list_lists(
    State(state): AppStateRef,
    CurrentUser(user): CurrentUser,
    Query(page): Query<Page>,
) -> ApiResult<Json<Vec<ShoppingList>>> {
    let lists = state
        .store
        .list_shopping_lists(user.id, page.skip, page.limit)
        .await?;
    Ok(Json(lists))
}

pub async fn create_list(
    State(state): AppStateRef,
    CurrentUser(user): CurrentUser,
    Json(body): Json<NewShoppingList>,
) -> ApiResult<Json<ShoppingList>> {
    require_text(&body.title, "title")?;
    Ok(Json(state.store.create_shopping_list(user.id, body).await?))
}

pub async fn get_list(
    State(state): AppStateRef,
    CurrentUser(user): CurrentUser,
    Path(list_id): Path<i64>,
) -> ApiResult<Json<ShoppingList>> {
    state
        .store
        .get_shopping_list(user.id, list_id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(LIST_NOT_FOUND))
}

pub async fn update_list(
    State(state): AppStateRef,
    CurrentUser(user): CurrentUser,
    Path(list_id): Path<i64>,
    Json(patch): Json<ShoppingListPatch>,
) -> ApiResult<Json<ShoppingList>> {
    if let Some(title) = &patch.title {
        require_text(title, "title")?;
    }
    state
        .store
        .update_shopping_list(user.id, list_id, &patch)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(LIST_NOT_FOUND))
}

pub async fn delete_list(
    State(state): AppStateRef,
    CurrentUser(user): CurrentUser,
    Path(list_id): Path<i64>,
) -> ApiResult<Json<JsonValue>> {
    if !state.store.delete_shopping_list(user.id, list_id).await? {
        return Err(ApiError::NotFound(LIST_NOT_FOUND));
    }
    Ok(message("Shopping list deleted successfully"))
}

// List items

pub async fn list_items(
    State(state): AppStateRef,
    CurrentUser(user): CurrentUser,
    Path(list_id): Path<i64>,
) -> ApiResult<Json<Vec<ListItem>>> {
    state
        .store
        .list_items(user.id, list_id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(LIST_NOT_FOUND))
}

pub async fn create_item(
    State(state): AppStateRef,
    CurrentUser(user): CurrentUser,
    Path(list_id): Path<i64>,
    Json(body): Json<NewListItem>,
) -> ApiResult<Json<ListItem>> {
    require_text(&body.name, "name")?;
    state
        .store
        .create_item(user.id, list_id, body)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(LIST_NOT_FOUND))
}

async fn ensure_list(state: &AppState, user_id: i64, list_id: i64) -> ApiResult<()> {
    match state.store.get_shopping_list(user_id, list_id).await? {
        Some(_) => Ok(()),
        None => Err(ApiError::NotFound(LIST_NOT_FOUND)),
    }
}

pub async fn update_item(
    State(state): AppStateRef,
    CurrentUser(user): CurrentUser,
    Path((list_id, item_id)): Path<(i64, i64)>,
    Json(patch): Json<ListItemPatch>,
) -> ApiResult<Json<ListItem>> {
    ensure_list(&state, user.id, list_id).await?;
    state
        .store
        .update_item(user.id, list_id, item_id, &patch)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(ITEM_NOT_FOUND))
}

pub async fn delete_item(
    State(state): AppStateRef,
    CurrentUser(user): CurrentUser,
    Path((list_id, item_id)): Path<(i64, i64)>,
) -> ApiResult<Json<JsonValue>> {
    ensure_list(&state, user.id, list_id).await?;
    if !state.store.delete_item(user.id, list_id, item_id).await? {
        return Err(ApiError::NotFound(ITEM_NOT_FOUND));
    }
    Ok(message("List item deleted successfully"))
}

// Filters

pub async fn list_filters(
    State(state): AppStateRef,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<Vec<Filter>>> {
    Ok(Json(state.store.list_filters(user.id).await?))
}

pub async fn create_filter(
    State(state): AppStateRef,
    CurrentUser(user): CurrentUser,
    Json(body): Json<NewFilter>,
) -> ApiResult<Json<Filter>> {
    require_text(&body.name, "name")?;
    check_criteria(&body.criteria)?;
    Ok(Json(state.store.create_filter(user.id, body).await?))
}

pub async fn get_filter(
    State(state): AppStateRef,
    CurrentUser(user): CurrentUser,
    Path(filter_id): Path<i64>,
) -> ApiResult<Json<Filter>> {
    state
        .store
        .get_filter(user.id, filter_id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(FILTER_NOT_FOUND))
}

pub async fn update_filter(
    State(state): AppStateRef,
    CurrentUser(user): CurrentUser,
    Path(filter_id): Path<i64>,
    Json(patch): Json<FilterPatch>,
) -> ApiResult<Json<Filter>> {
    if let Some(criteria) = &patch.criteria {
        check_criteria(criteria)?;
    }
    state
        .store
        .update_filter(user.id, filter_id, &patch)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(FILTER_NOT_FOUND))
}

pub async fn delete_filter(
    State(state): AppStateRef,
    CurrentUser(user): CurrentUser,
    Path(filter_id): Path<i64>,
) -> ApiResult<Json<JsonValue>> {
    if !state.store.delete_filter(user.id, filter_id).await? {
        return Err(ApiError::NotFound(FILTER_NOT_FOUND));
    }
    Ok(message("Filter deleted successfully"))
}

// Discounts

pub async fn list_discounts(
    State(state): AppStateRef,
    Query(params): Query<DiscountParams>,
) -> ApiResult<Json<Vec<Deal>>> {
    let query = DealQuery {
        store: params.store.filter(|s| !s.trim().is_empty()),
        skip: params.skip,
        limit: params.limit,
    };
    Ok(Json(state.store.list_deals(&query).await?))
}

pub async fn get_discount(
    State(state): AppStateRef,
    Path(deal_id): Path<i64>,
) -> ApiResult<Json<Deal>> {
    state
        .store
        .get_deal(deal_id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(DISCOUNT_NOT_FOUND))
}

pub async fn create_discount(
    State(state): AppStateRef,
    CurrentUser(_user): CurrentUser,
    Json(draft): Json<DealDraft>,
) -> ApiResult<Json<Deal>> {
    require_text(&draft.title, "title")?;
    require_text(&draft.store, "store")?;
    Ok(Json(state.store.create_deal(draft).await?))
}

pub async fn update_discount(
    State(state): AppStateRef,
    CurrentUser(_user): CurrentUser,
    Path(deal_id): Path<i64>,
    Json(patch): Json<DealPatch>,
) -> ApiResult<Json<Deal>> {
    state
        .store
        .update_deal(deal_id, &patch)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(DISCOUNT_NOT_FOUND))
}

pub async fn delete_discount(
    State(state): AppStateRef,
    CurrentUser(_user): CurrentUser,
    Path(deal_id): Path<i64>,
) -> ApiResult<Json<JsonValue>> {
    if !state.store.delete_deal(deal_id).await? {
        return Err(ApiError::NotFound(DISCOUNT_NOT_FOUND));
    }
    Ok(message("Discount deleted successfully"))
}

// Notifications

pub async fn list_notifications(
    State(state): AppStateRef,
    CurrentUser(user): CurrentUser,
    Query(params): Query<NotificationParams>,
) -> ApiResult<Json<Vec<Notification>>> {
    let rows = state
        .store
        .list_notifications(user.id, params.unread_only, params.skip, params.limit)
        .await?;
    Ok(Json(rows))
}

pub async fn create_notification(
    State(state): AppStateRef,
    CurrentUser(user): CurrentUser,
    Json(body): Json<NewNotification>,
) -> ApiResult<Json<Notification>> {
    require_text(&body.title, "title")?;
    if let Some(deal_id) = body.discount_id {
        if state.store.get_deal(deal_id).await?.is_none() {
            return Err(ApiError::NotFound(DISCOUNT_NOT_FOUND));
        }
    }
    state
        .store
        .record_notification(user.id, body)
        .await?
        .map(Json)
        .ok_or_else(|| {
            ApiError::Conflict("A notification for this discount already exists".into())
        })
}

pub async fn get_notification(
    State(state): AppStateRef,
    CurrentUser(user): CurrentUser,
    Path(notification_id): Path<i64>,
) -> ApiResult<Json<Notification>> {
    state
        .store
        .get_notification(user.id, notification_id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(NOTIFICATION_NOT_FOUND))
}

pub async fn mark_notification_read(
    State(state): AppStateRef,
    CurrentUser(user): CurrentUser,
    Path(notification_id): Path<i64>,
) -> ApiResult<Json<JsonValue>> {
    state
        .store
        .mark_notification_read(user.id, notification_id)
        .await?
        .ok_or(ApiError::NotFound(NOTIFICATION_NOT_FOUND))?;
    Ok(message("Notification marked as read"))
}

pub async fn delete_notification(
    State(state): AppStateRef,
    CurrentUser(user): CurrentUser,
    Path(notification_id): Path<i64>,
) -> ApiResult<Json<JsonValue>> {
    if !state
        .store
        .delete_notification(user.id, notification_id)
        .await?
    {
        return Err(ApiError::NotFound(NOTIFICATION_NOT_FOUND));
    }
    Ok(message("Notification deleted successfully"))
}

// Chat links

pub async fn list_links(
    State(state): AppStateRef,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<Vec<ChannelLink>>> {
    Ok(Json(state.store.list_channel_links(user.id).await?))
}

pub async fn unlink(
    State(state): AppStateRef,
    CurrentUser(user): CurrentUser,
    Path(link_id): Path<i64>,
) -> ApiResult<Json<JsonValue>> {
    if !state.store.unlink_channel(user.id, link_id).await? {
        return Err(ApiError::NotFound("Telegram link not found"));
    }
    Ok(message("Telegram user unlinked successfully"))
}
