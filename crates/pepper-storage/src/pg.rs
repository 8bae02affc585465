//! Postgres-backed store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Row};
use tracing::{info, warn};

use pepper_core::{
    ChannelLink, Deal, DealDraft, DealIdentity, DealPatch, DealQuery, Filter, FilterPatch,
    ListItem, ListItemPatch, NewFilter, NewListItem, NewNotification, NewShoppingList, NewUser,
    Notification, NotificationKind, ShoppingList, ShoppingListPatch, UpsertSummary, User,
};

use crate::{
    check_draft, ChannelStore, DealStore, FilterStore, ListStore, NotificationStore, StoreError,
    StoreResult, UserStore, URL_TAKEN,
};

const USER_COLUMNS: &str = "id, username, email, password_hash, is_active, created_at";
const DEAL_COLUMNS: &str = "id, title, description, store, original_price, discount_price, \
     discount_percentage, valid_until, url, image_url, created_at, updated_at";
const LIST_COLUMNS: &str = "id, title, description, user_id, created_at, updated_at";
const ITEM_COLUMNS: &str =
    "id, name, quantity, unit, is_completed, shopping_list_id, created_at, updated_at";
const FILTER_COLUMNS: &str = "id, name, criteria, is_active, user_id, created_at";
const NOTIFICATION_COLUMNS: &str =
    "id, title, message, kind, is_read, user_id, discount_id, created_at";
const LINK_COLUMNS: &str = "id, chat_id, user_id, is_active, linked_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn user_from_row(row: &PgRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn deal_from_row(row: &PgRow) -> Result<Deal, sqlx::Error> {
    Ok(Deal {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        store: row.try_get("store")?,
        original_price: row.try_get("original_price")?,
        discount_price: row.try_get("discount_price")?,
        discount_percentage: row.try_get("discount_percentage")?,
        valid_until: row.try_get("valid_until")?,
        url: row.try_get("url")?,
        image_url: row.try_get("image_url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn list_from_row(row: &PgRow) -> Result<ShoppingList, sqlx::Error> {
    Ok(ShoppingList {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        user_id: row.try_get("user_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn item_from_row(row: &PgRow) -> Result<ListItem, sqlx::Error> {
    Ok(ListItem {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        quantity: row.try_get("quantity")?,
        unit: row.try_get("unit")?,
        is_completed: row.try_get("is_completed")?,
        shopping_list_id: row.try_get("shopping_list_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn filter_from_row(row: &PgRow) -> Result<Filter, sqlx::Error> {
    Ok(Filter {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        criteria: row.try_get("criteria")?,
        is_active: row.try_get("is_active")?,
        user_id: row.try_get("user_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn notification_from_row(row: &PgRow) -> StoreResult<Notification> {
    let kind: String = row.try_get("kind")?;
    let kind = NotificationKind::parse(&kind)
        .ok_or_else(|| StoreError::Corrupt(format!("notification kind {kind:?}")))?;
    Ok(Notification {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        kind,
        is_read: row.try_get("is_read")?,
        user_id: row.try_get("user_id")?,
        discount_id: row.try_get("discount_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn link_from_row(row: &PgRow) -> Result<ChannelLink, sqlx::Error> {
    Ok(ChannelLink {
        id: row.try_get("id")?,
        chat_id: row.try_get("chat_id")?,
        user_id: row.try_get("user_id")?,
        is_active: row.try_get("is_active")?,
        linked_at: row.try_get("linked_at")?,
    })
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

async fn find_deal_id(conn: &mut PgConnection, draft: &DealDraft) -> Result<Option<i64>, sqlx::Error> {
    match draft.identity() {
        DealIdentity::Url(url) => {
            sqlx::query_scalar("SELECT id FROM discounts WHERE url = $1 ORDER BY id LIMIT 1")
                .bind(url)
                .fetch_optional(&mut *conn)
                .await
        }
        DealIdentity::TitleStore { title, store } => {
            sqlx::query_scalar(
                "SELECT id FROM discounts WHERE title = $1 AND store = $2 ORDER BY id LIMIT 1",
            )
            .bind(title)
            .bind(store)
            .fetch_optional(&mut *conn)
            .await
        }
    }
}

fn url_conflict(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(URL_TAKEN.into())
        }
        other => StoreError::Database(other),
    }
}

async fn upsert_batch(
    conn: &mut PgConnection,
    drafts: &[DealDraft],
) -> StoreResult<UpsertSummary> {
    let mut summary = UpsertSummary::default();
    for draft in drafts {
        check_draft(draft)?;
        match find_deal_id(conn, draft).await? {
            Some(id) => {
                sqlx::query(
                    "UPDATE discounts SET title = $2, store = $3, \
                     description = COALESCE($4, description), \
                     original_price = COALESCE($5, original_price), \
                     discount_price = COALESCE($6, discount_price), \
                     discount_percentage = COALESCE($7, discount_percentage), \
                     valid_until = COALESCE($8, valid_until), \
                     url = COALESCE($9, url), \
                     image_url = COALESCE($10, image_url), \
                     updated_at = NOW() \
                     WHERE id = $1",
                )
                .bind(id)
                .bind(&draft.title)
                .bind(&draft.store)
                .bind(&draft.description)
                .bind(draft.original_price)
                .bind(draft.discount_price)
                .bind(draft.discount_percentage)
                .bind(draft.valid_until)
                .bind(&draft.url)
                .bind(&draft.image_url)
                .execute(&mut *conn)
                .await?;
                summary.updated += 1;
            }
            None => {
                insert_deal(&mut *conn, draft).await?;
                summary.inserted += 1;
            }
        }
    }
    Ok(summary)
}

async fn insert_deal(conn: &mut PgConnection, draft: &DealDraft) -> Result<Deal, sqlx::Error> {
    let sql = format!(
        "INSERT INTO discounts (title, description, store, original_price, discount_price, \
         discount_percentage, valid_until, url, image_url) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING {DEAL_COLUMNS}"
    );
    let row = sqlx::query(&sql)
        .bind(&draft.title)
        .bind(&draft.description)
        .bind(&draft.store)
        .bind(draft.original_price)
        .bind(draft.discount_price)
        .bind(draft.discount_percentage)
        .bind(draft.valid_until)
        .bind(&draft.url)
        .bind(&draft.image_url)
        .fetch_one(&mut *conn)
        .await?;
    deal_from_row(&row)
}

#[async_trait]
impl UserStore for PgStore {
    async fn create_user(&self, user: NewUser) -> StoreResult<User> {
        let taken: Option<(String, String)> = sqlx::query_as(
            "SELECT username, email FROM users WHERE username = $1 OR email = $2 LIMIT 1",
        )
        .bind(&user.username)
        .bind(&user.email)
        .fetch_optional(&self.pool)
        .await?;
        if let Some((username, _)) = taken {
            let what = if username == user.username { "Username" } else { "Email" };
            return Err(StoreError::Conflict(format!("{what} already registered")));
        }

        let sql = format!(
            "INSERT INTO users (username, email, password_hash) VALUES ($1, $2, $3) \
             RETURNING {USER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&user.username)
            .bind(&user.email)
            .bind(&user.password_hash)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| match err {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    StoreError::Conflict("Username or email already registered".into())
                }
                other => StoreError::Database(other),
            })?;
        Ok(user_from_row(&row)?)
    }

    async fn find_user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1");
        let row = sqlx::query(&sql)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(user_from_row).transpose()?)
    }

    async fn get_user(&self, user_id: i64) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(user_from_row).transpose()?)
    }
}

#[async_trait]
impl DealStore for PgStore {
    async fn upsert_deals(&self, drafts: &[DealDraft]) -> StoreResult<UpsertSummary> {
        let mut tx = self.pool.begin().await?;
        match upsert_batch(&mut *tx, drafts).await {
            Ok(summary) => {
                tx.commit().await?;
                Ok(summary)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rolling back deal batch failed");
                }
                Err(err)
            }
        }
    }

    async fn list_deals(&self, query: &DealQuery) -> StoreResult<Vec<Deal>> {
        let sql = format!(
            "SELECT {DEAL_COLUMNS} FROM discounts \
             WHERE ($1::TEXT IS NULL OR POSITION(LOWER($1) IN LOWER(store)) > 0) \
             ORDER BY id OFFSET $2 LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(&query.store)
            .bind(to_i64(query.skip))
            .bind(to_i64(query.limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(deal_from_row).collect::<Result<_, _>>()?)
    }

    async fn active_deals(&self, now: DateTime<Utc>) -> StoreResult<Vec<Deal>> {
        let sql = format!(
            "SELECT {DEAL_COLUMNS} FROM discounts \
             WHERE valid_until IS NULL OR valid_until > $1 ORDER BY id"
        );
        let rows = sqlx::query(&sql).bind(now).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(deal_from_row).collect::<Result<_, _>>()?)
    }

    async fn get_deal(&self, deal_id: i64) -> StoreResult<Option<Deal>> {
        let sql = format!("SELECT {DEAL_COLUMNS} FROM discounts WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(deal_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(deal_from_row).transpose()?)
    }

    async fn create_deal(&self, draft: DealDraft) -> StoreResult<Deal> {
        check_draft(&draft)?;
        let mut conn = self.pool.acquire().await?;
        insert_deal(&mut *conn, &draft).await.map_err(url_conflict)
    }

    async fn update_deal(&self, deal_id: i64, patch: &DealPatch) -> StoreResult<Option<Deal>> {
        let sql = format!(
            "UPDATE discounts SET title = COALESCE($2, title), \
             description = COALESCE($3, description), \
             store = COALESCE($4, store), \
             original_price = COALESCE($5, original_price), \
             discount_price = COALESCE($6, discount_price), \
             discount_percentage = COALESCE($7, discount_percentage), \
             valid_until = COALESCE($8, valid_until), \
             url = COALESCE($9, url), \
             image_url = COALESCE($10, image_url), \
             updated_at = NOW() \
             WHERE id = $1 RETURNING {DEAL_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(deal_id)
            .bind(&patch.title)
            .bind(&patch.description)
            .bind(&patch.store)
            .bind(patch.original_price)
            .bind(patch.discount_price)
            .bind(patch.discount_percentage)
            .bind(patch.valid_until)
            .bind(&patch.url)
            .bind(&patch.image_url)
            .fetch_optional(&self.pool)
            .await
            .map_err(url_conflict)?;
        Ok(row.as_ref().map(deal_from_row).transpose()?)
    }

    async fn delete_deal(&self, deal_id: i64) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM discounts WHERE id = $1")
            .bind(deal_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ListStore for PgStore {
    async fn list_shopping_lists(
        &self,
        user_id: i64,
        skip: usize,
        limit: usize,
    ) -> StoreResult<Vec<ShoppingList>> {
        let sql = format!(
            "SELECT {LIST_COLUMNS} FROM shopping_lists WHERE user_id = $1 \
             ORDER BY id OFFSET $2 LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(to_i64(skip))
            .bind(to_i64(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(list_from_row).collect::<Result<_, _>>()?)
    }

    async fn create_shopping_list(
        &self,
        user_id: i64,
        list: NewShoppingList,
    ) -> StoreResult<ShoppingList> {
        let sql = format!(
            "INSERT INTO shopping_lists (title, description, user_id) VALUES ($1, $2, $3) \
             RETURNING {LIST_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&list.title)
            .bind(&list.description)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(list_from_row(&row)?)
    }

    async fn get_shopping_list(
        &self,
        user_id: i64,
        list_id: i64,
    ) -> StoreResult<Option<ShoppingList>> {
        let sql = format!("SELECT {LIST_COLUMNS} FROM shopping_lists WHERE id = $1 AND user_id = $2");
        let row = sqlx::query(&sql)
            .bind(list_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(list_from_row).transpose()?)
    }

    async fn update_shopping_list(
        &self,
        user_id: i64,
        list_id: i64,
        patch: &ShoppingListPatch,
    ) -> StoreResult<Option<ShoppingList>> {
        let sql = format!(
            "UPDATE shopping_lists SET title = COALESCE($3, title), \
             description = COALESCE($4, description), updated_at = NOW() \
             WHERE id = $1 AND user_id = $2 RETURNING {LIST_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(list_id)
            .bind(user_id)
            .bind(&patch.title)
            .bind(&patch.description)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(list_from_row).transpose()?)
    }

    async fn delete_shopping_list(&self, user_id: i64, list_id: i64) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM shopping_lists WHERE id = $1 AND user_id = $2")
            .bind(list_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_items(&self, user_id: i64, list_id: i64) -> StoreResult<Option<Vec<ListItem>>> {
        if self.get_shopping_list(user_id, list_id).await?.is_none() {
            return Ok(None);
        }
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM list_items WHERE shopping_list_id = $1 ORDER BY id"
        );
        let rows = sqlx::query(&sql).bind(list_id).fetch_all(&self.pool).await?;
        Ok(Some(rows.iter().map(item_from_row).collect::<Result<_, _>>()?))
    }

    async fn create_item(
        &self,
        user_id: i64,
        list_id: i64,
        item: NewListItem,
    ) -> StoreResult<Option<ListItem>> {
        if self.get_shopping_list(user_id, list_id).await?.is_none() {
            return Ok(None);
        }
        let sql = format!(
            "INSERT INTO list_items (name, quantity, unit, is_completed, shopping_list_id) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {ITEM_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&item.name)
            .bind(item.quantity)
            .bind(&item.unit)
            .bind(item.is_completed)
            .bind(list_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(Some(item_from_row(&row)?))
    }

    async fn update_item(
        &self,
        user_id: i64,
        list_id: i64,
        item_id: i64,
        patch: &ListItemPatch,
    ) -> StoreResult<Option<ListItem>> {
        let sql = format!(
            "UPDATE list_items SET name = COALESCE($4, name), \
             quantity = COALESCE($5, quantity), \
             unit = COALESCE($6, unit), \
             is_completed = COALESCE($7, is_completed), \
             updated_at = NOW() \
             WHERE id = $1 AND shopping_list_id = $2 \
             AND EXISTS (SELECT 1 FROM shopping_lists s WHERE s.id = $2 AND s.user_id = $3) \
             RETURNING {ITEM_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(item_id)
            .bind(list_id)
            .bind(user_id)
            .bind(&patch.name)
            .bind(patch.quantity)
            .bind(&patch.unit)
            .bind(patch.is_completed)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(item_from_row).transpose()?)
    }

    async fn delete_item(&self, user_id: i64, list_id: i64, item_id: i64) -> StoreResult<bool> {
        let result = sqlx::query(
            "DELETE FROM list_items WHERE id = $1 AND shopping_list_id = $2 \
             AND EXISTS (SELECT 1 FROM shopping_lists s WHERE s.id = $2 AND s.user_id = $3)",
        )
        .bind(item_id)
        .bind(list_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete_item(&self, user_id: i64, item_id: i64) -> StoreResult<Option<ListItem>> {
        let sql = format!(
            "UPDATE list_items li SET is_completed = TRUE, updated_at = NOW() \
             FROM shopping_lists s \
             WHERE li.id = $1 AND s.id = li.shopping_list_id AND s.user_id = $2 \
             RETURNING {}",
            ITEM_COLUMNS
                .split(", ")
                .map(|column| format!("li.{column}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let row = sqlx::query(&sql)
            .bind(item_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(item_from_row).transpose()?)
    }

    async fn has_open_item_like(&self, user_id: i64, needle: &str) -> StoreResult<bool> {
        let found: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM list_items li \
             JOIN shopping_lists s ON s.id = li.shopping_list_id \
             WHERE s.user_id = $1 AND NOT li.is_completed \
             AND POSITION(LOWER($2) IN LOWER(li.name)) > 0)",
        )
        .bind(user_id)
        .bind(needle)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }
}

#[async_trait]
impl FilterStore for PgStore {
    async fn list_filters(&self, user_id: i64) -> StoreResult<Vec<Filter>> {
        let sql = format!("SELECT {FILTER_COLUMNS} FROM filters WHERE user_id = $1 ORDER BY id");
        let rows = sqlx::query(&sql).bind(user_id).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(filter_from_row).collect::<Result<_, _>>()?)
    }

    async fn create_filter(&self, user_id: i64, filter: NewFilter) -> StoreResult<Filter> {
        let sql = format!(
            "INSERT INTO filters (name, criteria, is_active, user_id) VALUES ($1, $2, $3, $4) \
             RETURNING {FILTER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&filter.name)
            .bind(&filter.criteria)
            .bind(filter.is_active)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(filter_from_row(&row)?)
    }

    async fn get_filter(&self, user_id: i64, filter_id: i64) -> StoreResult<Option<Filter>> {
        let sql = format!("SELECT {FILTER_COLUMNS} FROM filters WHERE id = $1 AND user_id = $2");
        let row = sqlx::query(&sql)
            .bind(filter_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(filter_from_row).transpose()?)
    }

    async fn update_filter(
        &self,
        user_id: i64,
        filter_id: i64,
        patch: &FilterPatch,
    ) -> StoreResult<Option<Filter>> {
        let sql = format!(
            "UPDATE filters SET name = COALESCE($3, name), criteria = COALESCE($4, criteria), \
             is_active = COALESCE($5, is_active) \
             WHERE id = $1 AND user_id = $2 RETURNING {FILTER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(filter_id)
            .bind(user_id)
            .bind(&patch.name)
            .bind(&patch.criteria)
            .bind(patch.is_active)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(filter_from_row).transpose()?)
    }

    async fn delete_filter(&self, user_id: i64, filter_id: i64) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM filters WHERE id = $1 AND user_id = $2")
            .bind(filter_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn dispatchable_filters(&self) -> StoreResult<Vec<Filter>> {
        let rows = sqlx::query(
            "SELECT f.id, f.name, f.criteria, f.is_active, f.user_id, f.created_at \
             FROM filters f JOIN users u ON u.id = f.user_id \
             WHERE f.is_active AND u.is_active \
             AND EXISTS (SELECT 1 FROM channel_links c WHERE c.user_id = f.user_id AND c.is_active) \
             ORDER BY f.id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(filter_from_row).collect::<Result<_, _>>()?)
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn record_notification(
        &self,
        user_id: i64,
        notification: NewNotification,
    ) -> StoreResult<Option<Notification>> {
        let sql = format!(
            "INSERT INTO notifications (title, message, kind, user_id, discount_id) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (user_id, discount_id) DO NOTHING \
             RETURNING {NOTIFICATION_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&notification.title)
            .bind(&notification.message)
            .bind(notification.kind.as_str())
            .bind(user_id)
            .bind(notification.discount_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(notification_from_row).transpose()
    }

    async fn list_notifications(
        &self,
        user_id: i64,
        unread_only: bool,
        skip: usize,
        limit: usize,
    ) -> StoreResult<Vec<Notification>> {
        let sql = format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
             WHERE user_id = $1 AND (NOT $2 OR NOT is_read) \
             ORDER BY created_at DESC, id DESC OFFSET $3 LIMIT $4"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(unread_only)
            .bind(to_i64(skip))
            .bind(to_i64(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(notification_from_row).collect()
    }

    async fn get_notification(
        &self,
        user_id: i64,
        notification_id: i64,
    ) -> StoreResult<Option<Notification>> {
        let sql = format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = $1 AND user_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(notification_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(notification_from_row).transpose()
    }

    async fn mark_notification_read(
        &self,
        user_id: i64,
        notification_id: i64,
    ) -> StoreResult<Option<Notification>> {
        let sql = format!(
            "UPDATE notifications SET is_read = TRUE WHERE id = $1 AND user_id = $2 \
             RETURNING {NOTIFICATION_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(notification_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(notification_from_row).transpose()
    }

    async fn delete_notification(&self, user_id: i64, notification_id: i64) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM notifications WHERE id = $1 AND user_id = $2")
            .bind(notification_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ChannelStore for PgStore {
    async fn link_channel(&self, chat_id: &str, user_id: i64) -> StoreResult<ChannelLink> {
        let previous: Option<i64> =
            sqlx::query_scalar("SELECT user_id FROM channel_links WHERE chat_id = $1")
                .bind(chat_id)
                .fetch_optional(&self.pool)
                .await?;
        if let Some(previous) = previous.filter(|owner| *owner != user_id) {
            info!(chat_id, from = previous, to = user_id, "reassigning chat link");
        }

        let sql = format!(
            "INSERT INTO channel_links (chat_id, user_id, is_active, linked_at) \
             VALUES ($1, $2, TRUE, NOW()) \
             ON CONFLICT (chat_id) DO UPDATE \
             SET user_id = EXCLUDED.user_id, is_active = TRUE, linked_at = NOW() \
             RETURNING {LINK_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(chat_id)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(link_from_row(&row)?)
    }

    async fn channel_link(&self, chat_id: &str) -> StoreResult<Option<ChannelLink>> {
        let sql = format!("SELECT {LINK_COLUMNS} FROM channel_links WHERE chat_id = $1");
        let row = sqlx::query(&sql)
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(link_from_row).transpose()?)
    }

    async fn user_for_channel(&self, chat_id: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query(
            "SELECT u.id, u.username, u.email, u.password_hash, u.is_active, u.created_at \
             FROM users u JOIN channel_links c ON c.user_id = u.id \
             WHERE c.chat_id = $1 AND c.is_active AND u.is_active",
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(user_from_row).transpose()?)
    }

    async fn active_channel_for_user(&self, user_id: i64) -> StoreResult<Option<ChannelLink>> {
        let sql = format!(
            "SELECT {LINK_COLUMNS} FROM channel_links WHERE user_id = $1 AND is_active \
             ORDER BY linked_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(link_from_row).transpose()?)
    }

    async fn list_channel_links(&self, user_id: i64) -> StoreResult<Vec<ChannelLink>> {
        let sql = format!("SELECT {LINK_COLUMNS} FROM channel_links WHERE user_id = $1 ORDER BY id");
        let rows = sqlx::query(&sql).bind(user_id).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(link_from_row).collect::<Result<_, _>>()?)
    }

    async fn unlink_channel(&self, user_id: i64, link_id: i64) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM channel_links WHERE id = $1 AND user_id = $2")
            .bind(link_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn user(store: &PgStore, name: &str) -> User {
        store
            .create_user(NewUser {
                username: name.into(),
                email: format!("{name}@example.com"),
                password_hash: "x".into(),
            })
            .await
            .expect("create user")
    }

    fn draft(title: &str, url: Option<&str>, price: Option<f64>) -> DealDraft {
        let mut d = DealDraft::new(title, "Amazon");
        d.url = url.map(str::to_string);
        d.discount_price = price;
        d
    }

    async fn all_deals(store: &PgStore) -> Vec<Deal> {
        store
            .list_deals(&DealQuery { store: None, skip: 0, limit: 100 })
            .await
            .expect("list deals")
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore = "needs a Postgres DATABASE_URL"]
    async fn upsert_matches_by_url_then_title_store(pool: PgPool) {
        let store = PgStore::from_pool(pool);
        let first = store
            .upsert_deals(&[
                draft("Laptop X", Some("https://pepper.ru/d/1"), Some(800.0)),
                draft("Mouse", None, Some(10.0)),
            ])
            .await
            .unwrap();
        assert_eq!(first, UpsertSummary { inserted: 2, updated: 0 });

        let second = store
            .upsert_deals(&[
                draft("Laptop X (renamed)", Some("https://pepper.ru/d/1"), None),
                draft("Mouse", None, Some(9.0)),
            ])
            .await
            .unwrap();
        assert_eq!(second, UpsertSummary { inserted: 0, updated: 2 });

        let deals = all_deals(&store).await;
        assert_eq!(deals.len(), 2);
        let laptop = deals.iter().find(|d| d.url.is_some()).expect("laptop");
        assert_eq!(laptop.title, "Laptop X (renamed)");
        assert_eq!(laptop.discount_price, Some(800.0));
        let mouse = deals.iter().find(|d| d.title == "Mouse").expect("mouse");
        assert_eq!(mouse.discount_price, Some(9.0));
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore = "needs a Postgres DATABASE_URL"]
    async fn bad_draft_rolls_back_the_whole_batch(pool: PgPool) {
        let store = PgStore::from_pool(pool);
        let err = store
            .upsert_deals(&[
                draft("Laptop X", Some("https://pepper.ru/d/1"), Some(800.0)),
                draft("Mouse", None, Some(10.0)),
                DealDraft::new("", "Amazon"),
            ])
            .await
            .expect_err("blank title");
        assert!(matches!(err, StoreError::Invalid(_)));
        assert!(all_deals(&store).await.is_empty());

        // Same batch shape, but failing inside Postgres on a NUL byte.
        let err = store
            .upsert_deals(&[draft("Mouse", None, Some(10.0)), draft("Bad\0title", None, None)])
            .await
            .expect_err("nul byte");
        assert!(matches!(err, StoreError::Database(_)));
        assert!(all_deals(&store).await.is_empty());
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore = "needs a Postgres DATABASE_URL"]
    async fn duplicate_url_conflicts(pool: PgPool) {
        let store = PgStore::from_pool(pool);
        let first = store
            .create_deal(draft("TV", Some("https://pepper.ru/d/tv"), None))
            .await
            .unwrap();
        let again = store
            .create_deal(draft("TV again", Some("https://pepper.ru/d/tv"), None))
            .await;
        assert!(matches!(again, Err(StoreError::Conflict(_))));

        let other = store.create_deal(draft("Radio", None, None)).await.unwrap();
        let patch = DealPatch {
            url: Some("https://pepper.ru/d/tv".into()),
            ..Default::default()
        };
        assert!(matches!(
            store.update_deal(other.id, &patch).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(store.update_deal(first.id, &patch).await.unwrap().is_some());
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore = "needs a Postgres DATABASE_URL"]
    async fn notification_pair_is_recorded_once(pool: PgPool) {
        let store = PgStore::from_pool(pool);
        let alice = user(&store, "alice").await;
        let deal = store.create_deal(draft("TV", None, None)).await.unwrap();
        let note = || NewNotification {
            title: "Discount Match: TV".into(),
            message: "Found a discount".into(),
            kind: NotificationKind::Discount,
            discount_id: Some(deal.id),
        };

        assert!(store.record_notification(alice.id, note()).await.unwrap().is_some());
        assert!(store.record_notification(alice.id, note()).await.unwrap().is_none());
        assert_eq!(
            store.list_notifications(alice.id, true, 0, 100).await.unwrap().len(),
            1
        );
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore = "needs a Postgres DATABASE_URL"]
    async fn chat_link_moves_between_users(pool: PgPool) {
        let store = PgStore::from_pool(pool.clone());
        let alice = user(&store, "alice").await;
        let bob = user(&store, "bob").await;
        for owner in [&alice, &bob] {
            store
                .create_filter(
                    owner.id,
                    NewFilter { name: "all".into(), criteria: "{}".into(), is_active: true },
                )
                .await
                .unwrap();
        }

        let first = store.link_channel("100", alice.id).await.unwrap();
        let relinked = store.link_channel("100", bob.id).await.unwrap();
        assert_eq!(relinked.id, first.id);
        assert_eq!(relinked.user_id, bob.id);
        assert!(store.list_channel_links(alice.id).await.unwrap().is_empty());
        let filters = store.dispatchable_filters().await.unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].user_id, bob.id);

        assert_eq!(store.user_for_channel("100").await.unwrap().map(|u| u.id), Some(bob.id));
        sqlx::query("UPDATE users SET is_active = FALSE WHERE id = $1")
            .bind(bob.id)
            .execute(&pool)
            .await
            .unwrap();
        assert!(store.user_for_channel("100").await.unwrap().is_none());
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore = "needs a Postgres DATABASE_URL"]
    async fn list_writes_are_scoped_to_the_owner(pool: PgPool) {
        let store = PgStore::from_pool(pool);
        let alice = user(&store, "alice").await;
        let mallory = user(&store, "mallory").await;
        let list = store
            .create_shopping_list(alice.id, NewShoppingList { title: "Food".into(), description: None })
            .await
            .unwrap();
        let item = store
            .create_item(alice.id, list.id, NewListItem::named("Milk"))
            .await
            .unwrap()
            .expect("item");

        let rename = ShoppingListPatch { title: Some("Mine now".into()), description: None };
        assert!(store
            .update_shopping_list(mallory.id, list.id, &rename)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .create_item(mallory.id, list.id, NewListItem::named("Gum"))
            .await
            .unwrap()
            .is_none());
        assert!(store.complete_item(mallory.id, item.id).await.unwrap().is_none());
        assert!(!store.delete_shopping_list(mallory.id, list.id).await.unwrap());

        assert!(store.has_open_item_like(alice.id, "mil").await.unwrap());
        assert!(!store.has_open_item_like(mallory.id, "mil").await.unwrap());
        let kept = store.get_shopping_list(alice.id, list.id).await.unwrap().expect("list");
        assert_eq!(kept.title, "Food");
    }
}
