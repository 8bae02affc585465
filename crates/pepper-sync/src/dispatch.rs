//! Match active deals against users' filters and push alerts out.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use pepper_core::{Clock, Deal, Filter, FilterCriteria, NewNotification, NotificationKind, ShoppingList};
use pepper_storage::{ChannelStore, DealStore, FilterStore, ListStore, NotificationStore, Store};

/// Outbound alert channel. Errors are reported back to the dispatcher, which
/// logs them and moves on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_deal_alert(&self, chat_id: &str, deal: &Deal) -> Result<()>;

    async fn offer_add_to_list(
        &self,
        chat_id: &str,
        deal: &Deal,
        lists: &[ShoppingList],
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub deals: usize,
    pub filters: usize,
    pub matches: usize,
    pub created: usize,
    pub send_failures: usize,
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            clock,
            notifier,
        }
    }

    /// One pass over every (active deal, dispatchable filter) pair. The
    /// notification row is written before anything is sent, so a failed send
    /// is never retried.
    pub async fn run_pass(&self) -> Result<DispatchSummary> {
        let now = self.clock.now();
        let deals = self
            .store
            .active_deals(now)
            .await
            .context("loading active deals")?;
        let filters = self
            .store
            .dispatchable_filters()
            .await
            .context("loading dispatchable filters")?;

        let compiled: Vec<(Filter, FilterCriteria)> = filters
            .into_iter()
            .filter_map(|filter| match FilterCriteria::parse(&filter.criteria) {
                Ok(criteria) => Some((filter, criteria)),
                Err(err) => {
                    warn!(filter_id = filter.id, error = %err, "ignoring filter with malformed criteria");
                    None
                }
            })
            .collect();

        let mut summary = DispatchSummary {
            deals: deals.len(),
            filters: compiled.len(),
            ..Default::default()
        };

        for deal in &deals {
            for (filter, criteria) in &compiled {
                if !criteria.matches(deal) {
                    continue;
                }
                summary.matches += 1;

                let recorded = self
                    .store
                    .record_notification(
                        filter.user_id,
                        NewNotification {
                            title: format!("Discount Match: {}", deal.title),
                            message: format!(
                                "Found a discount matching your '{}' filter",
                                filter.name
                            ),
                            kind: NotificationKind::Discount,
                            discount_id: Some(deal.id),
                        },
                    )
                    .await
                    .context("recording notification")?;
                if recorded.is_none() {
                    continue;
                }
                summary.created += 1;

                let Some(link) = self
                    .store
                    .active_channel_for_user(filter.user_id)
                    .await
                    .context("loading chat link")?
                else {
                    continue;
                };

                if let Err(err) = self.notifier.send_deal_alert(&link.chat_id, deal).await {
                    summary.send_failures += 1;
                    warn!(chat_id = %link.chat_id, deal_id = deal.id, error = %err, "deal alert not delivered");
                }
                if let Err(err) = self.offer_add_to_list(filter.user_id, &link.chat_id, deal).await {
                    summary.send_failures += 1;
                    warn!(chat_id = %link.chat_id, deal_id = deal.id, error = %err, "list suggestion not delivered");
                }
            }
        }

        info!(
            deals = summary.deals,
            filters = summary.filters,
            matches = summary.matches,
            created = summary.created,
            send_failures = summary.send_failures,
            "dispatch pass finished"
        );
        Ok(summary)
    }

    async fn offer_add_to_list(&self, user_id: i64, chat_id: &str, deal: &Deal) -> Result<()> {
        if self.store.has_open_item_like(user_id, &deal.title).await? {
            return Ok(());
        }
        let lists = self
            .store
            .list_shopping_lists(user_id, 0, usize::MAX)
            .await?;
        if lists.is_empty() {
            return Ok(());
        }
        self.notifier.offer_add_to_list(chat_id, deal, &lists).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use pepper_core::{
        ChannelLink, DealDraft, DealPatch, DealQuery, FilterPatch, FixedClock, ListItem,
        ListItemPatch, NewFilter, NewListItem, NewShoppingList, NewUser, Notification,
        ShoppingListPatch, UpsertSummary, User,
    };
    use pepper_storage::{MemoryStore, StoreError, StoreResult, UserStore};
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub alerts: Mutex<Vec<(String, i64)>>,
        pub offers: Mutex<Vec<(String, i64, usize)>>,
        pub fail_alerts: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_deal_alert(&self, chat_id: &str, deal: &Deal) -> Result<()> {
            if self.fail_alerts {
                anyhow::bail!("chat unreachable");
            }
            self.alerts.lock().await.push((chat_id.to_string(), deal.id));
            Ok(())
        }

        async fn offer_add_to_list(
            &self,
            chat_id: &str,
            deal: &Deal,
            lists: &[ShoppingList],
        ) -> Result<()> {
            self.offers
                .lock()
                .await
                .push((chat_id.to_string(), deal.id, lists.len()));
            Ok(())
        }
    }

    /// Every call fails, as if the database had gone away.
    pub(crate) struct OfflineStore;

    fn offline<T>() -> StoreResult<T> {
        Err(StoreError::Corrupt("database unavailable".into()))
    }

    #[async_trait]
    impl UserStore for OfflineStore {
        async fn create_user(&self, _user: NewUser) -> StoreResult<User> {
            offline()
        }
        async fn find_user_by_username(&self, _username: &str) -> StoreResult<Option<User>> {
            offline()
        }
        async fn get_user(&self, _user_id: i64) -> StoreResult<Option<User>> {
            offline()
        }
    }

    #[async_trait]
    impl DealStore for OfflineStore {
        async fn upsert_deals(&self, _drafts: &[DealDraft]) -> StoreResult<UpsertSummary> {
            offline()
        }
        async fn list_deals(&self, _query: &DealQuery) -> StoreResult<Vec<Deal>> {
            offline()
        }
        async fn active_deals(&self, _now: chrono::DateTime<Utc>) -> StoreResult<Vec<Deal>> {
            offline()
        }
        async fn get_deal(&self, _deal_id: i64) -> StoreResult<Option<Deal>> {
            offline()
        }
        async fn create_deal(&self, _draft: DealDraft) -> StoreResult<Deal> {
            offline()
        }
        async fn update_deal(&self, _deal_id: i64, _patch: &DealPatch) -> StoreResult<Option<Deal>> {
            offline()
        }
        async fn delete_deal(&self, _deal_id: i64) -> StoreResult<bool> {
            offline()
        }
    }

    #[async_trait]
    impl ListStore for OfflineStore {
        async fn list_shopping_lists(
            &self,
            _user_id: i64,
            _skip: usize,
            _limit: usize,
        ) -> StoreResult<Vec<ShoppingList>> {
            offline()
        }
        async fn create_shopping_list(
            &self,
            _user_id: i64,
            _list: NewShoppingList,
        ) -> StoreResult<ShoppingList> {
            offline()
        }
        async fn get_shopping_list(
            &self,
            _user_id: i64,
            _list_id: i64,
        ) -> StoreResult<Option<ShoppingList>> {
            offline()
        }
        async fn update_shopping_list(
            &self,
            _user_id: i64,
            _list_id: i64,
            _patch: &ShoppingListPatch,
        ) -> StoreResult<Option<ShoppingList>> {
            offline()
        }
        async fn delete_shopping_list(&self, _user_id: i64, _list_id: i64) -> StoreResult<bool> {
            offline()
        }
        async fn list_items(
            &self,
            _user_id: i64,
            _list_id: i64,
        ) -> StoreResult<Option<Vec<ListItem>>> {
            offline()
        }
        async fn create_item(
            &self,
            _user_id: i64,
            _list_id: i64,
            _item: NewListItem,
        ) -> StoreResult<Option<ListItem>> {
            offline()
        }
        async fn update_item(
            &self,
            _user_id: i64,
            _list_id: i64,
            _item_id: i64,
            _patch: &ListItemPatch,
        ) -> StoreResult<Option<ListItem>> {
            offline()
        }
        async fn delete_item(&self, _user_id: i64, _list_id: i64, _item_id: i64) -> StoreResult<bool> {
            offline()
        }
        async fn complete_item(&self, _user_id: i64, _item_id: i64) -> StoreResult<Option<ListItem>> {
            offline()
        }
        async fn has_open_item_like(&self, _user_id: i64, _needle: &str) -> StoreResult<bool> {
            offline()
        }
    }

    #[async_trait]
    impl FilterStore for OfflineStore {
        async fn list_filters(&self, _user_id: i64) -> StoreResult<Vec<Filter>> {
            offline()
        }
        async fn create_filter(&self, _user_id: i64, _filter: NewFilter) -> StoreResult<Filter> {
            offline()
        }
        async fn get_filter(&self, _user_id: i64, _filter_id: i64) -> StoreResult<Option<Filter>> {
            offline()
        }
        async fn update_filter(
            &self,
            _user_id: i64,
            _filter_id: i64,
            _patch: &FilterPatch,
        ) -> StoreResult<Option<Filter>> {
            offline()
        }
        async fn delete_filter(&self, _user_id: i64, _filter_id: i64) -> StoreResult<bool> {
            offline()
        }
        async fn dispatchable_filters(&self) -> StoreResult<Vec<Filter>> {
            offline()
        }
    }

    #[async_trait]
    impl NotificationStore for OfflineStore {
        async fn record_notification(
            &self,
            _user_id: i64,
            _notification: NewNotification,
        ) -> StoreResult<Option<Notification>> {
            offline()
        }
        async fn list_notifications(
            &self,
            _user_id: i64,
            _unread_only: bool,
            _skip: usize,
            _limit: usize,
        ) -> StoreResult<Vec<Notification>> {
            offline()
        }
        async fn get_notification(
            &self,
            _user_id: i64,
            _notification_id: i64,
        ) -> StoreResult<Option<Notification>> {
            offline()
        }
        async fn mark_notification_read(
            &self,
            _user_id: i64,
            _notification_id: i64,
        ) -> StoreResult<Option<Notification>> {
            offline()
        }
        async fn delete_notification(&self, _user_id: i64, _notification_id: i64) -> StoreResult<bool> {
            offline()
        }
    }

    #[async_trait]
    impl ChannelStore for OfflineStore {
        async fn link_channel(&self, _chat_id: &str, _user_id: i64) -> StoreResult<ChannelLink> {
            offline()
        }
        async fn channel_link(&self, _chat_id: &str) -> StoreResult<Option<ChannelLink>> {
            offline()
        }
        async fn user_for_channel(&self, _chat_id: &str) -> StoreResult<Option<User>> {
            offline()
        }
        async fn active_channel_for_user(&self, _user_id: i64) -> StoreResult<Option<ChannelLink>> {
            offline()
        }
        async fn list_channel_links(&self, _user_id: i64) -> StoreResult<Vec<ChannelLink>> {
            offline()
        }
        async fn unlink_channel(&self, _user_id: i64, _link_id: i64) -> StoreResult<bool> {
            offline()
        }
    }

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    async fn linked_user(store: &MemoryStore, name: &str, chat_id: &str, criteria: &str) -> User {
        let user = store
            .create_user(NewUser {
                username: name.into(),
                email: format!("{name}@example.com"),
                password_hash: "x".into(),
            })
            .await
            .unwrap();
        store.link_channel(chat_id, user.id).await.unwrap();
        store
            .create_filter(
                user.id,
                NewFilter { name: "deals".into(), criteria: criteria.into(), is_active: true },
            )
            .await
            .unwrap();
        user
    }

    fn laptop() -> DealDraft {
        let mut draft = DealDraft::new("Laptop X", "Amazon");
        draft.url = Some("https://pepper.ru/deals/1".into());
        draft.discount_percentage = Some(25.0);
        draft
    }

    fn dispatcher(store: Arc<MemoryStore>, notifier: Arc<RecordingNotifier>) -> Dispatcher {
        Dispatcher::new(store, Arc::new(FixedClock(now())), notifier)
    }

    #[tokio::test]
    async fn second_pass_sends_nothing_new() {
        let store = Arc::new(MemoryStore::new());
        linked_user(&store, "alice", "100", r#"{"store":"amazon","min_discount":20}"#).await;
        store.upsert_deals(&[laptop()]).await.unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = dispatcher(store.clone(), notifier.clone());

        let first = dispatcher.run_pass().await.unwrap();
        assert_eq!((first.matches, first.created, first.send_failures), (1, 1, 0));
        let second = dispatcher.run_pass().await.unwrap();
        assert_eq!((second.matches, second.created), (1, 0));

        assert_eq!(notifier.alerts.lock().await.len(), 1);
        assert_eq!(notifier.alerts.lock().await[0].0, "100");
    }

    #[tokio::test]
    async fn expired_and_unmatched_deals_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        linked_user(&store, "alice", "100", r#"{"min_discount":30}"#).await;
        let mut expired = DealDraft::new("Old TV", "Ozon");
        expired.discount_percentage = Some(60.0);
        expired.valid_until = Some(now() - Duration::days(1));
        store.upsert_deals(&[laptop(), expired]).await.unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        let summary = dispatcher(store, notifier.clone()).run_pass().await.unwrap();
        assert_eq!(summary.deals, 1);
        assert_eq!(summary.created, 0);
        assert!(notifier.alerts.lock().await.is_empty());
    }

    #[tokio::test]
    async fn failed_send_still_marks_the_pair_processed() {
        let store = Arc::new(MemoryStore::new());
        let alice = linked_user(&store, "alice", "100", "{}").await;
        store.upsert_deals(&[laptop()]).await.unwrap();

        let notifier = Arc::new(RecordingNotifier { fail_alerts: true, ..Default::default() });
        let dispatcher = dispatcher(store.clone(), notifier);
        let first = dispatcher.run_pass().await.unwrap();
        assert_eq!((first.created, first.send_failures), (1, 1));
        assert_eq!(dispatcher.run_pass().await.unwrap().created, 0);

        let rows = store.list_notifications(alice.id, false, 0, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "Discount Match: Laptop X");
        assert_eq!(rows[0].message, "Found a discount matching your 'deals' filter");
    }

    #[tokio::test]
    async fn list_offer_needs_lists_and_no_open_duplicate() {
        let store = Arc::new(MemoryStore::new());
        linked_user(&store, "alice", "100", "{}").await;
        store.upsert_deals(&[laptop()]).await.unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        dispatcher(store.clone(), notifier.clone()).run_pass().await.unwrap();
        assert!(notifier.offers.lock().await.is_empty(), "no lists, no offer");

        let bob = linked_user(&store, "bob", "200", "{}").await;
        store
            .create_shopping_list(bob.id, NewShoppingList { title: "Tech".into(), description: None })
            .await
            .unwrap();
        let carol = linked_user(&store, "carol", "300", "{}").await;
        let carol_list = store
            .create_shopping_list(carol.id, NewShoppingList { title: "Tech".into(), description: None })
            .await
            .unwrap();
        store
            .create_item(carol.id, carol_list.id, NewListItem::named("laptop x for work"))
            .await
            .unwrap();

        dispatcher(store.clone(), notifier.clone()).run_pass().await.unwrap();
        let offers = notifier.offers.lock().await.clone();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].0, "200");
        assert_eq!(offers[0].2, 1);
    }

    #[tokio::test]
    async fn users_without_a_link_get_no_alert() {
        let store = Arc::new(MemoryStore::new());
        let alice = store
            .create_user(NewUser {
                username: "alice".into(),
                email: "alice@example.com".into(),
                password_hash: "x".into(),
            })
            .await
            .unwrap();
        store
            .create_filter(
                alice.id,
                NewFilter { name: "all".into(), criteria: "{}".into(), is_active: true },
            )
            .await
            .unwrap();
        store.upsert_deals(&[laptop()]).await.unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        let summary = dispatcher(store, notifier.clone()).run_pass().await.unwrap();
        assert_eq!(summary.filters, 0);
        assert_eq!(summary.created, 0);
    }

    #[tokio::test]
    async fn store_errors_fail_the_pass() {
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = Dispatcher::new(
            Arc::new(OfflineStore),
            Arc::new(FixedClock(now())),
            notifier.clone(),
        );
        let err = dispatcher.run_pass().await.expect_err("offline store");
        assert!(format!("{err:#}").contains("loading active deals"));
        assert!(notifier.alerts.lock().await.is_empty());
    }
}
