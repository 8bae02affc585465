//! Applies updates from the chat: runs the dialogue machine for messages and
//! resolves inline button presses against the store.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{info, warn};

use pepper_core::{FilterPatch, NewFilter, NewListItem, NewShoppingList, User};
use pepper_storage::{authenticate, ChannelStore, DealStore, FilterStore, ListStore, Store};

use crate::callbacks::CallbackAction;
use crate::dialogue::{step, DialogueState, Effect, Input, LOGIN_FIRST_TEXT};
use crate::telegram::{
    CallbackQuery, ChatApi, InlineKeyboardButton, InlineKeyboardMarkup, SendOptions, Update,
};

const LOGIN_FAILED_TEXT: &str = "❌ Invalid username or password. Please try again with /login";
const NOT_LINKED_TEXT: &str = "Please login first";
const CALLBACK_FAILED_TEXT: &str = "Something went wrong, please try again";

/// Rendered message body plus its inline keyboard.
struct View {
    text: String,
    keyboard: Option<InlineKeyboardMarkup>,
}

pub struct BotHandler {
    store: Arc<dyn Store>,
    api: Arc<dyn ChatApi>,
    dialogues: Mutex<HashMap<String, DialogueState>>,
}

impl BotHandler {
    pub fn new(store: Arc<dyn Store>, api: Arc<dyn ChatApi>) -> Self {
        Self {
            store,
            api,
            dialogues: Mutex::new(HashMap::new()),
        }
    }

    pub async fn handle_update(&self, update: Update) -> Result<()> {
        if let Some(query) = update.callback_query {
            return self.handle_callback(query).await;
        }
        let Some(message) = update.message else {
            return Ok(());
        };
        let Some(text) = message.text else {
            return Ok(());
        };
        self.handle_message(&message.chat.id.to_string(), &text).await
    }

    pub async fn dialogue_state(&self, chat_id: &str) -> DialogueState {
        self.dialogues
            .lock()
            .await
            .get(chat_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn handle_message(&self, chat_id: &str, text: &str) -> Result<()> {
        let user = self.store.user_for_channel(chat_id).await?;
        let state = self.dialogue_state(chat_id).await;
        let transition = step(&state, Input::parse(text), user.is_some());

        {
            let mut dialogues = self.dialogues.lock().await;
            if transition.next == DialogueState::Idle {
                dialogues.remove(chat_id);
            } else {
                dialogues.insert(chat_id.to_string(), transition.next);
            }
        }

        match transition.effect {
            Effect::Reply(text) => self.reply(chat_id, &text).await,
            Effect::AlreadyLoggedIn => {
                let name = user.map(|u| u.username).unwrap_or_default();
                self.reply(chat_id, &format!("✅ You're already logged in as {name}!"))
                    .await
            }
            Effect::Authenticate { username, password } => {
                self.login(chat_id, &username, &password).await
            }
            Effect::CreateFilter { name, criteria } => {
                let Some(user) = user else {
                    return self.reply(chat_id, LOGIN_FIRST_TEXT).await;
                };
                let filter = NewFilter {
                    name,
                    criteria,
                    is_active: true,
                };
                let filter = self.store.create_filter(user.id, filter).await?;
                info!(chat_id, filter_id = filter.id, "filter created from chat");
                self.reply(
                    chat_id,
                    &format!("✅ Filter '{}' created successfully!", filter.name),
                )
                .await
            }
            Effect::CreateList { title } => {
                let Some(user) = user else {
                    return self.reply(chat_id, LOGIN_FIRST_TEXT).await;
                };
                let list = NewShoppingList {
                    title,
                    description: None,
                };
                let list = self.store.create_shopping_list(user.id, list).await?;
                self.reply(
                    chat_id,
                    &format!("✅ Shopping list '{}' created successfully!", list.title),
                )
                .await
            }
            Effect::ShowFilters => match user {
                Some(user) => {
                    let view = self.filters_view(&user).await?;
                    self.send_view(chat_id, view).await
                }
                None => self.reply(chat_id, LOGIN_FIRST_TEXT).await,
            },
            Effect::ShowLists => match user {
                Some(user) => {
                    let view = self.lists_view(&user).await?;
                    self.send_view(chat_id, view).await
                }
                None => self.reply(chat_id, LOGIN_FIRST_TEXT).await,
            },
        }
    }

    async fn login(&self, chat_id: &str, username: &str, password: &str) -> Result<()> {
        let user = authenticate(self.store.as_ref(), username, password)
            .await?
            .filter(|user| user.is_active);
        let Some(user) = user else {
            warn!(chat_id, username, "chat login rejected");
            return self.reply(chat_id, LOGIN_FAILED_TEXT).await;
        };
        self.store.link_channel(chat_id, user.id).await?;
        info!(chat_id, user_id = user.id, "chat linked");
        self.reply(
            chat_id,
            &format!("✅ Successfully logged in as {}!", user.username),
        )
        .await
    }

    /// The query is always answered, even when resolving it failed, so the
    /// button never keeps spinning.
    async fn handle_callback(&self, query: CallbackQuery) -> Result<()> {
        let resolved = match (&query.message, query.data.as_deref()) {
            (Some(message), Some(data)) => {
                let chat_id = message.chat.id.to_string();
                self.resolve_callback(&chat_id, message.message_id, data)
                    .await
            }
            _ => Ok(None),
        };
        let answer = match &resolved {
            Ok(answer) => answer.as_deref(),
            Err(_) => Some(CALLBACK_FAILED_TEXT),
        };
        self.api.answer_callback(&query.id, answer).await?;
        resolved.map(|_| ())
    }

    /// Returns the toast text shown to the user, if any.
    async fn resolve_callback(
        &self,
        chat_id: &str,
        message_id: i64,
        data: &str,
    ) -> Result<Option<String>> {
        let Some(user) = self.store.user_for_channel(chat_id).await? else {
            return Ok(Some(NOT_LINKED_TEXT.to_string()));
        };
        let Some(action) = CallbackAction::parse(data) else {
            warn!(chat_id, data, "unknown callback payload");
            return Ok(Some("Unknown action".to_string()));
        };

        match action {
            CallbackAction::ToggleFilter(filter_id) => {
                let Some(filter) = self.store.get_filter(user.id, filter_id).await? else {
                    return Ok(Some("Filter not found".to_string()));
                };
                let patch = FilterPatch {
                    is_active: Some(!filter.is_active),
                    ..Default::default()
                };
                let Some(updated) = self.store.update_filter(user.id, filter_id, &patch).await?
                else {
                    return Ok(Some("Filter not found".to_string()));
                };
                let view = self.filters_view(&user).await?;
                self.edit_view(chat_id, message_id, view).await?;
                let state = if updated.is_active { "enabled" } else { "disabled" };
                Ok(Some(format!("Filter {state}")))
            }
            CallbackAction::ViewList(list_id) => match self.list_view(&user, list_id).await? {
                Some(view) => {
                    self.edit_view(chat_id, message_id, view).await?;
                    Ok(None)
                }
                None => Ok(Some("List not found".to_string())),
            },
            CallbackAction::CompleteItem(item_id) => {
                let Some(item) = self.store.complete_item(user.id, item_id).await? else {
                    return Ok(Some("Item not found".to_string()));
                };
                if let Some(view) = self.list_view(&user, item.shopping_list_id).await? {
                    self.edit_view(chat_id, message_id, view).await?;
                }
                Ok(Some(format!("✅ {} marked complete", item.name)))
            }
            CallbackAction::AddToList { list_id, deal_id } => {
                self.add_to_list(&user, chat_id, message_id, list_id, deal_id)
                    .await
            }
        }
    }

    async fn add_to_list(
        &self,
        user: &User,
        chat_id: &str,
        message_id: i64,
        list_id: i64,
        deal_id: i64,
    ) -> Result<Option<String>> {
        let list = self.store.get_shopping_list(user.id, list_id).await?;
        let deal = self.store.get_deal(deal_id).await?;
        let (Some(list), Some(deal)) = (list, deal) else {
            return Ok(Some("List or discount not found".to_string()));
        };

        if self.store.has_open_item_like(user.id, &deal.title).await? {
            return Ok(Some("Item already in shopping list".to_string()));
        }

        if self
            .store
            .create_item(user.id, list.id, NewListItem::named(deal.title.clone()))
            .await?
            .is_none()
        {
            return Ok(Some("List or discount not found".to_string()));
        }
        self.api
            .edit_message(
                chat_id,
                message_id,
                &format!("✅ Added {} to {}", deal.title, list.title),
                None,
            )
            .await?;
        Ok(Some("Item added to shopping list!".to_string()))
    }

    async fn filters_view(&self, user: &User) -> Result<View> {
        let filters = self.store.list_filters(user.id).await?;
        if filters.is_empty() {
            return Ok(View {
                text: "You don't have any filters yet. Use /addfilter to create one.".to_string(),
                keyboard: None,
            });
        }
        let mut text = String::from("📋 Your filters:\n\n");
        let mut buttons = Vec::with_capacity(filters.len());
        for filter in &filters {
            let (mark, verb) = if filter.is_active {
                ("✅", "Disable")
            } else {
                ("❌", "Enable")
            };
            text.push_str(&format!("{mark} {}\n", filter.name));
            buttons.push(InlineKeyboardButton::new(
                format!("{verb} {}", filter.name),
                CallbackAction::ToggleFilter(filter.id).to_string(),
            ));
        }
        Ok(View {
            text,
            keyboard: InlineKeyboardMarkup::column(buttons),
        })
    }

    async fn lists_view(&self, user: &User) -> Result<View> {
        let lists = self
            .store
            .list_shopping_lists(user.id, 0, usize::MAX)
            .await?;
        if lists.is_empty() {
            return Ok(View {
                text: "You don't have any shopping lists yet. Use /createlist to create one."
                    .to_string(),
                keyboard: None,
            });
        }
        let mut text = String::from("🛒 Your shopping lists:\n\n");
        let mut buttons = Vec::with_capacity(lists.len());
        for list in &lists {
            let items = self
                .store
                .list_items(user.id, list.id)
                .await?
                .unwrap_or_default();
            let done = items.iter().filter(|item| item.is_completed).count();
            text.push_str(&format!(
                "🛒 {} ({done}/{} completed)\n",
                list.title,
                items.len()
            ));
            buttons.push(InlineKeyboardButton::new(
                format!("View {}", list.title),
                CallbackAction::ViewList(list.id).to_string(),
            ));
        }
        Ok(View {
            text,
            keyboard: InlineKeyboardMarkup::column(buttons),
        })
    }

    async fn list_view(&self, user: &User, list_id: i64) -> Result<Option<View>> {
        let Some(list) = self.store.get_shopping_list(user.id, list_id).await? else {
            return Ok(None);
        };
        let items = self
            .store
            .list_items(user.id, list.id)
            .await?
            .unwrap_or_default();

        let mut text = format!("🛒 {}\n\n", list.title);
        if items.is_empty() {
            text.push_str("This list is empty.");
        }
        let mut buttons = Vec::new();
        for item in &items {
            let mark = if item.is_completed { "✅" } else { "⬜" };
            match &item.unit {
                Some(unit) => text.push_str(&format!(
                    "{mark} {} ({} {unit})\n",
                    item.name, item.quantity
                )),
                None => text.push_str(&format!("{mark} {}\n", item.name)),
            }
            if !item.is_completed {
                buttons.push(InlineKeyboardButton::new(
                    format!("Mark complete: {}", item.name),
                    CallbackAction::CompleteItem(item.id).to_string(),
                ));
            }
        }
        Ok(Some(View {
            text,
            keyboard: InlineKeyboardMarkup::column(buttons),
        }))
    }

    async fn reply(&self, chat_id: &str, text: &str) -> Result<()> {
        self.api
            .send_message(chat_id, text, SendOptions::default())
            .await?;
        Ok(())
    }

    async fn send_view(&self, chat_id: &str, view: View) -> Result<()> {
        let options = SendOptions {
            keyboard: view.keyboard,
            ..Default::default()
        };
        self.api.send_message(chat_id, &view.text, options).await?;
        Ok(())
    }

    async fn edit_view(&self, chat_id: &str, message_id: i64, view: View) -> Result<()> {
        self.api
            .edit_message(chat_id, message_id, &view.text, view.keyboard)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::telegram::{Chat, Message, TelegramError};
    use async_trait::async_trait;
    use pepper_core::{DealDraft, DealQuery, NewUser};
    use pepper_storage::{hash_password, MemoryStore, UserStore};

    #[derive(Debug, Clone)]
    pub(crate) struct Sent {
        pub chat_id: String,
        pub text: String,
        pub options: SendOptions,
    }

    #[derive(Default)]
    pub(crate) struct FakeChat {
        pub sent: Mutex<Vec<Sent>>,
        pub edits: Mutex<Vec<(String, i64, String)>>,
        pub answers: Mutex<Vec<(String, Option<String>)>>,
        pub fail_edits: bool,
    }

    impl FakeChat {
        async fn last_text(&self) -> String {
            self.sent
                .lock()
                .await
                .last()
                .map(|s| s.text.clone())
                .unwrap_or_default()
        }

        async fn last_answer(&self) -> Option<String> {
            self.answers.lock().await.last().and_then(|(_, a)| a.clone())
        }
    }

    #[async_trait]
    impl ChatApi for FakeChat {
        async fn send_message(
            &self,
            chat_id: &str,
            text: &str,
            options: SendOptions,
        ) -> Result<(), TelegramError> {
            self.sent.lock().await.push(Sent {
                chat_id: chat_id.to_string(),
                text: text.to_string(),
                options,
            });
            Ok(())
        }

        async fn edit_message(
            &self,
            chat_id: &str,
            message_id: i64,
            text: &str,
            _keyboard: Option<InlineKeyboardMarkup>,
        ) -> Result<(), TelegramError> {
            if self.fail_edits {
                return Err(TelegramError::Api {
                    method: "editMessageText".into(),
                    description: "Bad Request: message to edit not found".into(),
                });
            }
            self.edits
                .lock()
                .await
                .push((chat_id.to_string(), message_id, text.to_string()));
            Ok(())
        }

        async fn answer_callback(
            &self,
            callback_id: &str,
            text: Option<&str>,
        ) -> Result<(), TelegramError> {
            self.answers
                .lock()
                .await
                .push((callback_id.to_string(), text.map(str::to_string)));
            Ok(())
        }
    }

    fn text_update(chat: i64, text: &str) -> Update {
        Update {
            update_id: 1,
            message: Some(Message {
                message_id: 1,
                chat: Chat { id: chat },
                text: Some(text.to_string()),
            }),
            callback_query: None,
        }
    }

    fn button_update(chat: i64, data: &str) -> Update {
        Update {
            update_id: 2,
            message: None,
            callback_query: Some(CallbackQuery {
                id: "cb".to_string(),
                data: Some(data.to_string()),
                message: Some(Message {
                    message_id: 55,
                    chat: Chat { id: chat },
                    text: None,
                }),
            }),
        }
    }

    async fn setup() -> (Arc<MemoryStore>, Arc<FakeChat>, BotHandler, User) {
        let store = Arc::new(MemoryStore::new());
        let alice = store
            .create_user(NewUser {
                username: "alice".into(),
                email: "alice@example.com".into(),
                password_hash: hash_password("wonderland", 4).unwrap(),
            })
            .await
            .unwrap();
        let chat = Arc::new(FakeChat::default());
        let handler = BotHandler::new(store.clone(), chat.clone());
        (store, chat, handler, alice)
    }

    async fn say(handler: &BotHandler, chat: i64, text: &str) {
        handler.handle_update(text_update(chat, text)).await.unwrap();
    }

    #[tokio::test]
    async fn login_links_the_chat() {
        let (store, chat, handler, alice) = setup().await;
        say(&handler, 100, "/login").await;
        say(&handler, 100, "alice").await;
        assert_eq!(
            handler.dialogue_state("100").await,
            DialogueState::AwaitPassword { username: "alice".into() }
        );
        say(&handler, 100, "wonderland").await;

        assert_eq!(chat.last_text().await, "✅ Successfully logged in as alice!");
        assert!(chat.sent.lock().await.iter().all(|s| s.chat_id == "100"));
        assert_eq!(handler.dialogue_state("100").await, DialogueState::Idle);
        let owner = store.user_for_channel("100").await.unwrap().unwrap();
        assert_eq!(owner.id, alice.id);

        say(&handler, 100, "/login").await;
        assert_eq!(chat.last_text().await, "✅ You're already logged in as alice!");
    }

    #[tokio::test]
    async fn wrong_password_links_nothing() {
        let (store, chat, handler, _) = setup().await;
        for text in ["/login", "alice", "nope"] {
            say(&handler, 100, text).await;
        }
        assert_eq!(chat.last_text().await, LOGIN_FAILED_TEXT);
        assert!(store.channel_link("100").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn add_filter_dialogue_creates_filter() {
        let (store, chat, handler, alice) = setup().await;
        store.link_channel("100", alice.id).await.unwrap();

        say(&handler, 100, "/addfilter").await;
        say(&handler, 100, "Cheap laptops").await;
        say(&handler, 100, "not json").await;
        assert_eq!(
            handler.dialogue_state("100").await,
            DialogueState::AwaitFilterCriteria { name: "Cheap laptops".into() }
        );
        say(&handler, 100, r#"{"keywords":["laptop"],"min_discount":20}"#).await;

        assert_eq!(chat.last_text().await, "✅ Filter 'Cheap laptops' created successfully!");
        let filters = store.list_filters(alice.id).await.unwrap();
        assert_eq!(filters.len(), 1);
        assert!(filters[0].is_active);
    }

    #[tokio::test]
    async fn toggle_checks_ownership() {
        let (store, chat, handler, alice) = setup().await;
        store.link_channel("100", alice.id).await.unwrap();
        let filter = store
            .create_filter(
                alice.id,
                NewFilter { name: "all".into(), criteria: "{}".into(), is_active: true },
            )
            .await
            .unwrap();

        let data = CallbackAction::ToggleFilter(filter.id).to_string();
        handler.handle_update(button_update(100, &data)).await.unwrap();
        assert_eq!(chat.last_answer().await.as_deref(), Some("Filter disabled"));
        assert!(!store.get_filter(alice.id, filter.id).await.unwrap().unwrap().is_active);
        assert!(chat.edits.lock().await[0].2.contains("❌ all"));

        let mallory = store
            .create_user(NewUser {
                username: "mallory".into(),
                email: "m@example.com".into(),
                password_hash: "x".into(),
            })
            .await
            .unwrap();
        store.link_channel("666", mallory.id).await.unwrap();
        handler.handle_update(button_update(666, &data)).await.unwrap();
        assert_eq!(chat.last_answer().await.as_deref(), Some("Filter not found"));
        assert!(!store.get_filter(alice.id, filter.id).await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn unlinked_chat_cannot_press_buttons() {
        let (_, chat, handler, _) = setup().await;
        handler
            .handle_update(button_update(100, "view_list:1"))
            .await
            .unwrap();
        assert_eq!(chat.last_answer().await.as_deref(), Some(NOT_LINKED_TEXT));
    }

    #[tokio::test]
    async fn add_to_list_once() {
        let (store, chat, handler, alice) = setup().await;
        store.link_channel("100", alice.id).await.unwrap();
        let list = store
            .create_shopping_list(alice.id, NewShoppingList { title: "Tech".into(), description: None })
            .await
            .unwrap();
        store
            .upsert_deals(&[DealDraft::new("Laptop X", "Amazon")])
            .await
            .unwrap();
        let query = DealQuery { store: None, skip: 0, limit: 10 };
        let deal = store.list_deals(&query).await.unwrap().remove(0);

        let data = CallbackAction::AddToList { list_id: list.id, deal_id: deal.id }.to_string();
        handler.handle_update(button_update(100, &data)).await.unwrap();
        assert_eq!(chat.last_answer().await.as_deref(), Some("Item added to shopping list!"));
        handler.handle_update(button_update(100, &data)).await.unwrap();
        assert_eq!(chat.last_answer().await.as_deref(), Some("Item already in shopping list"));

        let items = store.list_items(alice.id, list.id).await.unwrap().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "Laptop X");

        let missing = CallbackAction::AddToList { list_id: list.id, deal_id: 9999 }.to_string();
        handler.handle_update(button_update(100, &missing)).await.unwrap();
        assert_eq!(chat.last_answer().await.as_deref(), Some("List or discount not found"));
    }

    #[tokio::test]
    async fn lists_show_progress_and_complete_items() {
        let (store, chat, handler, alice) = setup().await;
        store.link_channel("100", alice.id).await.unwrap();
        let list = store
            .create_shopping_list(alice.id, NewShoppingList { title: "Food".into(), description: None })
            .await
            .unwrap();
        let milk = store
            .create_item(alice.id, list.id, NewListItem::named("Milk"))
            .await
            .unwrap()
            .unwrap();
        store
            .create_item(alice.id, list.id, NewListItem::named("Bread"))
            .await
            .unwrap();

        say(&handler, 100, "/lists").await;
        assert!(chat.last_text().await.contains("🛒 Food (0/2 completed)"));

        let data = CallbackAction::CompleteItem(milk.id).to_string();
        handler.handle_update(button_update(100, &data)).await.unwrap();
        assert_eq!(chat.last_answer().await.as_deref(), Some("✅ Milk marked complete"));
        let edits = chat.edits.lock().await;
        assert!(edits.last().unwrap().2.contains("✅ Milk"));
        assert!(edits.last().unwrap().2.contains("⬜ Bread"));
    }

    #[tokio::test]
    async fn failed_callback_is_still_answered() {
        let store = Arc::new(MemoryStore::new());
        let alice = store
            .create_user(NewUser {
                username: "alice".into(),
                email: "alice@example.com".into(),
                password_hash: "x".into(),
            })
            .await
            .unwrap();
        store.link_channel("100", alice.id).await.unwrap();
        let filter = store
            .create_filter(
                alice.id,
                NewFilter { name: "all".into(), criteria: "{}".into(), is_active: true },
            )
            .await
            .unwrap();
        let chat = Arc::new(FakeChat { fail_edits: true, ..Default::default() });
        let handler = BotHandler::new(store.clone(), chat.clone());

        let data = CallbackAction::ToggleFilter(filter.id).to_string();
        assert!(handler.handle_update(button_update(100, &data)).await.is_err());
        let answers = chat.answers.lock().await;
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].1.as_deref(), Some(CALLBACK_FAILED_TEXT));
    }

    #[tokio::test]
    async fn add_to_list_skips_items_that_already_mention_the_deal() {
        let (store, chat, handler, alice) = setup().await;
        store.link_channel("100", alice.id).await.unwrap();
        let home = store
            .create_shopping_list(alice.id, NewShoppingList { title: "Home".into(), description: None })
            .await
            .unwrap();
        let tech = store
            .create_shopping_list(alice.id, NewShoppingList { title: "Tech".into(), description: None })
            .await
            .unwrap();
        store
            .create_item(alice.id, home.id, NewListItem::named("laptop x for dad"))
            .await
            .unwrap();
        store
            .upsert_deals(&[DealDraft::new("Laptop X", "Amazon")])
            .await
            .unwrap();
        let query = DealQuery { store: None, skip: 0, limit: 10 };
        let deal = store.list_deals(&query).await.unwrap().remove(0);

        let data = CallbackAction::AddToList { list_id: tech.id, deal_id: deal.id }.to_string();
        handler.handle_update(button_update(100, &data)).await.unwrap();
        assert_eq!(chat.last_answer().await.as_deref(), Some("Item already in shopping list"));
        assert!(store.list_items(alice.id, tech.id).await.unwrap().unwrap().is_empty());
    }
}
