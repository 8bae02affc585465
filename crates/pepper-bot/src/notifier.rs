//! Deal alerts pushed to a linked chat.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use pepper_core::{Deal, ShoppingList};
use pepper_sync::Notifier;

use crate::callbacks::CallbackAction;
use crate::telegram::{ChatApi, InlineKeyboardButton, InlineKeyboardMarkup, SendOptions};

pub struct ChatNotifier {
    api: Arc<dyn ChatApi>,
}

impl ChatNotifier {
    pub fn new(api: Arc<dyn ChatApi>) -> Self {
        Self { api }
    }
}

/// Escape the characters legacy Markdown mode treats as markup.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '_' | '*' | '`' | '[') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

pub fn format_deal_alert(deal: &Deal) -> String {
    let mut text = format!(
        "🛒 *{}*\n🏪 Store: {}\n",
        escape_markdown(&deal.title),
        escape_markdown(&deal.store)
    );
    match (deal.discount_price, deal.original_price, deal.discount_percentage) {
        (Some(price), Some(original), _) => {
            text.push_str(&format!("💰 Price: {price} (was {original})\n"));
        }
        (Some(price), None, _) => text.push_str(&format!("💰 Price: {price}\n")),
        (None, _, Some(pct)) => text.push_str(&format!("📉 Discount: {pct}%\n")),
        _ => {}
    }
    if let Some(description) = deal.description.as_deref().filter(|d| !d.is_empty()) {
        text.push_str(&format!("\n📝 {}\n", escape_markdown(description)));
    }
    if let Some(url) = &deal.url {
        text.push_str(&format!("\n🔗 [View Deal]({url})"));
    }
    text
}

#[async_trait]
impl Notifier for ChatNotifier {
    async fn send_deal_alert(&self, chat_id: &str, deal: &Deal) -> Result<()> {
        let options = SendOptions {
            markdown: true,
            disable_preview: true,
            keyboard: None,
        };
        self.api
            .send_message(chat_id, &format_deal_alert(deal), options)
            .await?;
        Ok(())
    }

    async fn offer_add_to_list(
        &self,
        chat_id: &str,
        deal: &Deal,
        lists: &[ShoppingList],
    ) -> Result<()> {
        let buttons = lists
            .iter()
            .map(|list| {
                InlineKeyboardButton::new(
                    format!("Add to {}", list.title),
                    CallbackAction::AddToList {
                        list_id: list.id,
                        deal_id: deal.id,
                    }
                    .to_string(),
                )
            })
            .collect();
        let text = format!(
            "🛒 Found discount on *{}*!\nWould you like to add this to your shopping list?",
            escape_markdown(&deal.title)
        );
        let options = SendOptions {
            markdown: true,
            disable_preview: false,
            keyboard: InlineKeyboardMarkup::column(buttons),
        };
        self.api.send_message(chat_id, &text, options).await?;
        Ok(())
    }
}
