//! Telegram front end: long-polling client, dialogue state machine, inline
//! button callbacks and the alert notifier used by the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

pub mod callbacks;
pub mod dialogue;
pub mod handler;
pub mod notifier;
pub mod telegram;

pub use callbacks::CallbackAction;
pub use dialogue::{step, Command, DialogueState, Effect, Input, Transition};
pub use handler::BotHandler;
pub use notifier::ChatNotifier;
pub use telegram::{ChatApi, SendOptions, TelegramClient, TelegramError};

const POLL_ERROR_PAUSE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub token: Option<String>,
    pub api_base: String,
    pub poll_timeout_secs: u64,
}

impl BotConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            token: lookup("TELEGRAM_BOT_TOKEN").filter(|t| !t.trim().is_empty()),
            api_base: lookup("TELEGRAM_API_BASE")
                .unwrap_or_else(|| "https://api.telegram.org".to_string()),
            poll_timeout_secs: lookup("TELEGRAM_POLL_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

/// Pull updates forever, handing each one to `handler`. Transport errors
/// pause the loop briefly; handler errors are logged per update.
pub async fn run_polling(client: Arc<TelegramClient>, handler: Arc<BotHandler>) {
    info!("telegram polling started");
    let mut offset: Option<i64> = None;
    loop {
        let updates = match client.get_updates(offset).await {
            Ok(updates) => updates,
            Err(err) => {
                warn!(error = %err, "getUpdates failed");
                tokio::time::sleep(POLL_ERROR_PAUSE).await;
                continue;
            }
        };
        for update in updates {
            offset = Some(update.update_id + 1);
            let update_id = update.update_id;
            if let Err(err) = handler.handle_update(update).await {
                warn!(update_id, error = ?err, "update handling failed");
            }
        }
    }
}
