//! Per-chat dialogue state machine.
//!
//! [`step`] is pure: it maps the current state, one input and whether the
//! chat is linked to an account onto the next state plus the effect the
//! handler has to carry out. Any command abandons an unfinished dialogue,
//! except `/help` which leaves it alone.

use pepper_core::FilterCriteria;

pub const WELCOME_TEXT: &str = "🤖 Welcome to PepperBot!\n\n\
I help you find the best discounts and manage your shopping lists.\n\n\
Commands:\n\
/login - Link your account\n\
/filters - Manage discount filters\n\
/lists - View shopping lists\n\
/help - Show this help\n\n\
First, please /login to link your account.";

pub const HELP_TEXT: &str = "🤖 PepperBot Help\n\n\
Commands:\n\
/start - Start the bot and get welcome message\n\
/login - Link your PepperBot account\n\
/filters - View and manage discount filters\n\
/addfilter - Create a new discount filter\n\
/lists - View your shopping lists\n\
/createlist - Create a new shopping list\n\
/cancel - Abort the current dialogue\n\
/help - Show this help message\n\n\
Features:\n\
• Get notified when discounts match your filters\n\
• Add discounted items to shopping lists\n\
• Manage your shopping lists directly from Telegram";

pub const CRITERIA_HELP_TEXT: &str = "Please enter filter criteria as JSON. Examples:\n\n\
For store-specific discounts:\n{\"store\": \"Amazon\"}\n\n\
For minimum discount percentage:\n{\"min_discount\": 20}\n\n\
For keyword matching:\n{\"keywords\": [\"laptop\", \"computer\"]}\n\n\
Combined criteria:\n{\"store\": \"Ozon\", \"min_discount\": 15, \"keywords\": [\"electronics\"]}";

pub const LOGIN_FIRST_TEXT: &str = "❌ Please /login first";
pub const ASK_USERNAME_TEXT: &str = "Please enter your username:";
pub const ASK_PASSWORD_TEXT: &str = "Please enter your password:";
pub const ASK_FILTER_NAME_TEXT: &str = "Please enter a name for your new filter:";
pub const ASK_LIST_NAME_TEXT: &str = "Please enter a name for your new shopping list:";
pub const INVALID_CRITERIA_TEXT: &str =
    "❌ Invalid JSON format. Please try again or use /cancel to stop";
pub const CANCELLED_TEXT: &str = "Cancelled.";
pub const IDLE_HINT_TEXT: &str = "Use /help to see available commands.";
pub const UNKNOWN_COMMAND_TEXT: &str = "Unknown command. Use /help to see available commands.";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DialogueState {
    #[default]
    Idle,
    AwaitUsername,
    AwaitPassword { username: String },
    AwaitFilterName,
    AwaitFilterCriteria { name: String },
    AwaitListName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Login,
    Filters,
    AddFilter,
    Lists,
    CreateList,
    Cancel,
}

impl Command {
    fn from_word(word: &str) -> Option<Self> {
        Some(match word {
            "start" => Command::Start,
            "help" => Command::Help,
            "login" => Command::Login,
            "filters" => Command::Filters,
            "addfilter" => Command::AddFilter,
            "lists" => Command::Lists,
            "createlist" => Command::CreateList,
            "cancel" => Command::Cancel,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input<'a> {
    Command(Command),
    UnknownCommand,
    Text(&'a str),
}

impl<'a> Input<'a> {
    /// `/cmd@BotName args` is a command; everything else is plain text.
    pub fn parse(raw: &'a str) -> Self {
        let trimmed = raw.trim();
        let Some(rest) = trimmed.strip_prefix('/') else {
            return Input::Text(trimmed);
        };
        let word = rest.split_whitespace().next().unwrap_or_default();
        let word = word.split('@').next().unwrap_or_default();
        match Command::from_word(&word.to_ascii_lowercase()) {
            Some(command) => Input::Command(command),
            None => Input::UnknownCommand,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Reply(String),
    AlreadyLoggedIn,
    Authenticate { username: String, password: String },
    CreateFilter { name: String, criteria: String },
    CreateList { title: String },
    ShowFilters,
    ShowLists,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: DialogueState,
    pub effect: Effect,
}

fn to(next: DialogueState, effect: Effect) -> Transition {
    Transition { next, effect }
}

fn reply(next: DialogueState, text: &str) -> Transition {
    to(next, Effect::Reply(text.to_string()))
}

pub fn step(state: &DialogueState, input: Input<'_>, logged_in: bool) -> Transition {
    use DialogueState as S;

    match input {
        Input::Command(command) => command_step(state, command, logged_in),
        Input::UnknownCommand => reply(state.clone(), UNKNOWN_COMMAND_TEXT),
        Input::Text(text) => match state {
            S::Idle => reply(S::Idle, IDLE_HINT_TEXT),
            S::AwaitUsername if text.is_empty() => reply(S::AwaitUsername, ASK_USERNAME_TEXT),
            S::AwaitUsername => reply(
                S::AwaitPassword {
                    username: text.to_string(),
                },
                ASK_PASSWORD_TEXT,
            ),
            S::AwaitPassword { username } => to(
                S::Idle,
                Effect::Authenticate {
                    username: username.clone(),
                    password: text.to_string(),
                },
            ),
            S::AwaitFilterName if text.is_empty() => reply(S::AwaitFilterName, ASK_FILTER_NAME_TEXT),
            S::AwaitFilterName => reply(
                S::AwaitFilterCriteria {
                    name: text.to_string(),
                },
                CRITERIA_HELP_TEXT,
            ),
            S::AwaitFilterCriteria { name } => match FilterCriteria::parse(text) {
                Ok(_) => to(
                    S::Idle,
                    Effect::CreateFilter {
                        name: name.clone(),
                        criteria: text.to_string(),
                    },
                ),
                Err(_) => reply(state.clone(), INVALID_CRITERIA_TEXT),
            },
            S::AwaitListName if text.is_empty() => reply(S::AwaitListName, ASK_LIST_NAME_TEXT),
            S::AwaitListName => to(
                S::Idle,
                Effect::CreateList {
                    title: text.to_string(),
                },
            ),
        },
    }
}

fn command_step(state: &DialogueState, command: Command, logged_in: bool) -> Transition {
    use DialogueState as S;

    match command {
        Command::Help => reply(state.clone(), HELP_TEXT),
        Command::Start => reply(S::Idle, WELCOME_TEXT),
        Command::Cancel => reply(S::Idle, CANCELLED_TEXT),
        Command::Login if logged_in => to(S::Idle, Effect::AlreadyLoggedIn),
        Command::Login => reply(S::AwaitUsername, ASK_USERNAME_TEXT),
        _ if !logged_in => reply(S::Idle, LOGIN_FIRST_TEXT),
        Command::Filters => to(S::Idle, Effect::ShowFilters),
        Command::Lists => to(S::Idle, Effect::ShowLists),
        Command::AddFilter => reply(S::AwaitFilterName, ASK_FILTER_NAME_TEXT),
        Command::CreateList => reply(S::AwaitListName, ASK_LIST_NAME_TEXT),
    }
}
