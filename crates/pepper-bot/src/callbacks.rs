//! Inline button payloads.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    ToggleFilter(i64),
    ViewList(i64),
    CompleteItem(i64),
    AddToList { list_id: i64, deal_id: i64 },
}

impl CallbackAction {
    pub fn parse(data: &str) -> Option<Self> {
        let (kind, rest) = data.split_once(':')?;
        match kind {
            "toggle_filter" => rest.parse().ok().map(CallbackAction::ToggleFilter),
            "view_list" => rest.parse().ok().map(CallbackAction::ViewList),
            "complete_item" => rest.parse().ok().map(CallbackAction::CompleteItem),
            "add_to_list" => {
                let (list_id, deal_id) = rest.split_once(':')?;
                Some(CallbackAction::AddToList {
                    list_id: list_id.parse().ok()?,
                    deal_id: deal_id.parse().ok()?,
                })
            }
            _ => None,
        }
    }
}

impl fmt::Display for CallbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackAction::ToggleFilter(id) => write!(f, "toggle_filter:{id}"),
            CallbackAction::ViewList(id) => write!(f, "view_list:{id}"),
            CallbackAction::CompleteItem(id) => write!(f, "complete_item:{id}"),
            CallbackAction::AddToList { list_id, deal_id } => {
                write!(f, "add_to_list:{list_id}:{deal_id}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_payloads() {
        assert_eq!(CallbackAction::parse("toggle_filter:7"), Some(CallbackAction::ToggleFilter(7)));
        assert_eq!(CallbackAction::parse("view_list:3"), Some(CallbackAction::ViewList(3)));
        assert_eq!(CallbackAction::parse("complete_item:12"), Some(CallbackAction::CompleteItem(12)));
        assert_eq!(
            CallbackAction::parse("add_to_list:4:99"),
            Some(CallbackAction::AddToList { list_id: 4, deal_id: 99 })
        );
    }

    #[test]
    fn rejects_garbage() {
        for data in ["", "view_list", "view_list:x", "add_to_list:4", "add_to_list:a:1", "noop:1"] {
            assert_eq!(CallbackAction::parse(data), None, "{data}");
        }
    }

    #[test]
    fn display_matches_parse() {
        let action = CallbackAction::AddToList { list_id: 2, deal_id: 5 };
        assert_eq!(action.to_string(), "add_to_list:2:5");
        assert_eq!(CallbackAction::parse(&action.to_string()), Some(action));
    }
}
