use crate::store::KeyValueStore;

/// Which features the current environment can run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupportInfo {
    /// Fetching and displaying achievements at all
    pub essential: SupportItem,
    /// Background updates and change notifications for the logged in user
    pub auto_update: SupportItem,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupportItem {
    pub ok: bool,
    pub msg: Option<String>,
}

impl SupportItem {
    fn ok() -> Self {
        Self { ok: true, msg: None }
    }

    fn missing(msg: &str) -> Self {
        Self {
            ok: false,
            msg: Some(msg.to_string()),
        }
    }
}

const ESSENTIAL_MSG: &str = "Achievements cannot be fetched. An HTTP client for the achievements API is required.";

const AUTO_UPDATE_MSG: &str = "The store does not support get/set values with change events. \
     Notification for achievement changes for logged in users will be disabled.";

/// Checks capabilities once at startup.
pub fn check_support(store: Option<&dyn KeyValueStore>, fetcher_available: bool) -> SupportInfo {
    let essential = if fetcher_available {
        SupportItem::ok()
    } else {
        SupportItem::missing(ESSENTIAL_MSG)
    };

    let auto_update = match store.map(|s| s.support()) {
        Some(support) if support.get_set && support.change_events => SupportItem::ok(),
        _ => SupportItem::missing(AUTO_UPDATE_MSG),
    };

    SupportInfo {
        essential,
        auto_update,
    }
}
