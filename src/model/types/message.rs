use {
    chrono::{DateTime, Utc},
    relay_rpc::domain::Topic,
    serde::{Deserialize, Serialize},
    thiserror::Error,
};

/// Payload of one notification as shown to the user.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct NotifyMessage {
    pub title: String,
    pub body: String,
    pub icon: Option<String>,
    pub url: Option<String>,
    /// Scope key of the subscription this message belongs to.
    pub r#type: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotifyMessageError {
    #[error("Notification {0} cannot be empty")]
    Empty(&'static str),

    #[error("Notification {0} cannot be longer than {1} characters")]
    TooLong(&'static str, usize),
}

const MAX_TITLE_LEN: usize = 64;
const MAX_FIELD_LEN: usize = 255;

fn check_field(
    name: &'static str,
    value: &str,
    max_len: usize,
) -> Result<(), NotifyMessageError> {
    if value.is_empty() {
        return Err(NotifyMessageError::Empty(name));
    }
    if value.len() > max_len {
        return Err(NotifyMessageError::TooLong(name, max_len));
    }
    Ok(())
}

impl NotifyMessage {
    pub fn validate(&self) -> Result<(), NotifyMessageError> {
        check_field("type", &self.r#type, MAX_FIELD_LEN)?;
        check_field("title", &self.title, MAX_TITLE_LEN)?;
        check_field("body", &self.body, MAX_FIELD_LEN)?;
        if let Some(icon) = &self.icon {
            check_field("icon", icon, MAX_FIELD_LEN)?;
        }
        if let Some(url) = &self.url {
            check_field("url", url, MAX_FIELD_LEN)?;
        }
        Ok(())
    }
}

/// A received and verified notification, stored under its topic.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct NotifyMessageRecord {
    /// Unique across the store, used for deletion and deduplication
    pub id: String,
    pub topic: Topic,
    pub message: NotifyMessage,
    pub published_at: DateTime<Utc>,
}
