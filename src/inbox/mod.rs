//! Point-to-point messages between instances
//!
//! Each message is its own file named `<message id>@<recipient>.yaml`, so a
//! recipient's mail is found by file name alone. Messages are never deleted
//! before they are read.

use crate::config::Layout;
use crate::error::{Error, Result};
use crate::ids;
use crate::storage;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Kind of message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Info,
    Warning,
    Request,
    Response,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Info => "info",
            MessageType::Warning => "warning",
            MessageType::Request => "request",
            MessageType::Response => "response",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageType {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "info" => Ok(MessageType::Info),
            "warning" => Ok(MessageType::Warning),
            "request" => Ok(MessageType::Request),
            "response" => Ok(MessageType::Response),
            other => Err(crate::Error::Config(format!(
                "Unknown message type '{}'",
                other
            ))),
        }
    }
}

/// A delivered message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub message: String,
    #[serde(default)]
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_memory: Option<String>,
}

impl InboxMessage {
    pub fn file_name(id: &str, to: &str) -> String {
        format!("{}@{}.yaml", id, to)
    }
}

/// A message about to be sent
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingMessage {
    pub to: String,
    pub message_type: MessageType,
    pub subject: Option<String>,
    pub body: String,
    pub related_task: Option<String>,
    pub related_memory: Option<String>,
}

impl OutgoingMessage {
    pub fn new(to: impl Into<String>, message_type: MessageType, body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            message_type,
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn related_task(mut self, id: impl Into<String>) -> Self {
        self.related_task = Some(id.into());
        self
    }

    pub fn related_memory(mut self, id: impl Into<String>) -> Self {
        self.related_memory = Some(id.into());
        self
    }
}

/// Shared inbox directory
#[derive(Debug, Clone)]
pub struct Inbox {
    dir: PathBuf,
}

impl Inbox {
    pub fn new(layout: &Layout) -> Self {
        Self {
            dir: layout.inbox_dir(),
        }
    }

    /// Deliver a message as a new file.
    pub async fn send(&self, from: &str, outgoing: OutgoingMessage) -> Result<InboxMessage> {
        ids::validate(&outgoing.to)?;

        let message = InboxMessage {
            id: ids::message_id(),
            from: from.to_string(),
            to: outgoing.to,
            timestamp: Utc::now(),
            message_type: outgoing.message_type,
            subject: outgoing.subject,
            message: outgoing.body,
            read: false,
            read_at: None,
            related_task: outgoing.related_task,
            related_memory: outgoing.related_memory,
        };
        let path = self
            .dir
            .join(InboxMessage::file_name(&message.id, &message.to));
        storage::write_yaml(&path, &message).await?;

        tracing::debug!(id = %message.id, from = %from, to = %message.to, "Message sent");
        Ok(message)
    }

    async fn load_files(&self, paths: Vec<PathBuf>) -> Result<Vec<InboxMessage>> {
        let mut messages = Vec::new();
        for path in paths {
            match storage::read_yaml::<InboxMessage>(&path).await {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping unreadable message {}: {}", path.display(), e),
            }
        }
        messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(messages)
    }

    async fn files_for(&self, recipient: &str) -> Result<Vec<PathBuf>> {
        let suffix = format!("@{}.yaml", recipient);
        Ok(storage::list_yaml_files(&self.dir)
            .await?
            .into_iter()
            .filter(|p| storage::file_name(p).ends_with(&suffix))
            .collect())
    }

    async fn find(&self, id: &str) -> Result<Option<PathBuf>> {
        ids::validate(id)?;
        let prefix = format!("{}@", id);
        Ok(storage::list_yaml_files(&self.dir)
            .await?
            .into_iter()
            .find(|p| storage::file_name(p).starts_with(&prefix)))
    }

    /// Unread messages addressed to `recipient`, newest first
    pub async fn get_unread(&self, recipient: &str) -> Result<Vec<InboxMessage>> {
        let files = self.files_for(recipient).await?;
        Ok(self
            .load_files(files)
            .await?
            .into_iter()
            .filter(|m| m.to == recipient && !m.read)
            .collect())
    }

    /// Every message addressed to `recipient`, newest first
    pub async fn get_all(&self, recipient: &str) -> Result<Vec<InboxMessage>> {
        let files = self.files_for(recipient).await?;
        Ok(self
            .load_files(files)
            .await?
            .into_iter()
            .filter(|m| m.to == recipient)
            .collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<InboxMessage>> {
        match self.find(id).await? {
            Some(path) => storage::read_yaml(&path).await,
            None => Ok(None),
        }
    }

    /// Mark a message read. `None` when no such message exists.
    pub async fn mark_read(&self, id: &str) -> Result<Option<InboxMessage>> {
        let Some(path) = self.find(id).await? else {
            return Ok(None);
        };
        let Some(mut message) = storage::read_yaml::<InboxMessage>(&path).await? else {
            return Ok(None);
        };
        if !message.read {
            message.read = true;
            message.read_at = Some(Utc::now());
            storage::write_yaml(&path, &message).await?;
        }
        Ok(Some(message))
    }

    /// Delete read messages older than `max_age_days`. Returns how many
    /// were removed.
    pub async fn cleanup(&self, max_age_days: i64) -> Result<usize> {
        if max_age_days < 0 {
            return Err(Error::Config(format!(
                "message retention must not be negative, got {} days",
                max_age_days
            )));
        }
        // A retention reaching past the representable range keeps everything
        let Some(cutoff) =
            Duration::try_days(max_age_days).and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };
        let mut removed = 0;
        for path in storage::list_yaml_files(&self.dir).await? {
            if Self::is_expired(&path, cutoff).await {
                storage::remove_if_exists(&path).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Cleaned up inbox");
        }
        Ok(removed)
    }

    async fn is_expired(path: &Path, cutoff: DateTime<Utc>) -> bool {
        match storage::read_yaml::<InboxMessage>(path).await {
            Ok(Some(message)) => message.read && message.timestamp < cutoff,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_inbox() -> (Inbox, Layout, TempDir) {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        (Inbox::new(&layout), layout, dir)
    }

    #[tokio::test]
    async fn test_send_names_file_by_recipient() {
        let (inbox, layout, _dir) = make_inbox();
        let sent = inbox
            .send(
                "alpha",
                OutgoingMessage::new("beta", MessageType::Request, "review PR 12")
                    .subject("Review")
                    .related_task("task-abc"),
            )
            .await
            .unwrap();

        assert!(sent.id.starts_with("msg-"));
        assert!(layout
            .inbox_dir()
            .join(format!("{}@beta.yaml", sent.id))
            .exists());
        assert_eq!(inbox.get(&sent.id).await.unwrap(), Some(sent));
    }

    #[tokio::test]
    async fn test_unread_filters_by_recipient() {
        let (inbox, _layout, _dir) = make_inbox();
        inbox
            .send("a", OutgoingMessage::new("beta", MessageType::Info, "one"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = inbox
            .send("a", OutgoingMessage::new("beta", MessageType::Info, "two"))
            .await
            .unwrap();
        inbox
            .send("a", OutgoingMessage::new("beta-2", MessageType::Info, "other"))
            .await
            .unwrap();

        let unread = inbox.get_unread("beta").await.unwrap();
        assert_eq!(unread.len(), 2);
        assert_eq!(unread[0].id, second.id);

        inbox.mark_read(&second.id).await.unwrap();
        assert_eq!(inbox.get_unread("beta").await.unwrap().len(), 1);
        assert_eq!(inbox.get_all("beta").await.unwrap().len(), 2);
        assert_eq!(inbox.get_unread("beta-2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mark_read_unknown_is_none() {
        let (inbox, _layout, _dir) = make_inbox();
        assert!(inbox.mark_read("msg-missing").await.unwrap().is_none());
        assert!(inbox.get("msg-missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_read_is_stable() {
        let (inbox, _layout, _dir) = make_inbox();
        let sent = inbox
            .send("a", OutgoingMessage::new("b", MessageType::Warning, "careful"))
            .await
            .unwrap();
        let first = inbox.mark_read(&sent.id).await.unwrap().unwrap();
        assert!(first.read);
        let second = inbox.mark_read(&sent.id).await.unwrap().unwrap();
        assert_eq!(first.read_at, second.read_at);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_unread() {
        let (inbox, layout, _dir) = make_inbox();
        let old_read = inbox
            .send("a", OutgoingMessage::new("b", MessageType::Info, "old read"))
            .await
            .unwrap();
        let old_unread = inbox
            .send("a", OutgoingMessage::new("b", MessageType::Info, "old unread"))
            .await
            .unwrap();
        let fresh_read = inbox
            .send("a", OutgoingMessage::new("b", MessageType::Info, "fresh read"))
            .await
            .unwrap();
        inbox.mark_read(&old_read.id).await.unwrap();
        inbox.mark_read(&fresh_read.id).await.unwrap();

        // Age two of the messages
        for id in [&old_read.id, &old_unread.id] {
            let path = layout.inbox_dir().join(InboxMessage::file_name(id, "b"));
            let mut message: InboxMessage = storage::read_yaml(&path).await.unwrap().unwrap();
            message.timestamp = Utc::now() - Duration::days(30);
            storage::write_yaml(&path, &message).await.unwrap();
        }

        assert_eq!(inbox.cleanup(7).await.unwrap(), 1);
        assert!(inbox.get(&old_read.id).await.unwrap().is_none());
        assert!(inbox.get(&old_unread.id).await.unwrap().is_some());
        assert!(inbox.get(&fresh_read.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_rejects_out_of_range_retention() {
        let (inbox, _layout, _dir) = make_inbox();
        let sent = inbox
            .send("a", OutgoingMessage::new("b", MessageType::Info, "just read"))
            .await
            .unwrap();
        inbox.mark_read(&sent.id).await.unwrap();

        assert!(matches!(inbox.cleanup(-1).await, Err(Error::Config(_))));
        assert_eq!(inbox.cleanup(i64::MAX).await.unwrap(), 0);
        assert!(inbox.get(&sent.id).await.unwrap().is_some());
    }
}
