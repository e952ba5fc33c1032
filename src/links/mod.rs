//! Durable links between reviewer and implementer sessions.
//!
//! A link pairs two session directories and backs their message exchange
//! with an append-only JSON channel file under the implementer's directory.
//! Links are logical references: either side's directory disappearing ends
//! the link's useful life, and readers tolerate the absence.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use walkdir::WalkDir;

use crate::persistence::{session_dir, CLAUDIO_DIR, SESSIONS_DIR};

/// Error types for link operations
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Session directory not found for '{0}'")]
    SessionNotFound(String),

    #[error("Unknown link type: {0}")]
    UnknownLinkType(String),

    #[error("No link between '{0}' and '{1}'")]
    LinkNotFound(String, String),
}

/// How a reviewer is attached to an implementer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    /// Read-only: the reviewer watches output and sends nothing.
    Observe,
    /// Messages flow both ways over the channel file.
    Bidirectional,
}

impl FromStr for LinkType {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observe" => Ok(LinkType::Observe),
            "bidirectional" => Ok(LinkType::Bidirectional),
            other => Err(LinkError::UnknownLinkType(other.to_string())),
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkType::Observe => write!(f, "observe"),
            LinkType::Bidirectional => write!(f, "bidirectional"),
        }
    }
}

/// A reviewer-to-implementer association.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLink {
    pub reviewer_session_id: String,
    pub implementer_session_id: String,
    pub link_type: LinkType,
    pub created_at: DateTime<Utc>,
    pub channel_file: PathBuf,
}

impl SessionLink {
    /// Canonical map key.
    pub fn key(&self) -> String {
        link_key(&self.reviewer_session_id, &self.implementer_session_id)
    }
}

fn link_key(reviewer: &str, implementer: &str) -> String {
    format!("{}:{}", reviewer, implementer)
}

/// Message category on a review channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewMessageType {
    Issue,
    Suggestion,
    Question,
    Info,
}

impl fmt::Display for ReviewMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewMessageType::Issue => write!(f, "issue"),
            ReviewMessageType::Suggestion => write!(f, "suggestion"),
            ReviewMessageType::Question => write!(f, "question"),
            ReviewMessageType::Info => write!(f, "info"),
        }
    }
}

/// One message on a link's channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewMessage {
    pub id: String,
    pub from: String,
    #[serde(rename = "type")]
    pub message_type: ReviewMessageType,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_ref: Option<String>,
}

impl ReviewMessage {
    pub fn new(from: String, message_type: ReviewMessageType, content: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from,
            message_type,
            content,
            timestamp: Utc::now(),
            issue_ref: None,
        }
    }

    pub fn with_issue_ref(mut self, issue_ref: String) -> Self {
        self.issue_ref = Some(issue_ref);
        self
    }
}

/// Owns the in-memory link map and the channel files it creates.
pub struct SessionLinkManager {
    base: PathBuf,
    links: RwLock<HashMap<String, SessionLink>>,
    /// Reviewer ids currently observing each implementer.
    observers: RwLock<HashMap<String, HashSet<String>>>,
}

impl SessionLinkManager {
    pub fn new(base: PathBuf) -> Self {
        Self {
            base,
            links: RwLock::new(HashMap::new()),
            observers: RwLock::new(HashMap::new()),
        }
    }

    fn channel_file(&self, implementer: &str, reviewer: &str) -> PathBuf {
        session_dir(&self.base, implementer).join(format!("review_channel_{}.json", reviewer))
    }

    /// Creates (or returns) the link between two sessions.
    ///
    /// Idempotent: re-linking an existing pair returns the stored link
    /// unchanged, including its creation time. Both session directories
    /// must exist, and the type string must parse.
    pub async fn link_sessions(
        &self,
        reviewer: &str,
        implementer: &str,
        link_type: &str,
    ) -> Result<SessionLink, LinkError> {
        let link_type = LinkType::from_str(link_type)?;

        for id in [reviewer, implementer] {
            if !session_dir(&self.base, id).exists() {
                return Err(LinkError::SessionNotFound(id.to_string()));
            }
        }

        let key = link_key(reviewer, implementer);
        {
            let links = self.links.read().await;
            if let Some(existing) = links.get(&key) {
                return Ok(existing.clone());
            }
        }

        let channel_file = self.channel_file(implementer, reviewer);
        if !channel_file.exists() {
            if let Err(e) = std::fs::write(&channel_file, "[]") {
                debug!("Failed to seed channel file: {}", e);
            }
        }

        let link = SessionLink {
            reviewer_session_id: reviewer.to_string(),
            implementer_session_id: implementer.to_string(),
            link_type,
            created_at: Utc::now(),
            channel_file,
        };

        let mut links = self.links.write().await;
        // A concurrent caller may have raced us here; first write wins
        Ok(links.entry(key).or_insert(link).clone())
    }

    /// Removes a link. The channel file stays on disk as a record.
    pub async fn unlink_sessions(
        &self,
        reviewer: &str,
        implementer: &str,
    ) -> Result<(), LinkError> {
        let key = link_key(reviewer, implementer);
        self.links
            .write()
            .await
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| LinkError::LinkNotFound(reviewer.to_string(), implementer.to_string()))
    }

    pub async fn get_link(&self, reviewer: &str, implementer: &str) -> Option<SessionLink> {
        self.links
            .read()
            .await
            .get(&link_key(reviewer, implementer))
            .cloned()
    }

    /// All links where `any_id` appears on either side.
    pub async fn get_linked_sessions(&self, any_id: &str) -> Vec<SessionLink> {
        self.links
            .read()
            .await
            .values()
            .filter(|link| {
                link.reviewer_session_id == any_id || link.implementer_session_id == any_id
            })
            .cloned()
            .collect()
    }

    /// Appends a message to the link's channel file.
    ///
    /// Read-modify-write under an advisory file lock, so concurrent senders
    /// on separate handles serialize.
    pub async fn send_review_message(
        &self,
        link: &SessionLink,
        message: ReviewMessage,
    ) -> Result<()> {
        let path = link.channel_file.clone();
        tokio::task::spawn_blocking(move || append_message(&path, &message))
            .await
            .context("Channel write task panicked")?
    }

    /// Messages with a timestamp strictly after `since`.
    pub async fn read_review_messages(
        &self,
        link: &SessionLink,
        since: DateTime<Utc>,
    ) -> Result<Vec<ReviewMessage>> {
        Ok(self
            .get_all_messages(link)
            .await?
            .into_iter()
            .filter(|m| m.timestamp > since)
            .collect())
    }

    /// Full channel snapshot. A missing file reads as an empty channel.
    pub async fn get_all_messages(&self, link: &SessionLink) -> Result<Vec<ReviewMessage>> {
        let path = link.channel_file.clone();
        tokio::task::spawn_blocking(move || read_channel(&path))
            .await
            .context("Channel read task panicked")?
    }

    /// Marks a reviewer as observing an implementer.
    pub async fn acquire_observer(&self, implementer: &str, reviewer: &str) {
        self.observers
            .write()
            .await
            .entry(implementer.to_string())
            .or_default()
            .insert(reviewer.to_string());
    }

    /// Releases an observation. A no-op when the pair was never acquired.
    pub async fn release_observer(&self, implementer: &str, reviewer: &str) {
        let mut observers = self.observers.write().await;
        if let Some(set) = observers.get_mut(implementer) {
            set.remove(reviewer);
            if set.is_empty() {
                observers.remove(implementer);
            }
        }
    }

    /// Reviewer ids currently observing an implementer, sorted.
    pub async fn get_observers(&self, implementer: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .observers
            .read()
            .await
            .get(implementer)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Rediscovers channel files left by an earlier process and rebuilds
    /// observe-links for them.
    pub async fn discover_links(&self) -> Result<usize> {
        let sessions_root = self.base.join(CLAUDIO_DIR).join(SESSIONS_DIR);
        if !sessions_root.exists() {
            return Ok(0);
        }

        let mut recovered = 0;
        for entry in WalkDir::new(&sessions_root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let name = entry.file_name().to_string_lossy();
            let Some(reviewer) = name
                .strip_prefix("review_channel_")
                .and_then(|rest| rest.strip_suffix(".json"))
            else {
                continue;
            };
            let Some(implementer) = entry
                .path()
                .parent()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().to_string())
            else {
                continue;
            };

            let key = link_key(reviewer, &implementer);
            let mut links = self.links.write().await;
            if !links.contains_key(&key) {
                links.insert(
                    key,
                    SessionLink {
                        reviewer_session_id: reviewer.to_string(),
                        implementer_session_id: implementer,
                        link_type: LinkType::Observe,
                        created_at: Utc::now(),
                        channel_file: entry.path().to_path_buf(),
                    },
                );
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    /// Human-readable dump of a link and its channel, grouped by message
    /// type, for inclusion in reviewer prompts.
    pub async fn generate_context_markdown(&self, link: &SessionLink) -> Result<String> {
        let messages = self.get_all_messages(link).await?;

        let mut out = String::new();
        out.push_str("# Review Channel Context\n\n");
        out.push_str(&format!(
            "- Reviewer session: `{}`\n- Implementer session: `{}`\n- Link type: {}\n- Linked since: {}\n\n",
            link.reviewer_session_id,
            link.implementer_session_id,
            link.link_type,
            link.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        ));

        if messages.is_empty() {
            out.push_str("No messages exchanged yet.\n");
            return Ok(out);
        }

        for kind in [
            ReviewMessageType::Issue,
            ReviewMessageType::Suggestion,
            ReviewMessageType::Question,
            ReviewMessageType::Info,
        ] {
            let group: Vec<&ReviewMessage> =
                messages.iter().filter(|m| m.message_type == kind).collect();
            if group.is_empty() {
                continue;
            }

            out.push_str(&format!("## {}s\n\n", capitalize(&kind.to_string())));
            for message in group {
                out.push_str(&format!(
                    "- [{}] **{}**: {}\n",
                    message.timestamp.format("%H:%M:%S"),
                    message.from,
                    message.content
                ));
                if let Some(issue_ref) = &message.issue_ref {
                    out.push_str(&format!("  - ref: {}\n", issue_ref));
                }
            }
            out.push('\n');
        }

        Ok(out)
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Reads the channel under a shared lock. Missing file means empty channel.
fn read_channel(path: &Path) -> Result<Vec<ReviewMessage>> {
    let Ok(mut file) = OpenOptions::new().read(true).open(path) else {
        return Ok(Vec::new());
    };
    file.lock_shared()
        .with_context(|| format!("Failed to lock {}", path.display()))?;

    let mut raw = String::new();
    let result = file.read_to_string(&mut raw);
    let _ = fs2::FileExt::unlock(&file);
    result.with_context(|| format!("Failed to read {}", path.display()))?;

    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Appends one message under an exclusive lock.
fn append_message(path: &Path, message: &ReviewMessage) -> Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.lock_exclusive()
        .with_context(|| format!("Failed to lock {}", path.display()))?;

    let result = (|| -> Result<()> {
        let mut raw = String::new();
        file.read_to_string(&mut raw)?;

        let mut messages: Vec<ReviewMessage> = if raw.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&raw)
                .with_context(|| format!("Channel {} is corrupt", path.display()))?
        };
        messages.push(message.clone());

        let data = serde_json::to_string_pretty(&messages)?;
        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        file.write_all(data.as_bytes())?;
        Ok(())
    })();

    let _ = fs2::FileExt::unlock(&file);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    async fn setup() -> (tempfile::TempDir, Arc<SessionLinkManager>) {
        let dir = tempfile::tempdir().unwrap();
        for id in ["rev", "impl"] {
            tokio::fs::create_dir_all(session_dir(dir.path(), id))
                .await
                .unwrap();
        }
        let manager = Arc::new(SessionLinkManager::new(dir.path().to_path_buf()));
        (dir, manager)
    }

    #[tokio::test]
    async fn test_linking_is_idempotent() {
        let (_dir, manager) = setup().await;

        let first = manager.link_sessions("rev", "impl", "observe").await.unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
        let second = manager.link_sessions("rev", "impl", "observe").await.unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert_eq!(first.channel_file, second.channel_file);
        assert_eq!(first.key(), "rev:impl");
    }

    #[tokio::test]
    async fn test_link_requires_session_dirs_and_valid_type() {
        let (_dir, manager) = setup().await;

        let missing = manager.link_sessions("rev", "ghost", "observe").await;
        assert!(matches!(missing, Err(LinkError::SessionNotFound(_))));

        let bad_type = manager.link_sessions("rev", "impl", "surveillance").await;
        assert!(matches!(bad_type, Err(LinkError::UnknownLinkType(_))));
    }

    #[tokio::test]
    async fn test_send_and_read_since() {
        let (_dir, manager) = setup().await;
        let link = manager
            .link_sessions("rev", "impl", "bidirectional")
            .await
            .unwrap();

        let mut cutoff = Utc::now();
        for (i, content) in ["m1", "m2", "m3"].iter().enumerate() {
            let message = ReviewMessage::new(
                "rev".to_string(),
                ReviewMessageType::Info,
                content.to_string(),
            );
            manager.send_review_message(&link, message).await.unwrap();
            if i == 0 {
                cutoff = Utc::now();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let all = manager.get_all_messages(&link).await.unwrap();
        assert_eq!(all.len(), 3);

        let tail = manager.read_review_messages(&link, cutoff).await.unwrap();
        let contents: Vec<&str> = tail.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3"]);
    }

    #[tokio::test]
    async fn test_observer_accounting() {
        let (_dir, manager) = setup().await;

        manager.acquire_observer("impl", "rev-a").await;
        manager.acquire_observer("impl", "rev-b").await;
        manager.acquire_observer("impl", "rev-c").await;
        assert_eq!(manager.get_observers("impl").await.len(), 3);

        manager.release_observer("impl", "rev-b").await;
        assert_eq!(manager.get_observers("impl").await, vec!["rev-a", "rev-c"]);

        // Releasing an absent observer is a no-op
        manager.release_observer("impl", "rev-x").await;
        manager.release_observer("other", "rev-a").await;
        assert_eq!(manager.get_observers("impl").await.len(), 2);
    }

    #[tokio::test]
    async fn test_get_linked_sessions_both_sides() {
        let (dir, manager) = setup().await;
        tokio::fs::create_dir_all(session_dir(dir.path(), "impl2"))
            .await
            .unwrap();

        manager.link_sessions("rev", "impl", "observe").await.unwrap();
        manager.link_sessions("rev", "impl2", "observe").await.unwrap();

        assert_eq!(manager.get_linked_sessions("rev").await.len(), 2);
        assert_eq!(manager.get_linked_sessions("impl").await.len(), 1);
        assert!(manager.get_linked_sessions("stranger").await.is_empty());
    }

    #[tokio::test]
    async fn test_context_markdown_groups_by_type() {
        let (_dir, manager) = setup().await;
        let link = manager
            .link_sessions("rev", "impl", "bidirectional")
            .await
            .unwrap();

        for (kind, content) in [
            (ReviewMessageType::Issue, "unchecked unwrap in auth"),
            (ReviewMessageType::Question, "is the retry intentional?"),
        ] {
            manager
                .send_review_message(
                    &link,
                    ReviewMessage::new("rev".to_string(), kind, content.to_string()),
                )
                .await
                .unwrap();
        }

        let markdown = manager.generate_context_markdown(&link).await.unwrap();
        assert!(markdown.contains("## Issues"));
        assert!(markdown.contains("unchecked unwrap in auth"));
        assert!(markdown.contains("## Questions"));
        assert!(!markdown.contains("## Suggestions"));
    }

    #[tokio::test]
    async fn test_discover_links_after_restart() {
        let (dir, manager) = setup().await;
        manager.link_sessions("rev", "impl", "observe").await.unwrap();

        let fresh = SessionLinkManager::new(dir.path().to_path_buf());
        let recovered = fresh.discover_links().await.unwrap();
        assert_eq!(recovered, 1);
        assert!(fresh.get_link("rev", "impl").await.is_some());
    }
}
