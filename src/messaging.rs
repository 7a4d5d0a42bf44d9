//! Channels, messages, and inbox delivery.
//!
//! Message bodies live in documents with the system category
//! `message-content`; the message element references the document. Each
//! delivery creates at most one inbox item per (recipient, message):
//! explicit recipients as `direct`, `@name` mentions of known entities
//! as `mention`.

use chrono::Utc;
use regex::Regex;
use rusqlite::TransactionBehavior;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::models::{
    ChannelData, ContentType, DocumentData, Element, ElementFilter, ElementKind,
    ElementType, EventType, InboxItemData, InboxSource, InboxStatus, MessageData,
};
use crate::storage::{rows, ElementStore};
use crate::{FoundryError, Result};

fn mention_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"@([A-Za-z0-9_-]+)").unwrap())
}

/// Everything a single post produced.
#[derive(Debug, Clone)]
pub struct PostedMessage {
    pub message: Element,
    pub content_document: Element,
    pub inbox_items: Vec<Element>,
}

#[derive(Clone)]
pub struct MessagingService {
    store: ElementStore,
}

impl MessagingService {
    pub fn new(store: ElementStore) -> Self {
        Self { store }
    }

    pub async fn create_channel(&self, name: &str, actor: &str) -> Result<Element> {
        self.store
            .create(Element::new(
                ElementKind::Channel(ChannelData {
                    name: name.to_string(),
                    topic: None,
                }),
                actor,
            ))
            .await
    }

    /// Append a message to a channel. `recipients` get direct inbox
    /// items; `@name` mentions of known entities get mention items.
    /// `metadata` lands on the message element (e.g. `type: HANDOFF`).
    pub async fn post_message(
        &self,
        channel_id: &str,
        author_id: &str,
        content: &str,
        content_type: ContentType,
        recipients: Vec<String>,
        metadata: Map<String, Value>,
    ) -> Result<PostedMessage> {
        let channel_id = channel_id.to_string();
        let author_id = author_id.to_string();
        let content = content.to_string();

        // Resolve mentions up front: entity names are matched outside
        // the write transaction, ids are re-verified inside it.
        let mentioned = self.resolve_mentions(&content).await?;

        let posted = self
            .store
            .database()
            .execute_mut(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let channel = rows::get_element(&tx, &channel_id)?
                    .ok_or_else(|| FoundryError::NotFound(channel_id.clone()))?;
                if channel.as_channel().is_none() {
                    return Err(FoundryError::InvalidInput(format!(
                        "{channel_id} is not a channel"
                    )));
                }

                let document = Element::new(
                    ElementKind::Document(DocumentData {
                        title: None,
                        content,
                        content_type,
                        category: "message-content".to_string(),
                    }),
                    &author_id,
                );
                rows::insert_element(&tx, &document)?;
                rows::mark_dirty(&tx, &document.id)?;

                let mut message = Element::new(
                    ElementKind::Message(MessageData {
                        channel_id: channel_id.clone(),
                        author_id: author_id.clone(),
                        content_ref: document.id.clone(),
                    }),
                    &author_id,
                );
                message.metadata = metadata;
                rows::insert_element(&tx, &message)?;
                rows::mark_dirty(&tx, &message.id)?;

                // One inbox item per recipient; direct wins over
                // mention when both apply.
                let mut deliveries: Vec<(String, InboxSource)> = Vec::new();
                let mut seen: BTreeSet<String> = BTreeSet::new();
                for recipient in &recipients {
                    if seen.insert(recipient.clone()) {
                        deliveries.push((recipient.clone(), InboxSource::Direct));
                    }
                }
                for mention in &mentioned {
                    if seen.insert(mention.clone()) {
                        deliveries.push((mention.clone(), InboxSource::Mention));
                    }
                }

                let mut inbox_items = Vec::new();
                for (recipient, source) in deliveries {
                    if rows::get_element(&tx, &recipient)?.is_none() {
                        return Err(FoundryError::NotFound(recipient));
                    }
                    let item = Element::new(
                        ElementKind::InboxItem(InboxItemData {
                            recipient_id: recipient,
                            message_id: message.id.clone(),
                            channel_id: channel_id.clone(),
                            source,
                            status: InboxStatus::Unread,
                            read_at: None,
                        }),
                        &author_id,
                    );
                    rows::insert_element(&tx, &item)?;
                    rows::mark_dirty(&tx, &item.id)?;
                    inbox_items.push(item);
                }

                rows::append_event(
                    &tx,
                    &channel_id,
                    EventType::MessagePosted,
                    &author_id,
                    None,
                    Some(&json!({
                        "messageId": message.id,
                        "recipients": inbox_items.len(),
                    })),
                )?;

                tx.commit()?;
                Ok(PostedMessage {
                    message,
                    content_document: document,
                    inbox_items,
                })
            })
            .await?;

        info!(
            channel = %posted.message.as_message().map(|m| m.channel_id.as_str()).unwrap_or_default(),
            message = %posted.message.id,
            deliveries = posted.inbox_items.len(),
            "message posted"
        );
        Ok(posted)
    }

    /// Mark an inbox item read. Idempotent: the second call changes
    /// nothing and preserves the original `read_at`.
    pub async fn mark_as_read(&self, inbox_item_id: &str, actor: &str) -> Result<Element> {
        let current = self.store.require(inbox_item_id).await?;
        let item = current
            .as_inbox_item()
            .ok_or_else(|| {
                FoundryError::InvalidInput(format!("{inbox_item_id} is not an inbox item"))
            })?;
        if item.status == InboxStatus::Read {
            debug!(item = %inbox_item_id, "inbox item already read");
            return Ok(current);
        }

        let updated = self
            .store
            .update(inbox_item_id, actor, |element| {
                if let Some(item) = element.as_inbox_item_mut() {
                    item.status = InboxStatus::Read;
                    item.read_at = Some(Utc::now());
                }
                Ok(())
            })
            .await?;
        self.store
            .record_event(inbox_item_id, EventType::InboxRead, actor, None, None)
            .await?;
        Ok(updated)
    }

    /// Unread inbox items for a recipient, oldest first.
    pub async fn unread_for(&self, recipient_id: &str) -> Result<Vec<Element>> {
        let mut filter = ElementFilter::of_type(ElementType::InboxItem);
        filter.status = Some("unread".to_string());
        let items = self.store.list(filter).await?;
        Ok(items
            .into_iter()
            .filter(|el| {
                el.as_inbox_item()
                    .map(|i| i.recipient_id == recipient_id)
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Body of a message, via its content document.
    pub async fn message_content(&self, message: &Element) -> Result<String> {
        let data = message
            .as_message()
            .ok_or_else(|| FoundryError::InvalidInput(format!("{} is not a message", message.id)))?;
        let document = self.store.require(&data.content_ref).await?;
        Ok(document
            .as_document()
            .map(|d| d.content.clone())
            .unwrap_or_default())
    }

    async fn resolve_mentions(&self, content: &str) -> Result<Vec<String>> {
        let names: Vec<String> = mention_pattern()
            .captures_iter(content)
            .map(|cap| cap[1].to_string())
            .collect();
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let entities = self
            .store
            .list(ElementFilter::of_type(ElementType::Entity))
            .await?;
        let mut mentioned = Vec::new();
        for element in entities {
            if let Some(entity) = element.as_entity() {
                if names.iter().any(|n| n == &entity.name) {
                    mentioned.push(element.id);
                }
            }
        }
        Ok(mentioned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityData, EntityType};
    use crate::storage::Database;

    async fn fixtures() -> (ElementStore, MessagingService) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let store = ElementStore::new(db);
        (store.clone(), MessagingService::new(store))
    }

    async fn entity(store: &ElementStore, name: &str) -> String {
        store
            .create(Element::new(
                ElementKind::Entity(EntityData {
                    name: name.to_string(),
                    entity_type: EntityType::Agent,
                    is_active: Some(true),
                }),
                "el-sys",
            ))
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn post_creates_document_message_and_inbox_items() {
        let (store, messaging) = fixtures().await;
        let author = entity(&store, "author").await;
        let reader = entity(&store, "reader").await;
        let channel = messaging.create_channel("general", &author).await.unwrap();

        let posted = messaging
            .post_message(
                &channel.id,
                &author,
                "hello there",
                ContentType::Markdown,
                vec![reader.clone()],
                Map::new(),
            )
            .await
            .unwrap();

        let doc = posted.content_document.as_document().unwrap();
        assert_eq!(doc.category, "message-content");
        assert_eq!(doc.content, "hello there");

        assert_eq!(posted.inbox_items.len(), 1);
        let item = posted.inbox_items[0].as_inbox_item().unwrap();
        assert_eq!(item.recipient_id, reader);
        assert_eq!(item.source, InboxSource::Direct);
        assert_eq!(item.status, InboxStatus::Unread);

        assert_eq!(
            messaging.message_content(&posted.message).await.unwrap(),
            "hello there"
        );
    }

    #[tokio::test]
    async fn mentions_deliver_once_per_recipient() {
        let (store, messaging) = fixtures().await;
        let author = entity(&store, "author").await;
        let fixer = entity(&store, "fixer").await;
        let channel = messaging.create_channel("bugs", &author).await.unwrap();

        // Direct recipient who is also mentioned gets exactly one item.
        let posted = messaging
            .post_message(
                &channel.id,
                &author,
                "@fixer please look, @fixer",
                ContentType::Text,
                vec![fixer.clone()],
                Map::new(),
            )
            .await
            .unwrap();

        assert_eq!(posted.inbox_items.len(), 1);
        let item = posted.inbox_items[0].as_inbox_item().unwrap();
        assert_eq!(item.recipient_id, fixer);
        assert_eq!(item.source, InboxSource::Direct);
    }

    #[tokio::test]
    async fn mark_as_read_is_idempotent() {
        let (store, messaging) = fixtures().await;
        let author = entity(&store, "author").await;
        let reader = entity(&store, "reader").await;
        let channel = messaging.create_channel("general", &author).await.unwrap();

        let posted = messaging
            .post_message(
                &channel.id,
                &author,
                "ping",
                ContentType::Text,
                vec![reader.clone()],
                Map::new(),
            )
            .await
            .unwrap();
        let item_id = posted.inbox_items[0].id.clone();

        let first = messaging.mark_as_read(&item_id, &reader).await.unwrap();
        let first_read_at = first.as_inbox_item().unwrap().read_at;
        assert!(first_read_at.is_some());

        let second = messaging.mark_as_read(&item_id, &reader).await.unwrap();
        assert_eq!(second.as_inbox_item().unwrap().read_at, first_read_at);

        assert!(messaging.unread_for(&reader).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unread_filters_by_recipient() {
        let (store, messaging) = fixtures().await;
        let author = entity(&store, "author").await;
        let a = entity(&store, "a").await;
        let b = entity(&store, "b").await;
        let channel = messaging.create_channel("general", &author).await.unwrap();

        messaging
            .post_message(&channel.id, &author, "for a", ContentType::Text, vec![a.clone()], Map::new())
            .await
            .unwrap();
        messaging
            .post_message(&channel.id, &author, "for b", ContentType::Text, vec![b.clone()], Map::new())
            .await
            .unwrap();

        assert_eq!(messaging.unread_for(&a).await.unwrap().len(), 1);
        assert_eq!(messaging.unread_for(&b).await.unwrap().len(), 1);
    }
}
