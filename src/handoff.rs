//! Handoff: a recorded transfer of context from one session to another.
//!
//! A handoff materializes as a triple: a tagged document holding the
//! structured context, a HANDOFF message in the receiving agent's
//! channel, and the suspension of the source session. The three writes
//! are deliberately not one transaction (the session lives outside the
//! store); a failure partway leaves the earlier writes in place and
//! surfaces which step failed.

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::messaging::MessagingService;
use crate::models::{
    AgentProfile, ContentType, DocumentData, Element, ElementFilter, ElementKind,
    ElementType, EventType,
};
use crate::session::{Session, SessionManager, SessionStatus};
use crate::storage::ElementStore;
use crate::{FoundryError, Result};

#[derive(Debug, Clone, Default)]
pub struct HandoffOptions {
    pub context_summary: String,
    pub next_steps: Option<String>,
    pub reason: Option<String>,
    pub task_ids: Vec<String>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct HandoffResult {
    pub handoff_document_id: String,
    pub message_id: String,
    pub suspended_session: Session,
}

#[derive(Clone)]
pub struct HandoffService {
    store: ElementStore,
    messaging: MessagingService,
    sessions: SessionManager,
}

impl HandoffService {
    pub fn new(
        store: ElementStore,
        messaging: MessagingService,
        sessions: SessionManager,
    ) -> Self {
        Self {
            store,
            messaging,
            sessions,
        }
    }

    /// Same agent, fresh context: record the handoff and suspend the
    /// session so the next dispatch resumes clean.
    pub async fn self_handoff(
        &self,
        agent_id: &str,
        session_id: &str,
        options: HandoffOptions,
    ) -> Result<HandoffResult> {
        self.handoff(agent_id, None, session_id, options).await
    }

    /// Transfer to a different agent: the message lands in the target's
    /// channel.
    pub async fn handoff_to_agent(
        &self,
        from_agent_id: &str,
        to_agent_id: &str,
        session_id: &str,
        options: HandoffOptions,
    ) -> Result<HandoffResult> {
        self.handoff(from_agent_id, Some(to_agent_id), session_id, options)
            .await
    }

    async fn handoff(
        &self,
        from_agent_id: &str,
        to_agent_id: Option<&str>,
        session_id: &str,
        options: HandoffOptions,
    ) -> Result<HandoffResult> {
        // Step 1: the session must belong to the source agent and be
        // running.
        let session = self
            .sessions
            .get_session(session_id)
            .await?
            .ok_or_else(|| FoundryError::SessionNotFound(session_id.to_string()))?;
        if session.agent_id != from_agent_id {
            return Err(FoundryError::WrongAgent {
                session_id: session_id.to_string(),
                agent_id: from_agent_id.to_string(),
            });
        }
        if session.status != SessionStatus::Running {
            return Err(FoundryError::InvalidInput(format!(
                "session {session_id} is not running ({})",
                session.status.as_str()
            )));
        }

        // Step 2: the receiving agent must have a channel.
        let recipient_id = to_agent_id.unwrap_or(from_agent_id);
        let recipient = self
            .store
            .get(recipient_id)
            .await?
            .ok_or_else(|| FoundryError::NotFound(recipient_id.to_string()))?;
        let channel_id = AgentProfile::from_element(&recipient)
            .and_then(|p| p.channel_id)
            .ok_or_else(|| {
                FoundryError::Validation(format!("agent {recipient_id} has no channel"))
            })?;

        let kind_tag = if to_agent_id.is_some() {
            "agent-handoff"
        } else {
            "self-handoff"
        };
        let handoff_type = if to_agent_id.is_some() { "agent" } else { "self" };

        let mut payload = json!({
            "type": "handoff",
            "fromAgentId": from_agent_id,
            "contextSummary": options.context_summary,
            "providerSessionId": session.provider_session_id,
            "createdAt": Utc::now().to_rfc3339(),
        });
        if let Some(to) = to_agent_id {
            payload["toAgentId"] = json!(to);
        }
        if let Some(next_steps) = &options.next_steps {
            payload["nextSteps"] = json!(next_steps);
        }
        if let Some(reason) = &options.reason {
            payload["reason"] = json!(reason);
        }
        if !options.task_ids.is_empty() {
            payload["taskIds"] = json!(options.task_ids);
        }
        let content = serde_json::to_string(&payload)?;

        // Step 3: the handoff document.
        let mut doc_metadata = options.metadata.clone();
        doc_metadata.insert("handoffType".to_string(), json!(handoff_type));
        doc_metadata.insert("fromAgentId".to_string(), json!(from_agent_id));
        if let Some(to) = to_agent_id {
            doc_metadata.insert("toAgentId".to_string(), json!(to));
        }

        let mut document = Element::new(
            ElementKind::Document(DocumentData {
                title: Some(format!("Handoff from {from_agent_id}")),
                content: content.clone(),
                content_type: ContentType::Json,
                category: "handoff".to_string(),
            }),
            from_agent_id,
        )
        .with_tag("handoff")
        .with_tag(kind_tag);
        document.metadata = doc_metadata;
        let document = self.store.create(document).await.map_err(|e| {
            FoundryError::Agent {
                message: format!("handoff stopped at document creation: {e}"),
            }
        })?;

        // Step 4: the HANDOFF message in the channel.
        let mut message_metadata = Map::new();
        message_metadata.insert("type".to_string(), json!("HANDOFF"));
        message_metadata.insert("handoffType".to_string(), json!(handoff_type));
        message_metadata.insert("handoffDocumentId".to_string(), json!(document.id));
        let posted = self
            .messaging
            .post_message(
                &channel_id,
                from_agent_id,
                &content,
                ContentType::Json,
                vec![recipient_id.to_string()],
                message_metadata,
            )
            .await
            .map_err(|e| FoundryError::Agent {
                message: format!("handoff stopped at message post: {e}"),
            })?;

        // Step 5: suspend the source session.
        let suspend_reason = match (handoff_type, &options.reason) {
            ("self", Some(reason)) => format!("Self-handoff: {reason}"),
            ("self", None) => "Self-handoff".to_string(),
            (_, Some(reason)) => {
                format!("Handoff to {}: {reason}", to_agent_id.unwrap_or_default())
            }
            (_, None) => format!("Handoff to {}", to_agent_id.unwrap_or_default()),
        };
        let suspended = self
            .sessions
            .suspend_session(session_id, Some(&suspend_reason))
            .await
            .map_err(|e| FoundryError::Agent {
                message: format!("handoff stopped at session suspension: {e}"),
            })?;

        self.store
            .record_event(
                from_agent_id,
                EventType::HandoffOccurred,
                from_agent_id,
                None,
                Some(json!({
                    "handoffDocumentId": document.id,
                    "messageId": posted.message.id,
                    "toAgentId": to_agent_id,
                    "sessionId": session_id,
                })),
            )
            .await?;

        info!(
            from = %from_agent_id,
            to = ?to_agent_id,
            document = %document.id,
            "handoff recorded"
        );
        Ok(HandoffResult {
            handoff_document_id: document.id,
            message_id: posted.message.id,
            suspended_session: suspended,
        })
    }

    /// Newest handoff document involving the agent, outgoing or
    /// incoming.
    pub async fn last_handoff(&self, agent_id: &str) -> Result<Option<Element>> {
        let mut filter = ElementFilter::of_type(ElementType::Document);
        filter.tags = vec!["handoff".to_string()];
        let mut documents = self.store.list(filter).await?;
        documents.retain(|doc| {
            doc.metadata.get("fromAgentId") == Some(&json!(agent_id))
                || doc.metadata.get("toAgentId") == Some(&json!(agent_id))
        });
        documents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(documents.into_iter().next())
    }

    /// True when the newest handoff's provider session is still waiting
    /// to be resumed.
    pub async fn has_pending_handoff(&self, agent_id: &str) -> Result<bool> {
        let last = match self.last_handoff(agent_id).await? {
            Some(doc) => doc,
            None => return Ok(false),
        };
        let provider_id = handoff_provider_session_id(&last);
        let resumable = self
            .sessions
            .most_recent_resumable_session(agent_id)
            .await?;
        Ok(match (provider_id, resumable) {
            (Some(provider), Some(session)) => {
                session.provider_session_id.as_deref() == Some(provider.as_str())
            }
            _ => false,
        })
    }
}

fn handoff_provider_session_id(document: &Element) -> Option<String> {
    let content = document.as_document()?.content.as_str();
    let payload: Value = serde_json::from_str(content).ok()?;
    payload
        .get("providerSessionId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}
