//! Consumer-side prompt queue
//!
//! Mirrors the broker's pending list for a UI. Only the head is answerable;
//! prompts that arrive while one is displayed are queued behind it.

use super::service::PromptBroker;
use super::types::{PromptEvent, PromptRequest};
use crate::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use tracing::warn;

/// Delivers answers back to the mediator
#[async_trait]
pub trait PromptTransport: Send + Sync {
    async fn respond(&self, request_id: &str, response: &str) -> Result<()>;
}

#[async_trait]
impl PromptTransport for PromptBroker {
    async fn respond(&self, request_id: &str, response: &str) -> Result<()> {
        PromptBroker::respond(self, request_id, response)
    }
}

/// Ordered view of outstanding prompts, oldest first
#[derive(Debug, Default)]
pub struct PromptQueue {
    items: VecDeque<PromptRequest>,
}

impl PromptQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a broker snapshot
    pub fn from_pending(pending: Vec<PromptRequest>) -> Self {
        Self {
            items: pending.into(),
        }
    }

    pub fn apply(&mut self, event: PromptEvent) {
        match event {
            PromptEvent::Added(request) => {
                if !self.contains(&request.request_id) {
                    self.items.push_back(request);
                }
            }
            PromptEvent::Removed { request_id, .. } => {
                self.items.retain(|r| r.request_id != request_id);
            }
        }
    }

    pub fn head(&self) -> Option<&PromptRequest> {
        self.items.front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.items.iter().any(|r| r.request_id == request_id)
    }

    /// Answer the head prompt. On transport failure it stays queued.
    ///
    /// Returns the answered request, or `None` when the queue is empty.
    pub async fn respond_head(
        &mut self,
        transport: &dyn PromptTransport,
        response: &str,
    ) -> Result<Option<PromptRequest>> {
        let Some(head) = self.items.front() else {
            return Ok(None);
        };
        let request_id = head.request_id.clone();

        if let Err(e) = transport.respond(&request_id, response).await {
            warn!(request_id = %request_id, "prompt response not delivered: {}", e);
            return Err(e);
        }
        Ok(self.remove(&request_id))
    }

    /// Dismiss the head: host keys answer "no", credentials answer empty
    pub async fn dismiss_head(
        &mut self,
        transport: &dyn PromptTransport,
    ) -> Result<Option<PromptRequest>> {
        let Some(head) = self.items.front() else {
            return Ok(None);
        };
        let response = head.kind.dismiss_response();
        self.respond_head(transport, response).await
    }

    fn remove(&mut self, request_id: &str) -> Option<PromptRequest> {
        let index = self.items.iter().position(|r| r.request_id == request_id)?;
        self.items.remove(index)
    }
}
