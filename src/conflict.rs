//! Conflict resolution between a forked document state and the master state.

use async_trait::async_trait;
use serde::Serialize;

use crate::document::{self, DocumentData};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictHandlerInput {
    pub new_document_state: DocumentData,
    pub real_master_state: DocumentData,
    pub assumed_master_state: Option<DocumentData>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ConflictHandlerOutput {
    /// Both states carry the same data; nothing to resolve.
    Equal,
    Resolved(DocumentData),
}

/// Task emitted by the storage engine when it needs a conflict decided.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictResolutionTask {
    pub id: String,
    pub input: ConflictHandlerInput,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictResolutionTaskSolution {
    pub id: String,
    pub output: ConflictHandlerOutput,
}

/// Strategy deciding which state wins a conflict.
#[async_trait]
pub trait ConflictHandler: Send + Sync {
    async fn resolve(&self, input: &ConflictHandlerInput, context: &str) -> Result<ConflictHandlerOutput>;
}

/// Master wins, unless both sides already agree on the user data.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConflictHandler;

#[async_trait]
impl ConflictHandler for DefaultConflictHandler {
    async fn resolve(&self, input: &ConflictHandlerInput, _context: &str) -> Result<ConflictHandlerOutput> {
        if document::strip_meta(&input.new_document_state) == document::strip_meta(&input.real_master_state) {
            Ok(ConflictHandlerOutput::Equal)
        } else {
            Ok(ConflictHandlerOutput::Resolved(input.real_master_state.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn default_handler_prefers_master() {
        let input = ConflictHandlerInput {
            new_document_state: json!({"id": "a", "name": "fork", "_rev": "2-a"}),
            real_master_state: json!({"id": "a", "name": "master", "_rev": "2-b"}),
            assumed_master_state: None,
        };
        let out = DefaultConflictHandler.resolve(&input, "test").await.unwrap();
        assert_eq!(out, ConflictHandlerOutput::Resolved(input.real_master_state.clone()));
    }

    #[tokio::test]
    async fn default_handler_ignores_metadata() {
        let input = ConflictHandlerInput {
            new_document_state: json!({"id": "a", "name": "x", "_rev": "2-a", "_meta": {"lwt": 1.0}}),
            real_master_state: json!({"id": "a", "name": "x", "_rev": "3-b", "_meta": {"lwt": 2.0}}),
            assumed_master_state: None,
        };
        let out = DefaultConflictHandler.resolve(&input, "test").await.unwrap();
        assert_eq!(out, ConflictHandlerOutput::Equal);
    }
}
