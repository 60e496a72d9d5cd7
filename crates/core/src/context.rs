//! Conversation Context
//!
//! The ordered turn history of one session. Turns are only ever appended; the one
//! permitted mutation of an existing turn is marking an assistant turn `Truncated`
//! after a barge-in. All access goes through [`SharedContext`], whose mutex is the
//! session's single mutation point.

use crate::frame::{Role, TurnId};
use crate::llm_client::ChatMessage;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};

pub type SharedContext = Arc<Mutex<ConversationContext>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// Assistant text is still streaming in.
    InProgress,
    Complete,
    /// Superseded by user speech before it was fully delivered.
    Truncated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub id: TurnId,
    pub role: Role,
    pub content: String,
    pub status: TurnStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("turn {0} already exists")]
    DuplicateTurn(TurnId),
    #[error("turn {0} not found")]
    UnknownTurn(TurnId),
    #[error("turn {0} is not an assistant turn")]
    NotAssistant(TurnId),
}

#[derive(Debug)]
pub struct ConversationContext {
    turns: Vec<Turn>,
    next_id: TurnId,
    /// Bumped whenever an assistant turn leaves `InProgress`.
    settled: watch::Sender<u64>,
}

impl ConversationContext {
    /// Creates a context seeded with the system instruction turn.
    pub fn new(system_instruction: impl Into<String>) -> Self {
        let mut context = Self {
            turns: Vec::new(),
            next_id: 0,
            settled: watch::Sender::new(0),
        };
        context.push_system(system_instruction);
        context
    }

    pub fn shared(self) -> SharedContext {
        Arc::new(Mutex::new(self))
    }

    /// Reserves an id for a turn that will be appended later (an assistant response).
    pub fn allocate_turn_id(&mut self) -> TurnId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn push_system(&mut self, content: impl Into<String>) -> TurnId {
        self.push_complete(Role::System, content.into())
    }

    pub fn push_user(&mut self, content: impl Into<String>) -> TurnId {
        self.push_complete(Role::User, content.into())
    }

    fn push_complete(&mut self, role: Role, content: String) -> TurnId {
        let id = self.allocate_turn_id();
        self.turns.push(Turn {
            id,
            role,
            content,
            status: TurnStatus::Complete,
        });
        id
    }

    /// Opens an assistant turn under a previously allocated id.
    pub fn begin_assistant(&mut self, id: TurnId) -> Result<(), ContextError> {
        if self.turn(id).is_some() {
            return Err(ContextError::DuplicateTurn(id));
        }
        self.turns.push(Turn {
            id,
            role: Role::Assistant,
            content: String::new(),
            status: TurnStatus::InProgress,
        });
        Ok(())
    }

    /// Appends streamed text to an in-progress assistant turn.
    ///
    /// Returns `false` when the turn has been truncated or completed; the delta is
    /// discarded in that case.
    pub fn append_assistant(&mut self, id: TurnId, delta: &str) -> Result<bool, ContextError> {
        let turn = self.assistant_turn_mut(id)?;
        if turn.status != TurnStatus::InProgress {
            return Ok(false);
        }
        turn.content.push_str(delta);
        Ok(true)
    }

    /// Marks an in-progress assistant turn complete. A truncated turn stays truncated.
    pub fn complete_assistant(&mut self, id: TurnId) -> Result<(), ContextError> {
        let turn = self.assistant_turn_mut(id)?;
        if turn.status == TurnStatus::InProgress {
            turn.status = TurnStatus::Complete;
            self.settled.send_modify(|n| *n += 1);
        }
        Ok(())
    }

    /// Marks an assistant turn truncated. Idempotent; the turn is never removed.
    pub fn truncate(&mut self, id: TurnId) -> Result<(), ContextError> {
        let turn = self.assistant_turn_mut(id)?;
        turn.status = TurnStatus::Truncated;
        self.settled.send_modify(|n| *n += 1);
        Ok(())
    }

    /// Whether the turn is no longer receiving text. Unknown ids count as settled.
    pub fn is_settled(&self, id: TurnId) -> bool {
        self.turn(id)
            .is_none_or(|t| t.status != TurnStatus::InProgress)
    }

    /// Notifies the receiver each time an assistant turn completes or is truncated.
    pub fn subscribe_settled(&self) -> watch::Receiver<u64> {
        self.settled.subscribe()
    }

    fn assistant_turn_mut(&mut self, id: TurnId) -> Result<&mut Turn, ContextError> {
        let turn = self
            .turns
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(ContextError::UnknownTurn(id))?;
        if turn.role != Role::Assistant {
            return Err(ContextError::NotAssistant(id));
        }
        Ok(turn)
    }

    pub fn turn(&self, id: TurnId) -> Option<&Turn> {
        self.turns.iter().find(|t| t.id == id)
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// The full history as LLM input. Truncated turns are included with whatever
    /// text was produced before the interruption; empty assistant turns are skipped.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.turns
            .iter()
            .filter(|t| !(t.role == Role::Assistant && t.content.is_empty()))
            .map(|t| ChatMessage {
                role: t.role,
                content: t.content.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_context_is_seeded_with_system_turn() {
        let context = ConversationContext::new("You are a helpful voice assistant.");
        assert_eq!(context.len(), 1);
        let first = &context.turns()[0];
        assert_eq!(first.role, Role::System);
        assert_eq!(first.status, TurnStatus::Complete);
        assert_eq!(first.id, 0);
    }

    #[test]
    fn test_assistant_turn_streams_and_completes() {
        let mut context = ConversationContext::new("sys");
        let id = context.allocate_turn_id();
        context.begin_assistant(id).unwrap();
        assert!(context.append_assistant(id, "Hello").unwrap());
        assert!(context.append_assistant(id, ", there").unwrap());
        context.complete_assistant(id).unwrap();

        let turn = context.turn(id).unwrap();
        assert_eq!(turn.content, "Hello, there");
        assert_eq!(turn.status, TurnStatus::Complete);
        assert!(!context.append_assistant(id, "late").unwrap());
    }

    #[test]
    fn test_truncate_keeps_turn_and_blocks_appends() {
        let mut context = ConversationContext::new("sys");
        let id = context.allocate_turn_id();
        context.begin_assistant(id).unwrap();
        context.append_assistant(id, "I was saying").unwrap();
        context.truncate(id).unwrap();
        context.truncate(id).unwrap();

        assert!(!context.append_assistant(id, " more").unwrap());
        context.complete_assistant(id).unwrap();

        let turn = context.turn(id).unwrap();
        assert_eq!(turn.status, TurnStatus::Truncated);
        assert_eq!(turn.content, "I was saying");
        assert_eq!(context.len(), 2);
        assert_eq!(context.messages().len(), 2);
    }

    #[test]
    fn test_truncate_rejects_non_assistant_turns() {
        let mut context = ConversationContext::new("sys");
        let user = context.push_user("hi");
        assert_eq!(
            context.truncate(user),
            Err(ContextError::NotAssistant(user))
        );
        assert_eq!(context.truncate(99), Err(ContextError::UnknownTurn(99)));
    }

    #[test]
    fn test_duplicate_assistant_turn_is_rejected() {
        let mut context = ConversationContext::new("sys");
        let id = context.allocate_turn_id();
        context.begin_assistant(id).unwrap();
        assert_eq!(
            context.begin_assistant(id),
            Err(ContextError::DuplicateTurn(id))
        );
    }

    #[test]
    fn test_messages_preserve_order_and_skip_empty_assistant() {
        let mut context = ConversationContext::new("sys");
        context.push_system("Greet the user.");
        let empty = context.allocate_turn_id();
        context.begin_assistant(empty).unwrap();
        context.push_user("What's the weather?");

        let messages = context.messages();
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::System, Role::User]);
        assert_eq!(messages[2].content, "What's the weather?");
    }

    #[test]
    fn test_settled_notifies_on_complete_and_truncate() {
        let mut context = ConversationContext::new("sys");
        let mut settled = context.subscribe_settled();
        let first = context.allocate_turn_id();
        context.begin_assistant(first).unwrap();
        assert!(!context.is_settled(first));

        context.complete_assistant(first).unwrap();
        assert!(context.is_settled(first));
        assert!(settled.has_changed().unwrap());
        let _ = settled.borrow_and_update();

        // Completing again is a no-op and does not notify.
        context.complete_assistant(first).unwrap();
        assert!(!settled.has_changed().unwrap());

        let second = context.allocate_turn_id();
        context.begin_assistant(second).unwrap();
        context.truncate(second).unwrap();
        assert!(context.is_settled(second));
        assert!(settled.has_changed().unwrap());
        assert!(context.is_settled(99));
    }
}
