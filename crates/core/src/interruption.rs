//! Interruption Controller
//!
//! Tracks which assistant turns are in flight and cuts them off when the user
//! starts speaking. A turn is in flight from the moment Inference starts it until
//! the output adapter has delivered its `EndOfTurn`.
//!
//! Barge-in does three things to every in-flight turn:
//! 1. cancels the turn's token, which stops Inference and SpeechSynthesis;
//! 2. adds the turn to the purge set, so queued frames of that turn are dropped
//!    on the way into the output adapter;
//! 3. marks the assistant turn `Truncated` in the conversation context.

use crate::context::{ContextError, SharedContext};
use crate::frame::{Frame, TurnId};
use crate::pipeline::link::FrameFilter;
use dashmap::DashSet;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// The newest in-flight turn was cut off.
    Interrupted(TurnId),
    /// Nothing was playing; the user simply started a new turn.
    NothingInFlight,
}

pub struct InterruptionController {
    context: SharedContext,
    allow_interruptions: bool,
    in_flight: Mutex<BTreeMap<TurnId, CancellationToken>>,
    purged: DashSet<TurnId>,
}

impl InterruptionController {
    pub fn new(context: SharedContext, allow_interruptions: bool) -> Self {
        Self {
            context,
            allow_interruptions,
            in_flight: Mutex::new(BTreeMap::new()),
            purged: DashSet::new(),
        }
    }

    pub fn allow_interruptions(&self) -> bool {
        self.allow_interruptions
    }

    /// Registers a new assistant response and returns its cancellation token.
    pub fn begin_response(&self, turn_id: TurnId) -> CancellationToken {
        let token = CancellationToken::new();
        self.tracked().insert(turn_id, token.clone());
        debug!(turn_id, "assistant turn in flight");
        token
    }

    /// The token synthesis for `turn_id` must observe. Already cancelled if the
    /// turn was interrupted.
    pub fn synthesis_token(&self, turn_id: TurnId) -> CancellationToken {
        let tracked = self.tracked().get(&turn_id).cloned();
        match tracked {
            Some(token) => token,
            None => {
                let token = CancellationToken::new();
                if self.purged.contains(&turn_id) {
                    token.cancel();
                }
                token
            }
        }
    }

    /// Called when the voice-activity gate detects the start of user speech.
    pub async fn on_user_speech(&self) -> InterruptOutcome {
        if !self.allow_interruptions {
            return InterruptOutcome::NothingInFlight;
        }
        let interrupted: Vec<(TurnId, CancellationToken)> =
            std::mem::take(&mut *self.tracked()).into_iter().collect();
        let Some(newest) = interrupted.last().map(|(id, _)| *id) else {
            return InterruptOutcome::NothingInFlight;
        };

        for (turn_id, token) in &interrupted {
            token.cancel();
            self.purged.insert(*turn_id);
        }

        let mut context = self.context.lock().await;
        for (turn_id, _) in &interrupted {
            let truncated = match context.truncate(*turn_id) {
                // Inference allocated the id but no text reached the context yet.
                Err(ContextError::UnknownTurn(_)) => context
                    .begin_assistant(*turn_id)
                    .and_then(|_| context.truncate(*turn_id)),
                other => other,
            };
            if let Err(e) = truncated {
                warn!(turn_id, error = %e, "failed to truncate interrupted turn");
            }
        }
        info!(turn_id = newest, "user barge-in, assistant turn truncated");
        InterruptOutcome::Interrupted(newest)
    }

    /// Called by the output adapter once a turn's `EndOfTurn` has been delivered.
    ///
    /// Frames reach the output adapter in order, so nothing of an older turn can
    /// still be queued; their purge entries are dropped here.
    pub fn finish_playback(&self, turn_id: TurnId) {
        if self.tracked().remove(&turn_id).is_some() {
            debug!(turn_id, "assistant turn delivered");
        }
        self.purged.retain(|purged| *purged > turn_id);
    }

    pub fn is_purged(&self, turn_id: TurnId) -> bool {
        self.purged.contains(&turn_id)
    }

    pub fn in_flight(&self) -> Vec<TurnId> {
        self.tracked().keys().copied().collect()
    }

    /// A panic elsewhere must not disable barge-in, so poisoning is ignored.
    fn tracked(&self) -> MutexGuard<'_, BTreeMap<TurnId, CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FrameFilter for InterruptionController {
    fn admits(&self, frame: &Frame) -> bool {
        match frame.turn_id() {
            Some(turn_id) => !self.is_purged(turn_id),
            None => true,
        }
    }
}
