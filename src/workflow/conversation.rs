//! Bounded conversation history for one run.
//!
//! Messages are only ever appended. When the window grows past
//! `max_window_summary`, the oldest block after the pinned seed is replaced
//! by one summary message. Block boundaries never fall between an assistant
//! tool-call message and the tool results answering it.

use std::ops::Range;

use crate::config::PruningParameters;
use crate::error::LlmError;
use crate::llm::{ChatMessage, Role};
use crate::workflow::steps::SummaryStep;

pub const SUMMARY_PREFIX: &str = "Summary of conversation earlier: ";

#[derive(Debug, Clone)]
pub struct ConversationWindow {
    messages: Vec<ChatMessage>,
    /// Leading messages that are never pruned.
    pinned: usize,
    params: PruningParameters,
}

impl ConversationWindow {
    pub fn new(params: PruningParameters) -> Self {
        Self {
            messages: Vec::new(),
            pinned: 0,
            params,
        }
    }

    /// A window whose first message stays in place through every prune.
    pub fn seeded(seed: ChatMessage, params: PruningParameters) -> Self {
        Self {
            messages: vec![seed],
            pinned: 1,
            params,
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = ChatMessage>) {
        self.messages.extend(messages);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn params(&self) -> PruningParameters {
        self.params
    }

    pub fn needs_pruning(&self) -> bool {
        self.messages.len() > self.params.max_window_summary
    }

    /// Whether a block may end right before `index`.
    ///
    /// A tool result belongs to the call group before it, so the tail may
    /// not start on one.
    fn is_boundary(&self, index: usize) -> bool {
        self.messages
            .get(index)
            .is_none_or(|msg| msg.role != Role::Tool)
    }

    /// The block that the next prune would summarize, if pruning is due.
    ///
    /// Keeps about half the window as recent tail, shrinking the tail
    /// further when its first message would be an orphaned tool result.
    pub fn prune_range(&self) -> Option<Range<usize>> {
        if !self.needs_pruning() {
            return None;
        }
        let len = self.messages.len();
        let room = self.params.max_window_summary.saturating_sub(self.pinned + 1);
        let keep = (self.params.max_window_summary / 2).min(room);

        let mut cut = len - keep;
        while cut < len && !self.is_boundary(cut) {
            cut += 1;
        }
        (cut > self.pinned).then_some(self.pinned..cut)
    }

    /// Replace `range` with a single summary message.
    pub fn replace_with_summary(&mut self, range: Range<usize>, summary: &str) {
        let message = ChatMessage::assistant(format!("{SUMMARY_PREFIX}{summary}"));
        self.messages.splice(range, std::iter::once(message));
    }

    /// Summarize the oldest block through `step`. Returns how many messages
    /// were folded into the summary, zero if no pruning was due.
    pub async fn prune(&mut self, step: &dyn SummaryStep) -> Result<usize, LlmError> {
        let Some(range) = self.prune_range() else {
            return Ok(0);
        };
        let folded = range.len();
        let summary = step.summarize(&self.messages[range.clone()]).await?;
        self.replace_with_summary(range, &summary);
        Ok(folded)
    }
}
