//! Workflow states and the pure transition function between them.

use serde::Serialize;

use crate::workflow::conversation::ConversationWindow;
use crate::workflow::payload::WorkflowControl;

/// A node of the workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Input,
    ToolExecution,
    MessageSummary,
    FinishWorkflow,
}

impl Node {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::FinishWorkflow)
    }
}

/// Side effect the engine performs on entering the next node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Ask the decision step what to do.
    Decide,
    /// Run the pending tool calls.
    DispatchTools,
    /// Summarize the oldest block of the window.
    Prune,
    /// Nothing to do in this node.
    Skip,
    /// Condense the run into its result.
    Finish,
}

/// Compute the next node after `node` has run.
///
/// `pending_calls` is the number of tool calls the last decision requested
/// and that have not been dispatched yet.
pub fn transition(
    node: Node,
    window: &ConversationWindow,
    control: &WorkflowControl,
    pending_calls: usize,
) -> (Node, Effect) {
    match node {
        Node::Input if control.should_stop => (Node::FinishWorkflow, Effect::Finish),
        Node::Input if pending_calls > 0 => (Node::ToolExecution, Effect::DispatchTools),
        Node::Input | Node::ToolExecution => {
            let effect = if window.needs_pruning() {
                Effect::Prune
            } else {
                Effect::Skip
            };
            (Node::MessageSummary, effect)
        }
        Node::MessageSummary => (Node::Input, Effect::Decide),
        Node::FinishWorkflow => (Node::FinishWorkflow, Effect::Finish),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PruningParameters;
    use crate::llm::ChatMessage;

    fn window(len: usize) -> ConversationWindow {
        let mut window = ConversationWindow::new(PruningParameters {
            max_window_summary: 3,
            max_queue_size: 6,
        });
        window.extend((0..len).map(|i| ChatMessage::user(format!("m{i}"))));
        window
    }

    #[test]
    fn stop_wins_over_pending_calls() {
        let mut control = WorkflowControl::default();
        control.stop("done");
        assert_eq!(
            transition(Node::Input, &window(1), &control, 2),
            (Node::FinishWorkflow, Effect::Finish)
        );
    }

    #[test]
    fn tool_calls_go_to_execution_then_summary() {
        let control = WorkflowControl::default();
        assert_eq!(
            transition(Node::Input, &window(1), &control, 1),
            (Node::ToolExecution, Effect::DispatchTools)
        );
        assert_eq!(
            transition(Node::ToolExecution, &window(2), &control, 0),
            (Node::MessageSummary, Effect::Skip)
        );
        assert_eq!(
            transition(Node::ToolExecution, &window(4), &control, 0),
            (Node::MessageSummary, Effect::Prune)
        );
    }

    #[test]
    fn summary_loops_back_to_input() {
        let control = WorkflowControl::default();
        assert_eq!(
            transition(Node::MessageSummary, &window(1), &control, 0),
            (Node::Input, Effect::Decide)
        );
        assert_eq!(
            transition(Node::Input, &window(1), &control, 0),
            (Node::MessageSummary, Effect::Skip)
        );
    }

    #[test]
    fn finish_is_terminal() {
        assert!(Node::FinishWorkflow.is_terminal());
        assert!(!Node::Input.is_terminal());
    }
}
