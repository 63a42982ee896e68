//! Reasoning layer: wraps an LLM provider and implements the workflow steps.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use crate::error::LlmError;
use crate::llm::prompts::{self, STOP_TOOL_NAME};
use crate::scheduler::MAX_SCHEDULE_DELAY;
use crate::llm::{
    ChatMessage, CompletionRequest, LlmProvider, ToolCompletionRequest, ToolDefinition,
};
use crate::workflow::{
    Decision, DecisionStep, FinishStep, FinishedWorkflow, SummaryStep, WorkflowControl,
};

static STOP_SIGNAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\{[^{}]*"shouldStop"\s*:\s*true[^{}]*\}"#).expect("valid stop-signal regex")
});

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*\})\s*```").expect("valid fence regex"));

/// Token usage from an LLM call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Deserialize)]
struct StopSignal {
    #[serde(rename = "shouldStop")]
    should_stop: bool,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinishReply {
    summary: String,
    #[serde(default)]
    schedule: Option<ScheduleReply>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleReply {
    next_workflow_prompt: String,
    seconds_until_next_workflow: u64,
}

/// Reasoning layer that wraps an LLM provider.
pub struct Reasoning {
    llm: Arc<dyn LlmProvider>,
    system_prompt: Option<String>,
}

impl Reasoning {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            llm,
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    fn stop_tool() -> ToolDefinition {
        ToolDefinition {
            name: STOP_TOOL_NAME.to_string(),
            description: prompts::STOP_TOOL_DESCRIPTION.to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "reason": {
                        "type": "string",
                        "description": "Why the workflow should end"
                    }
                },
                "required": ["reason"]
            }),
        }
    }

    async fn complete_text(&self, prompt: String) -> Result<String, LlmError> {
        let response = self
            .llm
            .complete(CompletionRequest::new(vec![ChatMessage::user(prompt)]))
            .await?;
        let usage = TokenUsage {
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
        };
        tracing::debug!(model = self.llm.model_name(), tokens = usage.total(), "completion");
        Ok(response.content)
    }
}

/// Look for an inline `{"shouldStop": true, ...}` signal in model text.
fn parse_stop_signal(text: &str) -> Option<String> {
    let found = STOP_SIGNAL.find(text)?;
    let signal: StopSignal = serde_json::from_str(found.as_str()).ok()?;
    signal
        .should_stop
        .then(|| signal.reason.unwrap_or_else(|| "Stop requested".to_string()))
}

/// Parse the finish reply, tolerating code fences and surrounding prose.
fn parse_finish_reply(text: &str) -> Option<FinishedWorkflow> {
    let candidate = match FENCED_JSON.captures(text) {
        Some(caps) => caps.get(1)?.as_str(),
        None => {
            let start = text.find('{')?;
            let end = text.rfind('}')?;
            if end < start {
                return None;
            }
            &text[start..=end]
        }
    };
    let reply: FinishReply = serde_json::from_str(candidate).ok()?;
    let (next_workflow_prompt, seconds_until_next_workflow) = match reply.schedule {
        Some(s) if s.seconds_until_next_workflow > MAX_SCHEDULE_DELAY.as_secs() => {
            tracing::warn!(
                seconds = s.seconds_until_next_workflow,
                "Follow-up workflow is beyond the scheduling horizon, dropping it"
            );
            (None, None)
        }
        Some(s) => (Some(s.next_workflow_prompt), Some(s.seconds_until_next_workflow)),
        None => (None, None),
    };
    Some(FinishedWorkflow {
        summary: reply.summary,
        next_workflow_prompt,
        seconds_until_next_workflow,
    })
}

#[async_trait]
impl DecisionStep for Reasoning {
    async fn decide(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<Decision, LlmError> {
        let mut context = Vec::with_capacity(messages.len() + 1);
        let system = match &self.system_prompt {
            Some(prompt) => format!("{prompt}\n\n{}", prompts::DECISION_GUIDANCE),
            None => prompts::DECISION_GUIDANCE.to_string(),
        };
        context.push(ChatMessage::system(system));
        context.extend(messages.iter().cloned());

        let mut definitions = tools.to_vec();
        definitions.push(Self::stop_tool());

        let response = self
            .llm
            .complete_with_tools(ToolCompletionRequest::new(context, definitions))
            .await?;
        tracing::debug!(
            model = self.llm.model_name(),
            tokens = response.input_tokens + response.output_tokens,
            tool_calls = response.tool_calls.len(),
            "decision"
        );

        if let Some(stop) = response.tool_calls.iter().find(|c| c.name == STOP_TOOL_NAME) {
            let reason = stop
                .arguments
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("Stop requested")
                .to_string();
            return Ok(Decision::Stop { reason });
        }

        if !response.tool_calls.is_empty() {
            return Ok(Decision::ToolCalls {
                content: response.content,
                calls: response.tool_calls,
            });
        }

        let content = response.content.unwrap_or_default();
        if let Some(reason) = parse_stop_signal(&content) {
            return Ok(Decision::Stop { reason });
        }
        Ok(Decision::Respond { content })
    }
}

#[async_trait]
impl SummaryStep for Reasoning {
    async fn summarize(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let prompt = format!(
            "{}\n\n{}",
            prompts::SUMMARY_INSTRUCTIONS,
            prompts::transcript(messages)
        );
        let summary = self.complete_text(prompt).await?;
        if summary.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason: "empty summary".to_string(),
            });
        }
        Ok(summary.trim().to_string())
    }
}

#[async_trait]
impl FinishStep for Reasoning {
    async fn finish(
        &self,
        messages: &[ChatMessage],
        control: &WorkflowControl,
    ) -> Result<FinishedWorkflow, LlmError> {
        let mut prompt = format!(
            "{}\n\nCurrent time: {}\n",
            prompts::FINISH_INSTRUCTIONS,
            chrono::Utc::now().to_rfc3339()
        );
        if let Some(reason) = &control.reason {
            prompt.push_str(&format!("Stop reason: {reason}\n"));
        }
        prompt.push('\n');
        prompt.push_str(&prompts::transcript(messages));

        let text = self.complete_text(prompt).await?;
        match parse_finish_reply(&text) {
            Some(finished) => Ok(finished),
            None => {
                tracing::warn!("finish reply was not valid JSON, keeping raw text as summary");
                let summary = if text.trim().is_empty() {
                    control
                        .reason
                        .clone()
                        .unwrap_or_else(|| "Workflow finished".to_string())
                } else {
                    text.trim().to_string()
                };
                Ok(FinishedWorkflow::summary_only(summary))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{
        CompletionResponse, FinishReason, ToolCall, ToolCompletionResponse,
    };
    use std::sync::Mutex;

    /// Replays canned replies and records the requests it saw.
    struct CannedProvider {
        text: Mutex<Vec<String>>,
        tools: Mutex<Vec<ToolCompletionResponse>>,
        seen_tools: Mutex<Vec<Vec<String>>>,
    }

    impl CannedProvider {
        fn text(replies: &[&str]) -> Self {
            Self {
                text: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
                tools: Mutex::new(Vec::new()),
                seen_tools: Mutex::new(Vec::new()),
            }
        }

        fn tools(reply: ToolCompletionResponse) -> Self {
            Self {
                text: Mutex::new(Vec::new()),
                tools: Mutex::new(vec![reply]),
                seen_tools: Mutex::new(Vec::new()),
            }
        }
    }

    fn tool_reply(content: Option<&str>, calls: Vec<ToolCall>) -> ToolCompletionResponse {
        ToolCompletionResponse {
            content: content.map(String::from),
            tool_calls: calls,
            input_tokens: 1,
            output_tokens: 1,
            finish_reason: FinishReason::Stop,
        }
    }

    #[async_trait]
    impl LlmProvider for CannedProvider {
        fn model_name(&self) -> &str {
            "canned"
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            let content = self.text.lock().unwrap().pop().unwrap_or_default();
            Ok(CompletionResponse {
                content,
                input_tokens: 1,
                output_tokens: 1,
                finish_reason: FinishReason::Stop,
            })
        }

        async fn complete_with_tools(
            &self,
            request: ToolCompletionRequest,
        ) -> Result<ToolCompletionResponse, LlmError> {
            self.seen_tools
                .lock()
                .unwrap()
                .push(request.tools.iter().map(|t| t.name.clone()).collect());
            self.tools.lock().unwrap().pop().ok_or(LlmError::InvalidResponse {
                provider: "canned".into(),
                reason: "no reply queued".into(),
            })
        }
    }

    #[tokio::test]
    async fn stop_tool_call_becomes_stop() {
        let provider = Arc::new(CannedProvider::tools(tool_reply(
            None,
            vec![ToolCall {
                id: "1".into(),
                name: STOP_TOOL_NAME.into(),
                arguments: serde_json::json!({"reason": "inbox empty"}),
            }],
        )));
        let reasoning = Reasoning::new(provider.clone());
        let decision = reasoning.decide(&[ChatMessage::user("go")], &[]).await.unwrap();
        assert_eq!(
            decision,
            Decision::Stop {
                reason: "inbox empty".into()
            }
        );
        assert_eq!(provider.seen_tools.lock().unwrap()[0], vec![STOP_TOOL_NAME]);
    }

    #[tokio::test]
    async fn other_tool_calls_pass_through() {
        let call = ToolCall {
            id: "1".into(),
            name: "thinking".into(),
            arguments: serde_json::json!({"thought": "plan"}),
        };
        let provider = Arc::new(CannedProvider::tools(tool_reply(
            Some("planning"),
            vec![call.clone()],
        )));
        let decision = Reasoning::new(provider)
            .decide(&[ChatMessage::user("go")], &[])
            .await
            .unwrap();
        assert_eq!(
            decision,
            Decision::ToolCalls {
                content: Some("planning".into()),
                calls: vec![call],
            }
        );
    }

    #[tokio::test]
    async fn inline_stop_signal_in_text() {
        let provider = Arc::new(CannedProvider::tools(tool_reply(
            Some(r#"All done. {"shouldStop": true, "reason": "nothing left"}"#),
            vec![],
        )));
        let decision = Reasoning::new(provider)
            .decide(&[ChatMessage::user("go")], &[])
            .await
            .unwrap();
        assert_eq!(
            decision,
            Decision::Stop {
                reason: "nothing left".into()
            }
        );
    }

    #[tokio::test]
    async fn plain_text_is_a_response() {
        let provider = Arc::new(CannedProvider::tools(tool_reply(Some("thinking aloud"), vec![])));
        let decision = Reasoning::new(provider)
            .decide(&[ChatMessage::user("go")], &[])
            .await
            .unwrap();
        assert_eq!(
            decision,
            Decision::Respond {
                content: "thinking aloud".into()
            }
        );
    }

    #[tokio::test]
    async fn finish_parses_schedule() {
        let reply = r#"```json
{"summary": "replied to two issues", "schedule": {"nextWorkflowPrompt": "check replies", "secondsUntilNextWorkflow": 900}}
```"#;
        let provider = Arc::new(CannedProvider::text(&[reply]));
        let finished = Reasoning::new(provider)
            .finish(&[ChatMessage::user("go")], &WorkflowControl::default())
            .await
            .unwrap();
        assert_eq!(finished.summary, "replied to two issues");
        assert_eq!(finished.next_workflow_prompt.as_deref(), Some("check replies"));
        assert_eq!(finished.seconds_until_next_workflow, Some(900));
    }

    #[test]
    fn finish_drops_follow_up_beyond_horizon() {
        let reply = r#"{"summary": "done", "schedule": {"nextWorkflowPrompt": "much later", "secondsUntilNextWorkflow": 1000000000000000}}"#;
        let finished = parse_finish_reply(reply).unwrap();
        assert_eq!(finished, FinishedWorkflow::summary_only("done"));
    }

    #[tokio::test]
    async fn finish_falls_back_to_raw_text() {
        let provider = Arc::new(CannedProvider::text(&["Did the work, no JSON here."]));
        let finished = Reasoning::new(provider)
            .finish(&[ChatMessage::user("go")], &WorkflowControl::default())
            .await
            .unwrap();
        assert_eq!(finished, FinishedWorkflow::summary_only("Did the work, no JSON here."));
    }

    #[tokio::test]
    async fn empty_summary_is_an_error() {
        let provider = Arc::new(CannedProvider::text(&["   "]));
        let err = Reasoning::new(provider)
            .summarize(&[ChatMessage::user("a")])
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
    }

    #[test]
    fn stop_signal_false_is_ignored() {
        assert_eq!(parse_stop_signal(r#"{"shouldStop": false}"#), None);
        assert_eq!(
            parse_stop_signal(r#"{"shouldStop": true}"#).as_deref(),
            Some("Stop requested")
        );
    }
}
