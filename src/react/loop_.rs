//! Agent 主循环
//!
//! AWAITING_MODEL -> {TOOL_CALL_PENDING -> AWAITING_MODEL}* -> DONE | FAILED
//!
//! 发送 system + 历史 + 任务提示与工具声明；模型返回文本则结束，返回工具调用则按顺序执行、
//! 将结果以 tool 消息写回后继续。工具调用累计达到上限时追加一条强制作答指令，
//! 不带工具再请求一次，接受返回的文本（为空时使用兜底文本）。
//! 工具错误写回对话由模型自行纠正；模型服务错误与无法解释的回复向上返回 AgentError。

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, LoopFault, ModelErrorKind, ModelServiceError, RecoveryAction, RecoveryEngine};
use crate::llm::{ModelClient, ModelReply, ToolSpec};
use crate::memory::{Conversation, Role, Turn};
use crate::react::AgentEvent;
use crate::roles::{parse_storyboard, prompts, AgentSpec, Artifact, OutputShape};
use crate::tools::ToolExecutor;

/// 工具结果预览最大字符数
const RESULT_PREVIEW_CHARS: usize = 200;

/// 单次运行的依赖与可选项
pub struct AgentRun<'a> {
    pub project_id: &'a str,
    pub spec: &'a AgentSpec,
    pub model: &'a dyn ModelClient,
    pub executor: &'a ToolExecutor,
    pub recovery: &'a RecoveryEngine,
    pub cancel_token: CancellationToken,
    /// 可选：进度事件通道
    pub event_tx: Option<&'a UnboundedSender<AgentEvent>>,
}

impl<'a> AgentRun<'a> {
    pub fn new(
        project_id: &'a str,
        spec: &'a AgentSpec,
        model: &'a dyn ModelClient,
        executor: &'a ToolExecutor,
        recovery: &'a RecoveryEngine,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            project_id,
            spec,
            model,
            executor,
            recovery,
            cancel_token,
            event_tx: None,
        }
    }

    pub fn with_event_tx(mut self, tx: &'a UnboundedSender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn emit(&self, ev: AgentEvent) {
        if let Some(tx) = self.event_tx {
            let _ = tx.send(ev);
        }
    }

    fn role(&self) -> String {
        self.spec.role_name.clone()
    }

    fn cancelled(&self, tool_calls: usize) -> AgentError {
        AgentError::Cancelled {
            project_id: self.project_id.to_string(),
            role: self.role(),
            tool_calls,
        }
    }

    fn model_failure(&self, e: ModelServiceError, tool_calls: usize) -> AgentError {
        if e.kind == ModelErrorKind::Malformed {
            AgentError::MalformedResponse {
                project_id: self.project_id.to_string(),
                role: self.role(),
                tool_calls,
                detail: e.message,
            }
        } else {
            AgentError::Model {
                project_id: self.project_id.to_string(),
                role: self.role(),
                tool_calls,
                source: e,
            }
        }
    }
}

/// 运行结果
#[derive(Debug)]
pub struct AgentOutcome {
    pub artifact: Artifact,
    /// 实际执行的工具调用次数
    pub tool_calls: usize,
    /// 模型请求次数
    pub round_trips: usize,
    /// 是否因工具调用上限被强制结束
    pub forced: bool,
    pub conversation: Conversation,
}

/// 强制结束后模型仍未给出文本时的兜底产物
pub fn incomplete_fallback(tool_calls: usize) -> String {
    format!(
        "Analysis incomplete after {tool_calls} tool calls: the model did not produce a final answer \
         from the information gathered."
    )
}

fn preview(text: &str) -> String {
    if text.chars().count() > RESULT_PREVIEW_CHARS {
        format!("{}...", text.chars().take(RESULT_PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

/// 执行一次 Agent 运行
///
/// history 中只保留 user / assistant 轮次（对话历史），追加在 system 之后、任务提示之前。
pub async fn run_agent(
    run: &AgentRun<'_>,
    history: &[Turn],
    user_prompt: &str,
) -> Result<AgentOutcome, AgentError> {
    let spec = run.spec;
    let role = spec.role_name.as_str();
    let project_id = run.project_id;

    let mut conversation = Conversation::new();
    conversation.push(Turn::system(spec.system_prompt.clone()));
    for turn in history
        .iter()
        .filter(|t| matches!(t.role, Role::User | Role::Assistant) && t.tool_calls.is_empty())
    {
        conversation.push(turn.clone());
    }
    conversation.push(Turn::user(user_prompt));

    let tools = if spec.uses_tools() && run.executor.has_tools() {
        run.executor.tool_specs()
    } else {
        Vec::new()
    };
    let max_tool_calls = if tools.is_empty() { 0 } else { spec.max_tool_calls };

    let mut tool_calls = 0usize;
    let mut round_trips = 0usize;
    let mut clarifications = 0u32;
    let mut storyboard_retries = 0u32;
    let mut forced = false;

    loop {
        if run.cancel_token.is_cancelled() {
            tracing::warn!(project_id, role, tool_calls, "agent run cancelled");
            return Err(run.cancelled(tool_calls));
        }

        round_trips += 1;
        run.emit(AgentEvent::RoundStarted {
            role: run.role(),
            round: round_trips,
            tool_calls,
            max_tool_calls,
        });
        tracing::debug!(project_id, role, round = round_trips, tool_calls, forced, "requesting model");

        let offered: &[ToolSpec] = if forced { &[] } else { tools.as_slice() };
        let reply = tokio::select! {
            biased;
            _ = run.cancel_token.cancelled() => {
                tracing::warn!(project_id, role, tool_calls, "agent run cancelled while waiting for model");
                return Err(run.cancelled(tool_calls));
            }
            r = run.model.complete(conversation.turns(), offered) => r,
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                let action = run.recovery.handle(&LoopFault::Model(&e), clarifications);
                match action {
                    RecoveryAction::RetryWithPrompt(prompt) => {
                        clarifications += 1;
                        tracing::warn!(project_id, role, error = %e, "uninterpretable model reply, asking again");
                        run.emit(AgentEvent::Retry {
                            role: run.role(),
                            reason: e.to_string(),
                        });
                        conversation.push(Turn::user(prompt));
                        continue;
                    }
                    RecoveryAction::Abort => {
                        tracing::error!(project_id, role, tool_calls, error = %e, "model service failed");
                        return Err(run.model_failure(e, tool_calls));
                    }
                }
            }
        };

        // 没有调用的 ToolCalls 等同于文本回复
        let reply = match reply {
            ModelReply::ToolCalls { calls, text } if calls.is_empty() => ModelReply::Text(text),
            other => other,
        };

        let text = match reply {
            ModelReply::ToolCalls { calls, text } if !forced && !tools.is_empty() => {
                conversation.push(Turn::assistant_tool_calls(text, calls.clone()));
                for call in &calls {
                    if tool_calls >= max_tool_calls {
                        // 每个调用都必须有对应的 tool 结果
                        conversation.push(Turn::tool(
                            call.id.clone(),
                            "skipped: tool-call budget exhausted",
                        ));
                        continue;
                    }
                    run.emit(AgentEvent::ToolCall {
                        role: run.role(),
                        tool: call.name.clone(),
                        args: call.arguments.clone(),
                    });
                    let result = run.executor.execute(call).await;
                    tool_calls += 1;
                    run.emit(AgentEvent::ToolResult {
                        role: run.role(),
                        tool: call.name.clone(),
                        is_error: result.is_error,
                        preview: preview(&result.content),
                    });
                    conversation.push(Turn::tool(result.call_id, result.content));
                }

                if tool_calls >= max_tool_calls {
                    forced = true;
                    tracing::info!(project_id, role, tool_calls, "tool-call budget reached, forcing final answer");
                    run.emit(AgentEvent::ForcedFinish {
                        role: run.role(),
                        tool_calls,
                    });
                    conversation.push(Turn::system(prompts::force_finish_instruction(tool_calls)));
                }
                continue;
            }
            ModelReply::ToolCalls { text, .. } | ModelReply::Text(text) => {
                if !text.trim().is_empty() {
                    text
                } else if forced {
                    tracing::warn!(project_id, role, tool_calls, "no answer after forced finish, using fallback");
                    incomplete_fallback(tool_calls)
                } else {
                    match run.recovery.handle(&LoopFault::EmptyReply, clarifications) {
                        RecoveryAction::RetryWithPrompt(prompt) => {
                            clarifications += 1;
                            run.emit(AgentEvent::Retry {
                                role: run.role(),
                                reason: "empty reply".to_string(),
                            });
                            conversation.push(Turn::user(prompt));
                            continue;
                        }
                        RecoveryAction::Abort => {
                            return Err(AgentError::MalformedResponse {
                                project_id: project_id.to_string(),
                                role: run.role(),
                                tool_calls,
                                detail: "reply contained neither text nor a usable tool call"
                                    .to_string(),
                            });
                        }
                    }
                }
            }
        };

        let artifact = match spec.output_shape {
            OutputShape::Markdown => Artifact::Markdown(text.clone()),
            OutputShape::JsonStoryboard => match parse_storyboard(&text) {
                Ok(storyboard) => Artifact::Storyboard(storyboard),
                Err(detail) => {
                    let action = run
                        .recovery
                        .handle(&LoopFault::Storyboard(&detail), storyboard_retries);
                    match action {
                        RecoveryAction::RetryWithPrompt(prompt) => {
                            storyboard_retries += 1;
                            tracing::warn!(project_id, role, detail = %detail, "invalid storyboard, asking again");
                            run.emit(AgentEvent::Retry {
                                role: run.role(),
                                reason: detail,
                            });
                            conversation.push(Turn::assistant(text));
                            conversation.push(Turn::user(prompt));
                            continue;
                        }
                        RecoveryAction::Abort => {
                            tracing::error!(project_id, role, detail = %detail, "storyboard still invalid");
                            return Err(AgentError::StoryboardFormat {
                                project_id: project_id.to_string(),
                                role: run.role(),
                                tool_calls,
                                detail,
                            });
                        }
                    }
                }
            },
        };

        conversation.push(Turn::assistant(text));
        run.emit(AgentEvent::Done {
            role: run.role(),
            tool_calls,
            round_trips,
        });
        tracing::info!(project_id, role, tool_calls, round_trips, forced, "agent run finished");
        return Ok(AgentOutcome {
            artifact,
            tool_calls,
            round_trips,
            forced,
            conversation,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModel;
    use crate::memory::ToolCall;
    use crate::tools::{create_repo_tools, RepoToolLimits};
    use serde_json::json;

    struct Fixture {
        _dir: tempfile::TempDir,
        executor: ToolExecutor,
        recovery: RecoveryEngine,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), "{\"name\": \"demo\"}\n").unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/index.js"), "console.log('hi')\n").unwrap();
        let executor = ToolExecutor::new(create_repo_tools(dir.path(), RepoToolLimits::default()), 5);
        Fixture {
            _dir: dir,
            executor,
            recovery: RecoveryEngine::default(),
        }
    }

    fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall::new(id, name, args)
    }

    async fn run_with(
        fx: &Fixture,
        spec: &AgentSpec,
        model: &ScriptedModel,
    ) -> Result<AgentOutcome, AgentError> {
        let run = AgentRun::new("p1", spec, model, &fx.executor, &fx.recovery, CancellationToken::new());
        run_agent(&run, &[], "produce PROJECT.md").await
    }

    #[tokio::test]
    async fn test_two_tool_rounds_then_answer() {
        let fx = fixture();
        let spec = AgentSpec::mapper(5);
        let model = ScriptedModel::new(vec![
            ModelReply::tool_calls(vec![call("c1", "list_tree", json!({"path": "/", "max_depth": 2}))]),
            ModelReply::tool_calls(vec![call("c2", "read_file", json!({"path": "package.json"}))]),
            ModelReply::Text("# demo\n\nA demo project.".into()),
        ]);

        let outcome = run_with(&fx, &spec, &model).await.unwrap();
        assert_eq!(outcome.tool_calls, 2);
        assert_eq!(outcome.round_trips, 3);
        assert!(!outcome.forced);
        assert_eq!(outcome.artifact, Artifact::Markdown("# demo\n\nA demo project.".into()));

        // 工具结果按顺序、带 call_id 写回对话
        let turns = outcome.conversation.turns();
        let tool_turns: Vec<&Turn> = turns.iter().filter(|t| t.role == Role::Tool).collect();
        assert_eq!(tool_turns[0].tool_call_id.as_deref(), Some("c1"));
        assert!(tool_turns[0].content.contains("package.json"));
        assert_eq!(tool_turns[1].tool_call_id.as_deref(), Some("c2"));
        assert!(tool_turns[1].content.contains("demo"));

        let requests = model.requests();
        assert_eq!(requests[0].tool_names, vec!["list_tree", "read_file", "search"]);
        assert_eq!(requests[0].conversation.len(), 2);
    }

    #[tokio::test]
    async fn test_model_that_never_answers_is_forced_to_finish() {
        let fx = fixture();
        let spec = AgentSpec::mapper(5);
        let model = ScriptedModel::default()
            .with_fallback(ModelReply::tool_calls(vec![call("c", "list_tree", json!({}))]));

        let outcome = run_with(&fx, &spec, &model).await.unwrap();
        assert!(outcome.forced);
        assert_eq!(outcome.tool_calls, 5);
        assert_eq!(outcome.round_trips, 6);
        assert_eq!(outcome.artifact, Artifact::Markdown(incomplete_fallback(5)));

        let requests = model.requests();
        let last = requests.last().unwrap();
        assert!(last.tool_names.is_empty());
        let instruction = last.conversation.last().unwrap();
        assert_eq!(instruction.role, Role::System);
        assert!(instruction.content.contains("Do not call any more tools"));
    }

    #[tokio::test]
    async fn test_forced_finish_accepts_text() {
        let fx = fixture();
        let spec = AgentSpec::mapper(2);
        let model = ScriptedModel::new(vec![
            ModelReply::tool_calls(vec![
                call("a", "list_tree", json!({})),
                call("b", "read_file", json!({"path": "package.json"})),
                call("c", "read_file", json!({"path": "src/index.js"})),
            ]),
            ModelReply::Text("best effort".into()),
        ]);

        let outcome = run_with(&fx, &spec, &model).await.unwrap();
        assert!(outcome.forced);
        assert_eq!(outcome.tool_calls, 2);
        assert_eq!(outcome.artifact, Artifact::Markdown("best effort".into()));

        let skipped = outcome
            .conversation
            .turns()
            .iter()
            .find(|t| t.tool_call_id.as_deref() == Some("c"))
            .unwrap();
        assert!(skipped.content.starts_with("skipped"));
    }

    #[tokio::test]
    async fn test_tool_errors_are_fed_back() {
        let fx = fixture();
        let spec = AgentSpec::mapper(5);
        let model = ScriptedModel::new(vec![
            ModelReply::tool_calls(vec![
                call("c1", "read_file", json!({"path": "../../etc/passwd"})),
                call("c2", "read_file", json!({"path": "missing.txt"})),
                call("c3", "delete_everything", json!({})),
            ]),
            ModelReply::Text("recovered".into()),
        ]);

        let outcome = run_with(&fx, &spec, &model).await.unwrap();
        assert_eq!(outcome.tool_calls, 3);
        let contents: Vec<String> = outcome
            .conversation
            .turns()
            .iter()
            .filter(|t| t.role == Role::Tool)
            .map(|t| t.content.clone())
            .collect();
        assert!(contents[0].contains("path escapes repository root"));
        assert!(contents[1].contains("file not found"));
        assert!(contents[2].contains("unknown tool"));
    }

    #[tokio::test]
    async fn test_empty_reply_gets_one_clarification() {
        let fx = fixture();
        let spec = AgentSpec::mapper(5);

        let model = ScriptedModel::new(vec![ModelReply::Text("  ".into()), ModelReply::Text("ok".into())]);
        let outcome = run_with(&fx, &spec, &model).await.unwrap();
        assert_eq!(outcome.artifact, Artifact::Markdown("ok".into()));
        assert_eq!(outcome.round_trips, 2);

        let model = ScriptedModel::new(vec![ModelReply::Text(String::new()), ModelReply::Text(String::new())]);
        let err = run_with(&fx, &spec, &model).await.unwrap_err();
        assert!(matches!(err, AgentError::MalformedResponse { tool_calls: 0, .. }));
    }

    #[tokio::test]
    async fn test_transport_errors_propagate_with_context() {
        let fx = fixture();
        let spec = AgentSpec::mapper(5);
        let model = ScriptedModel::with_results(vec![
            Ok(ModelReply::tool_calls(vec![call("c1", "list_tree", json!({}))])),
            Err(ModelServiceError::new(ModelErrorKind::RateLimited, "slow down").with_status(429)),
        ]);

        let err = run_with(&fx, &spec, &model).await.unwrap_err();
        match err {
            AgentError::Model {
                project_id,
                role,
                tool_calls,
                source,
            } => {
                assert_eq!(project_id, "p1");
                assert_eq!(role, "mapper");
                assert_eq!(tool_calls, 1);
                assert_eq!(source.kind, ModelErrorKind::RateLimited);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(model.request_count(), 2);
    }

    #[tokio::test]
    async fn test_malformed_model_error_is_retried_once() {
        let fx = fixture();
        let spec = AgentSpec::mapper(5);
        let model = ScriptedModel::with_results(vec![
            Err(ModelServiceError::malformed("bad json")),
            Ok(ModelReply::Text("fine".into())),
        ]);
        let outcome = run_with(&fx, &spec, &model).await.unwrap();
        assert_eq!(outcome.artifact, Artifact::Markdown("fine".into()));
    }

    fn storyboard_reply(slides: usize) -> String {
        let slides: Vec<String> = (0..slides)
            .map(|i| {
                format!(
                    r#"{{"title":"T{i}","bullets":["b"],"imagePrompt":"p","voiceover":"v{i}"}}"#
                )
            })
            .collect();
        format!(r#"{{"slides":[{}]}}"#, slides.join(","))
    }

    #[tokio::test]
    async fn test_storyboard_retry_then_success() {
        let fx = fixture();
        let spec = AgentSpec::storyboard(0);
        let model = ScriptedModel::new(vec![
            ModelReply::Text("Sure! Here are some slides.".into()),
            ModelReply::Text(storyboard_reply(8)),
        ]);

        let outcome = run_with(&fx, &spec, &model).await.unwrap();
        let storyboard = outcome.artifact.as_storyboard().unwrap();
        assert_eq!(storyboard.slides.len(), 8);

        let requests = model.requests();
        assert!(requests[0].tool_names.is_empty());
        let correction = requests[1].conversation.last().unwrap();
        assert!(correction.content.contains("Return valid structured output"));
    }

    #[tokio::test]
    async fn test_storyboard_fails_after_one_retry() {
        let fx = fixture();
        let spec = AgentSpec::storyboard(0);
        let model = ScriptedModel::new(vec![
            ModelReply::Text("{\"slides\": []}".into()),
            ModelReply::Text("still not it".into()),
        ]);
        let err = run_with(&fx, &spec, &model).await.unwrap_err();
        assert!(matches!(err, AgentError::StoryboardFormat { ref role, .. } if role == "storyboard"));
        assert_eq!(model.request_count(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_at_boundary() {
        let fx = fixture();
        let spec = AgentSpec::mapper(5);
        let model = ScriptedModel::default().with_fallback(ModelReply::Text("never".into()));
        let token = CancellationToken::new();
        token.cancel();
        let run = AgentRun::new("p1", &spec, &model, &fx.executor, &fx.recovery, token);

        let err = run_agent(&run, &[], "go").await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled { tool_calls: 0, .. }));
        assert_eq!(model.request_count(), 0);
    }

    #[tokio::test]
    async fn test_history_and_events() {
        let fx = fixture();
        let spec = AgentSpec::qa(3, false);
        let model = ScriptedModel::new(vec![
            ModelReply::tool_calls(vec![call("c1", "search", json!({"pattern": "console"}))]),
            ModelReply::Text("It logs hi.".into()),
        ]);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let run = AgentRun::new("p1", &spec, &model, &fx.executor, &fx.recovery, CancellationToken::new())
            .with_event_tx(&tx);
        let history = vec![Turn::user("what is this?"), Turn::assistant("A demo.")];

        let outcome = run_agent(&run, &history, "what does index.js print?").await.unwrap();
        assert_eq!(outcome.artifact, Artifact::Markdown("It logs hi.".into()));

        let first = &model.requests()[0].conversation;
        assert_eq!(first.len(), 4);
        assert_eq!(first[1].content, "what is this?");
        assert_eq!(first[3].content, "what does index.js print?");

        drop(run);
        drop(tx);
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        assert!(matches!(events[0], AgentEvent::RoundStarted { round: 1, .. }));
        assert!(events.iter().any(|e| matches!(e, AgentEvent::ToolResult { is_error: false, .. })));
        assert!(matches!(events.last(), Some(AgentEvent::Done { tool_calls: 1, round_trips: 2, .. })));
    }
}
