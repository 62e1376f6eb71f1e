//! Onboarder 运行时
//!
//! 把仓库会话缓存、仓库工具、模型客户端与产物存储组装成四个顶层动作：
//! analyze_project（生成 PROJECT.md）、generate_document、answer_question、generate_storyboard。
//! 每个动作是一次独立的 Agent 运行，可并发执行；同一项目的克隆由 SessionCache 串行化。

use std::path::Path;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentSection, AppConfig, LlmSection};
use crate::core::{AgentError, RecoveryEngine, RunSupervisor};
use crate::llm::{create_deepseek_client, ModelClient, ModelReply, OpenAiClient, ScriptedModel};
use crate::memory::{ArtifactStore, Project, ProjectStatus, SqliteStore, StoredArtifact, Turn};
use crate::react::{run_agent, AgentEvent, AgentOutcome, AgentRun};
use crate::repo::{parse_repo_url, GitCliCloner, RepoSession, SessionCache};
use crate::roles::{ensure_title, prompts, AgentSpec, DocType, Storyboard};
use crate::tools::{create_repo_tools, RepoToolLimits, ToolExecutor};

/// 按配置创建模型客户端：openai / deepseek / mock
pub fn create_model_from_config(llm: &LlmSection, temperature: f32) -> Arc<dyn ModelClient> {
    match llm.provider.to_lowercase().as_str() {
        "deepseek" => {
            let client = create_deepseek_client(llm.model.as_deref(), llm.api_key.as_deref());
            tracing::info!(model = client.model_name(), "using DeepSeek model");
            Arc::new(client.with_temperature(temperature))
        }
        "mock" => {
            tracing::warn!("using scripted mock model, output is placeholder text");
            Arc::new(dry_run_model())
        }
        _ => {
            let model = llm.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
            tracing::info!(model = %model, "using OpenAI-compatible model");
            Arc::new(
                OpenAiClient::new(llm.base_url.as_deref(), &model, llm.api_key.as_deref())
                    .with_temperature(temperature),
            )
        }
    }
}

/// 离线试运行用的模型：总是给出同一个可解析为分镜的占位回复
fn dry_run_model() -> ScriptedModel {
    let placeholder = r#"{"slides": [{"title": "Dry Run", "bullets": ["No model configured"], "imagePrompt": "a blank slide", "voiceover": "This content was produced without a language model."}]}"#;
    ScriptedModel::default().with_fallback(ModelReply::Text(placeholder.to_string()))
}

/// 仓库上手助手：一次构建，多次调用
pub struct Onboarder {
    sessions: SessionCache,
    model: Arc<dyn ModelClient>,
    storyboard_model: Arc<dyn ModelClient>,
    store: Arc<dyn ArtifactStore>,
    recovery: RecoveryEngine,
    limits: RepoToolLimits,
    tool_timeout_secs: u64,
    agent: AgentSection,
    cancel_token: Option<CancellationToken>,
    event_tx: Option<UnboundedSender<AgentEvent>>,
}

impl Onboarder {
    pub fn new(
        cfg: &AppConfig,
        sessions: SessionCache,
        model: Arc<dyn ModelClient>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            sessions,
            storyboard_model: Arc::clone(&model),
            model,
            store,
            recovery: RecoveryEngine::new(
                cfg.agent.clarification_retries,
                cfg.agent.storyboard_retries,
            ),
            limits: cfg.tools.to_tool_limits(),
            tool_timeout_secs: cfg.tools.tool_timeout_secs,
            agent: cfg.agent.clone(),
            cancel_token: None,
            event_tx: None,
        }
    }

    /// 按配置组装：git 克隆、SQLite 存储、配置指定的模型
    pub fn from_config(cfg: &AppConfig) -> Result<Self, AgentError> {
        let cloner = Arc::new(GitCliCloner::new(
            cfg.session.clone_depth,
            cfg.session.clone_timeout_secs,
        ));
        let sessions = SessionCache::new(&cfg.app.workspace_root, cloner, cfg.session.ttl());

        if let Some(parent) = cfg.app.database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::Config(format!("{}: {e}", parent.display())))?;
        }
        let store: Arc<dyn ArtifactStore> = Arc::new(SqliteStore::open(&cfg.app.database_path)?);

        let model = create_model_from_config(&cfg.llm, cfg.llm.temperature);
        let storyboard_model = create_model_from_config(&cfg.llm, cfg.llm.storyboard_temperature);
        Ok(Self::new(cfg, sessions, model, store).with_storyboard_model(storyboard_model))
    }

    /// 分镜角色单独使用的模型（通常温度更高）
    pub fn with_storyboard_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.storyboard_model = model;
        self
    }

    /// 调用方取消令牌：取消后所有进行中的运行在下一步边界结束
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn sessions(&self) -> &SessionCache {
        &self.sessions
    }

    /// 登记仓库地址，返回 pending 状态的新项目
    pub async fn register_project(&self, repo_url: &str) -> Result<Project, AgentError> {
        let parsed = parse_repo_url(repo_url)?;
        let project = self.store.create_project(repo_url.trim(), &parsed.name).await?;
        tracing::info!(project_id = %project.id, repo = %parsed.name, "project registered");
        Ok(project)
    }

    /// 登记并立即分析
    pub async fn analyze(&self, repo_url: &str) -> Result<Project, AgentError> {
        let project = self.register_project(repo_url).await?;
        self.analyze_project(&project.id).await?;
        self.project(&project.id).await
    }

    pub async fn project(&self, project_id: &str) -> Result<Project, AgentError> {
        self.store
            .get_project(project_id)
            .await?
            .ok_or_else(|| AgentError::UnknownProject(project_id.to_string()))
    }

    /// 运行映射角色，保存 PROJECT.md 与 head commit；失败时项目标记为 error
    pub async fn analyze_project(&self, project_id: &str) -> Result<String, AgentError> {
        let project = self.project(project_id).await?;
        self.store
            .set_project_status(project_id, ProjectStatus::Scanning, None)
            .await?;

        match self.map_repository(&project).await {
            Ok(project_md) => Ok(project_md),
            Err(e) => {
                tracing::error!(project_id, error = %e, "repository analysis failed");
                self.store
                    .set_project_status(project_id, ProjectStatus::Error, Some(&e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    async fn map_repository(&self, project: &Project) -> Result<String, AgentError> {
        let session = self
            .sessions
            .get_or_create(&project.id, &project.repo_url)
            .await?;
        let executor = self.executor_for(&session.local_path);
        let spec = AgentSpec::mapper(self.agent.mapper_max_tool_calls);
        let prompt = prompts::mapper_task(&project.repo_name);

        let outcome = self
            .run(&project.id, &spec, self.model.as_ref(), &executor, &[], &prompt)
            .await?;
        let project_md = outcome.artifact.content();
        self.store
            .save_project_context(&project.id, &project_md, Some(&session.head_commit))
            .await?;
        tracing::info!(
            project_id = %project.id,
            head = %session.head_commit,
            tool_calls = outcome.tool_calls,
            "PROJECT.md saved"
        );
        Ok(project_md)
    }

    /// 生成一篇文档；custom_title 为空时使用类型的默认标题
    pub async fn generate_document(
        &self,
        project_id: &str,
        doc_type: DocType,
        custom_title: Option<&str>,
    ) -> Result<StoredArtifact, AgentError> {
        let project = self.project(project_id).await?;
        let project_md = self.project_context(project_id).await?;
        let title = custom_title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .unwrap_or_else(|| doc_type.default_title());

        let session = self.workspace_for(&project).await?;
        let context_only = session.is_none();
        let executor = self.executor_or_empty(session.as_ref());
        let spec = AgentSpec::document(doc_type, self.agent.document_max_tool_calls, context_only);
        let prompt = prompts::document_task(&title, &project_md, context_only);

        let outcome = self
            .run(project_id, &spec, self.model.as_ref(), &executor, &[], &prompt)
            .await?;
        let content = ensure_title(&outcome.artifact.content(), &title);
        self.save(project_id, &spec.role_name, &content, None).await
    }

    /// 并发生成全部标准文档；每篇的结果独立返回
    pub async fn generate_all_documents(
        &self,
        project_id: &str,
    ) -> Vec<(DocType, Result<StoredArtifact, AgentError>)> {
        let runs = DocType::STANDARD.into_iter().map(|doc_type| async move {
            (doc_type, self.generate_document(project_id, doc_type, None).await)
        });
        join_all(runs).await
    }

    /// 回答一个关于仓库的问题；history 为之前的 user / assistant 轮次
    pub async fn answer_question(
        &self,
        project_id: &str,
        question: &str,
        history: &[Turn],
    ) -> Result<StoredArtifact, AgentError> {
        let project = self.project(project_id).await?;
        let project_md = self.project_context(project_id).await?;

        let session = self.workspace_for(&project).await?;
        let executor = self.executor_or_empty(session.as_ref());
        let spec = AgentSpec::qa(self.agent.qa_max_tool_calls, session.is_none());
        let prompt = prompts::qa_task(question, &project_md);

        let outcome = self
            .run(project_id, &spec, self.model.as_ref(), &executor, history, &prompt)
            .await?;
        self.save(project_id, &spec.role_name, &outcome.artifact.content(), None)
            .await
    }

    /// 把已生成的文档改写为视频分镜，分镜与旁白稿一起保存
    pub async fn generate_storyboard(
        &self,
        project_id: &str,
        artifact_id: &str,
    ) -> Result<(StoredArtifact, Storyboard), AgentError> {
        let project = self.project(project_id).await?;
        let source = self
            .store
            .get_artifact(artifact_id)
            .await?
            .filter(|a| a.project_id == project_id)
            .ok_or_else(|| AgentError::UnknownArtifact(artifact_id.to_string()))?;
        let title = document_title(&source.content).unwrap_or_else(|| source.role.clone());
        let project_md = self.store.load_project_context(project_id).await?;

        let spec = AgentSpec::storyboard(self.agent.storyboard_max_tool_calls);
        let executor = if spec.uses_tools() {
            let session = self.workspace_for(&project).await?;
            self.executor_or_empty(session.as_ref())
        } else {
            ToolExecutor::empty()
        };
        let prompt = prompts::storyboard_task(&title, &source.content, project_md.as_deref());

        let outcome = self
            .run(
                project_id,
                &spec,
                self.storyboard_model.as_ref(),
                &executor,
                &[],
                &prompt,
            )
            .await?;
        let storyboard = outcome.artifact.as_storyboard().cloned().ok_or_else(|| {
            AgentError::StoryboardFormat {
                project_id: project_id.to_string(),
                role: spec.role_name.clone(),
                tool_calls: outcome.tool_calls,
                detail: "run did not produce a storyboard".to_string(),
            }
        })?;
        let transcript = storyboard.transcript();
        let saved = self
            .save(project_id, &spec.role_name, &storyboard.to_json(), Some(&transcript))
            .await?;
        tracing::info!(
            project_id,
            artifact_id = %saved.id,
            slides = storyboard.slides.len(),
            "storyboard saved"
        );
        Ok((saved, storyboard))
    }

    async fn project_context(&self, project_id: &str) -> Result<String, AgentError> {
        self.store
            .load_project_context(project_id)
            .await?
            .ok_or_else(|| AgentError::MissingContext(project_id.to_string()))
    }

    /// 取得项目检出；克隆失败且允许降级时返回 None（只凭 PROJECT.md 工作）
    async fn workspace_for(&self, project: &Project) -> Result<Option<RepoSession>, AgentError> {
        match self
            .sessions
            .get_or_create(&project.id, &project.repo_url)
            .await
        {
            Ok(session) => Ok(Some(session)),
            Err(e) if self.agent.context_only_fallback => {
                tracing::warn!(
                    project_id = %project.id,
                    error = %e,
                    "repository unavailable, continuing from PROJECT.md only"
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn executor_for(&self, root: &Path) -> ToolExecutor {
        ToolExecutor::new(
            create_repo_tools(root, self.limits.clone()),
            self.tool_timeout_secs,
        )
    }

    fn executor_or_empty(&self, session: Option<&RepoSession>) -> ToolExecutor {
        match session {
            Some(s) => self.executor_for(&s.local_path),
            None => ToolExecutor::empty(),
        }
    }

    async fn save(
        &self,
        project_id: &str,
        role: &str,
        content: &str,
        transcript: Option<&str>,
    ) -> Result<StoredArtifact, AgentError> {
        let id = self
            .store
            .save_artifact(project_id, role, content, transcript)
            .await?;
        self.store
            .get_artifact(&id)
            .await?
            .ok_or(AgentError::UnknownArtifact(id))
    }

    async fn run(
        &self,
        project_id: &str,
        spec: &AgentSpec,
        model: &dyn ModelClient,
        executor: &ToolExecutor,
        history: &[Turn],
        prompt: &str,
    ) -> Result<AgentOutcome, AgentError> {
        let supervisor = RunSupervisor::new(self.cancel_token.as_ref())
            .with_budget(self.agent.wall_clock_budget());
        let mut run = AgentRun::new(
            project_id,
            spec,
            model,
            executor,
            &self.recovery,
            supervisor.cancel_token(),
        );
        if let Some(tx) = self.event_tx.as_ref() {
            run = run.with_event_tx(tx);
        }

        tracing::info!(
            project_id,
            role = %spec.role_name,
            model = model.model_name(),
            tools = executor.tool_names().len(),
            "agent run started"
        );
        let result = run_agent(&run, history, prompt).await;

        let (prompt_tokens, completion_tokens, total_tokens) = model.token_usage();
        tracing::info!(
            project_id,
            role = %spec.role_name,
            prompt_tokens,
            completion_tokens,
            total_tokens,
            "token usage"
        );
        result
    }
}

/// 文档首行的一级标题
fn document_title(markdown: &str) -> Option<String> {
    markdown
        .lines()
        .find(|l| !l.trim().is_empty())
        .and_then(|l| l.trim().strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_title() {
        assert_eq!(document_title("\n# How It Works\nbody"), Some("How It Works".into()));
        assert_eq!(document_title("## Sub\n# Late"), None);
        assert_eq!(document_title(""), None);
    }

    #[tokio::test]
    async fn test_dry_run_model_produces_storyboard() {
        let model = dry_run_model();
        let reply = model.complete(&[], &[]).await.unwrap();
        match reply {
            ModelReply::Text(text) => assert!(crate::roles::parse_storyboard(&text).is_ok()),
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
