//! 脚本化模型客户端（用于测试，无需 API）
//!
//! 按顺序返回预设回复；脚本用尽后返回 fallback（未设置时报 Unavailable）。
//! 同时记录每次请求收到的对话与工具列表，便于断言循环行为。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::{ModelErrorKind, ModelServiceError};
use crate::llm::{ModelClient, ModelReply, ToolSpec};
use crate::memory::Turn;

/// 一次被记录的请求
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub conversation: Vec<Turn>,
    pub tool_names: Vec<String>,
}

#[derive(Debug, Default)]
struct ScriptState {
    replies: VecDeque<Result<ModelReply, ModelServiceError>>,
    fallback: Option<ModelReply>,
    requests: Vec<RecordedRequest>,
}

/// 按脚本回复的模型
#[derive(Debug, Default)]
pub struct ScriptedModel {
    state: Mutex<ScriptState>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ModelReply>) -> Self {
        Self::with_results(replies.into_iter().map(Ok).collect())
    }

    pub fn with_results(replies: Vec<Result<ModelReply, ModelServiceError>>) -> Self {
        Self {
            state: Mutex::new(ScriptState {
                replies: replies.into(),
                ..Default::default()
            }),
        }
    }

    /// 脚本用尽后重复返回的回复
    pub fn with_fallback(self, reply: ModelReply) -> Self {
        if let Ok(mut s) = self.state.lock() {
            s.fallback = Some(reply);
        }
        self
    }

    pub fn push(&self, reply: Result<ModelReply, ModelServiceError>) {
        if let Ok(mut s) = self.state.lock() {
            s.replies.push_back(reply);
        }
    }

    /// 已收到的请求（按时间顺序）
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state
            .lock()
            .map(|s| s.requests.clone())
            .unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().map(|s| s.requests.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        conversation: &[Turn],
        tools: &[ToolSpec],
    ) -> Result<ModelReply, ModelServiceError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ModelServiceError::new(ModelErrorKind::Other, "script state poisoned"))?;
        state.requests.push(RecordedRequest {
            conversation: conversation.to_vec(),
            tool_names: tools.iter().map(|t| t.name.clone()).collect(),
        });
        match state.replies.pop_front() {
            Some(reply) => reply,
            None => state.fallback.clone().ok_or_else(|| {
                ModelServiceError::new(ModelErrorKind::Unavailable, "script exhausted")
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replies_in_order_then_fallback() {
        let model = ScriptedModel::new(vec![ModelReply::Text("one".into())])
            .with_fallback(ModelReply::Text("again".into()));
        let turns = vec![Turn::user("hi")];

        assert_eq!(model.complete(&turns, &[]).await.unwrap(), ModelReply::Text("one".into()));
        assert_eq!(model.complete(&turns, &[]).await.unwrap(), ModelReply::Text("again".into()));
        assert_eq!(model.request_count(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_script_is_unavailable() {
        let model = ScriptedModel::default();
        let err = model.complete(&[], &[]).await.unwrap_err();
        assert_eq!(err.kind, ModelErrorKind::Unavailable);
    }
}
