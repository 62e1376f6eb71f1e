//! 错误恢复引擎
//!
//! Agent 循环在遇到无法解释的模型输出或格式错误的分镜时询问 RecoveryEngine：
//! 次数未用完则返回 RetryWithPrompt（附纠正提示），否则 Abort。
//! 传输层错误（限流、鉴权、不可用）一律 Abort，退避由调用方决定。

use crate::core::{ModelErrorKind, ModelServiceError, RecoveryAction};

/// 循环中可恢复性待判定的故障
#[derive(Debug)]
pub enum LoopFault<'a> {
    /// 模型既没有给出文本也没有给出工具调用
    EmptyReply,
    /// 模型服务调用失败
    Model(&'a ModelServiceError),
    /// 分镜输出无法解析为固定结构
    Storyboard(&'a str),
}

/// 根据故障类型与已用重试次数给出动作
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    clarification_retries: u32,
    storyboard_retries: u32,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

impl RecoveryEngine {
    pub fn new(clarification_retries: u32, storyboard_retries: u32) -> Self {
        Self {
            clarification_retries,
            storyboard_retries,
        }
    }

    /// `attempts` 为该类故障在本次运行中已经重试过的次数
    pub fn handle(&self, fault: &LoopFault<'_>, attempts: u32) -> RecoveryAction {
        match fault {
            LoopFault::EmptyReply if attempts < self.clarification_retries => {
                RecoveryAction::RetryWithPrompt(
                    "Your previous reply contained neither text nor a tool call. \
                     Either call one of the provided tools or reply with your final answer as plain text."
                        .to_string(),
                )
            }
            LoopFault::Model(e)
                if e.kind == ModelErrorKind::Malformed && attempts < self.clarification_retries =>
            {
                RecoveryAction::RetryWithPrompt(format!(
                    "Your previous reply could not be interpreted ({}). \
                     Either call one of the provided tools with valid JSON arguments or reply with plain text.",
                    e.message
                ))
            }
            LoopFault::Storyboard(detail) if attempts < self.storyboard_retries => {
                RecoveryAction::RetryWithPrompt(format!(
                    "The storyboard you returned is not valid: {detail}. \
                     Return valid structured output: ONLY a JSON object of the form \
                     {{\"slides\": [{{\"title\": string, \"bullets\": [string], \"imagePrompt\": string, \"voiceover\": string}}]}} \
                     with no markdown fences and no commentary."
                ))
            }
            _ => RecoveryAction::Abort,
        }
    }
}
