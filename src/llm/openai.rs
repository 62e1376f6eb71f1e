//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url），使用原生 tool calling：
//! 对话中的 Turn 转为 Chat Completions 消息，ToolSpec 转为 function tools，
//! 回复中的 tool_calls 解析为 ToolCall。错误按类 HTTP 状态分类为 ModelServiceError。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionMessageToolCall, ChatCompletionMessageToolCalls,
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionTool, ChatCompletionTools,
    CreateChatCompletionRequestArgs, FunctionCall, FunctionObject,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::core::{ModelErrorKind, ModelServiceError};
use crate::llm::{ModelClient, ModelReply, ToolSpec};
use crate::memory::{Role, ToolCall, Turn};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client、model 名与采样温度
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            temperature: 0.2,
            usage: TokenUsage::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn to_openai_messages(
        turns: &[Turn],
    ) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        turns
            .iter()
            .map(|t| -> Result<ChatCompletionRequestMessage, OpenAIError> {
                Ok(match t.role {
                    Role::System => ChatCompletionRequestSystemMessageArgs::default()
                        .content(t.content.clone())
                        .build()?
                        .into(),
                    Role::User => ChatCompletionRequestUserMessageArgs::default()
                        .content(t.content.clone())
                        .build()?
                        .into(),
                    Role::Assistant => {
                        let mut args = ChatCompletionRequestAssistantMessageArgs::default();
                        if !t.content.is_empty() || t.tool_calls.is_empty() {
                            args.content(t.content.clone());
                        }
                        if !t.tool_calls.is_empty() {
                            args.tool_calls(
                                t.tool_calls
                                    .iter()
                                    .map(|c| {
                                        ChatCompletionMessageToolCalls::Function(
                                            ChatCompletionMessageToolCall {
                                                id: c.id.clone(),
                                                function: FunctionCall {
                                                    name: c.name.clone(),
                                                    arguments: c.arguments.to_string(),
                                                },
                                            },
                                        )
                                    })
                                    .collect::<Vec<_>>(),
                            );
                        }
                        args.build()?.into()
                    }
                    Role::Tool => ChatCompletionRequestToolMessageArgs::default()
                        .content(t.content.clone())
                        .tool_call_id(t.tool_call_id.clone().unwrap_or_default())
                        .build()?
                        .into(),
                })
            })
            .collect()
    }

    fn to_openai_tools(tools: &[ToolSpec]) -> Vec<ChatCompletionTools> {
        tools
            .iter()
            .map(|t| {
                ChatCompletionTools::Function(ChatCompletionTool {
                    function: FunctionObject {
                        name: t.name.clone(),
                        description: Some(t.description.clone()),
                        parameters: Some(t.parameters.clone()),
                        strict: None,
                    },
                })
            })
            .collect()
    }
}

/// 将模型返回的 arguments 字符串解析为 JSON；无法解析时原样保留为字符串，交由工具报告参数错误
fn parse_arguments(raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

/// HTTP 状态码到错误分类
pub fn classify_status(status: u16) -> ModelErrorKind {
    match status {
        429 => ModelErrorKind::RateLimited,
        401 | 403 => ModelErrorKind::Unauthorized,
        408 | 500..=599 => ModelErrorKind::Unavailable,
        _ => ModelErrorKind::Other,
    }
}

/// API 错误对象中的 code / type 到错误分类
fn classify_api_code(code: &str) -> ModelErrorKind {
    let code = code.to_ascii_lowercase();
    if code.contains("rate_limit") || code.contains("quota") {
        ModelErrorKind::RateLimited
    } else if code.contains("api_key")
        || code.contains("auth")
        || code.contains("permission")
        || code.contains("unauthorized")
    {
        ModelErrorKind::Unauthorized
    } else if code.contains("server_error") || code.contains("overloaded") || code.contains("unavailable") {
        ModelErrorKind::Unavailable
    } else {
        ModelErrorKind::Other
    }
}

fn classify_error(err: OpenAIError) -> ModelServiceError {
    match err {
        OpenAIError::Reqwest(e) => {
            if let Some(status) = e.status() {
                ModelServiceError::new(classify_status(status.as_u16()), e.to_string())
                    .with_status(status.as_u16())
            } else if e.is_timeout() || e.is_connect() {
                ModelServiceError::new(ModelErrorKind::Unavailable, e.to_string())
            } else {
                ModelServiceError::new(ModelErrorKind::Other, e.to_string())
            }
        }
        OpenAIError::ApiError(api) => {
            let code = api
                .code
                .clone()
                .or_else(|| api.r#type.clone())
                .unwrap_or_default();
            ModelServiceError::new(classify_api_code(&code), api.message)
        }
        OpenAIError::JSONDeserialize(e, content) => {
            let preview: String = content.chars().take(200).collect();
            ModelServiceError::malformed(format!("{e}: {preview}"))
        }
        other => ModelServiceError::new(ModelErrorKind::Other, other.to_string()),
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(
        &self,
        conversation: &[Turn],
        tools: &[ToolSpec],
    ) -> Result<ModelReply, ModelServiceError> {
        let messages = Self::to_openai_messages(conversation).map_err(classify_error)?;

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .messages(messages)
            .temperature(self.temperature);
        if !tools.is_empty() {
            args.tools(Self::to_openai_tools(tools));
        }
        let request = args.build().map_err(classify_error)?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(classify_error)?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let message = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| ModelServiceError::malformed("response contained no choices"))?;

        let text = message.content.unwrap_or_default();
        let calls: Vec<ToolCall> = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .filter_map(|c| match c {
                ChatCompletionMessageToolCalls::Function(f) => Some(ToolCall::new(
                    f.id,
                    f.function.name,
                    parse_arguments(&f.function.arguments),
                )),
                ChatCompletionMessageToolCalls::Custom(_) => None,
            })
            .collect();

        if calls.is_empty() {
            Ok(ModelReply::Text(text))
        } else {
            Ok(ModelReply::ToolCalls { calls, text })
        }
    }
}
