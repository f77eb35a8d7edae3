use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

/// 系统统一错误类型
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum PiError {
    // === 输入错误 ===
    #[error("请求无效: {reason}")]
    InvalidRequest { reason: String },

    #[error("资源未找到: {resource}")]
    NotFound { resource: String },

    #[error("验证失败: {message}")]
    Validation { message: String },

    #[error("模板错误 ({name}): {message}")]
    Template { name: String, message: String },

    // === 上游服务错误 ===
    #[error("向量存储错误: {operation} 失败: {message}")]
    VectorStore { operation: String, message: String },

    #[error("嵌入服务错误 ({provider}): {message}")]
    EmbeddingService {
        provider: String,
        message: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    #[error("LLM 服务错误 ({provider}): {message}")]
    LlmService {
        provider: String,
        message: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    #[error("重排服务错误 ({provider}): {message}")]
    Rerank { provider: String, message: String },

    #[error("外部服务不可用: {service}")]
    ServiceUnavailable {
        service: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    // === 系统错误 ===
    #[error("内部系统错误: {message}")]
    Internal {
        message: String,
        details: Option<String>,
    },

    #[error("配置错误: {key} - {reason}")]
    Configuration { key: String, reason: String },

    #[error("序列化错误 ({format}): {message}")]
    Serialization { format: String, message: String },

    #[error("网络错误: {operation}: {message}")]
    Network { operation: String, message: String },

    #[error("超时错误: {operation} 超过 {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("并发错误: {operation}: {message}")]
    Concurrency { operation: String, message: String },

    #[error("操作已取消: {operation}")]
    Cancelled { operation: String },

    #[error("not implemented: {feature}")]
    NotImplemented { feature: String },

    // === 复合错误 ===
    #[error("{failed}/{total} failed: {details}")]
    PartialFailure {
        failed: usize,
        total: usize,
        details: String,
    },

    #[error("{stage} 阶段失败: {source}")]
    Pipeline {
        stage: String,
        #[source]
        source: Box<PiError>,
    },
}

/// 错误严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,      // 可预期的输入错误
    Medium,   // 上游可降级的错误
    High,     // 影响核心功能的错误
    Critical, // 系统级严重错误
}

/// 错误元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetadata {
    pub error_id: String,
    pub severity: ErrorSeverity,
    pub component: String,
    pub operation: Option<String>,
    pub request_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub context: std::collections::HashMap<String, String>,
}

impl PiError {
    /// 用上下文阶段包装上游硬错误
    pub fn in_stage(stage: &str, source: PiError) -> Self {
        PiError::Pipeline {
            stage: stage.to_string(),
            source: Box::new(source),
        }
    }

    /// 获取错误的严重级别
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PiError::InvalidRequest { .. }
            | PiError::NotFound { .. }
            | PiError::Validation { .. }
            | PiError::Template { .. }
            | PiError::Cancelled { .. }
            | PiError::NotImplemented { .. } => ErrorSeverity::Low,
            PiError::LlmService { .. }
            | PiError::EmbeddingService { .. }
            | PiError::Rerank { .. }
            | PiError::ServiceUnavailable { .. }
            | PiError::Network { .. }
            | PiError::Timeout { .. }
            | PiError::PartialFailure { .. } => ErrorSeverity::Medium,
            PiError::VectorStore { .. }
            | PiError::Serialization { .. }
            | PiError::Concurrency { .. } => ErrorSeverity::High,
            PiError::Internal { .. } | PiError::Configuration { .. } => ErrorSeverity::Critical,
            PiError::Pipeline { source, .. } => source.severity(),
        }
    }

    /// 是否为可重试错误
    pub fn is_retryable(&self) -> bool {
        match self {
            PiError::ServiceUnavailable { retry_after, .. } => retry_after.is_some(),
            PiError::Network { .. } | PiError::Timeout { .. } => true,
            PiError::LlmService { retry_after, .. }
            | PiError::EmbeddingService { retry_after, .. } => retry_after.is_some(),
            PiError::Concurrency { .. } => true,
            PiError::Pipeline { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// 获取重试延迟时间
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            PiError::ServiceUnavailable { retry_after, .. }
            | PiError::LlmService { retry_after, .. }
            | PiError::EmbeddingService { retry_after, .. } => *retry_after,
            PiError::Network { .. } => Some(std::time::Duration::from_millis(500)),
            PiError::Timeout { .. } => Some(std::time::Duration::from_millis(1000)),
            PiError::Concurrency { .. } => Some(std::time::Duration::from_millis(100)),
            PiError::Pipeline { source, .. } => source.retry_after(),
            _ => None,
        }
    }

    /// 记录错误日志
    pub fn log(&self, metadata: &ErrorMetadata) {
        match metadata.severity {
            ErrorSeverity::Low => {
                warn!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    request_id = ?metadata.request_id,
                    error = %self,
                    "输入错误"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    request_id = ?metadata.request_id,
                    error = %self,
                    context = ?metadata.context,
                    "上游错误"
                );
            }
            ErrorSeverity::High | ErrorSeverity::Critical => {
                error!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    request_id = ?metadata.request_id,
                    error = %self,
                    context = ?metadata.context,
                    severity = ?metadata.severity,
                    "严重错误"
                );
            }
        }
    }

    /// 获取用户友好的错误消息
    pub fn user_message(&self) -> String {
        match self {
            PiError::InvalidRequest { .. } => "请求参数有误，请检查后重试".to_string(),
            PiError::NotFound { .. } => "请求的资源不存在".to_string(),
            PiError::Validation { .. } => "输入数据验证失败，请检查格式".to_string(),
            PiError::Template { .. } => "模板无效，请检查模板语法".to_string(),
            PiError::ServiceUnavailable { .. } => "服务暂时不可用，请稍后重试".to_string(),
            PiError::Timeout { .. } => "请求超时，请重试".to_string(),
            PiError::NotImplemented { .. } => "暂不支持该导出格式".to_string(),
            PiError::PartialFailure { .. } => "部分文档处理失败".to_string(),
            PiError::Pipeline { source, .. } => source.user_message(),
            _ => "系统内部错误，请联系管理员".to_string(),
        }
    }
}

/// 创建错误元数据的便捷构造器
pub struct ErrorMetadataBuilder {
    metadata: ErrorMetadata,
}

impl ErrorMetadataBuilder {
    pub fn new(component: &str) -> Self {
        Self {
            metadata: ErrorMetadata {
                error_id: uuid::Uuid::new_v4().to_string(),
                severity: ErrorSeverity::Medium,
                component: component.to_string(),
                operation: None,
                request_id: None,
                timestamp: chrono::Utc::now(),
                context: std::collections::HashMap::new(),
            },
        }
    }

    pub fn operation(mut self, operation: &str) -> Self {
        self.metadata.operation = Some(operation.to_string());
        self
    }

    pub fn request_id(mut self, request_id: &str) -> Self {
        self.metadata.request_id = Some(request_id.to_string());
        self
    }

    pub fn context(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .context
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(mut self, error: &PiError) -> ErrorMetadata {
        self.metadata.severity = error.severity();
        self.metadata
    }
}

pub type Result<T> = std::result::Result<T, PiError>;

// === 转换实现 ===

impl From<serde_json::Error> for PiError {
    fn from(err: serde_json::Error) -> Self {
        PiError::Serialization {
            format: "json".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for PiError {
    fn from(err: serde_yaml::Error) -> Self {
        PiError::Serialization {
            format: "yaml".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for PiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PiError::Timeout {
                operation: "http_request".to_string(),
                timeout_ms: 30000, // 默认超时时间
            }
        } else if err.is_connect() {
            PiError::Network {
                operation: "connect".to_string(),
                message: err.to_string(),
            }
        } else {
            PiError::Network {
                operation: "http_request".to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl From<tokio::task::JoinError> for PiError {
    fn from(err: tokio::task::JoinError) -> Self {
        PiError::Concurrency {
            operation: "task_join".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<handlebars::TemplateError> for PiError {
    fn from(err: handlebars::TemplateError) -> Self {
        PiError::Template {
            name: "<inline>".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<handlebars::RenderError> for PiError {
    fn from(err: handlebars::RenderError) -> Self {
        PiError::Template {
            name: "<inline>".to_string(),
            message: err.to_string(),
        }
    }
}
