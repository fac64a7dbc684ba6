use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },
    #[error("轮次未找到: {id}")]
    RoundNotFound { id: String },
    #[error("轮次已完成，不能再操作: {id}")]
    RoundCompleted { id: String },
    #[error("当前没有活跃的轮次")]
    NoActiveRound,
    #[error("轮次数据不可用: {id} - {reason}")]
    RoundUnavailable { id: String, reason: String },
    #[error("无效的输入: {0}")]
    InvalidInput(String),
    #[error("持久化错误: {0}")]
    Persistence(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("未配置Webhook地址")]
    NoWebhook,
    #[error("汇报功能已禁用")]
    ReportingDisabled,
    #[error("上一次汇报尚未完成")]
    ReportInFlight,
    #[error("Webhook请求失败: HTTP {status}")]
    WebhookHttp { status: u16 },
    #[error("Webhook发送异常: {0}")]
    WebhookTransport(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type DispatchResult<T> = Result<T, DispatchError>;

impl DispatchError {
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn round_not_found<S: Into<String>>(id: S) -> Self {
        Self::RoundNotFound { id: id.into() }
    }
    pub fn round_completed<S: Into<String>>(id: S) -> Self {
        Self::RoundCompleted { id: id.into() }
    }
    pub fn round_unavailable<S: Into<String>, R: Into<String>>(id: S, reason: R) -> Self {
        Self::RoundUnavailable {
            id: id.into(),
            reason: reason.into(),
        }
    }
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }
    pub fn persistence<S: Into<String>>(msg: S) -> Self {
        Self::Persistence(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 机器可读的错误码，供API层与调用方判断分支
    pub fn code(&self) -> &'static str {
        match self {
            Self::TaskNotFound { .. } | Self::RoundNotFound { .. } => "NOT_FOUND",
            Self::RoundCompleted { .. } => "ROUND_COMPLETED",
            Self::NoActiveRound => "NO_ACTIVE_ROUND",
            Self::RoundUnavailable { .. } => "ROUND_UNAVAILABLE",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Persistence(_) => "PERSISTENCE_FAILURE",
            Self::Serialization(_) => "SERIALIZATION",
            Self::Configuration(_) => "CONFIGURATION",
            Self::NoWebhook => "NO_WEBHOOK",
            Self::ReportingDisabled => "REPORTING_DISABLED",
            Self::ReportInFlight => "IN_FLIGHT",
            Self::WebhookHttp { .. } => "HTTP_ERROR",
            Self::WebhookTransport(_) => "EXCEPTION",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// 是否为调用方输入导致的逻辑错误（非系统故障）
    pub fn is_logical(&self) -> bool {
        matches!(
            self,
            Self::TaskNotFound { .. }
                | Self::RoundNotFound { .. }
                | Self::RoundCompleted { .. }
                | Self::NoActiveRound
                | Self::InvalidInput(_)
        )
    }

    /// 面向操作者的简短提示文案
    pub fn user_message(&self) -> &str {
        match self {
            Self::TaskNotFound { .. } => "请求的任务不存在",
            Self::RoundNotFound { .. } => "请求的轮次不存在",
            Self::RoundCompleted { .. } => "该轮次已完成",
            Self::NoActiveRound => "当前没有活跃的轮次",
            Self::RoundUnavailable { .. } => "轮次数据暂时不可用，请稍后重试",
            Self::InvalidInput(_) => "输入参数有误",
            Self::NoWebhook => "请先配置Webhook地址",
            Self::ReportingDisabled => "汇报功能已禁用",
            Self::ReportInFlight => "上一次汇报尚未完成，请稍后重试",
            Self::WebhookHttp { .. } | Self::WebhookTransport(_) => "消息推送失败，请检查Webhook配置",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        DispatchError::Persistence(err.to_string())
    }
}

impl From<anyhow::Error> for DispatchError {
    fn from(err: anyhow::Error) -> Self {
        DispatchError::Internal(err.to_string())
    }
}
