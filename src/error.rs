use std::time::Duration;

/// 错误分类
///
/// 对应端点错误处理的四类语义，外加超时：
/// 配置错误立即致命，传输错误记录后停止，协议错误只停止当前端点，
/// 可重试错误可被自动重连策略拦截。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Transport,
    Protocol,
    Retryable,
    Timeout,
}

/// 统一传输错误类型
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum TransportError {
    /// 连接相关错误
    #[error("Connection error: {reason} (retryable: {retryable})")]
    Connection {
        reason: String,
        retryable: bool,
    },

    /// 协议相关错误
    #[error("Protocol error ({protocol}): {reason}")]
    Protocol {
        protocol: String,
        reason: String,
    },

    /// 配置相关错误
    #[error("Configuration error in field '{field}': {reason}")]
    Configuration {
        field: String,
        reason: String,
    },

    /// 超时错误
    #[error("Operation '{operation}' timeout after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// 端点尚未启动或已经开始停止
    #[error("Endpoint not ready (state: {state})")]
    NotReady {
        state: String,
    },
}

impl TransportError {
    /// 判断错误是否可重试
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connection { retryable, .. } => *retryable,
            TransportError::Timeout { .. } => true,
            TransportError::Protocol { .. } => false,
            TransportError::Configuration { .. } => false,
            TransportError::NotReady { .. } => false,
        }
    }

    /// 错误所属分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Connection { retryable: true, .. } => ErrorKind::Retryable,
            TransportError::Connection { .. } => ErrorKind::Transport,
            TransportError::NotReady { .. } => ErrorKind::Transport,
            TransportError::Protocol { .. } => ErrorKind::Protocol,
            TransportError::Configuration { .. } => ErrorKind::Configuration,
            TransportError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// 获取错误代码
    pub fn error_code(&self) -> &'static str {
        match self {
            TransportError::Connection { .. } => "CONNECTION_ERROR",
            TransportError::Protocol { .. } => "PROTOCOL_ERROR",
            TransportError::Configuration { .. } => "CONFIG_ERROR",
            TransportError::Timeout { .. } => "TIMEOUT_ERROR",
            TransportError::NotReady { .. } => "NOT_READY",
        }
    }

    /// 添加操作上下文
    pub fn with_operation(mut self, op: &'static str) -> Self {
        match &mut self {
            TransportError::Connection { reason, .. } | TransportError::Protocol { reason, .. } => {
                if !reason.contains("operation:") {
                    *reason = format!("{} (operation: {})", reason, op);
                }
            }
            TransportError::Timeout { operation, .. } => {
                if operation.is_empty() {
                    *operation = op.to_string();
                }
            }
            _ => {}
        }
        self
    }
}

/// 便利构造函数
impl TransportError {
    /// 创建连接错误
    pub fn connection_error(reason: impl Into<String>, retryable: bool) -> Self {
        Self::Connection {
            reason: reason.into(),
            retryable,
        }
    }

    /// 创建协议错误
    pub fn protocol_error(protocol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Protocol {
            protocol: protocol.into(),
            reason: reason.into(),
        }
    }

    /// 创建配置错误
    pub fn config_error(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// 创建超时错误
    pub fn timeout_error(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    pub fn not_ready(state: impl std::fmt::Display) -> Self {
        Self::NotReady {
            state: state.to_string(),
        }
    }
}

/// 从标准IO错误转换：拒绝 / 重置 / 中断类错误可重试
impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        let retryable = matches!(
            error.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
        );

        TransportError::Connection {
            reason: format!("IO error: {}", error),
            retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified() {
        let refused: TransportError = std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into();
        assert!(refused.is_retryable());
        assert_eq!(refused.kind(), ErrorKind::Retryable);

        let denied: TransportError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert!(!denied.is_retryable());
        assert_eq!(denied.kind(), ErrorKind::Transport);
    }

    #[test]
    fn configuration_is_fatal() {
        let err = TransportError::config_error("recv_buffer_size", "must be > 0");
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }

    #[test]
    fn operation_context_is_added_once() {
        let err = TransportError::connection_error("reset", true)
            .with_operation("recv")
            .with_operation("recv");
        match err {
            TransportError::Connection { reason, .. } => {
                assert_eq!(reason.matches("operation:").count(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
