//! Conversation error type.
//!
//! Every [`ChatError`] carries a stable SCREAMING_SNAKE_CASE code, shown in
//! its Display output as `[CODE] message` and sent to clients in SSE
//! `error` events and JSON error bodies.

pub mod codes {
    pub const CONFIG_INVALID: &str = "CONFIG_INVALID";
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const REQUEST_FAILED: &str = "REQUEST_FAILED";
    pub const STREAM_FAILED: &str = "STREAM_FAILED";
    pub const TOOL_ROUNDS_EXCEEDED: &str = "TOOL_ROUNDS_EXCEEDED";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const CANCELLED: &str = "CANCELLED";
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChatError {
    #[error("[{}] {}", codes::CONFIG_INVALID, .0)]
    Config(String),

    /// The model endpoint rejected the credentials (HTTP 401/403).
    #[error("[{}] {}", codes::AUTH_FAILED, .0)]
    Auth(String),

    /// The request could not be sent or returned a non-success status.
    #[error("[{}] {}", codes::REQUEST_FAILED, .0)]
    Request(String),

    /// The response stream broke or carried an error payload.
    #[error("[{}] {}", codes::STREAM_FAILED, .0)]
    Stream(String),

    #[error("[{}] model requested tools for more than {} rounds", codes::TOOL_ROUNDS_EXCEEDED, .0)]
    ToolRoundsExceeded(usize),

    #[error("[{}] {}", codes::TIMEOUT, .0)]
    Timeout(String),

    #[error("[{}] request cancelled", codes::CANCELLED)]
    Cancelled,
}

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Config(_) => codes::CONFIG_INVALID,
            ChatError::Auth(_) => codes::AUTH_FAILED,
            ChatError::Request(_) => codes::REQUEST_FAILED,
            ChatError::Stream(_) => codes::STREAM_FAILED,
            ChatError::ToolRoundsExceeded(_) => codes::TOOL_ROUNDS_EXCEEDED,
            ChatError::Timeout(_) => codes::TIMEOUT,
            ChatError::Cancelled => codes::CANCELLED,
        }
    }

    /// Message without the code prefix.
    pub fn message(&self) -> String {
        match self {
            ChatError::Config(m)
            | ChatError::Auth(m)
            | ChatError::Request(m)
            | ChatError::Stream(m)
            | ChatError::Timeout(m) => m.clone(),
            ChatError::ToolRoundsExceeded(n) => {
                format!("model requested tools for more than {} rounds", n)
            }
            ChatError::Cancelled => "request cancelled".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_code() {
        let err = ChatError::Stream("connection reset".into());
        assert_eq!(err.to_string(), "[STREAM_FAILED] connection reset");
        assert_eq!(err.code(), codes::STREAM_FAILED);
        assert_eq!(err.message(), "connection reset");
    }

    #[test]
    fn tool_round_limit_message() {
        let err = ChatError::ToolRoundsExceeded(8);
        assert_eq!(
            err.to_string(),
            "[TOOL_ROUNDS_EXCEEDED] model requested tools for more than 8 rounds"
        );
    }
}
