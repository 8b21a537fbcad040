//! エンジンのエラー型

use hashi_target::TransportError;
use std::time::Duration;

/// 呼び出し側に返すエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DebugError {
    /// neuter 済みのオブジェクトに対する操作
    #[error("object has been neutered")]
    Disposed,
    #[error("process is not synchronized")]
    NotSynchronized,
    /// 一度記録されると以後すべての同期要求がこれで失敗する
    #[error("unrecoverable error: {0}")]
    Unrecoverable(String),
    #[error("debuggee has been detached")]
    Detached,
    #[error("debuggee has terminated")]
    Terminated,
    #[error("operation is not allowed on the {0}")]
    ThreadRestricted(&'static str),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    #[error("remote memory access failed: {0}")]
    Memory(String),
    #[error("native debuggee control failed: {0}")]
    Native(String),
}

impl From<TransportError> for DebugError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::TargetDied => DebugError::Terminated,
            TransportError::ReplyTimeout(timeout) => DebugError::Timeout(timeout),
            other => DebugError::ProtocolViolation(other.to_string()),
        }
    }
}

impl DebugError {
    /// リモートメモリのエラーを変換する
    pub(crate) fn memory(e: anyhow::Error) -> Self {
        DebugError::Memory(format!("{:#}", e))
    }

    /// ネイティブのデバッグ対象の制御エラーを変換する
    pub(crate) fn native(e: anyhow::Error) -> Self {
        DebugError::Native(format!("{:#}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_mapping() {
        assert_eq!(DebugError::from(TransportError::TargetDied), DebugError::Terminated);
        assert_eq!(
            DebugError::from(TransportError::ReplyTimeout(Duration::from_millis(5))),
            DebugError::Timeout(Duration::from_millis(5))
        );
        assert!(matches!(
            DebugError::from(TransportError::AlreadyOpen),
            DebugError::ProtocolViolation(_)
        ));
    }
}
