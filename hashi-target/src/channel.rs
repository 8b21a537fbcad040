//! 右側と左側の間のイベントチャネル
//!
//! 右側からの要求（応答付き／応答なし）と、左側から非同期に届くイベントの
//! 二方向を持つ全二重チャネルです。ワイヤ上のレイアウトは扱わず、
//! 「届ける・受け取る・相手の死を検出する」だけを提供します。

use crate::native::ThreadId;
use crate::offsets::RuntimeOffsets;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 右側と左側の間でやり取りされるイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcEvent {
    // ---- 右側 → 左側 ----
    /// 非同期停止要求
    AsyncBreak,
    /// 実行再開
    Continue,
    /// ランタイムオフセットの問い合わせ
    GetRuntimeOffsets,
    /// ブレークポイント（パッチ）の追加
    BreakpointAdd { address: u64 },
    /// 左側の資源ハンドルを解放する
    ReleaseHandle { handle: u64 },
    /// デタッチ要求
    DetachRequest,

    // ---- 左側 → 右側（非同期イベント） ----
    /// 停止完了の報告
    SyncComplete,
    /// ユーザーブレークポイントによる停止
    UserBreakpoint { thread: ThreadId },
    /// デバッグ対象の終了
    ProcessExit { code: i32 },

    // ---- 左側 → 右側（応答） ----
    RuntimeOffsetsResult(RuntimeOffsets),
    BreakpointAddResult { handle: Option<u64> },
    HandleReleased,
    DetachComplete,
}

impl IpcEvent {
    /// 応答として返されるイベントか
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            IpcEvent::RuntimeOffsetsResult(_)
                | IpcEvent::BreakpointAddResult { .. }
                | IpcEvent::HandleReleased
                | IpcEvent::DetachComplete
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            IpcEvent::AsyncBreak => "AsyncBreak",
            IpcEvent::Continue => "Continue",
            IpcEvent::GetRuntimeOffsets => "GetRuntimeOffsets",
            IpcEvent::BreakpointAdd { .. } => "BreakpointAdd",
            IpcEvent::ReleaseHandle { .. } => "ReleaseHandle",
            IpcEvent::DetachRequest => "DetachRequest",
            IpcEvent::SyncComplete => "SyncComplete",
            IpcEvent::UserBreakpoint { .. } => "UserBreakpoint",
            IpcEvent::ProcessExit { .. } => "ProcessExit",
            IpcEvent::RuntimeOffsetsResult(_) => "RuntimeOffsetsResult",
            IpcEvent::BreakpointAddResult { .. } => "BreakpointAddResult",
            IpcEvent::HandleReleased => "HandleReleased",
            IpcEvent::DetachComplete => "DetachComplete",
        }
    }
}

/// トランスポートのエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("target process is gone")]
    TargetDied,
    #[error("no reply within {0:?}")]
    ReplyTimeout(Duration),
    #[error("channel to the target is already open")]
    AlreadyOpen,
    #[error("unexpected transport condition: {0}")]
    Unexpected(String),
}

/// 全二重イベントチャネル
pub trait EventChannel: Send + Sync {
    /// イベントを送信する
    ///
    /// `expect_reply` が真なら応答を待って返します。偽なら `Ok(None)` です。
    fn send(&self, event: IpcEvent, expect_reply: bool) -> Result<Option<IpcEvent>, TransportError>;

    /// 次の受信イベントを待つ（イベント配送スレッド専用）
    ///
    /// `timeout` までに何も届かなければ `Ok(None)` を返します。
    fn receive(&self, timeout: Option<Duration>) -> Result<Option<IpcEvent>, TransportError>;

    /// 相手がまだ生きているか
    fn is_target_alive(&self) -> bool;
}

/// 左側が受け取る要求（応答用チャネル付き）
pub struct Request {
    pub event: IpcEvent,
    pub reply: Option<flume::Sender<IpcEvent>>,
}

/// 同一プロセス内で左側と接続するチャネル
pub struct LoopbackChannel {
    requests: flume::Sender<Request>,
    events: flume::Receiver<IpcEvent>,
    alive: Arc<AtomicBool>,
    reply_timeout: Duration,
}

/// 左側が保持するチャネルの端点
pub struct AgentEndpoint {
    pub requests: flume::Receiver<Request>,
    pub events: flume::Sender<IpcEvent>,
    pub alive: Arc<AtomicBool>,
}

impl LoopbackChannel {
    /// 右側と左側の端点の組を作る
    pub fn pair(reply_timeout: Duration) -> (Self, AgentEndpoint) {
        let (request_tx, request_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::unbounded();
        let alive = Arc::new(AtomicBool::new(true));
        (
            Self {
                requests: request_tx,
                events: event_rx,
                alive: alive.clone(),
                reply_timeout,
            },
            AgentEndpoint {
                requests: request_rx,
                events: event_tx,
                alive,
            },
        )
    }

    /// 応答待ちのタイムアウトを変更する
    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }
}

impl EventChannel for LoopbackChannel {
    fn send(&self, event: IpcEvent, expect_reply: bool) -> Result<Option<IpcEvent>, TransportError> {
        if !self.is_target_alive() {
            return Err(TransportError::TargetDied);
        }

        let name = event.name();
        let (reply_tx, reply_rx) = if expect_reply {
            let (tx, rx) = flume::bounded(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        self.requests
            .send(Request {
                event,
                reply: reply_tx,
            })
            .map_err(|_| TransportError::TargetDied)?;
        tracing::trace!("sent {} (expect_reply={})", name, expect_reply);

        let Some(reply_rx) = reply_rx else {
            return Ok(None);
        };
        match reply_rx.recv_timeout(self.reply_timeout) {
            Ok(reply) => Ok(Some(reply)),
            Err(flume::RecvTimeoutError::Timeout) => Err(TransportError::ReplyTimeout(self.reply_timeout)),
            Err(flume::RecvTimeoutError::Disconnected) => Err(TransportError::TargetDied),
        }
    }

    fn receive(&self, timeout: Option<Duration>) -> Result<Option<IpcEvent>, TransportError> {
        let received = match timeout {
            Some(timeout) => match self.events.recv_timeout(timeout) {
                Ok(event) => Ok(event),
                Err(flume::RecvTimeoutError::Timeout) => return Ok(None),
                Err(flume::RecvTimeoutError::Disconnected) => Err(()),
            },
            None => self.events.recv().map_err(|_| ()),
        };
        // 左側が終了しても、送信済みのイベントは読み切れる
        received.map(Some).map_err(|_| TransportError::TargetDied)
    }

    fn is_target_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}
