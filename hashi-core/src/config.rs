//! プロセス接続の設定

use std::time::Duration;

/// `Process` の動作設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    /// 呼び出し側がタイムアウトを指定しない停止要求の既定値
    pub stop_timeout: Duration,
    /// 応答付き送信の応答待ちタイムアウト
    pub reply_timeout: Duration,
    /// イベント配送スレッドが終了要求を確認する間隔
    pub event_poll_interval: Duration,
    /// パッチテーブルのエントリ数の上限（これを超える報告はプロトコル違反）
    pub max_patch_entries: u32,
    /// インターロップ（ネイティブ）デバッグを行うか
    pub interop: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(5),
            event_poll_interval: Duration::from_millis(20),
            max_patch_entries: 4096,
            interop: false,
        }
    }
}

impl ProcessConfig {
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_event_poll_interval(mut self, interval: Duration) -> Self {
        self.event_poll_interval = interval;
        self
    }

    pub fn with_max_patch_entries(mut self, max: u32) -> Self {
        self.max_patch_entries = max;
        self
    }

    pub fn with_interop(mut self, interop: bool) -> Self {
        self.interop = interop;
        self
    }
}
