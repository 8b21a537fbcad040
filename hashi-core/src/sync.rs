//! 停止・再開の同期状態
//!
//! 状態とネスト可能な停止カウントは、プロセスロックの下でのみ変更されます。
//! 終了・デタッチ・回復不能エラーはどの状態からでも到達し、一度記録されると
//! 以後のすべての同期要求はそれで失敗します。

use crate::errors::DebugError;
use crate::Result;

/// 同期状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Running,
    /// 非同期停止要求を送り、停止報告を待っている
    Synchronizing,
    Synchronized,
}

/// 停止報告を受け取ったときの扱い
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReport {
    /// 待っていた停止が完了した
    Accepted,
    /// 要求していない停止（タイムアウト後に届いた報告など）
    Unsolicited,
    /// すでに停止している
    Duplicate,
}

/// 左側が自発的に停止したときの扱い
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStop {
    /// 実行中からの新しい停止（停止カウントは1）
    Stopped,
    /// 待っていた停止要求をこの停止で満たした
    SatisfiedPendingStop,
    AlreadyStopped,
}

#[derive(Debug, Clone)]
pub struct SyncStatus {
    state: SyncState,
    stop_count: u32,
    stop_requested: bool,
    unrecoverable: Option<String>,
    detached: bool,
    terminated: bool,
}

impl SyncStatus {
    pub fn new() -> Self {
        Self {
            state: SyncState::Running,
            stop_count: 0,
            stop_requested: false,
            unrecoverable: None,
            detached: false,
            terminated: false,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn stop_count(&self) -> u32 {
        self.stop_count
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub fn is_synchronized(&self) -> bool {
        self.state == SyncState::Synchronized
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// 記録済みの致命的状態を優先順に調べる
    pub fn check_latched(&self) -> Result<()> {
        if let Some(reason) = &self.unrecoverable {
            return Err(DebugError::Unrecoverable(reason.clone()));
        }
        if self.detached {
            return Err(DebugError::Detached);
        }
        if self.terminated {
            return Err(DebugError::Terminated);
        }
        Ok(())
    }

    /// 公開操作の入口で使うガード
    ///
    /// 優先順位は 回復不能 > デタッチ > 終了 > スレッド制約 > 未同期 です。
    pub fn guard(&self, on_event_thread: bool, require_synchronized: bool) -> Result<()> {
        self.check_latched()?;
        if on_event_thread {
            return Err(DebugError::ThreadRestricted("event-delivery thread"));
        }
        if require_synchronized && !self.is_synchronized() {
            return Err(DebugError::NotSynchronized);
        }
        Ok(())
    }

    /// 停止中なら停止をネストする
    pub fn nest_stop(&mut self) -> bool {
        if self.is_synchronized() {
            self.stop_count += 1;
            true
        } else {
            false
        }
    }

    /// 非同期停止要求を送る直前に呼ぶ
    pub fn begin_stop(&mut self) {
        self.state = SyncState::Synchronizing;
        self.stop_requested = true;
    }

    /// 停止が完了していれば停止カウントを1つ増やす
    pub fn complete_stop(&mut self) -> bool {
        if self.is_synchronized() {
            self.stop_count += 1;
            true
        } else {
            false
        }
    }

    /// 停止を待つのをやめる（停止要求前の状態に戻す）
    pub fn cancel_stop(&mut self) {
        self.stop_requested = false;
        if self.state == SyncState::Synchronizing {
            self.state = SyncState::Running;
        }
    }

    /// 左側から停止報告が届いた
    pub fn on_stop_report(&mut self) -> StopReport {
        if self.is_synchronized() {
            StopReport::Duplicate
        } else if self.stop_requested {
            self.stop_requested = false;
            self.state = SyncState::Synchronized;
            StopReport::Accepted
        } else {
            StopReport::Unsolicited
        }
    }

    /// 左側が自発的に停止した（ユーザーブレークポイントなど）
    pub fn on_user_stop(&mut self) -> UserStop {
        if self.is_synchronized() {
            UserStop::AlreadyStopped
        } else if self.stop_requested {
            // 停止カウントは待っている Stop が増やす
            self.stop_requested = false;
            self.state = SyncState::Synchronized;
            UserStop::SatisfiedPendingStop
        } else {
            self.state = SyncState::Synchronized;
            self.stop_count = 1;
            UserStop::Stopped
        }
    }

    /// 停止カウントを1つ減らす。最後の1つなら `true`（呼び出し側が再開処理を行う）
    pub fn release_stop(&mut self) -> bool {
        if self.stop_count > 1 {
            self.stop_count -= 1;
            false
        } else {
            true
        }
    }

    /// 再開処理の最後に呼ぶ
    pub fn finish_continue(&mut self) {
        self.stop_count = 0;
        self.state = SyncState::Running;
    }

    fn reset(&mut self) {
        self.stop_count = 0;
        self.stop_requested = false;
        self.state = SyncState::Running;
    }

    pub fn latch_unrecoverable(&mut self, reason: impl Into<String>) {
        if self.unrecoverable.is_none() {
            self.unrecoverable = Some(reason.into());
        }
    }

    pub fn latch_detached(&mut self) {
        self.detached = true;
        self.reset();
    }

    /// 終了を記録する。初めての記録なら `true`
    pub fn latch_terminated(&mut self) -> bool {
        if self.terminated || self.detached {
            return false;
        }
        self.terminated = true;
        self.reset();
        true
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_and_nested_continue() {
        let mut sync = SyncStatus::new();
        assert!(!sync.nest_stop());
        sync.begin_stop();
        assert_eq!(sync.state(), SyncState::Synchronizing);
        assert_eq!(sync.on_stop_report(), StopReport::Accepted);
        assert!(sync.complete_stop());
        assert!(sync.nest_stop());
        assert_eq!(sync.stop_count(), 2);

        assert!(!sync.release_stop());
        assert!(sync.is_synchronized());
        assert!(sync.release_stop());
        sync.finish_continue();
        assert_eq!(sync.state(), SyncState::Running);
        assert_eq!(sync.stop_count(), 0);
    }

    #[test]
    fn test_cancelled_stop_rejects_late_report() {
        let mut sync = SyncStatus::new();
        sync.begin_stop();
        sync.cancel_stop();
        assert_eq!(sync.state(), SyncState::Running);
        assert_eq!(sync.on_stop_report(), StopReport::Unsolicited);
        assert_eq!(sync.stop_count(), 0);
        assert!(!sync.is_synchronized());
    }

    #[test]
    fn test_user_stop() {
        let mut sync = SyncStatus::new();
        assert_eq!(sync.on_user_stop(), UserStop::Stopped);
        assert_eq!(sync.stop_count(), 1);
        assert_eq!(sync.on_user_stop(), UserStop::AlreadyStopped);
        assert_eq!(sync.on_stop_report(), StopReport::Duplicate);

        let mut pending = SyncStatus::new();
        pending.begin_stop();
        assert_eq!(pending.on_user_stop(), UserStop::SatisfiedPendingStop);
        assert!(pending.complete_stop());
        assert_eq!(pending.stop_count(), 1);
    }

    #[test]
    fn test_guard_priority() {
        let mut sync = SyncStatus::new();
        assert_eq!(sync.guard(false, true), Err(DebugError::NotSynchronized));
        assert_eq!(
            sync.guard(true, true),
            Err(DebugError::ThreadRestricted("event-delivery thread"))
        );
        assert!(sync.guard(false, false).is_ok());

        assert!(sync.latch_terminated());
        assert!(!sync.latch_terminated());
        assert_eq!(sync.guard(true, true), Err(DebugError::Terminated));

        sync.latch_detached();
        assert_eq!(sync.guard(true, true), Err(DebugError::Detached));

        sync.latch_unrecoverable("bad stream");
        sync.latch_unrecoverable("ignored");
        assert_eq!(
            sync.guard(true, true),
            Err(DebugError::Unrecoverable("bad stream".into()))
        );
    }

    #[test]
    fn test_latch_resets_stop_state() {
        let mut sync = SyncStatus::new();
        sync.on_user_stop();
        sync.latch_terminated();
        assert_eq!(sync.stop_count(), 0);
        assert!(!sync.is_synchronized());
    }
}
