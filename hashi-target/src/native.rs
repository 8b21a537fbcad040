//! ネイティブ（OS）デバッグイベント
//!
//! インターロップデバッグでは、OS から届く生のデバッグイベントを
//! 右側で分類してから上位層へ渡します。ここではイベントの表現と、
//! `waitpid` の結果からの変換だけを扱います。

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// スレッドID
pub type ThreadId = i32;

/// INT3命令のオペコード
pub const INT3_OPCODE: u8 = 0xCC;

/// 例外コード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    /// トラップ命令（INT3）
    Breakpoint,
    /// シングルステップ完了
    SingleStep,
    /// 不正メモリアクセス
    AccessViolation,
    /// マネージド例外（ランタイムが送出したもの）
    ManagedException,
    /// ランタイムからデバッガへの通知例外
    DebuggerNotification,
    /// その他のシグナル
    Signal(i32),
}

/// ネイティブイベントの種類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeEventKind {
    Exception {
        code: ExceptionCode,
        address: u64,
        first_chance: bool,
    },
    CreateProcess,
    ExitProcess { code: i32 },
    CreateThread,
    ExitThread { code: i32 },
    LoadModule { base: u64 },
    UnloadModule { base: u64 },
    DebugString,
}

/// OS から届いた生のデバッグイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeEvent {
    pub thread: ThreadId,
    pub kind: NativeEventKind,
}

impl NativeEvent {
    pub fn new(thread: ThreadId, kind: NativeEventKind) -> Self {
        Self { thread, kind }
    }

    /// 第一段階のブレークポイント例外を作る
    pub fn breakpoint(thread: ThreadId, address: u64) -> Self {
        Self::exception(thread, ExceptionCode::Breakpoint, address, true)
    }

    pub fn exception(thread: ThreadId, code: ExceptionCode, address: u64, first_chance: bool) -> Self {
        Self::new(
            thread,
            NativeEventKind::Exception {
                code,
                address,
                first_chance,
            },
        )
    }

    pub fn is_exception(&self) -> bool {
        matches!(self.kind, NativeEventKind::Exception { .. })
    }

    /// 例外イベントなら (コード, アドレス, 第一段階か) を返す
    pub fn exception_info(&self) -> Option<(ExceptionCode, u64, bool)> {
        match self.kind {
            NativeEventKind::Exception {
                code,
                address,
                first_chance,
            } => Some((code, address, first_chance)),
            _ => None,
        }
    }

    /// 停止したプロセスの `waitpid` 結果をイベントへ変換する
    ///
    /// `pc` は停止時のプログラムカウンタです。INT3 の場合は
    /// トラップ命令の次を指しているので、1 戻したアドレスを報告します。
    /// グループストップなど、デバッグイベントに対応しない状態は `None` です。
    pub fn from_wait_status(status: WaitStatus, pc: Option<u64>, single_stepping: bool) -> Option<Self> {
        let pc = pc.unwrap_or(0);
        match status {
            WaitStatus::Stopped(pid, Signal::SIGTRAP) => {
                let event = if single_stepping {
                    Self::exception(pid.as_raw(), ExceptionCode::SingleStep, pc, true)
                } else {
                    Self::breakpoint(pid.as_raw(), pc.saturating_sub(1))
                };
                Some(event)
            }
            WaitStatus::Stopped(pid, Signal::SIGSEGV) | WaitStatus::Stopped(pid, Signal::SIGBUS) => Some(
                Self::exception(pid.as_raw(), ExceptionCode::AccessViolation, pc, true),
            ),
            WaitStatus::Stopped(pid, signal) => Some(Self::exception(
                pid.as_raw(),
                ExceptionCode::Signal(signal as i32),
                pc,
                true,
            )),
            WaitStatus::Exited(pid, code) => {
                Some(Self::new(pid.as_raw(), NativeEventKind::ExitProcess { code }))
            }
            WaitStatus::Signaled(pid, signal, _) => Some(Self::new(
                pid.as_raw(),
                NativeEventKind::ExitProcess {
                    code: 128 + signal as i32,
                },
            )),
            WaitStatus::PtraceEvent(pid, _, event) => match event {
                nix::libc::PTRACE_EVENT_CLONE => {
                    Some(Self::new(pid.as_raw(), NativeEventKind::CreateThread))
                }
                nix::libc::PTRACE_EVENT_EXIT => {
                    Some(Self::new(pid.as_raw(), NativeEventKind::ExitThread { code: 0 }))
                }
                nix::libc::PTRACE_EVENT_EXEC => {
                    Some(Self::new(pid.as_raw(), NativeEventKind::LoadModule { base: 0 }))
                }
                _ => None,
            },
            _ => None,
        }
    }
}
