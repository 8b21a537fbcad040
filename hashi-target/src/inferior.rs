//! ptrace で制御するネイティブのデバッグ対象
//!
//! インターロップモードで、OS のデバッグイベントを [`NativeEvent`] として
//! 取り出すための最小限の制御層です。

use crate::memory::ProcMemory;
use crate::native::{NativeEvent, ThreadId};
use crate::Result;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::ffi::CString;
use std::path::Path;

/// ネイティブデバッグイベントの供給元
///
/// ptrace の制約により、待機と再開は同じスレッドから呼び出します。
pub trait NativeTarget: Send {
    /// 次のデバッグイベントを待つ
    fn wait_event(&mut self) -> Result<NativeEvent>;

    /// イベントで止まっているスレッドを再開する
    ///
    /// `handled` が偽なら、止まった原因のシグナルをそのまま配送します。
    fn continue_thread(&mut self, thread: ThreadId, handled: bool) -> Result<()>;
}

/// ptrace 下のデバッグ対象プロセス
pub struct Inferior {
    pid: Pid,
    /// 直前の再開がシングルステップだったか
    stepping: bool,
    /// スレッドごとの、次の再開時に渡すシグナル（"not handled" で継続する場合）
    pending_signals: HashMap<Pid, Signal>,
    exited: bool,
}

impl Inferior {
    /// 実行可能ファイルを起動し、execve 直後で停止させる
    pub fn spawn<P: AsRef<Path>>(program: P, args: &[String]) -> Result<Self> {
        use nix::unistd::{execv, fork, ForkResult};

        let program_path = program
            .as_ref()
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("invalid program path"))?;
        let program_cstring = CString::new(program_path)?;
        let mut argv = vec![program_cstring.clone()];
        for arg in args {
            argv.push(CString::new(arg.as_str())?);
        }

        match unsafe { fork()? } {
            ForkResult::Parent { child } => match waitpid(child, None)? {
                WaitStatus::Stopped(_, _) => {
                    ptrace::setoptions(
                        child,
                        ptrace::Options::PTRACE_O_TRACECLONE
                            | ptrace::Options::PTRACE_O_TRACEEXIT
                            | ptrace::Options::PTRACE_O_EXITKILL,
                    )?;
                    tracing::info!("spawned {} as pid {}", program_path, child);
                    Ok(Self::new(child))
                }
                status => Err(anyhow::anyhow!("unexpected wait status after execve: {:?}", status)),
            },
            ForkResult::Child => {
                ptrace::traceme()?;
                execv(&program_cstring, &argv)?;
                unreachable!("execv returned without error");
            }
        }
    }

    /// 既存のプロセスにアタッチする
    pub fn attach(pid: i32) -> Result<Self> {
        let pid = Pid::from_raw(pid);
        ptrace::attach(pid)?;
        waitpid(pid, None)?;
        ptrace::setoptions(
            pid,
            ptrace::Options::PTRACE_O_TRACECLONE | ptrace::Options::PTRACE_O_TRACEEXIT,
        )?;
        Ok(Self::new(pid))
    }

    fn new(pid: Pid) -> Self {
        Self {
            pid,
            stepping: false,
            pending_signals: HashMap::new(),
            exited: false,
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    pub fn has_exited(&self) -> bool {
        self.exited
    }

    /// リモートメモリへのアクセス
    pub fn memory(&self) -> ProcMemory {
        ProcMemory::new(self.pid.as_raw())
    }

    /// スレッドのプログラムカウンタ
    pub fn pc(&self, thread: Pid) -> Result<u64> {
        let regs = ptrace::getregs(thread)?;
        Ok(regs.rip)
    }

    /// 次のデバッグイベントを待つ
    ///
    /// デバッグイベントに対応しない停止（グループストップなど）は
    /// 読み飛ばして待ち続けます。
    pub fn wait_event(&mut self) -> Result<NativeEvent> {
        loop {
            let status = waitpid(Pid::from_raw(-1), Some(nix::sys::wait::WaitPidFlag::__WALL))?;
            let pc = match status {
                WaitStatus::Stopped(pid, _) => self.pc(pid).ok(),
                _ => None,
            };
            let stepping = std::mem::take(&mut self.stepping);

            if let WaitStatus::Stopped(pid, signal) = status {
                if signal != Signal::SIGTRAP {
                    self.pending_signals.insert(pid, signal);
                }
            }
            if matches!(status, WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _) if pid == self.pid) {
                self.exited = true;
            }

            if let Some(event) = NativeEvent::from_wait_status(status, pc, stepping) {
                return Ok(event);
            }
            if let Some(pid) = status.pid() {
                tracing::trace!("skipping wait status {:?}", status);
                let _ = ptrace::cont(pid, None);
            }
        }
    }

    /// イベントを処理済みとして再開する（シグナルは破棄）
    pub fn continue_handled(&mut self, thread: i32) -> Result<()> {
        let thread = Pid::from_raw(thread);
        self.pending_signals.remove(&thread);
        ptrace::cont(thread, None)?;
        Ok(())
    }

    /// イベントを未処理として再開する（保留中のシグナルを配送）
    pub fn continue_not_handled(&mut self, thread: i32) -> Result<()> {
        let thread = Pid::from_raw(thread);
        let signal = self.pending_signals.remove(&thread);
        ptrace::cont(thread, signal)?;
        Ok(())
    }

    /// 1命令だけ実行する
    pub fn step(&mut self, thread: i32) -> Result<()> {
        self.stepping = true;
        ptrace::step(Pid::from_raw(thread), None)?;
        Ok(())
    }
}

impl NativeTarget for Inferior {
    fn wait_event(&mut self) -> Result<NativeEvent> {
        Inferior::wait_event(self)
    }

    fn continue_thread(&mut self, thread: ThreadId, handled: bool) -> Result<()> {
        if handled {
            self.continue_handled(thread)
        } else {
            self.continue_not_handled(thread)
        }
    }
}

impl Drop for Inferior {
    fn drop(&mut self) {
        if !self.exited {
            let _ = ptrace::detach(self.pid, None);
        }
    }
}
