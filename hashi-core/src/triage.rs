//! ネイティブデバッグイベントの分類
//!
//! インターロップデバッグでは、OS から届くイベントを上位層へ見せる前に
//! 必ず1つの [`Reaction`] に分類します。分類はエンジンの状態・スレッドの
//! ハイジャック状態・イベント・目印だけから決まる純粋な関数で、失敗しません。
//!
//! 判定の優先順位:
//! 1. ランタイム内部の合図
//! 2. ハイジャックの完了・再発生
//! 3. 既知のパッチ上のブレークポイント
//! 4. 第一段階／第二段階の例外
//! 5. それ以外は帯域内で配送

use hashi_target::{ExceptionCode, HijackAddresses, NativeEvent, NativeEventKind, ThreadId};
use std::collections::{HashMap, VecDeque};

/// 分類結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// 通常どおり帯域内で配送する
    DispatchInband,
    /// ハイジャック後に再配送された例外
    DispatchInbandRedelivery,
    /// ランタイムがスレッドのハイジャックを開始した
    HijackStart,
    /// 帯域内ハイジャックが完了した
    InbandHijackComplete,
    /// ハイジャック中のスレッドで別の例外が起きた（やり直す）
    HijackRetrigger,
    /// 既知のパッチを踏んだので、ハイジャックして処理させる
    BreakpointNeedsHijack,
    /// 帯域外で配送する（すぐに再開しなければならない）
    DispatchOutOfBand,
    /// ランタイムが処理する想定内の例外
    InternalRuntimeExpected,
    /// 何もしない
    Ignore,
}

impl Reaction {
    pub fn is_out_of_band(self) -> bool {
        self == Reaction::DispatchOutOfBand
    }

    /// 止まっているネイティブスレッドを再開するとき、例外を処理済みにするか
    ///
    /// 配送した例外はデバッグ対象自身に返し、ブレークポイントと
    /// シングルステップ、ハイジャックの合図はエンジンが消費します。
    pub fn continues_handled(self, event: &NativeEvent) -> bool {
        let delivered = matches!(
            self,
            Reaction::DispatchInband
                | Reaction::DispatchInbandRedelivery
                | Reaction::DispatchOutOfBand
                | Reaction::InternalRuntimeExpected
        );
        match event.exception_info() {
            None | Some((ExceptionCode::Breakpoint | ExceptionCode::SingleStep, _, _)) => true,
            Some(_) => !delivered,
        }
    }
}

/// スレッドのハイジャック状態
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ThreadHijackState {
    #[default]
    NotHijacked,
    FirstChanceHijacked,
    GenericHijacked,
    /// ハイジャックが終わり、元の例外の再配送を待っている
    AwaitingRedelivery,
}

impl ThreadHijackState {
    pub fn is_hijacked(self) -> bool {
        matches!(
            self,
            ThreadHijackState::FirstChanceHijacked | ThreadHijackState::GenericHijacked
        )
    }
}

/// 分類に使うエンジン側の状態
#[derive(Debug, Clone, Copy)]
pub struct TriageContext {
    pub hijack: HijackAddresses,
    /// ランタイムが読み込まれているか
    pub runtime_loaded: bool,
    /// エンジンが停止中か
    pub synchronized: bool,
}

/// イベントに付随する目印
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventMarkers {
    /// デバッガヘルパースレッド上のイベント
    pub on_helper_thread: bool,
    /// 停止できない領域にいるスレッド
    pub thread_cant_stop: bool,
    /// ローダーの初回ブレークポイント
    pub loader_breakpoint: bool,
}

/// ネイティブイベントを分類する
pub fn triage(
    context: &TriageContext,
    thread_state: ThreadHijackState,
    event: &NativeEvent,
    markers: EventMarkers,
    is_patch: impl Fn(u64) -> bool,
) -> Reaction {
    let hijack = &context.hijack;

    // 1. ランタイム内部の合図
    if markers.on_helper_thread || markers.thread_cant_stop {
        return Reaction::DispatchOutOfBand;
    }
    let Some((code, address, first_chance)) = event.exception_info() else {
        return match event.kind {
            NativeEventKind::DebugString => Reaction::Ignore,
            _ => Reaction::DispatchInband,
        };
    };
    if address == 0 {
        tracing::warn!("malformed exception on thread {}: {:?} at address 0", event.thread, code);
        return Reaction::DispatchInband;
    }
    let is_breakpoint = code == ExceptionCode::Breakpoint;
    if is_breakpoint && address == hijack.notify_rs_of_sync_complete {
        return Reaction::Ignore;
    }
    if is_breakpoint
        && (address == hijack.excep_for_runtime_handoff_start
            || address == hijack.excep_for_runtime_handoff_complete)
    {
        return Reaction::InternalRuntimeExpected;
    }
    if code == ExceptionCode::DebuggerNotification {
        return Reaction::InternalRuntimeExpected;
    }
    if is_breakpoint && markers.loader_breakpoint {
        return Reaction::Ignore;
    }

    // 2. ハイジャック
    if is_breakpoint && address == hijack.signal_hijack_started {
        return Reaction::HijackStart;
    }
    if is_breakpoint
        && (address == hijack.signal_hijack_complete || address == hijack.excep_not_for_runtime)
    {
        return Reaction::InbandHijackComplete;
    }
    let known_patch = is_breakpoint && is_patch(address);
    if thread_state.is_hijacked() {
        return if known_patch {
            Reaction::InbandHijackComplete
        } else {
            Reaction::HijackRetrigger
        };
    }
    if thread_state == ThreadHijackState::AwaitingRedelivery {
        return Reaction::DispatchInbandRedelivery;
    }

    // 3. 既知のパッチ
    if known_patch {
        return Reaction::BreakpointNeedsHijack;
    }

    // 4. 例外
    if !first_chance {
        return Reaction::DispatchInband;
    }
    match code {
        ExceptionCode::SingleStep if !context.synchronized => Reaction::DispatchOutOfBand,
        ExceptionCode::ManagedException if context.runtime_loaded => Reaction::InternalRuntimeExpected,
        _ => Reaction::DispatchInband,
    }
}

/// アンマネージドスレッドの表
///
/// 分類結果に応じてスレッドのハイジャック状態を遷移させ、
/// 帯域外イベントを再開待ちとして覚えておきます。
#[derive(Debug, Default)]
pub struct UnmanagedThreadTable {
    threads: HashMap<ThreadId, ThreadHijackState>,
    pending_out_of_band: VecDeque<NativeEvent>,
}

impl UnmanagedThreadTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, thread: ThreadId) -> ThreadHijackState {
        self.threads.get(&thread).copied().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// 分類結果をスレッドの状態に反映する
    pub fn apply(&mut self, event: &NativeEvent, reaction: Reaction) {
        if let NativeEventKind::ExitThread { .. } | NativeEventKind::ExitProcess { .. } = event.kind {
            self.threads.remove(&event.thread);
            self.pending_out_of_band.retain(|pending| pending.thread != event.thread);
            return;
        }

        let next = match reaction {
            Reaction::HijackStart => Some(ThreadHijackState::FirstChanceHijacked),
            Reaction::BreakpointNeedsHijack => Some(ThreadHijackState::GenericHijacked),
            Reaction::InbandHijackComplete => Some(ThreadHijackState::AwaitingRedelivery),
            Reaction::DispatchInbandRedelivery => Some(ThreadHijackState::NotHijacked),
            Reaction::DispatchOutOfBand => {
                self.pending_out_of_band.push_back(event.clone());
                None
            }
            _ => None,
        };

        let previous = self.threads.entry(event.thread).or_default();
        if let Some(next) = next {
            if *previous != next {
                tracing::debug!("thread {}: {:?} -> {:?}", event.thread, previous, next);
            }
            *previous = next;
        }
    }

    pub fn pending_out_of_band(&self) -> usize {
        self.pending_out_of_band.len()
    }

    /// 一番古い帯域外イベントを取り出す
    pub fn pop_out_of_band(&mut self) -> Option<NativeEvent> {
        self.pending_out_of_band.pop_front()
    }

    pub fn clear(&mut self) {
        self.threads.clear();
        self.pending_out_of_band.clear();
    }
}
