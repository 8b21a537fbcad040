//! Process 集約
//!
//! デバッグ対象1つに対応し、ロック階層・同期状態・neuter リスト・
//! パッチテーブル・イベントチャネルをすべて所有します。
//!
//! ロックは次の順に取得します（上ほど先）:
//! Stop-Go (5) → プロセス (4) → ネイティブイベント (3) → トランスポート (2) →
//! パッチテーブル (1) → 葉 (0)
//!
//! 左側への送信（トランスポート）はプロセスロックを手放してから行います。
//!
//! ランタイムのないネイティブだけのデバッグ対象（[`Process::attach_native`]）には
//! 左側がなく、同期操作は使えません。ネイティブイベントの分類と再開だけを行います。

use crate::breakpoint::{BreakpointHandle, BreakpointObject};
use crate::config::ProcessConfig;
use crate::enumerator::{BreakpointEnum, BreakpointEnumObject};
use crate::errors::DebugError;
use crate::handle::ObjectHandle;
use crate::lock::{is_event_delivery_thread, mark_event_delivery_thread, LockLevel, RsLock, RsReentrantLock};
use crate::neuter::{NeuterList, NeuterListKind};
use crate::object::{Capability, DebugObject, ObjectId, ObjectKind, ObjectRegistry, ReleaseOutcome, StatsSnapshot};
use crate::patch::{AdjustMode, Patch, PatchTable};
use crate::snapshot::{MemorySnapshotObject, SnapshotHandle};
use crate::sync::{StopReport, SyncState, SyncStatus, UserStop};
use crate::triage::{triage, EventMarkers, Reaction, TriageContext, UnmanagedThreadTable};
use crate::Result;
use hashi_target::{
    open_channel, EventChannel, IpcEvent, MemoryAccessor, NativeEvent, NativeTarget, RuntimeOffsets, TargetHandle,
    ThreadId, TransportError,
};
use parking_lot::Condvar;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// 呼び出し側へ通知するライフサイクルイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagedEvent {
    /// 左側が自発的に停止した（呼び出し側が Continue する必要がある）
    UserBreakpoint { thread: ThreadId },
    /// デバッグ対象が終了した（接続断なら `code` は `None`）
    ProcessExited { code: Option<i32> },
    ProcessDetached,
}

/// ルートオブジェクトの payload
struct ProcessObject;

impl DebugObject for ProcessObject {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Process
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// プロセスロックで保護される状態
pub(crate) struct ProcessState {
    pub(crate) registry: ObjectRegistry,
    pub(crate) root: ObjectId,
    pub(crate) sync: SyncStatus,
    pub(crate) exit_list: NeuterList,
    pub(crate) continue_list: NeuterList,
    pub(crate) sweepable_list: NeuterList,
}

impl ProcessState {
    fn new() -> Self {
        let mut registry = ObjectRegistry::new();
        let root = registry.create(None, Box::new(ProcessObject));
        registry.internal_add_ref(root);
        Self {
            registry,
            root,
            sync: SyncStatus::new(),
            exit_list: NeuterList::new(NeuterListKind::Exit),
            continue_list: NeuterList::new(NeuterListKind::Continue),
            sweepable_list: NeuterList::new(NeuterListKind::Sweepable),
        }
    }

    /// 左側と通信せずにすべてを neuter する（終了・デタッチ用）
    fn neuter_everything(&mut self) -> usize {
        let Self {
            registry,
            root,
            exit_list,
            continue_list,
            sweepable_list,
            ..
        } = self;
        let neutered = continue_list.neuter_and_clear(registry)
            + sweepable_list.neuter_and_clear(registry)
            + exit_list.neuter_and_clear(registry);
        registry.neuter(*root);
        registry.reclaim();
        neutered
    }

    /// 新しいオブジェクトを登録し、外部参照を1つ取る
    fn register(&mut self, payload: Box<dyn DebugObject>, list: NeuterListKind, at_will: bool) -> Result<ObjectId> {
        let id = self.registry.create(Some(self.root), payload);
        if at_will {
            self.registry.set_neuter_at_will(id)?;
        }
        let list = match list {
            NeuterListKind::Exit => &mut self.exit_list,
            NeuterListKind::Continue => &mut self.continue_list,
            NeuterListKind::Sweepable => &mut self.sweepable_list,
        };
        list.add(&mut self.registry, id);
        self.registry.external_add_ref(id)?;
        Ok(id)
    }
}

pub(crate) struct ProcessInner {
    config: ProcessConfig,
    offsets: RuntimeOffsets,
    /// 左側とのチャネル（ランタイムがなければ `None`）
    channel: Option<Arc<dyn EventChannel>>,
    memory: Arc<dyn MemoryAccessor>,
    stop_go: RsReentrantLock,
    state: RsLock<ProcessState>,
    /// 停止報告・終了を Stop の待機者へ知らせる
    stopped: Condvar,
    native: RsLock<UnmanagedThreadTable>,
    /// ptrace などのネイティブ制御（つながっていなければ `None`）
    native_target: RsLock<Option<Box<dyn NativeTarget>>>,
    transport: RsLock<()>,
    patches: RsLock<PatchTable>,
    events: flume::Sender<ManagedEvent>,
    shutdown: AtomicBool,
}

impl ProcessInner {
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut ProcessState) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state)
    }

    fn send(&self, event: IpcEvent, expect_reply: bool) -> Result<Option<IpcEvent>> {
        let channel = self
            .channel
            .as_ref()
            .ok_or(DebugError::InvalidOperation("no runtime is loaded in the debuggee"))?;
        let _transport = self.transport.lock();
        Ok(channel.send(event, expect_reply)?)
    }

    fn runtime_loaded(&self) -> bool {
        self.channel.is_some()
    }

    /// 止まっているネイティブスレッドを分類結果に応じて再開する
    fn resume_native(&self, event: &NativeEvent, reaction: Reaction) -> Result<()> {
        let handled = reaction.continues_handled(event);
        let mut target = self.native_target.lock();
        let target = target
            .as_mut()
            .ok_or(DebugError::InvalidOperation("no native debuggee is attached"))?;
        target
            .continue_thread(event.thread, handled)
            .map_err(DebugError::native)?;
        tracing::trace!(
            "resumed thread {} ({})",
            event.thread,
            if handled { "handled" } else { "not handled" }
        );
        Ok(())
    }

    /// 公開操作の入口のガード
    fn guard(&self, require_synchronized: bool) -> Result<()> {
        self.state
            .lock()
            .sync
            .guard(is_event_delivery_thread(), require_synchronized)
    }

    fn ensure_patch_table(&self, patches: &mut PatchTable) -> Result<()> {
        if !patches.is_valid() {
            patches.refresh(self.memory.as_ref())?;
        }
        Ok(())
    }

    /// ハンドルの drop による外部参照の解放
    pub(crate) fn release_external(&self, id: ObjectId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.registry.external_release(id) {
            ReleaseOutcome::ScheduleContinue => {
                tracing::trace!("{} scheduled for the next continue", id);
                state.continue_list.add(&mut state.registry, id);
            }
            ReleaseOutcome::AtWill => tracing::trace!("{} left to the neuter-at-will sweep", id),
            ReleaseOutcome::Retained | ReleaseOutcome::Released => {}
        }
    }

    fn mark_unrecoverable(&self, reason: &str) {
        tracing::error!("unrecoverable error: {}", reason);
        let mut state = self.state.lock();
        state.sync.latch_unrecoverable(reason);
        self.stopped.notify_all();
    }

    /// 応答の型が違うときは回復不能として記録する
    fn unexpected_reply(&self, request: &str, reply: Option<IpcEvent>) -> DebugError {
        let reason = format!("unexpected reply to {}: {:?}", request, reply);
        self.mark_unrecoverable(&reason);
        DebugError::ProtocolViolation(reason)
    }

    /// イベント配送スレッドで受信イベントを処理する。受信を続けるなら `true`
    fn dispatch(&self, event: IpcEvent) -> bool {
        match event {
            IpcEvent::SyncComplete => {
                let report = {
                    let mut state = self.state.lock();
                    let report = state.sync.on_stop_report();
                    if report == StopReport::Accepted {
                        self.stopped.notify_all();
                    }
                    report
                };
                match report {
                    StopReport::Accepted => {
                        self.patches.lock().invalidate();
                        tracing::debug!("debuggee synchronized");
                    }
                    StopReport::Unsolicited => {
                        // タイムアウトした停止要求への遅い報告
                        tracing::debug!("late stop report, releasing the debuggee");
                        if let Err(e) = self.send(IpcEvent::Continue, false) {
                            tracing::warn!("failed to release the debuggee: {}", e);
                        }
                    }
                    StopReport::Duplicate => tracing::trace!("duplicate stop report"),
                }
                true
            }
            IpcEvent::UserBreakpoint { thread } => {
                let outcome = {
                    let mut state = self.state.lock();
                    let outcome = state.sync.on_user_stop();
                    self.stopped.notify_all();
                    outcome
                };
                if outcome != UserStop::AlreadyStopped {
                    self.patches.lock().invalidate();
                }
                if outcome == UserStop::SatisfiedPendingStop {
                    // 停止カウントは待っている Stop の呼び出し側のもの
                    tracing::info!("user breakpoint on thread {} completed a pending stop", thread);
                } else {
                    tracing::info!("user breakpoint on thread {}", thread);
                    let _ = self.events.send(ManagedEvent::UserBreakpoint { thread });
                }
                true
            }
            IpcEvent::ProcessExit { code } => {
                self.on_exit(Some(code));
                false
            }
            other => {
                self.mark_unrecoverable(&format!("unexpected {} on the event stream", other.name()));
                true
            }
        }
    }

    /// デバッグ対象の終了（終了イベントまたは接続断）
    fn on_exit(&self, code: Option<i32>) {
        let neutered = {
            let mut state = self.state.lock();
            let first = state.sync.latch_terminated();
            self.stopped.notify_all();
            if !first {
                return;
            }
            state.neuter_everything()
        };
        self.patches.lock().clear();
        self.native.lock().clear();
        tracing::info!("debuggee exited (code {:?}), neutered {} object(s)", code, neutered);
        let _ = self.events.send(ManagedEvent::ProcessExited { code });
    }

    fn event_loop(self: Arc<Self>, channel: Arc<dyn EventChannel>) {
        mark_event_delivery_thread();
        tracing::debug!("event-delivery thread started");
        while !self.shutdown.load(Ordering::Acquire) {
            match channel.receive(Some(self.config.event_poll_interval)) {
                Ok(None) => {}
                Ok(Some(event)) => {
                    tracing::trace!("received {}", event.name());
                    if !self.dispatch(event) {
                        break;
                    }
                }
                Err(TransportError::TargetDied) => {
                    self.on_exit(None);
                    break;
                }
                Err(e) => {
                    self.mark_unrecoverable(&e.to_string());
                    break;
                }
            }
        }
        tracing::debug!("event-delivery thread stopped");
    }
}

/// デバッグ対象のプロセス
pub struct Process {
    inner: Arc<ProcessInner>,
    events: flume::Receiver<ManagedEvent>,
    event_thread: RsLock<Option<JoinHandle<()>>>,
}

impl Process {
    /// ループバックのデバッグ対象に接続する
    pub fn connect(target: &TargetHandle, config: ProcessConfig) -> Result<Self> {
        let channel = open_channel(target)?.with_reply_timeout(config.reply_timeout);
        Self::attach(Arc::new(channel), Arc::new(target.memory().clone()), config)
    }

    /// 開いたチャネルとメモリアクセスでデバッグ対象に接続する
    ///
    /// 左側からランタイムオフセットを受け取り、イベント配送スレッドを起動します。
    pub fn attach(
        channel: Arc<dyn EventChannel>,
        memory: Arc<dyn MemoryAccessor>,
        config: ProcessConfig,
    ) -> Result<Self> {
        let offsets = match channel.send(IpcEvent::GetRuntimeOffsets, true)? {
            Some(IpcEvent::RuntimeOffsetsResult(offsets)) => offsets,
            other => {
                return Err(DebugError::ProtocolViolation(format!(
                    "unexpected reply to GetRuntimeOffsets: {:?}",
                    other
                )))
            }
        };
        tracing::debug!("runtime offsets: {:?}", offsets);

        let process = Self::build(Some(channel.clone()), offsets, memory, config, None);
        let thread_inner = process.inner.clone();
        let event_thread = std::thread::Builder::new()
            .name("hashi-events".into())
            .spawn(move || thread_inner.event_loop(channel))
            .map_err(|e| DebugError::Unrecoverable(format!("failed to spawn event-delivery thread: {}", e)))?;
        *process.event_thread.lock() = Some(event_thread);

        tracing::info!("attached to debuggee");
        Ok(process)
    }

    /// ランタイムのないネイティブのデバッグ対象につなぐ
    ///
    /// 左側がないので停止・再開の同期は使えず、ネイティブイベントの分類と
    /// スレッドの再開だけを行います。
    pub fn attach_native(
        target: Box<dyn NativeTarget>,
        memory: Arc<dyn MemoryAccessor>,
        config: ProcessConfig,
    ) -> Self {
        tracing::info!("attached to native debuggee");
        Self::build(None, RuntimeOffsets::default(), memory, config, Some(target))
    }

    fn build(
        channel: Option<Arc<dyn EventChannel>>,
        offsets: RuntimeOffsets,
        memory: Arc<dyn MemoryAccessor>,
        config: ProcessConfig,
        native_target: Option<Box<dyn NativeTarget>>,
    ) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        let inner = Arc::new(ProcessInner {
            patches: RsLock::new(
                "patch-table",
                LockLevel::PATCH_TABLE,
                PatchTable::new(offsets.patch_table, config.max_patch_entries),
            ),
            config,
            offsets,
            channel,
            memory,
            stop_go: RsReentrantLock::new("stop-go", LockLevel::STOP_GO, true),
            state: RsLock::new("process", LockLevel::PROCESS, ProcessState::new()),
            stopped: Condvar::new(),
            native: RsLock::new("native-event", LockLevel::NATIVE_EVENT, UnmanagedThreadTable::new()),
            native_target: RsLock::new("native-target", LockLevel::LEAF, native_target),
            transport: RsLock::new("transport", LockLevel::TRANSPORT, ()),
            events: events_tx,
            shutdown: AtomicBool::new(false),
        });
        Self {
            inner,
            events: events_rx,
            event_thread: RsLock::new("event-thread", LockLevel::LEAF, None),
        }
    }

    /// ネイティブの制御をつなぐ（インターロップ用）
    pub fn set_native_target(&self, target: Box<dyn NativeTarget>) {
        *self.inner.native_target.lock() = Some(target);
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.inner.config
    }

    pub fn offsets(&self) -> RuntimeOffsets {
        self.inner.offsets
    }

    /// ライフサイクルイベントの受信側
    pub fn managed_events(&self) -> flume::Receiver<ManagedEvent> {
        self.events.clone()
    }

    pub fn is_synchronized(&self) -> bool {
        self.inner.state.lock().sync.is_synchronized()
    }

    pub fn sync_state(&self) -> SyncState {
        self.inner.state.lock().sync.state()
    }

    pub fn stop_count(&self) -> u32 {
        self.inner.state.lock().sync.stop_count()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.state.lock().registry.stats().snapshot()
    }

    /// まだ回収されていないオブジェクトの数（ルートを含む）
    pub fn live_objects(&self) -> usize {
        self.inner.state.lock().registry.len()
    }

    /// 回復不能なエラーを記録する
    pub fn mark_unrecoverable(&self, reason: &str) {
        self.inner.mark_unrecoverable(reason);
    }

    /// デバッグ対象を停止させる
    ///
    /// すでに停止していれば停止をネストします。`timeout` までに停止報告が
    /// 届かなければ状態を元に戻して `Timeout` を返します。
    pub fn stop(&self, timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        inner.guard(false)?;
        let _stop_go = inner.stop_go.acquire()?;
        {
            let mut state = inner.state.lock();
            state.sync.check_latched()?;
            if state.sync.nest_stop() {
                tracing::debug!("stop nested (count {})", state.sync.stop_count());
                return Ok(());
            }
            state.sync.begin_stop();
        }

        if let Err(e) = inner.send(IpcEvent::AsyncBreak, false) {
            inner.state.lock().sync.cancel_stop();
            return Err(e);
        }

        let deadline = Instant::now() + timeout;
        let mut state = inner.state.lock();
        loop {
            if state.sync.complete_stop() {
                tracing::info!("debuggee stopped");
                return Ok(());
            }
            state.sync.check_latched()?;
            if state.wait_until(&inner.stopped, deadline) {
                if state.sync.complete_stop() {
                    return Ok(());
                }
                state.sync.cancel_stop();
                tracing::warn!("stop timed out after {:?}", timeout);
                return Err(DebugError::Timeout(timeout));
            }
        }
    }

    /// 設定の既定タイムアウトで停止させる
    pub fn stop_default(&self) -> Result<()> {
        self.stop(self.inner.config.stop_timeout)
    }

    /// 実行を再開する
    ///
    /// 停止がネストしていればカウントを減らすだけです。最後の Continue では、
    /// 同期状態のまま Continue リストと neuter-at-will の掃除を行ってから
    /// デバッグ対象を再開させます。`out_of_band` なら保留中の帯域外イベントを
    /// 1つ再開し、停止カウントには触れません。
    pub fn continue_(&self, out_of_band: bool) -> Result<()> {
        if out_of_band {
            return self.continue_out_of_band();
        }
        let inner = &self.inner;
        inner.guard(true)?;
        let _stop_go = inner.stop_go.acquire()?;

        let releasable: Vec<(ObjectId, Option<u64>)> = {
            let mut guard = inner.state.lock();
            let state = &mut *guard;
            state.sync.guard(false, true)?;
            if !state.sync.release_stop() {
                tracing::debug!("continue unnested (count {})", state.sync.stop_count());
                return Ok(());
            }
            state.continue_list.neuter_and_clear(&mut state.registry);
            state.exit_list.sweep_neuter_at_will(&mut state.registry);
            state
                .sweepable_list
                .take_releasable(&state.registry)
                .into_iter()
                .map(|id| (id, state.registry.remote_handle(id)))
                .collect()
        };

        // プロセスロックは手放し、Stop-Go は保持したまま左側資源を解放する
        for (id, handle) in &releasable {
            let Some(handle) = *handle else {
                continue;
            };
            match inner.send(IpcEvent::ReleaseHandle { handle }, true) {
                Ok(Some(IpcEvent::HandleReleased)) => tracing::trace!("released left-side handle {} of {}", handle, id),
                Ok(other) => tracing::warn!("unexpected reply to ReleaseHandle: {:?}", other),
                Err(e) => tracing::warn!("failed to release left-side handle {} of {}: {}", handle, id, e),
            }
        }

        {
            let mut guard = inner.state.lock();
            let state = &mut *guard;
            let ids: Vec<ObjectId> = releasable.iter().map(|(id, _)| *id).collect();
            NeuterList::release_extracted(&mut state.registry, &ids);
            state.registry.reclaim();
            inner.patches.lock().invalidate();
            state.sync.finish_continue();
        }

        inner.send(IpcEvent::Continue, false)?;
        tracing::info!("debuggee continued");
        Ok(())
    }

    fn continue_out_of_band(&self) -> Result<()> {
        let inner = &self.inner;
        inner.state.lock().sync.check_latched()?;
        if inner.native_target.lock().is_none() {
            return Err(DebugError::InvalidOperation("no native debuggee is attached"));
        }
        let event = inner
            .native
            .lock()
            .pop_out_of_band()
            .ok_or(DebugError::InvalidOperation("no out-of-band event is pending"))?;
        inner.resume_native(&event, Reaction::DispatchOutOfBand)?;
        tracing::debug!("continued out-of-band event on thread {}: {:?}", event.thread, event.kind);
        Ok(())
    }

    /// 次のネイティブデバッグイベントを待って分類する
    ///
    /// 待機中はネイティブ制御のロックを保持します。ptrace の制約により、
    /// 再開（[`Process::continue_native`]、帯域外の `continue_(true)`）も
    /// 同じスレッドから呼び出してください。
    pub fn wait_native_event(&self, markers: EventMarkers) -> Result<(NativeEvent, Reaction)> {
        let event = {
            let mut target = self.inner.native_target.lock();
            let target = target
                .as_mut()
                .ok_or(DebugError::InvalidOperation("no native debuggee is attached"))?;
            target.wait_event().map_err(DebugError::native)?
        };
        let reaction = self.on_native_event(&event, markers);
        Ok((event, reaction))
    }

    /// 帯域内で処理したネイティブイベントのスレッドを再開する
    ///
    /// 帯域外のイベントは保留キューに入っているので `continue_(true)` で再開します。
    pub fn continue_native(&self, event: &NativeEvent, reaction: Reaction) -> Result<()> {
        if reaction.is_out_of_band() {
            return Err(DebugError::InvalidOperation(
                "out-of-band events are continued through the pending queue",
            ));
        }
        self.inner.resume_native(event, reaction)
    }

    /// 保留中の帯域外イベントの数
    pub fn pending_out_of_band(&self) -> usize {
        self.inner.native.lock().pending_out_of_band()
    }

    /// アドレスにブレークポイントを置く（停止中のみ）
    pub fn create_breakpoint_at_address(&self, address: u64) -> Result<BreakpointHandle> {
        let inner = &self.inner;
        inner.guard(true)?;
        let _stop_go = inner.stop_go.acquire()?;
        inner.guard(true)?;

        let remote = match inner.send(IpcEvent::BreakpointAdd { address }, true)? {
            Some(IpcEvent::BreakpointAddResult { handle: Some(handle) }) => handle,
            Some(IpcEvent::BreakpointAddResult { handle: None }) => {
                return Err(DebugError::InvalidOperation("left side rejected the breakpoint"))
            }
            other => return Err(inner.unexpected_reply("BreakpointAdd", other)),
        };

        let id = inner.state.lock().register(
            Box::new(BreakpointObject::new(address, remote)),
            NeuterListKind::Sweepable,
            false,
        )?;
        inner.patches.lock().invalidate();
        tracing::info!("breakpoint {} at 0x{:x} (left-side handle {})", id, address, remote);
        Ok(BreakpointHandle::new(ObjectHandle::new(id, inner)))
    }

    /// 有効なブレークポイントの列挙子を作る（次の Continue で無効になる）
    pub fn enumerate_breakpoints(&self) -> Result<BreakpointEnum> {
        let inner = &self.inner;
        inner.guard(true)?;
        let _stop_go = inner.stop_go.acquire()?;
        let id = {
            let mut state = inner.state.lock();
            state.sync.guard(is_event_delivery_thread(), true)?;
            let items = state.registry.live_of_kind(ObjectKind::Breakpoint);
            state.register(
                Box::new(BreakpointEnumObject::new(items)),
                NeuterListKind::Continue,
                false,
            )?
        };
        Ok(BreakpointEnum::new(ObjectHandle::new(id, inner)))
    }

    /// メモリを読む（パッチのトラップは元のオペコードに置き換える）
    pub fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let inner = &self.inner;
        inner.state.lock().sync.check_latched()?;
        let mut patches = inner.patches.lock();
        inner.ensure_patch_table(&mut patches)?;
        let mut buffer = inner.memory.read(address, len).map_err(DebugError::memory)?;
        patches.adjust_buffer(address, &mut buffer, AdjustMode::Read);
        Ok(buffer)
    }

    /// メモリに書く（停止中のみ）
    ///
    /// パッチのあるアドレスではトラップを残し、書いた値を新しい元の
    /// オペコードとしてパッチテーブルに反映します。
    pub fn write_memory(&self, address: u64, data: &[u8]) -> Result<()> {
        let inner = &self.inner;
        inner.guard(true)?;
        let _stop_go = inner.stop_go.acquire()?;
        inner.guard(true)?;
        let mut patches = inner.patches.lock();
        inner.ensure_patch_table(&mut patches)?;
        let mut buffer = data.to_vec();
        let adjusted = patches.adjust_buffer(address, &mut buffer, AdjustMode::Write);
        if let Err(e) = inner.memory.write(address, &buffer) {
            patches.clear();
            return Err(DebugError::memory(e));
        }
        if adjusted > 0 {
            patches.commit_buffer_adjustments(inner.memory.as_ref())?;
        }
        Ok(())
    }

    /// メモリのスナップショットを作る（停止中のみ、neuter-at-will）
    pub fn snapshot_memory(&self, address: u64, len: usize) -> Result<SnapshotHandle> {
        let inner = &self.inner;
        inner.guard(true)?;
        let _stop_go = inner.stop_go.acquire()?;
        let bytes = self.read_memory(address, len)?;
        let id = {
            let mut state = inner.state.lock();
            state.sync.guard(false, true)?;
            state.register(
                Box::new(MemorySnapshotObject::new(address, bytes)),
                NeuterListKind::Exit,
                true,
            )?
        };
        Ok(SnapshotHandle::new(ObjectHandle::new(id, inner)))
    }

    /// パッチテーブルを読み直す
    pub fn refresh_patch_table(&self) -> Result<usize> {
        let inner = &self.inner;
        inner.state.lock().sync.check_latched()?;
        let mut patches = inner.patches.lock();
        patches.refresh(inner.memory.as_ref())
    }

    /// キャッシュされたパッチの一覧（古ければ読み直す）
    pub fn patches(&self) -> Result<Vec<Patch>> {
        let inner = &self.inner;
        inner.state.lock().sync.check_latched()?;
        let mut patches = inner.patches.lock();
        inner.ensure_patch_table(&mut patches)?;
        Ok(patches.patches())
    }

    /// ネイティブデバッグイベントを分類する
    ///
    /// インターロップが無効なら、ハイジャックの仕組みを使わず常に帯域内で配送します。
    pub fn on_native_event(&self, event: &NativeEvent, markers: EventMarkers) -> Reaction {
        let inner = &self.inner;
        if !inner.config.interop {
            tracing::trace!("interop disabled, dispatching {:?} in-band", event.kind);
            return Reaction::DispatchInband;
        }

        let synchronized = inner.state.lock().sync.is_synchronized();
        let runtime_loaded = inner.runtime_loaded();
        let context = TriageContext {
            hijack: inner.offsets.hijack,
            runtime_loaded,
            synchronized,
        };
        let helper = inner.offsets.helper_thread;
        let markers = EventMarkers {
            on_helper_thread: markers.on_helper_thread || (helper != 0 && event.thread == helper),
            ..markers
        };

        let mut threads = inner.native.lock();
        let reaction = {
            let mut patches = inner.patches.lock();
            if runtime_loaded {
                if let Err(e) = inner.ensure_patch_table(&mut patches) {
                    tracing::warn!("patch table unavailable during triage: {}", e);
                }
            }
            triage(&context, threads.state(event.thread), event, markers, |address| {
                patches.find_patch(address).is_some()
            })
        };
        threads.apply(event, reaction);
        tracing::debug!("native event on thread {}: {:?} -> {:?}", event.thread, event.kind, reaction);
        reaction
    }

    /// デバッグ対象から切り離す（停止中のみ）
    pub fn detach(&self) -> Result<()> {
        let inner = &self.inner;
        inner.guard(true)?;
        let _stop_go = inner.stop_go.acquire()?;
        inner.guard(true)?;

        match inner.send(IpcEvent::DetachRequest, true)? {
            Some(IpcEvent::DetachComplete) => {}
            other => return Err(inner.unexpected_reply("DetachRequest", other)),
        }

        let neutered = {
            let mut state = inner.state.lock();
            state.sync.latch_detached();
            inner.stopped.notify_all();
            state.neuter_everything()
        };
        inner.patches.lock().clear();
        inner.native.lock().clear();
        self.shutdown_event_thread();
        tracing::info!("detached, neutered {} object(s)", neutered);
        let _ = inner.events.send(ManagedEvent::ProcessDetached);
        Ok(())
    }

    /// 能力の問い合わせ（ルートオブジェクト）
    pub fn supports(&self, capability: Capability) -> bool {
        let state = self.inner.state.lock();
        state.registry.supports(state.root, capability)
    }

    fn shutdown_event_thread(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let thread = self.event_thread.lock().take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                tracing::error!("event-delivery thread panicked");
            }
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.shutdown_event_thread();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashi_target::{AgentBehavior, ExceptionCode, SharedMemory, INT3_OPCODE};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// 用意したイベントを返し、再開要求を記録するネイティブ制御
    #[derive(Clone, Default)]
    struct ScriptedTarget {
        events: Arc<Mutex<VecDeque<NativeEvent>>>,
        resumed: Arc<Mutex<Vec<(ThreadId, bool)>>>,
    }

    impl NativeTarget for ScriptedTarget {
        fn wait_event(&mut self) -> hashi_target::Result<NativeEvent> {
            self.events
                .lock()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("no more native events"))
        }

        fn continue_thread(&mut self, thread: ThreadId, handled: bool) -> hashi_target::Result<()> {
            self.resumed.lock().push((thread, handled));
            Ok(())
        }
    }

    fn session(behavior: AgentBehavior) -> (TargetHandle, Process) {
        let target = TargetHandle::launch(behavior).unwrap();
        let config = ProcessConfig::default()
            .with_reply_timeout(Duration::from_secs(2))
            .with_interop(true);
        let process = Process::connect(&target, config).unwrap();
        (target, process)
    }

    #[test]
    fn test_connect_receives_offsets() {
        let (target, process) = session(AgentBehavior::default());
        assert_eq!(process.offsets(), target.offsets());
        assert_eq!(process.sync_state(), SyncState::Running);
        assert!(!process.supports(Capability::Breakpoint));
        // ルートオブジェクトだけが登録されている
        assert_eq!(process.live_objects(), 1);
    }

    #[test]
    fn test_operations_require_synchronization() {
        let (target, process) = session(AgentBehavior::default());
        assert_eq!(process.continue_(false), Err(DebugError::NotSynchronized));
        assert_eq!(
            process.create_breakpoint_at_address(target.code_base()).err(),
            Some(DebugError::NotSynchronized)
        );
        assert_eq!(process.enumerate_breakpoints().err(), Some(DebugError::NotSynchronized));
        assert_eq!(process.detach(), Err(DebugError::NotSynchronized));
        assert_eq!(
            process.snapshot_memory(target.code_base(), 4).err(),
            Some(DebugError::NotSynchronized)
        );
        assert_eq!(
            process.write_memory(target.code_base(), &[0]),
            Err(DebugError::NotSynchronized)
        );
        assert_eq!(
            process.continue_(true),
            Err(DebugError::InvalidOperation("no native debuggee is attached"))
        );

        process.set_native_target(Box::new(ScriptedTarget::default()));
        assert_eq!(
            process.continue_(true),
            Err(DebugError::InvalidOperation("no out-of-band event is pending"))
        );
    }

    #[test]
    fn test_breakpoint_is_hidden_from_reads() {
        let (target, process) = session(AgentBehavior::default());
        process.stop(Duration::from_secs(2)).unwrap();
        let address = target.code_base() + 0x20;
        let bp = process.create_breakpoint_at_address(address).unwrap();
        assert_eq!(bp.address(), Ok(address));
        assert_eq!(bp.is_active(), Ok(true));

        assert_eq!(target.memory().read(address, 1).unwrap(), vec![INT3_OPCODE]);
        assert_eq!(process.read_memory(address, 1).unwrap(), vec![0x90]);
        assert_eq!(process.patches().unwrap().len(), 1);
    }

    #[test]
    fn test_native_event_triage_uses_patch_table() {
        let (target, process) = session(AgentBehavior::default());
        process.stop(Duration::from_secs(2)).unwrap();
        let address = target.code_base() + 0x30;
        let _bp = process.create_breakpoint_at_address(address).unwrap();

        let markers = EventMarkers::default();
        let reaction = process.on_native_event(&NativeEvent::breakpoint(9, address), markers);
        assert_eq!(reaction, Reaction::BreakpointNeedsHijack);

        // ヘルパースレッドのイベントは帯域外
        let native = ScriptedTarget::default();
        process.set_native_target(Box::new(native.clone()));
        let helper = target.offsets().helper_thread;
        let reaction = process.on_native_event(&NativeEvent::breakpoint(helper, address), markers);
        assert_eq!(reaction, Reaction::DispatchOutOfBand);
        assert_eq!(process.pending_out_of_band(), 1);
        assert_eq!(process.continue_(true), Ok(()));
        assert_eq!(process.pending_out_of_band(), 0);
        assert_eq!(*native.resumed.lock(), vec![(helper, true)]);
    }

    #[test]
    fn test_native_only_process() {
        let native = ScriptedTarget::default();
        let fault = NativeEvent::exception(11, ExceptionCode::AccessViolation, 0x2000, true);
        let managed = NativeEvent::exception(11, ExceptionCode::ManagedException, 0x2000, true);
        native.events.lock().extend([fault.clone(), managed]);

        let memory = Arc::new(SharedMemory::new(0x1000, 0x100));
        let config = ProcessConfig::default().with_interop(true);
        let process = Process::attach_native(Box::new(native.clone()), memory, config);

        // 左側がないので同期操作はできない
        assert_eq!(
            process.stop(Duration::from_millis(10)),
            Err(DebugError::InvalidOperation("no runtime is loaded in the debuggee"))
        );
        assert_eq!(process.sync_state(), SyncState::Running);

        let (event, reaction) = process.wait_native_event(EventMarkers::default()).unwrap();
        assert_eq!(event, fault);
        assert_eq!(reaction, Reaction::DispatchInband);
        process.continue_native(&event, reaction).unwrap();

        // ランタイムがなければマネージド例外も普通の例外として配送する
        let (event, reaction) = process.wait_native_event(EventMarkers::default()).unwrap();
        assert_eq!(reaction, Reaction::DispatchInband);
        process.continue_native(&event, reaction).unwrap();
        assert_eq!(*native.resumed.lock(), vec![(11, false), (11, false)]);

        assert!(matches!(
            process.wait_native_event(EventMarkers::default()),
            Err(DebugError::Native(_))
        ));
    }

    #[test]
    fn test_managed_exception_is_expected_with_runtime() {
        let (_target, process) = session(AgentBehavior::default());
        let managed = NativeEvent::exception(11, ExceptionCode::ManagedException, 0x2000, true);
        assert_eq!(
            process.on_native_event(&managed, EventMarkers::default()),
            Reaction::InternalRuntimeExpected
        );
    }

    #[test]
    fn test_interop_disabled_dispatches_inband() {
        let target = TargetHandle::launch(AgentBehavior::default()).unwrap();
        let process = Process::connect(&target, ProcessConfig::default()).unwrap();
        let event = NativeEvent::breakpoint(1, target.offsets().hijack.signal_hijack_started);
        assert_eq!(
            process.on_native_event(&event, EventMarkers::default()),
            Reaction::DispatchInband
        );
    }
}
