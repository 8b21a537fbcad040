//! ループバックの左側エージェント
//!
//! 本物のランタイムの代わりに、同一プロセス内のスレッドで左側の振る舞いを
//! 再現します。メモリイメージ（[`SharedMemory`]）の中にパッチテーブルと
//! コード領域を持ち、右側からの要求に応じてINT3の書き込み・復元を行います。

use crate::channel::{AgentEndpoint, IpcEvent, LoopbackChannel, Request, TransportError};
use crate::memory::{read_scalar, write_scalar, MemoryAccessor, SharedMemory};
use crate::native::{ThreadId, INT3_OPCODE};
use crate::offsets::{HijackAddresses, PatchTableLayout, RuntimeOffsets};
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// パッチテーブルヘッダのイメージ内オフセット
const PATCH_HEADER_OFFSET: u64 = 0x0;
/// パッチエントリ配列のイメージ内オフセット
const PATCH_ENTRIES_OFFSET: u64 = 0x100;
/// 1エントリのサイズ（アドレス8 + オペコード4 + 予約4 + トレース種別4 + 予約4）
const PATCH_ENTRY_SIZE: u64 = 24;
/// ハイジャック用ブレークポイント群のイメージ内オフセット
const HIJACK_STUBS_OFFSET: u64 = 0x800;
/// コード領域のイメージ内オフセット
pub const CODE_OFFSET: u64 = 0x1000;
/// コード領域の初期値（NOP）
const CODE_FILL: u8 = 0x90;
/// 制御要求を確認する間隔
const POLL_TICK: Duration = Duration::from_millis(5);

/// エージェントの振る舞い
#[derive(Debug, Clone)]
pub struct AgentBehavior {
    /// 非同期停止要求から停止報告までの遅延（`None` なら報告しない）
    pub stop_latency: Option<Duration>,
    /// メモリイメージの開始アドレス
    pub image_base: u64,
    /// メモリイメージのサイズ
    pub image_size: usize,
    /// パッチテーブルのスロット数
    pub patch_capacity: u32,
    /// デバッガヘルパースレッドのID
    pub helper_thread: ThreadId,
}

impl Default for AgentBehavior {
    fn default() -> Self {
        Self {
            stop_latency: Some(Duration::from_millis(10)),
            image_base: 0x10_0000,
            image_size: 0x4000,
            patch_capacity: 32,
            helper_thread: 2,
        }
    }
}

/// テスト・デモ用にエージェントへ送る制御
#[derive(Debug)]
enum Control {
    Exit(i32),
    Kill,
    UserBreakpoint(ThreadId),
}

/// 起動済みのループバックデバッグ対象
pub struct TargetHandle {
    channel: Mutex<Option<LoopbackChannel>>,
    control: flume::Sender<Control>,
    memory: SharedMemory,
    offsets: RuntimeOffsets,
    thread: Option<JoinHandle<()>>,
}

impl TargetHandle {
    /// エージェントを起動する
    pub fn launch(behavior: AgentBehavior) -> Result<Self> {
        let min_size = (CODE_OFFSET as usize) + 1;
        if behavior.image_size < min_size {
            anyhow::bail!("image size must be at least {} bytes", min_size);
        }
        let entries_end =
            PATCH_ENTRIES_OFFSET + u64::from(behavior.patch_capacity) * PATCH_ENTRY_SIZE;
        if entries_end > HIJACK_STUBS_OFFSET {
            anyhow::bail!("patch capacity {} does not fit the image", behavior.patch_capacity);
        }

        let memory = SharedMemory::new(behavior.image_base, behavior.image_size);
        let offsets = Self::layout(&behavior);
        Self::initialize_image(&memory, &behavior, &offsets)?;

        let (channel, endpoint) = LoopbackChannel::pair(Duration::from_secs(5));
        let (control_tx, control_rx) = flume::unbounded();
        let agent = Agent {
            endpoint,
            control: control_rx,
            memory: memory.clone(),
            offsets,
            behavior,
            stopped: false,
            pending_sync: None,
            handles: HashMap::new(),
            next_handle: 1,
        };
        let thread = std::thread::Builder::new()
            .name("hashi-agent".into())
            .spawn(move || agent.run())?;

        Ok(Self {
            channel: Mutex::new(Some(channel)),
            control: control_tx,
            memory,
            offsets,
            thread: Some(thread),
        })
    }

    fn layout(behavior: &AgentBehavior) -> RuntimeOffsets {
        let base = behavior.image_base;
        let stub = |n: u64| base + HIJACK_STUBS_OFFSET + n * 0x10;
        RuntimeOffsets {
            patch_table: PatchTableLayout {
                table_address: base + PATCH_HEADER_OFFSET,
                entries_offset: 0,
                count_offset: 8,
                entry_size: PATCH_ENTRY_SIZE,
                address_offset: 0,
                opcode_offset: 8,
                trace_type_offset: 16,
                trace_type_unmanaged: 1,
            },
            hijack: HijackAddresses {
                signal_hijack_started: stub(0),
                signal_hijack_complete: stub(1),
                excep_for_runtime_handoff_start: stub(2),
                excep_for_runtime_handoff_complete: stub(3),
                excep_not_for_runtime: stub(4),
                notify_rs_of_sync_complete: stub(5),
            },
            helper_thread: behavior.helper_thread,
        }
    }

    fn initialize_image(memory: &SharedMemory, behavior: &AgentBehavior, offsets: &RuntimeOffsets) -> Result<()> {
        let layout = &offsets.patch_table;
        let code_len = behavior.image_size - CODE_OFFSET as usize;
        memory.write(behavior.image_base + CODE_OFFSET, &vec![CODE_FILL; code_len])?;
        write_scalar(
            memory,
            layout.table_address + layout.entries_offset,
            behavior.image_base + PATCH_ENTRIES_OFFSET,
        )?;
        write_scalar(memory, layout.table_address + layout.count_offset, behavior.patch_capacity)?;
        Ok(())
    }

    /// デバッグ対象のメモリイメージ
    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    pub fn offsets(&self) -> RuntimeOffsets {
        self.offsets
    }

    /// コード領域の先頭アドレス
    pub fn code_base(&self) -> u64 {
        self.memory.base() + CODE_OFFSET
    }

    /// デバッグ対象を終了させる（終了イベントが届く）
    pub fn exit(&self, code: i32) {
        let _ = self.control.send(Control::Exit(code));
    }

    /// デバッグ対象をクラッシュさせる（イベントなしで接続が切れる）
    pub fn kill(&self) {
        let _ = self.control.send(Control::Kill);
    }

    /// ユーザーブレークポイントで停止させる
    pub fn raise_user_breakpoint(&self, thread: ThreadId) {
        let _ = self.control.send(Control::UserBreakpoint(thread));
    }
}

impl Drop for TargetHandle {
    fn drop(&mut self) {
        self.kill();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// デバッグ対象へのチャネルを開く
///
/// 1つのデバッグ対象に対して開けるのは一度だけです。
pub fn open_channel(target: &TargetHandle) -> std::result::Result<LoopbackChannel, TransportError> {
    target.channel.lock().take().ok_or(TransportError::AlreadyOpen)
}

/// 左側エージェント本体（専用スレッドで動く）
struct Agent {
    endpoint: AgentEndpoint,
    control: flume::Receiver<Control>,
    memory: SharedMemory,
    offsets: RuntimeOffsets,
    behavior: AgentBehavior,
    stopped: bool,
    pending_sync: Option<Instant>,
    /// ハンドル → パッチスロット
    handles: HashMap<u64, u32>,
    next_handle: u64,
}

impl Agent {
    fn run(mut self) {
        tracing::debug!("agent started");
        loop {
            match self.control.try_recv() {
                Ok(Control::Exit(code)) => {
                    let _ = self.endpoint.events.send(IpcEvent::ProcessExit { code });
                    break;
                }
                Ok(Control::Kill) => break,
                Ok(Control::UserBreakpoint(thread)) => {
                    if !self.stopped {
                        self.stopped = true;
                        self.pending_sync = None;
                        let _ = self.endpoint.events.send(IpcEvent::UserBreakpoint { thread });
                    }
                }
                Err(_) => {}
            }

            let now = Instant::now();
            if let Some(deadline) = self.pending_sync {
                if deadline <= now {
                    self.pending_sync = None;
                    self.stopped = true;
                    let _ = self.endpoint.events.send(IpcEvent::SyncComplete);
                    continue;
                }
            }
            let wait = self
                .pending_sync
                .map(|deadline| deadline.saturating_duration_since(now).min(POLL_TICK))
                .unwrap_or(POLL_TICK);

            match self.endpoint.requests.recv_timeout(wait) {
                Ok(request) => self.handle(request),
                Err(flume::RecvTimeoutError::Timeout) => {}
                // 右側がチャネルを閉じた
                Err(flume::RecvTimeoutError::Disconnected) => break,
            }
        }
        self.endpoint.alive.store(false, Ordering::Release);
        tracing::debug!("agent stopped");
    }

    fn handle(&mut self, request: Request) {
        let Request { event, reply } = request;
        let response = match event {
            IpcEvent::AsyncBreak => {
                if self.stopped {
                    let _ = self.endpoint.events.send(IpcEvent::SyncComplete);
                } else if let Some(latency) = self.behavior.stop_latency {
                    self.pending_sync = Some(Instant::now() + latency);
                }
                None
            }
            IpcEvent::Continue => {
                self.stopped = false;
                self.pending_sync = None;
                None
            }
            IpcEvent::GetRuntimeOffsets => Some(IpcEvent::RuntimeOffsetsResult(self.offsets)),
            IpcEvent::BreakpointAdd { address } => {
                let handle = match self.add_patch(address) {
                    Ok(handle) => handle,
                    Err(e) => {
                        tracing::warn!("agent failed to add patch at 0x{:x}: {}", address, e);
                        None
                    }
                };
                Some(IpcEvent::BreakpointAddResult { handle })
            }
            IpcEvent::ReleaseHandle { handle } => {
                if let Err(e) = self.remove_patch(handle) {
                    tracing::warn!("agent failed to release handle {}: {}", handle, e);
                }
                Some(IpcEvent::HandleReleased)
            }
            IpcEvent::DetachRequest => {
                let handles: Vec<u64> = self.handles.keys().copied().collect();
                for handle in handles {
                    if let Err(e) = self.remove_patch(handle) {
                        tracing::warn!("agent failed to release handle {}: {}", handle, e);
                    }
                }
                self.stopped = false;
                self.pending_sync = None;
                Some(IpcEvent::DetachComplete)
            }
            other => {
                tracing::warn!("agent ignored unexpected request {}", other.name());
                None
            }
        };

        if let (Some(reply), Some(response)) = (reply, response) {
            let _ = reply.send(response);
        }
    }

    fn entries(&self) -> Result<u64> {
        let layout = &self.offsets.patch_table;
        read_scalar(&self.memory, layout.table_address + layout.entries_offset)
    }

    fn entry(&self, entries: u64, slot: u32) -> Result<u64> {
        self.offsets
            .patch_table
            .entry_address(entries, u64::from(slot))
            .ok_or_else(|| anyhow::anyhow!("patch slot {} is outside the address space", slot))
    }

    /// 空きスロットにパッチを登録し、INT3 を書き込む
    fn add_patch(&mut self, address: u64) -> Result<Option<u64>> {
        let code_start = self.memory.base() + CODE_OFFSET;
        let code_end = self.memory.base() + self.memory.size() as u64;
        if !(code_start..code_end).contains(&address) {
            return Ok(None);
        }

        let layout = self.offsets.patch_table;
        let entries = self.entries()?;
        let mut free = None;
        for slot in 0..self.behavior.patch_capacity {
            let entry = self.entry(entries, slot)?;
            let patched: u64 = read_scalar(&self.memory, entry + layout.address_offset)?;
            if patched == address {
                // 同じアドレスに二重のトラップは置かない
                return Ok(None);
            }
            if patched == 0 && free.is_none() {
                free = Some(slot);
            }
        }
        let Some(slot) = free else {
            return Ok(None);
        };

        let entry = self.entry(entries, slot)?;
        let original: u8 = read_scalar(&self.memory, address)?;
        write_scalar(&self.memory, entry + layout.address_offset, address)?;
        write_scalar(&self.memory, entry + layout.opcode_offset, u32::from(original))?;
        write_scalar(&self.memory, entry + layout.trace_type_offset, 0u32)?;
        write_scalar(&self.memory, address, INT3_OPCODE)?;

        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(handle, slot);
        tracing::debug!("agent patched 0x{:x} (slot {}, handle {})", address, slot, handle);
        Ok(Some(handle))
    }

    /// パッチを外し、保存されているオペコードを書き戻す
    fn remove_patch(&mut self, handle: u64) -> Result<()> {
        let Some(slot) = self.handles.remove(&handle) else {
            return Ok(());
        };
        let layout = self.offsets.patch_table;
        let entry = self.entry(self.entries()?, slot)?;
        let address: u64 = read_scalar(&self.memory, entry + layout.address_offset)?;
        let opcode: u32 = read_scalar(&self.memory, entry + layout.opcode_offset)?;
        if address != 0 {
            write_scalar(&self.memory, address, opcode as u8)?;
        }
        self.memory.write(entry, &vec![0; layout.entry_size as usize])?;
        Ok(())
    }
}
