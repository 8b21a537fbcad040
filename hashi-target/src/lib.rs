//! Hashi ターゲット境界
//!
//! このクレートは、右側エンジンがデバッグ対象と接する境界の部品を提供します。
//! 左側とのイベントチャネル、リモートメモリアクセス、ネイティブデバッグイベント、
//! ptrace によるネイティブプロセス制御を扱います。

pub mod agent;
pub mod channel;
pub mod inferior;
pub mod memory;
pub mod native;
pub mod offsets;

pub use agent::{open_channel, AgentBehavior, TargetHandle};
pub use channel::{EventChannel, IpcEvent, LoopbackChannel, TransportError};
pub use inferior::{Inferior, NativeTarget};
pub use memory::{MemoryAccessor, ProcMemory, SharedMemory};
pub use native::{ExceptionCode, NativeEvent, NativeEventKind, ThreadId, INT3_OPCODE};
pub use offsets::{HijackAddresses, PatchTableLayout, RuntimeOffsets};

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;
