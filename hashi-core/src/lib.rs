//! Hashi デバッガエンジンのコア機能
//!
//! このクレートは、別プロセスのマネージドコードを制御する右側エンジンを提供します。
//! オブジェクトの寿命管理（neuter）、ロック階層、停止・再開の同期、
//! ネイティブイベントの分類、パッチテーブルのキャッシュを [`Process`] が束ねます。

pub mod breakpoint;
pub mod command;
pub mod config;
pub mod enumerator;
pub mod errors;
pub mod handle;
pub mod lock;
pub mod neuter;
pub mod object;
pub mod parse;
pub mod patch;
pub mod process;
pub mod snapshot;
pub mod sync;
pub mod triage;

pub use breakpoint::BreakpointHandle;
pub use command::Command;
pub use config::ProcessConfig;
pub use enumerator::BreakpointEnum;
pub use errors::DebugError;
pub use handle::ObjectHandle;
pub use object::{Capability, ObjectId, ObjectKind, StatsSnapshot};
pub use patch::Patch;
pub use process::{ManagedEvent, Process};
pub use snapshot::SnapshotHandle;
pub use sync::SyncState;
pub use triage::{EventMarkers, Reaction, ThreadHijackState};

// 他のクレートから使用するために再エクスポート
pub use hashi_target::{NativeEvent, NativeEventKind, ThreadId};

/// エンジンの結果型
pub type Result<T> = std::result::Result<T, DebugError>;
