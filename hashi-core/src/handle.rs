//! 呼び出し側が保持するオブジェクトハンドル
//!
//! ハンドルは外部参照を1つ表します。クローンで外部参照を増やし、
//! drop で減らします。プロセスへの参照は弱参照なので、ハンドルが
//! プロセスを生かし続けることはありません。

use crate::errors::DebugError;
use crate::object::{Capability, DebugObject, ObjectId};
use crate::process::{ProcessInner, ProcessState};
use crate::Result;
use std::fmt;
use std::sync::{Arc, Weak};

pub struct ObjectHandle {
    id: ObjectId,
    process: Weak<ProcessInner>,
}

impl ObjectHandle {
    /// 外部参照を取得済みのオブジェクトからハンドルを作る
    pub(crate) fn new(id: ObjectId, process: &Arc<ProcessInner>) -> Self {
        Self {
            id,
            process: Arc::downgrade(process),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// neuter 済みか（プロセスが破棄されていれば真）
    pub fn is_neutered(&self) -> bool {
        self.process
            .upgrade()
            .map_or(true, |p| p.with_state(|state| state.registry.is_neutered(self.id)))
    }

    /// 能力の問い合わせ（neuter 後も可能）
    pub fn supports(&self, capability: Capability) -> bool {
        self.process
            .upgrade()
            .is_some_and(|p| p.with_state(|state| state.registry.supports(self.id, capability)))
    }

    pub(crate) fn process(&self) -> Result<Arc<ProcessInner>> {
        self.process.upgrade().ok_or(DebugError::Disposed)
    }

    /// payload を読む（neuter 済みなら `Disposed`）
    pub(crate) fn read<T: DebugObject, R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        self.process()?
            .with_state(|state| state.registry.payload::<T>(self.id).map(f))
    }

    /// プロセス状態とともに操作する
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut ProcessState) -> Result<R>) -> Result<R> {
        self.process()?.with_state(f)
    }
}

impl Clone for ObjectHandle {
    fn clone(&self) -> Self {
        if let Some(process) = self.process.upgrade() {
            if let Err(e) = process.with_state(|state| state.registry.external_add_ref(self.id)) {
                tracing::warn!("cloning handle of reclaimed object {}: {}", self.id, e);
            }
        }
        Self {
            id: self.id,
            process: self.process.clone(),
        }
    }
}

impl Drop for ObjectHandle {
    fn drop(&mut self) {
        if let Some(process) = self.process.upgrade() {
            process.release_external(self.id);
        }
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHandle").field("id", &self.id).finish()
    }
}
