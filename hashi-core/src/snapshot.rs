//! メモリスナップショット
//!
//! 読み取った時点のメモリ（パッチは隠した状態）を保持する neuter-at-will の
//! オブジェクトです。外部参照がなくなると次の Continue の掃除で回収されます。

use crate::errors::DebugError;
use crate::handle::ObjectHandle;
use crate::object::{Capability, DebugObject, ObjectKind};
use crate::Result;
use std::any::Any;
use std::ops::Deref;

pub(crate) struct MemorySnapshotObject {
    address: u64,
    bytes: Vec<u8>,
}

impl MemorySnapshotObject {
    pub(crate) fn new(address: u64, bytes: Vec<u8>) -> Self {
        Self { address, bytes }
    }
}

impl DebugObject for MemorySnapshotObject {
    fn kind(&self) -> ObjectKind {
        ObjectKind::MemorySnapshot
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::MemoryRead]
    }

    fn neuter(&mut self) {
        self.bytes = Vec::new();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotHandle(ObjectHandle);

impl SnapshotHandle {
    pub(crate) fn new(handle: ObjectHandle) -> Self {
        Self(handle)
    }

    pub fn address(&self) -> Result<u64> {
        self.0.read(|s: &MemorySnapshotObject| s.address)
    }

    pub fn len(&self) -> Result<usize> {
        self.0.read(|s: &MemorySnapshotObject| s.bytes.len())
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        self.0.read(|s: &MemorySnapshotObject| s.bytes.clone())
    }

    /// スナップショット内の `offset` から `len` バイトを返す
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.0
            .read(|s: &MemorySnapshotObject| {
                offset
                    .checked_add(len)
                    .and_then(|end| s.bytes.get(offset..end))
                    .map(<[u8]>::to_vec)
            })?
            .ok_or(DebugError::InvalidOperation("read outside the snapshot"))
    }
}

impl Deref for SnapshotHandle {
    type Target = ObjectHandle;

    fn deref(&self) -> &ObjectHandle {
        &self.0
    }
}
