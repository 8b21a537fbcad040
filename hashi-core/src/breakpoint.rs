//! ブレークポイントオブジェクト
//!
//! 左側のパッチ1つに対応します。左側の資源ハンドルを持つので、
//! Sweepable リストに登録され、neuter されたあとの Continue で解放されます。

use crate::handle::ObjectHandle;
use crate::object::{Capability, DebugObject, ObjectKind};
use crate::Result;
use std::any::Any;
use std::ops::Deref;

pub(crate) struct BreakpointObject {
    address: u64,
    remote: u64,
    active: bool,
}

impl BreakpointObject {
    pub(crate) fn new(address: u64, remote: u64) -> Self {
        Self {
            address,
            remote,
            active: true,
        }
    }
}

impl DebugObject for BreakpointObject {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Breakpoint
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Breakpoint]
    }

    fn neuter(&mut self) {
        // パッチ自体は Continue 時に左側へ解放を頼む
        self.active = false;
    }

    fn remote_handle(&self) -> Option<u64> {
        Some(self.remote)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// ブレークポイントへのハンドル
#[derive(Debug, Clone)]
pub struct BreakpointHandle(ObjectHandle);

impl BreakpointHandle {
    pub(crate) fn new(handle: ObjectHandle) -> Self {
        Self(handle)
    }

    pub fn address(&self) -> Result<u64> {
        self.0.read(|bp: &BreakpointObject| bp.address)
    }

    pub fn is_active(&self) -> Result<bool> {
        self.0.read(|bp: &BreakpointObject| bp.active)
    }

    /// 左側でのパッチのハンドル
    pub fn remote_handle(&self) -> Result<u64> {
        self.0.read(|bp: &BreakpointObject| bp.remote)
    }
}

impl Deref for BreakpointHandle {
    type Target = ObjectHandle;

    fn deref(&self) -> &ObjectHandle {
        &self.0
    }
}
