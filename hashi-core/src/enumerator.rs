//! ブレークポイントの列挙子
//!
//! 列挙子は Continue リストに載るので、次の Continue で neuter されます。

use crate::breakpoint::BreakpointHandle;
use crate::handle::ObjectHandle;
use crate::object::{Capability, DebugObject, ObjectId, ObjectKind};
use crate::Result;
use std::any::Any;
use std::ops::Deref;

pub(crate) struct BreakpointEnumObject {
    /// 列挙対象（弱参照、IDは再利用されない）
    items: Vec<ObjectId>,
    cursor: usize,
}

impl BreakpointEnumObject {
    pub(crate) fn new(items: Vec<ObjectId>) -> Self {
        Self { items, cursor: 0 }
    }
}

impl DebugObject for BreakpointEnumObject {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Enumerator
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Enumerator, Capability::TypedEnumerator]
    }

    fn neuter(&mut self) {
        self.items.clear();
        self.cursor = 0;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// ブレークポイント列挙子へのハンドル
#[derive(Debug, Clone)]
pub struct BreakpointEnum(ObjectHandle);

impl BreakpointEnum {
    pub(crate) fn new(handle: ObjectHandle) -> Self {
        Self(handle)
    }

    /// 列挙対象の総数
    pub fn count(&self) -> Result<usize> {
        self.0.read(|e: &BreakpointEnumObject| e.items.len())
    }

    pub fn reset(&self) -> Result<()> {
        self.0.with_state(|state| {
            state.registry.payload_mut::<BreakpointEnumObject>(self.0.id())?.cursor = 0;
            Ok(())
        })
    }

    pub fn skip(&self, n: usize) -> Result<()> {
        self.0.with_state(|state| {
            let e = state.registry.payload_mut::<BreakpointEnumObject>(self.0.id())?;
            e.cursor = (e.cursor + n).min(e.items.len());
            Ok(())
        })
    }

    /// 次のブレークポイントを返す
    ///
    /// 列挙後に neuter されたものは飛ばします。
    pub fn next(&self) -> Result<Option<BreakpointHandle>> {
        let process = self.0.process()?;
        let next = self.0.with_state(|state| loop {
            let e = state.registry.payload_mut::<BreakpointEnumObject>(self.0.id())?;
            let Some(item) = e.items.get(e.cursor).copied() else {
                return Ok(None);
            };
            e.cursor += 1;
            if state.registry.is_neutered(item) {
                continue;
            }
            state.registry.external_add_ref(item)?;
            return Ok(Some(item));
        })?;
        Ok(next.map(|id| BreakpointHandle::new(ObjectHandle::new(id, &process))))
    }

    /// 残りをすべて取り出す
    pub fn collect_remaining(&self) -> Result<Vec<BreakpointHandle>> {
        let mut handles = Vec::new();
        while let Some(handle) = self.next()? {
            handles.push(handle);
        }
        Ok(handles)
    }
}

impl Deref for BreakpointEnum {
    type Target = ObjectHandle;

    fn deref(&self) -> &ObjectHandle {
        &self.0
    }
}
