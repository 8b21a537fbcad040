//! デバッグオブジェクトの寿命管理（neuter）
//!
//! エンジンが作るすべてのオブジェクトは [`ObjectRegistry`] に登録され、
//! 内部参照数（エンジン内の相互参照）と外部参照数（呼び出し側のハンドル）を
//! 別々に数えます。外部参照数が0になっても即座には破棄しません。
//! 所有者の Continue リストに載せるか、neuter-at-will であれば遅延掃除に回します。
//!
//! 破棄は [`ObjectRegistry::reclaim`] の掃除パスでのみ行われ、
//! 解放呼び出しの中で payload が drop されることはありません。

use crate::errors::DebugError;
use crate::Result;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// オブジェクトID（プロセス全体で一意、再利用されない）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u64);

impl ObjectId {
    fn next() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// オブジェクトの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Process,
    Breakpoint,
    Enumerator,
    MemorySnapshot,
}

/// neuter 後も問い合わせできる能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Enumerator,
    TypedEnumerator,
    Breakpoint,
    MemoryRead,
}

/// レジストリに登録される payload
pub trait DebugObject: Send + 'static {
    fn kind(&self) -> ObjectKind;

    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    /// 派生側の neuter 処理（基底の処理はレジストリが必ず後から行う）
    ///
    /// ここで左側との通信を行ってはいけません。
    fn neuter(&mut self) {}

    /// neuter 後も残る左側資源のハンドル
    fn remote_handle(&self) -> Option<u64> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// `external_release` の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// まだ外部参照が残っている
    Retained,
    /// 所有者の Continue リストに載せる必要がある
    ScheduleContinue,
    /// neuter-at-will なので次の掃除で回収される
    AtWill,
    /// すでに neuter 済み
    Released,
}

/// オブジェクト数の統計（診断用）
#[derive(Debug, Default)]
pub struct ObjectStats {
    created: AtomicU64,
    live: AtomicU64,
    disposed: AtomicU64,
}

/// [`ObjectStats`] のある時点の値
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub created: u64,
    pub live: u64,
    pub disposed: u64,
}

impl ObjectStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            live: self.live.load(Ordering::Relaxed),
            disposed: self.disposed.load(Ordering::Relaxed),
        }
    }
}

struct Entry {
    kind: ObjectKind,
    internal: u32,
    external: u32,
    neutered: bool,
    neuter_at_will: bool,
    /// 所有者（弱参照、neuter で消える）
    owner: Option<ObjectId>,
    /// 強参照の子（それぞれ内部参照を1つ持つ）
    children: Vec<ObjectId>,
    payload: Box<dyn DebugObject>,
}

/// オブジェクトのアリーナ
pub struct ObjectRegistry {
    entries: HashMap<ObjectId, Entry>,
    stats: Arc<ObjectStats>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            stats: Arc::new(ObjectStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<ObjectStats> {
        &self.stats
    }

    /// 登録されている（まだ回収されていない）オブジェクトの数
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.entries.contains_key(&id)
    }

    /// オブジェクトを登録する（参照数は両方0）
    pub fn create(&mut self, owner: Option<ObjectId>, payload: Box<dyn DebugObject>) -> ObjectId {
        let id = ObjectId::next();
        let kind = payload.kind();
        self.entries.insert(
            id,
            Entry {
                kind,
                internal: 0,
                external: 0,
                neutered: false,
                neuter_at_will: false,
                owner,
                children: Vec::new(),
                payload,
            },
        );
        self.stats.created.fetch_add(1, Ordering::Relaxed);
        self.stats.live.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("created {:?} {}", kind, id);
        id
    }

    fn entry(&self, id: ObjectId) -> Result<&Entry> {
        self.entries.get(&id).ok_or(DebugError::Disposed)
    }

    fn entry_mut(&mut self, id: ObjectId) -> Result<&mut Entry> {
        self.entries.get_mut(&id).ok_or(DebugError::Disposed)
    }

    pub fn kind(&self, id: ObjectId) -> Option<ObjectKind> {
        self.entries.get(&id).map(|e| e.kind)
    }

    pub fn owner(&self, id: ObjectId) -> Option<ObjectId> {
        self.entries.get(&id).and_then(|e| e.owner)
    }

    pub fn children(&self, id: ObjectId) -> &[ObjectId] {
        self.entries.get(&id).map(|e| e.children.as_slice()).unwrap_or(&[])
    }

    /// (内部参照数, 外部参照数)
    pub fn counts(&self, id: ObjectId) -> Option<(u32, u32)> {
        self.entries.get(&id).map(|e| (e.internal, e.external))
    }

    /// 回収済みのIDも neuter 済みとして扱う
    pub fn is_neutered(&self, id: ObjectId) -> bool {
        self.entries.get(&id).map_or(true, |e| e.neutered)
    }

    pub fn is_neuter_at_will(&self, id: ObjectId) -> bool {
        self.entries.get(&id).is_some_and(|e| e.neuter_at_will)
    }

    /// neuter-at-will で、外部参照がもう残っていないか
    pub fn is_at_will_unreferenced(&self, id: ObjectId) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|e| e.neuter_at_will && e.external == 0)
    }

    pub fn set_neuter_at_will(&mut self, id: ObjectId) -> Result<()> {
        self.entry_mut(id)?.neuter_at_will = true;
        Ok(())
    }

    /// neuter 済みなら `Disposed`
    pub fn check_alive(&self, id: ObjectId) -> Result<()> {
        if self.entry(id)?.neutered {
            return Err(DebugError::Disposed);
        }
        Ok(())
    }

    /// 能力の問い合わせ（neuter 後も可能）
    pub fn supports(&self, id: ObjectId, capability: Capability) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|e| e.payload.capabilities().contains(&capability))
    }

    /// 左側資源のハンドル（neuter 後も取得できる）
    pub fn remote_handle(&self, id: ObjectId) -> Option<u64> {
        self.entries.get(&id).and_then(|e| e.payload.remote_handle())
    }

    /// 型付きで payload を参照する
    pub fn payload<T: DebugObject>(&self, id: ObjectId) -> Result<&T> {
        let entry = self.entry(id)?;
        if entry.neutered {
            return Err(DebugError::Disposed);
        }
        entry
            .payload
            .as_any()
            .downcast_ref::<T>()
            .ok_or(DebugError::InvalidOperation("object type mismatch"))
    }

    pub fn payload_mut<T: DebugObject>(&mut self, id: ObjectId) -> Result<&mut T> {
        let entry = self.entry_mut(id)?;
        if entry.neutered {
            return Err(DebugError::Disposed);
        }
        entry
            .payload
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or(DebugError::InvalidOperation("object type mismatch"))
    }

    /// 指定した種別の、まだ neuter されていないオブジェクト（ID順）
    pub fn live_of_kind(&self, kind: ObjectKind) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.kind == kind && !e.neutered)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn internal_add_ref(&mut self, id: ObjectId) {
        match self.entries.get_mut(&id) {
            Some(entry) => entry.internal += 1,
            None => tracing::warn!("internal add-ref on reclaimed object {}", id),
        }
    }

    pub fn internal_release(&mut self, id: ObjectId) {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.internal > 0 => entry.internal -= 1,
            Some(_) => debug_assert!(false, "internal count underflow on {}", id),
            None => tracing::warn!("internal release on reclaimed object {}", id),
        }
    }

    /// 外部参照を増やす（neuter 後も可能）
    pub fn external_add_ref(&mut self, id: ObjectId) -> Result<u32> {
        let entry = self.entry_mut(id)?;
        entry.external += 1;
        Ok(entry.external)
    }

    /// 外部参照を減らす
    ///
    /// 0になっても破棄はせず、呼び出し側がすべきことを返します。
    pub fn external_release(&mut self, id: ObjectId) -> ReleaseOutcome {
        let Some(entry) = self.entries.get_mut(&id) else {
            return ReleaseOutcome::Released;
        };
        if entry.external == 0 {
            debug_assert!(false, "external count underflow on {}", id);
            return ReleaseOutcome::Released;
        }
        entry.external -= 1;
        if entry.external > 0 {
            ReleaseOutcome::Retained
        } else if entry.neutered {
            ReleaseOutcome::Released
        } else if entry.neuter_at_will {
            ReleaseOutcome::AtWill
        } else {
            ReleaseOutcome::ScheduleContinue
        }
    }

    /// `child` を `parent` の強参照の子にする
    pub fn adopt(&mut self, parent: ObjectId, child: ObjectId) -> Result<()> {
        debug_assert!(
            !self.is_ancestor_or_self(child, parent),
            "adopting {} under {} would create a cycle",
            child,
            parent
        );
        self.entry(child)?;
        self.entry_mut(parent)?.children.push(child);
        let entry = self.entry_mut(child)?;
        entry.owner = Some(parent);
        entry.internal += 1;
        Ok(())
    }

    fn is_ancestor_or_self(&self, candidate: ObjectId, mut id: ObjectId) -> bool {
        loop {
            if id == candidate {
                return true;
            }
            match self.owner(id) {
                Some(owner) => id = owner,
                None => return false,
            }
        }
    }

    /// オブジェクトを neuter する（冪等）
    ///
    /// payload の neuter を呼んだあと、所有者への弱参照を消し、
    /// 子を再帰的に neuter してから内部参照を手放します。
    pub fn neuter(&mut self, id: ObjectId) {
        let children = match self.entries.get_mut(&id) {
            Some(entry) if !entry.neutered => {
                entry.payload.neuter();
                entry.owner = None;
                entry.neutered = true;
                std::mem::take(&mut entry.children)
            }
            _ => return,
        };
        tracing::trace!("neutered {}", id);
        for child in children {
            self.neuter(child);
            self.internal_release(child);
        }
    }

    /// 参照数が両方0で neuter 済みのオブジェクトを回収する
    ///
    /// 回収した数を返します。payload はここで drop されます。
    pub fn reclaim(&mut self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| !(e.neutered && e.internal == 0 && e.external == 0));
        let reclaimed = before - self.entries.len();
        if reclaimed > 0 {
            self.stats.disposed.fetch_add(reclaimed as u64, Ordering::Relaxed);
            self.stats.live.fetch_sub(reclaimed as u64, Ordering::Relaxed);
            tracing::debug!("reclaimed {} object(s)", reclaimed);
        }
        reclaimed
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}
