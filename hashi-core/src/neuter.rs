//! neuter リスト
//!
//! 安全な地点（Continue、終了、neuter-at-will の掃除）でまとめて neuter する
//! オブジェクトの単方向リストです。リストは登録したオブジェクトの内部参照を
//! 1つずつ保持し、取り除くときに手放します。

use crate::object::{ObjectId, ObjectRegistry};

/// リストの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeuterListKind {
    /// プロセス終了・デタッチ時に neuter する
    Exit,
    /// 次の Continue で neuter する
    Continue,
    /// 左側資源の解放が必要なもの
    Sweepable,
}

struct Node {
    id: ObjectId,
    next: Option<Box<Node>>,
}

/// neuter リスト
pub struct NeuterList {
    kind: NeuterListKind,
    head: Option<Box<Node>>,
    len: usize,
}

impl NeuterList {
    pub fn new(kind: NeuterListKind) -> Self {
        Self {
            kind,
            head: None,
            len: 0,
        }
    }

    pub fn kind(&self) -> NeuterListKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// 先頭から順にIDを返す
    pub fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        let mut cursor = self.head.as_deref();
        std::iter::from_fn(move || {
            let node = cursor?;
            cursor = node.next.as_deref();
            Some(node.id)
        })
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.ids().any(|listed| listed == id)
    }

    /// オブジェクトを登録する（内部参照を1つ取る）
    pub fn add(&mut self, registry: &mut ObjectRegistry, id: ObjectId) {
        registry.internal_add_ref(id);
        let next = self.head.take();
        self.head = Some(Box::new(Node { id, next }));
        self.len += 1;
    }

    /// 条件に合うノードをリストから外して返す（順序は保つ）
    ///
    /// 外したノードの内部参照はまだ保持したままです。
    fn extract(&mut self, mut remove: impl FnMut(ObjectId) -> bool) -> Vec<ObjectId> {
        let mut removed = Vec::new();
        let mut rest = self.head.take();
        let mut tail = &mut self.head;
        while let Some(mut node) = rest {
            rest = node.next.take();
            if remove(node.id) {
                removed.push(node.id);
            } else {
                tail = &mut tail.insert(node).next;
            }
        }
        self.len -= removed.len();
        removed
    }

    /// すべてを neuter して空にする
    pub fn neuter_and_clear(&mut self, registry: &mut ObjectRegistry) -> usize {
        let ids = self.extract(|_| true);
        for id in &ids {
            registry.neuter(*id);
            registry.internal_release(*id);
        }
        if !ids.is_empty() {
            tracing::debug!("{:?} list: neutered {} object(s)", self.kind, ids.len());
        }
        ids.len()
    }

    /// neuter-at-will で外部参照のないもの、すでに neuter 済みのものを取り除く
    pub fn sweep_neuter_at_will(&mut self, registry: &mut ObjectRegistry) -> usize {
        let ids = self.extract(|id| registry.is_neutered(id) || registry.is_at_will_unreferenced(id));
        for id in &ids {
            registry.neuter(*id);
            registry.internal_release(*id);
        }
        if !ids.is_empty() {
            tracing::debug!("{:?} list: swept {} object(s)", self.kind, ids.len());
        }
        ids.len()
    }

    /// 左側資源を解放してよいもの（neuter 済み、または at-will で未参照）を外す
    ///
    /// 返したオブジェクトの内部参照は呼び出し側に移ります。資源を解放したあと
    /// [`release_extracted`](Self::release_extracted) で手放してください。
    pub fn take_releasable(&mut self, registry: &ObjectRegistry) -> Vec<ObjectId> {
        self.extract(|id| registry.is_neutered(id) || registry.is_at_will_unreferenced(id))
    }

    /// `take_releasable` で外したオブジェクトを neuter し、内部参照を手放す
    pub fn release_extracted(registry: &mut ObjectRegistry, ids: &[ObjectId]) {
        for id in ids {
            registry.neuter(*id);
            registry.internal_release(*id);
        }
    }
}

impl Drop for NeuterList {
    // 長いリストでの再帰的な drop を避ける
    fn drop(&mut self) {
        let mut cursor = self.head.take();
        while let Some(mut node) = cursor {
            cursor = node.next.take();
        }
    }
}
