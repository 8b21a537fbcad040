//! レベル付きロック階層
//!
//! すべてのロックは固定のレベルを持ち、スレッドは常にレベルの高いものから
//! 低いものへ順に取得します（0 が葉）。同じレベルのロック同士は入れ子に
//! できません。順序違反はブロックする前に検出され、デバッグビルドでは
//! アサーションで停止します。
//!
//! イベント配送スレッドは Stop-Go ロックを取得できません。これは自己デッドロックを
//! 避けるための制約で、取得を試みる前に `ThreadRestricted` で拒否します。

use crate::errors::DebugError;
use parking_lot::{Condvar, Mutex, MutexGuard, ReentrantMutex, ReentrantMutexGuard};
use std::cell::{Cell, RefCell};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

/// ロックのレベル（大きいほど先に取得する）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockLevel(pub u8);

impl LockLevel {
    pub const LEAF: Self = Self(0);
    pub const PATCH_TABLE: Self = Self(1);
    pub const TRANSPORT: Self = Self(2);
    pub const NATIVE_EVENT: Self = Self(3);
    pub const PROCESS: Self = Self(4);
    pub const STOP_GO: Self = Self(5);
}

/// ロック順序違反
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "lock order violation: acquiring '{acquiring}' (level {level}) while holding '{held}' (level {held_level})"
)]
pub struct LockOrderViolation {
    pub acquiring: &'static str,
    pub level: u8,
    pub held: &'static str,
    pub held_level: u8,
}

#[derive(Debug, Clone, Copy)]
struct HeldLock {
    id: usize,
    name: &'static str,
    level: LockLevel,
}

static NEXT_LOCK_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// このスレッドが保持しているロック（取得順）
    static HELD: RefCell<Vec<HeldLock>> = const { RefCell::new(Vec::new()) };
    static EVENT_DELIVERY_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// 現在のスレッドをイベント配送スレッドとして登録する
pub fn mark_event_delivery_thread() {
    EVENT_DELIVERY_THREAD.with(|flag| flag.set(true));
}

/// 現在のスレッドがイベント配送スレッドか
pub fn is_event_delivery_thread() -> bool {
    EVENT_DELIVERY_THREAD.with(|flag| flag.get())
}

/// 現在のスレッドが保持しているロックの数
pub fn held_lock_count() -> usize {
    HELD.with(|held| held.borrow().len())
}

fn check_order(id: usize, name: &'static str, level: LockLevel, reentrant: bool) -> Result<(), LockOrderViolation> {
    HELD.with(|held| {
        let held = held.borrow();
        if reentrant && held.iter().any(|h| h.id == id) {
            return Ok(());
        }
        match held.iter().find(|h| h.level <= level) {
            Some(h) => Err(LockOrderViolation {
                acquiring: name,
                level: level.0,
                held: h.name,
                held_level: h.level.0,
            }),
            None => Ok(()),
        }
    })
}

fn enforce_order(id: usize, name: &'static str, level: LockLevel, reentrant: bool) {
    if let Err(violation) = check_order(id, name, level, reentrant) {
        tracing::error!("{}", violation);
        debug_assert!(false, "{}", violation);
    }
}

fn push_held(id: usize, name: &'static str, level: LockLevel) {
    HELD.with(|held| held.borrow_mut().push(HeldLock { id, name, level }));
}

fn pop_held(id: usize) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|h| h.id == id) {
            held.remove(pos);
        }
    });
}

fn holds(id: usize) -> bool {
    HELD.with(|held| held.borrow().iter().any(|h| h.id == id))
}

/// データを保護する非再入ロック
pub struct RsLock<T> {
    id: usize,
    name: &'static str,
    level: LockLevel,
    mutex: Mutex<T>,
}

impl<T> RsLock<T> {
    pub fn new(name: &'static str, level: LockLevel, value: T) -> Self {
        Self {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            name,
            level,
            mutex: Mutex::new(value),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn level(&self) -> LockLevel {
        self.level
    }

    /// 取得してよい順序か（ブロックせずに確認する）
    pub fn check_order(&self) -> Result<(), LockOrderViolation> {
        check_order(self.id, self.name, self.level, false)
    }

    /// ロックを取得する（タイムアウトなし）
    pub fn lock(&self) -> RsLockGuard<'_, T> {
        enforce_order(self.id, self.name, self.level, false);
        let guard = self.mutex.lock();
        push_held(self.id, self.name, self.level);
        RsLockGuard { id: self.id, guard }
    }

    /// 現在のスレッドがこのロックを保持しているか
    pub fn is_held_by_current_thread(&self) -> bool {
        holds(self.id)
    }
}

/// [`RsLock`] のガード
pub struct RsLockGuard<'a, T> {
    id: usize,
    guard: MutexGuard<'a, T>,
}

impl<T> RsLockGuard<'_, T> {
    /// ロックを手放して条件変数を待つ。期限切れなら `true`
    pub fn wait_until(&mut self, condvar: &Condvar, deadline: Instant) -> bool {
        condvar.wait_until(&mut self.guard, deadline).timed_out()
    }
}

impl<T> Deref for RsLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RsLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for RsLockGuard<'_, T> {
    fn drop(&mut self) {
        pop_held(self.id);
    }
}

/// データを持たない再入可能ロック（Stop-Go ロック用）
pub struct RsReentrantLock {
    id: usize,
    name: &'static str,
    level: LockLevel,
    /// イベント配送スレッドからの取得を禁止するか
    forbid_event_thread: bool,
    mutex: ReentrantMutex<()>,
}

impl RsReentrantLock {
    pub fn new(name: &'static str, level: LockLevel, forbid_event_thread: bool) -> Self {
        Self {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            name,
            level,
            forbid_event_thread,
            mutex: ReentrantMutex::new(()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn check_order(&self) -> Result<(), LockOrderViolation> {
        check_order(self.id, self.name, self.level, true)
    }

    /// ロックを取得する
    ///
    /// イベント配送スレッドからの取得はブロックする前に拒否されます。
    pub fn acquire(&self) -> Result<RsReentrantGuard<'_>, DebugError> {
        if self.forbid_event_thread && is_event_delivery_thread() {
            tracing::warn!("event-delivery thread tried to take '{}'", self.name);
            return Err(DebugError::ThreadRestricted("event-delivery thread"));
        }
        enforce_order(self.id, self.name, self.level, true);
        let guard = self.mutex.lock();
        push_held(self.id, self.name, self.level);
        Ok(RsReentrantGuard {
            id: self.id,
            _guard: guard,
        })
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        holds(self.id)
    }
}

/// [`RsReentrantLock`] のガード
pub struct RsReentrantGuard<'a> {
    id: usize,
    _guard: ReentrantMutexGuard<'a, ()>,
}

impl Drop for RsReentrantGuard<'_> {
    fn drop(&mut self) {
        pop_held(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_descending_acquisition() {
        let stop_go = RsReentrantLock::new("stop-go", LockLevel::STOP_GO, true);
        let process = RsLock::new("process", LockLevel::PROCESS, 0u32);
        let patch = RsLock::new("patch", LockLevel::PATCH_TABLE, ());

        let _sg = stop_go.acquire().unwrap();
        {
            let mut state = process.lock();
            *state += 1;
            assert!(patch.check_order().is_ok());
            let _patch = patch.lock();
            assert_eq!(held_lock_count(), 3);
        }
        assert_eq!(held_lock_count(), 1);
        assert!(process.check_order().is_ok());
    }

    #[test]
    fn test_ascending_acquisition_is_reported() {
        let process = RsLock::new("process", LockLevel::PROCESS, ());
        let patch = RsLock::new("patch", LockLevel::PATCH_TABLE, ());

        let _patch = patch.lock();
        let violation = process.check_order().unwrap_err();
        assert_eq!(violation.acquiring, "process");
        assert_eq!(violation.held, "patch");
    }

    #[test]
    fn test_coequal_leaf_locks_do_not_nest() {
        let a = RsLock::new("leaf-a", LockLevel::LEAF, ());
        let b = RsLock::new("leaf-b", LockLevel::LEAF, ());
        let _a = a.lock();
        assert!(b.check_order().is_err());
        // 非再入ロックの再取得も自己デッドロックとして検出される
        assert!(a.check_order().is_err());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "lock order violation")]
    fn test_violation_asserts_before_blocking() {
        let process = RsLock::new("process", LockLevel::PROCESS, ());
        let leaf = RsLock::new("leaf", LockLevel::LEAF, ());
        let _leaf = leaf.lock();
        let _process = process.lock();
    }

    #[test]
    fn test_reentrant_reacquire() {
        let stop_go = RsReentrantLock::new("stop-go", LockLevel::STOP_GO, true);
        let _outer = stop_go.acquire().unwrap();
        assert!(stop_go.check_order().is_ok());
        {
            let _inner = stop_go.acquire().unwrap();
            assert_eq!(held_lock_count(), 2);
        }
        assert!(stop_go.is_held_by_current_thread());
    }

    #[test]
    fn test_event_thread_cannot_take_stop_go() {
        let stop_go = Arc::new(RsReentrantLock::new("stop-go", LockLevel::STOP_GO, true));
        let lock = stop_go.clone();
        let result = std::thread::spawn(move || {
            mark_event_delivery_thread();
            lock.acquire().map(|_| ())
        })
        .join()
        .unwrap();
        assert_eq!(result, Err(DebugError::ThreadRestricted("event-delivery thread")));

        // 拒否されたスレッドはロックを保持していない
        assert!(!is_event_delivery_thread());
        assert!(stop_go.acquire().is_ok());
    }

    #[test]
    fn test_ordered_contention_does_not_deadlock() {
        let stop_go = Arc::new(RsReentrantLock::new("stop-go", LockLevel::STOP_GO, false));
        let process = Arc::new(RsLock::new("process", LockLevel::PROCESS, 0u64));
        let patch = Arc::new(RsLock::new("patch", LockLevel::PATCH_TABLE, 0u64));

        let workers: Vec<_> = (0..4)
            .map(|i| {
                let (stop_go, process, patch) = (stop_go.clone(), process.clone(), patch.clone());
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        if i % 2 == 0 {
                            let _sg = stop_go.acquire().unwrap();
                            let mut p = process.lock();
                            *p += 1;
                            *patch.lock() += 1;
                        } else {
                            let mut p = process.lock();
                            *p += 1;
                            drop(p);
                            *patch.lock() += 1;
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*process.lock(), 2000);
        assert_eq!(*patch.lock(), 2000);
    }
}
