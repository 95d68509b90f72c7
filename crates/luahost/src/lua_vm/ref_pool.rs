// Recycling of reference records and deferred registry releases.

use std::cell::RefCell;
use std::ffi::c_int;

use crate::ffi::{self, lua_State};
use crate::lua_vm::lua_ref::{RefInner, RefKind};

/// Per-state cache of released reference records, one bucket per kind.
pub(crate) struct EntityPool {
    buckets: RefCell<[Vec<Box<RefInner>>; RefKind::COUNT]>,
    capacity: usize,
}

impl EntityPool {
    pub(crate) fn new(capacity: usize) -> Self {
        EntityPool {
            buckets: RefCell::new(Default::default()),
            capacity,
        }
    }

    /// A cleared record for `kind`, reused when one is available.
    pub(crate) fn rent(&self, kind: RefKind) -> Box<RefInner> {
        self.buckets.borrow_mut()[kind.bucket()]
            .pop()
            .unwrap_or_else(|| Box::new(RefInner::vacant(kind)))
    }

    /// Return a record. Records beyond the bucket capacity are dropped.
    pub(crate) fn give_back(&self, mut inner: Box<RefInner>) {
        inner.reset();
        let Ok(mut buckets) = self.buckets.try_borrow_mut() else {
            return;
        };
        let bucket = &mut buckets[inner.kind.bucket()];
        if bucket.len() < self.capacity {
            bucket.push(inner);
        } else {
            tracing::warn!(kind = ?inner.kind, capacity = self.capacity, "reference pool full, dropping record");
        }
    }

    pub(crate) fn available(&self, kind: RefKind) -> usize {
        self.buckets.borrow()[kind.bucket()].len()
    }
}

/// Registry slots of references dropped without `dispose`, released at the
/// next entry into the state.
#[derive(Default)]
pub(crate) struct ReleaseQueue {
    pending: RefCell<Vec<c_int>>,
}

impl ReleaseQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, slot: c_int) {
        if let Ok(mut pending) = self.pending.try_borrow_mut() {
            pending.push(slot);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// `luaL_unref` every queued slot.
    pub(crate) unsafe fn drain(&self, l: *mut lua_State) {
        let slots = match self.pending.try_borrow_mut() {
            Ok(mut pending) if !pending.is_empty() => std::mem::take(&mut *pending),
            _ => return,
        };
        tracing::trace!(count = slots.len(), "releasing queued registry slots");
        for slot in slots {
            unsafe { ffi::luaL_unref(l, ffi::LUA_REGISTRYINDEX, slot) };
        }
    }

    pub(crate) fn clear(&self) {
        self.pending.borrow_mut().clear();
    }
}
