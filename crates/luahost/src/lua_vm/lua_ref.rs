//! Registry-backed references to tables, functions, userdata and threads.
//!
//! A reference is a registry slot (`luaL_ref`) plus the identity of the state
//! that owns it. Holding one keeps the value alive. `dispose` releases the
//! slot immediately; a reference that is simply dropped queues its slot on
//! the state's release queue, which is drained at the next call into the
//! state. The small records backing references are recycled through the
//! state's [`EntityPool`](super::ref_pool::EntityPool).

use std::cell::RefCell;
use std::ffi::{c_int, c_void};
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use crate::ffi::{self, lua_State};
use crate::lua_value::userdata;
use crate::lua_value::{FromLua, FromLuaMulti, IntoLua, IntoLuaMulti, LuaType};
use crate::lua_vm::lua_error::{LuaError, LuaResult};
use crate::lua_vm::lua_state::{LuaState, StateId, WEAK_REFS_FIELD};
use crate::lua_vm::stack::LuaStack;

/// Concrete reference variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    Table,
    Function,
    UserData,
    Thread,
}

impl RefKind {
    pub(crate) const COUNT: usize = 4;

    pub(crate) fn bucket(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            RefKind::Table => "table",
            RefKind::Function => "function",
            RefKind::UserData => "userdata",
            RefKind::Thread => "thread",
        }
    }

    pub(crate) fn lua_type(self) -> LuaType {
        match self {
            RefKind::Table => LuaType::Table,
            RefKind::Function => LuaType::Function,
            RefKind::UserData => LuaType::UserData,
            RefKind::Thread => LuaType::Thread,
        }
    }
}

/// Registry slots that are never released.
fn is_persistent(slot: c_int) -> bool {
    slot == ffi::LUA_RIDX_MAINTHREAD as c_int || slot == ffi::LUA_RIDX_GLOBALS as c_int
}

/// Pooled record behind a live reference.
pub(crate) struct RefInner {
    owner: Weak<LuaState>,
    owner_id: StateId,
    slot: c_int,
    pub(crate) kind: RefKind,
    pointer: *const c_void,
}

impl RefInner {
    pub(crate) fn vacant(kind: RefKind) -> Self {
        RefInner {
            owner: Weak::new(),
            owner_id: StateId::NONE,
            slot: ffi::LUA_NOREF,
            kind,
            pointer: std::ptr::null(),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.owner = Weak::new();
        self.owner_id = StateId::NONE;
        self.slot = ffi::LUA_NOREF;
        self.pointer = std::ptr::null();
    }
}

// ============================================================================
// RefCore
// ============================================================================

/// Shared implementation of every reference variant. Public only so the
/// sealed accessor trait can name it; nothing outside the crate can.
#[doc(hidden)]
pub struct RefCore {
    inner: Option<Box<RefInner>>,
    kind: RefKind,
}

impl RefCore {
    /// Register the value at the absolute `index` of `stack`.
    pub(crate) fn register(stack: &LuaStack<'_>, index: c_int, kind: RefKind) -> LuaResult<RefCore> {
        let state = stack.state();
        let l = stack.raw();
        let pointer = unsafe { ffi::lua_topointer(l, index) };

        if kind == RefKind::Thread && unsafe { ffi::lua_tothread(l, index) } == state.main_thread()? {
            return Ok(RefCore::persistent(
                state,
                ffi::LUA_RIDX_MAINTHREAD as c_int,
                kind,
                pointer,
            ));
        }

        stack.ensure_free_capacity(1).map_err(|err| {
            LuaError::InvalidOperation(format!("reference registration failed: {err}"))
        })?;
        unsafe { ffi::lua_pushvalue(l, index) };
        let slot = unsafe {
            state.protect_if_limited(l, 1, 0, |l| ffi::luaL_ref(l, ffi::LUA_REGISTRYINDEX))?
        };

        let mut inner = state.pool.rent(kind);
        inner.owner = state.weak();
        inner.owner_id = state.id();
        inner.slot = slot;
        inner.kind = kind;
        inner.pointer = pointer;
        tracing::trace!(slot, kind = kind.name(), "registered reference");
        Ok(RefCore {
            inner: Some(inner),
            kind,
        })
    }

    /// Reference to one of the fixed registry slots.
    pub(crate) fn persistent(
        state: &LuaState,
        slot: c_int,
        kind: RefKind,
        pointer: *const c_void,
    ) -> RefCore {
        let mut inner = state.pool.rent(kind);
        inner.owner = state.weak();
        inner.owner_id = state.id();
        inner.slot = slot;
        inner.kind = kind;
        inner.pointer = pointer;
        RefCore {
            inner: Some(inner),
            kind,
        }
    }

    fn live(&self) -> LuaResult<&RefInner> {
        self.inner
            .as_deref()
            .ok_or_else(|| LuaError::disposed(self.kind.name()))
    }

    pub(crate) fn slot(&self) -> LuaResult<c_int> {
        self.live().map(|inner| inner.slot)
    }

    pub(crate) fn pointer(&self) -> LuaResult<*const c_void> {
        self.live().map(|inner| inner.pointer)
    }

    pub(crate) fn owner_id(&self) -> Option<StateId> {
        self.inner.as_ref().map(|inner| inner.owner_id)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.inner.is_none()
    }

    /// The owning state, if this reference is live and the state open.
    pub(crate) fn state(&self) -> LuaResult<Rc<LuaState>> {
        let state = self.live()?.owner.upgrade().ok_or(LuaError::StateClosed)?;
        if state.is_closed() {
            return Err(LuaError::StateClosed);
        }
        Ok(state)
    }

    /// Run `f` with a stack of the owning state; the stack height is restored
    /// afterwards.
    pub(crate) fn with_stack<R>(&self, f: impl FnOnce(&LuaStack<'_>) -> LuaResult<R>) -> LuaResult<R> {
        let state = self.state()?;
        let stack = state.stack()?;
        let _guard = stack.snapshot_count();
        f(&stack)
    }

    /// Push the referenced value onto `stack` after validating ownership.
    pub(crate) fn push(&self, stack: &LuaStack<'_>) -> LuaResult<()> {
        let inner = self.live()?;
        if inner.owner_id != stack.owner() {
            return Err(LuaError::foreign_owner(self.kind.name()));
        }
        stack.push_registry_slot(inner.slot)
    }

    pub(crate) fn try_clone(&self) -> LuaResult<RefCore> {
        let inner = self.live()?;
        if is_persistent(inner.slot) {
            let state = self.state()?;
            return Ok(RefCore::persistent(&state, inner.slot, self.kind, inner.pointer));
        }
        self.with_stack(|stack| {
            self.push(stack)?;
            RefCore::register(stack, stack.count(), self.kind)
        })
    }

    pub(crate) fn dispose(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let Some(state) = inner.owner.upgrade() else {
            return;
        };
        if !is_persistent(inner.slot)
            && let Ok(l) = state.main_thread()
        {
            unsafe { ffi::luaL_unref(l, ffi::LUA_REGISTRYINDEX, inner.slot) };
            tracing::trace!(slot = inner.slot, kind = self.kind.name(), "disposed reference");
        }
        state.pool.give_back(inner);
    }

    pub(crate) fn try_raw_equals(&self, other: &RefCore) -> LuaResult<bool> {
        let (Some(a), Some(b)) = (&self.inner, &other.inner) else {
            return Ok(false);
        };
        if a.owner_id != b.owner_id {
            return Ok(false);
        }
        if a.slot == b.slot {
            return Ok(true);
        }
        self.with_stack(|stack| {
            stack.ensure_free_capacity(2)?;
            self.push(stack)?;
            other.push(stack)?;
            Ok(unsafe { ffi::lua_rawequal(stack.raw(), -1, -2) != 0 })
        })
    }

    /// [`try_raw_equals`](Self::try_raw_equals) for `PartialEq`; a failed
    /// comparison counts as unequal.
    pub(crate) fn raw_equals(&self, other: &RefCore) -> bool {
        self.try_raw_equals(other).unwrap_or_else(|err| {
            tracing::debug!(kind = self.kind.name(), error = %err, "reference comparison failed");
            false
        })
    }
}

impl Drop for RefCore {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let Some(state) = inner.owner.upgrade() else {
            return;
        };
        if !is_persistent(inner.slot) && !state.is_closed() {
            state.releases.push(inner.slot);
        }
        state.pool.give_back(inner);
    }
}

impl fmt::Debug for RefCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(inner) => write!(f, "{}(slot={})", self.kind.name(), inner.slot),
            None => write!(f, "{}(disposed)", self.kind.name()),
        }
    }
}

// ============================================================================
// Public reference trait
// ============================================================================

mod sealed {
    use super::RefCore;

    /// Access to the registry slot behind a reference.
    pub trait Sealed: Sized {
        fn core(&self) -> &RefCore;
        fn core_mut(&mut self) -> &mut RefCore;
        fn from_core(core: RefCore) -> Self;
    }
}

pub(crate) use sealed::Sealed as RefAccess;

/// Behaviour shared by all reference variants.
pub trait LuaReference: sealed::Sealed {
    const KIND: RefKind;

    /// Registry slot; fails with `ObjectDisposed` after `dispose`.
    fn slot(&self) -> LuaResult<c_int> {
        self.core().slot()
    }

    /// Release the registry slot now. Idempotent; a no-op for the main
    /// thread and the globals table.
    fn dispose(&mut self) {
        self.core_mut().dispose();
    }

    fn is_disposed(&self) -> bool {
        self.core().is_disposed()
    }

    /// Identity of the owning state; `None` once disposed.
    fn owner(&self) -> Option<StateId> {
        self.core().owner_id()
    }

    /// Raw identity pointer of the referenced value.
    fn to_pointer(&self) -> LuaResult<*const c_void> {
        self.core().pointer()
    }

    /// Whether both references hold the same Lua value, by `rawequal`.
    /// Unlike `==`, reports a closed state or a full stack as an error.
    fn try_raw_equals(&self, other: &Self) -> LuaResult<bool> {
        self.core().try_raw_equals(other.core())
    }

    /// Register an independent slot for the same value.
    fn try_clone(&self) -> LuaResult<Self> {
        self.core().try_clone().map(Self::from_core)
    }

    /// Non-owning handle that does not keep the value alive.
    fn downgrade(&self) -> LuaResult<LuaWeakRef<Self>> {
        let core = self.core();
        let pointer = core.pointer()?;
        core.with_stack(|stack| {
            stack.push_registry_field(WEAK_REFS_FIELD)?;
            core.push(stack)?;
            let key = pointer;
            unsafe {
                stack.state().protect_if_limited(stack.raw(), 2, 0, move |l| {
                    ffi::lua_rawsetp(l, -2, key);
                    ffi::lua_pop(l, 1);
                })?;
            }
            let state = core.state()?;
            Ok(LuaWeakRef {
                owner: state.weak(),
                owner_id: state.id(),
                key: pointer,
                _marker: PhantomData,
            })
        })
    }
}

macro_rules! impl_reference {
    ($name:ident, $kind:expr) => {
        impl LuaReference for $name {
            const KIND: RefKind = $kind;
        }

        impl sealed::Sealed for $name {
            fn core(&self) -> &RefCore {
                &self.core
            }

            fn core_mut(&mut self) -> &mut RefCore {
                &mut self.core
            }

            fn from_core(core: RefCore) -> Self {
                $name { core }
            }
        }

        impl Clone for $name {
            /// Registers a new slot. If that fails the clone comes back
            /// disposed.
            fn clone(&self) -> Self {
                match self.core.try_clone() {
                    Ok(core) => $name { core },
                    Err(err) => {
                        tracing::warn!("failed to clone {} reference: {err}", $kind.name());
                        $name {
                            core: RefCore {
                                inner: None,
                                kind: $kind,
                            },
                        }
                    }
                }
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                std::ptr::eq(self, other) || self.core.raw_equals(&other.core)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.core)
            }
        }
    };
}

// ============================================================================
// LuaTableRef
// ============================================================================

/// Reference to a Lua table.
///
/// # Example
///
/// ```ignore
/// let config = vm.create_table()?;
/// config.set("name", "Alice")?;
/// let name: String = config.get("name")?;
/// ```
pub struct LuaTableRef {
    core: RefCore,
}

impl_reference!(LuaTableRef, RefKind::Table);

impl LuaTableRef {
    // ==================== Read ====================

    /// `t[key]`, honouring `__index`.
    pub fn get<K: IntoLua, V: FromLua>(&self, key: K) -> LuaResult<V> {
        self.core.with_stack(|stack| {
            self.core.push(stack)?;
            stack.push(key)?;
            unsafe {
                crate::lua_vm::panic_bridge::protect_lua(stack.state(), stack.raw(), 2, 1, |l| {
                    ffi::lua_gettable(l, -2);
                })?;
            }
            V::from_lua(stack.top()?)
        })
    }

    /// `t[key]` without metamethods.
    pub fn raw_get<K: IntoLua, V: FromLua>(&self, key: K) -> LuaResult<V> {
        self.core.with_stack(|stack| {
            self.core.push(stack)?;
            let table = stack.count();
            stack.push(key)?;
            unsafe { ffi::lua_rawget(stack.raw(), table) };
            V::from_lua(stack.top()?)
        })
    }

    pub fn contains_key<K: IntoLua>(&self, key: K) -> LuaResult<bool> {
        self.core.with_stack(|stack| {
            self.core.push(stack)?;
            let table = stack.count();
            stack.push(key)?;
            Ok(unsafe { ffi::lua_rawget(stack.raw(), table) } != ffi::LUA_TNIL)
        })
    }

    // ==================== Write ====================

    /// `t[key] = value`, honouring `__newindex`.
    pub fn set<K: IntoLua, V: IntoLua>(&self, key: K, value: V) -> LuaResult<()> {
        self.core.with_stack(|stack| {
            self.core.push(stack)?;
            stack.push(key)?;
            stack.push(value)?;
            unsafe {
                crate::lua_vm::panic_bridge::protect_lua(stack.state(), stack.raw(), 3, 0, |l| {
                    ffi::lua_settable(l, -3);
                })
            }
        })
    }

    /// `t[key] = value` without metamethods.
    pub fn raw_set<K: IntoLua, V: IntoLua>(&self, key: K, value: V) -> LuaResult<()> {
        self.core.with_stack(|stack| {
            self.core.push(stack)?;
            let table = stack.count();
            stack.push(key)?;
            stack.push(value)?;
            stack.raw_set_top(table)
        })
    }

    /// Append to the sequence part (`t[#t + 1] = value`, raw).
    pub fn push<V: IntoLua>(&self, value: V) -> LuaResult<()> {
        self.core.with_stack(|stack| {
            self.core.push(stack)?;
            let table = stack.count();
            let next = unsafe { ffi::lua_rawlen(stack.raw(), table) } as ffi::lua_Integer + 1;
            stack.push(value)?;
            stack.raw_seti_top(table, next)
        })
    }

    // ==================== Length & iteration ====================

    /// `#t`, honouring `__len`.
    pub fn len(&self) -> LuaResult<i64> {
        self.core.with_stack(|stack| {
            self.core.push(stack)?;
            unsafe {
                crate::lua_vm::panic_bridge::protect_lua(stack.state(), stack.raw(), 1, 1, |l| {
                    ffi::lua_len(l, -1);
                })?;
            }
            i64::from_lua(stack.top()?)
        })
    }

    pub fn raw_len(&self) -> LuaResult<usize> {
        self.core.with_stack(|stack| {
            self.core.push(stack)?;
            Ok(unsafe { ffi::lua_rawlen(stack.raw(), -1) } as usize)
        })
    }

    pub fn is_empty(&self) -> LuaResult<bool> {
        self.core.with_stack(|stack| {
            self.core.push(stack)?;
            stack.push_nil()?;
            Ok(unsafe { ffi::lua_next(stack.raw(), -2) } == 0)
        })
    }

    /// Snapshot of every key/value pair (raw traversal).
    pub fn pairs<K: FromLua, V: FromLua>(&self) -> LuaResult<Vec<(K, V)>> {
        self.core.with_stack(|stack| {
            self.core.push(stack)?;
            let table = stack.count();
            stack.push_nil()?;
            let mut pairs = Vec::new();
            loop {
                stack.ensure_free_capacity(2)?;
                if unsafe { ffi::lua_next(stack.raw(), table) } == 0 {
                    break;
                }
                let key = K::from_lua(stack.get(-2)?)?;
                let value = V::from_lua(stack.get(-1)?)?;
                pairs.push((key, value));
                unsafe { ffi::lua_pop(stack.raw(), 1) };
            }
            Ok(pairs)
        })
    }

    /// Values `t[1]..t[n]` of the sequence part (raw).
    pub fn sequence_values<V: FromLua>(&self) -> LuaResult<Vec<V>> {
        self.core.with_stack(|stack| {
            self.core.push(stack)?;
            let table = stack.count();
            let len = unsafe { ffi::lua_rawlen(stack.raw(), table) };
            let mut values = Vec::with_capacity(len as usize);
            for i in 1..=len {
                stack.ensure_free_capacity(1)?;
                unsafe { ffi::lua_rawgeti(stack.raw(), table, i as ffi::lua_Integer) };
                values.push(V::from_lua(stack.top()?)?);
                unsafe { ffi::lua_pop(stack.raw(), 1) };
            }
            Ok(values)
        })
    }

    // ==================== Metatable ====================

    pub fn metatable(&self) -> LuaResult<Option<LuaTableRef>> {
        self.core.with_stack(|stack| {
            self.core.push(stack)?;
            stack.ensure_free_capacity(1)?;
            if unsafe { ffi::lua_getmetatable(stack.raw(), -1) } == 0 {
                return Ok(None);
            }
            RefCore::register(stack, stack.count(), RefKind::Table)
                .map(|core| Some(LuaTableRef { core }))
        })
    }

    pub fn set_metatable(&self, metatable: Option<&LuaTableRef>) -> LuaResult<()> {
        self.core.with_stack(|stack| {
            self.core.push(stack)?;
            match metatable {
                Some(mt) => mt.core.push(stack)?,
                None => stack.push_nil()?,
            }
            unsafe { ffi::lua_setmetatable(stack.raw(), -2) };
            Ok(())
        })
    }
}

// ============================================================================
// LuaFunctionRef
// ============================================================================

/// Reference to a Lua function or host callback.
///
/// # Example
///
/// ```ignore
/// let add: LuaFunctionRef = vm.evaluate("return function(a, b) return a + b end")?;
/// let sum: i64 = add.call((1, 2))?;
/// ```
pub struct LuaFunctionRef {
    core: RefCore,
}

impl_reference!(LuaFunctionRef, RefKind::Function);

struct DumpSink<'f> {
    write: &'f mut dyn FnMut(&[u8]) -> io::Result<()>,
    error: Option<io::Error>,
    panic: Option<Box<dyn std::any::Any + Send>>,
}

unsafe extern "C-unwind" fn dump_writer(
    _l: *mut lua_State,
    p: *const c_void,
    sz: usize,
    ud: *mut c_void,
) -> c_int {
    unsafe {
        let sink = &mut *(ud as *mut DumpSink<'_>);
        if sz == 0 || p.is_null() {
            return 0;
        }
        let chunk = std::slice::from_raw_parts(p as *const u8, sz);
        match panic::catch_unwind(AssertUnwindSafe(|| (sink.write)(chunk))) {
            Ok(Ok(())) => 0,
            Ok(Err(err)) => {
                sink.error = Some(err);
                1
            }
            Err(payload) => {
                sink.panic = Some(payload);
                1
            }
        }
    }
}

impl LuaFunctionRef {
    /// Call the function in protected mode.
    pub fn call<A: IntoLuaMulti, R: FromLuaMulti>(&self, args: A) -> LuaResult<R> {
        self.core.with_stack(|stack| {
            let base = stack.count();
            self.core.push(stack)?;
            let nargs = stack.push_multi(args)?;
            unsafe { stack.state().pcall(stack.raw(), nargs, ffi::LUA_MULTRET)? };
            let nresults = stack.count() - base;
            R::from_lua_multi(stack.get_range(base + 1, nresults)?)
        })
    }

    /// Serialize the function as a binary chunk.
    pub fn dump(&self, strip: bool) -> LuaResult<Vec<u8>> {
        let mut bytes = Vec::new();
        self.dump_with(strip, |chunk| {
            bytes.extend_from_slice(chunk);
            Ok(())
        })?;
        Ok(bytes)
    }

    pub fn dump_to<W: io::Write>(&self, mut writer: W, strip: bool) -> LuaResult<()> {
        self.dump_with(strip, |chunk| writer.write_all(chunk))?;
        writer.flush()?;
        Ok(())
    }

    /// Serialize through a push-based writer callback.
    pub fn dump_with<F>(&self, strip: bool, mut write: F) -> LuaResult<()>
    where
        F: FnMut(&[u8]) -> io::Result<()>,
    {
        self.core.with_stack(|stack| {
            self.core.push(stack)?;
            let mut sink = DumpSink {
                write: &mut write,
                error: None,
                panic: None,
            };
            let status = unsafe {
                ffi::lua_dump(
                    stack.raw(),
                    dump_writer,
                    &mut sink as *mut DumpSink<'_> as *mut c_void,
                    strip as c_int,
                )
            };
            if let Some(payload) = sink.panic.take() {
                panic::resume_unwind(payload);
            }
            if let Some(err) = sink.error.take() {
                return Err(err.into());
            }
            if status != 0 {
                return Err(LuaError::InvalidOperation(
                    "unable to dump a function that is not a Lua function".into(),
                ));
            }
            Ok(())
        })
    }
}

// ============================================================================
// LuaUserDataRef
// ============================================================================

/// Reference to a full userdata.
///
/// For userdata created by this crate the wrapped host object is reachable
/// through [`shared`](Self::shared), [`with`](Self::with) and
/// [`with_mut`](Self::with_mut).
pub struct LuaUserDataRef {
    core: RefCore,
}

impl_reference!(LuaUserDataRef, RefKind::UserData);

impl LuaUserDataRef {
    /// The original host object, if this userdata wraps a `T`.
    pub fn shared<T: 'static>(&self) -> LuaResult<Rc<RefCell<T>>> {
        self.core.with_stack(|stack| {
            self.core.push(stack)?;
            unsafe { userdata::host_object::<T>(stack.raw(), -1) }.ok_or_else(|| {
                LuaError::Marshal(format!(
                    "userdata does not hold a `{}`",
                    std::any::type_name::<T>()
                ))
            })
        })
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.shared::<T>().is_ok()
    }

    /// Borrow the host object immutably for the duration of `f`.
    pub fn with<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> LuaResult<R> {
        let object = self.shared::<T>()?;
        let guard = object
            .try_borrow()
            .map_err(|_| LuaError::BorrowConflict(std::any::type_name::<T>().to_owned()))?;
        Ok(f(&guard))
    }

    /// Borrow the host object mutably for the duration of `f`.
    pub fn with_mut<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> LuaResult<R> {
        let object = self.shared::<T>()?;
        let mut guard = object
            .try_borrow_mut()
            .map_err(|_| LuaError::BorrowConflict(std::any::type_name::<T>().to_owned()))?;
        Ok(f(&mut guard))
    }

    /// Address of the userdata block.
    pub fn as_ptr(&self) -> LuaResult<*const c_void> {
        self.core.pointer()
    }

    /// Described type name, or the metatable's `__name`, or `"userdata"`.
    pub fn type_name(&self) -> LuaResult<String> {
        self.core.with_stack(|stack| {
            self.core.push(stack)?;
            stack.ensure_free_capacity(2)?;
            let l = stack.raw();
            if let Some(name) = unsafe { userdata::host_type_name(l, -1) } {
                return Ok(name);
            }
            unsafe {
                if ffi::lua_getmetatable(l, -1) != 0 {
                    stack.push_bytes(b"__name")?;
                    if ffi::lua_rawget(l, -2) == ffi::LUA_TSTRING
                        && let Some(bytes) = ffi::lua_tobytes(l, -1)
                    {
                        return Ok(String::from_utf8_lossy(bytes).into_owned());
                    }
                }
            }
            Ok("userdata".to_owned())
        })
    }
}

// ============================================================================
// LuaThreadRef
// ============================================================================

/// Execution status of a coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Fresh or suspended in a yield.
    Resumable,
    /// Running host code right now.
    Running,
    /// Active but resuming another coroutine.
    Normal,
    Finished,
    /// Stopped by an error.
    Error,
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreadStatus::Resumable => "suspended",
            ThreadStatus::Running => "running",
            ThreadStatus::Normal => "normal",
            ThreadStatus::Finished => "dead",
            ThreadStatus::Error => "dead (error)",
        };
        f.write_str(name)
    }
}

pub(crate) unsafe fn thread_status(co: *mut lua_State, current: *mut lua_State) -> ThreadStatus {
    if co == current {
        return ThreadStatus::Running;
    }
    unsafe {
        match ffi::lua_status(co) {
            ffi::LUA_YIELD => ThreadStatus::Resumable,
            ffi::LUA_OK => {
                let mut ar = ffi::lua_Debug::default();
                if ffi::lua_getstack(co, 0, &mut ar) > 0 {
                    ThreadStatus::Normal
                } else if ffi::lua_gettop(co) == 0 {
                    ThreadStatus::Finished
                } else {
                    ThreadStatus::Resumable
                }
            }
            _ => ThreadStatus::Error,
        }
    }
}

/// Reference to a Lua thread (coroutine). The main thread is always the
/// persistent registry slot, so every handle to it is interchangeable.
pub struct LuaThreadRef {
    core: RefCore,
}

impl_reference!(LuaThreadRef, RefKind::Thread);

impl LuaThreadRef {
    pub fn is_main(&self) -> bool {
        self.core.slot().ok() == Some(ffi::LUA_RIDX_MAINTHREAD as c_int)
    }

    pub fn status(&self) -> LuaResult<ThreadStatus> {
        self.core.with_stack(|stack| {
            self.core.push(stack)?;
            let co = unsafe { ffi::lua_tothread(stack.raw(), -1) };
            Ok(unsafe { thread_status(co, stack.raw()) })
        })
    }

    /// Resume the coroutine with `args`; returns the yielded or returned
    /// values.
    pub fn resume<A: IntoLuaMulti, R: FromLuaMulti>(&self, args: A) -> LuaResult<R> {
        self.core.with_stack(|stack| {
            let l = stack.raw();
            self.core.push(stack)?;
            let co = unsafe { ffi::lua_tothread(l, -1) };
            let status = unsafe { thread_status(co, l) };
            if status != ThreadStatus::Resumable {
                return Err(LuaError::InvalidOperation(format!(
                    "cannot resume a {status} coroutine"
                )));
            }

            let base = stack.count();
            let nargs = stack.push_multi(args)?;
            unsafe {
                if ffi::lua_checkstack(co, nargs + 1) == 0 {
                    return Err(LuaError::InvalidOperation(
                        "stack overflow: coroutine cannot take the arguments".into(),
                    ));
                }
                ffi::lua_xmove(l, co, nargs);
            }

            let mut nresults = 0;
            unsafe { stack.state().resume(co, l, nargs, &mut nresults)? };
            if let Err(err) = stack.ensure_free_capacity(nresults as usize) {
                unsafe { ffi::lua_pop(co, nresults) };
                return Err(err);
            }
            unsafe { ffi::lua_xmove(co, l, nresults) };
            R::from_lua_multi(stack.get_range(base + 1, nresults)?)
        })
    }
}

// ============================================================================
// LuaWeakRef
// ============================================================================

/// Weak handle created by [`LuaReference::downgrade`]. The value is kept in
/// a weak-valued registry table keyed by its identity pointer.
pub struct LuaWeakRef<R: LuaReference> {
    owner: Weak<LuaState>,
    owner_id: StateId,
    key: *const c_void,
    _marker: PhantomData<R>,
}

impl<R: LuaReference> LuaWeakRef<R> {
    pub fn owner(&self) -> StateId {
        self.owner_id
    }

    /// A fresh strong reference if the value is still alive.
    pub fn upgrade(&self) -> LuaResult<Option<R>> {
        let state = self.owner.upgrade().ok_or(LuaError::StateClosed)?;
        let stack = state.stack()?;
        let _guard = stack.snapshot_count();
        stack.push_registry_field(WEAK_REFS_FIELD)?;
        stack.ensure_free_capacity(1)?;
        let found = unsafe { ffi::lua_rawgetp(stack.raw(), -1, self.key) };
        if found == ffi::LUA_TNIL || LuaType::from_code(found) != R::KIND.lua_type() {
            return Ok(None);
        }
        RefCore::register(&stack, stack.count(), R::KIND).map(|core| Some(R::from_core(core)))
    }
}

impl<R: LuaReference> Clone for LuaWeakRef<R> {
    fn clone(&self) -> Self {
        LuaWeakRef {
            owner: self.owner.clone(),
            owner_id: self.owner_id,
            key: self.key,
            _marker: PhantomData,
        }
    }
}

impl<R: LuaReference> fmt::Debug for LuaWeakRef<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LuaWeakRef<{}>({:p})", R::KIND.name(), self.key)
    }
}
