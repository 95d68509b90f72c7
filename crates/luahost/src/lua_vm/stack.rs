//! Bounds-checked views over an interpreter thread's value stack.
//!
//! [`LuaStack`] is the only way host code touches stack slots. Indices handed
//! out as [`StackValue`] are absolute, so later pushes do not change what
//! they point at. Every push checks for a free slot first, and
//! [`LuaStack::snapshot_count`] restores the stack height on scope exit.

use std::ffi::{c_char, c_int, c_void};
use std::fmt;

use crate::ffi::{self, lua_State};
use crate::lua_value::{FromLua, FromLuaMulti, IntoLua, IntoLuaMulti, LuaType};
use crate::lua_vm::lua_error::{LuaError, LuaResult};
use crate::lua_vm::lua_state::{LuaState, StateId};

/// Access to the value stack of the thread currently running host code.
pub struct LuaStack<'a> {
    state: &'a LuaState,
    l: *mut lua_State,
}

impl<'a> LuaStack<'a> {
    pub(crate) fn new(state: &'a LuaState, l: *mut lua_State) -> Self {
        state.stack_view_opened();
        LuaStack { state, l }
    }

    pub(crate) fn state(&self) -> &'a LuaState {
        self.state
    }

    pub(crate) fn raw(&self) -> *mut lua_State {
        self.l
    }

    /// Identity of the owning interpreter state.
    pub fn owner(&self) -> StateId {
        self.state.id()
    }

    /// Number of values on the stack.
    pub fn count(&self) -> c_int {
        unsafe { ffi::lua_gettop(self.l) }
    }

    fn absolute(&self, index: c_int) -> LuaResult<c_int> {
        let count = self.count();
        let absolute = if index < 0 { count + index + 1 } else { index };
        if index == 0 || absolute < 1 || absolute > count {
            return Err(LuaError::IndexOutOfRange { index, count });
        }
        Ok(absolute)
    }

    /// View of the value at `index`. Negative indices count from the top.
    pub fn get(&self, index: c_int) -> LuaResult<StackValue<'_>> {
        let index = self.absolute(index)?;
        Ok(StackValue { stack: self, index })
    }

    pub fn top(&self) -> LuaResult<StackValue<'_>> {
        self.get(-1)
    }

    /// Read the value at `index` as `T`.
    pub fn read<T: FromLua>(&self, index: c_int) -> LuaResult<T> {
        T::from_lua(self.get(index)?)
    }

    /// Reserve `n` free slots. Fails without touching the stack when the
    /// configured ceiling or the interpreter's own limit would be exceeded.
    pub fn ensure_free_capacity(&self, n: usize) -> LuaResult<()> {
        let max = self.state.options().max_stack_size;
        let count = self.count() as usize;
        if count.saturating_add(n) > max {
            return Err(LuaError::InvalidOperation(format!(
                "stack overflow: {n} more slots would exceed the limit of {max}"
            )));
        }
        let Ok(n) = c_int::try_from(n) else {
            return Err(LuaError::InvalidOperation(format!(
                "stack overflow: cannot reserve {n} slots"
            )));
        };
        if unsafe { ffi::lua_checkstack(self.l, n) } == 0 {
            return Err(LuaError::InvalidOperation(format!(
                "stack overflow: cannot reserve {n} slots"
            )));
        }
        Ok(())
    }

    /// Guard that restores the current count when dropped.
    pub fn snapshot_count(&self) -> StackSnapshot<'_> {
        StackSnapshot {
            stack: self,
            count: self.count(),
        }
    }

    // ==================== Push ====================

    pub fn push<T: IntoLua>(&self, value: T) -> LuaResult<()> {
        value.into_lua(self)
    }

    /// Push every value of `values`; returns how many were pushed.
    pub fn push_multi<T: IntoLuaMulti>(&self, values: T) -> LuaResult<c_int> {
        values.push_multi(self)
    }

    pub(crate) fn push_nil(&self) -> LuaResult<()> {
        self.ensure_free_capacity(1)?;
        unsafe { ffi::lua_pushnil(self.l) };
        Ok(())
    }

    pub(crate) fn push_boolean(&self, value: bool) -> LuaResult<()> {
        self.ensure_free_capacity(1)?;
        unsafe { ffi::lua_pushboolean(self.l, value as c_int) };
        Ok(())
    }

    pub(crate) fn push_integer(&self, value: ffi::lua_Integer) -> LuaResult<()> {
        self.ensure_free_capacity(1)?;
        unsafe { ffi::lua_pushinteger(self.l, value) };
        Ok(())
    }

    pub(crate) fn push_number(&self, value: ffi::lua_Number) -> LuaResult<()> {
        self.ensure_free_capacity(1)?;
        unsafe { ffi::lua_pushnumber(self.l, value) };
        Ok(())
    }

    /// Push a string with an explicit length; embedded zero bytes survive.
    pub(crate) fn push_bytes(&self, bytes: &[u8]) -> LuaResult<()> {
        self.ensure_free_capacity(1)?;
        let (ptr, len) = (bytes.as_ptr() as *const c_char, bytes.len());
        unsafe {
            self.state.protect_if_limited(self.l, 0, 1, move |l| {
                ffi::lua_pushlstring(l, ptr, len);
            })
        }
    }

    pub(crate) fn push_light_userdata(&self, ptr: *mut c_void) -> LuaResult<()> {
        self.ensure_free_capacity(1)?;
        unsafe { ffi::lua_pushlightuserdata(self.l, ptr) };
        Ok(())
    }

    /// Push a copy of the value at the absolute `index`.
    pub(crate) fn push_copy(&self, index: c_int) -> LuaResult<()> {
        self.ensure_free_capacity(1)?;
        unsafe { ffi::lua_pushvalue(self.l, index) };
        Ok(())
    }

    pub(crate) fn push_registry_slot(&self, slot: c_int) -> LuaResult<()> {
        self.ensure_free_capacity(1)?;
        unsafe { ffi::lua_rawgeti(self.l, ffi::LUA_REGISTRYINDEX, slot as ffi::lua_Integer) };
        Ok(())
    }

    pub(crate) fn push_registry_field(&self, field: &std::ffi::CStr) -> LuaResult<()> {
        self.ensure_free_capacity(1)?;
        let name = field.as_ptr();
        unsafe {
            self.state.protect_if_limited(self.l, 0, 1, move |l| {
                ffi::lua_getfield(l, ffi::LUA_REGISTRYINDEX, name);
            })
        }
    }

    pub(crate) fn new_table(&self, narr: usize, nrec: usize) -> LuaResult<()> {
        self.ensure_free_capacity(1)?;
        let narr = c_int::try_from(narr).unwrap_or(c_int::MAX);
        let nrec = c_int::try_from(nrec).unwrap_or(c_int::MAX);
        unsafe {
            self.state.protect_if_limited(self.l, 0, 1, move |l| {
                ffi::lua_createtable(l, narr, nrec);
            })
        }
    }

    /// `t[k] = v` without metamethods, where `t` is at the absolute `table`
    /// index and key and value are the two top values (popped).
    pub(crate) fn raw_set_top(&self, table: c_int) -> LuaResult<()> {
        let l = self.l;
        unsafe {
            match ffi::lua_type(l, -2) {
                ffi::LUA_TNIL => {
                    ffi::lua_pop(l, 2);
                    return Err(LuaError::Argument("table index is nil".into()));
                }
                ffi::LUA_TNUMBER if ffi::lua_isinteger(l, -2) == 0 && ffi::lua_tonumber(l, -2).is_nan() => {
                    ffi::lua_pop(l, 2);
                    return Err(LuaError::Argument("table index is NaN".into()));
                }
                _ => {}
            }
        }
        if let Err(err) = self.ensure_free_capacity(1) {
            unsafe { ffi::lua_pop(l, 2) };
            return Err(err);
        }
        unsafe {
            // A protected body only sees its arguments: pass the table along.
            ffi::lua_pushvalue(l, table);
            ffi::lua_rotate(l, -3, 1);
            self.state.protect_if_limited(l, 3, 0, |l| {
                ffi::lua_rawset(l, -3);
                ffi::lua_pop(l, 1);
            })
        }
    }

    /// `t[n] = v` without metamethods; pops the value.
    pub(crate) fn raw_seti_top(&self, table: c_int, n: ffi::lua_Integer) -> LuaResult<()> {
        let l = self.l;
        if let Err(err) = self.ensure_free_capacity(1) {
            unsafe { ffi::lua_pop(l, 1) };
            return Err(err);
        }
        unsafe {
            ffi::lua_pushvalue(l, table);
            ffi::lua_rotate(l, -2, 1);
            self.state.protect_if_limited(l, 2, 0, move |l| {
                ffi::lua_rawseti(l, -2, n);
                ffi::lua_pop(l, 1);
            })
        }
    }

    // ==================== Ranges ====================

    /// `len` consecutive values starting at `start`.
    pub fn get_range(&self, start: c_int, len: c_int) -> LuaResult<StackValueRange<'_>> {
        if len < 0 {
            return Err(LuaError::Argument(format!("negative range length {len}")));
        }
        if len == 0 {
            let start = if start < 0 { self.count() + start + 1 } else { start };
            return Ok(StackValueRange {
                stack: self,
                start: start.max(1),
                len: 0,
            });
        }
        let first = self.absolute(start)?;
        self.absolute(first + len - 1)?;
        Ok(StackValueRange {
            stack: self,
            start: first,
            len,
        })
    }

    /// The top `len` values.
    pub fn top_range(&self, len: c_int) -> LuaResult<StackValueRange<'_>> {
        self.get_range(self.count() - len + 1, len)
    }

    /// Remove `len` values starting at `start`, shifting the ones above down.
    pub fn remove_range(&self, start: c_int, len: c_int) -> LuaResult<()> {
        if len == 0 {
            return Ok(());
        }
        let range = self.get_range(start, len)?;
        unsafe {
            ffi::lua_rotate(self.l, range.start, -len);
            ffi::lua_pop(self.l, len);
        }
        Ok(())
    }

    /// Rotate the values between `index` and the top by `n` positions
    /// towards the top.
    pub fn rotate(&self, index: c_int, n: c_int) -> LuaResult<()> {
        let index = self.absolute(index)?;
        let span = self.count() - index + 1;
        if n.unsigned_abs() > span as u32 {
            return Err(LuaError::Argument(format!(
                "cannot rotate {span} values by {n}"
            )));
        }
        unsafe { ffi::lua_rotate(self.l, index, n) };
        Ok(())
    }

    pub fn pop(&self, n: c_int) -> LuaResult<()> {
        let count = self.count();
        if n < 0 || n > count {
            return Err(LuaError::IndexOutOfRange { index: -n, count });
        }
        unsafe { ffi::lua_pop(self.l, n) };
        Ok(())
    }

    /// Pop the top value as `T`.
    pub fn pop_value<T: FromLua>(&self) -> LuaResult<T> {
        let value = T::from_lua(self.top()?);
        unsafe { ffi::lua_pop(self.l, 1) };
        value
    }

    /// Truncate, or extend with nils, to exactly `count` values.
    pub fn set_count(&self, count: c_int) -> LuaResult<()> {
        if count < 0 {
            return Err(LuaError::Argument(format!("negative stack count {count}")));
        }
        let current = self.count();
        if count > current {
            self.ensure_free_capacity((count - current) as usize)?;
        }
        unsafe { ffi::lua_settop(self.l, count) };
        Ok(())
    }
}

impl Drop for LuaStack<'_> {
    fn drop(&mut self) {
        self.state.stack_view_closed();
    }
}

impl fmt::Debug for LuaStack<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LuaStack(owner={}, count={})", self.owner(), self.count())
    }
}

// ==================== StackValue ====================

/// A value on the stack, by absolute index. Not an owning reference: it goes
/// stale if the stack shrinks below it.
#[derive(Clone, Copy)]
pub struct StackValue<'a> {
    stack: &'a LuaStack<'a>,
    index: c_int,
}

impl<'a> StackValue<'a> {
    pub fn index(&self) -> c_int {
        self.index
    }

    pub fn stack(&self) -> &'a LuaStack<'a> {
        self.stack
    }

    pub fn owner(&self) -> StateId {
        self.stack.owner()
    }

    pub(crate) fn state(&self) -> &'a LuaState {
        self.stack.state
    }

    pub(crate) fn raw(&self) -> *mut lua_State {
        self.stack.l
    }

    pub fn lua_type(&self) -> LuaType {
        LuaType::from_code(unsafe { ffi::lua_type(self.stack.l, self.index) })
    }

    pub fn type_name(&self) -> &'static str {
        self.lua_type().name()
    }

    pub fn is_nil(&self) -> bool {
        self.lua_type() == LuaType::Nil
    }

    /// Lua truthiness: everything but `nil` and `false`.
    pub fn is_truthy(&self) -> bool {
        unsafe { ffi::lua_toboolean(self.stack.l, self.index) != 0 }
    }

    pub fn get<T: FromLua>(self) -> LuaResult<T> {
        T::from_lua(self)
    }

    /// Raw pointer identity (`lua_topointer`), null for non-reference values.
    pub fn to_pointer(&self) -> *const c_void {
        unsafe { ffi::lua_topointer(self.stack.l, self.index) }
    }

    pub fn raw_equals(&self, other: &StackValue<'_>) -> bool {
        self.owner() == other.owner()
            && unsafe { ffi::lua_rawequal(self.stack.l, self.index, other.index) != 0 }
    }
}

impl fmt::Debug for StackValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StackValue(index={}, type={})", self.index, self.type_name())
    }
}

// ==================== StackValueRange ====================

/// Consecutive stack values, used for arguments and multiple results.
#[derive(Clone, Copy)]
pub struct StackValueRange<'a> {
    stack: &'a LuaStack<'a>,
    start: c_int,
    len: c_int,
}

impl<'a> StackValueRange<'a> {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Absolute index of the first value.
    pub fn start(&self) -> c_int {
        self.start
    }

    /// The `i`-th value of the range (zero-based).
    pub fn get(&self, i: usize) -> Option<StackValue<'a>> {
        let i = c_int::try_from(i).ok()?;
        (i < self.len).then(|| StackValue {
            stack: self.stack,
            index: self.start + i,
        })
    }

    /// The range without its first `n` values.
    pub fn skip(&self, n: usize) -> StackValueRange<'a> {
        let n = c_int::try_from(n).unwrap_or(c_int::MAX).min(self.len);
        StackValueRange {
            stack: self.stack,
            start: self.start + n,
            len: self.len - n,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = StackValue<'a>> + 'a {
        let stack = self.stack;
        (self.start..self.start + self.len).map(move |index| StackValue { stack, index })
    }

    pub fn to_vec(&self) -> Vec<StackValue<'a>> {
        self.iter().collect()
    }

    /// Convert the whole range with `FromLuaMulti`.
    pub fn read<T: FromLuaMulti>(&self) -> LuaResult<T> {
        T::from_lua_multi(*self)
    }
}

impl fmt::Debug for StackValueRange<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StackValueRange(start={}, len={})", self.start, self.len)
    }
}

// ==================== StackSnapshot ====================

/// Scoped guard returned by [`LuaStack::snapshot_count`].
///
/// On drop the stack is truncated to the saved count, or padded with nils
/// if it shrank below it, so indices under the snapshot stay valid.
pub struct StackSnapshot<'a> {
    stack: &'a LuaStack<'a>,
    count: c_int,
}

impl StackSnapshot<'_> {
    pub fn count(&self) -> c_int {
        self.count
    }
}

impl Drop for StackSnapshot<'_> {
    fn drop(&mut self) {
        if self.stack.state.is_closed() {
            return;
        }
        let l = self.stack.l;
        unsafe {
            let current = ffi::lua_gettop(l);
            if current < self.count && ffi::lua_checkstack(l, self.count - current) == 0 {
                tracing::warn!(
                    expected = self.count,
                    current,
                    "cannot restore stack count: no room to pad"
                );
                return;
            }
            ffi::lua_settop(l, self.count);
        }
    }
}
