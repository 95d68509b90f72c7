// Host callbacks exposed to Lua.
//
// Every host function shares one native entry point, `callback_trampoline`.
// The closure itself lives in a per-state arena; the Lua closure carries a
// small full userdata with the arena handle as its only upvalue, and that
// userdata's `__gc` frees the arena slot.

use std::cell::RefCell;
use std::ffi::{CStr, c_int};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use crate::ffi::{self, lua_State};
use crate::lua_vm::lua_state::LuaState;
use crate::lua_vm::panic_bridge::native_entry;
use crate::lua_vm::{LuaError, LuaResult, LuaStack, LuaVM};

pub(crate) const CALLBACK_METATABLE: &CStr = c"luahost.callback";

/// Host function as stored in the arena. Arguments are the whole stack of
/// the call frame; the return value is the number of results pushed.
pub(crate) type RustCallback = dyn Fn(&LuaVM, &LuaStack<'_>) -> LuaResult<c_int>;

/// Arena handle stored inside the closure's upvalue userdata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct CallbackHandle {
    index: usize,
    generation: u32,
}

struct Slot {
    generation: u32,
    callback: Option<Rc<RustCallback>>,
}

#[derive(Default)]
pub(crate) struct CallbackArena {
    slots: RefCell<Vec<Slot>>,
    free: RefCell<Vec<usize>>,
}

impl CallbackArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, callback: Rc<RustCallback>) -> CallbackHandle {
        let mut slots = self.slots.borrow_mut();
        match self.free.borrow_mut().pop() {
            Some(index) => {
                let slot = &mut slots[index];
                slot.callback = Some(callback);
                CallbackHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                slots.push(Slot {
                    generation: 0,
                    callback: Some(callback),
                });
                CallbackHandle {
                    index: slots.len() - 1,
                    generation: 0,
                }
            }
        }
    }

    pub(crate) fn get(&self, handle: CallbackHandle) -> Option<Rc<RustCallback>> {
        let slots = self.slots.borrow();
        let slot = slots.get(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.callback.clone()
    }

    /// Free the slot if `handle` still names it. The closure is dropped after
    /// the arena borrow ends.
    pub(crate) fn remove(&self, handle: CallbackHandle) {
        let removed = {
            let mut slots = self.slots.borrow_mut();
            match slots.get_mut(handle.index) {
                Some(slot) if slot.generation == handle.generation && slot.callback.is_some() => {
                    slot.generation = slot.generation.wrapping_add(1);
                    self.free.borrow_mut().push(handle.index);
                    slot.callback.take()
                }
                _ => None,
            }
        };
        drop(removed);
    }

    /// Number of live callbacks.
    pub(crate) fn len(&self) -> usize {
        self.slots
            .borrow()
            .iter()
            .filter(|slot| slot.callback.is_some())
            .count()
    }

    pub(crate) fn clear(&self) {
        let slots = mem::take(&mut *self.slots.borrow_mut());
        self.free.borrow_mut().clear();
        drop(slots);
    }
}

/// Push a Lua closure that dispatches to `callback`.
pub(crate) fn push_callback(stack: &LuaStack<'_>, callback: Rc<RustCallback>) -> LuaResult<()> {
    stack.ensure_free_capacity(2)?;
    let state = stack.state();
    let handle = state.callbacks.insert(callback);
    let pushed = unsafe {
        state.protect_if_limited(stack.raw(), 0, 1, move |l| {
            let block = ffi::lua_newuserdatauv(l, mem::size_of::<CallbackHandle>(), 0)
                as *mut CallbackHandle;
            block.write(handle);
            ffi::lua_getfield(l, ffi::LUA_REGISTRYINDEX, CALLBACK_METATABLE.as_ptr());
            ffi::lua_setmetatable(l, -2);
            ffi::lua_pushcclosure(l, callback_trampoline, 1);
        })
    };
    if let Err(err) = pushed {
        state.callbacks.remove(handle);
        return Err(err);
    }
    Ok(())
}

unsafe extern "C-unwind" fn callback_trampoline(l: *mut lua_State) -> c_int {
    unsafe {
        native_entry(l, || {
            let handle = *(ffi::lua_touserdata(l, ffi::lua_upvalueindex(1)) as *const CallbackHandle);
            let state = LuaState::from_extra(l)
                .and_then(LuaState::rc)
                .ok_or(LuaError::StateClosed)?;
            let callback = state.callbacks.get(handle).ok_or_else(|| {
                LuaError::InvalidOperation("callback has been released".into())
            })?;
            state.releases.drain(l);
            let _thread = state.enter_thread(l);
            let stack = LuaStack::new(&state, l);
            let vm = LuaVM::from_state(state.clone());
            callback(&vm, &stack)
        })
    }
}

/// `__gc` of the upvalue userdata.
pub(crate) unsafe extern "C-unwind" fn callback_handle_gc(l: *mut lua_State) -> c_int {
    unsafe {
        let block = ffi::lua_touserdata(l, 1) as *const CallbackHandle;
        if block.is_null() {
            return 0;
        }
        let handle = *block;
        if let Some(state) = LuaState::from_extra(l) {
            let released = panic::catch_unwind(AssertUnwindSafe(|| state.callbacks.remove(handle)));
            if let Err(payload) = released {
                tracing::error!("panic while dropping a host callback");
                state.bridge.defer_panic(payload);
            }
        }
    }
    0
}
