use std::alloc::{self, Layout};
use std::any::TypeId;
use std::cell::{Cell, RefCell};
use std::ffi::{c_int, c_void};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use smol_str::SmolStr;

use crate::ffi::callback::{CALLBACK_METATABLE, CallbackArena, callback_handle_gc};
use crate::ffi::{self, lua_State};
use crate::lua_value::userdata::RegisteredType;
use crate::lua_vm::hook::HookState;
use crate::lua_vm::lua_error::{LuaError, LuaResult, LuaStatus};
use crate::lua_vm::panic_bridge::{
    ERROR_TOKEN_METATABLE, PanicBridge, fail_fast_panic, protect_lua, token_tostring,
};
use crate::lua_vm::ref_pool::{EntityPool, ReleaseQueue};
use crate::lua_vm::safe_option::SafeOption;
use crate::lua_vm::stack::LuaStack;

/// Registry field holding the weak-valued side table of weak references.
pub(crate) const WEAK_REFS_FIELD: &std::ffi::CStr = c"luahost.weakrefs";

static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an interpreter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(u64);

impl StateId {
    pub(crate) const NONE: StateId = StateId(0);

    fn next() -> Self {
        StateId(NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lua#{}", self.0)
    }
}

// ==================== Allocator ====================

/// Bookkeeping of the tracking allocator handed to `lua_newstate`.
pub(crate) struct MemoryInfo {
    used: Cell<usize>,
    /// `0` means unlimited.
    limit: Cell<usize>,
}

unsafe extern "C" fn allocator(
    ud: *mut c_void,
    ptr: *mut c_void,
    osize: usize,
    nsize: usize,
) -> *mut c_void {
    unsafe {
        let memory = &*(ud as *const MemoryInfo);
        // With a null block, `osize` encodes the object type.
        let osize = if ptr.is_null() { 0 } else { osize };

        if nsize == 0 {
            if !ptr.is_null() {
                let layout = Layout::from_size_align_unchecked(osize, ffi::SYS_MIN_ALIGN);
                alloc::dealloc(ptr as *mut u8, layout);
                memory.used.set(memory.used.get().saturating_sub(osize));
            }
            return std::ptr::null_mut();
        }

        let limit = memory.limit.get();
        let new_used = memory.used.get().saturating_sub(osize) + nsize;
        if limit > 0 && nsize > osize && new_used > limit {
            return std::ptr::null_mut();
        }

        let Ok(new_layout) = Layout::from_size_align(nsize, ffi::SYS_MIN_ALIGN) else {
            return std::ptr::null_mut();
        };

        let block = if ptr.is_null() {
            alloc::alloc(new_layout)
        } else {
            let old_layout = Layout::from_size_align_unchecked(osize, ffi::SYS_MIN_ALIGN);
            alloc::realloc(ptr as *mut u8, old_layout, nsize)
        };
        if block.is_null() {
            if limit == 0 {
                alloc::handle_alloc_error(new_layout);
            }
            return std::ptr::null_mut();
        }
        memory.used.set(new_used);
        block as *mut c_void
    }
}

// ==================== LuaState ====================

/// Everything one interpreter state owns on the Rust side.
///
/// The main thread's extra space points back at this struct, so native entry
/// points can find it from a bare `lua_State` pointer.
pub(crate) struct LuaState {
    this: Weak<LuaState>,
    main: Cell<*mut lua_State>,
    /// Thread whose stack facade operations use: the main thread, or the
    /// coroutine a callback is running on.
    current: Cell<*mut lua_State>,
    id: StateId,
    memory: Box<MemoryInfo>,
    options: SafeOption,
    stack_views: Cell<usize>,
    pub(crate) bridge: PanicBridge,
    pub(crate) callbacks: CallbackArena,
    pub(crate) pool: EntityPool,
    pub(crate) releases: ReleaseQueue,
    pub(crate) hooks: HookState,
    pub(crate) userdata_types: RefCell<AHashMap<TypeId, Rc<RegisteredType>>>,
    /// Open libraries and modules with the global names each one defined.
    pub(crate) open_libraries: RefCell<AHashMap<SmolStr, Vec<SmolStr>>>,
}

impl LuaState {
    pub(crate) fn new(options: SafeOption) -> LuaResult<Rc<LuaState>> {
        let memory = Box::new(MemoryInfo {
            used: Cell::new(0),
            limit: Cell::new(options.max_memory_limit),
        });

        let l = unsafe {
            ffi::lua_newstate(allocator, &*memory as *const MemoryInfo as *mut c_void)
        };
        if l.is_null() {
            return Err(LuaError::Panic {
                message: "failed to create the interpreter state".into(),
                status: LuaStatus::Memory,
            });
        }

        unsafe {
            ffi::lua_atpanic(l, fail_fast_panic);
            let found = ffi::lua_version(l);
            let expected = ffi::LUA_VERSION_NUM as f64;
            if found != expected {
                ffi::lua_close(l);
                return Err(LuaError::VersionMismatch { expected, found });
            }
        }

        let state = Rc::new_cyclic(|this| LuaState {
            this: this.clone(),
            main: Cell::new(l),
            current: Cell::new(l),
            id: StateId::next(),
            memory,
            stack_views: Cell::new(0),
            bridge: PanicBridge::new(options.panic_context_pool_capacity),
            callbacks: CallbackArena::new(),
            pool: EntityPool::new(options.ref_pool_capacity),
            releases: ReleaseQueue::new(),
            hooks: HookState::new(),
            userdata_types: RefCell::new(AHashMap::new()),
            open_libraries: RefCell::new(AHashMap::new()),
            options,
        });

        unsafe {
            *(ffi::lua_getextraspace(l) as *mut *const LuaState) = Rc::as_ptr(&state);
            state.init_registry(l)?;
        }

        tracing::debug!(id = %state.id, "interpreter state created");
        Ok(state)
    }

    /// Metatables and side tables the binding keeps in the registry.
    unsafe fn init_registry(&self, l: *mut lua_State) -> LuaResult<()> {
        unsafe {
            protect_lua(self, l, 0, 0, |l| {
                ffi::luaL_newmetatable(l, ERROR_TOKEN_METATABLE.as_ptr());
                ffi::lua_pushcfunction(l, token_tostring);
                ffi::lua_setfield(l, -2, c"__tostring".as_ptr());
                ffi::lua_pushstring(l, c"luahost error".as_ptr());
                ffi::lua_setfield(l, -2, c"__metatable".as_ptr());
                ffi::lua_pop(l, 1);

                ffi::luaL_newmetatable(l, CALLBACK_METATABLE.as_ptr());
                ffi::lua_pushcfunction(l, callback_handle_gc);
                ffi::lua_setfield(l, -2, c"__gc".as_ptr());
                ffi::lua_pushstring(l, c"luahost callback".as_ptr());
                ffi::lua_setfield(l, -2, c"__metatable".as_ptr());
                ffi::lua_pop(l, 1);

                ffi::lua_createtable(l, 0, 0);
                ffi::lua_createtable(l, 0, 1);
                ffi::lua_pushstring(l, c"v".as_ptr());
                ffi::lua_setfield(l, -2, c"__mode".as_ptr());
                ffi::lua_setmetatable(l, -2);
                ffi::lua_setfield(l, ffi::LUA_REGISTRYINDEX, WEAK_REFS_FIELD.as_ptr());
            })
        }
    }

    /// Recover the state from a thread's extra space. `None` once the state
    /// has started closing.
    ///
    /// The returned reference is only valid while some `Rc<LuaState>` is
    /// alive, which holds for every call made through a protected boundary.
    pub(crate) unsafe fn from_extra<'a>(l: *mut lua_State) -> Option<&'a LuaState> {
        unsafe {
            let ptr = *(ffi::lua_getextraspace(l) as *const *const LuaState);
            ptr.as_ref()
        }
    }

    /// Owning handle to this state; `None` while it is being dropped.
    pub(crate) fn rc(&self) -> Option<Rc<LuaState>> {
        self.this.upgrade()
    }

    pub(crate) fn weak(&self) -> Weak<LuaState> {
        self.this.clone()
    }

    pub(crate) fn id(&self) -> StateId {
        self.id
    }

    pub(crate) fn options(&self) -> &SafeOption {
        &self.options
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.main.get().is_null()
    }

    pub(crate) fn main_thread(&self) -> LuaResult<*mut lua_State> {
        let l = self.main.get();
        if l.is_null() {
            Err(LuaError::StateClosed)
        } else {
            Ok(l)
        }
    }

    /// Stack view of the thread currently executing host code. A panic
    /// parked by an earlier finalizer resumes here; pending reference
    /// releases are applied first.
    pub(crate) fn stack(&self) -> LuaResult<LuaStack<'_>> {
        let l = self.current.get();
        if l.is_null() {
            return Err(LuaError::StateClosed);
        }
        self.bridge.resume_pending();
        unsafe { self.releases.drain(l) };
        Ok(LuaStack::new(self, l))
    }

    pub(crate) fn current_thread(&self) -> *mut lua_State {
        self.current.get()
    }

    /// Make `l` the current thread until the guard drops.
    pub(crate) fn enter_thread(&self, l: *mut lua_State) -> ThreadGuard<'_> {
        let previous = self.current.replace(l);
        ThreadGuard {
            state: self,
            previous,
        }
    }

    pub(crate) fn stack_view_opened(&self) {
        self.stack_views.set(self.stack_views.get() + 1);
    }

    pub(crate) fn stack_view_closed(&self) {
        self.stack_views.set(self.stack_views.get().saturating_sub(1));
    }

    // ==================== Protected calls ====================

    /// Call the function below the `nargs` arguments on top of `l`'s stack.
    /// Execution limits are re-armed when this is the outermost call.
    pub(crate) unsafe fn pcall(&self, l: *mut lua_State, nargs: c_int, nresults: c_int) -> LuaResult<()> {
        if self.bridge.depth() == 0 {
            self.hooks.rearm();
        }
        unsafe { self.bridge.pcall(l, nargs, nresults, self.options.traceback) }
    }

    pub(crate) unsafe fn resume(
        &self,
        thread: *mut lua_State,
        from: *mut lua_State,
        nargs: c_int,
        nresults: &mut c_int,
    ) -> LuaResult<c_int> {
        if self.bridge.depth() == 0 {
            self.hooks.rearm();
        }
        unsafe {
            self.hooks.sync(thread);
            self.bridge.resume(thread, from, nargs, nresults)
        }
    }

    /// Run `f` directly when no memory limit is set (allocation failure then
    /// aborts instead of raising), and inside a protected call otherwise.
    pub(crate) unsafe fn protect_if_limited<F, R>(
        &self,
        l: *mut lua_State,
        nargs: c_int,
        nresults: c_int,
        f: F,
    ) -> LuaResult<R>
    where
        F: Fn(*mut lua_State) -> R,
        R: Copy,
    {
        unsafe {
            if self.memory.limit.get() == 0 {
                Ok(f(l))
            } else {
                protect_lua(self, l, nargs, nresults, f)
            }
        }
    }

    // ==================== Memory ====================

    pub(crate) fn used_memory(&self) -> usize {
        self.memory.used.get()
    }

    pub(crate) fn memory_limit(&self) -> Option<usize> {
        match self.memory.limit.get() {
            0 => None,
            limit => Some(limit),
        }
    }

    pub(crate) fn set_memory_limit(&self, limit: Option<usize>) -> Option<usize> {
        let previous = self.memory_limit();
        self.memory.limit.set(limit.unwrap_or(0));
        previous
    }

    // ==================== Close ====================

    pub(crate) fn close(&self) -> LuaResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        if self.bridge.depth() > 0 || self.stack_views.get() > 0 {
            return Err(LuaError::InvalidOperation(
                "cannot close a state while it is executing".into(),
            ));
        }
        self.close_native();
        Ok(())
    }

    fn close_native(&self) {
        let l = self.main.replace(std::ptr::null_mut());
        if l.is_null() {
            return;
        }
        self.current.set(std::ptr::null_mut());
        unsafe {
            // Finalizers running inside lua_close must not reach back here.
            *(ffi::lua_getextraspace(l) as *mut *const LuaState) = std::ptr::null();
            ffi::lua_close(l);
        }
        self.releases.clear();
        self.callbacks.clear();
        self.userdata_types.borrow_mut().clear();
        self.open_libraries.borrow_mut().clear();
        self.hooks.clear();
        tracing::debug!(id = %self.id, used = self.used_memory(), "interpreter state closed");
    }
}

impl Drop for LuaState {
    fn drop(&mut self) {
        self.close_native();
    }
}

pub(crate) struct ThreadGuard<'a> {
    state: &'a LuaState,
    previous: *mut lua_State,
}

impl Drop for ThreadGuard<'_> {
    fn drop(&mut self) {
        if !self.state.is_closed() {
            self.state.current.set(self.previous);
        }
    }
}
