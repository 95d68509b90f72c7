// Interpreter facade
// Owns one Lua 5.4 state and exposes loading, globals, references,
// callbacks, userdata, libraries, GC control and hooks on top of it.
mod chunk;
pub mod hook;
mod lua_error;
pub(crate) mod lua_ref;
pub(crate) mod lua_state;
pub(crate) mod panic_bridge;
mod ref_pool;
mod safe_option;
mod stack;

use std::cell::RefCell;
use std::ffi::{c_int, c_void};
use std::fmt;
use std::path::Path;
use std::rc::Rc;

pub use chunk::{Chunk, ChunkMode, ChunkSource, ReadSeek};
pub use hook::{CancellationToken, ExecutionLimits, HookEvent, HookTriggers};
pub use lua_error::{LuaError, LuaResult, LuaStatus};
pub use lua_ref::{
    LuaFunctionRef, LuaReference, LuaTableRef, LuaThreadRef, LuaUserDataRef, LuaWeakRef, RefKind,
    ThreadStatus,
};
pub use lua_state::StateId;
pub use safe_option::SafeOption;
pub use stack::{LuaStack, StackSnapshot, StackValue, StackValueRange};

use crate::ffi::callback::{RustCallback, push_callback};
use crate::ffi::{self, lua_State};
use crate::lib_registry::{self, LibraryModule, LuaLibrary};
use crate::lua_value::userdata::{self, LuaUserData};
use crate::lua_value::{FromLua, FromLuaMulti, IntoLua, IntoLuaMulti};
use lua_ref::{RefAccess, RefCore};
use lua_state::LuaState;

/// Handle to one interpreter state.
///
/// Clones share the state; it is closed by [`close`](Self::close) or when
/// the last handle drops. References and stack views only hold weak links,
/// so they never keep a state open.
///
/// Callbacks receive a `&LuaVM` for the state they run in. Capturing a
/// `LuaVM` inside a callback creates a cycle that keeps the state open until
/// it is closed explicitly.
#[derive(Clone)]
pub struct LuaVM {
    state: Rc<LuaState>,
}

impl LuaVM {
    /// New state with every standard library.
    pub fn new() -> LuaResult<Self> {
        Self::with_options(SafeOption::default())
    }

    pub fn with_options(options: SafeOption) -> LuaResult<Self> {
        let libraries = options.libraries.clone();
        let vm = LuaVM {
            state: LuaState::new(options)?,
        };
        if !libraries.is_empty() {
            let stack = vm.stack()?;
            for library in libraries {
                lib_registry::open_library(&stack, library)?;
            }
        }
        Ok(vm)
    }

    pub(crate) fn from_state(state: Rc<LuaState>) -> Self {
        LuaVM { state }
    }

    /// The state, unless it has been closed.
    pub(crate) fn state(&self) -> LuaResult<&Rc<LuaState>> {
        if self.state.is_closed() {
            return Err(LuaError::StateClosed);
        }
        Ok(&self.state)
    }

    pub fn id(&self) -> StateId {
        self.state.id()
    }

    pub fn options(&self) -> &SafeOption {
        self.state.options()
    }

    /// Close the state now. Every reference, stack view and callback of it
    /// becomes unusable. Closing twice is a no-op; closing from inside a
    /// call into the state fails.
    pub fn close(&self) -> LuaResult<()> {
        self.state.close()
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Stack of the thread currently running host code: the main thread,
    /// or the coroutine a callback was called from.
    pub fn stack(&self) -> LuaResult<LuaStack<'_>> {
        self.state()?.stack()
    }

    /// Run `f` with a stack whose height is restored afterwards.
    fn with_stack<R>(&self, f: impl FnOnce(&LuaStack<'_>) -> LuaResult<R>) -> LuaResult<R> {
        let stack = self.stack()?;
        let result = {
            let _guard = stack.snapshot_count();
            f(&stack)
        };
        // Unprotected allocations may have run finalizers.
        stack.state().bridge.resume_pending();
        result
    }

    // ==================== Globals ====================

    /// The global table. Always the same persistent reference.
    pub fn globals(&self) -> LuaResult<LuaTableRef> {
        self.with_stack(|stack| {
            stack.push_registry_slot(ffi::LUA_RIDX_GLOBALS as c_int)?;
            let pointer = unsafe { ffi::lua_topointer(stack.raw(), -1) };
            let core = RefCore::persistent(
                stack.state(),
                ffi::LUA_RIDX_GLOBALS as c_int,
                RefKind::Table,
                pointer,
            );
            Ok(LuaTableRef::from_core(core))
        })
    }

    pub fn get_global<V: FromLua>(&self, name: &str) -> LuaResult<V> {
        self.globals()?.get(name)
    }

    pub fn set_global<V: IntoLua>(&self, name: &str, value: V) -> LuaResult<()> {
        self.globals()?.set(name, value)
    }

    // ==================== Tables ====================

    pub fn create_table(&self) -> LuaResult<LuaTableRef> {
        self.create_table_with_capacity(0, 0)
    }

    pub fn create_table_with_capacity(&self, narr: usize, nrec: usize) -> LuaResult<LuaTableRef> {
        self.with_stack(|stack| {
            stack.new_table(narr, nrec)?;
            stack.pop_value()
        })
    }

    /// Table holding `values` at `1..=n`.
    pub fn create_sequence_from<T, I>(&self, values: I) -> LuaResult<LuaTableRef>
    where
        T: IntoLua,
        I: IntoIterator<Item = T>,
    {
        self.with_stack(|stack| {
            stack.push(crate::lua_value::LuaSequence(values))?;
            stack.pop_value()
        })
    }

    /// Table holding every `(key, value)` pair.
    pub fn create_table_from<K, V, I>(&self, pairs: I) -> LuaResult<LuaTableRef>
    where
        K: IntoLua,
        V: IntoLua,
        I: IntoIterator<Item = (K, V)>,
    {
        self.with_stack(|stack| {
            stack.push(crate::lua_value::LuaMap(pairs))?;
            stack.pop_value()
        })
    }

    // ==================== Functions ====================

    /// Expose a Rust function. Arguments and results go through the
    /// marshaler; an `Err` becomes a Lua error that scripts can catch and
    /// that reaches the host unchanged.
    ///
    /// ```ignore
    /// let add = vm.create_function(|_, (a, b): (i64, i64)| Ok(a + b))?;
    /// vm.set_global("add", &add)?;
    /// ```
    pub fn create_function<A, R, F>(&self, func: F) -> LuaResult<LuaFunctionRef>
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: Fn(&LuaVM, A) -> LuaResult<R> + 'static,
    {
        self.push_function(function_callback(func))
    }

    /// Like [`create_function`](Self::create_function) for `FnMut`. A call
    /// that re-enters the same function fails with
    /// [`LuaError::BorrowConflict`].
    pub fn create_function_mut<A, R, F>(&self, func: F) -> LuaResult<LuaFunctionRef>
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: FnMut(&LuaVM, A) -> LuaResult<R> + 'static,
    {
        let func = RefCell::new(func);
        self.create_function(move |vm, args: A| {
            let mut func = func
                .try_borrow_mut()
                .map_err(|_| LuaError::BorrowConflict("function is already running".into()))?;
            func(vm, args)
        })
    }

    /// Expose a function that works on its call frame directly: arguments
    /// are at `1..=count`, and it returns how many values it pushed.
    pub fn create_raw_function<F>(&self, func: F) -> LuaResult<LuaFunctionRef>
    where
        F: Fn(&LuaVM, &LuaStack<'_>) -> LuaResult<c_int> + 'static,
    {
        self.push_function(Rc::new(func))
    }

    fn push_function(&self, callback: Rc<RustCallback>) -> LuaResult<LuaFunctionRef> {
        self.with_stack(|stack| {
            push_callback(stack, callback)?;
            stack.pop_value()
        })
    }

    // ==================== Threads ====================

    /// New coroutine that runs `function` on its first resume.
    pub fn create_thread(&self, function: &LuaFunctionRef) -> LuaResult<LuaThreadRef> {
        if function.owner() != Some(self.id()) {
            return Err(LuaError::foreign_owner(RefKind::Function.name()));
        }
        self.with_stack(|stack| {
            let state = stack.state();
            let l = stack.raw();
            stack.ensure_free_capacity(2)?;
            let thread: *mut lua_State =
                unsafe { state.protect_if_limited(l, 0, 1, |l| ffi::lua_newthread(l))? };
            stack.push(function)?;
            unsafe { ffi::lua_xmove(l, thread, 1) };
            stack.pop_value()
        })
    }

    /// The main thread; every handle to it shares one persistent slot.
    pub fn main_thread(&self) -> LuaResult<LuaThreadRef> {
        let state = self.state()?;
        let main = state.main_thread()?;
        let core = RefCore::persistent(
            state,
            ffi::LUA_RIDX_MAINTHREAD as c_int,
            RefKind::Thread,
            main as *const c_void,
        );
        Ok(LuaThreadRef::from_core(core))
    }

    // ==================== Userdata ====================

    /// Move `value` into a new userdata.
    pub fn create_userdata<T: LuaUserData>(&self, value: T) -> LuaResult<LuaUserDataRef> {
        self.create_userdata_shared(Rc::new(RefCell::new(value)))
    }

    /// Userdata for a shared host object. Pushing the same `Rc` again yields
    /// the same userdata while it is alive.
    pub fn create_userdata_shared<T: LuaUserData>(&self, value: Rc<RefCell<T>>) -> LuaResult<LuaUserDataRef> {
        self.with_stack(|stack| {
            userdata::push_shared(stack, value)?;
            stack.pop_value()
        })
    }

    /// Build the metatable of `T` now instead of on first use, and return
    /// it for additions.
    pub fn register_userdata_type<T: LuaUserData>(&self) -> LuaResult<LuaTableRef> {
        self.with_stack(|stack| {
            let binding = userdata::registered_type::<T>(stack)?;
            stack.push_registry_slot(binding.metatable_slot())?;
            stack.pop_value()
        })
    }

    // ==================== Chunks ====================

    /// Prepare a chunk for loading.
    pub fn load<'a>(&self, source: impl Into<ChunkSource<'a>>) -> Chunk<'_, 'a> {
        Chunk::new(self, source.into())
    }

    /// Run `code`, discarding its results.
    pub fn execute(&self, code: &str) -> LuaResult<()> {
        self.load(code).exec()
    }

    /// Run `code` and read its results.
    pub fn evaluate<R: FromLuaMulti>(&self, code: &str) -> LuaResult<R> {
        self.load(code).eval()
    }

    /// Read a script file the way `luaL_loadfile` does. The chunk is named
    /// `@path`.
    pub fn load_file(&self, path: impl AsRef<Path>) -> LuaResult<Chunk<'_, 'static>> {
        let path = path.as_ref();
        let bytes = chunk::script_file_bytes(std::fs::read(path)?);
        Ok(self
            .load(ChunkSource::from(bytes))
            .set_name(format!("@{}", path.display())))
    }

    // ==================== Libraries ====================

    /// Open a standard library; `false` if it is already open.
    pub fn open_library(&self, library: LuaLibrary) -> LuaResult<bool> {
        lib_registry::open_library(&self.stack()?, library)
    }

    /// Remove the globals of a standard library; `false` if it was not open.
    pub fn close_library(&self, library: LuaLibrary) -> LuaResult<bool> {
        lib_registry::close_library(&self.stack()?, library.name())
    }

    pub fn open_module(&self, module: &LibraryModule) -> LuaResult<bool> {
        lib_registry::open_module(&self.stack()?, module)
    }

    pub fn close_module(&self, name: &str) -> LuaResult<bool> {
        lib_registry::close_library(&self.stack()?, name)
    }

    pub fn is_library_open(&self, name: &str) -> bool {
        self.stack()
            .map(|stack| lib_registry::is_open(&stack, name))
            .unwrap_or(false)
    }

    // ==================== Garbage collection ====================

    fn gc(&self, what: c_int, arg: c_int) -> LuaResult<c_int> {
        let state = self.state()?;
        // Opening a stack view applies queued releases, so dropped
        // references do not pin their values.
        let l = state.stack()?.raw();
        let result = unsafe { ffi::lua_gc(l, what, arg) };
        // Finalizers run here without a protected call around them.
        state.bridge.resume_pending();
        Ok(result)
    }

    /// Full collection cycle.
    pub fn collect_garbage(&self) -> LuaResult<()> {
        self.gc(ffi::LUA_GCCOLLECT, 0).map(drop)
    }

    /// Incremental step of `kbytes`; `true` when a cycle finished.
    pub fn gc_step(&self, kbytes: i32) -> LuaResult<bool> {
        self.gc(ffi::LUA_GCSTEP, kbytes).map(|done| done != 0)
    }

    pub fn gc_stop(&self) -> LuaResult<()> {
        self.gc(ffi::LUA_GCSTOP, 0).map(drop)
    }

    pub fn gc_restart(&self) -> LuaResult<()> {
        self.gc(ffi::LUA_GCRESTART, 0).map(drop)
    }

    pub fn gc_is_running(&self) -> LuaResult<bool> {
        self.gc(ffi::LUA_GCISRUNNING, 0).map(|running| running != 0)
    }

    /// Bytes currently allocated by the interpreter.
    pub fn used_memory(&self) -> usize {
        self.state.used_memory()
    }

    pub fn memory_limit(&self) -> Option<usize> {
        self.state.memory_limit()
    }

    /// Change the allocation ceiling; returns the previous one. Allocations
    /// beyond it fail with a memory error in the script that made them.
    pub fn set_memory_limit(&self, limit: Option<usize>) -> LuaResult<Option<usize>> {
        Ok(self.state()?.set_memory_limit(limit))
    }

    // ==================== Hooks ====================

    /// Bound every outermost call from now on. A coroutine picks the limits
    /// up when the host resumes it, whenever it was created.
    pub fn set_limits(&self, limits: ExecutionLimits) -> LuaResult<()> {
        let state = self.state()?;
        state.hooks.set_limits(state.main_thread()?, Some(limits));
        Ok(())
    }

    pub fn clear_limits(&self) -> LuaResult<()> {
        let state = self.state()?;
        state.hooks.set_limits(state.main_thread()?, None);
        Ok(())
    }

    /// Install a debug hook. An `Err` from it stops the script like an error
    /// raised at the current instruction.
    pub fn set_hook<F>(&self, triggers: HookTriggers, hook: F) -> LuaResult<()>
    where
        F: Fn(&LuaVM, HookEvent) -> LuaResult<()> + 'static,
    {
        let state = self.state()?;
        state
            .hooks
            .set_user_hook(state.main_thread()?, Some((triggers, Rc::new(hook))));
        Ok(())
    }

    pub fn remove_hook(&self) -> LuaResult<()> {
        let state = self.state()?;
        state.hooks.set_user_hook(state.main_thread()?, None);
        Ok(())
    }
}

impl fmt::Debug for LuaVM {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LuaVM")
            .field("id", &self.state.id())
            .field("closed", &self.state.is_closed())
            .field("used_memory", &self.state.used_memory())
            .finish()
    }
}

/// Callback that marshals arguments and results for `func`.
pub(crate) fn function_callback<A, R, F>(func: F) -> Rc<RustCallback>
where
    A: FromLuaMulti,
    R: IntoLuaMulti,
    F: Fn(&LuaVM, A) -> LuaResult<R> + 'static,
{
    Rc::new(move |vm: &LuaVM, stack: &LuaStack<'_>| {
        let args = stack.get_range(1, stack.count())?;
        let mut consumed = 0;
        let args = A::from_lua_args(args, &mut consumed)?;
        func(vm, args)?.push_multi(stack)
    })
}
