//! Panic bridge between Rust and the interpreter's `longjmp` error protocol.
//!
//! Rust code never lets a Lua error jump over a frame that still owns a value
//! with a destructor, and never lets a Rust panic or `LuaError` unwind into a
//! C frame:
//!
//! * every native entry point runs its Rust body through [`native_entry`]. A
//!   failure is moved onto the current [`PanicContext`] under a fresh token,
//!   the token is pushed as a full userdata and `lua_error` is raised from a
//!   frame that owns nothing;
//! * every protected call made from Rust goes through [`PanicBridge::pcall`]
//!   or [`PanicBridge::resume`], which push a context, run the interpreter and
//!   pop the context again. If the error object that comes back is the token
//!   of the captured failure, the original `LuaError` is returned unchanged;
//!   a captured Rust panic always resumes unwinding on the Rust side;
//! * a Rust panic captured while no protected call is active (a finalizer run
//!   by a collection the host started) is parked on the bridge and resumed
//!   when control returns to the host;
//! * outside any protected call the interpreter's panic handler logs and
//!   aborts the process.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::ffi::{CStr, c_char, c_int, c_void};
use std::mem::{self, MaybeUninit};
use std::panic::{self, AssertUnwindSafe};

use crate::ffi::{self, lua_State};
use crate::lua_vm::lua_error::{LuaError, LuaResult, normalize_newlines, panic_message};
use crate::lua_vm::lua_state::LuaState;

pub(crate) const ERROR_TOKEN_METATABLE: &CStr = c"luahost.error_token";

/// A failure captured while Rust code ran under a native entry point.
pub(crate) enum CapturedError {
    Error(LuaError),
    Panic(Box<dyn Any + Send>),
}

struct Captured {
    token: u64,
    failure: CapturedError,
    /// Text exposed to scripts through the token's uservalue.
    message: String,
}

/// One protection scope. Contexts form a singly linked stack through
/// `parent`; the head is the innermost active protected call.
pub(crate) struct PanicContext {
    parent: Option<Box<PanicContext>>,
    captured: Option<Captured>,
    depth: usize,
}

impl PanicContext {
    fn empty() -> Self {
        PanicContext {
            parent: None,
            captured: None,
            depth: 0,
        }
    }
}

pub(crate) struct PanicBridge {
    current: RefCell<Option<Box<PanicContext>>>,
    pool: RefCell<Vec<Box<PanicContext>>>,
    pool_capacity: usize,
    next_token: Cell<u64>,
    /// Message of a failure raised while no context was active.
    orphan_message: RefCell<String>,
    /// Panic captured while no context was active, waiting for the host.
    pending: RefCell<Option<Box<dyn Any + Send>>>,
}

impl PanicBridge {
    pub(crate) fn new(pool_capacity: usize) -> Self {
        PanicBridge {
            current: RefCell::new(None),
            pool: RefCell::new(Vec::with_capacity(pool_capacity)),
            pool_capacity,
            next_token: Cell::new(1),
            orphan_message: RefCell::new(String::new()),
            pending: RefCell::new(None),
        }
    }

    /// Number of protected calls currently active on this state.
    pub(crate) fn depth(&self) -> usize {
        self.current.borrow().as_ref().map_or(0, |ctx| ctx.depth)
    }

    fn enter(&self) {
        let mut ctx = self
            .pool
            .borrow_mut()
            .pop()
            .unwrap_or_else(|| Box::new(PanicContext::empty()));
        let mut current = self.current.borrow_mut();
        ctx.depth = current.as_ref().map_or(1, |parent| parent.depth + 1);
        ctx.parent = current.take();
        *current = Some(ctx);
    }

    fn leave(&self) -> Option<Captured> {
        let mut ctx = {
            let mut current = self.current.borrow_mut();
            let mut ctx = current.take()?;
            *current = ctx.parent.take();
            ctx
        };
        let captured = ctx.captured.take();
        ctx.depth = 0;
        let mut pool = self.pool.borrow_mut();
        if pool.len() < self.pool_capacity {
            pool.push(ctx);
        }
        captured
    }

    /// Store `failure` on the current context and return the token id and the
    /// message bytes to raise with. The returned pointer stays valid until the
    /// context is left.
    fn capture(&self, failure: CapturedError) -> (u64, *const u8, usize) {
        let message = match &failure {
            CapturedError::Error(LuaError::Runtime { message, .. }) => message.clone(),
            CapturedError::Error(err) => err.to_string(),
            CapturedError::Panic(payload) => format!("rust panic: {}", panic_message(&**payload)),
        };

        let mut current = self.current.borrow_mut();
        let Some(ctx) = current.as_mut() else {
            match failure {
                CapturedError::Panic(payload) => self.park(payload),
                CapturedError::Error(_) => {
                    tracing::warn!("host failure outside any protected call: {message}");
                }
            }
            let mut orphan = self.orphan_message.borrow_mut();
            *orphan = message;
            return (0, orphan.as_ptr(), orphan.len());
        };

        // A pending panic is never shadowed by a later failure.
        if let Some(existing) = &ctx.captured
            && matches!(existing.failure, CapturedError::Panic(_))
        {
            return (existing.token, existing.message.as_ptr(), existing.message.len());
        }

        if let Some(stale) = &ctx.captured {
            tracing::debug!(token = stale.token, "replacing unhandled captured error: {}", stale.message);
        }
        let token = self.next_token.get();
        self.next_token.set(token.wrapping_add(1).max(1));
        let captured = ctx.captured.insert(Captured {
            token,
            failure,
            message,
        });
        (token, captured.message.as_ptr(), captured.message.len())
    }

    /// Record a panic that must not be raised as a Lua error, such as one from
    /// a host object's `Drop` inside `__gc`. It resumes at the enclosing
    /// protected boundary, or when control returns to the host if there is
    /// none.
    pub(crate) fn defer_panic(&self, payload: Box<dyn Any + Send>) {
        let mut current = self.current.borrow_mut();
        let Some(ctx) = current.as_mut() else {
            self.park(payload);
            return;
        };
        if let Some(existing) = &ctx.captured
            && matches!(existing.failure, CapturedError::Panic(_))
        {
            tracing::error!("second panic while one is pending: {}", panic_message(&*payload));
            return;
        }
        let message = format!("rust panic: {}", panic_message(&*payload));
        let token = self.next_token.get();
        self.next_token.set(token.wrapping_add(1).max(1));
        ctx.captured = Some(Captured {
            token,
            failure: CapturedError::Panic(payload),
            message,
        });
    }

    /// Keep the first panic raised outside any context.
    fn park(&self, payload: Box<dyn Any + Send>) {
        let mut pending = self.pending.borrow_mut();
        if pending.is_some() {
            tracing::error!("second panic while one is pending: {}", panic_message(&*payload));
            return;
        }
        *pending = Some(payload);
    }

    pub(crate) fn has_pending_panic(&self) -> bool {
        self.pending.borrow().is_some()
    }

    /// Resume a parked panic on the host side. Only called from host frames,
    /// never from under a native entry point.
    pub(crate) fn resume_pending(&self) {
        if std::thread::panicking() {
            return;
        }
        let payload = self.pending.borrow_mut().take();
        if let Some(payload) = payload {
            panic::resume_unwind(payload);
        }
    }

    /// Protected call boundary: `lua_pcall` with a fresh panic context.
    ///
    /// Expects the function and `nargs` arguments on top of the stack. On
    /// success the results are left on the stack; on failure the error object
    /// is popped and converted.
    pub(crate) unsafe fn pcall(
        &self,
        l: *mut lua_State,
        nargs: c_int,
        nresults: c_int,
        traceback: bool,
    ) -> LuaResult<()> {
        unsafe {
            let mut handler = 0;
            if traceback {
                if ffi::lua_checkstack(l, 1) == 0 {
                    return Err(LuaError::InvalidOperation(
                        "stack overflow: no room for the message handler".into(),
                    ));
                }
                handler = ffi::lua_gettop(l) - nargs;
                ffi::lua_pushcfunction(l, traceback_handler);
                ffi::lua_insert(l, handler);
            }

            self.enter();
            let status = ffi::lua_pcall(l, nargs, nresults, handler);
            let captured = self.leave();

            if handler != 0 {
                ffi::lua_remove(l, handler);
            }
            self.finish(l, status, captured)
        }
    }

    /// `lua_resume` boundary. Returns the resume status (`LUA_OK` or
    /// `LUA_YIELD`) with the results on top of `thread`.
    pub(crate) unsafe fn resume(
        &self,
        thread: *mut lua_State,
        from: *mut lua_State,
        nargs: c_int,
        nresults: &mut c_int,
    ) -> LuaResult<c_int> {
        unsafe {
            self.enter();
            let status = ffi::lua_resume(thread, from, nargs, nresults);
            let captured = self.leave();
            self.finish(thread, status, captured)?;
            Ok(status)
        }
    }

    unsafe fn finish(
        &self,
        l: *mut lua_State,
        status: c_int,
        captured: Option<Captured>,
    ) -> LuaResult<()> {
        let captured = match captured {
            Some(Captured {
                failure: CapturedError::Panic(payload),
                ..
            }) => panic::resume_unwind(payload),
            Some(Captured {
                token,
                failure: CapturedError::Error(err),
                message,
            }) => Some((token, err, message)),
            None => None,
        };

        if status == ffi::LUA_OK || status == ffi::LUA_YIELD {
            if let Some((token, _, message)) = captured {
                tracing::debug!(token, "discarding error handled by script: {message}");
            }
            return Ok(());
        }

        let error = unsafe {
            match captured {
                Some((token, err, _)) if token_id(l, -1) == Some(token) => err,
                stale => {
                    if let Some((token, _, message)) = stale {
                        tracing::debug!(token, "discarding stale captured error: {message}");
                    }
                    error_from_top(l, status)
                }
            }
        };
        unsafe { ffi::lua_pop(l, 1) };
        Err(error)
    }
}

/// Run a Rust body as the implementation of a native entry point.
///
/// `body` returns the number of results it left on the stack. Errors and
/// panics are captured and raised as a Lua error once `body` and everything
/// it owned are gone.
pub(crate) unsafe fn native_entry<F>(l: *mut lua_State, body: F) -> c_int
where
    F: FnOnce() -> LuaResult<c_int>,
{
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(nresults)) => nresults,
        Ok(Err(err)) => unsafe { raise_captured(l, CapturedError::Error(err)) },
        Err(payload) => unsafe { raise_captured(l, CapturedError::Panic(payload)) },
    }
}

#[cold]
#[inline(never)]
unsafe fn raise_captured(l: *mut lua_State, failure: CapturedError) -> ! {
    unsafe {
        let (token, message, len) = match LuaState::from_extra(l) {
            Some(state) => state.bridge.capture(failure),
            None => {
                if let CapturedError::Panic(payload) = failure {
                    abort_on_panic(&*payload);
                }
                const CLOSED: &str = "host failure while the state is closing";
                (0, CLOSED.as_ptr(), CLOSED.len())
            }
        };
        // Nothing below owns a destructor.
        push_error_token(l, token, message, len);
        ffi::lua_error(l)
    }
}

unsafe fn push_error_token(l: *mut lua_State, token: u64, message: *const u8, len: usize) {
    unsafe {
        // The frame is about to be discarded; its slots are free to reuse.
        if ffi::lua_checkstack(l, 3) == 0 {
            ffi::lua_pop(l, 3);
        }
        if token == 0 {
            ffi::lua_pushlstring(l, message as *const c_char, len);
            return;
        }
        let block = ffi::lua_newuserdatauv(l, mem::size_of::<u64>(), 1) as *mut u64;
        block.write_unaligned(token);
        ffi::lua_pushlstring(l, message as *const c_char, len);
        ffi::lua_setiuservalue(l, -2, 1);
        ffi::lua_getfield(l, ffi::LUA_REGISTRYINDEX, ERROR_TOKEN_METATABLE.as_ptr());
        ffi::lua_setmetatable(l, -2);
    }
}

/// Token id of the error token at `index`, if the value is one.
unsafe fn token_id(l: *mut lua_State, index: c_int) -> Option<u64> {
    unsafe {
        let block = ffi::luaL_testudata(l, index, ERROR_TOKEN_METATABLE.as_ptr());
        (!block.is_null()).then(|| (block as *const u64).read_unaligned())
    }
}

/// Convert the error object on top of the stack, leaving it in place.
unsafe fn error_from_top(l: *mut lua_State, status: c_int) -> LuaError {
    let message = unsafe { error_message(l, -1) };
    LuaError::from_status(status, message)
}

pub(crate) unsafe fn error_message(l: *mut lua_State, index: c_int) -> String {
    unsafe {
        match ffi::lua_type(l, index) {
            ffi::LUA_TSTRING => match ffi::lua_tobytes(l, index) {
                Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                None => String::new(),
            },
            ffi::LUA_TNUMBER => {
                if ffi::lua_isinteger(l, index) != 0 {
                    itoa::Buffer::new().format(ffi::lua_tointeger(l, index)).to_owned()
                } else {
                    ffi::lua_tonumber(l, index).to_string()
                }
            }
            ffi::LUA_TUSERDATA if token_id(l, index).is_some() => {
                let index = ffi::lua_absindex(l, index);
                if ffi::lua_checkstack(l, 1) == 0 {
                    return "(error token)".to_owned();
                }
                ffi::lua_getiuservalue(l, index, 1);
                let message = ffi::lua_tobytes(l, -1)
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                    .unwrap_or_default();
                ffi::lua_pop(l, 1);
                message
            }
            tp => format!("(error object is a {} value)", ffi::type_name(l, tp)),
        }
    }
}

/// `__tostring` of error tokens: the captured message.
pub(crate) unsafe extern "C-unwind" fn token_tostring(l: *mut lua_State) -> c_int {
    unsafe {
        ffi::lua_getiuservalue(l, 1, 1);
        1
    }
}

/// Message handler that appends a traceback to string errors. Error tokens
/// pass through untouched so they can be matched at the boundary.
unsafe extern "C-unwind" fn traceback_handler(l: *mut lua_State) -> c_int {
    unsafe {
        if ffi::lua_type(l, 1) == ffi::LUA_TSTRING {
            let message = ffi::lua_tolstring(l, 1, std::ptr::null_mut());
            ffi::luaL_traceback(l, l, message, 1);
        }
        1
    }
}

/// A panic that no host frame can receive any more: the state is closing.
#[cold]
pub(crate) fn abort_on_panic(payload: &(dyn Any + Send)) -> ! {
    tracing::error!("rust panic while the interpreter state closes, aborting: {}", panic_message(payload));
    std::process::abort()
}

/// Installed with `lua_atpanic`: an error escaped every protected call.
pub(crate) unsafe extern "C-unwind" fn fail_fast_panic(l: *mut lua_State) -> c_int {
    let message = unsafe { error_message(l, -1) };
    tracing::error!("unprotected error in the Lua interpreter, aborting: {message}");
    std::process::abort()
}

struct ProtectedParams<F, R: Copy> {
    function: F,
    result: MaybeUninit<R>,
    nresults: c_int,
}

unsafe extern "C-unwind" fn protected_trampoline<F, R>(l: *mut lua_State) -> c_int
where
    F: Fn(*mut lua_State) -> R,
    R: Copy,
{
    unsafe {
        let params = ffi::lua_touserdata(l, -1) as *mut ProtectedParams<F, R>;
        ffi::lua_pop(l, 1);
        let result = ((*params).function)(l);
        (*params).result.write(result);
        if (*params).nresults == ffi::LUA_MULTRET {
            ffi::lua_gettop(l)
        } else {
            (*params).nresults
        }
    }
}

/// Run `f` inside a protected call so that C API functions which may raise
/// (allocation, metamethods) report a `LuaError` instead of jumping.
///
/// `f` receives the `nargs` values on top of the stack and must leave exactly
/// `nresults` values behind. It must not own anything with a destructor.
pub(crate) unsafe fn protect_lua<F, R>(
    state: &LuaState,
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
        if ffi::lua_checkstack(l, 2) == 0 {
            return Err(LuaError::InvalidOperation(
                "stack overflow: no room for a protected call".into(),
            ));
        }
        let base = ffi::lua_gettop(l) - nargs;
        ffi::lua_pushcfunction(l, protected_trampoline::<F, R>);
        if nargs > 0 {
            ffi::lua_rotate(l, base + 1, 1);
        }
        let mut params = ProtectedParams {
            function: f,
            result: MaybeUninit::uninit(),
            nresults,
        };
        ffi::lua_pushlightuserdata(l, &mut params as *mut ProtectedParams<F, R> as *mut c_void);
        state.bridge.pcall(l, nargs + 1, nresults, false)?;
        Ok(params.result.assume_init())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_stack_depth_and_pooling() {
        let bridge = PanicBridge::new(2);
        assert_eq!(bridge.depth(), 0);
        bridge.enter();
        bridge.enter();
        assert_eq!(bridge.depth(), 2);

        let (first, _, _) = bridge.capture(CapturedError::Error(LuaError::runtime("inner")));
        let inner = bridge.leave().expect("captured");
        assert_eq!(inner.token, first);
        assert_eq!(inner.message, "inner");
        assert_eq!(bridge.depth(), 1);

        assert!(bridge.leave().is_none());
        assert_eq!(bridge.depth(), 0);
        assert_eq!(bridge.pool.borrow().len(), 2);
    }

    #[test]
    fn test_panic_is_never_shadowed() {
        let bridge = PanicBridge::new(1);
        bridge.enter();
        let (panic_token, _, _) = bridge.capture(CapturedError::Panic(Box::new("boom")));
        let (token, _, _) = bridge.capture(CapturedError::Error(LuaError::runtime("later")));
        assert_eq!(token, panic_token);
        let captured = bridge.leave().expect("captured");
        assert!(matches!(captured.failure, CapturedError::Panic(_)));
        assert_eq!(captured.message, "rust panic: boom");
    }

    #[test]
    fn test_capture_without_context_keeps_message() {
        let bridge = PanicBridge::new(1);
        let (token, ptr, len) = bridge.capture(CapturedError::Error(LuaError::Argument("x".into())));
        assert_eq!(token, 0);
        let text = unsafe { std::str::from_utf8(std::slice::from_raw_parts(ptr, len)).unwrap() };
        assert_eq!(text, "bad argument: x");
        assert_eq!(normalize_newlines("a\r\nb".into()), "a\nb");
    }

    #[test]
    fn test_panic_without_context_is_parked() {
        let bridge = PanicBridge::new(1);
        let (token, _, _) = bridge.capture(CapturedError::Panic(Box::new("lost")));
        assert_eq!(token, 0);
        assert!(bridge.has_pending_panic());

        let payload = panic::catch_unwind(AssertUnwindSafe(|| bridge.resume_pending())).unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>().copied(), Some("lost"));
        assert!(!bridge.has_pending_panic());
    }

    #[test]
    fn test_deferred_panic_lands_on_current_context() {
        let bridge = PanicBridge::new(1);
        bridge.enter();
        bridge.defer_panic(Box::new("drop"));
        let captured = bridge.leave().expect("captured");
        assert!(matches!(captured.failure, CapturedError::Panic(_)));
        assert!(!bridge.has_pending_panic());
    }
}
