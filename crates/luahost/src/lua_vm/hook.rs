//! Debug hook: execution limits and user hooks.
//!
//! One native hook serves both. Limits use the count event; a user hook may
//! add call, return and line events. The hook goes through the same native
//! entry guard as callbacks, so a tripped limit surfaces as
//! [`LuaError::Cancelled`] at the enclosing protected call.

use std::cell::{Cell, RefCell};
use std::ffi::c_int;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::ffi::{self, lua_Debug, lua_State};
use crate::lua_vm::lua_state::LuaState;
use crate::lua_vm::panic_bridge::native_entry;
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

/// Default number of instructions between two limit checks.
pub const DEFAULT_CHECK_INTERVAL: u32 = 1000;

/// Shared flag that stops a running script at its next limit check.
///
/// Cloning shares the flag; the token may be cancelled from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clear the flag so the token can guard later calls.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Budgets for one outermost protected call. Budgets restart at every
/// outermost call.
#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    pub instruction_limit: Option<u64>,
    pub timeout: Option<Duration>,
    pub cancellation: Option<CancellationToken>,
    /// Instructions between checks; smaller is more precise and slower.
    pub check_interval: u32,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        ExecutionLimits {
            instruction_limit: None,
            timeout: None,
            cancellation: None,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

impl ExecutionLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instruction_limit(mut self, instructions: u64) -> Self {
        self.instruction_limit = Some(instructions);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_check_interval(mut self, instructions: u32) -> Self {
        self.check_interval = instructions.max(1);
        self
    }
}

/// Events a user hook asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookTriggers {
    pub on_calls: bool,
    pub on_returns: bool,
    pub every_line: bool,
    pub every_nth_instruction: Option<u32>,
}

impl HookTriggers {
    fn mask(&self) -> c_int {
        let mut mask = 0;
        if self.on_calls {
            mask |= ffi::LUA_MASKCALL;
        }
        if self.on_returns {
            mask |= ffi::LUA_MASKRET;
        }
        if self.every_line {
            mask |= ffi::LUA_MASKLINE;
        }
        if self.every_nth_instruction.is_some() {
            mask |= ffi::LUA_MASKCOUNT;
        }
        mask
    }
}

/// What a user hook is told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Call,
    TailCall,
    Return,
    /// New line about to run.
    Line(i32),
    Count,
}

pub(crate) type UserHook = dyn Fn(&LuaVM, HookEvent) -> LuaResult<()>;

struct Armed {
    limits: ExecutionLimits,
    executed: u64,
    deadline: Option<Instant>,
}

struct UserHookEntry {
    triggers: HookTriggers,
    callback: Rc<UserHook>,
    /// Instructions left until the next user count event.
    countdown: u64,
}

/// Hook configuration of one state.
pub(crate) struct HookState {
    limits: RefCell<Option<Armed>>,
    user: RefCell<Option<UserHookEntry>>,
    interval: Cell<u32>,
}

impl HookState {
    pub(crate) fn new() -> Self {
        HookState {
            limits: RefCell::new(None),
            user: RefCell::new(None),
            interval: Cell::new(0),
        }
    }

    /// Restart budgets and deadlines.
    pub(crate) fn rearm(&self) {
        if let Some(armed) = self.limits.borrow_mut().as_mut() {
            armed.executed = 0;
            armed.deadline = armed.limits.timeout.map(|timeout| Instant::now() + timeout);
        }
        if let Some(user) = self.user.borrow_mut().as_mut() {
            user.countdown = user.triggers.every_nth_instruction.map_or(0, u64::from);
        }
    }

    pub(crate) fn clear(&self) {
        self.limits.borrow_mut().take();
        let user = self.user.borrow_mut().take();
        drop(user);
        self.interval.set(0);
    }

    pub(crate) fn set_limits(&self, l: *mut lua_State, limits: Option<ExecutionLimits>) {
        *self.limits.borrow_mut() = limits.map(|limits| Armed {
            limits,
            executed: 0,
            deadline: None,
        });
        self.rearm();
        unsafe { self.install(l) };
    }

    pub(crate) fn set_user_hook(&self, l: *mut lua_State, hook: Option<(HookTriggers, Rc<UserHook>)>) {
        let previous = self.user.replace(hook.map(|(triggers, callback)| UserHookEntry {
            countdown: triggers.every_nth_instruction.map_or(0, u64::from),
            triggers,
            callback,
        }));
        drop(previous);
        unsafe { self.install(l) };
    }

    pub(crate) fn has_limits(&self) -> bool {
        self.limits.borrow().is_some()
    }

    /// Bring `thread` in line with the current configuration before it runs.
    /// Threads only inherit the hook of the thread that creates them, so one
    /// created before the last change would otherwise escape it.
    pub(crate) unsafe fn sync(&self, thread: *mut lua_State) {
        let (mask, interval) = self.native_mask();
        unsafe {
            let counting = mask & ffi::LUA_MASKCOUNT != 0;
            if ffi::lua_gethookmask(thread) == mask
                && (!counting || ffi::lua_gethookcount(thread) == interval as c_int)
            {
                return;
            }
            self.install(thread);
        }
    }

    /// Mask and count interval the native hook needs right now.
    fn native_mask(&self) -> (c_int, u32) {
        let limit_interval = self
            .limits
            .borrow()
            .as_ref()
            .map(|armed| armed.limits.check_interval.max(1));
        let (user_mask, user_interval) = match self.user.borrow().as_ref() {
            Some(user) => (user.triggers.mask(), user.triggers.every_nth_instruction.map(|n| n.max(1))),
            None => (0, None),
        };
        let interval = match (limit_interval, user_interval) {
            (Some(a), Some(b)) => a.min(b),
            (a, b) => a.or(b).unwrap_or(0),
        };
        let mut mask = user_mask;
        if interval > 0 {
            mask |= ffi::LUA_MASKCOUNT;
        }
        (mask, interval)
    }

    /// Install or remove the native hook on `l` according to the current
    /// configuration. Threads created afterwards inherit it.
    unsafe fn install(&self, l: *mut lua_State) {
        let (mask, interval) = self.native_mask();
        self.interval.set(interval);
        unsafe {
            if mask == 0 {
                ffi::lua_sethook(l, None, 0, 0);
            } else {
                ffi::lua_sethook(l, Some(hook_proc), mask, interval as c_int);
            }
        }
        tracing::trace!(mask, interval, "debug hook installed");
    }

    /// Count `interval` more instructions and check every limit.
    fn check_limits(&self) -> LuaResult<()> {
        let mut limits = self.limits.borrow_mut();
        let Some(armed) = limits.as_mut() else {
            return Ok(());
        };
        armed.executed = armed.executed.saturating_add(u64::from(self.interval.get()));
        if let Some(token) = &armed.limits.cancellation
            && token.is_cancelled()
        {
            return Err(LuaError::Cancelled("execution cancelled".into()));
        }
        if let Some(limit) = armed.limits.instruction_limit
            && armed.executed > limit
        {
            return Err(LuaError::Cancelled(format!("instruction limit of {limit} exceeded")));
        }
        if let Some(deadline) = armed.deadline
            && Instant::now() >= deadline
        {
            let timeout = armed.limits.timeout.unwrap_or_default();
            return Err(LuaError::Cancelled(format!("timeout of {timeout:?} exceeded")));
        }
        Ok(())
    }

    /// The user hook to run for `event`, if any.
    fn user_hook_for(&self, event: c_int) -> Option<Rc<UserHook>> {
        let mut user = self.user.borrow_mut();
        let user = user.as_mut()?;
        let wanted = match event {
            ffi::LUA_HOOKCALL | ffi::LUA_HOOKTAILCALL => user.triggers.on_calls,
            ffi::LUA_HOOKRET => user.triggers.on_returns,
            ffi::LUA_HOOKLINE => user.triggers.every_line,
            ffi::LUA_HOOKCOUNT => match user.triggers.every_nth_instruction {
                Some(every) => {
                    let step = u64::from(self.interval.get());
                    if user.countdown > step {
                        user.countdown -= step;
                        false
                    } else {
                        user.countdown = u64::from(every.max(1));
                        true
                    }
                }
                None => false,
            },
            _ => false,
        };
        wanted.then(|| user.callback.clone())
    }
}

impl fmt::Debug for HookState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookState")
            .field("limits", &self.limits.borrow().as_ref().map(|armed| &armed.limits))
            .field("user", &self.user.borrow().as_ref().map(|user| user.triggers))
            .field("interval", &self.interval.get())
            .finish()
    }
}

unsafe extern "C-unwind" fn hook_proc(l: *mut lua_State, ar: *mut lua_Debug) {
    unsafe {
        native_entry(l, || {
            let Some(state) = LuaState::from_extra(l) else {
                return Ok(0);
            };
            let event = (*ar).event;
            if event == ffi::LUA_HOOKCOUNT {
                state.hooks.check_limits()?;
            }
            let Some(callback) = state.hooks.user_hook_for(event) else {
                return Ok(0);
            };
            let event = match event {
                ffi::LUA_HOOKCALL => HookEvent::Call,
                ffi::LUA_HOOKTAILCALL => HookEvent::TailCall,
                ffi::LUA_HOOKRET => HookEvent::Return,
                ffi::LUA_HOOKLINE => HookEvent::Line((*ar).currentline),
                _ => HookEvent::Count,
            };
            let state = state.rc().ok_or(LuaError::StateClosed)?;
            let _thread = state.enter_thread(l);
            let vm = LuaVM::from_state(state.clone());
            callback(&vm, event)?;
            Ok(0)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!clone.is_cancelled());
    }

    #[test]
    fn test_trigger_mask() {
        let triggers = HookTriggers {
            on_calls: true,
            every_line: true,
            ..Default::default()
        };
        assert_eq!(triggers.mask(), ffi::LUA_MASKCALL | ffi::LUA_MASKLINE);
        assert_eq!(HookTriggers::default().mask(), 0);
    }

    #[test]
    fn test_limits_trip_on_instruction_budget() {
        let hooks = HookState::new();
        *hooks.limits.borrow_mut() = Some(Armed {
            limits: ExecutionLimits::new().with_instruction_limit(2500),
            executed: 0,
            deadline: None,
        });
        hooks.interval.set(1000);
        assert!(hooks.check_limits().is_ok());
        assert!(hooks.check_limits().is_ok());
        let err = hooks.check_limits().unwrap_err();
        assert!(matches!(err, LuaError::Cancelled(_)));

        hooks.rearm();
        assert!(hooks.check_limits().is_ok());
    }
}
