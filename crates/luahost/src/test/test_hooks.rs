// Tests for execution limits and debug hooks
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use crate::*;

#[test]
fn test_cancellation_from_callback() {
    let vm = LuaVM::new().unwrap();
    let token = CancellationToken::new();
    vm.set_limits(
        ExecutionLimits::new()
            .with_cancellation(token.clone())
            .with_check_interval(100),
    )
    .unwrap();

    let ticks = Rc::new(Cell::new(0));
    let tick = {
        let ticks = ticks.clone();
        let token = token.clone();
        vm.create_function(move |_, ()| {
            ticks.set(ticks.get() + 1);
            if ticks.get() == 50 {
                token.cancel();
            }
            Ok(())
        })
        .unwrap()
    };
    vm.set_global("tick", tick).unwrap();

    let before = vm.stack().unwrap().count();
    let err = vm.execute("while true do tick() end").unwrap_err();
    match err {
        LuaError::Cancelled(message) => assert_eq!(message, "execution cancelled"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(ticks.get() >= 50);
    assert_eq!(vm.stack().unwrap().count(), before);

    // The token stays cancelled until reset.
    assert!(token.is_cancelled());
    assert!(matches!(vm.execute("while true do end"), Err(LuaError::Cancelled(_))));
    token.reset();
    assert_eq!(vm.evaluate::<i64>("local s = 0 for i = 1, 1000 do s = s + i end return s").unwrap(), 500500);
}

#[test]
fn test_cancellation_from_another_thread() {
    let vm = LuaVM::new().unwrap();
    let token = CancellationToken::new();
    vm.set_limits(ExecutionLimits::new().with_cancellation(token.clone())).unwrap();

    let remote = token.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        remote.cancel();
    });
    let err = vm.execute("while true do end").unwrap_err();
    handle.join().unwrap();
    assert!(matches!(err, LuaError::Cancelled(_)), "{err}");
}

#[test]
fn test_instruction_limit() {
    let vm = LuaVM::new().unwrap();
    vm.set_limits(
        ExecutionLimits::new()
            .with_instruction_limit(10_000)
            .with_check_interval(100),
    )
    .unwrap();

    let err = vm.execute("while true do end").unwrap_err();
    match err {
        LuaError::Cancelled(message) => {
            assert_eq!(message, "instruction limit of 10000 exceeded")
        }
        other => panic!("unexpected {other:?}"),
    }

    // Every outermost call gets a fresh budget.
    for _ in 0..5 {
        assert_eq!(vm.evaluate::<i64>("local s = 0 for i = 1, 100 do s = s + 1 end return s").unwrap(), 100);
    }

    vm.clear_limits().unwrap();
    vm.execute("for i = 1, 100000 do end").unwrap();
}

#[test]
fn test_timeout() {
    let vm = LuaVM::new().unwrap();
    vm.set_limits(ExecutionLimits::new().with_timeout(Duration::from_millis(50)))
        .unwrap();

    let err = vm.execute("while true do end").unwrap_err();
    match err {
        LuaError::Cancelled(message) => assert!(message.starts_with("timeout of"), "{message}"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(vm.evaluate::<i64>("return 7").unwrap(), 7);
}

#[test]
fn test_limits_apply_inside_host_calls() {
    let vm = LuaVM::new().unwrap();
    vm.set_limits(ExecutionLimits::new().with_instruction_limit(5_000).with_check_interval(50))
        .unwrap();
    let spin: LuaFunctionRef = vm.evaluate("return function() while true do end end").unwrap();
    let err = spin.call::<_, ()>(()).unwrap_err();
    assert!(matches!(err, LuaError::Cancelled(_)), "{err}");
}

// ==================== Coroutines ====================

#[test]
fn test_limits_reach_threads_created_earlier() {
    let vm = LuaVM::new().unwrap();
    let spin = vm.load("while true do end").into_function().unwrap();
    let thread = vm.create_thread(&spin).unwrap();
    vm.execute("co = coroutine.create(function() while true do end end)").unwrap();
    let script_thread: LuaThreadRef = vm.get_global("co").unwrap();

    vm.set_limits(
        ExecutionLimits::new()
            .with_instruction_limit(10_000)
            .with_check_interval(100),
    )
    .unwrap();

    for thread in [&thread, &script_thread] {
        match thread.resume::<_, ()>(()).unwrap_err() {
            LuaError::Cancelled(message) => {
                assert_eq!(message, "instruction limit of 10000 exceeded")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(thread.status().unwrap(), ThreadStatus::Error);
    }
}

#[test]
fn test_cleared_limits_leave_threads() {
    let vm = LuaVM::new().unwrap();
    vm.set_limits(ExecutionLimits::new().with_instruction_limit(1_000).with_check_interval(10))
        .unwrap();
    let count = vm
        .load("local n = 0 for i = 1, 100000 do n = n + 1 end return n")
        .into_function()
        .unwrap();
    // Created while the limits are installed, so it inherits the hook.
    let thread = vm.create_thread(&count).unwrap();

    vm.clear_limits().unwrap();
    assert_eq!(thread.resume::<_, i64>(()).unwrap(), 100000);
}

// ==================== User hooks ====================

#[test]
fn test_line_hook() {
    let vm = LuaVM::new().unwrap();
    let lines = Rc::new(Cell::new(0));
    {
        let lines = lines.clone();
        vm.set_hook(
            HookTriggers {
                every_line: true,
                ..Default::default()
            },
            move |_, event| {
                if let HookEvent::Line(_) = event {
                    lines.set(lines.get() + 1);
                }
                Ok(())
            },
        )
        .unwrap();
    }

    vm.execute("local a = 1\nlocal b = 2\nlocal c = a + b").unwrap();
    assert!(lines.get() >= 3, "saw {} lines", lines.get());

    vm.remove_hook().unwrap();
    let seen = lines.get();
    vm.execute("local a = 1\nlocal b = 2").unwrap();
    assert_eq!(lines.get(), seen);
}

#[test]
fn test_call_hook() {
    let vm = LuaVM::new().unwrap();
    let calls = Rc::new(Cell::new(0));
    {
        let calls = calls.clone();
        vm.set_hook(
            HookTriggers {
                on_calls: true,
                ..Default::default()
            },
            move |_, event| {
                if matches!(event, HookEvent::Call | HookEvent::TailCall) {
                    calls.set(calls.get() + 1);
                }
                Ok(())
            },
        )
        .unwrap();
    }
    vm.execute("local function f() end f() f() f()").unwrap();
    assert!(calls.get() >= 3);
}

#[test]
fn test_hook_error_stops_script() {
    let vm = LuaVM::new().unwrap();
    vm.set_hook(
        HookTriggers {
            every_nth_instruction: Some(10),
            ..Default::default()
        },
        |_, _| Err(LuaError::runtime("stop")),
    )
    .unwrap();

    let err = vm.execute("while true do end").unwrap_err();
    match err {
        LuaError::Runtime { message, .. } => assert_eq!(message, "stop"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_user_hook_with_limits() {
    let vm = LuaVM::new().unwrap();
    let counts = Rc::new(Cell::new(0u32));
    {
        let counts = counts.clone();
        vm.set_hook(
            HookTriggers {
                every_nth_instruction: Some(1000),
                ..Default::default()
            },
            move |_, event| {
                assert_eq!(event, HookEvent::Count);
                counts.set(counts.get() + 1);
                Ok(())
            },
        )
        .unwrap();
    }
    vm.set_limits(ExecutionLimits::new().with_instruction_limit(1_000_000).with_check_interval(100))
        .unwrap();

    vm.execute("for i = 1, 20000 do end").unwrap();
    assert!(counts.get() > 0);
    let err = vm.execute("while true do end").unwrap_err();
    assert!(matches!(err, LuaError::Cancelled(_)), "{err}");
}
