// Tests for coroutines driven from the host
use crate::*;

#[test]
fn test_resume_and_yield() {
    let vm = LuaVM::new().unwrap();
    let body: LuaFunctionRef = vm
        .evaluate(
            r#"
            return function(a)
                local b = coroutine.yield(a + 1)
                local c = coroutine.yield(b * 2)
                return a + b + c
            end
        "#,
        )
        .unwrap();
    let co = vm.create_thread(&body).unwrap();
    assert_eq!(co.status().unwrap(), ThreadStatus::Resumable);
    assert!(!co.is_main());

    assert_eq!(co.resume::<_, i64>(1).unwrap(), 2);
    assert_eq!(co.status().unwrap(), ThreadStatus::Resumable);
    assert_eq!(co.resume::<_, i64>(10).unwrap(), 20);
    assert_eq!(co.resume::<_, i64>(100).unwrap(), 111);
    assert_eq!(co.status().unwrap(), ThreadStatus::Finished);

    let err = co.resume::<_, ()>(()).unwrap_err();
    assert!(matches!(err, LuaError::InvalidOperation(_)), "{err}");
}

#[test]
fn test_yield_multiple_values() {
    let vm = LuaVM::new().unwrap();
    let body: LuaFunctionRef = vm
        .evaluate("return function() coroutine.yield(1, 'two', true) end")
        .unwrap();
    let co = vm.create_thread(&body).unwrap();
    let (a, b, c): (i64, String, bool) = co.resume(()).unwrap();
    assert_eq!((a, b.as_str(), c), (1, "two", true));
}

#[test]
fn test_error_inside_coroutine() {
    let vm = LuaVM::new().unwrap();
    let body: LuaFunctionRef = vm.evaluate("return function() error('inside', 0) end").unwrap();
    let co = vm.create_thread(&body).unwrap();

    let err = co.resume::<_, ()>(()).unwrap_err();
    match err {
        LuaError::Runtime { message, .. } => assert_eq!(message, "inside"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(co.status().unwrap(), ThreadStatus::Error);
}

#[test]
fn test_host_error_inside_coroutine() {
    let vm = LuaVM::new().unwrap();
    let fail = vm
        .create_function(|_, ()| -> LuaResult<()> { Err(LuaError::Argument("nope".into())) })
        .unwrap();
    let co = vm.create_thread(&fail).unwrap();
    let err = co.resume::<_, ()>(()).unwrap_err();
    assert!(matches!(err, LuaError::Argument(_)), "{err}");
}

#[test]
fn test_callback_runs_on_coroutine_stack() {
    let vm = LuaVM::new().unwrap();
    let where_am_i = vm
        .create_function(|vm, ()| {
            let main = vm.main_thread()?;
            let stack = vm.stack()?;
            Ok((stack.count(), main.status()? == ThreadStatus::Running))
        })
        .unwrap();
    vm.set_global("where_am_i", where_am_i).unwrap();

    let (_, on_main): (i64, bool) = vm.evaluate("return where_am_i()").unwrap();
    assert!(on_main);

    let (_, on_main): (i64, bool) = vm
        .evaluate("return coroutine.wrap(function() return where_am_i() end)()")
        .unwrap();
    assert!(!on_main);
}

#[test]
fn test_main_thread() {
    let vm = LuaVM::new().unwrap();
    let main = vm.main_thread().unwrap();
    assert!(main.is_main());
    assert_eq!(main.slot().unwrap(), ffi::LUA_RIDX_MAINTHREAD as std::ffi::c_int);
    assert_eq!(main, vm.main_thread().unwrap());

    let from_script: LuaThreadRef = vm.evaluate("return coroutine.running()").unwrap();
    assert!(from_script.is_main());
}

#[test]
fn test_thread_from_foreign_function() {
    let vm1 = LuaVM::new().unwrap();
    let vm2 = LuaVM::new().unwrap();
    let f: LuaFunctionRef = vm1.evaluate("return function() end").unwrap();
    assert!(matches!(vm2.create_thread(&f), Err(LuaError::InvalidOperation(_))));
}

#[test]
fn test_resume_script_coroutine() {
    let vm = LuaVM::new().unwrap();
    let co: LuaThreadRef = vm
        .evaluate("return coroutine.create(function(x) for i = 1, 3 do x = x + coroutine.yield(x) end return x end)")
        .unwrap();
    let mut total = co.resume::<_, i64>(0).unwrap();
    while co.status().unwrap() == ThreadStatus::Resumable {
        total = co.resume::<_, i64>(1).unwrap();
    }
    assert_eq!(total, 3);
}
