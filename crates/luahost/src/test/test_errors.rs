// Tests for error reporting across the interpreter boundary
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::*;

#[derive(Debug, thiserror::Error)]
#[error("quota exceeded: {0}")]
struct QuotaError(u32);

#[test]
fn test_host_error_identity_through_nested_calls() {
    let vm = LuaVM::new().unwrap();
    let original: Arc<dyn std::error::Error + Send + Sync> = Arc::new(QuotaError(3));

    let raised = original.clone();
    let inner = vm
        .create_function(move |_, ()| -> LuaResult<()> { Err(LuaError::External(raised.clone())) })
        .unwrap();
    vm.set_global("inner", inner).unwrap();

    let outer = vm
        .create_function(|vm, ()| {
            let inner: LuaFunctionRef = vm.get_global("inner")?;
            inner.call::<_, ()>(())
        })
        .unwrap();
    vm.set_global("outer", outer).unwrap();

    let before = vm.stack().unwrap().count();
    let err = vm.execute("local x = 1\nouter()\nreturn x").unwrap_err();
    match &err {
        LuaError::External(arc) => assert!(Arc::ptr_eq(arc, &original)),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(err.downcast_ref::<QuotaError>().map(|e| e.0), Some(3));
    assert_eq!(vm.stack().unwrap().count(), before);
}

#[test]
fn test_script_sees_host_error_message() {
    let vm = LuaVM::new().unwrap();
    let quota = vm
        .create_function(|_, ()| -> LuaResult<()> { Err(LuaError::external(QuotaError(7))) })
        .unwrap();
    vm.set_global("quota", quota).unwrap();

    let message: String = vm
        .evaluate("local ok, e = pcall(quota) return tostring(e)")
        .unwrap();
    assert_eq!(message, "quota exceeded: 7");
}

#[test]
fn test_rethrown_host_error_becomes_script_error() {
    let vm = LuaVM::new().unwrap();
    let quota = vm
        .create_function(|_, ()| -> LuaResult<()> { Err(LuaError::external(QuotaError(1))) })
        .unwrap();
    vm.set_global("quota", quota).unwrap();

    // The script replaces the error with its own value.
    let err = vm
        .execute("local ok, e = pcall(quota) error('wrapped: ' .. tostring(e), 0)")
        .unwrap_err();
    match err {
        LuaError::Runtime { message, .. } => assert_eq!(message, "wrapped: quota exceeded: 1"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_syntax_error() {
    let vm = LuaVM::new().unwrap();
    let err = vm.execute("local = 1").unwrap_err();
    assert!(matches!(err, LuaError::Syntax(_)), "{err}");
    assert_eq!(err.status(), Some(LuaStatus::Syntax));
    assert!(!err.is_fatal());
}

#[test]
fn test_runtime_error_carries_chunk_name() {
    let vm = LuaVM::new().unwrap();
    let err = vm.load("error('boom')").set_name("=my_chunk").exec().unwrap_err();
    match err {
        LuaError::Runtime { message, status } => {
            assert!(message.contains("my_chunk:1: boom"), "{message}");
            assert_eq!(status, LuaStatus::Runtime);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_non_string_error_values() {
    let vm = LuaVM::new().unwrap();
    let err = vm.execute("error({})").unwrap_err();
    assert!(err.to_string().contains("(error object is a table value)"), "{err}");

    let err = vm.execute("error(42)").unwrap_err();
    assert!(err.to_string().contains("42"), "{err}");
}

#[test]
fn test_traceback_option() {
    let vm = LuaVM::with_options(SafeOption::default().with_traceback(true)).unwrap();
    let err = vm
        .execute("local function deep() error('deep') end\ndeep()")
        .unwrap_err();
    assert!(err.to_string().contains("stack traceback"), "{err}");

    let plain = LuaVM::new().unwrap();
    let err = plain.execute("error('flat')").unwrap_err();
    assert!(!err.to_string().contains("stack traceback"), "{err}");
}

#[test]
fn test_error_in_table_access() {
    let vm = LuaVM::new().unwrap();
    let table: LuaTableRef = vm
        .evaluate("return setmetatable({}, { __index = function() error('no field') end })")
        .unwrap();
    let err = table.get::<_, i64>("x").unwrap_err();
    assert!(err.to_string().contains("no field"), "{err}");

    // Raw access skips the metamethod.
    assert_eq!(table.raw_get::<_, Option<i64>>("x").unwrap(), None);
}

#[test]
fn test_error_status_codes() {
    assert_eq!(LuaStatus::from_code(ffi::LUA_ERRRUN), Some(LuaStatus::Runtime));
    assert_eq!(LuaStatus::Memory.code(), ffi::LUA_ERRMEM);
    assert!(LuaStatus::Syntax.is_error());
    assert!(!LuaStatus::Yield.is_error());
    assert_eq!(LuaStatus::from_code(99), None);
}

// ==================== Panics in finalizers ====================

struct Fragile;

impl LuaUserData for Fragile {}

impl Drop for Fragile {
    fn drop(&mut self) {
        panic!("fragile drop");
    }
}

#[test]
fn test_panic_in_gc_metamethod_reaches_host() {
    let vm = LuaVM::new().unwrap();
    let boom = vm
        .create_function(|_, ()| -> LuaResult<()> { panic!("finalizer boom") })
        .unwrap();
    vm.set_global("boom", boom).unwrap();
    vm.gc_stop().unwrap();
    vm.execute("setmetatable({}, { __gc = function() boom() end })").unwrap();

    // The collection runs the finalizer outside any protected call.
    let result = catch_unwind(AssertUnwindSafe(|| vm.collect_garbage()));
    let payload = result.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>().copied(), Some("finalizer boom"));

    vm.gc_restart().unwrap();
    assert_eq!(vm.evaluate::<i64>("return 3").unwrap(), 3);
    vm.collect_garbage().unwrap();
}

#[test]
fn test_panicking_drop_of_host_object_reaches_host() {
    let vm = LuaVM::new().unwrap();
    let fragile = vm.create_userdata(Fragile).unwrap();
    drop(fragile);

    let result = catch_unwind(AssertUnwindSafe(|| vm.collect_garbage()));
    let payload = result.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>().copied(), Some("fragile drop"));
    assert_eq!(vm.evaluate::<i64>("return 4").unwrap(), 4);
}

#[test]
fn test_panicking_drop_inside_script_collection() {
    let vm = LuaVM::new().unwrap();
    let fragile = vm.create_userdata(Fragile).unwrap();
    drop(fragile);

    // Here the finalizer runs under the script's protected call.
    let result = catch_unwind(AssertUnwindSafe(|| vm.execute("collectgarbage()")));
    let payload = result.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>().copied(), Some("fragile drop"));
    assert_eq!(vm.evaluate::<i64>("return 5").unwrap(), 5);
}
