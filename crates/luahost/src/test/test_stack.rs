// Tests for the stack view
use crate::*;

#[test]
fn test_push_and_read() {
    let vm = LuaVM::new().unwrap();
    let stack = vm.stack().unwrap();
    let base = stack.count();

    stack.push(1).unwrap();
    stack.push("two").unwrap();
    stack.push(3.5).unwrap();
    assert_eq!(stack.count(), base + 3);

    assert_eq!(stack.read::<f64>(-1).unwrap(), 3.5);
    assert_eq!(stack.read::<String>(-2).unwrap(), "two");
    assert_eq!(stack.read::<i64>(base + 1).unwrap(), 1);
    assert_eq!(stack.top().unwrap().lua_type(), LuaType::Number);
    assert_eq!(stack.get(-2).unwrap().type_name(), "string");

    stack.pop(3).unwrap();
    assert_eq!(stack.count(), base);
}

#[test]
fn test_snapshot_restores_count_on_error() {
    let vm = LuaVM::new().unwrap();
    let stack = vm.stack().unwrap();
    let base = stack.count();

    let result: LuaResult<i64> = (|| {
        let _guard = stack.snapshot_count();
        stack.push("x")?;
        stack.push(true)?;
        stack.read::<i64>(-2)
    })();

    assert!(matches!(result, Err(LuaError::Marshal(_))));
    assert_eq!(stack.count(), base);
}

#[test]
fn test_snapshot_pads_with_nil() {
    let vm = LuaVM::new().unwrap();
    let stack = vm.stack().unwrap();
    stack.push(1).unwrap();
    stack.push(2).unwrap();
    let count = stack.count();
    {
        let _guard = stack.snapshot_count();
        stack.pop(2).unwrap();
    }
    assert_eq!(stack.count(), count);
    assert!(stack.top().unwrap().is_nil());
}

#[test]
fn test_index_out_of_range() {
    let vm = LuaVM::new().unwrap();
    let stack = vm.stack().unwrap();
    let count = stack.count();

    assert!(matches!(stack.get(0), Err(LuaError::IndexOutOfRange { index: 0, .. })));
    assert!(matches!(
        stack.get(count + 1),
        Err(LuaError::IndexOutOfRange { .. })
    ));
    assert!(matches!(
        stack.get(-(count + 1)),
        Err(LuaError::IndexOutOfRange { .. })
    ));
    assert!(stack.pop(count + 1).is_err());
    assert_eq!(stack.count(), count);
}

#[test]
fn test_set_count() {
    let vm = LuaVM::new().unwrap();
    let stack = vm.stack().unwrap();
    let base = stack.count();

    stack.set_count(base + 3).unwrap();
    assert_eq!(stack.count(), base + 3);
    assert!(stack.get(-1).unwrap().is_nil());

    stack.set_count(base).unwrap();
    assert_eq!(stack.count(), base);
    assert!(matches!(stack.set_count(-1), Err(LuaError::Argument(_))));
}

#[test]
fn test_rotate_and_remove_range() {
    let vm = LuaVM::new().unwrap();
    let stack = vm.stack().unwrap();
    let _guard = stack.snapshot_count();
    let base = stack.count();
    for i in 1..=5 {
        stack.push(i).unwrap();
    }

    // 1 2 3 4 5 -> 5 1 2 3 4
    stack.rotate(base + 1, 1).unwrap();
    let values: Vec<i64> = stack
        .top_range(5)
        .unwrap()
        .iter()
        .map(|v| v.get::<i64>().unwrap())
        .collect();
    assert_eq!(values, vec![5, 1, 2, 3, 4]);

    // drop "1 2"
    stack.remove_range(base + 2, 2).unwrap();
    let values: Vec<i64> = stack.top_range(3).unwrap().read::<Variadic<i64>>().unwrap().into_vec();
    assert_eq!(values, vec![5, 3, 4]);

    assert!(matches!(stack.rotate(base + 1, 10), Err(LuaError::Argument(_))));
}

#[test]
fn test_get_range() {
    let vm = LuaVM::new().unwrap();
    let stack = vm.stack().unwrap();
    let _guard = stack.snapshot_count();
    let base = stack.count();
    stack.push_multi((1, "a", false)).unwrap();

    let range = stack.get_range(base + 1, 3).unwrap();
    assert_eq!(range.len(), 3);
    assert_eq!(range.start(), base + 1);
    let (n, s, b): (i64, String, bool) = range.read().unwrap();
    assert_eq!((n, s.as_str(), b), (1, "a", false));
    assert_eq!(range.skip(2).len(), 1);
    assert!(range.get(3).is_none());

    assert!(stack.get_range(base + 2, 3).is_err());
    assert!(stack.get_range(base + 1, 0).unwrap().is_empty());
}

#[test]
fn test_stack_ceiling() {
    let options = SafeOption {
        max_stack_size: 64,
        ..SafeOption::bare()
    };
    let vm = LuaVM::with_options(options).unwrap();
    let stack = vm.stack().unwrap();
    let count = stack.count();

    stack.ensure_free_capacity(10).unwrap();
    let err = stack.ensure_free_capacity(100).unwrap_err();
    assert!(matches!(err, LuaError::InvalidOperation(_)));
    assert_eq!(stack.count(), count);
}

#[test]
fn test_raw_equality_of_views() {
    let vm = LuaVM::new().unwrap();
    let table = vm.create_table().unwrap();
    let stack = vm.stack().unwrap();
    let _guard = stack.snapshot_count();

    stack.push(&table).unwrap();
    stack.push(&table).unwrap();
    stack.push(vm.create_table().unwrap()).unwrap();

    let a = stack.get(-3).unwrap();
    let b = stack.get(-2).unwrap();
    let c = stack.get(-1).unwrap();
    assert!(a.raw_equals(&b));
    assert!(!a.raw_equals(&c));
    assert_eq!(a.to_pointer(), table.to_pointer().unwrap());
}
