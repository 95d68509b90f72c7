// Tests for registry references: lifetime, ownership and table access
use crate::*;

#[test]
fn test_dispose_is_idempotent() {
    let vm = LuaVM::new().unwrap();
    let mut table = vm.create_table().unwrap();
    let slot = table.slot().unwrap();
    assert!(slot > ffi::LUA_RIDX_GLOBALS as std::ffi::c_int);

    table.dispose();
    assert!(table.is_disposed());
    assert!(matches!(table.slot(), Err(LuaError::ObjectDisposed(_))));
    assert!(matches!(table.get::<_, Option<i64>>(1), Err(LuaError::ObjectDisposed(_))));
    assert_eq!(table.owner(), None);

    table.dispose();
    assert!(table.is_disposed());

    // The freed slot is handed out again.
    let next = vm.create_table().unwrap();
    assert_eq!(next.slot().unwrap(), slot);
}

#[test]
fn test_dropped_reference_is_released() {
    let vm = LuaVM::new().unwrap();
    let weak = {
        let table = vm.create_table().unwrap();
        table.set("k", "v").unwrap();
        table.downgrade().unwrap()
    };
    vm.collect_garbage().unwrap();
    assert!(weak.upgrade().unwrap().is_none());
}

#[test]
fn test_weak_reference_lifecycle() {
    let vm = LuaVM::new().unwrap();
    let mut table = vm.create_table().unwrap();
    table.set(1, "one").unwrap();
    let slot = table.slot().unwrap();
    let weak = table.downgrade().unwrap();
    assert_eq!(weak.owner(), vm.id());

    let strong = weak.upgrade().unwrap().expect("value is alive");
    assert_eq!(strong.get::<_, String>(1).unwrap(), "one");
    assert_eq!(strong, table);
    drop(strong);

    table.dispose();
    vm.collect_garbage().unwrap();
    assert!(weak.upgrade().unwrap().is_none());

    // The slot no longer holds the table.
    let stack = vm.stack().unwrap();
    let _guard = stack.snapshot_count();
    stack.push_registry_slot(slot).unwrap();
    assert_ne!(stack.top().unwrap().lua_type(), LuaType::Table);
}

#[test]
fn test_weak_reference_outlives_state() {
    let vm = LuaVM::new().unwrap();
    let table = vm.create_table().unwrap();
    let weak = table.downgrade().unwrap();
    drop(table);
    vm.close().unwrap();
    assert!(weak.upgrade().is_err());
}

// ==================== Ownership ====================

#[test]
fn test_foreign_reference_is_rejected() {
    let vm1 = LuaVM::new().unwrap();
    let vm2 = LuaVM::new().unwrap();
    let table = vm1.create_table().unwrap();

    let err = vm2.set_global("t", &table).unwrap_err();
    assert!(matches!(err, LuaError::InvalidOperation(_)), "{err}");
    assert_eq!(vm2.get_global::<Option<LuaTableRef>>("t").unwrap(), None);

    let other = vm2.create_table().unwrap();
    assert!(matches!(other.set(1, &table), Err(LuaError::InvalidOperation(_))));
    assert!(!other.contains_key(1).unwrap());
}

#[test]
fn test_foreign_stack_value_is_rejected() {
    let vm1 = LuaVM::new().unwrap();
    let vm2 = LuaVM::new().unwrap();
    let stack1 = vm1.stack().unwrap();
    let stack2 = vm2.stack().unwrap();
    let _guard1 = stack1.snapshot_count();
    let count2 = stack2.count();

    stack1.push("mine").unwrap();
    let value = stack1.top().unwrap();
    assert_eq!(value.owner(), vm1.id());

    let err = stack2.push(value).unwrap_err();
    assert!(matches!(err, LuaError::InvalidOperation(_)), "{err}");
    assert_eq!(stack2.count(), count2);
}

// ==================== Clone & equality ====================

#[test]
fn test_clone_registers_new_slot() {
    let vm = LuaVM::new().unwrap();
    let table = vm.create_table().unwrap();
    let copy = table.try_clone().unwrap();
    assert_ne!(copy.slot().unwrap(), table.slot().unwrap());
    assert_eq!(copy, table);
    assert_eq!(copy.to_pointer().unwrap(), table.to_pointer().unwrap());

    let other = vm.create_table().unwrap();
    assert_ne!(other, table);

    let globals1 = vm.globals().unwrap();
    let globals2 = globals1.clone();
    assert_eq!(globals1.slot().unwrap(), globals2.slot().unwrap());
}

#[test]
fn test_fallible_equality_reports_closed_state() {
    let vm = LuaVM::new().unwrap();
    let table = vm.create_table().unwrap();
    let copy = table.try_clone().unwrap();
    let other = vm.create_table().unwrap();
    assert!(copy.try_raw_equals(&table).unwrap());
    assert!(!other.try_raw_equals(&table).unwrap());

    vm.close().unwrap();
    assert!(matches!(copy.try_raw_equals(&table), Err(LuaError::StateClosed)));
    assert_ne!(copy, table);
}

// ==================== Tables ====================

#[test]
fn test_table_access() {
    let vm = LuaVM::new().unwrap();
    let table = vm.create_table().unwrap();
    assert!(table.is_empty().unwrap());

    table.set("name", "lua").unwrap();
    table.push(10).unwrap();
    table.push(20).unwrap();
    assert_eq!(table.get::<_, String>("name").unwrap(), "lua");
    assert_eq!(table.raw_len().unwrap(), 2);
    assert_eq!(table.len().unwrap(), 2);
    assert_eq!(table.sequence_values::<i64>().unwrap(), vec![10, 20]);
    assert!(table.contains_key("name").unwrap());
    assert!(!table.contains_key("other").unwrap());

    let mut pairs: Vec<(LuaValue, LuaValue)> = table.pairs().unwrap();
    assert_eq!(pairs.len(), 3);
    pairs.retain(|(k, _)| k.as_str() == Some("name"));
    assert_eq!(pairs[0].1.as_str(), Some("lua"));

    assert!(table.raw_set(LuaValue::Nil, 1).is_err());
}

#[test]
fn test_table_metatable() {
    let vm = LuaVM::new().unwrap();
    let table = vm.create_table().unwrap();
    let meta: LuaTableRef = vm
        .evaluate("return { __index = function(_, k) return k .. '!' end, __len = function() return 99 end }")
        .unwrap();
    assert!(table.metatable().unwrap().is_none());

    table.set_metatable(Some(&meta)).unwrap();
    assert_eq!(table.metatable().unwrap().unwrap(), meta);
    assert_eq!(table.get::<_, String>("hey").unwrap(), "hey!");
    assert_eq!(table.raw_get::<_, Option<String>>("hey").unwrap(), None);
    assert_eq!(table.len().unwrap(), 99);
    assert_eq!(table.raw_len().unwrap(), 0);

    table.set_metatable(None).unwrap();
    assert!(table.metatable().unwrap().is_none());
}

#[test]
fn test_table_from_iterators() {
    let vm = LuaVM::new().unwrap();
    let seq = vm.create_sequence_from([1, 2, 3]).unwrap();
    assert_eq!(seq.raw_len().unwrap(), 3);

    let map = vm.create_table_from([("a", 1), ("b", 2)]).unwrap();
    assert_eq!(map.get::<_, i64>("b").unwrap(), 2);

    vm.set_global("map", &map).unwrap();
    let sum: i64 = vm.evaluate("return map.a + map.b").unwrap();
    assert_eq!(sum, 3);
}
