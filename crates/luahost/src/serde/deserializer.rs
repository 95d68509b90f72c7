/// `serde_json::Value` to Lua values.
///
/// - null -> nil (a hole inside arrays)
/// - integers that fit `i64` -> integer, larger unsigned values wrap,
///   everything else -> float
/// - arrays -> sequences starting at 1, objects -> string-keyed tables
use serde_json::Value as JsonValue;

use crate::lua_value::{IntoLua, LuaValue};
use crate::lua_vm::{LuaError, LuaResult, LuaStack, LuaVM};

pub fn from_value(json: &JsonValue, vm: &LuaVM) -> LuaResult<LuaValue> {
    let stack = vm.stack()?;
    let _guard = stack.snapshot_count();
    push_json(&stack, json)?;
    stack.pop_value()
}

pub fn from_str(text: &str, vm: &LuaVM) -> LuaResult<LuaValue> {
    let json: JsonValue = serde_json::from_str(text)
        .map_err(|e| LuaError::Marshal(format!("failed to parse JSON: {e}")))?;
    from_value(&json, vm)
}

pub(crate) fn push_json(stack: &LuaStack<'_>, json: &JsonValue) -> LuaResult<()> {
    match json {
        JsonValue::Null => stack.push_nil(),
        JsonValue::Bool(b) => stack.push_boolean(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                stack.push_integer(i)
            } else if let Some(u) = n.as_u64() {
                stack.push_integer(u as i64)
            } else {
                stack.push_number(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        JsonValue::String(s) => stack.push_bytes(s.as_bytes()),
        JsonValue::Array(items) => {
            stack.new_table(items.len(), 0)?;
            let table = stack.count();
            for (i, item) in items.iter().enumerate() {
                push_json(stack, item)?;
                stack.raw_seti_top(table, i as i64 + 1)?;
            }
            Ok(())
        }
        JsonValue::Object(entries) => {
            stack.new_table(0, entries.len())?;
            let table = stack.count();
            for (key, value) in entries {
                stack.push_bytes(key.as_bytes())?;
                push_json(stack, value)?;
                stack.raw_set_top(table)?;
            }
            Ok(())
        }
    }
}

impl IntoLua for &JsonValue {
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        push_json(stack, self)
    }
}

impl IntoLua for JsonValue {
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        push_json(stack, &self)
    }
}
