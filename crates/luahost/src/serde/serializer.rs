/// Lua values to `serde_json::Value`.
///
/// - nil -> null, booleans and numbers as is, strings (lossy UTF-8)
/// - a table whose keys are exactly `1..=n` -> array; the empty table too
/// - any other table -> object; string, number and boolean keys become
///   strings, other keys are skipped
/// - functions, userdata and threads are rejected
use std::collections::HashSet;
use std::ffi::c_void;

use serde_json::{Map, Number, Value as JsonValue};

use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaReference, LuaResult, LuaTableRef};

pub fn to_value(value: &LuaValue) -> LuaResult<JsonValue> {
    let mut visited = HashSet::new();
    to_value_internal(value, &mut visited)
}

pub fn to_string(value: &LuaValue, pretty: bool) -> LuaResult<String> {
    let json = to_value(value)?;
    let text = if pretty {
        serde_json::to_string_pretty(&json)
    } else {
        serde_json::to_string(&json)
    };
    text.map_err(|e| LuaError::Marshal(format!("failed to serialize to JSON: {e}")))
}

fn to_value_internal(value: &LuaValue, visited: &mut HashSet<*const c_void>) -> LuaResult<JsonValue> {
    match value {
        LuaValue::Nil => Ok(JsonValue::Null),
        LuaValue::Boolean(b) => Ok(JsonValue::Bool(*b)),
        LuaValue::Integer(i) => Ok(JsonValue::Number(Number::from(*i))),
        LuaValue::Number(n) => Number::from_f64(*n)
            .map(JsonValue::Number)
            .ok_or_else(|| LuaError::Marshal(format!("cannot represent {n} in JSON"))),
        LuaValue::String(s) => Ok(JsonValue::String(s.to_string_lossy())),
        LuaValue::Table(table) => {
            let pointer = table.to_pointer()?;
            if !visited.insert(pointer) {
                return Err(LuaError::Marshal("circular reference detected in table".into()));
            }
            let result = table_to_json(table, visited);
            visited.remove(&pointer);
            result
        }
        other => Err(LuaError::Marshal(format!(
            "cannot serialize a {} to JSON",
            other.type_name()
        ))),
    }
}

fn table_to_json(table: &LuaTableRef, visited: &mut HashSet<*const c_void>) -> LuaResult<JsonValue> {
    let pairs: Vec<(LuaValue, LuaValue)> = table.pairs()?;
    let len = table.raw_len()?;
    let is_array = pairs.len() == len
        && pairs
            .iter()
            .all(|(key, _)| matches!(key, LuaValue::Integer(i) if *i >= 1 && (*i as usize) <= len));

    if is_array {
        let mut array = vec![JsonValue::Null; len];
        for (key, value) in &pairs {
            if let LuaValue::Integer(i) = key {
                array[*i as usize - 1] = to_value_internal(value, visited)?;
            }
        }
        return Ok(JsonValue::Array(array));
    }

    let mut object = Map::new();
    for (key, value) in &pairs {
        let key = match key {
            LuaValue::String(s) => s.to_string_lossy(),
            LuaValue::Integer(i) => i.to_string(),
            LuaValue::Number(n) => n.to_string(),
            LuaValue::Boolean(b) => b.to_string(),
            _ => continue,
        };
        object.insert(key, to_value_internal(value, visited)?);
    }
    Ok(JsonValue::Object(object))
}
