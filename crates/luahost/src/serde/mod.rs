/// JSON interchange for Lua values (feature `serde`).
///
/// `serde_json::Value` implements [`IntoLua`](crate::IntoLua) and
/// [`FromLua`](crate::FromLua), so it can be passed to and returned from
/// functions directly; the helpers below cover whole documents.
mod deserializer;
mod serializer;

pub use deserializer::{from_str as deserialize_from_json_str, from_value as deserialize_from_json};
pub use serializer::{to_string as serialize_to_json_string, to_value as serialize_to_json};

use crate::lua_value::{FromLua, LuaValue};
use crate::lua_vm::{LuaResult, LuaVM, StackValue};

/// Convert a Lua value to a `serde_json::Value`.
pub fn lua_to_json(value: &LuaValue) -> LuaResult<serde_json::Value> {
    serialize_to_json(value)
}

/// Convert a Lua value to a JSON string.
pub fn lua_to_json_string(value: &LuaValue, pretty: bool) -> LuaResult<String> {
    serialize_to_json_string(value, pretty)
}

/// Convert a `serde_json::Value` to a Lua value owned by `vm`.
pub fn json_to_lua(json: &serde_json::Value, vm: &LuaVM) -> LuaResult<LuaValue> {
    deserialize_from_json(json, vm)
}

/// Parse a JSON string into a Lua value owned by `vm`.
pub fn json_string_to_lua(text: &str, vm: &LuaVM) -> LuaResult<LuaValue> {
    deserialize_from_json_str(text, vm)
}

impl FromLua for serde_json::Value {
    fn from_lua(value: StackValue<'_>) -> LuaResult<Self> {
        serialize_to_json(&LuaValue::from_lua(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_round_trip_through_lua() {
        let vm = LuaVM::new().unwrap();
        let doc = json!({"name": "lua", "tags": [1, 2.5, true], "nested": {"ok": null}});
        let value = json_to_lua(&doc, &vm).unwrap();
        let table = value.as_table().unwrap();
        assert_eq!(table.get::<_, String>("name").unwrap(), "lua");

        let back = lua_to_json(&value).unwrap();
        assert_eq!(back["tags"], json!([1, 2.5, true]));
        // `null` members vanish: the table stores nothing for them.
        assert_eq!(back["nested"], json!([]));
    }

    #[test]
    fn test_json_from_script() {
        let vm = LuaVM::new().unwrap();
        let json: serde_json::Value = vm
            .evaluate("return { list = {10, 20}, flag = false, [3] = 'x' }")
            .unwrap();
        assert_eq!(json["list"], json!([10, 20]));
        assert_eq!(json["flag"], json!(false));
        assert_eq!(json["3"], json!("x"));
    }

    #[test]
    fn test_cycles_and_functions_are_rejected() {
        let vm = LuaVM::new().unwrap();
        let cyclic: LuaValue = vm.evaluate("local t = {} t.self = t return t").unwrap();
        assert!(lua_to_json(&cyclic).is_err());
        let function: LuaValue = vm.evaluate("return print").unwrap();
        assert!(lua_to_json(&function).is_err());
    }
}
