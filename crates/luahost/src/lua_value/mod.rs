// Host-side representation of interpreter values and the marshaling traits.
//
// `LuaValue` is an owned snapshot: primitives are copied out of the stack,
// strings are copied as bytes, and collectable values are held through
// registry references.
mod lua_convert;
mod multi;
pub mod userdata;
mod userdata_builder;

use std::ffi::{c_int, c_void};
use std::fmt;

use crate::ffi;
use crate::lua_vm::{
    LuaError, LuaFunctionRef, LuaReference, LuaResult, LuaTableRef, LuaThreadRef, LuaUserDataRef,
};

pub use lua_convert::{FromLua, IntoLua, LuaMap, LuaSequence};
pub use multi::{FromLuaMulti, IntoLuaMulti, MultiValue, Variadic};
pub use userdata::{LuaMethodProvider, LuaUserData, MetaMethod, UserDataDescriptor};
pub use userdata_builder::UserDataBuilder;

/// Basic interpreter type tag (`lua_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LuaType {
    /// Index past the top of the stack (`LUA_TNONE`).
    None,
    Nil,
    Boolean,
    LightUserData,
    Number,
    String,
    Table,
    Function,
    UserData,
    Thread,
}

impl LuaType {
    pub fn from_code(code: c_int) -> Self {
        match code {
            ffi::LUA_TNIL => LuaType::Nil,
            ffi::LUA_TBOOLEAN => LuaType::Boolean,
            ffi::LUA_TLIGHTUSERDATA => LuaType::LightUserData,
            ffi::LUA_TNUMBER => LuaType::Number,
            ffi::LUA_TSTRING => LuaType::String,
            ffi::LUA_TTABLE => LuaType::Table,
            ffi::LUA_TFUNCTION => LuaType::Function,
            ffi::LUA_TUSERDATA => LuaType::UserData,
            ffi::LUA_TTHREAD => LuaType::Thread,
            _ => LuaType::None,
        }
    }

    /// Name as reported by Lua's `type()`.
    pub fn name(self) -> &'static str {
        match self {
            LuaType::None => "no value",
            LuaType::Nil => "nil",
            LuaType::Boolean => "boolean",
            LuaType::LightUserData | LuaType::UserData => "userdata",
            LuaType::Number => "number",
            LuaType::String => "string",
            LuaType::Table => "table",
            LuaType::Function => "function",
            LuaType::Thread => "thread",
        }
    }
}

impl fmt::Display for LuaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Interpreter string as raw bytes. Embedded zero bytes and non-UTF-8
/// content are preserved.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LuaString(Vec<u8>);

impl LuaString {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        LuaString(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_str(&self) -> LuaResult<&str> {
        Ok(std::str::from_utf8(&self.0)?)
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl fmt::Debug for LuaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for LuaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for LuaString {
    fn from(s: &str) -> Self {
        LuaString(s.as_bytes().to_vec())
    }
}

impl From<String> for LuaString {
    fn from(s: String) -> Self {
        LuaString(s.into_bytes())
    }
}

impl From<&[u8]> for LuaString {
    fn from(bytes: &[u8]) -> Self {
        LuaString(bytes.to_vec())
    }
}

impl From<Vec<u8>> for LuaString {
    fn from(bytes: Vec<u8>) -> Self {
        LuaString(bytes)
    }
}

impl AsRef<[u8]> for LuaString {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl PartialEq<str> for LuaString {
    fn eq(&self, other: &str) -> bool {
        self.0 == other.as_bytes()
    }
}

impl PartialEq<&str> for LuaString {
    fn eq(&self, other: &&str) -> bool {
        self.0 == other.as_bytes()
    }
}

/// Light userdata: a bare pointer the interpreter never dereferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LightUserData(pub *mut c_void);

/// Owned snapshot of any interpreter value.
#[derive(Debug, Clone, Default)]
pub enum LuaValue {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(LuaString),
    LightUserData(LightUserData),
    Table(LuaTableRef),
    Function(LuaFunctionRef),
    UserData(LuaUserDataRef),
    Thread(LuaThreadRef),
}

impl LuaValue {
    pub fn lua_type(&self) -> LuaType {
        match self {
            LuaValue::Nil => LuaType::Nil,
            LuaValue::Boolean(_) => LuaType::Boolean,
            LuaValue::Integer(_) | LuaValue::Number(_) => LuaType::Number,
            LuaValue::String(_) => LuaType::String,
            LuaValue::LightUserData(_) => LuaType::LightUserData,
            LuaValue::Table(_) => LuaType::Table,
            LuaValue::Function(_) => LuaType::Function,
            LuaValue::UserData(_) => LuaType::UserData,
            LuaValue::Thread(_) => LuaType::Thread,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.lua_type().name()
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, LuaValue::Nil)
    }

    /// Lua truthiness: everything but `nil` and `false`.
    #[inline]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, LuaValue::Nil | LuaValue::Boolean(false))
    }

    #[inline]
    pub fn is_integer(&self) -> bool {
        matches!(self, LuaValue::Integer(_))
    }

    #[inline]
    pub fn is_float(&self) -> bool {
        matches!(self, LuaValue::Number(_))
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            LuaValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer value; floats with an exact integer representation convert.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            LuaValue::Integer(i) => Some(*i),
            LuaValue::Number(n) => float_to_integer(*n),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            LuaValue::Integer(i) => Some(*i as f64),
            LuaValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            LuaValue::String(s) => s.to_str().ok(),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&LuaTableRef> {
        match self {
            LuaValue::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&LuaFunctionRef> {
        match self {
            LuaValue::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_userdata(&self) -> Option<&LuaUserDataRef> {
        match self {
            LuaValue::UserData(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_thread(&self) -> Option<&LuaThreadRef> {
        match self {
            LuaValue::Thread(t) => Some(t),
            _ => None,
        }
    }

    /// Identity pointer of collectable values, null otherwise.
    pub fn to_pointer(&self) -> *const c_void {
        let pointer = match self {
            LuaValue::Table(r) => r.to_pointer(),
            LuaValue::Function(r) => r.to_pointer(),
            LuaValue::UserData(r) => r.to_pointer(),
            LuaValue::Thread(r) => r.to_pointer(),
            LuaValue::LightUserData(p) => return p.0,
            _ => return std::ptr::null(),
        };
        pointer.unwrap_or(std::ptr::null())
    }

    /// Release the registry slot held by a collectable value now.
    pub fn dispose(&mut self) {
        match self {
            LuaValue::Table(r) => r.dispose(),
            LuaValue::Function(r) => r.dispose(),
            LuaValue::UserData(r) => r.dispose(),
            LuaValue::Thread(r) => r.dispose(),
            _ => {}
        }
    }
}

/// Raw equality: numbers compare by value, strings by bytes, collectable
/// values by identity.
impl PartialEq for LuaValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LuaValue::Nil, LuaValue::Nil) => true,
            (LuaValue::Boolean(a), LuaValue::Boolean(b)) => a == b,
            (LuaValue::Integer(a), LuaValue::Integer(b)) => a == b,
            (LuaValue::Number(a), LuaValue::Number(b)) => a == b,
            (LuaValue::Integer(i), LuaValue::Number(n)) | (LuaValue::Number(n), LuaValue::Integer(i)) => {
                float_to_integer(*n) == Some(*i)
            }
            (LuaValue::String(a), LuaValue::String(b)) => a == b,
            (LuaValue::LightUserData(a), LuaValue::LightUserData(b)) => a == b,
            (LuaValue::Table(a), LuaValue::Table(b)) => a == b,
            (LuaValue::Function(a), LuaValue::Function(b)) => a == b,
            (LuaValue::UserData(a), LuaValue::UserData(b)) => a == b,
            (LuaValue::Thread(a), LuaValue::Thread(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for LuaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaValue::Nil => f.write_str("nil"),
            LuaValue::Boolean(b) => write!(f, "{b}"),
            LuaValue::Integer(i) => f.write_str(itoa::Buffer::new().format(*i)),
            LuaValue::Number(n) => write!(f, "{n}"),
            LuaValue::String(s) => write!(f, "{s}"),
            other => write!(f, "{}: {:p}", other.type_name(), other.to_pointer()),
        }
    }
}

impl From<bool> for LuaValue {
    fn from(b: bool) -> Self {
        LuaValue::Boolean(b)
    }
}

impl From<i64> for LuaValue {
    fn from(i: i64) -> Self {
        LuaValue::Integer(i)
    }
}

impl From<f64> for LuaValue {
    fn from(n: f64) -> Self {
        LuaValue::Number(n)
    }
}

impl From<&str> for LuaValue {
    fn from(s: &str) -> Self {
        LuaValue::String(s.into())
    }
}

impl From<String> for LuaValue {
    fn from(s: String) -> Self {
        LuaValue::String(s.into())
    }
}

impl From<LuaTableRef> for LuaValue {
    fn from(t: LuaTableRef) -> Self {
        LuaValue::Table(t)
    }
}

impl From<LuaFunctionRef> for LuaValue {
    fn from(f: LuaFunctionRef) -> Self {
        LuaValue::Function(f)
    }
}

/// `n` as an integer when the conversion is exact (Lua's float-to-integer
/// rule).
pub(crate) fn float_to_integer(n: f64) -> Option<i64> {
    if n.fract() != 0.0 || !n.is_finite() {
        return None;
    }
    // 2^63 is exactly representable; anything at or above it overflows.
    if n >= -(i64::MIN as f64) || n < i64::MIN as f64 {
        return None;
    }
    Some(n as i64)
}

/// Error for a stack value of the wrong type.
pub(crate) fn mismatch(expected: &str, found: LuaType) -> LuaError {
    LuaError::type_mismatch(expected, found.name())
}

#[cfg(test)]
mod value_tests {
    use super::*;

    #[test]
    fn test_integer_float_distinction() {
        let int_val = LuaValue::Integer(42);
        let float_val = LuaValue::Number(42.0);

        assert!(int_val.is_integer());
        assert!(!int_val.is_float());
        assert!(!float_val.is_integer());
        assert!(float_val.is_float());
        assert_eq!(int_val, float_val);
        assert_eq!(int_val.type_name(), "number");
    }

    #[test]
    fn test_float_to_integer_is_exact() {
        assert_eq!(LuaValue::Number(42.5).as_integer(), None);
        assert_eq!(LuaValue::Number(42.0).as_integer(), Some(42));
        assert_eq!(float_to_integer(9.3e18), None);
        assert_eq!(float_to_integer(f64::NAN), None);
        assert_eq!(float_to_integer(-9.223372036854775808e18), Some(i64::MIN));
    }

    #[test]
    fn test_lua_string_keeps_bytes() {
        let s = LuaString::from(&b"a\0b\xff"[..]);
        assert_eq!(s.len(), 4);
        assert!(s.to_str().is_err());
        assert_eq!(LuaString::from("héllo"), "héllo");
        assert!(!LuaValue::Boolean(false).is_truthy());
        assert!(LuaValue::Integer(0).is_truthy());
    }
}
