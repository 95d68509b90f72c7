//! `FromLua` / `IntoLua`: conversion between Rust types and stack values.
//!
//! These traits let function arguments and return values be written with
//! native Rust types instead of manual pushes and reads.
//!
//! # Built-in impls
//! - `bool`, `i8`..`i128`, `u8`..`u128`, `isize`, `usize`, `f32`, `f64`,
//!   `NonZero*`, `Wrapping<T>`
//! - `String`, `&str`, `char`, `Cow<str>`, [`LuaString`]
//! - `Option<T>`: `None` is `nil`
//! - [`LuaValue`], the reference types and [`StackValue`]
//! - `Vec<T>`, `[T; N]`, `&[T]`, `VecDeque<T>`, `HashMap<K, V>`,
//!   `BTreeMap<K, V>`, plus [`LuaSequence`] / [`LuaMap`] for any iterator
//! - `Rc<RefCell<T>>` for described userdata types
//!
//! # User extensibility
//! ```ignore
//! impl FromLua for Vec3 {
//!     fn from_lua(value: StackValue<'_>) -> LuaResult<Self> {
//!         let t = LuaTableRef::from_lua(value)?;
//!         Ok(Vec3 { x: t.get("x")?, y: t.get("y")?, z: t.get("z")? })
//!     }
//! }
//! ```

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ffi::{c_int, c_void};
use std::hash::{BuildHasher, Hash};
use std::num::{
    NonZeroI8, NonZeroI16, NonZeroI32, NonZeroI64, NonZeroIsize, NonZeroU8, NonZeroU16,
    NonZeroU32, NonZeroU64, NonZeroUsize, Wrapping,
};
use std::rc::Rc;

use crate::ffi;
use crate::lua_value::userdata::{self, LuaUserData};
use crate::lua_value::{LightUserData, LuaString, LuaType, LuaValue, mismatch};
use crate::lua_vm::lua_ref::{LuaReference, RefAccess, RefCore};
use crate::lua_vm::{
    LuaError, LuaFunctionRef, LuaResult, LuaStack, LuaTableRef, LuaThreadRef, LuaUserDataRef,
    StackValue,
};

/// Push a Rust value onto the stack as exactly one interpreter value.
pub trait IntoLua {
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()>;
}

/// Read a Rust value from one stack slot.
pub trait FromLua: Sized {
    fn from_lua(value: StackValue<'_>) -> LuaResult<Self>;

    /// Result for a missing value (past the end of an argument list).
    fn from_none() -> LuaResult<Self> {
        Err(LuaError::Marshal("no value present".into()))
    }
}

// ==================== LuaValue ====================

impl IntoLua for LuaValue {
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        match self {
            LuaValue::Nil => stack.push_nil(),
            LuaValue::Boolean(b) => stack.push_boolean(b),
            LuaValue::Integer(i) => stack.push_integer(i),
            LuaValue::Number(n) => stack.push_number(n),
            LuaValue::String(s) => stack.push_bytes(s.as_bytes()),
            LuaValue::LightUserData(p) => stack.push_light_userdata(p.0),
            LuaValue::Table(r) => r.into_lua(stack),
            LuaValue::Function(r) => r.into_lua(stack),
            LuaValue::UserData(r) => r.into_lua(stack),
            LuaValue::Thread(r) => r.into_lua(stack),
        }
    }
}

impl IntoLua for &LuaValue {
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        self.clone().into_lua(stack)
    }
}

impl FromLua for LuaValue {
    fn from_lua(value: StackValue<'_>) -> LuaResult<Self> {
        let l = value.raw();
        let index = value.index();
        Ok(match value.lua_type() {
            LuaType::None | LuaType::Nil => LuaValue::Nil,
            LuaType::Boolean => LuaValue::Boolean(value.is_truthy()),
            LuaType::Number => unsafe {
                if ffi::lua_isinteger(l, index) != 0 {
                    LuaValue::Integer(ffi::lua_tointeger(l, index))
                } else {
                    LuaValue::Number(ffi::lua_tonumber(l, index))
                }
            },
            LuaType::String => LuaValue::String(LuaString::from_lua(value)?),
            LuaType::LightUserData => LuaValue::LightUserData(LightUserData::from_lua(value)?),
            LuaType::Table => LuaValue::Table(LuaTableRef::from_lua(value)?),
            LuaType::Function => LuaValue::Function(LuaFunctionRef::from_lua(value)?),
            LuaType::UserData => LuaValue::UserData(LuaUserDataRef::from_lua(value)?),
            LuaType::Thread => LuaValue::Thread(LuaThreadRef::from_lua(value)?),
        })
    }

    fn from_none() -> LuaResult<Self> {
        Ok(LuaValue::Nil)
    }
}

// ==================== Stack values ====================

impl IntoLua for StackValue<'_> {
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        if self.owner() != stack.owner() {
            return Err(LuaError::foreign_owner("stack value"));
        }
        if self.raw() == stack.raw() {
            return stack.push_copy(self.index());
        }
        // Same state, different thread.
        stack.ensure_free_capacity(1)?;
        unsafe {
            if ffi::lua_checkstack(self.raw(), 1) == 0 {
                return Err(LuaError::InvalidOperation(
                    "stack overflow: cannot copy between threads".into(),
                ));
            }
            ffi::lua_pushvalue(self.raw(), self.index());
            ffi::lua_xmove(self.raw(), stack.raw(), 1);
        }
        Ok(())
    }
}

// ==================== Option ====================

impl<T: IntoLua> IntoLua for Option<T> {
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        match self {
            Some(value) => value.into_lua(stack),
            None => stack.push_nil(),
        }
    }
}

impl<T: FromLua> FromLua for Option<T> {
    fn from_lua(value: StackValue<'_>) -> LuaResult<Self> {
        if value.is_nil() {
            Ok(None)
        } else {
            T::from_lua(value).map(Some)
        }
    }

    fn from_none() -> LuaResult<Self> {
        Ok(None)
    }
}

// ==================== Boolean ====================

impl IntoLua for bool {
    #[inline]
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        stack.push_boolean(self)
    }
}

impl FromLua for bool {
    fn from_lua(value: StackValue<'_>) -> LuaResult<Self> {
        match value.lua_type() {
            LuaType::Boolean => Ok(value.is_truthy()),
            other => Err(mismatch("boolean", other)),
        }
    }
}

// ==================== Integer types ====================

/// `lua_tointegerx`: integers, floats with an exact integer value and
/// numeric strings.
fn read_integer(value: StackValue<'_>) -> LuaResult<ffi::lua_Integer> {
    let mut isnum = 0;
    let i = unsafe { ffi::lua_tointegerx(value.raw(), value.index(), &mut isnum) };
    if isnum != 0 {
        return Ok(i);
    }
    match value.lua_type() {
        LuaType::Number => Err(LuaError::Marshal(
            "number has no integer representation".into(),
        )),
        other => Err(mismatch("integer", other)),
    }
}

fn narrow<T: TryFrom<ffi::lua_Integer>>(i: ffi::lua_Integer) -> LuaResult<T> {
    T::try_from(i).map_err(|_| {
        LuaError::Marshal(format!(
            "integer {i} out of range for {}",
            std::any::type_name::<T>()
        ))
    })
}

macro_rules! impl_integer {
    ($($ty:ty),*) => {
        $(
            impl IntoLua for $ty {
                #[inline]
                fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
                    stack.push_integer(self as ffi::lua_Integer)
                }
            }

            impl FromLua for $ty {
                fn from_lua(value: StackValue<'_>) -> LuaResult<Self> {
                    narrow(read_integer(value)?)
                }
            }
        )*
    };
}

impl_integer!(i8, i16, i32, i64, isize, u8, u16, u32);

// Unsigned 64-bit values wrap through the signed integer slot, like
// `math.ult` arithmetic in Lua itself.
macro_rules! impl_wrapping_unsigned {
    ($($ty:ty),*) => {
        $(
            impl IntoLua for $ty {
                #[inline]
                fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
                    stack.push_integer(self as ffi::lua_Integer)
                }
            }

            impl FromLua for $ty {
                fn from_lua(value: StackValue<'_>) -> LuaResult<Self> {
                    read_integer(value).map(|i| i as $ty)
                }
            }
        )*
    };
}

impl_wrapping_unsigned!(u64, usize);

macro_rules! impl_wide_integer {
    ($($ty:ty),*) => {
        $(
            impl IntoLua for $ty {
                fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
                    let i = ffi::lua_Integer::try_from(self).map_err(|_| {
                        LuaError::Argument(format!("{} {} cannot be marshaled", stringify!($ty), self))
                    })?;
                    stack.push_integer(i)
                }
            }

            impl FromLua for $ty {
                fn from_lua(value: StackValue<'_>) -> LuaResult<Self> {
                    narrow(read_integer(value)?)
                }
            }
        )*
    };
}

impl_wide_integer!(i128, u128);

macro_rules! impl_nonzero {
    ($($nz:ty => $ty:ty),*) => {
        $(
            impl IntoLua for $nz {
                #[inline]
                fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
                    self.get().into_lua(stack)
                }
            }

            impl FromLua for $nz {
                fn from_lua(value: StackValue<'_>) -> LuaResult<Self> {
                    <$nz>::new(<$ty>::from_lua(value)?)
                        .ok_or_else(|| LuaError::Marshal("expected a non-zero integer".into()))
                }
            }
        )*
    };
}

impl_nonzero!(
    NonZeroI8 => i8, NonZeroI16 => i16, NonZeroI32 => i32, NonZeroI64 => i64,
    NonZeroIsize => isize, NonZeroU8 => u8, NonZeroU16 => u16, NonZeroU32 => u32,
    NonZeroU64 => u64, NonZeroUsize => usize
);

impl<T: IntoLua> IntoLua for Wrapping<T> {
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        self.0.into_lua(stack)
    }
}

impl<T: FromLua> FromLua for Wrapping<T> {
    fn from_lua(value: StackValue<'_>) -> LuaResult<Self> {
        T::from_lua(value).map(Wrapping)
    }
}

// ==================== Float types ====================

fn read_number(value: StackValue<'_>) -> LuaResult<ffi::lua_Number> {
    let mut isnum = 0;
    let n = unsafe { ffi::lua_tonumberx(value.raw(), value.index(), &mut isnum) };
    if isnum != 0 {
        Ok(n)
    } else {
        Err(mismatch("number", value.lua_type()))
    }
}

impl IntoLua for f64 {
    #[inline]
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        stack.push_number(self)
    }
}

impl FromLua for f64 {
    fn from_lua(value: StackValue<'_>) -> LuaResult<Self> {
        read_number(value)
    }
}

impl IntoLua for f32 {
    #[inline]
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        stack.push_number(self as f64)
    }
}

impl FromLua for f32 {
    fn from_lua(value: StackValue<'_>) -> LuaResult<Self> {
        read_number(value).map(|n| n as f32)
    }
}

// ==================== Strings ====================

/// Bytes of a string, or of a number converted on a copy so the original
/// slot keeps its type.
fn read_bytes(value: StackValue<'_>) -> LuaResult<Vec<u8>> {
    let l = value.raw();
    match value.lua_type() {
        LuaType::String => Ok(unsafe { ffi::lua_tobytes(l, value.index()) }
            .map(<[u8]>::to_vec)
            .unwrap_or_default()),
        LuaType::Number => {
            value.stack().ensure_free_capacity(1)?;
            unsafe {
                ffi::lua_pushvalue(l, value.index());
                value.state().protect_if_limited(l, 1, 1, |l| {
                    ffi::lua_tolstring(l, -1, std::ptr::null_mut());
                })?;
                let bytes = ffi::lua_tobytes(l, -1).map(<[u8]>::to_vec).unwrap_or_default();
                ffi::lua_pop(l, 1);
                Ok(bytes)
            }
        }
        other => Err(mismatch("string", other)),
    }
}

impl IntoLua for &str {
    #[inline]
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        stack.push_bytes(self.as_bytes())
    }
}

impl IntoLua for String {
    #[inline]
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        stack.push_bytes(self.as_bytes())
    }
}

impl IntoLua for &String {
    #[inline]
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        stack.push_bytes(self.as_bytes())
    }
}

impl IntoLua for Cow<'_, str> {
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        stack.push_bytes(self.as_bytes())
    }
}

impl IntoLua for char {
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        let mut buf = [0u8; 4];
        stack.push_bytes(self.encode_utf8(&mut buf).as_bytes())
    }
}

impl IntoLua for LuaString {
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        stack.push_bytes(self.as_bytes())
    }
}

impl IntoLua for &LuaString {
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        stack.push_bytes(self.as_bytes())
    }
}

impl FromLua for String {
    fn from_lua(value: StackValue<'_>) -> LuaResult<Self> {
        String::from_utf8(read_bytes(value)?)
            .map_err(|err| LuaError::Marshal(format!("invalid utf-8: {}", err.utf8_error())))
    }
}

impl FromLua for LuaString {
    fn from_lua(value: StackValue<'_>) -> LuaResult<Self> {
        read_bytes(value).map(LuaString::from)
    }
}

impl FromLua for char {
    fn from_lua(value: StackValue<'_>) -> LuaResult<Self> {
        let s = String::from_lua(value)?;
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(c),
            _ => Err(LuaError::Marshal(format!(
                "expected a single character, got {} bytes",
                s.len()
            ))),
        }
    }
}

// ==================== Light userdata ====================

impl IntoLua for LightUserData {
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        stack.push_light_userdata(self.0)
    }
}

impl IntoLua for *mut c_void {
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        stack.push_light_userdata(self)
    }
}

impl IntoLua for *const c_void {
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        stack.push_light_userdata(self as *mut c_void)
    }
}

impl FromLua for LightUserData {
    fn from_lua(value: StackValue<'_>) -> LuaResult<Self> {
        match value.lua_type() {
            LuaType::LightUserData => Ok(LightUserData(unsafe {
                ffi::lua_touserdata(value.raw(), value.index())
            })),
            other => Err(mismatch("light userdata", other)),
        }
    }
}

// ==================== References ====================

macro_rules! impl_reference_convert {
    ($name:ident, $lua_type:path, $expected:literal) => {
        impl IntoLua for $name {
            fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
                self.core().push(stack)
            }
        }

        impl IntoLua for &$name {
            fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
                self.core().push(stack)
            }
        }

        impl FromLua for $name {
            fn from_lua(value: StackValue<'_>) -> LuaResult<Self> {
                match value.lua_type() {
                    $lua_type => {
                        RefCore::register(value.stack(), value.index(), <$name>::KIND)
                            .map(<$name>::from_core)
                    }
                    other => Err(mismatch($expected, other)),
                }
            }
        }
    };
}

impl_reference_convert!(LuaTableRef, LuaType::Table, "table");
impl_reference_convert!(LuaFunctionRef, LuaType::Function, "function");
impl_reference_convert!(LuaUserDataRef, LuaType::UserData, "userdata");
impl_reference_convert!(LuaThreadRef, LuaType::Thread, "thread");

// ==================== Described userdata ====================

impl<T: LuaUserData> IntoLua for Rc<RefCell<T>> {
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        userdata::push_shared(stack, self)
    }
}

impl<T: 'static> FromLua for Rc<RefCell<T>> {
    fn from_lua(value: StackValue<'_>) -> LuaResult<Self> {
        if value.lua_type() != LuaType::UserData {
            return Err(mismatch(std::any::type_name::<T>(), value.lua_type()));
        }
        unsafe { userdata::host_object::<T>(value.raw(), value.index()) }.ok_or_else(|| {
            LuaError::Marshal(format!(
                "userdata does not hold a `{}`",
                std::any::type_name::<T>()
            ))
        })
    }
}

// ==================== Collections ====================

fn push_sequence<I>(stack: &LuaStack<'_>, items: I) -> LuaResult<()>
where
    I: IntoIterator,
    I::Item: IntoLua,
{
    let items = items.into_iter();
    stack.new_table(items.size_hint().0, 0)?;
    let table = stack.count();
    for (i, item) in items.enumerate() {
        stack.push(item)?;
        stack.raw_seti_top(table, i as ffi::lua_Integer + 1)?;
    }
    Ok(())
}

fn push_map<I, K, V>(stack: &LuaStack<'_>, entries: I) -> LuaResult<()>
where
    I: IntoIterator<Item = (K, V)>,
    K: IntoLua,
    V: IntoLua,
{
    let entries = entries.into_iter();
    stack.new_table(0, entries.size_hint().0)?;
    let table = stack.count();
    for (key, value) in entries {
        stack.push(key)?;
        stack.push(value)?;
        stack.raw_set_top(table)?;
    }
    Ok(())
}

fn expect_table(value: StackValue<'_>) -> LuaResult<c_int> {
    match value.lua_type() {
        LuaType::Table => Ok(value.index()),
        other => Err(mismatch("table", other)),
    }
}

/// `t[1]..t[#t]` (raw) converted with `T`.
fn read_sequence<T: FromLua>(value: StackValue<'_>) -> LuaResult<Vec<T>> {
    let table = expect_table(value)?;
    let stack = value.stack();
    let l = value.raw();
    let len = unsafe { ffi::lua_rawlen(l, table) };
    let mut items = Vec::with_capacity(len as usize);
    let _guard = stack.snapshot_count();
    for i in 1..=len {
        stack.ensure_free_capacity(1)?;
        unsafe { ffi::lua_rawgeti(l, table, i as ffi::lua_Integer) };
        items.push(T::from_lua(stack.top()?)?);
        unsafe { ffi::lua_pop(l, 1) };
    }
    Ok(items)
}

/// Every pair of the table (raw traversal).
fn read_pairs<K: FromLua, V: FromLua>(
    value: StackValue<'_>,
    mut insert: impl FnMut(K, V),
) -> LuaResult<()> {
    let table = expect_table(value)?;
    let stack = value.stack();
    let l = value.raw();
    let _guard = stack.snapshot_count();
    stack.push_nil()?;
    loop {
        stack.ensure_free_capacity(2)?;
        if unsafe { ffi::lua_next(l, table) } == 0 {
            return Ok(());
        }
        let key = K::from_lua(stack.get(-2)?)?;
        let value = V::from_lua(stack.get(-1)?)?;
        insert(key, value);
        unsafe { ffi::lua_pop(l, 1) };
    }
}

impl<T: IntoLua> IntoLua for Vec<T> {
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        push_sequence(stack, self)
    }
}

impl<T: IntoLua> IntoLua for VecDeque<T> {
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        push_sequence(stack, self)
    }
}

impl<T: IntoLua, const N: usize> IntoLua for [T; N] {
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        push_sequence(stack, self)
    }
}

impl<T: IntoLua + Clone> IntoLua for &[T] {
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        push_sequence(stack, self.iter().cloned())
    }
}

impl<T: FromLua> FromLua for Vec<T> {
    fn from_lua(value: StackValue<'_>) -> LuaResult<Self> {
        read_sequence(value)
    }
}

impl<K: IntoLua, V: IntoLua, S> IntoLua for HashMap<K, V, S> {
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        push_map(stack, self)
    }
}

impl<K: IntoLua, V: IntoLua> IntoLua for BTreeMap<K, V> {
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        push_map(stack, self)
    }
}

impl<K, V, S> FromLua for HashMap<K, V, S>
where
    K: FromLua + Eq + Hash,
    V: FromLua,
    S: BuildHasher + Default,
{
    fn from_lua(value: StackValue<'_>) -> LuaResult<Self> {
        let mut map = HashMap::default();
        read_pairs(value, |k, v| {
            map.insert(k, v);
        })?;
        Ok(map)
    }
}

impl<K: FromLua + Ord, V: FromLua> FromLua for BTreeMap<K, V> {
    fn from_lua(value: StackValue<'_>) -> LuaResult<Self> {
        let mut map = BTreeMap::new();
        read_pairs(value, |k, v| {
            map.insert(k, v);
        })?;
        Ok(map)
    }
}

/// Push any iterator as a sequence table.
///
/// ```ignore
/// stack.push(LuaSequence((1..=3).map(|i| i * i)))?;
/// ```
#[derive(Debug, Clone)]
pub struct LuaSequence<I>(pub I);

impl<I> IntoLua for LuaSequence<I>
where
    I: IntoIterator,
    I::Item: IntoLua,
{
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        push_sequence(stack, self.0)
    }
}

/// Push any iterator of pairs as a hash table.
#[derive(Debug, Clone)]
pub struct LuaMap<I>(pub I);

impl<I, K, V> IntoLua for LuaMap<I>
where
    I: IntoIterator<Item = (K, V)>,
    K: IntoLua,
    V: IntoLua,
{
    fn into_lua(self, stack: &LuaStack<'_>) -> LuaResult<()> {
        push_map(stack, self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua_vm::{LuaVM, SafeOption};

    #[test]
    fn test_narrowing_is_range_checked() {
        let vm = LuaVM::with_options(SafeOption::bare()).unwrap();
        let stack = vm.stack().unwrap();
        stack.push(300i64).unwrap();
        assert!(stack.read::<u8>(-1).is_err());
        assert_eq!(stack.read::<i16>(-1).unwrap(), 300);
        stack.push(2.5f64).unwrap();
        assert!(stack.read::<i64>(-1).is_err());
        stack.push("17").unwrap();
        assert_eq!(stack.read::<i32>(-1).unwrap(), 17);
        // Reading a number as a string does not convert the slot.
        stack.push(5i64).unwrap();
        assert_eq!(stack.read::<String>(-1).unwrap(), "5");
        assert_eq!(stack.get(-1).unwrap().lua_type(), LuaType::Number);
    }

    #[test]
    fn test_u64_wraps_and_i128_fails() {
        let vm = LuaVM::with_options(SafeOption::bare()).unwrap();
        let stack = vm.stack().unwrap();
        stack.push(u64::MAX).unwrap();
        assert_eq!(stack.read::<i64>(-1).unwrap(), -1);
        assert_eq!(stack.read::<u64>(-1).unwrap(), u64::MAX);
        let count = stack.count();
        assert!(matches!(stack.push(i128::MAX), Err(LuaError::Argument(_))));
        assert_eq!(stack.count(), count);
    }

    #[test]
    fn test_strict_boolean_and_option() {
        let vm = LuaVM::with_options(SafeOption::bare()).unwrap();
        let stack = vm.stack().unwrap();
        stack.push(0i64).unwrap();
        assert!(stack.read::<bool>(-1).is_err());
        stack.push(None::<i32>).unwrap();
        assert_eq!(stack.read::<Option<i32>>(-1).unwrap(), None);
        assert!(stack.read::<i32>(-1).is_err());
        assert!(matches!(i32::from_none(), Err(LuaError::Marshal(_))));
        assert_eq!(Option::<i32>::from_none().unwrap(), None);
    }
}
