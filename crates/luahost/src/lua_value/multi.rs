//! Multiple values: call arguments and results.

use std::ffi::c_int;
use std::ops::{Deref, DerefMut};

use crate::lua_value::{FromLua, IntoLua, LuaValue};
use crate::lua_vm::{LuaError, LuaResult, LuaStack, StackValueRange};

/// Push zero or more values; returns how many were pushed.
pub trait IntoLuaMulti {
    fn push_multi(self, stack: &LuaStack<'_>) -> LuaResult<c_int>;
}

/// Read a Rust value from a range of stack values.
pub trait FromLuaMulti: Sized {
    fn from_lua_multi(values: StackValueRange<'_>) -> LuaResult<Self>;

    /// Like [`from_lua_multi`](Self::from_lua_multi), reporting how many
    /// values were used. Argument errors name the 1-based position.
    fn from_lua_args(values: StackValueRange<'_>, consumed: &mut usize) -> LuaResult<Self> {
        *consumed = values.len();
        Self::from_lua_multi(values)
    }
}

// ==================== Single values ====================

impl<T: IntoLua> IntoLuaMulti for T {
    #[inline]
    fn push_multi(self, stack: &LuaStack<'_>) -> LuaResult<c_int> {
        self.into_lua(stack)?;
        Ok(1)
    }
}

impl<T: FromLua> FromLuaMulti for T {
    fn from_lua_multi(values: StackValueRange<'_>) -> LuaResult<Self> {
        match values.get(0) {
            Some(value) => T::from_lua(value),
            None => T::from_none(),
        }
    }

    fn from_lua_args(values: StackValueRange<'_>, consumed: &mut usize) -> LuaResult<Self> {
        *consumed = 1.min(values.len());
        Self::from_lua_multi(values).map_err(|err| bad_argument(1, err))
    }
}

fn bad_argument(position: usize, err: LuaError) -> LuaError {
    match err {
        LuaError::Marshal(message) => LuaError::Marshal(format!("bad argument #{position}: {message}")),
        other => other,
    }
}

// ==================== Unit ====================

impl IntoLuaMulti for () {
    #[inline]
    fn push_multi(self, _stack: &LuaStack<'_>) -> LuaResult<c_int> {
        Ok(0)
    }
}

impl FromLuaMulti for () {
    #[inline]
    fn from_lua_multi(_values: StackValueRange<'_>) -> LuaResult<Self> {
        Ok(())
    }

    fn from_lua_args(_values: StackValueRange<'_>, consumed: &mut usize) -> LuaResult<Self> {
        *consumed = 0;
        Ok(())
    }
}

// ==================== MultiValue ====================

/// Owned list of values, for calls whose arity is only known at run time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiValue(Vec<LuaValue>);

impl MultiValue {
    pub fn new() -> Self {
        MultiValue(Vec::new())
    }

    pub fn from_vec(values: Vec<LuaValue>) -> Self {
        MultiValue(values)
    }

    pub fn into_vec(self) -> Vec<LuaValue> {
        self.0
    }

    /// First value, or nil.
    pub fn first(&self) -> LuaValue {
        self.0.first().cloned().unwrap_or_default()
    }
}

impl Deref for MultiValue {
    type Target = Vec<LuaValue>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for MultiValue {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl FromIterator<LuaValue> for MultiValue {
    fn from_iter<I: IntoIterator<Item = LuaValue>>(iter: I) -> Self {
        MultiValue(iter.into_iter().collect())
    }
}

impl IntoIterator for MultiValue {
    type Item = LuaValue;
    type IntoIter = std::vec::IntoIter<LuaValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl IntoLuaMulti for MultiValue {
    fn push_multi(self, stack: &LuaStack<'_>) -> LuaResult<c_int> {
        push_all(stack, self.0)
    }
}

impl FromLuaMulti for MultiValue {
    fn from_lua_multi(values: StackValueRange<'_>) -> LuaResult<Self> {
        values.iter().map(LuaValue::from_lua).collect()
    }
}

// ==================== Variadic ====================

/// Any number of values of one type, typically the tail of an argument list.
///
/// ```ignore
/// let sum = vm.create_function(|_, nums: Variadic<i64>| Ok(nums.iter().sum::<i64>()))?;
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variadic<T>(Vec<T>);

impl<T> Variadic<T> {
    pub fn new() -> Self {
        Variadic(Vec::new())
    }

    pub fn into_vec(self) -> Vec<T> {
        self.0
    }
}

impl<T> From<Vec<T>> for Variadic<T> {
    fn from(values: Vec<T>) -> Self {
        Variadic(values)
    }
}

impl<T> FromIterator<T> for Variadic<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Variadic(iter.into_iter().collect())
    }
}

impl<T> Deref for Variadic<T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for Variadic<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<T: IntoLua> IntoLuaMulti for Variadic<T> {
    fn push_multi(self, stack: &LuaStack<'_>) -> LuaResult<c_int> {
        push_all(stack, self.0)
    }
}

impl<T: FromLua> FromLuaMulti for Variadic<T> {
    fn from_lua_multi(values: StackValueRange<'_>) -> LuaResult<Self> {
        values.iter().map(T::from_lua).collect()
    }

    fn from_lua_args(values: StackValueRange<'_>, consumed: &mut usize) -> LuaResult<Self> {
        *consumed = values.len();
        values
            .iter()
            .enumerate()
            .map(|(i, value)| T::from_lua(value).map_err(|err| bad_argument(i + 1, err)))
            .collect()
    }
}

fn push_all<T: IntoLua>(stack: &LuaStack<'_>, values: Vec<T>) -> LuaResult<c_int> {
    let count = c_int::try_from(values.len())
        .map_err(|_| LuaError::InvalidOperation("too many values".into()))?;
    stack.ensure_free_capacity(values.len())?;
    for value in values {
        value.into_lua(stack)?;
    }
    Ok(count)
}

// ==================== Tuples ====================

macro_rules! impl_tuple {
    ($($name:ident)* ; $last:ident) => {
        impl<$($name: IntoLua,)* $last: IntoLuaMulti> IntoLuaMulti for ($($name,)* $last,) {
            #[allow(non_snake_case, unused_mut)]
            fn push_multi(self, stack: &LuaStack<'_>) -> LuaResult<c_int> {
                let ($($name,)* $last,) = self;
                let mut count = 0;
                $(
                    $name.into_lua(stack)?;
                    count += 1;
                )*
                Ok(count + $last.push_multi(stack)?)
            }
        }

        impl<$($name: FromLua,)* $last: FromLuaMulti> FromLuaMulti for ($($name,)* $last,) {
            fn from_lua_multi(values: StackValueRange<'_>) -> LuaResult<Self> {
                let mut consumed = 0;
                Self::from_lua_args(values, &mut consumed)
            }

            #[allow(unused_mut, unused_assignments, non_snake_case)]
            fn from_lua_args(values: StackValueRange<'_>, consumed: &mut usize) -> LuaResult<Self> {
                let mut position = 0usize;
                $(
                    let $name = match values.get(position) {
                        Some(value) => $name::from_lua(value),
                        None => $name::from_none(),
                    }
                    .map_err(|err| bad_argument(position + 1, err))?;
                    position += 1;
                )*
                let mut rest = 0;
                let $last = $last::from_lua_args(values.skip(position), &mut rest)
                    .map_err(|err| shift_position(err, position))?;
                *consumed = (position + rest).min(values.len());
                Ok(($($name,)* $last,))
            }
        }
    };
}

/// Renumber `bad argument #n` of a tail reader by the values before it.
pub(crate) fn shift_position(err: LuaError, offset: usize) -> LuaError {
    if offset == 0 {
        return err;
    }
    match err {
        LuaError::Marshal(message) => match message
            .strip_prefix("bad argument #")
            .and_then(|rest| rest.split_once(':'))
            .and_then(|(n, tail)| n.parse::<usize>().ok().map(|n| (n, tail)))
        {
            Some((n, tail)) => LuaError::Marshal(format!("bad argument #{}:{tail}", n + offset)),
            None => LuaError::Marshal(message),
        },
        other => other,
    }
}

impl_tuple!(; A);
impl_tuple!(A ; B);
impl_tuple!(A B ; C);
impl_tuple!(A B C ; D);
impl_tuple!(A B C D ; E);
impl_tuple!(A B C D E ; F);
impl_tuple!(A B C D E F ; G);
impl_tuple!(A B C D E F G ; H);
impl_tuple!(A B C D E F G H ; I);
impl_tuple!(A B C D E F G H I ; J);
impl_tuple!(A B C D E F G H I J ; K);
impl_tuple!(A B C D E F G H I J K ; L);
