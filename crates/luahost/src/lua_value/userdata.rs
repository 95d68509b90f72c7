//! Host objects exposed to Lua as full userdata.
//!
//! A userdata block holds a strong `Rc` to the host object. Each exposed Rust
//! type gets one metatable per state, built from a [`UserDataDescriptor`]:
//! field getters and setters, methods, and metamethods. All of them are host
//! callbacks, so errors and panics inside them cross the interpreter like
//! any other callback failure.
//!
//! Pushing the same `Rc` twice yields the same userdata: each type keeps a
//! weak-valued table from the `Rc` address to its userdata.

use std::any::Any;
use std::cell::RefCell;
use std::ffi::{c_int, c_void};
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::Rc;

use ahash::AHashMap;
use smol_str::SmolStr;

use crate::ffi::callback::{RustCallback, push_callback};
use crate::ffi::{self, lua_State};
use crate::lua_value::multi::shift_position;
use crate::lua_value::{FromLua, FromLuaMulti, IntoLua, IntoLuaMulti, LuaType};
use crate::lua_vm::lua_state::LuaState;
use crate::lua_vm::panic_bridge::abort_on_panic;
use crate::lua_vm::{LuaError, LuaResult, LuaStack, LuaVM, StackValue, function_callback};

const USERDATA_MAGIC: u64 = 0x6c75_6168_6f73_7475;
const DEAD_MAGIC: u64 = 0;
/// Metatable field holding the methods table.
const METHODS_KEY: &[u8] = b"__methods";

/// Layout of every host userdata block.
#[repr(C)]
struct UserDataBox {
    magic: u64,
    object: Rc<dyn Any>,
    type_name: SmolStr,
}

/// A Rust type that scripts can hold, index and call methods on.
///
/// Usually implemented with `#[derive(LuaUserData)]`; a manual impl only
/// needs [`describe`](Self::describe).
///
/// ```ignore
/// struct Counter { hits: i64 }
///
/// impl LuaUserData for Counter {
///     fn type_name() -> &'static str { "Counter" }
///
///     fn describe(d: &mut UserDataDescriptor<Self>) {
///         d.add_field_getter("hits", |c| c.hits);
///         d.add_method_mut("hit", |_, c, ()| { c.hits += 1; Ok(c.hits) });
///     }
/// }
/// ```
pub trait LuaUserData: Sized + 'static {
    /// Name used for `__name`, `tostring` and error messages.
    fn type_name() -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    fn describe(_descriptor: &mut UserDataDescriptor<Self>) {}
}

/// Hook for `#[lua_methods]`: the attribute emits an inherent
/// `__lua_describe_methods`, which shadows this empty default.
pub trait LuaMethodProvider: Sized {
    #[doc(hidden)]
    fn __lua_describe_methods(_descriptor: &mut UserDataDescriptor<Self>) {}
}

impl<T: 'static> LuaMethodProvider for T {}

/// Metamethods a descriptor may define. `__index`, `__newindex`, `__gc`,
/// `__name` and `__metatable` belong to the binding itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaMethod {
    ToString,
    Eq,
    Lt,
    Le,
    Len,
    Call,
    Concat,
    Unm,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Close,
}

impl MetaMethod {
    pub fn name(self) -> &'static str {
        match self {
            MetaMethod::ToString => "__tostring",
            MetaMethod::Eq => "__eq",
            MetaMethod::Lt => "__lt",
            MetaMethod::Le => "__le",
            MetaMethod::Len => "__len",
            MetaMethod::Call => "__call",
            MetaMethod::Concat => "__concat",
            MetaMethod::Unm => "__unm",
            MetaMethod::Add => "__add",
            MetaMethod::Sub => "__sub",
            MetaMethod::Mul => "__mul",
            MetaMethod::Div => "__div",
            MetaMethod::Mod => "__mod",
            MetaMethod::Close => "__close",
        }
    }
}

impl fmt::Display for MetaMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

type Getter<T> = Box<dyn Fn(&T, &LuaStack<'_>) -> LuaResult<()>>;
type Setter<T> = Box<dyn Fn(&mut T, StackValue<'_>) -> LuaResult<()>>;

/// What a type exposes to scripts. Filled in by [`LuaUserData::describe`]
/// or by a [`UserDataBuilder`](crate::UserDataBuilder).
pub struct UserDataDescriptor<T> {
    type_name: SmolStr,
    getters: AHashMap<SmolStr, Getter<T>>,
    setters: AHashMap<SmolStr, Setter<T>>,
    methods: Vec<(SmolStr, Rc<RustCallback>)>,
    meta: Vec<(MetaMethod, Rc<RustCallback>)>,
}

impl<T: 'static> UserDataDescriptor<T> {
    pub fn new(type_name: &str) -> Self {
        UserDataDescriptor {
            type_name: SmolStr::new(type_name),
            getters: AHashMap::new(),
            setters: AHashMap::new(),
            methods: Vec::new(),
            meta: Vec::new(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub(crate) fn set_type_name(&mut self, name: &str) {
        self.type_name = SmolStr::new(name);
    }

    /// Names of the readable fields, in no particular order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.getters.keys().map(SmolStr::as_str)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(|(name, _)| name.as_str())
    }

    /// Readable field `name`.
    pub fn add_field_getter<R, F>(&mut self, name: &str, getter: F) -> &mut Self
    where
        R: IntoLua,
        F: Fn(&T) -> R + 'static,
    {
        self.getters.insert(
            SmolStr::new(name),
            Box::new(move |this, stack| stack.push(getter(this))),
        );
        self
    }

    /// Writable field `name`. Without a getter the field is write-only.
    pub fn add_field_setter<A, F>(&mut self, name: &str, setter: F) -> &mut Self
    where
        A: FromLua,
        F: Fn(&mut T, A) -> LuaResult<()> + 'static,
    {
        self.setters.insert(
            SmolStr::new(name),
            Box::new(move |this, value| setter(this, A::from_lua(value)?)),
        );
        self
    }

    pub fn add_field<R, A, G, S>(&mut self, name: &str, getter: G, setter: S) -> &mut Self
    where
        R: IntoLua,
        A: FromLua,
        G: Fn(&T) -> R + 'static,
        S: Fn(&mut T, A) -> LuaResult<()> + 'static,
    {
        self.add_field_getter(name, getter).add_field_setter(name, setter)
    }

    /// Method called as `obj:name(...)`, borrowing the object shared.
    pub fn add_method<A, R, F>(&mut self, name: &str, method: F) -> &mut Self
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: Fn(&LuaVM, &T, A) -> LuaResult<R> + 'static,
    {
        let callback = self.shared_callback(name, method);
        self.methods.push((SmolStr::new(name), callback));
        self
    }

    /// Method called as `obj:name(...)`, borrowing the object exclusively.
    /// Re-entering the same object while it runs fails with
    /// [`LuaError::BorrowConflict`].
    pub fn add_method_mut<A, R, F>(&mut self, name: &str, method: F) -> &mut Self
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: Fn(&LuaVM, &mut T, A) -> LuaResult<R> + 'static,
    {
        let callback = self.exclusive_callback(name, method);
        self.methods.push((SmolStr::new(name), callback));
        self
    }

    /// Function stored next to the methods, called as `Type.name(...)`.
    pub fn add_function<A, R, F>(&mut self, name: &str, function: F) -> &mut Self
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: Fn(&LuaVM, A) -> LuaResult<R> + 'static,
    {
        self.methods.push((SmolStr::new(name), function_callback(function)));
        self
    }

    /// Metamethod receiving the object as its first operand.
    ///
    /// For `__eq` an operand of another type compares unequal instead of
    /// raising.
    pub fn add_meta_method<A, R, F>(&mut self, meta: MetaMethod, method: F) -> &mut Self
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: Fn(&LuaVM, &T, A) -> LuaResult<R> + 'static,
    {
        let callback = if meta == MetaMethod::Eq {
            let inner = self.shared_callback(meta.name(), method);
            Rc::new(move |vm: &LuaVM, stack: &LuaStack<'_>| {
                if unsafe { host_object::<T>(stack.raw(), 1) }.is_none() {
                    stack.push(false)?;
                    return Ok(1);
                }
                inner(vm, stack)
            }) as Rc<RustCallback>
        } else {
            self.shared_callback(meta.name(), method)
        };
        self.meta.push((meta, callback));
        self
    }

    pub fn add_meta_method_mut<A, R, F>(&mut self, meta: MetaMethod, method: F) -> &mut Self
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: Fn(&LuaVM, &mut T, A) -> LuaResult<R> + 'static,
    {
        let callback = self.exclusive_callback(meta.name(), method);
        self.meta.push((meta, callback));
        self
    }

    fn shared_callback<A, R, F>(&self, name: &str, method: F) -> Rc<RustCallback>
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: Fn(&LuaVM, &T, A) -> LuaResult<R> + 'static,
    {
        let type_name = self.type_name.clone();
        let name = SmolStr::new(name);
        Rc::new(move |vm: &LuaVM, stack: &LuaStack<'_>| {
            let object = receiver::<T>(stack, &type_name, &name)?;
            let args = method_args::<A>(stack)?;
            let result = {
                let this = object
                    .try_borrow()
                    .map_err(|_| LuaError::BorrowConflict(type_name.to_string()))?;
                method(vm, &this, args)?
            };
            result.push_multi(stack)
        })
    }

    fn exclusive_callback<A, R, F>(&self, name: &str, method: F) -> Rc<RustCallback>
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: Fn(&LuaVM, &mut T, A) -> LuaResult<R> + 'static,
    {
        let type_name = self.type_name.clone();
        let name = SmolStr::new(name);
        Rc::new(move |vm: &LuaVM, stack: &LuaStack<'_>| {
            let object = receiver::<T>(stack, &type_name, &name)?;
            let args = method_args::<A>(stack)?;
            let result = {
                let mut this = object
                    .try_borrow_mut()
                    .map_err(|_| LuaError::BorrowConflict(type_name.to_string()))?;
                method(vm, &mut this, args)?
            };
            result.push_multi(stack)
        })
    }
}

impl<T> fmt::Debug for UserDataDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserDataDescriptor")
            .field("type_name", &self.type_name)
            .field("fields", &self.getters.len())
            .field("methods", &self.methods.len())
            .field("meta", &self.meta.len())
            .finish()
    }
}

/// The object at argument 1 of a method call.
fn receiver<T: 'static>(stack: &LuaStack<'_>, type_name: &str, method: &str) -> LuaResult<Rc<RefCell<T>>> {
    if stack.count() >= 1
        && let Some(object) = unsafe { host_object::<T>(stack.raw(), 1) }
    {
        return Ok(object);
    }
    let found = match stack.get(1) {
        Ok(value) => value.type_name(),
        Err(_) => "no value",
    };
    Err(LuaError::Marshal(format!(
        "bad self for '{method}': expected {type_name}, got {found} (call it with ':')"
    )))
}

/// Arguments after the receiver; positions count the receiver as #1.
fn method_args<A: FromLuaMulti>(stack: &LuaStack<'_>) -> LuaResult<A> {
    let rest = stack.get_range(2, (stack.count() - 1).max(0))?;
    let mut consumed = 0;
    A::from_lua_args(rest, &mut consumed).map_err(|err| shift_position(err, 1))
}

// ==================== Per-state bindings ====================

/// A type's metatable and identity cache in one state. Both are registry
/// references that live as long as the state. Builder objects skip this and
/// carry an unanchored metatable of their own.
pub(crate) struct RegisteredType {
    type_name: SmolStr,
    metatable: c_int,
    cache: c_int,
}

impl RegisteredType {
    pub(crate) fn type_name(&self) -> &str {
        &self.type_name
    }

    pub(crate) fn metatable_slot(&self) -> c_int {
        self.metatable
    }
}

impl fmt::Debug for RegisteredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredType")
            .field("type_name", &self.type_name)
            .field("metatable", &self.metatable)
            .finish()
    }
}

struct FieldTable<T> {
    type_name: SmolStr,
    getters: AHashMap<SmolStr, Getter<T>>,
    setters: AHashMap<SmolStr, Setter<T>>,
}

/// Binding of `T` in this state, built from [`LuaUserData::describe`] on
/// first use.
pub(crate) fn registered_type<T: LuaUserData>(stack: &LuaStack<'_>) -> LuaResult<Rc<RegisteredType>> {
    let state = stack.state();
    let key = std::any::TypeId::of::<T>();
    if let Some(found) = state.userdata_types.borrow().get(&key) {
        return Ok(found.clone());
    }
    let mut descriptor = UserDataDescriptor::new(T::type_name());
    T::describe(&mut descriptor);
    let binding = Rc::new(build_binding(stack, descriptor)?);
    state.userdata_types.borrow_mut().insert(key, binding.clone());
    tracing::debug!(type_name = %binding.type_name, "registered userdata type");
    Ok(binding)
}

/// Build a metatable and identity cache from `descriptor` and anchor both in
/// the registry. Leaves the stack as it found it.
fn build_binding<T: 'static>(stack: &LuaStack<'_>, descriptor: UserDataDescriptor<T>) -> LuaResult<RegisteredType> {
    let _guard = stack.snapshot_count();
    let type_name = push_metatable(stack, descriptor)?;
    let metatable = register_top(stack)?;
    let cache = match push_identity_cache(stack).and_then(|()| register_top(stack)) {
        Ok(cache) => cache,
        Err(err) => {
            release_slot(stack, metatable);
            return Err(err);
        }
    };
    Ok(RegisteredType {
        type_name,
        metatable,
        cache,
    })
}

/// Push a metatable built from `descriptor`. The methods table hangs off the
/// metatable, so the whole binding is garbage once no userdata uses it.
pub(crate) fn push_metatable<T: 'static>(
    stack: &LuaStack<'_>,
    descriptor: UserDataDescriptor<T>,
) -> LuaResult<SmolStr> {
    let UserDataDescriptor {
        type_name,
        getters,
        setters,
        methods,
        meta,
    } = descriptor;

    stack.new_table(0, 9 + meta.len())?;
    let metatable = stack.count();
    stack.push_bytes(b"__name")?;
    stack.push_bytes(type_name.as_bytes())?;
    stack.raw_set_top(metatable)?;
    stack.push_bytes(b"__metatable")?;
    stack.push_bytes(type_name.as_bytes())?;
    stack.raw_set_top(metatable)?;

    stack.push_bytes(METHODS_KEY)?;
    stack.new_table(0, methods.len())?;
    let methods_table = stack.count();
    for (name, callback) in methods {
        stack.push_bytes(name.as_bytes())?;
        push_callback(stack, callback)?;
        stack.raw_set_top(methods_table)?;
    }
    stack.raw_set_top(metatable)?;

    let fields = Rc::new(FieldTable {
        type_name: type_name.clone(),
        getters,
        setters,
    });
    stack.push_bytes(b"__index")?;
    push_callback(stack, index_callback(fields.clone()))?;
    stack.raw_set_top(metatable)?;
    stack.push_bytes(b"__newindex")?;
    push_callback(stack, newindex_callback(fields))?;
    stack.raw_set_top(metatable)?;

    stack.push_bytes(b"__gc")?;
    stack.ensure_free_capacity(1)?;
    unsafe { ffi::lua_pushcfunction(stack.raw(), userdata_gc) };
    stack.raw_set_top(metatable)?;

    for (meta, callback) in meta {
        stack.push_bytes(meta.name().as_bytes())?;
        push_callback(stack, callback)?;
        stack.raw_set_top(metatable)?;
    }
    Ok(type_name)
}

fn push_identity_cache(stack: &LuaStack<'_>) -> LuaResult<()> {
    stack.new_table(0, 0)?;
    stack.new_table(0, 1)?;
    let mode = stack.count();
    stack.push_bytes(b"__mode")?;
    stack.push_bytes(b"v")?;
    stack.raw_set_top(mode)?;
    unsafe { ffi::lua_setmetatable(stack.raw(), -2) };
    Ok(())
}

/// Pop the top value into a fresh registry slot.
fn register_top(stack: &LuaStack<'_>) -> LuaResult<c_int> {
    unsafe {
        stack.state().protect_if_limited(stack.raw(), 1, 0, |l| {
            ffi::luaL_ref(l, ffi::LUA_REGISTRYINDEX)
        })
    }
}

fn release_slot(stack: &LuaStack<'_>, slot: c_int) {
    unsafe { ffi::luaL_unref(stack.raw(), ffi::LUA_REGISTRYINDEX, slot) };
}

fn index_callback<T: 'static>(fields: Rc<FieldTable<T>>) -> Rc<RustCallback> {
    Rc::new(move |_vm: &LuaVM, stack: &LuaStack<'_>| {
        let object = receiver::<T>(stack, &fields.type_name, "__index")?;
        let key = stack.get(2)?;
        if key.lua_type() == LuaType::String {
            let getter = unsafe { ffi::lua_tobytes(stack.raw(), 2) }
                .and_then(|bytes| std::str::from_utf8(bytes).ok())
                .and_then(|name| fields.getters.get(name));
            if let Some(getter) = getter {
                let this = object
                    .try_borrow()
                    .map_err(|_| LuaError::BorrowConflict(fields.type_name.to_string()))?;
                getter(&this, stack)?;
                return Ok(1);
            }
        }
        let l = stack.raw();
        stack.ensure_free_capacity(3)?;
        if unsafe { ffi::lua_getmetatable(l, 1) } == 0 {
            stack.push_nil()?;
            return Ok(1);
        }
        stack.push_bytes(METHODS_KEY)?;
        if unsafe { ffi::lua_rawget(l, -2) } != ffi::LUA_TTABLE {
            stack.push_nil()?;
            return Ok(1);
        }
        stack.push_copy(2)?;
        unsafe { ffi::lua_rawget(l, -2) };
        Ok(1)
    })
}

fn newindex_callback<T: 'static>(fields: Rc<FieldTable<T>>) -> Rc<RustCallback> {
    Rc::new(move |_vm: &LuaVM, stack: &LuaStack<'_>| {
        let object = receiver::<T>(stack, &fields.type_name, "__newindex")?;
        let key = stack.get(2)?;
        let name = match key.lua_type() {
            LuaType::String => unsafe { ffi::lua_tobytes(stack.raw(), 2) }
                .and_then(|bytes| std::str::from_utf8(bytes).ok()),
            _ => None,
        };
        let Some(name) = name else {
            return Err(LuaError::runtime(format!(
                "cannot index {} with a {} key",
                fields.type_name,
                key.type_name()
            )));
        };
        match fields.setters.get(name) {
            Some(setter) => {
                let value = stack.get(3)?;
                let mut this = object
                    .try_borrow_mut()
                    .map_err(|_| LuaError::BorrowConflict(fields.type_name.to_string()))?;
                setter(&mut this, value).map_err(|err| match err {
                    LuaError::Marshal(message) => {
                        LuaError::Marshal(format!("field '{name}' of {}: {message}", fields.type_name))
                    }
                    other => other,
                })?;
                Ok(0)
            }
            None if fields.getters.contains_key(name) => Err(LuaError::runtime(format!(
                "field '{name}' of {} is read-only",
                fields.type_name
            ))),
            None => Err(LuaError::runtime(format!(
                "{} has no field '{name}'",
                fields.type_name
            ))),
        }
    })
}

// ==================== Blocks ====================

unsafe fn userdata_box<'a>(l: *mut lua_State, index: c_int) -> Option<&'a UserDataBox> {
    unsafe {
        if ffi::lua_type(l, index) != ffi::LUA_TUSERDATA
            || ffi::lua_rawlen(l, index) as usize != mem::size_of::<UserDataBox>()
        {
            return None;
        }
        let block = ffi::lua_touserdata(l, index) as *const UserDataBox;
        if block.is_null() || (*block).magic != USERDATA_MAGIC {
            return None;
        }
        Some(&*block)
    }
}

/// The host object behind the userdata at `index`, if it is a live host
/// userdata holding a `T`.
pub(crate) unsafe fn host_object<T: 'static>(l: *mut lua_State, index: c_int) -> Option<Rc<RefCell<T>>> {
    let block = unsafe { userdata_box(l, index) }?;
    block.object.clone().downcast::<RefCell<T>>().ok()
}

pub(crate) unsafe fn host_type_name(l: *mut lua_State, index: c_int) -> Option<String> {
    unsafe { userdata_box(l, index) }.map(|block| block.type_name.to_string())
}

/// Push the userdata for `object`, creating it on first push.
pub(crate) fn push_shared<T: LuaUserData>(stack: &LuaStack<'_>, object: Rc<RefCell<T>>) -> LuaResult<()> {
    let binding = registered_type::<T>(stack)?;
    push_with_binding(stack, object, &binding)
}

fn push_with_binding<T: 'static>(stack: &LuaStack<'_>, object: Rc<RefCell<T>>, binding: &RegisteredType) -> LuaResult<()> {
    let l = stack.raw();
    let key = Rc::as_ptr(&object) as *const c_void;
    stack.ensure_free_capacity(5)?;
    stack.push_registry_slot(binding.cache)?;
    let cache = stack.count();

    unsafe {
        if ffi::lua_rawgetp(l, cache, key) == ffi::LUA_TUSERDATA
            && host_object::<T>(l, -1).is_some_and(|found| Rc::ptr_eq(&found, &object))
        {
            ffi::lua_replace(l, cache);
            return Ok(());
        }
        ffi::lua_pop(l, 1);
    }

    stack.push_registry_slot(binding.metatable)?;
    let metatable = stack.count();
    if let Err(err) = push_block(stack, object, &binding.type_name, metatable) {
        unsafe { ffi::lua_pop(l, 2) };
        return Err(err);
    }
    let block = stack.count();
    unsafe {
        ffi::lua_pushvalue(l, cache);
        ffi::lua_pushvalue(l, block);
        let cached = stack.state().protect_if_limited(l, 2, 0, move |l| {
            ffi::lua_rawsetp(l, -2, key);
            ffi::lua_pop(l, 1);
        });
        // The userdata is valid even if caching it failed.
        if let Err(err) = cached {
            tracing::warn!(error = %err, "could not cache userdata identity");
        }
        ffi::lua_replace(l, cache);
        ffi::lua_pop(l, 1);
    }
    Ok(())
}

/// Allocate a block for `object` and give it the metatable at stack index
/// `metatable`.
pub(crate) fn push_block<T: 'static>(
    stack: &LuaStack<'_>,
    object: Rc<RefCell<T>>,
    type_name: &SmolStr,
    metatable: c_int,
) -> LuaResult<()> {
    let l = stack.raw();
    stack.ensure_free_capacity(2)?;
    let block = unsafe {
        stack.state().protect_if_limited(l, 0, 1, |l| {
            ffi::lua_newuserdatauv(l, mem::size_of::<UserDataBox>(), 0)
        })?
    } as *mut UserDataBox;
    let object: Rc<dyn Any> = object;
    unsafe {
        block.write(UserDataBox {
            magic: USERDATA_MAGIC,
            object,
            type_name: type_name.clone(),
        });
        ffi::lua_pushvalue(l, metatable);
        ffi::lua_setmetatable(l, -2);
    }
    Ok(())
}

unsafe extern "C-unwind" fn userdata_gc(l: *mut lua_State) -> c_int {
    unsafe {
        if userdata_box(l, 1).is_none() {
            return 0;
        }
        let block = ffi::lua_touserdata(l, 1) as *mut UserDataBox;
        let boxed = ptr::read(block);
        ptr::addr_of_mut!((*block).magic).write(DEAD_MAGIC);
        let type_name = boxed.type_name.clone();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || drop(boxed))) {
            tracing::error!(type_name = %type_name, "panic while dropping a host object");
            match LuaState::from_extra(l) {
                Some(state) => state.bridge.defer_panic(payload),
                None => abort_on_panic(&*payload),
            }
        }
    }
    0
}
