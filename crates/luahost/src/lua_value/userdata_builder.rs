//! Builder-pattern wrapper for creating userdata from third-party types.
//!
//! [`UserDataBuilder`] lets you expose fields, methods, and metamethods for
//! types you don't control (no derive macro available).
//!
//! # Example
//!
//! ```ignore
//! use std::net::SocketAddr;
//! use luahost::UserDataBuilder;
//!
//! let addr: SocketAddr = "127.0.0.1:8080".parse()?;
//! let ud = UserDataBuilder::new(addr)
//!     .set_type_name("SocketAddr")
//!     .add_field_getter("ip", |a| a.ip().to_string())
//!     .add_field_getter("port", |a| a.port())
//!     .set_tostring(|a| a.to_string())
//!     .build(&vm)?;
//! vm.set_global("server_addr", &ud)?;
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use crate::lua_value::userdata::{push_block, push_metatable};
use crate::lua_value::{FromLua, FromLuaMulti, IntoLua, IntoLuaMulti, MetaMethod, UserDataDescriptor};
use crate::lua_vm::{LuaResult, LuaUserDataRef, LuaVM};

/// Builder for creating userdata from arbitrary types.
///
/// Every [`build`](Self::build) creates its own metatable. Only the built
/// userdata holds it, so it is collected along with the userdata. For many
/// instances of one type, implement [`LuaUserData`](crate::LuaUserData)
/// instead.
pub struct UserDataBuilder<T: 'static> {
    value: T,
    descriptor: UserDataDescriptor<T>,
}

impl<T: 'static> UserDataBuilder<T> {
    /// Start building userdata wrapping `value`.
    ///
    /// The default type name is `std::any::type_name::<T>()`.
    pub fn new(value: T) -> Self {
        UserDataBuilder {
            value,
            descriptor: UserDataDescriptor::new(std::any::type_name::<T>()),
        }
    }

    /// Override the type name shown by `tostring` and in error messages.
    pub fn set_type_name(mut self, name: &str) -> Self {
        self.descriptor.set_type_name(name);
        self
    }

    /// Register a read-only field.
    pub fn add_field_getter<R, F>(mut self, name: &str, f: F) -> Self
    where
        R: IntoLua,
        F: Fn(&T) -> R + 'static,
    {
        self.descriptor.add_field_getter(name, f);
        self
    }

    /// Register a writable field. The setter rejects a value by returning
    /// an error, which surfaces in the script that assigned it.
    pub fn add_field_setter<A, F>(mut self, name: &str, f: F) -> Self
    where
        A: FromLua,
        F: Fn(&mut T, A) -> LuaResult<()> + 'static,
    {
        self.descriptor.add_field_setter(name, f);
        self
    }

    /// Add both a getter and a setter for the same field name.
    pub fn add_field<R, A, G, S>(self, name: &str, getter: G, setter: S) -> Self
    where
        R: IntoLua,
        A: FromLua,
        G: Fn(&T) -> R + 'static,
        S: Fn(&mut T, A) -> LuaResult<()> + 'static,
    {
        self.add_field_getter(name, getter).add_field_setter(name, setter)
    }

    pub fn add_method<A, R, F>(mut self, name: &str, f: F) -> Self
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: Fn(&LuaVM, &T, A) -> LuaResult<R> + 'static,
    {
        self.descriptor.add_method(name, f);
        self
    }

    pub fn add_method_mut<A, R, F>(mut self, name: &str, f: F) -> Self
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: Fn(&LuaVM, &mut T, A) -> LuaResult<R> + 'static,
    {
        self.descriptor.add_method_mut(name, f);
        self
    }

    pub fn add_meta_method<A, R, F>(mut self, meta: MetaMethod, f: F) -> Self
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: Fn(&LuaVM, &T, A) -> LuaResult<R> + 'static,
    {
        self.descriptor.add_meta_method(meta, f);
        self
    }

    /// Set the `__tostring` metamethod.
    pub fn set_tostring<F>(self, f: F) -> Self
    where
        F: Fn(&T) -> String + 'static,
    {
        self.add_meta_method(MetaMethod::ToString, move |_, this, ()| Ok(f(this)))
    }

    /// Consume the builder and create the userdata in `vm`.
    pub fn build(self, vm: &LuaVM) -> LuaResult<LuaUserDataRef> {
        let state = vm.state()?;
        let stack = state.stack()?;
        let _guard = stack.snapshot_count();
        let type_name = push_metatable(&stack, self.descriptor)?;
        let metatable = stack.count();
        push_block(&stack, Rc::new(RefCell::new(self.value)), &type_name, metatable)?;
        stack.pop_value()
    }
}
