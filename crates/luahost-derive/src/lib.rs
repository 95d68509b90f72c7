//! Procedural macros for luahost userdata.
//!
//! `#[derive(LuaUserData)]` implements `luahost::LuaUserData` for a struct,
//! exposing its public fields, and `#[lua_methods]` exposes the public
//! methods of an impl block on the same descriptor.
//!
//! # Field attributes
//!
//! - `#[lua(skip)]`: keep the field out of Lua
//! - `#[lua(readonly)]`: getter only
//! - `#[lua(name = "...")]`: Lua-visible name
//!
//! # Struct attributes
//!
//! - `#[lua(name = "...")]`: type name used by `tostring` and errors
//! - `#[lua_impl(Display, PartialEq, PartialOrd)]`: map Rust traits to
//!   `__tostring`, `__eq`, `__lt` and `__le`
//!
//! # Example
//!
//! ```ignore
//! use luahost::{LuaUserData, lua_methods};
//!
//! #[derive(LuaUserData, PartialEq)]
//! #[lua_impl(PartialEq)]
//! struct Point {
//!     pub x: f64,
//!     pub y: f64,
//!     #[lua(skip)]
//!     pub internal_id: u32,
//! }
//!
//! #[lua_methods]
//! impl Point {
//!     pub fn length(&self) -> f64 {
//!         (self.x * self.x + self.y * self.y).sqrt()
//!     }
//! }
//! ```

mod derive_userdata;
mod lua_methods;
mod type_utils;

use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

/// Implement `LuaUserData` for a struct. Field types must implement
/// `IntoLua + Clone` to be readable and `FromLua` to be writable.
#[proc_macro_derive(LuaUserData, attributes(lua, lua_impl))]
pub fn derive_lua_userdata(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    derive_userdata::derive_lua_userdata_impl(input)
}

/// Expose the `pub fn`s taking `&self` or `&mut self` of an impl block as
/// Lua methods of a `#[derive(LuaUserData)]` type.
///
/// Parameters convert with `FromLua` (`&str` and `&[T]` are read as owned
/// values first), results with `IntoLua`. A `Result` return raises its
/// error in the calling script; the error type must convert into
/// `luahost::LuaError`. `#[lua(skip)]` and `#[lua(name = "...")]` work on
/// methods as on fields.
#[proc_macro_attribute]
pub fn lua_methods(_attr: TokenStream, item: TokenStream) -> TokenStream {
    lua_methods::lua_methods_impl(item)
}
