// Lua host binding
// Drives the reference Lua 5.4 interpreter from Rust: protected calls with
// panic forwarding, registry references, value marshaling and a stack view.

extern crate self as luahost;

#[cfg(test)]
mod test;

pub mod ffi;
pub mod lib_registry;
pub mod lua_value;
pub mod lua_vm;

#[cfg(feature = "serde")]
pub mod serde;

pub use lib_registry::{LibraryModule, LuaLibrary};
pub use lua_value::{
    FromLua, FromLuaMulti, IntoLua, IntoLuaMulti, LightUserData, LuaMap, LuaMethodProvider,
    LuaSequence, LuaString, LuaType, LuaUserData, LuaValue, MetaMethod, MultiValue,
    UserDataBuilder, UserDataDescriptor, Variadic,
};
pub use lua_vm::{
    CancellationToken, Chunk, ChunkMode, ChunkSource, ExecutionLimits, HookEvent, HookTriggers,
    LuaError, LuaFunctionRef, LuaReference, LuaResult, LuaStack, LuaStatus, LuaTableRef,
    LuaThreadRef, LuaUserDataRef, LuaVM, LuaWeakRef, RefKind, SafeOption, StackSnapshot,
    StackValue, StackValueRange, StateId, ThreadStatus,
};
pub use luahost_derive::{LuaUserData, lua_methods};
