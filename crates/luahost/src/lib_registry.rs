// Library registration: the Lua standard libraries and host modules.
// A library owns a fixed set of global names; closing it removes exactly
// those names and its `_LOADED` entry.

use std::ffi::{CStr, c_int};
use std::fmt;
use std::rc::Rc;

use smol_str::SmolStr;

use crate::ffi::callback::{RustCallback, push_callback};
use crate::ffi::{self, lua_CFunction};
use crate::lua_value::{FromLuaMulti, IntoLuaMulti};
use crate::lua_vm::panic_bridge::protect_lua;
use crate::lua_vm::{LuaResult, LuaStack, LuaVM, function_callback};

/// Standard library of the bound interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum LuaLibrary {
    Base,
    Package,
    Coroutine,
    Table,
    Io,
    Os,
    String,
    Utf8,
    Math,
    Debug,
}

const BASE_GLOBALS: &[&str] = &[
    "_G",
    "_VERSION",
    "assert",
    "collectgarbage",
    "dofile",
    "error",
    "getmetatable",
    "ipairs",
    "load",
    "loadfile",
    "next",
    "pairs",
    "pcall",
    "print",
    "rawequal",
    "rawget",
    "rawlen",
    "rawset",
    "select",
    "setmetatable",
    "tonumber",
    "tostring",
    "type",
    "warn",
    "xpcall",
];

impl LuaLibrary {
    /// Every library, in the order `luaL_openlibs` opens them.
    pub const ALL: [LuaLibrary; 10] = [
        LuaLibrary::Base,
        LuaLibrary::Package,
        LuaLibrary::Coroutine,
        LuaLibrary::Table,
        LuaLibrary::Io,
        LuaLibrary::Os,
        LuaLibrary::String,
        LuaLibrary::Math,
        LuaLibrary::Utf8,
        LuaLibrary::Debug,
    ];

    /// Module name as used by `require` and `_LOADED`.
    pub fn name(self) -> &'static str {
        match self {
            LuaLibrary::Base => "_G",
            LuaLibrary::Package => "package",
            LuaLibrary::Coroutine => "coroutine",
            LuaLibrary::Table => "table",
            LuaLibrary::Io => "io",
            LuaLibrary::Os => "os",
            LuaLibrary::String => "string",
            LuaLibrary::Utf8 => "utf8",
            LuaLibrary::Math => "math",
            LuaLibrary::Debug => "debug",
        }
    }

    fn module_name(self) -> &'static CStr {
        match self {
            LuaLibrary::Base => c"_G",
            LuaLibrary::Package => c"package",
            LuaLibrary::Coroutine => c"coroutine",
            LuaLibrary::Table => c"table",
            LuaLibrary::Io => c"io",
            LuaLibrary::Os => c"os",
            LuaLibrary::String => c"string",
            LuaLibrary::Utf8 => c"utf8",
            LuaLibrary::Math => c"math",
            LuaLibrary::Debug => c"debug",
        }
    }

    /// Global names the library defines.
    pub fn global_names(self) -> &'static [&'static str] {
        match self {
            LuaLibrary::Base => BASE_GLOBALS,
            LuaLibrary::Package => &["package", "require"],
            LuaLibrary::Coroutine => &["coroutine"],
            LuaLibrary::Table => &["table"],
            LuaLibrary::Io => &["io"],
            LuaLibrary::Os => &["os"],
            LuaLibrary::String => &["string"],
            LuaLibrary::Utf8 => &["utf8"],
            LuaLibrary::Math => &["math"],
            LuaLibrary::Debug => &["debug"],
        }
    }

    fn opener(self) -> lua_CFunction {
        match self {
            LuaLibrary::Base => ffi::luaopen_base,
            LuaLibrary::Package => ffi::luaopen_package,
            LuaLibrary::Coroutine => ffi::luaopen_coroutine,
            LuaLibrary::Table => ffi::luaopen_table,
            LuaLibrary::Io => ffi::luaopen_io,
            LuaLibrary::Os => ffi::luaopen_os,
            LuaLibrary::String => ffi::luaopen_string,
            LuaLibrary::Utf8 => ffi::luaopen_utf8,
            LuaLibrary::Math => ffi::luaopen_math,
            LuaLibrary::Debug => ffi::luaopen_debug,
        }
    }
}

impl fmt::Display for LuaLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A library module of host functions.
///
/// Opened under a name other than `_G`, the functions live in one global
/// table of that name, which `require` also finds. Under `_G` every function
/// becomes a global of its own.
pub struct LibraryModule {
    pub name: SmolStr,
    entries: Vec<(SmolStr, Rc<RustCallback>)>,
}

impl LibraryModule {
    /// Create a new library module
    pub fn new(name: &str) -> Self {
        Self {
            name: SmolStr::new(name),
            entries: Vec::new(),
        }
    }

    /// Add a function to this library
    pub fn with_function<A, R, F>(mut self, name: &str, func: F) -> Self
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: Fn(&LuaVM, A) -> LuaResult<R> + 'static,
    {
        self.entries.push((SmolStr::new(name), function_callback(func)));
        self
    }

    /// Add a function that works on the call's stack directly and returns
    /// how many results it pushed.
    pub fn with_raw_function<F>(mut self, name: &str, func: F) -> Self
    where
        F: Fn(&LuaVM, &LuaStack<'_>) -> LuaResult<c_int> + 'static,
    {
        self.entries.push((SmolStr::new(name), Rc::new(func)));
        self
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Global names the module defines once opened.
    pub fn global_names(&self) -> Vec<SmolStr> {
        if self.name == "_G" {
            self.entries.iter().map(|(name, _)| name.clone()).collect()
        } else {
            vec![self.name.clone()]
        }
    }
}

impl fmt::Debug for LibraryModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryModule")
            .field("name", &self.name)
            .field("functions", &self.function_names().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for creating library modules from closures
#[macro_export]
macro_rules! lib_module {
    ($name:expr, {
        $($item_name:expr => $item:expr),* $(,)?
    }) => {{
        let module = $crate::lib_registry::LibraryModule::new($name);
        $(
            let module = module.with_function($item_name, $item);
        )*
        module
    }};
}

// ==================== Open / close ====================

pub(crate) fn is_open(stack: &LuaStack<'_>, name: &str) -> bool {
    stack.state().open_libraries.borrow().contains_key(name)
}

/// Open a standard library; `false` if it already was.
pub(crate) fn open_library(stack: &LuaStack<'_>, library: LuaLibrary) -> LuaResult<bool> {
    if is_open(stack, library.name()) {
        return Ok(false);
    }
    let (name, open) = (library.module_name(), library.opener());
    stack.ensure_free_capacity(2)?;
    unsafe {
        protect_lua(stack.state(), stack.raw(), 0, 0, move |l| {
            ffi::luaL_requiref(l, name.as_ptr(), open, 1);
            ffi::lua_pop(l, 1);
        })?;
    }
    let globals = library.global_names().iter().copied().map(SmolStr::new).collect();
    stack
        .state()
        .open_libraries
        .borrow_mut()
        .insert(SmolStr::new(library.name()), globals);
    tracing::debug!(library = library.name(), "opened library");
    Ok(true)
}

/// Open a host module; `false` if a library of that name is already open.
pub(crate) fn open_module(stack: &LuaStack<'_>, module: &LibraryModule) -> LuaResult<bool> {
    if is_open(stack, &module.name) {
        return Ok(false);
    }
    let _guard = stack.snapshot_count();
    push_globals(stack)?;
    let globals = stack.count();
    push_loaded_table(stack)?;
    let loaded = stack.count();

    stack.new_table(0, module.entries.len())?;
    let table = stack.count();
    for (name, callback) in &module.entries {
        stack.push_bytes(name.as_bytes())?;
        push_callback(stack, callback.clone())?;
        let function = stack.count();
        if module.name == "_G" {
            stack.push_bytes(name.as_bytes())?;
            stack.push_copy(function)?;
            stack.raw_set_top(globals)?;
        }
        stack.raw_set_top(table)?;
    }
    if module.name != "_G" {
        stack.push_bytes(module.name.as_bytes())?;
        stack.push_copy(table)?;
        stack.raw_set_top(globals)?;
    }
    stack.push_bytes(module.name.as_bytes())?;
    stack.push_copy(table)?;
    stack.raw_set_top(loaded)?;

    stack
        .state()
        .open_libraries
        .borrow_mut()
        .insert(module.name.clone(), module.global_names());
    tracing::debug!(module = %module.name, "opened module");
    Ok(true)
}

/// Close the library or module called `name`; `false` if it was not open.
pub(crate) fn close_library(stack: &LuaStack<'_>, name: &str) -> LuaResult<bool> {
    let Some(names) = stack.state().open_libraries.borrow().get(name).cloned() else {
        return Ok(false);
    };
    let _guard = stack.snapshot_count();
    push_globals(stack)?;
    let globals = stack.count();
    for global in &names {
        stack.push_bytes(global.as_bytes())?;
        stack.push_nil()?;
        stack.raw_set_top(globals)?;
    }
    push_loaded_table(stack)?;
    let loaded = stack.count();
    stack.push_bytes(name.as_bytes())?;
    stack.push_nil()?;
    stack.raw_set_top(loaded)?;

    stack.state().open_libraries.borrow_mut().remove(name);
    tracing::debug!(library = name, "closed library");
    Ok(true)
}

fn push_globals(stack: &LuaStack<'_>) -> LuaResult<()> {
    stack.push_registry_slot(ffi::LUA_RIDX_GLOBALS as c_int)
}

/// Push `registry._LOADED`, creating it when no library made it yet.
fn push_loaded_table(stack: &LuaStack<'_>) -> LuaResult<()> {
    stack.ensure_free_capacity(2)?;
    unsafe {
        protect_lua(stack.state(), stack.raw(), 0, 1, |l| {
            ffi::luaL_getsubtable(l, ffi::LUA_REGISTRYINDEX, ffi::LUA_LOADED_TABLE.as_ptr());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_names_are_unique() {
        let mut names: Vec<_> = LuaLibrary::ALL.iter().map(|lib| lib.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), LuaLibrary::ALL.len());
        assert!(LuaLibrary::Base.global_names().contains(&"print"));
        assert_eq!(LuaLibrary::Package.global_names(), &["package", "require"]);
    }

    #[test]
    fn test_module_global_names() {
        let module = lib_module!("greet", {
            "hello" => |_: &LuaVM, name: String| Ok(format!("hello {name}")),
        });
        assert_eq!(module.global_names(), vec![SmolStr::new("greet")]);

        let globals = LibraryModule::new("_G")
            .with_function("one", |_: &LuaVM, ()| Ok(1))
            .with_function("two", |_: &LuaVM, ()| Ok(2));
        assert_eq!(globals.global_names(), vec![SmolStr::new("one"), SmolStr::new("two")]);
    }
}
