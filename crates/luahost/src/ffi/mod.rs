//! Raw bindings to the Lua 5.4 C API.
//!
//! This module is the native call surface of the crate: the `lua.h`,
//! `lauxlib.h` and `lualib.h` functions the binding uses, the constants of
//! `lua.h`, and Rust equivalents of the API macros.
//!
//! Functions that can raise a Lua error (anything that may allocate or run a
//! metamethod) are declared `C-unwind`. A Lua error is a `longjmp`, so it must
//! only be raised while no Rust frame between the raise point and the
//! protected call owns a value with a destructor. The panic bridge
//! (`crate::lua_vm::panic_bridge`) is the only code allowed to arrange that.

#![allow(non_camel_case_types)]

pub mod callback;

use std::ffi::{c_char, c_int, c_uchar, c_ushort, c_void};
use std::ptr;

/// Opaque interpreter thread.
#[repr(C)]
pub struct lua_State {
    _private: [u8; 0],
}

pub type lua_Number = f64;
pub type lua_Integer = i64;
pub type lua_Unsigned = u64;
pub type lua_KContext = isize;

pub type lua_CFunction = unsafe extern "C-unwind" fn(l: *mut lua_State) -> c_int;
pub type lua_KFunction =
    unsafe extern "C-unwind" fn(l: *mut lua_State, status: c_int, ctx: lua_KContext) -> c_int;

pub type lua_Reader = unsafe extern "C-unwind" fn(
    l: *mut lua_State,
    ud: *mut c_void,
    sz: *mut usize,
) -> *const c_char;

pub type lua_Writer = unsafe extern "C-unwind" fn(
    l: *mut lua_State,
    p: *const c_void,
    sz: usize,
    ud: *mut c_void,
) -> c_int;

pub type lua_Alloc = unsafe extern "C" fn(
    ud: *mut c_void,
    ptr: *mut c_void,
    osize: usize,
    nsize: usize,
) -> *mut c_void;

pub type lua_Hook = unsafe extern "C-unwind" fn(l: *mut lua_State, ar: *mut lua_Debug);

// ==================== Constants ====================

pub const LUA_VERSION_NUM: c_int = 504;

pub const LUA_MULTRET: c_int = -1;

pub const LUAI_MAXSTACK: c_int = 1_000_000;
pub const LUA_REGISTRYINDEX: c_int = -LUAI_MAXSTACK - 1000;
pub const LUA_MINSTACK: c_int = 20;

pub const LUA_RIDX_MAINTHREAD: lua_Integer = 1;
pub const LUA_RIDX_GLOBALS: lua_Integer = 2;
pub const LUA_RIDX_LAST: lua_Integer = LUA_RIDX_GLOBALS;

/// Size of the per-thread extra space (`LUA_EXTRASPACE`).
pub const LUA_EXTRASPACE: usize = std::mem::size_of::<*mut c_void>();
pub const LUA_IDSIZE: usize = 60;

pub const LUA_LOADED_TABLE: &std::ffi::CStr = c"_LOADED";

// thread status
pub const LUA_OK: c_int = 0;
pub const LUA_YIELD: c_int = 1;
pub const LUA_ERRRUN: c_int = 2;
pub const LUA_ERRSYNTAX: c_int = 3;
pub const LUA_ERRMEM: c_int = 4;
pub const LUA_ERRERR: c_int = 5;
pub const LUA_ERRFILE: c_int = 6;

// basic types
pub const LUA_TNONE: c_int = -1;
pub const LUA_TNIL: c_int = 0;
pub const LUA_TBOOLEAN: c_int = 1;
pub const LUA_TLIGHTUSERDATA: c_int = 2;
pub const LUA_TNUMBER: c_int = 3;
pub const LUA_TSTRING: c_int = 4;
pub const LUA_TTABLE: c_int = 5;
pub const LUA_TFUNCTION: c_int = 6;
pub const LUA_TUSERDATA: c_int = 7;
pub const LUA_TTHREAD: c_int = 8;

// lauxlib reference sentinels
pub const LUA_NOREF: c_int = -2;
pub const LUA_REFNIL: c_int = -1;

// comparison
pub const LUA_OPEQ: c_int = 0;
pub const LUA_OPLT: c_int = 1;
pub const LUA_OPLE: c_int = 2;

// garbage collector
pub const LUA_GCSTOP: c_int = 0;
pub const LUA_GCRESTART: c_int = 1;
pub const LUA_GCCOLLECT: c_int = 2;
pub const LUA_GCCOUNT: c_int = 3;
pub const LUA_GCCOUNTB: c_int = 4;
pub const LUA_GCSTEP: c_int = 5;
pub const LUA_GCISRUNNING: c_int = 9;
pub const LUA_GCGEN: c_int = 10;
pub const LUA_GCINC: c_int = 11;

// hook events and masks
pub const LUA_HOOKCALL: c_int = 0;
pub const LUA_HOOKRET: c_int = 1;
pub const LUA_HOOKLINE: c_int = 2;
pub const LUA_HOOKCOUNT: c_int = 3;
pub const LUA_HOOKTAILCALL: c_int = 4;

pub const LUA_MASKCALL: c_int = 1 << LUA_HOOKCALL;
pub const LUA_MASKRET: c_int = 1 << LUA_HOOKRET;
pub const LUA_MASKLINE: c_int = 1 << LUA_HOOKLINE;
pub const LUA_MASKCOUNT: c_int = 1 << LUA_HOOKCOUNT;

/// Activation record (`lua_Debug`) as laid out by Lua 5.4.
#[repr(C)]
pub struct lua_Debug {
    pub event: c_int,
    pub name: *const c_char,
    pub namewhat: *const c_char,
    pub what: *const c_char,
    pub source: *const c_char,
    pub srclen: usize,
    pub currentline: c_int,
    pub linedefined: c_int,
    pub lastlinedefined: c_int,
    pub nups: c_uchar,
    pub nparams: c_uchar,
    pub isvararg: c_char,
    pub istailcall: c_char,
    pub ftransfer: c_ushort,
    pub ntransfer: c_ushort,
    pub short_src: [c_char; LUA_IDSIZE],
    i_ci: *mut c_void,
}

impl Default for lua_Debug {
    fn default() -> Self {
        lua_Debug {
            event: 0,
            name: ptr::null(),
            namewhat: ptr::null(),
            what: ptr::null(),
            source: ptr::null(),
            srclen: 0,
            currentline: -1,
            linedefined: -1,
            lastlinedefined: -1,
            nups: 0,
            nparams: 0,
            isvararg: 0,
            istailcall: 0,
            ftransfer: 0,
            ntransfer: 0,
            short_src: [0; LUA_IDSIZE],
            i_ci: ptr::null_mut(),
        }
    }
}

// ==================== lua.h ====================

unsafe extern "C-unwind" {
    // state manipulation
    pub fn lua_newstate(f: lua_Alloc, ud: *mut c_void) -> *mut lua_State;
    pub fn lua_close(l: *mut lua_State);
    pub fn lua_newthread(l: *mut lua_State) -> *mut lua_State;
    pub fn lua_closethread(l: *mut lua_State, from: *mut lua_State) -> c_int;
    pub fn lua_atpanic(l: *mut lua_State, panicf: lua_CFunction) -> Option<lua_CFunction>;
    pub fn lua_version(l: *mut lua_State) -> lua_Number;

    // basic stack manipulation
    pub fn lua_absindex(l: *mut lua_State, idx: c_int) -> c_int;
    pub fn lua_gettop(l: *mut lua_State) -> c_int;
    pub fn lua_settop(l: *mut lua_State, idx: c_int);
    pub fn lua_pushvalue(l: *mut lua_State, idx: c_int);
    pub fn lua_rotate(l: *mut lua_State, idx: c_int, n: c_int);
    pub fn lua_copy(l: *mut lua_State, fromidx: c_int, toidx: c_int);
    pub fn lua_checkstack(l: *mut lua_State, n: c_int) -> c_int;
    pub fn lua_xmove(from: *mut lua_State, to: *mut lua_State, n: c_int);

    // access functions
    pub fn lua_isnumber(l: *mut lua_State, idx: c_int) -> c_int;
    pub fn lua_isstring(l: *mut lua_State, idx: c_int) -> c_int;
    pub fn lua_iscfunction(l: *mut lua_State, idx: c_int) -> c_int;
    pub fn lua_isinteger(l: *mut lua_State, idx: c_int) -> c_int;
    pub fn lua_isuserdata(l: *mut lua_State, idx: c_int) -> c_int;
    pub fn lua_type(l: *mut lua_State, idx: c_int) -> c_int;
    pub fn lua_typename(l: *mut lua_State, tp: c_int) -> *const c_char;

    pub fn lua_tonumberx(l: *mut lua_State, idx: c_int, isnum: *mut c_int) -> lua_Number;
    pub fn lua_tointegerx(l: *mut lua_State, idx: c_int, isnum: *mut c_int) -> lua_Integer;
    pub fn lua_toboolean(l: *mut lua_State, idx: c_int) -> c_int;
    pub fn lua_tolstring(l: *mut lua_State, idx: c_int, len: *mut usize) -> *const c_char;
    pub fn lua_rawlen(l: *mut lua_State, idx: c_int) -> lua_Unsigned;
    pub fn lua_tocfunction(l: *mut lua_State, idx: c_int) -> Option<lua_CFunction>;
    pub fn lua_touserdata(l: *mut lua_State, idx: c_int) -> *mut c_void;
    pub fn lua_tothread(l: *mut lua_State, idx: c_int) -> *mut lua_State;
    pub fn lua_topointer(l: *mut lua_State, idx: c_int) -> *const c_void;

    // comparison and arithmetic
    pub fn lua_rawequal(l: *mut lua_State, idx1: c_int, idx2: c_int) -> c_int;
    pub fn lua_compare(l: *mut lua_State, idx1: c_int, idx2: c_int, op: c_int) -> c_int;

    // push functions
    pub fn lua_pushnil(l: *mut lua_State);
    pub fn lua_pushnumber(l: *mut lua_State, n: lua_Number);
    pub fn lua_pushinteger(l: *mut lua_State, n: lua_Integer);
    pub fn lua_pushlstring(l: *mut lua_State, s: *const c_char, len: usize) -> *const c_char;
    pub fn lua_pushstring(l: *mut lua_State, s: *const c_char) -> *const c_char;
    pub fn lua_pushcclosure(l: *mut lua_State, f: lua_CFunction, n: c_int);
    pub fn lua_pushboolean(l: *mut lua_State, b: c_int);
    pub fn lua_pushlightuserdata(l: *mut lua_State, p: *mut c_void);
    pub fn lua_pushthread(l: *mut lua_State) -> c_int;

    // get functions
    pub fn lua_getglobal(l: *mut lua_State, name: *const c_char) -> c_int;
    pub fn lua_gettable(l: *mut lua_State, idx: c_int) -> c_int;
    pub fn lua_getfield(l: *mut lua_State, idx: c_int, k: *const c_char) -> c_int;
    pub fn lua_geti(l: *mut lua_State, idx: c_int, n: lua_Integer) -> c_int;
    pub fn lua_rawget(l: *mut lua_State, idx: c_int) -> c_int;
    pub fn lua_rawgeti(l: *mut lua_State, idx: c_int, n: lua_Integer) -> c_int;
    pub fn lua_rawgetp(l: *mut lua_State, idx: c_int, p: *const c_void) -> c_int;
    pub fn lua_createtable(l: *mut lua_State, narr: c_int, nrec: c_int);
    pub fn lua_newuserdatauv(l: *mut lua_State, sz: usize, nuvalue: c_int) -> *mut c_void;
    pub fn lua_getmetatable(l: *mut lua_State, objindex: c_int) -> c_int;
    pub fn lua_getiuservalue(l: *mut lua_State, idx: c_int, n: c_int) -> c_int;

    // set functions
    pub fn lua_setglobal(l: *mut lua_State, name: *const c_char);
    pub fn lua_settable(l: *mut lua_State, idx: c_int);
    pub fn lua_setfield(l: *mut lua_State, idx: c_int, k: *const c_char);
    pub fn lua_seti(l: *mut lua_State, idx: c_int, n: lua_Integer);
    pub fn lua_rawset(l: *mut lua_State, idx: c_int);
    pub fn lua_rawseti(l: *mut lua_State, idx: c_int, n: lua_Integer);
    pub fn lua_rawsetp(l: *mut lua_State, idx: c_int, p: *const c_void);
    pub fn lua_setmetatable(l: *mut lua_State, objindex: c_int) -> c_int;
    pub fn lua_setiuservalue(l: *mut lua_State, idx: c_int, n: c_int) -> c_int;

    // load and call
    pub fn lua_callk(
        l: *mut lua_State,
        nargs: c_int,
        nresults: c_int,
        ctx: lua_KContext,
        k: Option<lua_KFunction>,
    );
    pub fn lua_pcallk(
        l: *mut lua_State,
        nargs: c_int,
        nresults: c_int,
        errfunc: c_int,
        ctx: lua_KContext,
        k: Option<lua_KFunction>,
    ) -> c_int;
    pub fn lua_load(
        l: *mut lua_State,
        reader: lua_Reader,
        dt: *mut c_void,
        chunkname: *const c_char,
        mode: *const c_char,
    ) -> c_int;
    pub fn lua_dump(l: *mut lua_State, writer: lua_Writer, data: *mut c_void, strip: c_int) -> c_int;

    // coroutines
    pub fn lua_resume(
        l: *mut lua_State,
        from: *mut lua_State,
        narg: c_int,
        nres: *mut c_int,
    ) -> c_int;
    pub fn lua_status(l: *mut lua_State) -> c_int;

    // garbage collection
    pub fn lua_gc(l: *mut lua_State, what: c_int, ...) -> c_int;

    // miscellaneous
    pub fn lua_error(l: *mut lua_State) -> !;
    pub fn lua_next(l: *mut lua_State, idx: c_int) -> c_int;
    pub fn lua_concat(l: *mut lua_State, n: c_int);
    pub fn lua_len(l: *mut lua_State, idx: c_int);
    pub fn lua_stringtonumber(l: *mut lua_State, s: *const c_char) -> usize;

    // debug API
    pub fn lua_getstack(l: *mut lua_State, level: c_int, ar: *mut lua_Debug) -> c_int;
    pub fn lua_getinfo(l: *mut lua_State, what: *const c_char, ar: *mut lua_Debug) -> c_int;
    pub fn lua_getupvalue(l: *mut lua_State, funcindex: c_int, n: c_int) -> *const c_char;
    pub fn lua_setupvalue(l: *mut lua_State, funcindex: c_int, n: c_int) -> *const c_char;
    pub fn lua_sethook(l: *mut lua_State, f: Option<lua_Hook>, mask: c_int, count: c_int);
    pub fn lua_gethookmask(l: *mut lua_State) -> c_int;
    pub fn lua_gethookcount(l: *mut lua_State) -> c_int;
}

// ==================== lauxlib.h / lualib.h ====================

unsafe extern "C-unwind" {
    pub fn luaL_ref(l: *mut lua_State, t: c_int) -> c_int;
    pub fn luaL_unref(l: *mut lua_State, t: c_int, r#ref: c_int);
    pub fn luaL_newmetatable(l: *mut lua_State, tname: *const c_char) -> c_int;
    pub fn luaL_testudata(l: *mut lua_State, ud: c_int, tname: *const c_char) -> *mut c_void;
    pub fn luaL_traceback(
        l: *mut lua_State,
        l1: *mut lua_State,
        msg: *const c_char,
        level: c_int,
    );
    pub fn luaL_requiref(
        l: *mut lua_State,
        modname: *const c_char,
        openf: lua_CFunction,
        glb: c_int,
    );
    pub fn luaL_getsubtable(l: *mut lua_State, idx: c_int, fname: *const c_char) -> c_int;

    pub fn luaopen_base(l: *mut lua_State) -> c_int;
    pub fn luaopen_coroutine(l: *mut lua_State) -> c_int;
    pub fn luaopen_table(l: *mut lua_State) -> c_int;
    pub fn luaopen_io(l: *mut lua_State) -> c_int;
    pub fn luaopen_os(l: *mut lua_State) -> c_int;
    pub fn luaopen_string(l: *mut lua_State) -> c_int;
    pub fn luaopen_utf8(l: *mut lua_State) -> c_int;
    pub fn luaopen_math(l: *mut lua_State) -> c_int;
    pub fn luaopen_debug(l: *mut lua_State) -> c_int;
    pub fn luaopen_package(l: *mut lua_State) -> c_int;
}

// ==================== Macro equivalents ====================

/// `lua_upvalueindex`
#[inline]
pub const fn lua_upvalueindex(i: c_int) -> c_int {
    LUA_REGISTRYINDEX - i
}

/// `lua_getextraspace`: the `LUA_EXTRASPACE` bytes stored right before the
/// thread object.
#[inline]
pub unsafe fn lua_getextraspace(l: *mut lua_State) -> *mut c_void {
    unsafe { (l as *mut u8).sub(LUA_EXTRASPACE) as *mut c_void }
}

#[inline]
pub unsafe fn lua_pop(l: *mut lua_State, n: c_int) {
    unsafe { lua_settop(l, -n - 1) }
}

#[inline]
pub unsafe fn lua_newtable(l: *mut lua_State) {
    unsafe { lua_createtable(l, 0, 0) }
}

#[inline]
pub unsafe fn lua_pushcfunction(l: *mut lua_State, f: lua_CFunction) {
    unsafe { lua_pushcclosure(l, f, 0) }
}

#[inline]
pub unsafe fn lua_newuserdata(l: *mut lua_State, sz: usize) -> *mut c_void {
    unsafe { lua_newuserdatauv(l, sz, 1) }
}

#[inline]
pub unsafe fn lua_isnil(l: *mut lua_State, idx: c_int) -> bool {
    unsafe { lua_type(l, idx) == LUA_TNIL }
}

#[inline]
pub unsafe fn lua_isnoneornil(l: *mut lua_State, idx: c_int) -> bool {
    unsafe { lua_type(l, idx) <= LUA_TNIL }
}

#[inline]
pub unsafe fn lua_tonumber(l: *mut lua_State, idx: c_int) -> lua_Number {
    unsafe { lua_tonumberx(l, idx, ptr::null_mut()) }
}

#[inline]
pub unsafe fn lua_tointeger(l: *mut lua_State, idx: c_int) -> lua_Integer {
    unsafe { lua_tointegerx(l, idx, ptr::null_mut()) }
}

#[inline]
pub unsafe fn lua_insert(l: *mut lua_State, idx: c_int) {
    unsafe { lua_rotate(l, idx, 1) }
}

#[inline]
pub unsafe fn lua_remove(l: *mut lua_State, idx: c_int) {
    unsafe {
        lua_rotate(l, idx, -1);
        lua_pop(l, 1);
    }
}

#[inline]
pub unsafe fn lua_replace(l: *mut lua_State, idx: c_int) {
    unsafe {
        lua_copy(l, -1, idx);
        lua_pop(l, 1);
    }
}

#[inline]
pub unsafe fn lua_call(l: *mut lua_State, nargs: c_int, nresults: c_int) {
    unsafe { lua_callk(l, nargs, nresults, 0, None) }
}

#[inline]
pub unsafe fn lua_pcall(l: *mut lua_State, nargs: c_int, nresults: c_int, errfunc: c_int) -> c_int {
    unsafe { lua_pcallk(l, nargs, nresults, errfunc, 0, None) }
}

/// Read the byte contents of the string at `idx` without converting numbers
/// in place. Returns `None` for anything but a string.
#[inline]
pub unsafe fn lua_tobytes<'a>(l: *mut lua_State, idx: c_int) -> Option<&'a [u8]> {
    unsafe {
        if lua_type(l, idx) != LUA_TSTRING {
            return None;
        }
        let mut len = 0usize;
        let data = lua_tolstring(l, idx, &mut len);
        if data.is_null() {
            return None;
        }
        Some(std::slice::from_raw_parts(data as *const u8, len))
    }
}

/// `lua_typename` as a Rust string.
pub unsafe fn type_name(l: *mut lua_State, tp: c_int) -> &'static str {
    unsafe {
        let name = lua_typename(l, tp);
        if name.is_null() {
            return "no value";
        }
        std::ffi::CStr::from_ptr(name).to_str().unwrap_or("?")
    }
}

/// Minimum alignment of blocks handed out to the interpreter by the tracking
/// allocator (`LUAI_MAXALIGN` on the common 64-bit targets).
pub const SYS_MIN_ALIGN: usize = 2 * std::mem::size_of::<usize>();
