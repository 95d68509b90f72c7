//! Loading source or binary chunks through `lua_load`.

use std::borrow::Cow;
use std::ffi::{CString, c_char, c_void};
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::panic::{self, AssertUnwindSafe};

use crate::ffi::{self, lua_State};
use crate::lua_value::{FromLuaMulti, IntoLuaMulti};
use crate::lua_vm::panic_bridge::error_message;
use crate::lua_vm::{LuaError, LuaFunctionRef, LuaResult, LuaTableRef, LuaVM};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Which chunk encodings `lua_load` accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChunkMode {
    Text,
    Binary,
    #[default]
    Any,
}

impl ChunkMode {
    fn as_cstr(self) -> &'static std::ffi::CStr {
        match self {
            ChunkMode::Text => c"t",
            ChunkMode::Binary => c"b",
            ChunkMode::Any => c"bt",
        }
    }
}

/// Seekable byte stream.
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek> ReadSeek for T {}

/// Where chunk bytes come from.
pub enum ChunkSource<'a> {
    Text(Cow<'a, str>),
    Bytes(Cow<'a, [u8]>),
    /// Read in blocks; a leading UTF-8 byte order mark is skipped.
    Stream(Box<dyn ReadSeek + 'a>),
    /// Pull-based reader: each call returns the next piece, `None` at the end.
    Pull(Box<dyn FnMut() -> io::Result<Option<Vec<u8>>> + 'a>),
}

impl ChunkSource<'_> {
    fn default_name(&self) -> String {
        match self {
            ChunkSource::Text(text) if !text.contains('\0') => text.clone().into_owned(),
            ChunkSource::Text(_) => "=(load)".to_owned(),
            ChunkSource::Bytes(_) => "=(bytes)".to_owned(),
            ChunkSource::Stream(_) => "=(stream)".to_owned(),
            ChunkSource::Pull(_) => "=(reader)".to_owned(),
        }
    }
}

impl fmt::Debug for ChunkSource<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkSource::Text(text) => f.debug_tuple("Text").field(&text.len()).finish(),
            ChunkSource::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            ChunkSource::Stream(_) => f.write_str("Stream"),
            ChunkSource::Pull(_) => f.write_str("Pull"),
        }
    }
}

impl<'a> From<&'a str> for ChunkSource<'a> {
    fn from(text: &'a str) -> Self {
        ChunkSource::Text(Cow::Borrowed(text))
    }
}

impl From<String> for ChunkSource<'_> {
    fn from(text: String) -> Self {
        ChunkSource::Text(Cow::Owned(text))
    }
}

impl<'a> From<&'a String> for ChunkSource<'a> {
    fn from(text: &'a String) -> Self {
        ChunkSource::Text(Cow::Borrowed(text.as_str()))
    }
}

impl<'a> From<&'a [u8]> for ChunkSource<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        ChunkSource::Bytes(Cow::Borrowed(bytes))
    }
}

impl From<Vec<u8>> for ChunkSource<'_> {
    fn from(bytes: Vec<u8>) -> Self {
        ChunkSource::Bytes(Cow::Owned(bytes))
    }
}

/// A chunk about to be loaded. Created by [`LuaVM::load`].
///
/// ```ignore
/// let f = vm.load("return ...").set_name("=args").into_function()?;
/// let n: i64 = vm.load("return 6 * 7").eval()?;
/// ```
#[must_use = "a chunk does nothing until it is loaded or run"]
pub struct Chunk<'vm, 'a> {
    vm: &'vm LuaVM,
    source: ChunkSource<'a>,
    name: Option<String>,
    mode: ChunkMode,
    env: Option<LuaTableRef>,
}

impl<'vm, 'a> Chunk<'vm, 'a> {
    pub(crate) fn new(vm: &'vm LuaVM, source: ChunkSource<'a>) -> Self {
        Chunk {
            vm,
            source,
            name: None,
            mode: ChunkMode::Any,
            env: None,
        }
    }

    /// Chunk name used in error messages and tracebacks. Lua convention:
    /// `=name` is shown as is, `@file` as a file name.
    pub fn set_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn set_mode(mut self, mode: ChunkMode) -> Self {
        self.mode = mode;
        self
    }

    /// Table used as `_ENV` instead of the globals.
    pub fn set_environment(mut self, env: LuaTableRef) -> Self {
        self.env = Some(env);
        self
    }

    /// Compile without running.
    pub fn into_function(self) -> LuaResult<LuaFunctionRef> {
        let Chunk {
            vm,
            mut source,
            name,
            mode,
            env,
        } = self;
        let name = name.unwrap_or_else(|| source.default_name());
        let name = CString::new(name)
            .map_err(|_| LuaError::Argument("chunk name contains a zero byte".into()))?;

        let state = vm.state()?;
        let stack = state.stack()?;
        let _guard = stack.snapshot_count();
        stack.ensure_free_capacity(2)?;
        if let Some(env) = &env {
            // Checked before loading so a foreign table fails early.
            stack.push(env)?;
        }

        let l = stack.raw();
        let mut reader = LoadReader::new(&mut source);
        let status = unsafe {
            ffi::lua_load(
                l,
                load_reader,
                &mut reader as *mut LoadReader<'_, '_> as *mut c_void,
                name.as_ptr(),
                mode.as_cstr().as_ptr(),
            )
        };
        if let Some(payload) = reader.panic.take() {
            panic::resume_unwind(payload);
        }
        if let Some(err) = reader.error.take() {
            return Err(err.into());
        }
        if status != ffi::LUA_OK {
            return Err(LuaError::from_status(status, unsafe { error_message(l, -1) }));
        }

        if env.is_some() {
            unsafe {
                ffi::lua_rotate(l, -2, 1);
                if ffi::lua_setupvalue(l, -2, 1).is_null() {
                    ffi::lua_pop(l, 1);
                }
            }
        }
        stack.pop_value()
    }

    /// Run the chunk, discarding its results.
    pub fn exec(self) -> LuaResult<()> {
        self.into_function()?.call(())
    }

    /// Run the chunk and read its results.
    pub fn eval<R: FromLuaMulti>(self) -> LuaResult<R> {
        self.into_function()?.call(())
    }

    /// Run the chunk with arguments, visible to it as `...`.
    pub fn call<A: IntoLuaMulti, R: FromLuaMulti>(self, args: A) -> LuaResult<R> {
        self.into_function()?.call(args)
    }
}

impl fmt::Debug for Chunk<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("source", &self.source)
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish()
    }
}

// ==================== Reader ====================

struct LoadReader<'s, 'a> {
    source: &'s mut ChunkSource<'a>,
    started: bool,
    finished: bool,
    buffer: Vec<u8>,
    error: Option<io::Error>,
    panic: Option<Box<dyn std::any::Any + Send>>,
}

impl<'s, 'a> LoadReader<'s, 'a> {
    fn new(source: &'s mut ChunkSource<'a>) -> Self {
        LoadReader {
            source,
            started: false,
            finished: false,
            buffer: Vec::new(),
            error: None,
            panic: None,
        }
    }

    /// Next piece of the chunk; empty at the end.
    fn next_piece(&mut self) -> io::Result<&[u8]> {
        if self.finished {
            return Ok(&[]);
        }
        let first = !self.started;
        self.started = true;
        match self.source {
            ChunkSource::Text(text) => {
                self.finished = true;
                Ok(strip_bom(text.as_bytes()))
            }
            ChunkSource::Bytes(bytes) => {
                self.finished = true;
                Ok(strip_bom(bytes))
            }
            ChunkSource::Stream(stream) => {
                if first {
                    skip_stream_bom(stream.as_mut())?;
                }
                self.buffer.resize(READ_BUFFER_SIZE, 0);
                let n = loop {
                    match stream.read(&mut self.buffer) {
                        Ok(n) => break n,
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => return Err(err),
                    }
                };
                if n == 0 {
                    self.finished = true;
                }
                Ok(&self.buffer[..n])
            }
            ChunkSource::Pull(pull) => loop {
                match pull()? {
                    // An empty piece would end the chunk early.
                    Some(piece) if piece.is_empty() => continue,
                    Some(piece) => {
                        self.buffer = piece;
                        if first && self.buffer.starts_with(UTF8_BOM) {
                            self.buffer.drain(..UTF8_BOM.len());
                        }
                        return Ok(&self.buffer);
                    }
                    None => {
                        self.finished = true;
                        return Ok(&[]);
                    }
                }
            },
        }
    }
}

fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes)
}

fn skip_stream_bom(stream: &mut dyn ReadSeek) -> io::Result<()> {
    let start = stream.stream_position()?;
    let mut head = [0u8; 3];
    let mut filled = 0;
    while filled < head.len() {
        match stream.read(&mut head[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    if head[..filled] != *UTF8_BOM {
        stream.seek(SeekFrom::Start(start))?;
    }
    Ok(())
}

unsafe extern "C-unwind" fn load_reader(
    _l: *mut lua_State,
    ud: *mut c_void,
    size: *mut usize,
) -> *const c_char {
    unsafe {
        let reader = &mut *(ud as *mut LoadReader<'_, '_>);
        *size = 0;
        if reader.error.is_some() || reader.panic.is_some() {
            return std::ptr::null();
        }
        match panic::catch_unwind(AssertUnwindSafe(|| {
            reader.next_piece().map(|piece| (piece.as_ptr(), piece.len()))
        })) {
            Ok(Ok((ptr, len))) => {
                *size = len;
                if len == 0 {
                    std::ptr::null()
                } else {
                    ptr as *const c_char
                }
            }
            Ok(Err(err)) => {
                reader.error = Some(err);
                std::ptr::null()
            }
            Err(payload) => {
                reader.panic = Some(payload);
                std::ptr::null()
            }
        }
    }
}

/// Contents of a script file as `luaL_loadfile` sees them: without a byte
/// order mark, and with a leading `#` line blanked so line numbers hold.
pub(crate) fn script_file_bytes(mut bytes: Vec<u8>) -> Vec<u8> {
    if bytes.starts_with(UTF8_BOM) {
        bytes.drain(..UTF8_BOM.len());
    }
    if bytes.first() == Some(&b'#') {
        let end = bytes.iter().position(|&b| b == b'\n').unwrap_or(bytes.len());
        bytes.drain(..end);
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_stream_bom_is_skipped() {
        let mut source = ChunkSource::Stream(Box::new(Cursor::new(b"\xEF\xBB\xBFreturn 1".to_vec())));
        let mut reader = LoadReader::new(&mut source);
        assert_eq!(reader.next_piece().unwrap(), b"return 1");
        assert!(reader.next_piece().unwrap().is_empty());
    }

    #[test]
    fn test_stream_without_bom_is_rewound() {
        let mut source = ChunkSource::Stream(Box::new(Cursor::new(b"x=1".to_vec())));
        let mut reader = LoadReader::new(&mut source);
        assert_eq!(reader.next_piece().unwrap(), b"x=1");
    }

    #[test]
    fn test_pull_reader_skips_empty_pieces() {
        let mut pieces = vec![Some(b"b".to_vec()), Some(Vec::new()), Some(b"a".to_vec())];
        let mut source = ChunkSource::Pull(Box::new(move || -> io::Result<Option<Vec<u8>>> {
            Ok(pieces.pop().flatten())
        }));
        let mut reader = LoadReader::new(&mut source);
        assert_eq!(reader.next_piece().unwrap(), b"a");
        assert_eq!(reader.next_piece().unwrap(), b"b");
        assert!(reader.next_piece().unwrap().is_empty());
    }

    #[test]
    fn test_script_file_shebang_keeps_line_numbers() {
        let bytes = script_file_bytes(b"#!/usr/bin/lua\nreturn 1".to_vec());
        assert_eq!(bytes, b"\nreturn 1");
        let plain = script_file_bytes(b"\xEF\xBB\xBFreturn 2".to_vec());
        assert_eq!(plain, b"return 2");
    }
}
