// Tests for chunk loading
use std::io::{self, Cursor};

use crate::*;

#[test]
fn test_load_and_call_with_args() {
    let vm = LuaVM::new().unwrap();
    let sum: i64 = vm
        .load("local a, b = ... return a + b")
        .call((20, 22))
        .unwrap();
    assert_eq!(sum, 42);

    let f = vm.load("return select('#', ...)").into_function().unwrap();
    assert_eq!(f.call::<_, i64>((1, 2, 3)).unwrap(), 3);
    assert_eq!(f.call::<_, i64>(()).unwrap(), 0);
}

#[test]
fn test_environment() {
    let vm = LuaVM::new().unwrap();
    let env = vm.create_table().unwrap();
    env.set("x", 10).unwrap();

    let y: i64 = vm
        .load("y = x * 2 return y")
        .set_environment(env.clone())
        .eval()
        .unwrap();
    assert_eq!(y, 20);
    assert_eq!(env.get::<_, i64>("y").unwrap(), 20);
    assert_eq!(vm.get_global::<Option<i64>>("y").unwrap(), None);
    // No standard library inside the sandbox.
    assert!(vm.load("return print").set_environment(env).eval::<LuaValue>().unwrap().is_nil());
}

#[test]
fn test_foreign_environment_is_rejected() {
    let vm1 = LuaVM::new().unwrap();
    let vm2 = LuaVM::new().unwrap();
    let env = vm1.create_table().unwrap();
    let err = vm2.load("return 1").set_environment(env).exec().unwrap_err();
    assert!(matches!(err, LuaError::InvalidOperation(_)), "{err}");
}

#[test]
fn test_text_mode_rejects_binary() {
    let vm = LuaVM::new().unwrap();
    let f: LuaFunctionRef = vm.evaluate("return function() return 1 end").unwrap();
    let bytes = f.dump(true).unwrap();

    let err = vm.load(bytes.as_slice()).set_mode(ChunkMode::Text).into_function().unwrap_err();
    assert!(matches!(err, LuaError::Syntax(_)), "{err}");

    let err = vm.load("return 1").set_mode(ChunkMode::Binary).into_function().unwrap_err();
    assert!(matches!(err, LuaError::Syntax(_)), "{err}");

    let g = vm.load(bytes.as_slice()).into_function().unwrap();
    assert_eq!(g.call::<_, i64>(()).unwrap(), 1);
}

#[test]
fn test_stream_source_skips_bom() {
    let vm = LuaVM::new().unwrap();
    let stream = Cursor::new(b"\xEF\xBB\xBFreturn 'bom'".to_vec());
    let s: String = vm.load(ChunkSource::Stream(Box::new(stream))).eval().unwrap();
    assert_eq!(s, "bom");

    let big = format!("return {}", "1 + ".repeat(5000) + "1");
    let n: i64 = vm
        .load(ChunkSource::Stream(Box::new(Cursor::new(big.into_bytes()))))
        .eval()
        .unwrap();
    assert_eq!(n, 5001);
}

#[test]
fn test_pull_source() {
    let vm = LuaVM::new().unwrap();
    let mut pieces = vec!["return ", "", "1 ", "+ 2"].into_iter();
    let source = ChunkSource::Pull(Box::new(move || -> io::Result<Option<Vec<u8>>> {
        Ok(pieces.next().map(|piece| piece.as_bytes().to_vec()))
    }));
    assert_eq!(vm.load(source).eval::<i64>().unwrap(), 3);
}

#[test]
fn test_reader_error_surfaces() {
    let vm = LuaVM::new().unwrap();
    let source = ChunkSource::Pull(Box::new(|| -> io::Result<Option<Vec<u8>>> {
        Err(io::Error::other("disk gone"))
    }));
    let err = vm.load(source).exec().unwrap_err();
    match err {
        LuaError::Io(io) => assert_eq!(io.to_string(), "disk gone"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(vm.evaluate::<i64>("return 1").unwrap(), 1);
}

#[test]
fn test_default_chunk_names() {
    let vm = LuaVM::new().unwrap();
    let err = vm.load(b"error('x')".as_slice()).exec().unwrap_err();
    assert!(err.to_string().contains("(bytes):1:"), "{err}");

    let err = vm.execute("error('y')").unwrap_err();
    assert!(err.to_string().contains("[string \"error('y')\"]:1:"), "{err}");

    assert!(matches!(
        vm.load("return 1").set_name("bad\0name").exec(),
        Err(LuaError::Argument(_))
    ));
}

#[test]
fn test_load_file() {
    let vm = LuaVM::new().unwrap();
    let path = std::env::temp_dir().join(format!("luahost-chunk-{}.lua", std::process::id()));
    std::fs::write(&path, "#!/usr/bin/env lua\nreturn ...\n").unwrap();

    let chunk = vm.load_file(&path).unwrap();
    let s: String = chunk.call("from file").unwrap();
    assert_eq!(s, "from file");

    std::fs::write(&path, "\nerror('line two')").unwrap();
    let err = vm.load_file(&path).unwrap().exec().unwrap_err();
    assert!(err.to_string().contains(":2: line two"), "{err}");

    std::fs::remove_file(&path).unwrap();
    assert!(matches!(vm.load_file(&path), Err(LuaError::Io(_))));
}
