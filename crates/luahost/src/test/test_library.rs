// Tests for standard libraries and host modules
use crate::*;

#[test]
fn test_standard_libraries_open_by_default() {
    let vm = LuaVM::new().unwrap();
    for library in LuaLibrary::ALL {
        assert!(vm.is_library_open(library.name()), "{library} not open");
    }
    assert_eq!(vm.evaluate::<String>("return string.upper('abc')").unwrap(), "ABC");
    assert_eq!(vm.evaluate::<i64>("return math.max(3, 9)").unwrap(), 9);
}

#[test]
fn test_open_twice_returns_false() {
    let vm = LuaVM::with_options(SafeOption::bare().with_libraries(&[LuaLibrary::Base])).unwrap();
    assert!(!vm.open_library(LuaLibrary::Base).unwrap());
    assert!(vm.open_library(LuaLibrary::Math).unwrap());
    assert!(!vm.open_library(LuaLibrary::Math).unwrap());
    assert_eq!(vm.evaluate::<f64>("return math.floor(2.5)").unwrap(), 2.0);
}

#[test]
fn test_close_library_removes_globals() {
    let vm = LuaVM::new().unwrap();
    assert!(vm.close_library(LuaLibrary::Os).unwrap());
    assert!(!vm.is_library_open("os"));
    assert!(vm.evaluate::<bool>("return os == nil and package.loaded.os == nil").unwrap());
    assert!(!vm.close_library(LuaLibrary::Os).unwrap());

    assert!(vm.open_library(LuaLibrary::Os).unwrap());
    assert!(vm.evaluate::<bool>("return type(os.time) == 'function'").unwrap());
}

#[test]
fn test_close_base_library() {
    let vm = LuaVM::new().unwrap();
    assert!(vm.close_library(LuaLibrary::Base).unwrap());
    let globals = vm.globals().unwrap();
    assert_eq!(globals.get::<_, Option<LuaFunctionRef>>("print").unwrap(), None);
    assert_eq!(globals.get::<_, Option<LuaFunctionRef>>("pcall").unwrap(), None);
    // Other libraries are untouched.
    assert!(globals.contains_key("string").unwrap());
}

// ==================== Host modules ====================

#[test]
fn test_open_module() {
    let vm = LuaVM::new().unwrap();
    let module = crate::lib_module!("greet", {
        "hello" => |_: &LuaVM, name: String| Ok(format!("hello {name}")),
        "twice" => |_: &LuaVM, n: i64| Ok(n * 2),
    });
    assert_eq!(module.function_names().collect::<Vec<_>>(), vec!["hello", "twice"]);

    assert!(vm.open_module(&module).unwrap());
    assert!(!vm.open_module(&module).unwrap());
    assert!(vm.is_library_open("greet"));

    assert_eq!(vm.evaluate::<String>("return greet.hello('lua')").unwrap(), "hello lua");
    assert!(vm.evaluate::<bool>("return require('greet') == greet").unwrap());
    assert_eq!(vm.evaluate::<i64>("return require('greet').twice(21)").unwrap(), 42);

    assert!(vm.close_module("greet").unwrap());
    assert!(vm.evaluate::<bool>("return greet == nil and package.loaded.greet == nil").unwrap());
    assert!(!vm.close_module("greet").unwrap());
}

#[test]
fn test_module_into_globals() {
    let vm = LuaVM::new().unwrap();
    let module = LibraryModule::new("_G")
        .with_function("answer", |_, ()| Ok(42))
        .with_raw_function("argc", |_, stack| {
            let n = stack.count();
            stack.push(n)?;
            Ok(1)
        });
    assert!(!vm.open_module(&module).unwrap());

    // `_G` is taken by the base library; a fresh bare state accepts it.
    let bare = LuaVM::with_options(SafeOption::bare()).unwrap();
    assert!(bare.open_module(&module).unwrap());
    assert_eq!(bare.evaluate::<i64>("return answer() + argc(1, 2)").unwrap(), 44);

    assert!(bare.close_module("_G").unwrap());
    assert!(bare.evaluate::<bool>("return answer == nil and argc == nil").unwrap());
}

#[test]
fn test_module_errors_reach_script() {
    let vm = LuaVM::new().unwrap();
    let module = LibraryModule::new("strict")
        .with_function("positive", |_, n: i64| {
            if n > 0 {
                Ok(n)
            } else {
                Err(LuaError::runtime(format!("{n} is not positive")))
            }
        });
    vm.open_module(&module).unwrap();

    let message: String = vm
        .evaluate("local ok, e = pcall(strict.positive, -1) return tostring(e)")
        .unwrap();
    assert_eq!(message, "-1 is not positive");
}
