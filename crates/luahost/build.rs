// Builds the vendored Lua 5.4 interpreter and links it statically.
//
// The interpreter is compiled as C, so its error protocol is setjmp/longjmp.
// Every Rust frame a longjmp can cross is kept free of pending destructors by
// the panic bridge in `lua_vm::panic_bridge`.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    lua_src::Build::new()
        .build(lua_src::Lua54)
        .print_cargo_metadata();
}
