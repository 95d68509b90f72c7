pub mod test_chunk;
pub mod test_coroutine;
pub mod test_errors;
pub mod test_hooks;
pub mod test_library;
pub mod test_refs;
pub mod test_stack;
pub mod test_userdata;
