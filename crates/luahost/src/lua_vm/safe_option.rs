use crate::lib_registry::LuaLibrary;

/// Creation-time settings of an interpreter state.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SafeOption {
    /// Hard ceiling on the number of stack slots a single call may hold.
    /// `LuaStack::ensure_free_capacity` refuses to grow past it.
    pub max_stack_size: usize,
    /// Maximum memory the interpreter may allocate, in bytes. `0` disables
    /// the limit.
    pub max_memory_limit: usize,
    /// Released reference records kept per reference kind for reuse.
    pub ref_pool_capacity: usize,
    /// Panic contexts kept for reuse by protected calls.
    pub panic_context_pool_capacity: usize,
    /// Standard libraries opened at creation.
    pub libraries: Vec<LuaLibrary>,
    /// Append a stack traceback to runtime error messages of protected calls.
    pub traceback: bool,
}

impl Default for SafeOption {
    fn default() -> Self {
        Self {
            max_stack_size: 1000000, // LUAI_MAXSTACK
            max_memory_limit: 0,
            ref_pool_capacity: 64,
            panic_context_pool_capacity: 8,
            libraries: LuaLibrary::ALL.to_vec(),
            traceback: false,
        }
    }
}

impl SafeOption {
    /// No standard library is opened; the state starts with an empty global
    /// table.
    pub fn bare() -> Self {
        Self {
            libraries: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.max_memory_limit = bytes;
        self
    }

    pub fn with_libraries(mut self, libraries: &[LuaLibrary]) -> Self {
        self.libraries = libraries.to_vec();
        self
    }

    pub fn with_traceback(mut self, traceback: bool) -> Self {
        self.traceback = traceback;
        self
    }
}
