//! JIT configuration types.

/// Configuration for a compile-and-link run.
#[derive(Debug, Clone, Default)]
pub struct JitConfig {
    /// Print `[JIT]` diagnostics while compiling and linking.
    pub trace_jit: bool,
}
