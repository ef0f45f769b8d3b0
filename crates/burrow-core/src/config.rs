use std::env;

// EngineConfig — Debug/test switches of an Engine
//
//   check_memory_leaks: compare backend buffer counts around every kernel
//   debug:              trace every dispatch and reject NaN outputs
//
// Both default to off. `from_env` reads BURROW_CHECK_LEAKS and BURROW_DEBUG
// so test harnesses can turn them on without code changes.

/// Environment variable enabling kernel leak checks.
pub const CHECK_LEAKS_ENV: &str = "BURROW_CHECK_LEAKS";
/// Environment variable enabling debug mode.
pub const DEBUG_ENV: &str = "BURROW_DEBUG";

/// Configuration of an [`Engine`](crate::Engine).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Fail a kernel with `BackendMemoryLeak` when it leaves unexplained
    /// buffers allocated on the backend.
    pub check_memory_leaks: bool,
    /// Log every dispatch and fail with `NanInKernelOutput` on NaN outputs.
    pub debug: bool,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_leak_checks(mut self, enabled: bool) -> Self {
        self.check_memory_leaks = enabled;
        self
    }

    pub fn with_debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    /// Defaults overridden by `BURROW_CHECK_LEAKS` / `BURROW_DEBUG`.
    pub fn from_env() -> Self {
        EngineConfig {
            check_memory_leaks: env_flag(CHECK_LEAKS_ENV),
            debug: env_flag(DEBUG_ENV),
        }
    }
}

fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    }
}

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}
