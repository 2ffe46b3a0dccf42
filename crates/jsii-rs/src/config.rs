//! Centralized configuration for the jsii host runtime.
//!
//! Constants governing kernel discovery, wire limits, and object handle
//! allocation. Runtime overrides go through [`crate::process::KernelSpec`].

use std::time::Duration;

/// Kernel process configuration.
pub struct KernelConfig;

impl KernelConfig {
    /// Environment variable holding the path of the kernel executable.
    pub const RUNTIME_ENV_VAR: &'static str = "JSII_RUNTIME";

    /// Executable name searched on `PATH` when the override is unset.
    pub const RUNTIME_EXECUTABLE: &'static str = "jsii-runtime";

    /// Environment variable enabling kernel trace mirroring.
    ///
    /// Any non-empty value other than `"0"` and case-insensitive `"false"`
    /// enables tracing; the flag is re-exported to the child as `1`.
    pub const DEBUG_ENV_VAR: &'static str = "JSII_DEBUG";

    /// Kernel version this client was built against.
    pub const RUNTIME_VERSION: &'static str = env!("CARGO_PKG_VERSION");

    /// Grace period between closing the kernel's stdin and killing it.
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

    /// Extra wait after a kill request before giving up on the exit status.
    pub const KILL_WAIT: Duration = Duration::from_secs(2);

    /// Trailing stderr lines retained for crash reports.
    pub const STDERR_TAIL_LINES: usize = 200;
}

/// Wire-level configuration.
pub struct WireConfig;

impl WireConfig {
    /// Maximum accepted length of a single response line.
    pub const MAX_RESPONSE_LINE_BYTES: usize = 16 * 1024 * 1024;
}

/// Object registry configuration.
pub struct RegistryConfig;

impl RegistryConfig {
    /// Prefix of synthetic handles minted for host-originated objects.
    ///
    /// Kernel-minted handles never use this prefix, so it doubles as the
    /// discriminator between the two handle spaces.
    pub const HOST_HANDLE_PREFIX: &'static str = "jsii@";
}
