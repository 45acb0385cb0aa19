// Centralized version information

use clock_core::release::Version;

// Cargo package version from Cargo.toml; this is what the release check
// compares against.
pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The compiled-in version triple.
pub fn current() -> Version {
    Version::parse(FIRMWARE_VERSION).unwrap_or_default()
}

/// Version string for logs and the status endpoint.
pub fn full_version() -> String {
    format!("v{FIRMWARE_VERSION}")
}
