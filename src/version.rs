// Centralized version information

// BUILD_NUMBER is exported by build.rs ("-dev" unless set at build time)
pub const VERSION: &str = concat!("v0.1", env!("BUILD_NUMBER"));

// Cargo package version from Cargo.toml
pub const CARGO_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn full_version() -> String {
    format!("{} ({})", VERSION, CARGO_VERSION)
}
