// Re-export modules for library use
pub mod config;
pub mod monitor;
pub mod session;
