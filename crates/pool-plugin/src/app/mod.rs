//! Application module
//!
//! Main application structure and lifecycle management.

pub mod builder;
pub mod core;
pub mod tasks;

pub use builder::ApplicationBuilder;
pub use self::core::Application;
pub use self::core::ApplicationServices;
