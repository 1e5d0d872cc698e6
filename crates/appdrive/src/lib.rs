//! Drives UI automation sessions for iOS apps through an external
//! instrumentation engine.
//!
//! A [`session::SessionController`] brings a simulator or real device up
//! through an ordered stage pipeline, funnels every command through a
//! serialized [`dispatch::CommandQueue`], resolves native and web view
//! contexts with [`context::ContextEngine`], and tears everything down again
//! on request or when the engine dies.

pub mod config;
pub mod context;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod instruments;
pub mod session;

pub use config::SessionArgs;
pub use error::{DriverError, Result};
