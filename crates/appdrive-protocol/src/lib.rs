pub mod launch;
pub mod message;
pub mod status;

pub use launch::{AlertPolicy, LaunchConfig, SendKeyStrategy};
pub use message::{CommandResponse, ProxyReply, ProxyRequest};
pub use status::Status;
