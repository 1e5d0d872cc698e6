pub mod process;
pub mod proxy;
pub mod supervisor;

pub use process::{EngineBackend, EngineProcess, InstrumentsBackend};
pub use proxy::{CommandProxy, ConnectionState, UnixSocketProxy};
pub use supervisor::{ExitWatch, ProcessStatus, Supervisor};
