//! The tasks a connection runs, one exchange each.

pub mod command;
pub mod handshake;
pub mod prepare;

pub use command::{CancelToken, QueryTask, SimpleCommand, SimpleCommandTask};
pub use handshake::HandshakeTask;
pub use prepare::{ExecuteTask, Param, PrepareTask};
