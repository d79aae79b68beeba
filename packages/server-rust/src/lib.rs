//! SCGI Server: tokio protocol gateway between a front-end web server and an application handler.

pub mod error;
pub mod network;
pub mod traits;

pub use error::{ConnectionError, ServerError};
pub use network::{Processor, ProcessorConfig, ShutdownController};
pub use traits::{RequestHandler, ScgiRequest, Serialized};
