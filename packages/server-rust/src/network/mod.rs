//! SCGI networking: configuration, framing, connection handling, collection and shutdown control.

pub mod codec;
pub mod config;
pub mod connection;
pub mod handler;
pub mod listener;
pub mod processor;
pub mod shutdown;
pub mod signals;

pub use config::*;
pub use connection::*;
pub use handler::{ConnectionContext, Outcome};
pub use processor::Processor;
pub use shutdown::*;
pub use signals::{handle_signals, status_report, ControlSignal, InFlightConnection, StatusReport};
