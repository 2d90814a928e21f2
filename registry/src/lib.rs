//! uxmirror process registry
//!
//! Supervises named UxPlay receiver processes on the local host:
//! - Resolve the receiver binary from a path or a bare command name
//! - Start one receiver per label, refusing a second live one
//! - Stop receivers (SIGTERM, then SIGKILL after a timeout)
//! - Report liveness by asking the OS, never from cached bookkeeping

mod error;
pub mod registry;
pub mod resolver;

pub use error::{RegistryError, Result};
pub use registry::{
    receiver_command_line, validate_port, InstanceStatus, ProcessRegistry, DEFAULT_STOP_TIMEOUT,
};
pub use resolver::{auto_detect, resolve, DEFAULT_BINARY};
