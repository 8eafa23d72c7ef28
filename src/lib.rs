//! A Modbus/TCP server that keeps its register banks in POSIX shared memory.
//!
//! Other processes on the same host map the segments directly; this crate is
//! the wire-protocol bridge. It terminates client connections, parses Modbus
//! ADUs, services register reads and writes against the mapped banks, and
//! signals interested processes whenever a write command is executed.
//!
//! # Architecture
//!
//! * [`server::ServerLoop`]: single-threaded poll loop over the listening
//!   socket, the open client sockets and a termination file descriptor
//! * [`server::BankDirectory`]: maps all 256 unit ids to a register bank
//! * [`shm::SharedBank`]: four shared-memory register arrays per bank
//! * [`sem::AccessSemaphore`]: optional named semaphore serializing register
//!   access with external processes
//! * [`notify::Notifier`]: set of PIDs that receive `SIGUSR1` (with the
//!   function code as payload) on every write command
//!
//! The Modbus framing and function-code handling live in [`frame`],
//! [`function`] and the `server` submodules; everything is synchronous and
//! runs on one OS thread.

/// command line surface
pub mod cli;
/// public constant values related to the Modbus specification
pub mod constants;
/// protocol decoding output for monitor mode
pub mod decode;
/// error types for framing and request parsing
pub mod error;
/// Modbus exception codes
pub mod exception;
/// MBAP framing: parser, reader and reply writer
pub mod frame;
/// Modbus function codes
pub mod function;
/// tracing setup
pub mod logging;
/// listener construction and address formatting
pub mod net;
/// write-notification signaling
pub mod notify;
/// cross-process named semaphore
pub mod sem;
/// poll loop, connection table and request execution
pub mod server;
/// shared-memory register banks
pub mod shm;
/// termination-signal routing
pub mod signal;
/// types used in requests and responses
pub mod types;
