use std::collections::HashMap;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use thiserror::Error;

use crate::decode::DecodeLevel;
use crate::frame::{FramedReader, FrameWriter};
use crate::net;
use crate::notify::{Notifier, NotifyError};
use crate::sem::AccessSemaphore;
use crate::signal::{TermEvent, TermFd};

mod exchange;
mod handler;
mod map;
mod request;
mod response;

pub use handler::RequestHandler;
pub use map::{BankDirectory, DirectoryError, MAX_UNIT_IDS};

use exchange::Exchange;

/// Tunables of the server loop
#[derive(Clone, Debug)]
pub struct ServerSettings {
    /// maximum number of simultaneous client connections
    pub max_clients: usize,
    /// keep running after the last client disconnects
    pub reconnect: bool,
    /// TCP keepalive/user timeout in seconds; 0 leaves the OS defaults
    pub tcp_timeout: u64,
    /// receive timeout once a frame is partially read
    pub byte_timeout: Duration,
    /// send timeout for reply frames
    pub response_timeout: Duration,
    /// frame decoding verbosity (monitor mode)
    pub decode: DecodeLevel,
    /// allow processes to register for write notifications via SIGUSR1
    pub allow_register: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_clients: 1,
            reconnect: false,
            tcp_timeout: 5,
            byte_timeout: Duration::from_millis(500),
            response_timeout: Duration::from_millis(500),
            decode: DecodeLevel::nothing(),
            allow_register: false,
        }
    }
}

/// Fatal server-side errors; per-connection faults are handled internally
#[derive(Debug, Error)]
pub enum ServerError {
    /// OS-level failure on one of the server's own file descriptors
    #[error("failed to {op}: {source}")]
    Os {
        /// operation that failed
        op: &'static str,
        /// underlying errno
        source: Errno,
    },

    /// I/O failure on the listening socket
    #[error("failed to {op}: {source}")]
    Io {
        /// operation that failed
        op: &'static str,
        /// underlying error
        source: std::io::Error,
    },

    /// poll reported a state that is impossible for a correctly managed fd
    #[error("{0}")]
    Logic(String),

    /// delivering a write notification failed with a system error
    #[error("write notification failed: {0}")]
    Notify(#[from] NotifyError),
}

/// Outcome of one multiplex round
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// normal progress, call again
    Ok,
    /// the wait expired with nothing ready
    Timeout,
    /// the wait was aborted by a benign condition
    Interrupted,
    /// a termination signal arrived
    TermSignal,
    /// the last client disconnected and reconnect is disabled
    NoConnections,
    /// the cross-process semaphore is persistently unavailable
    SemaphoreFailure,
}

struct Connection {
    stream: TcpStream,
    peer: String,
}

#[derive(Clone, Copy)]
enum Slot {
    Term,
    Listener,
    Client(RawFd),
}

/// The event-driven Modbus/TCP server.
///
/// Owns the listening socket, the open client sockets and the termination
/// fd, and multiplexes them with a single poll per cycle. The listening
/// socket is only polled while there is room for another client.
pub struct ServerLoop {
    listener: TcpListener,
    term: TermFd,
    connections: HashMap<RawFd, Connection>,
    directory: BankDirectory,
    semaphore: Option<AccessSemaphore>,
    notifier: Notifier,
    reader: FramedReader,
    writer: FrameWriter,
    settings: ServerSettings,
}

impl ServerLoop {
    pub fn new(
        listener: TcpListener,
        term: TermFd,
        directory: BankDirectory,
        notifier: Notifier,
        settings: ServerSettings,
    ) -> Self {
        Self {
            listener,
            term,
            connections: HashMap::new(),
            directory,
            semaphore: None,
            notifier,
            reader: FramedReader::new(settings.decode),
            writer: FrameWriter::new(settings.decode),
            settings,
        }
    }

    /// Serialize register access with external processes through a named
    /// semaphore
    pub fn set_semaphore(&mut self, semaphore: AccessSemaphore) {
        self.semaphore = Some(semaphore);
    }

    /// The address the server is listening on, formatted for the log
    pub fn listen_addr(&self) -> Result<String, Errno> {
        net::local_string(&self.listener)
    }

    /// Number of currently open client connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Advance the server by one multiplex round.
    ///
    /// Waits on the termination fd, the listening socket (while below
    /// capacity) and every open client socket, then dispatches whatever
    /// became ready.
    pub fn run_cycle(&mut self, timeout: PollTimeout) -> Result<RunOutcome, ServerError> {
        let events: Vec<(Slot, PollFlags)> = {
            let poll_listener = self.connections.len() < self.settings.max_clients;
            let capacity = self.connections.len() + 2;
            let mut slots = Vec::with_capacity(capacity);
            let mut fds = Vec::with_capacity(capacity);

            slots.push(Slot::Term);
            fds.push(PollFd::new(self.term.as_fd(), PollFlags::POLLIN));

            if poll_listener {
                slots.push(Slot::Listener);
                fds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
            }

            for (fd, connection) in &self.connections {
                slots.push(Slot::Client(*fd));
                fds.push(PollFd::new(connection.stream.as_fd(), PollFlags::POLLIN));
            }

            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(RunOutcome::Timeout),
                Ok(_) => {}
                Err(Errno::EINTR) => return Ok(RunOutcome::Interrupted),
                Err(errno) => {
                    return Err(ServerError::Os {
                        op: "poll sockets",
                        source: errno,
                    })
                }
            }

            slots
                .iter()
                .zip(&fds)
                .map(|(slot, fd)| (*slot, fd.revents().unwrap_or(PollFlags::empty())))
                .collect()
        };

        for (slot, revents) in events {
            if revents.is_empty() {
                continue;
            }
            match slot {
                Slot::Term => return self.handle_termination_fd(revents),
                Slot::Listener => self.handle_listener(revents)?,
                Slot::Client(fd) => {
                    if let Some(outcome) = self.handle_client(fd, revents)? {
                        return Ok(outcome);
                    }
                }
            }
        }

        if !self.settings.reconnect && self.connections.is_empty() {
            return Ok(RunOutcome::NoConnections);
        }

        Ok(RunOutcome::Ok)
    }

    fn handle_termination_fd(&mut self, revents: PollFlags) -> Result<RunOutcome, ServerError> {
        if revents.contains(PollFlags::POLLNVAL) {
            return Err(ServerError::Logic(
                "poll (termination fd) returned POLLNVAL".into(),
            ));
        }
        if revents.contains(PollFlags::POLLERR) {
            return Err(ServerError::Logic(
                "poll (termination fd) returned POLLERR".into(),
            ));
        }
        if revents.contains(PollFlags::POLLHUP) {
            return Err(ServerError::Logic(
                "poll (termination fd) returned POLLHUP".into(),
            ));
        }
        if !revents.contains(PollFlags::POLLIN) {
            return Err(ServerError::Logic(format!(
                "poll (termination fd) returned unknown revent: {revents:?}"
            )));
        }

        let event = self.term.read_event().map_err(|errno| ServerError::Os {
            op: "read termination fd",
            source: errno,
        })?;

        match event {
            TermEvent::Register(pid) if self.settings.allow_register => {
                match self.notifier.add(pid) {
                    Ok(()) => {
                        tracing::info!("process {pid} registered for SIGUSR1 on write commands");
                    }
                    Err(err) => {
                        tracing::warn!("process {pid} could not be registered: {err}");
                    }
                }
                Ok(RunOutcome::Ok)
            }
            _ => Ok(RunOutcome::TermSignal),
        }
    }

    fn handle_listener(&mut self, revents: PollFlags) -> Result<(), ServerError> {
        if revents.contains(PollFlags::POLLNVAL) {
            return Err(ServerError::Logic(
                "poll (listening socket) returned POLLNVAL".into(),
            ));
        }
        if revents.contains(PollFlags::POLLHUP) {
            return Err(ServerError::Logic(
                "poll (listening socket) returned POLLHUP".into(),
            ));
        }
        if !revents.intersects(PollFlags::POLLIN | PollFlags::POLLERR) {
            return Err(ServerError::Logic(format!(
                "poll (listening socket) returned unknown revent: {revents:?}"
            )));
        }

        let (stream, _) = self.listener.accept().map_err(|source| ServerError::Io {
            op: "accept connection",
            source,
        })?;

        net::configure_keepalive(&stream, self.settings.tcp_timeout).map_err(|errno| {
            ServerError::Os {
                op: "set keepalive options",
                source: errno,
            }
        })?;
        net::set_socket_timeouts(
            &stream,
            self.settings.byte_timeout,
            self.settings.response_timeout,
        )
        .map_err(|errno| ServerError::Os {
            op: "set socket timeouts",
            source: errno,
        })?;

        let peer = net::peer_string(&stream).map_err(|errno| ServerError::Os {
            op: "getpeername",
            source: errno,
        })?;

        let fd = stream.as_raw_fd();
        self.connections.insert(fd, Connection { stream, peer });
        let connection = &self.connections[&fd];
        tracing::info!(
            "[{}] Modbus Server ({}) established connection.",
            self.connections.len(),
            connection.peer
        );
        Ok(())
    }

    fn handle_client(
        &mut self,
        fd: RawFd,
        revents: PollFlags,
    ) -> Result<Option<RunOutcome>, ServerError> {
        if revents.contains(PollFlags::POLLNVAL) {
            let peer = self
                .connections
                .get(&fd)
                .map(|c| c.peer.clone())
                .unwrap_or_default();
            return Err(ServerError::Logic(format!(
                "poll (client socket: {peer}) returned POLLNVAL"
            )));
        }

        if revents.contains(PollFlags::POLLHUP) && !revents.contains(PollFlags::POLLERR) {
            self.close_connection(fd);
            return Ok(None);
        }

        if !revents.intersects(PollFlags::POLLIN | PollFlags::POLLERR) {
            return Ok(None);
        }

        let outcome = {
            let connection = match self.connections.get_mut(&fd) {
                Some(connection) => connection,
                None => return Ok(None),
            };
            exchange::run(
                &mut connection.stream,
                &mut self.directory,
                self.semaphore.as_mut(),
                &self.reader,
                &mut self.writer,
            )
        };

        match outcome {
            Exchange::Progress { function } => {
                // notify listeners before the reply hits the wire
                if let Some(function) = function {
                    if function.is_write() {
                        self.notifier.broadcast(function.get_value())?;
                    }
                }

                let write_error = {
                    let connection = match self.connections.get_mut(&fd) {
                        Some(connection) => connection,
                        None => return Ok(None),
                    };
                    connection.stream.write_all(self.writer.reply()).err()
                };
                if let Some(err) = write_error {
                    if let Some(connection) = self.connections.get(&fd) {
                        tracing::error!("failed to send reply to {}: {}", connection.peer, err);
                    }
                    self.close_connection(fd);
                }
                Ok(None)
            }
            Exchange::Closed => {
                self.close_connection(fd);
                Ok(None)
            }
            Exchange::Faulted(err) => {
                if let Some(connection) = self.connections.get(&fd) {
                    tracing::error!("modbus exchange with {} failed: {}", connection.peer, err);
                }
                self.close_connection(fd);
                Ok(None)
            }
            Exchange::SemaphoreExhausted => {
                self.close_connection(fd);
                Ok(Some(RunOutcome::SemaphoreFailure))
            }
        }
    }

    /// Close and forget a client connection; the removal path is the only
    /// owner of the fd
    fn close_connection(&mut self, fd: RawFd) {
        if let Some(connection) = self.connections.remove(&fd) {
            tracing::info!(
                "[{}] Modbus server ({}) connection closed.",
                self.connections.len(),
                connection.peer
            );
        }
    }
}
