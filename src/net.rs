use std::ffi::CString;
use std::net::{SocketAddr, SocketAddrV6, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::socket::{
    self, sockopt, AddressFamily, Backlog, SockFlag, SockType, SockaddrIn, SockaddrIn6,
    SockaddrStorage,
};
use nix::sys::time::TimeVal;
use thiserror::Error;

/// Errors establishing the listening socket
#[derive(Debug, Error)]
pub enum NetError {
    /// Service string is neither a port number nor a known service name
    #[error("unknown or invalid service '{service}'")]
    UnknownService {
        /// rejected service string
        service: String,
    },

    /// Host name did not resolve to an address
    #[error("failed to resolve host '{host}'")]
    Resolve {
        /// rejected host string
        host: String,
    },

    /// OS-level socket error
    #[error("failed to {op}: {source}")]
    Os {
        /// operation that failed
        op: &'static str,
        /// underlying errno
        source: Errno,
    },
}

/// Resolve a service name or numeric port string
pub fn resolve_service(service: &str) -> Result<u16, NetError> {
    if let Ok(port) = service.parse::<u16>() {
        return Ok(port);
    }

    let name = CString::new(service).map_err(|_| NetError::UnknownService {
        service: service.to_string(),
    })?;
    let proto = CString::new("tcp").expect("static string");
    let entry = unsafe { libc::getservbyname(name.as_ptr(), proto.as_ptr()) };
    if entry.is_null() {
        return Err(NetError::UnknownService {
            service: service.to_string(),
        });
    }
    // s_port is in network byte order
    Ok(u16::from_be(unsafe { (*entry).s_port } as u16))
}

/// Create the listening socket.
///
/// `host` of `"any"` or the empty string binds the dual-stack wildcard;
/// anything else is resolved through the standard resolver. `tcp_timeout` of
/// zero leaves the OS keepalive defaults in place.
pub fn listen(host: &str, service: &str, tcp_timeout: u64) -> Result<TcpListener, NetError> {
    let port = resolve_service(service)?;

    let addr = if host.is_empty() || host == "any" {
        SocketAddr::V6(SocketAddrV6::new(std::net::Ipv6Addr::UNSPECIFIED, port, 0, 0))
    } else {
        (host, port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| NetError::Resolve {
                host: host.to_string(),
            })?
    };

    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };

    let os = |op: &'static str| move |source: Errno| NetError::Os { op, source };

    let fd = socket::socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)
        .map_err(os("create socket"))?;
    socket::setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(os("set SO_REUSEADDR"))?;

    match addr {
        SocketAddr::V4(v4) => {
            socket::bind(fd.as_raw_fd(), &SockaddrIn::from(v4)).map_err(os("bind"))?;
        }
        SocketAddr::V6(v6) => {
            // wildcard v6 accepts v4 clients as well
            socket::setsockopt(&fd, sockopt::Ipv6V6Only, &false)
                .map_err(os("set IPV6_V6ONLY"))?;
            socket::bind(fd.as_raw_fd(), &SockaddrIn6::from(v6)).map_err(os("bind"))?;
        }
    }

    let backlog = Backlog::new(1).map_err(os("set backlog"))?;
    socket::listen(&fd, backlog).map_err(os("listen"))?;

    let listener = TcpListener::from(fd);
    configure_keepalive(&listener, tcp_timeout).map_err(os("set keepalive options"))?;
    Ok(listener)
}

/// Enable TCP keepalive so dead peers are detected.
///
/// Probing starts after one idle second; up to five probes are sent, at
/// least one second apart; the connection is killed after `tcp_timeout`
/// seconds without acknowledged data.
pub fn configure_keepalive(socket_fd: &impl AsFd, tcp_timeout: u64) -> Result<(), Errno> {
    socket::setsockopt(socket_fd, sockopt::KeepAlive, &true)?;
    if tcp_timeout == 0 {
        return Ok(());
    }

    socket::setsockopt(
        socket_fd,
        sockopt::TcpUserTimeout,
        &((tcp_timeout * 1000) as u32),
    )?;
    socket::setsockopt(socket_fd, sockopt::TcpKeepIdle, &1u32)?;
    socket::setsockopt(
        socket_fd,
        sockopt::TcpKeepInterval,
        &((tcp_timeout / 5).max(1) as u32),
    )?;
    socket::setsockopt(socket_fd, sockopt::TcpKeepCount, &(tcp_timeout.min(5) as u32))?;
    Ok(())
}

/// Bound the time a partially received frame or a stalled reply may block a
/// cycle. `byte_timeout` limits each read once a frame is partially
/// received; `response_timeout` limits writing the reply.
pub fn set_socket_timeouts(
    stream: &TcpStream,
    byte_timeout: Duration,
    response_timeout: Duration,
) -> Result<(), Errno> {
    if !byte_timeout.is_zero() {
        socket::setsockopt(stream, sockopt::ReceiveTimeout, &to_timeval(byte_timeout))?;
    }
    if !response_timeout.is_zero() {
        socket::setsockopt(stream, sockopt::SendTimeout, &to_timeval(response_timeout))?;
    }
    Ok(())
}

fn to_timeval(timeout: Duration) -> TimeVal {
    TimeVal::new(
        timeout.as_secs() as libc::time_t,
        timeout.subsec_micros() as libc::suseconds_t,
    )
}

/// The peer address of a connected socket, formatted for the log
pub fn peer_string(stream: &TcpStream) -> Result<String, Errno> {
    let addr: SockaddrStorage = socket::getpeername(stream.as_raw_fd())?;
    Ok(sockaddr_to_string(&addr))
}

/// The local address of the listening socket, formatted for the log
pub fn local_string(listener: &TcpListener) -> Result<String, Errno> {
    let addr: SockaddrStorage = socket::getsockname(listener.as_raw_fd())?;
    Ok(sockaddr_to_string(&addr))
}

/// `A.B.C.D:port` for IPv4, `[h:…:h]:port` for IPv6, `UNKNOWN:0` otherwise
pub fn sockaddr_to_string(addr: &SockaddrStorage) -> String {
    if let Some(v4) = addr.as_sockaddr_in() {
        format!("{}:{}", v4.ip(), v4.port())
    } else if let Some(v6) = addr.as_sockaddr_in6() {
        format!("[{}]:{}", v6.ip(), v6.port())
    } else {
        "UNKNOWN:0".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddrV4;

    #[test]
    fn numeric_service_resolves_directly() {
        assert_eq!(resolve_service("502").unwrap(), 502);
        assert_eq!(resolve_service("65535").unwrap(), 65535);
    }

    #[test]
    fn bogus_service_name_is_rejected() {
        assert!(matches!(
            resolve_service("no-such-service-whatsoever"),
            Err(NetError::UnknownService { .. })
        ));
    }

    #[test]
    fn formats_v4_and_v6_addresses() {
        let v4 = SockaddrStorage::from(SocketAddrV4::new("10.11.12.13".parse().unwrap(), 502));
        assert_eq!(sockaddr_to_string(&v4), "10.11.12.13:502");

        let v6 = SockaddrStorage::from(SocketAddrV6::new("::1".parse().unwrap(), 1502, 0, 0));
        assert_eq!(sockaddr_to_string(&v6), "[::1]:1502");
    }

    #[test]
    fn listens_on_an_ephemeral_port() {
        let listener = listen("127.0.0.1", "0", 5).unwrap();
        let rendered = local_string(&listener).unwrap();
        let bound = listener.local_addr().unwrap();
        assert_eq!(rendered, format!("127.0.0.1:{}", bound.port()));
    }

    #[test]
    fn wildcard_host_binds_dual_stack() {
        let listener = listen("any", "0", 0).unwrap();
        let rendered = local_string(&listener).unwrap();
        assert!(rendered.starts_with("[::]:"), "got {rendered}");
    }
}
