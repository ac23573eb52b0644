//! Blocking accept loop.
//!
//! Accepts via `accept4` with the nonblocking/cloexec flags already
//! applied, configures socket properties, draws a connection slot plus
//! buffers (and a TLS engine when enabled), and hands the result to a
//! poller round-robin. While the endpoint is paused the loop sleep-polls
//! at one-second granularity.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{FromRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::connection::ConnRef;
use crate::endpoint::Shared;
use crate::error::Error;
use crate::metrics;

pub(crate) fn run_acceptor(shared: Arc<Shared>, listen_fd: RawFd) {
    let mut addr_storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };

    loop {
        while shared.paused() && shared.running() {
            std::thread::sleep(Duration::from_secs(1));
        }
        if !shared.running() {
            break;
        }

        let mut addr_len: libc::socklen_t =
            std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                listen_fd,
                &mut addr_storage as *mut _ as *mut libc::sockaddr,
                &mut addr_len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };

        if fd < 0 {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EMFILE) | Some(libc::ENFILE) => {
                    // Too many open files — back off briefly.
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
                _ => {
                    if shared.running() {
                        metrics::ACCEPT_FAILURES.increment();
                        error!("accept failed: {err}");
                        continue;
                    }
                    break;
                }
            }
        }

        // With deferred accept the unlock traffic is rubbish; never hand
        // it to a handler.
        if shared.config.defer_accept && (shared.paused() || !shared.running()) {
            unsafe { libc::close(fd) };
            continue;
        }
        if !shared.running() || shared.paused() {
            unsafe { libc::close(fd) };
            continue;
        }

        if !set_socket_options(&shared, fd) {
            unsafe { libc::close(fd) };
            continue;
        }

        let Some(poller) = shared.next_poller() else {
            // Start-up race; nothing can poll this socket yet.
            unsafe { libc::close(fd) };
            continue;
        };
        match setup_connection(&shared, fd, poller.id) {
            Ok(conn_ref) => {
                metrics::CONNECTIONS_ACCEPTED.increment();
                poller.register(&shared, conn_ref);
            }
            Err(e) => {
                // setup_connection already closed the fd (the stream owns
                // it as soon as the slot takes it).
                warn!("failed to set up accepted connection: {e}");
            }
        }
    }
    debug!("acceptor exited");
}

/// Apply configured TCP properties. The socket is already nonblocking
/// from `accept4`. Failure closes the socket immediately.
fn set_socket_options(shared: &Arc<Shared>, fd: RawFd) -> bool {
    let config = &shared.config;
    unsafe {
        if config.tcp_nodelay {
            let optval: libc::c_int = 1;
            if libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            ) != 0
            {
                return false;
            }
        }
        if config.so_linger_on && config.so_linger_time >= 0 {
            let linger = libc::linger {
                l_onoff: 1,
                l_linger: config.so_linger_time,
            };
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &linger as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::linger>() as libc::socklen_t,
            ) != 0
            {
                return false;
            }
        }
        let optval: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
    true
}

/// Bind the raw socket to a connection slot with buffers and, when TLS is
/// enabled, a fresh engine. On any failure the socket is closed and the
/// slot released.
fn setup_connection(shared: &Arc<Shared>, fd: RawFd, poller_id: usize) -> crate::error::Result<ConnRef> {
    // The stream owns the fd from here on; dropping it closes the socket.
    let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
    let stream = mio::net::TcpStream::from_std(std_stream);

    let Some(conn_ref) = shared.connections.allocate() else {
        return Err(Error::ConnectionLimitReached);
    };
    let slot = shared
        .connections
        .slot(conn_ref)
        .expect("freshly allocated slot");

    let buffers = match shared.buffers.poll() {
        Some(pair) => pair,
        None => {
            match crate::buffer::BufferPair::new(
                shared.config.read_buffer_size,
                shared.config.write_buffer_size,
            ) {
                Ok(pair) => pair,
                Err(e) => {
                    shared.on_oom();
                    shared.connections.release(conn_ref);
                    return Err(e);
                }
            }
        }
    };

    let tls_engine = match shared.tls.read().as_ref() {
        Some(ctx) => match ctx.new_engine() {
            Ok(engine) => Some(engine),
            Err(e) => {
                shared.buffers.offer(buffers);
                shared.connections.release(conn_ref);
                return Err(e);
            }
        },
        None => None,
    };

    let mut conn = slot.state.lock();
    conn.reset(
        shared.config.effective_keep_alive_timeout(),
        shared.config.max_keep_alive_requests,
    );
    conn.poller_id = poller_id;
    conn.stream = Some(stream);
    conn.buffers = Some(buffers);
    conn.tls = tls_engine;
    Ok(conn_ref)
}

/// Decode a `sockaddr_storage` filled by `accept4`/`getsockname`. Plain
/// OS-struct unpacking — network byte order into the std address types —
/// with unknown families mapped to `None`.
pub(crate) fn sockaddr_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET => {
            let v4 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr))),
                u16::from_be(v4.sin_port),
            ))
        }
        libc::AF_INET6 => {
            let v6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(v6.sin6_addr.s6_addr)),
                u16::from_be(v6.sin6_port),
            ))
        }
        _ => None,
    }
}

/// The inverse packing, used when binding the listener; returns the
/// effective sockaddr length.
pub(crate) fn socket_addr_to_sockaddr(
    addr: SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> libc::socklen_t {
    match addr {
        SocketAddr::V4(addr) => {
            let v4 = unsafe { &mut *(storage as *mut _ as *mut libc::sockaddr_in) };
            v4.sin_family = libc::AF_INET as libc::sa_family_t;
            v4.sin_port = addr.port().to_be();
            v4.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(addr) => {
            let v6 = unsafe { &mut *(storage as *mut _ as *mut libc::sockaddr_in6) };
            v6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            v6.sin6_port = addr.port().to_be();
            v6.sin6_addr.s6_addr = addr.ip().octets();
            v6.sin6_flowinfo = addr.flowinfo();
            v6.sin6_scope_id = addr.scope_id();
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}
