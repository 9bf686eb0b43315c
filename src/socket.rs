//! Raw socket plumbing shared by every [`crate::Cep`]: non-blocking
//! send/recv error classification, buffer-size sockopts and `TCP_SYNCNT`,
//! and a best-effort interface-name lookup used only for diagnostic logging.

use std::{
    io::{self, Read, Write},
    net::SocketAddr,
    os::fd::AsRawFd,
};

use mio::net::TcpStream;

/// Outcome of a single non-blocking `send`/`recv` attempt.
#[derive(Debug)]
pub enum IoOutcome {
    /// `n` bytes were transferred; may be less than requested.
    Progress(usize),
    /// The kernel has no room (send) or no data (recv) right now.
    WouldBlock,
    /// The peer reset the connection (`ECONNRESET`) or closed cleanly
    /// (`read` returned `0`).
    PeerReset,
    /// Any other I/O error, passed through unchanged.
    Other(io::Error),
}

/// Classifies a failed/partial `read`/`write` result the way the CEP's
/// send/recv progress loops need: `WouldBlock` keeps the operation pending,
/// `PeerReset` tears the endpoint down, anything else is a generic failure.
fn classify(err: &io::Error) -> IoOutcome {
    match err.kind() {
        io::ErrorKind::WouldBlock => IoOutcome::WouldBlock,
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => IoOutcome::PeerReset,
        _ => IoOutcome::Other(io::Error::new(err.kind(), err.to_string())),
    }
}

/// Non-blocking `write` of `buf` to `stream`.
pub fn send_nb(stream: &mut TcpStream, buf: &[u8]) -> IoOutcome {
    match stream.write(buf) {
        Ok(n) => IoOutcome::Progress(n),
        Err(ref err) => classify(err),
    }
}

/// Non-blocking `read` into `buf` from `stream`. A `0`-byte read is reported
/// as [`IoOutcome::PeerReset`] (matching a clean FIN from the peer) rather
/// than `Progress(0)`, since `Progress(0)` would otherwise loop forever in
/// recv-progress code that keeps calling until it sees `WouldBlock`.
pub fn recv_nb(stream: &mut TcpStream, buf: &mut [u8]) -> IoOutcome {
    match stream.read(buf) {
        Ok(0) => IoOutcome::PeerReset,
        Ok(n) => IoOutcome::Progress(n),
        Err(ref err) => classify(err),
    }
}

/// Sets `SO_SNDBUF`/`SO_RCVBUF` on `stream`. Best-effort: failures are not
/// fatal to the connection, only logged by the caller.
pub fn set_socket_buf_size(stream: &TcpStream, sndbuf: usize, rcvbuf: usize) -> io::Result<()> {
    let fd = stream.as_raw_fd();
    set_sockopt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, sndbuf as libc::c_int)?;
    set_sockopt(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, rcvbuf as libc::c_int)?;
    Ok(())
}

/// Sets Linux `TCP_SYNCNT` on a not-yet-connected stream, capping the number
/// of `SYN` retransmits a client connect attempt performs before giving up.
/// No-op (returns `Ok`) on platforms without this sockopt.
#[cfg(target_os = "linux")]
pub fn set_syn_cnt(stream: &TcpStream, syn_cnt: i32) -> io::Result<()> {
    let fd = stream.as_raw_fd();
    set_sockopt(fd, libc::IPPROTO_TCP, libc::TCP_SYNCNT, syn_cnt)
}

#[cfg(not(target_os = "linux"))]
pub fn set_syn_cnt(_stream: &TcpStream, _syn_cnt: i32) -> io::Result<()> {
    Ok(())
}

fn set_sockopt(fd: i32, level: i32, name: i32, value: libc::c_int) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            std::ptr::addr_of!(value).cast::<libc::c_void>(),
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
}

/// Best-effort name of the local interface carrying `local_addr`, used only
/// to enrich diagnostic log lines (never part of any invariant). Returns
/// `None` if no match is found or the lookup fails.
pub fn ifname_for_addr(local_addr: SocketAddr) -> Option<String> {
    let target_ip = local_addr.ip();
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&raw mut head) } != 0 {
        return None;
    }

    let mut found = None;
    let mut cur = head;
    while !cur.is_null() {
        let ifa = unsafe { &*cur };
        if !ifa.ifa_addr.is_null() {
            if let Some(ip) = sockaddr_to_ip(ifa.ifa_addr) {
                if ip == target_ip {
                    let name = unsafe { std::ffi::CStr::from_ptr(ifa.ifa_name) };
                    found = Some(name.to_string_lossy().into_owned());
                    break;
                }
            }
        }
        cur = ifa.ifa_next;
    }

    unsafe { libc::freeifaddrs(head) };
    found
}

fn sockaddr_to_ip(addr: *const libc::sockaddr) -> Option<std::net::IpAddr> {
    unsafe {
        match (*addr).sa_family as i32 {
            libc::AF_INET => {
                let sin = addr.cast::<libc::sockaddr_in>();
                let octets = (*sin).sin_addr.s_addr.to_ne_bytes();
                Some(std::net::IpAddr::from(octets))
            }
            libc::AF_INET6 => {
                let sin6 = addr.cast::<libc::sockaddr_in6>();
                Some(std::net::IpAddr::from((*sin6).sin6_addr.s6_addr))
            }
            _ => None,
        }
    }
}
