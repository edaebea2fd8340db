//! Thin wrappers over the raw system interface.
//!
//! Everything `unsafe` the engine needs from the OS goes through here:
//! socket setup, non-blocking flag management, and the fork/exec/pipe
//! plumbing the CGI dispatcher is built on.  Callers get `io::Error`-based
//! results and never touch `libc` directly.

use std::ffi::CString;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::ptr;

use libc::{c_int, c_void, socklen_t};

use crate::error::Result;

// ---- Socket flag management ----

/// Put a descriptor into non-blocking mode.  No-op if already set.
pub fn set_ndelay(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let new = flags | libc::O_NONBLOCK;
        if new != flags && libc::fcntl(fd, libc::F_SETFL, new) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Put a descriptor back into blocking mode, for the spans where a
/// sub-process wants every byte written out.
pub fn clear_ndelay(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let new = flags & !libc::O_NONBLOCK;
        if new != flags && libc::fcntl(fd, libc::F_SETFL, new) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Linux copies the close-on-exec flag on dup(2), so a CGI child has to
/// clear it explicitly before exec.
pub fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        if libc::fcntl(fd, libc::F_SETFD, 0) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

// ---- Raw descriptor I/O ----

pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    unsafe {
        let n = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

pub fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    unsafe {
        let n = libc::write(fd, buf.as_ptr() as *const c_void, buf.len());
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

/// Write the whole buffer, retrying on EINTR.  Only valid on blocking
/// descriptors; the interposer processes use it.
pub fn write_fully(fd: RawFd, mut buf: &[u8]) -> io::Result<usize> {
    let mut total = 0;
    while !buf.is_empty() {
        match write_fd(fd, buf) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                buf = &buf[n..];
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

pub fn shutdown_write(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_WR);
    }
}

// ---- Process plumbing ----

pub enum Fork {
    Parent(libc::pid_t),
    Child,
}

pub fn fork() -> io::Result<Fork> {
    unsafe {
        let pid = libc::fork();
        if pid < 0 {
            Err(io::Error::last_os_error())
        } else if pid == 0 {
            Ok(Fork::Child)
        } else {
            Ok(Fork::Parent(pid))
        }
    }
}

/// Plain blocking pipe.  Returns (read end, write end).
pub fn pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok((fds[0], fds[1]))
}

pub fn dup(fd: RawFd) -> io::Result<RawFd> {
    unsafe {
        let new = libc::dup(fd);
        if new < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(new)
        }
    }
}

pub fn dup2(old: RawFd, new: RawFd) -> io::Result<()> {
    unsafe {
        if libc::dup2(old, new) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn kill(pid: libc::pid_t, sig: c_int) -> io::Result<()> {
    unsafe {
        if libc::kill(pid, sig) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Non-blocking reap.  Returns the pid if a child exited.
pub fn waitpid_nohang() -> Option<(libc::pid_t, c_int)> {
    unsafe {
        let mut status: c_int = 0;
        let pid = libc::waitpid(-1, &mut status, libc::WNOHANG);
        if pid > 0 { Some((pid, status)) } else { None }
    }
}

pub fn chdir(path: &CString) -> io::Result<()> {
    unsafe {
        if libc::chdir(path.as_ptr()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn default_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

/// exec the binary; only ever returns the error.
pub fn execve(binary: &CString, argv: &[CString], envp: &[CString]) -> io::Error {
    let mut argp: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
    argp.push(ptr::null());
    let mut envc: Vec<*const libc::c_char> = envp.iter().map(|e| e.as_ptr()).collect();
    envc.push(ptr::null());

    unsafe {
        libc::execve(binary.as_ptr(), argp.as_ptr(), envc.as_ptr());
    }
    io::Error::last_os_error()
}

pub fn exit(code: c_int) -> ! {
    unsafe {
        libc::_exit(code);
    }
}

// ---- Listen socket setup ----

/// Create a non-blocking, close-on-exec TCP listen socket with SO_REUSEADDR.
pub fn create_listen_socket(addr: &SocketAddr, backlog: c_int) -> Result<RawFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
                }
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
                }
            }
        }

        if libc::listen(fd, backlog) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Accept one connection.  Ok(None) means the accept queue is drained.
pub fn accept_connection(listen_fd: RawFd) -> Result<Option<(RawFd, SocketAddr)>> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let fd = libc::accept(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        );
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err.into());
        }
        match sockaddr_to_addr(&storage) {
            Some(addr) => Ok(Some((fd, addr))),
            None => {
                log::error!("unknown sockaddr family on accepted socket");
                libc::close(fd);
                Err(io::Error::from(io::ErrorKind::InvalidData).into())
            }
        }
    }
}

/// Our side of the socket, for vhost fallback naming.
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error());
        }
        sockaddr_to_addr(&storage).ok_or_else(|| io::Error::from(io::ErrorKind::InvalidData))
    }
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(
                IpAddr::V6(ip),
                u16::from_be(sin6.sin6_port),
            ))
        }
        _ => None,
    }
}

/// Numeric client address with the `::ffff:` prefix elided for mapped IPv4.
pub fn ntoa(addr: &SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        IpAddr::V4(v4) => v4.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ndelay_roundtrip() {
        let (r, _w) = pipe().unwrap();
        set_ndelay(r).unwrap();
        let mut buf = [0u8; 1];
        let err = read_fd(r, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        clear_ndelay(r).unwrap();
        unsafe {
            let flags = libc::fcntl(r, libc::F_GETFL, 0);
            assert_eq!(flags & libc::O_NONBLOCK, 0);
        }
    }

    #[test]
    fn ntoa_elides_mapped_prefix() {
        let v6: SocketAddr = "[::ffff:10.0.0.1]:80".parse().unwrap();
        assert_eq!(ntoa(&v6), "10.0.0.1");
        let v4: SocketAddr = "192.168.1.2:80".parse().unwrap();
        assert_eq!(ntoa(&v4), "192.168.1.2");
    }
}
