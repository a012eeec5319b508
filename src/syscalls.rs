// src/syscalls.rs
//
// Thin wrappers over the raw socket/epoll surface the reactor needs. All the
// unsafe lives here; everything above works with owned types and Results.
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ptr;
use std::sync::Arc;

use libc::{c_int, c_void, socklen_t};

use crate::error::Result;

pub use libc::{epoll_event, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

/// Close a descriptor, ignoring the result. Used on teardown paths where
/// there is nothing useful to do with a close error.
pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Listening socket ----

/// Nonblocking listening socket with SO_REUSEADDR + SO_REUSEPORT, so every
/// worker can bind the same port and the kernel load-balances accepts across
/// them. Owns the descriptor; closed on drop.
pub struct ListenSocket {
    fd: c_int,
}

impl ListenSocket {
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };

        unsafe {
            let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            let sock = Self { fd };

            let one: c_int = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const c_void,
                mem::size_of_val(&one) as socklen_t,
            );
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &one as *const _ as *const c_void,
                mem::size_of_val(&one) as socklen_t,
            ) < 0
            {
                return Err(io::Error::last_os_error().into());
            }

            bind_addr(fd, &addr)?;

            if libc::listen(fd, libc::SOMAXCONN) < 0 {
                return Err(io::Error::last_os_error().into());
            }

            Ok(sock)
        }
    }

    #[inline]
    pub fn fd(&self) -> c_int {
        self.fd
    }

    /// The bound address; lets callers bind port 0 and discover the port the
    /// kernel picked.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        unsafe {
            let mut storage: libc::sockaddr_storage = mem::zeroed();
            let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
            if libc::getsockname(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
                < 0
            {
                return Err(io::Error::last_os_error().into());
            }
            storage_to_addr(&storage)
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "unknown address family").into())
        }
    }

    /// Accept one pending connection, nonblocking on the accepted socket as
    /// well. `None` means the accept queue is drained.
    pub fn accept(&self) -> Result<Option<(c_int, SocketAddr)>> {
        unsafe {
            let mut storage: libc::sockaddr_storage = mem::zeroed();
            let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
            let fd = libc::accept4(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK,
            );
            if fd < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return Ok(None);
                }
                return Err(err.into());
            }
            let peer = storage_to_addr(&storage).unwrap_or_else(|| {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
            });
            Ok(Some((fd, peer)))
        }
    }
}

impl Drop for ListenSocket {
    fn drop(&mut self) {
        unsafe {
            libc::shutdown(self.fd, libc::SHUT_RDWR);
            libc::close(self.fd);
        }
    }
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> Result<()> {
    unsafe {
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
                    return Err(io::Error::last_os_error().into());
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
                    return Err(io::Error::last_os_error().into());
                }
            }
        }
        Ok(())
    }
}

fn storage_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

// ---- Epoll ----

/// Level-triggered epoll instance. The reactor's interest handling relies on
/// a still-ready descriptor being reported again on the next wait, so edge
/// triggering must not be enabled here. Event tokens carry the descriptor
/// value itself.
pub struct Epoll {
    fd: c_int,
}

impl Epoll {
    pub fn new() -> Result<Self> {
        unsafe {
            let fd = libc::epoll_create1(0);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    pub fn add(&self, fd: c_int, interests: i32) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interests)
    }

    pub fn modify(&self, fd: c_int, interests: i32) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interests)
    }

    fn ctl(&self, op: c_int, fd: c_int, interests: i32) -> Result<()> {
        let mut event = epoll_event {
            events: interests as u32,
            u64: fd as u64,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: c_int) -> Result<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Wait for readiness events. A negative timeout blocks indefinitely.
    /// An interrupted wait reports zero events so the caller re-checks its
    /// stop flag.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> Result<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }
            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Nonblocking transfers ----

/// Receive into `buf`. `Ok(None)` means the socket has no data right now;
/// `Ok(Some(0))` means the peer closed its end.
pub fn recv_nonblocking(fd: c_int, buf: &mut [u8]) -> Result<Option<usize>> {
    unsafe {
        let res = libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err.into());
        }
        Ok(Some(res as usize))
    }
}

/// Send as much of `buf` as the socket accepts. `Ok(None)` means the send
/// buffer is full right now. MSG_NOSIGNAL keeps a dead peer from raising
/// SIGPIPE at the process.
pub fn send_nonblocking(fd: c_int, buf: &[u8]) -> Result<Option<usize>> {
    unsafe {
        let res = libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        );
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err.into());
        }
        Ok(Some(res as usize))
    }
}

// ---- Shutdown wake pipe ----

/// Read end of the self-wake channel. Registered with the reactor's epoll so
/// a stop request interrupts an otherwise indefinite wait.
pub struct WakePipe {
    read_fd: c_int,
}

struct WakeFd {
    write_fd: c_int,
}

impl Drop for WakeFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.write_fd);
        }
    }
}

/// Write end of the self-wake channel. Cheap to clone and safe to signal
/// from any thread, including a signal handler thread.
#[derive(Clone)]
pub struct WakeHandle {
    inner: Arc<WakeFd>,
}

impl WakeHandle {
    /// Queue one wake byte. A full pipe already guarantees a pending wakeup,
    /// so WouldBlock is success here.
    pub fn wake(&self) {
        let byte = [1u8; 1];
        unsafe {
            libc::write(self.inner.write_fd, byte.as_ptr() as *const c_void, 1);
        }
    }
}

impl WakePipe {
    #[inline]
    pub fn fd(&self) -> c_int {
        self.read_fd
    }

    /// Consume every pending wake byte so the level-triggered readable state
    /// clears.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        unsafe {
            while libc::read(self.read_fd, buf.as_mut_ptr() as *mut c_void, buf.len()) > 0 {}
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
        }
    }
}

/// Create the wake channel: a nonblocking pipe pair.
pub fn wake_pipe() -> Result<(WakePipe, WakeHandle)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok((
        WakePipe { read_fd: fds[0] },
        WakeHandle {
            inner: Arc::new(WakeFd { write_fd: fds[1] }),
        },
    ))
}

// ---- File descriptor limit ----

/// Current soft RLIMIT_NOFILE; the process-wide descriptor ceiling that
/// sizes each connection table.
pub fn nofile_limit() -> Result<u64> {
    unsafe {
        let mut rl: libc::rlimit = mem::zeroed();
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(rl.rlim_cur)
    }
}

/// Try to raise the soft RLIMIT_NOFILE toward `want`, capped at the hard
/// limit. Failure is reported to the caller as the limit actually in force,
/// never as an error.
pub fn raise_nofile_limit(want: u64) -> u64 {
    unsafe {
        let mut rl: libc::rlimit = mem::zeroed();
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) < 0 {
            return 0;
        }
        if rl.rlim_cur >= want {
            return rl.rlim_cur;
        }
        let previous = rl.rlim_cur;
        rl.rlim_cur = want.min(rl.rlim_max);
        if libc::setrlimit(libc::RLIMIT_NOFILE, &rl) < 0 {
            tracing::warn!(
                want,
                current = previous,
                "failed to raise file descriptor limit"
            );
            return previous;
        }
        rl.rlim_cur
    }
}
