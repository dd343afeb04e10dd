// src/poller.rs
//
// Thin wrapper over the OS readiness primitive. The engine registers the
// listening socket (edge-triggered where available) and waits with a
// bounded timeout; writes are never polled.

#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    pub token: u64,
    pub readable: bool,
    pub error: bool,
}

#[cfg(target_os = "linux")]
pub use linux::Poller;
#[cfg(not(target_os = "linux"))]
pub use fallback::Poller;

#[cfg(target_os = "linux")]
mod linux {
    use super::PollEvent;
    use anyhow::Context;
    use nix::sys::epoll::{
        epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
    };
    use std::os::unix::io::RawFd;

    pub struct Poller {
        epfd: RawFd,
        scratch: Vec<EpollEvent>,
    }

    impl Poller {
        pub fn new() -> anyhow::Result<Self> {
            let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC).context("epoll_create1")?;
            Ok(Self { epfd, scratch: vec![EpollEvent::empty(); 64] })
        }

        /// Registers `fd` for edge-triggered readability plus error/hangup.
        pub fn register_readable(&mut self, fd: RawFd, token: u64) -> anyhow::Result<()> {
            let mut ev = EpollEvent::new(
                EpollFlags::EPOLLIN | EpollFlags::EPOLLET | EpollFlags::EPOLLRDHUP,
                token,
            );
            epoll_ctl(self.epfd, EpollOp::EpollCtlAdd, fd, &mut ev).context("epoll_ctl add")?;
            Ok(())
        }

        /// Waits up to `timeout_ms` and appends readiness events to `out`.
        pub fn wait(&mut self, timeout_ms: isize, out: &mut Vec<PollEvent>) -> anyhow::Result<()> {
            out.clear();
            let n = match epoll_wait(self.epfd, &mut self.scratch, timeout_ms) {
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => 0,
                Err(e) => return Err(e).context("epoll_wait"),
            };
            for ev in &self.scratch[..n] {
                let flags = ev.events();
                out.push(PollEvent {
                    token: ev.data(),
                    readable: flags.contains(EpollFlags::EPOLLIN),
                    error: flags
                        .intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP),
                });
            }
            Ok(())
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            let _ = nix::unistd::close(self.epfd);
        }
    }
}

// Portable stand-in: sleep out the timeout and report every registered fd
// as readable. Accept loops terminate on WouldBlock, so spurious readiness
// only costs a syscall.
#[cfg(not(target_os = "linux"))]
mod fallback {
    use super::PollEvent;
    use std::os::unix::io::RawFd;
    use std::time::Duration;

    pub struct Poller {
        tokens: Vec<u64>,
    }

    impl Poller {
        pub fn new() -> anyhow::Result<Self> {
            Ok(Self { tokens: Vec::new() })
        }

        pub fn register_readable(&mut self, _fd: RawFd, token: u64) -> anyhow::Result<()> {
            self.tokens.push(token);
            Ok(())
        }

        pub fn wait(&mut self, timeout_ms: isize, out: &mut Vec<PollEvent>) -> anyhow::Result<()> {
            out.clear();
            if timeout_ms > 0 {
                std::thread::sleep(Duration::from_millis(timeout_ms as u64));
            }
            for &token in &self.tokens {
                out.push(PollEvent { token, readable: true, error: false });
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn listener_becomes_readable_on_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut poller = Poller::new().unwrap();
        poller.register_readable(listener.as_raw_fd(), 7).unwrap();

        let _client = TcpStream::connect(addr).unwrap();

        let mut events = Vec::new();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        let mut seen = false;
        while std::time::Instant::now() < deadline {
            poller.wait(1, &mut events).unwrap();
            if events.iter().any(|e| e.token == 7 && e.readable) {
                seen = true;
                break;
            }
        }
        assert!(seen, "poller never reported the listener readable");
    }
}
