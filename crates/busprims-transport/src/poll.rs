//! Readiness polling over raw descriptors (`poll(2)`).
//!
//! An interrupted poll (`EINTR`) is reported as "nothing ready" so callers
//! re-check their cancellation flag and poll again.

use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::{Result, TransportError};

/// Readiness a caller waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

impl Interest {
    fn events(self) -> libc::c_short {
        match self {
            Interest::Readable => libc::POLLIN,
            Interest::Writable => libc::POLLOUT,
        }
    }
}

/// Events reported for one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    revents: libc::c_short,
}

impl Readiness {
    pub fn is_readable(self) -> bool {
        self.revents & libc::POLLIN != 0
    }

    pub fn is_writable(self) -> bool {
        self.revents & libc::POLLOUT != 0
    }

    /// Peer hung up or the descriptor is in an error state.
    pub fn is_closed(self) -> bool {
        self.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0
    }

    pub fn is_empty(self) -> bool {
        self.revents == 0
    }
}

/// One descriptor in a [`poll_many`] call.
#[derive(Debug, Clone, Copy)]
pub struct PollEntry {
    pub fd: RawFd,
    pub interest: Interest,
    pub readiness: Readiness,
}

impl PollEntry {
    pub fn new(fd: RawFd, interest: Interest) -> Self {
        Self {
            fd,
            interest,
            readiness: Readiness::default(),
        }
    }
}

/// Wait on a single descriptor. Returns `None` on timeout.
pub fn poll_one(fd: RawFd, interest: Interest, timeout: Duration) -> Result<Option<Readiness>> {
    let mut entry = [PollEntry::new(fd, interest)];
    if poll_many(&mut entry, timeout)? == 0 {
        return Ok(None);
    }
    Ok(Some(entry[0].readiness))
}

/// Wait on several descriptors at once, filling in each entry's readiness.
/// Returns the number of entries with events.
pub fn poll_many(entries: &mut [PollEntry], timeout: Duration) -> Result<usize> {
    let mut fds: Vec<libc::pollfd> = entries
        .iter()
        .map(|entry| libc::pollfd {
            fd: entry.fd,
            events: entry.interest.events(),
            revents: 0,
        })
        .collect();

    // SAFETY: `fds` is a valid, exclusively borrowed array of `fds.len()`
    // pollfd structs for the duration of the call.
    let rc = unsafe {
        libc::poll(
            fds.as_mut_ptr(),
            fds.len() as libc::nfds_t,
            timeout_millis(timeout),
        )
    };

    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            entries
                .iter_mut()
                .for_each(|entry| entry.readiness = Readiness::default());
            return Ok(0);
        }
        return Err(TransportError::PollFailed(err));
    }

    for (entry, fd) in entries.iter_mut().zip(&fds) {
        entry.readiness = Readiness {
            revents: fd.revents,
        };
    }
    Ok(rc as usize)
}

fn timeout_millis(timeout: Duration) -> libc::c_int {
    let millis = timeout.as_millis();
    if millis == 0 && !timeout.is_zero() {
        return 1;
    }
    libc::c_int::try_from(millis).unwrap_or(libc::c_int::MAX)
}
