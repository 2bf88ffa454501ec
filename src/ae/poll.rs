//! `poll(2)` readiness backend.

use std::os::fd::{BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};

use super::{Mask, Poller};
use crate::error::AeError;

#[derive(Debug, Default)]
pub struct PollPoller {
    /// Registered descriptors with their requested events.
    watched: Vec<(RawFd, PollFlags)>,
    /// `fd -> index into watched`.
    slots: Vec<Option<usize>>,
}

impl PollPoller {
    pub fn new() -> Self {
        Self::default()
    }
}

fn to_flags(mask: Mask) -> PollFlags {
    let mut flags = PollFlags::empty();
    if mask.contains(Mask::READABLE) {
        flags |= PollFlags::POLLIN;
    }
    if mask.contains(Mask::WRITABLE) {
        flags |= PollFlags::POLLOUT;
    }
    flags
}

fn to_mask(revents: PollFlags) -> Mask {
    let mut mask = Mask::NONE;
    if revents.contains(PollFlags::POLLIN) {
        mask |= Mask::READABLE;
    }
    if revents.contains(PollFlags::POLLOUT) {
        mask |= Mask::WRITABLE;
    }
    // Errors and hangups are reported to both directions so the handler
    // notices on its next read or write.
    if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
        mask |= Mask::READABLE | Mask::WRITABLE;
    }
    mask
}

fn timeout_arg(timeout_ms: Option<i64>) -> i32 {
    match timeout_ms {
        None => -1,
        Some(ms) => ms.clamp(0, i32::MAX as i64) as i32,
    }
}

impl Poller for PollPoller {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn resize(&mut self, setsize: usize) -> Result<(), AeError> {
        self.slots.resize(setsize, None);
        Ok(())
    }

    fn set_interest(&mut self, fd: RawFd, mask: Mask) -> Result<(), AeError> {
        let idx = usize::try_from(fd)
            .ok()
            .filter(|&i| i < self.slots.len())
            .ok_or(AeError::FdOutOfRange {
                fd,
                setsize: self.slots.len(),
            })?;

        match (self.slots[idx], mask.is_empty()) {
            (Some(pos), false) => self.watched[pos].1 = to_flags(mask),
            (None, false) => {
                self.slots[idx] = Some(self.watched.len());
                self.watched.push((fd, to_flags(mask)));
            }
            (Some(pos), true) => {
                self.watched.swap_remove(pos);
                self.slots[idx] = None;
                if let Some(&(moved, _)) = self.watched.get(pos) {
                    self.slots[moved as usize] = Some(pos);
                }
            }
            (None, true) => {}
        }
        Ok(())
    }

    fn poll(&mut self, timeout_ms: Option<i64>, fired: &mut Vec<(RawFd, Mask)>) -> Result<(), AeError> {
        // SAFETY: descriptors stay registered only while their owners keep
        // them open; the loop unregisters a descriptor before closing it.
        let borrowed: Vec<BorrowedFd<'_>> = self
            .watched
            .iter()
            .map(|&(fd, _)| unsafe { BorrowedFd::borrow_raw(fd) })
            .collect();
        let mut fds: Vec<PollFd<'_>> = borrowed
            .iter()
            .zip(&self.watched)
            .map(|(bfd, &(_, flags))| PollFd::new(bfd, flags))
            .collect();

        match poll(&mut fds, timeout_arg(timeout_ms)) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(()),
            Err(e) => return Err(AeError::Poll(e)),
        }

        for (pfd, &(fd, _)) in fds.iter().zip(&self.watched) {
            let revents = pfd.revents().unwrap_or(PollFlags::empty());
            let mask = to_mask(revents);
            if !mask.is_empty() {
                fired.push((fd, mask));
            }
        }
        Ok(())
    }
}

/// Blocks up to `ms` milliseconds until `fd` is ready for `mask`. Returns
/// the ready directions, empty on timeout.
pub fn wait(fd: RawFd, mask: Mask, ms: i64) -> Result<Mask, AeError> {
    // SAFETY: the caller owns `fd` for the duration of the call.
    let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(&bfd, to_flags(mask))];
    match poll(&mut fds, timeout_arg(Some(ms))) {
        Ok(0) => Ok(Mask::NONE),
        Ok(_) => {
            let revents = fds[0].revents().unwrap_or(PollFlags::empty());
            let mut ready = Mask::NONE;
            if revents.contains(PollFlags::POLLIN) {
                ready |= Mask::READABLE;
            }
            if revents.intersects(PollFlags::POLLOUT | PollFlags::POLLERR | PollFlags::POLLHUP) {
                ready |= Mask::WRITABLE;
            }
            Ok(ready)
        }
        Err(Errno::EINTR) => Ok(Mask::NONE),
        Err(e) => Err(AeError::Poll(e)),
    }
}
