//! Single-threaded reactor multiplexing file readiness and timers.
//!
//! The loop is generic over the state `S` handed to every callback, so
//! handlers receive `&mut EventLoop<S>` and `&mut S` explicitly instead of
//! reaching for globals. Readiness comes from a pluggable [`Poller`];
//! timers read time from a pluggable [`Clock`] so tests can drive them
//! with simulated time.

mod poll;

use std::os::fd::RawFd;
use std::rc::Rc;

use tracing::{trace, warn};

use crate::error::AeError;
use crate::util;

pub use poll::{PollPoller, wait};

/// Interest / readiness bits for a file descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mask(u8);

impl Mask {
    pub const NONE: Mask = Mask(0);
    pub const READABLE: Mask = Mask(1);
    pub const WRITABLE: Mask = Mask(2);

    pub fn contains(self, other: Mask) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn intersects(self, other: Mask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn without(self, other: Mask) -> Mask {
        Mask(self.0 & !other.0)
    }
}

impl std::ops::BitOr for Mask {
    type Output = Mask;

    fn bitor(self, rhs: Mask) -> Mask {
        Mask(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Mask {
    fn bitor_assign(&mut self, rhs: Mask) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for Mask {
    type Output = Mask;

    fn bitand(self, rhs: Mask) -> Mask {
        Mask(self.0 & rhs.0)
    }
}

// process_events flags
pub const FILE_EVENTS: u32 = 1;
pub const TIME_EVENTS: u32 = 2;
pub const ALL_EVENTS: u32 = FILE_EVENTS | TIME_EVENTS;
pub const DONT_WAIT: u32 = 4;

/// Callbacks for a registered file descriptor.
pub trait FileHandler<S> {
    fn on_readable(&self, _el: &mut EventLoop<S>, _state: &mut S, _fd: RawFd) {}

    fn on_writable(&self, _el: &mut EventLoop<S>, _state: &mut S, _fd: RawFd) {}
}

pub type TimerId = u64;

/// What a timer wants after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    NoMore,
    /// Run again this many milliseconds from now.
    Again(u64),
}

pub type TimeProc<S> = Box<dyn FnMut(&mut EventLoop<S>, &mut S, TimerId) -> TimerAction>;
pub type Finalizer<S> = Box<dyn FnOnce(&mut S)>;
pub type BeforeSleep<S> = Rc<dyn Fn(&mut EventLoop<S>, &mut S)>;

/// Readiness backend.
pub trait Poller {
    fn name(&self) -> &'static str;

    fn resize(&mut self, _setsize: usize) -> Result<(), AeError> {
        Ok(())
    }

    /// `mask` is the full interest set of `fd` after the change.
    fn set_interest(&mut self, fd: RawFd, mask: Mask) -> Result<(), AeError>;

    /// Waits up to `timeout_ms` (forever when `None`) and appends ready
    /// descriptors to `fired`.
    fn poll(&mut self, timeout_ms: Option<i64>, fired: &mut Vec<(RawFd, Mask)>) -> Result<(), AeError>;
}

/// Millisecond time source for timers.
pub trait Clock {
    fn now_ms(&self) -> i64;
}

/// Wall clock. Jumps backward are possible and handled by the loop.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        util::mstime()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default, Clone)]
pub struct ManualClock(Rc<std::cell::Cell<i64>>);

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self(Rc::new(std::cell::Cell::new(start_ms)))
    }

    pub fn set(&self, ms: i64) {
        self.0.set(ms);
    }

    pub fn advance(&self, ms: i64) {
        self.0.set(self.0.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.get()
    }
}

struct FileEvent<S> {
    mask: Mask,
    rhandler: Option<Rc<dyn FileHandler<S>>>,
    whandler: Option<Rc<dyn FileHandler<S>>>,
}

impl<S> FileEvent<S> {
    fn empty() -> Self {
        Self {
            mask: Mask::NONE,
            rhandler: None,
            whandler: None,
        }
    }
}

struct TimeEvent<S> {
    id: TimerId,
    when_ms: i64,
    proc_: Option<TimeProc<S>>,
    finalizer: Option<Finalizer<S>>,
    deleted: bool,
}

pub struct EventLoop<S> {
    setsize: usize,
    maxfd: RawFd,
    events: Vec<FileEvent<S>>,
    fired: Vec<(RawFd, Mask)>,
    timers: Vec<TimeEvent<S>>,
    next_timer_id: TimerId,
    last_time: i64,
    stop: bool,
    before_sleep: Option<BeforeSleep<S>>,
    poller: Box<dyn Poller>,
    clock: Box<dyn Clock>,
}

impl<S> EventLoop<S> {
    /// Creates a loop for descriptors below `setsize`, backed by `poll(2)`
    /// and the wall clock.
    pub fn new(setsize: usize) -> Result<Self, AeError> {
        Self::with_backend(setsize, Box::new(PollPoller::new()), Box::new(SystemClock))
    }

    pub fn with_backend(setsize: usize, mut poller: Box<dyn Poller>, clock: Box<dyn Clock>) -> Result<Self, AeError> {
        poller.resize(setsize)?;
        let mut events = Vec::with_capacity(setsize);
        events.resize_with(setsize, FileEvent::empty);
        let last_time = clock.now_ms();
        Ok(Self {
            setsize,
            maxfd: -1,
            events,
            fired: Vec::new(),
            timers: Vec::new(),
            next_timer_id: 0,
            last_time,
            stop: false,
            before_sleep: None,
            poller,
            clock,
        })
    }

    pub fn set_size(&self) -> usize {
        self.setsize
    }

    /// Changes the maximum number of descriptors. Refused when a
    /// registered descriptor would fall outside the new size.
    pub fn resize_set_size(&mut self, setsize: usize) -> Result<(), AeError> {
        if setsize == self.setsize {
            return Ok(());
        }
        if self.maxfd >= 0 && self.maxfd as usize >= setsize {
            return Err(AeError::SetSizeTooSmall {
                requested: setsize,
                max_fd: self.maxfd,
            });
        }
        self.poller.resize(setsize)?;
        self.events.resize_with(setsize, FileEvent::empty);
        self.setsize = setsize;
        Ok(())
    }

    pub fn api_name(&self) -> &'static str {
        self.poller.name()
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn stop(&mut self) {
        self.stop = true;
    }

    pub fn set_before_sleep(&mut self, f: Option<BeforeSleep<S>>) {
        self.before_sleep = f;
    }

    fn slot(&self, fd: RawFd) -> Result<usize, AeError> {
        match usize::try_from(fd) {
            Ok(i) if i < self.setsize => Ok(i),
            _ => Err(AeError::FdOutOfRange {
                fd,
                setsize: self.setsize,
            }),
        }
    }

    /// Adds `mask` to the interest set of `fd`, routing those events to
    /// `handler`. Read and write interest may use different handlers.
    pub fn create_file_event(
        &mut self,
        fd: RawFd,
        mask: Mask,
        handler: Rc<dyn FileHandler<S>>,
    ) -> Result<(), AeError> {
        let i = self.slot(fd)?;
        let new_mask = self.events[i].mask | mask;
        self.poller.set_interest(fd, new_mask)?;

        let fe = &mut self.events[i];
        fe.mask = new_mask;
        if mask.contains(Mask::READABLE) {
            fe.rhandler = Some(handler.clone());
        }
        if mask.contains(Mask::WRITABLE) {
            fe.whandler = Some(handler);
        }
        if fd > self.maxfd {
            self.maxfd = fd;
        }
        Ok(())
    }

    /// Removes `mask` from the interest set of `fd`.
    pub fn delete_file_event(&mut self, fd: RawFd, mask: Mask) {
        let Ok(i) = self.slot(fd) else {
            return;
        };
        if self.events[i].mask.is_empty() {
            return;
        }
        let fe = &mut self.events[i];
        fe.mask = fe.mask.without(mask);
        if mask.contains(Mask::READABLE) {
            fe.rhandler = None;
        }
        if mask.contains(Mask::WRITABLE) {
            fe.whandler = None;
        }
        let remaining = fe.mask;

        if fd == self.maxfd && remaining.is_empty() {
            self.maxfd = (0..fd)
                .rev()
                .find(|&j| !self.events[j as usize].mask.is_empty())
                .unwrap_or(-1);
        }
        if let Err(err) = self.poller.set_interest(fd, remaining) {
            warn!(fd, %err, "poller refused interest change");
        }
    }

    pub fn get_file_events(&self, fd: RawFd) -> Mask {
        match self.slot(fd) {
            Ok(i) => self.events[i].mask,
            Err(_) => Mask::NONE,
        }
    }

    /// Highest registered descriptor, `-1` when none.
    pub fn max_fd(&self) -> RawFd {
        self.maxfd
    }

    /// Schedules `proc_` to run `ms` milliseconds from now.
    pub fn create_time_event<F>(&mut self, ms: u64, proc_: F, finalizer: Option<Finalizer<S>>) -> TimerId
    where
        F: FnMut(&mut EventLoop<S>, &mut S, TimerId) -> TimerAction + 'static,
    {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timers.push(TimeEvent {
            id,
            when_ms: self.clock.now_ms() + ms as i64,
            proc_: Some(Box::new(proc_)),
            finalizer,
            deleted: false,
        });
        id
    }

    /// Cancels a timer. Safe to call from the timer's own callback; the
    /// finalizer runs on the next timer pass.
    pub fn delete_time_event(&mut self, id: TimerId) -> bool {
        match self.timers.iter_mut().find(|t| t.id == id && !t.deleted) {
            Some(te) => {
                te.deleted = true;
                true
            }
            None => false,
        }
    }

    fn nearest_timer(&self) -> Option<i64> {
        self.timers.iter().filter(|t| !t.deleted).map(|t| t.when_ms).min()
    }

    fn process_time_events(&mut self, state: &mut S) -> usize {
        let now = self.clock.now_ms();
        // The clock moved backward: run everything now rather than risk
        // starving timers until the clock catches up.
        if now < self.last_time {
            warn!(
                skew_ms = self.last_time - now,
                "system clock moved backward, firing all timers"
            );
            for te in &mut self.timers {
                te.when_ms = 0;
            }
        }
        self.last_time = now;

        // Timers created by callbacks during this pass wait for the next one.
        let max_id = self.next_timer_id;
        let ids: Vec<TimerId> = self.timers.iter().map(|t| t.id).collect();
        let mut processed = 0;

        for id in ids {
            let Some(pos) = self.timers.iter().position(|t| t.id == id) else {
                continue;
            };
            if self.timers[pos].deleted {
                self.remove_timer(pos, state);
                continue;
            }
            if id >= max_id || self.timers[pos].when_ms > self.clock.now_ms() {
                continue;
            }

            let Some(mut proc_) = self.timers[pos].proc_.take() else {
                continue;
            };
            let action = proc_(self, state, id);
            processed += 1;
            trace!(id, ?action, "timer fired");

            // The callback may have added or removed timers.
            let Some(pos) = self.timers.iter().position(|t| t.id == id) else {
                continue;
            };
            match action {
                TimerAction::Again(ms) if !self.timers[pos].deleted => {
                    let te = &mut self.timers[pos];
                    te.when_ms = self.clock.now_ms() + ms as i64;
                    te.proc_ = Some(proc_);
                }
                _ => self.remove_timer(pos, state),
            }
        }
        processed
    }

    fn remove_timer(&mut self, pos: usize, state: &mut S) {
        let te = self.timers.swap_remove(pos);
        if let Some(finalizer) = te.finalizer {
            finalizer(state);
        }
    }

    /// Runs one iteration: waits for readiness (bounded by the nearest
    /// timer unless `DONT_WAIT`), dispatches file events, then due timers.
    /// Returns the number of events processed.
    pub fn process_events(&mut self, state: &mut S, flags: u32) -> Result<usize, AeError> {
        if flags & (TIME_EVENTS | FILE_EVENTS) == 0 {
            return Ok(0);
        }
        let mut processed = 0;
        let timers_may_wait = flags & TIME_EVENTS != 0 && flags & DONT_WAIT == 0;

        if self.maxfd != -1 || timers_may_wait {
            let timeout = if flags & DONT_WAIT != 0 {
                Some(0)
            } else if flags & TIME_EVENTS != 0 {
                self.nearest_timer()
                    .map(|when| (when - self.clock.now_ms()).max(0))
            } else {
                None
            };

            let mut fired = std::mem::take(&mut self.fired);
            fired.clear();
            let polled = self.poller.poll(timeout, &mut fired);
            if let Err(err) = polled {
                self.fired = fired;
                return Err(err);
            }

            if flags & FILE_EVENTS != 0 {
                for &(fd, mask) in &fired {
                    self.dispatch(state, fd, mask);
                    processed += 1;
                }
            }
            self.fired = fired;
        }

        if flags & TIME_EVENTS != 0 {
            processed += self.process_time_events(state);
        }
        Ok(processed)
    }

    fn dispatch(&mut self, state: &mut S, fd: RawFd, mask: Mask) {
        let Ok(i) = self.slot(fd) else {
            return;
        };

        let mut rfired = None;
        if self.events[i].mask.intersects(mask & Mask::READABLE) {
            if let Some(h) = self.events[i].rhandler.clone() {
                h.on_readable(self, state, fd);
                rfired = Some(h);
            }
        }
        // The read handler may have unregistered the descriptor.
        if self.events[i].mask.intersects(mask & Mask::WRITABLE) {
            if let Some(h) = self.events[i].whandler.clone() {
                let same = rfired.as_ref().is_some_and(|r| Rc::ptr_eq(r, &h));
                if !same {
                    h.on_writable(self, state, fd);
                }
            }
        }
    }

    /// Runs until [`EventLoop::stop`] is called, invoking the before-sleep
    /// hook ahead of every wait.
    pub fn main(&mut self, state: &mut S) -> Result<(), AeError> {
        self.stop = false;
        while !self.stop {
            if let Some(hook) = self.before_sleep.clone() {
                hook(self, state);
            }
            self.process_events(state, ALL_EVENTS)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Backend with no descriptors, for timer-only tests.
    struct NullPoller;

    impl Poller for NullPoller {
        fn name(&self) -> &'static str {
            "null"
        }

        fn set_interest(&mut self, _fd: RawFd, _mask: Mask) -> Result<(), AeError> {
            Ok(())
        }

        fn poll(&mut self, _timeout_ms: Option<i64>, _fired: &mut Vec<(RawFd, Mask)>) -> Result<(), AeError> {
            Ok(())
        }
    }

    /// Backend that reports every registered descriptor as ready.
    #[derive(Default)]
    struct AlwaysReady {
        interest: Vec<(RawFd, Mask)>,
    }

    impl Poller for AlwaysReady {
        fn name(&self) -> &'static str {
            "always"
        }

        fn set_interest(&mut self, fd: RawFd, mask: Mask) -> Result<(), AeError> {
            self.interest.retain(|(f, _)| *f != fd);
            if !mask.is_empty() {
                self.interest.push((fd, mask));
            }
            Ok(())
        }

        fn poll(&mut self, _timeout_ms: Option<i64>, fired: &mut Vec<(RawFd, Mask)>) -> Result<(), AeError> {
            fired.extend(self.interest.iter().copied());
            Ok(())
        }
    }

    fn manual_loop<S>(clock: &ManualClock) -> EventLoop<S> {
        EventLoop::with_backend(64, Box::new(NullPoller), Box::new(clock.clone())).unwrap()
    }

    #[test]
    fn test_timer_fires_once_when_due() {
        let clock = ManualClock::new(10_000);
        let mut el: EventLoop<u32> = manual_loop(&clock);
        let mut fired = 0u32;
        el.create_time_event(
            100,
            |_, fired: &mut u32, _| {
                *fired += 1;
                TimerAction::NoMore
            },
            None,
        );

        clock.advance(50);
        el.process_events(&mut fired, ALL_EVENTS | DONT_WAIT).unwrap();
        assert_eq!(fired, 0);

        clock.advance(100);
        el.process_events(&mut fired, ALL_EVENTS | DONT_WAIT).unwrap();
        assert_eq!(fired, 1);

        clock.advance(1000);
        el.process_events(&mut fired, ALL_EVENTS | DONT_WAIT).unwrap();
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_timer_reschedules_from_now() {
        let clock = ManualClock::new(0);
        let mut el: EventLoop<Vec<i64>> = manual_loop(&clock);
        let c = clock.clone();
        el.create_time_event(10, move |_, log: &mut Vec<i64>, _| {
            log.push(c.now_ms());
            TimerAction::Again(10)
        }, None);

        let mut log = Vec::new();
        for _ in 0..5 {
            clock.advance(15);
            el.process_events(&mut log, TIME_EVENTS | DONT_WAIT).unwrap();
        }
        // Due at 10 (seen at 15), then 25 (seen at 30), 40 (seen at 45), ...
        assert_eq!(log, vec![15, 30, 45, 60, 75]);
    }

    #[test]
    fn test_clock_rollback_forces_timers() {
        let clock = ManualClock::new(1_000_000);
        let mut el: EventLoop<u32> = manual_loop(&clock);
        el.create_time_event(60_000, |_, n: &mut u32, _| {
            *n += 1;
            TimerAction::NoMore
        }, None);

        let mut n = 0;
        clock.set(500_000);
        el.process_events(&mut n, TIME_EVENTS | DONT_WAIT).unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_timer_created_in_callback_waits_for_next_pass() {
        let clock = ManualClock::new(0);
        let mut el: EventLoop<Vec<&'static str>> = manual_loop(&clock);
        el.create_time_event(0, |el: &mut EventLoop<Vec<&'static str>>, log: &mut Vec<&'static str>, _| {
            log.push("outer");
            el.create_time_event(0, |_, log: &mut Vec<&'static str>, _| {
                log.push("inner");
                TimerAction::NoMore
            }, None);
            TimerAction::NoMore
        }, None);

        let mut log = Vec::new();
        el.process_events(&mut log, TIME_EVENTS | DONT_WAIT).unwrap();
        assert_eq!(log, vec!["outer"]);
        el.process_events(&mut log, TIME_EVENTS | DONT_WAIT).unwrap();
        assert_eq!(log, vec!["outer", "inner"]);
    }

    #[test]
    fn test_delete_time_event_runs_finalizer() {
        let clock = ManualClock::new(0);
        let mut el: EventLoop<Vec<&'static str>> = manual_loop(&clock);
        let id = el.create_time_event(
            1000,
            |_, _: &mut Vec<&'static str>, _| TimerAction::Again(1000),
            Some(Box::new(|log: &mut Vec<&'static str>| log.push("finalized"))),
        );
        assert!(el.delete_time_event(id));
        assert!(!el.delete_time_event(id));

        let mut log = Vec::new();
        el.process_events(&mut log, TIME_EVENTS | DONT_WAIT).unwrap();
        assert_eq!(log, vec!["finalized"]);
    }

    #[test]
    fn test_timer_can_cancel_itself() {
        let clock = ManualClock::new(0);
        let mut el: EventLoop<u32> = manual_loop(&clock);
        el.create_time_event(0, |el: &mut EventLoop<u32>, n: &mut u32, id| {
            *n += 1;
            el.delete_time_event(id);
            TimerAction::Again(0)
        }, None);

        let mut n = 0;
        for _ in 0..3 {
            el.process_events(&mut n, TIME_EVENTS | DONT_WAIT).unwrap();
        }
        assert_eq!(n, 1);
    }

    struct Recorder {
        log: Rc<std::cell::RefCell<Vec<String>>>,
        unregister_on_read: bool,
    }

    impl FileHandler<u32> for Recorder {
        fn on_readable(&self, el: &mut EventLoop<u32>, _state: &mut u32, fd: RawFd) {
            self.log.borrow_mut().push(format!("r{fd}"));
            if self.unregister_on_read {
                el.delete_file_event(fd, Mask::READABLE | Mask::WRITABLE);
            }
        }

        fn on_writable(&self, _el: &mut EventLoop<u32>, _state: &mut u32, fd: RawFd) {
            self.log.borrow_mut().push(format!("w{fd}"));
        }
    }

    fn ready_loop() -> EventLoop<u32> {
        EventLoop::with_backend(16, Box::<AlwaysReady>::default(), Box::new(ManualClock::new(0))).unwrap()
    }

    #[test]
    fn test_file_event_dispatch_rules() {
        let log = Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut el = ready_loop();
        let shared: Rc<dyn FileHandler<u32>> = Rc::new(Recorder {
            log: log.clone(),
            unregister_on_read: false,
        });
        let other: Rc<dyn FileHandler<u32>> = Rc::new(Recorder {
            log: log.clone(),
            unregister_on_read: false,
        });

        // Same handler for both directions: write is skipped after a read.
        el.create_file_event(3, Mask::READABLE | Mask::WRITABLE, shared).unwrap();
        // Distinct handlers: both run.
        el.create_file_event(4, Mask::READABLE, other.clone()).unwrap();
        el.create_file_event(4, Mask::WRITABLE, Rc::new(Recorder {
            log: log.clone(),
            unregister_on_read: false,
        })).unwrap();

        let mut state = 0;
        let n = el.process_events(&mut state, FILE_EVENTS | DONT_WAIT).unwrap();
        assert_eq!(n, 2);
        assert_eq!(*log.borrow(), vec!["r3", "r4", "w4"]);
        assert_eq!(el.max_fd(), 4);
    }

    #[test]
    fn test_handler_may_unregister_itself() {
        let log = Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut el = ready_loop();
        el.create_file_event(5, Mask::READABLE, Rc::new(Recorder {
            log: log.clone(),
            unregister_on_read: true,
        })).unwrap();
        el.create_file_event(5, Mask::WRITABLE, Rc::new(Recorder {
            log: log.clone(),
            unregister_on_read: false,
        })).unwrap();

        let mut state = 0;
        el.process_events(&mut state, FILE_EVENTS | DONT_WAIT).unwrap();
        assert_eq!(*log.borrow(), vec!["r5"]);
        assert_eq!(el.get_file_events(5), Mask::NONE);
        assert_eq!(el.max_fd(), -1);
    }

    #[test]
    fn test_registration_limits() {
        let mut el = ready_loop();
        let h: Rc<dyn FileHandler<u32>> = Rc::new(Recorder {
            log: Rc::default(),
            unregister_on_read: false,
        });
        assert!(matches!(
            el.create_file_event(16, Mask::READABLE, h.clone()),
            Err(AeError::FdOutOfRange { fd: 16, setsize: 16 })
        ));
        el.create_file_event(10, Mask::READABLE, h).unwrap();
        assert!(matches!(el.resize_set_size(8), Err(AeError::SetSizeTooSmall { .. })));
        el.resize_set_size(32).unwrap();
        assert_eq!(el.set_size(), 32);
        el.delete_file_event(10, Mask::READABLE);
        el.resize_set_size(8).unwrap();
    }

    #[test]
    fn test_before_sleep_and_stop() {
        let clock = ManualClock::new(0);
        let mut el: EventLoop<u32> = manual_loop(&clock);
        let calls = Rc::new(Cell::new(0));
        let c = calls.clone();
        el.set_before_sleep(Some(Rc::new(move |el: &mut EventLoop<u32>, n: &mut u32| {
            c.set(c.get() + 1);
            *n += 1;
            if *n == 3 {
                el.stop();
            }
        })));
        // Keep the loop from blocking: a timer that is always due.
        el.create_time_event(0, |_, _: &mut u32, _| TimerAction::Again(0), None);

        let mut n = 0;
        el.main(&mut n).unwrap();
        assert_eq!(calls.get(), 3);
        assert_eq!(n, 3);
    }
}
