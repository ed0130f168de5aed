//! Completion channels built on eventfd
//!
//! Each completion queue signals its channel when it is armed and a new
//! completion lands. Blocking waiters sleep on the channel; an external
//! `interrupt` cancels the wait. On Linux the channel is an eventfd that can
//! also be handed to an outer epoll loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

#[cfg(target_os = "linux")]
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

#[cfg(target_os = "linux")]
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags},
    sys::eventfd::{eventfd, EfdFlags},
    unistd::{read, write},
};

#[cfg(not(target_os = "linux"))]
use std::sync::{Condvar, Mutex};

use crate::error::{Result, RingError};

/// Outcome of a completed wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The hardware signalled the channel
    Notified,
    /// The timeout elapsed without an event
    TimedOut,
}

/// Event channel shared between a completion queue and its waiters
#[derive(Debug)]
pub struct CompletionChannel {
    name: String,
    #[cfg(target_os = "linux")]
    event_fd: OwnedFd,
    #[cfg(not(target_os = "linux"))]
    signal: (Mutex<bool>, Condvar),
    interrupted: AtomicBool,
    notify_count: AtomicU64,
    wait_count: AtomicU64,
}

impl CompletionChannel {
    /// Create a new channel
    pub fn new(name: impl Into<String>) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            #[cfg(target_os = "linux")]
            event_fd: eventfd(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
                .map_err(|e| RingError::notification(format!("eventfd: {}", e)))?,
            #[cfg(not(target_os = "linux"))]
            signal: (Mutex::new(false), Condvar::new()),
            interrupted: AtomicBool::new(false),
            notify_count: AtomicU64::new(0),
            wait_count: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the channel (called by the hardware side)
    pub fn notify(&self) -> Result<()> {
        self.notify_count.fetch_add(1, Ordering::Relaxed);
        self.signal()
    }

    /// Cancel the current or next wait
    pub fn interrupt(&self) -> Result<()> {
        self.interrupted.store(true, Ordering::Release);
        self.signal()
    }

    /// Block until the channel is signalled, interrupted or `timeout` elapses
    pub fn wait(&self, timeout: Option<Duration>) -> Result<WaitOutcome> {
        self.wait_count.fetch_add(1, Ordering::Relaxed);
        if self.interrupted.swap(false, Ordering::AcqRel) {
            self.clear_signal();
            return Err(RingError::Interrupted);
        }

        let outcome = self.wait_signal(timeout)?;

        if self.interrupted.swap(false, Ordering::AcqRel) {
            return Err(RingError::Interrupted);
        }
        Ok(outcome)
    }

    /// File descriptor for external polling
    #[cfg(target_os = "linux")]
    pub fn raw_fd(&self) -> RawFd {
        self.event_fd.as_raw_fd()
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            notify_count: self.notify_count.load(Ordering::Relaxed),
            wait_count: self.wait_count.load(Ordering::Relaxed),
        }
    }

    #[cfg(target_os = "linux")]
    fn signal(&self) -> Result<()> {
        let buf = 1u64.to_ne_bytes();
        match write(self.event_fd.as_raw_fd(), &buf) {
            Ok(_) | Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(RingError::notification(format!("eventfd write: {}", e))),
        }
    }

    #[cfg(target_os = "linux")]
    fn clear_signal(&self) {
        let mut buf = [0u8; 8];
        let _ = read(self.event_fd.as_raw_fd(), &mut buf);
    }

    #[cfg(target_os = "linux")]
    fn wait_signal(&self, timeout: Option<Duration>) -> Result<WaitOutcome> {
        let timeout_ms = timeout
            .map(|t| t.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);
        let mut fds = [PollFd::new(&self.event_fd, PollFlags::POLLIN)];

        match poll(&mut fds, timeout_ms) {
            Ok(0) => Ok(WaitOutcome::TimedOut),
            Ok(_) => {
                // Drain the counter so the next wait blocks again
                self.clear_signal();
                Ok(WaitOutcome::Notified)
            }
            Err(Errno::EINTR) => Err(RingError::Interrupted),
            Err(e) => Err(RingError::notification(format!("poll: {}", e))),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn signal(&self) -> Result<()> {
        let (mutex, condvar) = &self.signal;
        let mut signalled = mutex.lock().unwrap_or_else(|e| e.into_inner());
        *signalled = true;
        condvar.notify_all();
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn clear_signal(&self) {
        let (mutex, _) = &self.signal;
        *mutex.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }

    #[cfg(not(target_os = "linux"))]
    fn wait_signal(&self, timeout: Option<Duration>) -> Result<WaitOutcome> {
        let (mutex, condvar) = &self.signal;
        let guard = mutex.lock().unwrap_or_else(|e| e.into_inner());
        let mut guard = match timeout {
            Some(t) => {
                condvar
                    .wait_timeout_while(guard, t, |signalled| !*signalled)
                    .unwrap_or_else(|e| e.into_inner())
                    .0
            }
            None => condvar
                .wait_while(guard, |signalled| !*signalled)
                .unwrap_or_else(|e| e.into_inner()),
        };
        if *guard {
            *guard = false;
            Ok(WaitOutcome::Notified)
        } else {
            Ok(WaitOutcome::TimedOut)
        }
    }
}

/// Counters for a completion channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    pub notify_count: u64,
    pub wait_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_notify_then_wait() {
        let channel = CompletionChannel::new("rx").unwrap();
        channel.notify().unwrap();
        let outcome = channel.wait(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(outcome, WaitOutcome::Notified);
        assert_eq!(channel.stats().notify_count, 1);
    }

    #[test]
    fn test_wait_times_out() {
        let channel = CompletionChannel::new("tx").unwrap();
        let outcome = channel.wait(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn test_interrupt_cancels_wait() {
        let channel = Arc::new(CompletionChannel::new("rx").unwrap());
        let waker = channel.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            waker.interrupt().unwrap();
        });

        let result = channel.wait(Some(Duration::from_secs(5)));
        assert!(matches!(result, Err(RingError::Interrupted)));
        handle.join().unwrap();

        // Interrupt is consumed by the wait it cancelled
        let outcome = channel.wait(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }
}
