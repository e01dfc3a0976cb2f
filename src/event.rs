//! Timed event queue.
//!
//! A priority queue ordered by absolute due time, consumed by a small
//! pool of worker threads. Producers are the signal reaper (exit
//! statuses), the epoll loop (OOM eventfds), client disconnects (weak
//! container teardown) and the engine itself (respawns, wait timeouts,
//! the periodic log-rotation tick).
//!
//! Events referencing containers or waiters hold weak pointers, so
//! cancellation is implicit: an event whose target died is dropped at
//! dispatch.

use crate::client::WaitRecord;
use crate::container::Container;
use std::collections::BinaryHeap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, Weak};
use std::time::Duration;
use tracing::debug;

/// Milliseconds on the monotonic clock. Queue deadlines only; wall
/// timestamps stored on containers use the realtime clock.
pub fn now_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

/// Milliseconds on the realtime clock, for persisted timestamps.
pub fn wall_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// One deliverable event.
pub enum Event {
    /// A reaped child with its wait status.
    Exit { pid: i32, status: i32 },
    /// A memory-cgroup OOM eventfd became readable.
    Oom { fd: RawFd },
    /// A dead container with respawn enabled is due to start again.
    Respawn(Weak<Container>),
    /// A client wait hit its deadline.
    WaitTimeout(Weak<WaitRecord>),
    /// The owning client disconnected.
    DestroyWeak(Weak<Container>),
    /// Periodic tick: rotate stdio logs and reap aged-out containers.
    RotateLogs,
}

impl Event {
    pub fn describe(&self) -> String {
        match self {
            Event::Exit { pid, status } => format!("exit status {} for pid {}", status, pid),
            Event::Oom { fd } => format!("OOM notification on fd {}", fd),
            Event::Respawn(_) => "respawn".to_string(),
            Event::WaitTimeout(_) => "wait timeout".to_string(),
            Event::DestroyWeak(_) => "destroy weak".to_string(),
            Event::RotateLogs => "rotate logs".to_string(),
        }
    }
}

struct Scheduled {
    due_ms: u64,
    seq: u64,
    event: Event,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due_ms == other.due_ms && self.seq == other.seq
    }
}
impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap; invert so the earliest deadline is on top.
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .due_ms
            .cmp(&self.due_ms)
            .then(other.seq.cmp(&self.seq))
    }
}

struct QueueInner {
    heap: BinaryHeap<Scheduled>,
    stopped: bool,
}

/// The queue itself; shared between producers and workers.
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    cv: Condvar,
    seq: AtomicU64,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                stopped: false,
            }),
            cv: Condvar::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Schedules `event` to fire `delay_ms` from now.
    pub fn add(&self, delay_ms: u64, event: Event) {
        let due_ms = now_ms() + delay_ms;
        debug!(event = %event.describe(), delay_ms, due_ms, "schedule event");
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        inner.heap.push(Scheduled {
            due_ms,
            seq,
            event,
        });
        self.cv.notify_one();
    }

    /// Blocks until an event is due, returning `None` once stopped and
    /// drained of due events.
    pub fn next(&self) -> Option<Event> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let now = now_ms();
            match inner.heap.peek() {
                Some(top) if top.due_ms <= now => {
                    return Some(inner.heap.pop().unwrap().event);
                }
                Some(top) => {
                    if inner.stopped {
                        return None;
                    }
                    let timeout = Duration::from_millis(top.due_ms - now);
                    let (guard, _) = self.cv.wait_timeout(inner, timeout).unwrap();
                    inner = guard;
                }
                None => {
                    if inner.stopped {
                        return None;
                    }
                    inner = self.cv.wait(inner).unwrap();
                }
            }
        }
    }

    /// Pops an event only if one is already due. Non-blocking; used by
    /// tests and by handlers that re-queue under contention.
    pub fn try_next(&self) -> Option<Event> {
        let mut inner = self.inner.lock().unwrap();
        match inner.heap.peek() {
            Some(top) if top.due_ms <= now_ms() => Some(inner.heap.pop().unwrap().event),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wakes every worker and makes `next` return `None`.
    pub fn stop(&self) {
        self.inner.lock().unwrap().stopped = true;
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_due_ordering() {
        let queue = EventQueue::new();
        queue.add(0, Event::Exit {
            pid: 2,
            status: 0,
        });
        queue.add(0, Event::Exit {
            pid: 1,
            status: 0,
        });
        // same deadline: insertion order wins
        match queue.next().unwrap() {
            Event::Exit { pid, .. } => assert_eq!(pid, 2),
            _ => panic!("wrong event"),
        }
        match queue.next().unwrap() {
            Event::Exit { pid, .. } => assert_eq!(pid, 1),
            _ => panic!("wrong event"),
        }
    }

    #[test]
    fn test_earlier_deadline_first() {
        let queue = EventQueue::new();
        queue.add(10_000, Event::RotateLogs);
        queue.add(0, Event::Exit {
            pid: 9,
            status: 0,
        });
        match queue.next().unwrap() {
            Event::Exit { pid, .. } => assert_eq!(pid, 9),
            _ => panic!("future event delivered early"),
        }
        assert!(queue.try_next().is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_stop_unblocks() {
        let queue = std::sync::Arc::new(EventQueue::new());
        let waiter = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.next())
        };
        std::thread::sleep(Duration::from_millis(50));
        queue.stop();
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn test_try_next_ignores_future_events() {
        let queue = EventQueue::new();
        queue.add(60_000, Event::RotateLogs);
        assert!(queue.try_next().is_none());
    }
}
