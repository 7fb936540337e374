//! Worker pools and one-shot timers.
//!
//! Work items are closures consumed by a named pool of worker threads.
//! Workers never yield cooperatively; only blocking system calls suspend
//! them. Gateway I/O, recovery and cluster events each get their own pool
//! so a stalled disk cannot starve membership handling.

use log::debug;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A named queue backed by a fixed pool of worker threads.
pub struct Wqueue {
    name: &'static str,
    tx: mpsc::Sender<Job>,
}

impl Wqueue {
    pub fn new(name: &'static str, nr_threads: usize) -> Self {
        assert!(nr_threads > 0);
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        for i in 0..nr_threads {
            let rx = Arc::clone(&rx);
            thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || {
                    loop {
                        let job = rx.lock().unwrap().recv();
                        match job {
                            Ok(job) => job(),
                            Err(_) => break,
                        }
                    }
                })
                .expect("failed to spawn worker thread");
        }
        Self { name, tx }
    }

    /// Queues a work item. Items are picked up in order by idle workers.
    pub fn queue<F: FnOnce() + Send + 'static>(&self, job: F) {
        debug!("queue work on {}", self.name);
        // send only fails when every worker died, which cannot happen
        // outside of teardown
        let _ = self.tx.send(Box::new(job));
    }
}

struct TimerEntry {
    deadline: Instant,
    job: Job,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // min-heap on the deadline
        other.deadline.cmp(&self.deadline)
    }
}

#[derive(Default)]
struct TimerShared {
    heap: Mutex<BinaryHeap<TimerEntry>>,
    cond: Condvar,
}

/// One-shot timers fired from a dedicated thread.
pub struct TimerQueue {
    shared: Arc<TimerShared>,
}

impl TimerQueue {
    pub fn new() -> Self {
        let shared = Arc::new(TimerShared::default());
        let run = Arc::clone(&shared);
        thread::Builder::new()
            .name("timer".to_string())
            .spawn(move || {
                let mut heap = run.heap.lock().unwrap();
                loop {
                    let now = Instant::now();
                    match heap.peek() {
                        Some(entry) if entry.deadline <= now => {
                            let entry = heap.pop().unwrap();
                            drop(heap);
                            (entry.job)();
                            heap = run.heap.lock().unwrap();
                        }
                        Some(entry) => {
                            let wait = entry.deadline - now;
                            heap = run.cond.wait_timeout(heap, wait).unwrap().0;
                        }
                        None => {
                            heap = run.cond.wait(heap).unwrap();
                        }
                    }
                }
            })
            .expect("failed to spawn timer thread");
        Self { shared }
    }

    /// Schedules `job` to run once after `delay`.
    pub fn add_timer<F: FnOnce() + Send + 'static>(&self, delay: Duration, job: F) {
        let entry = TimerEntry {
            deadline: Instant::now() + delay,
            job: Box::new(job),
        };
        self.shared.heap.lock().unwrap().push(entry);
        self.shared.cond.notify_one();
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering as AtomicOrdering;

    #[test]
    fn work_items_run() {
        let wq = Wqueue::new("test", 2);
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            let tx = tx.clone();
            wq.queue(move || {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                tx.send(()).unwrap();
            });
        }
        for _ in 0..8 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 8);
    }

    #[test]
    fn timer_fires_in_order() {
        let timers = TimerQueue::new();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        timers.add_timer(Duration::from_millis(80), move || tx2.send(2).unwrap());
        timers.add_timer(Duration::from_millis(10), move || tx.send(1).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
    }
}
