use std::sync::{Condvar, Mutex};

struct State {
    /// Number of threads holding a read pin.
    readers: u32,
    /// A thread holds the write pin.
    writer: bool,
    /// Threads blocked in `acquire_write` or `promote`.
    waiting_writers: u32,
}

/// A sleeping reader/writer lock.
///
/// Unlike `std::sync::RwLock` this lock hands out no guards: acquire and
/// release are separate operations, so a pin taken in one function can be
/// released in another, or handed from an eviction path to a reader. The
/// caller is responsible for pairing them.
///
/// Writers get modest preference: new readers wait behind a blocked writer
/// so a stream of readers cannot starve the eviction path forever.
pub struct Rwlock {
    state: Mutex<State>,
    /// Signalled when the write pin is released.
    readers: Condvar,
    /// Signalled when the lock becomes free for a writer.
    writers: Condvar,
}

impl Rwlock {
    pub fn new() -> Rwlock {
        Rwlock {
            state: Mutex::new(State {
                readers: 0,
                writer: false,
                waiting_writers: 0,
            }),
            readers: Condvar::new(),
            writers: Condvar::new(),
        }
    }

    pub fn acquire_read(&self) {
        let mut state = self.state.lock().unwrap();
        while state.writer || state.waiting_writers > 0 {
            state = self.readers.wait(state).unwrap();
        }
        state.readers += 1;
    }

    pub fn release_read(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.readers > 0, "release_read: no read pin held");
        state.readers -= 1;
        if state.readers == 0 {
            self.writers.notify_one();
        }
    }

    pub fn acquire_write(&self) {
        let mut state = self.state.lock().unwrap();
        state.waiting_writers += 1;
        while state.writer || state.readers > 0 {
            state = self.writers.wait(state).unwrap();
        }
        state.waiting_writers -= 1;
        state.writer = true;
    }

    /// Takes the write pin iff the lock is entirely free.
    pub fn try_acquire_write(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.writer || state.readers > 0 {
            return false;
        }
        state.writer = true;
        true
    }

    pub fn release_write(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.writer, "release_write: no write pin held");
        state.writer = false;
        if state.waiting_writers > 0 {
            self.writers.notify_one();
        } else {
            self.readers.notify_all();
        }
    }

    /// Exchanges a read pin for the write pin.
    ///
    /// The exchange is not atomic: the read pin is dropped before the write
    /// pin is acquired, and another writer may run in the gap. Callers must
    /// re-verify whatever state the read pin was protecting once `promote`
    /// returns.
    pub fn promote(&self) {
        self.release_read();
        self.acquire_write();
    }

    /// Atomically converts the held write pin into a read pin.
    pub fn demote(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.writer, "demote: no write pin held");
        state.writer = false;
        state.readers = 1;
        // Other readers may now join.
        self.readers.notify_all();
    }
}

impl Default for Rwlock {
    fn default() -> Rwlock {
        Rwlock::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn readers_share_writers_exclude() {
        let lock = Rwlock::new();
        lock.acquire_read();
        lock.acquire_read();
        assert!(!lock.try_acquire_write());
        lock.release_read();
        lock.release_read();
        assert!(lock.try_acquire_write());
        assert!(!lock.try_acquire_write());
        lock.release_write();
    }

    #[test]
    fn demote_readmits_readers() {
        let lock = Arc::new(Rwlock::new());
        lock.acquire_write();
        lock.demote();

        let other = Arc::clone(&lock);
        let t = thread::spawn(move || {
            other.acquire_read();
            other.release_read();
        });
        t.join().unwrap();
        lock.release_read();
    }

    #[test]
    fn promote_waits_for_other_readers() {
        let lock = Arc::new(Rwlock::new());
        let hits = Arc::new(AtomicU32::new(0));

        lock.acquire_read();
        let (l, h) = (Arc::clone(&lock), Arc::clone(&hits));
        let t = thread::spawn(move || {
            l.acquire_read();
            thread::sleep(Duration::from_millis(50));
            h.store(1, Ordering::SeqCst);
            l.release_read();
        });
        thread::sleep(Duration::from_millis(10));
        lock.promote();
        // The second reader must have finished before the write pin is ours.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        lock.release_write();
        t.join().unwrap();
    }

    #[test]
    fn write_pin_blocks_concurrent_writer() {
        let lock = Arc::new(Rwlock::new());
        let order = Arc::new(AtomicU32::new(0));

        lock.acquire_write();
        let (l, o) = (Arc::clone(&lock), Arc::clone(&order));
        let t = thread::spawn(move || {
            l.acquire_write();
            assert_eq!(o.load(Ordering::SeqCst), 1);
            l.release_write();
        });
        thread::sleep(Duration::from_millis(20));
        order.store(1, Ordering::SeqCst);
        lock.release_write();
        t.join().unwrap();
    }
}
