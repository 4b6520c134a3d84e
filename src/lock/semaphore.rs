use std::sync::{Condvar, Mutex};

/// A counting semaphore.
///
/// `down` blocks until the count is positive and decrements it; `up`
/// increments the count and wakes one waiter. With an initial count of 1 it
/// doubles as a binary lock whose acquire and release need not be lexically
/// paired (the directory lock uses it this way).
pub struct Semaphore {
    value: Mutex<usize>,
    avail: Condvar,
}

impl Semaphore {
    pub fn new(value: usize) -> Semaphore {
        Semaphore {
            value: Mutex::new(value),
            avail: Condvar::new(),
        }
    }

    pub fn down(&self) {
        let mut value = self.value.lock().unwrap();
        while *value == 0 {
            value = self.avail.wait(value).unwrap();
        }
        *value -= 1;
    }

    /// Decrements the count iff it is positive.
    pub fn try_down(&self) -> bool {
        let mut value = self.value.lock().unwrap();
        if *value == 0 {
            return false;
        }
        *value -= 1;
        true
    }

    pub fn up(&self) {
        let mut value = self.value.lock().unwrap();
        *value += 1;
        self.avail.notify_one();
    }
}
