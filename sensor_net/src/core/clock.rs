use serde::{Deserialize, Serialize};
use std::cmp::max;
use std::sync::{Arc, Mutex, MutexGuard};

/// A scalar Lamport clock. The value never decreases.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LamportClock {
  time: u64,
}
impl LamportClock {
  pub fn new() -> LamportClock {
    LamportClock { time: 0 }
  }

  /// Starts the clock at a restored value.
  pub fn with_time(time: u64) -> LamportClock {
    LamportClock { time: time }
  }

  /// Local event: advances by one and returns the new value.
  pub fn tick(&mut self) -> u64 {
    self.time += 1;
    self.time
  }

  /// Receive event: the result is strictly greater than both the prior local value and
  /// `received`.
  pub fn update(&mut self, received: u64) -> u64 {
    self.time = max(self.time, received) + 1;
    self.time
  }

  pub fn time(&self) -> u64 {
    self.time
  }
}

/// A [`LamportClock`] behind a mutex, for callers on different tasks or threads.
///
/// Every `tick` and `update` runs inside the critical section, so interleaved callers never lose
/// an increment.
#[derive(Clone, Debug, Default)]
pub struct SharedClock {
  inner: Arc<Mutex<LamportClock>>,
}
impl SharedClock {
  pub fn new(clock: LamportClock) -> SharedClock {
    SharedClock {
      inner: Arc::new(Mutex::new(clock)),
    }
  }

  fn lock(&self) -> MutexGuard<'_, LamportClock> {
    // A panic while holding the lock cannot leave the counter half-written.
    self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn tick(&self) -> u64 {
    self.lock().tick()
  }

  pub fn update(&self, received: u64) -> u64 {
    self.lock().update(received)
  }

  pub fn time(&self) -> u64 {
    self.lock().time()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;

  #[test]
  fn tick_and_update() {
    let mut clock = LamportClock::new();
    assert_eq!(clock.tick(), 1);
    assert_eq!(clock.update(10), 11);
    assert_eq!(clock.update(3), 12);
    assert_eq!(clock.tick(), 13);
    assert_eq!(clock.time(), 13);
  }

  #[test]
  fn strictly_greater_than_everything_seen() {
    let mut clock = LamportClock::with_time(5);
    let mut seen = vec![clock.time()];
    for received in [0u64, 7, 7, 2, 100, 99, 101] {
      let before = clock.time();
      let after = clock.update(received);
      assert!(after > before && after > received);
      seen.push(received);
      let local = clock.tick();
      assert!(seen.iter().all(|s| local > *s));
      seen.push(local);
    }
  }

  #[test]
  fn concurrent_ticks_are_not_lost() {
    let clock = SharedClock::new(LamportClock::new());
    let workers = (0..8)
      .map(|_| {
        let c = clock.clone();
        thread::spawn(move || {
          for _ in 0..1000 {
            c.tick();
          }
        })
      })
      .collect::<Vec<_>>();
    for w in workers {
      w.join().unwrap();
    }
    assert_eq!(clock.time(), 8000);
  }
}
