// core/src/sync/backoff.rs

/// Bounded exponential backoff for compare-and-retry loops.
///
/// Spins `2^step` times up to `SPIN_LIMIT`, then yields the thread for the
/// remaining steps. Never parks indefinitely.
#[derive(Debug, Default)]
pub(crate) struct Backoff {
  step: u32,
}

impl Backoff {
  const SPIN_LIMIT: u32 = 6;
  const YIELD_LIMIT: u32 = 10;

  pub(crate) fn new() -> Self {
    Self { step: 0 }
  }

  /// Called after a failed compare-exchange.
  pub(crate) fn snooze(&mut self) {
    if self.step <= Self::SPIN_LIMIT {
      for _ in 0..(1u32 << self.step) {
        std::hint::spin_loop();
      }
    } else {
      std::thread::yield_now();
    }
    if self.step <= Self::YIELD_LIMIT {
      self.step += 1;
    }
  }

  #[cfg(test)]
  pub(crate) fn is_yielding(&self) -> bool {
    self.step > Self::SPIN_LIMIT
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn escalates_to_yielding() {
    let mut backoff = Backoff::new();
    assert!(!backoff.is_yielding());
    for _ in 0..=Backoff::SPIN_LIMIT {
      backoff.snooze();
    }
    assert!(backoff.is_yielding());
    // Bounded: further snoozes keep working without overflow.
    for _ in 0..64 {
      backoff.snooze();
    }
    assert!(backoff.is_yielding());
  }
}
