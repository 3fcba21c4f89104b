// core/src/sync/mod.rs

//! Asynchronous wait/signal primitives: a bounded counting semaphore, a
//! countdown signal and a manual-reset signal.

mod backoff;
mod completion;
pub mod countdown;
pub mod manual_reset;
pub mod semaphore;

pub use countdown::CountdownSignal;
pub use manual_reset::ManualResetSignal;
pub use semaphore::{AsyncSemaphore, SemaphoreWait};
