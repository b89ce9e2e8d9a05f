//! Lock-free broadcast message queues over POSIX shared memory.
//!
//! # Overview
//! Processes on one machine exchange fixed-size messages through named
//! channels. The hot path is a circular array of slots in a shared segment,
//! driven purely by atomics: `push` and `pop` never enter the kernel, they
//! succeed, report full/empty, or retry through an escalating backoff.
//!
//! Key components:
//! - [`Queue`]: one endpoint of a named channel; producers push, connected
//!   readers pop against their own cursor.
//! - [`Broadcast`]: the default ring protocol. Every reader sees every
//!   message; a slot recycles once all readers released it. Up to 32 readers
//!   per channel, any number of producers.
//! - [`Unicast`]: the work-queue protocol. Each message goes to exactly one
//!   of the competing readers.
//! - [`Waiter`] / [`Condition`]: cross-process blocking for callers that
//!   want to sleep on an empty channel instead of spinning.
//! - [`Mutex`] / [`Semaphore`] / [`ShmHandle`]: the named kernel objects the
//!   rest is built from.
//!
//! # Concurrency model and recovery
//! Producers coordinate through a per-slot packed state word; the winner of
//! that exchange owns the slot's payload until it publishes the commit flag.
//! Readers only ever clear their own bit. A reader that stops consuming
//! eventually holds the ring full for everyone; [`Queue::force_push`] evicts
//! such readers and carries on, and an evicted reader observes its
//! disconnection on its next `pop`. A process that dies while holding a
//! named mutex leaves it recoverable: the next acquirer restores consistency
//! and proceeds.
//!
//! Clean shutdown is cooperative: call [`Waiter::quit_waiting`] for every
//! waiter, then [`Queue::disconnect`] / [`Queue::shut_sending`], then drop.
//! Names persist until the matching `clear_storage` call unlinks them.

#[cfg(not(target_os = "linux"))]
compile_error!("shmq requires Linux (POSIX shared memory, robust pthread mutexes).");

pub mod backoff;
pub mod errors;
mod guard;
pub mod queue;
pub mod ring;
pub mod shm;
pub mod sync;

#[cfg(test)]
mod tests;

pub use errors::ShmqError;
pub use queue::{ChannelConfig, Queue, DEFAULT_RING_SIZE};
pub use ring::broadcast::Broadcast;
pub use ring::unicast::Unicast;
pub use ring::{Ring, MAX_RECEIVERS};
pub use shm::{OpenMode, ShmHandle};
pub use sync::condition::Condition;
pub use sync::mutex::Mutex;
pub use sync::semaphore::Semaphore;
pub use sync::waiter::Waiter;
pub use sync::TIMEOUT_INFINITE;
