//! The queue facade: a named segment bound to a ring protocol.
//!
//! This is the only layer that knows the ring lives in shared memory. The
//! protocol types themselves ([`Broadcast`], [`Unicast`](crate::ring::unicast::Unicast))
//! operate on plain atomic fields and are chosen at the type level.
//!
//! Per-process state is deliberately small: the mapping handle, the local
//! read cursor, the reader id and the sender flag. Everything else is shared.

use std::marker::PhantomData;
use std::mem;
use std::mem::MaybeUninit;

use serde_derive::{Deserialize, Serialize};

use crate::errors::ShmqError;
use crate::ring::broadcast::Broadcast;
use crate::ring::Ring;
use crate::shm::{OpenMode, ShmHandle};

/// Default slot count per channel.
pub const DEFAULT_RING_SIZE: usize = 64;

/// Channel naming, shared between the binaries; loads from TOML via `confy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel name; keys every kernel object belonging to the channel.
    pub name: String,
    /// Optional namespace prepended to the name.
    pub prefix: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            name: String::from("shmq-channel"),
            prefix: String::new(),
        }
    }
}

impl ChannelConfig {
    /// The full name keying the channel's kernel objects.
    pub fn qualified(&self) -> String {
        if self.prefix.is_empty() {
            self.name.clone()
        } else {
            format!("{}_{}", self.prefix, self.name)
        }
    }
}

/// One endpoint of a named queue.
///
/// Any number of endpoints may exist per channel, across processes or within
/// one. An endpoint pushes without registration; `connect` turns it into a
/// reader with its own cursor. Dropping the endpoint releases the mapping
/// only — readers should `disconnect` first, and the name persists until
/// [`Queue::clear_storage`].
pub struct Queue<T, R = Broadcast<T, DEFAULT_RING_SIZE>>
where
    T: Copy,
    R: Ring<T>,
{
    handle: Option<ShmHandle>,
    name: String,
    cursor: u16,
    connected_id: u32,
    sender_flag: bool,
    _marker: PhantomData<(T, R)>,
}

impl<T, R> Queue<T, R>
where
    T: Copy,
    R: Ring<T>,
{
    /// Opens the named channel, creating and initializing the ring segment
    /// if this endpoint is first.
    pub fn open(name: &str) -> Result<Self, ShmqError> {
        let handle = ShmHandle::acquire(name, mem::size_of::<R>(), OpenMode::CreateOrOpen)?;
        let queue: Queue<T, R> = Queue {
            handle: Some(handle),
            name: name.to_string(),
            cursor: 0,
            connected_id: 0,
            sender_flag: false,
            _marker: PhantomData,
        };
        if let Some(ring) = queue.ring() {
            unsafe { &*ring }.init();
        }
        Ok(queue)
    }

    // The mapping is page-aligned and at least size_of::<R>() long, so the
    // cast is sound for the lifetime of the handle.
    #[inline]
    fn ring(&self) -> Option<*const R> {
        self.handle.as_ref().map(|h| h.as_ptr() as *const R)
    }

    pub fn valid(&self) -> bool {
        self.handle.is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connected(&self) -> bool {
        self.connected_id != 0
    }

    pub fn connected_id(&self) -> u32 {
        self.connected_id
    }

    /// Registers this endpoint as a producer. Idempotent.
    pub fn ready_sending(&mut self) -> bool {
        let Some(ring) = self.ring() else {
            return false;
        };
        if !self.sender_flag {
            self.sender_flag = unsafe { &*ring }.connect_sender();
        }
        self.sender_flag
    }

    pub fn shut_sending(&mut self) {
        let Some(ring) = self.ring() else {
            return;
        };
        if self.sender_flag {
            unsafe { &*ring }.disconnect_sender();
            self.sender_flag = false;
        }
    }

    /// Registers this endpoint as a reader. The cursor starts at the current
    /// commit index: a fresh reader does not replay history. False when the
    /// channel already carries its maximum number of readers.
    pub fn connect(&mut self) -> bool {
        let Some(ring) = self.ring() else {
            return false;
        };
        if self.connected_id != 0 {
            return true;
        }
        let ring = unsafe { &*ring };
        let id = ring.connect_receiver();
        if id == 0 {
            return false;
        }
        self.connected_id = id;
        self.cursor = ring.cursor();
        true
    }

    pub fn disconnect(&mut self) -> bool {
        let Some(ring) = self.ring() else {
            return false;
        };
        if self.connected_id == 0 {
            return false;
        }
        let id = mem::replace(&mut self.connected_id, 0);
        unsafe { &*ring }.disconnect_receiver(id);
        true
    }

    /// Whether this reader has caught up with the producers.
    pub fn empty(&self) -> bool {
        match self.ring() {
            Some(ring) => self.cursor == unsafe { &*ring }.cursor(),
            None => true,
        }
    }

    pub fn conn_count(&self) -> usize {
        match self.ring() {
            Some(ring) => unsafe { &*ring }.conn_count(),
            None => 0,
        }
    }

    /// Publishes one message. False when the ring is full for some live
    /// reader or nobody is connected.
    pub fn push(&self, item: T) -> bool {
        self.push_with(|slot| {
            slot.write(item);
        })
    }

    /// Publishes one message constructed in place: `prep` runs while this
    /// producer owns the claimed slot and must fully initialize it.
    pub fn push_with(&self, prep: impl FnOnce(&mut MaybeUninit<T>)) -> bool {
        let Some(ring) = self.ring() else {
            return false;
        };
        let mut prep = Some(prep);
        unsafe { &*ring }.push(&mut |p| {
            if let Some(f) = prep.take() {
                f(unsafe { &mut *p.cast::<MaybeUninit<T>>() });
            }
        })
    }

    /// Publishes one message, evicting readers that block the target slot.
    pub fn force_push(&self, item: T) -> bool {
        self.force_push_with(|slot| {
            slot.write(item);
        })
    }

    /// In-place construction variant of [`force_push`](Queue::force_push).
    pub fn force_push_with(&self, prep: impl FnOnce(&mut MaybeUninit<T>)) -> bool {
        let Some(ring) = self.ring() else {
            return false;
        };
        let mut prep = Some(prep);
        unsafe { &*ring }.force_push(&mut |p| {
            if let Some(f) = prep.take() {
                f(unsafe { &mut *p.cast::<MaybeUninit<T>>() });
            }
        })
    }

    /// Takes the next message for this reader, or `None` when the queue is
    /// empty from its point of view.
    pub fn pop(&mut self) -> Option<T> {
        self.pop_with(|_| {})
    }

    /// Like [`pop`](Queue::pop); `out` additionally receives whether this
    /// read released the slot for rewriting.
    pub fn pop_with(&mut self, out: impl FnOnce(bool)) -> Option<T> {
        let Some(ring) = self.ring() else {
            return None;
        };
        if self.connected_id == 0 {
            return None;
        }
        let ring = unsafe { &*ring };
        if !ring.is_connected(self.connected_id) {
            // evicted by a force_push; this reader is out of the channel
            self.connected_id = 0;
            return None;
        }
        let mut item = MaybeUninit::<T>::uninit();
        let mut read = |p: *const T| unsafe { item.as_mut_ptr().write(p.read()) };
        let last = ring.pop(&mut self.cursor, self.connected_id, &mut read)?;
        out(last);
        Some(unsafe { item.assume_init() })
    }

    /// Drops the mapping and unlinks the backing name; the endpoint becomes
    /// invalid and every operation turns into a refusing no-op.
    pub fn clear(&mut self) {
        self.connected_id = 0;
        self.sender_flag = false;
        if self.handle.take().is_some() {
            ShmHandle::clear_storage(&self.name);
        }
    }

    /// Unlinks the channel's backing segment by name.
    pub fn clear_storage(name: &str) -> bool {
        ShmHandle::clear_storage(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::unique_name;

    #[test]
    fn empty_name_is_refused() {
        assert!(Queue::<u64>::open("").is_err());
    }

    #[test]
    fn roundtrip_between_two_endpoints() {
        let name = unique_name("queue-roundtrip");
        let writer: Queue<u64> = Queue::open(&name).unwrap();
        let mut reader: Queue<u64> = Queue::open(&name).unwrap();
        assert!(reader.connect());
        assert!(reader.empty());

        for v in 1..=5u64 {
            assert!(writer.push(v));
        }
        assert!(!reader.empty());
        for v in 1..=5u64 {
            assert_eq!(reader.pop(), Some(v));
        }
        assert_eq!(reader.pop(), None);
        assert!(reader.empty());

        assert!(reader.disconnect());
        Queue::<u64>::clear_storage(&name);
    }

    #[test]
    fn push_without_readers_is_refused() {
        let name = unique_name("queue-noreader");
        let mut writer: Queue<u64> = Queue::open(&name).unwrap();
        assert!(writer.ready_sending());
        assert!(!writer.push(1));
        writer.shut_sending();
        Queue::<u64>::clear_storage(&name);
    }

    #[test]
    fn ready_sending_is_idempotent() {
        let name = unique_name("queue-sender");
        let mut writer: Queue<u64> = Queue::open(&name).unwrap();
        assert!(writer.ready_sending());
        assert!(writer.ready_sending());
        writer.shut_sending();
        writer.shut_sending();
        Queue::<u64>::clear_storage(&name);
    }

    #[test]
    fn reader_table_is_bounded() {
        let name = unique_name("queue-bounded");
        let mut endpoints: Vec<Queue<u64>> = Vec::new();
        for _ in 0..crate::ring::MAX_RECEIVERS {
            let mut q: Queue<u64> = Queue::open(&name).unwrap();
            assert!(q.connect());
            endpoints.push(q);
        }
        let mut extra: Queue<u64> = Queue::open(&name).unwrap();
        assert!(!extra.connect(), "33rd reader must be refused");
        assert_eq!(extra.conn_count(), crate::ring::MAX_RECEIVERS);

        for q in &mut endpoints {
            assert!(q.disconnect());
        }
        assert_eq!(extra.conn_count(), 0);
        Queue::<u64>::clear_storage(&name);
    }

    #[test]
    fn evicted_reader_reports_empty_and_disconnects_itself() {
        let name = unique_name("queue-evict");
        let writer: Queue<u64> = Queue::open(&name).unwrap();
        let mut fast: Queue<u64> = Queue::open(&name).unwrap();
        let mut parked: Queue<u64> = Queue::open(&name).unwrap();
        assert!(fast.connect());
        assert!(parked.connect());

        for v in 0..DEFAULT_RING_SIZE as u64 {
            assert!(writer.push(v));
        }
        assert!(!writer.push(u64::MAX), "parked reader holds the ring full");
        while fast.pop().is_some() {}
        assert!(!writer.push(u64::MAX), "a drained fast reader frees nothing");

        assert!(writer.force_push(7777));
        assert_eq!(fast.pop(), Some(7777));

        assert_eq!(parked.pop(), None);
        assert!(!parked.connected(), "eviction must be observed as disconnection");
        assert_eq!(parked.pop(), None, "and stay that way");

        Queue::<u64>::clear_storage(&name);
    }

    #[test]
    fn cleared_queue_refuses_everything() {
        let name = unique_name("queue-clear");
        let mut q: Queue<u64> = Queue::open(&name).unwrap();
        assert!(q.connect());
        q.clear();
        assert!(!q.valid());
        assert!(!q.push(1));
        assert_eq!(q.pop(), None);
        assert!(!q.connect());
        assert!(q.empty());
        assert_eq!(q.conn_count(), 0);
    }

    #[test]
    fn unicast_queue_delivers_each_message_once() {
        use crate::ring::unicast::Unicast;

        let name = unique_name("queue-unicast");
        let writer: Queue<u64, Unicast<u64, 16>> = Queue::open(&name).unwrap();
        let mut a: Queue<u64, Unicast<u64, 16>> = Queue::open(&name).unwrap();
        let mut b: Queue<u64, Unicast<u64, 16>> = Queue::open(&name).unwrap();
        assert!(a.connect());
        assert!(b.connect());

        for v in 1..=6u64 {
            assert!(writer.push(v));
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(a.pop().unwrap());
            seen.push(b.pop().unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);

        Queue::<u64, Unicast<u64, 16>>::clear_storage(&name);
    }

    #[test]
    fn in_place_construction_roundtrip() {
        #[derive(Clone, Copy, PartialEq, Debug)]
        struct Sample {
            seq: u32,
            flags: u32,
        }

        let name = unique_name("queue-prep");
        let writer: Queue<Sample> = Queue::open(&name).unwrap();
        let mut reader: Queue<Sample> = Queue::open(&name).unwrap();
        assert!(reader.connect());

        assert!(writer.push_with(|slot| {
            slot.write(Sample {
                seq: 7,
                flags: 0xdead,
            });
        }));
        assert_eq!(
            reader.pop(),
            Some(Sample {
                seq: 7,
                flags: 0xdead
            })
        );
        Queue::<Sample>::clear_storage(&name);
    }

    #[test]
    fn config_builds_qualified_names() {
        let mut cfg = ChannelConfig::default();
        assert_eq!(cfg.qualified(), "shmq-channel");
        cfg.prefix = String::from("app");
        cfg.name = String::from("events");
        assert_eq!(cfg.qualified(), "app_events");
    }
}
