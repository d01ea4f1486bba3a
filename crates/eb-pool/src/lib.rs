//! Indexed slot pool for datagram hand-off between a producer and the reader.
//!
//! A [`SlotPool`] owns a fixed number of pre-allocated byte slots. A producer
//! fills a slot and publishes it; the consumer pops the next published
//! [`SlotHandle`], copies the datagram out and frees the slot by index. This is
//! the "get next chunk / free chunk by handle" contract of a shared-memory
//! transport without tying the event builder to a particular IPC mechanism.
//!
//! # Memory Flow
//!
//! ```text
//! 1. SlotPool pre-allocates `n_slots` buffers at startup
//! 2. Producer: try_acquire()/acquire() -> WritableSlot (index reserved)
//! 3. Producer: copy_from_slice(dgram) then publish() -> SlotHandle
//! 4. Consumer: get() -> SlotHandle { index, size }
//! 5. Consumer: copy_out(handle) -> Bytes (owned copy)
//! 6. Consumer: free_by_index(index, size) -> slot is reusable
//! ```
//!
//! # Example
//!
//! ```
//! use eb_pool::SlotPool;
//!
//! let pool = SlotPool::new(4, 1024);
//! let mut slot = pool.try_acquire().unwrap();
//! slot.copy_from_slice(b"datagram");
//! slot.publish();
//!
//! let handle = pool.get().unwrap();
//! let bytes = pool.copy_out(handle);
//! pool.free_by_index(handle.index, handle.size);
//! assert_eq!(&bytes[..], b"datagram");
//! assert_eq!(pool.available(), 4);
//! ```

pub mod slot_pool;

pub use slot_pool::{SlotHandle, SlotPool, WritableSlot};
