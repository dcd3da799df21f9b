//! Bounded lock-free SPSC channel with futex-backed blocking.
//!
//! `strait` moves a sequence of values between exactly one producer thread
//! and one consumer thread through a fixed-capacity ring buffer, without a
//! mutex on the hot path. Progress is published through two packed 32-bit
//! position words; a side only touches an OS wait primitive when the buffer
//! is full (producer) or empty (consumer).
//!
//! Either endpoint may be dropped at any time, including mid-buffer. The
//! receiver always gets to drain what was already published; the sender
//! stops immediately once the receiver is gone. In-flight values are
//! destroyed exactly once and storage is freed exactly once, by whichever
//! endpoint detaches last.
//!
//! # Example
//!
//! ```
//! let (tx, rx) = strait::channel::<String>(64).unwrap();
//!
//! let producer = std::thread::spawn(move || {
//!     for i in 0..100 {
//!         tx.send(format!("message {i}")).expect("receiver is alive");
//!     }
//! });
//!
//! let messages: Vec<String> = rx.collect();
//! producer.join().unwrap();
//! assert_eq!(messages.len(), 100);
//! ```

pub mod channel;
pub(crate) mod position;
pub(crate) mod ring;
pub mod trace;

#[doc(inline)]
pub use channel::{ChannelError, Receiver, Sender, channel};
