//! # questnet-module - Default implementations
//!
//! This crate provides the default implementation for every questnet-core
//! trait, plus the raw socket helpers the engine uses.
//!
//! ## Default stack
//!
//! | Trait            | Default Impl       | Alternative               |
//! |------------------|--------------------|---------------------------|
//! | Notifier         | EventFdNotifier    | PipeNotifier (non-Linux)  |
//! | TaskPool         | FixedPool          |                           |
//! | Codec            | BinaryCodec        |                           |
//! | CipherSuite      | ChaChaSuite        |                           |
//! | KeyExchange      | PresharedExchange  | application-provided      |
//! | ReliableDatagram | BasicDatagram      | application-provided      |
//!
//! Readiness multiplexing is `PollSet` (`poll(2)`).

pub mod sys;
pub mod poll_set;
pub mod fixed_pool;
pub mod pipe_notifier;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod eventfd_notifier;
pub mod binary_codec;
pub mod chacha_cipher;
pub mod basic_datagram;

pub use basic_datagram::BasicDatagram;
pub use binary_codec::BinaryCodec;
pub use chacha_cipher::{ChaChaEncryptor, ChaChaSuite, PresharedExchange};
pub use fixed_pool::FixedPool;
pub use pipe_notifier::PipeNotifier;
pub use poll_set::{PollSet, Readiness};

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        pub use eventfd_notifier::EventFdNotifier;
        /// Notifier used by the engine on this platform.
        pub type DefaultNotifier = EventFdNotifier;
    } else {
        /// Notifier used by the engine on this platform.
        pub type DefaultNotifier = PipeNotifier;
    }
}
