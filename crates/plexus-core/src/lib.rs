//! # plexus-core
//!
//! Reactor-independent building blocks shared by the networking layers:
//!
//! - [`error`]: the [`NetError`] taxonomy and crate-wide `Result` alias
//! - [`settings`]: the key-value [`Settings`] bag passed through every `init`
//! - [`action`]: re-runnable, disposable callbacks ([`Action`], [`Disposable`])
//! - [`buffer`]: bounded producer/consumer buffers with demand signaling
//!
//! Nothing in here knows about sockets or the reactor. The networking crate
//! builds on these types; applications use the buffer resources to move items
//! between the reactor thread and their own worker threads.

pub mod action;
pub mod buffer;
pub mod error;
pub mod settings;

pub use action::{Action, Disposable};
pub use buffer::{make_buffer_resource, Buffer, ConsumerResource, DemandSignal, ProducerResource};
pub use error::{NetError, Result};
pub use settings::Settings;
