//! # **List** **Q**ueue.
//!
//! A persistent task queue, shared by any number of processes, built
//! on three structures of a key/value store:
//!
//! 1. A list holding the pending tasks, in order.  Producers push
//!    onto the tail (or the head, for urgent tasks), and consumers pop
//!    from the head.  Every pop is atomic, so each task goes to
//!    exactly one consumer.
//! 2. A pub/sub channel, used to wake consumers up when a task is
//!    pushed.  Pub/sub has no backlog and no delivery guarantee; a
//!    consumer that is not listening at the moment of the publish
//!    never hears about it.
//! 3. A scored set recording which consumers are alive, and when they
//!    were last seen.
//!
//! Because notifications can go missing, they are only used to cut
//! latency.  Every consumer also polls the list on a fixed
//! [heartbeat](QueueConfig::with_heartbeat), so a task is picked up
//! within one heartbeat even if no notification for it ever arrives.
//!
//! ## Usage
//!
//! A [`Queue`] is a handle on one named queue.  It can publish tasks,
//! pop them one at a time with [`Queue::get_task`], or run a consumer
//! with [`Queue::consume`], which hands tasks over through a
//! [`Feed`].  Tasks are plain strings; [`Queue::publish_json`] and
//! [`Queue::get_task_json`] add a `serde_json` layer on top.
//!
//! Delivery is at-least-once at best: once a task has been handed to
//! a consumer, it is gone from the store, and it is up to the
//! consumer to finish it.
//!
//! ## Backends
//!
//! The store is abstracted by the [`Backend`] trait.  Two come with
//! the crate:
//!
//! - [`redis`] (feature `redis`), backed by a Redis server, with a
//!   key layout compatible with existing deployments.
//! - [`memory`] (feature `memory`), an in-process store, mostly useful
//!   for tests.

pub mod backend;
pub mod config;
mod consumer;
mod id;
#[cfg(feature = "memory")]
pub mod memory;
mod presence;
mod producer;
mod queue;
#[cfg(feature = "redis")]
pub mod redis;

pub use self::backend::{Backend, Listener};
pub use self::config::{ConfigError, ConnectionOptions, QueueConfig};
pub use self::consumer::Feed;
pub use self::id::{ConsumerId, IdentityError};
pub use self::queue::{Queue, QueueError};
