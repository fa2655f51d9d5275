#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]

//! The _storeclient_ library serves many concurrent readers of one cached
//! response object. The object may still be streaming in from upstream while
//! it is read, and its bytes may live partly in memory and partly on disk.
//!
//! # Design
//!
//! Like a network stack driven by an event loop, the store never blocks and
//! never spawns anything. All state lives in a [Store](store/struct.Store.html):
//! the cache entries, the readers attached to them, the disk collaborator and
//! a queue of deferred deliveries. Progress happens inside explicit calls:
//! a producer appends bytes with `append`, a consumer asks for bytes with
//! `copy`, and the owner of the loop calls `poll` to collect disk completions
//! and run deliveries. A consumer callback always runs from `poll`, never from
//! inside the call that made the data available, so it may freely call back
//! into the store, including unregistering itself.
//!
//! # Readers
//!
//! Every reader is a [StoreClient](client/struct.StoreClient.html), addressed
//! through a [ClientHandle](store/struct.ClientHandle.html). A reader asks for
//! one range at a time and is answered exactly once per request. The first
//! answer always hands over the parsed reply head; body offsets follow.
//! Memory is consulted first; only a disk-backed reader may read from the
//! [Disk](disk/trait.Disk.html) collaborator, and the first disk reader of an
//! object warms the memory copy for everyone after it.
//!
//! # Quick abort
//!
//! When the last reader of a still-incomplete entry goes away, the
//! [quick abort](store/quick_abort/index.html) policy decides whether the
//! fetch is worth finishing for future hits or should be abandoned.
//!
//! # Minimum Supported Rust Version (MSRV)
//!
//! This crate is guaranteed to compile on stable Rust 1.87 and up with any valid set of features.

extern crate alloc;

#[macro_use]
mod macros;

pub mod client;
pub mod disk;
pub mod entry;
pub mod storage;
pub mod store;
pub mod wire;
