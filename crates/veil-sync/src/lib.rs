//! # Synchronization Primitives
//!
//! The two pieces the shim needs and nothing more: a [`SpinLock`] for the
//! single coarse mutex serialising every allocator operation, and an
//! [`InitCell`] for publishing the engine exactly once at boot.
//!
//! Both are uniprocessor-grade: critical sections are short, there is no
//! interrupt masking, and waiters busy-spin.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod init_cell;
mod spin_lock;

pub use init_cell::InitCell;
pub use spin_lock::{SpinLock, SpinLockGuard};
