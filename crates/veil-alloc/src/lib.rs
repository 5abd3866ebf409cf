//! # VEIL: an aliasing hardening shim for unikernel heaps
//!
//! VEIL sits between a program and the physical page allocator of a
//! single-address-space x86-64 unikernel. Every allocation the backing
//! allocator serves is *republished* at a distinct virtual address (an
//! alias) that maps, through the live page tables, to the same physical
//! pages. Freeing tears the alias's mappings down and retires its address
//! range forever.
//!
//! What that buys:
//!
//! - **use-after-free** → the freed alias has no translation, ever again:
//!   immediate page fault;
//! - **linear overflow** → the page after an allocation is reserved but
//!   unmapped (guard configurations): immediate page fault;
//! - **heap layout secrecy** → each object can land at a uniformly random
//!   slot of a terabytes-wide pool (per-object ASLR).
//!
//! ## Dataflow
//!
//! ```text
//! malloc(n):  backing ──► VmaManager::reserve ──► remap_range ──► register
//!                O              alias va              O→va          va→O
//!                                            returns va+offset ─────►
//!
//! free(p):    search(p) ──► unmap_range ──► unregister ──► backing free
//!                 O            + INVLPG                        O
//!                          (va retired, never reissued)
//! ```
//!
//! ## Pieces
//!
//! - [`engine::Engine`] couples the three subsystems under the allocator
//!   operation set; [`shim`] installs one engine process-wide behind a
//!   single spin mutex.
//! - [`alias::AliasDirectory`]: hash directory, alias to (origin, size).
//! - [`vma::VmaManager`]: ordered free list of the alias pool; carve with
//!   alignment, guard space and optional random placement.
//! - Page tables themselves live in `veil-vmem`.
//!
//! All hardening toggles sit in one [`config::ShimConfig`] record, read at
//! every operation; there are no build variants.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod alias;
pub mod backing;
pub mod config;
pub mod engine;
mod mapper;
pub mod rng;
pub mod shim;
mod tail;
pub mod vma;

#[cfg(test)]
mod testing;

pub use alias::{AliasDirectory, AliasError, AliasRecord, BUCKET_COUNT};
pub use backing::{BackingAllocator, TableFrames};
pub use config::{GuardPolicy, ShimConfig};
pub use engine::Engine;
pub use mapper::IdentityPhysMapper;
pub use rng::{EntropySource, SplitMix64};
pub use shim::init;
pub use vma::{ReserveError, VmaManager};
