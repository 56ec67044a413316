//! Subuser: sandboxed application profiles built from container images.
//!
//! A *subuser* is a named application installed from an *image source* in a
//! *repository* (a git checkout or local directory of source definitions).
//! This crate is the management core: it reconciles what is installed against
//! what the sources currently say, records every state change in a
//! version-controlled registry, and keeps the container daemon's image set in
//! step with both.
//!
//! # Architecture
//!
//! ```text
//! commands (CLI entry points)
//!     │  lock -> mutate -> verify -> commit
//!     ▼
//! verify ──────────── the idempotent verification pass
//!     │
//!     ├── reconcile    staleness classification + lineage rebuilds
//!     │       ├── lineage      target (source) and installed (layer) chains
//!     │       ├── source       image sources inside repository checkouts
//!     │       └── backend      BuildBackend trait: docker CLI or test fake
//!     │
//!     └── registry     versioned JSON tables, one git commit per change set
//!             ├── git          shell-out plumbing
//!             ├── lock         advisory file lock on the whole registry
//!             └── live_log     FIFO fan-out of progress lines
//! ```
//!
//! The reconciliation engine never talks to a daemon directly; everything
//! goes through [`backend::BuildBackend`], so the whole stack runs against
//! the in-memory fake in tests.

pub mod backend;
pub mod commands;
pub mod git;
pub mod hash;
pub mod images;
pub mod lineage;
pub mod live_log;
pub mod lock;
pub mod paths;
pub mod permissions;
pub mod reconcile;
pub mod registry;
pub mod repository;
pub mod source;
pub mod subuser;
pub mod verify;
