//! # paddock
//!
//! **Privileged daemon managing hierarchies of Linux containers.**
//!
//! Clients connect over a local socket and drive named containers
//! arranged in a tree: create, set properties, start a workload inside
//! fresh namespaces and cgroups, pause, wait for exit, destroy. Inner
//! nodes may be *meta* containers that only aggregate limits for their
//! children.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          paddockd                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │ epoll loop ── signalfd reaper ── RPC workers ── event workers│
//! │      │               │               │               │       │
//! │  ┌───┴───────────────┴───────────────┴───────────────┴────┐  │
//! │  │            container tree + lock protocol              │  │
//! │  │  name → node, per-node reader/writer counters, waiters │  │
//! │  └──────┬──────────────┬───────────────┬──────────────────┘  │
//! │         │              │               │                     │
//! │   ┌─────┴─────┐  ┌─────┴─────┐  ┌──────┴──────┐              │
//! │   │  launcher │  │  cgroups  │  │ persistence │              │
//! │   │ fork/clone│  │ v1 knobs, │  │  key=value  │              │
//! │   │ handshake │  │ freezer,  │  │ records per │              │
//! │   │ + pivot   │  │ OOM event │  │     id      │              │
//! │   └───────────┘  └───────────┘  └─────────────┘              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! Stopped ──start──► Running │ Meta ──pause──► Paused ──resume──┐
//!    ▲                  │                                       │
//!    │                exit/OOM                                  │
//!  stop │ aging         ▼                                       │
//!    └────────────── Dead ──respawn──► Running │ Meta ◄─────────┘
//!
//! Stopped ──destroy──► Destroyed
//! ```
//!
//! # Key Invariants
//!
//! - Every live container is reachable from the root and registered in
//!   the name map; `Destroyed` means removed from both.
//! - A write lock on a node excludes everything on the node and its
//!   subtree; read locks nest freely below read-locked ancestors.
//! - The daemon is the reaping parent of exactly one descendant per
//!   running container, so `waitpid` in the main loop is authoritative.
//! - The persistent record's `state` key is written last; a torn write
//!   restores as stopped, never as running.

mod caps;
mod config;
mod constants;
mod cred;
mod error;
mod kv;
mod property;
mod spawn;
mod tree;

pub mod cgroup;
pub mod client;
pub mod container;
pub mod daemon;
pub mod event;
pub mod net;
pub mod path;
pub mod volume;

pub use caps::Capabilities;
pub use client::{AccessLevel, ClientSession, WaitRecord};
pub use config::Config;
pub use constants::{
    CONTAINER_LEVEL_MAX, CONTAINER_PATH_MAX, DEFAULT_CONFIG_PATH, ROOT_CONTAINER,
};
pub use container::{Container, State};
pub use cred::Cred;
pub use daemon::{Daemon, RequestHandler};
pub use error::{Error, ErrorKind, Result};
pub use event::{Event, EventQueue};
pub use kv::{KvStore, Record};
pub use path::HostPath;
pub use property::{PropertySet, VirtMode};
pub use spawn::{split_command, Device, Env, ParentNamespaces, SpawnEnv, SyncSock};
pub use tree::{parent_name, valid_name, ContainerTree, IdPool};
