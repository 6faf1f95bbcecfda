//! # edgeacl - ACL Sync and Firewall Enforcement for Edge Nodes
//!
//! Keeps a node's allow/deny lists in step with a control plane and turns
//! every membership change into firewall state.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        edgeacl                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CLI (clap)                                                 │
//! │    └── Commands: run, check, cidr, version                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Sync engine                                                │
//! │    ├── ControlPlane (reqwest + rustls), version cursor      │
//! │    └── ItemStore (JSON, atomic writes)                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  IP lists (range-aware, TTL, one RwLock per list)           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ActionManager (event level -> backends)                    │
//! │    ├── ipset, iptables, firewalld (CIDR decomposition)      │
//! │    └── script, http_api, html                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  DDoS reconciler (nftables, comment-tagged rules)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`cidr`] - Range-to-CIDR decomposition
//! - [`cli`] - Command-line interface definitions
//! - [`clock`] - Cached low-resolution unix clock
//! - [`cmd_abstraction`] - External command execution with timeouts
//! - [`commands`] - CLI command implementations
//! - [`config`] - Configuration parsing and validation
//! - [`control_plane`] - Control-plane contract and HTTP client
//! - [`ddos`] - nftables TCP rate-limit reconciler
//! - [`enforcer`] - Enforcement backends and the ActionManager
//! - [`error`] - Typed errors
//! - [`iplist`] - ACL items and lists
//! - [`lock`] - File locking against a second daemon
//! - [`signal`] - Graceful shutdown and reload signals
//! - [`store`] - Local item store and version cursor
//! - [`sync`] - List sync engine

pub mod cidr;
pub mod cli;
pub mod clock;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod control_plane;
pub mod ddos;
pub mod enforcer;
pub mod error;
pub mod iplist;
pub mod lock;
pub mod signal;
pub mod store;
pub mod sync;

pub use cli::{Cli, Commands};
pub use config::Config;
