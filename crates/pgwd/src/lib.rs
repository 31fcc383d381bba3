//! PrintToPeer gateway daemon.
//!
//! This crate provides the components of the gateway daemon:
//! - `remote` - websocket session with the PrintToPeer service
//! - `router` - dispatch of classified remote commands
//! - `registry` - actor owning all device sessions and bindings
//! - `device` - per-device driver IPC and session state
//! - `discovery` - attached-hardware scanning
//! - `jobs` - print-job file downloads
//! - `media` - camera frame relay
//! - `system` - host maintenance commands
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        pgwd daemon                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌───────────────┐  commands   ┌───────────────────────┐     │
//! │  │ RemoteSession │────────────▶│        Router          │    │
//! │  │  (websocket)  │             └──┬──────┬──────┬──────┘     │
//! │  └───────▲───────┘                │      │      │            │
//! │          │ updates, notices       │      │      │            │
//! │  ┌───────┴───────┐ ◀──────────────┘      │      │            │
//! │  │ RegistryActor │                JobRunner  MediaRelay      │
//! │  │ (device state)│                (downloads) (camera)       │
//! │  └───────┬───────┘                                           │
//! │          │ msgpack over unix sockets                         │
//! │          ▼                                                   │
//! │   device driver processes (one per printer)                  │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The daemon is deliberately hard to kill from the outside: remote
//! commands it cannot honor are logged and dropped, device streams
//! that turn to garbage are discarded, and a lost service connection
//! is retried forever. The once-per-second update push makes the
//! current state self-healing after any of these.

pub mod config;
pub mod device;
pub mod discovery;
pub mod jobs;
pub mod media;
pub mod registry;
pub mod remote;
pub mod router;
pub mod system;
