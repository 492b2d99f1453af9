//! # canopy-mesh
//!
//! Supervision core for a tree-routed radio mesh behind a gateway
//! micro-controller. The crate is runtime-free: every state machine takes the
//! current instant as a parameter and produces plain values (command lines to
//! write, uplink notices to queue), so the whole control logic can be driven
//! deterministically from tests and from the daemon alike.
//!
//! ## Crate structure
//!
//! - [`protocol`] — outbound command formatting, inbound line classification
//! - [`node`] — per-node condition flags, next-message policy, ack/timeout
//! - [`sensor`] — sensor-kind extension (channel calibration, LED mirror)
//! - [`switch`] — switch-kind extension (fixed channels, status indicator)
//! - [`registry`] — node arena, topology, availability, status fan-out
//! - [`engine`] — single-writer command scheduler over the shared link
//! - [`netcheck`] — periodic network sanity sweep
//! - [`uplink`] — notice types consumed by the HTTP uplink worker
//! - [`config`] — TOML configuration model and resolution

pub mod config;
pub mod engine;
pub mod netcheck;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod sensor;
pub mod switch;
pub mod uplink;
