//! The AHCP daemon: an autoconfiguration service for IPv6 mesh and ad-hoc
//! networks, speaking the stateless flooded protocol on a link-scoped
//! multicast group and, optionally, the stateful lease protocol on top.
//!
//! The protocol logic itself lives in `ahcp-proto`; the lease database in
//! `ahcp-lease`. This crate owns everything that touches the operating
//! system: the event loop and its sockets, the configuration script, the
//! signal plumbing and the handful of files the daemon persists.

pub mod clock;
pub mod engine;
pub mod persist;
pub mod script;
pub mod signal;
