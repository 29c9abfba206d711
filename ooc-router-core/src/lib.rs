#![doc = "ooc-router-core: move-and-track engine for ooc-router."]

//! This crate contains every moving part of the router: naming-convention
//! matching, the durable move ledger, the mover, the three scan loops, the
//! out-of-charge trigger, revert, and the supervisor that owns them.
//! Command-line glue and YAML parsing live in the `ooc-router` crate.
//!
//! # Usage
//! Build a [`supervisor::ServiceSupervisor`] from a [`config::RouterConfig`]
//! and drive it with `start`/`stop`/`status`/`revert`.

pub mod activity;
pub mod config;
pub mod contract;
pub mod error;
pub mod events;
pub mod ledger;
pub mod matcher;
pub mod mover;
pub mod revert;
pub mod scan;
pub mod supervisor;
pub mod trigger;
