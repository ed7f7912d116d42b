//! Rest-cycle coordination for the Somnus partition engine.
//!
//! This crate decides, per partition, whether enough eligible participants
//! are resting to advance the partition's night, and keeps that decision
//! correct under join, leave and activity churn.
//!
//! # Modules
//!
//! - [`clock`] -- Day cycle arithmetic over the host's partition clock.
//! - [`config`] -- Configuration loading from `somnus-config.yaml` and the
//!   per-partition override chain.
//! - [`eligibility`] -- Pure evaluation of resting, exempt, inactive and
//!   eligible sets and the `needed` count.
//! - [`notification`] -- Announcement rendering and per-subject cooldowns.
//! - [`state`] -- The per-partition state machine.
//! - [`schedule`] -- Cancellable timers.
//! - [`host`] -- [`WorldHost`], [`Courier`] and [`Benefactor`] capability
//!   traits and the [`HostEvent`] stream.
//! - [`memory`] -- [`InMemoryHost`] for the simulator and tests.
//! - [`extension`] -- The [`Extension`] contract and registry.
//! - [`coordinator`] -- [`Coordinator`], which ties it all together.
//!
//! [`WorldHost`]: host::WorldHost
//! [`Courier`]: host::Courier
//! [`Benefactor`]: host::Benefactor
//! [`HostEvent`]: host::HostEvent
//! [`InMemoryHost`]: memory::InMemoryHost
//! [`Extension`]: extension::Extension
//! [`Coordinator`]: coordinator::Coordinator

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod eligibility;
pub mod extension;
pub mod host;
pub mod memory;
pub mod notification;
pub mod schedule;
pub mod state;
