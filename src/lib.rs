//! Alarm-clock scheduling engine: per-alarm lifecycle machines, a single
//! shared wake timer, JSON persistence and a local control API.

pub mod alarm;
pub mod api;
pub mod clock;
pub mod deferred;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod notify;
pub mod service;
pub mod store;
pub mod wake;
