//! Observability hooks.
//!
//! The engine reports its progress through a [`Tracer`] instead of logging
//! directly, so embedders route events into whatever telemetry they already
//! have. Every hook has an empty default body.

use crate::checkout::Propagation;

/// Receives propagation lifecycle events.
pub trait Tracer {
    /// A propagation started with `staged` staged operations.
    fn on_propagate_start(&self, staged: usize) {
        let _ = staged;
    }

    /// An identifier's calculation ran to completion.
    fn on_calculated(&self, name: &str) {
        let _ = name;
    }

    /// An identifier was recomputed but its value was unchanged, so its
    /// dependents were skipped.
    fn on_shadowed(&self, name: &str) {
        let _ = name;
    }

    /// A calculation cycle was detected; `path` starts and ends with the
    /// same identifier name.
    fn on_cycle(&self, path: &[String]) {
        let _ = path;
    }

    /// A transaction committed as revision `created_at` with `entries` new
    /// quarks.
    fn on_commit(&self, created_at: u64, entries: usize) {
        let _ = (created_at, entries);
    }

    /// A propagation finished with `outcome`.
    fn on_propagate_completed(&self, outcome: Propagation) {
        let _ = outcome;
    }
}

/// A tracer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl Tracer for NoopTracer {}
