//! Checkouts: the mutable working view over an immutable revision chain.
//!
//! A checkout holds the identifier registry, a pointer to the current
//! revision, and the operations staged since the last commit. `propagate`
//! folds the staged operations into a new revision; `branch` creates an
//! isolated sibling sharing all committed history.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;

use crate::calc::{EffectResolver, ResumeAll};
use crate::error::GraphError;
use crate::ident::{Ident, Identifier};
use crate::quark::{Quark, QuarkData};
use crate::revision::Revision;
use crate::tracer::{NoopTracer, Tracer};
use crate::transaction::{MachineOutcome, StagedOp, Transaction};

/// How a propagation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// The transaction committed as a new revision.
    Completed,
    /// The effect resolver canceled; staged operations were discarded and
    /// nothing was committed.
    Canceled,
    /// A dry run finished without errors; nothing was committed.
    Passed,
    /// Propagation is suspended; the staged operations are kept and folded
    /// into the propagation triggered by [`Checkout::resume_propagate`].
    Deferred,
}

/// A mutable working view over the revision chain.
pub struct Checkout<V> {
    current: Arc<Revision<V>>,
    registry: AHashMap<Ident, Arc<Identifier<V>>>,
    order: Vec<Ident>,
    clock: Arc<AtomicU64>,
    ident_counter: Arc<AtomicU64>,
    pending: Vec<StagedOp<V>>,
    suspended: u32,
    deferred: bool,
    propagating: bool,
    tracer: Arc<dyn Tracer>,
}

impl<V: Clone + 'static> Checkout<V> {
    /// An empty checkout with a baseline revision and no identifiers.
    pub fn new() -> Self {
        Self {
            current: Arc::new(Revision::baseline(0)),
            registry: AHashMap::new(),
            order: Vec::new(),
            clock: Arc::new(AtomicU64::new(0)),
            ident_counter: Arc::new(AtomicU64::new(0)),
            pending: Vec::new(),
            suspended: 0,
            deferred: false,
            propagating: false,
            tracer: Arc::new(NoopTracer),
        }
    }

    /// Register an identifier. Calculated identifiers are scheduled for
    /// computation on the next propagate.
    pub fn add_identifier(&mut self, descriptor: Identifier<V>) -> Ident {
        let ident = Ident(self.ident_counter.fetch_add(1, Ordering::SeqCst));
        let calculated = descriptor.calc.is_some();
        self.registry.insert(ident, Arc::new(descriptor));
        self.order.push(ident);
        if calculated {
            self.pending.push(StagedOp::Touch(ident));
        }
        ident
    }

    /// Unregister an identifier and stage its removal. The removal marker
    /// commits on the next propagate; branches created earlier keep their
    /// own view of the identifier.
    pub fn remove_identifier(&mut self, ident: Ident) -> Result<(), GraphError> {
        self.ensure_known(ident)?;
        self.registry.remove(&ident);
        self.order.retain(|&known| known != ident);
        self.pending.push(StagedOp::Remove(ident));
        Ok(())
    }

    /// Stage a value for `ident`, consumed by the next propagate.
    pub fn write(&mut self, ident: Ident, value: V) -> Result<(), GraphError> {
        self.ensure_known(ident)?;
        self.pending.push(StagedOp::Write {
            ident,
            value,
            args: None,
        });
        Ok(())
    }

    /// Stage a value together with arguments the calculation can retrieve
    /// through an arguments request.
    pub fn write_with_args(
        &mut self,
        ident: Ident,
        value: V,
        args: Vec<V>,
    ) -> Result<(), GraphError> {
        self.ensure_known(ident)?;
        self.pending.push(StagedOp::Write {
            ident,
            value,
            args: Some(args),
        });
        Ok(())
    }

    /// Stage a forced recomputation of `ident` without changing its input.
    pub fn touch(&mut self, ident: Ident) -> Result<(), GraphError> {
        self.ensure_known(ident)?;
        self.pending.push(StagedOp::Touch(ident));
        Ok(())
    }

    /// The current value of `ident`.
    ///
    /// Staged operations are propagated first, so a read always observes a
    /// consistent committed state; a lazy identifier is calculated and
    /// filled into its revision on first read.
    pub fn read(&mut self, ident: Ident) -> Result<V, GraphError> {
        self.ensure_known(ident)?;
        if !self.pending.is_empty() {
            self.propagate()?;
        }
        let quark = self.current.latest_quark(ident);
        match quark {
            Some(quark) => {
                if let Some(value) = quark.value() {
                    return Ok(value.clone());
                }
                if quark.is_pending() {
                    return self.calculate_lazy(ident);
                }
                Err(GraphError::UnknownIdentifier(self.name_of(ident)))
            }
            None => Err(GraphError::UnknownIdentifier(self.name_of(ident))),
        }
    }

    /// Commit the staged operations as a new revision.
    pub fn propagate(&mut self) -> Result<Propagation, GraphError> {
        self.propagate_with(&mut ResumeAll)
    }

    /// Commit the staged operations, answering external suspensions through
    /// `resolver`.
    pub fn propagate_with(
        &mut self,
        resolver: &mut dyn EffectResolver<V>,
    ) -> Result<Propagation, GraphError> {
        if self.suspended > 0 {
            self.deferred = true;
            return Ok(Propagation::Deferred);
        }
        self.propagate_unsuspended(resolver, false)
    }

    /// Run the staged operations to completion without committing, reporting
    /// whether they would propagate cleanly. Consumes the staged operations.
    pub fn dry_run(&mut self) -> Result<Propagation, GraphError> {
        self.dry_run_with(&mut ResumeAll)
    }

    /// [`Checkout::dry_run`] with an explicit effect resolver.
    pub fn dry_run_with(
        &mut self,
        resolver: &mut dyn EffectResolver<V>,
    ) -> Result<Propagation, GraphError> {
        if self.suspended > 0 {
            self.deferred = true;
            return Ok(Propagation::Deferred);
        }
        self.propagate_unsuspended(resolver, true)
    }

    /// Defer propagation: until the matching [`Checkout::resume_propagate`],
    /// `propagate` returns [`Propagation::Deferred`] and keeps the staged
    /// operations. Nested suspensions stack.
    pub fn suspend_propagate(&mut self) {
        self.suspended += 1;
    }

    /// Release one suspension. When the last suspension is released and a
    /// propagation was deferred, `trigger` decides whether it runs now as a
    /// single coalesced propagation. While deferred work remains pending,
    /// the result is [`Propagation::Deferred`].
    pub fn resume_propagate(&mut self, trigger: bool) -> Result<Propagation, GraphError> {
        if self.suspended > 0 {
            self.suspended -= 1;
        }
        if self.deferred {
            if self.suspended > 0 || !trigger {
                return Ok(Propagation::Deferred);
            }
            self.deferred = false;
            return self.propagate();
        }
        Ok(Propagation::Completed)
    }

    /// An isolated sibling checkout sharing all committed history. Writes
    /// and commits on either side are invisible to the other; identifier
    /// handles and revision clocks stay unique across the family.
    pub fn branch(&self) -> Self {
        Self {
            current: Arc::clone(&self.current),
            registry: self.registry.clone(),
            order: self.order.clone(),
            clock: Arc::clone(&self.clock),
            ident_counter: Arc::clone(&self.ident_counter),
            pending: self.pending.clone(),
            suspended: 0,
            deferred: false,
            propagating: false,
            tracer: Arc::clone(&self.tracer),
        }
    }

    /// Install a tracer receiving propagation lifecycle events.
    pub fn set_tracer(&mut self, tracer: Arc<dyn Tracer>) {
        self.tracer = tracer;
    }

    /// The current committed revision.
    pub fn current_revision(&self) -> &Arc<Revision<V>> {
        &self.current
    }

    fn ensure_known(&self, ident: Ident) -> Result<(), GraphError> {
        if self.registry.contains_key(&ident) {
            Ok(())
        } else {
            Err(GraphError::UnknownIdentifier(self.name_of(ident)))
        }
    }

    fn name_of(&self, ident: Ident) -> String {
        match self.registry.get(&ident) {
            Some(descriptor) => descriptor.name().to_string(),
            None => format!("identifier#{}", ident.0),
        }
    }

    fn propagate_unsuspended(
        &mut self,
        resolver: &mut dyn EffectResolver<V>,
        dry: bool,
    ) -> Result<Propagation, GraphError> {
        if self.propagating {
            return Err(GraphError::NestedPropagation);
        }
        self.propagating = true;
        let result = self.propagate_inner(resolver, dry);
        self.propagating = false;
        if let Ok(outcome) = &result {
            self.tracer.on_propagate_completed(*outcome);
        }
        result
    }

    fn propagate_inner(
        &mut self,
        resolver: &mut dyn EffectResolver<V>,
        dry: bool,
    ) -> Result<Propagation, GraphError> {
        // Staged operations are consumed whether the propagation commits,
        // cancels, or fails; only deferral keeps them.
        let ops = std::mem::take(&mut self.pending);
        self.tracer.on_propagate_start(ops.len());
        let tracer = Arc::clone(&self.tracer);
        loop {
            let mut txn = Transaction::new(
                Arc::clone(&self.current),
                &self.registry,
                &self.order,
                tracer.as_ref(),
            );
            txn.seed(&ops);
            txn.discover();
            match txn.run(resolver)? {
                MachineOutcome::Completed => {
                    if dry {
                        return Ok(Propagation::Passed);
                    }
                    let created_at = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
                    let scope = txn.into_scope(created_at);
                    if !scope.is_empty() {
                        self.tracer.on_commit(created_at, scope.len());
                        self.current = Arc::new(Revision::next(
                            Arc::clone(&self.current),
                            created_at,
                            scope,
                        ));
                    }
                    return Ok(Propagation::Completed);
                }
                MachineOutcome::Restart => continue,
                MachineOutcome::Cancel => return Ok(Propagation::Canceled),
            }
        }
    }

    /// Calculate a committed-but-pending lazy entry and fill the result into
    /// the revision that holds it. The result is derived deterministically
    /// from committed state, so sibling branches sharing the revision see
    /// the same value they would have calculated themselves.
    fn calculate_lazy(&mut self, ident: Ident) -> Result<V, GraphError> {
        let (holder, pending) = match self.locate_pending(ident) {
            Some(found) => found,
            None => return Err(GraphError::UnknownIdentifier(self.name_of(ident))),
        };
        let behind = holder
            .previous()
            .and_then(|previous| previous.latest_quark(ident));
        let (proposed, args) = match &pending.data {
            QuarkData::Pending { proposed, args } => (proposed.clone(), args.clone()),
            _ => (None, None),
        };

        let tracer = Arc::clone(&self.tracer);
        let computed = loop {
            let mut txn = Transaction::new(
                Arc::clone(&self.current),
                &self.registry,
                &self.order,
                tracer.as_ref(),
            );
            txn.demand(ident, behind.clone(), proposed.clone(), args.clone());
            match txn.run(&mut ResumeAll)? {
                MachineOutcome::Completed => break txn.into_computed(),
                MachineOutcome::Restart => continue,
                MachineOutcome::Cancel => {
                    return Err(GraphError::calculation(anyhow::anyhow!(
                        "calculation canceled"
                    )))
                }
            }
        };

        for item in computed {
            let holder = match self.locate_pending(item.ident) {
                Some((holder, _)) => holder,
                None => continue,
            };
            let data = match item.value {
                Some(value) => QuarkData::Own {
                    value,
                    reads: item.reads,
                    used_proposed: item.used_proposed,
                },
                None => match item.previous.as_ref() {
                    Some(previous) => QuarkData::Shadow {
                        origin: Quark::origin(previous),
                    },
                    None => continue,
                },
            };
            let quark = Arc::new(Quark::new(item.ident, holder.created_at(), data));
            holder.fill_in(item.ident, quark);
        }

        self.current
            .read_if_exists(ident)
            .ok_or_else(|| GraphError::UnknownIdentifier(self.name_of(ident)))
    }

    /// The revision holding the pending entry for `ident`, if its latest
    /// visible entry is pending.
    fn locate_pending(&self, ident: Ident) -> Option<(Arc<Revision<V>>, Arc<Quark<V>>)> {
        let mut revision = Arc::clone(&self.current);
        loop {
            if let Some(quark) = revision.own_quark(ident) {
                if quark.is_pending() {
                    return Some((revision, quark));
                }
                return None;
            }
            let previous = revision.previous().cloned();
            match previous {
                Some(previous) => revision = previous,
                None => return None,
            }
        }
    }
}

impl<V: Clone + 'static> Default for Checkout<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + PartialEq + 'static> Checkout<V> {
    /// Register a variable and stage its initial value.
    pub fn variable(&mut self, name: impl Into<String>, initial: V) -> Ident {
        let ident = self.add_identifier(Identifier::variable(name));
        self.pending.push(StagedOp::Write {
            ident,
            value: initial,
            args: None,
        });
        ident
    }

    /// Register a calculated identifier.
    pub fn calculated(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn crate::calc::Calculation<V>> + 'static,
    ) -> Ident {
        self.add_identifier(Identifier::calculated(name, factory))
    }
}

impl<V> fmt::Debug for Checkout<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkout")
            .field("identifiers", &self.order.len())
            .field("staged", &self.pending.len())
            .field("revision", &self.current.created_at())
            .field("suspended", &self.suspended)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::{CalcRequest, Formula, Resumed};

    fn sum_of(inputs: Vec<Ident>) -> impl Fn() -> Box<dyn crate::calc::Calculation<i64>> {
        move || {
            let requests = inputs.iter().copied().map(CalcRequest::Read).collect();
            Box::new(Formula::new(requests, |answers: &[Resumed<i64>]| {
                Ok(answers.iter().filter_map(|a| a.clone().value()).sum())
            }))
        }
    }

    #[test]
    fn variable_write_and_read() {
        let mut graph = Checkout::new();
        let a = graph.variable("a", 5);
        assert_eq!(graph.read(a).unwrap(), 5);
        graph.write(a, 7).unwrap();
        assert_eq!(graph.read(a).unwrap(), 7);
    }

    #[test]
    fn calculated_follows_inputs() {
        let mut graph = Checkout::new();
        let a = graph.variable("a", 1);
        let b = graph.variable("b", 2);
        let sum = graph.calculated("sum", sum_of(vec![a, b]));
        assert_eq!(graph.read(sum).unwrap(), 3);

        graph.write(a, 10).unwrap();
        assert_eq!(graph.read(sum).unwrap(), 12);
    }

    #[test]
    fn propagate_commits_a_new_revision() {
        let mut graph = Checkout::new();
        let a = graph.variable("a", 1);
        graph.propagate().unwrap();
        let before = graph.current_revision().created_at();

        graph.write(a, 2).unwrap();
        graph.propagate().unwrap();
        assert!(graph.current_revision().created_at() > before);
    }

    #[test]
    fn unknown_identifier_errors() {
        let mut graph: Checkout<i64> = Checkout::new();
        let a = graph.variable("a", 1);
        graph.propagate().unwrap();
        graph.remove_identifier(a).unwrap();
        assert!(matches!(
            graph.write(a, 2),
            Err(GraphError::UnknownIdentifier(_))
        ));
        assert!(matches!(
            graph.read(a),
            Err(GraphError::UnknownIdentifier(_))
        ));
    }

    #[test]
    fn nested_identifier_chain() {
        let mut graph = Checkout::new();
        let a = graph.variable("a", 1);
        let b = graph.calculated("b", sum_of(vec![a]));
        let c = graph.calculated("c", sum_of(vec![b]));
        assert_eq!(graph.read(c).unwrap(), 1);

        graph.write(a, 41).unwrap();
        assert_eq!(graph.read(c).unwrap(), 41);
    }
}
