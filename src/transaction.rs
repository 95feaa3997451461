//! The propagation transaction.
//!
//! A transaction turns a batch of staged operations into the scope of the
//! next revision. It discovers the dirty set by walking dependents of the
//! staged identifiers, then runs a stack machine that drives each affected
//! calculation to completion, answering suspension requests as it goes.
//!
//! Change accounting follows the edges-flow scheme: during discovery every
//! traversed edge increments the target's counter, and every identifier that
//! turns out unchanged retracts one unit from each of its dependents. An
//! identifier popped with a zero counter and no staged input is committed as
//! a shadow of its previous value without running its calculation.

use std::sync::Arc;

use ahash::AHashMap;
use slab::Slab;

use crate::calc::{CalcRequest, CalcStep, Calculation, EffectResolver, Resolution, Resumed};
use crate::error::GraphError;
use crate::ident::{Ident, Identifier};
use crate::quark::{Quark, QuarkData};
use crate::revision::Revision;
use crate::tracer::Tracer;
use crate::walk::{DepthWalk, OnCycleAction};

/// A user operation staged on a checkout, consumed by the next propagation.
pub(crate) enum StagedOp<V> {
    Write {
        ident: Ident,
        value: V,
        args: Option<Vec<V>>,
    },
    Touch(Ident),
    Remove(Ident),
}

impl<V: Clone> Clone for StagedOp<V> {
    fn clone(&self) -> Self {
        match self {
            Self::Write { ident, value, args } => Self::Write {
                ident: *ident,
                value: value.clone(),
                args: args.clone(),
            },
            Self::Touch(ident) => Self::Touch(*ident),
            Self::Remove(ident) => Self::Remove(*ident),
        }
    }
}

enum SlotResult<V> {
    Value(V),
    Unchanged,
    Removed,
}

struct Slot<V> {
    ident: Ident,
    previous: Option<Arc<Quark<V>>>,
    proposed: Option<V>,
    proposed_args: Option<Vec<V>>,
    edges_flow: i64,
    tombstone: bool,
    lazy: bool,
    started: bool,
    calc_obj: Option<Box<dyn Calculation<V>>>,
    waiting_on: Option<Ident>,
    reads: Vec<Ident>,
    used_proposed: bool,
    result: Option<SlotResult<V>>,
}

/// How the stack machine finished.
pub(crate) enum MachineOutcome {
    Completed,
    Restart,
    Cancel,
}

enum Drive {
    Finished,
    Need(usize),
    Restart,
    Cancel,
}

enum ReadAnswer<V> {
    Ready(Resumed<V>),
    Need(usize),
}

/// A finished calculation extracted for lazy fill-in, without committing a
/// new revision.
pub(crate) struct Computed<V> {
    pub(crate) ident: Ident,
    /// `None` when the recomputed value compared equal to the previous one.
    pub(crate) value: Option<V>,
    pub(crate) reads: Vec<Ident>,
    pub(crate) used_proposed: bool,
    pub(crate) previous: Option<Arc<Quark<V>>>,
}

pub(crate) struct Transaction<'a, V> {
    base: Arc<Revision<V>>,
    registry: &'a AHashMap<Ident, Arc<Identifier<V>>>,
    order: &'a [Ident],
    tracer: &'a dyn Tracer,
    dependents: AHashMap<Ident, Vec<Ident>>,
    slots: Slab<Slot<V>>,
    index: AHashMap<Ident, usize>,
    seeded: Vec<Ident>,
    stack: Vec<usize>,
}

impl<'a, V: Clone + 'static> Transaction<'a, V> {
    pub(crate) fn new(
        base: Arc<Revision<V>>,
        registry: &'a AHashMap<Ident, Arc<Identifier<V>>>,
        order: &'a [Ident],
        tracer: &'a dyn Tracer,
    ) -> Self {
        // Invert the committed read edges into a dependents index. Iterating
        // the registration order keeps discovery independent of hash seeds.
        let mut dependents: AHashMap<Ident, Vec<Ident>> = AHashMap::new();
        for &ident in order {
            if let Some(quark) = base.latest_quark(ident) {
                for &read in quark.reads() {
                    dependents.entry(read).or_default().push(ident);
                }
            }
        }
        Self {
            base,
            registry,
            order,
            tracer,
            dependents,
            slots: Slab::new(),
            index: AHashMap::new(),
            seeded: Vec::new(),
            stack: Vec::new(),
        }
    }

    fn ensure_slot(&mut self, ident: Ident) -> usize {
        if let Some(&idx) = self.index.get(&ident) {
            return idx;
        }
        let previous = self.base.latest_quark(ident);
        let lazy = self
            .registry
            .get(&ident)
            .map(|descriptor| descriptor.lazy)
            .unwrap_or(false);
        // A not-yet-calculated entry carries staged input forward; the fresh
        // slot inherits it so the input survives until calculation.
        let (proposed, proposed_args) = match previous.as_ref().map(|quark| &quark.data) {
            Some(QuarkData::Pending { proposed, args }) => (proposed.clone(), args.clone()),
            _ => (None, None),
        };
        let idx = self.slots.insert(Slot {
            ident,
            previous,
            proposed,
            proposed_args,
            edges_flow: 0,
            tombstone: false,
            lazy,
            started: false,
            calc_obj: None,
            waiting_on: None,
            reads: Vec::new(),
            used_proposed: false,
            result: None,
        });
        self.index.insert(ident, idx);
        idx
    }

    /// Apply the staged operations and mark identifiers whose last value
    /// consumed staged input, so they recompute and can consume new input.
    pub(crate) fn seed(&mut self, ops: &[StagedOp<V>]) {
        for op in ops {
            match op {
                StagedOp::Write { ident, value, args } => {
                    let idx = self.ensure_slot(*ident);
                    let slot = &mut self.slots[idx];
                    slot.proposed = Some(value.clone());
                    slot.proposed_args = args.clone();
                    slot.edges_flow = i64::MAX;
                    slot.tombstone = false;
                    if matches!(slot.result, Some(SlotResult::Removed)) {
                        slot.result = None;
                    }
                    if !self.seeded.contains(ident) {
                        self.seeded.push(*ident);
                    }
                }
                StagedOp::Touch(ident) => {
                    let idx = self.ensure_slot(*ident);
                    self.slots[idx].edges_flow = i64::MAX;
                    if !self.seeded.contains(ident) {
                        self.seeded.push(*ident);
                    }
                }
                StagedOp::Remove(ident) => {
                    let idx = self.ensure_slot(*ident);
                    let slot = &mut self.slots[idx];
                    slot.tombstone = true;
                    slot.result = Some(SlotResult::Removed);
                    if !self.seeded.contains(ident) {
                        self.seeded.push(*ident);
                    }
                }
            }
        }
        for &ident in self.order {
            if self.index.contains_key(&ident) {
                continue;
            }
            let sticky = self
                .base
                .latest_quark(ident)
                .map(|quark| quark.used_proposed())
                .unwrap_or(false);
            if sticky {
                let idx = self.ensure_slot(ident);
                self.slots[idx].edges_flow = i64::MAX;
                self.seeded.push(ident);
            }
        }
    }

    /// Walk dependents of the seeded identifiers, counting one edges-flow
    /// unit per traversed edge, and schedule the affected identifiers in
    /// topological order.
    pub(crate) fn discover(&mut self) {
        let mut topo: Vec<Ident> = Vec::new();
        let mut marked: Vec<Ident> = Vec::new();
        {
            let dependents = &self.dependents;
            let mut walker = DepthWalk::new();
            walker.run(
                self.seeded.iter().copied(),
                |node, out| {
                    if let Some(deps) = dependents.get(&node) {
                        for &dep in deps {
                            marked.push(dep);
                            out.push(dep);
                        }
                    }
                },
                |node| topo.push(node),
                // The committed graph is acyclic; a back-edge here can only
                // come from duplicated seeds.
                |_, _| OnCycleAction::Resume,
            );
        }
        for ident in marked {
            let idx = self.ensure_slot(ident);
            let slot = &mut self.slots[idx];
            slot.edges_flow = slot.edges_flow.saturating_add(1);
        }
        // Topological completion order is leaf-first, so pushing it as-is
        // leaves the most upstream identifiers on top of the stack.
        for ident in topo {
            if let Some(&idx) = self.index.get(&ident) {
                let slot = &self.slots[idx];
                if slot.result.is_none() && !slot.lazy {
                    self.stack.push(idx);
                }
            }
        }
    }

    /// Schedule one identifier for on-demand calculation, with an explicit
    /// previous quark. Used for filling in lazy entries outside a commit.
    pub(crate) fn demand(
        &mut self,
        ident: Ident,
        previous: Option<Arc<Quark<V>>>,
        proposed: Option<V>,
        args: Option<Vec<V>>,
    ) {
        let idx = self.ensure_slot(ident);
        let slot = &mut self.slots[idx];
        slot.previous = previous;
        slot.proposed = proposed;
        slot.proposed_args = args;
        slot.edges_flow = i64::MAX;
        self.stack.push(idx);
    }

    /// Run scheduled calculations to completion.
    pub(crate) fn run(
        &mut self,
        resolver: &mut dyn EffectResolver<V>,
    ) -> Result<MachineOutcome, GraphError> {
        while let Some(&idx) = self.stack.last() {
            if self.slots[idx].result.is_some() {
                self.stack.pop();
                continue;
            }
            let slot = &self.slots[idx];
            let clean = !slot.started
                && slot.edges_flow <= 0
                && slot.proposed.is_none()
                && !slot.tombstone
                && slot
                    .previous
                    .as_ref()
                    .map(|quark| quark.value().is_some())
                    .unwrap_or(false);
            if clean {
                // Every incoming edge retracted its change: the previous
                // value stands without recalculating.
                self.settle_unchanged(idx);
                self.stack.pop();
                continue;
            }
            match self.drive(idx, resolver)? {
                Drive::Finished => {
                    self.stack.pop();
                }
                Drive::Need(dep) => self.stack.push(dep),
                Drive::Restart => return Ok(MachineOutcome::Restart),
                Drive::Cancel => return Ok(MachineOutcome::Cancel),
            }
        }
        Ok(MachineOutcome::Completed)
    }

    fn drive(
        &mut self,
        idx: usize,
        resolver: &mut dyn EffectResolver<V>,
    ) -> Result<Drive, GraphError> {
        let ident = self.slots[idx].ident;
        let descriptor = match self.registry.get(&ident) {
            Some(descriptor) => Arc::clone(descriptor),
            None => return Err(GraphError::UnknownIdentifier(self.name_of(ident))),
        };

        let factory = match descriptor.calc.as_ref() {
            Some(factory) => factory,
            None => {
                // A variable takes its staged value, falling back to the
                // previous one.
                let slot = &self.slots[idx];
                let value = slot
                    .proposed
                    .clone()
                    .or_else(|| slot.previous.as_ref().and_then(|quark| quark.value().cloned()));
                return match value {
                    Some(value) => {
                        self.complete(idx, value, &descriptor);
                        Ok(Drive::Finished)
                    }
                    None => Err(GraphError::calculation(anyhow::anyhow!(
                        "variable {} has no value",
                        descriptor.name()
                    ))),
                };
            }
        };

        let mut calc = match self.slots[idx].calc_obj.take() {
            Some(calc) => calc,
            None => (**factory)(),
        };
        let mut step = match self.slots[idx].waiting_on.take() {
            Some(target) => {
                let answer = self.dependency_answer(target)?;
                calc.resume(answer)
            }
            None => {
                self.slots[idx].started = true;
                calc.start()
            }
        };

        loop {
            match step {
                CalcStep::Done(value) => {
                    self.complete(idx, value, &descriptor);
                    return Ok(Drive::Finished);
                }
                CalcStep::Fail(error) => return Err(GraphError::calculation(error)),
                CalcStep::Suspend(CalcRequest::Read(target)) => {
                    if target == ident {
                        return Err(GraphError::UnsupportedReadEffect {
                            name: descriptor.name().to_string(),
                        });
                    }
                    match self.resolve_read(idx, target)? {
                        ReadAnswer::Ready(answer) => step = calc.resume(answer),
                        ReadAnswer::Need(dep) => {
                            let slot = &mut self.slots[idx];
                            slot.waiting_on = Some(target);
                            slot.calc_obj = Some(calc);
                            return Ok(Drive::Need(dep));
                        }
                    }
                }
                CalcStep::Suspend(CalcRequest::ProposedOrCurrent) => {
                    let slot = &mut self.slots[idx];
                    slot.used_proposed = true;
                    let answer = slot
                        .proposed
                        .clone()
                        .or_else(|| slot.previous.as_ref().and_then(|quark| quark.value().cloned()))
                        .map(Resumed::Value)
                        .unwrap_or(Resumed::Missing);
                    step = calc.resume(answer);
                }
                CalcStep::Suspend(CalcRequest::Proposed) => {
                    let answer = self.slots[idx]
                        .proposed
                        .clone()
                        .map(Resumed::Value)
                        .unwrap_or(Resumed::Missing);
                    step = calc.resume(answer);
                }
                CalcStep::Suspend(CalcRequest::Arguments) => {
                    let answer = self.slots[idx]
                        .proposed_args
                        .clone()
                        .map(Resumed::Arguments)
                        .unwrap_or(Resumed::Missing);
                    step = calc.resume(answer);
                }
                CalcStep::Suspend(CalcRequest::Previous) => {
                    let answer = self.slots[idx]
                        .previous
                        .as_ref()
                        .and_then(|quark| quark.value().cloned())
                        .map(Resumed::Value)
                        .unwrap_or(Resumed::Missing);
                    step = calc.resume(answer);
                }
                CalcStep::Suspend(CalcRequest::External(payload)) => {
                    match resolver.resolve(&descriptor, &payload) {
                        Resolution::Resume(answer) => step = calc.resume(answer),
                        Resolution::Restart => return Ok(Drive::Restart),
                        Resolution::Cancel => return Ok(Drive::Cancel),
                    }
                }
            }
        }
    }

    fn resolve_read(&mut self, idx: usize, target: Ident) -> Result<ReadAnswer<V>, GraphError> {
        if !self.slots[idx].reads.contains(&target) {
            self.slots[idx].reads.push(target);
        }

        if let Some(&dep_idx) = self.index.get(&target) {
            let dep = &self.slots[dep_idx];
            return match &dep.result {
                Some(SlotResult::Value(value)) => Ok(ReadAnswer::Ready(Resumed::Value(value.clone()))),
                Some(SlotResult::Unchanged) => {
                    match dep.previous.as_ref().and_then(|quark| quark.value()) {
                        Some(value) => Ok(ReadAnswer::Ready(Resumed::Value(value.clone()))),
                        None => Err(GraphError::UnknownIdentifier(self.name_of(target))),
                    }
                }
                Some(SlotResult::Removed) => Err(GraphError::UnknownIdentifier(self.name_of(target))),
                None => {
                    if dep.started || dep.waiting_on.is_some() {
                        return Err(self.cycle_error(idx, target));
                    }
                    Ok(ReadAnswer::Need(dep_idx))
                }
            };
        }

        let quark = self.base.latest_quark(target);
        match quark.as_ref() {
            Some(quark) => {
                if let Some(value) = quark.value() {
                    return Ok(ReadAnswer::Ready(Resumed::Value(value.clone())));
                }
                if quark.is_pending() {
                    // A committed but never calculated lazy entry: calculate
                    // it on demand within this transaction.
                    let dep_idx = self.ensure_slot(target);
                    self.slots[dep_idx].edges_flow = i64::MAX;
                    return Ok(ReadAnswer::Need(dep_idx));
                }
                Err(GraphError::UnknownIdentifier(self.name_of(target)))
            }
            None => {
                if self.registry.contains_key(&target) {
                    let dep_idx = self.ensure_slot(target);
                    self.slots[dep_idx].edges_flow = i64::MAX;
                    Ok(ReadAnswer::Need(dep_idx))
                } else {
                    Err(GraphError::UnknownIdentifier(self.name_of(target)))
                }
            }
        }
    }

    /// Answer a read that was suspended on a now-finished dependency.
    fn dependency_answer(&self, target: Ident) -> Result<Resumed<V>, GraphError> {
        if let Some(&dep_idx) = self.index.get(&target) {
            let dep = &self.slots[dep_idx];
            return match &dep.result {
                Some(SlotResult::Value(value)) => Ok(Resumed::Value(value.clone())),
                Some(SlotResult::Unchanged) => {
                    match dep.previous.as_ref().and_then(|quark| quark.value()) {
                        Some(value) => Ok(Resumed::Value(value.clone())),
                        None => Ok(Resumed::Missing),
                    }
                }
                Some(SlotResult::Removed) => {
                    Err(GraphError::UnknownIdentifier(self.name_of(target)))
                }
                None => Ok(Resumed::Missing),
            };
        }
        let quark = self.base.latest_quark(target);
        match quark.as_ref().and_then(|quark| quark.value()) {
            Some(value) => Ok(Resumed::Value(value.clone())),
            None => Ok(Resumed::Missing),
        }
    }

    fn complete(&mut self, idx: usize, value: V, descriptor: &Identifier<V>) {
        let ident = self.slots[idx].ident;
        let equal = {
            let slot = &self.slots[idx];
            slot.previous
                .as_ref()
                .and_then(|quark| quark.value())
                .map(|previous| (*descriptor.equality)(previous, &value))
                .unwrap_or(false)
        };
        let used_proposed = self.slots[idx].used_proposed;
        if equal {
            self.retract_dependents(ident);
            let slot = &mut self.slots[idx];
            slot.calc_obj = None;
            if used_proposed {
                // Keep the entry owned so the input-dependence marker
                // survives; dependents were still retracted above.
                slot.result = Some(SlotResult::Value(value));
                self.tracer.on_calculated(descriptor.name());
            } else {
                slot.result = Some(SlotResult::Unchanged);
                self.tracer.on_shadowed(descriptor.name());
            }
        } else {
            let slot = &mut self.slots[idx];
            slot.calc_obj = None;
            slot.result = Some(SlotResult::Value(value));
            self.tracer.on_calculated(descriptor.name());
        }
    }

    fn settle_unchanged(&mut self, idx: usize) {
        let ident = self.slots[idx].ident;
        self.retract_dependents(ident);
        self.slots[idx].result = Some(SlotResult::Unchanged);
        self.tracer.on_shadowed(&self.name_of(ident));
    }

    fn retract_dependents(&mut self, ident: Ident) {
        if let Some(deps) = self.dependents.get(&ident) {
            for dep in deps {
                if let Some(&dep_idx) = self.index.get(dep) {
                    let slot = &mut self.slots[dep_idx];
                    slot.edges_flow = slot.edges_flow.saturating_sub(1);
                }
            }
        }
    }

    /// Reconstruct the cycle path when a calculation reads an identifier
    /// whose own calculation is suspended further down the stack. Suspended
    /// slots form a waiting chain that necessarily leads back to the reader.
    fn cycle_error(&self, idx: usize, target: Ident) -> GraphError {
        let reader = self.slots[idx].ident;
        let mut path = vec![target];
        let mut cursor = target;
        while cursor != reader && path.len() <= self.slots.len() {
            let next = self
                .index
                .get(&cursor)
                .and_then(|&i| self.slots[i].waiting_on);
            match next {
                Some(next) => {
                    path.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        if path.last() != Some(&reader) {
            path.push(reader);
        }
        path.push(target);
        let names: Vec<String> = path.into_iter().map(|ident| self.name_of(ident)).collect();
        self.tracer.on_cycle(&names);
        GraphError::CycleDetected { path: names }
    }

    fn name_of(&self, ident: Ident) -> String {
        match self.registry.get(&ident) {
            Some(descriptor) => descriptor.name().to_string(),
            None => format!("identifier#{}", ident.0),
        }
    }

    /// Convert the finished transaction into the scope of a new revision.
    pub(crate) fn into_scope(self, created_at: u64) -> AHashMap<Ident, Arc<Quark<V>>> {
        let mut scope = AHashMap::new();
        for (_, slot) in self.slots {
            let data = match slot.result {
                Some(SlotResult::Value(value)) => QuarkData::Own {
                    value,
                    reads: slot.reads,
                    used_proposed: slot.used_proposed,
                },
                Some(SlotResult::Unchanged) => match slot.previous.as_ref() {
                    Some(previous) => QuarkData::Shadow {
                        origin: Quark::origin(previous),
                    },
                    None => continue,
                },
                Some(SlotResult::Removed) => QuarkData::Tombstone,
                None => {
                    if slot.lazy {
                        QuarkData::Pending {
                            proposed: slot.proposed,
                            args: slot.proposed_args,
                        }
                    } else {
                        continue;
                    }
                }
            };
            scope.insert(slot.ident, Arc::new(Quark::new(slot.ident, created_at, data)));
        }
        scope
    }

    /// Extract finished calculations for in-place lazy fill-in.
    pub(crate) fn into_computed(self) -> Vec<Computed<V>> {
        let mut computed = Vec::new();
        for (_, slot) in self.slots {
            match slot.result {
                Some(SlotResult::Value(value)) => computed.push(Computed {
                    ident: slot.ident,
                    value: Some(value),
                    reads: slot.reads,
                    used_proposed: slot.used_proposed,
                    previous: slot.previous,
                }),
                Some(SlotResult::Unchanged) => computed.push(Computed {
                    ident: slot.ident,
                    value: None,
                    reads: slot.reads,
                    used_proposed: slot.used_proposed,
                    previous: slot.previous,
                }),
                _ => {}
            }
        }
        computed
    }
}
