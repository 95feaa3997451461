//! The resumable calculation protocol.
//!
//! A calculation is an explicit state machine: the engine calls
//! [`Calculation::start`], receives either a finished value or a suspension
//! request, answers the request, and feeds the answer back through
//! [`Calculation::resume`] until the calculation finishes. Suspension points
//! let the engine record dependencies exactly as they are consumed and let
//! the caller inject data through effects, without the calculation ever
//! holding a reference to engine internals.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::ident::{Ident, Identifier};

/// What a suspended calculation is waiting for.
#[derive(Clone)]
pub enum CalcRequest {
    /// The committed value of another identifier. Establishes a dependency
    /// edge from the requester to the target.
    Read(Ident),
    /// The value staged for the requesting identifier in this transaction,
    /// falling back to its committed value. Reading it marks the result as
    /// input-dependent: the identifier recomputes on the next propagate even
    /// without dirty dependencies.
    ProposedOrCurrent,
    /// Only the value staged in this transaction, if any. Does not mark the
    /// result as input-dependent.
    Proposed,
    /// The arguments attached to the staged write, if any.
    Arguments,
    /// The identifier's own value from the previous revision, if any.
    Previous,
    /// An opaque request answered by the caller's effect resolver.
    External(Arc<dyn Any>),
}

impl fmt::Debug for CalcRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read(ident) => f.debug_tuple("Read").field(ident).finish(),
            Self::ProposedOrCurrent => write!(f, "ProposedOrCurrent"),
            Self::Proposed => write!(f, "Proposed"),
            Self::Arguments => write!(f, "Arguments"),
            Self::Previous => write!(f, "Previous"),
            Self::External(_) => write!(f, "External(..)"),
        }
    }
}

/// The engine's answer to a [`CalcRequest`].
#[derive(Debug, Clone)]
pub enum Resumed<V> {
    /// A single value.
    Value(V),
    /// The requested data does not exist (no staged value, no previous
    /// value, arguments absent).
    Missing,
    /// The arguments of a staged write.
    Arguments(Vec<V>),
}

impl<V> Resumed<V> {
    /// The carried value, or `None` for [`Resumed::Missing`] and argument
    /// answers.
    pub fn value(self) -> Option<V> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    /// The carried arguments, or `None` otherwise.
    pub fn arguments(self) -> Option<Vec<V>> {
        match self {
            Self::Arguments(args) => Some(args),
            _ => None,
        }
    }
}

/// One step of a calculation.
pub enum CalcStep<V> {
    /// The calculation needs `CalcRequest` answered before it can continue.
    Suspend(CalcRequest),
    /// The calculation finished with a value.
    Done(V),
    /// The calculation failed; the propagation is aborted and the error
    /// surfaces from `propagate`.
    Fail(anyhow::Error),
}

impl<V: fmt::Debug> fmt::Debug for CalcStep<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Suspend(request) => f.debug_tuple("Suspend").field(request).finish(),
            Self::Done(value) => f.debug_tuple("Done").field(value).finish(),
            Self::Fail(error) => f.debug_tuple("Fail").field(error).finish(),
        }
    }
}

/// A resumable calculation for one identifier.
///
/// Implementations are created fresh by the identifier's factory for every
/// recomputation, so they may carry mutable state between steps. A finished
/// calculation is never resumed again.
pub trait Calculation<V> {
    /// Begin the calculation.
    fn start(&mut self) -> CalcStep<V>;

    /// Continue after a suspension, with the engine's answer to the most
    /// recent request.
    fn resume(&mut self, resumed: Resumed<V>) -> CalcStep<V>;
}

/// A calculation that issues a fixed list of requests and folds the answers
/// into a value.
///
/// Covers the common case of a derived identifier that reads a known set of
/// inputs. Calculations whose request set depends on earlier answers
/// implement [`Calculation`] directly.
pub struct Formula<V> {
    requests: Vec<CalcRequest>,
    gathered: Vec<Resumed<V>>,
    finish: Box<dyn FnMut(&[Resumed<V>]) -> anyhow::Result<V>>,
}

impl<V> Formula<V> {
    /// A formula that answers `requests` in order and finishes with `finish`
    /// over the collected answers.
    pub fn new(
        requests: Vec<CalcRequest>,
        finish: impl FnMut(&[Resumed<V>]) -> anyhow::Result<V> + 'static,
    ) -> Self {
        Self {
            requests,
            gathered: Vec::new(),
            finish: Box::new(finish),
        }
    }

    fn step(&mut self) -> CalcStep<V> {
        match self.requests.get(self.gathered.len()) {
            Some(request) => CalcStep::Suspend(request.clone()),
            None => match (self.finish)(&self.gathered) {
                Ok(value) => CalcStep::Done(value),
                Err(error) => CalcStep::Fail(error),
            },
        }
    }
}

impl<V> Calculation<V> for Formula<V> {
    fn start(&mut self) -> CalcStep<V> {
        self.step()
    }

    fn resume(&mut self, resumed: Resumed<V>) -> CalcStep<V> {
        self.gathered.push(resumed);
        self.step()
    }
}

/// How the caller's effect resolver answers an [`CalcRequest::External`]
/// suspension.
pub enum Resolution<V> {
    /// Feed `Resumed` back into the suspended calculation.
    Resume(Resumed<V>),
    /// Throw away all in-flight calculations and rerun the propagation from
    /// the same staged operations.
    Restart,
    /// Abort the propagation, discarding staged operations and every
    /// in-flight result.
    Cancel,
}

/// Answers [`CalcRequest::External`] suspensions during a propagation.
///
/// The resolver receives the descriptor of the suspended identifier and the
/// opaque request payload. A resolver may block while waiting for an
/// outstanding result only when the identifier is marked asynchronous
/// ([`Identifier::is_sync`] returns false); synchronous identifiers must be
/// answered immediately.
pub trait EffectResolver<V> {
    /// Answer one external request.
    fn resolve(&mut self, identifier: &Identifier<V>, effect: &Arc<dyn Any>) -> Resolution<V>;
}

impl<V, F> EffectResolver<V> for F
where
    F: FnMut(&Identifier<V>, &Arc<dyn Any>) -> Resolution<V>,
{
    fn resolve(&mut self, identifier: &Identifier<V>, effect: &Arc<dyn Any>) -> Resolution<V> {
        self(identifier, effect)
    }
}

/// The default resolver: answers every external request with
/// [`Resumed::Missing`].
pub struct ResumeAll;

impl<V> EffectResolver<V> for ResumeAll {
    fn resolve(&mut self, _identifier: &Identifier<V>, _effect: &Arc<dyn Any>) -> Resolution<V> {
        Resolution::Resume(Resumed::Missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formula_suspends_in_request_order() {
        let mut formula: Formula<i64> = Formula::new(
            vec![CalcRequest::Read(Ident(1)), CalcRequest::Read(Ident(2))],
            |answers| {
                let sum = answers
                    .iter()
                    .filter_map(|a| a.clone().value())
                    .sum::<i64>();
                Ok(sum)
            },
        );

        match formula.start() {
            CalcStep::Suspend(CalcRequest::Read(ident)) => assert_eq!(ident, Ident(1)),
            other => panic!("unexpected step: {other:?}"),
        }
        match formula.resume(Resumed::Value(10)) {
            CalcStep::Suspend(CalcRequest::Read(ident)) => assert_eq!(ident, Ident(2)),
            other => panic!("unexpected step: {other:?}"),
        }
        match formula.resume(Resumed::Value(32)) {
            CalcStep::Done(value) => assert_eq!(value, 42),
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn formula_with_no_requests_finishes_immediately() {
        let mut formula: Formula<i64> = Formula::new(Vec::new(), |_| Ok(7));
        match formula.start() {
            CalcStep::Done(value) => assert_eq!(value, 7),
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn formula_propagates_failure() {
        let mut formula: Formula<i64> =
            Formula::new(Vec::new(), |_| Err(anyhow::anyhow!("bad input")));
        match formula.start() {
            CalcStep::Fail(error) => assert_eq!(error.to_string(), "bad input"),
            other => panic!("unexpected step: {other:?}"),
        }
    }
}
