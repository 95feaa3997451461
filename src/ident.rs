//! Identifier handles and descriptors.

use std::fmt;
use std::sync::Arc;

use crate::calc::Calculation;

/// Handle for a registered identifier.
///
/// Handles are allocated by a [`Checkout`](crate::Checkout) family and stay
/// unique across its branches; they carry no value themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident(pub(crate) u64);

pub(crate) type CalcFactory<V> = Arc<dyn Fn() -> Box<dyn Calculation<V>>>;
pub(crate) type EqualityFn<V> = Arc<dyn Fn(&V, &V) -> bool>;

/// Immutable descriptor of one slot: how it is calculated, how its values
/// are compared, and whether it is computed eagerly or on demand.
///
/// A descriptor with no calculation is a *variable*: its value comes directly
/// from writes. A descriptor with a calculation factory is recomputed by the
/// propagation pass; the factory produces a fresh [`Calculation`] for every
/// recomputation, so the set of identifiers it reads may change between
/// revisions.
pub struct Identifier<V> {
    pub(crate) name: String,
    pub(crate) calc: Option<CalcFactory<V>>,
    pub(crate) equality: EqualityFn<V>,
    pub(crate) lazy: bool,
    pub(crate) sync: bool,
}

impl<V: PartialEq + 'static> Identifier<V> {
    /// A directly-written slot with strict equality.
    pub fn variable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calc: None,
            equality: Arc::new(|a, b| a == b),
            lazy: false,
            sync: true,
        }
    }

    /// A derived slot recomputed through the calculation produced by
    /// `factory`, with strict equality.
    pub fn calculated(
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn Calculation<V>> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            calc: Some(Arc::new(factory)),
            equality: Arc::new(|a, b| a == b),
            lazy: false,
            sync: true,
        }
    }
}

impl<V> Identifier<V> {
    /// Compute this identifier on first read instead of on every propagate.
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    /// Mark the identifier as asynchronous: its calculation may suspend on an
    /// external effect whose resolver blocks for an outstanding result.
    /// Synchronous identifiers must resolve every dependency without
    /// blocking.
    pub fn asynchronous(mut self) -> Self {
        self.sync = false;
        self
    }

    /// Replace the equality predicate used for early cutoff. The predicate
    /// decides whether a recomputed value counts as "unchanged", in which
    /// case dependents are not recomputed.
    pub fn with_equality(mut self, equality: impl Fn(&V, &V) -> bool + 'static) -> Self {
        self.equality = Arc::new(equality);
        self
    }

    /// The identifier's name, used in error paths and tracing.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if this identifier is directly written rather than
    /// calculated.
    pub fn is_variable(&self) -> bool {
        self.calc.is_none()
    }

    /// Returns true if this identifier is computed on demand.
    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    /// Returns true if this identifier's calculation must never block.
    pub fn is_sync(&self) -> bool {
        self.sync
    }
}

impl<V> fmt::Debug for Identifier<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identifier")
            .field("name", &self.name)
            .field("variable", &self.calc.is_none())
            .field("lazy", &self.lazy)
            .field("sync", &self.sync)
            .finish()
    }
}
