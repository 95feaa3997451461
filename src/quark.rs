//! Versioned value records.

use std::sync::Arc;

use crate::ident::Ident;

/// The payload of a quark.
#[derive(Debug)]
pub enum QuarkData<V> {
    /// A value calculated or written in the owning revision, together with
    /// the identifiers the calculation read.
    Own {
        /// The committed value.
        value: V,
        /// Identifiers read while producing the value, in read order.
        reads: Vec<Ident>,
        /// The calculation consumed its staged input through a
        /// proposed-or-current request, so it must recompute on the next
        /// propagate even with no dirty dependencies.
        used_proposed: bool,
    },
    /// The value was recomputed but compared equal to the previous one; the
    /// quark forwards to the origin that actually owns the value. Forwarding
    /// is always one hop: a shadow points at an `Own` quark, never at
    /// another shadow.
    Shadow {
        /// The quark owning the unchanged value.
        origin: Arc<Quark<V>>,
    },
    /// A lazy identifier that has not been calculated yet. Carries any input
    /// staged for it so the on-demand calculation can still see it.
    Pending {
        /// Value staged by a write, if any.
        proposed: Option<V>,
        /// Arguments attached to the staged write, if any.
        args: Option<Vec<V>>,
    },
    /// The identifier was removed in the owning revision. Terminates lookup
    /// walks down the revision chain.
    Tombstone,
}

/// One identifier's entry in one revision.
#[derive(Debug)]
pub struct Quark<V> {
    pub(crate) ident: Ident,
    pub(crate) created_at: u64,
    pub(crate) data: QuarkData<V>,
}

impl<V> Quark<V> {
    pub(crate) fn new(ident: Ident, created_at: u64, data: QuarkData<V>) -> Self {
        Self {
            ident,
            created_at,
            data,
        }
    }

    /// The identifier this quark belongs to.
    pub fn ident(&self) -> Ident {
        self.ident
    }

    /// The revision clock value at which this quark was committed.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// The value, following shadow forwarding. `None` for pending and
    /// tombstone quarks.
    pub fn value(&self) -> Option<&V> {
        match &self.data {
            QuarkData::Own { value, .. } => Some(value),
            QuarkData::Shadow { origin } => origin.value(),
            QuarkData::Pending { .. } | QuarkData::Tombstone => None,
        }
    }

    /// The quark that owns the value: the forwarding target for shadows,
    /// `this` itself otherwise.
    pub fn origin(this: &Arc<Self>) -> Arc<Self> {
        match &this.data {
            QuarkData::Shadow { origin } => Arc::clone(origin),
            _ => Arc::clone(this),
        }
    }

    /// The identifiers read while producing the value, following shadow
    /// forwarding. A shadow's dependency edges are unchanged from its
    /// origin's.
    pub fn reads(&self) -> &[Ident] {
        match &self.data {
            QuarkData::Own { reads, .. } => reads,
            QuarkData::Shadow { origin } => origin.reads(),
            QuarkData::Pending { .. } | QuarkData::Tombstone => &[],
        }
    }

    /// Whether the value was consumed from staged input, following shadow
    /// forwarding.
    pub fn used_proposed(&self) -> bool {
        match &self.data {
            QuarkData::Own { used_proposed, .. } => *used_proposed,
            QuarkData::Shadow { origin } => origin.used_proposed(),
            QuarkData::Pending { .. } | QuarkData::Tombstone => false,
        }
    }

    /// Returns true for shadow quarks.
    pub fn is_shadow(&self) -> bool {
        matches!(self.data, QuarkData::Shadow { .. })
    }

    /// Returns true for not-yet-calculated lazy entries.
    pub fn is_pending(&self) -> bool {
        matches!(self.data, QuarkData::Pending { .. })
    }

    /// Returns true for removal markers.
    pub fn is_tombstone(&self) -> bool {
        matches!(self.data, QuarkData::Tombstone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_forwards_value_and_reads() {
        let own = Arc::new(Quark::new(
            Ident(1),
            5,
            QuarkData::Own {
                value: 42,
                reads: vec![Ident(2), Ident(3)],
                used_proposed: false,
            },
        ));
        let shadow = Arc::new(Quark::new(
            Ident(1),
            6,
            QuarkData::Shadow {
                origin: Arc::clone(&own),
            },
        ));

        assert_eq!(shadow.value(), Some(&42));
        assert_eq!(shadow.reads(), &[Ident(2), Ident(3)]);
        assert!(Arc::ptr_eq(&Quark::origin(&shadow), &own));
        assert_eq!(shadow.created_at(), 6);
        assert_eq!(own.created_at(), 5);
    }

    #[test]
    fn origin_of_own_quark_is_itself() {
        let own: Arc<Quark<i64>> = Arc::new(Quark::new(
            Ident(1),
            1,
            QuarkData::Own {
                value: 1,
                reads: Vec::new(),
                used_proposed: false,
            },
        ));
        assert!(Arc::ptr_eq(&Quark::origin(&own), &own));
    }

    #[test]
    fn pending_and_tombstone_have_no_value() {
        let pending: Quark<i64> = Quark::new(
            Ident(1),
            1,
            QuarkData::Pending {
                proposed: Some(3),
                args: None,
            },
        );
        let tombstone: Quark<i64> = Quark::new(Ident(2), 1, QuarkData::Tombstone);

        assert!(pending.value().is_none());
        assert!(pending.is_pending());
        assert!(tombstone.value().is_none());
        assert!(tombstone.is_tombstone());
    }
}
