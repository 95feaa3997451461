#![doc = include_str!("../README.md")]
#![deny(missing_docs)]

mod calc;
mod checkout;
mod error;
mod ident;
mod quark;
mod revision;
mod tracer;
mod transaction;
mod walk;

pub use calc::{
    CalcRequest, CalcStep, Calculation, EffectResolver, Formula, Resolution, ResumeAll, Resumed,
};
pub use checkout::{Checkout, Propagation};
pub use error::GraphError;
pub use ident::{Ident, Identifier};
pub use quark::{Quark, QuarkData};
pub use revision::Revision;
pub use tracer::{NoopTracer, Tracer};
pub use walk::{cycle_info, DepthWalk, OnCycleAction, WalkResult, WalkStep};
