//! Command Runtime (§4.F): script compilation/caching and the
//! request-info / cmd / delay / control invocation loop, built on the
//! embedded `Evaluator` seam.

pub mod runtime;
pub mod script;

pub use runtime::{CommandRuntime, CommandSink, CompiledCommand};
pub use script::{Evaluator, RhaiEvaluator, ScriptValue};
