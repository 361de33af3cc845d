pub mod logging;
pub mod metrics;
pub mod panic_log;
pub mod trace;

pub use trace::{Span, TraceConfig, Tracer};
