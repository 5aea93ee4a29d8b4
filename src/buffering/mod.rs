//! Two-stage buffering: token gate in front of the trace accumulator.

mod accumulator;
mod segment_gate;

pub use accumulator::{AppendedTrace, BufferedTrace, TraceAccumulator, TraceRecord, NO_PREVIOUS_TRACES};
pub use segment_gate::{count_tokens, FlushReason, GateFlush, SegmentGate};
