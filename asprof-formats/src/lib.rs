//! Output serializers for the asprof profiler.
//!
//! This crate turns aggregated profiles — stacks of rendered frame names with
//! sample counts and weights — into the on-disk formats the profiler can be
//! asked for:
//!
//! - [`collapsed`]: line-per-stack text accepted by flame graph tooling
//! - [`flame_graph`]: a self-contained interactive flame graph / call tree HTML
//! - [`jfr`]: JFR binary chunks (metadata + constant pools + varint events)
//! - [`otlp`]: pprof/OTLP protobuf profiles, optionally gzipped
//!
//! The serializers know nothing about the profiler's internal frame or trace
//! representations; the agent crate renders frames to names and feeds them in.

pub mod collapsed;
pub mod flame_graph;
pub mod jfr;
pub mod otlp;
pub mod protobuf;

pub use collapsed::{parse_collapsed, CollapsedWriter};
pub use flame_graph::{Counter, FlameGraph, FrameKind};
pub use jfr::{parse_chunk, JfrChunkWriter, JfrError, JfrEvent, JfrStackFrame};
pub use otlp::OtlpProfile;
pub use protobuf::ProtoBuffer;
