//! Real-time ISR video pipeline.
//!
//! Three stages run on their own threads: capture pairs each decoded frame
//! with the latest KLV telemetry, inference runs the detector and projects
//! every detection onto the ground, and dispatch fans the enriched frame out to
//! independently paced sinks. Stages are joined by leaky queues so a slow
//! consumer costs frames, never latency.

pub mod frame;
pub mod pipeline;
pub mod sinks;

pub use frame::{Detection, EnrichedFrame, FrameRecord};
pub use pipeline::{
    PipelineFault, PipelineHandle, PipelineReport, PipelineSettings, ShutdownCause,
    ShutdownSignal, VisionConfig,
};
pub use sinks::{Sink, SinkError, SinkKind};
