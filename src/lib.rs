//! GEORGEQ - Render job queue and extraction toolkit for George-scripted
//! host applications
//!
//! Re-exports all modules for use by binary targets.

pub mod cli;
pub mod commands;
pub mod communicator;
pub mod compositor;
pub mod job;
pub mod planner;
pub mod refs;
pub mod sender;
pub mod server;
pub mod worker;

// Re-export the types most integrations need
pub use commands::{Command, CommandError, ExecutionContext, ProcessorCommands, SenderCommands};
pub use communicator::{Communicator, RecordingCommunicator, SceneData};
pub use job::{Job, JobError, JobState, JobStatus};
pub use planner::{ExtractionOptions, ExtractionPlan, LayerBehavior, LayerData};
pub use refs::{Behavior, FrameReferenceMap, calculate_layer_frame_references};
pub use sender::JobQueueClient;
pub use worker::{ConnectionState, Worker};
