pub mod binding;
pub mod compaction;
pub mod compiler;
pub mod dependency;
pub mod error;
pub mod fence;
pub mod frame;
pub mod frame_graph;
pub mod pass_node;
pub mod recorder;
pub mod reduction;
pub mod resource;
pub mod submission;
pub mod testing;

pub use error::FrameGraphError;
pub use frame::Frame;
pub use frame_graph::{FrameGraph, FrameGraphConfig, FrameReport};
pub use pass_node::{PassNode, PassNodeBuilder};
pub use recorder::PassRecorder;
