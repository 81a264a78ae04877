pub mod assembler;
pub mod audio;
pub mod beat_detector;
pub mod config;
pub mod enhancer;
pub mod error;
pub mod handler;
pub mod planner;
pub mod processor;
pub mod report;
pub mod services;
pub mod storyboard;
pub mod synthesizer;

pub use assembler::VideoAssembler;
pub use audio::{load_audio, AudioHandle};
pub use beat_detector::BeatDetector;
pub use config::{ConfigLoader, Credentials, ExtendedConfig, PipelineConfig};
pub use enhancer::PromptEnhancer;
pub use error::{PipelineError, Result};
pub use planner::SegmentPlanner;
pub use processor::{Pipeline, RunOutput};
pub use report::{Stage, StageReport, StageStatus};
pub use storyboard::{Segment, Storyboard};
pub use synthesizer::FrameSynthesizer;
