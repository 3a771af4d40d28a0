//! Resolves step-by-step task instructions against a camera frame into the object to
//! interact with, the hand action to perform and the object's pixel location.

pub mod actions;
pub mod config;
pub mod detection;
pub mod error;
pub mod geometry;
pub mod orchestrator;
pub mod overlay;
pub mod parser;
pub mod process;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod util;
pub mod vlm;

pub use actions::ActionVocabulary;
pub use config::GuideConfig;
pub use detection::{CommandDetector, Detector, ObjectLocalizer};
pub use error::{GuideError, Result};
pub use geometry::{Point, ViewTransform};
pub use orchestrator::{Resolution, Resolver, Thresholds};
pub use parser::{InstructionParser, ParseResult, VisionLanguageModel};
pub use session::SessionContext;
pub use store::{InstructionStore, JsonFileBackend};
