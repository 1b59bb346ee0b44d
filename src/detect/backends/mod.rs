pub mod scripted;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use scripted::{ScriptedDetector, ScriptedFace};

#[cfg(feature = "backend-tract")]
pub use tract::{GenderColumn, TractDetector, TractModelSpec};
