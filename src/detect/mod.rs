mod backend;
pub mod backends;
mod registry;
mod result;

pub use backend::{DetectorKind, DetectorMode, FaceDetector};
pub use backends::{ScriptedDetector, ScriptedFace};
pub use registry::DetectorSet;
pub use result::{GenderSignal, RawDetection};

#[cfg(feature = "backend-tract")]
pub use backends::{GenderColumn, TractDetector, TractModelSpec};
