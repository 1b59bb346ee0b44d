use crate::geometry::BoundingBox;

/// Gender output as reported by a detector, in that detector's convention.
///
/// Adapters record which convention their model uses; nothing downstream needs
/// to know. `female_probability` is the only normalization point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GenderSignal {
    /// Probability that the face is female.
    Female(f32),
    /// Probability that the face is male.
    Male(f32),
    /// Model produced no gender estimate.
    Unknown,
}

impl GenderSignal {
    pub fn female_probability(&self) -> f32 {
        match *self {
            GenderSignal::Female(p) => sanitize(p),
            GenderSignal::Male(p) => 1.0 - sanitize(p),
            GenderSignal::Unknown => 0.5,
        }
    }
}

fn sanitize(p: f32) -> f32 {
    if p.is_finite() {
        p.clamp(0.0, 1.0)
    } else {
        0.5
    }
}

/// Output of one detector invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    /// Box in the pixel space of the frame fed to the detector.
    pub bbox: BoundingBox,
    /// Detector confidence in `0..=1`.
    pub score: f32,
    /// Raw apparent age in years.
    pub age: f32,
    pub gender: GenderSignal,
}

impl RawDetection {
    pub fn new(bbox: BoundingBox, score: f32, age: f32, gender: GenderSignal) -> Self {
        Self {
            bbox,
            score,
            age,
            gender,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conventions_normalize_to_female_probability() {
        assert_eq!(GenderSignal::Female(0.8).female_probability(), 0.8);
        assert!((GenderSignal::Male(0.8).female_probability() - 0.2).abs() < 1e-6);
        assert_eq!(GenderSignal::Unknown.female_probability(), 0.5);
    }

    #[test]
    fn out_of_range_probabilities_are_clamped() {
        assert_eq!(GenderSignal::Female(1.7).female_probability(), 1.0);
        assert_eq!(GenderSignal::Male(f32::NAN).female_probability(), 0.5);
    }
}
