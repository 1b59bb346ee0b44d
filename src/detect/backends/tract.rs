#![cfg(feature = "backend-tract")]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tract_onnx::prelude::*;

use crate::detect::backend::{DetectorKind, FaceDetector};
use crate::detect::result::{GenderSignal, RawDetection};
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::geometry::BoundingBox;

type Plan = TypedRunnableModel<TypedModel>;

/// Which probability the model's gender column carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenderColumn {
    Female,
    Male,
}

/// Description of an exported face model.
///
/// The model takes a `1x3xSxS` RGB tensor scaled to `0..1` and yields one
/// `Nx7` tensor of rows `[x1, y1, x2, y2, score, age, gender]` with box
/// corners normalized to the input.
#[derive(Clone, Debug)]
pub struct TractModelSpec {
    pub kind: DetectorKind,
    pub path: PathBuf,
    pub gender_column: GenderColumn,
    /// Input sizes compiled during warm-up, see `PassConfig::input_sizes`.
    pub input_sizes: Vec<u32>,
}

/// Parsed model plus one compiled plan per input size.
struct PlanCache {
    model: InferenceModel,
    plans: Mutex<HashMap<u32, Arc<Plan>>>,
}

/// Tract-based ONNX detector.
///
/// Plan compilation and inference both run on the blocking pool, so a cycle
/// timeout can always abandon them. Warm-up compiles every configured input
/// size; any other size is compiled on first use.
pub struct TractDetector {
    spec: TractModelSpec,
    cache: Arc<PlanCache>,
}

impl TractDetector {
    /// Load an ONNX model from disk. Plans are built in `warm_up`.
    pub fn load(spec: TractModelSpec) -> Result<Self> {
        let model = tract_onnx::onnx()
            .model_for_path(&spec.path)
            .with_context(|| format!("failed to load ONNX model from {}", spec.path.display()))?;
        Ok(Self {
            spec,
            cache: Arc::new(PlanCache {
                model,
                plans: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.spec.path
    }

    fn warm_up_sizes(&self) -> Vec<u32> {
        if self.spec.input_sizes.is_empty() {
            vec![match self.spec.kind {
                DetectorKind::Tiny => 416,
                DetectorKind::Ssd => 512,
            }]
        } else {
            self.spec.input_sizes.clone()
        }
    }

    /// Resize to `size x size` and lay out as NCHW floats.
    fn build_input(frame: &Frame, size: u32) -> Result<Tensor> {
        let view = frame
            .as_image()
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
        let resized = image::imageops::resize(
            &view,
            size,
            size,
            image::imageops::FilterType::Triangle,
        );
        let s = size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, s, s), |(_, channel, y, x)| {
            resized.get_pixel(x as u32, y as u32).0[channel] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn parse_output(
        outputs: TVec<TValue>,
        frame_width: f32,
        frame_height: f32,
        threshold: f32,
        gender_column: GenderColumn,
    ) -> Result<Vec<RawDetection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let rows = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let flat: Vec<f32> = rows.iter().copied().collect();
        if flat.len() % 7 != 0 {
            return Err(anyhow!(
                "model output has {} values, expected rows of 7",
                flat.len()
            ));
        }

        let mut detections = Vec::new();
        for row in flat.chunks_exact(7) {
            let score = row[4];
            if !score.is_finite() || score < threshold {
                continue;
            }
            let x1 = row[0].clamp(0.0, 1.0) * frame_width;
            let y1 = row[1].clamp(0.0, 1.0) * frame_height;
            let x2 = row[2].clamp(0.0, 1.0) * frame_width;
            let y2 = row[3].clamp(0.0, 1.0) * frame_height;
            if x2 <= x1 || y2 <= y1 {
                continue;
            }
            let gender = match gender_column {
                GenderColumn::Female => GenderSignal::Female(row[6]),
                GenderColumn::Male => GenderSignal::Male(row[6]),
            };
            detections.push(RawDetection::new(
                BoundingBox::new(x1, y1, x2 - x1, y2 - y1),
                score,
                row[5],
                gender,
            ));
        }
        Ok(detections)
    }
}

impl PlanCache {
    fn plan_for(&self, input_size: u32) -> Result<Arc<Plan>> {
        let mut plans = self
            .plans
            .lock()
            .map_err(|_| anyhow!("plan cache lock poisoned"))?;
        if let Some(plan) = plans.get(&input_size) {
            return Ok(plan.clone());
        }
        let size = input_size as usize;
        let plan = self
            .model
            .clone()
            .with_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)))
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;
        let plan = Arc::new(plan);
        plans.insert(input_size, plan.clone());
        Ok(plan)
    }
}

#[async_trait]
impl FaceDetector for TractDetector {
    fn kind(&self) -> DetectorKind {
        self.spec.kind
    }

    fn backend_name(&self) -> &'static str {
        "tract"
    }

    async fn detect(
        &self,
        frame: &Frame,
        input_size: u32,
        score_threshold: f32,
    ) -> Result<Vec<RawDetection>, PipelineError> {
        let to_inference = |e: anyhow::Error| PipelineError::Inference(format!("{:#}", e));

        let input = Self::build_input(frame, input_size).map_err(to_inference)?;
        let (fw, fh) = (frame.width() as f32, frame.height() as f32);
        let gender_column = self.spec.gender_column;
        let cache = Arc::clone(&self.cache);

        tokio::task::spawn_blocking(move || {
            let plan = cache.plan_for(input_size)?;
            let outputs = plan
                .run(tvec!(input.into()))
                .context("ONNX inference failed")?;
            Self::parse_output(outputs, fw, fh, score_threshold, gender_column)
        })
        .await
        .map_err(|e| PipelineError::Inference(format!("inference task failed: {}", e)))?
        .map_err(to_inference)
    }

    async fn warm_up(&self) -> Result<(), PipelineError> {
        let kind = self.spec.kind;
        let sizes = self.warm_up_sizes();
        let cache = Arc::clone(&self.cache);
        let compiled = tokio::task::spawn_blocking(move || -> Result<()> {
            for size in sizes {
                cache.plan_for(size)?;
                log::debug!("{} detector plan compiled for {}px", kind, size);
            }
            Ok(())
        })
        .await;
        match compiled {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                log::warn!("{} detector failed to compile: {:#}", kind, e);
                Err(PipelineError::DetectorUnavailable(kind))
            }
            Err(e) => {
                log::warn!("{} detector warm-up task failed: {}", kind, e);
                Err(PipelineError::DetectorUnavailable(kind))
            }
        }
    }
}
