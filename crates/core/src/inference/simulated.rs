//! Simulated inference backend
//!
//! Produces a pseudo-segmentation without a network: bright regions of the
//! input are reported as the target class. Used when no real backend is
//! available and by the demo binary.

use std::path::Path;

use super::{InferenceEngine, ModelProvider};
use crate::tensor::{TensorBuffer, TensorShape};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy)]
enum Output {
    Luma,
    Constant(f32),
}

/// Engine that derives a mask from input brightness
#[derive(Debug)]
pub struct SimulatedEngine {
    model_id: String,
    output_shape: TensorShape,
    output: Output,
    pending: Option<TensorBuffer>,
}

impl SimulatedEngine {
    /// Engine whose channel 0 is the box-averaged input luma
    pub fn luma(output_shape: TensorShape) -> Self {
        Self {
            model_id: "simulated-luma".to_string(),
            output_shape,
            output: Output::Luma,
            pending: None,
        }
    }

    /// Engine whose every output element is `value`
    pub fn constant(output_shape: TensorShape, value: f32) -> Self {
        Self {
            model_id: "simulated-constant".to_string(),
            output_shape,
            output: Output::Constant(value),
            pending: None,
        }
    }

    /// Override the model identifier
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    fn luma_mask(&self, input: &TensorBuffer) -> Result<TensorBuffer> {
        let in_shape = input.shape();
        if in_shape.channels < 3 {
            return Err(Error::Inference(format!(
                "expected RGB input, got shape {}",
                in_shape
            )));
        }
        let (r, g, b) = (input.channel(0)?, input.channel(1)?, input.channel(2)?);
        let out = self.output_shape;
        let mut data = vec![0.0f32; out.element_count()];

        for oy in 0..out.height {
            let y0 = oy * in_shape.height / out.height;
            let y1 = ((oy + 1) * in_shape.height / out.height).max(y0 + 1);
            for ox in 0..out.width {
                let x0 = ox * in_shape.width / out.width;
                let x1 = ((ox + 1) * in_shape.width / out.width).max(x0 + 1);
                let mut sum = 0.0f32;
                let mut n = 0usize;
                for y in y0..y1.min(in_shape.height) {
                    for x in x0..x1.min(in_shape.width) {
                        let i = y * in_shape.width + x;
                        sum += 0.299 * r[i] + 0.587 * g[i] + 0.114 * b[i];
                        n += 1;
                    }
                }
                let luma = if n > 0 { sum / n as f32 } else { 0.0 };
                data[oy * out.width + ox] = luma;
            }
        }
        TensorBuffer::from_vec(data, out)
    }
}

impl InferenceEngine for SimulatedEngine {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn output_shape(&self) -> Result<TensorShape> {
        Ok(self.output_shape)
    }

    fn schedule(&mut self, input: &TensorBuffer) -> Result<()> {
        let result = match self.output {
            Output::Luma => self.luma_mask(input)?,
            Output::Constant(v) => TensorBuffer::filled(self.output_shape, v),
        };
        self.pending = Some(result);
        Ok(())
    }

    fn read_output(&mut self) -> Result<TensorBuffer> {
        self.pending
            .take()
            .ok_or_else(|| Error::Inference("read_output called before schedule".into()))
    }
}

/// Provider that accepts any model file and returns a luma engine
#[derive(Debug, Clone)]
pub struct SimulatedProvider {
    output_shape: TensorShape,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self {
            output_shape: TensorShape::new(1, 1, 120, 160),
        }
    }
}

impl SimulatedProvider {
    /// Provider producing engines with the given output shape
    pub fn new(output_shape: TensorShape) -> Self {
        Self { output_shape }
    }
}

impl ModelProvider for SimulatedProvider {
    fn name(&self) -> &str {
        "simulated"
    }

    fn load_model(&self, path: &Path) -> Result<Box<dyn InferenceEngine>> {
        let file = path
            .file_name()
            .and_then(|f| f.to_str())
            .ok_or_else(|| Error::ModelLoad(format!("invalid model path {}", path.display())))?;
        let engine = SimulatedEngine::luma(self.output_shape)
            .with_model_id(format!("simulated:{}", file));
        Ok(Box::new(engine))
    }
}
