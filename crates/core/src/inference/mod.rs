//! Inference engine capability
//!
//! The pipeline treats the network as an opaque engine with a two-step
//! contract: [`InferenceEngine::schedule`] dispatches work and
//! [`InferenceEngine::read_output`] fetches the result. [`execute`] yields to
//! the runtime once between the two so backends that need a scheduling tick
//! to produce output are supported.

pub mod provider;
pub mod simulated;

pub use provider::{negotiate_engine, resolve_model_path, ModelProvider, DEFAULT_MODEL_FILES};
pub use simulated::{SimulatedEngine, SimulatedProvider};

use crate::tensor::{TensorBuffer, TensorShape};
use crate::{Error, Result};

/// Loaded model able to run segmentation
pub trait InferenceEngine: Send {
    /// Model identifier for logs
    fn model_id(&self) -> &str;

    /// Result tensor shape reported by the model
    fn output_shape(&self) -> Result<TensorShape>;

    /// Dispatch inference for `input`
    fn schedule(&mut self, input: &TensorBuffer) -> Result<()>;

    /// Fetch the result of the last dispatch
    fn read_output(&mut self) -> Result<TensorBuffer>;
}

/// Run one inference: dispatch, wait one tick, read back
pub async fn execute(
    engine: &mut dyn InferenceEngine,
    input: &TensorBuffer,
) -> Result<TensorBuffer> {
    engine.schedule(input).map_err(into_inference_error)?;
    tokio::task::yield_now().await;
    engine.read_output().map_err(into_inference_error)
}

fn into_inference_error(err: Error) -> Error {
    match err {
        Error::Inference(_) => err,
        other => Error::Inference(other.to_string()),
    }
}

/// Ask the engine for its output shape, falling back when it cannot say
pub fn discover_output_shape(engine: &dyn InferenceEngine, fallback: TensorShape) -> TensorShape {
    match engine.output_shape() {
        Ok(shape) if !shape.is_empty() => {
            tracing::info!(
                "Model '{}' output shape {}",
                engine.model_id(),
                shape
            );
            shape
        }
        Ok(shape) => {
            tracing::warn!(
                "Model '{}' reported empty output shape {}, using fallback {}",
                engine.model_id(),
                shape,
                fallback
            );
            fallback
        }
        Err(e) => {
            tracing::warn!(
                "Could not discover output shape of '{}' ({}), using fallback {}",
                engine.model_id(),
                e,
                fallback
            );
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakyEngine {
        dispatched: bool,
        fail_read: bool,
    }

    impl InferenceEngine for FlakyEngine {
        fn model_id(&self) -> &str {
            "flaky"
        }

        fn output_shape(&self) -> Result<TensorShape> {
            Err(Error::InvalidData("no metadata".into()))
        }

        fn schedule(&mut self, _input: &TensorBuffer) -> Result<()> {
            self.dispatched = true;
            Ok(())
        }

        fn read_output(&mut self) -> Result<TensorBuffer> {
            if self.fail_read {
                return Err(Error::InvalidData("readback lost".into()));
            }
            Ok(TensorBuffer::filled(TensorShape::new(1, 1, 2, 2), 0.5))
        }
    }

    #[tokio::test]
    async fn test_execute_dispatches_then_reads() {
        let mut engine = FlakyEngine {
            dispatched: false,
            fail_read: false,
        };
        let input = TensorBuffer::filled(TensorShape::new(1, 3, 4, 4), 0.0);
        let out = execute(&mut engine, &input).await.unwrap();
        assert!(engine.dispatched);
        assert_eq!(out.shape(), TensorShape::new(1, 1, 2, 2));
    }

    #[tokio::test]
    async fn test_readback_failure_is_inference_error() {
        let mut engine = FlakyEngine {
            dispatched: false,
            fail_read: true,
        };
        let input = TensorBuffer::filled(TensorShape::new(1, 3, 4, 4), 0.0);
        let err = execute(&mut engine, &input).await.unwrap_err();
        assert!(matches!(err, Error::Inference(_)));
    }

    #[test]
    fn test_discovery_falls_back() {
        let engine = FlakyEngine {
            dispatched: false,
            fail_read: false,
        };
        let fallback = TensorShape::new(1, 1, 120, 160);
        assert_eq!(discover_output_shape(&engine, fallback), fallback);
    }
}
