use async_trait::async_trait;

use crate::data::{CacheData, TransferData};
use crate::error::{PipelineError, Result};
use crate::tensor::Tensor;

/// ZeRO optimizer partitioning stage of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ZeroStage {
    Disabled,
    OptimizerStates,
    Gradients,
    Parameters,
}

/// Numeric precision of the training path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Fp16,
    Bf16,
}

/// One pipeline stage of a model: a contiguous slice of layers behind an
/// opaque compute surface.
///
/// `forward` consumes `x.pp_input` (absent on the first stage, which reads
/// token ids from `ys[0].input_ids`) and leaves the stage output in
/// `x.pp_output`. `ys` holds one [`CacheData`] per local layer and is mutated
/// in place; in generation the module fills `k_cache`/`v_cache` with the
/// freshly computed keys/values so the engine can reserve persistent caches.
///
/// The backward surface mirrors a fused autograd+optimizer backend: the
/// module is responsible for remembering whatever forward state it needs,
/// keyed by micro-batch.
#[async_trait]
pub trait StageModule: Send + Sync {
    /// Number of layers held by this stage.
    fn num_layers(&self) -> usize;

    /// Global indices `[start, stop)` of the layers held by this stage.
    fn layer_indices(&self) -> std::ops::Range<usize>;

    fn precision(&self) -> Precision {
        Precision::Fp16
    }

    fn zero_stage(&self) -> ZeroStage {
        ZeroStage::OptimizerStates
    }

    /// Toggle train/eval behavior (dropout and friends). Default: no-op.
    fn set_train_mode(&mut self, _train: bool) {}

    async fn forward(&mut self, x: &mut TransferData, ys: &mut [CacheData]) -> Result<()>;

    /// Backward from a scalar loss (last stage). Returns the gradient with
    /// respect to the received activation, or `None` when this stage has no
    /// upstream.
    fn backward_from_loss(&mut self, _micro_batch: usize, _loss: f64) -> Result<Option<Tensor>> {
        Err(PipelineError::Module(
            "backward not supported by this stage module".into(),
        ))
    }

    /// Backward from the gradient of this stage's output (non-last stages).
    /// Returns the gradient with respect to the received activation, or
    /// `None` on the first stage.
    fn backward_from_output_grad(
        &mut self,
        _micro_batch: usize,
        _output: &Tensor,
        _grad_output: &Tensor,
    ) -> Result<Option<Tensor>> {
        Err(PipelineError::Module(
            "backward not supported by this stage module".into(),
        ))
    }

    /// Flat gradient buffer for data-parallel reduction. For bf16 backends
    /// this is the fp32 master-gradient view.
    fn grads_for_reduction(&mut self) -> Result<Vec<f32>> {
        Err(PipelineError::Module(
            "gradient reduction not supported by this stage module".into(),
        ))
    }

    /// Install the reduced gradients back into the backend.
    fn install_reduced_grads(&mut self, _grads: Vec<f32>) -> Result<()> {
        Err(PipelineError::Module(
            "gradient reduction not supported by this stage module".into(),
        ))
    }

    /// Apply the optimizer. `version_steps` feeds learning-rate schedules.
    fn optimizer_step(&mut self, _version_steps: Option<i64>) -> Result<()> {
        Err(PipelineError::Module(
            "optimizer step not supported by this stage module".into(),
        ))
    }

    /// Current dynamic loss scale (fp16 path).
    fn loss_scale(&self) -> f32 {
        1.0
    }

    fn set_loss_scale(&mut self, _scale: f32) {}

    /// Named parameter tensors of this stage, for checkpointing.
    fn state_dict(&self) -> Vec<(String, Tensor)> {
        Vec::new()
    }

    fn load_state_dict(&mut self, _state: Vec<(String, Tensor)>) -> Result<()> {
        Ok(())
    }
}
