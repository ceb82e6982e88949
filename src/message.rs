use crate::{
    common::*,
    model::{DiscriminatorLosses, GeneratorLosses},
};

#[derive(Debug)]
pub enum LogMessage {
    Loss(LossLog),
    Image { step: usize, image: Tensor },
}

/// Loss record of one training step. Steps that only update the content
/// critic carry no discriminator or generator losses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossLog {
    pub epoch: usize,
    pub total_it: usize,
    pub learning_rate: f64,
    pub dis_content: Option<f64>,
    pub discriminator: Option<DiscriminatorLosses>,
    pub generator: Option<GeneratorLosses>,
}

#[derive(Debug, TensorLike)]
pub struct TrainingMessage {
    pub batch_index: usize,
    /// Number of full batches in the current epoch.
    pub num_batches: usize,
    pub image_a: Tensor,
    pub image_b: Tensor,
}
