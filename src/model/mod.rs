mod conv;
mod discriminator;
mod drit;
mod encoder;
mod generator;
pub mod loss;
mod norm;
mod resnet_block;

pub use conv::*;
pub use discriminator::*;
pub use drit::*;
pub use encoder::*;
pub use generator::*;
pub use norm::*;
pub use resnet_block::*;

use crate::common::*;

pub(crate) fn leaky_relu(xs: &Tensor, slope: f64) -> Tensor {
    xs.relu() - (-xs).relu() * slope
}
