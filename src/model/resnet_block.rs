use super::{
    conv::{Conv2D, Conv2DInit},
    norm::{Norm, NormKind},
};
use crate::common::*;

#[derive(Debug, Clone)]
pub struct ResnetBlockInit {
    pub norm_kind: NormKind,
    pub dropout: bool,
}

impl Default for ResnetBlockInit {
    fn default() -> Self {
        Self {
            norm_kind: NormKind::InstanceNorm,
            dropout: false,
        }
    }
}

impl ResnetBlockInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>, channels: usize) -> Result<ResnetBlock> {
        let path = path.borrow();
        let Self { norm_kind, dropout } = self;

        let conv1 = Conv2DInit::new(3).build(path / "conv1", channels, channels)?;
        let norm1 = norm_kind.build(path / "norm1", channels);
        let conv2 = Conv2DInit::new(3).build(path / "conv2", channels, channels)?;
        let norm2 = norm_kind.build(path / "norm2", channels);

        Ok(ResnetBlock {
            conv1,
            norm1,
            conv2,
            norm2,
            dropout,
        })
    }
}

#[derive(Debug)]
pub struct ResnetBlock {
    conv1: Conv2D,
    norm1: Norm,
    conv2: Conv2D,
    norm2: Norm,
    dropout: bool,
}

impl nn::ModuleT for ResnetBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let Self {
            ref conv1,
            ref norm1,
            ref conv2,
            ref norm2,
            dropout,
        } = *self;

        let ys = norm1.forward(&conv1.forward_t(xs, train)).relu();
        let ys = if dropout { ys.dropout(0.5, train) } else { ys };
        let ys = norm2.forward(&conv2.forward_t(&ys, train));
        xs + ys
    }
}
