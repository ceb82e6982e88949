use crate::common::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NormKind {
    InstanceNorm,
    None,
}

impl NormKind {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>, out_dim: usize) -> Norm {
        match self {
            Self::InstanceNorm => {
                let norm = InstanceNormInit::default().build(path, out_dim);
                Norm::InstanceNorm(norm)
            }
            Self::None => Norm::None,
        }
    }
}

#[derive(Debug)]
pub enum Norm {
    InstanceNorm(InstanceNorm),
    None,
}

impl nn::Module for Norm {
    fn forward(&self, input: &Tensor) -> Tensor {
        match self {
            Self::InstanceNorm(norm) => norm.forward(input),
            Self::None => input.shallow_clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstanceNormInit {
    pub eps: f64,
    pub affine: bool,
    pub cudnn_enabled: bool,
}

impl Default for InstanceNormInit {
    fn default() -> Self {
        Self {
            eps: 1e-5,
            affine: false,
            cudnn_enabled: true,
        }
    }
}

impl InstanceNormInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>, out_dim: usize) -> InstanceNorm {
        let path = path.borrow();
        let Self {
            eps,
            affine,
            cudnn_enabled,
        } = self;
        let out_dim = out_dim as i64;

        let ws = affine.then(|| path.var("weight", &[out_dim], nn::Init::Const(1.0)));
        let bs = affine.then(|| path.var("bias", &[out_dim], nn::Init::Const(0.0)));

        InstanceNorm {
            ws,
            bs,
            eps,
            cudnn_enabled,
        }
    }
}

/// Per-sample, per-channel normalization without running statistics.
#[derive(Debug)]
pub struct InstanceNorm {
    ws: Option<Tensor>,
    bs: Option<Tensor>,
    eps: f64,
    cudnn_enabled: bool,
}

impl nn::Module for InstanceNorm {
    fn forward(&self, input: &Tensor) -> Tensor {
        let Self {
            ref ws,
            ref bs,
            eps,
            cudnn_enabled,
        } = *self;

        Tensor::instance_norm::<&Tensor>(
            input,
            ws.as_ref(),
            bs.as_ref(),
            None,
            None,
            true, // use_input_stats
            0.1,
            eps,
            cudnn_enabled,
        )
    }
}
