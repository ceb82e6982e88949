use super::{
    conv::{Conv2D, Conv2DInit},
    leaky_relu,
    norm::{Norm, NormKind},
};
use crate::common::*;

const SINGLE_SCALE_LAYERS: usize = 6;
const MULTI_SCALE_LAYERS: usize = 4;
const CONTENT_LAYERS: usize = 3;

/// Logits produced by a critic: one map, or one map per scale.
#[derive(Debug)]
pub enum DisOutput {
    Single(Tensor),
    MultiScale(Vec<Tensor>),
}

impl DisOutput {
    pub fn iter(&self) -> impl Iterator<Item = &Tensor> {
        let slice: &[Tensor] = match self {
            Self::Single(tensor) => std::slice::from_ref(tensor),
            Self::MultiScale(tensors) => tensors,
        };
        slice.iter()
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::MultiScale(tensors) => tensors.len(),
        }
    }

    /// The prediction of the coarsest scale.
    pub fn last(&self) -> Option<&Tensor> {
        self.iter().last()
    }
}

#[derive(Debug, Clone)]
pub struct DomainDiscriminatorInit {
    pub input_dim: usize,
    /// Values greater than 1 build a multi-scale critic.
    pub dis_scale: usize,
    pub norm_kind: NormKind,
    pub spectral_norm: bool,
    pub base_channels: usize,
}

impl DomainDiscriminatorInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<DomainDiscriminator> {
        let path = path.borrow();
        let Self {
            input_dim,
            dis_scale,
            norm_kind,
            spectral_norm,
            base_channels,
        } = self;
        ensure!(dis_scale >= 1, "dis_scale must be positive");

        let init = |n_layer| PatchDiscriminatorInit {
            input_dim,
            n_layer,
            norm_kind,
            spectral_norm,
            base_channels,
        };

        let dis = if dis_scale > 1 {
            let scales: Vec<_> = (0..dis_scale)
                .map(|index| init(MULTI_SCALE_LAYERS).build(path / format!("scale_{}", index)))
                .try_collect()?;
            DomainDiscriminator::MultiScale(scales)
        } else {
            DomainDiscriminator::Single(init(SINGLE_SCALE_LAYERS).build(path)?)
        };

        Ok(dis)
    }
}

/// Critic of real versus synthesized images of one domain.
#[derive(Debug)]
pub enum DomainDiscriminator {
    Single(PatchDiscriminator),
    MultiScale(Vec<PatchDiscriminator>),
}

impl DomainDiscriminator {
    pub fn forward_t(&self, input: &Tensor, train: bool) -> DisOutput {
        match self {
            Self::Single(dis) => DisOutput::Single(dis.forward_t(input, train)),
            Self::MultiScale(scales) => {
                let (outputs, _) = scales.iter().fold(
                    (vec![], input.shallow_clone()),
                    |(mut outputs, xs), dis| {
                        outputs.push(dis.forward_t(&xs, train));
                        let xs = xs.avg_pool2d(&[3, 3], &[2, 2], &[1, 1], false, false, None);
                        (outputs, xs)
                    },
                );
                DisOutput::MultiScale(outputs)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatchDiscriminatorInit {
    pub input_dim: usize,
    pub n_layer: usize,
    pub norm_kind: NormKind,
    pub spectral_norm: bool,
    pub base_channels: usize,
}

impl PatchDiscriminatorInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<PatchDiscriminator> {
        let path = path.borrow();
        let Self {
            input_dim,
            n_layer,
            norm_kind,
            spectral_norm,
            base_channels,
        } = self;
        ensure!(n_layer > 0, "zero depth is not allowed");
        let max_c = base_channels * 8;

        let (layers, last_c) = (0..n_layer).try_fold(
            (vec![], input_dim),
            |(mut layers, in_c), index| -> Result<_> {
                let out_c = if index == 0 {
                    base_channels
                } else {
                    (in_c * 2).min(max_c)
                };
                let conv = Conv2DInit {
                    stride: 2,
                    padding: 1,
                    spectral_norm,
                    ..Conv2DInit::new(3)
                }
                .build(path / format!("conv_{}", index), in_c, out_c)?;
                // the first layer is never normalized
                let norm = if index == 0 {
                    Norm::None
                } else {
                    norm_kind.build(path / format!("norm_{}", index), out_c)
                };
                layers.push((conv, norm));
                Ok((layers, out_c))
            },
        )?;
        let conv_out = Conv2DInit {
            spectral_norm,
            ..Conv2DInit::new(1)
        }
        .build(path / "conv_out", last_c, 1)?;

        Ok(PatchDiscriminator { layers, conv_out })
    }
}

/// Fully convolutional critic emitting a (N, 1, H', W') logit map.
#[derive(Debug)]
pub struct PatchDiscriminator {
    layers: Vec<(Conv2D, Norm)>,
    conv_out: Conv2D,
}

impl nn::ModuleT for PatchDiscriminator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let xs = self.layers.iter().fold(xs.shallow_clone(), |xs, (conv, norm)| {
            leaky_relu(&norm.forward(&conv.forward_t(&xs, train)), 0.2)
        });
        self.conv_out.forward_t(&xs, train)
    }
}

#[derive(Debug, Clone)]
pub struct ContentDiscriminatorInit {
    pub content_channels: usize,
}

impl ContentDiscriminatorInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<ContentDiscriminator> {
        let path = path.borrow();
        let Self { content_channels } = self;

        let layers: Vec<_> = (0..CONTENT_LAYERS)
            .map(|index| -> Result<_> {
                let conv = Conv2DInit {
                    stride: 2,
                    padding: 1,
                    ..Conv2DInit::new(3)
                }
                .build(
                    path / format!("conv_{}", index),
                    content_channels,
                    content_channels,
                )?;
                let norm =
                    NormKind::InstanceNorm.build(path / format!("norm_{}", index), content_channels);
                Ok((conv, norm))
            })
            .try_collect()?;
        let conv_out = Conv2DInit::new(1).build(path / "conv_out", content_channels, 1)?;

        Ok(ContentDiscriminator { layers, conv_out })
    }
}

/// Classifies content codes as coming from domain A (0) or domain B (1).
#[derive(Debug)]
pub struct ContentDiscriminator {
    layers: Vec<(Conv2D, Norm)>,
    conv_out: Conv2D,
}

impl ContentDiscriminator {
    /// Returns one logit per sample.
    pub fn forward_t(&self, z_content: &Tensor, train: bool) -> DisOutput {
        let xs = self
            .layers
            .iter()
            .fold(z_content.shallow_clone(), |xs, (conv, norm)| {
                leaky_relu(&norm.forward(&conv.forward_t(&xs, train)), 0.2)
            });
        let xs = self.conv_out.forward_t(&xs, train);
        let xs = xs.adaptive_avg_pool2d(&[1, 1]).view([-1]);
        DisOutput::Single(xs)
    }
}
