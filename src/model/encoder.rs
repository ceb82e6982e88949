use super::{
    conv::{Conv2D, Conv2DInit},
    leaky_relu,
    norm::{Norm, NormKind},
    resnet_block::{ResnetBlock, ResnetBlockInit},
};
use crate::common::*;

/// Width of the attribute code.
pub const NZ: usize = 8;

const CONTENT_RES_BLOCKS: usize = 3;
const ATTR_DOWN_SAMPLES: usize = 4;

#[derive(Debug, Clone)]
pub struct ContentEncoderInit {
    pub input_dim_a: usize,
    pub input_dim_b: usize,
    pub base_channels: usize,
}

impl ContentEncoderInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<ContentEncoder> {
        let path = path.borrow();
        let Self {
            input_dim_a,
            input_dim_b,
            base_channels,
        } = self;
        let out_c = base_channels * 4;

        let stem_a = ContentStem::new(path / "stem_a", input_dim_a, base_channels)?;
        let stem_b = ContentStem::new(path / "stem_b", input_dim_b, base_channels)?;
        let share = ResnetBlockInit::default().build(path / "share", out_c)?;

        Ok(ContentEncoder {
            stem_a,
            stem_b,
            share,
            out_c,
        })
    }
}

/// Maps images of either domain into the shared content space.
///
/// Each domain owns its down-sampling stem while the last residual block is
/// shared, so that both domains land in one embedding space.
#[derive(Debug)]
pub struct ContentEncoder {
    stem_a: ContentStem,
    stem_b: ContentStem,
    share: ResnetBlock,
    out_c: usize,
}

impl ContentEncoder {
    pub fn out_channels(&self) -> usize {
        self.out_c
    }

    pub fn forward_a(&self, image_a: &Tensor, train: bool) -> Tensor {
        self.forward_share(&self.stem_a.forward_t(image_a, train), train)
    }

    pub fn forward_b(&self, image_b: &Tensor, train: bool) -> Tensor {
        self.forward_share(&self.stem_b.forward_t(image_b, train), train)
    }

    pub fn forward(&self, image_a: &Tensor, image_b: &Tensor, train: bool) -> (Tensor, Tensor) {
        (self.forward_a(image_a, train), self.forward_b(image_b, train))
    }

    fn forward_share(&self, xs: &Tensor, train: bool) -> Tensor {
        let xs = self.share.forward_t(xs, train);
        if train {
            // gaussian noise regularizes the content space
            &xs + xs.randn_like()
        } else {
            xs
        }
    }
}

#[derive(Debug)]
struct ContentStem {
    conv_in: Conv2D,
    downs: Vec<(Conv2D, Norm)>,
    blocks: Vec<ResnetBlock>,
}

impl ContentStem {
    fn new<'a>(path: impl Borrow<nn::Path<'a>>, in_c: usize, base_c: usize) -> Result<Self> {
        let path = path.borrow();

        let conv_in = Conv2DInit::new(7).build(path / "conv_in", in_c, base_c)?;
        let downs: Vec<_> = [(base_c, base_c * 2), (base_c * 2, base_c * 4)]
            .into_iter()
            .enumerate()
            .map(|(index, (in_c, out_c))| -> Result<_> {
                let conv = Conv2DInit {
                    stride: 2,
                    padding: 1,
                    ..Conv2DInit::new(4)
                }
                .build(path / format!("conv_down_{}", index), in_c, out_c)?;
                let norm = NormKind::InstanceNorm.build(path / format!("norm_down_{}", index), out_c);
                Ok((conv, norm))
            })
            .try_collect()?;
        let blocks: Vec<_> = (0..CONTENT_RES_BLOCKS)
            .map(|index| {
                ResnetBlockInit::default().build(path / format!("block_{}", index), base_c * 4)
            })
            .try_collect()?;

        Ok(Self {
            conv_in,
            downs,
            blocks,
        })
    }
}

impl nn::ModuleT for ContentStem {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let xs = leaky_relu(&self.conv_in.forward_t(xs, train), 0.2);
        let xs = self.downs.iter().fold(xs, |xs, (conv, norm)| {
            norm.forward(&conv.forward_t(&xs, train)).relu()
        });
        self.blocks
            .iter()
            .fold(xs, |xs, block| block.forward_t(&xs, train))
    }
}

/// Down-sampling trunk shared in shape by both attribute encoder variants.
#[derive(Debug)]
pub struct AttrTrunk {
    conv_in: Conv2D,
    downs: Vec<Conv2D>,
    out_c: usize,
}

impl AttrTrunk {
    fn new<'a>(path: impl Borrow<nn::Path<'a>>, in_c: usize, base_c: usize) -> Result<Self> {
        let path = path.borrow();
        let max_c = base_c * 4;

        let conv_in = Conv2DInit::new(7).build(path / "conv_in", in_c, base_c)?;
        let (downs, out_c) = (0..ATTR_DOWN_SAMPLES).try_fold(
            (vec![], base_c),
            |(mut downs, in_c), index| -> Result<_> {
                let out_c = (in_c * 2).min(max_c);
                let conv = Conv2DInit {
                    stride: 2,
                    padding: 1,
                    ..Conv2DInit::new(3)
                }
                .build(path / format!("conv_down_{}", index), in_c, out_c)?;
                downs.push(conv);
                Ok((downs, out_c))
            },
        )?;

        Ok(Self {
            conv_in,
            downs,
            out_c,
        })
    }

    /// Returns pooled features of shape (N, C).
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let xs = leaky_relu(&self.conv_in.forward_t(xs, train), 0.2);
        let xs = self
            .downs
            .iter()
            .fold(xs, |xs, conv| leaky_relu(&conv.forward_t(&xs, train), 0.2));
        let xs = xs.adaptive_avg_pool2d(&[1, 1]);
        xs.view([-1, self.out_c as i64])
    }
}

#[derive(Debug, Clone)]
pub struct AttributeEncoderInit {
    pub input_dim_a: usize,
    pub input_dim_b: usize,
    pub base_channels: usize,
    /// Emit a Gaussian (mu, logvar) pair per domain instead of a direct code.
    pub concat: bool,
}

impl AttributeEncoderInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<AttributeEncoder> {
        let path = path.borrow();
        let Self {
            input_dim_a,
            input_dim_b,
            base_channels,
            concat,
        } = self;
        let nz = NZ as i64;

        let trunk_a = AttrTrunk::new(path / "trunk_a", input_dim_a, base_channels)?;
        let trunk_b = AttrTrunk::new(path / "trunk_b", input_dim_b, base_channels)?;
        let feat_c = trunk_a.out_c as i64;

        let encoder = if concat {
            let head = |name: &str| nn::linear(path / name, feat_c, nz, Default::default());
            AttributeEncoder::Gaussian {
                trunk_a,
                trunk_b,
                fc_mu_a: head("fc_mu_a"),
                fc_logvar_a: head("fc_logvar_a"),
                fc_mu_b: head("fc_mu_b"),
                fc_logvar_b: head("fc_logvar_b"),
            }
        } else {
            let head_a = Conv2DInit::new(1).build(path / "conv_out_a", trunk_a.out_c, NZ)?;
            let head_b = Conv2DInit::new(1).build(path / "conv_out_b", trunk_b.out_c, NZ)?;
            AttributeEncoder::Direct {
                trunk_a,
                trunk_b,
                head_a,
                head_b,
            }
        };

        Ok(encoder)
    }
}

/// Raw output of the attribute encoder, before any sampling.
#[derive(Debug)]
pub enum AttrOutput {
    Direct {
        z_attr_a: Tensor,
        z_attr_b: Tensor,
    },
    Gaussian {
        mu_a: Tensor,
        logvar_a: Tensor,
        mu_b: Tensor,
        logvar_b: Tensor,
    },
}

#[derive(Debug)]
pub enum AttributeEncoder {
    Direct {
        trunk_a: AttrTrunk,
        trunk_b: AttrTrunk,
        head_a: Conv2D,
        head_b: Conv2D,
    },
    Gaussian {
        trunk_a: AttrTrunk,
        trunk_b: AttrTrunk,
        fc_mu_a: nn::Linear,
        fc_logvar_a: nn::Linear,
        fc_mu_b: nn::Linear,
        fc_logvar_b: nn::Linear,
    },
}

impl AttributeEncoder {
    pub fn forward(&self, image_a: &Tensor, image_b: &Tensor, train: bool) -> AttrOutput {
        match self {
            Self::Direct {
                trunk_a,
                trunk_b,
                head_a,
                head_b,
            } => {
                let nz = NZ as i64;
                let project = |trunk: &AttrTrunk, head: &Conv2D, xs: &Tensor| {
                    let feat = trunk.forward_t(xs, train);
                    let feat = feat.view([-1, trunk.out_c as i64, 1, 1]);
                    head.forward_t(&feat, train).view([-1, nz])
                };
                AttrOutput::Direct {
                    z_attr_a: project(trunk_a, head_a, image_a),
                    z_attr_b: project(trunk_b, head_b, image_b),
                }
            }
            Self::Gaussian {
                trunk_a,
                trunk_b,
                fc_mu_a,
                fc_logvar_a,
                fc_mu_b,
                fc_logvar_b,
            } => {
                let feat_a = trunk_a.forward_t(image_a, train);
                let feat_b = trunk_b.forward_t(image_b, train);
                AttrOutput::Gaussian {
                    mu_a: fc_mu_a.forward(&feat_a),
                    logvar_a: fc_logvar_a.forward(&feat_a),
                    mu_b: fc_mu_b.forward(&feat_b),
                    logvar_b: fc_logvar_b.forward(&feat_b),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_encoder_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let encoder = ContentEncoderInit {
            input_dim_a: 3,
            input_dim_b: 1,
            base_channels: 4,
        }
        .build(&root / "enc_c")?;

        let image_a = Tensor::rand(&[2, 3, 16, 16], FLOAT_CPU);
        let image_b = Tensor::rand(&[2, 1, 16, 16], FLOAT_CPU);
        let (z_a, z_b) = encoder.forward(&image_a, &image_b, false);
        ensure!(z_a.size() == vec![2, 16, 4, 4]);
        ensure!(z_b.size() == vec![2, 16, 4, 4]);
        ensure!(encoder.out_channels() == 16);
        Ok(())
    }

    #[test]
    fn attribute_encoder_variants_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let image_a = Tensor::rand(&[3, 3, 4, 4], FLOAT_CPU);
        let image_b = Tensor::rand(&[3, 3, 4, 4], FLOAT_CPU);

        let direct = AttributeEncoderInit {
            input_dim_a: 3,
            input_dim_b: 3,
            base_channels: 4,
            concat: false,
        }
        .build(&root / "direct")?;
        match direct.forward(&image_a, &image_b, true) {
            AttrOutput::Direct { z_attr_a, z_attr_b } => {
                ensure!(z_attr_a.size() == vec![3, NZ as i64]);
                ensure!(z_attr_b.size() == vec![3, NZ as i64]);
            }
            AttrOutput::Gaussian { .. } => bail!("expect direct output"),
        }

        let gaussian = AttributeEncoderInit {
            input_dim_a: 3,
            input_dim_b: 3,
            base_channels: 4,
            concat: true,
        }
        .build(&root / "gaussian")?;
        match gaussian.forward(&image_a, &image_b, true) {
            AttrOutput::Gaussian {
                mu_a,
                logvar_a,
                mu_b,
                logvar_b,
            } => {
                for xs in [&mu_a, &logvar_a, &mu_b, &logvar_b] {
                    ensure!(xs.size() == vec![3, NZ as i64]);
                    ensure!(bool::from(xs.isfinite().all()));
                }
            }
            AttrOutput::Direct { .. } => bail!("expect gaussian output"),
        }
        Ok(())
    }
}
