use super::{
    conv::{Conv2D, Conv2DInit},
    encoder::NZ,
    norm::{Norm, NormKind},
};
use crate::common::*;

const STYLE_BLOCKS: usize = 3;
const MLP_CHANNELS: i64 = 256;

#[derive(Debug, Clone)]
pub struct GeneratorInit {
    pub input_dim_a: usize,
    pub input_dim_b: usize,
    pub content_channels: usize,
    /// Concatenate the raw attribute code at every stage instead of mapping
    /// it through an MLP into per-block style vectors.
    pub concat: bool,
}

impl GeneratorInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<Generator> {
        let path = path.borrow();
        let Self {
            input_dim_a,
            input_dim_b,
            content_channels,
            concat,
        } = self;
        ensure!(
            content_channels >= 4 && content_channels % 4 == 0,
            "content_channels must be a positive multiple of 4, but get {}",
            content_channels
        );

        let dec_a = Decoder::new(path / "dec_a", content_channels, input_dim_a, concat)?;
        let dec_b = Decoder::new(path / "dec_b", content_channels, input_dim_b, concat)?;

        Ok(Generator { dec_a, dec_b })
    }
}

/// Synthesizes images of either domain from a (content, attribute) pair.
#[derive(Debug)]
pub struct Generator {
    dec_a: Decoder,
    dec_b: Decoder,
}

impl Generator {
    pub fn forward_a(&self, z_content: &Tensor, z_attr: &Tensor, train: bool) -> Tensor {
        self.dec_a.forward_t(z_content, z_attr, train)
    }

    pub fn forward_b(&self, z_content: &Tensor, z_attr: &Tensor, train: bool) -> Tensor {
        self.dec_b.forward_t(z_content, z_attr, train)
    }
}

#[derive(Debug)]
enum StyleMapping {
    Mlp {
        fc1: nn::Linear,
        fc2: nn::Linear,
        fc3: nn::Linear,
        style_c: i64,
    },
    Concat,
}

#[derive(Debug)]
struct Decoder {
    mapping: StyleMapping,
    blocks: Vec<StyleResBlock>,
    ups: Vec<(Conv2D, Norm)>,
    conv_out: Conv2D,
}

impl Decoder {
    fn new<'a>(
        path: impl Borrow<nn::Path<'a>>,
        content_c: usize,
        out_c: usize,
        concat: bool,
    ) -> Result<Self> {
        let path = path.borrow();

        let (mapping, style_c) = if concat {
            (StyleMapping::Concat, NZ)
        } else {
            let style_c = content_c;
            let fc1 = nn::linear(path / "fc1", NZ as i64, MLP_CHANNELS, Default::default());
            let fc2 = nn::linear(path / "fc2", MLP_CHANNELS, MLP_CHANNELS, Default::default());
            let fc3 = nn::linear(
                path / "fc3",
                MLP_CHANNELS,
                (style_c * STYLE_BLOCKS) as i64,
                Default::default(),
            );
            let mapping = StyleMapping::Mlp {
                fc1,
                fc2,
                fc3,
                style_c: style_c as i64,
            };
            (mapping, style_c)
        };

        let blocks: Vec<_> = (0..STYLE_BLOCKS)
            .map(|index| StyleResBlock::new(path / format!("block_{}", index), content_c, style_c))
            .try_collect()?;

        // the raw code is re-injected before every up-sampling stage in concat mode
        let extra_c = if concat { NZ } else { 0 };
        let ups: Vec<_> = [(content_c, content_c / 2), (content_c / 2, content_c / 4)]
            .into_iter()
            .enumerate()
            .map(|(index, (in_c, up_c))| -> Result<_> {
                let conv = Conv2DInit {
                    stride: 2,
                    padding: 1,
                    output_padding: 1,
                    transposed: true,
                    ..Conv2DInit::new(3)
                }
                .build(path / format!("conv_up_{}", index), in_c + extra_c, up_c)?;
                let norm = NormKind::InstanceNorm.build(path / format!("norm_up_{}", index), up_c);
                Ok((conv, norm))
            })
            .try_collect()?;
        let conv_out = Conv2DInit::new(1).build(path / "conv_out", content_c / 4, out_c)?;

        Ok(Self {
            mapping,
            blocks,
            ups,
            conv_out,
        })
    }

    fn forward_t(&self, z_content: &Tensor, z_attr: &Tensor, train: bool) -> Tensor {
        let Self {
            ref mapping,
            ref blocks,
            ref ups,
            ref conv_out,
        } = *self;

        let (xs, concat) = match mapping {
            StyleMapping::Mlp {
                fc1,
                fc2,
                fc3,
                style_c,
            } => {
                let styles = fc3
                    .forward(&fc2.forward(&fc1.forward(z_attr).relu()).relu())
                    .split(*style_c, 1);
                let xs = izip!(blocks, &styles).fold(z_content.shallow_clone(), |xs, (block, style)| {
                    block.forward_t(&xs, style, train)
                });
                (xs, false)
            }
            StyleMapping::Concat => {
                let xs = blocks.iter().fold(z_content.shallow_clone(), |xs, block| {
                    block.forward_t(&xs, z_attr, train)
                });
                (xs, true)
            }
        };

        let xs = ups.iter().fold(xs, |xs, (conv, norm)| {
            let xs = if concat {
                Tensor::cat(&[&xs, &tile(z_attr, &xs)], 1)
            } else {
                xs
            };
            norm.forward(&conv.forward_t(&xs, train)).relu()
        });

        conv_out.forward_t(&xs, train).tanh()
    }
}

/// Residual block conditioned on a style vector concatenated to its inputs.
#[derive(Debug)]
struct StyleResBlock {
    conv1: Conv2D,
    norm1: Norm,
    conv2: Conv2D,
    norm2: Norm,
}

impl StyleResBlock {
    fn new<'a>(path: impl Borrow<nn::Path<'a>>, channels: usize, style_c: usize) -> Result<Self> {
        let path = path.borrow();
        Ok(Self {
            conv1: Conv2DInit::new(3).build(path / "conv1", channels + style_c, channels)?,
            norm1: NormKind::InstanceNorm.build(path / "norm1", channels),
            conv2: Conv2DInit::new(3).build(path / "conv2", channels + style_c, channels)?,
            norm2: NormKind::InstanceNorm.build(path / "norm2", channels),
        })
    }

    fn forward_t(&self, xs: &Tensor, style: &Tensor, train: bool) -> Tensor {
        let Self {
            conv1,
            norm1,
            conv2,
            norm2,
        } = self;

        let ys = Tensor::cat(&[xs, &tile(style, xs)], 1);
        let ys = norm1.forward(&conv1.forward_t(&ys, train)).relu();
        let ys = Tensor::cat(&[&ys, &tile(style, &ys)], 1);
        let ys = norm2.forward(&conv2.forward_t(&ys, train));
        xs + ys
    }
}

/// Expands a (N, C) code to (N, C, H, W) matching the spatial size of `like`.
fn tile(code: &Tensor, like: &Tensor) -> Tensor {
    let size = like.size();
    let (b, h, w) = (size[0], size[2], size[3]);
    let c = code.size()[1];
    code.view([b, c, 1, 1]).expand(&[b, c, h, w], false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_test() -> Result<()> {
        for concat in [false, true] {
            let vs = nn::VarStore::new(Device::Cpu);
            let root = vs.root();
            let generator = GeneratorInit {
                input_dim_a: 3,
                input_dim_b: 1,
                content_channels: 16,
                concat,
            }
            .build(&root / "gen")?;

            let content = Tensor::rand(&[2, 16, 2, 2], FLOAT_CPU);
            let z_attr = Tensor::randn(&[2, NZ as i64], FLOAT_CPU);

            let fake_a = generator.forward_a(&content, &z_attr, true);
            let fake_b = generator.forward_b(&content, &z_attr, true);
            ensure!(fake_a.size() == vec![2, 3, 8, 8]);
            ensure!(fake_b.size() == vec![2, 1, 8, 8]);
            ensure!(fake_a.abs().max().double_value(&[]) <= 1.0);
        }
        Ok(())
    }
}
