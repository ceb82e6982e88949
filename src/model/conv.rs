use crate::common::*;

#[derive(Debug, Clone)]
pub struct Conv2DInit {
    pub ksize: usize,
    pub stride: usize,
    pub padding: usize,
    pub output_padding: usize,
    pub transposed: bool,
    pub bias: bool,
    pub spectral_norm: bool,
    pub ws_init: nn::Init,
    pub bs_init: nn::Init,
}

impl Conv2DInit {
    pub fn new(ksize: usize) -> Self {
        Self {
            ksize,
            stride: 1,
            padding: ksize / 2,
            output_padding: 0,
            transposed: false,
            bias: true,
            spectral_norm: false,
            ws_init: nn::Init::KaimingUniform,
            bs_init: nn::Init::Const(0.0),
        }
    }

    pub fn build<'a>(
        self,
        path: impl Borrow<nn::Path<'a>>,
        in_dim: usize,
        out_dim: usize,
    ) -> Result<Conv2D> {
        let Self {
            ksize,
            stride,
            padding,
            output_padding,
            transposed,
            bias,
            spectral_norm,
            ws_init,
            bs_init,
        } = self;

        ensure!(ksize > 0 && stride > 0, "ksize and stride must be positive");
        ensure!(
            transposed || output_padding == 0,
            "output_padding is only allowed for transposed convolution"
        );

        let path = path.borrow();
        let in_dim = in_dim as i64;
        let out_dim = out_dim as i64;
        let ksize = ksize as i64;

        let bs = bias.then(|| path.var("bias", &[out_dim], bs_init));
        let ws = {
            let weight_size = if transposed {
                [in_dim, out_dim, ksize, ksize]
            } else {
                [out_dim, in_dim, ksize, ksize]
            };
            path.var("weight", &weight_size, ws_init)
        };
        let sn_u = spectral_norm.then(|| path.ones_no_train("sn_u", &[weight_size_rows(&ws)]));

        Ok(Conv2D {
            stride: vec![stride as i64; 2],
            padding: vec![padding as i64; 2],
            output_padding: vec![output_padding as i64; 2],
            transposed,
            weight: ws,
            bias: bs,
            sn_u,
        })
    }
}

#[derive(Debug)]
pub struct Conv2D {
    stride: Vec<i64>,
    padding: Vec<i64>,
    output_padding: Vec<i64>,
    transposed: bool,
    weight: Tensor,
    bias: Option<Tensor>,
    sn_u: Option<Tensor>,
}

impl nn::ModuleT for Conv2D {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        let Self {
            ref stride,
            ref padding,
            ref output_padding,
            transposed,
            ref weight,
            ref bias,
            ref sn_u,
        } = *self;

        let weight = match sn_u {
            Some(sn_u) => spectral_normalize(weight, sn_u, train),
            None => weight.shallow_clone(),
        };

        input.convolution(
            &weight,
            bias.as_ref(),
            stride,
            padding,
            &[1, 1], // dilation
            transposed,
            output_padding,
            1, // groups
        )
    }
}

fn weight_size_rows(weight: &Tensor) -> i64 {
    weight.size()[0]
}

fn l2_normalize(xs: &Tensor) -> Tensor {
    xs / (xs.norm() + 1e-12)
}

/// Divides the weight by its largest singular value, estimated with one power
/// iteration. The iteration vector is updated in place only in training mode.
fn spectral_normalize(weight: &Tensor, sn_u: &Tensor, train: bool) -> Tensor {
    let rows = weight_size_rows(weight);
    let weight_mat = weight.view([rows, -1]);

    let (u, v) = tch::no_grad(|| {
        let weight_mat = weight_mat.detach();
        let u = l2_normalize(sn_u);
        let v = l2_normalize(&weight_mat.tr().mv(&u));
        let u = if train {
            let u = l2_normalize(&weight_mat.mv(&v));
            let mut buffer = sn_u.shallow_clone();
            let _ = buffer.copy_(&u);
            u
        } else {
            u
        };
        (u, v)
    });

    let sigma = u.dot(&weight_mat.mv(&v));
    weight / sigma
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_output_shape_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();

        let down = Conv2DInit {
            stride: 2,
            padding: 1,
            ..Conv2DInit::new(4)
        }
        .build(&root / "conv_down", 3, 8)?;
        let up = Conv2DInit {
            stride: 2,
            padding: 1,
            output_padding: 1,
            transposed: true,
            ..Conv2DInit::new(3)
        }
        .build(&root / "conv_up", 8, 3)?;

        let input = Tensor::rand(&[2, 3, 8, 8], FLOAT_CPU);
        let hidden = down.forward_t(&input, true);
        ensure!(hidden.size() == vec![2, 8, 4, 4]);
        let output = up.forward_t(&hidden, true);
        ensure!(output.size() == vec![2, 3, 8, 8]);
        Ok(())
    }

    #[test]
    fn spectral_norm_bounds_singular_value_test() -> Result<()> {
        tch::manual_seed(1);
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();

        let conv = Conv2DInit {
            spectral_norm: true,
            ws_init: nn::Init::Randn {
                mean: 0.0,
                stdev: 5.0,
            },
            ..Conv2DInit::new(3)
        }
        .build(&root / "conv", 4, 6)?;

        // power iteration converges after repeated training passes
        let input = Tensor::rand(&[1, 4, 5, 5], FLOAT_CPU);
        for _ in 0..50 {
            let _ = conv.forward_t(&input, true);
        }

        let normalized = spectral_normalize(&conv.weight, conv.sn_u.as_ref().unwrap(), false);
        let sigma = normalized
            .view([6, -1])
            .svd(true, false)
            .1
            .max()
            .double_value(&[]);
        ensure!((sigma - 1.0).abs() < 1e-2, "sigma = {}", sigma);

        ensure!(!conv.sn_u.as_ref().unwrap().requires_grad());
        Ok(())
    }
}
