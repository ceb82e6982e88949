use crate::{common::*, config::LrPolicy};

#[derive(Debug, Clone)]
pub struct AdamInit {
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamInit {
    fn default() -> Self {
        Self {
            beta1: 0.5,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 1e-4,
        }
    }
}

impl AdamInit {
    pub fn build(self, vs: &nn::VarStore, lr: f64) -> Result<Adam> {
        let Self {
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self;
        ensure!(lr > 0.0, "learning rate must be positive, but get {}", lr);
        ensure!(
            (0.0..1.0).contains(&beta1) && (0.0..1.0).contains(&beta2),
            "betas must lie in [0, 1)"
        );

        let params: Vec<_> = vs
            .variables()
            .into_iter()
            .filter(|(_, var)| var.requires_grad())
            .sorted_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs))
            .map(|(name, var)| {
                let exp_avg = var.zeros_like();
                let exp_avg_sq = var.zeros_like();
                AdamParam {
                    name,
                    var,
                    exp_avg,
                    exp_avg_sq,
                }
            })
            .collect();

        Ok(Adam {
            params,
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
            step: 0,
        })
    }
}

#[derive(Debug)]
struct AdamParam {
    name: String,
    var: Tensor,
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

/// Adam with L2 weight decay whose moment buffers and step counter can be
/// inspected and persisted.
#[derive(Debug)]
pub struct Adam {
    params: Vec<AdamParam>,
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    step: i64,
}

impl Adam {
    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    /// Number of completed optimization steps.
    pub fn step_count(&self) -> i64 {
        self.step
    }

    pub fn zero_grad(&mut self) {
        self.params.iter().for_each(|param| {
            let mut grad = param.var.grad();
            if grad.defined() {
                let _ = grad.detach_();
                let _ = grad.zero_();
            }
        });
    }

    pub fn step(&mut self) {
        let Self {
            ref mut params,
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
            ref mut step,
        } = *self;

        *step += 1;
        let bias_correction1 = 1.0 - beta1.powi(*step as i32);
        let bias_correction2 = 1.0 - beta2.powi(*step as i32);
        let step_size = lr / bias_correction1;

        tch::no_grad(|| {
            params.iter_mut().for_each(|param| {
                let AdamParam {
                    var,
                    exp_avg,
                    exp_avg_sq,
                    ..
                } = param;

                let grad = var.grad();
                if !grad.defined() {
                    return;
                }
                let grad = if weight_decay != 0.0 {
                    &grad + &*var * weight_decay
                } else {
                    grad
                };

                let new_exp_avg = &*exp_avg * beta1 + &grad * (1.0 - beta1);
                let new_exp_avg_sq = &*exp_avg_sq * beta2 + grad.square() * (1.0 - beta2);
                let _ = exp_avg.copy_(&new_exp_avg);
                let _ = exp_avg_sq.copy_(&new_exp_avg_sq);

                let denom = exp_avg_sq.sqrt() / bias_correction2.sqrt() + eps;
                let new_var = &*var - &*exp_avg / denom * step_size;
                let _ = var.copy_(&new_var);
            });
        });
    }

    /// Rescales gradients so that their joint L2 norm does not exceed
    /// `max_norm`. Returns the norm before clipping.
    pub fn clip_grad_norm(&mut self, max_norm: f64) -> f64 {
        tch::no_grad(|| {
            let grads: Vec<_> = self
                .params
                .iter()
                .map(|param| param.var.grad())
                .filter(|grad| grad.defined())
                .collect();

            let total_norm = grads
                .iter()
                .map(|grad| grad.square().sum(Kind::Double).double_value(&[]))
                .sum::<f64>()
                .sqrt();

            let clip_coef = max_norm / (total_norm + 1e-6);
            if clip_coef < 1.0 {
                grads.into_iter().for_each(|mut grad| {
                    let scaled = &grad * clip_coef;
                    let _ = grad.copy_(&scaled);
                });
            }

            total_norm
        })
    }

    /// Flattens the optimizer state into named tensors.
    pub fn state_tensors(&self) -> Vec<(String, Tensor)> {
        let scalars = [
            ("step".to_string(), Tensor::from(self.step)),
            ("lr".to_string(), Tensor::from(self.lr)),
        ];
        let buffers = self.params.iter().flat_map(|param| {
            [
                (
                    format!("exp_avg.{}", param.name),
                    param.exp_avg.shallow_clone(),
                ),
                (
                    format!("exp_avg_sq.{}", param.name),
                    param.exp_avg_sq.shallow_clone(),
                ),
            ]
        });
        scalars.into_iter().chain(buffers).collect()
    }

    /// Restores the state written by [`Adam::state_tensors`]. Every expected key
    /// must be provided by `lookup`.
    pub fn load_state_tensors<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Result<Tensor>,
    {
        let step = lookup("step")?.int64_value(&[]);
        let lr = lookup("lr")?.double_value(&[]);
        ensure!(step >= 0, "invalid optimizer step {}", step);

        for param in &mut self.params {
            let AdamParam {
                name,
                exp_avg,
                exp_avg_sq,
                ..
            } = param;

            for (prefix, buffer) in [("exp_avg", exp_avg), ("exp_avg_sq", exp_avg_sq)] {
                let src = lookup(&format!("{}.{}", prefix, name))?;
                ensure!(
                    src.size() == buffer.size(),
                    "shape mismatch for {}.{}: expect {:?}, but get {:?}",
                    prefix,
                    name,
                    buffer.size(),
                    src.size()
                );
                tch::no_grad(|| buffer.f_copy_(&src))?;
            }
        }

        self.step = step;
        self.lr = lr;
        Ok(())
    }
}

/// Per-epoch learning-rate multiplier.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    policy: LrPolicy,
    n_ep: usize,
    n_ep_decay: Option<usize>,
    epoch: usize,
}

impl LrScheduler {
    pub fn new(policy: LrPolicy, n_ep: usize, n_ep_decay: Option<usize>, last_ep: usize) -> Self {
        Self {
            policy,
            n_ep,
            n_ep_decay,
            epoch: last_ep,
        }
    }

    pub fn factor(&self) -> f64 {
        let Self {
            policy,
            n_ep,
            n_ep_decay,
            epoch,
        } = *self;

        let n_ep_decay = match n_ep_decay {
            Some(n_ep_decay) => n_ep_decay,
            None => return 1.0,
        };

        match policy {
            LrPolicy::Lambda => {
                let elapsed = epoch.saturating_sub(n_ep_decay) as f64;
                let span = (n_ep.saturating_sub(n_ep_decay) + 1) as f64;
                (1.0 - elapsed / span).max(0.0)
            }
            LrPolicy::Step => {
                if n_ep_decay == 0 {
                    return 1.0;
                }
                0.1f64.powi((epoch / n_ep_decay) as i32)
            }
        }
    }

    /// Advances one epoch and returns the new multiplier.
    pub fn step(&mut self) -> f64 {
        self.epoch += 1;
        self.factor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::abs_diff_eq;

    fn quadratic_fixture() -> (nn::VarStore, Tensor) {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let xs = root.var("xs", &[4], nn::Init::Const(1.0));
        let _ = root.zeros_no_train("buffer", &[4]);
        (vs, xs)
    }

    fn backward_step(opt: &mut Adam, loss: &Tensor) {
        opt.zero_grad();
        loss.backward();
        opt.step();
    }

    #[test]
    fn adam_matches_reference_update_test() -> Result<()> {
        let (vs, xs) = quadratic_fixture();
        let mut opt = AdamInit {
            weight_decay: 0.0,
            ..Default::default()
        }
        .build(&vs, 0.1)?;
        ensure!(opt.state_tensors().len() == 4, "non-trainable buffers are ignored");

        // the first Adam step moves every coordinate by lr regardless of the gradient scale
        let loss = xs.square().sum(Kind::Float);
        backward_step(&mut opt, &loss);

        ensure!(opt.step_count() == 1);
        let value = xs.double_value(&[0]);
        ensure!(abs_diff_eq!(value, 0.9, epsilon = 1e-5), "value = {}", value);
        Ok(())
    }

    #[test]
    fn zero_grad_test() -> Result<()> {
        let (vs, xs) = quadratic_fixture();
        let mut opt = AdamInit::default().build(&vs, 0.1)?;

        xs.square().sum(Kind::Float).backward();
        ensure!(xs.grad().abs().sum(Kind::Float).double_value(&[]) > 0.0);
        opt.zero_grad();
        ensure!(xs.grad().abs().sum(Kind::Float).double_value(&[]) == 0.0);
        Ok(())
    }

    #[test]
    fn clip_grad_norm_test() -> Result<()> {
        let (vs, xs) = quadratic_fixture();
        let mut opt = AdamInit::default().build(&vs, 0.1)?;

        // gradient = 200 * xs, norm = 400
        (xs.square().sum(Kind::Float) * 100.0).backward();
        let norm = opt.clip_grad_norm(5.0);
        ensure!(abs_diff_eq!(norm, 400.0, epsilon = 1e-3));

        let clipped = xs.grad().square().sum(Kind::Double).sqrt().double_value(&[]);
        ensure!(abs_diff_eq!(clipped, 5.0, epsilon = 1e-3), "clipped = {}", clipped);

        // gradients within the bound are untouched
        opt.zero_grad();
        xs.sum(Kind::Float).backward();
        opt.clip_grad_norm(5.0);
        ensure!(xs.grad().equal(&xs.ones_like()));
        Ok(())
    }

    #[test]
    fn state_round_trip_test() -> Result<()> {
        let (vs, xs) = quadratic_fixture();
        let mut opt = AdamInit::default().build(&vs, 0.1)?;
        backward_step(&mut opt, &xs.square().sum(Kind::Float));
        backward_step(&mut opt, &xs.square().sum(Kind::Float));

        let saved: HashMap<_, _> = opt
            .state_tensors()
            .into_iter()
            .map(|(name, tensor)| (name, tensor.copy()))
            .collect();

        let (other_vs, _) = quadratic_fixture();
        let mut other = AdamInit::default().build(&other_vs, 0.5)?;
        other.load_state_tensors(|key| {
            saved
                .get(key)
                .map(|tensor| tensor.shallow_clone())
                .ok_or_else(|| format_err!("missing key {}", key))
        })?;

        ensure!(other.step_count() == 2);
        ensure!(other.lr() == 0.1);
        for (name, tensor) in other.state_tensors() {
            ensure!(tensor.equal(&saved[&name]), "{} differs", name);
        }

        let missing = other.load_state_tensors(|key| bail!("missing key {}", key));
        ensure!(missing.is_err());
        Ok(())
    }

    #[test]
    fn lambda_schedule_test() {
        let mut scheduler = LrScheduler::new(LrPolicy::Lambda, 10, Some(5), 0);
        let factors: Vec<_> = (0..10).map(|_| scheduler.step()).collect();
        assert_eq!(&factors[0..5], &[1.0; 5]);
        assert!(abs_diff_eq!(factors[5], 1.0 - 1.0 / 6.0, epsilon = 1e-12));
        assert!(abs_diff_eq!(factors[9], 1.0 - 5.0 / 6.0, epsilon = 1e-12));

        let resumed = LrScheduler::new(LrPolicy::Lambda, 10, Some(5), 8);
        assert!(abs_diff_eq!(resumed.factor(), 1.0 - 3.0 / 6.0, epsilon = 1e-12));
    }

    #[test]
    fn step_schedule_test() {
        let mut scheduler = LrScheduler::new(LrPolicy::Step, 10, Some(3), 0);
        let factors: Vec<_> = (0..6).map(|_| scheduler.step()).collect();
        let expect = [1.0, 1.0, 0.1, 0.1, 0.1, 0.01];
        for (factor, expect) in izip!(factors, expect) {
            assert!(abs_diff_eq!(factor, expect, epsilon = 1e-12));
        }

        let constant = LrScheduler::new(LrPolicy::Step, 10, None, 7);
        assert_eq!(constant.factor(), 1.0);
    }
}
