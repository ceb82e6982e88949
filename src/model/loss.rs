use super::discriminator::DisOutput;
use crate::common::*;

/// Guards both divisions of the mode-seeking ratio.
pub const MODE_SEEKING_EPS: f64 = 1e-5;

fn bce_with_target(logits: &Tensor, target: &Tensor) -> Tensor {
    logits
        .sigmoid()
        .binary_cross_entropy::<Tensor>(target, None, Reduction::Mean)
}

fn zero_like_scalar(xs: &Tensor) -> Tensor {
    Tensor::from(0f32).to_device(xs.device())
}

/// Critic loss: real predictions against label 1 and fake predictions against
/// label 0, summed over every scale.
pub fn discriminator_loss(pred_fake: &DisOutput, pred_real: &DisOutput) -> Result<Tensor> {
    ensure!(
        pred_fake.len() == pred_real.len(),
        "fake and real predictions have {} and {} scales",
        pred_fake.len(),
        pred_real.len()
    );
    let first = pred_real
        .iter()
        .next()
        .ok_or_else(|| format_err!("empty discriminator output"))?;

    let loss = izip!(pred_fake.iter(), pred_real.iter()).fold(
        zero_like_scalar(first),
        |loss, (out_fake, out_real)| {
            let fake_loss = bce_with_target(out_fake, &out_fake.zeros_like());
            let real_loss = bce_with_target(out_real, &out_real.ones_like());
            loss + real_loss + fake_loss
        },
    );
    Ok(loss)
}

/// Content critic loss separating domain-A codes (label 0) from domain-B codes
/// (label 1). Only the last scale is used when several are returned.
pub fn content_discriminator_loss(pred_a: &DisOutput, pred_b: &DisOutput) -> Result<Tensor> {
    let out_a = pred_a
        .last()
        .ok_or_else(|| format_err!("empty content discriminator output"))?;
    let out_b = pred_b
        .last()
        .ok_or_else(|| format_err!("empty content discriminator output"))?;

    let real_loss = bce_with_target(out_b, &out_b.ones_like());
    let fake_loss = bce_with_target(out_a, &out_a.zeros_like());
    Ok(real_loss + fake_loss)
}

/// Pushes content codes towards the undecided label 0.5 of the content critic.
/// Only the last scale is used when several are returned.
pub fn content_adversarial_loss(pred: &DisOutput) -> Result<Tensor> {
    let out = pred
        .last()
        .ok_or_else(|| format_err!("empty content discriminator output"))?;
    Ok(bce_with_target(out, &(out.ones_like() * 0.5)))
}

/// Generator loss: fake predictions against label 1, summed over every scale.
pub fn generator_adversarial_loss(pred: &DisOutput) -> Result<Tensor> {
    let first = pred
        .iter()
        .next()
        .ok_or_else(|| format_err!("empty discriminator output"))?;
    let loss = pred.iter().fold(zero_like_scalar(first), |loss, out| {
        loss + bce_with_target(out, &out.ones_like())
    });
    Ok(loss)
}

/// Closed-form KL divergence from N(mu, exp(logvar)) to N(0, 1), summed over
/// every element.
pub fn kl_divergence(mu: &Tensor, logvar: &Tensor) -> Tensor {
    let elements = logvar + 1.0 - mu.square() - logvar.exp();
    elements.sum(Kind::Float) * -0.5
}

pub fn l2_regularize(xs: &Tensor) -> Tensor {
    xs.square().mean(Kind::Float)
}

pub fn l1_loss(input: &Tensor, target: &Tensor) -> Tensor {
    input.l1_loss(target, Reduction::Mean)
}

/// `z = mu + exp(0.5 * logvar) * eps`
pub fn reparameterize(mu: &Tensor, logvar: &Tensor, eps: &Tensor) -> Tensor {
    mu + (logvar * 0.5).exp() * eps
}

/// Rewards output diversity proportional to the style-code distance:
/// `1 / (mean|fake2 - fake1| / mean|z2 - z1| + eps)`.
///
/// The code distance is clamped to `eps` so that identical codes yield a large
/// but finite loss.
pub fn mode_seeking_loss(fake1: &Tensor, fake2: &Tensor, z1: &Tensor, z2: &Tensor) -> Tensor {
    let image_dist = (fake2 - fake1).abs().mean(Kind::Float);
    let code_dist = (z2 - z1)
        .abs()
        .mean(Kind::Float)
        .clamp_min(MODE_SEEKING_EPS);
    let ratio = image_dist / code_dist;
    (ratio + MODE_SEEKING_EPS).reciprocal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::abs_diff_eq;

    const LN_2: f64 = std::f64::consts::LN_2;

    #[test]
    fn discriminator_loss_at_undecided_logits_test() -> Result<()> {
        let single = || DisOutput::Single(Tensor::zeros(&[2, 1, 3, 3], FLOAT_CPU));
        let loss = discriminator_loss(&single(), &single())?.double_value(&[]);
        ensure!(abs_diff_eq!(loss, 2.0 * LN_2, epsilon = 1e-5), "loss = {}", loss);

        let multi = || {
            DisOutput::MultiScale(vec![
                Tensor::zeros(&[2, 1, 4, 4], FLOAT_CPU),
                Tensor::zeros(&[2, 1, 2, 2], FLOAT_CPU),
            ])
        };
        let loss = discriminator_loss(&multi(), &multi())?.double_value(&[]);
        ensure!(abs_diff_eq!(loss, 4.0 * LN_2, epsilon = 1e-5), "loss = {}", loss);
        Ok(())
    }

    #[test]
    fn discriminator_loss_vanishes_for_confident_critic_test() -> Result<()> {
        let fake = DisOutput::Single(Tensor::ones(&[2, 1, 2, 2], FLOAT_CPU) * -30.0);
        let real = DisOutput::Single(Tensor::ones(&[2, 1, 2, 2], FLOAT_CPU) * 30.0);
        let loss = discriminator_loss(&fake, &real)?.double_value(&[]);
        ensure!(loss < 1e-6, "loss = {}", loss);

        let loss = discriminator_loss(&real, &fake)?.double_value(&[]);
        ensure!(loss > 10.0, "loss = {}", loss);
        Ok(())
    }

    #[test]
    fn discriminator_loss_scale_mismatch_test() {
        let single = DisOutput::Single(Tensor::zeros(&[1, 1, 2, 2], FLOAT_CPU));
        let multi = DisOutput::MultiScale(vec![
            Tensor::zeros(&[1, 1, 2, 2], FLOAT_CPU),
            Tensor::zeros(&[1, 1, 1, 1], FLOAT_CPU),
        ]);
        assert!(discriminator_loss(&single, &multi).is_err());
    }

    #[test]
    fn content_losses_use_last_scale_test() -> Result<()> {
        let pred = || {
            DisOutput::MultiScale(vec![
                Tensor::ones(&[3], FLOAT_CPU) * 50.0,
                Tensor::zeros(&[3], FLOAT_CPU),
            ])
        };

        let loss = content_discriminator_loss(&pred(), &pred())?.double_value(&[]);
        ensure!(abs_diff_eq!(loss, 2.0 * LN_2, epsilon = 1e-5), "loss = {}", loss);

        let loss = content_adversarial_loss(&pred())?.double_value(&[]);
        ensure!(abs_diff_eq!(loss, LN_2, epsilon = 1e-5), "loss = {}", loss);
        Ok(())
    }

    #[test]
    fn generator_adversarial_loss_test() -> Result<()> {
        let pred = DisOutput::MultiScale(vec![
            Tensor::zeros(&[1, 1, 2, 2], FLOAT_CPU),
            Tensor::zeros(&[1, 1, 1, 1], FLOAT_CPU),
            Tensor::zeros(&[1, 1, 1, 1], FLOAT_CPU),
        ]);
        let loss = generator_adversarial_loss(&pred)?.double_value(&[]);
        ensure!(abs_diff_eq!(loss, 3.0 * LN_2, epsilon = 1e-5), "loss = {}", loss);
        Ok(())
    }

    #[test]
    fn reparameterize_test() {
        let mu = Tensor::randn(&[4, 8], FLOAT_CPU);
        let logvar = Tensor::randn(&[4, 8], FLOAT_CPU);

        let z = reparameterize(&mu, &logvar, &mu.zeros_like());
        assert!(z.equal(&mu));

        let eps = Tensor::ones(&[4, 8], FLOAT_CPU);
        let z = reparameterize(&mu, &logvar, &eps);
        let expect = &mu + (&logvar * 0.5).exp();
        assert!(z.allclose(&expect, 1e-6, 1e-6, false));
    }

    #[test]
    fn kl_divergence_test() {
        let zeros = Tensor::zeros(&[2, 8], FLOAT_CPU);
        let kl = kl_divergence(&zeros, &zeros).double_value(&[]);
        assert!(abs_diff_eq!(kl, 0.0, epsilon = 1e-9));

        // KL(N(1, 1) || N(0, 1)) = 0.5 per element
        let ones = Tensor::ones(&[2, 8], FLOAT_CPU);
        let kl = kl_divergence(&ones, &zeros).double_value(&[]);
        assert!(abs_diff_eq!(kl, 8.0, epsilon = 1e-5));
    }

    #[test]
    fn regularizers_test() {
        let xs = Tensor::of_slice(&[1f32, -2.0, 3.0, -4.0]);
        let l2 = l2_regularize(&xs).double_value(&[]);
        assert!(abs_diff_eq!(l2, 7.5, epsilon = 1e-6));

        let l1 = l1_loss(&xs, &xs.zeros_like()).double_value(&[]);
        assert!(abs_diff_eq!(l1, 2.5, epsilon = 1e-6));
    }

    #[test]
    fn mode_seeking_with_identical_codes_is_finite_test() {
        let z = Tensor::randn(&[1, 8], FLOAT_CPU);
        let fake = Tensor::rand(&[1, 3, 4, 4], FLOAT_CPU);

        let loss = mode_seeking_loss(&fake, &fake, &z, &z).double_value(&[]);
        assert!(loss.is_finite());
        assert!(abs_diff_eq!(loss, 1.0 / MODE_SEEKING_EPS, epsilon = 1.0));

        let other = Tensor::rand(&[1, 3, 4, 4], FLOAT_CPU);
        let loss = mode_seeking_loss(&fake, &other, &z, &z).double_value(&[]);
        assert!(loss.is_finite() && loss >= 0.0);
    }

    #[test]
    fn mode_seeking_matches_ratio_test() {
        let z1 = Tensor::zeros(&[1, 8], FLOAT_CPU);
        let z2 = Tensor::ones(&[1, 8], FLOAT_CPU) * 2.0;
        let fake1 = Tensor::zeros(&[1, 3, 2, 2], FLOAT_CPU);
        let fake2 = Tensor::ones(&[1, 3, 2, 2], FLOAT_CPU) * 0.5;

        let loss = mode_seeking_loss(&fake1, &fake2, &z1, &z2).double_value(&[]);
        let expect = 1.0 / (0.5 / 2.0 + MODE_SEEKING_EPS);
        assert!(abs_diff_eq!(loss, expect, epsilon = 1e-4));
    }
}
