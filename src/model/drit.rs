use super::{
    discriminator::{
        ContentDiscriminator, ContentDiscriminatorInit, DomainDiscriminator,
        DomainDiscriminatorInit,
    },
    encoder::{
        AttrOutput, AttributeEncoder, AttributeEncoderInit, ContentEncoder, ContentEncoderInit, NZ,
    },
    generator::{Generator, GeneratorInit},
    loss,
    norm::NormKind,
};
use crate::{
    checkpoint::CheckpointRecord,
    common::*,
    config::{self, LrPolicy},
    optim::{Adam, AdamInit, LrScheduler},
};

const CONTENT_LR_DIVISOR: f64 = 2.5;
const CONTENT_CLIP_NORM: f64 = 5.0;
const KL_WEIGHT: f64 = 0.01;
const RECON_WEIGHT: f64 = 10.0;
const LATENT_WEIGHT: f64 = 10.0;

const DIS_A: &str = "disA";
const DIS_A2: &str = "disA2";
const DIS_B: &str = "disB";
const DIS_B2: &str = "disB2";
const DIS_CONTENT: &str = "disContent";
const ENC_C: &str = "enc_c";
const ENC_A: &str = "enc_a";
const GEN: &str = "gen";

#[derive(Debug, Clone)]
pub struct DritInit {
    pub input_dim_a: usize,
    pub input_dim_b: usize,
    pub dis_scale: usize,
    pub dis_norm: NormKind,
    pub dis_spectral_norm: bool,
    pub concat: bool,
    pub no_ms: bool,
    pub base_channels: usize,
    /// Number of leading samples of each batch used for the encoded paths.
    pub half_size: usize,
    pub learning_rate: f64,
    pub device: Device,
}

impl DritInit {
    pub fn from_config(config: &config::Config) -> Self {
        let config::Config {
            model:
                config::Model {
                    input_dim_a,
                    input_dim_b,
                    dis_scale,
                    dis_norm,
                    dis_spectral_norm,
                    concat,
                    no_ms,
                    base_channels,
                },
            train:
                config::Training {
                    device,
                    half_size,
                    learning_rate,
                    ..
                },
            ..
        } = *config;

        Self {
            input_dim_a: input_dim_a.get(),
            input_dim_b: input_dim_b.get(),
            dis_scale: dis_scale.get(),
            dis_norm,
            dis_spectral_norm,
            concat,
            no_ms,
            base_channels: base_channels.get(),
            half_size: half_size.get(),
            learning_rate: learning_rate.raw(),
            device,
        }
    }

    pub fn build(self) -> Result<Drit> {
        let Self {
            input_dim_a,
            input_dim_b,
            dis_scale,
            dis_norm,
            dis_spectral_norm,
            concat,
            no_ms,
            base_channels,
            half_size,
            learning_rate: lr,
            device,
        } = self;
        ensure!(half_size > 0, "half_size must be positive");
        ensure!(base_channels > 0, "base_channels must be positive");

        let domain_dis = |input_dim| DomainDiscriminatorInit {
            input_dim,
            dis_scale,
            norm_kind: dis_norm,
            spectral_norm: dis_spectral_norm,
            base_channels,
        };

        let dis_a = Network::new(device, lr, |path| domain_dis(input_dim_a).build(path))?;
        let dis_a2 = Network::new(device, lr, |path| domain_dis(input_dim_a).build(path))?;
        let dis_b = Network::new(device, lr, |path| domain_dis(input_dim_b).build(path))?;
        let dis_b2 = Network::new(device, lr, |path| domain_dis(input_dim_b).build(path))?;

        let enc_c = Network::new(device, lr, |path| {
            ContentEncoderInit {
                input_dim_a,
                input_dim_b,
                base_channels,
            }
            .build(path)
        })?;
        let content_channels = enc_c.model.out_channels();

        let dis_content = Network::new(device, lr / CONTENT_LR_DIVISOR, |path| {
            ContentDiscriminatorInit { content_channels }.build(path)
        })?;
        let enc_a = Network::new(device, lr, |path| {
            AttributeEncoderInit {
                input_dim_a,
                input_dim_b,
                base_channels,
                concat,
            }
            .build(path)
        })?;
        let gen = Network::new(device, lr, |path| {
            GeneratorInit {
                input_dim_a,
                input_dim_b,
                content_channels,
                concat,
            }
            .build(path)
        })?;

        Ok(Drit {
            device,
            no_ms,
            half_size: half_size as i64,
            content_clip_norm: CONTENT_CLIP_NORM,
            dis_a,
            dis_a2,
            dis_b,
            dis_b2,
            dis_content,
            enc_c,
            enc_a,
            gen,
            scheduler: None,
        })
    }
}

/// Parameters of one network together with the optimizer that owns their
/// update state.
pub struct Params {
    pub vs: nn::VarStore,
    pub opt: Adam,
    base_lr: f64,
}

struct Network<M> {
    model: M,
    params: Params,
}

impl<M> Network<M> {
    fn new<F>(device: Device, lr: f64, build: F) -> Result<Self>
    where
        F: FnOnce(&nn::Path) -> Result<M>,
    {
        let vs = nn::VarStore::new(device);
        let model = build(&vs.root())?;
        let opt = AdamInit::default().build(&vs, lr)?;
        Ok(Self {
            model,
            params: Params {
                vs,
                opt,
                base_lr: lr,
            },
        })
    }

    /// Runs one zero-grad, backward, step cycle on this network alone.
    fn update<F>(&mut self, backward: F) -> Result<f64>
    where
        F: FnOnce(&M) -> Result<f64>,
    {
        self.params.opt.zero_grad();
        let loss = backward(&self.model)?;
        self.params.opt.step();
        Ok(loss)
    }
}

/// Sampled attribute codes, with the Gaussian parameters they were drawn from
/// when the encoder is reparameterized.
#[derive(Debug)]
pub enum AttrCode {
    Direct {
        z_attr_a: Tensor,
        z_attr_b: Tensor,
    },
    Reparameterized {
        z_attr_a: Tensor,
        z_attr_b: Tensor,
        mu_a: Tensor,
        logvar_a: Tensor,
        mu_b: Tensor,
        logvar_b: Tensor,
    },
}

impl AttrCode {
    fn sample(output: AttrOutput) -> Self {
        match output {
            AttrOutput::Direct { z_attr_a, z_attr_b } => Self::Direct { z_attr_a, z_attr_b },
            AttrOutput::Gaussian {
                mu_a,
                logvar_a,
                mu_b,
                logvar_b,
            } => {
                let z_attr_a = loss::reparameterize(&mu_a, &logvar_a, &mu_a.randn_like());
                let z_attr_b = loss::reparameterize(&mu_b, &logvar_b, &mu_b.randn_like());
                Self::Reparameterized {
                    z_attr_a,
                    z_attr_b,
                    mu_a,
                    logvar_a,
                    mu_b,
                    logvar_b,
                }
            }
        }
    }

    pub fn z_attr_a(&self) -> &Tensor {
        match self {
            Self::Direct { z_attr_a, .. } => z_attr_a,
            Self::Reparameterized { z_attr_a, .. } => z_attr_a,
        }
    }

    pub fn z_attr_b(&self) -> &Tensor {
        match self {
            Self::Direct { z_attr_b, .. } => z_attr_b,
            Self::Reparameterized { z_attr_b, .. } => z_attr_b,
        }
    }

    /// The code that the latent regression compares against the random style:
    /// the mean in reparameterized mode, the code itself otherwise.
    fn regression_targets(&self) -> (&Tensor, &Tensor) {
        match self {
            Self::Direct { z_attr_a, z_attr_b } => (z_attr_a, z_attr_b),
            Self::Reparameterized { mu_a, mu_b, .. } => (mu_a, mu_b),
        }
    }
}

#[derive(Debug)]
pub struct EncResult {
    pub z_content_a: Tensor,
    pub z_content_b: Tensor,
    pub attr: AttrCode,
}

#[derive(Debug)]
pub enum ModeSeeking {
    Disabled,
    Enabled {
        z_random2: Tensor,
        fake_a_random2: Tensor,
        fake_b_random2: Tensor,
    },
}

/// Every image synthesized by one full translation pass.
#[derive(Debug)]
pub struct ForwardResult {
    pub enc: EncResult,
    pub z_random: Tensor,
    pub fake_a_encoded: Tensor,
    pub fake_b_encoded: Tensor,
    pub fake_aa_encoded: Tensor,
    pub fake_bb_encoded: Tensor,
    pub fake_a_random: Tensor,
    pub fake_b_random: Tensor,
    pub fake_a_recon: Tensor,
    pub fake_b_recon: Tensor,
    pub mode_seeking: ModeSeeking,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscriminatorLosses {
    pub dis_a: f64,
    pub dis_a2: f64,
    pub dis_b: f64,
    pub dis_b2: f64,
    pub dis_content: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratorLosses {
    pub gan_a: f64,
    pub gan_b: f64,
    pub gan_a_content: f64,
    pub gan_b_content: f64,
    pub kl_za_a: f64,
    pub kl_za_b: f64,
    pub kl_zc_a: f64,
    pub kl_zc_b: f64,
    pub l1_recon_a: f64,
    pub l1_recon_b: f64,
    pub l1_recon_aa: f64,
    pub l1_recon_bb: f64,
    pub joint_total: f64,
    pub gan2_a: f64,
    pub gan2_b: f64,
    pub gan2_a2: Option<f64>,
    pub gan2_b2: Option<f64>,
    pub l1_latent_a: f64,
    pub l1_latent_b: f64,
    pub mode_seeking_ab: Option<f64>,
    pub mode_seeking_ba: Option<f64>,
    pub alone_total: f64,
}

/// Disentangled two-domain translation model: two encoders, one generator and
/// five critics, each paired with its own optimizer.
pub struct Drit {
    device: Device,
    no_ms: bool,
    half_size: i64,
    /// Gradient-norm bound applied to the content critic before each step.
    content_clip_norm: f64,
    dis_a: Network<DomainDiscriminator>,
    dis_a2: Network<DomainDiscriminator>,
    dis_b: Network<DomainDiscriminator>,
    dis_b2: Network<DomainDiscriminator>,
    dis_content: Network<ContentDiscriminator>,
    enc_c: Network<ContentEncoder>,
    enc_a: Network<AttributeEncoder>,
    gen: Network<Generator>,
    scheduler: Option<LrScheduler>,
}

impl Drit {
    pub fn device(&self) -> Device {
        self.device
    }

    /// Named parameter sets in checkpoint order.
    pub fn params(&self) -> [(&'static str, &Params); 8] {
        [
            (DIS_A, &self.dis_a.params),
            (DIS_A2, &self.dis_a2.params),
            (DIS_B, &self.dis_b.params),
            (DIS_B2, &self.dis_b2.params),
            (DIS_CONTENT, &self.dis_content.params),
            (ENC_C, &self.enc_c.params),
            (ENC_A, &self.enc_a.params),
            (GEN, &self.gen.params),
        ]
    }

    fn params_mut(&mut self) -> [(&'static str, &mut Params); 8] {
        [
            (DIS_A, &mut self.dis_a.params),
            (DIS_A2, &mut self.dis_a2.params),
            (DIS_B, &mut self.dis_b.params),
            (DIS_B2, &mut self.dis_b2.params),
            (DIS_CONTENT, &mut self.dis_content.params),
            (ENC_C, &mut self.enc_c.params),
            (ENC_A, &mut self.enc_a.params),
            (GEN, &mut self.gen.params),
        ]
    }

    /// Re-draws every convolution weight from N(0, 0.02).
    pub fn initialize(&mut self) {
        for (_, params) in self.params_mut() {
            for (name, mut var) in params.vs.variables() {
                if is_conv_weight(&name) {
                    tch::no_grad(|| {
                        let _ = var.normal_(0.0, 0.02);
                    });
                }
            }
        }
    }

    pub fn set_scheduler(
        &mut self,
        policy: LrPolicy,
        n_ep: usize,
        n_ep_decay: Option<usize>,
        last_ep: usize,
    ) {
        let scheduler = LrScheduler::new(policy, n_ep, n_ep_decay, last_ep);
        self.apply_lr_factor(scheduler.factor());
        self.scheduler = Some(scheduler);
    }

    /// Advances the scheduler by one epoch. Returns the learning rate of the
    /// generator afterwards.
    pub fn update_lr(&mut self) -> f64 {
        if let Some(scheduler) = &mut self.scheduler {
            let factor = scheduler.step();
            self.apply_lr_factor(factor);
        }
        self.learning_rate()
    }

    /// Current learning rate of the encoders and the generator.
    pub fn learning_rate(&self) -> f64 {
        self.gen.params.opt.lr()
    }

    fn apply_lr_factor(&mut self, factor: f64) {
        for (_, params) in self.params_mut() {
            let lr = params.base_lr * factor;
            params.opt.set_lr(lr);
        }
    }

    fn random_code(&self, batch_size: i64) -> Tensor {
        Tensor::randn(&[batch_size, NZ as i64], (Kind::Float, self.device))
    }

    pub fn encode(&self, image_a: &Tensor, image_b: &Tensor) -> EncResult {
        let (z_content_a, z_content_b) = self.enc_c.model.forward(image_a, image_b, true);
        let attr = AttrCode::sample(self.enc_a.model.forward(image_a, image_b, true));
        EncResult {
            z_content_a,
            z_content_b,
            attr,
        }
    }

    pub fn forward(&self, real_a: &Tensor, real_b: &Tensor) -> Result<ForwardResult> {
        let batch_size = paired_batch_size(real_a, real_b)?;
        let gen = &self.gen.model;

        let enc = self.encode(real_a, real_b);
        let z_random = self.random_code(batch_size);
        let z_random2 = (!self.no_ms).then(|| self.random_code(batch_size));

        let (fakes_a, fakes_b) = {
            let EncResult {
                z_content_a,
                z_content_b,
                attr,
            } = &enc;
            let (z_attr_a, z_attr_b) = (attr.z_attr_a(), attr.z_attr_b());

            // cross translation, self reconstruction, random style, second random style
            let mut content_for_a = vec![z_content_b, z_content_a, z_content_b];
            let mut attr_for_a = vec![z_attr_a, z_attr_a, &z_random];
            let mut content_for_b = vec![z_content_a, z_content_b, z_content_a];
            let mut attr_for_b = vec![z_attr_b, z_attr_b, &z_random];
            if let Some(z_random2) = &z_random2 {
                content_for_a.push(z_content_b);
                attr_for_a.push(z_random2);
                content_for_b.push(z_content_a);
                attr_for_b.push(z_random2);
            }
            let segments = content_for_a.len();

            let output_a = gen.forward_a(
                &Tensor::cat(&content_for_a, 0),
                &Tensor::cat(&attr_for_a, 0),
                true,
            );
            let output_b = gen.forward_b(
                &Tensor::cat(&content_for_b, 0),
                &Tensor::cat(&attr_for_b, 0),
                true,
            );
            (
                split_segments(&output_a, batch_size, segments)?,
                split_segments(&output_b, batch_size, segments)?,
            )
        };

        let mut fakes_a = fakes_a.into_iter();
        let mut fakes_b = fakes_b.into_iter();
        let (fake_a_encoded, fake_aa_encoded, fake_a_random) = fakes_a
            .next_tuple()
            .ok_or_else(|| format_err!("missing domain A outputs"))?;
        let (fake_b_encoded, fake_bb_encoded, fake_b_random) = fakes_b
            .next_tuple()
            .ok_or_else(|| format_err!("missing domain B outputs"))?;

        let mode_seeking = match (z_random2, fakes_a.next(), fakes_b.next()) {
            (Some(z_random2), Some(fake_a_random2), Some(fake_b_random2)) => ModeSeeking::Enabled {
                z_random2,
                fake_a_random2,
                fake_b_random2,
            },
            (None, None, None) => ModeSeeking::Disabled,
            _ => bail!("inconsistent mode-seeking outputs"),
        };

        // a translated A image carries the content of B and vice versa
        let cycle = self.encode(&fake_a_encoded, &fake_b_encoded);
        let fake_a_recon = gen.forward_a(&cycle.z_content_b, cycle.attr.z_attr_a(), true);
        let fake_b_recon = gen.forward_b(&cycle.z_content_a, cycle.attr.z_attr_b(), true);

        Ok(ForwardResult {
            enc,
            z_random,
            fake_a_encoded,
            fake_b_encoded,
            fake_aa_encoded,
            fake_bb_encoded,
            fake_a_random,
            fake_b_random,
            fake_a_recon,
            fake_b_recon,
            mode_seeking,
        })
    }

    pub fn forward_content(&self, image_a: &Tensor, image_b: &Tensor) -> (Tensor, Tensor) {
        self.enc_c.model.forward(image_a, image_b, true)
    }

    fn split_batch(&self, image: &Tensor, batch_size: i64) -> Result<(Tensor, Tensor)> {
        let half_size = self.half_size;
        ensure!(
            batch_size >= half_size,
            "batch size {} is smaller than half_size {}",
            batch_size,
            half_size
        );
        let encoded = image.narrow(0, 0, half_size);
        // with no samples left over, the random-style critics see the encoded samples
        let random = if batch_size > half_size {
            image.narrow(0, half_size, batch_size - half_size)
        } else {
            encoded.shallow_clone()
        };
        Ok((encoded, random))
    }

    /// Updates the content critic alone, without running the translation graph.
    pub fn update_d_content(&mut self, image_a: &Tensor, image_b: &Tensor) -> Result<f64> {
        let batch_size = paired_batch_size(image_a, image_b)?;
        let (real_a, _) = self.split_batch(image_a, batch_size)?;
        let (real_b, _) = self.split_batch(image_b, batch_size)?;

        let (z_content_a, z_content_b) = self.forward_content(&real_a, &real_b);
        self.update_content_critic(&z_content_a, &z_content_b)
    }

    fn update_content_critic(&mut self, z_content_a: &Tensor, z_content_b: &Tensor) -> Result<f64> {
        let max_norm = self.content_clip_norm;
        let Network { model, params } = &mut self.dis_content;
        params.opt.zero_grad();
        let loss = backward_content_d(model, z_content_a, z_content_b)?;
        params.opt.clip_grad_norm(max_norm);
        params.opt.step();
        Ok(loss)
    }

    /// Updates the five critics in order and returns the translation pass
    /// they were trained against.
    pub fn update_d(
        &mut self,
        image_a: &Tensor,
        image_b: &Tensor,
    ) -> Result<(ForwardResult, DiscriminatorLosses)> {
        let batch_size = paired_batch_size(image_a, image_b)?;
        let (real_a_encoded, real_a_random) = self.split_batch(image_a, batch_size)?;
        let (real_b_encoded, real_b_random) = self.split_batch(image_b, batch_size)?;

        let fr = self.forward(&real_a_encoded, &real_b_encoded)?;
        let (fake_a_random2, fake_b_random2) = match &fr.mode_seeking {
            ModeSeeking::Enabled {
                fake_a_random2,
                fake_b_random2,
                ..
            } => (Some(fake_a_random2), Some(fake_b_random2)),
            ModeSeeking::Disabled => (None, None),
        };

        let dis_a = self
            .dis_a
            .update(|dis| backward_d(dis, &real_a_encoded, &fr.fake_a_encoded))?;
        let dis_a2 = self.dis_a2.update(|dis| {
            let mut loss = backward_d(dis, &real_a_random, &fr.fake_a_random)?;
            if let Some(fake) = fake_a_random2 {
                loss += backward_d(dis, &real_a_random, fake)?;
            }
            Ok(loss)
        })?;
        let dis_b = self
            .dis_b
            .update(|dis| backward_d(dis, &real_b_encoded, &fr.fake_b_encoded))?;
        let dis_b2 = self.dis_b2.update(|dis| {
            let mut loss = backward_d(dis, &real_b_random, &fr.fake_b_random)?;
            if let Some(fake) = fake_b_random2 {
                loss += backward_d(dis, &real_b_random, fake)?;
            }
            Ok(loss)
        })?;
        let dis_content = self.update_content_critic(&fr.enc.z_content_a, &fr.enc.z_content_b)?;

        let losses = DiscriminatorLosses {
            dis_a,
            dis_a2,
            dis_b,
            dis_b2,
            dis_content,
        };
        Ok((fr, losses))
    }

    /// Updates encoders and generator in two phases. The first phase reuses
    /// `forward` when given, the second always draws a fresh pass.
    pub fn update_eg(
        &mut self,
        image_a: &Tensor,
        image_b: &Tensor,
        forward: Option<ForwardResult>,
    ) -> Result<GeneratorLosses> {
        let batch_size = paired_batch_size(image_a, image_b)?;
        let (real_a, _) = self.split_batch(image_a, batch_size)?;
        let (real_b, _) = self.split_batch(image_b, batch_size)?;

        let fr = match forward {
            Some(fr) => fr,
            None => self.forward(&real_a, &real_b)?,
        };

        // update content encoder, attribute encoder and generator
        self.enc_c.params.opt.zero_grad();
        self.enc_a.params.opt.zero_grad();
        self.gen.params.opt.zero_grad();
        let joint = self.backward_eg(&fr, &real_a, &real_b)?;
        self.enc_c.params.opt.step();
        self.enc_a.params.opt.step();
        self.gen.params.opt.step();

        // update content encoder and generator
        let fr = self.forward(&real_a, &real_b)?;
        self.enc_c.params.opt.zero_grad();
        self.gen.params.opt.zero_grad();
        let alone = self.backward_g_alone(&fr)?;
        self.enc_c.params.opt.step();
        self.gen.params.opt.step();

        let JointLosses {
            gan_a,
            gan_b,
            gan_a_content,
            gan_b_content,
            kl_za_a,
            kl_za_b,
            kl_zc_a,
            kl_zc_b,
            l1_recon_a,
            l1_recon_b,
            l1_recon_aa,
            l1_recon_bb,
            total: joint_total,
        } = joint;
        let AloneLosses {
            gan2_a,
            gan2_b,
            gan2_a2,
            gan2_b2,
            l1_latent_a,
            l1_latent_b,
            mode_seeking_ab,
            mode_seeking_ba,
            total: alone_total,
        } = alone;

        Ok(GeneratorLosses {
            gan_a,
            gan_b,
            gan_a_content,
            gan_b_content,
            kl_za_a,
            kl_za_b,
            kl_zc_a,
            kl_zc_b,
            l1_recon_a,
            l1_recon_b,
            l1_recon_aa,
            l1_recon_bb,
            joint_total,
            gan2_a,
            gan2_b,
            gan2_a2,
            gan2_b2,
            l1_latent_a,
            l1_latent_b,
            mode_seeking_ab,
            mode_seeking_ba,
            alone_total,
        })
    }

    fn backward_eg(
        &self,
        fr: &ForwardResult,
        real_a: &Tensor,
        real_b: &Tensor,
    ) -> Result<JointLosses> {
        let ForwardResult {
            enc:
                EncResult {
                    z_content_a,
                    z_content_b,
                    attr,
                },
            fake_a_encoded,
            fake_b_encoded,
            fake_aa_encoded,
            fake_bb_encoded,
            fake_a_recon,
            fake_b_recon,
            ..
        } = fr;

        let dis_content = &self.dis_content.model;
        let gan_a_content = loss::content_adversarial_loss(&dis_content.forward_t(z_content_a, true))?;
        let gan_b_content = loss::content_adversarial_loss(&dis_content.forward_t(z_content_b, true))?;

        let gan_a =
            loss::generator_adversarial_loss(&self.dis_a.model.forward_t(fake_a_encoded, true))?;
        let gan_b =
            loss::generator_adversarial_loss(&self.dis_b.model.forward_t(fake_b_encoded, true))?;

        let (kl_za_a, kl_za_b) = match attr {
            AttrCode::Reparameterized {
                mu_a,
                logvar_a,
                mu_b,
                logvar_b,
                ..
            } => (
                loss::kl_divergence(mu_a, logvar_a) * KL_WEIGHT,
                loss::kl_divergence(mu_b, logvar_b) * KL_WEIGHT,
            ),
            AttrCode::Direct { z_attr_a, z_attr_b } => (
                loss::l2_regularize(z_attr_a) * KL_WEIGHT,
                loss::l2_regularize(z_attr_b) * KL_WEIGHT,
            ),
        };
        let kl_zc_a = loss::l2_regularize(z_content_a) * KL_WEIGHT;
        let kl_zc_b = loss::l2_regularize(z_content_b) * KL_WEIGHT;

        let l1_recon_a = loss::l1_loss(fake_a_recon, real_a) * RECON_WEIGHT;
        let l1_recon_b = loss::l1_loss(fake_b_recon, real_b) * RECON_WEIGHT;
        let l1_recon_aa = loss::l1_loss(fake_aa_encoded, real_a) * RECON_WEIGHT;
        let l1_recon_bb = loss::l1_loss(fake_bb_encoded, real_b) * RECON_WEIGHT;

        let total = &gan_a
            + &gan_b
            + &gan_a_content
            + &gan_b_content
            + &l1_recon_aa
            + &l1_recon_bb
            + &l1_recon_a
            + &l1_recon_b
            + &kl_zc_a
            + &kl_zc_b
            + &kl_za_a
            + &kl_za_b;
        total.backward();

        Ok(JointLosses {
            gan_a: scalar(&gan_a),
            gan_b: scalar(&gan_b),
            gan_a_content: scalar(&gan_a_content),
            gan_b_content: scalar(&gan_b_content),
            kl_za_a: scalar(&kl_za_a),
            kl_za_b: scalar(&kl_za_b),
            kl_zc_a: scalar(&kl_zc_a),
            kl_zc_b: scalar(&kl_zc_b),
            l1_recon_a: scalar(&l1_recon_a),
            l1_recon_b: scalar(&l1_recon_b),
            l1_recon_aa: scalar(&l1_recon_aa),
            l1_recon_bb: scalar(&l1_recon_bb),
            total: scalar(&total),
        })
    }

    fn backward_g_alone(&self, fr: &ForwardResult) -> Result<AloneLosses> {
        let ForwardResult {
            z_random,
            fake_a_random,
            fake_b_random,
            mode_seeking,
            ..
        } = fr;

        let gan2_a =
            loss::generator_adversarial_loss(&self.dis_a2.model.forward_t(fake_a_random, true))?;
        let gan2_b =
            loss::generator_adversarial_loss(&self.dis_b2.model.forward_t(fake_b_random, true))?;

        // latent regression: the random style must be recoverable from its translation
        let recovered =
            AttrCode::sample(self.enc_a.model.forward(fake_a_random, fake_b_random, true));
        let (z_recovered_a, z_recovered_b) = recovered.regression_targets();
        let l1_latent_a = loss::l1_loss(z_recovered_a, z_random) * LATENT_WEIGHT;
        let l1_latent_b = loss::l1_loss(z_recovered_b, z_random) * LATENT_WEIGHT;

        let mut total = &l1_latent_a + &l1_latent_b + &gan2_a + &gan2_b;

        let (gan2_a2, gan2_b2, mode_seeking_ab, mode_seeking_ba) = match mode_seeking {
            ModeSeeking::Enabled {
                z_random2,
                fake_a_random2,
                fake_b_random2,
            } => {
                let gan2_a2 = loss::generator_adversarial_loss(
                    &self.dis_a2.model.forward_t(fake_a_random2, true),
                )?;
                let gan2_b2 = loss::generator_adversarial_loss(
                    &self.dis_b2.model.forward_t(fake_b_random2, true),
                )?;
                let lz_ab =
                    loss::mode_seeking_loss(fake_b_random, fake_b_random2, z_random, z_random2);
                let lz_ba =
                    loss::mode_seeking_loss(fake_a_random, fake_a_random2, z_random, z_random2);

                total = total + &gan2_a2 + &gan2_b2 + &lz_ab + &lz_ba;
                (
                    Some(scalar(&gan2_a2)),
                    Some(scalar(&gan2_b2)),
                    Some(scalar(&lz_ab)),
                    Some(scalar(&lz_ba)),
                )
            }
            ModeSeeking::Disabled => (None, None, None, None),
        };
        total.backward();

        Ok(AloneLosses {
            gan2_a: scalar(&gan2_a),
            gan2_b: scalar(&gan2_b),
            gan2_a2,
            gan2_b2,
            l1_latent_a: scalar(&l1_latent_a),
            l1_latent_b: scalar(&l1_latent_b),
            mode_seeking_ab,
            mode_seeking_ba,
            total: scalar(&total),
        })
    }

    /// Translates `image` into the other domain with a random style.
    pub fn test_forward(&self, image: &Tensor, a2b: bool) -> Result<Tensor> {
        let (batch_size, _, _, _) = image.size4()?;
        let z_random = self.random_code(batch_size);
        let enc_c = &self.enc_c.model;
        let gen = &self.gen.model;

        let output = tch::no_grad(|| {
            if a2b {
                gen.forward_b(&enc_c.forward_a(image, false), &z_random, false)
            } else {
                gen.forward_a(&enc_c.forward_b(image, false), &z_random, false)
            }
        });
        Ok(output)
    }

    /// Translates the content of one image with the attribute encoded from the
    /// image of the other domain.
    pub fn test_forward_transfer(
        &self,
        image_a: &Tensor,
        image_b: &Tensor,
        a2b: bool,
    ) -> Result<Tensor> {
        paired_batch_size(image_a, image_b)?;
        let output = tch::no_grad(|| {
            let (z_content_a, z_content_b) = self.enc_c.model.forward(image_a, image_b, false);
            let attr = AttrCode::sample(self.enc_a.model.forward(image_a, image_b, false));
            if a2b {
                self.gen
                    .model
                    .forward_b(&z_content_a, attr.z_attr_b(), false)
            } else {
                self.gen
                    .model
                    .forward_a(&z_content_b, attr.z_attr_a(), false)
            }
        });
        Ok(output)
    }

    pub fn save(&self, path: impl AsRef<Path>, ep: usize, total_it: usize) -> Result<()> {
        let mut record = CheckpointRecord::new();
        for (key, params) in self.params() {
            record.insert_network(key, &params.vs);
            record.insert_optimizer(key, &params.opt);
        }
        record.insert_counter("ep", ep as i64);
        record.insert_counter("total_it", total_it as i64);
        record.save(path)
    }

    /// Restores the encoders and the generator, plus the critics and every
    /// optimizer when `train` is set. Returns the saved (epoch, iteration).
    pub fn resume(&mut self, path: impl AsRef<Path>, train: bool) -> Result<(usize, usize)> {
        let record = CheckpointRecord::load(path, self.device)?;

        for (key, params) in self.params_mut() {
            let is_critic = !matches!(key, ENC_C | ENC_A | GEN);
            if is_critic && !train {
                continue;
            }
            record.restore_network(key, &params.vs)?;
            if train {
                record.restore_optimizer(key, &mut params.opt)?;
            }
        }

        let ep = record.counter("ep")?;
        let total_it = record.counter("total_it")?;
        ensure!(
            ep >= 0 && total_it >= 0,
            "negative counters in checkpoint: ep = {}, total_it = {}",
            ep,
            total_it
        );
        Ok((ep as usize, total_it as usize))
    }

    /// Lays out the first sample of a pass as a grid. The top row shows domain
    /// A: real, translation to B, random translation to B, self reconstruction
    /// and cycle reconstruction. The bottom row mirrors it for domain B.
    pub fn assemble_outputs(real_a: &Tensor, real_b: &Tensor, fr: &ForwardResult) -> Result<Tensor> {
        let first = |xs: &Tensor| -> Result<Tensor> { display_channels(&xs.narrow(0, 0, 1)) };

        let row_a = [
            real_a,
            &fr.fake_b_encoded,
            &fr.fake_b_random,
            &fr.fake_aa_encoded,
            &fr.fake_a_recon,
        ]
        .into_iter()
        .map(first)
        .collect::<Result<Vec<_>>>()?;
        let row_b = [
            real_b,
            &fr.fake_a_encoded,
            &fr.fake_a_random,
            &fr.fake_bb_encoded,
            &fr.fake_b_recon,
        ]
        .into_iter()
        .map(first)
        .collect::<Result<Vec<_>>>()?;

        let grid = Tensor::cat(&[Tensor::cat(&row_a, 3), Tensor::cat(&row_b, 3)], 2);
        Ok(grid.detach())
    }
}

struct JointLosses {
    gan_a: f64,
    gan_b: f64,
    gan_a_content: f64,
    gan_b_content: f64,
    kl_za_a: f64,
    kl_za_b: f64,
    kl_zc_a: f64,
    kl_zc_b: f64,
    l1_recon_a: f64,
    l1_recon_b: f64,
    l1_recon_aa: f64,
    l1_recon_bb: f64,
    total: f64,
}

struct AloneLosses {
    gan2_a: f64,
    gan2_b: f64,
    gan2_a2: Option<f64>,
    gan2_b2: Option<f64>,
    l1_latent_a: f64,
    l1_latent_b: f64,
    mode_seeking_ab: Option<f64>,
    mode_seeking_ba: Option<f64>,
    total: f64,
}

/// Back-propagates the critic loss of one domain discriminator. Fakes are
/// detached so that no gradient reaches the generator.
fn backward_d(dis: &DomainDiscriminator, real: &Tensor, fake: &Tensor) -> Result<f64> {
    let pred_fake = dis.forward_t(&fake.detach(), true);
    let pred_real = dis.forward_t(real, true);
    let loss = loss::discriminator_loss(&pred_fake, &pred_real)?;
    loss.backward();
    Ok(scalar(&loss))
}

fn backward_content_d(
    dis: &ContentDiscriminator,
    z_content_a: &Tensor,
    z_content_b: &Tensor,
) -> Result<f64> {
    let pred_a = dis.forward_t(&z_content_a.detach(), true);
    let pred_b = dis.forward_t(&z_content_b.detach(), true);
    let loss = loss::content_discriminator_loss(&pred_a, &pred_b)?;
    loss.backward();
    Ok(scalar(&loss))
}

fn paired_batch_size(image_a: &Tensor, image_b: &Tensor) -> Result<i64> {
    let (n_a, _, _, _) = image_a.size4()?;
    let (n_b, _, _, _) = image_b.size4()?;
    ensure!(
        n_a == n_b,
        "domain A and B batches differ in size: {} vs {}",
        n_a,
        n_b
    );
    ensure!(n_a > 0, "empty batch");
    Ok(n_a)
}

/// Splits a batch built by concatenating `count` segments of `segment` samples
/// back into the segments, in concatenation order.
fn split_segments(xs: &Tensor, segment: i64, count: usize) -> Result<Vec<Tensor>> {
    let total = xs.size()[0];
    ensure!(
        total == segment * count as i64,
        "cannot split {} samples into {} segments of {}",
        total,
        count,
        segment
    );
    Ok(xs.split(segment, 0))
}

fn display_channels(image: &Tensor) -> Result<Tensor> {
    let (_, channels, _, _) = image.size4()?;
    let image = match channels {
        1 => image.repeat(&[1, 3, 1, 1]),
        c if c >= 3 => image.narrow(1, 0, 3),
        c => bail!("cannot display an image with {} channels", c),
    };
    Ok(image)
}

fn is_conv_weight(name: &str) -> bool {
    let mut segments = name.rsplit('.');
    matches!(
        (segments.next(), segments.next()),
        (Some("weight"), Some(parent)) if parent.starts_with("conv")
    )
}

fn scalar(xs: &Tensor) -> f64 {
    xs.double_value(&[])
}
