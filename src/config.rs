use crate::{common::*, model::NormKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub dataset: Dataset,
    pub model: Model,
    pub train: Training,
    pub logging: Logging,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file '{}'", path.display()))?;
        let config: Self = json5::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let Training {
            batch_size,
            half_size,
            n_ep,
            n_ep_decay,
            d_iter,
            learning_rate,
            ..
        } = self.train;

        ensure!(
            half_size.get() <= batch_size.get(),
            "half_size ({}) must not exceed batch_size ({})",
            half_size,
            batch_size
        );
        ensure!(d_iter.get() >= 1, "d_iter must be positive");
        ensure!(learning_rate > 0.0, "learning_rate must be positive");
        if let Some(n_ep_decay) = n_ep_decay {
            ensure!(
                n_ep_decay <= n_ep,
                "n_ep_decay ({}) must not exceed n_ep ({})",
                n_ep_decay,
                n_ep
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    /// Directory containing `trainA` and `trainB` sub-directories of `*.pt` image tensors.
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub input_dim_a: NonZeroUsize,
    pub input_dim_b: NonZeroUsize,
    pub dis_scale: NonZeroUsize,
    #[serde(default = "default_dis_norm")]
    pub dis_norm: NormKind,
    #[serde(default)]
    pub dis_spectral_norm: bool,
    #[serde(default)]
    pub concat: bool,
    #[serde(default)]
    pub no_ms: bool,
    #[serde(default = "default_base_channels")]
    pub base_channels: NonZeroUsize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Training {
    #[serde(with = "tch_serde::serde_device")]
    pub device: Device,
    pub batch_size: NonZeroUsize,
    #[serde(default = "default_half_size")]
    pub half_size: NonZeroUsize,
    pub n_ep: usize,
    /// Epoch at which learning-rate decay starts. `None` keeps the rate constant.
    pub n_ep_decay: Option<usize>,
    #[serde(default)]
    pub lr_policy: LrPolicy,
    #[serde(default = "default_d_iter")]
    pub d_iter: NonZeroUsize,
    pub max_it: Option<usize>,
    pub resume: Option<PathBuf>,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: R64,
    pub seed: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    pub log_dir: PathBuf,
    pub save_image_steps: Option<NonZeroUsize>,
    pub save_checkpoint_epochs: Option<NonZeroUsize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LrPolicy {
    Lambda,
    Step,
}

impl Default for LrPolicy {
    fn default() -> Self {
        Self::Lambda
    }
}

fn default_dis_norm() -> NormKind {
    NormKind::None
}

fn default_base_channels() -> NonZeroUsize {
    NonZeroUsize::new(64).unwrap()
}

fn default_half_size() -> NonZeroUsize {
    NonZeroUsize::new(1).unwrap()
}

fn default_d_iter() -> NonZeroUsize {
    NonZeroUsize::new(3).unwrap()
}

fn default_learning_rate() -> R64 {
    r64(1e-4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config_test() -> Result<()> {
        let text = r#"{
            dataset: { dir: "/data/cat2dog" },
            model: {
                input_dim_a: 3,
                input_dim_b: 3,
                dis_scale: 3,
                dis_norm: "InstanceNorm",
                concat: true,
            },
            train: {
                device: "cpu",
                batch_size: 2,
                n_ep: 1200,
                n_ep_decay: 600,
                resume: null,
                max_it: null,
                seed: 7,
            },
            logging: {
                log_dir: "logs",
                save_image_steps: 100,
                save_checkpoint_epochs: 10,
            },
        }"#;

        let config: Config = json5::from_str(text)?;
        config.validate()?;

        ensure!(config.model.dis_scale.get() == 3);
        ensure!(config.model.dis_norm == NormKind::InstanceNorm);
        ensure!(!config.model.dis_spectral_norm);
        ensure!(config.model.concat && !config.model.no_ms);
        ensure!(config.model.base_channels.get() == 64);
        ensure!(config.train.device == Device::Cpu);
        ensure!(config.train.half_size.get() == 1);
        ensure!(config.train.d_iter.get() == 3);
        ensure!(config.train.lr_policy == LrPolicy::Lambda);
        ensure!(config.train.learning_rate == r64(1e-4));
        Ok(())
    }

    #[test]
    fn reject_oversized_half_size_test() -> Result<()> {
        let text = r#"{
            dataset: { dir: "data" },
            model: { input_dim_a: 3, input_dim_b: 1, dis_scale: 1 },
            train: { device: "cpu", batch_size: 2, half_size: 3, n_ep: 10 },
            logging: { log_dir: "logs" },
        }"#;

        let config: Config = json5::from_str(text)?;
        ensure!(config.validate().is_err());
        Ok(())
    }
}
