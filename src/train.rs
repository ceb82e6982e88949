use crate::{
    common::*,
    config, message as msg,
    model::{Drit, DritInit},
    utils::RateCounter,
    FILE_STRFTIME,
};
use chrono::Local;

/// Consumes training batches until `n_ep` epochs or `max_it` iterations are
/// done, then writes a final checkpoint.
pub fn training_worker(
    config: Arc<config::Config>,
    checkpoint_dir: impl AsRef<Path>,
    mut train_rx: mpsc::Receiver<msg::TrainingMessage>,
    log_tx: mpsc::Sender<msg::LogMessage>,
) -> Result<()> {
    let checkpoint_dir = checkpoint_dir.as_ref();
    let config::Training {
        device,
        batch_size,
        n_ep,
        n_ep_decay,
        lr_policy,
        d_iter,
        max_it,
        ref resume,
        seed,
        ..
    } = config.train;
    let config::Logging {
        save_image_steps,
        save_checkpoint_epochs,
        ..
    } = config.logging;
    let batch_size = batch_size.get() as i64;
    let d_iter = d_iter.get();

    if let Some(seed) = seed {
        tch::manual_seed(seed);
    }

    let mut model = DritInit::from_config(&config).build()?;
    let (mut ep, mut total_it) = match resume {
        Some(path) => {
            let (last_ep, total_it) = model.resume(path, true)?;
            info!(
                "resume from '{}' at epoch {}, iteration {}",
                path.display(),
                last_ep,
                total_it
            );
            (last_ep + 1, total_it)
        }
        None => {
            model.initialize();
            (0, 0)
        }
    };
    model.set_scheduler(lr_policy, n_ep, n_ep_decay, ep);

    if ep >= n_ep {
        info!("already trained for {} epochs", n_ep);
        return Ok(());
    }
    if let Some(max_it) = max_it {
        if total_it >= max_it {
            info!("already trained for {} iterations", max_it);
            return Ok(());
        }
    }

    let mut rate_counter = RateCounter::with_second_interval();
    let mut lr = model.learning_rate();
    info!("start training at epoch {}", ep);

    while let Some(msg) = train_rx.blocking_recv() {
        let msg::TrainingMessage {
            batch_index,
            num_batches,
            image_a,
            image_b,
        } = msg.to_device(device);

        let (n_a, _, _, _) = image_a.size4()?;
        let (n_b, _, _, _) = image_b.size4()?;

        if n_a != batch_size || n_b != batch_size {
            warn!(
                "skip batch {} with sizes ({}, {}), expect {}",
                batch_index, n_a, n_b, batch_size
            );
        } else if (batch_index + 1) % d_iter != 0 && batch_index + 2 < num_batches {
            // content critic only
            let dis_content = model.update_d_content(&image_a, &image_b)?;

            let log = msg::LossLog {
                epoch: ep,
                total_it,
                learning_rate: lr,
                dis_content: Some(dis_content),
                discriminator: None,
                generator: None,
            };
            if log_tx.blocking_send(msg::LogMessage::Loss(log)).is_err() {
                break;
            }
        } else {
            let (fr, dis_losses) = model.update_d(&image_a, &image_b)?;

            let save_image = save_image_steps
                .map(|steps| total_it % steps.get() == 0)
                .unwrap_or(false);
            let grid = if save_image {
                Some(Drit::assemble_outputs(&image_a, &image_b, &fr)?)
            } else {
                None
            };

            let gen_losses = model.update_eg(&image_a, &image_b, Some(fr))?;

            let log = msg::LossLog {
                epoch: ep,
                total_it,
                learning_rate: lr,
                dis_content: None,
                discriminator: Some(dis_losses),
                generator: Some(gen_losses),
            };
            if log_tx.blocking_send(msg::LogMessage::Loss(log)).is_err() {
                break;
            }

            if let Some(grid) = grid {
                let msg = msg::LogMessage::Image {
                    step: total_it,
                    image: grid.to_device(Device::Cpu),
                };
                if log_tx.blocking_send(msg).is_err() {
                    break;
                }
            }

            total_it += 1;

            if let Some(max_it) = max_it {
                if total_it >= max_it {
                    info!("reach max_it {}", max_it);
                    save_checkpoint(&model, checkpoint_dir, "last", ep, total_it)?;
                    return Ok(());
                }
            }
        }

        rate_counter.add(1.0);
        if let Some(batch_rate) = rate_counter.rate() {
            let sample_rate = batch_rate * batch_size as f64;
            info!(
                "epoch: {}\tit: {}\tlr: {:.6}\t{:.2} batch/s\t{:.2} sample/s",
                ep, total_it, lr, batch_rate, sample_rate
            );
        }

        // end of epoch
        if batch_index + 1 == num_batches {
            lr = model.update_lr();
            debug!("learning rate updated to {}", lr);

            if let Some(epochs) = save_checkpoint_epochs {
                if (ep + 1) % epochs.get() == 0 {
                    save_checkpoint(&model, checkpoint_dir, &format!("{:05}", ep), ep, total_it)?;
                }
            }

            info!("epoch {} finished, total iterations {}", ep, total_it);
            ep += 1;

            if ep >= n_ep {
                save_checkpoint(&model, checkpoint_dir, "last", ep - 1, total_it)?;
                return Ok(());
            }
        }
    }

    warn!("training data stream ended early at epoch {}", ep);
    Ok(())
}

fn save_checkpoint(
    model: &Drit,
    checkpoint_dir: &Path,
    tag: &str,
    ep: usize,
    total_it: usize,
) -> Result<()> {
    let filename = format!("drit_{}_{}.ckpt", Local::now().format(FILE_STRFTIME), tag);
    let path = checkpoint_dir.join(filename);
    model.save(&path, ep, total_it)?;
    info!("checkpoint saved to '{}'", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        checkpoint::CheckpointRecord,
        config::{Config, Dataset, Logging, LrPolicy, Model, Training},
        model::NormKind,
    };

    fn tiny_config(root: &Path) -> Config {
        Config {
            dataset: Dataset {
                dir: root.join("data"),
            },
            model: Model {
                input_dim_a: NonZeroUsize::new(3).unwrap(),
                input_dim_b: NonZeroUsize::new(3).unwrap(),
                dis_scale: NonZeroUsize::new(1).unwrap(),
                dis_norm: NormKind::None,
                dis_spectral_norm: false,
                concat: false,
                no_ms: false,
                base_channels: NonZeroUsize::new(4).unwrap(),
            },
            train: Training {
                device: Device::Cpu,
                batch_size: NonZeroUsize::new(2).unwrap(),
                half_size: NonZeroUsize::new(1).unwrap(),
                n_ep: 2,
                n_ep_decay: Some(1),
                lr_policy: LrPolicy::Lambda,
                d_iter: NonZeroUsize::new(3).unwrap(),
                max_it: None,
                resume: None,
                learning_rate: r64(1e-4),
                seed: Some(3),
            },
            logging: Logging {
                log_dir: root.join("logs"),
                save_image_steps: NonZeroUsize::new(1),
                save_checkpoint_epochs: NonZeroUsize::new(1),
            },
        }
    }

    #[test]
    fn training_worker_test() -> Result<()> {
        let root = std::env::temp_dir().join(format!("drit-train-{}", std::process::id()));
        let checkpoint_dir = root.join("checkpoints");
        fs::create_dir_all(&checkpoint_dir)?;
        let config = Arc::new(tiny_config(&root));

        let num_batches = 4;
        let (train_tx, train_rx) = mpsc::channel(16);
        let (log_tx, mut log_rx) = mpsc::channel(64);

        // two epochs plus a surplus batch that must not be consumed
        for batch_index in (0..num_batches).cycle().take(2 * num_batches + 1) {
            let msg = msg::TrainingMessage {
                batch_index,
                num_batches,
                image_a: Tensor::rand(&[2, 3, 4, 4], FLOAT_CPU),
                image_b: Tensor::rand(&[2, 3, 4, 4], FLOAT_CPU),
            };
            train_tx
                .try_send(msg)
                .map_err(|_| format_err!("channel is full"))?;
        }
        drop(train_tx);

        training_worker(config, &checkpoint_dir, train_rx, log_tx)?;

        let mut losses = vec![];
        let mut images = 0;
        while let Ok(msg) = log_rx.try_recv() {
            match msg {
                msg::LogMessage::Loss(log) => losses.push(log),
                msg::LogMessage::Image { .. } => images += 1,
            }
        }
        ensure!(losses.len() == 2 * num_batches);

        // batch 2 of 4 hits d_iter and batches 2, 3 are the last two of the epoch
        let full_steps = losses.iter().filter(|log| log.generator.is_some()).count();
        ensure!(full_steps == 4);
        ensure!(images == 4);
        ensure!(losses.last().map(|log| log.total_it) == Some(3));

        let checkpoints: Vec<_> = fs::read_dir(&checkpoint_dir)?
            .map(|entry| entry.map(|entry| entry.path()))
            .try_collect()?;
        ensure!(checkpoints.len() == 3);

        let last = checkpoints
            .iter()
            .find(|path| path.to_string_lossy().ends_with("_last.ckpt"))
            .ok_or_else(|| format_err!("missing final checkpoint"))?;
        let record = CheckpointRecord::load(last, Device::Cpu)?;
        ensure!(record.counter("ep")? == 1);
        ensure!(record.counter("total_it")? == 4);

        fs::remove_dir_all(&root)?;
        Ok(())
    }
}
