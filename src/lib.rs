pub mod checkpoint;
pub mod common;
pub mod config;
pub mod dataset;
pub mod logging;
pub mod message;
pub mod model;
pub mod optim;
pub mod train;
pub mod utils;

pub(crate) const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

use crate::common::*;
use chrono::Local;

pub async fn start(config: config::Config) -> Result<()> {
    // data logging
    let start_time = Local::now();
    let log_dir = config
        .logging
        .log_dir
        .join(format!("{}", start_time.format(FILE_STRFTIME)));
    let checkpoint_dir = log_dir.join("checkpoints");

    tokio::fs::create_dir_all(&checkpoint_dir).await?;
    tokio::fs::write(
        log_dir.join("config.json"),
        serde_json::to_string_pretty(&config)?,
    )
    .await?;
    info!("log to '{}'", log_dir.display());

    // load dataset
    let dataset = dataset::UnpairedDatasetInit {
        dir: &config.dataset.dir,
    }
    .load()
    .await?;
    let batch_size = config.train.batch_size.get();
    let num_batches = dataset.num_batches(batch_size);
    ensure!(
        num_batches > 0,
        "the dataset of {} samples cannot fill a batch of {}",
        dataset.len(),
        batch_size
    );

    let config = Arc::new(config);
    let (train_tx, train_rx) = mpsc::channel(2);
    let (log_tx, log_rx) = mpsc::channel(4);

    // data stream to channel worker
    let data_fut = {
        let mut rng = match config.train.seed {
            Some(seed) => StdRng::seed_from_u64(seed as u64),
            None => StdRng::from_entropy(),
        };

        tokio::task::spawn(async move {
            'epoch: loop {
                let batches = dataset.epoch_batches(batch_size, &mut rng);

                for (batch_index, pairs) in batches.iter().enumerate() {
                    let (image_a, image_b) = dataset.load_batch(pairs).await?;
                    let msg = message::TrainingMessage {
                        batch_index,
                        num_batches,
                        image_a,
                        image_b,
                    };

                    let result = train_tx.send(msg).await;
                    if result.is_err() {
                        break 'epoch;
                    }
                }
            }

            Fallible::Ok(())
        })
        .map(|result| Fallible::Ok(result??))
    };

    // training worker
    let train_fut = {
        let config = config.clone();
        let checkpoint_dir = checkpoint_dir.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            train::training_worker(config, checkpoint_dir, train_rx, log_tx)
        })
        .map(|result| Fallible::Ok(result??))
    };

    let log_fut = {
        let log_dir = log_dir.clone();

        tokio::task::spawn(logging::logging_worker(log_dir, log_rx))
            .map(|result| Fallible::Ok(result??))
    };

    // run all tasks
    futures::try_join!(data_fut, train_fut, log_fut)?;

    Ok(())
}
