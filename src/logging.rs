use crate::{common::*, message as msg};
use tokio::io::AsyncWriteExt;

/// Appends every loss record to `losses.jsonl` and stores display grids under
/// `images/` until the sender side is dropped.
pub async fn logging_worker(
    log_dir: impl AsRef<Path>,
    mut log_rx: mpsc::Receiver<msg::LogMessage>,
) -> Result<()> {
    let log_dir = log_dir.as_ref();
    let image_dir = log_dir.join("images");
    tokio::fs::create_dir_all(&image_dir).await?;

    let mut loss_file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("losses.jsonl"))
        .await?;

    while let Some(msg) = log_rx.recv().await {
        match msg {
            msg::LogMessage::Loss(log) => {
                let mut line = serde_json::to_string(&log)?;
                line.push('\n');
                loss_file.write_all(line.as_bytes()).await?;
            }
            msg::LogMessage::Image { step, image } => {
                let path = image_dir.join(format!("{:08}.pt", step));
                debug!("save image grid to '{}'", path.display());
                tokio::task::spawn_blocking(move || image.save(&path)).await??;
            }
        }
    }

    loss_file.flush().await?;
    Ok(())
}
