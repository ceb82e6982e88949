use crate::common::*;

#[derive(Debug, Clone)]
pub struct UnpairedDatasetInit<P>
where
    P: AsRef<Path>,
{
    pub dir: P,
}

impl<P> UnpairedDatasetInit<P>
where
    P: AsRef<Path>,
{
    pub async fn load(self) -> Result<UnpairedDataset> {
        let dir = self.dir.as_ref();
        let files_a = list_tensor_files(dir.join("trainA")).await?;
        let files_b = list_tensor_files(dir.join("trainB")).await?;

        ensure!(
            !files_a.is_empty() && !files_b.is_empty(),
            "both trainA and trainB under '{}' must contain *.pt files",
            dir.display()
        );
        info!(
            "{} images in domain A, {} images in domain B",
            files_a.len(),
            files_b.len()
        );

        Ok(UnpairedDataset { files_a, files_b })
    }
}

async fn list_tensor_files(dir: PathBuf) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(&dir)
        .await
        .with_context(|| format!("unable to read directory '{}'", dir.display()))?;

    let mut files = vec![];
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_tensor = path.extension().map_or(false, |ext| ext == "pt");
        if is_tensor && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }
    files.sort();

    Ok(files)
}

/// Two independent image collections sampled without pairing.
#[derive(Debug)]
pub struct UnpairedDataset {
    files_a: Vec<PathBuf>,
    files_b: Vec<PathBuf>,
}

impl UnpairedDataset {
    /// Samples per epoch, the size of the larger domain.
    pub fn len(&self) -> usize {
        self.files_a.len().max(self.files_b.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.len() / batch_size
    }

    /// Plans one epoch as batches of (A index, B index) pairs.
    ///
    /// The larger domain is walked in full while the other one is sampled at
    /// random. Pairs are shuffled and the incomplete last batch is dropped.
    pub fn epoch_batches<R>(&self, batch_size: usize, rng: &mut R) -> Vec<Vec<(usize, usize)>>
    where
        R: Rng,
    {
        let len_a = self.files_a.len();
        let len_b = self.files_b.len();

        let mut pairs: Vec<_> = (0..self.len())
            .map(|index| {
                if len_a >= len_b {
                    (index % len_a, rng.gen_range(0..len_b))
                } else {
                    (rng.gen_range(0..len_a), index % len_b)
                }
            })
            .collect();
        pairs.shuffle(rng);

        pairs
            .chunks_exact(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    /// Loads and stacks the images of one planned batch.
    pub async fn load_batch(&self, pairs: &[(usize, usize)]) -> Result<(Tensor, Tensor)> {
        let paths_a: Vec<_> = pairs
            .iter()
            .map(|&(index_a, _)| self.files_a[index_a].clone())
            .collect();
        let paths_b: Vec<_> = pairs
            .iter()
            .map(|&(_, index_b)| self.files_b[index_b].clone())
            .collect();

        tokio::task::spawn_blocking(move || -> Result<_> {
            let images_a: Vec<_> = paths_a.iter().map(|path| load_image(path)).try_collect()?;
            let images_b: Vec<_> = paths_b.iter().map(|path| load_image(path)).try_collect()?;
            let batch_a = Tensor::f_stack(&images_a, 0).context("domain A image sizes differ")?;
            let batch_b = Tensor::f_stack(&images_b, 0).context("domain B image sizes differ")?;
            Ok((batch_a, batch_b))
        })
        .await?
    }
}

fn load_image(path: &Path) -> Result<Tensor> {
    let image = Tensor::load(path)
        .with_context(|| format!("unable to load image '{}'", path.display()))?;
    ensure!(
        image.dim() == 3,
        "expect a (C, H, W) tensor in '{}', but get shape {:?}",
        path.display(),
        image.size()
    );
    Ok(image.to_kind(Kind::Float))
}
