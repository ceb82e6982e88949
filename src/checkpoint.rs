use crate::{common::*, optim::Adam};

/// A flat collection of named tensors persisted in a single file.
///
/// Network parameters are stored as `<key>.<var>`, optimizer state as
/// `<key>_opt.<state>` and counters as int64 scalars.
#[derive(Debug, Default)]
pub struct CheckpointRecord {
    tensors: HashMap<String, Tensor>,
}

impl CheckpointRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: impl AsRef<Path>, device: Device) -> Result<Self> {
        let path = path.as_ref();
        let tensors: HashMap<_, _> = Tensor::load_multi_with_device(path, device)
            .with_context(|| format!("unable to load checkpoint '{}'", path.display()))?
            .into_iter()
            .collect();
        Ok(Self { tensors })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let named: Vec<_> = self
            .tensors
            .iter()
            .sorted_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs))
            .map(|(name, tensor)| (name.as_str(), tensor))
            .collect();
        Tensor::save_multi(&named, path)
            .with_context(|| format!("unable to save checkpoint '{}'", path.display()))?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<&Tensor> {
        self.tensors
            .get(key)
            .ok_or_else(|| format_err!("checkpoint entry '{}' is missing", key))
    }

    pub fn insert_network(&mut self, key: &str, vs: &nn::VarStore) {
        for (name, var) in vs.variables() {
            self.tensors
                .insert(format!("{}.{}", key, name), var.detach().copy());
        }
    }

    pub fn insert_optimizer(&mut self, key: &str, opt: &Adam) {
        for (name, tensor) in opt.state_tensors() {
            self.tensors
                .insert(format!("{}_opt.{}", key, name), tensor.detach().copy());
        }
    }

    pub fn insert_counter(&mut self, key: &str, value: i64) {
        self.tensors.insert(key.to_string(), Tensor::from(value));
    }

    pub fn counter(&self, key: &str) -> Result<i64> {
        Ok(self.get(key)?.int64_value(&[]))
    }

    /// Overwrites every variable of `vs` with its stored value.
    pub fn restore_network(&self, key: &str, vs: &nn::VarStore) -> Result<()> {
        for (name, mut var) in vs.variables() {
            let entry = format!("{}.{}", key, name);
            let src = self.get(&entry)?;
            ensure!(
                src.size() == var.size(),
                "shape mismatch for '{}': expect {:?}, but get {:?}",
                entry,
                var.size(),
                src.size()
            );
            tch::no_grad(|| var.f_copy_(src))?;
        }
        Ok(())
    }

    pub fn restore_optimizer(&self, key: &str, opt: &mut Adam) -> Result<()> {
        opt.load_state_tensors(|name| {
            let src = self.get(&format!("{}_opt.{}", key, name))?;
            Ok(src.shallow_clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::AdamInit;

    fn fixture(fill: f64) -> Result<(nn::VarStore, Adam)> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let _ = root.var("weight", &[2, 3], nn::Init::Const(fill));
        let _ = root.ones_no_train("buffer", &[3]);
        let opt = AdamInit::default().build(&vs, 1e-3)?;
        Ok((vs, opt))
    }

    #[test]
    fn checkpoint_file_round_trip_test() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("drit-checkpoint-{}", std::process::id()));
        fs::create_dir_all(&dir)?;
        let path = dir.join("record.ckpt");

        let (vs, mut opt) = fixture(0.5)?;
        let loss = vs.trainable_variables()[0].square().sum(Kind::Float);
        opt.zero_grad();
        loss.backward();
        opt.step();

        let mut record = CheckpointRecord::new();
        record.insert_network("net", &vs);
        record.insert_optimizer("net", &opt);
        record.insert_counter("ep", 3);
        record.save(&path)?;

        let loaded = CheckpointRecord::load(&path, Device::Cpu)?;
        ensure!(loaded.tensors.len() == record.tensors.len());
        ensure!(loaded.counter("ep")? == 3);

        let (other_vs, mut other_opt) = fixture(0.0)?;
        loaded.restore_network("net", &other_vs)?;
        loaded.restore_optimizer("net", &mut other_opt)?;

        for (name, var) in vs.variables() {
            ensure!(var.equal(&other_vs.variables()[&name]), "{} differs", name);
        }
        ensure!(other_opt.step_count() == 1);

        ensure!(loaded.counter("total_it").is_err());
        ensure!(loaded.restore_network("other", &other_vs).is_err());

        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
