//! Named tensors from one weight shard.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use candle_core::{Device, Tensor};

use crate::error::{Error, Result};

/// A shard of named tensors, viewed through an optional name prefix.
///
/// Cloning and [`StateDict::select`] share the underlying tensors, so the same
/// shard can be handed to every worker.
///
/// # Example
///
/// ```
/// use std::collections::HashMap;
/// use candle_core::{Device, Tensor};
/// use paged_llm::model::StateDict;
///
/// let mut tensors = HashMap::new();
/// tensors.insert("layers.0.weight".to_string(), Tensor::zeros(4, candle_core::DType::F32, &Device::Cpu).unwrap());
/// let shard = StateDict::new(tensors);
///
/// let layer = shard.select("layers.0.");
/// assert!(layer.get_tensor("weight").is_some());
/// assert_eq!(layer.full_name("weight"), "layers.0.weight");
/// ```
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    tensors: Arc<HashMap<String, Tensor>>,
    prefix: String,
}

impl StateDict {
    /// Wrap a map of tensors.
    pub fn new(tensors: HashMap<String, Tensor>) -> Self {
        Self {
            tensors: Arc::new(tensors),
            prefix: String::new(),
        }
    }

    /// Load every tensor of a safetensors file into host memory.
    pub fn from_safetensors(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, &Device::Cpu).map_err(|e| {
            Error::ModelLoad(format!("failed to read {}: {e}", path.display()))
        })?;
        Ok(Self::new(tensors))
    }

    /// Name of `name` as stored in the shard.
    pub fn full_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Tensor `name` under the current prefix, if the shard has it.
    pub fn get_tensor(&self, name: &str) -> Option<Tensor> {
        self.tensors.get(&self.full_name(name)).cloned()
    }

    /// This rank's slice of tensor `name`, split evenly along `dim`.
    ///
    /// Returns `Ok(None)` when the shard does not contain `name`.
    pub fn get_sharded_tensor(
        &self,
        name: &str,
        dim: usize,
        rank: usize,
        world_size: usize,
    ) -> Result<Option<Tensor>> {
        let Some(tensor) = self.get_tensor(name) else {
            return Ok(None);
        };
        if world_size <= 1 {
            return Ok(Some(tensor));
        }

        let size = tensor.dim(dim)?;
        if size % world_size != 0 {
            return Err(Error::ModelLoad(format!(
                "{}: dim {dim} of size {size} cannot be split across {world_size} ranks",
                self.full_name(name)
            )));
        }
        let chunk = size / world_size;
        Ok(Some(tensor.narrow(dim, rank * chunk, chunk)?))
    }

    /// View of the tensors whose names start with `prefix`, with it stripped.
    pub fn select(&self, prefix: &str) -> StateDict {
        StateDict {
            tensors: Arc::clone(&self.tensors),
            prefix: self.full_name(prefix),
        }
    }

    /// Names visible under the current prefix, with the prefix stripped.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors
            .keys()
            .filter_map(|name| name.strip_prefix(self.prefix.as_str()))
    }

    /// Number of tensors visible under the current prefix.
    pub fn len(&self) -> usize {
        self.names().count()
    }

    /// Whether no tensor is visible under the current prefix.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn shard() -> StateDict {
        let mut tensors = HashMap::new();
        tensors.insert(
            "embed.weight".to_string(),
            Tensor::arange(0f32, 12., &Device::Cpu)
                .unwrap()
                .reshape((3, 4))
                .unwrap(),
        );
        tensors.insert(
            "head.weight".to_string(),
            Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap(),
        );
        StateDict::new(tensors)
    }

    #[test]
    fn test_select_and_get() {
        let sd = shard();
        assert_eq!(sd.len(), 2);

        let embed = sd.select("embed.");
        assert_eq!(embed.len(), 1);
        assert!(embed.get_tensor("weight").is_some());
        assert!(embed.get_tensor("bias").is_none());
        assert_eq!(embed.names().collect::<Vec<_>>(), vec!["weight"]);
    }

    #[test]
    fn test_sharded_tensor() {
        let embed = shard().select("embed.");

        let rank1 = embed.get_sharded_tensor("weight", 1, 1, 2).unwrap().unwrap();
        assert_eq!(rank1.dims(), &[3, 2]);
        assert_eq!(
            rank1.to_vec2::<f32>().unwrap(),
            vec![vec![2.0, 3.0], vec![6.0, 7.0], vec![10.0, 11.0]]
        );

        assert!(embed.get_sharded_tensor("weight", 0, 0, 2).is_err());
        assert!(embed.get_sharded_tensor("missing", 0, 0, 2).unwrap().is_none());
    }
}
