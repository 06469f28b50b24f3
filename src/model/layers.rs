//! Tensor-parallel building blocks.
//!
//! Each layer holds this rank's shard of its weights and reaches the other
//! ranks through [`ParallelArgs`]:
//!
//! ```text
//! ParallelEmbedding     weight [vocab, hidden / N]   -> all-gather on hidden
//! ColumnParallelLinear  weight [out / N, in]         -> optional all-gather on out
//! RowParallelLinear     weight [out, in / N]         -> all-reduce
//! ```
//!
//! With `N == 1` every collective is the identity.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::Linear;

use crate::error::{Error, Result};
use crate::model::StateDict;
use crate::parallel::ParallelArgs;

/// A parameter that has to be filled from a checkpoint.
#[derive(Debug, Clone)]
struct Parameter {
    tensor: Tensor,
    is_loaded: bool,
}

impl Parameter {
    fn zeros(shape: &[usize], dtype: DType, device: &Device) -> Result<Self> {
        Ok(Self {
            tensor: Tensor::zeros(shape, dtype, device)?,
            is_loaded: false,
        })
    }

    /// Copy `name`'s shard from `state_dict`; silently skip when absent.
    fn load(
        &mut self,
        state_dict: &StateDict,
        name: &str,
        shard_dim: Option<usize>,
        parallel_args: &ParallelArgs,
    ) -> Result<()> {
        let loaded = match shard_dim {
            Some(dim) => state_dict.get_sharded_tensor(
                name,
                dim,
                parallel_args.rank,
                parallel_args.world_size,
            )?,
            None => state_dict.get_tensor(name),
        };
        let Some(loaded) = loaded else {
            return Ok(());
        };

        if loaded.dims() != self.tensor.dims() {
            return Err(Error::WeightShapeMismatch {
                name: state_dict.full_name(name),
                expected: self.tensor.dims().to_vec(),
                actual: loaded.dims().to_vec(),
            });
        }
        self.tensor = loaded
            .to_dtype(self.tensor.dtype())?
            .to_device(self.tensor.device())?
            .contiguous()?;
        self.is_loaded = true;
        Ok(())
    }
}

fn check_divisible(what: &str, size: usize, world_size: usize) -> Result<usize> {
    if size % world_size != 0 {
        return Err(Error::ModelInit(format!(
            "{what} {size} not divisible by world_size {world_size}"
        )));
    }
    Ok(size / world_size)
}

/// Embedding table split along the embedding dimension.
#[derive(Debug, Clone)]
pub struct ParallelEmbedding {
    weight: Parameter,
    parallel_args: ParallelArgs,
}

impl ParallelEmbedding {
    /// Create an unloaded `[num_embeddings, embedding_dim / world_size]` table.
    pub fn new(
        num_embeddings: usize,
        embedding_dim: usize,
        parallel_args: &ParallelArgs,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let local_dim = check_divisible("embedding_dim", embedding_dim, parallel_args.world_size)?;
        Ok(Self {
            weight: Parameter::zeros(&[num_embeddings, local_dim], dtype, device)?,
            parallel_args: parallel_args.clone(),
        })
    }

    /// Look up `ids` (u32, `[num_tokens]`), returning `[num_tokens, embedding_dim]`.
    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let local = self.weight.tensor.index_select(ids, 0)?;
        self.parallel_args.all_gather_cat(&local, 1)
    }

    /// Load `weight` sharded on dim 1.
    pub fn load_state_dict(&mut self, state_dict: &StateDict) -> Result<()> {
        self.weight
            .load(state_dict, "weight", Some(1), &self.parallel_args)
    }

    /// Whether the weight was loaded.
    pub fn is_loaded(&self) -> bool {
        self.weight.is_loaded
    }

    /// This rank's shard of the table.
    pub fn weight(&self) -> &Tensor {
        &self.weight.tensor
    }
}

/// Linear layer split along the output dimension.
#[derive(Debug, Clone)]
pub struct ColumnParallelLinear {
    weight: Parameter,
    bias: Option<Parameter>,
    gather_output: bool,
    parallel_args: ParallelArgs,
}

impl ColumnParallelLinear {
    /// Create an unloaded `[out_features / world_size, in_features]` layer.
    ///
    /// With `gather_output` the forward pass returns the full output on every
    /// rank; otherwise only this rank's columns.
    pub fn new(
        in_features: usize,
        out_features: usize,
        bias: bool,
        gather_output: bool,
        parallel_args: &ParallelArgs,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let local_out = check_divisible("out_features", out_features, parallel_args.world_size)?;
        let bias = if bias {
            Some(Parameter::zeros(&[local_out], dtype, device)?)
        } else {
            None
        };
        Ok(Self {
            weight: Parameter::zeros(&[local_out, in_features], dtype, device)?,
            bias,
            gather_output,
            parallel_args: parallel_args.clone(),
        })
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let linear = Linear::new(
            self.weight.tensor.clone(),
            self.bias.as_ref().map(|b| b.tensor.clone()),
        );
        let output = linear.forward(input)?;
        if self.gather_output {
            let last = output.rank() - 1;
            return self.parallel_args.all_gather_cat(&output, last);
        }
        Ok(output)
    }

    /// Load `weight` and `bias`, both sharded on dim 0.
    pub fn load_state_dict(&mut self, state_dict: &StateDict) -> Result<()> {
        self.weight
            .load(state_dict, "weight", Some(0), &self.parallel_args)?;
        if let Some(bias) = self.bias.as_mut() {
            bias.load(state_dict, "bias", Some(0), &self.parallel_args)?;
        }
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.weight.is_loaded && self.bias.as_ref().map_or(true, |b| b.is_loaded)
    }
}

/// Linear layer split along the input dimension.
///
/// Expects its input already split the same way (the output of a
/// [`ColumnParallelLinear`] without gathering) and all-reduces the partial
/// products.
#[derive(Debug, Clone)]
pub struct RowParallelLinear {
    weight: Parameter,
    bias: Option<Parameter>,
    parallel_args: ParallelArgs,
}

impl RowParallelLinear {
    /// Create an unloaded `[out_features, in_features / world_size]` layer.
    pub fn new(
        in_features: usize,
        out_features: usize,
        bias: bool,
        parallel_args: &ParallelArgs,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let local_in = check_divisible("in_features", in_features, parallel_args.world_size)?;
        let bias = if bias {
            Some(Parameter::zeros(&[out_features], dtype, device)?)
        } else {
            None
        };
        Ok(Self {
            weight: Parameter::zeros(&[out_features, local_in], dtype, device)?,
            bias,
            parallel_args: parallel_args.clone(),
        })
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let partial = Linear::new(self.weight.tensor.clone(), None).forward(input)?;
        let output = self.parallel_args.all_reduce(&partial)?;
        // Bias is added once, after the reduction.
        match &self.bias {
            Some(bias) => Ok(output.broadcast_add(&bias.tensor)?),
            None => Ok(output),
        }
    }

    /// Load `weight` sharded on dim 1 and the unsharded `bias`.
    pub fn load_state_dict(&mut self, state_dict: &StateDict) -> Result<()> {
        self.weight
            .load(state_dict, "weight", Some(1), &self.parallel_args)?;
        if let Some(bias) = self.bias.as_mut() {
            bias.load(state_dict, "bias", None, &self.parallel_args)?;
        }
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.weight.is_loaded && self.bias.as_ref().map_or(true, |b| b.is_loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn state_dict(entries: Vec<(&str, Tensor)>) -> StateDict {
        StateDict::new(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<HashMap<_, _>>(),
        )
    }

    #[test]
    fn test_embedding_load_and_forward() {
        let args = ParallelArgs::single();
        let mut embed = ParallelEmbedding::new(3, 2, &args, DType::F32, &Device::Cpu).unwrap();
        assert!(!embed.is_loaded());

        let weight = Tensor::new(&[[1f32, 2.], [3., 4.], [5., 6.]], &Device::Cpu).unwrap();
        embed
            .load_state_dict(&state_dict(vec![("weight", weight)]))
            .unwrap();
        assert!(embed.is_loaded());

        let ids = Tensor::new(&[2u32, 0], &Device::Cpu).unwrap();
        let out = embed.forward(&ids).unwrap();
        assert_eq!(out.to_vec2::<f32>().unwrap(), vec![vec![5., 6.], vec![1., 2.]]);
    }

    #[test]
    fn test_shape_mismatch_is_fatal() {
        let args = ParallelArgs::single();
        let mut linear =
            ColumnParallelLinear::new(4, 2, false, false, &args, DType::F32, &Device::Cpu).unwrap();
        let wrong = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let err = linear
            .load_state_dict(&state_dict(vec![("weight", wrong)]))
            .unwrap_err();
        match err {
            Error::WeightShapeMismatch {
                name,
                expected,
                actual,
            } => {
                assert_eq!(name, "weight");
                assert_eq!(expected, vec![2, 4]);
                assert_eq!(actual, vec![3, 4]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!linear.is_loaded());
    }

    #[test]
    fn test_missing_names_are_skipped() {
        let args = ParallelArgs::single();
        let mut linear =
            RowParallelLinear::new(2, 2, true, &args, DType::F32, &Device::Cpu).unwrap();
        let weight = Tensor::new(&[[1f32, 0.], [0., 1.]], &Device::Cpu).unwrap();
        linear
            .load_state_dict(&state_dict(vec![
                ("weight", weight),
                ("other", Tensor::new(&[0f32], &Device::Cpu).unwrap()),
            ]))
            .unwrap();
        // Bias not seen yet.
        assert!(!linear.is_loaded());

        let bias = Tensor::new(&[10f32, 20.], &Device::Cpu).unwrap();
        linear
            .load_state_dict(&state_dict(vec![("bias", bias)]))
            .unwrap();
        assert!(linear.is_loaded());

        let x = Tensor::new(&[[1f32, 2.]], &Device::Cpu).unwrap();
        assert_eq!(
            linear.forward(&x).unwrap().to_vec2::<f32>().unwrap(),
            vec![vec![11., 22.]]
        );
    }

    #[test]
    fn test_column_linear_forward() {
        let args = ParallelArgs::single();
        let mut linear =
            ColumnParallelLinear::new(2, 3, false, true, &args, DType::F32, &Device::Cpu).unwrap();
        let weight = Tensor::new(&[[1f32, 0.], [0., 1.], [1., 1.]], &Device::Cpu).unwrap();
        linear
            .load_state_dict(&state_dict(vec![("weight", weight)]))
            .unwrap();
        let x = Tensor::new(&[[2f32, 3.]], &Device::Cpu).unwrap();
        assert_eq!(
            linear.forward(&x).unwrap().to_vec2::<f32>().unwrap(),
            vec![vec![2., 3., 5.]]
        );
    }
}
