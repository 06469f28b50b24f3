//! Registry of model families.
//!
//! Each model type (the `model_type` field of `config.json`) maps to a factory
//! building a [`CausalLM`] replica and optional loaders for its arguments.
//! The registry is an ordinary value: build it once, wrap it in an `Arc` and
//! hand it to the engine.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use candle_core::{DType, Device};
use tracing::warn;

use crate::error::{Error, Result};
use crate::model::{tiny, CausalLM, ModelArgs, QuantizationArgs};
use crate::parallel::ParallelArgs;

/// Builds one replica of a model on `device`.
pub type CausalLMFactory = Arc<
    dyn Fn(&ModelArgs, &QuantizationArgs, &ParallelArgs, DType, &Device) -> Result<Box<dyn CausalLM>>
        + Send
        + Sync,
>;

/// Reads [`ModelArgs`] from `config.json`.
pub type ModelArgsLoader = Arc<dyn Fn(&serde_json::Value) -> Result<ModelArgs> + Send + Sync>;

/// Reads [`QuantizationArgs`] from `config.json`.
pub type QuantArgsLoader =
    Arc<dyn Fn(&serde_json::Value) -> Result<QuantizationArgs> + Send + Sync>;

#[derive(Default, Clone)]
struct ModelMeta {
    causal_lm_factory: Option<CausalLMFactory>,
    model_args_loader: Option<ModelArgsLoader>,
    quant_args_loader: Option<QuantArgsLoader>,
}

/// Model type to factory and loaders.
///
/// Registering the same entry twice keeps the first one and logs a warning.
#[derive(Default, Clone)]
pub struct ModelRegistry {
    models: HashMap<String, ModelMeta>,
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.models.keys().collect();
        names.sort();
        f.debug_struct("ModelRegistry").field("models", &names).finish()
    }
}

impl ModelRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in families.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        tiny::register(&mut registry);
        registry
    }

    pub fn register_causal_lm(&mut self, name: &str, factory: CausalLMFactory) {
        let meta = self.models.entry(name.to_string()).or_default();
        if meta.causal_lm_factory.is_some() {
            warn!("causal lm factory for {name} already registered");
        } else {
            meta.causal_lm_factory = Some(factory);
        }
    }

    pub fn register_model_args_loader(&mut self, name: &str, loader: ModelArgsLoader) {
        let meta = self.models.entry(name.to_string()).or_default();
        if meta.model_args_loader.is_some() {
            warn!("model args loader for {name} already registered");
        } else {
            meta.model_args_loader = Some(loader);
        }
    }

    pub fn register_quant_args_loader(&mut self, name: &str, loader: QuantArgsLoader) {
        let meta = self.models.entry(name.to_string()).or_default();
        if meta.quant_args_loader.is_some() {
            warn!("quant args loader for {name} already registered");
        } else {
            meta.quant_args_loader = Some(loader);
        }
    }

    /// Factory for `name`.
    pub fn causal_lm_factory(&self, name: &str) -> Result<CausalLMFactory> {
        self.models
            .get(name)
            .and_then(|meta| meta.causal_lm_factory.clone())
            .ok_or_else(|| Error::UnknownModelType(name.to_string()))
    }

    /// Whether a factory is registered for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.models
            .get(name)
            .is_some_and(|meta| meta.causal_lm_factory.is_some())
    }

    /// Parse model args for `name`, with the family's loader if it has one.
    pub fn load_model_args(&self, name: &str, config: &serde_json::Value) -> Result<ModelArgs> {
        match self.models.get(name).and_then(|m| m.model_args_loader.as_ref()) {
            Some(loader) => loader(config),
            None => ModelArgs::from_json(config),
        }
    }

    /// Parse quantization args for `name`, with the family's loader if it has one.
    pub fn load_quant_args(
        &self,
        name: &str,
        config: &serde_json::Value,
    ) -> Result<QuantizationArgs> {
        match self.models.get(name).and_then(|m| m.quant_args_loader.as_ref()) {
            Some(loader) => loader(config),
            None => QuantizationArgs::from_json(config),
        }
    }

    /// Registered model types, sorted.
    pub fn model_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .models
            .iter()
            .filter(|(_, meta)| meta.causal_lm_factory.is_some())
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn failing_factory(msg: &'static str) -> CausalLMFactory {
        Arc::new(
            move |_: &ModelArgs,
                  _: &QuantizationArgs,
                  _: &ParallelArgs,
                  _: DType,
                  _: &Device|
                  -> Result<Box<dyn CausalLM>> { Err(Error::ModelInit(msg.to_string())) },
        )
    }

    #[test]
    fn test_defaults_include_tiny() {
        let registry = ModelRegistry::with_defaults();
        assert!(registry.contains("tiny"));
        assert_eq!(registry.model_types(), vec!["tiny"]);
    }

    #[test]
    fn test_unknown_model_type() {
        let registry = ModelRegistry::new();
        assert!(matches!(
            registry.causal_lm_factory("nope"),
            Err(Error::UnknownModelType(_))
        ));
    }

    #[test]
    fn test_duplicate_keeps_first() {
        let mut registry = ModelRegistry::new();
        registry.register_causal_lm("m", failing_factory("first"));
        registry.register_causal_lm("m", failing_factory("second"));

        let factory = registry.causal_lm_factory("m").unwrap();
        let err = factory(
            &ModelArgs::default(),
            &QuantizationArgs::default(),
            &ParallelArgs::single(),
            DType::F32,
            &Device::Cpu,
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("first"));
    }

    #[test]
    fn test_args_loaders() {
        let mut registry = ModelRegistry::new();
        let config = json!({"hidden_size": 8});
        assert_eq!(registry.load_model_args("m", &config).unwrap().hidden_size, 8);

        registry.register_model_args_loader(
            "m",
            Arc::new(|_: &serde_json::Value| -> Result<ModelArgs> {
                Ok(ModelArgs {
                    hidden_size: 99,
                    ..Default::default()
                })
            }),
        );
        assert_eq!(registry.load_model_args("m", &config).unwrap().hidden_size, 99);
        assert!(!registry.load_quant_args("m", &config).unwrap().is_quantized());
    }
}
