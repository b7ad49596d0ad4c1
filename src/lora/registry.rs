// src/lora/registry.rs
// Parameters are keyed by TensorId; the trainable flag is mirrored onto the tensor.

use super::adapter::{AdaptedWeight, LowRankAdapter};
use crate::autograd::{Tensor, TensorId};
use crate::config::LoraConfig;
use crate::error::{LoraError, Result};
use crate::layers::{DenseWeight, Linear};
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::SeedableRng;
use std::rc::Rc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamRole {
    Weight,
    Bias,
    LoraA,
    LoraB,
}

impl ParamRole {
    pub fn is_adapter_factor(self) -> bool {
        matches!(self, ParamRole::LoraA | ParamRole::LoraB)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamInfo {
    pub id: TensorId,
    pub layer: String,
    pub role: ParamRole,
    pub shape: Vec<usize>,
    pub trainable: bool,
}

impl ParamInfo {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParameterCount {
    pub base: usize,
    pub adapter: usize,
}

impl ParameterCount {
    pub fn total(&self) -> usize {
        self.base + self.adapter
    }

    pub fn adapter_ratio(&self) -> f64 {
        if self.base == 0 {
            0.0
        } else {
            self.adapter as f64 / self.base as f64
        }
    }
}

struct ParamEntry {
    info: ParamInfo,
    tensor: Tensor,
}

struct AdaptedLayer {
    name: String,
    base_id: TensorId,
    adapter: Rc<LowRankAdapter>,
}

pub struct LayerAdaptationRegistry {
    params: Vec<ParamEntry>,
    layers: Vec<AdaptedLayer>,
    rng: StdRng,
}

impl Default for LayerAdaptationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerAdaptationRegistry {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            params: Vec::new(),
            layers: Vec::new(),
            rng,
        }
    }

    fn contains(&self, id: TensorId) -> bool {
        self.params.iter().any(|p| p.info.id == id)
    }

    fn register(&mut self, layer: &str, role: ParamRole, tensor: &Tensor) {
        if self.contains(tensor.id()) {
            return;
        }
        self.params.push(ParamEntry {
            info: ParamInfo {
                id: tensor.id(),
                layer: layer.to_string(),
                role,
                shape: tensor.shape(),
                trainable: tensor.requires_grad(),
            },
            tensor: tensor.clone(),
        });
    }

    pub fn track(&mut self, name: &str, layer: &Linear) {
        self.register(name, ParamRole::Weight, layer.base_weight());
        if let Some(bias) = &layer.bias {
            self.register(name, ParamRole::Bias, bias);
        }
    }

    pub fn attach(&mut self, name: &str, layer: &mut Linear, config: LoraConfig) -> Result<Rc<LowRankAdapter>> {
        config.validate()?;
        if layer.is_adapted() || self.layers.iter().any(|l| l.name == name) {
            return Err(LoraError::AlreadyAdapted {
                layer: name.to_string(),
            });
        }

        self.track(name, layer);

        let base = layer.base_weight().clone();
        let adapter = Rc::new(LowRankAdapter::for_weight(
            &base,
            config.rank,
            config.alpha,
            &mut self.rng,
        )?);
        let provider = AdaptedWeight::new(base.clone(), adapter.clone())?;

        self.register(name, ParamRole::LoraA, adapter.lora_a());
        self.register(name, ParamRole::LoraB, adapter.lora_b());
        layer.replace_weight_provider(Box::new(provider));

        debug!(
            layer = name,
            shape = ?base.shape(),
            rank = config.rank,
            alpha = config.alpha,
            "attached LoRA adapter"
        );

        self.layers.push(AdaptedLayer {
            name: name.to_string(),
            base_id: base.id(),
            adapter: adapter.clone(),
        });
        Ok(adapter)
    }

    // the removed adapter stays disabled for anyone still holding it
    pub fn detach(&mut self, name: &str, layer: &mut Linear) -> Result<()> {
        let pos = self
            .layers
            .iter()
            .position(|l| l.name == name && l.base_id == layer.base_weight().id())
            .ok_or_else(|| LoraError::NotAdapted {
                layer: name.to_string(),
            })?;
        let removed = self.layers.remove(pos);

        let base = layer.base_weight().clone();
        layer.replace_weight_provider(Box::new(DenseWeight::new(base)));
        removed.adapter.set_enabled(false);

        let a_id = removed.adapter.lora_a().id();
        let b_id = removed.adapter.lora_b().id();
        self.params.retain(|p| p.info.id != a_id && p.info.id != b_id);

        debug!(layer = name, "detached LoRA adapter");
        Ok(())
    }

    pub fn set_all_enabled(&self, enabled: bool) {
        for layer in &self.layers {
            layer.adapter.set_enabled(enabled);
        }
        info!(enabled, adapters = self.layers.len(), "toggled LoRA adapters");
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let adapter = self.adapter(name).ok_or_else(|| LoraError::NotAdapted {
            layer: name.to_string(),
        })?;
        adapter.set_enabled(enabled);
        Ok(())
    }

    fn mark(&mut self, trainable: bool, predicate: impl Fn(&ParamInfo) -> bool) -> usize {
        let mut changed = 0;
        for entry in &mut self.params {
            if entry.info.trainable != trainable && predicate(&entry.info) {
                entry.info.trainable = trainable;
                entry.tensor.set_requires_grad(trainable);
                changed += 1;
            }
        }
        changed
    }

    /// Returns how many parameters changed state.
    pub fn freeze(&mut self, predicate: impl Fn(&ParamInfo) -> bool) -> usize {
        let n = self.mark(false, predicate);
        debug!(frozen = n, "froze parameters");
        n
    }

    pub fn unfreeze(&mut self, predicate: impl Fn(&ParamInfo) -> bool) -> usize {
        let n = self.mark(true, predicate);
        debug!(unfrozen = n, "unfroze parameters");
        n
    }

    pub fn param_info(&self, id: TensorId) -> Option<&ParamInfo> {
        self.params.iter().find(|p| p.info.id == id).map(|p| &p.info)
    }

    pub fn parameters(&self) -> impl Iterator<Item = &ParamInfo> {
        self.params.iter().map(|p| &p.info)
    }

    pub fn trainable_parameters(&self) -> Vec<Tensor> {
        self.params
            .iter()
            .filter(|p| p.info.trainable)
            .map(|p| p.tensor.clone())
            .collect()
    }

    pub fn count_parameters(&self) -> ParameterCount {
        let mut count = ParameterCount::default();
        for entry in &self.params {
            if entry.info.role.is_adapter_factor() {
                count.adapter += entry.info.numel();
            } else {
                count.base += entry.info.numel();
            }
        }
        debug_assert_eq!(
            count.adapter,
            self.layers.iter().map(|l| l.adapter.num_parameters()).sum::<usize>()
        );
        count
    }

    pub fn adapter(&self, name: &str) -> Option<&Rc<LowRankAdapter>> {
        self.layers.iter().find(|l| l.name == name).map(|l| &l.adapter)
    }

    pub fn adapters(&self) -> impl Iterator<Item = (&str, &Rc<LowRankAdapter>)> {
        self.layers.iter().map(|l| (l.name.as_str(), &l.adapter))
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::no_grad;
    use crate::module::Module;
    use crate::ops::matmul::matmul;
    use ndarray::{arr2, ArrayD, IxDyn};

    fn layers() -> Vec<(&'static str, Linear)> {
        let mut rng = StdRng::seed_from_u64(1);
        vec![
            ("fc1", Linear::new_with_rng(6, 5, &mut rng)),
            ("fc2", Linear::new_with_rng(5, 3, &mut rng)),
        ]
    }

    #[test]
    fn attach_keeps_base_and_bias_and_starts_as_identity() {
        let mut registry = LayerAdaptationRegistry::with_seed(0);
        let mut layer = Linear::new(4, 3);
        let base_id = layer.base_weight().id();
        let bias_id = layer.bias.as_ref().unwrap().id();
        let before = layer.weight().data();

        registry.attach("fc", &mut layer, LoraConfig::new(2, 4.0)).unwrap();

        assert!(layer.is_adapted());
        assert_eq!(layer.base_weight().id(), base_id);
        assert_eq!(layer.bias.as_ref().unwrap().id(), bias_id);
        assert_eq!(no_grad(|| layer.weight()).data(), before);
    }

    #[test]
    fn double_attach_is_an_error() {
        let mut registry = LayerAdaptationRegistry::with_seed(0);
        let mut layer = Linear::new(4, 3);
        registry.attach("fc", &mut layer, LoraConfig::default()).unwrap();

        let err = registry.attach("fc", &mut layer, LoraConfig::default()).unwrap_err();
        assert!(matches!(err, LoraError::AlreadyAdapted { .. }));

        let mut other = Linear::new(4, 3);
        let err = registry.attach("fc", &mut other, LoraConfig::default()).unwrap_err();
        assert!(matches!(err, LoraError::AlreadyAdapted { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn attach_rejects_zero_rank() {
        let mut registry = LayerAdaptationRegistry::with_seed(0);
        let mut layer = Linear::new(4, 3);
        let err = registry.attach("fc", &mut layer, LoraConfig::new(0, 1.0)).unwrap_err();
        assert!(matches!(err, LoraError::InvalidRank { rank: 0 }));
        assert!(!layer.is_adapted());
    }

    #[test]
    fn forward_reads_weight_through_adapter() {
        let mut registry = LayerAdaptationRegistry::with_seed(3);
        let mut layer = Linear::new(2, 2);
        layer.bias = None;
        *layer.base_weight().data_mut() = arr2(&[[1.0, 0.0], [0.0, 1.0]]).into_dyn();
        let adapter = registry.attach("fc", &mut layer, LoraConfig::new(1, 1.0)).unwrap();
        *adapter.lora_a().data_mut() = arr2(&[[1.0, 1.0]]).into_dyn();
        *adapter.lora_b().data_mut() = arr2(&[[1.0], [0.0]]).into_dyn();

        let x = Tensor::from_data_no_grad(arr2(&[[1.0, 2.0]]).into_dyn());
        let y = no_grad(|| layer.forward(x.clone())).data();
        // W_eff = [[2, 1], [0, 1]] -> x @ W_eff^T = [4, 2]
        assert_eq!(y, arr2(&[[4.0, 2.0]]).into_dyn());

        registry.set_all_enabled(false);
        let y = no_grad(|| layer.forward(x.clone())).data();
        assert_eq!(y, arr2(&[[1.0, 2.0]]).into_dyn());
    }

    #[test]
    fn count_matches_rank_times_dimensions() {
        let mut registry = LayerAdaptationRegistry::with_seed(0);
        let mut layers = layers();
        for (name, layer) in layers.iter_mut() {
            registry.attach(name, layer, LoraConfig::new(2, 1.0)).unwrap();
        }
        let count = registry.count_parameters();
        assert_eq!(count.adapter, 2 * (5 + 6) + 2 * (3 + 5));
        assert_eq!(count.base, 5 * 6 + 5 + 3 * 5 + 3);
        assert_eq!(count.total(), count.base + count.adapter);
    }

    #[test]
    fn freeze_leaves_only_adapter_factors_trainable() {
        let mut registry = LayerAdaptationRegistry::with_seed(0);
        let mut layers = layers();
        for (name, layer) in layers.iter_mut() {
            registry.attach(name, layer, LoraConfig::default()).unwrap();
        }

        let frozen = registry.freeze(|p| !p.role.is_adapter_factor());
        assert_eq!(frozen, 4);
        assert_eq!(registry.trainable_parameters().len(), 4);
        for (_, layer) in &layers {
            assert!(!layer.base_weight().requires_grad());
        }
        // Freezing again changes nothing.
        assert_eq!(registry.freeze(|p| !p.role.is_adapter_factor()), 0);

        let thawed = registry.unfreeze(|p| p.role == ParamRole::Bias);
        assert_eq!(thawed, 2);
        assert!(layers[0].1.bias.as_ref().unwrap().requires_grad());
    }

    #[test]
    fn frozen_base_receives_no_gradient() {
        let mut registry = LayerAdaptationRegistry::with_seed(9);
        let mut layer = Linear::new(3, 2);
        let adapter = registry.attach("fc", &mut layer, LoraConfig::new(1, 1.0)).unwrap();
        registry.freeze(|p| !p.role.is_adapter_factor());

        let x = Tensor::from_data_no_grad(ArrayD::ones(IxDyn(&[4, 3])));
        layer.forward(x).sum().backward();

        assert!(layer.base_weight().grad().is_none());
        assert!(layer.bias.as_ref().unwrap().grad().is_none());
        assert!(adapter.lora_b().grad().is_some());
    }

    #[test]
    fn attaching_later_does_not_unfreeze() {
        let mut registry = LayerAdaptationRegistry::with_seed(0);
        let mut layers = layers();
        registry.track("fc2", &layers[1].1);
        registry.freeze(|_| true);

        let (name, layer) = &mut layers[1];
        registry.attach(name, layer, LoraConfig::default()).unwrap();
        assert!(!layer.base_weight().requires_grad());
        let info = registry.param_info(layer.base_weight().id()).unwrap();
        assert!(!info.trainable);
        assert_eq!(info.role, ParamRole::Weight);
    }

    #[test]
    fn detach_restores_dense_weight() {
        let mut registry = LayerAdaptationRegistry::with_seed(0);
        let mut layer = Linear::new(3, 3);
        let adapter = registry.attach("fc", &mut layer, LoraConfig::default()).unwrap();
        adapter.lora_b().data_mut().fill(1.0);

        registry.detach("fc", &mut layer).unwrap();
        assert!(!layer.is_adapted());
        assert!(!adapter.is_enabled());
        assert_eq!(layer.weight().id(), layer.base_weight().id());
        assert_eq!(registry.count_parameters().adapter, 0);

        let err = registry.detach("fc", &mut layer).unwrap_err();
        assert!(matches!(err, LoraError::NotAdapted { .. }));
        // A detached layer can be adapted again.
        registry.attach("fc", &mut layer, LoraConfig::default()).unwrap();
    }

    #[test]
    fn set_enabled_targets_one_layer() {
        let mut registry = LayerAdaptationRegistry::with_seed(0);
        let mut layers = layers();
        for (name, layer) in layers.iter_mut() {
            registry.attach(name, layer, LoraConfig::default()).unwrap();
        }
        registry.set_enabled("fc1", false).unwrap();
        assert!(!registry.adapter("fc1").unwrap().is_enabled());
        assert!(registry.adapter("fc2").unwrap().is_enabled());
        assert!(registry.set_enabled("nope", true).is_err());
    }

    #[test]
    fn adapter_gradient_matches_manual_formula() {
        let mut registry = LayerAdaptationRegistry::with_seed(5);
        let mut layer = Linear::new(2, 2);
        layer.bias = None;
        let adapter = registry.attach("fc", &mut layer, LoraConfig::new(1, 2.0)).unwrap();
        registry.freeze(|p| !p.role.is_adapter_factor());

        let x = Tensor::from_data_no_grad(arr2(&[[1.0, 3.0]]).into_dyn());
        let y = matmul(&x, &layer.weight());
        y.sum().backward();

        // dL/dW_eff[n, k] = x[k]; dB = s * dW @ A^T
        let a = adapter.lora_a().data();
        let expected_row = 2.0 * (1.0 * a[[0, 0].as_slice()] + 3.0 * a[[0, 1].as_slice()]);
        let gb = adapter.lora_b().grad().unwrap();
        for g in gb.iter() {
            assert!((g - expected_row).abs() < 1e-5);
        }
    }
}
