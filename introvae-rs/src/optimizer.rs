//! Adam over a single parameter set, with checkpointable moment state.

use std::collections::HashMap;
use std::path::Path;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;

use crate::error::{IntroVaeError, Result};

const STEP_KEY: &str = "__step";

/// Optimizer configuration.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

impl OptimizerConfig {
    /// Create an Adam optimizer over every variable of `varmap`.
    pub fn build_adam(&self, varmap: &VarMap) -> Adam {
        let data = varmap.data().lock().unwrap_or_else(|e| e.into_inner());
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));

        Adam {
            config: self.clone(),
            vars,
            m: HashMap::new(),
            v: HashMap::new(),
            t: 0,
        }
    }
}

/// Adam optimizer.
///
/// Only variables that received a gradient are updated, so batch-norm
/// running statistics living in the same `VarMap` are left alone.
pub struct Adam {
    config: OptimizerConfig,
    vars: Vec<(String, Var)>,
    /// First moment estimates
    m: HashMap<String, Tensor>,
    /// Second moment estimates
    v: HashMap<String, Tensor>,
    /// Step counter for bias correction
    t: usize,
}

impl Adam {
    /// Apply one update from `grads`.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.t += 1;
        let OptimizerConfig {
            learning_rate: lr,
            beta1,
            beta2,
            eps,
        } = self.config;
        let bc1 = 1.0 - beta1.powi(self.t as i32);
        let bc2 = 1.0 - beta2.powi(self.t as i32);

        for (name, var) in &self.vars {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };

            let (m_new, v_new) = match (self.m.get(name), self.v.get(name)) {
                (Some(m), Some(v)) => (
                    ((m * beta1)? + (grad * (1.0 - beta1))?)?,
                    ((v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?,
                ),
                _ => (
                    (grad * (1.0 - beta1))?,
                    (grad.sqr()? * (1.0 - beta2))?,
                ),
            };

            let m_hat = (&m_new / bc1)?;
            let v_hat = (&v_new / bc2)?;
            let update = ((m_hat / (v_hat.sqrt()? + eps)?)? * lr)?;
            var.set(&var.as_tensor().sub(&update)?)?;

            self.m.insert(name.clone(), m_new);
            self.v.insert(name.clone(), v_new);
        }
        Ok(())
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> usize {
        self.t
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    /// Set learning rate.
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    /// Write the moment estimates and step counter as safetensors.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut tensors: HashMap<String, Tensor> = HashMap::with_capacity(2 * self.m.len() + 1);
        for (name, m) in &self.m {
            tensors.insert(format!("m.{name}"), m.clone());
        }
        for (name, v) in &self.v {
            tensors.insert(format!("v.{name}"), v.clone());
        }
        tensors.insert(
            STEP_KEY.to_string(),
            Tensor::new(&[self.t as u32], &Device::Cpu)?,
        );
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    /// Restore state written by [`Adam::save`].
    ///
    /// Every stored moment must belong to a variable of this optimizer with
    /// the same shape.
    pub fn load<P: AsRef<Path>>(&mut self, path: P, device: &Device) -> Result<()> {
        let path = path.as_ref();
        let mut tensors = candle_core::safetensors::load(path, device)?;

        let step = tensors.remove(STEP_KEY).ok_or_else(|| {
            IntroVaeError::checkpoint(format!("{} has no step counter", path.display()))
        })?;
        let step = step.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        let t = step.first().copied().ok_or_else(|| {
            IntroVaeError::checkpoint(format!("{} has an empty step counter", path.display()))
        })? as usize;

        let shapes: HashMap<&str, &[usize]> = self
            .vars
            .iter()
            .map(|(name, var)| (name.as_str(), var.dims()))
            .collect();

        let mut m = HashMap::new();
        let mut v = HashMap::new();
        for (key, tensor) in tensors {
            let (slot, name) = match key.split_once('.') {
                Some(("m", name)) => (&mut m, name),
                Some(("v", name)) => (&mut v, name),
                _ => {
                    return Err(IntroVaeError::checkpoint(format!(
                        "unexpected optimizer entry {key} in {}",
                        path.display()
                    )))
                }
            };
            match shapes.get(name) {
                Some(dims) if *dims == tensor.dims() => {
                    slot.insert(name.to_string(), tensor);
                }
                _ => {
                    return Err(IntroVaeError::checkpoint(format!(
                        "optimizer entry {key} does not match any parameter"
                    )))
                }
            }
        }

        self.m = m;
        self.v = v;
        self.t = t;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::{Init, VarBuilder};

    fn quadratic_setup() -> (VarMap, Var) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints(3, "w", Init::Const(1.0)).unwrap();
        let var = varmap.all_vars().remove(0);
        (varmap, var)
    }

    #[test]
    fn test_optimizer_config_default() {
        let config = OptimizerConfig::default();
        assert_eq!(config.learning_rate, 1e-3);
        assert_eq!(config.beta1, 0.9);
        assert_eq!(config.beta2, 0.999);
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        let (varmap, var) = quadratic_setup();
        let mut adam = OptimizerConfig {
            learning_rate: 0.1,
            ..Default::default()
        }
        .build_adam(&varmap);

        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        adam.step(&loss.backward().unwrap()).unwrap();

        // Bias-corrected first step is lr * sign(grad).
        let w: Vec<f32> = var.as_tensor().to_vec1().unwrap();
        assert!(w.iter().all(|x| (x - 0.9).abs() < 1e-4), "{w:?}");
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn test_adam_minimizes_quadratic() {
        let (varmap, var) = quadratic_setup();
        let mut adam = OptimizerConfig {
            learning_rate: 0.05,
            ..Default::default()
        }
        .build_adam(&varmap);

        for _ in 0..200 {
            let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
            adam.step(&loss.backward().unwrap()).unwrap();
        }
        let w: Vec<f32> = var.as_tensor().to_vec1().unwrap();
        assert!(w.iter().all(|x| x.abs() < 0.1), "{w:?}");
    }

    #[test]
    fn test_vars_without_gradient_untouched() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let used = vb.get_with_hints(2, "used", Init::Const(1.0)).unwrap();
        vb.get_with_hints(2, "unused", Init::Const(5.0)).unwrap();
        let mut adam = OptimizerConfig::default().build_adam(&varmap);

        let loss = used.sqr().unwrap().sum_all().unwrap();
        adam.step(&loss.backward().unwrap()).unwrap();

        let data = varmap.data().lock().unwrap();
        let unused: Vec<f32> = data["unused"].as_tensor().to_vec1().unwrap();
        assert_eq!(unused, vec![5.0, 5.0]);
    }

    #[test]
    fn test_state_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("adam.safetensors");

        let (varmap, var) = quadratic_setup();
        let mut adam = OptimizerConfig::default().build_adam(&varmap);
        for _ in 0..3 {
            let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
            adam.step(&loss.backward().unwrap()).unwrap();
        }
        adam.save(&path).unwrap();

        let mut restored = OptimizerConfig::default().build_adam(&varmap);
        restored.load(&path, &Device::Cpu).unwrap();
        assert_eq!(restored.steps(), 3);

        let m_a: Vec<f32> = adam.m["w"].to_vec1().unwrap();
        let m_b: Vec<f32> = restored.m["w"].to_vec1().unwrap();
        assert_eq!(m_a, m_b);
    }

    #[test]
    fn test_load_rejects_foreign_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("adam.safetensors");

        let (varmap, var) = quadratic_setup();
        let mut adam = OptimizerConfig::default().build_adam(&varmap);
        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        adam.step(&loss.backward().unwrap()).unwrap();
        adam.save(&path).unwrap();

        let other = VarMap::new();
        let vb = VarBuilder::from_varmap(&other, DType::F32, &Device::Cpu);
        vb.get_with_hints(4, "w", Init::Const(1.0)).unwrap();
        let mut mismatched = OptimizerConfig::default().build_adam(&other);
        assert!(matches!(
            mismatched.load(&path, &Device::Cpu),
            Err(IntroVaeError::Checkpoint(_))
        ));
    }
}
