//! Checkpoint bundles and strict parameter loading.
//!
//! A checkpoint is a safetensors file whose tensor names are namespaced by
//! the bundle's top-level field. Model parameters live under
//! `state_dict.<name>`; anything else (`optimizer.*`, `iteration`, ...) is
//! carried along but never applied.
//!
//! Models are built fresh through a [`VarMap`] and then have a checkpoint
//! written into their variables in place:
//!
//! ```no_run
//! # use tacoglow_rs::checkpoint::load_checkpoint;
//! # use tacoglow_rs::{config::Hyperparameters, model::tacotron2::Tacotron2};
//! # fn main() -> tacoglow_rs::Result<()> {
//! let device = candle_core::Device::Cpu;
//! let hparams = Hyperparameters::default();
//! let model = load_checkpoint(
//!     "res/checkpoints/best_tacotron2.safetensors",
//!     Tacotron2::new(&hparams, candle_core::DType::F32, &device)?,
//! )?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::MutexGuard;

use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;

use crate::{Error, Result};

/// Top-level field holding the parameter mapping.
pub const STATE_DICT_KEY: &str = "state_dict";

/// Prefix added to parameter names by data-parallel training wrappers.
pub const DISTRIBUTED_PREFIX: &str = "module.";

/// Buffers the inference graph has no variable for.
const IGNORED_BUFFER_SUFFIXES: &[&str] = &["num_batches_tracked"];

/// Maximum number of offending names quoted in an error message.
const MAX_REPORTED_NAMES: usize = 8;

fn lock_parameters(parameters: &VarMap) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
    parameters.data().lock().map_err(|_| {
        Error::Runtime(candle_core::Error::Msg(
            "parameter map lock poisoned by a panicked thread".into(),
        ))
    })
}

/// A model whose parameters are held in a [`VarMap`].
pub trait Parameterized {
    fn parameters(&self) -> &VarMap;

    /// Snapshot of the current parameters keyed by name.
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let vars = lock_parameters(self.parameters())?;
        Ok(vars
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect())
    }
}

/// A deserialized checkpoint, grouped by top-level field.
#[derive(Debug)]
pub struct Checkpoint {
    fields: BTreeMap<String, HashMap<String, Tensor>>,
}

impl Checkpoint {
    /// Read a checkpoint bundle from disk onto the CPU.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::NotFound(path.to_path_buf()));
        }
        let tensors =
            candle_core::safetensors::load(path, &Device::Cpu).map_err(|e| Error::InvalidFormat {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Ok(Self::from_tensors(tensors))
    }

    /// Group flat tensor names by their first dotted segment.
    pub fn from_tensors(tensors: HashMap<String, Tensor>) -> Self {
        let mut fields: BTreeMap<String, HashMap<String, Tensor>> = BTreeMap::new();
        for (name, tensor) in tensors {
            match name.split_once('.') {
                Some((field, rest)) => {
                    fields
                        .entry(field.to_string())
                        .or_default()
                        .insert(rest.to_string(), tensor);
                }
                None => {
                    fields.entry(name.clone()).or_default().insert(name, tensor);
                }
            }
        }
        Self { fields }
    }

    /// Top-level keys of the bundle, sorted.
    pub fn keys(&self) -> Vec<&str> {
        self.fields.keys().map(String::as_str).collect()
    }

    pub fn state_dict(&self) -> Option<&HashMap<String, Tensor>> {
        self.fields.get(STATE_DICT_KEY)
    }

    /// Take the parameter mapping out of the bundle.
    ///
    /// `path` is only used to build the error message.
    pub fn into_state_dict(mut self, path: &Path) -> Result<HashMap<String, Tensor>> {
        match self.fields.remove(STATE_DICT_KEY) {
            Some(state_dict) => Ok(state_dict),
            None => Err(Error::InvalidFormat {
                path: path.to_path_buf(),
                reason: format!(
                    "found top-level keys {:?} (expected '{STATE_DICT_KEY}')",
                    self.keys()
                ),
            }),
        }
    }

    /// Write `state_dict` to `path` as a checkpoint bundle.
    pub fn save(path: impl AsRef<Path>, state_dict: &HashMap<String, Tensor>) -> Result<()> {
        let namespaced: HashMap<String, Tensor> = state_dict
            .iter()
            .map(|(name, tensor)| (format!("{STATE_DICT_KEY}.{name}"), tensor.clone()))
            .collect();
        candle_core::safetensors::save(&namespaced, path)?;
        Ok(())
    }
}

/// Strip the data-parallel prefix from every parameter name.
///
/// Names without the prefix pass through unchanged. Two names that collapse
/// onto the same stripped name are rejected.
pub fn strip_distributed_prefix<V>(
    params: impl IntoIterator<Item = (String, V)>,
) -> Result<HashMap<String, V>> {
    let mut stripped = HashMap::new();
    for (name, value) in params {
        let key = name
            .strip_prefix(DISTRIBUTED_PREFIX)
            .map(str::to_string)
            .unwrap_or(name);
        if stripped.contains_key(&key) {
            return Err(Error::IncompatibleCheckpoint(format!(
                "parameter '{key}' appears both with and without the '{DISTRIBUTED_PREFIX}' prefix"
            )));
        }
        stripped.insert(key, value);
    }
    Ok(stripped)
}

fn is_ignored_buffer(name: &str) -> bool {
    IGNORED_BUFFER_SUFFIXES
        .iter()
        .any(|suffix| name.ends_with(suffix))
}

fn quote_names(mut names: Vec<&str>) -> String {
    names.sort_unstable();
    let total = names.len();
    names.truncate(MAX_REPORTED_NAMES);
    if total > MAX_REPORTED_NAMES {
        format!("{names:?} (+{} more)", total - MAX_REPORTED_NAMES)
    } else {
        format!("{names:?}")
    }
}

/// Write `state_dict` into the variables of `parameters`.
///
/// Every variable must be covered, no unknown names may remain and all
/// shapes must agree; nothing is written unless all checks pass.
pub fn apply_state_dict(parameters: &VarMap, state_dict: &HashMap<String, Tensor>) -> Result<()> {
    let vars = lock_parameters(parameters)?;

    let missing: Vec<&str> = vars
        .keys()
        .filter(|name| !state_dict.contains_key(*name))
        .map(String::as_str)
        .collect();
    let unexpected: Vec<&str> = state_dict
        .keys()
        .filter(|name| !vars.contains_key(*name) && !is_ignored_buffer(name))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() || !unexpected.is_empty() {
        return Err(Error::IncompatibleCheckpoint(format!(
            "missing keys {}, unexpected keys {}",
            quote_names(missing),
            quote_names(unexpected)
        )));
    }

    let mismatched: Vec<String> = vars
        .iter()
        .filter_map(|(name, var)| {
            let tensor = &state_dict[name];
            (tensor.dims() != var.dims()).then(|| {
                format!(
                    "{name}: checkpoint {:?} vs model {:?}",
                    tensor.dims(),
                    var.dims()
                )
            })
        })
        .collect();
    if !mismatched.is_empty() {
        return Err(Error::IncompatibleCheckpoint(format!(
            "size mismatch for {}",
            mismatched.join(", ")
        )));
    }

    let converted = vars
        .iter()
        .map(|(name, var)| -> Result<(&Var, Tensor)> {
            let value = state_dict[name]
                .to_dtype(var.dtype())?
                .to_device(var.device())?;
            Ok((var, value))
        })
        .collect::<Result<Vec<_>>>()?;
    for (var, value) in converted {
        var.set(&value)?;
    }
    Ok(())
}

/// Load the checkpoint at `path` into a freshly constructed `model`.
///
/// The model's variables are overwritten in place; the model is handed back
/// so construction and loading chain in one expression.
pub fn load_checkpoint<M: Parameterized>(path: impl AsRef<Path>, model: M) -> Result<M> {
    let path = path.as_ref();
    tracing::info!("Loading checkpoint {}", path.display());

    let state_dict = Checkpoint::read(path)?.into_state_dict(path)?;
    let state_dict = strip_distributed_prefix(state_dict)?;
    apply_state_dict(model.parameters(), &state_dict)?;

    tracing::debug!("Applied {} parameters from {}", state_dict.len(), path.display());
    Ok(model)
}
