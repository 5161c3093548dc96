//! Training entry points.
//!
//! Training itself runs in an external trainer. This module resolves the
//! job settings (GPU count, distributed rank, cuDNN flags, output
//! directory), hands the job to a [`TrainingLauncher`] and checks that a
//! usable checkpoint came out of it.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::process::Command;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::config::{Hyperparameters, VocoderFileConfig};
use crate::{Error, Result};

/// Where the trainer should place its tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda,
}

impl DeviceKind {
    /// CUDA when the build and the machine support it.
    pub fn detect() -> Self {
        if candle_core::utils::cuda_is_available() {
            Self::Cuda
        } else {
            Self::Cpu
        }
    }

    pub fn of(device: &Device) -> Self {
        if device.is_cuda() { Self::Cuda } else { Self::Cpu }
    }
}

/// Tacotron2 training job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcousticTrainingJob {
    pub output_directory: PathBuf,
    pub log_directory: PathBuf,
    /// Checkpoint to resume from.
    pub checkpoint_path: Option<PathBuf>,
    /// Load weights only from `checkpoint_path`, not optimizer state.
    pub warm_start: bool,
    pub n_gpus: usize,
    pub rank: usize,
    pub group_name: String,
    pub hparams: Hyperparameters,
    pub device: DeviceKind,
}

impl AcousticTrainingJob {
    /// The job as launched: cuDNN disabled.
    pub fn prepared(mut self) -> Self {
        self.hparams.cudnn_enabled = false;
        self
    }
}

/// WaveGlow training job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocoderTrainingJob {
    pub config: VocoderFileConfig,
    pub output_directory: PathBuf,
    pub num_gpus: usize,
    pub rank: usize,
    pub group_name: String,
    pub cudnn_enabled: bool,
    pub cudnn_benchmark: bool,
}

impl VocoderTrainingJob {
    /// Resolve the GPU setup for a vocoder training run.
    ///
    /// More than one GPU without a distributed group falls back to a single
    /// GPU. Single-GPU training must run as rank 0.
    pub fn resolve(
        config: VocoderFileConfig,
        output_directory: &Path,
        detected_gpus: usize,
        rank: usize,
        group_name: &str,
    ) -> Result<Self> {
        let mut num_gpus = detected_gpus;
        if num_gpus > 1 && group_name.is_empty() {
            tracing::warn!(
                "Multiple GPUs detected but no distributed group set, only running 1 GPU"
            );
            num_gpus = 1;
        }
        if num_gpus == 1 && rank != 0 {
            return Err(Error::Config(format!(
                "single GPU training requested on rank {rank}, expected rank 0"
            )));
        }

        Ok(Self {
            config: config.with_output_directory(output_directory),
            output_directory: output_directory.to_path_buf(),
            num_gpus,
            rank,
            group_name: group_name.to_string(),
            cudnn_enabled: true,
            cudnn_benchmark: false,
        })
    }
}

/// Runs training jobs to completion.
pub trait TrainingLauncher {
    fn train_acoustic(&self, job: &AcousticTrainingJob) -> Result<()>;

    fn train_vocoder(&self, job: &VocoderTrainingJob) -> Result<()>;
}

/// Launches an external trainer program.
///
/// The job is written as JSON into the output directory and the trainer is
/// invoked as `<program> [args...] acoustic|vocoder <job.json>`.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn launch<J: Serialize>(
        &self,
        kind: &str,
        output_directory: &Path,
        job: &J,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(output_directory)?;
        let job_path = output_directory.join(format!("{kind}_job.json"));
        std::fs::write(&job_path, serde_json::to_string_pretty(job)?)?;

        tracing::info!(
            "Launching {} {kind} {}",
            self.program.display(),
            job_path.display()
        );
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(kind)
            .arg(&job_path)
            .status()
            .map_err(|e| {
                Error::Training(format!("cannot start {}: {e}", self.program.display()))
            })?;
        if !status.success() {
            return Err(Error::Training(format!(
                "{} {kind} exited with {status}",
                self.program.display()
            )));
        }

        let checkpoint = find_checkpoint(output_directory)?;
        tracing::info!("Training produced {}", checkpoint.display());
        Ok(checkpoint)
    }
}

impl TrainingLauncher for CommandLauncher {
    fn train_acoustic(&self, job: &AcousticTrainingJob) -> Result<()> {
        let job = job.clone().prepared();
        self.launch("acoustic", &job.output_directory, &job)?;
        Ok(())
    }

    fn train_vocoder(&self, job: &VocoderTrainingJob) -> Result<()> {
        self.launch("vocoder", &job.output_directory, job)?;
        Ok(())
    }
}

/// First checkpoint (by name) in `directory` that carries a state dict.
pub fn find_checkpoint(directory: &Path) -> Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(directory)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "safetensors"))
        .collect();
    candidates.sort();

    for path in candidates {
        match Checkpoint::read(&path) {
            Ok(checkpoint) if checkpoint.state_dict().is_some() => return Ok(path),
            Ok(_) => tracing::debug!("{} has no state_dict", path.display()),
            Err(e) => tracing::debug!("Skipping {}: {e}", path.display()),
        }
    }
    Err(Error::Training(format!(
        "no checkpoint with a state_dict in {}",
        directory.display()
    )))
}

/// Records jobs instead of running them.
#[derive(Debug, Default)]
pub struct DryRunLauncher {
    pub acoustic: RefCell<Vec<AcousticTrainingJob>>,
    pub vocoder: RefCell<Vec<VocoderTrainingJob>>,
}

impl TrainingLauncher for DryRunLauncher {
    fn train_acoustic(&self, job: &AcousticTrainingJob) -> Result<()> {
        tracing::info!("Dry run: acoustic training into {}", job.output_directory.display());
        self.acoustic.borrow_mut().push(job.clone().prepared());
        Ok(())
    }

    fn train_vocoder(&self, job: &VocoderTrainingJob) -> Result<()> {
        tracing::info!("Dry run: vocoder training on {} GPU(s)", job.num_gpus);
        self.vocoder.borrow_mut().push(job.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Tensor};
    use std::collections::HashMap;

    const CONFIG_JSON: &str = r#"{
        "train_config": {"epochs": 1, "output_directory": "checkpoints"},
        "data_config": {"sampling_rate": 22050},
        "dist_config": {"dist_backend": "nccl"},
        "waveglow_config": {
            "n_mel_channels": 80, "n_flows": 12, "n_group": 8,
            "n_early_every": 4, "n_early_size": 2,
            "WN_config": {"n_layers": 8, "n_channels": 256, "kernel_size": 3}
        }
    }"#;

    fn vocoder_config() -> VocoderFileConfig {
        VocoderFileConfig::from_json(CONFIG_JSON).unwrap()
    }

    fn resolve(gpus: usize, rank: usize, group_name: &str) -> Result<VocoderTrainingJob> {
        VocoderTrainingJob::resolve(vocoder_config(), Path::new("out"), gpus, rank, group_name)
    }

    fn acoustic_job(output_directory: &Path) -> AcousticTrainingJob {
        AcousticTrainingJob {
            output_directory: output_directory.to_path_buf(),
            log_directory: "logs".into(),
            checkpoint_path: None,
            warm_start: false,
            n_gpus: 1,
            rank: 0,
            group_name: "group_name".into(),
            hparams: Hyperparameters::default(),
            device: DeviceKind::Cpu,
        }
    }

    fn write_checkpoint(path: &Path) {
        let mut state_dict = HashMap::new();
        state_dict.insert(
            "proj.weight".to_string(),
            Tensor::zeros((2, 2), DType::F32, &candle_core::Device::Cpu).unwrap(),
        );
        Checkpoint::save(path, &state_dict).unwrap();
    }

    #[test]
    fn multi_gpu_without_group_falls_back_to_one() {
        let job = resolve(4, 0, "").unwrap();
        assert_eq!(job.num_gpus, 1);
    }

    #[test]
    fn multi_gpu_with_group_is_kept() {
        let job = resolve(4, 2, "group_name").unwrap();
        assert_eq!(job.num_gpus, 4);
        assert_eq!(job.rank, 2);
    }

    #[test]
    fn single_gpu_on_nonzero_rank_is_rejected() {
        let err = resolve(1, 1, "g").unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        // The fallback to one GPU is subject to the same rule.
        let err = resolve(2, 1, "").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn cpu_training_ignores_rank() {
        let job = resolve(0, 3, "").unwrap();
        assert_eq!(job.num_gpus, 0);
    }

    #[test]
    fn vocoder_job_flags_and_output_directory() {
        let job = VocoderTrainingJob::resolve(
            vocoder_config(),
            Path::new("res/checkpoints"),
            1,
            0,
            "group_name",
        )
        .unwrap();
        assert!(job.cudnn_enabled);
        assert!(!job.cudnn_benchmark);
        assert_eq!(job.config.train_config["output_directory"], "res/checkpoints");
    }

    #[test]
    fn acoustic_job_disables_cudnn() {
        let launcher = DryRunLauncher::default();
        let mut job = acoustic_job(Path::new("out"));
        job.hparams.cudnn_enabled = true;
        launcher.train_acoustic(&job).unwrap();
        let recorded = launcher.acoustic.borrow();
        assert_eq!(recorded.len(), 1);
        assert!(!recorded[0].hparams.cudnn_enabled);
    }

    #[cfg(unix)]
    #[test]
    fn failing_trainer_is_training_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = CommandLauncher::new("false");
        let err = launcher.train_acoustic(&acoustic_job(dir.path())).unwrap_err();
        assert!(matches!(err, Error::Training(_)));
    }

    #[test]
    fn missing_trainer_is_training_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = CommandLauncher::new(dir.path().join("no-such-trainer"));
        let err = launcher.train_acoustic(&acoustic_job(dir.path())).unwrap_err();
        assert!(matches!(err, Error::Training(_)));
    }

    #[cfg(unix)]
    #[test]
    fn successful_trainer_without_checkpoint_is_training_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = CommandLauncher::new("true");
        let err = launcher.train_acoustic(&acoustic_job(dir.path())).unwrap_err();
        match err {
            Error::Training(message) => assert!(message.contains("state_dict"), "{message}"),
            other => panic!("expected training error, got {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn successful_trainer_with_checkpoint_writes_job() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(&dir.path().join("checkpoint_1000.safetensors"));
        let launcher = CommandLauncher::new("true").with_args(["--quiet"]);
        let mut job = acoustic_job(dir.path());
        job.hparams.cudnn_enabled = true;
        launcher.train_acoustic(&job).unwrap();

        let written = std::fs::read_to_string(dir.path().join("acoustic_job.json")).unwrap();
        let written: AcousticTrainingJob = serde_json::from_str(&written).unwrap();
        assert!(!written.hparams.cudnn_enabled);
        assert_eq!(written.group_name, "group_name");
    }

    #[cfg(unix)]
    #[test]
    fn vocoder_job_is_written_for_trainer() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(&dir.path().join("waveglow_10.safetensors"));
        let job = VocoderTrainingJob::resolve(vocoder_config(), dir.path(), 1, 0, "").unwrap();
        CommandLauncher::new("true").train_vocoder(&job).unwrap();
        let written = std::fs::read_to_string(dir.path().join("vocoder_job.json")).unwrap();
        let written: VocoderTrainingJob = serde_json::from_str(&written).unwrap();
        assert_eq!(written, job);
    }

    #[test]
    fn find_checkpoint_skips_files_without_state_dict() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.safetensors"), b"garbage").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        write_checkpoint(&dir.path().join("b.safetensors"));
        let found = find_checkpoint(dir.path()).unwrap();
        assert_eq!(found, dir.path().join("b.safetensors"));
    }
}
