//! tacoglow CLI: train Tacotron2 / WaveGlow or synthesize Korean speech.
//!
//! # Modes
//!
//! - `train_tacotron`: launch acoustic model training
//! - `train_waveglow`: launch vocoder training from the `--config` JSON
//! - `synthesize`: load both checkpoints and render `--text` to a WAV file
//!
//! Synthesis prints a one-line JSON summary to stdout on success:
//!
//! ```json
//! {"path":"res/output_audio/ex3.wav","samples":44100,"duration_s":2.0,"sample_rate":22050}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tacoglow_rs::{
    audio::write_wav,
    config::{Hyperparameters, VocoderFileConfig},
    pipeline::{SynthesisOptions, Synthesizer, SynthesizerConfig, require_checkpoints},
    training::{
        AcousticTrainingJob, CommandLauncher, DeviceKind, DryRunLauncher, TrainingLauncher,
        VocoderTrainingJob,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    #[value(name = "train_tacotron")]
    TrainTacotron,
    #[value(name = "train_waveglow")]
    TrainWaveglow,
    #[value(name = "synthesize")]
    Synthesize,
}

#[derive(Parser, Debug)]
#[command(
    name = "tacoglow",
    about = "Tacotron2 + WaveGlow text-to-speech",
    long_about = "Train Tacotron2 or WaveGlow through an external trainer, or synthesize\n\
                  speech from text with trained checkpoints.\n\
                  Synthesis writes --output-audio; a JSON summary line is printed to stdout."
)]
struct Args {
    /// Stage to run.
    #[arg(long, value_enum, default_value = "train_waveglow")]
    mode: Mode,

    /// Directory for checkpoints written by either trainer.
    #[arg(long, alias = "output_directory", default_value = "res/checkpoints")]
    output_directory: PathBuf,

    /// Directory for training logs.
    #[arg(long, alias = "log_directory", default_value = "logs")]
    log_directory: PathBuf,

    /// Checkpoint to resume Tacotron2 training from.
    #[arg(long, alias = "checkpoint_path")]
    checkpoint_path: Option<PathBuf>,

    /// Load only model weights from --checkpoint-path.
    #[arg(long, alias = "warm_start")]
    warm_start: bool,

    /// Number of GPUs to train on.
    #[arg(long, alias = "n_gpus", default_value_t = 1)]
    n_gpus: usize,

    /// WaveGlow JSON configuration (training and synthesis).
    #[arg(long, default_value = "waveglow/config.json")]
    config: PathBuf,

    /// Distributed rank.
    #[arg(long, default_value_t = 0)]
    rank: usize,

    /// Distributed group name.
    #[arg(long, alias = "group_name", default_value = "group_name")]
    group_name: String,

    /// Trained Tacotron2 checkpoint (safetensors).
    #[arg(long, alias = "best_tacotron_path")]
    best_tacotron_path: Option<PathBuf>,

    /// Trained WaveGlow checkpoint (safetensors).
    #[arg(long, alias = "best_waveglow_path")]
    best_waveglow_path: Option<PathBuf>,

    /// Where to write the synthesized WAV.
    #[arg(long, alias = "output_audio", default_value = "res/output_audio/ex3.wav")]
    output_audio: PathBuf,

    /// Text to synthesize. Lines are synthesized separately.
    #[arg(long, default_value = "안녕하세요.")]
    text: String,

    /// Hyperparameter overrides: "name=value,name=value".
    #[arg(long, default_value = "")]
    hparams: String,

    /// Vocoder noise scale.
    #[arg(long, default_value_t = 0.666)]
    sigma: f64,

    /// Denoiser strength; 0 disables denoising.
    #[arg(long, alias = "denoiser_strength", default_value_t = 0.01)]
    denoiser_strength: f32,

    /// Zero samples inserted for each empty line.
    #[arg(long, alias = "silence_length", default_value_t = 4000)]
    silence_length: usize,

    /// Seed for vocoder noise.
    #[arg(long, default_value_t = 1234)]
    seed: u64,

    /// External trainer program for the training modes.
    #[arg(long)]
    trainer: Option<PathBuf>,

    /// Extra argument passed to the trainer before the job (repeatable).
    #[arg(long = "trainer-arg")]
    trainer_args: Vec<String>,

    /// Print the resolved training job instead of launching it.
    #[arg(long)]
    dry_run: bool,

    /// Run on CPU even when CUDA is available.
    #[arg(long)]
    cpu: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let hparams = Hyperparameters::default().with_overrides(&args.hparams)?;
    hparams.validate()?;

    match args.mode {
        Mode::TrainTacotron => train_tacotron(&args, hparams),
        Mode::TrainWaveglow => train_waveglow(&args),
        Mode::Synthesize => synthesize(&args, hparams),
    }
}

fn command_launcher(args: &Args) -> anyhow::Result<CommandLauncher> {
    let Some(program) = &args.trainer else {
        anyhow::bail!("--trainer is required to launch training (or pass --dry-run)");
    };
    Ok(CommandLauncher::new(program).with_args(args.trainer_args.iter().cloned()))
}

fn device_kind(args: &Args) -> DeviceKind {
    if args.cpu { DeviceKind::Cpu } else { DeviceKind::detect() }
}

fn train_tacotron(args: &Args, hparams: Hyperparameters) -> anyhow::Result<()> {
    let job = AcousticTrainingJob {
        output_directory: args.output_directory.clone(),
        log_directory: args.log_directory.clone(),
        checkpoint_path: args.checkpoint_path.clone(),
        warm_start: args.warm_start,
        n_gpus: args.n_gpus,
        rank: args.rank,
        group_name: args.group_name.clone(),
        hparams,
        device: device_kind(args),
    };

    tracing::info!("Starting Tacotron2 training...");
    if args.dry_run {
        let launcher = DryRunLauncher::default();
        launcher.train_acoustic(&job)?;
        println!("{}", serde_json::to_string(&*launcher.acoustic.borrow())?);
    } else {
        command_launcher(args)?.train_acoustic(&job)?;
    }
    Ok(())
}

fn train_waveglow(args: &Args) -> anyhow::Result<()> {
    let config = VocoderFileConfig::load(&args.config)?;
    let detected_gpus = match device_kind(args) {
        DeviceKind::Cuda => args.n_gpus,
        DeviceKind::Cpu => 0,
    };
    let job = VocoderTrainingJob::resolve(
        config,
        &args.output_directory,
        detected_gpus,
        args.rank,
        &args.group_name,
    )?;

    tracing::info!("Starting WaveGlow training on {} GPU(s)...", job.num_gpus);
    if args.dry_run {
        let launcher = DryRunLauncher::default();
        launcher.train_vocoder(&job)?;
        println!("{}", serde_json::to_string(&*launcher.vocoder.borrow())?);
    } else {
        command_launcher(args)?.train_vocoder(&job)?;
    }
    Ok(())
}

fn synthesize(args: &Args, hparams: Hyperparameters) -> anyhow::Result<()> {
    require_checkpoints(
        args.best_tacotron_path.as_deref(),
        args.best_waveglow_path.as_deref(),
    )?;
    let vocoder_config = VocoderFileConfig::load(&args.config)?;
    if let Some(rate) = vocoder_config.sampling_rate()
        && rate != hparams.sampling_rate
    {
        tracing::warn!(
            "Vocoder data_config sampling_rate {rate} differs from hparams {}, writing {}",
            hparams.sampling_rate,
            hparams.sampling_rate
        );
    }

    let config = SynthesizerConfig {
        hparams,
        waveglow: vocoder_config.waveglow_config,
        tacotron_checkpoint: args.best_tacotron_path.clone(),
        waveglow_checkpoint: args.best_waveglow_path.clone(),
        options: SynthesisOptions {
            sigma: args.sigma,
            denoiser_strength: args.denoiser_strength,
            silence_length: args.silence_length,
            seed: args.seed,
            ..Default::default()
        },
        dtype: candle_core::DType::F32,
    };
    config.validate()?;

    let device = if args.cpu {
        candle_core::Device::Cpu
    } else {
        candle_core::Device::cuda_if_available(0)?
    };
    tracing::info!("Using device: {:?}", device);

    let synthesizer = Synthesizer::new(&config, &device)?;
    let (audio, sample_rate) = synthesizer.inference_phrase_default(&args.text)?;

    if let Some(parent) = args.output_audio.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    write_wav(&args.output_audio, &audio, sample_rate)?;
    tracing::info!("Generated audio saved to {}", args.output_audio.display());

    println!(
        "{}",
        serde_json::json!({
            "path": args.output_audio.display().to_string(),
            "samples": audio.len(),
            "duration_s": audio.len() as f64 / sample_rate as f64,
            "sample_rate": sample_rate,
        })
    );
    Ok(())
}
