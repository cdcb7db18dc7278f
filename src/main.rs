use std::{
    fs,
    path::{Path, PathBuf},
    process,
};

use anyhow::{anyhow, Context, Result};
use burn::{
    backend::{Autodiff, NdArray},
    tensor::backend::{AutodiffBackend, Backend},
};
use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint};
use log::{info, warn};
use tintora::{
    checkpoint::{checkpoint_file, load_generator, CHECKPOINT_EXTENSION},
    imaging::{colorize_file, output_path, ColorStyle, Enhancement},
    ColorizerTrainer, DeviceKind, TrainingConfig,
};

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Parser)]
#[command(author, version, about = "Adversarial colorization of grayscale photos")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train the colorizer on a bw/ color/ labels/ dataset
    Train(TrainArgs),

    /// Colorize one image or every image in a directory
    Colorize(ColorizeArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Precision {
    /// f32 everywhere, no loss scaling
    Full,
    /// f16 on the GPU with dynamic loss scaling
    Mixed,
}

#[derive(Args)]
struct TrainArgs {
    /// JSON training config; missing keys keep their defaults
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Overrides the config's device
    #[arg(long, value_enum)]
    device: Option<DeviceKind>,

    /// Overrides the config's mixed_precision flag
    #[arg(long, value_enum)]
    precision: Option<Precision>,
}

#[derive(Args, Debug)]
struct ColorizeArgs {
    /// Image file or directory of images
    #[arg(long, value_hint = ValueHint::AnyPath)]
    input: PathBuf,

    /// Generator or full checkpoint, with or without the .mpk extension
    #[arg(long, value_hint = ValueHint::FilePath)]
    checkpoint: PathBuf,

    /// Output file, or output directory when --input is a directory
    #[arg(long, value_hint = ValueHint::AnyPath)]
    output: Option<PathBuf>,

    /// Training config holding the network widths; defaults to the
    /// config.json next to the checkpoint
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = DeviceKind::Cpu)]
    device: DeviceKind,

    #[arg(long, value_enum, default_value_t = ColorStyle::Neutral)]
    style: ColorStyle,

    #[arg(long, default_value_t = 1.0)]
    saturation: f32,

    /// -1 (cool) to 1 (warm)
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    temperature: f32,

    #[arg(long, default_value_t = 1.0)]
    contrast: f32,

    #[arg(long, default_value_t = 1.0)]
    brightness: f32,
}

impl ColorizeArgs {
    fn enhancement(&self) -> Enhancement {
        Enhancement {
            style: self.style,
            saturation: self.saturation,
            temperature: self.temperature,
            contrast: self.contrast,
            brightness: self.brightness,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Train(args) => run_train(args),
        Command::Colorize(args) => run_colorize(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => TrainingConfig::load(path)?,
        None => {
            warn!("no --config given, training with defaults");
            TrainingConfig::default()
        }
    };
    if let Some(device) = args.device {
        config.device = device;
    }
    if let Some(precision) = args.precision {
        config.mixed_precision = precision == Precision::Mixed;
    }

    match config.device {
        DeviceKind::Gpu => train_on_gpu(config),
        DeviceKind::Cpu => {
            if config.mixed_precision {
                info!("the CPU backend has no f16 kernels, training in f32 with loss scaling");
            }
            train::<Autodiff<NdArray>>(config, Default::default())
        }
    }
}

fn train<B: AutodiffBackend>(config: TrainingConfig, device: B::Device) -> Result<()> {
    let summary = ColorizerTrainer::<B>::new(config, device).run()?;
    match summary.best {
        Some((epoch, loss)) => info!(
            "✅ done after {} epochs, best epoch {epoch} (validation loss {loss:.4})",
            summary.epochs_run
        ),
        None => warn!(
            "done after {} epochs without a finite validation loss",
            summary.epochs_run
        ),
    }
    Ok(())
}

#[cfg(feature = "wgpu")]
fn train_on_gpu(config: TrainingConfig) -> Result<()> {
    use burn::{
        backend::{wgpu::WgpuDevice, Wgpu},
        tensor::f16,
    };
    if config.mixed_precision {
        info!("training in f16 on the GPU");
        train::<Autodiff<Wgpu<f16>>>(config, WgpuDevice::default())
    } else {
        train::<Autodiff<Wgpu>>(config, WgpuDevice::default())
    }
}

#[cfg(not(feature = "wgpu"))]
fn train_on_gpu(config: TrainingConfig) -> Result<()> {
    warn!("built without the `wgpu` feature, falling back to the CPU backend");
    train::<Autodiff<NdArray>>(config, Default::default())
}

fn run_colorize(args: ColorizeArgs) -> Result<()> {
    args.enhancement().validate()?;

    match args.device {
        DeviceKind::Gpu => colorize_on_gpu(args),
        DeviceKind::Cpu => colorize::<NdArray>(args, Default::default()),
    }
}

#[cfg(feature = "wgpu")]
fn colorize_on_gpu(args: ColorizeArgs) -> Result<()> {
    use burn::backend::{wgpu::WgpuDevice, Wgpu};
    colorize::<Wgpu>(args, WgpuDevice::default())
}

#[cfg(not(feature = "wgpu"))]
fn colorize_on_gpu(args: ColorizeArgs) -> Result<()> {
    warn!("built without the `wgpu` feature, falling back to the CPU backend");
    colorize::<NdArray>(args, Default::default())
}

/// Accepts a checkpoint given with or without its `.mpk` extension.
fn checkpoint_stem(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == CHECKPOINT_EXTENSION) {
        path.with_extension("")
    } else {
        path.to_path_buf()
    }
}

/// Explicit `--config`, else the `config.json` a training run left next to
/// the checkpoint, else defaults.
fn inference_config(explicit: Option<&Path>, stem: &Path) -> Result<TrainingConfig> {
    if let Some(path) = explicit {
        return TrainingConfig::load(path);
    }
    let beside = stem
        .parent()
        .map(|dir| dir.join("config.json"))
        .filter(|path| path.is_file());
    match beside {
        Some(path) => {
            info!("using {}", path.display());
            TrainingConfig::load(path)
        }
        None => Ok(TrainingConfig::default()),
    }
}

fn collect_inputs(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    let mut files: Vec<PathBuf> = fs::read_dir(input)
        .with_context(|| format!("cannot read {}", input.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .map(|ext| ext.to_string_lossy().to_lowercase())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        })
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(anyhow!("no .png/.jpg images in {}", input.display()));
    }
    Ok(files)
}

fn colorize<B: Backend>(args: ColorizeArgs, device: B::Device) -> Result<()> {
    let stem = checkpoint_stem(&args.checkpoint);
    let config = inference_config(args.config.as_deref(), &stem)?;
    let enhancement = args.enhancement();

    let generator = load_generator::<B>(config.generator_width, &stem, &device)
        .with_context(|| format!("cannot load {}", checkpoint_file(&stem).display()))?;
    info!("🎨 generator loaded from {}", checkpoint_file(&stem).display());

    let batch = args.input.is_dir();
    let inputs = collect_inputs(&args.input)?;
    let mut failures = 0;
    for path in &inputs {
        let output = output_path(path, args.output.as_deref(), batch);
        match colorize_file(
            &generator,
            path,
            &output,
            config.min_image_size as u32,
            &enhancement,
            &device,
        ) {
            Ok(()) => info!("✅ {} -> {}", path.display(), output.display()),
            Err(e) => {
                warn!("⚠️ {}: {e}", path.display());
                failures += 1;
            }
        }
    }

    if failures == inputs.len() {
        return Err(anyhow!("no image could be colorized"));
    }
    if failures > 0 {
        warn!("{failures} of {} images failed", inputs.len());
    }
    Ok(())
}
