use crate::{
    checkpoint::{load_colorizer, save_colorizer, save_generator},
    classifier::Classifier,
    config::TrainingConfig,
    data::{
        ColorizationBatch, ColorizationBatcher, ColorizationDataset, ColorizationItem, EmptyBatch,
        LoadedBatch,
    },
    discriminator::Discriminator,
    generator::Generator,
    imaging::save_sample_strip,
    losses::{classification_loss, ssim, LossAssembly, PixelLoss},
    model::{Colorizer, ForwardMode},
    precision::LossScaler,
    schedule::{CheckpointDecision, ReduceOnPlateau, ValidationTracker},
};
use anyhow::{anyhow, Context, Result};
use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    module::{AutodiffModule, Module},
    optim::{
        decay::WeightDecayConfig, AdamConfig, GradientsAccumulator, GradientsParams, Optimizer,
    },
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Tensor,
    },
};
use log::{debug, info, warn};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

type TrainLoader<B> = Arc<dyn DataLoader<B, LoadedBatch<B>>>;
type ValidLoader<B> = Arc<
    dyn DataLoader<
        <B as AutodiffBackend>::InnerBackend,
        LoadedBatch<<B as AutodiffBackend>::InnerBackend>,
    >,
>;

/// What a finished run reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub epochs_run: usize,
    /// Epoch and combined validation loss of the restored best model.
    pub best: Option<(usize, f64)>,
    pub early_stopped: bool,
    pub skipped_batches: usize,
    /// Training and validation items whose images could not be loaded,
    /// summed over all epochs.
    pub dropped_items: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct StepLosses {
    discriminator: f64,
    generator: f64,
    pixel: f64,
    perceptual: f64,
    adversarial: f64,
    classification: f64,
}

impl StepLosses {
    fn add(&mut self, other: &Self) {
        self.discriminator += other.discriminator;
        self.generator += other.generator;
        self.pixel += other.pixel;
        self.perceptual += other.perceptual;
        self.adversarial += other.adversarial;
        self.classification += other.classification;
    }

    fn mean(&self, count: usize) -> Self {
        let n = count.max(1) as f64;
        Self {
            discriminator: self.discriminator / n,
            generator: self.generator / n,
            pixel: self.pixel / n,
            perceptual: self.perceptual / n,
            adversarial: self.adversarial / n,
            classification: self.classification / n,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ValidationLosses {
    pixel: f64,
    classification: f64,
    ssim: f64,
    dropped: usize,
}

impl ValidationLosses {
    fn total(&self) -> f64 {
        self.pixel + self.classification
    }
}

/// Generator and classifier outputs for one batch, still attached to the
/// autodiff graph.
struct Generated<B: AutodiffBackend> {
    color: Tensor<B, 4>,
    semantic: Tensor<B, 2>,
}

struct DiscriminatorPass<B: AutodiffBackend> {
    grads: GradientsParams,
    loss: f64,
    generated: Generated<B>,
}

struct GeneratorPass {
    generator: GradientsParams,
    classifier: GradientsParams,
    losses: StepLosses,
}

/// Gradients summed over the current accumulation window, one accumulator
/// per sub-network. The discriminator window closes on its own, before the
/// generator objective of the same batch is computed.
struct Accumulation<B: AutodiffBackend> {
    generator: GradientsAccumulator<Generator<B>>,
    classifier: GradientsAccumulator<Classifier<B>>,
    discriminator: GradientsAccumulator<Discriminator<B>>,
    discriminator_pending: usize,
    generator_pending: usize,
}

impl<B: AutodiffBackend> Accumulation<B> {
    fn new() -> Self {
        Self {
            generator: GradientsAccumulator::new(),
            classifier: GradientsAccumulator::new(),
            discriminator: GradientsAccumulator::new(),
            discriminator_pending: 0,
            generator_pending: 0,
        }
    }
}

/// One optimizer and its plateau schedule per sub-network.
struct Optimizers<OG, OC, OD> {
    generator: OG,
    classifier: OC,
    discriminator: OD,
    generator_lr: ReduceOnPlateau,
    classifier_lr: ReduceOnPlateau,
    discriminator_lr: ReduceOnPlateau,
}

impl<OG, OC, OD> Optimizers<OG, OC, OD> {
    fn step_discriminator<B>(
        &mut self,
        mut model: Colorizer<B>,
        accumulation: &mut Accumulation<B>,
    ) -> Colorizer<B>
    where
        B: AutodiffBackend,
        OD: Optimizer<Discriminator<B>, B>,
    {
        model.discriminator = self.discriminator.step(
            self.discriminator_lr.lr(),
            model.discriminator,
            accumulation.discriminator.grads(),
        );
        accumulation.discriminator_pending = 0;
        model
    }

    fn step_generator<B>(
        &mut self,
        mut model: Colorizer<B>,
        accumulation: &mut Accumulation<B>,
    ) -> Colorizer<B>
    where
        B: AutodiffBackend,
        OG: Optimizer<Generator<B>, B>,
        OC: Optimizer<Classifier<B>, B>,
    {
        model.generator = self.generator.step(
            self.generator_lr.lr(),
            model.generator,
            accumulation.generator.grads(),
        );
        model.classifier = self.classifier.step(
            self.classifier_lr.lr(),
            model.classifier,
            accumulation.classifier.grads(),
        );
        accumulation.generator_pending = 0;
        model
    }
}

pub struct ColorizerTrainer<B: AutodiffBackend> {
    config: TrainingConfig,
    device: B::Device,
}

impl<B: AutodiffBackend> ColorizerTrainer<B> {
    pub fn new(config: TrainingConfig, device: B::Device) -> Self {
        Self { config, device }
    }

    fn save_dir(&self) -> PathBuf {
        PathBuf::from(&self.config.save_path)
    }

    pub fn run(&self) -> Result<TrainingSummary> {
        info!("🚀 starting colorizer training");
        info!("   backend: {}", std::any::type_name::<B>());
        info!("   device: {:?}", self.device);
        info!(
            "   image side: {}..{} (augment: {})",
            self.config.min_image_size, self.config.max_image_size, self.config.augment
        );
        info!(
            "   batch size: {} x {} accumulation steps",
            self.config.batch_size, self.config.accum_steps
        );
        info!("   learning rate: {}", self.config.lr);

        self.config.validate()?;
        B::seed(self.config.seed);

        let save_dir = self.save_dir();
        std::fs::create_dir_all(&save_dir)
            .with_context(|| format!("cannot create {}", save_dir.display()))?;
        self.config.save(save_dir.join("config.json"))?;

        let (train_loader, valid_loader) = self.create_dataloaders()?;
        let model = Colorizer::<B>::new(&self.config, &self.device);
        info!(
            "🛠️  model: generator {} / classifier {} / discriminator {} parameters",
            model.generator.num_params(),
            model.classifier.num_params(),
            model.discriminator.num_params()
        );

        self.train_model(model, train_loader, |model, epoch| {
            self.validate(model, &valid_loader, epoch)
        })
    }

    fn create_dataloaders(&self) -> Result<(TrainLoader<B>, ValidLoader<B>)> {
        let dataset = ColorizationDataset::new(
            &self.config.data_path,
            self.config.num_classes,
            self.config.seed,
        )?;
        let (train_data, valid_data) = dataset.split(self.config.train_val_split);
        if train_data.is_empty() || valid_data.is_empty() {
            return Err(anyhow!(
                "train/validation split left an empty side ({} train, {} validation)",
                train_data.len(),
                valid_data.len()
            ));
        }

        let batcher_train = ColorizationBatcher::new(
            self.config.min_image_size,
            self.config.max_image_size,
            self.config.augment,
            self.config.seed,
        );
        let batcher_valid = ColorizationBatcher::new(
            self.config.min_image_size,
            self.config.max_image_size,
            false,
            self.config.seed,
        );

        let mut train_builder =
            DataLoaderBuilder::<B, ColorizationItem, LoadedBatch<B>>::new(batcher_train)
                .batch_size(self.config.batch_size)
                .shuffle(self.config.seed);
        let mut valid_builder = DataLoaderBuilder::<
            B::InnerBackend,
            ColorizationItem,
            LoadedBatch<B::InnerBackend>,
        >::new(batcher_valid)
        .batch_size(self.config.batch_size);

        if self.config.num_workers > 0 {
            train_builder = train_builder.num_workers(self.config.num_workers);
            valid_builder = valid_builder.num_workers(self.config.num_workers);
        }

        Ok((train_builder.build(train_data), valid_builder.build(valid_data)))
    }

    fn create_optimizer(&self) -> AdamConfig {
        AdamConfig::new()
            .with_weight_decay(Some(WeightDecayConfig::new(self.config.weight_decay as f32)))
            .with_beta_1(0.5)
            .with_beta_2(0.999)
    }

    fn scheduler(&self, name: &'static str) -> ReduceOnPlateau {
        ReduceOnPlateau::new(
            name,
            self.config.lr,
            self.config.scheduler_factor,
            self.config.scheduler_patience,
            self.config.min_lr,
        )
    }

    fn optimizers(
        &self,
    ) -> Optimizers<
        impl Optimizer<Generator<B>, B>,
        impl Optimizer<Classifier<B>, B>,
        impl Optimizer<Discriminator<B>, B>,
    > {
        Optimizers {
            generator: self.create_optimizer().init::<B, Generator<B>>(),
            classifier: self.create_optimizer().init::<B, Classifier<B>>(),
            discriminator: self.create_optimizer().init::<B, Discriminator<B>>(),
            generator_lr: self.scheduler("generator"),
            classifier_lr: self.scheduler("classifier"),
            discriminator_lr: self.scheduler("discriminator"),
        }
    }

    /// Epoch loop: train, validate through `validate`, checkpoint, stop
    /// early, then restore the best epoch.
    fn train_model<F>(
        &self,
        mut model: Colorizer<B>,
        train_loader: TrainLoader<B>,
        mut validate: F,
    ) -> Result<TrainingSummary>
    where
        F: FnMut(&Colorizer<B>, usize) -> Result<ValidationLosses>,
    {
        let config = &self.config;
        let save_dir = self.save_dir();
        let losses = LossAssembly::<B>::new(config, &self.device);

        let mut optimizers = self.optimizers();
        let mut tracker = ValidationTracker::new(config.patience);
        let mut scaler = LossScaler::new::<B>(config.mixed_precision);
        let mut summary = TrainingSummary {
            epochs_run: 0,
            best: None,
            early_stopped: false,
            skipped_batches: 0,
            dropped_items: 0,
        };

        info!("🎯 training for up to {} epochs", config.epochs);
        let start_time = Instant::now();

        for epoch in 1..=config.epochs {
            let epoch_start = Instant::now();
            let mut accumulation = Accumulation::<B>::new();
            let mut totals = StepLosses::default();
            let mut steps = 0;
            let mut skipped = 0;

            for loaded in train_loader.iter() {
                let batch = match loaded {
                    Ok(batch) => batch,
                    Err(EmptyBatch { dropped }) => {
                        warn!("⚠️ epoch {epoch}: batch had no loadable images, skipped");
                        summary.dropped_items += dropped;
                        skipped += 1;
                        continue;
                    }
                };
                summary.dropped_items += batch.skipped;

                let (next, result) = self.train_batch(
                    model,
                    batch,
                    &losses,
                    &mut scaler,
                    &mut accumulation,
                    &mut optimizers,
                );
                model = next;
                match result {
                    Ok(values) => {
                        totals.add(&values);
                        steps += 1;
                        debug!(
                            "epoch {epoch} step {steps}: d {:.4} g {:.4} cls {:.4}",
                            values.discriminator, values.generator, values.classification
                        );
                    }
                    Err(e) => {
                        warn!("⚠️ epoch {epoch}: batch skipped: {e}");
                        skipped += 1;
                    }
                }
            }

            if accumulation.discriminator_pending > 0 {
                debug!(
                    "flushing {} pending discriminator steps",
                    accumulation.discriminator_pending
                );
                model = optimizers.step_discriminator(model, &mut accumulation);
            }
            if accumulation.generator_pending > 0 {
                debug!(
                    "flushing {} pending generator steps",
                    accumulation.generator_pending
                );
                model = optimizers.step_generator(model, &mut accumulation);
                scaler.update(false);
            }

            summary.skipped_batches += skipped;
            let train = totals.mean(steps);
            let valid = validate(&model, epoch)?;
            summary.dropped_items += valid.dropped;

            info!(
                "📊 epoch {epoch}/{} ({:.1?}): train d {:.4} g {:.4} (pixel {:.4}, perceptual {:.4}, adv {:.4}) cls {:.4}; valid pixel {:.4} cls {:.4} ssim {:.4}; {skipped} skipped",
                config.epochs,
                epoch_start.elapsed(),
                train.discriminator,
                train.generator,
                train.pixel,
                train.perceptual,
                train.adversarial,
                train.classification,
                valid.pixel,
                valid.classification,
                valid.ssim,
            );

            optimizers.generator_lr.step(valid.pixel);
            optimizers.classifier_lr.step(valid.classification);
            if steps > 0 {
                optimizers.discriminator_lr.step(train.discriminator);
            }

            summary.epochs_run = epoch;
            let decision = tracker.observe(epoch, valid.total());
            if decision == CheckpointDecision::Improved {
                info!("⭐ new best validation loss {:.4}", valid.total());
                save_colorizer(&model, &save_dir.join("best"))
                    .context("failed to write best checkpoint")?;
            }

            if config.save_frequency > 0 && epoch % config.save_frequency == 0 {
                save_colorizer(&model, &save_dir.join(format!("epoch_{epoch}")))
                    .with_context(|| format!("failed to write epoch {epoch} checkpoint"))?;
            }

            if let CheckpointDecision::EarlyStop { stall } = decision {
                info!("⏹️  no improvement for {stall} epochs, stopping early");
                summary.early_stopped = true;
                break;
            }
        }

        info!("⏱️  training finished in {:.1?}", start_time.elapsed());

        summary.best = tracker.best();
        if let Some((best_epoch, best_loss)) = summary.best {
            info!("🔁 restoring best model from epoch {best_epoch} (loss {best_loss:.4})");
            model = load_colorizer::<B>(config, &save_dir.join("best"), &self.device)
                .context("failed to reload best checkpoint")?;
        }

        save_colorizer(&model, &save_dir.join("final")).context("failed to write final model")?;
        save_generator(&model.generator, &save_dir.join("generator"))
            .context("failed to write generator")?;

        Ok(summary)
    }

    /// One batch: discriminator update on the detached generator output,
    /// then the generator objective scored by that updated discriminator
    /// and one shared backward pass for generator and classifier. The model
    /// comes back even when the batch is skipped.
    fn train_batch<OG, OC, OD>(
        &self,
        mut model: Colorizer<B>,
        batch: ColorizationBatch<B>,
        losses: &LossAssembly<B>,
        scaler: &mut LossScaler,
        accumulation: &mut Accumulation<B>,
        optimizers: &mut Optimizers<OG, OC, OD>,
    ) -> (Colorizer<B>, Result<StepLosses>)
    where
        OG: Optimizer<Generator<B>, B>,
        OC: Optimizer<Classifier<B>, B>,
        OD: Optimizer<Discriminator<B>, B>,
    {
        let pass = match self.discriminator_pass(&model, losses, scaler, &batch) {
            Ok(pass) => pass,
            Err(e) => return (model, Err(e)),
        };
        let (grads, finite) = scaler.unscale::<B, _>(&model.discriminator, pass.grads);
        if !finite {
            let error = anyhow!("discriminator gradient overflow at loss scale {}", scaler.scale());
            scaler.update(true);
            return (model, Err(error));
        }
        accumulation.discriminator.accumulate(&model.discriminator, grads);
        accumulation.discriminator_pending += 1;
        if accumulation.discriminator_pending == self.config.accum_steps {
            model = optimizers.step_discriminator(model, accumulation);
        }

        let step = match self.generator_pass(&model, losses, scaler, batch, pass.generated) {
            Ok(step) => step,
            Err(e) => return (model, Err(e)),
        };
        let (grads_g, finite_g) = scaler.unscale::<B, _>(&model.generator, step.generator);
        let (grads_c, finite_c) = scaler.unscale::<B, _>(&model.classifier, step.classifier);
        if !(finite_g && finite_c) {
            let error = anyhow!("generator gradient overflow at loss scale {}", scaler.scale());
            scaler.update(true);
            return (model, Err(error));
        }
        accumulation.generator.accumulate(&model.generator, grads_g);
        accumulation.classifier.accumulate(&model.classifier, grads_c);
        accumulation.generator_pending += 1;
        if accumulation.generator_pending == self.config.accum_steps {
            model = optimizers.step_generator(model, accumulation);
            scaler.update(false);
        }

        let values = StepLosses {
            discriminator: pass.loss,
            ..step.losses
        };
        (model, Ok(values))
    }

    /// Runs generator and classifier once and returns the discriminator
    /// gradients computed on the detached colors.
    fn discriminator_pass(
        &self,
        model: &Colorizer<B>,
        losses: &LossAssembly<B>,
        scaler: &LossScaler,
        batch: &ColorizationBatch<B>,
    ) -> Result<DiscriminatorPass<B>> {
        let window = self.config.accum_steps as f64;

        guarded(|| {
            let output = model.forward(batch.grayscale.clone(), ForwardMode::Inference);
            let generated = Generated {
                color: output.color().clone(),
                semantic: output.semantic().clone(),
            };

            let real_realism = model
                .discriminator
                .forward(batch.grayscale.clone(), batch.color.clone());
            let fake_realism = model
                .discriminator
                .forward(batch.grayscale.clone(), generated.color.clone().detach());
            let loss = losses.discriminator_objective(real_realism, fake_realism);
            let value = scalar(&loss);
            ensure_finite("discriminator", value)?;

            let mut grads = scaler.scale_loss(loss.div_scalar(window)).backward();
            let grads = GradientsParams::from_module(&mut grads, &model.discriminator);

            Ok(DiscriminatorPass {
                grads,
                loss: value,
                generated,
            })
        })
    }

    /// Generator objective plus the weighted classification loss, split per
    /// sub-network after one backward pass.
    fn generator_pass(
        &self,
        model: &Colorizer<B>,
        losses: &LossAssembly<B>,
        scaler: &LossScaler,
        batch: ColorizationBatch<B>,
        generated: Generated<B>,
    ) -> Result<GeneratorPass> {
        let window = self.config.accum_steps as f64;
        let lambda_cls = losses.weights.classification;

        guarded(|| {
            let realism = model
                .discriminator
                .forward(batch.grayscale, generated.color.clone());
            let g = losses.generator_objective(generated.color, batch.color, realism);
            let cls = classification_loss(generated.semantic, batch.labels);

            let values = StepLosses {
                discriminator: 0.0,
                generator: scalar(&g.total),
                pixel: scalar(&g.pixel),
                perceptual: scalar(&g.perceptual),
                adversarial: scalar(&g.adversarial),
                classification: scalar(&cls),
            };
            ensure_finite("generator", values.generator)?;
            ensure_finite("classification", values.classification)?;

            let total = g.total + cls.mul_scalar(lambda_cls);
            let mut grads = scaler.scale_loss(total.div_scalar(window)).backward();

            Ok(GeneratorPass {
                generator: GradientsParams::from_module(&mut grads, &model.generator),
                classifier: GradientsParams::from_module(&mut grads, &model.classifier),
                losses: values,
            })
        })
    }

    /// Inference-mode pass over the validation split on the inner backend.
    fn validate(
        &self,
        model: &Colorizer<B>,
        valid_loader: &ValidLoader<B>,
        epoch: usize,
    ) -> Result<ValidationLosses> {
        let model = model.valid();
        let pixel_loss = PixelLoss::new(self.config.pixel_loss);
        let mut pixel = 0.0;
        let mut classification = 0.0;
        let mut similarity = 0.0;
        let mut seen = 0usize;
        let mut dropped = 0usize;
        let mut sample_saved = !self.config.save_samples;

        for loaded in valid_loader.iter() {
            let batch = match loaded {
                Ok(batch) => batch,
                Err(EmptyBatch { dropped: count }) => {
                    dropped += count;
                    continue;
                }
            };
            dropped += batch.skipped;
            let count = batch.labels.dims()[0];
            let output = model.forward(batch.grayscale.clone(), ForwardMode::Inference);
            let generated = output.color().clone();

            pixel += scalar(&pixel_loss.forward(generated.clone(), batch.color.clone()))
                * count as f64;
            let cls = classification_loss(output.semantic().clone(), batch.labels);
            classification += scalar(&cls) * count as f64;
            similarity += scalar(&ssim(generated.clone(), batch.color.clone())) * count as f64;
            seen += count;

            if !sample_saved {
                let path = self
                    .save_dir()
                    .join("samples")
                    .join(format!("epoch_{epoch}.png"));
                if let Err(e) = save_sample_strip(batch.grayscale, batch.color, generated, &path) {
                    warn!("⚠️ could not save sample {}: {e}", path.display());
                }
                sample_saved = true;
            }
        }

        if seen == 0 {
            warn!("⚠️ epoch {epoch}: no validation batch could be loaded");
            return Ok(ValidationLosses {
                pixel: f64::NAN,
                classification: f64::NAN,
                ssim: f64::NAN,
                dropped,
            });
        }

        let n = seen as f64;
        Ok(ValidationLosses {
            pixel: pixel / n,
            classification: classification / n,
            ssim: similarity / n,
            dropped,
        })
    }
}

/// Runs one fallible tensor computation, turning a backend panic into an
/// error so the batch can be skipped.
fn guarded<T>(work: impl FnOnce() -> Result<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(work)) {
        Ok(result) => result,
        Err(payload) => Err(anyhow!("backend panic: {}", panic_message(payload.as_ref()))),
    }
}

fn scalar<B: Backend>(tensor: &Tensor<B, 1>) -> f64 {
    tensor.clone().into_scalar().elem::<f64>()
}

fn ensure_finite(name: &str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(anyhow!("non-finite {name} loss ({value})"))
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
