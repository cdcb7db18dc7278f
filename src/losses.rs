use crate::{
    blocks::resize_bilinear,
    config::{AdversarialKind, PixelKind, TrainingConfig},
};
use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::{MseLoss, Reduction},
        pool::AvgPool2dConfig,
        InstanceNorm, InstanceNormConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, loss::cross_entropy_with_logits, Int, Tensor},
};

/// GAN criterion against constant real (1) / fake (0) targets.
#[derive(Debug, Clone, Copy)]
pub struct AdversarialLoss {
    kind: AdversarialKind,
}

impl AdversarialLoss {
    pub fn new(kind: AdversarialKind) -> Self {
        Self { kind }
    }

    pub fn forward<B: Backend>(
        &self,
        prediction: Tensor<B, 4>,
        target_is_real: bool,
    ) -> Tensor<B, 1> {
        let target = if target_is_real {
            prediction.ones_like()
        } else {
            prediction.zeros_like()
        };

        match self.kind {
            AdversarialKind::LeastSquares => {
                MseLoss::new().forward(prediction, target, Reduction::Mean)
            }
            AdversarialKind::Logistic => {
                // Binary cross-entropy on logits in its overflow-safe form.
                let zeros = prediction.zeros_like();
                let max_val = prediction.clone().max_pair(zeros);
                let bce_term = max_val - prediction.clone() * target;
                let log_term = (prediction.abs().neg().exp() + 1.0).log();
                (bce_term + log_term).mean()
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PixelLoss {
    kind: PixelKind,
}

impl PixelLoss {
    pub fn new(kind: PixelKind) -> Self {
        Self { kind }
    }

    /// `prediction` is resampled to the target size first.
    pub fn forward<B: Backend>(
        &self,
        prediction: Tensor<B, 4>,
        target: Tensor<B, 4>,
    ) -> Tensor<B, 1> {
        let [_, _, height, width] = target.dims();
        let prediction = resize_bilinear(prediction, [height, width]);

        match self.kind {
            PixelKind::L1 => (prediction - target).abs().mean(),
            PixelKind::L2 => MseLoss::new().forward(prediction, target, Reduction::Mean),
        }
    }
}

pub fn classification_loss<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    let num_classes = logits.dims()[1];
    let targets_one_hot = targets.one_hot(num_classes).float();

    cross_entropy_with_logits(logits, targets_one_hot).mean()
}

const PERCEPTUAL_WEIGHTS: [f64; 4] = [0.1, 0.2, 0.3, 0.4];

/// Feature-space distance through a small randomly initialised extractor
/// whose weights are frozen. Deeper layers weigh more.
#[derive(Module, Debug)]
pub struct PerceptualLoss<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    conv4: Conv2d<B>,
    norm1: InstanceNorm<B>,
    norm2: InstanceNorm<B>,
    norm3: InstanceNorm<B>,
    norm4: InstanceNorm<B>,
    relu: Relu,
}

impl<B: Backend> PerceptualLoss<B> {
    pub fn new(device: &B::Device) -> Self {
        let conv = |cin, cout, stride| {
            Conv2dConfig::new([cin, cout], [3, 3])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };
        let norm = |channels| InstanceNormConfig::new(channels).with_affine(false).init(device);

        let extractor = Self {
            conv1: conv(3, 32, 1),
            conv2: conv(32, 64, 2),
            conv3: conv(64, 128, 2),
            conv4: conv(128, 256, 2),
            norm1: norm(32),
            norm2: norm(64),
            norm3: norm(128),
            norm4: norm(256),
            relu: Relu::new(),
        };
        extractor.no_grad()
    }

    fn features(&self, x: Tensor<B, 4>) -> [Tensor<B, 4>; 4] {
        let f1 = self.relu.forward(self.norm1.forward(self.conv1.forward(x)));
        let f2 = self.relu.forward(self.norm2.forward(self.conv2.forward(f1.clone())));
        let f3 = self.relu.forward(self.norm3.forward(self.conv3.forward(f2.clone())));
        let f4 = self.relu.forward(self.norm4.forward(self.conv4.forward(f3.clone())));
        [f1, f2, f3, f4]
    }

    pub fn forward(&self, prediction: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
        let [_, _, ph, pw] = prediction.dims();
        let [_, _, th, tw] = target.dims();
        // The larger image is brought down to the smaller one.
        let (prediction, target) = if ph * pw > th * tw {
            (resize_bilinear(prediction, [th, tw]), target)
        } else {
            (prediction, resize_bilinear(target, [ph, pw]))
        };

        let mse = MseLoss::new();
        let [p1, p2, p3, p4] = self.features(prediction);
        let [t1, t2, t3, t4] = self.features(target);
        let [w1, w2, w3, w4] = PERCEPTUAL_WEIGHTS;

        mse.forward(p1, t1, Reduction::Mean).mul_scalar(w1)
            + mse.forward(p2, t2, Reduction::Mean).mul_scalar(w2)
            + mse.forward(p3, t3, Reduction::Mean).mul_scalar(w3)
            + mse.forward(p4, t4, Reduction::Mean).mul_scalar(w4)
    }
}

/// Scalar weights of the generator objective.
#[derive(Debug, Clone, Copy)]
pub struct LossWeights {
    pub perceptual: f64,
    pub gan: f64,
    pub classification: f64,
}

impl From<&TrainingConfig> for LossWeights {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            perceptual: config.lambda_perceptual,
            gan: config.lambda_gan,
            classification: config.lambda_classification,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorLosses<B: Backend> {
    pub pixel: Tensor<B, 1>,
    pub perceptual: Tensor<B, 1>,
    pub adversarial: Tensor<B, 1>,
    pub total: Tensor<B, 1>,
}

/// Every criterion of the training run, built once from the config.
#[derive(Debug)]
pub struct LossAssembly<B: Backend> {
    pub adversarial: AdversarialLoss,
    pub pixel: PixelLoss,
    pub perceptual: PerceptualLoss<B>,
    pub weights: LossWeights,
}

impl<B: Backend> LossAssembly<B> {
    pub fn new(config: &TrainingConfig, device: &B::Device) -> Self {
        Self {
            adversarial: AdversarialLoss::new(config.adversarial_loss),
            pixel: PixelLoss::new(config.pixel_loss),
            perceptual: PerceptualLoss::new(device),
            weights: LossWeights::from(config),
        }
    }

    /// pixel + λp·perceptual + λgan·adv(fake judged real).
    pub fn generator_objective(
        &self,
        generated: Tensor<B, 4>,
        target: Tensor<B, 4>,
        fake_realism: Tensor<B, 4>,
    ) -> GeneratorLosses<B> {
        let [_, _, height, width] = target.dims();
        let generated = resize_bilinear(generated, [height, width]);

        let pixel = self.pixel.forward(generated.clone(), target.clone());
        let perceptual = self.perceptual.forward(generated, target);
        let adversarial = self.adversarial.forward(fake_realism, true);
        let total = pixel.clone()
            + perceptual.clone().mul_scalar(self.weights.perceptual)
            + adversarial.clone().mul_scalar(self.weights.gan);

        GeneratorLosses {
            pixel,
            perceptual,
            adversarial,
            total,
        }
    }

    /// Mean of the real and fake terms. `fake_realism` must come from a
    /// detached generator output.
    pub fn discriminator_objective(
        &self,
        real_realism: Tensor<B, 4>,
        fake_realism: Tensor<B, 4>,
    ) -> Tensor<B, 1> {
        let real = self.adversarial.forward(real_realism, true);
        let fake = self.adversarial.forward(fake_realism, false);
        (real + fake).mul_scalar(0.5)
    }
}

const SSIM_WINDOW: usize = 7;
const SSIM_C1: f64 = 0.01 * 0.01;
const SSIM_C2: f64 = 0.03 * 0.03;

/// Mean structural similarity over a uniform window, for images in [0, 1].
pub fn ssim<B: Backend>(x: Tensor<B, 4>, y: Tensor<B, 4>) -> Tensor<B, 1> {
    let [_, _, height, width] = y.dims();
    let x = resize_bilinear(x, [height, width]);
    let window = SSIM_WINDOW.min(height).min(width).max(1);
    let pool = AvgPool2dConfig::new([window, window])
        .with_strides([1, 1])
        .init();

    let mu_x = pool.forward(x.clone());
    let mu_y = pool.forward(y.clone());
    let mu_x2 = mu_x.clone().powf_scalar(2.0);
    let mu_y2 = mu_y.clone().powf_scalar(2.0);
    let mu_xy = mu_x * mu_y;

    let sigma_x = pool.forward(x.clone().powf_scalar(2.0)) - mu_x2.clone();
    let sigma_y = pool.forward(y.clone().powf_scalar(2.0)) - mu_y2.clone();
    let sigma_xy = pool.forward(x * y) - mu_xy.clone();

    let numerator = (mu_xy.mul_scalar(2.0) + SSIM_C1) * (sigma_xy.mul_scalar(2.0) + SSIM_C2);
    let denominator = (mu_x2 + mu_y2 + SSIM_C1) * (sigma_x + sigma_y + SSIM_C2);
    (numerator / denominator).mean()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, TensorData};

    type TestBackend = NdArray<f32>;

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_scalar()
    }

    #[test]
    fn least_squares_targets() {
        let device = Default::default();
        let loss = AdversarialLoss::new(AdversarialKind::LeastSquares);
        let ones = Tensor::<TestBackend, 4>::ones([2, 1, 4, 4], &device);

        assert_eq!(scalar(loss.forward(ones.clone(), true)), 0.0);
        assert_eq!(scalar(loss.forward(ones, false)), 1.0);
    }

    #[test]
    fn logistic_loss_at_zero_logit_is_ln2() {
        let device = Default::default();
        let loss = AdversarialLoss::new(AdversarialKind::Logistic);
        let zeros = Tensor::<TestBackend, 4>::zeros([1, 1, 3, 3], &device);

        let real = scalar(loss.forward(zeros.clone(), true));
        let fake = scalar(loss.forward(zeros, false));
        assert!((real - std::f32::consts::LN_2).abs() < 1e-5);
        assert!((fake - std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn logistic_loss_rewards_confident_correct_logits() {
        let device = Default::default();
        let loss = AdversarialLoss::new(AdversarialKind::Logistic);
        let confident = Tensor::<TestBackend, 4>::full([1, 1, 2, 2], 8.0, &device);

        assert!(scalar(loss.forward(confident.clone(), true)) < 1e-3);
        assert!(scalar(loss.forward(confident, false)) > 7.9);
    }

    #[test]
    fn pixel_losses() {
        let device = Default::default();
        let zeros = Tensor::<TestBackend, 4>::zeros([1, 3, 4, 4], &device);
        let halves = Tensor::<TestBackend, 4>::full([1, 3, 4, 4], 0.5, &device);

        assert_eq!(scalar(PixelLoss::new(PixelKind::L1).forward(zeros.clone(), halves.clone())), 0.5);
        assert_eq!(scalar(PixelLoss::new(PixelKind::L2).forward(zeros, halves)), 0.25);
    }

    #[test]
    fn pixel_loss_resamples_prediction() {
        let device = Default::default();
        let prediction = Tensor::<TestBackend, 4>::full([1, 3, 9, 9], 0.25, &device);
        let target = Tensor::<TestBackend, 4>::full([1, 3, 8, 8], 0.25, &device);

        assert!(scalar(PixelLoss::new(PixelKind::L1).forward(prediction, target)) < 1e-6);
    }

    #[test]
    fn cross_entropy_of_uniform_logits() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::zeros([3, 4], &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([0i64, 2, 3]), &device);

        let loss = scalar(classification_loss(logits, targets));
        assert!((loss - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn perceptual_loss_is_zero_for_identical_images() {
        let device = Default::default();
        let perceptual = PerceptualLoss::<TestBackend>::new(&device);
        let x = Tensor::<TestBackend, 4>::random([1, 3, 32, 32], Distribution::Default, &device);
        let y = Tensor::<TestBackend, 4>::random([1, 3, 32, 32], Distribution::Default, &device);

        assert!(scalar(perceptual.forward(x.clone(), x.clone())) < 1e-6);
        assert!(scalar(perceptual.forward(x, y)) > 0.0);
    }

    #[test]
    fn perceptual_loss_handles_size_mismatch() {
        let device = Default::default();
        let perceptual = PerceptualLoss::<TestBackend>::new(&device);
        let x = Tensor::<TestBackend, 4>::random([2, 3, 40, 40], Distribution::Default, &device);
        let y = Tensor::<TestBackend, 4>::random([2, 3, 32, 32], Distribution::Default, &device);

        assert!(scalar(perceptual.forward(x, y)).is_finite());
    }

    #[test]
    fn objectives_combine_terms() {
        let device = Default::default();
        let config = TrainingConfig {
            lambda_perceptual: 0.0,
            lambda_gan: 1.0,
            ..Default::default()
        };
        let losses = LossAssembly::<TestBackend>::new(&config, &device);
        let target = Tensor::<TestBackend, 4>::full([1, 3, 16, 16], 0.5, &device);
        let realism = Tensor::<TestBackend, 4>::ones([1, 1, 2, 2], &device);

        let generator = losses.generator_objective(target.clone(), target, realism.clone());
        assert!(scalar(generator.total) < 1e-6);

        // Real scored 1 and fake scored 1: only the fake half is wrong.
        let discriminator = losses.discriminator_objective(realism.clone(), realism);
        assert_eq!(scalar(discriminator), 0.5);
    }

    #[test]
    fn ssim_of_identical_images_is_one() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::random([1, 3, 16, 16], Distribution::Default, &device);

        let same = scalar(ssim(x.clone(), x.clone()));
        let inverted = scalar(ssim(x.clone().neg() + 1.0, x));
        assert!((same - 1.0).abs() < 1e-4);
        assert!(inverted < same);
    }
}
