use crate::blocks::{resize_bilinear, upscaled_size};
use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, LeakyRelu, LeakyReluConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::backend::Backend,
};

/// Ratio between input and patch-grid resolution.
pub const PATCH_STRIDE: usize = 8;
const MIN_DISCRIMINATOR_SIDE: usize = 16;

/// PatchGAN critic over (grayscale, color) pairs. Emits one realism logit
/// per receptive-field patch, shaped (B, 1, H/8, W/8).
#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    norm2: BatchNorm<B, 2>,
    conv3: Conv2d<B>,
    norm3: BatchNorm<B, 2>,
    conv_out: Conv2d<B>,
    lrelu: LeakyRelu,
}

impl<B: Backend> Discriminator<B> {
    pub fn new(width: usize, device: &B::Device) -> Self {
        let down = |cin, cout| {
            Conv2dConfig::new([cin, cout], [4, 4])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };

        Self {
            conv1: down(4, width),
            conv2: down(width, width * 2),
            norm2: BatchNormConfig::new(width * 2).init(device),
            conv3: down(width * 2, width * 4),
            norm3: BatchNormConfig::new(width * 4).init(device),
            conv_out: Conv2dConfig::new([width * 4, 1], [4, 4])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            lrelu: LeakyReluConfig::new().with_negative_slope(0.2).init(),
        }
    }

    pub fn forward(&self, grayscale: Tensor<B, 4>, color: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = grayscale.dims();
        let color = resize_bilinear(color, [height, width]);
        let x = Tensor::cat(vec![grayscale, color], 1);
        let x = match upscaled_size(height, width, MIN_DISCRIMINATOR_SIDE) {
            Some(size) => resize_bilinear(x, size),
            None => x,
        };

        let x = self.lrelu.forward(self.conv1.forward(x));
        let x = self.lrelu.forward(self.norm2.forward(self.conv2.forward(x)));
        let x = self.lrelu.forward(self.norm3.forward(self.conv3.forward(x)));

        // Pad left/top only so the 4x4 head keeps the H/8 x W/8 grid.
        self.conv_out.forward(x.pad((1, 0, 1, 0), 0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn patch_grid_scales_with_input() {
        let device = Default::default();
        let discriminator = Discriminator::<TestBackend>::new(8, &device);

        for [batch, height, width] in [[1, 64, 64], [3, 32, 96], [2, 128, 48]] {
            let gray = Tensor::<TestBackend, 4>::random(
                [batch, 1, height, width],
                Distribution::Default,
                &device,
            );
            let color = Tensor::<TestBackend, 4>::random(
                [batch, 3, height, width],
                Distribution::Default,
                &device,
            );
            let out = discriminator.forward(gray, color);
            assert_eq!(
                out.dims(),
                [batch, 1, height / PATCH_STRIDE, width / PATCH_STRIDE]
            );
        }
    }

    #[test]
    fn mismatched_color_is_resampled() {
        let device = Default::default();
        let discriminator = Discriminator::<TestBackend>::new(8, &device);
        let gray = Tensor::<TestBackend, 4>::zeros([1, 1, 64, 64], &device);
        let color = Tensor::<TestBackend, 4>::zeros([1, 3, 40, 52], &device);

        assert_eq!(discriminator.forward(gray, color).dims(), [1, 1, 8, 8]);
    }
}
