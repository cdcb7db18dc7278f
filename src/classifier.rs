use crate::blocks::resize_bilinear;
use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
    tensor::{backend::Backend, module::adaptive_avg_pool2d},
};

/// Below this side the three pooling stages would collapse the feature map.
pub const MIN_CLASSIFIER_SIDE: usize = 32;
const RESIZED_SIDE: usize = 64;
const POOLED_GRID: usize = 8;
const HIDDEN_UNITS: usize = 512;

/// Auxiliary semantic head: grayscale (B,1,H,W) to class logits (B,num_classes).
#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    pool: MaxPool2d,
    fc1: Linear<B>,
    fc2: Linear<B>,
    dropout: Dropout,
    relu: Relu,
    features: usize,
}

impl<B: Backend> Classifier<B> {
    pub fn new(width: usize, num_classes: usize, dropout_rate: f64, device: &B::Device) -> Self {
        let conv = |cin, cout| {
            Conv2dConfig::new([cin, cout], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };
        let channels = width * 4;
        let features = channels * POOLED_GRID * POOLED_GRID;

        Self {
            conv1: conv(1, width),
            conv2: conv(width, width * 2),
            conv3: conv(width * 2, channels),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            fc1: LinearConfig::new(features, HIDDEN_UNITS).init(device),
            fc2: LinearConfig::new(HIDDEN_UNITS, num_classes).init(device),
            dropout: DropoutConfig::new(dropout_rate).init(),
            relu: Relu::new(),
            features,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, _, height, width] = x.dims();
        let x = if height.min(width) < MIN_CLASSIFIER_SIDE {
            resize_bilinear(x, [RESIZED_SIDE, RESIZED_SIDE])
        } else {
            x
        };

        let x = self.pool.forward(self.relu.forward(self.conv1.forward(x)));
        let x = self.pool.forward(self.relu.forward(self.conv2.forward(x)));
        let x = self.pool.forward(self.relu.forward(self.conv3.forward(x)));
        let x = adaptive_avg_pool2d(x, [POOLED_GRID, POOLED_GRID]).reshape([batch, self.features]);

        let x = self.fc1.forward(x);
        let x = self.relu.forward(x);
        let x = self.dropout.forward(x);
        self.fc2.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn logits_shape_is_independent_of_input_size() {
        let device = Default::default();
        let classifier = Classifier::<TestBackend>::new(4, 10, 0.5, &device);

        for [batch, height, width] in [[1, 64, 64], [2, 96, 40], [3, 33, 70]] {
            let x = Tensor::<TestBackend, 4>::random(
                [batch, 1, height, width],
                Distribution::Default,
                &device,
            );
            assert_eq!(classifier.forward(x).dims(), [batch, 10]);
        }
    }

    #[test]
    fn tiny_inputs_are_upsampled_first() {
        let device = Default::default();
        let classifier = Classifier::<TestBackend>::new(4, 7, 0.5, &device);

        for [height, width] in [[8, 8], [16, 128], [31, 31]] {
            let x = Tensor::<TestBackend, 4>::random(
                [2, 1, height, width],
                Distribution::Default,
                &device,
            );
            assert_eq!(classifier.forward(x).dims(), [2, 7]);
        }
    }
}
