use crate::{
    blocks::check_input, classifier::Classifier, config::TrainingConfig,
    discriminator::Discriminator, error::ColorizeError, generator::Generator,
};
use burn::{
    module::Module,
    tensor::{backend::Backend, Tensor},
};

/// Selects how much of the network a forward pass runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// Generator and classifier only.
    Inference,
    /// Also scores the generated colors with the discriminator.
    Adversarial,
}

#[derive(Debug, Clone)]
pub enum ColorizerOutput<B: Backend> {
    Inference {
        color: Tensor<B, 4>,
        semantic: Tensor<B, 2>,
    },
    Adversarial {
        color: Tensor<B, 4>,
        semantic: Tensor<B, 2>,
        realism: Tensor<B, 4>,
    },
}

impl<B: Backend> ColorizerOutput<B> {
    pub fn color(&self) -> &Tensor<B, 4> {
        match self {
            Self::Inference { color, .. } | Self::Adversarial { color, .. } => color,
        }
    }

    pub fn semantic(&self) -> &Tensor<B, 2> {
        match self {
            Self::Inference { semantic, .. } | Self::Adversarial { semantic, .. } => semantic,
        }
    }

    pub fn realism(&self) -> Option<&Tensor<B, 4>> {
        match self {
            Self::Inference { .. } => None,
            Self::Adversarial { realism, .. } => Some(realism),
        }
    }
}

/// Generator, semantic classifier and PatchGAN critic, each with its own
/// parameters and optimizer.
#[derive(Module, Debug)]
pub struct Colorizer<B: Backend> {
    pub generator: Generator<B>,
    pub classifier: Classifier<B>,
    pub discriminator: Discriminator<B>,
}

impl<B: Backend> Colorizer<B> {
    pub fn new(config: &TrainingConfig, device: &B::Device) -> Self {
        Self {
            generator: Generator::new(config.generator_width, device),
            classifier: Classifier::new(
                config.classifier_width,
                config.num_classes,
                config.dropout_rate,
                device,
            ),
            discriminator: Discriminator::new(config.discriminator_width, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, mode: ForwardMode) -> ColorizerOutput<B> {
        let color = self.generator.forward(x.clone());
        let semantic = self.classifier.forward(x.clone());

        match mode {
            ForwardMode::Inference => ColorizerOutput::Inference { color, semantic },
            ForwardMode::Adversarial => {
                let realism = self.discriminator.forward(x, color.clone());
                ColorizerOutput::Adversarial {
                    color,
                    semantic,
                    realism,
                }
            }
        }
    }

    pub fn try_forward(
        &self,
        x: Tensor<B, 4>,
        mode: ForwardMode,
    ) -> Result<ColorizerOutput<B>, ColorizeError> {
        check_input(&x, 1)?;
        Ok(self.forward(x, mode))
    }
}
