use log::info;

const IMPROVEMENT_THRESHOLD: f64 = 1e-4;

/// Learning-rate schedule that multiplies the rate by `factor` once the
/// monitored loss has not improved for more than `patience` epochs.
#[derive(Debug, Clone)]
pub struct ReduceOnPlateau {
    name: &'static str,
    lr: f64,
    factor: f64,
    patience: usize,
    min_lr: f64,
    best: Option<f64>,
    bad_epochs: usize,
}

impl ReduceOnPlateau {
    pub fn new(name: &'static str, lr: f64, factor: f64, patience: usize, min_lr: f64) -> Self {
        Self {
            name,
            lr,
            factor,
            patience,
            min_lr,
            best: None,
            bad_epochs: 0,
        }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Feeds one epoch's metric and returns the learning rate to use next.
    pub fn step(&mut self, metric: f64) -> f64 {
        let improved = metric.is_finite()
            && self
                .best
                .map_or(true, |best| metric < best * (1.0 - IMPROVEMENT_THRESHOLD));

        if improved {
            self.best = Some(metric);
            self.bad_epochs = 0;
            return self.lr;
        }

        self.bad_epochs += 1;
        if self.bad_epochs > self.patience {
            let next = (self.lr * self.factor).max(self.min_lr);
            if next < self.lr {
                info!("{} learning rate {:.3e} -> {:.3e}", self.name, self.lr, next);
                self.lr = next;
            }
            self.bad_epochs = 0;
        }
        self.lr
    }
}

/// Outcome of comparing an epoch's validation loss with the best so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointDecision {
    Improved,
    Stalled { stall: usize },
    EarlyStop { stall: usize },
}

/// Tracks the best validation loss and the number of epochs since it.
#[derive(Debug, Clone)]
pub struct ValidationTracker {
    patience: usize,
    best: Option<(usize, f64)>,
    stall: usize,
}

impl ValidationTracker {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: None,
            stall: 0,
        }
    }

    /// Epoch (1-based) and loss of the best validation pass so far.
    pub fn best(&self) -> Option<(usize, f64)> {
        self.best
    }

    pub fn observe(&mut self, epoch: usize, loss: f64) -> CheckpointDecision {
        let improved = loss.is_finite() && self.best.map_or(true, |(_, best)| loss < best);
        if improved {
            self.best = Some((epoch, loss));
            self.stall = 0;
            return CheckpointDecision::Improved;
        }

        self.stall += 1;
        if self.stall >= self.patience {
            CheckpointDecision::EarlyStop { stall: self.stall }
        } else {
            CheckpointDecision::Stalled { stall: self.stall }
        }
    }
}
