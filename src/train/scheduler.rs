//! Reduce-on-plateau learning rate schedule, stepped once per epoch on the validation loss.

use burn::config::Config;
use tracing::info;

/// Cut the learning rate when a minimised metric stops improving. The defaults match the usual
/// reduce-on-plateau settings: factor 0.1, patience 10, relative threshold 1e-4.
#[derive(Config, Debug, PartialEq)]
pub struct PlateauConfig {
    #[config(default = 0.1)]
    pub factor: f64,
    /// Number of epochs without improvement tolerated before the rate is cut.
    #[config(default = 10)]
    pub patience: usize,
    /// Relative improvement needed for an epoch to count as better.
    #[config(default = 1.0e-4)]
    pub threshold: f64,
    /// Epochs to wait after a cut before counting bad epochs again.
    #[config(default = 0)]
    pub cooldown: usize,
    #[config(default = 0.)]
    pub min_lr: f64,
}

impl PlateauConfig {
    pub fn init(&self, initial_lr: f64) -> ReduceLrOnPlateau {
        ReduceLrOnPlateau {
            config: self.clone(),
            lr: initial_lr,
            best: f64::INFINITY,
            num_bad_epochs: 0,
            cooldown_counter: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReduceLrOnPlateau {
    config: PlateauConfig,
    lr: f64,
    best: f64,
    num_bad_epochs: usize,
    cooldown_counter: usize,
}

impl ReduceLrOnPlateau {
    pub fn lr(&self) -> f64 {
        self.lr
    }

    fn is_better(&self, metric: f64) -> bool {
        metric < self.best * (1. - self.config.threshold)
    }

    /// Record one epoch's metric; returns the learning rate to use from now on.
    pub fn step(&mut self, metric: f64) -> f64 {
        if self.is_better(metric) {
            self.best = metric;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            self.num_bad_epochs = 0;
        }

        if self.num_bad_epochs > self.config.patience {
            let new_lr = (self.lr * self.config.factor).max(self.config.min_lr);
            if self.lr - new_lr > 1e-8 {
                info!("Reducing learning rate: {:.3e} → {new_lr:.3e}", self.lr);
                self.lr = new_lr;
            }
            self.cooldown_counter = self.config.cooldown;
            self.num_bad_epochs = 0;
        }

        self.lr
    }
}
