/// Stops training once validation loss has not improved for `patience`
/// consecutive epochs.
///
/// An epoch counts as an improvement when the loss drops by more than
/// `min_delta`, and as a miss when it drops by less (or rises). A drop of
/// exactly `min_delta` leaves the state untouched.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    counter: usize,
    best_loss: Option<f64>,
    should_stop: bool,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            counter: 0,
            best_loss: None,
            should_stop: false,
        }
    }

    pub fn observe(&mut self, val_loss: f64) {
        let Some(best) = self.best_loss else {
            self.best_loss = Some(val_loss);
            return;
        };

        let improvement = best - val_loss;
        if improvement > self.min_delta {
            self.best_loss = Some(val_loss);
            self.counter = 0;
        } else if improvement < self.min_delta {
            self.counter += 1;
            log::info!(
                "early stopping counter {} of {}",
                self.counter,
                self.patience
            );
            if self.counter >= self.patience {
                log::info!("early stopping triggered");
                self.should_stop = true;
            }
        }
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.best_loss
    }

    pub fn counter(&self) -> usize {
        self.counter
    }

    pub fn should_stop(&self) -> bool {
        self.should_stop
    }
}
