pub mod augment;
pub use augment::{Augmentation, Augmenter, LabelMix, MixCoefficients};

pub mod config;
pub use config::TrainConfig;

pub mod model;
pub use model::{Classifier, LinearClassifier};

pub mod training;
pub use training::{Trainer, TrainOutcome};

pub mod utils;

pub mod error;
pub use error::{MixTrainError, Result};
