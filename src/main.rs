use anyhow::{Context, Result};
use log::info;
use std::env;

use mixtrain::config::{TrainConfig, ValidationMode};
use mixtrain::model::LinearClassifier;
use mixtrain::training::{
    validate_checkpoints, ClassifierWithLoss, Dataset, DatasetValidator, LogSink, Sgd,
    SingleProcess, TrainOutcome, Trainer,
};

const INPUT_SHAPE: (usize, usize, usize) = (3, 8, 8);
const NUM_CLASSES: usize = 10;
const TRAIN_BATCHES: usize = 32;
const VALIDATION_BATCHES: usize = 8;

fn load_config(path: Option<&String>) -> Result<TrainConfig> {
    match path {
        Some(path) => TrainConfig::from_json_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path)),
        None => Ok(TrainConfig::default()),
    }
}

fn synthetic_data(config: &TrainConfig, batches: usize, seed_offset: u64) -> Result<Dataset> {
    let batch_size = config.host_batch_size();
    let seed = config.seed.unwrap_or(0).wrapping_add(seed_offset);
    Dataset::synthetic(batches * batch_size, INPUT_SHAPE, NUM_CLASSES, batch_size, seed)
        .context("Failed to build synthetic dataset")
}

fn build_model(config: &TrainConfig, optimizer: &Sgd) -> Result<ClassifierWithLoss<LinearClassifier>> {
    let classifier = LinearClassifier::new(INPUT_SHAPE, NUM_CLASSES, config.seed)?;
    Ok(ClassifierWithLoss::from_config(classifier, config, optimizer)?)
}

fn train(config: TrainConfig) -> Result<()> {
    let train_data = synthetic_data(&config, TRAIN_BATCHES, 0)?;
    let validation_data = synthetic_data(&config, VALIDATION_BATCHES, 1)?;

    let optimizer = Sgd::from_config(&config);
    let model = build_model(&config, &optimizer)?;
    let validation_config = config.clone();

    let mut trainer = Trainer::new(
        config,
        Box::new(model),
        Box::new(optimizer),
        Box::new(LogSink),
        Box::new(SingleProcess),
    )?
    .with_validator(Box::new(DatasetValidator::new(validation_data.clone())));

    match trainer.train(&train_data).context("Training failed")? {
        TrainOutcome::Completed(summary) => {
            info!(
                "Finished {} epochs, last epoch throughput {:.1} img/sec",
                summary.epochs_completed, summary.throughput
            );
        }
        TrainOutcome::CompiledOnly | TrainOutcome::ProfiledOnly => return Ok(()),
    }

    if validation_config.validation_mode != ValidationMode::After {
        return Ok(());
    }
    match &validation_config.checkpoint_dir {
        Some(dir) => {
            info!("Validating checkpoints in {}", dir.display());
            validate(&validation_config, dir, validation_data)
        }
        None => {
            trainer.validate_after_training().context("Validation failed")?;
            Ok(())
        }
    }
}

fn validate(config: &TrainConfig, dir: &std::path::Path, data: Dataset) -> Result<()> {
    let optimizer = Sgd::from_config(config);
    let mut model = build_model(config, &optimizer)?;
    let mut validator = DatasetValidator::new(data);
    let results = validate_checkpoints(dir, &mut model, &mut validator, &mut LogSink)
        .context("Checkpoint validation failed")?;
    for (path, accuracy) in results {
        println!("{}: {:.2}%", path.display(), accuracy);
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("train") => {
            let config = load_config(args.get(2))?;
            train(config)
        }
        Some("validate") => {
            let dir = args.get(2).context("validate needs a checkpoint directory")?;
            let config = load_config(args.get(3))?;
            let data = synthetic_data(&config, VALIDATION_BATCHES, 1)?;
            validate(&config, std::path::Path::new(dir), data)
        }
        _ => {
            println!("Usage: mixtrain [train|validate] ...");
            println!("Example commands:");
            println!("  mixtrain train config.json");
            println!("  mixtrain validate checkpoints/ config.json");
            Ok(())
        }
    }
}
