use mimalloc::MiMalloc;

use clap::{Parser, ValueEnum};
use lumen_lora::data::Dataset;
use lumen_lora::lora::LayerAdaptationRegistry;
use lumen_lora::mnist_loader;
use lumen_lora::models::DigitClassifier;
use lumen_lora::module::Module;
use lumen_lora::optim::{Adam, Optimizer, SGD};
use lumen_lora::train::{evaluate, EvalReport, Trainer};
use lumen_lora::autograd::Tensor;
use lumen_lora::{LoraConfig, LoraError, Result, TrainConfig};

use ndarray::ArrayD;
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::SeedableRng;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OptimizerKind {
    Adam,
    Sgd,
}

/// Pre-train an MNIST classifier, then fine-tune LoRA adapters on one digit
/// while the base weights stay frozen.
#[derive(Parser, Debug)]
#[command(name = "lumen-lora", version, about)]
struct Args {
    /// Directory holding the four uncompressed MNIST IDX files
    #[arg(long, env = "MNIST_DIR", default_value = "data/mnist")]
    data_dir: PathBuf,

    /// Load pre-trained weights from here if present, otherwise save them here
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    #[arg(long, default_value_t = 1)]
    rank: usize,

    #[arg(long, default_value_t = 1.0)]
    alpha: f32,

    #[arg(long, default_value_t = 1e-3)]
    lr: f32,

    #[arg(long, value_enum, default_value_t = OptimizerKind::Adam)]
    optimizer: OptimizerKind,

    /// SGD only
    #[arg(long, default_value_t = 0.0)]
    momentum: f32,

    #[arg(long, default_value_t = 10)]
    batch_size: usize,

    #[arg(long, default_value_t = 1)]
    pretrain_epochs: usize,

    #[arg(long, default_value_t = 1)]
    finetune_epochs: usize,

    /// Total fine-tuning iterations, across epochs
    #[arg(long, default_value_t = 100)]
    finetune_iterations: usize,

    /// Digit the adapters are fine-tuned on
    #[arg(long, default_value_t = 9)]
    target_digit: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(long, default_value_t = 100)]
    log_every: usize,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "run failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let lora = LoraConfig::new(args.rank, args.alpha);
    lora.validate()?;
    if args.target_digit >= DigitClassifier::NUM_CLASSES {
        return Err(LoraError::InvalidConfig(format!(
            "target digit must be below {}, got {}",
            DigitClassifier::NUM_CLASSES,
            args.target_digit
        )));
    }
    let pretrain = TrainConfig {
        learning_rate: args.lr,
        epochs: args.pretrain_epochs,
        iteration_limit: None,
        batch_size: args.batch_size,
        log_every: args.log_every,
    };
    let finetune = TrainConfig {
        epochs: args.finetune_epochs,
        ..pretrain
    }
    .with_iteration_limit(args.finetune_iterations);
    pretrain.validate()?;
    finetune.validate()?;

    let data = mnist_loader::load(&args.data_dir)?;
    info!(train = data.train.len(), test = data.test.len(), "MNIST loaded");

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut model = DigitClassifier::with_sizes_rng(
        DigitClassifier::INPUT_DIM,
        1000,
        2000,
        DigitClassifier::NUM_CLASSES,
        &mut rng,
    );

    match &args.checkpoint {
        Some(path) if path.is_file() => model.load(path)?,
        _ => {
            let train_set = data.train.shuffled(&mut rng);
            let mut optimizer = build_optimizer(&args, model.parameters(), pretrain.learning_rate);
            pretrain_model(&mut model, optimizer.as_mut(), &train_set, pretrain)?;
            if let Some(path) = &args.checkpoint {
                model.save(path)?;
            }
        }
    }

    let baseline = evaluate(&model, data.test.batches(args.batch_size), model.num_classes());
    report("pre-trained", &baseline);

    let snapshot: Vec<(&'static str, ArrayD<f32>)> = model
        .layers()
        .into_iter()
        .map(|(name, layer)| (name, layer.base_weight().data()))
        .collect();

    let mut registry = LayerAdaptationRegistry::with_seed(args.seed);
    for (name, layer) in model.layers_mut() {
        registry.attach(name, layer, lora)?;
    }
    let frozen = registry.freeze(|p| !p.role.is_adapter_factor());
    let count = registry.count_parameters();
    info!(
        base = count.base,
        adapter = count.adapter,
        increase = %format!("{:.3}%", count.adapter_ratio() * 100.0),
        frozen,
        "adapters attached"
    );

    let target = data.train.filter_label(args.target_digit);
    info!(digit = args.target_digit, samples = target.len(), "fine-tuning on a single digit");
    let mut optimizer = build_optimizer(&args, registry.trainable_parameters(), finetune.learning_rate);
    let mut trainer = Trainer::new(finetune)?;
    let run = trainer.train(&mut model, optimizer.as_mut(), || target.batches(finetune.batch_size))?;
    info!(iterations = run.iterations, mean_loss = run.mean_loss, state = ?run.final_state, "fine-tuning done");

    for ((name, layer), (_, before)) in model.layers().into_iter().zip(&snapshot) {
        if layer.base_weight().data() != *before {
            return Err(LoraError::BaseWeightsChanged {
                layer: name.to_string(),
            });
        }
    }
    info!("base weights unchanged");

    let adapted = evaluate(&model, data.test.batches(args.batch_size), model.num_classes());
    report("with LoRA", &adapted);
    println!(
        "digit {}: {} wrong before, {} wrong after fine-tuning",
        args.target_digit,
        baseline.wrong(args.target_digit),
        adapted.wrong(args.target_digit)
    );

    registry.set_all_enabled(false);
    let restored = evaluate(&model, data.test.batches(args.batch_size), model.num_classes());
    report("LoRA disabled", &restored);
    if restored != baseline {
        warn!("disabling the adapters did not reproduce the pre-trained results");
    }

    Ok(())
}

fn build_optimizer(args: &Args, params: Vec<Tensor>, lr: f32) -> Box<dyn Optimizer> {
    match args.optimizer {
        OptimizerKind::Adam => Box::new(Adam::new(params, lr)),
        OptimizerKind::Sgd => Box::new(SGD::new(params, lr).with_momentum(args.momentum)),
    }
}

fn pretrain_model(
    model: &mut DigitClassifier,
    optimizer: &mut dyn Optimizer,
    train_set: &Dataset,
    config: TrainConfig,
) -> Result<()> {
    let mut trainer = Trainer::new(config)?;
    let run = trainer.train(model, optimizer, || train_set.batches(config.batch_size))?;
    info!(
        iterations = run.iterations,
        mean_loss = run.mean_loss,
        secs = run.elapsed_secs,
        "pre-training done"
    );
    Ok(())
}

fn report(label: &str, eval: &EvalReport) {
    info!(label, accuracy = eval.accuracy(), "evaluation");
    println!("== {label} ==");
    print!("{eval}");
}
