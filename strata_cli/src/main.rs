use strata_core::config::StrataConfig;
use strata_core::mutator::{ArrayCountMutator, ChoiceSwitchMutator, FlipBitsMutator, Mutator};
use strata_core::{BitStream, DataModel, ModelDef, StrataError};

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser, global = true)]
    config_file: Option<PathBuf>,
    /// Log filter, e.g. `debug` or `strata_core=trace`. Overrides RUST_LOG.
    #[clap(long, global = true)]
    log_level: Option<String>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate the model's default output.
    Generate {
        model: PathBuf,
        /// Write to this file instead of stdout.
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
    /// Crack an input file against the model and print the result as JSON.
    Crack { model: PathBuf, input: PathBuf },
    /// Print the model as pit XML.
    Pit { model: PathBuf },
    /// Mutate the model repeatedly and keep every distinct output.
    Fuzz {
        model: PathBuf,
        #[clap(short, long)]
        iterations: Option<u64>,
        #[clap(long)]
        seed: Option<u64>,
        #[clap(short, long)]
        output_dir: Option<PathBuf>,
    },
}

fn init_tracing(level: Option<&str>) -> Result<(), anyhow::Error> {
    let filter = match level {
        Some(level) => {
            EnvFilter::try_new(level).with_context(|| format!("Invalid log level '{level}'"))?
        }
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<StrataConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            info!(path = ?config_path, "Loading configuration");
            StrataConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from("strata.toml");
            if default_config_path.exists() {
                info!(path = ?default_config_path, "No config file specified, loading default");
                StrataConfig::load_from_file(&default_config_path)
            } else {
                debug!(
                    "No config file specified and 'strata.toml' not found, using built-in defaults"
                );
                Ok(StrataConfig::default())
            }
        }
    }
}

fn load_model(path: &PathBuf, config: &StrataConfig) -> Result<DataModel, anyhow::Error> {
    let def = ModelDef::load_from_file(path)?;
    def.build_with_config(config.engine.clone())
        .with_context(|| format!("Failed to build model from {path:?}"))
}

fn generate(model: &mut DataModel, output: Option<&Path>) -> Result<(), anyhow::Error> {
    let root = model.root();
    let value = model.value(root)?;
    let bytes = value.to_bytes();
    match output {
        Some(path) => {
            std::fs::write(path, &bytes)
                .with_context(|| format!("Failed to write output to {path:?}"))?;
            info!(path = ?path, bytes = bytes.len(), "Wrote generated output");
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn crack(model: &mut DataModel, input: &Path) -> Result<(), anyhow::Error> {
    let bytes =
        std::fs::read(input).with_context(|| format!("Failed to read input file {input:?}"))?;
    let mut data = BitStream::from_bytes(bytes);
    if let Err(error) = model.crack(&mut data) {
        if let StrataError::Cracking(failure) = &error {
            let root_cause = failure.root_cause();
            warn!(
                element = %root_cause.element,
                position = root_cause.position,
                "{}",
                root_cause.message
            );
        }
        return Err(error).with_context(|| format!("Failed to crack {input:?}"));
    }
    if data.remaining() > 0 {
        warn!(
            consumed = data.position(),
            remaining = data.remaining(),
            "Model did not consume all of the input"
        );
    }
    let snapshot = model.snapshot()?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn fuzz(
    base: &DataModel,
    max_iterations: u64,
    seed: u64,
    output_dir: &Path,
) -> Result<(), anyhow::Error> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory {output_dir:?}"))?;

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut mutators: Vec<Box<dyn Mutator<ChaCha8Rng>>> = vec![
        Box::new(FlipBitsMutator::default()),
        Box::new(ArrayCountMutator::default()),
        Box::new(ChoiceSwitchMutator),
    ];
    let mut known_hashes: HashSet<[u8; 16]> = HashSet::new();

    info!(iterations = max_iterations, seed, output_dir = ?output_dir, "Starting fuzz loop");
    let start_time = Instant::now();
    let mut failures = 0u64;

    for i in 0..max_iterations {
        let mut model = base.clone();
        let rounds = 1 + rng.next_u32() % 3;
        for _ in 0..rounds {
            let index = rng.next_u32() as usize % mutators.len();
            let mutator = &mut mutators[index];
            match mutator.mutate(&mut model, &mut rng) {
                Ok(Some(target)) => debug!(
                    iteration = i,
                    mutator = mutator.name(),
                    element = %model[target].full_name(),
                    "Mutated"
                ),
                Ok(None) => debug!(iteration = i, mutator = mutator.name(), "Nothing to mutate"),
                Err(e) => {
                    failures += 1;
                    warn!(iteration = i, mutator = mutator.name(), "Mutation failed: {e}");
                }
            }
        }

        let root = model.root();
        let output = match model.value(root) {
            Ok(output) => output.to_bytes(),
            Err(e) => {
                failures += 1;
                warn!(iteration = i, "Generation failed: {e}");
                continue;
            }
        };
        let digest = md5::compute(&output);
        if known_hashes.insert(digest.0) {
            let path = output_dir.join(format!("{digest:x}.bin"));
            std::fs::write(&path, &output).with_context(|| format!("Failed to write {path:?}"))?;
        }

        if i > 0 && i % (max_iterations / 100).max(1) == 0 {
            let elapsed = start_time.elapsed().as_secs_f32();
            let exec_per_sec = if elapsed > 0.0 { i as f32 / elapsed } else { 0.0 };
            info!(
                iteration = i,
                unique = known_hashes.len(),
                failures,
                "Iter: {}/{}, Execs/sec: {:.2}",
                i,
                max_iterations,
                exec_per_sec
            );
        }
    }

    let elapsed_total = start_time.elapsed();
    info!(
        unique = known_hashes.len(),
        failures,
        "Fuzz loop finished in {elapsed_total:.2?}"
    );
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref())?;
    let mut config = load_config(cli.config_file)?;
    debug!(?config, "Effective configuration");

    match cli.command {
        Command::Generate { model, output } => {
            let mut model = load_model(&model, &config)?;
            generate(&mut model, output.as_deref())
        }
        Command::Crack { model, input } => {
            let mut model = load_model(&model, &config)?;
            crack(&mut model, &input)
        }
        Command::Pit { model } => {
            let model = load_model(&model, &config)?;
            print!("{}", model.write_pit());
            Ok(())
        }
        Command::Fuzz {
            model,
            iterations,
            seed,
            output_dir,
        } => {
            if let Some(iterations) = iterations {
                config.fuzzer.max_iterations = iterations;
            }
            if let Some(seed) = seed {
                config.fuzzer.seed = seed;
            }
            if let Some(output_dir) = output_dir {
                config.fuzzer.output_dir = output_dir;
            }
            let model = load_model(&model, &config)?;
            fuzz(
                &model,
                config.fuzzer.max_iterations,
                config.fuzzer.seed,
                &config.fuzzer.output_dir,
            )
        }
    }
}
