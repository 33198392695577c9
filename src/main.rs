#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Parser, Subcommand};
use std::process;

mod commands;

#[derive(Parser)]
#[command(
    name = "greml",
    version,
    about = "Genomic REML: relationship matrices, variance components and genomic prediction",
    long_about = "Builds genomic relationship matrices from PLINK genotypes, estimates \
                 variance components and BLUPs by restricted maximum likelihood, and \
                 predicts genetic values from stored marker effects. Phenotypes with known \
                 heritabilities can be simulated for testing."
)]
struct Cli {
    /// Number of worker threads; defaults to every available core
    #[arg(long, global = true, value_name = "N")]
    threads: Option<usize>,

    /// Only report warnings and errors
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build additive and dominance GRMs from a PLINK fileset
    #[command(about = "Build genomic relationship matrices (outputs: .grm.bin, .grm.id)")]
    Grm(commands::grm::GrmArgs),

    /// Fit a linear mixed model by REML
    #[command(about = "Estimate variance components (outputs: .reml.toml, .blup, .param)")]
    Reml(commands::reml::RemlArgs),

    /// Apply marker and covariate effects to new genotypes
    #[command(about = "Predict genetic values (outputs: .pred)")]
    Predict(commands::predict::PredictArgs),

    /// Simulate phenotypes with known heritabilities from a PLINK fileset
    #[command(about = "Simulate phenotypes (outputs: .phen, .causal)")]
    Simulate(commands::simulate::SimulateArgs),
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.quiet);

    if let Some(threads) = cli.threads {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
        {
            eprintln!("Error: could not start {threads} worker threads: {e}");
            process::exit(1);
        }
    }

    let result = match cli.command {
        Commands::Grm(args) => commands::grm::run(args),
        Commands::Reml(args) => commands::reml::run(args),
        Commands::Predict(args) => commands::predict::run(args),
        Commands::Simulate(args) => commands::simulate::run(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn init_logging(quiet: bool) {
    let level = if quiet { "warn" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .format_target(false)
        .init();
}
