use std::path::PathBuf;

use clap::Args;

use greml::data::grm_builder::DEFAULT_CHUNK_SIZE;
use greml::data::plink::PlinkDataset;
use greml::data::simulate::{
    EffectClass, PhenotypeSimulator, SimulateConfig, write_causal_effects, write_phenotypes,
};
use greml::shared::files::with_suffix;

use super::CommandResult;

#[derive(Args)]
pub struct SimulateArgs {
    /// PLINK fileset prefix (.bed/.bim/.fam)
    #[arg(long, value_name = "PREFIX")]
    pub bfile: PathBuf,

    /// Output prefix for `{out}.phen` and `{out}.causal`
    #[arg(long, value_name = "PREFIX")]
    pub out: PathBuf,

    /// Additive share of phenotypic variance, in (0, 1)
    #[arg(long, default_value_t = 0.5)]
    pub h2: f64,

    /// Dominance share of phenotypic variance; h2 + d2 must stay below 1
    #[arg(long, default_value_t = 0.0)]
    pub d2: f64,

    /// Effect variances of the additive classes
    #[arg(long, num_args = 1.., value_name = "VAR", default_values_t = [0.01])]
    pub add_var: Vec<f64>,

    /// Share of variants in each additive class; must sum to 1
    #[arg(long, num_args = 1.., value_name = "PROP", default_values_t = [1.0])]
    pub add_prop: Vec<f64>,

    /// Effect variances of the dominance classes
    #[arg(long, num_args = 1.., value_name = "VAR", default_values_t = [0.01])]
    pub dom_var: Vec<f64>,

    /// Share of variants in each dominance class; must sum to 1
    #[arg(long, num_args = 1.., value_name = "PROP", default_values_t = [1.0])]
    pub dom_prop: Vec<f64>,

    /// Mean added to every phenotype
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    pub intercept: f64,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Variants decoded per block
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk: usize,
}

pub fn run(args: SimulateArgs) -> CommandResult {
    let dataset = PlinkDataset::open(&args.bfile)?;
    log::info!(
        "Read {} samples and {} variants from {}",
        dataset.n_samples(),
        dataset.n_variants(),
        dataset.prefix().display()
    );

    let config = SimulateConfig {
        h2: args.h2,
        d2: args.d2,
        additive_classes: EffectClass::zip(&args.add_var, &args.add_prop, "additive")?,
        dominance_classes: EffectClass::zip(&args.dom_var, &args.dom_prop, "dominance")?,
        intercept: args.intercept,
        seed: args.seed,
        chunk_size: args.chunk,
    };
    let simulator = PhenotypeSimulator::new(&dataset, config)?;
    log::info!(
        "Simulating with h2 {:.2}, d2 {:.2}, seed {}",
        simulator.config().h2,
        simulator.config().d2,
        simulator.config().seed
    );
    let simulation = simulator.run()?;
    if simulator.config().has_dominance() {
        log::info!(
            "Realised h2 {:.4}, d2 {:.4}",
            simulation.realised_h2,
            simulation.realised_d2
        );
    } else {
        log::info!("Realised h2 {:.4}", simulation.realised_h2);
    }

    let phen = with_suffix(&args.out, "phen");
    write_phenotypes(&phen, &simulation)?;
    log::info!("Phenotypes written to {}", phen.display());
    let causal = with_suffix(&args.out, "causal");
    write_causal_effects(&causal, &dataset, &simulation)?;
    log::info!("Causal effects written to {}", causal.display());
    Ok(())
}
