use std::path::PathBuf;

use clap::Args;

use greml::data::grm_builder::DEFAULT_CHUNK_SIZE;
use greml::data::ids::IdForm;
use greml::data::plink::PlinkDataset;
use greml::data::tables::{DiscreteTable, QuantitativeTable};
use greml::predict::effects::{CovarEffects, SnpEffects};
use greml::predict::engine::{CovariateInputs, PredictConfig, PredictObserver, predict};
use greml::predict::writer::write_predictions;
use greml::shared::files::with_suffix;

use super::CommandResult;

#[derive(Args)]
pub struct PredictArgs {
    /// Target PLINK fileset prefix
    #[arg(long, value_name = "PREFIX")]
    pub bfile: PathBuf,

    /// Marker effects written by `reml --bfile` (.snp.eff)
    #[arg(long, value_name = "PATH")]
    pub snp_eff: PathBuf,

    /// Fixed-effect table written by `reml` (.param)
    #[arg(long, value_name = "PATH")]
    pub covar_eff: Option<PathBuf>,

    /// Quantitative covariates of the target samples
    #[arg(long, value_name = "PATH", requires = "covar_eff")]
    pub qcovar: Option<PathBuf>,

    /// Discrete covariates of the target samples
    #[arg(long, value_name = "PATH", requires = "covar_eff")]
    pub dcovar: Option<PathBuf>,

    /// Output prefix; predictions go to `{out}.pred`
    #[arg(long, value_name = "PREFIX")]
    pub out: PathBuf,

    /// Join samples on IID alone instead of FID and IID
    #[arg(long)]
    pub iid_only: bool,

    /// Variants decoded per block
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk: usize,
}

struct LogPredict;

impl PredictObserver for LogPredict {
    fn info(&mut self, message: &str) {
        log::info!("{message}");
    }

    fn warn(&mut self, message: &str) {
        log::warn!("{message}");
    }
}

pub fn run(args: PredictArgs) -> CommandResult {
    let config = PredictConfig {
        id_form: if args.iid_only {
            IdForm::IidOnly
        } else {
            IdForm::Combined
        },
        chunk_size: args.chunk,
    };

    let effects = SnpEffects::load(&args.snp_eff)?;
    log::info!(
        "Loaded {} marker effects{} from {}",
        effects.len(),
        if effects.has_dominance() {
            " with dominance"
        } else {
            ""
        },
        args.snp_eff.display()
    );
    let dataset = PlinkDataset::open(&args.bfile)?;

    let covar_effects = args
        .covar_eff
        .as_deref()
        .map(CovarEffects::load)
        .transpose()?;
    let quantitative = args
        .qcovar
        .as_deref()
        .map(|path| QuantitativeTable::load(path, config.id_form))
        .transpose()?;
    let discrete = args
        .dcovar
        .as_deref()
        .map(|path| DiscreteTable::load(path, config.id_form))
        .transpose()?;
    let covariates = covar_effects.as_ref().map(|effects| CovariateInputs {
        effects,
        quantitative: quantitative.as_ref(),
        discrete: discrete.as_ref(),
    });

    let predictions = predict(&effects, covariates, &dataset, &config, &mut LogPredict)?;
    let out = with_suffix(&args.out, "pred");
    write_predictions(&out, &predictions, config.id_form)?;
    log::info!(
        "Predictions for {} samples written to {}",
        predictions.len(),
        out.display()
    );
    Ok(())
}
