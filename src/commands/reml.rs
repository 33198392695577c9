use std::path::PathBuf;

use clap::Args;

use greml::data::grm_builder::{DEFAULT_CHUNK_SIZE, GrmMethod};
use greml::data::ids::IdForm;
use greml::data::pipe::{DataPipe, PipeConfig};
use greml::data::transform::{DEFAULT_BLOM_OFFSET, TransformKind};
use greml::effects::compute_marker_effects;
use greml::observer::LogObserver;
use greml::policy::UpdatePolicy;
use greml::report::{RemlReport, write_blup, write_param, write_snp_eff};
use greml::shared::files::with_suffix;
use greml::{Estimator, EstimatorConfig, FreqState};

use super::CommandResult;

#[derive(Args)]
pub struct RemlArgs {
    /// Phenotype file: FID IID followed by trait columns
    #[arg(long, value_name = "PATH")]
    pub pheno: PathBuf,

    /// 1-based trait column after FID and IID
    #[arg(long, default_value_t = 1, value_name = "N")]
    pub mpheno: usize,

    /// Quantitative covariates
    #[arg(long, value_name = "PATH")]
    pub qcovar: Option<PathBuf>,

    /// Discrete covariates, dummy coded against the first level
    #[arg(long, value_name = "PATH")]
    pub dcovar: Option<PathBuf>,

    /// Labels whose incidence matrices become non-genetic random effects
    #[arg(long, value_name = "PATH")]
    pub random: Option<PathBuf>,

    /// GRM prefix; repeat for several genetic components
    #[arg(long = "grm", value_name = "PREFIX", required = true)]
    pub grms: Vec<PathBuf>,

    /// PLINK fileset used to back-solve per-marker effects
    #[arg(long, value_name = "PREFIX")]
    pub bfile: Option<PathBuf>,

    /// Coding the GRMs were built with; marker effects need yang
    #[arg(long, default_value_t = GrmMethod::Yang)]
    pub grm_method: GrmMethod,

    /// Output prefix
    #[arg(long, value_name = "PREFIX")]
    pub out: PathBuf,

    /// Variance update: em, ai, newton-raphson or fisher-scoring
    #[arg(long, default_value_t = UpdatePolicy::Ai)]
    pub method: UpdatePolicy,

    /// Maximum number of REML iterations
    #[arg(long, default_value_t = 100)]
    pub max_iter: usize,

    /// Convergence tolerance on the relative change of the variances
    #[arg(long, default_value_t = 1e-8)]
    pub tol: f64,

    /// Skip the initial EM step
    #[arg(long)]
    pub no_em_init: bool,

    /// Rank-based inverse-normal transform of the phenotype
    #[arg(long, conflicts_with = "iint")]
    pub dint: bool,

    /// Inverse-normal transform of the phenotype residuals on the fixed effects
    #[arg(long)]
    pub iint: bool,

    /// Blom offset used by --dint and --iint
    #[arg(long, default_value_t = DEFAULT_BLOM_OFFSET)]
    pub blom_offset: f64,

    /// Join samples on IID alone instead of FID and IID
    #[arg(long)]
    pub iid_only: bool,

    /// Variants decoded per block when back-solving marker effects
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk: usize,
}

pub fn run(args: RemlArgs) -> CommandResult {
    if args.mpheno == 0 {
        return Err("--mpheno counts from 1".into());
    }
    let pipe_config = PipeConfig {
        id_form: if args.iid_only {
            IdForm::IidOnly
        } else {
            IdForm::Combined
        },
        pheno_column: args.mpheno + 1,
        transform: if args.dint {
            TransformKind::Dint
        } else if args.iint {
            TransformKind::Iint
        } else {
            TransformKind::None
        },
        blom_offset: args.blom_offset,
    };

    let mut observer = LogObserver;
    let prepared = {
        let mut pipe = DataPipe::new(pipe_config, &mut observer);
        pipe.load_phenotypes(&args.pheno)?;
        if let Some(path) = &args.qcovar {
            pipe.load_qcovariates(path)?;
        }
        if let Some(path) = &args.dcovar {
            pipe.load_dcovariates(path)?;
        }
        if let Some(path) = &args.random {
            pipe.load_random(path)?;
        }
        pipe.load_grms(&args.grms)?;
        if let Some(bfile) = &args.bfile {
            pipe.load_genotypes(bfile)?;
        }
        pipe.intersect_samples()?;
        pipe.finalize()?
    };

    let config = EstimatorConfig {
        max_iter: args.max_iter,
        tol: args.tol,
        em_init: !args.no_em_init,
        policy: args.method,
    };
    let estimator = Estimator::new(config);
    let model = &prepared.model;
    let mut state = FreqState::new(model);
    let fit = estimator.fit(model, &mut state, &mut observer)?;

    let report_path = with_suffix(&args.out, "reml.toml");
    RemlReport::from_fit(
        model,
        &state,
        estimator.config(),
        &fit.summary,
        &prepared.phenotype,
    )
    .save(&report_path)?;
    log::info!("Report written to {}", report_path.display());

    let blup_path = with_suffix(&args.out, "blup");
    write_blup(&blup_path, &prepared.samples, model, &state)?;
    let param_path = with_suffix(&args.out, "param");
    write_param(&param_path, model, &state)?;
    log::info!(
        "BLUPs written to {}, fixed effects to {}",
        blup_path.display(),
        param_path.display()
    );

    if let (Some(dataset), Some(rows)) = (&prepared.genotype, &prepared.genotype_rows) {
        let effects = compute_marker_effects(
            model,
            &state,
            &fit.opt_state,
            dataset,
            rows,
            args.grm_method,
            args.chunk,
        )?;
        let snp_path = with_suffix(&args.out, "snp.eff");
        write_snp_eff(&snp_path, &effects)?;
        log::info!(
            "{} marker effects written to {}",
            effects.len(),
            snp_path.display()
        );
    }

    Ok(())
}
