use std::path::PathBuf;

use clap::Args;
use indicatif::ProgressBar;

use greml::data::grm::GrmKind;
use greml::data::grm_builder::{
    DEFAULT_CHUNK_SIZE, GrmBuildConfig, GrmBuilder, GrmMethod, GrmProgressObserver,
};
use greml::data::plink::PlinkDataset;

use super::{CommandResult, create_progress_bar};

#[derive(Args)]
pub struct GrmArgs {
    /// PLINK fileset prefix (.bed/.bim/.fam)
    #[arg(long, value_name = "PREFIX")]
    pub bfile: PathBuf,

    /// Output prefix; `.add`/`.dom` is appended when both kinds are built
    #[arg(long, value_name = "PREFIX")]
    pub out: PathBuf,

    /// Genotype coding: yang, su, zeng or standardized
    #[arg(long, default_value_t = GrmMethod::Yang)]
    pub method: GrmMethod,

    /// Also build the dominance GRM
    #[arg(long)]
    pub dom: bool,

    /// Build only the dominance GRM
    #[arg(long, conflicts_with = "dom")]
    pub dom_only: bool,

    /// Restrict to variants on one chromosome
    #[arg(long, value_name = "CHR")]
    pub chr: Option<String>,

    /// Write Z·Zᵀ without dividing by trace/n
    #[arg(long)]
    pub raw: bool,

    /// Variants decoded per block
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk: usize,

    /// Also write the coded genotype matrix as `{prefix}.enc.bin`
    #[arg(long)]
    pub save_encoded: bool,
}

#[derive(Default)]
struct BarProgress {
    bar: Option<ProgressBar>,
}

impl GrmProgressObserver for BarProgress {
    fn on_start(&mut self, kind: GrmKind, total_variants: usize) {
        let label = kind.label().unwrap_or("grm");
        self.bar = Some(create_progress_bar(
            total_variants as u64,
            &format!("{label} variants"),
        ));
    }

    fn on_advance(&mut self, _: GrmKind, processed_variants: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(processed_variants as u64);
        }
    }

    fn on_finish(&mut self, _: GrmKind) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }

    fn info(&mut self, message: &str) {
        log::info!("{message}");
    }
}

pub fn run(args: GrmArgs) -> CommandResult {
    let dataset = PlinkDataset::open(&args.bfile)?;
    log::info!(
        "Read {} samples and {} variants from {}",
        dataset.n_samples(),
        dataset.n_variants(),
        dataset.prefix().display()
    );

    let config = GrmBuildConfig {
        method: args.method,
        chunk_size: args.chunk,
        additive: !args.dom_only,
        dominance: args.dom || args.dom_only,
        raw_output: args.raw,
        chromosome: args.chr,
        save_encoded: args.save_encoded,
    };
    let builder = GrmBuilder::new(&dataset, config)?;
    log::info!(
        "Building {} GRM(s) from {} variants",
        builder.config().method,
        builder.n_variants()
    );

    let mut progress = BarProgress::default();
    for (kind, prefix) in builder.write(&args.out, &mut progress)? {
        log::info!("{kind:?} GRM written to {}", prefix.display());
    }
    Ok(())
}
