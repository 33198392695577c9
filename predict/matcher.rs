//! Aligns stored marker effects to the variants of a target fileset.

use ahash::AHashMap;

use crate::data::plink::VariantRecord;
use crate::predict::effects::SnpEffect;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlleleMatch {
    /// Same A1/A2 as the training data.
    Keep,
    /// A1 and A2 are swapped; dosages are read as `2 - g`.
    Reverse,
    /// Alleles disagree; the marker contributes nothing.
    Skip,
}

impl AlleleMatch {
    /// Compares alleles case-insensitively.
    pub fn classify(effect: &SnpEffect, variant: &VariantRecord) -> Self {
        let same = |a: &str, b: &str| a.eq_ignore_ascii_case(b);
        if same(&effect.allele1, &variant.allele1) && same(&effect.allele2, &variant.allele2) {
            Self::Keep
        } else if same(&effect.allele1, &variant.allele2) && same(&effect.allele2, &variant.allele1)
        {
            Self::Reverse
        } else {
            Self::Skip
        }
    }
}

/// One usable marker: the target variant it is read from and how to orient it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatchedVariant {
    pub variant: usize,
    pub effect: usize,
    pub reversed: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MatchSummary {
    pub kept: usize,
    pub reversed: usize,
    pub allele_mismatch: usize,
    pub absent: usize,
}

/// Matches effects to `variants` by identifier. Usable markers are returned in
/// target order so that block decoding walks the `.bed` file sequentially.
pub fn match_variants(
    effects: &[SnpEffect],
    variants: &[VariantRecord],
) -> (Vec<MatchedVariant>, MatchSummary) {
    let by_id: AHashMap<&str, usize> = effects
        .iter()
        .enumerate()
        .map(|(idx, e)| (e.identifier.as_str(), idx))
        .collect();

    let mut summary = MatchSummary::default();
    let mut matched = Vec::new();
    let mut seen = 0usize;
    for (variant_idx, variant) in variants.iter().enumerate() {
        let Some(&effect_idx) = by_id.get(variant.identifier.as_str()) else {
            continue;
        };
        seen += 1;
        let reversed = match AlleleMatch::classify(&effects[effect_idx], variant) {
            AlleleMatch::Keep => {
                summary.kept += 1;
                false
            }
            AlleleMatch::Reverse => {
                summary.reversed += 1;
                true
            }
            AlleleMatch::Skip => {
                summary.allele_mismatch += 1;
                continue;
            }
        };
        matched.push(MatchedVariant {
            variant: variant_idx,
            effect: effect_idx,
            reversed,
        });
    }
    summary.absent = effects.len().saturating_sub(seen);
    (matched, summary)
}
