use std::fs::File;
use std::path::Path;

use crate::data::ids::IdForm;
use crate::predict::engine::Predictions;
use crate::shared::error::{GremlError, Result};

fn fixed(value: f64) -> String {
    format!("{value:.6}")
}

/// Writes `[FID] IID prediction {covariates} additive [dominant]`, tab separated.
/// The FID column is present only for combined ids.
pub fn write_predictions(path: &Path, predictions: &Predictions, id_form: IdForm) -> Result<()> {
    let file = File::create(path).map_err(|e| GremlError::io(path, e))?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(file);
    let with_fid = id_form == IdForm::Combined;

    let mut header: Vec<&str> = Vec::new();
    if with_fid {
        header.push("FID");
    }
    header.extend(["IID", "prediction"]);
    header.extend(predictions.covariate_names.iter().map(String::as_str));
    header.push("additive");
    if predictions.dominance.is_some() {
        header.push("dominant");
    }
    writer.write_record(&header)?;

    let total = predictions.total();
    for (i, (fid, iid)) in predictions.samples.iter().enumerate() {
        let mut record = Vec::with_capacity(header.len());
        if with_fid {
            record.push(fid.clone());
        }
        record.push(iid.clone());
        record.push(fixed(total[i]));
        record.extend(predictions.covariates.row(i).iter().map(|&v| fixed(v)));
        record.push(fixed(predictions.additive[i]));
        if let Some(dominance) = &predictions.dominance {
            record.push(fixed(dominance[i]));
        }
        writer.write_record(&record)?;
    }
    writer.flush().map_err(|e| GremlError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn rows_carry_six_decimals() {
        let predictions = Predictions {
            samples: vec![("f1".into(), "a".into()), ("f2".into(), "b".into())],
            covariate_names: vec!["Intercept".into(), "age".into()],
            covariates: array![[1.0, 0.5], [1.0, -0.25]],
            additive: array![0.1, 0.2],
            dominance: Some(array![0.0, 0.125]),
        };
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.pred");
        write_predictions(&path, &predictions, IdForm::Combined).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "FID\tIID\tprediction\tIntercept\tage\tadditive\tdominant");
        assert_eq!(lines[1], "f1\ta\t1.600000\t1.000000\t0.500000\t0.100000\t0.000000");
        assert_eq!(lines[2], "f2\tb\t1.075000\t1.000000\t-0.250000\t0.200000\t0.125000");

        write_predictions(&path, &predictions, IdForm::IidOnly).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("IID\tprediction\tIntercept"));
    }
}
