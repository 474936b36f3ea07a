//! PLDA back end: training, speaker enrollment, trial scoring, and a
//! reader for text-form models.

use std::path::Path;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use super::{first_vector, run_tool, within_scope, write_archive, write_text, TrainedModel};
use crate::archive::{parse_trial_scores, FormatError, FormatResult, Record, Vector};
use crate::orchestrator::{Pipeline, PipelineError, PipelineInput, PipelineResult, RunContext};
use crate::process::{StageOutput, StageSpec};
use crate::temp::{TempArtifact, TempScope};

/// Key of the enrolled speaker model in scoring trials.
const ENROLL_KEY: &str = "spk0";
/// Key of the probe i-vector in scoring trials.
const PROBE_KEY: &str = "spk1";

/// `[plda]` options.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PldaOptions {
    /// Factor of the between-class covariance added to the within-class
    /// covariance before scoring.
    pub smoothing: f64,
}

/// Output of [`train`].
#[derive(Debug, Clone, PartialEq)]
pub struct PldaBackend {
    /// PLDA model, text form.
    pub plda: TrainedModel,
    /// Global i-vector mean, text form.
    pub mean: TrainedModel,
}

/// Records keyed `spk{i}utt{j}` and the matching speaker-to-utterance table.
fn speaker_table(
    scope: &TempScope,
    speakers: &[Vec<Vector>],
) -> PipelineResult<(Vec<Record>, TempArtifact)> {
    let mut records = Vec::new();
    let mut table = String::new();
    for (i, utterances) in speakers.iter().enumerate() {
        let spk = format!("spk{}", i);
        table.push_str(&spk);
        for (j, ivector) in utterances.iter().enumerate() {
            let key = format!("{}utt{}", spk, j);
            table.push(' ');
            table.push_str(&key);
            records.push(Record::vector(key, ivector.clone()));
        }
        table.push('\n');
    }
    let file = write_text(scope, ".spk2utt", &table)?;
    Ok((records, file))
}

fn normalize_length(input: &str, output: &str) -> StageSpec {
    StageSpec::new("ivector-normalize-length").args([input, output])
}

/// Train a PLDA model and the global mean from i-vectors grouped by
/// speaker. Utterances are length-normalised first.
///
/// With `save_dir` the model and mean are also copied to
/// `<save_dir>/plda` and `<save_dir>/mean.vec`.
pub fn train(
    ctx: &RunContext,
    speakers: &[Vec<Vector>],
    save_dir: Option<&Path>,
) -> PipelineResult<PldaBackend> {
    if speakers.iter().all(|s| s.is_empty()) {
        return Err(PipelineError::invalid_input("PLDA training needs i-vectors"));
    }
    ctx.log.phase("PLDA training");
    ctx.log.info(&format!("{} speakers", speakers.len()));

    within_scope(ctx, "plda_train", |scope| {
        let (records, spk2utt) = speaker_table(scope, speakers)?;
        let ivectors = write_archive(scope, ".ark", &records)?;
        let ivectors_spec = format!("ark:{}", ivectors.path().display());

        let plda = scope.acquire(".plda")?;
        Pipeline::new("compute-plda")
            .with_stage(normalize_length(&ivectors_spec, "ark:-"))
            .with_stage(
                StageSpec::new("ivector-compute-plda")
                    .opt("binary", false)
                    .archive("ark,t", spk2utt.path())
                    .arg("ark:-")
                    .path(plda.path())
                    .stdout(StageOutput::Null),
            )
            .execute(ctx, PipelineInput::None)?;

        let mean = scope.acquire(".vec")?;
        Pipeline::new("global-mean")
            .with_stage(normalize_length(&ivectors_spec, "ark:-"))
            .with_stage(
                StageSpec::new("ivector-mean")
                    .opt("binary", false)
                    .arg("ark:-")
                    .path(mean.path())
                    .stdout(StageOutput::Null),
            )
            .execute(ctx, PipelineInput::None)?;

        let plda_text = plda.read_text()?;
        let mean_text = mean.read_text()?;
        if plda_text.trim().is_empty() || mean_text.trim().is_empty() {
            return Err(PipelineError::missing_output("PLDA training wrote an empty model"));
        }

        let (plda_saved, mean_saved) = match save_dir {
            Some(dir) => {
                let plda_dest = dir.join("plda");
                let mean_dest = dir.join("mean.vec");
                plda.persist_to(&plda_dest)?;
                mean.persist_to(&mean_dest)?;
                (Some(plda_dest), Some(mean_dest))
            }
            None => (None, None),
        };

        Ok(PldaBackend {
            plda: TrainedModel {
                text: plda_text,
                saved_to: plda_saved,
            },
            mean: TrainedModel {
                text: mean_text,
                saved_to: mean_saved,
            },
        })
    })
}

/// Enroll one speaker: the length-normalised average of its i-vectors,
/// centred on the global `mean` (text form) and normalised again.
pub fn enroll(ctx: &RunContext, ivectors: &[Vector], mean: &str) -> PipelineResult<Vector> {
    if ivectors.is_empty() {
        return Err(PipelineError::invalid_input("enrollment needs at least one i-vector"));
    }
    ctx.log.phase("PLDA enrollment");

    within_scope(ctx, "plda_enroll", |scope| {
        let (records, spk2utt) = speaker_table(scope, &[ivectors.to_vec()])?;
        let archive = write_archive(scope, ".ark", &records)?;
        let mean_file = write_text(scope, ".vec", mean)?;

        let records = Pipeline::new("enroll")
            .with_stage(normalize_length(
                &format!("ark:{}", archive.path().display()),
                "ark:-",
            ))
            .with_stage(
                StageSpec::new("ivector-mean")
                    .archive("ark,t", spk2utt.path())
                    .args(["ark:-", "ark:-"]),
            )
            .with_stage(normalize_length("ark:-", "ark:-"))
            .with_stage(
                StageSpec::new("ivector-subtract-global-mean")
                    .path(mean_file.path())
                    .args(["ark:-", "ark:-"]),
            )
            .with_stage(normalize_length("ark:-", "ark:-"))
            .collect(ctx, PipelineInput::None)?;

        first_vector(records, "enrollment")
    })
}

/// Score `probe` against the enrolled `model`.
///
/// The probe is centred and length-normalised; the PLDA model is smoothed
/// by `opts.smoothing` first.
pub fn score(
    ctx: &RunContext,
    probe: &Vector,
    model: &Vector,
    plda: &str,
    mean: &str,
    opts: &PldaOptions,
) -> PipelineResult<f64> {
    ctx.log.phase("PLDA scoring");

    within_scope(ctx, "plda_score", |scope| {
        let plda_file = write_text(scope, ".plda", plda)?;
        let mean_file = write_text(scope, ".vec", mean)?;
        let enrolled = write_archive(
            scope,
            ".spk",
            &[Record::vector(ENROLL_KEY, model.clone())],
        )?;
        let trials = write_text(
            scope,
            ".trials",
            &format!("{} {}\n", ENROLL_KEY, PROBE_KEY),
        )?;

        let smoothed = scope.acquire(".plda")?;
        run_tool(
            ctx,
            StageSpec::new("ivector-copy-plda")
                .opt("smoothing", opts.smoothing)
                .path(plda_file.path())
                .path(smoothed.path()),
        )?;

        let scores = scope.acquire(".score")?;
        Pipeline::new("plda-scoring")
            .with_stage(
                StageSpec::new("ivector-subtract-global-mean")
                    .path(mean_file.path())
                    .args(["ark:-", "ark:-"]),
            )
            .with_stage(normalize_length("ark:-", "ark:-"))
            .with_stage(
                StageSpec::new("ivector-plda-scoring")
                    .opt("normalize-length", true)
                    .path(smoothed.path())
                    .archive("ark", enrolled.path())
                    .arg("ark:-")
                    .path(trials.path())
                    .path(scores.path())
                    .stdout(StageOutput::Null),
            )
            .execute(ctx, Record::vector(PROBE_KEY, probe.clone()).into())?;

        let text = scores.read_text()?;
        let score = parse_trial_scores(&text)?
            .first()
            .map(|trial| trial.score)
            .ok_or_else(|| PipelineError::missing_output("ivector-plda-scoring wrote no score"))?;
        ctx.log.info(&format!("Score: {:.5}", score));
        Ok(score)
    })
}

/// A PLDA model read from its text form.
#[derive(Debug, Clone, PartialEq)]
pub struct PldaModel {
    pub mean: Array1<f64>,
    /// Square transform into the normalised space.
    pub transform: Array2<f64>,
    /// Between-class variances in the normalised space.
    pub psi: Array1<f64>,
}

impl PldaModel {
    /// Parse `<Plda> [ mean ] [ transform rows ] [ psi ] </Plda>`.
    ///
    /// Matrix rows are separated by line breaks inside the brackets.
    pub fn parse_text(text: &str) -> FormatResult<Self> {
        let mut groups: Vec<Vec<Vec<f64>>> = Vec::new();
        let mut open: Option<(usize, Vec<Vec<f64>>)> = None;
        let mut row: Vec<f64> = Vec::new();

        for (idx, line) in text.lines().enumerate() {
            let line_no = idx + 1;
            for token in line.split_whitespace() {
                match token {
                    "<Plda>" | "</Plda>" => {}
                    "[" => {
                        if open.is_some() {
                            return Err(FormatError::bad_text_line(line_no, "nested '['"));
                        }
                        open = Some((line_no, Vec::new()));
                    }
                    "]" => {
                        let Some((_, mut rows)) = open.take() else {
                            return Err(FormatError::bad_text_line(line_no, "unmatched ']'"));
                        };
                        if !row.is_empty() {
                            rows.push(std::mem::take(&mut row));
                        }
                        groups.push(rows);
                    }
                    value => {
                        if open.is_none() {
                            return Err(FormatError::bad_text_line(
                                line_no,
                                format!("unexpected token {:?}", value),
                            ));
                        }
                        let parsed = value.parse::<f64>().map_err(|_| {
                            FormatError::bad_text_line(line_no, format!("bad number {:?}", value))
                        })?;
                        row.push(parsed);
                    }
                }
            }
            if let Some((_, rows)) = open.as_mut() {
                if !row.is_empty() {
                    rows.push(std::mem::take(&mut row));
                }
            }
        }

        if let Some((line_no, _)) = open {
            return Err(FormatError::bad_text_line(line_no, "'[' never closed"));
        }
        let [mean, transform, psi]: [Vec<Vec<f64>>; 3] = groups.try_into().map_err(
            |groups: Vec<Vec<Vec<f64>>>| {
                FormatError::bad_text_line(
                    0,
                    format!("expected mean, transform and psi, found {} blocks", groups.len()),
                )
            },
        )?;

        let mean: Array1<f64> = mean.into_iter().flatten().collect();
        let psi: Array1<f64> = psi.into_iter().flatten().collect();
        let dim = mean.len();
        if transform.len() != dim || transform.iter().any(|r| r.len() != dim) {
            return Err(FormatError::bad_text_line(
                0,
                format!("transform is not {}x{}", dim, dim),
            ));
        }
        if psi.len() != dim {
            return Err(FormatError::bad_text_line(
                0,
                format!("psi has {} values, expected {}", psi.len(), dim),
            ));
        }
        let values: Vec<f64> = transform.into_iter().flatten().collect();
        let transform = Array2::from_shape_vec((dim, dim), values)
            .map_err(|e| FormatError::bad_text_line(0, e.to_string()))?;

        Ok(Self {
            mean,
            transform,
            psi,
        })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// `-transform · mean`, the offset applied when projecting i-vectors.
    pub fn offset(&self) -> Array1<f64> {
        -self.transform.dot(&self.mean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    const PLDA_TEXT: &str = "<Plda>  [ 0.5 -1 ]
 [
  2 0
  0 4 ]
 [ 1.5 0.25 ]
</Plda> ";

    #[test]
    fn parses_text_model() {
        let plda = PldaModel::parse_text(PLDA_TEXT).unwrap();
        assert_eq!(plda.dim(), 2);
        assert_eq!(plda.mean, array![0.5, -1.0]);
        assert_eq!(plda.transform, array![[2.0, 0.0], [0.0, 4.0]]);
        assert_eq!(plda.psi, array![1.5, 0.25]);

        let offset = plda.offset();
        assert_abs_diff_eq!(offset[0], -1.0);
        assert_abs_diff_eq!(offset[1], 4.0);
    }

    #[test]
    fn rejects_malformed_models() {
        assert!(PldaModel::parse_text("<Plda> [ 1 2 ] [ 1 0\n 0 1 ] </Plda>").is_err());
        assert!(PldaModel::parse_text("<Plda> [ 1 2 ] [ 1 0 ] [ 1 1 ] </Plda>").is_err());
        assert!(PldaModel::parse_text("<Plda> [ 1 x ] [ 1 ] [ 1 ] </Plda>").is_err());
        assert!(PldaModel::parse_text("<Plda> [ 1 [ 2 ] ] </Plda>").is_err());
        assert!(PldaModel::parse_text("<Plda> [ 1 ").is_err());
    }

    #[test]
    fn speaker_table_groups_utterances() {
        let root = tempfile::tempdir().unwrap();
        let scope = TempScope::new_in(root.path(), "t").unwrap();
        let speakers = vec![
            vec![Vector::from(array![1.0f32]), Vector::from(array![2.0f32])],
            vec![Vector::from(array![3.0f32])],
        ];
        let (records, table) = speaker_table(&scope, &speakers).unwrap();
        let keys: Vec<_> = records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, ["spk0utt0", "spk0utt1", "spk1utt0"]);
        assert_eq!(
            table.read_text().unwrap(),
            "spk0 spk0utt0 spk0utt1\nspk1 spk1utt0\n"
        );
    }

    #[test]
    fn empty_inputs_are_rejected() {
        let ctx = RunContext::with_defaults("plda");
        assert!(matches!(
            train(&ctx, &[vec![]], None),
            Err(PipelineError::InvalidInput(_))
        ));
        assert!(matches!(
            enroll(&ctx, &[], "[ 0 ]"),
            Err(PipelineError::InvalidInput(_))
        ));
    }
}
