//! Cepstral feature extraction and energy-based voice activity detection.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{ark, first_matrix, first_vector, run_fed, utterance, within_scope, UTTERANCE_KEY};
use crate::archive::{AudioBlob, Matrix, Record, Vector};
use crate::orchestrator::{Pipeline, PipelineError, PipelineInput, PipelineResult, RunContext};
use crate::process::StageSpec;

/// `[features]` options shared by every cepstral front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CepstralOptions {
    pub preemphasis_coefficient: f64,
    /// Compute energy before preemphasis and windowing.
    pub raw_energy: bool,
    /// Delta order appended by [`cepstral`].
    pub delta_order: u32,
    /// Frame length in milliseconds.
    pub frame_length: u32,
    /// Frame shift in milliseconds.
    pub frame_shift: u32,
    /// Cepstra including C0.
    pub num_ceps: u32,
    pub num_mel_bins: u32,
    pub cepstral_lifter: u32,
    /// Low cutoff of the mel bins in Hz.
    pub low_freq: i32,
    /// High cutoff of the mel bins in Hz; zero or negative is an offset
    /// from Nyquist.
    pub high_freq: i32,
    /// Dithering constant; 0 disables dithering.
    pub dither: f64,
    /// Only emit frames that fit completely in the signal.
    pub snip_edges: bool,
    /// Scale samples so the peak magnitude is 1 before encoding.
    pub normalization: bool,
    /// Window of the sliding mean normalisation, in frames.
    pub cmn_window: u32,
    /// Channel read by [`mfcc_from_path`].
    pub channel: u32,
}

impl Default for CepstralOptions {
    fn default() -> Self {
        Self {
            preemphasis_coefficient: 0.97,
            raw_energy: true,
            delta_order: 2,
            frame_length: 25,
            frame_shift: 10,
            num_ceps: 13,
            num_mel_bins: 23,
            cepstral_lifter: 22,
            low_freq: 20,
            high_freq: 0,
            dither: 1.0,
            snip_edges: true,
            normalization: true,
            cmn_window: 300,
            channel: 0,
        }
    }
}

/// `[vad]` options for energy-based detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadOptions {
    pub energy_mean_scale: f64,
    pub energy_threshold: f64,
    /// Frames of context on each side considered per decision.
    pub frames_context: u32,
    /// Share of context frames that must be above threshold.
    pub proportion_threshold: f64,
}

impl Default for VadOptions {
    fn default() -> Self {
        Self {
            energy_mean_scale: 0.5,
            energy_threshold: 5.0,
            frames_context: 0,
            proportion_threshold: 0.6,
        }
    }
}

/// Cepstral front end used by [`cepstral`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CepstralKind {
    #[default]
    Mfcc,
    Plp,
}

impl CepstralKind {
    pub fn program(self) -> &'static str {
        match self {
            CepstralKind::Mfcc => "compute-mfcc-feats",
            CepstralKind::Plp => "compute-plp-feats",
        }
    }
}

impl fmt::Display for CepstralKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CepstralKind::Mfcc => write!(f, "mfcc"),
            CepstralKind::Plp => write!(f, "plp"),
        }
    }
}

/// The framing and filterbank options of a `compute-*-feats` stage.
fn front_end(program: &str, opts: &CepstralOptions) -> StageSpec {
    StageSpec::new(program)
        .opt("preemphasis-coefficient", opts.preemphasis_coefficient)
        .opt("raw-energy", opts.raw_energy)
        .opt("frame-length", opts.frame_length)
        .opt("frame-shift", opts.frame_shift)
        .opt("num-ceps", opts.num_ceps)
        .opt("num-mel-bins", opts.num_mel_bins)
        .opt("cepstral-lifter", opts.cepstral_lifter)
        .opt("low-freq", opts.low_freq)
        .opt("high-freq", opts.high_freq)
        .opt("dither", opts.dither)
        .opt("snip-edges", opts.snip_edges)
}

fn sliding_cmn(opts: &CepstralOptions) -> StageSpec {
    StageSpec::new("apply-cmvn-sliding")
        .opt("norm-vars", false)
        .opt("center", true)
        .opt("cmn-window", opts.cmn_window)
        .args(["ark:-", "ark:-"])
}

/// The audio record fed to a front end.
fn audio_record(samples: &[f64], rate: u32, opts: &CepstralOptions) -> PipelineResult<Record> {
    if samples.is_empty() {
        return Err(PipelineError::invalid_input("no audio samples"));
    }
    let mut samples = samples.to_vec();
    if opts.normalization {
        let peak = samples.iter().fold(0.0f64, |acc, s| acc.max(s.abs()));
        if peak > 0.0 {
            samples.iter_mut().for_each(|s| *s /= peak);
        }
    }
    Ok(Record::audio(UTTERANCE_KEY, AudioBlob::full_scale(samples, rate)))
}

/// MFCCs with deltas and sliding mean normalisation.
///
/// `samples` are expected in `[-1, 1]` unless `opts.normalization` is set.
pub fn mfcc(
    ctx: &RunContext,
    samples: &[f64],
    rate: u32,
    opts: &CepstralOptions,
) -> PipelineResult<Matrix> {
    let record = audio_record(samples, rate, opts)?;
    ctx.log.debug(&format!("MFCC of {} samples at {} Hz", samples.len(), rate));

    let records = Pipeline::new("mfcc")
        .with_stage(
            front_end("compute-mfcc-feats", opts)
                .opt("sample-frequency", rate)
                .args(["ark:-", "ark:-"]),
        )
        .with_stage(StageSpec::new("add-deltas").args(["ark:-", "ark:-"]))
        .with_stage(sliding_cmn(opts))
        .collect(ctx, record.into())?;

    first_matrix(records, "mfcc")
}

/// MFCCs of an audio file read by the toolkit itself.
pub fn mfcc_from_path(
    ctx: &RunContext,
    audio: &Path,
    opts: &CepstralOptions,
) -> PipelineResult<Matrix> {
    if !audio.is_file() {
        return Err(PipelineError::invalid_input(format!(
            "audio file not found: {}",
            audio.display()
        )));
    }

    let records = Pipeline::new("mfcc")
        .with_stage(
            front_end("compute-mfcc-feats", opts)
                .opt("channel", opts.channel)
                .args(["scp:-", "ark:-"]),
        )
        .with_stage(StageSpec::new("add-deltas").args(["ark:-", "ark:-"]))
        .with_stage(sliding_cmn(opts))
        .collect(
            ctx,
            PipelineInput::text(format!("{} {}\n", UTTERANCE_KEY, audio.display())),
        )?;

    first_matrix(records, "mfcc")
}

/// MFCC or PLP features with utterance-level mean and variance
/// normalisation and `opts.delta_order` deltas.
pub fn cepstral(
    ctx: &RunContext,
    samples: &[f64],
    rate: u32,
    kind: CepstralKind,
    opts: &CepstralOptions,
) -> PipelineResult<Matrix> {
    let record = audio_record(samples, rate, opts)?;

    within_scope(ctx, "cepstral", |scope| {
        let statics = Pipeline::single(
            kind.to_string(),
            front_end(kind.program(), opts)
                .opt("sample-frequency", rate)
                .args(["ark:-", "ark:-"]),
        )
        .collect(ctx, record.into())?;
        let statics = first_matrix(statics, kind.program())?;
        if statics.rows() == 0 {
            return Err(PipelineError::missing_output(format!(
                "{} produced no frames",
                kind.program()
            )));
        }
        let statics = Record::matrix(UTTERANCE_KEY, statics);

        let cmvn = scope.acquire(".cmvn")?;
        run_fed(
            ctx,
            StageSpec::new("compute-cmvn-stats")
                .arg("ark:-")
                .arg(ark(cmvn.path())),
            statics.clone().into(),
        )?;

        let records = Pipeline::new("cmvn-deltas")
            .with_stage(
                StageSpec::new("apply-cmvn")
                    .arg(ark(cmvn.path()))
                    .args(["ark:-", "ark:-"]),
            )
            .with_stage(
                StageSpec::new("add-deltas")
                    .opt("delta-order", opts.delta_order)
                    .args(["ark:-", "ark:-"]),
            )
            .collect(ctx, statics.into())?;

        first_matrix(records, "add-deltas")
    })
}

/// Per-frame speech (1) / non-speech (0) decisions from the log-energy in
/// the first column of `feats`.
pub fn compute_vad(ctx: &RunContext, feats: &Matrix, opts: &VadOptions) -> PipelineResult<Vector> {
    let records = Pipeline::single(
        "compute-vad",
        StageSpec::new("compute-vad")
            .opt("vad-energy-mean-scale", opts.energy_mean_scale)
            .opt("vad-energy-threshold", opts.energy_threshold)
            .opt("vad-frames-context", opts.frames_context)
            .opt("vad-proportion-threshold", opts.proportion_threshold)
            .args(["ark:-", "ark:-"]),
    )
    .collect(ctx, utterance(feats).into())?;

    first_vector(records, "compute-vad")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Payload;

    #[test]
    fn front_end_arguments() {
        let spec = front_end("compute-mfcc-feats", &CepstralOptions::default());
        let args = spec.arguments();
        assert!(args.contains(&"--raw-energy=true".to_string()));
        assert!(args.contains(&"--preemphasis-coefficient=0.97".to_string()));
        assert!(args.contains(&"--dither=1".to_string()));
        assert!(args.contains(&"--snip-edges=true".to_string()));
    }

    #[test]
    fn peak_normalisation() {
        let opts = CepstralOptions::default();
        let record = audio_record(&[0.25, -0.5, 0.1], 8000, &opts).unwrap();
        let Payload::Audio(blob) = record.payload else {
            panic!("expected audio");
        };
        assert_eq!(blob.samples, vec![0.5, -1.0, 0.2]);
        assert_eq!(blob.sample_rate, 8000);
        assert_eq!(record.key, "abc");

        let raw = CepstralOptions {
            normalization: false,
            ..Default::default()
        };
        let Payload::Audio(blob) = audio_record(&[0.25], 8000, &raw).unwrap().payload else {
            panic!("expected audio");
        };
        assert_eq!(blob.samples, vec![0.25]);
    }

    #[test]
    fn silent_audio_is_left_alone() {
        let record = audio_record(&[0.0, 0.0], 16000, &CepstralOptions::default()).unwrap();
        let Payload::Audio(blob) = record.payload else {
            panic!("expected audio");
        };
        assert_eq!(blob.samples, vec![0.0, 0.0]);
    }

    #[test]
    fn empty_audio_is_rejected() {
        let ctx = RunContext::with_defaults("mfcc");
        assert!(matches!(
            mfcc(&ctx, &[], 16000, &CepstralOptions::default()),
            Err(PipelineError::InvalidInput(_))
        ));
    }

    #[test]
    fn kind_names() {
        assert_eq!(CepstralKind::Plp.program(), "compute-plp-feats");
        assert_eq!(CepstralKind::Mfcc.to_string(), "mfcc");
    }
}
