// Pipeline configuration. Parsed once at startup and shared behind an `Arc`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{ForgeError, Result};
use crate::stage::{MixupSchedule, StageName};

// ── Top level ─────────────────────────────────────────────────────────────────

/// Immutable snapshot of every recognized option set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(alias = "paths")]
    pub common: CommonPaths,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub front_end: FrontEnd,
    #[serde(default)]
    pub hmm_params: HmmParams,
    #[serde(default)]
    pub train_params: TrainParams,
    #[serde(default)]
    pub train_pipeline: TrainPipeline,
}

impl PipelineConfig {
    /// Read, parse and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ForgeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ForgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration, for the copy kept in the
    /// experiment directory.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ForgeError::Parse(e.to_string()))
    }

    /// Reject malformed settings and missing paths required by enabled stages.
    pub fn validate(&self) -> Result<()> {
        if self.settings.jobs == 0 {
            return Err(ForgeError::Config("settings.jobs must be at least 1".into()));
        }
        if self.common.exp.as_os_str().is_empty() {
            return Err(ForgeError::Config("common.exp must not be empty".into()));
        }

        let flags = &self.train_pipeline;
        let needs_setup = [
            StageName::Coding,
            StageName::FlatStart,
            StageName::MixupMono,
            StageName::MonoToTri,
            StageName::MixupTri,
            StageName::AlignWithXword,
            StageName::MonoToTriFromXword,
            StageName::MixupTri2,
            StageName::Diag,
            StageName::Mmi,
        ];
        if needs_setup.iter().any(|&s| flags.enabled(s)) && self.common.setup.is_none() {
            return Err(ForgeError::Config(
                "common.setup is required by the enabled stages".into(),
            ));
        }
        if flags.lm && self.common.dict.is_none() {
            return Err(ForgeError::Config("common.dict is required by stage lm".into()));
        }
        if (flags.mono_to_tri || flags.mono_to_tri_from_xword)
            && self.common.tree_questions.is_none()
        {
            return Err(ForgeError::Config(
                "common.tree_questions is required by triphone clustering".into(),
            ));
        }
        Ok(())
    }

    // ── Experiment layout ────────────────────────────────────────────────

    pub fn exp_dir(&self) -> &Path {
        &self.common.exp
    }

    pub fn state_path(&self) -> PathBuf {
        self.common.exp.join("pipeline_state.json")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.common.exp.join("checkpoints")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.common.exp.join("work")
    }

    pub fn shard_dir(&self) -> PathBuf {
        self.common.exp.join("shards")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.common.exp.join("logs")
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.settings
            .spool_dir
            .clone()
            .unwrap_or_else(|| self.common.exp.join("spool"))
    }
}

// ── [common] ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonPaths {
    /// Experiment output root.
    pub exp: PathBuf,
    /// Feature-cache root.
    #[serde(default)]
    pub data: Option<PathBuf>,
    /// Pronunciation dictionary.
    #[serde(default)]
    pub dict: Option<PathBuf>,
    /// Decision-tree question set.
    #[serde(default)]
    pub tree_questions: Option<PathBuf>,
    /// Corpus setup file: `<wav> <config> <transcription>` per line.
    #[serde(default)]
    pub setup: Option<PathBuf>,
    /// Shared resources directory.
    #[serde(default)]
    pub common: Option<PathBuf>,
}

// ── [settings] ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// `1` runs tasks in-process, `0` submits them to the cluster queue.
    #[serde(deserialize_with = "flag")]
    pub local: bool,
    /// Worker concurrency ceiling and shard count.
    pub jobs: u32,
    pub verbose: u8,
    /// Extra attempts after a task's first failure.
    pub retries: u32,
    /// How long a task may wait for an execution slot.
    pub slot_timeout_secs: u64,
    /// How long a remote task may run before its receipt is given up on.
    pub task_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Job-queue spool for distributed execution. Defaults to `<exp>/spool`.
    pub spool_dir: Option<PathBuf>,
    /// External tool wrapper invoked once per task in local mode.
    pub runner: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            local: true,
            jobs: 50,
            verbose: 0,
            retries: 1,
            slot_timeout_secs: 600,
            task_timeout_secs: 24 * 60 * 60,
            poll_interval_ms: 500,
            spool_dir: None,
            runner: None,
        }
    }
}

// ── [front_end] ───────────────────────────────────────────────────────────────

/// Feature-extraction knobs, handed to the extractor without interpretation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontEnd {
    #[serde(deserialize_with = "flag")]
    pub use_c0: bool,
    #[serde(deserialize_with = "flag")]
    pub use_deltas: bool,
    #[serde(deserialize_with = "flag")]
    pub use_ddeltas: bool,
    #[serde(deserialize_with = "flag")]
    pub mean_norm: bool,
    pub frame_length: u32,
    pub delta_window: u32,
    pub num_cepstra: u32,
}

impl Default for FrontEnd {
    fn default() -> Self {
        Self {
            use_c0: true,
            use_deltas: true,
            use_ddeltas: true,
            mean_norm: true,
            frame_length: 10,
            delta_window: 2,
            num_cepstra: 12,
        }
    }
}

impl FrontEnd {
    pub fn params(&self) -> BTreeMap<String, String> {
        let mut p = BTreeMap::new();
        p.insert("use_c0".into(), u8::from(self.use_c0).to_string());
        p.insert("use_deltas".into(), u8::from(self.use_deltas).to_string());
        p.insert("use_ddeltas".into(), u8::from(self.use_ddeltas).to_string());
        p.insert("mean_norm".into(), u8::from(self.mean_norm).to_string());
        p.insert("frame_length".into(), self.frame_length.to_string());
        p.insert("delta_window".into(), self.delta_window.to_string());
        p.insert("num_cepstra".into(), self.num_cepstra.to_string());
        p
    }
}

// ── [hmm_params] ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HmmParams {
    /// Emitting states per phone model.
    pub states: u32,
    /// Target number of tied triphone states.
    pub triphone_states: u32,
    /// Outlier threshold for decision-tree clustering.
    pub dt_ro: f64,
    /// Likelihood-gain threshold for decision-tree clustering.
    pub dt_tb: f64,
}

impl Default for HmmParams {
    fn default() -> Self {
        Self {
            states: 3,
            triphone_states: 2000,
            dt_ro: 200.0,
            dt_tb: 750.0,
        }
    }
}

// ── [train_params] ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainParams {
    pub split_path_letters: u32,
    pub var_floor_fraction: f64,
    pub lm_order: u32,
    pub initial_mono_iters: u32,
    pub mono_iters: u32,
    pub mono_mixup_schedule: MixupSchedule,
    pub initial_tri_iters: u32,
    pub tri_iters: u32,
    pub tri_mixup_schedule: MixupSchedule,
    pub tri_iters_per_split: u32,
    /// Modified Baum-Welch iterations for discriminative training.
    pub mmi_iters: u32,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            split_path_letters: 4,
            var_floor_fraction: 0.01,
            lm_order: 3,
            initial_mono_iters: 3,
            mono_iters: 5,
            mono_mixup_schedule: MixupSchedule::single(1),
            initial_tri_iters: 3,
            tri_iters: 3,
            tri_mixup_schedule: MixupSchedule::single(1),
            tri_iters_per_split: 6,
            mmi_iters: 12,
        }
    }
}

// ── [train_pipeline] ──────────────────────────────────────────────────────────

/// Per-stage enable flags. Missing keys are disabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainPipeline {
    /// Wipe the experiment directory before a fresh run.
    #[serde(deserialize_with = "flag")]
    pub clean: bool,
    #[serde(deserialize_with = "flag")]
    pub coding: bool,
    #[serde(deserialize_with = "flag")]
    pub lm: bool,
    #[serde(deserialize_with = "flag")]
    pub flat_start: bool,
    #[serde(deserialize_with = "flag")]
    pub mixup_mono: bool,
    #[serde(deserialize_with = "flag")]
    pub mixdown_mono: bool,
    #[serde(deserialize_with = "flag")]
    pub mono_to_tri: bool,
    #[serde(deserialize_with = "flag")]
    pub mixup_tri: bool,
    #[serde(deserialize_with = "flag")]
    pub align_with_xword: bool,
    #[serde(deserialize_with = "flag")]
    pub mono_to_tri_from_xword: bool,
    #[serde(deserialize_with = "flag")]
    pub mixup_tri_2: bool,
    #[serde(deserialize_with = "flag")]
    pub diag: bool,
    #[serde(deserialize_with = "flag")]
    pub mmi: bool,
}

impl TrainPipeline {
    pub fn enabled(&self, stage: StageName) -> bool {
        match stage {
            StageName::Coding             => self.coding,
            StageName::Lm                 => self.lm,
            StageName::FlatStart          => self.flat_start,
            StageName::MixupMono          => self.mixup_mono,
            StageName::MixdownMono        => self.mixdown_mono,
            StageName::MonoToTri          => self.mono_to_tri,
            StageName::MixupTri           => self.mixup_tri,
            StageName::AlignWithXword     => self.align_with_xword,
            StageName::MonoToTriFromXword => self.mono_to_tri_from_xword,
            StageName::MixupTri2          => self.mixup_tri_2,
            StageName::Diag               => self.diag,
            StageName::Mmi                => self.mmi,
        }
    }

    pub fn set(&mut self, stage: StageName, on: bool) {
        let slot = match stage {
            StageName::Coding             => &mut self.coding,
            StageName::Lm                 => &mut self.lm,
            StageName::FlatStart          => &mut self.flat_start,
            StageName::MixupMono          => &mut self.mixup_mono,
            StageName::MixdownMono        => &mut self.mixdown_mono,
            StageName::MonoToTri          => &mut self.mono_to_tri,
            StageName::MixupTri           => &mut self.mixup_tri,
            StageName::AlignWithXword     => &mut self.align_with_xword,
            StageName::MonoToTriFromXword => &mut self.mono_to_tri_from_xword,
            StageName::MixupTri2          => &mut self.mixup_tri_2,
            StageName::Diag               => &mut self.diag,
            StageName::Mmi                => &mut self.mmi,
        };
        *slot = on;
    }
}

/// Accept `0`/`1` as well as `true`/`false`.
fn flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Int(i64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Bool(b) => Ok(b),
        Raw::Int(0) => Ok(false),
        Raw::Int(1) => Ok(true),
        Raw::Int(n) => Err(serde::de::Error::custom(format!(
            "expected 0 or 1, got {n}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[paths]
exp = "/tmp/exp"
data = "/tmp/data"
dict = "/tmp/cmudict"
tree_questions = "/tmp/tree_questions"
setup = "/tmp/setup"

[settings]
local = 1
jobs = 50
verbose = 1

[hmm_params]
states = 3
triphone_states = 2000
dt_ro = 200
dt_tb = 750

[train_params]
mono_mixup_schedule = "1_2_4"
tri_mixup_schedule = "2_4_8"
tri_iters_per_split = 6

[train_pipeline]
clean = 0
coding = 1
lm = 1
flat_start = 1
mono_to_tri = 1
mixup_tri = 1
diag = 0
mmi = false
"#;

    #[test]
    fn parses_sample_with_paths_alias() {
        let cfg = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.common.exp, PathBuf::from("/tmp/exp"));
        assert!(cfg.settings.local);
        assert_eq!(cfg.settings.jobs, 50);
        assert_eq!(cfg.settings.retries, 1);
        assert_eq!(cfg.hmm_params.dt_tb, 750.0);
        assert_eq!(cfg.train_params.tri_mixup_schedule.levels(), &[2, 4, 8]);
        assert_eq!(cfg.train_params.mmi_iters, 12);
        assert!(cfg.train_pipeline.enabled(StageName::Coding));
        assert!(cfg.train_pipeline.enabled(StageName::MixupTri));
        assert!(!cfg.train_pipeline.enabled(StageName::Diag));
        assert!(!cfg.train_pipeline.enabled(StageName::MixdownMono));
    }

    #[test]
    fn layout_paths_live_under_exp() {
        let cfg = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.state_path(), PathBuf::from("/tmp/exp/pipeline_state.json"));
        assert_eq!(cfg.spool_dir(), PathBuf::from("/tmp/exp/spool"));
        assert!(cfg.checkpoint_dir().starts_with(cfg.exp_dir()));
    }

    #[test]
    fn rejects_bad_flag_value() {
        let text = SAMPLE.replace("coding = 1", "coding = 2");
        let err = PipelineConfig::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ForgeError::Config(_)));
    }

    #[test]
    fn rejects_zero_jobs() {
        let text = SAMPLE.replace("jobs = 50", "jobs = 0");
        assert!(PipelineConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn tree_questions_required_for_clustering() {
        let text = SAMPLE.replace("tree_questions = \"/tmp/tree_questions\"\n", "");
        let err = PipelineConfig::from_toml_str(&text).unwrap_err();
        assert!(err.to_string().contains("tree_questions"));
    }

    #[test]
    fn config_copy_round_trips() {
        let cfg = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        let rendered = cfg.to_toml().unwrap();
        let again = PipelineConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(again.train_params.tri_mixup_schedule, cfg.train_params.tri_mixup_schedule);
        assert_eq!(again.settings.jobs, 50);
    }

    #[test]
    fn front_end_params_are_opaque_strings() {
        let p = FrontEnd::default().params();
        assert_eq!(p.get("num_cepstra").map(String::as_str), Some("12"));
        assert_eq!(p.get("use_c0").map(String::as_str), Some("1"));
    }
}
