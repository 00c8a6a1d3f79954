// Stage identities and mixture-splitting schedules.
//
// Shared across forge-pipeline, forge-store and forge-node.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ForgeError;

// ── Stage Name ───────────────────────────────────────────────────────────────

/// One phase of acoustic-model training.
///
/// Declaration order is the canonical execution order; the stage graph checks
/// every dependency edge against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Coding,
    Lm,
    FlatStart,
    MixupMono,
    MixdownMono,
    MonoToTri,
    MixupTri,
    AlignWithXword,
    MonoToTriFromXword,
    MixupTri2,
    Diag,
    Mmi,
}

impl StageName {
    /// Every stage, in canonical order.
    pub const ALL: [StageName; 12] = [
        Self::Coding,
        Self::Lm,
        Self::FlatStart,
        Self::MixupMono,
        Self::MixdownMono,
        Self::MonoToTri,
        Self::MixupTri,
        Self::AlignWithXword,
        Self::MonoToTriFromXword,
        Self::MixupTri2,
        Self::Diag,
        Self::Mmi,
    ];

    /// Key used in `[train_pipeline]`, state files and task ids.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Coding             => "coding",
            Self::Lm                 => "lm",
            Self::FlatStart          => "flat_start",
            Self::MixupMono          => "mixup_mono",
            Self::MixdownMono        => "mixdown_mono",
            Self::MonoToTri          => "mono_to_tri",
            Self::MixupTri           => "mixup_tri",
            Self::AlignWithXword     => "align_with_xword",
            Self::MonoToTriFromXword => "mono_to_tri_from_xword",
            Self::MixupTri2          => "mixup_tri_2",
            Self::Diag               => "diag",
            Self::Mmi                => "mmi",
        }
    }

    /// Upper-case banner used in `"<STAGE> started"` log lines.
    pub fn banner(self) -> &'static str {
        match self {
            Self::Coding             => "CODING",
            Self::Lm                 => "MLF/LM/DICT",
            Self::FlatStart          => "FLAT START",
            Self::MixupMono          => "MIXUP MONO",
            Self::MixdownMono        => "MIXDOWN MONO",
            Self::MonoToTri          => "MONO TO TRI",
            Self::MixupTri           => "MIXUP TRI",
            Self::AlignWithXword     => "XWORD ALIGN",
            Self::MonoToTriFromXword => "MONO TO TRI FROM XWORD",
            Self::MixupTri2          => "MIXUP TRI 2",
            Self::Diag               => "DIAG",
            Self::Mmi                => "DISCRIM",
        }
    }

    /// Position in the canonical order.
    pub fn ordinal(self) -> usize {
        self as usize
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| ForgeError::Parse(format!("unknown stage: {s}")))
    }
}

// ── Mixup Schedule ───────────────────────────────────────────────────────────

/// Ordered, strictly increasing target mixture counts, e.g. `2_4_8`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSchedule", into = "String")]
pub struct MixupSchedule(Vec<u32>);

/// Accepted spellings in the config file: `"2_4_8"`, `8`, or `[2, 4, 8]`.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawSchedule {
    Text(String),
    Single(u32),
    List(Vec<u32>),
}

impl MixupSchedule {
    pub fn new(levels: Vec<u32>) -> Result<Self, ForgeError> {
        if levels.is_empty() {
            return Err(ForgeError::Parse("mixup schedule is empty".into()));
        }
        if levels.iter().any(|&m| m == 0) {
            return Err(ForgeError::Parse(
                "mixup schedule entries must be positive".into(),
            ));
        }
        if levels.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ForgeError::Parse(format!(
                "mixup schedule must be strictly increasing: {levels:?}"
            )));
        }
        Ok(Self(levels))
    }

    /// A schedule with one level and therefore no splitting.
    pub fn single(mixtures: u32) -> Self {
        Self(vec![mixtures.max(1)])
    }

    pub fn levels(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Mixture count of the last level.
    pub fn final_mixtures(&self) -> u32 {
        self.0.last().copied().unwrap_or(1)
    }

    /// True when the schedule moves through more than one mixture count.
    pub fn splits(&self) -> bool {
        self.0.len() > 1
    }
}

impl FromStr for MixupSchedule {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let levels = s
            .trim()
            .split('_')
            .map(|part| {
                part.trim()
                    .parse::<u32>()
                    .map_err(|e| ForgeError::Parse(format!("mixup schedule `{s}`: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(levels)
    }
}

impl TryFrom<RawSchedule> for MixupSchedule {
    type Error = ForgeError;

    fn try_from(raw: RawSchedule) -> Result<Self, Self::Error> {
        match raw {
            RawSchedule::Text(s) => s.parse(),
            RawSchedule::Single(m) => Self::new(vec![m]),
            RawSchedule::List(levels) => Self::new(levels),
        }
    }
}

impl From<MixupSchedule> for String {
    fn from(schedule: MixupSchedule) -> Self {
        schedule.to_string()
    }
}

impl fmt::Display for MixupSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        f.write_str(&parts.join("_"))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
