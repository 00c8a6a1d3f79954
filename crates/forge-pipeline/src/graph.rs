//! Stage dependency graph.
//!
//! ```text
//! coding ──▶ flat_start ──▶ mixup_mono ──▶ mixdown_mono
//!   ┆            │             ┆               ┆     │
//!   └┄▶ lm ┄┄┄┄▶ │             ┆               ┆     │
//!                ▼             ▼               ▼     │
//!              mono_to_tri ◀┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄     │
//!                │   │                               │
//!                │   └──▶ mixup_tri ──▶ align_with_xword ──▶ mono_to_tri_from_xword
//!                ▼                                                │
//!              diag ◀┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄ mixup_tri_2 ◀──┘
//!                ▼
//!               mmi
//! ```
//!
//! Solid edges are required predecessors, dotted ones optional. The canonical
//! order of [`StageName::ALL`] is a topological order of this graph;
//! [`StageGraph::validate`] checks that on construction.

use std::collections::BTreeSet;

use forge_types::config::TrainPipeline;
use forge_types::{PipelineConfig, StageName};

use crate::error::{PipelineError, Result};

/// One node of the graph. Constructed once from the config, immutable after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub name: StageName,
    pub enabled: bool,
    /// Must be complete (run now or in an earlier run) before this stage.
    pub requires: &'static [StageName],
    /// Ordered before this stage when enabled; skipped otherwise.
    pub optional: &'static [StageName],
    /// Whose checkpoint this stage consumes: the first one that is complete.
    pub inputs: &'static [StageName],
}

fn edges(
    name: StageName,
) -> (&'static [StageName], &'static [StageName], &'static [StageName]) {
    use StageName::*;
    match name {
        Coding => (&[], &[], &[]),
        Lm => (&[], &[Coding], &[Coding]),
        FlatStart => (&[Coding], &[Lm], &[Coding]),
        MixupMono => (&[FlatStart], &[], &[FlatStart]),
        MixdownMono => (&[MixupMono], &[], &[MixupMono]),
        MonoToTri => (
            &[FlatStart],
            &[MixupMono, MixdownMono],
            &[MixdownMono, MixupMono, FlatStart],
        ),
        MixupTri => (&[MonoToTri], &[], &[MonoToTri]),
        AlignWithXword => (&[MixupTri], &[], &[MixupTri]),
        MonoToTriFromXword => (&[AlignWithXword, MixdownMono], &[], &[MixdownMono]),
        MixupTri2 => (&[MonoToTriFromXword], &[], &[MonoToTriFromXword]),
        Diag => (
            &[MonoToTri],
            &[MixupTri, MixupTri2],
            &[MixupTri2, MixupTri, MonoToTri],
        ),
        Mmi => (
            &[MonoToTri],
            &[Lm, MixupTri, MixupTri2, Diag],
            &[Diag, MixupTri2, MixupTri, MonoToTri],
        ),
    }
}

#[derive(Debug, Clone)]
pub struct StageGraph {
    stages: Vec<Stage>,
}

impl StageGraph {
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Self::from_flags(&config.train_pipeline)
    }

    pub fn from_flags(flags: &TrainPipeline) -> Result<Self> {
        let stages = StageName::ALL
            .into_iter()
            .map(|name| {
                let (requires, optional, inputs) = edges(name);
                Stage {
                    name,
                    enabled: flags.enabled(name),
                    requires,
                    optional,
                    inputs,
                }
            })
            .collect();
        let graph = Self { stages };
        graph.validate()?;
        Ok(graph)
    }

    /// Every declared predecessor must precede its dependent in canonical
    /// order, and every input must be a declared predecessor.
    pub fn validate(&self) -> Result<()> {
        for stage in &self.stages {
            for pred in stage.requires.iter().chain(stage.optional) {
                if pred.ordinal() >= stage.name.ordinal() {
                    return Err(PipelineError::Configuration(format!(
                        "stage {} declares predecessor {pred} that does not precede it",
                        stage.name
                    )));
                }
            }
            for input in stage.inputs {
                if !stage.requires.contains(input) && !stage.optional.contains(input) {
                    return Err(PipelineError::Configuration(format!(
                        "stage {} consumes {input} without depending on it",
                        stage.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn stage(&self, name: StageName) -> &Stage {
        &self.stages[name.ordinal()]
    }

    /// Enabled stages in execution order.
    ///
    /// Fails if an enabled stage requires a disabled stage that has not
    /// already completed in an earlier run.
    pub fn enabled_stages(&self, completed: &BTreeSet<StageName>) -> Result<Vec<&Stage>> {
        let enabled: Vec<&Stage> = self.stages.iter().filter(|s| s.enabled).collect();
        for stage in &enabled {
            for req in stage.requires {
                if !self.stage(*req).enabled && !completed.contains(req) {
                    return Err(PipelineError::Configuration(format!(
                        "stage {} requires {req}, which is disabled and has no completed checkpoint",
                        stage.name
                    )));
                }
            }
        }
        Ok(enabled)
    }

    /// Required predecessors are complete and no enabled optional predecessor
    /// is still outstanding.
    pub fn dependencies_satisfied(&self, stage: &Stage, completed: &BTreeSet<StageName>) -> bool {
        let required = stage.requires.iter().all(|r| completed.contains(r));
        let optional = stage
            .optional
            .iter()
            .all(|o| !self.stage(*o).enabled || completed.contains(o));
        required && optional
    }

    /// First enabled, incomplete stage whose dependencies are satisfied.
    pub fn next_runnable(&self, completed: &BTreeSet<StageName>) -> Option<&Stage> {
        self.stages.iter().find(|s| {
            s.enabled && !completed.contains(&s.name) && self.dependencies_satisfied(s, completed)
        })
    }

    /// Stage whose checkpoint `name` consumes.
    pub fn input_for(&self, name: StageName, completed: &BTreeSet<StageName>) -> Option<StageName> {
        self.stage(name)
            .inputs
            .iter()
            .copied()
            .find(|i| completed.contains(i))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(on: &[StageName]) -> TrainPipeline {
        let mut f = TrainPipeline::default();
        for &s in on {
            f.set(s, true);
        }
        f
    }

    fn names(stages: &[&Stage]) -> Vec<StageName> {
        stages.iter().map(|s| s.name).collect()
    }

    #[test]
    fn coding_through_diag_order() {
        use StageName::*;
        let graph = StageGraph::from_flags(&flags(&[Coding, FlatStart, MonoToTri, Diag])).unwrap();
        let order = graph.enabled_stages(&BTreeSet::new()).unwrap();
        assert_eq!(names(&order), vec![Coding, FlatStart, MonoToTri, Diag]);
    }

    #[test]
    fn every_flag_combination_yields_topological_order() {
        for mask in 0u32..(1 << StageName::ALL.len()) {
            let on: Vec<StageName> = StageName::ALL
                .into_iter()
                .filter(|s| mask & (1 << s.ordinal()) != 0)
                .collect();
            let graph = StageGraph::from_flags(&flags(&on)).unwrap();
            let Ok(order) = graph.enabled_stages(&BTreeSet::new()) else {
                continue;
            };
            for (pos, stage) in order.iter().enumerate() {
                for pred in stage.requires.iter().chain(stage.optional) {
                    if let Some(pred_pos) = order.iter().position(|s| s.name == *pred) {
                        assert!(pred_pos < pos, "{pred} after {} for mask {mask:#x}", stage.name);
                    }
                }
            }
        }
    }

    #[test]
    fn walking_next_runnable_visits_enabled_in_order() {
        use StageName::*;
        let graph =
            StageGraph::from_flags(&flags(&[Coding, Lm, FlatStart, MixupMono, MonoToTri, Mmi]))
                .unwrap();
        let mut completed = BTreeSet::new();
        let mut visited = Vec::new();
        while let Some(stage) = graph.next_runnable(&completed) {
            visited.push(stage.name);
            completed.insert(stage.name);
        }
        assert_eq!(visited, vec![Coding, Lm, FlatStart, MixupMono, MonoToTri, Mmi]);
    }

    #[test]
    fn disabled_required_predecessor_is_configuration_error() {
        use StageName::*;
        let graph = StageGraph::from_flags(&flags(&[Coding, MonoToTri])).unwrap();
        let err = graph.enabled_stages(&BTreeSet::new()).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert!(err.to_string().contains("flat_start"));
    }

    #[test]
    fn completed_predecessor_is_a_fallback_input() {
        use StageName::*;
        let graph = StageGraph::from_flags(&flags(&[MonoToTri, Diag])).unwrap();
        let completed: BTreeSet<_> = [Coding, FlatStart].into_iter().collect();
        let order = graph.enabled_stages(&completed).unwrap();
        assert_eq!(names(&order), vec![MonoToTri, Diag]);
        assert_eq!(graph.next_runnable(&completed).unwrap().name, MonoToTri);
    }

    #[test]
    fn disabled_optional_predecessor_still_satisfies_edge() {
        use StageName::*;
        let graph = StageGraph::from_flags(&flags(&[Coding, FlatStart, MonoToTri])).unwrap();
        let completed: BTreeSet<_> = [Coding, FlatStart].into_iter().collect();
        assert!(graph.dependencies_satisfied(graph.stage(MonoToTri), &completed));
    }

    #[test]
    fn enabled_optional_predecessor_must_finish_first() {
        use StageName::*;
        let graph =
            StageGraph::from_flags(&flags(&[Coding, FlatStart, MixupMono, MonoToTri])).unwrap();
        let completed: BTreeSet<_> = [Coding, FlatStart].into_iter().collect();
        assert!(!graph.dependencies_satisfied(graph.stage(MonoToTri), &completed));
        assert_eq!(graph.next_runnable(&completed).unwrap().name, MixupMono);
    }

    #[test]
    fn input_prefers_most_refined_checkpoint() {
        use StageName::*;
        let graph = StageGraph::from_flags(&flags(&[])).unwrap();

        let base: BTreeSet<_> = [Coding, FlatStart].into_iter().collect();
        assert_eq!(graph.input_for(MonoToTri, &base), Some(FlatStart));

        let mixed: BTreeSet<_> = [Coding, FlatStart, MixupMono].into_iter().collect();
        assert_eq!(graph.input_for(MonoToTri, &mixed), Some(MixupMono));

        let tri: BTreeSet<_> = [MonoToTri, MixupTri, Diag].into_iter().collect();
        assert_eq!(graph.input_for(Mmi, &tri), Some(Diag));
        assert_eq!(graph.input_for(Coding, &tri), None);
    }

    #[test]
    fn declared_edges_validate() {
        StageGraph::from_flags(&TrainPipeline::default())
            .unwrap()
            .validate()
            .unwrap();
    }
}
