//! Per-stage step plans.
//!
//! A plan is a list of items: single steps, and iterative phases that the
//! [`ConvergenceTracker`](crate::convergence::ConvergenceTracker) expands
//! into concrete steps at run time. Every re-estimation iteration is a
//! sharded `accumulate` step followed by a single `update` step that merges
//! the accumulators; a mixture split adds a single `mixup` step in front.

use std::collections::BTreeMap;

use forge_types::{MixupSchedule, PipelineConfig, StageName};

use crate::convergence::ConvergenceTracker;

/// Whether a step fans out over corpus shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepShape {
    Sharded,
    Single,
}

#[derive(Debug, Clone)]
pub struct StepSpec {
    pub label: &'static str,
    pub shape: StepShape,
    pub params: BTreeMap<String, String>,
    pub uses_question_set: bool,
}

impl StepSpec {
    fn single(label: &'static str) -> Self {
        Self {
            label,
            shape: StepShape::Single,
            params: BTreeMap::new(),
            uses_question_set: false,
        }
    }

    fn sharded(label: &'static str) -> Self {
        Self {
            shape: StepShape::Sharded,
            ..Self::single(label)
        }
    }

    fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    fn params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params.extend(params);
        self
    }

    fn with_question_set(mut self) -> Self {
        self.uses_question_set = true;
        self
    }
}

/// An iterative sub-stage, e.g. `mono_iters` or a mixup schedule.
#[derive(Debug, Clone)]
pub struct Phase {
    pub name: &'static str,
    pub schedule: MixupSchedule,
    pub iterations_per_level: u32,
    pub params: BTreeMap<String, String>,
    /// Re-estimate the variance floor when splitting up to this count.
    pub var_floor_at: Option<u32>,
}

impl Phase {
    fn fixed(name: &'static str, mixtures: u32, iterations: u32) -> Self {
        Self {
            name,
            schedule: MixupSchedule::single(mixtures),
            iterations_per_level: iterations,
            params: BTreeMap::new(),
            var_floor_at: None,
        }
    }

    fn mixup(name: &'static str, schedule: MixupSchedule, iterations: u32) -> Self {
        Self {
            name,
            schedule,
            iterations_per_level: iterations,
            params: BTreeMap::new(),
            var_floor_at: None,
        }
    }

    pub fn tracker(&self) -> ConvergenceTracker {
        ConvergenceTracker::new(self.schedule.clone(), self.iterations_per_level)
    }
}

#[derive(Debug, Clone)]
pub enum PlanItem {
    Step(StepSpec),
    Iterate(Phase),
}

/// A step with its run-time identity, ready for the splitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcreteStep {
    /// Unique within the stage; names the work directory and task ids.
    pub key: String,
    pub label: String,
    pub shape: StepShape,
    pub params: BTreeMap<String, String>,
    pub uses_question_set: bool,
}

impl ConcreteStep {
    pub fn from_spec(spec: &StepSpec) -> Self {
        Self {
            key: spec.label.to_string(),
            label: spec.label.to_string(),
            shape: spec.shape,
            params: spec.params.clone(),
            uses_question_set: spec.uses_question_set,
        }
    }

    pub fn mixup(phase: &Phase, mixtures: u32) -> Self {
        let mut params = phase.params.clone();
        params.insert("mixtures".into(), mixtures.to_string());
        let var_floor = phase.var_floor_at == Some(mixtures);
        params.insert("estimate_var_floor".into(), u8::from(var_floor).to_string());
        Self {
            key: format!("{}.m{mixtures}.mixup", phase.name),
            label: "mixup".into(),
            shape: StepShape::Single,
            params,
            uses_question_set: false,
        }
    }

    pub fn accumulate(phase: &Phase, mixtures: u32, iteration: u32) -> Self {
        Self::iteration_step(phase, mixtures, iteration, "accumulate", StepShape::Sharded)
    }

    pub fn update(phase: &Phase, mixtures: u32, iteration: u32) -> Self {
        Self::iteration_step(phase, mixtures, iteration, "update", StepShape::Single)
    }

    fn iteration_step(
        phase: &Phase,
        mixtures: u32,
        iteration: u32,
        label: &str,
        shape: StepShape,
    ) -> Self {
        let mut params = phase.params.clone();
        params.insert("phase".into(), phase.name.to_string());
        params.insert("mixtures".into(), mixtures.to_string());
        params.insert("iteration".into(), iteration.to_string());
        Self {
            key: format!("{}.m{mixtures}.i{iteration:02}.{label}", phase.name),
            label: label.to_string(),
            shape,
            params,
            uses_question_set: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StagePlan {
    pub stage: StageName,
    pub items: Vec<PlanItem>,
    /// Mixture count of the model the stage produces.
    pub output_mixtures: u32,
}

impl StagePlan {
    /// Build the plan for `stage`. `input_mixtures` is the mixture count of
    /// the checkpoint the stage consumes (1 when it has none).
    pub fn build(stage: StageName, config: &PipelineConfig, input_mixtures: u32) -> Self {
        let tp = &config.train_params;
        let hmm = &config.hmm_params;
        let input_mixtures = input_mixtures.max(1);

        let tie_states = || {
            StepSpec::single("tie_states")
                .param("dt_ro", hmm.dt_ro)
                .param("dt_tb", hmm.dt_tb)
                .param("triphone_states", hmm.triphone_states)
                .with_question_set()
        };

        let (items, output_mixtures) = match stage {
            StageName::Coding => (
                vec![PlanItem::Step(
                    StepSpec::sharded("extract").params(config.front_end.params()),
                )],
                1,
            ),
            StageName::Lm => (
                vec![
                    PlanItem::Step(StepSpec::single("dictionary")),
                    PlanItem::Step(StepSpec::single("word_mlf")),
                    PlanItem::Step(StepSpec::single("lm").param("lm_order", tp.lm_order)),
                ],
                1,
            ),
            StageName::FlatStart => (
                vec![
                    PlanItem::Step(StepSpec::single("phone_mlf")),
                    PlanItem::Step(StepSpec::single("proto").param("states", hmm.states)),
                    PlanItem::Step(
                        StepSpec::single("init")
                            .param("var_floor_fraction", tp.var_floor_fraction),
                    ),
                    PlanItem::Iterate(Phase::fixed("initial_mono_iters", 1, tp.initial_mono_iters)),
                    PlanItem::Step(StepSpec::sharded("align")),
                    PlanItem::Iterate(Phase::fixed("mono_iters", 1, tp.mono_iters)),
                ],
                1,
            ),
            StageName::MixupMono => (
                vec![PlanItem::Iterate(Phase::mixup(
                    "mixup_mono",
                    tp.mono_mixup_schedule.clone(),
                    tp.mono_iters,
                ))],
                mixed_up(&tp.mono_mixup_schedule, tp.mono_iters, input_mixtures),
            ),
            StageName::MixdownMono => (vec![PlanItem::Step(StepSpec::single("mixdown"))], 1),
            StageName::MonoToTri => (
                vec![
                    PlanItem::Step(StepSpec::single("clone_triphones")),
                    PlanItem::Iterate(Phase::fixed("initial_tri_iters", 1, tp.initial_tri_iters)),
                    PlanItem::Step(tie_states()),
                    PlanItem::Iterate(Phase::fixed("tri_iters", 1, tp.tri_iters)),
                ],
                1,
            ),
            StageName::MixupTri | StageName::MixupTri2 => {
                let mut phase = Phase::mixup(
                    stage.as_str(),
                    tp.tri_mixup_schedule.clone(),
                    tp.tri_iters_per_split,
                );
                phase.var_floor_at = Some(2);
                (
                    vec![PlanItem::Iterate(phase)],
                    mixed_up(&tp.tri_mixup_schedule, tp.tri_iters_per_split, input_mixtures),
                )
            }
            StageName::AlignWithXword => (
                vec![
                    PlanItem::Step(StepSpec::sharded("align").param("cross_word", 1)),
                    PlanItem::Step(StepSpec::single("map_to_mono")),
                ],
                input_mixtures,
            ),
            StageName::MonoToTriFromXword => {
                let mut two_model = Phase::fixed("two_model", 1, 1);
                two_model.params.insert("two_model".into(), "1".into());
                (
                    vec![
                        PlanItem::Step(StepSpec::single("clone_triphones")),
                        PlanItem::Iterate(two_model),
                        PlanItem::Step(tie_states()),
                        PlanItem::Iterate(Phase::fixed("tri_iters", 1, tp.tri_iters)),
                    ],
                    1,
                )
            }
            StageName::Diag => (
                vec![
                    PlanItem::Step(
                        StepSpec::single("diagonalize").param("mixtures", input_mixtures),
                    ),
                    PlanItem::Iterate(Phase::fixed(
                        "diag_iters",
                        input_mixtures,
                        tp.tri_iters_per_split,
                    )),
                ],
                input_mixtures,
            ),
            StageName::Mmi => (
                vec![
                    PlanItem::Step(
                        StepSpec::single("weak_lm")
                            .param("lm_order", 2)
                            .param("target_ppl_ratio", 8),
                    ),
                    PlanItem::Step(StepSpec::sharded("denominator_lattices")),
                    PlanItem::Step(StepSpec::sharded("prune_lattices")),
                    PlanItem::Step(StepSpec::sharded("phone_mark_denominator")),
                    PlanItem::Step(StepSpec::sharded("numerator_lattices")),
                    PlanItem::Step(StepSpec::sharded("phone_mark_numerator")),
                    PlanItem::Step(StepSpec::sharded("add_lm_scores")),
                    PlanItem::Iterate(Phase::fixed("mmi_iters", input_mixtures, tp.mmi_iters)),
                ],
                input_mixtures,
            ),
        };

        Self {
            stage,
            items,
            output_mixtures,
        }
    }

    /// Number of steps the plan dispatches, mixup and update steps included.
    pub fn step_count(&self) -> u32 {
        self.items
            .iter()
            .map(|item| match item {
                PlanItem::Step(_) => 1,
                PlanItem::Iterate(phase) => {
                    let splits = if phase.schedule.splits() {
                        phase.schedule.len() as u32
                    } else {
                        0
                    };
                    let iterations = phase.tracker().total_iterations();
                    if iterations == 0 {
                        0
                    } else {
                        iterations * 2 + splits
                    }
                }
            })
            .sum()
    }
}

/// A mixup phase with no iterations splits nothing; the model keeps the
/// mixture count it came in with.
fn mixed_up(schedule: &MixupSchedule, iterations: u32, input_mixtures: u32) -> u32 {
    if iterations == 0 {
        input_mixtures
    } else {
        schedule.final_mixtures()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PipelineConfig {
        PipelineConfig::from_toml_str(
            r#"
[common]
exp = "/tmp/exp"

[train_params]
initial_mono_iters = 3
mono_iters = 5
mono_mixup_schedule = "1_2_4"
initial_tri_iters = 3
tri_iters = 3
tri_mixup_schedule = "2_4_8"
tri_iters_per_split = 6
"#,
        )
        .unwrap()
    }

    #[test]
    fn mixup_tri_counts_steps() {
        let plan = StagePlan::build(StageName::MixupTri, &config(), 1);
        // 18 iterations × (accumulate + update) + 3 mixups
        assert_eq!(plan.step_count(), 39);
        assert_eq!(plan.output_mixtures, 8);
    }

    #[test]
    fn empty_mixup_phase_keeps_input_mixtures() {
        let mut cfg = config();
        cfg.train_params.tri_iters_per_split = 0;
        let plan = StagePlan::build(StageName::MixupTri, &cfg, 1);
        assert_eq!(plan.step_count(), 0);
        assert_eq!(plan.output_mixtures, 1);

        cfg.train_params.mono_iters = 0;
        let plan = StagePlan::build(StageName::MixupMono, &cfg, 2);
        assert_eq!(plan.output_mixtures, 2);
    }

    #[test]
    fn flat_start_layout() {
        let plan = StagePlan::build(StageName::FlatStart, &config(), 1);
        // phone_mlf, proto, init, 3×2, align, 5×2
        assert_eq!(plan.step_count(), 3 + 6 + 1 + 10);
    }

    #[test]
    fn diag_inherits_input_mixtures() {
        let plan = StagePlan::build(StageName::Diag, &config(), 8);
        assert_eq!(plan.output_mixtures, 8);
        match &plan.items[1] {
            PlanItem::Iterate(phase) => {
                assert_eq!(phase.schedule.levels(), &[8]);
                assert!(!phase.schedule.splits());
            }
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[test]
    fn tie_states_uses_question_set() {
        let plan = StagePlan::build(StageName::MonoToTri, &config(), 1);
        let tie = plan
            .items
            .iter()
            .find_map(|i| match i {
                PlanItem::Step(s) if s.label == "tie_states" => Some(s),
                _ => None,
            })
            .unwrap();
        assert!(tie.uses_question_set);
        assert_eq!(tie.params.get("dt_tb").map(String::as_str), Some("750"));
    }

    #[test]
    fn concrete_keys_are_unique_and_stable() {
        let plan = StagePlan::build(StageName::MixupTri, &config(), 1);
        let PlanItem::Iterate(phase) = &plan.items[0] else { panic!() };
        let mix = ConcreteStep::mixup(phase, 2);
        let acc = ConcreteStep::accumulate(phase, 2, 3);
        let upd = ConcreteStep::update(phase, 2, 3);
        assert_eq!(mix.key, "mixup_tri.m2.mixup");
        assert_eq!(mix.params.get("estimate_var_floor").map(String::as_str), Some("1"));
        assert_eq!(acc.key, "mixup_tri.m2.i03.accumulate");
        assert_eq!(upd.key, "mixup_tri.m2.i03.update");
        assert_eq!(acc.shape, StepShape::Sharded);
        assert_eq!(ConcreteStep::mixup(phase, 4).params["estimate_var_floor"], "0");
    }
}
