//! Cycle engine: one Measure step followed by one Stitch step, repeated
//! until the trail's cycle budget is consumed.

use anyhow::{Result, anyhow};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::agents::SessionLimits;
use crate::agents::measure::MeasureAgent;
use crate::agents::stitch::StitchAgent;
use crate::core::lifecycle::{TrailOp, check};
use crate::core::types::{CyclePhase, CycleStatus, TaskResult, TrailState};
use crate::io::agent::Agent;
use crate::io::context::{measure_inputs, stitch_inputs};
use crate::io::cycle_log::{CycleRecord, load_cycle_record, write_cycle_record};
use crate::io::init::remove_dir_if_exists;
use crate::io::registry::{Registry, load_registry};
use crate::orchestrator::{Orchestrator, TrailSession};

/// Summary of one finished cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub index: u32,
    pub proposed: Vec<String>,
    pub results: Vec<TaskResult>,
    pub status: CycleStatus,
}

impl CycleReport {
    /// Nothing was proposed and nothing was executed.
    pub fn is_idle(&self) -> bool {
        self.proposed.is_empty() && self.results.is_empty()
    }
}

/// Outcome of a standalone Measure step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeasureReport {
    pub name: String,
    pub cycle: u32,
    pub proposed: Vec<String>,
}

impl<A: Agent> Orchestrator<A> {
    /// Run cycles on `session` until its record's budget is consumed.
    ///
    /// The trail is `Running` while cycles execute and `Started` afterwards.
    /// A cycle-level failure leaves it `Interrupted` and returns the error.
    /// The first cycle starts in `first_phase`; `resumed` marks it as
    /// continued after an interruption.
    pub(crate) fn drive(
        &self,
        registry: &mut Registry,
        session: &mut TrailSession,
        first_phase: CyclePhase,
        resumed: bool,
    ) -> Result<Vec<CycleReport>> {
        let name = session.name.clone();
        registry.require_mut(&name)?.set_state(TrailState::Running);
        self.save_registry(registry)?;

        let mut first = Some((first_phase, resumed));
        let mut reports = Vec::new();
        loop {
            let record = registry.require_mut(&name)?;
            if record.cycles_completed >= record.cycle_budget {
                break;
            }
            let index = record.cycles_completed + 1;
            let (phase, resumed) = first.take().unwrap_or((CyclePhase::Measure, false));

            match self.run_cycle(session, index, phase, resumed) {
                Ok(report) => {
                    let record = registry.require_mut(&name)?;
                    record.cycles_completed = index;
                    if record.until_idle && report.is_idle() {
                        info!(trail = %name, cycle = index, "cycle was idle, ending run");
                        record.cycle_budget = record.cycles_completed;
                    }
                    record.updated_at = Utc::now();
                    self.save_registry(registry)?;
                    reports.push(report);
                }
                Err(err) => {
                    warn!(trail = %name, cycle = index, error = %format!("{err:#}"), "cycle aborted");
                    registry
                        .require_mut(&name)?
                        .set_state(TrailState::Interrupted);
                    self.save_registry(registry)?;
                    return Err(err.context(format!("cycle {index} of trail '{name}' aborted")));
                }
            }
        }

        let record = registry.require_mut(&name)?;
        record.until_idle = false;
        record.set_state(TrailState::Started);
        self.save_registry(registry)?;
        Ok(reports)
    }

    /// Run cycle `index`, starting at `phase`.
    #[instrument(skip_all, fields(trail = %session.name, cycle = index, ?phase))]
    pub(crate) fn run_cycle(
        &self,
        session: &mut TrailSession,
        index: u32,
        phase: CyclePhase,
        resumed: bool,
    ) -> Result<CycleReport> {
        let mut record = load_cycle_record(&session.trail_paths, index)?
            .unwrap_or_else(|| CycleRecord::begin(&session.name, index));
        if resumed {
            record.resumed += 1;
        }
        write_cycle_record(&session.trail_paths, &record)?;
        info!(resumed, "cycle started");

        if let Err(err) = self.cycle_steps(session, index, phase, &mut record) {
            record.fail(&err);
            write_cycle_record(&session.trail_paths, &record)?;
            return Err(err);
        }

        record.finish();
        session.checkpoint.cycle_index = index;
        session.checkpoint.measured_cycle = None;
        session.checkpoint_now()?;
        write_cycle_record(&session.trail_paths, &record)?;
        info!(
            proposed = record.proposed.len(),
            executed = record.results.len(),
            status = ?record.status,
            "cycle finished"
        );
        Ok(CycleReport {
            index,
            proposed: record.proposed,
            results: record.results,
            status: record.status,
        })
    }

    /// Run only the Measure step of the active trail's next cycle.
    ///
    /// The cycle stays open: the next `cycle stitch`, `trail run` or resume
    /// continues it in the Stitch phase.
    pub fn measure_once(&self) -> Result<MeasureReport> {
        let _lock = self.lock("active trail")?;
        let mut registry = self.load_registry_locked()?;
        let name = registry.active_name()?;
        let record = registry.require(&name)?.clone();
        check(&name, record.state, TrailOp::Measure)?;

        let mut session = self.open_session(&record)?;
        session.save_work(&format!("cobbler: save work before measure on trail {name}"))?;
        let index = record.cycles_completed + 1;
        let proposed = self.while_running(&mut registry, &name, || {
            let mut cycle = load_cycle_record(&session.trail_paths, index)?
                .unwrap_or_else(|| CycleRecord::begin(&name, index));
            let ids = self.measure_step(&mut session, index)?;
            cycle.proposed.extend(ids.iter().cloned());
            write_cycle_record(&session.trail_paths, &cycle)?;
            Ok(ids)
        })?;
        Ok(MeasureReport {
            name,
            cycle: index,
            proposed,
        })
    }

    /// Run only the Stitch step, completing the active trail's next cycle.
    pub fn stitch_once(&self) -> Result<CycleReport> {
        let _lock = self.lock("active trail")?;
        let mut registry = self.load_registry_locked()?;
        let name = registry.active_name()?;
        let record = registry.require(&name)?.clone();
        check(&name, record.state, TrailOp::Stitch)?;

        let mut session = self.open_session(&record)?;
        session.save_work(&format!("cobbler: save work before stitch on trail {name}"))?;
        let index = record.cycles_completed + 1;
        let report = self.while_running(&mut registry, &name, || {
            self.run_cycle(&mut session, index, CyclePhase::Stitch, false)
        })?;

        let record = registry.require_mut(&name)?;
        record.cycles_completed = index;
        record.cycle_budget = record.cycle_budget.max(index);
        record.updated_at = Utc::now();
        self.save_registry(&registry)?;
        Ok(report)
    }

    /// Render the Measure prompt for the active trail's next cycle.
    pub fn measure_prompt(&self) -> Result<String> {
        let registry = load_registry(&self.paths.registry_path)?;
        let name = registry.active_name()?;
        let record = registry.require(&name)?;
        let session = self.open_session(record)?;
        let inputs = measure_inputs(
            &name,
            record.cycles_completed + 1,
            session.worktree.workdir(),
            session.graph.tasks(),
            &self.config,
        )?;
        let pack = MeasureAgent::new(SessionLimits::measure(&self.config)).prompt(&inputs)?;
        Ok(pack.as_str().to_string())
    }

    /// Render the Stitch prompt for `task`, or for the task that would run next.
    pub fn stitch_prompt(&self, task: Option<&str>) -> Result<String> {
        let registry = load_registry(&self.paths.registry_path)?;
        let name = registry.active_name()?;
        let record = registry.require(&name)?;
        let session = self.open_session(record)?;
        let mut graph = session.graph.clone();
        graph.refresh_readiness();
        let task_id = match task {
            Some(id) => id.to_string(),
            None => graph
                .in_progress()
                .into_iter()
                .chain(graph.ready_order())
                .next()
                .ok_or_else(|| anyhow!("no ready task on trail '{name}'"))?,
        };
        let inputs = stitch_inputs(
            &name,
            record.cycles_completed + 1,
            session.worktree.workdir(),
            &graph,
            &task_id,
            &self.config,
        )?;
        let pack = StitchAgent::new(SessionLimits::stitch(&self.config)).prompt(&inputs)?;
        Ok(pack.as_str().to_string())
    }

    /// Delete agent prompts, outputs and logs of every trail.
    pub fn reset_scratch(&self) -> Result<bool> {
        let _lock = self.lock("scratch")?;
        remove_dir_if_exists(&self.paths.scratch_dir)
    }

    /// Mark trail `name` running around `step`; a failure leaves it interrupted.
    fn while_running<T>(
        &self,
        registry: &mut Registry,
        name: &str,
        step: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        registry.require_mut(name)?.set_state(TrailState::Running);
        self.save_registry(registry)?;
        match step() {
            Ok(value) => {
                registry.require_mut(name)?.set_state(TrailState::Started);
                self.save_registry(registry)?;
                Ok(value)
            }
            Err(err) => {
                warn!(trail = %name, error = %format!("{err:#}"), "step aborted");
                registry
                    .require_mut(name)?
                    .set_state(TrailState::Interrupted);
                self.save_registry(registry)?;
                Err(err)
            }
        }
    }

    fn cycle_steps(
        &self,
        session: &mut TrailSession,
        index: u32,
        phase: CyclePhase,
        record: &mut CycleRecord,
    ) -> Result<()> {
        match phase {
            CyclePhase::Measure => {
                record.proposed = self.measure_step(session, index)?;
                write_cycle_record(&session.trail_paths, record)?;
            }
            CyclePhase::Stitch if record.proposed.is_empty() => {
                record.proposed = session
                    .graph
                    .tasks()
                    .iter()
                    .filter(|t| t.origin_cycle == index)
                    .map(|t| t.id.clone())
                    .collect();
            }
            CyclePhase::Stitch => {}
        }
        self.stitch_step(session, index, record)
    }
}
