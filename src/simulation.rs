/// Discrete-event driver for intermittent transforms
///
/// `Simulation` wires a context, power source, NVM store and scheduler
/// together from a `SimulationConfig` and pumps the event queue. The power
/// source's transitions are fed to the queue lazily, one pending transition
/// at a time, so an infinite power schedule never has to be materialized.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::SimulationConfig;
use crate::error::{Result, TesseraError};
use crate::leakage::{LeakageSample, LeakageSummary};
use crate::ntt::{Direction, NttParams, Transform};
use crate::nvm::NvmStore;
use crate::polynomial::Polynomial;
use crate::power::PowerSource;
use crate::scheduler::{Scheduler, SchedulerStats, SchedulerStatus};
use crate::sim::{EventKind, SimContext, SimTime};
use crate::tiling::TilePlan;

/// Outcome of one simulated run
#[derive(Clone, Debug)]
pub struct RunReport {
    /// Transform result, present only if the run completed
    pub output: Option<Polynomial>,
    pub status: SchedulerStatus,
    pub stats: SchedulerStats,
    /// Simulated time from start to the last processed event
    pub elapsed: SimTime,
    pub deadline: SimTime,
    /// Seed the power schedule was drawn from
    pub seed: u64,
    /// Every NVM write made by the store during its lifetime
    pub trace: Vec<LeakageSample>,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        self.output.is_some()
    }

    pub fn leakage_summary(&self) -> Option<LeakageSummary> {
        LeakageSummary::from_samples(&self.trace)
    }

    /// The transform result, or `DeadlineExceeded` if the run was cut short
    pub fn into_output(self) -> Result<Polynomial> {
        let progress_index = self.status.progress_index;
        self.output.ok_or(TesseraError::DeadlineExceeded {
            deadline: self.deadline,
            progress_index,
        })
    }
}

pub struct Simulation {
    config: SimulationConfig,
    ctx: SimContext,
    power: PowerSource,
    scheduler: Scheduler,
    started_at: SimTime,
    started: bool,
}

impl Simulation {
    /// Builds a fresh device with an erased NVM store
    pub fn new(config: &SimulationConfig, input: Polynomial, direction: Direction) -> Result<Self> {
        config.validate()?;
        let ctx = SimContext::new();
        let store = NvmStore::new(&ctx, config.nvm_capacity, config.checkpoint_address)?;
        Self::with_store(config, store, input, direction)
    }

    /// Boots a device over an existing store
    ///
    /// Pending events on the store's context belong to the previous boot and
    /// are dropped; the clock keeps running from where it stopped. Any live
    /// checkpoint in the store is resumed from.
    pub fn with_store(
        config: &SimulationConfig,
        store: NvmStore,
        input: Polynomial,
        direction: Direction,
    ) -> Result<Self> {
        config.validate()?;

        let ctx = store.context().clone();
        ctx.clear_events();

        let params = Arc::new(config.ntt_params()?);
        let plan = TilePlan::new(params, direction, config.tiles_per_layer)?;
        let (on, off) = config.samplers()?;
        let power = PowerSource::from_boxed(&ctx, on, off);
        let scheduler = Scheduler::new(plan, config.timing.clone(), store, input)?;

        Ok(Self {
            config: config.clone(),
            started_at: ctx.now(),
            ctx,
            power,
            scheduler,
            started: false,
        })
    }

    pub fn context(&self) -> &SimContext {
        &self.ctx
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Mutable scheduler access, e.g. for fault injection into its store
    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn power(&self) -> &PowerSource {
        &self.power
    }

    /// Shuts the device down, handing back its durable memory
    pub fn into_store(self) -> NvmStore {
        self.scheduler.into_store()
    }

    fn schedule_next_power_event(&mut self, after: SimTime) -> Result<()> {
        let next = self.power.next_transition_after(after)?;
        self.ctx.schedule_at(next.at, EventKind::PowerTransition(next.state));
        Ok(())
    }

    fn ensure_started(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        self.schedule_next_power_event(self.ctx.now())?;
        self.scheduler.start(&mut self.power)
    }

    /// Processes every event due at or before `until`
    ///
    /// Stopping here is a clean cancellation: whatever reached NVM stays
    /// there and a later call continues where this one left off.
    ///
    /// # Returns
    /// * `Result<bool>` - Whether the transform has completed
    pub fn run_until(&mut self, until: SimTime) -> Result<bool> {
        self.ensure_started()?;

        while !self.scheduler.is_complete() {
            match self.ctx.peek_time() {
                Some(at) if at <= until => {}
                _ => break,
            }
            let event = match self.ctx.pop_next() {
                Some(event) => event,
                None => break,
            };

            if let EventKind::PowerTransition(_) = event.kind {
                self.schedule_next_power_event(event.at)?;
            }
            self.scheduler.handle_event(&event, &mut self.power)?;
        }

        Ok(self.scheduler.is_complete())
    }

    /// Runs until completion or the configured deadline
    pub fn run(&mut self) -> Result<RunReport> {
        let deadline = self.started_at + self.config.deadline;
        let complete = self.run_until(deadline)?;
        if !complete {
            debug!(deadline, status = %self.scheduler.status(), "deadline reached");
        }
        Ok(self.report())
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            output: self.scheduler.output().cloned(),
            status: self.scheduler.status(),
            stats: self.scheduler.stats(),
            elapsed: self.ctx.now() - self.started_at,
            deadline: self.config.deadline,
            seed: self.config.seed,
            trace: self.scheduler.store().trace().to_vec(),
        }
    }
}

/// Runs one transform on a freshly erased simulated device
///
/// # Arguments
/// * `config` - Device, power and cost configuration
/// * `input` - Polynomial to transform
/// * `direction` - Forward or inverse
///
/// # Returns
/// * `Result<Polynomial>` - The transform output, identical to the direct
///   transform regardless of how often power failed
pub fn run_transform(
    config: &SimulationConfig,
    input: &Polynomial,
    direction: Direction,
) -> Result<Polynomial> {
    let mut simulation = Simulation::new(config, input.clone(), direction)?;
    simulation.run()?.into_output()
}

/// `Transform` backed by the intermittent simulator
///
/// Each call runs on a fresh device. The power model is reseeded per call
/// (`seed + call index`) so successive transforms see different failures.
/// Failed calls consume an index too.
#[derive(Debug)]
pub struct IntermittentTransform {
    config: SimulationConfig,
    params: NttParams,
    calls: u64,
    reports: Vec<RunReport>,
}

impl IntermittentTransform {
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        let params = config.ntt_params()?;
        Ok(Self {
            config,
            params,
            calls: 0,
            reports: Vec::new(),
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Number of `transform` calls so far, successful or not
    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// Reports of every transform run so far
    pub fn reports(&self) -> &[RunReport] {
        &self.reports
    }

    /// Statistics summed over every run
    pub fn total_stats(&self) -> SchedulerStats {
        self.reports
            .iter()
            .fold(SchedulerStats::default(), |mut acc, report| {
                acc.completed_tesserae += report.stats.completed_tesserae;
                acc.power_failures += report.stats.power_failures;
                acc.lost_tesserae += report.stats.lost_tesserae;
                acc.restores += report.stats.restores;
                acc
            })
    }
}

impl Transform for IntermittentTransform {
    fn params(&self) -> &NttParams {
        &self.params
    }

    fn transform(&mut self, input: &Polynomial, direction: Direction) -> Result<Polynomial> {
        let run = self.calls;
        self.calls += 1;
        let config = self.config.clone().with_seed(self.config.seed.wrapping_add(run));

        let mut simulation = Simulation::new(&config, input.clone(), direction)?;
        let report = simulation.run()?;
        info!(
            run,
            %direction,
            power_failures = report.stats.power_failures,
            elapsed = report.elapsed,
            "intermittent transform finished"
        );

        let output = report.output.clone();
        let status = report.status;
        self.reports.push(report);
        output.ok_or(TesseraError::DeadlineExceeded {
            deadline: config.deadline,
            progress_index: status.progress_index,
        })
    }
}
