/// Tile scheduler
///
/// The scheduler executes a `TilePlan` one tessera at a time under
/// intermittent power. It is a state machine driven by the simulation's
/// event queue:
///
/// ```text
///            start                  tessera computed
///   Idle ─────────► Resuming ──► Running(t) ──────────► Checkpointing(t)
///                      ▲             │                       │
///                      │        power off              record landed
///                 power on           ▼                       │
///                      └──────── Interrupted ◄── power off ──┤
///                                                            ▼
///                                              Running(t+1) or Complete
/// ```
///
/// Only the last landed checkpoint survives an interruption. Resuming always
/// re-derives the next tessera from that record, so completed work is never
/// lost and a tessera is never applied twice to the same durable state.

use std::fmt;

use tracing::{debug, info, trace, warn};

use crate::checkpoint::CheckpointRecord;
use crate::config::TimingModel;
use crate::error::{Result, TesseraError};
use crate::nvm::NvmStore;
use crate::polynomial::{check_range, Polynomial};
use crate::power::{PowerSource, PowerState};
use crate::sim::{Event, EventKind, SimContext};
use crate::tiling::TilePlan;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running(u32),
    Checkpointing(u32),
    Interrupted,
    Resuming,
    Complete,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerState::Idle => write!(f, "IDLE"),
            SchedulerState::Running(t) => write!(f, "RUNNING({})", t),
            SchedulerState::Checkpointing(t) => write!(f, "CHECKPOINTING({})", t),
            SchedulerState::Interrupted => write!(f, "INTERRUPTED"),
            SchedulerState::Resuming => write!(f, "RESUMING"),
            SchedulerState::Complete => write!(f, "COMPLETE"),
        }
    }
}

/// Snapshot for external monitoring
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    /// Index of the last landed checkpoint
    pub progress_index: Option<u32>,
    pub total_tesserae: u32,
}

impl fmt::Display for SchedulerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.progress_index {
            Some(p) => write!(f, "{} | {}/{} tesserae durable", self.state, p + 1, self.total_tesserae),
            None => write!(f, "{} | 0/{} tesserae durable", self.state, self.total_tesserae),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Checkpoint records written
    pub completed_tesserae: u32,
    /// Times the device lost power while it had work to do
    pub power_failures: u32,
    /// Tesserae whose volatile work was discarded mid-flight
    pub lost_tesserae: u32,
    /// Resumes that restored state from a landed checkpoint
    pub restores: u32,
}

pub struct Scheduler {
    ctx: SimContext,
    plan: TilePlan,
    timing: TimingModel,
    store: NvmStore,
    input: Polynomial,
    state: SchedulerState,
    durable_progress: Option<u32>,
    /// Pre-tessera state while running, post-tessera state while checkpointing
    volatile: Option<Vec<u32>>,
    /// Bumped on every interruption; events from an older epoch are stale
    epoch: u64,
    stats: SchedulerStats,
    output: Option<Polynomial>,
}

impl Scheduler {
    /// Creates a scheduler for one transform over `store`
    ///
    /// If `store` already holds a checkpoint (a rebooted device), the first
    /// resume continues from it.
    ///
    /// # Arguments
    /// * `plan` - Tessera decomposition of the transform
    /// * `timing` - Simulated compute and write costs
    /// * `store` - Durable memory; its context is the scheduler's clock
    /// * `input` - Polynomial to transform
    pub fn new(plan: TilePlan, timing: TimingModel, store: NvmStore, input: Polynomial) -> Result<Self> {
        plan.params().check_polynomial(&input)?;
        timing.validate()?;

        Ok(Self {
            ctx: store.context().clone(),
            plan,
            timing,
            store,
            input,
            state: SchedulerState::Idle,
            durable_progress: None,
            volatile: None,
            epoch: 0,
            stats: SchedulerStats::default(),
            output: None,
        })
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            state: self.state,
            progress_index: self.durable_progress,
            total_tesserae: self.plan.total_tesserae(),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn plan(&self) -> &TilePlan {
        &self.plan
    }

    pub fn store(&self) -> &NvmStore {
        &self.store
    }

    /// Mutable store access, used for fault injection between events
    pub fn store_mut(&mut self) -> &mut NvmStore {
        &mut self.store
    }

    pub fn into_store(self) -> NvmStore {
        self.store
    }

    pub fn durable_progress(&self) -> Option<u32> {
        self.durable_progress
    }

    pub fn is_complete(&self) -> bool {
        self.state == SchedulerState::Complete
    }

    /// Transform result, available once the scheduler is complete
    pub fn output(&self) -> Option<&Polynomial> {
        self.output.as_ref()
    }

    /// Leaves `Idle` and begins (or continues) the transform
    pub fn start(&mut self, power: &mut PowerSource) -> Result<()> {
        if self.state != SchedulerState::Idle {
            return Err(TesseraError::InvalidParameters(format!(
                "scheduler can only be started from IDLE, currently {}",
                self.state
            )));
        }
        self.resume(power)
    }

    /// Dispatches one event popped from the simulation queue
    pub fn handle_event(&mut self, event: &Event, power: &mut PowerSource) -> Result<()> {
        match event.kind {
            EventKind::TesseraComputed { tessera, epoch } => {
                if epoch != self.epoch || self.state != SchedulerState::Running(tessera) {
                    trace!(tessera, epoch, "discarding stale compute event");
                    return Ok(());
                }
                self.finish_compute(tessera)
            }
            EventKind::CheckpointLanded { tessera, epoch } => {
                if epoch != self.epoch || self.state != SchedulerState::Checkpointing(tessera) {
                    trace!(tessera, epoch, "discarding stale checkpoint event");
                    return Ok(());
                }
                self.land_checkpoint(tessera, power)
            }
            EventKind::PowerTransition(PowerState::Off) => {
                match self.state {
                    SchedulerState::Running(t) | SchedulerState::Checkpointing(t) => {
                        self.stats.lost_tesserae += 1;
                        self.interrupt(Some(t));
                    }
                    _ => {}
                }
                Ok(())
            }
            EventKind::PowerTransition(PowerState::On) => {
                if self.state == SchedulerState::Interrupted {
                    self.resume(power)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Re-derives the next tessera from NVM and starts it
    fn resume(&mut self, power: &mut PowerSource) -> Result<()> {
        self.state = SchedulerState::Resuming;
        let total = self.plan.total_tesserae();

        let next = match self.store.load_checkpoint()? {
            Some(record) => {
                self.check_record(&record)?;
                let progress = record.progress_index;
                self.durable_progress = Some(progress);
                self.volatile = Some(record.polynomial_state);
                self.stats.restores += 1;
                info!(
                    progress_index = progress,
                    total,
                    at = self.ctx.now(),
                    "restored checkpoint"
                );
                progress + 1
            }
            None => {
                if let Some(durable) = self.durable_progress {
                    return Err(TesseraError::IncompatibleCheckpoint(format!(
                        "store lost the checkpoint for tessera {}",
                        durable
                    )));
                }
                self.volatile = Some(self.plan.initial_state(&self.input)?);
                info!(total, at = self.ctx.now(), "no checkpoint, starting from input");
                0
            }
        };

        if next == total {
            self.finish()
        } else {
            self.begin_tessera(next, power)
        }
    }

    /// Rejects a record that authenticates but does not belong to this plan
    fn check_record(&self, record: &CheckpointRecord) -> Result<()> {
        let params = self.plan.params();
        let total = self.plan.total_tesserae();

        let plan = self.plan.id();
        match self.store.checkpoint_plan() {
            Some(writer) if writer == plan => {}
            Some(writer) => {
                return Err(TesseraError::IncompatibleCheckpoint(format!(
                    "record was written by a {} plan, resuming a {} plan",
                    writer, plan
                )));
            }
            None => {
                return Err(TesseraError::IncompatibleCheckpoint(
                    "record has no directory entry".to_string(),
                ));
            }
        }

        if record.modulus != params.modulus() {
            return Err(TesseraError::IncompatibleCheckpoint(format!(
                "record modulus {} does not match plan modulus {}",
                record.modulus,
                params.modulus()
            )));
        }
        if record.polynomial_state.len() != params.dimension() {
            return Err(TesseraError::IncompatibleCheckpoint(format!(
                "record holds {} coefficients, plan expects {}",
                record.polynomial_state.len(),
                params.dimension()
            )));
        }
        if record.progress_index >= total {
            return Err(TesseraError::IncompatibleCheckpoint(format!(
                "record progress {} exceeds a plan of {} tesserae",
                record.progress_index, total
            )));
        }
        if let Some(durable) = self.durable_progress {
            if durable != record.progress_index {
                return Err(TesseraError::IncompatibleCheckpoint(format!(
                    "record progress {} differs from last landed tessera {}",
                    record.progress_index, durable
                )));
            }
        }

        check_range(&record.polynomial_state, record.modulus, Some(record.progress_index))
    }

    /// Tessera `t` may only run directly on top of tessera `t-1`
    fn ensure_sequence(&self, tessera: u32) -> Result<()> {
        let expected = self.durable_progress.map_or(0, |p| p + 1);
        if tessera != expected {
            return Err(TesseraError::InvalidTesseraSequence {
                tessera,
                durable_progress: self.durable_progress,
            });
        }
        Ok(())
    }

    fn begin_tessera(&mut self, tessera: u32, power: &mut PowerSource) -> Result<()> {
        self.ensure_sequence(tessera)?;

        let now = self.ctx.now();
        if !power.is_on(now)? {
            self.interrupt(None);
            return Ok(());
        }

        self.state = SchedulerState::Running(tessera);
        let cost = self.timing.compute_cost_per_layer * self.plan.layer_fraction();
        self.ctx.schedule_in(
            cost,
            EventKind::TesseraComputed {
                tessera,
                epoch: self.epoch,
            },
        );
        debug!(tessera, at = now, "tessera started");
        Ok(())
    }

    fn finish_compute(&mut self, tessera: u32) -> Result<()> {
        let pre_state = self.volatile.take().ok_or(TesseraError::InvalidTesseraSequence {
            tessera,
            durable_progress: self.durable_progress,
        })?;

        self.volatile = Some(self.plan.apply(tessera, &pre_state)?);
        self.state = SchedulerState::Checkpointing(tessera);
        self.ctx.schedule_in(
            self.timing.checkpoint_cost,
            EventKind::CheckpointLanded {
                tessera,
                epoch: self.epoch,
            },
        );
        debug!(tessera, at = self.ctx.now(), "tessera computed");
        Ok(())
    }

    fn land_checkpoint(&mut self, tessera: u32, power: &mut PowerSource) -> Result<()> {
        self.ensure_sequence(tessera)?;

        let state = self.volatile.take().ok_or(TesseraError::InvalidTesseraSequence {
            tessera,
            durable_progress: self.durable_progress,
        })?;
        let record = CheckpointRecord::new(tessera, state, self.plan.params().modulus());
        let receipt = self.store.write_checkpoint(&record, self.plan.id())?;

        self.durable_progress = Some(tessera);
        self.stats.completed_tesserae += 1;
        self.volatile = Some(record.polynomial_state);
        debug!(
            tessera,
            at = receipt.timestamp,
            hamming_weight = receipt.hamming_weight,
            "checkpoint landed"
        );

        let next = tessera + 1;
        if next == self.plan.total_tesserae() {
            self.finish()
        } else {
            self.begin_tessera(next, power)
        }
    }

    fn finish(&mut self) -> Result<()> {
        let state = self.volatile.take().ok_or(TesseraError::InvalidTesseraSequence {
            tessera: self.plan.total_tesserae(),
            durable_progress: self.durable_progress,
        })?;
        self.output = Some(self.plan.output(&state)?);
        self.state = SchedulerState::Complete;
        info!(
            direction = %self.plan.direction(),
            at = self.ctx.now(),
            restores = self.stats.restores,
            power_failures = self.stats.power_failures,
            "transform complete"
        );
        Ok(())
    }

    /// Power loss: everything not in NVM is gone
    fn interrupt(&mut self, in_flight: Option<u32>) {
        self.volatile = None;
        self.epoch += 1;
        self.stats.power_failures += 1;
        self.state = SchedulerState::Interrupted;
        warn!(
            tessera = ?in_flight,
            durable_progress = ?self.durable_progress,
            at = self.ctx.now(),
            "power lost"
        );
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.state)
            .field("durable_progress", &self.durable_progress)
            .field("epoch", &self.epoch)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntt::{Direction, NttParams};
    use crate::power::{Deterministic, Fixed};
    use crate::tiling::PlanId;
    use std::sync::Arc;

    fn scheduler(ctx: &SimContext, input: Polynomial) -> Scheduler {
        let params = Arc::new(NttParams::new(256, 3329).unwrap());
        let plan = TilePlan::new(params, Direction::Forward, 1).unwrap();
        let store = NvmStore::with_defaults(ctx);
        Scheduler::new(plan, TimingModel::default(), store, input).unwrap()
    }

    /// Minimal event loop: one pending power event at a time
    fn drive(ctx: &SimContext, scheduler: &mut Scheduler, power: &mut PowerSource) -> Result<()> {
        let next = power.next_transition_after(ctx.now())?;
        ctx.schedule_at(next.at, EventKind::PowerTransition(next.state));
        scheduler.start(power)?;

        while !scheduler.is_complete() {
            let event = ctx.pop_next().expect("event queue ran dry");
            if let EventKind::PowerTransition(_) = event.kind {
                let next = power.next_transition_after(event.at)?;
                ctx.schedule_at(next.at, EventKind::PowerTransition(next.state));
            }
            scheduler.handle_event(&event, power)?;
        }
        Ok(())
    }

    #[test]
    fn test_uninterrupted_run_matches_direct_transform() {
        let ctx = SimContext::new();
        let input = Polynomial::ones(256, 3329).unwrap();
        let mut scheduler = scheduler(&ctx, input.clone());
        let mut power = PowerSource::new(&ctx, Fixed::new(1.0e9), Fixed::new(1.0));

        drive(&ctx, &mut scheduler, &mut power).unwrap();

        let expected = scheduler.plan().params().forward(&input).unwrap();
        assert_eq!(scheduler.output(), Some(&expected));
        assert_eq!(scheduler.stats().completed_tesserae, 8);
        assert_eq!(scheduler.stats().power_failures, 0);
        assert_eq!(ctx.now(), 8.0 * 15.0);
        assert_eq!(
            scheduler.status(),
            SchedulerStatus {
                state: SchedulerState::Complete,
                progress_index: Some(7),
                total_tesserae: 8,
            }
        );
    }

    #[test]
    fn test_power_drop_at_every_boundary() {
        // Each tessera takes exactly one 15-unit on interval
        let ctx = SimContext::new();
        let mut scheduler = scheduler(&ctx, Polynomial::ones(256, 3329).unwrap());
        let mut power = PowerSource::new(
            &ctx,
            Deterministic::new(vec![15.0]),
            Deterministic::new(vec![7.0]),
        );

        drive(&ctx, &mut scheduler, &mut power).unwrap();

        let stats = scheduler.stats();
        assert_eq!(stats.completed_tesserae, 8);
        assert_eq!(stats.power_failures, 7);
        assert_eq!(stats.restores, 7);
        assert_eq!(stats.lost_tesserae, 0);
        assert_eq!(ctx.now(), 15.0 + 7.0 * 22.0);

        let trace = scheduler.store().trace();
        let progress: Vec<Option<u32>> = trace.iter().map(|s| s.progress_index).collect();
        assert_eq!(progress, (0..8).map(Some).collect::<Vec<_>>());
    }

    #[test]
    fn test_mid_tessera_loss_is_recomputed() {
        let ctx = SimContext::new();
        let input = Polynomial::ones(256, 3329).unwrap();
        let mut scheduler = scheduler(&ctx, input.clone());
        let mut power = PowerSource::new(
            &ctx,
            Deterministic::new(vec![20.0]),
            Deterministic::new(vec![5.0]),
        );

        drive(&ctx, &mut scheduler, &mut power).unwrap();

        let stats = scheduler.stats();
        assert_eq!(stats.lost_tesserae, 7);
        assert_eq!(stats.completed_tesserae, 8);
        assert_eq!(scheduler.store().trace().len(), 8);

        let expected = scheduler.plan().params().forward(&input).unwrap();
        assert_eq!(scheduler.output(), Some(&expected));
    }

    #[test]
    fn test_out_of_order_tessera_is_rejected() {
        let ctx = SimContext::new();
        let mut scheduler = scheduler(&ctx, Polynomial::ones(256, 3329).unwrap());
        assert!(scheduler.ensure_sequence(0).is_ok());

        let mut power = PowerSource::new(&ctx, Fixed::new(1.0e9), Fixed::new(1.0));
        assert!(matches!(
            scheduler.begin_tessera(2, &mut power),
            Err(TesseraError::InvalidTesseraSequence {
                tessera: 2,
                durable_progress: None
            })
        ));

        scheduler.durable_progress = Some(3);
        assert!(matches!(
            scheduler.ensure_sequence(3),
            Err(TesseraError::InvalidTesseraSequence { tessera: 3, .. })
        ));
        assert!(scheduler.ensure_sequence(4).is_ok());
    }

    #[test]
    fn test_corrupt_checkpoint_halts_resume() {
        let ctx = SimContext::new();
        let mut scheduler = scheduler(&ctx, Polynomial::ones(256, 3329).unwrap());
        let mut power = PowerSource::new(&ctx, Fixed::new(20.0), Fixed::new(10.0));

        let next = power.next_transition_after(0.0).unwrap();
        ctx.schedule_at(next.at, EventKind::PowerTransition(next.state));
        scheduler.start(&mut power).unwrap();

        // Run until the power drops after tessera 0 landed
        while scheduler.state() != SchedulerState::Interrupted {
            let event = ctx.pop_next().unwrap();
            scheduler.handle_event(&event, &mut power).unwrap();
        }
        assert_eq!(scheduler.durable_progress(), Some(0));

        let extent = scheduler.store().checkpoint_extent().unwrap();
        scheduler.store_mut().corrupt(extent.end - 1, 0x01).unwrap();

        ctx.advance_to(30.0);
        let on = Event {
            at: 30.0,
            sequence: u64::MAX,
            kind: EventKind::PowerTransition(PowerState::On),
        };
        assert!(matches!(
            scheduler.handle_event(&on, &mut power),
            Err(TesseraError::CorruptCheckpoint {
                stored_progress: Some(0),
                ..
            })
        ));
    }

    #[test]
    fn test_foreign_checkpoint_is_incompatible() {
        let ctx = SimContext::new();
        let mut scheduler = scheduler(&ctx, Polynomial::ones(256, 3329).unwrap());
        let plan = scheduler.plan().id();
        scheduler
            .store_mut()
            .write_checkpoint(&CheckpointRecord::new(2, vec![1; 256], 7681), plan)
            .unwrap();

        let mut power = PowerSource::new(&ctx, Fixed::new(1.0e9), Fixed::new(1.0));
        assert!(matches!(
            scheduler.start(&mut power),
            Err(TesseraError::IncompatibleCheckpoint(_))
        ));
    }

    #[test]
    fn test_checkpoint_from_another_plan_is_incompatible() {
        let ctx = SimContext::new();
        let mut scheduler = scheduler(&ctx, Polynomial::ones(256, 3329).unwrap());

        // Same shape and modulus, but written by an inverse plan with 2 tiles
        let other = PlanId {
            direction: Direction::Inverse,
            tiles_per_layer: 2,
        };
        scheduler
            .store_mut()
            .write_checkpoint(&CheckpointRecord::new(2, vec![1; 256], 3329), other)
            .unwrap();

        let mut power = PowerSource::new(&ctx, Fixed::new(1.0e9), Fixed::new(1.0));
        match scheduler.start(&mut power) {
            Err(TesseraError::IncompatibleCheckpoint(reason)) => {
                assert!(reason.contains("inverse"));
            }
            other => panic!("expected IncompatibleCheckpoint, got {other:?}"),
        }
        assert_eq!(scheduler.stats().restores, 0);
        assert_eq!(scheduler.durable_progress(), None);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let ctx = SimContext::new();
        let mut scheduler = scheduler(&ctx, Polynomial::ones(256, 3329).unwrap());
        let mut power = PowerSource::new(&ctx, Fixed::new(1.0e9), Fixed::new(1.0));
        scheduler.start(&mut power).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running(0));
        assert!(scheduler.start(&mut power).is_err());
    }
}
