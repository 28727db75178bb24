#![deny(unsafe_op_in_unsafe_fn)]

// SPDX-FileCopyrightText: 2021 Guillaume DIDIER
//
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

// Interrupt/fault driven single-stepping of a monitored code region.
//
// The controller owns the arm -> resume -> fire -> record -> decide cycle:
// it arms exactly one future interruption, hands control to the monitored
// context through the backend, turns the hardware-saved frame into a
// StepEvent, and then either re-arms or ends the run. Runaway conditions
// (interrupt storms, fault loops) are bounded rather than crashed on.

pub mod recorder;
pub mod sim;

use busy_wait::{spin_until, SpinKind};
use step_utils::pagetable::{interrupts_enabled, PageTableLevel};
use trap_source::{
    SetupError, SteppingBackend, SteppingError, TrapFrame, TrapKind, TrapOutcome, WatchedEntry,
    PAGE_FAULT_VECTOR,
};

pub use crate::recorder::{EvidenceRecorder, StepEvent};

/// Default vector for self-raised and timer interrupts.
pub const IRQ_VECTOR: u8 = 45;

/// Default timer interval, in timer-device ticks. Platform tuning parameter.
pub const TIMER_INTERVAL_TICKS: u32 = 19;

/// Abort ceiling multiplier: the run is declared stormy once the source has
/// fired this many times per requested step.
pub const STORM_MULTIPLIER: u64 = 500;

/// Bound on consecutive no-progress fault recoveries.
pub const MAX_FAULT_RECOVERIES: u32 = 10;

const SPIN_LIMIT: u64 = 1 << 20;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum Verbosity {
    NoOutput,
    PerStep,
    Debug,
}

#[derive(Debug, Clone, Copy)]
pub struct StepperConfig {
    pub irq_vector: u8,
    pub timer_interval_ticks: u32,
    pub storm_multiplier: u64,
    pub max_fault_recoveries: u32,
    pub spin_kind: SpinKind,
    pub verbosity: Verbosity,
}

impl Default for StepperConfig {
    fn default() -> Self {
        StepperConfig {
            irq_vector: IRQ_VECTOR,
            timer_interval_ticks: TIMER_INTERVAL_TICKS,
            storm_multiplier: STORM_MULTIPLIER,
            max_fault_recoveries: MAX_FAULT_RECOVERIES,
            spin_kind: SpinKind::High,
            verbosity: Verbosity::NoOutput,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RunPhase {
    Idle,
    Armed,
    Fired,
    Stopped,
    Aborted,
    TornDown,
}

/// Mutable state of one stepping session. Owned by the controller; the
/// monitored context never touches it.
#[derive(Debug, Clone)]
pub struct RunState {
    pub phase: RunPhase,
    pub fired_count: u64,
    pub good_steps: usize,
    pub zero_steps: u64,
    pub cycles_total: u64,
    pub expected_threshold: u64,
    pub armed: bool,
    pub do_step: bool,
    pub fault_recoveries: u32,
    pub aborted: bool,
    flags_at_arm: u64,
}

impl RunState {
    fn new(expected_threshold: u64) -> RunState {
        RunState {
            phase: RunPhase::Idle,
            fired_count: 0,
            good_steps: 0,
            zero_steps: 0,
            cycles_total: 0,
            expected_threshold,
            armed: false,
            do_step: true,
            fault_recoveries: 0,
            aborted: false,
            flags_at_arm: 0,
        }
    }
}

/// What the controller decided after one event.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StepDecision {
    Rearm,
    Stop,
    Abort,
}

/// Aggregate counters of a finished run.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RunReport {
    pub requested: usize,
    pub fired: u64,
    pub good_steps: usize,
    pub zero_steps: u64,
    pub cycles_total: u64,
    pub aborted: bool,
}

impl RunReport {
    /// Fraction of fires that were real steps. Zero-steps are counted but
    /// filtered out of yield statistics.
    pub fn step_yield(&self) -> f64 {
        if self.fired == 0 {
            0.0
        } else {
            self.good_steps as f64 / self.fired as f64
        }
    }

    pub fn mean_cycles(&self) -> f64 {
        if self.good_steps == 0 {
            0.0
        } else {
            self.cycles_total as f64 / self.good_steps as f64
        }
    }

    pub fn csv(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.requested,
            self.fired,
            self.good_steps,
            self.zero_steps,
            self.aborted,
            self.mean_cycles()
        )
    }

    pub fn csv_header() -> String {
        format!("requested,fired,good_steps,zero_steps,aborted,mean_cycles")
    }
}

#[derive(Debug)]
pub struct StepController<B: SteppingBackend> {
    backend: B,
    config: StepperConfig,
    source: TrapKind,
    step_budget: usize,
    recorder: EvidenceRecorder,
    state: RunState,
    report: Option<RunReport>,
}

impl<B: SteppingBackend> StepController<B> {
    pub fn new(backend: B, config: StepperConfig) -> Self {
        StepController {
            backend,
            config,
            source: TrapKind::Software,
            step_budget: 0,
            recorder: EvidenceRecorder::new(),
            state: RunState::new(0),
            report: None,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn recorded_events(&self) -> u64 {
        self.recorder.recorded()
    }

    /// Configures the source and budget and performs backend setup. The
    /// monitored context must not be executing; affinity pinning is the
    /// caller's job.
    pub fn begin_run(&mut self, source: TrapKind, step_budget: usize) -> Result<(), SetupError> {
        self.source = source;
        self.step_budget = step_budget;
        self.state = RunState::new(step_budget as u64 * self.config.storm_multiplier);
        self.recorder = EvidenceRecorder::new();
        self.report = None;

        let code = self.backend.monitored_entry_address();
        match source {
            TrapKind::Software => {
                self.backend.install_irq_handler(self.config.irq_vector)?;
            }
            TrapKind::Timer => {
                self.backend.install_irq_handler(self.config.irq_vector)?;
                self.backend.watch_entry(code, PageTableLevel::Pte)?;
                self.backend.watch_entry(code, PageTableLevel::Pmd)?;
                self.backend.timer_oneshot_setup(self.config.irq_vector)?;
            }
            TrapKind::Fault => {
                self.backend.install_irq_handler(PAGE_FAULT_VECTOR)?;
                self.backend.watch_entry(code, PageTableLevel::Pte)?;
            }
        }
        if source != TrapKind::Software {
            let pte = self
                .backend
                .entry(PageTableLevel::Pte)
                .ok_or(SetupError::NoWatchedEntry(PageTableLevel::Pte))?;
            if !pte.present() {
                return Err(SetupError::EntryNotPresent(code));
            }
        }
        if self.config.verbosity >= Verbosity::Debug {
            println!(
                "single-stepping: source={:?}; budget={}; threshold={}",
                source, step_budget, self.state.expected_threshold
            );
        }
        Ok(())
    }

    /// Prepares exactly one future interruption.
    pub fn arm_next_step(&mut self) -> Result<(), SteppingError> {
        debug_assert!(!self.state.armed, "at most one arm outstanding");
        self.state.flags_at_arm = self.backend.read_flags();
        match self.source {
            TrapKind::Software => {
                self.backend.raise_irq(self.config.irq_vector);
            }
            TrapKind::Timer => {
                // Clearing the higher-level accessed bit slows the privileged
                // resume just enough for the interrupt to land on the first
                // monitored instruction.
                if let Some(pmd) = self.backend.entry(PageTableLevel::Pmd) {
                    pmd.clear_accessed();
                }
                self.backend.timer_arm_after(self.config.timer_interval_ticks);
            }
            TrapKind::Fault => {
                let pte = self
                    .backend
                    .entry(PageTableLevel::Pte)
                    .ok_or(SetupError::NoWatchedEntry(PageTableLevel::Pte))?;
                pte.mark_execute_disable();
            }
        }
        self.state.armed = true;
        self.state.phase = RunPhase::Armed;
        Ok(())
    }

    /// One resume/trap cycle. `None` means the monitored region completed
    /// with no trap in flight.
    pub fn step(&mut self) -> Result<Option<(StepEvent, StepDecision)>, SteppingError> {
        let tsc_begin = self.backend.timestamp();
        let privilege_before = self.backend.current_privilege();
        let frame = match self.backend.resume_monitored() {
            TrapOutcome::Trapped(frame) => frame,
            TrapOutcome::Completed => match self.wait_late_fire() {
                Some(frame) => frame,
                None => {
                    self.state.armed = false;
                    self.state.do_step = false;
                    return Ok(None);
                }
            },
        };
        self.check_vector(&frame)?;
        if frame.vector == PAGE_FAULT_VECTOR {
            self.state.fault_recoveries += 1;
            if self.state.fault_recoveries > self.config.max_fault_recoveries {
                return Err(SteppingError::FaultLoopExceeded {
                    recoveries: self.state.fault_recoveries,
                });
            }
        }
        // Evidence capture is sequenced strictly before the restore in
        // on_event, so the accessed bit still reflects this step.
        let access_bit = self
            .backend
            .entry(PageTableLevel::Pte)
            .map(|pte| pte.accessed());
        let event = self
            .recorder
            .record(self.source, &frame, privilege_before, tsc_begin, access_bit);
        let decision = self.on_event(&event)?;
        Ok(Some((event, decision)))
    }

    /// Core decision point, also usable as an injection point for synthetic
    /// events from a test harness.
    pub fn on_event(&mut self, event: &StepEvent) -> Result<StepDecision, SteppingError> {
        self.state.phase = RunPhase::Fired;
        self.state.armed = false;
        self.state.fired_count += 1;

        // Restore the watched code page before the monitored context can run
        // past it again, and clear its accessed bit so the next event's
        // evidence reflects only the next instruction.
        if let Some(pte) = self.backend.entry(PageTableLevel::Pte) {
            pte.mark_executable();
            pte.clear_accessed();
        }

        if event.access_observed {
            self.state.good_steps += 1;
            self.state.cycles_total += event.cycles_elapsed;
            self.state.fault_recoveries = 0;
        } else {
            self.state.zero_steps += 1;
        }

        if self.config.verbosity >= Verbosity::PerStep {
            println!(
                "^^ rip={:#x}; accessed={}; cycles={}; count={:02}",
                event.resume_address,
                event.access_observed as u8,
                event.cycles_elapsed,
                self.state.fired_count
            );
        }

        if self.state.fired_count > self.state.expected_threshold {
            println!(
                "excessive interrupt rate detected (try adjusting the timer \
                 interval to avoid getting stuck in zero-stepping); aborting..."
            );
            self.state.do_step = false;
            self.state.aborted = true;
            self.state.phase = RunPhase::Aborted;
            self.disarm();
            return Ok(StepDecision::Abort);
        }

        if self.state.good_steps >= self.step_budget {
            self.state.do_step = false;
            self.state.phase = RunPhase::Stopped;
            self.disarm();
            return Ok(StepDecision::Stop);
        }

        self.arm_next_step()?;
        Ok(StepDecision::Rearm)
    }

    /// Disarms pending traps, restores watched entries and returns the final
    /// counters. Calling it again returns the same report with no further
    /// hardware effects.
    pub fn end_run(&mut self) -> RunReport {
        if let Some(report) = &self.report {
            return report.clone();
        }
        self.disarm();
        self.state.do_step = false;
        self.state.phase = RunPhase::TornDown;
        let report = RunReport {
            requested: self.step_budget,
            fired: self.state.fired_count,
            good_steps: self.state.good_steps,
            zero_steps: self.state.zero_steps,
            cycles_total: self.state.cycles_total,
            aborted: self.state.aborted,
        };
        self.report = Some(report.clone());
        if self.config.verbosity >= Verbosity::PerStep {
            println!(
                "all done; counted {}/{} events ({} zero-steps)",
                report.fired, report.requested, report.zero_steps
            );
        }
        report
    }

    /// Full run: setup, stepping loop, teardown. Fatal errors still tear the
    /// run down (entries restored) before propagating.
    pub fn run(&mut self, source: TrapKind, step_budget: usize) -> Result<RunReport, SteppingError> {
        self.begin_run(source, step_budget)?;
        match self.drive() {
            Ok(()) => Ok(self.end_run()),
            Err(e) => {
                let _ = self.end_run();
                Err(e)
            }
        }
    }

    fn drive(&mut self) -> Result<(), SteppingError> {
        if self.step_budget == 0 {
            return Ok(());
        }
        self.arm_next_step()?;
        while self.state.do_step && self.state.armed {
            if self.step()?.is_none() {
                break;
            }
        }
        Ok(())
    }

    fn check_vector(&mut self, frame: &TrapFrame) -> Result<(), SteppingError> {
        if frame.vector == self.config.irq_vector && self.source != TrapKind::Fault {
            return Ok(());
        }
        if frame.vector == PAGE_FAULT_VECTOR && self.source == TrapKind::Fault {
            // A fault while the watched page is executable did not come from
            // our marking; restoration state is no longer trustworthy.
            let armed_fault = self
                .backend
                .entry(PageTableLevel::Pte)
                .map(|pte| pte.execute_disabled())
                .unwrap_or(false);
            if armed_fault {
                return Ok(());
            }
        }
        Err(SteppingError::UnexpectedTrap {
            vector: frame.vector,
            resume_address: frame.resume_address,
        })
    }

    fn wait_late_fire(&mut self) -> Option<TrapFrame> {
        if self.source != TrapKind::Timer || !self.state.armed {
            return None;
        }
        // With interrupts masked at arm time the fire is deferred to the
        // privileged resume path; spinning on it here would deadlock.
        if interrupts_enabled(self.state.flags_at_arm) {
            let backend = &self.backend;
            let kind = self.config.spin_kind;
            spin_until(|| backend.irq_pending(), kind, SPIN_LIMIT);
        }
        self.backend.take_late_frame()
    }

    fn disarm(&mut self) {
        if self.source == TrapKind::Timer {
            self.backend.timer_disarm();
        }
        if let Some(pte) = self.backend.entry(PageTableLevel::Pte) {
            if pte.execute_disabled() {
                pte.mark_executable();
            }
        }
        self.state.armed = false;
    }
}

#[cfg(test)]
mod tests {
    use crate::sim::{ScriptStep, SimBackend};
    use crate::{RunPhase, StepController, StepDecision, StepEvent, StepperConfig};
    use step_utils::pagetable::PageTableLevel;
    use trap_source::{SetupError, SteppingBackend, SteppingError, TrapKind, WatchedEntry};

    fn controller(script: Vec<ScriptStep>) -> StepController<SimBackend> {
        StepController::new(SimBackend::new(script), StepperConfig::default())
    }

    #[test]
    fn software_source_exact_budget() {
        let mut c = controller(vec![ScriptStep::good(); 100]);
        let report = c.run(TrapKind::Software, 100).unwrap();
        assert_eq!(report.requested, 100);
        assert_eq!(report.fired, 100);
        assert_eq!(report.good_steps, 100);
        assert_eq!(report.zero_steps, 0);
        assert!(!report.aborted);
        assert_eq!(c.recorded_events(), 100);
        assert_eq!(c.state().phase, RunPhase::TornDown);
    }

    #[test]
    fn software_sequence_numbers_gapless() {
        let mut c = controller(vec![ScriptStep::good(); 20]);
        c.begin_run(TrapKind::Software, 20).unwrap();
        c.arm_next_step().unwrap();
        let mut events = Vec::new();
        while c.state().do_step && c.state().armed {
            match c.step().unwrap() {
                Some((event, _)) => events.push(event),
                None => break,
            }
        }
        let report = c.end_run();
        assert_eq!(events.len(), 20);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.sequence_number, i as u64);
            assert_eq!(event.source, TrapKind::Software);
        }
        // no event dropped or double-counted
        assert_eq!(report.fired, c.recorded_events());
    }

    #[test]
    fn storm_guard_aborts_instead_of_spinning() {
        let mut config = StepperConfig::default();
        config.storm_multiplier = 50;
        let mut c = StepController::new(SimBackend::new(vec![ScriptStep::zero_step(); 60]), config);
        let report = c.run(TrapKind::Timer, 1).unwrap();
        assert!(report.aborted);
        assert_eq!(report.fired, 51);
        assert_eq!(report.good_steps, 0);
        assert_eq!(report.zero_steps, 51);
        // arming stopped after the 51st fire
        assert_eq!(c.backend().script_remaining(), 9);
        assert!(c.backend().timer_disarm_calls() >= 1);
        let pte = c.backend_mut().entry(PageTableLevel::Pte).unwrap();
        assert!(!pte.execute_disabled());
    }

    #[test]
    fn fault_zero_steps_counted_but_filtered() {
        let script = vec![
            ScriptStep::fault(),
            ScriptStep::fault_zero_step(),
            ScriptStep::fault(),
            ScriptStep::fault(),
        ];
        let mut c = controller(script);
        c.begin_run(TrapKind::Fault, 3).unwrap();
        c.arm_next_step().unwrap();
        let mut events = Vec::new();
        while c.state().do_step && c.state().armed {
            match c.step().unwrap() {
                Some((event, _)) => events.push(event),
                None => break,
            }
        }
        let report = c.end_run();
        assert_eq!(report.fired, 4);
        assert_eq!(report.good_steps, 3);
        assert_eq!(report.zero_steps, 1);
        assert!(!events[1].access_observed);
        assert_eq!(events[1].resume_address, events[0].resume_address);
        // every fault was preceded by a restore
        assert_eq!(c.backend().fault_without_restore(), 0);
    }

    #[test]
    fn fault_loop_guard_is_fatal() {
        let mut c = controller(vec![ScriptStep::fault_zero_step(); 12]);
        let err = c.run(TrapKind::Fault, 1).unwrap_err();
        match err {
            SteppingError::FaultLoopExceeded { recoveries } => assert_eq!(recoveries, 11),
            other => panic!("unexpected error: {:?}", other),
        }
        // teardown still ran
        assert_eq!(c.state().phase, RunPhase::TornDown);
        let pte = c.backend_mut().entry(PageTableLevel::Pte).unwrap();
        assert!(!pte.execute_disabled());
    }

    #[test]
    fn foreign_fault_is_unexpected() {
        let mut c = controller(vec![ScriptStep::good(), ScriptStep::foreign(14)]);
        let err = c.run(TrapKind::Timer, 5).unwrap_err();
        match err {
            SteppingError::UnexpectedTrap { vector, .. } => assert_eq!(vector, 14),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn foreign_vector_under_fault_source() {
        let mut c = controller(vec![ScriptStep::foreign(13)]);
        let err = c.run(TrapKind::Fault, 1).unwrap_err();
        match err {
            SteppingError::UnexpectedTrap { vector, .. } => assert_eq!(vector, 13),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn end_run_is_idempotent() {
        let mut c = controller(vec![ScriptStep::good(); 2]);
        let report = c.run(TrapKind::Timer, 2).unwrap();
        let first = c.end_run();
        let disarms = c.backend().timer_disarm_calls();
        let second = c.end_run();
        assert_eq!(report, first);
        assert_eq!(first, second);
        assert_eq!(disarms, c.backend().timer_disarm_calls());
    }

    #[test]
    fn late_timer_fire_is_collected() {
        let mut c = controller(vec![ScriptStep::late(), ScriptStep::good()]);
        let report = c.run(TrapKind::Timer, 2).unwrap();
        assert_eq!(report.fired, 2);
        assert_eq!(report.good_steps, 2);
    }

    #[test]
    fn masked_interrupts_defer_the_spin() {
        let mut backend = SimBackend::new(vec![ScriptStep::late()]);
        backend.mask_interrupts();
        let mut c = StepController::new(backend, StepperConfig::default());
        let report = c.run(TrapKind::Timer, 1).unwrap();
        assert_eq!(report.fired, 1);
        assert_eq!(report.good_steps, 1);
    }

    #[test]
    fn synthetic_events_reach_the_decision_point() {
        let mut c = controller(Vec::new());
        c.begin_run(TrapKind::Software, 2).unwrap();
        let event = |sequence_number: u64| StepEvent {
            source: TrapKind::Software,
            privilege_before: 3,
            privilege_after: 3,
            flags_snapshot: 0x202,
            cycles_elapsed: 5000,
            resume_address: 0x40_1000 + sequence_number,
            access_observed: true,
            sequence_number,
        };
        assert_eq!(c.on_event(&event(0)).unwrap(), StepDecision::Rearm);
        assert_eq!(c.on_event(&event(1)).unwrap(), StepDecision::Stop);
        assert_eq!(c.state().fired_count, 2);
        assert_eq!(c.state().good_steps, 2);
    }

    #[test]
    fn handler_install_failure_is_fatal_before_stepping() {
        let mut backend = SimBackend::new(Vec::new());
        backend.fail_handler_install = true;
        let mut c = StepController::new(backend, StepperConfig::default());
        let err = c.run(TrapKind::Software, 1).unwrap_err();
        match err {
            SteppingError::Setup(SetupError::HandlerInstall(vector)) => assert_eq!(vector, 45),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(c.state().fired_count, 0);
    }

    #[test]
    fn zero_budget_run_is_a_no_op() {
        let mut c = controller(Vec::new());
        let report = c.run(TrapKind::Software, 0).unwrap();
        assert_eq!(report.fired, 0);
        assert_eq!(report.requested, 0);
        assert_eq!(c.recorded_events(), 0);
    }
}
