//! Scripted backend: trap delivery is replayed from a script instead of real
//! interrupt hardware, so the controller's protocol can be exercised (and
//! abused) deterministically. Timestamps advance monotonically with the
//! scripted cycle counts.

use std::collections::VecDeque;

use step_utils::pagetable::{execute_disabled, mark_accessed, PageTableLevel};
use trap_source::{
    SetupError, SteppingBackend, TrapFrame, TrapOutcome, WatchedEntry, PAGE_FAULT_VECTOR,
};

const MONITORED_BASE: u64 = 0x40_1000;
const USER_CS: u16 = 0x33;
const FLAGS_IF_SET: u64 = 0x202;
const FLAGS_IF_CLEAR: u64 = 0x2;

/// Entry backed by a plain cell. Restores (execute-disable cleared) are
/// counted so tests can check the restoration discipline.
#[derive(Debug)]
pub struct SimEntry {
    raw: u64,
    restore_count: u64,
}

impl SimEntry {
    fn present_executable() -> SimEntry {
        SimEntry {
            raw: MONITORED_BASE | 1,
            restore_count: 0,
        }
    }
}

impl WatchedEntry for SimEntry {
    fn raw(&self) -> u64 {
        self.raw
    }

    fn set_raw(&mut self, value: u64) {
        if execute_disabled(self.raw) && !execute_disabled(value) {
            self.restore_count += 1;
        }
        self.raw = value;
    }
}

/// How the monitored context behaves for one arm/resume cycle.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ScriptStep {
    /// Instruction-pointer advance before the trap is delivered.
    pub advance: u64,
    /// Cycles attributed to the resume-to-trap window.
    pub cycles: u64,
    /// Whether the monitored fetch set the watched accessed bit.
    pub set_accessed: bool,
    /// Vector delivered; `None` means the configured interrupt vector.
    pub vector: Option<u8>,
    /// Saved RFLAGS placed in the frame.
    pub flags: u64,
    /// Deliver only after `resume_monitored` reports completion (an
    /// interrupt still in flight).
    pub late: bool,
}

impl Default for ScriptStep {
    fn default() -> Self {
        ScriptStep {
            advance: 1,
            cycles: 7000,
            set_accessed: true,
            vector: None,
            flags: FLAGS_IF_SET,
            late: false,
        }
    }
}

impl ScriptStep {
    pub fn good() -> Self {
        Default::default()
    }

    pub fn with_cycles(cycles: u64) -> Self {
        ScriptStep {
            cycles,
            ..Default::default()
        }
    }

    /// The interrupt arrived before any monitored instruction retired.
    pub fn zero_step() -> Self {
        ScriptStep {
            advance: 0,
            set_accessed: false,
            ..Default::default()
        }
    }

    pub fn fault() -> Self {
        ScriptStep {
            vector: Some(PAGE_FAULT_VECTOR),
            ..Default::default()
        }
    }

    pub fn fault_zero_step() -> Self {
        ScriptStep {
            advance: 0,
            set_accessed: false,
            vector: Some(PAGE_FAULT_VECTOR),
            ..Default::default()
        }
    }

    pub fn foreign(vector: u8) -> Self {
        ScriptStep {
            vector: Some(vector),
            ..Default::default()
        }
    }

    pub fn late() -> Self {
        ScriptStep {
            late: true,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub struct SimBackend {
    script: VecDeque<ScriptStep>,
    pte: Option<SimEntry>,
    pmd: Option<SimEntry>,
    handler_vector: Option<u8>,
    oneshot_vector: Option<u8>,
    default_vector: u8,
    pending_soft_irq: Option<u8>,
    timer_armed: bool,
    timer_disarm_calls: u32,
    late_frame: Option<TrapFrame>,
    rip: u64,
    tsc: u64,
    flags: u64,
    // restoration-discipline bookkeeping
    last_delivered_fault: bool,
    restores_at_last_fault: u64,
    fault_without_restore: u32,
    pub fail_handler_install: bool,
    pub fail_timer_setup: bool,
}

impl SimBackend {
    pub fn new(script: Vec<ScriptStep>) -> SimBackend {
        SimBackend {
            script: script.into(),
            pte: None,
            pmd: None,
            handler_vector: None,
            oneshot_vector: None,
            default_vector: 45,
            pending_soft_irq: None,
            timer_armed: false,
            timer_disarm_calls: 0,
            late_frame: None,
            rip: MONITORED_BASE,
            tsc: 1000,
            flags: FLAGS_IF_SET,
            last_delivered_fault: false,
            restores_at_last_fault: 0,
            fault_without_restore: 0,
            fail_handler_install: false,
            fail_timer_setup: false,
        }
    }

    /// Pretend the controller runs with interrupts masked (a privileged
    /// trap-gate context).
    pub fn mask_interrupts(&mut self) {
        self.flags = FLAGS_IF_CLEAR;
    }

    pub fn script_remaining(&self) -> usize {
        self.script.len()
    }

    pub fn handler_vector(&self) -> Option<u8> {
        self.handler_vector
    }

    pub fn oneshot_vector(&self) -> Option<u8> {
        self.oneshot_vector
    }

    pub fn timer_disarm_calls(&self) -> u32 {
        self.timer_disarm_calls
    }

    /// Faults delivered twice without an intervening restore of the watched
    /// page. Any non-zero value is a controller bug.
    pub fn fault_without_restore(&self) -> u32 {
        self.fault_without_restore
    }

    fn armed_any(&self) -> bool {
        self.pending_soft_irq.is_some()
            || self.timer_armed
            || self
                .pte
                .as_ref()
                .map(|pte| execute_disabled(pte.raw))
                .unwrap_or(false)
    }
}

impl SteppingBackend for SimBackend {
    fn install_irq_handler(&mut self, vector: u8) -> Result<(), SetupError> {
        if self.fail_handler_install {
            return Err(SetupError::HandlerInstall(vector));
        }
        self.handler_vector = Some(vector);
        Ok(())
    }

    fn watch_entry(
        &mut self,
        virtual_address: u64,
        level: PageTableLevel,
    ) -> Result<(), SetupError> {
        match level {
            PageTableLevel::Pte => self.pte = Some(SimEntry::present_executable()),
            PageTableLevel::Pmd => self.pmd = Some(SimEntry::present_executable()),
            _ => return Err(SetupError::EntryNotPresent(virtual_address)),
        }
        Ok(())
    }

    fn entry(&mut self, level: PageTableLevel) -> Option<&mut dyn WatchedEntry> {
        match level {
            PageTableLevel::Pte => self.pte.as_mut().map(|pte| pte as &mut dyn WatchedEntry),
            PageTableLevel::Pmd => self.pmd.as_mut().map(|pmd| pmd as &mut dyn WatchedEntry),
            _ => None,
        }
    }

    fn timer_oneshot_setup(&mut self, vector: u8) -> Result<(), SetupError> {
        if self.fail_timer_setup {
            return Err(SetupError::TimerProgramming);
        }
        self.oneshot_vector = Some(vector);
        Ok(())
    }

    fn timer_arm_after(&mut self, _ticks: u32) {
        self.timer_armed = true;
    }

    fn timer_disarm(&mut self) {
        self.timer_armed = false;
        self.timer_disarm_calls += 1;
    }

    fn raise_irq(&mut self, vector: u8) {
        self.pending_soft_irq = Some(vector);
    }

    fn monitored_entry_address(&self) -> u64 {
        MONITORED_BASE
    }

    fn current_privilege(&self) -> u8 {
        3
    }

    fn read_flags(&self) -> u64 {
        self.flags
    }

    fn irq_pending(&self) -> bool {
        self.late_frame.is_some()
    }

    fn take_late_frame(&mut self) -> Option<TrapFrame> {
        self.late_frame.take()
    }

    fn resume_monitored(&mut self) -> TrapOutcome {
        if !self.armed_any() {
            return TrapOutcome::Completed;
        }
        let step = match self.script.pop_front() {
            Some(step) => step,
            None => return TrapOutcome::Completed,
        };
        // one event per arm
        self.pending_soft_irq = None;
        self.timer_armed = false;

        self.rip = self.rip.wrapping_add(step.advance);
        self.tsc += step.cycles;
        if step.set_accessed {
            if let Some(pte) = &mut self.pte {
                pte.raw = mark_accessed(pte.raw);
            }
        }

        let vector = step.vector.unwrap_or(self.default_vector);
        if vector == PAGE_FAULT_VECTOR {
            let restores = self
                .pte
                .as_ref()
                .map(|pte| pte.restore_count)
                .unwrap_or(0);
            if self.last_delivered_fault && restores == self.restores_at_last_fault {
                self.fault_without_restore += 1;
            }
            self.restores_at_last_fault = restores;
            self.last_delivered_fault = true;
        } else {
            self.last_delivered_fault = false;
        }

        let frame = TrapFrame {
            vector,
            cs: USER_CS,
            flags: step.flags,
            resume_address: self.rip,
            tsc_aex: self.tsc,
        };
        if step.late {
            self.late_frame = Some(frame);
            TrapOutcome::Completed
        } else {
            TrapOutcome::Trapped(frame)
        }
    }

    fn timestamp(&mut self) -> u64 {
        self.tsc += 25;
        self.tsc
    }
}
