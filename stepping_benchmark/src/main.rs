#![deny(unsafe_op_in_unsafe_fn)]

use nix::sched::{sched_getaffinity, CpuSet};
use nix::unistd::Pid;
use rand::{thread_rng, Rng};

use single_stepping::sim::{ScriptStep, SimBackend};
use single_stepping::{RunReport, StepController, StepperConfig, Verbosity};
use step_utils::rdtsc_fence;
use trap_source::{pin_to_core, restore_affinity, TrapKind};

const NUM_STEPS: usize = 100;

const NUM_ITER: usize = 4;

const ZERO_STEP_RATE: f64 = 0.15;

/// Builds a monitored-context script with jittered per-step latencies and a
/// sprinkling of zero-steps, with exactly `num_steps` real steps.
fn script_for(source: TrapKind, num_steps: usize, zero_step_rate: f64) -> Vec<ScriptStep> {
    let mut rng = thread_rng();
    let mut script = Vec::new();
    let mut good = 0;
    while good < num_steps {
        let zero = rng.gen_bool(zero_step_rate);
        let step = match (source, zero) {
            (TrapKind::Fault, false) => ScriptStep {
                cycles: rng.gen_range(5_000..9_000),
                ..ScriptStep::fault()
            },
            (TrapKind::Fault, true) => ScriptStep::fault_zero_step(),
            (_, false) => ScriptStep::with_cycles(rng.gen_range(5_000..9_000)),
            (_, true) => ScriptStep::zero_step(),
        };
        if !zero {
            good += 1;
        }
        script.push(step);
    }
    script
}

fn run_source(name: &str, source: TrapKind, num_steps: usize, zero_step_rate: f64) -> RunReport {
    let script = script_for(source, num_steps, zero_step_rate);
    let mut config = StepperConfig::default();
    config.verbosity = Verbosity::NoOutput;
    let mut controller = StepController::new(SimBackend::new(script), config);

    let start = unsafe { rdtsc_fence() };
    let report = match controller.run(source, num_steps) {
        Ok(report) => report,
        Err(e) => {
            panic!("{:?}", e);
        }
    };
    let stop = unsafe { rdtsc_fence() };
    println!(
        "{}: counted {}/{} events ({} zero-steps, yield {:.3}, mean {:.0} cycles/step, wall {} rdtsc)",
        name,
        report.fired,
        report.requested,
        report.zero_steps,
        report.step_yield(),
        report.mean_cycles(),
        stop - start
    );
    println!("Detailed:\"{}\",{}", name, report.csv());
    report
}

fn main() {
    let old = sched_getaffinity(Pid::from_raw(0)).unwrap();
    let mut core = 0;
    for i in 0..CpuSet::count() {
        if old.is_set(i).unwrap() {
            core = i;
            break;
        }
    }
    let previous = pin_to_core(core).unwrap();
    println!("stepping on core {}", core);
    println!("CSV:source,{}", RunReport::csv_header());

    for _ in 0..NUM_ITER {
        let software = run_source("software", TrapKind::Software, NUM_STEPS, 0.0);
        println!("CSV:software,{}", software.csv());

        let timer = run_source("timer", TrapKind::Timer, NUM_STEPS, ZERO_STEP_RATE);
        println!("CSV:timer,{}", timer.csv());

        let fault = run_source("fault", TrapKind::Fault, NUM_STEPS, ZERO_STEP_RATE);
        println!("CSV:fault,{}", fault.csv());
    }

    restore_affinity(&previous).unwrap();
}
