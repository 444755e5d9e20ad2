use rayon::prelude::*;
use sevm::{
    engine::{
        replay, Cause, ExplorationOptions, Explorer, Finding, FindingKind, IncompleteReason, RunStatus, Strategy,
        Watchdog,
    },
    expr::Expr,
    solver::{NativeSolver, SatResult, Solver, SolverError, UnknownReason},
};

mod utils;
use utils::{init, process_entry, process_sequential_guards, process_single_guard, u256, world, BUG_EVENT};

fn options() -> ExplorationOptions {
    ExplorationOptions {
        watch_events: vec![BUG_EVENT.to_string()],
        ..ExplorationOptions::default()
    }
}

fn explore(code: &[u8], options: &ExplorationOptions) -> (Vec<Finding>, RunStatus) {
    let solver = NativeSolver::new();
    let world = world(code);
    let mut explorer = Explorer::new(&world, &process_entry(), options, &solver).expect("valid setup");
    let findings = explorer.run();

    (findings, explorer.status())
}

fn kinds(findings: &[Finding]) -> Vec<FindingKind> {
    findings.iter().map(|f| f.kind).collect()
}

fn assert_replays(code: &[u8], findings: &[Finding]) {
    let world = world(code);

    for finding in findings {
        let witness = finding.witness.as_ref().expect("every path is solvable");

        assert_eq!(
            replay(&world, &process_entry(), witness, &options()),
            Ok(finding.kind),
            "witness {} reproduces {}",
            witness,
            finding.kind
        );
    }
}

#[test]
fn single_guard_forks_once() {
    init();

    let code = process_single_guard();
    let (findings, status) = explore(&code, &options());

    assert_eq!(
        kinds(&findings),
        vec![FindingKind::FlaggedEventReached, FindingKind::Reverted]
    );
    assert!(status.is_complete());

    let bug = &findings[0];
    let a = bug
        .witness
        .as_ref()
        .and_then(|w| w.get("arg0"))
        .expect("witness for a");

    assert!(a > u256(200) && a < u256(210), "witness {} is in range", a);
    assert!(bug.solver_confirmed);
    assert_eq!(bug.path_condition.len(), 1);
    assert!(matches!(&bug.cause, Cause::Event { topics } if topics.len() == 1));

    assert_replays(&code, &findings);
}

#[test]
fn sequential_guards_fork_per_comparison() {
    init();

    let code = process_sequential_guards();
    let (findings, status) = explore(&code, &options());

    assert_eq!(
        kinds(&findings),
        vec![
            FindingKind::Reverted,
            FindingKind::Reverted,
            FindingKind::FlaggedEventReached
        ]
    );
    assert!(status.is_complete());

    let a = findings[2]
        .witness
        .as_ref()
        .and_then(|w| w.get("arg0"))
        .expect("witness for a");

    assert!(a > u256(200) && a < u256(210), "witness {} is in range", a);

    assert_replays(&code, &findings);
}

#[test]
fn low_instruction_bound_aborts_and_marks_run_incomplete() {
    init();

    let options = ExplorationOptions {
        max_instructions: 20,
        ..options()
    };
    let (findings, status) = explore(&process_single_guard(), &options);

    assert!(findings.iter().any(|f| f.kind == FindingKind::BoundedAbort));
    assert!(findings.iter().all(|f| f.kind != FindingKind::FlaggedEventReached));
    assert!(findings.iter().all(|f| f.instruction_count <= 20));
    assert_eq!(
        status,
        RunStatus::Incomplete([IncompleteReason::BoundedAbort].into_iter().collect())
    );
}

#[test]
fn unwatched_event_is_a_normal_return() {
    init();

    let (findings, _) = explore(&process_single_guard(), &ExplorationOptions::default());

    assert_eq!(kinds(&findings), vec![FindingKind::NormalReturn, FindingKind::Reverted]);
}

#[test]
fn depth_first_runs_are_deterministic() {
    init();

    let code = process_sequential_guards();
    let render = |findings: Vec<Finding>| findings.iter().map(|f| f.to_string()).collect::<Vec<_>>();

    let (first, _) = explore(&code, &options());
    let (second, _) = explore(&code, &options());

    assert_eq!(render(first), render(second));
}

#[test]
fn independent_explorations_run_concurrently() {
    init();

    let programs = vec![process_single_guard(), process_sequential_guards()];

    let counts = programs
        .par_iter()
        .map(|code| {
            let (findings, _) = explore(code, &options());
            findings
                .iter()
                .filter(|f| f.kind == FindingKind::FlaggedEventReached)
                .count()
        })
        .collect::<Vec<_>>();

    assert_eq!(counts, vec![1, 1]);
}

#[test]
fn coverage_guided_strategy_finds_the_same_paths() {
    init();

    let options = ExplorationOptions {
        strategy: Strategy::CoverageGuided,
        ..options()
    };
    let (findings, status) = explore(&process_sequential_guards(), &options);
    let mut kinds = kinds(&findings);

    kinds.sort();

    assert_eq!(
        kinds,
        vec![
            FindingKind::Reverted,
            FindingKind::Reverted,
            FindingKind::FlaggedEventReached
        ]
    );
    assert!(status.is_complete());
}

#[test]
fn wrong_selector_reverts_without_forking() {
    init();

    let solver = NativeSolver::new();
    let code = process_single_guard();
    let world = world(&code);
    let mut entry = process_entry();

    entry.selector = Some([0, 0, 0, 0]);

    let mut explorer = Explorer::new(&world, &entry, &options(), &solver).expect("valid setup");
    let findings = explorer.run();

    assert_eq!(kinds(&findings), vec![FindingKind::Reverted]);
    assert_eq!(explorer.stats().forks, 0);
    assert!(findings[0].path_condition.is_empty());
}

/// A backend that never reaches a verdict.
struct TimeoutSolver;

impl Solver for TimeoutSolver {
    fn name(&self) -> &'static str {
        "timeout"
    }

    fn check_impl(&self, _: &[Expr], _: &dyn Watchdog) -> Result<SatResult, SolverError> {
        Ok(SatResult::Unknown(UnknownReason::Timeout))
    }
}

#[test]
fn undecided_branches_are_explored_but_unconfirmed() {
    init();

    let solver = TimeoutSolver;
    let world = world(&process_single_guard());
    let mut explorer = Explorer::new(&world, &process_entry(), &options(), &solver).expect("valid setup");
    let findings = explorer.run();

    assert_eq!(
        kinds(&findings),
        vec![FindingKind::FlaggedEventReached, FindingKind::Reverted]
    );
    assert!(findings.iter().all(|f| !f.solver_confirmed));
    assert!(findings.iter().all(|f| f.witness.is_none()));
    assert!(findings.iter().all(|f| f.path_condition.len() == 1));
    assert_eq!(explorer.stats().forks, 1);
    assert_eq!(explorer.stats().unconfirmed, 2);
    assert!(explorer.status().is_complete());
}
