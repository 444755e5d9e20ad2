use sevm::{
    deploy,
    engine::{
        memory::Storage, replay, state::defaults::CONTRACT_ADDRESS, Cause, Entry, ExplorationOptions, Explorer,
        Finding, FindingKind, IncompleteReason, RunStatus,
    },
    solver::NativeSolver,
    word::U256,
};

mod utils;
use utils::{assemble, init, u256};

const OWNER: u64 = 0xb0b;

fn run_with(source: &str, storage: Storage, entry: Entry, options: &ExplorationOptions) -> (Vec<Finding>, RunStatus) {
    let world = deploy(&assemble(source), CONTRACT_ADDRESS, storage).expect("valid bytecode");
    let solver = NativeSolver::new();
    let mut explorer = Explorer::new(&world, &entry, options, &solver).expect("valid setup");
    let findings = explorer.run();

    (findings, explorer.status())
}

fn assert_replays(source: &str, storage: Storage, entry: &Entry, findings: &[Finding]) {
    let world = deploy(&assemble(source), CONTRACT_ADDRESS, storage).expect("valid bytecode");

    for finding in findings {
        let witness = finding.witness.as_ref().expect("every path is solvable");

        assert_eq!(
            replay(&world, entry, witness, &ExplorationOptions::default()),
            Ok(finding.kind),
            "witness {} reproduces {}",
            witness,
            finding.kind
        );
    }
}

fn sorted_kinds(findings: &[Finding]) -> Vec<FindingKind> {
    let mut kinds = findings.iter().map(|f| f.kind).collect::<Vec<_>>();
    kinds.sort();
    kinds
}

fn two_arguments() -> Entry {
    Entry::new(CONTRACT_ADDRESS, Some([0; 4])).with_symbolic_arguments(2)
}

fn argument(finding: &Finding, name: &str) -> U256 {
    finding
        .witness
        .as_ref()
        .and_then(|w| w.get(name))
        .unwrap_or_else(|| panic!("witness for {}", name))
}

#[test]
fn symbolic_caller_is_solved_for_owner_check() {
    init();

    let source = format!(
        "
        CALLER PUSH20 {:#x} EQ PUSH2 :owner JUMPI
        PUSH1 0 DUP1 REVERT
        owner: JUMPDEST INVALID
        ",
        OWNER
    );
    let entry = Entry::new(CONTRACT_ADDRESS, None).with_symbolic_caller();
    let (findings, status) = run_with(&source, Storage::new(), entry, &ExplorationOptions::default());

    let violation = findings
        .iter()
        .find(|f| f.kind == FindingKind::InvariantViolated)
        .expect("owner path is reachable");

    assert_eq!(violation.cause, Cause::InvalidOpcode);
    assert_eq!(
        violation.witness.as_ref().and_then(|w| w.get("caller")),
        Some(u256(OWNER))
    );
    assert_eq!(findings.len(), 2);
    assert!(status.is_complete());
}

#[test]
fn symbolic_call_value_forks_on_payment() {
    init();

    let entry = Entry::new(CONTRACT_ADDRESS, None).with_symbolic_value();
    let (findings, _) = run_with(
        "CALLVALUE PUSH2 :paid JUMPI STOP paid: JUMPDEST INVALID",
        Storage::new(),
        entry,
        &ExplorationOptions::default(),
    );

    assert_eq!(findings.len(), 2);

    for finding in &findings {
        let value = finding
            .witness
            .as_ref()
            .and_then(|w| w.get("callvalue"))
            .expect("witness for call value");

        match finding.kind {
            FindingKind::InvariantViolated => assert_ne!(value, u256(0)),
            FindingKind::NormalReturn => assert_eq!(value, u256(0)),
            kind => panic!("unexpected finding {}", kind),
        }
    }
}

#[test]
fn initial_storage_is_visible() {
    init();

    let storage = [(u256(0), u256(5))].into_iter().collect();
    let (findings, _) = run_with(
        "PUSH1 0 SLOAD PUSH1 5 EQ PUSH2 :ok JUMPI INVALID ok: JUMPDEST STOP",
        storage,
        Entry::new(CONTRACT_ADDRESS, None),
        &ExplorationOptions::default(),
    );

    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, FindingKind::NormalReturn);
}

#[test]
fn watched_address_flags_path() {
    init();

    let options = ExplorationOptions {
        watch_addresses: vec![8],
        ..ExplorationOptions::default()
    };
    let (findings, _) = run_with(
        "PUSH1 4 CALLDATALOAD PUSH2 :target JUMPI STOP target: JUMPDEST STOP",
        Storage::new(),
        Entry::new(CONTRACT_ADDRESS, Some([0; 4])).with_symbolic_arguments(1),
        &options,
    );

    let flagged = findings
        .iter()
        .filter(|f| f.kind == FindingKind::FlaggedEventReached)
        .collect::<Vec<_>>();

    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].cause, Cause::WatchedAddress);
    assert_eq!(flagged[0].pc, 8);
}

#[test]
fn block_values_are_concrete() {
    init();

    let (findings, _) = run_with(
        "TIMESTAMP NUMBER CHAINID ADD ADD PUSH2 :ok JUMPI INVALID ok: JUMPDEST STOP",
        Storage::new(),
        Entry::new(CONTRACT_ADDRESS, None),
        &ExplorationOptions::default(),
    );

    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, FindingKind::NormalReturn);
    assert_eq!(findings[0].fork_depth, 0);
}

#[test]
fn selfdestruct_is_reported_only_when_enabled() {
    init();

    let source = "CALLER SELFDESTRUCT";
    let entry = Entry::new(CONTRACT_ADDRESS, None);

    let (findings, _) = run_with(source, Storage::new(), entry.clone(), &ExplorationOptions::default());
    assert_eq!(findings[0].kind, FindingKind::NormalReturn);

    let options = ExplorationOptions {
        selfdestruct_is_violation: true,
        ..ExplorationOptions::default()
    };
    let (findings, _) = run_with(source, Storage::new(), entry, &options);
    assert_eq!(findings[0].kind, FindingKind::InvariantViolated);
    assert!(matches!(findings[0].cause, Cause::SelfDestruct { .. }));
}

#[test]
fn unsupported_opcode_does_not_stop_sibling_paths() {
    init();

    let (findings, status) = run_with(
        "PUSH1 4 CALLDATALOAD PUSH2 :create JUMPI STOP create: JUMPDEST PUSH1 0 DUP1 DUP1 CREATE",
        Storage::new(),
        Entry::new(CONTRACT_ADDRESS, Some([0; 4])).with_symbolic_arguments(1),
        &ExplorationOptions::default(),
    );

    let mut kinds = findings.iter().map(|f| f.kind).collect::<Vec<_>>();
    kinds.sort();

    assert_eq!(kinds, vec![FindingKind::NormalReturn, FindingKind::Unsupported]);
    assert_eq!(
        status,
        RunStatus::Incomplete([IncompleteReason::Unsupported].into_iter().collect())
    );
}

#[test]
fn symbolic_keys_alias_when_equal() {
    init();

    let source = "
        PUSH1 1 PUSH1 4 CALLDATALOAD SSTORE      ; slots[a] = 1
        PUSH1 36 CALLDATALOAD SLOAD              ; slots[b]
        PUSH2 :hit JUMPI STOP
        hit: JUMPDEST INVALID
        ";
    let entry = two_arguments();
    let (findings, status) = run_with(source, Storage::new(), entry.clone(), &ExplorationOptions::default());

    assert_eq!(
        sorted_kinds(&findings),
        vec![FindingKind::NormalReturn, FindingKind::InvariantViolated]
    );
    assert!(findings.iter().all(|f| f.fork_depth == 1 && f.solver_confirmed));
    assert!(status.is_complete());

    for finding in &findings {
        let aliased = argument(finding, "arg0") == argument(finding, "arg1");
        assert_eq!(aliased, finding.kind == FindingKind::InvariantViolated);
    }

    assert_replays(source, Storage::new(), &entry, &findings);
}

#[test]
fn symbolic_read_reaches_initial_slot() {
    init();

    let source = "PUSH1 4 CALLDATALOAD SLOAD PUSH2 :hit JUMPI STOP hit: JUMPDEST INVALID";
    let storage = || [(u256(5), u256(1))].into_iter().collect::<Storage>();
    let entry = two_arguments();
    let (findings, _) = run_with(source, storage(), entry.clone(), &ExplorationOptions::default());

    let violation = findings
        .iter()
        .find(|f| f.kind == FindingKind::InvariantViolated)
        .expect("slot 5 is reachable through a symbolic key");

    assert_eq!(argument(violation, "arg0"), u256(5));
    assert_eq!(findings.len(), 2);

    assert_replays(source, storage(), &entry, &findings);
}

#[test]
fn symbolic_write_may_overwrite_concrete_slot() {
    init();

    let source = "
        PUSH1 7 PUSH1 4 CALLDATALOAD SSTORE      ; slots[a] = 7
        PUSH1 5 SLOAD PUSH1 1 EQ                 ; slots[5] == 1
        PUSH2 :ok JUMPI INVALID
        ok: JUMPDEST STOP
        ";
    let storage = || [(u256(5), u256(1))].into_iter().collect::<Storage>();
    let entry = two_arguments();
    let (findings, _) = run_with(source, storage(), entry.clone(), &ExplorationOptions::default());

    assert_eq!(
        sorted_kinds(&findings),
        vec![FindingKind::NormalReturn, FindingKind::InvariantViolated]
    );

    let violation = findings
        .iter()
        .find(|f| f.kind == FindingKind::InvariantViolated)
        .expect("slot 5 can be overwritten");

    assert_eq!(argument(violation, "arg0"), u256(5));

    assert_replays(source, storage(), &entry, &findings);
}

#[test]
fn mapping_entries_alias_on_equal_owners() {
    init();

    // balances[a] = 100; assert(balances[b] != 100)
    let source = "
        PUSH1 4 CALLDATALOAD PUSH1 0 MSTORE
        PUSH1 0 PUSH1 32 MSTORE
        PUSH1 100 PUSH1 64 PUSH1 0 KECCAK256 SSTORE
        PUSH1 36 CALLDATALOAD PUSH1 0 MSTORE
        PUSH1 64 PUSH1 0 KECCAK256 SLOAD
        PUSH1 100 EQ PUSH2 :hit JUMPI STOP
        hit: JUMPDEST INVALID
        ";
    let entry = two_arguments();
    let (findings, status) = run_with(source, Storage::new(), entry.clone(), &ExplorationOptions::default());

    assert_eq!(
        sorted_kinds(&findings),
        vec![FindingKind::NormalReturn, FindingKind::InvariantViolated]
    );
    assert!(status.is_complete());

    for finding in &findings {
        let aliased = argument(finding, "arg0") == argument(finding, "arg1");
        assert_eq!(aliased, finding.kind == FindingKind::InvariantViolated);
    }

    assert_replays(source, Storage::new(), &entry, &findings);
}
