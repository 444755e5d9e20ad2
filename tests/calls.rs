use sevm::{
    disassemble::disassemble,
    engine::{
        memory::{Storage, WorldState},
        state::defaults::CONTRACT_ADDRESS,
        Bound, Cause, Entry, ExplorationOptions, Explorer, Finding, FindingKind,
    },
    solver::NativeSolver,
    word::Word,
};

mod utils;
use utils::{assemble, init, u256};

const CALLEE: u64 = 0x1000;

fn run(caller: &str, callee: Option<&str>, options: &ExplorationOptions) -> Vec<Finding> {
    let mut world = WorldState::new();

    world.deploy(
        CONTRACT_ADDRESS,
        disassemble(&assemble(caller)).expect("valid caller"),
        Storage::new(),
    );

    if let Some(callee) = callee {
        world.deploy(
            u256(CALLEE),
            disassemble(&assemble(callee)).expect("valid callee"),
            Storage::new(),
        );
    }

    let solver = NativeSolver::new();
    let mut explorer =
        Explorer::new(&world, &Entry::new(CONTRACT_ADDRESS, None), options, &solver).expect("valid setup");

    explorer.run()
}

#[test]
fn return_data_is_copied_into_caller_memory() {
    init();

    let findings = run(
        "
        PUSH1 32 PUSH1 0 PUSH1 0 PUSH1 0 PUSH1 0 PUSH2 0x1000 GAS CALL
        ISZERO PUSH2 :fail JUMPI
        RETURNDATASIZE PUSH1 0 RETURN
        fail: JUMPDEST INVALID
        ",
        Some("PUSH1 42 PUSH1 0 MSTORE PUSH1 32 PUSH1 0 RETURN"),
        &ExplorationOptions::default(),
    );

    let mut expected = vec![0; 32];
    expected[31] = 42;

    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, FindingKind::NormalReturn);
    assert_eq!(findings[0].cause, Cause::Return { data: Some(expected) });
}

#[test]
fn reverting_callee_restores_storage() {
    init();

    let findings = run(
        "
        PUSH1 0 PUSH1 0 PUSH1 0 PUSH1 0 PUSH2 0x1000 GAS DELEGATECALL
        PUSH2 :fail JUMPI
        PUSH1 0 SLOAD PUSH2 :fail JUMPI
        STOP
        fail: JUMPDEST INVALID
        ",
        Some("PUSH1 1 PUSH1 0 SSTORE PUSH1 0 DUP1 REVERT"),
        &ExplorationOptions::default(),
    );

    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, FindingKind::NormalReturn);
}

#[test]
fn delegatecall_writes_caller_storage() {
    init();

    let findings = run(
        "
        PUSH1 0 PUSH1 0 PUSH1 0 PUSH1 0 PUSH2 0x1000 GAS DELEGATECALL
        ISZERO PUSH2 :fail JUMPI
        PUSH1 0 SLOAD ISZERO PUSH2 :fail JUMPI
        STOP
        fail: JUMPDEST INVALID
        ",
        Some("PUSH1 1 PUSH1 0 SSTORE STOP"),
        &ExplorationOptions::default(),
    );

    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, FindingKind::NormalReturn);
}

#[test]
fn state_change_in_static_call_fails_the_call() {
    init();

    let findings = run(
        "
        PUSH1 0 PUSH1 0 PUSH1 0 PUSH1 0 PUSH2 0x1000 GAS STATICCALL
        PUSH2 :fail JUMPI
        STOP
        fail: JUMPDEST INVALID
        ",
        Some("PUSH1 1 PUSH1 0 SSTORE STOP"),
        &ExplorationOptions::default(),
    );

    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, FindingKind::NormalReturn);
}

#[test]
fn calls_to_accounts_without_code_succeed() {
    init();

    let findings = run(
        "
        PUSH1 0 PUSH1 0 PUSH1 0 PUSH1 0 PUSH1 0 PUSH2 0xdead GAS CALL
        ISZERO PUSH2 :fail JUMPI
        RETURNDATASIZE PUSH2 :fail JUMPI
        STOP
        fail: JUMPDEST INVALID
        ",
        None,
        &ExplorationOptions::default(),
    );

    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, FindingKind::NormalReturn);
}

#[test]
fn recursion_stops_at_call_depth_bound() {
    init();

    let options = ExplorationOptions {
        max_call_depth: 2,
        ..ExplorationOptions::default()
    };
    let findings = run(
        "PUSH1 0 PUSH1 0 PUSH1 0 PUSH1 0 PUSH1 0 ADDRESS GAS CALL STOP",
        None,
        &options,
    );

    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, FindingKind::BoundedAbort);
    assert_eq!(findings[0].cause, Cause::Bound(Bound::CallDepth));
    assert_eq!(findings[0].call_depth, 2);
}

#[test]
fn panic_in_callee_is_reported_at_its_depth() {
    init();

    let findings = run(
        "PUSH1 0 PUSH1 0 PUSH1 0 PUSH1 0 PUSH1 0 PUSH2 0x1000 GAS CALL STOP",
        Some(
            "
            PUSH32 0x4e487b7100000000000000000000000000000000000000000000000000000000
            PUSH1 0 MSTORE
            PUSH1 1 PUSH1 4 MSTORE
            PUSH1 0x24 PUSH1 0 REVERT
            ",
        ),
        &ExplorationOptions::default(),
    );

    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, FindingKind::InvariantViolated);
    assert_eq!(findings[0].cause, Cause::Panic { code: Word::one() });
    assert_eq!(findings[0].call_depth, 1);
    assert_eq!(findings[0].address, u256(CALLEE));
}
