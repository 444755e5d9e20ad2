#[macro_use]
pub mod util;

pub mod disassemble;
pub mod engine;
pub mod expr;
pub mod path_exploration;
pub mod report;
pub mod solver;
pub mod word;

use disassemble::disassemble;
use engine::{
    memory::{Storage, WorldState},
    Entry, ExplorationError, ExplorationOptions, Explorer,
};
use report::Report;
use solver::Solver;
use word::U256;

/// A world holding a single contract with the given initial storage.
pub fn deploy(bytecode: &[u8], address: U256, storage: Storage) -> Result<WorldState, ExplorationError> {
    let program = disassemble(bytecode)?;
    let mut world = WorldState::new();

    world.deploy(address, program, storage);

    Ok(world)
}

/// Explores `bytecode` from `entry` until the frontier is exhausted or a
/// global bound stops the run.
pub fn explore(
    bytecode: &[u8],
    storage: Storage,
    entry: &Entry,
    options: &ExplorationOptions,
    solver: &dyn Solver,
) -> Result<Report, ExplorationError> {
    let world = deploy(bytecode, entry.address, storage)?;
    let mut explorer = Explorer::new(&world, entry, options, solver)?;
    let findings = explorer.run();

    Ok(Report::new(&findings, &explorer.status(), explorer.stats(), false))
}
