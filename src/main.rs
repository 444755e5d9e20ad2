mod cli;

use anyhow::{anyhow, Context, Result};
use cli::{expect_arg, LOGGING_LEVELS};
use log::{error, info, warn, LevelFilter};
use sevm::{
    deploy,
    disassemble::{disassemble, load_hex},
    engine::{state::defaults::CONTRACT_ADDRESS, Explorer, FlagWatchdog},
    report::Report,
    solver::{create_solver, SolverType},
};
use std::{path::PathBuf, process, str::FromStr, time::Duration};

const EXIT_COMPLETE: i32 = 0;
const EXIT_FATAL: i32 = 1;
const EXIT_INCOMPLETE: i32 = 2;

fn main() {
    match run() {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {:#}", e);
            process::exit(EXIT_FATAL);
        }
    }
}

fn input_file(m: &clap::ArgMatches) -> Result<&PathBuf> {
    m.get_one::<PathBuf>("input-file")
        .ok_or_else(|| anyhow!("no input file given"))
}

fn interrupt(watchdog: &FlagWatchdog) {
    warn!("interrupted, stopping exploration");
    watchdog.stop();
}

/// Raises the returned watchdog on Ctrl-C, so that an interrupted run still
/// reports what it found so far.
fn interrupt_watchdog() -> Result<FlagWatchdog> {
    let watchdog = FlagWatchdog::default();
    let handle = watchdog.clone();

    ctrlc::set_handler(move || interrupt(&handle)).context("failed to install Ctrl-C handler")?;

    Ok(watchdog)
}

fn run() -> Result<i32> {
    let matches = cli::args().get_matches();

    let level = LevelFilter::from_str(expect_arg(&matches, "verbose"))
        .with_context(|| format!("logging level has to be one of {:?}", LOGGING_LEVELS))?;

    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .init();

    match matches.subcommand() {
        Some(("disassemble", args)) => {
            let path = input_file(args)?;
            let bytecode = load_hex(path).with_context(|| format!("failed to load {}", path.display()))?;
            let program = disassemble(&bytecode)?;

            print!("{}", program);

            Ok(EXIT_COMPLETE)
        }
        Some(("explore", args)) => {
            let path = input_file(args)?;
            let bytecode = load_hex(path).with_context(|| format!("failed to load {}", path.display()))?;

            let options = cli::options(args)?;
            let entry = cli::entry(args, CONTRACT_ADDRESS)?;
            let storage = cli::storage(args)?;

            let solver_type = SolverType::from_str(expect_arg(args, "solver"))
                .map_err(|_| anyhow!("unknown solver {}", expect_arg(args, "solver")))?;
            let solver = create_solver(solver_type, Duration::from_millis(options.solver_timeout_ms));

            info!("exploring {} with {} solver", path.display(), solver.name());

            let watchdog = interrupt_watchdog()?;
            let world = deploy(&bytecode, entry.address, storage)?;
            let mut explorer = Explorer::new(&world, &entry, &options, solver.as_ref())?.with_watchdog(&watchdog);
            let findings = explorer.run();
            let report = Report::new(&findings, &explorer.status(), explorer.stats(), args.get_flag("smtlib"));

            if args.get_flag("json") {
                println!("{}", report.to_json()?);
            } else {
                println!("{}", report);
            }

            Ok(if report.complete {
                EXIT_COMPLETE
            } else {
                EXIT_INCOMPLETE
            })
        }
        _ => unreachable!(),
    }
}
