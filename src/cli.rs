use anyhow::{anyhow, bail, Context, Result};
use clap::{
    crate_authors, crate_description, crate_name, crate_version, value_parser, Arg, ArgAction, ArgMatches, Command,
};
use sevm::{
    engine::{memory::Storage, options::event_topic, Entry, ExplorationOptions, Strategy},
    util::parse_u256,
    word::{self, U256},
};
use std::{fs, path::PathBuf};
use strum::VariantNames;

pub const LOGGING_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[cfg(not(feature = "z3"))]
pub const SOLVER: [&str; 1] = ["native"];
#[cfg(feature = "z3")]
pub const SOLVER: [&str; 2] = ["native", "z3"];

pub fn expect_arg<'a>(m: &'a ArgMatches, arg: &str) -> &'a str {
    m.get_one::<String>(arg)
        .map(String::as_str)
        .unwrap_or_else(|| panic!("argument \"{}\" has to be set in CLI at all times", arg))
}

fn number(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .help(help)
        .value_name("NUMBER")
        .value_parser(value_parser!(u64))
}

pub fn args() -> Command {
    Command::new(crate_name!())
        .version(crate_version!())
        .author(crate_authors!(", "))
        .about(crate_description!())
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("configure logging level to use")
                .value_name("LEVEL")
                .value_parser(LOGGING_LEVELS)
                .default_value(LOGGING_LEVELS[2])
                .global(true),
        )
        .subcommand(
            Command::new("disassemble")
                .about("Disassemble EVM bytecode given as hex text")
                .arg(
                    Arg::new("input-file")
                        .value_name("FILE")
                        .help("Hex encoded bytecode to be disassembled")
                        .value_parser(value_parser!(PathBuf))
                        .required(true),
                ),
        )
        .subcommand(
            Command::new("explore")
                .about("Symbolically explore the paths of EVM bytecode")
                .arg(
                    Arg::new("input-file")
                        .value_name("FILE")
                        .help("Hex encoded runtime bytecode to be explored")
                        .value_parser(value_parser!(PathBuf))
                        .required(true),
                )
                .arg(
                    Arg::new("selector")
                        .help("Function selector as 0x-prefixed 4 bytes, or a signature like process(uint256)")
                        .short('f')
                        .long("selector")
                        .value_name("SELECTOR"),
                )
                .arg(
                    Arg::new("args")
                        .help("Number of symbolic 32-byte arguments following the selector")
                        .short('a')
                        .long("args")
                        .value_name("NUMBER")
                        .value_parser(value_parser!(usize))
                        .default_value("0"),
                )
                .arg(
                    Arg::new("symbolic-caller")
                        .help("Treat the caller address as symbolic input")
                        .long("symbolic-caller")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("symbolic-value")
                        .help("Treat the call value as symbolic input")
                        .long("symbolic-value")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("storage")
                        .help("Initial storage slot of the contract")
                        .long("storage")
                        .value_name("KEY=VALUE")
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("config")
                        .help("JSON file with exploration options, overridden by flags")
                        .short('c')
                        .long("config")
                        .value_name("FILE")
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(number("max-call-depth", "Maximum number of nested call frames"))
                .arg(number("max-fork-depth", "Maximum number of symbolic branches along a path"))
                .arg(number("max-instructions", "Number of instructions after which a path is aborted"))
                .arg(number("max-frontier", "Maximum number of pending states"))
                .arg(number("max-states", "Number of explored states after which the run stops"))
                .arg(number("solver-timeout", "Timeout of a single solver query in milliseconds"))
                .arg(
                    Arg::new("strategy")
                        .help("Order in which pending states are explored")
                        .short('s')
                        .long("strategy")
                        .value_name("STRATEGY")
                        .value_parser(Strategy::VARIANTS.to_vec()),
                )
                .arg(
                    Arg::new("watch-event")
                        .help("Event signature or 0x topic that flags a path when emitted")
                        .short('e')
                        .long("watch-event")
                        .value_name("EVENT")
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("watch-address")
                        .help("Program counter that flags a path when reached")
                        .long("watch-address")
                        .value_name("PC")
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("selfdestruct-is-violation")
                        .help("Report SELFDESTRUCT as invariant violation")
                        .long("selfdestruct-is-violation")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("solver")
                        .help("SMT solver")
                        .long("solver")
                        .value_name("SOLVER")
                        .value_parser(SOLVER)
                        .default_value(SOLVER[0]),
                )
                .arg(
                    Arg::new("smtlib")
                        .help("Attach the SMT-LIB form of every path condition")
                        .long("smtlib")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("json")
                        .help("Print the report as JSON")
                        .long("json")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
}

fn selector(text: &str) -> Result<[u8; 4]> {
    let text = text.trim();

    if let Some(digits) = text.strip_prefix("0x") {
        let bytes = hex::decode(digits).with_context(|| format!("invalid selector {}", text))?;

        return bytes
            .try_into()
            .map_err(|_| anyhow!("selector {} is not 4 bytes long", text));
    }

    let hash = event_topic(text).to_be_bytes();

    Ok([hash[0], hash[1], hash[2], hash[3]])
}

pub fn entry(m: &ArgMatches, address: U256) -> Result<Entry> {
    let selector = m.get_one::<String>("selector").map(|s| selector(s)).transpose()?;
    let count = m.get_one::<usize>("args").copied().unwrap_or(0);

    let mut entry = Entry::new(address, selector).with_symbolic_arguments(count);

    if m.get_flag("symbolic-caller") {
        entry = entry.with_symbolic_caller();
    }

    if m.get_flag("symbolic-value") {
        entry = entry.with_symbolic_value();
    }

    Ok(entry)
}

pub fn storage(m: &ArgMatches) -> Result<Storage> {
    m.get_many::<String>("storage")
        .into_iter()
        .flatten()
        .map(|slot| {
            let (key, value) = slot
                .split_once('=')
                .ok_or_else(|| anyhow!("storage slot {} is not of the form KEY=VALUE", slot))?;

            match (parse_u256(key), parse_u256(value)) {
                (Some(key), Some(value)) => Ok((key, value)),
                _ => bail!("invalid storage slot {}", slot),
            }
        })
        .collect()
}

/// Options from the config file, overlaid with command line flags.
pub fn options(m: &ArgMatches) -> Result<ExplorationOptions> {
    let mut options = match m.get_one::<PathBuf>("config") {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;

            ExplorationOptions::from_json(&text)
                .with_context(|| format!("invalid config file {}", path.display()))?
        }
        None => ExplorationOptions::default(),
    };

    let usize_arg = |name: &str| -> Result<Option<usize>> {
        m.get_one::<u64>(name)
            .map(|v| usize::try_from(*v).with_context(|| format!("{} is too large", name)))
            .transpose()
    };

    if let Some(v) = usize_arg("max-call-depth")? {
        options.max_call_depth = v;
    }
    if let Some(v) = usize_arg("max-fork-depth")? {
        options.max_fork_depth = v;
    }
    if let Some(v) = m.get_one::<u64>("max-instructions") {
        options.max_instructions = *v;
    }
    if let Some(v) = usize_arg("max-frontier")? {
        options.max_frontier = v;
    }
    if let Some(v) = usize_arg("max-states")? {
        options.max_states = v;
    }
    if let Some(v) = m.get_one::<u64>("solver-timeout") {
        options.solver_timeout_ms = *v;
    }
    if let Some(strategy) = m.get_one::<String>("strategy") {
        options.strategy = strategy.parse().map_err(|_| anyhow!("unknown strategy {}", strategy))?;
    }

    options
        .watch_events
        .extend(m.get_many::<String>("watch-event").into_iter().flatten().cloned());

    for pc in m.get_many::<String>("watch-address").into_iter().flatten() {
        let pc = parse_u256(pc)
            .and_then(word::to_usize)
            .ok_or_else(|| anyhow!("invalid program counter {}", pc))?;

        options.watch_addresses.push(pc);
    }

    if m.get_flag("selfdestruct-is-violation") {
        options.selfdestruct_is_violation = true;
    }

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sevm::engine::{state::defaults::CONTRACT_ADDRESS, Argument};

    fn explore(flags: &[&str]) -> ArgMatches {
        let matches = args()
            .try_get_matches_from([&["sevm", "explore", "code.hex"][..], flags].concat())
            .expect("valid arguments");

        matches
            .subcommand_matches("explore")
            .cloned()
            .expect("explore subcommand")
    }

    #[test]
    fn selectors_accept_hex_and_signatures() {
        assert_eq!(selector("0x12345678").expect("valid"), [0x12, 0x34, 0x56, 0x78]);
        // keccak256("transfer(address,uint256)") starts with a9059cbb
        assert_eq!(
            selector("transfer(address,uint256)").expect("valid"),
            [0xa9, 0x05, 0x9c, 0xbb]
        );
        assert!(selector("0x1234").is_err());
    }

    #[test]
    fn flags_override_defaults() {
        let m = explore(&[
            "--max-instructions",
            "12",
            "--strategy",
            "coverage-guided",
            "--watch-event",
            "Bug()",
            "--watch-address",
            "0x2a",
        ]);
        let options = options(&m).expect("valid options");

        assert_eq!(options.max_instructions, 12);
        assert_eq!(options.strategy, Strategy::CoverageGuided);
        assert_eq!(options.watch_events, vec!["Bug()".to_string()]);
        assert_eq!(options.watch_addresses, vec![42]);
    }

    #[test]
    fn entry_and_storage_are_read() {
        let m = explore(&["-f", "0xdeadbeef", "-a", "2", "--symbolic-caller", "--storage", "0x1=5"]);

        let entry = entry(&m, CONTRACT_ADDRESS).expect("valid entry");
        let storage = storage(&m).expect("valid storage");

        assert_eq!(entry.selector, Some([0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(entry.arguments.len(), 2);
        assert_eq!(entry.caller, Argument::Symbolic("caller".to_string()));
        assert_eq!(storage.len(), 1);
    }
}
