use clap::Parser;
use once_cell::sync::Lazy;
use oopdbg::debugger::DebuggerConfig;
use oopdbg::scenario::Scenario;
use oopdbg::version::version_string;
use std::path::PathBuf;

static VERSION: Lazy<String> = Lazy::new(version_string);

/// Replay native debug events through interop triage and print what the engine would do.
#[derive(Parser, Debug)]
#[command(author, version = VERSION.as_str(), about, long_about = None)]
struct Args {
    /// Scenario file (TOML)
    scenario: PathBuf,

    /// Engine configuration file, `~/.config/oopdbg/config.toml` by default
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print each event in debug form
    #[arg(long)]
    raw: bool,

    /// Log verbosity, repeat for more
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    oopdbg::log::init(args.verbose);

    let config = DebuggerConfig::from_file(args.config.as_deref())?;
    anyhow::ensure!(config.interop, "interop debugging is disabled in configuration");

    let scenario = Scenario::from_file(&args.scenario)?;
    for (n, verdict) in scenario.replay().into_iter().enumerate() {
        if args.raw {
            println!("#{n} {:?} -> {}", verdict.event, verdict.reaction);
        } else {
            println!("#{n} {} -> {}", verdict.event, verdict.reaction);
        }
    }
    Ok(())
}
