/*
 * arbor runs one worker of a distributed fleet executing malleable jobs. It
 * takes configuration via a configuration file, command-line parameters, and
 * environment variables, connects to its peer workers over TCP, and joins
 * the fleet's scheduling protocol. In mono mode, rank 0 additionally
 * introduces a single demo job and the fleet shuts down once it completes.
 */

#![warn(clippy::all)]

use arbor::error::Result;
use arbor::server::{mono_job_description, Server};
use arbor::Config;

fn main() -> Result<()> {
    let args = clap::command!()
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("config/arbor.yaml"),
        )
        .get_matches();
    let cfg = Config::load(args.get_one::<String>("config").unwrap().as_ref())?;

    let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("arbor");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let mono_job = (cfg.mono && cfg.rank == 0).then(|| mono_job_description(&cfg));
    Server::new(cfg)?.serve(mono_job)
}
