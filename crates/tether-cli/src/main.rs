//! `lcm_cli` — load and unload codeletsets on a running tether agent
//!
//! ```text
//! lcm_cli -a /tmp/tether/tether/tether_lcm_ipc -c probes.yaml -l
//! lcm_cli -c probes.yaml -u
//! ```
//!
//! Exit codes: 0 on success, 1 for invalid arguments, 2 for
//! descriptor parse failures, 3 when the agent rejects the request or
//! cannot be reached.

mod config;

use clap::Parser;
use config::CodeletsetFile;
use log::debug;
use std::path::PathBuf;
use std::process::ExitCode;

const DEFAULT_ADDRESS: &str = "/tmp/tether/tether_lcm_ipc";

#[derive(Parser)]
#[command(name = "lcm_cli")]
#[command(about = "Codeletset lifecycle management for tether agents")]
#[command(version)]
struct Cli {
    /// Agent LCM IPC socket address
    #[arg(short, long, default_value = DEFAULT_ADDRESS)]
    address: PathBuf,

    /// Codeletset descriptor file (YAML or JSON)
    #[arg(short, long)]
    config: String,

    /// Load the codeletset
    #[arg(short, long, conflicts_with = "unload")]
    load: bool,

    /// Unload the codeletset
    #[arg(short, long, conflicts_with = "load")]
    unload: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if !cli.load && !cli.unload {
        eprintln!("one of -l/--load or -u/--unload is required");
        return ExitCode::from(1);
    }

    let file = match CodeletsetFile::from_path(&cli.config) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(2);
        }
    };

    let address_str = cli.address.to_string_lossy().into_owned();
    debug!(
        "sending {} request for codeletset {} to {address_str}",
        if cli.load { "load" } else { "unload" },
        file.codeletset_id()
    );

    let outcome = if cli.load {
        match file.to_load_req(&address_str) {
            Ok(req) => tether_lcm::client::send_load_req(&cli.address, &req)
                .map(|()| format!("codeletset {} loaded", req.codeletset_id)),
            Err(err) => {
                eprintln!("{err}");
                return ExitCode::from(2);
            }
        }
    } else {
        match file.to_unload_req() {
            Ok(req) => tether_lcm::client::send_unload_req(&cli.address, &req)
                .map(|()| format!("codeletset {} unloaded", req.codeletset_id)),
            Err(err) => {
                eprintln!("{err}");
                return ExitCode::from(2);
            }
        }
    };

    match outcome {
        Ok(msg) => {
            println!("{msg}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(3)
        }
    }
}
