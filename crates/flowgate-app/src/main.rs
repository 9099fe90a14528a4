use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "flowgate", about = "A programmable API gateway", version)]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Run the gateway.
	Run {
		/// Path to the YAML configuration file.
		#[arg(long, short)]
		config: PathBuf,
		/// Write the process id here; `reload` signals through it.
		#[arg(long, default_value = "/tmp/flowgate.pid")]
		pidfile: PathBuf,
	},
	/// Validate a configuration file and exit.
	Validate {
		#[arg(long, short)]
		config: PathBuf,
	},
	/// Signal a running instance to reload its configuration.
	Reload {
		#[arg(long, default_value = "/tmp/flowgate.pid")]
		pidfile: PathBuf,
	},
}

// Exit codes: 0 success, 1 config invalid, 2 runtime fatal.
fn main() -> ExitCode {
	let cli = Cli::parse();
	match cli.command {
		Command::Run { config, pidfile } => run(config, pidfile),
		Command::Validate { config } => validate(config),
		Command::Reload { pidfile } => reload(pidfile),
	}
}

fn run(config_path: PathBuf, pidfile: PathBuf) -> ExitCode {
	let config = match flowgate::config::loader::load_file(&config_path) {
		Ok(config) => config,
		Err(err) => {
			eprintln!("configuration invalid: {err}");
			return ExitCode::from(1);
		},
	};
	if let Err(err) = std::fs::write(&pidfile, std::process::id().to_string()) {
		eprintln!("warning: failed to write pidfile {}: {err}", pidfile.display());
	}

	let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
		Ok(rt) => rt,
		Err(err) => {
			eprintln!("failed to start runtime: {err}");
			return ExitCode::from(2);
		},
	};
	let result = runtime.block_on(flowgate::app::run(config, Some(config_path)));
	let _ = std::fs::remove_file(&pidfile);
	match result {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			eprintln!("fatal: {err:#}");
			ExitCode::from(2)
		},
	}
}

fn validate(config_path: PathBuf) -> ExitCode {
	match flowgate::config::loader::load_file(&config_path) {
		Ok(_) => {
			println!("{}: configuration is valid", config_path.display());
			ExitCode::SUCCESS
		},
		Err(err) => {
			eprintln!("{}: {err}", config_path.display());
			ExitCode::from(1)
		},
	}
}

#[cfg(unix)]
fn reload(pidfile: PathBuf) -> ExitCode {
	let pid = match std::fs::read_to_string(&pidfile)
		.ok()
		.and_then(|s| s.trim().parse::<i32>().ok())
	{
		Some(pid) => pid,
		None => {
			eprintln!("no running instance found at {}", pidfile.display());
			return ExitCode::from(2);
		},
	};
	match nix::sys::signal::kill(
		nix::unistd::Pid::from_raw(pid),
		nix::sys::signal::Signal::SIGHUP,
	) {
		Ok(()) => {
			println!("sent reload signal to pid {pid}");
			ExitCode::SUCCESS
		},
		Err(err) => {
			eprintln!("failed to signal pid {pid}: {err}");
			ExitCode::from(2)
		},
	}
}

#[cfg(not(unix))]
fn reload(_pidfile: PathBuf) -> ExitCode {
	eprintln!("reload is only supported on unix");
	ExitCode::from(2)
}
