use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{ValueEnum, Args};
use clap::{Parser, Subcommand};

use simple_logger::SimpleLogger;

use crate::tftp::{consts, RequestKind};
use crate::tftp::options::OptionsConfig;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Options {
	#[arg(value_enum, short, long,
		default_value_t = DebugLevel::Warn,
		help = "Debug level to determine which messages are printed", global = true
	)]
	pub debug: DebugLevel,

	#[arg(short = 'r', long = "root", global = true,
		help = "Directory served by the server resp. base of client file arguments"
	)]
	pub root_dir: Option<PathBuf>,

	#[arg(short = 'c', long = "config", global = true,
		help = "Key/value configuration file; command line arguments take precedence"
	)]
	pub config_file: Option<PathBuf>,

	#[command(subcommand)]
	pub run_mode: RunMode,
}

#[derive(Debug, Clone, ValueEnum, Default)]
pub enum DebugLevel {
	Off = 0,
	Error,

	#[default]
	Warn,
	Info,
	Debug,
	Trace
}
impl From<DebugLevel> for log::LevelFilter {
	fn from(value: DebugLevel) -> Self {
		match value {
			DebugLevel::Off => Self::Off,
			DebugLevel::Error => Self::Error,
			DebugLevel::Warn => Self::Warn,
			DebugLevel::Info => Self::Info,
			DebugLevel::Debug => Self::Debug,
			DebugLevel::Trace => Self::Trace,
		}
	}
}

#[derive(Debug, Args)]
pub struct ClientOpts {
	#[arg(short, long, help = "Negotiate this block size for the transfer")]
	pub block_size: Option<u16>,

	#[arg(short, long, help = "Negotiate this timeout (seconds) for the transfer")]
	pub timeout_option: Option<u64>,

	#[arg(
		short = 'T', long, default_value_t = false,
		help = "Request (for GET) or hand over (for PUT) the size of the file"
	)]
	pub transfer_size: bool,
}

#[derive(Subcommand, Debug)]
pub enum RunMode {
	Server {
		#[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
		bind: IpAddr,

		#[arg(short, long, help = "UDP port to listen on (default from config, else 69)")]
		port: Option<u16>,

		#[arg(long, default_value_t = false,
			help = "Linger after the final ACK of an upload to re-ACK a retransmitted final block"
		)]
		dally: bool,
	},
	Client {
		#[command(flatten)]
		client_opts: ClientOpts,

		#[command(subcommand)]
		action: ClientAction
	}
}

#[derive(Debug, Args)]
pub struct ClientActionOpts {
	pub file: PathBuf,

	#[arg(help = "The remote server to connect to.")]
	pub server: IpAddr,

	#[arg(
		default_value_t = consts::TFTP_LISTEN_PORT,
		help = "(optional) The remote port to connect to."
	)]
	pub port: u16,
}

#[derive(Subcommand, Debug)]
pub enum ClientAction {
	Get {
		#[command(flatten)]
		opts: ClientActionOpts,
	},
	Put {
		#[command(flatten)]
		opts: ClientActionOpts,
	}
}
impl ClientAction {
	pub fn get_opts(&self) -> &ClientActionOpts {
		match self {
			Self::Get { opts } => opts,
			Self::Put { opts } => opts,
		}
	}

	pub fn as_req_kind(&self) -> RequestKind {
		match self {
			Self::Get { .. } => RequestKind::Rrq,
			Self::Put { .. } => RequestKind::Wrq,
		}
	}
}

/// Negotiation policy from the client command line flags.
pub fn parse_tftp_options(opts: &ClientOpts) -> OptionsConfig {
	OptionsConfig {
		handle_transfer_size: opts.transfer_size,
		block_size: opts.block_size,
		timeout: opts.timeout_option.map(Duration::from_secs),
	}
}

pub fn init_logger(debug_level: DebugLevel) {
	SimpleLogger::new()
		.with_level(debug_level.into())
		.env()
		.init()
		.unwrap();
}
