use std::net::SocketAddr;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

#[allow(unused)]
use log::{info, warn, error, debug, trace};
use clap::Parser;

use tftpkit::{cli, client, server};
use tftpkit::config::TftpConfig;
use tftpkit::server::{ServerConfig, TftpServer};
use tftpkit::tftp::reactor::TokioReactor;
use tftpkit::tftp::stats;

fn load_config(path: Option<&PathBuf>) -> Result<TftpConfig, String> {
	let Some(path) = path else {
		return Ok(TftpConfig::default());
	};

	let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
	let text = std::fs::read_to_string(&expanded)
		.map_err(|e| format!("cannot read config '{}': {}", expanded, e))?;

	TftpConfig::from_properties(&text)
		.map_err(|e| format!("cannot parse config '{}': {}", expanded, e))
}

fn resolve_root(root_dir: Option<PathBuf>) -> Result<PathBuf, String> {
	match root_dir {
		Some(root) => {
			let expanded = shellexpand::tilde(&root.to_string_lossy()).into_owned();
			let root = PathBuf::from(expanded);
			match root.try_exists() {
				Ok(true) => Ok(root),
				_ => Err("cannot find/access specified root path".to_string()),
			}
		},
		None => std::env::current_dir()
			.map_err(|e| format!("cannot access current working dir: {}", e)),
	}
}

#[tokio::main]
async fn main() {
	let options = cli::Options::parse();

	/* Initialize logging facility; can unwrap here because it has a default value */
	cli::init_logger(options.debug);

	let config = match load_config(options.config_file.as_ref()) {
		Ok(config) => config,
		Err(e) => return error!("{}", e),
	};

	let root = match resolve_root(options.root_dir) {
		Ok(root) => root,
		Err(e) => return error!("{}", e),
	};
	debug!("working dir '{}'", root.display());

	let cancel_token: CancellationToken = CancellationToken::new();
	let sigint_token = cancel_token.clone();

	/* Let's handle SIGINT on our own to gracefully shutdown all tasks */
	ctrlc::set_handler(move || {
		info!("Received SIGINT");
		sigint_token.cancel();
	}).unwrap();

	let res = match options.run_mode {
		cli::RunMode::Server { bind, port, dally } => {
			let mut config = config;
			if let Some(port) = port {
				config.port = port;
			}
			config.dally = config.dally || dally;

			let server_config = ServerConfig {
				listen: SocketAddr::from((bind, config.port)),
				transfer: config.transfer_config(),
			};

			let reactor = TokioReactor::new(cancel_token);
			let mut server = TftpServer::new(
				reactor,
				server_config,
				server::fs_request_handler(root),
			);
			server.run().await.map_err(|e| e.to_string())
		},
		cli::RunMode::Client { client_opts, action } => {
			client::run_client(action, client_opts, root, config.transfer_config(), cancel_token).await
		},
	};

	info!("packet statistics (RX):\n{}", stats::receive());
	info!("packet statistics (TX):\n{}", stats::transmit());

	if let Err(e) = res {
		return error!("{}", e);
	}
}
