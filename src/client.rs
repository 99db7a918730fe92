//! The client factory: produces per-request transfer operations bound to
//! a reactor, plus the get/put front-end used by the CLI.

use std::fs::OpenOptions;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

#[allow(unused)]
use log::{info, warn, error, debug, trace};

use crate::cli;
use crate::tftp::{CompletionHandler, Mode, OptionNegotiationHandler, RequestKind, TransferConfig, TransferStatus};
use crate::tftp::client_ops::{ClientOperationConfig, ClientReadOperation, ClientWriteOperation};
use crate::tftp::error::TftpError;
use crate::tftp::handler::{FileReceiver, FileTransmitter, ReceiveDataHandler, TransmitDataHandler};
use crate::tftp::reactor::{Reactor, TokioReactor};

///
/// Addressing of a single request; the transfer parameters themselves
/// come from the factory's configuration.
///
#[derive(Debug, Clone)]
pub struct TftpRequestParameters {
	pub server: SocketAddr,
	/// Bind address override; the factory's wildcard address with an
	/// ephemeral port otherwise.
	pub local: Option<SocketAddr>,
	pub filename: String,
	pub mode: Mode,
}

///
/// Produces transfer operations sharing one reactor and one transfer
/// configuration. Every operation gets its own ephemeral socket.
///
pub struct TftpClient<R: Reactor> {
	reactor: R,
	local_ip: IpAddr,
	config: TransferConfig,
}

impl<R: Reactor> TftpClient<R> {
	pub fn new(reactor: R, local_ip: IpAddr, config: TransferConfig) -> Self {
		Self { reactor, local_ip, config }
	}

	async fn bind(&self, local: Option<SocketAddr>) -> Result<R::Socket, TftpError> {
		let local = local.unwrap_or_else(|| SocketAddr::new(self.local_ip, 0));
		Ok(self.reactor.bind(local).await?)
	}

	fn operation_config(&self, params: &TftpRequestParameters) -> ClientOperationConfig {
		ClientOperationConfig {
			transfer: self.config.clone(),
			remote: params.server,
			filename: params.filename.clone(),
			mode: params.mode,
		}
	}

	pub async fn read_operation<H: ReceiveDataHandler>(
		&self,
		params: TftpRequestParameters,
		handler: H,
		negotiation_handler: Option<OptionNegotiationHandler>,
		completion: CompletionHandler,
	) -> Result<ClientReadOperation<R::Socket, H>, TftpError> {
		let socket = self.bind(params.local).await?;
		let config = self.operation_config(&params);
		Ok(ClientReadOperation::new(socket, config, handler, negotiation_handler, completion))
	}

	pub async fn write_operation<H: TransmitDataHandler>(
		&self,
		params: TftpRequestParameters,
		handler: H,
		negotiation_handler: Option<OptionNegotiationHandler>,
		completion: CompletionHandler,
	) -> Result<ClientWriteOperation<R::Socket, H>, TftpError> {
		let socket = self.bind(params.local).await?;
		let config = self.operation_config(&params);
		Ok(ClientWriteOperation::new(socket, config, handler, negotiation_handler, completion))
	}
}

// ############################################################################
// #### CLI FRONT-END #########################################################
// ############################################################################

fn completion_logger(filename: String) -> CompletionHandler {
	Box::new(move |status, error| {
		match (status, error) {
			(TransferStatus::Successful, _) => info!("'{}' transferred", filename),
			(_, Some(err)) => error!("'{}' failed: {} ({})", filename, status, err),
			(_, None) => error!("'{}' failed: {}", filename, status),
		}
	})
}

async fn get(
	client: &TftpClient<TokioReactor>,
	server: SocketAddr,
	file_path: PathBuf,
) -> Result<TransferStatus, String> {
	let filename = file_path.file_name()
		.ok_or_else(|| format!("'{}' has no filename", file_path.display()))?
		.to_string_lossy()
		.into_owned();

	let file = OpenOptions::new().create(true).write(true).truncate(true).open(&file_path)
		.map_err(|e| format!("could not open file for GET request: {}", e))?;

	let params = TftpRequestParameters {
		server,
		local: None,
		filename: filename.clone(),
		mode: Mode::Octet,
	};

	let mut op = client.read_operation(
		params,
		FileReceiver::new(file),
		None,
		completion_logger(filename),
	).await.map_err(|e| format!("failed to set up request: {}", e))?;

	Ok(op.execute().await)
}

async fn put(
	client: &TftpClient<TokioReactor>,
	server: SocketAddr,
	file_path: PathBuf,
) -> Result<TransferStatus, String> {
	let filename = file_path.file_name()
		.ok_or_else(|| format!("'{}' has no filename", file_path.display()))?
		.to_string_lossy()
		.into_owned();

	let file = OpenOptions::new().read(true).open(&file_path)
		.map_err(|e| format!("could not open file for PUT request: {}", e))?;

	let params = TftpRequestParameters {
		server,
		local: None,
		filename: filename.clone(),
		mode: Mode::Octet,
	};

	let mut op = client.write_operation(
		params,
		FileTransmitter::new(file),
		None,
		completion_logger(filename),
	).await.map_err(|e| format!("failed to set up request: {}", e))?;

	Ok(op.execute().await)
}

///
/// Entry point of the CLI client subcommands. `base` carries the loaded
/// configuration; explicit command line flags override it.
///
pub async fn run_client(
	action: cli::ClientAction,
	opts: cli::ClientOpts,
	root: PathBuf,
	base: TransferConfig,
	cxl_token: CancellationToken,
) -> Result<(), String> {
	let cli_options = cli::parse_tftp_options(&opts);
	let mut config = base;
	if cli_options.block_size.is_some() {
		config.options.block_size = cli_options.block_size;
	}
	if cli_options.timeout.is_some() {
		config.options.timeout = cli_options.timeout;
	}
	config.options.handle_transfer_size |= cli_options.handle_transfer_size;

	let reactor = TokioReactor::new(cxl_token);
	let local_ip = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
	let client = TftpClient::new(reactor, local_ip, config);

	let req_opts = action.get_opts();
	let mut file_path = root;
	file_path.push(&req_opts.file);

	let server = SocketAddr::from((req_opts.server, req_opts.port));
	let status = match action.as_req_kind() {
		RequestKind::Rrq => get(&client, server, file_path).await?,
		RequestKind::Wrq => put(&client, server, file_path).await?,
	};

	match status {
		TransferStatus::Successful => Ok(()),
		status => Err(format!("transfer ended with status: {}", status)),
	}
}
