//! The server listener: binds the well-known port, demultiplexes incoming
//! requests and spawns one transfer operation with its own ephemeral
//! socket per accepted request. What happens with a request is decided by
//! a user-supplied request handler; a filesystem-backed one is provided
//! for the CLI front-end.

use std::fs::OpenOptions;
use std::io;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

#[allow(unused)]
use log::{info, warn, error, debug, trace};

use crate::tftp::{consts, CompletionHandler, ErrorCode, Mode, RequestKind, TransferConfig};
use crate::tftp::error::TftpError;
use crate::tftp::handler::{FileReceiver, FileTransmitter, ReceiveDataHandler, TransmitDataHandler};
use crate::tftp::options::{self, KnownClientOptions, Options};
use crate::tftp::packet::{PacketKind, TftpReq};
use crate::tftp::packet::builder::TftpErrorBuilder;
use crate::tftp::reactor::{Reactor, RecvError, TftpSocket};
use crate::tftp::server_ops::{ServerOperationConfig, ServerReadOperation, ServerWriteOperation};
use crate::tftp::stats::{self, StatKind};

/// Re-armed periodically; shutdown happens through cancellation.
const LISTEN_INTERVAL: Duration = Duration::from_secs(600);

const REQUEST_BUFFER_SIZE: usize = 2048;

// ############################################################################
// ############################################################################
// ############################################################################

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub listen: SocketAddr,
	/// Transfer parameters handed to every spawned operation.
	pub transfer: TransferConfig,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			listen: SocketAddr::from(([0, 0, 0, 0], consts::TFTP_LISTEN_PORT)),
			transfer: TransferConfig::default(),
		}
	}
}

///
/// A decoded first packet, as presented to the request handler. The
/// engine has already separated the options it negotiates itself from the
/// residual ones; negotiating the residual is the handler's business.
///
#[derive(Debug)]
pub struct TftpRequest {
	pub remote: SocketAddr,
	pub kind: RequestKind,
	pub filename: String,
	pub mode: Mode,
	pub options: KnownClientOptions,
	pub residual: Options,
}

///
/// The request handler's verdict on a request.
///
pub enum RequestAction {
	/// Serve the file through the given source (server read, RRQ).
	Read {
		handler: Box<dyn TransmitDataHandler>,
		/// Residual options the handler agreed to; echoed in the OACK.
		negotiated: Options,
		completion: Option<CompletionHandler>,
	},
	/// Store the upload through the given sink (server write, WRQ).
	Write {
		handler: Box<dyn ReceiveDataHandler>,
		negotiated: Options,
		completion: Option<CompletionHandler>,
	},
	/// Refuse with an ERROR packet from the well-known port.
	Reject { code: ErrorCode, message: String },
	/// Drop the request without any reply.
	Ignore,
}

pub type RequestHandler = Box<dyn FnMut(&TftpRequest) -> RequestAction + Send + Sync>;

// ############################################################################
// ############################################################################
// ############################################################################

pub struct TftpServer<R: Reactor> {
	reactor: R,
	config: ServerConfig,
	request_handler: RequestHandler,
}

impl<R: Reactor> TftpServer<R> {
	pub fn new(reactor: R, config: ServerConfig, request_handler: RequestHandler) -> Self {
		Self { reactor, config, request_handler }
	}

	///
	/// Serves requests until the reactor's cancellation token fires.
	/// Every accepted request runs as its own task on an ephemeral
	/// socket; the listener socket only ever sees first packets.
	///
	pub async fn run(&mut self) -> Result<(), TftpError> {
		let mut socket = self.reactor.bind(self.config.listen).await?;
		info!("TFTP server listening on {}", socket.local_addr().map_err(TftpError::Communication)?);

		let mut buf = vec![0u8; REQUEST_BUFFER_SIZE];
		loop {
			match socket.recv_from(&mut buf, Instant::now() + LISTEN_INTERVAL).await {
				Ok((len, remote)) => {
					debug!("received packet ({} bytes) from {}", len, remote);
					self.dispatch(&mut socket, &buf[..len], remote).await;
				},
				Err(RecvError::Timeout) => (),
				Err(RecvError::Cancelled) => {
					warn!("server stopped by cancellation");
					return Ok(());
				},
				Err(RecvError::Io(e)) => return Err(e.into()),
			}
		}
	}

	async fn dispatch(&mut self, socket: &mut R::Socket, raw: &[u8], remote: SocketAddr) {
		let req = match TftpReq::decode(raw) {
			Ok(req) => {
				let kind = match req.kind {
					RequestKind::Rrq => StatKind::Rrq,
					RequestKind::Wrq => StatKind::Wrq,
				};
				stats::receive().record(kind, raw.len());
				req
			},
			Err(e) => {
				/* everything else than RRQ/WRQ is illegal on the
				 * well-known port */
				stats::receive().record(StatKind::Invalid, raw.len());
				error!("no TFTP request from {}: {}", remote, e);
				error_reply(socket, remote, ErrorCode::IllegalTftpOperation, "only TFTP requests accepted").await;
				return;
			},
		};

		if req.mode == Mode::Invalid {
			error_reply(socket, remote, ErrorCode::IllegalTftpOperation, "unknown transfer mode").await;
			return;
		}

		let (known, residual) = options::split_known(&req.options);
		let request = TftpRequest {
			remote,
			kind: req.kind,
			filename: req.filename,
			mode: req.mode,
			options: known,
			residual,
		};
		info!("{} for '{}' from {}", request.kind, request.filename, remote);

		match (self.request_handler)(&request) {
			RequestAction::Read { handler, negotiated, completion } => {
				if let Err(e) = self.spawn_read(&request, handler, negotiated, completion).await {
					error!("cannot serve {}: {}", remote, e);
					error_reply(socket, remote, ErrorCode::NotDefined, "transfer setup failed").await;
				}
			},
			RequestAction::Write { handler, negotiated, completion } => {
				if let Err(e) = self.spawn_write(&request, handler, negotiated, completion).await {
					error!("cannot serve {}: {}", remote, e);
					error_reply(socket, remote, ErrorCode::NotDefined, "transfer setup failed").await;
				}
			},
			RequestAction::Reject { code, message } => {
				info!("request from {} rejected: {}", remote, message);
				error_reply(socket, remote, code, &message).await;
			},
			RequestAction::Ignore => debug!("request from {} ignored", remote),
		}
	}

	async fn operation_config(&self, request: &TftpRequest, negotiated: Options)
		-> io::Result<(R::Socket, ServerOperationConfig)>
	{
		/* own ephemeral TID per transfer, next to the well-known port */
		let local = SocketAddr::new(self.config.listen.ip(), 0);
		let socket = self.reactor.bind(local).await?;

		Ok((socket, ServerOperationConfig {
			transfer: self.config.transfer.clone(),
			remote: request.remote,
			client_options: request.options,
			negotiated_additional: negotiated,
		}))
	}

	async fn spawn_read(
		&self,
		request: &TftpRequest,
		handler: Box<dyn TransmitDataHandler>,
		negotiated: Options,
		completion: Option<CompletionHandler>,
	) -> io::Result<()> {
		let (socket, config) = self.operation_config(request, negotiated).await?;
		let completion = completion.unwrap_or_else(|| Box::new(|_, _| ()));

		let mut op = ServerReadOperation::new(socket, config, handler, completion);
		tokio::spawn(async move { op.execute().await });
		Ok(())
	}

	async fn spawn_write(
		&self,
		request: &TftpRequest,
		handler: Box<dyn ReceiveDataHandler>,
		negotiated: Options,
		completion: Option<CompletionHandler>,
	) -> io::Result<()> {
		let (socket, config) = self.operation_config(request, negotiated).await?;
		let completion = completion.unwrap_or_else(|| Box::new(|_, _| ()));

		let mut op = ServerWriteOperation::new(socket, config, handler, completion);
		tokio::spawn(async move { op.execute().await });
		Ok(())
	}
}

///
/// One-shot ERROR datagram outside of any operation, sent from the
/// well-known socket. Used for refused and malformed first packets.
///
async fn error_reply<S: TftpSocket>(socket: &mut S, remote: SocketAddr, code: ErrorCode, message: &str) {
	let err = TftpErrorBuilder::new()
		.error_code(code)
		.error_msg(message)
		.build();
	let bytes = err.encode();
	stats::transmit().record(PacketKind::Error.into(), bytes.len());

	if let Err(e) = socket.send_to(&bytes, remote).await {
		error!("error reply to {} failed: {}", remote, e);
	}
}

// ############################################################################
// #### FILESYSTEM BACKEND ####################################################
// ############################################################################

///
/// Filename check helper for request handlers: resolves a requested name
/// inside `root` and refuses absolute names and anything that would
/// escape the root. Everything beyond that (case rules, symlinks) is the
/// host application's policy.
///
pub fn resolve_path(root: &Path, filename: &str) -> Option<PathBuf> {
	if filename.is_empty() || filename.contains('\0') {
		return None;
	}

	let relative = Path::new(filename);
	if relative.is_absolute() {
		return None;
	}

	let mut resolved = root.to_path_buf();
	for component in relative.components() {
		match component {
			Component::Normal(part) => resolved.push(part),
			Component::CurDir => (),
			_ => return None,
		}
	}

	Some(resolved)
}

///
/// The stock request handler of the CLI server: serves and stores files
/// below a root directory, octet mode only, residual options ignored.
///
pub fn fs_request_handler(root: PathBuf) -> RequestHandler {
	Box::new(move |request: &TftpRequest| {
		if request.mode != Mode::Octet {
			return RequestAction::Reject {
				code: ErrorCode::IllegalTftpOperation,
				message: format!("{} mode is not supported", request.mode),
			};
		}

		let Some(path) = resolve_path(&root, &request.filename) else {
			return RequestAction::Reject {
				code: ErrorCode::AccessViolation,
				message: "invalid filename".to_string(),
			};
		};

		let mut open_options = OpenOptions::new();
		match request.kind {
			RequestKind::Rrq => open_options.read(true),
			RequestKind::Wrq => open_options.create(true).truncate(true).write(true),
		};

		let file = match open_options.open(&path) {
			Ok(file) => file,
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				return RequestAction::Reject {
					code: ErrorCode::FileNotFound,
					message: String::new(),
				};
			},
			Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
				return RequestAction::Reject {
					code: ErrorCode::AccessViolation,
					message: String::new(),
				};
			},
			Err(e) => {
				return RequestAction::Reject {
					code: ErrorCode::DiskFullOrAllocationExceeds,
					message: e.to_string(),
				};
			},
		};

		match request.kind {
			RequestKind::Rrq => RequestAction::Read {
				handler: Box::new(FileTransmitter::new(file)),
				negotiated: Options::new(),
				completion: None,
			},
			RequestKind::Wrq => RequestAction::Write {
				handler: Box::new(FileReceiver::new(file)),
				negotiated: Options::new(),
				completion: None,
			},
		}
	})
}
