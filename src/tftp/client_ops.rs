//! Client-side transfer operations: RRQ (read from a server) and WRQ
//! (write to a server). Constructed by the client factory with an
//! already-bound ephemeral socket; `execute()` drives the transfer to its
//! terminal state and reports it through the completion handler.

use std::net::SocketAddr;

#[allow(unused)]
use log::{info, warn, error, debug, trace};

use crate::tftp::{
	consts, CompletionHandler, ErrorCode, Mode, OptionNegotiationHandler, RequestKind,
	TransferConfig, TransferPhase, TransferStatus,
};
use crate::tftp::block::BlockNumber;
use crate::tftp::handler::{ReceiveDataHandler, TransmitDataHandler};
use crate::tftp::operation::{self, OperationCore};
use crate::tftp::options::{self, NegotiatedOptions, Options, OptionsConfig};
use crate::tftp::packet::{TftpAck, TftpData, TftpOAck, TftpPacket};
use crate::tftp::packet::builder::TftpReqBuilder;
use crate::tftp::reactor::TftpSocket;

///
/// What a single client request consists of, next to its data handler.
///
#[derive(Debug, Clone)]
pub struct ClientOperationConfig {
	pub transfer: TransferConfig,
	pub remote: SocketAddr,
	pub filename: String,
	pub mode: Mode,
}

fn build_request(
	kind: RequestKind,
	filename: &str,
	mode: Mode,
	options: &OptionsConfig,
	transfer_size: Option<u64>,
) -> TftpPacket {
	let mut builder = TftpReqBuilder::new()
		.kind(kind)
		.mode(mode)
		.filename(filename);

	if let Some(block_size) = options.block_size {
		builder = builder.option(consts::OPT_BLOCKSIZE_IDENT, block_size);
	}
	if let Some(timeout) = options.timeout {
		builder = builder.option(consts::OPT_TIMEOUT_IDENT, timeout.as_secs());
	}
	if options.handle_transfer_size {
		/* a read queries the size with 0, a write announces it */
		builder = builder.option(consts::OPT_TRANSFERSIZE_IDENT, transfer_size.unwrap_or(0));
	}

	TftpPacket::Req(builder.build())
}

// ############################################################################
// #### READ (RRQ) ############################################################
// ############################################################################

///
/// Client read: emit RRQ, handle OACK or an immediate first DATA block,
/// then ACK the incoming data stream until a short block ends it.
///
pub struct ClientReadOperation<S: TftpSocket, H: ReceiveDataHandler> {
	core: OperationCore<S>,
	handler: H,
	config: ClientOperationConfig,
	negotiation_handler: Option<OptionNegotiationHandler>,

	receive_data_size: u16,
	last_received: BlockNumber,
}

impl<S: TftpSocket, H: ReceiveDataHandler> ClientReadOperation<S, H> {
	pub fn new(
		socket: S,
		config: ClientOperationConfig,
		handler: H,
		negotiation_handler: Option<OptionNegotiationHandler>,
		completion: CompletionHandler,
	) -> Self {
		let core = OperationCore::new(socket, config.remote, false, &config.transfer, completion);
		Self {
			core,
			handler,
			config,
			negotiation_handler,
			receive_data_size: consts::DEFAULT_BLOCK_SIZE,
			last_received: BlockNumber::default(),
		}
	}

	#[inline(always)] pub fn core(&self) -> &OperationCore<S> { &self.core }
	#[inline(always)] pub fn handler(&self) -> &H { &self.handler }

	/// Sends one final ERROR to the peer and completes as `Aborted`.
	pub async fn graceful_abort(&mut self, code: ErrorCode, message: &str) {
		self.core.graceful_abort(code, message).await;
	}

	/// Completes as `Aborted` without emitting a packet.
	pub fn abort(&mut self) {
		self.core.abort();
	}

	///
	/// Runs the transfer to completion. The completion handler fires
	/// exactly once; afterwards the operation is inert and can only be
	/// inspected.
	///
	pub async fn execute(&mut self) -> TransferStatus {
		if let Some(status) = self.core.status() {
			return status;
		}

		self.handler.reset();
		let status = self.run().await;
		self.handler.finished();
		self.core.finish(status);
		status
	}

	async fn run(&mut self) -> TransferStatus {
		self.core.set_phase(TransferPhase::Request);

		let request = build_request(
			RequestKind::Rrq,
			&self.config.filename,
			self.config.mode,
			&self.config.transfer.options,
			None,
		);
		if let Err(e) = self.core.send(&request).await {
			return self.core.receive_failure(e).await;
		}

		let first = match self.core.receive().await {
			Ok(pkt) => pkt,
			Err(e) => return self.core.receive_failure(e).await,
		};

		match first {
			TftpPacket::Data(data) => {
				/* the server ignored or never saw any options; RFC 1350
				 * defaults apply */
				self.core.set_phase(TransferPhase::DataTransfer);
				self.receive_data(Some(data)).await
			},
			TftpPacket::OAck(oack) => {
				self.core.set_phase(TransferPhase::OptionNegotiation);
				match self.negotiate(&oack).await {
					Ok(()) => {
						let ack = TftpPacket::Ack(TftpAck::new(0u16));
						if let Err(e) = self.core.send(&ack).await {
							return self.core.receive_failure(e).await;
						}

						self.core.set_phase(TransferPhase::DataTransfer);
						self.receive_data(None).await
					},
					Err(status) => status,
				}
			},
			TftpPacket::Err(err) => {
				error!("{} refused the request: {}", self.core.peer(), err);
				TransferStatus::RequestError
			},
			pkt => {
				error!("unexpected {} in response to RRQ", pkt.kind());
				self.core.terminate_with_error(
					ErrorCode::IllegalTftpOperation,
					"packet not expected",
					TransferStatus::TransferError,
				).await
			},
		}
	}

	async fn negotiate(&mut self, oack: &TftpOAck) -> Result<(), TransferStatus> {
		let accepted = options::negotiate_client(
			&self.config.transfer.options,
			&oack.options,
			self.negotiation_handler.as_mut()
				.map(|h| &mut **h as &mut (dyn FnMut(&mut Options) -> bool + Send)),
		);

		let NegotiatedOptions { block_size, timeout, transfer_size } = match accepted {
			Ok(negotiated) => negotiated,
			Err(e) => {
				error!("option negotiation with {} failed: {}", self.core.peer(), e);
				return Err(self.core.terminate_with_error(
					ErrorCode::TftpOptionRefused,
					"option negotiation failed",
					TransferStatus::OptionNegotiationError,
				).await);
			},
		};

		self.receive_data_size = block_size;
		self.core.grow_receive_buffer(block_size);
		if let Some(timeout) = timeout {
			self.core.set_timeout(timeout);
		}
		if let Some(size) = transfer_size {
			if !self.handler.received_transfer_size(size) {
				error!("announced transfer size {} refused by handler", size);
				return Err(self.core.terminate_with_error(
					ErrorCode::DiskFullOrAllocationExceeds,
					"FILE TO BIG",
					TransferStatus::TransferError,
				).await);
			}
		}

		Ok(())
	}

	async fn receive_data(&mut self, pending: Option<TftpData>) -> TransferStatus {
		operation::receive_data_loop(
			&mut self.core,
			&mut self.handler,
			self.receive_data_size,
			&mut self.last_received,
			self.config.transfer.dally,
			true,
			pending,
		).await
	}
}

// ############################################################################
// #### WRITE (WRQ) ###########################################################
// ############################################################################

///
/// Client write: emit WRQ, handle ACK 0 or OACK, then push DATA blocks
/// until a short one is acknowledged.
///
pub struct ClientWriteOperation<S: TftpSocket, H: TransmitDataHandler> {
	core: OperationCore<S>,
	handler: H,
	config: ClientOperationConfig,
	negotiation_handler: Option<OptionNegotiationHandler>,

	transmit_data_size: u16,
	last_sent_block: BlockNumber,
	last_block_sent: bool,
}

impl<S: TftpSocket, H: TransmitDataHandler> ClientWriteOperation<S, H> {
	pub fn new(
		socket: S,
		config: ClientOperationConfig,
		handler: H,
		negotiation_handler: Option<OptionNegotiationHandler>,
		completion: CompletionHandler,
	) -> Self {
		let core = OperationCore::new(socket, config.remote, false, &config.transfer, completion);
		Self {
			core,
			handler,
			config,
			negotiation_handler,
			transmit_data_size: consts::DEFAULT_BLOCK_SIZE,
			last_sent_block: BlockNumber::default(),
			last_block_sent: false,
		}
	}

	#[inline(always)] pub fn core(&self) -> &OperationCore<S> { &self.core }

	/// Sends one final ERROR to the peer and completes as `Aborted`.
	pub async fn graceful_abort(&mut self, code: ErrorCode, message: &str) {
		self.core.graceful_abort(code, message).await;
	}

	/// Completes as `Aborted` without emitting a packet.
	pub fn abort(&mut self) {
		self.core.abort();
	}

	pub async fn execute(&mut self) -> TransferStatus {
		if let Some(status) = self.core.status() {
			return status;
		}

		self.handler.reset();
		let status = self.run().await;
		self.handler.finished();
		self.core.finish(status);
		status
	}

	async fn run(&mut self) -> TransferStatus {
		self.core.set_phase(TransferPhase::Request);

		let announced_size = match self.config.transfer.options.handle_transfer_size {
			true => self.handler.requested_transfer_size(),
			false => None,
		};
		let request = build_request(
			RequestKind::Wrq,
			&self.config.filename,
			self.config.mode,
			&self.config.transfer.options,
			announced_size,
		);
		if let Err(e) = self.core.send(&request).await {
			return self.core.receive_failure(e).await;
		}

		let first = match self.core.receive().await {
			Ok(pkt) => pkt,
			Err(e) => return self.core.receive_failure(e).await,
		};

		match first {
			TftpPacket::Ack(ack) if ack.block == 0 => {
				/* no option negotiation, RFC 1350 defaults apply */
				self.core.set_phase(TransferPhase::DataTransfer);
				self.transmit_data().await
			},
			TftpPacket::OAck(oack) => {
				self.core.set_phase(TransferPhase::OptionNegotiation);
				match self.negotiate(&oack).await {
					Ok(()) => {
						self.core.set_phase(TransferPhase::DataTransfer);
						self.transmit_data().await
					},
					Err(status) => status,
				}
			},
			TftpPacket::Err(err) => {
				error!("{} refused the request: {}", self.core.peer(), err);
				TransferStatus::RequestError
			},
			pkt => {
				error!("unexpected {} in response to WRQ", pkt.kind());
				self.core.terminate_with_error(
					ErrorCode::IllegalTftpOperation,
					"packet not expected",
					TransferStatus::TransferError,
				).await
			},
		}
	}

	async fn negotiate(&mut self, oack: &TftpOAck) -> Result<(), TransferStatus> {
		let accepted = options::negotiate_client(
			&self.config.transfer.options,
			&oack.options,
			self.negotiation_handler.as_mut()
				.map(|h| &mut **h as &mut (dyn FnMut(&mut Options) -> bool + Send)),
		);

		let NegotiatedOptions { block_size, timeout, .. } = match accepted {
			Ok(negotiated) => negotiated,
			Err(e) => {
				error!("option negotiation with {} failed: {}", self.core.peer(), e);
				return Err(self.core.terminate_with_error(
					ErrorCode::TftpOptionRefused,
					"option negotiation failed",
					TransferStatus::OptionNegotiationError,
				).await);
			},
		};

		/* the echoed tsize is ours, nothing to apply */
		self.transmit_data_size = block_size;
		if let Some(timeout) = timeout {
			self.core.set_timeout(timeout);
		}

		Ok(())
	}

	async fn transmit_data(&mut self) -> TransferStatus {
		let sent = operation::send_next_data(
			&mut self.core,
			&mut self.handler,
			self.transmit_data_size,
			&mut self.last_sent_block,
			&mut self.last_block_sent,
		).await;
		if let Err(status) = sent {
			return status;
		}

		operation::transmit_data_loop(
			&mut self.core,
			&mut self.handler,
			self.transmit_data_size,
			&mut self.last_sent_block,
			&mut self.last_block_sent,
			true,
		).await
	}
}
