//! Server-side transfer operations, constructed by the listener after it
//! decoded the initial RRQ/WRQ of a client. Each operation owns its
//! ephemeral socket; the client's TID is fixed from the first packet.

use std::net::SocketAddr;

#[allow(unused)]
use log::{info, warn, error, debug, trace};

use crate::tftp::{
	consts, CompletionHandler, ErrorCode, TransferConfig, TransferPhase, TransferStatus,
};
use crate::tftp::block::BlockNumber;
use crate::tftp::handler::{ReceiveDataHandler, TransmitDataHandler};
use crate::tftp::operation::{self, OperationCore};
use crate::tftp::options::{self, KnownClientOptions, Options};
use crate::tftp::packet::{TftpAck, TftpPacket};
use crate::tftp::packet::builder::TftpOAckBuilder;

use crate::tftp::reactor::TftpSocket;

///
/// What the listener hands to a server operation: the client's TID, its
/// parsed known options and whatever residual options the request handler
/// negotiated on its own.
///
#[derive(Debug, Clone)]
pub struct ServerOperationConfig {
	pub transfer: TransferConfig,
	pub remote: SocketAddr,
	pub client_options: KnownClientOptions,
	pub negotiated_additional: Options,
}

// ############################################################################
// #### READ (RRQ) ############################################################
// ############################################################################

///
/// Server read: the server transmits data. Responds with an OACK when any
/// option was negotiated, otherwise directly with the first DATA block.
///
pub struct ServerReadOperation<S: TftpSocket, H: TransmitDataHandler> {
	core: OperationCore<S>,
	handler: H,
	config: ServerOperationConfig,

	transmit_data_size: u16,
	last_sent_block: BlockNumber,
	last_block_sent: bool,
}

impl<S: TftpSocket, H: TransmitDataHandler> ServerReadOperation<S, H> {
	pub fn new(
		socket: S,
		config: ServerOperationConfig,
		handler: H,
		completion: CompletionHandler,
	) -> Self {
		let core = OperationCore::new(socket, config.remote, true, &config.transfer, completion);
		Self {
			core,
			handler,
			config,
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
		self.core.set_phase(TransferPhase::OptionNegotiation);

		let server_options = match self.negotiate().await {
			Ok(server_options) => server_options,
			Err(status) => return status,
		};

		if server_options.is_empty() {
			/* negotiation came up empty: answer with DATA block 1 */
			self.core.set_phase(TransferPhase::DataTransfer);
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
		} else {
			/* answer with OACK; the loop below accepts the client's
			 * ACK 0 as the acknowledgement of block 0 */
			let oack = TftpPacket::OAck(TftpOAckBuilder::new().options(server_options).build());
			if let Err(e) = self.core.send(&oack).await {
				return self.core.receive_failure(e).await;
			}
		}

		self.core.set_phase(TransferPhase::DataTransfer);
		operation::transmit_data_loop(
			&mut self.core,
			&mut self.handler,
			self.transmit_data_size,
			&mut self.last_sent_block,
			&mut self.last_block_sent,
			false,
		).await
	}

	///
	/// Server-side negotiation for a read: `blksize` and `timeout` may be
	/// clamped or dropped; a `tsize` query (value 0) is answered from the
	/// data handler and a non-zero `tsize` refuses the request.
	///
	async fn negotiate(&mut self) -> Result<Options, TransferStatus> {
		let requested = &self.config.client_options;
		let policy = &self.config.transfer.options;
		let mut server_options = self.config.negotiated_additional.clone();

		if let Some(server_max) = policy.block_size {
			if let Some(size) = options::server_blocksize_reply(server_max, requested.block_size) {
				self.transmit_data_size = size;
				server_options.insert(consts::OPT_BLOCKSIZE_IDENT, size);
			}
		}

		if let Some(server_max) = policy.timeout {
			if let Some(secs) = options::server_timeout_reply(server_max, requested.timeout) {
				self.core.set_timeout(std::time::Duration::from_secs(secs.into()));
				server_options.insert(consts::OPT_TIMEOUT_IDENT, secs);
			}
		}

		if policy.handle_transfer_size {
			match requested.transfer_size {
				Some(0) => {
					if let Some(size) = self.handler.requested_transfer_size() {
						server_options.insert(consts::OPT_TRANSFERSIZE_IDENT, size);
					}
					/* without a size from the handler the option is
					 * silently dropped */
				},
				Some(_) => {
					error!("non-zero tsize in RRQ from {}", self.core.peer());
					return Err(self.core.terminate_with_error(
						ErrorCode::TftpOptionRefused,
						"tsize must be 0 in a read request",
						TransferStatus::OptionNegotiationError,
					).await);
				},
				None => (),
			}
		}

		Ok(server_options)
	}
}

// ############################################################################
// #### WRITE (WRQ) ###########################################################
// ############################################################################

///
/// Server write: the server receives data. Responds with an OACK or a
/// plain ACK 0, then consumes DATA blocks; with dally enabled it lingers
/// after the final ACK to answer a retransmitted final block.
///
pub struct ServerWriteOperation<S: TftpSocket, H: ReceiveDataHandler> {
	core: OperationCore<S>,
	handler: H,
	config: ServerOperationConfig,

	receive_data_size: u16,
	last_received: BlockNumber,
}

impl<S: TftpSocket, H: ReceiveDataHandler> ServerWriteOperation<S, H> {
	pub fn new(
		socket: S,
		config: ServerOperationConfig,
		handler: H,
		completion: CompletionHandler,
	) -> Self {
		let core = OperationCore::new(socket, config.remote, true, &config.transfer, completion);
		Self {
			core,
			handler,
			config,
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
		self.core.set_phase(TransferPhase::OptionNegotiation);

		let server_options = match self.negotiate().await {
			Ok(server_options) => server_options,
			Err(status) => return status,
		};

		let reply = match server_options.is_empty() {
			/* negotiation came up empty: a simple ACK 0 is sent */
			true => TftpPacket::Ack(TftpAck::new(0u16)),
			false => TftpPacket::OAck(TftpOAckBuilder::new().options(server_options).build()),
		};
		if let Err(e) = self.core.send(&reply).await {
			return self.core.receive_failure(e).await;
		}

		self.core.set_phase(TransferPhase::DataTransfer);
		operation::receive_data_loop(
			&mut self.core,
			&mut self.handler,
			self.receive_data_size,
			&mut self.last_received,
			self.config.transfer.dally,
			false,
			None,
		).await
	}

	///
	/// Server-side negotiation for a write: like the read side, except
	/// that an announced `tsize` runs through the receive handler's size
	/// gate and is echoed when accepted.
	///
	async fn negotiate(&mut self) -> Result<Options, TransferStatus> {
		let requested = &self.config.client_options;
		let policy = &self.config.transfer.options;
		let mut server_options = self.config.negotiated_additional.clone();

		if let Some(server_max) = policy.block_size {
			if let Some(size) = options::server_blocksize_reply(server_max, requested.block_size) {
				self.receive_data_size = size;
				self.core.grow_receive_buffer(size);
				server_options.insert(consts::OPT_BLOCKSIZE_IDENT, size);
			}
		}

		if let Some(server_max) = policy.timeout {
			if let Some(secs) = options::server_timeout_reply(server_max, requested.timeout) {
				self.core.set_timeout(std::time::Duration::from_secs(secs.into()));
				server_options.insert(consts::OPT_TIMEOUT_IDENT, secs);
			}
		}

		if policy.handle_transfer_size {
			if let Some(size) = requested.transfer_size {
				if !self.handler.received_transfer_size(size) {
					error!("announced transfer size {} refused by handler", size);
					return Err(self.core.terminate_with_error(
						ErrorCode::DiskFullOrAllocationExceeds,
						"FILE TO BIG",
						TransferStatus::TransferError,
					).await);
				}
				server_options.insert(consts::OPT_TRANSFERSIZE_IDENT, size);
			}
		}

		Ok(server_options)
	}
}
