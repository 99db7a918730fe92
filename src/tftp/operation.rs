//! The transfer base shared by all four operation flavors: socket
//! ownership, outbound retry, inbound dispatch with timeout, peer TID
//! binding, dally and the two abort primitives.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[allow(unused)]
use log::{info, warn, error, debug, trace};

use crate::tftp::{consts, CompletionHandler, ErrorCode, TransferConfig, TransferPhase, TransferStatus};
use crate::tftp::block::BlockNumber;
use crate::tftp::error::PacketError;
use crate::tftp::handler::{self, ReceiveDataHandler, TransmitDataHandler};
use crate::tftp::packet::{PacketKind, TftpAck, TftpData, TftpErr, TftpPacket};
use crate::tftp::packet::builder::TftpErrorBuilder;
use crate::tftp::reactor::{RecvError, TftpSocket};
use crate::tftp::stats::{self, StatKind};

///
/// Why a receive attempt did not produce a packet. `Timeout` only
/// surfaces after every retransmission attempt has been used up.
///
#[derive(Debug)]
pub enum OperationError {
	Timeout,
	Cancelled,
	Io(io::Error),
	Invalid(PacketError),
}

///
/// State shared by every transfer operation. The specializations drive
/// the packet sequencing; this core owns the socket, the raw bytes of the
/// last packet sent (retransmissions must be identical on the wire), the
/// peer binding and the terminal bookkeeping.
///
pub struct OperationCore<S: TftpSocket> {
	socket: S,
	peer: SocketAddr,
	/// For a server operation the peer TID is fixed on construction; a
	/// client floats until the first reply and then locks onto its
	/// source address.
	peer_bound: bool,

	timeout: Duration,
	retries: u16,
	recv_buf: Vec<u8>,
	last_sent: Vec<u8>,
	last_sent_kind: Option<PacketKind>,

	phase: TransferPhase,
	error_info: Option<TftpErr>,
	status: Option<TransferStatus>,
	completion: Option<CompletionHandler>,
}

impl<S: TftpSocket> OperationCore<S> {
	pub fn new(
		socket: S,
		peer: SocketAddr,
		peer_bound: bool,
		config: &TransferConfig,
		completion: CompletionHandler,
	) -> Self {
		Self {
			socket,
			peer,
			peer_bound,
			timeout: config.tftp_timeout,
			retries: config.tftp_retries,
			recv_buf: vec![0; consts::DEFAULT_MAX_PACKET_SIZE + 1],
			last_sent: Vec::new(),
			last_sent_kind: None,
			phase: TransferPhase::Initialisation,
			error_info: None,
			status: None,
			completion: Some(completion),
		}
	}

	// ########################################################################
	// ###### GETTER / SETTER #################################################
	// ########################################################################

	#[inline(always)] pub fn peer(&self) -> SocketAddr { self.peer }
	#[inline(always)] pub fn phase(&self) -> TransferPhase { self.phase }
	#[inline(always)] pub fn status(&self) -> Option<TransferStatus> { self.status }
	#[inline(always)] pub fn error_info(&self) -> Option<&TftpErr> { self.error_info.as_ref() }

	pub fn local_addr(&self) -> io::Result<SocketAddr> {
		self.socket.local_addr()
	}

	/// Cancelling this token forces the operation out of its pending
	/// receive; it then terminates as `Aborted` without a final packet.
	pub fn abort_token(&self) -> CancellationToken {
		self.socket.cancellation()
	}

	pub fn set_phase(&mut self, phase: TransferPhase) {
		trace!("transfer phase: {}", phase);
		self.phase = phase;
	}

	pub fn set_timeout(&mut self, timeout: Duration) {
		debug!("receive timeout set to {}ms", timeout.as_millis());
		self.timeout = timeout;
	}

	///
	/// Grows the receive buffer for a negotiated block size. One spare
	/// byte beyond the packet size keeps an oversized DATA detectable
	/// instead of being truncated to exactly the expected length.
	///
	pub fn grow_receive_buffer(&mut self, block_size: u16) {
		let needed = consts::PACKET_HEADER_SIZE + block_size as usize + 1;
		if needed > self.recv_buf.len() {
			self.recv_buf.resize(needed, 0);
		}
	}

	// ########################################################################
	// ###### SEND / RECEIVE ##################################################
	// ########################################################################

	///
	/// Encodes and transmits a packet and keeps its bytes for identical
	/// retransmission on timeout.
	///
	pub async fn send(&mut self, pkt: &TftpPacket) -> Result<(), OperationError> {
		let bytes = pkt.encode();
		trace!("TX: {}", pkt);

		stats::transmit().record(pkt.kind().into(), bytes.len());
		if let TftpPacket::Err(err) = pkt {
			self.error_info = Some(err.clone());
		}

		self.socket.send_to(&bytes, self.peer).await
			.map_err(OperationError::Io)?;

		self.last_sent = bytes;
		self.last_sent_kind = Some(pkt.kind());
		Ok(())
	}

	///
	/// Transmits an ERROR packet without touching the retransmission
	/// state; errors are terminal and never retried.
	///
	pub async fn send_error(&mut self, code: ErrorCode, message: &str) -> Result<(), OperationError> {
		let err = TftpErrorBuilder::new()
			.error_code(code)
			.error_msg(message)
			.build();
		let bytes = err.encode();
		debug!("TX: {}", err);

		stats::transmit().record(StatKind::Error, bytes.len());
		self.error_info = Some(err);

		self.socket.send_to(&bytes, self.peer).await
			.map_err(OperationError::Io)?;
		Ok(())
	}

	async fn resend_last(&mut self) -> Result<(), OperationError> {
		if let Some(kind) = self.last_sent_kind {
			stats::transmit().record(kind.into(), self.last_sent.len());
		}

		self.socket.send_to(&self.last_sent, self.peer).await
			.map_err(OperationError::Io)?;
		Ok(())
	}

	///
	/// Waits for the next packet from the bound peer.
	///
	/// Datagrams from other sources are answered with an unacknowledged
	/// `UnknownTransferId` error and do not disturb the running timeout.
	/// On timeout the previous packet is retransmitted byte-identically
	/// until the retry budget is used up.
	///
	pub async fn receive(&mut self) -> Result<TftpPacket, OperationError> {
		let mut deadline = Instant::now() + self.timeout;
		let mut retries_left = self.retries;

		loop {
			match self.socket.recv_from(&mut self.recv_buf, deadline).await {
				Ok((len, from)) => {
					if !self.accepts_source(from) {
						self.reject_stranger(len, from).await;
						continue;
					}

					if !self.peer_bound {
						/* first reply: the source port is the server's
						 * ephemeral TID for the rest of the transfer */
						debug!("peer TID bound to {}", from);
						self.peer = from;
						self.peer_bound = true;
					}

					match TftpPacket::try_from_buf(&self.recv_buf[..len]) {
						Ok(pkt) => {
							stats::receive().record(pkt.kind().into(), len);
							trace!("RX: {}", pkt);
							if let TftpPacket::Err(ref err) = pkt {
								self.error_info = Some(err.clone());
							}
							return Ok(pkt);
						},
						Err(e) => {
							stats::receive().record(StatKind::Invalid, len);
							return Err(OperationError::Invalid(e));
						},
					}
				},
				Err(RecvError::Timeout) => {
					if retries_left == 0 {
						return Err(OperationError::Timeout);
					}
					retries_left -= 1;

					debug!("receive timeout, retransmitting ({} tries left)", retries_left);
					self.resend_last().await?;
					deadline = Instant::now() + self.timeout;
				},
				Err(RecvError::Cancelled) => return Err(OperationError::Cancelled),
				Err(RecvError::Io(e)) => return Err(OperationError::Io(e)),
			}
		}
	}

	fn accepts_source(&self, from: SocketAddr) -> bool {
		match self.peer_bound {
			true => from == self.peer,
			/* request sent to the well-known port: any port of the
			 * server address may answer */
			false => from.ip() == self.peer.ip(),
		}
	}

	async fn reject_stranger(&mut self, len: usize, from: SocketAddr) {
		warn!("dropping packet from unknown TID {}", from);

		match PacketKind::recognize(&self.recv_buf[..len]) {
			Some(kind) => stats::receive().record(kind.into(), len),
			None => stats::receive().record(StatKind::Invalid, len),
		}

		let err = TftpErrorBuilder::new()
			.error_code(ErrorCode::UnknownTransferId)
			.error_msg("unknown transfer id")
			.build();
		let bytes = err.encode();
		stats::transmit().record(StatKind::Error, bytes.len());

		if let Err(e) = self.socket.send_to(&bytes, from).await {
			debug!("error reply to {} failed: {}", from, e);
		}
	}

	///
	/// Post-transfer linger of the receiving side: when the final ACK got
	/// lost, the peer retransmits its final DATA block, which is answered
	/// with the identical ACK once more. Everything else is dropped.
	///
	pub async fn dally(&mut self, final_block: BlockNumber) {
		debug!("dallying for {}ms after final ACK", self.timeout.as_millis());
		let mut deadline = Instant::now() + self.timeout;

		loop {
			match self.socket.recv_from(&mut self.recv_buf, deadline).await {
				Ok((len, from)) => {
					if from != self.peer {
						self.reject_stranger(len, from).await;
						continue;
					}

					match TftpPacket::try_from_buf(&self.recv_buf[..len]) {
						Ok(TftpPacket::Data(TftpData { block, .. })) if block == final_block => {
							stats::receive().record(StatKind::Data, len);
							debug!("final DATA retransmitted, re-ACKing");
							if self.resend_last().await.is_err() {
								return;
							}
							deadline = Instant::now() + self.timeout;
						},
						Ok(pkt) => {
							stats::receive().record(pkt.kind().into(), len);
							trace!("ignoring {} while dallying", pkt);
						},
						Err(_) => stats::receive().record(StatKind::Invalid, len),
					}
				},
				Err(_) => return,
			}
		}
	}

	// ########################################################################
	// ###### TERMINATION #####################################################
	// ########################################################################

	///
	/// Marks the operation as terminated and runs the completion handler.
	/// Statistics are already up to date at this point; the first call
	/// wins and later calls are ignored.
	///
	pub fn finish(&mut self, status: TransferStatus) {
		if self.status.is_some() {
			return;
		}
		self.status = Some(status);

		match status {
			TransferStatus::Successful => info!("transfer with {} finished: {}", self.peer, status),
			_ => error!("transfer with {} finished: {}", self.peer, status),
		}

		if let Some(completion) = self.completion.take() {
			completion(status, self.error_info.as_ref());
		}
	}

	///
	/// Sends a final ERROR and hands the terminal status back to the
	/// operation, which runs its handler teardown before `finish()`.
	///
	pub async fn terminate_with_error(
		&mut self,
		code: ErrorCode,
		message: &str,
		status: TransferStatus,
	) -> TransferStatus {
		let _ = self.send_error(code, message).await;
		status
	}

	///
	/// Maps a failed receive onto its terminal status: exhausted retries
	/// and socket failures are communication errors, cancellation is an
	/// abort and an undecodable packet is answered with
	/// `IllegalTftpOperation` before terminating.
	///
	pub async fn receive_failure(&mut self, error: OperationError) -> TransferStatus {
		match error {
			OperationError::Timeout => {
				error!("no response from {} within {} tries", self.peer, self.retries + 1);
				TransferStatus::CommunicationError
			},
			OperationError::Cancelled => TransferStatus::Aborted,
			OperationError::Io(e) => {
				error!("transfer socket failure: {}", e);
				TransferStatus::CommunicationError
			},
			OperationError::Invalid(e) => {
				error!("invalid packet from {}: {}", self.peer, e);
				self.terminate_with_error(
					ErrorCode::IllegalTftpOperation,
					"invalid packet",
					TransferStatus::TransferError,
				).await
			},
		}
	}

	///
	/// Graceful abort: one final ERROR to the peer, then `Aborted`. A
	/// failure to transmit that last packet demotes the status to
	/// `CommunicationError`.
	///
	pub async fn graceful_abort(&mut self, code: ErrorCode, message: &str) {
		match self.send_error(code, message).await {
			Ok(()) => self.finish(TransferStatus::Aborted),
			Err(_) => self.finish(TransferStatus::CommunicationError),
		}
	}

	/// Forced abort: no final packet, the socket is torn down as is.
	pub fn abort(&mut self) {
		self.socket.cancellation().cancel();
		self.finish(TransferStatus::Aborted);
	}
}

// ############################################################################
// #### SHARED TRANSFER LOOPS #################################################
// ############################################################################

///
/// Data-receive loop of the two receiving flavors (client RRQ, server
/// WRQ). `pending` carries a DATA packet that arrived before the loop was
/// entered, e.g. the first block of a transfer without negotiation.
///
pub(crate) async fn receive_data_loop<S, H>(
	core: &mut OperationCore<S>,
	handler: &mut H,
	receive_data_size: u16,
	last_received: &mut BlockNumber,
	dally: bool,
	reack_stray_oack: bool,
	mut pending: Option<TftpData>,
) -> TransferStatus
where
	S: TftpSocket,
	H: ReceiveDataHandler,
{
	loop {
		let data = match pending.take() {
			Some(data) => data,
			None => match core.receive().await {
				Ok(TftpPacket::Data(data)) => data,
				Ok(TftpPacket::OAck(_)) if reack_stray_oack && *last_received == 0 => {
					/* our ACK 0 got lost and the server retransmitted
					 * its OACK: acknowledge it once more */
					debug!("OACK retransmitted, re-ACKing");
					let ack = TftpPacket::Ack(TftpAck::new(*last_received));
					if let Err(e) = core.send(&ack).await {
						return core.receive_failure(e).await;
					}
					continue;
				},
				Ok(TftpPacket::Err(err)) => {
					error!("peer terminated the transfer: {}", err);
					return TransferStatus::TransferError;
				},
				Ok(pkt) => {
					error!("unexpected {} while waiting for DATA", pkt.kind());
					return core.terminate_with_error(
						ErrorCode::IllegalTftpOperation,
						"packet not expected",
						TransferStatus::TransferError,
					).await;
				},
				Err(e) => return core.receive_failure(e).await,
			},
		};

		/* retry of the last block: only acknowledge it again, the
		 * handler must not see the payload twice */
		if data.block == *last_received {
			debug!("DATA {} retransmitted, re-ACKing", data.block);
			let ack = TftpPacket::Ack(TftpAck::new(*last_received));
			if let Err(e) = core.send(&ack).await {
				return core.receive_failure(e).await;
			}
			continue;
		}

		if data.block != last_received.next() {
			error!("DATA {} does not follow block {}", data.block, last_received);
			return core.terminate_with_error(
				ErrorCode::IllegalTftpOperation,
				"block number not expected",
				TransferStatus::TransferError,
			).await;
		}

		if data.data.len() > receive_data_size as usize {
			error!("DATA {} carries {} bytes, {} negotiated", data.block, data.data.len(), receive_data_size);
			return core.terminate_with_error(
				ErrorCode::IllegalTftpOperation,
				"too much data",
				TransferStatus::TransferError,
			).await;
		}

		if let Err(e) = handler.received_data(&data.data) {
			error!("data handler refused block {}: {}", data.block, e);
			let code = handler::error_code_for_io(&e);
			return core.terminate_with_error(code, &e.to_string(), TransferStatus::TransferError).await;
		}

		last_received.advance();
		let ack = TftpPacket::Ack(TftpAck::new(*last_received));
		if let Err(e) = core.send(&ack).await {
			return core.receive_failure(e).await;
		}

		/* a short block is the final one */
		if data.data.len() < receive_data_size as usize {
			if dally {
				core.dally(*last_received).await;
			}
			return TransferStatus::Successful;
		}
	}
}

///
/// Fetches the next block from the handler and transmits it. A short
/// block flags the end of the stream; the loop below terminates once it
/// is acknowledged.
///
pub(crate) async fn send_next_data<S, H>(
	core: &mut OperationCore<S>,
	handler: &mut H,
	transmit_data_size: u16,
	last_sent_block: &mut BlockNumber,
	last_block_sent: &mut bool,
) -> Result<(), TransferStatus>
where
	S: TftpSocket,
	H: TransmitDataHandler,
{
	let chunk = match handler.send_data(transmit_data_size as usize) {
		Ok(chunk) => chunk,
		Err(e) => {
			error!("data handler failed: {}", e);
			let code = handler::error_code_for_io(&e);
			return Err(core.terminate_with_error(code, &e.to_string(), TransferStatus::TransferError).await);
		},
	};

	if chunk.len() < transmit_data_size as usize {
		*last_block_sent = true;
	}

	last_sent_block.advance();
	let data = TftpPacket::Data(TftpData { block: *last_sent_block, data: chunk });
	if let Err(e) = core.send(&data).await {
		return Err(core.receive_failure(e).await);
	}
	Ok(())
}

///
/// ACK-driven transmit loop of the two sending flavors (client WRQ,
/// server RRQ). Callers prime it either by sending the first DATA block
/// or by leaving an OACK as the pending retransmission, in which case the
/// first matching ACK carries block 0.
///
pub(crate) async fn transmit_data_loop<S, H>(
	core: &mut OperationCore<S>,
	handler: &mut H,
	transmit_data_size: u16,
	last_sent_block: &mut BlockNumber,
	last_block_sent: &mut bool,
	ignore_stray_oack: bool,
) -> TransferStatus
where
	S: TftpSocket,
	H: TransmitDataHandler,
{
	loop {
		match core.receive().await {
			Ok(TftpPacket::Ack(ack)) => {
				if ack.block == *last_sent_block {
					if *last_block_sent {
						return TransferStatus::Successful;
					}

					let sent = send_next_data(
						core, handler, transmit_data_size, last_sent_block, last_block_sent,
					).await;
					if let Err(status) = sent {
						return status;
					}
					continue;
				}

				if ack.block == last_sent_block.previous() {
					/* delayed duplicate; answering it would double every
					 * following DATA (Sorcerer's Apprentice Syndrome) */
					debug!("ignoring duplicate ACK {}", ack.block);
					continue;
				}

				error!("ACK {} does not match DATA {}", ack.block, last_sent_block);
				return core.terminate_with_error(
					ErrorCode::IllegalTftpOperation,
					"block number not expected",
					TransferStatus::TransferError,
				).await;
			},
			Ok(TftpPacket::OAck(_)) if ignore_stray_oack && *last_sent_block == 1 => {
				/* the first DATA block is in flight but got lost; the
				 * retransmit timer will resend it */
				debug!("ignoring retransmitted OACK");
				continue;
			},
			Ok(TftpPacket::Err(err)) => {
				error!("peer terminated the transfer: {}", err);
				return TransferStatus::TransferError;
			},
			Ok(pkt) => {
				error!("unexpected {} while waiting for ACK", pkt.kind());
				return core.terminate_with_error(
					ErrorCode::IllegalTftpOperation,
					"packet not expected",
					TransferStatus::TransferError,
				).await;
			},
			Err(e) => return core.receive_failure(e).await,
		}
	}
}
