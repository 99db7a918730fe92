//! Data sinks and sources of transfers. An operation drives exactly one
//! of the two capabilities and never looks behind it; the stock
//! implementations below cover files, memory buffers and a discarding
//! sink.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use crate::tftp::ErrorCode;

///
/// Consumer side: server WRQ and client RRQ.
///
pub trait ReceiveDataHandler: Send {
	/// Called once before any data arrives.
	fn reset(&mut self) {}

	/// Gate for the announced `tsize`; `false` refuses the transfer.
	fn received_transfer_size(&mut self, transfer_size: u64) -> bool {
		let _ = transfer_size;
		true
	}

	/// Consumes one block payload; may be empty for the final block.
	fn received_data(&mut self, data: &[u8]) -> io::Result<()>;

	/// Called exactly once after the operation reached a terminal state.
	fn finished(&mut self) {}
}

///
/// Producer side: server RRQ and client WRQ.
///
pub trait TransmitDataHandler: Send {
	/// Called once before any data is requested.
	fn reset(&mut self) {}

	/// Transfer size for `tsize` announcement, if it can be provided.
	fn requested_transfer_size(&mut self) -> Option<u64> {
		None
	}

	///
	/// Returns the next block of at most `max_size` bytes. A short
	/// result (empty included) is the end of the stream. Retransmits
	/// never re-request a block, so successive calls may consume the
	/// underlying stream.
	///
	fn send_data(&mut self, max_size: usize) -> io::Result<Vec<u8>>;

	/// Called exactly once after the operation reached a terminal state.
	fn finished(&mut self) {}
}

/// Maps a handler failure onto the TFTP error code reported to the peer.
pub fn error_code_for_io(error: &io::Error) -> ErrorCode {
	match error.kind() {
		io::ErrorKind::NotFound => ErrorCode::FileNotFound,
		io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
		io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
		_ => ErrorCode::DiskFullOrAllocationExceeds,
	}
}

// ############################################################################
// #### STOCK HANDLERS ########################################################
// ############################################################################

///
/// In-memory data handler, usable on both sides of a transfer. When
/// receiving it collects all blocks; when transmitting it serves the
/// buffer it was created with.
///
#[derive(Debug, Default, Clone)]
pub struct MemoryFile {
	data: Vec<u8>,
	read_pos: usize,
	size_limit: Option<u64>,
}

impl MemoryFile {
	/// Empty receive buffer without a size limit.
	pub fn new() -> Self {
		Self::default()
	}

	/// Receive buffer refusing announced sizes above `limit`.
	pub fn with_size_limit(limit: u64) -> Self {
		Self { size_limit: Some(limit), ..Self::default() }
	}

	/// Transmit source serving `data`.
	pub fn from_data(data: Vec<u8>) -> Self {
		Self { data, ..Self::default() }
	}

	pub fn data(&self) -> &[u8] {
		&self.data
	}

	pub fn into_data(self) -> Vec<u8> {
		self.data
	}
}

impl ReceiveDataHandler for MemoryFile {
	fn reset(&mut self) {
		self.data.clear();
	}

	fn received_transfer_size(&mut self, transfer_size: u64) -> bool {
		match self.size_limit {
			Some(limit) => transfer_size <= limit,
			None => true,
		}
	}

	fn received_data(&mut self, data: &[u8]) -> io::Result<()> {
		self.data.extend_from_slice(data);
		Ok(())
	}
}

impl TransmitDataHandler for MemoryFile {
	fn reset(&mut self) {
		self.read_pos = 0;
	}

	fn requested_transfer_size(&mut self) -> Option<u64> {
		Some(self.data.len() as u64)
	}

	fn send_data(&mut self, max_size: usize) -> io::Result<Vec<u8>> {
		let end = (self.read_pos + max_size).min(self.data.len());
		let chunk = self.data[self.read_pos..end].to_vec();
		self.read_pos = end;
		Ok(chunk)
	}
}

///
/// Receiver that discards everything. The optional limit still gates the
/// announced transfer size, which makes it useful for probing.
///
#[derive(Debug, Default, Clone)]
pub struct NullSink {
	size_limit: Option<u64>,
	received: u64,
}

impl NullSink {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_size_limit(limit: u64) -> Self {
		Self { size_limit: Some(limit), received: 0 }
	}

	pub fn received_bytes(&self) -> u64 {
		self.received
	}
}

impl ReceiveDataHandler for NullSink {
	fn reset(&mut self) {
		self.received = 0;
	}

	fn received_transfer_size(&mut self, transfer_size: u64) -> bool {
		match self.size_limit {
			Some(limit) => transfer_size <= limit,
			None => true,
		}
	}

	fn received_data(&mut self, data: &[u8]) -> io::Result<()> {
		self.received += data.len() as u64;
		Ok(())
	}
}

///
/// File-backed receiver. The file is opened by the caller so that open
/// failures can be answered before an operation exists.
///
pub struct FileReceiver {
	writer: BufWriter<File>,
	size_limit: Option<u64>,
}

impl FileReceiver {
	pub fn new(file: File) -> Self {
		Self { writer: BufWriter::new(file), size_limit: None }
	}

	pub fn with_size_limit(file: File, limit: u64) -> Self {
		Self { writer: BufWriter::new(file), size_limit: Some(limit) }
	}
}

impl ReceiveDataHandler for FileReceiver {
	fn reset(&mut self) {
		/* a fresh transfer overwrites earlier content */
		if self.writer.get_mut().seek(SeekFrom::Start(0)).is_ok() {
			let _ = self.writer.get_mut().set_len(0);
		}
	}

	fn received_transfer_size(&mut self, transfer_size: u64) -> bool {
		match self.size_limit {
			Some(limit) => transfer_size <= limit,
			None => true,
		}
	}

	fn received_data(&mut self, data: &[u8]) -> io::Result<()> {
		self.writer.write_all(data)
	}

	fn finished(&mut self) {
		if let Err(e) = self.writer.flush() {
			log::error!("flushing received file failed: {}", e);
		}
	}
}

///
/// File-backed transmitter.
///
pub struct FileTransmitter {
	reader: BufReader<File>,
	size: Option<u64>,
}

impl FileTransmitter {
	pub fn new(file: File) -> Self {
		let size = file.metadata().ok().map(|m| m.len());
		Self { reader: BufReader::new(file), size }
	}
}

impl TransmitDataHandler for FileTransmitter {
	fn reset(&mut self) {
		let _ = self.reader.seek(SeekFrom::Start(0));
	}

	fn requested_transfer_size(&mut self) -> Option<u64> {
		self.size
	}

	fn send_data(&mut self, max_size: usize) -> io::Result<Vec<u8>> {
		let mut chunk = vec![0u8; max_size];
		let mut filled = 0;

		/* Read until the chunk is full or the stream ends; a short read
		 * from the reader alone must not end the transfer early. */
		while filled < max_size {
			match self.reader.read(&mut chunk[filled..])? {
				0 => break,
				n => filled += n,
			}
		}

		chunk.truncate(filled);
		Ok(chunk)
	}
}

// Boxed handlers are handlers as well; operations own them by value.
impl ReceiveDataHandler for Box<dyn ReceiveDataHandler> {
	fn reset(&mut self) {
		self.as_mut().reset()
	}
	fn received_transfer_size(&mut self, transfer_size: u64) -> bool {
		self.as_mut().received_transfer_size(transfer_size)
	}
	fn received_data(&mut self, data: &[u8]) -> io::Result<()> {
		self.as_mut().received_data(data)
	}
	fn finished(&mut self) {
		self.as_mut().finished()
	}
}

impl TransmitDataHandler for Box<dyn TransmitDataHandler> {
	fn reset(&mut self) {
		self.as_mut().reset()
	}
	fn requested_transfer_size(&mut self) -> Option<u64> {
		self.as_mut().requested_transfer_size()
	}
	fn send_data(&mut self, max_size: usize) -> io::Result<Vec<u8>> {
		self.as_mut().send_data(max_size)
	}
	fn finished(&mut self) {
		self.as_mut().finished()
	}
}
