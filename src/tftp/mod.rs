use std::fmt::Display;
use std::time::Duration;

pub mod consts {
	pub const TFTP_LISTEN_PORT: u16 = 69;
	pub const DEFAULT_BLOCK_SIZE: u16 = 512;
	pub const DEFAULT_TIMEOUT_SECS: u64 = 2;
	pub const DEFAULT_RETRANSMIT_TRIES: u16 = 1;

	/// Opcode plus block number.
	pub const PACKET_HEADER_SIZE: usize = 4;
	pub const DEFAULT_MAX_PACKET_SIZE: usize = PACKET_HEADER_SIZE + DEFAULT_BLOCK_SIZE as usize;

	pub const OPT_BLOCKSIZE_IDENT: &str = "blksize";
	pub const OPT_TIMEOUT_IDENT: &str = "timeout";
	pub const OPT_TRANSFERSIZE_IDENT: &str = "tsize";

	pub const OPT_BLOCKSIZE_MIN: u16 = 8;
	pub const OPT_BLOCKSIZE_MAX: u16 = 65464;
	pub const OPT_TIMEOUT_MIN: u8 = 1;
	pub const OPT_TIMEOUT_MAX: u8 = 255;

	pub const OPCODE_RRQ: u16 = 1;
	pub const OPCODE_WRQ: u16 = 2;
	pub const OPCODE_DATA: u16 = 3;
	pub const OPCODE_ACK: u16 = 4;
	pub const OPCODE_ERROR: u16 = 5;
	pub const OPCODE_OACK: u16 = 6;
}

pub mod error;
pub mod wire;
pub mod block;
pub mod packet;
pub mod options;
pub mod stats;
pub mod reactor;
pub mod handler;
pub mod operation;
pub mod client_ops;
pub mod server_ops;

use options::{Options, OptionsConfig};
use packet::TftpErr;

// ############################################################################
// ############################################################################
// ############################################################################

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RequestKind {
	Rrq = consts::OPCODE_RRQ,
	Wrq = consts::OPCODE_WRQ,
}
impl Display for RequestKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", match self {
			Self::Rrq => "RRQ",
			Self::Wrq => "WRQ",
		})
	}
}

///
/// Transfer mode of a request. Only `Octet` is fully supported; the other
/// modes are decoded so that requests using them can be refused cleanly.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
	Octet,
	NetAscii,
	Mail,
	Invalid,
}
impl Mode {
	pub fn from_name(input: &str) -> Self {
		match &(input.to_ascii_lowercase())[..] {
			"octet" => Self::Octet,
			"netascii" => Self::NetAscii,
			"mail" => Self::Mail,
			_ => Self::Invalid,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Octet => "octet",
			Self::NetAscii => "netascii",
			Self::Mail => "mail",
			Self::Invalid => "invalid",
		}
	}
}
impl Display for Mode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
	NotDefined = 0,
	FileNotFound = 1,
	AccessViolation = 2,
	DiskFullOrAllocationExceeds = 3,
	IllegalTftpOperation = 4,
	UnknownTransferId = 5,
	FileAlreadyExists = 6,
	NoSuchUser = 7,
	TftpOptionRefused = 8,
}
impl ErrorCode {
	pub fn from_code(value: u16) -> Option<Self> {
		match value {
			0 => Some(Self::NotDefined),
			1 => Some(Self::FileNotFound),
			2 => Some(Self::AccessViolation),
			3 => Some(Self::DiskFullOrAllocationExceeds),
			4 => Some(Self::IllegalTftpOperation),
			5 => Some(Self::UnknownTransferId),
			6 => Some(Self::FileAlreadyExists),
			7 => Some(Self::NoSuchUser),
			8 => Some(Self::TftpOptionRefused),
			_ => None,
		}
	}

	pub fn describe(&self) -> &'static str {
		match self {
			Self::NotDefined => "Not defined",
			Self::FileNotFound => "File not found",
			Self::AccessViolation => "Access violation",
			Self::DiskFullOrAllocationExceeds => "Disk full or allocation exceeded",
			Self::IllegalTftpOperation => "Illegal TFTP operation",
			Self::UnknownTransferId => "Unknown transfer ID",
			Self::FileAlreadyExists => "File already exists",
			Self::NoSuchUser => "No such user",
			Self::TftpOptionRefused => "TFTP option refused",
		}
	}
}
impl Display for ErrorCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{} ({})", self.describe(), *self as u16)
	}
}

///
/// Terminal state of a transfer operation, delivered to the completion
/// handler exactly once.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
	Successful,
	CommunicationError,
	RequestError,
	OptionNegotiationError,
	TransferError,
	Aborted,
}
impl Display for TransferStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", match self {
			Self::Successful => "successful",
			Self::CommunicationError => "communication error",
			Self::RequestError => "request error",
			Self::OptionNegotiationError => "option negotiation error",
			Self::TransferError => "transfer error",
			Self::Aborted => "aborted",
		})
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
	Initialisation,
	Request,
	OptionNegotiation,
	DataTransfer,
	Unknown,
}
impl Display for TransferPhase {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", match self {
			Self::Initialisation => "initialisation",
			Self::Request => "request",
			Self::OptionNegotiation => "option negotiation",
			Self::DataTransfer => "data transfer",
			Self::Unknown => "unknown",
		})
	}
}

// ############################################################################
// ############################################################################
// ############################################################################

///
/// Invoked exactly once when an operation reaches a terminal state. The
/// error packet is the one sent or received last, if any.
///
pub type CompletionHandler = Box<dyn FnOnce(TransferStatus, Option<&TftpErr>) + Send>;

///
/// Client-side hook for options the engine does not negotiate itself. It
/// runs over the residual (non blksize/timeout/tsize) options of an OACK
/// and must drain every entry it accepts; `false` or a non-empty rest
/// refuses the whole negotiation.
///
pub type OptionNegotiationHandler = Box<dyn FnMut(&mut Options) -> bool + Send>;

///
/// Per-operation transfer parameters, composed by the client factory or the
/// server listener before an operation is constructed.
///
#[derive(Debug, Clone)]
pub struct TransferConfig {
	pub tftp_timeout: Duration,
	pub tftp_retries: u16,
	/// Receiver side only: linger after the final ACK to re-ACK a
	/// retransmitted final DATA block.
	pub dally: bool,
	pub options: OptionsConfig,
}
impl Default for TransferConfig {
	fn default() -> Self {
		Self {
			tftp_timeout: Duration::from_secs(consts::DEFAULT_TIMEOUT_SECS),
			tftp_retries: consts::DEFAULT_RETRANSMIT_TRIES,
			dally: false,
			options: OptionsConfig::default(),
		}
	}
}
