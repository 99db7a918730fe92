use thiserror::Error;

///
/// Decode failures of the packet codec. Every variant carries enough
/// context for the diagnostic log line; the transfer loop only branches
/// on "invalid packet" as a whole.
///
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
	#[error("unexpected end of packet")]
	UnexpectedEof,
	#[error("malformed packet: {0}")]
	MalformedPacket(&'static str),
	#[error("unexpected opcode {0}")]
	UnexpectedOpcode(u16),
	#[error("invalid opcode {0}")]
	InvalidOpcode(u16),
	#[error("missing null termination")]
	NotNullTerminated,
	#[error("invalid characters")]
	InvalidCharacters,
	#[error("unknown error code {0}")]
	UnknownErrorCode(u16),
}

///
/// Rejection reasons of option negotiation (RFC 2347).
///
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OptionError {
	#[error("option {0} was not requested")]
	NotRequested(String),
	#[error("option {name} has unacceptable value {value}")]
	Unacceptable { name: String, value: String },
	#[error("option {0} has an invalid value")]
	InvalidValue(String),
	#[error("residual options were refused")]
	ResidualRefused,
}

///
/// The engine-wide error sum. Operations never propagate these upward;
/// they are folded into a `TransferStatus` before the completion handler
/// runs. The listener and factory surface them for setup failures only.
///
#[derive(Debug, Error)]
pub enum TftpError {
	#[error("invalid packet: {0}")]
	InvalidPacket(#[from] PacketError),
	#[error("option negotiation failed: {0}")]
	OptionNegotiation(#[from] OptionError),
	#[error("communication failure: {0}")]
	Communication(#[from] std::io::Error),
	#[error("protocol violation: {0}")]
	Protocol(&'static str),
	#[error("operation aborted")]
	Aborted,
}
