use std::fmt::Display;

use crate::tftp::{consts, ErrorCode, Mode, RequestKind};
use crate::tftp::block::BlockNumber;
use crate::tftp::error::PacketError;
use crate::tftp::options::Options;
use crate::tftp::wire;

pub mod builder;

// ############################################################################
// #### PACKET KIND ###########################################################
// ############################################################################

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PacketKind {
	Rrq,
	Wrq,
	Data,
	Ack,
	Error,
	OAck,
}

impl PacketKind {
	///
	/// Recognizes the opcode of a raw buffer. Anything shorter than the
	/// opcode field or outside the six assigned opcodes is unrecognized;
	/// such buffers land in the invalid statistics bucket.
	///
	pub fn recognize(buf: &[u8]) -> Option<Self> {
		if buf.len() < 2 {
			return None;
		}
		Self::from_opcode(u16::from_be_bytes([buf[0], buf[1]]))
	}

	pub fn from_opcode(opcode: u16) -> Option<Self> {
		match opcode {
			consts::OPCODE_RRQ => Some(Self::Rrq),
			consts::OPCODE_WRQ => Some(Self::Wrq),
			consts::OPCODE_DATA => Some(Self::Data),
			consts::OPCODE_ACK => Some(Self::Ack),
			consts::OPCODE_ERROR => Some(Self::Error),
			consts::OPCODE_OACK => Some(Self::OAck),
			_ => None,
		}
	}

	pub fn opcode(&self) -> u16 {
		match self {
			Self::Rrq => consts::OPCODE_RRQ,
			Self::Wrq => consts::OPCODE_WRQ,
			Self::Data => consts::OPCODE_DATA,
			Self::Ack => consts::OPCODE_ACK,
			Self::Error => consts::OPCODE_ERROR,
			Self::OAck => consts::OPCODE_OACK,
		}
	}
}

impl Display for PacketKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", match self {
			Self::Rrq => "RRQ",
			Self::Wrq => "WRQ",
			Self::Data => "DATA",
			Self::Ack => "ACK",
			Self::Error => "ERR",
			Self::OAck => "OACK",
		})
	}
}

// ############################################################################
// #### PACKET TYPES ##########################################################
// ############################################################################

///
/// RRQ/WRQ. The first packet of every transfer, sent to the well-known
/// server port.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpReq {
	pub kind: RequestKind,
	pub filename: String,
	pub mode: Mode,
	pub options: Options,
}

impl TftpReq {
	pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
		let (at, opcode) = wire::get_u16(buf, 0)?;
		let kind = match opcode {
			consts::OPCODE_RRQ => RequestKind::Rrq,
			consts::OPCODE_WRQ => RequestKind::Wrq,
			other => return Err(PacketError::UnexpectedOpcode(other)),
		};

		let (at, filename) = wire::get_cstr(buf, at)?;
		let (at, mode) = wire::get_cstr(buf, at)?;

		Ok(Self {
			kind,
			filename: filename.to_string(),
			mode: Mode::from_name(mode),
			options: Options::parse(&buf[at..])?,
		})
	}

	pub fn encode(&self) -> Vec<u8> {
		let mode = self.mode.as_str();
		let len = 2 + self.filename.len() + 1 + mode.len() + 1 + self.options.encoded_len();
		let mut buf = vec![0u8; len];

		let at = wire::put_u16(&mut buf, 0, self.kind as u16);
		let at = wire::put_str(&mut buf, at, &self.filename);
		let at = wire::put_str(&mut buf, at + 1, mode);
		self.options.encode_into(&mut buf, at + 1);
		buf
	}
}

impl Display for TftpReq {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{} file '{}' mode {} options {}", self.kind, self.filename, self.mode, self.options)
	}
}

///
/// DATA. Carries one block; a payload shorter than the negotiated block
/// size marks the end of the transfer.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpData {
	pub block: BlockNumber,
	pub data: Vec<u8>,
}

impl TftpData {
	pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
		let (at, opcode) = wire::get_u16(buf, 0)?;
		if opcode != consts::OPCODE_DATA {
			return Err(PacketError::UnexpectedOpcode(opcode));
		}

		let (at, block) = wire::get_u16(buf, at)?;
		Ok(Self {
			block: block.into(),
			data: buf[at..].to_vec(),
		})
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut buf = vec![0u8; consts::PACKET_HEADER_SIZE + self.data.len()];

		let at = wire::put_u16(&mut buf, 0, consts::OPCODE_DATA);
		let at = wire::put_u16(&mut buf, at, self.block.value());
		buf[at..].copy_from_slice(&self.data);
		buf
	}
}

impl Display for TftpData {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "DATA block {} ({} bytes)", self.block, self.data.len())
	}
}

///
/// ACK. Exactly four bytes on the wire.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TftpAck {
	pub block: BlockNumber,
}

impl TftpAck {
	pub fn new(block: impl Into<BlockNumber>) -> Self {
		Self { block: block.into() }
	}

	pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
		let (at, opcode) = wire::get_u16(buf, 0)?;
		if opcode != consts::OPCODE_ACK {
			return Err(PacketError::UnexpectedOpcode(opcode));
		}

		let (_, block) = wire::get_u16(buf, at)?;
		if buf.len() != consts::PACKET_HEADER_SIZE {
			return Err(PacketError::MalformedPacket("ACK must be exactly 4 bytes"));
		}

		Ok(Self { block: block.into() })
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut buf = vec![0u8; consts::PACKET_HEADER_SIZE];
		let at = wire::put_u16(&mut buf, 0, consts::OPCODE_ACK);
		wire::put_u16(&mut buf, at, self.block.value());
		buf
	}
}

impl Display for TftpAck {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "ACK block {}", self.block)
	}
}

///
/// ERROR. Terminates a transfer; never acknowledged or retransmitted.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpErr {
	pub code: ErrorCode,
	pub message: String,
}

impl TftpErr {
	pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
		Self { code, message: message.into() }
	}

	pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
		let (at, opcode) = wire::get_u16(buf, 0)?;
		if opcode != consts::OPCODE_ERROR {
			return Err(PacketError::UnexpectedOpcode(opcode));
		}

		let (at, code) = wire::get_u16(buf, at)?;
		let code = ErrorCode::from_code(code)
			.ok_or(PacketError::UnknownErrorCode(code))?;

		let (at, message) = wire::get_cstr(buf, at)?;
		if at != buf.len() {
			return Err(PacketError::MalformedPacket("trailing bytes after error message"));
		}

		Ok(Self { code, message: message.to_string() })
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut buf = vec![0u8; consts::PACKET_HEADER_SIZE + self.message.len() + 1];

		let at = wire::put_u16(&mut buf, 0, consts::OPCODE_ERROR);
		let at = wire::put_u16(&mut buf, at, self.code as u16);
		wire::put_str(&mut buf, at, &self.message);
		buf
	}
}

impl Display for TftpErr {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "ERR {}: {}", self.code, self.message)
	}
}

///
/// OACK (RFC 2347). Confirms the negotiated option subset; an OACK with
/// no options is not allowed on the wire.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpOAck {
	pub options: Options,
}

impl TftpOAck {
	pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
		let (at, opcode) = wire::get_u16(buf, 0)?;
		if opcode != consts::OPCODE_OACK {
			return Err(PacketError::UnexpectedOpcode(opcode));
		}

		if buf.len() == at {
			return Err(PacketError::MalformedPacket("OACK without options"));
		}

		Ok(Self { options: Options::parse(&buf[at..])? })
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut buf = vec![0u8; 2 + self.options.encoded_len()];

		let at = wire::put_u16(&mut buf, 0, consts::OPCODE_OACK);
		self.options.encode_into(&mut buf, at);
		buf
	}
}

impl Display for TftpOAck {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "OACK options {}", self.options)
	}
}

// ############################################################################
// #### DISPATCH ##############################################################
// ############################################################################

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TftpPacket {
	Req(TftpReq),
	Data(TftpData),
	Ack(TftpAck),
	Err(TftpErr),
	OAck(TftpOAck),
}

impl TftpPacket {
	pub fn try_from_buf(buf: &[u8]) -> Result<Self, PacketError> {
		let Some(kind) = PacketKind::recognize(buf) else {
			let opcode = match buf.len() {
				0 | 1 => return Err(PacketError::UnexpectedEof),
				_ => u16::from_be_bytes([buf[0], buf[1]]),
			};
			return Err(PacketError::InvalidOpcode(opcode));
		};

		Ok(match kind {
			PacketKind::Rrq | PacketKind::Wrq => Self::Req(TftpReq::decode(buf)?),
			PacketKind::Data => Self::Data(TftpData::decode(buf)?),
			PacketKind::Ack => Self::Ack(TftpAck::decode(buf)?),
			PacketKind::Error => Self::Err(TftpErr::decode(buf)?),
			PacketKind::OAck => Self::OAck(TftpOAck::decode(buf)?),
		})
	}

	pub fn kind(&self) -> PacketKind {
		match self {
			Self::Req(req) => match req.kind {
				RequestKind::Rrq => PacketKind::Rrq,
				RequestKind::Wrq => PacketKind::Wrq,
			},
			Self::Data(_) => PacketKind::Data,
			Self::Ack(_) => PacketKind::Ack,
			Self::Err(_) => PacketKind::Error,
			Self::OAck(_) => PacketKind::OAck,
		}
	}

	pub fn encode(&self) -> Vec<u8> {
		match self {
			Self::Req(p) => p.encode(),
			Self::Data(p) => p.encode(),
			Self::Ack(p) => p.encode(),
			Self::Err(p) => p.encode(),
			Self::OAck(p) => p.encode(),
		}
	}
}

impl Display for TftpPacket {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Req(p) => p.fmt(f),
			Self::Data(p) => p.fmt(f),
			Self::Ack(p) => p.fmt(f),
			Self::Err(p) => p.fmt(f),
			Self::OAck(p) => p.fmt(f),
		}
	}
}

impl From<TftpReq> for TftpPacket {
	fn from(p: TftpReq) -> Self { Self::Req(p) }
}
impl From<TftpData> for TftpPacket {
	fn from(p: TftpData) -> Self { Self::Data(p) }
}
impl From<TftpAck> for TftpPacket {
	fn from(p: TftpAck) -> Self { Self::Ack(p) }
}
impl From<TftpErr> for TftpPacket {
	fn from(p: TftpErr) -> Self { Self::Err(p) }
}
impl From<TftpOAck> for TftpPacket {
	fn from(p: TftpOAck) -> Self { Self::OAck(p) }
}
