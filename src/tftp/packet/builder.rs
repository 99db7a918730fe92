use crate::tftp::{ErrorCode, Mode, RequestKind};
use crate::tftp::options::Options;

use super::{TftpErr, TftpOAck, TftpReq};

pub struct TftpReqBuilder {
	kind: RequestKind,
	mode: Mode,
	filename: String,
	options: Options,
}
impl TftpReqBuilder {
	pub fn new() -> Self {
		TftpReqBuilder {
			kind: RequestKind::Rrq,
			mode: Mode::Octet,
			filename: String::new(),
			options: Options::new(),
		}
	}

	#[inline] pub fn kind(mut self, kind: RequestKind) -> Self {
		self.kind = kind;
		self
	}
	#[inline] pub fn mode(mut self, mode: Mode) -> Self {
		self.mode = mode;
		self
	}

	#[inline] pub fn filename(mut self, filename: &str) -> Self {
		self.filename = filename.to_string();
		self
	}
	#[inline] pub fn option(mut self, name: &str, value: impl ToString) -> Self {
		self.options.insert(name, value);
		self
	}

	pub fn build(self) -> TftpReq {
		TftpReq {
			kind: self.kind,
			filename: self.filename,
			mode: self.mode,
			options: self.options,
		}
	}
}
impl Default for TftpReqBuilder {
	fn default() -> Self {
		Self::new()
	}
}

pub struct TftpOAckBuilder {
	options: Options,
}
impl TftpOAckBuilder {
	pub fn new() -> Self {
		Self { options: Options::new() }
	}

	#[inline] pub fn options(mut self, options: Options) -> Self {
		self.options = options;
		self
	}

	pub fn build(self) -> TftpOAck {
		TftpOAck { options: self.options }
	}
}
impl Default for TftpOAckBuilder {
	fn default() -> Self {
		Self::new()
	}
}

pub struct TftpErrorBuilder {
	code: ErrorCode,
	msg: String,
}
impl TftpErrorBuilder {
	pub fn new() -> Self {
		Self { code: ErrorCode::NotDefined, msg: String::new() }
	}

	#[inline] pub fn error_code(mut self, code: ErrorCode) -> Self {
		self.code = code;
		self
	}
	#[inline] pub fn error_msg(mut self, msg: &str) -> Self {
		self.msg = msg.to_string();
		self
	}

	pub fn build(self) -> TftpErr {
		TftpErr { code: self.code, message: self.msg }
	}
}
impl Default for TftpErrorBuilder {
	fn default() -> Self {
		Self::new()
	}
}
