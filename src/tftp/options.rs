use std::time::Duration;

use crate::tftp::consts;
use crate::tftp::error::{OptionError, PacketError};
use crate::tftp::wire;

// ############################################################################
// #### OPTION LIST ###########################################################
// ############################################################################

///
/// Option list of RRQ/WRQ/OACK packets.
///
/// Names are matched case-insensitively and stored lower-case, the way
/// they are emitted on the wire. Iteration and encoding preserve the
/// insertion order.
///
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
	entries: Vec<(String, String)>,
}

impl Options {
	pub fn new() -> Self {
		Self::default()
	}

	///
	/// Parses a raw `(name NUL value NUL)*` region, e.g. the tail of a
	/// request packet or the body of an OACK.
	///
	pub fn parse(raw: &[u8]) -> Result<Self, PacketError> {
		let mut options = Self::new();
		let mut at = 0;

		while at < raw.len() {
			let (next, name) = wire::get_cstr(raw, at)?;
			let (next, value) = wire::get_cstr(raw, next)?;

			if name.is_empty() {
				return Err(PacketError::MalformedPacket("empty option name"));
			}

			options.insert(name, value);
			at = next;
		}

		Ok(options)
	}

	/// Inserts or replaces an option, keeping the position of a replaced
	/// entry.
	pub fn insert(&mut self, name: &str, value: impl ToString) {
		let name = name.to_ascii_lowercase();
		let value = value.to_string();

		match self.entries.iter_mut().find(|(n, _)| *n == name) {
			Some(entry) => entry.1 = value,
			None => self.entries.push((name, value)),
		}
	}

	pub fn get(&self, name: &str) -> Option<&str> {
		self.entries.iter()
			.find(|(n, _)| n.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}

	pub fn remove(&mut self, name: &str) -> Option<String> {
		let at = self.entries.iter().position(|(n, _)| n.eq_ignore_ascii_case(name))?;
		Some(self.entries.remove(at).1)
	}

	#[inline(always)] pub fn is_empty(&self) -> bool { self.entries.is_empty() }
	#[inline(always)] pub fn len(&self) -> usize { self.entries.len() }

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
	}

	pub fn encoded_len(&self) -> usize {
		self.entries.iter().map(|(n, v)| n.len() + v.len() + 2).sum()
	}

	/// Writes the raw option region at `at`; the buffer must have room
	/// for `encoded_len()` bytes there.
	pub fn encode_into(&self, buf: &mut [u8], at: usize) -> usize {
		let mut at = at;
		for (name, value) in self.entries.iter() {
			at = wire::put_str(buf, at, name);
			buf[at] = 0;
			at = wire::put_str(buf, at + 1, value);
			buf[at] = 0;
			at += 1;
		}
		at
	}
}

impl std::fmt::Display for Options {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		if self.entries.is_empty() {
			return write!(f, "(none)");
		}
		for (name, value) in self.entries.iter() {
			write!(f, "{{{}:{}}};", name, value)?;
		}
		Ok(())
	}
}

// ############################################################################
// #### NEGOTIATION ###########################################################
// ############################################################################

///
/// Per-endpoint negotiation policy. On the client the values are what is
/// requested; on the server they are the acceptable maxima.
///
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionsConfig {
	pub handle_transfer_size: bool,
	pub block_size: Option<u16>,
	pub timeout: Option<Duration>,
}

impl OptionsConfig {
	pub fn negotiates_anything(&self) -> bool {
		self.handle_transfer_size || self.block_size.is_some() || self.timeout.is_some()
	}
}

///
/// The three known option values of a request, parsed out of the raw
/// option list. Values that do not parse as their integer type are
/// treated as absent.
///
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KnownClientOptions {
	pub block_size: Option<u16>,
	pub timeout: Option<u8>,
	pub transfer_size: Option<u64>,
}

///
/// Splits a request option list into the three known options and the
/// residual rest. The rest is what a request handler may negotiate on
/// its own behalf.
///
pub fn split_known(options: &Options) -> (KnownClientOptions, Options) {
	let mut residual = options.clone();
	let known = KnownClientOptions {
		block_size: residual.remove(consts::OPT_BLOCKSIZE_IDENT)
			.and_then(|v| v.parse().ok()),
		timeout: residual.remove(consts::OPT_TIMEOUT_IDENT)
			.and_then(|v| v.parse().ok()),
		transfer_size: residual.remove(consts::OPT_TRANSFERSIZE_IDENT)
			.and_then(|v| v.parse().ok()),
	};

	(known, residual)
}

///
/// Outcome of a successful client-side negotiation.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedOptions {
	pub block_size: u16,
	pub timeout: Option<Duration>,
	pub transfer_size: Option<u64>,
}

impl Default for NegotiatedOptions {
	fn default() -> Self {
		Self {
			block_size: consts::DEFAULT_BLOCK_SIZE,
			timeout: None,
			transfer_size: None,
		}
	}
}

///
/// Applies the client-side decision rules to a received OACK.
///
/// Every known option the server echoes must have been requested and must
/// lie inside the client's accepted range. Residual options are offered
/// to `additional`; without a handler, any residual refuses the OACK.
///
pub fn negotiate_client(
	requested: &OptionsConfig,
	oack_options: &Options,
	additional: Option<&mut (dyn FnMut(&mut Options) -> bool + Send)>,
) -> Result<NegotiatedOptions, OptionError> {
	let mut residual = oack_options.clone();
	let mut negotiated = NegotiatedOptions::default();

	if let Some(value) = residual.remove(consts::OPT_BLOCKSIZE_IDENT) {
		let Some(limit) = requested.block_size else {
			return Err(OptionError::NotRequested(consts::OPT_BLOCKSIZE_IDENT.into()));
		};
		let size: u16 = value.parse()
			.map_err(|_| OptionError::InvalidValue(consts::OPT_BLOCKSIZE_IDENT.into()))?;

		/* the server may lower our request, never raise it */
		if size < consts::OPT_BLOCKSIZE_MIN || size > limit {
			return Err(OptionError::Unacceptable {
				name: consts::OPT_BLOCKSIZE_IDENT.into(),
				value,
			});
		}
		negotiated.block_size = size;
	}

	if let Some(value) = residual.remove(consts::OPT_TIMEOUT_IDENT) {
		let Some(limit) = requested.timeout else {
			return Err(OptionError::NotRequested(consts::OPT_TIMEOUT_IDENT.into()));
		};
		let secs: u8 = value.parse()
			.map_err(|_| OptionError::InvalidValue(consts::OPT_TIMEOUT_IDENT.into()))?;

		if secs < consts::OPT_TIMEOUT_MIN || u64::from(secs) > limit.as_secs() {
			return Err(OptionError::Unacceptable {
				name: consts::OPT_TIMEOUT_IDENT.into(),
				value,
			});
		}
		negotiated.timeout = Some(Duration::from_secs(secs.into()));
	}

	if let Some(value) = residual.remove(consts::OPT_TRANSFERSIZE_IDENT) {
		if !requested.handle_transfer_size {
			return Err(OptionError::NotRequested(consts::OPT_TRANSFERSIZE_IDENT.into()));
		}
		let size: u64 = value.parse()
			.map_err(|_| OptionError::InvalidValue(consts::OPT_TRANSFERSIZE_IDENT.into()))?;
		negotiated.transfer_size = Some(size);
	}

	if !residual.is_empty() {
		let accepted = match additional {
			Some(handler) => handler(&mut residual) && residual.is_empty(),
			None => false,
		};
		if !accepted {
			return Err(OptionError::ResidualRefused);
		}
	}

	Ok(negotiated)
}

///
/// Server-side `blksize` reply: the minimum of the client's wish and the
/// server's maximum, clamped into the RFC 2348 range. A client value
/// outside that range drops the option instead of failing the request.
///
pub fn server_blocksize_reply(server_max: u16, client: Option<u16>) -> Option<u16> {
	let client = client?;
	if client < consts::OPT_BLOCKSIZE_MIN || client > consts::OPT_BLOCKSIZE_MAX {
		return None;
	}

	Some(client.min(server_max).clamp(consts::OPT_BLOCKSIZE_MIN, consts::OPT_BLOCKSIZE_MAX))
}

///
/// Server-side `timeout` reply: the client's value is echoed when it does
/// not exceed the server's maximum, otherwise the option is omitted.
///
pub fn server_timeout_reply(server_max: Duration, client: Option<u8>) -> Option<u8> {
	let client = client?;
	if client < consts::OPT_TIMEOUT_MIN || u64::from(client) > server_max.as_secs() {
		return None;
	}

	Some(client)
}
