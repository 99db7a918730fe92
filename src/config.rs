//! Key/value configuration of the engine. The recognized keys cover the
//! transfer parameters and the option negotiation policy; unknown keys
//! are ignored so that the same store can carry host-application
//! settings.

use std::fmt::Display;
use std::time::Duration;

use thiserror::Error;

use crate::tftp::consts;
use crate::tftp::options::OptionsConfig;
use crate::tftp::TransferConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
	#[error("invalid value '{value}' for key '{key}'")]
	InvalidValue { key: String, value: String },
}

fn invalid(key: &str, value: &str) -> ConfigError {
	ConfigError::InvalidValue { key: key.to_string(), value: value.to_string() }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
	match value {
		"true" | "1" => Ok(true),
		"false" | "0" => Ok(false),
		_ => Err(invalid(key, value)),
	}
}

///
/// Engine configuration as loaded from a key/value store.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpConfig {
	pub timeout: Duration,
	pub retries: u16,
	pub port: u16,
	pub dally: bool,
	pub options: OptionsConfig,
}

impl Default for TftpConfig {
	fn default() -> Self {
		Self {
			timeout: Duration::from_secs(consts::DEFAULT_TIMEOUT_SECS),
			retries: consts::DEFAULT_RETRANSMIT_TRIES,
			port: consts::TFTP_LISTEN_PORT,
			dally: false,
			options: OptionsConfig::default(),
		}
	}
}

impl TftpConfig {
	///
	/// Parses `key = value` lines. Empty lines and `#` comments are
	/// skipped, unknown keys are ignored, out-of-range values are
	/// clamped into their protocol range where one exists.
	///
	pub fn from_properties(text: &str) -> Result<Self, ConfigError> {
		let mut config = Self::default();

		for line in text.lines() {
			let line = line.trim();
			if line.is_empty() || line.starts_with('#') {
				continue;
			}

			let (key, value) = match line.split_once('=') {
				Some((key, value)) => (key.trim(), value.trim()),
				None => continue,
			};
			config.apply(key, value)?;
		}

		Ok(config)
	}

	/// Applies a single key/value pair; unknown keys are ignored.
	pub fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
		match key {
			"timeout" => {
				let secs: u64 = value.parse().map_err(|_| invalid(key, value))?;
				self.timeout = Duration::from_secs(secs);
			},
			"retries" => {
				self.retries = value.parse().map_err(|_| invalid(key, value))?;
			},
			"port" => {
				self.port = value.parse().map_err(|_| invalid(key, value))?;
			},
			"dally" => {
				self.dally = parse_bool(key, value)?;
			},
			"block_size" => {
				let size: u16 = value.parse().map_err(|_| invalid(key, value))?;
				self.options.block_size = Some(
					size.clamp(consts::OPT_BLOCKSIZE_MIN, consts::OPT_BLOCKSIZE_MAX),
				);
			},
			"timeout_option" => {
				let secs: u64 = value.parse().map_err(|_| invalid(key, value))?;
				let secs = secs.clamp(
					consts::OPT_TIMEOUT_MIN.into(),
					consts::OPT_TIMEOUT_MAX.into(),
				);
				self.options.timeout = Some(Duration::from_secs(secs));
			},
			"transfer_size" => {
				self.options.handle_transfer_size = parse_bool(key, value)?;
			},
			_ => debug_ignore(key),
		}
		Ok(())
	}

	/// The per-operation transfer parameters of this configuration.
	pub fn transfer_config(&self) -> TransferConfig {
		TransferConfig {
			tftp_timeout: self.timeout,
			tftp_retries: self.retries,
			dally: self.dally,
			options: self.options.clone(),
		}
	}
}

fn debug_ignore(key: &str) {
	log::debug!("ignoring unknown configuration key '{}'", key);
}

impl Display for TftpConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		writeln!(f, "timeout = {}", self.timeout.as_secs())?;
		writeln!(f, "retries = {}", self.retries)?;
		writeln!(f, "port = {}", self.port)?;
		writeln!(f, "dally = {}", self.dally)?;

		if let Some(size) = self.options.block_size {
			writeln!(f, "block_size = {}", size)?;
		}
		if let Some(timeout) = self.options.timeout {
			writeln!(f, "timeout_option = {}", timeout.as_secs())?;
		}
		write!(f, "transfer_size = {}", self.options.handle_transfer_size)
	}
}
