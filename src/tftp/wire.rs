//! Primitives shared by the packet codec: fixed-width integers in network
//! byte order and NUL-delimited strings, all addressed by absolute buffer
//! positions so that callers can pre-size their buffers.

use super::error::PacketError;

macro_rules! int_codec {
	($get:ident, $put:ident, $t:ty) => {
		///
		/// Reads a big-endian integer at `at`, returning the position
		/// behind it and the value.
		///
		pub fn $get(buf: &[u8], at: usize) -> Result<(usize, $t), PacketError> {
			const WIDTH: usize = std::mem::size_of::<$t>();
			if buf.len() < at + WIDTH {
				return Err(PacketError::UnexpectedEof);
			}

			let mut raw = [0u8; WIDTH];
			raw.copy_from_slice(&buf[at..at + WIDTH]);
			Ok((at + WIDTH, <$t>::from_be_bytes(raw)))
		}

		///
		/// Writes a big-endian integer at `at` and returns the position
		/// behind it. The buffer must be pre-sized by the caller.
		///
		pub fn $put(buf: &mut [u8], at: usize, value: $t) -> usize {
			const WIDTH: usize = std::mem::size_of::<$t>();
			debug_assert!(buf.len() >= at + WIDTH);

			buf[at..at + WIDTH].copy_from_slice(&value.to_be_bytes());
			at + WIDTH
		}
	};
}

int_codec!(get_u8, put_u8, u8);
int_codec!(get_u16, put_u16, u16);
int_codec!(get_u32, put_u32, u32);
int_codec!(get_u64, put_u64, u64);

///
/// Reads a NUL-terminated string starting at `at`. Returns the position
/// behind the terminator and the string without it.
///
pub fn get_cstr(buf: &[u8], at: usize) -> Result<(usize, &str), PacketError> {
	if at >= buf.len() {
		return Err(PacketError::UnexpectedEof);
	}

	let rest = &buf[at..];
	let nul = rest.iter().position(|b| *b == 0)
		.ok_or(PacketError::NotNullTerminated)?;

	let s = std::str::from_utf8(&rest[..nul])
		.map_err(|_| PacketError::InvalidCharacters)?;
	Ok((at + nul + 1, s))
}

///
/// Writes the raw bytes of `s` at `at`, without a terminator; the caller
/// places the NUL itself. Returns the position behind the copied bytes.
///
pub fn put_str(buf: &mut [u8], at: usize, s: &str) -> usize {
	let bytes = s.as_bytes();
	debug_assert!(buf.len() >= at + bytes.len());

	buf[at..at + bytes.len()].copy_from_slice(bytes);
	at + bytes.len()
}
