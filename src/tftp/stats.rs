//! Process-wide packet counters, split by direction and packet type.
//!
//! The receive and transmit instances are the only mutable state shared
//! between operations; they sit behind a shared-read/exclusive-write
//! lock. There is no distinction between individual operations or
//! client/server roles.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::RwLock;

use super::packet::PacketKind;

///
/// Statistics bucket. The known packet types plus one bucket for
/// undecodable packets.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StatKind {
	Rrq,
	Wrq,
	Data,
	Ack,
	Error,
	OAck,
	Invalid,
}

impl From<PacketKind> for StatKind {
	fn from(kind: PacketKind) -> Self {
		match kind {
			PacketKind::Rrq => Self::Rrq,
			PacketKind::Wrq => Self::Wrq,
			PacketKind::Data => Self::Data,
			PacketKind::Ack => Self::Ack,
			PacketKind::Error => Self::Error,
			PacketKind::OAck => Self::OAck,
		}
	}
}

impl Display for StatKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", match self {
			Self::Rrq => "RRQ",
			Self::Wrq => "WRQ",
			Self::Data => "DATA",
			Self::Ack => "ACK",
			Self::Error => "ERR",
			Self::OAck => "OACK",
			Self::Invalid => "INVALID",
		})
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatValue {
	pub count: usize,
	pub bytes: usize,
}

pub type Statistic = BTreeMap<StatKind, StatValue>;

#[derive(Debug, Default)]
pub struct PacketStatistic {
	inner: RwLock<Statistic>,
}

static RECEIVE: PacketStatistic = PacketStatistic::new();
static TRANSMIT: PacketStatistic = PacketStatistic::new();

/// Counters of received packets, shared by all operations and listeners.
pub fn receive() -> &'static PacketStatistic {
	&RECEIVE
}

/// Counters of transmitted packets, shared by all operations and listeners.
pub fn transmit() -> &'static PacketStatistic {
	&TRANSMIT
}

impl PacketStatistic {
	pub const fn new() -> Self {
		Self { inner: RwLock::new(BTreeMap::new()) }
	}

	pub fn record(&self, kind: StatKind, size: usize) {
		let mut stats = self.inner.write().unwrap();
		let value = stats.entry(kind).or_default();
		value.count += 1;
		value.bytes += size;
	}

	pub fn snapshot(&self) -> Statistic {
		self.inner.read().unwrap().clone()
	}

	pub fn reset(&self) {
		self.inner.write().unwrap().clear();
	}

	/// Sums all buckets into one overall value.
	pub fn total(statistic: &Statistic) -> StatValue {
		statistic.values().fold(StatValue::default(), |mut total, value| {
			total.count += value.count;
			total.bytes += value.bytes;
			total
		})
	}
}

impl Display for PacketStatistic {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let snapshot = self.snapshot();
		for (kind, value) in snapshot.iter() {
			writeln!(f, "{:8}: count: {} total size: {}", kind.to_string(), value.count, value.bytes)?;
		}

		let total = Self::total(&snapshot);
		write!(f, "{:8}: count: {} total size: {}", "total", total.count, total.bytes)
	}
}
