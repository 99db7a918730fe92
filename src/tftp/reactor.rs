//! The event-loop capability the engine runs on: timed UDP receive,
//! datagram send, socket binding and cancellation. Operations only ever
//! talk to these traits; the tokio implementation below is what the CLI
//! front-ends use, the loopback implementation exists for tests and
//! embedding.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum RecvError {
	#[error("receive timed out")]
	Timeout,
	#[error("operation cancelled")]
	Cancelled,
	#[error("socket error: {0}")]
	Io(#[from] io::Error),
}

///
/// One UDP endpoint owned by a single operation or listener.
///
/// `recv_from` runs against an absolute deadline so that a wait can be
/// resumed after unrelated datagrams without re-arming the full timeout.
///
pub trait TftpSocket: Send + 'static {
	fn local_addr(&self) -> io::Result<SocketAddr>;

	/// Token that aborts pending and future receives on this socket.
	fn cancellation(&self) -> CancellationToken;

	fn send_to(&mut self, buf: &[u8], to: SocketAddr)
		-> impl Future<Output = io::Result<usize>> + Send;

	fn recv_from(&mut self, buf: &mut [u8], deadline: Instant)
		-> impl Future<Output = Result<(usize, SocketAddr), RecvError>> + Send;
}

///
/// Factory for sockets. Cloned into every operation; stopping the reactor
/// cancels all sockets bound through it.
///
pub trait Reactor: Clone + Send + Sync + 'static {
	type Socket: TftpSocket;

	fn bind(&self, local: SocketAddr)
		-> impl Future<Output = io::Result<Self::Socket>> + Send;
}

// ############################################################################
// #### TOKIO #################################################################
// ############################################################################

#[derive(Debug, Clone)]
pub struct TokioReactor {
	cancel: CancellationToken,
}

impl TokioReactor {
	pub fn new(cancel: CancellationToken) -> Self {
		Self { cancel }
	}
}

impl Reactor for TokioReactor {
	type Socket = TokioSocket;

	async fn bind(&self, local: SocketAddr) -> io::Result<TokioSocket> {
		let socket = tokio::net::UdpSocket::bind(local).await?;
		Ok(TokioSocket {
			socket,
			cancel: self.cancel.child_token(),
		})
	}
}

pub struct TokioSocket {
	socket: tokio::net::UdpSocket,
	cancel: CancellationToken,
}

impl TftpSocket for TokioSocket {
	fn local_addr(&self) -> io::Result<SocketAddr> {
		self.socket.local_addr()
	}

	fn cancellation(&self) -> CancellationToken {
		self.cancel.clone()
	}

	async fn send_to(&mut self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
		self.socket.send_to(buf, to).await
	}

	async fn recv_from(&mut self, buf: &mut [u8], deadline: Instant)
		-> Result<(usize, SocketAddr), RecvError>
	{
		tokio::select! {
			_ = self.cancel.cancelled() => Err(RecvError::Cancelled),
			received = tokio::time::timeout_at(deadline, self.socket.recv_from(buf)) => {
				match received {
					Ok(Ok((len, from))) => Ok((len, from)),
					Ok(Err(e)) => Err(RecvError::Io(e)),
					Err(_) => Err(RecvError::Timeout),
				}
			},
		}
	}
}

// ############################################################################
// #### LOOPBACK ##############################################################
// ############################################################################

///
/// An in-process datagram fabric with UDP semantics: unreliable ordering
/// guarantees are not modelled, but unknown destinations swallow packets
/// silently and oversized datagrams are truncated. Drives the engine in
/// tests without touching real sockets.
///
pub mod memory {
	use std::collections::HashMap;
	use std::sync::atomic::{AtomicU16, Ordering};
	use std::sync::{Arc, Mutex};

	use tokio::sync::mpsc;

	use super::*;

	type Network = Arc<Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>>>>;

	const FIRST_EPHEMERAL_PORT: u16 = 0xC000;

	#[derive(Clone)]
	pub struct MemoryReactor {
		network: Network,
		next_port: Arc<AtomicU16>,
		cancel: CancellationToken,
	}

	impl MemoryReactor {
		pub fn new(cancel: CancellationToken) -> Self {
			Self {
				network: Network::default(),
				next_port: Arc::new(AtomicU16::new(FIRST_EPHEMERAL_PORT)),
				cancel,
			}
		}
	}

	impl Reactor for MemoryReactor {
		type Socket = MemorySocket;

		async fn bind(&self, local: SocketAddr) -> io::Result<MemorySocket> {
			let mut local = local;
			if local.port() == 0 {
				local.set_port(self.next_port.fetch_add(1, Ordering::Relaxed));
			}

			let (tx, rx) = mpsc::unbounded_channel();
			{
				let mut network = self.network.lock().unwrap();
				if network.contains_key(&local) {
					return Err(io::Error::new(io::ErrorKind::AddrInUse, local.to_string()));
				}
				network.insert(local, tx);
			}

			Ok(MemorySocket {
				local,
				rx,
				network: self.network.clone(),
				cancel: self.cancel.child_token(),
			})
		}
	}

	#[derive(Debug)]
	pub struct MemorySocket {
		local: SocketAddr,
		rx: mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>,
		network: Network,
		cancel: CancellationToken,
	}

	impl Drop for MemorySocket {
		fn drop(&mut self) {
			self.network.lock().unwrap().remove(&self.local);
		}
	}

	impl TftpSocket for MemorySocket {
		fn local_addr(&self) -> io::Result<SocketAddr> {
			Ok(self.local)
		}

		fn cancellation(&self) -> CancellationToken {
			self.cancel.clone()
		}

		async fn send_to(&mut self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
			let target = self.network.lock().unwrap().get(&to).cloned();
			if let Some(target) = target {
				let _ = target.send((self.local, buf.to_vec()));
			}
			Ok(buf.len())
		}

		async fn recv_from(&mut self, buf: &mut [u8], deadline: Instant)
			-> Result<(usize, SocketAddr), RecvError>
		{
			tokio::select! {
				_ = self.cancel.cancelled() => Err(RecvError::Cancelled),
				received = tokio::time::timeout_at(deadline, self.rx.recv()) => {
					match received {
						Ok(Some((from, data))) => {
							let len = data.len().min(buf.len());
							buf[..len].copy_from_slice(&data[..len]);
							Ok((len, from))
						},
						Ok(None) => Err(RecvError::Cancelled),
						Err(_) => Err(RecvError::Timeout),
					}
				},
			}
		}
	}
}
