//! End-to-end transfer scenarios, driven over the in-process loopback
//! reactor with a scripted remote side. Time is paused, so timeout and
//! retransmission behavior is exact.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tftpkit::client::{TftpClient, TftpRequestParameters};
use tftpkit::server::{fs_request_handler, RequestAction, ServerConfig, TftpServer};
use tftpkit::tftp::{
	CompletionHandler, ErrorCode, Mode, RequestKind, TransferConfig, TransferStatus,
};
use tftpkit::tftp::block::BlockNumber;
use tftpkit::tftp::handler::MemoryFile;
use tftpkit::tftp::options::{KnownClientOptions, Options, OptionsConfig};
use tftpkit::tftp::packet::{TftpAck, TftpData, TftpErr, TftpOAck, TftpPacket};
use tftpkit::tftp::packet::builder::{TftpOAckBuilder, TftpReqBuilder};
use tftpkit::tftp::reactor::memory::{MemoryReactor, MemorySocket};
use tftpkit::tftp::reactor::{Reactor, TftpSocket};
use tftpkit::tftp::server_ops::{ServerOperationConfig, ServerReadOperation, ServerWriteOperation};
use tftpkit::tftp::stats;

const SERVER_PORT: u16 = 69;

fn server_addr() -> SocketAddr {
	SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), SERVER_PORT)
}

fn reactor() -> MemoryReactor {
	MemoryReactor::new(CancellationToken::new())
}

fn factory(reactor: &MemoryReactor, config: TransferConfig) -> TftpClient<MemoryReactor> {
	TftpClient::new(reactor.clone(), IpAddr::V4(Ipv4Addr::LOCALHOST), config)
}

fn request_params(filename: &str) -> TftpRequestParameters {
	TftpRequestParameters {
		server: server_addr(),
		local: None,
		filename: filename.to_string(),
		mode: Mode::Octet,
	}
}

///
/// A scripted endpoint playing the remote side of a transfer.
///
struct Peer {
	socket: MemorySocket,
}

impl Peer {
	async fn bind(reactor: &MemoryReactor, port: u16) -> Self {
		let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
		Self { socket: reactor.bind(local).await.unwrap() }
	}

	fn addr(&self) -> SocketAddr {
		self.socket.local_addr().unwrap()
	}

	async fn recv(&mut self) -> (TftpPacket, SocketAddr) {
		let mut buf = vec![0u8; 65536];
		let deadline = Instant::now() + Duration::from_secs(120);
		let (len, from) = self.socket.recv_from(&mut buf, deadline).await
			.expect("scripted peer expected a packet");
		(TftpPacket::try_from_buf(&buf[..len]).expect("scripted peer got invalid packet"), from)
	}

	async fn send(&mut self, pkt: &TftpPacket, to: SocketAddr) {
		self.socket.send_to(&pkt.encode(), to).await.unwrap();
	}
}

type CompletionLog = Arc<Mutex<Vec<(TransferStatus, Option<TftpErr>)>>>;

fn completion_recorder() -> (CompletionHandler, CompletionLog) {
	let log: CompletionLog = Arc::new(Mutex::new(Vec::new()));
	let writer = log.clone();
	let handler: CompletionHandler = Box::new(move |status, error| {
		writer.lock().unwrap().push((status, error.cloned()));
	});
	(handler, log)
}

fn data(block: u16, payload: Vec<u8>) -> TftpPacket {
	TftpPacket::Data(TftpData { block: BlockNumber::new(block), data: payload })
}

fn ack(block: u16) -> TftpPacket {
	TftpPacket::Ack(TftpAck::new(block))
}

fn oack(pairs: &[(&str, &str)]) -> TftpPacket {
	let mut options = Options::new();
	for &(name, value) in pairs {
		options.insert(name, value);
	}
	TftpPacket::OAck(TftpOAckBuilder::new().options(options).build())
}

fn expect_ack(pkt: &TftpPacket, block: u16) {
	match pkt {
		TftpPacket::Ack(a) => assert_eq!(a.block, BlockNumber::new(block)),
		other => panic!("expected ACK {}, got {}", block, other),
	}
}

fn expect_data(pkt: &TftpPacket, block: u16, len: usize) -> &[u8] {
	match pkt {
		TftpPacket::Data(d) => {
			assert_eq!(d.block, BlockNumber::new(block));
			assert_eq!(d.data.len(), len);
			&d.data
		},
		other => panic!("expected DATA {}, got {}", block, other),
	}
}

// ############################################################################
// #### CLIENT READ ###########################################################
// ############################################################################

///
/// Scenario: plain RRQ of a 100-byte file, no options. The server answers
/// from a fresh ephemeral port, which becomes the bound TID.
///
#[tokio::test(start_paused = true)]
async fn client_read_single_block() {
	let reactor = reactor();
	let mut listener = Peer::bind(&reactor, SERVER_PORT).await;
	let mut tid = Peer::bind(&reactor, 6901).await;

	let (completion, log) = completion_recorder();
	let client = factory(&reactor, TransferConfig::default());
	let mut op = client.read_operation(request_params("f"), MemoryFile::new(), None, completion)
		.await.unwrap();

	let rx_data_before = stats::receive().snapshot()
		.get(&stats::StatKind::Data).copied().unwrap_or_default().count;

	let payload = vec![0x55u8; 100];
	let script = async {
		let (pkt, client_addr) = listener.recv().await;
		match &pkt {
			TftpPacket::Req(req) => {
				assert_eq!(req.kind, RequestKind::Rrq);
				assert_eq!(req.filename, "f");
				assert_eq!(req.mode, Mode::Octet);
				assert!(req.options.is_empty());
			},
			other => panic!("expected RRQ, got {}", other),
		}

		/* reply from the transfer TID, not the well-known port */
		tid.send(&data(1, payload.clone()), client_addr).await;
		let (pkt, _) = tid.recv().await;
		expect_ack(&pkt, 1);
	};

	let (status, _) = tokio::join!(op.execute(), script);
	assert_eq!(status, TransferStatus::Successful);
	assert_eq!(op.handler().data(), &payload[..]);

	let log = log.lock().unwrap();
	assert_eq!(log.len(), 1);
	assert_eq!(log[0].0, TransferStatus::Successful);
	assert!(log[0].1.is_none());

	/* the DATA packet was counted before the completion handler ran */
	let rx_data_after = stats::receive().snapshot()[&stats::StatKind::Data].count;
	assert!(rx_data_after > rx_data_before);
}

///
/// Scenario: RRQ with `blksize 1024` accepted by the server. The short
/// second block terminates the transfer.
///
#[tokio::test(start_paused = true)]
async fn client_read_with_blocksize_negotiation() {
	let reactor = reactor();
	let mut tid = Peer::bind(&reactor, SERVER_PORT).await;

	let mut config = TransferConfig::default();
	config.options = OptionsConfig {
		handle_transfer_size: false,
		block_size: Some(1024),
		timeout: None,
	};

	let (completion, _log) = completion_recorder();
	let client = factory(&reactor, config);
	let mut op = client.read_operation(request_params("big"), MemoryFile::new(), None, completion)
		.await.unwrap();

	let script = async {
		let (pkt, client_addr) = tid.recv().await;
		match &pkt {
			TftpPacket::Req(req) => assert_eq!(req.options.get("blksize"), Some("1024")),
			other => panic!("expected RRQ, got {}", other),
		}

		tid.send(&oack(&[("blksize", "1024")]), client_addr).await;

		let (pkt, _) = tid.recv().await;
		expect_ack(&pkt, 0);

		tid.send(&data(1, vec![1u8; 1024]), client_addr).await;
		let (pkt, _) = tid.recv().await;
		expect_ack(&pkt, 1);

		tid.send(&data(2, vec![2u8; 500]), client_addr).await;
		let (pkt, _) = tid.recv().await;
		expect_ack(&pkt, 2);
	};

	let (status, _) = tokio::join!(op.execute(), script);
	assert_eq!(status, TransferStatus::Successful);
	assert_eq!(op.handler().data().len(), 1524);
}

///
/// An OACK echoing an option the client never requested is refused with
/// `TftpOptionRefused`.
///
#[tokio::test(start_paused = true)]
async fn client_read_rejects_unrequested_option() {
	let reactor = reactor();
	let mut tid = Peer::bind(&reactor, SERVER_PORT).await;

	let (completion, log) = completion_recorder();
	let client = factory(&reactor, TransferConfig::default());
	let mut op = client.read_operation(request_params("f"), MemoryFile::new(), None, completion)
		.await.unwrap();

	let script = async {
		let (_, client_addr) = tid.recv().await;

		tid.send(&oack(&[("blksize", "1024")]), client_addr).await;

		let (pkt, _) = tid.recv().await;
		match pkt {
			TftpPacket::Err(err) => assert_eq!(err.code, ErrorCode::TftpOptionRefused),
			other => panic!("expected ERR, got {}", other),
		}
	};

	let (status, _) = tokio::join!(op.execute(), script);
	assert_eq!(status, TransferStatus::OptionNegotiationError);
	assert_eq!(log.lock().unwrap()[0].0, TransferStatus::OptionNegotiationError);
}

///
/// An echoed `tsize` beyond what the receive handler accepts aborts the
/// transfer with `DiskFullOrAllocationExceeds`.
///
#[tokio::test(start_paused = true)]
async fn client_read_transfer_size_gate() {
	let reactor = reactor();
	let mut tid = Peer::bind(&reactor, SERVER_PORT).await;

	let mut config = TransferConfig::default();
	config.options.handle_transfer_size = true;

	let (completion, _log) = completion_recorder();
	let client = factory(&reactor, config);
	let mut op = client.read_operation(
		request_params("f"),
		MemoryFile::with_size_limit(1000),
		None,
		completion,
	).await.unwrap();

	let script = async {
		let (pkt, client_addr) = tid.recv().await;
		match &pkt {
			TftpPacket::Req(req) => assert_eq!(req.options.get("tsize"), Some("0")),
			other => panic!("expected RRQ, got {}", other),
		}

		tid.send(&oack(&[("tsize", "1000000")]), client_addr).await;

		let (pkt, _) = tid.recv().await;
		match pkt {
			TftpPacket::Err(err) => assert_eq!(err.code, ErrorCode::DiskFullOrAllocationExceeds),
			other => panic!("expected ERR, got {}", other),
		}
	};

	let (status, _) = tokio::join!(op.execute(), script);
	assert_eq!(status, TransferStatus::TransferError);
}

///
/// Scenario: retransmit exhaustion. Two retries and a silent server make
/// for exactly three identical requests, then a communication error at
/// three times the timeout.
///
#[tokio::test(start_paused = true)]
async fn client_read_retransmit_exhaustion() {
	let reactor = reactor();
	let mut listener = Peer::bind(&reactor, SERVER_PORT).await;

	let mut config = TransferConfig::default();
	config.tftp_timeout = Duration::from_secs(1);
	config.tftp_retries = 2;

	let (completion, log) = completion_recorder();
	let client = factory(&reactor, config);
	let mut op = client.read_operation(request_params("f"), MemoryFile::new(), None, completion)
		.await.unwrap();

	let started = Instant::now();
	let script = async {
		let (first, _) = listener.recv().await;
		let (second, _) = listener.recv().await;
		let (third, _) = listener.recv().await;

		/* retransmissions are identical on the wire */
		assert_eq!(first, second);
		assert_eq!(second, third);
	};

	let (status, _) = tokio::join!(op.execute(), script);
	assert_eq!(status, TransferStatus::CommunicationError);

	let elapsed = started.elapsed();
	assert!(elapsed >= Duration::from_secs(3), "elapsed {:?}", elapsed);
	assert!(elapsed < Duration::from_secs(4), "elapsed {:?}", elapsed);

	assert_eq!(log.lock().unwrap().len(), 1);
}

///
/// A datagram from an unknown TID gets an unacknowledged
/// `UnknownTransferId` error and does not disturb the transfer.
///
#[tokio::test(start_paused = true)]
async fn client_read_rejects_unknown_tid() {
	let reactor = reactor();
	let mut tid = Peer::bind(&reactor, SERVER_PORT).await;
	let mut stranger = Peer::bind(&reactor, 5555).await;

	let (completion, _log) = completion_recorder();
	let client = factory(&reactor, TransferConfig::default());
	let mut op = client.read_operation(request_params("f"), MemoryFile::new(), None, completion)
		.await.unwrap();

	let script = async {
		let (_, client_addr) = tid.recv().await;
		tid.send(&data(1, vec![9u8; 512]), client_addr).await;
		let (pkt, _) = tid.recv().await;
		expect_ack(&pkt, 1);

		/* a third party interferes mid-transfer */
		stranger.send(&ack(1), client_addr).await;
		let (reply, from) = stranger.recv().await;
		assert_eq!(from, client_addr);
		match reply {
			TftpPacket::Err(err) => assert_eq!(err.code, ErrorCode::UnknownTransferId),
			other => panic!("expected ERR, got {}", other),
		}

		/* the transfer continues unharmed */
		tid.send(&data(2, vec![9u8; 77]), client_addr).await;
		let (pkt, _) = tid.recv().await;
		expect_ack(&pkt, 2);
	};

	let (status, _) = tokio::join!(op.execute(), script);
	assert_eq!(status, TransferStatus::Successful);
	assert_eq!(op.handler().data().len(), 589);
}

///
/// A server ERROR in response to the request terminates as a request
/// error carrying the packet.
///
#[tokio::test(start_paused = true)]
async fn client_read_request_refused() {
	let reactor = reactor();
	let mut listener = Peer::bind(&reactor, SERVER_PORT).await;

	let (completion, log) = completion_recorder();
	let client = factory(&reactor, TransferConfig::default());
	let mut op = client.read_operation(request_params("nope"), MemoryFile::new(), None, completion)
		.await.unwrap();

	let script = async {
		let (_, client_addr) = listener.recv().await;
		let err = TftpPacket::Err(TftpErr::new(ErrorCode::FileNotFound, "no such file"));
		listener.send(&err, client_addr).await;
	};

	let (status, _) = tokio::join!(op.execute(), script);
	assert_eq!(status, TransferStatus::RequestError);

	let log = log.lock().unwrap();
	let captured = log[0].1.as_ref().expect("error packet captured");
	assert_eq!(captured.code, ErrorCode::FileNotFound);
	assert_eq!(captured.message, "no such file");
	assert_eq!(op.core().error_info().unwrap().code, ErrorCode::FileNotFound);
}

///
/// Forced abort: no packet is emitted, the status is `Aborted` and the
/// completion handler fires exactly once even if `execute` is retried.
///
#[tokio::test(start_paused = true)]
async fn client_read_forced_abort() {
	let reactor = reactor();
	let mut listener = Peer::bind(&reactor, SERVER_PORT).await;

	let (completion, log) = completion_recorder();
	let client = factory(&reactor, TransferConfig::default());
	let mut op = client.read_operation(request_params("f"), MemoryFile::new(), None, completion)
		.await.unwrap();
	let abort = op.core().abort_token();

	let script = async {
		let _ = listener.recv().await;
		abort.cancel();
	};

	let (status, _) = tokio::join!(op.execute(), script);
	assert_eq!(status, TransferStatus::Aborted);

	/* the operation is inert now */
	assert_eq!(op.execute().await, TransferStatus::Aborted);
	assert_eq!(log.lock().unwrap().len(), 1);
}

// ############################################################################
// #### CLIENT WRITE ##########################################################
// ############################################################################

///
/// Scenario: Sorcerer's Apprentice mitigation. A delayed duplicate ACK is
/// ignored and no DATA block is sent twice.
///
#[tokio::test(start_paused = true)]
async fn client_write_ignores_duplicate_ack() {
	let reactor = reactor();
	let mut tid = Peer::bind(&reactor, SERVER_PORT).await;

	let (completion, _log) = completion_recorder();
	let client = factory(&reactor, TransferConfig::default());
	let mut op = client.write_operation(
		request_params("up"),
		MemoryFile::from_data(vec![3u8; 2 * 512 + 100]),
		None,
		completion,
	).await.unwrap();

	let script = async {
		let (pkt, client_addr) = tid.recv().await;
		match &pkt {
			TftpPacket::Req(req) => assert_eq!(req.kind, RequestKind::Wrq),
			other => panic!("expected WRQ, got {}", other),
		}
		tid.send(&ack(0), client_addr).await;

		let (pkt, _) = tid.recv().await;
		expect_data(&pkt, 1, 512);
		tid.send(&ack(1), client_addr).await;

		let (pkt, _) = tid.recv().await;
		expect_data(&pkt, 2, 512);

		/* a delayed duplicate of ACK 1 arrives before ACK 2 */
		tid.send(&ack(1), client_addr).await;
		tid.send(&ack(2), client_addr).await;

		/* the next packet must be DATA 3, not a re-sent DATA 2 */
		let (pkt, _) = tid.recv().await;
		expect_data(&pkt, 3, 100);
		tid.send(&ack(3), client_addr).await;
	};

	let (status, _) = tokio::join!(op.execute(), script);
	assert_eq!(status, TransferStatus::Successful);
}

///
/// WRQ with `tsize` announcement and OACK negotiation; the negotiated
/// block size drives the chunking.
///
#[tokio::test(start_paused = true)]
async fn client_write_with_negotiation() {
	let reactor = reactor();
	let mut tid = Peer::bind(&reactor, SERVER_PORT).await;

	let mut config = TransferConfig::default();
	config.options = OptionsConfig {
		handle_transfer_size: true,
		block_size: Some(1024),
		timeout: None,
	};

	let (completion, _log) = completion_recorder();
	let client = factory(&reactor, config);
	let mut op = client.write_operation(
		request_params("up"),
		MemoryFile::from_data(vec![7u8; 1500]),
		None,
		completion,
	).await.unwrap();

	let script = async {
		let (pkt, client_addr) = tid.recv().await;
		match &pkt {
			TftpPacket::Req(req) => {
				assert_eq!(req.kind, RequestKind::Wrq);
				/* a write announces the actual size */
				assert_eq!(req.options.get("tsize"), Some("1500"));
				assert_eq!(req.options.get("blksize"), Some("1024"));
			},
			other => panic!("expected WRQ, got {}", other),
		}

		tid.send(&oack(&[("blksize", "1024"), ("tsize", "1500")]), client_addr).await;

		let (pkt, _) = tid.recv().await;
		expect_data(&pkt, 1, 1024);
		tid.send(&ack(1), client_addr).await;

		let (pkt, _) = tid.recv().await;
		expect_data(&pkt, 2, 476);
		tid.send(&ack(2), client_addr).await;
	};

	let (status, _) = tokio::join!(op.execute(), script);
	assert_eq!(status, TransferStatus::Successful);
}

///
/// An ACK that is neither the expected block nor its predecessor is a
/// protocol violation.
///
#[tokio::test(start_paused = true)]
async fn client_write_wrong_ack_is_fatal() {
	let reactor = reactor();
	let mut tid = Peer::bind(&reactor, SERVER_PORT).await;

	let (completion, _log) = completion_recorder();
	let client = factory(&reactor, TransferConfig::default());
	let mut op = client.write_operation(
		request_params("up"),
		MemoryFile::from_data(vec![1u8; 600]),
		None,
		completion,
	).await.unwrap();

	let script = async {
		let (_, client_addr) = tid.recv().await;
		tid.send(&ack(0), client_addr).await;

		let (pkt, _) = tid.recv().await;
		expect_data(&pkt, 1, 512);
		tid.send(&ack(7), client_addr).await;

		let (pkt, _) = tid.recv().await;
		match pkt {
			TftpPacket::Err(err) => assert_eq!(err.code, ErrorCode::IllegalTftpOperation),
			other => panic!("expected ERR, got {}", other),
		}
	};

	let (status, _) = tokio::join!(op.execute(), script);
	assert_eq!(status, TransferStatus::TransferError);
}

// ############################################################################
// #### SERVER OPERATIONS #####################################################
// ############################################################################

fn server_op_config(
	reactor_client: SocketAddr,
	transfer: TransferConfig,
	client_options: KnownClientOptions,
) -> ServerOperationConfig {
	ServerOperationConfig {
		transfer,
		remote: reactor_client,
		client_options,
		negotiated_additional: Options::new(),
	}
}

///
/// Server read with `blksize` clamping: the client wants 1024, the server
/// allows up to 2048, the reply echoes 1024. A `tsize 0` query is
/// answered from the handler.
///
#[tokio::test(start_paused = true)]
async fn server_read_negotiates_and_transmits() {
	let reactor = reactor();
	let mut client = Peer::bind(&reactor, 0xD000).await;

	let mut transfer = TransferConfig::default();
	transfer.options = OptionsConfig {
		handle_transfer_size: true,
		block_size: Some(2048),
		timeout: None,
	};

	let socket = reactor.bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await.unwrap();
	let tid_addr = socket.local_addr().unwrap();

	let (completion, _log) = completion_recorder();
	let mut op = ServerReadOperation::new(
		socket,
		server_op_config(
			client.addr(),
			transfer,
			KnownClientOptions {
				block_size: Some(1024),
				timeout: None,
				transfer_size: Some(0),
			},
		),
		MemoryFile::from_data(vec![0xEEu8; 1524]),
		completion,
	);

	let script = async {
		let (pkt, _) = client.recv().await;
		match &pkt {
			TftpPacket::OAck(TftpOAck { options }) => {
				assert_eq!(options.get("blksize"), Some("1024"));
				assert_eq!(options.get("tsize"), Some("1524"));
			},
			other => panic!("expected OACK, got {}", other),
		}
		client.send(&ack(0), tid_addr).await;

		let (pkt, _) = client.recv().await;
		expect_data(&pkt, 1, 1024);
		client.send(&ack(1), tid_addr).await;

		let (pkt, _) = client.recv().await;
		expect_data(&pkt, 2, 500);
		client.send(&ack(2), tid_addr).await;
	};

	let (status, _) = tokio::join!(op.execute(), script);
	assert_eq!(status, TransferStatus::Successful);
}

///
/// Server read without any client options answers directly with DATA 1.
///
#[tokio::test(start_paused = true)]
async fn server_read_without_options() {
	let reactor = reactor();
	let mut client = Peer::bind(&reactor, 0xD001).await;

	let socket = reactor.bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await.unwrap();
	let tid_addr = socket.local_addr().unwrap();

	let (completion, _log) = completion_recorder();
	let mut op = ServerReadOperation::new(
		socket,
		server_op_config(client.addr(), TransferConfig::default(), KnownClientOptions::default()),
		MemoryFile::from_data(vec![0x11u8; 100]),
		completion,
	);

	let script = async {
		let (pkt, _) = client.recv().await;
		expect_data(&pkt, 1, 100);
		client.send(&ack(1), tid_addr).await;
	};

	let (status, _) = tokio::join!(op.execute(), script);
	assert_eq!(status, TransferStatus::Successful);
}

///
/// A non-zero `tsize` in a read request is refused.
///
#[tokio::test(start_paused = true)]
async fn server_read_rejects_nonzero_tsize() {
	let reactor = reactor();
	let mut client = Peer::bind(&reactor, 0xD002).await;

	let mut transfer = TransferConfig::default();
	transfer.options.handle_transfer_size = true;

	let socket = reactor.bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await.unwrap();

	let (completion, log) = completion_recorder();
	let mut op = ServerReadOperation::new(
		socket,
		server_op_config(
			client.addr(),
			transfer,
			KnownClientOptions { transfer_size: Some(42), ..Default::default() },
		),
		MemoryFile::from_data(vec![1u8; 8]),
		completion,
	);

	let script = async {
		let (pkt, _) = client.recv().await;
		match pkt {
			TftpPacket::Err(err) => assert_eq!(err.code, ErrorCode::TftpOptionRefused),
			other => panic!("expected ERR, got {}", other),
		}
	};

	let (status, _) = tokio::join!(op.execute(), script);
	assert_eq!(status, TransferStatus::OptionNegotiationError);
	assert_eq!(log.lock().unwrap().len(), 1);
}

///
/// Scenario: WRQ announcing `tsize 1000000`, refused by the receive
/// handler's gate with `DiskFullOrAllocationExceeds`.
///
#[tokio::test(start_paused = true)]
async fn server_write_transfer_size_refused() {
	let reactor = reactor();
	let mut client = Peer::bind(&reactor, 0xD003).await;

	let mut transfer = TransferConfig::default();
	transfer.options.handle_transfer_size = true;

	let socket = reactor.bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await.unwrap();

	let (completion, log) = completion_recorder();
	let mut op = ServerWriteOperation::new(
		socket,
		server_op_config(
			client.addr(),
			transfer,
			KnownClientOptions { transfer_size: Some(1_000_000), ..Default::default() },
		),
		MemoryFile::with_size_limit(1000),
		completion,
	);

	let script = async {
		let (pkt, _) = client.recv().await;
		match pkt {
			TftpPacket::Err(err) => {
				assert_eq!(err.code, ErrorCode::DiskFullOrAllocationExceeds);
				assert_eq!(err.message, "FILE TO BIG");
			},
			other => panic!("expected ERR, got {}", other),
		}
	};

	let (status, _) = tokio::join!(op.execute(), script);
	assert_eq!(status, TransferStatus::TransferError);

	let log = log.lock().unwrap();
	assert_eq!(log[0].1.as_ref().unwrap().code, ErrorCode::DiskFullOrAllocationExceeds);
}

///
/// Server write with dally: a retransmitted final DATA block is re-ACKed
/// without reaching the handler twice, then the operation ends
/// successfully.
///
#[tokio::test(start_paused = true)]
async fn server_write_dally_reacks_final_block() {
	let reactor = reactor();
	let mut client = Peer::bind(&reactor, 0xD004).await;

	let mut transfer = TransferConfig::default();
	transfer.dally = true;

	let socket = reactor.bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await.unwrap();
	let tid_addr = socket.local_addr().unwrap();

	let (completion, _log) = completion_recorder();
	let mut op = ServerWriteOperation::new(
		socket,
		server_op_config(client.addr(), transfer, KnownClientOptions::default()),
		MemoryFile::new(),
		completion,
	);

	let script = async {
		let (pkt, _) = client.recv().await;
		expect_ack(&pkt, 0);

		client.send(&data(1, vec![4u8; 10]), tid_addr).await;
		let (pkt, _) = client.recv().await;
		expect_ack(&pkt, 1);

		/* the final ACK "got lost": retransmit the final DATA */
		client.send(&data(1, vec![4u8; 10]), tid_addr).await;
		let (pkt, _) = client.recv().await;
		expect_ack(&pkt, 1);
	};

	let (status, _) = tokio::join!(op.execute(), script);
	assert_eq!(status, TransferStatus::Successful);
	assert_eq!(op.handler().data(), &[4u8; 10][..]);
}

///
/// Server write re-ACKs duplicates of intermediate blocks without
/// handing them to the handler again.
///
#[tokio::test(start_paused = true)]
async fn server_write_reacks_duplicate_block() {
	let reactor = reactor();
	let mut client = Peer::bind(&reactor, 0xD005).await;

	let socket = reactor.bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await.unwrap();
	let tid_addr = socket.local_addr().unwrap();

	let (completion, _log) = completion_recorder();
	let mut op = ServerWriteOperation::new(
		socket,
		server_op_config(client.addr(), TransferConfig::default(), KnownClientOptions::default()),
		MemoryFile::new(),
		completion,
	);

	let script = async {
		let (pkt, _) = client.recv().await;
		expect_ack(&pkt, 0);

		client.send(&data(1, vec![8u8; 512]), tid_addr).await;
		let (pkt, _) = client.recv().await;
		expect_ack(&pkt, 1);

		/* our ACK "got lost": the client sends block 1 again */
		client.send(&data(1, vec![8u8; 512]), tid_addr).await;
		let (pkt, _) = client.recv().await;
		expect_ack(&pkt, 1);

		client.send(&data(2, vec![8u8; 40]), tid_addr).await;
		let (pkt, _) = client.recv().await;
		expect_ack(&pkt, 2);
	};

	let (status, _) = tokio::join!(op.execute(), script);
	assert_eq!(status, TransferStatus::Successful);
	/* 512 + 40, the duplicate did not reach the handler */
	assert_eq!(op.handler().data().len(), 552);
}

///
/// An oversized DATA block is discarded with `IllegalTftpOperation`.
///
#[tokio::test(start_paused = true)]
async fn server_write_rejects_oversized_block() {
	let reactor = reactor();
	let mut client = Peer::bind(&reactor, 0xD006).await;

	let socket = reactor.bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await.unwrap();
	let tid_addr = socket.local_addr().unwrap();

	let (completion, _log) = completion_recorder();
	let mut op = ServerWriteOperation::new(
		socket,
		server_op_config(client.addr(), TransferConfig::default(), KnownClientOptions::default()),
		MemoryFile::new(),
		completion,
	);

	let script = async {
		let (pkt, _) = client.recv().await;
		expect_ack(&pkt, 0);

		client.send(&data(1, vec![6u8; 513]), tid_addr).await;
		let (pkt, _) = client.recv().await;
		match pkt {
			TftpPacket::Err(err) => assert_eq!(err.code, ErrorCode::IllegalTftpOperation),
			other => panic!("expected ERR, got {}", other),
		}
	};

	let (status, _) = tokio::join!(op.execute(), script);
	assert_eq!(status, TransferStatus::TransferError);
}

// ############################################################################
// #### LISTENER ##############################################################
// ############################################################################

///
/// Scenario: a request with only unknown options and a request handler
/// that refuses them is answered with an ERROR from the well-known port.
///
#[tokio::test(start_paused = true)]
async fn listener_rejects_refused_residual_options() {
	let reactor = reactor();

	let config = ServerConfig {
		listen: server_addr(),
		transfer: TransferConfig::default(),
	};
	let mut server = TftpServer::new(reactor.clone(), config, Box::new(|request| {
		if !request.residual.is_empty() {
			return RequestAction::Reject {
				code: ErrorCode::TftpOptionRefused,
				message: "unknown options refused".to_string(),
			};
		}
		RequestAction::Ignore
	}));
	tokio::spawn(async move { server.run().await });
	tokio::task::yield_now().await;

	let mut client = Peer::bind(&reactor, 0xD007).await;
	let wrq = TftpPacket::Req(
		TftpReqBuilder::new()
			.kind(RequestKind::Wrq)
			.filename("upload")
			.option("weird", 42u32)
			.build(),
	);
	client.send(&wrq, server_addr()).await;

	let (pkt, from) = client.recv().await;
	assert_eq!(from, server_addr());
	match pkt {
		TftpPacket::Err(err) => assert_eq!(err.code, ErrorCode::TftpOptionRefused),
		other => panic!("expected ERR, got {}", other),
	}
}

///
/// Anything but RRQ/WRQ on the well-known port is illegal.
///
#[tokio::test(start_paused = true)]
async fn listener_rejects_non_requests() {
	let reactor = reactor();

	let config = ServerConfig {
		listen: server_addr(),
		transfer: TransferConfig::default(),
	};
	let mut server = TftpServer::new(reactor.clone(), config, Box::new(|_| RequestAction::Ignore));
	tokio::spawn(async move { server.run().await });
	tokio::task::yield_now().await;

	let mut client = Peer::bind(&reactor, 0xD008).await;
	client.send(&ack(3), server_addr()).await;

	let (pkt, _) = client.recv().await;
	match pkt {
		TftpPacket::Err(err) => assert_eq!(err.code, ErrorCode::IllegalTftpOperation),
		other => panic!("expected ERR, got {}", other),
	}
}

///
/// Full round through listener, spawned server operation and client
/// factory: an upload lands in the handler the request handler supplied.
///
#[tokio::test(start_paused = true)]
async fn listener_spawns_write_operation() {
	let reactor = reactor();

	let uploads: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
	let (server_done_tx, server_done_rx) = tokio::sync::oneshot::channel();

	struct Recorder {
		buffer: Vec<u8>,
		uploads: Arc<Mutex<Vec<Vec<u8>>>>,
	}
	impl tftpkit::tftp::handler::ReceiveDataHandler for Recorder {
		fn received_data(&mut self, data: &[u8]) -> std::io::Result<()> {
			self.buffer.extend_from_slice(data);
			Ok(())
		}
		fn finished(&mut self) {
			self.uploads.lock().unwrap().push(std::mem::take(&mut self.buffer));
		}
	}

	let config = ServerConfig {
		listen: server_addr(),
		transfer: TransferConfig::default(),
	};
	let uploads_for_handler = uploads.clone();
	let server_done = Arc::new(Mutex::new(Some(server_done_tx)));
	let mut server = TftpServer::new(reactor.clone(), config, Box::new(move |request| {
		assert_eq!(request.kind, RequestKind::Wrq);
		assert_eq!(request.filename, "upload.bin");

		let done = server_done.lock().unwrap().take().unwrap();
		RequestAction::Write {
			handler: Box::new(Recorder {
				buffer: Vec::new(),
				uploads: uploads_for_handler.clone(),
			}),
			negotiated: Options::new(),
			completion: Some(Box::new(move |status, _| {
				let _ = done.send(status);
			})),
		}
	}));
	tokio::spawn(async move { server.run().await });

	let payload = vec![0xA5u8; 700];
	let (completion, _log) = completion_recorder();
	let client = factory(&reactor, TransferConfig::default());
	let mut op = client.write_operation(
		request_params("upload.bin"),
		MemoryFile::from_data(payload.clone()),
		None,
		completion,
	).await.unwrap();

	assert_eq!(op.execute().await, TransferStatus::Successful);
	assert_eq!(server_done_rx.await.unwrap(), TransferStatus::Successful);
	assert_eq!(uploads.lock().unwrap()[0], payload);
}

///
/// Full download round through the listener with the filesystem request
/// handler and `blksize` negotiation on both sides.
///
#[tokio::test(start_paused = true)]
async fn listener_serves_file_with_negotiation() {
	let reactor = reactor();

	let root = std::env::temp_dir().join(format!("tftpkit-test-{}", std::process::id()));
	std::fs::create_dir_all(&root).unwrap();
	let payload: Vec<u8> = (0u32..3000).map(|i| (i % 251) as u8).collect();
	std::fs::write(root.join("image.bin"), &payload).unwrap();

	let mut transfer = TransferConfig::default();
	transfer.options = OptionsConfig {
		handle_transfer_size: true,
		block_size: Some(2048),
		timeout: Some(Duration::from_secs(10)),
	};

	let config = ServerConfig { listen: server_addr(), transfer };
	let mut server = TftpServer::new(reactor.clone(), config, fs_request_handler(root.clone()));
	tokio::spawn(async move { server.run().await });

	let mut client_config = TransferConfig::default();
	client_config.options = OptionsConfig {
		handle_transfer_size: true,
		block_size: Some(1024),
		timeout: Some(Duration::from_secs(5)),
	};

	let (completion, _log) = completion_recorder();
	let client = factory(&reactor, client_config);
	let mut op = client.read_operation(
		request_params("image.bin"),
		MemoryFile::new(),
		None,
		completion,
	).await.unwrap();

	assert_eq!(op.execute().await, TransferStatus::Successful);
	assert_eq!(op.handler().data(), &payload[..]);

	std::fs::remove_dir_all(&root).ok();
}

///
/// A download of a missing file is refused by the filesystem handler.
///
#[tokio::test(start_paused = true)]
async fn listener_file_not_found() {
	let reactor = reactor();

	let root = std::env::temp_dir().join(format!("tftpkit-test-missing-{}", std::process::id()));
	std::fs::create_dir_all(&root).unwrap();

	let config = ServerConfig {
		listen: server_addr(),
		transfer: TransferConfig::default(),
	};
	let mut server = TftpServer::new(reactor.clone(), config, fs_request_handler(root.clone()));
	tokio::spawn(async move { server.run().await });

	let (completion, log) = completion_recorder();
	let client = factory(&reactor, TransferConfig::default());
	let mut op = client.read_operation(
		request_params("does-not-exist"),
		MemoryFile::new(),
		None,
		completion,
	).await.unwrap();

	assert_eq!(op.execute().await, TransferStatus::RequestError);
	let log = log.lock().unwrap();
	assert_eq!(log[0].1.as_ref().unwrap().code, ErrorCode::FileNotFound);

	std::fs::remove_dir_all(&root).ok();
}

// ############################################################################
// #### CROSS-CUTTING #########################################################
// ############################################################################

///
/// Consecutive transfers on the same factory get distinct ephemeral
/// TIDs.
///
#[tokio::test(start_paused = true)]
async fn operations_use_distinct_local_ports() {
	let reactor = reactor();
	let client = factory(&reactor, TransferConfig::default());
	let (c1, _) = completion_recorder();
	let (c2, _) = completion_recorder();

	let op1 = client.read_operation(request_params("a"), MemoryFile::new(), None, c1)
		.await.unwrap();
	let op2 = client.read_operation(request_params("b"), MemoryFile::new(), None, c2)
		.await.unwrap();

	let p1 = op1.core().local_addr().unwrap().port();
	let p2 = op2.core().local_addr().unwrap().port();
	assert_ne!(p1, p2);
	assert_ne!(p1, SERVER_PORT);
	assert_ne!(p2, SERVER_PORT);
}

///
/// Timeout negotiation applies to the wait for the next DATA block: after
/// OACK with `timeout 3`, a silent gap of more than the default but less
/// than the negotiated timeout must not trip a retransmission.
///
#[tokio::test(start_paused = true)]
async fn client_read_applies_negotiated_timeout() {
	let reactor = reactor();
	let mut tid = Peer::bind(&reactor, SERVER_PORT).await;

	let mut config = TransferConfig::default();
	config.tftp_retries = 0;
	config.options.timeout = Some(Duration::from_secs(5));

	let (completion, _log) = completion_recorder();
	let client = factory(&reactor, config);
	let mut op = client.read_operation(request_params("slow"), MemoryFile::new(), None, completion)
		.await.unwrap();

	let script = async {
		let (_, client_addr) = tid.recv().await;

		tid.send(&oack(&[("timeout", "3")]), client_addr).await;

		let (pkt, _) = tid.recv().await;
		expect_ack(&pkt, 0);

		/* longer than the 2 s default, shorter than the negotiated 3 s */
		tokio::time::sleep(Duration::from_millis(2500)).await;
		tid.send(&data(1, vec![2u8; 10]), client_addr).await;

		let (pkt, _) = tid.recv().await;
		expect_ack(&pkt, 1);
	};

	let (status, _) = tokio::join!(op.execute(), script);
	assert_eq!(status, TransferStatus::Successful);
}

///
/// The default block size cap applies when nothing was negotiated: a
/// transfer of exactly 512 bytes needs a trailing empty DATA block.
///
#[tokio::test(start_paused = true)]
async fn client_read_empty_final_block() {
	let reactor = reactor();
	let mut tid = Peer::bind(&reactor, SERVER_PORT).await;

	let (completion, _log) = completion_recorder();
	let client = factory(&reactor, TransferConfig::default());
	let mut op = client.read_operation(request_params("exact"), MemoryFile::new(), None, completion)
		.await.unwrap();

	let script = async {
		let (_, client_addr) = tid.recv().await;

		tid.send(&data(1, vec![1u8; 512]), client_addr).await;
		let (pkt, _) = tid.recv().await;
		expect_ack(&pkt, 1);

		tid.send(&data(2, Vec::new()), client_addr).await;
		let (pkt, _) = tid.recv().await;
		expect_ack(&pkt, 2);
	};

	let (status, _) = tokio::join!(op.execute(), script);
	assert_eq!(status, TransferStatus::Successful);
	assert_eq!(op.handler().data().len(), 512);
}
