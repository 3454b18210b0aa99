use cloak_lib::{
	crypto::{Cipher, ConnCipher},
	obfs::OBFS_RESPONSE,
	protocol::SocksAddr,
	server::{stat::Traffic, users::UserTable, Server},
};
use std::{
	net::SocketAddr,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpListener, TcpStream},
	task::JoinHandle,
};

/// Build the HTTP-shaped greeting carrying `id` in the cookie and
/// `random_head` as percent-encoded pairs in the path, followed by the
/// encrypted `body`.
pub fn build_greeting(id: &str, random_head: &[u8], body: &[u8]) -> Vec<u8> {
	let mut path = String::from("/");
	for b in random_head {
		path.push_str(&format!("%{:02x}", b));
	}
	let mut buf = format!(
		"GET {} HTTP/1.1\r\n\
		Host: www.baidu.com\r\n\
		Accept: */*\r\n\
		Cookie: sid=fe12; cid={}; path=/\r\n\
		\r\n",
		path, id
	)
	.into_bytes();
	buf.extend_from_slice(body);
	buf
}

/// Start a relay server with the given users on an ephemeral port.
pub async fn start_server(
	users: &[(&str, &str)],
	method: cloak_lib::crypto::Method,
) -> (SocketAddr, Arc<UserTable>, Arc<Traffic>) {
	let table = Arc::new(UserTable::new(method));
	for (id, password) in users {
		table.insert(id, password);
	}
	let traffic = Arc::new(Traffic::new());
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let server = Arc::new(Server::new(
		addr,
		table.clone(),
		traffic.clone(),
		300,
		false,
	));
	tokio::spawn(server.serve_listener(listener));
	(addr, table, traffic)
}

/// Upstream that expects one connection sending exactly `expect`, then
/// answers `reply`. The returned handle re-raises assertion failures.
pub async fn spawn_scripted_upstream(
	expect: Vec<u8>,
	reply: Vec<u8>,
) -> (SocketAddr, JoinHandle<()>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let handle = tokio::spawn(async move {
		let (mut stream, _) = listener.accept().await.unwrap();
		if !expect.is_empty() {
			let mut buf = vec![0_u8; expect.len()];
			stream.read_exact(&mut buf).await.unwrap();
			assert_eq!(buf, expect, "upstream received unexpected bytes");
		}
		stream.write_all(&reply).await.unwrap();
		stream.shutdown().await.unwrap();
		let mut sink = Vec::new();
		let _ = stream.read_to_end(&mut sink).await;
	});
	(addr, handle)
}

/// Upstream that echoes every byte back, serving any number of
/// connections.
pub async fn spawn_echo_upstream() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		loop {
			let (mut stream, _) = match listener.accept().await {
				Ok(v) => v,
				Err(_) => return,
			};
			tokio::spawn(async move {
				let mut buf = [0_u8; 4096];
				loop {
					let n = match stream.read(&mut buf).await {
						Ok(0) | Err(_) => return,
						Ok(n) => n,
					};
					if stream.write_all(&buf[..n]).await.is_err() {
						return;
					}
				}
			});
		}
	});
	addr
}

/// Upstream that only records whether anybody dialed it.
pub async fn spawn_canary_upstream() -> (SocketAddr, Arc<AtomicBool>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let dialed = Arc::new(AtomicBool::new(false));
	let flag = dialed.clone();
	tokio::spawn(async move {
		if listener.accept().await.is_ok() {
			flag.store(true, Ordering::SeqCst);
		}
	});
	(addr, dialed)
}

/// A client speaking the obfuscation protocol, keeping its cipher
/// state across the whole connection like a real one would.
pub struct TestClient {
	stream: TcpStream,
	cipher: ConnCipher,
	iv_len: usize,
	response_seen: bool,
}

impl TestClient {
	/// Connect and send the whole greeting. The encrypted preamble is
	/// `target` followed by `tail`; the first `head_len` bytes of
	/// `IV || ciphertext` travel in the URL instead of the body.
	pub async fn connect(
		server: SocketAddr,
		proto: &Cipher,
		id: &str,
		head_len: usize,
		target: &SocksAddr,
		tail: &[u8],
	) -> Self {
		use bytes::BufMut as _;

		let mut cipher = proto.make_conn();
		let iv = cipher.init_encrypt().unwrap();

		let mut plain = Vec::new();
		target.write_to(&mut plain);
		plain.put_slice(tail);
		let mut body = iv;
		let pos = body.len();
		body.resize(pos + plain.len(), 0);
		cipher.encrypt(&plain, &mut body[pos..]).unwrap();

		let greeting = build_greeting(id, &body[..head_len], &body[head_len..]);
		let mut stream = TcpStream::connect(server).await.unwrap();
		stream.write_all(&greeting).await.unwrap();

		Self {
			stream,
			cipher,
			iv_len: proto.iv_len(),
			response_seen: false,
		}
	}

	/// Encrypt and send payload bytes.
	pub async fn send(&mut self, plain: &[u8]) {
		let mut ct = vec![0_u8; plain.len()];
		self.cipher.encrypt(plain, &mut ct).unwrap();
		self.stream.write_all(&ct).await.unwrap();
	}

	/// Receive and decrypt exactly `n` payload bytes. The first call
	/// checks the fixed response header and recovers the server IV.
	pub async fn recv(&mut self, n: usize) -> Vec<u8> {
		if !self.response_seen {
			let mut header = vec![0_u8; OBFS_RESPONSE.len()];
			self.stream.read_exact(&mut header).await.unwrap();
			assert_eq!(
				header, OBFS_RESPONSE,
				"reply must start with the fixed response header"
			);
			let mut iv = vec![0_u8; self.iv_len];
			self.stream.read_exact(&mut iv).await.unwrap();
			self.cipher.init_decrypt(&iv).unwrap();
			self.response_seen = true;
		}
		let mut ct = vec![0_u8; n];
		self.stream.read_exact(&mut ct).await.unwrap();
		let mut plain = vec![0_u8; n];
		self.cipher.decrypt(&ct, &mut plain).unwrap();
		plain
	}

	pub async fn read_raw_to_end(mut self) -> Vec<u8> {
		let mut data = Vec::new();
		self.stream.read_to_end(&mut data).await.unwrap();
		data
	}
}
