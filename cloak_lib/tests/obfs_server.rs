mod common;

use cloak_lib::{
	crypto::{Cipher, Method},
	obfs::FAKE_RESPONSE,
	protocol::{SocksAddr, SocksDestination},
	server::{stat::Traffic, users::UserTable, Manager},
};
use common::{
	spawn_canary_upstream, spawn_echo_upstream, spawn_scripted_upstream, start_server, TestClient,
};
use std::{sync::Arc, time::Duration};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpStream, UdpSocket},
	runtime::Runtime,
	time::sleep,
};

const METHOD: Method = Method::Aes256Cfb;
const REQUEST_TAIL: &[u8] = b"GET / HTTP/1.0\r\n\r\n";

fn ipv4_target(addr: std::net::SocketAddr) -> SocksAddr {
	let ip = match addr.ip() {
		std::net::IpAddr::V4(ip) => ip,
		std::net::IpAddr::V6(_) => panic!("expected an IPv4 listener"),
	};
	SocksAddr::new(ip.into(), addr.port())
}

#[test]
fn test_happy_ipv4() {
	let rt = Runtime::new().unwrap();
	rt.block_on(async move {
		let (server, _users, traffic) = start_server(&[("u1", "p1")], METHOD).await;
		let (upstream, upstream_task) =
			spawn_scripted_upstream(REQUEST_TAIL.to_vec(), b"HELLO".to_vec()).await;

		let proto = Cipher::new(METHOD, "p1");
		let target = ipv4_target(upstream);
		let mut client = TestClient::connect(server, &proto, "u1", 0, &target, REQUEST_TAIL).await;

		assert_eq!(client.recv(5).await, b"HELLO");
		upstream_task.await.unwrap();

		// Both splice directions land on u1's counter.
		sleep(Duration::from_millis(200)).await;
		assert_eq!(traffic.snapshot().get("u1").copied(), Some(5));
	});
}

#[test]
fn test_happy_domain() {
	let rt = Runtime::new().unwrap();
	rt.block_on(async move {
		let (server, _users, _traffic) = start_server(&[("u1", "p1")], METHOD).await;
		let (upstream, upstream_task) =
			spawn_scripted_upstream(REQUEST_TAIL.to_vec(), b"WORLD".to_vec()).await;

		let proto = Cipher::new(METHOD, "p1");
		let target = SocksAddr::new(
			SocksDestination::new_domain("localhost").unwrap(),
			upstream.port(),
		);
		let mut client = TestClient::connect(server, &proto, "u1", 0, &target, REQUEST_TAIL).await;

		assert_eq!(client.recv(5).await, b"WORLD");
		upstream_task.await.unwrap();
	});
}

#[test]
fn test_happy_rc4_md5() {
	let rt = Runtime::new().unwrap();
	rt.block_on(async move {
		let (server, _users, _traffic) = start_server(&[("u1", "p1")], Method::Rc4Md5).await;
		let (upstream, upstream_task) =
			spawn_scripted_upstream(REQUEST_TAIL.to_vec(), b"RC4OK".to_vec()).await;

		let proto = Cipher::new(Method::Rc4Md5, "p1");
		let target = ipv4_target(upstream);
		let mut client = TestClient::connect(server, &proto, "u1", 0, &target, REQUEST_TAIL).await;

		assert_eq!(client.recv(5).await, b"RC4OK");
		upstream_task.await.unwrap();
	});
}

#[test]
fn test_random_head_carries_iv() {
	let rt = Runtime::new().unwrap();
	rt.block_on(async move {
		let (server, _users, _traffic) = start_server(&[("u1", "p1")], METHOD).await;
		let proto = Cipher::new(METHOD, "p1");

		// A prefix of the IV in the URL...
		{
			let (upstream, task) =
				spawn_scripted_upstream(REQUEST_TAIL.to_vec(), b"HEAD3".to_vec()).await;
			let target = ipv4_target(upstream);
			let mut client =
				TestClient::connect(server, &proto, "u1", 3, &target, REQUEST_TAIL).await;
			assert_eq!(client.recv(5).await, b"HEAD3");
			task.await.unwrap();
		}
		// ...and the whole IV in the URL.
		{
			let (upstream, task) =
				spawn_scripted_upstream(REQUEST_TAIL.to_vec(), b"HEADF".to_vec()).await;
			let target = ipv4_target(upstream);
			let iv_len = proto.iv_len();
			let mut client =
				TestClient::connect(server, &proto, "u1", iv_len, &target, REQUEST_TAIL).await;
			assert_eq!(client.recv(5).await, b"HEADF");
			task.await.unwrap();
		}
	});
}

#[test]
fn test_unknown_identifier_gets_decoy() {
	let rt = Runtime::new().unwrap();
	rt.block_on(async move {
		let (server, _users, _traffic) = start_server(&[("u1", "p1")], METHOD).await;
		let (upstream, dialed) = spawn_canary_upstream().await;

		let proto = Cipher::new(METHOD, "p1");
		let target = ipv4_target(upstream);
		let client = TestClient::connect(server, &proto, "unknown", 0, &target, b"").await;

		let reply = client.read_raw_to_end().await;
		assert_eq!(reply, FAKE_RESPONSE);

		sleep(Duration::from_millis(200)).await;
		assert!(
			!dialed.load(std::sync::atomic::Ordering::SeqCst),
			"no upstream dial may happen for a rejected client"
		);
	});
}

#[test]
fn test_malformed_greeting_gets_decoy() {
	let rt = Runtime::new().unwrap();
	rt.block_on(async move {
		let (server, _users, _traffic) = start_server(&[("u1", "p1")], METHOD).await;

		let mut stream = TcpStream::connect(server).await.unwrap();
		stream.write_all(b"not http").await.unwrap();

		let mut reply = Vec::new();
		stream.read_to_end(&mut reply).await.unwrap();
		assert_eq!(reply, FAKE_RESPONSE);
	});
}

#[test]
fn test_manager_add_remove() {
	let rt = Runtime::new().unwrap();
	rt.block_on(async move {
		let users = Arc::new(UserTable::new(METHOD));
		let traffic = Arc::new(Traffic::new());

		// Relay server sharing the table with the manager.
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let server_addr = listener.local_addr().unwrap();
		let server = Arc::new(cloak_lib::Server::new(
			server_addr,
			users.clone(),
			traffic.clone(),
			300,
			false,
		));
		tokio::spawn(server.serve_listener(listener));

		let manager_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let manager_addr = manager_socket.local_addr().unwrap();
		let manager = Manager::new(manager_addr, users.clone(), traffic.clone());
		tokio::spawn(manager.serve_socket(manager_socket));

		let control = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let mut buf = [0_u8; 128];

		// ping -> pong
		control.send_to(b"ping", manager_addr).await.unwrap();
		let (n, _) = control.recv_from(&mut buf).await.unwrap();
		assert_eq!(&buf[..n], b"pong");

		// add u9
		control
			.send_to(
				br#"add: {"server_port": "u9", "password": "pp"}"#,
				manager_addr,
			)
			.await
			.unwrap();
		let (n, _) = control.recv_from(&mut buf).await.unwrap();
		assert_eq!(&buf[..n], b"ok");

		// u9 can now connect and relay through an echo upstream.
		let upstream = spawn_echo_upstream().await;
		let proto = Cipher::new(METHOD, "pp");
		let target = ipv4_target(upstream);
		let mut established =
			TestClient::connect(server_addr, &proto, "u9", 0, &target, b"").await;
		established.send(b"ping1").await;
		assert_eq!(established.recv(5).await, b"ping1");

		// remove u9
		control
			.send_to(br#"remove: {"server_port": "u9"}"#, manager_addr)
			.await
			.unwrap();
		let (n, _) = control.recv_from(&mut buf).await.unwrap();
		assert_eq!(&buf[..n], b"ok");

		// The established connection keeps its cloned cipher state.
		established.send(b"ping2").await;
		assert_eq!(established.recv(5).await, b"ping2");

		// A new connection with cid=u9 is rejected with the decoy.
		let rejected = TestClient::connect(server_addr, &proto, "u9", 0, &target, b"").await;
		assert_eq!(rejected.read_raw_to_end().await, FAKE_RESPONSE);
	});
}
