#![allow(dead_code)]

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record};
use pollproxy::Socks5Server;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Address handed to proxies in tests that never resolve a domain
pub const UNUSED_DNS: &str = "127.0.0.1:53";

/// spawn_proxy binds a proxy on an ephemeral port and runs it on its own thread
pub fn spawn_proxy(server: Socks5Server) -> SocketAddr {
    let mut server = server;
    let addr = server.bind().expect("proxy should bind");
    std::thread::spawn(move || server.run());
    addr
}

pub fn proxy_without_dns() -> SocketAddr {
    spawn_proxy(Socks5Server::new("127.0.0.1:0").with_dns_server(UNUSED_DNS.parse().unwrap()))
}

/// handshake connects to the proxy and negotiates no-auth
pub async fn handshake(proxy: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    assert_eq!(read_n(&mut stream, 2).await, vec![0x05, 0x00]);
    stream
}

pub fn connect_ipv4(target: SocketAddr) -> Vec<u8> {
    let SocketAddr::V4(target) = target else {
        panic!("expected an IPv4 target");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&target.ip().octets());
    request.extend_from_slice(&target.port().to_be_bytes());
    request
}

pub fn connect_ipv6(target: SocketAddr) -> Vec<u8> {
    let SocketAddr::V6(target) = target else {
        panic!("expected an IPv6 target");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x04];
    request.extend_from_slice(&target.ip().octets());
    request.extend_from_slice(&target.port().to_be_bytes());
    request
}

pub fn connect_domain(domain: &str, port: u16) -> Vec<u8> {
    let mut request = vec![0x05, 0x01, 0x00, 0x03, domain.len() as u8];
    request.extend_from_slice(domain.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    request
}

/// The reply to a request echoes its address fields, so it has the same length
pub fn reply_len(request: &[u8]) -> usize {
    request.len()
}

pub async fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    timeout(IO_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("timed out reading from proxy")
        .expect("read from proxy failed");
    buf
}

/// assert_closed waits for EOF, tolerating a reset
pub async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let result = timeout(IO_TIMEOUT, stream.read(&mut buf))
        .await
        .expect("timed out waiting for close");
    match result {
        Ok(n) => assert_eq!(n, 0, "expected EOF, got {:?}", &buf[..n]),
        Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
    }
}

/// FakeDns answers every A query with a fixed outcome and counts queries
pub struct FakeDns {
    pub addr: SocketAddr,
    queries: Arc<AtomicUsize>,
}

impl FakeDns {
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy)]
pub enum DnsBehavior {
    Answer(Ipv4Addr),
    /// An undecodable datagram queued right before the real answer
    GarbageThenAnswer(Ipv4Addr),
    Fail(ResponseCode),
    Silent,
}

pub async fn spawn_fake_dns(behavior: DnsBehavior, delay: Duration) -> FakeDns {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let queries = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&queries);

    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);

            let request = Message::from_vec(&buf[..len]).unwrap();
            let response = match behavior {
                DnsBehavior::Silent => continue,
                DnsBehavior::Answer(ip) => build_response(&request, ResponseCode::NoError, Some(ip)),
                DnsBehavior::GarbageThenAnswer(ip) => {
                    socket.send_to(&[0xFF, 0xFF, 0xFF], from).await.unwrap();
                    build_response(&request, ResponseCode::NoError, Some(ip))
                }
                DnsBehavior::Fail(code) => build_response(&request, code, None),
            };

            tokio::time::sleep(delay).await;
            socket
                .send_to(&response.to_vec().unwrap(), from)
                .await
                .unwrap();
        }
    });

    FakeDns { addr, queries }
}

fn build_response(request: &Message, code: ResponseCode, answer: Option<Ipv4Addr>) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(code);

    for query in request.queries() {
        response.add_query(query.clone());
        if let Some(ip) = answer {
            response.add_answer(Record::from_rdata(query.name().clone(), 60, RData::A(A(ip))));
        }
    }
    response
}
