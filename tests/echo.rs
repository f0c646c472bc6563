//! End-to-end echo tests over plaintext connections.

use floodgate::config::{Config, Dispatch, Topology};
use floodgate::protocol::{pack, read_frame, Message, HEADER_SIZE, MAGIC};
use floodgate::server::{Server, ServerHandle};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

const TEST_MAX: usize = 1 << 20;

fn test_config(topology: Topology, dispatch: Dispatch) -> Config {
    Config {
        listen: "127.0.0.1:0".to_string(),
        topology,
        dispatch,
        shards: 2,
        batch_size: 64,
        tls: None,
        max_frame_len: TEST_MAX,
        log_level: "info".to_string(),
    }
}

fn start_server(config: Config) -> ServerHandle {
    let server = Server::bind(&config).unwrap();
    let handle = server.handle();
    thread::spawn(move || server.run());
    handle
}

fn echo_once(stream: &mut TcpStream, body: &[u8]) {
    stream.write_all(&pack(body)).unwrap();
    let (header, echoed) = read_frame(stream, TEST_MAX).unwrap();
    assert_eq!(header.magic, MAGIC);
    assert_eq!(echoed, body);
}

#[test]
fn test_reactor_echo_round_trip() {
    let handle = start_server(test_config(Topology::Single, Dispatch::Reactor));
    let mut stream = TcpStream::connect(handle.local_addr()).unwrap();

    let body = serde_json::to_vec(&Message { id: 7, ts: 1000 }).unwrap();
    echo_once(&mut stream, &body);

    // The connection stays open: a second request on the same stream works.
    echo_once(&mut stream, b"second frame");
}

#[test]
fn test_bad_magic_closes_connection_without_reply() {
    let handle = start_server(test_config(Topology::Single, Dispatch::Reactor));
    let mut stream = TcpStream::connect(handle.local_addr()).unwrap();

    let mut frame = pack(b"payload").to_vec();
    frame[..4].copy_from_slice(&0xDEADBEEFu32.to_be_bytes());
    stream.write_all(&frame).unwrap();

    // The server must close without responding: the next read observes
    // either a clean EOF or a reset, never frame bytes.
    let mut buf = [0u8; HEADER_SIZE];
    match stream.read(&mut buf) {
        Ok(n) => assert_eq!(n, 0, "server must not reply to a corrupt frame"),
        Err(_) => {}
    }
}

#[test]
fn test_sharded_topology_echo() {
    let handle = start_server(test_config(Topology::Sharded, Dispatch::Reactor));

    // Several concurrent clients, spread by the kernel across shards.
    let mut clients: Vec<_> = (0..8)
        .map(|_| TcpStream::connect(handle.local_addr()).unwrap())
        .collect();
    for (i, stream) in clients.iter_mut().enumerate() {
        let body = serde_json::to_vec(&Message {
            id: i as u64,
            ts: 1000,
        })
        .unwrap();
        echo_once(stream, &body);
    }

    // Interleaved second round on the same connections.
    for stream in clients.iter_mut() {
        echo_once(stream, b"again");
    }
}

#[test]
fn test_blocking_dispatch_echo() {
    let handle = start_server(test_config(Topology::Single, Dispatch::Blocking));
    let mut stream = TcpStream::connect(handle.local_addr()).unwrap();

    echo_once(&mut stream, b"blocking mode");
    echo_once(&mut stream, b"still the same protocol");
}

#[test]
fn test_listener_close_keeps_registered_connections() {
    let config = test_config(Topology::Single, Dispatch::Reactor);
    let server = Server::bind(&config).unwrap();
    let handle = server.handle();
    let runner = thread::spawn(move || server.run());

    let mut stream = TcpStream::connect(handle.local_addr()).unwrap();
    echo_once(&mut stream, b"before close");

    handle.close_listeners();
    thread::sleep(Duration::from_millis(100));

    // The registered connection survives the listener.
    echo_once(&mut stream, b"after close");

    // Once the last connection goes away the shard drains and run returns.
    drop(stream);
    runner.join().unwrap().unwrap();
}

#[test]
fn test_empty_body_echo() {
    let handle = start_server(test_config(Topology::Single, Dispatch::Reactor));
    let mut stream = TcpStream::connect(handle.local_addr()).unwrap();
    echo_once(&mut stream, b"");
}
