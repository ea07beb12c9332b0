//! Loopback tests driving a real client connection against a scripted
//! in-process server.

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::mpsc::{channel, Receiver},
    thread,
    time::Duration,
};

use websock::{handshake::derive_accept_key, WebSocket};

const WAIT: Duration = Duration::from_secs(10);

/// Spawn a scripted server on an ephemeral port and hand the accepted
/// socket to the given script.
fn spawn_server(script: impl FnOnce(TcpStream) + Send + 'static) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    thread::spawn(move || {
        let (socket, _) = listener.accept().expect("accept");
        script(socket);
    });
    addr
}

/// Read the upgrade request, check its shape, and reply with a valid 101.
fn accept_handshake(socket: &mut TcpStream) -> String {
    let request = read_until_headers_end(socket);
    assert!(request.starts_with("GET "), "{request}");
    assert!(request.contains("Upgrade: websocket"), "{request}");
    assert!(request.contains("Sec-WebSocket-Version: 13"), "{request}");

    let key = request
        .lines()
        .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
        .expect("request has no key")
        .trim()
        .to_string();
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        derive_accept_key(key.as_bytes())
    );
    socket.write_all(response.as_bytes()).expect("write response");
    request
}

fn read_until_headers_end(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        assert_ne!(socket.read(&mut byte).expect("read request"), 0, "eof in request");
        buf.push(byte[0]);
    }
    String::from_utf8(buf).expect("request is utf8")
}

/// Read one frame from the client, unmasking it. Returns (opcode, payload).
fn read_client_frame(socket: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut head = [0u8; 2];
    socket.read_exact(&mut head).expect("frame head");
    let opcode = head[0] & 0x0F;
    assert_eq!(head[1] & 0x80, 0x80, "client frames must be masked");
    let len = match head[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            socket.read_exact(&mut ext).expect("extended length");
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            socket.read_exact(&mut ext).expect("extended length");
            u64::from_be_bytes(ext) as usize
        }
        n => n as usize,
    };
    let mut mask = [0u8; 4];
    socket.read_exact(&mut mask).expect("mask key");
    let mut payload = vec![0u8; len];
    socket.read_exact(&mut payload).expect("payload");
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
    (opcode, payload)
}

struct Events {
    connected: Receiver<()>,
    texts: Receiver<String>,
    datas: Receiver<Vec<u8>>,
    pongs: Receiver<Vec<u8>>,
    disconnected: Receiver<Option<u16>>,
}

/// Wire channel-backed observers into the client.
fn observe(ws: &WebSocket) -> Events {
    let (connect_tx, connected) = channel();
    let (text_tx, texts) = channel();
    let (data_tx, datas) = channel();
    let (pong_tx, pongs) = channel();
    let (disconnect_tx, disconnected) = channel();
    ws.on_connect(move || {
        let _ = connect_tx.send(());
    });
    ws.on_text(move |text| {
        let _ = text_tx.send(text.to_string());
    });
    ws.on_data(move |data| {
        let _ = data_tx.send(data.to_vec());
    });
    ws.on_pong(move |data| {
        let _ = pong_tx.send(data.to_vec());
    });
    ws.on_disconnect(move |error| {
        let _ = disconnect_tx.send(error.map(|e| e.code()));
    });
    Events { connected, texts, datas, pongs, disconnected }
}

#[test]
fn full_session() {
    let _ = env_logger::try_init();

    let addr = spawn_server(|mut socket| {
        accept_handshake(&mut socket);

        // The client says hello first.
        let (opcode, payload) = read_client_frame(&mut socket);
        assert_eq!(opcode, 0x1);
        assert_eq!(payload, b"hi server");

        // Unfragmented text, a fragmented one, a ping, a pong, binary.
        socket.write_all(&[0x81, 0x05, 0x48, 0x65, 0x6C, 0x6C, 0x6F]).unwrap();
        socket.write_all(&[0x01, 0x03, 0x57, 0x6F, 0x72]).unwrap();
        socket.write_all(&[0x80, 0x02, 0x6C, 0x64]).unwrap();
        socket.write_all(&[0x89, 0x04, 0x70, 0x69, 0x6E, 0x67]).unwrap();
        socket.write_all(&[0x8A, 0x02, 0x68, 0x69]).unwrap();
        socket.write_all(&[0x82, 0x03, 0x01, 0x02, 0x03]).unwrap();

        // The ping must come back as a pong with the same payload.
        let (opcode, payload) = read_client_frame(&mut socket);
        assert_eq!(opcode, 0xA);
        assert_eq!(payload, b"ping");

        // Close with code 1000; expect the echo, then drop the socket.
        socket.write_all(&[0x88, 0x02, 0x03, 0xE8]).unwrap();
        let (opcode, payload) = read_client_frame(&mut socket);
        assert_eq!(opcode, 0x8);
        assert_eq!(payload, [0x03, 0xE8]);
    });

    let ws = WebSocket::new(&format!("ws://{addr}/session")).unwrap();
    let events = observe(&ws);
    ws.connect().unwrap();

    events.connected.recv_timeout(WAIT).expect("on_connect");
    assert!(ws.is_connected());
    ws.write_text("hi server");

    assert_eq!(events.texts.recv_timeout(WAIT).unwrap(), "Hello");
    assert_eq!(events.texts.recv_timeout(WAIT).unwrap(), "World");
    assert_eq!(events.pongs.recv_timeout(WAIT).unwrap(), b"hi");
    assert_eq!(events.datas.recv_timeout(WAIT).unwrap(), [0x01, 0x02, 0x03]);

    // Close handshake: disconnect carries the close code, exactly once.
    assert_eq!(events.disconnected.recv_timeout(WAIT).unwrap(), Some(1000));
    assert!(!ws.is_connected());
    assert!(events.disconnected.recv_timeout(Duration::from_millis(300)).is_err());
}

#[test]
fn handshake_rejection_reports_status() {
    let addr = spawn_server(|mut socket| {
        read_until_headers_end(&mut socket);
        socket
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
    });

    let ws = WebSocket::new(&format!("ws://{addr}/")).unwrap();
    let events = observe(&ws);
    ws.connect().unwrap();

    assert_eq!(events.disconnected.recv_timeout(WAIT).unwrap(), Some(404));
    assert!(events.connected.try_recv().is_err(), "on_connect must not fire");
}

#[test]
fn local_disconnect_sends_close_frame() {
    let addr = spawn_server(|mut socket| {
        accept_handshake(&mut socket);

        // The client starts the close handshake.
        let (opcode, payload) = read_client_frame(&mut socket);
        assert_eq!(opcode, 0x8);
        assert_eq!(payload, [0x03, 0xE8]);

        // Echo it and drive the EOF, as the server is supposed to.
        socket.write_all(&[0x88, 0x02, 0x03, 0xE8]).unwrap();
    });

    let ws = WebSocket::new(&format!("ws://{addr}/")).unwrap();
    let events = observe(&ws);
    ws.connect().unwrap();
    events.connected.recv_timeout(WAIT).expect("on_connect");

    ws.disconnect(None);
    // A locally initiated clean close reports no error.
    assert_eq!(events.disconnected.recv_timeout(WAIT).unwrap(), None);
    assert!(!ws.is_connected());
}

#[test]
fn protocol_violation_fails_the_connection() {
    let addr = spawn_server(|mut socket| {
        accept_handshake(&mut socket);

        // Invalid UTF-8 inside a text message.
        socket.write_all(&[0x81, 0x02, 0xC3, 0x28]).unwrap();

        // The client must fail the connection with close code 1007.
        let (opcode, payload) = read_client_frame(&mut socket);
        assert_eq!(opcode, 0x8);
        assert_eq!(payload, [0x03, 0xEF]);
    });

    let ws = WebSocket::new(&format!("ws://{addr}/")).unwrap();
    let events = observe(&ws);
    ws.connect().unwrap();
    events.connected.recv_timeout(WAIT).expect("on_connect");

    assert_eq!(events.disconnected.recv_timeout(WAIT).unwrap(), Some(1007));
    assert!(events.texts.try_recv().is_err(), "no text may be dispatched");
}

#[test]
fn subprotocol_is_captured() {
    let addr = spawn_server(|mut socket| {
        let request = read_until_headers_end(&mut socket);
        assert!(request.contains("Sec-WebSocket-Protocol: chat.v2, chat.v1"), "{request}");
        let key = request
            .lines()
            .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
            .unwrap()
            .trim()
            .to_string();
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Protocol: chat.v2\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            derive_accept_key(key.as_bytes())
        );
        socket.write_all(response.as_bytes()).unwrap();

        // Hold the socket open until the client learned the protocol.
        let mut buf = [0u8; 1];
        let _ = socket.read(&mut buf);
    });

    let ws = WebSocket::with_protocols(&format!("ws://{addr}/"), &["chat.v2", "chat.v1"]).unwrap();
    let events = observe(&ws);
    ws.connect().unwrap();
    events.connected.recv_timeout(WAIT).expect("on_connect");

    assert_eq!(ws.protocol().as_deref(), Some("chat.v2"));
    ws.disconnect(Some(Duration::ZERO));
    events.disconnected.recv_timeout(WAIT).expect("on_disconnect");
}
