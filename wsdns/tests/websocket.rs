//! Socket-level tests for the WebSocket forwarder and acceptor

use std::collections::HashSet;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::opt::{EdnsCode, EdnsOption};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use wsdns::{Forwarder, Settings, UpstreamSpec, WebSocketForwarder, WsAcceptor, parse_upstream};

fn a_query(id: u16) -> Message {
    let mut req = Message::new();
    req.set_id(id);
    req.set_recursion_desired(true);
    req.add_query(Query::query(
        Name::from_str("example.com.").unwrap(),
        RecordType::A,
    ));
    req
}

fn answer_for(req: &Message) -> Message {
    let mut resp = Message::new();
    resp.set_id(req.id());
    resp.set_message_type(MessageType::Response);
    resp.set_op_code(req.op_code());
    resp.set_recursion_desired(req.recursion_desired());
    for query in req.queries() {
        resp.add_query(query.clone());
    }
    resp.add_answer(Record::from_rdata(
        Name::from_str("example.com.").unwrap(),
        300,
        RData::A(A(std::net::Ipv4Addr::new(93, 184, 216, 34))),
    ));
    resp
}

fn ede_text(resp: &Message) -> Option<String> {
    let edns = resp.extensions().as_ref()?;
    match edns.option(EdnsCode::Unknown(15)) {
        Some(EdnsOption::Unknown(_, data)) if data.len() >= 2 => {
            Some(String::from_utf8_lossy(&data[2..]).to_string())
        }
        _ => None,
    }
}

fn ws_forwarder(addr: SocketAddr, settings: &Settings) -> WebSocketForwarder {
    match parse_upstream(&format!("ws://{}/", addr)).unwrap() {
        UpstreamSpec::Ws { endpoint } => {
            WebSocketForwarder::new(endpoint, false, settings).unwrap()
        }
        other => panic!("not a ws spec: {:?}", other),
    }
}

/// WebSocket server that collects `batch` queries, records their wire
/// ids, then answers all of them at once
async fn spawn_batch_echo(batch: usize, seen_ids: Arc<Mutex<HashSet<u16>>>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut sink, mut source) = ws.split();

        let mut pending = Vec::new();
        while pending.len() < batch {
            match source.next().await {
                Some(Ok(WsMessage::Binary(data))) => {
                    let req = Message::from_vec(&data).unwrap();
                    seen_ids.lock().await.insert(req.id());
                    pending.push(req);
                }
                Some(Ok(_)) => continue,
                _ => return,
            }
        }
        for req in pending {
            let wire = answer_for(&req).to_vec().unwrap();
            let _ = sink.send(WsMessage::Binary(wire)).await;
        }
    });
    addr
}

/// WebSocket server that accepts the upgrade but never answers
async fn spawn_silent_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let (_sink, mut source) = ws.split();
                while let Some(Ok(_)) = source.next().await {}
            });
        }
    });
    addr
}

#[tokio::test]
async fn concurrent_forwards_rewrite_ids_and_restore_them() {
    let seen_ids = Arc::new(Mutex::new(HashSet::new()));
    let server = spawn_batch_echo(20, Arc::clone(&seen_ids)).await;

    let settings = Settings {
        timeout: Duration::from_secs(5),
        ..Settings::default()
    };
    let forwarder = Arc::new(ws_forwarder(server, &settings));

    // Every caller uses the same id; the wire must not.
    let mut handles = Vec::new();
    for _ in 0..20 {
        let forwarder = Arc::clone(&forwarder);
        handles.push(tokio::spawn(async move {
            forwarder.forward(a_query(0x1234)).await
        }));
    }

    for handle in handles {
        let resp = handle.await.unwrap().expect("response");
        assert_eq!(resp.id(), 0x1234);
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert_eq!(resp.answers().len(), 1);
    }

    // All twenty were in flight together, so their wire ids were
    // pairwise distinct.
    assert_eq!(seen_ids.lock().await.len(), 20);
}

#[tokio::test]
async fn forwards_beyond_the_admission_limit_are_refused() {
    let server = spawn_silent_server().await;

    let settings = Settings {
        requests_per_ws: 2,
        timeout: Duration::from_secs(1),
        ..Settings::default()
    };
    let forwarder = Arc::new(ws_forwarder(server, &settings));

    // Two slow forwards hold both slots.
    let mut held = Vec::new();
    for id in [1u16, 2] {
        let forwarder = Arc::clone(&forwarder);
        held.push(tokio::spawn(
            async move { forwarder.forward(a_query(id)).await },
        ));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut third = a_query(3);
    third
        .extensions_mut()
        .get_or_insert_with(Edns::new)
        .set_max_payload(1232);
    let resp = forwarder.forward(third).await.expect("response");
    assert_eq!(resp.id(), 3);
    assert_eq!(resp.response_code(), ResponseCode::Refused);
    let text = ede_text(&resp).expect("EDE option");
    assert!(text.contains("Too busy"), "text: {}", text);

    // The held forwards time out into SERVFAIL on their own.
    for handle in held {
        let resp = handle.await.unwrap().expect("response");
        assert_eq!(resp.response_code(), ResponseCode::ServFail);
    }
}

#[tokio::test]
async fn timed_out_forward_restores_the_original_id() {
    let server = spawn_silent_server().await;
    let settings = Settings {
        timeout: Duration::from_secs(1),
        ..Settings::default()
    };
    let forwarder = ws_forwarder(server, &settings);

    let mut req = a_query(0x0BAD);
    req.extensions_mut()
        .get_or_insert_with(Edns::new)
        .set_max_payload(1232);
    let resp = forwarder.forward(req).await.expect("response");
    assert_eq!(resp.id(), 0x0BAD);
    assert_eq!(resp.response_code(), ResponseCode::ServFail);
    let text = ede_text(&resp).expect("EDE option");
    assert!(text.contains("timeout"), "text: {}", text);
}

/// Mock plaintext upstream for acceptor tests
async fn spawn_udp_upstream() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(req) = Message::from_vec(&buf[..len]) else {
                continue;
            };
            let _ = socket
                .send_to(&answer_for(&req).to_vec().unwrap(), src)
                .await;
        }
    });
    addr
}

async fn spawn_acceptor(upstream_spec: &str, settings: Settings) -> SocketAddr {
    let settings = Arc::new(settings);
    let upstream = Arc::new(
        Forwarder::new(parse_upstream(upstream_spec).unwrap(), &settings).unwrap(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = WsAcceptor::new(upstream, None, settings);
    tokio::spawn(async move {
        let _ = acceptor.run(listener).await;
    });
    addr
}

#[tokio::test]
async fn acceptor_serves_a_round_trip() {
    let upstream = spawn_udp_upstream().await;
    let settings = Settings {
        timeout: Duration::from_secs(2),
        ..Settings::default()
    };
    let addr = spawn_acceptor(&upstream.to_string(), settings).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (ws, _) = tokio_tungstenite::client_async(format!("ws://{}/", addr), stream)
        .await
        .unwrap();
    let (mut sink, mut source) = ws.split();

    sink.send(WsMessage::Binary(a_query(0x9999).to_vec().unwrap()))
        .await
        .unwrap();

    let frame = timeout(Duration::from_secs(2), source.next())
        .await
        .expect("reply expected")
        .unwrap()
        .unwrap();
    let WsMessage::Binary(data) = frame else {
        panic!("expected a binary frame, got {:?}", frame);
    };
    let resp = Message::from_vec(&data).unwrap();
    assert_eq!(resp.id(), 0x9999);
    assert_eq!(resp.answers().len(), 1);
}

#[tokio::test]
async fn acceptor_refuses_sessions_beyond_the_global_limit() {
    let settings = Settings {
        max_websockets: 1,
        timeout: Duration::from_secs(2),
        ..Settings::default()
    };
    let addr = spawn_acceptor("127.0.0.1:1", settings).await;

    // First session occupies the only slot.
    let stream = TcpStream::connect(addr).await.unwrap();
    let (_held, _) = tokio_tungstenite::client_async(format!("ws://{}/", addr), stream)
        .await
        .unwrap();

    // Second upgrade must be turned away with 503.
    let stream = TcpStream::connect(addr).await.unwrap();
    let err = tokio_tungstenite::client_async(format!("ws://{}/", addr), stream)
        .await
        .expect_err("upgrade should be refused");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status().as_u16(), 503);
        }
        other => panic!("expected HTTP error, got {:?}", other),
    }
}

#[tokio::test]
async fn acceptor_rejects_unsupported_opcodes_in_band() {
    let upstream = spawn_udp_upstream().await;
    let settings = Settings {
        timeout: Duration::from_secs(2),
        ..Settings::default()
    };
    let addr = spawn_acceptor(&upstream.to_string(), settings).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (ws, _) = tokio_tungstenite::client_async(format!("ws://{}/", addr), stream)
        .await
        .unwrap();
    let (mut sink, mut source) = ws.split();

    let mut req = a_query(0x0AAA);
    req.set_op_code(OpCode::Status);
    sink.send(WsMessage::Binary(req.to_vec().unwrap()))
        .await
        .unwrap();

    let frame = timeout(Duration::from_secs(2), source.next())
        .await
        .expect("reply expected")
        .unwrap()
        .unwrap();
    let WsMessage::Binary(data) = frame else {
        panic!("expected a binary frame, got {:?}", frame);
    };
    let resp = Message::from_vec(&data).unwrap();
    assert_eq!(resp.id(), 0x0AAA);
    assert_eq!(resp.response_code(), ResponseCode::NotImp);
}

#[tokio::test]
async fn acceptor_closes_the_session_on_invalid_frames() {
    let upstream = spawn_udp_upstream().await;
    let settings = Settings {
        timeout: Duration::from_secs(2),
        ..Settings::default()
    };
    let addr = spawn_acceptor(&upstream.to_string(), settings).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (ws, _) = tokio_tungstenite::client_async(format!("ws://{}/", addr), stream)
        .await
        .unwrap();
    let (mut sink, mut source) = ws.split();

    sink.send(WsMessage::Text("not dns".into())).await.unwrap();

    let frame = timeout(Duration::from_secs(2), source.next())
        .await
        .expect("close expected")
        .unwrap()
        .unwrap();
    match frame {
        WsMessage::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Unsupported),
        other => panic!("expected a close frame, got {:?}", other),
    }
}
