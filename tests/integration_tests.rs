mod common;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{init_logger, Number, TextCodec};
use rapid_mux::{
    BoxError, Client, ClientConfig, ClientEvent, MessageHandler, NetError, RapidTlvMessage, Server,
    ServerConfig, ServerError, ServerEvent, TlvCodec, Unsupported,
};
use rapid_mux::frame::{FrameKind, HEADER_LEN};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::{self, Receiver};
use tokio::time::{sleep, timeout};

const EVT_MSG: u8 = 0x10;
const FLD_KEY: u8 = 0x10;

/* ------------------------------------------------------------------------ */
/* Helpers                                                                  */
/* ------------------------------------------------------------------------ */

async fn echo(_remote: SocketAddr, msg: String) -> Result<Option<String>, BoxError> {
    match msg.as_str() {
        "answer" => Ok(Some("42".to_string())),
        "slow" => {
            sleep(Duration::from_secs(10)).await;
            Ok(Some("finally".to_string()))
        }
        _ => Ok(Some(format!("echo:{msg}"))),
    }
}

/// Forwards every inbound message to a channel and answers nothing.
fn collector() -> (impl MessageHandler<String>, Receiver<String>) {
    let (tx, rx) = mpsc::channel(16);
    let handler = move |_remote: SocketAddr, msg: String| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(msg).await;
            Ok::<Option<String>, BoxError>(None)
        }
    };
    (handler, rx)
}

async fn start_server<H>(cfg: ServerConfig, handler: H) -> (Arc<Server<TextCodec>>, Receiver<ServerEvent>)
where
    H: MessageHandler<String>,
{
    init_logger();
    let server = Server::bind(cfg, TextCodec, handler).await.expect("bind");
    let (tx, rx) = mpsc::channel(100);
    tokio::spawn({
        let server = server.clone();
        async move { server.run(tx).await }
    });
    (server, rx)
}

fn server_cfg() -> ServerConfig {
    ServerConfig::new("127.0.0.1:0".to_string(), true).without_keep_alive()
}

fn client_cfg(server: &Server<TextCodec>) -> ClientConfig {
    ClientConfig::new(server.local_addr().to_string(), true).without_keep_alive()
}

async fn next_event(events: &mut Receiver<ServerEvent>) -> ServerEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("server event timeout")
        .expect("event channel closed")
}

async fn connected_addr(events: &mut Receiver<ServerEvent>) -> SocketAddr {
    match next_event(events).await {
        ServerEvent::Connected { remote, .. } => remote,
        other => panic!("unexpected server event {other:?}"),
    }
}

/* ------------------------------------------------------------------------ */
/* Request / response                                                       */
/* ------------------------------------------------------------------------ */

#[tokio::test]
async fn client_request_is_answered() {
    let (server, mut events) = start_server(server_cfg(), echo).await;
    let client = Client::connect(&client_cfg(&server), TextCodec, Unsupported).await.expect("connect");
    connected_addr(&mut events).await;

    assert_eq!(client.send("hello".to_string()).await.unwrap(), "echo:hello");
    assert_eq!(client.pending_count(), 0);
    assert_eq!(server.connection_count(), 1);
    assert_eq!(client.remote_addr(), server.local_addr());
}

#[tokio::test]
async fn server_can_ask_the_client() {
    let (server, mut events) = start_server(server_cfg(), Unsupported).await;
    let client = Client::connect(&client_cfg(&server), TextCodec, echo).await.expect("connect");
    let addr = connected_addr(&mut events).await;

    assert_eq!(server.send_to(&addr, "from server".to_string()).await.unwrap(), "echo:from server");
    let answer: Number = server.call_to(&addr, "answer".to_string()).await.unwrap();
    assert_eq!(answer, Number(42));

    // the server's handler declines everything
    assert_eq!(client.send("anything".to_string()).await.unwrap_err(), NetError::NotSupported);
}

#[tokio::test]
async fn call_converts_the_reply() {
    let (server, mut events) = start_server(server_cfg(), echo).await;
    let client = Client::connect(&client_cfg(&server), TextCodec, Unsupported).await.expect("connect");
    connected_addr(&mut events).await;

    let number: Number = client.call("answer".to_string()).await.unwrap();
    assert_eq!(number, Number(42));
    assert_eq!(client.call::<Number>("x".to_string()).await.unwrap_err(), NetError::UnexpectedReply);
}

#[tokio::test]
async fn many_concurrent_requests_on_one_connection() {
    let (server, mut events) = start_server(server_cfg(), echo).await;
    let client = Client::connect(&client_cfg(&server), TextCodec, Unsupported).await.expect("connect");
    connected_addr(&mut events).await;

    let replies = futures::future::join_all((0..100).map(|n| client.send(format!("m{n}")))).await;
    for (n, reply) in replies.into_iter().enumerate() {
        assert_eq!(reply.unwrap(), format!("echo:m{n}"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_blocking_from_a_plain_thread() {
    let (server, mut events) = start_server(server_cfg(), echo).await;
    let client = Client::connect(&client_cfg(&server), TextCodec, Unsupported).await.expect("connect");
    connected_addr(&mut events).await;

    let (client, reply) = tokio::task::spawn_blocking(move || {
        let reply = client.send_blocking("blocking".to_string());
        (client, reply)
    })
    .await
    .unwrap();

    assert_eq!(reply.unwrap(), "echo:blocking");
    assert!(client.is_connected());
}

#[tokio::test]
async fn client_ping() {
    let (server, mut events) = start_server(server_cfg(), Unsupported).await;
    let client = Client::connect(&client_cfg(&server), TextCodec, Unsupported).await.expect("connect");
    let addr = connected_addr(&mut events).await;

    assert!(client.ping().await.unwrap() < Duration::from_secs(1));
    assert!(server.ping(&addr).await.unwrap() < Duration::from_secs(1));
}

/* ------------------------------------------------------------------------ */
/* Connection lifecycle                                                     */
/* ------------------------------------------------------------------------ */

#[tokio::test]
async fn connect_and_disconnect_events() {
    let (server, mut events) = start_server(server_cfg(), echo).await;
    let mut client = Client::connect(&client_cfg(&server), TextCodec, Unsupported).await.expect("connect");

    let (server_side_id, addr) = match next_event(&mut events).await {
        ServerEvent::Connected { client_id, remote } => (client_id, remote),
        other => panic!("unexpected server event {other:?}"),
    };
    assert_eq!(server.connections(), vec![addr]);

    let client_event = client.next_event().await.unwrap();
    assert!(matches!(client_event, ClientEvent::Connected { client_id, .. } if client_id == client.id()));

    client.disconnect();

    match next_event(&mut events).await {
        ServerEvent::Disconnected { client_id, remote } => {
            assert_eq!(client_id, server_side_id);
            assert_eq!(remote, addr);
        }
        other => panic!("unexpected server event {other:?}"),
    }
    assert_eq!(server.connection_count(), 0);

    let client_event = timeout(Duration::from_secs(2), client.next_event()).await.unwrap().unwrap();
    assert!(matches!(client_event, ClientEvent::Disconnected { .. }));
    assert!(!client.is_connected());
    assert_eq!(client.send("late".to_string()).await.unwrap_err(), NetError::Disconnected);
}

#[tokio::test]
async fn unknown_address_is_not_connected() {
    let (server, _events) = start_server(server_cfg(), echo).await;
    let nobody: SocketAddr = "127.0.0.1:9".parse().unwrap();

    assert_eq!(
        server.send_to(&nobody, "hi".to_string()).await.unwrap_err(),
        NetError::NotConnected(nobody)
    );
    assert_eq!(server.post_to(&nobody, "hi".to_string()).await.unwrap_err(), NetError::NotConnected(nobody));
    assert!(!server.disconnect(&nobody));
}

#[tokio::test]
async fn server_drop_fails_pending_client_requests() {
    let (server, mut events) = start_server(server_cfg(), echo).await;
    let client = Client::connect(&client_cfg(&server), TextCodec, Unsupported).await.expect("connect");
    let addr = connected_addr(&mut events).await;

    let (reply, dropped) = tokio::join!(client.send("slow".to_string()), async {
        sleep(Duration::from_millis(100)).await;
        server.disconnect(&addr)
    });

    assert!(dropped);
    assert_eq!(reply.unwrap_err(), NetError::Disconnected);
    assert_eq!(client.pending_count(), 0);
    assert!(matches!(next_event(&mut events).await, ServerEvent::Disconnected { .. }));
}

#[tokio::test]
async fn client_disconnect_fails_its_own_pending_requests() {
    let (server, mut events) = start_server(server_cfg(), echo).await;
    let client = Client::connect(&client_cfg(&server), TextCodec, Unsupported).await.expect("connect");
    connected_addr(&mut events).await;

    let (first, second, ()) = tokio::join!(
        client.send("slow".to_string()),
        client.send("slow".to_string()),
        async {
            sleep(Duration::from_millis(100)).await;
            client.disconnect();
        }
    );
    assert_eq!(first.unwrap_err(), NetError::Disconnected);
    assert_eq!(second.unwrap_err(), NetError::Disconnected);
}

#[tokio::test]
async fn request_timeout_leaves_connection_usable() {
    let (server, mut events) = start_server(server_cfg(), echo).await;
    let cfg = client_cfg(&server).with_send_timeout(Duration::from_millis(200));
    let client = Client::connect(&cfg, TextCodec, Unsupported).await.expect("connect");
    connected_addr(&mut events).await;

    assert_eq!(client.send("slow".to_string()).await.unwrap_err(), NetError::Timeout);
    assert!(client.is_connected());
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn connect_to_closed_port_fails() {
    init_logger();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let cfg = ClientConfig::new(addr.to_string(), true).with_connect_timeout(Duration::from_secs(1));
    assert!(Client::connect(&cfg, TextCodec, Unsupported).await.is_err());
}

#[tokio::test]
async fn run_twice_is_rejected() {
    let (server, _events) = start_server(server_cfg(), echo).await;
    sleep(Duration::from_millis(50)).await;

    let (tx, _rx) = mpsc::channel(1);
    assert_eq!(server.clone().run(tx).await.unwrap_err(), ServerError::AlreadyRunning);
}

#[tokio::test]
async fn shutdown_disconnects_everyone() {
    let (server, mut events) = start_server(server_cfg(), echo).await;
    let mut client = Client::connect(&client_cfg(&server), TextCodec, Unsupported).await.expect("connect");
    connected_addr(&mut events).await;
    assert!(matches!(client.next_event().await, Some(ClientEvent::Connected { .. })));

    server.shutdown();

    let event = timeout(Duration::from_secs(2), client.next_event()).await.unwrap();
    assert!(matches!(event, Some(ClientEvent::Disconnected { .. })));
}

/* ------------------------------------------------------------------------ */
/* Broadcast                                                                */
/* ------------------------------------------------------------------------ */

#[tokio::test]
async fn broadcast_skips_excluded_clients() {
    let (server, mut events) = start_server(server_cfg(), Unsupported).await;

    let (handler_a, mut inbox_a) = collector();
    let _client_a = Client::connect(&client_cfg(&server), TextCodec, handler_a).await.expect("connect a");
    let addr_a = connected_addr(&mut events).await;

    let (handler_b, mut inbox_b) = collector();
    let _client_b = Client::connect(&client_cfg(&server), TextCodec, handler_b).await.expect("connect b");
    connected_addr(&mut events).await;

    assert_eq!(server.broadcast("to all".to_string(), None).await.unwrap(), 2);
    assert_eq!(inbox_a.recv().await.unwrap(), "to all");
    assert_eq!(inbox_b.recv().await.unwrap(), "to all");

    let exclude: HashSet<SocketAddr> = [addr_a].into_iter().collect();
    assert_eq!(server.broadcast("not for a".to_string(), Some(&exclude)).await.unwrap(), 1);
    assert_eq!(inbox_b.recv().await.unwrap(), "not for a");
    assert!(timeout(Duration::from_millis(100), inbox_a.recv()).await.is_err());
}

#[tokio::test]
async fn broadcast_edge_cases() {
    let (server, _events) = start_server(server_cfg(), Unsupported).await;

    assert_eq!(server.broadcast("nobody".to_string(), None).await.unwrap(), 0);
    assert!(matches!(
        server.broadcast("!encode".to_string(), None).await,
        Err(ServerError::EncodingFailed(NetError::Encode(_)))
    ));
}

#[tokio::test]
async fn post_reaches_the_handler_without_reply() {
    let (handler, mut inbox) = collector();
    let (server, mut events) = start_server(server_cfg(), handler).await;
    let client = Client::connect(&client_cfg(&server), TextCodec, Unsupported).await.expect("connect");
    connected_addr(&mut events).await;

    client.post("fire and forget".to_string()).await.unwrap();
    assert_eq!(inbox.recv().await.unwrap(), "fire and forget");
    assert_eq!(client.pending_count(), 0);
}

/* ------------------------------------------------------------------------ */
/* Keep-alive                                                               */
/* ------------------------------------------------------------------------ */

#[tokio::test]
async fn keep_alive_keeps_idle_connections_open() {
    let cfg = ServerConfig::new("127.0.0.1:0".to_string(), true)
        .with_keep_alive(Duration::from_millis(100), Duration::from_secs(1));
    let (server, mut events) = start_server(cfg, echo).await;
    assert!(!server.is_keep_alive_running());

    let cfg = ClientConfig::new(server.local_addr().to_string(), true)
        .with_keep_alive(Duration::from_millis(100), Duration::from_secs(1));
    let client = Client::connect(&cfg, TextCodec, Unsupported).await.expect("connect");
    connected_addr(&mut events).await;
    assert!(client.is_keep_alive_running());

    sleep(Duration::from_millis(500)).await;
    assert!(server.is_keep_alive_running());
    assert!(client.is_connected());
    assert_eq!(client.send("still".to_string()).await.unwrap(), "echo:still");

    client.disconnect();
    assert!(matches!(next_event(&mut events).await, ServerEvent::Disconnected { .. }));
    assert!(!server.is_keep_alive_running());
}

#[tokio::test]
async fn unanswered_pings_evict_the_peer_once() {
    let cfg = ServerConfig::new("127.0.0.1:0".to_string(), true)
        .with_keep_alive(Duration::from_millis(100), Duration::from_millis(200));
    let (server, mut events) = start_server(cfg, echo).await;

    // a raw peer that never reads, let alone answers a ping
    let mut silent = tokio::net::TcpStream::connect(server.local_addr()).await.unwrap();
    let addr = connected_addr(&mut events).await;
    assert_eq!(server.connections(), vec![addr]);

    match next_event(&mut events).await {
        ServerEvent::Disconnected { remote, .. } => assert_eq!(remote, addr),
        other => panic!("unexpected server event {other:?}"),
    }
    assert_eq!(server.connection_count(), 0);
    assert!(!server.is_keep_alive_running());
    assert!(timeout(Duration::from_millis(300), events.recv()).await.is_err(), "second event");

    // the server closed its end after the ping
    let mut rest = Vec::new();
    timeout(Duration::from_secs(2), silent.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert_eq!(rest.len() % HEADER_LEN, 0);
    assert!(!rest.is_empty());
    assert_eq!(rest[8], FrameKind::Ping as u8);
}

/* ------------------------------------------------------------------------ */
/* Event channels                                                           */
/* ------------------------------------------------------------------------ */

#[tokio::test]
async fn stalled_event_reader_does_not_stall_new_connections() {
    init_logger();
    let server = Server::bind(server_cfg(), TextCodec, echo).await.expect("bind");
    // room for one event, and nobody reading
    let (tx, _undrained) = mpsc::channel(1);
    tokio::spawn({
        let server = server.clone();
        async move { server.run(tx).await }
    });

    let cfg = client_cfg(&server).with_send_timeout(Duration::from_secs(2));
    let first = Client::connect(&cfg, TextCodec, Unsupported).await.expect("connect first");
    let second = Client::connect(&cfg, TextCodec, Unsupported).await.expect("connect second");
    let third = Client::connect(&cfg, TextCodec, Unsupported).await.expect("connect third");

    assert_eq!(first.send("1".to_string()).await.unwrap(), "echo:1");
    assert_eq!(second.send("2".to_string()).await.unwrap(), "echo:2");
    assert_eq!(third.send("3".to_string()).await.unwrap(), "echo:3");
}

#[tokio::test]
async fn client_disconnected_event_waits_for_room() {
    let (server, mut events) = start_server(server_cfg(), echo).await;
    let cfg = client_cfg(&server).with_event_capacity(1);
    let mut client = Client::connect(&cfg, TextCodec, Unsupported).await.expect("connect");
    connected_addr(&mut events).await;

    // Connected fills the only slot, Disconnected has to wait for it
    client.disconnect();
    assert!(matches!(next_event(&mut events).await, ServerEvent::Disconnected { .. }));

    let event = timeout(Duration::from_secs(2), client.next_event()).await.unwrap();
    assert!(matches!(event, Some(ClientEvent::Connected { .. })));
    let event = timeout(Duration::from_secs(2), client.next_event()).await.unwrap();
    assert!(matches!(event, Some(ClientEvent::Disconnected { .. })));
    assert!(timeout(Duration::from_millis(100), client.next_event()).await.is_err());
}

/* ------------------------------------------------------------------------ */
/* Rapid-TLV bodies                                                         */
/* ------------------------------------------------------------------------ */

fn make_msg(key: &str) -> RapidTlvMessage {
    let mut msg = RapidTlvMessage::new(EVT_MSG.into());
    msg.add_field(FLD_KEY.into(), Bytes::from(key.to_owned()));
    msg
}

#[tokio::test]
async fn tlv_messages_over_tcp() {
    init_logger();
    let tlv_echo = |_remote: SocketAddr, msg: RapidTlvMessage| async move {
        let key = msg
            .get_field(&FLD_KEY.into())
            .map(|field| String::from_utf8_lossy(field.value()).into_owned())
            .unwrap_or_default();
        Ok::<_, BoxError>(Some(make_msg(&format!("re:{key}"))))
    };

    let server = Server::bind(server_cfg(), TlvCodec::new(), tlv_echo).await.expect("bind");
    let (tx, _events) = mpsc::channel(100);
    tokio::spawn({
        let server = server.clone();
        async move { server.run(tx).await }
    });

    let cfg = ClientConfig::new(server.local_addr().to_string(), true).without_keep_alive();
    let client = Client::connect(&cfg, TlvCodec::new(), Unsupported).await.expect("connect");

    let reply = client.send(make_msg("TestKey")).await.unwrap();
    assert_eq!(reply.get_field(&FLD_KEY.into()).unwrap().value(), b"re:TestKey");
}
