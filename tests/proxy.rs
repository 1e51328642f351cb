//! End-to-end relay tests: a real client socket, the proxy, and a fake game server.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jamproxy::{
    ANY_TYPE, ConnectionEvent, ConsoleLevel, ConsoleMessage, ConsoleSink, Direction, Dispatch,
    FrameSplitter, HookContext, Listener, MemorySettings, SessionState,
};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::timeout;

const TIMEOUT: Duration = Duration::from_secs(5);
/// Three failed attempts back off for 7 to 9 seconds in total.
const BACKOFF_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Default)]
struct RecordingConsole(Mutex<Vec<ConsoleMessage>>);

impl RecordingConsole {
    fn messages(&self, level: ConsoleLevel) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.level == level)
            .map(|m| m.message.clone())
            .collect()
    }

    fn count(&self, level: ConsoleLevel) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.level == level)
            .count()
    }
}

impl ConsoleSink for RecordingConsole {
    fn message(&self, message: ConsoleMessage) {
        self.0.lock().unwrap().push(message);
    }
}

struct Harness {
    listener: Listener,
    proxy: SocketAddr,
    server: TcpListener,
    console: Arc<RecordingConsole>,
}

async fn proxy(
    settings: Value,
    configure: impl FnOnce(&Dispatch),
) -> (Listener, SocketAddr, Arc<RecordingConsole>) {
    let console = Arc::new(RecordingConsole::default());
    let dispatch = Dispatch::new(console.clone());
    configure(&dispatch);

    let settings = MemorySettings::from_json(settings);
    let listener = Listener::new(dispatch, Arc::new(settings), console.clone());
    let proxy = listener.serve("127.0.0.1", 0).await.unwrap();
    (listener, proxy, console)
}

async fn harness(configure: impl FnOnce(&Dispatch)) -> Harness {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let settings = json!({
        "remoteHost": "127.0.0.1",
        "remotePort": server.local_addr().unwrap().port(),
        "autoReconnect": false,
    });
    let (listener, proxy, console) = self::proxy(settings, configure).await;
    Harness {
        listener,
        proxy,
        server,
        console,
    }
}

impl Harness {
    /// Connects a client and returns it along with the server side of its remote leg.
    async fn client(&self) -> (TcpStream, TcpStream) {
        let client = TcpStream::connect(self.proxy).await.unwrap();
        let (upstream, _) = timeout(TIMEOUT, self.server.accept())
            .await
            .expect("proxy never dialed the server")
            .unwrap();
        (client, upstream)
    }
}

/// A port nothing listens on, until the caller binds it.
async fn free_port() -> u16 {
    let free = TcpListener::bind("127.0.0.1:0").await.unwrap();
    free.local_addr().unwrap().port()
}

async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) {
    timeout(limit, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition never held");
}

async fn send(stream: &mut TcpStream, frames: &[&str]) {
    for frame in frames {
        stream.write_all(frame.as_bytes()).await.unwrap();
        stream.write_all(&[0]).await.unwrap();
    }
}

async fn read_frames(stream: &mut TcpStream, count: usize) -> Vec<String> {
    let mut splitter = FrameSplitter::new();
    let mut frames = Vec::new();
    let mut buf = [0u8; 4096];
    while frames.len() < count {
        let n = timeout(TIMEOUT, stream.read(&mut buf))
            .await
            .expect("timed out waiting for frames")
            .unwrap();
        assert!(n > 0, "socket closed after {:?}", frames);
        frames.extend(splitter.feed(&buf[..n]));
    }
    frames
}

async fn assert_silent(stream: &mut TcpStream) {
    let mut buf = [0u8; 256];
    if let Ok(result) = timeout(Duration::from_millis(200), stream.read(&mut buf)).await {
        let n = result.unwrap();
        panic!("expected silence, got {} bytes: {:?}", n, &buf[..n]);
    }
}

async fn wait_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 256];
    loop {
        match timeout(TIMEOUT, stream.read(&mut buf)).await.expect("still open") {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

#[tokio::test]
async fn policy_request_is_answered_locally() {
    let h = harness(|_| {}).await;
    let (mut client, mut upstream) = h.client().await;

    send(&mut client, &["<policy-file-request/>"]).await;
    let reply = read_frames(&mut client, 1).await;
    assert!(reply[0].contains("<cross-domain-policy>"));
    assert!(reply[0].contains(&format!("to-ports=\"80,{}\"", h.proxy.port())));

    assert_silent(&mut upstream).await;
    h.listener.shutdown().await;
}

#[tokio::test]
async fn hooks_rewrite_and_suppress() {
    let h = harness(|dispatch| {
        dispatch.on_message(Direction::Local, "chat", |ctx: HookContext| async move {
            let mut message = ctx.message.lock().await;
            if let Some(packet) = message.as_xt_mut() {
                packet.tokens_mut()[3] = "bye".into();
            }
            Ok(())
        });
        dispatch.on_message(Direction::Remote, "secret", |ctx: HookContext| async move {
            ctx.message.lock().await.send = false;
            Ok(())
        });
    })
    .await;
    let (mut client, mut upstream) = h.client().await;

    send(&mut client, &["%xt%chat%hi%", "hello there", "{oops}"]).await;
    // The plain-text frame is dropped; broken JSON goes through untouched.
    assert_eq!(read_frames(&mut upstream, 2).await, vec!["%xt%chat%bye%", "{oops}"]);

    send(&mut upstream, &["%xt%secret%1%", "%xt%ok%1%"]).await;
    assert_eq!(read_frames(&mut client, 1).await, vec!["%xt%ok%1%"]);

    h.listener.shutdown().await;
}

#[tokio::test]
async fn bootstrap_messages_pass_byte_exact() {
    const VER_CHK: &str = "<msg t='sys'><body action='verChk' r='0'><ver v='153'/></body></msg>";
    let h = harness(|dispatch| {
        dispatch.on_message(Direction::Local, "verChk", |ctx: HookContext| async move {
            let mut message = ctx.message.lock().await;
            if let Some(root) = message.as_xml_mut() {
                root.set_attr("t", "tampered");
            }
            message.send = false;
            Ok(())
        });
    })
    .await;
    let (mut client, mut upstream) = h.client().await;

    send(&mut client, &[VER_CHK]).await;
    assert_eq!(read_frames(&mut upstream, 1).await, vec![VER_CHK]);
    h.listener.shutdown().await;
}

#[tokio::test]
async fn room_join_updates_state() {
    let h = harness(|_| {}).await;
    let (mut client, mut upstream) = h.client().await;

    send(&mut client, &["%xt%rj%4012%den.main%"]).await;
    read_frames(&mut upstream, 1).await;

    let dispatch = h.listener.dispatch();
    assert_eq!(dispatch.get_state("room", Value::Null), json!("den.main"));
    assert_eq!(dispatch.get_state("internalRoomId", Value::Null), json!(4012));
    h.listener.shutdown().await;
}

#[tokio::test]
async fn session_lifecycle_events() {
    let h = harness(|_| {}).await;
    let mut events = h.listener.subscribe();
    let (client, mut upstream) = h.client().await;

    let connected = timeout(TIMEOUT, events.recv()).await.unwrap().unwrap();
    assert!(connected.connected);
    assert_eq!(h.listener.session_count(), 1);

    let sent = h.listener.broadcast_local("%xt%notice%1%").await;
    assert_eq!(sent, 1);

    drop(client);
    let closed = timeout(TIMEOUT, events.recv()).await.unwrap().unwrap();
    assert_eq!(
        closed,
        ConnectionEvent {
            session: connected.session,
            connected: false
        }
    );
    assert_eq!(h.listener.session_count(), 0);
    wait_closed(&mut upstream).await;
    // Closed within the notice window, so nothing is announced.
    assert_eq!(h.console.count(ConsoleLevel::Warn), 0);
}

#[tokio::test]
async fn unreachable_server_closes_client() {
    let settings = json!({
        "remoteHost": "127.0.0.1",
        "remotePort": free_port().await,
        "autoReconnect": false,
    });
    let (_listener, proxy, console) = proxy(settings, |_| {}).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    wait_closed(&mut client).await;
    assert_eq!(console.count(ConsoleLevel::Error), 1);
}

#[tokio::test]
async fn messages_sent_during_backoff_reach_the_server() {
    let port = free_port().await;
    let settings = json!({
        "remoteHost": "127.0.0.1",
        "remotePort": port,
        "autoReconnect": true,
        "maxReconnectAttempts": 5,
    });
    let (listener, proxy, console) = proxy(settings, |_| {}).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    send(&mut client, &["%xt%early%1%"]).await;
    // Three failures put the retry well past the single-write timeout.
    eventually(BACKOFF_TIMEOUT, || {
        listener
            .sessions()
            .first()
            .is_some_and(|s| s.reconnect_attempts() >= 3)
    })
    .await;
    let session = listener.sessions()[0].clone();
    assert_eq!(session.state(), SessionState::Connecting);

    let server = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let (mut upstream, _) = timeout(BACKOFF_TIMEOUT, server.accept())
        .await
        .expect("proxy never reconnected")
        .unwrap();
    assert_eq!(read_frames(&mut upstream, 1).await, vec!["%xt%early%1%"]);
    assert!(session.is_connected());
    assert_eq!(session.reconnect_attempts(), 0);
    assert_eq!(console.count(ConsoleLevel::Error), 0);

    send(&mut upstream, &["%xt%welcome%1%"]).await;
    assert_eq!(read_frames(&mut client, 1).await, vec!["%xt%welcome%1%"]);
    listener.shutdown().await;
}

#[tokio::test]
async fn reconnect_gives_up_after_max_attempts() {
    let settings = json!({
        "remoteHost": "127.0.0.1",
        "remotePort": free_port().await,
        "autoReconnect": true,
        "maxReconnectAttempts": 1,
    });
    let (listener, proxy, console) = proxy(settings, |_| {}).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    wait_closed(&mut client).await;
    let errors = console.messages(ConsoleLevel::Error);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Could not reconnect after 1 attempts"), "{}", errors[0]);
    assert_eq!(listener.session_count(), 0);
}

#[tokio::test]
async fn local_messages_drain_before_remote() {
    let gate = Arc::new(Notify::new());
    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    let h = harness(|dispatch| {
        let gate = gate.clone();
        dispatch.on_message(Direction::Remote, "hold", move |_| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok(())
            }
        });
        let order = order.clone();
        dispatch.on_message(Direction::Any, ANY_TYPE, move |ctx: HookContext| {
            let order = order.clone();
            async move {
                let t = ctx.message.lock().await.message_type().unwrap_or("?").to_string();
                order.lock().unwrap().push(format!("{}:{}", ctx.direction, t));
                Ok(())
            }
        });
    })
    .await;
    let (mut client, mut upstream) = h.client().await;

    send(&mut upstream, &["%xt%hold%1%"]).await;
    eventually(TIMEOUT, || order.lock().unwrap().len() == 1).await;
    // Both queues fill while the drain is stuck on `hold`.
    send(&mut upstream, &["%xt%r2%1%"]).await;
    send(&mut client, &["%xt%l1%1%"]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    gate.notify_one();

    assert_eq!(
        read_frames(&mut client, 2).await,
        vec!["%xt%hold%1%", "%xt%r2%1%"]
    );
    assert_eq!(read_frames(&mut upstream, 1).await, vec!["%xt%l1%1%"]);
    assert_eq!(
        *order.lock().unwrap(),
        vec!["remote:hold", "local:l1", "remote:r2"]
    );
    h.listener.shutdown().await;
}

/// Moves the Tokio clock past the disconnect notice window.
async fn skip_notice_window() {
    tokio::time::pause();
    tokio::time::advance(Duration::from_secs(6)).await;
    tokio::time::resume();
}

#[tokio::test]
async fn server_drop_after_notice_window_is_announced() {
    let h = harness(|_| {}).await;
    let mut events = h.listener.subscribe();
    let (mut client, upstream) = h.client().await;
    assert!(timeout(TIMEOUT, events.recv()).await.unwrap().unwrap().connected);

    skip_notice_window().await;
    drop(upstream);
    wait_closed(&mut client).await;
    eventually(TIMEOUT, || h.console.count(ConsoleLevel::Warn) == 1).await;
    assert_eq!(
        h.console.messages(ConsoleLevel::Warn),
        vec!["Disconnected from the server."]
    );
}

#[tokio::test]
async fn manual_disconnect_is_never_announced() {
    let h = harness(|_| {}).await;
    let mut events = h.listener.subscribe();
    let (mut client, _upstream) = h.client().await;
    assert!(timeout(TIMEOUT, events.recv()).await.unwrap().unwrap().connected);

    skip_notice_window().await;
    assert_eq!(h.listener.shutdown().await, 1);
    wait_closed(&mut client).await;
    assert_eq!(h.console.count(ConsoleLevel::Warn), 0);
}
