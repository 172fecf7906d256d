use super::*;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex as TokioMutex;

struct MockTransport {
    sent: TokioMutex<Vec<String>>,
    closed: TokioMutex<Option<(u16, String)>>,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: TokioMutex::new(Vec::new()),
            closed: TokioMutex::new(None),
        })
    }

    async fn last_sent(&self) -> Option<String> {
        self.sent.lock().await.last().cloned()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.sent.lock().await.push(text);
        Ok(())
    }

    async fn close(&self, code: u16, reason: &str) {
        *self.closed.lock().await = Some((code, reason.to_string()));
    }
}

#[derive(Default)]
struct RecordingEvents {
    opened: AtomicBool,
    messages: TokioMutex<Vec<Vec<u8>>>,
    closes: TokioMutex<Vec<(u16, String)>>,
    errors: TokioMutex<Vec<String>>,
}

impl ChannelEvents for RecordingEvents {
    fn on_open(&self) {
        self.opened.store(true, Ordering::SeqCst);
    }

    fn on_message(&self, plaintext: Vec<u8>) {
        self.messages.try_lock().unwrap().push(plaintext);
    }

    fn on_close(&self, code: u16, reason: String) {
        self.closes.try_lock().unwrap().push((code, reason));
    }

    fn on_error(&self, message: String) {
        self.errors.try_lock().unwrap().push(message);
    }
}

fn hello_frame(key_b64: &str) -> RawFrame {
    RawFrame::Text(HandshakeFrame::hello(key_b64.to_string()).to_json())
}

fn ready_frame() -> RawFrame {
    RawFrame::Text(HandshakeFrame::Ready.to_json())
}

#[tokio::test]
async fn client_sends_hello_on_construct() {
    let transport = MockTransport::new();
    let daemon_kp = crypto::generate_keypair();
    let daemon_pub_b64 = crypto::b64_encode(daemon_kp.public.as_bytes());
    let events = Arc::new(RecordingEvents::default());

    let _channel = Channel::create_client(transport.clone(), &daemon_pub_b64, events)
        .await
        .unwrap();

    let sent = transport.last_sent().await.unwrap();
    assert!(sent.contains("e2ee_hello"));
}

#[tokio::test(start_paused = true)]
async fn client_retries_hello_every_second_while_handshaking() {
    let transport = MockTransport::new();
    let daemon_kp = crypto::generate_keypair();
    let daemon_pub_b64 = crypto::b64_encode(daemon_kp.public.as_bytes());
    let events = Arc::new(RecordingEvents::default());

    let _channel = Channel::create_client(transport.clone(), &daemon_pub_b64, events)
        .await
        .unwrap();

    assert_eq!(transport.sent.lock().await.len(), 1);
    tokio::time::advance(Duration::from_millis(1050)).await;
    tokio::task::yield_now().await;
    assert_eq!(transport.sent.lock().await.len(), 2);
    tokio::time::advance(Duration::from_millis(1050)).await;
    tokio::task::yield_now().await;
    assert_eq!(transport.sent.lock().await.len(), 3);
}

#[tokio::test]
async fn client_opens_on_ready_and_flushes_queue() {
    let transport = MockTransport::new();
    let daemon_kp = crypto::generate_keypair();
    let daemon_pub_b64 = crypto::b64_encode(daemon_kp.public.as_bytes());
    let events = Arc::new(RecordingEvents::default());

    let channel = Channel::create_client(transport.clone(), &daemon_pub_b64, events.clone())
        .await
        .unwrap();

    channel.send(Plaintext::Text("queued".into())).await.unwrap();
    assert_eq!(channel.inner.lock().await.pending.len(), 1);

    channel.handle_incoming(ready_frame()).await;

    assert!(events.opened.load(Ordering::SeqCst));
    assert_eq!(channel.inner.lock().await.pending.len(), 0);
    // hello + flushed queued frame
    assert_eq!(transport.sent.lock().await.len(), 2);
}

#[tokio::test]
async fn client_ignores_non_ready_frames_while_handshaking() {
    let transport = MockTransport::new();
    let daemon_kp = crypto::generate_keypair();
    let daemon_pub_b64 = crypto::b64_encode(daemon_kp.public.as_bytes());
    let events = Arc::new(RecordingEvents::default());

    let channel = Channel::create_client(transport.clone(), &daemon_pub_b64, events.clone())
        .await
        .unwrap();

    channel.handle_incoming(RawFrame::Text("not json".into())).await;
    assert!(!events.opened.load(Ordering::SeqCst));
    assert_eq!(channel.inner.lock().await.state, State::Handshaking);
}

async fn make_open_daemon_and_client_key() -> (Arc<Channel>, Arc<MockTransport>, StaticSecret, Arc<RecordingEvents>) {
    let daemon_kp = crypto::generate_keypair();
    let client_secret = StaticSecret::random_from_rng(rand_core::OsRng);
    let client_public = PublicKey::from(&client_secret);
    let client_key_b64 = crypto::b64_encode(client_public.as_bytes());

    let transport = MockTransport::new();
    let events = Arc::new(RecordingEvents::default());
    let mut incoming = futures_util::stream::iter(vec![hello_frame(&client_key_b64)]);

    let channel = Channel::create_daemon(transport.clone(), daemon_kp, events.clone(), &mut incoming)
        .await
        .unwrap();

    (channel, transport, client_secret, events)
}

#[tokio::test]
async fn daemon_completes_handshake_and_roundtrips() {
    let (channel, transport, client_secret, events) = make_open_daemon_and_client_key().await;

    assert!(events.opened.load(Ordering::SeqCst));
    let sent = transport.last_sent().await.unwrap();
    assert!(sent.contains("e2ee_ready"));

    // Derive the same shared key the client side would, to simulate its
    // traffic without spinning up a second full Channel.
    let daemon_public = {
        let inner_side = match &channel.side {
            Side::Daemon { public, .. } => *public,
            _ => unreachable!(),
        };
        inner_side
    };
    let client_shared = crypto::derive_shared(&client_secret, &daemon_public);

    let framed = crypto::encrypt(&client_shared, b"ping").unwrap();
    let payload = crypto::b64_encode(&framed);
    channel.handle_incoming(RawFrame::Text(payload)).await;

    let messages = events.messages.lock().await;
    assert_eq!(messages.last().unwrap(), b"ping");
    drop(messages);

    channel.send(Plaintext::Text("pong".into())).await.unwrap();
    let out = transport.last_sent().await.unwrap();
    let framed_out = crypto::b64_decode(&out).unwrap();
    let plaintext = crypto::decrypt(&client_shared, &framed_out).unwrap();
    assert_eq!(plaintext, b"pong");
}

#[tokio::test]
async fn daemon_rejects_invalid_hello_wrong_type() {
    let daemon_kp = crypto::generate_keypair();
    let transport = MockTransport::new();
    let events = Arc::new(RecordingEvents::default());
    let mut incoming = futures_util::stream::iter(vec![ready_frame()]);

    let err = Channel::create_daemon(transport, daemon_kp, events, &mut incoming)
        .await
        .unwrap_err();
    match err {
        ChannelError::InvalidHello(msg) => {
            assert!(msg.contains("e2ee_ready") || msg.contains("type"));
        }
        other => panic!("expected InvalidHello, got {other:?}"),
    }
}

#[tokio::test]
async fn daemon_rejects_invalid_hello_missing_key() {
    let daemon_kp = crypto::generate_keypair();
    let transport = MockTransport::new();
    let events = Arc::new(RecordingEvents::default());
    let mut incoming =
        futures_util::stream::iter(vec![RawFrame::Text(r#"{"type":"e2ee_hello"}"#.to_string())]);

    let err = Channel::create_daemon(transport, daemon_kp, events, &mut incoming)
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::InvalidHello(_)));
}

#[tokio::test]
async fn daemon_rejects_unparseable_json() {
    let daemon_kp = crypto::generate_keypair();
    let transport = MockTransport::new();
    let events = Arc::new(RecordingEvents::default());
    let mut incoming = futures_util::stream::iter(vec![RawFrame::Text("{not json".to_string())]);

    let err = Channel::create_daemon(transport, daemon_kp, events, &mut incoming)
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::InvalidHello(_)));
}

#[tokio::test]
async fn rehello_same_key_resends_ready_without_rekey() {
    let (channel, transport, client_secret, _events) = make_open_daemon_and_client_key().await;
    let key_before = channel.inner.lock().await.shared_key.clone().unwrap();

    // Push a marker into pending to prove it survives an unchanged-key rehello.
    channel.inner.lock().await.pending.push_back(Plaintext::Text("marker".into()));

    let client_public = PublicKey::from(&client_secret);
    let client_key_b64 = crypto::b64_encode(client_public.as_bytes());
    channel.handle_incoming(hello_frame(&client_key_b64)).await;

    let key_after = channel.inner.lock().await.shared_key.clone().unwrap();
    assert_eq!(key_before, key_after);
    assert_eq!(channel.inner.lock().await.pending.len(), 1);

    let sent_count = transport.sent.lock().await.len();
    assert_eq!(sent_count, 2); // initial e2ee_ready + resent e2ee_ready
}

#[tokio::test]
async fn rehello_new_key_rekeys_and_drops_pending() {
    let (channel, transport, _old_client_secret, _events) = make_open_daemon_and_client_key().await;
    let key_before = channel.inner.lock().await.shared_key.clone().unwrap();

    channel.inner.lock().await.pending.push_back(Plaintext::Text("stale".into()));

    let new_client_secret = StaticSecret::random_from_rng(rand_core::OsRng);
    let new_client_public = PublicKey::from(&new_client_secret);
    let new_client_key_b64 = crypto::b64_encode(new_client_public.as_bytes());

    channel.handle_incoming(hello_frame(&new_client_key_b64)).await;

    let key_after = channel.inner.lock().await.shared_key.clone().unwrap();
    assert_ne!(key_before, key_after);
    assert_eq!(channel.inner.lock().await.pending.len(), 0);
    assert_eq!(channel.inner.lock().await.state, State::Open);

    let sent_count = transport.sent.lock().await.len();
    assert_eq!(sent_count, 2);

    let daemon_public = match &channel.side {
        Side::Daemon { public, .. } => *public,
        _ => unreachable!(),
    };
    let new_shared = crypto::derive_shared(&new_client_secret, &daemon_public);
    assert_eq!(new_shared, key_after);
}

#[tokio::test]
async fn open_channel_closes_fatally_on_plaintext_violation() {
    let (channel, transport, _client_secret, events) = make_open_daemon_and_client_key().await;

    channel
        .handle_incoming(RawFrame::Text(r#"{"type":"some_other_type"}"#.to_string()))
        .await;

    assert_eq!(channel.inner.lock().await.state, State::Closed);
    let closed = transport.closed.lock().await.clone().unwrap();
    assert_eq!(closed.0, 1011);
    assert!(events.closes.lock().await.iter().any(|(c, _)| *c == 1011));
    assert!(events.errors.lock().await.is_empty());
}

#[tokio::test]
async fn open_channel_closes_fatally_on_decrypt_failure() {
    let (channel, transport, _client_secret, events) = make_open_daemon_and_client_key().await;

    let garbage = crypto::b64_encode(&[0u8; 20]);
    channel.handle_incoming(RawFrame::Text(garbage)).await;

    assert_eq!(channel.inner.lock().await.state, State::Closed);
    let closed = transport.closed.lock().await.clone().unwrap();
    assert_eq!(closed.0, 1011);
    assert!(events.errors.lock().await.is_empty());
}

#[tokio::test]
async fn send_after_close_fails() {
    let (channel, _transport, _client_secret, _events) = make_open_daemon_and_client_key().await;
    channel.close_fatal(1011, "test".to_string()).await;

    let err = channel.send(Plaintext::Text("x".into())).await.unwrap_err();
    assert!(matches!(err, ChannelError::ChannelClosed));
}
