//! End-to-end dispatch scenarios over in-memory streams.
//!
//! Each test drives a real connection (duplex transport), a real dispatcher,
//! and reads what the server side actually put on the wire: echo round-trip,
//! rate-limited retry, permission denial, handler timeout, per-connection
//! FIFO, and middleware ordering.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use tidegate_core::{
    Connection, ConnectionConfig, DispatchContext, Dispatcher, DispatcherBuilder, Environment,
    HandlerError, HandlerRegistration, HandlerReply, Middleware, Next, PacketController,
    PermissionLevel, RateLimiter, RatePolicy, handler_fn,
    error::{DispatchError, RegistrationError},
};
use tidegate_crypto::{AeadCipher, Cipher, SessionSecret};
use tidegate_proto::{
    ControlDirective, Packet, ProtocolAction, ProtocolReason,
};

#[derive(Clone)]
struct TestEnv;

impl Environment for TestEnv {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        for (i, byte) in buffer.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_mul(97).wrapping_add(13);
        }
    }
}

fn build(builder: DispatcherBuilder) -> Arc<Dispatcher<TestEnv>> {
    builder.build(TestEnv, Arc::new(RateLimiter::new()), Arc::new(AeadCipher::new()))
}

fn build_with(setup: impl FnOnce(&mut DispatcherBuilder)) -> Arc<Dispatcher<TestEnv>> {
    let mut builder = DispatcherBuilder::new();
    setup(&mut builder);
    build(builder)
}

fn connect() -> (Arc<Connection>, DuplexStream) {
    let (local, remote) = tokio::io::duplex(256 * 1024);
    let conn = Connection::new(
        local,
        "127.0.0.1:40000".parse().unwrap(),
        &TestEnv,
        ConnectionConfig::default(),
    );
    (conn, remote)
}

async fn write_packet(remote: &mut DuplexStream, packet: &Packet) {
    let mut body = BytesMut::with_capacity(packet.wire_len());
    packet.encode(&mut body).unwrap();
    remote.write_all(&(body.len() as u32).to_le_bytes()).await.unwrap();
    remote.write_all(&body).await.unwrap();
}

async fn read_frame(remote: &mut DuplexStream) -> Vec<u8> {
    let mut prefix = [0u8; 4];
    remote.read_exact(&mut prefix).await.unwrap();
    let mut body = vec![0u8; u32::from_le_bytes(prefix) as usize];
    remote.read_exact(&mut body).await.unwrap();
    body
}

async fn read_packet(remote: &mut DuplexStream) -> Packet {
    Packet::decode(&read_frame(remote).await).unwrap()
}

async fn read_directive(remote: &mut DuplexStream) -> ControlDirective {
    let packet = read_packet(remote).await;
    assert_eq!(packet.opcode(), tidegate_proto::OPCODE_CONTROL);
    ControlDirective::from_bytes(&packet.payload).unwrap()
}

#[tokio::test]
async fn echo_round_trip_with_compression_and_encryption() {
    let secret_bytes = [0x21u8; 32];

    let dispatcher = build_with(|b| {
        b
            .register(HandlerRegistration::new(
                0x0001,
                handler_fn(|packet, _conn| async move { Ok(HandlerReply::Packet(packet)) }),
            ))
            .unwrap();
    });

    let (conn, mut remote) = connect();
    conn.set_secret(&secret_bytes).unwrap();
    dispatcher.attach(Arc::clone(&conn));

    write_packet(&mut remote, &Packet::sequenced(0x0001, 9, vec![0x01u8, 0x02, 0x03])).await;

    let reply = read_packet(&mut remote).await;
    assert_eq!(reply.opcode(), 0x0001);
    assert_eq!(reply.sequence_id(), 9);
    assert!(reply.is_encrypted());
    assert!(reply.is_compressed());

    // Undo the transforms the dispatcher applied: decrypt, then decompress.
    let cipher = AeadCipher::new();
    let secret = SessionSecret::new(secret_bytes);
    let plain = cipher.decrypt(conn.suite(), &secret, &reply.payload).unwrap();
    let restored = reply.with_decrypted_payload(plain).decompressed(1 << 20).unwrap();
    assert_eq!(&restored.payload[..], &[0x01, 0x02, 0x03]);
}

#[tokio::test]
async fn rate_limited_third_packet_gets_retry_directive() {
    let dispatcher = build_with(|b| {
        b
            .register(
                HandlerRegistration::new(
                    0x0010,
                    handler_fn(|_packet, _conn| async move {
                        Ok(HandlerReply::Text("ok".to_string()))
                    }),
                )
                .with_rate_limit(RatePolicy::new(2, 1.0)),
            )
            .unwrap();
    });

    let (conn, mut remote) = connect();
    dispatcher.attach(Arc::clone(&conn));

    for sequence in 1u32..=3 {
        write_packet(&mut remote, &Packet::sequenced(0x0010, sequence, Vec::new())).await;
    }

    let first = read_packet(&mut remote).await;
    assert_eq!(first.as_text().unwrap(), "ok");
    let second = read_packet(&mut remote).await;
    assert_eq!(second.as_text().unwrap(), "ok");

    let directive = read_directive(&mut remote).await;
    assert_eq!(directive.reason(), Some(ProtocolReason::RateLimited));
    assert_eq!(directive.action(), Some(ProtocolAction::Retry));
    assert!(directive.flags().is_transient());
    assert_eq!(directive.arg0(), 0x0010);
    assert_eq!(directive.sequence_id(), 3);
}

#[tokio::test]
async fn permission_denied_is_account_locked() {
    let dispatcher = build_with(|b| {
        b
            .register(
                HandlerRegistration::new(
                    0x0020,
                    handler_fn(|_packet, _conn| async move {
                        Ok(HandlerReply::Text("secret".to_string()))
                    }),
                )
                .with_permission(PermissionLevel::User),
            )
            .unwrap();
    });

    let (conn, mut remote) = connect();
    conn.set_permission(PermissionLevel::Guest);
    dispatcher.attach(Arc::clone(&conn));

    write_packet(&mut remote, &Packet::sequenced(0x0020, 5, Vec::new())).await;

    let directive = read_directive(&mut remote).await;
    assert_eq!(directive.reason(), Some(ProtocolReason::AccountLocked));
    assert_eq!(directive.action(), Some(ProtocolAction::None));
    assert!(!directive.flags().is_transient());
    assert_eq!(directive.sequence_id(), 5);
}

#[tokio::test]
async fn sufficient_permission_admits() {
    let dispatcher = build_with(|b| {
        b
            .register(
                HandlerRegistration::new(
                    0x0020,
                    handler_fn(|_packet, _conn| async move {
                        Ok(HandlerReply::Text("granted".to_string()))
                    }),
                )
                .with_permission(PermissionLevel::User),
            )
            .unwrap();
    });

    let (conn, mut remote) = connect();
    conn.set_permission(PermissionLevel::Privileged);
    dispatcher.attach(Arc::clone(&conn));

    write_packet(&mut remote, &Packet::new(0x0020, Vec::new())).await;
    assert_eq!(read_packet(&mut remote).await.as_text().unwrap(), "granted");
}

#[tokio::test]
async fn handler_timeout_sends_transient_retry() {
    let dispatcher = build_with(|b| {
        b
            .register(
                HandlerRegistration::new(
                    0x0030,
                    handler_fn(|_packet, _conn| async move {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        Ok(HandlerReply::Text("too late".to_string()))
                    }),
                )
                .with_timeout(Duration::from_millis(50)),
            )
            .unwrap();
    });

    let (conn, mut remote) = connect();
    dispatcher.attach(Arc::clone(&conn));

    write_packet(&mut remote, &Packet::sequenced(0x0030, 77, Vec::new())).await;

    let directive = read_directive(&mut remote).await;
    assert_eq!(directive.reason(), Some(ProtocolReason::Timeout));
    assert_eq!(directive.action(), Some(ProtocolAction::Retry));
    assert!(directive.flags().is_transient());
    assert_eq!(directive.sequence_id(), 77);
}

#[tokio::test]
async fn handler_error_is_classified() {
    let dispatcher = build_with(|b| {
        b
            .register(HandlerRegistration::new(
                0x0040,
                handler_fn(|_packet, _conn| async move {
                    Err::<HandlerReply, _>(HandlerError::Validation("bad body".to_string()))
                }),
            ))
            .unwrap();
    });

    let (conn, mut remote) = connect();
    dispatcher.attach(Arc::clone(&conn));

    write_packet(&mut remote, &Packet::sequenced(0x0040, 3, Vec::new())).await;

    let directive = read_directive(&mut remote).await;
    assert_eq!(directive.reason(), Some(ProtocolReason::RequestInvalid));
    assert_eq!(directive.action(), Some(ProtocolAction::FixAndRetry));
}

#[tokio::test]
async fn handler_panic_is_contained() {
    let dispatcher = build_with(|b| {
        b
            .register(HandlerRegistration::new(
                0x0041,
                handler_fn(|packet: Packet, _conn| async move {
                    if packet.opcode() == 0x0041 {
                        panic!("handler bug");
                    }
                    Ok(HandlerReply::None)
                }),
            ))
            .unwrap();
    });

    let (conn, mut remote) = connect();
    dispatcher.attach(Arc::clone(&conn));

    write_packet(&mut remote, &Packet::sequenced(0x0041, 8, Vec::new())).await;

    let directive = read_directive(&mut remote).await;
    assert_eq!(directive.reason(), Some(ProtocolReason::InternalError));
    assert_eq!(directive.sequence_id(), 8);

    // The dispatcher survives: the next packet still dispatches.
    write_packet(&mut remote, &Packet::sequenced(0x0041, 9, Vec::new())).await;
    assert_eq!(read_directive(&mut remote).await.sequence_id(), 9);
}

#[tokio::test]
async fn unknown_opcode_is_request_invalid() {
    let dispatcher = build(DispatcherBuilder::new());

    let (conn, mut remote) = connect();
    dispatcher.attach(Arc::clone(&conn));

    write_packet(&mut remote, &Packet::sequenced(0x0666, 2, Vec::new())).await;

    let directive = read_directive(&mut remote).await;
    assert_eq!(directive.reason(), Some(ProtocolReason::RequestInvalid));
    assert_eq!(directive.sequence_id(), 2);
    assert_eq!(directive.arg0(), 0x0666);
}

#[tokio::test]
async fn encryption_required_rejects_plaintext() {
    let dispatcher = build_with(|b| {
        b
            .register(
                HandlerRegistration::new(
                    0x0050,
                    handler_fn(|_packet, _conn| async move { Ok(HandlerReply::None) }),
                )
                .require_encryption(),
            )
            .unwrap();
    });

    let (conn, mut remote) = connect();
    dispatcher.attach(Arc::clone(&conn));

    write_packet(&mut remote, &Packet::sequenced(0x0050, 4, vec![1u8])).await;

    let directive = read_directive(&mut remote).await;
    assert_eq!(directive.reason(), Some(ProtocolReason::EncryptionMismatch));
    assert_eq!(directive.action(), Some(ProtocolAction::FixAndRetry));
}

#[tokio::test]
async fn encrypted_packet_is_decrypted_before_handler() {
    let secret_bytes = [0x44u8; 32];

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let dispatcher = build_with(|b| {
        b
            .register(
                HandlerRegistration::new(
                    0x0051,
                    handler_fn(move |packet: Packet, _conn| {
                        let sink = Arc::clone(&sink);
                        async move {
                            sink.lock().unwrap().push(packet.payload.to_vec());
                            Ok(HandlerReply::None)
                        }
                    }),
                )
                .require_encryption(),
            )
            .unwrap();
    });

    let (conn, mut remote) = connect();
    conn.set_secret(&secret_bytes).unwrap();
    dispatcher.attach(Arc::clone(&conn));

    // Encrypt client-side with the shared secret.
    let cipher = AeadCipher::new();
    let secret = SessionSecret::new(secret_bytes);
    let plain = Packet::sequenced(0x0051, 1, b"attack at dawn".to_vec());
    let ciphertext = cipher.encrypt(conn.suite(), &secret, &plain.payload).unwrap();
    write_packet(&mut remote, &plain.with_encrypted_payload(ciphertext)).await;

    // Wait for the handler to run.
    loop {
        if !seen.lock().unwrap().is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(seen.lock().unwrap()[0], b"attack at dawn");
}

#[tokio::test]
async fn packets_on_one_connection_dispatch_in_order() {
    let entered = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&entered);

    let dispatcher = build_with(|b| {
        b
            .register(HandlerRegistration::new(
                0x0060,
                handler_fn(move |packet: Packet, _conn| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.lock().unwrap().push(packet.sequence_id());
                        // The first packet dawdles; FIFO must still hold.
                        if packet.sequence_id() == 1 {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                        Ok(HandlerReply::None)
                    }
                }),
            ))
            .unwrap();
    });

    let (conn, mut remote) = connect();
    dispatcher.attach(Arc::clone(&conn));

    for sequence in 1u32..=5 {
        write_packet(&mut remote, &Packet::sequenced(0x0060, sequence, Vec::new())).await;
    }

    loop {
        if entered.lock().unwrap().len() == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(*entered.lock().unwrap(), vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn duplicate_opcode_rejected_and_table_unchanged() {
    struct EchoController;

    impl PacketController for EchoController {
        fn registrations(&self) -> Vec<HandlerRegistration> {
            vec![
                HandlerRegistration::new(
                    0x0070,
                    handler_fn(|_p, _c| async move { Ok(HandlerReply::None) }),
                ),
                HandlerRegistration::new(
                    0x0071,
                    handler_fn(|_p, _c| async move { Ok(HandlerReply::None) }),
                ),
            ]
        }
    }

    let mut builder = DispatcherBuilder::new();
    builder.register_controller(&EchoController).unwrap();
    assert_eq!(builder.staged_count(), 2);

    // Registering the same controller again must fail and leave the table
    // as it was.
    let err = builder.register_controller(&EchoController).map(|_| ()).unwrap_err();
    assert_eq!(err, RegistrationError::DuplicateOpcode(0x0070));
    assert_eq!(builder.staged_count(), 2);

    let dispatcher = build(builder);
    assert_eq!(dispatcher.handler_count(), 2);
}

#[tokio::test]
async fn empty_controller_rejected() {
    struct Hollow;

    impl PacketController for Hollow {
        fn registrations(&self) -> Vec<HandlerRegistration> {
            Vec::new()
        }
    }

    let mut builder = DispatcherBuilder::new();
    let err = builder.register_controller(&Hollow).map(|_| ()).unwrap_err();
    assert_eq!(err, RegistrationError::EmptyController);
    assert_eq!(builder.staged_count(), 0);
}

#[tokio::test]
async fn reserved_opcode_rejected() {
    let mut builder = DispatcherBuilder::new();
    let err = builder
        .register(HandlerRegistration::new(
            0,
            handler_fn(|_p, _c| async move { Ok(HandlerReply::None) }),
        ))
        .map(|_| ())
        .unwrap_err();
    assert_eq!(err, RegistrationError::ReservedOpcode);
}

struct Tag {
    label: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl Middleware for Tag {
    async fn handle(
        &self,
        ctx: &mut DispatchContext,
        next: Next<'_>,
    ) -> Result<(), DispatchError> {
        self.log.lock().unwrap().push(self.label);
        next.run(ctx).await
    }
}

#[tokio::test]
async fn middleware_order_pre_in_insertion_post_inverse() {
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let handler_log = Arc::clone(&log);
    let dispatcher = build_with(|b| {
        b
            .use_pre(Arc::new(Tag { label: "pre1", log: Arc::clone(&log) }))
            .use_pre(Arc::new(Tag { label: "pre2", log: Arc::clone(&log) }))
            .use_post(Arc::new(Tag { label: "post1", log: Arc::clone(&log) }))
            .use_post(Arc::new(Tag { label: "post2", log: Arc::clone(&log) }))
            .register(HandlerRegistration::new(
                0x0080,
                handler_fn(move |_p, _c| {
                    let log = Arc::clone(&handler_log);
                    async move {
                        log.lock().unwrap().push("handler");
                        Ok(HandlerReply::Text("done".to_string()))
                    }
                }),
            ))
            .unwrap();
    });

    let (conn, mut remote) = connect();
    dispatcher.attach(Arc::clone(&conn));

    write_packet(&mut remote, &Packet::new(0x0080, Vec::new())).await;
    assert_eq!(read_packet(&mut remote).await.as_text().unwrap(), "done");

    // Pre middlewares run in insertion order before the handler; post
    // middlewares wrap the send with the last added outermost.
    assert_eq!(*log.lock().unwrap(), vec!["pre1", "pre2", "handler", "post2", "post1"]);
}

#[tokio::test]
async fn short_circuit_pre_middleware_skips_handler() {
    struct Gate;

    #[async_trait]
    impl Middleware for Gate {
        async fn handle(
            &self,
            _ctx: &mut DispatchContext,
            _next: Next<'_>,
        ) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    let invoked = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&invoked);
    let dispatcher = build_with(|b| {
        b
            .use_pre(Arc::new(Gate))
            .register(HandlerRegistration::new(
                0x0090,
                handler_fn(move |_p, _c| {
                    let flag = Arc::clone(&flag);
                    async move {
                        *flag.lock().unwrap() = true;
                        Ok(HandlerReply::None)
                    }
                }),
            ))
            .unwrap();
    });

    let (conn, mut remote) = connect();
    dispatcher.attach(Arc::clone(&conn));

    write_packet(&mut remote, &Packet::new(0x0090, Vec::new())).await;

    // Give the dispatch loop a moment; nothing should have reached the
    // handler and nothing should have been sent.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!*invoked.lock().unwrap());
    assert_eq!(conn.channel().stats().sent(), 0);
}

#[tokio::test]
async fn bytes_reply_is_sent_verbatim() {
    let dispatcher = build_with(|b| {
        b
            .register(HandlerRegistration::new(
                0x00A0,
                handler_fn(|_p, _c| async move {
                    let mut body = BytesMut::new();
                    Packet::new(0x00A0, b"raw reply".to_vec()).encode(&mut body).unwrap();
                    Ok(HandlerReply::Bytes(body.freeze()))
                }),
            ))
            .unwrap();
    });

    let (conn, mut remote) = connect();
    dispatcher.attach(Arc::clone(&conn));

    write_packet(&mut remote, &Packet::new(0x00A0, Vec::new())).await;

    let reply = read_packet(&mut remote).await;
    assert_eq!(reply.opcode(), 0x00A0);
    assert!(!reply.is_encrypted());
    assert_eq!(&reply.payload[..], b"raw reply");
}
