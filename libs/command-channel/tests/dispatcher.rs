#![allow(clippy::unwrap_used)]

//! Dispatcher end-to-end tests against an in-memory vehicle: a task that
//! holds real verifiers and answers session-info requests and commands the
//! way a car does.

use command_channel::{
    AuthMethod, Dispatcher, SendError, SessionCache, Transport, TransportError,
};
use fleetlink_model::{Domain, MessageFault, VehicleId};
use keyfob::Verifier;
use keyfob::crypto::{PrivateKey as _, SoftwareKey};
use keyfob::wire::{
    Destination, MessageStatus, OperationStatus, Payload, RoutedMessage, SessionInfoRequest,
};
use parking_lot::Mutex;
use prost::Message as _;
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing_subscriber::util::SubscriberInitExt as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{broadcast, mpsc};

const VIN: &str = "testVIN-1234";

/// Routes dispatcher logs into the test output; run with
/// `RUST_LOG=command_channel=trace` to watch a failing case.
fn subscribe() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .set_default()
}

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(2)
}

fn command(domain: Domain, payload: &[u8]) -> RoutedMessage {
    RoutedMessage {
        to: Some(Destination::domain(domain)),
        payload: Some(Payload::Command(payload.to_vec())),
        ..Default::default()
    }
}

#[derive(Default)]
struct VehicleConfig {
    /// Client public key the vehicle has paired, if any.
    enrolled: Option<Vec<u8>>,
    /// Flip a byte in every session-info tag before replying.
    corrupt_session_info: bool,
    /// How many copies of each command reply to send.
    echo_replies: usize,
    /// Never answer anything.
    silent: bool,
}

struct TestTransport {
    to_vehicle: mpsc::Sender<Vec<u8>>,
    inbound: tokio::sync::Mutex<broadcast::Receiver<Vec<u8>>>,
    /// Fail this many sends with a temporary error before succeeding.
    fail_sends: AtomicUsize,
    /// Mark those failures as possibly delivered.
    possibly_delivered: bool,
}

#[async_trait::async_trait]
impl Transport for TestTransport {
    fn preferred_auth_method(&self) -> AuthMethod {
        AuthMethod::Gcm
    }

    fn retry_interval(&self) -> Duration {
        Duration::from_millis(20)
    }

    fn allowed_latency(&self) -> Duration {
        Duration::from_secs(2)
    }

    async fn send(&self, message: Vec<u8>) -> Result<(), TransportError> {
        if self
            .fail_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError {
                reason: "simulated congestion".to_owned(),
                possibly_delivered: self.possibly_delivered,
                temporary: true,
            });
        }

        self.to_vehicle
            .send(message)
            .await
            .map_err(|_| TransportError::permanent("vehicle is gone"))
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        let mut inbound = self.inbound.lock().await;

        loop {
            match inbound.recv().await {
                Ok(bytes) => return Some(bytes),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn close(&self) {}
}

struct Harness {
    client_key: Arc<SoftwareKey>,
    to_vehicle: mpsc::Sender<Vec<u8>>,
    from_vehicle: broadcast::Sender<Vec<u8>>,
    handshakes: Arc<AtomicUsize>,
}

impl Harness {
    /// Spawns the vehicle task; `enroll` pairs the returned client key.
    fn new(mut config: VehicleConfig, enroll: bool) -> Self {
        let client_key = Arc::new(SoftwareKey::generate(&mut OsRng));
        if enroll {
            config.enrolled = Some(client_key.public_bytes());
        }

        let (to_vehicle, vehicle_inbox) = mpsc::channel::<Vec<u8>>(64);
        let (from_vehicle, _) = broadcast::channel::<Vec<u8>>(64);
        let handshakes = Arc::new(AtomicUsize::new(0));

        tokio::spawn(run_vehicle(
            config,
            vehicle_inbox,
            from_vehicle.clone(),
            handshakes.clone(),
        ));

        Self {
            client_key,
            to_vehicle,
            from_vehicle,
            handshakes,
        }
    }

    fn transport(&self) -> Arc<TestTransport> {
        Arc::new(TestTransport {
            to_vehicle: self.to_vehicle.clone(),
            inbound: tokio::sync::Mutex::new(self.from_vehicle.subscribe()),
            fail_sends: AtomicUsize::new(0),
            possibly_delivered: false,
        })
    }

    fn dispatcher(&self, transport: Arc<TestTransport>) -> Dispatcher {
        let dispatcher = Dispatcher::new(
            transport,
            self.client_key.clone(),
            VehicleId::new(VIN),
        );
        dispatcher.start();

        dispatcher
    }
}

async fn run_vehicle(
    config: VehicleConfig,
    mut inbox: mpsc::Receiver<Vec<u8>>,
    outbox: broadcast::Sender<Vec<u8>>,
    handshakes: Arc<AtomicUsize>,
) {
    let vehicle_key = SoftwareKey::generate(&mut OsRng);
    let mut verifiers: HashMap<Domain, Verifier> = HashMap::new();

    while let Some(bytes) = inbox.recv().await {
        if config.silent {
            continue;
        }

        let Ok(message) = RoutedMessage::decode(bytes.as_slice()) else {
            continue;
        };
        let Some(domain) = message.to_domain() else {
            continue;
        };
        let Some(client) = message.from.as_ref().and_then(Destination::as_address) else {
            continue;
        };

        let mut reply = RoutedMessage {
            to: Some(Destination::address(client)),
            from: Some(Destination::domain(domain)),
            uuid: uuid::Uuid::new_v4().as_bytes().to_vec(),
            request_uuid: message.uuid.clone(),
            ..Default::default()
        };

        match &message.payload {
            Some(Payload::SessionInfoRequest(SessionInfoRequest { public_key })) => {
                handshakes.fetch_add(1, Ordering::SeqCst);

                if config.enrolled.as_deref() != Some(public_key.as_slice()) {
                    reply.status = Some(MessageStatus::fault(MessageFault::UnknownKeyId));
                } else {
                    let verifier = verifiers.entry(domain).or_insert_with(|| {
                        Verifier::new(
                            &vehicle_key,
                            VIN.as_bytes(),
                            domain,
                            public_key,
                            Instant::now(),
                            SystemTime::now(),
                        )
                        .unwrap()
                    });

                    verifier.set_session_info(&message.uuid, &mut reply, Instant::now());

                    if config.corrupt_session_info {
                        if let Some(keyfob::wire::SigType::SessionInfoTag(hmac)) = reply
                            .signature_data
                            .as_mut()
                            .and_then(|s| s.sig_type.as_mut())
                        {
                            hmac.tag[0] ^= 0xFF;
                        }
                    }
                }

                let _ = outbox.send(reply.encode_to_vec());
            }
            Some(Payload::Command(_)) => {
                let Some(verifier) = verifiers.get_mut(&domain) else {
                    continue;
                };

                match verifier.verify(&message, Instant::now(), SystemTime::now()) {
                    Ok(plaintext) => {
                        reply.payload = Some(Payload::Command(plaintext));
                        reply.status = Some(MessageStatus {
                            operation_status: OperationStatus::Ok as i32,
                            signed_message_fault: MessageFault::None as i32,
                        });

                        for _ in 0..config.echo_replies.max(1) {
                            let mut copy = reply.clone();
                            copy.uuid = uuid::Uuid::new_v4().as_bytes().to_vec();
                            let _ = outbox.send(copy.encode_to_vec());
                        }
                    }
                    Err(error) => {
                        reply.status = Some(MessageStatus::fault(error.fault()));
                        if let Some(info) = error.into_resync() {
                            reply.payload = Some(Payload::SessionInfo(info.encoded_info));
                            reply.signature_data = Some(keyfob::wire::SignatureData {
                                signer_identity: None,
                                sig_type: Some(keyfob::wire::SigType::SessionInfoTag(
                                    keyfob::wire::HmacSignature {
                                        tag: info.tag.to_vec(),
                                    },
                                )),
                            });
                        }

                        let _ = outbox.send(reply.encode_to_vec());
                    }
                }
            }
            Some(Payload::SessionInfo(_)) | None => {}
        }
    }
}

#[tokio::test]
async fn handshake_then_encrypted_command_round_trips() {
    let _guard = subscribe();

    let harness = Harness::new(VehicleConfig::default(), true);
    let dispatcher = harness.dispatcher(harness.transport());

    dispatcher
        .start_session(Domain::VehicleSecurity, deadline())
        .await
        .unwrap();

    let mut receiver = dispatcher
        .send(
            command(Domain::VehicleSecurity, b"flash lights"),
            AuthMethod::Gcm,
            deadline(),
        )
        .await
        .unwrap();

    let reply = receiver.recv().await.unwrap();
    assert_eq!(reply.command(), Some(&b"flash lights"[..]));
    assert_eq!(reply.fault(), None);
}

#[tokio::test]
async fn hmac_commands_work_too() {
    let harness = Harness::new(VehicleConfig::default(), true);
    let dispatcher = harness.dispatcher(harness.transport());

    dispatcher
        .start_sessions(&[Domain::VehicleSecurity, Domain::Infotainment], deadline())
        .await
        .unwrap();

    let mut receiver = dispatcher
        .send(
            command(Domain::Infotainment, b"next track"),
            AuthMethod::Hmac,
            deadline(),
        )
        .await
        .unwrap();

    let reply = receiver.recv().await.unwrap();
    assert_eq!(reply.command(), Some(&b"next track"[..]));
}

#[tokio::test]
async fn authenticated_send_without_session_is_refused() {
    let harness = Harness::new(VehicleConfig::default(), true);
    let dispatcher = harness.dispatcher(harness.transport());

    let err = dispatcher
        .send(
            command(Domain::VehicleSecurity, b"unlock"),
            AuthMethod::Hmac,
            deadline(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SendError::NoSession(Domain::VehicleSecurity)));
}

#[tokio::test]
async fn unpaired_key_surfaces_as_key_not_paired() {
    let harness = Harness::new(VehicleConfig::default(), false);
    let dispatcher = harness.dispatcher(harness.transport());

    let err = dispatcher
        .start_session(Domain::VehicleSecurity, deadline())
        .await
        .unwrap_err();

    assert!(matches!(err, SendError::KeyNotPaired));
}

#[tokio::test]
async fn corrupt_session_info_is_forwarded_but_never_trusted() {
    let _guard = subscribe();

    let harness = Harness::new(
        VehicleConfig {
            corrupt_session_info: true,
            ..Default::default()
        },
        true,
    );
    let dispatcher = harness.dispatcher(harness.transport());

    // The handshake can never complete: every reply fails authentication.
    let err = dispatcher
        .start_session(
            Domain::VehicleSecurity,
            Instant::now() + Duration::from_millis(300),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::DeadlineExceeded { .. }));

    // An explicit request sees the raw envelope; the dispatcher still
    // refuses to build a session from it.
    let mut receiver = dispatcher
        .send(
            RoutedMessage {
                to: Some(Destination::domain(Domain::VehicleSecurity)),
                payload: Some(Payload::SessionInfoRequest(SessionInfoRequest {
                    public_key: harness.client_key.public_bytes(),
                })),
                ..Default::default()
            },
            AuthMethod::None,
            deadline(),
        )
        .await
        .unwrap();

    let reply = receiver.recv().await.unwrap();
    assert!(reply.session_info().is_some());

    let err = dispatcher
        .send(
            command(Domain::VehicleSecurity, b"unlock"),
            AuthMethod::Hmac,
            deadline(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::NoSession(_)));
}

#[tokio::test]
async fn transient_transport_failures_are_retried() {
    let harness = Harness::new(VehicleConfig::default(), true);
    let transport = harness.transport();
    let dispatcher = harness.dispatcher(transport.clone());

    dispatcher
        .start_session(Domain::VehicleSecurity, deadline())
        .await
        .unwrap();

    transport.fail_sends.store(3, Ordering::SeqCst);

    let mut receiver = dispatcher
        .send(
            command(Domain::VehicleSecurity, b"honk"),
            AuthMethod::Gcm,
            deadline(),
        )
        .await
        .unwrap();

    assert_eq!(receiver.recv().await.unwrap().command(), Some(&b"honk"[..]));
}

#[tokio::test]
async fn exhausted_deadline_reports_possible_delivery() {
    let harness = Harness::new(VehicleConfig::default(), true);

    let transport = Arc::new(TestTransport {
        to_vehicle: harness.to_vehicle.clone(),
        inbound: tokio::sync::Mutex::new(harness.from_vehicle.subscribe()),
        fail_sends: AtomicUsize::new(usize::MAX),
        possibly_delivered: true,
    });
    let dispatcher = harness.dispatcher(transport);

    let err = dispatcher
        .send(
            command(Domain::VehicleSecurity, b"unlock"),
            AuthMethod::None,
            Instant::now() + Duration::from_millis(100),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SendError::DeadlineExceeded { .. }));
    assert!(err.may_have_succeeded());
    assert!(err.is_temporary());
}

#[tokio::test]
async fn stop_delivers_a_terminal_fault_to_pending_receivers() {
    let harness = Harness::new(
        VehicleConfig {
            silent: true,
            ..Default::default()
        },
        true,
    );
    let dispatcher = harness.dispatcher(harness.transport());

    let mut receiver = dispatcher
        .send(
            command(Domain::VehicleSecurity, b"anyone there?"),
            AuthMethod::None,
            deadline(),
        )
        .await
        .unwrap();

    dispatcher.stop().await;

    let terminal = receiver.recv().await.unwrap();
    assert_eq!(terminal.fault(), Some(MessageFault::Timeout));
    assert!(receiver.recv().await.is_none());

    assert!(matches!(
        dispatcher
            .send(
                command(Domain::VehicleSecurity, b"again"),
                AuthMethod::None,
                deadline()
            )
            .await,
        Err(SendError::Stopped)
    ));
}

#[tokio::test]
async fn cached_session_skips_the_handshake() {
    let harness = Harness::new(VehicleConfig::default(), true);
    let cache = Arc::new(Mutex::new(SessionCache::new(4)));

    let first = Dispatcher::new(
        harness.transport(),
        harness.client_key.clone(),
        VehicleId::new(VIN),
    )
    .with_cache(cache.clone());
    first.start();

    first
        .start_session(Domain::VehicleSecurity, deadline())
        .await
        .unwrap();
    first.stop().await;

    assert_eq!(harness.handshakes.load(Ordering::SeqCst), 1);

    // Same key, fresh dispatcher: the cache answers instead of the wire.
    let second = Dispatcher::new(
        harness.transport(),
        harness.client_key.clone(),
        VehicleId::new(VIN),
    )
    .with_cache(cache.clone());
    second.start();

    second
        .start_session(Domain::VehicleSecurity, deadline())
        .await
        .unwrap();
    assert_eq!(harness.handshakes.load(Ordering::SeqCst), 1);

    let mut receiver = second
        .send(
            command(Domain::VehicleSecurity, b"resumed"),
            AuthMethod::Gcm,
            deadline(),
        )
        .await
        .unwrap();

    assert_eq!(
        receiver.recv().await.unwrap().command(),
        Some(&b"resumed"[..])
    );
}

#[tokio::test]
async fn overflowing_inbox_drops_only_the_excess() {
    let harness = Harness::new(
        VehicleConfig {
            echo_replies: 15,
            ..Default::default()
        },
        true,
    );
    let dispatcher = harness.dispatcher(harness.transport());

    dispatcher
        .start_session(Domain::VehicleSecurity, deadline())
        .await
        .unwrap();

    let mut receiver = dispatcher
        .send(
            command(Domain::VehicleSecurity, b"spam me"),
            AuthMethod::Gcm,
            deadline(),
        )
        .await
        .unwrap();

    // Let the whole burst land while nobody is draining the inbox.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut delivered = 0;
    while let Ok(Some(reply)) =
        tokio::time::timeout(Duration::from_millis(200), receiver.recv()).await
    {
        assert_eq!(reply.command(), Some(&b"spam me"[..]));
        delivered += 1;
    }

    // The inbox holds ten; the rest were dropped without blocking the
    // reader.
    assert_eq!(delivered, 10);
}

#[tokio::test]
async fn replies_are_matched_to_their_own_request() {
    let harness = Harness::new(VehicleConfig::default(), true);
    let dispatcher = harness.dispatcher(harness.transport());

    dispatcher
        .start_session(Domain::VehicleSecurity, deadline())
        .await
        .unwrap();

    let mut first = dispatcher
        .send(
            command(Domain::VehicleSecurity, b"alpha"),
            AuthMethod::Gcm,
            deadline(),
        )
        .await
        .unwrap();
    let mut second = dispatcher
        .send(
            command(Domain::VehicleSecurity, b"beta"),
            AuthMethod::Gcm,
            deadline(),
        )
        .await
        .unwrap();

    assert_eq!(second.recv().await.unwrap().command(), Some(&b"beta"[..]));
    assert_eq!(first.recv().await.unwrap().command(), Some(&b"alpha"[..]));
}
