//! Multiplexes request/response pairs over one vehicle transport.
//!
//! The dispatcher owns the transport exclusively: a single reader task
//! decodes inbound envelopes and routes them to per-request receivers,
//! feeding authenticated session info into the per-domain signers along
//! the way. Callers interact through `start_session` and `send`.

use crate::cache::{CacheEntry, SessionCache};
use crate::receiver::{Receiver, Registry};
use crate::transport::{AuthMethod, Transport, TransportError};
use chrono::Utc;
use fleetlink_model::{Domain, MessageFault, RoutingAddress, VehicleId};
use keyfob::Signer;
use keyfob::crypto::PrivateKey;
use keyfob::wire::{
    Destination, MessageStatus, Payload, RoutedMessage, SessionInfoRequest,
};
use parking_lot::Mutex;
use prost::Message as _;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The destination domain has no established session; run
    /// `start_session` first.
    #[error("no established session for {0}")]
    NoSession(Domain),
    /// The vehicle does not know our public key.
    #[error("vehicle has not paired this key")]
    KeyNotPaired,
    /// The vehicle knows our public key but has revoked it.
    #[error("vehicle key is inactive")]
    KeyInactive,
    #[error("deadline exceeded")]
    DeadlineExceeded { may_have_succeeded: bool },
    #[error("transport failed")]
    Transport {
        #[source]
        source: TransportError,
        may_have_succeeded: bool,
    },
    /// Messages are routed by destination domain; an address or missing
    /// destination cannot be dispatched.
    #[error("message destination must be a domain")]
    InvalidDestination,
    #[error(transparent)]
    Protocol(#[from] keyfob::Error),
    #[error("dispatcher is stopped")]
    Stopped,
}

impl SendError {
    /// Whether retrying the whole operation can help.
    pub fn is_temporary(&self) -> bool {
        match self {
            SendError::DeadlineExceeded { .. } => true,
            SendError::Transport { source, .. } => source.temporary,
            SendError::NoSession(_)
            | SendError::KeyNotPaired
            | SendError::KeyInactive
            | SendError::InvalidDestination
            | SendError::Protocol(_)
            | SendError::Stopped => false,
        }
    }

    /// Whether the command may have reached the vehicle regardless of the
    /// error. Side-effecting commands must not be blindly resent then.
    pub fn may_have_succeeded(&self) -> bool {
        match self {
            SendError::DeadlineExceeded {
                may_have_succeeded,
            }
            | SendError::Transport {
                may_have_succeeded, ..
            } => *may_have_succeeded,
            SendError::NoSession(_)
            | SendError::KeyNotPaired
            | SendError::KeyInactive
            | SendError::InvalidDestination
            | SendError::Protocol(_)
            | SendError::Stopped => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    Pending,
    Ready,
    Failed(MessageFault),
}

/// Authenticated session info as it arrived on the wire, replayable into
/// the signer.
#[derive(Clone)]
struct FaultCarrier {
    challenge: Vec<u8>,
    encoded_info: Vec<u8>,
    tag: Vec<u8>,
}

struct DomainSession {
    signer: Option<Signer>,
    /// uuid of the outstanding session-info request, if a handshake is in
    /// flight. Only a reply authenticated against this challenge may
    /// create the session.
    handshake: Option<[u8; 16]>,
    /// The latest authenticated session info seen for this domain, kept
    /// so a failing signer can be resynchronized at signing time.
    fault_carrier: Option<FaultCarrier>,
    state: watch::Sender<SessionState>,
}

impl Default for DomainSession {
    fn default() -> Self {
        Self {
            signer: None,
            handshake: None,
            fault_carrier: None,
            state: watch::Sender::new(SessionState::Pending),
        }
    }
}

pub struct Dispatcher {
    inner: Arc<Inner>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    private_key: Arc<dyn PrivateKey>,
    vehicle: VehicleId,
    address: RoutingAddress,
    registry: Arc<Registry>,
    // Lock order: registry before sessions before cache; none across await.
    sessions: Mutex<HashMap<Domain, DomainSession>>,
    cache: Option<Arc<Mutex<SessionCache>>>,
    stopped: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        private_key: Arc<dyn PrivateKey>,
        vehicle: VehicleId,
    ) -> Self {
        let address = RoutingAddress::from_public_key(&private_key.public_bytes());

        Self {
            inner: Arc::new(Inner {
                transport,
                private_key,
                vehicle,
                address,
                registry: Arc::new(Registry::default()),
                sessions: Mutex::new(HashMap::new()),
                cache: None,
                stopped: watch::Sender::new(false),
            }),
            reader: Mutex::new(None),
        }
    }

    /// Consults `cache` before handshaking and writes fresh session info
    /// back into it. Sharing a cache between dispatchers is only sound
    /// when they use the same private key.
    pub fn with_cache(mut self, cache: Arc<Mutex<SessionCache>>) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_cache is called before the dispatcher is shared");
        inner.cache = Some(cache);

        self
    }

    /// Our routing address, derived from the local public key.
    pub fn address(&self) -> RoutingAddress {
        self.inner.address
    }

    /// Launches the reader task. Idempotent.
    pub fn start(&self) {
        let mut reader = self.reader.lock();
        if reader.is_some() {
            return;
        }

        let inner = self.inner.clone();
        let mut stopped = self.inner.stopped.subscribe();

        *reader = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    message = inner.transport.recv() => match message {
                        Some(bytes) => inner.handle_inbound(&bytes),
                        None => break,
                    },
                }
            }

            inner.connection_lost();
        }));
    }

    /// Tears the dispatcher down: pending receivers observe a terminal
    /// fault, handshake waiters fail, the transport closes.
    pub async fn stop(&self) {
        if self.inner.stopped.send_replace(true) {
            return;
        }

        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }

        self.inner.transport.close().await;
        self.inner.connection_lost();
    }

    /// Ensures a ready session for `domain`: resumes from the cache when
    /// possible, otherwise handshakes, re-sending the request at the
    /// transport's retry interval until `deadline`.
    pub async fn start_session(&self, domain: Domain, deadline: Instant) -> Result<(), SendError> {
        if *self.inner.stopped.borrow() {
            return Err(SendError::Stopped);
        }

        let mut state = {
            let mut sessions = self.inner.sessions.lock();
            let session = sessions.entry(domain).or_default();
            if session.signer.is_some() {
                return Ok(());
            }

            session.state.subscribe()
        };

        if self.inner.resume_from_cache(domain) {
            return Ok(());
        }

        let uuid = *uuid::Uuid::new_v4().as_bytes();
        {
            let mut sessions = self.inner.sessions.lock();
            let session = sessions.entry(domain).or_default();
            session.handshake = Some(uuid);
            session.state.send_replace(SessionState::Pending);
        }

        let request = RoutedMessage {
            to: Some(Destination::domain(domain)),
            from: Some(Destination::address(self.inner.address)),
            payload: Some(Payload::SessionInfoRequest(SessionInfoRequest {
                public_key: self.inner.private_key.public_bytes(),
            })),
            uuid: uuid.to_vec(),
            ..Default::default()
        };
        let bytes = request.encode_to_vec();
        let retry_interval = self.inner.transport.retry_interval();

        tracing::debug!(%domain, "Requesting session info");

        loop {
            if Instant::now() >= deadline {
                return Err(SendError::DeadlineExceeded {
                    may_have_succeeded: false,
                });
            }

            match self.inner.transport.send(bytes.clone()).await {
                Ok(()) | Err(TransportError { temporary: true, .. }) => {}
                Err(source) => {
                    return Err(SendError::Transport {
                        may_have_succeeded: false,
                        source,
                    });
                }
            }

            let wake_at = (Instant::now() + retry_interval).min(deadline);

            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(SendError::Stopped);
                    }

                    match *state.borrow_and_update() {
                        SessionState::Ready => return Ok(()),
                        SessionState::Failed(MessageFault::UnknownKeyId) => {
                            return Err(SendError::KeyNotPaired);
                        }
                        SessionState::Failed(MessageFault::InactiveKey) => {
                            return Err(SendError::KeyInactive);
                        }
                        SessionState::Failed(_) => return Err(SendError::Stopped),
                        SessionState::Pending => {}
                    }
                }
                _ = tokio::time::sleep_until(wake_at.into()) => {}
            }
        }
    }

    /// Runs independent handshakes for every domain concurrently.
    pub async fn start_sessions(
        &self,
        domains: &[Domain],
        deadline: Instant,
    ) -> Result<(), SendError> {
        futures::future::try_join_all(
            domains
                .iter()
                .map(|domain| self.start_session(*domain, deadline)),
        )
        .await?;

        Ok(())
    }

    /// Signs and transmits `message`, returning the receiver its replies
    /// land in. Transient transport failures are retried until `deadline`.
    pub async fn send(
        &self,
        message: RoutedMessage,
        auth_method: AuthMethod,
        deadline: Instant,
    ) -> Result<Receiver, SendError> {
        if *self.inner.stopped.borrow() {
            return Err(SendError::Stopped);
        }

        let domain = message.to_domain().ok_or(SendError::InvalidDestination)?;

        let mut message = message;
        let uuid = *uuid::Uuid::new_v4().as_bytes();
        message.uuid = uuid.to_vec();
        message.from = Some(Destination::address(self.inner.address));

        if auth_method != AuthMethod::None {
            // The command outlives the caller's patience by the link's
            // latency allowance, no longer.
            let expires_in = deadline.saturating_duration_since(Instant::now())
                + self.inner.transport.allowed_latency();
            self.inner.sign(&mut message, domain, auth_method, expires_in)?;
        }

        let receiver = self
            .inner
            .registry
            .register((self.inner.address, uuid, domain));

        let bytes = message.encode_to_vec();
        let retry_interval = self.inner.transport.retry_interval();
        let mut may_have_succeeded = false;

        loop {
            match self.inner.transport.send(bytes.clone()).await {
                Ok(()) => break,
                Err(error) => {
                    may_have_succeeded |= error.possibly_delivered;

                    if !error.temporary {
                        return Err(SendError::Transport {
                            may_have_succeeded,
                            source: error,
                        });
                    }

                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SendError::DeadlineExceeded { may_have_succeeded });
                    }

                    tokio::time::sleep_until(((now + retry_interval).min(deadline)).into()).await;

                    if Instant::now() >= deadline {
                        return Err(SendError::DeadlineExceeded { may_have_succeeded });
                    }
                }
            }
        }

        Ok(receiver)
    }
}

impl Inner {
    fn handle_inbound(&self, bytes: &[u8]) {
        let message = match RoutedMessage::decode(bytes) {
            Ok(message) => message,
            Err(error) => {
                tracing::debug!(%error, "Dropping undecodable envelope");
                return;
            }
        };

        let Some(address) = message.to.as_ref().and_then(Destination::as_address) else {
            tracing::debug!("Dropping reply without a routing address");
            return;
        };
        let Ok(request_uuid) = <[u8; 16]>::try_from(message.request_uuid.as_slice()) else {
            tracing::debug!("Dropping reply without a request uuid");
            return;
        };
        let Some(domain) = message.from_domain() else {
            tracing::debug!("Dropping reply without a source domain");
            return;
        };

        match (message.session_info(), message.session_info_tag()) {
            (Some(encoded), Some(tag)) => {
                self.apply_session_info(domain, &message.request_uuid, encoded, tag);
            }
            (Some(_), None) => {
                // Forwarded to the receiver below, but it must never
                // create or mutate a session.
                tracing::debug!(%domain, "Session info without authentication tag");
            }
            (None, _) => {}
        }

        if let Some(fault) = message.fault() {
            if fault.is_fatal_to_handshake() {
                self.fail_handshake(domain, fault);
            }
        }

        if !self.registry.deliver(&(address, request_uuid, domain), message) {
            tracing::debug!(%domain, "No receiver for reply; dropping");
        }
    }

    /// Feeds authenticated session info into the domain's signer, or
    /// creates the signer if this reply answers our handshake.
    fn apply_session_info(&self, domain: Domain, challenge: &[u8], encoded: &[u8], tag: &[u8]) {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(&domain) else {
            return;
        };

        if let Some(signer) = &mut session.signer {
            match signer.update_signed_session_info(challenge, encoded, tag, now) {
                Ok(()) => self.store_session(domain, signer, now),
                Err(error) => {
                    tracing::debug!(%domain, %error, "Ignoring session info");
                    return;
                }
            }
        } else {
            if session.handshake.map(|uuid| uuid[..] == *challenge) != Some(true) {
                return;
            }

            match Signer::new_authenticated(
                self.private_key.as_ref(),
                self.vehicle.as_bytes(),
                challenge,
                encoded,
                tag,
                now,
            ) {
                Ok(signer) => {
                    tracing::debug!(%domain, "Session established");
                    self.store_session(domain, &signer, now);
                    session.signer = Some(signer);
                    session.handshake = None;
                    session.state.send_replace(SessionState::Ready);
                }
                Err(error) => {
                    tracing::debug!(%domain, %error, "Discarding session info that failed authentication");
                    return;
                }
            }
        }

        session.fault_carrier = Some(FaultCarrier {
            challenge: challenge.to_vec(),
            encoded_info: encoded.to_vec(),
            tag: tag.to_vec(),
        });
    }

    fn store_session(&self, domain: Domain, signer: &Signer, now: Instant) {
        let Some(cache) = &self.cache else {
            return;
        };

        let entry = CacheEntry::new(domain, signer.export_session_info(now), Utc::now());
        cache.lock().update_domain(&self.vehicle, entry);
    }

    /// Builds a signer from the cache, if it holds anything usable.
    fn resume_from_cache(&self, domain: Domain) -> bool {
        let Some(cache) = &self.cache else {
            return false;
        };
        let Some(entry) = cache.lock().get_domain(&self.vehicle, domain).cloned() else {
            return false;
        };

        match Signer::import(
            self.private_key.as_ref(),
            self.vehicle.as_bytes(),
            &entry.data,
            entry.created_at.into(),
            Instant::now(),
            SystemTime::now(),
        ) {
            Ok(signer) => {
                tracing::debug!(%domain, "Resuming session from cache");

                let mut sessions = self.sessions.lock();
                let session = sessions.entry(domain).or_default();
                if session.signer.is_none() {
                    session.signer = Some(signer);
                    session.state.send_replace(SessionState::Ready);
                }

                true
            }
            Err(error) => {
                tracing::debug!(%domain, %error, "Cached session info unusable");
                false
            }
        }
    }

    fn sign(
        &self,
        message: &mut RoutedMessage,
        domain: Domain,
        auth_method: AuthMethod,
        expires_in: Duration,
    ) -> Result<(), SendError> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(&domain).ok_or(SendError::NoSession(domain))?;

        let seal = |signer: &mut Signer, message: &mut RoutedMessage| match auth_method {
            AuthMethod::Hmac => signer.authorize_hmac(message, expires_in, now),
            AuthMethod::Gcm => signer.encrypt(message, expires_in, now),
            AuthMethod::None => Ok(()),
        };

        let Some(signer) = session.signer.as_mut() else {
            return Err(SendError::NoSession(domain));
        };

        let error = match seal(signer, message) {
            Ok(()) => return Ok(()),
            Err(error) if error.is_session_desync() => error,
            Err(error) => return Err(SendError::Protocol(error)),
        };

        // The signer's view of the session is stale (e.g. its counter
        // space is spent). Replay the latest fault carrier the reader has
        // seen for this domain and try once more.
        let Some(carrier) = session.fault_carrier.clone() else {
            return Err(SendError::Protocol(error));
        };
        let Some(signer) = session.signer.as_mut() else {
            return Err(SendError::NoSession(domain));
        };

        if let Err(update_error) = signer.update_signed_session_info(
            &carrier.challenge,
            &carrier.encoded_info,
            &carrier.tag,
            now,
        ) {
            tracing::debug!(%domain, %update_error, "Cached session info no longer applies");
            return Err(SendError::Protocol(error));
        }

        tracing::debug!(%domain, %error, "Re-signing after applying cached session info");
        seal(signer, message).map_err(SendError::Protocol)
    }

    fn fail_handshake(&self, domain: Domain, fault: MessageFault) {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(&domain) else {
            return;
        };

        if session.signer.is_none() && session.handshake.is_some() {
            tracing::debug!(%domain, %fault, "Handshake failed");
            session.handshake = None;
            session.state.send_replace(SessionState::Failed(fault));
        }
    }

    /// The link is gone: every pending receiver observes a terminal fault
    /// and every handshake waiter fails.
    fn connection_lost(&self) {
        let terminal = RoutedMessage {
            status: Some(MessageStatus::fault(MessageFault::Timeout)),
            ..Default::default()
        };
        self.registry.fail_all(&terminal);

        let mut sessions = self.sessions.lock();
        for session in sessions.values_mut() {
            if session.signer.is_none() {
                session
                    .state
                    .send_replace(SessionState::Failed(MessageFault::Timeout));
            }
        }
    }
}
