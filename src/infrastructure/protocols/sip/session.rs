//! SIP session engine
//!
//! One task owns all protocol state: registration, the single call dialog and
//! every pending transaction. Inbound datagrams, retransmission timers and
//! caller commands are all handled on that task, one at a time.
//! [`SipSession`] is the cloneable handle used to talk to it.
//!
//! Commands that break the call contract (dialing while unregistered, sending
//! a digit with no established call, ...) are rejected before any datagram is
//! sent. Everything that depends on the network is reported as a
//! [`SessionEvent`] on the broadcast channel returned by
//! [`SipSession::subscribe`].

use super::auth::{AuthChallenge, DigestCredentials};
use super::builder::{generate_call_id, generate_tag, name_addr, RequestBuilder, ResponseBuilder};
use super::dialog::Dialog;
use super::dtmf::{DtmfRelay, DTMF_RELAY_CONTENT_TYPE};
use super::message::{SipMessage, SipMethod, SipRequest, SipResponse};
use super::sdp::SdpSession;
use super::transaction::{ResponseMatch, TimerOutcome, TransactionTracker};
use super::transport::{
    route_local_ip, InboundDatagram, OutgoingMessage, Transport, UdpTransport,
};
use crate::config::Config;
use crate::domain::call::{
    CallHandle, CallInitiator, CallState, DtmfDigit, RegistrationState, SessionEvent,
    SessionEventKind, SessionStatus,
};
use crate::domain::shared::{Result, SessionError};
use rsip::{Header, Param};
use std::net::{IpAddr, SocketAddr};
use std::ops::ControlFlow;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const ALLOW: &str = "INVITE, ACK, BYE, OPTIONS, INFO";

enum Command {
    Register(oneshot::Sender<Result<()>>),
    PlaceCall {
        destination: String,
        reply: oneshot::Sender<Result<CallHandle>>,
    },
    SendDigit {
        digit: DtmfDigit,
        reply: oneshot::Sender<Result<()>>,
    },
    HangUp(oneshot::Sender<Result<()>>),
    TestConnection(oneshot::Sender<Result<()>>),
    Status(oneshot::Sender<SessionStatus>),
    Disconnect(oneshot::Sender<()>),
}

/// Handle to a running session engine
#[derive(Clone)]
pub struct SipSession {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    local_addr: SocketAddr,
}

impl SipSession {
    /// Open `transport` and spawn the engine task
    pub async fn start<T>(config: Config, mut transport: T) -> Result<Self>
    where
        T: Transport + 'static,
    {
        let local_addr = transport.open().await?;
        let inbound = transport.take_receiver().ok_or_else(|| {
            SessionError::Transport("transport receiver already taken".to_string())
        })?;

        let (commands, command_rx) = mpsc::channel(32);
        let (events, _) = broadcast::channel(config.engine.event_capacity.max(1));

        let actor = SessionActor::new(
            config,
            Box::new(transport),
            inbound,
            command_rx,
            events.clone(),
            local_addr,
        );
        tokio::spawn(actor.run());

        Ok(Self {
            commands,
            events,
            local_addr,
        })
    }

    /// Start on a UDP socket bound to an ephemeral port
    pub async fn start_udp(config: Config) -> Result<Self> {
        let bind_addr = SocketAddr::new(config.engine.bind_address, 0);
        Self::start(config, UdpTransport::new(bind_addr)).await
    }

    /// Receive lifecycle events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register with the trunk. Returns once REGISTER is on the wire; the
    /// outcome arrives as `Connected` or `RegistrationFailed`.
    pub async fn register(&self) -> Result<()> {
        self.request(Command::Register).await?
    }

    /// Dial `destination` (a number, or a full `sip:` URI)
    pub async fn place_call(&self, destination: &str) -> Result<CallHandle> {
        let destination = destination.to_string();
        self.request(|reply| Command::PlaceCall { destination, reply })
            .await?
    }

    /// Send one DTMF digit (`0-9`, `*`, `#`, `A-D`) on the established call
    pub async fn send_digit(&self, digit: char) -> Result<()> {
        let digit = DtmfDigit::from_char(digit).ok_or(SessionError::InvalidDigit(digit))?;
        self.request(|reply| Command::SendDigit { digit, reply })
            .await?
    }

    pub async fn hang_up(&self) -> Result<()> {
        self.request(Command::HangUp).await?
    }

    /// Send OPTIONS to the trunk; the result arrives as `ConnectionTested`
    pub async fn test_connection(&self) -> Result<()> {
        self.request(Command::TestConnection).await?
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        self.request(Command::Status).await
    }

    /// End any call, close the transport and stop the engine
    pub async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)
    }
}

/// What a pending transaction was for
#[derive(Debug, Clone)]
enum Pending {
    Register { call_id: String },
    Invite { call_id: String },
    Info { call_id: String, digit: DtmfDigit },
    Bye { call_id: String },
    Options,
}

struct RegisterAttempt {
    call_id: String,
    from_tag: String,
    auth_retried: bool,
}

struct ActiveCall {
    call_id: String,
    destination: String,
    local_tag: String,
    /// Last INVITE sent, needed for ACKs and the auth retry
    invite: SipRequest,
    auth_retried: bool,
    dialog: Option<Dialog>,
    established_at: Option<Instant>,
}

struct SessionActor {
    config: Config,
    credentials: DigestCredentials,
    transport: Box<dyn Transport>,
    inbound: mpsc::Receiver<InboundDatagram>,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<SessionEvent>,
    tracker: TransactionTracker<Pending>,
    local_addr: SocketAddr,
    /// Host and port advertised in Via and Contact
    contact_host: String,
    contact_port: u16,
    public_address_learned: bool,
    remote: Option<SocketAddr>,
    registration: RegistrationState,
    register_attempt: Option<RegisterAttempt>,
    register_seq: u32,
    registration_expires: Option<u32>,
    call_state: CallState,
    call: Option<ActiveCall>,
}

impl SessionActor {
    fn new(
        config: Config,
        transport: Box<dyn Transport>,
        inbound: mpsc::Receiver<InboundDatagram>,
        commands: mpsc::Receiver<Command>,
        events: broadcast::Sender<SessionEvent>,
        local_addr: SocketAddr,
    ) -> Self {
        let credentials = DigestCredentials::new(&config.sip.username, &config.sip.password);
        let tracker = TransactionTracker::new(config.engine.timers());
        Self {
            config,
            credentials,
            transport,
            inbound,
            commands,
            events,
            tracker,
            local_addr,
            contact_host: local_addr.ip().to_string(),
            contact_port: local_addr.port(),
            public_address_learned: false,
            remote: None,
            registration: RegistrationState::Unregistered,
            register_attempt: None,
            register_seq: 0,
            registration_expires: None,
            call_state: CallState::Idle,
            call: None,
        }
    }

    async fn run(mut self) {
        info!("Session engine running on {}", self.local_addr);

        loop {
            let deadline = self.tracker.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await.is_break() {
                            break;
                        }
                    }
                    None => {
                        debug!("All session handles dropped");
                        self.hard_stop().await;
                        break;
                    }
                },
                Some(datagram) = self.inbound.recv() => self.handle_datagram(datagram).await,
                _ = sleep_until(deadline) => self.handle_timers().await,
            }
        }

        info!("Session engine stopped");
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Register(reply) => {
                let result = self.register().await;
                let _ = reply.send(result);
            }
            Command::PlaceCall { destination, reply } => {
                let result = self.place_call(destination).await;
                let _ = reply.send(result);
            }
            Command::SendDigit { digit, reply } => {
                let result = self.send_digit(digit).await;
                let _ = reply.send(result);
            }
            Command::HangUp(reply) => {
                let result = self.hang_up().await;
                let _ = reply.send(result);
            }
            Command::TestConnection(reply) => {
                let result = self.test_connection().await;
                let _ = reply.send(result);
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Disconnect(reply) => {
                self.disconnect().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    // ----- addressing -----

    fn sent_by(&self) -> String {
        host_port(&self.contact_host, self.contact_port)
    }

    fn contact_uri(&self) -> String {
        format!(
            "sip:{}@{}",
            self.config.sip.username,
            host_port(&self.contact_host, self.contact_port)
        )
    }

    fn media_ip(&self) -> IpAddr {
        self.contact_host.parse().unwrap_or(self.local_addr.ip())
    }

    /// Resolve the trunk on first use and pick the address to advertise
    async fn ensure_remote(&mut self) -> Result<SocketAddr> {
        if let Some(remote) = self.remote {
            return Ok(remote);
        }

        let host = self.config.sip.host.clone();
        let port = self.config.sip.port;
        let candidates: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| SessionError::Transport(format!("cannot resolve {}: {}", host, e)))?
            .collect();
        let remote = candidates
            .iter()
            .find(|addr| addr.is_ipv4() == self.local_addr.is_ipv4())
            .or_else(|| candidates.first())
            .copied()
            .ok_or_else(|| SessionError::Transport(format!("{} has no addresses", host)))?;

        if self.local_addr.ip().is_unspecified() && !self.public_address_learned {
            match route_local_ip(remote).await {
                Ok(ip) => self.contact_host = ip.to_string(),
                Err(e) => warn!("Cannot determine local address towards {}: {}", remote, e),
            }
        }

        info!("Trunk {} resolved to {}, advertising {}", host, remote, self.sent_by());
        self.remote = Some(remote);
        Ok(remote)
    }

    /// Apply `received`/`rport` from the top Via of a response
    fn learn_public_address(&mut self, response: &SipResponse) {
        let mut received = None;
        let mut rport = None;
        for param in response.via_params() {
            match param {
                Param::Received(host) => {
                    received = Some(host.to_string()).filter(|h| !h.is_empty())
                }
                Param::Other(name, Some(value))
                    if name.to_string().eq_ignore_ascii_case("rport") =>
                {
                    rport = value.to_string().parse::<u16>().ok()
                }
                _ => {}
            }
        }

        let host = received.unwrap_or_else(|| self.contact_host.clone());
        let port = rport.unwrap_or(self.contact_port);
        if host != self.contact_host || port != self.contact_port {
            info!(
                "Trunk sees us at {}, updating Contact (was {})",
                host_port(&host, port),
                self.sent_by()
            );
            self.contact_host = host;
            self.contact_port = port;
            self.public_address_learned = true;
        }
    }

    // ----- sending -----

    async fn send_tracked(
        &mut self,
        request: SipRequest,
        destination: SocketAddr,
        pending: Pending,
    ) -> Result<()> {
        let (key, message) = self
            .tracker
            .start(&request, destination, pending, Instant::now())
            .ok_or_else(|| SessionError::Protocol("request lacks Call-ID or CSeq".to_string()))?;

        if let Err(e) = self.transport.send(message).await {
            warn!("Sending {} to {} failed: {}", key, destination, e);
            self.tracker.abandon(&key);
            return Err(e.into());
        }
        Ok(())
    }

    async fn send_untracked(&self, data: bytes::Bytes, destination: SocketAddr) {
        let message = OutgoingMessage { data, destination };
        if let Err(e) = self.transport.send(message).await {
            warn!("Sending to {} failed: {}", destination, e);
        }
    }

    async fn respond(&self, request: &SipRequest, response: SipResponse, source: SocketAddr) {
        debug!(
            "Answering {} from {} with {}",
            request.method(),
            source,
            response.status_code()
        );
        self.send_untracked(response.to_bytes(), source).await;
    }

    // ----- events and transitions -----

    fn emit(&self, kind: SessionEventKind) {
        // Nobody listening is not an error
        let _ = self.events.send(SessionEvent::new(kind));
    }

    fn set_registration(&mut self, next: RegistrationState, kind: SessionEventKind) {
        info!(
            "Registration {} -> {} ({})",
            self.registration,
            next,
            kind.event_type()
        );
        self.registration = next;
        self.emit(kind);
    }

    fn set_call_state(&mut self, next: CallState, kind: SessionEventKind) -> bool {
        if !self.call_state.can_transition_to(next) {
            warn!("Ignoring call transition {} -> {}", self.call_state, next);
            return false;
        }
        info!("Call {} -> {} ({})", self.call_state, next, kind.event_type());
        self.call_state = next;
        self.emit(kind);
        true
    }

    fn is_current_call(&self, call_id: &str) -> bool {
        self.call.as_ref().is_some_and(|c| c.call_id == call_id)
    }

    fn registration_failed(&mut self, reason: String) {
        warn!("Registration failed: {}", reason);
        self.register_attempt = None;
        self.registration_expires = None;
        self.set_registration(
            RegistrationState::Unregistered,
            SessionEventKind::RegistrationFailed { reason },
        );
    }

    fn fail_call(&mut self, reason: String) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        call.dialog = None;
        let kind = SessionEventKind::CallFailed {
            call_id: call.call_id.clone(),
            destination: call.destination.clone(),
            reason,
        };
        self.set_call_state(CallState::Failed, kind);
    }

    fn finish_call(&mut self, call_id: &str, initiator: CallInitiator) {
        if !matches!(self.call_state, CallState::Established | CallState::Terminating) {
            return;
        }
        let Some(call) = self.call.as_mut().filter(|c| c.call_id == call_id) else {
            return;
        };
        call.dialog = None;
        let kind = SessionEventKind::CallEnded {
            call_id: call.call_id.clone(),
            destination: call.destination.clone(),
            initiator,
        };
        self.set_call_state(CallState::Terminated, kind);
    }

    // ----- registration -----

    async fn register(&mut self) -> Result<()> {
        if self.registration == RegistrationState::Registering {
            debug!("REGISTER already in flight, joining it");
            return Ok(());
        }
        self.config.sip.validate()?;
        let remote = self.ensure_remote().await?;

        self.register_attempt = Some(RegisterAttempt {
            call_id: generate_call_id(&self.contact_host),
            from_tag: generate_tag(),
            auth_retried: false,
        });
        self.set_registration(RegistrationState::Registering, SessionEventKind::Registering);

        let authorization = self
            .credentials
            .empty_authorization(&self.config.sip.domain, &self.config.sip.registrar_uri());
        if let Err(e) = self.send_register(("Authorization", authorization), remote).await {
            self.registration_failed(format!("could not send REGISTER: {}", e));
            return Err(e);
        }
        Ok(())
    }

    async fn send_register(
        &mut self,
        (auth_header, auth_value): (&'static str, String),
        remote: SocketAddr,
    ) -> Result<()> {
        let Some(attempt) = self.register_attempt.as_ref() else {
            return Err(SessionError::Protocol("no registration in progress".to_string()));
        };
        let call_id = attempt.call_id.clone();
        let from_tag = attempt.from_tag.clone();

        self.register_seq += 1;
        let sip = &self.config.sip;
        let aor = sip.aor();
        let request = RequestBuilder::new(SipMethod::Register, sip.registrar_uri())
            .via(self.sent_by())
            .from(name_addr(None, &aor, Some(&from_tag)))
            .to(name_addr(None, &aor, None))
            .call_id(call_id.clone())
            .cseq(self.register_seq)
            .contact(self.contact_uri())
            .header(auth_header, auth_value)
            .header("Expires", sip.expires.to_string())
            .header("Allow", ALLOW)
            .header("User-Agent", sip.user_agent.clone())
            .build()?;

        info!("Sending REGISTER to {} (CSeq {})", remote, self.register_seq);
        self.send_tracked(request, remote, Pending::Register { call_id })
            .await
    }

    async fn on_register_response(&mut self, call_id: String, response: SipResponse) {
        let auth_retried = match self.register_attempt.as_ref() {
            Some(attempt) if attempt.call_id == call_id => attempt.auth_retried,
            _ => {
                debug!("Ignoring response to a stale REGISTER ({})", call_id);
                return;
            }
        };
        self.learn_public_address(&response);

        match response.status_code() {
            200..=299 => {
                let expires = granted_expires(&response, self.config.sip.expires);
                self.register_attempt = None;
                self.registration_expires = Some(expires);
                self.set_registration(
                    RegistrationState::Registered,
                    SessionEventKind::Connected { expires },
                );
            }
            401 | 407 if !auth_retried => {
                let challenge = match AuthChallenge::from_response(&response) {
                    Ok(challenge) => challenge,
                    Err(e) => {
                        self.registration_failed(format!("authentication setup failed: {}", e));
                        return;
                    }
                };
                if let Some(attempt) = self.register_attempt.as_mut() {
                    attempt.auth_retried = true;
                }
                let uri = self.config.sip.registrar_uri();
                let authorization = self.credentials.authorize(&challenge, "REGISTER", &uri);
                let Some(remote) = self.remote else {
                    self.registration_failed("trunk address unknown".to_string());
                    return;
                };
                debug!("REGISTER challenged ({}), retrying with credentials", response.status_code());
                if let Err(e) = self.send_register(authorization, remote).await {
                    self.registration_failed(format!("could not send REGISTER: {}", e));
                }
            }
            401 | 407 => {
                self.registration_failed(
                    "authentication failed: credentials rejected after retry".to_string(),
                );
            }
            403 => self.registration_failed(
                "forbidden - invalid credentials or account disabled".to_string(),
            ),
            404 => self.registration_failed("domain not found".to_string()),
            code => {
                let rejected = SessionError::Rejected {
                    code,
                    reason: response.reason(),
                };
                self.registration_failed(format!("registration rejected: {}", rejected))
            }
        }
    }

    // ----- calls -----

    async fn place_call(&mut self, destination: String) -> Result<CallHandle> {
        if self.registration != RegistrationState::Registered {
            return Err(SessionError::NotRegistered(self.registration));
        }
        if self.call_state.is_active() {
            return Err(SessionError::CallInProgress(self.call_state));
        }
        let destination = destination.trim().to_string();
        if destination.is_empty()
            || destination
                .chars()
                .any(|c| c.is_whitespace() || matches!(c, '<' | '>' | '"'))
        {
            return Err(SessionError::InvalidDestination(destination));
        }
        let remote = self.ensure_remote().await?;

        let call_id = generate_call_id(&self.contact_host);
        let local_tag = generate_tag();
        let invite = self.build_invite(&call_id, &local_tag, &destination, 1, None)?;

        self.call = Some(ActiveCall {
            call_id: call_id.clone(),
            destination: destination.clone(),
            local_tag,
            invite: invite.clone(),
            auth_retried: false,
            dialog: None,
            established_at: None,
        });
        self.set_call_state(
            CallState::Inviting,
            SessionEventKind::CallInitiated {
                call_id: call_id.clone(),
                destination: destination.clone(),
            },
        );

        info!("Sending INVITE for {} to {}", destination, remote);
        let pending = Pending::Invite {
            call_id: call_id.clone(),
        };
        if let Err(e) = self.send_tracked(invite, remote, pending).await {
            self.fail_call(format!("could not send INVITE: {}", e));
            return Err(e);
        }

        Ok(CallHandle {
            call_id,
            destination,
            state: self.call_state,
        })
    }

    fn build_invite(
        &self,
        call_id: &str,
        local_tag: &str,
        destination: &str,
        seq: u32,
        authorization: Option<(&'static str, String)>,
    ) -> Result<SipRequest> {
        let sip = &self.config.sip;
        let target = target_uri(destination, &sip.host);
        let sdp = SdpSession::create_audio_session(self.media_ip(), self.config.engine.rtp_port);

        let mut builder = RequestBuilder::new(SipMethod::Invite, target.clone())
            .via(self.sent_by())
            .from(name_addr(Some(&sip.caller_id), &sip.aor(), Some(local_tag)))
            .to(name_addr(None, &target, None))
            .call_id(call_id)
            .cseq(seq)
            .contact(self.contact_uri());
        if let Some((name, value)) = authorization {
            builder = builder.header(name, value);
        }
        Ok(builder
            .header("Allow", ALLOW)
            .header("User-Agent", sip.user_agent.clone())
            .body("application/sdp", sdp.to_string())
            .build()?)
    }

    fn on_invite_provisional(&mut self, call_id: String, response: &SipResponse) {
        if !self.is_current_call(&call_id) {
            return;
        }
        debug!("INVITE progress: {} {}", response.status_code(), response.reason());
        if self.call_state != CallState::Inviting {
            return;
        }
        if let Some(call) = self.call.as_ref() {
            let kind = SessionEventKind::CallRinging {
                call_id: call.call_id.clone(),
                destination: call.destination.clone(),
            };
            self.set_call_state(CallState::Ringing, kind);
        }
    }

    async fn on_invite_response(&mut self, call_id: String, response: SipResponse) {
        if !self.is_current_call(&call_id) {
            debug!("Ignoring final response for an old INVITE ({})", call_id);
            return;
        }

        if response.is_success() {
            self.on_invite_answered(response).await;
            return;
        }

        self.ack_non_2xx(&response).await;

        let auth_retried = self.call.as_ref().is_some_and(|c| c.auth_retried);
        match response.status_code() {
            401 | 407 if !auth_retried => self.retry_invite_with_auth(&response).await,
            401 | 407 => {
                self.fail_call("authentication failed: credentials rejected after retry".to_string())
            }
            code => {
                let rejected = SessionError::Rejected {
                    code,
                    reason: response.reason(),
                };
                self.fail_call(rejected.to_string())
            }
        }
    }

    async fn on_invite_answered(&mut self, response: SipResponse) {
        let Some(remote) = self.remote else {
            return;
        };
        let sent_by = self.sent_by();
        let contact = self.contact_uri();
        let Some(call) = self.call.as_ref() else {
            return;
        };

        let dialog = match Dialog::from_invite_response(&call.invite, &response) {
            Ok(dialog) => dialog,
            Err(e) => {
                warn!("Cannot create dialog from {}: {}", response.status_code(), e);
                self.fail_call(format!("invalid answer: {}", e));
                return;
            }
        };

        match dialog.ack().via(sent_by).contact(contact).build() {
            Ok(ack) => self.send_untracked(ack.to_bytes(), remote).await,
            Err(e) => warn!("Cannot build ACK: {}", e),
        }

        if let Some(sdp) = std::str::from_utf8(response.body())
            .ok()
            .and_then(SdpSession::parse)
        {
            if let Some(endpoint) = sdp.audio_endpoint() {
                debug!("Remote audio at {} ({:?})", endpoint, sdp.audio_codecs());
            }
        }

        if !matches!(self.call_state, CallState::Inviting | CallState::Ringing) {
            return;
        }
        let Some(call) = self.call.as_mut() else {
            return;
        };
        call.dialog = Some(dialog);
        call.established_at = Some(Instant::now());
        let kind = SessionEventKind::CallEstablished {
            call_id: call.call_id.clone(),
            destination: call.destination.clone(),
        };
        self.set_call_state(CallState::Established, kind);
    }

    /// ACK for a non-2xx final; part of the INVITE transaction, so it reuses
    /// the INVITE's Via branch
    async fn ack_non_2xx(&self, response: &SipResponse) {
        let (Some(call), Some(remote)) = (self.call.as_ref(), self.remote) else {
            return;
        };
        let invite = &call.invite;
        let (Some(via), Some(from), Some(to), Some((seq, _))) = (
            invite.header("Via"),
            invite.header("From"),
            response.header("To"),
            invite.cseq(),
        ) else {
            return;
        };

        let ack = RequestBuilder::new(SipMethod::Ack, invite.uri().to_string())
            .raw_via(via)
            .from(from)
            .to(to)
            .call_id(call.call_id.clone())
            .cseq(seq)
            .build();
        match ack {
            Ok(ack) => self.send_untracked(ack.to_bytes(), remote).await,
            Err(e) => warn!("Cannot build ACK: {}", e),
        }
    }

    /// ACK a 2xx that arrived outside its INVITE transaction. A retransmitted
    /// answer for the live dialog is re-ACKed. An answer for a call that has
    /// already failed or ended still sets up a dialog at the far end, so it is
    /// ACKed and then released with BYE.
    async fn reack(&mut self, response: &SipResponse) {
        let Some(remote) = self.remote else {
            return;
        };
        let sent_by = self.sent_by();
        let contact = self.contact_uri();
        let ringing = matches!(self.call_state, CallState::Inviting | CallState::Ringing);
        let Some(call) = self
            .call
            .as_mut()
            .filter(|c| response.call_id() == Some(c.call_id.as_str()))
        else {
            debug!("Discarding 2xx for unknown call {:?}", response.call_id());
            return;
        };

        if let Some(dialog) = call.dialog.as_ref() {
            debug!("Re-sending ACK for retransmitted 2xx");
            if let Ok(ack) = dialog.ack().via(sent_by).contact(contact).build() {
                self.send_untracked(ack.to_bytes(), remote).await;
            }
            return;
        }
        if ringing {
            debug!("Ignoring 2xx for a superseded INVITE on {}", call.call_id);
            return;
        }

        let mut dialog = match Dialog::from_invite_response(&call.invite, response) {
            Ok(dialog) => dialog,
            Err(e) => {
                warn!("Cannot release late answer on {}: {}", call.call_id, e);
                return;
            }
        };
        let ack = dialog.ack().via(sent_by.clone()).contact(contact.clone()).build();
        let bye = dialog
            .request(SipMethod::Bye)
            .via(sent_by)
            .contact(contact)
            .build();
        // Later retransmissions of this answer only need the ACK again
        call.dialog = Some(dialog);
        let call_id = call.call_id.clone();

        info!("Late answer on {} after the call was over, sending BYE", call_id);
        match ack {
            Ok(ack) => self.send_untracked(ack.to_bytes(), remote).await,
            Err(e) => warn!("Cannot build ACK: {}", e),
        }
        match bye {
            Ok(bye) => {
                if let Err(e) = self.send_tracked(bye, remote, Pending::Bye { call_id }).await {
                    warn!("Cannot release late answer: {}", e);
                }
            }
            Err(e) => warn!("Cannot build BYE: {}", e),
        }
    }

    async fn retry_invite_with_auth(&mut self, response: &SipResponse) {
        let challenge = match AuthChallenge::from_response(response) {
            Ok(challenge) => challenge,
            Err(e) => {
                self.fail_call(format!("authentication setup failed: {}", e));
                return;
            }
        };
        let (Some(call), Some(remote)) = (self.call.as_ref(), self.remote) else {
            return;
        };
        let seq = call.invite.cseq().map_or(1, |(seq, _)| seq) + 1;
        let authorization = self
            .credentials
            .authorize(&challenge, "INVITE", &call.invite.uri().to_string());
        let call_id = call.call_id.clone();
        let local_tag = call.local_tag.clone();
        let destination = call.destination.clone();

        let invite = match self.build_invite(&call_id, &local_tag, &destination, seq, Some(authorization)) {
            Ok(invite) => invite,
            Err(e) => {
                self.fail_call(format!("could not build INVITE: {}", e));
                return;
            }
        };
        if let Some(call) = self.call.as_mut() {
            call.invite = invite.clone();
            call.auth_retried = true;
        }

        debug!("INVITE challenged ({}), retrying with credentials", response.status_code());
        if let Err(e) = self
            .send_tracked(invite, remote, Pending::Invite { call_id })
            .await
        {
            self.fail_call(format!("could not send INVITE: {}", e));
        }
    }

    async fn send_digit(&mut self, digit: DtmfDigit) -> Result<()> {
        if self.call_state != CallState::Established {
            return Err(SessionError::NoEstablishedCall(self.call_state));
        }
        let remote = self
            .remote
            .ok_or(SessionError::NoEstablishedCall(self.call_state))?;
        let sent_by = self.sent_by();
        let contact = self.contact_uri();
        let relay = DtmfRelay::new(digit, self.config.engine.dtmf_duration());

        let Some(call) = self.call.as_mut() else {
            return Err(SessionError::NoEstablishedCall(self.call_state));
        };
        let call_id = call.call_id.clone();
        let Some(dialog) = call.dialog.as_mut() else {
            return Err(SessionError::NoEstablishedCall(self.call_state));
        };
        let request = dialog
            .request(SipMethod::Info)
            .via(sent_by)
            .contact(contact)
            .body(DTMF_RELAY_CONTENT_TYPE, relay.to_body())
            .build()?;

        info!("Sending DTMF {} on {}", digit, call_id);
        self.send_tracked(
            request,
            remote,
            Pending::Info {
                call_id: call_id.clone(),
                digit,
            },
        )
        .await?;
        self.emit(SessionEventKind::DigitSent {
            call_id,
            digit: digit.to_char(),
        });
        Ok(())
    }

    /// In-dialog BYE for the established call
    fn build_bye(&mut self) -> Option<(SipRequest, String, String)> {
        let sent_by = self.sent_by();
        let contact = self.contact_uri();
        let call = self.call.as_mut()?;
        let dialog = call.dialog.as_mut()?;
        let bye = dialog
            .request(SipMethod::Bye)
            .via(sent_by)
            .contact(contact)
            .build()
            .ok()?;
        Some((bye, call.call_id.clone(), call.destination.clone()))
    }

    async fn hang_up(&mut self) -> Result<()> {
        if self.call_state != CallState::Established {
            return Err(SessionError::NoEstablishedCall(self.call_state));
        }
        let remote = self
            .remote
            .ok_or(SessionError::NoEstablishedCall(self.call_state))?;
        let (bye, call_id, destination) = self
            .build_bye()
            .ok_or(SessionError::NoEstablishedCall(self.call_state))?;

        self.set_call_state(
            CallState::Terminating,
            SessionEventKind::CallTerminating {
                call_id: call_id.clone(),
                destination,
            },
        );

        info!("Sending BYE for {}", call_id);
        let pending = Pending::Bye {
            call_id: call_id.clone(),
        };
        if let Err(e) = self.send_tracked(bye, remote, pending).await {
            self.finish_call(&call_id, CallInitiator::Local);
            return Err(e);
        }
        Ok(())
    }

    // ----- connection test, status, shutdown -----

    async fn test_connection(&mut self) -> Result<()> {
        self.config.sip.validate()?;
        let remote = self.ensure_remote().await?;

        let sip = &self.config.sip;
        let request = RequestBuilder::new(SipMethod::Options, sip.registrar_uri())
            .via(self.sent_by())
            .from(name_addr(None, &sip.aor(), Some(&generate_tag())))
            .to(name_addr(None, &sip.registrar_uri(), None))
            .call_id(generate_call_id(&self.contact_host))
            .cseq(1)
            .contact(self.contact_uri())
            .header("Accept", "application/sdp")
            .header("User-Agent", sip.user_agent.clone())
            .build()?;

        info!("Sending OPTIONS to {}", remote);
        self.send_tracked(request, remote, Pending::Options).await
    }

    fn status(&self) -> SessionStatus {
        let call_duration = match self.call_state {
            CallState::Established | CallState::Terminating => self
                .call
                .as_ref()
                .and_then(|c| c.established_at)
                .map(|at| at.elapsed()),
            _ => None,
        };
        SessionStatus {
            registration: self.registration,
            call_state: self.call_state,
            call_id: self.call.as_ref().map(|c| c.call_id.clone()),
            destination: self.call.as_ref().map(|c| c.destination.clone()),
            call_duration,
            registration_expires: self
                .registration_expires
                .filter(|_| self.registration == RegistrationState::Registered),
            local_addr: self.local_addr,
            contact: self.contact_uri(),
        }
    }

    async fn disconnect(&mut self) {
        info!("Disconnecting session");
        match self.call_state {
            CallState::Established => {
                if let (Some((bye, call_id, _)), Some(remote)) = (self.build_bye(), self.remote) {
                    self.send_untracked(bye.to_bytes(), remote).await;
                    self.finish_call(&call_id, CallInitiator::Local);
                }
            }
            CallState::Terminating => {
                if let Some(call_id) = self.call.as_ref().map(|c| c.call_id.clone()) {
                    self.finish_call(&call_id, CallInitiator::Local);
                }
            }
            CallState::Inviting | CallState::Ringing => {
                self.fail_call("session disconnected".to_string());
            }
            _ => {}
        }

        self.hard_stop().await;
        self.registration = RegistrationState::Unregistered;
        self.register_attempt = None;
        self.registration_expires = None;
        self.emit(SessionEventKind::Disconnected);
    }

    /// Abandon timers and release the socket without sending anything
    async fn hard_stop(&mut self) {
        self.tracker.clear();
        if let Err(e) = self.transport.close().await {
            warn!("Closing transport failed: {}", e);
        }
    }

    // ----- inbound -----

    async fn handle_datagram(&mut self, datagram: InboundDatagram) {
        match SipMessage::parse(&datagram.data) {
            Ok(SipMessage::Response(response)) => self.handle_response(response).await,
            Ok(SipMessage::Request(request)) => self.handle_request(request, datagram.source).await,
            Err(e) => warn!("Dropping undecodable datagram from {}: {}", datagram.source, e),
        }
    }

    async fn handle_response(&mut self, response: SipResponse) {
        match self.tracker.on_response(&response) {
            ResponseMatch::Provisional { context, .. } => match context {
                Pending::Invite { call_id } => self.on_invite_provisional(call_id, &response),
                other => debug!("Provisional {} for {:?}", response.status_code(), other),
            },
            ResponseMatch::Final { context, .. } => self.on_final(context, response).await,
            ResponseMatch::Duplicate { key } => {
                if key.method == SipMethod::Invite && response.is_success() {
                    self.reack(&response).await;
                } else {
                    debug!("Ignoring duplicate {} for {}", response.status_code(), key);
                }
            }
            ResponseMatch::Unmatched => {
                let is_invite_2xx = response.is_success()
                    && response.cseq().is_some_and(|(_, m)| m == SipMethod::Invite);
                if is_invite_2xx {
                    self.reack(&response).await;
                } else {
                    debug!(
                        "Discarding unmatched {} (Call-ID {:?})",
                        response.status_code(),
                        response.call_id()
                    );
                }
            }
        }
    }

    async fn on_final(&mut self, context: Pending, response: SipResponse) {
        match context {
            Pending::Register { call_id } => self.on_register_response(call_id, response).await,
            Pending::Invite { call_id } => self.on_invite_response(call_id, response).await,
            Pending::Info { digit, .. } => {
                if response.is_success() {
                    debug!("DTMF {} acknowledged", digit);
                } else {
                    warn!(
                        "DTMF {} rejected: {} {}",
                        digit,
                        response.status_code(),
                        response.reason()
                    );
                }
            }
            Pending::Bye { call_id } => {
                if !response.is_success() {
                    warn!(
                        "BYE answered with {} {}, ending call anyway",
                        response.status_code(),
                        response.reason()
                    );
                }
                self.finish_call(&call_id, CallInitiator::Local);
            }
            Pending::Options => {
                info!("OPTIONS answered with {}", response.status_code());
                self.emit(SessionEventKind::ConnectionTested {
                    reachable: true,
                    status: Some(response.status_code()),
                });
            }
        }
    }

    async fn handle_timers(&mut self) {
        for outcome in self.tracker.poll(Instant::now()) {
            match outcome {
                TimerOutcome::Retransmit { key, message } => {
                    if let Err(e) = self.transport.send(message).await {
                        warn!("Retransmission of {} failed: {}", key, e);
                        if let Some(context) = self.tracker.abandon(&key) {
                            self.on_transaction_failed(context, Some(e.into()));
                        }
                    }
                }
                TimerOutcome::TimedOut { context, .. } => {
                    self.on_transaction_failed(context, None);
                }
            }
        }
    }

    /// A transaction ended without a final response; `send_error` is set when
    /// a retransmission could not be sent, otherwise the timer ran out
    fn on_transaction_failed(&mut self, context: Pending, send_error: Option<SessionError>) {
        let failure = |detail: &str| {
            send_error
                .clone()
                .unwrap_or_else(|| SessionError::Timeout(detail.to_string()))
        };
        match context {
            Pending::Register { call_id } => {
                if self
                    .register_attempt
                    .as_ref()
                    .is_some_and(|a| a.call_id == call_id)
                {
                    let error = failure("no response from registrar");
                    self.registration_failed(error.to_string());
                }
            }
            Pending::Invite { call_id } => {
                if self.is_current_call(&call_id)
                    && matches!(self.call_state, CallState::Inviting | CallState::Ringing)
                {
                    let error = failure("no final response to INVITE");
                    self.fail_call(error.to_string());
                }
            }
            Pending::Info { digit, .. } => {
                warn!("DTMF {} not acknowledged: {}", digit, failure("no answer to INFO"))
            }
            Pending::Bye { call_id } => {
                warn!("BYE not acknowledged ({}), ending call", failure("no answer to BYE"));
                self.finish_call(&call_id, CallInitiator::Local);
            }
            Pending::Options => self.emit(SessionEventKind::ConnectionTested {
                reachable: false,
                status: None,
            }),
        }
    }

    async fn handle_request(&mut self, request: SipRequest, source: SocketAddr) {
        debug!("Received {} from {}", request.method(), source);

        let in_dialog = self
            .call
            .as_ref()
            .and_then(|c| c.dialog.as_ref())
            .is_some_and(|d| d.matches_request(&request));

        match request.method() {
            SipMethod::Ack => {}
            SipMethod::Bye if in_dialog => {
                self.respond(&request, ResponseBuilder::ok().build_for_request(&request), source)
                    .await;
                if let Some(call_id) = request.call_id() {
                    info!("Remote party ended call {}", call_id);
                    self.finish_call(call_id, CallInitiator::Remote);
                }
            }
            SipMethod::Info if in_dialog => {
                match DtmfRelay::parse(request.body_str()) {
                    Some(relay) => info!("Remote sent DTMF {}", relay.digit),
                    None => debug!("INFO without a DTMF payload"),
                }
                self.respond(&request, ResponseBuilder::ok().build_for_request(&request), source)
                    .await;
            }
            SipMethod::Bye | SipMethod::Info => {
                let response = ResponseBuilder::new(481).build_for_request(&request);
                self.respond(&request, response, source).await;
            }
            SipMethod::Options => {
                let response = ResponseBuilder::ok()
                    .to_tag(generate_tag())
                    .header("Allow", ALLOW)
                    .header("Accept", "application/sdp")
                    .build_for_request(&request);
                self.respond(&request, response, source).await;
            }
            SipMethod::Invite => {
                let (code, tag) = if in_dialog {
                    (488, None)
                } else {
                    (603, Some(generate_tag()))
                };
                info!("Declining inbound INVITE from {} with {}", source, code);
                let mut builder = ResponseBuilder::new(code);
                if let Some(tag) = tag {
                    builder = builder.to_tag(tag);
                }
                self.respond(&request, builder.build_for_request(&request), source)
                    .await;
            }
            _ => {
                let response = ResponseBuilder::new(501)
                    .header("Allow", ALLOW)
                    .build_for_request(&request);
                self.respond(&request, response, source).await;
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Request-URI for a dialed number; full SIP URIs pass through
fn target_uri(destination: &str, host: &str) -> String {
    if destination.starts_with("sip:") || destination.starts_with("sips:") {
        destination.to_string()
    } else {
        format!("sip:{}@{}", destination, host)
    }
}

/// Expiry granted by the registrar: Contact `expires` param, then the
/// Expires header, then what was asked for
fn granted_expires(response: &SipResponse, requested: u32) -> u32 {
    let contact_expires = response.headers().iter().find_map(|header| match header {
        Header::Contact(contact) => contact.expires().ok().flatten()?.seconds().ok(),
        _ => None,
    });
    let header_expires = || {
        response.headers().iter().find_map(|header| match header {
            Header::Expires(expires) => expires.seconds().ok(),
            _ => None,
        })
    };
    contact_expires.or_else(header_expires).unwrap_or(requested)
}
