//! Connecting to WhatsApp Web via the websocket protocol.
//!
//! The supervisor owns the socket for its whole lifecycle: dialing, the
//! session handshake, the encrypted message pump, keep-alive probing and
//! (optionally) redialing after an unexpected disconnect.

use tokio_tungstenite as ws;
use ws::MaybeTlsStream;
use ws::tungstenite::Message;
use tokio::net::TcpStream;
use json::JsonValue;
use qrcode::QrCode;
use chrono::NaiveDateTime;
use std::collections::VecDeque;
use core::task::{Context, Poll};
use futures::{Sink, Future, FutureExt, Stream, StreamExt};
use tokio::time::{Interval, Delay};
use std::time::{Duration, Instant};
use std::pin::Pin;

use crate::req::WaRequest;
use crate::session::{SessionState, SessionPhase, PersistentSession, UserMetaData};
use crate::websocket_protocol::{self, Inbound, Frame, FramePayload};
use crate::json_protocol::{self, ServerMessage};
use crate::registry::{CallbackRegistry, Dispatch, HandlerPath};
use crate::decoder::BinaryDecoder;
use crate::event::WaEvent;
use crate::errors::*;
use crate::{crypto, Chat, Contact};

/// WhatsApp Web WebSocket endpoint URL.
const ENDPOINT_URL: &str = "wss://web.whatsapp.com/ws";
/// WhatsApp Web WebSocket origin header value.
const ORIGIN_URL: &str = "https://web.whatsapp.com";

/// Cadence of the keep-alive ticker.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(20);
/// How stale `last_seen` may grow before the link counts as lost.
const KEEP_ALIVE_STALE: Duration = Duration::from_secs(25);
/// Deadline for the reply to `init`.
const INIT_TIMEOUT: Duration = Duration::from_secs(20);
/// Per-attempt budget when redialing after a lost connection.
const RECONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(25);
/// Ceiling for the reconnect backoff.
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(60);

type WsClient = ws::WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectFuture = Pin<Box<dyn Future<Output = WaResult<WsClient>> + Send>>;

fn dial() -> ConnectFuture {
    let req = http::Request::builder()
        .uri(ENDPOINT_URL)
        .header("Origin", ORIGIN_URL)
        .body(()).expect("invalid ENDPOINT_URL or ORIGIN_URL");

    Box::pin(tokio_tungstenite::connect_async(req)
        .map(|r| r
            .map(|(ws, _response)| ws)
            .map_err(WaError::from)
        ))
}

fn reconnect_backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    RECONNECT_BACKOFF_CAP.min(Duration::from_secs(1u64 << exp))
}

enum Transport {
    /// The websocket upgrade is in flight.
    Connecting(ConnectFuture),
    Open(WsClient),
    /// Waiting out the backoff before the next dial.
    Backoff(Delay, u32),
    Down,
}

#[derive(Clone, Debug)]
pub(crate) enum CallbackType {
    /// Advance the handshake state machine with this payload.
    HandshakeReply,
    /// Surface the payload (or a timeout) as a `Reply` event.
    Reply,
    /// The initial chat list.
    InitialChats,
    /// The initial contact list.
    InitialContacts,
    /// One of the `add:*` chat update batches of the initial load.
    ChatUpdate(ChatUpdateKind),
    /// Don't do anything.
    Noop
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum ChatUpdateKind {
    Last,
    Before,
    Unread
}

/// Progress of the post-validation data load.
struct InitialLoad {
    contacts_done: bool,
    saw_last_update: bool,
    /// How many more backlog messages the chat counters entitle us to forward.
    unread_budget: u32,
}

/// A connection to WhatsApp Web.
///
/// ## Connecting
///
/// When first connecting, use the `WebConnection::connect_new()` method,
/// and scan the QR code that appears through the `ScanCode` event.
/// This establishes a persistent session (`SessionEstablished` event),
/// which you can reuse for future connections via the
/// `WebConnection::connect_persistent()` method to avoid scanning the
/// code again. The [`connect`] and [`connect_slim`] helpers drive either
/// flavour to completion.
///
/// ## Usage
///
/// This `struct` implements `Stream` and `Sink` from the `futures` crate.
/// In order to use it, you read `WaEvent`s from the stream, and send
/// `WaRequest`s into the sink to get stuff done. Read the documentation
/// on those two `enum`s to get a better idea of how it works.
///
/// You **must** actively call `poll()` and `poll_complete()` on the stream
/// and sink; it won't work at all if you don't.
pub struct WebConnection {
    transport: Transport,
    state: SessionState,
    phase: SessionPhase,
    registry: CallbackRegistry<CallbackType>,
    decoder: Box<dyn BinaryDecoder>,
    tag_counter: u32,
    ping_timer: Interval,
    /// Armed to the registry's earliest await deadline.
    response_timer: Option<Delay>,
    /// Overall budget for one reconnect attempt.
    attempt_timer: Option<Delay>,
    last_seen: Instant,
    server_time: Option<NaiveDateTime>,
    ws_outbox: VecDeque<Message>,
    outbox: VecDeque<WaEvent>,
    user: Option<UserMetaData>,
    auto_reconnect: bool,
    reconnect_attempt: Option<u32>,
    initial_load: Option<InitialLoad>,
}
impl std::marker::Unpin for WebConnection {}

impl Stream for WebConnection {
    type Item = WaResult<WaEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<WaResult<WaEvent>>> {
        let this = self.get_mut();
        loop {
            if let Err(e) = this.drive(cx) {
                match this.handle_fatal(e) {
                    // a reconnect got scheduled; drive again so its timer is armed
                    Ok(()) => continue,
                    Err(e) => return Poll::Ready(Some(Err(e))),
                }
            }
            return match this.outbox.pop_front() {
                Some(evt) => Poll::Ready(Some(Ok(evt))),
                None => Poll::Pending,
            };
        }
    }
}

impl Sink<WaRequest> for WebConnection {
    type Error = WaError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<WaResult<()>> {
        match self.transport {
            Transport::Open(ref mut ws) => match Pin::new(ws).poll_ready(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(r) => Poll::Ready(r.map_err(WaError::from)),
            },
            _ => Poll::Ready(Ok(())),
        }
    }

    fn start_send(self: Pin<&mut Self>, item: WaRequest) -> WaResult<()> {
        item.apply(self)?;
        Ok(())
    }
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<WaResult<()>> {
        let this = self.get_mut();
        match this.flush_outbox(cx) {
            Err(e) => Poll::Ready(Err(e)),
            Ok(true) => Poll::Ready(Ok(())),
            Ok(false) => Poll::Pending,
        }
    }
    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<WaResult<()>> {
        match self.transport {
            Transport::Open(ref mut ws) => match Pin::new(ws).poll_close(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(r) => Poll::Ready(r.map_err(WaError::from)),
            },
            _ => Poll::Ready(Ok(())),
        }
    }
}

// *** NOTE **********************************************
// * The following `impl` blocks are actually organized
// * by function. If you're changing or adding a function,
// * check it's in vaguely the right one!
// *******************************************************

impl WebConnection {
    // This `impl` block: connecting and instantiating
    fn assemble(state: SessionState, transport: Transport, decoder: Box<dyn BinaryDecoder>) -> Self {
        let phase = match transport {
            Transport::Connecting(_) => SessionPhase::Opening,
            _ => SessionPhase::Disconnected,
        };
        Self {
            transport,
            state,
            phase,
            registry: CallbackRegistry::new(),
            decoder,
            tag_counter: 0,
            ping_timer: tokio::time::interval(KEEP_ALIVE_INTERVAL),
            response_timer: None,
            attempt_timer: None,
            last_seen: Instant::now(),
            server_time: None,
            ws_outbox: VecDeque::new(),
            outbox: VecDeque::new(),
            user: None,
            auto_reconnect: false,
            reconnect_attempt: None,
            initial_load: None,
        }
    }
    /// Connect to WhatsApp Web, starting a new session.
    pub fn connect_new(decoder: Box<dyn BinaryDecoder>) -> Result<Self> {
        Ok(Self::assemble(SessionState::pending_new()?, Transport::Connecting(dial()), decoder))
    }
    /// Connect to WhatsApp Web, reusing an old persistent session.
    pub fn connect_persistent(sess: PersistentSession, decoder: Box<dyn BinaryDecoder>) -> Self {
        Self::assemble(SessionState::pending_persistent(sess), Transport::Connecting(dial()), decoder)
    }
    /// Redial and renegotiate automatically when an established connection
    /// is lost. Only restorable sessions can do this.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }
    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }
    /// The logged-in account, known once the session is validated.
    pub fn user(&self) -> Option<&UserMetaData> {
        self.user.as_ref()
    }
    /// Credentials for logging in again without a QR scan, if the server
    /// issued any.
    pub fn persistent_session(&self) -> Option<&PersistentSession> {
        self.state.persistent()
    }
    /// The server clock as of the last heartbeat.
    pub fn server_time(&self) -> Option<NaiveDateTime> {
        self.server_time
    }
}
impl WebConnection {
    // This `impl` block: low-level protocol functions, like sending
    // and receiving different message types
    fn alloc_message_tag(&mut self) -> String {
        let tag = self.tag_counter;
        self.tag_counter += 1;
        format!("{}.--{}", chrono::Utc::now().timestamp_millis(), tag)
    }
    pub(crate) fn send_json_message(&mut self, tag: Option<String>, message: JsonValue,
                                    ct: CallbackType, deadline: Option<Instant>) {
        let tag = tag.unwrap_or_else(|| self.alloc_message_tag());
        debug!("--> JSON (tag {}): {}", tag, message);
        self.registry.expect(tag.clone(), deadline, ct);
        self.arm_response_timer();
        self.ws_outbox.push_back(websocket_protocol::serialize_json_frame(&tag, &message));
    }
    pub(crate) fn send_binary_message(&mut self, tag: Option<String>, message: &[u8],
                                      ct: CallbackType, deadline: Option<Instant>) -> Result<()> {
        let sealed = if let SessionState::Established { persistent_session: Some(ref ps), .. } = self.state {
            crypto::sign_and_encrypt_message(&ps.enc, &ps.mac, message)?
        } else {
            return Err(WaError::InvalidSessionState);
        };

        let tag = tag.unwrap_or_else(|| self.alloc_message_tag());
        debug!("--> binary (tag {}): {} plaintext bytes", tag, message.len());
        self.registry.expect(tag.clone(), deadline, ct);
        self.arm_response_timer();
        self.ws_outbox.push_back(websocket_protocol::serialize_binary_frame(&tag, &sealed));
        Ok(())
    }
    pub(crate) fn send_ping(&mut self) {
        self.ws_outbox.push_front(Message::Text("?,,".into()));
    }
    fn decrypt_binary_message(&mut self, encrypted_message: &[u8]) -> Result<Vec<u8>> {
        trace!("Decrypting binary message: {:?}", encrypted_message);
        if let SessionState::Established { persistent_session: Some(ref ps), .. } = self.state {
            crypto::verify_and_decrypt_message(&ps.enc, &ps.mac, encrypted_message)
        } else {
            Err(WaError::InvalidSessionState)
        }
    }
    fn arm_response_timer(&mut self) {
        self.response_timer = self.registry.next_deadline()
            .map(|d| tokio::time::delay_until(tokio::time::Instant::from_std(d)));
    }
}
impl WebConnection {
    // This `impl` block: the session handshake state machine
    fn on_transport_open(&mut self) -> Result<()> {
        self.outbox.push_back(WaEvent::WebsocketConnected);
        self.last_seen = Instant::now();
        let client_id = crypto::client_id_to_string(&self.state.client_id());
        let init_command = json_protocol::build_init_request(&client_id);
        self.phase = SessionPhase::AwaitingInit;
        self.send_json_message(None, init_command, CallbackType::HandshakeReply,
                               Some(Instant::now() + INIT_TIMEOUT));
        Ok(())
    }
    fn on_handshake_reply(&mut self, payload: JsonValue) -> Result<()> {
        match self.phase {
            SessionPhase::AwaitingInit => self.on_init_reply(payload),
            SessionPhase::AwaitingQRScan { .. } |
            SessionPhase::AwaitingLoginAck => self.on_first_login_frame(payload),
            SessionPhase::AwaitingChallengeAck => self.on_challenge_ack(payload),
            SessionPhase::AwaitingValidation => self.on_validation_frame(payload),
            // a stray late ack (e.g. the challenge ack racing the validation
            // frame): swallow if it's happy, surface if not
            SessionPhase::Live { .. } => json_protocol::expect_status_ok(&payload).map(|_| ()),
            _ => Err(WaError::InvalidSessionState),
        }
    }
    fn on_init_reply(&mut self, payload: JsonValue) -> Result<()> {
        match self.state {
            SessionState::PendingNew { ref public_key, ref client_id, .. } => {
                let qr_ref = json_protocol::parse_init_response(&payload)?;
                let qr_payload = format!("{},{},{}",
                                         qr_ref,
                                         base64::encode(public_key),
                                         crypto::client_id_to_string(client_id));
                let our_public = public_key.clone();

                let code = QrCode::new(&qr_payload)?;
                self.outbox.push_back(WaEvent::ScanCode { code, payload: qr_payload });
                self.phase = SessionPhase::AwaitingQRScan { qr_ref, our_public };
                // the validation frame arrives on s1 once the phone scans;
                // no deadline, since that can take as long as the user does
                self.registry.expect("s1".to_string(), None, CallbackType::HandshakeReply);
                self.arm_response_timer();
                Ok(())
            }
            SessionState::PendingPersistent { ref persistent_session } => {
                json_protocol::expect_status_ok(&payload)?;
                let login_command = json_protocol::build_takeover_request(
                    &persistent_session.client_token,
                    &persistent_session.server_token,
                    &crypto::client_id_to_string(&persistent_session.client_id));
                self.phase = SessionPhase::AwaitingLoginAck;
                self.send_json_message(Some("s1".to_string()), login_command,
                                       CallbackType::HandshakeReply, None);
                Ok(())
            }
            SessionState::Established { .. } => Err(WaError::InvalidSessionState),
        }
    }
    /// The first frame after the branch point: either a status reply, a
    /// challenge, or the validation frame itself.
    fn on_first_login_frame(&mut self, payload: JsonValue) -> Result<()> {
        if json_protocol::response_status(&payload).is_some() {
            json_protocol::expect_status_ok(&payload)?;
            // a bare 2xx ack; keep waiting for the real thing on the same tag
            self.registry.expect("s1".to_string(), None, CallbackType::HandshakeReply);
            return Ok(());
        }
        if let Some(challenge) = json_protocol::parse_challenge(&payload)? {
            return self.on_server_challenge(&challenge);
        }
        self.on_validation_frame(payload)
    }
    fn on_server_challenge(&mut self, challenge: &[u8]) -> Result<()> {
        trace!("Got server challenge: {:?}", challenge);
        debug!("Handling server challenge");
        let response = {
            let persist = self.state.persistent().ok_or(WaError::InvalidSessionState)?;
            let signature = crypto::sign_challenge(&persist.mac, challenge);
            json_protocol::build_challenge_response(
                signature.as_ref(),
                &persist.server_token,
                &crypto::client_id_to_string(&persist.client_id))
        };
        self.phase = SessionPhase::AwaitingChallengeAck;
        self.send_json_message(None, response, CallbackType::HandshakeReply, None);
        // the validation frame lands on s2 regardless of how the ack races it
        self.registry.expect("s2".to_string(), None, CallbackType::HandshakeReply);
        Ok(())
    }
    fn on_challenge_ack(&mut self, payload: JsonValue) -> Result<()> {
        if json_protocol::response_status(&payload).is_some() {
            json_protocol::expect_status_ok(&payload)?;
            self.phase = SessionPhase::AwaitingValidation;
            Ok(())
        } else {
            // s2 beat the challenge ack to us
            self.on_validation_frame(payload)
        }
    }
    fn on_validation_frame(&mut self, payload: JsonValue) -> Result<()> {
        self.on_connection_ack(payload[1].clone())
    }
    fn on_connection_ack(&mut self, v: JsonValue) -> Result<()> {
        debug!("Handling connection ack");
        let info = json_protocol::parse_validation(&v)?;
        let (new_state, persistent) = match self.state {
            SessionState::PendingNew { ref mut private_key, ref client_id, .. } => {
                let client_id = *client_id;
                match info.secret {
                    Some(ref secret) => {
                        let secret = base64::decode(secret)?;
                        let private_key = private_key.take().ok_or(WaError::InvalidSessionState)?;
                        let (enc, mac) = crypto::calculate_secret_keys(&secret, private_key)?;

                        let persistent_session = PersistentSession {
                            client_token: info.client_token.clone()
                                .ok_or(WaError::JsonFieldMissing("clientToken"))?,
                            server_token: info.server_token.clone()
                                .ok_or(WaError::JsonFieldMissing("serverToken"))?,
                            client_id,
                            enc,
                            mac
                        };
                        (SessionState::Established {
                            client_id,
                            persistent_session: Some(persistent_session.clone())
                        }, Some(persistent_session))
                    }
                    None => {
                        // the server validated us without issuing key material;
                        // nothing to persist and nothing to encrypt with
                        (SessionState::Established { client_id, persistent_session: None }, None)
                    }
                }
            }
            SessionState::PendingPersistent { ref persistent_session } => {
                let mut new_persistent_session = persistent_session.clone();
                if let Some(ref client_token) = info.client_token {
                    new_persistent_session.client_token = client_token.clone();
                }
                if let Some(ref server_token) = info.server_token {
                    new_persistent_session.server_token = server_token.clone();
                }
                (SessionState::Established {
                    client_id: new_persistent_session.client_id,
                    persistent_session: Some(new_persistent_session.clone())
                }, Some(new_persistent_session))
            }
            SessionState::Established { .. } => return Err(WaError::InvalidSessionState),
        };
        self.state = new_state;

        let user = UserMetaData {
            jid: info.jid,
            name: info.pushname,
            phone: info.phone,
        };
        self.user = Some(user.clone());
        self.phase = SessionPhase::Live { since: Instant::now() };
        self.last_seen = Instant::now();
        self.reconnect_attempt = None;
        self.attempt_timer = None;
        self.outbox.push_back(WaEvent::SessionEstablished { persistent, user });
        self.begin_initial_load();
        Ok(())
    }
}
impl WebConnection {
    // This `impl` block: the post-validation data load
    fn begin_initial_load(&mut self) {
        self.registry.register(HandlerPath::function("action").attr("add", "last"),
                               CallbackType::ChatUpdate(ChatUpdateKind::Last), true);
        self.registry.register(HandlerPath::function("action").attr("add", "before"),
                               CallbackType::ChatUpdate(ChatUpdateKind::Before), true);
        self.registry.register(HandlerPath::function("action").attr("add", "unread"),
                               CallbackType::ChatUpdate(ChatUpdateKind::Unread), true);
        self.registry.register(HandlerPath::function("response").attr("type", "chat"),
                               CallbackType::InitialChats, false);
        self.registry.register(HandlerPath::function("response").attr("type", "contacts"),
                               CallbackType::InitialContacts, false);
        self.initial_load = Some(InitialLoad {
            contacts_done: false,
            saw_last_update: false,
            unread_budget: 0,
        });
    }
    fn on_initial_chats(&mut self, payload: JsonValue) -> Result<()> {
        let chats = json_protocol::parse_chat_list(&payload);
        if let Some(ref mut load) = self.initial_load {
            load.unread_budget = chats.iter().map(|c| c.unread).sum();
        }
        self.outbox.push_back(WaEvent::InitialChats(chats));
        self.check_initial_load_done();
        Ok(())
    }
    fn on_initial_contacts(&mut self, payload: JsonValue) -> Result<()> {
        let contacts = json_protocol::parse_contact_list(&payload);
        if let Some(ref mut load) = self.initial_load {
            load.contacts_done = true;
        }
        self.outbox.push_back(WaEvent::InitialContacts(contacts));
        self.check_initial_load_done();
        Ok(())
    }
    fn on_chat_update(&mut self, kind: ChatUpdateKind, payload: JsonValue) -> Result<()> {
        let mut forwarded = Vec::new();
        if let Some(ref mut load) = self.initial_load {
            if kind == ChatUpdateKind::Last {
                load.saw_last_update = true;
            }
            for child in payload[2].members() {
                if load.unread_budget == 0 {
                    break;
                }
                load.unread_budget -= 1;
                forwarded.push(child.clone());
            }
        }
        for message in forwarded {
            self.outbox.push_back(WaEvent::UnreadMessage(message));
        }
        self.check_initial_load_done();
        Ok(())
    }
    fn check_initial_load_done(&mut self) {
        let done = self.initial_load.as_ref()
            .map(|l| l.contacts_done && l.saw_last_update)
            .unwrap_or(false);
        if done {
            self.initial_load = None;
            for kind in &["last", "before", "unread"] {
                self.registry.deregister(&HandlerPath::function("action").attr("add", kind));
            }
            self.outbox.push_back(WaEvent::InitialLoadComplete);
        }
    }
}
impl WebConnection {
    // This `impl` block: functions that get called to deal
    // with different messages coming down the wire
    fn run_callback(&mut self, tag: &str, payload: JsonValue, ct: CallbackType) -> Result<()> {
        match ct {
            CallbackType::HandshakeReply => self.on_handshake_reply(payload),
            CallbackType::Reply => {
                self.outbox.push_back(WaEvent::Reply {
                    tag: tag.to_string(),
                    result: Ok(payload)
                });
                Ok(())
            }
            CallbackType::InitialChats => self.on_initial_chats(payload),
            CallbackType::InitialContacts => self.on_initial_contacts(payload),
            CallbackType::ChatUpdate(kind) => self.on_chat_update(kind, payload),
            CallbackType::Noop => Ok(()),
        }
    }
    fn dispatch_frame(&mut self, tag: &str, payload: JsonValue) -> Result<()> {
        match self.registry.dispatch(tag, &payload) {
            Dispatch::Tag(ct) => {
                debug!("<-- reply (tag {} -> {:?}): {}", tag, ct, payload);
                self.arm_response_timer();
                self.run_callback(tag, payload, ct)
            }
            Dispatch::Handler(ct) => {
                debug!("<-- notification (tag {} -> {:?}): {}", tag, ct, payload);
                self.run_callback(tag, payload, ct)
            }
            Dispatch::Unhandled => {
                match ServerMessage::deserialize(&payload)? {
                    Some(message) => self.on_server_message(message),
                    None => {
                        debug!("<-- unhandled (tag {}): {}", tag, payload);
                        self.outbox.push_back(WaEvent::Unhandled {
                            tag: tag.to_string(),
                            payload
                        });
                        Ok(())
                    }
                }
            }
        }
    }
    fn on_server_message(&mut self, message: ServerMessage) -> Result<()> {
        match message {
            ServerMessage::ConnectionAck(v) => {
                if self.phase.is_live() {
                    debug!("Ignoring repeated connection ack");
                    Ok(())
                } else {
                    self.on_connection_ack(v)
                }
            }
            ServerMessage::ChallengeRequest(challenge) => self.on_server_challenge(&challenge),
            ServerMessage::Disconnect(kind) => {
                warn!("Received disconnection message from server");
                let reason = if kind.is_some() {
                    DisconnectReason::Replaced
                } else {
                    DisconnectReason::Removed
                };
                Err(WaError::Disconnected(reason))
            }
        }
    }
    fn on_message(&mut self, m: Message) -> Result<()> {
        trace!("<-- {:?}", m);
        let inbound = match Inbound::deserialize(&m) {
            Some(i) => i,
            None => {
                error!("Failed to deserialize websocket message!");
                warn!("Message contents: {:?}", m);
                return Ok(());
            }
        };
        match inbound {
            Inbound::Heartbeat(timestamp) => {
                debug!("<-- heartbeat ({})", timestamp);
                self.last_seen = Instant::now();
                self.server_time = NaiveDateTime::from_timestamp_opt(
                    timestamp.div_euclid(1000),
                    (timestamp.rem_euclid(1000) * 1_000_000) as u32);
                Ok(())
            }
            Inbound::Frame(Frame { tag, payload }) => {
                let tag = tag.into_owned();
                match payload {
                    FramePayload::Json(p) => self.dispatch_frame(&tag, p),
                    FramePayload::Binary(body) => {
                        let plaintext = match self.decrypt_binary_message(body) {
                            Ok(p) => p,
                            Err(e) => {
                                // opaque or versioned-past-us frames are not fatal
                                error!("Failed to decrypt binary message payload: {}", e);
                                debug!("Payload: {:?}", body);
                                return Ok(());
                            }
                        };
                        let decoded = match self.decoder.decode(&plaintext) {
                            Ok(p) => p,
                            Err(e) => {
                                error!("Failed to decode node: {}", e);
                                warn!("Payload: {:?}", plaintext);
                                return Ok(());
                            }
                        };
                        self.dispatch_frame(&tag, decoded)
                    }
                    FramePayload::Empty => {
                        debug!("<-- empty (tag {})", tag);
                        Ok(())
                    }
                }
            }
        }
    }
}
impl WebConnection {
    // This `impl` block: timers, teardown and the reconnect loop
    fn on_ping_timer(&mut self) -> Result<()> {
        if !self.phase.is_live() {
            return Ok(());
        }
        if self.last_seen.elapsed() > KEEP_ALIVE_STALE {
            warn!("No life sign for {:?}, treating the link as lost", self.last_seen.elapsed());
            return Err(WaError::TransportClosed("lost connection"));
        }
        self.send_ping();
        Ok(())
    }
    fn on_response_timer(&mut self) -> Result<()> {
        let expired = self.registry.sweep_expired(Instant::now());
        self.arm_response_timer();
        for (tag, ct) in expired {
            match ct {
                CallbackType::Reply => {
                    self.outbox.push_back(WaEvent::Reply {
                        tag,
                        result: Err(WaError::Timeout)
                    });
                }
                CallbackType::Noop => {}
                // an overdue handshake reply sinks the whole connect
                _ => return Err(WaError::Timeout),
            }
        }
        Ok(())
    }
    fn teardown(&mut self) {
        self.transport = Transport::Down;
        self.ws_outbox.clear();
        self.response_timer = None;
        self.attempt_timer = None;
        self.initial_load = None;
        for (tag, ct) in self.registry.drain() {
            if let CallbackType::Reply = ct {
                self.outbox.push_back(WaEvent::Reply {
                    tag,
                    result: Err(WaError::Cancelled)
                });
            }
        }
    }
    /// Decides between redialing and surfacing after any fatal error.
    /// `Ok(())` means a reconnect was scheduled.
    fn handle_fatal(&mut self, e: WaError) -> Result<()> {
        let lost_live_link = self.phase.is_live() && match e {
            WaError::TransportClosed(_) | WaError::Websocket(_) | WaError::Io(_) => true,
            _ => false,
        };
        // once the loop is running, every failure re-enters it
        let retry = self.auto_reconnect && self.state.is_restorable()
            && (self.reconnect_attempt.is_some() || lost_live_link);

        self.teardown();
        if !retry {
            self.phase = SessionPhase::Disconnected;
            return Err(e);
        }

        let attempt = self.reconnect_attempt.map(|a| a + 1).unwrap_or(1);
        let persistent_session = match self.state.persistent() {
            Some(ps) => ps.clone(),
            None => {
                self.phase = SessionPhase::Disconnected;
                return Err(e);
            }
        };
        warn!("Connection lost ({}), reconnecting (attempt {})", e, attempt);
        self.state = SessionState::pending_persistent(persistent_session);
        self.user = None;
        self.reconnect_attempt = Some(attempt);
        self.phase = SessionPhase::Reconnecting { attempt };
        self.transport = Transport::Backoff(tokio::time::delay_for(reconnect_backoff(attempt)), attempt);
        self.outbox.push_back(WaEvent::Reconnecting { attempt });
        Ok(())
    }
    /// Pushes every ready piece of work one step: transport progress, inbound
    /// frames, timers, outbound flushing. `Err` means the connection is dead.
    fn drive(&mut self, cx: &mut Context<'_>) -> Result<()> {
        loop {
            match self.transport {
                Transport::Down => break,
                Transport::Backoff(ref mut delay, attempt) => {
                    match Pin::new(delay).poll(cx) {
                        Poll::Ready(()) => {
                            info!("Redialing WhatsApp Web (attempt {})", attempt);
                            self.phase = SessionPhase::Opening;
                            self.attempt_timer = Some(tokio::time::delay_for(RECONNECT_ATTEMPT_TIMEOUT));
                            self.transport = Transport::Connecting(dial());
                        }
                        Poll::Pending => break,
                    }
                }
                Transport::Connecting(ref mut fut) => {
                    match fut.as_mut().poll(cx) {
                        Poll::Ready(Ok(ws)) => {
                            self.transport = Transport::Open(ws);
                            self.on_transport_open()?;
                        }
                        Poll::Ready(Err(e)) => {
                            self.transport = Transport::Down;
                            return Err(e);
                        }
                        Poll::Pending => break,
                    }
                }
                Transport::Open(_) => {
                    let polled = match self.transport {
                        Transport::Open(ref mut ws) => Pin::new(ws).poll_next(cx),
                        _ => unreachable!(),
                    };
                    match polled {
                        Poll::Ready(Some(Ok(m))) => self.on_message(m)?,
                        Poll::Ready(Some(Err(e))) => return Err(e.into()),
                        Poll::Ready(None) => return Err(WaError::TransportClosed("closed")),
                        Poll::Pending => break,
                    }
                }
            }
        }
        if let Poll::Ready(_) = Pin::new(&mut self.ping_timer).poll_tick(cx) {
            self.on_ping_timer()?;
        }
        if let Some(timer) = self.response_timer.as_mut() {
            if let Poll::Ready(()) = Pin::new(timer).poll(cx) {
                self.response_timer = None;
                self.on_response_timer()?;
            }
        }
        if let Some(timer) = self.attempt_timer.as_mut() {
            if let Poll::Ready(()) = Pin::new(timer).poll(cx) {
                self.attempt_timer = None;
                return Err(WaError::Timeout);
            }
        }
        self.flush_outbox(cx)?;
        Ok(())
    }
    /// Writes queued frames into the socket. `Ok(true)` when fully flushed.
    fn flush_outbox(&mut self, cx: &mut Context<'_>) -> Result<bool> {
        let ws = match self.transport {
            Transport::Open(ref mut ws) => ws,
            _ => return Ok(self.ws_outbox.is_empty()),
        };
        while let Some(msg) = self.ws_outbox.pop_front() {
            match Pin::new(&mut *ws).poll_ready(cx) {
                Poll::Pending => {
                    self.ws_outbox.push_front(msg);
                    return Ok(false);
                }
                Poll::Ready(Err(e)) => return Err(e.into()),
                Poll::Ready(Ok(())) => {}
            }
            Pin::new(&mut *ws).start_send(msg)?;
        }
        match Pin::new(&mut *ws).poll_flush(cx) {
            Poll::Ready(Err(e)) => Err(e.into()),
            Poll::Ready(Ok(())) => Ok(true),
            Poll::Pending => Ok(false),
        }
    }
}

/// Everything [`connect`] hands back besides the connection itself.
pub struct SessionData {
    pub user: UserMetaData,
    /// Credentials worth saving for the next login, if any were issued.
    pub persistent: Option<PersistentSession>,
    pub chats: Vec<Chat>,
    pub contacts: Vec<Contact>,
    /// Decoded message nodes from the unread backlog, bounded by the chats'
    /// unread counters.
    pub unread_messages: Vec<JsonValue>,
}

/// Drives `conn` until the session is validated, then hands it back together
/// with the logged-in account. QR payloads are surfaced through `on_qr`.
///
/// On any failure (including `timeout` elapsing) the connection is dropped,
/// which closes the socket and cancels everything pending.
pub async fn connect_slim<Q>(conn: WebConnection, on_qr: Q, timeout: Option<Duration>)
                             -> WaResult<(WebConnection, UserMetaData)>
    where Q: FnMut(&QrCode, &str) {
    match timeout {
        Some(dur) => tokio::time::timeout(dur, connect_slim_inner(conn, on_qr)).await
            .map_err(|_| WaError::Timeout)?,
        None => connect_slim_inner(conn, on_qr).await,
    }
}

async fn connect_slim_inner<Q>(mut conn: WebConnection, mut on_qr: Q)
                               -> WaResult<(WebConnection, UserMetaData)>
    where Q: FnMut(&QrCode, &str) {
    if conn.phase.is_live() {
        return Err(WaError::AlreadyConnected);
    }
    loop {
        match conn.next().await {
            Some(Ok(WaEvent::ScanCode { ref code, ref payload })) => on_qr(code, payload),
            Some(Ok(WaEvent::SessionEstablished { user, .. })) => {
                return Ok((conn, user));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e),
            None => return Err(WaError::TransportClosed("closed")),
        }
    }
}

/// [`connect_slim`] plus the initial data load: chats, contacts and the
/// unread message backlog.
pub async fn connect<Q>(conn: WebConnection, on_qr: Q, timeout: Option<Duration>)
                        -> WaResult<(WebConnection, SessionData)>
    where Q: FnMut(&QrCode, &str) {
    match timeout {
        Some(dur) => tokio::time::timeout(dur, connect_inner(conn, on_qr)).await
            .map_err(|_| WaError::Timeout)?,
        None => connect_inner(conn, on_qr).await,
    }
}

async fn connect_inner<Q>(conn: WebConnection, on_qr: Q)
                          -> WaResult<(WebConnection, SessionData)>
    where Q: FnMut(&QrCode, &str) {
    let (mut conn, user) = connect_slim_inner(conn, on_qr).await?;
    let data = receive_chats_and_contacts(&mut conn, user).await?;
    Ok((conn, data))
}

async fn receive_chats_and_contacts(conn: &mut WebConnection, user: UserMetaData)
                                    -> WaResult<SessionData> {
    let mut chats = Vec::new();
    let mut contacts = Vec::new();
    let mut unread_messages = Vec::new();
    loop {
        match conn.next().await {
            Some(Ok(WaEvent::InitialChats(c))) => chats = c,
            Some(Ok(WaEvent::InitialContacts(c))) => contacts = c,
            Some(Ok(WaEvent::UnreadMessage(m))) => unread_messages.push(m),
            Some(Ok(WaEvent::InitialLoadComplete)) => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e),
            None => return Err(WaError::TransportClosed("closed")),
        }
    }
    Ok(SessionData {
        user,
        persistent: conn.persistent_session().cloned(),
        chats,
        contacts,
        unread_messages,
    })
}
