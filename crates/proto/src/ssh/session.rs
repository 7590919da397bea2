//! Session driver: handshake, reader/writer tasks, channels, rekey.
//!
//! # Architecture
//!
//! The handshake (identification exchange, key exchange, service
//! request, user authentication) runs inline on the stream with a
//! single owner. Once established, the stream is split:
//!
//! - a **reader task** deframes inbound packets, dispatches them to
//!   channels and transport handlers, and drives rekeys
//! - a **writer task** drains an ordered outbound queue with two lanes:
//!   a control lane (transport and kex messages, never gated) and a
//!   data lane (channel traffic, held back whenever
//!   [`TransportState::may_send_user_data`] says user data must not
//!   flow; the reader mirrors that predicate into a shared flag the
//!   writer's `select!` consults)
//!
//! Session keys and sequence counters live inside the per-direction
//! [`PacketCodec`]s owned by those tasks; everything else talks to the
//! session by enqueueing commands and awaiting completion sinks
//! (oneshot channels).
//!
//! Pending sinks all fail when the session tears down; cryptographic
//! and protocol errors are fatal and emit a DISCONNECT where feasible.

use crate::ssh::auth::{AuthAction, AuthCredentials, ClientAuth};
use crate::ssh::channel::{Channel, ChannelIdAllocator};
use crate::ssh::codec;
use crate::ssh::compress::{CompressionAlgorithm, Compressor};
use crate::ssh::config::SshConfig;
use crate::ssh::connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelFailure, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelRequest, ChannelRequestType,
    ChannelWindowAdjust,
};
use crate::ssh::crypto::{CipherAlgorithm, CipherDirection, CipherSuite, MacAlgorithm, MacSuite};
use crate::ssh::hostkey::{self, HostKey, HostKeyVerifier};
use crate::ssh::kex::{negotiate, AlgorithmSet, KexInit, NewKeys};
use crate::ssh::kex_dh::{
    ClientKex, KexAlgorithm, KexContext, KexOutcome, KexStep, ServerKex, SessionKeys,
};
use crate::ssh::message::{Disconnect, DisconnectReason, MessageRange, MessageType, Unimplemented};
use crate::ssh::packet::PacketCodec;
use crate::ssh::service::{ServiceAccept, ServiceRegistry, ServiceRequest, USERAUTH_SERVICE};
use crate::ssh::transport::{State, TransportState};
use crate::ssh::version::Version;
use bytes::BytesMut;
use keel_platform::{KeelError, KeelResult};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tracing::{debug, info, warn};

/// Bounded depth of the data lane; enqueueing suspends beyond it.
const DATA_LANE_DEPTH: usize = 64;

/// Which side of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connecting side; its preferences win negotiation ties.
    Client,
    /// Accepting side.
    Server,
}

/// Awaits a future under an optional deadline, mapping expiry to
/// [`KeelError::Timeout`].
pub async fn with_deadline<T, F>(deadline: Option<Duration>, future: F) -> KeelResult<T>
where
    F: Future<Output = KeelResult<T>>,
{
    match deadline {
        None => future.await,
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| KeelError::Timeout)?,
    }
}

fn session_closed() -> KeelError {
    KeelError::Channel("Session is closed".to_string())
}

/// Reads one packet from the stream through the codec.
pub(crate) async fn read_packet<R>(
    stream: &mut R,
    inbound: &mut PacketCodec,
    buf: &mut BytesMut,
) -> KeelResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(payload) = inbound.open(buf)? {
            return Ok(payload);
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(KeelError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-packet",
            )));
        }
    }
}

/// Seals and writes one payload.
pub(crate) async fn write_packet<W>(
    stream: &mut W,
    outbound: &mut PacketCodec,
    payload: &[u8],
) -> KeelResult<()>
where
    W: AsyncWrite + Unpin,
{
    let wire = outbound.seal(payload)?;
    stream.write_all(&wire).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads packets, handling transport-generic messages (1-4) inline,
/// until a non-generic payload arrives.
pub(crate) async fn next_transport_payload<R>(
    stream: &mut R,
    inbound: &mut PacketCodec,
    buf: &mut BytesMut,
) -> KeelResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    loop {
        let payload = read_packet(stream, inbound, buf).await?;
        match payload.first().copied() {
            Some(1) => {
                let disconnect = Disconnect::from_bytes(&payload)?;
                return Err(KeelError::Protocol(format!(
                    "Peer disconnected ({:?}): {}",
                    disconnect.reason, disconnect.description
                )));
            }
            Some(2) => continue, // IGNORE
            Some(3) => {
                if let Ok(unimplemented) = Unimplemented::from_bytes(&payload) {
                    warn!(
                        sequence = unimplemented.sequence_number,
                        "peer reported SSH_MSG_UNIMPLEMENTED"
                    );
                }
                continue;
            }
            Some(4) => continue, // DEBUG
            _ => return Ok(payload),
        }
    }
}

/// The suites derived for one direction.
pub(crate) struct DirectionSuites {
    pub cipher: CipherSuite,
    pub mac: MacSuite,
    pub compressor: Compressor,
}

/// Builds outbound/inbound suites from an exchange outcome.
pub(crate) fn derive_suites(
    outcome: &KexOutcome,
    session_id: &[u8],
    algorithms: &AlgorithmSet,
    role: Role,
    authenticated: bool,
) -> KeelResult<(DirectionSuites, DirectionSuites)> {
    let cipher_c2s = CipherAlgorithm::from_name(&algorithms.cipher_c2s).ok_or_else(|| {
        KeelError::Negotiation(format!("Unsupported cipher '{}'", algorithms.cipher_c2s))
    })?;
    let cipher_s2c = CipherAlgorithm::from_name(&algorithms.cipher_s2c).ok_or_else(|| {
        KeelError::Negotiation(format!("Unsupported cipher '{}'", algorithms.cipher_s2c))
    })?;
    let mac_c2s = MacAlgorithm::from_name(&algorithms.mac_c2s).ok_or_else(|| {
        KeelError::Negotiation(format!("Unsupported MAC '{}'", algorithms.mac_c2s))
    })?;
    let mac_s2c = MacAlgorithm::from_name(&algorithms.mac_s2c).ok_or_else(|| {
        KeelError::Negotiation(format!("Unsupported MAC '{}'", algorithms.mac_s2c))
    })?;
    let comp_c2s = CompressionAlgorithm::from_name(&algorithms.compression_c2s).ok_or_else(|| {
        KeelError::Negotiation(format!(
            "Unsupported compression '{}'",
            algorithms.compression_c2s
        ))
    })?;
    let comp_s2c = CompressionAlgorithm::from_name(&algorithms.compression_s2c).ok_or_else(|| {
        KeelError::Negotiation(format!(
            "Unsupported compression '{}'",
            algorithms.compression_s2c
        ))
    })?;

    let iv_len = cipher_c2s.iv_size().max(cipher_s2c.iv_size());
    let key_len = cipher_c2s.key_size().max(cipher_s2c.key_size());
    let mac_len = mac_c2s.key_size().max(mac_s2c.key_size());

    let keys = SessionKeys::derive(
        outcome.hash,
        &outcome.shared_secret,
        &outcome.exchange_hash,
        session_id,
        iv_len,
        key_len,
        mac_len,
    );

    let c2s = DirectionSuites {
        cipher: CipherSuite::new(
            cipher_c2s,
            match role {
                Role::Client => CipherDirection::Encrypt,
                Role::Server => CipherDirection::Decrypt,
            },
            &keys.enc_c2s,
            &keys.iv_c2s,
        )?,
        mac: MacSuite::new(mac_c2s, &keys.mac_c2s)?,
        compressor: Compressor::new(comp_c2s, authenticated),
    };
    let s2c = DirectionSuites {
        cipher: CipherSuite::new(
            cipher_s2c,
            match role {
                Role::Client => CipherDirection::Decrypt,
                Role::Server => CipherDirection::Encrypt,
            },
            &keys.enc_s2c,
            &keys.iv_s2c,
        )?,
        mac: MacSuite::new(mac_s2c, &keys.mac_s2c)?,
        compressor: Compressor::new(comp_s2c, authenticated),
    };

    // (outbound, inbound) from this role's perspective.
    Ok(match role {
        Role::Client => (c2s, s2c),
        Role::Server => (s2c, c2s),
    })
}

/// A fully handshaken connection, ready for [`SshSession::start`].
pub struct Established<S> {
    pub(crate) stream: BufReader<S>,
    pub(crate) outbound: PacketCodec,
    pub(crate) inbound: PacketCodec,
    pub(crate) inbuf: BytesMut,
    pub(crate) role: Role,
    pub(crate) config: SshConfig,
    pub(crate) state: TransportState,
    pub(crate) session_id: Vec<u8>,
    pub(crate) algorithms: AlgorithmSet,
    pub(crate) our_version: String,
    pub(crate) peer_version: String,
    pub(crate) verifier: Option<Arc<dyn HostKeyVerifier>>,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) host_key: Option<Arc<dyn HostKey>>,
    /// Userauth banners collected during the handshake.
    pub banners: Vec<String>,
}

impl<S> Established<S> {
    /// The negotiated algorithm set.
    pub fn algorithms(&self) -> &AlgorithmSet {
        &self.algorithms
    }

    /// The session id (exchange hash of the first KEX).
    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }
}

/// Runs the client side of the handshake: identification exchange, key
/// exchange, host key verification, service request and user
/// authentication.
pub async fn client_handshake<S>(
    stream: S,
    config: SshConfig,
    host: &str,
    port: u16,
    verifier: Arc<dyn HostKeyVerifier>,
    username: &str,
    credentials: AuthCredentials,
) -> KeelResult<Established<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    config.validate()?;
    let mut stream = BufReader::new(stream);
    let mut state = TransportState::new();
    let mut outbound = PacketCodec::new();
    let mut inbound = PacketCodec::new();
    let mut inbuf = BytesMut::with_capacity(16 * 1024);

    // Identification exchange.
    let our_version = config.version.clone();
    our_version.write_to(&mut stream).await?;
    let peer_version = Version::read_from(&mut stream).await?;
    info!(peer = %peer_version, "server identification received");
    state.transition(State::KexInit)?;

    // KEXINIT exchange.
    let our_kexinit = KexInit::new(&config.algorithms);
    let our_kexinit_bytes = our_kexinit.to_bytes();
    write_packet(&mut stream, &mut outbound, &our_kexinit_bytes).await?;

    let peer_kexinit_bytes = next_transport_payload(&mut stream, &mut inbound, &mut inbuf).await?;
    let peer_kexinit = KexInit::from_bytes(&peer_kexinit_bytes)?;

    let algorithms = negotiate(&our_kexinit, &peer_kexinit)?;
    info!(kex = %algorithms.kex, cipher = %algorithms.cipher_c2s, "algorithms negotiated");

    // A wrong guessed packet is read and discarded (RFC 4253 7.1).
    if peer_kexinit.first_kex_packet_follows()
        && (peer_kexinit.kex_algorithms().first().map(String::as_str)
            != Some(algorithms.kex.as_str())
            || peer_kexinit
                .server_host_key_algorithms()
                .first()
                .map(String::as_str)
                != Some(algorithms.host_key.as_str()))
    {
        let _ = next_transport_payload(&mut stream, &mut inbound, &mut inbuf).await?;
        debug!("discarded peer's wrong kex guess");
    }

    state.transition(State::KexRun)?;

    let kex_algorithm = KexAlgorithm::from_name(&algorithms.kex).ok_or_else(|| {
        KeelError::Negotiation(format!("Unsupported kex algorithm '{}'", algorithms.kex))
    })?;
    let ctx = KexContext {
        client_version: our_version.to_string(),
        server_version: peer_version.to_string(),
        client_kexinit: our_kexinit_bytes,
        server_kexinit: peer_kexinit_bytes,
    };
    let (mut kex, first) = ClientKex::new(kex_algorithm, ctx)?;
    write_packet(&mut stream, &mut outbound, &first).await?;

    let outcome = loop {
        let payload = next_transport_payload(&mut stream, &mut inbound, &mut inbuf).await?;
        match kex.handle(&payload)? {
            KexStep::Send(msg) => write_packet(&mut stream, &mut outbound, &msg).await?,
            KexStep::Finished { outcome, .. } => break outcome,
        }
    };

    // Host key policy, then signature over H.
    if !verifier.accept(host, port, &outcome.host_key_blob) {
        return Err(KeelError::Negotiation(format!(
            "Host key for {}:{} rejected by policy",
            host, port
        )));
    }
    if !hostkey::verify_signature(
        &outcome.host_key_blob,
        &outcome.exchange_hash,
        &outcome.signature,
    )? {
        return Err(KeelError::Crypto(
            "Host key signature over the exchange hash is invalid".to_string(),
        ));
    }

    state.transition(State::NewKeys)?;
    state.record_exchange_hash(&outcome.exchange_hash);
    let session_id = outcome.exchange_hash.clone();

    let (out_suites, in_suites) =
        derive_suites(&outcome, &session_id, &algorithms, Role::Client, false)?;

    // Our NEWKEYS goes out under the old keys; everything after uses
    // the new ones.
    write_packet(&mut stream, &mut outbound, &NewKeys::new().to_bytes()).await?;
    outbound.activate(out_suites.cipher, out_suites.mac, out_suites.compressor)?;

    let payload = next_transport_payload(&mut stream, &mut inbound, &mut inbuf).await?;
    NewKeys::from_bytes(&payload)?;
    inbound.activate(in_suites.cipher, in_suites.mac, in_suites.compressor)?;

    state.transition(State::Running)?;
    info!("transport established");

    // Service request, then user authentication.
    let request = ServiceRequest::new(USERAUTH_SERVICE);
    write_packet(&mut stream, &mut outbound, &request.to_bytes()).await?;
    let payload = next_transport_payload(&mut stream, &mut inbound, &mut inbuf).await?;
    let accept = ServiceAccept::from_bytes(&payload)?;
    if accept.service_name != USERAUTH_SERVICE {
        return Err(KeelError::Protocol(format!(
            "Server accepted service '{}' instead of '{}'",
            accept.service_name, USERAUTH_SERVICE
        )));
    }

    let mut banners = Vec::new();
    let (mut auth, probe) = ClientAuth::new(username, &session_id, credentials);
    write_packet(&mut stream, &mut outbound, &probe).await?;
    loop {
        let payload = next_transport_payload(&mut stream, &mut inbound, &mut inbuf).await?;
        let number = *payload.first().ok_or_else(|| {
            KeelError::Protocol("Empty packet payload during authentication".to_string())
        })?;
        if !matches!(MessageRange::of(number), MessageRange::UserAuth) {
            return Err(KeelError::Protocol(format!(
                "Unexpected message {} during authentication",
                number
            )));
        }
        match auth.handle(&payload)? {
            AuthAction::Send(msg) => write_packet(&mut stream, &mut outbound, &msg).await?,
            AuthAction::Banner(banner) => banners.push(banner),
            AuthAction::Success => break,
        }
    }
    info!(user = username, "authenticated");
    outbound.on_authenticated();
    inbound.on_authenticated();

    Ok(Established {
        stream,
        outbound,
        inbound,
        inbuf,
        role: Role::Client,
        config,
        state,
        session_id,
        algorithms,
        our_version: our_version.to_string(),
        peer_version: peer_version.to_string(),
        verifier: Some(verifier),
        host: host.to_string(),
        port,
        host_key: None,
        banners,
    })
}

/// Events delivered to a channel's owner.
#[derive(Debug)]
pub enum ChannelEvent {
    /// Stdout data.
    Data(Vec<u8>),
    /// Extended (stderr) data.
    ExtendedData {
        /// Extended data type code (1 = stderr).
        data_type: u32,
        /// Payload.
        data: Vec<u8>,
    },
    /// Peer sent EOF.
    Eof,
    /// The channel is fully closed.
    Closed,
    /// Command exit status.
    ExitStatus(u32),
    /// Command terminated by signal.
    ExitSignal {
        /// Signal name without "SIG".
        signal: String,
        /// Server-supplied message.
        message: String,
    },
}

struct ChannelEntry {
    channel: Channel,
    event_tx: mpsc::UnboundedSender<ChannelEvent>,
    pending_replies: VecDeque<oneshot::Sender<bool>>,
    window_notify: Arc<Notify>,
}

struct Shared {
    channels: HashMap<u32, ChannelEntry>,
    allocator: ChannelIdAllocator,
    pending_opens: HashMap<u32, oneshot::Sender<KeelResult<()>>>,
    closed: Option<String>,
}

impl Shared {
    fn fail_all(&mut self, reason: &str) {
        if self.closed.is_some() {
            return;
        }
        self.closed = Some(reason.to_string());
        for (_, sink) in self.pending_opens.drain() {
            let _ = sink.send(Err(KeelError::Channel(reason.to_string())));
        }
        for (_, entry) in self.channels.iter_mut() {
            while let Some(sink) = entry.pending_replies.pop_front() {
                let _ = sink.send(false);
            }
            let _ = entry.event_tx.send(ChannelEvent::Closed);
            entry.window_notify.notify_one();
        }
    }
}

pub(crate) enum WriterCmd {
    Packet(Vec<u8>),
    InstallKeys(Box<DirectionSuites>),
    /// Re-evaluate the data-lane gate (sent when a rekey completes).
    Nudge,
    Shutdown,
}

async fn writer_task<W>(
    mut stream: W,
    mut outbound: PacketCodec,
    mut control_rx: mpsc::UnboundedReceiver<WriterCmd>,
    mut data_rx: mpsc::Receiver<WriterCmd>,
    kex_active: Arc<AtomicBool>,
    rekey_tx: mpsc::UnboundedSender<()>,
    rekey_bytes: u64,
    rekey_packets: u64,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let cmd = tokio::select! {
            biased;
            cmd = control_rx.recv() => cmd,
            cmd = data_rx.recv(), if !kex_active.load(Ordering::SeqCst) => cmd,
        };
        let Some(cmd) = cmd else { break };

        match cmd {
            WriterCmd::Packet(payload) => {
                if let Err(e) = write_packet(&mut stream, &mut outbound, &payload).await {
                    warn!(error = %e, "outbound write failed");
                    break;
                }
                if outbound.needs_rekey(rekey_bytes, rekey_packets) {
                    let _ = rekey_tx.send(());
                }
            }
            WriterCmd::InstallKeys(suites) => {
                if let Err(e) = outbound.activate(suites.cipher, suites.mac, suites.compressor) {
                    warn!(error = %e, "outbound key installation failed");
                    break;
                }
                debug!("outbound keys installed");
            }
            WriterCmd::Nudge => {}
            WriterCmd::Shutdown => break,
        }
    }
    debug!("writer task stopped");
}

enum RekeyPhase {
    Idle,
    AwaitPeerKexInit { ours: Vec<u8> },
    Driving(KexDriver),
    AwaitPeerNewKeys { inbound: Box<DirectionSuites> },
}

enum KexDriver {
    Client(Box<ClientKex>),
    Server(Box<ServerKex>),
}

struct Reader<R> {
    stream: R,
    inbound: PacketCodec,
    inbuf: BytesMut,
    shared: Arc<Mutex<Shared>>,
    control_tx: mpsc::UnboundedSender<WriterCmd>,
    /// The writer's data-lane gate: kept equal to the negation of
    /// [`TransportState::may_send_user_data`] by `sync_data_gate`.
    kex_active: Arc<AtomicBool>,
    rekey_rx: mpsc::UnboundedReceiver<()>,
    /// Keeps the rekey channel open even when every external sender is
    /// dropped, so the select arm stays pending rather than closed.
    _rekey_tx: mpsc::UnboundedSender<()>,
    rekey: RekeyPhase,
    /// Channel-range messages we owe the peer but may not send during a
    /// key exchange.
    deferred: Vec<Vec<u8>>,
    role: Role,
    config: SshConfig,
    state: TransportState,
    session_id: Vec<u8>,
    our_version: String,
    peer_version: String,
    verifier: Option<Arc<dyn HostKeyVerifier>>,
    host: String,
    port: u16,
    host_key: Option<Arc<dyn HostKey>>,
    services: ServiceRegistry,
    /// Algorithm set negotiated by an in-flight rekey, applied when the
    /// new keys install.
    pending_algorithms: Option<AlgorithmSet>,
}

impl<R> Reader<R>
where
    R: AsyncRead + Unpin,
{
    async fn run(&mut self) -> KeelResult<()> {
        loop {
            tokio::select! {
                _ = self.rekey_rx.recv() => {
                    self.begin_rekey().await?;
                }
                result = self.stream.read_buf(&mut self.inbuf) => {
                    let n = result?;
                    if n == 0 {
                        return Err(KeelError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "connection closed by peer",
                        )));
                    }
                    loop {
                        let Some(payload) = self.inbound.open(&mut self.inbuf)? else {
                            break;
                        };
                        if self.dispatch(payload).await? {
                            return Ok(());
                        }
                    }
                    if self
                        .inbound
                        .needs_rekey(self.config.rekey_bytes, self.config.rekey_packets)
                    {
                        self.begin_rekey().await?;
                    }
                }
            }
        }
    }

    fn send_control(&self, payload: Vec<u8>) -> KeelResult<()> {
        self.control_tx
            .send(WriterCmd::Packet(payload))
            .map_err(|_| session_closed())
    }

    /// Mirrors [`TransportState::may_send_user_data`] into the shared
    /// flag the writer's `select!` consults before polling the data
    /// lane. Called after every state transition that changes the
    /// predicate.
    fn sync_data_gate(&self) {
        self.kex_active
            .store(!self.state.may_send_user_data(), Ordering::SeqCst);
    }

    /// Sends a channel-range message, or defers it while a kex runs.
    fn send_channel_msg(&mut self, payload: Vec<u8>) -> KeelResult<()> {
        if self.kex_active.load(Ordering::SeqCst) {
            self.deferred.push(payload);
            Ok(())
        } else {
            self.send_control(payload)
        }
    }

    async fn begin_rekey(&mut self) -> KeelResult<()> {
        if !matches!(self.rekey, RekeyPhase::Idle) {
            return Ok(());
        }
        self.state.transition(State::RekeyRequested)?;
        self.state.transition(State::RekeyRunning)?;
        // The gate must close before our KEXINIT can reach the wire.
        self.sync_data_gate();
        let ours = KexInit::new(&self.config.algorithms).to_bytes();
        self.send_control(ours.clone())?;
        self.rekey = RekeyPhase::AwaitPeerKexInit { ours };
        info!("rekey initiated");
        Ok(())
    }

    /// Handles a peer KEXINIT (peer-initiated rekey or the reply to
    /// ours).
    async fn on_peer_kexinit(&mut self, payload: Vec<u8>) -> KeelResult<()> {
        let ours = match std::mem::replace(&mut self.rekey, RekeyPhase::Idle) {
            RekeyPhase::Idle => {
                // Peer-initiated: answer with our KEXINIT first.
                self.state.transition(State::RekeyRunning)?;
                self.sync_data_gate();
                let ours = KexInit::new(&self.config.algorithms).to_bytes();
                self.send_control(ours.clone())?;
                info!("peer initiated rekey");
                ours
            }
            RekeyPhase::AwaitPeerKexInit { ours } => ours,
            _ => {
                return Err(KeelError::Protocol(
                    "KEXINIT in the middle of a key exchange".to_string(),
                ))
            }
        };

        let our_init = KexInit::from_bytes(&ours)?;
        let peer_init = KexInit::from_bytes(&payload)?;
        let (client_init, server_init, client_bytes, server_bytes) = match self.role {
            Role::Client => (&our_init, &peer_init, ours.clone(), payload.clone()),
            Role::Server => (&peer_init, &our_init, payload.clone(), ours.clone()),
        };
        let algorithms = negotiate(client_init, server_init)?;
        let kex_algorithm = KexAlgorithm::from_name(&algorithms.kex).ok_or_else(|| {
            KeelError::Negotiation(format!("Unsupported kex algorithm '{}'", algorithms.kex))
        })?;
        let (client_version, server_version) = match self.role {
            Role::Client => (self.our_version.clone(), self.peer_version.clone()),
            Role::Server => (self.peer_version.clone(), self.our_version.clone()),
        };
        let ctx = KexContext {
            client_version,
            server_version,
            client_kexinit: client_bytes,
            server_kexinit: server_bytes,
        };

        self.rekey = match self.role {
            Role::Client => {
                let (kex, first) = ClientKex::new(kex_algorithm, ctx)?;
                self.send_control(first)?;
                RekeyPhase::Driving(KexDriver::Client(Box::new(kex)))
            }
            Role::Server => {
                let host_key = self.host_key.clone().ok_or_else(|| {
                    KeelError::Config("Server session without a host key".to_string())
                })?;
                RekeyPhase::Driving(KexDriver::Server(Box::new(ServerKex::new(
                    kex_algorithm,
                    ctx,
                    host_key,
                ))))
            }
        };
        // The negotiated set replaces the stored one when keys install.
        self.pending_algorithms = Some(algorithms);
        Ok(())
    }

    async fn on_kex_message(&mut self, payload: Vec<u8>) -> KeelResult<()> {
        let phase = std::mem::replace(&mut self.rekey, RekeyPhase::Idle);
        let RekeyPhase::Driving(mut driver) = phase else {
            self.rekey = phase;
            return Err(KeelError::Protocol(format!(
                "Unexpected key exchange message {} outside an exchange",
                payload.first().copied().unwrap_or(0)
            )));
        };

        let step = match &mut driver {
            KexDriver::Client(kex) => kex.handle(&payload)?,
            KexDriver::Server(kex) => kex.handle(&payload)?,
        };

        match step {
            KexStep::Send(msg) => {
                self.send_control(msg)?;
                self.rekey = RekeyPhase::Driving(driver);
            }
            KexStep::Finished { send, outcome } => {
                if let KexDriver::Client(_) = driver {
                    if let Some(verifier) = &self.verifier {
                        if !verifier.accept(&self.host, self.port, &outcome.host_key_blob) {
                            return Err(KeelError::Negotiation(
                                "Host key rejected by policy on rekey".to_string(),
                            ));
                        }
                    }
                    if !hostkey::verify_signature(
                        &outcome.host_key_blob,
                        &outcome.exchange_hash,
                        &outcome.signature,
                    )? {
                        return Err(KeelError::Crypto(
                            "Host key signature over the exchange hash is invalid".to_string(),
                        ));
                    }
                }
                if let Some(msg) = send {
                    self.send_control(msg)?;
                }

                let algorithms = self
                    .pending_algorithms
                    .take()
                    .ok_or_else(|| KeelError::Protocol("Rekey without negotiation".to_string()))?;

                // The session id never changes on rekey.
                self.state.record_exchange_hash(&outcome.exchange_hash);
                let (out_suites, in_suites) =
                    derive_suites(&outcome, &self.session_id, &algorithms, self.role, true)?;

                self.state.transition(State::NewKeys)?;
                self.send_control(NewKeys::new().to_bytes())?;
                self.control_tx
                    .send(WriterCmd::InstallKeys(Box::new(out_suites)))
                    .map_err(|_| session_closed())?;
                self.state.set_awaiting_peer_newkeys(true);
                self.rekey = RekeyPhase::AwaitPeerNewKeys {
                    inbound: Box::new(in_suites),
                };
            }
        }
        Ok(())
    }

    fn on_newkeys(&mut self) -> KeelResult<()> {
        let phase = std::mem::replace(&mut self.rekey, RekeyPhase::Idle);
        let RekeyPhase::AwaitPeerNewKeys { inbound } = phase else {
            self.rekey = phase;
            return Err(KeelError::Protocol(
                "SSH_MSG_NEWKEYS outside a key exchange".to_string(),
            ));
        };
        self.inbound
            .activate(inbound.cipher, inbound.mac, inbound.compressor)?;
        self.state.set_awaiting_peer_newkeys(false);
        self.state.transition(State::Running)?;
        self.sync_data_gate();
        for payload in std::mem::take(&mut self.deferred) {
            self.send_control(payload)?;
        }
        // Wake the writer so the data lane re-opens even when nothing
        // else rides the control lane.
        let _ = self.control_tx.send(WriterCmd::Nudge);
        info!("rekey complete");
        Ok(())
    }

    /// Dispatches one inbound payload. Returns `true` when the session
    /// should shut down cleanly (peer DISCONNECT).
    async fn dispatch(&mut self, payload: Vec<u8>) -> KeelResult<bool> {
        let Some(&number) = payload.first() else {
            return Err(KeelError::Protocol("Empty packet payload".to_string()));
        };

        match number {
            1 => {
                let disconnect = Disconnect::from_bytes(&payload)?;
                info!(
                    reason = ?disconnect.reason,
                    description = %disconnect.description,
                    "peer disconnected"
                );
                // Closed without reply, per the protocol.
                return Ok(true);
            }
            2 | 4 => return Ok(false), // IGNORE / DEBUG
            3 => {
                if let Ok(unimplemented) = Unimplemented::from_bytes(&payload) {
                    warn!(
                        sequence = unimplemented.sequence_number,
                        "peer reported SSH_MSG_UNIMPLEMENTED"
                    );
                }
                return Ok(false);
            }
            20 => {
                self.on_peer_kexinit(payload).await?;
                return Ok(false);
            }
            21 => {
                self.on_newkeys()?;
                return Ok(false);
            }
            22..=49 => {
                self.on_kex_message(payload).await?;
                return Ok(false);
            }
            _ => {}
        }

        if number == MessageType::GlobalRequest as u8 {
            // We honour no global requests; refuse those wanting a reply.
            let mut offset = 1;
            let name = codec::read_string_utf8(&payload, &mut offset)?;
            let want_reply = codec::read_boolean(&payload, &mut offset)?;
            debug!(request = %name, "refusing global request");
            if want_reply {
                let mut refuse = BytesMut::new();
                codec::put_byte(&mut refuse, MessageType::RequestFailure as u8);
                self.send_channel_msg(refuse.to_vec())?;
            }
            return Ok(false);
        }

        match MessageRange::of(number) {
            MessageRange::Connection if self.services.route(number).is_some() => {
                self.dispatch_channel(number, &payload).await
            }
            _ => {
                // Unknown within a valid range: reply UNIMPLEMENTED with
                // the offending sequence number; never terminate.
                let sequence = self.inbound.sequence().wrapping_sub(1);
                self.send_control(Unimplemented::new(sequence).to_bytes())?;
                Ok(false)
            }
        }
    }

    async fn dispatch_channel(&mut self, number: u8, payload: &[u8]) -> KeelResult<bool> {
        match MessageType::from_u8(number) {
            Some(MessageType::ChannelOpenConfirmation) => {
                let confirm = ChannelOpenConfirmation::from_bytes(payload)?;
                let mut shared = self.shared.lock().await;
                if let Some(entry) = shared.channels.get_mut(&confirm.recipient_channel) {
                    entry.channel.on_confirmation(
                        confirm.sender_channel,
                        confirm.initial_window_size,
                        confirm.maximum_packet_size,
                    )?;
                }
                if let Some(sink) = shared.pending_opens.remove(&confirm.recipient_channel) {
                    let _ = sink.send(Ok(()));
                }
            }
            Some(MessageType::ChannelOpenFailure) => {
                let failure = ChannelOpenFailure::from_bytes(payload)?;
                let mut shared = self.shared.lock().await;
                shared.channels.remove(&failure.recipient_channel);
                shared.allocator.release(failure.recipient_channel);
                if let Some(sink) = shared.pending_opens.remove(&failure.recipient_channel) {
                    let _ = sink.send(Err(KeelError::Channel(format!(
                        "Channel open refused (code {}): {}",
                        failure.reason_code, failure.description
                    ))));
                }
            }
            Some(MessageType::ChannelWindowAdjust) => {
                let adjust = ChannelWindowAdjust::from_bytes(payload)?;
                let mut shared = self.shared.lock().await;
                if let Some(entry) = shared.channels.get_mut(&adjust.recipient_channel) {
                    entry.channel.add_send_window(adjust.bytes_to_add);
                    entry.window_notify.notify_one();
                }
            }
            Some(MessageType::ChannelData) => {
                let data = ChannelData::from_bytes(payload)?;
                let reply = {
                    let mut shared = self.shared.lock().await;
                    let Some(entry) = shared.channels.get_mut(&data.recipient_channel) else {
                        warn!(channel = data.recipient_channel, "data for unknown channel");
                        return Ok(false);
                    };
                    entry.channel.on_data_received(data.data.len())?;
                    let _ = entry.event_tx.send(ChannelEvent::Data(data.data));
                    entry.channel.replenish_window().map(|grant| {
                        ChannelWindowAdjust {
                            recipient_channel: entry.channel.remote_id().unwrap_or(0),
                            bytes_to_add: grant,
                        }
                        .to_bytes()
                    })
                };
                if let Some(adjust) = reply {
                    self.send_channel_msg(adjust)?;
                }
            }
            Some(MessageType::ChannelExtendedData) => {
                let data = ChannelExtendedData::from_bytes(payload)?;
                let reply = {
                    let mut shared = self.shared.lock().await;
                    let Some(entry) = shared.channels.get_mut(&data.recipient_channel) else {
                        return Ok(false);
                    };
                    entry.channel.on_data_received(data.data.len())?;
                    let _ = entry.event_tx.send(ChannelEvent::ExtendedData {
                        data_type: data.data_type,
                        data: data.data,
                    });
                    entry.channel.replenish_window().map(|grant| {
                        ChannelWindowAdjust {
                            recipient_channel: entry.channel.remote_id().unwrap_or(0),
                            bytes_to_add: grant,
                        }
                        .to_bytes()
                    })
                };
                if let Some(adjust) = reply {
                    self.send_channel_msg(adjust)?;
                }
            }
            Some(MessageType::ChannelEof) => {
                let eof = ChannelEof::from_bytes(payload)?;
                let mut shared = self.shared.lock().await;
                if let Some(entry) = shared.channels.get_mut(&eof.recipient_channel) {
                    entry.channel.on_eof_received();
                    let _ = entry.event_tx.send(ChannelEvent::Eof);
                }
            }
            Some(MessageType::ChannelClose) => {
                let close = ChannelClose::from_bytes(payload)?;
                let reply = {
                    let mut shared = self.shared.lock().await;
                    let Some(entry) = shared.channels.get_mut(&close.recipient_channel) else {
                        return Ok(false);
                    };
                    let remote_id = entry.channel.remote_id().unwrap_or(0);
                    let fully_closed = entry.channel.on_close_received();
                    let reply = if fully_closed {
                        None
                    } else {
                        entry.channel.on_close_sent();
                        Some(ChannelClose::new(remote_id).to_bytes())
                    };
                    let _ = entry.event_tx.send(ChannelEvent::Closed);
                    shared.channels.remove(&close.recipient_channel);
                    shared.allocator.release(close.recipient_channel);
                    reply
                };
                if let Some(close_reply) = reply {
                    self.send_channel_msg(close_reply)?;
                }
            }
            Some(MessageType::ChannelRequest) => {
                let request = ChannelRequest::from_bytes(payload)?;
                let reply = {
                    let mut shared = self.shared.lock().await;
                    let Some(entry) = shared.channels.get_mut(&request.recipient_channel) else {
                        return Ok(false);
                    };
                    match &request.request {
                        ChannelRequestType::ExitStatus { status } => {
                            let _ = entry.event_tx.send(ChannelEvent::ExitStatus(*status));
                        }
                        ChannelRequestType::ExitSignal {
                            signal, message, ..
                        } => {
                            let _ = entry.event_tx.send(ChannelEvent::ExitSignal {
                                signal: signal.clone(),
                                message: message.clone(),
                            });
                        }
                        other => {
                            debug!(request = other.name(), "ignoring inbound channel request");
                        }
                    }
                    if request.want_reply {
                        let remote_id = entry.channel.remote_id().unwrap_or(0);
                        Some(ChannelFailure::new(remote_id).to_bytes())
                    } else {
                        None
                    }
                };
                if let Some(failure) = reply {
                    self.send_channel_msg(failure)?;
                }
            }
            Some(MessageType::ChannelSuccess) => {
                let success = crate::ssh::connection::ChannelSuccess::from_bytes(payload)?;
                let mut shared = self.shared.lock().await;
                if let Some(entry) = shared.channels.get_mut(&success.recipient_channel) {
                    match entry.pending_replies.pop_front() {
                        Some(sink) => {
                            let _ = sink.send(true);
                        }
                        None => {
                            return Err(KeelError::Protocol(
                                "CHANNEL_SUCCESS without an outstanding request".to_string(),
                            ))
                        }
                    }
                }
            }
            Some(MessageType::ChannelFailure) => {
                let failure = ChannelFailure::from_bytes(payload)?;
                let mut shared = self.shared.lock().await;
                if let Some(entry) = shared.channels.get_mut(&failure.recipient_channel) {
                    match entry.pending_replies.pop_front() {
                        Some(sink) => {
                            let _ = sink.send(false);
                        }
                        None => {
                            return Err(KeelError::Protocol(
                                "CHANNEL_FAILURE without an outstanding request".to_string(),
                            ))
                        }
                    }
                }
            }
            Some(MessageType::ChannelOpen) => {
                // This engine does not accept peer-opened channels.
                let open = ChannelOpen::from_bytes(payload)?;
                let failure = ChannelOpenFailure {
                    recipient_channel: open.sender_channel,
                    reason_code: 1, // administratively prohibited
                    description: "channel opens are not accepted".to_string(),
                };
                self.send_channel_msg(failure.to_bytes())?;
            }
            _ => {
                let sequence = self.inbound.sequence().wrapping_sub(1);
                self.send_control(Unimplemented::new(sequence).to_bytes())?;
            }
        }
        Ok(false)
    }
}

/// Handle to a running session.
///
/// Cloneable; all clones share the one transport.
#[derive(Clone)]
pub struct SshSession {
    shared: Arc<Mutex<Shared>>,
    control_tx: mpsc::UnboundedSender<WriterCmd>,
    data_tx: mpsc::Sender<WriterCmd>,
    rekey_tx: mpsc::UnboundedSender<()>,
    session_id: Vec<u8>,
    algorithms: AlgorithmSet,
    config: SshConfig,
}

impl SshSession {
    /// Spawns the reader/writer tasks and returns the session handle.
    pub fn start<S>(established: Established<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Established {
            stream,
            outbound,
            inbound,
            inbuf,
            role,
            config,
            state,
            session_id,
            algorithms,
            our_version,
            peer_version,
            verifier,
            host,
            port,
            host_key,
            banners: _,
        } = established;

        let shared = Arc::new(Mutex::new(Shared {
            channels: HashMap::new(),
            allocator: ChannelIdAllocator::new(),
            pending_opens: HashMap::new(),
            closed: None,
        }));

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::channel(DATA_LANE_DEPTH);
        let (rekey_tx, rekey_rx) = mpsc::unbounded_channel();
        let kex_active = Arc::new(AtomicBool::new(false));

        let (read_half, write_half) = tokio::io::split(stream);

        tokio::spawn(writer_task(
            write_half,
            outbound,
            control_rx,
            data_rx,
            Arc::clone(&kex_active),
            rekey_tx.clone(),
            config.rekey_bytes,
            config.rekey_packets,
        ));

        // Heartbeat probes ride the control lane; a failed enqueue means
        // the writer is gone and the probe escalates to teardown.
        if let Some(interval) = config.heartbeat_interval {
            let control_tx = control_tx.clone();
            let shared_hb = Arc::clone(&shared);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let mut ignore = BytesMut::new();
                    codec::put_byte(&mut ignore, MessageType::Ignore as u8);
                    codec::put_string(&mut ignore, b"");
                    if control_tx.send(WriterCmd::Packet(ignore.to_vec())).is_err() {
                        shared_hb.lock().await.fail_all("heartbeat failed");
                        break;
                    }
                }
            });
        }

        let mut reader = Reader {
            stream: read_half,
            inbound,
            inbuf,
            shared: Arc::clone(&shared),
            control_tx: control_tx.clone(),
            kex_active,
            rekey_rx,
            _rekey_tx: rekey_tx.clone(),
            rekey: RekeyPhase::Idle,
            deferred: Vec::new(),
            role,
            config: config.clone(),
            state,
            session_id: session_id.clone(),
            our_version,
            peer_version,
            verifier,
            host,
            port,
            host_key,
            services: ServiceRegistry::standard(),
            pending_algorithms: None,
        };

        let shared_reader = Arc::clone(&shared);
        let control_for_reader = control_tx.clone();
        tokio::spawn(async move {
            let result = reader.run().await;
            let reason = match &result {
                Ok(()) => "peer disconnected".to_string(),
                Err(e) => {
                    if e.is_fatal() {
                        // Best effort DISCONNECT before teardown.
                        let reason = match e {
                            KeelError::Crypto(_) => DisconnectReason::MacError,
                            KeelError::Negotiation(_) => DisconnectReason::KeyExchangeFailed,
                            _ => DisconnectReason::ProtocolError,
                        };
                        let _ = control_for_reader.send(WriterCmd::Packet(
                            Disconnect::new(reason, &e.to_string()).to_bytes(),
                        ));
                    }
                    warn!(error = %e, "session terminated");
                    e.to_string()
                }
            };
            let _ = control_for_reader.send(WriterCmd::Shutdown);
            shared_reader.lock().await.fail_all(&reason);
        });

        Self {
            shared,
            control_tx,
            data_tx,
            rekey_tx,
            session_id,
            algorithms,
            config,
        }
    }

    /// The session id (exchange hash of the first key exchange).
    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    /// The negotiated algorithm set.
    pub fn algorithms(&self) -> &AlgorithmSet {
        &self.algorithms
    }

    /// The active configuration.
    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Requests a key re-exchange at the next opportunity.
    pub fn request_rekey(&self) {
        let _ = self.rekey_tx.send(());
    }

    async fn enqueue_data(&self, payload: Vec<u8>) -> KeelResult<()> {
        self.data_tx
            .send(WriterCmd::Packet(payload))
            .await
            .map_err(|_| session_closed())
    }

    /// Opens a `session` channel and waits for confirmation.
    pub async fn open_session_channel(
        &self,
        deadline: Option<Duration>,
    ) -> KeelResult<ChannelHandle> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (open_tx, open_rx) = oneshot::channel();
        let window_notify = Arc::new(Notify::new());

        let local_id = {
            let mut shared = self.shared.lock().await;
            if let Some(reason) = &shared.closed {
                return Err(KeelError::Channel(reason.clone()));
            }
            let local_id = shared.allocator.allocate();
            shared.channels.insert(
                local_id,
                ChannelEntry {
                    channel: Channel::new(local_id, self.config.window_size, self.config.max_packet),
                    event_tx,
                    pending_replies: VecDeque::new(),
                    window_notify: Arc::clone(&window_notify),
                },
            );
            shared.pending_opens.insert(local_id, open_tx);
            local_id
        };

        let open =
            ChannelOpen::session(local_id, self.config.window_size, self.config.max_packet);
        self.enqueue_data(open.to_bytes()).await?;

        with_deadline(deadline, async {
            open_rx.await.map_err(|_| session_closed())?
        })
        .await?;

        let (remote_id, remote_max_packet) = {
            let shared = self.shared.lock().await;
            let entry = shared
                .channels
                .get(&local_id)
                .ok_or_else(session_closed)?;
            (
                entry.channel.remote_id().unwrap_or(0),
                entry.channel.remote_max_packet(),
            )
        };

        debug!(local = local_id, remote = remote_id, "channel open");
        Ok(ChannelHandle {
            local_id,
            remote_id,
            remote_max_packet,
            shared: Arc::clone(&self.shared),
            data_tx: self.data_tx.clone(),
            events: Some(event_rx),
            window_notify,
        })
    }

    /// Sends DISCONNECT and stops the writer.
    pub async fn disconnect(&self, reason: DisconnectReason, description: &str) {
        let _ = self.control_tx.send(WriterCmd::Packet(
            Disconnect::new(reason, description).to_bytes(),
        ));
        let _ = self.control_tx.send(WriterCmd::Shutdown);
        self.shared.lock().await.fail_all("locally disconnected");
    }
}

/// Handle to one open channel.
pub struct ChannelHandle {
    local_id: u32,
    remote_id: u32,
    remote_max_packet: u32,
    shared: Arc<Mutex<Shared>>,
    data_tx: mpsc::Sender<WriterCmd>,
    events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    window_notify: Arc<Notify>,
}

impl ChannelHandle {
    /// Returns the local channel id.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Returns the remote channel id.
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    async fn enqueue(&self, payload: Vec<u8>) -> KeelResult<()> {
        self.data_tx
            .send(WriterCmd::Packet(payload))
            .await
            .map_err(|_| session_closed())
    }

    /// Sends data, suspending while the peer's window is exhausted.
    ///
    /// Data is chunked to the peer's maximum packet size; per-channel
    /// ordering is preserved and chunks are never interleaved.
    pub async fn send_data(&self, data: &[u8]) -> KeelResult<()> {
        let mut offset = 0;
        while offset < data.len() {
            let chunk_len = {
                loop {
                    let notified = self.window_notify.notified();
                    let available = {
                        let mut shared = self.shared.lock().await;
                        if let Some(reason) = &shared.closed {
                            return Err(KeelError::Channel(reason.clone()));
                        }
                        let entry = shared
                            .channels
                            .get_mut(&self.local_id)
                            .ok_or_else(|| KeelError::Channel("Channel is closed".to_string()))?;
                        if !entry.channel.is_usable() {
                            return Err(KeelError::Channel(format!(
                                "Channel {} is not usable in state {:?}",
                                self.local_id,
                                entry.channel.state()
                            )));
                        }
                        let budget = entry
                            .channel
                            .send_window()
                            .min(u64::from(self.remote_max_packet.max(1)))
                            .min((data.len() - offset) as u64) as usize;
                        if budget > 0 {
                            entry.channel.consume_send_window(budget)?;
                        }
                        budget
                    };
                    if available > 0 {
                        break available;
                    }
                    // Await a window adjust; notify_one semantics keep a
                    // permit if it already arrived.
                    notified.await;
                }
            };

            let chunk = &data[offset..offset + chunk_len];
            self.enqueue(ChannelData::new(self.remote_id, chunk.to_vec()).to_bytes())
                .await?;
            offset += chunk_len;
        }
        Ok(())
    }

    /// Issues a channel request. With `want_reply`, resolves to the
    /// peer's SUCCESS/FAILURE verdict (replies arrive in FIFO order).
    pub async fn request(
        &self,
        request: ChannelRequestType,
        want_reply: bool,
        deadline: Option<Duration>,
    ) -> KeelResult<bool> {
        let reply_rx = if want_reply {
            let (tx, rx) = oneshot::channel();
            let mut shared = self.shared.lock().await;
            let entry = shared
                .channels
                .get_mut(&self.local_id)
                .ok_or_else(|| KeelError::Channel("Channel is closed".to_string()))?;
            entry.pending_replies.push_back(tx);
            Some(rx)
        } else {
            None
        };

        let msg = ChannelRequest::new(self.remote_id, request, want_reply);
        self.enqueue(msg.to_bytes()).await?;

        match reply_rx {
            None => Ok(true),
            Some(rx) => {
                with_deadline(deadline, async { rx.await.map_err(|_| session_closed()) }).await
            }
        }
    }

    /// Receives the next channel event.
    ///
    /// Returns `None` once the channel is closed and drained, or after
    /// [`ChannelHandle::take_events`] moved the stream elsewhere.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => None,
        }
    }

    /// Takes the event stream out of the handle, for an owner (like the
    /// SFTP demultiplexer) that consumes events on its own task.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.take()
    }

    /// Signals EOF (no more data from our side).
    pub async fn send_eof(&self) -> KeelResult<()> {
        {
            let mut shared = self.shared.lock().await;
            if let Some(entry) = shared.channels.get_mut(&self.local_id) {
                entry.channel.on_eof_sent();
            }
        }
        self.enqueue(ChannelEof::new(self.remote_id).to_bytes()).await
    }

    /// Sends CHANNEL_CLOSE. The channel is fully closed (and the local
    /// id reusable) once the peer's CLOSE has also been seen.
    pub async fn close(&self) -> KeelResult<()> {
        {
            let mut shared = self.shared.lock().await;
            let Some(entry) = shared.channels.get_mut(&self.local_id) else {
                return Ok(()); // already gone
            };
            if entry.channel.on_close_sent() {
                shared.channels.remove(&self.local_id);
                shared.allocator.release(self.local_id);
            }
        }
        self.enqueue(ChannelClose::new(self.remote_id).to_bytes())
            .await
    }
}

/// Builds a detached channel handle wired to raw queues, for loopback
/// tests that exercise channel consumers without a transport.
#[cfg(test)]
pub(crate) fn test_channel_pair(
    window: u32,
    max_packet: u32,
) -> (
    ChannelHandle,
    mpsc::Receiver<WriterCmd>,
    mpsc::UnboundedSender<ChannelEvent>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (data_tx, data_rx) = mpsc::channel(DATA_LANE_DEPTH);
    let window_notify = Arc::new(Notify::new());

    let mut channel = Channel::new(0, window, max_packet);
    channel
        .on_confirmation(1, window, max_packet)
        .expect("fresh channel accepts confirmation");

    let mut channels = HashMap::new();
    channels.insert(
        0,
        ChannelEntry {
            channel,
            event_tx: event_tx.clone(),
            pending_replies: VecDeque::new(),
            window_notify: Arc::clone(&window_notify),
        },
    );

    let shared = Arc::new(Mutex::new(Shared {
        channels,
        allocator: ChannelIdAllocator::new(),
        pending_opens: HashMap::new(),
        closed: None,
    }));

    (
        ChannelHandle {
            local_id: 0,
            remote_id: 1,
            remote_max_packet: max_packet,
            shared,
            data_tx,
            events: Some(event_rx),
            window_notify,
        },
        data_rx,
        event_tx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_deadline_passthrough() {
        let result = with_deadline(None, async { Ok::<_, KeelError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_with_deadline_timeout() {
        let result: KeelResult<()> = with_deadline(Some(Duration::from_millis(10)), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(KeelError::Timeout)));
    }

    #[tokio::test]
    async fn test_packet_helpers_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut client_read, _keep) = tokio::io::split(client);
        let (_, mut server_write) = tokio::io::split(server);

        let mut outbound = PacketCodec::new();
        let mut inbound = PacketCodec::new();
        let mut buf = BytesMut::new();

        write_packet(&mut server_write, &mut outbound, b"ping")
            .await
            .unwrap();
        let payload = read_packet(&mut client_read, &mut inbound, &mut buf)
            .await
            .unwrap();
        assert_eq!(payload, b"ping");
    }

    #[tokio::test]
    async fn test_next_transport_payload_skips_generics() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut client_read, _keep) = tokio::io::split(client);
        let (_, mut server_write) = tokio::io::split(server);

        let mut outbound = PacketCodec::new();
        let mut inbound = PacketCodec::new();
        let mut buf = BytesMut::new();

        // IGNORE, DEBUG, then a real payload.
        let mut ignore = BytesMut::new();
        codec::put_byte(&mut ignore, 2);
        codec::put_string(&mut ignore, b"noise");
        write_packet(&mut server_write, &mut outbound, &ignore)
            .await
            .unwrap();

        let mut debug_msg = BytesMut::new();
        codec::put_byte(&mut debug_msg, 4);
        codec::put_boolean(&mut debug_msg, false);
        codec::put_string(&mut debug_msg, b"dbg");
        codec::put_string(&mut debug_msg, b"");
        write_packet(&mut server_write, &mut outbound, &debug_msg)
            .await
            .unwrap();

        write_packet(&mut server_write, &mut outbound, &[21])
            .await
            .unwrap();

        let payload = next_transport_payload(&mut client_read, &mut inbound, &mut buf)
            .await
            .unwrap();
        assert_eq!(payload, vec![21]);
    }

    #[tokio::test]
    async fn test_next_transport_payload_surfaces_disconnect() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut client_read, _keep) = tokio::io::split(client);
        let (_, mut server_write) = tokio::io::split(server);

        let mut outbound = PacketCodec::new();
        let mut inbound = PacketCodec::new();
        let mut buf = BytesMut::new();

        let disconnect = Disconnect::new(DisconnectReason::ByApplication, "bye");
        write_packet(&mut server_write, &mut outbound, &disconnect.to_bytes())
            .await
            .unwrap();

        let result = next_transport_payload(&mut client_read, &mut inbound, &mut buf).await;
        assert!(matches!(result, Err(KeelError::Protocol(_))));
    }
}
