//! Server-side handshake and a minimal connection service.
//!
//! The engine is symmetric: the packet pipeline, negotiation and key
//! exchange all run on either side. This module drives the accepting
//! side: identification exchange, KEXINIT, the responder half of the
//! key exchange, service acceptance and password authentication with
//! attempt tracking.
//!
//! [`ServerConnection`] then serves the connection layer for a single
//! peer: session channels, `exec` requests through a caller-supplied
//! handler, and the `sftp` subsystem backed by the in-memory
//! responder. It is deliberately small - enough to exercise every
//! client path over a loopback transport, not a multi-user daemon.

use crate::ssh::auth::{constant_time_compare, AuthAttempts, AuthFailure, AuthMethod, AuthRequest};
use crate::ssh::config::SshConfig;
use crate::ssh::connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelFailure, ChannelOpen, ChannelOpenConfirmation,
    ChannelRequest, ChannelRequestType, ChannelSuccess, ChannelWindowAdjust,
};
use crate::ssh::hostkey::HostKey;
use crate::ssh::kex::{negotiate, AlgorithmSet, KexInit, NewKeys};
use crate::ssh::kex_dh::{KexAlgorithm, KexContext, KexStep, ServerKex};
use crate::ssh::message::{Disconnect, DisconnectReason, MessageType, Unimplemented};
use crate::ssh::packet::PacketCodec;
use crate::ssh::service::{ServiceAccept, ServiceRequest, USERAUTH_SERVICE};
use crate::ssh::session::{
    derive_suites, next_transport_payload, read_packet, write_packet, Established, Role,
};
use crate::ssh::sftp::memfs::MemorySftpServer;
use crate::ssh::sftp::message::FrameBuffer;
use crate::ssh::transport::{State, TransportState};
use crate::ssh::version::Version;
use bytes::BytesMut;
use keel_platform::{KeelError, KeelResult};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, info, warn};

/// Password database plus the attempt cap.
#[derive(Debug, Default, Clone)]
pub struct ServerAuthPolicy {
    passwords: HashMap<String, String>,
    /// Attempt cap; exceeding it disconnects with
    /// `NO_MORE_AUTH_METHODS_AVAILABLE`.
    pub max_attempts: u32,
}

impl ServerAuthPolicy {
    /// Creates an empty policy with the default attempt cap.
    pub fn new() -> Self {
        Self {
            passwords: HashMap::new(),
            max_attempts: crate::ssh::auth::DEFAULT_MAX_AUTH_ATTEMPTS,
        }
    }

    /// Registers a user/password pair.
    pub fn add_password(&mut self, user: &str, password: &str) -> &mut Self {
        self.passwords.insert(user.to_string(), password.to_string());
        self
    }

    fn check_password(&self, user: &str, password: &str) -> bool {
        self.passwords
            .get(user)
            .is_some_and(|expected| constant_time_compare(expected.as_bytes(), password.as_bytes()))
    }

    fn continuations() -> Vec<String> {
        vec!["publickey".to_string(), "password".to_string()]
    }
}

/// Runs the accepting side of the handshake.
pub async fn server_handshake<S>(
    stream: S,
    config: SshConfig,
    host_key: Arc<dyn HostKey>,
    policy: &ServerAuthPolicy,
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

    let our_version = config.version.clone();
    our_version.write_to(&mut stream).await?;
    let peer_version = Version::read_from(&mut stream).await?;
    info!(peer = %peer_version, "client identification received");
    state.transition(State::KexInit)?;

    let our_kexinit = KexInit::new(&config.algorithms);
    let our_kexinit_bytes = our_kexinit.to_bytes();
    write_packet(&mut stream, &mut outbound, &our_kexinit_bytes).await?;

    let peer_kexinit_bytes = next_transport_payload(&mut stream, &mut inbound, &mut inbuf).await?;
    let peer_kexinit = KexInit::from_bytes(&peer_kexinit_bytes)?;

    // The client's preferences win ties regardless of our role.
    let algorithms = negotiate(&peer_kexinit, &our_kexinit)?;
    state.transition(State::KexRun)?;

    let kex_algorithm = KexAlgorithm::from_name(&algorithms.kex).ok_or_else(|| {
        KeelError::Negotiation(format!("Unsupported kex algorithm '{}'", algorithms.kex))
    })?;
    let ctx = KexContext {
        client_version: peer_version.to_string(),
        server_version: our_version.to_string(),
        client_kexinit: peer_kexinit_bytes,
        server_kexinit: our_kexinit_bytes,
    };
    let mut kex = ServerKex::new(kex_algorithm, ctx, Arc::clone(&host_key));

    let outcome = loop {
        let payload = next_transport_payload(&mut stream, &mut inbound, &mut inbuf).await?;
        match kex.handle(&payload)? {
            KexStep::Send(msg) => write_packet(&mut stream, &mut outbound, &msg).await?,
            KexStep::Finished { send, outcome } => {
                if let Some(reply) = send {
                    write_packet(&mut stream, &mut outbound, &reply).await?;
                }
                break outcome;
            }
        }
    };

    state.transition(State::NewKeys)?;
    state.record_exchange_hash(&outcome.exchange_hash);
    let session_id = outcome.exchange_hash.clone();

    let (out_suites, in_suites) =
        derive_suites(&outcome, &session_id, &algorithms, Role::Server, false)?;

    write_packet(&mut stream, &mut outbound, &NewKeys::new().to_bytes()).await?;
    outbound.activate(out_suites.cipher, out_suites.mac, out_suites.compressor)?;

    let payload = next_transport_payload(&mut stream, &mut inbound, &mut inbuf).await?;
    NewKeys::from_bytes(&payload)?;
    inbound.activate(in_suites.cipher, in_suites.mac, in_suites.compressor)?;
    state.transition(State::Running)?;

    // Service request.
    let payload = next_transport_payload(&mut stream, &mut inbound, &mut inbuf).await?;
    let request = ServiceRequest::from_bytes(&payload)?;
    if request.service_name != USERAUTH_SERVICE {
        let disconnect = Disconnect::new(
            DisconnectReason::ServiceNotAvailable,
            &format!("service '{}' is not available", request.service_name),
        );
        write_packet(&mut stream, &mut outbound, &disconnect.to_bytes()).await?;
        return Err(KeelError::Protocol(format!(
            "Client requested unknown service '{}'",
            request.service_name
        )));
    }
    write_packet(
        &mut stream,
        &mut outbound,
        &ServiceAccept::new(USERAUTH_SERVICE).to_bytes(),
    )
    .await?;

    // Authentication: password backed by the policy map; every other
    // method fails with the continuation list.
    let mut attempts = AuthAttempts::new(policy.max_attempts);
    loop {
        let payload = next_transport_payload(&mut stream, &mut inbound, &mut inbuf).await?;
        let request = AuthRequest::from_bytes(&payload)?;

        if let Err(e) = attempts.record(request.method()) {
            let disconnect = Disconnect::new(
                DisconnectReason::NoMoreAuthMethodsAvailable,
                "too many authentication attempts",
            );
            write_packet(&mut stream, &mut outbound, &disconnect.to_bytes()).await?;
            return Err(e);
        }

        let accepted = match request.method() {
            AuthMethod::Password { password, .. } => {
                policy.check_password(request.user_name(), password)
            }
            _ => false,
        };

        if accepted {
            info!(user = request.user_name(), "authentication succeeded");
            write_packet(
                &mut stream,
                &mut outbound,
                &[MessageType::UserauthSuccess as u8],
            )
            .await?;
            break;
        }

        debug!(
            user = request.user_name(),
            method = request.method().name(),
            "authentication attempt failed"
        );
        let failure = AuthFailure::new(ServerAuthPolicy::continuations(), false);
        write_packet(&mut stream, &mut outbound, &failure.to_bytes()).await?;
    }
    outbound.on_authenticated();
    inbound.on_authenticated();

    Ok(Established {
        stream,
        outbound,
        inbound,
        inbuf,
        role: Role::Server,
        config,
        state,
        session_id,
        algorithms,
        our_version: our_version.to_string(),
        peer_version: peer_version.to_string(),
        verifier: None,
        host: String::new(),
        port: 0,
        host_key: Some(host_key),
        banners: Vec::new(),
    })
}

/// Exec handler: command in, (stdout, exit status) out.
pub type ExecHandler = Box<dyn FnMut(&str) -> (Vec<u8>, u32) + Send>;

struct ServeChannel {
    client_id: u32,
    /// Credit the client granted us.
    send_window: u64,
    /// Credit we granted the client.
    recv_window: u64,
    recv_initial: u64,
    client_max_packet: u32,
    sftp: Option<FrameBuffer>,
    close_sent: bool,
}

/// Serves the connection layer for one authenticated peer.
pub struct ServerConnection<S> {
    stream: BufReader<S>,
    outbound: PacketCodec,
    inbound: PacketCodec,
    inbuf: BytesMut,
    config: SshConfig,
    state: TransportState,
    session_id: Vec<u8>,
    our_version: String,
    peer_version: String,
    host_key: Arc<dyn HostKey>,
    channels: HashMap<u32, ServeChannel>,
    next_channel: u32,
    backlog: VecDeque<Vec<u8>>,
    exec: ExecHandler,
    filesystem: MemorySftpServer,
    exchanges: u32,
}

impl<S> ServerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Builds a connection service from a server-side handshake.
    pub fn new(
        established: Established<S>,
        exec: ExecHandler,
        filesystem: MemorySftpServer,
    ) -> KeelResult<Self> {
        let Established {
            stream,
            outbound,
            inbound,
            inbuf,
            role,
            config,
            state,
            session_id,
            our_version,
            peer_version,
            host_key,
            ..
        } = established;
        if role != Role::Server {
            return Err(KeelError::Config(
                "ServerConnection requires a server-side handshake".to_string(),
            ));
        }
        let host_key = host_key
            .ok_or_else(|| KeelError::Config("Server session without a host key".to_string()))?;

        Ok(Self {
            stream,
            outbound,
            inbound,
            inbuf,
            config,
            state,
            session_id,
            our_version,
            peer_version,
            host_key,
            channels: HashMap::new(),
            next_channel: 0,
            backlog: VecDeque::new(),
            exec,
            filesystem,
            exchanges: 1, // the handshake exchange
        })
    }

    /// Serves until the peer disconnects. Returns the number of key
    /// exchanges completed over the connection's lifetime.
    pub async fn serve(mut self) -> KeelResult<u32> {
        loop {
            let payload = match self.backlog.pop_front() {
                Some(payload) => payload,
                None => read_packet(&mut self.stream, &mut self.inbound, &mut self.inbuf).await?,
            };

            let Some(&number) = payload.first() else {
                return Err(KeelError::Protocol("Empty packet payload".to_string()));
            };

            match number {
                1 => {
                    let disconnect = Disconnect::from_bytes(&payload)?;
                    info!(reason = ?disconnect.reason, "client disconnected");
                    return Ok(self.exchanges);
                }
                2 | 3 | 4 => {}
                20 => self.rekey(payload).await?,
                90 => self.on_channel_open(&payload).await?,
                93 => {
                    let adjust = ChannelWindowAdjust::from_bytes(&payload)?;
                    if let Some(channel) = self.channels.get_mut(&adjust.recipient_channel) {
                        channel.send_window =
                            channel.send_window.saturating_add(u64::from(adjust.bytes_to_add));
                    }
                }
                94 => self.on_channel_data(&payload).await?,
                96 => {
                    let _ = ChannelEof::from_bytes(&payload)?;
                }
                97 => {
                    let close = ChannelClose::from_bytes(&payload)?;
                    if let Some(channel) = self.channels.remove(&close.recipient_channel) {
                        if !channel.close_sent {
                            let reply = ChannelClose::new(channel.client_id).to_bytes();
                            write_packet(&mut self.stream, &mut self.outbound, &reply).await?;
                        }
                    }
                }
                98 => self.on_channel_request(&payload).await?,
                _ => {
                    let sequence = self.inbound.sequence().wrapping_sub(1);
                    let reply = Unimplemented::new(sequence).to_bytes();
                    write_packet(&mut self.stream, &mut self.outbound, &reply).await?;
                }
            }
        }
    }

    /// Responder side of a client-initiated rekey.
    async fn rekey(&mut self, client_kexinit: Vec<u8>) -> KeelResult<()> {
        self.state.transition(State::RekeyRunning)?;
        let our_kexinit = KexInit::new(&self.config.algorithms);
        let our_kexinit_bytes = our_kexinit.to_bytes();
        write_packet(&mut self.stream, &mut self.outbound, &our_kexinit_bytes).await?;

        let peer_init = KexInit::from_bytes(&client_kexinit)?;
        let algorithms: AlgorithmSet = negotiate(&peer_init, &our_kexinit)?;
        let kex_algorithm = KexAlgorithm::from_name(&algorithms.kex).ok_or_else(|| {
            KeelError::Negotiation(format!("Unsupported kex algorithm '{}'", algorithms.kex))
        })?;
        let ctx = KexContext {
            client_version: self.peer_version.clone(),
            server_version: self.our_version.clone(),
            client_kexinit: client_kexinit.clone(),
            server_kexinit: our_kexinit_bytes,
        };
        let mut kex = ServerKex::new(kex_algorithm, ctx, Arc::clone(&self.host_key));

        let outcome = loop {
            let payload =
                next_transport_payload(&mut self.stream, &mut self.inbound, &mut self.inbuf)
                    .await?;
            match kex.handle(&payload)? {
                KexStep::Send(msg) => {
                    write_packet(&mut self.stream, &mut self.outbound, &msg).await?
                }
                KexStep::Finished { send, outcome } => {
                    if let Some(reply) = send {
                        write_packet(&mut self.stream, &mut self.outbound, &reply).await?;
                    }
                    break outcome;
                }
            }
        };

        // Session id stays pinned to the first exchange hash.
        self.state.record_exchange_hash(&outcome.exchange_hash);
        let (out_suites, in_suites) = derive_suites(
            &outcome,
            &self.session_id,
            &algorithms,
            Role::Server,
            true,
        )?;

        self.state.transition(State::NewKeys)?;
        write_packet(
            &mut self.stream,
            &mut self.outbound,
            &NewKeys::new().to_bytes(),
        )
        .await?;
        self.outbound
            .activate(out_suites.cipher, out_suites.mac, out_suites.compressor)?;

        loop {
            let payload =
                next_transport_payload(&mut self.stream, &mut self.inbound, &mut self.inbuf)
                    .await?;
            if payload.first() == Some(&(MessageType::NewKeys as u8)) {
                break;
            }
            return Err(KeelError::Protocol(format!(
                "Unexpected message {} while awaiting NEWKEYS",
                payload.first().copied().unwrap_or(0)
            )));
        }
        self.inbound
            .activate(in_suites.cipher, in_suites.mac, in_suites.compressor)?;
        self.state.transition(State::Running)?;
        self.exchanges += 1;
        info!(exchanges = self.exchanges, "rekey complete");
        Ok(())
    }

    async fn on_channel_open(&mut self, payload: &[u8]) -> KeelResult<()> {
        let open = ChannelOpen::from_bytes(payload)?;
        if open.channel_type != "session" {
            let failure = crate::ssh::connection::ChannelOpenFailure {
                recipient_channel: open.sender_channel,
                reason_code: 3, // unknown channel type
                description: format!("unsupported channel type '{}'", open.channel_type),
            };
            return write_packet(&mut self.stream, &mut self.outbound, &failure.to_bytes()).await;
        }

        let our_id = self.next_channel;
        self.next_channel += 1;
        let window = u64::from(self.config.window_size);
        self.channels.insert(
            our_id,
            ServeChannel {
                client_id: open.sender_channel,
                send_window: u64::from(open.initial_window_size),
                recv_window: window,
                recv_initial: window,
                client_max_packet: open.maximum_packet_size.max(1024),
                sftp: None,
                close_sent: false,
            },
        );

        let confirm = ChannelOpenConfirmation {
            recipient_channel: open.sender_channel,
            sender_channel: our_id,
            initial_window_size: self.config.window_size,
            maximum_packet_size: self.config.max_packet,
        };
        write_packet(&mut self.stream, &mut self.outbound, &confirm.to_bytes()).await
    }

    async fn on_channel_data(&mut self, payload: &[u8]) -> KeelResult<()> {
        let data = ChannelData::from_bytes(payload)?;
        let our_id = data.recipient_channel;

        let adjust = {
            let Some(channel) = self.channels.get_mut(&our_id) else {
                warn!(channel = our_id, "data for unknown channel");
                return Ok(());
            };
            let len = data.data.len() as u64;
            if len > channel.recv_window {
                return Err(KeelError::Protocol(format!(
                    "Client overran the receive window on channel {}",
                    our_id
                )));
            }
            channel.recv_window -= len;
            if channel.recv_window <= channel.recv_initial / 2 {
                let grant = (channel.recv_initial - channel.recv_window) as u32;
                channel.recv_window = channel.recv_initial;
                Some(
                    ChannelWindowAdjust {
                        recipient_channel: channel.client_id,
                        bytes_to_add: grant,
                    }
                    .to_bytes(),
                )
            } else {
                None
            }
        };
        if let Some(adjust) = adjust {
            write_packet(&mut self.stream, &mut self.outbound, &adjust).await?;
        }

        // SFTP frames may straddle data boundaries.
        let responses = {
            let Some(channel) = self.channels.get_mut(&our_id) else {
                return Ok(());
            };
            let Some(frames) = channel.sftp.as_mut() else {
                debug!(channel = our_id, "ignoring data outside a subsystem");
                return Ok(());
            };
            frames.push(&data.data);
            let mut responses = Vec::new();
            while let Some(frame) = frames.next_frame()? {
                responses.push(self.filesystem.handle_frame(&frame));
            }
            responses
        };

        for response in responses {
            self.send_channel_data(our_id, &response).await?;
        }
        Ok(())
    }

    async fn on_channel_request(&mut self, payload: &[u8]) -> KeelResult<()> {
        let request = ChannelRequest::from_bytes(payload)?;
        let our_id = request.recipient_channel;
        let Some(client_id) = self.channels.get(&our_id).map(|c| c.client_id) else {
            return Ok(());
        };

        match &request.request {
            ChannelRequestType::Exec { command } => {
                if request.want_reply {
                    let reply = ChannelSuccess::new(client_id).to_bytes();
                    write_packet(&mut self.stream, &mut self.outbound, &reply).await?;
                }
                let (stdout, status) = (self.exec)(command);
                self.send_channel_data(our_id, &stdout).await?;

                let exit = ChannelRequest::new(
                    client_id,
                    ChannelRequestType::ExitStatus { status },
                    false,
                );
                write_packet(&mut self.stream, &mut self.outbound, &exit.to_bytes()).await?;
                let eof = ChannelEof::new(client_id).to_bytes();
                write_packet(&mut self.stream, &mut self.outbound, &eof).await?;
                let close = ChannelClose::new(client_id).to_bytes();
                write_packet(&mut self.stream, &mut self.outbound, &close).await?;
                if let Some(channel) = self.channels.get_mut(&our_id) {
                    channel.close_sent = true;
                }
            }
            ChannelRequestType::Subsystem { name } if name == "sftp" => {
                if let Some(channel) = self.channels.get_mut(&our_id) {
                    channel.sftp = Some(FrameBuffer::new());
                }
                if request.want_reply {
                    let reply = ChannelSuccess::new(client_id).to_bytes();
                    write_packet(&mut self.stream, &mut self.outbound, &reply).await?;
                }
            }
            ChannelRequestType::Env { .. }
            | ChannelRequestType::PtyReq { .. }
            | ChannelRequestType::WindowChange { .. } => {
                if request.want_reply {
                    let reply = ChannelSuccess::new(client_id).to_bytes();
                    write_packet(&mut self.stream, &mut self.outbound, &reply).await?;
                }
            }
            other => {
                debug!(request = other.name(), "refusing channel request");
                if request.want_reply {
                    let reply = ChannelFailure::new(client_id).to_bytes();
                    write_packet(&mut self.stream, &mut self.outbound, &reply).await?;
                }
            }
        }
        Ok(())
    }

    /// Sends channel data, waiting for window credit as needed.
    async fn send_channel_data(&mut self, our_id: u32, data: &[u8]) -> KeelResult<()> {
        let mut offset = 0;
        while offset < data.len() {
            let (client_id, budget) = {
                let Some(channel) = self.channels.get_mut(&our_id) else {
                    return Err(KeelError::Channel("Channel is closed".to_string()));
                };
                let budget = channel
                    .send_window
                    .min(u64::from(channel.client_max_packet))
                    .min((data.len() - offset) as u64) as usize;
                if budget > 0 {
                    channel.send_window -= budget as u64;
                }
                (channel.client_id, budget)
            };

            if budget == 0 {
                self.await_window_credit(our_id).await?;
                continue;
            }

            let chunk = ChannelData::new(client_id, data[offset..offset + budget].to_vec());
            write_packet(&mut self.stream, &mut self.outbound, &chunk.to_bytes()).await?;
            offset += budget;
        }
        Ok(())
    }

    /// Blocks until the client adjusts the window of `our_id`,
    /// backlogging any unrelated packets for the main loop.
    async fn await_window_credit(&mut self, our_id: u32) -> KeelResult<()> {
        loop {
            let payload =
                read_packet(&mut self.stream, &mut self.inbound, &mut self.inbuf).await?;
            match payload.first() {
                Some(&2) | Some(&4) => continue,
                Some(&93) => {
                    let adjust = ChannelWindowAdjust::from_bytes(&payload)?;
                    if let Some(channel) = self.channels.get_mut(&adjust.recipient_channel) {
                        channel.send_window =
                            channel.send_window.saturating_add(u64::from(adjust.bytes_to_add));
                    }
                    if adjust.recipient_channel == our_id {
                        return Ok(());
                    }
                }
                Some(&1) => {
                    return Err(KeelError::Channel(
                        "Peer disconnected while a write awaited window credit".to_string(),
                    ))
                }
                _ => self.backlog.push_back(payload),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_password_check() {
        let mut policy = ServerAuthPolicy::new();
        policy.add_password("smx", "smx");
        assert!(policy.check_password("smx", "smx"));
        assert!(!policy.check_password("smx", "wrong"));
        assert!(!policy.check_password("nobody", "smx"));
        assert_eq!(policy.max_attempts, 6);
    }

    #[test]
    fn test_continuation_list() {
        let methods = ServerAuthPolicy::continuations();
        assert_eq!(methods, vec!["publickey".to_string(), "password".to_string()]);
    }
}
