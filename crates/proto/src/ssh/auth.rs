//! User authentication protocol (RFC 4252, RFC 4256).
//!
//! Methods: `none` (probe), `password`, `publickey` and
//! `keyboard-interactive`. The client engine walks the methods the
//! server advertises in its FAILURE continuations:
//!
//! - `publickey` probes with `has-sig = false` first; only when the
//!   server answers PK_OK is the signature computed (over the session
//!   id and the request) and the request re-sent with `has-sig = true`
//! - `keyboard-interactive` relays INFO_REQUEST prompts to a responder
//!   and answers with the same number of strings
//! - a FAILURE with the partial-success bit set counts the previous
//!   method as satisfied and continues with the returned name-list
//!
//! The server side tracks attempts against `max-auth-requests`;
//! exceeding the cap ends the session with
//! `SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE`.

use crate::ssh::codec;
use crate::ssh::hostkey::HostKey;
use crate::ssh::message::MessageType;
use bytes::BytesMut;
use keel_platform::{KeelError, KeelResult};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Default server-side attempt cap.
pub const DEFAULT_MAX_AUTH_ATTEMPTS: u32 = 6;

/// Authentication method carried in a USERAUTH_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication; probes the server's method list.
    None,
    /// Password authentication.
    Password {
        /// Plaintext password.
        password: String,
        /// Replacement password when answering PASSWD_CHANGEREQ.
        new_password: Option<String>,
    },
    /// Public key authentication.
    PublicKey {
        /// Algorithm name (e.g. "ssh-ed25519").
        algorithm: String,
        /// Public key blob.
        public_key: Vec<u8>,
        /// Signature; absent on the probe request.
        signature: Option<Vec<u8>>,
    },
    /// Keyboard-interactive authentication.
    KeyboardInteractive {
        /// Comma-separated submethod hints (usually empty).
        submethods: String,
    },
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password { .. } => "password",
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::KeyboardInteractive { .. } => "keyboard-interactive",
        }
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        if let AuthMethod::Password {
            password,
            new_password,
        } = self
        {
            password.zeroize();
            if let Some(new_password) = new_password {
                new_password.zeroize();
            }
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates a new authentication request.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        codec::put_byte(&mut buf, MessageType::UserauthRequest as u8);
        codec::put_string_utf8(&mut buf, &self.user_name);
        codec::put_string_utf8(&mut buf, &self.service_name);
        codec::put_string_utf8(&mut buf, self.method.name());

        match &self.method {
            AuthMethod::None => {}
            AuthMethod::Password {
                password,
                new_password,
            } => {
                codec::put_boolean(&mut buf, new_password.is_some());
                codec::put_string_utf8(&mut buf, password);
                if let Some(new_password) = new_password {
                    codec::put_string_utf8(&mut buf, new_password);
                }
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                codec::put_boolean(&mut buf, signature.is_some());
                codec::put_string_utf8(&mut buf, algorithm);
                codec::put_string(&mut buf, public_key);
                if let Some(signature) = signature {
                    codec::put_string(&mut buf, signature);
                }
            }
            AuthMethod::KeyboardInteractive { submethods } => {
                codec::put_string_utf8(&mut buf, ""); // language
                codec::put_string_utf8(&mut buf, submethods);
            }
        }

        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut offset = 0;
        let msg = codec::read_byte(data, &mut offset)?;
        if msg != MessageType::UserauthRequest as u8 {
            return Err(KeelError::Protocol(format!(
                "Invalid message type: expected 50 (SSH_MSG_USERAUTH_REQUEST), got {}",
                msg
            )));
        }

        let user_name = codec::read_string_utf8(data, &mut offset)?;
        let service_name = codec::read_string_utf8(data, &mut offset)?;
        let method_name = codec::read_string_utf8(data, &mut offset)?;

        let method = match method_name.as_str() {
            "none" => AuthMethod::None,
            "password" => {
                let changing = codec::read_boolean(data, &mut offset)?;
                let password = codec::read_string_utf8(data, &mut offset)?;
                let new_password = if changing {
                    Some(codec::read_string_utf8(data, &mut offset)?)
                } else {
                    None
                };
                AuthMethod::Password {
                    password,
                    new_password,
                }
            }
            "publickey" => {
                let has_signature = codec::read_boolean(data, &mut offset)?;
                let algorithm = codec::read_string_utf8(data, &mut offset)?;
                let public_key = codec::read_string(data, &mut offset)?;
                let signature = if has_signature {
                    Some(codec::read_string(data, &mut offset)?)
                } else {
                    None
                };
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            "keyboard-interactive" => {
                let _language = codec::read_string_utf8(data, &mut offset)?;
                let submethods = codec::read_string_utf8(data, &mut offset)?;
                AuthMethod::KeyboardInteractive { submethods }
            }
            other => {
                return Err(KeelError::Protocol(format!(
                    "Unsupported authentication method: '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// The bytes a publickey signature covers: the session id as a string,
/// then the USERAUTH_REQUEST with `has-sig = true` and no signature
/// field (RFC 4252 Section 7).
pub fn construct_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    codec::put_string(&mut buf, session_id);
    codec::put_byte(&mut buf, MessageType::UserauthRequest as u8);
    codec::put_string_utf8(&mut buf, user_name);
    codec::put_string_utf8(&mut buf, service_name);
    codec::put_string_utf8(&mut buf, "publickey");
    codec::put_boolean(&mut buf, true);
    codec::put_string_utf8(&mut buf, algorithm);
    codec::put_string(&mut buf, public_key);
    buf.to_vec()
}

/// SSH_MSG_USERAUTH_FAILURE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    methods_can_continue: Vec<String>,
    partial_success: bool,
}

impl AuthFailure {
    /// Creates a failure with the continuation list.
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods_can_continue: methods,
            partial_success,
        }
    }

    /// Returns the methods that can continue.
    pub fn methods_can_continue(&self) -> &[String] {
        &self.methods_can_continue
    }

    /// Returns the partial-success bit.
    pub fn partial_success(&self) -> bool {
        self.partial_success
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        codec::put_byte(&mut buf, MessageType::UserauthFailure as u8);
        codec::put_name_list(&mut buf, &self.methods_can_continue);
        codec::put_boolean(&mut buf, self.partial_success);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut offset = 0;
        let msg = codec::read_byte(data, &mut offset)?;
        if msg != MessageType::UserauthFailure as u8 {
            return Err(KeelError::Protocol(format!(
                "Invalid message type: expected 51 (SSH_MSG_USERAUTH_FAILURE), got {}",
                msg
            )));
        }
        Ok(Self {
            methods_can_continue: codec::read_name_list(data, &mut offset)?,
            partial_success: codec::read_boolean(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_USERAUTH_BANNER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    /// Banner text; surfaced to a callback, never auto-printed.
    pub message: String,
    /// Language tag.
    pub language: String,
}

impl AuthBanner {
    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut offset = 0;
        let msg = codec::read_byte(data, &mut offset)?;
        if msg != MessageType::UserauthBanner as u8 {
            return Err(KeelError::Protocol(format!(
                "Invalid message type: expected 53 (SSH_MSG_USERAUTH_BANNER), got {}",
                msg
            )));
        }
        Ok(Self {
            message: codec::read_string_utf8(data, &mut offset)?,
            language: codec::read_string_utf8(data, &mut offset)?,
        })
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        codec::put_byte(&mut buf, MessageType::UserauthBanner as u8);
        codec::put_string_utf8(&mut buf, &self.message);
        codec::put_string_utf8(&mut buf, &self.language);
        buf.to_vec()
    }
}

/// SSH_MSG_USERAUTH_PK_OK: the server accepts this key for signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPkOk {
    /// Echoed algorithm name.
    pub algorithm: String,
    /// Echoed public key blob.
    pub public_key: Vec<u8>,
}

impl AuthPkOk {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        codec::put_byte(&mut buf, MessageType::UserauthPkOk as u8);
        codec::put_string_utf8(&mut buf, &self.algorithm);
        codec::put_string(&mut buf, &self.public_key);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut offset = 0;
        let msg = codec::read_byte(data, &mut offset)?;
        if msg != MessageType::UserauthPkOk as u8 {
            return Err(KeelError::Protocol(format!(
                "Invalid message type: expected 60 (SSH_MSG_USERAUTH_PK_OK), got {}",
                msg
            )));
        }
        Ok(Self {
            algorithm: codec::read_string_utf8(data, &mut offset)?,
            public_key: codec::read_string(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_USERAUTH_PASSWD_CHANGEREQ (same number as PK_OK,
/// disambiguated by the method in flight).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdChangeReq {
    /// Server prompt.
    pub prompt: String,
    /// Language tag.
    pub language: String,
}

impl PasswdChangeReq {
    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut offset = 0;
        let msg = codec::read_byte(data, &mut offset)?;
        if msg != 60 {
            return Err(KeelError::Protocol(format!(
                "Invalid message type: expected 60 (SSH_MSG_USERAUTH_PASSWD_CHANGEREQ), got {}",
                msg
            )));
        }
        Ok(Self {
            prompt: codec::read_string_utf8(data, &mut offset)?,
            language: codec::read_string_utf8(data, &mut offset)?,
        })
    }
}

/// A single keyboard-interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoPrompt {
    /// Prompt text.
    pub prompt: String,
    /// Whether the response may be echoed.
    pub echo: bool,
}

/// SSH_MSG_USERAUTH_INFO_REQUEST (RFC 4256).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    /// Request name (may be empty).
    pub name: String,
    /// Instruction text (may be empty).
    pub instruction: String,
    /// Prompts to relay.
    pub prompts: Vec<InfoPrompt>,
}

impl InfoRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        codec::put_byte(&mut buf, 60);
        codec::put_string_utf8(&mut buf, &self.name);
        codec::put_string_utf8(&mut buf, &self.instruction);
        codec::put_string_utf8(&mut buf, ""); // language
        codec::put_uint32(&mut buf, self.prompts.len() as u32);
        for prompt in &self.prompts {
            codec::put_string_utf8(&mut buf, &prompt.prompt);
            codec::put_boolean(&mut buf, prompt.echo);
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut offset = 0;
        let msg = codec::read_byte(data, &mut offset)?;
        if msg != 60 {
            return Err(KeelError::Protocol(format!(
                "Invalid message type: expected 60 (SSH_MSG_USERAUTH_INFO_REQUEST), got {}",
                msg
            )));
        }
        let name = codec::read_string_utf8(data, &mut offset)?;
        let instruction = codec::read_string_utf8(data, &mut offset)?;
        let _language = codec::read_string_utf8(data, &mut offset)?;
        let count = codec::read_uint32(data, &mut offset)? as usize;
        if count > 64 {
            return Err(KeelError::Protocol(format!(
                "Unreasonable prompt count: {}",
                count
            )));
        }
        let mut prompts = Vec::with_capacity(count);
        for _ in 0..count {
            prompts.push(InfoPrompt {
                prompt: codec::read_string_utf8(data, &mut offset)?,
                echo: codec::read_boolean(data, &mut offset)?,
            });
        }
        Ok(Self {
            name,
            instruction,
            prompts,
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_RESPONSE (RFC 4256).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoResponse {
    /// Responses; must match the prompt count.
    pub responses: Vec<String>,
}

impl InfoResponse {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        codec::put_byte(&mut buf, MessageType::UserauthInfoResponse as u8);
        codec::put_uint32(&mut buf, self.responses.len() as u32);
        for response in &self.responses {
            codec::put_string_utf8(&mut buf, response);
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut offset = 0;
        let msg = codec::read_byte(data, &mut offset)?;
        if msg != MessageType::UserauthInfoResponse as u8 {
            return Err(KeelError::Protocol(format!(
                "Invalid message type: expected 61 (SSH_MSG_USERAUTH_INFO_RESPONSE), got {}",
                msg
            )));
        }
        let count = codec::read_uint32(data, &mut offset)? as usize;
        if count > 64 {
            return Err(KeelError::Protocol(format!(
                "Unreasonable response count: {}",
                count
            )));
        }
        let mut responses = Vec::with_capacity(count);
        for _ in 0..count {
            responses.push(codec::read_string_utf8(data, &mut offset)?);
        }
        Ok(Self { responses })
    }
}

/// Constant-time equality for credentials.
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Supplies the password for a user.
pub trait PasswordProvider: Send + Sync {
    /// Returns the password, or `None` to skip the method.
    fn password(&self, user: &str) -> Option<String>;
}

/// Supplies the user's key pairs, most preferred first.
///
/// A key pair exposes the same surface as a host key: a public blob
/// and a signing operation.
pub trait KeyPairProvider: Send + Sync {
    /// Returns the candidate keys in preference order.
    fn key_pairs(&self) -> Vec<Arc<dyn HostKey>>;
}

/// Answers keyboard-interactive prompt batches.
pub trait InteractivePromptResponder: Send + Sync {
    /// Returns one response per prompt, in order.
    fn respond(
        &self,
        name: &str,
        instruction: &str,
        prompts: &[InfoPrompt],
    ) -> KeelResult<Vec<String>>;
}

/// Credentials and responders available to the client engine.
#[derive(Default, Clone)]
pub struct AuthCredentials {
    /// Password source, if any.
    pub password: Option<Arc<dyn PasswordProvider>>,
    /// Key pair source, if any.
    pub keys: Option<Arc<dyn KeyPairProvider>>,
    /// Keyboard-interactive responder, if any.
    pub interactive: Option<Arc<dyn InteractivePromptResponder>>,
}

/// Next action decided by the client engine.
#[derive(Debug)]
pub enum AuthAction {
    /// Transmit this payload and keep reading.
    Send(Vec<u8>),
    /// The server accepted authentication.
    Success,
    /// Surface this banner and keep reading.
    Banner(String),
}

enum InFlight {
    NoneProbe,
    Password,
    PublicKeyProbe(Arc<dyn HostKey>),
    PublicKeySigned,
    KeyboardInteractive,
}

/// Client-side authentication engine.
///
/// Feed it every userauth-range payload; it decides the next request
/// until SUCCESS or until no viable method remains (a
/// [`KeelError::Auth`]).
pub struct ClientAuth {
    user_name: String,
    session_id: Vec<u8>,
    credentials: AuthCredentials,
    in_flight: InFlight,
    remaining_keys: Vec<Arc<dyn HostKey>>,
    keys_loaded: bool,
    password_spent: bool,
    interactive_spent: bool,
    methods_satisfied: Vec<String>,
}

impl ClientAuth {
    /// Creates the engine and returns the opening `none` probe.
    pub fn new(
        user_name: &str,
        session_id: &[u8],
        credentials: AuthCredentials,
    ) -> (Self, Vec<u8>) {
        let probe = AuthRequest::new(
            user_name,
            crate::ssh::service::CONNECTION_SERVICE,
            AuthMethod::None,
        )
        .to_bytes();

        (
            Self {
                user_name: user_name.to_string(),
                session_id: session_id.to_vec(),
                credentials,
                in_flight: InFlight::NoneProbe,
                remaining_keys: Vec::new(),
                keys_loaded: false,
                password_spent: false,
                interactive_spent: false,
                methods_satisfied: Vec::new(),
            },
            probe,
        )
    }

    /// Methods the server reported as satisfied via partial success.
    pub fn methods_satisfied(&self) -> &[String] {
        &self.methods_satisfied
    }

    /// Feeds one inbound userauth payload.
    ///
    /// # Errors
    ///
    /// [`KeelError::Auth`] when every permitted method is exhausted;
    /// [`KeelError::Protocol`] on malformed or out-of-place messages.
    pub fn handle(&mut self, payload: &[u8]) -> KeelResult<AuthAction> {
        if payload.is_empty() {
            return Err(KeelError::Protocol("Empty userauth payload".to_string()));
        }

        match payload[0] {
            52 => Ok(AuthAction::Success),
            53 => {
                let banner = AuthBanner::from_bytes(payload)?;
                Ok(AuthAction::Banner(banner.message))
            }
            51 => {
                let failure = AuthFailure::from_bytes(payload)?;
                if failure.partial_success() {
                    let satisfied = match &self.in_flight {
                        InFlight::NoneProbe => "none",
                        InFlight::Password => "password",
                        InFlight::PublicKeyProbe(_) | InFlight::PublicKeySigned => "publickey",
                        InFlight::KeyboardInteractive => "keyboard-interactive",
                    };
                    tracing::info!(method = satisfied, "partial success, continuing");
                    self.methods_satisfied.push(satisfied.to_string());
                }
                self.next_method(failure.methods_can_continue())
            }
            60 => match &self.in_flight {
                InFlight::PublicKeyProbe(key) => {
                    let key = Arc::clone(key);
                    let pk_ok = AuthPkOk::from_bytes(payload)?;
                    let blob = key.public_key_blob();
                    if pk_ok.public_key != blob {
                        return Err(KeelError::Protocol(
                            "PK_OK echoed a different public key".to_string(),
                        ));
                    }
                    let data = construct_signature_data(
                        &self.session_id,
                        &self.user_name,
                        crate::ssh::service::CONNECTION_SERVICE,
                        key.algorithm().name(),
                        &blob,
                    );
                    let signature = key.sign(&data)?;
                    let request = AuthRequest::new(
                        &self.user_name,
                        crate::ssh::service::CONNECTION_SERVICE,
                        AuthMethod::PublicKey {
                            algorithm: key.algorithm().name().to_string(),
                            public_key: blob,
                            signature: Some(signature),
                        },
                    );
                    self.in_flight = InFlight::PublicKeySigned;
                    Ok(AuthAction::Send(request.to_bytes()))
                }
                InFlight::Password => {
                    let change = PasswdChangeReq::from_bytes(payload)?;
                    tracing::warn!(prompt = %change.prompt, "server demands a password change");
                    // No replacement password available; the method is a
                    // dead end but others may remain.
                    self.password_spent = true;
                    self.next_method(&["publickey".into(), "keyboard-interactive".into()])
                }
                InFlight::KeyboardInteractive => {
                    let request = InfoRequest::from_bytes(payload)?;
                    let responder = self.credentials.interactive.as_ref().ok_or_else(|| {
                        KeelError::Protocol(
                            "INFO_REQUEST without a keyboard-interactive attempt".to_string(),
                        )
                    })?;
                    let responses =
                        responder.respond(&request.name, &request.instruction, &request.prompts)?;
                    if responses.len() != request.prompts.len() {
                        return Err(KeelError::Auth(format!(
                            "Responder returned {} answers for {} prompts",
                            responses.len(),
                            request.prompts.len()
                        )));
                    }
                    Ok(AuthAction::Send(InfoResponse { responses }.to_bytes()))
                }
                _ => Err(KeelError::Protocol(
                    "Unexpected message 60 outside a method exchange".to_string(),
                )),
            },
            other => Err(KeelError::Protocol(format!(
                "Unexpected message {} in userauth exchange",
                other
            ))),
        }
    }

    /// Picks the next viable method from the server's continuation
    /// list, in the server's order.
    fn next_method(&mut self, can_continue: &[String]) -> KeelResult<AuthAction> {
        for method in can_continue {
            match method.as_str() {
                "publickey" => {
                    if !self.keys_loaded {
                        self.keys_loaded = true;
                        if let Some(provider) = &self.credentials.keys {
                            self.remaining_keys = provider.key_pairs();
                            self.remaining_keys.reverse(); // pop() from the front
                        }
                    }
                    if let Some(key) = self.remaining_keys.pop() {
                        let request = AuthRequest::new(
                            &self.user_name,
                            crate::ssh::service::CONNECTION_SERVICE,
                            AuthMethod::PublicKey {
                                algorithm: key.algorithm().name().to_string(),
                                public_key: key.public_key_blob(),
                                signature: None,
                            },
                        );
                        self.in_flight = InFlight::PublicKeyProbe(key);
                        return Ok(AuthAction::Send(request.to_bytes()));
                    }
                }
                "password" => {
                    if self.password_spent {
                        continue;
                    }
                    if let Some(provider) = &self.credentials.password {
                        if let Some(password) = provider.password(&self.user_name) {
                            self.password_spent = true;
                            let request = AuthRequest::new(
                                &self.user_name,
                                crate::ssh::service::CONNECTION_SERVICE,
                                AuthMethod::Password {
                                    password,
                                    new_password: None,
                                },
                            );
                            self.in_flight = InFlight::Password;
                            return Ok(AuthAction::Send(request.to_bytes()));
                        }
                    }
                }
                "keyboard-interactive" => {
                    if self.interactive_spent || self.credentials.interactive.is_none() {
                        continue;
                    }
                    self.interactive_spent = true;
                    let request = AuthRequest::new(
                        &self.user_name,
                        crate::ssh::service::CONNECTION_SERVICE,
                        AuthMethod::KeyboardInteractive {
                            submethods: String::new(),
                        },
                    );
                    self.in_flight = InFlight::KeyboardInteractive;
                    return Ok(AuthAction::Send(request.to_bytes()));
                }
                _ => {}
            }
        }

        Err(KeelError::Auth(format!(
            "No viable authentication method remains (server offers {:?})",
            can_continue
        )))
    }
}

/// Server-side attempt tracking against `max-auth-requests`.
#[derive(Debug)]
pub struct AuthAttempts {
    limit: u32,
    used: u32,
}

impl AuthAttempts {
    /// Creates a tracker with the given cap.
    pub fn new(limit: u32) -> Self {
        Self { limit, used: 0 }
    }

    /// Records an attempt. `none` probes do not count.
    ///
    /// # Errors
    ///
    /// [`KeelError::Auth`] once the cap is exceeded; the session
    /// responds with `SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE`.
    pub fn record(&mut self, method: &AuthMethod) -> KeelResult<()> {
        if matches!(method, AuthMethod::None) {
            return Ok(());
        }
        self.used += 1;
        if self.used > self.limit {
            return Err(KeelError::Auth(format!(
                "Authentication attempts exceeded the limit of {}",
                self.limit
            )));
        }
        Ok(())
    }

    /// Attempts consumed so far.
    pub fn used(&self) -> u32 {
        self.used
    }
}

impl Default for AuthAttempts {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_AUTH_ATTEMPTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::hostkey::Ed25519HostKey;

    struct FixedPassword(String);
    impl PasswordProvider for FixedPassword {
        fn password(&self, _user: &str) -> Option<String> {
            Some(self.0.clone())
        }
    }

    struct FixedKeys(Vec<Arc<dyn HostKey>>);
    impl KeyPairProvider for FixedKeys {
        fn key_pairs(&self) -> Vec<Arc<dyn HostKey>> {
            self.0.clone()
        }
    }

    struct EchoResponder;
    impl InteractivePromptResponder for EchoResponder {
        fn respond(
            &self,
            _name: &str,
            _instruction: &str,
            prompts: &[InfoPrompt],
        ) -> KeelResult<Vec<String>> {
            Ok(prompts.iter().map(|p| format!("ans:{}", p.prompt)).collect())
        }
    }

    fn failure(methods: &[&str], partial: bool) -> Vec<u8> {
        AuthFailure::new(methods.iter().map(|s| s.to_string()).collect(), partial).to_bytes()
    }

    #[test]
    fn test_auth_request_password_round_trip() {
        let request = AuthRequest::new(
            "smx",
            "ssh-connection",
            AuthMethod::Password {
                password: "secret".to_string(),
                new_password: None,
            },
        );
        let parsed = AuthRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(parsed, request);
        assert_eq!(parsed.method().name(), "password");
    }

    #[test]
    fn test_auth_request_publickey_round_trip() {
        for signature in [None, Some(vec![9u8; 64])] {
            let request = AuthRequest::new(
                "smx",
                "ssh-connection",
                AuthMethod::PublicKey {
                    algorithm: "ssh-ed25519".to_string(),
                    public_key: vec![1, 2, 3],
                    signature,
                },
            );
            assert_eq!(AuthRequest::from_bytes(&request.to_bytes()).unwrap(), request);
        }
    }

    #[test]
    fn test_auth_request_keyboard_interactive_round_trip() {
        let request = AuthRequest::new(
            "smx",
            "ssh-connection",
            AuthMethod::KeyboardInteractive {
                submethods: String::new(),
            },
        );
        assert_eq!(AuthRequest::from_bytes(&request.to_bytes()).unwrap(), request);
    }

    #[test]
    fn test_failure_round_trip() {
        let failure = AuthFailure::new(
            vec!["publickey".to_string(), "password".to_string()],
            true,
        );
        let parsed = AuthFailure::from_bytes(&failure.to_bytes()).unwrap();
        assert_eq!(parsed, failure);
        assert!(parsed.partial_success());
    }

    #[test]
    fn test_info_request_round_trip() {
        let request = InfoRequest {
            name: "2FA".to_string(),
            instruction: "enter code".to_string(),
            prompts: vec![
                InfoPrompt {
                    prompt: "Code:".to_string(),
                    echo: false,
                },
                InfoPrompt {
                    prompt: "Confirm:".to_string(),
                    echo: true,
                },
            ],
        };
        assert_eq!(InfoRequest::from_bytes(&request.to_bytes()).unwrap(), request);
    }

    #[test]
    fn test_signature_data_layout() {
        let data = construct_signature_data(b"sess", "smx", "ssh-connection", "ssh-ed25519", b"kb");
        let mut offset = 0;
        assert_eq!(codec::read_string(&data, &mut offset).unwrap(), b"sess");
        assert_eq!(codec::read_byte(&data, &mut offset).unwrap(), 50);
        assert_eq!(
            codec::read_string_utf8(&data, &mut offset).unwrap(),
            "smx"
        );
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(b"same", b"same"));
        assert!(!constant_time_compare(b"same", b"diff"));
        assert!(!constant_time_compare(b"same", b"longer"));
    }

    #[test]
    fn test_client_auth_password_flow() {
        let credentials = AuthCredentials {
            password: Some(Arc::new(FixedPassword("smx".to_string()))),
            ..Default::default()
        };
        let (mut auth, probe) = ClientAuth::new("smx", b"session-id", credentials);
        assert_eq!(probe[0], 50);

        // Server rejects the probe, offering password.
        let action = auth.handle(&failure(&["password"], false)).unwrap();
        let AuthAction::Send(request) = action else {
            panic!("expected a password request");
        };
        let parsed = AuthRequest::from_bytes(&request).unwrap();
        assert_eq!(parsed.method().name(), "password");

        // Server accepts.
        assert!(matches!(
            auth.handle(&[52]).unwrap(),
            AuthAction::Success
        ));
    }

    #[test]
    fn test_client_auth_exhaustion() {
        let credentials = AuthCredentials {
            password: Some(Arc::new(FixedPassword("wrong".to_string()))),
            ..Default::default()
        };
        let (mut auth, _probe) = ClientAuth::new("smx", b"sid", credentials);

        auth.handle(&failure(&["password"], false)).unwrap();
        // Second failure: the password is spent, nothing else offered.
        let result = auth.handle(&failure(&["password"], false));
        assert!(matches!(result, Err(KeelError::Auth(_))));
    }

    #[test]
    fn test_client_auth_publickey_two_phase() {
        let key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
        let blob = key.public_key_blob();
        let credentials = AuthCredentials {
            keys: Some(Arc::new(FixedKeys(vec![Arc::clone(&key)]))),
            ..Default::default()
        };
        let (mut auth, _probe) = ClientAuth::new("smx", b"sid", credentials);

        // Probe phase: has-sig must be false.
        let AuthAction::Send(probe) = auth.handle(&failure(&["publickey"], false)).unwrap()
        else {
            panic!("expected publickey probe");
        };
        let parsed = AuthRequest::from_bytes(&probe).unwrap();
        let AuthMethod::PublicKey { signature, .. } = parsed.method() else {
            panic!("not publickey");
        };
        assert!(signature.is_none());

        // PK_OK: the signed request follows.
        let pk_ok = AuthPkOk {
            algorithm: "ssh-ed25519".to_string(),
            public_key: blob.clone(),
        };
        let AuthAction::Send(signed) = auth.handle(&pk_ok.to_bytes()).unwrap() else {
            panic!("expected signed request");
        };
        let parsed = AuthRequest::from_bytes(&signed).unwrap();
        let AuthMethod::PublicKey { signature, .. } = parsed.method() else {
            panic!("not publickey");
        };
        let signature = signature.as_ref().expect("signature present");

        // The signature verifies over the canonical data.
        let data = construct_signature_data(b"sid", "smx", "ssh-connection", "ssh-ed25519", &blob);
        assert!(crate::ssh::hostkey::verify_signature(&blob, &data, signature).unwrap());
    }

    #[test]
    fn test_client_auth_partial_success_chain() {
        let key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
        let credentials = AuthCredentials {
            keys: Some(Arc::new(FixedKeys(vec![key]))),
            password: Some(Arc::new(FixedPassword("pw".to_string()))),
            ..Default::default()
        };
        let (mut auth, _probe) = ClientAuth::new("smx", b"sid", credentials);

        // publickey first
        auth.handle(&failure(&["publickey", "password"], false))
            .unwrap();
        // partial success: publickey satisfied, password still needed
        let AuthAction::Send(request) = auth.handle(&failure(&["password"], true)).unwrap()
        else {
            panic!("expected password to follow partial success");
        };
        let parsed = AuthRequest::from_bytes(&request).unwrap();
        assert_eq!(parsed.method().name(), "password");
        assert_eq!(auth.methods_satisfied(), &["publickey".to_string()]);
    }

    #[test]
    fn test_client_auth_keyboard_interactive() {
        let credentials = AuthCredentials {
            interactive: Some(Arc::new(EchoResponder)),
            ..Default::default()
        };
        let (mut auth, _probe) = ClientAuth::new("smx", b"sid", credentials);

        let AuthAction::Send(request) = auth
            .handle(&failure(&["keyboard-interactive"], false))
            .unwrap()
        else {
            panic!("expected keyboard-interactive request");
        };
        assert_eq!(
            AuthRequest::from_bytes(&request).unwrap().method().name(),
            "keyboard-interactive"
        );

        let info = InfoRequest {
            name: String::new(),
            instruction: String::new(),
            prompts: vec![InfoPrompt {
                prompt: "Password:".to_string(),
                echo: false,
            }],
        };
        let AuthAction::Send(response) = auth.handle(&info.to_bytes()).unwrap() else {
            panic!("expected info response");
        };
        let parsed = InfoResponse::from_bytes(&response).unwrap();
        assert_eq!(parsed.responses, vec!["ans:Password:".to_string()]);
    }

    #[test]
    fn test_banner_surfaced() {
        let (mut auth, _probe) = ClientAuth::new("smx", b"sid", AuthCredentials::default());
        let banner = AuthBanner {
            message: "welcome".to_string(),
            language: String::new(),
        };
        assert!(matches!(
            auth.handle(&banner.to_bytes()).unwrap(),
            AuthAction::Banner(message) if message == "welcome"
        ));
    }

    #[test]
    fn test_attempts_cap() {
        let mut attempts = AuthAttempts::new(2);
        let password = AuthMethod::Password {
            password: "x".to_string(),
            new_password: None,
        };
        // The none probe never counts.
        attempts.record(&AuthMethod::None).unwrap();
        attempts.record(&password).unwrap();
        attempts.record(&password).unwrap();
        assert!(matches!(
            attempts.record(&password),
            Err(KeelError::Auth(_))
        ));
        assert_eq!(attempts.used(), 3);
    }
}
