//! End-to-end tests: client engine against the server engine over an
//! in-memory duplex stream.
//!
//! These cover the full protocol flow: identification exchange, key
//! exchange with signature verification, authentication, channel
//! operations, SFTP transfers and mid-transfer rekeying.

use keel_platform::{KeelError, KeelResult};
use keel_proto::ssh::auth::{AuthCredentials, PasswordProvider};
use keel_proto::ssh::config::SshConfig;
use keel_proto::ssh::connection::ChannelRequestType;
use keel_proto::ssh::hostkey::{AcceptAnyHostKey, EcdsaHostKey, Ed25519HostKey, HostKey, HostKeyAlgorithm};
use keel_proto::ssh::kex::AlgorithmPreferences;
use keel_proto::ssh::message::DisconnectReason;
use keel_proto::ssh::server::{server_handshake, ServerAuthPolicy, ServerConnection};
use keel_proto::ssh::session::{client_handshake, ChannelEvent, SshSession};
use keel_proto::ssh::sftp::memfs::MemorySftpServer;
use keel_proto::ssh::sftp::SftpClient;
use keel_proto::ssh::KeyPairProvider;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(60);

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

fn password_credentials(password: &str) -> AuthCredentials {
    AuthCredentials {
        password: Some(Arc::new(FixedPassword(password.to_string()))),
        ..Default::default()
    }
}

fn default_policy() -> ServerAuthPolicy {
    let mut policy = ServerAuthPolicy::new();
    policy.add_password("smx", "smx");
    policy
}

/// Spawns a server that serves one connection and reports its key
/// exchange count.
fn spawn_server(
    stream: tokio::io::DuplexStream,
    config: SshConfig,
    host_key: Arc<dyn HostKey>,
    policy: ServerAuthPolicy,
    filesystem: MemorySftpServer,
) -> JoinHandle<KeelResult<u32>> {
    tokio::spawn(async move {
        let established = server_handshake(stream, config, host_key, &policy).await?;
        let connection = ServerConnection::new(
            established,
            Box::new(|command: &str| {
                if let Some(rest) = command.strip_prefix("echo ") {
                    (format!("{}\n", rest).into_bytes(), 0)
                } else {
                    (Vec::new(), 127)
                }
            }),
            filesystem,
        )?;
        connection.serve().await
    })
}

async fn connect_client(
    stream: tokio::io::DuplexStream,
    config: SshConfig,
    credentials: AuthCredentials,
) -> KeelResult<SshSession> {
    let established = client_handshake(
        stream,
        config,
        "loopback.test",
        22,
        Arc::new(AcceptAnyHostKey),
        "smx",
        credentials,
    )
    .await?;
    Ok(SshSession::start(established))
}

#[tokio::test]
async fn test_exec_echo_over_constrained_algorithms() {
    // The server offers exactly one algorithm per slot.
    let mut server_config = SshConfig::default();
    server_config.algorithms = AlgorithmPreferences {
        kex: vec!["ecdh-sha2-nistp256".to_string()],
        host_keys: vec!["ecdsa-sha2-nistp256".to_string()],
        ciphers: vec!["aes128-ctr".to_string()],
        macs: vec!["hmac-sha2-256".to_string()],
        compression: vec!["none".to_string()],
    };
    let host_key: Arc<dyn HostKey> =
        Arc::new(EcdsaHostKey::generate(HostKeyAlgorithm::EcdsaP256).unwrap());

    let (client_stream, server_stream) = tokio::io::duplex(1 << 20);
    let server = spawn_server(
        server_stream,
        server_config,
        host_key,
        default_policy(),
        MemorySftpServer::new(),
    );

    let result = timeout(TEST_TIMEOUT, async {
        let session = connect_client(
            client_stream,
            SshConfig::default(),
            password_credentials("smx"),
        )
        .await?;
        assert_eq!(session.algorithms().kex, "ecdh-sha2-nistp256");
        assert_eq!(session.algorithms().cipher_c2s, "aes128-ctr");
        assert_eq!(session.algorithms().mac_c2s, "hmac-sha2-256");

        let mut channel = session.open_session_channel(None).await?;
        let accepted = channel
            .request(
                ChannelRequestType::Exec {
                    command: "echo hello".to_string(),
                },
                true,
                Some(Duration::from_secs(10)),
            )
            .await?;
        assert!(accepted);

        let mut stdout = Vec::new();
        let mut exit_status = None;
        while let Some(event) = channel.next_event().await {
            match event {
                ChannelEvent::Data(data) => stdout.extend_from_slice(&data),
                ChannelEvent::ExitStatus(status) => exit_status = Some(status),
                ChannelEvent::Closed => break,
                _ => {}
            }
        }
        assert_eq!(stdout, b"hello\n");
        assert_eq!(exit_status, Some(0));

        session
            .disconnect(DisconnectReason::ByApplication, "done")
            .await;
        Ok::<_, KeelError>(())
    })
    .await
    .expect("test timed out");
    result.unwrap();

    let exchanges = server.await.unwrap().unwrap();
    assert_eq!(exchanges, 1);
}

#[tokio::test]
async fn test_password_auth_success_and_failure() {
    // Correct password succeeds.
    let (client_stream, server_stream) = tokio::io::duplex(1 << 20);
    let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
    let server = spawn_server(
        server_stream,
        SshConfig::default(),
        Arc::clone(&host_key),
        default_policy(),
        MemorySftpServer::new(),
    );

    timeout(TEST_TIMEOUT, async {
        let session = connect_client(
            client_stream,
            SshConfig::default(),
            password_credentials("smx"),
        )
        .await
        .unwrap();
        session
            .disconnect(DisconnectReason::ByApplication, "done")
            .await;
    })
    .await
    .expect("test timed out");
    let _ = server.await.unwrap();

    // Wrong password exhausts the method list and fails with Auth.
    let (client_stream, server_stream) = tokio::io::duplex(1 << 20);
    let server = spawn_server(
        server_stream,
        SshConfig::default(),
        host_key,
        default_policy(),
        MemorySftpServer::new(),
    );

    timeout(TEST_TIMEOUT, async {
        let result = connect_client(
            client_stream,
            SshConfig::default(),
            password_credentials("wrong"),
        )
        .await;
        assert!(matches!(result, Err(KeelError::Auth(_))));
    })
    .await
    .expect("test timed out");
    server.abort();
}

#[tokio::test]
async fn test_unknown_publickey_then_valid_password() {
    let (client_stream, server_stream) = tokio::io::duplex(1 << 20);
    let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
    let server = spawn_server(
        server_stream,
        SshConfig::default(),
        host_key,
        default_policy(),
        MemorySftpServer::new(),
    );

    // The client offers a key the server does not know, then falls
    // back to the valid password.
    let user_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
    let credentials = AuthCredentials {
        keys: Some(Arc::new(FixedKeys(vec![user_key]))),
        password: Some(Arc::new(FixedPassword("smx".to_string()))),
        ..Default::default()
    };

    timeout(TEST_TIMEOUT, async {
        let session = connect_client(client_stream, SshConfig::default(), credentials)
            .await
            .unwrap();
        session
            .disconnect(DisconnectReason::ByApplication, "done")
            .await;
    })
    .await
    .expect("test timed out");
    let _ = server.await.unwrap();
}

#[tokio::test]
async fn test_no_common_algorithm_fails_negotiation() {
    let mut server_config = SshConfig::default();
    server_config.algorithms.ciphers = vec!["aes256-ctr".to_string()];
    let mut client_config = SshConfig::default();
    client_config.algorithms.ciphers = vec!["aes128-cbc".to_string()];

    let (client_stream, server_stream) = tokio::io::duplex(1 << 20);
    let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
    let server = spawn_server(
        server_stream,
        server_config,
        host_key,
        default_policy(),
        MemorySftpServer::new(),
    );

    timeout(TEST_TIMEOUT, async {
        let result = connect_client(
            client_stream,
            client_config,
            password_credentials("smx"),
        )
        .await;
        assert!(matches!(result, Err(KeelError::Negotiation(_))));
    })
    .await
    .expect("test timed out");
    server.abort();
}

async fn start_sftp(session: &SshSession) -> SftpClient {
    let channel = session
        .open_session_channel(Some(Duration::from_secs(10)))
        .await
        .unwrap();
    SftpClient::start(channel, 32 * 1024, 32 * 1024, Some(Duration::from_secs(30)))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_sftp_put_and_get_one_mebibyte() {
    let (client_stream, server_stream) = tokio::io::duplex(1 << 20);
    let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
    let server = spawn_server(
        server_stream,
        SshConfig::default(),
        host_key,
        default_policy(),
        MemorySftpServer::new(),
    );

    timeout(TEST_TIMEOUT, async {
        let session = connect_client(
            client_stream,
            SshConfig::default(),
            password_credentials("smx"),
        )
        .await
        .unwrap();
        let sftp = start_sftp(&session).await;

        let payload: Vec<u8> = (0..1_048_576u32).map(|i| (i * 37 % 239) as u8).collect();

        let mut writer = sftp.writer("/upload.bin").await.unwrap();
        writer.write(&payload).await.unwrap();
        writer.close().await.unwrap();

        let attrs = sftp.stat("/upload.bin").await.unwrap();
        assert_eq!(attrs.size, Some(1_048_576));

        let mut reader = sftp.reader("/upload.bin").await.unwrap();
        let back = reader.read_to_end().await.unwrap();
        assert_eq!(back, payload);

        session
            .disconnect(DisconnectReason::ByApplication, "done")
            .await;
    })
    .await
    .expect("test timed out");
    let _ = server.await.unwrap();
}

#[tokio::test]
async fn test_sftp_readdir_over_full_stack() {
    let mut filesystem = MemorySftpServer::new();
    let mut expected = std::collections::HashSet::new();
    for i in 0..300 {
        let name = format!("entry-{:03}", i);
        filesystem.add_file(&format!("/dir/{}", name), vec![b'x']);
        expected.insert(name);
    }

    let (client_stream, server_stream) = tokio::io::duplex(1 << 20);
    let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
    let server = spawn_server(
        server_stream,
        SshConfig::default(),
        host_key,
        default_policy(),
        filesystem,
    );

    timeout(TEST_TIMEOUT, async {
        let session = connect_client(
            client_stream,
            SshConfig::default(),
            password_credentials("smx"),
        )
        .await
        .unwrap();
        let sftp = start_sftp(&session).await;

        let mut iter = sftp.read_dir("/dir").await.unwrap();
        let mut seen = std::collections::HashSet::new();
        while let Some(entry) = iter.next_entry().await.unwrap() {
            assert!(seen.insert(entry.filename.clone()), "duplicate entry");
        }
        assert_eq!(seen, expected);

        session
            .disconnect(DisconnectReason::ByApplication, "done")
            .await;
    })
    .await
    .expect("test timed out");
    let _ = server.await.unwrap();
}

#[tokio::test]
async fn test_rekey_mid_transfer_preserves_data_and_session_id() {
    // Force a rekey every 256 KiB on the client; the 2 MiB transfer
    // must cross the threshold several times.
    let mut client_config = SshConfig::default();
    client_config.rekey_bytes = 256 * 1024;

    let (client_stream, server_stream) = tokio::io::duplex(1 << 20);
    let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
    let server = spawn_server(
        server_stream,
        SshConfig::default(),
        host_key,
        default_policy(),
        MemorySftpServer::new(),
    );

    timeout(TEST_TIMEOUT, async {
        let session = connect_client(
            client_stream,
            client_config,
            password_credentials("smx"),
        )
        .await
        .unwrap();
        let session_id = session.session_id().to_vec();
        let sftp = start_sftp(&session).await;

        let payload: Vec<u8> = (0..(2 * 1_048_576u32)).map(|i| (i % 255) as u8).collect();

        let mut writer = sftp.writer("/big.bin").await.unwrap();
        writer.write(&payload).await.unwrap();
        writer.close().await.unwrap();

        let mut reader = sftp.reader("/big.bin").await.unwrap();
        let back = reader.read_to_end().await.unwrap();
        assert_eq!(back, payload);

        // The session id never changes across rekeys.
        assert_eq!(session.session_id(), &session_id[..]);

        session
            .disconnect(DisconnectReason::ByApplication, "done")
            .await;
    })
    .await
    .expect("test timed out");

    let exchanges = server.await.unwrap().unwrap();
    assert!(
        exchanges >= 2,
        "expected at least one rekey, saw {} exchanges",
        exchanges
    );
}

#[tokio::test]
async fn test_explicit_rekey_request() {
    let (client_stream, server_stream) = tokio::io::duplex(1 << 20);
    let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
    let server = spawn_server(
        server_stream,
        SshConfig::default(),
        host_key,
        default_policy(),
        MemorySftpServer::new(),
    );

    timeout(TEST_TIMEOUT, async {
        let session = connect_client(
            client_stream,
            SshConfig::default(),
            password_credentials("smx"),
        )
        .await
        .unwrap();
        let sftp = start_sftp(&session).await;

        // Exercise traffic, rekey explicitly, then keep using the
        // session: operations after the rekey must still work.
        let mut writer = sftp.writer("/before.txt").await.unwrap();
        writer.write(b"before rekey").await.unwrap();
        writer.close().await.unwrap();

        session.request_rekey();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut reader = sftp.reader("/before.txt").await.unwrap();
        assert_eq!(reader.read_to_end().await.unwrap(), b"before rekey");

        session
            .disconnect(DisconnectReason::ByApplication, "done")
            .await;
    })
    .await
    .expect("test timed out");

    let exchanges = server.await.unwrap().unwrap();
    assert_eq!(exchanges, 2);
}
