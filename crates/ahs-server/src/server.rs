//! Core server: owns the key ring, the connect pipeline and the command
//! stack, and hands every upgraded socket to the configured application.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use ahs_core::ecc::generate_private_key;
use ahs_core::keystore::read_root_key;
use ahs_core::{AhsError, AhsResult, FileKeyStore, KeyRing, MemoryKeyStore, SessionCodec, TokenCodec};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::auth::{AttachSession, Authenticate, ConnectPipeline, TokenIdentityProvider};
use crate::channel_layer::{ChannelLayer, InMemoryChannelLayer};
use crate::commands::bookmarks::BookmarkStore;
use crate::commands::{self, CommandContext};
use crate::config::ServerConfig;
use crate::demux::{run_single, Demultiplexer, SocketAction, StreamApplication, CLOSE_INTERNAL_ERROR};
use crate::dispatch::{CommandConsumer, CommandDispatcher, CommandRegistry};
use crate::transport::websocket::{self, AcceptedSocket};

/// Environment variable holding the root key password.
pub const ROOT_KEY_PASSWORD_ENV: &str = "AHS_ROOT_KEY_PASSWORD";

/// What runs on top of an accepted socket.
enum SocketApp {
    Demultiplexed(Demultiplexer),
    Single(Arc<dyn StreamApplication>),
}

/// The ahs server instance.
pub struct AhsServer {
    config: ServerConfig,
    tokens: Arc<TokenCodec>,
    pipeline: ConnectPipeline,
    app: SocketApp,
}

impl AhsServer {
    /// Load the root key described by `config` and wire the server.
    pub async fn new(config: ServerConfig) -> AhsResult<Self> {
        let password = std::env::var(ROOT_KEY_PASSWORD_ENV).ok().map(String::into_bytes);
        let keys = load_keys(&config, password).await?;
        Self::with_keys(config, keys)
    }

    pub fn with_keys(config: ServerConfig, keys: KeyRing) -> AhsResult<Self> {
        let keys = Arc::new(keys);
        info!(
            curve = %keys.curve(),
            root = %ahs_core::short_fingerprint(&keys.root_fingerprint()),
            "key ring ready"
        );

        let tokens = Arc::new(TokenCodec::new(keys.signing_key()?, config.token_ttl));
        let sessions = SessionCodec::new(keys.session_key()?, config.session_max_age);
        let pipeline = ConnectPipeline::new()
            .stage(Authenticate::new(Arc::new(TokenIdentityProvider::new(tokens.clone()))))
            .stage(AttachSession::new(sessions));

        let mut registry = CommandRegistry::new(config.namespaces.iter().cloned());
        let ctx = CommandContext {
            bookmarks: Arc::new(BookmarkStore::new(config.categories.clone(), config.bookmarks.clone())),
            keys: keys.clone(),
        };
        commands::register_all(&mut registry, &ctx)?;

        let layer: Arc<dyn ChannelLayer> = Arc::new(InMemoryChannelLayer::new(config.channel_capacity));
        let dispatcher = Arc::new(CommandDispatcher::new(Arc::new(registry), layer.clone()));
        let consumer: Arc<dyn StreamApplication> = Arc::new(CommandConsumer::new(
            dispatcher,
            layer,
            config.require_authentication,
        ));

        let app = if config.demultiplex {
            let demux = Demultiplexer::new(config.close_timeout).with_capacity(config.channel_capacity);
            let demux = config
                .streams
                .iter()
                .fold(demux, |demux, name| demux.stream(name.clone(), consumer.clone()));
            SocketApp::Demultiplexed(demux)
        } else {
            SocketApp::Single(consumer)
        };

        Ok(Self {
            config,
            tokens,
            pipeline,
            app,
        })
    }

    pub fn tokens(&self) -> &Arc<TokenCodec> {
        &self.tokens
    }

    /// Listen and serve until the listener goes away.
    pub async fn run(self, tls_config: Option<Arc<rustls::ServerConfig>>) -> AhsResult<()> {
        let server = Arc::new(self);
        let (_addr, conns) = server.listen(tls_config).await?;
        server.serve(conns).await;
        Ok(())
    }

    /// Bind the WebSocket listener.
    pub async fn listen(
        &self,
        tls_config: Option<Arc<rustls::ServerConfig>>,
    ) -> AhsResult<(SocketAddr, mpsc::Receiver<AcceptedSocket>)> {
        let ip: IpAddr = self
            .config
            .bind
            .parse()
            .map_err(|e| AhsError::Other(format!("invalid bind address '{}': {e}", self.config.bind)))?;
        let addr = SocketAddr::new(ip, self.config.port);

        let (addr, conns) =
            websocket::start_listener(addr, tls_config.map(TlsAcceptor::from), self.config.max_frame_bytes)
                .await?;

        let streams = match &self.app {
            SocketApp::Demultiplexed(demux) => demux.stream_names().join(","),
            SocketApp::Single(_) => "-".to_string(),
        };
        info!(
            addr = %addr,
            tls = self.config.tls_enabled(),
            streams = %streams,
            require_authentication = self.config.require_authentication,
            stages = ?self.pipeline.stage_names(),
            "ahs-server ready"
        );
        Ok((addr, conns))
    }

    /// Accept loop: one task per connection.
    pub async fn serve(self: Arc<Self>, mut conns: mpsc::Receiver<AcceptedSocket>) {
        while let Some(socket) = conns.recv().await {
            let server = self.clone();
            tokio::spawn(async move { server.handle(socket).await });
        }
    }

    async fn handle(&self, socket: AcceptedSocket) {
        let AcceptedSocket {
            mut scope,
            events,
            actions,
        } = socket;

        if let Err(e) = self.pipeline.run(&mut scope).await {
            warn!(path = %scope.path, error = %e, "connect pipeline failed");
            let _ = actions.send(SocketAction::Close { code: CLOSE_INTERNAL_ERROR }).await;
            return;
        }

        let remote = scope.remote.map(|a| a.to_string()).unwrap_or_default();
        info!(
            remote = %remote,
            path = %scope.path,
            owner = scope.identity.owner().unwrap_or("anonymous"),
            "connection established"
        );

        let scope = Arc::new(scope);
        let result = match &self.app {
            SocketApp::Demultiplexed(demux) => demux.run(scope, events, actions).await,
            SocketApp::Single(app) => {
                run_single(
                    app.clone(),
                    scope,
                    events,
                    actions,
                    self.config.close_timeout,
                    self.config.channel_capacity,
                )
                .await
            }
        };
        match result {
            Ok(()) => debug!(remote = %remote, "connection finished"),
            Err(e) => warn!(remote = %remote, error = %e, "connection ended with error"),
        }
    }
}

/// Root key plus key store, per config. `password` decrypts the root key
/// and wraps persisted private halves.
async fn load_keys(config: &ServerConfig, password: Option<Vec<u8>>) -> AhsResult<KeyRing> {
    if config.ephemeral_keys {
        warn!("using an ephemeral root key, issued tokens will not survive a restart");
        return Ok(KeyRing::new(
            generate_private_key(config.curve),
            Arc::new(MemoryKeyStore::new()),
        ));
    }

    let root = read_root_key(&config.root_key_path, password.clone())
        .await
        .map_err(|e| {
            AhsError::Other(format!(
                "cannot load root key {}: {e}",
                config.root_key_path.display()
            ))
        })?;
    if root.curve() != config.curve {
        return Err(AhsError::UnsupportedCurve(format!(
            "root key is {} but config expects {}",
            root.curve(),
            config.curve
        )));
    }

    let store = FileKeyStore::open(config.key_store_path.clone()).await?;
    info!(path = %config.key_store_path.display(), "opened key store");
    let ring = KeyRing::new(root, Arc::new(store));
    Ok(match password {
        Some(pw) => ring.with_wrap_password(pw, config.kdf_iterations),
        None => {
            warn!("{ROOT_KEY_PASSWORD_ENV} not set, derived private keys will not be persisted");
            ring
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigFile, Overrides};
    use ahs_core::keystore::write_root_key;
    use ahs_core::Curve;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Message;

    const WAIT: Duration = Duration::from_secs(5);

    fn overrides() -> Overrides {
        Overrides {
            port: Some(0),
            bind: Some("127.0.0.1".into()),
            curve: Some("secp256r1".into()),
            ephemeral_keys: true,
            ..Default::default()
        }
    }

    async fn start(file: ConfigFile, overrides: Overrides) -> (SocketAddr, Arc<AhsServer>) {
        let config = ServerConfig::resolve(file, overrides).unwrap();
        let server = Arc::new(AhsServer::new(config).await.unwrap());
        let (addr, conns) = server.listen(None).await.unwrap();
        tokio::spawn(server.clone().serve(conns));
        (addr, server)
    }

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn ping_over_demultiplexed_socket() {
        let (addr, server) = start(ConfigFile::default(), overrides()).await;
        let token = server.tokens().create("7", None).unwrap();

        let mut request = format!("ws://{addr}/ws/").into_client_request().unwrap();
        request
            .headers_mut()
            .insert("authorization", format!("Bearer {}", token.as_str()).parse().unwrap());
        let (mut ws, _) = tokio::time::timeout(WAIT, tokio_tungstenite::connect_async(request))
            .await
            .unwrap()
            .unwrap();

        let frame = json!({
            "stream": "commands",
            "payload": {"type": "command.request", "data": {"app": "system", "cmd": "whoami", "uniqueId": 7}},
        });
        ws.send(Message::Text(frame.to_string().into())).await.unwrap();

        let reply = next_json(&mut ws).await;
        assert_eq!(reply["stream"], "commands");
        assert_eq!(reply["payload"]["cmd"], "whoami");
        assert_eq!(reply["payload"]["uniqueId"], 7);
        assert_eq!(reply["payload"]["data"]["owner"], "7");
    }

    #[tokio::test]
    async fn anonymous_socket_is_refused() {
        let (addr, _server) = start(ConfigFile::default(), overrides()).await;
        let (mut ws, _) = tokio::time::timeout(WAIT, tokio_tungstenite::connect_async(format!("ws://{addr}/ws/")))
            .await
            .unwrap()
            .unwrap();
        match tokio::time::timeout(WAIT, ws.next()).await.unwrap() {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(u16::from(frame.code), 4403),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn single_app_when_not_demultiplexing() {
        let mut file = ConfigFile::default();
        file.channels.demultiplex = false;
        let mut ov = overrides();
        ov.allow_anonymous = true;
        let (addr, _server) = start(file, ov).await;

        let (mut ws, _) = tokio::time::timeout(WAIT, tokio_tungstenite::connect_async(format!("ws://{addr}/ws/")))
            .await
            .unwrap()
            .unwrap();
        let frame = json!({"type": "command.request", "data": {"app": "system", "cmd": "ping", "uniqueId": "a"}});
        ws.send(Message::Text(frame.to_string().into())).await.unwrap();

        let reply = next_json(&mut ws).await;
        assert_eq!(reply, json!({"app": "system", "cmd": "ping", "data": "pong", "uniqueId": "a"}));
    }

    #[tokio::test]
    async fn loads_root_key_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let root_path = dir.path().join("root.private.pem");
        let root = generate_private_key(Curve::Secp256r1);
        write_root_key(&root_path, &root, b"pw".to_vec(), 1_000).await.unwrap();

        let mut file = ConfigFile::default();
        file.crypto.curve = "secp256r1".into();
        file.crypto.root_key = root_path.display().to_string();
        file.crypto.key_store = dir.path().join("keys").display().to_string();
        let config = ServerConfig::resolve(file, Overrides::default()).unwrap();

        assert!(load_keys(&config, None).await.is_err());
        assert!(load_keys(&config, Some(b"nope".to_vec())).await.is_err());

        let ring = load_keys(&config, Some(b"pw".to_vec())).await.unwrap();
        assert_eq!(ring.root(), &root);
        ring.owner_key("7", 1).await.unwrap();
        assert!(dir.path().join("keys").exists());

        let mut wrong_curve = config.clone();
        wrong_curve.curve = Curve::Secp521r1;
        assert!(matches!(
            load_keys(&wrong_curve, Some(b"pw".to_vec())).await,
            Err(AhsError::UnsupportedCurve(_))
        ));
    }
}
