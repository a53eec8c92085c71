//! The operator side of the tunnel: a local HTTPS endpoint that kubectl
//! talks to as if it were the cluster's API server.
//!
//! ```text
//! daemon/
//!   mod.rs          TLS listener, router, shared state, shutdown
//!   auth.rs         localhost token + audit metadata
//!   ingress.rs      request classification and dispatch
//!   registry.rs     live sessions by request id
//!   datachannel.rs  keysplitting client for one session
//!   actions/        restapi, log/watch streams, exec
//! ```
//!
//! Each local request is one session: a fresh request id, a fresh relay
//! websocket and keysplitting engine, and exactly one action.

pub mod actions;
pub mod auth;
pub mod datachannel;
pub mod ingress;
pub mod registry;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{middleware, Extension, Router};
use futures_util::FutureExt;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::action::ActionKind;
use crate::config::{DaemonConfig, TransportConfig};
use crate::error::{Error, Result};
use crate::keysplitting::{DaemonKeysplitting, IdentitySource};
use crate::transport::target::daemon_target;
use crate::transport::{ChannelOpener, HubOptions, Websocket};

use auth::LocalhostToken;
use datachannel::DataChannel;
use registry::{Registration, SessionRegistry};

pub const DAEMON_HUB: &str = "/api/v1/hub/kube";

/// Shared by every request handler.
#[derive(Clone)]
pub struct DaemonState {
    /// Cluster the sessions target; goes into every Syn and Data.
    pub target_id: String,
    pub identity: IdentitySource,
    pub opener: ChannelOpener<String>,
    pub registry: SessionRegistry,
    pub channel_capacity: usize,
    /// How long an exec waits for its sub-streams before giving up.
    pub exec_stream_timeout: Duration,
    pub shutdown: CancellationToken,
}

/// A running session. Dropping it closes the data channel and unregisters.
pub struct Session {
    pub request_id: String,
    pub channel: DataChannel,
    _registration: Registration,
}

impl DaemonState {
    pub fn new(
        config: &DaemonConfig,
        transport_config: TransportConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            target_id: config.assume_cluster_id.clone(),
            identity: IdentitySource::ConfigFile(config.config_path.clone()),
            channel_capacity: transport_config.channel_capacity,
            opener: relay_opener(config, transport_config),
            registry: SessionRegistry::new(),
            exec_stream_timeout: actions::exec::STREAM_TIMEOUT,
            shutdown,
        }
    }

    /// Connect a data channel for `request_id` and send its Syn.
    pub async fn open_session(&self, request_id: &str, kind: ActionKind) -> Result<Session> {
        let cancel = self.shutdown.child_token();
        let transport = (self.opener)(request_id.to_string(), cancel.clone()).await?;
        let registration = self.registry.register(request_id, kind, cancel.clone());
        let channel = DataChannel::start(
            transport,
            DaemonKeysplitting::new(self.target_id.clone(), self.identity.clone()),
            request_id,
            kind.start_path(),
            self.channel_capacity,
            cancel,
        );
        Ok(Session {
            request_id: request_id.to_string(),
            channel,
            _registration: registration,
        })
    }
}

/// One relay websocket per session, never reconnected.
pub fn relay_opener(config: &DaemonConfig, transport_config: TransportConfig) -> ChannelOpener<String> {
    let options = HubOptions {
        service_url: config.service_url.clone(),
        hub_endpoint: DAEMON_HUB.to_string(),
        params: vec![
            ("session_id".to_string(), config.session_id.clone()),
            ("assume_role".to_string(), config.assume_role.clone()),
            ("assume_cluster_id".to_string(), config.assume_cluster_id.clone()),
            ("environment_id".to_string(), config.environment_id.clone()),
        ],
        headers: vec![("Authorization".to_string(), config.auth_header.clone())],
        auto_reconnect: false,
        challenge: None,
    };
    Arc::new(move |request_id: String, cancel: CancellationToken| {
        debug!(request_id = %request_id, "Daemon: opening data channel");
        let options = options.clone();
        let config = transport_config.clone();
        async move {
            Websocket::new(options, daemon_target, config)?
                .connect(cancel)
                .await
        }
        .boxed()
    })
}

pub fn router(state: DaemonState, localhost_token: &str) -> Router {
    Router::new()
        .fallback(ingress::handle)
        .layer(middleware::from_fn(auth::require_localhost_token))
        .layer(Extension(LocalhostToken(localhost_token.to_string())))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// rustls server config from PEM files, built on the ring provider.
pub fn tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = CertificateDer::pem_file_iter(cert_path)
        .and_then(|certs| certs.collect::<std::result::Result<Vec<_>, _>>())
        .map_err(|e| Error::startup(format!("could not read {}: {e}", cert_path.display())))?;
    if certs.is_empty() {
        return Err(Error::startup(format!(
            "no certificates in {}",
            cert_path.display()
        )));
    }
    let key = PrivateKeyDer::from_pem_file(key_path)
        .map_err(|e| Error::startup(format!("could not read {}: {e}", key_path.display())))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::startup(format!("TLS setup failed: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::startup(format!("TLS setup failed: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Serve kubectl on `127.0.0.1:<daemonPort>` until `shutdown` fires.
pub async fn run(
    config: DaemonConfig,
    transport_config: TransportConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let acceptor = tls_acceptor(&config.cert_path, &config.key_path)?;
    let state = DaemonState::new(&config, transport_config, shutdown.clone());
    let app = router(state.clone(), &config.localhost_token);

    let listener = TcpListener::bind(("127.0.0.1", config.daemon_port))
        .await
        .map_err(|e| Error::startup(format!("could not bind port {}: {e}", config.daemon_port)))?;
    info!(
        cluster = %config.assume_cluster_id,
        role = %config.assume_role,
        "Daemon: listening on https://127.0.0.1:{}",
        config.daemon_port
    );

    loop {
        let (tcp, peer) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Daemon: accept failed: {e}");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let tls = match acceptor.accept(tcp).await {
                Ok(tls) => tls,
                Err(e) => {
                    debug!("Daemon: TLS handshake with {peer} failed: {e}");
                    return;
                }
            };
            let served = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(tls), TowerToHyperService::new(app))
                .with_upgrades()
                .await;
            if let Err(e) = served {
                debug!("Daemon: connection from {peer} ended: {e}");
            }
        });
    }

    info!(
        "Daemon: shutting down, closing {} session(s)",
        state.registry.count()
    );
    state.registry.cancel_all();
    Ok(())
}


#[cfg(test)]
pub(crate) mod testing {
    //! Daemon state whose sessions reach scripted agents in memory.

    use tokio::sync::mpsc;

    use super::datachannel::testing::{identity, FakeAgent};
    use super::*;
    use crate::transport::Transport;

    pub const TOKEN: &str = "local-token";

    fn state_with(opener: ChannelOpener<String>) -> DaemonState {
        DaemonState {
            target_id: "cluster-1".into(),
            identity: identity(),
            opener,
            registry: SessionRegistry::new(),
            channel_capacity: 16,
            exec_stream_timeout: actions::exec::STREAM_TIMEOUT,
            shutdown: CancellationToken::new(),
        }
    }

    /// Each opened session hands its far end out on the receiver.
    pub fn state() -> (DaemonState, mpsc::UnboundedReceiver<FakeAgent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let opener: ChannelOpener<String> =
            Arc::new(move |_request_id: String, _cancel: CancellationToken| {
                let (near, far) = Transport::pair(16);
                let handed_out = tx.send(FakeAgent::new(far)).is_ok();
                async move {
                    if !handed_out {
                        return Err(Error::Closed(None));
                    }
                    Ok::<_, Error>(near)
                }
                .boxed()
            });
        (state_with(opener), rx)
    }

    /// Every connect to the relay fails.
    pub fn unreachable_state() -> DaemonState {
        state_with(Arc::new(|_request_id: String, _cancel: CancellationToken| {
            async { Err::<Transport, _>(Error::startup("relay refused the connection")) }.boxed()
        }))
    }

    pub fn app(state: DaemonState) -> Router {
        router(state, TOKEN)
    }

    pub fn bearer() -> String {
        format!("Bearer {TOKEN}++++kubectl test++++log-1")
    }
}
