//! Listener/lifecycle (component I), grounded on the teacher's own
//! `SmtpServer::serve` accept loop (same file, prior revision): TLS cert
//! loading and the `select!`-based accept loop are kept; proxy-protocol
//! handling and periodic cert reload are dropped (§9 "Ambient-stack
//! decisions" — out of scope for this relay).

use std::{fs::File, io, net::SocketAddr, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{net::TcpListener, task::JoinSet};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        self,
        pki_types::{CertificateDer, PrivateKeyDer},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

use crate::{
    forwarder::Forwarder,
    recipients::Directory,
    smtp::connection::{self, ConnectionError},
    validator::Validator,
};

#[derive(Debug, Error)]
pub enum SmtpServerError {
    #[error("failed to load private key: {0}")]
    PrivateKey(io::Error),
    #[error("no private key found in the key file")]
    PrivateKeyNotFound,
    #[error("failed to load certificate: {0}")]
    Certificate(io::Error),
    #[error("failed to listen on address: {0}")]
    Listen(io::Error),
    #[error("failed to configure TLS: {0}")]
    Tls(rustls::Error),
}

fn load_tls_config(
    certificate_path: &str,
    private_key_path: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), SmtpServerError> {
    let mut cert_reader =
        io::BufReader::new(File::open(certificate_path).map_err(SmtpServerError::Certificate)?);
    let mut key_reader =
        io::BufReader::new(File::open(private_key_path).map_err(SmtpServerError::PrivateKey)?);

    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, io::Error>>()
        .map_err(SmtpServerError::Certificate)?;
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(SmtpServerError::PrivateKey)?
        .ok_or(SmtpServerError::PrivateKeyNotFound)?;

    Ok((certs, key))
}

fn build_tls_acceptor(
    certificate_path: &str,
    private_key_path: &str,
) -> Result<TlsAcceptor, SmtpServerError> {
    let (certs, key) = load_tls_config(certificate_path, private_key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(SmtpServerError::Tls)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// §4.E "Shutdown": window given to in-flight sessions to finish on their
/// own before their sockets are forcibly closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct SmtpServer {
    bind_addr: SocketAddr,
    hostname: String,
    certificate_path: String,
    private_key_path: String,
    tls_required: bool,
    validator: Arc<Validator>,
    directory: Arc<dyn Directory>,
    forwarder: Arc<dyn Forwarder>,
    shutdown: CancellationToken,
}

#[allow(clippy::too_many_arguments)]
impl SmtpServer {
    pub fn new(
        bind_addr: SocketAddr,
        hostname: String,
        certificate_path: String,
        private_key_path: String,
        tls_required: bool,
        validator: Arc<Validator>,
        directory: Arc<dyn Directory>,
        forwarder: Arc<dyn Forwarder>,
        shutdown: CancellationToken,
    ) -> Self {
        SmtpServer {
            bind_addr,
            hostname,
            certificate_path,
            private_key_path,
            tls_required,
            validator,
            directory,
            forwarder,
            shutdown,
        }
    }

    pub async fn serve(self) -> Result<(), SmtpServerError> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(SmtpServerError::Listen)?;

        let acceptor = Arc::new(build_tls_acceptor(
            &self.certificate_path,
            &self.private_key_path,
        )?);

        info!("smtp server on {}", self.bind_addr);

        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutting down smtp server, draining {} in-flight connection(s)", tasks.len());
                    break;
                }
                result = listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        trace!(
                            source_ip = peer_addr.ip().to_string(),
                            source_port = peer_addr.port(),
                            "new TCP connection"
                        );

                        let acceptor = acceptor.clone();
                        let hostname = self.hostname.clone();
                        let tls_required = self.tls_required;
                        let validator = self.validator.clone();
                        let directory = self.directory.clone();
                        let forwarder = self.forwarder.clone();
                        // Session-scoped cancellation: a child of the server's own
                        // shutdown token, so it fires both on client disconnect
                        // (dropped inside connection::handle) and on shutdown (§5).
                        let cancel = self.shutdown.child_token();

                        tasks.spawn(async move {
                            let result = connection::handle(
                                stream,
                                &hostname,
                                peer_addr,
                                acceptor,
                                tls_required,
                                validator,
                                directory,
                                forwarder,
                                hostname.clone(),
                                cancel,
                            )
                            .await;

                            if let Err(err) = result {
                                let error_string = err.to_string();
                                if let ConnectionError::Accept(e) | ConnectionError::Read(e) = &err
                                    && (e.kind() == io::ErrorKind::UnexpectedEof
                                        || e.kind() == io::ErrorKind::ConnectionReset)
                                {
                                    trace!("failed to handle connection: {error_string}");
                                    return;
                                }
                                error!("failed to handle connection: {error_string}");
                            }
                        });
                    }
                    Err(err) => {
                        error!("failed to accept connection: {}", err);
                    }
                },
                Some(_) = tasks.join_next() => {}
            }
        }

        // Existing sessions get a bounded grace window, then their sockets
        // are forcibly closed (§4.E).
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained {
            info!(
                remaining = tasks.len(),
                "grace window elapsed, forcibly closing remaining connections"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        Ok(())
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async {
            if let Err(e) = self.serve().await {
                error!("smtp server error: {:?}", e);
            }
        })
    }
}
