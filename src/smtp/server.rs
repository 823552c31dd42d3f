//! TCP accept loop with optional opportunistic STARTTLS and periodic
//! jittered certificate reload, and graceful shutdown via
//! `CancellationToken`.
//!
//! Grounded directly on the teacher's `smtp/server.rs`: same
//! `rustls_pemfile`-based cert/key loading, the same random reload interval
//! (`60*60*23 + random_range(0..3600)` seconds) behind an `RwLock<TlsAcceptor>`,
//! the same `select!` shutdown race. Unlike the teacher, which wraps the
//! whole socket in TLS before any SMTP traffic, this relay advertises
//! STARTTLS (spec.md §6) and hands the plaintext stream plus the acceptor
//! down to `smtp::connection::handle`, which performs the upgrade in place
//! when the client issues the command. TLS is also optional here
//! (`tls.cert_file` / `tls.key_file` may be unset outside production, per
//! `config.rs`), and the PROXY protocol passthrough the teacher had in front
//! of the listener is dropped along with `smtp/proxy_protocol.rs`.

use std::{fs::File, io, sync::Arc, time::Duration};

use rand::random_range;
use thiserror::Error;
use tokio::{net::TcpListener, select, sync::RwLock};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        self,
        pki_types::{CertificateDer, PrivateKeyDer},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::smtp::{RelayServices, connection::{self, ConnectionError}};

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
    #[error("invalid listen address: {0}")]
    Config(#[from] crate::config::ConfigError),
}

pub struct SmtpServer {
    services: RelayServices,
    shutdown: CancellationToken,
}

impl SmtpServer {
    pub fn new(services: RelayServices, shutdown: CancellationToken) -> Self {
        Self { services, shutdown }
    }

    pub async fn serve(self) -> Result<(), SmtpServerError> {
        let listen_addr = self.services.config.listen_socket_addr()?;
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(SmtpServerError::Listen)?;

        let acceptor = Arc::new(RwLock::new(build_tls_acceptor(&self.services)?));

        info!("smtp relay listening on {listen_addr}");

        let certificate_reload_interval =
            Duration::from_secs(60 * 60 * 23 + random_range(0..(60 * 60)));
        debug!("reloading the SMTP certificate every {certificate_reload_interval:?}");

        let server_name = self.services.config.server_name.clone();
        let services = self.services.clone();
        let shutdown = self.shutdown.clone();

        let reload_services = self.services.clone();
        let acceptor_clone = acceptor.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(certificate_reload_interval);
            loop {
                interval.tick().await;
                match build_tls_acceptor(&reload_services) {
                    Ok(new_acceptor) => {
                        info!("reloading the SMTP TLS certificate");
                        *acceptor_clone.write().await = new_acceptor;
                    }
                    Err(err) => error!("failed to reload TLS certificate: {err}"),
                }
            }
        });

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    info!("shutting down smtp server");
                    return Ok(());
                }
                result = listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        trace!(
                            source_ip = peer_addr.ip().to_string(),
                            source_port = peer_addr.port(),
                            "new TCP connection"
                        );

                        let acceptor = acceptor.clone();
                        let server_name = server_name.clone();
                        let services = services.clone();

                        tokio::spawn(async move {
                            let result = Self::serve_one(stream, peer_addr, acceptor, server_name, services).await;
                            if let Err(err) = result {
                                match &err {
                                    ConnectionError::Accept(e)
                                        if e.kind() == io::ErrorKind::UnexpectedEof
                                            || e.kind() == io::ErrorKind::ConnectionReset =>
                                    {
                                        trace!("failed to handle connection: {err}");
                                    }
                                    _ => error!("failed to handle connection: {err}"),
                                }
                            }
                        });
                    }
                    Err(err) => error!("failed to accept connection: {err}"),
                },
            }
        }
    }

    async fn serve_one(
        stream: tokio::net::TcpStream,
        peer_addr: std::net::SocketAddr,
        acceptor: Arc<RwLock<Option<TlsAcceptor>>>,
        server_name: String,
        services: RelayServices,
    ) -> Result<(), ConnectionError> {
        let maybe_acceptor = acceptor.read().await.clone();
        connection::handle(stream, &server_name, peer_addr, services, maybe_acceptor).await
    }

    pub fn spawn(self) {
        tokio::spawn(async move {
            if let Err(e) = self.serve().await {
                error!("smtp server error: {e:?}");
            }
        });
    }
}

fn load_key_material(
    services: &RelayServices,
) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>, SmtpServerError> {
    let tls = &services.config.tls;
    let (Some(cert_file), Some(key_file)) = (&tls.cert_file, &tls.key_file) else {
        return Ok(None);
    };

    let mut cert_reader =
        io::BufReader::new(File::open(cert_file).map_err(SmtpServerError::Certificate)?);
    let mut key_reader =
        io::BufReader::new(File::open(key_file).map_err(SmtpServerError::PrivateKey)?);

    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, io::Error>>()
        .map_err(SmtpServerError::Certificate)?;
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(SmtpServerError::PrivateKey)?
        .ok_or(SmtpServerError::PrivateKeyNotFound)?;

    Ok(Some((certs, key)))
}

fn build_tls_acceptor(services: &RelayServices) -> Result<Option<TlsAcceptor>, SmtpServerError> {
    let Some((certs, key)) = load_key_material(services)? else {
        return Ok(None);
    };

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(SmtpServerError::Tls)?;

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}
