//! Console proxy
//!
//! Operators connect with a client certificate, send the machine id as the
//! first line and are then piped to the machine's serial console.

use crate::inventory::{InventoryClient, InventoryError};
use crate::oob::{OutOfBandConnector, OutOfBandError};
use rustls::crypto::ring;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_ID_LINE: u64 = 256;

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("tls setup failed: {0}")]
    Tls(String),

    #[error("console i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("no machine id given")]
    MissingMachineId,

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    OutOfBand(#[from] OutOfBandError),
}

#[derive(Debug, Clone)]
pub struct ConsoleSettings {
    pub port: u16,
    pub ca_cert_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Mutual TLS acceptor: clients must present a certificate signed by the CA
pub fn load_acceptor(settings: &ConsoleSettings) -> Result<TlsAcceptor, ConsoleError> {
    let provider = Arc::new(ring::default_provider());

    let ca_certs = read_certificates(&settings.ca_cert_file)?;
    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots
            .add(cert)
            .map_err(|e| ConsoleError::Tls(format!("failed to add ca certificate: {e}")))?;
    }

    let certs = read_certificates(&settings.cert_file)?;
    let key = PrivateKeyDer::from_pem_file(&settings.key_file).map_err(|e| {
        ConsoleError::Tls(format!(
            "failed to read private key {}: {e}",
            settings.key_file.display()
        ))
    })?;

    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| ConsoleError::Tls(format!("client verifier error: {e}")))?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ConsoleError::Tls(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| ConsoleError::Tls(format!("server config error: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn read_certificates(path: &PathBuf) -> Result<Vec<CertificateDer<'static>>, ConsoleError> {
    let certs = CertificateDer::pem_file_iter(path)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .map_err(|e| ConsoleError::Tls(format!("failed to read {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(ConsoleError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

pub struct ConsoleProxy {
    inventory: Arc<dyn InventoryClient>,
    connector: Arc<dyn OutOfBandConnector>,
    bmc_port: u16,
}

impl ConsoleProxy {
    pub fn new(
        inventory: Arc<dyn InventoryClient>,
        connector: Arc<dyn OutOfBandConnector>,
        bmc_port: u16,
    ) -> Self {
        Self {
            inventory,
            connector,
            bmc_port,
        }
    }

    /// Accept TLS connections until `shutdown`, one task per connection
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        acceptor: TlsAcceptor,
        shutdown: CancellationToken,
    ) {
        if let Ok(addr) = listener.local_addr() {
            info!(address = %addr, "console proxy listening");
        }

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (tcp, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("failed to accept console connection: {}", e);
                    continue;
                }
            };

            let proxy = self.clone();
            let acceptor = acceptor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let tls = match acceptor.accept(tcp).await {
                    Ok(tls) => tls,
                    Err(e) => {
                        warn!(peer = %peer, "console tls handshake failed: {}", e);
                        return;
                    }
                };
                tokio::select! {
                    _ = shutdown.cancelled() => debug!(peer = %peer, "console session closed by shutdown"),
                    result = proxy.handle_connection(tls) => {
                        if let Err(e) = result {
                            error!(peer = %peer, "console session failed: {}", e);
                        }
                    }
                }
            });
        }

        info!("console proxy stopped");
    }

    /// Run one console session over an established client stream
    pub async fn handle_connection<S>(&self, stream: S) -> Result<(), ConsoleError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut client = BufReader::new(stream);
        match self.pipe(&mut client).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = client.write_all(format!("error: {e}\r\n").as_bytes()).await;
                let _ = client.shutdown().await;
                Err(e)
            }
        }
    }

    async fn pipe<S>(&self, client: &mut BufReader<S>) -> Result<(), ConsoleError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut line = String::new();
        (&mut *client).take(MAX_ID_LINE).read_line(&mut line).await?;
        let machine_id = line.trim();
        if machine_id.is_empty() {
            return Err(ConsoleError::MissingMachineId);
        }

        let details = self.inventory.machine_bmc(machine_id).await?;
        let address = details.bmc_address(self.bmc_port)?;
        client
            .write_all(
                format!("Connecting to console of {:?} ({})\r\n", machine_id, address).as_bytes(),
            )
            .await?;
        info!(machine = %machine_id, bmc = %address, "connecting to console");

        let session = self.connector.open(&address, &details.credentials()).await?;
        let mut console = session.open_console().await?;

        let (to_console, from_console) = tokio::io::copy_bidirectional(client, &mut console).await?;
        info!(
            machine = %machine_id,
            to_console,
            from_console,
            "console session ended"
        );
        Ok(())
    }
}
