//! TLS termination.
//!
//! [`TlsContext`] is built once from the configured PEM material and is
//! immutable after init. Each TLS connection owns a [`TlsEngine`] driving
//! a rustls server session over the nonblocking stream: a step-wise
//! `handshake` that reports which readiness it still needs, and
//! `wrap`/`unwrap` for application bytes.

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, ServerConnection};

use crate::config::{TlsSettings, VerifyMode};
use crate::connection::ops;
use crate::error::{Error, Result};

/// Outcome of a `wrap`/`unwrap` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsStatus {
    /// Progress was made.
    Ok,
    /// More ciphertext must arrive before plaintext can be produced.
    NeedRead,
    /// The socket send buffer is full; retry on write readiness.
    NeedWrite,
    /// The peer closed the TLS session.
    Closed,
}

/// Immutable server-side TLS context shared by all connections.
pub struct TlsContext {
    config: Arc<ServerConfig>,
}

impl TlsContext {
    /// Build a context from PEM paths and policy.
    pub fn from_settings(settings: &TlsSettings) -> Result<Self> {
        let mut certs: Vec<CertificateDer<'static>> =
            CertificateDer::pem_file_iter(&settings.certificate_file)
                .map_err(|e| Error::TlsSetup(format!("certificate_file: {e}")))?
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::TlsSetup(format!("certificate_file: {e}")))?;
        if certs.is_empty() {
            return Err(Error::TlsSetup("certificate_file holds no certificates".into()));
        }
        if let Some(chain) = &settings.certificate_chain_file {
            let chain_certs = CertificateDer::pem_file_iter(chain)
                .map_err(|e| Error::TlsSetup(format!("certificate_chain_file: {e}")))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::TlsSetup(format!("certificate_chain_file: {e}")))?;
            certs.extend(chain_certs);
        }
        let key = PrivateKeyDer::from_pem_file(&settings.certificate_key_file)
            .map_err(|e| Error::TlsSetup(format!("certificate_key_file: {e}")))?;

        let provider = provider_with_suites(&settings.cipher_suites)?;
        let versions = protocol_versions(&settings.protocols)?;
        let builder = ServerConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(&versions)
            .map_err(|e| Error::TlsSetup(format!("protocol versions: {e}")))?;

        let config = match settings.verify {
            VerifyMode::None => builder.with_no_client_auth().with_single_cert(certs, key),
            mode => {
                let roots = client_roots(settings)?;
                let mut verifier = WebPkiClientVerifier::builder(Arc::new(roots));
                if let Some(crl_path) = &settings.revocation_file {
                    let crls = CertificateRevocationListDer::pem_file_iter(crl_path)
                        .map_err(|e| Error::TlsSetup(format!("revocation_file: {e}")))?
                        .collect::<std::result::Result<Vec<_>, _>>()
                        .map_err(|e| Error::TlsSetup(format!("revocation_file: {e}")))?;
                    verifier = verifier.with_crls(crls);
                }
                if matches!(mode, VerifyMode::Optional | VerifyMode::OptionalNoCa) {
                    verifier = verifier.allow_unauthenticated();
                }
                let verifier = verifier
                    .build()
                    .map_err(|e| Error::TlsSetup(format!("client verifier: {e}")))?;
                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)
            }
        }
        .map_err(|e| Error::TlsSetup(format!("certificate/key: {e}")))?;

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Spawn a fresh engine for one accepted connection.
    pub(crate) fn new_engine(&self) -> Result<TlsEngine> {
        let conn = ServerConnection::new(self.config.clone())
            .map_err(|e| Error::TlsSetup(format!("session: {e}")))?;
        Ok(TlsEngine {
            conn,
            handshake_complete: false,
        })
    }
}

fn client_roots(settings: &TlsSettings) -> Result<RootCertStore> {
    let Some(ca_path) = &settings.ca_certificate_file else {
        return Err(Error::TlsSetup(
            "client verification requires ca_certificate_file".into(),
        ));
    };
    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_file_iter(ca_path)
        .map_err(|e| Error::TlsSetup(format!("ca_certificate_file: {e}")))?
    {
        let cert = cert.map_err(|e| Error::TlsSetup(format!("ca_certificate_file: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| Error::TlsSetup(format!("ca_certificate_file: {e}")))?;
    }
    Ok(roots)
}

fn provider_with_suites(names: &[String]) -> Result<rustls::crypto::CryptoProvider> {
    let mut provider = rustls::crypto::aws_lc_rs::default_provider();
    if !names.is_empty() {
        provider.cipher_suites.retain(|suite| {
            let id = format!("{:?}", suite.suite());
            names.iter().any(|n| n.eq_ignore_ascii_case(&id))
        });
        if provider.cipher_suites.is_empty() {
            return Err(Error::TlsSetup("no configured cipher suite is available".into()));
        }
    }
    Ok(provider)
}

fn protocol_versions(
    names: &[String],
) -> Result<Vec<&'static rustls::SupportedProtocolVersion>> {
    if names.is_empty() {
        return Ok(rustls::ALL_VERSIONS.to_vec());
    }
    let mut versions = Vec::new();
    for name in names {
        match name.as_str() {
            "TLSv1.2" | "TLSv1_2" => versions.push(&rustls::version::TLS12),
            "TLSv1.3" | "TLSv1_3" => versions.push(&rustls::version::TLS13),
            other => {
                return Err(Error::TlsSetup(format!("unknown protocol version {other:?}")));
            }
        }
    }
    Ok(versions)
}

/// Per-connection TLS state machine.
pub struct TlsEngine {
    conn: ServerConnection,
    handshake_complete: bool,
}

impl TlsEngine {
    /// Whether the handshake still needs I/O.
    pub fn is_handshaking(&self) -> bool {
        !self.handshake_complete
    }

    /// Drive the handshake as far as the socket allows.
    ///
    /// Returns `Ok(0)` when complete, or the ops bitset the handshake is
    /// blocked on. A peer failure surfaces as [`Error::HandshakeFailed`];
    /// the caller closes the connection, no retry.
    pub fn handshake<S: Read + Write>(
        &mut self,
        stream: &mut S,
        readable: bool,
        _writable: bool,
    ) -> Result<u32> {
        if self.handshake_complete {
            return Ok(0);
        }
        loop {
            while self.conn.wants_write() {
                match self.conn.write_tls(stream) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ops::WRITE),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(_) => return Err(Error::HandshakeFailed),
                }
            }
            if !self.conn.is_handshaking() {
                self.handshake_complete = true;
                return Ok(0);
            }
            if !readable {
                return Ok(ops::READ);
            }
            match self.conn.read_tls(stream) {
                Ok(0) => return Err(Error::HandshakeFailed),
                Ok(_) => {
                    if self.conn.process_new_packets().is_err() {
                        // Flush the alert before giving up.
                        let _ = self.conn.write_tls(stream);
                        return Err(Error::HandshakeFailed);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ops::READ),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return Err(Error::HandshakeFailed),
            }
        }
    }

    /// Pull ciphertext off the stream and produce plaintext into `out`.
    /// Returns bytes produced and the step status.
    pub fn unwrap<S: Read + Write>(
        &mut self,
        stream: &mut S,
        out: &mut [u8],
    ) -> io::Result<(usize, TlsStatus)> {
        match self.conn.read_tls(stream) {
            Ok(0) => return Ok((0, TlsStatus::Closed)),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
        let state = match self.conn.process_new_packets() {
            Ok(state) => state,
            Err(e) => {
                // Flush the alert before reporting the failure.
                let _ = self.conn.write_tls(stream);
                return Err(io::Error::other(e));
            }
        };
        let mut produced = 0;
        if state.plaintext_bytes_to_read() > 0 {
            match self.conn.reader().read(out) {
                Ok(n) => produced = n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        if produced > 0 {
            Ok((produced, TlsStatus::Ok))
        } else if state.peer_has_closed() {
            Ok((0, TlsStatus::Closed))
        } else {
            Ok((0, TlsStatus::NeedRead))
        }
    }

    /// Encrypt `data` and push ciphertext to the stream. Returns bytes of
    /// plaintext consumed and the step status.
    pub fn wrap<S: Read + Write>(
        &mut self,
        stream: &mut S,
        data: &[u8],
    ) -> io::Result<(usize, TlsStatus)> {
        let consumed = self.conn.writer().write(data)?;
        while self.conn.wants_write() {
            match self.conn.write_tls(stream) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok((consumed, TlsStatus::NeedWrite));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok((consumed, TlsStatus::Ok))
    }

    /// Blocking-style read helper over `unwrap`.
    pub fn read<S: Read + Write>(&mut self, stream: &mut S, buf: &mut [u8]) -> io::Result<usize> {
        match self.unwrap(stream, buf)? {
            (n, TlsStatus::Ok) => Ok(n),
            (_, TlsStatus::Closed) => Ok(0),
            _ => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    /// Blocking-style write helper over `wrap`.
    pub fn write<S: Read + Write>(&mut self, stream: &mut S, buf: &[u8]) -> io::Result<usize> {
        let (consumed, _) = self.wrap(stream, buf)?;
        Ok(consumed)
    }

    /// Queue a close_notify alert and flush it best-effort.
    pub fn send_close_notify<S: Read + Write>(&mut self, stream: &mut S) {
        self.conn.send_close_notify();
        while self.conn.wants_write() {
            match self.conn.write_tls(stream) {
                Ok(0) => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_test_material(dir: &std::path::Path) -> TlsSettings {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::File::create(&cert_path)
            .unwrap()
            .write_all(cert.cert.pem().as_bytes())
            .unwrap();
        std::fs::File::create(&key_path)
            .unwrap()
            .write_all(cert.key_pair.serialize_pem().as_bytes())
            .unwrap();
        TlsSettings {
            certificate_file: cert_path,
            certificate_key_file: key_path,
            ..Default::default()
        }
    }

    #[test]
    fn context_builds_from_pem_material() {
        let dir = tempfile::tempdir().unwrap();
        let settings = write_test_material(dir.path());
        let ctx = TlsContext::from_settings(&settings).unwrap();
        let engine = ctx.new_engine().unwrap();
        assert!(engine.is_handshaking());
    }

    #[test]
    fn context_rejects_missing_files() {
        let settings = TlsSettings {
            certificate_file: "/nonexistent/cert.pem".into(),
            certificate_key_file: "/nonexistent/key.pem".into(),
            ..Default::default()
        };
        assert!(TlsContext::from_settings(&settings).is_err());
    }

    #[test]
    fn context_rejects_unknown_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = write_test_material(dir.path());
        settings.protocols = vec!["SSLv3".into()];
        assert!(TlsContext::from_settings(&settings).is_err());
    }

    /// An empty nonblocking stream: reads would block, writes are swallowed.
    struct Starved;

    impl Read for Starved {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    impl Write for Starved {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn handshake_reports_needed_read() {
        let dir = tempfile::tempdir().unwrap();
        let settings = write_test_material(dir.path());
        let ctx = TlsContext::from_settings(&settings).unwrap();
        let mut engine = ctx.new_engine().unwrap();
        // No ClientHello has arrived: the handshake is blocked on read.
        let needed = engine.handshake(&mut Starved, true, true).unwrap();
        assert_eq!(needed, ops::READ);
        assert!(engine.is_handshaking());
    }
}
