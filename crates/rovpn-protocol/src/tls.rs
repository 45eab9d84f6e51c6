//! Control channel crypto
//!
//! TLS runs as a byte pump with no socket access: record bytes move in and
//! out through buffers, carried by the reliability layer inside control
//! packets. After the handshake the engine can export keying material
//! (RFC 5705) for the data channel.

use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;

use bytes::BytesMut;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConnection, RootCertStore};
use zeroize::Zeroizing;

use rovpn_config::ControlCryptoConfig;

use crate::{ProtocolError, Result};

/// Byte-pump interface over the control channel's crypto engine
///
/// `input` is plaintext application data, `output` is wire bytes. The
/// driver shuttles `output` through the reliability layer and feeds
/// whatever arrives back via `write_output`.
pub trait ControlCrypto: Send {
    /// Queue plaintext for the peer
    fn write_input(&mut self, plaintext: &[u8]) -> Result<()>;

    /// Read decrypted plaintext received from the peer
    fn read_input(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Feed wire bytes received from the peer
    fn write_output(&mut self, wire: &[u8]) -> Result<()>;

    /// Read wire bytes to send to the peer
    fn read_output(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Whether the handshake is still in progress
    fn is_handshaking(&self) -> bool;

    /// Export keying material per RFC 5705
    fn export_key_material(
        &self,
        label: &[u8],
        context: Option<&[u8]>,
        len: usize,
    ) -> Result<Zeroizing<Vec<u8>>>;
}

/// TLS client engine over rustls
pub struct TlsClient {
    conn: ClientConnection,
    outgoing: BytesMut,
}

impl TlsClient {
    /// Build a TLS client from the configured certificate, key and CA
    pub fn new(config: &ControlCryptoConfig, server_name: &str) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs_from_pem(&config.ca)? {
            roots
                .add(cert)
                .map_err(|e| ProtocolError::TlsHandshake(format!("bad CA certificate: {e}")))?;
        }

        let certs = load_certs_from_pem(&config.certificate)?;
        let key = load_key_from_pem(&config.private_key)?;

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| ProtocolError::TlsHandshake(e.to_string()))?;

        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| ProtocolError::TlsHandshake(format!("bad server name: {e}")))?;

        let conn = ClientConnection::new(Arc::new(tls_config), name)
            .map_err(|e| ProtocolError::TlsHandshake(e.to_string()))?;

        Ok(Self {
            conn,
            outgoing: BytesMut::with_capacity(16384),
        })
    }

    fn pump_outgoing(&mut self) -> Result<()> {
        while self.conn.wants_write() {
            self.conn
                .write_tls(&mut BufWriter(&mut self.outgoing))
                .map_err(|e| ProtocolError::TlsHandshake(e.to_string()))?;
        }
        Ok(())
    }
}

impl ControlCrypto for TlsClient {
    fn write_input(&mut self, plaintext: &[u8]) -> Result<()> {
        self.conn
            .writer()
            .write_all(plaintext)
            .map_err(|e| ProtocolError::TlsHandshake(e.to_string()))
    }

    fn read_input(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.conn.reader().read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(0),
            Err(e) => Err(ProtocolError::TlsHandshake(e.to_string())),
        }
    }

    fn write_output(&mut self, wire: &[u8]) -> Result<()> {
        let mut reader = wire;
        while !reader.is_empty() {
            match self.conn.read_tls(&mut reader) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(ProtocolError::TlsHandshake(e.to_string())),
            }
        }
        self.conn
            .process_new_packets()
            .map_err(|e| ProtocolError::TlsHandshake(e.to_string()))?;
        Ok(())
    }

    fn read_output(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.pump_outgoing()?;
        let n = buf.len().min(self.outgoing.len());
        buf[..n].copy_from_slice(&self.outgoing[..n]);
        let _ = self.outgoing.split_to(n);
        Ok(n)
    }

    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn export_key_material(
        &self,
        label: &[u8],
        context: Option<&[u8]>,
        len: usize,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let out = self
            .conn
            .export_keying_material(vec![0u8; len], label, context)
            .map_err(|e| ProtocolError::TlsHandshake(e.to_string()))?;
        Ok(Zeroizing::new(out))
    }
}

/// Null engine: input pipes straight to output
///
/// Used by tests to drive the protocol machinery without a TLS peer.
#[derive(Default)]
pub struct PlainCrypto {
    to_wire: BytesMut,
    from_wire: BytesMut,
}

impl PlainCrypto {
    /// Create an empty pipe
    pub fn new() -> Self {
        Self::default()
    }
}

impl ControlCrypto for PlainCrypto {
    fn write_input(&mut self, plaintext: &[u8]) -> Result<()> {
        self.to_wire.extend_from_slice(plaintext);
        Ok(())
    }

    fn read_input(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.from_wire.len());
        buf[..n].copy_from_slice(&self.from_wire[..n]);
        let _ = self.from_wire.split_to(n);
        Ok(n)
    }

    fn write_output(&mut self, wire: &[u8]) -> Result<()> {
        self.from_wire.extend_from_slice(wire);
        Ok(())
    }

    fn read_output(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.to_wire.len());
        buf[..n].copy_from_slice(&self.to_wire[..n]);
        let _ = self.to_wire.split_to(n);
        Ok(n)
    }

    fn is_handshaking(&self) -> bool {
        false
    }

    fn export_key_material(
        &self,
        _label: &[u8],
        _context: Option<&[u8]>,
        _len: usize,
    ) -> Result<Zeroizing<Vec<u8>>> {
        Err(ProtocolError::TlsHandshake(
            "keying-material exporter unavailable".to_string(),
        ))
    }
}

struct BufWriter<'a>(&'a mut BytesMut);

impl Write for BufWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Load a certificate chain from PEM
pub fn load_certs_from_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut certs = Vec::new();
    for cert in rustls_pemfile::certs(&mut pem.as_bytes()) {
        match cert {
            Ok(c) => certs.push(c),
            Err(e) => {
                return Err(ProtocolError::TlsHandshake(format!(
                    "failed to parse certificate: {e}"
                )));
            }
        }
    }
    if certs.is_empty() {
        return Err(ProtocolError::TlsHandshake("no certificate in PEM".into()));
    }
    Ok(certs)
}

/// Load a private key from PEM (PKCS#8, PKCS#1 or SEC1)
pub fn load_key_from_pem(pem: &str) -> Result<PrivateKeyDer<'static>> {
    for item in rustls_pemfile::read_all(&mut pem.as_bytes()) {
        match item {
            Ok(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Ok(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Ok(rustls_pemfile::Item::Sec1Key(key)) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => continue,
        }
    }
    Err(ProtocolError::TlsHandshake("no private key in PEM".into()))
}
