//! TLS certificate handling
//!
//! The server identity lives in one PEM file holding both the private key
//! and the certificate chain. It can be loaded from disk or generated
//! self-signed, optionally writing the generated pair back so restarts keep
//! a stable identity.

use std::fs;
use std::path::Path;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tracing::info;

use crate::error::RelayError;

/// Load a combined key + certificate PEM file.
pub fn load(path: &Path) -> Result<ServerConfig, RelayError> {
    let pem = fs::read(path)?;

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &pem[..]).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(RelayError::Certificate(format!(
            "no certificates found in {}",
            path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut &pem[..])?.ok_or_else(|| {
        RelayError::Certificate(format!("no private key found in {}", path.display()))
    })?;

    info!(path = %path.display(), certs = certs.len(), "certificate loaded");
    build_config(certs, key)
}

/// Generate a self-signed certificate, optionally writing it to `write_path`
/// (key first, then certificate, mode 0600) so the identity survives
/// restarts.
pub fn generate(write_path: Option<&Path>) -> Result<ServerConfig, RelayError> {
    use std::net::{IpAddr, Ipv4Addr};

    let key_pair = KeyPair::generate()?;

    let mut params = CertificateParams::new(vec!["localhost".to_string()])?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Root CA");
    dn.push(DnType::OrganizationName, "NVDA Remote Relay");
    params.distinguished_name = dn;
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));

    let cert = params.self_signed(&key_pair)?;
    info!("self-signed certificate generated");

    if let Some(path) = write_path {
        write_key_pair(path, &key_pair.serialize_pem(), &cert.pem())?;
    }

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    build_config(vec![cert.der().clone()], key)
}

fn build_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, RelayError> {
    // rustls negotiates TLS 1.2 as its floor and always honors the server's
    // cipher suite preference.
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(config)
}

fn write_key_pair(path: &Path, key_pem: &str, cert_pem: &str) -> Result<(), RelayError> {
    let mut data = String::with_capacity(key_pem.len() + cert_pem.len());
    data.push_str(key_pem);
    data.push_str(cert_pem);
    fs::write(path, &data)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    info!(path = %path.display(), "certificate and key written");
    Ok(())
}
