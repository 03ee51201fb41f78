//! TLS material loading
//!
//! Turns optional CA, certificate and key paths into a [`SecurityContext`]
//! that the MQTT transport converts into a rustls client configuration.
//! Every file problem is reported at construction time so a misconfigured
//! session never reaches the network.

use crate::config::ConfigError;
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, Ed25519KeyPair, KeyPair, RsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING,
    ECDSA_P384_SHA384_ASN1_SIGNING,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Client certificate chain and its private key
pub struct ClientIdentity {
    certificate_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
}

impl ClientIdentity {
    pub fn certificate_chain(&self) -> &[CertificateDer<'static>] {
        &self.certificate_chain
    }

    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.private_key
    }
}

impl Clone for ClientIdentity {
    fn clone(&self) -> Self {
        Self {
            certificate_chain: self.certificate_chain.clone(),
            private_key: self.private_key.clone_key(),
        }
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("certificates", &self.certificate_chain.len())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Trust roots and optional client identity for a TLS session.
///
/// An empty context means "use the platform defaults".
#[derive(Debug, Clone, Default)]
pub struct SecurityContext {
    roots: Option<RootCertStore>,
    client_identity: Option<ClientIdentity>,
}

impl SecurityContext {
    /// Explicit trust roots, if a CA bundle was configured
    pub fn roots(&self) -> Option<&RootCertStore> {
        self.roots.as_ref()
    }

    pub fn client_identity(&self) -> Option<&ClientIdentity> {
        self.client_identity.as_ref()
    }

    /// True when neither roots nor a client identity were configured
    pub fn is_empty(&self) -> bool {
        self.roots.is_none() && self.client_identity.is_none()
    }

    pub fn has_client_certificate(&self) -> bool {
        self.client_identity.is_some()
    }

    /// Build a rustls client configuration.
    ///
    /// Falls back to the system trust store when no CA bundle was given.
    pub fn client_config(&self) -> Result<rustls::ClientConfig, ConfigError> {
        let roots = match &self.roots {
            Some(roots) => roots.clone(),
            None => native_roots()?,
        };

        let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
        let config = match &self.client_identity {
            Some(identity) => builder.with_client_auth_cert(
                identity.certificate_chain.clone(),
                identity.private_key.clone_key(),
            )?,
            None => builder.with_no_client_auth(),
        };
        Ok(config)
    }
}

/// Load TLS material from the given paths.
///
/// A certificate without a key (or a key without a certificate) is an
/// error, as is a key that does not belong to the certificate.
pub fn build_security_context(
    ca: Option<&Path>,
    cert: Option<&Path>,
    key: Option<&Path>,
) -> Result<SecurityContext, ConfigError> {
    let roots = ca.map(load_roots).transpose()?;

    let client_identity = match (cert, key) {
        (Some(cert), Some(key)) => Some(load_client_identity(cert, key)?),
        (Some(cert), None) => {
            return Err(ConfigError::CertificateWithoutKey {
                path: cert.to_path_buf(),
            })
        }
        (None, Some(key)) => {
            return Err(ConfigError::KeyWithoutCertificate {
                path: key.to_path_buf(),
            })
        }
        (None, None) => None,
    };

    Ok(SecurityContext {
        roots,
        client_identity,
    })
}

fn native_roots() -> Result<RootCertStore, ConfigError> {
    let certificates =
        rustls_native_certs::load_native_certs().map_err(ConfigError::NativeRoots)?;
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certificates);
    debug!(added, ignored, "Loaded system trust roots");
    Ok(roots)
}

fn load_roots(path: &Path) -> Result<RootCertStore, ConfigError> {
    let certificates = read_certificates(path)?;
    let mut roots = RootCertStore::empty();
    for certificate in certificates {
        roots
            .add(certificate)
            .map_err(|e| ConfigError::InvalidCertificate {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
    }
    debug!(path = %path.display(), roots = roots.len(), "Loaded CA bundle");
    Ok(roots)
}

fn load_client_identity(cert: &Path, key: &Path) -> Result<ClientIdentity, ConfigError> {
    let certificate_chain = read_certificates(cert)?;
    let private_key = read_private_key(key)?;

    if let Some(leaf) = certificate_chain.first() {
        verify_key_pair(leaf.as_ref(), &private_key, cert, key)?;
    }

    Ok(ClientIdentity {
        certificate_chain,
        private_key,
    })
}

fn read_file(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::ReadMaterial {
        path: path.to_path_buf(),
        source,
    })
}

fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let data = read_file(path)?;
    let certificates = rustls_pemfile::certs(&mut data.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ConfigError::ParseMaterial {
            path: path.to_path_buf(),
            source,
        })?;

    if certificates.is_empty() {
        return Err(ConfigError::NoCertificates {
            path: path.to_path_buf(),
        });
    }
    Ok(certificates)
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let data = read_file(path)?;
    rustls_pemfile::private_key(&mut data.as_slice())
        .map_err(|source| ConfigError::ParseMaterial {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| ConfigError::NoPrivateKey {
            path: path.to_path_buf(),
        })
}

/// Check that the key's public half is embedded in the leaf certificate
fn verify_key_pair(
    leaf: &[u8],
    key: &PrivateKeyDer<'_>,
    cert_path: &Path,
    key_path: &Path,
) -> Result<(), ConfigError> {
    let public_key = match key {
        PrivateKeyDer::Pkcs8(der) => pkcs8_public_key(der.secret_pkcs8_der()),
        PrivateKeyDer::Pkcs1(der) => RsaKeyPair::from_der(der.secret_pkcs1_der())
            .ok()
            .map(|pair| pair.public_key().as_ref().to_vec()),
        PrivateKeyDer::Sec1(der) => sec1_public_key(der.secret_sec1_der()),
        _ => None,
    };

    let public_key = public_key.ok_or_else(|| ConfigError::UnsupportedKey {
        path: key_path.to_path_buf(),
    })?;

    if contains(leaf, &public_key) {
        Ok(())
    } else {
        Err(ConfigError::KeyMismatch {
            certificate: PathBuf::from(cert_path),
            key: PathBuf::from(key_path),
        })
    }
}

fn pkcs8_public_key(der: &[u8]) -> Option<Vec<u8>> {
    if let Ok(pair) = Ed25519KeyPair::from_pkcs8_maybe_unchecked(der) {
        return Some(pair.public_key().as_ref().to_vec());
    }

    let rng = SystemRandom::new();
    for algorithm in [
        &ECDSA_P256_SHA256_ASN1_SIGNING,
        &ECDSA_P384_SHA384_ASN1_SIGNING,
    ] {
        if let Ok(pair) = EcdsaKeyPair::from_pkcs8(algorithm, der, &rng) {
            return Some(pair.public_key().as_ref().to_vec());
        }
    }

    RsaKeyPair::from_pkcs8(der)
        .ok()
        .map(|pair| pair.public_key().as_ref().to_vec())
}

/// Public point of a SEC1 `ECPrivateKey`, checked against its private scalar.
/// Keys stored without their public point are not supported.
fn sec1_public_key(der: &[u8]) -> Option<Vec<u8>> {
    let (private_key, public_key) = sec1_components(der)?;
    let algorithm = match private_key.len() {
        32 => &ECDSA_P256_SHA256_ASN1_SIGNING,
        48 => &ECDSA_P384_SHA384_ASN1_SIGNING,
        _ => return None,
    };

    let rng = SystemRandom::new();
    EcdsaKeyPair::from_private_key_and_public_key(algorithm, private_key, public_key, &rng)
        .ok()
        .map(|pair| pair.public_key().as_ref().to_vec())
}

/// `ECPrivateKey ::= SEQUENCE { version, privateKey OCTET STRING,
/// [0] parameters OPTIONAL, [1] publicKey BIT STRING OPTIONAL }`
fn sec1_components(der: &[u8]) -> Option<(&[u8], &[u8])> {
    let (0x30, body, _) = der_element(der)? else {
        return None;
    };
    let (0x02, _version, rest) = der_element(body)? else {
        return None;
    };
    let (0x04, private_key, mut rest) = der_element(rest)? else {
        return None;
    };

    while !rest.is_empty() {
        let (tag, contents, next) = der_element(rest)?;
        if tag == 0xa1 {
            let (0x03, bits, _) = der_element(contents)? else {
                return None;
            };
            // First byte of a BIT STRING counts unused bits
            let (&0, point) = bits.split_first()? else {
                return None;
            };
            return Some((private_key, point));
        }
        rest = next;
    }
    None
}

/// Split one DER element into tag, contents and the bytes after it
fn der_element(input: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, rest) = input.split_first()?;
    let (&first, rest) = rest.split_first()?;
    let (len, rest) = if first & 0x80 == 0 {
        (usize::from(first), rest)
    } else {
        let count = usize::from(first & 0x7f);
        if count == 0 || count > 4 || rest.len() < count {
            return None;
        }
        let (len_bytes, rest) = rest.split_at(count);
        let len = len_bytes
            .iter()
            .fold(0usize, |len, byte| (len << 8) | usize::from(*byte));
        (len, rest)
    };

    if rest.len() < len {
        return None;
    }
    let (contents, rest) = rest.split_at(len);
    Some((tag, contents, rest))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}
