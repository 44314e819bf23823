//! # Cryptographic Infrastructure
//!
//! Two unrelated concerns live here:
//!
//! - **Identity signatures**: the sign/verify capability consumed by the
//!   routing protocol. A node signs with the key material the issuer gave it;
//!   anyone holding the issuer's [`PublicParameters`] can verify a signature
//!   against the signer's claimed `(numID, nameID)` without any other lookup.
//! - **Transport TLS**: QUIC requires TLS 1.3. Each process generates a
//!   throwaway self-signed Ed25519 certificate. Routing accountability comes
//!   from transcripts, so the client only checks that the server presents a
//!   well-formed Ed25519 certificate and owns its key.
//!
//! ## Identity signature construction
//!
//! The issuer holds an Ed25519 master key. For identity `I` it derives a node
//! secret `sk_I = BLAKE3-keyed(master_secret, I)` and certifies the matching
//! public key with `cert_I = Sign_master(CERT_DOMAIN || I || pk_I)`.
//! An [`IdentitySignature`] carries `(pk_I, cert_I, sig)`; verification checks
//! the certificate under the master key first, then `sig` under `pk_I`.
//!
//! Every signed payload is domain separated.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use quinn::ClientConfig;
use rand::{CryptoRng, RngCore};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde::{Deserialize, Serialize};

use crate::identity::NodeInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    Missing,
    InvalidLength,
    InvalidPublicKey,
    /// The issuer's certificate does not bind the key to the claimed identity.
    UncertifiedKey,
    VerificationFailed,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
            SignatureError::UncertifiedKey => {
                write!(f, "signing key is not certified for the claimed identity")
            }
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Signature by the terminal node's guard over a full routing transcript.
pub const GUARD_SIGNATURE_DOMAIN: &[u8] = b"skipguard-guard-v1:";

/// Signature by a visited node over the transcript prefix ending at its hop.
pub const STEP_SIGNATURE_DOMAIN: &[u8] = b"skipguard-step-v1:";

const CERTIFICATE_DOMAIN: &[u8] = b"skipguard-cert-v1:";

fn prefixed(domain: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let len = domain.len() + parts.iter().map(|p| p.len()).sum::<usize>();
    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(domain);
    for part in parts {
        out.extend_from_slice(part);
    }
    out
}

fn parse_signature(bytes: &[u8]) -> std::result::Result<Signature, SignatureError> {
    if bytes.is_empty() {
        return Err(SignatureError::Missing);
    }
    let arr: [u8; 64] = bytes.try_into().map_err(|_| SignatureError::InvalidLength)?;
    Ok(Signature::from_bytes(&arr))
}

/// System-wide, read-only verification material published by the issuer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicParameters {
    master_key: [u8; 32],
}

impl PublicParameters {
    pub fn from_bytes(master_key: [u8; 32]) -> Self {
        Self { master_key }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.master_key
    }

    fn verifying_key(&self) -> std::result::Result<VerifyingKey, SignatureError> {
        VerifyingKey::from_bytes(&self.master_key).map_err(|_| SignatureError::InvalidPublicKey)
    }
}

impl std::fmt::Debug for PublicParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicParameters({})", hex::encode(&self.master_key[..8]))
    }
}

/// The issuer's secret. Never leaves the issuer process.
pub struct MasterKey {
    signing_key: SigningKey,
}

impl MasterKey {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            signing_key: SigningKey::generate(rng),
        }
    }

    pub fn public_parameters(&self) -> PublicParameters {
        PublicParameters::from_bytes(self.signing_key.verifying_key().to_bytes())
    }

    /// Derives and certifies the key material for `identity` (address ignored).
    pub fn issue(&self, identity: &NodeInfo) -> PrivateKey {
        let identity_bytes = identity.identity_bytes();
        let secret = *blake3::keyed_hash(&self.signing_key.to_bytes(), &identity_bytes).as_bytes();
        let public_key = SigningKey::from_bytes(&secret).verifying_key().to_bytes();
        let certificate = self
            .signing_key
            .sign(&prefixed(CERTIFICATE_DOMAIN, &[&identity_bytes, &public_key]))
            .to_bytes()
            .to_vec();
        PrivateKey {
            secret,
            certificate,
        }
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("public", &self.public_parameters())
            .finish_non_exhaustive()
    }
}

/// Identity-bound signing key issued to a single node.
#[derive(Clone, Serialize, Deserialize)]
pub struct PrivateKey {
    secret: [u8; 32],
    certificate: Vec<u8>,
}

impl PrivateKey {
    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.secret)
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key().verifying_key().to_bytes()
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("public", &hex::encode(&self.public_key_bytes()[..8]))
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySignature {
    pub public_key: [u8; 32],
    pub certificate: Vec<u8>,
    pub signature: Vec<u8>,
}

/// `Sign(identity, privateKey, message)`.
pub fn sign(key: &PrivateKey, domain: &[u8], message: &[u8]) -> IdentitySignature {
    let signing_key = key.signing_key();
    IdentitySignature {
        public_key: signing_key.verifying_key().to_bytes(),
        certificate: key.certificate.clone(),
        signature: signing_key
            .sign(&prefixed(domain, &[message]))
            .to_bytes()
            .to_vec(),
    }
}

/// `Verify(identity, publicParameters, message, signature)`.
pub fn verify(
    identity: &NodeInfo,
    params: &PublicParameters,
    domain: &[u8],
    message: &[u8],
    signature: &IdentitySignature,
) -> std::result::Result<(), SignatureError> {
    let master = params.verifying_key()?;
    let certificate = parse_signature(&signature.certificate)?;
    let certified = prefixed(
        CERTIFICATE_DOMAIN,
        &[&identity.identity_bytes(), &signature.public_key],
    );
    master
        .verify_strict(&certified, &certificate)
        .map_err(|_| SignatureError::UncertifiedKey)?;

    let node_key = VerifyingKey::from_bytes(&signature.public_key)
        .map_err(|_| SignatureError::InvalidPublicKey)?;
    let sig = parse_signature(&signature.signature)?;
    node_key
        .verify_strict(&prefixed(domain, &[message]), &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

// ============================================================================
// Transport TLS
// ============================================================================

static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

pub const ALPN: &[u8] = b"skipguard";

/// Every node presents the same server name; peers are addressed by socket.
pub const SERVER_NAME: &str = "skipguard";

const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_CONCURRENT_STREAMS: u32 = 256;

pub fn generate_transport_cert() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519)
        .context("failed to generate Ed25519 transport key")?;
    let params = rcgen::CertificateParams::new(vec![SERVER_NAME.to_string()])
        .context("failed to create certificate params")?;
    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign transport certificate")?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((vec![cert.der().clone()], key))
}

pub fn create_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let mut server_crypto = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unsupported by crypto provider")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));

    let transport_config = Arc::get_mut(&mut server_config.transport)
        .context("transport config is shared before first use")?;
    transport_config.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(MAX_IDLE_TIMEOUT).context("idle timeout out of range")?,
    ));
    transport_config.max_concurrent_bidi_streams(MAX_CONCURRENT_STREAMS.into());

    Ok(server_config)
}

pub fn create_client_config() -> Result<ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unsupported by crypto provider")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(Ed25519ServerVerifier))
        .with_no_client_auth();
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    Ok(ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    )))
}

pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let key_bytes = &cert.public_key().subject_public_key.data;
    <[u8; 32]>::try_from(key_bytes.as_ref()).ok()
}

#[derive(Debug)]
struct Ed25519ServerVerifier;

impl rustls::client::danger::ServerCertVerifier for Ed25519ServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let public_key = extract_public_key_from_cert(end_entity.as_ref()).ok_or(
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
        )?;
        if VerifyingKey::from_bytes(&public_key).is_err() {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}
