//! X.509 certificate authority for mutual-TLS agent authentication.
//!
//! Key material is 2048-bit RSA. rcgen drives certificate construction but
//! cannot generate RSA keys, so keys come from the `rsa` crate and are
//! loaded into rcgen as PKCS#8 PEM. Presented client certificates are
//! parsed with x509-parser; cryptographic failures yield sentinel `None`
//! returns while I/O failures raise.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{info, warn};
use x509_parser::pem::parse_x509_pem;

use crate::storage::CaStorage;
use crate::types::{CaConfig, CaError, CaResult, ClientCertificate};

pub struct CertificateAuthority {
    config: CaConfig,
    storage: CaStorage,
    ca_cert: RwLock<Option<Certificate>>,
    ca_key: RwLock<Option<KeyPair>>,
}

impl CertificateAuthority {
    pub fn new(config: CaConfig) -> Self {
        let storage = CaStorage::new(&config.cert_dir);
        Self {
            config,
            storage,
            ca_cert: RwLock::new(None),
            ca_key: RwLock::new(None),
        }
    }

    /// Ensure the CA exists: load it from disk, or generate and persist a
    /// fresh one. Idempotent.
    pub async fn ensure_ca(&self) -> CaResult<()> {
        self.storage.init()?;

        if self.ca_cert.read().await.is_some() {
            return Ok(());
        }

        if self.storage.ca_exists() {
            self.load_ca().await
        } else {
            self.generate_ca().await
        }
    }

    async fn generate_ca(&self) -> CaResult<()> {
        let key_pair = generate_rsa_key_pair()?;
        let params = self.ca_params()?;

        let cert = params.self_signed(&key_pair).map_err(|e| {
            CaError::GenerationFailed(format!("Failed to self-sign CA certificate: {e}"))
        })?;

        self.storage
            .write_cert_file(self.storage.ca_cert_path(), &cert.pem())?;
        self.storage
            .write_key_file(self.storage.ca_key_path(), &key_pair.serialize_pem())?;

        *self.ca_cert.write().await = Some(cert);
        *self.ca_key.write().await = Some(key_pair);

        info!(path = %self.storage.ca_cert_path().display(), "CA certificate generated");
        Ok(())
    }

    async fn load_ca(&self) -> CaResult<()> {
        let key_pem = self.storage.read_file(self.storage.ca_key_path())?;
        let key_pair = KeyPair::from_pem_and_sign_algo(&key_pem, &rcgen::PKCS_RSA_SHA256)
            .map_err(|e| CaError::ParsingError(format!("Failed to parse CA key: {e}")))?;

        // Rebuild the signing certificate from config; the on-disk PEM stays
        // authoritative for issuer-subject comparison.
        let params = self.ca_params()?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            CaError::ParsingError(format!("Failed to reconstruct CA certificate: {e}"))
        })?;

        *self.ca_cert.write().await = Some(cert);
        *self.ca_key.write().await = Some(key_pair);
        Ok(())
    }

    fn ca_params(&self) -> CaResult<CertificateParams> {
        let mut params = CertificateParams::new(vec![])
            .map_err(|e| CaError::GenerationFailed(format!("Failed to create params: {e}")))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, &self.config.ca_common_name);
        dn.push(DnType::OrganizationName, &self.config.organization);
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(self.config.ca_validity_days as i64);
        params.serial_number = Some(random_serial());

        Ok(params)
    }

    /// Ensure the server certificate exists. Idempotent; ensures the CA.
    pub async fn ensure_server_cert(&self) -> CaResult<()> {
        self.ensure_ca().await?;

        if self.storage.server_cert_exists() {
            return Ok(());
        }

        let mut san = vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
            "::1".to_string(),
        ];
        if !san.contains(&self.config.server_hostname) {
            san.push(self.config.server_hostname.clone());
        }

        let mut params = CertificateParams::new(san)
            .map_err(|e| CaError::GenerationFailed(format!("Failed to create params: {e}")))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, &self.config.server_hostname);
        dn.push(DnType::OrganizationName, &self.config.organization);
        params.distinguished_name = dn;

        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(self.config.cert_validity_days as i64);
        params.serial_number = Some(random_serial());

        let key_pair = generate_rsa_key_pair()?;

        let ca_cert = self.ca_cert.read().await;
        let ca_key = self.ca_key.read().await;
        let (ca_cert, ca_key) = match (ca_cert.as_ref(), ca_key.as_ref()) {
            (Some(c), Some(k)) => (c, k),
            _ => return Err(CaError::NotInitialized),
        };

        let cert = params.signed_by(&key_pair, ca_cert, ca_key).map_err(|e| {
            CaError::GenerationFailed(format!("Failed to sign server certificate: {e}"))
        })?;

        self.storage
            .write_cert_file(self.storage.server_cert_path(), &cert.pem())?;
        self.storage
            .write_key_file(self.storage.server_key_path(), &key_pair.serialize_pem())?;

        info!(hostname = self.config.server_hostname, "Server certificate generated");
        Ok(())
    }

    /// Mint a client certificate for an approved host. The common name is
    /// the fqdn and the organizational unit carries the host id; agents
    /// present this pair back during the TLS handshake.
    pub async fn mint_client_cert(
        &self,
        fqdn: &str,
        host_id: &str,
    ) -> CaResult<ClientCertificate> {
        let now = time::OffsetDateTime::now_utc();
        let not_after = now + time::Duration::days(self.config.cert_validity_days as i64);
        self.mint_client_cert_with_validity(fqdn, host_id, now, not_after)
            .await
    }

    async fn mint_client_cert_with_validity(
        &self,
        fqdn: &str,
        host_id: &str,
        not_before: time::OffsetDateTime,
        not_after: time::OffsetDateTime,
    ) -> CaResult<ClientCertificate> {
        self.ensure_ca().await?;

        let mut params = CertificateParams::new(vec![fqdn.to_string()])
            .map_err(|e| CaError::GenerationFailed(format!("Failed to create params: {e}")))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, fqdn);
        dn.push(DnType::OrganizationalUnitName, host_id);
        dn.push(DnType::OrganizationName, &self.config.organization);
        params.distinguished_name = dn;

        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.not_before = not_before;
        params.not_after = not_after;
        params.serial_number = Some(random_serial());

        let key_pair = generate_rsa_key_pair()?;

        let ca_cert = self.ca_cert.read().await;
        let ca_key = self.ca_key.read().await;
        let (ca_cert, ca_key) = match (ca_cert.as_ref(), ca_key.as_ref()) {
            (Some(c), Some(k)) => (c, k),
            _ => return Err(CaError::NotInitialized),
        };

        let cert = params.signed_by(&key_pair, ca_cert, ca_key).map_err(|e| {
            CaError::GenerationFailed(format!("Failed to sign client certificate: {e}"))
        })?;

        let cert_pem = cert.pem();
        let serial = client_cert_serial(&cert_pem)
            .ok_or_else(|| CaError::ParsingError("minted certificate unparseable".into()))?;

        info!(fqdn, host_id, serial, "Client certificate issued");
        Ok(ClientCertificate {
            cert_pem,
            key_pem: key_pair.serialize_pem(),
            serial,
        })
    }

    /// Validate a presented client certificate.
    ///
    /// Checks issuer equality against the on-disk CA certificate (a single
    /// self-signed CA makes full path validation unnecessary) and the
    /// certificate's own validity window, then extracts (fqdn, host_id)
    /// from CN and OU. Any failure yields `None`.
    pub fn validate_client_cert(&self, cert_pem: &str) -> Option<(String, String)> {
        let ca_pem = self.storage.read_file(self.storage.ca_cert_path()).ok()?;
        let (_, ca_parsed) = parse_x509_pem(ca_pem.as_bytes()).ok()?;
        let ca = ca_parsed.parse_x509().ok()?;

        let (_, parsed) = parse_x509_pem(cert_pem.as_bytes()).ok()?;
        let cert = parsed.parse_x509().ok()?;

        if cert.issuer().to_string() != ca.subject().to_string() {
            warn!("Client certificate issuer does not match CA subject");
            return None;
        }
        if !cert.validity().is_valid() {
            warn!("Client certificate outside its validity window");
            return None;
        }

        let fqdn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|a| a.as_str().ok())?
            .to_string();
        let host_id = cert
            .subject()
            .iter_organizational_unit()
            .next()
            .and_then(|a| a.as_str().ok())?
            .to_string();

        if fqdn.is_empty() || host_id.is_empty() {
            return None;
        }
        Some((fqdn, host_id))
    }

    /// Uppercase hex SHA-256 of the DER-encoded server certificate, used by
    /// agents for pinning.
    pub fn server_fingerprint(&self) -> CaResult<String> {
        let pem = self.storage.read_file(self.storage.server_cert_path())?;
        let (_, parsed) = parse_x509_pem(pem.as_bytes())
            .map_err(|e| CaError::ParsingError(format!("Bad server certificate PEM: {e}")))?;
        let digest = Sha256::digest(&parsed.contents);
        Ok(hex::encode_upper(digest))
    }

    /// The CA certificate in PEM form, served to agents for trust setup.
    pub fn ca_cert_pem(&self) -> CaResult<String> {
        self.storage.read_file(self.storage.ca_cert_path())
    }
}

/// Hex serial of a PEM certificate; `None` when the PEM is unparseable.
pub fn client_cert_serial(cert_pem: &str) -> Option<String> {
    let (_, parsed) = parse_x509_pem(cert_pem.as_bytes()).ok()?;
    let cert = parsed.parse_x509().ok()?;
    Some(hex::encode(cert.raw_serial()))
}

fn generate_rsa_key_pair() -> CaResult<KeyPair> {
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};

    let mut rng = rand_core::OsRng;
    let private_key = rsa::RsaPrivateKey::new(&mut rng, 2048)
        .map_err(|e| CaError::KeyGeneration(format!("RSA generation failed: {e}")))?;
    let pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CaError::KeyGeneration(format!("PKCS#8 encoding failed: {e}")))?;
    KeyPair::from_pem_and_sign_algo(&pem, &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| CaError::KeyGeneration(format!("Failed to load RSA key: {e}")))
}

/// Random positive serial from UUID bytes.
fn random_serial() -> SerialNumber {
    let mut bytes = uuid::Uuid::new_v4().as_bytes().to_vec();
    bytes[0] &= 0x7f;
    SerialNumber::from(bytes)
}
