//! Certificate inspection

use crate::IdentityError;
use chrono::{DateTime, Duration, Utc};
use rcgen::KeyPair;
use x509_parser::certificate::X509Certificate;
use x509_parser::parse_x509_certificate;
use x509_parser::pem::parse_x509_pem;
use x509_parser::public_key::PublicKey;

/// Parsed summary of a certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject_cn: String,
    pub issuer_cn: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_ca: bool,
    /// Public key size (RSA modulus or EC field), 0 for other key types
    pub key_bits: usize,
}

impl CertificateInfo {
    pub fn is_expired(&self) -> bool {
        self.not_after <= Utc::now()
    }

    /// Whether the certificate expires within `threshold_days`
    pub fn needs_renewal(&self, threshold_days: u32) -> bool {
        self.not_after - Utc::now() < Duration::days(i64::from(threshold_days))
    }

    pub fn days_until_expiry(&self) -> i64 {
        (self.not_after - Utc::now()).num_days()
    }
}

/// Parse a PEM certificate and run `f` against it
fn with_certificate<T>(
    pem: &str,
    f: impl FnOnce(&X509Certificate<'_>) -> Result<T, IdentityError>,
) -> Result<T, IdentityError> {
    let (_, pem) = parse_x509_pem(pem.as_bytes())
        .map_err(|e| IdentityError::InvalidCertificate(format!("bad PEM: {}", e)))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| IdentityError::InvalidCertificate(format!("bad X.509: {}", e)))?;
    f(&cert)
}

fn timestamp(ts: i64) -> Result<DateTime<Utc>, IdentityError> {
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| IdentityError::InvalidCertificate(format!("timestamp {} out of range", ts)))
}

fn common_name(name: &x509_parser::x509::X509Name<'_>) -> String {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn summarize(cert: &X509Certificate<'_>) -> Result<CertificateInfo, IdentityError> {
    let validity = cert.validity();
    Ok(CertificateInfo {
        subject_cn: common_name(cert.subject()),
        issuer_cn: common_name(cert.issuer()),
        not_before: timestamp(validity.not_before.timestamp())?,
        not_after: timestamp(validity.not_after.timestamp())?,
        is_ca: cert.is_ca(),
        key_bits: key_bits(cert),
    })
}

fn key_bits(cert: &X509Certificate<'_>) -> usize {
    match cert.public_key().parsed() {
        Ok(PublicKey::RSA(rsa)) => rsa.key_size(),
        Ok(PublicKey::EC(point)) => point.key_size(),
        _ => 0,
    }
}

/// Summarize a PEM certificate
pub fn inspect_certificate(pem: &str) -> Result<CertificateInfo, IdentityError> {
    with_certificate(pem, summarize)
}

/// Summarize a DER certificate, as presented by a TLS peer
pub fn inspect_certificate_der(der: &[u8]) -> Result<CertificateInfo, IdentityError> {
    let (_, cert) = parse_x509_certificate(der)
        .map_err(|e| IdentityError::InvalidCertificate(format!("bad X.509: {}", e)))?;
    summarize(&cert)
}

/// Whether `cert_pem` carries a valid signature made by the key of `ca_pem`
pub fn is_signed_by(cert_pem: &str, ca_pem: &str) -> Result<bool, IdentityError> {
    with_certificate(ca_pem, |ca| {
        with_certificate(cert_pem, |cert| {
            Ok(cert.verify_signature(Some(ca.public_key())).is_ok())
        })
    })
}

/// Whether `key` is the private half of the public key in `cert_pem`
pub fn matches_key(cert_pem: &str, key: &KeyPair) -> Result<bool, IdentityError> {
    with_certificate(cert_pem, |cert| {
        Ok(cert.public_key().subject_public_key.data[..] == *key.public_key_raw())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, IsCa, PKCS_ECDSA_P256_SHA256};

    fn self_signed(cn: &str, ca: bool) -> (String, KeyPair) {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, cn);
        if ca {
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        }
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key)
    }

    #[test]
    fn test_inspect_certificate() {
        let (pem, _) = self_signed("smite-test", true);
        let info = inspect_certificate(&pem).unwrap();

        assert_eq!(info.subject_cn, "smite-test");
        assert_eq!(info.issuer_cn, "smite-test");
        assert!(info.is_ca);
        assert!(!info.is_expired());
    }

    #[test]
    fn test_inspect_der_matches_pem() {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(rcgen::DnType::CommonName, "node-7");
        let cert = params.self_signed(&key).unwrap();

        let from_der = inspect_certificate_der(cert.der()).unwrap();
        assert_eq!(from_der, inspect_certificate(&cert.pem()).unwrap());
        assert_eq!(from_der.subject_cn, "node-7");
        assert!(!from_der.is_ca);
        assert_eq!(from_der.key_bits, 256);
    }

    #[test]
    fn test_inspect_garbage() {
        assert!(matches!(
            inspect_certificate("not a certificate"),
            Err(IdentityError::InvalidCertificate(_))
        ));
    }

    #[test]
    fn test_needs_renewal() {
        let now = Utc::now();
        let mut info = CertificateInfo {
            subject_cn: "x".to_string(),
            issuer_cn: "x".to_string(),
            not_before: now,
            not_after: now + Duration::days(20),
            is_ca: false,
            key_bits: 2048,
        };
        assert!(info.needs_renewal(30));
        assert!(!info.is_expired());

        info.not_after = now + Duration::days(60);
        assert!(!info.needs_renewal(30));

        info.not_after = now - Duration::days(1);
        assert!(info.is_expired());
        assert!(info.days_until_expiry() < 0);
    }

    #[test]
    fn test_signature_and_key_checks() {
        let (pem_a, key_a) = self_signed("a", true);
        let (pem_b, key_b) = self_signed("b", true);

        assert!(is_signed_by(&pem_a, &pem_a).unwrap());
        assert!(!is_signed_by(&pem_a, &pem_b).unwrap());

        assert!(matches_key(&pem_a, &key_a).unwrap());
        assert!(!matches_key(&pem_a, &key_b).unwrap());
    }
}
