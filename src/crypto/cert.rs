//! X.509 issuance for keyset CAs, signers and SUDI identities.
use super::{CryptoError, Result};
use chrono::{Months, TimeZone, Utc};
use der::asn1::{Any, OctetString};
use der::oid::ObjectIdentifier;
use der::{Encode, Tag};
use rand::RngCore;
use rsa::pkcs1v15::{Signature, SigningKey};
use rsa::pkcs8::EncodePublicKey;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::time::SystemTime;
use x509_cert::attr::AttributeTypeAndValue;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::ext::pkix::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages,
    SubjectKeyIdentifier,
};
use x509_cert::name::{Name, RdnSequence, RelativeDistinguishedName};
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::{Time, Validity};
use x509_cert::Certificate;

pub use der::flagset::FlagSet;

pub const OID_COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
pub const OID_SERIAL_NUMBER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.5");
pub const OID_ORGANIZATION: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");
pub const OID_ORGANIZATIONAL_UNIT: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.11");

pub const EKU_SERVER_AUTH: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.1");
pub const EKU_CLIENT_AUTH: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.2");
pub const EKU_CODE_SIGNING: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.3");

/// Distinguished name fields we ever set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subject {
    pub common_name: String,
    pub organizations: Vec<String>,
    pub organizational_unit: Option<String>,
    pub serial_number: Option<String>,
}

fn attribute(oid: ObjectIdentifier, tag: Tag, value: &str) -> Result<AttributeTypeAndValue> {
    Ok(AttributeTypeAndValue {
        oid,
        value: Any::new(tag, value.as_bytes().to_vec())?,
    })
}

impl Subject {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            ..Default::default()
        }
    }

    pub fn with_organizations(mut self, orgs: &[String]) -> Self {
        self.organizations = orgs.to_vec();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.organizational_unit = Some(unit.into());
        self
    }

    pub fn with_serial_number(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    /// O, OU, CN, serialNumber in that order; all organizations share one RDN.
    pub fn to_name(&self) -> Result<Name> {
        let mut rdns = vec![];
        if !self.organizations.is_empty() {
            let orgs = self
                .organizations
                .iter()
                .map(|o| attribute(OID_ORGANIZATION, Tag::Utf8String, o))
                .collect::<Result<Vec<_>>>()?;
            rdns.push(RelativeDistinguishedName::try_from(orgs)?);
        }
        if let Some(unit) = &self.organizational_unit {
            rdns.push(RelativeDistinguishedName::try_from(vec![attribute(
                OID_ORGANIZATIONAL_UNIT,
                Tag::Utf8String,
                unit,
            )?])?);
        }
        rdns.push(RelativeDistinguishedName::try_from(vec![attribute(
            OID_COMMON_NAME,
            Tag::Utf8String,
            &self.common_name,
        )?])?);
        if let Some(serial) = &self.serial_number {
            rdns.push(RelativeDistinguishedName::try_from(vec![attribute(
                OID_SERIAL_NUMBER,
                Tag::PrintableString,
                serial,
            )?])?);
        }
        Ok(RdnSequence(rdns))
    }
}

#[derive(Debug, Clone)]
pub struct CertTemplate {
    pub subject: Subject,
    pub is_ca: bool,
    pub key_usage: FlagSet<KeyUsages>,
    pub ext_key_usage: Vec<ObjectIdentifier>,
    pub not_after: SystemTime,
}

impl CertTemplate {
    /// A self-signed CA root.
    pub fn ca(subject: Subject, not_after: SystemTime) -> Self {
        Self {
            subject,
            is_ca: true,
            key_usage: KeyUsages::KeyCertSign | KeyUsages::CRLSign | KeyUsages::DigitalSignature,
            ext_key_usage: vec![],
            not_after,
        }
    }

    /// A code-signing leaf.
    pub fn code_signing(subject: Subject, not_after: SystemTime) -> Self {
        Self {
            subject,
            is_ca: false,
            key_usage: KeyUsages::DigitalSignature.into(),
            ext_key_usage: vec![EKU_CODE_SIGNING],
            not_after,
        }
    }
}

/// Who signs a certificate being issued.
pub enum Issuer<'a> {
    SelfSigned(&'a RsaPrivateKey),
    Ca {
        cert: &'a Certificate,
        key: &'a RsaPrivateKey,
    },
}

/// `now + years`, calendar aware.
pub fn years_from_now(years: u32) -> SystemTime {
    let now = Utc::now();
    now.checked_add_months(Months::new(years * 12))
        .unwrap_or(now)
        .into()
}

/// Fixed expiry of SUDI certificates, 2099-12-31 23:00:00 UTC.
pub fn sudi_not_after() -> SystemTime {
    Utc.with_ymd_and_hms(2099, 12, 31, 23, 0, 0)
        .single()
        .map(SystemTime::from)
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// SHA-1 over the DER SubjectPublicKeyInfo.
pub fn subject_key_id(spki: &SubjectPublicKeyInfoOwned) -> Result<Vec<u8>> {
    Ok(Sha1::digest(spki.to_der()?).to_vec())
}

fn spki_of(key: &RsaPublicKey) -> Result<SubjectPublicKeyInfoOwned> {
    let der = key
        .to_public_key_der()
        .map_err(|e| CryptoError::Encode(e.to_string()))?;
    SubjectPublicKeyInfoOwned::try_from(der.as_bytes())
        .map_err(|e| CryptoError::Encode(e.to_string()))
}

/// Uniform over [0, 2^128).
fn random_serial() -> Result<SerialNumber> {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    Ok(SerialNumber::new(&bytes)?)
}

/// Issue an X.509 v3 certificate for `subject_key` from `template`.
pub fn issue(
    template: &CertTemplate,
    subject_key: &RsaPublicKey,
    issuer: Issuer<'_>,
) -> Result<Certificate> {
    let spki = spki_of(subject_key)?;
    let ski = subject_key_id(&spki)?;
    let (signing_key, issuer_name, authority_key_id) = match issuer {
        Issuer::SelfSigned(key) => (key, None, None),
        Issuer::Ca { cert, key } => (
            key,
            Some(cert.tbs_certificate.subject.clone()),
            Some(subject_key_id(&cert.tbs_certificate.subject_public_key_info)?),
        ),
    };
    let signer = SigningKey::<Sha256>::new(signing_key.clone());
    let validity = Validity {
        not_before: Time::try_from(SystemTime::now())?,
        not_after: Time::try_from(template.not_after)?,
    };

    let mut builder = CertificateBuilder::new(
        Profile::Manual {
            issuer: issuer_name,
        },
        random_serial()?,
        validity,
        template.subject.to_name()?,
        spki,
        &signer,
    )?;
    builder.add_extension(&BasicConstraints {
        ca: template.is_ca,
        path_len_constraint: None,
    })?;
    builder.add_extension(&KeyUsage(template.key_usage))?;
    if !template.ext_key_usage.is_empty() {
        builder.add_extension(&ExtendedKeyUsage(template.ext_key_usage.clone()))?;
    }
    builder.add_extension(&SubjectKeyIdentifier(OctetString::new(ski)?))?;
    if let Some(akid) = authority_key_id {
        builder.add_extension(&AuthorityKeyIdentifier {
            key_identifier: Some(OctetString::new(akid)?),
            authority_cert_issuer: None,
            authority_cert_serial_number: None,
        })?;
    }

    Ok(builder.build::<Signature>()?)
}

/// The first value of an attribute in a name, as a string.
pub fn name_attribute(name: &Name, oid: ObjectIdentifier) -> Option<String> {
    name.0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .find(|atv| atv.oid == oid)
        .map(|atv| String::from_utf8_lossy(atv.value.value()).into_owned())
}
