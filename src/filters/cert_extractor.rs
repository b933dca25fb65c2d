//! Certificate field extractor.
//!
//! Copies one field of a peer certificate's subject or issuer name into a
//! request header. Requests without TLS state pass through untouched.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{Filter, FilterContext, FilterError, FilterResult, FilterSpec, Kind};
use crate::context::{DistinguishedName, HttpContext, PeerCertificate};

pub static KIND: Kind = Kind {
    name: "CertExtractor",
    description: "CertExtractor extracts a given field from TLS certificates and sets it to request headers.",
    results: &[],
    default_spec: || json!({}),
    validate,
    create_instance,
};

/// Which name of the certificate to read.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Subject,
    Issuer,
}

impl Target {
    fn as_str(&self) -> &'static str {
        match self {
            Target::Subject => "subject",
            Target::Issuer => "issuer",
        }
    }
}

/// Distinguished name attribute to extract.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum Field {
    Country,
    Organization,
    OrganizationalUnit,
    Locality,
    Province,
    StreetAddress,
    PostalCode,
    SerialNumber,
    CommonName,
}

impl Field {
    fn as_str(&self) -> &'static str {
        match self {
            Field::Country => "Country",
            Field::Organization => "Organization",
            Field::OrganizationalUnit => "OrganizationalUnit",
            Field::Locality => "Locality",
            Field::Province => "Province",
            Field::StreetAddress => "StreetAddress",
            Field::PostalCode => "PostalCode",
            Field::SerialNumber => "SerialNumber",
            Field::CommonName => "CommonName",
        }
    }

    fn values<'a>(&self, name: &'a DistinguishedName) -> &'a [String] {
        match self {
            Field::Country => &name.country,
            Field::Organization => &name.organization,
            Field::OrganizationalUnit => &name.organizational_unit,
            Field::Locality => &name.locality,
            Field::Province => &name.province,
            Field::StreetAddress => &name.street_address,
            Field::PostalCode => &name.postal_code,
            Field::SerialNumber => std::slice::from_ref(&name.serial_number),
            Field::CommonName => std::slice::from_ref(&name.common_name),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertExtractorSpec {
    /// Positive counts from the leaf, negative from the end; wraps around.
    pub cert_index: i16,
    pub target: Target,
    pub field: Field,
    #[serde(default)]
    pub header_key: Option<String>,
}

impl CertExtractorSpec {
    fn header_name(&self) -> Result<HeaderName, String> {
        let key = match &self.header_key {
            Some(key) if !key.is_empty() => key.clone(),
            _ => format!("tls-{}-{}", self.target.as_str(), self.field.as_str()),
        };
        HeaderName::from_bytes(key.as_bytes()).map_err(|_| format!("invalid headerKey {:?}", key))
    }
}

/// Resolve a signed index into a chain of `len` certificates.
///
/// The index wraps modulo `len` in both directions: `((index % len) + len) % len`.
/// So `-1` is the last certificate, and over three certificates `3` is the
/// first while `-4` is the last. Out-of-range indexes never clamp.
pub fn resolve_index(index: i16, len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    let n = len as i64;
    Some(((i64::from(index) % n + n) % n) as usize)
}

pub struct CertExtractor {
    spec: FilterSpec,
    typed: CertExtractorSpec,
    header: HeaderName,
}

fn validate(spec: &FilterSpec) -> Result<(), FilterError> {
    let typed: CertExtractorSpec = spec.decode(&KIND)?;
    typed.header_name().map_err(|e| FilterError::invalid(&spec.name, e))?;
    Ok(())
}

fn create_instance(spec: FilterSpec, _ctx: &FilterContext) -> Result<Arc<dyn Filter>, FilterError> {
    let typed: CertExtractorSpec = spec.decode(&KIND)?;
    let header = typed
        .header_name()
        .map_err(|e| FilterError::invalid(&spec.name, e))?;
    Ok(Arc::new(CertExtractor {
        spec,
        typed,
        header,
    }))
}

impl CertExtractor {
    fn select<'a>(&self, chain: &'a [PeerCertificate]) -> Option<&'a DistinguishedName> {
        let cert = chain.get(resolve_index(self.typed.cert_index, chain.len())?)?;
        Some(match self.typed.target {
            Target::Subject => &cert.subject,
            Target::Issuer => &cert.issuer,
        })
    }
}

#[async_trait]
impl Filter for CertExtractor {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn kind(&self) -> &'static Kind {
        &KIND
    }

    fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    async fn handle(&self, ctx: &mut HttpContext) -> FilterResult {
        let values: Vec<HeaderValue> = {
            let Some(tls) = ctx.request().tls() else {
                return FilterResult::Continue;
            };
            let Some(name) = self.select(&tls.peer_certificates) else {
                return FilterResult::Continue;
            };
            self.typed
                .field
                .values(name)
                .iter()
                .filter(|v| !v.is_empty())
                .filter_map(|v| HeaderValue::from_str(v).ok())
                .collect()
        };

        let headers = ctx.request_mut().headers_mut();
        for value in values {
            headers.append(self.header.clone(), value);
        }
        FilterResult::Continue
    }

    fn close(&self) {}
}
