//! HTTP access to revocation sources

use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE};

use super::VerifyError;
use crate::certificate::PeerCertificate;
use crate::config::ConfigError;

const OCSP_REQUEST_CONTENT_TYPE: &str = "application/ocsp-request";
const OCSP_RESPONSE_CONTENT_TYPE: &str = "application/ocsp-response";

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(ConfigError::HttpClient)
}

/// GET a resource and return its body
pub(crate) async fn get(http: &reqwest::Client, url: &str) -> Result<Vec<u8>, VerifyError> {
    let http_error = |source| VerifyError::Http {
        url: url.to_string(),
        source,
    };

    let response = http
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(http_error)?;
    let body = response.bytes().await.map_err(http_error)?;
    Ok(body.to_vec())
}

/// POST a DER encoded OCSP request and return the DER response
pub(crate) async fn post_ocsp(
    http: &reqwest::Client,
    url: &str,
    request: Vec<u8>,
) -> Result<Vec<u8>, VerifyError> {
    let http_error = |source| VerifyError::Http {
        url: url.to_string(),
        source,
    };

    let response = http
        .post(url)
        .header(CONTENT_TYPE, OCSP_REQUEST_CONTENT_TYPE)
        .header(ACCEPT, OCSP_RESPONSE_CONTENT_TYPE)
        .body(request)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(http_error)?;
    let body = response.bytes().await.map_err(http_error)?;
    Ok(body.to_vec())
}

/// Download an issuer certificate published as PEM or DER
pub(crate) async fn fetch_certificate(
    http: &reqwest::Client,
    url: &str,
) -> Result<PeerCertificate, VerifyError> {
    let body = get(http, url).await?;
    Ok(PeerCertificate::from_pem_or_der(&body)?)
}
