//! OTS Calendar Client
//!
//! HTTP access to OpenTimestamps calendar servers: digest submission at
//! stamp time and commitment lookup at upgrade time.

use std::time::Duration;
use tracing::debug;

use crate::error::{Result, StreamError};

/// Calendar responses larger than this are rejected outright.
const MAX_RESPONSE_SIZE: usize = 10_000;

const CALENDAR_TIMEOUT: Duration = Duration::from_secs(30);

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(CALENDAR_TIMEOUT)
        .build()
        .map_err(StreamError::Http)
}

/// Submit a digest to a calendar server, returning the timestamp
/// continuation bytes rooted at the digest.
pub async fn submit_digest(calendar_url: &str, digest: &[u8]) -> Result<Vec<u8>> {
    debug!("submitting digest to calendar {}", calendar_url);

    let response = http_client()?
        .post(format!("{}/digest", calendar_url))
        .header("Accept", "application/vnd.opentimestamps.v1")
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(digest.to_vec())
        .send()
        .await
        .map_err(|e| StreamError::CalendarUnreachable(format!("{}: {}", calendar_url, e)))?;

    if !response.status().is_success() {
        return Err(StreamError::CalendarUnreachable(format!(
            "{} returned {}",
            calendar_url,
            response.status()
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| StreamError::CalendarUnreachable(format!("{}: {}", calendar_url, e)))?;

    if bytes.len() > MAX_RESPONSE_SIZE {
        return Err(StreamError::OtsMalformed(format!(
            "calendar response too large: {} bytes (max {})",
            bytes.len(),
            MAX_RESPONSE_SIZE
        )));
    }

    Ok(bytes.to_vec())
}

/// Ask a calendar for the Bitcoin-anchored continuation of a pending
/// commitment. Maps the calendar's progress answers to `OtsPending` and
/// `OtsWaitingConfirmations`.
pub async fn fetch_upgrade(calendar_url: &str, commitment: &[u8]) -> Result<Vec<u8>> {
    let commitment_hex = hex::encode(commitment);
    debug!("querying {} for commitment {}", calendar_url, commitment_hex);

    let response = http_client()?
        .get(format!("{}/timestamp/{}", calendar_url, commitment_hex))
        .header("Accept", "application/vnd.opentimestamps.v1")
        .send()
        .await
        .map_err(|e| StreamError::CalendarUnreachable(format!("{}: {}", calendar_url, e)))?;

    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| StreamError::CalendarUnreachable(format!("{}: {}", calendar_url, e)))?;

    if !status.is_success() {
        let body = String::from_utf8_lossy(&bytes);
        if body.contains("Pending confirmation in Bitcoin blockchain") {
            return Err(StreamError::OtsPending);
        }
        if body.contains("waiting for") && body.contains("confirmations") {
            return Err(StreamError::OtsWaitingConfirmations);
        }
        return Err(StreamError::OtsUpgradeFailed(format!(
            "{} returned {}: {}",
            calendar_url, status, body
        )));
    }

    if bytes.len() > MAX_RESPONSE_SIZE {
        return Err(StreamError::OtsMalformed(format!(
            "calendar response too large: {} bytes (max {})",
            bytes.len(),
            MAX_RESPONSE_SIZE
        )));
    }

    Ok(bytes.to_vec())
}
