//! OTS Stamping Service
//!
//! Creates detached timestamps for event digests, upgrades pending
//! attestations by grafting calendar responses into the proof tree (the
//! pending path is kept so no information is lost), and verifies Bitcoin
//! attestations against a node or the explorer fallback.

use base64::Engine;
use opentimestamps::attestation::Attestation;
use opentimestamps::ser::{Deserializer, DigestType};
use opentimestamps::timestamp::{Step, StepData, Timestamp};
use opentimestamps::DetachedTimestampFile;
use std::io::Cursor;
use tracing::{debug, info};

use crate::config::BtcRpcConfig;
use crate::error::{Result, StreamError};
use crate::event::Event;
use crate::ots::bitcoin::{explorer_anchor_at_height, BitcoinRpc};
use crate::ots::{calendar, Timestamper, Verification, DEFAULT_CALENDAR};

use async_trait::async_trait;

const DEFAULT_EXPLORER: &str = "https://blockchain.info";

/// Serialized attestation tags, searched for in raw proof bytes.
const BITCOIN_ATTESTATION_TAG: &str = "0588960d73d71901";
const PENDING_ATTESTATION_TAG: &str = "83dfe30d2ef90c8e";

/// Magic header of a detached OTS file.
const OTS_FILE_MAGIC: &[u8] = b"\x00OpenTimestamps\x00\x00Proof\x00\xbf\x89\xe2\xe8\x84\xe8\x92\x94";

/// OTS timestamper backed by a remote calendar, with Bitcoin verification
/// through an optional RPC node or the explorer fallback.
pub struct OtsService {
    calendar_url: String,
    explorer_url: String,
    rpc: Option<BitcoinRpc>,
}

impl OtsService {
    pub fn new(rpc_config: Option<BtcRpcConfig>) -> Result<Self> {
        Self::with_urls(
            DEFAULT_CALENDAR.to_string(),
            DEFAULT_EXPLORER.to_string(),
            rpc_config,
        )
    }

    pub fn with_urls(
        calendar_url: String,
        explorer_url: String,
        rpc_config: Option<BtcRpcConfig>,
    ) -> Result<Self> {
        let rpc = match rpc_config {
            Some(config) => Some(BitcoinRpc::new(config)?),
            None => None,
        };
        Ok(Self {
            calendar_url,
            explorer_url,
            rpc,
        })
    }

    fn decode_blob(event: &Event) -> Result<Vec<u8>> {
        let blob = event
            .ots
            .as_deref()
            .ok_or_else(|| StreamError::MissingOts(event.id.clone()))?;
        base64::engine::general_purpose::STANDARD
            .decode(blob)
            .map_err(|e| StreamError::OtsMalformed(format!("bad base64: {}", e)))
    }

    fn parse_detached(bytes: &[u8]) -> Result<DetachedTimestampFile> {
        DetachedTimestampFile::from_reader(Cursor::new(bytes))
            .map_err(|e| StreamError::OtsMalformed(e.to_string()))
    }

    fn encode_detached(detached: &DetachedTimestampFile) -> Result<String> {
        let mut bytes = Vec::new();
        detached
            .to_writer(&mut bytes)
            .map_err(|e| StreamError::OtsMalformed(e.to_string()))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }
}

#[async_trait]
impl Timestamper for OtsService {
    async fn stamp(&self, event: &Event) -> Result<String> {
        let digest = event.digest();
        let continuation = calendar::submit_digest(&self.calendar_url, &digest).await?;

        // Assemble a detached file around the calendar's continuation and
        // round-trip it through the parser to reject garbage responses.
        let mut raw = Vec::new();
        raw.extend_from_slice(OTS_FILE_MAGIC);
        raw.push(0x01); // version
        raw.push(0x08); // SHA-256
        raw.extend_from_slice(&digest);
        raw.extend_from_slice(&continuation);

        let detached = Self::parse_detached(&raw)?;
        info!("stamped event {} via {}", event.id, self.calendar_url);
        Self::encode_detached(&detached)
    }

    fn is_upgraded(&self, event: &Event) -> Result<bool> {
        let bytes = Self::decode_blob(event)?;
        let hex = hex::encode(&bytes);
        let has_bitcoin = hex.contains(BITCOIN_ATTESTATION_TAG);
        let has_pending = hex.contains(PENDING_ATTESTATION_TAG);
        match (has_bitcoin, has_pending) {
            (true, true) => Err(StreamError::OtsMalformed(format!(
                "event {} carries both bitcoin and pending attestation tags",
                event.id
            ))),
            (false, false) => Err(StreamError::OtsMalformed(format!(
                "event {} carries no attestation tags",
                event.id
            ))),
            (bitcoin, _) => Ok(bitcoin),
        }
    }

    async fn upgrade(&self, event: &Event) -> Result<String> {
        let bytes = Self::decode_blob(event)?;
        let mut detached = Self::parse_detached(&bytes)?;

        if find_bitcoin_attestation(&detached.timestamp.first_step).is_some() {
            debug!("event {} already anchored, nothing to upgrade", event.id);
            return Ok(base64::engine::general_purpose::STANDARD.encode(bytes));
        }

        let pending = collect_pending_attestations(
            &detached.timestamp.first_step,
            &detached.timestamp.start_digest,
        );
        if pending.is_empty() {
            return Err(StreamError::OtsMalformed(format!(
                "event {} has no pending attestations to upgrade",
                event.id
            )));
        }

        let mut changed = false;
        for (commitment, uri) in pending {
            let response = calendar::fetch_upgrade(&uri, &commitment).await?;
            let mut deserializer = Deserializer::new(Cursor::new(&response));
            let upgraded = Timestamp::deserialize(&mut deserializer, commitment.clone())
                .map_err(|e| StreamError::OtsUpgradeFailed(e.to_string()))?;
            if graft_upgrade(
                &mut detached.timestamp.first_step,
                &commitment,
                &upgraded.first_step,
            ) {
                changed = true;
            }
        }

        if !changed {
            return Err(StreamError::OtsUpgradeFailed(format!(
                "no attestation path of event {} could be upgraded",
                event.id
            )));
        }

        info!("upgraded OTS attestation for event {}", event.id);
        Self::encode_detached(&detached)
    }

    async fn verify(&self, event: &Event) -> Result<Verification> {
        let bytes = Self::decode_blob(event)?;
        let detached = Self::parse_detached(&bytes)?;

        if detached.timestamp.start_digest != event.digest() {
            return Err(StreamError::OtsMalformed(format!(
                "attestation of event {} commits to a different digest",
                event.id
            )));
        }

        let detached = if find_bitcoin_attestation(&detached.timestamp.first_step).is_none() {
            match self.upgrade(event).await {
                Ok(upgraded) => {
                    let bytes = base64::engine::general_purpose::STANDARD
                        .decode(upgraded)
                        .map_err(|e| StreamError::OtsMalformed(format!("bad base64: {}", e)))?;
                    Self::parse_detached(&bytes)?
                }
                Err(StreamError::OtsPending) => return Ok(Verification::Pending),
                Err(StreamError::OtsWaitingConfirmations) => return Ok(Verification::Waiting),
                Err(e) => return Err(e),
            }
        } else {
            detached
        };

        let (height, attested_digest) = find_bitcoin_attestation(&detached.timestamp.first_step)
            .ok_or_else(|| {
                StreamError::OtsMalformed(format!(
                    "event {} has no bitcoin attestation after upgrade",
                    event.id
                ))
            })?;

        let anchor = match &self.rpc {
            Some(rpc) => rpc.anchor_at_height(height as u64).await?,
            None => explorer_anchor_at_height(&self.explorer_url, height as u64).await?,
        };

        // Explorers and nodes print merkle roots byte-reversed.
        let mut reversed = attested_digest;
        reversed.reverse();
        let expected = hex::encode(reversed);
        if !expected.eq_ignore_ascii_case(&anchor.merkle_root) {
            return Err(StreamError::OtsMalformed(format!(
                "merkle root mismatch at height {}: proof commits to {}, block has {}",
                height, expected, anchor.merkle_root
            )));
        }

        debug!(
            "event {} attested at height {} (block time {})",
            event.id, height, anchor.time
        );
        Ok(Verification::Confirmed {
            attested_at: anchor.time,
        })
    }

    fn has_rpc_configured(&self) -> bool {
        self.rpc.is_some()
    }
}

/// First Bitcoin attestation in the proof tree: `(height, attested digest)`.
fn find_bitcoin_attestation(step: &Step) -> Option<(usize, Vec<u8>)> {
    if let StepData::Attestation(Attestation::Bitcoin { height }) = &step.data {
        return Some((*height, step.output.clone()));
    }
    step.next.iter().find_map(find_bitcoin_attestation)
}

/// Every pending attestation with the commitment it attests to.
fn collect_pending_attestations(step: &Step, commitment: &[u8]) -> Vec<(Vec<u8>, String)> {
    let mut pending = Vec::new();
    if let StepData::Attestation(Attestation::Pending { uri }) = &step.data {
        pending.push((commitment.to_vec(), uri.clone()));
    }
    for next in &step.next {
        pending.extend(collect_pending_attestations(next, &next.output));
    }
    pending
}

/// Graft an upgraded continuation next to the pending attestation for
/// `commitment`. The pending path stays in place.
fn graft_upgrade(step: &mut Step, commitment: &[u8], upgraded: &Step) -> bool {
    let mut changed = false;
    let has_pending_here = step.output == commitment
        && step.next.iter().any(|child| {
            matches!(
                child.data,
                StepData::Attestation(Attestation::Pending { .. })
            ) && child.output == commitment
        });
    if has_pending_here && !step.next.iter().any(|child| steps_match(child, upgraded)) {
        step.next.push(upgraded.clone());
        changed = true;
    }
    for child in &mut step.next {
        if graft_upgrade(child, commitment, upgraded) {
            changed = true;
        }
    }
    changed
}

/// Whether two steps carry the same operation or attestation over the same
/// output.
fn steps_match(a: &Step, b: &Step) -> bool {
    if a.output != b.output {
        return false;
    }
    match (&a.data, &b.data) {
        (StepData::Op(op_a), StepData::Op(op_b)) => {
            std::mem::discriminant(op_a) == std::mem::discriminant(op_b)
        }
        (StepData::Fork, StepData::Fork) => true,
        (
            StepData::Attestation(Attestation::Bitcoin { height: height_a }),
            StepData::Attestation(Attestation::Bitcoin { height: height_b }),
        ) => height_a == height_b,
        (
            StepData::Attestation(Attestation::Pending { uri: uri_a }),
            StepData::Attestation(Attestation::Pending { uri: uri_b }),
        ) => uri_a == uri_b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{generate_keypair, keypair_from_hex};
    use crate::event::{Event, GENESIS};

    fn signed_event() -> Event {
        let (privkey, pubkey) = generate_keypair();
        let keypair = keypair_from_hex(&privkey).unwrap();
        let mut event =
            Event::new_text_note(pubkey, GENESIS.to_string(), "hello".to_string(), 1700000000);
        event.sign(&keypair).unwrap();
        event
    }

    fn attach_blob(event: &mut Event, attestation: Attestation, output: Vec<u8>) {
        let detached = DetachedTimestampFile {
            digest_type: DigestType::Sha256,
            timestamp: Timestamp {
                start_digest: event.digest().to_vec(),
                first_step: Step {
                    data: StepData::Attestation(attestation),
                    output,
                    next: vec![],
                },
            },
        };
        event.ots = Some(OtsService::encode_detached(&detached).unwrap());
    }

    #[test]
    fn test_is_upgraded_pending_blob() {
        let mut event = signed_event();
        let digest = event.digest().to_vec();
        attach_blob(
            &mut event,
            Attestation::Pending {
                uri: "https://alice.btc.calendar.opentimestamps.org".to_string(),
            },
            digest,
        );
        let service = OtsService::new(None).unwrap();
        assert!(!service.is_upgraded(&event).unwrap());
    }

    #[test]
    fn test_is_upgraded_bitcoin_blob() {
        let mut event = signed_event();
        let digest = event.digest().to_vec();
        attach_blob(&mut event, Attestation::Bitcoin { height: 800000 }, digest);
        let service = OtsService::new(None).unwrap();
        assert!(service.is_upgraded(&event).unwrap());
    }

    #[test]
    fn test_is_upgraded_missing_blob() {
        let event = signed_event();
        let service = OtsService::new(None).unwrap();
        assert!(matches!(
            service.is_upgraded(&event),
            Err(StreamError::MissingOts(_))
        ));
    }

    #[tokio::test]
    async fn test_verify_pending_attestation_is_provisional() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", mockito::Matcher::Regex(r"^/timestamp/.*$".to_string()))
            .with_status(404)
            .with_body("Pending confirmation in Bitcoin blockchain")
            .create_async()
            .await;

        let mut event = signed_event();
        let digest = event.digest().to_vec();
        attach_blob(&mut event, Attestation::Pending { uri: server.url() }, digest);

        let service = OtsService::new(None).unwrap();
        let verification = service.verify(&event).await.unwrap();
        assert_eq!(verification, Verification::Pending);
        assert_eq!(verification.attested_at(), None);
    }

    #[tokio::test]
    async fn test_verify_confirmed_attestation_against_explorer() {
        let mut event = signed_event();
        // The attested digest (here the event digest itself) is the block
        // merkle root in internal byte order; the explorer reports it
        // reversed.
        let root: Vec<u8> = event.digest().to_vec();
        let mut display = root.clone();
        display.reverse();

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/block-height/800000?format=json")
            .with_status(200)
            .with_body(format!(
                r#"{{"blocks":[{{"mrkl_root":"{}","time":1690168629}}]}}"#,
                hex::encode(display)
            ))
            .create_async()
            .await;

        attach_blob(&mut event, Attestation::Bitcoin { height: 800000 }, root);

        let service = OtsService::with_urls(
            "http://unused.calendar.invalid".to_string(),
            server.url(),
            None,
        )
        .unwrap();
        let verification = service.verify(&event).await.unwrap();
        assert_eq!(
            verification,
            Verification::Confirmed {
                attested_at: 1690168629
            }
        );
    }

    #[tokio::test]
    async fn test_verify_rejects_digest_mismatch() {
        let mut event = signed_event();
        let wrong_digest = vec![0u8; 32];
        let detached = DetachedTimestampFile {
            digest_type: DigestType::Sha256,
            timestamp: Timestamp {
                start_digest: wrong_digest.clone(),
                first_step: Step {
                    data: StepData::Attestation(Attestation::Bitcoin { height: 1 }),
                    output: wrong_digest,
                    next: vec![],
                },
            },
        };
        event.ots = Some(OtsService::encode_detached(&detached).unwrap());

        let service = OtsService::new(None).unwrap();
        assert!(matches!(
            service.verify(&event).await,
            Err(StreamError::OtsMalformed(_))
        ));
    }

    #[test]
    fn test_graft_keeps_pending_path() {
        let commitment: Vec<u8> = vec![7u8; 32];
        let mut root = Step {
            data: StepData::Op(opentimestamps::op::Op::Sha256),
            output: commitment.clone(),
            next: vec![Step {
                data: StepData::Attestation(Attestation::Pending {
                    uri: "https://calendar.invalid".to_string(),
                }),
                output: commitment.clone(),
                next: vec![],
            }],
        };
        let upgraded = Step {
            data: StepData::Attestation(Attestation::Bitcoin { height: 800000 }),
            output: commitment.clone(),
            next: vec![],
        };

        assert!(graft_upgrade(&mut root, &commitment, &upgraded));
        assert_eq!(root.next.len(), 2);
        // A second graft of the same continuation is a no-op.
        assert!(!graft_upgrade(&mut root, &commitment, &upgraded));
    }
}
