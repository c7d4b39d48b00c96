//! Negotiation protocol plumbing shared by every variant.
//!
//! A protocol variant supplies the full capability set behind
//! [`ProtocolHandler`]; the shared [`ProtocolCore`] implements the parts
//! that are identical across variants (proposal construction, the decision
//! pipeline, message delivery). Variants are looked up by name in an
//! explicit [`ProtocolRegistry`]; nothing registers itself.

pub mod basic;
pub mod ledger;

use crate::error::{AccordError, Result};
use crate::policy::{self, Policy, PolicyManager};
use crate::signing::{terms_hash, Signer};
use crate::transport::{MessageSender, MessageTarget};
use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use basic::BasicProtocol;
pub use ledger::LedgerProtocol;

pub const MSG_TYPE_PROPOSAL: &str = "proposal";
pub const MSG_TYPE_REPLY: &str = "reply";
pub const MSG_TYPE_REPLY_ACK: &str = "replyack";
pub const MSG_TYPE_DATA_RECEIVED: &str = "dataverification";
pub const MSG_TYPE_METERING: &str = "meteringnotification";
pub const MSG_TYPE_CANCEL: &str = "cancel";

// Producer-side termination reasons.
pub const CANCEL_NOT_ANCHORED: u64 = 100;
pub const CANCEL_POLICY_CHANGED: u64 = 101;
pub const CANCEL_WORKLOAD_FAILURE: u64 = 103;
pub const CANCEL_NOT_EXECUTED_TIMEOUT: u64 = 104;
pub const CANCEL_USER_REQUESTED: u64 = 105;
pub const CANCEL_NO_REPLY_ACK: u64 = 107;
pub const CANCEL_NODE_SHUTDOWN: u64 = 116;

// Consumer-side termination reasons.
pub const CONSUMER_CANCEL_NO_REPLY: u64 = 201;
pub const CONSUMER_CANCEL_NEGATIVE_REPLY: u64 = 202;
pub const CONSUMER_CANCEL_NO_DATA_RECEIVED: u64 = 203;
pub const CONSUMER_CANCEL_POLICY_CHANGED: u64 = 204;
pub const CONSUMER_CANCEL_DISCOVERED: u64 = 205;
pub const CANCEL_LEDGER_WRITE_FAILED: u64 = 208;

/// Human-readable meaning of a termination reason code. The table is
/// closed; unknown codes get a stable fallback string.
pub fn decode_reason_code(code: u64) -> String {
    let meaning = match code {
        CANCEL_NOT_ANCHORED => "agreement never anchored on the ledger",
        CANCEL_POLICY_CHANGED => "producer policy changed",
        CANCEL_WORKLOAD_FAILURE => "workload terminated",
        CANCEL_NOT_EXECUTED_TIMEOUT => "workload start timeout",
        CANCEL_USER_REQUESTED => "user requested",
        CANCEL_NO_REPLY_ACK => "agreement protocol incomplete, no reply ack received",
        CANCEL_NODE_SHUTDOWN => "node shutdown",
        CONSUMER_CANCEL_NO_REPLY => "consumer never received reply to proposal",
        CONSUMER_CANCEL_NEGATIVE_REPLY => "consumer received negative reply",
        CONSUMER_CANCEL_NO_DATA_RECEIVED => "consumer did not detect data",
        CONSUMER_CANCEL_POLICY_CHANGED => "consumer policy changed",
        CONSUMER_CANCEL_DISCOVERED => "consumer discovered cancellation from producer",
        CANCEL_LEDGER_WRITE_FAILED => "ledger write failed",
        _ => return "unknown reason code, possibly a version mismatch".to_string(),
    };
    meaning.to_string()
}

/// Random 32-byte agreement id, hex encoded.
pub fn new_agreement_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Proposal {
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Serialized merged terms both parties sign.
    pub tsandcs: String,
    /// Serialized producer policy the terms were derived from.
    #[serde(rename = "producerPolicy")]
    pub producer_policy: String,
    #[serde(rename = "agreementId")]
    pub agreement_id: String,
    /// Initiator's signing address.
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProposalReply {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub decision: bool,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub address: String,
    #[serde(rename = "agreementId")]
    pub agreement_id: String,
}

impl ProposalReply {
    pub fn accepted(agreement_id: &str, signature: &str, address: &str) -> Self {
        Self {
            msg_type: MSG_TYPE_REPLY.to_string(),
            decision: true,
            signature: signature.to_string(),
            address: address.to_string(),
            agreement_id: agreement_id.to_string(),
        }
    }

    pub fn rejected(agreement_id: &str) -> Self {
        Self {
            msg_type: MSG_TYPE_REPLY.to_string(),
            decision: false,
            signature: String::new(),
            address: String::new(),
            agreement_id: agreement_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyAck {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub accepted: bool,
    #[serde(rename = "agreementId")]
    pub agreement_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataReceived {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(rename = "agreementId")]
    pub agreement_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyMetering {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(rename = "agreementId")]
    pub agreement_id: String,
    /// Serialized [`crate::metering::MeteringNotification`].
    pub meter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelAgreement {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(rename = "agreementId")]
    pub agreement_id: String,
    pub reason: u64,
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(AccordError::MalformedMessage(format!("missing {field}")));
    }
    Ok(())
}

/// Parse and validate a raw proposal payload. Every field must be present
/// and non-empty, and the type must be `proposal`.
pub fn validate_proposal(raw: &str) -> Result<Proposal> {
    let proposal: Proposal = serde_json::from_str(raw)
        .map_err(|e| AccordError::MalformedMessage(format!("proposal does not parse: {e}")))?;
    if proposal.msg_type != MSG_TYPE_PROPOSAL {
        return Err(AccordError::MalformedMessage(format!(
            "expected type {MSG_TYPE_PROPOSAL}, got {}",
            proposal.msg_type
        )));
    }
    require("tsandcs", &proposal.tsandcs)?;
    require("producerPolicy", &proposal.producer_policy)?;
    require("agreementId", &proposal.agreement_id)?;
    require("address", &proposal.address)?;
    Ok(proposal)
}

/// Parse and validate a raw reply payload. An accepting reply must carry a
/// signature and address; a rejection needs neither.
pub fn validate_reply(raw: &str) -> Result<ProposalReply> {
    let reply: ProposalReply = serde_json::from_str(raw)
        .map_err(|e| AccordError::MalformedMessage(format!("reply does not parse: {e}")))?;
    if reply.msg_type != MSG_TYPE_REPLY {
        return Err(AccordError::MalformedMessage(format!(
            "expected type {MSG_TYPE_REPLY}, got {}",
            reply.msg_type
        )));
    }
    require("agreementId", &reply.agreement_id)?;
    if reply.decision {
        require("signature", &reply.signature)?;
        require("address", &reply.address)?;
    }
    Ok(reply)
}

/// A proposal that was constructed and (maybe) sent. A transport failure
/// still hands the caller the proposal so it can retry delivery.
pub struct InitiatedProposal {
    pub proposal: Proposal,
    pub delivery: std::result::Result<(), AccordError>,
}

/// Full capability set of one protocol variant.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> u32;

    fn validate_proposal(&self, raw: &str) -> Result<Proposal> {
        validate_proposal(raw)
    }

    fn validate_reply(&self, raw: &str) -> Result<ProposalReply> {
        validate_reply(raw)
    }

    /// Build and send a proposal from our producer policy and the
    /// counterparty's consumer policy.
    async fn initiate_agreement(
        &self,
        agreement_id: &str,
        producer: &Policy,
        consumer: &Policy,
        target: &MessageTarget,
    ) -> Result<InitiatedProposal>;

    /// Evaluate a received proposal and produce the reply. Does not
    /// transmit: the caller persists acceptance first, then sends.
    async fn decide_on_proposal(&self, proposal: &Proposal, my_id: &str)
        -> Result<ProposalReply>;

    /// Transmit a previously produced reply.
    async fn send_response(&self, reply: &ProposalReply, target: &MessageTarget) -> Result<()>;

    /// Variant-specific follow-through after an accepting reply was
    /// persisted and sent (ledger anchoring, bookkeeping).
    async fn record_agreement(&self, proposal: &Proposal, reply: &ProposalReply) -> Result<()>;

    /// Acknowledge the counterparty's reply.
    async fn confirm(
        &self,
        accepted: bool,
        agreement_id: &str,
        target: &MessageTarget,
    ) -> Result<()>;

    /// Tell the counterparty its data was observed.
    async fn notify_data_receipt(
        &self,
        agreement_id: &str,
        target: &MessageTarget,
    ) -> Result<()>;

    /// Sign and send a metering notification. Returns the serialized
    /// notification as sent.
    async fn notify_metering(
        &self,
        agreement_id: &str,
        notification: &crate::metering::MeteringNotification,
        target: &MessageTarget,
    ) -> Result<String>;

    /// Check that an agreement is still in force from the counterparty's
    /// point of view.
    async fn verify_agreement(&self, agreement_id: &str, expected_signature: &str)
        -> Result<bool>;

    /// End an agreement: drop the accounting, tell the counterparty when a
    /// target is known, and let the variant do its own teardown.
    async fn terminate_agreement(
        &self,
        policy_name: &str,
        agreement_id: &str,
        reason: u64,
        target: Option<&MessageTarget>,
    ) -> Result<()>;
}

/// State and behavior shared by every variant.
pub struct ProtocolCore {
    name: String,
    version: u32,
    policy_manager: Arc<PolicyManager>,
    signer: Arc<dyn Signer>,
    sender: Arc<dyn MessageSender>,
}

impl ProtocolCore {
    pub fn new(
        name: &str,
        version: u32,
        policy_manager: Arc<PolicyManager>,
        signer: Arc<dyn Signer>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            name: name.to_string(),
            version,
            policy_manager,
            signer,
            sender,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn policy_manager(&self) -> &PolicyManager {
        &self.policy_manager
    }

    pub fn signer(&self) -> &dyn Signer {
        self.signer.as_ref()
    }

    pub async fn send<M: Serialize + Sync>(
        &self,
        target: &MessageTarget,
        message: &M,
    ) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.sender.send(target, &payload).await
    }

    /// Merge policies into terms and build the proposal, then attempt
    /// delivery. Merge failure aborts; delivery failure does not.
    pub async fn initiate(
        &self,
        agreement_id: &str,
        producer: &Policy,
        consumer: &Policy,
        target: &MessageTarget,
    ) -> Result<InitiatedProposal> {
        let terms = policy::merge(producer, consumer)?;
        self.policy_manager
            .attempt_agreement(&producer.header.name, agreement_id)?;
        let proposal = Proposal {
            msg_type: MSG_TYPE_PROPOSAL.to_string(),
            tsandcs: terms.marshal()?,
            producer_policy: producer.marshal()?,
            agreement_id: agreement_id.to_string(),
            address: self.signer.address(),
        };
        info!(
            protocol = %self.name,
            agreement_id,
            "proposal created for {}",
            target.id
        );
        let delivery = self.send(target, &proposal).await;
        if let Err(ref e) = delivery {
            warn!(protocol = %self.name, agreement_id, error = %e, "proposal delivery failed");
        }
        Ok(InitiatedProposal { proposal, delivery })
    }

    /// The decision pipeline every variant shares: demarshal both embedded
    /// policies, check the producer policy is ours, check the terms do not
    /// contradict it, and only then hash and sign. Incompatibility yields a
    /// rejecting reply; only a signing failure is an error, and it produces
    /// no reply at all.
    pub fn decide(&self, proposal: &Proposal, my_id: &str) -> Result<ProposalReply> {
        let agreement_id = &proposal.agreement_id;
        let reject = |why: &str| {
            info!(
                protocol = %self.name,
                agreement_id,
                node = my_id,
                "rejecting proposal: {why}"
            );
            Ok(ProposalReply::rejected(agreement_id))
        };

        let terms = match Policy::demarshal(&proposal.tsandcs) {
            Ok(terms) => terms,
            Err(e) => return reject(&format!("terms do not parse: {e}")),
        };
        let producer = match Policy::demarshal(&proposal.producer_policy) {
            Ok(producer) => producer,
            Err(e) => return reject(&format!("producer policy does not parse: {e}")),
        };

        if !self.policy_manager.matches_mine(&producer) {
            return reject("producer policy is not one we advertise");
        }
        if let Err(e) = policy::are_compatible(&producer, &terms) {
            return reject(&e.to_string());
        }
        if let Err(e) = self
            .policy_manager
            .attempt_agreement(&producer.header.name, agreement_id)
        {
            return reject(&e.to_string());
        }

        let hash = terms_hash(&proposal.tsandcs);
        let signature = match self.signer.sign_hash(&hash) {
            Ok(signature) => signature,
            Err(e) => {
                // No reply leaves this node on a signing failure; undo the
                // accounting so a retried proposal is not blocked.
                self.policy_manager
                    .cancel_agreement(&producer.header.name, agreement_id);
                return Err(e);
            }
        };

        debug!(protocol = %self.name, agreement_id, "proposal accepted and signed");
        Ok(ProposalReply::accepted(
            agreement_id,
            &signature,
            &self.signer.address(),
        ))
    }

    pub async fn send_response(
        &self,
        reply: &ProposalReply,
        target: &MessageTarget,
    ) -> Result<()> {
        self.send(target, reply).await
    }

    pub async fn confirm(
        &self,
        accepted: bool,
        agreement_id: &str,
        target: &MessageTarget,
    ) -> Result<()> {
        let ack = ReplyAck {
            msg_type: MSG_TYPE_REPLY_ACK.to_string(),
            accepted,
            agreement_id: agreement_id.to_string(),
        };
        self.send(target, &ack).await
    }

    pub async fn notify_data_receipt(
        &self,
        agreement_id: &str,
        target: &MessageTarget,
    ) -> Result<()> {
        let notice = DataReceived {
            msg_type: MSG_TYPE_DATA_RECEIVED.to_string(),
            agreement_id: agreement_id.to_string(),
        };
        self.send(target, &notice).await
    }

    /// Sign the meter hash, fill in the signature, and send the wrapped
    /// notification.
    pub async fn notify_metering(
        &self,
        agreement_id: &str,
        notification: &crate::metering::MeteringNotification,
        target: &MessageTarget,
    ) -> Result<String> {
        let mut signed = notification.clone();
        let signature = self.signer.sign_hash(&signed.meter_hash()?)?;
        signed.set_meter_signature(&signature);
        signed.is_valid()?;

        let meter = serde_json::to_string(&signed)?;
        let message = NotifyMetering {
            msg_type: MSG_TYPE_METERING.to_string(),
            agreement_id: agreement_id.to_string(),
            meter: meter.clone(),
        };
        self.send(target, &message).await?;
        Ok(meter)
    }

    /// Common termination half: release the accounting and notify the
    /// counterparty when we still know how to reach it.
    pub async fn terminate(
        &self,
        policy_name: &str,
        agreement_id: &str,
        reason: u64,
        target: Option<&MessageTarget>,
    ) -> Result<()> {
        self.policy_manager.cancel_agreement(policy_name, agreement_id);
        info!(
            protocol = %self.name,
            agreement_id,
            reason,
            "terminating agreement: {}",
            decode_reason_code(reason)
        );
        if let Some(target) = target {
            let cancel = CancelAgreement {
                msg_type: MSG_TYPE_CANCEL.to_string(),
                agreement_id: agreement_id.to_string(),
                reason,
            };
            self.send(target, &cancel).await?;
        }
        Ok(())
    }
}

/// Explicit lookup table from protocol name to handler.
#[derive(Default)]
pub struct ProtocolRegistry {
    handlers: HashMap<String, Arc<dyn ProtocolHandler>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ProtocolHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_code_101_is_producer_policy_changed() {
        assert_eq!(decode_reason_code(101), "producer policy changed");
    }

    #[test]
    fn unknown_reason_code_gets_the_fallback() {
        assert_eq!(
            decode_reason_code(9_999),
            "unknown reason code, possibly a version mismatch"
        );
    }

    #[test]
    fn agreement_ids_are_32_byte_hex_and_unique() {
        let a = new_agreement_id();
        let b = new_agreement_id();
        assert_eq!(a.len(), 64);
        assert!(hex::decode(&a).is_ok());
        assert_ne!(a, b);
    }

    fn raw_proposal() -> serde_json::Value {
        serde_json::json!({
            "type": "proposal",
            "tsandcs": "{}",
            "producerPolicy": "{}",
            "agreementId": "deadbeef",
            "address": "0xabc"
        })
    }

    #[test]
    fn complete_proposal_validates() {
        let proposal = validate_proposal(&raw_proposal().to_string()).unwrap();
        assert_eq!(proposal.agreement_id, "deadbeef");
        assert_eq!(proposal.address, "0xabc");
    }

    #[test]
    fn each_missing_field_fails_validation() {
        for field in ["type", "tsandcs", "producerPolicy", "agreementId", "address"] {
            let mut value = raw_proposal();
            value.as_object_mut().unwrap().insert(
                field.to_string(),
                serde_json::Value::String(String::new()),
            );
            let err = validate_proposal(&value.to_string()).unwrap_err();
            assert!(
                matches!(err, AccordError::MalformedMessage(_)),
                "field {field} should fail as malformed"
            );
        }
    }

    #[test]
    fn wrong_type_fails_validation() {
        let mut value = raw_proposal();
        value["type"] = serde_json::Value::String("reply".to_string());
        assert!(validate_proposal(&value.to_string()).is_err());
    }

    #[test]
    fn non_json_payload_is_malformed() {
        assert!(matches!(
            validate_proposal("deadbeef"),
            Err(AccordError::MalformedMessage(_))
        ));
    }

    #[test]
    fn accepting_reply_requires_signature_and_address() {
        let accepted = serde_json::json!({
            "type": "reply", "decision": true, "signature": "0xsig",
            "address": "0xaddr", "agreementId": "a1"
        });
        assert!(validate_reply(&accepted.to_string()).is_ok());

        let unsigned = serde_json::json!({
            "type": "reply", "decision": true, "agreementId": "a1"
        });
        assert!(validate_reply(&unsigned.to_string()).is_err());

        let rejection = serde_json::json!({
            "type": "reply", "decision": false, "agreementId": "a1"
        });
        assert!(!validate_reply(&rejection.to_string()).unwrap().decision);
    }
}
