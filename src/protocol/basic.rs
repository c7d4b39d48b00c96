//! The "Basic" variant: negotiation with no external anchoring. The signed
//! reply itself is the whole record of acceptance.

use super::{
    InitiatedProposal, Proposal, ProposalReply, ProtocolCore, ProtocolHandler,
};
use crate::error::Result;
use crate::metering::MeteringNotification;
use crate::policy::{Policy, PolicyManager};
use crate::signing::Signer;
use crate::transport::{MessageSender, MessageTarget};
use async_trait::async_trait;
use std::sync::Arc;

pub const PROTOCOL_NAME: &str = "Basic";
pub const PROTOCOL_VERSION: u32 = 1;

pub struct BasicProtocol {
    core: ProtocolCore,
}

impl BasicProtocol {
    pub fn new(
        policy_manager: Arc<PolicyManager>,
        signer: Arc<dyn Signer>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            core: ProtocolCore::new(
                PROTOCOL_NAME,
                PROTOCOL_VERSION,
                policy_manager,
                signer,
                sender,
            ),
        }
    }
}

#[async_trait]
impl ProtocolHandler for BasicProtocol {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn version(&self) -> u32 {
        self.core.version()
    }

    async fn initiate_agreement(
        &self,
        agreement_id: &str,
        producer: &Policy,
        consumer: &Policy,
        target: &MessageTarget,
    ) -> Result<InitiatedProposal> {
        self.core.initiate(agreement_id, producer, consumer, target).await
    }

    async fn decide_on_proposal(
        &self,
        proposal: &Proposal,
        my_id: &str,
    ) -> Result<ProposalReply> {
        self.core.decide(proposal, my_id)
    }

    async fn send_response(&self, reply: &ProposalReply, target: &MessageTarget) -> Result<()> {
        self.core.send_response(reply, target).await
    }

    async fn record_agreement(&self, _proposal: &Proposal, _reply: &ProposalReply) -> Result<()> {
        // Nothing external to anchor; the persisted signed reply is the record.
        Ok(())
    }

    async fn confirm(
        &self,
        accepted: bool,
        agreement_id: &str,
        target: &MessageTarget,
    ) -> Result<()> {
        self.core.confirm(accepted, agreement_id, target).await
    }

    async fn notify_data_receipt(
        &self,
        agreement_id: &str,
        target: &MessageTarget,
    ) -> Result<()> {
        self.core.notify_data_receipt(agreement_id, target).await
    }

    async fn notify_metering(
        &self,
        agreement_id: &str,
        notification: &MeteringNotification,
        target: &MessageTarget,
    ) -> Result<String> {
        self.core.notify_metering(agreement_id, notification, target).await
    }

    async fn verify_agreement(
        &self,
        _agreement_id: &str,
        _expected_signature: &str,
    ) -> Result<bool> {
        // Without an anchor there is nothing to check against; the
        // agreement stands until a cancel arrives.
        Ok(true)
    }

    async fn terminate_agreement(
        &self,
        policy_name: &str,
        agreement_id: &str,
        reason: u64,
        target: Option<&MessageTarget>,
    ) -> Result<()> {
        self.core.terminate(policy_name, agreement_id, reason, target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyHeader, Workload};
    use crate::protocol::{new_agreement_id, MSG_TYPE_PROPOSAL};
    use crate::signing::test_support::CountingSigner;
    use crate::signing::terms_hash;
    use crate::transport::test_support::RecordingSender;
    use std::collections::HashMap;

    fn producer_policy() -> Policy {
        Policy {
            header: PolicyHeader {
                name: "edge-vision".to_string(),
                version: "1.0".to_string(),
            },
            agreement_protocol: PROTOCOL_NAME.to_string(),
            properties: [("arch".to_string(), "arm64".to_string())].into(),
            workload: None,
            max_agreements: 0,
            meter: None,
        }
    }

    fn consumer_policy() -> Policy {
        Policy {
            header: PolicyHeader {
                name: "vision-buyer".to_string(),
                version: "1.0".to_string(),
            },
            agreement_protocol: PROTOCOL_NAME.to_string(),
            properties: [("region".to_string(), "eu".to_string())].into(),
            workload: Some(Workload {
                image: "registry/vision:3".to_string(),
                environment: HashMap::new(),
            }),
            max_agreements: 0,
            meter: None,
        }
    }

    struct Fixture {
        protocol: BasicProtocol,
        signer: Arc<CountingSigner>,
        sender: Arc<RecordingSender>,
        manager: Arc<PolicyManager>,
    }

    fn fixture(signer: CountingSigner) -> Fixture {
        let manager = Arc::new(PolicyManager::new());
        manager.register(producer_policy());
        let signer = Arc::new(signer);
        let sender = Arc::new(RecordingSender::new());
        let protocol = BasicProtocol::new(manager.clone(), signer.clone(), sender.clone());
        Fixture { protocol, signer, sender, manager }
    }

    async fn proposal(fx: &Fixture) -> Proposal {
        let id = new_agreement_id();
        let target = MessageTarget::new("consumer-1", "http://peer/inbox");
        fx.protocol
            .initiate_agreement(&id, &producer_policy(), &consumer_policy(), &target)
            .await
            .unwrap()
            .proposal
    }

    #[tokio::test]
    async fn initiate_builds_and_delivers_a_valid_proposal() {
        let fx = fixture(CountingSigner::new());
        let proposal = proposal(&fx).await;

        assert_eq!(proposal.msg_type, MSG_TYPE_PROPOSAL);
        assert_eq!(proposal.address, fx.signer.address());
        let terms = Policy::demarshal(&proposal.tsandcs).unwrap();
        assert_eq!(terms.workload.unwrap().image, "registry/vision:3");
        assert_eq!(fx.sender.payloads().len(), 1);
    }

    #[tokio::test]
    async fn accepting_decision_signs_the_terms_hash() {
        let fx = fixture(CountingSigner::new());
        let proposal = proposal(&fx).await;
        // The responder's own accounting, separate from the initiator's.
        fx.manager.cancel_agreement("edge-vision", &proposal.agreement_id);

        let reply = fx
            .protocol
            .decide_on_proposal(&proposal, "node-1")
            .await
            .unwrap();

        assert!(reply.decision);
        assert_eq!(reply.agreement_id, proposal.agreement_id);
        assert_eq!(
            reply.signature,
            format!("0xsigned:{}", terms_hash(&proposal.tsandcs))
        );
        assert_eq!(fx.signer.call_count(), 1);
    }

    #[tokio::test]
    async fn incompatible_proposal_is_rejected_without_signing() {
        let fx = fixture(CountingSigner::new());
        let mut proposal = proposal(&fx).await;
        // Tamper with the terms so they contradict the producer policy.
        let mut terms = Policy::demarshal(&proposal.tsandcs).unwrap();
        terms
            .properties
            .insert("arch".to_string(), "amd64".to_string());
        proposal.tsandcs = terms.marshal().unwrap();

        let reply = fx
            .protocol
            .decide_on_proposal(&proposal, "node-1")
            .await
            .unwrap();

        assert!(!reply.decision);
        assert!(reply.signature.is_empty());
        assert_eq!(fx.signer.call_count(), 0);
    }

    #[tokio::test]
    async fn foreign_producer_policy_is_rejected_without_signing() {
        let fx = fixture(CountingSigner::new());
        let mut proposal = proposal(&fx).await;
        let mut foreign = producer_policy();
        foreign.header.name = "someone-elses".to_string();
        proposal.producer_policy = foreign.marshal().unwrap();

        let reply = fx
            .protocol
            .decide_on_proposal(&proposal, "node-1")
            .await
            .unwrap();
        assert!(!reply.decision);
        assert_eq!(fx.signer.call_count(), 0);
    }

    #[tokio::test]
    async fn signing_failure_yields_no_reply_and_releases_the_slot() {
        let fx = fixture(CountingSigner::failing());
        let proposal = proposal(&fx).await;
        fx.manager.cancel_agreement("edge-vision", &proposal.agreement_id);

        let err = fx
            .protocol
            .decide_on_proposal(&proposal, "node-1")
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::AccordError::Signature(_)));
        assert_eq!(fx.signer.call_count(), 1);
        // The accounting slot is free again for a retried proposal.
        assert_eq!(fx.manager.active_count("edge-vision"), 0);
    }

    #[tokio::test]
    async fn terminate_sends_a_cancel_when_the_peer_is_known() {
        let fx = fixture(CountingSigner::new());
        let target = MessageTarget::new("consumer-1", "http://peer/inbox");
        fx.protocol
            .terminate_agreement("edge-vision", "ag1", 101, Some(&target))
            .await
            .unwrap();

        let payloads = fx.sender.payloads();
        assert_eq!(payloads.len(), 1);
        let cancel: serde_json::Value = serde_json::from_slice(&payloads[0]).unwrap();
        assert_eq!(cancel["type"], "cancel");
        assert_eq!(cancel["reason"], 101);
    }
}
