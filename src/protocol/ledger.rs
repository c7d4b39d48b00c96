//! The "Ledger" variant: acceptance is additionally anchored on an
//! external ledger, and termination is written there too, except when the
//! termination reason is the ledger write itself failing.

use super::{
    InitiatedProposal, Proposal, ProposalReply, ProtocolCore, ProtocolHandler,
    CANCEL_LEDGER_WRITE_FAILED,
};
use crate::error::Result;
use crate::ledger::LedgerClient;
use crate::metering::MeteringNotification;
use crate::policy::{Policy, PolicyManager};
use crate::signing::{terms_hash, Signer};
use crate::transport::{MessageSender, MessageTarget};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub const PROTOCOL_NAME: &str = "Ledger";
pub const PROTOCOL_VERSION: u32 = 1;

pub struct LedgerProtocol {
    core: ProtocolCore,
    ledger: Arc<dyn LedgerClient>,
}

impl LedgerProtocol {
    pub fn new(
        policy_manager: Arc<PolicyManager>,
        signer: Arc<dyn Signer>,
        sender: Arc<dyn MessageSender>,
        ledger: Arc<dyn LedgerClient>,
    ) -> Self {
        Self {
            core: ProtocolCore::new(
                PROTOCOL_NAME,
                PROTOCOL_VERSION,
                policy_manager,
                signer,
                sender,
            ),
            ledger,
        }
    }
}

#[async_trait]
impl ProtocolHandler for LedgerProtocol {
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

    /// Anchor the accepted agreement: the signed terms hash goes on the
    /// ledger under the agreement id.
    async fn record_agreement(&self, proposal: &Proposal, reply: &ProposalReply) -> Result<()> {
        let hash = terms_hash(&proposal.tsandcs);
        self.ledger
            .record_agreement(&proposal.agreement_id, &hash, &reply.signature, &reply.address)
            .await?;
        info!(agreement_id = %proposal.agreement_id, "agreement anchored on ledger");
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

    /// The agreement stands while the counterparty's signature is still
    /// recorded on the ledger and matches what we saw at acceptance.
    async fn verify_agreement(
        &self,
        agreement_id: &str,
        expected_signature: &str,
    ) -> Result<bool> {
        match self.ledger.counterparty_signature(agreement_id).await? {
            Some(signature) => Ok(signature == expected_signature),
            None => Ok(false),
        }
    }

    async fn terminate_agreement(
        &self,
        policy_name: &str,
        agreement_id: &str,
        reason: u64,
        target: Option<&MessageTarget>,
    ) -> Result<()> {
        self.core.terminate(policy_name, agreement_id, reason, target).await?;
        // Pointless to write the termination when the reason is that
        // ledger writes are failing.
        if reason != CANCEL_LEDGER_WRITE_FAILED {
            self.ledger.terminate_agreement(agreement_id, reason).await?;
        }
        Ok(())
    }
}
