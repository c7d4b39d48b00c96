//! The agreement worker: the orchestrator that ties policies, protocols,
//! persistence, and the registry together.
//!
//! One rule shapes the whole proposal pipeline: durability precedes
//! commitment. The pending record is written before the proposal is
//! evaluated, acceptance is persisted before the accepting reply leaves
//! the node, and any failure in between rolls the record back and sends
//! nothing.

pub mod commands;

use crate::config::AgentConfig;
use crate::error::{AccordError, Result};
use crate::events::{Event, EventBus, LaunchContext};
use crate::persistence::{AgreementState, AgreementStore};
use crate::policy::{Policy, PolicyManager};
use crate::protocol::{
    ProtocolRegistry, CANCEL_LEDGER_WRITE_FAILED, CANCEL_POLICY_CHANGED,
};
use crate::registry::RegistryClient;
use crate::signing::terms_hash;
use crate::transport::MessageTarget;
use crate::worker::{EventTranslator, StatusBoard, Worker, WorkerRuntime};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub use commands::{AgreementCommand, AgreementTranslator};

pub const WORKER_NAME: &str = "agreement";

pub struct AgreementWorker {
    runtime: WorkerRuntime<AgreementCommand>,
    config: AgentConfig,
    manager: Arc<PolicyManager>,
    store: Arc<dyn AgreementStore>,
    protocols: Arc<ProtocolRegistry>,
    registry: Arc<dyn RegistryClient>,
    device_id: Option<String>,
    subscriptions: HashSet<String>,
}

impl AgreementWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: EventBus,
        status: Arc<StatusBoard>,
        config: AgentConfig,
        manager: Arc<PolicyManager>,
        store: Arc<dyn AgreementStore>,
        protocols: Arc<ProtocolRegistry>,
        registry: Arc<dyn RegistryClient>,
    ) -> Self {
        Self {
            runtime: WorkerRuntime::new(WORKER_NAME, bus, status),
            config,
            manager,
            store,
            protocols,
            registry,
            device_id: None,
            subscriptions: HashSet::new(),
        }
    }

    fn node_id(&self) -> &str {
        self.device_id.as_deref().unwrap_or(&self.config.id)
    }

    /// Register one policy file: parse, add to the advertised set,
    /// subscribe to its protocol.
    fn register_policy_file(&mut self, file: &Path) -> Result<Policy> {
        let raw = std::fs::read_to_string(file)?;
        let policy = Policy::demarshal(&raw)?;
        info!(
            policy = %policy.header.name,
            protocol = %policy.agreement_protocol,
            "registering policy from {}",
            file.display()
        );
        self.subscriptions.insert(policy.agreement_protocol.clone());
        self.manager.register(policy.clone());
        Ok(policy)
    }

    fn load_policy_dir(&mut self) {
        let dir = self.config.policy_dir.clone();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("policy directory {} unreadable: {e}", dir.display());
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Err(e) = self.register_policy_file(&path) {
                    warn!("skipping policy file {}: {e}", path.display());
                }
            }
        }
    }

    async fn advertise_policies(&self) -> Result<()> {
        let Some(device_id) = &self.device_id else {
            // Not registered yet; the DeviceRegistered command advertises
            // everything loaded so far.
            return Ok(());
        };
        self.registry
            .advertise(device_id, &self.manager.advertised())
            .await
    }

    async fn handle_device_registered(&mut self, device_id: String) -> Result<()> {
        info!(device_id = %device_id, "device registered");
        self.device_id = Some(device_id.clone());
        self.advertise_policies().await?;

        let registry = self.registry.clone();
        let interval = Duration::from_secs(self.config.heartbeat_interval_secs);
        self.runtime.dispatch_periodic("heartbeat", interval, move || {
            let registry = registry.clone();
            let device_id = device_id.clone();
            async move {
                if let Err(e) = registry.heartbeat(&device_id).await {
                    warn!(device_id = %device_id, "heartbeat failed: {e}");
                }
                None::<Duration>
            }
        });
        Ok(())
    }

    async fn handle_advertise_policy(&mut self, file: &Path) -> Result<()> {
        self.register_policy_file(file)?;
        self.advertise_policies().await
    }

    /// Cancel every live agreement made under a policy that no longer
    /// holds. The counterparty gets a cancel message with the standard
    /// producer-policy-changed reason.
    async fn handle_policy_changed(&mut self, policy_name: &str) -> Result<()> {
        for record in self.store.list().await? {
            if !matches!(
                record.state,
                AgreementState::Accepted | AgreementState::Active
            ) {
                continue;
            }
            let Ok(proposal) = crate::protocol::validate_proposal(&record.proposal) else {
                continue;
            };
            let Ok(producer) = Policy::demarshal(&proposal.producer_policy) else {
                continue;
            };
            if producer.header.name != policy_name {
                continue;
            }
            let Some(handler) = self.protocols.get(&record.protocol) else {
                continue;
            };
            let target = MessageTarget::new(&record.counterparty, &record.counterparty);
            if let Err(e) = handler
                .terminate_agreement(
                    policy_name,
                    &record.agreement_id,
                    CANCEL_POLICY_CHANGED,
                    Some(&target),
                )
                .await
            {
                warn!(
                    agreement_id = %record.agreement_id,
                    "protocol termination failed: {e}"
                );
            }
            self.store
                .mark_terminated(&record.agreement_id, &record.protocol, CANCEL_POLICY_CHANGED)
                .await?;
            self.runtime.bus().publish(Event::AgreementTerminated {
                agreement_id: record.agreement_id.clone(),
                protocol: record.protocol.clone(),
                reason: CANCEL_POLICY_CHANGED,
            });
        }
        Ok(())
    }

    async fn handle_proposal(
        &mut self,
        protocol: &str,
        payload: &str,
        reply_to: &str,
    ) -> Result<()> {
        let Some(handler) = self.protocols.get(protocol) else {
            return Err(AccordError::UnknownProtocol(protocol.to_string()));
        };
        if self.config.require_subscription && !self.subscriptions.contains(protocol) {
            info!(protocol, "ignoring proposal for unsubscribed protocol");
            return Ok(());
        }

        // Malformed payloads are discarded here, before any state exists.
        let proposal = handler.validate_proposal(payload)?;
        let agreement_id = proposal.agreement_id.clone();

        if self.store.find(&agreement_id, protocol).await?.is_some() {
            info!(agreement_id = %agreement_id, "agreement already known, ignoring duplicate proposal");
            return Ok(());
        }
        self.store
            .create_pending(&agreement_id, protocol, reply_to, payload)
            .await?;

        let target = MessageTarget::new(reply_to, reply_to);
        let reply = match handler.decide_on_proposal(&proposal, self.node_id()).await {
            Ok(reply) => reply,
            Err(e) => {
                // Signing failed: no reply leaves this node. Roll the
                // pending record back so a retried proposal starts clean.
                if let Err(del) = self.store.delete(&agreement_id, protocol).await {
                    error!(agreement_id = %agreement_id, "rollback of pending record failed: {del}");
                }
                return Err(e);
            }
        };

        if !reply.decision {
            self.store.delete(&agreement_id, protocol).await?;
            handler.send_response(&reply, &target).await?;
            return Ok(());
        }

        // Acceptance must be durable before the reply is transmitted.
        let hash = terms_hash(&proposal.tsandcs);
        if let Err(e) = self
            .store
            .mark_accepted(&agreement_id, protocol, &hash, &reply.signature, &reply.address)
            .await
        {
            if let Ok(producer) = Policy::demarshal(&proposal.producer_policy) {
                self.manager
                    .cancel_agreement(&producer.header.name, &agreement_id);
            }
            if let Err(del) = self.store.delete(&agreement_id, protocol).await {
                error!(agreement_id = %agreement_id, "rollback of pending record failed: {del}");
            }
            return Err(e);
        }

        if let Err(e) = handler.send_response(&reply, &target).await {
            // The acceptance is durable; the counterparty will retry the
            // proposal or cancel, both of which we handle.
            warn!(agreement_id = %agreement_id, "accepting reply not delivered: {e}");
        }

        if let Err(e) = handler.record_agreement(&proposal, &reply).await {
            warn!(agreement_id = %agreement_id, "recording failed, cancelling agreement: {e}");
            if let Ok(producer) = Policy::demarshal(&proposal.producer_policy) {
                let _ = handler
                    .terminate_agreement(
                        &producer.header.name,
                        &agreement_id,
                        CANCEL_LEDGER_WRITE_FAILED,
                        Some(&target),
                    )
                    .await;
            }
            self.store
                .mark_terminated(&agreement_id, protocol, CANCEL_LEDGER_WRITE_FAILED)
                .await?;
            self.runtime.bus().publish(Event::AgreementTerminated {
                agreement_id,
                protocol: protocol.to_string(),
                reason: CANCEL_LEDGER_WRITE_FAILED,
            });
            return Ok(());
        }

        if let Ok(producer) = Policy::demarshal(&proposal.producer_policy) {
            if let Err(e) = self
                .manager
                .finalize_agreement(&producer.header.name, &agreement_id)
            {
                warn!(agreement_id = %agreement_id, "accounting finalize failed: {e}");
            }
        }

        let launch = Policy::demarshal(&proposal.tsandcs)
            .ok()
            .and_then(|terms| terms.workload)
            .map(|workload| LaunchContext {
                image: workload.image,
                environment: workload.environment,
            })
            .unwrap_or_else(|| LaunchContext {
                image: String::new(),
                environment: Default::default(),
            });
        info!(agreement_id = %agreement_id, protocol, "agreement reached");
        self.runtime.bus().publish(Event::AgreementReached {
            agreement_id,
            protocol: protocol.to_string(),
            launch,
        });
        Ok(())
    }
}

#[async_trait]
impl Worker for AgreementWorker {
    type Command = AgreementCommand;

    fn runtime(&self) -> &WorkerRuntime<AgreementCommand> {
        &self.runtime
    }

    fn runtime_mut(&mut self) -> &mut WorkerRuntime<AgreementCommand> {
        &mut self.runtime
    }

    fn translator(&self) -> Arc<dyn EventTranslator<Command = AgreementCommand>> {
        Arc::new(AgreementTranslator)
    }

    async fn initialize(&mut self) -> bool {
        self.load_policy_dir();
        info!(
            node = %self.config.id,
            policies = self.manager.advertised().len(),
            protocols = ?self.protocols.names(),
            "agreement worker ready"
        );
        true
    }

    async fn handle_command(&mut self, command: AgreementCommand) -> bool {
        let result = match command {
            AgreementCommand::DeviceRegistered { device_id } => {
                self.handle_device_registered(device_id).await
            }
            AgreementCommand::AdvertisePolicy { file } => {
                self.handle_advertise_policy(&file).await
            }
            AgreementCommand::PolicyChanged { policy_name } => {
                self.handle_policy_changed(&policy_name).await
            }
            AgreementCommand::ProposalReceived { protocol, payload, reply_to } => {
                self.handle_proposal(&protocol, &payload, &reply_to).await
            }
        };
        if let Err(e) = result {
            error!(worker = WORKER_NAME, "command failed: {e}");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use crate::policy::{self, PolicyHeader, Workload};
    use crate::protocol::{
        new_agreement_id, BasicProtocol, Proposal, MSG_TYPE_PROPOSAL,
    };
    use crate::signing::test_support::CountingSigner;
    use crate::transport::test_support::RecordingSender;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    struct NullRegistry {
        advertised: Mutex<u32>,
    }

    #[async_trait]
    impl RegistryClient for NullRegistry {
        async fn heartbeat(&self, _device_id: &str) -> Result<()> {
            Ok(())
        }

        async fn advertise(&self, _device_id: &str, _policies: &[Policy]) -> Result<()> {
            *self.advertised.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn producer_policy() -> Policy {
        Policy {
            header: PolicyHeader {
                name: "edge-vision".to_string(),
                version: "1.0".to_string(),
            },
            agreement_protocol: "Basic".to_string(),
            properties: [("arch".to_string(), "arm64".to_string())].into(),
            workload: None,
            max_agreements: 0,
            meter: None,
        }
    }

    fn consumer_policy() -> Policy {
        Policy {
            header: PolicyHeader {
                name: "buyer".to_string(),
                version: "1.0".to_string(),
            },
            agreement_protocol: "Basic".to_string(),
            properties: Default::default(),
            workload: Some(Workload {
                image: "registry/vision:3".to_string(),
                environment: HashMap::new(),
            }),
            max_agreements: 0,
            meter: None,
        }
    }

    fn proposal_payload(agreement_id: &str) -> String {
        let producer = producer_policy();
        let terms = policy::merge(&producer, &consumer_policy()).unwrap();
        let proposal = Proposal {
            msg_type: MSG_TYPE_PROPOSAL.to_string(),
            tsandcs: terms.marshal().unwrap(),
            producer_policy: producer.marshal().unwrap(),
            agreement_id: agreement_id.to_string(),
            address: "0xconsumer".to_string(),
        };
        serde_json::to_string(&proposal).unwrap()
    }

    struct Fixture {
        worker: AgreementWorker,
        store: Arc<MemoryStore>,
        sender: Arc<RecordingSender>,
        signer: Arc<CountingSigner>,
        events: broadcast::Receiver<Event>,
    }

    fn fixture(signer: CountingSigner, require_subscription: bool) -> Fixture {
        let bus = EventBus::new(32);
        let events = bus.subscribe();
        let board = Arc::new(StatusBoard::new());
        let manager = Arc::new(PolicyManager::new());
        manager.register(producer_policy());
        let store = Arc::new(MemoryStore::new());
        let signer = Arc::new(signer);
        let sender = Arc::new(RecordingSender::new());
        let mut protocols = ProtocolRegistry::new();
        protocols.register(Arc::new(BasicProtocol::new(
            manager.clone(),
            signer.clone(),
            sender.clone(),
        )));
        let config = AgentConfig {
            id: "node-1".to_string(),
            policy_dir: std::env::temp_dir(),
            require_subscription,
            heartbeat_interval_secs: 60,
        };
        let worker = AgreementWorker::new(
            bus,
            board,
            config,
            manager,
            store.clone(),
            Arc::new(protocols),
            Arc::new(NullRegistry { advertised: Mutex::new(0) }),
        );
        Fixture { worker, store, sender, signer, events }
    }

    fn drain(events: &mut broadcast::Receiver<Event>) -> Vec<Event> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    async fn receive_proposal(fx: &mut Fixture, payload: &str) {
        fx.worker
            .handle_command(AgreementCommand::ProposalReceived {
                protocol: "Basic".to_string(),
                payload: payload.to_string(),
                reply_to: "consumer-endpoint".to_string(),
            })
            .await;
    }

    #[tokio::test]
    async fn accepted_proposal_is_persisted_answered_and_announced() {
        let mut fx = fixture(CountingSigner::new(), false);
        let id = new_agreement_id();
        receive_proposal(&mut fx, &proposal_payload(&id)).await;

        let record = fx.store.find(&id, "Basic").await.unwrap().unwrap();
        assert_eq!(record.state, AgreementState::Accepted);
        assert!(record.signature.is_some());

        let payloads = fx.sender.payloads();
        assert_eq!(payloads.len(), 1);
        let reply: serde_json::Value = serde_json::from_slice(&payloads[0]).unwrap();
        assert_eq!(reply["decision"], true);
        assert_eq!(reply["agreementId"], id.as_str());
        assert!(!reply["signature"].as_str().unwrap().is_empty());

        let reached = drain(&mut fx.events).into_iter().find_map(|e| match e {
            Event::AgreementReached { agreement_id, launch, .. } => {
                Some((agreement_id, launch))
            }
            _ => None,
        });
        let (agreement_id, launch) = reached.expect("no AgreementReached event");
        assert_eq!(agreement_id, id);
        assert_eq!(launch.image, "registry/vision:3");
    }

    #[tokio::test]
    async fn junk_payload_is_discarded_without_reply_or_record() {
        let mut fx = fixture(CountingSigner::new(), false);
        receive_proposal(&mut fx, "deadbeef").await;

        assert!(fx.store.list().await.unwrap().is_empty());
        assert!(fx.sender.payloads().is_empty());
        assert_eq!(fx.signer.call_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_proposal_is_ignored() {
        let mut fx = fixture(CountingSigner::new(), false);
        let id = new_agreement_id();
        let payload = proposal_payload(&id);
        receive_proposal(&mut fx, &payload).await;
        receive_proposal(&mut fx, &payload).await;

        assert_eq!(fx.sender.payloads().len(), 1);
        let record = fx.store.find(&id, "Basic").await.unwrap().unwrap();
        assert_eq!(record.state, AgreementState::Accepted);
    }

    #[tokio::test]
    async fn signing_failure_sends_nothing_and_rolls_back() {
        let mut fx = fixture(CountingSigner::failing(), false);
        let id = new_agreement_id();
        receive_proposal(&mut fx, &proposal_payload(&id)).await;

        assert!(fx.sender.payloads().is_empty());
        assert!(fx.store.find(&id, "Basic").await.unwrap().is_none());
        // The same proposal can be retried after the signer recovers.
        assert_eq!(fx.signer.call_count(), 1);
    }

    #[tokio::test]
    async fn unsubscribed_protocol_is_ignored_when_filtering_is_on() {
        let mut fx = fixture(CountingSigner::new(), true);
        let id = new_agreement_id();
        receive_proposal(&mut fx, &proposal_payload(&id)).await;

        assert!(fx.store.list().await.unwrap().is_empty());
        assert!(fx.sender.payloads().is_empty());
    }

    #[tokio::test]
    async fn incompatible_proposal_gets_a_rejection_and_no_record() {
        let mut fx = fixture(CountingSigner::new(), false);
        let id = new_agreement_id();
        let mut value: serde_json::Value =
            serde_json::from_str(&proposal_payload(&id)).unwrap();
        let mut terms = Policy::demarshal(value["tsandcs"].as_str().unwrap()).unwrap();
        terms
            .properties
            .insert("arch".to_string(), "amd64".to_string());
        value["tsandcs"] = serde_json::Value::String(terms.marshal().unwrap());
        receive_proposal(&mut fx, &value.to_string()).await;

        assert!(fx.store.find(&id, "Basic").await.unwrap().is_none());
        let payloads = fx.sender.payloads();
        assert_eq!(payloads.len(), 1);
        let reply: serde_json::Value = serde_json::from_slice(&payloads[0]).unwrap();
        assert_eq!(reply["decision"], false);
        assert_eq!(fx.signer.call_count(), 0);
    }

    #[tokio::test]
    async fn policy_change_terminates_live_agreements_with_reason_101() {
        let mut fx = fixture(CountingSigner::new(), false);
        let id = new_agreement_id();
        receive_proposal(&mut fx, &proposal_payload(&id)).await;
        drain(&mut fx.events);

        fx.worker
            .handle_command(AgreementCommand::PolicyChanged {
                policy_name: "edge-vision".to_string(),
            })
            .await;

        let record = fx.store.find(&id, "Basic").await.unwrap().unwrap();
        assert_eq!(record.state, AgreementState::Terminated);
        assert_eq!(record.terminated_reason, Some(CANCEL_POLICY_CHANGED));

        // Reply plus the cancel message.
        let payloads = fx.sender.payloads();
        assert_eq!(payloads.len(), 2);
        let cancel: serde_json::Value = serde_json::from_slice(&payloads[1]).unwrap();
        assert_eq!(cancel["type"], "cancel");
        assert_eq!(cancel["reason"], 101);

        let terminated = drain(&mut fx.events).into_iter().any(|e| {
            matches!(e, Event::AgreementTerminated { reason, .. } if reason == 101)
        });
        assert!(terminated);
    }

    #[tokio::test]
    async fn unknown_protocol_leaves_no_trace() {
        let mut fx = fixture(CountingSigner::new(), false);
        fx.worker
            .handle_command(AgreementCommand::ProposalReceived {
                protocol: "Exotic".to_string(),
                payload: proposal_payload(&new_agreement_id()),
                reply_to: "peer".to_string(),
            })
            .await;
        assert!(fx.store.list().await.unwrap().is_empty());
        assert!(fx.sender.payloads().is_empty());
    }
}
