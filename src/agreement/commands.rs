//! Commands of the agreement worker and the event translation that feeds
//! its queue.

use crate::events::Event;
use crate::worker::{EventTranslator, WorkerCommand};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum AgreementCommand {
    DeviceRegistered {
        device_id: String,
    },
    AdvertisePolicy {
        file: PathBuf,
    },
    PolicyChanged {
        policy_name: String,
    },
    ProposalReceived {
        protocol: String,
        payload: String,
        reply_to: String,
    },
}

impl fmt::Display for AgreementCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgreementCommand::DeviceRegistered { device_id } => {
                write!(f, "DeviceRegistered({device_id})")
            }
            AgreementCommand::AdvertisePolicy { file } => {
                write!(f, "AdvertisePolicy({})", file.display())
            }
            AgreementCommand::PolicyChanged { policy_name } => {
                write!(f, "PolicyChanged({policy_name})")
            }
            AgreementCommand::ProposalReceived { protocol, reply_to, .. } => {
                write!(f, "ProposalReceived({protocol} from {reply_to})")
            }
        }
    }
}

pub struct AgreementTranslator;

impl EventTranslator for AgreementTranslator {
    type Command = AgreementCommand;

    fn translate(&self, event: &Event) -> Vec<WorkerCommand<AgreementCommand>> {
        match event {
            Event::DeviceRegistered { device_id } => {
                vec![WorkerCommand::Domain(AgreementCommand::DeviceRegistered {
                    device_id: device_id.clone(),
                })]
            }
            Event::PolicyCreated { file } => {
                vec![WorkerCommand::Domain(AgreementCommand::AdvertisePolicy {
                    file: file.clone(),
                })]
            }
            Event::PolicyChanged { policy_name } => {
                vec![WorkerCommand::Domain(AgreementCommand::PolicyChanged {
                    policy_name: policy_name.clone(),
                })]
            }
            Event::ProposalReceived { protocol, payload, reply_to } => {
                vec![WorkerCommand::Domain(AgreementCommand::ProposalReceived {
                    protocol: protocol.clone(),
                    payload: payload.clone(),
                    reply_to: reply_to.clone(),
                })]
            }
            Event::ShutdownRequested => vec![
                WorkerCommand::BeginShutdown,
                WorkerCommand::Terminate("node shutdown".to_string()),
            ],
            _ => Vec::new(),
        }
    }
}
