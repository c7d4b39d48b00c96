pub mod agreement;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod metering;
pub mod persistence;
pub mod policy;
pub mod protocol;
pub mod registry;
pub mod signing;
pub mod transport;
pub mod worker;

pub use agreement::{AgreementCommand, AgreementTranslator, AgreementWorker};
pub use config::AppConfig;
pub use error::{AccordError, Result};
pub use events::{Event, EventBus, LaunchContext};
pub use ledger::{HttpLedger, LedgerClient};
pub use metering::MeteringNotification;
pub use persistence::{
    AgreementState, AgreementStore, EstablishedAgreement, MemoryStore, PostgresStore,
};
pub use policy::{Policy, PolicyManager};
pub use protocol::{BasicProtocol, LedgerProtocol, ProtocolHandler, ProtocolRegistry};
pub use registry::{HttpRegistry, RegistryClient};
pub use signing::{Signer, WalletSigner};
pub use transport::{HttpSender, MessageSender, MessageTarget};
pub use worker::{spawn, StatusBoard, Worker, WorkerRuntime};
