//! Policy documents and the in-memory policy manager.
//!
//! A policy names what a node offers (properties, workload, metering
//! expectations) and which negotiation protocol it speaks. The manager
//! holds the advertised set plus per-policy agreement accounting; all of
//! its operations are pure and synchronous, callers sequence them from
//! their own worker task.

use crate::error::{AccordError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

fn default_version() -> String {
    "1.0".to_string()
}

fn default_protocol() -> String {
    "Basic".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyHeader {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
}

/// Workload description carried into the launch event when an agreement
/// is reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Workload {
    pub image: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

/// Metering expectations of a producer policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Meter {
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub per_time_unit: String,
    #[serde(default)]
    pub notification_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Policy {
    pub header: PolicyHeader,
    #[serde(default = "default_protocol")]
    pub agreement_protocol: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub workload: Option<Workload>,
    /// 0 means unlimited concurrent agreements.
    #[serde(default)]
    pub max_agreements: u32,
    #[serde(default)]
    pub meter: Option<Meter>,
}

impl Policy {
    pub fn demarshal(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| AccordError::MalformedMessage(format!("policy does not parse: {e}")))
    }

    pub fn marshal(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Content identity used by `matches_mine`: name, protocol, properties.
    fn same_content(&self, other: &Policy) -> bool {
        self.header.name == other.header.name
            && self.agreement_protocol == other.agreement_protocol
            && self.properties == other.properties
    }
}

/// Merge a producer policy with a consumer policy into the terms both
/// sides will sign. Properties are unioned; a key present on both sides
/// with different values fails the merge.
pub fn merge(producer: &Policy, consumer: &Policy) -> Result<Policy> {
    if producer.agreement_protocol != consumer.agreement_protocol {
        return Err(AccordError::PolicyMerge(format!(
            "protocol mismatch: {} vs {}",
            producer.agreement_protocol, consumer.agreement_protocol
        )));
    }

    let mut properties = producer.properties.clone();
    for (key, value) in &consumer.properties {
        match properties.get(key) {
            Some(existing) if existing != value => {
                return Err(AccordError::PolicyMerge(format!(
                    "conflicting value for property {key}: {existing} vs {value}"
                )));
            }
            _ => {
                properties.insert(key.clone(), value.clone());
            }
        }
    }

    Ok(Policy {
        header: PolicyHeader {
            name: format!(
                "{} merged with {}",
                producer.header.name, consumer.header.name
            ),
            version: default_version(),
        },
        agreement_protocol: producer.agreement_protocol.clone(),
        properties,
        workload: consumer.workload.clone().or_else(|| producer.workload.clone()),
        max_agreements: 1,
        meter: producer.meter.clone().or_else(|| consumer.meter.clone()),
    })
}

/// Check that merged terms do not contradict the producer policy: same
/// protocol, and every producer property present with an equal value.
pub fn are_compatible(producer: &Policy, terms: &Policy) -> Result<()> {
    if producer.agreement_protocol != terms.agreement_protocol {
        return Err(AccordError::PolicyMismatch(format!(
            "terms use protocol {}, producer policy requires {}",
            terms.agreement_protocol, producer.agreement_protocol
        )));
    }
    for (key, value) in &producer.properties {
        match terms.properties.get(key) {
            Some(v) if v == value => {}
            Some(v) => {
                return Err(AccordError::PolicyMismatch(format!(
                    "terms set property {key}={v}, producer policy requires {value}"
                )));
            }
            None => {
                return Err(AccordError::PolicyMismatch(format!(
                    "terms are missing producer property {key}"
                )));
            }
        }
    }
    Ok(())
}

#[derive(Default)]
struct AgreementCounts {
    attempts: HashSet<String>,
    finalized: HashSet<String>,
}

impl AgreementCounts {
    fn total(&self) -> usize {
        self.attempts.len() + self.finalized.len()
    }
}

#[derive(Default)]
struct ManagerInner {
    policies: Vec<Policy>,
    agreements: HashMap<String, AgreementCounts>,
}

/// Advertised policies plus agreement accounting per policy.
#[derive(Default)]
pub struct PolicyManager {
    inner: RwLock<ManagerInner>,
}

impl PolicyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a policy, replacing any existing one with the same name.
    pub fn register(&self, policy: Policy) {
        let mut inner = self.write();
        inner
            .policies
            .retain(|p| p.header.name != policy.header.name);
        inner
            .agreements
            .entry(policy.header.name.clone())
            .or_default();
        inner.policies.push(policy);
    }

    pub fn advertised(&self) -> Vec<Policy> {
        self.read().policies.clone()
    }

    pub fn find(&self, name: &str) -> Option<Policy> {
        self.read()
            .policies
            .iter()
            .find(|p| p.header.name == name)
            .cloned()
    }

    /// Is this policy one of ours, by content rather than object identity.
    pub fn matches_mine(&self, policy: &Policy) -> bool {
        self.read().policies.iter().any(|p| p.same_content(policy))
    }

    /// Reserve an agreement slot for a policy. Fails when the policy is
    /// unknown or already at its agreement limit.
    pub fn attempt_agreement(&self, policy_name: &str, agreement_id: &str) -> Result<()> {
        let mut inner = self.write();
        let max = inner
            .policies
            .iter()
            .find(|p| p.header.name == policy_name)
            .map(|p| p.max_agreements)
            .ok_or_else(|| {
                AccordError::PolicyMismatch(format!("no advertised policy named {policy_name}"))
            })?;
        let counts = inner.agreements.entry(policy_name.to_string()).or_default();
        if max > 0 && counts.total() >= max as usize {
            return Err(AccordError::PolicyMismatch(format!(
                "policy {policy_name} is at its limit of {max} agreements"
            )));
        }
        counts.attempts.insert(agreement_id.to_string());
        Ok(())
    }

    /// Move an agreement from attempted to finalized.
    pub fn finalize_agreement(&self, policy_name: &str, agreement_id: &str) -> Result<()> {
        let mut inner = self.write();
        let counts = inner.agreements.entry(policy_name.to_string()).or_default();
        if !counts.attempts.remove(agreement_id) {
            return Err(AccordError::Internal(format!(
                "agreement {agreement_id} was never attempted under policy {policy_name}"
            )));
        }
        counts.finalized.insert(agreement_id.to_string());
        Ok(())
    }

    /// Drop an agreement from the accounting, whatever its stage.
    pub fn cancel_agreement(&self, policy_name: &str, agreement_id: &str) {
        let mut inner = self.write();
        if let Some(counts) = inner.agreements.get_mut(policy_name) {
            counts.attempts.remove(agreement_id);
            counts.finalized.remove(agreement_id);
        }
    }

    pub fn active_count(&self, policy_name: &str) -> usize {
        self.read()
            .agreements
            .get(policy_name)
            .map(|c| c.total())
            .unwrap_or(0)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ManagerInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ManagerInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
