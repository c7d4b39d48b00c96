//! Metering notifications.
//!
//! A metering notification is the consumer's signed assertion of how many
//! tokens the producer has earned on an agreement so far. The producer can
//! anchor it on the ledger; both sides must therefore compute the same
//! meter hash over the same bytes.

use crate::error::{AccordError, Result};
use crate::policy::Meter;
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeteringNotification {
    /// Tokens granted by this notification, rounded down to whole tokens.
    pub amount: u64,
    /// Agreement start, seconds since 1970.
    pub start_time: u64,
    /// When the notification was produced, seconds since 1970.
    pub current_time: u64,
    /// Seconds of missing data detected by the consumer.
    pub missed_time: u64,
    /// Hex encoded 32-byte agreement id.
    pub agreement_id: String,
    /// Consumer's signature of the meter hash.
    #[serde(default)]
    pub consumer_meter_signature: String,
    /// Hash of the agreement terms.
    pub agreement_hash: String,
    /// Consumer's signature of the agreement hash.
    pub consumer_agreement_signature: String,
    pub consumer_address: String,
    /// Producer's signature of the agreement hash.
    pub producer_agreement_signature: String,
}

impl MeteringNotification {
    /// Build a notification for `meter` terms. The meter signature is
    /// filled in separately once the hash has been signed.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        meter: &Meter,
        start_time: u64,
        current_time: u64,
        check_rate_secs: u64,
        missed_checks: u64,
        agreement_id: &str,
        agreement_hash: &str,
        consumer_agreement_signature: &str,
        consumer_address: &str,
        producer_agreement_signature: &str,
    ) -> Result<Self> {
        let (amount, missed_time) =
            calculate_amount(meter, start_time, current_time, check_rate_secs, missed_checks)?;
        Ok(Self {
            amount,
            start_time,
            current_time,
            missed_time,
            agreement_id: agreement_id.to_string(),
            consumer_meter_signature: String::new(),
            agreement_hash: agreement_hash.to_string(),
            consumer_agreement_signature: consumer_agreement_signature.to_string(),
            consumer_address: consumer_address.to_string(),
            producer_agreement_signature: producer_agreement_signature.to_string(),
        })
    }

    pub fn set_meter_signature(&mut self, signature: &str) {
        self.consumer_meter_signature = signature.to_string();
    }

    /// Keccak over amount, current time, and the binary agreement id. This
    /// is what the consumer signs to produce the meter signature.
    pub fn meter_hash(&self) -> Result<String> {
        let binary_id = hex::decode(self.agreement_id.trim_start_matches("0x"))
            .map_err(|e| AccordError::MalformedMessage(format!("agreement id is not hex: {e}")))?;

        let mut meter = Vec::with_capacity(64 + binary_id.len());
        meter.extend_from_slice(&to_buffer(self.amount));
        meter.extend_from_slice(&to_buffer(self.current_time));
        meter.extend_from_slice(&binary_id);

        Ok(format!("0x{}", hex::encode(keccak256(&meter))))
    }

    pub fn is_valid(&self) -> Result<()> {
        let missing = |field: &str| {
            Err(AccordError::MalformedMessage(format!(
                "metering notification is missing {field}"
            )))
        };
        if self.start_time == 0 {
            return missing("a start time");
        }
        if self.current_time == 0 {
            return missing("a current time");
        }
        if self.agreement_id.is_empty() {
            return missing("an agreement id");
        }
        if self.consumer_meter_signature.is_empty() {
            return missing("the consumer meter signature");
        }
        if self.agreement_hash.is_empty() {
            return missing("the agreement hash");
        }
        if self.consumer_agreement_signature.is_empty() {
            return missing("the consumer agreement signature");
        }
        if self.consumer_address.is_empty() {
            return missing("the consumer address");
        }
        if self.producer_agreement_signature.is_empty() {
            return missing("the producer agreement signature");
        }
        Ok(())
    }
}

/// Tokens earned since the agreement started, minus time the consumer saw
/// no data. Returns (amount, missed seconds).
fn calculate_amount(
    meter: &Meter,
    start_time: u64,
    current_time: u64,
    check_rate_secs: u64,
    missed_checks: u64,
) -> Result<(u64, u64)> {
    let per_unit_minutes = match meter.per_time_unit.as_str() {
        "min" => 1.0,
        "hour" => 60.0,
        "day" => 1440.0,
        other => {
            return Err(AccordError::Internal(format!(
                "unknown metering time unit {other}"
            )))
        }
    };

    let min_per_check = check_rate_secs as f64 / 60.0;
    let missed_minutes = missed_checks as f64 * min_per_check;
    let duration_minutes =
        (current_time.saturating_sub(start_time) as f64 / 60.0) - missed_minutes;
    let tokens_per_minute = meter.tokens as f64 / per_unit_minutes;

    let amount = (duration_minutes * tokens_per_minute).max(0.0) as u64;
    Ok((amount, (missed_minutes * 60.0) as u64))
}

/// Big-endian value in a 32-byte buffer.
fn to_buffer(value: u64) -> [u8; 32] {
    let mut buf = [0u8; 32];
    buf[24..].copy_from_slice(&value.to_be_bytes());
    buf
}
