//! Display rows for a single channel.
//!
//! Every numeric field is shown, zero included.  Only data that is really
//! absent (no short channel id yet) gets a marker instead of a value.

use crate::model::{Channel, FeePolicy, FeeStatus};
use crate::units::UnitConverter;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetailRow {
    pub label: &'static str,
    pub value: String,
}

fn row(label: &'static str, value: impl Into<String>) -> DetailRow {
    DetailRow { label, value: value.into() }
}

pub fn detail_rows(
    channel: &Channel,
    alias: &str,
    policy: &FeePolicy,
    units: &UnitConverter,
) -> Vec<DetailRow> {
    let mut rows = vec![row("Alias", alias)];
    if !channel.remote_pubkey.is_empty() {
        rows.push(row("Remote pubkey", channel.remote_pubkey.as_str()));
    }
    rows.push(row("Channel point", channel.channel_point.as_str()));
    rows.push(row(
        "Channel id",
        channel.channel_id.map_or("pending confirmation".to_string(), |id| id.to_string()),
    ));
    rows.push(row("Status", if channel.is_active { "Active" } else { "Inactive" }));
    rows.push(row("Private", if channel.is_private { "True" } else { "False" }));

    rows.push(row("Local balance", units.format_sats(channel.local_balance)));
    rows.push(row("Remote balance", units.format_sats(channel.remote_balance)));
    rows.push(row("Unsettled balance", units.format_sats(channel.unsettled_balance)));
    rows.push(row("Capacity", units.format_sats(channel.capacity)));
    rows.push(row("Total received", units.format_sats(channel.total_satoshis_received)));
    rows.push(row("Total sent", units.format_sats(channel.total_satoshis_sent)));

    rows.push(row("Base fee", format!("{} msat", policy.base_fee_msat)));
    rows.push(row("Fee rate", format!("{} ppm", policy.fee_rate_ppm())));
    match policy.status {
        FeeStatus::Idle => {}
        FeeStatus::Pending => rows.push(row("Fee update", "pending")),
        FeeStatus::Succeeded => rows.push(row("Fee update", "succeeded")),
        FeeStatus::Failed => rows.push(row(
            "Fee update",
            format!("failed: {}", policy.last_error.as_deref().unwrap_or("unknown error")),
        )),
    }

    rows.push(row("Commit weight", channel.commit_weight.to_string()));
    rows.push(row("Commit fee", channel.commit_fee.to_string()));
    rows.push(row("CSV delay", channel.csv_delay.to_string()));
    rows.push(row("Fee per kilo-weight", channel.fee_per_kw.to_string()));
    rows
}
