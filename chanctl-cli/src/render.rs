use std::fmt::Write as _;

use chanctl::view::DetailRow;
use chanctl::{Channel, ChannelRegistry, FeePolicy, UnitConverter};

const HEADERS: [&str; 6] = ["ALIAS", "CHANNEL POINT", "STATUS", "LOCAL", "REMOTE", "CAPACITY"];

fn status(registry: &ChannelRegistry, channel: &Channel) -> &'static str {
    if registry.is_closing(&channel.channel_point) {
        "closing"
    } else if channel.is_pending() {
        "pending"
    } else if channel.is_active {
        "active"
    } else {
        "inactive"
    }
}

/// One line per channel, columns padded to the widest cell
pub fn channel_table(
    channels: &[Channel],
    registry: &ChannelRegistry,
    units: &UnitConverter,
) -> String {
    if channels.is_empty() {
        return "no channels\n".to_string();
    }
    let rows: Vec<[String; 6]> = channels
        .iter()
        .map(|c| {
            [
                registry.resolve_alias(c),
                c.channel_point.clone(),
                status(registry, c).to_string(),
                units.format_sats(c.local_balance),
                units.format_sats(c.remote_balance),
                units.format_sats(c.capacity),
            ]
        })
        .collect();

    let mut widths = HEADERS.map(|h| h.chars().count());
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let header = HEADERS.map(str::to_string);
    for row in std::iter::once(&header).chain(rows.iter()) {
        let cells: Vec<String> =
            row.iter().zip(widths).map(|(cell, width)| format!("{:<width$}", cell)).collect();
        let _ = writeln!(out, "{}", cells.join("  ").trim_end());
    }
    out
}

pub fn detail_table(rows: &[DetailRow]) -> String {
    let width = rows.iter().map(|r| r.label.len()).max().unwrap_or(0);
    let mut out = String::new();
    for row in rows {
        let _ = writeln!(out, "{:<width$}  {}", row.label, row.value);
    }
    out
}

pub fn fee_policy(channel_point: &str, policy: &FeePolicy) -> String {
    format!(
        "{}: base fee {} msat, fee rate {} ppm",
        channel_point,
        policy.base_fee_msat,
        policy.fee_rate_ppm()
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use chanctl::util::mocks::{make_test_channel, MockNode};
    use chanctl::view::detail_rows;
    use chanctl::DisplayUnit;
    use test_log::test;

    #[test(tokio::test)]
    async fn channel_table_test() {
        let channels = vec![make_test_channel("aa:0", Some(1)), make_test_channel("bb:1", None)];
        let pubkey = channels[0].remote_pubkey.clone();
        let node = Arc::new(MockNode::new(channels));
        node.add_alias(&pubkey, "bob");
        let registry = ChannelRegistry::new(node);
        let snapshot = registry.refresh().await.unwrap();
        let units = UnitConverter::new(DisplayUnit::Sats);

        let table = channel_table(snapshot.channels(), &registry, &units);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ALIAS"));
        assert!(lines[1].starts_with("bob"));
        assert!(lines[1].contains("active"));
        assert!(lines[1].contains("600,000 sats"));
        assert!(lines[2].contains("pending"));
        // columns line up
        assert_eq!(lines[1].find("aa:0"), lines[0].find("CHANNEL POINT"));

        assert_eq!(channel_table(&[], &registry, &units), "no channels\n");
    }

    #[test]
    fn detail_table_test() {
        let channel = make_test_channel("aa:0", Some(7));
        let units = UnitConverter::default();
        let rows = detail_rows(&channel, "bob", &FeePolicy::default(), &units);
        let table = detail_table(&rows);
        assert!(table.starts_with("Alias "));
        assert!(table.contains("Channel id           7\n"));
        assert!(table.contains("Fee rate             0 ppm\n"));
    }

    #[test]
    fn fee_policy_test() {
        let policy = FeePolicy { base_fee_msat: 1000, fee_rate: 0.000025, ..Default::default() };
        assert_eq!(fee_policy("aa:0", &policy), "aa:0: base fee 1000 msat, fee rate 25 ppm");
    }
}
