//! Queue-discipline listing parser

use super::is_time_token;

/// One parsed qdisc line. Netem nodes carry impairment fields, token-bucket
/// nodes carry a rate; all values are kept as the literal diagnostic tokens
/// so the show surface reports exactly what the backend reports.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QdiscRecord {
    pub device: String,
    /// Own handle without the trailing colon, e.g. `"2f87"`.
    pub handle: String,
    /// Parent handle as printed, e.g. `"1f87:2"`. `None` for a root node.
    pub parent: Option<String>,
    pub delay: Option<String>,
    pub delay_distro: Option<String>,
    pub loss: Option<String>,
    pub duplicate: Option<String>,
    pub corrupt: Option<String>,
    pub reorder: Option<String>,
    pub rate: Option<String>,
}

/// Parse a `qdisc show` listing. Recognizes `netem` and `tbf` nodes;
/// everything else is skipped.
pub fn parse_qdiscs(device: &str, text: &str) -> Vec<QdiscRecord> {
    let mut records = Vec::new();

    for line in text.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first() != Some(&"qdisc") {
            continue;
        }
        match tokens.get(1) {
            Some(&"netem") => {
                if let Some(record) = parse_netem_line(device, &tokens) {
                    records.push(record);
                }
            }
            Some(&"tbf") => {
                if let Some(record) = parse_tbf_line(device, &tokens) {
                    records.push(record);
                }
            }
            _ => (),
        }
    }

    records
}

fn parse_netem_line(device: &str, tokens: &[&str]) -> Option<QdiscRecord> {
    let mut record = QdiscRecord {
        device: device.to_string(),
        handle: tokens.get(2)?.trim_end_matches(':').to_string(),
        ..Default::default()
    };

    let mut index = 3;
    while index < tokens.len() {
        match tokens[index] {
            "parent" => {
                record.parent = tokens.get(index + 1).map(|t| t.to_string());
                index += 2;
            }
            "root" => {
                record.parent = None;
                index += 1;
            }
            "delay" => {
                record.delay = tokens.get(index + 1).map(|t| t.to_string());
                index += 2;
                // Jitter is a bare time token right after the delay value.
                if let Some(next) = tokens.get(index) {
                    if is_time_token(next) {
                        record.delay_distro = Some(next.to_string());
                        index += 1;
                    }
                }
            }
            "loss" => {
                record.loss = tokens.get(index + 1).map(|t| t.to_string());
                index += 2;
            }
            "duplicate" => {
                record.duplicate = tokens.get(index + 1).map(|t| t.to_string());
                index += 2;
            }
            "corrupt" => {
                record.corrupt = tokens.get(index + 1).map(|t| t.to_string());
                index += 2;
            }
            "reorder" => {
                record.reorder = tokens.get(index + 1).map(|t| t.to_string());
                index += 2;
            }
            _ => index += 1,
        }
    }

    Some(record)
}

fn parse_tbf_line(device: &str, tokens: &[&str]) -> Option<QdiscRecord> {
    let mut record = QdiscRecord {
        device: device.to_string(),
        handle: tokens.get(2)?.trim_end_matches(':').to_string(),
        ..Default::default()
    };

    let mut index = 3;
    while index < tokens.len() {
        match tokens[index] {
            "parent" => {
                record.parent = tokens.get(index + 1).map(|t| t.to_string());
                index += 2;
            }
            "root" => {
                record.parent = None;
                index += 1;
            }
            "rate" => {
                record.rate = tokens.get(index + 1).map(|t| t.to_string());
                index += 2;
            }
            _ => index += 1,
        }
    }

    Some(record)
}
