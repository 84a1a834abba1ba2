//! Class listing parser

/// One parsed class line from the hierarchical token bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassRecord {
    pub device: String,
    /// `major:minor` class id as printed, e.g. `"1f87:2"`.
    pub classid: String,
    pub rate: Option<String>,
}

/// Parse a `class show` listing. Only `htb` classes are recognized.
pub fn parse_classes(device: &str, text: &str) -> Vec<ClassRecord> {
    let mut records = Vec::new();

    for line in text.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first() != Some(&"class") || tokens.get(1) != Some(&"htb") {
            continue;
        }
        let Some(classid) = tokens.get(2) else {
            continue;
        };

        let rate = tokens
            .iter()
            .position(|t| *t == "rate")
            .and_then(|pos| tokens.get(pos + 1))
            .map(|t| t.to_string());

        records.push(ClassRecord {
            device: device.to_string(),
            classid: classid.to_string(),
            rate,
        });
    }

    records
}
