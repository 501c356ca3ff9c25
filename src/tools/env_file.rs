//! `.env` rendering and key-wise merging.

/// Collapse duplicate keys, keeping each key's first position and last value.
pub fn dedupe(vars: Vec<(String, String)>) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::with_capacity(vars.len());
    for (key, value) in vars {
        match out.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => out.push((key, value)),
        }
    }
    out
}

pub fn render(vars: &[(String, String)]) -> String {
    vars.iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Merge `updates` into an existing `.env` body.
///
/// A key's first line is replaced in place and any later lines for the same
/// key are dropped, so every key appears once. Unknown keys are appended.
/// Comments and unrelated lines are kept.
pub fn merge(existing: &str, updates: &[(String, String)]) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut placed = vec![false; updates.len()];

    for line in existing.lines() {
        match updates.iter().position(|(key, _)| line_key(line) == Some(key)) {
            Some(idx) if placed[idx] => {}
            Some(idx) => {
                let (key, value) = &updates[idx];
                lines.push(format!("{}={}", key, value));
                placed[idx] = true;
            }
            None => lines.push(line.to_string()),
        }
    }
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    for (idx, (key, value)) in updates.iter().enumerate() {
        if !placed[idx] {
            lines.push(format!("{}={}", key, value));
        }
    }
    lines.join("\n")
}

fn line_key(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return None;
    }
    let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    trimmed.split_once('=').map(|(k, _)| k.trim())
}

/// Keys defined in a `.env` body, in file order.
pub fn keys(body: &str) -> Vec<&str> {
    body.lines().filter_map(line_key).collect()
}
