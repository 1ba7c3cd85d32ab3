//! Stateless classifier turning heterogeneous CLI output lines into coarse
//! progress events. A non-match is not an error, just no event.

use unipac_core::event::ProgressEvent;

// units the underlying tools print, binary and decimal flavours
const SIZE_UNITS: &[&str] = &[
    "KiB", "MiB", "GiB", "TiB", "kB", "KB", "MB", "GB", "TB", "B",
];

/// Rules tested in order: downloading + size unit, bracketed percent,
/// installed/upgraded marker. Total and pure.
pub fn classify(line: &str) -> Option<ProgressEvent> {
    let lower = line.to_lowercase();

    if lower.contains("downloading") {
        if let Some(size) = size_with_unit(line) {
            return Some(ProgressEvent::Download(format!("downloading {}", size)));
        }
    }

    if let Some(percent) = bracketed_percent(line) {
        return Some(ProgressEvent::Percent(percent));
    }

    if lower.contains("installed") || lower.contains("upgraded") {
        return Some(ProgressEvent::Installed);
    }

    None
}

// "12.4 MiB" or "12.4MiB" anywhere in the line
fn size_with_unit(line: &str) -> Option<String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();

    for (i, token) in tokens.iter().enumerate() {
        // split form: "12.4 MiB"
        if token.parse::<f64>().is_ok() {
            if let Some(next) = tokens.get(i + 1) {
                let unit = next.trim_end_matches(|c: char| !c.is_alphabetic());
                if SIZE_UNITS.contains(&unit) {
                    return Some(format!("{} {}", token, unit));
                }
            }
        }
        // joined form: "12.4MiB"
        for unit in SIZE_UNITS {
            if let Some(number) = token.strip_suffix(unit) {
                if !number.is_empty() && number.parse::<f64>().is_ok() {
                    return Some(format!("{} {}", number, unit));
                }
            }
        }
    }

    None
}

// a percentage inside any bracket pair, e.g. "[ 42%]" or "(42%)"
fn bracketed_percent(line: &str) -> Option<String> {
    for (open, close) in [('[', ']'), ('(', ')')] {
        let mut rest = line;
        while let Some(start) = rest.find(open) {
            let after = &rest[start + 1..];
            let Some(end) = after.find(close) else {
                break;
            };
            let inner = &after[..end];
            if let Some(pct) = percent_in(inner) {
                return Some(pct);
            }
            rest = &after[end + 1..];
        }
    }
    None
}

fn percent_in(text: &str) -> Option<String> {
    let pos = text.find('%')?;
    let digits: String = text[..pos]
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .chars()
        .rev()
        .collect();
    if digits.is_empty() {
        None
    } else {
        Some(format!("{}%", digits))
    }
}

/// Transient per-source progress text: the latest download size with the
/// latest percentage appended, cleared when a package finishes.
#[derive(Debug, Clone, Default)]
pub struct ProgressState {
    download: String,
    percent: String,
}

impl ProgressState {
    pub fn apply(&mut self, event: &ProgressEvent) -> String {
        match event {
            ProgressEvent::Download(text) => {
                self.download = text.clone();
                self.percent.clear();
            }
            ProgressEvent::Percent(pct) => {
                self.percent = pct.clone();
            }
            ProgressEvent::Installed => {
                // source moved on to the next package
                self.download.clear();
                self.percent.clear();
            }
        }
        self.summary()
    }

    pub fn summary(&self) -> String {
        match (self.download.is_empty(), self.percent.is_empty()) {
            (false, false) => format!("{} {}", self.download, self.percent),
            (false, true) => self.download.clone(),
            (true, false) => self.percent.clone(),
            (true, true) => String::new(),
        }
    }
}
