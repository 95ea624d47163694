//! Line-oriented `KEY=VALUE` environment file

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    /// A `KEY=VALUE` line. `raw` holds the original text until the value is edited.
    Entry {
        key: String,
        value: String,
        raw: Option<String>,
    },
    /// Comments, blank lines and anything that is not an assignment
    Other(String),
}

/// Ordered environment configuration.
///
/// Keeps every line of the source so that rendering reproduces untouched
/// lines exactly. Keys are case sensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentConfig {
    lines: Vec<Line>,
}

impl EnvironmentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse env file text
    pub fn parse(text: &str) -> Self {
        let lines = text
            .lines()
            .map(|line| {
                let trimmed = line.trim_start();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    return Line::Other(line.to_string());
                }
                match line.split_once('=') {
                    Some((key, value)) if !key.trim().is_empty() => Line::Entry {
                        key: key.trim().to_string(),
                        value: value.to_string(),
                        raw: Some(line.to_string()),
                    },
                    _ => Line::Other(line.to_string()),
                }
            })
            .collect();

        Self { lines }
    }

    /// Render to file text, newline terminated
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Entry { raw: Some(raw), .. } => out.push_str(raw),
                Line::Entry { key, value, raw: None } => {
                    out.push_str(key);
                    out.push('=');
                    out.push_str(value);
                }
                Line::Other(text) => out.push_str(text),
            }
            out.push('\n');
        }
        out
    }

    /// Value of the first occurrence of `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| match line {
            Line::Entry { key: k, value, .. } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Keys in file order, duplicates included
    pub fn keys(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                Line::Entry { key, .. } => Some(key.as_str()),
                Line::Other(_) => None,
            })
            .collect()
    }

    /// Force `key` to `value`.
    ///
    /// Replaces the first occurrence in place, drops later duplicates and
    /// appends when the key is absent. Returns whether anything changed.
    pub fn set(&mut self, key: &str, value: &str) -> bool {
        let mut changed = false;
        let mut seen = false;

        self.lines.retain_mut(|line| match line {
            Line::Entry { key: k, value: v, raw } if k == key => {
                if seen {
                    changed = true;
                    return false;
                }
                seen = true;
                if v != value {
                    *v = value.to_string();
                    *raw = None;
                    changed = true;
                }
                true
            }
            _ => true,
        });

        if !seen {
            self.lines.push(Line::Entry {
                key: key.to_string(),
                value: value.to_string(),
                raw: None,
            });
            changed = true;
        }

        changed
    }

    /// Set `key` only when it is absent. Returns whether it was added.
    pub fn set_if_missing(&mut self, key: &str, value: &str) -> bool {
        if self.contains(key) {
            return false;
        }
        self.set(key, value)
    }
}

impl fmt::Display for EnvironmentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
