//! Minimal INI reader/writer for the cluster's on-disk configuration.
//!
//! Order-preserving, `key=value` pairs under `[section]` headers, `#` and
//! `;` comments. The format is machine-written; the writer always rewrites
//! the whole file atomically (temp file + rename).

use crate::error::ConfigError;
use std::fmt::Write as _;
use std::path::Path;

#[derive(Debug, Default)]
pub struct IniFile {
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl IniFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let mut file = IniFile::new();
        let mut current: Option<usize> = None;

        for (number, raw) in input.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                file.sections.push((name.trim().to_string(), Vec::new()));
                current = Some(file.sections.len() - 1);
                continue;
            }

            let (key, value) = line.split_once('=').ok_or(ConfigError::Parse {
                line: number + 1,
                message: format!("expected key=value, got {line:?}"),
            })?;

            let index = current.ok_or(ConfigError::Parse {
                line: number + 1,
                message: "key=value outside of any section".to_string(),
            })?;

            file.sections[index]
                .1
                .push((key.trim().to_string(), value.trim().to_string()));
        }

        Ok(file)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path)?;
        Self::parse(&input)
    }

    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|(name, _)| name.as_str())
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|(n, _)| n == section)?
            .1
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Fetches a required key, mapping absence to [`ConfigError::MissingKey`].
    pub fn require(&self, section: &str, key: &str) -> Result<&str, ConfigError> {
        self.get(section, key).ok_or_else(|| ConfigError::MissingKey {
            section: section.to_string(),
            key: key.to_string(),
        })
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        let index = match self.sections.iter().position(|(n, _)| n == section) {
            Some(index) => index,
            None => {
                self.sections.push((section.to_string(), Vec::new()));
                self.sections.len() - 1
            }
        };
        self.sections[index].1.push((key.to_string(), value.into()));
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str("# vim:syntax=dosini\n");
        out.push_str("# !!! DO NOT EDIT !!! THIS FILE IS GENERATED AUTOMATICALLY !!!\n\n");
        for (name, pairs) in &self.sections {
            let _ = writeln!(out, "[{name}]");
            for (key, value) in pairs {
                let _ = writeln!(out, "{key}={value}");
            }
            out.push('\n');
        }
        out
    }

    /// Rewrites `path` atomically: the content lands in a temp file that is
    /// renamed over the target.
    pub fn write_atomic(&self, path: &Path) -> Result<(), ConfigError> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, self.serialize())?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
