use std::collections::BTreeMap;
use std::fmt::Write;

use crate::Error;

/// Section-keyed view of an INI document.
///
/// Parsing follows the usual `ConfigParser` conventions: option names are
/// lower-cased, `=` or `:` separates name and value, `#`/`;` start comment
/// lines and indented lines continue the previous value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IniDocument {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl IniDocument {
    /// Creates an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses INI text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for options outside a section or lines that
    /// are neither headers nor options.
    pub fn parse(contents: &str) -> Result<Self, Error> {
        let mut document = Self::new();
        let mut section: Option<String> = None;
        let mut option: Option<String> = None;

        for (number, line) in contents.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }

            if line.starts_with(char::is_whitespace) {
                if let (Some(section), Some(option)) = (&section, &option) {
                    if let Some(value) = document
                        .sections
                        .get_mut(section)
                        .and_then(|options| options.get_mut(option))
                    {
                        value.push('\n');
                        value.push_str(trimmed);
                        continue;
                    }
                }
            }

            if let Some(name) = trimmed.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
                let name = name.trim().to_string();
                document.sections.entry(name.clone()).or_default();
                section = Some(name);
                option = None;
                continue;
            }

            let Some(separator) = trimmed.find(['=', ':']) else {
                return Err(Error::Config(format!(
                    "line {}: expected an option or a section header",
                    number + 1
                )));
            };
            let Some(current) = &section else {
                return Err(Error::Config(format!(
                    "line {}: option outside of a section",
                    number + 1
                )));
            };

            let name = trimmed[..separator].trim().to_lowercase();
            let value = trimmed[separator + 1..].trim().to_string();
            document
                .sections
                .entry(current.clone())
                .or_default()
                .insert(name.clone(), value);
            option = Some(name);
        }

        Ok(document)
    }

    /// Returns the value of an option.
    #[must_use]
    pub fn get(&self, section: &str, option: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|options| options.get(option))
            .map(String::as_str)
    }

    /// Returns the value of an option or a descriptive error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the section or option is missing.
    pub fn require(&self, section: &str, option: &str) -> Result<&str, Error> {
        let options = self
            .sections
            .get(section)
            .ok_or_else(|| Error::Config(format!("no section: '{section}'")))?;
        options.get(option).map(String::as_str).ok_or_else(|| {
            Error::Config(format!("no option '{option}' in section: '{section}'"))
        })
    }

    /// Returns an option parsed as a boolean (`1/yes/true/on`, `0/no/false/off`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a missing option or an unknown literal.
    pub fn require_bool(&self, section: &str, option: &str) -> Result<bool, Error> {
        match self.require(section, option)?.to_lowercase().as_str() {
            "1" | "yes" | "true" | "on" => Ok(true),
            "0" | "no" | "false" | "off" => Ok(false),
            other => Err(Error::Config(format!("not a boolean: {other}"))),
        }
    }

    /// Returns an option parsed as a port number.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a missing option or a non-numeric value.
    pub fn require_port(&self, section: &str, option: &str) -> Result<u16, Error> {
        let value = self.require(section, option)?;
        value
            .parse()
            .map_err(|_| Error::Config(format!("invalid literal for port {option}: '{value}'")))
    }

    /// Section names, sorted.
    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    /// Options of one section, sorted by name.
    pub fn options(&self, section: &str) -> impl Iterator<Item = (&str, &str)> {
        self.sections
            .get(section)
            .into_iter()
            .flat_map(|options| options.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// Adds a section if it does not exist yet.
    pub fn add_section(&mut self, section: impl Into<String>) {
        self.sections.entry(section.into()).or_default();
    }

    /// Sets an option, creating its section when needed.
    pub fn set(&mut self, section: &str, option: impl Into<String>, value: impl Into<String>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(option.into(), value.into());
    }

    /// Renders the document with `global` first and other sections sorted.
    #[must_use]
    pub fn render(&self) -> String {
        let mut output = String::new();
        let ordered = self
            .sections
            .get_key_value(super::GLOBAL_SECTION)
            .into_iter()
            .chain(
                self.sections
                    .iter()
                    .filter(|(name, _)| name.as_str() != super::GLOBAL_SECTION),
            );

        for (name, options) in ordered {
            let _ = writeln!(output, "[{name}]");
            for (option, value) in options {
                let _ = writeln!(output, "{option} = {}", value.replace('\n', "\n\t"));
            }
            output.push('\n');
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[test]
    fn test_parse_sections_and_options() {
        let document = IniDocument::parse(
            "# comment\n[global]\ncluster_id = config\nCluster: node1, node2\n\n[node1]\nip=10.0.0.1\n",
        )
        .unwrap();

        assert_eq!(document.get("global", "cluster_id"), Some("config"));
        assert_eq!(document.get("global", "cluster"), Some("node1, node2"));
        assert_eq!(document.get("node1", "ip"), Some("10.0.0.1"));
        assert_eq!(document.sections().collect::<Vec<_>>(), vec!["global", "node1"]);
    }

    #[test]
    fn test_continuation_lines() {
        let document = IniDocument::parse("[a]\nkey = first\n\tsecond\n").unwrap();

        assert_eq!(document.get("a", "key"), Some("first\nsecond"));
        assert_eq!(document.render(), "[a]\nkey = first\n\tsecond\n\n");
    }

    #[test]
    fn test_option_outside_section() {
        assert_matches!(IniDocument::parse("key = value\n"), Err(Error::Config(_)));
    }

    #[test]
    fn test_render_puts_global_first() {
        let mut document = IniDocument::new();
        document.set("alpha", "b", "2");
        document.set("alpha", "a", "1");
        document.set("global", "cluster_id", "x");

        assert_eq!(
            document.render(),
            "[global]\ncluster_id = x\n\n[alpha]\na = 1\nb = 2\n\n"
        );
    }

    #[test]
    fn test_typed_accessors() {
        let document = IniDocument::parse("[n]\nfsync = True\nclient_port = 26400\nbad = x\n").unwrap();

        assert!(document.require_bool("n", "fsync").unwrap());
        assert_eq!(document.require_port("n", "client_port").unwrap(), 26400);
        assert_matches!(document.require_port("n", "bad"), Err(Error::Config(_)));
        assert_matches!(document.require("missing", "x"), Err(Error::Config(_)));
    }
}
