// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::str::FromStr;

use crate::{AppError, AppResult};

/// Parsed form of `(System)type:address:option:key=value...`.
///
/// The system and type prefix are both optional, the address is required.
/// Options after the address are either positional or `key=value` pairs and
/// may be mixed; positional options keep their own index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionDetails {
    system: Option<String>,
    connection_type: Option<String>,
    address: String,
    positional: Vec<String>,
    named: Vec<(String, String)>,
}

impl ConnectionDetails {
    pub fn parse(input: &str) -> AppResult<ConnectionDetails> {
        let parts: Vec<&str> = input.split(':').collect();
        if parts.len() < 2 {
            return Err(AppError::InvalidConnectionDetails(format!(
                "'{}' needs at least a type and an address",
                input
            )));
        }

        let mut details = ConnectionDetails::default();
        let head = parts[0].trim();
        if let Some(rest) = head.strip_prefix('(') {
            let close = rest.find(')').ok_or_else(|| {
                AppError::InvalidConnectionDetails(format!("unterminated system in '{}'", input))
            })?;
            let system = &rest[..close];
            if !system.is_empty() {
                details.system = Some(system.to_string());
            }
            let connection_type = &rest[close + 1..];
            if !connection_type.is_empty() {
                details.connection_type = Some(connection_type.to_string());
            }
        } else if !head.is_empty() {
            details.connection_type = Some(head.to_string());
        }

        let address = parts[1].trim();
        if address.is_empty() {
            return Err(AppError::InvalidConnectionDetails(format!(
                "missing address in '{}'",
                input
            )));
        }
        details.address = address.to_string();

        for option in &parts[2..] {
            match option.split_once('=') {
                Some((key, value)) => details
                    .named
                    .push((key.trim().to_string(), value.trim().to_string())),
                None => details.positional.push(option.trim().to_string()),
            }
        }
        Ok(details)
    }

    pub fn new(system: &str, connection_type: &str, address: &str, port: u16) -> Self {
        ConnectionDetails {
            system: Some(system.to_string()),
            connection_type: Some(connection_type.to_string()),
            address: address.to_string(),
            positional: vec![port.to_string()],
            named: Vec::new(),
        }
    }

    pub fn system(&self) -> Option<&str> {
        self.system.as_deref()
    }

    /// Connection type, `direct` when none was given.
    pub fn connection_type(&self) -> &str {
        self.connection_type.as_deref().unwrap_or("direct")
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn has_options(&self) -> bool {
        !self.positional.is_empty() || !self.named.is_empty()
    }

    /// First value given for `name`.
    pub fn option(&self, name: &str) -> Option<&str> {
        self.named
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn option_at(&self, index: usize) -> Option<&str> {
        self.positional.get(index).map(String::as_str)
    }

    /// Named option, falling back to the positional option at `index`.
    pub fn option_or_index<T: FromStr>(&self, name: &str, index: usize) -> Option<T> {
        self.option(name)
            .or_else(|| self.option_at(index))
            .and_then(|value| value.parse().ok())
    }

    pub fn port(&self) -> Option<u16> {
        self.option_or_index("port", 0)
    }
}

impl fmt::Display for ConnectionDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(system) = &self.system {
            write!(f, "({})", system)?;
        }
        write!(f, "{}:{}", self.connection_type(), self.address)?;
        for option in &self.positional {
            write!(f, ":{}", option)?;
        }
        for (key, value) in &self.named {
            write!(f, ":{}={}", key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_full_form() {
        let details = ConnectionDetails::parse("(Socket)direct:10.0.0.1:8080:security=none").unwrap();
        assert_eq!(details.system(), Some("Socket"));
        assert_eq!(details.connection_type(), "direct");
        assert_eq!(details.address(), "10.0.0.1");
        assert_eq!(details.port(), Some(8080));
        assert_eq!(details.option("security"), Some("none"));
        assert_eq!(details.to_string(), "(Socket)direct:10.0.0.1:8080:security=none");
    }

    #[test]
    fn test_named_port_wins() {
        let details = ConnectionDetails::parse("direct:localhost:1:port=2").unwrap();
        assert_eq!(details.system(), None);
        assert_eq!(details.port(), Some(2));
    }

    #[rstest]
    #[case(":host:9")]
    #[case("()passive:host:9")]
    fn test_type_defaults(#[case] input: &str) {
        let details = ConnectionDetails::parse(input).unwrap();
        assert_eq!(details.address(), "host");
        assert_eq!(details.port(), Some(9));
    }

    #[rstest]
    #[case("nocolon")]
    #[case("direct:")]
    #[case("(Socket direct:host:1")]
    fn test_rejects(#[case] input: &str) {
        assert!(matches!(
            ConnectionDetails::parse(input),
            Err(AppError::InvalidConnectionDetails(_))
        ));
    }

    #[test]
    fn test_missing_port() {
        let details = ConnectionDetails::parse("(Socket)direct:host").unwrap();
        assert!(!details.has_options());
        assert_eq!(details.port(), None);
    }
}
