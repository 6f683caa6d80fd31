//! Parsing requested PV names into channels and sub-fields.
//!
//! A requested name may carry a provider prefix (`pva://` or `ca://`). For pvAccess
//! the name is split at its first `.` into the channel name and a sub-field path, so
//! `pva://BPM1.x.value` opens channel `BPM1` and reads `x.value` from it. Channel
//! Access has no sub-field addressing: `REC.EGU` is itself a channel name, so it is
//! never split.

use nom::{
    IResult, Parser,
    bytes::complete::{tag, take_till1},
    character::complete::{alphanumeric1, char},
    combinator::{opt, rest},
    sequence::{preceded, terminated},
};
use std::{fmt, str::FromStr};

/// Network providers a PV can be reached through
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Provider {
    /// Channel Access
    Ca,
    /// pvAccess
    #[default]
    Pva,
}

impl Provider {
    pub fn name(&self) -> &'static str {
        match self {
            Provider::Ca => "ca",
            Provider::Pva => "pva",
        }
    }
    /// The character separating a channel name from a sub-field path, if any
    pub fn field_separator(&self) -> Option<char> {
        match self {
            Provider::Ca => None,
            Provider::Pva => Some('.'),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Provider {
    type Err = NameError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ca" => Ok(Provider::Ca),
            "pva" => Ok(Provider::Pva),
            _ => Err(NameError::UnknownProvider(s.to_string())),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("Empty PV name")]
    Empty,
    #[error("Unknown provider '{0}'")]
    UnknownProvider(String),
    #[error("Malformed PV name '{0}'")]
    Malformed(String),
}

/// A requested PV name, split into the parts that drive connection sharing
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelName {
    /// The name exactly as it was requested
    pub requested: String,
    pub provider: Provider,
    /// The channel to open. Names sharing this and the provider share a connection.
    pub top_level: String,
    /// The path of a field inside the channel's structure
    pub sub_field: Option<String>,
}

fn provider_prefix(input: &str) -> IResult<&str, Option<&str>> {
    opt(terminated(alphanumeric1, tag("://"))).parse(input)
}

fn split_field(input: &str, separator: char) -> IResult<&str, (&str, Option<&str>)> {
    (
        take_till1(move |c| c == separator),
        opt(preceded(char(separator), rest)),
    )
        .parse(input)
}

impl ChannelName {
    /// Parse a requested name, using `default_provider` if it carries no prefix
    pub fn parse(name: &str, default_provider: Provider) -> Result<Self, NameError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(NameError::Empty);
        }
        let malformed = || NameError::Malformed(name.to_string());
        let (remaining, prefix) = provider_prefix(trimmed).map_err(|_| malformed())?;
        let provider = match prefix {
            Some(prefix) => prefix.parse()?,
            None => default_provider,
        };
        if remaining.is_empty() {
            return Err(NameError::Empty);
        }

        let (top_level, sub_field) = match provider.field_separator() {
            None => (remaining, None),
            Some(separator) => {
                let (_, (top_level, sub_field)) =
                    split_field(remaining, separator).map_err(|_| malformed())?;
                (top_level, sub_field)
            }
        };
        if sub_field.is_some_and(|f| f.is_empty() || f.split('.').any(str::is_empty)) {
            return Err(malformed());
        }
        Ok(ChannelName {
            requested: name.to_string(),
            provider,
            top_level: top_level.to_string(),
            sub_field: sub_field.map(str::to_string),
        })
    }

    /// Key used to deduplicate connections
    pub fn connection_key(&self) -> (Provider, &str) {
        (self.provider, &self.top_level)
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.requested)
    }
}
