//! Line-oriented directives read by `blockctl run`.
//!
//! ```text
//! ipset add blocked 1.2.3.4
//! iptables -A FORWARD -m set --match-set blocked src -j DROP
//! hostset add blocked example.com,tcp:443-443
//! hostset flush blocked
//! hostset activate blocked tcp
//! state
//! ```

use std::str::FromStr;

use crate::control::{HostsetAction, IptablesRule, Protocol};
use crate::error::ControlError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// One ipset restore line
    Ipset(String),
    Iptables(IptablesRule),
    Hostset {
        action: HostsetAction,
        set: String,
        domain: String,
    },
    HostsetFlush(String),
    HostsetActivate {
        set: String,
        protocol: Protocol,
    },
    /// Print the coordinator snapshot
    State,
    /// Commit now
    Force,
    /// Discard every queue
    Discard,
}

impl Directive {
    /// Parse one input line. Blank lines and `#` comments yield `None`.
    pub fn parse_line(line: &str) -> Result<Option<Directive>, ControlError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        line.parse().map(Some)
    }
}

fn invalid(line: &str) -> ControlError {
    ControlError::InvalidArgument(format!("unrecognized directive '{}'", line))
}

impl FromStr for Directive {
    type Err = ControlError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let (keyword, rest) = match line.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (line, ""),
        };

        match keyword {
            "ipset" if !rest.is_empty() => Ok(Directive::Ipset(rest.to_string())),
            "iptables" => Ok(Directive::Iptables(rest.parse()?)),
            "hostset" => parse_hostset(line, rest),
            "state" if rest.is_empty() => Ok(Directive::State),
            "force" if rest.is_empty() => Ok(Directive::Force),
            "discard" if rest.is_empty() => Ok(Directive::Discard),
            _ => Err(invalid(line)),
        }
    }
}

fn parse_hostset(line: &str, rest: &str) -> Result<Directive, ControlError> {
    let words: Vec<&str> = rest.split_whitespace().collect();
    match words.as_slice() {
        ["flush", set] => Ok(Directive::HostsetFlush(set.to_string())),
        ["activate", set] => Ok(Directive::HostsetActivate {
            set: set.to_string(),
            protocol: Protocol::Any,
        }),
        ["activate", set, protocol] => Ok(Directive::HostsetActivate {
            set: set.to_string(),
            protocol: protocol.parse()?,
        }),
        [action, set, domain] => Ok(Directive::Hostset {
            action: action.parse()?,
            set: set.to_string(),
            domain: domain.to_string(),
        }),
        _ => Err(invalid(line)),
    }
}
