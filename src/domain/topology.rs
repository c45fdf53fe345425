//! Connection string parsing.
//!
//! A connection string describes an OR-list of AND-groups:
//!
//! ```text
//! ADDR (("&&" ADDR)* ("||" ADDR ("&&" ADDR)*)*)
//! ```
//!
//! `a && b || c` yields the groups `[a, b]` and `[c]`: every message goes to
//! both `a` and `b`, and `c` is only used while `a` and `b` are both down.
//! Addresses are opaque and handed verbatim to the connector. Each address
//! may appear only once, since it names both a destination and its journal.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::RelayError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token<'a> {
    Addr(&'a str),
    And,
    Or,
}

/// Parsed connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    groups: Vec<Vec<String>>,
}

impl Topology {
    /// Returns the AND-groups in OR order.
    #[must_use]
    pub fn groups(&self) -> &[Vec<String>] {
        &self.groups
    }

    /// Returns the total number of addresses.
    #[must_use]
    pub fn address_count(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }
}

impl FromStr for Topology {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens = tokenize(s);
        if tokens.is_empty() {
            return Err(RelayError::InvalidTopology(
                "connection string is empty".to_string(),
            ));
        }

        let mut groups = vec![Vec::new()];
        let mut seen = HashSet::new();
        let mut expect_addr = true;
        for token in tokens {
            match (token, expect_addr) {
                (Token::Addr(addr), true) => {
                    if !seen.insert(addr) {
                        return Err(RelayError::InvalidTopology(format!(
                            "address `{addr}` appears more than once in `{s}`"
                        )));
                    }
                    if let Some(group) = groups.last_mut() {
                        group.push(addr.to_string());
                    }
                    expect_addr = false;
                }
                (Token::Addr(addr), false) => {
                    return Err(RelayError::InvalidTopology(format!(
                        "expected `&&` or `||` before `{addr}` in `{s}`"
                    )));
                }
                (Token::And, false) => expect_addr = true,
                (Token::Or, false) => {
                    groups.push(Vec::new());
                    expect_addr = true;
                }
                (Token::And | Token::Or, true) => {
                    return Err(RelayError::InvalidTopology(format!(
                        "operator without left-hand address in `{s}`"
                    )));
                }
            }
        }

        if expect_addr {
            return Err(RelayError::InvalidTopology(format!(
                "dangling operator at end of `{s}`"
            )));
        }

        Ok(Self { groups })
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.groups.iter().map(|g| g.join(" && ")).collect();
        write!(f, "{}", rendered.join(" || "))
    }
}

/// Splits on whitespace, then on operators glued to addresses (`a&&b`).
fn tokenize(s: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    for word in s.split_whitespace() {
        let mut rest = word;
        while !rest.is_empty() {
            let next_op = [("&&", Token::And), ("||", Token::Or)]
                .into_iter()
                .filter_map(|(op, token)| rest.find(op).map(|pos| (pos, op.len(), token)))
                .min_by_key(|(pos, _, _)| *pos);

            match next_op {
                Some((pos, len, token)) => {
                    let (addr, tail) = rest.split_at(pos);
                    if !addr.is_empty() {
                        tokens.push(Token::Addr(addr));
                    }
                    tokens.push(token);
                    rest = tail.get(len..).unwrap_or_default();
                }
                None => {
                    tokens.push(Token::Addr(rest));
                    rest = "";
                }
            }
        }
    }
    tokens
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Topology {
        let Ok(topology) = s.parse::<Topology>() else {
            panic!("`{s}` should parse");
        };
        topology
    }

    #[test]
    fn single_address() {
        let t = parse("127.0.0.1:4690");
        assert_eq!(t.groups(), &[vec!["127.0.0.1:4690".to_string()]]);
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let t = parse("a && b || c");
        assert_eq!(
            t.groups(),
            &[
                vec!["a".to_string(), "b".to_string()],
                vec!["c".to_string()]
            ]
        );
        assert_eq!(t.address_count(), 3);
    }

    #[test]
    fn operators_without_spaces() {
        assert_eq!(parse("a&&b||c&&d"), parse("a && b || c && d"));
    }

    #[test]
    fn display_renders_canonical_form() {
        assert_eq!(parse("  a&&b   ||c ").to_string(), "a && b || c");
    }

    #[test]
    fn rejects_malformed_strings() {
        for bad in ["", "   ", "&& a", "a ||", "a && || b", "a b", "|| a"] {
            assert!(bad.parse::<Topology>().is_err(), "`{bad}` should fail");
        }
    }

    #[test]
    fn rejects_repeated_address() {
        for bad in ["a && a", "a || b && a", "a&&b||b"] {
            let Err(RelayError::InvalidTopology(reason)) = bad.parse::<Topology>() else {
                panic!("`{bad}` should be rejected");
            };
            assert!(reason.contains("more than once"), "{reason}");
        }
    }

    #[test]
    fn addresses_are_opaque() {
        let t = parse("unix:/tmp/x.sock || [::1]:4690");
        assert_eq!(
            t.groups(),
            &[
                vec!["unix:/tmp/x.sock".to_string()],
                vec!["[::1]:4690".to_string()]
            ]
        );
    }
}
