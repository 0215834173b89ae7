// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire protocol version negotiation.
//!
//! A protocol is named "ferry-migrate-<encoding>/<version>". The source lists
//! every protocol it speaks, comma-delimited, in its offer; the sink picks
//! the newest one it also speaks and names it in its plan. Versions are
//! compared before encodings, so a newer version always wins.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use strum::{EnumIter, IntoEnumIterator};
use thiserror::Error;

const PREFIX: &str = "ferry-migrate-";
const ENCODING_VERSION_SEPARATOR: char = '/';
const DELIMITER: char = ',';

/// Errors that can arise while parsing a protocol offer string.
#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
pub enum ProtocolParseError {
    #[error("protocol string did not begin with ferry-migrate-: {0}")]
    InvalidPrefix(String),

    #[error("protocol string did not have a '/' separator: {0}")]
    NoEncodingVersionSeparator(String),

    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("failed to parse protocol version number {0}: {1}")]
    InvalidVersionNumber(String, String),

    #[error("offered protocol set contained duplicate protocol {0}")]
    DuplicateProtocolInOffer(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Encoding {
    Ron,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Ron => f.write_str("ron"),
        }
    }
}

impl FromStr for Encoding {
    type Err = ProtocolParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ron" => Ok(Encoding::Ron),
            _ => Err(ProtocolParseError::InvalidEncoding(s.to_owned())),
        }
    }
}

/// The protocols this build of the server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum Protocol {
    /// RON-encoded control messages, tagged binary frames.
    RonV1,
}

impl Protocol {
    fn descriptor(&self) -> Descriptor {
        match self {
            Protocol::RonV1 => {
                Descriptor { version: 1, encoding: Encoding::Ron }
            }
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.descriptor(), f)
    }
}

// N.B. Field order matters: the derived Ord compares versions first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Descriptor {
    version: u32,
    encoding: Encoding,
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{PREFIX}{}{ENCODING_VERSION_SEPARATOR}{}",
            self.encoding, self.version
        )
    }
}

impl FromStr for Descriptor {
    type Err = ProtocolParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(PREFIX)
            .ok_or_else(|| ProtocolParseError::InvalidPrefix(s.to_owned()))?;
        let (encoding, version) =
            rest.split_once(ENCODING_VERSION_SEPARATOR).ok_or_else(|| {
                ProtocolParseError::NoEncodingVersionSeparator(s.to_owned())
            })?;

        let encoding = encoding.parse()?;
        let version = version.parse().map_err(|e: std::num::ParseIntError| {
            ProtocolParseError::InvalidVersionNumber(
                version.to_owned(),
                e.to_string(),
            )
        })?;

        Ok(Descriptor { version, encoding })
    }
}

lazy_static! {
    static ref SUPPORTED: BTreeSet<Descriptor> =
        Protocol::iter().map(|p| p.descriptor()).collect();
}

fn offer_from(set: &BTreeSet<Descriptor>) -> String {
    let offers: Vec<String> = set.iter().map(ToString::to_string).collect();
    offers.join(&DELIMITER.to_string())
}

/// The offer string listing every supported protocol.
pub fn make_protocol_offer() -> String {
    offer_from(&SUPPORTED)
}

fn parse_offer(
    offer: &str,
) -> Result<BTreeSet<Descriptor>, ProtocolParseError> {
    let mut parsed = BTreeSet::new();
    for o in offer.split(DELIMITER) {
        let d: Descriptor = o.trim().parse()?;
        if !parsed.insert(d) {
            return Err(ProtocolParseError::DuplicateProtocolInOffer(
                d.to_string(),
            ));
        }
    }
    Ok(parsed)
}

fn newest_common(
    offered: &BTreeSet<Descriptor>,
    supported: &BTreeSet<Descriptor>,
) -> Option<Descriptor> {
    offered.intersection(supported).last().copied()
}

/// Picks the newest protocol present in both `offer` and the supported set.
///
/// Returns `Ok(None)` if the offer parsed but shares nothing with us.
pub fn select_protocol_from_offer(
    offer: &str,
) -> Result<Option<Protocol>, ProtocolParseError> {
    let offered = parse_offer(offer)?;
    Ok(newest_common(&offered, &SUPPORTED).and_then(|d| {
        Protocol::iter().find(|p| p.descriptor() == d)
    }))
}

/// Parses the protocol a sink selected.
pub fn parse_selection(s: &str) -> Result<Protocol, ProtocolParseError> {
    let d: Descriptor = s.parse()?;
    Protocol::iter()
        .find(|p| p.descriptor() == d)
        .ok_or_else(|| ProtocolParseError::InvalidEncoding(s.to_owned()))
}
