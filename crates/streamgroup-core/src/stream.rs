//! Stream identifiers and entries.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::keys;

/// Field map carried by a stream entry.
pub type Fields = BTreeMap<String, String>;

/// Position of an entry within one partition stream.
///
/// Offsets are assigned by the backend and strictly increase within a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Offset(pub u64);

impl Offset {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a blocking read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPosition {
    /// Every entry in the stream.
    Beginning,
    /// Entries strictly after the given offset.
    After(Offset),
}

impl ReadPosition {
    /// True if an entry at `offset` would be returned by a read from this position.
    pub fn admits(&self, offset: Offset) -> bool {
        match self {
            ReadPosition::Beginning => true,
            ReadPosition::After(after) => offset > *after,
        }
    }
}

impl From<Option<Offset>> for ReadPosition {
    fn from(offset: Option<Offset>) -> Self {
        match offset {
            Some(offset) => ReadPosition::After(offset),
            None => ReadPosition::Beginning,
        }
    }
}

/// One entry read from a partition stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub offset: Offset,
    pub fields: Fields,
}

/// A physical partition of a channel.
///
/// Ordering is by channel name, then partition index; assignment relies on this order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId {
    pub channel: String,
    pub index: u32,
}

impl PartitionId {
    pub fn new(channel: impl Into<String>, index: u32) -> Self {
        Self {
            channel: channel.into(),
            index,
        }
    }

    /// The backend stream key holding this partition's entries.
    pub fn stream_key(&self) -> String {
        keys::partition_stream_key(&self.channel, self.index)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.channel, self.index)
    }
}

/// The ordered, de-duplicated set of channels a subscription consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelSet(BTreeSet<String>);

impl ChannelSet {
    pub fn new<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(channels.into_iter().map(Into::into).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.0.contains(channel)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical form used in backend keys: sorted channel names joined by `,`.
    pub fn canonical(&self) -> String {
        self.0.iter().map(String::as_str).collect::<Vec<_>>().join(",")
    }
}

impl fmt::Display for ChannelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.canonical())
    }
}
