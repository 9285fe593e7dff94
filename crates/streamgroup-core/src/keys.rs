//! Backend key layout.
//!
//! Coordination records are namespaced by subscriber id and canonical channel set, so one
//! subscriber id consuming two different channel sets forms two independent groups:
//!
//! ```text
//! __streamgroup/leader/{subscriber_id}/{channel_set}      leadership lease
//! __streamgroup/assignment/{subscriber_id}/{channel_set}  published assignment
//! __streamgroup/members/{subscriber_id}/{channel_set}/{consumer_id}  membership record (TTL)
//! {channel}:partition:{index}                             partition stream
//! ```

use crate::stream::ChannelSet;

/// Prefix for every coordination record.
pub const KEY_PREFIX: &str = "__streamgroup/";

const PARTITION_INFIX: &str = ":partition:";

pub fn leader_key(subscriber_id: &str, channels: &ChannelSet) -> String {
    format!("{KEY_PREFIX}leader/{subscriber_id}/{}", channels.canonical())
}

pub fn assignment_key(subscriber_id: &str, channels: &ChannelSet) -> String {
    format!("{KEY_PREFIX}assignment/{subscriber_id}/{}", channels.canonical())
}

pub fn members_prefix(subscriber_id: &str, channels: &ChannelSet) -> String {
    format!("{KEY_PREFIX}members/{subscriber_id}/{}/", channels.canonical())
}

pub fn member_key(subscriber_id: &str, channels: &ChannelSet, consumer_id: &str) -> String {
    format!("{}{consumer_id}", members_prefix(subscriber_id, channels))
}

/// Extract the consumer id from a membership key of the `(subscriber_id, channels)` group.
pub fn consumer_id_from_member_key<'a>(subscriber_id: &str, channels: &ChannelSet, key: &'a str) -> Option<&'a str> {
    let prefix = members_prefix(subscriber_id, channels);
    key.strip_prefix(prefix.as_str()).filter(|id| !id.is_empty() && !id.contains('/'))
}

pub fn partition_stream_key(channel: &str, index: u32) -> String {
    format!("{channel}{PARTITION_INFIX}{index}")
}

pub fn partition_stream_prefix(channel: &str) -> String {
    format!("{channel}{PARTITION_INFIX}")
}

/// Split a partition stream key back into `(channel, index)`.
pub fn parse_partition_stream_key(key: &str) -> Option<(&str, u32)> {
    let (channel, index) = key.rsplit_once(PARTITION_INFIX)?;
    if channel.is_empty() {
        return None;
    }
    index.parse().ok().map(|index| (channel, index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordination_keys_are_namespaced() {
        let channels = ChannelSet::new(["b", "a"]);
        assert_eq!(leader_key("sub", &channels), "__streamgroup/leader/sub/a,b");
        assert_eq!(assignment_key("sub", &channels), "__streamgroup/assignment/sub/a,b");
        assert_eq!(member_key("sub", &channels, "c1"), "__streamgroup/members/sub/a,b/c1");
    }

    #[test]
    fn member_key_round_trip() {
        let channels = ChannelSet::new(["orders"]);
        let key = member_key("sub", &channels, "consumer-7");
        assert_eq!(consumer_id_from_member_key("sub", &channels, &key), Some("consumer-7"));
        assert_eq!(consumer_id_from_member_key("other", &channels, &key), None);
        assert_eq!(consumer_id_from_member_key("sub", &ChannelSet::new(["refunds"]), &key), None);
        assert_eq!(consumer_id_from_member_key("sub", &channels, "__streamgroup/members/sub/orders/"), None);
    }

    #[test]
    fn partition_key_parsing() {
        assert_eq!(partition_stream_key("orders", 3), "orders:partition:3");
        assert_eq!(parse_partition_stream_key("orders:partition:3"), Some(("orders", 3)));
        assert_eq!(parse_partition_stream_key("a:partition:b:partition:1"), Some(("a:partition:b", 1)));
        assert_eq!(parse_partition_stream_key("orders:partition:x"), None);
        assert_eq!(parse_partition_stream_key(":partition:1"), None);
        assert_eq!(parse_partition_stream_key("orders"), None);
    }
}
