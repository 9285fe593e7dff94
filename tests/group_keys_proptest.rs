//! Property tests for group identity: the same logical group always maps to the same
//! coordination keys and the same assignment, however its channels are listed.

use std::collections::BTreeSet;

use proptest::prelude::*;
use streamgroup::ChannelSet;
use streamgroup::PartitionId;
use streamgroup::compute_assignment;
use streamgroup::keys;

fn arb_channel() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_.-]{0,11}"
}

fn arb_channels() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(arb_channel(), 1..6)
}

proptest! {
    #[test]
    fn test_channel_order_and_duplicates_do_not_change_keys(
        channels in arb_channels(),
        seed in any::<u64>(),
    ) {
        let mut shuffled = channels.clone();
        shuffled.extend(channels.iter().take((seed % 3) as usize).cloned());
        let len = shuffled.len();
        shuffled.rotate_left((seed as usize) % len);
        shuffled.reverse();

        let a = ChannelSet::new(channels);
        let b = ChannelSet::new(shuffled);
        prop_assert_eq!(keys::leader_key("billing", &a), keys::leader_key("billing", &b));
        prop_assert_eq!(keys::assignment_key("billing", &a), keys::assignment_key("billing", &b));
    }

    #[test]
    fn test_distinct_channel_sets_get_distinct_keys(
        left in arb_channels(),
        right in arb_channels(),
    ) {
        let a = ChannelSet::new(left);
        let b = ChannelSet::new(right);
        prop_assume!(a != b);
        prop_assert_ne!(keys::leader_key("billing", &a), keys::leader_key("billing", &b));
        prop_assert_ne!(keys::assignment_key("billing", &a), keys::assignment_key("billing", &b));
    }

    #[test]
    fn test_partition_stream_keys_identify_their_partition(
        channel in arb_channel(),
        index in 0u32..10_000,
    ) {
        let key = PartitionId::new(channel.clone(), index).stream_key();
        prop_assert_eq!(keys::parse_partition_stream_key(&key), Some((channel.as_str(), index)));
    }

    #[test]
    fn test_multi_channel_groups_are_balanced(
        channels in arb_channels(),
        partitions_per_channel in 1u32..8,
        members in prop::collection::btree_set("c[0-9]{1,3}", 1..8),
    ) {
        let set = ChannelSet::new(channels);
        let partitions: BTreeSet<PartitionId> = set
            .iter()
            .flat_map(|c| (0..partitions_per_channel).map(move |i| PartitionId::new(c, i)))
            .collect();

        let owners = compute_assignment(&partitions, &members);
        prop_assert_eq!(owners.len(), partitions.len());
        let owned: BTreeSet<PartitionId> = owners.iter().map(|o| o.partition.clone()).collect();
        prop_assert_eq!(&owned, &partitions);

        let floor = partitions.len() / members.len();
        for member in &members {
            let share = owners.iter().filter(|o| &o.consumer_id == member).count();
            prop_assert!(share == floor || share == floor + 1, "{} owns {}", member, share);
        }
    }
}
