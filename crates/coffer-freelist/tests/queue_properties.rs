//! Property tests for the queue's multiset and round-trip laws.

mod common;

use std::collections::BTreeSet;

use proptest::prelude::*;

use coffer_freelist::{AllocMode, PageManager, PageQueue};
use coffer_types::PageId;

use common::{commit_cycle, remove_all, MockManager};

proptest! {
    // Whatever goes in across one epoch comes back out: no duplicates, no
    // losses, no strays.
    #[test]
    fn commit_then_remove_returns_the_appended_multiset(
        ids in prop::collection::btree_set(2u64..10_000, 0..400)
    ) {
        let manager = MockManager::new(512, 20_001);
        let queue = PageQueue::create(manager.clone(), AllocMode::Normal, false, 20_000);

        for &id in &ids {
            queue.append(id).unwrap();
        }
        commit_cycle(&queue);

        let removed: BTreeSet<PageId> = remove_all(&queue, &*manager).into_iter().collect();
        prop_assert_eq!(&removed, &ids);

        let remove = queue.remove_lock();
        prop_assert_eq!(remove.page_count(), 0);
    }

    // A queue restored from the header written by commit_start behaves the
    // same as the live queue after commit_end.
    #[test]
    fn restore_is_indistinguishable_from_commit_end(
        ids in prop::collection::btree_set(2u64..10_000, 1..400)
    ) {
        let manager = MockManager::new(512, 20_001);
        let queue = PageQueue::create(manager.clone(), AllocMode::Normal, false, 20_000);

        for &id in &ids {
            queue.append(id).unwrap();
        }

        let mut header = vec![0u8; coffer_freelist::QUEUE_HEADER_SIZE];
        {
            let mut lock = queue.commit_lock();
            queue.pre_commit(&lock).unwrap();
            queue.commit_start(&mut lock, &mut header, 0);
        }

        let restored =
            PageQueue::restore(manager.clone(), AllocMode::Normal, false, &header, 0).unwrap();
        {
            let mut remove = queue.remove_lock();
            queue.commit_end(&mut remove, &header, 0).unwrap();
        }

        let from_live: BTreeSet<PageId> = remove_all(&queue, &*manager).into_iter().collect();
        let from_restored: BTreeSet<PageId> =
            remove_all(&restored, &*manager).into_iter().collect();
        prop_assert_eq!(&from_live, &ids);
        prop_assert_eq!(&from_restored, &ids);
    }

    // Multiple epochs interleaved with partial removal never lose a page.
    #[test]
    fn pages_survive_across_epochs(
        first in prop::collection::btree_set(2u64..5_000, 1..100),
        second in prop::collection::btree_set(5_000u64..10_000, 1..100),
        take in 0usize..50
    ) {
        let manager = MockManager::new(512, 20_001);
        let queue = PageQueue::create(manager.clone(), AllocMode::Normal, false, 20_000);

        for &id in &first {
            queue.append(id).unwrap();
        }
        commit_cycle(&queue);

        // Consume part of the first epoch before the next one lands.
        let mut removed = Vec::new();
        for _ in 0..take.min(first.len()) {
            let mut remove = queue.remove_lock();
            let Some(r) = queue.try_remove(&mut remove).unwrap() else {
                break;
            };
            drop(remove);
            removed.push(r.page_id);
            if let Some(node_id) = r.retired_node {
                manager.delete_page(node_id, false).unwrap();
            }
        }

        for &id in &second {
            queue.append(id).unwrap();
        }
        commit_cycle(&queue);

        removed.extend(remove_all(&queue, &*manager));
        let removed: BTreeSet<PageId> = removed.into_iter().collect();
        let expected: BTreeSet<PageId> = first.union(&second).copied().collect();
        prop_assert_eq!(&removed, &expected);
    }
}
