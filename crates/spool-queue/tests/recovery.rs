//! Crash-recovery behavior: replay, transaction rollback, rotation, and
//! legacy journal compatibility.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use spool_journal::{Journal, Record};
use spool_queue::{now_ms, PersistentQueue, QueueDefaults, QueueOptions};
use tempfile::TempDir;

fn defaults() -> Arc<RwLock<QueueDefaults>> {
    Arc::new(RwLock::new(QueueDefaults::default()))
}

fn open_queue(dir: &TempDir, options: &QueueOptions) -> PersistentQueue {
    PersistentQueue::new(dir.path(), "work", defaults(), options).unwrap()
}

fn payload(text: &str) -> Bytes {
    Bytes::copy_from_slice(text.as_bytes())
}

fn data_of(queue: &PersistentQueue, transactional: bool) -> Option<Vec<u8>> {
    queue.remove(transactional).map(|item| item.data.to_vec())
}

#[test]
fn test_crash_replays_unconfirmed_transaction_to_head() {
    let dir = TempDir::new().unwrap();
    {
        let queue = open_queue(&dir, &QueueOptions::default());
        queue.add(payload("a"), 0);
        queue.add(payload("b"), 0);
        let item = queue.remove(true).unwrap();
        assert_eq!(item.xid, 1);
        assert_eq!(&item.data[..], b"a");
        // Crash: the queue is dropped with the transaction still open.
    }

    let queue = open_queue(&dir, &QueueOptions::default());
    assert_eq!(queue.length(), 2);
    assert_eq!(queue.open_transaction_count(), 0);
    assert_eq!(data_of(&queue, false).unwrap(), b"a");
    assert_eq!(data_of(&queue, false).unwrap(), b"b");
}

#[test]
fn test_confirmed_transaction_does_not_reappear() {
    let dir = TempDir::new().unwrap();
    {
        let queue = open_queue(&dir, &QueueOptions::default());
        queue.add(payload("a"), 0);
        queue.add(payload("b"), 0);
        let item = queue.remove(true).unwrap();
        queue.confirm_remove(item.xid);
    }

    let queue = open_queue(&dir, &QueueOptions::default());
    assert_eq!(queue.length(), 1);
    assert_eq!(data_of(&queue, false).unwrap(), b"b");
    assert!(queue.remove(false).is_none());
}

#[test]
fn test_rollback_order_after_replay_is_ascending_xid() {
    let dir = TempDir::new().unwrap();
    {
        let queue = open_queue(&dir, &QueueOptions::default());
        queue.add(payload("a"), 0);
        queue.add(payload("b"), 0);
        queue.add(payload("c"), 0);
        assert_eq!(queue.remove(true).unwrap().xid, 1);
        assert_eq!(queue.remove(true).unwrap().xid, 2);
    }

    // Each rollback reinserts at the head in ascending xid order, so the
    // higher xid ends up in front.
    let queue = open_queue(&dir, &QueueOptions::default());
    assert_eq!(queue.length(), 3);
    assert_eq!(data_of(&queue, false).unwrap(), b"b");
    assert_eq!(data_of(&queue, false).unwrap(), b"a");
    assert_eq!(data_of(&queue, false).unwrap(), b"c");
}

#[test]
fn test_total_items_survives_crash() {
    let dir = TempDir::new().unwrap();
    {
        let queue = open_queue(&dir, &QueueOptions::default());
        for text in ["a", "b", "c"] {
            queue.add(payload(text), 0);
        }
        queue.remove(false);
    }

    let queue = open_queue(&dir, &QueueOptions::default());
    assert_eq!(queue.total_items(), 3);
    assert_eq!(queue.length(), 2);
}

#[test]
fn test_torn_tail_is_discarded_on_replay() {
    let dir = TempDir::new().unwrap();
    {
        let queue = open_queue(&dir, &QueueOptions::default());
        queue.add(payload("whole"), 0);
    }
    // A crash mid-append leaves a partial record at the tail.
    {
        use std::io::Write as _;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("work"))
            .unwrap();
        file.write_all(&[0x06, 0x03, 0x00]).unwrap();
    }

    let queue = open_queue(&dir, &QueueOptions::default());
    assert_eq!(queue.length(), 1);
    assert_eq!(data_of(&queue, false).unwrap(), b"whole");

    // The queue keeps working past the point of the discarded tail.
    queue.add(payload("after"), 0);
    drop(queue);
    let queue = open_queue(&dir, &QueueOptions::default());
    assert_eq!(queue.length(), 1);
    assert_eq!(data_of(&queue, false).unwrap(), b"after");
}

#[test]
fn test_legacy_records_replay() {
    let dir = TempDir::new().unwrap();
    {
        let mut journal = Journal::open(dir.path(), "work", false).unwrap();
        journal
            .append(&Record::Add {
                data: Bytes::from_static(b"old-style"),
            })
            .unwrap();
        journal
            .append(&Record::Add {
                data: Bytes::from_static(b"second"),
            })
            .unwrap();
        // The legacy tentative remove carries no xid; replay synthesizes one
        // and rolls the transaction back.
        journal.append(&Record::RemoveTentative).unwrap();
    }

    let queue = open_queue(&dir, &QueueOptions::default());
    assert_eq!(queue.length(), 2);
    assert_eq!(data_of(&queue, false).unwrap(), b"old-style");
    assert_eq!(data_of(&queue, false).unwrap(), b"second");
}

#[test]
fn test_saved_xid_restores_counter() {
    let dir = TempDir::new().unwrap();
    {
        let mut journal = Journal::open(dir.path(), "work", false).unwrap();
        journal.saved_xid(41).unwrap();
        journal
            .append(&Record::AddX {
                expiry_ms: 0,
                data: Bytes::from_static(b"a"),
            })
            .unwrap();
    }

    let queue = open_queue(&dir, &QueueOptions::default());
    assert_eq!(queue.remove(true).unwrap().xid, 42);
}

#[test]
fn test_drain_rotates_journal_to_saved_xid_only() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(
        &dir,
        &QueueOptions {
            max_journal_size: Some(1),
            ..QueueOptions::default()
        },
    );

    for _ in 0..4 {
        queue.add(payload("payload"), 0);
    }
    let grown = queue.journal_size();
    for _ in 0..4 {
        queue.remove(false);
    }
    // Emptying the queue with an oversized journal rewrites it down to a
    // counter snapshot.
    assert_eq!(queue.journal_size(), Record::SavedXid(0).encoded_len());
    assert!(queue.journal_size() < grown);

    drop(queue);
    let queue = open_queue(&dir, &QueueOptions::default());
    assert_eq!(queue.length(), 0);
}

#[test]
fn test_roll_preserves_live_and_open_state() {
    let dir = TempDir::new().unwrap();
    {
        let queue = open_queue(&dir, &QueueOptions::default());
        queue.add(payload("taken"), 0);
        queue.add(payload("kept-1"), 0);
        queue.add(payload("kept-2"), 0);
        assert_eq!(queue.remove(true).unwrap().xid, 1);

        // Shrink the journal target so the next add forces a rotation.
        queue.reconfigure(&QueueOptions {
            max_journal_size: Some(10),
            max_journal_overflow: Some(1),
            max_journal_size_absolute: Some(10),
            ..QueueOptions::default()
        });
        queue.add(payload("kept-3"), 0);
    }

    let queue = open_queue(&dir, &QueueOptions::default());
    // The open transaction rolled back to the head; live items follow in
    // their original order.
    assert_eq!(queue.length(), 4);
    assert_eq!(data_of(&queue, false).unwrap(), b"taken");
    assert_eq!(data_of(&queue, false).unwrap(), b"kept-1");
    assert_eq!(data_of(&queue, false).unwrap(), b"kept-2");
    assert_eq!(data_of(&queue, false).unwrap(), b"kept-3");
    // The rolled journal preserved the counter, so xids continue from 1.
    queue.add(payload("x"), 0);
    assert_eq!(queue.remove(true).unwrap().xid, 2);
}

#[test]
fn test_replay_enters_read_behind_when_over_memory_budget() {
    let dir = TempDir::new().unwrap();
    {
        let queue = open_queue(&dir, &QueueOptions::default());
        for i in 0..20 {
            queue.add(payload(&format!("item-{i:02}")), 0);
        }
    }

    // Reopen with a budget that only fits a few items; the rest stay on
    // disk behind the read cursor.
    let queue = open_queue(
        &dir,
        &QueueOptions {
            max_memory_size: Some(32),
            ..QueueOptions::default()
        },
    );
    assert_eq!(queue.length(), 20);
    assert!(queue.in_read_behind());
    // Residency is checked before each insert, so the prefix that crossed
    // the budget stays resident: five 7-byte items.
    assert_eq!(queue.memory_length(), 5);
    assert_eq!(queue.memory_bytes(), 35);

    for i in 0..20 {
        assert_eq!(data_of(&queue, false).unwrap(), format!("item-{i:02}").as_bytes());
    }
    assert!(!queue.in_read_behind());
}

#[test]
fn test_crash_while_in_read_behind() {
    let dir = TempDir::new().unwrap();
    {
        let queue = open_queue(
            &dir,
            &QueueOptions {
                max_memory_size: Some(8),
                ..QueueOptions::default()
            },
        );
        for i in 0..6 {
            queue.add(payload(&format!("rb-{i}")), 0);
        }
        assert!(queue.in_read_behind());
        assert_eq!(data_of(&queue, false).unwrap(), b"rb-0");
    }

    let queue = open_queue(
        &dir,
        &QueueOptions {
            max_memory_size: Some(8),
            ..QueueOptions::default()
        },
    );
    assert_eq!(queue.length(), 5);
    for i in 1..6 {
        assert_eq!(data_of(&queue, false).unwrap(), format!("rb-{i}").as_bytes());
    }
}

#[test]
fn test_sync_journal_mode_round_trips() {
    let dir = TempDir::new().unwrap();
    {
        let queue = open_queue(
            &dir,
            &QueueOptions {
                sync_journal: Some(true),
                ..QueueOptions::default()
            },
        );
        queue.add(payload("durable"), 0);
    }
    let queue = open_queue(&dir, &QueueOptions::default());
    assert_eq!(data_of(&queue, false).unwrap(), b"durable");
}

#[test]
fn test_close_then_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let queue = open_queue(&dir, &QueueOptions::default());
        queue.add(payload("a"), 0);
        queue.close();
        assert!(!queue.add(payload("b"), 0));
    }
    let queue = open_queue(&dir, &QueueOptions::default());
    assert_eq!(queue.length(), 1);
    assert_eq!(data_of(&queue, false).unwrap(), b"a");
}
