//! End-to-end reader/writer lock scenarios.
//!
//! Each test drives one multi-party trace against the public API,
//! checking both the resolution each party observes and the lock state
//! left behind.
//!
//! Run with: `cargo test --test rwlock_scenarios`

use std::sync::Arc;
use std::time::Duration;

use uplock::test_utils::{init_test_logging, poll_once, poll_until_ready};
use uplock::{CancelSource, LockError, ReaderWriterLock, Wait};
use uplock::{assert_with_log, test_complete, test_phase};

fn init_test(name: &str) {
    init_test_logging();
    test_phase!(name);
}

#[test]
fn writer_blocks_reader() {
    init_test("writer_blocks_reader");
    let lock = ReaderWriterLock::new();

    let writer = poll_until_ready(lock.write(Wait::FOREVER));
    assert_with_log!(writer == Ok(true), "writer granted", Ok::<bool, LockError>(true), writer);

    let mut reader = lock.read(Wait::FOREVER);
    let pending = poll_once(&mut reader).is_none();
    assert_with_log!(pending, "reader pending", true, pending);

    lock.release_write().expect("release write");

    let granted = poll_once(&mut reader);
    assert_with_log!(granted == Some(Ok(true)), "reader resolves true", Some(Ok::<bool, LockError>(true)), granted);
    assert_with_log!(lock.read_count() == 1, "readers=1", 1usize, lock.read_count());
    assert_with_log!(!lock.is_write_held(), "writer_held=false", false, lock.is_write_held());
    assert_with_log!(
        !lock.is_upgradeable_read_held(),
        "upgradeable=false",
        false,
        lock.is_upgradeable_read_held()
    );
    lock.release_read().expect("release read");
    test_complete!("writer_blocks_reader");
}

#[test]
fn reader_fairness_against_writer() {
    init_test("reader_fairness_against_writer");
    let lock = ReaderWriterLock::new();

    let first = poll_until_ready(lock.read(Wait::FOREVER));
    assert_with_log!(first == Ok(true), "first reader granted", Ok::<bool, LockError>(true), first);
    assert_with_log!(lock.read_count() == 1, "readers=1", 1usize, lock.read_count());

    let mut writer = lock.write(Wait::FOREVER);
    let writer_pending = poll_once(&mut writer).is_none();
    assert_with_log!(writer_pending, "writer pending", true, writer_pending);

    // The second reader must not jump the queued writer.
    let mut late_reader = lock.read(Wait::FOREVER);
    let reader_pending = poll_once(&mut late_reader).is_none();
    assert_with_log!(reader_pending, "late reader pending", true, reader_pending);

    lock.release_read().expect("release first reader");

    let write_granted = poll_once(&mut writer);
    assert_with_log!(write_granted == Some(Ok(true)), "writer resolves true", Some(Ok::<bool, LockError>(true)), write_granted);
    assert_with_log!(lock.is_write_held(), "writer_held=true", true, lock.is_write_held());
    assert_with_log!(lock.read_count() == 0, "readers=0", 0usize, lock.read_count());

    lock.release_write().expect("release writer");

    let read_granted = poll_once(&mut late_reader);
    assert_with_log!(read_granted == Some(Ok(true)), "late reader resolves true", Some(Ok::<bool, LockError>(true)), read_granted);
    assert_with_log!(lock.read_count() == 1, "readers=1", 1usize, lock.read_count());
    lock.release_read().expect("release late reader");
    test_complete!("reader_fairness_against_writer");
}

#[test]
fn upgradeable_singleton() {
    init_test("upgradeable_singleton");
    let lock = ReaderWriterLock::new();

    let first = poll_until_ready(lock.upgradeable_read(Wait::FOREVER));
    assert_with_log!(first == Ok(true), "first upgradeable granted", Ok::<bool, LockError>(true), first);
    assert_with_log!(lock.read_count() == 1, "readers=1", 1usize, lock.read_count());
    assert_with_log!(
        lock.is_upgradeable_read_held(),
        "upgradeable=true",
        true,
        lock.is_upgradeable_read_held()
    );

    let mut second = lock.upgradeable_read(Wait::FOREVER);
    let pending = poll_once(&mut second).is_none();
    assert_with_log!(pending, "second upgradeable pending", true, pending);

    // A plain reader gets through: only readers are present.
    let plain = poll_until_ready(lock.read(Wait::FOREVER));
    assert_with_log!(plain == Ok(true), "plain reader granted", Ok::<bool, LockError>(true), plain);
    assert_with_log!(lock.read_count() == 2, "readers=2", 2usize, lock.read_count());

    lock.release_upgradeable_read().expect("release first upgradeable");

    let second_granted = poll_once(&mut second);
    assert_with_log!(
        second_granted == Some(Ok(true)),
        "second upgradeable resolves true",
        Some(Ok::<bool, LockError>(true)),
        second_granted
    );
    assert_with_log!(
        lock.is_upgradeable_read_held(),
        "upgradeable=true again",
        true,
        lock.is_upgradeable_read_held()
    );
    assert_with_log!(lock.read_count() == 2, "readers=2 still", 2usize, lock.read_count());

    lock.release_upgradeable_read().expect("release second upgradeable");
    lock.release_read().expect("release plain reader");
    test_complete!("upgradeable_singleton");
}

#[test]
fn in_place_upgrade() {
    init_test("in_place_upgrade");
    let lock = ReaderWriterLock::new();

    poll_until_ready(lock.upgradeable_read(Wait::FOREVER)).expect("upgradeable");
    let upgraded = poll_until_ready(lock.write(Wait::FOREVER));
    assert_with_log!(upgraded == Ok(true), "in-place upgrade granted", Ok::<bool, LockError>(true), upgraded);
    assert_with_log!(lock.is_write_held(), "writer_held=true", true, lock.is_write_held());
    assert_with_log!(lock.read_count() == 1, "readers=1", 1usize, lock.read_count());

    lock.release_write().expect("release write");
    assert_with_log!(!lock.is_write_held(), "writer_held=false", false, lock.is_write_held());
    assert_with_log!(
        lock.is_upgradeable_read_held(),
        "still upgradeable reader",
        true,
        lock.is_upgradeable_read_held()
    );

    lock.release_upgradeable_read().expect("release upgradeable");
    assert_with_log!(lock.read_count() == 0, "idle", 0usize, lock.read_count());
    assert_with_log!(!lock.is_read_held(), "no readers", false, lock.is_read_held());
    test_complete!("in_place_upgrade");
}

#[test]
fn bounded_wait_times_out_and_unlinks() {
    init_test("bounded_wait_times_out_and_unlinks");
    let lock = ReaderWriterLock::new();

    poll_until_ready(lock.write(Wait::FOREVER)).expect("writer");

    // The bounded read resolves false once its 10ms run out; the loop
    // polls with a plain waker so the timer thread's wake is what ends
    // the wait in a real executor.
    let started = std::time::Instant::now();
    let timed_out = poll_until_ready(lock.read(Wait::timeout(Duration::from_millis(10))));
    assert_with_log!(timed_out == Ok(false), "read resolves false", Ok::<bool, LockError>(false), timed_out);
    let waited = started.elapsed();
    assert_with_log!(
        waited >= Duration::from_millis(10),
        "deadline respected",
        true,
        waited >= Duration::from_millis(10)
    );

    lock.release_write().expect("release write");
    // The timed-out waiter left no trace: the lock is idle.
    let probe = lock.try_write();
    assert_with_log!(probe == Ok(true), "lock idle after timeout", Ok::<bool, LockError>(true), probe);
    lock.release_write().expect("release probe");
    test_complete!("bounded_wait_times_out_and_unlinks");
}

#[test]
fn cancellation_races_grant_exactly_one_wins() {
    init_test("cancellation_races_grant_exactly_one_wins");

    for round in 0..200_u32 {
        let lock = Arc::new(ReaderWriterLock::new());
        poll_until_ready(lock.write(Wait::FOREVER)).expect("writer");

        let source = CancelSource::new();
        let mut reader = lock.read(Wait::FOREVER.cancelled_by(&source.token()));
        let pending = poll_once(&mut reader).is_none();
        assert_with_log!(pending, "reader pending", true, pending);

        // Release and trip nearly simultaneously from two threads.
        let release_lock = Arc::clone(&lock);
        let releaser = std::thread::spawn(move || {
            release_lock.release_write().expect("release write");
        });
        let canceller = std::thread::spawn(move || {
            source.cancel();
        });
        releaser.join().expect("releaser join");
        canceller.join().expect("canceller join");

        match poll_until_ready(reader) {
            Ok(true) => {
                // The grant won: the caller holds the lock and must
                // release it.
                assert_with_log!(lock.read_count() == 1, "grant held", 1usize, lock.read_count());
                lock.release_read().expect("release granted read");
            }
            Err(LockError::Cancelled) => {
                // The cancellation won: nothing is held.
                assert_with_log!(lock.read_count() == 0, "nothing held", 0usize, lock.read_count());
            }
            other => {
                panic!("round {round}: wait must grant or cancel, got {other:?}");
            }
        }
        // Either way the lock ends idle and consistent.
        assert_with_log!(lock.read_count() == 0, "idle readers", 0usize, lock.read_count());
        assert_with_log!(!lock.is_write_held(), "idle writer", false, lock.is_write_held());
    }
    test_complete!("cancellation_races_grant_exactly_one_wins");
}

#[test]
fn disposal_fails_every_pending_waiter() {
    init_test("disposal_fails_every_pending_waiter");
    let lock = ReaderWriterLock::new();

    poll_until_ready(lock.write(Wait::FOREVER)).expect("writer");
    let mut read = lock.read(Wait::FOREVER);
    let mut upgradeable = lock.upgradeable_read(Wait::FOREVER);
    let mut write = lock.write(Wait::FOREVER);
    let _ = poll_once(&mut read);
    let _ = poll_once(&mut upgradeable);
    let _ = poll_once(&mut write);

    lock.dispose();

    for (name, outcome) in [
        ("read", poll_once(&mut read)),
        ("upgradeable", poll_once(&mut upgradeable)),
        ("write", poll_once(&mut write)),
    ] {
        let disposed = outcome == Some(Err(LockError::Disposed));
        assert_with_log!(disposed, name, Some(Err::<bool, LockError>(LockError::Disposed)), outcome);
    }

    let late = poll_once(&mut lock.read(Wait::FOREVER));
    assert_with_log!(
        late == Some(Err(LockError::Disposed)),
        "late acquire rejected",
        Some(Err::<bool, LockError>(LockError::Disposed)),
        late
    );
    assert_with_log!(
        lock.release_write() == Err(LockError::Disposed),
        "late release rejected",
        Err::<(), LockError>(LockError::Disposed),
        lock.release_write()
    );
    test_complete!("disposal_fails_every_pending_waiter");
}

#[test]
fn contended_lock_across_threads_stays_consistent() {
    init_test("contended_lock_across_threads_stays_consistent");
    let lock = Arc::new(ReaderWriterLock::new());
    let mut handles = Vec::new();

    for worker in 0..6_u32 {
        let lock = Arc::clone(&lock);
        handles.push(std::thread::spawn(move || {
            for iteration in 0..100 {
                match worker % 3 {
                    0 => {
                        poll_until_ready(lock.read(Wait::FOREVER)).expect("read");
                        assert!(!lock.is_write_held());
                        lock.release_read().expect("release read");
                    }
                    1 => {
                        poll_until_ready(lock.write(Wait::FOREVER)).expect("write");
                        assert_eq!(lock.read_count(), 0);
                        lock.release_write().expect("release write");
                    }
                    _ => {
                        poll_until_ready(lock.upgradeable_read(Wait::FOREVER))
                            .expect("upgradeable read");
                        // Upgrading in place only succeeds while this is
                        // the sole reader and nobody is queued; a parked
                        // upgrade would wait on its own reader slot.
                        if iteration % 2 == 0 && lock.try_write() == Ok(true) {
                            assert_eq!(lock.read_count(), 1);
                            lock.release_write().expect("release upgrade");
                        }
                        lock.release_upgradeable_read().expect("release upgradeable");
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker join");
    }

    assert_with_log!(lock.read_count() == 0, "idle readers", 0usize, lock.read_count());
    assert_with_log!(!lock.is_write_held(), "idle writer", false, lock.is_write_held());
    assert_with_log!(
        !lock.is_upgradeable_read_held(),
        "idle upgradeable",
        false,
        lock.is_upgradeable_read_held()
    );
    test_complete!("contended_lock_across_threads_stays_consistent");
}
