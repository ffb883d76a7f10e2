use seglog::{Error, LockableKey, Store, UserValue};
use test_log::test;

struct Noop;

impl seglog::Functions for Noop {
    type Input = ();
    type Output = Vec<u8>;

    fn single_reader(&mut self, _key: &[u8], value: &UserValue, output: &mut Vec<u8>) {
        output.clear();
        output.extend_from_slice(value);
    }

    fn initial_updater(&mut self, _key: &[u8], _input: &()) -> UserValue {
        UserValue::from(&[][..])
    }

    fn in_place_updater(&mut self, _key: &[u8], _value: &mut UserValue, _input: &()) -> bool {
        true
    }

    fn copy_updater(&mut self, _key: &[u8], old: &UserValue, _input: &()) -> UserValue {
        old.clone()
    }
}

#[test]
fn state_machine_is_enforced() -> seglog::Result<()> {
    let store = Store::new();
    let mut session = store.lockable_session(Noop);

    let mut keys = [LockableKey::exclusive(1)];

    // locking outside lockable mode
    assert!(matches!(session.lock(&mut keys), Err(Error::InvalidState)));

    session.begin_lockable()?;
    assert!(matches!(session.begin_lockable(), Err(Error::InvalidState)));

    session.lock(&mut keys)?;

    // leaving with live locks
    assert!(matches!(session.end_lockable(), Err(Error::InvalidState)));

    session.unlock(&mut keys)?;
    session.end_lockable()?;

    assert!(matches!(session.end_lockable(), Err(Error::InvalidState)));

    Ok(())
}

#[test]
fn duplicate_codes_collapse_into_one_acquisition() -> seglog::Result<()> {
    let store = Store::new();
    let mut session = store.lockable_session(Noop);

    session.begin_lockable()?;

    let mut keys = [
        LockableKey::exclusive(7),
        LockableKey::shared(7),
        LockableKey::shared(7),
        LockableKey::shared(8),
    ];

    // with the default table, codes 7 and 8 land on distinct buckets
    let table = store.lock_table();
    assert_ne!(table.bucket_index(7), table.bucket_index(8));

    session.lock(&mut keys)?;

    // one exclusive acquisition for all the 7s, one shared for 8
    assert_eq!(1, session.exclusive_lock_count());
    assert_eq!(1, session.shared_lock_count());
    assert!(table.is_locked_exclusive(7));
    assert!(table.is_locked_shared(8));
    assert!(!table.is_locked_shared(7));

    session.unlock(&mut keys)?;

    assert_eq!(0, session.exclusive_lock_count());
    assert_eq!(0, session.shared_lock_count());
    assert!(!table.is_locked(7));
    assert!(!table.is_locked(8));

    session.end_lockable()?;

    Ok(())
}

#[test]
fn colliding_buckets_collapse_further() -> seglog::Result<()> {
    // a single bucket makes every code collide
    let store = Store::with_lock_buckets(1);
    let mut session = store.lockable_session(Noop);

    session.begin_lockable()?;

    let mut keys = [
        LockableKey::exclusive(7),
        LockableKey::shared(7),
        LockableKey::shared(7),
        LockableKey::shared(8),
    ];

    session.lock(&mut keys)?;

    // the exclusive sorts first, so the one acquisition is exclusive
    assert_eq!(1, session.exclusive_lock_count());
    assert_eq!(0, session.shared_lock_count());
    assert!(store.lock_table().is_locked_exclusive(7));
    assert!(store.lock_table().is_locked_exclusive(8));

    session.unlock(&mut keys)?;
    assert!(!store.lock_table().is_locked(7));

    session.end_lockable()?;

    Ok(())
}

#[test]
fn lock_counts_return_to_baseline() -> seglog::Result<()> {
    let store = Store::new();
    let mut session = store.lockable_session(Noop);

    session.begin_lockable()?;

    let mut held = [LockableKey::exclusive(100), LockableKey::shared(200)];
    session.lock(&mut held)?;

    let exclusive_before = session.exclusive_lock_count();
    let shared_before = session.shared_lock_count();

    let mut keys: Vec<LockableKey> = (0..16)
        .map(|code| {
            if code % 3 == 0 {
                LockableKey::exclusive(code)
            } else {
                LockableKey::shared(code)
            }
        })
        .collect();

    session.lock(&mut keys)?;
    session.unlock(&mut keys)?;

    assert_eq!(exclusive_before, session.exclusive_lock_count());
    assert_eq!(shared_before, session.shared_lock_count());

    session.unlock(&mut held)?;
    session.end_lockable()?;

    Ok(())
}

#[test]
fn crossing_sessions_do_not_deadlock() -> seglog::Result<()> {
    let store = Store::new();

    let threads: Vec<_> = (0..4u64)
        .map(|thread| {
            let store = store.clone();

            std::thread::spawn(move || -> seglog::Result<()> {
                let mut session = store.lockable_session(Noop);
                session.begin_lockable()?;

                for round in 0..100u64 {
                    // overlapping sets, presented in per-thread order;
                    // the shared sort order defuses the cycle
                    let mut keys = [
                        LockableKey::exclusive((thread + round) % 8),
                        LockableKey::exclusive((thread + round + 1) % 8),
                        LockableKey::shared((thread + round + 2) % 8),
                    ];

                    session.lock(&mut keys)?;
                    session.unlock(&mut keys)?;
                }

                session.end_lockable()?;
                Ok(())
            })
        })
        .collect();

    for thread in threads {
        thread.join().expect("thread panicked")?;
    }

    Ok(())
}
