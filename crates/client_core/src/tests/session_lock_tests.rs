use super::*;

const HOUR: Duration = Duration::from_secs(60 * 60);

#[test]
fn second_acquire_is_rejected_while_held() {
    let lock = SessionLock::new(SessionId::new(), HOUR);
    let guard = lock.try_acquire().expect("first acquire");
    let busy = match lock.try_acquire() {
        Ok(_) => panic!("second acquire should fail"),
        Err(busy) => busy,
    };
    assert_eq!(busy.holder, guard.token());
    assert_eq!(lock.holder(), Some(guard.token()));
}

#[test]
fn drop_releases_and_tokens_increase() {
    let lock = SessionLock::new(SessionId::new(), HOUR);
    let first = lock.try_acquire().expect("first").token();
    assert!(!lock.is_held());
    let second = lock.try_acquire().expect("second");
    assert!(second.token() > first);
    assert!(second.release());
    assert!(!lock.is_held());
}

#[test]
fn release_happens_once_even_on_early_exit() {
    fn step_that_fails(lock: &SessionLock) -> Result<(), &'static str> {
        let _guard = lock.try_acquire().map_err(|_| "busy")?;
        Err("boom")
    }

    let lock = SessionLock::new(SessionId::new(), HOUR);
    assert_eq!(step_that_fails(&lock), Err("boom"));
    assert!(!lock.is_held());
}

#[test]
fn stuck_holder_is_force_released_after_timeout() {
    let lock = SessionLock::new(SessionId::new(), Duration::from_millis(10));
    let stale = lock.try_acquire().expect("first");
    std::thread::sleep(Duration::from_millis(25));

    let fresh = lock.try_acquire().expect("takeover after timeout");
    assert_ne!(fresh.token(), stale.token());

    // The stale guard must not release the new holder.
    assert!(!stale.release());
    assert_eq!(lock.holder(), Some(fresh.token()));
    drop(fresh);
    assert!(!lock.is_held());
}
