//! Tests for the cursor coordination arithmetic and its shared-resource
//! naming. The protocol pieces that need a real terminal are exercised
//! through the pure row-math functions they are built from.

use std::path::Path;

use pipeflow::cursor::{
    final_row, join_offset, lock_file_path, parse_answerback, scroll_overflow, segment_key,
    target_row,
};
use serial_test::serial;

#[test]
fn join_ranks_assign_distinct_offsets() {
    // N instances joining in order observe attach counts 1..=N.
    let offsets: Vec<u32> = (1..=8).map(join_offset).collect();
    assert_eq!(offsets, vec![0, 1, 2, 3, 4, 5, 6, 7]);

    // With a common top row and no scroll, the target rows are distinct.
    let rows: Vec<u16> = offsets
        .iter()
        .map(|&o| target_row(10, o as i32, 40))
        .collect();
    let mut deduped = rows.clone();
    deduped.dedup();
    assert_eq!(rows, deduped);
}

#[test]
fn two_instance_scenario_rows() {
    // The hardware reports row 10. Instance A joins first, B afterwards.
    let top_row = 10;
    let a_offset = join_offset(1) as i32;
    let b_offset = join_offset(2) as i32;
    assert_eq!(a_offset, 0);
    assert_eq!(b_offset, 1);
    assert_eq!(target_row(top_row, a_offset, 24), 10);
    assert_eq!(target_row(top_row, b_offset, 24), 11);
}

#[test]
fn scroll_shifts_every_instance_uniformly_and_stays_on_screen() {
    let height = 24u16;
    let max_count = 10u32;
    let top_row = 20i32;

    let overflow = scroll_overflow(top_row, max_count, height);
    assert_eq!(overflow, 6);

    let shifted_top = (top_row - overflow as i32).max(1);
    assert_eq!(shifted_top, 14);
    for offset in 0..max_count as i32 {
        let row = target_row(shifted_top, offset, height);
        assert!((1..=height).contains(&row), "offset {offset} row {row}");
    }

    // No overflow when everything already fits.
    assert_eq!(scroll_overflow(10, 3, height), 0);
}

#[test]
fn max_count_high_water_is_sticky() {
    // Known limitation, preserved on purpose: max_count_seen is a high-water
    // mark, so rows stay reserved for instances that already left. With 3
    // instances ever seen but only 1 still alive, the scroll math still
    // reserves 3 rows and the finishing row still lands below all of them.
    let height = 24u16;
    let top_row = 23i32;
    let max_seen = 3u32;
    let live_count = 1u32;

    assert!(live_count < max_seen);
    assert_eq!(scroll_overflow(top_row, max_seen, height), 2);
    assert_eq!(final_row(top_row - 2, max_seen, height), 23);
}

#[test]
fn final_row_is_clamped_to_screen_and_sanity_bounds() {
    assert_eq!(final_row(10, 2, 24), 11);
    assert_eq!(final_row(23, 5, 24), 24);
    assert_eq!(final_row(1, 1, 24), 1);
    assert_eq!(final_row(-50, 1, 24), 1);
}

#[test]
fn answerback_round_trip_format() {
    // Terminal answers ESC [ row ; col R to the ESC [ 6 n query.
    assert_eq!(parse_answerback(b"\x1b[17;1R"), Some(17));
    assert_eq!(parse_answerback(b"\x1b[17;133R"), Some(17));
    assert_eq!(parse_answerback(b"\x1b[6n"), None);
}

#[test]
#[serial]
fn lock_file_path_is_per_user_per_terminal() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("TMPDIR", dir.path());

    let path = lock_file_path(Path::new("/dev/pts/7"), 1000);
    assert_eq!(path.parent().unwrap(), dir.path());
    assert_eq!(
        path.file_name().unwrap().to_str().unwrap(),
        "pipeflow-7-1000.lock"
    );

    // Different terminals and different users get different files.
    let other_tty = lock_file_path(Path::new("/dev/pts/8"), 1000);
    let other_user = lock_file_path(Path::new("/dev/pts/7"), 1001);
    assert_ne!(path, other_tty);
    assert_ne!(path, other_user);

    std::env::remove_var("TMPDIR");
}

#[test]
#[serial]
fn lock_file_path_falls_back_to_tmp() {
    std::env::remove_var("TMPDIR");
    std::env::remove_var("TMP");
    let path = lock_file_path(Path::new("/dev/tty3"), 500);
    assert_eq!(path, Path::new("/tmp/pipeflow-tty3-500.lock"));
}

#[test]
fn segment_keys_are_stable_per_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("ttyA");
    let b = dir.path().join("ttyB");
    std::fs::write(&a, b"").unwrap();
    std::fs::write(&b, b"").unwrap();

    let key_a = segment_key(&a).unwrap();
    let key_b = segment_key(&b).unwrap();
    assert_eq!(key_a, segment_key(&a).unwrap(), "key must be deterministic");
    assert_ne!(key_a, key_b, "different terminals must not collide");
}

#[test]
fn segment_key_requires_an_existing_terminal_path() {
    assert!(segment_key(Path::new("/definitely/not/a/tty")).is_none());
}

#[test]
#[serial]
fn sysv_segment_round_trips_the_shared_row() {
    // One integer in, the same integer out, then full cleanup. Skipped
    // quietly on kernels built without System V IPC.
    unsafe {
        let id = libc::shmget(
            libc::IPC_PRIVATE,
            std::mem::size_of::<libc::c_int>(),
            0o600 | libc::IPC_CREAT,
        );
        if id < 0 {
            return;
        }

        let addr = libc::shmat(id, std::ptr::null(), 0);
        assert_ne!(addr as isize, -1, "shmat failed");
        let top = addr as *mut libc::c_int;

        std::ptr::write_volatile(top, 17);
        assert_eq!(std::ptr::read_volatile(top), 17);

        let mut ds: libc::shmid_ds = std::mem::zeroed();
        assert_eq!(libc::shmctl(id, libc::IPC_STAT, &mut ds), 0);
        assert_eq!(ds.shm_nattch, 1, "only this test is attached");

        assert_eq!(libc::shmdt(addr), 0);
        assert_eq!(libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()), 0);
    }
}
