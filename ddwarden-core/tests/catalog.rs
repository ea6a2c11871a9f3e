//! End-to-end runs of catalog operations against regular files, using the
//! system's `dd`.
mod common;

use common::fast_supervisor;
use ddwarden_core::cancel::CancelToken;
use ddwarden_core::catalog::{Event, Operation, Passphrase};
use ddwarden_core::command::{Filesystem, Privilege, Tools, WipeMethod};
use ddwarden_core::outcome::Outcome;
use ddwarden_core::size::DiskSize;
use std::convert::Infallible;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

fn tools() -> Tools {
    Tools::new(Privilege::Direct)
}

/// A `/bin/sh` script run in place of a tool; the tool's arguments arrive as
/// `$1`, `$2`, ...
fn stand_in(script: String) -> [String; 4] {
    ["/bin/sh".into(), "-c".into(), script, "stand-in".into()]
}

/// Cancels once `marker` shows up, i.e. once a stand-in reached a given step.
fn cancel_when_created(marker: &Path, token: CancelToken) -> JoinHandle<()> {
    let marker = marker.to_path_buf();
    thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !marker.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        token.cancel();
    })
}

fn lines(log: &Path) -> Vec<String> {
    fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn stages(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Stage(stage) => Some(stage.clone()),
            _ => None,
        })
        .collect()
}

fn paths(dir: &Path, names: [&str; 2]) -> (PathBuf, PathBuf) {
    (dir.join(names[0]), dir.join(names[1]))
}

fn approve(op: Operation) -> ddwarden_core::catalog::Confirmed {
    op.confirm(|_| Ok::<_, Infallible>(true)).unwrap().unwrap()
}

#[test]
fn flash_copies_image_onto_target() {
    let (supervisor, _) = fast_supervisor();
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("os.img");
    let device = dir.path().join("device");
    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    fs::write(&image, &payload).unwrap();
    fs::write(&device, b"").unwrap();

    let mut events = Vec::new();
    let outcome = approve(Operation::flash(&image, &device).unwrap())
        .execute(&supervisor, &tools(), |e| events.push(e));

    assert_eq!(outcome, Outcome::Succeeded);
    assert_eq!(fs::read(&device).unwrap(), payload);
    assert!(matches!(events.first(), Some(Event::Stage(_))));
    let last = events.iter().rev().find_map(|e| match e {
        Event::Progress(s) => Some(*s),
        _ => None,
    });
    assert_eq!(last.and_then(|s| s.percentage()), Some(100.0));
}

#[test]
fn image_writes_a_new_file() {
    let (supervisor, _) = fast_supervisor();
    let dir = tempfile::tempdir().unwrap();
    let device = dir.path().join("device");
    let output = dir.path().join("backup.img");
    fs::write(&device, vec![0xA5u8; 128 * 1024]).unwrap();

    let outcome = approve(Operation::image(&device, &output).unwrap())
        .execute(&supervisor, &tools(), |_| {});

    assert_eq!(outcome, Outcome::Succeeded);
    assert_eq!(fs::read(&output).unwrap(), fs::read(&device).unwrap());
}

#[test]
fn cancelled_image_leaves_no_file_behind() {
    let (supervisor, token) = fast_supervisor();
    let dir = tempfile::tempdir().unwrap();
    let device = dir.path().join("device");
    let output = dir.path().join("backup.img");
    fs::write(&device, vec![1u8; 4096]).unwrap();

    let confirmed = approve(Operation::image(&device, &output).unwrap());
    token.cancel();
    let outcome = confirmed.execute(&supervisor, &tools(), |_| {});

    assert_eq!(outcome, Outcome::Cancelled);
    assert!(!output.exists());
}

#[test]
fn zero_wipe_overwrites_every_byte() {
    let (supervisor, _) = fast_supervisor();
    let dir = tempfile::tempdir().unwrap();
    let device = dir.path().join("device");
    fs::write(&device, vec![0xFFu8; 64 * 1024]).unwrap();

    let mut passes = Vec::new();
    let outcome = approve(Operation::wipe(&device, WipeMethod::Zero).unwrap()).execute(
        &supervisor,
        &tools(),
        |e| {
            if let Event::Progress(s) = e {
                passes.push((s.pass, s.pass_count));
            }
        },
    );

    assert_eq!(outcome, Outcome::Succeeded);
    let wiped = fs::read(&device).unwrap();
    assert_eq!(wiped.len(), 64 * 1024);
    assert!(wiped.iter().all(|&b| b == 0));
    assert!(passes.iter().all(|&p| p == (0, 1)));
}

#[test]
fn failed_flash_reports_tool_output() {
    let (supervisor, _) = fast_supervisor();
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("os.img");
    let device = dir.path().join("device");
    fs::write(&image, vec![3u8; 1024]).unwrap();
    fs::write(&device, b"").unwrap();

    let confirmed = approve(Operation::flash(&image, &device).unwrap());
    fs::remove_file(&image).unwrap();

    match confirmed.execute(&supervisor, &tools(), |_| {}) {
        Outcome::Failed { code, diagnostic } => {
            assert_eq!(code, Some(1));
            assert!(diagnostic.contains("os.img"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn wipe_rereads_device_size_before_later_passes() {
    let (supervisor, _) = fast_supervisor();
    let dir = tempfile::tempdir().unwrap();
    let device = dir.path().join("device");
    let (log, grew) = paths(dir.path(), ["dd.log", "grew"]);
    fs::write(&device, vec![0xFFu8; 4096]).unwrap();

    // The device doubles in size while the first pass runs.
    let dd = stand_in(format!(
        "for a; do case \"$a\" in count=*) echo \"$a\" >> '{log}';; esac; done; \
         if [ ! -e '{grew}' ]; then touch '{grew}'; printf '%04096d' 0 >> '{device}'; fi",
        log = log.display(),
        grew = grew.display(),
        device = device.display(),
    ));
    let tools = tools().with_program("dd", dd);

    let outcome = approve(Operation::wipe(&device, WipeMethod::Random).unwrap())
        .execute(&supervisor, &tools, |_| {});

    assert_eq!(outcome, Outcome::Succeeded);
    assert_eq!(lines(&log), ["count=4096", "count=8192", "count=8192"]);
}

#[test]
fn cancelled_mkfs_still_closes_the_container() {
    let (supervisor, token) = fast_supervisor();
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("part");
    let (log, started) = paths(dir.path(), ["cryptsetup.log", "mkfs-started"]);
    fs::write(&target, b"").unwrap();

    let tools = tools()
        .with_program(
            "cryptsetup",
            stand_in(format!("echo \"$*\" >> '{}'; cat > /dev/null", log.display())),
        )
        .with_program(
            "mkfs.ext4",
            stand_in(format!("touch '{}'; exec sleep 30", started.display())),
        );
    let passphrase = Passphrase::new("secret").unwrap();
    let op = Operation::encrypted_format(&target, Filesystem::Ext4, passphrase).unwrap();

    let canceller = cancel_when_created(&started, token);
    let mut events = Vec::new();
    let outcome = approve(op).execute(&supervisor, &tools, |e| events.push(e));
    canceller.join().unwrap();

    assert_eq!(outcome, Outcome::Cancelled);
    let calls = lines(&log);
    assert_eq!(calls.len(), 3);
    assert!(calls[0].contains("luksFormat"));
    assert!(calls[1].starts_with("open "));
    assert_eq!(calls[2], "close part_crypt");
    assert_eq!(stages(&events).last().map(String::as_str), Some("Closing encrypted container"));
}

#[test]
fn failed_open_skips_filesystem_and_close() {
    let (supervisor, _) = fast_supervisor();
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("part");
    let (log, started) = paths(dir.path(), ["cryptsetup.log", "mkfs-started"]);
    fs::write(&target, b"").unwrap();

    let tools = tools()
        .with_program(
            "cryptsetup",
            stand_in(format!(
                "echo \"$*\" >> '{}'; cat > /dev/null; \
                 if [ \"$1\" = open ]; then echo 'No key available with this passphrase.' >&2; exit 2; fi",
                log.display()
            )),
        )
        .with_program("mkfs.ext4", stand_in(format!("touch '{}'", started.display())));
    let passphrase = Passphrase::new("secret").unwrap();
    let op = Operation::encrypted_format(&target, Filesystem::Ext4, passphrase).unwrap();

    let outcome = approve(op).execute(&supervisor, &tools, |_| {});

    assert_eq!(
        outcome,
        Outcome::Failed {
            code: Some(2),
            diagnostic: "No key available with this passphrase.".into(),
        }
    );
    assert!(lines(&log).iter().all(|call| !call.starts_with("close")));
    assert!(!started.exists());
}

/// losetup stand-in: attaches to `/dev/loop42`, records detaches in `log` and
/// runs `on_detach` afterwards.
fn losetup(log: &Path, on_detach: &str) -> [String; 4] {
    stand_in(format!(
        "case \"$1\" in --find) echo /dev/loop42;; -d) echo \"$*\" >> '{}'; {on_detach};; esac",
        log.display()
    ))
}

#[test]
fn failed_virtual_disk_is_detached_and_removed() {
    let (supervisor, _) = fast_supervisor();
    let dir = tempfile::tempdir().unwrap();
    let (image, log) = paths(dir.path(), ["vdisk.img", "losetup.log"]);

    let tools = tools()
        .with_program("losetup", losetup(&log, "true"))
        .with_program(
            "mkfs.ext4",
            stand_in("echo 'mkfs.ext4: Device size reported to be zero.' >&2; exit 1".into()),
        );
    let op = Operation::virtual_disk(&image, DiskSize::parse("1M").unwrap(), Filesystem::Ext4)
        .unwrap();

    let mut events = Vec::new();
    let outcome = approve(op).execute(&supervisor, &tools, |e| events.push(e));

    assert_eq!(
        outcome,
        Outcome::Failed {
            code: Some(1),
            diagnostic: "mkfs.ext4: Device size reported to be zero.".into(),
        }
    );
    assert_eq!(lines(&log), ["-d /dev/loop42"]);
    assert!(!image.exists());
    assert_eq!(
        stages(&events),
        [
            "Allocating 1M image",
            "Attaching loop device",
            "Creating EXT4 filesystem",
            "Detaching loop device",
        ]
    );
}

#[test]
fn cancelled_virtual_disk_is_detached_and_removed() {
    let (supervisor, token) = fast_supervisor();
    let dir = tempfile::tempdir().unwrap();
    let (image, log) = paths(dir.path(), ["vdisk.img", "losetup.log"]);
    let started = dir.path().join("mkfs-started");

    let tools = tools()
        .with_program("losetup", losetup(&log, "true"))
        .with_program(
            "mkfs.ext4",
            stand_in(format!("touch '{}'; exec sleep 30", started.display())),
        );
    let op = Operation::virtual_disk(&image, DiskSize::parse("1M").unwrap(), Filesystem::Ext4)
        .unwrap();

    let canceller = cancel_when_created(&started, token);
    let outcome = approve(op).execute(&supervisor, &tools, |_| {});
    canceller.join().unwrap();

    assert_eq!(outcome, Outcome::Cancelled);
    assert_eq!(lines(&log), ["-d /dev/loop42"]);
    assert!(!image.exists());
}

#[test]
fn image_still_attached_after_failed_detach_is_kept() {
    let (supervisor, _) = fast_supervisor();
    let dir = tempfile::tempdir().unwrap();
    let (image, log) = paths(dir.path(), ["vdisk.img", "losetup.log"]);

    let busy = "echo 'losetup: /dev/loop42: detach failed: Device or resource busy' >&2; exit 1";
    let tools = tools()
        .with_program("losetup", losetup(&log, busy))
        .with_program("mkfs.ext4", stand_in("exit 0".into()));
    let op = Operation::virtual_disk(&image, DiskSize::parse("1M").unwrap(), Filesystem::Ext4)
        .unwrap();

    match approve(op).execute(&supervisor, &tools, |_| {}) {
        Outcome::Failed { code, diagnostic } => {
            assert_eq!(code, Some(1));
            assert!(diagnostic.contains("Device or resource busy"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(fs::metadata(&image).unwrap().len(), 1 << 20);
}
