//! `RsyncExecutor` against stand-in `rsync` scripts.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nas_wake_sync::config::{Credential, SyncConfig};
use nas_wake_sync::nas::{RsyncExecutor, SyncExecutor, SyncOutcome};
use tempfile::TempDir;

/// Write an executable shell script standing in for rsync.
fn fake_tool(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-rsync");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn executor(tool: &Path) -> RsyncExecutor {
    executor_with_key(tool, None)
}

fn executor_with_key(tool: &Path, key_path: Option<PathBuf>) -> RsyncExecutor {
    let sync = SyncConfig {
        source: PathBuf::from("/unused"),
        destination: "/volume1/backup".into(),
        raw_options: "-a".into(),
        options: vec!["-a".into()],
        tool: tool.display().to_string(),
        partial_exit_codes: vec![23, 24],
    };
    let credential = Credential {
        user: "admin".into(),
        port: 2222,
        key_path,
    };
    RsyncExecutor::new(&sync, credential)
}

fn source_dir(tmp: &TempDir) -> PathBuf {
    let source = tmp.path().join("dump");
    fs::create_dir(&source).unwrap();
    fs::write(source.join("vzdump-qemu-100.vma.zst"), vec![0u8; 2048]).unwrap();
    source
}

#[test]
fn test_exit_zero_is_success_with_stats() {
    let tmp = TempDir::new().unwrap();
    let source = source_dir(&tmp);
    let tool = fake_tool(
        tmp.path(),
        r#"echo 'Number of regular files transferred: 1'
echo 'Total transferred file size: 2,048 bytes'
exit 0"#,
    );

    let outcome =
        executor(&tool).run_sync(&["-a".into()], &source, "admin@nas:/volume1/backup");

    match outcome {
        SyncOutcome::Success(report) => {
            assert_eq!(report.exit_code, Some(0));
            assert_eq!(report.files_transferred, Some(1));
            assert_eq!(report.bytes_transferred, Some(2048));
            assert_eq!(report.source_bytes, Some(2048));
        }
        other => panic!("expected success, got {other:?}"),
    }
}

#[test]
fn test_arguments_and_remote_shell_reach_tool() {
    let tmp = TempDir::new().unwrap();
    let source = source_dir(&tmp);
    let args_file = tmp.path().join("args");
    let tool = fake_tool(
        tmp.path(),
        &format!(
            "printf '%s\\n' \"$@\" \"$RSYNC_RSH\" > '{}'\nexit 0",
            args_file.display()
        ),
    );

    let options = vec!["-avh".to_string(), "--exclude".to_string(), "tmp dir".to_string()];
    executor(&tool).run_sync(&options, &source, "admin@nas:/volume1/backup");

    let recorded = fs::read_to_string(&args_file).unwrap();
    let lines: Vec<&str> = recorded.lines().collect();
    assert_eq!(
        lines,
        vec![
            "-avh",
            "--exclude",
            "tmp dir",
            &format!("{}/", source.display()),
            "admin@nas:/volume1/backup/",
            "ssh -p 2222",
        ]
    );
}

#[test]
fn test_partial_exit_codes_are_partial_failure() {
    let tmp = TempDir::new().unwrap();
    let source = source_dir(&tmp);
    let tool = fake_tool(
        tmp.path(),
        "echo 'file has vanished: \"/dump/old.log\"' >&2\nexit 24",
    );

    let outcome = executor(&tool).run_sync(&[], &source, "admin@nas:/volume1/backup");

    match outcome {
        SyncOutcome::PartialFailure { report, detail } => {
            assert_eq!(report.exit_code, Some(24));
            assert!(detail.contains("file has vanished"), "{detail}");
        }
        other => panic!("expected partial failure, got {other:?}"),
    }
}

#[test]
fn test_other_exit_codes_are_hard_failure_with_stderr() {
    let tmp = TempDir::new().unwrap();
    let source = source_dir(&tmp);
    let tool = fake_tool(
        tmp.path(),
        r#"echo 'rsync: connection unexpectedly closed (0 bytes received so far)' >&2
exit 12"#,
    );

    let outcome = executor(&tool).run_sync(&[], &source, "admin@nas:/volume1/backup");

    match outcome {
        SyncOutcome::HardFailure { report, detail } => {
            assert_eq!(report.exit_code, Some(12));
            assert!(detail.contains("return code: 12"), "{detail}");
            assert!(detail.contains("connection unexpectedly closed"), "{detail}");
        }
        other => panic!("expected hard failure, got {other:?}"),
    }
}

#[test]
fn test_large_stderr_is_truncated() {
    let tmp = TempDir::new().unwrap();
    let source = source_dir(&tmp);
    let tool = fake_tool(
        tmp.path(),
        r#"i=0
while [ $i -lt 2000 ]; do
    echo "rsync: send_files failed to open file $i" >&2
    i=$((i+1))
done
echo 'last line' >&2
exit 23"#,
    );

    let outcome = executor(&tool).run_sync(&[], &source, "admin@nas:/volume1/backup");

    let detail = outcome.detail().unwrap();
    assert!(detail.len() < 8 * 1024, "detail was {} bytes", detail.len());
    assert!(detail.ends_with("last line"), "{detail}");
}

#[test]
fn test_non_utf8_output_does_not_cut_transfer_short() {
    let tmp = TempDir::new().unwrap();
    let source = source_dir(&tmp);
    let tool = fake_tool(
        tmp.path(),
        r#"printf 'caf\351.vma\n'
i=0
while [ $i -lt 20000 ]; do
    echo "vzdump-qemu-$i.vma.zst"
    i=$((i+1))
done
echo 'Number of regular files transferred: 20001'
exit 0"#,
    );

    let outcome = executor(&tool).run_sync(&[], &source, "admin@nas:/volume1/backup");

    match outcome {
        SyncOutcome::Success(report) => {
            assert_eq!(report.exit_code, Some(0));
            assert_eq!(report.files_transferred, Some(20001));
        }
        other => panic!("expected success, got {other:?}"),
    }
}

#[test]
fn test_key_path_with_space_survives_remote_shell_split() {
    let tmp = TempDir::new().unwrap();
    let source = source_dir(&tmp);
    let rsh_file = tmp.path().join("rsh");
    let tool = fake_tool(
        tmp.path(),
        &format!("printf '%s' \"$RSYNC_RSH\" > '{}'\nexit 0", rsh_file.display()),
    );
    let key = PathBuf::from("/root/nas keys/id_ed25519");

    executor_with_key(&tool, Some(key)).run_sync(&[], &source, "admin@nas:/volume1/backup");

    let rsh = fs::read_to_string(&rsh_file).unwrap();
    assert_eq!(
        shell_words::split(&rsh).unwrap(),
        ["ssh", "-i", "/root/nas keys/id_ed25519", "-p", "2222"]
    );
}
