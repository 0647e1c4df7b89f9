use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::tempdir;

const MASTER: &str = "Correct-Horse-9!";
const DECOY: &str = "Battery-Staple-7!";
const PANIC: &str = "Burn-It-Down-3!";

fn bin() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("duressvault"))
}

fn with_dir(dir: &Path) -> Command {
    let mut cmd = bin();
    cmd.env_remove("DURESSVAULT_PASSWORD").arg("--dir").arg(dir);
    cmd
}

fn init(dir: &Path) {
    with_dir(dir)
        .args(["init", "--argon-mem", "1024", "--argon-time", "1"])
        .write_stdin(format!(
            "{MASTER}\n{MASTER}\n{DECOY}\n{DECOY}\n{PANIC}\n{PANIC}\n"
        ))
        .assert()
        .success()
        .stdout(predicate::str::contains("vault initialized"));
}

fn put(dir: &Path, password: &str, name: &str, content: &[u8]) -> String {
    let file = dir.parent().unwrap().join(format!("{name}.src"));
    std::fs::write(&file, content).unwrap();

    let output = with_dir(dir)
        .env("DURESSVAULT_PASSWORD", password)
        .arg("put")
        .arg(name)
        .arg(&file)
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    stdout.trim().rsplit(' ').next().unwrap().to_string()
}

#[test]
fn init_creates_vault_files() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path().join("vault");

    init(&dir);

    assert!(dir.join("auth.json").exists());
    assert!(dir.join("keys.json").exists());
    assert!(dir.join("metadata.dvb").exists());
}

#[test]
fn init_twice_fails() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path().join("vault");
    init(&dir);

    with_dir(&dir)
        .args(["init", "--argon-mem", "1024", "--argon-time", "1"])
        .write_stdin(format!(
            "{MASTER}\n{MASTER}\n{DECOY}\n{DECOY}\n{PANIC}\n{PANIC}\n"
        ))
        .assert()
        .failure()
        .stderr(predicate::str::contains("already initialized"));
}

#[test]
fn init_rejects_reused_password() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path().join("vault");

    with_dir(&dir)
        .args(["init", "--argon-mem", "1024", "--argon-time", "1"])
        .write_stdin(format!(
            "{MASTER}\n{MASTER}\n{MASTER}\n{MASTER}\n{PANIC}\n{PANIC}\n"
        ))
        .assert()
        .failure()
        .stderr(predicate::str::contains("master=decoy"));

    assert!(!dir.join("keys.json").exists());
}

#[test]
fn init_rejects_mismatched_confirmation() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path().join("vault");

    with_dir(&dir)
        .args(["init", "--argon-mem", "1024", "--argon-time", "1"])
        .write_stdin(format!("{MASTER}\nsomething-else\n"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("do not match"));
}

#[test]
fn put_and_get_roundtrip() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path().join("vault");
    init(&dir);

    let id = put(&dir, MASTER, "notes.txt", b"hello");

    with_dir(&dir)
        .env("DURESSVAULT_PASSWORD", MASTER)
        .arg("get")
        .arg(&id)
        .assert()
        .success()
        .stdout(predicate::eq("hello"));

    let out = tmp.path().join("restored.txt");
    with_dir(&dir)
        .env("DURESSVAULT_PASSWORD", MASTER)
        .arg("get")
        .arg(&id)
        .arg("--out")
        .arg(&out)
        .assert()
        .success();
    assert_eq!(std::fs::read(out).unwrap(), b"hello");
}

#[test]
fn password_from_stdin() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path().join("vault");
    init(&dir);
    put(&dir, MASTER, "notes.txt", b"hello");

    with_dir(&dir)
        .arg("list")
        .write_stdin(format!("{MASTER}\n"))
        .assert()
        .success()
        .stdout(predicate::str::contains("notes.txt"));
}

#[test]
fn duplicate_name_fails() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path().join("vault");
    init(&dir);
    put(&dir, MASTER, "notes.txt", b"one");

    let file = tmp.path().join("again.txt");
    std::fs::write(&file, b"two").unwrap();
    with_dir(&dir)
        .env("DURESSVAULT_PASSWORD", MASTER)
        .arg("put")
        .arg("notes.txt")
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn wrong_password_fails() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path().join("vault");
    init(&dir);

    with_dir(&dir)
        .env("DURESSVAULT_PASSWORD", "Correct-Horse-8!")
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid credential"));

    with_dir(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("attempts remaining: 4"));
}

#[test]
fn decoy_password_shows_decoy_files() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path().join("vault");
    init(&dir);
    put(&dir, MASTER, "notes.txt", b"hello");

    with_dir(&dir)
        .env("DURESSVAULT_PASSWORD", DECOY)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("Quarterly_Budget.csv"))
        .stdout(predicate::str::contains("notes.txt").not());
}

#[test]
fn panic_password_looks_like_typo_and_destroys_vault() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path().join("vault");
    init(&dir);
    put(&dir, MASTER, "notes.txt", b"hello");

    with_dir(&dir)
        .env("DURESSVAULT_PASSWORD", PANIC)
        .arg("list")
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("invalid credential"));

    assert!(!dir.join("keys.json").exists());
    assert!(!dir.join("blobs").exists());

    with_dir(&dir)
        .env("DURESSVAULT_PASSWORD", MASTER)
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not initialized"));
}

#[test]
fn rename_tag_and_remove() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path().join("vault");
    init(&dir);
    let id = put(&dir, MASTER, "draft.txt", b"text");

    with_dir(&dir)
        .env("DURESSVAULT_PASSWORD", MASTER)
        .args(["mv", &id, "final.txt"])
        .assert()
        .success();
    with_dir(&dir)
        .env("DURESSVAULT_PASSWORD", MASTER)
        .args(["tag", &id, "work", "2024"])
        .assert()
        .success();
    with_dir(&dir)
        .env("DURESSVAULT_PASSWORD", MASTER)
        .args(["list", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("final.txt"))
        .stdout(predicate::str::contains("work,2024"));

    with_dir(&dir)
        .env("DURESSVAULT_PASSWORD", MASTER)
        .args(["rm", &id])
        .assert()
        .success();
    with_dir(&dir)
        .env("DURESSVAULT_PASSWORD", MASTER)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No files stored."));
}

#[test]
fn passwd_changes_master_password() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path().join("vault");
    init(&dir);
    put(&dir, MASTER, "notes.txt", b"hello");

    let new = "Fresh-Master-77";
    with_dir(&dir)
        .env("DURESSVAULT_PASSWORD", MASTER)
        .args(["passwd", "master"])
        .write_stdin(format!("{new}\n{new}\n"))
        .assert()
        .success()
        .stdout(predicate::str::contains("master password changed"));

    with_dir(&dir)
        .env("DURESSVAULT_PASSWORD", new)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("notes.txt"));
    with_dir(&dir)
        .env("DURESSVAULT_PASSWORD", MASTER)
        .arg("list")
        .assert()
        .failure();
}

#[test]
fn export_and_import_backup() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path().join("vault");
    let backup = tmp.path().join("backup.dvb");
    init(&dir);
    let id = put(&dir, MASTER, "notes.txt", b"hello");

    with_dir(&dir)
        .env("DURESSVAULT_PASSWORD", MASTER)
        .arg("export")
        .arg(&backup)
        .assert()
        .success()
        .stdout(predicate::str::contains("exported 1 file(s)"));
    with_dir(&dir)
        .env("DURESSVAULT_PASSWORD", MASTER)
        .args(["rm", &id])
        .assert()
        .success();

    with_dir(&dir)
        .env("DURESSVAULT_PASSWORD", MASTER)
        .arg("import")
        .arg(&backup)
        .assert()
        .success()
        .stdout(predicate::str::contains("imported 1 file(s), skipped 0"));
    with_dir(&dir)
        .env("DURESSVAULT_PASSWORD", MASTER)
        .arg("get")
        .arg(&id)
        .assert()
        .success()
        .stdout(predicate::eq("hello"));
}

#[test]
fn status_without_vault() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path().join("missing");

    with_dir(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("no vault"));
}
