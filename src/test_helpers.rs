use std::{
    fs::{File, Permissions},
    io::Write,
    os::{fd::AsRawFd, unix::fs::PermissionsExt},
    process::{Command, Output, Stdio},
    thread::sleep,
    time::Duration,
};

use tempdir::TempDir;

pub fn create_and_run_bin(binary: &[u8]) -> Output {
    create_and_run_bin_with_input(binary, &[])
}

/// Writes `binary` to a temporary executable and runs it with `input` on stdin.
pub fn create_and_run_bin_with_input(binary: &[u8], input: &[u8]) -> Output {
    let dir = TempDir::new("tapeflow").unwrap();

    let elf_path = dir.path().join("elf");
    let mut elf = File::create(elf_path.clone()).unwrap();
    elf.write_all(binary).unwrap();

    elf.set_permissions(Permissions::from_mode(0o755)).unwrap();

    // Avoids ETXTBSY when exec'ing a file this process just wrote
    // See: https://github.com/rust-lang/rust/issues/114554#issue-1838269767
    sleep(Duration::from_micros(2));
    unsafe { libc::flock(elf.as_raw_fd(), libc::LOCK_EX) };

    drop(elf);

    let file = File::open(elf_path.clone()).unwrap();
    unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_SH) };
    drop(file);

    let mut child = Command::new(elf_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    // dropping stdin closes the pipe so reads past `input` see EOF
    child.stdin.take().unwrap().write_all(input).unwrap();

    child.wait_with_output().unwrap()
}
