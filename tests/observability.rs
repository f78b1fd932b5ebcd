#![cfg(unix)]
//! Tracing events emitted while binaries are prepared.

use camino::{Utf8Path, Utf8PathBuf};
use pg_embed_prepared::binaries::{ArchiveFileResolver, prepare_binaries};
use tracing::Level;
use xz2::write::XzEncoder;

#[path = "support/logging.rs"]
mod logging;

use logging::capture_logs;

fn utf8_tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 tempdir");
    (dir, path)
}

fn write_archive(path: &Utf8Path) {
    let mut builder = tar::Builder::new(XzEncoder::new(Vec::new(), 1));
    let mut header = tar::Header::new_gnu();
    let contents = b"#!/bin/sh\nexit 0\n";
    header.set_size(contents.len() as u64);
    header.set_mode(0o755);
    builder
        .append_data(&mut header, "bin/initdb", contents.as_slice())
        .expect("append file");
    let bytes = builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish xz");
    std::fs::write(path, bytes).expect("write archive");
}

#[test]
fn preparing_binaries_logs_under_the_binaries_target() {
    let (_guard, root) = utf8_tempdir();
    let archive = root.join("postgres-test.txz");
    write_archive(&archive);
    let resolver = ArchiveFileResolver::new(archive);
    let working_dir = root.join("work");

    let (logs, prepared) = capture_logs(Level::INFO, || prepare_binaries(&resolver, &working_dir));

    let pg_dir = prepared.expect("prepare binaries");
    assert!(pg_dir.join("bin/initdb").is_file());
    let binaries: Vec<&String> = logs
        .iter()
        .filter(|line| line.contains("pg_embed::binaries"))
        .collect();
    assert!(
        binaries.iter().any(|line| line.contains("detected host platform")),
        "missing platform event in {logs:#?}"
    );
    assert!(
        binaries.iter().any(|line| line.contains("postgres binaries ready")),
        "missing readiness event in {logs:#?}"
    );
}
