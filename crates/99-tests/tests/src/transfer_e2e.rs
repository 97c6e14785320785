use filecopy::{
    ErrorCode, FileHeader, Limits, PackError, ResultHeader, StatusReporter, Unpacker,
};
use filecopy_tools::{discard_until_answered, send_files};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::{symlink, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use vchan::{DomainId, MemoryStore, Vchan, VchanContext};

const RECEIVER: DomainId = DomainId(0);
const SENDER: DomainId = DomainId(9);

fn pair(root: &Path) -> (Vchan, Vchan) {
    let store = Arc::new(MemoryStore::new());
    let receiver_ctx = VchanContext::new(RECEIVER, root, store.clone()).unwrap();
    let sender_ctx = VchanContext::new(SENDER, root, store).unwrap();
    let mut receiver = Vchan::server(&receiver_ctx, SENDER, 111).unwrap();
    let sender = Vchan::client(&sender_ctx, RECEIVER, 111).unwrap();
    receiver.wait_connected().unwrap();
    (receiver, sender)
}

/// Receiver side of one session, minus the sandbox.
fn receive(mut chan: Vchan, dest: PathBuf, limits: Limits) -> ErrorCode {
    let mut unpacker = Unpacker::new(&mut chan, dest, limits);
    let code = match unpacker.run() {
        Ok(()) => ErrorCode::Ok,
        Err(err) => err.code(),
    };
    let crc = unpacker.crc();
    drop(unpacker);

    let mut status = StatusReporter::new(&mut chan);
    status.record(code, crc);
    if let Err(err) = status.finish() {
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
    }
    discard_until_answered(&mut chan).unwrap();
    chan.close().unwrap();
    code
}

fn transfer(
    paths: Vec<PathBuf>,
    dest: &Path,
    limits: Limits,
) -> (Result<(), PackError>, ErrorCode) {
    let platform = tempfile::tempdir().unwrap();
    let (receiver, mut sender) = pair(platform.path());

    let dest = dest.to_path_buf();
    let receiving = thread::spawn(move || receive(receiver, dest, limits));
    let sent = send_files(&mut sender, &paths);
    sender.close().unwrap();
    (sent, receiving.join().unwrap())
}

#[test]
fn directory_tree_arrives_intact() {
    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let docs = src.path().join("docs");
    fs::create_dir_all(docs.join("drafts/old")).unwrap();
    let big: Vec<u8> = (0..300_000u32).map(|i| (i * 7 % 251) as u8).collect();
    fs::write(docs.join("drafts/old/big.bin"), &big).unwrap();
    fs::write(docs.join("readme"), b"hello").unwrap();
    fs::write(docs.join("empty"), b"").unwrap();
    symlink("drafts/old/big.bin", docs.join("shortcut")).unwrap();
    let single = src.path().join("notes.txt");
    fs::write(&single, b"standalone").unwrap();

    let (sent, code) = transfer(vec![docs, single], dest.path(), Limits::unlimited());
    sent.unwrap();
    assert_eq!(code, ErrorCode::Ok);

    let out = dest.path().join("docs");
    assert_eq!(fs::read(out.join("drafts/old/big.bin")).unwrap(), big);
    assert_eq!(fs::read(out.join("readme")).unwrap(), b"hello");
    assert_eq!(fs::read(out.join("empty")).unwrap(), b"");
    assert_eq!(
        fs::read_link(out.join("shortcut")).unwrap(),
        Path::new("drafts/old/big.bin")
    );
    assert_eq!(fs::read(dest.path().join("notes.txt")).unwrap(), b"standalone");
}

#[test]
fn byte_quota_is_reported_to_sender() {
    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let file = src.path().join("huge");
    fs::write(&file, vec![1u8; 200_000]).unwrap();

    let limits = Limits {
        max_bytes: 1000,
        max_files: 0,
    };
    let (sent, code) = transfer(vec![file], dest.path(), limits);
    assert_eq!(code, ErrorCode::ByteQuotaExceeded);
    assert!(matches!(sent, Err(PackError::Remote { code: 6 })));
    assert!(!dest.path().join("huge").exists());
}

#[test]
fn file_quota_is_reported_to_sender() {
    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let paths: Vec<PathBuf> = (0..5)
        .map(|i| {
            let path = src.path().join(format!("f{i}"));
            fs::write(&path, b"x").unwrap();
            path
        })
        .collect();

    let limits = Limits {
        max_bytes: 0,
        max_files: 3,
    };
    let (sent, code) = transfer(paths, dest.path(), limits);
    assert_eq!(code, ErrorCode::FileQuotaExceeded);
    assert!(matches!(sent, Err(PackError::Remote { code: 7 })));
    assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 3);
}

/// Writes a hand-made stream and returns the receiver's answer.
fn raw_session(stream: Vec<u8>, dest: &Path) -> (ResultHeader, ErrorCode) {
    let platform = tempfile::tempdir().unwrap();
    let (receiver, mut sender) = pair(platform.path());
    let dest = dest.to_path_buf();
    let receiving = thread::spawn(move || receive(receiver, dest, Limits::unlimited()));

    sender.write_all(&stream).unwrap();
    let mut answer = [0u8; ResultHeader::SIZE];
    sender.read_exact(&mut answer).unwrap();
    sender.close().unwrap();
    (ResultHeader::from_bytes(&answer), receiving.join().unwrap())
}

fn entry(name: &str, mode: u32, body: &[u8]) -> Vec<u8> {
    let mut out = FileHeader {
        namelen: name.len() as u32 + 1,
        mode,
        filelen: body.len() as u64,
        ..FileHeader::default()
    }
    .to_bytes()
    .to_vec();
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    out.extend_from_slice(body);
    out
}

#[test]
fn traversal_attempt_is_refused_with_matching_checksum() {
    let outer = tempfile::tempdir().unwrap();
    let dest = outer.path().join("inbox");
    fs::create_dir(&dest).unwrap();

    let mut stream = entry("../../etc/passwd", 0o100_644, b"root::0:0::/:/bin/sh\n");
    stream.extend_from_slice(&FileHeader::terminator().to_bytes());

    let (answer, code) = raw_session(stream.clone(), &dest);
    assert_eq!(code, ErrorCode::InvalidPath);
    assert_eq!(answer.error_code, ErrorCode::InvalidPath.as_u32());
    // Only the header and the name were consumed before the fault.
    let consumed = FileHeader::SIZE + "../../etc/passwd".len() + 1;
    assert_eq!(answer.crc32, crc32fast::hash(&stream[..consumed]));
    assert_eq!(fs::read_dir(&dest).unwrap().count(), 0);
    assert_eq!(fs::read_dir(outer.path()).unwrap().count(), 1);
}

#[test]
fn sender_stopping_between_entries_is_legal_eof() {
    let dest = tempfile::tempdir().unwrap();
    let platform = tempfile::tempdir().unwrap();
    let (receiver, mut sender) = pair(platform.path());
    let dest_path = dest.path().to_path_buf();
    let receiving = thread::spawn(move || receive(receiver, dest_path, Limits::unlimited()));

    sender.write_all(&entry("kept", 0o100_600, b"data")).unwrap();
    sender.close().unwrap();
    assert_eq!(receiving.join().unwrap(), ErrorCode::LegalEof);

    let meta = fs::metadata(dest.path().join("kept")).unwrap();
    assert_eq!(meta.mode() & 0o777, 0o600);
}

#[test]
fn sender_vanishing_mid_body_is_unexpected_eof() {
    let dest = tempfile::tempdir().unwrap();
    let platform = tempfile::tempdir().unwrap();
    let (receiver, mut sender) = pair(platform.path());
    let dest_path = dest.path().to_path_buf();
    let receiving = thread::spawn(move || receive(receiver, dest_path, Limits::unlimited()));

    let stream = entry("partial", 0o100_644, &[3u8; 5000]);
    sender.write_all(&stream[..2000]).unwrap();
    drop(sender);
    assert_eq!(receiving.join().unwrap(), ErrorCode::UnexpectedEof);
}
