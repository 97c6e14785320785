use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::io::{Read, Write};
use std::thread;
use vchan::{ConnectionState, DomainId, Role, Vchan, VchanContext};

const SERVER: DomainId = DomainId(0);
const CLIENT: DomainId = DomainId(12);

/// Both ends on one directory-backed platform, as separate processes would be.
fn pair(root: &std::path::Path, port: u32) -> (Vchan, Vchan) {
    let server_ctx = VchanContext::with_dir_store(SERVER, root).unwrap();
    let client_ctx = VchanContext::with_dir_store(CLIENT, root).unwrap();
    let mut server = Vchan::server(&server_ctx, CLIENT, port).unwrap();
    let client = Vchan::client(&client_ctx, SERVER, port).unwrap();
    server.wait_connected().unwrap();
    (server, client)
}

fn stream_through(total: usize, seed: u64) {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, mut client) = pair(dir.path(), 3);
    assert_eq!(server.role(), Role::Server);
    assert_eq!(client.role(), Role::Client);

    let mut payload = vec![0u8; total];
    StdRng::seed_from_u64(seed).fill_bytes(&mut payload);
    let expected = payload.clone();

    let writer = thread::spawn(move || {
        let mut rng = StdRng::seed_from_u64(seed ^ 0xff);
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + rng.gen_range(1..3000)).min(payload.len());
            client.write_all(&payload[offset..end]).unwrap();
            offset = end;
        }
        client.close().unwrap();
        client.state()
    });

    let mut received = Vec::with_capacity(total);
    server.read_to_end(&mut received).unwrap();
    assert!(server.is_eof());
    server.close().unwrap();

    assert_eq!(writer.join().unwrap(), ConnectionState::Closed);
    assert_eq!(received.len(), expected.len());
    assert!(received == expected, "stream corrupted");
}

#[test]
fn client_stream_survives_random_chunking() {
    stream_through(2 << 20, 21);
}

#[test]
fn independent_channels_do_not_interfere() {
    let dir = tempfile::tempdir().unwrap();
    let (mut a_server, mut a_client) = pair(dir.path(), 1);
    let (mut b_server, mut b_client) = pair(dir.path(), 2);

    a_client.write_all(b"first").unwrap();
    b_client.write_all(b"second").unwrap();

    let mut a = [0u8; 5];
    let mut b = [0u8; 6];
    b_server.read_exact(&mut b).unwrap();
    a_server.read_exact(&mut a).unwrap();
    assert_eq!(&a, b"first");
    assert_eq!(&b, b"second");
    assert_eq!(a_server.data_ready() + b_server.data_ready(), 0);
}

#[test]
#[ignore]
fn slow_stream_sixty_four_megabytes() {
    stream_through(64 << 20, 64);
}
