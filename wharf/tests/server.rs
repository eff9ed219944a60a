//! Whole-daemon tests: a real `Daemon` served over in-memory duplex
//! streams, driven both by the `wharf-nbd` client and by hand-rolled
//! frames where the exact bytes matter.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use wharf::{Backing, ChannelListener, Config, Daemon, ExportConfig, NbdConfig, SECTOR_SIZE};
use wharf_nbd::{
    Command, NBD_CLIENT_MAGIC, NBD_EINVAL, NBD_EPERM, NBD_FLAG_C_FIXED_NEWSTYLE,
    NBD_FLAG_READ_ONLY, NBD_OPT_EXPORT_NAME, NBD_OPT_LIST, NBD_REP_ACK, NBD_REP_ERR_UNSUP,
    NBD_REP_SERVER, NBD_SUCCESS, NbdClient, NbdError, OptionHeader, OptionReply, Reply, Request,
};

fn memory_export(name: &str, size: u64) -> ExportConfig {
    ExportConfig {
        name: name.to_string(),
        backing: Backing::Memory(size),
        read_only: false,
        dev_offset: 0,
        size_bytes: None,
    }
}

async fn start_daemon(exports: Vec<ExportConfig>) -> (Arc<Daemon>, mpsc::Sender<DuplexStream>) {
    let config = Config {
        exports,
        ..Default::default()
    };
    let daemon = Arc::new(Daemon::from_config(config).await.unwrap());
    let (tx, listener) = ChannelListener::new(4);
    tokio::spawn({
        let daemon = Arc::clone(&daemon);
        async move {
            let _ = daemon.listen(listener).await;
        }
    });
    (daemon, tx)
}

async fn connect_stream(tx: &mpsc::Sender<DuplexStream>) -> DuplexStream {
    let (client, server) = duplex(1 << 20);
    tx.send(server).await.unwrap();
    client
}

/// Read the greeting and answer with fixed-newstyle client flags.
async fn client_hello(stream: &mut DuplexStream) {
    let mut greeting = [0u8; 18];
    stream.read_exact(&mut greeting).await.unwrap();
    assert_eq!(&greeting[0..8], b"NBDMAGIC");
    assert_eq!(&greeting[8..16], b"IHAVEOPT");
    stream
        .write_all(&NBD_FLAG_C_FIXED_NEWSTYLE.to_be_bytes())
        .await
        .unwrap();
}

/// Send `NBD_OPT_EXPORT_NAME` and return (size, transmission flags).
async fn select_export(stream: &mut DuplexStream, name: &str) -> (u64, u16) {
    let header = OptionHeader {
        option: NBD_OPT_EXPORT_NAME,
        length: name.len() as u32,
    };
    stream.write_all(&header.to_bytes()).await.unwrap();
    stream.write_all(name.as_bytes()).await.unwrap();

    let mut block = [0u8; 134];
    stream.read_exact(&mut block).await.unwrap();
    let size = u64::from_be_bytes(block[0..8].try_into().unwrap());
    let flags = u16::from_be_bytes(block[8..10].try_into().unwrap());
    assert!(block[10..].iter().all(|&b| b == 0));
    (size, flags)
}

async fn read_reply(stream: &mut DuplexStream) -> Reply {
    let mut header = [0u8; Reply::SIZE_BYTES];
    stream.read_exact(&mut header).await.unwrap();
    Reply::from_bytes(&header).unwrap()
}

async fn read_option_reply(stream: &mut DuplexStream) -> (OptionReply, Vec<u8>) {
    let mut header = [0u8; OptionReply::SIZE_BYTES];
    stream.read_exact(&mut header).await.unwrap();
    let reply = OptionReply::from_bytes(&header).unwrap();
    let mut data = vec![0u8; reply.length as usize];
    stream.read_exact(&mut data).await.unwrap();
    (reply, data)
}

/// The peer should close without sending anything further.
async fn expect_eof(stream: &mut DuplexStream) {
    let mut byte = [0u8; 1];
    let n = timeout(Duration::from_secs(5), stream.read(&mut byte))
        .await
        .expect("peer did not close")
        .unwrap_or(0);
    assert_eq!(n, 0, "expected EOF, got data");
}

#[tokio::test]
async fn list_enumerates_exports_in_insertion_order() {
    let (_daemon, tx) = start_daemon(vec![
        memory_export("a", 1 << 20),
        memory_export("b", 1 << 20),
    ])
    .await;
    let mut stream = connect_stream(&tx).await;

    client_hello(&mut stream).await;
    let header = OptionHeader {
        option: NBD_OPT_LIST,
        length: 0,
    };
    stream.write_all(&header.to_bytes()).await.unwrap();

    let (reply, data) = read_option_reply(&mut stream).await;
    assert_eq!(reply.option, NBD_OPT_LIST);
    assert_eq!(reply.reply_type, NBD_REP_SERVER);
    assert_eq!(reply.length, 5);
    assert_eq!(&data[0..4], &1u32.to_be_bytes());
    assert_eq!(&data[4..], b"a");

    let (reply, data) = read_option_reply(&mut stream).await;
    assert_eq!(reply.reply_type, NBD_REP_SERVER);
    assert_eq!(&data[4..], b"b");

    let (reply, data) = read_option_reply(&mut stream).await;
    assert_eq!(reply.reply_type, NBD_REP_ACK);
    assert!(data.is_empty());
}

#[tokio::test]
async fn list_sees_newly_bound_exports() {
    let (daemon, tx) = start_daemon(vec![memory_export("a", 1 << 20)]).await;

    let names = NbdClient::list(connect_stream(&tx).await).await.unwrap();
    assert_eq!(names, ["a"]);

    daemon
        .export_add(&memory_export("b", 1 << 20))
        .await
        .unwrap();

    let names = NbdClient::list(connect_stream(&tx).await).await.unwrap();
    assert_eq!(names, ["a", "b"]);
}

#[tokio::test]
async fn unknown_option_is_echoed_in_err_unsup_and_closes() {
    let (_daemon, tx) = start_daemon(vec![memory_export("a", 1 << 20)]).await;
    let mut stream = connect_stream(&tx).await;

    client_hello(&mut stream).await;
    let header = OptionHeader {
        option: 0xDEAD,
        length: 0,
    };
    stream.write_all(&header.to_bytes()).await.unwrap();

    let (reply, data) = read_option_reply(&mut stream).await;
    assert_eq!(reply.option, 0xDEAD);
    assert_eq!(reply.reply_type, NBD_REP_ERR_UNSUP);
    assert!(data.is_empty());

    expect_eof(&mut stream).await;
}

#[tokio::test]
async fn write_then_read_roundtrip() {
    let (_daemon, tx) = start_daemon(vec![memory_export("disk", 1 << 20)]).await;
    let mut client = NbdClient::connect(connect_stream(&tx).await, "disk")
        .await
        .unwrap();

    assert_eq!(client.size_bytes, 1 << 20);
    assert_eq!(client.transmission_flags, 0x2D);

    let pattern: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    client.write(0x800, &pattern).await.unwrap();
    let data = client.read(0x800, 4096).await.unwrap();
    assert_eq!(data.as_ref(), pattern.as_slice());

    // Flush twice with nothing in between; both must succeed.
    client.flush().await.unwrap();
    client.flush().await.unwrap();

    client.write_fua(0, &[0x55u8; 512]).await.unwrap();
    let data = client.read(0, 512).await.unwrap();
    assert!(data.iter().all(|&b| b == 0x55));

    client.trim(0, 512).await.unwrap();
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn out_of_range_read_replies_einval_and_keeps_connection() {
    let (_daemon, tx) = start_daemon(vec![memory_export("tiny", 0x1000)]).await;
    let mut client = NbdClient::connect(connect_stream(&tx).await, "tiny")
        .await
        .unwrap();

    let err = client.read(0x800, 0x1000).await.unwrap_err();
    assert!(matches!(
        err,
        NbdError::ServerError { code: NBD_EINVAL }
    ));

    // Still connected and serving.
    let data = client.read(0, 512).await.unwrap();
    assert_eq!(data.len(), 512);
}

#[tokio::test]
async fn read_only_write_consumes_payload_and_replies_eperm() {
    let mut spec = memory_export("ro", 1 << 20);
    spec.read_only = true;
    let (_daemon, tx) = start_daemon(vec![spec]).await;
    let mut stream = connect_stream(&tx).await;

    client_hello(&mut stream).await;
    let (size, flags) = select_export(&mut stream, "ro").await;
    assert_eq!(size, 1 << 20);
    assert_eq!(flags, 0x2D | NBD_FLAG_READ_ONLY);

    let request = Request::new(Command::Write, 0x7, 0, 0x200);
    stream.write_all(&request.to_bytes()).await.unwrap();
    stream.write_all(&[0xABu8; 0x200]).await.unwrap();

    let reply = read_reply(&mut stream).await;
    assert_eq!(reply.handle, 0x7);
    assert_eq!(reply.error, NBD_EPERM);

    // Payload was consumed: the stream is still framed and reads work.
    let request = Request::new(Command::Read, 0x8, 0, 0x200);
    stream.write_all(&request.to_bytes()).await.unwrap();
    let reply = read_reply(&mut stream).await;
    assert_eq!(reply.handle, 0x8);
    assert_eq!(reply.error, NBD_SUCCESS);
    let mut payload = vec![0u8; 0x200];
    stream.read_exact(&mut payload).await.unwrap();
    assert!(payload.iter().all(|&b| b == 0));
}

#[tokio::test]
async fn zero_length_read_succeeds_with_empty_payload() {
    let (_daemon, tx) = start_daemon(vec![memory_export("disk", 1 << 20)]).await;
    let mut stream = connect_stream(&tx).await;

    client_hello(&mut stream).await;
    select_export(&mut stream, "disk").await;

    let request = Request::new(Command::Read, 0x10, 0, 0);
    stream.write_all(&request.to_bytes()).await.unwrap();
    let reply = read_reply(&mut stream).await;
    assert_eq!(reply.handle, 0x10);
    assert_eq!(reply.error, NBD_SUCCESS);

    // No payload followed: the next reply lines up with the next header.
    let request = Request::new(Command::Read, 0x11, 0, 512);
    stream.write_all(&request.to_bytes()).await.unwrap();
    let reply = read_reply(&mut stream).await;
    assert_eq!(reply.handle, 0x11);
    assert_eq!(reply.error, NBD_SUCCESS);
    let mut payload = vec![0u8; 512];
    stream.read_exact(&mut payload).await.unwrap();
}

#[tokio::test]
async fn offset_length_overflow_closes_connection() {
    let (_daemon, tx) = start_daemon(vec![memory_export("disk", 1 << 20)]).await;
    let mut stream = connect_stream(&tx).await;

    client_hello(&mut stream).await;
    select_export(&mut stream, "disk").await;

    let request = Request::new(Command::Read, 0x20, u64::MAX - 10, 0x1000);
    stream.write_all(&request.to_bytes()).await.unwrap();

    expect_eof(&mut stream).await;
}

#[tokio::test]
async fn unknown_command_gets_framed_einval() {
    let (_daemon, tx) = start_daemon(vec![memory_export("disk", 1 << 20)]).await;
    let mut stream = connect_stream(&tx).await;

    client_hello(&mut stream).await;
    select_export(&mut stream, "disk").await;

    let mut raw = Request::new(Command::Read, 0x30, 0, 0).to_bytes();
    raw[6..8].copy_from_slice(&9u16.to_be_bytes());
    stream.write_all(&raw).await.unwrap();

    let reply = read_reply(&mut stream).await;
    assert_eq!(reply.handle, 0x30);
    assert_eq!(reply.error, NBD_EINVAL);

    // Connection survives the unknown command.
    let request = Request::new(Command::Flush, 0x31, 0, 0);
    stream.write_all(&request.to_bytes()).await.unwrap();
    let reply = read_reply(&mut stream).await;
    assert_eq!(reply.handle, 0x31);
    assert_eq!(reply.error, NBD_SUCCESS);
}

#[tokio::test]
async fn disconnect_closes_without_reply_and_detaches() {
    let (daemon, tx) = start_daemon(vec![memory_export("disk", 1 << 20)]).await;
    let export = daemon.registry().find("disk").unwrap();

    let mut stream = connect_stream(&tx).await;
    client_hello(&mut stream).await;
    select_export(&mut stream, "disk").await;

    timeout(Duration::from_secs(5), async {
        while export.client_count() != 1 {
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("client never attached");

    let request = Request::new(Command::Disconnect, 0x40, 0, 0);
    stream.write_all(&request.to_bytes()).await.unwrap();
    expect_eof(&mut stream).await;

    // Teardown drains: the client detaches and a new connection works.
    timeout(Duration::from_secs(5), async {
        while export.client_count() != 0 {
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("client never detached");

    let mut client = NbdClient::connect(connect_stream(&tx).await, "disk")
        .await
        .unwrap();
    client.flush().await.unwrap();
}

#[tokio::test]
async fn export_name_accepts_255_bytes_and_rejects_256() {
    let long_name = "n".repeat(255);
    let (_daemon, tx) = start_daemon(vec![memory_export(&long_name, 1 << 20)]).await;

    let mut stream = connect_stream(&tx).await;
    client_hello(&mut stream).await;
    let (size, _flags) = select_export(&mut stream, &long_name).await;
    assert_eq!(size, 1 << 20);
    drop(stream);

    // A 256-byte name is a protocol violation; the server just hangs up.
    let mut stream = connect_stream(&tx).await;
    client_hello(&mut stream).await;
    let header = OptionHeader {
        option: NBD_OPT_EXPORT_NAME,
        length: 256,
    };
    stream.write_all(&header.to_bytes()).await.unwrap();
    stream.write_all(&[b'n'; 256]).await.unwrap();
    expect_eof(&mut stream).await;
}

#[tokio::test]
async fn remove_export_disconnects_attached_clients() {
    let (daemon, tx) = start_daemon(vec![memory_export("disk", 1 << 20)]).await;
    let mut client = NbdClient::connect(connect_stream(&tx).await, "disk")
        .await
        .unwrap();
    client.flush().await.unwrap();

    daemon.export_remove("disk").unwrap();

    // The connection dies; depending on timing the failure is an EOF on
    // the reply read or a broken pipe on the request write.
    let result = timeout(Duration::from_secs(5), client.read(0, 512)).await;
    assert!(matches!(result, Ok(Err(_))));
}

#[tokio::test]
async fn random_write_read_sweep_matches_oracle() {
    const SIZE: u64 = 1 << 20;
    let (_daemon, tx) = start_daemon(vec![memory_export("disk", SIZE)]).await;
    let mut client = NbdClient::connect(connect_stream(&tx).await, "disk")
        .await
        .unwrap();

    let mut rng = SmallRng::seed_from_u64(7);
    let mut oracle = vec![0u8; SIZE as usize];
    let total_sectors = SIZE / SECTOR_SIZE as u64;

    for _ in 0..200 {
        let nsectors = rng.random_range(1..=16u64);
        let sector = rng.random_range(0..total_sectors - nsectors);
        let offset = sector * SECTOR_SIZE as u64;
        let len = (nsectors * SECTOR_SIZE as u64) as usize;

        match rng.random_range(0..10u32) {
            0..6 => {
                let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
                oracle[offset as usize..offset as usize + len].copy_from_slice(&data);
                client.write(offset, &data).await.unwrap();
            }
            6..9 => {
                let data = client.read(offset, len as u32).await.unwrap();
                assert_eq!(
                    data.as_ref(),
                    &oracle[offset as usize..offset as usize + len],
                    "mismatch at offset {offset}"
                );
            }
            _ => client.flush().await.unwrap(),
        }
    }

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn daemon_with_default_export_speaks_oldstyle() {
    let config = Config {
        nbd: NbdConfig {
            default_export: Some("disk".to_string()),
            ..Default::default()
        },
        exports: vec![memory_export("disk", 0x100000)],
        ..Default::default()
    };
    let daemon = Arc::new(Daemon::from_config(config).await.unwrap());
    let (tx, listener) = ChannelListener::new(4);
    tokio::spawn({
        let daemon = Arc::clone(&daemon);
        async move {
            let _ = daemon.listen(listener).await;
        }
    });

    let mut stream = connect_stream(&tx).await;
    let mut block = [0u8; 152];
    stream.read_exact(&mut block).await.unwrap();
    assert_eq!(&block[0..8], b"NBDMAGIC");
    assert_eq!(
        u64::from_be_bytes(block[8..16].try_into().unwrap()),
        NBD_CLIENT_MAGIC
    );
    assert_eq!(
        u64::from_be_bytes(block[16..24].try_into().unwrap()),
        0x100000
    );
    assert_eq!(u16::from_be_bytes(block[26..28].try_into().unwrap()), 0x2D);

    // No negotiation: requests flow immediately.
    let request = Request::new(Command::Read, 0x1, 0, 0x1000);
    stream.write_all(&request.to_bytes()).await.unwrap();
    let reply = read_reply(&mut stream).await;
    assert_eq!(reply.error, NBD_SUCCESS);
    assert_eq!(reply.handle, 0x1);
    let mut payload = vec![0u8; 0x1000];
    stream.read_exact(&mut payload).await.unwrap();
}

#[tokio::test]
async fn concurrent_clients_share_an_export() {
    let (_daemon, tx) = start_daemon(vec![memory_export("disk", 1 << 20)]).await;

    let mut first = NbdClient::connect(connect_stream(&tx).await, "disk")
        .await
        .unwrap();
    let mut second = NbdClient::connect(connect_stream(&tx).await, "disk")
        .await
        .unwrap();

    first.write(0, &[0x11u8; 512]).await.unwrap();
    let seen = second.read(0, 512).await.unwrap();
    assert!(seen.iter().all(|&b| b == 0x11));

    first.disconnect().await.unwrap();
    second.disconnect().await.unwrap();
}
