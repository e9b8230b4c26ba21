//! Sender and receiver state machines over in-memory duplex streams, against
//! each other and against scripted peers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fluxterm_xmodem::codec::{self, ACK, CAN, CRC_REQUEST, EOT, NAK, SUB};
use fluxterm_xmodem::{
    BlockSize, Checksum, Port, Progress, Receiver, Sender, StreamPort, TransferConfig,
    TransferError,
};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// Records every write so tests can count frames on the wire.
struct Tap {
    inner: StreamPort<DuplexStream>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl Port for Tap {
    async fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf).await
    }

    async fn write_all(&self, data: &[u8]) -> std::io::Result<()> {
        self.writes.lock().unwrap().push(data.to_vec());
        self.inner.write_all(data).await
    }
}

async fn expect_byte(peer: &mut DuplexStream, want: u8) {
    let got = peer.read_u8().await.unwrap();
    assert_eq!(got, want, "expected {want:#04x}, got {got:#04x}");
}

// ─── End to End ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn three_hundred_bytes_in_128_byte_blocks() {
    let (a, b) = duplex(64 * 1024);
    let writes = Arc::new(Mutex::new(Vec::new()));
    let tx_port = Tap {
        inner: StreamPort::new(a),
        writes: writes.clone(),
    };
    let rx_port = StreamPort::new(b);
    let data = payload(300);

    let mut sent_progress = Vec::new();
    let mut recv_progress = Vec::new();
    let sender = Sender::new(TransferConfig::default());
    let receiver = Receiver::new(TransferConfig::default(), Checksum::Sum8);

    let (sent, received) = tokio::join!(
        sender.send(&tx_port, &data, |p: Progress| sent_progress.push(p.transferred)),
        receiver.receive(&rx_port, |p: Progress| recv_progress.push(p.transferred)),
    );
    let summary = sent.unwrap();
    let received = received.unwrap();

    assert_eq!(summary.blocks, 3);
    assert_eq!(summary.bytes, 300);
    assert_eq!(summary.checksum, Checksum::Sum8);
    assert_eq!(summary.retransmissions, 0);
    assert_eq!(sent_progress, vec![128, 256, 300]);
    assert_eq!(recv_progress, vec![128, 256, 384]);

    assert_eq!(received.len(), 384);
    assert_eq!(&received[..300], &data[..]);
    assert!(received[300..].iter().all(|&b| b == SUB));

    // Three data frames, then exactly one EOT.
    let writes = writes.lock().unwrap();
    assert_eq!(writes.len(), 4);
    assert!(writes[..3].iter().all(|w| w.len() == 3 + 128 + 1));
    assert_eq!(writes[3], vec![EOT]);
}

#[tokio::test]
async fn crc_mode_wraps_block_numbers() {
    let (a, b) = duplex(64 * 1024);
    let (tx, rx) = (StreamPort::new(a), StreamPort::new(b));
    // 300 blocks crosses 255 -> 0 -> 1.
    let data = payload(300 * 128);

    let sender = Sender::new(TransferConfig::default());
    let receiver = Receiver::new(TransferConfig::default(), Checksum::Crc16);
    let (sent, received) = tokio::join!(
        sender.send(&tx, &data, |_| {}),
        receiver.receive(&rx, |_| {}),
    );

    let summary = sent.unwrap();
    assert_eq!(summary.blocks, 300);
    assert_eq!(summary.checksum, Checksum::Crc16);
    assert_eq!(received.unwrap(), data);
}

#[tokio::test]
async fn extended_blocks_use_stx() {
    let (a, b) = duplex(64 * 1024);
    let writes = Arc::new(Mutex::new(Vec::new()));
    let tx = Tap {
        inner: StreamPort::new(a),
        writes: writes.clone(),
    };
    let rx = StreamPort::new(b);
    let data = payload(1500);

    let sender = Sender::new(TransferConfig::default()).with_block_size(BlockSize::Extended);
    let receiver = Receiver::new(TransferConfig::default(), Checksum::Crc16);
    let (sent, received) = tokio::join!(
        sender.send(&tx, &data, |_| {}),
        receiver.receive(&rx, |_| {}),
    );

    assert_eq!(sent.unwrap().blocks, 2);
    let received = received.unwrap();
    assert_eq!(received.len(), 2048);
    assert_eq!(&received[..1500], &data[..]);
    let writes = writes.lock().unwrap();
    assert_eq!(writes[0][0], codec::STX);
    assert_eq!(writes[0].len(), 3 + 1024 + 2);
}

// ─── Sender Against Scripted Receivers ──────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn sender_times_out_without_handshake_and_writes_nothing() {
    let (a, mut peer) = duplex(4096);
    let port = StreamPort::new(a);
    let started = tokio::time::Instant::now();

    let err = Sender::new(TransferConfig::default())
        .send(&port, &payload(300), |_| panic!("no progress expected"))
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::Timeout), "got {err:?}");
    assert!(started.elapsed() >= Duration::from_secs(30));
    let mut buf = [0u8; 1];
    let nothing = tokio::time::timeout(Duration::from_millis(50), peer.read(&mut buf)).await;
    assert!(nothing.is_err(), "sender must not write before handshake");
}

#[tokio::test]
async fn sender_cancelled_during_handshake() {
    let (a, mut peer) = duplex(4096);
    let port = StreamPort::new(a);
    peer.write_all(&[CAN]).await.unwrap();

    let err = Sender::new(TransferConfig::default())
        .send(&port, b"hello", |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Cancelled));
}

#[tokio::test]
async fn sender_retransmits_on_nak_then_gives_up() {
    let (a, mut peer) = duplex(64 * 1024);
    let port = StreamPort::new(a);
    let config = TransferConfig::default();

    let script = tokio::spawn(async move {
        peer.write_all(&[CRC_REQUEST]).await.unwrap();
        let mut frame = [0u8; 3 + 128 + 2];
        let mut first = None;
        for _ in 0..10 {
            peer.read_exact(&mut frame).await.unwrap();
            // Every retransmission is the identical block 1.
            assert_eq!(*first.get_or_insert(frame), frame);
            assert_eq!((frame[1], frame[2]), (1, 0xFE));
            peer.write_all(&[NAK]).await.unwrap();
        }
        peer
    });

    let err = Sender::new(config)
        .send(&port, &payload(10), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::TooManyRetries { block: 1 }), "got {err:?}");
    script.await.unwrap();
}

#[tokio::test]
async fn sender_stops_on_can_mid_transfer() {
    let (a, mut peer) = duplex(64 * 1024);
    let port = StreamPort::new(a);

    let script = tokio::spawn(async move {
        peer.write_all(&[NAK]).await.unwrap();
        let mut frame = [0u8; 3 + 128 + 1];
        peer.read_exact(&mut frame).await.unwrap();
        peer.write_all(&[ACK]).await.unwrap();
        peer.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame[1], 2);
        peer.write_all(&[CAN]).await.unwrap();
        peer
    });

    let mut progress = Vec::new();
    let err = Sender::new(TransferConfig::default())
        .send(&port, &payload(200), |p| progress.push(p.transferred))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Cancelled));
    assert_eq!(progress, vec![128]);
    script.await.unwrap();
}

// ─── Receiver Against Scripted Senders ──────────────────────────────────────

#[tokio::test]
async fn receiver_naks_wrong_block_number_and_does_not_advance() {
    let (a, mut peer) = duplex(4096);
    let port = StreamPort::new(a);
    let block = [0x42u8; 128];

    let script = tokio::spawn(async move {
        expect_byte(&mut peer, NAK).await;
        peer.write_all(&codec::encode_frame(2, &block, Checksum::Sum8))
            .await
            .unwrap();
        expect_byte(&mut peer, NAK).await;
        peer.write_all(&codec::encode_frame(1, &block, Checksum::Sum8))
            .await
            .unwrap();
        expect_byte(&mut peer, ACK).await;
        peer.write_all(&[EOT]).await.unwrap();
        expect_byte(&mut peer, ACK).await;
        peer
    });

    let data = Receiver::new(TransferConfig::default(), Checksum::Sum8)
        .receive(&port, |_| {})
        .await
        .unwrap();
    assert_eq!(data, block.to_vec());
    script.await.unwrap();
}

#[tokio::test]
async fn receiver_naks_corrupt_trailer_then_accepts_retransmission() {
    let (a, mut peer) = duplex(4096);
    let port = StreamPort::new(a);
    let block = [0x10u8; 128];
    let good = codec::encode_frame(1, &block, Checksum::Sum8);
    let mut bad = good.to_vec();
    let last = bad.len() - 1;
    bad[last] = bad[last].wrapping_add(1);

    let script = tokio::spawn(async move {
        expect_byte(&mut peer, NAK).await;
        peer.write_all(&bad).await.unwrap();
        expect_byte(&mut peer, NAK).await;
        peer.write_all(&good).await.unwrap();
        expect_byte(&mut peer, ACK).await;
        peer.write_all(&[EOT]).await.unwrap();
        expect_byte(&mut peer, ACK).await;
        peer
    });

    let mut progress = Vec::new();
    let data = Receiver::new(TransferConfig::default(), Checksum::Sum8)
        .receive(&port, |p| progress.push(p.transferred))
        .await
        .unwrap();
    assert_eq!(data, block.to_vec());
    assert_eq!(progress, vec![128]);
    script.await.unwrap();
}

#[tokio::test]
async fn receiver_keeps_the_header_seen_during_start() {
    // The sender fires its first frame the moment it sees 'C'; the header
    // byte the receiver consumes while waiting must begin that frame.
    let (a, mut peer) = duplex(4096);
    let port = StreamPort::new(a);
    let block = [0x5Au8; 128];

    let script = tokio::spawn(async move {
        expect_byte(&mut peer, CRC_REQUEST).await;
        peer.write_all(&codec::encode_frame(1, &block, Checksum::Crc16))
            .await
            .unwrap();
        expect_byte(&mut peer, ACK).await;
        peer.write_all(&[EOT]).await.unwrap();
        expect_byte(&mut peer, ACK).await;
        peer
    });

    let data = Receiver::new(TransferConfig::default(), Checksum::Crc16)
        .receive(&port, |_| {})
        .await
        .unwrap();
    assert_eq!(data, block.to_vec());
    script.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn receiver_times_out_after_ten_start_signals() {
    let (a, mut peer) = duplex(4096);
    let port = StreamPort::new(a);

    let err = Receiver::new(TransferConfig::default(), Checksum::Crc16)
        .receive(&port, |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Timeout));

    let mut starts = [0u8; 10];
    peer.read_exact(&mut starts).await.unwrap();
    assert!(starts.iter().all(|&b| b == CRC_REQUEST));
}

#[tokio::test]
async fn receiver_cancelled_by_sender() {
    let (a, mut peer) = duplex(4096);
    let port = StreamPort::new(a);
    peer.write_all(&[CAN]).await.unwrap();

    let err = Receiver::new(TransferConfig::default(), Checksum::Sum8)
        .receive(&port, |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Cancelled));
}

#[tokio::test]
async fn closed_port_aborts_transfer() {
    let (a, peer) = duplex(4096);
    let port = StreamPort::new(a);
    drop(peer);

    let err = Receiver::new(TransferConfig::default(), Checksum::Sum8)
        .receive(&port, |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Io(_)), "got {err:?}");
}
