//! Chunk/unchunk pipe composition: device-send chunking feeding an
//! owner-receive reassembly path, as the driver and dispatcher use them.

use fdo_to2::error::PipeError;
use fdo_to2::serviceinfo::pipe::{self, ChunkRead};
use fdo_to2::serviceinfo::ServiceInfoKV;

/// A large value chunked on the send side reassembles to the original on
/// the receive side, for several MTUs.
#[tokio::test]
async fn chunked_value_reassembles_end_to_end() {
    for mtu in [48usize, 96, 1300] {
        let original: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

        let (mut writer, mut chunk_rx) = pipe::out_pipe(mtu);
        writer.begin("fdo.download", "data").unwrap();
        writer.write(&original).unwrap();
        writer.close().unwrap();

        // Ferry chunks across, simulating the two protocol directions.
        let (mut owner_tx, mut unchunk_rx) = pipe::in_pipe();
        let ferry = tokio::spawn(async move {
            loop {
                match chunk_rx.read_chunk(mtu).await.unwrap() {
                    ChunkRead::Chunk(kv) => owner_tx.write_chunk(kv).await.unwrap(),
                    ChunkRead::End => {
                        owner_tx.close();
                        break;
                    }
                    ChunkRead::SizeTooSmall => panic!("writer emitted an oversized chunk"),
                }
            }
        });

        let (key, value) = unchunk_rx.next_service_info().await.unwrap().unwrap();
        assert_eq!(key, "fdo.download:data");
        assert_eq!(value, original, "mtu {mtu}");
        assert_eq!(unchunk_rx.next_service_info().await.unwrap(), None);
        ferry.await.unwrap();
    }
}

/// Multiple logical messages keep their order and boundaries.
#[tokio::test]
async fn message_boundaries_preserved() {
    let (mut writer, mut chunk_rx) = pipe::out_pipe(1300);
    writer.begin("devmod", "active").unwrap();
    writer.write(&[0xF5]).unwrap();
    writer.begin("devmod", "os").unwrap();
    writer.write(b"linux").unwrap();
    writer.begin("devmod", "arch").unwrap();
    writer.write(b"x86_64").unwrap();
    writer.close().unwrap();

    let (mut owner_tx, mut unchunk_rx) = pipe::in_pipe();
    let ferry = tokio::spawn(async move {
        while let ChunkRead::Chunk(kv) = chunk_rx.read_chunk(1300).await.unwrap() {
            owner_tx.write_chunk(kv).await.unwrap();
        }
        owner_tx.close();
    });

    let mut seen = Vec::new();
    while let Some((key, value)) = unchunk_rx.next_service_info().await.unwrap() {
        seen.push((key, value));
    }
    ferry.await.unwrap();

    assert_eq!(
        seen,
        vec![
            ("devmod:active".to_string(), vec![0xF5]),
            ("devmod:os".to_string(), b"linux".to_vec()),
            ("devmod:arch".to_string(), b"x86_64".to_vec()),
        ]
    );
}

/// An error closing the receive path surfaces to the unchunk reader after
/// buffered chunks drain.
#[tokio::test]
async fn receive_path_error_propagates() {
    let (mut owner_tx, mut unchunk_rx) = pipe::in_pipe();
    owner_tx
        .write_chunk(ServiceInfoKV::new("mod", "msg", vec![1]))
        .await
        .unwrap();
    owner_tx.close_with_error(PipeError::Poisoned("round aborted".into()));

    // The buffered chunk is still delivered; the poisoning follows.
    let result = unchunk_rx.next_service_info().await;
    match result {
        Ok(Some((key, _))) => {
            assert_eq!(key, "mod:msg");
            assert_eq!(
                unchunk_rx.next_service_info().await,
                Err(PipeError::Poisoned("round aborted".into()))
            );
        }
        Err(PipeError::Poisoned(_)) => {}
        other => panic!("unexpected result: {other:?}"),
    }
}

/// Writes after a normal close fail cleanly.
#[tokio::test]
async fn write_after_close_fails() {
    let (mut owner_tx, unchunk_rx) = pipe::in_pipe();
    owner_tx.close();
    drop(unchunk_rx);
    assert!(owner_tx
        .write_chunk(ServiceInfoKV::new("m", "x", vec![]))
        .await
        .is_err());
}
