//! End-to-end tests for the storage engine over an in-memory transport.

mod common;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, ReadBuf};

use chandrive::{BlobStore, DriveError, TransportError, UploadRequest, UploadVia};
use common::{payload, ref_count_of, setup_drive, OWNER};

#[tokio::test]
async fn test_round_trip_across_chunk_boundaries() {
    let drive = setup_drive().await;

    for (i, size) in [0usize, 1, 50, 51, 2000, 2001, 4000, 9999].into_iter().enumerate() {
        let data = payload(size, i as u8);
        let name = format!("file-{size}.bin");

        let stream_req = UploadRequest::new("/stream", &name).with_create_parents(true);
        let streamed = drive
            .engine
            .upload(OWNER, &stream_req, &data[..], size as u64)
            .await
            .unwrap();
        let bytes_req = UploadRequest::new("/bytes", &name).with_create_parents(true);
        let buffered = drive
            .engine
            .upload_bytes(OWNER, &bytes_req, &data)
            .await
            .unwrap();
        assert_eq!(buffered.via, UploadVia::Deduplicated);

        for node in [&streamed.node, &buffered.node] {
            let bytes = drive
                .engine
                .download(OWNER, &node.id)
                .await
                .unwrap()
                .read_all()
                .await
                .unwrap();
            assert_eq!(bytes, data, "round trip of {size} bytes");
        }
    }
}

#[tokio::test]
async fn test_tier_selection_on_the_wire() {
    let drive = setup_drive().await;

    drive
        .engine
        .upload_bytes(OWNER, &UploadRequest::new("/", "small"), &payload(50, 1))
        .await
        .unwrap();
    drive
        .engine
        .upload_bytes(OWNER, &UploadRequest::new("/", "exact"), &payload(2000, 2))
        .await
        .unwrap();
    drive
        .engine
        .upload_bytes(OWNER, &UploadRequest::new("/", "over"), &payload(2001, 3))
        .await
        .unwrap();
    drive
        .engine
        .upload_bytes(OWNER, &UploadRequest::new("/", "double"), &payload(4000, 4))
        .await
        .unwrap();

    // Chunks of one file may be sent in any order
    let mut sends: Vec<(String, usize)> = drive.transport.sends();
    sends.sort();
    assert_eq!(
        sends,
        vec![
            ("bot".to_string(), 50),
            ("client".to_string(), 1),
            ("client".to_string(), 2000),
            ("client".to_string(), 2000),
            ("client".to_string(), 2000),
            ("client".to_string(), 2000),
        ]
    );
}

#[tokio::test]
async fn test_dedup_shares_blob_and_purge_releases_one_reference() {
    let drive = setup_drive().await;
    let data = payload(3000, 9);

    let first = drive
        .engine
        .upload(OWNER, &UploadRequest::new("/", "one.bin"), &data[..], 3000)
        .await
        .unwrap();
    let second = drive
        .engine
        .upload(OWNER, &UploadRequest::new("/", "two.bin"), &data[..], 3000)
        .await
        .unwrap();

    assert_eq!(second.via, UploadVia::Deduplicated);
    let blob_id = first.node.blob_id.unwrap();
    assert_eq!(second.node.blob_id, Some(blob_id));
    assert_eq!(ref_count_of(&drive.engine, blob_id).await, 2);
    assert_eq!(BlobStore::new(drive.engine.database().pool()).count().await.unwrap(), 1);

    drive.engine.soft_delete(OWNER, &first.node.id).await.unwrap();
    assert_eq!(ref_count_of(&drive.engine, blob_id).await, 2);
    let report = drive.engine.purge(OWNER, &first.node.id).await.unwrap();
    assert!(report.orphaned_blobs.is_empty());
    assert_eq!(ref_count_of(&drive.engine, blob_id).await, 1);

    let bytes = drive
        .engine
        .download(OWNER, &second.node.id)
        .await
        .unwrap()
        .read_all()
        .await
        .unwrap();
    assert_eq!(bytes, data);
}

#[tokio::test]
async fn test_rename_directory_moves_descendants() {
    let drive = setup_drive().await;
    let data = payload(120, 5);

    drive
        .engine
        .upload_bytes(
            OWNER,
            &UploadRequest::new("/a/x", "deep.txt").with_create_parents(true),
            &data,
        )
        .await
        .unwrap();
    let a = drive.engine.resolve(OWNER, "/a").await.unwrap();

    let renamed = drive.engine.rename(OWNER, &a.id, "b").await.unwrap();
    assert_eq!(renamed.path, "/b");

    let file = drive.engine.resolve(OWNER, "/b/x/deep.txt").await.unwrap();
    assert_eq!(file.depth, 3);
    assert!(matches!(
        drive.engine.resolve(OWNER, "/a/x/deep.txt").await,
        Err(DriveError::NotFound(_))
    ));

    let listing = drive.engine.list(OWNER, "/b/x").await.unwrap();
    assert_eq!(listing.total_files, 1);
    assert_eq!(listing.total_size, 120);
}

#[tokio::test]
async fn test_soft_delete_and_restore_conflict() {
    let drive = setup_drive().await;

    drive
        .engine
        .upload_bytes(
            OWNER,
            &UploadRequest::new("/docs/2024", "report.pdf").with_create_parents(true),
            b"report",
        )
        .await
        .unwrap();
    let docs = drive.engine.resolve(OWNER, "/docs").await.unwrap();

    assert_eq!(drive.engine.soft_delete(OWNER, &docs.id).await.unwrap(), 3);
    assert!(drive.engine.list(OWNER, "/").await.unwrap().is_empty());
    assert!(drive.engine.resolve(OWNER, "/docs/2024/report.pdf").await.is_err());

    let restored = drive.engine.restore(OWNER, &docs.id).await.unwrap();
    assert_eq!(restored.path, "/docs");
    assert!(drive.engine.resolve(OWNER, "/docs/2024/report.pdf").await.is_ok());

    drive.engine.soft_delete(OWNER, &docs.id).await.unwrap();
    drive.engine.mkdir(OWNER, "/docs").await.unwrap();
    let err = drive.engine.restore(OWNER, &docs.id).await.unwrap_err();
    assert!(matches!(err, DriveError::RestoreConflict(p) if p == "/docs"));

    let trash = drive.engine.list_trash(OWNER).await.unwrap();
    assert_eq!(trash.len(), 1);
    assert_eq!(trash[0].id, docs.id);
}

#[tokio::test]
async fn test_name_conflict_detected_before_transport() {
    let drive = setup_drive().await;
    drive
        .engine
        .upload_bytes(OWNER, &UploadRequest::new("/", "taken"), &payload(10, 0))
        .await
        .unwrap();
    let sends = drive.transport.sends().len();

    let data = payload(5000, 1);
    let err = drive
        .engine
        .upload(OWNER, &UploadRequest::new("/", "taken"), &data[..], 5000)
        .await
        .unwrap_err();
    assert!(matches!(err, DriveError::NameConflict(p) if p == "/taken"));
    assert_eq!(drive.transport.sends().len(), sends);
}

#[tokio::test]
async fn test_size_unsupported_before_transport() {
    let drive = setup_drive().await;
    let capacity = drive.engine.planner().capacity();
    assert_eq!(capacity, 16_000);

    let err = drive
        .engine
        .upload(OWNER, &UploadRequest::new("/", "huge"), &b""[..], capacity + 1)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DriveError::SizeUnsupported {
            declared: 16_001,
            capacity: 16_000
        }
    ));
    assert!(drive.transport.sends().is_empty());
}

#[tokio::test]
async fn test_download_failure_reports_index_and_resumes() {
    let drive = setup_drive().await;
    let data = payload(9000, 7);
    let outcome = drive
        .engine
        .upload_bytes(OWNER, &UploadRequest::new("/", "five.bin"), &data)
        .await
        .unwrap();

    let blob = BlobStore::new(drive.engine.database().pool())
        .get_by_id(outcome.node.blob_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(blob.chunks.len(), 5);
    drive.transport.fail_fetches(
        &blob.chunks[3].remote_id,
        100,
        TransportError::Unavailable("timeout".into()),
    );

    let download = drive.engine.download(OWNER, &outcome.node.id).await.unwrap();
    let items: Vec<_> = download.into_stream().collect().await;
    assert_eq!(items.len(), 4);
    let mut received = Vec::new();
    for item in &items[..3] {
        received.extend_from_slice(item.as_ref().unwrap());
    }
    assert_eq!(received, data[..6000]);
    let err = items[3].as_ref().unwrap_err();
    assert_eq!(err.chunk_index(), Some(3));

    drive.transport.clear_fetch_failures();
    let before = drive.transport.fetches().len();
    let resumed = drive
        .engine
        .download_from(OWNER, &outcome.node.id, 3)
        .await
        .unwrap();
    assert_eq!(resumed.start, 3);
    assert_eq!(resumed.read_all().await.unwrap(), data[6000..]);

    let mut refetched = drive.transport.fetches()[before..].to_vec();
    refetched.sort();
    let mut expected = vec![blob.chunks[3].remote_id.clone(), blob.chunks[4].remote_id.clone()];
    expected.sort();
    assert_eq!(refetched, expected);
}

/// Yields its bytes, then never becomes ready again.
struct StallingReader {
    data: Vec<u8>,
    pos: usize,
}

impl AsyncRead for StallingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos >= self.data.len() {
            return Poll::Pending;
        }
        let n = buf.remaining().min(self.data.len() - self.pos);
        let start = self.pos;
        buf.put_slice(&self.data[start..start + n]);
        self.pos += n;
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn test_cancelled_upload_releases_sent_chunks() {
    let drive = setup_drive().await;
    let reader = StallingReader {
        data: payload(4000, 3),
        pos: 0,
    };

    let request = UploadRequest::new("/", "stalled");
    let upload = drive.engine.upload(OWNER, &request, reader, 4500);
    assert!(tokio::time::timeout(Duration::from_millis(100), upload)
        .await
        .is_err());

    // Cleanup runs on a spawned task
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(drive.transport.deleted().len(), 2);
    assert!(drive.transport.is_empty());
    assert_eq!(
        BlobStore::new(drive.engine.database().pool()).count().await.unwrap(),
        0
    );
    assert!(drive.engine.list(OWNER, "/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_trash_then_reclaim() {
    let drive = setup_drive().await;

    let kept = drive
        .engine
        .upload_bytes(OWNER, &UploadRequest::new("/", "kept"), &payload(60, 1))
        .await
        .unwrap();
    let gone = drive
        .engine
        .upload_bytes(
            OWNER,
            &UploadRequest::new("/tmp", "gone").with_create_parents(true),
            &payload(2500, 2),
        )
        .await
        .unwrap();
    let tmp = drive.engine.resolve(OWNER, "/tmp").await.unwrap();
    drive.engine.soft_delete(OWNER, &tmp.id).await.unwrap();

    let report = drive.engine.empty_trash(OWNER).await.unwrap();
    assert_eq!(report.nodes_removed, 2);
    assert_eq!(report.orphaned_blobs, vec![gone.node.blob_id.unwrap()]);

    let reclaimed = drive.engine.reclaim_orphans(100).await.unwrap();
    assert_eq!(reclaimed.blobs_removed, 1);
    assert_eq!(reclaimed.messages_released, 2);
    assert_eq!(drive.transport.len(), 1);

    let bytes = drive
        .engine
        .download(OWNER, &kept.node.id)
        .await
        .unwrap()
        .read_all()
        .await
        .unwrap();
    assert_eq!(bytes, payload(60, 1));
}
