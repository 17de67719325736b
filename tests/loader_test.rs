mod common;

use bytes::Bytes;

use common::{content, harness, mp4_head, wait_until, Recorder};
use ma_stream_cache::api::loader::LoaderSession;
use ma_stream_cache::engine::key::Resource;
use ma_stream_cache::engine::transfer::{RequestToken, TransferPhase};
use ma_stream_cache::error::FetchError;

fn resource() -> Resource {
    Resource::parse("https://media.example.com/feed/item-42.mp4").unwrap()
}

#[tokio::test]
async fn test_closing_session_stops_transfer_and_keeps_prefix() {
    let h = harness();
    let res = resource();
    let data = content(1000);

    let feed = h.fetcher.script(mp4_head(200, 1000, None));
    let session = LoaderSession::new(h.coordinator.clone(), res.clone());
    let rec = Recorder::new();
    session.request(rec.listener(RequestToken::new(1)), Some(0)).await;

    let transfer = h.coordinator.transfer(res.key()).unwrap();
    feed.send(&data[..400]);
    wait_until(|| transfer.buffered_len() == 400).await;

    session.close();
    wait_until(|| h.coordinator.transfer(res.key()).is_none()).await;

    assert_eq!(rec.completions()[0].1, Some(FetchError::Cancelled));
    let entry = h.coordinator.cache().load(res.key()).await.unwrap();
    assert_eq!(entry.bytes.as_ref(), &data[..400]);
}

#[tokio::test]
async fn test_two_sessions_share_a_transfer() {
    let h = harness();
    let res = resource();
    let data = content(600);

    let feed = h.fetcher.script(mp4_head(200, 600, None));
    let first = LoaderSession::new(h.coordinator.clone(), res.clone());
    let second = LoaderSession::new(h.coordinator.clone(), res.clone());
    let rec = Recorder::new();
    first.request(rec.listener(RequestToken::new(1)), None).await;
    second.request(Recorder::new().listener(RequestToken::new(2)), None).await;

    drop(first);
    let transfer = h.coordinator.transfer(res.key()).unwrap();
    assert!(!transfer.is_cancelled());

    feed.send(&data);
    feed.finish();
    wait_until(|| !rec.completions().is_empty()).await;
    assert_eq!(rec.completions()[0].1, None);
    assert_eq!(h.fetcher.requests().len(), 1);

    // The remaining session still pins the finished transfer.
    wait_until(|| transfer.phase() == TransferPhase::Finished).await;
    assert!(h.coordinator.transfer(res.key()).is_some());
    drop(second);
    assert!(h.coordinator.transfer(res.key()).is_none());
}

#[tokio::test]
async fn test_cancel_request_only_detaches_listener() {
    let h = harness();
    let res = resource();

    let _feed = h.fetcher.script(mp4_head(200, 1000, None));
    let session = LoaderSession::new(h.coordinator.clone(), res.clone());
    let rec = Recorder::new();
    session.request(rec.listener(RequestToken::new(9)), None).await;

    session.cancel_request(RequestToken::new(9));
    let transfer = h.coordinator.transfer(res.key()).unwrap();
    assert_eq!(transfer.listener_count(), 0);
    assert!(!transfer.is_cancelled());
}

#[tokio::test]
async fn test_reload_evicts_and_respects_budget() {
    let h = harness();
    let res = resource();
    let data = content(500);
    h.coordinator
        .cache()
        .store(res.key(), Bytes::copy_from_slice(&data[..100]), 500)
        .await;

    let session = LoaderSession::new(h.coordinator.clone(), res.clone()).with_reload_budget(1);
    assert_eq!(session.reloads_left(), 1);

    let feed = h.fetcher.script(mp4_head(200, 500, None));
    feed.send(&data);
    feed.finish();

    let rec = Recorder::new();
    assert!(session.reload(rec.listener(RequestToken::new(1))).await);
    assert_eq!(session.reloads_left(), 0);
    wait_until(|| !rec.completions().is_empty()).await;

    // The partial prefix was evicted, so the fetch restarted at zero.
    let requests = h.fetcher.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].offset, 0);
    assert_eq!(rec.completions()[0].0.as_ref(), &data[..]);

    assert!(!session.reload(Recorder::new().listener(RequestToken::new(2))).await);
    assert_eq!(h.fetcher.requests().len(), 1);
}
