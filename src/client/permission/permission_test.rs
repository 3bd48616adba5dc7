use std::net::{IpAddr, Ipv4Addr};

use tokio::time::Duration;

use super::*;
use crate::client::transaction::TransactionResult;

fn test_inner() -> Arc<PermissionInner> {
    let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1001);
    Arc::new(PermissionInner::new(peer, CancellationToken::new()))
}

#[tokio::test]
async fn test_inbound_queue_order() -> Result<()> {
    let inner = test_inner();

    inner.enqueue(&[1]).await;
    inner.enqueue(&[2, 2]).await;
    inner.enqueue(&[3, 3, 3]).await;

    let mut lens = vec![];
    for _ in 0..3 {
        let mut buf = [0u8; 16];
        let mut queue = inner.queue.lock().await;
        let data = queue.pop_front().unwrap();
        buf[..data.len()].copy_from_slice(&data);
        lens.push(data.len());
    }
    assert_eq!(lens, vec![1, 2, 3], "per-permission order must be preserved");

    Ok(())
}

#[tokio::test]
async fn test_inbound_queue_overflow_drops_oldest() -> Result<()> {
    let inner = test_inner();

    for i in 0..(MAX_READ_QUEUE_SIZE + 2) {
        inner.enqueue(&(i as u32).to_be_bytes()).await;
    }
    assert_eq!(2, inner.dropped.load(Ordering::SeqCst), "should count drops");

    // The two oldest datagrams are gone.
    let mut queue = inner.queue.lock().await;
    let first = queue.pop_front().unwrap();
    assert_eq!(first, 2u32.to_be_bytes().to_vec(), "oldest must be dropped");
    assert_eq!(queue.len(), MAX_READ_QUEUE_SIZE - 1, "queue stays bounded");

    Ok(())
}

fn test_permission(inner: Arc<PermissionInner>) -> Permission {
    struct NoopTransactor;

    #[async_trait::async_trait]
    impl Transactor for NoopTransactor {
        async fn perform(
            &self,
            _msg: &Message,
            _dont_wait: bool,
        ) -> Result<TransactionResult> {
            Err(Error::ErrFakeErr)
        }

        async fn indicate(&self, data: &[u8]) -> Result<usize> {
            Ok(data.len())
        }
    }

    Permission::new(
        inner,
        Arc::new(NoopTransactor),
        Arc::new(Mutex::new(AuthState::new(
            String::new(),
            String::new(),
            String::new(),
        ))),
        None,
        Arc::new(Mutex::new(PermissionMap::new())),
        Arc::new(Mutex::new(BindingManager::new())),
    )
}

#[tokio::test]
async fn test_read_returns_queued_datagram() -> Result<()> {
    let inner = test_inner();
    let perm = test_permission(Arc::clone(&inner));

    inner.enqueue(&[1, 2, 3, 4]).await;

    let mut buf = [0u8; 16];
    let n = perm.read(&mut buf).await?;
    assert_eq!(4, n, "should match");
    assert_eq!(&buf[..n], &[1, 2, 3, 4], "should match");

    Ok(())
}

#[tokio::test]
async fn test_read_short_buffer() -> Result<()> {
    let inner = test_inner();
    let perm = test_permission(Arc::clone(&inner));

    inner.enqueue(&[1, 2, 3, 4]).await;

    let mut buf = [0u8; 2];
    if let Err(err) = perm.read(&mut buf).await {
        assert_eq!(Error::ErrShortBuffer, err, "should be short buffer");
    } else {
        panic!("expected error");
    }

    Ok(())
}

#[tokio::test]
async fn test_read_deadline() -> Result<()> {
    let inner = test_inner();
    let perm = test_permission(inner);

    perm.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)))
        .await;

    let start = Instant::now();
    let mut buf = [0u8; 16];
    match perm.read(&mut buf).await {
        Err(Error::ErrTimeout) => {}
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(
        start.elapsed() >= Duration::from_millis(40),
        "should have waited for the deadline"
    );

    Ok(())
}

#[tokio::test]
async fn test_close_wakes_blocked_read() -> Result<()> {
    let inner = test_inner();
    let perm = Arc::new(test_permission(Arc::clone(&inner)));

    let reader = Arc::clone(&perm);
    let handle = tokio::spawn(async move {
        let mut buf = [0u8; 16];
        reader.read(&mut buf).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    perm.close().await?;

    match handle.await.unwrap() {
        Err(Error::ErrClosed) => {}
        other => panic!("expected closed, got {other:?}"),
    }

    // close is idempotent
    perm.close().await?;

    Ok(())
}

#[tokio::test]
async fn test_read_drains_before_reporting_close() -> Result<()> {
    let inner = test_inner();
    let perm = test_permission(Arc::clone(&inner));

    inner.enqueue(&[9, 9]).await;
    // enqueue ignores frames once closed
    inner.close();
    inner.enqueue(&[1]).await;

    let mut buf = [0u8; 16];
    let n = perm.read(&mut buf).await?;
    assert_eq!(2, n, "queued datagram is still drained");

    match perm.read(&mut buf).await {
        Err(Error::ErrClosed) => {}
        other => panic!("expected closed, got {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn test_read_after_transport_loss() -> Result<()> {
    let inner = test_inner();
    let perm = test_permission(Arc::clone(&inner));

    inner.mark_lost();

    let mut buf = [0u8; 16];
    match perm.read(&mut buf).await {
        Err(Error::ErrConnectionLost) => {}
        other => panic!("expected connection lost, got {other:?}"),
    }

    match perm.write(&[1]).await {
        Err(Error::ErrConnectionLost) => {}
        other => panic!("expected connection lost, got {other:?}"),
    }

    Ok(())
}
