use std::net::{IpAddr, Ipv4Addr};

use super::*;
use crate::client::transaction::TransactionResult;
use crate::proto::chandata::ChannelData;
use crate::proto::channum::is_channel_number;
use crate::proto::PROTO_TCP;

#[derive(Default)]
struct ScriptedTransactor {
    requests: Mutex<Vec<Message>>,
    indications: Mutex<Vec<Vec<u8>>>,
    fail_methods: Vec<Method>,
}

#[async_trait]
impl Transactor for ScriptedTransactor {
    async fn perform(&self, msg: &Message, _dont_wait: bool) -> Result<TransactionResult> {
        self.requests.lock().await.push(msg.clone());

        let mut res = Message::new();
        if self.fail_methods.contains(&msg.typ.method) {
            res.build(&[
                Box::new(msg.transaction_id),
                Box::new(MessageType::new(msg.typ.method, CLASS_ERROR_RESPONSE)),
                Box::new(ErrorCodeAttribute {
                    code: CODE_FORBIDDEN,
                    reason: b"Forbidden".to_vec(),
                }),
            ])?;
        } else {
            res.build(&[
                Box::new(msg.transaction_id),
                Box::new(MessageType::new(msg.typ.method, CLASS_SUCCESS_RESPONSE)),
            ])?;
        }

        Ok(TransactionResult {
            msg: res,
            ..Default::default()
        })
    }

    async fn indicate(&self, data: &[u8]) -> Result<usize> {
        self.indications.lock().await.push(data.to_vec());
        Ok(data.len())
    }
}

struct FailingTransactor;

#[async_trait]
impl Transactor for FailingTransactor {
    async fn perform(&self, _msg: &Message, _dont_wait: bool) -> Result<TransactionResult> {
        Err(Error::ErrFakeErr)
    }

    async fn indicate(&self, data: &[u8]) -> Result<usize> {
        Ok(data.len())
    }
}

fn test_alloc_config() -> AllocationConfig {
    AllocationConfig {
        relayed_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1113),
        reflexive_addr: None,
        lifetime: Duration::from_secs(600),
        auth: Arc::new(Mutex::new(AuthState::new(
            String::new(),
            String::new(),
            String::new(),
        ))),
        software: None,
        perm_map: Arc::new(Mutex::new(PermissionMap::new())),
        binding_mgr: Arc::new(Mutex::new(BindingManager::new())),
        refresh_interval: None,
        close_notify: CancellationToken::new(),
    }
}

fn peer(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
}

#[tokio::test]
async fn test_allocation_create_udp_and_duplicate() -> Result<()> {
    let transactor = Arc::new(ScriptedTransactor::default());
    let obs = Arc::clone(&transactor) as Arc<dyn Transactor + Send + Sync>;
    let alloc = Allocation::new(obs, test_alloc_config()).await;

    assert_eq!(alloc.relayed_addr(), peer(1113), "should match");

    let perm = alloc.create_udp(peer(1001)).await?;
    assert_eq!(perm.peer_addr(), peer(1001), "should match");

    {
        let requests = transactor.requests.lock().await;
        assert_eq!(1, requests.len(), "one CreatePermission expected");
        assert_eq!(
            requests[0].typ,
            MessageType::new(METHOD_CREATE_PERMISSION, CLASS_REQUEST),
            "should match"
        );
    }

    // No two permissions for the same peer.
    match alloc.create_udp(peer(1001)).await {
        Err(Error::ErrPermissionExists) => {}
        other => panic!("expected duplicate-permission error, got {:?}", other.is_ok()),
    }

    Ok(())
}

#[tokio::test]
async fn test_allocation_create_non_udp_peer() -> Result<()> {
    let transactor = Arc::new(ScriptedTransactor::default());
    let obs = Arc::clone(&transactor) as Arc<dyn Transactor + Send + Sync>;
    let alloc = Allocation::new(obs, test_alloc_config()).await;

    match alloc.create(PROTO_TCP, peer(1001)).await {
        Err(Error::ErrUnsupportedPeerType) => {}
        other => panic!("expected unsupported peer, got {:?}", other.is_ok()),
    }

    Ok(())
}

#[tokio::test]
async fn test_allocation_create_server_error() -> Result<()> {
    let transactor = Arc::new(ScriptedTransactor {
        fail_methods: vec![METHOD_CREATE_PERMISSION],
        ..Default::default()
    });
    let obs = Arc::clone(&transactor) as Arc<dyn Transactor + Send + Sync>;
    let alloc = Allocation::new(obs, test_alloc_config()).await;

    match alloc.create_udp(peer(1001)).await {
        Err(Error::ErrServer { code, .. }) => assert_eq!(403, code, "should match"),
        other => panic!("expected server error, got {:?}", other.is_ok()),
    }

    Ok(())
}

#[tokio::test]
async fn test_allocation_bind_upgrades_write_path() -> Result<()> {
    let transactor = Arc::new(ScriptedTransactor::default());
    let obs = Arc::clone(&transactor) as Arc<dyn Transactor + Send + Sync>;
    let alloc = Allocation::new(obs, test_alloc_config()).await;

    let perm = alloc.create_udp(peer(1001)).await?;

    // Before the bind, writes are Send indications.
    perm.write(&[0x01, 0x02]).await?;
    {
        let indications = transactor.indications.lock().await;
        assert!(
            is_message(&indications[0]),
            "unbound write must be a Send indication"
        );
    }

    assert!(!perm.bound().await, "should not be bound yet");
    perm.bind().await?;
    assert!(perm.bound().await, "should be bound");

    let number = perm.bound_channel().await.expect("should have a number");
    assert!(is_channel_number(number), "number must be in range");

    match perm.bind().await {
        Err(Error::ErrAlreadyBound) => {}
        other => panic!("expected already-bound error, got {:?}", other.is_ok()),
    }

    // After the bind, writes are ChannelData frames.
    perm.write(&[0x0a, 0x0b, 0x0c, 0x0d]).await?;
    {
        let indications = transactor.indications.lock().await;
        let raw = indications.last().unwrap().clone();
        assert!(ChannelData::is_channel_data(&raw), "should be channel data");

        let mut ch_data = ChannelData {
            raw,
            ..Default::default()
        };
        ch_data.decode()?;
        assert_eq!(number, ch_data.number.0, "should match");
        assert_eq!(vec![0x0a, 0x0b, 0x0c, 0x0d], ch_data.data, "should match");
    }

    Ok(())
}

#[tokio::test]
async fn test_allocation_bind_failure_keeps_indication_path() -> Result<()> {
    let transactor = Arc::new(ScriptedTransactor {
        fail_methods: vec![METHOD_CHANNEL_BIND],
        ..Default::default()
    });
    let obs = Arc::clone(&transactor) as Arc<dyn Transactor + Send + Sync>;
    let alloc = Allocation::new(obs, test_alloc_config()).await;

    let perm = alloc.create_udp(peer(1001)).await?;
    assert!(perm.bind().await.is_err(), "bind should fail");
    assert!(!perm.bound().await, "binding must be rolled back");

    // The peer stays reachable via indications.
    perm.write(&[0x01]).await?;
    {
        let indications = transactor.indications.lock().await;
        assert!(
            is_message(indications.last().unwrap()),
            "should be a Send indication"
        );
    }

    Ok(())
}

#[tokio::test]
async fn test_allocation_create_with_failing_transactor() -> Result<()> {
    let obs = Arc::new(FailingTransactor) as Arc<dyn Transactor + Send + Sync>;
    let binding_mgr = Arc::new(Mutex::new(BindingManager::new()));
    let config = AllocationConfig {
        binding_mgr: Arc::clone(&binding_mgr),
        ..test_alloc_config()
    };
    let alloc = Allocation::new(obs, config).await;

    match alloc.create_udp(peer(1234)).await {
        Err(Error::ErrFakeErr) => {}
        other => panic!("expected fake error, got {:?}", other.is_ok()),
    }

    Ok(())
}

#[tokio::test]
async fn test_allocation_close() -> Result<()> {
    let transactor = Arc::new(ScriptedTransactor::default());
    let obs = Arc::clone(&transactor) as Arc<dyn Transactor + Send + Sync>;
    let alloc = Allocation::new(obs, test_alloc_config()).await;

    let perm = alloc.create_udp(peer(1001)).await?;
    alloc.close().await?;

    let mut buf = [0u8; 16];
    match perm.read(&mut buf).await {
        Err(Error::ErrClosed) => {}
        other => panic!("expected closed, got {other:?}"),
    }

    match alloc.create_udp(peer(1002)).await {
        Err(Error::ErrClosed) => {}
        other => panic!("expected closed, got {:?}", other.is_ok()),
    }

    // close is idempotent
    alloc.close().await?;

    Ok(())
}
