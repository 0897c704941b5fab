//! Integration tests for function-shipper.
//!
//! These drive a `Shipper` and one or more `Caller`s over real streams.

use std::time::Duration;

use function_shipper::proc::{MsgPack, Seq};
use function_shipper::{
    proc_struct, CallHandle, CallStatus, Caller, MemoryNetwork, Shipper, ShipperConfig,
    ShipperError, TcpNetwork,
};
use function_shipper::handler::{BoxFuture, HandlerResult};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone, PartialEq)]
struct Handle {
    cookie: u64,
}
proc_struct!(Handle { cookie });

#[derive(Debug, Default, Clone, PartialEq)]
struct OpenIn {
    path: String,
    handle: Handle,
}
proc_struct!(OpenIn { path, handle });

#[derive(Debug, Default, Clone, PartialEq)]
struct OpenOut {
    event_id: u64,
    ret: i32,
}
proc_struct!(OpenOut { event_id, ret });

async fn bla_open(args: OpenIn) -> function_shipper::Result<OpenOut> {
    if args.path.is_empty() {
        return Ok(OpenOut {
            event_id: 0,
            ret: -2,
        });
    }
    Ok(OpenOut {
        event_id: 232,
        ret: 0,
    })
}

fn open_args(cookie: u64) -> OpenIn {
    OpenIn {
        path: "/tmp/bla".to_string(),
        handle: Handle { cookie },
    }
}

/// Three peers each ship one call; a fourth wait idles out.
#[tokio::test]
async fn test_three_peers_then_idle_timeout() {
    let (network, connector) = MemoryNetwork::new();
    let mut shipper = Shipper::builder()
        .handle_typed("bla_open", bla_open)
        .start(network)
        .unwrap();

    let mut clients = Vec::new();
    for cookie in [42u64, 43, 44] {
        let caller = Caller::new(connector.connect().unwrap(), ShipperConfig::default());
        clients.push(tokio::spawn(async move {
            let out: OpenOut = caller
                .call("bla_open", &mut open_args(cookie), WAIT)
                .await
                .unwrap();
            out
        }));
    }

    for _ in 0..3 {
        let outcome = shipper.process(WAIT).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.procedure, "bla_open");
    }

    for client in clients {
        let out = client.await.unwrap();
        assert_eq!(out.event_id, 232);
        assert_eq!(out.ret, 0);
    }
    assert_eq!(shipper.peer_count(), 3);

    let err = shipper.process(Duration::from_millis(50)).await.unwrap_err();
    assert!(matches!(err, ShipperError::Timeout));

    shipper.finalize().await.unwrap();
}

/// The canonical open call: cookie 42 comes back as event 232.
#[tokio::test]
async fn test_bla_open_event_id() {
    let (network, connector) = MemoryNetwork::new();
    let mut shipper = Shipper::builder()
        .handle_typed("bla_open", bla_open)
        .start(network)
        .unwrap();
    let caller = Caller::new(connector.connect().unwrap(), ShipperConfig::default());

    let client = tokio::spawn(async move {
        caller
            .call::<_, OpenOut>("bla_open", &mut open_args(42), WAIT)
            .await
    });

    shipper.process(WAIT).await.unwrap();
    let out = client.await.unwrap().unwrap();
    assert_eq!(out, OpenOut { event_id: 232, ret: 0 });

    shipper.finalize().await.unwrap();
}

/// Domain failures travel in the typed response, not as an error frame.
#[tokio::test]
async fn test_domain_error_in_response() {
    let (network, connector) = MemoryNetwork::new();
    let mut shipper = Shipper::builder()
        .handle_typed("bla_open", bla_open)
        .start(network)
        .unwrap();
    let caller = Caller::new(connector.connect().unwrap(), ShipperConfig::default());

    let client = tokio::spawn(async move {
        let mut args = OpenIn::default();
        caller.call::<_, OpenOut>("bla_open", &mut args, WAIT).await
    });

    assert!(shipper.process(WAIT).await.unwrap().is_success());
    assert_eq!(client.await.unwrap().unwrap().ret, -2);
    shipper.finalize().await.unwrap();
}

/// An unknown procedure fails that call only; the loop keeps serving.
#[tokio::test]
async fn test_unknown_procedure_then_success() {
    let (network, connector) = MemoryNetwork::new();
    let mut shipper = Shipper::builder()
        .handle_typed("bla_open", bla_open)
        .start(network)
        .unwrap();
    let caller = Caller::new(connector.connect().unwrap(), ShipperConfig::default());

    let client = tokio::spawn(async move {
        let missing = caller
            .call::<_, OpenOut>("bla_close", &mut open_args(1), WAIT)
            .await;
        let found = caller
            .call::<_, OpenOut>("bla_open", &mut open_args(1), WAIT)
            .await;
        (missing, found)
    });

    let first = shipper.process(WAIT).await.unwrap();
    assert!(matches!(
        first.status,
        CallStatus::Failed(ShipperError::UnknownProcedure(ref name)) if name == "bla_close"
    ));
    let second = shipper.process(WAIT).await.unwrap();
    assert!(second.is_success());

    let (missing, found) = client.await.unwrap();
    assert!(matches!(missing, Err(ShipperError::Remote(msg)) if msg.contains("bla_close")));
    assert_eq!(found.unwrap().event_id, 191);

    let stats = shipper.stats();
    assert_eq!((stats.responded, stats.failed), (1, 1));
    shipper.finalize().await.unwrap();
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Listing {
    names: Seq<String>,
    blob: Vec<u8>,
}
proc_struct!(Listing { names, blob });

/// Responses larger than the inline buffer arrive through the extra buffer,
/// and so do large requests.
#[tokio::test]
async fn test_spilled_request_and_response() {
    let (network, connector) = MemoryNetwork::new();
    let mut shipper = Shipper::builder()
        .inline_buffer_size(64)
        .handle_typed("list", |count: u32| async move {
            let names = (0..count).map(|i| format!("entry-{:04}", i)).collect();
            Ok(Listing {
                names: Seq(names),
                blob: vec![0xAB; 4096],
            })
        })
        .handle_typed("sum", |data: Vec<u8>| async move {
            Ok(data.iter().map(|&b| u64::from(b)).sum::<u64>())
        })
        .start(network)
        .unwrap();

    let config = ShipperConfig {
        inline_buffer_size: 32,
        ..ShipperConfig::default()
    };
    let caller = Caller::new(connector.connect().unwrap(), config);

    let client = tokio::spawn(async move {
        let listing: Listing = caller.call("list", &mut 200u32, WAIT).await.unwrap();
        let sum: u64 = caller.call("sum", &mut vec![1u8; 10_000], WAIT).await.unwrap();
        (listing, sum)
    });

    for _ in 0..2 {
        assert!(shipper.process(WAIT).await.unwrap().is_success());
    }

    let (listing, sum) = client.await.unwrap();
    assert_eq!(listing.names.0.len(), 200);
    assert_eq!(listing.names.0[199], "entry-0199");
    assert_eq!(listing.blob.len(), 4096);
    assert_eq!(sum, 10_000);
    shipper.finalize().await.unwrap();
}

/// Growth beyond the extra-buffer cap fails the call with an error response.
#[tokio::test]
async fn test_extra_buffer_limit_fails_call() {
    let (network, connector) = MemoryNetwork::new();
    let mut shipper = Shipper::builder()
        .inline_buffer_size(16)
        .max_extra_size(256)
        .handle_typed("blob", |len: u32| async move { Ok(vec![0u8; len as usize]) })
        .start(network)
        .unwrap();
    let caller = Caller::new(connector.connect().unwrap(), ShipperConfig::default());

    let client =
        tokio::spawn(async move { caller.call::<_, Vec<u8>>("blob", &mut 1024u32, WAIT).await });

    let outcome = shipper.process(WAIT).await.unwrap();
    assert!(matches!(
        outcome.status,
        CallStatus::Failed(ShipperError::Allocation { .. })
    ));
    assert!(matches!(client.await.unwrap(), Err(ShipperError::Remote(_))));
    shipper.finalize().await.unwrap();
}

#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct Attrs {
    mode: u32,
    owner: String,
    #[serde(with = "serde_bytes")]
    xattr: Vec<u8>,
}

/// Serde structures ride along as MessagePack blobs.
#[tokio::test]
async fn test_msgpack_field_roundtrip() {
    let (network, connector) = MemoryNetwork::new();
    let mut shipper = Shipper::builder()
        .handle_typed("chmod", |mut attrs: MsgPack<Attrs>| async move {
            attrs.0.mode = 0o600;
            Ok(attrs)
        })
        .start(network)
        .unwrap();
    let caller = Caller::new(connector.connect().unwrap(), ShipperConfig::default());

    let client = tokio::spawn(async move {
        let mut attrs = MsgPack(Attrs {
            mode: 0o644,
            owner: "root".to_string(),
            xattr: vec![1, 2, 3],
        });
        caller.call::<_, MsgPack<Attrs>>("chmod", &mut attrs, WAIT).await
    });

    shipper.process(WAIT).await.unwrap();
    let attrs = client.await.unwrap().unwrap().into_inner();
    assert_eq!(attrs.mode, 0o600);
    assert_eq!(attrs.xattr, vec![1, 2, 3]);
    shipper.finalize().await.unwrap();
}

fn respond_twice(call: &mut CallHandle) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        call.release_input();
        call.respond_with(&mut 1u32).await?;
        call.respond_with(&mut 2u32).await
    })
}

/// Exactly one response leaves a call even if the handler tries twice.
#[tokio::test]
async fn test_single_response_per_call() {
    let (network, connector) = MemoryNetwork::new();
    let mut shipper = Shipper::builder()
        .handle_fn("twice", respond_twice)
        .handle_typed("inc", |n: u32| async move { Ok(n + 1) })
        .start(network)
        .unwrap();
    let caller = Caller::new(connector.connect().unwrap(), ShipperConfig::default());

    let client = tokio::spawn(async move {
        let first: u32 = caller.call("twice", &mut (), WAIT).await.unwrap();
        let second: u32 = caller.call("inc", &mut 9u32, WAIT).await.unwrap();
        (first, second)
    });

    let outcome = shipper.process(WAIT).await.unwrap();
    assert!(outcome.is_success());
    shipper.process(WAIT).await.unwrap();

    assert_eq!(client.await.unwrap(), (1, 10));
    shipper.finalize().await.unwrap();
}

/// `serve` stops once every peer has gone.
#[tokio::test]
async fn test_serve_until_peers_leave() {
    let (network, connector) = MemoryNetwork::new();
    let mut shipper = Shipper::builder()
        .handle_typed("bla_open", bla_open)
        .start(network)
        .unwrap();

    let client = tokio::spawn(async move {
        let caller = Caller::new(connector.connect().unwrap(), ShipperConfig::default());
        for cookie in 0..5 {
            let _: OpenOut = caller
                .call("bla_open", &mut open_args(cookie), WAIT)
                .await
                .unwrap();
        }
        caller.close().await.unwrap();
        // connector dropped here: no more peers
    });

    let stats = shipper.serve(Duration::from_millis(20), |_| true).await.unwrap();
    client.await.unwrap();

    assert_eq!(stats.calls, 5);
    assert_eq!(stats.responded, 5);
    shipper.finalize().await.unwrap();
}

/// Full stack over loopback TCP.
#[tokio::test]
async fn test_tcp_roundtrip() {
    let network = TcpNetwork::bind("127.0.0.1:0").await.unwrap();
    let addr = network.local_addr().unwrap();
    let mut shipper = Shipper::builder()
        .handle_typed("bla_open", bla_open)
        .start(network)
        .unwrap();

    let client = tokio::spawn(async move {
        let caller = Caller::connect_tcp(addr, ShipperConfig::default())
            .await
            .unwrap();
        caller
            .call::<_, OpenOut>("bla_open", &mut open_args(42), WAIT)
            .await
    });

    let outcome = shipper.process(WAIT).await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(client.await.unwrap().unwrap().event_id, 232);
    shipper.finalize().await.unwrap();
}

/// Full stack over a Unix domain socket.
#[cfg(unix)]
#[tokio::test]
async fn test_pipe_roundtrip() {
    use function_shipper::PipeNetwork;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shipper.sock");
    let network = PipeNetwork::bind(&path).unwrap();
    let mut shipper = Shipper::builder()
        .handle_typed("bla_open", bla_open)
        .start(network)
        .unwrap();

    let client_path = path.clone();
    let client = tokio::spawn(async move {
        let caller = Caller::connect_pipe(&client_path, ShipperConfig::default())
            .await
            .unwrap();
        caller
            .call::<_, OpenOut>("bla_open", &mut open_args(7), WAIT)
            .await
    });

    shipper.process(WAIT).await.unwrap();
    assert_eq!(client.await.unwrap().unwrap().event_id, 232);

    shipper.finalize().await.unwrap();
    assert!(!path.exists());
}

/// Calls still queued at finalize are dropped; their callers see the
/// connection close.
#[tokio::test]
async fn test_finalize_drops_queued_calls() {
    let (network, connector) = MemoryNetwork::new();
    let shipper = Shipper::builder()
        .handle_typed("bla_open", bla_open)
        .start(network)
        .unwrap();
    let caller = Caller::new(connector.connect().unwrap(), ShipperConfig::default());

    let client = tokio::spawn(async move {
        caller
            .call::<_, OpenOut>("bla_open", &mut open_args(1), WAIT)
            .await
    });

    while shipper.peer_count() == 0 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    shipper.finalize().await.unwrap();

    let err = client.await.unwrap().unwrap_err();
    assert!(err.is_transport());
}
