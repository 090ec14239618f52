
use std::net::SocketAddr;

use harness::{builder, connect_when_ready, free_port, BridgeHandle, TcpEchoBackend};
use hopbridge::{AggregateDialError, HopGroup};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn dead_endpoint_is_skipped() {
    let echo = TcpEchoBackend::spawn().await.unwrap();
    let live = free_port().await;
    let dead = free_port().await;
    let _socks = BridgeHandle::spawn_args(&[&format!("socks5://127.0.0.1:{live}")], &["-"]);
    let live_addr: SocketAddr = ([127, 0, 0, 1], live).into();
    drop(connect_when_ready(live_addr).await.unwrap());

    let group = format!("socks5://127.0.0.1:{dead}|socks5://127.0.0.1:{live}");
    let hop = builder()
        .dial_chain(&[HopGroup::parse(&group)])
        .await
        .unwrap();

    for round in 0..4u8 {
        let mut conn = hop.dial("tcp", &echo.addr.to_string()).await.unwrap();
        conn.write_all(&[round]).await.unwrap();
        let mut buf = [0u8; 1];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], round);
    }
    assert_eq!(echo.connection_count(), 4);
}

#[tokio::test]
async fn exhausted_group_reports_every_attempt() {
    let mut specs = Vec::new();
    for _ in 0..3 {
        specs.push(format!("socks5://127.0.0.1:{}", free_port().await));
    }
    let hop = builder()
        .dial_chain(&[HopGroup {
            lb: specs,
            probe: None,
        }])
        .await
        .unwrap();

    let err = match hop.dial("tcp", "127.0.0.1:9").await {
        Ok(_) => panic!("dial through dead proxies succeeded"),
        Err(err) => err,
    };
    let aggregate = AggregateDialError::from_io(&err).expect("aggregate error");
    // three endpoints allow 3 / 2 + 1 attempts
    assert_eq!(aggregate.errors.len(), 2);
}
