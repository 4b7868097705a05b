
use std::sync::Arc;

use harness::{free_port, CountingIssuer, ProxyHandle, TcpEchoBackend, TEST_TIMEOUT};
use plfm_router::{
    ListenScheme, Proxy, ProxyError, ProxyOptions, ResponseHead, Router, ServeState,
    StaticTarget,
};
use reqwest::Url;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_test::assert_ok;

fn tcp_proxy(listen: &str, backend: &TcpEchoBackend) -> Proxy {
    Proxy::new(
        "app.example.test",
        Url::parse(listen).unwrap(),
        Arc::new(StaticTarget::new(backend.url())),
        Arc::new(CountingIssuer::new()),
    )
}

#[tokio::test]
async fn unsupported_scheme_binds_nothing() {
    let port = free_port().await;
    let proxy = Arc::new(Proxy::new(
        "app.example.test",
        Url::parse(&format!("udp://127.0.0.1:{port}")).unwrap(),
        Arc::new(StaticTarget::parse("tcp://127.0.0.1:1").unwrap()),
        Arc::new(CountingIssuer::new()),
    ));

    let err = Arc::clone(&proxy).serve().await.unwrap_err();
    assert!(matches!(err, ProxyError::UnsupportedScheme(ref s) if s == "udp"));
    assert_eq!(err.to_string(), "unknown listener scheme: udp");
    assert_eq!(proxy.state(), ServeState::Stopped);

    TcpListener::bind(("127.0.0.1", port)).await.unwrap();
}

#[tokio::test]
async fn close_returns_ok() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(tcp_proxy("tcp://127.0.0.1:0", &backend))
        .await
        .unwrap();
    let addr = proxy.addr;

    assert_ok!(proxy.proxy.close());
    let result = timeout(TEST_TIMEOUT, proxy.serving)
        .await
        .expect("serve did not return")
        .unwrap();
    assert_ok!(result);
    assert_eq!(proxy.proxy.state(), ServeState::Stopped);

    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn terminate_surfaces_listener_closed() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(tcp_proxy("tcp://127.0.0.1:0", &backend))
        .await
        .unwrap();

    assert_ok!(proxy.proxy.terminate());
    let result = timeout(TEST_TIMEOUT, proxy.serving)
        .await
        .expect("serve did not return")
        .unwrap();
    assert!(matches!(result, Err(ProxyError::ListenerClosed)));
    assert_eq!(
        result.unwrap_err().to_string(),
        "use of closed network listener"
    );
}

#[tokio::test]
async fn terminate_surfaces_listener_closed_in_http_mode() {
    let proxy = ProxyHandle::spawn_with(
        "http://127.0.0.1:0",
        Arc::new(StaticTarget::parse("http://127.0.0.1:1/").unwrap()),
    )
    .await
    .unwrap();
    let addr = proxy.addr;

    assert_ok!(proxy.proxy.terminate());
    let result = timeout(TEST_TIMEOUT, proxy.serving)
        .await
        .expect("serve did not return")
        .unwrap();
    assert!(matches!(result, Err(ProxyError::ListenerClosed)));
    assert_eq!(proxy.proxy.state(), ServeState::Stopped);
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn close_returns_ok_in_http_mode() {
    let proxy = ProxyHandle::spawn_with(
        "http://127.0.0.1:0",
        Arc::new(StaticTarget::parse("http://127.0.0.1:1/").unwrap()),
    )
    .await
    .unwrap();

    assert_ok!(proxy.proxy.close());
    let result = timeout(TEST_TIMEOUT, proxy.serving)
        .await
        .expect("serve did not return")
        .unwrap();
    assert_ok!(result);
    assert!(matches!(
        proxy.proxy.terminate(),
        Err(ProxyError::ListenerClosed)
    ));
}

#[tokio::test]
async fn shutdown_after_stop_is_an_error() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(tcp_proxy("tcp://127.0.0.1:0", &backend))
        .await
        .unwrap();
    let inner = Arc::clone(&proxy.proxy);

    proxy.close().await.unwrap();
    assert!(matches!(inner.close(), Err(ProxyError::ListenerClosed)));
    assert!(matches!(inner.terminate(), Err(ProxyError::ListenerClosed)));
}

#[tokio::test]
async fn close_before_serve_is_not_serving() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = tcp_proxy("tcp://127.0.0.1:0", &backend);

    assert!(matches!(proxy.close(), Err(ProxyError::NotServing)));
    assert!(matches!(proxy.terminate(), Err(ProxyError::NotServing)));
}

#[tokio::test]
async fn in_flight_relay_survives_close() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(tcp_proxy("tcp://127.0.0.1:0", &backend))
        .await
        .unwrap();

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream.write_all(b"before").await.unwrap();
    let mut buf = [0u8; 6];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"before");

    proxy.close().await.unwrap();

    stream.write_all(b"after!").await.unwrap();
    timeout(TEST_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("relay stopped with the listener")
        .unwrap();
    assert_eq!(&buf, b"after!");
}

#[tokio::test]
async fn bind_conflict_is_reported() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = Arc::new(tcp_proxy(&format!("tcp://127.0.0.1:{port}"), &backend));

    let err = Arc::clone(&proxy).serve().await.unwrap_err();
    assert!(matches!(err, ProxyError::Bind { .. }), "got {err:?}");
    assert_eq!(err.reason_code(), "bind_failed");
    assert!(matches!(
        proxy.wait_bound().await,
        Err(ProxyError::NotServing)
    ));
}

#[tokio::test]
async fn router_builds_proxies_with_shared_options() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let router = Router::new(Arc::new(CountingIssuer::new())).with_options(ProxyOptions {
        response_head: ResponseHead::BodyOnly,
        ..ProxyOptions::default()
    });

    let tcp = router.new_proxy(
        "a.example.test",
        Url::parse("tcp://127.0.0.1:0").unwrap(),
        Arc::new(StaticTarget::new(backend.url())),
        None,
    );
    let http = router.new_proxy(
        "b.example.test",
        Url::parse("http://127.0.0.1:0").unwrap(),
        Arc::new(StaticTarget::parse("http://127.0.0.1:1/").unwrap()),
        None,
    );

    assert_eq!(tcp.hostname(), "a.example.test");
    assert_eq!(http.hostname(), "b.example.test");
    assert_eq!(tcp.options().response_head, ResponseHead::BodyOnly);
    assert_eq!(
        http.listen().scheme().parse::<ListenScheme>().unwrap(),
        ListenScheme::Http
    );

    let serving = tokio::spawn(Arc::clone(&tcp).serve());
    let addr = tcp.wait_bound().await.unwrap();
    assert_eq!(tcp.local_addr(), Some(addr));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"ok").await.unwrap();
    let mut buf = [0u8; 2];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ok");

    tcp.close().unwrap();
    serving.await.unwrap().unwrap();
}
