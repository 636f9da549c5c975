//! Integration tests for twiproxy

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use twiproxy::{
  Certificate, CertificateManager, HttpExchange, Inspection, MitmConfig, MitmProxy, RequestAction,
  RequestInterceptor, ResponseInterceptor, Result,
};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn temp_dir(name: &str) -> PathBuf {
  let dir = std::env::temp_dir().join(format!("twiproxy-it-{}-{}", name, std::process::id()));
  if dir.exists() {
    std::fs::remove_dir_all(&dir).ok();
  }
  dir
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
  Arc::new(rustls::crypto::ring::default_provider())
}

struct RunningProxy {
  addr: SocketAddr,
  proxy: MitmProxy,
  shutdown: Option<oneshot::Sender<()>>,
  dir: PathBuf,
}

impl RunningProxy {
  async fn start(name: &str, configure: impl FnOnce(&mut MitmConfig)) -> RunningProxy {
    let dir = temp_dir(name);
    let mut config = MitmConfig {
      listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
      ca_storage_path: dir.clone(),
      connect_timeout: Duration::from_secs(2),
      ..Default::default()
    };
    configure(&mut config);
    let proxy = MitmProxy::new(config).await.unwrap();
    let server = proxy.bind().await.unwrap();
    let addr = server.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(server.run_until(async {
      rx.await.ok();
    }));
    RunningProxy {
      addr,
      proxy,
      shutdown: Some(tx),
      dir,
    }
  }

  async fn add_request_interceptor(&self, interceptor: Arc<dyn RequestInterceptor>) {
    let handler = self.proxy.interceptor_handler();
    handler.write().await.add_request_interceptor(interceptor);
  }

  async fn add_response_interceptor(&self, interceptor: Arc<dyn ResponseInterceptor>) {
    let handler = self.proxy.interceptor_handler();
    handler.write().await.add_response_interceptor(interceptor);
  }

  /// rustls client config trusting this proxy's CA
  fn client_config(&self) -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots
      .add(self.proxy.cert_manager().authority().ca_cert_der().clone())
      .unwrap();
    let config = rustls::ClientConfig::builder_with_provider(provider())
      .with_safe_default_protocol_versions()
      .unwrap()
      .with_root_certificates(roots)
      .with_no_client_auth();
    Arc::new(config)
  }
}

impl Drop for RunningProxy {
  fn drop(&mut self) {
    if let Some(tx) = self.shutdown.take() {
      tx.send(()).ok();
    }
    std::fs::remove_dir_all(&self.dir).ok();
  }
}

/// Read one response: head as text, body by Content-Length
async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> (String, Vec<u8>) {
  let head = read_head(reader).await;
  let length = header(&head, "content-length")
    .map(|v| v.parse::<usize>().unwrap())
    .unwrap_or(0);
  let mut body = vec![0u8; length];
  reader.read_exact(&mut body).await.unwrap();
  (head, body)
}

async fn read_head<R: AsyncRead + Unpin>(reader: &mut R) -> String {
  let mut head = Vec::new();
  while !head.ends_with(b"\r\n\r\n") {
    let byte = reader.read_u8().await.unwrap();
    head.push(byte);
  }
  String::from_utf8(head).unwrap()
}

fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
  head.lines().find_map(|line| {
    let (key, value) = line.split_once(':')?;
    key.eq_ignore_ascii_case(name).then(|| value.trim())
  })
}

type Respond = Arc<dyn Fn(&str, &[u8]) -> Vec<u8> + Send + Sync>;

/// Minimal keep-alive HTTP/1.1 origin answering every request with `respond`
async fn serve_origin<S>(mut stream: S, respond: Respond)
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  loop {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
      match stream.read_u8().await {
        Ok(byte) => head.push(byte),
        Err(_) => return,
      }
    }
    let head = String::from_utf8(head).unwrap();
    let length = header(&head, "content-length")
      .map(|v| v.parse::<usize>().unwrap())
      .unwrap_or(0);
    let mut body = vec![0u8; length];
    if stream.read_exact(&mut body).await.is_err() {
      return;
    }
    let answer = respond(&head, &body);
    if stream.write_all(&answer).await.is_err() {
      return;
    }
    stream.flush().await.ok();
  }
}

async fn plain_origin(respond: Respond) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      tokio::spawn(serve_origin(stream, respond.clone()));
    }
  });
  addr
}

/// HTTPS origin for `localhost` with a leaf issued by `ca`
async fn tls_origin(ca: &CertificateManager, respond: Respond) -> u16 {
  let leaf = ca.issue_leaf("localhost").await.unwrap();
  let server_config = rustls::ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(leaf.cert_chain().to_vec(), leaf.private_key())
    .unwrap();
  let acceptor = TlsAcceptor::from(Arc::new(server_config));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      if let Ok(tls) = acceptor.accept(stream).await {
        tokio::spawn(serve_origin(tls, respond.clone()));
      }
    }
  });
  port
}

fn ok(body: &str) -> Vec<u8> {
  format!(
    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nX-Origin: yes\r\n\r\n{}",
    body.len(),
    body
  )
  .into_bytes()
}

async fn refused_port() -> u16 {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  drop(listener);
  port
}

/// Send CONNECT and complete a TLS handshake with the proxy as `host`
async fn tunnel(
  proxy: &RunningProxy,
  host: &str,
  port: u16,
) -> tokio_rustls::client::TlsStream<TcpStream> {
  let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
  let connect = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
  stream.write_all(connect.as_bytes()).await.unwrap();
  let head = read_head(&mut stream).await;
  assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

  let connector = TlsConnector::from(proxy.client_config());
  let name = ServerName::try_from(host.to_string()).unwrap();
  connector.connect(name, stream).await.unwrap()
}

#[tokio::test]
async fn test_ca_generation() {
  let dir = temp_dir("ca");
  let manager = CertificateManager::new(&dir, 3650 * DAY, 30 * DAY, 100)
    .await
    .unwrap();
  let pem = manager.ca_cert_pem();
  assert!(pem.contains("BEGIN CERTIFICATE"));
  assert!(manager.ca_cert_path().exists());

  let reloaded = CertificateManager::new(&dir, 3650 * DAY, 30 * DAY, 100)
    .await
    .unwrap();
  assert_eq!(reloaded.ca_cert_pem(), pem);

  let leaf = manager.issue_leaf("example.com").await.unwrap();
  assert_eq!(leaf.cert_chain().len(), 2);
  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn plain_request_round_trips_unchanged() {
  let seen = Arc::new(Mutex::new(String::new()));
  let recorded = seen.clone();
  let origin = plain_origin(Arc::new(move |head: &str, _: &[u8]| {
    *recorded.lock().unwrap() = head.to_string();
    ok("hello")
  }))
  .await;
  let proxy = RunningProxy::start("plain", |_| {}).await;

  let mut client = TcpStream::connect(proxy.addr).await.unwrap();
  let request = format!(
    "GET http://{origin}/path?q=1 HTTP/1.1\r\nHost: {origin}\r\nProxy-Connection: keep-alive\r\nConnection: close\r\n\r\n"
  );
  client.write_all(request.as_bytes()).await.unwrap();
  let (head, body) = read_response(&mut client).await;

  assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{}", head);
  assert_eq!(header(&head, "x-origin"), Some("yes"));
  assert_eq!(body, b"hello");

  let upstream_head = seen.lock().unwrap().clone();
  assert!(upstream_head.starts_with("GET /path?q=1 HTTP/1.1\r\n"), "{}", upstream_head);
  assert_eq!(header(&upstream_head, "host"), Some(origin.to_string().as_str()));
  assert_eq!(header(&upstream_head, "proxy-connection"), None);
}

struct Sequence {
  name: &'static str,
  counter: Arc<AtomicU64>,
}

#[async_trait::async_trait]
impl RequestInterceptor for Sequence {
  async fn intercept_request(&self, exchange: &mut HttpExchange) -> Result<RequestAction> {
    let n = self.counter.fetch_add(1, Ordering::SeqCst);
    let value = format!("{}-{}", self.name, n);
    exchange
      .request_mut()
      .headers_mut()
      .append("x-seq", value.parse().unwrap());
    Ok(RequestAction::Forward)
  }
}

struct Stamp;

#[async_trait::async_trait]
impl ResponseInterceptor for Stamp {
  async fn intercept_response(&self, exchange: &mut HttpExchange) -> Result<()> {
    if let Some(response) = exchange.response_mut() {
      response
        .headers_mut()
        .insert("x-intercepted", "1".parse().unwrap());
    }
    Ok(())
  }
}

#[tokio::test]
async fn https_tunnel_runs_hooks_in_order() {
  // origin with a certificate from a CA only the proxy trusts
  let origin_dir = temp_dir("origin-ca");
  let origin_ca = CertificateManager::new(&origin_dir, 365 * DAY, 30 * DAY, 10)
    .await
    .unwrap();
  let echo: Respond = Arc::new(|head: &str, _: &[u8]| {
    let seq: Vec<&str> = head
      .lines()
      .filter_map(|line| line.strip_prefix("x-seq: "))
      .collect();
    ok(&seq.join(","))
  });
  let origin_port = tls_origin(&origin_ca, echo).await;

  let trusted = Certificate::from_pem_bundle(origin_ca.ca_cert_pem().as_bytes()).unwrap();
  let proxy = RunningProxy::start("https", |config| config.extra_root_certs = trusted).await;
  let counter = Arc::new(AtomicU64::new(0));
  proxy
    .add_request_interceptor(Arc::new(Sequence {
      name: "first",
      counter: counter.clone(),
    }))
    .await;
  proxy
    .add_request_interceptor(Arc::new(Sequence {
      name: "second",
      counter: counter.clone(),
    }))
    .await;
  proxy.add_response_interceptor(Arc::new(Stamp)).await;

  let mut tls = tunnel(&proxy, "localhost", origin_port).await;
  for round in 0..2u64 {
    tls
      .write_all(b"GET /feed HTTP/1.1\r\nHost: localhost\r\n\r\n")
      .await
      .unwrap();
    let (head, body) = read_response(&mut tls).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"), "{}", head);
    assert_eq!(header(&head, "x-intercepted"), Some("1"));
    let expected = format!("first-{},second-{}", round * 2, round * 2 + 1);
    assert_eq!(String::from_utf8(body).unwrap(), expected);
  }
  std::fs::remove_dir_all(&origin_dir).ok();
}

#[tokio::test]
async fn tunnel_presents_leaf_for_connect_host() {
  let proxy = RunningProxy::start("leaf", |_| {}).await;
  let tls = tunnel(&proxy, "x.example", 443).await;

  let (_, session) = tls.get_ref();
  let presented = session.peer_certificates().unwrap();
  assert_eq!(presented.len(), 2);
  let leaf = proxy.proxy.cert_manager().issue_leaf("x.example").await.unwrap();
  assert_eq!(&presented[0], leaf.cert_der());
  assert_eq!(session.alpn_protocol(), None);
}

#[tokio::test]
async fn sni_mismatch_is_refused() {
  let proxy = RunningProxy::start("sni", |_| {}).await;
  let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
  stream
    .write_all(b"CONNECT x.example:443 HTTP/1.1\r\n\r\n")
    .await
    .unwrap();
  read_head(&mut stream).await;

  let connector = TlsConnector::from(proxy.client_config());
  let name = ServerName::try_from("evil.example").unwrap();
  assert!(connector.connect(name, stream).await.is_err());
}

#[tokio::test]
async fn unreachable_upstream_gets_502_and_connection_stays_usable() {
  let origin = plain_origin(Arc::new(|_: &str, body: &[u8]| ok(std::str::from_utf8(body).unwrap()))).await;
  let dead = refused_port().await;
  let proxy = RunningProxy::start("refused", |_| {}).await;

  let mut client = TcpStream::connect(proxy.addr).await.unwrap();
  let failing = format!("GET http://127.0.0.1:{dead}/ HTTP/1.1\r\nHost: 127.0.0.1:{dead}\r\n\r\n");
  client.write_all(failing.as_bytes()).await.unwrap();
  let (head, _) = read_response(&mut client).await;
  assert!(head.starts_with("HTTP/1.1 502 Bad Gateway"), "{}", head);

  let working = format!(
    "POST http://{origin}/echo HTTP/1.1\r\nHost: {origin}\r\nContent-Length: 4\r\n\r\nping"
  );
  client.write_all(working.as_bytes()).await.unwrap();
  let (head, body) = read_response(&mut client).await;
  assert!(head.starts_with("HTTP/1.1 200 OK"), "{}", head);
  assert_eq!(body, b"ping");
}

struct Inspect(Arc<Mutex<Option<(Inspection, Option<usize>)>>>);

#[async_trait::async_trait]
impl ResponseInterceptor for Inspect {
  fn needs_body(&self, _exchange: &HttpExchange) -> bool {
    true
  }

  async fn intercept_response(&self, exchange: &mut HttpExchange) -> Result<()> {
    let body_len = exchange
      .response()
      .and_then(|r| r.body())
      .map(|b| b.len());
    *self.0.lock().unwrap() = Some((exchange.inspection(), body_len));
    Ok(())
  }
}

#[tokio::test]
async fn oversized_body_is_relayed_unmodified() {
  let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
  let served = payload.clone();
  let origin = plain_origin(Arc::new(move |_: &str, _: &[u8]| {
    let mut answer = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", served.len()).into_bytes();
    answer.extend_from_slice(&served);
    answer
  }))
  .await;
  let proxy = RunningProxy::start("cap", |config| config.inspect_cap = 1024).await;
  let seen = Arc::new(Mutex::new(None));
  proxy.add_response_interceptor(Arc::new(Inspect(seen.clone()))).await;

  let mut client = TcpStream::connect(proxy.addr).await.unwrap();
  let request = format!("GET http://{origin}/big HTTP/1.1\r\nHost: {origin}\r\n\r\n");
  client.write_all(request.as_bytes()).await.unwrap();
  let (head, body) = read_response(&mut client).await;

  assert_eq!(header(&head, "content-length"), Some("4096"));
  assert_eq!(body, payload);
  assert_eq!(
    *seen.lock().unwrap(),
    Some((Inspection::Truncated { limit: 1024 }, None))
  );

  // a body under the cap is inspected in full on the same connection
  let small = plain_origin(Arc::new(|_: &str, _: &[u8]| ok("tiny"))).await;
  let request = format!("GET http://{small}/ HTTP/1.1\r\nHost: {small}\r\n\r\n");
  client.write_all(request.as_bytes()).await.unwrap();
  let (_, body) = read_response(&mut client).await;
  assert_eq!(body, b"tiny");
  assert_eq!(*seen.lock().unwrap(), Some((Inspection::Complete, Some(4))));
}

#[tokio::test]
async fn chunked_response_is_reframed_after_inspection() {
  let origin = plain_origin(Arc::new(|_: &str, _: &[u8]| {
    b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n".to_vec()
  }))
  .await;
  let proxy = RunningProxy::start("chunked", |_| {}).await;
  let seen = Arc::new(Mutex::new(None));
  proxy.add_response_interceptor(Arc::new(Inspect(seen.clone()))).await;

  let mut client = TcpStream::connect(proxy.addr).await.unwrap();
  let request = format!("GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n");
  client.write_all(request.as_bytes()).await.unwrap();
  let (head, body) = read_response(&mut client).await;

  assert_eq!(header(&head, "transfer-encoding"), None);
  assert_eq!(body, b"hello world");
  assert_eq!(*seen.lock().unwrap(), Some((Inspection::Complete, Some(11))));
}

#[tokio::test]
async fn concurrent_leaf_requests_share_one_certificate() {
  let dir = temp_dir("race");
  let manager = Arc::new(
    CertificateManager::new(&dir, 365 * DAY, 30 * DAY, 100)
      .await
      .unwrap(),
  );
  let tasks = (0..16).map(|_| {
    let manager = manager.clone();
    tokio::spawn(async move { manager.issue_leaf("race.example").await.unwrap() })
  });
  let leaves: Vec<_> = futures::future::join_all(tasks)
    .await
    .into_iter()
    .map(|leaf| leaf.unwrap())
    .collect();
  assert!(leaves.iter().all(|leaf| Arc::ptr_eq(leaf, &leaves[0])));
  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn origin_head_reaches_client_byte_for_byte() {
  let origin_response: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nSet-Cookie: a=1\r\nX-Other: z\r\nSet-Cookie: b=2\r\nContent-Length: 5\r\n\r\nhello";
  let origin = plain_origin(Arc::new(move |_: &str, _: &[u8]| origin_response.to_vec())).await;
  let proxy = RunningProxy::start("bytes", |_| {}).await;

  let mut client = TcpStream::connect(proxy.addr).await.unwrap();
  let request = format!("GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n");
  client.write_all(request.as_bytes()).await.unwrap();
  let mut out = vec![0u8; origin_response.len()];
  client.read_exact(&mut out).await.unwrap();
  assert_eq!(String::from_utf8_lossy(&out), String::from_utf8_lossy(origin_response));
}

#[tokio::test]
async fn untrusted_upstream_certificate_closes_the_tunnel() {
  // the proxy does not trust this CA
  let origin_dir = temp_dir("untrusted-ca");
  let origin_ca = CertificateManager::new(&origin_dir, 365 * DAY, 30 * DAY, 10)
    .await
    .unwrap();
  let origin_port = tls_origin(&origin_ca, Arc::new(|_: &str, _: &[u8]| ok("secret"))).await;
  let proxy = RunningProxy::start("untrusted", |_| {}).await;

  let mut tls = tunnel(&proxy, "localhost", origin_port).await;
  tls
    .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
    .await
    .ok();
  let mut out = Vec::new();
  // closed without a response, either cleanly or with an abrupt EOF
  let _ = tokio::time::timeout(Duration::from_secs(5), tls.read_to_end(&mut out))
    .await
    .expect("tunnel was not closed");
  assert!(out.is_empty(), "{}", String::from_utf8_lossy(&out));
  std::fs::remove_dir_all(&origin_dir).ok();
}

/// Origin that accepts connections and reads forever without answering
async fn silent_origin() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((mut stream, _)) = listener.accept().await {
      tokio::spawn(async move {
        let mut sink = Vec::new();
        stream.read_to_end(&mut sink).await.ok();
      });
    }
  });
  addr
}

#[tokio::test]
async fn silent_upstream_gets_504_and_connection_stays_usable() {
  let silent = silent_origin().await;
  let origin = plain_origin(Arc::new(|_: &str, _: &[u8]| ok("after"))).await;
  let proxy = RunningProxy::start("timeout", |config| {
    config.read_timeout = Duration::from_millis(300);
  })
  .await;

  let mut client = TcpStream::connect(proxy.addr).await.unwrap();
  let request = format!("GET http://{silent}/ HTTP/1.1\r\nHost: {silent}\r\n\r\n");
  client.write_all(request.as_bytes()).await.unwrap();
  let (head, _) = tokio::time::timeout(Duration::from_secs(5), read_response(&mut client))
    .await
    .expect("no answer within the read timeout");
  assert!(head.starts_with("HTTP/1.1 504 Gateway Timeout"), "{}", head);

  let request = format!("GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n");
  client.write_all(request.as_bytes()).await.unwrap();
  let (head, body) = read_response(&mut client).await;
  assert!(head.starts_with("HTTP/1.1 200 OK"), "{}", head);
  assert_eq!(body, b"after");
}

#[tokio::test]
async fn client_disconnect_closes_the_upstream() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin = listener.local_addr().unwrap();
  let (head_tx, head_rx) = oneshot::channel::<()>();
  let (eof_tx, eof_rx) = oneshot::channel::<std::io::Result<usize>>();
  tokio::spawn(async move {
    let (mut stream, _) = listener.accept().await.unwrap();
    let head = read_head(&mut stream).await;
    assert!(head.starts_with("GET /slow"), "{}", head);
    head_tx.send(()).ok();
    let mut buf = [0u8; 16];
    eof_tx.send(stream.read(&mut buf).await).ok();
  });
  let proxy = RunningProxy::start("cancel", |_| {}).await;

  let mut client = TcpStream::connect(proxy.addr).await.unwrap();
  let request = format!("GET http://{origin}/slow HTTP/1.1\r\nHost: {origin}\r\n\r\n");
  client.write_all(request.as_bytes()).await.unwrap();
  head_rx.await.unwrap();
  drop(client);

  let seen = tokio::time::timeout(Duration::from_secs(5), eof_rx)
    .await
    .expect("upstream still open after the client left")
    .unwrap();
  assert_eq!(seen.unwrap(), 0);
}

#[tokio::test]
async fn large_chunked_request_is_streamed_unchanged() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin = listener.local_addr().unwrap();
  let (seen_tx, seen_rx) = oneshot::channel::<(String, Vec<u8>)>();
  tokio::spawn(async move {
    let (mut stream, _) = listener.accept().await.unwrap();
    let head = read_head(&mut stream).await;
    let mut body = Vec::new();
    while !body.ends_with(b"0\r\n\r\n") {
      body.push(stream.read_u8().await.unwrap());
    }
    stream.write_all(&ok("stored")).await.unwrap();
    seen_tx.send((head, body)).ok();
  });
  let proxy = RunningProxy::start("chunked-up", |config| config.stream_threshold = 64).await;

  let mut chunked = Vec::new();
  for chunk in [vec![b'a'; 100], vec![b'b'; 150], vec![b'c'; 7]] {
    chunked.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
    chunked.extend_from_slice(&chunk);
    chunked.extend_from_slice(b"\r\n");
  }
  chunked.extend_from_slice(b"0\r\n\r\n");

  let mut client = TcpStream::connect(proxy.addr).await.unwrap();
  let head = format!(
    "POST http://{origin}/upload HTTP/1.1\r\nHost: {origin}\r\nTransfer-Encoding: chunked\r\n\r\n"
  );
  client.write_all(head.as_bytes()).await.unwrap();
  client.write_all(&chunked).await.unwrap();
  let (response, body) = read_response(&mut client).await;
  assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
  assert_eq!(body, b"stored");

  let (upstream_head, upstream_body) = seen_rx.await.unwrap();
  assert_eq!(header(&upstream_head, "transfer-encoding"), Some("chunked"));
  assert_eq!(header(&upstream_head, "content-length"), None);
  assert_eq!(upstream_body, chunked);
}

#[tokio::test]
async fn expect_continue_is_answered_before_the_body() {
  let seen = Arc::new(Mutex::new(String::new()));
  let recorded = seen.clone();
  let origin = plain_origin(Arc::new(move |head: &str, body: &[u8]| {
    *recorded.lock().unwrap() = head.to_string();
    ok(std::str::from_utf8(body).unwrap())
  }))
  .await;
  let proxy = RunningProxy::start("continue", |_| {}).await;

  let mut client = TcpStream::connect(proxy.addr).await.unwrap();
  let head = format!(
    "POST http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\nExpect: 100-continue\r\nContent-Length: 4\r\n\r\n"
  );
  client.write_all(head.as_bytes()).await.unwrap();
  let interim = tokio::time::timeout(Duration::from_secs(5), read_head(&mut client))
    .await
    .expect("no 100 Continue");
  assert_eq!(interim, "HTTP/1.1 100 Continue\r\n\r\n");

  client.write_all(b"ping").await.unwrap();
  let (response, body) = read_response(&mut client).await;
  assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
  assert_eq!(body, b"ping");
  assert_eq!(header(&seen.lock().unwrap(), "expect"), None);
}
