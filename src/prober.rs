//! Staged edge probe: TCP connect → TLS handshake → TTFB → download speed
//!
//! One [`Prober`] is shared (cheaply cloned) by every worker task. A probe of
//! one address runs `test_times` sequential trials and folds them into a
//! [`ProbeResult`] or a [`Rejection`].
//!
//! Every stream a trial opens is owned by that trial and dropped, which
//! closes the socket, before the trial returns, whichever stage it stopped at.

use crate::models::{FailurePolicy, ProbeResult, ScanConfig, Trial};
use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{
    ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;
const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Tcp,
    Tls,
    Ttfb,
    Download,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Tcp => "TCP",
            Stage::Tls => "TLS",
            Stage::Ttfb => "TTFB",
            Stage::Download => "下载",
        };
        f.write_str(name)
    }
}

/// Failure of one stage within a trial. Never leaves the worker.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("TCP 连接失败: {0}")]
    Connect(io::Error),
    #[error("{0} 超时")]
    Timeout(Stage),
    #[error("TLS 握手失败: {0}")]
    Tls(io::Error),
    #[error("HTTP 请求失败: {0}")]
    Http(io::Error),
}

/// Why a candidate is left out of the ranking
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Rejection {
    #[error("全部测试失败")]
    Unreachable,
    #[error("丢包率 {loss:.2} 超过阈值")]
    LossAboveThreshold { loss: f64 },
}

#[derive(Error, Debug)]
pub enum ProbeSetupError {
    #[error("无效的测速域名 '{0}'")]
    InvalidHost(String),
    #[error("TLS 配置失败: {0}")]
    Tls(#[from] rustls::Error),
}

/// The network seam the probe runs over.
///
/// Production code uses [`TlsTransport`]; tests substitute in-memory streams.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Tcp: Send + 'static;
    type Tls: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self, addr: SocketAddr) -> io::Result<Self::Tcp>;

    /// Consumes the TCP stream; on error it is dropped (closed) here.
    async fn handshake(&self, stream: Self::Tcp) -> io::Result<Self::Tls>;
}

/// Accepts any server certificate. The probe measures reachability and
/// speed of an address, not whether it can be trusted.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Real TCP + rustls transport, SNI fixed to the probe host
#[derive(Clone)]
pub struct TlsTransport {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsTransport {
    pub fn new(host: &str) -> Result<Self, ProbeSetupError> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ProbeSetupError::InvalidHost(host.to_string()))?;

        // Pre-create TLS configuration (reused across all connections)
        let provider = Arc::new(ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth();

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }
}

#[async_trait]
impl Transport for TlsTransport {
    type Tcp = TcpStream;
    type Tls = TlsStream<TcpStream>;

    async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn handshake(&self, stream: TcpStream) -> io::Result<Self::Tls> {
        self.connector
            .connect(self.server_name.clone(), stream)
            .await
    }
}

/// Immutable per-run probe parameters
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub port: u16,
    pub timeout: Duration,
    pub test_times: u32,
    pub download_size: usize,
    pub host: String,
    pub max_loss: f64,
    pub failure_policy: FailurePolicy,
    pub log_rejections: bool,
}

impl From<&ScanConfig> for ProbeSettings {
    fn from(config: &ScanConfig) -> Self {
        Self {
            port: config.port,
            timeout: config.timeout(),
            test_times: config.test_times.max(1),
            download_size: config.download_size.max(1),
            host: config.host.clone(),
            max_loss: config.max_loss,
            failure_policy: config.failure_policy,
            log_rejections: config.log_rejections,
        }
    }
}

impl ProbeSettings {
    /// Minimal GET for the fixed-size speed-test resource
    pub fn request(&self) -> String {
        format!(
            "GET /__down?bytes={} HTTP/1.1\r\nHost: {}\r\nUser-Agent: edgescan/{}\r\nConnection: close\r\n\r\n",
            self.download_size,
            self.host,
            env!("CARGO_PKG_VERSION")
        )
    }
}

/// Running sums over the trials that reached each stage
#[derive(Debug, Default)]
struct TrialStats {
    tcp: Mean,
    tls: Mean,
    ttfb: Mean,
    throughput: Mean,
}

#[derive(Debug, Default)]
struct Mean {
    sum: f64,
    count: u32,
}

impl Mean {
    fn push(&mut self, value: Option<f64>) {
        if let Some(v) = value {
            self.sum += v;
            self.count += 1;
        }
    }

    /// A stage never reached reports 0
    fn value(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

impl TrialStats {
    fn record(&mut self, trial: &Trial) {
        self.tcp.push(trial.tcp_ms);
        self.tls.push(trial.tls_ms);
        self.ttfb.push(trial.ttfb_ms);
        self.throughput.push(trial.throughput);
    }

    fn finish(&self, address: IpAddr, loss_ratio: f64) -> ProbeResult {
        ProbeResult {
            address,
            tcp_ms: self.tcp.value(),
            tls_ms: self.tls.value(),
            ttfb_ms: self.ttfb.value(),
            throughput: self.throughput.value(),
            loss_ratio,
        }
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Bound one blocking operation; expiry surfaces as `TimedOut`.
async fn bounded<F, R>(limit: Duration, op: F) -> io::Result<R>
where
    F: std::future::Future<Output = io::Result<R>>,
{
    timeout(limit, op)
        .await
        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "读取超时")))
}

/// Send the request and wait for the first response byte. The send and the
/// first receive are each bounded by `limit`.
/// Returns how many bytes that first read delivered.
pub async fn first_byte<S>(
    stream: &mut S,
    request: &[u8],
    buf: &mut [u8],
    limit: Duration,
) -> io::Result<usize>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    bounded(limit, async {
        stream.write_all(request).await?;
        stream.flush().await
    })
    .await?;
    let n = bounded(limit, stream.read(buf)).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "首字节前连接已关闭",
        ));
    }
    Ok(n)
}

/// Keep reading until `target` bytes in total or the peer closes; every
/// receive is bounded by `limit` on its own.
/// Returns the total including the `already` bytes from the first read.
pub async fn read_body<S>(
    stream: &mut S,
    buf: &mut [u8],
    already: usize,
    target: usize,
    limit: Duration,
) -> io::Result<usize>
where
    S: AsyncRead + Unpin,
{
    let mut total = already;
    while total < target {
        match bounded(limit, stream.read(buf)).await {
            Ok(0) => break,
            Ok(n) => total += n,
            // Peers that close without close_notify
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

fn http_error(stage: Stage, e: io::Error) -> StageError {
    if e.kind() == io::ErrorKind::TimedOut {
        StageError::Timeout(stage)
    } else {
        StageError::Http(e)
    }
}

pub struct Prober<T: Transport> {
    transport: Arc<T>,
    settings: Arc<ProbeSettings>,
    request: Arc<[u8]>,
}

impl<T: Transport> Clone for Prober<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            settings: self.settings.clone(),
            request: self.request.clone(),
        }
    }
}

impl Prober<TlsTransport> {
    pub fn new(settings: ProbeSettings) -> Result<Self, ProbeSetupError> {
        let transport = TlsTransport::new(&settings.host)?;
        Ok(Self::with_transport(settings, transport))
    }
}

impl<T: Transport> Prober<T> {
    pub fn with_transport(settings: ProbeSettings, transport: T) -> Self {
        let request: Arc<[u8]> = settings.request().into_bytes().into();
        Self {
            transport: Arc::new(transport),
            settings: Arc::new(settings),
            request,
        }
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Probe one candidate with `test_times` sequential trials.
    pub async fn probe(&self, ip: IpAddr) -> Result<ProbeResult, Rejection> {
        let addr = SocketAddr::new(ip, self.settings.port);
        let test_times = self.settings.test_times;
        let policy = self.settings.failure_policy;
        let mut stats = TrialStats::default();
        let mut failures = 0u32;
        let mut connected = 0u32;

        for round in 0..test_times {
            let trial = self.run_trial(addr).await;
            if !policy.accepts(&trial) {
                failures += 1;
                debug!("{} 第 {} 轮失败 ({}/{})", ip, round + 1, failures, test_times);
                if failures >= test_times {
                    return self.reject(ip, Rejection::Unreachable);
                }
                continue;
            }
            if trial.connected() {
                connected += 1;
            }
            stats.record(&trial);
        }

        if connected == 0 {
            return self.reject(ip, Rejection::Unreachable);
        }

        let loss = failures as f64 / test_times as f64;
        if loss > self.settings.max_loss {
            return self.reject(ip, Rejection::LossAboveThreshold { loss });
        }

        Ok(stats.finish(ip, loss))
    }

    fn reject(&self, ip: IpAddr, rejection: Rejection) -> Result<ProbeResult, Rejection> {
        if self.settings.log_rejections {
            info!("[--] {} {}", ip, rejection);
        } else {
            debug!("[--] {} {}", ip, rejection);
        }
        Err(rejection)
    }

    /// One full trial. Stages after TCP are best-effort: the first failing
    /// stage ends the trial but keeps what was measured so far.
    pub async fn run_trial(&self, addr: SocketAddr) -> Trial {
        let mut trial = Trial::default();
        if let Err(e) = self.staged(addr, &mut trial).await {
            debug!("{} {}", addr, e);
        }
        trial
    }

    async fn staged(&self, addr: SocketAddr, trial: &mut Trial) -> Result<(), StageError> {
        let limit = self.settings.timeout;

        let start = Instant::now();
        let tcp = timeout(limit, self.transport.connect(addr))
            .await
            .map_err(|_| StageError::Timeout(Stage::Tcp))?
            .map_err(StageError::Connect)?;
        trial.tcp_ms = Some(elapsed_ms(start));

        let start = Instant::now();
        let mut tls = timeout(limit, self.transport.handshake(tcp))
            .await
            .map_err(|_| StageError::Timeout(Stage::Tls))?
            .map_err(StageError::Tls)?;
        trial.tls_ms = Some(elapsed_ms(start));

        let mut buf = vec![0u8; READ_CHUNK];
        let start = Instant::now();
        let first = first_byte(&mut tls, &self.request, &mut buf, limit)
            .await
            .map_err(|e| http_error(Stage::Ttfb, e))?;
        trial.ttfb_ms = Some(elapsed_ms(start));

        let start = Instant::now();
        let received = read_body(&mut tls, &mut buf, first, self.settings.download_size, limit)
            .await
            .map_err(|e| http_error(Stage::Download, e))?;
        let seconds = start.elapsed().as_secs_f64();
        // 首包之后没有再收到数据时不计速度
        if received > first && seconds > 0.0 {
            trial.throughput = Some(received as f64 / seconds / BYTES_PER_MIB);
        }
        trial.completed = true;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::io::DuplexStream;
    use tokio::sync::oneshot;
    use tokio::time::sleep;

    /// Scripted behaviour of one address for one trial
    #[derive(Debug, Clone)]
    pub(crate) struct Plan {
        pub tcp: Option<u64>,
        pub tls: Option<u64>,
        pub ttfb: Option<u64>,
        /// Pause before each body chunk
        pub transfer: u64,
        /// Bytes per body chunk
        pub body: usize,
        pub chunks: usize,
    }

    impl Plan {
        pub(crate) fn ok(tcp: u64, tls: u64, ttfb: u64, transfer: u64) -> Self {
            Self {
                tcp: Some(tcp),
                tls: Some(tls),
                ttfb: Some(ttfb),
                transfer,
                body: 4096,
                chunks: 1,
            }
        }

        /// Steady body of `chunks` × `chunk` bytes, `gap` ms apart
        pub(crate) fn streaming(chunk: usize, chunks: usize, gap: u64) -> Self {
            Self {
                body: chunk,
                chunks,
                ..Self::ok(1, 1, 1, gap)
            }
        }

        pub(crate) fn refused() -> Self {
            Self {
                tcp: None,
                tls: None,
                ttfb: None,
                transfer: 0,
                body: 0,
                chunks: 0,
            }
        }

        pub(crate) fn tcp_only(tcp: u64) -> Self {
            Self {
                tcp: Some(tcp),
                ..Self::refused()
            }
        }
    }

    /// In-memory transport. Each address has a queue of per-trial plans; the
    /// last plan repeats once the queue is down to one entry.
    #[derive(Default)]
    pub(crate) struct MockTransport {
        plans: Mutex<HashMap<IpAddr, Vec<Plan>>>,
        /// One flag per accepted connection, set once the server half reads EOF
        closed: Mutex<Vec<Arc<AtomicBool>>>,
    }

    pub(crate) struct MockConn {
        stream: DuplexStream,
        tls: Option<u64>,
    }

    impl MockTransport {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn plan(self, ip: &str, plans: Vec<Plan>) -> Self {
            self.plans.lock().unwrap().insert(ip.parse().unwrap(), plans);
            self
        }

        fn next_plan(&self, ip: IpAddr) -> Plan {
            let mut plans = self.plans.lock().unwrap();
            match plans.get_mut(&ip) {
                Some(queue) if queue.len() > 1 => queue.remove(0),
                Some(queue) => queue[0].clone(),
                None => Plan::refused(),
            }
        }

        pub(crate) fn closed(&self) -> Vec<bool> {
            self.closed
                .lock()
                .unwrap()
                .iter()
                .map(|flag| flag.load(Ordering::SeqCst))
                .collect()
        }
    }

    async fn respond<W: AsyncWrite + Unpin>(wr: &mut W, plan: &Plan) -> io::Result<()> {
        let Some(ttfb) = plan.ttfb else {
            return Ok(());
        };
        sleep(Duration::from_millis(ttfb)).await;
        wr.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
        for _ in 0..plan.chunks {
            sleep(Duration::from_millis(plan.transfer)).await;
            wr.write_all(&vec![b'x'; plan.body]).await?;
        }
        Ok(())
    }

    /// Server half: answers once the request is complete, then shuts its
    /// write side. The read side keeps running until the client goes away.
    async fn serve(server: DuplexStream, plan: Plan, closed: Arc<AtomicBool>) {
        let (mut rd, mut wr) = tokio::io::split(server);
        let (ready_tx, ready_rx) = oneshot::channel::<()>();

        let reader = async move {
            let mut ready = Some(ready_tx);
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                match rd.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        request.extend_from_slice(&buf[..n]);
                        if request.windows(4).any(|w| w == b"\r\n\r\n") {
                            if let Some(tx) = ready.take() {
                                let _ = tx.send(());
                            }
                        }
                    }
                }
            }
            closed.store(true, Ordering::SeqCst);
        };

        let writer = async move {
            if ready_rx.await.is_ok() {
                let _ = respond(&mut wr, &plan).await;
            }
            let _ = wr.shutdown().await;
        };

        tokio::join!(reader, writer);
    }

    #[async_trait]
    impl Transport for MockTransport {
        type Tcp = MockConn;
        type Tls = DuplexStream;

        async fn connect(&self, addr: SocketAddr) -> io::Result<MockConn> {
            let plan = self.next_plan(addr.ip());
            let Some(tcp) = plan.tcp else {
                sleep(Duration::from_millis(1)).await;
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            };
            sleep(Duration::from_millis(tcp)).await;
            let (client, server) = tokio::io::duplex(64 * 1024);
            let tls = plan.tls;
            let closed = Arc::new(AtomicBool::new(false));
            self.closed.lock().unwrap().push(closed.clone());
            tokio::spawn(serve(server, plan, closed));
            Ok(MockConn {
                stream: client,
                tls,
            })
        }

        async fn handshake(&self, conn: MockConn) -> io::Result<DuplexStream> {
            match conn.tls {
                Some(ms) => {
                    sleep(Duration::from_millis(ms)).await;
                    Ok(conn.stream)
                }
                None => Err(io::Error::new(io::ErrorKind::InvalidData, "handshake failed")),
            }
        }
    }

    pub(crate) fn settings(test_times: u32, max_loss: f64) -> ProbeSettings {
        ProbeSettings {
            port: 443,
            timeout: Duration::from_millis(1000),
            test_times,
            download_size: 200 * 1024,
            host: "speed.cloudflare.com".into(),
            max_loss,
            failure_policy: FailurePolicy::Tolerant,
            log_rejections: false,
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1.0
    }

    #[test]
    fn test_request_format() {
        let request = settings(2, 0.3).request();
        assert!(request.starts_with("GET /__down?bytes=204800 HTTP/1.1\r\n"));
        assert!(request.contains("Host: speed.cloudflare.com\r\n"));
        assert!(request.contains("Connection: close\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(Rejection::Unreachable.to_string(), "全部测试失败");
        assert_eq!(
            Rejection::LossAboveThreshold { loss: 0.5 }.to_string(),
            "丢包率 0.50 超过阈值"
        );
        assert_eq!(StageError::Timeout(Stage::Download).to_string(), "下载 超时");
        assert_eq!(
            http_error(Stage::Ttfb, io::ErrorKind::TimedOut.into()).to_string(),
            "TTFB 超时"
        );
    }

    #[test]
    fn test_tls_transport_rejects_invalid_host() {
        assert!(matches!(
            TlsTransport::new("not a host name"),
            Err(ProbeSetupError::InvalidHost(_))
        ));
        assert!(TlsTransport::new("speed.cloudflare.com").is_ok());
    }

    #[test]
    fn test_mean_of_unreached_stage_is_zero() {
        let mut stats = TrialStats::default();
        stats.record(&Trial {
            tcp_ms: Some(10.0),
            ..Default::default()
        });
        stats.record(&Trial {
            tcp_ms: Some(20.0),
            tls_ms: Some(30.0),
            ..Default::default()
        });

        let result = stats.finish("192.0.2.1".parse().unwrap(), 0.0);
        assert_eq!(result.tcp_ms, 15.0);
        assert_eq!(result.tls_ms, 30.0);
        assert_eq!(result.ttfb_ms, 0.0);
        assert_eq!(result.throughput, 0.0);
    }

    #[tokio::test]
    async fn test_first_byte_and_read_body_with_scripted_stream() {
        let request = settings(1, 0.0).request();
        let mut stream = tokio_test::io::Builder::new()
            .write(request.as_bytes())
            .read(b"HTTP/1.1 200 OK\r\n\r\n")
            .read(&[b'x'; 100])
            .read(&[b'x'; 50])
            .build();

        let mut buf = vec![0u8; READ_CHUNK];
        let first = first_byte(&mut stream, request.as_bytes(), &mut buf, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(first, 19);

        let total = read_body(&mut stream, &mut buf, first, 10_000, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(total, 169);
    }

    #[tokio::test]
    async fn test_read_body_stops_at_limit() {
        let mut stream = tokio_test::io::Builder::new()
            .read(&[b'x'; 100])
            .read(&[b'x'; 100])
            .build();

        let mut buf = vec![0u8; READ_CHUNK];
        let total = read_body(&mut stream, &mut buf, 0, 150, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(total, 200);
    }

    #[tokio::test]
    async fn test_first_byte_fails_on_immediate_close() {
        let request = b"GET / HTTP/1.1\r\n\r\n";
        let mut stream = tokio_test::io::Builder::new().write(request).build();

        let mut buf = vec![0u8; 16];
        let err = first_byte(&mut stream, request, &mut buf, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_records_every_stage() {
        let transport = MockTransport::new().plan("192.0.2.1", vec![Plan::ok(10, 20, 30, 40)]);
        let prober = Prober::with_transport(settings(1, 0.0), transport);

        let trial = prober.run_trial("192.0.2.1:443".parse().unwrap()).await;

        assert!(trial.completed);
        assert!(approx(trial.tcp_ms.unwrap(), 10.0));
        assert!(approx(trial.tls_ms.unwrap(), 20.0));
        assert!(approx(trial.ttfb_ms.unwrap(), 30.0));
        assert!(trial.throughput.unwrap() > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_keeps_tcp_when_tls_fails() {
        let transport = MockTransport::new().plan("192.0.2.1", vec![Plan::tcp_only(15)]);
        let prober = Prober::with_transport(settings(1, 0.0), transport);

        let trial = prober.run_trial("192.0.2.1:443".parse().unwrap()).await;

        assert!(trial.connected());
        assert!(approx(trial.tcp_ms.unwrap(), 15.0));
        assert!(trial.tls_ms.is_none());
        assert!(trial.ttfb_ms.is_none());
        assert!(trial.throughput.is_none());
        assert!(!trial.completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_times_out_slow_connect() {
        let transport = MockTransport::new().plan("192.0.2.1", vec![Plan::ok(5000, 1, 1, 1)]);
        let prober = Prober::with_transport(settings(1, 0.0), transport);

        let trial = prober.run_trial("192.0.2.1:443".parse().unwrap()).await;

        assert!(!trial.connected());
        assert_eq!(trial, Trial::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_throughput_when_body_arrives_with_first_byte() {
        let plan = Plan {
            body: 0,
            ..Plan::ok(10, 10, 10, 0)
        };
        let transport = MockTransport::new().plan("192.0.2.1", vec![plan]);
        let prober = Prober::with_transport(settings(1, 0.0), transport);

        let trial = prober.run_trial("192.0.2.1:443".parse().unwrap()).await;

        assert!(trial.ttfb_ms.is_some());
        assert!(trial.throughput.is_none());
        assert!(trial.completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_throughput_when_first_read_covers_download_size() {
        let transport = MockTransport::new().plan("192.0.2.1", vec![Plan::ok(10, 10, 10, 10)]);
        let mut small = settings(1, 0.0);
        small.download_size = 10;
        let prober = Prober::with_transport(small, transport);

        let trial = prober.run_trial("192.0.2.1:443".parse().unwrap()).await;

        // The 19-byte response head already exceeds the target
        assert!(trial.completed);
        assert!(trial.throughput.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_steady_download_is_measured() {
        // 10 × 20 KiB, 200 ms apart: 2 s in total, each receive well inside 1 s
        let transport =
            MockTransport::new().plan("192.0.2.1", vec![Plan::streaming(20 * 1024, 10, 200)]);
        let prober = Prober::with_transport(settings(1, 0.0), transport);

        let trial = prober.run_trial("192.0.2.1:443".parse().unwrap()).await;

        assert!(trial.completed);
        let throughput = trial.throughput.unwrap();
        let expected = (200 * 1024 + 19) as f64 / 2.0 / BYTES_PER_MIB;
        assert!((throughput - expected).abs() < 0.01, "{}", throughput);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_policy_admits_slow_steady_download() {
        let transport =
            MockTransport::new().plan("192.0.2.1", vec![Plan::streaming(20 * 1024, 10, 200)]);
        let mut strict = settings(2, 0.0);
        strict.failure_policy = FailurePolicy::Strict;
        let prober = Prober::with_transport(strict, transport);

        let result = prober.probe("192.0.2.1".parse().unwrap()).await.unwrap();

        assert_eq!(result.loss_ratio, 0.0);
        assert!(result.throughput > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_download_times_out() {
        let transport =
            MockTransport::new().plan("192.0.2.1", vec![Plan::streaming(1024, 1, 2000)]);
        let prober = Prober::with_transport(settings(1, 0.0), transport);

        let trial = prober.run_trial("192.0.2.1:443".parse().unwrap()).await;

        assert!(trial.ttfb_ms.is_some());
        assert!(trial.throughput.is_none());
        assert!(!trial.completed);
    }

    /// Let the server task observe whatever the client just dropped
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    async fn assert_closed_after_trial(plan: Plan) {
        let transport = MockTransport::new().plan("192.0.2.1", vec![plan]);
        let prober = Prober::with_transport(settings(1, 0.0), transport);

        prober.run_trial("192.0.2.1:443".parse().unwrap()).await;
        settle().await;

        assert_eq!(prober.transport().closed(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_closed_after_tls_failure() {
        assert_closed_after_trial(Plan::tcp_only(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_closed_after_ttfb_timeout() {
        assert_closed_after_trial(Plan::ok(10, 10, 5000, 0)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_closed_after_download_timeout() {
        assert_closed_after_trial(Plan::streaming(1024, 1, 2000)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_closed_after_completed_trial() {
        assert_closed_after_trial(Plan::ok(10, 10, 10, 10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_keeps_connection_until_client_drops() {
        let transport = MockTransport::new().plan("192.0.2.1", vec![Plan::ok(1, 1, 1, 1)]);

        let conn = transport.connect("192.0.2.1:443".parse().unwrap()).await.unwrap();
        let stream = transport.handshake(conn).await.unwrap();
        settle().await;
        assert_eq!(transport.closed(), vec![false]);

        drop(stream);
        settle().await;
        assert_eq!(transport.closed(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_tcp_failures_rejected_even_with_full_loss_allowed() {
        let transport = MockTransport::new().plan("192.0.2.1", vec![Plan::refused()]);
        let prober = Prober::with_transport(settings(2, 1.0), transport);

        let outcome = prober.probe("192.0.2.1".parse().unwrap()).await;

        assert_eq!(outcome, Err(Rejection::Unreachable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_under_threshold_admitted() {
        let transport = MockTransport::new().plan(
            "192.0.2.1",
            vec![Plan::refused(), Plan::ok(10, 20, 30, 40)],
        );
        let prober = Prober::with_transport(settings(2, 0.5), transport);

        let result = prober.probe("192.0.2.1".parse().unwrap()).await.unwrap();

        assert_eq!(result.loss_ratio, 0.5);
        assert!(approx(result.tcp_ms, 10.0));
        assert!(approx(result.ttfb_ms, 30.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_over_threshold_rejected() {
        let transport = MockTransport::new().plan(
            "192.0.2.1",
            vec![Plan::refused(), Plan::ok(10, 20, 30, 40)],
        );
        let prober = Prober::with_transport(settings(2, 0.3), transport);

        let outcome = prober.probe("192.0.2.1".parse().unwrap()).await;

        assert_eq!(outcome, Err(Rejection::LossAboveThreshold { loss: 0.5 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tls_failure_does_not_count_as_loss() {
        let transport = MockTransport::new().plan(
            "192.0.2.1",
            vec![Plan::tcp_only(20), Plan::ok(10, 20, 30, 40)],
        );
        let prober = Prober::with_transport(settings(2, 0.0), transport);

        let result = prober.probe("192.0.2.1".parse().unwrap()).await.unwrap();

        assert_eq!(result.loss_ratio, 0.0);
        // TCP averaged over both trials, TLS only over the one that got there
        assert!(approx(result.tcp_ms, 15.0));
        assert!(approx(result.tls_ms, 20.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_policy_counts_tls_failure_as_loss() {
        let transport = MockTransport::new().plan(
            "192.0.2.1",
            vec![Plan::tcp_only(20), Plan::ok(10, 20, 30, 40)],
        );
        let mut strict = settings(2, 0.5);
        strict.failure_policy = FailurePolicy::Strict;
        let prober = Prober::with_transport(strict, transport);

        let result = prober.probe("192.0.2.1".parse().unwrap()).await.unwrap();

        assert_eq!(result.loss_ratio, 0.5);
        // The failed trial contributes nothing
        assert!(approx(result.tcp_ms, 10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_policy_rejects_tcp_only_candidate() {
        let transport = MockTransport::new().plan("192.0.2.1", vec![Plan::tcp_only(20)]);
        let mut strict = settings(2, 1.0);
        strict.failure_policy = FailurePolicy::Strict;
        let prober = Prober::with_transport(strict, transport);

        let outcome = prober.probe("192.0.2.1".parse().unwrap()).await;

        assert_eq!(outcome, Err(Rejection::Unreachable));
    }
}
