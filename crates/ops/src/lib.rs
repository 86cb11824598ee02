//! dx ops: imperative Kubernetes operations against one environment's
//! context and namespace.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use dx_core::K8sEnvironment;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Status};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ListParams, LogParams, PostParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// A single line of log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogChunk {
    pub line: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogOptions {
    pub follow: bool,
    /// Server-side tail.
    pub tail_lines: Option<i64>,
    pub container: Option<String>,
}

/// Cancellation handle for an in-flight operation.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Result of starting a streaming operation.
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ForwardEvent {
    Ready(String),
    Connected(String),
    Closed,
    Error(String),
}

/// Label selector for a service's pods.
pub fn selector_for(service: &str) -> String {
    format!("app={}", service)
}

/// Cluster adapter operations, scoped to one namespace.
#[async_trait::async_trait]
pub trait ClusterOps: Send + Sync {
    /// Create the namespace. `Ok(false)` when it already existed.
    async fn ensure_namespace(&self, labels: BTreeMap<String, String>) -> Result<bool>;
    /// Newest live pod of a service, selected by `app=<service>`.
    async fn newest_pod(&self, service: &str) -> Result<String>;
    async fn logs(&self, pod: &str, opts: LogOptions) -> Result<StreamHandle<LogChunk>>;
    async fn exec(&self, pod: &str, container: Option<&str>, cmd: &[String], pty: bool) -> Result<()>;
    async fn port_forward(&self, pod: &str, local: u16, remote: u16) -> Result<StreamHandle<ForwardEvent>> {
        use tokio::net::TcpListener;
        // fail early when the pod refuses forwarding at all
        let probe = self
            .pods()
            .portforward(pod, &[remote])
            .await
            .with_context(|| format!("port-forward to pod '{}'", pod))?;
        probe.abort();

        let (tx, rx) = mpsc::channel::<ForwardEvent>(16);
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let cancel = CancelHandle { tx: Some(cancel_tx) };
        let bind_addr = std::env::var("DX_PF_BIND").unwrap_or_else(|_| "127.0.0.1".to_string());
        let listener = TcpListener::bind((bind_addr.as_str(), local))
            .await
            .with_context(|| format!("binding {}:{}", bind_addr, local))?;
        let actual = listener.local_addr()?;
        let _ = tx.send(ForwardEvent::Ready(actual.to_string())).await;

        let pods = self.pods();
        let pod = pod.to_string();
        let connect = move || {
            let pods = pods.clone();
            let pod = pod.clone();
            async move {
                let mut pf = pods.portforward(&pod, &[remote]).await?;
                pf.take_stream(remote).ok_or_else(|| anyhow!("port-forward to '{}' returned no stream", pod))
            }
        };
        tokio::spawn(serve_forward(listener, connect, tx, cancel_rx));
        Ok(StreamHandle { rx, cancel })
    }

    async fn service_port(&self, service: &str) -> Result<Option<u16>>;
}

/// kube-rs implementation bound to an environment's context and namespace.
pub struct KubeOps {
    client: Client,
    namespace: String,
    env_name: String,
}

impl KubeOps {
    pub fn new(client: Client, namespace: impl Into<String>, env_name: impl Into<String>) -> Self {
        Self { client, namespace: namespace.into(), env_name: env_name.into() }
    }

    pub async fn for_environment(env: &K8sEnvironment) -> Result<Self> {
        let client = dx_kubehub::client_for(env).await?;
        Ok(Self::new(client, env.namespace.clone(), env.name.clone()))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait::async_trait]
impl ClusterOps for KubeOps {
    async fn ensure_namespace(&self, labels: BTreeMap<String, String>) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(self.namespace.clone()),
                labels: (!labels.is_empty()).then_some(labels),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                info!(ns = %self.namespace, "namespace created");
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(ns = %self.namespace, "namespace already exists");
                Ok(false)
            }
            Err(e) => Err(e).with_context(|| format!("creating namespace '{}'", self.namespace)),
        }
    }

    async fn newest_pod(&self, service: &str) -> Result<String> {
        let lp = ListParams::default().labels(&selector_for(service));
        let pods = self
            .pods()
            .list(&lp)
            .await
            .with_context(|| format!("listing pods for '{}' in namespace '{}'", service, self.namespace))?;
        newest_pod_name(&pods.items).ok_or_else(|| {
            anyhow!(
                "no pods found for service '{}' in namespace '{}'\nDeploy it first: dx deploy {} {}",
                service,
                self.namespace,
                self.env_name,
                service
            )
        })
    }

    async fn logs(&self, pod: &str, opts: LogOptions) -> Result<StreamHandle<LogChunk>> {
        let api = self.pods();
        let lp = LogParams {
            follow: opts.follow,
            tail_lines: opts.tail_lines,
            container: opts.container.clone(),
            ..Default::default()
        };

        let cap = std::env::var("DX_OPS_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).filter(|c| *c > 0).unwrap_or(1024);
        let (tx, rx) = mpsc::channel::<LogChunk>(cap);
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let cancel = CancelHandle { tx: Some(cancel_tx) };

        info!(pod = %pod, follow = lp.follow, tail = ?lp.tail_lines, "logs stream starting");
        let reader = api.log_stream(pod, &lp).await.with_context(|| {
            format!(
                "streaming logs from pod '{}' in namespace '{}'\nCheck the pod and container name: kubectl get pods -n {}",
                pod, self.namespace, self.namespace
            )
        })?;
        let pod_name = pod.to_string();
        tokio::spawn(async move {
            use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};
            let stream = ReaderStream::new(reader.compat());
            pump_bytes_to_lines(stream, tx, cancel_rx, Some(&pod_name)).await;
        });

        Ok(StreamHandle { rx, cancel })
    }

    async fn exec(&self, pod: &str, container: Option<&str>, cmd: &[String], pty: bool) -> Result<()> {
        use futures::SinkExt;
        use kube::api::{AttachParams, TerminalSize};
        use std::io::Read;
        use tokio::io::AsyncWriteExt;

        struct RawGuard;
        impl Drop for RawGuard {
            fn drop(&mut self) {
                let _ = crossterm::terminal::disable_raw_mode();
            }
        }

        let mut ap = if pty { AttachParams::interactive_tty() } else { AttachParams::default() };
        if let Some(c) = container {
            ap = ap.container(c);
        }
        if pty {
            ap = ap.stderr(false);
        } else {
            ap = ap.stdout(true).stderr(true);
        }

        let mut attached = self
            .pods()
            .exec(pod, cmd.to_vec(), &ap)
            .await
            .with_context(|| format!("exec into pod '{}'", pod))?;

        let mut resize_task = None;
        let raw_guard = if pty {
            if let Err(e) = crossterm::terminal::enable_raw_mode() {
                warn!(error = %e, "could not enable raw mode");
            }
            if let Some(mut tx) = attached.terminal_size() {
                let (w, h) = crossterm::terminal::size().unwrap_or((80, 24));
                let _ = tx.send(TerminalSize { height: h, width: w }).await;
                #[cfg(unix)]
                {
                    use tokio::signal::unix::{signal, SignalKind};
                    let mut sig = signal(SignalKind::window_change())?;
                    resize_task = Some(tokio::spawn(async move {
                        while sig.recv().await.is_some() {
                            if let Ok((w, h)) = crossterm::terminal::size() {
                                let _ = tx.send(TerminalSize { height: h, width: w }).await;
                            }
                        }
                    }));
                }
            }
            Some(RawGuard)
        } else {
            None
        };

        // stdin is only wired for interactive sessions
        let mut stdin_task = None;
        if pty {
            let mut writer = attached.stdin().ok_or_else(|| anyhow!("exec session has no stdin"))?;
            let (tx, mut rx) = mpsc::channel::<Vec<u8>>(32);
            std::thread::spawn(move || {
                let mut input = std::io::stdin();
                let mut buf = [0u8; 1024];
                loop {
                    match input.read(&mut buf) {
                        Ok(0) | Err(_) => {
                            let _ = tx.blocking_send(Vec::new());
                            break;
                        }
                        Ok(n) => {
                            if tx.blocking_send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
            stdin_task = Some(tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    if chunk.is_empty() || writer.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
            }));
        }

        let out_task = attached.stdout().map(|reader| {
            let mut stream = tokio_util::io::ReaderStream::new(reader);
            tokio::spawn(async move {
                let mut out = tokio::io::stdout();
                while let Some(Ok(bytes)) = stream.next().await {
                    if out.write_all(&bytes).await.is_err() {
                        break;
                    }
                    let _ = out.flush().await;
                }
            })
        });
        let err_task = attached.stderr().map(|reader| {
            let mut stream = tokio_util::io::ReaderStream::new(reader);
            tokio::spawn(async move {
                let mut err = tokio::io::stderr();
                while let Some(Ok(bytes)) = stream.next().await {
                    if err.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
            })
        });

        let status = attached.take_status();
        let mut interrupted = false;
        tokio::select! {
            _ = attached.join() => {}
            _ = tokio::signal::ctrl_c() => {
                warn!("Ctrl-C received during exec; closing session");
                interrupted = true;
            }
        }
        if let Some(t) = stdin_task {
            t.abort();
        }
        if let Some(t) = out_task {
            let _ = t.await;
        }
        if let Some(t) = err_task {
            let _ = t.await;
        }
        if let Some(t) = resize_task {
            t.abort();
        }
        drop(raw_guard);
        if interrupted {
            return Ok(());
        }
        let status = match status {
            Some(fut) => tokio::time::timeout(std::time::Duration::from_secs(2), fut).await.ok().flatten(),
            None => None,
        };
        remote_exit(status.as_ref()).with_context(|| format!("exec in pod '{}'", pod))
    }

    async fn port_forward(&self, pod: &str, local: u16, remote: u16) -> Result<StreamHandle<ForwardEvent>> {
        use tokio::net::TcpListener;
        let mut pf = self
            .pods()
            .portforward(pod, &[remote])
            .await
            .with_context(|| format!("port-forward to pod '{}'", pod))?;
        let (tx, rx) = mpsc::channel::<ForwardEvent>(16);
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let cancel = CancelHandle { tx: Some(cancel_tx) };
        let bind_addr = std::env::var("DX_PF_BIND").unwrap_or_else(|_| "127.0.0.1".to_string());
        let listener = TcpListener::bind((bind_addr.as_str(), local))
            .await
            .with_context(|| format!("binding {}:{}", bind_addr, local))?;
        let actual = listener.local_addr()?;
        let _ = tx.send(ForwardEvent::Ready(actual.to_string())).await;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        let _ = tx.send(ForwardEvent::Closed).await;
                        break;
                    }
                    accept_res = listener.accept() => {
                        match accept_res {
                            Ok((mut inbound, peer)) => {
                                let _ = tx.send(ForwardEvent::Connected(peer.to_string())).await;
                                match pf.take_stream(remote) {
                                    Some(mut stream) => {
                                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut stream).await;
                                    }
                                    None => {
                                        let _ = tx.send(ForwardEvent::Error("port-forward stream already consumed".into())).await;
                                    }
                                }
                            }
                            Err(e) => {
                                let _ = tx.send(ForwardEvent::Error(format!("accept error: {}", e))).await;
                                break;
                            }
                        }
                    }
                }
            }
        });
        Ok(StreamHandle { rx, cancel })
    }

    async fn service_port(&self, service: &str) -> Result<Option<u16>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let svc = api
            .get_opt(service)
            .await
            .with_context(|| format!("reading service '{}' in namespace '{}'", service, self.namespace))?;
        Ok(svc.as_ref().and_then(first_target_port))
    }
}

/// Newest pod by creation time, ignoring pods already being deleted.
pub fn newest_pod_name(pods: &[Pod]) -> Option<String> {
    pods.iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .filter_map(|p| {
            let name = p.metadata.name.clone()?;
            let created: Option<chrono::DateTime<chrono::Utc>> = p.metadata.creation_timestamp.as_ref().map(|t| t.0);
            Some((created, name))
        })
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)))
        .map(|(_, name)| name)
}

/// Map the status frame of an exec session to a result. No frame means the
/// session closed without reporting, which is treated as success.
pub fn remote_exit(status: Option<&Status>) -> Result<()> {
    let Some(st) = status else { return Ok(()) };
    if st.status.as_deref() == Some("Success") {
        return Ok(());
    }
    let code = st
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| causes.iter().find(|c| c.reason.as_deref() == Some("ExitCode")))
        .and_then(|c| c.message.as_deref());
    match code {
        Some(code) => Err(anyhow!("remote command exited with code {}", code)),
        None => Err(anyhow!("remote command failed: {}", st.message.as_deref().unwrap_or("no message"))),
    }
}

fn first_target_port(svc: &Service) -> Option<u16> {
    let port = svc.spec.as_ref()?.ports.as_ref()?.first()?;
    match &port.target_port {
        Some(IntOrString::Int(p)) => u16::try_from(*p).ok(),
        // named target ports resolve inside the pod; fall back to the service port
        _ => u16::try_from(port.port).ok(),
    }
}

/// Accept loop for a port-forward. Each inbound connection gets its own upstream
/// stream from `connect` and is copied on its own task, so one slow connection
/// never blocks accepts or cancellation.
async fn serve_forward<C, F, S>(
    listener: tokio::net::TcpListener,
    connect: C,
    tx: mpsc::Sender<ForwardEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) where
    C: Fn() -> F,
    F: std::future::Future<Output = Result<S>> + Send + 'static,
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let mut conns = tokio::task::JoinSet::new();
    loop {
        tokio::select! {
            _ = &mut cancel_rx => break,
            accept_res = listener.accept() => match accept_res {
                Ok((mut inbound, peer)) => {
                    let _ = tx.send(ForwardEvent::Connected(peer.to_string())).await;
                    let upstream = connect();
                    let tx = tx.clone();
                    conns.spawn(async move {
                        match upstream.await {
                            Ok(mut stream) => {
                                if let Err(e) = tokio::io::copy_bidirectional(&mut inbound, &mut stream).await {
                                    debug!(peer = %peer, error = %e, "forwarded connection ended");
                                }
                            }
                            Err(e) => {
                                let _ = tx.send(ForwardEvent::Error(format!("{:#}", e))).await;
                            }
                        }
                    });
                }
                Err(e) => {
                    let _ = tx.send(ForwardEvent::Error(format!("accept error: {}", e))).await;
                    break;
                }
            },
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
        }
    }
    conns.abort_all();
    let _ = tx.send(ForwardEvent::Closed).await;
}

/// Forward log lines to stdout until the stream ends.
pub async fn print_lines(mut handle: StreamHandle<LogChunk>) {
    while let Some(chunk) = handle.rx.recv().await {
        println!("{}", chunk.line);
    }
}

/// Consume a byte stream, split into lines, send via bounded channel.
/// A full channel makes the pump wait for the consumer. Flushes the last partial line on end.
async fn pump_bytes_to_lines<S, E>(
    stream: S,
    tx: mpsc::Sender<LogChunk>,
    mut cancel_rx: oneshot::Receiver<()>,
    ctx: Option<&str>,
) where
    S: futures::Stream<Item = Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = bytes::BytesMut::new();
    let ctx = ctx.unwrap_or("-");
    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                info!(ctx = %ctx, "log pump cancelled");
                break;
            }
            next = stream.next() => {
                match next {
                    Some(Ok(chunk)) => {
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let line = buf.split_to(pos);
                            let _ = buf.split_to(1);
                            if tx.send(LogChunk { line: String::from_utf8_lossy(&line).into_owned() }).await.is_err() {
                                debug!(ctx = %ctx, "log consumer gone");
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(ctx = %ctx, error = %e, "log stream error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    if !buf.is_empty() {
        let _ = tx.send(LogChunk { line: String::from_utf8_lossy(&buf).into_owned() }).await;
    }
    debug!(ctx = %ctx, "log pump ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn pod(name: &str, created_secs: Option<i64>, deleting: bool) -> Pod {
        let ts = |s: i64| Time(chrono::DateTime::from_timestamp(s, 0).expect("timestamp"));
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                creation_timestamp: created_secs.map(ts),
                deletion_timestamp: deleting.then(|| ts(2_000_000_000)),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn newest_pod_wins_and_terminating_pods_are_skipped() {
        let pods = vec![
            pod("api-old", Some(1_700_000_000), false),
            pod("api-new", Some(1_700_000_500), false),
            pod("api-dying", Some(1_700_000_900), true),
            pod("api-unknown", None, false),
        ];
        assert_eq!(newest_pod_name(&pods).as_deref(), Some("api-new"));
        assert_eq!(newest_pod_name(&[]), None);
        assert_eq!(newest_pod_name(&[pod("only-dying", Some(1), true)]), None);
    }

    #[test]
    fn target_port_prefers_numeric_target() {
        let svc = |target: Option<IntOrString>| Service {
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort { port: 80, target_port: target, ..Default::default() }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(first_target_port(&svc(Some(IntOrString::Int(8080)))), Some(8080));
        assert_eq!(first_target_port(&svc(Some(IntOrString::String("http".into())))), Some(80));
        assert_eq!(first_target_port(&svc(None)), Some(80));
        assert_eq!(first_target_port(&Service::default()), None);
    }

    #[test]
    fn exec_status_maps_to_result() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};
        assert!(remote_exit(None).is_ok());
        let ok = Status { status: Some("Success".into()), ..Default::default() };
        assert!(remote_exit(Some(&ok)).is_ok());

        let exited = Status {
            status: Some("Failure".into()),
            reason: Some("NonZeroExitCode".into()),
            message: Some("command terminated with non-zero exit code".into()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".into()),
                    message: Some("1".into()),
                    field: None,
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = remote_exit(Some(&exited)).unwrap_err();
        assert_eq!(err.to_string(), "remote command exited with code 1");

        let other = Status { status: Some("Failure".into()), message: Some("container not found".into()), ..Default::default() };
        assert!(remote_exit(Some(&other)).unwrap_err().to_string().contains("container not found"));
    }

    #[test]
    fn selector_uses_app_label() {
        assert_eq!(selector_for("account-api"), "app=account-api");
    }

    #[tokio::test]
    async fn splits_lines_across_chunks_and_flushes_tail() {
        let (tx, mut rx) = mpsc::channel::<LogChunk>(16);
        let (_cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let chunks = vec![
            Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from_static(b"GET /health 200\nPOST /rat")),
            Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from_static(b"ings 201\n")),
            Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from_static(b"shutting down")),
        ];
        pump_bytes_to_lines(stream::iter(chunks), tx, cancel_rx, Some("rating-api")).await;
        let mut out = Vec::new();
        while let Some(c) = rx.recv().await {
            out.push(c.line);
        }
        assert_eq!(out, vec!["GET /health 200", "POST /ratings 201", "shutting down"]);
    }

    #[tokio::test]
    async fn slow_consumer_receives_every_line() {
        let (tx, mut rx) = mpsc::channel::<LogChunk>(8);
        let (_cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let body: String = (0..5000).map(|i| format!("line {}\n", i)).collect();
        let chunks = vec![Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from(body))];
        let pump = tokio::spawn(pump_bytes_to_lines(stream::iter(chunks), tx, cancel_rx, Some("tail")));
        let mut recv = Vec::new();
        while let Some(c) = rx.recv().await {
            recv.push(c.line);
            tokio::task::yield_now().await;
        }
        pump.await.expect("pump panicked");
        assert_eq!(recv.len(), 5000);
        assert_eq!(recv[0], "line 0");
        assert_eq!(recv[4999], "line 4999");
    }

    #[tokio::test]
    async fn pump_stops_when_consumer_is_dropped() {
        let (tx, rx) = mpsc::channel::<LogChunk>(1);
        let (_cancel_tx, cancel_rx) = oneshot::channel::<()>();
        drop(rx);
        let chunks = vec![Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from_static(b"a\nb\nc\n"))];
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            pump_bytes_to_lines(stream::iter(chunks), tx, cancel_rx, None),
        )
        .await
        .expect("pump hung on a closed channel");
    }

    fn echo_upstream() -> impl std::future::Future<Output = Result<tokio::io::DuplexStream>> {
        async {
            let (client, server) = tokio::io::duplex(1024);
            tokio::spawn(async move {
                let (mut r, mut w) = tokio::io::split(server);
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
            Ok(client)
        }
    }

    #[tokio::test]
    async fn forward_serves_concurrent_connections() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel::<ForwardEvent>(16);
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve_forward(listener, echo_upstream, tx, cancel_rx));

        // the first connection stays open while the second one is served
        let mut first = tokio::net::TcpStream::connect(addr).await.unwrap();
        first.write_all(b"one").await.unwrap();
        let mut second = tokio::net::TcpStream::connect(addr).await.unwrap();
        second.write_all(b"two").await.unwrap();
        let mut buf = [0u8; 3];
        tokio::time::timeout(std::time::Duration::from_secs(1), second.read_exact(&mut buf))
            .await
            .expect("second connection starved")
            .unwrap();
        assert_eq!(&buf, b"two");
        first.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one");

        let _ = cancel_tx.send(());
        tokio::time::timeout(std::time::Duration::from_secs(1), server)
            .await
            .expect("forward loop ignored cancel")
            .unwrap();
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        let connected = events.iter().filter(|e| matches!(e, ForwardEvent::Connected(_))).count();
        assert_eq!(connected, 2);
        assert!(!events.iter().any(|e| matches!(e, ForwardEvent::Error(_))));
        assert!(matches!(events.last(), Some(ForwardEvent::Closed)));
    }

    #[tokio::test]
    async fn failed_upstream_is_reported_and_loop_keeps_accepting() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel::<ForwardEvent>(16);
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let refuse = || async { Err::<tokio::io::DuplexStream, _>(anyhow!("pod gone")) };
        let server = tokio::spawn(serve_forward(listener, refuse, tx, cancel_rx));

        let _a = tokio::net::TcpStream::connect(addr).await.unwrap();
        assert!(matches!(rx.recv().await, Some(ForwardEvent::Connected(_))));
        assert!(matches!(rx.recv().await, Some(ForwardEvent::Error(e)) if e.contains("pod gone")));
        let _b = tokio::net::TcpStream::connect(addr).await.unwrap();
        assert!(matches!(rx.recv().await, Some(ForwardEvent::Connected(_))));

        let _ = cancel_tx.send(());
        server.await.unwrap();
    }

    /// Minimal API server that answers every request with a 403 Status.
    async fn forbidding_api_server() -> Client {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = vec![0u8; 8192];
                let _ = sock.read(&mut buf).await;
                let body = r#"{"kind":"Status","apiVersion":"v1","status":"Failure","message":"pods \"api-1\" is forbidden","reason":"Forbidden","code":403}"#;
                let resp = format!(
                    "HTTP/1.1 403 Forbidden\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = sock.write_all(resp.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        let config = kube::Config::new(url.parse().unwrap());
        Client::try_from(config).unwrap()
    }

    #[tokio::test]
    async fn logs_fails_when_the_stream_cannot_open() {
        let ops = KubeOps::new(forbidding_api_server().await, "dev-alice", "dev");
        let err = ops
            .logs("api-1", LogOptions { follow: false, tail_lines: Some(10), container: None })
            .await
            .err()
            .expect("forbidden log stream must be an error");
        let msg = format!("{:#}", err);
        assert!(msg.contains("streaming logs from pod 'api-1'"), "{}", msg);
        assert!(msg.contains("forbidden"), "{}", msg);
    }

    #[tokio::test]
    async fn cancel_stops_a_follow_stream() {
        let (tx, mut rx) = mpsc::channel::<LogChunk>(16);
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let s = async_stream::stream! {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                yield Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from_static(b"tick\n"));
            }
        };
        let handle = tokio::spawn(pump_bytes_to_lines(s, tx, cancel_rx, Some("follow")));
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        let _ = cancel_tx.send(());
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("pump did not stop")
            .expect("pump panicked");
        assert_eq!(rx.recv().await.map(|c| c.line).as_deref(), Some("tick"));
    }
}
