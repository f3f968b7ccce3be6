//! Daemon server: unix-socket accept loop, frame dispatch, pid file and
//! signal handling. One task per accepted control call.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::error::GpmError;
use crate::gpmenv;
use crate::paths::Paths;
use crate::platform;
use crate::service::ResourceStat;
use crate::store::{FileStore, ServiceStore};

use super::deploy::DeployEngine;
use super::health::Reaper;
use super::logs;
use super::manager::ServiceManager;
use super::protocol::{Chunk, MessageFrame, Request, Response};
use super::transfer::PackageSink;

pub struct DaemonConfig {
    pub root_dir: PathBuf,
    pub socket_path: PathBuf,
    pub pid_path: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            root_dir: gpmenv::root_dir(),
            socket_path: gpmenv::socket_path(),
            pid_path: gpmenv::pid_path(),
        }
    }
}

/// Daemon pid file: written at startup, probed to refuse double-starts.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Pid of an already-running daemon, if any.
    pub fn running_pid(&self) -> Option<u32> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        let pid: u32 = raw.trim().parse().ok()?;
        if pid != std::process::id() && platform::pid_alive(pid) {
            Some(pid)
        } else {
            None
        }
    }

    pub fn write(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, std::process::id().to_string())
    }

    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct DaemonServer {
    config: DaemonConfig,
    manager: Arc<ServiceManager>,
    deploy: DeployEngine,
    started_at: Instant,
    version: String,
    shutdown_tx: watch::Sender<bool>,
    /// Whether services get the SIGTERM window at shutdown. Cleared by
    /// `Shutdown { graceful: false }`.
    graceful_stop: AtomicBool,
}

impl DaemonServer {
    pub fn new(config: DaemonConfig) -> Self {
        let paths = Paths::new(&config.root_dir);
        let store: Arc<dyn ServiceStore> = Arc::new(FileStore::new(paths.clone()));
        let manager = Arc::new(ServiceManager::new(paths, store));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            deploy: DeployEngine::new(Arc::clone(&manager)),
            manager,
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            shutdown_tx,
            graceful_stop: AtomicBool::new(true),
        }
    }

    pub async fn run(self) -> Result<()> {
        info!("gpmd starting...");

        let pid_file = PidFile::new(&self.config.pid_path);
        if let Some(pid) = pid_file.running_pid() {
            anyhow::bail!("Daemon already running with PID {}", pid);
        }
        pid_file.write()?;
        info!("PID file written: {}", self.config.pid_path.display());

        if self.config.socket_path.exists() {
            std::fs::remove_file(&self.config.socket_path)?;
        }
        if let Some(parent) = self.config.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        #[cfg(unix)]
        let listener = tokio::net::UnixListener::bind(&self.config.socket_path)?;
        #[cfg(not(unix))]
        let listener =
            tokio::net::TcpListener::bind(format!("127.0.0.1:{}", gpmenv::tcp_port())).await?;

        info!(
            "Control socket listening on: {}",
            self.config.socket_path.display()
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.config.socket_path, perms)?;
        }

        // Reconcile the registry with persisted intent before serving.
        self.manager.init().await?;

        tokio::spawn(Reaper::new(Arc::clone(&self.manager)).run());

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            let shutdown_tx = self.shutdown_tx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
                let _ = shutdown_tx.send(true);
            });
        }
        #[cfg(not(unix))]
        {
            let shutdown_tx = self.shutdown_tx.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Received Ctrl+C");
                let _ = shutdown_tx.send(true);
            });
        }

        let server = Arc::new(self);
        info!("gpmd ready");

        loop {
            tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok((stream, _)) => {
                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    error!("Connection handler error: {}", e);
                                }
                            });
                        }
                        Err(e) => error!("Accept error: {}", e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        let graceful = server.graceful_stop.load(Ordering::SeqCst);
        if graceful {
            info!("Stopping all services...");
        } else {
            info!("Killing all services (non-graceful shutdown)...");
        }
        server.manager.stop_all(graceful).await;

        if server.config.socket_path.exists() {
            std::fs::remove_file(&server.config.socket_path)?;
        }
        PidFile::new(&server.config.pid_path).remove();

        info!("gpmd stopped");
        Ok(())
    }

    async fn handle_connection<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        trace!("New connection accepted");

        let request_buf = read_frame(&mut stream).await?;
        let request = rkyv::from_bytes::<Request, rkyv::rancor::Error>(&request_buf)
            .map_err(|e| anyhow::anyhow!("Failed to deserialize request: {}", e))?;

        match request {
            Request::Install { service } => self.handle_install(&mut stream, service).await?,
            Request::Upgrade { name, version } => {
                self.handle_upgrade(&mut stream, &name, &version).await?
            }
            Request::Push { path } => self.handle_push(&mut stream, &path).await?,
            Request::WatchLog {
                name,
                lines,
                follow,
            } => self.handle_watch_log(stream, &name, lines, follow).await?,
            other => {
                let response = self.handle_request(other).await;
                write_response(&mut stream, &response).await?;
            }
        }

        trace!("Connection done");
        Ok(())
    }

    async fn handle_request(&self, request: Request) -> Response {
        match request {
            Request::Ping => {
                debug!("Handling: Ping");
                Response::Pong {
                    uptime_secs: self.started_at.elapsed().as_secs(),
                    version: self.version.clone(),
                }
            }

            Request::Info => {
                debug!("Handling: Info");
                Response::Info {
                    pid: std::process::id(),
                    version: self.version.clone(),
                    os: std::env::consts::OS.to_string(),
                    arch: std::env::consts::ARCH.to_string(),
                    uptime_secs: self.started_at.elapsed().as_secs(),
                    stat: self.self_stat(),
                }
            }

            Request::Shutdown { graceful } => {
                info!("Handling: Shutdown (graceful: {})", graceful);
                self.graceful_stop.store(graceful, Ordering::SeqCst);
                let _ = self.shutdown_tx.send(true);
                Response::Ok
            }

            Request::Create { service } => {
                debug!("Handling: Create({})", service.name);
                self.service_or_error(self.manager.create(service).await)
            }

            Request::Get { name } => {
                debug!("Handling: Get({})", name);
                self.service_or_error(self.manager.get(&name).await)
            }

            Request::List => {
                debug!("Handling: List");
                match self.manager.list().await {
                    Ok((list, total)) => Response::Services { list, total },
                    Err(e) => Response::error(&e),
                }
            }

            Request::Edit { patch } => {
                debug!("Handling: Edit({})", patch.name);
                self.service_or_error(self.manager.edit(patch).await)
            }

            Request::Start { name } => {
                debug!("Handling: Start({})", name);
                self.service_or_error(self.manager.start(&name).await)
            }

            Request::Stop { name } => {
                debug!("Handling: Stop({})", name);
                self.service_or_error(self.manager.stop(&name).await)
            }

            Request::Restart { name } => {
                debug!("Handling: Restart({})", name);
                self.service_or_error(self.manager.restart(&name).await)
            }

            Request::Delete { name } => {
                debug!("Handling: Delete({})", name);
                self.service_or_error(self.manager.delete(&name).await)
            }

            Request::Rollback { name, version } => {
                info!("Handling: Rollback({}, {})", name, version);
                self.service_or_error(self.deploy.rollback(&name, &version).await)
            }

            Request::ListVersions { name } => {
                debug!("Handling: ListVersions({})", name);
                match self.deploy.list_versions(&name).await {
                    Ok(list) => Response::Versions { list },
                    Err(e) => Response::error(&e),
                }
            }

            Request::Forget { name, version } => {
                info!("Handling: Forget({}, {})", name, version);
                match self.deploy.forget(&name, &version).await {
                    Ok(()) => Response::Ok,
                    Err(e) => Response::error(&e),
                }
            }

            // Streaming variants are dispatched in handle_connection.
            Request::Install { .. }
            | Request::Upgrade { .. }
            | Request::Push { .. }
            | Request::WatchLog { .. } => Response::Error {
                kind: "internal".to_string(),
                message: "streaming request routed to unary handler".to_string(),
            },
        }
    }

    fn service_or_error(
        &self,
        result: crate::error::Result<crate::service::Service>,
    ) -> Response {
        match result {
            Ok(service) => Response::Service { service },
            Err(e) => Response::error(&e),
        }
    }

    fn self_stat(&self) -> ResourceStat {
        let mut system = sysinfo::System::new();
        super::process::sample_stat(std::process::id(), &mut system)
    }

    /// Install: spec arrived on the request, package bytes follow as Chunk
    /// frames. The success acknowledgement is sent only after extraction and
    /// record creation both succeeded.
    async fn handle_install<S>(
        &self,
        stream: &mut S,
        service: crate::service::Service,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        info!("Handling: Install({})", service.name);
        let sink = match self.deploy.begin_install(&service).await {
            Ok(sink) => sink,
            Err(e) => {
                write_response(stream, &Response::error(&e)).await?;
                return Ok(());
            }
        };

        match self.receive_package(stream, sink).await {
            Ok(package) => {
                let response =
                    self.service_or_error(self.deploy.finish_install(service, &package).await);
                write_response(stream, &response).await?;
            }
            Err(e) => {
                warn!("Install transfer for '{}' aborted: {}", service.name, e);
                let err = GpmError::Internal(format!("transfer aborted: {e}"));
                write_response(stream, &Response::error(&err)).await?;
            }
        }
        Ok(())
    }

    async fn handle_upgrade<S>(&self, stream: &mut S, name: &str, version: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        info!("Handling: Upgrade({}, {})", name, version);
        let sink = match self.deploy.begin_upgrade(name, version).await {
            Ok(sink) => sink,
            Err(e) => {
                write_response(stream, &Response::error(&e)).await?;
                return Ok(());
            }
        };

        match self.receive_package(stream, sink).await {
            Ok(package) => {
                let response = self
                    .service_or_error(self.deploy.finish_upgrade(name, version, &package).await);
                write_response(stream, &response).await?;
            }
            Err(e) => {
                warn!("Upgrade transfer for '{}' aborted: {}", name, e);
                let err = GpmError::Internal(format!("transfer aborted: {e}"));
                write_response(stream, &Response::error(&err)).await?;
            }
        }
        Ok(())
    }

    /// Plain file push: chunks into the destination path, no finalize beyond
    /// closing the file.
    async fn handle_push<S>(&self, stream: &mut S, path: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        info!("Handling: Push({})", path);
        if path.is_empty() {
            let err = GpmError::BadRequest("push destination path is required".into());
            write_response(stream, &Response::error(&err)).await?;
            return Ok(());
        }
        let sink = match PackageSink::create(path).await {
            Ok(sink) => sink,
            Err(e) => {
                write_response(stream, &Response::error(&e)).await?;
                return Ok(());
            }
        };

        match self.receive_package(stream, sink).await {
            Ok(_) => write_response(stream, &Response::Ok).await?,
            Err(e) => {
                warn!("Push transfer to '{}' aborted: {}", path, e);
                let err = GpmError::Internal(format!("transfer aborted: {e}"));
                write_response(stream, &Response::error(&err)).await?;
            }
        }
        Ok(())
    }

    /// Drain Chunk frames in arrival order into the sink until the terminal
    /// flag. Sequential writes only; no reordering.
    async fn receive_package<S>(&self, stream: &mut S, mut sink: PackageSink) -> Result<PathBuf>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            let chunk_buf = read_frame(stream).await?;
            let chunk = rkyv::from_bytes::<Chunk, rkyv::rancor::Error>(&chunk_buf)
                .map_err(|e| anyhow::anyhow!("Failed to deserialize chunk: {}", e))?;
            if sink.push(&chunk).await? {
                return Ok(sink.path().to_path_buf());
            }
        }
    }

    /// Stream log lines until the tail ends or the client goes away. The
    /// client never sends another frame after `WatchLog`, so the read half
    /// only ever reports EOF; that means the peer hung up and the tail must
    /// be torn down even if the log never produces another line.
    async fn handle_watch_log<S>(
        &self,
        stream: S,
        name: &str,
        lines: u64,
        follow: bool,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        debug!("Handling: WatchLog({}, lines: {}, follow: {})", name, lines, follow);
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut rx = match logs::watch(self.manager.paths(), name, lines, follow).await {
            Ok(rx) => rx,
            Err(e) => {
                write_response(&mut writer, &Response::error(&e)).await?;
                return Ok(());
            }
        };

        let mut probe = [0u8; 1];
        loop {
            tokio::select! {
                line = rx.recv() => {
                    let Some(line) = line else { break };
                    let is_error = line.error.is_some();
                    let response = Response::LogLine {
                        text: line.text,
                        timestamp: line.timestamp,
                        error: line.error,
                    };
                    // A write failure means the subscriber went away.
                    if write_response(&mut writer, &response).await.is_err() {
                        return Ok(());
                    }
                    if is_error {
                        break;
                    }
                }
                read = reader.read(&mut probe) => {
                    match read {
                        Ok(0) | Err(_) => return Ok(()),
                        Ok(_) => {}
                    }
                }
            }
        }
        write_response(&mut writer, &Response::StreamEnd).await?;
        Ok(())
    }
}

pub(crate) async fn read_frame<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin + Send,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = MessageFrame::read_length(&len_buf);
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

pub(crate) async fn write_response<S>(stream: &mut S, response: &Response) -> Result<()>
where
    S: AsyncWrite + Unpin + Send,
{
    let bytes = MessageFrame::encode_response(response)
        .map_err(|e| anyhow::anyhow!("Failed to encode response: {}", e))?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}
