//! Typed client over the daemon's frame protocol. Used by the CLI
//! subcommands; transport errors and wire errors both surface as `GpmError`.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{GpmError, Result};
use crate::gpmenv;
use crate::service::{ResourceStat, Service, ServiceVersion};

use super::logs::LogLine;
use super::protocol::{Chunk, MessageFrame, Request, Response};
use super::server::read_frame;

#[cfg(unix)]
type Stream = tokio::net::UnixStream;
#[cfg(not(unix))]
type Stream = tokio::net::TcpStream;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct DaemonInfo {
    pub pid: u32,
    pub version: String,
    pub os: String,
    pub arch: String,
    pub uptime_secs: u64,
    pub stat: ResourceStat,
}

pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new() -> Self {
        Self {
            socket_path: gpmenv::socket_path(),
        }
    }

    pub fn with_socket(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    async fn connect(&self) -> Result<Stream> {
        #[cfg(unix)]
        let stream = Stream::connect(&self.socket_path).await?;
        #[cfg(not(unix))]
        let stream = Stream::connect(format!("127.0.0.1:{}", gpmenv::tcp_port())).await?;
        Ok(stream)
    }

    async fn send_request(&self, stream: &mut Stream, request: &Request) -> Result<()> {
        let bytes = MessageFrame::encode_request(request)
            .map_err(|e| GpmError::Internal(format!("encode request: {e}")))?;
        stream.write_all(&bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_response(&self, stream: &mut Stream) -> Result<Response> {
        let buf = read_frame(stream)
            .await
            .map_err(|e| GpmError::Internal(format!("read response: {e}")))?;
        rkyv::from_bytes::<Response, rkyv::rancor::Error>(&buf)
            .map_err(|e| GpmError::Internal(format!("decode response: {e}")))
    }

    /// One request, one response.
    async fn request(&self, request: Request) -> Result<Response> {
        let mut stream = self.connect().await?;
        self.send_request(&mut stream, &request).await?;
        self.read_response(&mut stream).await
    }

    fn expect_service(response: Response) -> Result<Service> {
        match response {
            Response::Service { service } => Ok(service),
            Response::Error { kind, message } => Err(GpmError::from_wire(&kind, message)),
            other => Err(GpmError::Internal(format!("unexpected response: {other:?}"))),
        }
    }

    fn expect_ok(response: Response) -> Result<()> {
        match response {
            Response::Ok => Ok(()),
            Response::Error { kind, message } => Err(GpmError::from_wire(&kind, message)),
            other => Err(GpmError::Internal(format!("unexpected response: {other:?}"))),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.ping().await.is_ok()
    }

    pub async fn ping(&self) -> Result<(u64, String)> {
        match self.request(Request::Ping).await? {
            Response::Pong {
                uptime_secs,
                version,
            } => Ok((uptime_secs, version)),
            other => Err(GpmError::Internal(format!("unexpected response: {other:?}"))),
        }
    }

    pub async fn info(&self) -> Result<DaemonInfo> {
        match self.request(Request::Info).await? {
            Response::Info {
                pid,
                version,
                os,
                arch,
                uptime_secs,
                stat,
            } => Ok(DaemonInfo {
                pid,
                version,
                os,
                arch,
                uptime_secs,
                stat,
            }),
            Response::Error { kind, message } => Err(GpmError::from_wire(&kind, message)),
            other => Err(GpmError::Internal(format!("unexpected response: {other:?}"))),
        }
    }

    pub async fn shutdown(&self, graceful: bool) -> Result<()> {
        Self::expect_ok(self.request(Request::Shutdown { graceful }).await?)
    }

    pub async fn create(&self, service: Service) -> Result<Service> {
        Self::expect_service(self.request(Request::Create { service }).await?)
    }

    pub async fn get(&self, name: &str) -> Result<Service> {
        Self::expect_service(
            self.request(Request::Get {
                name: name.to_string(),
            })
            .await?,
        )
    }

    pub async fn list(&self) -> Result<(Vec<Service>, u64)> {
        match self.request(Request::List).await? {
            Response::Services { list, total } => Ok((list, total)),
            Response::Error { kind, message } => Err(GpmError::from_wire(&kind, message)),
            other => Err(GpmError::Internal(format!("unexpected response: {other:?}"))),
        }
    }

    pub async fn edit(&self, patch: Service) -> Result<Service> {
        Self::expect_service(self.request(Request::Edit { patch }).await?)
    }

    pub async fn start(&self, name: &str) -> Result<Service> {
        Self::expect_service(
            self.request(Request::Start {
                name: name.to_string(),
            })
            .await?,
        )
    }

    pub async fn stop(&self, name: &str) -> Result<Service> {
        Self::expect_service(
            self.request(Request::Stop {
                name: name.to_string(),
            })
            .await?,
        )
    }

    pub async fn restart(&self, name: &str) -> Result<Service> {
        Self::expect_service(
            self.request(Request::Restart {
                name: name.to_string(),
            })
            .await?,
        )
    }

    pub async fn delete(&self, name: &str) -> Result<Service> {
        Self::expect_service(
            self.request(Request::Delete {
                name: name.to_string(),
            })
            .await?,
        )
    }

    pub async fn rollback(&self, name: &str, version: &str) -> Result<Service> {
        Self::expect_service(
            self.request(Request::Rollback {
                name: name.to_string(),
                version: version.to_string(),
            })
            .await?,
        )
    }

    pub async fn list_versions(&self, name: &str) -> Result<Vec<ServiceVersion>> {
        match self
            .request(Request::ListVersions {
                name: name.to_string(),
            })
            .await?
        {
            Response::Versions { list } => Ok(list),
            Response::Error { kind, message } => Err(GpmError::from_wire(&kind, message)),
            other => Err(GpmError::Internal(format!("unexpected response: {other:?}"))),
        }
    }

    pub async fn forget(&self, name: &str, version: &str) -> Result<()> {
        Self::expect_ok(
            self.request(Request::Forget {
                name: name.to_string(),
                version: version.to_string(),
            })
            .await?,
        )
    }

    /// Install a new service: spec first, then the package streamed as
    /// chunks, then the terminal acknowledgement.
    pub async fn install(&self, service: Service, package: &Path) -> Result<Service> {
        let mut stream = self.connect().await?;
        self.send_request(&mut stream, &Request::Install { service })
            .await?;
        self.stream_file(&mut stream, package).await?;
        Self::expect_service(self.read_response(&mut stream).await?)
    }

    pub async fn upgrade(&self, name: &str, version: &str, package: &Path) -> Result<Service> {
        let mut stream = self.connect().await?;
        self.send_request(
            &mut stream,
            &Request::Upgrade {
                name: name.to_string(),
                version: version.to_string(),
            },
        )
        .await?;
        self.stream_file(&mut stream, package).await?;
        Self::expect_service(self.read_response(&mut stream).await?)
    }

    /// Plain file push to an arbitrary destination path on the host.
    pub async fn push(&self, local: &Path, remote_path: &str) -> Result<()> {
        let mut stream = self.connect().await?;
        self.send_request(
            &mut stream,
            &Request::Push {
                path: remote_path.to_string(),
            },
        )
        .await?;
        self.stream_file(&mut stream, local).await?;
        Self::expect_ok(self.read_response(&mut stream).await?)
    }

    async fn stream_file(&self, stream: &mut Stream, path: &Path) -> Result<()> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            let chunk = if n == 0 {
                Chunk::terminal(Vec::new())
            } else {
                Chunk::data(buf[..n].to_vec())
            };
            let bytes = MessageFrame::encode_chunk(&chunk)
                .map_err(|e| GpmError::Internal(format!("encode chunk: {e}")))?;
            stream.write_all(&bytes).await?;
            if n == 0 {
                stream.flush().await?;
                return Ok(());
            }
        }
    }

    /// Subscribe to a service's log stream. The receiver yields lines until
    /// `StreamEnd` (or an error line); dropping it cancels the tail.
    pub async fn watch_log(
        &self,
        name: &str,
        lines: u64,
        follow: bool,
    ) -> Result<mpsc::Receiver<LogLine>> {
        let mut stream = self.connect().await?;
        self.send_request(
            &mut stream,
            &Request::WatchLog {
                name: name.to_string(),
                lines,
                follow,
            },
        )
        .await?;

        // The first frame tells us whether the subscription was accepted.
        let first = self.read_response(&mut stream).await?;
        let (tx, rx) = mpsc::channel(256);
        match first {
            Response::Error { kind, message } => {
                return Err(GpmError::from_wire(&kind, message))
            }
            Response::StreamEnd => return Ok(rx),
            Response::LogLine {
                text,
                timestamp,
                error,
            } => {
                let _ = tx
                    .send(LogLine {
                        text,
                        timestamp,
                        error,
                    })
                    .await;
            }
            other => {
                return Err(GpmError::Internal(format!("unexpected response: {other:?}")))
            }
        }

        tokio::spawn(async move {
            let mut stream = stream;
            loop {
                let Ok(buf) = read_frame(&mut stream).await else {
                    return;
                };
                let Ok(response) = rkyv::from_bytes::<Response, rkyv::rancor::Error>(&buf)
                else {
                    return;
                };
                match response {
                    Response::LogLine {
                        text,
                        timestamp,
                        error,
                    } => {
                        if tx
                            .send(LogLine {
                                text,
                                timestamp,
                                error,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    _ => return,
                }
            }
        });
        Ok(rx)
    }
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new()
    }
}
