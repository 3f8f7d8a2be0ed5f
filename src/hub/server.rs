use crate::error::{PatchError, Result};
use crate::hub::ConnectionHub;
use serde_json::{json, Map};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixListener;

/// Unix socket으로 허브를 노출하는 서버
pub struct HubServer {
    socket_path: PathBuf,
    hub: Arc<ConnectionHub>,
}

impl HubServer {
    pub fn new(socket_path: PathBuf, hub: Arc<ConnectionHub>) -> Self {
        Self { socket_path, hub }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// 소켓을 열고 준비된 리스너 반환
    pub fn bind(&self) -> Result<UnixListener> {
        // 기존 socket 파일 삭제
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                PatchError::Connection(format!(
                    "Failed to remove existing socket {}: {}",
                    self.socket_path.display(),
                    e
                ))
            })?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            PatchError::Connection(format!(
                "Failed to bind socket {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;
        set_socket_permissions(&self.socket_path)?;

        Ok(listener)
    }

    /// `shutdown`이 끝날 때까지 연결 수락
    ///
    /// 종료 시 허브의 모든 연결을 닫고 소켓 파일을 지웁니다.
    pub async fn run<F>(&self, listener: UnixListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(socket = %self.socket_path.display(), "hub server listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let (reader, writer) = stream.into_split();
                        let mut context = Map::new();
                        context.insert("transport".to_string(), json!("unix"));

                        if let Err(e) = self.hub.register(reader, writer, context).await {
                            tracing::warn!(error = %e, "failed to register connection");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "error accepting connection");
                    }
                },
                _ = &mut shutdown => break,
            }
        }

        let closed = self.hub.shutdown().await;
        tracing::info!(closed, "hub server stopped");

        self.cleanup()
    }

    fn cleanup(&self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    #[tokio::test]
    async fn test_serve_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("hub.sock");
        let hub = Arc::new(ConnectionHub::default());
        let server = HubServer::new(socket.clone(), hub.clone());
        let listener = server.bind().unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server
                .run(listener, async {
                    let _ = stop_rx.await;
                })
                .await
        });

        let stream = UnixStream::connect(&socket).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let welcome: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(welcome["type"], "event");
        assert_eq!(welcome["payload"]["event"], "connected");

        writer
            .write_all(b"{\"id\":\"1\",\"type\":\"data\",\"payload\":{\"hello\":\"world\"}}\n")
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["id"], "1");
        assert_eq!(reply["payload"]["echo"]["hello"], "world");

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        let close: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(close["payload"]["event"], "close");
        assert_eq!(close["payload"]["code"], 1000);
        assert!(!socket.exists());
    }
}
