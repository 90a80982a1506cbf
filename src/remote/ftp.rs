//! FTP client over tokio sockets: passive mode, binary type, one control
//! connection shared behind a mutex.

use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::error::RemoteError;
use super::reply::{self, Reply};
use super::RemoteStore;
use crate::config::FtpConfig;

const DATA_CHUNK_SIZE: usize = 64 * 1024;

/// An authenticated FTP session positioned in the remote directory.
pub struct FtpSession {
    control: Mutex<Control>,
    peer: IpAddr,
    timeout: Duration,
}

impl std::fmt::Debug for FtpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpSession")
            .field("peer", &self.peer)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

struct Control {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
    /// A RETR has been accepted and its completion reply is still unread.
    transfer_open: bool,
    /// NOOPs written during an open transfer whose replies are still unread.
    pending_noops: u32,
}

async fn with_timeout<T, F>(timeout: Duration, what: &str, fut: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| RemoteError::Timeout(what.to_string()))?
}

impl Control {
    async fn send(&mut self, command: &str) -> Result<(), RemoteError> {
        if command.contains(['\r', '\n']) {
            return Err(RemoteError::Protocol(format!(
                "refusing to send command with line break: {:?}",
                command
            )));
        }
        let shown = if command.starts_with("PASS ") {
            "PASS ****"
        } else {
            command
        };
        tracing::debug!("ftp > {}", shown);
        let line = format!("{}\r\n", command);
        with_timeout(self.timeout, shown, async {
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.flush().await?;
            Ok(())
        })
        .await
    }

    async fn reply(&mut self, waiting_for: &str) -> Result<Reply, RemoteError> {
        let reply = with_timeout(
            self.timeout,
            &format!("reply to {}", waiting_for),
            reply::read_reply(&mut self.reader),
        )
        .await?;
        tracing::debug!("ftp < {} {}", reply.code, reply.text);
        Ok(reply)
    }

    async fn command(&mut self, command: &str) -> Result<Reply, RemoteError> {
        self.send(command).await?;
        self.reply(command_name(command)).await
    }

    /// Send `command` and require a 2xx reply.
    async fn expect_completion(&mut self, command: &str) -> Result<Reply, RemoteError> {
        let reply = self.command(command).await?;
        if reply.is_completion() {
            Ok(reply)
        } else {
            Err(rejected(command, reply))
        }
    }

    /// Enter passive mode and open the data connection.
    async fn open_data(&mut self, peer: IpAddr) -> Result<TcpStream, RemoteError> {
        let reply = self.command("PASV").await?;
        if reply.code != 227 {
            return Err(rejected("PASV", reply));
        }
        let port = reply::parse_pasv_port(&reply.text)?;
        let addr = format!("{}:{}", peer, port);
        tokio::time::timeout(self.timeout, TcpStream::connect((peer, port)))
            .await
            .map_err(|_| RemoteError::Timeout(format!("data connection to {}", addr)))?
            .map_err(|source| RemoteError::Connect { addr, source })
    }

    /// Read replies until the transfer completion and every pending NOOP
    /// reply have been consumed.
    async fn finish_transfer(&mut self, command: &str) -> Result<(), RemoteError> {
        let mut completion: Option<Reply> = None;
        while completion.is_none() || self.pending_noops > 0 {
            let reply = self.reply(command).await?;
            if completion.is_none() && !(reply.code == 200 && self.pending_noops > 0) {
                completion = Some(reply);
            } else if self.pending_noops > 0 {
                self.pending_noops -= 1;
            } else {
                tracing::debug!("ftp: ignoring unexpected reply {} {}", reply.code, reply.text);
            }
        }
        self.transfer_open = false;
        match completion {
            Some(reply) if reply.is_completion() => Ok(()),
            Some(reply) => Err(rejected(command, reply)),
            None => Err(RemoteError::Closed),
        }
    }
}

fn command_name(command: &str) -> &str {
    if command.starts_with("PASS ") {
        "PASS"
    } else {
        command
    }
}

fn rejected(command: &str, reply: Reply) -> RemoteError {
    RemoteError::Rejected {
        command: command_name(command).to_string(),
        code: reply.code,
        message: reply.text,
    }
}

impl FtpSession {
    /// Connect, log in, switch to binary mode and change into the
    /// configured remote directory.
    pub async fn connect(config: &FtpConfig) -> Result<Self, RemoteError> {
        let addr = format!("{}:{}", config.host, config.port);
        tracing::info!("Connecting to FTP {}...", addr);

        let stream = tokio::time::timeout(
            config.timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| RemoteError::Timeout(format!("connection to {}", addr)))?
        .map_err(|source| RemoteError::Connect {
            addr: addr.clone(),
            source,
        })?;
        let peer = stream.peer_addr()?.ip();
        let (read_half, write_half) = stream.into_split();

        let mut control = Control {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout: config.timeout,
            transfer_open: false,
            pending_noops: 0,
        };

        let mut greeting = control.reply("greeting").await?;
        // 120: service ready in nnn minutes
        while greeting.code == 120 {
            greeting = control.reply("greeting").await?;
        }
        if !greeting.is_completion() {
            return Err(rejected("connect", greeting));
        }

        let user = control.command(&format!("USER {}", config.user)).await?;
        if user.is_intermediate() {
            control
                .expect_completion(&format!("PASS {}", config.password))
                .await?;
        } else if !user.is_completion() {
            return Err(rejected("USER", user));
        }

        control.expect_completion("TYPE I").await?;
        control
            .expect_completion(&format!("CWD {}", config.remote_dir))
            .await?;

        tracing::info!("Connected to FTP, working directory {}", config.remote_dir);
        Ok(Self {
            control: Mutex::new(control),
            peer,
            timeout: config.timeout,
        })
    }

    async fn read_data(&self, data: &mut TcpStream, buf: &mut [u8]) -> Result<usize, RemoteError> {
        tokio::time::timeout(self.timeout, data.read(buf))
            .await
            .map_err(|_| RemoteError::Timeout("data".to_string()))?
            .map_err(RemoteError::Network)
    }
}

#[async_trait::async_trait]
impl RemoteStore for FtpSession {
    async fn list_names(&self) -> Result<Vec<String>, RemoteError> {
        let mut control = self.control.lock().await;
        let mut data = control.open_data(self.peer).await?;
        let reply = control.command("NLST").await?;
        // 450/550: some servers answer an empty directory this way
        if matches!(reply.code, 450 | 550) {
            return Ok(Vec::new());
        }
        if !reply.is_preliminary() {
            return Err(rejected("NLST", reply));
        }
        control.transfer_open = true;

        let mut raw = Vec::new();
        let mut buf = vec![0u8; DATA_CHUNK_SIZE];
        loop {
            let n = self.read_data(&mut data, &mut buf).await?;
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
        }
        drop(data);
        control.finish_transfer("NLST").await?;

        Ok(String::from_utf8_lossy(&raw)
            .lines()
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn modified_at(&self, name: &str) -> Result<DateTime<Utc>, RemoteError> {
        let command = format!("MDTM {}", name);
        let reply = self.control.lock().await.command(&command).await?;
        if reply.code != 213 {
            return Err(rejected(&command, reply));
        }
        reply::parse_mdtm(&reply.text)
    }

    async fn size(&self, name: &str) -> Result<u64, RemoteError> {
        let command = format!("SIZE {}", name);
        let reply = self.control.lock().await.command(&command).await?;
        if reply.code != 213 {
            return Err(rejected(&command, reply));
        }
        reply::parse_size(&reply.text)
    }

    async fn retrieve(
        &self,
        name: &str,
        offset: u64,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, RemoteError> {
        let command = format!("RETR {}", name);
        let mut data = {
            let mut control = self.control.lock().await;
            let data = control.open_data(self.peer).await?;
            if offset > 0 {
                let rest = control.command(&format!("REST {}", offset)).await?;
                if rest.code != 350 {
                    return Err(rejected(&format!("REST {}", offset), rest));
                }
            }
            let reply = control.command(&command).await?;
            if !reply.is_preliminary() {
                return Err(rejected(&command, reply));
            }
            control.transfer_open = true;
            control.pending_noops = 0;
            data
        };

        // The control lock is released while streaming so keep-alives can run.
        let mut buf = vec![0u8; DATA_CHUNK_SIZE];
        let mut written: u64 = 0;
        let streamed: Result<(), RemoteError> = async {
            loop {
                let n = self.read_data(&mut data, &mut buf).await?;
                if n == 0 {
                    break;
                }
                sink.write_all(&buf[..n])
                    .await
                    .map_err(RemoteError::LocalWrite)?;
                written += n as u64;
            }
            sink.flush().await.map_err(RemoteError::LocalWrite)
        }
        .await;
        drop(data);

        let finished = self.control.lock().await.finish_transfer(&command).await;
        match (streamed, finished) {
            (Err(e), _) => Err(e),
            (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(written),
        }
    }

    async fn delete(&self, name: &str) -> Result<(), RemoteError> {
        self.control
            .lock()
            .await
            .expect_completion(&format!("DELE {}", name))
            .await
            .map(|_| ())
    }

    async fn keep_alive(&self) -> Result<(), RemoteError> {
        let mut control = self.control.lock().await;
        if control.transfer_open {
            // Reply is drained by finish_transfer.
            control.send("NOOP").await?;
            control.pending_noops += 1;
            Ok(())
        } else {
            control.expect_completion("NOOP").await.map(|_| ())
        }
    }

    async fn quit(&self) -> Result<(), RemoteError> {
        let mut control = self.control.lock().await;
        control.send("QUIT").await?;
        // Skip any replies left over from an interrupted transfer.
        loop {
            let reply = control.reply("QUIT").await?;
            if reply.code == 221 {
                break;
            }
        }
        let _ = control.writer.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::test_server::{ScriptedServer, ServerFile};

    fn config_for(server: &ScriptedServer) -> FtpConfig {
        FtpConfig {
            host: "127.0.0.1".to_string(),
            user: "backup".to_string(),
            password: "secret".to_string(),
            remote_dir: "/backups".to_string(),
            timeout: Duration::from_secs(5),
            port: server.port(),
        }
    }

    fn files() -> Vec<ServerFile> {
        vec![
            ServerFile::new("a.bin", "20250101000000", b"0123456789".to_vec()),
            ServerFile::new("b.bin", "20250102000000", b"abcdefghijklmnopqrst".to_vec()),
        ]
    }

    #[tokio::test]
    async fn test_connect_logs_in_and_changes_directory() {
        let server = ScriptedServer::start(files()).await;
        let session = FtpSession::connect(&config_for(&server)).await.unwrap();
        session.quit().await.unwrap();

        let commands = server.commands();
        assert_eq!(commands[0], "USER backup");
        assert_eq!(commands[1], "PASS secret");
        assert!(commands.contains(&"TYPE I".to_string()));
        assert!(commands.contains(&"CWD /backups".to_string()));
        assert_eq!(commands.last().unwrap(), "QUIT");
    }

    #[tokio::test]
    async fn test_wrong_password_is_rejected() {
        let server = ScriptedServer::start(files()).await;
        let mut config = config_for(&server);
        config.password = "wrong".to_string();
        let err = FtpSession::connect(&config).await.unwrap_err();
        assert!(matches!(err, RemoteError::Rejected { code: 530, .. }));
        assert!(!err.to_string().contains("wrong"));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let config = FtpConfig {
            host: "127.0.0.1".to_string(),
            user: "u".to_string(),
            password: "p".to_string(),
            remote_dir: "/".to_string(),
            timeout: Duration::from_secs(2),
            port: 1,
        };
        assert!(matches!(
            FtpSession::connect(&config).await,
            Err(RemoteError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_names_mdtm_and_size() {
        let server = ScriptedServer::start(files()).await;
        let session = FtpSession::connect(&config_for(&server)).await.unwrap();

        let names = session.list_names().await.unwrap();
        assert_eq!(names, vec!["a.bin".to_string(), "b.bin".to_string()]);

        let mtime = session.modified_at("b.bin").await.unwrap();
        assert_eq!(mtime.to_rfc3339(), "2025-01-02T00:00:00+00:00");
        assert_eq!(session.size("b.bin").await.unwrap(), 20);

        let missing = session.modified_at("nope.bin").await.unwrap_err();
        assert!(missing.is_permanent_rejection());
    }

    #[tokio::test]
    async fn test_empty_directory_lists_nothing() {
        let server = ScriptedServer::start(Vec::new()).await;
        let session = FtpSession::connect(&config_for(&server)).await.unwrap();
        assert!(session.list_names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_full_and_resumed() {
        let server = ScriptedServer::start(files()).await;
        let session = FtpSession::connect(&config_for(&server)).await.unwrap();

        let mut full = Vec::new();
        let n = session.retrieve("b.bin", 0, &mut full).await.unwrap();
        assert_eq!(n, 20);
        assert_eq!(full, b"abcdefghijklmnopqrst");

        let mut tail = Vec::new();
        let n = session.retrieve("b.bin", 15, &mut tail).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(tail, b"pqrst");
        assert!(server.commands().contains(&"REST 15".to_string()));
    }

    #[tokio::test]
    async fn test_keep_alive_during_transfer_is_drained() {
        let server = ScriptedServer::start(files()).await;
        server.set_data_delay(Duration::from_millis(300));
        let session = FtpSession::connect(&config_for(&server)).await.unwrap();

        let mut out = Vec::new();
        let (retrieved, noop) = tokio::join!(session.retrieve("a.bin", 0, &mut out), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            session.keep_alive().await
        });
        assert_eq!(retrieved.unwrap(), 10);
        noop.unwrap();
        assert_eq!(out, b"0123456789");

        // The control channel is back in sync for ordinary commands.
        session.keep_alive().await.unwrap();
        assert_eq!(session.size("a.bin").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_delete() {
        let server = ScriptedServer::start(files()).await;
        let session = FtpSession::connect(&config_for(&server)).await.unwrap();
        session.delete("a.bin").await.unwrap();
        assert_eq!(session.list_names().await.unwrap(), vec!["b.bin".to_string()]);
        assert!(session.delete("a.bin").await.is_err());
    }

    #[tokio::test]
    async fn test_command_injection_refused() {
        let server = ScriptedServer::start(files()).await;
        let session = FtpSession::connect(&config_for(&server)).await.unwrap();
        assert!(matches!(
            session.delete("a.bin\r\nDELE b.bin").await,
            Err(RemoteError::Protocol(_))
        ));
    }
}
