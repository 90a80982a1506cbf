//! Loopback FTP server for protocol tests. Understands the command subset
//! the client uses and records every command it receives.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone)]
pub(crate) struct ServerFile {
    name: String,
    mdtm: String,
    data: Vec<u8>,
}

impl ServerFile {
    pub fn new(name: &str, mdtm: &str, data: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            mdtm: mdtm.to_string(),
            data,
        }
    }
}

#[derive(Default)]
struct ServerState {
    files: Vec<ServerFile>,
    commands: Vec<String>,
    data_delay: Duration,
}

pub(crate) struct ScriptedServer {
    port: u16,
    state: Arc<Mutex<ServerState>>,
}

impl ScriptedServer {
    pub async fn start(files: Vec<ServerFile>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(ServerState {
            files,
            ..Default::default()
        }));

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, state).await;
                });
            }
        });

        Self { port, state }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Delay between accepting a RETR data connection and sending the data.
    pub fn set_data_delay(&self, delay: Duration) {
        self.state.lock().unwrap().data_delay = delay;
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<ServerState>>) -> std::io::Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut passive: Option<TcpListener> = None;
    let mut rest: usize = 0;

    writer.write_all(b"220-Test server\r\n220 Ready\r\n").await?;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end_matches('\r').to_string();
        state.lock().unwrap().commands.push(line.clone());
        let (verb, arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));

        let reply = match verb.to_ascii_uppercase().as_str() {
            "USER" => "331 Password required".to_string(),
            "PASS" if arg == "secret" => "230 Logged in".to_string(),
            "PASS" => "530 Login incorrect.".to_string(),
            "TYPE" => "200 Type set to I".to_string(),
            "CWD" => "250 Directory changed".to_string(),
            "NOOP" => "200 NOOP ok".to_string(),
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await?;
                let port = listener.local_addr()?.port();
                passive = Some(listener);
                format!(
                    "227 Entering Passive Mode (127,0,0,1,{},{})",
                    port / 256,
                    port % 256
                )
            }
            "NLST" => {
                let names: Vec<String> = state
                    .lock()
                    .unwrap()
                    .files
                    .iter()
                    .map(|f| f.name.clone())
                    .collect();
                match passive.take() {
                    Some(_) if names.is_empty() => "550 No files found".to_string(),
                    Some(listener) => {
                        writer.write_all(b"150 Here comes the listing\r\n").await?;
                        let (mut data, _) = listener.accept().await?;
                        let body: String = names.iter().map(|n| format!("{}\r\n", n)).collect();
                        data.write_all(body.as_bytes()).await?;
                        data.shutdown().await?;
                        "226 Transfer complete".to_string()
                    }
                    None => "425 Use PASV first".to_string(),
                }
            }
            "MDTM" => match find(&state, arg) {
                Some(file) => format!("213 {}", file.mdtm),
                None => "550 No such file".to_string(),
            },
            "SIZE" => match find(&state, arg) {
                Some(file) => format!("213 {}", file.data.len()),
                None => "550 No such file".to_string(),
            },
            "REST" => {
                rest = arg.parse().unwrap_or(0);
                format!("350 Restarting at {}", rest)
            }
            "RETR" => match (find(&state, arg), passive.take()) {
                (Some(file), Some(listener)) => {
                    writer.write_all(b"150 Opening BINARY mode data connection\r\n").await?;
                    let (mut data, _) = listener.accept().await?;
                    let delay = state.lock().unwrap().data_delay;
                    tokio::time::sleep(delay).await;
                    let start = rest.min(file.data.len());
                    data.write_all(&file.data[start..]).await?;
                    data.shutdown().await?;
                    rest = 0;
                    "226 Transfer complete".to_string()
                }
                (None, _) => "550 No such file".to_string(),
                (_, None) => "425 Use PASV first".to_string(),
            },
            "DELE" => {
                let mut guard = state.lock().unwrap();
                let before = guard.files.len();
                guard.files.retain(|f| f.name != arg);
                if guard.files.len() < before {
                    "250 Deleted".to_string()
                } else {
                    "550 No such file".to_string()
                }
            }
            "QUIT" => {
                writer.write_all(b"221 Goodbye\r\n").await?;
                break;
            }
            _ => "502 Command not implemented".to_string(),
        };
        writer.write_all(format!("{}\r\n", reply).as_bytes()).await?;
    }
    Ok(())
}

fn find(state: &Arc<Mutex<ServerState>>, name: &str) -> Option<ServerFile> {
    state
        .lock()
        .unwrap()
        .files
        .iter()
        .find(|f| f.name == name)
        .cloned()
}
