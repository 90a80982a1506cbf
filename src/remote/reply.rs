//! FTP control-channel reply parsing (RFC 959 section 4.2).

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use super::error::RemoteError;

/// A complete (possibly multi-line) server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }
}

/// Read one reply. Multi-line replies start with `ddd-` and end at the first
/// line beginning with the same code followed by a space.
pub(crate) async fn read_reply<R>(reader: &mut R) -> Result<Reply, RemoteError>
where
    R: AsyncBufRead + Unpin,
{
    let first = read_line(reader).await?;
    let (code, separator, rest) = split_status_line(&first)?;
    let mut text = rest.to_string();

    if separator == '-' {
        let terminator = format!("{} ", code);
        loop {
            let line = read_line(reader).await?;
            if line.starts_with(&terminator) {
                text.push('\n');
                text.push_str(&line[4..]);
                break;
            }
            text.push('\n');
            text.push_str(&line);
        }
    }

    Ok(Reply { code, text })
}

async fn read_line<R>(reader: &mut R) -> Result<String, RemoteError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Err(RemoteError::Closed);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn split_status_line(line: &str) -> Result<(u16, char, &str), RemoteError> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return Err(RemoteError::Protocol(line.to_string()));
    }
    let code: u16 = line[..3]
        .parse()
        .map_err(|_| RemoteError::Protocol(line.to_string()))?;
    match bytes.get(3) {
        None => Ok((code, ' ', "")),
        Some(b' ') => Ok((code, ' ', &line[4..])),
        Some(b'-') => Ok((code, '-', &line[4..])),
        Some(_) => Err(RemoteError::Protocol(line.to_string())),
    }
}

/// Extract the data port from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`
/// reply. The host part is ignored; the data connection goes to the control
/// connection's peer.
pub(crate) fn parse_pasv_port(text: &str) -> Result<u16, RemoteError> {
    let numbers = text
        .split(|c: char| !(c.is_ascii_digit() || c == ','))
        .find(|token| token.matches(',').count() == 5)
        .ok_or_else(|| RemoteError::Protocol(format!("PASV: {}", text)))?;

    let fields: Vec<u16> = numbers
        .split(',')
        .map(|n| n.parse::<u16>())
        .collect::<Result<_, _>>()
        .map_err(|_| RemoteError::Protocol(format!("PASV: {}", text)))?;

    let (p1, p2) = (fields[4], fields[5]);
    if p1 > 255 || p2 > 255 {
        return Err(RemoteError::Protocol(format!("PASV: {}", text)));
    }
    Ok(p1 * 256 + p2)
}

/// Parse an `MDTM` reply body (`YYYYMMDDHHMMSS[.sss]`, always UTC).
pub(crate) fn parse_mdtm(text: &str) -> Result<DateTime<Utc>, RemoteError> {
    let token = text.trim();
    let stamp = token.get(..14).unwrap_or(token);
    NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| RemoteError::Protocol(format!("MDTM: {}", text)))
}

/// Parse a `SIZE` reply body.
pub(crate) fn parse_size(text: &str) -> Result<u64, RemoteError> {
    text.trim()
        .parse()
        .map_err(|_| RemoteError::Protocol(format!("SIZE: {}", text)))
}
