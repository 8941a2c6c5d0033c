//! Async protocol client.
//!
//! One struct owning the connection, strictly request/response: callers
//! send a command and get the parsed [`Response`] back, with any
//! dot-terminated body already collected and unescaped. Used by `rkcli`
//! and by the server's integration tests.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use crate::auth::{hash_response, Algorithm};
use crate::split::{quote, split, SplitError, SplitFlags};
use crate::status::{self, Status, StatusError};
use crate::{unescape_body_line, BODY_TERMINATOR, PROTOCOL_VERSION};

/// Object-safe transport; TCP and Unix sockets both qualify.
pub trait Transport: AsyncRead + AsyncWrite + Unpin {}
impl<T: AsyncRead + AsyncWrite + Unpin> Transport for T {}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error("server closed the connection")]
    Eof,
    #[error("unexpected server greeting {0:?}")]
    BadGreeting(String),
    #[error("unsupported protocol version {0}")]
    BadVersion(u32),
    #[error(transparent)]
    UnknownAlgorithm(#[from] crate::auth::UnknownAlgorithm),
    #[error("server rejected {command}: {status}")]
    Rejected { command: String, status: Status },
}

/// A complete server response: status line plus optional body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub body: Option<Vec<String>>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// The single value of a `252` response (the status text).
    pub fn value(&self) -> &str {
        &self.status.text
    }

    pub fn lines(&self) -> &[String] {
        self.body.as_deref().unwrap_or(&[])
    }
}

pub struct Client {
    reader: BufReader<ReadHalf<Box<dyn Transport>>>,
    writer: WriteHalf<Box<dyn Transport>>,
    algorithm: Algorithm,
    nonce: Vec<u8>,
    user: Option<String>,
}

impl Client {
    /// Connect over TCP and consume the greeting.
    pub async fn connect(host: &str, port: u16) -> Result<Self, ClientError> {
        let stream = TcpStream::connect((host, port)).await?;
        Self::from_transport(Box::new(stream)).await
    }

    /// Connect over a Unix socket and consume the greeting.
    pub async fn connect_unix(path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path).await?;
        Self::from_transport(Box::new(stream)).await
    }

    /// Wrap an already-connected transport (used by tests).
    pub async fn from_transport(stream: Box<dyn Transport>) -> Result<Self, ClientError> {
        let (r, w) = tokio::io::split(stream);
        let mut client = Client {
            reader: BufReader::new(r),
            writer: w,
            algorithm: Algorithm::Sha1,
            nonce: Vec::new(),
            user: None,
        };
        client.read_greeting().await?;
        Ok(client)
    }

    async fn read_greeting(&mut self) -> Result<(), ClientError> {
        let line = self.read_line().await?.ok_or(ClientError::Eof)?;
        let greeting = Status::parse(&line)?;
        if greeting.code != status::GREETING {
            return Err(ClientError::BadGreeting(line));
        }
        let words = split(&greeting.text, SplitFlags::empty())?;
        let [version, algorithm, nonce] = words.as_slice() else {
            return Err(ClientError::BadGreeting(line));
        };
        let version: u32 = version
            .parse()
            .map_err(|_| ClientError::BadGreeting(line.clone()))?;
        if version != PROTOCOL_VERSION {
            return Err(ClientError::BadVersion(version));
        }
        self.algorithm = algorithm.parse()?;
        self.nonce = hex::decode(nonce).map_err(|_| ClientError::BadGreeting(line.clone()))?;
        debug!(algorithm = %self.algorithm, "greeting received");
        Ok(())
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The username the server bound to this session, if authenticated.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Authenticate with the challenge/response handshake.
    pub async fn login(&mut self, user: &str, password: &str) -> Result<Response, ClientError> {
        let response = hash_response(self.algorithm, &self.nonce, password);
        let reply = self.command(&["user", user, &response]).await?;
        if reply.is_success() {
            self.user = Some(user.to_string());
        }
        Ok(reply)
    }

    /// Exchange a cookie for a session; on `232` the server echoes the
    /// username the cookie is bound to.
    pub async fn login_cookie(&mut self, cookie: &str) -> Result<Response, ClientError> {
        let reply = self.command(&["cookie", cookie]).await?;
        if reply.status.code == status::COOKIE_USER {
            self.user = Some(reply.status.text.clone());
        }
        Ok(reply)
    }

    /// Send one command and read its response.
    pub async fn command(&mut self, words: &[&str]) -> Result<Response, ClientError> {
        self.send_line(&quote(words.iter().copied())).await?;
        self.read_response().await
    }

    /// Send a body-carrying command: the body follows the command line,
    /// dot-escaped and dot-terminated, and the response comes after.
    pub async fn command_with_body(
        &mut self,
        words: &[&str],
        body: &[String],
    ) -> Result<Response, ClientError> {
        self.send_line(&quote(words.iter().copied())).await?;
        for line in body {
            self.send_line(&crate::escape_body_line(line)).await?;
        }
        self.send_line(BODY_TERMINATOR).await?;
        self.read_response().await
    }

    /// Like [`command`] but errors on a non-2xx status.
    pub async fn expect(&mut self, words: &[&str]) -> Result<Response, ClientError> {
        let reply = self.command(words).await?;
        if reply.is_success() {
            Ok(reply)
        } else {
            Err(ClientError::Rejected {
                command: words.join(" "),
                status: reply.status,
            })
        }
    }

    /// After a `254` response to `log`, read the next event line. `None`
    /// means the server closed the stream.
    pub async fn next_event(&mut self) -> Result<Option<String>, ClientError> {
        self.read_line().await
    }

    async fn read_response(&mut self) -> Result<Response, ClientError> {
        let line = self.read_line().await?.ok_or(ClientError::Eof)?;
        let status = Status::parse(&line)?;
        let body = if status.has_body() {
            let mut lines = Vec::new();
            loop {
                let line = self.read_line().await?.ok_or(ClientError::Eof)?;
                if line == BODY_TERMINATOR {
                    break;
                }
                lines.push(unescape_body_line(&line));
            }
            Some(lines)
        } else {
            None
        };
        Ok(Response { status, body })
    }

    async fn send_line(&mut self, line: &str) -> Result<(), ClientError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<Option<String>, ClientError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        if line.ends_with('\n') {
            line.pop();
        }
        Ok(Some(line))
    }
}

/// The user's connection settings, passwd-style: one `key args...` per
/// line, parsed with the shared splitter.
///
/// ```text
/// username alice
/// password secret
/// connect jukebox.example.com 24600
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub socket: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum UserConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

impl UserConfig {
    pub fn load(path: &Path) -> Result<Self, UserConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| UserConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    fn parse(text: &str, path: &Path) -> Result<Self, UserConfigError> {
        let mut config = UserConfig::default();
        for (lineno, raw) in text.lines().enumerate() {
            let lineno = lineno + 1;
            let err = |message: String| UserConfigError::Parse {
                path: path.to_path_buf(),
                line: lineno,
                message,
            };
            let words = split(raw, SplitFlags::QUOTES | SplitFlags::COMMENTS)
                .map_err(|e| err(e.to_string()))?;
            let Some((key, args)) = words.split_first() else {
                continue;
            };
            match (key.as_str(), args) {
                ("username", [u]) => config.username = Some(u.clone()),
                ("password", [p]) => config.password = Some(p.clone()),
                ("connect", [host, port]) => {
                    config.host = Some(host.clone());
                    config.port = Some(
                        port.parse()
                            .map_err(|_| err(format!("bad port {:?}", port)))?,
                    );
                }
                ("socket", [p]) => config.socket = Some(PathBuf::from(p)),
                _ => return Err(err(format!("unknown or malformed directive {:?}", key))),
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_user_config_parse() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# rockola user config").unwrap();
        writeln!(file, "username alice").unwrap();
        writeln!(file, "password \"secret word\"").unwrap();
        writeln!(file, "connect jukebox.local 24600").unwrap();
        let config = UserConfig::load(file.path()).unwrap();
        assert_eq!(config.username.as_deref(), Some("alice"));
        assert_eq!(config.password.as_deref(), Some("secret word"));
        assert_eq!(config.host.as_deref(), Some("jukebox.local"));
        assert_eq!(config.port, Some(24600));
    }

    #[test]
    fn test_user_config_bad_directive() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "usrename alice").unwrap();
        let err = UserConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains(":1:"));
    }

    #[test]
    fn test_user_config_bad_port() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "connect host notaport").unwrap();
        assert!(UserConfig::load(file.path()).is_err());
    }

    #[tokio::test]
    async fn test_handshake_and_command_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
            let (stream, _) = listener.accept().await.unwrap();
            let (r, mut w) = stream.into_split();
            let mut lines = BufReader::new(r).lines();
            w.write_all(b"231 2 sha256 6e6f6e6365\n").await.unwrap();

            let line = lines.next_line().await.unwrap().unwrap();
            // "password" hashed against nonce "nonce"
            assert_eq!(
                line,
                "user alice 813c7639907afba393568662156439b303eb8bee9bfe884817f30c64a2fb8ac8"
            );
            w.write_all(b"230 OK\n").await.unwrap();

            let line = lines.next_line().await.unwrap().unwrap();
            assert_eq!(line, "queue");
            w.write_all(b"253 queue follows\n..dotted\nplain\n.\n")
                .await
                .unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = Client::from_transport(Box::new(stream)).await.unwrap();
        assert_eq!(client.algorithm(), Algorithm::Sha256);

        let reply = client.login("alice", "password").await.unwrap();
        assert!(reply.is_success());
        assert_eq!(client.user(), Some("alice"));

        let reply = client.command(&["queue"]).await.unwrap();
        assert_eq!(reply.status.code, 253);
        assert_eq!(reply.lines(), [".dotted".to_string(), "plain".to_string()]);

        server.await.unwrap();
    }
}
