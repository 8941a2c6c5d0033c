//! Thin command-line client for the Rockola jukebox.
//!
//! Maps 1:1 onto protocol commands: `rkcli play tracks/song.ogg` sends
//! `play tracks/song.ogg` and prints the response. Exit status is 0 for
//! any 2xx response and 1 otherwise. `rkcli log` follows the event log
//! until interrupted; `rkcli playlist-set NAME` reads the body from
//! stdin.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use rockoproto::{Client, UserConfig};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// User config file (default: ~/.config/rockola/passwd)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server host (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Server port (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Local server socket (overrides host/port)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Username (overrides the config file)
    #[arg(short, long)]
    user: Option<String>,

    /// Password (overrides the config file)
    #[arg(short, long)]
    password: Option<String>,

    /// Protocol command and its arguments, passed through verbatim
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

fn user_config(cli: &Cli) -> Result<UserConfig> {
    let path = match &cli.config {
        Some(path) => Some(path.clone()),
        None => directories::ProjectDirs::from("", "", "rockola")
            .map(|dirs| dirs.config_dir().join("passwd"))
            .filter(|p| p.exists()),
    };
    let mut config = match path {
        Some(path) => UserConfig::load(&path)
            .with_context(|| format!("cannot read {}", path.display()))?,
        None => UserConfig::default(),
    };
    if let Some(host) = &cli.host {
        config.host = Some(host.clone());
    }
    if let Some(port) = cli.port {
        config.port = Some(port);
    }
    if let Some(socket) = &cli.socket {
        config.socket = Some(socket.clone());
    }
    if let Some(user) = &cli.user {
        config.username = Some(user.clone());
    }
    if let Some(password) = &cli.password {
        config.password = Some(password.clone());
    }
    Ok(config)
}

async fn connect(config: &UserConfig) -> Result<Client> {
    if let Some(socket) = &config.socket {
        return Client::connect_unix(socket)
            .await
            .with_context(|| format!("cannot connect to {}", socket.display()));
    }
    let host = config.host.as_deref().unwrap_or("localhost");
    let port = config.port.unwrap_or(rockoconf::DEFAULT_PORT);
    Client::connect(host, port)
        .await
        .with_context(|| format!("cannot connect to {}:{}", host, port))
}

async fn run(cli: Cli) -> Result<bool> {
    let config = user_config(&cli)?;
    let mut client = connect(&config).await?;

    if let (Some(user), Some(password)) = (&config.username, &config.password) {
        let reply = client.login(user, password).await?;
        if !reply.is_success() {
            bail!("login failed: {}", reply.status);
        }
    }

    let words: Vec<&str> = cli.command.iter().map(|s| s.as_str()).collect();

    // Body-carrying commands read their payload from stdin.
    let reply = if words[0] == "playlist-set" {
        let mut body = String::new();
        std::io::stdin()
            .read_to_string(&mut body)
            .context("cannot read body from stdin")?;
        let lines: Vec<String> = body.lines().map(|l| l.to_string()).collect();
        client.command_with_body(&words, &lines).await?
    } else {
        client.command(&words).await?
    };

    println!("{}", reply.status);
    for line in reply.lines() {
        println!("{}", line);
    }

    // `log` keeps the stream open; relay events until the server closes.
    if reply.status.is_log_follows() {
        while let Some(event) = client.next_event().await? {
            println!("{}", event);
        }
    }

    Ok(reply.is_success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("rkcli").chain(args.iter().copied()))
    }

    #[test]
    fn test_flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "username alice").unwrap();
        writeln!(file, "password secret").unwrap();
        writeln!(file, "connect jukebox.local 24600").unwrap();

        let path = file.path().to_string_lossy().into_owned();
        let cli = cli(&[
            "--config", &path, "--user", "bob", "--port", "9999", "queue",
        ]);
        let config = user_config(&cli).unwrap();
        assert_eq!(config.username.as_deref(), Some("bob"));
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.host.as_deref(), Some("jukebox.local"));
        assert_eq!(config.port, Some(9999));
    }

    #[test]
    fn test_trailing_command_words_pass_through() {
        let cli = cli(&["play", "tracks/some song.ogg"]);
        assert_eq!(cli.command, vec!["play", "tracks/some song.ogg"]);
    }

    #[test]
    fn test_socket_flag() {
        let cli = cli(&["--socket", "/run/rockola/socket", "version"]);
        let config = user_config(&cli).unwrap();
        assert_eq!(
            config.socket,
            Some(PathBuf::from("/run/rockola/socket"))
        );
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("rkcli: {}", e);
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(cli)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("rkcli: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
