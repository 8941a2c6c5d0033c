//! Configuration loading for the Rockola jukebox.
//!
//! Config files are line-oriented: one directive per line, words split
//! with the same shell-style grammar the protocol uses (quotes and `#`
//! comments). Parse errors name the file and line number.
//!
//! # Config File Locations
//!
//! Files are tried in order (first hit wins):
//! 1. The `--config` path, if given
//! 2. `/etc/rockola/config` (system)
//! 3. `~/.config/rockola/config` (user)
//!
//! When discovery finds no file at all, compiled defaults apply; an
//! explicitly given path that cannot be read is an error.
//!
//! # Example Config
//!
//! ```text
//! # where the music lives
//! collection /srv/music
//! player "*.raw" cat
//! player "*.ogg" ogg123 -q -d raw -f -
//! scratch /srv/jingles/scratch1.ogg
//!
//! listen 0.0.0.0 24600
//! socket /var/run/rockola/socket
//! broadcast 239.3.2.1 9005
//! multicast_ttl 3
//!
//! queue_pad 8
//! default_rights read,play,pause,scratch-own,volume
//! authorization_algorithm sha256
//! ```

pub mod pattern;

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use rockoproto::{split, Algorithm, Rights, SplitFlags};

/// Default TCP port, also used by `rkcli` when none is configured.
pub const DEFAULT_PORT: u16 = 24600;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
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

/// One decoder table row: tracks whose basename matches `pattern` are
/// decoded by `command`. A `{}` argument is replaced with the track path;
/// without one the path is appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerSpec {
    pub pattern: String,
    pub command: Vec<String>,
}

impl PlayerSpec {
    /// Expand the command line for a concrete track path.
    pub fn command_for(&self, track: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.command.len() + 1);
        let mut substituted = false;
        for word in &self.command {
            if word == "{}" {
                out.push(track.to_string());
                substituted = true;
            } else {
                out.push(word.clone());
            }
        }
        if !substituted {
            out.push(track.to_string());
        }
        out
    }
}

/// Which audio sink the mixer driver feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Api {
    /// Packetize to RTP (the network jukebox case).
    #[default]
    Rtp,
    /// Pipe raw PCM into a subprocess given by `speaker_command`.
    Command,
    /// No audio output; queue management only.
    None,
}

/// Complete daemon configuration. Plain data, threaded through the server
/// context; nothing in here is global.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// TCP listeners as (address, port).
    pub listen: Vec<(String, u16)>,
    /// Unix socket listener path.
    pub socket: Option<PathBuf>,
    /// State directory (queue snapshot, user/pref/playlist/schedule files).
    pub home: PathBuf,
    /// Track collection roots.
    pub collections: Vec<PathBuf>,
    /// Decoder table, first match wins.
    pub players: Vec<PlayerSpec>,
    /// Scratch jingle tracks.
    pub scratches: Vec<String>,

    pub api: Api,
    /// Subprocess for `api command`, fed 16-bit native-endian PCM on stdin.
    pub speaker_command: Option<Vec<String>>,

    /// RTP destination as (address, port).
    pub broadcast: Option<(String, u16)>,
    /// Source address to bind before connecting.
    pub broadcast_from: Option<(String, u16)>,
    pub multicast_ttl: u32,
    pub multicast_loop: bool,
    pub rtp_max_payload: usize,

    pub queue_pad: usize,
    /// Seconds before a played track is eligible for random choice again.
    pub replay_min: u64,
    /// How many newest tracks the "new" list reports.
    pub new_max: usize,
    /// Age in seconds under which a track counts as new for bias purposes.
    pub new_bias_age: u64,
    /// Relative weight of a new track in the random chooser.
    pub new_bias: u64,
    /// Bound on the recently-played list.
    pub history: usize,

    pub playlist_max: usize,
    pub playlist_lock_timeout: Duration,

    pub cookie_login_lifetime: Duration,
    pub cookie_key_lifetime: Duration,
    pub default_rights: Rights,
    pub remote_userman: bool,
    pub authorization_algorithm: Algorithm,

    /// Minimum gap between password reminder mails per user.
    pub reminder_interval: Duration,
    pub mail_sender: Option<String>,
    /// Sendmail-compatible binary used by `register` and `reminder`.
    pub sendmail: Option<PathBuf>,

    pub sample_rate: u32,
    pub channels: u8,

    /// Writer time bound: max gap between successful writes.
    pub connection_timeout: Duration,
    /// Writer space bound: max buffered bytes per connection.
    pub connection_buffer: usize,
    /// Hard bound on simultaneous client connections.
    pub max_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        let home = directories::ProjectDirs::from("", "", "rockola")
            .map(|d| d.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("/var/lib/rockola"));
        Config {
            listen: Vec::new(),
            socket: None,
            home,
            collections: Vec::new(),
            players: Vec::new(),
            scratches: Vec::new(),
            api: Api::default(),
            speaker_command: None,
            broadcast: None,
            broadcast_from: None,
            multicast_ttl: 1,
            multicast_loop: true,
            rtp_max_payload: 1444,
            queue_pad: 10,
            replay_min: 8 * 3600,
            new_max: 100,
            new_bias_age: 7 * 24 * 3600,
            new_bias: 900_000,
            history: 60,
            playlist_max: 500,
            playlist_lock_timeout: Duration::from_secs(600),
            cookie_login_lifetime: Duration::from_secs(24 * 3600),
            cookie_key_lifetime: Duration::from_secs(7 * 24 * 3600),
            default_rights: Rights::all_grantable() - Rights::ADMIN,
            remote_userman: false,
            authorization_algorithm: Algorithm::Sha1,
            reminder_interval: Duration::from_secs(600),
            mail_sender: None,
            sendmail: None,
            sample_rate: 44100,
            channels: 2,
            connection_timeout: Duration::from_secs(600),
            connection_buffer: 512 * 1024,
            max_connections: 128,
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the discovery order when
    /// `None`. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let Some(path) = discover(path) else {
            debug!("no config file found, using defaults");
            return Ok(Config::default());
        };
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::FileRead {
            path: path.clone(),
            source,
        })?;
        let mut config = Config::default();
        config.apply(&text, &path)?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parse `text` (from `path`, for diagnostics) over the current values.
    pub fn apply(&mut self, text: &str, path: &Path) -> Result<(), ConfigError> {
        for (lineno, raw) in text.lines().enumerate() {
            let lineno = lineno + 1;
            let err = |message: String| ConfigError::Parse {
                path: path.to_path_buf(),
                line: lineno,
                message,
            };
            let words = split(raw, SplitFlags::QUOTES | SplitFlags::COMMENTS)
                .map_err(|e| err(e.to_string()))?;
            let Some((key, args)) = words.split_first() else {
                continue;
            };
            self.directive(key, args).map_err(err)?;
        }
        Ok(())
    }

    fn directive(&mut self, key: &str, args: &[String]) -> Result<(), String> {
        match (key, args) {
            ("listen", [addr, port]) => self.listen.push((addr.clone(), parse_port(port)?)),
            ("socket", [path]) => self.socket = Some(PathBuf::from(path)),
            ("home", [path]) => self.home = PathBuf::from(path),
            ("collection", [path]) => self.collections.push(PathBuf::from(path)),
            ("player", [pattern, command @ ..]) if !command.is_empty() => {
                self.players.push(PlayerSpec {
                    pattern: pattern.clone(),
                    command: command.to_vec(),
                })
            }
            ("scratch", [track]) => self.scratches.push(track.clone()),
            ("api", [name]) => {
                self.api = match name.as_str() {
                    "rtp" => Api::Rtp,
                    "command" => Api::Command,
                    "none" => Api::None,
                    other => return Err(format!("unknown api {:?}", other)),
                }
            }
            ("speaker_command", command @ [_, ..]) => {
                self.speaker_command = Some(command.to_vec())
            }
            ("broadcast", [addr, port]) => {
                self.broadcast = Some((addr.clone(), parse_port(port)?))
            }
            ("broadcast_from", [addr, port]) => {
                self.broadcast_from = Some((addr.clone(), parse_port(port)?))
            }
            ("multicast_ttl", [n]) => self.multicast_ttl = parse_num(n)?,
            ("multicast_loop", [v]) => self.multicast_loop = parse_bool(v)?,
            ("rtp_max_payload", [n]) => self.rtp_max_payload = parse_num(n)?,
            ("queue_pad", [n]) => self.queue_pad = parse_num(n)?,
            ("replay_min", [n]) => self.replay_min = parse_num(n)?,
            ("new_max", [n]) => self.new_max = parse_num(n)?,
            ("new_bias_age", [n]) => self.new_bias_age = parse_num(n)?,
            ("new_bias", [n]) => self.new_bias = parse_num(n)?,
            ("history", [n]) => self.history = parse_num(n)?,
            ("playlist_max", [n]) => self.playlist_max = parse_num(n)?,
            ("playlist_lock_timeout", [n]) => {
                self.playlist_lock_timeout = Duration::from_secs(parse_num(n)?)
            }
            ("cookie_login_lifetime", [n]) => {
                self.cookie_login_lifetime = Duration::from_secs(parse_num(n)?)
            }
            ("cookie_key_lifetime", [n]) => {
                self.cookie_key_lifetime = Duration::from_secs(parse_num(n)?)
            }
            ("default_rights", [r]) => {
                self.default_rights = Rights::parse(r).map_err(|e| e.to_string())?.storable()
            }
            ("remote_userman", [v]) => self.remote_userman = parse_bool(v)?,
            ("authorization_algorithm", [a]) => {
                self.authorization_algorithm = a.parse().map_err(
                    |e: rockoproto::auth::UnknownAlgorithm| e.to_string(),
                )?
            }
            ("reminder_interval", [n]) => {
                self.reminder_interval = Duration::from_secs(parse_num(n)?)
            }
            ("mail_sender", [addr]) => self.mail_sender = Some(addr.clone()),
            ("sendmail", [path]) => self.sendmail = Some(PathBuf::from(path)),
            ("sample_rate", [n]) => self.sample_rate = parse_num(n)?,
            ("channels", [n]) => self.channels = parse_num(n)?,
            ("connection_timeout", [n]) => {
                self.connection_timeout = Duration::from_secs(parse_num(n)?)
            }
            ("connection_buffer", [n]) => self.connection_buffer = parse_num(n)?,
            ("max_connections", [n]) => self.max_connections = parse_num(n)?,
            _ => {
                return Err(format!(
                    "unknown or malformed directive {:?} with {} argument(s)",
                    key,
                    args.len()
                ))
            }
        }
        Ok(())
    }

    /// Find the decoder for a track, first match wins.
    pub fn find_player(&self, track: &str) -> Option<&PlayerSpec> {
        let basename = track.rsplit('/').next().unwrap_or(track);
        self.players
            .iter()
            .find(|p| pattern::glob_match(&p.pattern, basename))
    }

    /// Frame size in bytes: 16-bit samples times channel count.
    pub fn frame_bytes(&self) -> usize {
        2 * self.channels as usize
    }
}

fn discover(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let system = PathBuf::from("/etc/rockola/config");
    if system.exists() {
        return Some(system);
    }
    let user = directories::ProjectDirs::from("", "", "rockola")
        .map(|d| d.config_dir().join("config"))?;
    user.exists().then_some(user)
}

fn parse_port(s: &str) -> Result<u16, String> {
    s.parse().map_err(|_| format!("bad port {:?}", s))
}

fn parse_num<T: std::str::FromStr>(s: &str) -> Result<T, String> {
    s.parse().map_err(|_| format!("bad number {:?}", s))
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s {
        "yes" | "on" | "true" => Ok(true),
        "no" | "off" | "false" => Ok(false),
        _ => Err(format!("bad boolean {:?} (want yes or no)", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(text: &str) -> Result<Config, ConfigError> {
        let mut config = Config::default();
        config.apply(text, Path::new("test-config"))?;
        Ok(config)
    }

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.queue_pad, 10);
        assert_eq!(c.rtp_max_payload, 1444);
        assert_eq!(c.connection_buffer, 512 * 1024);
        assert_eq!(c.connection_timeout, Duration::from_secs(600));
        assert!(!c.default_rights.contains(Rights::ADMIN));
        assert!(c.default_rights.contains(Rights::PLAY));
    }

    #[test]
    fn test_parse_listeners_and_collections() {
        let c = parse(
            "# a config\n\
             listen 0.0.0.0 24600\n\
             listen ::1 24601\n\
             socket /run/rockola/socket\n\
             collection /srv/music\n\
             collection \"/srv/more music\"\n",
        )
        .unwrap();
        assert_eq!(c.listen.len(), 2);
        assert_eq!(c.listen[1], ("::1".to_string(), 24601));
        assert_eq!(c.socket, Some(PathBuf::from("/run/rockola/socket")));
        assert_eq!(c.collections[1], PathBuf::from("/srv/more music"));
    }

    #[test]
    fn test_parse_players_and_scratch() {
        let c = parse(
            "player *.ogg ogg123 -q -d raw -f {}\n\
             player *.raw cat\n\
             scratch /srv/jingles/yell.ogg\n",
        )
        .unwrap();
        assert_eq!(c.players.len(), 2);
        let p = c.find_player("/srv/music/a/b/tune.ogg").unwrap();
        assert_eq!(
            p.command_for("/srv/music/a/b/tune.ogg"),
            vec!["ogg123", "-q", "-d", "raw", "-f", "/srv/music/a/b/tune.ogg"]
        );
        let p = c.find_player("x.raw").unwrap();
        assert_eq!(p.command_for("x.raw"), vec!["cat", "x.raw"]);
        assert!(c.find_player("x.flac").is_none());
        assert_eq!(c.scratches, vec!["/srv/jingles/yell.ogg"]);
    }

    #[test]
    fn test_parse_tunables() {
        let c = parse(
            "queue_pad 3\n\
             replay_min 3600\n\
             multicast_loop no\n\
             authorization_algorithm sha256\n\
             default_rights read,play\n\
             remote_userman yes\n",
        )
        .unwrap();
        assert_eq!(c.queue_pad, 3);
        assert_eq!(c.replay_min, 3600);
        assert!(!c.multicast_loop);
        assert_eq!(c.authorization_algorithm, Algorithm::Sha256);
        assert_eq!(c.default_rights, Rights::READ | Rights::PLAY);
        assert!(c.remote_userman);
    }

    #[test]
    fn test_unknown_directive_names_line() {
        let err = parse("listen 0.0.0.0 24600\nbogus_key 1\n").unwrap_err();
        assert_eq!(err.to_string(), "test-config:2: unknown or malformed directive \"bogus_key\" with 1 argument(s)");
    }

    #[test]
    fn test_arity_errors() {
        assert!(parse("listen 0.0.0.0\n").is_err());
        assert!(parse("player *.ogg\n").is_err());
        assert!(parse("queue_pad many\n").is_err());
        assert!(parse("multicast_loop maybe\n").is_err());
    }

    #[test]
    fn test_split_errors_carry_line_numbers() {
        let err = parse("\n\nplayer \"*.ogg ogg123\n").unwrap_err();
        assert!(err.to_string().starts_with("test-config:3:"));
    }

    #[test]
    fn test_load_missing_file_is_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-config");
        // Explicit path that does not exist is an error...
        assert!(Config::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "queue_pad 4\nhome /tmp/rockola-test\n").unwrap();
        let c = Config::load(Some(&path)).unwrap();
        assert_eq!(c.queue_pad, 4);
        assert_eq!(c.home, PathBuf::from("/tmp/rockola-test"));
    }
}
