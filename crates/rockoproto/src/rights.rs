//! The capability bitmask evaluated on every privileged operation.
//!
//! Rights are granted per user and snapshotted onto a connection at
//! authentication time. The `move`/`remove`/`scratch` families come in
//! `own`/`random`/`any` variants: `own` covers entries the acting user
//! submitted, `random` covers entries the random chooser injected, `any`
//! covers everything.

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Rights: u32 {
        const READ = 1 << 0;
        const PLAY = 1 << 1;
        const MOVE_OWN = 1 << 2;
        const MOVE_RANDOM = 1 << 3;
        const MOVE_ANY = 1 << 4;
        const REMOVE_OWN = 1 << 5;
        const REMOVE_RANDOM = 1 << 6;
        const REMOVE_ANY = 1 << 7;
        const SCRATCH_OWN = 1 << 8;
        const SCRATCH_RANDOM = 1 << 9;
        const SCRATCH_ANY = 1 << 10;
        const PAUSE = 1 << 11;
        const REGISTER = 1 << 12;
        const ADMIN = 1 << 13;
        const PREFS = 1 << 14;
        const GLOBAL_PREFS = 1 << 15;
        const USERINFO = 1 << 16;
        const VOLUME = 1 << 17;
        const RESCAN = 1 << 18;
        /// Granted only on Unix-socket connections, never stored.
        const LOCAL = 1 << 19;
    }
}

const NAMES: &[(&str, Rights)] = &[
    ("read", Rights::READ),
    ("play", Rights::PLAY),
    ("move-own", Rights::MOVE_OWN),
    ("move-random", Rights::MOVE_RANDOM),
    ("move-any", Rights::MOVE_ANY),
    ("remove-own", Rights::REMOVE_OWN),
    ("remove-random", Rights::REMOVE_RANDOM),
    ("remove-any", Rights::REMOVE_ANY),
    ("scratch-own", Rights::SCRATCH_OWN),
    ("scratch-random", Rights::SCRATCH_RANDOM),
    ("scratch-any", Rights::SCRATCH_ANY),
    ("pause", Rights::PAUSE),
    ("register", Rights::REGISTER),
    ("admin", Rights::ADMIN),
    ("prefs", Rights::PREFS),
    ("global-prefs", Rights::GLOBAL_PREFS),
    ("userinfo", Rights::USERINFO),
    ("volume", Rights::VOLUME),
    ("rescan", Rights::RESCAN),
    ("_local", Rights::LOCAL),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RightsError {
    #[error("unknown right {0:?}")]
    Unknown(String),
}

impl Rights {
    /// Every grantable right; excludes the internal `_local` marker.
    pub fn all_grantable() -> Rights {
        Rights::all() - Rights::LOCAL
    }

    /// Parse a comma- or whitespace-separated rights list. `all` expands to
    /// every grantable right.
    pub fn parse(s: &str) -> Result<Rights, RightsError> {
        let mut rights = Rights::empty();
        for name in s.split(|c: char| c == ',' || c.is_whitespace()) {
            if name.is_empty() {
                continue;
            }
            if name == "all" {
                rights |= Rights::all_grantable();
                continue;
            }
            match NAMES.iter().find(|(n, _)| *n == name) {
                Some((_, r)) => rights |= *r,
                None => return Err(RightsError::Unknown(name.to_string())),
            }
        }
        Ok(rights)
    }

    /// Strip bits that must never be persisted.
    pub fn storable(self) -> Rights {
        self - Rights::LOCAL
    }

    fn ownership_ok(
        self,
        own: Rights,
        random: Rights,
        any: Rights,
        who: &str,
        submitter: Option<&str>,
        is_random: bool,
    ) -> bool {
        if self.contains(any) {
            return true;
        }
        if self.contains(random) && is_random {
            return true;
        }
        self.contains(own) && submitter == Some(who)
    }

    /// May `who` move an entry submitted by `submitter`?
    pub fn can_move(self, who: &str, submitter: Option<&str>, is_random: bool) -> bool {
        self.ownership_ok(
            Rights::MOVE_OWN,
            Rights::MOVE_RANDOM,
            Rights::MOVE_ANY,
            who,
            submitter,
            is_random,
        )
    }

    /// May `who` remove an entry submitted by `submitter`?
    pub fn can_remove(self, who: &str, submitter: Option<&str>, is_random: bool) -> bool {
        self.ownership_ok(
            Rights::REMOVE_OWN,
            Rights::REMOVE_RANDOM,
            Rights::REMOVE_ANY,
            who,
            submitter,
            is_random,
        )
    }

    /// May `who` scratch the playing entry submitted by `submitter`?
    pub fn can_scratch(self, who: &str, submitter: Option<&str>, is_random: bool) -> bool {
        self.ownership_ok(
            Rights::SCRATCH_OWN,
            Rights::SCRATCH_RANDOM,
            Rights::SCRATCH_ANY,
            who,
            submitter,
            is_random,
        )
    }
}

impl std::fmt::Display for Rights {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (name, right) in NAMES {
            if self.contains(*right) {
                if !first {
                    f.write_str(",")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}
