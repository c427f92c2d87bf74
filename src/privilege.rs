//! Scoped privilege lowering around filesystem writes
//!
//! The benchmark runs as root (ptrace, instrumentation), but every file it
//! writes is written as the invoking user. [`PrivilegeGuard`] lowers the
//! effective uid/gid and resets supplementary groups on construction and
//! restores all three in `Drop`, so restoration happens on success, on error
//! and during unwinding alike.

use std::io;
use std::path::Path;
use std::str::FromStr;

use nix::unistd::{Gid, Uid, User};

use crate::error::{BenchError, ConfigError, Result};

/// An effective uid/gid pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: Uid,
    pub gid: Gid,
}

impl Identity {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid: Uid::from_raw(uid),
            gid: Gid::from_raw(gid),
        }
    }

    /// Identity of the user who invoked sudo
    pub fn from_env() -> Option<Self> {
        Self::from_vars(
            std::env::var("SUDO_UID").ok().as_deref(),
            std::env::var("SUDO_GID").ok().as_deref(),
        )
    }

    fn from_vars(uid: Option<&str>, gid: Option<&str>) -> Option<Self> {
        let uid = uid?.trim().parse().ok()?;
        let gid = gid?.trim().parse().ok()?;
        Some(Self::new(uid, gid))
    }

    /// Pick the identity used for file writes
    ///
    /// An explicit identity wins, then the sudo environment. A process that
    /// is not running as root writes as itself.
    pub fn resolve(explicit: Option<Identity>, current: Identity) -> Option<Identity> {
        explicit
            .or_else(Self::from_env)
            .or_else(|| (!current.uid.is_root()).then_some(current))
    }
}

impl FromStr for Identity {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidIdentity(s.to_string());
        match s.split_once(':') {
            Some((uid, gid)) => {
                let uid = uid.parse().map_err(|_| invalid())?;
                let gid = gid.parse().map_err(|_| invalid())?;
                Ok(Self::new(uid, gid))
            }
            None => {
                let uid = Uid::from_raw(s.parse().map_err(|_| invalid())?);
                let user = User::from_uid(uid).ok().flatten().ok_or_else(invalid)?;
                Ok(Self { uid, gid: user.gid })
            }
        }
    }
}

/// Process credential operations, split out so guards can be tested unprivileged
pub trait Credentials: Send + Sync {
    fn effective(&self) -> Identity;
    fn groups(&self) -> nix::Result<Vec<Gid>>;
    fn set_groups(&self, groups: &[Gid]) -> nix::Result<()>;
    fn set_effective_uid(&self, uid: Uid) -> nix::Result<()>;
    fn set_effective_gid(&self, gid: Gid) -> nix::Result<()>;
}

/// Credentials of the running process
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessCredentials;

impl Credentials for ProcessCredentials {
    fn effective(&self) -> Identity {
        Identity {
            uid: nix::unistd::geteuid(),
            gid: nix::unistd::getegid(),
        }
    }

    fn groups(&self) -> nix::Result<Vec<Gid>> {
        nix::unistd::getgroups()
    }

    fn set_groups(&self, groups: &[Gid]) -> nix::Result<()> {
        nix::unistd::setgroups(groups)
    }

    fn set_effective_uid(&self, uid: Uid) -> nix::Result<()> {
        nix::unistd::seteuid(uid)
    }

    fn set_effective_gid(&self, gid: Gid) -> nix::Result<()> {
        nix::unistd::setegid(gid)
    }
}

/// Lowered privileges, restored when dropped
#[must_use = "privileges are restored as soon as the guard is dropped"]
pub struct PrivilegeGuard<'a, C: Credentials + ?Sized> {
    creds: &'a C,
    saved: Identity,
    saved_groups: Option<Vec<Gid>>,
    lowered: bool,
}

impl<'a, C: Credentials + ?Sized> PrivilegeGuard<'a, C> {
    /// Lower effective privileges to `target`
    ///
    /// On failure every step already taken is undone before returning.
    pub fn lower(creds: &'a C, target: Identity) -> nix::Result<Self> {
        let saved = creds.effective();
        let mut guard = Self {
            creds,
            saved,
            saved_groups: None,
            lowered: false,
        };
        if saved == target {
            return Ok(guard);
        }

        // Group changes need privilege, so they go before the uid drop
        if saved.uid.is_root() {
            let groups = creds.groups()?;
            creds.set_groups(&[target.gid])?;
            guard.saved_groups = Some(groups);
        }
        guard.lowered = true;
        creds.set_effective_gid(target.gid)?;
        creds.set_effective_uid(target.uid)?;
        tracing::trace!(uid = %target.uid, gid = %target.gid, "privileges lowered");
        Ok(guard)
    }

    fn restore(&mut self) {
        if self.lowered {
            if let Err(e) = self.creds.set_effective_uid(self.saved.uid) {
                tracing::error!("failed to restore effective uid {}: {}", self.saved.uid, e);
            }
            if let Err(e) = self.creds.set_effective_gid(self.saved.gid) {
                tracing::error!("failed to restore effective gid {}: {}", self.saved.gid, e);
            }
            self.lowered = false;
        }
        if let Some(groups) = self.saved_groups.take() {
            if let Err(e) = self.creds.set_groups(&groups) {
                tracing::error!("failed to restore supplementary groups: {}", e);
            }
        }
    }
}

impl<C: Credentials + ?Sized> Drop for PrivilegeGuard<'_, C> {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Run the file operation `op` on `path` as `identity`
///
/// Without an identity the operation is skipped with `BenchError::Privilege`;
/// it never runs elevated.
pub fn run_unprivileged<C, T, F>(
    creds: &C,
    identity: Option<Identity>,
    path: &Path,
    op: F,
) -> Result<T>
where
    C: Credentials + ?Sized,
    F: FnOnce() -> io::Result<T>,
{
    let identity = identity.ok_or_else(|| BenchError::Privilege {
        path: path.to_path_buf(),
        reason: "unable to determine an unprivileged identity (run via sudo or pass --user)"
            .to_string(),
    })?;
    let _guard = PrivilegeGuard::lower(creds, identity).map_err(|e| BenchError::Privilege {
        path: path.to_path_buf(),
        reason: format!("failed to drop privileges: {}", e),
    })?;
    op().map_err(|source| BenchError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Credential state machine with optional injected failures
    #[derive(Debug)]
    pub struct FakeCredentials {
        pub state: Mutex<(Identity, Vec<Gid>)>,
        pub fail_uid_drop: bool,
    }

    impl FakeCredentials {
        pub fn root() -> Self {
            Self {
                state: Mutex::new((Identity::new(0, 0), vec![Gid::from_raw(0), Gid::from_raw(4)])),
                fail_uid_drop: false,
            }
        }

        pub fn current(&self) -> Identity {
            self.state.lock().unwrap().0
        }

        pub fn current_groups(&self) -> Vec<Gid> {
            self.state.lock().unwrap().1.clone()
        }
    }

    impl Credentials for FakeCredentials {
        fn effective(&self) -> Identity {
            self.current()
        }

        fn groups(&self) -> nix::Result<Vec<Gid>> {
            Ok(self.current_groups())
        }

        fn set_groups(&self, groups: &[Gid]) -> nix::Result<()> {
            let mut state = self.state.lock().unwrap();
            if !state.0.uid.is_root() {
                return Err(nix::Error::EPERM);
            }
            state.1 = groups.to_vec();
            Ok(())
        }

        fn set_effective_uid(&self, uid: Uid) -> nix::Result<()> {
            if self.fail_uid_drop && !uid.is_root() {
                return Err(nix::Error::EPERM);
            }
            self.state.lock().unwrap().0.uid = uid;
            Ok(())
        }

        fn set_effective_gid(&self, gid: Gid) -> nix::Result<()> {
            self.state.lock().unwrap().0.gid = gid;
            Ok(())
        }
    }
}
