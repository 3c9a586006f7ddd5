//! Who a launched process runs as.
//!
//! Alternate-identity launch needs platform privilege APIs, so it sits
//! behind [`Impersonation`]. Platforms without support get
//! [`CurrentIdentityOnly`], which rejects credentials at launch.

use executor_core::{Credential, ExecutorError};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub home: Option<PathBuf>,
    pub shell: Option<String>,
}

impl Identity {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: None,
            gid: None,
            home: None,
            shell: None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.uid {
            Some(uid) => write!(f, "{} (uid {})", self.name, uid),
            None => write!(f, "{}", self.name),
        }
    }
}

pub trait Impersonation: Send + Sync {
    /// The identity the agent itself runs as.
    fn current(&self) -> Identity;

    /// Configure `command` to run as `credential` and return that identity.
    fn impersonate(
        &self,
        credential: &Credential,
        command: &mut Command,
    ) -> Result<Identity, ExecutorError>;
}

/// Runs everything as the agent's own identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct CurrentIdentityOnly;

impl Impersonation for CurrentIdentityOnly {
    fn current(&self) -> Identity {
        current_identity()
    }

    fn impersonate(
        &self,
        credential: &Credential,
        _command: &mut Command,
    ) -> Result<Identity, ExecutorError> {
        Err(ExecutorError::Launch(format!(
            "running as {} is not supported on this platform",
            credential.qualified_name()
        )))
    }
}

/// The best impersonation support available on this platform.
pub fn platform_impersonation() -> Arc<dyn Impersonation> {
    #[cfg(unix)]
    {
        Arc::new(unix::UnixImpersonation)
    }
    #[cfg(not(unix))]
    {
        Arc::new(CurrentIdentityOnly)
    }
}

pub fn current_identity() -> Identity {
    #[cfg(unix)]
    {
        unix::current_identity()
    }
    #[cfg(not(unix))]
    {
        Identity::named(
            std::env::var("USERNAME")
                .or_else(|_| std::env::var("USER"))
                .unwrap_or_else(|_| "unknown".into()),
        )
    }
}

/// Rewrite the per-user variables inherited from the agent so they point at
/// `identity`'s own profile and scratch space.
pub fn rewrite_special_variables(env: &mut HashMap<String, String>, identity: &Identity) {
    env.insert("USER".into(), identity.name.clone());
    env.insert("LOGNAME".into(), identity.name.clone());
    // Session-bound to the agent's login.
    env.remove("XDG_RUNTIME_DIR");
    env.remove("MAIL");

    if let Some(shell) = &identity.shell {
        env.insert("SHELL".into(), shell.clone());
    }

    // The agent's own TMPDIR may be private to it.
    let scratch = scratch_dir(identity);
    for key in ["TMPDIR", "TMP", "TEMP"] {
        env.insert(key.into(), scratch.clone());
    }

    let Some(home) = &identity.home else {
        env.remove("HOME");
        return;
    };
    env.insert("HOME".into(), home.to_string_lossy().into_owned());
    for (key, sub) in [
        ("XDG_CONFIG_HOME", ".config"),
        ("XDG_CACHE_HOME", ".cache"),
        ("XDG_DATA_HOME", ".local/share"),
        ("XDG_STATE_HOME", ".local/state"),
    ] {
        if env.contains_key(key) {
            env.insert(key.into(), home.join(sub).to_string_lossy().into_owned());
        }
    }
}

/// Shared scratch space every local user can write to.
#[cfg(unix)]
fn scratch_dir(_identity: &Identity) -> String {
    "/tmp".to_string()
}

#[cfg(not(unix))]
fn scratch_dir(identity: &Identity) -> String {
    match &identity.home {
        Some(home) => home.join("AppData").join("Local").join("Temp").to_string_lossy().into_owned(),
        None => std::env::temp_dir().to_string_lossy().into_owned(),
    }
}

#[cfg(unix)]
pub mod unix {
    use super::{Identity, Impersonation};
    use executor_core::{Credential, ExecutorError};
    use std::ffi::{CStr, CString};
    use std::io;
    use std::path::PathBuf;
    use tokio::process::Command;

    /// Switches uid, gid and supplementary groups in the child before exec.
    /// Requires the agent to run as root unless the target is the agent's
    /// own user.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct UnixImpersonation;

    impl Impersonation for UnixImpersonation {
        fn current(&self) -> Identity {
            current_identity()
        }

        fn impersonate(
            &self,
            credential: &Credential,
            command: &mut Command,
        ) -> Result<Identity, ExecutorError> {
            let user = lookup_user_by_name(&credential.username)
                .map_err(|e| {
                    ExecutorError::Launch(format!(
                        "failed to look up user {}: {}",
                        credential.username, e
                    ))
                })?
                .ok_or_else(|| {
                    ExecutorError::Launch(format!("no such user: {}", credential.username))
                })?;
            let uid = user.uid.unwrap_or_default();
            let gid = user.gid.unwrap_or_default();

            // SAFETY: geteuid has no preconditions and cannot fail.
            let euid = unsafe { libc::geteuid() };
            if uid == euid {
                return Ok(user);
            }
            if euid != 0 {
                return Err(ExecutorError::Launch(format!(
                    "running as {} requires the agent to run as root",
                    user.name
                )));
            }

            let name = CString::new(user.name.clone())
                .map_err(|e| ExecutorError::Launch(format!("invalid user name: {}", e)))?;
            // SAFETY: the closure runs between fork and exec and only calls
            // async-signal-safe libc functions on data captured before fork.
            unsafe {
                command.pre_exec(move || {
                    if libc::initgroups(name.as_ptr(), gid as _) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::setgid(gid) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::setuid(uid) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
            Ok(user)
        }
    }

    pub fn current_identity() -> Identity {
        // SAFETY: geteuid has no preconditions and cannot fail.
        let euid = unsafe { libc::geteuid() };
        match lookup_user_by_uid(euid) {
            Ok(Some(identity)) => identity,
            _ => Identity {
                uid: Some(euid),
                ..Identity::named(std::env::var("USER").unwrap_or_else(|_| euid.to_string()))
            },
        }
    }

    pub fn lookup_user_by_name(name: &str) -> io::Result<Option<Identity>> {
        let cname = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        lookup(|pwd, buf, result| {
            // SAFETY: all pointers reference live, correctly sized buffers.
            unsafe {
                libc::getpwnam_r(cname.as_ptr(), pwd, buf.as_mut_ptr(), buf.len(), result)
            }
        })
    }

    pub fn lookup_user_by_uid(uid: libc::uid_t) -> io::Result<Option<Identity>> {
        lookup(|pwd, buf, result| {
            // SAFETY: all pointers reference live, correctly sized buffers.
            unsafe { libc::getpwuid_r(uid, pwd, buf.as_mut_ptr(), buf.len(), result) }
        })
    }

    fn lookup<F>(mut call: F) -> io::Result<Option<Identity>>
    where
        F: FnMut(&mut libc::passwd, &mut Vec<libc::c_char>, &mut *mut libc::passwd) -> libc::c_int,
    {
        let mut buf: Vec<libc::c_char> = vec![0; 4096];
        // SAFETY: passwd is a plain C struct; all-zero is a valid value.
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        loop {
            let rc = call(&mut pwd, &mut buf, &mut result);
            if rc == libc::ERANGE && buf.len() < (1 << 20) {
                let grown = buf.len() * 2;
                buf.resize(grown, 0);
                continue;
            }
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            break;
        }
        if result.is_null() {
            return Ok(None);
        }

        // SAFETY: on success the string fields point into `buf`, which is alive.
        let (name, home, shell) = unsafe {
            (
                cstr_field(pwd.pw_name),
                cstr_field(pwd.pw_dir),
                cstr_field(pwd.pw_shell),
            )
        };
        Ok(Some(Identity {
            name: name.unwrap_or_else(|| pwd.pw_uid.to_string()),
            uid: Some(pwd.pw_uid),
            gid: Some(pwd.pw_gid),
            home: home.filter(|h| !h.is_empty()).map(PathBuf::from),
            shell: shell.filter(|s| !s.is_empty()),
        }))
    }

    unsafe fn cstr_field(ptr: *const libc::c_char) -> Option<String> {
        if ptr.is_null() {
            None
        } else {
            Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
        }
    }
}
