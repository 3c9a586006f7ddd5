use crate::error::ExecutorError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Opaque identity of one execution request, unique per request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ExecutionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ExecutionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Alternate local-user identity to run a process as.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Credential {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            domain: None,
            password: None,
        }
    }

    /// `domain\user` when a domain is present, otherwise the bare user name.
    pub fn qualified_name(&self) -> String {
        match &self.domain {
            Some(domain) => format!("{}\\{}", domain, self.username),
            None => self.username.clone(),
        }
    }
}

// Keeps passwords out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("domain", &self.domain)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Process,
    Pod,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Process => write!(f, "process"),
            BackendKind::Pod => write!(f, "pod"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = ExecutorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" => Ok(BackendKind::Process),
            "pod" => Ok(BackendKind::Pod),
            other => Err(ExecutorError::BackendNotFound(other.to_string())),
        }
    }
}

/// One unit of work handed to the agent. Immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub id: ExecutionId,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub credential: Option<Credential>,
    #[serde(default)]
    pub backend: Option<BackendKind>,
}

impl ExecutionRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: ExecutionId::new(),
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            credential: None,
            backend: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<ExecutionId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Structural checks that do not touch the host or the cluster.
    pub fn validate(&self) -> Result<(), ExecutorError> {
        if self.id.0.trim().is_empty() {
            return Err(ExecutorError::InvalidRequest(
                "execution id must not be empty".into(),
            ));
        }
        if self.command.trim().is_empty() {
            return Err(ExecutorError::InvalidRequest(format!(
                "execution {} has an empty command",
                self.id
            )));
        }
        if let Some(key) = self
            .env
            .keys()
            .find(|k| k.is_empty() || k.contains('=') || k.contains('\0'))
        {
            return Err(ExecutorError::InvalidRequest(format!(
                "invalid environment variable name '{}'",
                key
            )));
        }
        if let Some(credential) = &self.credential {
            if credential.username.trim().is_empty() {
                return Err(ExecutorError::InvalidRequest(
                    "credential has an empty user name".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_empty_command() {
        let request = ExecutionRequest::new("  ");
        assert!(matches!(
            request.validate(),
            Err(ExecutorError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_env_name() {
        let request = ExecutionRequest::new("echo").with_env("A=B", "x");
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("Pod".parse::<BackendKind>().unwrap(), BackendKind::Pod);
        assert_eq!(
            "process".parse::<BackendKind>().unwrap(),
            BackendKind::Process
        );
        assert!("ssh".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_owned_string_becomes_execution_id() {
        let id = String::from("deploy-42");
        let request = ExecutionRequest::new("echo").with_id(id);
        assert_eq!(request.id.as_str(), "deploy-42");
    }

    #[test]
    fn test_credential_debug_hides_password() {
        let mut credential = Credential::new("deploy");
        credential.password = Some("hunter2".into());
        let printed = format!("{:?}", credential);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("deploy"));
    }
}
