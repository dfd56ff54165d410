use std::{path::PathBuf, time::Duration};

pub type DriverResult<T> = Result<T, DriverError>;

/// Stage of a render job an error belongs to. Used for log output and reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobPhase {
    Setup,
    Prepare,
    Server,
    Browser,
    RenderStart,
    RenderStall,
    Finalize,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Setup => "setup",
            Self::Prepare => "prepare",
            Self::Server => "server",
            Self::Browser => "browser",
            Self::RenderStart => "render_start",
            Self::RenderStall => "render_stall",
            Self::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("prepare failed for '{project}': {reason}")]
    Prepare { project: String, reason: String },

    #[error("failed to clear previous output '{}': {source}", path.display())]
    StaleOutput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("dev server on port {port} did not report ready within {timeout:?}")]
    ServerStartTimeout { port: u16, timeout: Duration },

    #[error("dev server on port {port} exited before becoming ready ({status})")]
    ServerExited { port: u16, status: String },

    #[error("process error: {0}")]
    Process(String),

    #[error("navigation error: {0}")]
    Navigation(String),

    #[error("render did not start: '{}' missing after {timeout:?}", path.display())]
    RenderStartTimeout { path: PathBuf, timeout: Duration },

    #[error("render did not settle: '{}' still changing after {timeout:?}", dir.display())]
    RenderStallTimeout { dir: PathBuf, timeout: Duration },

    #[error("watch error: {0}")]
    Watch(String),

    #[error("failed to move '{}' to '{}': {source}", from.display(), to.display())]
    Finalize {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DriverError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn process(msg: impl Into<String>) -> Self {
        Self::Process(msg.into())
    }

    pub fn navigation(msg: impl Into<String>) -> Self {
        Self::Navigation(msg.into())
    }

    pub fn watch(msg: impl Into<String>) -> Self {
        Self::Watch(msg.into())
    }

    pub fn prepare(project: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Prepare {
            project: project.into(),
            reason: reason.into(),
        }
    }

    pub fn phase(&self) -> JobPhase {
        match self {
            Self::Validation(_) | Self::Config(_) | Self::Other(_) => JobPhase::Setup,
            Self::Prepare { .. } | Self::StaleOutput { .. } => JobPhase::Prepare,
            Self::ServerStartTimeout { .. } | Self::ServerExited { .. } | Self::Process(_) => {
                JobPhase::Server
            }
            Self::Navigation(_) => JobPhase::Browser,
            Self::RenderStartTimeout { .. } => JobPhase::RenderStart,
            Self::RenderStallTimeout { .. } | Self::Watch(_) => JobPhase::RenderStall,
            Self::Finalize { .. } => JobPhase::Finalize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        assert!(
            DriverError::validation("x")
                .to_string()
                .contains("validation error:")
        );
        assert!(DriverError::config("x").to_string().contains("config error:"));
        assert!(
            DriverError::navigation("x")
                .to_string()
                .contains("navigation error:")
        );
        assert!(
            DriverError::prepare("demo", "exit 1")
                .to_string()
                .contains("prepare failed for 'demo'")
        );
    }

    #[test]
    fn phases_follow_job_stages() {
        assert_eq!(DriverError::prepare("p", "r").phase(), JobPhase::Prepare);
        assert_eq!(
            DriverError::ServerStartTimeout {
                port: 9000,
                timeout: Duration::from_secs(1)
            }
            .phase(),
            JobPhase::Server
        );
        assert_eq!(
            DriverError::StaleOutput {
                path: PathBuf::from("output/project.mp4"),
                source: std::io::Error::other("read-only filesystem"),
            }
            .phase(),
            JobPhase::Prepare
        );
        assert_eq!(DriverError::navigation("x").phase(), JobPhase::Browser);
        assert_eq!(
            DriverError::RenderStartTimeout {
                path: PathBuf::from("out.mp4"),
                timeout: Duration::from_secs(20)
            }
            .phase(),
            JobPhase::RenderStart
        );
        assert_eq!(
            DriverError::RenderStallTimeout {
                dir: PathBuf::from("output"),
                timeout: Duration::from_secs(7200)
            }
            .phase(),
            JobPhase::RenderStall
        );
        assert_eq!(JobPhase::RenderStall.to_string(), "render_stall");
    }

    #[test]
    fn finalize_preserves_source() {
        let err = DriverError::Finalize {
            from: PathBuf::from("a.mp4"),
            to: PathBuf::from("b.mp4"),
            source: std::io::Error::other("locked"),
        };
        let msg = err.to_string();
        assert!(msg.contains("a.mp4") && msg.contains("b.mp4") && msg.contains("locked"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn other_preserves_source() {
        let base = std::io::Error::other("boom");
        let err = DriverError::Other(anyhow::Error::new(base));
        assert!(err.to_string().contains("boom"));
    }
}
