use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    foundation::{
        core::Viewport,
        error::{DriverError, DriverResult},
    },
    job::RenderJob,
};

/// Placeholder substituted with the job's port in `serve_command` arguments.
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Driver configuration, usually loaded from a JSON file.
///
/// Relative paths are resolved against the directory containing the config file.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    /// Directory containing the content projects.
    pub root: PathBuf,
    /// Base port; project `i` listens on `port + i` unless it sets its own.
    pub port: u16,
    pub viewport: Viewport,
    pub readiness_marker: String,
    pub trigger_selector: String,
    pub max_parallel: usize,
    /// Dependency install step; empty disables it.
    pub install_command: Vec<String>,
    pub serve_command: Vec<String>,
    pub browser: BrowserConfig,
    pub timeouts: Timeouts,
    pub projects: Vec<ProjectConfig>,

    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    pub name: String,
    /// Project directory; defaults to `<root>/<name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Output file, relative to the project directory.
    #[serde(default = "default_output")]
    pub output: PathBuf,
    /// Final artifact; defaults to `<root>/<name>.mp4`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,
}

impl ProjectConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dir: None,
            port: None,
            output: default_output(),
            destination: None,
        }
    }
}

fn default_output() -> PathBuf {
    PathBuf::from("output").join("project.mp4")
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrowserConfig {
    /// Node executable used to run the puppeteer bridge.
    pub node: PathBuf,
    /// Directory `require("puppeteer")` resolves from; defaults to `root`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolve_dir: Option<PathBuf>,
    pub headless: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            node: PathBuf::from("node"),
            resolve_dir: None,
            headless: true,
        }
    }
}

/// All waits are bounded; values are milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    pub install_ms: u64,
    pub server_ready_ms: u64,
    pub server_stop_grace_ms: u64,
    pub browser_launch_ms: u64,
    pub browser_command_ms: u64,
    pub navigation_ms: u64,
    pub settle_ms: u64,
    pub render_start_ms: u64,
    pub stall_window_ms: u64,
    pub render_total_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            install_ms: 10 * 60 * 1000,
            server_ready_ms: 60 * 1000,
            server_stop_grace_ms: 500,
            browser_launch_ms: 30 * 1000,
            browser_command_ms: 30 * 1000,
            navigation_ms: 30 * 1000,
            settle_ms: 5000,
            render_start_ms: 20 * 1000,
            stall_window_ms: 45 * 1000,
            render_total_ms: 2 * 60 * 60 * 1000,
            poll_interval_ms: 500,
        }
    }
}

impl Timeouts {
    pub fn install(&self) -> Duration {
        Duration::from_millis(self.install_ms)
    }

    pub fn server_ready(&self) -> Duration {
        Duration::from_millis(self.server_ready_ms)
    }

    pub fn server_stop_grace(&self) -> Duration {
        Duration::from_millis(self.server_stop_grace_ms)
    }

    pub fn browser_launch(&self) -> Duration {
        Duration::from_millis(self.browser_launch_ms)
    }

    pub fn browser_command(&self) -> Duration {
        Duration::from_millis(self.browser_command_ms)
    }

    pub fn navigation(&self) -> Duration {
        Duration::from_millis(self.navigation_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn render_start(&self) -> Duration {
        Duration::from_millis(self.render_start_ms)
    }

    pub fn stall_window(&self) -> Duration {
        Duration::from_millis(self.stall_window_ms)
    }

    pub fn render_total(&self) -> Duration {
        Duration::from_millis(self.render_total_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> DriverResult<()> {
        let required = [
            ("install_ms", self.install_ms),
            ("server_ready_ms", self.server_ready_ms),
            ("browser_launch_ms", self.browser_launch_ms),
            ("browser_command_ms", self.browser_command_ms),
            ("navigation_ms", self.navigation_ms),
            ("render_start_ms", self.render_start_ms),
            ("stall_window_ms", self.stall_window_ms),
            ("render_total_ms", self.render_total_ms),
            ("poll_interval_ms", self.poll_interval_ms),
        ];
        for (name, value) in required {
            if value == 0 {
                return Err(DriverError::validation(format!(
                    "timeouts.{name} must be > 0"
                )));
            }
        }
        Ok(())
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            port: 9000,
            viewport: Viewport::FULL_HD,
            readiness_marker: "ready in".to_string(),
            trigger_selector: "#render".to_string(),
            max_parallel: 1,
            install_command: vec!["npm".to_string(), "install".to_string()],
            serve_command: ["npm", "start", "--", "--strictPort", "--port", PORT_PLACEHOLDER]
                .into_iter()
                .map(String::from)
                .collect(),
            browser: BrowserConfig::default(),
            timeouts: Timeouts::default(),
            projects: Vec::new(),
            base_dir: PathBuf::new(),
        }
    }
}

impl DriverConfig {
    /// Starter configuration written by `motionrun init-config`.
    pub fn example() -> Self {
        let mut cfg = Self::default();
        cfg.projects.push(ProjectConfig {
            destination: Some(PathBuf::from("pathfindingpt1.mp4")),
            ..ProjectConfig::named("pathfinding-pt-1")
        });
        cfg
    }

    pub fn load(path: &Path) -> DriverResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DriverError::config(format!("failed to read '{}': {e}", path.display()))
        })?;
        let mut cfg = Self::from_json(&text)
            .map_err(|e| DriverError::config(format!("'{}': {e}", path.display())))?;
        cfg.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json(text: &str) -> DriverResult<Self> {
        serde_json::from_str(text).map_err(|e| DriverError::config(format!("invalid JSON: {e}")))
    }

    pub fn to_json_pretty(&self) -> DriverResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| DriverError::config(format!("failed to serialize config: {e}")))
    }

    pub fn root_dir(&self) -> PathBuf {
        resolve(&self.base_dir, &self.root)
    }

    pub fn resolve_dir(&self) -> PathBuf {
        match &self.browser.resolve_dir {
            Some(dir) => resolve(&self.base_dir, dir),
            None => self.root_dir(),
        }
    }

    pub fn validate(&self) -> DriverResult<()> {
        self.viewport.validate()?;
        self.timeouts.validate()?;

        if self.projects.is_empty() {
            return Err(DriverError::validation("at least one project is required"));
        }
        if self.max_parallel == 0 {
            return Err(DriverError::validation("max_parallel must be >= 1"));
        }
        if self.readiness_marker.is_empty() {
            return Err(DriverError::validation("readiness_marker must be non-empty"));
        }
        if self.trigger_selector.trim().is_empty() {
            return Err(DriverError::validation("trigger_selector must be non-empty"));
        }
        if self.serve_command.is_empty() {
            return Err(DriverError::validation("serve_command must be non-empty"));
        }

        let mut names = BTreeSet::new();
        for p in &self.projects {
            if p.name.trim().is_empty() {
                return Err(DriverError::validation("project name must be non-empty"));
            }
            if !names.insert(p.name.as_str()) {
                return Err(DriverError::validation(format!(
                    "duplicate project name '{}'",
                    p.name
                )));
            }
            if p.output.as_os_str().is_empty() || p.output.file_name().is_none() {
                return Err(DriverError::validation(format!(
                    "project '{}' output must name a file",
                    p.name
                )));
            }
        }

        let mut ports = BTreeSet::new();
        for (index, p) in self.projects.iter().enumerate() {
            let port = self.port_for(index, p)?;
            if !ports.insert(port) {
                return Err(DriverError::validation(format!(
                    "project '{}' reuses port {port}",
                    p.name
                )));
            }
        }

        // Jobs may run side by side: each needs its own watched output dir and artifact.
        let jobs = self.jobs(&[])?;
        let mut output_dirs = BTreeSet::new();
        let mut destinations = BTreeSet::new();
        for job in &jobs {
            if !output_dirs.insert(job.output_dir()) {
                return Err(DriverError::validation(format!(
                    "project '{}' shares output directory '{}' with another project",
                    job.name,
                    job.output_dir().display()
                )));
            }
            if !destinations.insert(job.destination.as_path()) {
                return Err(DriverError::validation(format!(
                    "project '{}' shares destination '{}' with another project",
                    job.name,
                    job.destination.display()
                )));
            }
        }
        Ok(())
    }

    fn port_for(&self, index: usize, project: &ProjectConfig) -> DriverResult<u16> {
        let port = match project.port {
            Some(port) => Some(port),
            None => u16::try_from(index)
                .ok()
                .and_then(|i| self.port.checked_add(i)),
        };
        match port {
            Some(p) if p != 0 => Ok(p),
            _ => Err(DriverError::validation(format!(
                "project '{}' has no valid port",
                project.name
            ))),
        }
    }

    /// Resolve render jobs in config order. `selected` filters by project name; empty
    /// selects every project.
    pub fn jobs(&self, selected: &[String]) -> DriverResult<Vec<RenderJob>> {
        for name in selected {
            if !self.projects.iter().any(|p| &p.name == name) {
                return Err(DriverError::config(format!("unknown project '{name}'")));
            }
        }

        let root = self.root_dir();
        let mut jobs = Vec::new();
        for (index, p) in self.projects.iter().enumerate() {
            if !selected.is_empty() && !selected.contains(&p.name) {
                continue;
            }
            let project_dir = match &p.dir {
                Some(dir) => resolve(&self.base_dir, dir),
                None => root.join(&p.name),
            };
            let destination = match &p.destination {
                Some(dest) => resolve(&root, dest),
                None => root.join(format!("{}.mp4", p.name)),
            };
            jobs.push(RenderJob {
                name: p.name.clone(),
                output_path: resolve(&project_dir, &p.output),
                project_dir,
                port: self.port_for(index, p)?,
                destination,
            });
        }
        Ok(jobs)
    }

    /// `serve_command` with the port placeholder substituted.
    pub fn serve_command_for(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.serve_command
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port))
            .collect()
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_projects() -> DriverConfig {
        let mut cfg = DriverConfig {
            root: PathBuf::from("videos"),
            base_dir: PathBuf::from("/work"),
            ..DriverConfig::default()
        };
        cfg.projects.push(ProjectConfig::named("intro"));
        cfg.projects.push(ProjectConfig {
            port: Some(9100),
            destination: Some(PathBuf::from("final/outro.mp4")),
            ..ProjectConfig::named("outro")
        });
        cfg
    }

    #[test]
    fn defaults_match_reference_render_setup() {
        let cfg = DriverConfig::default();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.viewport, Viewport::FULL_HD);
        assert_eq!(cfg.readiness_marker, "ready in");
        assert_eq!(cfg.trigger_selector, "#render");
        assert_eq!(cfg.timeouts.settle(), Duration::from_secs(5));
        assert_eq!(cfg.timeouts.render_start(), Duration::from_secs(20));
        assert_eq!(cfg.timeouts.stall_window(), Duration::from_secs(45));
        assert_eq!(cfg.timeouts.render_total(), Duration::from_secs(7200));
        assert_eq!(cfg.timeouts.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let cfg = DriverConfig::from_json(
            r#"{ "projects": [{ "name": "intro" }], "timeouts": { "stall_window_ms": 1000 } }"#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.timeouts.stall_window_ms, 1000);
        assert_eq!(cfg.timeouts.render_start_ms, 20_000);
        assert_eq!(cfg.projects[0].output, PathBuf::from("output/project.mp4"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(DriverConfig::from_json(r#"{ "projcts": [] }"#).is_err());
    }

    #[test]
    fn validation_catches_bad_values() {
        assert!(DriverConfig::default().validate().is_err());

        let mut cfg = two_projects();
        cfg.timeouts.poll_interval_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = two_projects();
        cfg.projects.push(ProjectConfig::named("intro"));
        assert!(cfg.validate().is_err());

        let mut cfg = two_projects();
        cfg.projects[1].port = Some(9000);
        assert!(cfg.validate().is_err());

        let mut cfg = two_projects();
        cfg.max_parallel = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = two_projects();
        cfg.serve_command.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn projects_sharing_a_directory_are_rejected() {
        let mut cfg = two_projects();
        cfg.max_parallel = 2;
        for p in &mut cfg.projects {
            p.dir = Some(PathBuf::from("videos/shared"));
            p.destination = None;
        }
        let err = cfg.validate().expect_err("shared output directory");
        assert!(err.to_string().contains("output directory"), "{err}");

        let mut cfg = two_projects();
        cfg.projects[1].dir = Some(PathBuf::from("videos/intro"));
        cfg.projects[1].output = PathBuf::from("output/outro.mp4");
        assert!(cfg.validate().is_err(), "same dir, different file still shares the watch");
    }

    #[test]
    fn projects_sharing_a_destination_are_rejected() {
        let mut cfg = two_projects();
        for p in &mut cfg.projects {
            p.destination = Some(PathBuf::from("final.mp4"));
        }
        let err = cfg.validate().expect_err("shared destination");
        assert!(err.to_string().contains("destination"), "{err}");

        let mut cfg = two_projects();
        cfg.projects[1].destination = Some(PathBuf::from("/work/videos/intro.mp4"));
        assert!(cfg.validate().is_err(), "explicit path colliding with a default");
    }

    #[test]
    fn jobs_resolve_paths_and_ports() {
        let cfg = two_projects();
        cfg.validate().unwrap();
        let jobs = cfg.jobs(&[]).unwrap();
        assert_eq!(jobs.len(), 2);

        assert_eq!(jobs[0].project_dir, PathBuf::from("/work/videos/intro"));
        assert_eq!(jobs[0].port, 9000);
        assert_eq!(
            jobs[0].output_path,
            PathBuf::from("/work/videos/intro/output/project.mp4")
        );
        assert_eq!(jobs[0].destination, PathBuf::from("/work/videos/intro.mp4"));

        assert_eq!(jobs[1].port, 9100);
        assert_eq!(
            jobs[1].destination,
            PathBuf::from("/work/videos/final/outro.mp4")
        );
    }

    #[test]
    fn jobs_filter_by_name_and_reject_unknown() {
        let cfg = two_projects();
        let jobs = cfg.jobs(&["outro".to_string()]).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "outro");
        assert!(cfg.jobs(&["missing".to_string()]).is_err());
    }

    #[test]
    fn serve_command_substitutes_port() {
        let cfg = DriverConfig::default();
        assert_eq!(
            cfg.serve_command_for(9001),
            vec!["npm", "start", "--", "--strictPort", "--port", "9001"]
        );
    }

    #[test]
    fn example_config_survives_json() {
        let cfg = DriverConfig::example();
        let parsed = DriverConfig::from_json(&cfg.to_json_pretty().unwrap()).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.projects[0].name, "pathfinding-pt-1");
        assert_eq!(parsed.timeouts, Timeouts::default());
    }

    #[test]
    fn load_resolves_relative_to_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("render.json");
        std::fs::write(&path, r#"{ "root": "videos", "projects": [{ "name": "intro" }] }"#)
            .unwrap();
        let cfg = DriverConfig::load(&path).unwrap();
        assert_eq!(cfg.root_dir(), dir.path().join("videos"));
        assert_eq!(cfg.resolve_dir(), dir.path().join("videos"));
    }
}
