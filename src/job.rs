use std::path::{Path, PathBuf};

/// One end-to-end attempt to produce a video from one content project.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct RenderJob {
    pub name: String,
    pub project_dir: PathBuf,
    pub port: u16,
    /// Where the in-page exporter writes the video while rendering.
    pub output_path: PathBuf,
    /// Stable location the finished video is moved to.
    pub destination: PathBuf,
}

impl RenderJob {
    pub fn base_url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    /// Directory watched for quiescence: the parent of the output file.
    pub fn output_dir(&self) -> &Path {
        self.output_path
            .parent()
            .unwrap_or_else(|| self.project_dir.as_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> RenderJob {
        RenderJob {
            name: "pathfinding-pt-1".to_string(),
            project_dir: PathBuf::from("videos/pathfinding-pt-1"),
            port: 9000,
            output_path: PathBuf::from("videos/pathfinding-pt-1/output/project.mp4"),
            destination: PathBuf::from("videos/pathfinding-pt-1.mp4"),
        }
    }

    #[test]
    fn base_url_targets_localhost_port() {
        assert_eq!(job().base_url(), "http://localhost:9000");
    }

    #[test]
    fn output_dir_is_parent_of_output_file() {
        assert_eq!(
            job().output_dir(),
            Path::new("videos/pathfinding-pt-1/output")
        );
    }

    #[test]
    fn serializes_resolved_paths() {
        let value = serde_json::to_value(job()).unwrap();
        assert_eq!(value["port"], 9000);
        assert_eq!(
            value["output_path"],
            "videos/pathfinding-pt-1/output/project.mp4"
        );
    }
}
