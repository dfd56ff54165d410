use std::{
    path::PathBuf,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use rayon::prelude::*;
use tracing::{error, info};

use crate::{
    browser::{BrowserLauncher, BrowserSession},
    completion::{await_file_exists, await_quiescence},
    config::DriverConfig,
    finalize::{clear_stale_output, finalize_artifact},
    foundation::error::{DriverError, DriverResult, JobPhase},
    job::RenderJob,
    process::{ServerProcess, prepare_project},
};

/// Outcome of one render job.
#[derive(Debug)]
pub struct JobReport {
    pub name: String,
    pub elapsed: Duration,
    /// Final artifact path on success.
    pub outcome: DriverResult<PathBuf>,
}

impl JobReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn failed_phase(&self) -> Option<JobPhase> {
        self.outcome.as_ref().err().map(DriverError::phase)
    }
}

#[derive(Debug, Default)]
pub struct DriverReport {
    pub jobs: Vec<JobReport>,
}

impl DriverReport {
    pub fn all_succeeded(&self) -> bool {
        self.jobs.iter().all(JobReport::is_success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &JobReport> {
        self.jobs.iter().filter(|j| !j.is_success())
    }

    /// 0 when every job succeeded, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.all_succeeded() { 0 } else { 1 }
    }
}

/// Runs render jobs end to end: install, serve, browse, detect completion, finalize.
pub struct Driver<'a> {
    config: DriverConfig,
    launcher: &'a dyn BrowserLauncher,
    skip_install: bool,
    finalize_gate: Mutex<()>,
}

impl<'a> Driver<'a> {
    pub fn new(config: DriverConfig, launcher: &'a dyn BrowserLauncher) -> DriverResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            launcher,
            skip_install: false,
            finalize_gate: Mutex::new(()),
        })
    }

    pub fn skip_install(mut self, skip: bool) -> Self {
        self.skip_install = skip;
        self
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Run the selected projects (all when `selected` is empty).
    ///
    /// Job failures are reported, not returned; `Err` means no job could be started.
    pub fn run(&self, selected: &[String]) -> DriverResult<DriverReport> {
        let jobs = self.config.jobs(selected)?;
        let parallel = self.config.max_parallel.min(jobs.len());

        let reports: Vec<JobReport> = if parallel <= 1 {
            jobs.iter().map(|job| self.run_reported(job)).collect()
        } else {
            let pool = build_thread_pool(parallel)?;
            pool.install(|| jobs.par_iter().map(|job| self.run_reported(job)).collect())
        };

        Ok(DriverReport { jobs: reports })
    }

    fn run_reported(&self, job: &RenderJob) -> JobReport {
        let started_at = Instant::now();
        let outcome = self.run_job(job);
        let elapsed = started_at.elapsed();
        match &outcome {
            Ok(dest) => info!(
                job = %job.name,
                destination = %dest.display(),
                elapsed_ms = elapsed.as_millis() as u64,
                "render complete"
            ),
            Err(e) => error!(
                job = %job.name,
                phase = %e.phase(),
                elapsed_ms = elapsed.as_millis() as u64,
                error = %e,
                "render job failed"
            ),
        }
        JobReport {
            name: job.name.clone(),
            elapsed,
            outcome,
        }
    }

    /// Run one job. Every process, page and watcher it acquired is released before this
    /// returns, on success and on error.
    #[tracing::instrument(skip(self, job), fields(job = %job.name, port = job.port))]
    pub fn run_job(&self, job: &RenderJob) -> DriverResult<PathBuf> {
        let t = &self.config.timeouts;

        if !self.skip_install {
            prepare_project(
                &job.name,
                &job.project_dir,
                &self.config.install_command,
                t.install(),
            )?;
        }
        clear_stale_output(&job.output_path)?;

        let mut server = ServerProcess::start(
            &job.project_dir,
            &self.config.serve_command_for(job.port),
            job.port,
            t.server_stop_grace(),
        )?;
        let rendered = self.render_with_server(job, &mut server);
        server.stop();
        rendered?;

        let _gate = self
            .finalize_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        finalize_artifact(&job.output_path, &job.destination)?;
        Ok(job.destination.clone())
    }

    fn render_with_server(&self, job: &RenderJob, server: &mut ServerProcess) -> DriverResult<()> {
        let t = &self.config.timeouts;
        server.await_ready(&self.config.readiness_marker, t.server_ready())?;

        let mut browser = BrowserSession::launch(self.launcher)?;
        let rendered = self.render_in_browser(job, &mut browser);
        browser.close();
        rendered
    }

    fn render_in_browser(&self, job: &RenderJob, browser: &mut BrowserSession) -> DriverResult<()> {
        let t = &self.config.timeouts;

        let page = browser.open_page(&job.base_url(), self.config.viewport, t.navigation())?;
        browser.trigger_render(page, t.settle(), &self.config.trigger_selector)?;

        if !await_file_exists(&job.output_path, t.render_start(), t.poll_interval()) {
            return Err(DriverError::RenderStartTimeout {
                path: job.output_path.clone(),
                timeout: t.render_start(),
            });
        }
        info!(output = %job.output_path.display(), "render started, waiting for output to settle");

        if !await_quiescence(
            job.output_dir(),
            t.stall_window(),
            t.render_total(),
            t.poll_interval(),
        )? {
            return Err(DriverError::RenderStallTimeout {
                dir: job.output_dir().to_path_buf(),
                timeout: t.render_total(),
            });
        }
        Ok(())
    }
}

fn build_thread_pool(threads: usize) -> DriverResult<rayon::ThreadPool> {
    if threads == 0 {
        return Err(DriverError::validation("max_parallel must be >= 1"));
    }
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("motionrun-job-{i}"))
        .build()
        .map_err(|e| DriverError::process(format!("failed to build job thread pool: {e}")))
}
