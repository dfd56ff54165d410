use std::{
    io::{BufRead as _, BufReader, Write as _},
    path::PathBuf,
    process::{Child, ChildStdin, Command, Stdio},
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{
    browser::{BrowserDriver, BrowserLauncher},
    config::DriverConfig,
    foundation::{
        core::{PageId, Viewport},
        error::{DriverError, DriverResult},
    },
    process::{isolate_group, terminate},
};

const BRIDGE_SCRIPT: &str = include_str!("bridge.js");
const BRIDGE_STOP_GRACE: Duration = Duration::from_secs(2);

pub fn is_node_on_path(node: &std::path::Path) -> bool {
    Command::new(node)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[derive(Debug, serde::Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum BridgeOp<'a> {
    Open {
        url: &'a str,
        width: u32,
        height: u32,
        timeout_ms: u64,
    },
    Click {
        page: u64,
        selector: &'a str,
    },
    ClosePage {
        page: u64,
    },
    Close,
}

impl BridgeOp<'_> {
    fn name(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Click { .. } => "click",
            Self::ClosePage { .. } => "close_page",
            Self::Close => "close",
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct BridgeRequest<'a> {
    id: u64,
    #[serde(flatten)]
    op: BridgeOp<'a>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct BridgeReply {
    id: Option<u64>,
    event: Option<String>,
    ok: bool,
    error: Option<String>,
    page: Option<u64>,
}

/// Launches [`NodeBridge`] instances: `node -e <bridge script>` with puppeteer resolved from
/// `resolve_dir`.
#[derive(Clone, Debug)]
pub struct NodeBridgeLauncher {
    pub node: PathBuf,
    pub resolve_dir: PathBuf,
    pub headless: bool,
    pub launch_timeout: Duration,
    pub command_timeout: Duration,
}

impl NodeBridgeLauncher {
    pub fn from_config(cfg: &DriverConfig) -> Self {
        Self {
            node: cfg.browser.node.clone(),
            resolve_dir: cfg.resolve_dir(),
            headless: cfg.browser.headless,
            launch_timeout: cfg.timeouts.browser_launch(),
            command_timeout: cfg.timeouts.browser_command(),
        }
    }
}

impl BrowserLauncher for NodeBridgeLauncher {
    fn launch(&self) -> DriverResult<Box<dyn BrowserDriver>> {
        Ok(Box::new(NodeBridge::launch(self)?))
    }
}

/// A puppeteer browser driven over newline-delimited JSON on the bridge's stdio.
pub struct NodeBridge {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    replies: mpsc::Receiver<String>,
    next_id: u64,
    command_timeout: Duration,
}

impl NodeBridge {
    pub fn launch(opts: &NodeBridgeLauncher) -> DriverResult<Self> {
        let mut cmd = Command::new(&opts.node);
        cmd.arg("-e")
            .arg(BRIDGE_SCRIPT)
            .current_dir(&opts.resolve_dir)
            .env("MOTIONRUN_HEADLESS", if opts.headless { "1" } else { "0" })
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        isolate_group(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| {
            DriverError::navigation(format!(
                "failed to spawn '{}' for the browser bridge: {e}",
                opts.node.display()
            ))
        })?;

        let stdin = child.stdin.take();
        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            thread::spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    warn!(line = %line, "browser bridge stderr");
                }
            });
        }

        let mut bridge = Self {
            child: Some(child),
            stdin,
            replies: rx,
            next_id: 0,
            command_timeout: opts.command_timeout,
        };
        if let Err(e) = bridge.await_ready(opts.launch_timeout) {
            bridge.shutdown();
            return Err(e);
        }
        Ok(bridge)
    }

    fn await_ready(&mut self, timeout: Duration) -> DriverResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let line = self.next_line(deadline, "launch")?;
            let Some(reply) = parse_reply(&line) else {
                continue;
            };
            match reply.event.as_deref() {
                Some("ready") => {
                    debug!("browser bridge ready");
                    return Ok(());
                }
                Some("failed") => {
                    return Err(DriverError::navigation(format!(
                        "browser launch failed: {}",
                        reply.error.unwrap_or_default()
                    )));
                }
                _ => {}
            }
        }
    }

    fn next_line(&self, deadline: Instant, op: &str) -> DriverResult<String> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.replies.recv_timeout(remaining) {
            Ok(line) => Ok(line),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(DriverError::navigation(format!(
                "browser bridge did not answer '{op}' in time"
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(DriverError::navigation(format!(
                "browser bridge exited during '{op}'"
            ))),
        }
    }

    fn call(&mut self, op: BridgeOp<'_>, timeout: Duration) -> DriverResult<BridgeReply> {
        self.next_id += 1;
        let id = self.next_id;
        let name = op.name();
        let request = serde_json::to_string(&BridgeRequest { id, op })
            .map_err(|e| DriverError::navigation(format!("failed to encode '{name}': {e}")))?;

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| DriverError::navigation("browser bridge is closed"))?;
        writeln!(stdin, "{request}")
            .and_then(|()| stdin.flush())
            .map_err(|e| DriverError::navigation(format!("failed to send '{name}': {e}")))?;

        let deadline = Instant::now() + timeout;
        loop {
            let line = self.next_line(deadline, name)?;
            let Some(reply) = parse_reply(&line) else {
                continue;
            };
            if reply.id != Some(id) {
                continue;
            }
            if !reply.ok {
                return Err(DriverError::navigation(format!(
                    "'{name}' failed: {}",
                    reply.error.as_deref().unwrap_or("unknown error")
                )));
            }
            return Ok(reply);
        }
    }

    fn shutdown(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            terminate(&mut child, BRIDGE_STOP_GRACE);
        }
    }
}

fn parse_reply(line: &str) -> Option<BridgeReply> {
    match serde_json::from_str(line) {
        Ok(reply) => Some(reply),
        Err(_) => {
            debug!(line = %line, "browser bridge output");
            None
        }
    }
}

impl BrowserDriver for NodeBridge {
    fn open_page(
        &mut self,
        url: &str,
        viewport: Viewport,
        timeout: Duration,
    ) -> DriverResult<PageId> {
        let reply = self.call(
            BridgeOp::Open {
                url,
                width: viewport.width,
                height: viewport.height,
                timeout_ms: timeout.as_millis() as u64,
            },
            timeout + self.command_timeout,
        )?;
        let page = reply
            .page
            .ok_or_else(|| DriverError::navigation("bridge opened a page without an id"))?;
        Ok(PageId(page))
    }

    fn click(&mut self, page: PageId, selector: &str) -> DriverResult<()> {
        self.call(BridgeOp::Click { page: page.0, selector }, self.command_timeout)?;
        Ok(())
    }

    fn close_page(&mut self, page: PageId) -> DriverResult<()> {
        if self.stdin.is_none() {
            return Ok(());
        }
        self.call(BridgeOp::ClosePage { page: page.0 }, self.command_timeout)?;
        Ok(())
    }

    fn close(&mut self) -> DriverResult<()> {
        if self.child.is_none() {
            return Ok(());
        }
        let result = self.call(BridgeOp::Close, self.command_timeout).map(|_| ());
        self.shutdown();
        result
    }
}

impl Drop for NodeBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_flat_tagged_json() {
        let open = serde_json::to_value(BridgeRequest {
            id: 1,
            op: BridgeOp::Open {
                url: "http://localhost:9000",
                width: 1920,
                height: 1080,
                timeout_ms: 30_000,
            },
        })
        .unwrap();
        assert_eq!(
            open,
            serde_json::json!({
                "id": 1,
                "op": "open",
                "url": "http://localhost:9000",
                "width": 1920,
                "height": 1080,
                "timeout_ms": 30000
            })
        );

        let close = serde_json::to_value(BridgeRequest {
            id: 4,
            op: BridgeOp::ClosePage { page: 2 },
        })
        .unwrap();
        assert_eq!(
            close,
            serde_json::json!({ "id": 4, "op": "close_page", "page": 2 })
        );
    }

    #[test]
    fn replies_tolerate_missing_fields() {
        let ready = parse_reply(r#"{"event":"ready"}"#).unwrap();
        assert_eq!(ready.event.as_deref(), Some("ready"));
        assert!(!ready.ok);

        let opened = parse_reply(r#"{"id":1,"ok":true,"page":3}"#).unwrap();
        assert_eq!((opened.id, opened.ok, opened.page), (Some(1), true, Some(3)));

        let failed =
            parse_reply(r#"{"id":2,"ok":false,"error":"no element matches selector #render"}"#)
                .unwrap();
        assert!(failed.error.unwrap().contains("#render"));

        assert!(parse_reply("DevTools listening on ws://127.0.0.1").is_none());
    }

    #[test]
    fn bridge_script_speaks_the_same_ops() {
        for op in ["\"open\"", "\"click\"", "\"close_page\"", "\"close\"", "\"ready\""] {
            assert!(BRIDGE_SCRIPT.contains(op), "bridge script lacks {op}");
        }
    }

    #[test]
    fn missing_node_binary_fails_launch() {
        let launcher = NodeBridgeLauncher {
            node: PathBuf::from("definitely-not-node-xyz"),
            resolve_dir: std::env::temp_dir(),
            headless: true,
            launch_timeout: Duration::from_secs(1),
            command_timeout: Duration::from_secs(1),
        };
        assert!(!is_node_on_path(&launcher.node));
        let err = launcher.launch().err().expect("launch must fail");
        assert!(matches!(err, DriverError::Navigation(_)), "{err}");
    }
}
