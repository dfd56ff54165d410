//! Headless browser automation.
//!
//! The driver talks to browsers through [`BrowserDriver`], created per job by a
//! [`BrowserLauncher`]. [`BrowserSession`] owns one driver plus its open pages and guarantees
//! they are closed on every exit path.

pub mod bridge;

use std::{thread, time::Duration};

use tracing::{info, warn};

use crate::foundation::{
    core::{PageId, Viewport},
    error::DriverResult,
};

pub use bridge::{NodeBridge, NodeBridgeLauncher, is_node_on_path};

pub trait BrowserDriver: Send {
    /// Open a page, navigate to `url`, wait for `load`, then size the viewport.
    fn open_page(&mut self, url: &str, viewport: Viewport, timeout: Duration)
    -> DriverResult<PageId>;

    /// Click the first element matching `selector`. A missing element is an error.
    fn click(&mut self, page: PageId, selector: &str) -> DriverResult<()>;

    fn close_page(&mut self, page: PageId) -> DriverResult<()>;

    fn close(&mut self) -> DriverResult<()>;
}

pub trait BrowserLauncher: Sync {
    fn launch(&self) -> DriverResult<Box<dyn BrowserDriver>>;
}

/// A launched browser and the pages opened through it.
pub struct BrowserSession {
    driver: Box<dyn BrowserDriver>,
    pages: Vec<PageId>,
    closed: bool,
}

impl BrowserSession {
    pub fn launch(launcher: &dyn BrowserLauncher) -> DriverResult<Self> {
        let driver = launcher.launch()?;
        Ok(Self {
            driver,
            pages: Vec::new(),
            closed: false,
        })
    }

    pub fn open_page(
        &mut self,
        url: &str,
        viewport: Viewport,
        timeout: Duration,
    ) -> DriverResult<PageId> {
        let page = self.driver.open_page(url, viewport, timeout)?;
        self.pages.push(page);
        info!(url, %viewport, page = page.0, "page loaded");
        Ok(page)
    }

    /// Give the page's scene graph `settle` to initialize, then click the render trigger.
    pub fn trigger_render(
        &mut self,
        page: PageId,
        settle: Duration,
        selector: &str,
    ) -> DriverResult<()> {
        if !settle.is_zero() {
            thread::sleep(settle);
        }
        self.driver.click(page, selector)?;
        info!(page = page.0, selector, "render triggered");
        Ok(())
    }

    pub fn close_page(&mut self, page: PageId) {
        let Some(pos) = self.pages.iter().position(|p| *p == page) else {
            return;
        };
        self.pages.swap_remove(pos);
        if let Err(e) = self.driver.close_page(page) {
            warn!(page = page.0, error = %e, "failed to close page");
        }
    }

    /// Close every open page and the browser. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        for page in std::mem::take(&mut self.pages) {
            if let Err(e) = self.driver.close_page(page) {
                warn!(page = page.0, error = %e, "failed to close page");
            }
        }
        if let Err(e) = self.driver.close() {
            warn!(error = %e, "failed to close browser");
        }
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::foundation::error::DriverError;

    #[derive(Default)]
    struct Calls(Mutex<Vec<String>>);

    impl Calls {
        fn push(&self, call: impl Into<String>) {
            self.0.lock().unwrap().push(call.into());
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    struct Recording {
        calls: Arc<Calls>,
        next: u64,
    }

    impl BrowserDriver for Recording {
        fn open_page(
            &mut self,
            url: &str,
            viewport: Viewport,
            _timeout: Duration,
        ) -> DriverResult<PageId> {
            self.next += 1;
            self.calls.push(format!("open {url} {viewport}"));
            Ok(PageId(self.next))
        }

        fn click(&mut self, page: PageId, selector: &str) -> DriverResult<()> {
            if selector != "#render" {
                return Err(DriverError::navigation(format!("no element matches {selector}")));
            }
            self.calls.push(format!("click {} {selector}", page.0));
            Ok(())
        }

        fn close_page(&mut self, page: PageId) -> DriverResult<()> {
            self.calls.push(format!("close_page {}", page.0));
            Ok(())
        }

        fn close(&mut self) -> DriverResult<()> {
            self.calls.push("close");
            Ok(())
        }
    }

    struct Launcher(Arc<Calls>);

    impl BrowserLauncher for Launcher {
        fn launch(&self) -> DriverResult<Box<dyn BrowserDriver>> {
            self.0.push("launch");
            Ok(Box::new(Recording {
                calls: self.0.clone(),
                next: 0,
            }))
        }
    }

    #[test]
    fn session_drives_page_then_tears_down_once() {
        let calls = Arc::new(Calls::default());
        let mut session = BrowserSession::launch(&Launcher(calls.clone())).unwrap();
        let page = session
            .open_page("http://localhost:9000", Viewport::FULL_HD, Duration::from_secs(1))
            .unwrap();
        session
            .trigger_render(page, Duration::ZERO, "#render")
            .unwrap();
        session.close();
        session.close();
        assert!(session.is_closed());
        drop(session);

        assert_eq!(
            calls.take(),
            vec![
                "launch",
                "open http://localhost:9000 1920x1080",
                "click 1 #render",
                "close_page 1",
                "close",
            ]
        );
    }

    #[test]
    fn drop_closes_open_pages() {
        let calls = Arc::new(Calls::default());
        {
            let mut session = BrowserSession::launch(&Launcher(calls.clone())).unwrap();
            session
                .open_page("http://localhost:9001", Viewport::FULL_HD, Duration::from_secs(1))
                .unwrap();
        }
        let recorded = calls.take();
        assert_eq!(&recorded[recorded.len() - 2..], ["close_page 1", "close"]);
    }

    #[test]
    fn close_page_is_idempotent() {
        let calls = Arc::new(Calls::default());
        let mut session = BrowserSession::launch(&Launcher(calls.clone())).unwrap();
        let page = session
            .open_page("http://localhost:9000", Viewport::FULL_HD, Duration::from_secs(1))
            .unwrap();
        session.close_page(page);
        session.close_page(page);
        session.close();
        let recorded = calls.take();
        assert_eq!(recorded.iter().filter(|c| c.starts_with("close_page")).count(), 1);
    }

    #[test]
    fn missing_trigger_is_a_navigation_error() {
        let calls = Arc::new(Calls::default());
        let mut session = BrowserSession::launch(&Launcher(calls)).unwrap();
        let page = session
            .open_page("http://localhost:9000", Viewport::FULL_HD, Duration::from_secs(1))
            .unwrap();
        let err = session
            .trigger_render(page, Duration::ZERO, "#missing")
            .expect_err("missing control");
        assert!(matches!(err, DriverError::Navigation(_)));
    }
}
