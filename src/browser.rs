use crate::driver::{Driver, DriverError, Locator, Page, StrategyCandidate, WaitPolicy};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::element::Element;
use chromiumoxide::page::Page as CdpPage;
use futures::StreamExt;
use serde_json::Value;
use std::env;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

const PROBE_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Clone, Debug)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    /// DevTools websocket of an already running Chrome; wins over discovery and launch.
    pub ws_url: Option<String>,
    /// Look for a Chrome with remote debugging on `debug_ports` before launching one.
    pub discover: bool,
    pub debug_ports: Vec<u16>,
    pub chrome_path: Option<PathBuf>,
    pub viewport: (u32, u32),
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            ws_url: env::var("CHROME_WS_URL").ok().filter(|s| !s.trim().is_empty()),
            discover: false,
            debug_ports: vec![9222, 9223, 9224, 9225, 9226],
            chrome_path: env::var("CHROME_PATH").ok().map(PathBuf::from),
            viewport: (1280, 800),
        }
    }
}

enum Session {
    Owned(OxideBrowser),
    Shared(Arc<OxideBrowser>),
}

/// One CDP page plus whatever browser process backs it.
pub struct Browser {
    page: CdpPage,
    session: Mutex<Option<Session>>,
    viewport: (u32, u32),
    headless: bool,
    profile_dir: Option<PathBuf>,
}

impl Browser {
    pub async fn launch(cfg: &BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &cfg.chrome_path {
            builder = builder.chrome_executable(path);
        }
        // Unique profile per launch avoids ProcessSingleton lock conflicts
        // when several runs start Chromium at once.
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("lookout-profile-{}-{}", std::process::id(), nanoid::nanoid!(8)));
        let _ = std::fs::create_dir_all(&profile_dir);
        builder = builder
            .user_data_dir(profile_dir.clone())
            .no_sandbox()
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-popup-blocking");
        let bcfg = builder.build().map_err(|e| anyhow::anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });
        let page = browser.new_page("about:blank").await?;
        let this = Self {
            page,
            session: Mutex::new(Some(Session::Owned(browser))),
            viewport: cfg.viewport,
            headless: cfg.headless,
            profile_dir: Some(profile_dir),
        };
        this.prepare(cfg).await?;
        info!(headless = cfg.headless, "launched chromium");
        Ok(this)
    }

    /// Opens a fresh page in a browser someone else started.
    pub async fn attach(shared: Arc<OxideBrowser>, cfg: &BrowserConfig) -> Result<Self> {
        let page = shared.new_page("about:blank").await?;
        let this = Self {
            page,
            session: Mutex::new(Some(Session::Shared(shared))),
            viewport: cfg.viewport,
            headless: cfg.headless,
            profile_dir: None,
        };
        this.prepare(cfg).await?;
        Ok(this)
    }

    /// Whether the next run can keep working on this page. A launched
    /// browser in the wrong mode is not reused.
    pub async fn is_usable(&self, headless: bool) -> bool {
        let session = self.session.lock().await;
        match session.as_ref() {
            None => false,
            Some(Session::Owned(_)) if self.headless != headless => false,
            Some(_) => self.page.url().await.is_ok(),
        }
    }

    async fn prepare(&self, cfg: &BrowserConfig) -> Result<()> {
        if let Some(ua) = &cfg.user_agent {
            self.page.set_user_agent(ua.clone()).await?;
        }
        // A zero-sized viewport makes screenshots fail outright.
        self.force_viewport().await
    }

    async fn force_viewport(&self) -> Result<()> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(self.viewport.0 as i64)
            .height(self.viewport.1 as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow::anyhow!(e))?;
        self.page.execute(params).await?;
        Ok(())
    }

    pub async fn goto(&self, url: &str, wait: WaitPolicy) -> Result<()> {
        self.page.goto(url).await?;
        match wait {
            WaitPolicy::Commit => {}
            WaitPolicy::Load => {
                self.page.wait_for_navigation().await?;
            }
            WaitPolicy::NetworkIdle => {
                self.page.wait_for_navigation().await?;
                self.wait_for_stable().await;
            }
        }
        Ok(())
    }

    pub async fn find(&self, locator: &Locator) -> Result<Element> {
        let el = match locator {
            Locator::Css { selector } => self.page.find_element(selector.as_str()).await?,
            Locator::XPath { expr } => self.page.find_xpath(expr.as_str()).await?,
            Locator::Text { pattern } => self.page.find_xpath(text_xpath(pattern)).await?,
        };
        Ok(el)
    }

    /// Polls for the locator until it appears or `timeout` runs out.
    pub async fn wait_for(&self, locator: &Locator, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.find(locator).await.is_ok() {
                return true;
            }
            if Instant::now() + PROBE_INTERVAL > deadline {
                return false;
            }
            sleep(PROBE_INTERVAL).await;
        }
    }

    pub async fn click(&self, locator: &Locator) -> Result<()> {
        let el = self.find(locator).await?;
        el.scroll_into_view().await?;
        el.click().await?;
        Ok(())
    }

    pub async fn type_into(&self, locator: &Locator, text: &str) -> Result<()> {
        let el = self.find(locator).await?;
        el.focus().await?;
        el.type_str(text).await?;
        Ok(())
    }

    pub async fn press_key(&self, locator: &Locator, key: &str) -> Result<()> {
        let el = self.find(locator).await?;
        el.focus().await?;
        el.press_key(key).await?;
        Ok(())
    }

    pub async fn screenshot_png(&self) -> Result<Vec<u8>> {
        use chromiumoxide::page::ScreenshotParams;
        let take = || async {
            self.page
                .screenshot(ScreenshotParams::builder().full_page(true).build())
                .await
        };
        match take().await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("0 width") || msg.contains("0 height") {
                    warn!("zero-sized viewport, forcing metrics and retrying");
                    let _ = self.force_viewport().await;
                    sleep(Duration::from_millis(50)).await;
                    return take().await.context("screenshot retry failed");
                }
                Err(anyhow::anyhow!(e))
            }
        }
    }

    pub async fn wait_for_stable(&self) {
        sleep(Duration::from_millis(400)).await;
    }

    /// Closes the page, and the browser too if this handle launched it.
    pub async fn close(&self) -> Result<()> {
        let session = self.session.lock().await.take();
        let Some(session) = session else {
            return Ok(());
        };
        if let Err(e) = self.page.clone().close().await {
            debug!(error = %e, "page close failed");
        }
        if let Session::Owned(mut browser) = session {
            browser.close().await?;
            let _ = browser.wait().await;
            if let Some(dir) = &self.profile_dir {
                discard_profile(dir).await;
            }
        }
        Ok(())
    }
}

async fn discard_profile(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(dir = %dir.display(), "profile removed"),
        Err(e) => warn!(dir = %dir.display(), error = %e, "profile not removed"),
    }
}

fn text_xpath(pattern: &str) -> String {
    let quoted = if pattern.contains('"') { format!("'{pattern}'") } else { format!("\"{pattern}\"") };
    format!("//*[self::button or self::a or self::input or self::span or self::div][contains(normalize-space(.), {quoted})][not(*[contains(normalize-space(.), {quoted})])]")
}

/// Finds a Chrome with remote debugging on one of `ports`.
pub async fn discover_debugger(ports: &[u16]) -> Option<String> {
    let http = reqwest::Client::builder().timeout(Duration::from_secs(2)).build().ok()?;
    for port in ports {
        let Ok(resp) = http.get(format!("http://localhost:{port}/json/version")).send().await else {
            continue;
        };
        let Ok(v) = resp.json::<Value>().await else {
            continue;
        };
        if let Some(ws) = v.get("webSocketDebuggerUrl").and_then(|x| x.as_str()) {
            info!(port, "found running chrome");
            return Some(ws.to_string());
        }
    }
    None
}

pub async fn connect(ws_url: &str) -> Result<Arc<OxideBrowser>> {
    let (browser, mut handler) = OxideBrowser::connect(ws_url)
        .await
        .with_context(|| format!("failed to connect to {ws_url}"))?;
    tokio::spawn(async move {
        while let Some(_ev) = handler.next().await {}
    });
    info!(%ws_url, "connected to chrome");
    Ok(Arc::new(browser))
}

// ========================= Driver Adapter =========================

/// Keeps one session page and lends it to one run at a time.
pub struct ChromiumDriver {
    cfg: BrowserConfig,
    remote: Mutex<Option<Arc<OxideBrowser>>>,
    session: Arc<Mutex<Option<Browser>>>,
}

impl ChromiumDriver {
    pub fn new(cfg: BrowserConfig) -> Self {
        Self { cfg, remote: Mutex::new(None), session: Arc::new(Mutex::new(None)) }
    }

    /// The configured websocket, or whatever discovery finds.
    async fn connect_remote(&self) -> Result<Option<Arc<OxideBrowser>>> {
        let ws = match &self.cfg.ws_url {
            Some(ws) => Some(ws.clone()),
            None if self.cfg.discover => discover_debugger(&self.cfg.debug_ports).await,
            None => None,
        };
        match ws {
            Some(ws) => Ok(Some(connect(&ws).await?)),
            None => Ok(None),
        }
    }

    async fn start_session(&self, headless: bool) -> Result<Browser> {
        let attached = attach_with_reconnect(
            &self.remote,
            || self.connect_remote(),
            |shared| Browser::attach(shared, &self.cfg),
        )
        .await?;
        if let Some(browser) = attached {
            return Ok(browser);
        }
        let cfg = BrowserConfig { headless, ..self.cfg.clone() };
        Browser::launch(&cfg).await
    }
}

/// Attaches through the cached connection. If that fails the connection is
/// dropped and one fresh connection is tried before giving up.
async fn attach_with_reconnect<C, T, Conn, ConnFut, Att, AttFut>(
    slot: &Mutex<Option<C>>,
    connect: Conn,
    attach: Att,
) -> Result<Option<T>>
where
    C: Clone,
    Conn: Fn() -> ConnFut,
    ConnFut: Future<Output = Result<Option<C>>>,
    Att: Fn(C) -> AttFut,
    AttFut: Future<Output = Result<T>>,
{
    let mut reconnected = false;
    loop {
        let conn = {
            let mut cached = slot.lock().await;
            match cached.as_ref() {
                Some(conn) => conn.clone(),
                None => {
                    let Some(conn) = connect().await? else {
                        return Ok(None);
                    };
                    reconnected = true;
                    *cached = Some(conn.clone());
                    conn
                }
            }
        };
        match attach(conn).await {
            Ok(attached) => return Ok(Some(attached)),
            Err(e) => {
                slot.lock().await.take();
                if reconnected {
                    return Err(e);
                }
                warn!(error = %e, "remote browser went away, reconnecting");
                reconnected = true;
            }
        }
    }
}

#[async_trait]
impl Driver for ChromiumDriver {
    async fn open(&self, headless: bool) -> Result<Box<dyn Page>, DriverError> {
        let mut lease = Arc::clone(&self.session).lock_owned().await;
        let reusable = match lease.as_ref() {
            Some(current) => current.is_usable(headless).await,
            None => false,
        };
        if reusable {
            debug!("reusing session page");
            return Ok(Box::new(ChromiumPage { lease }));
        }
        if let Some(stale) = lease.take() {
            info!("session page gone, opening a new one");
            let _ = stale.close().await;
        }
        let browser = self
            .start_session(headless)
            .await
            .map_err(|e| DriverError::Unavailable(e.to_string()))?;
        *lease = Some(browser);
        Ok(Box::new(ChromiumPage { lease }))
    }
}

/// Exclusive use of the session page until dropped.
pub struct ChromiumPage {
    lease: OwnedMutexGuard<Option<Browser>>,
}

impl ChromiumPage {
    fn browser(&self) -> Result<&Browser, DriverError> {
        self.lease
            .as_ref()
            .ok_or_else(|| DriverError::Transport("session page is gone".into()))
    }
}

#[async_trait]
impl Page for ChromiumPage {
    async fn navigate(&self, url: &str, wait: WaitPolicy) -> Result<(), DriverError> {
        self.browser()?
            .goto(url, wait)
            .await
            .map_err(|e| DriverError::Navigation(e.to_string()))
    }

    async fn wait_for_probe(
        &self,
        candidate: &StrategyCandidate,
        timeout: Duration,
    ) -> Result<bool, DriverError> {
        Ok(self.browser()?.wait_for(&candidate.locator, timeout).await)
    }

    async fn click(&self, candidate: &StrategyCandidate) -> Result<(), DriverError> {
        self.browser()?
            .click(&candidate.locator)
            .await
            .map_err(|e| DriverError::Transport(e.to_string()))
    }

    async fn type_text(&self, candidate: &StrategyCandidate, text: &str) -> Result<(), DriverError> {
        self.browser()?
            .type_into(&candidate.locator, text)
            .await
            .map_err(|e| DriverError::Transport(e.to_string()))
    }

    async fn press_key(&self, candidate: &StrategyCandidate, key: &str) -> Result<(), DriverError> {
        self.browser()?
            .press_key(&candidate.locator, key)
            .await
            .map_err(|e| DriverError::Transport(e.to_string()))
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        self.browser()?
            .screenshot_png()
            .await
            .map_err(|e| DriverError::Capture(e.to_string()))
    }

    /// The closed browser stays in the slot; `open` notices and replaces it.
    async fn close(&self) -> Result<(), DriverError> {
        self.browser()?
            .close()
            .await
            .map_err(|e| DriverError::Transport(e.to_string()))
    }
}
