use serde::{Deserialize, Serialize};
use std::time::Duration;
use thirtyfour::prelude::*;
use thirtyfour::ChromiumLikeCapabilities;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("browser session failed: {0}")]
    Session(String),

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("browser command failed: {0}")]
    Command(String),

    #[error("could not start async runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

impl DriverError {
    /// Whether the session is unusable for any further request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::Session(_) | DriverError::Runtime(_))
    }
}

/// Page automation as the pipeline sees it: navigate, click, read the page.
pub trait Driver {
    fn get(&mut self, url: &str) -> Result<(), DriverError>;

    /// Clicks the first element matching `selector`. `Ok(false)` when no
    /// element matches.
    fn click(&mut self, selector: &str) -> Result<bool, DriverError>;

    /// HTML of the current page.
    fn page_source(&mut self) -> Result<String, DriverError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub webdriver_url: String,
    pub headless: bool,
    pub window_width: u32,
    pub window_height: u32,
    pub user_agent: String,
    pub page_load_timeout_secs: u64,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:9515".to_string(),
            headless: true,
            window_width: 1920,
            window_height: 1080,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"
                .to_string(),
            page_load_timeout_secs: 30,
        }
    }
}

/// A Chrome session driven over WebDriver. The session is closed when the
/// value is dropped, whatever path the caller leaves by.
pub struct WebDriverSession {
    runtime: tokio::runtime::Runtime,
    driver: Option<WebDriver>,
}

impl WebDriverSession {
    pub fn open(settings: &BrowserSettings) -> Result<Self, DriverError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let driver = runtime.block_on(async {
            let mut caps = DesiredCapabilities::chrome();
            if settings.headless {
                caps.add_arg("--headless=new")?;
            }
            caps.add_arg("--no-sandbox")?;
            caps.add_arg("--disable-dev-shm-usage")?;
            caps.add_arg(&format!(
                "--window-size={},{}",
                settings.window_width, settings.window_height
            ))?;
            caps.add_arg(&format!("--user-agent={}", settings.user_agent))?;

            let driver = WebDriver::new(&settings.webdriver_url, caps).await?;
            driver
                .set_page_load_timeout(Duration::from_secs(settings.page_load_timeout_secs))
                .await?;
            Ok::<_, WebDriverError>(driver)
        });

        let driver = driver.map_err(|e| {
            DriverError::Session(format!(
                "{} (is chromedriver running at {}?)",
                e, settings.webdriver_url
            ))
        })?;

        info!(url = %settings.webdriver_url, headless = settings.headless, "browser session opened");
        Ok(Self {
            runtime,
            driver: Some(driver),
        })
    }

    fn driver(&self) -> Result<&WebDriver, DriverError> {
        self.driver
            .as_ref()
            .ok_or_else(|| DriverError::Session("session already closed".to_string()))
    }

    /// Ends the session explicitly, reporting failures that `Drop` would swallow.
    pub fn close(mut self) -> Result<(), DriverError> {
        match self.driver.take() {
            Some(driver) => self
                .runtime
                .block_on(driver.quit())
                .map_err(|e| DriverError::Session(e.to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            if let Err(e) = self.runtime.block_on(driver.quit()) {
                warn!(error = %e, "failed to close browser session");
            } else {
                debug!("browser session closed");
            }
        }
    }
}

fn classify_error(url: Option<&str>, err: WebDriverError) -> DriverError {
    let reason = err.to_string();
    let lower = reason.to_lowercase();
    if lower.contains("invalid session")
        || lower.contains("session deleted")
        || lower.contains("disconnected")
        || lower.contains("connection refused")
    {
        return DriverError::Session(reason);
    }
    match url {
        Some(url) => DriverError::Navigation {
            url: url.to_string(),
            reason,
        },
        None => DriverError::Command(reason),
    }
}

impl Driver for WebDriverSession {
    fn get(&mut self, url: &str) -> Result<(), DriverError> {
        let driver = self.driver()?;
        debug!(url, "navigating");
        self.runtime
            .block_on(driver.goto(url))
            .map_err(|e| classify_error(Some(url), e))
    }

    fn click(&mut self, selector: &str) -> Result<bool, DriverError> {
        let driver = self.driver()?;
        self.runtime.block_on(async {
            let element = match driver.find(By::Css(selector)).await {
                Ok(element) => element,
                Err(_) => return Ok(false),
            };
            element
                .click()
                .await
                .map(|_| true)
                .map_err(|e| classify_error(None, e))
        })
    }

    fn page_source(&mut self) -> Result<String, DriverError> {
        let driver = self.driver()?;
        self.runtime
            .block_on(driver.source())
            .map_err(|e| classify_error(None, e))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_fatality() {
        assert!(DriverError::Session("gone".to_string()).is_fatal());
        assert!(!DriverError::Command("stale".to_string()).is_fatal());
        assert!(
            !DriverError::Navigation {
                url: "https://example.com".to_string(),
                reason: "timeout".to_string()
            }
            .is_fatal()
        );
    }

    #[test]
    #[ignore] // Requires a running chromedriver
    fn test_open_session_and_read_page() {
        let mut session = WebDriverSession::open(&BrowserSettings::default()).expect("session");
        session.get("https://example.com").expect("navigate");
        let html = session.page_source().expect("source");
        assert!(html.contains("Example Domain"));
        session.close().expect("close");
    }
}
