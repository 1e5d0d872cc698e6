use super::{BlankPagePolicy, ContextEngine, WebContext};
use crate::config::SessionArgs;
use crate::{DriverError, Result};
use regex::Regex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(90);
pub const NAVIGATION_TICK: Duration = Duration::from_millis(500);

pub const FAVORITES_PAYLOAD: &str = "au.openFavorites()";
pub const RELOAD_TAP_PAYLOAD: &str = "au.tapReload()";

pub fn address_bar_payload(url: &str) -> String {
    let quoted = serde_json::Value::String(url.to_string()).to_string();
    format!("au.enterUrl({})", quoted)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigationBudget {
    pub timeout: Duration,
    pub tick: Duration,
}

impl Default for NavigationBudget {
    fn default() -> Self {
        Self {
            timeout: NAVIGATION_TIMEOUT,
            tick: NAVIGATION_TICK,
        }
    }
}

/// How the engine gets a web view on screen before polling for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStrategy {
    /// Type the URL into the browser's address bar and go.
    AddressBar(String),
    /// Open the favorites view so a page loads.
    Favorites,
    /// Only poll for a matching title.
    TitlePoll,
}

impl EntryStrategy {
    pub fn for_session(args: &SessionArgs) -> Self {
        if !args.is_builtin_browser() {
            return EntryStrategy::TitlePoll;
        }
        match &args.initial_url {
            Some(url) => EntryStrategy::AddressBar(url.clone()),
            None if args.platform_major().is_some_and(|major| major >= 7) => EntryStrategy::Favorites,
            None => EntryStrategy::TitlePoll,
        }
    }

    fn payload(&self) -> Option<String> {
        match self {
            EntryStrategy::AddressBar(url) => Some(address_bar_payload(url)),
            EntryStrategy::Favorites => Some(FAVORITES_PAYLOAD.to_string()),
            EntryStrategy::TitlePoll => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NavigationTarget {
    pub title: Regex,
    pub blank_pages: BlankPagePolicy,
    pub entry: EntryStrategy,
    pub reload_tap: bool,
}

impl NavigationTarget {
    pub fn new(title: Regex, blank_pages: BlankPagePolicy) -> Self {
        Self {
            title,
            blank_pages,
            entry: EntryStrategy::TitlePoll,
            reload_tap: false,
        }
    }

    pub fn for_session(args: &SessionArgs) -> Result<Self> {
        let pattern = args.webview_title.as_deref().unwrap_or(".*");
        let title = Regex::new(pattern).map_err(|e| {
            DriverError::Configuration(format!("Invalid webviewTitle pattern '{}': {}", pattern, e))
        })?;
        Ok(Self {
            title,
            blank_pages: BlankPagePolicy::for_session(args),
            entry: EntryStrategy::for_session(args),
            reload_tap: args.is_builtin_browser(),
        })
    }
}

impl ContextEngine {
    /// Runs the entry strategy, then polls until a web view matches `target`.
    ///
    /// The match becomes the current context. Fails with
    /// [`DriverError::WebviewNotFound`] once the navigation budget is spent.
    pub async fn navigate(&self, target: &NavigationTarget) -> Result<WebContext> {
        let budget = self.budget();
        let started = Instant::now();

        if let Some(payload) = target.entry.payload() {
            debug!(strategy = ?target.entry, "Running navigation entry step");
            match self.queue().execute_attached(payload).await {
                Err(e) if e.is_engine_exit() => return Err(e),
                Err(e) => warn!("Navigation entry step failed, polling for title instead: {}", e),
                Ok(_) => {}
            }
        }

        loop {
            if let Err(e) = self.refresh().await {
                if e.is_engine_exit() {
                    return Err(e);
                }
                debug!("Context refresh failed during navigation: {}", e);
            }

            let found = self
                .registry
                .read()
                .await
                .select_by_title(&target.title, target.blank_pages)
                .cloned();

            if let Some(web) = found {
                info!(id = %web.id, title = %web.title, elapsed = ?started.elapsed(), "Found matching web view");
                self.select(web.clone()).await?;
                self.cancel_page_load().await;
                return Ok(web);
            }

            if started.elapsed() >= budget.timeout {
                return Err(DriverError::WebviewNotFound(format!(
                    "title /{}/ after {:?}",
                    target.title.as_str(),
                    budget.timeout
                )));
            }

            if target.reload_tap {
                match self.queue().execute_attached(RELOAD_TAP_PAYLOAD).await {
                    Err(e) if e.is_engine_exit() => return Err(e),
                    Err(e) => debug!("Reload tap failed: {}", e),
                    Ok(_) => {}
                }
            }
            tokio::time::sleep(budget.tick).await;
        }
    }

    /// Brings up the first web view of a session that asked for one.
    pub async fn initial_webview(&self, args: &SessionArgs) -> Result<()> {
        if !args.auto_webview && !args.is_builtin_browser() {
            return Ok(());
        }
        let target = NavigationTarget::for_session(args)?;
        self.navigate(&target).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_strategy_by_session() {
        let browser = SessionArgs {
            browser_name: Some("Safari".into()),
            platform_version: Some("8.1".into()),
            ..Default::default()
        };
        assert_eq!(EntryStrategy::for_session(&browser), EntryStrategy::Favorites);

        let with_url = SessionArgs {
            initial_url: Some("http://example.com".into()),
            ..browser.clone()
        };
        assert_eq!(
            EntryStrategy::for_session(&with_url),
            EntryStrategy::AddressBar("http://example.com".into())
        );

        let old = SessionArgs {
            platform_version: Some("6.1".into()),
            ..browser
        };
        assert_eq!(EntryStrategy::for_session(&old), EntryStrategy::TitlePoll);
        assert_eq!(EntryStrategy::for_session(&SessionArgs::default()), EntryStrategy::TitlePoll);
    }

    #[test]
    fn test_address_bar_payload_quotes_url() {
        assert_eq!(
            address_bar_payload("http://a/\"b\""),
            r#"au.enterUrl("http://a/\"b\"")"#
        );
    }

    #[test]
    fn test_invalid_title_pattern_is_configuration_error() {
        let args = SessionArgs {
            webview_title: Some("(".into()),
            ..Default::default()
        };
        assert!(matches!(
            NavigationTarget::for_session(&args),
            Err(DriverError::Configuration(_))
        ));
    }
}
