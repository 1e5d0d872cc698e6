use super::{ExecutionContext, WebContext};
use crate::config::SessionArgs;
use regex::Regex;

/// Ordered set of known contexts. Native is always present and first.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextRegistry {
    contexts: Vec<ExecutionContext>,
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self {
            contexts: vec![ExecutionContext::Native],
        }
    }

    /// Discards every web context and rebuilds from `webviews`.
    pub fn replace(&mut self, webviews: Vec<WebContext>) {
        self.contexts.clear();
        self.contexts.push(ExecutionContext::Native);
        self.contexts
            .extend(webviews.into_iter().map(ExecutionContext::WebView));
    }

    pub fn contexts(&self) -> &[ExecutionContext] {
        &self.contexts
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn web_contexts(&self) -> impl Iterator<Item = &WebContext> {
        self.contexts.iter().filter_map(|context| match context {
            ExecutionContext::WebView(web) => Some(web),
            ExecutionContext::Native => None,
        })
    }

    pub fn find(&self, name: &str) -> Option<&ExecutionContext> {
        self.contexts.iter().find(|context| context.name() == name)
    }

    /// First web context whose title matches `title`.
    ///
    /// Blank pages only qualify when `policy` accepts them; otherwise a
    /// matching page with a real URL wins.
    pub fn select_by_title(&self, title: &Regex, policy: BlankPagePolicy) -> Option<&WebContext> {
        self.web_contexts()
            .filter(|web| title.is_match(&web.title))
            .find(|web| !web.is_blank() || policy == BlankPagePolicy::Accept)
    }
}

/// Whether a blank placeholder page counts as a navigation match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlankPagePolicy {
    Accept,
    Reject,
}

impl BlankPagePolicy {
    /// Blank pages are accepted on engines older than 7, and on 7.1 when the
    /// session does not drive the built-in browser. This mirrors observed
    /// platform behavior rather than a general rule.
    pub fn for_session(args: &SessionArgs) -> Self {
        let old_engine = args.platform_major().is_some_and(|major| major < 7);
        let point_release = args
            .platform_version
            .as_deref()
            .is_some_and(|v| v == "7.1" || v.starts_with("7.1."));

        if old_engine || (point_release && !args.is_builtin_browser()) {
            BlankPagePolicy::Accept
        } else {
            BlankPagePolicy::Reject
        }
    }
}
