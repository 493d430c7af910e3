// =============================================================================
// Fetcher boundary — the external headless-browser driver contract
// =============================================================================
//
// The engine never embeds a browser. It consumes this capability set and the
// embedding application supplies the driver. Pages and elements are trait
// objects so the pool and extractor stay driver-agnostic.
//
// The scripted stub at the bottom backs the engine's own tests.
// =============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ScrapeResult;

/// Kinds of selector expressions a driver must understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorKind {
    Css,
    Xpath,
    Text,
    Attribute,
}

/// Anything that can be queried for elements: a page or an element subtree.
#[async_trait]
pub trait QueryRoot: Send + Sync {
    async fn query(
        &self,
        selector: &str,
        kind: SelectorKind,
    ) -> ScrapeResult<Vec<Box<dyn ElementHandle>>>;
}

/// One browser page owned by the connection pool.
#[async_trait]
pub trait PageHandle: QueryRoot {
    async fn goto(&self, url: &str) -> ScrapeResult<()>;
    async fn close(&self) -> ScrapeResult<()>;
}

/// One DOM element returned by a query.
#[async_trait]
pub trait ElementHandle: QueryRoot {
    async fn text(&self) -> ScrapeResult<String>;
    async fn attribute(&self, name: &str) -> ScrapeResult<Option<String>>;
}

/// Driver capability: open fresh pages on demand.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn open_page(&self) -> ScrapeResult<Box<dyn PageHandle>>;
}

// =============================================================================
// Scripted stub (test support)
// =============================================================================

#[cfg(test)]
pub mod stub {
    //! In-memory driver used by the engine's tests: pages are scripted as
    //! selector -> element tables, failures are injected per URL.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::{ElementHandle, Fetcher, PageHandle, QueryRoot, SelectorKind};
    use crate::errors::{ScrapeError, ScrapeResult};

    /// A scripted element with text, attributes, and child matches.
    #[derive(Debug, Clone, Default)]
    pub struct StubElement {
        pub text: String,
        pub attrs: HashMap<String, String>,
        pub children: HashMap<String, Vec<StubElement>>,
    }

    impl StubElement {
        pub fn new(text: impl Into<String>) -> Self {
            Self {
                text: text.into(),
                ..Default::default()
            }
        }

        pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
            self.attrs.insert(name.into(), value.into());
            self
        }

        pub fn with_children(
            mut self,
            selector: impl Into<String>,
            children: Vec<StubElement>,
        ) -> Self {
            self.children.insert(selector.into(), children);
            self
        }
    }

    #[async_trait]
    impl QueryRoot for StubElement {
        async fn query(
            &self,
            selector: &str,
            _kind: SelectorKind,
        ) -> ScrapeResult<Vec<Box<dyn ElementHandle>>> {
            Ok(self
                .children
                .get(selector)
                .map(|matches| {
                    matches
                        .iter()
                        .cloned()
                        .map(|e| Box::new(e) as Box<dyn ElementHandle>)
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    #[async_trait]
    impl ElementHandle for StubElement {
        async fn text(&self) -> ScrapeResult<String> {
            Ok(self.text.clone())
        }

        async fn attribute(&self, name: &str) -> ScrapeResult<Option<String>> {
            Ok(self.attrs.get(name).cloned())
        }
    }

    /// Scripted content of one URL: selector -> matching elements.
    #[derive(Debug, Clone, Default)]
    pub struct PageContent {
        pub selectors: HashMap<String, Vec<StubElement>>,
    }

    impl PageContent {
        pub fn with(mut self, selector: impl Into<String>, elements: Vec<StubElement>) -> Self {
            self.selectors.insert(selector.into(), elements);
            self
        }
    }

    #[derive(Default)]
    struct StubState {
        pages: HashMap<String, PageContent>,
        /// Remaining injected failures per URL; `usize::MAX` means always.
        failures: HashMap<String, usize>,
        visits: HashMap<String, usize>,
    }

    /// Scripted driver shared across pool, circuit, and orchestrator tests.
    #[derive(Clone, Default)]
    pub struct StubFetcher {
        state: Arc<Mutex<StubState>>,
        pub opened: Arc<AtomicUsize>,
        pub closed: Arc<AtomicUsize>,
    }

    impl StubFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        /// Script the content served for `url`.
        pub fn serve(&self, url: impl Into<String>, content: PageContent) {
            self.state.lock().pages.insert(url.into(), content);
        }

        /// Make the next `n` navigations to `url` fail with a timeout.
        pub fn fail_times(&self, url: impl Into<String>, n: usize) {
            self.state.lock().failures.insert(url.into(), n);
        }

        /// Make every navigation to `url` fail with a timeout.
        pub fn fail_always(&self, url: impl Into<String>) {
            self.state.lock().failures.insert(url.into(), usize::MAX);
        }

        /// How many times `url` was navigated to.
        pub fn visits(&self, url: &str) -> usize {
            self.state.lock().visits.get(url).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn open_page(&self) -> ScrapeResult<Box<dyn PageHandle>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubPage {
                state: self.state.clone(),
                closed: self.closed.clone(),
                current_url: Mutex::new(None),
            }))
        }
    }

    pub struct StubPage {
        state: Arc<Mutex<StubState>>,
        closed: Arc<AtomicUsize>,
        current_url: Mutex<Option<String>>,
    }

    #[async_trait]
    impl QueryRoot for StubPage {
        async fn query(
            &self,
            selector: &str,
            _kind: SelectorKind,
        ) -> ScrapeResult<Vec<Box<dyn ElementHandle>>> {
            let url = self.current_url.lock().clone();
            let url = match url {
                Some(url) => url,
                None => return Ok(Vec::new()),
            };
            let state = self.state.lock();
            Ok(state
                .pages
                .get(&url)
                .and_then(|content| content.selectors.get(selector))
                .map(|matches| {
                    matches
                        .iter()
                        .cloned()
                        .map(|e| Box::new(e) as Box<dyn ElementHandle>)
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    #[async_trait]
    impl PageHandle for StubPage {
        async fn goto(&self, url: &str) -> ScrapeResult<()> {
            {
                let mut state = self.state.lock();
                *state.visits.entry(url.to_string()).or_default() += 1;

                match state.failures.get_mut(url) {
                    Some(0) => {
                        state.failures.remove(url);
                    }
                    Some(remaining) => {
                        if *remaining != usize::MAX {
                            *remaining -= 1;
                        }
                        return Err(ScrapeError::Timeout(Duration::from_secs(30)));
                    }
                    None => {}
                }
            }
            *self.current_url.lock() = Some(url.to_string());
            Ok(())
        }

        async fn close(&self) -> ScrapeResult<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn stub_serves_scripted_elements() {
        let fetcher = StubFetcher::new();
        fetcher.serve(
            "https://example.com",
            PageContent::default().with(
                "h2 a",
                vec![StubElement::new("Dev Pleno").with_attr("href", "/vagas/1")],
            ),
        );

        let page = fetcher.open_page().await.unwrap();
        page.goto("https://example.com").await.unwrap();

        let elements = page.query("h2 a", SelectorKind::Css).await.unwrap();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].text().await.unwrap(), "Dev Pleno");
        assert_eq!(
            elements[0].attribute("href").await.unwrap().as_deref(),
            Some("/vagas/1")
        );
        assert_eq!(fetcher.visits("https://example.com"), 1);
    }

    #[tokio::test]
    async fn stub_injects_bounded_failures() {
        let fetcher = StubFetcher::new();
        fetcher.fail_times("https://example.com", 2);

        let page = fetcher.open_page().await.unwrap();
        assert!(page.goto("https://example.com").await.is_err());
        assert!(page.goto("https://example.com").await.is_err());
        assert!(page.goto("https://example.com").await.is_ok());
    }
}
