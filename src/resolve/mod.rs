//! Recursive include resolution.
//!
//! # Module Structure
//!
//! - `directive` - `{include ...}` scanning, target paths, positional splicing
//! - `inflight` - Claim/join registry so each path is read once at a time
//!
//! # Flow
//!
//! ```text
//! resolve(path)
//!   └─ load(path) ── cache hit ──────────────────────────────> content
//!        ├─ in flight elsewhere ── join Resolved(fp) ────────> content
//!        │                          └─ claimer cancelled ──> retry load
//!        ├─ in flight, waiting on our chain ─────────────────> Cycle
//!        └─ claim ── read ── resolve_document(text)
//!                              ├─ wait_all(Include(doc, node, 0..n))   registered first
//!                              ├─ one task per distinct target path
//!                              │    └─ load(child) ── publish Include(key) per occurrence
//!                              └─ splice in document order ──> content
//! ```
//!
//! Children complete in any order; every occurrence is correlated by its own
//! [`CorrelationKey`], and the parent splices only once all of them arrived.

pub mod directive;
mod inflight;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use rustc_hash::FxHashMap;
use tokio::task::JoinSet;

use crate::bus::{Bus, CorrelationKey, Payload, Resolution, Topic};
use crate::config::EngineConfig;
use crate::debug;
use crate::error::ResolveError;
use crate::fingerprint::Fingerprint;
use crate::source::TemplateSource;
use inflight::{InFlight, Slot};

type BoxResolution = Pin<Box<dyn Future<Output = Resolution> + Send>>;

/// Include resolver with a document cache keyed by path fingerprint.
pub struct Resolver<S> {
    source: S,
    bus: Arc<Bus>,
    cache: DashMap<Fingerprint, Arc<str>>,
    /// Bumped by every `clear`; loads started earlier do not cache.
    generation: AtomicU64,
    inflight: Arc<InFlight>,
    next_node: AtomicU64,
}

impl<S: TemplateSource> Resolver<S> {
    pub fn new(source: S, bus: Arc<Bus>) -> Self {
        Self {
            source,
            inflight: Arc::new(InFlight::new(Arc::clone(&bus))),
            bus,
            cache: DashMap::new(),
            generation: AtomicU64::new(0),
            next_node: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Public API
    // =========================================================================

    /// Fully resolve the template at `path`.
    ///
    /// Relative paths are taken from `<root>/template/<theme>`.
    pub async fn resolve(self: &Arc<Self>, path: &Path, cfg: Arc<EngineConfig>) -> Resolution {
        let path = cfg.template_path(path);
        debug!("resolve"; "{}", path.display());
        let deadline = cfg.resolve.timeout();
        let load = Arc::clone(self).load(path, Vec::new(), Arc::clone(&cfg));
        with_deadline(deadline, load).await
    }

    /// Resolve directives in an in-memory document.
    ///
    /// The document itself is never cached; its includes are.
    pub async fn resolve_text(self: &Arc<Self>, text: &str, cfg: Arc<EngineConfig>) -> Resolution {
        let deadline = cfg.resolve.timeout();
        let doc = Fingerprint::of(text);
        with_deadline(
            deadline,
            self.resolve_document(text.to_owned(), doc, Vec::new(), &cfg),
        )
        .await
    }

    /// Drop every cached document.
    ///
    /// Loads already running finish normally but leave nothing behind.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let count = self.cache.len();
        self.cache.clear();
        debug!("cache"; "cleared {} resolved documents", count);
    }

    /// Number of cached documents.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Whether the document at this exact path is cached.
    pub fn is_cached(&self, path: &Path) -> bool {
        self.cache.contains_key(&Fingerprint::of_path(path))
    }

    /// Number of loads currently in progress.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    // =========================================================================
    // Loading
    // =========================================================================

    fn lookup(&self, fp: Fingerprint, cfg: &EngineConfig) -> Option<Arc<str>> {
        if !cfg.cache_enabled {
            return None;
        }
        self.cache.get(&fp).map(|hit| Arc::clone(hit.value()))
    }

    /// Load and resolve one file. `chain` holds the fingerprints of every
    /// file above this one.
    fn load(
        self: Arc<Self>,
        path: PathBuf,
        mut chain: Vec<Fingerprint>,
        cfg: Arc<EngineConfig>,
    ) -> BoxResolution {
        Box::pin(async move {
            let fp = Fingerprint::of_path(&path);

            let claim = loop {
                if let Some(hit) = self.lookup(fp, &cfg) {
                    debug!("cache"; "hit {}", path.display());
                    return Ok(hit);
                }

                match self.inflight.claim_or_join(fp, &path, &chain) {
                    Slot::Claimed(claim) => break claim,
                    Slot::Cycle => return Err(ResolveError::Cycle(path)),
                    Slot::Joined(waiter) => {
                        debug!("resolve"; "joining in-flight load of {}", path.display());
                        let resolution = match waiter.await {
                            Some(mut delivery) => delivery
                                .take(&Topic::Resolved(fp))
                                .map_or(Err(ResolveError::Panicked), Payload::into_resolution),
                            None => Err(ResolveError::Panicked),
                        };
                        // The claimer gave up on its own deadline, not ours
                        if let Err(ResolveError::Cancelled(_)) = resolution {
                            debug!("resolve"; "retrying cancelled load of {}", path.display());
                            continue;
                        }
                        return resolution;
                    }
                }
            };
            let generation = self.generation.load(Ordering::SeqCst);

            // Another load may have finished between the lookup and the claim
            if let Some(hit) = self.lookup(fp, &cfg) {
                claim.finish(Ok(Arc::clone(&hit)));
                return Ok(hit);
            }

            let resolution = match self.source.read(&path).await {
                Ok(text) => {
                    chain.push(fp);
                    self.resolve_document(text, fp, chain, &cfg).await
                }
                Err(err) => Err(ResolveError::io(&path, &err)),
            };

            if cfg.cache_enabled
                && let Ok(content) = &resolution
            {
                self.store(fp, content, generation);
            }
            claim.finish(resolution.clone());
            resolution
        })
    }

    /// Cache `content` unless a `clear` happened since `generation`.
    fn store(&self, fp: Fingerprint, content: &Arc<str>, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("cache"; "dropping {} loaded before clear", fp);
            return;
        }
        self.cache.insert(fp, Arc::clone(content));
        // A clear between the check and the insert must still win
        if self.generation.load(Ordering::SeqCst) != generation {
            self.cache
                .remove_if(&fp, |_, cached| Arc::ptr_eq(cached, content));
        }
    }

    /// Resolve every directive in `text` and splice the results in.
    async fn resolve_document(
        self: &Arc<Self>,
        text: String,
        doc: Fingerprint,
        chain: Vec<Fingerprint>,
        cfg: &Arc<EngineConfig>,
    ) -> Resolution {
        let directives = directive::scan(&text);
        if directives.is_empty() {
            return Ok(Arc::from(text));
        }

        let node = self.next_node.fetch_add(1, Ordering::Relaxed);
        let keys: Vec<CorrelationKey> = (0..directives.len())
            .map(|occurrence| CorrelationKey {
                document: doc,
                node,
                occurrence,
            })
            .collect();

        // Registered before any child can publish
        let mut waiter = self.bus.wait_all(keys.iter().copied().map(Topic::Include));

        let mut groups: FxHashMap<PathBuf, Vec<CorrelationKey>> = FxHashMap::default();
        for (directive, key) in directives.iter().zip(&keys) {
            match &directive.target {
                Ok(target) => groups
                    .entry(target.path(&cfg.root_path, &cfg.theme))
                    .or_default()
                    .push(*key),
                Err(err) => self.publish(&[*key], Err(err.clone())),
            }
        }

        let mut tasks = JoinSet::new();
        for (path, group) in groups {
            let fp = Fingerprint::of_path(&path);
            if let Some(hit) = self.lookup(fp, cfg) {
                self.publish(&group, Ok(hit));
            } else if chain.contains(&fp) {
                self.publish(&group, Err(ResolveError::Cycle(path)));
            } else if chain.len() >= cfg.resolve.max_depth {
                self.publish(&group, Err(ResolveError::TooDeep(cfg.resolve.max_depth)));
            } else {
                let resolver = Arc::clone(self);
                let chain = chain.clone();
                let cfg = Arc::clone(cfg);
                tasks.spawn(async move {
                    let resolution = Arc::clone(&resolver).load(path, chain, cfg).await;
                    resolver.publish(&group, resolution);
                });
            }
        }

        let mut delivery = loop {
            tokio::select! {
                delivery = &mut waiter => break delivery.ok_or(ResolveError::Panicked)?,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = joined
                        && err.is_panic()
                    {
                        return Err(ResolveError::Panicked);
                    }
                }
            }
        };

        let contents = keys
            .iter()
            .map(|key| {
                delivery
                    .take(&Topic::Include(*key))
                    .map_or(Err(ResolveError::Panicked), Payload::into_resolution)
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!("resolve"; "spliced {} includes into {}", contents.len(), doc);
        Ok(Arc::from(directive::splice(&text, &directives, &contents)))
    }

    fn publish(&self, keys: &[CorrelationKey], resolution: Resolution) {
        for key in keys {
            self.bus
                .publish(Topic::Include(*key), Payload::Content(resolution.clone()));
        }
    }
}

async fn with_deadline<F>(deadline: std::time::Duration, resolution: F) -> Resolution
where
    F: Future<Output = Resolution>,
{
    tokio::time::timeout(deadline, resolution)
        .await
        .unwrap_or(Err(ResolveError::Timeout(deadline)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use std::io;
    use std::time::Duration;

    const THEME_DIR: &str = "/site/template/default";

    fn tpl(name: &str) -> PathBuf {
        Path::new(THEME_DIR).join(name)
    }

    fn setup(files: &[(&str, &str)]) -> (Arc<Resolver<MemorySource>>, MemorySource) {
        let source = MemorySource::new();
        for (name, content) in files {
            source.insert(tpl(name), *content);
        }
        let resolver = Arc::new(Resolver::new(source.clone(), Arc::new(Bus::new())));
        (resolver, source)
    }

    fn config() -> Arc<EngineConfig> {
        Arc::new(EngineConfig::with_root("/site"))
    }

    fn config_with(f: impl FnOnce(&mut EngineConfig)) -> Arc<EngineConfig> {
        let mut cfg = EngineConfig::with_root("/site");
        f(&mut cfg);
        Arc::new(cfg)
    }

    #[tokio::test]
    async fn test_no_directives_returns_text_unchanged() {
        let (resolver, source) = setup(&[]);
        let text = "plain {text} with {{ vars }}";
        let out = resolver.resolve_text(text, config()).await.unwrap();
        assert_eq!(&*out, text);
        assert_eq!(source.total_reads(), 0);
    }

    #[tokio::test]
    async fn test_single_include() {
        let (resolver, _) = setup(&[("b.tpl", "B!")]);
        let out = resolver
            .resolve_text(r#"a {include file="b.tpl"} c"#, config())
            .await
            .unwrap();
        assert_eq!(&*out, "a B! c");
    }

    #[tokio::test]
    async fn test_module_include() {
        let (resolver, source) = setup(&[]);
        source.insert("/site/module/blog/template/default/nav.tpl", "NAV");
        let out = resolver
            .resolve_text(r#"<{include module='blog' file='nav.tpl'}>"#, config())
            .await
            .unwrap();
        assert_eq!(&*out, "<NAV>");
    }

    #[tokio::test]
    async fn test_repeated_occurrences_each_substituted() {
        let (resolver, source) = setup(&[("a.tpl", "x")]);
        let text = r#"{include file="a.tpl"}-{include file="a.tpl"}-{include file='a.tpl'}"#;
        let out = resolver.resolve_text(text, config()).await.unwrap();
        assert_eq!(&*out, "x-x-x");
        assert_eq!(source.reads(&tpl("a.tpl")), 1);
    }

    #[tokio::test]
    async fn test_nested_includes() {
        let (resolver, _) = setup(&[
            ("page.tpl", r#"<{include file="head.tpl"}|{include file="body.tpl"}>"#),
            ("head.tpl", r#"h({include file="meta.tpl"})"#),
            ("body.tpl", "b"),
            ("meta.tpl", "m"),
        ]);
        let out = resolver
            .resolve(Path::new("page.tpl"), config())
            .await
            .unwrap();
        assert_eq!(&*out, "<h(m)|b>");
    }

    #[tokio::test]
    async fn test_out_of_order_completion_keeps_document_order() {
        let delays: [[u64; 3]; 6] = [
            [5, 25, 45],
            [5, 45, 25],
            [25, 5, 45],
            [25, 45, 5],
            [45, 5, 25],
            [45, 25, 5],
        ];
        for order in delays {
            let (resolver, source) = setup(&[("one.tpl", "1"), ("two.tpl", "2"), ("three.tpl", "3")]);
            for (name, ms) in ["one.tpl", "two.tpl", "three.tpl"].iter().zip(order) {
                source.delay(tpl(name), Duration::from_millis(ms));
            }
            let text = r#"[{include file="one.tpl"},{include file="two.tpl"},{include file="three.tpl"}]"#;
            let out = resolver.resolve_text(text, config()).await.unwrap();
            assert_eq!(&*out, "[1,2,3]", "delays {order:?}");
        }
    }

    #[tokio::test]
    async fn test_cached_include_issues_no_read() {
        let (resolver, source) = setup(&[("b.tpl", "B")]);
        resolver.resolve(Path::new("b.tpl"), config()).await.unwrap();
        assert_eq!(source.reads(&tpl("b.tpl")), 1);

        let out = resolver
            .resolve_text(r#"{include file="b.tpl"}{include file="b.tpl"}"#, config())
            .await
            .unwrap();
        assert_eq!(&*out, "BB");
        assert_eq!(source.reads(&tpl("b.tpl")), 1);
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent_without_io() {
        let (resolver, source) = setup(&[
            ("page.tpl", r#"p{include file="part.tpl"}"#),
            ("part.tpl", "q"),
        ]);
        let first = resolver.resolve(Path::new("page.tpl"), config()).await.unwrap();
        let reads = source.total_reads();
        let second = resolver.resolve(Path::new("page.tpl"), config()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(source.total_reads(), reads);
        assert_eq!(resolver.cached(), 2);
    }

    #[tokio::test]
    async fn test_clear_forces_reread() {
        let (resolver, source) = setup(&[("a.tpl", "old")]);
        resolver.resolve(Path::new("a.tpl"), config()).await.unwrap();
        source.insert(tpl("a.tpl"), "new");

        let cached = resolver.resolve(Path::new("a.tpl"), config()).await.unwrap();
        assert_eq!(&*cached, "old");

        resolver.clear();
        assert!(!resolver.is_cached(&tpl("a.tpl")));
        let fresh = resolver.resolve(Path::new("a.tpl"), config()).await.unwrap();
        assert_eq!(&*fresh, "new");
        assert_eq!(source.reads(&tpl("a.tpl")), 2);
    }

    #[tokio::test]
    async fn test_cache_disabled_rereads() {
        let (resolver, source) = setup(&[("a.tpl", "A")]);
        let cfg = config_with(|c| c.cache_enabled = false);
        resolver.resolve(Path::new("a.tpl"), Arc::clone(&cfg)).await.unwrap();
        resolver.resolve(Path::new("a.tpl"), cfg).await.unwrap();
        assert_eq!(source.reads(&tpl("a.tpl")), 2);
        assert_eq!(resolver.cached(), 0);
    }

    #[tokio::test]
    async fn test_nested_io_error_propagates() {
        let (resolver, _) = setup(&[
            ("page.tpl", r#"{include file="mid.tpl"}"#),
            ("mid.tpl", r#"{include file="gone.tpl"}"#),
        ]);
        let err = resolver
            .resolve(Path::new("page.tpl"), config())
            .await
            .unwrap_err();
        match err {
            ResolveError::Io { path, kind, .. } => {
                assert_eq!(path, tpl("gone.tpl"));
                assert_eq!(kind, io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!resolver.is_cached(&tpl("page.tpl")));
        assert!(!resolver.is_cached(&tpl("mid.tpl")));
    }

    #[tokio::test]
    async fn test_missing_file_attribute_is_pattern_error() {
        let (resolver, _) = setup(&[]);
        let err = resolver
            .resolve_text(r#"x {include module="blog"} y"#, config())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Pattern(_)));
    }

    #[tokio::test]
    async fn test_first_error_in_document_order_wins() {
        let (resolver, _) = setup(&[]);
        let err = resolver
            .resolve_text(r#"{include file="gone.tpl"}{include nothing}"#, config())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Io { .. }), "got {err}");
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_read() {
        let (resolver, source) = setup(&[("slow.tpl", "S")]);
        source.delay(tpl("slow.tpl"), Duration::from_millis(50));
        let cfg = config_with(|c| c.cache_enabled = false);

        let (a, b) = tokio::join!(
            resolver.resolve(Path::new("slow.tpl"), Arc::clone(&cfg)),
            resolver.resolve(Path::new("slow.tpl"), Arc::clone(&cfg)),
        );
        assert_eq!(&*a.unwrap(), "S");
        assert_eq!(&*b.unwrap(), "S");
        assert_eq!(source.reads(&tpl("slow.tpl")), 1);
        assert_eq!(resolver.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cycle_is_reported() {
        let (resolver, _) = setup(&[
            ("a.tpl", r#"{include file="b.tpl"}"#),
            ("b.tpl", r#"{include file="a.tpl"}"#),
            ("self.tpl", r#"me {include file="self.tpl"}"#),
        ]);
        let err = resolver.resolve(Path::new("a.tpl"), config()).await.unwrap_err();
        assert_eq!(err, ResolveError::Cycle(tpl("a.tpl")));

        let err = resolver
            .resolve(Path::new("self.tpl"), config())
            .await
            .unwrap_err();
        assert_eq!(err, ResolveError::Cycle(tpl("self.tpl")));
    }

    #[tokio::test]
    async fn test_cycle_between_sibling_includes() {
        let (resolver, source) = setup(&[
            ("a.tpl", r#"{include file="b.tpl"}{include file="c.tpl"}"#),
            ("b.tpl", r#"b{include file="c.tpl"}"#),
            ("c.tpl", r#"c{include file="b.tpl"}"#),
        ]);
        // Both siblings claim their own file before either reads
        source.delay(tpl("b.tpl"), Duration::from_millis(20));
        source.delay(tpl("c.tpl"), Duration::from_millis(20));
        let cfg = config_with(|c| c.resolve.timeout_ms = 300);

        let err = resolver
            .resolve(Path::new("a.tpl"), cfg)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Cycle(_)), "got {err}");
        assert_eq!(resolver.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let (resolver, _) = setup(&[
            ("d0.tpl", r#"{include file="d1.tpl"}"#),
            ("d1.tpl", r#"{include file="d2.tpl"}"#),
            ("d2.tpl", "leaf"),
        ]);
        let err = resolver
            .resolve(Path::new("d0.tpl"), config_with(|c| c.resolve.max_depth = 2))
            .await
            .unwrap_err();
        assert_eq!(err, ResolveError::TooDeep(2));

        let out = resolver
            .resolve(Path::new("d0.tpl"), config_with(|c| c.resolve.max_depth = 3))
            .await
            .unwrap();
        assert_eq!(&*out, "leaf");
    }

    #[tokio::test]
    async fn test_timeout_releases_claim() {
        let (resolver, source) = setup(&[("slow.tpl", "S")]);
        source.delay(tpl("slow.tpl"), Duration::from_millis(500));
        let cfg = config_with(|c| c.resolve.timeout_ms = 20);

        let err = resolver
            .resolve(Path::new("slow.tpl"), cfg)
            .await
            .unwrap_err();
        assert_eq!(err, ResolveError::Timeout(Duration::from_millis(20)));
        assert_eq!(resolver.in_flight(), 0);
        assert!(!resolver.is_cached(&tpl("slow.tpl")));
    }

    #[tokio::test]
    async fn test_joiner_outlives_claimer_deadline() {
        let (resolver, source) = setup(&[
            ("page1.tpl", r#"{include file="shared.tpl"}{include file="slow.tpl"}"#),
            ("page2.tpl", r#"[{include file="shared.tpl"}]"#),
            ("shared.tpl", "S"),
            ("slow.tpl", "Z"),
        ]);
        source.delay(tpl("shared.tpl"), Duration::from_millis(150));
        source.delay(tpl("slow.tpl"), Duration::from_secs(1));

        let first = tokio::spawn({
            let resolver = Arc::clone(&resolver);
            let cfg = config_with(|c| c.resolve.timeout_ms = 100);
            async move { resolver.resolve(Path::new("page1.tpl"), cfg).await }
        });
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Joins page1's load of shared.tpl, which page1 then abandons
        let second = resolver.resolve(Path::new("page2.tpl"), config()).await;

        assert_eq!(
            first.await.unwrap(),
            Err(ResolveError::Timeout(Duration::from_millis(100)))
        );
        assert_eq!(&*second.unwrap(), "[S]");
        assert_eq!(source.reads(&tpl("shared.tpl")), 2);
        assert_eq!(resolver.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_clear_during_load_discards_stale_content() {
        let (resolver, source) = setup(&[("a.tpl", "old")]);
        source.delay(tpl("a.tpl"), Duration::from_millis(50));

        let pending = tokio::spawn({
            let resolver = Arc::clone(&resolver);
            async move { resolver.resolve(Path::new("a.tpl"), config()).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        source.insert(tpl("a.tpl"), "new");
        resolver.clear();

        assert_eq!(&*pending.await.unwrap().unwrap(), "old");
        assert!(!resolver.is_cached(&tpl("a.tpl")));

        let fresh = resolver.resolve(Path::new("a.tpl"), config()).await.unwrap();
        assert_eq!(&*fresh, "new");
        assert_eq!(source.reads(&tpl("a.tpl")), 2);
    }

    #[tokio::test]
    async fn test_absolute_path_is_used_as_is() {
        let (resolver, source) = setup(&[]);
        source.insert("/elsewhere/page.tpl", r#"[{include file="x.tpl"}]"#);
        source.insert(tpl("x.tpl"), "X");
        let out = resolver
            .resolve(Path::new("/elsewhere/page.tpl"), config())
            .await
            .unwrap();
        assert_eq!(&*out, "[X]");
    }
}
