//! jamproxy/src/plugin.rs
//! Plugin manifests, discovery, and the reload that turns them into live hooks.
//!
//! A plugin is a directory holding a `plugin.json` manifest. `ui` plugins are
//! recorded only. `game` plugins name an entry point in `main`, which is looked
//! up in a [`PluginRegistry`] of factories compiled into the host. The factory
//! receives a [`PluginContext`] and registers its hooks and commands through it.

use crate::{
    dispatch::{Dispatch, Registry},
    error::PluginError,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, error, info, warn};

pub const MANIFEST_FILE: &str = "plugin.json";
/// Where a plugin keeps its installed dependencies, relative to its directory.
pub const DEPENDENCY_DIR: &str = "node_modules";

/// Load order follows declaration order: `ui` plugins first.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Ui,
    Game,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PluginManifest {
    pub name: String,
    pub main: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(rename = "type")]
    pub kind: PluginKind,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

impl PluginManifest {
    /// Parses and validates a manifest read from `path`.
    pub fn parse(path: &Path, contents: &str) -> Result<Self, PluginError> {
        let invalid = |reason: String| PluginError::InvalidManifest {
            path: path.display().to_string(),
            reason,
        };
        let manifest: PluginManifest =
            serde_json::from_str(contents).map_err(|e| invalid(e.to_string()))?;
        if manifest.name.trim().is_empty() {
            return Err(invalid("`name` is empty".into()));
        }
        if manifest.main.trim().is_empty() {
            return Err(invalid("`main` is empty".into()));
        }
        Ok(manifest)
    }
}

/// One manifest file as found on disk.
#[derive(Debug, Clone)]
pub struct ManifestSource {
    /// The plugin directory.
    pub path: PathBuf,
    pub contents: String,
}

/// Where plugins come from.
#[async_trait]
pub trait PluginFilesystem: Send + Sync {
    /// Every candidate manifest. A failed read skips that plugin only.
    async fn manifests(&self) -> Vec<Result<ManifestSource, PluginError>>;

    /// Per-plugin writable directory.
    fn data_path(&self, manifest: &PluginManifest) -> PathBuf;

    /// Called before a plugin with declared dependencies is instantiated. An error
    /// skips the plugin. Sources that ship everything bundled can keep the default.
    async fn install_dependencies(
        &self,
        _manifest: &PluginManifest,
        _path: &Path,
    ) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Scans `<root>/<dir>/plugin.json`.
#[derive(Debug, Clone)]
pub struct DirectoryPlugins {
    root: PathBuf,
    data_root: PathBuf,
}

impl DirectoryPlugins {
    pub fn new(root: impl Into<PathBuf>, data_root: impl Into<PathBuf>) -> Self {
        DirectoryPlugins {
            root: root.into(),
            data_root: data_root.into(),
        }
    }
}

#[async_trait]
impl PluginFilesystem for DirectoryPlugins {
    async fn manifests(&self) -> Vec<Result<ManifestSource, PluginError>> {
        let mut found = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %self.root.display(), "Plugin directory unavailable: {}", e);
                return found;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    found.push(Err(PluginError::Read {
                        path: self.root.display().to_string(),
                        reason: e.to_string(),
                    }));
                    break;
                }
            };
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let manifest = dir.join(MANIFEST_FILE);
            match tokio::fs::read_to_string(&manifest).await {
                Ok(contents) => found.push(Ok(ManifestSource {
                    path: dir,
                    contents,
                })),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(dir = %dir.display(), "No manifest, skipping");
                }
                Err(e) => found.push(Err(PluginError::Read {
                    path: manifest.display().to_string(),
                    reason: e.to_string(),
                })),
            }
        }
        found
    }

    fn data_path(&self, manifest: &PluginManifest) -> PathBuf {
        self.data_root.join(&manifest.name)
    }

    /// Each dependency must already be installed under the plugin's
    /// [`DEPENDENCY_DIR`], or be another plugin directory under the root.
    async fn install_dependencies(
        &self,
        manifest: &PluginManifest,
        path: &Path,
    ) -> Result<(), PluginError> {
        let mut missing = Vec::new();
        for (dependency, version) in &manifest.dependencies {
            let candidates = [
                path.join(DEPENDENCY_DIR).join(dependency),
                self.root.join(dependency).join(MANIFEST_FILE),
            ];
            let mut found = false;
            if is_plain_name(dependency) {
                for candidate in &candidates {
                    if tokio::fs::try_exists(candidate).await.unwrap_or(false) {
                        found = true;
                        break;
                    }
                }
            }
            if found {
                debug!(plugin = %manifest.name, %dependency, "Dependency available");
            } else {
                missing.push(format!("{}@{}", dependency, version));
            }
        }

        if missing.is_empty() {
            return Ok(());
        }
        Err(PluginError::Dependencies {
            name: manifest.name.clone(),
            reason: format!("missing {}", missing.join(", ")),
        })
    }
}

// Package names may be scoped (`@scope/name`) but never climb out of the tree.
fn is_plain_name(dependency: &str) -> bool {
    let path = Path::new(dependency);
    !dependency.is_empty()
        && path
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)))
}

/// A running game plugin.
#[async_trait]
pub trait GamePlugin: Send + Sync {
    async fn on_settings_updated(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Handed to a factory when its plugin is instantiated.
#[derive(Clone)]
pub struct PluginContext {
    pub dispatch: Dispatch,
    pub manifest: PluginManifest,
    pub data_path: PathBuf,
}

pub type PluginFactory =
    Arc<dyn Fn(PluginContext) -> anyhow::Result<Arc<dyn GamePlugin>> + Send + Sync>;

/// Entry points known to the host, keyed by a manifest's `main`.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, main: &str, factory: F) -> &mut Self
    where
        F: Fn(PluginContext) -> anyhow::Result<Arc<dyn GamePlugin>> + Send + Sync + 'static,
    {
        self.factories.insert(main.to_string(), Arc::new(factory));
        self
    }

    pub fn get(&self, main: &str) -> Option<PluginFactory> {
        self.factories.get(main).cloned()
    }
}

#[derive(Clone)]
pub struct LoadedPlugin {
    pub manifest: PluginManifest,
    pub path: PathBuf,
    /// `None` for `ui` plugins.
    pub instance: Option<Arc<dyn GamePlugin>>,
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("manifest", &self.manifest)
            .field("path", &self.path)
            .field("running", &self.instance.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<PluginError>,
}

impl Dispatch {
    /// Rebuilds every hook, command and plugin from scratch and swaps them in at
    /// once. Intervals from the previous generation are cancelled. A plugin that
    /// fails validation or instantiation is reported and skipped.
    pub async fn load(&self, fs: &dyn PluginFilesystem, entries: &PluginRegistry) -> LoadReport {
        let _guard = self.reload_guard().await;
        let staged = Arc::new(Registry::default());
        let scoped = self.pinned_to(staged.clone());
        scoped.register_defaults();
        self.clear_all_intervals();

        let mut report = LoadReport::default();
        let mut candidates = Vec::new();
        for source in fs.manifests().await {
            match source.and_then(|s| PluginManifest::parse(&s.path, &s.contents).map(|m| (m, s.path))) {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => self.skip(&mut report, e),
            }
        }
        candidates.sort_by(|(a, _), (b, _)| (a.kind, &a.name).cmp(&(b.kind, &b.name)));

        for (manifest, path) in candidates {
            match self.start_plugin(&scoped, &staged, fs, entries, &manifest, &path).await {
                Ok(instance) => {
                    info!(plugin = %manifest.name, kind = ?manifest.kind, "Loaded plugin");
                    report.loaded.push(manifest.name.clone());
                    staged.plugins.insert(
                        manifest.name.clone(),
                        LoadedPlugin {
                            manifest,
                            path,
                            instance,
                        },
                    );
                }
                Err(e) => self.skip(&mut report, e),
            }
        }

        self.swap_registry(staged);
        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "Plugins reloaded"
        );
        report
    }

    async fn start_plugin(
        &self,
        scoped: &Dispatch,
        staged: &Registry,
        fs: &dyn PluginFilesystem,
        entries: &PluginRegistry,
        manifest: &PluginManifest,
        path: &Path,
    ) -> Result<Option<Arc<dyn GamePlugin>>, PluginError> {
        if staged.plugins.contains_key(&manifest.name) {
            return Err(PluginError::Duplicate(manifest.name.clone()));
        }
        if manifest.kind == PluginKind::Ui {
            return Ok(None);
        }

        let factory = entries
            .get(&manifest.main)
            .ok_or_else(|| PluginError::UnknownEntry {
                name: manifest.name.clone(),
                main: manifest.main.clone(),
            })?;
        if !manifest.dependencies.is_empty() {
            fs.install_dependencies(manifest, path).await?;
        }

        let ctx = PluginContext {
            dispatch: scoped.clone(),
            manifest: manifest.clone(),
            data_path: fs.data_path(manifest),
        };
        let instantiate = |reason: String| PluginError::Instantiate {
            name: manifest.name.clone(),
            reason,
        };
        let mark = scoped.id_mark();
        let result = match std::panic::catch_unwind(AssertUnwindSafe(|| factory(ctx))) {
            Ok(Ok(instance)) => Ok(Some(instance)),
            Ok(Err(e)) => Err(instantiate(format!("{:#}", e))),
            Err(_) => Err(instantiate("panicked".into())),
        };
        if result.is_err() {
            // Nothing a failed factory registered may survive into the new generation.
            scoped.discard_since(mark);
        }
        result
    }

    fn skip(&self, report: &mut LoadReport, e: PluginError) {
        error!("Skipping plugin: {}", e);
        self.console().error(&e.to_string());
        report.failed.push(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{logging::TracingConsole, types::Direction};
    use std::time::Duration;

    struct Fixed(Vec<(&'static str, &'static str)>);

    #[async_trait]
    impl PluginFilesystem for Fixed {
        async fn manifests(&self) -> Vec<Result<ManifestSource, PluginError>> {
            self.0
                .iter()
                .map(|(dir, contents)| {
                    Ok(ManifestSource {
                        path: PathBuf::from(dir),
                        contents: contents.to_string(),
                    })
                })
                .collect()
        }

        fn data_path(&self, manifest: &PluginManifest) -> PathBuf {
            PathBuf::from("/data").join(&manifest.name)
        }
    }

    struct Noop;
    impl GamePlugin for Noop {}

    fn entries() -> PluginRegistry {
        let mut entries = PluginRegistry::new();
        entries.register("index.js", |ctx: PluginContext| {
            ctx.dispatch
                .on_message(Direction::Remote, "ping", |_| async { Ok(()) });
            ctx.dispatch
                .on_command(&ctx.manifest.name, "plugin command", |_| async { Ok(()) })?;
            Ok(Arc::new(Noop) as Arc<dyn GamePlugin>)
        });
        entries
    }

    #[test]
    fn manifest_validation() {
        let path = Path::new("p");
        assert!(PluginManifest::parse(path, r#"{"name":"a","main":"x","type":"game"}"#).is_ok());
        assert!(PluginManifest::parse(path, r#"{"name":"a","type":"game"}"#).is_err());
        assert!(PluginManifest::parse(path, r#"{"name":"","main":"x","type":"ui"}"#).is_err());
        assert!(PluginManifest::parse(path, r#"{"name":"a","main":"x","type":"mod"}"#).is_err());
    }

    #[tokio::test]
    async fn load_orders_and_skips() {
        let dispatch = Dispatch::new(Arc::new(TracingConsole));
        let fs = Fixed(vec![
            ("b", r#"{"name":"b","main":"index.js","type":"game"}"#),
            ("a", r#"{"name":"a","main":"index.js","type":"game"}"#),
            ("ui", r#"{"name":"z-ui","main":"index.html","type":"ui"}"#),
            ("dup", r#"{"name":"a","main":"index.js","type":"game"}"#),
            ("ghost", r#"{"name":"ghost","main":"missing.js","type":"game"}"#),
        ]);

        let report = dispatch.load(&fs, &entries()).await;
        assert_eq!(report.loaded, vec!["z-ui", "a", "b"]);
        assert_eq!(report.failed.len(), 2);

        let names: Vec<_> = dispatch.plugins().into_iter().map(|p| p.manifest.name).collect();
        assert_eq!(names, vec!["z-ui", "a", "b"]);
        assert!(dispatch.plugin("z-ui").unwrap().instance.is_none());
        assert_eq!(dispatch.commands().len(), 2);
    }

    #[tokio::test]
    async fn reload_replaces_previous_generation() {
        let dispatch = Dispatch::new(Arc::new(TracingConsole));
        let builtins = dispatch.hook_count();
        let fs = Fixed(vec![("a", r#"{"name":"a","main":"index.js","type":"game"}"#)]);

        dispatch.load(&fs, &entries()).await;
        dispatch.load(&fs, &entries()).await;
        assert_eq!(dispatch.hook_count(), builtins + 1);
        assert_eq!(dispatch.plugins().len(), 1);

        dispatch.load(&Fixed(vec![]), &entries()).await;
        assert_eq!(dispatch.hook_count(), builtins);
        assert!(dispatch.commands().is_empty());
    }

    #[tokio::test]
    async fn failed_factory_leaves_nothing_behind() {
        let dispatch = Dispatch::new(Arc::new(TracingConsole));
        let builtins = dispatch.hook_count();
        let mut entries = entries();
        entries
            .register("half.js", |ctx: PluginContext| {
                ctx.dispatch
                    .on_message(Direction::Local, "*", |_| async { Ok(()) });
                ctx.dispatch
                    .on_command("half", "never finished", |_| async { Ok(()) })?;
                ctx.dispatch
                    .set_interval(None, Duration::from_secs(60), |_| async { Ok(()) });
                anyhow::bail!("config missing")
            })
            .register("boom.js", |ctx: PluginContext| {
                ctx.dispatch
                    .on_message(Direction::Any, "*", |_| async { Ok(()) });
                panic!("factory bug")
            });
        let fs = Fixed(vec![
            ("a", r#"{"name":"a","main":"index.js","type":"game"}"#),
            ("half", r#"{"name":"half","main":"half.js","type":"game"}"#),
            ("boom", r#"{"name":"boom","main":"boom.js","type":"game"}"#),
        ]);

        let report = dispatch.load(&fs, &entries).await;
        assert_eq!(report.loaded, vec!["a"]);
        assert_eq!(report.failed.len(), 2);
        assert!(
            report
                .failed
                .iter()
                .all(|e| matches!(e, PluginError::Instantiate { .. }))
        );
        assert_eq!(dispatch.hook_count(), builtins + 1);
        assert_eq!(dispatch.commands(), vec![("a".to_string(), "plugin command".to_string())]);
        assert_eq!(dispatch.interval_count(), 0);
    }
}
