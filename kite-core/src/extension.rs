//! Named-implementation loader for pluggable strategies
//!
//! An extension point is a trait object type marked with [`ExtensionPoint`].
//! Its implementations are listed in descriptor files named after the point
//! under `extensions/` in every resource root, one `name=implementation-type`
//! entry per line. Implementation types are bound to zero-argument factories
//! with [`ExtensionLoader::register_implementation`]; [`ExtensionLoader::get`]
//! resolves a name to a shared instance, creating it at most once.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Directory, relative to a resource root, holding descriptor files
pub const SERVICE_DIRECTORY: &str = "extensions";

/// Marks a trait object type as loadable by name.
///
/// Implemented on `dyn Trait`; `NAME` is also the descriptor file name.
pub trait ExtensionPoint: Send + Sync + 'static {
    const NAME: &'static str;
}

/// A place descriptor files are read from
#[derive(Debug, Clone)]
pub enum ResourceRoot {
    /// Descriptors compiled into the binary, keyed by relative path
    Embedded(HashMap<String, &'static str>),
    /// A filesystem directory containing `extensions/`
    Directory(PathBuf),
}

impl ResourceRoot {
    pub fn embedded<I>(files: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, &'static str)>,
    {
        Self::Embedded(
            files
                .into_iter()
                .map(|(path, contents)| (path.to_string(), contents))
                .collect(),
        )
    }

    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self::Directory(path.into())
    }

    /// Contents of `extensions/<extension_point>` in this root, if present
    fn read_descriptor(&self, extension_point: &str) -> Option<String> {
        let relative = format!("{SERVICE_DIRECTORY}/{extension_point}");
        match self {
            Self::Embedded(files) => files.get(&relative).map(|s| (*s).to_string()),
            Self::Directory(base) => {
                let path = base.join(&relative);
                match std::fs::read_to_string(&path) {
                    Ok(contents) => Some(contents),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to read extension descriptor");
                        None
                    }
                }
            }
        }
    }
}

/// Name to implementation-type mapping for one extension point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionDirectory {
    extension_point: &'static str,
    entries: BTreeMap<String, String>,
}

impl ExtensionDirectory {
    #[must_use]
    pub const fn extension_point(&self) -> &'static str {
        self.extension_point
    }

    /// Implementation type bound to `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse descriptor text into `entries`; later lines override earlier ones.
fn parse_descriptor(
    extension_point: &str,
    contents: &str,
    entries: &mut BTreeMap<String, String>,
) {
    for (index, raw) in contents.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once('=') {
            Some((name, type_name)) if !name.trim().is_empty() && !type_name.trim().is_empty() => {
                entries.insert(name.trim().to_string(), type_name.trim().to_string());
            }
            _ => {
                warn!(
                    extension_point,
                    line = index + 1,
                    content = raw,
                    "Skipping malformed extension descriptor line"
                );
            }
        }
    }
}

type AnyInstance = Arc<dyn Any + Send + Sync>;
type AnyFactory = Arc<dyn Fn() -> Result<AnyInstance> + Send + Sync>;

struct Implementation {
    extension_point: &'static str,
    factory: AnyFactory,
}

/// Resolves extension names to shared implementation instances
pub struct ExtensionLoader {
    roots: Vec<ResourceRoot>,
    implementations: RwLock<HashMap<String, Implementation>>,
    directories: DashMap<&'static str, Arc<OnceCell<Arc<ExtensionDirectory>>>>,
    /// One instance per implementation type, holding an `Arc<E>`
    instances: DashMap<String, Arc<OnceCell<AnyInstance>>>,
}

impl ExtensionLoader {
    /// Loader scanning `roots` in order; later roots override earlier entries.
    #[must_use]
    pub fn new(roots: Vec<ResourceRoot>) -> Self {
        Self {
            roots,
            implementations: RwLock::new(HashMap::new()),
            directories: DashMap::new(),
            instances: DashMap::new(),
        }
    }

    /// Bind `type_name` to a factory producing implementations of `E`.
    ///
    /// Re-registering a type replaces its factory; an instance already
    /// created for it stays cached.
    pub fn register_implementation<E, F>(&self, type_name: &str, factory: F)
    where
        E: ExtensionPoint + ?Sized,
        F: Fn() -> Result<Arc<E>> + Send + Sync + 'static,
    {
        let factory: AnyFactory = Arc::new(move || {
            let instance = factory()?;
            Ok(Arc::new(instance) as AnyInstance)
        });
        let previous = self.implementations.write().insert(
            type_name.to_string(),
            Implementation {
                extension_point: E::NAME,
                factory,
            },
        );
        if previous.is_some() {
            debug!(type_name, extension_point = E::NAME, "Replaced extension implementation");
        }
    }

    /// Descriptor directory for `E`, loaded once from every resource root
    pub fn directory<E>(&self) -> Result<Arc<ExtensionDirectory>>
    where
        E: ExtensionPoint + ?Sized,
    {
        let cell = self.directories.entry(E::NAME).or_default().clone();
        cell.get_or_try_init(|| self.load_directory(E::NAME)).cloned()
    }

    /// Shared instance of the implementation registered under `name`
    pub fn get<E>(&self, name: &str) -> Result<Arc<E>>
    where
        E: ExtensionPoint + ?Sized,
    {
        if name.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "Extension name for {} must not be blank",
                E::NAME
            )));
        }

        let directory = self.directory::<E>()?;
        let type_name = directory
            .get(name)
            .ok_or_else(|| Error::ExtensionNotFound {
                extension_point: E::NAME.to_string(),
                name: name.to_string(),
            })?
            .to_string();

        let cell = self.instances.entry(type_name.clone()).or_default().clone();
        let instance = cell.get_or_try_init(|| self.instantiate::<E>(&type_name))?;

        instance.downcast_ref::<Arc<E>>().cloned().ok_or_else(|| {
            Error::Configuration(format!(
                "Implementation type '{type_name}' is not an implementation of {}",
                E::NAME
            ))
        })
    }

    fn instantiate<E>(&self, type_name: &str) -> Result<AnyInstance>
    where
        E: ExtensionPoint + ?Sized,
    {
        let factory = {
            let implementations = self.implementations.read();
            let implementation = implementations.get(type_name).ok_or_else(|| {
                Error::Configuration(format!(
                    "No factory registered for implementation type '{type_name}'"
                ))
            })?;
            if implementation.extension_point != E::NAME {
                return Err(Error::Configuration(format!(
                    "Implementation type '{type_name}' belongs to {}, not {}",
                    implementation.extension_point,
                    E::NAME
                )));
            }
            implementation.factory.clone()
        };

        debug!(type_name, extension_point = E::NAME, "Creating extension instance");
        factory()
    }

    fn load_directory(&self, extension_point: &'static str) -> Result<Arc<ExtensionDirectory>> {
        let mut entries = BTreeMap::new();
        for root in &self.roots {
            if let Some(contents) = root.read_descriptor(extension_point) {
                parse_descriptor(extension_point, &contents, &mut entries);
            }
        }

        if entries.is_empty() {
            return Err(Error::Configuration(format!(
                "No extensions declared for {extension_point} under {SERVICE_DIRECTORY}/"
            )));
        }

        debug!(extension_point, count = entries.len(), "Loaded extension directory");
        Ok(Arc::new(ExtensionDirectory {
            extension_point,
            entries,
        }))
    }
}

impl std::fmt::Debug for ExtensionLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionLoader")
            .field("roots", &self.roots)
            .field("implementations", &self.implementations.read().len())
            .field("directories", &self.directories.len())
            .field("instances", &self.instances.len())
            .finish()
    }
}
