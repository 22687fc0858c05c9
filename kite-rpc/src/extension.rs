//! Built-in extension catalog
//!
//! The process-wide [`ExtensionLoader`] reads the descriptors shipped in this
//! crate first, then every directory listed in `extension.directories`, and
//! knows how to build each built-in implementation type.

use std::sync::Arc;

use kite_core::extension::ResourceRoot;
use kite_core::ExtensionLoader;
use once_cell::sync::Lazy;

use crate::loadbalance::{
    ConsistentHashLoadBalance, LoadBalance, RandomLoadBalance, RoundRobinLoadBalance,
};
use crate::registry::{
    CoordinatedServiceDiscovery, CoordinatedServiceRegistry, ServiceDiscovery, ServiceRegistry,
};
use crate::transport::{RpcRequestTransport, TcpClientTransport};

macro_rules! descriptor {
    ($file:literal) => {
        (
            concat!("extensions/", $file),
            include_str!(concat!("../extensions/", $file)),
        )
    };
}

/// Descriptors compiled into this crate
fn builtin_descriptors() -> ResourceRoot {
    ResourceRoot::embedded([
        descriptor!("kite.rpc.ServiceRegistry"),
        descriptor!("kite.rpc.ServiceDiscovery"),
        descriptor!("kite.rpc.LoadBalance"),
        descriptor!("kite.rpc.RpcRequestTransport"),
    ])
}

/// Bind every built-in implementation type to its factory
pub fn register_builtins(loader: &ExtensionLoader) {
    loader.register_implementation::<dyn ServiceRegistry, _>(
        CoordinatedServiceRegistry::TYPE_NAME,
        || Ok(Arc::new(CoordinatedServiceRegistry::new()) as Arc<dyn ServiceRegistry>),
    );
    loader.register_implementation::<dyn ServiceDiscovery, _>(
        CoordinatedServiceDiscovery::TYPE_NAME,
        || Ok(Arc::new(CoordinatedServiceDiscovery::new()) as Arc<dyn ServiceDiscovery>),
    );
    loader.register_implementation::<dyn LoadBalance, _>(ConsistentHashLoadBalance::TYPE_NAME, || {
        Ok(Arc::new(ConsistentHashLoadBalance::default()) as Arc<dyn LoadBalance>)
    });
    loader.register_implementation::<dyn LoadBalance, _>(RandomLoadBalance::TYPE_NAME, || {
        Ok(Arc::new(RandomLoadBalance) as Arc<dyn LoadBalance>)
    });
    loader.register_implementation::<dyn LoadBalance, _>(RoundRobinLoadBalance::TYPE_NAME, || {
        Ok(Arc::new(RoundRobinLoadBalance::default()) as Arc<dyn LoadBalance>)
    });
    loader.register_implementation::<dyn RpcRequestTransport, _>(
        TcpClientTransport::TYPE_NAME,
        || Ok(Arc::new(TcpClientTransport::new()) as Arc<dyn RpcRequestTransport>),
    );
}

/// Loader over the built-in descriptors plus `extra` roots, with the
/// built-in factories registered
#[must_use]
pub fn builtin_loader(extra: Vec<ResourceRoot>) -> ExtensionLoader {
    let mut roots = vec![builtin_descriptors()];
    roots.extend(extra);
    let loader = ExtensionLoader::new(roots);
    register_builtins(&loader);
    loader
}

static GLOBAL: Lazy<ExtensionLoader> = Lazy::new(|| {
    let directories = &kite_core::config::global().extension.directories;
    builtin_loader(directories.iter().cloned().map(ResourceRoot::Directory).collect())
});

/// Process-wide extension loader
pub fn global() -> &'static ExtensionLoader {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;
    use kite_core::{Error, ExtensionPoint};
    use std::io::Write;

    #[test]
    fn test_builtin_names_resolve() {
        let loader = builtin_loader(Vec::new());

        assert!(loader.get::<dyn LoadBalance>("consistent_hash").is_ok());
        assert!(loader.get::<dyn LoadBalance>("random").is_ok());
        assert!(loader.get::<dyn LoadBalance>("round_robin").is_ok());
        assert!(loader.get::<dyn ServiceRegistry>("coordinated").is_ok());
        assert!(loader.get::<dyn ServiceDiscovery>("coordinated").is_ok());
    }

    #[test]
    fn test_builtin_directories_match_extension_points() {
        let loader = builtin_loader(Vec::new());
        let directory = loader.directory::<dyn LoadBalance>().unwrap();

        assert_eq!(directory.extension_point(), <dyn LoadBalance as ExtensionPoint>::NAME);
        assert_eq!(
            directory.get("consistent_hash"),
            Some(ConsistentHashLoadBalance::TYPE_NAME)
        );
        assert_eq!(directory.len(), 3);
    }

    #[test]
    fn test_every_extension_point_has_a_descriptor() {
        let loader = builtin_loader(Vec::new());
        assert!(loader.directory::<dyn ServiceRegistry>().is_ok());
        assert!(loader.directory::<dyn ServiceDiscovery>().is_ok());
        assert!(loader.directory::<dyn LoadBalance>().is_ok());
        assert!(loader.directory::<dyn RpcRequestTransport>().is_ok());
    }

    #[test]
    fn test_instances_are_shared() {
        let loader = builtin_loader(Vec::new());
        let first = loader.get::<dyn LoadBalance>("consistent_hash").unwrap();
        let second = loader.get::<dyn LoadBalance>("consistent_hash").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_configured_directory_adds_aliases() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("extensions")).unwrap();
        let mut file =
            std::fs::File::create(dir.path().join("extensions/kite.rpc.LoadBalance")).unwrap();
        writeln!(file, "sticky={}", ConsistentHashLoadBalance::TYPE_NAME).unwrap();

        let loader = builtin_loader(vec![ResourceRoot::directory(dir.path())]);
        let alias = loader.get::<dyn LoadBalance>("sticky").unwrap();
        let builtin = loader.get::<dyn LoadBalance>("consistent_hash").unwrap();

        assert!(Arc::ptr_eq(&alias, &builtin));
    }

    #[test]
    fn test_unknown_name() {
        let err = builtin_loader(Vec::new()).get::<dyn LoadBalance>("weighted").err().unwrap();
        assert!(matches!(err, Error::ExtensionNotFound { name, .. } if name == "weighted"));
    }
}
