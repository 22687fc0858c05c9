//! Integration tests for kite-core configuration and extension loading
//!
//! Run with: cargo test -p kite-core --test integration_tests

use std::io::Write;
use std::sync::Arc;

use kite_core::config::CoordinationBackend;
use kite_core::extension::ResourceRoot;
use kite_core::{Error, ExtensionLoader, ExtensionPoint, KiteConfig};

trait Compressor: Send + Sync {
    fn compress(&self, input: &str) -> String;
}

impl ExtensionPoint for dyn Compressor {
    const NAME: &'static str = "test.Compressor";
}

struct Identity;

impl Compressor for Identity {
    fn compress(&self, input: &str) -> String {
        input.to_string()
    }
}

struct Squeeze;

impl Compressor for Squeeze {
    fn compress(&self, input: &str) -> String {
        input.split_whitespace().collect()
    }
}

fn write_file(path: &std::path::Path, contents: &str) {
    let mut file = std::fs::File::create(path).expect("Failed to create file");
    file.write_all(contents.as_bytes()).expect("Failed to write file");
}

#[test]
fn test_config_file_drives_extension_directories() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let plugins = dir.path().join("plugins");
    std::fs::create_dir_all(plugins.join("extensions")).unwrap();
    write_file(
        &plugins.join("extensions/test.Compressor"),
        "# site overrides\nfast = squeeze\n",
    );

    let config_path = dir.path().join("kite.toml");
    write_file(
        &config_path,
        &format!(
            "[coordination]\nbackend = \"memory\"\n\n[extension]\ndirectories = [\"{}\"]\n",
            plugins.display()
        ),
    );

    let config = KiteConfig::from_file(config_path.to_str().unwrap()).unwrap();
    assert_eq!(config.coordination.backend, CoordinationBackend::Memory);
    assert!(config.validate().is_ok());

    let mut roots = vec![ResourceRoot::embedded([(
        "extensions/test.Compressor",
        "identity=identity\nfast=identity\n",
    )])];
    roots.extend(config.extension.directories.iter().map(ResourceRoot::directory));
    let loader = ExtensionLoader::new(roots);
    loader.register_implementation::<dyn Compressor, _>("identity", || {
        Ok(Arc::new(Identity) as Arc<dyn Compressor>)
    });
    loader.register_implementation::<dyn Compressor, _>("squeeze", || {
        Ok(Arc::new(Squeeze) as Arc<dyn Compressor>)
    });

    // Directory roots listed later override the embedded entry
    let fast = loader.get::<dyn Compressor>("fast").unwrap();
    assert_eq!(fast.compress("a b c"), "abc");

    let identity = loader.get::<dyn Compressor>("identity").unwrap();
    assert_eq!(identity.compress("a b c"), "a b c");

    let err = loader.get::<dyn Compressor>("zstd").err().unwrap();
    assert!(matches!(err, Error::ExtensionNotFound { .. }));
}

#[test]
fn test_invalid_config_is_reported() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config_path = dir.path().join("kite.toml");
    write_file(
        &config_path,
        "[extension]\nload_balance = \"\"\n\n[logging]\nformat = \"xml\"\n",
    );

    let config = KiteConfig::from_file(config_path.to_str().unwrap()).unwrap();
    let errors = config.validate().unwrap_err();

    assert_eq!(errors.len(), 2);
    assert!(errors.iter().any(|e| e.contains("extension.load_balance")));
    assert!(errors.iter().any(|e| e.contains("logging.format")));
}
